// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Lock types whose methods panic on poison instead of returning an error.
//!
//! Release builds use panic=abort, so a poisoned lock is only observable in test builds.

mod mutex;

pub use crate::mutex::Mutex;
