// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Video decode backend for the IPVR/VED engine.
//!
//! A [`Driver`] owns every API object (configs, contexts, surfaces, buffers, images and
//! subpictures) in typed heaps and routes picture rendering to the decoder registered for the
//! context's profile. Decoders record work in execution buffers ([`execbuf`]) which are handed
//! to the kernel through a [`bufmgr::BufferManager`].

pub mod config;
pub mod driver;
pub mod error;
pub mod execbuf;
pub mod format;
pub mod vld;

pub use crate::config::DriverConfig;
pub use crate::driver::Driver;
pub use crate::error::Error;
pub use crate::error::Result;
pub use crate::error::Status;
