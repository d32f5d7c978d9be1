// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use base::syslog;
use base::syslog::LogConfig;

#[test]
fn second_logger_is_refused() {
    assert!(!syslog::is_initialized());
    syslog::init_with(LogConfig {
        filter: String::from("debug"),
        is_test: true,
        ..Default::default()
    })
    .unwrap();
    assert!(syslog::is_initialized());
    base::debug!("logger installed");

    assert!(matches!(
        syslog::init(),
        Err(syslog::Error::AlreadyInstalled(_))
    ));
    syslog::test_only_ensure_inited();
    assert!(syslog::is_initialized());
}
