// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Shared helpers for the video driver crates: the logging facade and small arithmetic utilities.

pub mod syslog;

pub use log::debug;
pub use log::error;
pub use log::info;
pub use log::trace;
pub use log::warn;

/// Rounds `value` up to the next multiple of `alignment`, which must be a power of two.
///
/// Returns `None` on overflow.
pub fn align_up(value: u64, alignment: u64) -> Option<u64> {
    debug_assert!(alignment.is_power_of_two());
    let mask = alignment - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds() {
        assert_eq!(align_up(0, 0x8000), Some(0));
        assert_eq!(align_up(1, 0x8000), Some(0x8000));
        assert_eq!(align_up(0x8000, 0x8000), Some(0x8000));
        assert_eq!(align_up(1080, 32), Some(1088));
        assert_eq!(align_up(u64::MAX, 32), None);
    }
}
