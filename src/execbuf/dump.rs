// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Human readable dumps of firmware decode messages.

use std::fmt::Write;

use zerocopy::FromBytes;
use zerocopy::IntoBytes;

use crate::execbuf::ved::DecodeMessage;

const LABELS: [&str; 8] = [
    "BufferSize|ID|MSG_SIZE",
    "MMUPTD",
    "LLDMA_address",
    "Context",
    "Fence_Value",
    "Operating_Mode",
    "LastMB|FirstMB",
    "Flags",
];

/// One line per message word: index, label and value.
pub fn describe_decode_message(msg: &DecodeMessage) -> String {
    let mut out = String::new();
    let words = <[u32; 8]>::read_from_bytes(msg.as_bytes()).unwrap_or_default();
    for (i, (label, word)) in LABELS.iter().zip(words.iter()).enumerate() {
        let _ = writeln!(out, "  msg[{}] {:<24} {:#010x}", i, label, word);
    }
    out
}

/// Dumps every whole message in `batch`; trailing bytes are reported as overflow.
pub fn describe_batch(batch: &[u8]) -> String {
    let mut out = String::new();
    let mut chunks = batch.chunks_exact(std::mem::size_of::<DecodeMessage>());
    for (i, chunk) in chunks.by_ref().enumerate() {
        let _ = writeln!(out, "decode message {}:", i);
        if let Ok(msg) = DecodeMessage::read_from_bytes(chunk) {
            out.push_str(&describe_decode_message(&msg));
        }
    }
    let rest = chunks.remainder();
    if !rest.is_empty() {
        let _ = writeln!(out, "  overflow: {} trailing bytes", rest.len());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_every_word() {
        let msg = DecodeMessage {
            header: 0x0006_1020,
            operating_mode: 7,
            flags: 0x4000,
            ..Default::default()
        };
        let text = describe_decode_message(&msg);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 8);
        assert!(lines[0].contains("BufferSize|ID|MSG_SIZE") && lines[0].contains("0x00061020"));
        assert!(lines[5].contains("Operating_Mode") && lines[5].contains("0x00000007"));
        assert!(lines[7].contains("Flags") && lines[7].contains("0x00004000"));
    }

    #[test]
    fn batch_reports_overflow() {
        let mut batch = DecodeMessage::default().as_bytes().to_vec();
        batch.extend_from_slice(DecodeMessage::default().as_bytes());
        batch.extend_from_slice(&[0; 4]);
        let text = describe_batch(&batch);
        assert!(text.contains("decode message 1:"));
        assert!(!text.contains("decode message 2:"));
        assert!(text.contains("overflow: 4 trailing bytes"));
    }
}
