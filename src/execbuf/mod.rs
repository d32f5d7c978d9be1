// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Execution buffers: mapped command streams handed to the decode engine.
//!
//! [`ExecBuffer`] is a closed set of dialects. Every operation is implemented for every dialect,
//! so there is no way to reach an operation that a dialect forgot to provide.

pub mod dump;
pub mod generic;
pub mod ved;

use std::mem::size_of;

use bufmgr::Bo;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

pub use self::generic::GenericExecBuffer;
pub use self::ved::VedExecBuffer;
use crate::error::Error;
use crate::error::Result;

/// Raw command ids accepted by [`ExecBuffer::add_raw_command`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, enumn::N)]
#[repr(u32)]
pub enum CommandKind {
    FeDecode = 0,
    HostBeOpp = 1,
    HwDeblock = 2,
}

/// Argument of a front-end decode submission.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct FeDecodeArg {
    pub ec_enabled: u8,
    _pad: u8,
    pub flags: u16,
    pub operating_mode: u32,
}

impl FeDecodeArg {
    pub fn new(ec_enabled: bool, flags: u16, operating_mode: u32) -> FeDecodeArg {
        FeDecodeArg {
            ec_enabled: ec_enabled as u8,
            _pad: 0,
            flags,
            operating_mode,
        }
    }
}

/// A typed command for [`ExecBuffer::add_command`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    FeDecode(FeDecodeArg),
    HostBeOpp,
    HwDeblock,
}

impl Command {
    /// Decodes a command from its id and argument bytes.
    pub fn parse(kind: u32, arg: &[u8]) -> Result<Command> {
        let kind = CommandKind::n(kind).ok_or(Error::UnknownCommand(kind))?;
        match kind {
            CommandKind::FeDecode => {
                let (arg, _) =
                    FeDecodeArg::read_from_prefix(arg).map_err(|_| Error::ArgTooSmall {
                        len: arg.len(),
                        expected: size_of::<FeDecodeArg>(),
                    })?;
                Ok(Command::FeDecode(arg))
            }
            CommandKind::HostBeOpp => Ok(Command::HostBeOpp),
            CommandKind::HwDeblock => Ok(Command::HwDeblock),
        }
    }

    pub fn kind(&self) -> CommandKind {
        match self {
            Command::FeDecode(_) => CommandKind::FeDecode,
            Command::HostBeOpp => CommandKind::HostBeOpp,
            Command::HwDeblock => CommandKind::HwDeblock,
        }
    }
}

pub enum ExecBuffer {
    Generic(GenericExecBuffer),
    Ved(VedExecBuffer),
}

impl ExecBuffer {
    /// Patches the word at `offset` of the command stream to point at `target + delta`.
    pub fn reloc(&mut self, target: &Bo, offset: u64, delta: u64, flags: u32) -> Result<()> {
        match self {
            ExecBuffer::Generic(e) => e.reloc(target, offset, delta, flags),
            ExecBuffer::Ved(e) => e.reloc(target, offset, delta, flags),
        }
    }

    pub fn full(&self) -> bool {
        match self {
            ExecBuffer::Generic(e) => e.full(),
            ExecBuffer::Ved(e) => e.full(),
        }
    }

    pub fn ready(&self) -> bool {
        match self {
            ExecBuffer::Generic(e) => e.ready(),
            ExecBuffer::Ved(e) => e.ready(),
        }
    }

    pub fn run(&mut self) -> Result<()> {
        match self {
            ExecBuffer::Generic(e) => e.run(),
            ExecBuffer::Ved(e) => e.run(),
        }
    }

    pub fn put(&mut self) {
        match self {
            ExecBuffer::Generic(e) => e.put(),
            ExecBuffer::Ved(e) => e.put(),
        }
    }

    pub fn add_command(&mut self, command: Command) -> Result<()> {
        match self {
            ExecBuffer::Generic(e) => e.add_command(command),
            ExecBuffer::Ved(e) => e.add_command(command),
        }
    }

    /// Like `add_command`, for callers holding an untyped id and argument blob.
    pub fn add_raw_command(&mut self, kind: u32, arg: &[u8]) -> Result<()> {
        let command = Command::parse(kind, arg)?;
        self.add_command(command)
    }

    pub fn cur_offset(&self) -> u64 {
        match self {
            ExecBuffer::Generic(e) => e.cur_offset(),
            ExecBuffer::Ved(e) => e.cur_offset(),
        }
    }

    pub fn as_ved_mut(&mut self) -> Option<&mut VedExecBuffer> {
        match self {
            ExecBuffer::Ved(e) => Some(e),
            ExecBuffer::Generic(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fe_decode_arg_layout() {
        assert_eq!(size_of::<FeDecodeArg>(), 8);
        let arg = FeDecodeArg::new(true, 0x1234, 0xabcd);
        assert_eq!(
            arg.as_bytes(),
            &[1, 0, 0x34, 0x12, 0xcd, 0xab, 0, 0][..]
        );
    }

    #[test]
    fn parse_commands() {
        let arg = FeDecodeArg::new(false, 2, 7);
        assert_eq!(
            Command::parse(0, arg.as_bytes()).unwrap(),
            Command::FeDecode(arg)
        );
        assert_eq!(Command::parse(1, &[]).unwrap(), Command::HostBeOpp);
        assert!(matches!(
            Command::parse(0, &[0; 4]),
            Err(Error::ArgTooSmall {
                len: 4,
                expected: 8
            })
        ));
        assert!(matches!(
            Command::parse(42, &[]),
            Err(Error::UnknownCommand(42))
        ));
    }
}
