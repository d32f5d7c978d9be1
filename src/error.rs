// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;

use object_heap::Handle;
use remain::sorted;
use thiserror::Error;

use crate::driver::Entrypoint;
use crate::driver::Profile;

/// Status codes reported to API clients, numbered as in VA-API.
#[derive(Copy, Clone, Debug, PartialEq, Eq, enumn::N)]
#[repr(u32)]
pub enum Status {
    Success = 0x00,
    OperationFailed = 0x01,
    AllocationFailed = 0x02,
    InvalidConfig = 0x04,
    InvalidContext = 0x05,
    InvalidSurface = 0x06,
    InvalidBuffer = 0x07,
    InvalidImage = 0x08,
    InvalidSubpicture = 0x09,
    AttrNotSupported = 0x0a,
    MaxNumExceeded = 0x0b,
    UnsupportedProfile = 0x0c,
    UnsupportedEntrypoint = 0x0d,
    UnsupportedRtFormat = 0x0e,
    UnsupportedBuffertype = 0x0f,
    FlagNotSupported = 0x11,
    InvalidParameter = 0x12,
    ResolutionNotSupported = 0x13,
    Unimplemented = 0x14,
    InvalidImageFormat = 0x16,
    HwBusy = 0x22,
    UnsupportedMemoryType = 0x24,
    Unknown = 0xffff_ffff,
}

impl Status {
    pub fn of<T>(result: &Result<T>) -> Status {
        match result {
            Ok(_) => Status::Success,
            Err(e) => e.status(),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?} ({:#x})", self, *self as u32)
    }
}

#[sorted]
#[derive(Error, Debug)]
pub enum Error {
    #[error("command argument is {len} bytes, expected at least {expected}")]
    ArgTooSmall { len: usize, expected: usize },
    #[error("config attribute type {0} is not supported")]
    AttrNotSupported(u32),
    #[error("no {0} block is open")]
    BlockNotOpen(&'static str),
    #[error("a {0} block is already open")]
    BlockOpen(&'static str),
    #[error("buffer manager failure: {0}")]
    BufMgr(#[from] bufmgr::Error),
    #[error("dma of {size:#x} bytes at offset {offset:#x} exceeds the command limits")]
    DmaTooLarge { offset: u32, size: u32 },
    #[error("failed to acquire execution buffer: {0}")]
    ExecBufferAcquire(bufmgr::Error),
    #[error("execution buffer has been released")]
    ExecBufferReleased,
    #[error("unsupported flags {0:#x}")]
    FlagNotSupported(u32),
    #[error("object heap failure: {0}")]
    Heap(#[from] object_heap::Error),
    #[error("hardware busy: {0}")]
    HwBusy(#[source] Box<Error>),
    #[error("image {0} is still referenced by a subpicture")]
    ImageInUse(Handle),
    #[error("invalid buffer {0}")]
    InvalidBuffer(Handle),
    #[error("invalid config {0}")]
    InvalidConfig(Handle),
    #[error("invalid context {0}")]
    InvalidContext(Handle),
    #[error("invalid image {0}")]
    InvalidImage(Handle),
    #[error("unsupported image format {0:#010x}")]
    InvalidImageFormat(u32),
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    #[error("invalid subpicture {0}")]
    InvalidSubpicture(Handle),
    #[error("invalid surface {0}")]
    InvalidSurface(Handle),
    #[error("too many {0}")]
    MaxNumExceeded(&'static str),
    #[error("slice data buffer {0} holds no data")]
    MissingSliceData(Handle),
    #[error("context {0} is already inside a picture")]
    NestedPicture(Handle),
    #[error("context {0} has no picture in progress")]
    NoPicture(Handle),
    #[error("buffer {0} is not mapped")]
    NotMapped(Handle),
    #[error("writing {len} bytes at {offset:#x} overflows a {size} byte buffer")]
    OutOfSpace { offset: u64, len: u64, size: u64 },
    #[error("rendec destination {0:#x} does not fit the address field")]
    RendecAddress(u32),
    #[error("rendec block of {0} dwords does not fit the count field")]
    RendecBlockTooLarge(u64),
    #[error("resolution {width}x{height} is not supported")]
    ResolutionNotSupported { width: u32, height: u32 },
    #[error("skip block of {0} dwords does not fit the size field")]
    SkipBlockTooLarge(u64),
    #[error("split slice: {0}")]
    SplitSlice(&'static str),
    #[error("surface {0} has derived images")]
    SurfaceInUse(Handle),
    #[error("{0} is not implemented")]
    Unimplemented(&'static str),
    #[error("unknown command {0}")]
    UnknownCommand(u32),
    #[error("unsupported buffer type {0}")]
    UnsupportedBufferType(u32),
    #[error("unsupported entrypoint {0:?}")]
    UnsupportedEntrypoint(Entrypoint),
    #[error("unsupported memory type {0:#x}")]
    UnsupportedMemoryType(u32),
    #[error("unsupported profile {0:?}")]
    UnsupportedProfile(Profile),
    #[error("unsupported render target format {0:#x}")]
    UnsupportedRtFormat(u32),
}

impl Error {
    /// The status code reported for this error.
    pub fn status(&self) -> Status {
        use self::Error::*;

        match self {
            ArgTooSmall { .. }
            | DmaTooLarge { .. }
            | InvalidParameter(_)
            | RendecAddress(_)
            | SplitSlice(_)
            | UnknownCommand(_) => Status::InvalidParameter,
            AttrNotSupported(_) => Status::AttrNotSupported,
            BlockNotOpen(_)
            | BlockOpen(_)
            | ExecBufferReleased
            | ImageInUse(_)
            | NestedPicture(_)
            | NoPicture(_)
            | NotMapped(_)
            | OutOfSpace { .. }
            | RendecBlockTooLarge(_)
            | SkipBlockTooLarge(_)
            | SurfaceInUse(_) => Status::OperationFailed,
            BufMgr(e) => match e {
                bufmgr::Error::AllocFailed { .. }
                | bufmgr::Error::HwContextFailed
                | bufmgr::Error::ImportFailed { .. } => Status::AllocationFailed,
                _ => Status::OperationFailed,
            },
            ExecBufferAcquire(_) => Status::AllocationFailed,
            FlagNotSupported(_) => Status::FlagNotSupported,
            Heap(e) => match e {
                object_heap::Error::HeapFull(_) => Status::AllocationFailed,
                _ => Status::OperationFailed,
            },
            HwBusy(_) => Status::HwBusy,
            InvalidBuffer(_) => Status::InvalidBuffer,
            InvalidConfig(_) => Status::InvalidConfig,
            InvalidContext(_) => Status::InvalidContext,
            InvalidImage(_) => Status::InvalidImage,
            InvalidImageFormat(_) => Status::InvalidImageFormat,
            InvalidSubpicture(_) => Status::InvalidSubpicture,
            InvalidSurface(_) => Status::InvalidSurface,
            MaxNumExceeded(_) => Status::MaxNumExceeded,
            MissingSliceData(_) => Status::Unknown,
            ResolutionNotSupported { .. } => Status::ResolutionNotSupported,
            Unimplemented(_) => Status::Unimplemented,
            UnsupportedBufferType(_) => Status::UnsupportedBuffertype,
            UnsupportedEntrypoint(_) => Status::UnsupportedEntrypoint,
            UnsupportedMemoryType(_) => Status::UnsupportedMemoryType,
            UnsupportedProfile(_) => Status::UnsupportedProfile,
            UnsupportedRtFormat(_) => Status::UnsupportedRtFormat,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use object_heap::ObjectKind;

    use super::*;

    #[test]
    fn status_numbering() {
        assert_eq!(Status::n(0x22), Some(Status::HwBusy));
        assert_eq!(Status::n(0x0f), Some(Status::UnsupportedBuffertype));
        assert_eq!(Status::n(0x03), None);
        assert_eq!(Status::Unknown as u32, 0xffff_ffff);
    }

    #[test]
    fn error_status_mapping() {
        let handle = Handle::from_raw(0x0400_0001);
        assert_eq!(Error::InvalidBuffer(handle).status(), Status::InvalidBuffer);
        assert_eq!(
            Error::Heap(object_heap::Error::HeapFull(ObjectKind::Buffer)).status(),
            Status::AllocationFailed
        );
        assert_eq!(
            Error::BufMgr(bufmgr::Error::MapFailed(3)).status(),
            Status::OperationFailed
        );
        assert_eq!(
            Error::HwBusy(Box::new(Error::ExecBufferReleased)).status(),
            Status::HwBusy
        );
        assert_eq!(
            Error::UnknownCommand(9).status(),
            Status::InvalidParameter
        );
    }

    #[test]
    fn status_of_result() {
        assert_eq!(Status::of(&Ok::<(), Error>(())), Status::Success);
        assert_eq!(
            Status::of::<()>(&Err(Error::Unimplemented("deblock"))),
            Status::Unimplemented
        );
    }
}
