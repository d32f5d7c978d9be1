// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Contract between the video driver and the GPU buffer manager.
//!
//! The buffer manager owns device memory. The driver only sees reference counted buffer objects
//! that can be mapped for CPU access, patched with relocations and submitted to the decode
//! engine. [`Bo`] holds exactly one reference and drops it when it goes out of scope.

pub mod fake;

use std::fmt;
use std::io;
use std::os::fd::BorrowedFd;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use remain::sorted;
use thiserror::Error;

#[sorted]
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to allocate {size} byte buffer {name}")]
    AllocFailed { name: String, size: u64 },
    #[error("failed to export buffer {handle}: {source}")]
    ExportFailed { handle: u32, source: io::Error },
    #[error("failed to create hardware context")]
    HwContextFailed,
    #[error("failed to import buffer {name}")]
    ImportFailed { name: String },
    #[error("failed to map buffer {0}")]
    MapFailed(u32),
    #[error("buffer {0} is not mapped")]
    NotMapped(u32),
    #[error("access of {len} bytes at {offset:#x} is outside buffer {handle} of {size} bytes")]
    OutOfBounds {
        handle: u32,
        offset: u64,
        len: u64,
        size: u64,
    },
    #[error("failed to submit buffer {0}")]
    SubmitFailed(u32),
    #[error("unknown hardware context {0}")]
    UnknownHwContext(u32),
}

pub type Result<T> = std::result::Result<T, Error>;

/// CPU caching mode of a buffer object.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CachePolicy {
    WriteBack,
    WriteCombine,
    Uncached,
    /// The CPU never maps the buffer.
    NoAccess,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Tiling {
    #[default]
    Linear,
    Tiled,
}

/// The engine a hardware context is created for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ContextKind {
    Ved,
}

/// Surface tiling layout programmed into a hardware context.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TilingParams {
    pub tile_stride: u32,
    pub tiling_scheme: u32,
}

/// A hardware context owned by the buffer manager.
#[derive(Debug, PartialEq, Eq)]
pub struct HwContext {
    pub id: u32,
    pub kind: ContextKind,
}

/// The ways a buffer object can be shared outside the driver.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExportKind {
    KernelName,
    Prime,
}

/// An exported buffer object.
#[derive(Debug)]
pub enum ExternalHandle {
    Name(u32),
    Prime(OwnedFd),
}

impl ExternalHandle {
    pub fn kind(&self) -> ExportKind {
        match self {
            ExternalHandle::Name(_) => ExportKind::KernelName,
            ExternalHandle::Prime(_) => ExportKind::Prime,
        }
    }
}

/// A device memory allocation.
///
/// Implementations track their own reference count. The driver never calls `reference` or
/// `unreference` directly; it goes through [`Bo`].
pub trait BufferObject: Send + Sync {
    /// Buffer manager handle, unique while the object is alive.
    fn handle(&self) -> u32;
    fn size(&self) -> u64;
    /// Current device address, used as the provisional value of a relocation.
    fn device_address(&self) -> u64;
    fn name(&self) -> &str;

    fn map(&self, writable: bool) -> Result<()>;
    fn unmap(&self) -> Result<()>;
    fn is_mapped(&self) -> bool;
    /// Copies out of the mapped buffer.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
    /// Copies into the mapped buffer.
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Blocks until the engine is done with the buffer.
    fn wait(&self) -> Result<()>;
    fn busy(&self) -> bool;

    /// Records that the word at `offset` must hold `target`'s address plus `delta` at submission.
    ///
    /// The relocation takes a reference on `target`, held until this buffer loses its last
    /// reference, so a target dropped by its owner stays alive until the command stream is gone.
    fn emit_reloc(
        &self,
        offset: u64,
        target: &dyn BufferObject,
        delta: u64,
        flags: u32,
    ) -> Result<()>;
    fn export(&self, kind: ExportKind) -> Result<ExternalHandle>;
    /// Hands `[offset, offset + len)` of this buffer to the engine as a command stream.
    fn submit(&self, offset: u64, len: u64, fence: i32) -> Result<()>;

    fn reference(&self) -> Result<()>;
    fn unreference(&self);
}

/// One owned reference to a buffer object.
pub struct Bo {
    inner: Arc<dyn BufferObject>,
}

impl Bo {
    /// Wraps a buffer object whose reference has already been taken on behalf of the caller.
    pub fn from_referenced(inner: Arc<dyn BufferObject>) -> Bo {
        Bo { inner }
    }

    /// Takes an extra reference on the same buffer object.
    pub fn try_clone(&self) -> Result<Bo> {
        self.inner.reference()?;
        Ok(Bo {
            inner: self.inner.clone(),
        })
    }

    pub fn object(&self) -> &dyn BufferObject {
        self.inner.as_ref()
    }

    pub fn handle(&self) -> u32 {
        self.inner.handle()
    }

    pub fn size(&self) -> u64 {
        self.inner.size()
    }

    pub fn device_address(&self) -> u64 {
        self.inner.device_address()
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn map(&self, writable: bool) -> Result<()> {
        self.inner.map(writable)
    }

    pub fn unmap(&self) -> Result<()> {
        self.inner.unmap()
    }

    pub fn is_mapped(&self) -> bool {
        self.inner.is_mapped()
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.inner.read_at(offset, buf)
    }

    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.inner.write_at(offset, data)
    }

    pub fn wait(&self) -> Result<()> {
        self.inner.wait()
    }

    pub fn busy(&self) -> bool {
        self.inner.busy()
    }

    pub fn emit_reloc(&self, offset: u64, target: &Bo, delta: u64, flags: u32) -> Result<()> {
        self.inner.emit_reloc(offset, target.object(), delta, flags)
    }

    pub fn export(&self, kind: ExportKind) -> Result<ExternalHandle> {
        self.inner.export(kind)
    }

    pub fn submit(&self, offset: u64, len: u64, fence: i32) -> Result<()> {
        self.inner.submit(offset, len, fence)
    }
}

impl Drop for Bo {
    fn drop(&mut self) {
        self.inner.unreference();
    }
}

impl fmt::Debug for Bo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Bo")
            .field("handle", &self.handle())
            .field("name", &self.name())
            .field("size", &self.size())
            .finish()
    }
}

/// Allocation parameters passed to [`BufferManager::alloc`].
#[derive(Copy, Clone, Debug)]
pub struct AllocParams<'a> {
    pub name: &'a str,
    pub size: u64,
    pub tiling: Tiling,
    pub cache: CachePolicy,
    /// The buffer manager may keep the object in its own reuse cache after the last reference.
    pub reusable: bool,
}

impl<'a> AllocParams<'a> {
    /// Linear, write-combined and not reusable.
    pub fn new(name: &'a str, size: u64) -> AllocParams<'a> {
        AllocParams {
            name,
            size,
            tiling: Tiling::Linear,
            cache: CachePolicy::WriteCombine,
            reusable: false,
        }
    }

    pub fn cache(mut self, cache: CachePolicy) -> Self {
        self.cache = cache;
        self
    }

    pub fn tiling(mut self, tiling: Tiling) -> Self {
        self.tiling = tiling;
        self
    }

    pub fn reusable(mut self, reusable: bool) -> Self {
        self.reusable = reusable;
        self
    }
}

/// The buffer manager of one open device.
pub trait BufferManager: Send + Sync {
    /// Allocates a buffer object, optionally bound to a hardware context.
    fn alloc(&self, hw_context: Option<&HwContext>, params: AllocParams) -> Result<Bo>;

    /// Wraps memory shared by another process through a PRIME fd.
    fn import(
        &self,
        hw_context: Option<&HwContext>,
        name: &str,
        fd: BorrowedFd,
        size: u64,
    ) -> Result<Bo>;

    fn hw_context_create(
        &self,
        kind: ContextKind,
        tiling: Option<TilingParams>,
    ) -> Result<HwContext>;

    fn hw_context_destroy(&self, hw_context: HwContext) -> Result<()>;
}
