// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Buffer objects and their per-context recycling lists.
//!
//! Every buffer created for a context sits on the active list of its (context, type) pair.
//! Destroying it through the API only suspends it: the device memory is released, the handle
//! moves to the tail of the unused list and the slot is hidden from lookups. The next
//! `create_buffer` of the same type pops the unused head and hands the same handle back.
//!
//! The lists are threaded through the buffer heap with `prev`/`next` handles, so unlinking is
//! O(1) and a buffer is on at most one list.

use std::os::fd::AsRawFd;

use base::align_up;
use base::debug;
use base::error;
use base::trace;
use bufmgr::AllocParams;
use bufmgr::Bo;
use bufmgr::CachePolicy;
use bufmgr::ExportKind;
use bufmgr::ExternalHandle;
use object_heap::Handle;
use object_heap::ObjectHeap;

use crate::driver::Driver;
use crate::error::Error;
use crate::error::Result;

/// Device allocations are rounded up to this many bytes.
const BO_ALIGNMENT: u64 = 0x8000;

/// Buffer types accepted by `create_buffer`, numbered as in VA-API.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, enumn::N)]
#[repr(u32)]
pub enum BufferType {
    PictureParameter = 0,
    IQMatrix = 1,
    BitPlane = 2,
    SliceGroupMap = 3,
    SliceParameter = 4,
    SliceData = 5,
    MacroblockParameter = 6,
    ResidualData = 7,
    DeblockingParameter = 8,
    Image = 9,
    ProtectedSliceData = 10,
    QMatrix = 11,
    HuffmanTable = 12,
    Probability = 13,
    EncCoded = 21,
    EncSequenceParameter = 22,
    EncPictureParameter = 23,
    EncSliceParameter = 24,
    EncPackedHeaderParameter = 25,
    EncPackedHeaderData = 26,
    EncMiscParameter = 27,
    ProcPipelineParameter = 41,
    ProcFilterParameter = 42,
}

enum Storage {
    /// Device memory with the given CPU cache policy.
    Device(CachePolicy),
    /// Plain host memory.
    Host,
}

impl BufferType {
    pub fn from_raw(raw: u32) -> Result<BufferType> {
        BufferType::n(raw).ok_or(Error::UnsupportedBufferType(raw))
    }

    /// Name given to the device allocation backing a buffer of this type.
    pub fn name(self) -> &'static str {
        use BufferType::*;

        match self {
            PictureParameter => "VAPictureParameterBufferType",
            IQMatrix => "VAIQMatrixBufferType",
            BitPlane => "VABitPlaneBufferType",
            SliceGroupMap => "VASliceGroupMapBufferType",
            SliceParameter => "VASliceParameterBufferType",
            SliceData => "VASliceDataBufferType",
            MacroblockParameter => "VAMacroblockParameterBufferType",
            ResidualData => "VAResidualDataBufferType",
            DeblockingParameter => "VADeblockingParameterBufferType",
            Image => "VAImageBufferType",
            ProtectedSliceData => "VAProtectedSliceDataBufferType",
            QMatrix => "VAQMatrixBufferType",
            HuffmanTable => "VAHuffmanTableBufferType",
            Probability => "VAProbabilityBufferType",
            EncCoded => "VAEncCodedBufferType",
            EncSequenceParameter => "VAEncSequenceParameterBufferType",
            EncPictureParameter => "VAEncPictureParameterBufferType",
            EncSliceParameter => "VAEncSliceParameterBufferType",
            EncPackedHeaderParameter => "VAEncPackedHeaderParameterBufferType",
            EncPackedHeaderData => "VAEncPackedHeaderDataBufferType",
            EncMiscParameter => "VAEncMiscParameterBufferType",
            ProcPipelineParameter => "VAProcPipelineParameterBufferType",
            ProcFilterParameter => "VAProcFilterParameterBufferType",
        }
    }

    fn storage(self) -> Storage {
        use BufferType::*;

        match self {
            Image => Storage::Device(CachePolicy::NoAccess),
            BitPlane | SliceData | ResidualData | SliceGroupMap | EncCoded | ProtectedSliceData => {
                Storage::Device(CachePolicy::WriteCombine)
            }
            _ => Storage::Host,
        }
    }
}

/// External memory kinds for `acquire_buffer_handle`, numbered as in VA-API.
#[derive(Copy, Clone, Debug, PartialEq, Eq, enumn::N)]
#[repr(u32)]
pub enum MemoryType {
    Va = 0x0000_0001,
    KernelDrm = 0x1000_0000,
    DrmPrime = 0x2000_0000,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ListMembership {
    Unlinked,
    Active,
    Unused,
}

struct ExportState {
    handle: ExternalHandle,
    mem_type: MemoryType,
    refcount: u32,
}

pub struct BufferObject {
    buffer_type: BufferType,
    context: Option<Handle>,
    bo: Option<Bo>,
    data: Vec<u8>,
    size: u32,
    num_elements: u32,
    max_num_elements: u32,
    mapped: bool,
    list: ListMembership,
    prev: Option<Handle>,
    next: Option<Handle>,
    last_used: u32,
    export: Option<ExportState>,
}

impl BufferObject {
    fn new(buffer_type: BufferType, context: Option<Handle>) -> BufferObject {
        BufferObject {
            buffer_type,
            context,
            bo: None,
            data: Vec::new(),
            size: 0,
            num_elements: 0,
            max_num_elements: 0,
            mapped: false,
            list: ListMembership::Unlinked,
            prev: None,
            next: None,
            last_used: 0,
            export: None,
        }
    }

    /// Wraps an existing device allocation, as done for images derived from a surface.
    pub(crate) fn with_bo(buffer_type: BufferType, bo: Bo, size: u32) -> BufferObject {
        let mut obj = BufferObject::new(buffer_type, None);
        obj.bo = Some(bo);
        obj.size = size;
        obj.num_elements = 1;
        obj.max_num_elements = 1;
        obj
    }

    pub fn buffer_type(&self) -> BufferType {
        self.buffer_type
    }

    pub fn context(&self) -> Option<Handle> {
        self.context
    }

    pub fn bo(&self) -> Option<&Bo> {
        self.bo.as_ref()
    }

    /// Host contents of a parameter buffer. Kept while the buffer is suspended.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Size of one element in bytes.
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn num_elements(&self) -> u32 {
        self.num_elements
    }

    pub fn max_num_elements(&self) -> u32 {
        self.max_num_elements
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped
    }

    pub fn list(&self) -> ListMembership {
        self.list
    }

    pub fn prev(&self) -> Option<Handle> {
        self.prev
    }

    pub fn next(&self) -> Option<Handle> {
        self.next
    }

    /// Frame count of the owning context when the buffer was last suspended.
    pub fn last_used(&self) -> u32 {
        self.last_used
    }

    pub fn export_refcount(&self) -> u32 {
        self.export.as_ref().map_or(0, |e| e.refcount)
    }

    /// Copies bytes out of the buffer. Device memory must be mapped.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if let Some(bo) = &self.bo {
            bo.read_at(offset, buf)?;
            return Ok(());
        }
        let src = host_range(&self.data, offset, buf.len())?;
        buf.copy_from_slice(&self.data[src]);
        Ok(())
    }

    /// Copies bytes into the buffer. Device memory must be mapped.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if let Some(bo) = &self.bo {
            bo.write_at(offset, data)?;
            return Ok(());
        }
        let dst = host_range(&self.data, offset, data.len())?;
        self.data[dst].copy_from_slice(data);
        Ok(())
    }

    fn map(&mut self) -> Result<()> {
        if let Some(bo) = &self.bo {
            bo.map(true)?;
        }
        self.mapped = true;
        Ok(())
    }

    fn unmap(&mut self) -> Result<()> {
        if let Some(bo) = &self.bo {
            bo.unmap()?;
        }
        self.mapped = false;
        Ok(())
    }

    /// Drops device memory and export state. Host contents are kept.
    fn release_device_memory(&mut self) {
        if self.mapped {
            if let Err(e) = self.unmap() {
                error!("failed to unmap {} buffer: {}", self.buffer_type.name(), e);
            }
        }
        self.mapped = false;
        self.export = None;
        self.bo = None;
    }
}

fn host_range(data: &[u8], offset: u64, len: usize) -> Result<std::ops::Range<usize>> {
    let out_of_space = || Error::OutOfSpace {
        offset,
        len: len as u64,
        size: data.len() as u64,
    };
    let start = usize::try_from(offset).map_err(|_| out_of_space())?;
    match start.checked_add(len) {
        Some(end) if end <= data.len() => Ok(start..end),
        _ => Err(out_of_space()),
    }
}

/// Heads and tail of the lists of one (context, type) pair.
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct BufferLists {
    pub active_head: Option<Handle>,
    pub unused_head: Option<Handle>,
    pub unused_tail: Option<Handle>,
    pub unused_count: usize,
}

pub(crate) fn link_active(
    buffers: &mut ObjectHeap<BufferObject>,
    lists: &mut BufferLists,
    handle: Handle,
) {
    let old_head = lists.active_head;
    if let Some(old) = old_head.and_then(|h| buffers.get_retained_mut(h)) {
        old.prev = Some(handle);
    }
    if let Some(obj) = buffers.get_retained_mut(handle) {
        obj.prev = None;
        obj.next = old_head;
        obj.list = ListMembership::Active;
    }
    lists.active_head = Some(handle);
}

pub(crate) fn append_unused(
    buffers: &mut ObjectHeap<BufferObject>,
    lists: &mut BufferLists,
    handle: Handle,
) {
    let tail = lists.unused_tail;
    match tail.and_then(|h| buffers.get_retained_mut(h)) {
        Some(last) => last.next = Some(handle),
        None => lists.unused_head = Some(handle),
    }
    if let Some(obj) = buffers.get_retained_mut(handle) {
        obj.prev = tail;
        obj.next = None;
        obj.list = ListMembership::Unused;
    }
    lists.unused_tail = Some(handle);
    lists.unused_count += 1;
}

pub(crate) fn unlink(buffers: &mut ObjectHeap<BufferObject>, lists: &mut BufferLists, handle: Handle) {
    let (prev, next, list) = match buffers.get_retained(handle) {
        Some(obj) => (obj.prev, obj.next, obj.list),
        None => return,
    };
    if list == ListMembership::Unlinked {
        return;
    }
    match prev.and_then(|h| buffers.get_retained_mut(h)) {
        Some(p) => p.next = next,
        None if list == ListMembership::Active => lists.active_head = next,
        None => lists.unused_head = next,
    }
    match next.and_then(|h| buffers.get_retained_mut(h)) {
        Some(n) => n.prev = prev,
        None if list == ListMembership::Unused => lists.unused_tail = prev,
        None => {}
    }
    if list == ListMembership::Unused {
        lists.unused_count -= 1;
    }
    if let Some(obj) = buffers.get_retained_mut(handle) {
        obj.prev = None;
        obj.next = None;
        obj.list = ListMembership::Unlinked;
    }
}

/// Walks a list starting at `head`.
pub(crate) fn list_handles(buffers: &ObjectHeap<BufferObject>, head: Option<Handle>) -> Vec<Handle> {
    let mut handles = Vec::new();
    let mut cursor = head;
    while let Some(handle) = cursor {
        handles.push(handle);
        cursor = buffers.get_retained(handle).and_then(|obj| obj.next);
    }
    handles
}

/// Answer of `buffer_info`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BufferInfo {
    pub buffer_type: BufferType,
    pub size: u32,
    pub num_elements: u32,
}

/// Answer of `acquire_buffer_handle`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ExportedBuffer {
    pub buffer_type: BufferType,
    pub mem_type: MemoryType,
    pub mem_size: u64,
    /// Kernel buffer name or PRIME file descriptor, depending on `mem_type`.
    pub handle: u64,
}

impl Driver {
    /// Creates a buffer for `context`, recycling a suspended buffer of the same type when one
    /// has been idle long enough. `data`, if given, must hold `size * num_elements` bytes.
    pub fn create_buffer(
        &mut self,
        context: Handle,
        buffer_type: BufferType,
        size: u32,
        num_elements: u32,
        data: Option<&[u8]>,
    ) -> Result<Handle> {
        if !self.contexts.contains(context) {
            return Err(Error::InvalidContext(context));
        }
        self.create_buffer_object(Some(context), buffer_type, size, num_elements, data)
    }

    pub(crate) fn create_buffer_object(
        &mut self,
        context: Option<Handle>,
        buffer_type: BufferType,
        size: u32,
        num_elements: u32,
        data: Option<&[u8]>,
    ) -> Result<Handle> {
        if num_elements == 0 {
            return Err(Error::InvalidParameter("buffer with no elements"));
        }
        let handle = self.obtain_buffer(context, buffer_type)?;
        if let Err(e) = self.setup_buffer(handle, size, num_elements, data) {
            error!("failed to set up {} buffer: {}", buffer_type.name(), e);
            self.destroy_buffer_object(handle);
            return Err(e);
        }
        trace!(
            "buffer {} ({}): {} x {} bytes",
            handle,
            buffer_type.name(),
            num_elements,
            size
        );
        Ok(handle)
    }

    /// Pops a recyclable buffer off the unused list or allocates a new one, then puts it at the
    /// head of the active list.
    fn obtain_buffer(&mut self, context: Option<Handle>, buffer_type: BufferType) -> Result<Handle> {
        let ctx_handle = match context {
            Some(ctx_handle) => ctx_handle,
            None => return Ok(self.buffers.allocate(BufferObject::new(buffer_type, None))?),
        };
        let min_frames = self.settings.recycle_min_frames;
        let ctx = self
            .contexts
            .get_mut(ctx_handle)
            .ok_or(Error::InvalidContext(ctx_handle))?;
        let frame_count = ctx.frame_count;
        let lists = ctx.buffer_lists.entry(buffer_type).or_default();

        let recyclable = lists.unused_head.filter(|&head| {
            self.buffers
                .get_retained(head)
                .map_or(false, |obj| frame_count.wrapping_sub(obj.last_used) >= min_frames)
        });
        let handle = match recyclable {
            Some(head) => {
                unlink(&mut self.buffers, lists, head);
                self.buffers.unsuspend(head)?;
                debug!("recycled buffer {} for context {}", head, ctx_handle);
                head
            }
            None => self
                .buffers
                .allocate(BufferObject::new(buffer_type, Some(ctx_handle)))?,
        };
        link_active(&mut self.buffers, lists, handle);
        Ok(handle)
    }

    fn setup_buffer(
        &mut self,
        handle: Handle,
        size: u32,
        num_elements: u32,
        data: Option<&[u8]>,
    ) -> Result<()> {
        let obj = self
            .buffers
            .get_mut(handle)
            .ok_or(Error::InvalidBuffer(handle))?;
        let total = u64::from(size) * u64::from(num_elements);
        let buffer_type = obj.buffer_type;
        match buffer_type.storage() {
            Storage::Device(cache) => {
                let alloc_size = align_up(total, BO_ALIGNMENT)
                    .ok_or(Error::InvalidParameter("buffer size overflows"))?;
                let hw_context = obj
                    .context
                    .and_then(|c| self.contexts.get(c))
                    .map(|c| &c.hw_context);
                let params = AllocParams::new(buffer_type.name(), alloc_size).cache(cache);
                obj.bo = Some(self.bufmgr.alloc(hw_context, params)?);
                obj.data = Vec::new();
            }
            Storage::Host => {
                let len = usize::try_from(total)
                    .map_err(|_| Error::InvalidParameter("buffer size overflows"))?;
                obj.bo = None;
                obj.data = vec![0; len];
            }
        }
        obj.size = size;
        obj.num_elements = num_elements;
        obj.max_num_elements = num_elements;
        obj.mapped = false;
        obj.export = None;

        let data = match data {
            Some(data) if buffer_type != BufferType::ProtectedSliceData => data,
            _ => return Ok(()),
        };
        let len = usize::try_from(total)
            .ok()
            .filter(|&len| len <= data.len())
            .ok_or(Error::InvalidParameter("initial data shorter than the buffer"))?;
        obj.map()?;
        let copied = obj.write_at(0, &data[..len]);
        obj.unmap()?;
        copied
    }

    /// Frees a buffer outright: unlinks it, unmaps it and releases its slot.
    pub(crate) fn destroy_buffer_object(&mut self, handle: Handle) {
        let (context, buffer_type) = match self.buffers.get_retained(handle) {
            Some(obj) => (obj.context, obj.buffer_type),
            None => return,
        };
        if let Some(lists) = context
            .and_then(|c| self.contexts.get_mut(c))
            .and_then(|ctx| ctx.buffer_lists.get_mut(&buffer_type))
        {
            unlink(&mut self.buffers, lists, handle);
        }
        match self.buffers.free(handle) {
            Ok(mut obj) => {
                obj.release_device_memory();
                debug!("destroyed buffer {}", handle);
            }
            Err(e) => error!("failed to free buffer {}: {}", handle, e),
        }
    }

    /// Parks a buffer on its context's unused list, or destroys it if it has no context.
    pub(crate) fn suspend_buffer(&mut self, handle: Handle) {
        let (context, buffer_type) = match self.buffers.get(handle) {
            Some(obj) => (obj.context, obj.buffer_type),
            None => {
                error!("cannot suspend buffer {}: not active", handle);
                return;
            }
        };
        let ctx_handle = match context.filter(|&c| self.contexts.contains(c)) {
            Some(ctx_handle) => ctx_handle,
            None => return self.destroy_buffer_object(handle),
        };
        let ctx = match self.contexts.get_mut(ctx_handle) {
            Some(ctx) => ctx,
            None => return,
        };
        let frame_count = ctx.frame_count;
        let lists = ctx.buffer_lists.entry(buffer_type).or_default();
        if let Some(obj) = self.buffers.get_mut(handle) {
            obj.release_device_memory();
            obj.last_used = frame_count;
        }
        unlink(&mut self.buffers, lists, handle);
        append_unused(&mut self.buffers, lists, handle);
        if let Err(e) = self.buffers.suspend(handle) {
            error!("failed to suspend buffer {}: {}", handle, e);
        }
    }

    /// Releases a buffer. Context buffers are suspended for reuse; an unknown handle is logged
    /// and otherwise ignored.
    pub fn destroy_buffer(&mut self, buffer: Handle) -> Result<()> {
        if !self.buffers.contains(buffer) {
            error!("destroy of invalid buffer {}", buffer);
            return Ok(());
        }
        self.suspend_buffer(buffer);
        Ok(())
    }

    pub fn buffer(&self, buffer: Handle) -> Result<&BufferObject> {
        self.buffers.get(buffer).ok_or(Error::InvalidBuffer(buffer))
    }

    fn buffer_mut(&mut self, buffer: Handle) -> Result<&mut BufferObject> {
        self.buffers.get_mut(buffer).ok_or(Error::InvalidBuffer(buffer))
    }

    pub fn buffer_info(&self, buffer: Handle) -> Result<BufferInfo> {
        let obj = self.buffer(buffer)?;
        Ok(BufferInfo {
            buffer_type: obj.buffer_type,
            size: obj.size,
            num_elements: obj.num_elements,
        })
    }

    pub fn buffer_set_num_elements(&mut self, buffer: Handle, num_elements: u32) -> Result<()> {
        let obj = self.buffer_mut(buffer)?;
        if num_elements == 0 || num_elements > obj.max_num_elements {
            return Err(Error::InvalidParameter("element count out of range"));
        }
        obj.num_elements = num_elements;
        Ok(())
    }

    pub fn map_buffer(&mut self, buffer: Handle) -> Result<()> {
        self.buffer_mut(buffer)?.map()
    }

    pub fn unmap_buffer(&mut self, buffer: Handle) -> Result<()> {
        self.buffer_mut(buffer)?.unmap()
    }

    /// Reads from a mapped buffer.
    pub fn read_buffer(&self, buffer: Handle, offset: u64, buf: &mut [u8]) -> Result<()> {
        let obj = self.buffer(buffer)?;
        if !obj.mapped {
            return Err(Error::NotMapped(buffer));
        }
        obj.read_at(offset, buf)
    }

    /// Writes into a mapped buffer.
    pub fn write_buffer(&mut self, buffer: Handle, offset: u64, data: &[u8]) -> Result<()> {
        let obj = self.buffer_mut(buffer)?;
        if !obj.mapped {
            return Err(Error::NotMapped(buffer));
        }
        obj.write_at(offset, data)
    }

    /// Shares an image buffer outside the driver. Repeated calls must ask for the same memory
    /// type and are counted; each must be matched by `release_buffer_handle`.
    pub fn acquire_buffer_handle(&mut self, buffer: Handle, mem_type: u32) -> Result<ExportedBuffer> {
        let obj = self.buffer_mut(buffer)?;
        if obj.buffer_type != BufferType::Image {
            return Err(Error::UnsupportedBufferType(obj.buffer_type as u32));
        }
        let (mem_type, kind) = match MemoryType::n(mem_type) {
            Some(MemoryType::KernelDrm) => (MemoryType::KernelDrm, ExportKind::KernelName),
            Some(MemoryType::DrmPrime) => (MemoryType::DrmPrime, ExportKind::Prime),
            _ => return Err(Error::UnsupportedMemoryType(mem_type)),
        };
        let bo = obj.bo.as_ref().ok_or(Error::InvalidBuffer(buffer))?;
        bo.wait()?;
        match &mut obj.export {
            Some(export) if export.mem_type != mem_type => {
                return Err(Error::InvalidParameter("buffer exported with another memory type"));
            }
            Some(export) => export.refcount += 1,
            None => {
                obj.export = Some(ExportState {
                    handle: bo.export(kind)?,
                    mem_type,
                    refcount: 1,
                });
            }
        }
        let handle = match obj.export.as_ref().map(|e| &e.handle) {
            Some(ExternalHandle::Name(name)) => u64::from(*name),
            Some(ExternalHandle::Prime(fd)) => fd.as_raw_fd() as u64,
            None => return Err(Error::InvalidBuffer(buffer)),
        };
        Ok(ExportedBuffer {
            buffer_type: obj.buffer_type,
            mem_type,
            mem_size: u64::from(obj.num_elements) * u64::from(obj.size),
            handle,
        })
    }

    /// Drops one export reference. The last release closes any PRIME descriptor.
    pub fn release_buffer_handle(&mut self, buffer: Handle) -> Result<()> {
        let obj = self.buffer_mut(buffer)?;
        if obj.buffer_type != BufferType::Image {
            return Err(Error::UnsupportedBufferType(obj.buffer_type as u32));
        }
        let export = obj.export.as_mut().ok_or(Error::InvalidBuffer(buffer))?;
        export.refcount -= 1;
        if export.refcount == 0 {
            obj.export = None;
        }
        Ok(())
    }

    /// Handles on the active list of (context, type), most recent first.
    pub fn active_buffers(&self, context: Handle, buffer_type: BufferType) -> Vec<Handle> {
        let head = self
            .contexts
            .get(context)
            .and_then(|ctx| ctx.buffer_lists.get(&buffer_type))
            .and_then(|lists| lists.active_head);
        list_handles(&self.buffers, head)
    }

    /// Handles on the unused list of (context, type), oldest first.
    pub fn unused_buffers(&self, context: Handle, buffer_type: BufferType) -> Vec<Handle> {
        let head = self
            .contexts
            .get(context)
            .and_then(|ctx| ctx.buffer_lists.get(&buffer_type))
            .and_then(|lists| lists.unused_head);
        list_handles(&self.buffers, head)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bufmgr::fake::FakeBufferManager;

    use super::*;
    use crate::config::DriverConfig;
    use crate::driver::Entrypoint;
    use crate::driver::Profile;
    use crate::driver::SurfaceMemory;
    use crate::driver::RT_FORMAT_YUV420;

    fn setup() -> (Arc<FakeBufferManager>, Driver, Handle) {
        let bufmgr = Arc::new(FakeBufferManager::new());
        let mut driver = Driver::new(bufmgr.clone(), DriverConfig::default());
        let config = driver
            .create_config(Profile::VP8Version0_3, Entrypoint::VLD, &[])
            .unwrap();
        let surfaces = driver
            .create_surfaces(RT_FORMAT_YUV420, 64, 64, 1, SurfaceMemory::Native)
            .unwrap();
        let context = driver
            .create_context(config, 64, 64, 0, &surfaces)
            .unwrap();
        (bufmgr, driver, context)
    }

    #[test]
    fn buffer_type_numbering() {
        assert_eq!(BufferType::from_raw(5).unwrap(), BufferType::SliceData);
        assert_eq!(BufferType::from_raw(42).unwrap(), BufferType::ProcFilterParameter);
        assert!(matches!(
            BufferType::from_raw(15),
            Err(Error::UnsupportedBufferType(15))
        ));
    }

    #[test]
    fn zero_elements_rejected() {
        let (_, mut driver, context) = setup();
        assert!(matches!(
            driver.create_buffer(context, BufferType::SliceData, 16, 0, None),
            Err(Error::InvalidParameter(_))
        ));
        assert!(driver.buffers().is_empty());
    }

    #[test]
    fn device_buffers_round_up() {
        let (bufmgr, mut driver, context) = setup();
        let slice = driver
            .create_buffer(context, BufferType::SliceData, 1000, 3, None)
            .unwrap();
        let bo = driver.buffer(slice).unwrap().bo().unwrap().handle();
        let allocation = bufmgr.allocation(bo).unwrap();
        assert_eq!(allocation.size, 0x8000);
        assert_eq!(allocation.name, "VASliceDataBufferType");
        assert_eq!(allocation.cache, CachePolicy::WriteCombine);

        let params = driver
            .create_buffer(context, BufferType::PictureParameter, 100, 2, None)
            .unwrap();
        let obj = driver.buffer(params).unwrap();
        assert!(obj.bo().is_none());
        assert_eq!(obj.data().len(), 200);
        assert_eq!(
            driver.buffer_info(params).unwrap(),
            BufferInfo {
                buffer_type: BufferType::PictureParameter,
                size: 100,
                num_elements: 2,
            }
        );
    }

    #[test]
    fn initial_data_copied() {
        let (bufmgr, mut driver, context) = setup();
        let data: Vec<u8> = (0..=255).collect();
        let buffer = driver
            .create_buffer(context, BufferType::SliceData, 256, 1, Some(&data))
            .unwrap();
        let bo = driver.buffer(buffer).unwrap().bo().unwrap().handle();
        assert_eq!(&bufmgr.contents(bo)[..256], &data[..]);
        assert_eq!(bufmgr.map_calls(bo), (1, 1));
        assert!(!driver.buffer(buffer).unwrap().is_mapped());
    }

    #[test]
    fn protected_slice_data_skips_copy() {
        let (bufmgr, mut driver, context) = setup();
        let buffer = driver
            .create_buffer(
                context,
                BufferType::ProtectedSliceData,
                16,
                1,
                Some(&[0xaa; 16]),
            )
            .unwrap();
        let bo = driver.buffer(buffer).unwrap().bo().unwrap().handle();
        assert_eq!(bufmgr.map_calls(bo), (0, 0));
    }

    #[test]
    fn failed_setup_destroys_buffer() {
        let (bufmgr, mut driver, context) = setup();
        bufmgr.fail_map("VASliceDataBufferType");
        assert!(driver
            .create_buffer(context, BufferType::SliceData, 16, 1, Some(&[0; 16]))
            .is_err());
        assert!(driver.buffers().is_empty());
        assert!(driver
            .active_buffers(context, BufferType::SliceData)
            .is_empty());

        bufmgr.clear_failures();
        bufmgr.fail_alloc("VABitPlaneBufferType");
        assert!(matches!(
            driver.create_buffer(context, BufferType::BitPlane, 16, 1, None),
            Err(Error::BufMgr(_))
        ));
        assert!(driver.buffers().is_empty());
    }

    #[test]
    fn short_initial_data_rejected() {
        let (_, mut driver, context) = setup();
        assert!(matches!(
            driver.create_buffer(context, BufferType::PictureParameter, 16, 2, Some(&[0; 16])),
            Err(Error::InvalidParameter(_))
        ));
        assert!(driver.buffers().is_empty());
    }

    #[test]
    fn destroy_suspends_and_recycles() {
        let (bufmgr, mut driver, context) = setup();
        let buffer = driver
            .create_buffer(context, BufferType::SliceData, 64, 1, None)
            .unwrap();
        let bo = driver.buffer(buffer).unwrap().bo().unwrap().handle();
        driver.destroy_buffer(buffer).unwrap();
        assert!(driver.buffers().is_suspended(buffer));
        assert_eq!(bufmgr.refcount(bo), 0);
        assert_eq!(
            driver.unused_buffers(context, BufferType::SliceData),
            vec![buffer]
        );

        // Another type does not pick it up.
        let other = driver
            .create_buffer(context, BufferType::BitPlane, 64, 1, None)
            .unwrap();
        assert_ne!(other, buffer);

        let again = driver
            .create_buffer(context, BufferType::SliceData, 32, 2, None)
            .unwrap();
        assert_eq!(again, buffer);
        assert_eq!(driver.buffer_info(again).unwrap().num_elements, 2);
        assert!(driver
            .unused_buffers(context, BufferType::SliceData)
            .is_empty());
        assert_eq!(
            driver.active_buffers(context, BufferType::SliceData),
            vec![buffer]
        );
    }

    #[test]
    fn recycling_waits_for_min_frames() {
        let bufmgr = Arc::new(FakeBufferManager::new());
        let settings = DriverConfig {
            recycle_min_frames: 2,
            ..Default::default()
        };
        let mut driver = Driver::new(bufmgr, settings);
        let config = driver
            .create_config(Profile::VP8Version0_3, Entrypoint::VLD, &[])
            .unwrap();
        let surfaces = driver
            .create_surfaces(RT_FORMAT_YUV420, 64, 64, 1, SurfaceMemory::Native)
            .unwrap();
        let context = driver
            .create_context(config, 64, 64, 0, &surfaces)
            .unwrap();
        let buffer = driver
            .create_buffer(context, BufferType::PictureParameter, 8, 1, None)
            .unwrap();
        driver.destroy_buffer(buffer).unwrap();
        let fresh = driver
            .create_buffer(context, BufferType::PictureParameter, 8, 1, None)
            .unwrap();
        assert_ne!(fresh, buffer);
        driver.destroy_buffer(fresh).unwrap();

        for _ in 0..2 {
            driver.begin_picture(context, surfaces[0]).unwrap();
            driver.end_picture(context).unwrap();
        }
        let recycled = driver
            .create_buffer(context, BufferType::PictureParameter, 8, 1, None)
            .unwrap();
        assert_eq!(recycled, buffer);
    }

    #[test]
    fn destroy_invalid_buffer_is_ignored() {
        let (_, mut driver, context) = setup();
        let buffer = driver
            .create_buffer(context, BufferType::SliceData, 64, 1, None)
            .unwrap();
        driver.destroy_buffer(buffer).unwrap();
        driver.destroy_buffer(buffer).unwrap();
        assert_eq!(
            driver.unused_buffers(context, BufferType::SliceData),
            vec![buffer]
        );
    }

    #[test]
    fn set_num_elements_bounds() {
        let (_, mut driver, context) = setup();
        let buffer = driver
            .create_buffer(context, BufferType::SliceParameter, 12, 4, None)
            .unwrap();
        driver.buffer_set_num_elements(buffer, 2).unwrap();
        assert_eq!(driver.buffer_info(buffer).unwrap().num_elements, 2);
        driver.buffer_set_num_elements(buffer, 4).unwrap();
        assert!(matches!(
            driver.buffer_set_num_elements(buffer, 5),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            driver.buffer_set_num_elements(buffer, 0),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn map_read_write() {
        let (bufmgr, mut driver, context) = setup();
        let params = driver
            .create_buffer(context, BufferType::IQMatrix, 8, 1, None)
            .unwrap();
        assert!(matches!(
            driver.write_buffer(params, 0, &[1, 2]),
            Err(Error::NotMapped(_))
        ));
        driver.map_buffer(params).unwrap();
        driver.write_buffer(params, 6, &[1, 2]).unwrap();
        assert!(matches!(
            driver.write_buffer(params, 7, &[1, 2]),
            Err(Error::OutOfSpace { .. })
        ));
        let mut out = [0u8; 8];
        driver.read_buffer(params, 0, &mut out).unwrap();
        assert_eq!(out, [0, 0, 0, 0, 0, 0, 1, 2]);
        driver.unmap_buffer(params).unwrap();

        let slice = driver
            .create_buffer(context, BufferType::SliceData, 8, 1, None)
            .unwrap();
        let bo = driver.buffer(slice).unwrap().bo().unwrap().handle();
        bufmgr.fail_map("VASliceDataBufferType");
        assert_eq!(
            driver.map_buffer(slice).unwrap_err().status(),
            crate::error::Status::OperationFailed
        );
        bufmgr.clear_failures();
        driver.map_buffer(slice).unwrap();
        driver.write_buffer(slice, 0, &[9; 8]).unwrap();
        driver.unmap_buffer(slice).unwrap();
        assert_eq!(&bufmgr.contents(bo)[..8], &[9; 8]);
    }

    #[test]
    fn export_requires_image_buffers() {
        let (_, mut driver, context) = setup();
        let slice = driver
            .create_buffer(context, BufferType::SliceData, 8, 1, None)
            .unwrap();
        assert!(matches!(
            driver.acquire_buffer_handle(slice, MemoryType::KernelDrm as u32),
            Err(Error::UnsupportedBufferType(5))
        ));
        assert!(matches!(
            driver.release_buffer_handle(slice),
            Err(Error::UnsupportedBufferType(5))
        ));
    }
}
