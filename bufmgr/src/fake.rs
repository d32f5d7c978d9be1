// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! An in-memory buffer manager that records every call, for tests and the replay tool.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fs::File;
use std::os::fd::BorrowedFd;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use base::align_up;
use base::debug;
use sync::Mutex;

use crate::AllocParams;
use crate::Bo;
use crate::BufferManager;
use crate::BufferObject;
use crate::CachePolicy;
use crate::ContextKind;
use crate::Error;
use crate::ExportKind;
use crate::ExternalHandle;
use crate::HwContext;
use crate::Result;
use crate::Tiling;
use crate::TilingParams;

const FIRST_DEVICE_ADDRESS: u64 = 0x1000_0000;
const PAGE_SIZE: u64 = 0x1000;
const FIRST_KERNEL_NAME: u32 = 0x100;

/// A relocation recorded by [`BufferObject::emit_reloc`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reloc {
    pub offset: u64,
    pub target: u32,
    pub delta: u64,
    pub flags: u32,
}

/// A command stream handed to the engine, with a copy of the submitted bytes.
#[derive(Clone, Debug)]
pub struct Submission {
    pub handle: u32,
    pub name: String,
    pub offset: u64,
    pub len: u64,
    pub fence: i32,
    pub data: Vec<u8>,
}

impl Submission {
    /// The submitted bytes as little-endian words.
    pub fn words(&self) -> Vec<u32> {
        self.data
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .collect()
    }
}

/// How a buffer object came to be.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Allocation {
    pub name: String,
    pub size: u64,
    pub cache: CachePolicy,
    pub tiling: Tiling,
    pub reusable: bool,
    pub hw_context: Option<u32>,
    pub imported: bool,
}

struct BoRecord {
    allocation: Allocation,
    data: Vec<u8>,
    mapped: bool,
    refcount: u32,
    busy: bool,
    map_calls: u32,
    unmap_calls: u32,
    relocs: Vec<Reloc>,
    /// Targets this buffer holds a reference on, one entry per relocation.
    reloc_refs: Vec<u32>,
    kernel_name: Option<u32>,
}

#[derive(Default)]
struct FakeState {
    next_handle: u32,
    next_address: u64,
    next_kernel_name: u32,
    next_hw_context: u32,
    bos: BTreeMap<u32, BoRecord>,
    hw_contexts: BTreeMap<u32, Option<TilingParams>>,
    submissions: Vec<Submission>,
    fail_alloc: BTreeSet<String>,
    /// Allocations still allowed per name before they start failing.
    alloc_budget: BTreeMap<String, usize>,
    fail_map: BTreeSet<String>,
    fail_hw_context: bool,
}

impl FakeState {
    fn alloc_fails(&mut self, name: &str) -> bool {
        if self.fail_alloc.contains(name) {
            return true;
        }
        match self.alloc_budget.get_mut(name) {
            Some(0) => true,
            Some(budget) => {
                *budget -= 1;
                false
            }
            None => false,
        }
    }

    fn record(&self, handle: u32) -> &BoRecord {
        match self.bos.get(&handle) {
            Some(record) => record,
            None => panic!("fake buffer object {} has no record", handle),
        }
    }

    fn record_mut(&mut self, handle: u32) -> &mut BoRecord {
        match self.bos.get_mut(&handle) {
            Some(record) => record,
            None => panic!("fake buffer object {} has no record", handle),
        }
    }

    /// Drops one reference on `handle`. A buffer losing its last reference releases the
    /// references its relocations hold.
    fn release(&mut self, handle: u32) {
        let mut pending = vec![handle];
        while let Some(handle) = pending.pop() {
            let record = self.record_mut(handle);
            match record.refcount.checked_sub(1) {
                Some(count) => record.refcount = count,
                None => panic!("fake buffer object {} unreferenced too often", handle),
            }
            if record.refcount == 0 {
                record.mapped = false;
                pending.append(&mut record.reloc_refs);
            }
        }
    }

    fn create(&mut self, allocation: Allocation) -> Result<(u32, u64)> {
        let span = align_up(allocation.size.max(1), PAGE_SIZE).ok_or_else(|| Error::AllocFailed {
            name: allocation.name.clone(),
            size: allocation.size,
        })?;
        self.next_handle += 1;
        let handle = self.next_handle;
        let address = self.next_address.max(FIRST_DEVICE_ADDRESS);
        self.next_address = address + span;
        self.bos.insert(
            handle,
            BoRecord {
                data: vec![0; allocation.size as usize],
                allocation,
                mapped: false,
                refcount: 1,
                busy: false,
                map_calls: 0,
                unmap_calls: 0,
                relocs: Vec::new(),
                reloc_refs: Vec::new(),
                kernel_name: None,
            },
        );
        Ok((handle, address))
    }
}

struct FakeBo {
    handle: u32,
    size: u64,
    address: u64,
    name: String,
    state: Arc<Mutex<FakeState>>,
}

impl FakeBo {
    fn check_range(&self, offset: u64, len: u64) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(Error::OutOfBounds {
                handle: self.handle,
                offset,
                len,
                size: self.size,
            }),
        }
    }
}

impl BufferObject for FakeBo {
    fn handle(&self) -> u32 {
        self.handle
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn device_address(&self) -> u64 {
        self.address
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn map(&self, _writable: bool) -> Result<()> {
        let mut state = self.state.lock();
        let fail = state.fail_map.contains(&self.name);
        let record = state.record_mut(self.handle);
        record.map_calls += 1;
        if fail {
            return Err(Error::MapFailed(self.handle));
        }
        record.mapped = true;
        Ok(())
    }

    fn unmap(&self) -> Result<()> {
        let mut state = self.state.lock();
        let record = state.record_mut(self.handle);
        record.unmap_calls += 1;
        record.mapped = false;
        Ok(())
    }

    fn is_mapped(&self) -> bool {
        self.state.lock().record(self.handle).mapped
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_range(offset, buf.len() as u64)?;
        let state = self.state.lock();
        let record = state.record(self.handle);
        if !record.mapped {
            return Err(Error::NotMapped(self.handle));
        }
        let start = offset as usize;
        buf.copy_from_slice(&record.data[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len() as u64)?;
        let mut state = self.state.lock();
        let record = state.record_mut(self.handle);
        if !record.mapped {
            return Err(Error::NotMapped(self.handle));
        }
        let start = offset as usize;
        record.data[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn wait(&self) -> Result<()> {
        self.state.lock().record_mut(self.handle).busy = false;
        Ok(())
    }

    fn busy(&self) -> bool {
        self.state.lock().record(self.handle).busy
    }

    fn emit_reloc(
        &self,
        offset: u64,
        target: &dyn BufferObject,
        delta: u64,
        flags: u32,
    ) -> Result<()> {
        self.check_range(offset, 4)?;
        let target = target.handle();
        let mut state = self.state.lock();
        if target != self.handle {
            state.record_mut(target).refcount += 1;
            state.record_mut(self.handle).reloc_refs.push(target);
        }
        state.record_mut(self.handle).relocs.push(Reloc {
            offset,
            target,
            delta,
            flags,
        });
        Ok(())
    }

    fn export(&self, kind: ExportKind) -> Result<ExternalHandle> {
        match kind {
            ExportKind::KernelName => {
                let mut state = self.state.lock();
                if let Some(name) = state.record(self.handle).kernel_name {
                    return Ok(ExternalHandle::Name(name));
                }
                let name = FIRST_KERNEL_NAME + state.next_kernel_name;
                state.next_kernel_name += 1;
                state.record_mut(self.handle).kernel_name = Some(name);
                Ok(ExternalHandle::Name(name))
            }
            ExportKind::Prime => {
                let file = File::open("/dev/null").map_err(|source| Error::ExportFailed {
                    handle: self.handle,
                    source,
                })?;
                Ok(ExternalHandle::Prime(OwnedFd::from(file)))
            }
        }
    }

    fn submit(&self, offset: u64, len: u64, fence: i32) -> Result<()> {
        if self.check_range(offset, len).is_err() {
            return Err(Error::SubmitFailed(self.handle));
        }
        let mut state = self.state.lock();
        let start = offset as usize;
        let data = state.record(self.handle).data[start..start + len as usize].to_vec();
        debug!("fake submit of {} bytes from {}", len, self.name);
        state.submissions.push(Submission {
            handle: self.handle,
            name: self.name.clone(),
            offset,
            len,
            fence,
            data,
        });
        Ok(())
    }

    fn reference(&self) -> Result<()> {
        self.state.lock().record_mut(self.handle).refcount += 1;
        Ok(())
    }

    fn unreference(&self) {
        self.state.lock().release(self.handle);
    }
}

/// A buffer manager backed by plain memory.
///
/// Clones share state, so a test can keep one clone for inspection while the driver owns another.
#[derive(Clone, Default)]
pub struct FakeBufferManager {
    state: Arc<Mutex<FakeState>>,
}

impl FakeBufferManager {
    pub fn new() -> FakeBufferManager {
        FakeBufferManager::default()
    }

    fn new_bo(&self, allocation: Allocation) -> Result<Bo> {
        let name = allocation.name.clone();
        let size = allocation.size;
        let (handle, address) = self.state.lock().create(allocation)?;
        debug!("fake alloc {} ({} bytes) as {}", name, size, handle);
        Ok(Bo::from_referenced(Arc::new(FakeBo {
            handle,
            size,
            address,
            name,
            state: self.state.clone(),
        })))
    }

    /// Makes every later allocation named `name` fail.
    pub fn fail_alloc(&self, name: &str) {
        self.state.lock().fail_alloc.insert(name.to_string());
    }

    /// Lets `successes` more allocations named `name` through, then fails the rest.
    pub fn fail_alloc_after(&self, name: &str, successes: usize) {
        self.state
            .lock()
            .alloc_budget
            .insert(name.to_string(), successes);
    }

    /// Makes every later map of a buffer named `name` fail.
    pub fn fail_map(&self, name: &str) {
        self.state.lock().fail_map.insert(name.to_string());
    }

    pub fn fail_hw_context(&self, fail: bool) {
        self.state.lock().fail_hw_context = fail;
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.fail_alloc.clear();
        state.alloc_budget.clear();
        state.fail_map.clear();
        state.fail_hw_context = false;
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().submissions.clone()
    }

    pub fn take_submissions(&self) -> Vec<Submission> {
        std::mem::take(&mut self.state.lock().submissions)
    }

    pub fn allocation(&self, handle: u32) -> Option<Allocation> {
        self.state
            .lock()
            .bos
            .get(&handle)
            .map(|record| record.allocation.clone())
    }

    /// Handles of every buffer object ever allocated under `name`, oldest first.
    pub fn handles_named(&self, name: &str) -> Vec<u32> {
        self.state
            .lock()
            .bos
            .iter()
            .filter(|(_, record)| record.allocation.name == name)
            .map(|(handle, _)| *handle)
            .collect()
    }

    pub fn refcount(&self, handle: u32) -> u32 {
        self.state
            .lock()
            .bos
            .get(&handle)
            .map_or(0, |record| record.refcount)
    }

    /// Handles still holding at least one reference.
    pub fn live_bos(&self) -> Vec<u32> {
        self.state
            .lock()
            .bos
            .iter()
            .filter(|(_, record)| record.refcount > 0)
            .map(|(handle, _)| *handle)
            .collect()
    }

    pub fn relocs(&self, handle: u32) -> Vec<Reloc> {
        self.state
            .lock()
            .bos
            .get(&handle)
            .map(|record| record.relocs.clone())
            .unwrap_or_default()
    }

    pub fn contents(&self, handle: u32) -> Vec<u8> {
        self.state
            .lock()
            .bos
            .get(&handle)
            .map(|record| record.data.clone())
            .unwrap_or_default()
    }

    /// Returns `(map, unmap)` call counts.
    pub fn map_calls(&self, handle: u32) -> (u32, u32) {
        self.state
            .lock()
            .bos
            .get(&handle)
            .map_or((0, 0), |record| (record.map_calls, record.unmap_calls))
    }

    pub fn set_busy(&self, handle: u32, busy: bool) {
        if let Some(record) = self.state.lock().bos.get_mut(&handle) {
            record.busy = busy;
        }
    }

    pub fn live_hw_contexts(&self) -> Vec<u32> {
        self.state.lock().hw_contexts.keys().copied().collect()
    }

    pub fn hw_context_tiling(&self, id: u32) -> Option<TilingParams> {
        self.state.lock().hw_contexts.get(&id).copied().flatten()
    }
}

impl BufferManager for FakeBufferManager {
    fn alloc(&self, hw_context: Option<&HwContext>, params: AllocParams) -> Result<Bo> {
        if self.state.lock().alloc_fails(params.name) {
            return Err(Error::AllocFailed {
                name: params.name.to_string(),
                size: params.size,
            });
        }
        self.new_bo(Allocation {
            name: params.name.to_string(),
            size: params.size,
            cache: params.cache,
            tiling: params.tiling,
            reusable: params.reusable,
            hw_context: hw_context.map(|ctx| ctx.id),
            imported: false,
        })
    }

    fn import(
        &self,
        hw_context: Option<&HwContext>,
        name: &str,
        fd: BorrowedFd,
        size: u64,
    ) -> Result<Bo> {
        if self.state.lock().alloc_fails(name) || fd.try_clone_to_owned().is_err() {
            return Err(Error::ImportFailed {
                name: name.to_string(),
            });
        }
        self.new_bo(Allocation {
            name: name.to_string(),
            size,
            cache: CachePolicy::Uncached,
            tiling: Tiling::Linear,
            reusable: false,
            hw_context: hw_context.map(|ctx| ctx.id),
            imported: true,
        })
    }

    fn hw_context_create(
        &self,
        kind: ContextKind,
        tiling: Option<TilingParams>,
    ) -> Result<HwContext> {
        let mut state = self.state.lock();
        if state.fail_hw_context {
            return Err(Error::HwContextFailed);
        }
        state.next_hw_context += 1;
        let id = state.next_hw_context;
        state.hw_contexts.insert(id, tiling);
        Ok(HwContext { id, kind })
    }

    fn hw_context_destroy(&self, hw_context: HwContext) -> Result<()> {
        match self.state.lock().hw_contexts.remove(&hw_context.id) {
            Some(_) => Ok(()),
            None => Err(Error::UnknownHwContext(hw_context.id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsFd;

    use super::*;

    #[test]
    fn bo_drop_releases_reference() {
        let bufmgr = FakeBufferManager::new();
        let bo = bufmgr.alloc(None, AllocParams::new("test", 64)).unwrap();
        let handle = bo.handle();
        let clone = bo.try_clone().unwrap();
        assert_eq!(bufmgr.refcount(handle), 2);
        drop(bo);
        assert_eq!(bufmgr.refcount(handle), 1);
        drop(clone);
        assert_eq!(bufmgr.refcount(handle), 0);
        assert!(bufmgr.live_bos().is_empty());
    }

    #[test]
    fn relocation_holds_target_until_source_is_gone() {
        let bufmgr = FakeBufferManager::new();
        let cmd = bufmgr.alloc(None, AllocParams::new("cmd", 64)).unwrap();
        let target = bufmgr.alloc(None, AllocParams::new("target", 64)).unwrap();
        let target_handle = target.handle();
        cmd.emit_reloc(0, &target, 0, 0).unwrap();
        cmd.emit_reloc(4, &target, 8, 0).unwrap();
        cmd.emit_reloc(8, &cmd, 0, 0).unwrap();
        assert_eq!(bufmgr.refcount(target_handle), 3);

        drop(target);
        assert_eq!(bufmgr.refcount(target_handle), 2);
        cmd.submit(0, 12, -1).unwrap();
        assert_eq!(bufmgr.refcount(target_handle), 2);

        drop(cmd);
        assert_eq!(bufmgr.refcount(target_handle), 0);
        assert!(bufmgr.live_bos().is_empty());
    }

    #[test]
    fn mapped_access_only() {
        let bufmgr = FakeBufferManager::new();
        let bo = bufmgr.alloc(None, AllocParams::new("test", 16)).unwrap();
        assert!(matches!(bo.write_at(0, &[1]), Err(Error::NotMapped(_))));
        bo.map(true).unwrap();
        bo.write_at(4, &[1, 2, 3, 4]).unwrap();
        assert!(matches!(
            bo.write_at(14, &[0; 4]),
            Err(Error::OutOfBounds { .. })
        ));
        let mut buf = [0u8; 4];
        bo.read_at(4, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        bo.unmap().unwrap();
        assert_eq!(bufmgr.map_calls(bo.handle()), (1, 1));
    }

    #[test]
    fn device_addresses_do_not_overlap() {
        let bufmgr = FakeBufferManager::new();
        let a = bufmgr.alloc(None, AllocParams::new("a", 0x1800)).unwrap();
        let b = bufmgr.alloc(None, AllocParams::new("b", 16)).unwrap();
        assert!(b.device_address() >= a.device_address() + 0x2000);
    }

    #[test]
    fn submission_snapshots_bytes() {
        let bufmgr = FakeBufferManager::new();
        let bo = bufmgr.alloc(None, AllocParams::new("cmd", 16)).unwrap();
        bo.map(true).unwrap();
        bo.write_at(0, &0xdead_beefu32.to_le_bytes()).unwrap();
        bo.unmap().unwrap();
        bo.submit(0, 4, -1).unwrap();
        let submissions = bufmgr.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].words(), vec![0xdead_beef]);
        assert_eq!(submissions[0].fence, -1);
    }

    #[test]
    fn injected_failures() {
        let bufmgr = FakeBufferManager::new();
        bufmgr.fail_alloc("bad");
        assert!(bufmgr.alloc(None, AllocParams::new("bad", 16)).is_err());
        bufmgr.fail_map("unmappable");
        let bo = bufmgr
            .alloc(None, AllocParams::new("unmappable", 16))
            .unwrap();
        assert!(matches!(bo.map(false), Err(Error::MapFailed(_))));
        bufmgr.clear_failures();
        assert!(bufmgr.alloc(None, AllocParams::new("bad", 16)).is_ok());
    }

    #[test]
    fn allocation_budget() {
        let bufmgr = FakeBufferManager::new();
        bufmgr.fail_alloc_after("surface", 2);
        assert!(bufmgr.alloc(None, AllocParams::new("surface", 16)).is_ok());
        assert!(bufmgr.alloc(None, AllocParams::new("other", 16)).is_ok());
        assert!(bufmgr.alloc(None, AllocParams::new("surface", 16)).is_ok());
        assert!(bufmgr.alloc(None, AllocParams::new("surface", 16)).is_err());
        bufmgr.clear_failures();
        assert!(bufmgr.alloc(None, AllocParams::new("surface", 16)).is_ok());
    }

    #[test]
    fn export_kinds() {
        let bufmgr = FakeBufferManager::new();
        let bo = bufmgr.alloc(None, AllocParams::new("img", 16)).unwrap();
        let name = bo.export(ExportKind::KernelName).unwrap();
        assert_eq!(name.kind(), ExportKind::KernelName);
        assert!(matches!(
            (name, bo.export(ExportKind::KernelName).unwrap()),
            (ExternalHandle::Name(a), ExternalHandle::Name(b)) if a == b
        ));
        let prime = bo.export(ExportKind::Prime).unwrap();
        assert_eq!(prime.kind(), ExportKind::Prime);
        if let ExternalHandle::Prime(fd) = prime {
            let imported = bufmgr.import(None, "shared", fd.as_fd(), 16).unwrap();
            assert!(bufmgr.allocation(imported.handle()).unwrap().imported);
        }
    }

    #[test]
    fn hw_context_lifecycle() {
        let bufmgr = FakeBufferManager::new();
        let tiling = TilingParams {
            tile_stride: 1,
            tiling_scheme: 0,
        };
        let ctx = bufmgr
            .hw_context_create(ContextKind::Ved, Some(tiling))
            .unwrap();
        let id = ctx.id;
        assert_eq!(bufmgr.hw_context_tiling(id), Some(tiling));
        bufmgr.hw_context_destroy(ctx).unwrap();
        assert!(bufmgr.live_hw_contexts().is_empty());
        assert!(matches!(
            bufmgr.hw_context_destroy(HwContext {
                id,
                kind: ContextKind::Ved
            }),
            Err(Error::UnknownHwContext(_))
        ));
    }
}
