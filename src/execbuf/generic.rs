// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use base::debug;
use base::error;
use base::trace;
use bufmgr::AllocParams;
use bufmgr::Bo;
use bufmgr::BufferManager;
use bufmgr::CachePolicy;
use bufmgr::HwContext;

use crate::error::Error;
use crate::error::Result;
use crate::execbuf::Command;

/// Bytes that must stay free for `full()` to report false.
const FULL_MARGIN: u64 = 20;

/// A mapped command buffer with a write cursor.
///
/// The buffer object is unmapped and released by `put`, which also runs on drop.
pub struct GenericExecBuffer {
    bo: Option<Bo>,
    hw_context_id: u32,
    size: u64,
    cur_offset: u64,
    start_offset: u64,
}

impl GenericExecBuffer {
    /// Allocates a write-combined buffer of `size` bytes and maps it for writing.
    pub fn acquire(
        bufmgr: &dyn BufferManager,
        hw_context: &HwContext,
        name: &str,
        size: u64,
        reusable: bool,
    ) -> Result<GenericExecBuffer> {
        let params = AllocParams::new(name, size)
            .cache(CachePolicy::WriteCombine)
            .reusable(reusable);
        let bo = bufmgr
            .alloc(Some(hw_context), params)
            .map_err(Error::ExecBufferAcquire)?;
        // A failed map drops `bo`, releasing its reference.
        bo.map(true).map_err(Error::ExecBufferAcquire)?;
        debug!("acquired {} ({} bytes) on context {}", name, size, hw_context.id);
        Ok(GenericExecBuffer {
            size: bo.size(),
            bo: Some(bo),
            hw_context_id: hw_context.id,
            cur_offset: 0,
            start_offset: 0,
        })
    }

    fn bo(&self) -> Result<&Bo> {
        self.bo.as_ref().ok_or(Error::ExecBufferReleased)
    }

    /// The command buffer object, if still held.
    pub fn buffer(&self) -> Option<&Bo> {
        self.bo.as_ref()
    }

    pub fn hw_context_id(&self) -> u32 {
        self.hw_context_id
    }

    /// Capacity in bytes; zero once released.
    pub fn size(&self) -> u64 {
        if self.bo.is_some() {
            self.size
        } else {
            0
        }
    }

    pub fn cur_offset(&self) -> u64 {
        self.cur_offset
    }

    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    pub(crate) fn set_cur_offset(&mut self, offset: u64) {
        self.cur_offset = offset;
    }

    pub(crate) fn set_start_offset(&mut self, offset: u64) {
        self.start_offset = offset;
    }

    fn check_space(&self, offset: u64, len: u64) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size() => Ok(()),
            _ => Err(Error::OutOfSpace {
                offset,
                len,
                size: self.size(),
            }),
        }
    }

    /// Reserves `len` bytes at the cursor and returns their offset.
    pub fn alloc_space(&mut self, len: u64) -> Result<u64> {
        debug_assert_eq!(len % 4, 0);
        self.check_space(self.cur_offset, len)?;
        let offset = self.cur_offset;
        self.cur_offset += len;
        Ok(offset)
    }

    pub fn write_u32_at(&mut self, offset: u64, value: u32) -> Result<()> {
        self.check_space(offset, 4)?;
        self.bo()?.write_at(offset, &value.to_le_bytes())?;
        Ok(())
    }

    pub fn read_u32_at(&self, offset: u64) -> Result<u32> {
        self.check_space(offset, 4)?;
        let mut word = [0u8; 4];
        self.bo()?.read_at(offset, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    /// Appends one word at the cursor.
    pub fn emit(&mut self, value: u32) -> Result<()> {
        let offset = self.alloc_space(4)?;
        self.write_u32_at(offset, value)
    }

    /// Records a relocation for the word at `offset` and writes its provisional value.
    pub fn reloc(&mut self, target: &Bo, offset: u64, delta: u64, flags: u32) -> Result<()> {
        self.check_space(offset, 4)?;
        let bo = self.bo()?;
        if let Err(e) = bo.emit_reloc(offset, target, delta, flags) {
            error!(
                "failed to emit reloc for bo {} at offset {:#x}: {}",
                target.handle(),
                offset,
                e
            );
            return Err(e.into());
        }
        let value = target.device_address().wrapping_add(delta) as u32;
        bo.write_at(offset, &value.to_le_bytes())?;
        trace!(
            "reloc at {:#x} to bo {} ({:#x}) + {:#x}",
            offset,
            target.handle(),
            target.device_address(),
            delta
        );
        Ok(())
    }

    /// Appends a relocated word at the cursor.
    pub fn emit_reloc(&mut self, target: &Bo, delta: u64, flags: u32) -> Result<()> {
        let offset = self.alloc_space(4)?;
        self.reloc(target, offset, delta, flags)
    }

    pub fn full(&self) -> bool {
        self.bo.is_some() && self.cur_offset + FULL_MARGIN >= self.size
    }

    pub fn ready(&self) -> bool {
        self.bo.as_ref().map_or(false, |bo| !bo.busy())
    }

    /// Unmaps the buffer and submits everything written so far.
    ///
    /// Running a buffer with nothing written is a successful no-op.
    pub fn run(&mut self) -> Result<()> {
        let bo = self.bo()?;
        bo.unmap()?;
        if self.cur_offset == 0 {
            debug!("{}: nothing written, skipping submission", bo.name());
            return Ok(());
        }
        if let Err(e) = bo.submit(0, self.cur_offset, -1) {
            error!("failed to submit {}: {}", bo.name(), e);
            return Err(e.into());
        }
        Ok(())
    }

    /// Unmaps and releases the buffer. Safe to call more than once.
    pub fn put(&mut self) {
        if let Some(bo) = self.bo.take() {
            if let Err(e) = bo.unmap() {
                error!("failed to unmap {}: {}", bo.name(), e);
            }
        }
        self.cur_offset = 0;
        self.start_offset = 0;
    }

    /// The generic dialect has no commands of its own.
    pub fn add_command(&mut self, command: Command) -> Result<()> {
        Err(Error::UnknownCommand(command.kind() as u32))
    }
}

impl Drop for GenericExecBuffer {
    fn drop(&mut self) {
        self.put();
    }
}

#[cfg(test)]
mod tests {
    use bufmgr::fake::FakeBufferManager;
    use bufmgr::ContextKind;

    use super::*;
    use crate::execbuf::FeDecodeArg;

    fn setup() -> (FakeBufferManager, HwContext) {
        let bufmgr = FakeBufferManager::new();
        let ctx = bufmgr.hw_context_create(ContextKind::Ved, None).unwrap();
        (bufmgr, ctx)
    }

    #[test]
    fn acquire_maps_and_resets() {
        let (bufmgr, ctx) = setup();
        let execbuf = GenericExecBuffer::acquire(&bufmgr, &ctx, "cmd", 256, false).unwrap();
        let bo = execbuf.buffer().unwrap();
        assert!(bo.is_mapped());
        assert_eq!(execbuf.cur_offset(), 0);
        assert_eq!(execbuf.start_offset(), 0);
        let allocation = bufmgr.allocation(bo.handle()).unwrap();
        assert_eq!(allocation.cache, CachePolicy::WriteCombine);
        assert_eq!(allocation.hw_context, Some(ctx.id));
    }

    #[test]
    fn acquire_map_failure_releases_buffer() {
        let (bufmgr, ctx) = setup();
        bufmgr.fail_map("cmd");
        assert!(matches!(
            GenericExecBuffer::acquire(&bufmgr, &ctx, "cmd", 256, false),
            Err(Error::ExecBufferAcquire(_))
        ));
        assert!(bufmgr.live_bos().is_empty());
    }

    #[test]
    fn reloc_writes_provisional_address() {
        let (bufmgr, ctx) = setup();
        let target = bufmgr.alloc(None, AllocParams::new("target", 64)).unwrap();
        let mut execbuf = GenericExecBuffer::acquire(&bufmgr, &ctx, "cmd", 64, false).unwrap();
        execbuf.reloc(&target, 8, 0x10, 0).unwrap();
        assert_eq!(
            execbuf.read_u32_at(8).unwrap(),
            target.device_address() as u32 + 0x10
        );
        let handle = execbuf.buffer().unwrap().handle();
        let relocs = bufmgr.relocs(handle);
        assert_eq!(relocs.len(), 1);
        assert_eq!(relocs[0].target, target.handle());
        assert_eq!(relocs[0].delta, 0x10);
    }

    #[test]
    fn reloc_target_outlives_its_owner() {
        let (bufmgr, ctx) = setup();
        let target = bufmgr.alloc(None, AllocParams::new("target", 64)).unwrap();
        let target_handle = target.handle();
        let mut execbuf = GenericExecBuffer::acquire(&bufmgr, &ctx, "cmd", 64, false).unwrap();
        execbuf.emit_reloc(&target, 0, 0).unwrap();
        drop(target);
        assert_eq!(bufmgr.refcount(target_handle), 1);

        execbuf.run().unwrap();
        assert_eq!(bufmgr.submissions().len(), 1);
        assert_eq!(bufmgr.refcount(target_handle), 1);
        execbuf.put();
        assert_eq!(bufmgr.refcount(target_handle), 0);
    }

    #[test]
    fn reloc_past_end_is_rejected() {
        let (bufmgr, ctx) = setup();
        let target = bufmgr.alloc(None, AllocParams::new("target", 64)).unwrap();
        let mut execbuf = GenericExecBuffer::acquire(&bufmgr, &ctx, "cmd", 64, false).unwrap();
        assert!(matches!(
            execbuf.reloc(&target, 61, 0, 0),
            Err(Error::OutOfSpace { offset: 61, .. })
        ));
        assert!(execbuf.reloc(&target, 60, 0, 0).is_ok());
    }

    #[test]
    fn full_margin() {
        let (bufmgr, ctx) = setup();
        let mut execbuf = GenericExecBuffer::acquire(&bufmgr, &ctx, "cmd", 64, false).unwrap();
        for _ in 0..10 {
            execbuf.emit(0).unwrap();
        }
        assert!(!execbuf.full());
        execbuf.emit(0).unwrap();
        assert!(execbuf.full());
        // Emission stops at capacity instead of overflowing.
        for _ in 0..5 {
            execbuf.emit(0).unwrap();
        }
        assert!(matches!(execbuf.emit(0), Err(Error::OutOfSpace { .. })));
    }

    #[test]
    fn run_submits_written_range() {
        let (bufmgr, ctx) = setup();
        let mut execbuf = GenericExecBuffer::acquire(&bufmgr, &ctx, "cmd", 64, false).unwrap();
        execbuf.emit(0x1111_2222).unwrap();
        execbuf.emit(0x3333_4444).unwrap();
        execbuf.run().unwrap();
        let submissions = bufmgr.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].words(), vec![0x1111_2222, 0x3333_4444]);
        assert!(!execbuf.buffer().unwrap().is_mapped());
    }

    #[test]
    fn run_empty_skips_submission() {
        let (bufmgr, ctx) = setup();
        let mut execbuf = GenericExecBuffer::acquire(&bufmgr, &ctx, "cmd", 64, false).unwrap();
        execbuf.run().unwrap();
        assert!(bufmgr.submissions().is_empty());
    }

    #[test]
    fn put_is_idempotent() {
        let (bufmgr, ctx) = setup();
        let mut execbuf = GenericExecBuffer::acquire(&bufmgr, &ctx, "cmd", 64, false).unwrap();
        execbuf.put();
        execbuf.put();
        assert!(bufmgr.live_bos().is_empty());
        assert!(!execbuf.full());
        assert!(!execbuf.ready());
        assert!(matches!(execbuf.run(), Err(Error::ExecBufferReleased)));
    }

    #[test]
    fn ready_tracks_busy() {
        let (bufmgr, ctx) = setup();
        let execbuf = GenericExecBuffer::acquire(&bufmgr, &ctx, "cmd", 64, false).unwrap();
        let handle = execbuf.buffer().unwrap().handle();
        assert!(execbuf.ready());
        bufmgr.set_busy(handle, true);
        assert!(!execbuf.ready());
    }

    #[test]
    fn no_commands() {
        let (bufmgr, ctx) = setup();
        let mut execbuf = GenericExecBuffer::acquire(&bufmgr, &ctx, "cmd", 64, false).unwrap();
        assert!(matches!(
            execbuf.add_command(Command::FeDecode(FeDecodeArg::default())),
            Err(Error::UnknownCommand(0))
        ));
    }
}
