// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Execution buffer dialect of the VED decode engine.
//!
//! Commands are written into a control-allocation buffer ("VED-CtrlAlloc"). Each decode
//! submission closes the region written since the previous one and describes it with a 32 byte
//! firmware message in a second buffer ("VED-MtxMessage"). Running the buffer submits the
//! message buffer; the firmware follows the relocated region addresses from there.

use base::debug;
use base::error;
use base::trace;
use bufmgr::AllocParams;
use bufmgr::Bo;
use bufmgr::BufferManager;
use bufmgr::CachePolicy;
use bufmgr::HwContext;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

use crate::error::Error;
use crate::error::Result;
use crate::execbuf::dump;
use crate::execbuf::Command;
use crate::execbuf::FeDecodeArg;
use crate::execbuf::GenericExecBuffer;

pub const CMD_BUFFER_NAME: &str = "VED-CtrlAlloc";
pub const MSG_BUFFER_NAME: &str = "VED-MtxMessage";

pub const CMD_SIZE: u64 = 0x1000;
pub const MTXMSG_SIZE: u64 = 0x1000;
const CMD_MARGIN: u64 = 0x400;
const MTXMSG_MARGIN: u64 = 0x40;
pub const MAX_DECODE_COUNT: u32 = 12;

pub const CMD_REGVALPAIR_WRITE: u32 = 0x1000_0000;
pub const CMD_DMA: u32 = 0x3000_0000;
pub const CMD_RENDEC_BLOCK: u32 = 0x5000_0000;
pub const CMD_COMPLETION: u32 = 0x6000_0000;
pub const CMD_CONDITIONAL_SKIP: u32 = 0x8000_0000;
pub const CMD_CTRL_ALLOC_HEADER: u32 = 0x9000_0000;
pub const CMD_SR_SETUP: u32 = 0xb000_0000;
pub const CMD_BITSTREAM_DMA: u32 = 0xd000_0000;
pub const CMD_DMA_OFFSET_FLAG: u32 = 0x0010_0000;

/// Skip condition: skip the block when the firmware switched contexts.
pub const SKIP_ON_CONTEXT_SWITCH: u32 = 1;

pub const DECODE_MSG_SIZE: u64 = 32;
pub const MSG_ID_RENDER: u32 = 0x10;
const MSG_CTRL_ALLOC_ADDR_OFFSET: u64 = 8;
const MSG_FLAGS_OFFSET: u64 = 28;

pub const FW_ERROR_DETECTION_AND_RECOVERY: u16 = 0x0100;
pub const FW_VA_RENDER_NO_RESPONCE_MSG: u16 = 0x2000;
pub const FW_VA_RENDER_HOST_INT: u16 = 0x4000;

const MAX_DMA_LEN: u32 = 0xffff;
const MAX_RENDEC_DWORDS: u64 = 0xff + 1;
const MAX_SKIP_DWORDS: u64 = 0x000f_ffff;

/// Destination of a `dma_write_execbuf` transfer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum DmaType {
    VlcTable = 0x0001_0000,
    ProbabilityData = 0x0002_0000,
}

/// Firmware message describing one decode region.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct DecodeMessage {
    /// Message size in bits 0..7, message id in bits 8..15, region length in dwords above.
    pub header: u32,
    pub mmu_ptd: u32,
    pub ctrl_alloc_addr: u32,
    pub context: u32,
    pub fence: u32,
    pub operating_mode: u32,
    pub mb_range: u32,
    pub flags: u32,
}

impl DecodeMessage {
    pub fn region_dwords(&self) -> u32 {
        self.header >> 16
    }
}

struct RegBlock {
    flags: u32,
    write_offset: u64,
    header: Option<u64>,
    next_reg: u32,
}

struct SkipBlock {
    start: u64,
    condition: u32,
}

pub struct VedExecBuffer {
    cmd: GenericExecBuffer,
    msg: Option<Bo>,
    msg_offset: u64,
    decode_count: u32,
    last_decode_flags: Option<u64>,
    bitstream_size: Option<u64>,
    reg: Option<RegBlock>,
    rendec_start: Option<u64>,
    skip: Option<SkipBlock>,
}

impl VedExecBuffer {
    /// Acquires the command and message buffers for `hw_context`.
    pub fn acquire(
        bufmgr: &dyn BufferManager,
        hw_context: &HwContext,
        reusable: bool,
    ) -> Result<VedExecBuffer> {
        let cmd = GenericExecBuffer::acquire(bufmgr, hw_context, CMD_BUFFER_NAME, CMD_SIZE, reusable)?;
        let params = AllocParams::new(MSG_BUFFER_NAME, MTXMSG_SIZE)
            .cache(CachePolicy::WriteCombine)
            .reusable(reusable);
        // On failure `cmd` is dropped, which puts it.
        let msg = bufmgr
            .alloc(Some(hw_context), params)
            .map_err(Error::ExecBufferAcquire)?;
        msg.map(true).map_err(Error::ExecBufferAcquire)?;
        Ok(VedExecBuffer {
            cmd,
            msg: Some(msg),
            msg_offset: 0,
            decode_count: 0,
            last_decode_flags: None,
            bitstream_size: None,
            reg: None,
            rendec_start: None,
            skip: None,
        })
    }

    fn msg(&self) -> Result<&Bo> {
        self.msg.as_ref().ok_or(Error::ExecBufferReleased)
    }

    pub fn cmd_buffer(&self) -> Option<&Bo> {
        self.cmd.buffer()
    }

    pub fn msg_buffer(&self) -> Option<&Bo> {
        self.msg.as_ref()
    }

    pub fn cur_offset(&self) -> u64 {
        self.cmd.cur_offset()
    }

    pub fn start_offset(&self) -> u64 {
        self.cmd.start_offset()
    }

    pub fn msg_offset(&self) -> u64 {
        self.msg_offset
    }

    pub fn decode_count(&self) -> u32 {
        self.decode_count
    }

    /// Reserves `len` bytes of command space and returns their offset.
    pub fn alloc_space(&mut self, len: u64) -> Result<u64> {
        self.cmd.alloc_space(len)
    }

    pub fn write_u32_at(&mut self, offset: u64, value: u32) -> Result<()> {
        self.cmd.write_u32_at(offset, value)
    }

    pub fn read_u32_at(&self, offset: u64) -> Result<u32> {
        self.cmd.read_u32_at(offset)
    }

    pub fn emit(&mut self, value: u32) -> Result<()> {
        self.cmd.emit(value)
    }

    pub fn reloc(&mut self, target: &Bo, offset: u64, delta: u64, flags: u32) -> Result<()> {
        self.cmd.reloc(target, offset, delta, flags)
    }

    pub fn full(&self) -> bool {
        if self.msg.is_none() {
            return false;
        }
        self.decode_count >= MAX_DECODE_COUNT
            || MTXMSG_SIZE.saturating_sub(self.msg_offset) < MTXMSG_MARGIN
            || self.cmd.size().saturating_sub(self.cmd.cur_offset()) < CMD_MARGIN
    }

    pub fn ready(&self) -> bool {
        self.cmd.ready() && self.msg.as_ref().map_or(false, |bo| !bo.busy())
    }

    /// Unmaps both buffers and submits the queued decode messages.
    pub fn run(&mut self) -> Result<()> {
        let msg = self.msg()?;
        let cmd = self.cmd.buffer().ok_or(Error::ExecBufferReleased)?;
        debug!(
            "submitting {} decode messages ({} bytes) on context {}",
            self.decode_count,
            self.msg_offset,
            self.cmd.hw_context_id()
        );
        if self.msg_offset > 0 {
            let mut batch = vec![0u8; self.msg_offset as usize];
            if msg.read_at(0, &mut batch).is_ok() {
                trace!("{}", dump::describe_batch(&batch));
            }
        }
        msg.unmap()?;
        cmd.unmap()?;
        if self.msg_offset == 0 {
            debug!("no decode messages, skipping submission");
            return Ok(());
        }
        if let Err(e) = msg.submit(0, self.msg_offset, -1) {
            error!("failed to submit {}: {}", MSG_BUFFER_NAME, e);
            return Err(e.into());
        }
        Ok(())
    }

    /// Releases both buffers. Safe to call more than once.
    pub fn put(&mut self) {
        if let Some(msg) = self.msg.take() {
            if let Err(e) = msg.unmap() {
                error!("failed to unmap {}: {}", MSG_BUFFER_NAME, e);
            }
        }
        self.cmd.put();
        self.msg_offset = 0;
        self.decode_count = 0;
        self.last_decode_flags = None;
        self.bitstream_size = None;
        self.reg = None;
        self.rendec_start = None;
        self.skip = None;
    }

    pub fn add_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::FeDecode(arg) => self.add_decode(&arg),
            Command::HostBeOpp => Err(Error::Unimplemented("host back-end opp")),
            Command::HwDeblock => Err(Error::Unimplemented("hardware deblock")),
        }
    }

    fn add_decode(&mut self, arg: &FeDecodeArg) -> Result<()> {
        let cmd_bo = self.cmd.buffer().ok_or(Error::ExecBufferReleased)?;
        let msg = self.msg()?;
        let start = self.cmd.start_offset();
        let region = self.cmd.cur_offset() - start;
        let msg_offset = self.msg_offset;
        if msg_offset + DECODE_MSG_SIZE > MTXMSG_SIZE {
            return Err(Error::OutOfSpace {
                offset: msg_offset,
                len: DECODE_MSG_SIZE,
                size: MTXMSG_SIZE,
            });
        }

        // Only the last message of a batch raises the completion interrupt.
        if let Some(flags_offset) = self.last_decode_flags {
            let mut raw = [0u8; 2];
            msg.read_at(flags_offset, &mut raw)?;
            let mut flags = u16::from_le_bytes(raw);
            flags &= !FW_VA_RENDER_HOST_INT;
            flags |= FW_VA_RENDER_NO_RESPONCE_MSG;
            msg.write_at(flags_offset, &flags.to_le_bytes())?;
        }

        let mut flags = arg.flags;
        if arg.ec_enabled != 0 {
            flags |= FW_ERROR_DETECTION_AND_RECOVERY;
        }
        flags |= FW_VA_RENDER_HOST_INT;

        let message = DecodeMessage {
            header: (DECODE_MSG_SIZE as u32) | (MSG_ID_RENDER << 8) | (((region / 4) as u32) << 16),
            mmu_ptd: 0,
            ctrl_alloc_addr: cmd_bo.device_address().wrapping_add(start) as u32,
            context: self.cmd.hw_context_id() & 0xff,
            fence: 0,
            operating_mode: arg.operating_mode,
            mb_range: 0,
            flags: flags as u32,
        };
        if let Err(e) = msg.emit_reloc(msg_offset + MSG_CTRL_ALLOC_ADDR_OFFSET, cmd_bo, start, 0) {
            error!("failed to relocate decode message at {:#x}: {}", msg_offset, e);
            return Err(e.into());
        }
        msg.write_at(msg_offset, message.as_bytes())?;
        trace!(
            "decode message {}: {} dwords at {:#x}, flags {:#06x}",
            self.decode_count,
            region / 4,
            start,
            flags
        );

        self.last_decode_flags = Some(msg_offset + MSG_FLAGS_OFFSET);
        self.msg_offset += DECODE_MSG_SIZE;
        let cur = self.cmd.cur_offset();
        self.cmd.set_start_offset(cur);
        self.decode_count += 1;
        Ok(())
    }

    /// Opens a register block. `flags` are shifted into the header's flag field.
    pub fn reg_start_block(&mut self, flags: u32) -> Result<()> {
        if self.reg.is_some() {
            return Err(Error::BlockOpen("register"));
        }
        self.reg = Some(RegBlock {
            flags: flags << 4,
            write_offset: self.cmd.cur_offset(),
            header: None,
            next_reg: 0,
        });
        Ok(())
    }

    // Extends or starts a register-pair header for `reg`; returns where its value goes.
    fn reg_value_slot(&mut self, reg: u32) -> Result<u64> {
        let block = self.reg.as_mut().ok_or(Error::BlockNotOpen("register"))?;
        match block.header {
            Some(header) if reg == block.next_reg => {
                let count = self.cmd.read_u32_at(header)?;
                self.cmd.write_u32_at(header, count.wrapping_add(1 << 16))?;
            }
            _ => {
                let header = block.write_offset;
                self.cmd.write_u32_at(
                    header,
                    CMD_REGVALPAIR_WRITE | block.flags | 0x10000 | (reg & 0xfffff),
                )?;
                block.header = Some(header);
                block.write_offset += 4;
            }
        }
        let slot = block.write_offset;
        // Checked before the cursor moves so a failed write leaves the block consistent.
        self.cmd.write_u32_at(slot, 0)?;
        block.write_offset += 4;
        block.next_reg = reg.wrapping_add(4);
        Ok(slot)
    }

    pub fn reg_set(&mut self, reg: u32, value: u32) -> Result<()> {
        let slot = self.reg_value_slot(reg)?;
        self.cmd.write_u32_at(slot, value)
    }

    pub fn reg_set_address(&mut self, reg: u32, target: &Bo, offset: u64) -> Result<()> {
        let slot = self.reg_value_slot(reg)?;
        self.cmd.reloc(target, slot, offset, 0)
    }

    /// Closes the register block and moves the cursor past it.
    pub fn reg_end_block(&mut self) -> Result<()> {
        let block = self.reg.take().ok_or(Error::BlockNotOpen("register"))?;
        self.cmd.set_cur_offset(block.write_offset);
        Ok(())
    }

    /// Opens a rendec block targeting `dest`.
    pub fn rendec_start(&mut self, dest: u32) -> Result<()> {
        if self.rendec_start.is_some() {
            return Err(Error::BlockOpen("rendec"));
        }
        if (dest >> 2) & !0xfff != 0 {
            return Err(Error::RendecAddress(dest));
        }
        let start = self.cmd.cur_offset();
        self.cmd.emit(CMD_RENDEC_BLOCK | dest)?;
        self.rendec_start = Some(start);
        Ok(())
    }

    pub fn rendec_write(&mut self, value: u32) -> Result<()> {
        self.cmd.emit(value)
    }

    /// Writes `block` as little-endian words.
    pub fn rendec_write_block(&mut self, block: &[u8]) -> Result<()> {
        if block.len() % 4 != 0 {
            return Err(Error::InvalidParameter("rendec block length"));
        }
        let len = block.len() as u64;
        let cur = self.cmd.cur_offset();
        if cur + len > self.cmd.size() {
            return Err(Error::OutOfSpace {
                offset: cur,
                len,
                size: self.cmd.size(),
            });
        }
        for word in block.chunks_exact(4) {
            self.cmd
                .emit(u32::from_le_bytes([word[0], word[1], word[2], word[3]]))?;
        }
        Ok(())
    }

    pub fn rendec_write_address(&mut self, target: &Bo, offset: u64, flags: u32) -> Result<()> {
        self.cmd.emit_reloc(target, offset, flags)
    }

    /// Closes the rendec block and patches its dword count into the header.
    pub fn rendec_end(&mut self) -> Result<()> {
        let start = self.rendec_start.take().ok_or(Error::BlockNotOpen("rendec"))?;
        let dword_count = (self.cmd.cur_offset() - start) / 4;
        if dword_count > MAX_RENDEC_DWORDS {
            return Err(Error::RendecBlockTooLarge(dword_count));
        }
        let header = self.cmd.read_u32_at(start)?;
        self.cmd
            .write_u32_at(start, header + (((dword_count - 1) as u32) << 16))
    }

    /// Opens a block the firmware skips when `condition` holds.
    pub fn skip_start_block(&mut self, condition: u32) -> Result<()> {
        if self.rendec_start.is_some() {
            return Err(Error::BlockOpen("rendec"));
        }
        if self.reg.is_some() {
            return Err(Error::BlockOpen("register"));
        }
        if self.skip.is_some() {
            return Err(Error::BlockOpen("skip"));
        }
        let start = self.cmd.cur_offset();
        self.cmd.emit(0)?;
        self.skip = Some(SkipBlock { start, condition });
        Ok(())
    }

    /// Closes the skip block and writes its header.
    pub fn skip_end_block(&mut self) -> Result<()> {
        if self.rendec_start.is_some() {
            return Err(Error::BlockOpen("rendec"));
        }
        if self.reg.is_some() {
            return Err(Error::BlockOpen("register"));
        }
        let block = self.skip.take().ok_or(Error::BlockNotOpen("skip"))?;
        let block_size = (self.cmd.cur_offset() - (block.start + 4)) / 4;
        if block_size > MAX_SKIP_DWORDS {
            return Err(Error::SkipBlockTooLarge(block_size));
        }
        self.cmd.write_u32_at(
            block.start,
            CMD_CONDITIONAL_SKIP | (block.condition << 20) | block_size as u32,
        )
    }

    /// Points the entropy decoder at `size` bytes of `bitstream` starting at `offset`.
    pub fn dma_write_bitstream(
        &mut self,
        bitstream: &Bo,
        offset: u64,
        size: u32,
        offset_in_bits: u32,
        flags: u32,
    ) -> Result<()> {
        let start = self.cmd.alloc_space(20)?;
        self.cmd.write_u32_at(start, CMD_SR_SETUP | flags)?;
        self.cmd.write_u32_at(start + 4, offset_in_bits)?;
        self.cmd.write_u32_at(start + 8, size)?;
        self.cmd.write_u32_at(start + 12, CMD_BITSTREAM_DMA | size)?;
        self.cmd.reloc(bitstream, start + 16, offset, 0)?;
        self.bitstream_size = Some(start + 8);
        Ok(())
    }

    /// Continues the last bitstream transfer with `size` more bytes from another buffer.
    pub fn dma_write_bitstream_chained(&mut self, bitstream: &Bo, size: u32) -> Result<()> {
        let size_offset = self.bitstream_size.ok_or(Error::BlockNotOpen("bitstream"))?;
        let start = self.cmd.alloc_space(8)?;
        self.cmd.write_u32_at(start, CMD_BITSTREAM_DMA | size)?;
        self.cmd.reloc(bitstream, start + 4, 0, 0)?;
        let total = self.cmd.read_u32_at(size_offset)?;
        self.cmd.write_u32_at(size_offset, total.wrapping_add(size))
    }

    /// Queues a DMA of `size` bytes from `source` into an engine table.
    pub fn dma_write_execbuf(
        &mut self,
        source: &Bo,
        offset: u32,
        size: u32,
        dest_offset: u32,
        dma_type: DmaType,
    ) -> Result<()> {
        if size >= MAX_DMA_LEN || offset >= MAX_DMA_LEN {
            return Err(Error::DmaTooLarge { offset, size });
        }
        let cmd = CMD_DMA | dma_type as u32 | size;
        if dest_offset == 0 {
            let start = self.cmd.alloc_space(8)?;
            self.cmd.write_u32_at(start, cmd)?;
            self.cmd.reloc(source, start + 4, offset as u64, 0)
        } else {
            let start = self.cmd.alloc_space(12)?;
            self.cmd.write_u32_at(start, cmd | CMD_DMA_OFFSET_FLAG)?;
            self.cmd.reloc(source, start + 4, offset as u64, 0)?;
            self.cmd.write_u32_at(start + 8, dest_offset)
        }
    }
}

impl Drop for VedExecBuffer {
    fn drop(&mut self) {
        self.put();
    }
}
