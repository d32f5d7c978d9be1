// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Variable-length decode on the VED engine.
//!
//! Slice parameter buffers are queued until the slice data they describe arrives. Each slice
//! gets a control-allocation header, a register block pointing the engine at the render target,
//! a bitstream DMA, the alternative-output setup and a completion kick, and is closed into one
//! `FE_DECODE` firmware message. A slice may arrive in several data buffers flagged
//! BEGIN / MIDDLE / END; its bitstream DMA is then chained across them.
//!
//! When the execution buffer fills up it is submitted under the hardware lock and a fresh one is
//! acquired, so a picture may span several submissions.

use std::collections::BTreeMap;
use std::mem::offset_of;

use base::debug;
use base::error;
use base::trace;
use base::warn;
use bufmgr::AllocParams;
use bufmgr::Bo;
use bufmgr::CachePolicy;
use object_heap::Handle;
use object_heap::ObjectHeap;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

use crate::driver::BufferObject;
use crate::driver::BufferType;
use crate::driver::ConfigAttrib;
use crate::driver::ConfigObject;
use crate::driver::Entrypoint;
use crate::driver::Profile;
use crate::error::Error;
use crate::error::Result;
use crate::execbuf::ved::CMD_COMPLETION;
use crate::execbuf::ved::CMD_CTRL_ALLOC_HEADER;
use crate::execbuf::Command;
use crate::execbuf::ExecBuffer;
use crate::execbuf::FeDecodeArg;
use crate::execbuf::VedExecBuffer;
use crate::format::FormatContext;
use crate::format::FormatPlugin;
use crate::format::PictureEnv;

pub const AUX_LINE_BUFFER_NAME: &str = "VED-aux_line_buffer_vld";
pub const AUX_LINE_BUFFER_SIZE: u64 = 1024 * 152;
const COLOCATED_BYTES_PER_MB: u64 = 64;

pub const SLICE_DATA_FLAG_ALL: u32 = 0x00;
pub const SLICE_DATA_FLAG_BEGIN: u32 = 0x01;
pub const SLICE_DATA_FLAG_MIDDLE: u32 = 0x02;
pub const SLICE_DATA_FLAG_END: u32 = 0x04;

// Rendec destinations.
const RENDEC_AUX_LINE_BUFFER_BASE: u32 = 0x0640;
const RENDEC_ALT_OUTPUT_ROTATION: u32 = 0x0660;
const ALT_OUTPUT_USE_AUX_LINE_BUF: u32 = 1 << 4;
const EXT_ROW_STRIDE_SHIFT: u32 = 23;

// Front-end registers.
const REG_PICTURE_SIZE: u32 = 0x0300;
const REG_LUMA_BASE: u32 = 0x0304;
const REG_CHROMA_BASE: u32 = 0x0308;
const REG_COLOCATED_BASE: u32 = 0x030c;

/// Leading fields shared by the slice parameter structures of every codec.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct SliceParamBase {
    pub slice_data_size: u32,
    pub slice_data_offset: u32,
    pub slice_data_flag: u32,
}

/// Front-end state header opening every slice in the command stream.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct CtrlAllocHeader {
    pub cmd: u32,
    pub extern_state_buff_addr: u32,
    pub macroblock_param_addr: u32,
    pub slice_params: u32,
    pub slice_first_pic_last: u32,
    pub alt_output_addr: [u32; 2],
    pub alt_output_flags: u32,
}

/// Decodes `VP8Version0_3` through the VLD entrypoint.
pub struct VldPlugin;

impl FormatPlugin for VldPlugin {
    fn query_config_attributes(
        &self,
        _profile: Profile,
        _entrypoint: Entrypoint,
        _attributes: &mut [ConfigAttrib],
    ) {
        // The generic answers hold.
    }

    fn validate_config(&self, config: &ConfigObject) -> Result<()> {
        if config.profile != Profile::VP8Version0_3 {
            return Err(Error::UnsupportedProfile(config.profile));
        }
        if config.entrypoint != Entrypoint::VLD {
            return Err(Error::UnsupportedEntrypoint(config.entrypoint));
        }
        Ok(())
    }

    fn create_context(&self, env: &PictureEnv) -> Result<Box<dyn FormatContext>> {
        Ok(Box::new(VldContext::new(env.num_render_targets)))
    }
}

struct ColocatedBuffer {
    surface: Handle,
    bo: Bo,
}

pub struct VldContext {
    execbuf: Option<ExecBuffer>,
    aux_line_buffer: Option<Bo>,
    colocated: Vec<ColocatedBuffer>,
    slice_params: Vec<Handle>,
    params: BTreeMap<BufferType, Vec<u8>>,
    /// Offset of the header of the slice being built.
    header: Option<u64>,
    split_pending: bool,
}

fn ved(execbuf: &mut Option<ExecBuffer>) -> Result<&mut VedExecBuffer> {
    execbuf
        .as_mut()
        .and_then(ExecBuffer::as_ved_mut)
        .ok_or(Error::ExecBufferReleased)
}

fn acquire_execbuf(env: &PictureEnv) -> Result<ExecBuffer> {
    VedExecBuffer::acquire(env.bufmgr, env.hw_context, true)
        .map(ExecBuffer::Ved)
        .map_err(|e| Error::HwBusy(Box::new(e)))
}

/// Runs `execbuf` under the hardware lock and releases it.
fn submit(env: &PictureEnv, mut execbuf: ExecBuffer) -> Result<()> {
    let ran = {
        let _guard = env.hw_lock.lock();
        execbuf.run()
    };
    execbuf.put();
    ran
}

/// Copies out every element of the queued slice parameter buffers, in queue order.
fn read_slice_params(
    buffers: &ObjectHeap<BufferObject>,
    handles: &[Handle],
) -> Result<Vec<SliceParamBase>> {
    let mut params = Vec::new();
    for &handle in handles {
        let obj = buffers
            .get_retained(handle)
            .ok_or(Error::InvalidBuffer(handle))?;
        let stride = obj.size() as usize;
        for index in 0..obj.num_elements() as usize {
            let (param, _) = obj
                .data()
                .get(index * stride..)
                .and_then(|bytes| SliceParamBase::read_from_prefix(bytes).ok())
                .ok_or(Error::InvalidParameter("slice parameter buffer too small"))?;
            params.push(param);
        }
    }
    Ok(params)
}

impl VldContext {
    pub fn new(num_render_targets: usize) -> VldContext {
        VldContext {
            execbuf: None,
            aux_line_buffer: None,
            colocated: Vec::with_capacity(num_render_targets),
            slice_params: Vec::new(),
            params: BTreeMap::new(),
            header: None,
            split_pending: false,
        }
    }

    /// Makes sure the render target has a co-located buffer large enough for the picture.
    fn allocate_colocated(&mut self, env: &PictureEnv, surface: Handle) -> Result<()> {
        let mbs = u64::from(env.picture_width.div_ceil(16))
            * u64::from(env.picture_height.div_ceil(16));
        let size = mbs * COLOCATED_BYTES_PER_MB;
        let index = match self.colocated.iter().position(|c| c.surface == surface) {
            Some(index) if self.colocated[index].bo.size() >= size => return Ok(()),
            Some(index) => index,
            None if self.colocated.len() >= env.num_render_targets => {
                return Err(Error::MaxNumExceeded("co-located buffers"));
            }
            None => self.colocated.len(),
        };
        let name = format!("VED-colocated_buffer_{}", index);
        let params = AllocParams::new(&name, size).cache(CachePolicy::Uncached);
        let bo = env.bufmgr.alloc(Some(env.hw_context), params)?;
        debug!("{} for surface {}: {} bytes", name, surface, size);
        match self.colocated.get_mut(index) {
            Some(entry) => entry.bo = bo,
            None => self.colocated.push(ColocatedBuffer { surface, bo }),
        }
        Ok(())
    }

    fn process_slice_data(
        &mut self,
        env: &PictureEnv,
        handle: Handle,
        obj: &BufferObject,
    ) -> Result<()> {
        if !self.params.contains_key(&BufferType::PictureParameter) {
            return Err(Error::InvalidParameter("slice data before picture parameters"));
        }
        if self.slice_params.is_empty() {
            return Err(Error::InvalidParameter("slice data without slice parameters"));
        }
        let bo = match obj.bo() {
            Some(bo) if obj.size() != 0 => bo,
            _ => return Err(Error::MissingSliceData(handle)),
        };
        let params = read_slice_params(env.buffers, &self.slice_params);
        self.slice_params.clear();
        for param in params? {
            self.process_slice(env, &param, bo)?;
        }
        Ok(())
    }

    fn process_slice(&mut self, env: &PictureEnv, param: &SliceParamBase, data: &Bo) -> Result<()> {
        let in_bounds = param
            .slice_data_offset
            .checked_add(param.slice_data_size)
            .is_some_and(|end| u64::from(end) <= data.size());
        if !in_bounds {
            return Err(Error::InvalidParameter("slice extends past its data buffer"));
        }
        let flag = param.slice_data_flag;
        match flag {
            SLICE_DATA_FLAG_ALL | SLICE_DATA_FLAG_BEGIN => {
                if self.split_pending {
                    return Err(Error::SplitSlice("new slice while a split slice is pending"));
                }
                self.begin_slice(env, param, data)?;
                self.split_pending = flag == SLICE_DATA_FLAG_BEGIN;
            }
            SLICE_DATA_FLAG_MIDDLE | SLICE_DATA_FLAG_END => {
                if !self.split_pending {
                    return Err(Error::SplitSlice("continuation without a pending slice"));
                }
                if param.slice_data_offset != 0 {
                    return Err(Error::SplitSlice("continuation must start at offset zero"));
                }
                if param.slice_data_size != 0 {
                    ved(&mut self.execbuf)?.dma_write_bitstream_chained(data, param.slice_data_size)?;
                }
            }
            _ => return Err(Error::InvalidParameter("unknown slice data flag")),
        }
        if flag == SLICE_DATA_FLAG_ALL || flag == SLICE_DATA_FLAG_END {
            self.end_slice(env)?;
        }
        Ok(())
    }

    /// Writes the front-end header, the target registers and the bitstream DMA.
    fn begin_slice(&mut self, env: &PictureEnv, param: &SliceParamBase, data: &Bo) -> Result<()> {
        let (target, surface) = env
            .render_surface()
            .ok_or(Error::InvalidParameter("no render target"))?;
        let colocated = self
            .colocated
            .iter()
            .find(|c| c.surface == target)
            .map(|c| &c.bo);
        let execbuf = ved(&mut self.execbuf)?;

        let mb_width = env.picture_width.div_ceil(16);
        let mb_height = env.picture_height.div_ceil(16);
        let header = CtrlAllocHeader {
            cmd: CMD_CTRL_ALLOC_HEADER,
            slice_first_pic_last: ((mb_height - 1) & 0xff) << 8 | ((mb_width - 1) & 0xff),
            ..Default::default()
        };
        let words: [u32; 8] = zerocopy::transmute!(header);
        let header_offset = execbuf.alloc_space(header.as_bytes().len() as u64)?;
        for (index, word) in words.iter().enumerate() {
            execbuf.write_u32_at(header_offset + 4 * index as u64, *word)?;
        }

        execbuf.reg_start_block(0)?;
        execbuf.reg_set(
            REG_PICTURE_SIZE,
            (env.picture_height - 1) << 16 | (env.picture_width - 1),
        )?;
        execbuf.reg_set_address(REG_LUMA_BASE, surface.bo(), 0)?;
        execbuf.reg_set_address(REG_CHROMA_BASE, surface.bo(), surface.chroma_offset())?;
        if let Some(colocated) = colocated {
            execbuf.reg_set_address(REG_COLOCATED_BASE, colocated, 0)?;
        }
        execbuf.reg_end_block()?;

        trace!(
            "slice data from {} at {:#x}, {} bytes",
            data.handle(),
            param.slice_data_offset,
            param.slice_data_size
        );
        execbuf.dma_write_bitstream(
            data,
            u64::from(param.slice_data_offset),
            param.slice_data_size,
            0,
            0,
        )?;
        self.header = Some(header_offset);
        Ok(())
    }

    /// Programs the alternative output, kicks the engine and closes the slice into a decode
    /// message. Flushes the execution buffer if that filled it.
    fn end_slice(&mut self, env: &PictureEnv) -> Result<()> {
        let (_, surface) = env
            .render_surface()
            .ok_or(Error::InvalidParameter("no render target"))?;
        let aux = self
            .aux_line_buffer
            .as_ref()
            .ok_or(Error::InvalidParameter("no picture in progress"))?;
        let header = self.header.take().ok_or(Error::BlockNotOpen("slice"))?;
        let execbuf = ved(&mut self.execbuf)?;

        execbuf.rendec_start(RENDEC_AUX_LINE_BUFFER_BASE)?;
        execbuf.rendec_write_address(aux, 0, 0)?;
        execbuf.rendec_end()?;

        let rotation = ALT_OUTPUT_USE_AUX_LINE_BUF;
        execbuf.rendec_start(RENDEC_ALT_OUTPUT_ROTATION)?;
        execbuf.rendec_write(rotation)?;
        execbuf.rendec_write((surface.stride() / 64) << EXT_ROW_STRIDE_SHIFT)?;
        execbuf.rendec_end()?;
        execbuf.write_u32_at(
            header + offset_of!(CtrlAllocHeader, alt_output_flags) as u64,
            rotation,
        )?;

        execbuf.rendec_write(CMD_COMPLETION)?;
        self.split_pending = false;

        let arg = FeDecodeArg::new(env.ec_enabled, 0, env.operating_mode);
        let execbuf = self.execbuf.as_mut().ok_or(Error::ExecBufferReleased)?;
        execbuf.add_command(Command::FeDecode(arg))?;
        if execbuf.full() {
            self.flush(env)?;
        }
        Ok(())
    }

    /// Submits the full execution buffer and acquires a fresh one.
    fn flush(&mut self, env: &PictureEnv) -> Result<()> {
        let execbuf = self.execbuf.take().ok_or(Error::ExecBufferReleased)?;
        debug!("execution buffer full, flushing");
        submit(env, execbuf)?;
        match acquire_execbuf(env) {
            Ok(execbuf) => {
                self.execbuf = Some(execbuf);
                Ok(())
            }
            Err(e) => {
                error!("failed to re-acquire execution buffer: {}", e);
                Err(e)
            }
        }
    }
}

impl FormatContext for VldContext {
    fn begin_picture(&mut self, env: &PictureEnv) -> Result<()> {
        let target = env
            .render_target
            .ok_or(Error::InvalidParameter("no render target"))?;
        self.params.clear();
        self.slice_params.clear();
        self.split_pending = false;
        self.header = None;

        let params = AllocParams::new(AUX_LINE_BUFFER_NAME, AUX_LINE_BUFFER_SIZE)
            .cache(CachePolicy::Uncached)
            .reusable(true);
        let aux = env.bufmgr.alloc(Some(env.hw_context), params)?;
        self.allocate_colocated(env, target)?;
        let execbuf = match acquire_execbuf(env) {
            Ok(execbuf) => execbuf,
            Err(e) => {
                error!("no execution buffer for picture: {}", e);
                return Err(e);
            }
        };
        self.aux_line_buffer = Some(aux);
        self.execbuf = Some(execbuf);
        Ok(())
    }

    fn render_picture(&mut self, env: &PictureEnv, buffers: &[Handle]) -> Result<()> {
        for &handle in buffers {
            let obj = env.buffers.get(handle).ok_or(Error::InvalidBuffer(handle))?;
            match obj.buffer_type() {
                BufferType::SliceParameter => self.slice_params.push(handle),
                BufferType::SliceData | BufferType::ProtectedSliceData => {
                    self.process_slice_data(env, handle, obj)?
                }
                buffer_type @ (BufferType::PictureParameter
                | BufferType::IQMatrix
                | BufferType::QMatrix
                | BufferType::HuffmanTable
                | BufferType::Probability) => {
                    self.params.insert(buffer_type, obj.data().to_vec());
                }
                other => return Err(Error::UnsupportedBufferType(other as u32)),
            }
        }
        Ok(())
    }

    fn end_picture(&mut self, env: &PictureEnv) -> Result<()> {
        if self.split_pending {
            warn!("picture ended inside a split slice");
            self.split_pending = false;
        }
        self.slice_params.clear();
        self.header = None;
        let result = match self.execbuf.take() {
            Some(execbuf) => submit(env, execbuf),
            None => {
                warn!("no execution buffer at the end of the picture");
                Ok(())
            }
        };
        self.aux_line_buffer = None;
        result
    }

    fn destroy_context(&mut self, _env: &PictureEnv) {
        if let Some(mut execbuf) = self.execbuf.take() {
            execbuf.put();
        }
        self.aux_line_buffer = None;
        self.colocated.clear();
        self.slice_params.clear();
        self.params.clear();
        self.header = None;
        self.split_pending = false;
    }
}
