// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Replays a synthetic VP8 decode session against the in-memory buffer manager and dumps the
//! firmware messages it produced.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use argh::FromArgs;
use base::info;
use base::syslog;
use base::syslog::LogConfig;
use bufmgr::fake::FakeBufferManager;
use ipvr::driver::BufferType;
use ipvr::driver::Entrypoint;
use ipvr::driver::Profile;
use ipvr::driver::SurfaceMemory;
use ipvr::driver::CONTEXT_FLAG_PROGRESSIVE;
use ipvr::driver::RT_FORMAT_YUV420;
use ipvr::execbuf::dump;
use ipvr::vld::SliceParamBase;
use ipvr::vld::SLICE_DATA_FLAG_ALL;
use ipvr::vld::SLICE_DATA_FLAG_BEGIN;
use ipvr::vld::SLICE_DATA_FLAG_END;
use ipvr::Driver;
use ipvr::DriverConfig;
use object_heap::Handle;
use zerocopy::IntoBytes;

const PICTURE_PARAMETER_SIZE: u32 = 64;

#[derive(FromArgs)]
/// Decode synthetic VP8 frames and print the submitted firmware messages.
struct Args {
    /// JSON driver config; defaults apply when absent
    #[argh(option)]
    config: Option<PathBuf>,
    /// picture width in pixels
    #[argh(option, default = "320")]
    width: u32,
    /// picture height in pixels
    #[argh(option, default = "240")]
    height: u32,
    /// number of frames to decode
    #[argh(option, default = "2")]
    frames: u32,
    /// slices per frame
    #[argh(option, default = "3")]
    slices: u32,
    /// bytes of bitstream per slice
    #[argh(option, default = "1024")]
    slice_size: u32,
    /// render targets to cycle through
    #[argh(option, default = "4")]
    surfaces: usize,
    /// deliver every slice as two halves in separate data buffers
    #[argh(switch)]
    split: bool,
}

/// Queues one slice parameter buffer and the data buffers it describes.
fn render_slice(
    driver: &mut Driver,
    context: Handle,
    bitstream: &[u8],
    split: bool,
) -> anyhow::Result<()> {
    let size = bitstream.len() as u32;
    let pieces: Vec<(SliceParamBase, &[u8])> = if split && size >= 2 {
        let (head, tail) = bitstream.split_at(bitstream.len() / 2);
        vec![
            (slice_param(head.len() as u32, SLICE_DATA_FLAG_BEGIN), head),
            (slice_param(tail.len() as u32, SLICE_DATA_FLAG_END), tail),
        ]
    } else {
        vec![(slice_param(size, SLICE_DATA_FLAG_ALL), bitstream)]
    };
    for (param, data) in pieces {
        let param = driver.create_buffer(
            context,
            BufferType::SliceParameter,
            std::mem::size_of::<SliceParamBase>() as u32,
            1,
            Some(param.as_bytes()),
        )?;
        let data = driver.create_buffer(
            context,
            BufferType::SliceData,
            data.len() as u32,
            1,
            Some(data),
        )?;
        driver
            .render_picture(context, &[param, data])
            .context("failed to render slice")?;
    }
    Ok(())
}

fn slice_param(size: u32, flag: u32) -> SliceParamBase {
    SliceParamBase {
        slice_data_size: size,
        slice_data_offset: 0,
        slice_data_flag: flag,
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let settings = match &args.config {
        Some(path) => DriverConfig::from_file(path)?,
        None => DriverConfig::default(),
    };
    syslog::init_with(LogConfig {
        filter: settings.log_filter.clone(),
        proc_name: String::from("ipvr_replay"),
        ..Default::default()
    })
    .context("failed to initialize logging")?;

    let bufmgr = Arc::new(FakeBufferManager::new());
    let mut driver = Driver::new(bufmgr.clone(), settings);
    let config = driver
        .create_config(Profile::VP8Version0_3, Entrypoint::VLD, &[])
        .context("failed to create config")?;
    let surfaces = driver
        .create_surfaces(
            RT_FORMAT_YUV420,
            args.width,
            args.height,
            args.surfaces.max(1),
            SurfaceMemory::Native,
        )
        .context("failed to create surfaces")?;
    let context = driver
        .create_context(
            config,
            args.width,
            args.height,
            CONTEXT_FLAG_PROGRESSIVE,
            &surfaces,
        )
        .context("failed to create context")?;

    for frame in 0..args.frames {
        let target = surfaces[frame as usize % surfaces.len()];
        driver
            .begin_picture(context, target)
            .with_context(|| format!("failed to begin frame {}", frame))?;
        let picture = driver.create_buffer(
            context,
            BufferType::PictureParameter,
            PICTURE_PARAMETER_SIZE,
            1,
            None,
        )?;
        driver.render_picture(context, &[picture])?;
        for slice in 0..args.slices {
            let bitstream = vec![(frame + slice) as u8; args.slice_size as usize];
            render_slice(&mut driver, context, &bitstream, args.split)?;
        }
        driver
            .end_picture(context)
            .with_context(|| format!("failed to end frame {}", frame))?;
        driver.sync_surface(target)?;
        driver.set_displaying_surface(target)?;
        info!("frame {} decoded into {}", frame, target);
    }

    for (index, submission) in bufmgr.take_submissions().iter().enumerate() {
        println!(
            "batch {}: {} bytes from {} (fence {})",
            index, submission.len, submission.name, submission.fence
        );
        print!("{}", dump::describe_batch(&submission.data));
    }

    driver.destroy_context(context)?;
    driver.destroy_surfaces(&surfaces)?;
    driver.destroy_config(config)?;
    driver.terminate();
    Ok(())
}

fn main() -> anyhow::Result<()> {
    run(argh::from_env())
}
