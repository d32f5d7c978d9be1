// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::BTreeMap;

use base::debug;
use base::error;
use bufmgr::ContextKind;
use bufmgr::HwContext;
use bufmgr::Tiling;
use bufmgr::TilingParams;
use object_heap::Handle;

use crate::driver::buffer::list_handles;
use crate::driver::buffer::BufferLists;
use crate::driver::BufferType;
use crate::driver::Driver;
use crate::driver::Entrypoint;
use crate::driver::Profile;
use crate::error::Error;
use crate::error::Result;
use crate::format::FormatContext;
use crate::format::PictureEnv;

/// Largest picture dimension accepted for contexts and surfaces.
pub(crate) const MAX_PICTURE_DIMENSION: u32 = 4096;

pub const CONTEXT_FLAG_PROGRESSIVE: u32 = 0x1;

const TILING_SCHEME: u32 = 1;

/// Tile stride code programmed for tiled render targets of the given width.
fn tile_stride(width: u32) -> u32 {
    match width {
        0..=1024 => 0,
        1025..=2048 => 1,
        _ => 2,
    }
}

pub(crate) fn check_dimensions(width: u32, height: u32) -> Result<()> {
    let valid = 1..=MAX_PICTURE_DIMENSION;
    if !valid.contains(&width) || !valid.contains(&height) {
        return Err(Error::ResolutionNotSupported { width, height });
    }
    Ok(())
}

pub struct ContextObject {
    config: Handle,
    profile: Profile,
    entrypoint: Entrypoint,
    picture_width: u32,
    picture_height: u32,
    flags: u32,
    render_targets: Vec<Handle>,
    render_target: Option<Handle>,
    pub(crate) hw_context: HwContext,
    format: Option<Box<dyn FormatContext>>,
    pub(crate) frame_count: u32,
    slice_count: u32,
    operating_mode: u32,
    pub(crate) buffer_lists: BTreeMap<BufferType, BufferLists>,
}

impl ContextObject {
    pub fn config(&self) -> Handle {
        self.config
    }

    pub fn profile(&self) -> Profile {
        self.profile
    }

    pub fn entrypoint(&self) -> Entrypoint {
        self.entrypoint
    }

    pub fn picture_width(&self) -> u32 {
        self.picture_width
    }

    pub fn picture_height(&self) -> u32 {
        self.picture_height
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn render_targets(&self) -> &[Handle] {
        &self.render_targets
    }

    /// The surface of the picture in progress.
    pub fn render_target(&self) -> Option<Handle> {
        self.render_target
    }

    pub fn hw_context_id(&self) -> u32 {
        self.hw_context.id
    }

    /// Pictures completed so far.
    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    /// Slice data buffers rendered into the picture in progress.
    pub fn slice_count(&self) -> u32 {
        self.slice_count
    }

    /// Buffers parked on the unused list of `buffer_type`.
    pub fn unused_count(&self, buffer_type: BufferType) -> usize {
        self.buffer_lists
            .get(&buffer_type)
            .map_or(0, |lists| lists.unused_count)
    }
}

impl Driver {
    fn picture_env<'a>(&'a self, ctx: &'a ContextObject) -> PictureEnv<'a> {
        PictureEnv {
            bufmgr: self.bufmgr.as_ref(),
            hw_context: &ctx.hw_context,
            hw_lock: &self.hw_lock,
            buffers: &self.buffers,
            surfaces: &self.surfaces,
            profile: ctx.profile,
            picture_width: ctx.picture_width,
            picture_height: ctx.picture_height,
            num_render_targets: ctx.render_targets.len(),
            render_target: ctx.render_target,
            ec_enabled: self.settings.ec_enabled,
            operating_mode: ctx.operating_mode,
        }
    }

    /// Runs `f` on the codec state of `context` with a view of the driver.
    fn with_format<R>(
        &mut self,
        context: Handle,
        f: impl FnOnce(&mut dyn FormatContext, &PictureEnv) -> Result<R>,
    ) -> Result<R> {
        let mut format = self
            .contexts
            .get_mut(context)
            .and_then(|ctx| ctx.format.take())
            .ok_or(Error::InvalidContext(context))?;
        let result = match self.contexts.get(context) {
            Some(ctx) => f(format.as_mut(), &self.picture_env(ctx)),
            None => Err(Error::InvalidContext(context)),
        };
        if let Some(ctx) = self.contexts.get_mut(context) {
            ctx.format = Some(format);
        }
        result
    }

    fn release_hw_context(&self, hw_context: HwContext) {
        let id = hw_context.id;
        if let Err(e) = self.bufmgr.hw_context_destroy(hw_context) {
            error!("failed to destroy hw context {}: {}", id, e);
        }
    }

    /// Creates a decode context rendering into `render_targets`, which it claims.
    pub fn create_context(
        &mut self,
        config: Handle,
        picture_width: u32,
        picture_height: u32,
        flags: u32,
        render_targets: &[Handle],
    ) -> Result<Handle> {
        if render_targets.is_empty() {
            return Err(Error::InvalidParameter("context without render targets"));
        }
        check_dimensions(picture_width, picture_height)?;
        let (profile, entrypoint, plugin) = {
            let obj = self.config(config)?;
            (obj.profile, obj.entrypoint, obj.plugin.clone())
        };
        let mut tiling = TilingParams {
            tile_stride: 0,
            tiling_scheme: TILING_SCHEME,
        };
        for &target in render_targets {
            let surface = self
                .surfaces
                .get(target)
                .ok_or(Error::InvalidSurface(target))?;
            if surface.tiling() == Tiling::Tiled {
                tiling.tile_stride = tile_stride(surface.width());
            }
        }

        let hw_context = self
            .bufmgr
            .hw_context_create(ContextKind::Ved, Some(tiling))?;
        let (hw_id, hw_kind) = (hw_context.id, hw_context.kind);
        let obj = ContextObject {
            config,
            profile,
            entrypoint,
            picture_width,
            picture_height,
            flags,
            render_targets: render_targets.to_vec(),
            render_target: None,
            hw_context,
            format: None,
            frame_count: 0,
            slice_count: 0,
            operating_mode: 0,
            buffer_lists: BTreeMap::new(),
        };
        let handle = match self.contexts.allocate(obj) {
            Ok(handle) => handle,
            Err(e) => {
                self.release_hw_context(HwContext {
                    id: hw_id,
                    kind: hw_kind,
                });
                return Err(e.into());
            }
        };
        self.claim_render_targets(handle, render_targets, Some(handle));

        let created = match self.contexts.get(handle) {
            Some(ctx) => plugin.create_context(&self.picture_env(ctx)),
            None => Err(Error::InvalidContext(handle)),
        };
        match created {
            Ok(format) => {
                if let Some(ctx) = self.contexts.get_mut(handle) {
                    ctx.format = Some(format);
                }
                debug!(
                    "created context {} ({}x{}, {} render targets) on hw context {}",
                    handle,
                    picture_width,
                    picture_height,
                    render_targets.len(),
                    hw_id
                );
                Ok(handle)
            }
            Err(e) => {
                error!("decoder rejected context: {}", e);
                self.claim_render_targets(handle, render_targets, None);
                if let Ok(obj) = self.contexts.free(handle) {
                    self.release_hw_context(obj.hw_context);
                }
                Err(e)
            }
        }
    }

    /// Points the surfaces owned by `context` at `owner`.
    fn claim_render_targets(&mut self, context: Handle, targets: &[Handle], owner: Option<Handle>) {
        for &target in targets {
            if let Some(surface) = self.surfaces.get_mut(target) {
                if owner.is_some() || surface.context == Some(context) {
                    surface.context = owner;
                }
            }
        }
    }

    /// Tears a context down: codec state, every buffer it owns, its claim on the render
    /// targets, its handle and finally its hardware context.
    pub fn destroy_context(&mut self, context: Handle) -> Result<()> {
        let format = self
            .contexts
            .get_mut(context)
            .ok_or(Error::InvalidContext(context))?
            .format
            .take();
        if let (Some(mut format), Some(ctx)) = (format, self.contexts.get(context)) {
            format.destroy_context(&self.picture_env(ctx));
        }

        let (lists, targets) = match self.contexts.get(context) {
            Some(ctx) => (
                ctx.buffer_lists.values().copied().collect::<Vec<_>>(),
                ctx.render_targets.clone(),
            ),
            None => return Err(Error::InvalidContext(context)),
        };
        for lists in lists {
            for handle in list_handles(&self.buffers, lists.active_head)
                .into_iter()
                .chain(list_handles(&self.buffers, lists.unused_head))
            {
                self.destroy_buffer_object(handle);
            }
        }
        self.claim_render_targets(context, &targets, None);

        let obj = self.contexts.free(context)?;
        self.release_hw_context(obj.hw_context);
        debug!("destroyed context {}", context);
        Ok(())
    }

    pub fn context(&self, context: Handle) -> Result<&ContextObject> {
        self.contexts
            .get(context)
            .ok_or(Error::InvalidContext(context))
    }

    fn context_mut(&mut self, context: Handle) -> Result<&mut ContextObject> {
        self.contexts
            .get_mut(context)
            .ok_or(Error::InvalidContext(context))
    }

    /// Opens a picture decoding into `render_target`.
    pub fn begin_picture(&mut self, context: Handle, render_target: Handle) -> Result<()> {
        let ctx = self.context(context)?;
        if ctx.render_target.is_some() {
            return Err(Error::NestedPicture(context));
        }
        self.config(ctx.config)?;
        if !self.surfaces.contains(render_target) {
            return Err(Error::InvalidSurface(render_target));
        }
        let ctx = self.context_mut(context)?;
        ctx.render_target = Some(render_target);
        ctx.slice_count = 0;

        let result = self.with_format(context, |format, env| format.begin_picture(env));
        if result.is_err() {
            if let Some(ctx) = self.contexts.get_mut(context) {
                ctx.render_target = None;
            }
        }
        result
    }

    /// Hands `buffers` to the decoder, then suspends every one of them whatever the outcome.
    pub fn render_picture(&mut self, context: Handle, buffers: &[Handle]) -> Result<()> {
        if self.context(context)?.render_target.is_none() {
            return Err(Error::NoPicture(context));
        }
        if buffers.is_empty() {
            return Err(Error::InvalidParameter("no buffers to render"));
        }
        let mut slices = 0;
        for &buffer in buffers {
            let obj = self.buffer(buffer)?;
            if matches!(
                obj.buffer_type(),
                BufferType::SliceData | BufferType::ProtectedSliceData
            ) {
                slices += 1;
            }
        }

        let result = self.with_format(context, |format, env| format.render_picture(env, buffers));
        if let Some(ctx) = self.contexts.get_mut(context) {
            ctx.slice_count += slices;
        }
        for &buffer in buffers {
            self.suspend_buffer(buffer);
        }
        result
    }

    /// Closes the picture in progress and counts it as a frame.
    pub fn end_picture(&mut self, context: Handle) -> Result<()> {
        if self.context(context)?.render_target.is_none() {
            return Err(Error::NoPicture(context));
        }
        let result = self.with_format(context, |format, env| format.end_picture(env));
        let ctx = self.context_mut(context)?;
        ctx.render_target = None;
        ctx.frame_count = ctx.frame_count.wrapping_add(1);
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bufmgr::fake::FakeBufferManager;

    use super::*;
    use crate::config::DriverConfig;
    use crate::driver::SurfaceMemory;
    use crate::driver::RT_FORMAT_YUV420;
    use crate::error::Status;

    struct Setup {
        bufmgr: Arc<FakeBufferManager>,
        driver: Driver,
        config: Handle,
        surfaces: Vec<Handle>,
    }

    fn setup(settings: DriverConfig) -> Setup {
        let bufmgr = Arc::new(FakeBufferManager::new());
        let mut driver = Driver::new(bufmgr.clone(), settings);
        let config = driver
            .create_config(Profile::VP8Version0_3, Entrypoint::VLD, &[])
            .unwrap();
        let surfaces = driver
            .create_surfaces(RT_FORMAT_YUV420, 1920, 1080, 2, SurfaceMemory::Native)
            .unwrap();
        Setup {
            bufmgr,
            driver,
            config,
            surfaces,
        }
    }

    #[test]
    fn tile_strides() {
        assert_eq!(tile_stride(720), 0);
        assert_eq!(tile_stride(1024), 0);
        assert_eq!(tile_stride(1920), 1);
        assert_eq!(tile_stride(4096), 2);
    }

    #[test]
    fn create_claims_render_targets() {
        let mut s = setup(DriverConfig::default());
        let context = s
            .driver
            .create_context(s.config, 1920, 1080, CONTEXT_FLAG_PROGRESSIVE, &s.surfaces)
            .unwrap();
        let ctx = s.driver.context(context).unwrap();
        assert_eq!(ctx.profile(), Profile::VP8Version0_3);
        assert_eq!(ctx.frame_count(), 0);
        assert_eq!(ctx.render_targets(), &s.surfaces[..]);
        let hw_id = ctx.hw_context_id();
        assert_eq!(
            s.bufmgr.hw_context_tiling(hw_id),
            Some(TilingParams {
                tile_stride: 0,
                tiling_scheme: 1
            })
        );
        for &surface in &s.surfaces {
            assert_eq!(s.driver.surface(surface).unwrap().context(), Some(context));
        }
    }

    #[test]
    fn tiled_surfaces_program_tile_stride() {
        let mut s = setup(DriverConfig {
            tiled_surfaces: true,
            ..Default::default()
        });
        let context = s
            .driver
            .create_context(s.config, 1920, 1080, 0, &s.surfaces)
            .unwrap();
        let hw_id = s.driver.context(context).unwrap().hw_context_id();
        assert_eq!(s.bufmgr.hw_context_tiling(hw_id).unwrap().tile_stride, 1);
    }

    #[test]
    fn create_rejects_bad_arguments() {
        let mut s = setup(DriverConfig::default());
        let status = |r: Result<Handle>| Status::of(&r);
        assert_eq!(
            status(s.driver.create_context(s.config, 64, 64, 0, &[])),
            Status::InvalidParameter
        );
        assert_eq!(
            status(s.driver.create_context(s.config, 8192, 64, 0, &s.surfaces)),
            Status::ResolutionNotSupported
        );
        assert_eq!(
            status(s.driver.create_context(s.surfaces[0], 64, 64, 0, &s.surfaces)),
            Status::InvalidConfig
        );
        assert_eq!(
            status(s.driver.create_context(s.config, 64, 64, 0, &[s.config])),
            Status::InvalidSurface
        );
        s.bufmgr.fail_hw_context(true);
        assert_eq!(
            status(s.driver.create_context(s.config, 64, 64, 0, &s.surfaces)),
            Status::AllocationFailed
        );
        assert!(s.driver.contexts().is_empty());
        assert_eq!(s.driver.surface(s.surfaces[0]).unwrap().context(), None);
    }

    #[test]
    fn destroy_releases_everything() {
        let mut s = setup(DriverConfig::default());
        let context = s
            .driver
            .create_context(s.config, 1920, 1080, 0, &s.surfaces)
            .unwrap();
        let hw_id = s.driver.context(context).unwrap().hw_context_id();
        let active = s
            .driver
            .create_buffer(context, BufferType::SliceData, 64, 1, None)
            .unwrap();
        let unused = s
            .driver
            .create_buffer(context, BufferType::PictureParameter, 64, 1, None)
            .unwrap();
        s.driver.destroy_buffer(unused).unwrap();

        s.driver.destroy_context(context).unwrap();
        assert!(s.driver.buffers().is_empty());
        assert!(!s.driver.buffers().contains(active));
        assert!(!s.driver.buffers().is_suspended(unused));
        assert!(!s.bufmgr.live_hw_contexts().contains(&hw_id));
        assert_eq!(s.driver.surface(s.surfaces[1]).unwrap().context(), None);
        assert!(matches!(
            s.driver.destroy_context(context),
            Err(Error::InvalidContext(_))
        ));
    }

    #[test]
    fn picture_cycle() {
        let mut s = setup(DriverConfig::default());
        let context = s
            .driver
            .create_context(s.config, 1920, 1080, 0, &s.surfaces)
            .unwrap();
        let params = s
            .driver
            .create_buffer(context, BufferType::PictureParameter, 16, 1, None)
            .unwrap();
        assert!(matches!(
            s.driver.render_picture(context, &[params]),
            Err(Error::NoPicture(_))
        ));
        assert!(matches!(
            s.driver.end_picture(context),
            Err(Error::NoPicture(_))
        ));

        s.driver.begin_picture(context, s.surfaces[0]).unwrap();
        assert_eq!(
            s.driver.context(context).unwrap().render_target(),
            Some(s.surfaces[0])
        );
        assert!(matches!(
            s.driver.begin_picture(context, s.surfaces[1]),
            Err(Error::NestedPicture(_))
        ));
        assert!(matches!(
            s.driver.render_picture(context, &[]),
            Err(Error::InvalidParameter(_))
        ));
        s.driver.render_picture(context, &[params]).unwrap();
        assert!(s.driver.buffers().is_suspended(params));
        assert!(matches!(
            s.driver.render_picture(context, &[params]),
            Err(Error::InvalidBuffer(_))
        ));
        s.driver.end_picture(context).unwrap();

        let ctx = s.driver.context(context).unwrap();
        assert_eq!(ctx.render_target(), None);
        assert_eq!(ctx.frame_count(), 1);
        assert_eq!(ctx.unused_count(BufferType::PictureParameter), 1);
    }

    #[test]
    fn begin_picture_validates_surface() {
        let mut s = setup(DriverConfig::default());
        let context = s
            .driver
            .create_context(s.config, 1920, 1080, 0, &s.surfaces)
            .unwrap();
        assert!(matches!(
            s.driver.begin_picture(context, context),
            Err(Error::InvalidSurface(_))
        ));
        assert_eq!(s.driver.context(context).unwrap().render_target(), None);
    }
}
