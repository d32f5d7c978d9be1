// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! NV12 render targets.

use std::os::fd::BorrowedFd;

use base::align_up;
use base::debug;
use base::error;
use bufmgr::AllocParams;
use bufmgr::Bo;
use bufmgr::CachePolicy;
use bufmgr::Tiling;
use object_heap::Handle;

use crate::driver::context::check_dimensions;
use crate::driver::image::SubpictureLink;
use crate::driver::image::FOURCC_NV12;
use crate::driver::Driver;
use crate::driver::RT_FORMAT_PROTECTED;
use crate::driver::RT_FORMAT_YUV420;
use crate::error::Error;
use crate::error::Result;

const SURFACE_BO_NAME: &str = "VASurface";
const HEIGHT_ALIGNMENT: u64 = 32;

/// Surface states reported by `query_surface_status`, numbered as in VA-API.
#[derive(Copy, Clone, Debug, PartialEq, Eq, enumn::N)]
#[repr(u32)]
pub enum SurfaceStatus {
    Rendering = 1,
    Displaying = 2,
    Ready = 4,
    Skipped = 8,
}

/// The surface on screen and the one shown before it.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DisplayState {
    pub current: Option<Handle>,
    pub last: Option<Handle>,
}

/// Memory shared by another process, one PRIME descriptor per surface.
pub struct ExternalBuffers<'a> {
    pub data_size: u32,
    pub pitches: [u32; 3],
    pub offsets: [u32; 3],
    pub fds: Vec<BorrowedFd<'a>>,
}

/// Where surface memory comes from.
pub enum SurfaceMemory<'a> {
    /// Allocated by the driver.
    Native,
    /// Imported; surface `i` wraps `fds[i]`.
    Prime(ExternalBuffers<'a>),
}

pub struct SurfaceObject {
    width: u32,
    height: u32,
    height_origin: u32,
    stride: u32,
    size: u64,
    chroma_offset: u64,
    tiling: Tiling,
    protected: bool,
    fourcc: u32,
    bo: Bo,
    pub(crate) context: Option<Handle>,
    pub(crate) derived_images: u32,
    pub(crate) subpictures: Vec<SubpictureLink>,
}

impl SurfaceObject {
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height rounded up to a multiple of 32.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Height as requested.
    pub fn height_origin(&self) -> u32 {
        self.height_origin
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Offset of the interleaved chroma plane.
    pub fn chroma_offset(&self) -> u64 {
        self.chroma_offset
    }

    pub fn tiling(&self) -> Tiling {
        self.tiling
    }

    pub fn is_protected(&self) -> bool {
        self.protected
    }

    pub fn fourcc(&self) -> u32 {
        self.fourcc
    }

    pub fn bo(&self) -> &Bo {
        &self.bo
    }

    /// The context rendering into this surface, if any.
    pub fn context(&self) -> Option<Handle> {
        self.context
    }

    pub fn derived_images(&self) -> u32 {
        self.derived_images
    }

    /// Subpictures blended onto this surface, in association order.
    pub fn subpictures(&self) -> &[SubpictureLink] {
        &self.subpictures
    }
}

/// Luma stride for a surface of the given width.
fn nv12_stride(width: u32, tiled: bool) -> u32 {
    match width {
        0..=512 => 512,
        513..=1024 => 1024,
        1025..=1280 if tiled => 2048,
        1025..=1280 => 1280,
        1281..=2048 => 2048,
        _ => 4096,
    }
}

impl Driver {
    /// Creates `count` surfaces. Either all of them are created or none.
    pub fn create_surfaces(
        &mut self,
        format: u32,
        width: u32,
        height: u32,
        count: usize,
        memory: SurfaceMemory,
    ) -> Result<Vec<Handle>> {
        if format & !RT_FORMAT_PROTECTED != RT_FORMAT_YUV420 {
            return Err(Error::UnsupportedRtFormat(format));
        }
        check_dimensions(width, height)?;
        if count == 0 {
            return Err(Error::InvalidParameter("no surfaces requested"));
        }
        if let SurfaceMemory::Prime(external) = &memory {
            if external.fds.len() < count {
                return Err(Error::InvalidParameter("fewer descriptors than surfaces"));
            }
        }
        let protected = format & RT_FORMAT_PROTECTED != 0;

        let mut created = Vec::with_capacity(count);
        for index in 0..count {
            match self.create_surface(width, height, protected, &memory, index) {
                Ok(handle) => created.push(handle),
                Err(e) => {
                    error!("failed to create surface {} of {}: {}", index, count, e);
                    for handle in created.into_iter().rev() {
                        self.destroy_surface_object(handle);
                    }
                    return Err(e);
                }
            }
        }
        Ok(created)
    }

    fn create_surface(
        &mut self,
        width: u32,
        height_origin: u32,
        protected: bool,
        memory: &SurfaceMemory,
        index: usize,
    ) -> Result<Handle> {
        let height = align_up(u64::from(height_origin), HEIGHT_ALIGNMENT)
            .ok_or(Error::ResolutionNotSupported {
                width,
                height: height_origin,
            })?;
        let (stride, size, chroma_offset, tiling, bo) = match memory {
            SurfaceMemory::Native => {
                let tiling = if self.settings.tiled_surfaces {
                    Tiling::Tiled
                } else {
                    Tiling::Linear
                };
                let stride = nv12_stride(width, tiling == Tiling::Tiled);
                let luma = u64::from(stride) * height;
                let size = luma * 3 / 2;
                let params = AllocParams::new(SURFACE_BO_NAME, size)
                    .cache(CachePolicy::Uncached)
                    .tiling(tiling);
                let bo = self.bufmgr.alloc(None, params)?;
                (stride, size, luma, tiling, bo)
            }
            SurfaceMemory::Prime(external) => {
                let fd = external
                    .fds
                    .get(index)
                    .ok_or(Error::InvalidParameter("missing descriptor"))?;
                let size = u64::from(external.data_size);
                let bo = self.bufmgr.import(None, SURFACE_BO_NAME, *fd, size)?;
                (
                    external.pitches[0],
                    size,
                    u64::from(external.offsets[1]),
                    Tiling::Linear,
                    bo,
                )
            }
        };
        let surface = SurfaceObject {
            width,
            height: height as u32,
            height_origin,
            stride,
            size,
            chroma_offset,
            tiling,
            protected,
            fourcc: FOURCC_NV12,
            bo,
            context: None,
            derived_images: 0,
            subpictures: Vec::new(),
        };
        let handle = self.surfaces.allocate(surface)?;
        debug!(
            "created surface {} ({}x{}, stride {})",
            handle, width, height_origin, stride
        );
        Ok(handle)
    }

    /// Destroys surfaces after checking that every one of them can go.
    pub fn destroy_surfaces(&mut self, surfaces: &[Handle]) -> Result<()> {
        for &handle in surfaces {
            let surface = self.surface(handle)?;
            if surface.derived_images > 0 {
                return Err(Error::SurfaceInUse(handle));
            }
        }
        for &handle in surfaces {
            self.destroy_surface_object(handle);
        }
        Ok(())
    }

    pub(crate) fn destroy_surface_object(&mut self, handle: Handle) {
        let surface = match self.surfaces.free(handle) {
            Ok(surface) => surface,
            Err(e) => {
                error!("failed to free surface {}: {}", handle, e);
                return;
            }
        };
        if let Err(e) = surface.bo.wait() {
            error!("failed to wait for surface {}: {}", handle, e);
        }
        for link in &surface.subpictures {
            if let Some(subpic) = self.subpictures.get_mut(link.subpicture) {
                subpic.surfaces.retain(|&s| s != handle);
            }
        }
        let mut display = self.display.lock();
        if display.current == Some(handle) {
            display.current = None;
        }
        if display.last == Some(handle) {
            display.last = None;
        }
        debug!("destroyed surface {}", handle);
    }

    pub fn surface(&self, surface: Handle) -> Result<&SurfaceObject> {
        self.surfaces
            .get(surface)
            .ok_or(Error::InvalidSurface(surface))
    }

    /// Blocks until rendering into the surface has finished.
    pub fn sync_surface(&self, surface: Handle) -> Result<()> {
        self.surface(surface)?.bo.wait()?;
        Ok(())
    }

    pub fn query_surface_status(&self, surface: Handle) -> Result<SurfaceStatus> {
        let obj = self.surface(surface)?;
        if obj.bo.busy() {
            return Ok(SurfaceStatus::Rendering);
        }
        if self.display.lock().current == Some(surface) {
            return Ok(SurfaceStatus::Displaying);
        }
        Ok(SurfaceStatus::Ready)
    }

    /// Records `surface` as the one on screen.
    pub fn set_displaying_surface(&mut self, surface: Handle) -> Result<()> {
        self.surface(surface)?;
        let mut display = self.display.lock();
        display.last = display.current;
        display.current = Some(surface);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use std::os::fd::AsFd;

    use bufmgr::fake::FakeBufferManager;

    use super::*;
    use crate::config::DriverConfig;

    fn driver() -> (Arc<FakeBufferManager>, Driver) {
        let bufmgr = Arc::new(FakeBufferManager::new());
        let driver = Driver::new(bufmgr.clone(), DriverConfig::default());
        (bufmgr, driver)
    }

    #[test]
    fn stride_table() {
        assert_eq!(nv12_stride(176, false), 512);
        assert_eq!(nv12_stride(720, false), 1024);
        assert_eq!(nv12_stride(1280, false), 1280);
        assert_eq!(nv12_stride(1280, true), 2048);
        assert_eq!(nv12_stride(1920, false), 2048);
        assert_eq!(nv12_stride(3840, false), 4096);
    }

    #[test]
    fn native_layout() {
        let (bufmgr, mut driver) = driver();
        let surfaces = driver
            .create_surfaces(RT_FORMAT_YUV420, 1920, 1080, 1, SurfaceMemory::Native)
            .unwrap();
        let surface = driver.surface(surfaces[0]).unwrap();
        assert_eq!(surface.height(), 1088);
        assert_eq!(surface.height_origin(), 1080);
        assert_eq!(surface.stride(), 2048);
        assert_eq!(surface.chroma_offset(), 2048 * 1088);
        assert_eq!(surface.size(), 2048 * 1088 * 3 / 2);
        assert_eq!(surface.fourcc(), FOURCC_NV12);
        assert!(!surface.is_protected());
        let allocation = bufmgr.allocation(surface.bo().handle()).unwrap();
        assert_eq!(allocation.name, "VASurface");
        assert_eq!(allocation.cache, CachePolicy::Uncached);
        assert_eq!(allocation.tiling, Tiling::Linear);
    }

    #[test]
    fn protected_flag() {
        let (_, mut driver) = driver();
        let surfaces = driver
            .create_surfaces(
                RT_FORMAT_YUV420 | RT_FORMAT_PROTECTED,
                64,
                64,
                1,
                SurfaceMemory::Native,
            )
            .unwrap();
        assert!(driver.surface(surfaces[0]).unwrap().is_protected());
    }

    #[test]
    fn rejects_bad_requests() {
        let (_, mut driver) = driver();
        assert!(matches!(
            driver.create_surfaces(4, 64, 64, 1, SurfaceMemory::Native),
            Err(Error::UnsupportedRtFormat(4))
        ));
        assert!(matches!(
            driver.create_surfaces(RT_FORMAT_YUV420, 0, 64, 1, SurfaceMemory::Native),
            Err(Error::ResolutionNotSupported { .. })
        ));
        assert!(matches!(
            driver.create_surfaces(RT_FORMAT_YUV420, 64, 4097, 1, SurfaceMemory::Native),
            Err(Error::ResolutionNotSupported { .. })
        ));
    }

    #[test]
    fn batch_rolls_back() {
        let (bufmgr, mut driver) = driver();
        driver
            .create_surfaces(RT_FORMAT_YUV420, 64, 64, 1, SurfaceMemory::Native)
            .unwrap();
        bufmgr.fail_alloc_after(SURFACE_BO_NAME, 2);
        assert!(matches!(
            driver.create_surfaces(RT_FORMAT_YUV420, 64, 64, 3, SurfaceMemory::Native),
            Err(Error::BufMgr(_))
        ));
        assert_eq!(driver.surfaces().len(), 1);
        assert_eq!(bufmgr.live_bos().len(), 1);
    }

    #[test]
    fn prime_import() {
        let (bufmgr, mut driver) = driver();
        let file = tempfile::tempfile().unwrap();
        let external = ExternalBuffers {
            data_size: 6144,
            pitches: [64, 64, 0],
            offsets: [0, 4096, 0],
            fds: vec![file.as_fd()],
        };
        let surfaces = driver
            .create_surfaces(RT_FORMAT_YUV420, 64, 64, 1, SurfaceMemory::Prime(external))
            .unwrap();
        let surface = driver.surface(surfaces[0]).unwrap();
        assert_eq!(surface.stride(), 64);
        assert_eq!(surface.chroma_offset(), 4096);
        assert!(bufmgr.allocation(surface.bo().handle()).unwrap().imported);
    }

    #[test]
    fn status_and_display() {
        let (bufmgr, mut driver) = driver();
        let surfaces = driver
            .create_surfaces(RT_FORMAT_YUV420, 64, 64, 2, SurfaceMemory::Native)
            .unwrap();
        let bo = driver.surface(surfaces[0]).unwrap().bo().handle();
        assert_eq!(
            driver.query_surface_status(surfaces[0]).unwrap(),
            SurfaceStatus::Ready
        );
        bufmgr.set_busy(bo, true);
        assert_eq!(
            driver.query_surface_status(surfaces[0]).unwrap(),
            SurfaceStatus::Rendering
        );
        driver.sync_surface(surfaces[0]).unwrap();
        driver.set_displaying_surface(surfaces[0]).unwrap();
        assert_eq!(
            driver.query_surface_status(surfaces[0]).unwrap(),
            SurfaceStatus::Displaying
        );
        driver.set_displaying_surface(surfaces[1]).unwrap();
        let display = *driver.display_state().lock();
        assert_eq!(display.current, Some(surfaces[1]));
        assert_eq!(display.last, Some(surfaces[0]));

        driver.destroy_surfaces(&surfaces).unwrap();
        assert_eq!(*driver.display_state().lock(), DisplayState::default());
        assert!(matches!(
            driver.destroy_surfaces(&surfaces),
            Err(Error::InvalidSurface(_))
        ));
    }
}
