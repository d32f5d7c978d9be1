// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! CPU-visible images and the subpictures built from them.

use base::debug;
use base::error;
use object_heap::Handle;

use crate::driver::buffer::BufferObject;
use crate::driver::BufferType;
use crate::driver::Driver;
use crate::error::Error;
use crate::error::Result;

pub const fn fourcc(a: u8, b: u8, c: u8, d: u8) -> u32 {
    (a as u32) | (b as u32) << 8 | (c as u32) << 16 | (d as u32) << 24
}

pub const FOURCC_NV12: u32 = fourcc(b'N', b'V', b'1', b'2');
pub const FOURCC_IYUV: u32 = fourcc(b'I', b'Y', b'U', b'V');
pub const FOURCC_AYUV: u32 = fourcc(b'A', b'Y', b'U', b'V');
pub const FOURCC_RGBA: u32 = fourcc(b'R', b'G', b'B', b'A');
pub const FOURCC_AI44: u32 = fourcc(b'A', b'I', b'4', b'4');
pub const FOURCC_YV32: u32 = fourcc(b'Y', b'V', b'3', b'2');

const LSB_FIRST: u32 = 1;

pub const SUBPICTURE_CHROMA_KEYING: u32 = 0x0001;
pub const SUBPICTURE_GLOBAL_ALPHA: u32 = 0x0002;
const SUPPORTED_SUBPICTURE_FLAGS: u32 = SUBPICTURE_CHROMA_KEYING | SUBPICTURE_GLOBAL_ALPHA;

/// Subpictures a single surface can carry.
pub const MAX_SUBPICTURES_PER_SURFACE: usize = 6;

const AI44_PALETTE_ENTRIES: usize = 16;
const AI44_ENTRY_BYTES: usize = 4;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ImageFormat {
    pub fourcc: u32,
    pub byte_order: u32,
    pub bits_per_pixel: u32,
}

impl ImageFormat {
    pub const fn new(fourcc: u32, bits_per_pixel: u32) -> ImageFormat {
        ImageFormat {
            fourcc,
            byte_order: LSB_FIRST,
            bits_per_pixel,
        }
    }

    pub const fn nv12() -> ImageFormat {
        ImageFormat::new(FOURCC_NV12, 12)
    }

    pub const fn rgba() -> ImageFormat {
        ImageFormat::new(FOURCC_RGBA, 32)
    }
}

const IMAGE_FORMATS: [ImageFormat; 6] = [
    ImageFormat::nv12(),
    ImageFormat::new(FOURCC_IYUV, 12),
    ImageFormat::new(FOURCC_AYUV, 32),
    ImageFormat::rgba(),
    ImageFormat::new(FOURCC_AI44, 8),
    ImageFormat::new(FOURCC_YV32, 32),
];

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Plane {
    pub pitch: u32,
    pub offset: u32,
}

pub struct ImageObject {
    format: ImageFormat,
    width: u32,
    height: u32,
    data_size: u32,
    planes: Vec<Plane>,
    buffer: Handle,
    derived_surface: Option<Handle>,
    palette: Vec<u8>,
    pub(crate) subpic_ref: u32,
}

impl ImageObject {
    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data_size(&self) -> u32 {
        self.data_size
    }

    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }

    /// The image buffer holding the pixels.
    pub fn buffer(&self) -> Handle {
        self.buffer
    }

    pub fn derived_surface(&self) -> Option<Handle> {
        self.derived_surface
    }

    pub fn palette(&self) -> &[u8] {
        &self.palette
    }

    /// Subpictures currently built on this image.
    pub fn subpicture_refs(&self) -> u32 {
        self.subpic_ref
    }
}

/// A rectangle in pixels.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub x: i16,
    pub y: i16,
    pub width: u16,
    pub height: u16,
}

/// Placement of a subpicture on one surface.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SubpictureLink {
    pub subpicture: Handle,
    pub src: Rect,
    pub dest: Rect,
}

pub struct SubpictureObject {
    image: Handle,
    flags: u32,
    global_alpha: u8,
    pub(crate) surfaces: Vec<Handle>,
}

impl SubpictureObject {
    pub fn image(&self) -> Handle {
        self.image
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn global_alpha(&self) -> u8 {
        self.global_alpha
    }

    /// Surfaces this subpicture is associated with.
    pub fn surfaces(&self) -> &[Handle] {
        &self.surfaces
    }
}

/// Byte size and plane layout of a `width` x `height` image in `fourcc`.
fn image_layout(fourcc: u32, width: u32, height: u32) -> Result<(u32, Vec<Plane>)> {
    let too_large = || Error::InvalidParameter("image too large");
    let pitch = width.checked_next_power_of_two().ok_or_else(too_large)?;
    let luma = pitch.checked_mul(height).ok_or_else(too_large)?;
    let half = (pitch / 2) * (height / 2);
    let plane = |pitch, offset| Plane { pitch, offset };
    let layout = match fourcc {
        FOURCC_NV12 => (luma + 2 * half, vec![plane(pitch, 0), plane(pitch, luma)]),
        FOURCC_IYUV => (
            luma + 2 * half,
            vec![
                plane(pitch, 0),
                plane(pitch / 2, luma),
                plane(pitch / 2, luma + half),
            ],
        ),
        FOURCC_AYUV | FOURCC_RGBA => (
            luma.checked_mul(4).ok_or_else(too_large)?,
            vec![plane(4 * pitch, 0)],
        ),
        FOURCC_AI44 => (luma, vec![plane(pitch, 0)]),
        FOURCC_YV32 => (
            luma.checked_mul(4).ok_or_else(too_large)?,
            (0..4).map(|i| plane(pitch, i * luma)).collect(),
        ),
        _ => return Err(Error::InvalidImageFormat(fourcc)),
    };
    Ok(layout)
}

impl Driver {
    pub fn query_image_formats(&self) -> Vec<ImageFormat> {
        IMAGE_FORMATS.to_vec()
    }

    pub fn query_subpicture_formats(&self) -> Vec<ImageFormat> {
        vec![ImageFormat::rgba()]
    }

    /// Creates an image with its own image buffer. Pitches are rounded up to a power of two.
    pub fn create_image(&mut self, format: ImageFormat, width: u32, height: u32) -> Result<Handle> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidParameter("empty image"));
        }
        let (data_size, planes) = image_layout(format.fourcc, width, height)?;
        let buffer = self.create_buffer_object(None, BufferType::Image, data_size, 1, None)?;
        let palette = if format.fourcc == FOURCC_AI44 {
            vec![0; AI44_PALETTE_ENTRIES * AI44_ENTRY_BYTES]
        } else {
            Vec::new()
        };
        let image = ImageObject {
            format,
            width,
            height,
            data_size,
            planes,
            buffer,
            derived_surface: None,
            palette,
            subpic_ref: 0,
        };
        match self.images.allocate(image) {
            Ok(handle) => {
                debug!("created image {} ({}x{})", handle, width, height);
                Ok(handle)
            }
            Err(e) => {
                self.destroy_buffer_object(buffer);
                Err(e.into())
            }
        }
    }

    /// Exposes the memory of `surface` as an NV12 image without copying.
    pub fn derive_image(&mut self, surface: Handle) -> Result<Handle> {
        let obj = self.surface(surface)?;
        let stride = obj.stride();
        let height = obj.height();
        let size = u32::try_from(obj.size())
            .map_err(|_| Error::InvalidParameter("surface too large"))?;
        let bo = obj.bo().try_clone()?;
        let width = obj.width();

        let buffer = self
            .buffers
            .allocate(BufferObject::with_bo(BufferType::Image, bo, size))?;
        let image = ImageObject {
            format: ImageFormat::nv12(),
            width,
            height,
            data_size: size,
            planes: vec![
                Plane {
                    pitch: stride,
                    offset: 0,
                },
                Plane {
                    pitch: stride,
                    offset: height * stride,
                },
            ],
            buffer,
            derived_surface: Some(surface),
            palette: Vec::new(),
            subpic_ref: 0,
        };
        let handle = match self.images.allocate(image) {
            Ok(handle) => handle,
            Err(e) => {
                self.destroy_buffer_object(buffer);
                return Err(e.into());
            }
        };
        if let Some(obj) = self.surfaces.get_mut(surface) {
            obj.derived_images += 1;
        }
        debug!("derived image {} from surface {}", handle, surface);
        Ok(handle)
    }

    /// Destroys an image and its buffer. Refused while a subpicture uses the image.
    pub fn destroy_image(&mut self, image: Handle) -> Result<()> {
        let obj = self.image(image)?;
        if obj.subpic_ref > 0 {
            return Err(Error::ImageInUse(image));
        }
        let (buffer, derived_surface) = (obj.buffer, obj.derived_surface);
        match derived_surface.and_then(|s| self.surfaces.get_mut(s)) {
            Some(surface) => {
                surface.derived_images = surface.derived_images.saturating_sub(1);
                self.destroy_buffer_object(buffer);
            }
            None => self.suspend_buffer(buffer),
        }
        self.images.free(image)?;
        debug!("destroyed image {}", image);
        Ok(())
    }

    pub fn image(&self, image: Handle) -> Result<&ImageObject> {
        self.images.get(image).ok_or(Error::InvalidImage(image))
    }

    /// Sets the palette of an AI44 image. `palette` must cover every entry.
    pub fn set_image_palette(&mut self, image: Handle, palette: &[u8]) -> Result<()> {
        let obj = self
            .images
            .get_mut(image)
            .ok_or(Error::InvalidImage(image))?;
        if obj.format.fourcc != FOURCC_AI44 {
            return Err(Error::InvalidImageFormat(obj.format.fourcc));
        }
        let len = obj.palette.len();
        let src = palette
            .get(..len)
            .ok_or(Error::InvalidParameter("palette too short"))?;
        obj.palette.copy_from_slice(src);
        Ok(())
    }

    /// Checks that `image` exists and can back a subpicture.
    fn subpicture_image(&self, image: Handle) -> Result<()> {
        let fourcc = self.image(image)?.format.fourcc;
        if fourcc != FOURCC_RGBA {
            return Err(Error::InvalidImageFormat(fourcc));
        }
        Ok(())
    }

    pub fn create_subpicture(&mut self, image: Handle) -> Result<Handle> {
        self.subpicture_image(image)?;
        let handle = self.subpictures.allocate(SubpictureObject {
            image,
            flags: 0,
            global_alpha: u8::MAX,
            surfaces: Vec::new(),
        })?;
        if let Some(obj) = self.images.get_mut(image) {
            obj.subpic_ref += 1;
        }
        debug!("created subpicture {} on image {}", handle, image);
        Ok(handle)
    }

    /// Removes the subpicture from every surface and releases its image.
    pub fn destroy_subpicture(&mut self, subpicture: Handle) -> Result<()> {
        let obj = self
            .subpictures
            .free(subpicture)
            .map_err(|_| Error::InvalidSubpicture(subpicture))?;
        for &surface in &obj.surfaces {
            if let Some(surface) = self.surfaces.get_mut(surface) {
                surface.subpictures.retain(|link| link.subpicture != subpicture);
            }
        }
        if let Some(image) = self.images.get_mut(obj.image) {
            image.subpic_ref = image.subpic_ref.saturating_sub(1);
        }
        debug!("destroyed subpicture {}", subpicture);
        Ok(())
    }

    pub fn subpicture(&self, subpicture: Handle) -> Result<&SubpictureObject> {
        self.subpictures
            .get(subpicture)
            .ok_or(Error::InvalidSubpicture(subpicture))
    }

    fn subpicture_mut(&mut self, subpicture: Handle) -> Result<&mut SubpictureObject> {
        self.subpictures
            .get_mut(subpicture)
            .ok_or(Error::InvalidSubpicture(subpicture))
    }

    /// Moves a subpicture onto another RGBA image.
    pub fn set_subpicture_image(&mut self, subpicture: Handle, image: Handle) -> Result<()> {
        self.subpicture_image(image)?;
        let old = self.subpicture(subpicture)?.image;
        if let Some(obj) = self.images.get_mut(old) {
            obj.subpic_ref = obj.subpic_ref.saturating_sub(1);
        }
        self.subpicture_mut(subpicture)?.image = image;
        if let Some(obj) = self.images.get_mut(image) {
            obj.subpic_ref += 1;
        }
        Ok(())
    }

    /// Chroma keys are accepted for API compatibility but not applied.
    pub fn set_subpicture_chromakey(
        &mut self,
        subpicture: Handle,
        min: u32,
        max: u32,
        mask: u32,
    ) -> Result<()> {
        if mask < min || mask > max {
            return Err(Error::InvalidParameter("chroma key outside its range"));
        }
        self.subpicture(subpicture)?;
        Ok(())
    }

    /// `alpha` ranges from 0.0 (transparent) to 1.0 (opaque).
    pub fn set_subpicture_global_alpha(&mut self, subpicture: Handle, alpha: f32) -> Result<()> {
        if !(0.0..=1.0).contains(&alpha) {
            return Err(Error::InvalidParameter("global alpha outside 0..=1"));
        }
        self.subpicture_mut(subpicture)?.global_alpha = (alpha * 255.0) as u8;
        Ok(())
    }

    /// Places a subpicture on each of `surfaces`. Re-associating a surface updates the placement.
    pub fn associate_subpicture(
        &mut self,
        subpicture: Handle,
        surfaces: &[Handle],
        src: Rect,
        dest: Rect,
        flags: u32,
    ) -> Result<()> {
        if surfaces.is_empty() {
            return Err(Error::InvalidParameter("no surfaces to associate"));
        }
        let image = self.subpicture(subpicture)?.image;
        if flags & !SUPPORTED_SUBPICTURE_FLAGS != 0 {
            return Err(Error::FlagNotSupported(flags));
        }
        self.image(image)?;
        // Nothing changes unless every surface can take the link.
        for &surface in surfaces {
            let obj = self.surface(surface)?;
            let linked = obj.subpictures.len();
            let present = obj.subpictures.iter().any(|l| l.subpicture == subpicture);
            if !present && linked >= MAX_SUBPICTURES_PER_SURFACE {
                error!("surface {} carries too many subpictures", surface);
                return Err(Error::MaxNumExceeded("subpictures on a surface"));
            }
        }

        self.subpicture_mut(subpicture)?.flags = flags;
        let link = SubpictureLink {
            subpicture,
            src,
            dest,
        };
        for &surface in surfaces {
            let obj = self
                .surfaces
                .get_mut(surface)
                .ok_or(Error::InvalidSurface(surface))?;
            match obj
                .subpictures
                .iter()
                .position(|l| l.subpicture == subpicture)
            {
                Some(index) => obj.subpictures[index] = link,
                None => obj.subpictures.push(link),
            }
            let subpic = self.subpicture_mut(subpicture)?;
            if !subpic.surfaces.contains(&surface) {
                subpic.surfaces.push(surface);
            }
        }
        Ok(())
    }

    /// Removes a subpicture from `surfaces`. Unknown surfaces are logged and skipped.
    pub fn deassociate_subpicture(&mut self, subpicture: Handle, surfaces: &[Handle]) -> Result<()> {
        if surfaces.is_empty() {
            return Err(Error::InvalidParameter("no surfaces to deassociate"));
        }
        self.subpicture(subpicture)?;
        for &surface in surfaces {
            match self.surfaces.get_mut(surface) {
                Some(obj) => obj.subpictures.retain(|l| l.subpicture != subpicture),
                None => {
                    error!("deassociate from invalid surface {}", surface);
                    continue;
                }
            }
            self.subpicture_mut(subpicture)?
                .surfaces
                .retain(|&s| s != surface);
        }
        Ok(())
    }
}
