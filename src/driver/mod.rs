// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The driver session: object heaps, codec registry and teardown.

mod buffer;
mod config;
mod context;
mod image;
mod surface;

use std::collections::BTreeMap;
use std::sync::Arc;

use base::debug;
use base::info;
use base::warn;
use bufmgr::BufferManager;
use object_heap::ObjectHeap;
use object_heap::ObjectKind;
use sync::Mutex;

pub use self::buffer::BufferInfo;
pub use self::buffer::BufferObject;
pub use self::buffer::BufferType;
pub use self::buffer::ExportedBuffer;
pub use self::buffer::ListMembership;
pub use self::buffer::MemoryType;
pub use self::config::ConfigAttrib;
pub use self::config::ConfigObject;
pub use self::config::Entrypoint;
pub use self::config::Profile;
pub use self::config::ATTRIB_NOT_SUPPORTED;
pub use self::config::CONFIG_ATTRIB_RT_FORMAT;
pub use self::config::CONFIG_ATTRIB_TYPE_MAX;
pub use self::config::RT_FORMAT_PROTECTED;
pub use self::config::RT_FORMAT_YUV420;
pub use self::context::ContextObject;
pub use self::context::CONTEXT_FLAG_PROGRESSIVE;
pub use self::image::ImageFormat;
pub use self::image::ImageObject;
pub use self::image::SubpictureObject;
pub use self::surface::DisplayState;
pub use self::surface::ExternalBuffers;
pub use self::surface::SurfaceMemory;
pub use self::surface::SurfaceObject;
pub use self::surface::SurfaceStatus;
use crate::config::DriverConfig;
use crate::format::FormatPlugin;
use crate::format::HwLock;
use crate::vld::VldPlugin;

/// One open instance of the video driver.
///
/// Every API object lives in a typed heap owned by the driver. Dropping the driver tears
/// everything down in dependency order, as `terminate` does.
pub struct Driver {
    settings: DriverConfig,
    bufmgr: Arc<dyn BufferManager>,
    plugins: BTreeMap<(Profile, Entrypoint), Arc<dyn FormatPlugin>>,
    configs: ObjectHeap<ConfigObject>,
    contexts: ObjectHeap<ContextObject>,
    surfaces: ObjectHeap<SurfaceObject>,
    buffers: ObjectHeap<BufferObject>,
    images: ObjectHeap<ImageObject>,
    subpictures: ObjectHeap<SubpictureObject>,
    hw_lock: HwLock,
    display: Arc<Mutex<DisplayState>>,
    terminated: bool,
}

impl Driver {
    /// Opens a driver instance on `bufmgr` with the VP8 VLD decoder registered.
    pub fn new(bufmgr: Arc<dyn BufferManager>, settings: DriverConfig) -> Driver {
        let mut driver = Driver {
            settings,
            bufmgr,
            plugins: BTreeMap::new(),
            configs: ObjectHeap::new(ObjectKind::Config),
            contexts: ObjectHeap::new(ObjectKind::Context),
            surfaces: ObjectHeap::new(ObjectKind::Surface),
            buffers: ObjectHeap::new(ObjectKind::Buffer),
            images: ObjectHeap::new(ObjectKind::Image),
            subpictures: ObjectHeap::new(ObjectKind::Subpicture),
            hw_lock: Arc::new(Mutex::new(())),
            display: Arc::new(Mutex::new(DisplayState::default())),
            terminated: false,
        };
        driver.register_plugin(Profile::VP8Version0_3, Entrypoint::VLD, Arc::new(VldPlugin));
        info!("video driver initialized");
        driver
    }

    /// Makes `plugin` responsible for the pair, replacing any previous registration.
    pub fn register_plugin(
        &mut self,
        profile: Profile,
        entrypoint: Entrypoint,
        plugin: Arc<dyn FormatPlugin>,
    ) {
        if self.plugins.insert((profile, entrypoint), plugin).is_some() {
            debug!("replaced decoder for {:?}/{:?}", profile, entrypoint);
        }
    }

    pub fn settings(&self) -> &DriverConfig {
        &self.settings
    }

    pub fn bufmgr(&self) -> &Arc<dyn BufferManager> {
        &self.bufmgr
    }

    /// The lock serializing submissions to the decode engine.
    pub fn hw_lock(&self) -> &HwLock {
        &self.hw_lock
    }

    pub fn display_state(&self) -> Arc<Mutex<DisplayState>> {
        self.display.clone()
    }

    pub fn configs(&self) -> &ObjectHeap<ConfigObject> {
        &self.configs
    }

    pub fn contexts(&self) -> &ObjectHeap<ContextObject> {
        &self.contexts
    }

    pub fn surfaces(&self) -> &ObjectHeap<SurfaceObject> {
        &self.surfaces
    }

    pub fn buffers(&self) -> &ObjectHeap<BufferObject> {
        &self.buffers
    }

    pub fn images(&self) -> &ObjectHeap<ImageObject> {
        &self.images
    }

    pub fn subpictures(&self) -> &ObjectHeap<SubpictureObject> {
        &self.subpictures
    }

    /// Destroys every object still alive: contexts, subpictures, images, buffers, surfaces and
    /// configs, in that order. Calling it again does nothing.
    pub fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;

        for handle in self.contexts.handles() {
            warn!("context {} still alive at terminate", handle);
            if let Err(e) = self.destroy_context(handle) {
                warn!("failed to destroy context {}: {}", handle, e);
            }
        }
        for handle in self.subpictures.handles() {
            warn!("subpicture {} still alive at terminate", handle);
            if let Err(e) = self.destroy_subpicture(handle) {
                warn!("failed to destroy subpicture {}: {}", handle, e);
            }
        }
        for handle in self.images.handles() {
            warn!("image {} still alive at terminate", handle);
            if let Err(e) = self.destroy_image(handle) {
                warn!("failed to destroy image {}: {}", handle, e);
            }
        }
        for handle in self.buffers.handles() {
            warn!("buffer {} still alive at terminate", handle);
            self.destroy_buffer_object(handle);
        }
        for handle in self.surfaces.handles() {
            warn!("surface {} still alive at terminate", handle);
            self.destroy_surface_object(handle);
        }
        for handle in self.configs.handles() {
            warn!("config {} still alive at terminate", handle);
            if let Err(e) = self.configs.free(handle) {
                warn!("failed to destroy config {}: {}", handle, e);
            }
        }

        let leaked = std::mem::replace(&mut self.contexts, ObjectHeap::new(ObjectKind::Context))
            .destroy()
            + std::mem::replace(
                &mut self.subpictures,
                ObjectHeap::new(ObjectKind::Subpicture),
            )
            .destroy()
            + std::mem::replace(&mut self.images, ObjectHeap::new(ObjectKind::Image)).destroy()
            + std::mem::replace(&mut self.buffers, ObjectHeap::new(ObjectKind::Buffer)).destroy()
            + std::mem::replace(&mut self.surfaces, ObjectHeap::new(ObjectKind::Surface))
                .destroy()
            + std::mem::replace(&mut self.configs, ObjectHeap::new(ObjectKind::Config)).destroy();
        if leaked > 0 {
            warn!("{} objects force-destroyed at terminate", leaked);
        }
        info!("video driver terminated");
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use bufmgr::fake::FakeBufferManager;

    use super::*;

    #[test]
    fn terminate_is_idempotent() {
        let bufmgr = Arc::new(FakeBufferManager::new());
        let mut driver = Driver::new(bufmgr.clone(), DriverConfig::default());
        let surfaces = driver
            .create_surfaces(RT_FORMAT_YUV420, 64, 64, 2, SurfaceMemory::Native)
            .unwrap();
        let config = driver
            .create_config(Profile::VP8Version0_3, Entrypoint::VLD, &[])
            .unwrap();
        assert!(driver.surfaces().contains(surfaces[0]));
        driver.terminate();
        assert!(driver.surfaces().is_empty());
        assert!(driver.configs().is_empty());
        assert!(driver.configs().get(config).is_none());
        assert!(bufmgr.live_bos().is_empty());
        driver.terminate();
    }

    #[test]
    fn drop_releases_device_memory() {
        let bufmgr = Arc::new(FakeBufferManager::new());
        {
            let mut driver = Driver::new(bufmgr.clone(), DriverConfig::default());
            driver
                .create_surfaces(RT_FORMAT_YUV420, 320, 240, 1, SurfaceMemory::Native)
                .unwrap();
            let format = ImageFormat::nv12();
            driver.create_image(format, 64, 64).unwrap();
            assert!(!bufmgr.live_bos().is_empty());
        }
        assert!(bufmgr.live_bos().is_empty());
    }
}
