// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This module defines the interface that codec implementations provide in order to decode a
//! (profile, entrypoint) pair on top of the generic driver.

use std::sync::Arc;

use bufmgr::BufferManager;
use bufmgr::HwContext;
use object_heap::Handle;
use object_heap::ObjectHeap;
use sync::Mutex;

use crate::driver::BufferObject;
use crate::driver::ConfigAttrib;
use crate::driver::ConfigObject;
use crate::driver::Entrypoint;
use crate::driver::Profile;
use crate::driver::SurfaceObject;
use crate::error::Result;

/// Serializes submissions to the decode engine across every context of a driver instance.
pub type HwLock = Arc<Mutex<()>>;

/// Driver state a codec may look at while it builds commands for one context.
///
/// Everything is borrowed from the driver for the duration of a single call.
pub struct PictureEnv<'a> {
    pub bufmgr: &'a dyn BufferManager,
    pub hw_context: &'a HwContext,
    pub hw_lock: &'a HwLock,
    pub buffers: &'a ObjectHeap<BufferObject>,
    pub surfaces: &'a ObjectHeap<SurfaceObject>,
    pub profile: Profile,
    pub picture_width: u32,
    pub picture_height: u32,
    pub num_render_targets: usize,
    /// Surface being decoded into, if a picture is open.
    pub render_target: Option<Handle>,
    pub ec_enabled: bool,
    pub operating_mode: u32,
}

impl PictureEnv<'_> {
    /// The surface of the open picture.
    pub fn render_surface(&self) -> Option<(Handle, &SurfaceObject)> {
        let handle = self.render_target?;
        self.surfaces.get(handle).map(|surface| (handle, surface))
    }
}

/// Per-context state of a codec.
pub trait FormatContext: Send {
    /// Prepare the command stream for a new picture. `env.render_target` is already set.
    ///
    /// Returns `HwBusy` if no execution buffer could be acquired.
    fn begin_picture(&mut self, env: &PictureEnv) -> Result<()>;

    /// Consume the parameter and data buffers listed in `buffers`.
    ///
    /// The buffers are looked up and active for the duration of the call. The driver suspends
    /// all of them afterwards whether or not this succeeds, so an implementation that keeps
    /// handles across calls must read them with `get_retained`.
    fn render_picture(&mut self, env: &PictureEnv, buffers: &[Handle]) -> Result<()>;

    /// Submit whatever is left of the picture.
    fn end_picture(&mut self, env: &PictureEnv) -> Result<()>;

    /// Release every resource held for the context. Called once, right before the context's
    /// buffers and hardware context are destroyed.
    fn destroy_context(&mut self, env: &PictureEnv);
}

/// A codec able to decode one or more (profile, entrypoint) pairs.
pub trait FormatPlugin: Send + Sync {
    /// Adjust `attributes`, which already hold the generic answers, for this codec.
    fn query_config_attributes(
        &self,
        profile: Profile,
        entrypoint: Entrypoint,
        attributes: &mut [ConfigAttrib],
    );

    /// Accept or reject a configuration whose generic attributes are already valid.
    fn validate_config(&self, config: &ConfigObject) -> Result<()>;

    /// Create the codec state for a new context. `env.render_target` is `None`.
    fn create_context(&self, env: &PictureEnv) -> Result<Box<dyn FormatContext>>;
}
