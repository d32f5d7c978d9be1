// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Options of a driver instance.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;
use serde::Serialize;

fn default_max_config_attributes() -> usize {
    10
}

fn default_log_filter() -> String {
    String::from("info")
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct DriverConfig {
    /// Ask the firmware for error detection and recovery on every decode.
    pub ec_enabled: bool,
    /// Frames a suspended buffer must sit on the unused list before it is recycled.
    pub recycle_min_frames: u32,
    /// Attributes a single config may carry.
    pub max_config_attributes: usize,
    /// Allocate render targets tiled.
    pub tiled_surfaces: bool,
    /// Filter handed to the logger, in `env_logger` syntax.
    pub log_filter: String,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            ec_enabled: false,
            recycle_min_frames: 0,
            max_config_attributes: default_max_config_attributes(),
            tiled_surfaces: false,
            log_filter: default_log_filter(),
        }
    }
}

impl DriverConfig {
    /// Reads a JSON config file. Missing fields take their default value.
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<DriverConfig> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("failed to open driver config {}", path.display()))?;
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("failed to parse driver config {}", path.display()))
    }
}
