// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Profiles, entrypoints and decode configurations.

use std::sync::Arc;

use base::debug;
use object_heap::Handle;

use crate::driver::Driver;
use crate::error::Error;
use crate::error::Result;
use crate::format::FormatPlugin;

/// Codec profiles, numbered as in VA-API.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, enumn::N)]
#[repr(i32)]
pub enum Profile {
    None = -1,
    MPEG2Simple = 0,
    MPEG2Main = 1,
    MPEG4Simple = 2,
    MPEG4AdvancedSimple = 3,
    MPEG4Main = 4,
    H264Main = 6,
    H264High = 7,
    VC1Simple = 8,
    VC1Main = 9,
    VC1Advanced = 10,
    H263Baseline = 11,
    JPEGBaseline = 12,
    H264ConstrainedBaseline = 13,
    VP8Version0_3 = 14,
}

/// Pipeline stages a configuration can target, numbered as in VA-API.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, enumn::N)]
#[repr(i32)]
pub enum Entrypoint {
    VLD = 1,
    IZZ = 2,
    IDCT = 3,
    MoComp = 4,
    Deblocking = 5,
    EncSlice = 6,
    EncPicture = 7,
    VideoProc = 10,
}

pub const CONFIG_ATTRIB_RT_FORMAT: u32 = 0;
/// Highest attribute type the driver accepts in `create_config`.
pub const CONFIG_ATTRIB_TYPE_MAX: u32 = 40;
/// Attribute value reported for attributes the driver does not know.
pub const ATTRIB_NOT_SUPPORTED: u32 = 0x8000_0000;

pub const RT_FORMAT_YUV420: u32 = 0x0000_0001;
/// Flag bit marking protected content in a render target format.
pub const RT_FORMAT_PROTECTED: u32 = 0x8000_0000;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ConfigAttrib {
    pub attrib_type: u32,
    pub value: u32,
}

impl ConfigAttrib {
    pub fn new(attrib_type: u32, value: u32) -> ConfigAttrib {
        ConfigAttrib { attrib_type, value }
    }
}

pub struct ConfigObject {
    pub profile: Profile,
    pub entrypoint: Entrypoint,
    pub attributes: Vec<ConfigAttrib>,
    pub(crate) plugin: Arc<dyn FormatPlugin>,
}

impl ConfigObject {
    pub fn attribute(&self, attrib_type: u32) -> Option<u32> {
        self.attributes
            .iter()
            .find(|a| a.attrib_type == attrib_type)
            .map(|a| a.value)
    }

    fn set_attribute(&mut self, attrib: ConfigAttrib, max: usize) -> Result<()> {
        if let Some(existing) = self
            .attributes
            .iter_mut()
            .find(|a| a.attrib_type == attrib.attrib_type)
        {
            existing.value = attrib.value;
            return Ok(());
        }
        if self.attributes.len() >= max {
            return Err(Error::MaxNumExceeded("config attributes"));
        }
        self.attributes.push(attrib);
        Ok(())
    }
}

impl Driver {
    fn plugin_for(&self, profile: Profile, entrypoint: Entrypoint) -> Option<Arc<dyn FormatPlugin>> {
        self.plugins.get(&(profile, entrypoint)).cloned()
    }

    /// Distinguishes an unknown profile from a known profile used with the wrong entrypoint.
    fn unsupported(&self, profile: Profile, entrypoint: Entrypoint) -> Error {
        if profile == Profile::None || self.plugins.keys().any(|(p, _)| *p == profile) {
            Error::UnsupportedEntrypoint(entrypoint)
        } else {
            Error::UnsupportedProfile(profile)
        }
    }

    /// Profiles with at least one registered decoder.
    pub fn query_config_profiles(&self) -> Vec<Profile> {
        let mut profiles: Vec<Profile> = self.plugins.keys().map(|(p, _)| *p).collect();
        profiles.dedup();
        profiles
    }

    pub fn query_config_entrypoints(&self, profile: Profile) -> Result<Vec<Entrypoint>> {
        let entrypoints: Vec<Entrypoint> = self
            .plugins
            .keys()
            .filter(|(p, _)| *p == profile)
            .map(|(_, e)| *e)
            .collect();
        if entrypoints.is_empty() {
            return Err(Error::UnsupportedProfile(profile));
        }
        Ok(entrypoints)
    }

    /// Fills in the value of each attribute in `attributes` for the given pair.
    pub fn get_config_attributes(
        &self,
        profile: Profile,
        entrypoint: Entrypoint,
        attributes: &mut [ConfigAttrib],
    ) -> Result<()> {
        let plugin = self
            .plugin_for(profile, entrypoint)
            .ok_or_else(|| self.unsupported(profile, entrypoint))?;
        for attrib in attributes.iter_mut() {
            attrib.value = match attrib.attrib_type {
                CONFIG_ATTRIB_RT_FORMAT => RT_FORMAT_YUV420,
                _ => ATTRIB_NOT_SUPPORTED,
            };
        }
        plugin.query_config_attributes(profile, entrypoint, attributes);
        Ok(())
    }

    pub fn create_config(
        &mut self,
        profile: Profile,
        entrypoint: Entrypoint,
        attributes: &[ConfigAttrib],
    ) -> Result<Handle> {
        let plugin = self
            .plugin_for(profile, entrypoint)
            .ok_or_else(|| self.unsupported(profile, entrypoint))?;
        let mut config = ConfigObject {
            profile,
            entrypoint,
            attributes: vec![ConfigAttrib::new(CONFIG_ATTRIB_RT_FORMAT, RT_FORMAT_YUV420)],
            plugin,
        };
        for attrib in attributes {
            if attrib.attrib_type > CONFIG_ATTRIB_TYPE_MAX {
                return Err(Error::AttrNotSupported(attrib.attrib_type));
            }
            config.set_attribute(*attrib, self.settings.max_config_attributes)?;
        }
        if let Some(rt_format) = config.attribute(CONFIG_ATTRIB_RT_FORMAT) {
            if rt_format != RT_FORMAT_YUV420 {
                return Err(Error::UnsupportedRtFormat(rt_format));
            }
        }
        config.plugin.validate_config(&config)?;
        let handle = self.configs.allocate(config)?;
        debug!("created config {} for {:?}/{:?}", handle, profile, entrypoint);
        Ok(handle)
    }

    pub fn destroy_config(&mut self, config: Handle) -> Result<()> {
        self.configs
            .free(config)
            .map_err(|_| Error::InvalidConfig(config))?;
        Ok(())
    }

    /// Profile, entrypoint and attribute list of an existing config.
    pub fn query_config_attributes(
        &self,
        config: Handle,
    ) -> Result<(Profile, Entrypoint, Vec<ConfigAttrib>)> {
        let obj = self.config(config)?;
        Ok((obj.profile, obj.entrypoint, obj.attributes.clone()))
    }

    pub(crate) fn config(&self, config: Handle) -> Result<&ConfigObject> {
        self.configs.get(config).ok_or(Error::InvalidConfig(config))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bufmgr::fake::FakeBufferManager;

    use super::*;
    use crate::config::DriverConfig;
    use crate::error::Status;

    fn driver() -> Driver {
        Driver::new(Arc::new(FakeBufferManager::new()), DriverConfig::default())
    }

    #[test]
    fn profile_numbering() {
        assert_eq!(Profile::n(14), Some(Profile::VP8Version0_3));
        assert_eq!(Profile::n(-1), Some(Profile::None));
        assert_eq!(Profile::n(5), None);
        assert_eq!(Entrypoint::n(10), Some(Entrypoint::VideoProc));
        assert_eq!(Entrypoint::n(8), None);
    }

    #[test]
    fn vp8_is_the_only_profile() {
        let driver = driver();
        assert_eq!(driver.query_config_profiles(), vec![Profile::VP8Version0_3]);
        assert_eq!(
            driver
                .query_config_entrypoints(Profile::VP8Version0_3)
                .unwrap(),
            vec![Entrypoint::VLD]
        );
        assert!(matches!(
            driver.query_config_entrypoints(Profile::H264High),
            Err(Error::UnsupportedProfile(Profile::H264High))
        ));
    }

    #[test]
    fn unsupported_pairs() {
        let mut driver = driver();
        let status = |r: Result<Handle>| Status::of(&r);
        assert_eq!(
            status(driver.create_config(Profile::H264High, Entrypoint::VLD, &[])),
            Status::UnsupportedProfile
        );
        assert_eq!(
            status(driver.create_config(Profile::VP8Version0_3, Entrypoint::EncSlice, &[])),
            Status::UnsupportedEntrypoint
        );
        assert_eq!(
            status(driver.create_config(Profile::None, Entrypoint::VLD, &[])),
            Status::UnsupportedEntrypoint
        );
    }

    #[test]
    fn get_attributes_reports_rt_format() {
        let driver = driver();
        let mut attribs = [ConfigAttrib::new(0, 0), ConfigAttrib::new(7, 0)];
        driver
            .get_config_attributes(Profile::VP8Version0_3, Entrypoint::VLD, &mut attribs)
            .unwrap();
        assert_eq!(attribs[0].value, RT_FORMAT_YUV420);
        assert_eq!(attribs[1].value, ATTRIB_NOT_SUPPORTED);
    }

    #[test]
    fn create_config_merges_attributes() {
        let mut driver = driver();
        let config = driver
            .create_config(
                Profile::VP8Version0_3,
                Entrypoint::VLD,
                &[
                    ConfigAttrib::new(CONFIG_ATTRIB_RT_FORMAT, RT_FORMAT_YUV420),
                    ConfigAttrib::new(3, 9),
                    ConfigAttrib::new(3, 11),
                ],
            )
            .unwrap();
        let (profile, entrypoint, attribs) = driver.query_config_attributes(config).unwrap();
        assert_eq!(profile, Profile::VP8Version0_3);
        assert_eq!(entrypoint, Entrypoint::VLD);
        assert_eq!(
            attribs,
            vec![
                ConfigAttrib::new(CONFIG_ATTRIB_RT_FORMAT, RT_FORMAT_YUV420),
                ConfigAttrib::new(3, 11)
            ]
        );
        driver.destroy_config(config).unwrap();
        assert!(matches!(
            driver.query_config_attributes(config),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn create_config_rejects_bad_attributes() {
        let mut driver = driver();
        assert!(matches!(
            driver.create_config(
                Profile::VP8Version0_3,
                Entrypoint::VLD,
                &[ConfigAttrib::new(CONFIG_ATTRIB_TYPE_MAX + 1, 0)]
            ),
            Err(Error::AttrNotSupported(_))
        ));
        assert!(matches!(
            driver.create_config(
                Profile::VP8Version0_3,
                Entrypoint::VLD,
                &[ConfigAttrib::new(CONFIG_ATTRIB_RT_FORMAT, 4)]
            ),
            Err(Error::UnsupportedRtFormat(4))
        ));
        let many: Vec<ConfigAttrib> = (1..=10).map(|t| ConfigAttrib::new(t, 0)).collect();
        assert!(matches!(
            driver.create_config(Profile::VP8Version0_3, Entrypoint::VLD, &many),
            Err(Error::MaxNumExceeded(_))
        ));
        assert!(driver.configs.is_empty());
    }
}
