use std::{fs, path::Path};

use anyhow::Result;
use libvb::{Binding, EventKind, Subsystem};
use log::debug;
use serde::Deserialize;

pub const DEFAULT_LIBVIRT_URI: &str = "qemu:///system";

#[derive(Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct CtlConfig {
    /// libvirt connection URI
    pub uri: String,
    /// Flags passed to parameter and statistics calls
    pub flags: u32,
    /// Event kinds `watch` subscribes to when none are given
    pub events: Vec<EventKind>,
}

impl Default for CtlConfig {
    fn default() -> Self {
        Self {
            uri: DEFAULT_LIBVIRT_URI.to_string(),
            flags: 0,
            events: vec![EventKind::Lifecycle],
        }
    }
}

impl CtlConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        debug!("loading config {}", path.display());
        let config = fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&config)?)
    }

    pub fn connect(&self) -> Result<Binding<Box<dyn Subsystem>>> {
        Ok(Binding::new(libvm::connect(&self.uri)?))
    }
}
