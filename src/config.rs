// Copyright 2025 The Kindling Developers.
// SPDX-License-Identifier: Apache-2.0

//! Machine configuration.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Hard cap on configured vCPUs.
pub const MAX_VCPUS: u8 = 32;

#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum ConfigError {
    /// Cannot read configuration file {0}: {1}
    ReadFile(PathBuf, io::Error),
    /// Malformed configuration: {0}
    Parse(#[from] serde_json::Error),
    /// The number of vCPUs must be between 1 and 32
    VcpuCount,
    /// Guest memory size must be non-zero
    MemSize,
    /// Unknown device class {0}
    UnknownDeviceClass(String),
}

/// Everything needed to build a [`crate::Machine`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineConfig {
    pub vcpu_count: u8,
    pub mem_size_mib: u64,
    pub bios_path: PathBuf,
    /// Enables unhandled-access and slow-dispatch logging on the hot path.
    #[serde(default)]
    pub debug: bool,
    /// Device classes instantiated under the system root.
    #[serde(default)]
    pub devices: Vec<String>,
}

impl MachineConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<MachineConfig, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::ReadFile(path.to_path_buf(), err))?;
        let config: MachineConfig = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vcpu_count == 0 || self.vcpu_count > MAX_VCPUS {
            return Err(ConfigError::VcpuCount);
        }
        if self.mem_size_mib == 0 {
            return Err(ConfigError::MemSize);
        }
        for class in &self.devices {
            if !crate::devices::is_known_class(class) {
                return Err(ConfigError::UnknownDeviceClass(class.clone()));
            }
        }
        Ok(())
    }
}
