// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Last known bottle, kept in a small TOML file next to the history.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::bluetooth::DeviceId;
use crate::collaborators::DeviceRegistry;

#[derive(Debug, Default, Serialize, Deserialize)]
struct KnownDeviceFile {
    last_device: Option<DeviceId>,
}

/// File-backed [`DeviceRegistry`].
pub struct KnownDevice {
    path: PathBuf,
    last: Option<DeviceId>,
}

impl KnownDevice {
    /// Load from `data_dir/known_device.toml`. A missing or unreadable file
    /// means no bottle is known yet.
    pub fn load(data_dir: &Path) -> Self {
        let path = data_dir.join("known_device.toml");
        let last = match std::fs::read_to_string(&path) {
            Ok(content) => match toml::from_str::<KnownDeviceFile>(&content) {
                Ok(file) => file.last_device,
                Err(e) => {
                    warn!("Ignoring corrupt {:?}: {}", path, e);
                    None
                }
            },
            Err(_) => None,
        };
        debug!("Last known bottle: {:?}", last);
        Self { path, last }
    }
}

impl DeviceRegistry for KnownDevice {
    fn last_known(&self) -> Option<DeviceId> {
        self.last.clone()
    }

    fn remember(&mut self, device: &DeviceId) -> Result<()> {
        if self.last.as_ref() == Some(device) {
            return Ok(());
        }
        let file = KnownDeviceFile {
            last_device: Some(device.clone()),
        };
        std::fs::write(&self.path, toml::to_string_pretty(&file)?)?;
        self.last = Some(device.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_remember_survives_reload() {
        let dir = tempdir().unwrap();
        let mut registry = KnownDevice::load(dir.path());
        assert_eq!(registry.last_known(), None);

        let bottle = DeviceId::new("C0:FF:EE:00:00:01");
        registry.remember(&bottle).unwrap();
        assert_eq!(registry.last_known(), Some(bottle.clone()));

        let reloaded = KnownDevice::load(dir.path());
        assert_eq!(reloaded.last_known(), Some(bottle));
    }

    #[test]
    fn test_corrupt_file_is_ignored() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("known_device.toml"), "last_device = [").unwrap();
        assert_eq!(KnownDevice::load(dir.path()).last_known(), None);
    }
}
