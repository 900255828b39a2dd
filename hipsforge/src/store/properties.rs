//! The `properties` metadata file.
//!
//! A flat key/value file at the store root describing the published survey:
//! leaf order, frame, tile format, the stored check-code string, tile count
//! and estimated size. Read and conditionally rewritten by the integrity
//! subsystem.

use std::path::Path;

use ini::Ini;

use crate::error::{Error, Result};

pub const KEY_ORDER: &str = "hips_order";
pub const KEY_FRAME: &str = "hips_frame";
pub const KEY_TILE_FORMAT: &str = "hips_tile_format";
pub const KEY_TILE_WIDTH: &str = "hips_tile_width";
pub const KEY_CHECK_CODE: &str = "hips_check_code";
pub const KEY_NB_TILES: &str = "hips_nb_tiles";
pub const KEY_EST_SIZE: &str = "hips_estsize";
pub const KEY_RELEASE_DATE: &str = "hips_release_date";

/// In-memory view of the properties file.
#[derive(Debug, Clone, Default)]
pub struct Properties {
    ini: Ini,
}

impl Properties {
    /// Load from `path`; a missing file yields an empty set.
    pub fn load(path: &Path) -> Result<Properties> {
        if !path.is_file() {
            return Ok(Properties::default());
        }
        let ini = Ini::load_from_file(path)
            .map_err(|e| Error::Properties(format!("{}: {e}", path.display())))?;
        Ok(Properties { ini })
    }

    /// Persist to `path`, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.ini
            .write_to_file(path)
            .map_err(|e| Error::Properties(format!("{}: {e}", path.display())))?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.ini.get_from(None::<String>, key)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key)?.trim().parse().ok()
    }

    pub fn get_u8(&self, key: &str) -> Option<u8> {
        self.get(key)?.trim().parse().ok()
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.ini.set_to(None::<String>, key.to_string(), value.into());
    }

    pub fn remove(&mut self, key: &str) {
        self.ini.delete_from(None::<String>, key);
    }

    /// Stamp the release date with the current local time.
    pub fn touch_release_date(&mut self) {
        let now = chrono::Local::now();
        self.set(KEY_RELEASE_DATE, now.format("%Y-%m-%dT%H:%M:%S").to_string());
    }
}
