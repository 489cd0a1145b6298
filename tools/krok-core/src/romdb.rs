//! Remembered bankswitch types for specific ROM files.
//!
//! Entries are keyed by `<canonical path>/<content hash>`, so an override
//! only sticks while the file at that path keeps the same content.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::bstype::BankswitchType;
use crate::error::{KrokError, Result};

/// Key/value storage for remembered types. The detector only needs
/// lookups and replacements; the storage format is up to the implementor.
pub trait RomInfoStore {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: &str);
    /// Drop every entry recorded for `file`, whatever its content hash.
    fn remove_file(&mut self, file: &str);
}

/// CRC-32 of the image as eight upper-case hex digits.
pub fn content_hash(image: &[u8]) -> String {
    format!("{:08X}", crc32fast::hash(image))
}

/// Canonical form of `path`, or the path as given when it can't be resolved.
pub fn canonical_file(path: &Path) -> String {
    fs::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .into_owned()
}

pub fn rom_key(file: &str, image: &[u8]) -> String {
    format!("{}/{}", file, content_hash(image))
}

/// Looks up the type recorded for this exact file content. A file with no
/// entry for its current content has its stale entries purged.
pub fn get_rom_info(store: &mut dyn RomInfoStore, path: &Path, image: &[u8]) -> BankswitchType {
    let file = canonical_file(path);
    let key = rom_key(&file, image);

    match store.get(&key).filter(|v| !v.is_empty()) {
        Some(name) => {
            debug!("rom database hit for {}: {}", key, name);
            BankswitchType::from_name(&name)
        }
        None => {
            store.remove_file(&file);
            BankswitchType::None
        }
    }
}

/// Records `bs_type` as the type of this exact file content, replacing
/// anything previously remembered for the file.
pub fn add_rom_info(store: &mut dyn RomInfoStore, path: &Path, bs_type: BankswitchType, image: &[u8]) {
    let file = canonical_file(path);
    let key = rom_key(&file, image);
    store.remove_file(&file);
    store.set(&key, bs_type.name());
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RomTypes {
    #[serde(rename = "rom_type")]
    entries: BTreeMap<String, String>,
}

/// A [`RomInfoStore`] kept in a JSON file. Without a path it lives only in memory.
#[derive(Debug, Default)]
pub struct RomDatabase {
    path: Option<PathBuf>,
    types: RomTypes,
    dirty: bool,
}

impl RomDatabase {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Opens the database at `path`. A missing file is an empty database.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let types = match fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => RomTypes::default(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RomTypes::default(),
            Err(e) => return Err(KrokError::rom_file(path, e)),
        };

        Ok(Self {
            path: Some(path),
            types,
            dirty: false,
        })
    }

    pub fn len(&self) -> usize {
        self.types.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.entries.is_empty()
    }

    /// Writes pending changes back to disk.
    pub fn save(&mut self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !self.dirty {
            return Ok(());
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| KrokError::rom_file(parent, e))?;
        }
        let json = serde_json::to_vec_pretty(&self.types)?;
        fs::write(path, json).map_err(|e| KrokError::rom_file(path, e))?;
        self.dirty = false;
        Ok(())
    }
}

impl RomInfoStore for RomDatabase {
    fn get(&self, key: &str) -> Option<String> {
        self.types.entries.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) {
        self.types.entries.insert(key.to_string(), value.to_string());
        self.dirty = true;
    }

    fn remove_file(&mut self, file: &str) {
        let prefix = format!("{}/", file);
        let before = self.types.entries.len();
        self.types.entries.retain(|k, _| !k.starts_with(&prefix));
        self.dirty |= self.types.entries.len() != before;
    }
}

impl Drop for RomDatabase {
    fn drop(&mut self) {
        if let Err(e) = self.save() {
            warn!("could not save rom database: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remembers_per_content() {
        let mut db = RomDatabase::in_memory();
        let path = Path::new("/roms/game.bin");
        let image = vec![1u8, 2, 3, 4];

        assert_eq!(get_rom_info(&mut db, path, &image), BankswitchType::None);
        add_rom_info(&mut db, path, BankswitchType::F8Sc, &image);
        assert_eq!(get_rom_info(&mut db, path, &image), BankswitchType::F8Sc);

        // same path, new content: forgotten and purged
        let changed = vec![1u8, 2, 3, 5];
        assert_eq!(get_rom_info(&mut db, path, &changed), BankswitchType::None);
        assert!(db.is_empty());
    }

    #[test]
    fn override_replaces_previous_entry() {
        let mut db = RomDatabase::in_memory();
        let path = Path::new("/roms/game.bin");
        add_rom_info(&mut db, path, BankswitchType::F8, &[0u8; 8]);
        add_rom_info(&mut db, path, BankswitchType::Bs3F, &[1u8; 8]);
        assert_eq!(db.len(), 1);
        assert_eq!(get_rom_info(&mut db, path, &[1u8; 8]), BankswitchType::Bs3F);
    }

    #[test]
    fn persists_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("krok").join("romtypes.json");
        let rom = Path::new("/roms/a.bin");

        {
            let mut db = RomDatabase::open(&db_path).unwrap();
            add_rom_info(&mut db, rom, BankswitchType::Ua, &[9u8; 16]);
            db.save().unwrap();
        }

        let mut db = RomDatabase::open(&db_path).unwrap();
        assert_eq!(get_rom_info(&mut db, rom, &[9u8; 16]), BankswitchType::Ua);
    }

    #[test]
    fn hash_is_stable() {
        assert_eq!(content_hash(b"123456789"), "CBF43926");
    }
}
