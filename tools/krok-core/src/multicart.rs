//! Multicart images: a menu program in the first slot followed by up to
//! `max_entries` games, all of the same bankswitch family.
//!
//! The menu finds the game names in a table of 13 byte entries inside its
//! own image. Each byte is an offset into the menu font (glyph index × 5
//! rows) and the whole entry is stored rotated left by one byte, which is
//! how the menu kernel expects to read it.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::bstype::BankswitchType;
use crate::cart::{pad_image, Cartridge, TransferState};
use crate::detector::autodetect_type;
use crate::error::{KrokError, Result};
use crate::romdb::RomInfoStore;

pub const MENU_NAME_LEN: usize = 13;
/// Glyphs in the menu font, in font order.
pub const MENU_CHARSET: &[u8; 44] = b" ABCDEFGHIJKLMNOPQRSTUVWXYZ*=0123456789_().-";
const FONT_HEIGHT: u8 = 5;

/// Where things live in a multicart of a given type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MulticartLayout {
    pub kind: BankswitchType,
    /// The type every game must have (plain 4K games are always accepted).
    pub sub_type: BankswitchType,
    /// Size of the menu and of every game slot.
    pub entry_size: usize,
    pub max_entries: usize,
    /// Offset of the name table inside the menu image.
    pub name_table: usize,
}

impl MulticartLayout {
    pub const fn for_type(kind: BankswitchType) -> Option<Self> {
        use BankswitchType::*;
        let (sub_type, entry_size, max_entries, name_table) = match kind {
            Mc4K => (Bs4K, 4096, 127, 0x0200),
            McF8 => (F8, 8192, 63, 0x1200),
            McF6 => (F6, 16384, 31, 0x1200),
            McF4 => (F4, 32768, 15, 0x1200),
            _ => return Option::None,
        };
        Some(Self {
            kind,
            sub_type,
            entry_size,
            max_entries,
            name_table,
        })
    }

    /// Offset of the TV type byte; the entry count follows it.
    pub const fn trailer(&self) -> usize {
        self.name_table + self.max_entries * MENU_NAME_LEN
    }

    /// File name of the menu loader for this type, e.g. `MCF8.a26`.
    pub fn menu_file(&self) -> String {
        format!("{}.a26", self.kind.name())
    }

    pub fn accepts(&self, game: BankswitchType) -> bool {
        game == self.sub_type || game == BankswitchType::Bs4K
    }
}

/// Encodes a game name for the menu's name table.
pub fn encode_menu_name(name: &str) -> [u8; MENU_NAME_LEN] {
    let mut encoded = [0u8; MENU_NAME_LEN];
    for (slot, c) in encoded.iter_mut().zip(name.bytes()) {
        let c = c.to_ascii_uppercase();
        let glyph = MENU_CHARSET.iter().position(|&g| g == c).unwrap_or(0);
        *slot = glyph as u8 * FONT_HEIGHT;
    }
    encoded.rotate_left(1);
    encoded
}

/// Menu name for a ROM file: the upper-cased file stem, cut to fit.
pub fn menu_name_for(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_uppercase())
        .unwrap_or_default()
        .chars()
        .take(MENU_NAME_LEN)
        .collect()
}

impl Cartridge {
    /// Builds a multicart from the menu loader found in the configured
    /// menu directory and the given games.
    pub fn load_multi(
        &mut self,
        menu_names: &[String],
        file_paths: &[PathBuf],
        kind: BankswitchType,
        ntsc: bool,
        out: Option<&Path>,
    ) -> Result<()> {
        let layout = MulticartLayout::for_type(kind).ok_or(KrokError::NotMulticart(kind))?;
        let menu_path = self
            .config
            .menu_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(layout.menu_file());

        let menu = match fs::read(&menu_path) {
            Ok(menu) if !menu.is_empty() => menu,
            Ok(_) => {
                let err = std::io::Error::new(std::io::ErrorKind::InvalidData, "empty menu loader");
                return Err(self.multi_failed(KrokError::rom_file(&menu_path, err)));
            }
            Err(e) => return Err(self.multi_failed(KrokError::rom_file(&menu_path, e))),
        };
        self.load_multi_with_menu(&menu, menu_names, file_paths, kind, ntsc, out)
    }

    /// Like [`load_multi`](Self::load_multi) with the menu loader image supplied directly.
    pub fn load_multi_with_menu(
        &mut self,
        menu: &[u8],
        menu_names: &[String],
        file_paths: &[PathBuf],
        kind: BankswitchType,
        ntsc: bool,
        out: Option<&Path>,
    ) -> Result<()> {
        self.reset();
        let layout = MulticartLayout::for_type(kind).ok_or(KrokError::NotMulticart(kind))?;

        if menu_names.len() != file_paths.len() {
            return Err(self.multi_failed(KrokError::InconsistentMulticartEntry {
                missing_menus: file_paths.len().saturating_sub(menu_names.len()),
                missing_files: menu_names.len().saturating_sub(file_paths.len()),
            }));
        }

        let menu_len = menu.len().min(layout.entry_size);
        self.data[..menu_len].copy_from_slice(&menu[..menu_len]);
        pad_image(&mut self.data[..layout.entry_size], menu_len, layout.entry_size);

        let mut count = 0usize;
        let mut skipped = 0usize;
        for (name, path) in menu_names.iter().zip(file_paths) {
            if count == layout.max_entries {
                skipped += 1;
                continue;
            }
            match self.add_game(&layout, count, name, path) {
                Ok(()) => count += 1,
                Err(reason) => {
                    warn!("skipping '{}': {}", path.display(), reason);
                    skipped += 1;
                }
            }
        }

        let trailer = layout.trailer();
        self.data[trailer] = if ntsc { 0 } else { 1 };
        self.data[trailer + 1] = count as u8;

        if count == 0 {
            return Err(self.multi_failed(KrokError::NoMulticartEntries));
        }

        self.size = layout.entry_size * (count + 1);
        self.loaded_len = self.size;
        self.bs_type = kind;
        self.detected = kind;
        self.modified.fill(true);
        self.state = TransferState::Idle;
        self.valid = true;

        let mut message = format!("Multicart ({}) with {} entries created", kind, count);
        if skipped > 0 {
            let _ = write!(message, ", {} skipped", skipped);
        }
        message.push('.');
        self.message = message;
        info!("{}", self.message);

        if let Some(out) = out.filter(|p| !p.as_os_str().is_empty()) {
            fs::write(out, &self.data[..self.size]).map_err(|e| KrokError::rom_file(out, e))?;
            info!("multicart image written to '{}'", out.display());
            self.source = Some(out.to_path_buf());
        }
        Ok(())
    }

    /// Builds the multicart described by an info file.
    pub fn load_info(&mut self, info: &MulticartInfo) -> Result<()> {
        let (names, files): (Vec<String>, Vec<PathBuf>) = info.entries()?.into_iter().unzip();
        self.load_multi(&names, &files, info.kind, info.ntsc, info.bin_path.as_deref())
    }

    /// Copies one game into slot `index + 1` and names it in the menu.
    fn add_game(&mut self, layout: &MulticartLayout, index: usize, name: &str, path: &Path) -> std::result::Result<(), String> {
        let rom = fs::read(path).map_err(|e| e.to_string())?;
        if rom.is_empty() {
            return Err("empty file".into());
        }
        if rom.len() > layout.entry_size {
            return Err(format!("{} bytes don't fit a {} byte slot", rom.len(), layout.entry_size));
        }

        let game = autodetect_type(path, &rom, self.store());
        if !layout.accepts(game) {
            return Err(format!("type {} doesn't belong in a {} multicart", game, layout.kind));
        }

        let start = layout.entry_size * (index + 1);
        let slot = &mut self.data[start..start + layout.entry_size];
        slot[..rom.len()].copy_from_slice(&rom);
        pad_image(slot, rom.len(), layout.entry_size);

        let at = layout.name_table + index * MENU_NAME_LEN;
        self.data[at..at + MENU_NAME_LEN].copy_from_slice(&encode_menu_name(name));
        Ok(())
    }

    fn multi_failed(&mut self, err: KrokError) -> KrokError {
        self.valid = false;
        self.message = format!("Couldn't create multicart: {}", err);
        warn!("{}", self.message);
        err
    }
}

/// Every ROM in `dir` that fits a multicart of type `kind`, sorted by file
/// name, at most as many as the multicart holds.
pub fn roms_from_folder(
    dir: &Path,
    kind: BankswitchType,
    mut store: Option<&mut dyn RomInfoStore>,
) -> Result<Vec<(String, PathBuf)>> {
    let layout = MulticartLayout::for_type(kind).ok_or(KrokError::NotMulticart(kind))?;

    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| KrokError::rom_file(dir, e))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && is_rom_file(p))
        .collect();
    files.sort();

    let mut roms = Vec::new();
    for path in files {
        if roms.len() == layout.max_entries {
            break;
        }
        let Ok(rom) = fs::read(&path) else {
            continue;
        };
        if rom.is_empty() || rom.len() > layout.entry_size {
            continue;
        }
        let game = match store {
            Some(ref mut store) => {
                let store: &mut dyn RomInfoStore = &mut **store;
                autodetect_type(&path, &rom, Some(store))
            }
            None => autodetect_type(&path, &rom, None),
        };
        if layout.accepts(game) {
            roms.push((menu_name_for(&path), path));
        }
    }
    Ok(roms)
}

fn is_rom_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| ["a26", "bin", "rom"].iter().any(|x| e.eq_ignore_ascii_case(x)))
        .unwrap_or(false)
}

const INFO_SECTION: &str = "Images";

/// Multicart info file (`*.mul`), an INI file with a single `[Images]`
/// section listing the multicart type, TV type, output path and games.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticartInfo {
    pub kind: BankswitchType,
    pub ntsc: bool,
    pub bin_path: Option<PathBuf>,
    /// `(menu name, file)` for each slot, either side may be blank.
    pub rows: Vec<(String, String)>,
}

impl MulticartInfo {
    pub fn new(kind: BankswitchType) -> Result<Self> {
        let layout = MulticartLayout::for_type(kind).ok_or(KrokError::NotMulticart(kind))?;
        Ok(Self {
            kind,
            ntsc: true,
            bin_path: None,
            rows: vec![(String::new(), String::new()); layout.max_entries],
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| KrokError::rom_file(path, e))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut info = Self::new(BankswitchType::Mc4K)?;
        let mut in_section = false;

        for (n, line) in text.lines().enumerate() {
            let line_no = n + 1;
            let line = line.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }
            if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                in_section = section.trim().eq_ignore_ascii_case(INFO_SECTION);
                continue;
            }
            if !in_section {
                continue;
            }

            let (key, value) = line.split_once('=').ok_or_else(|| info_error(line_no, "expected key=value"))?;
            let (key, value) = (key.trim(), value.trim());

            if key.eq_ignore_ascii_case("Type") {
                let kind = match value {
                    "0" => BankswitchType::Mc4K,
                    "1" => BankswitchType::McF8,
                    "2" => BankswitchType::McF6,
                    "3" => BankswitchType::McF4,
                    _ => return Err(info_error(line_no, &format!("unknown multicart type '{}'", value))),
                };
                info.set_kind(kind)?;
            } else if key.eq_ignore_ascii_case("TVType") {
                info.ntsc = match value {
                    "0" => true,
                    "1" => false,
                    _ => return Err(info_error(line_no, &format!("unknown TV type '{}'", value))),
                };
            } else if key.eq_ignore_ascii_case("BinPath") {
                info.bin_path = (!value.is_empty()).then(|| PathBuf::from(value));
            } else if let Some((index, is_menu)) = row_key(key) {
                if index == 0 {
                    return Err(info_error(line_no, "entries are numbered from 001"));
                }
                if index > info.rows.len() {
                    info.rows.resize(index, (String::new(), String::new()));
                }
                let row = &mut info.rows[index - 1];
                if is_menu {
                    row.0 = value.to_string();
                } else {
                    row.1 = value.to_string();
                }
            } else {
                warn!("multicart info line {}: ignoring unknown key '{}'", line_no, key);
            }
        }
        Ok(info)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_ini()).map_err(|e| KrokError::rom_file(path, e))
    }

    pub fn to_ini(&self) -> String {
        let kind = match self.kind {
            BankswitchType::McF8 => 1,
            BankswitchType::McF6 => 2,
            BankswitchType::McF4 => 3,
            _ => 0,
        };
        let mut ini = format!("[{}]\nType={}\nTVType={}\n", INFO_SECTION, kind, if self.ntsc { 0 } else { 1 });
        let bin_path = self.bin_path.as_deref().map(|p| p.display().to_string()).unwrap_or_default();
        let _ = writeln!(ini, "BinPath={}", bin_path);
        for (i, (menu, file)) in self.rows.iter().enumerate() {
            let _ = writeln!(ini, "Menu{:03}={}", i + 1, menu);
            let _ = writeln!(ini, "File{:03}={}", i + 1, file);
        }
        ini
    }

    /// Switches the multicart type, resizing the table to its capacity.
    /// Rows beyond the new capacity are dropped.
    pub fn set_kind(&mut self, kind: BankswitchType) -> Result<()> {
        let layout = MulticartLayout::for_type(kind).ok_or(KrokError::NotMulticart(kind))?;
        self.kind = kind;
        self.rows.resize(layout.max_entries, (String::new(), String::new()));
        Ok(())
    }

    /// The complete rows. A row with only one of its two fields set is an
    /// error, empty rows are ignored.
    pub fn entries(&self) -> Result<Vec<(String, PathBuf)>> {
        let mut missing_menus = 0;
        let mut missing_files = 0;
        let mut entries = Vec::new();

        for (menu, file) in &self.rows {
            match (menu.is_empty(), file.is_empty()) {
                (false, false) => entries.push((menu.clone(), PathBuf::from(file))),
                (true, false) => missing_menus += 1,
                (false, true) => missing_files += 1,
                (true, true) => {}
            }
        }

        if missing_menus + missing_files > 0 {
            return Err(KrokError::InconsistentMulticartEntry {
                missing_menus,
                missing_files,
            });
        }
        Ok(entries)
    }
}

/// `Menu007` → `(7, true)`, `File012` → `(12, false)`.
fn row_key(key: &str) -> Option<(usize, bool)> {
    let prefix = key.get(..4)?;
    let is_menu = if prefix.eq_ignore_ascii_case("menu") {
        true
    } else if prefix.eq_ignore_ascii_case("file") {
        false
    } else {
        return None;
    };
    key[4..].parse().ok().map(|n| (n, is_menu))
}

fn info_error(line: usize, reason: &str) -> KrokError {
    KrokError::InfoFile {
        line,
        reason: reason.to_string(),
    }
}
