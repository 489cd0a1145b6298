//! The cartridge image that gets written to a Krokodile Cartridge.
//!
//! The cart is addressed in 256 byte sectors, 2048 of them. Most images
//! occupy sectors `0..size/256`. 3E and 3F images additionally need their
//! last 2K bank at the very top of the flash (sectors 2040..=2047), so those
//! carts are transferred as two disjoint sector ranges.

use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::bstype::BankswitchType;
use crate::detector::autodetect_type;
use crate::error::{KrokError, Result};
use crate::romdb::{add_rom_info, RomInfoStore};

pub const SECTOR_SIZE: usize = 256;
pub const MAX_SECTORS: usize = 2048;
/// 2048 sectors of 256 bytes each.
pub const MAX_CART_SIZE: usize = SECTOR_SIZE * MAX_SECTORS;

/// Size of the bank 3E/3F carts keep fixed at the top of the address space.
pub const HIGH_BANK_SIZE: usize = 2048;
pub const HIGH_BANK_FIRST_SECTOR: u16 = ((MAX_CART_SIZE - HIGH_BANK_SIZE) / SECTOR_SIZE) as u16;

/// Everything shorter than this is tiled up to it.
pub const MIN_CART_SIZE: usize = 4096;

/// Paths and transfer options, owned by whoever creates the [`Cartridge`].
#[derive(Debug, Clone, Default)]
pub struct CartConfig {
    /// Where the last successfully written image is kept for incremental downloads.
    pub last_image_path: Option<PathBuf>,
    /// Directory holding the multicart menu loaders (`MC4K.a26`, `MCF8.a26`, ...).
    pub menu_dir: Option<PathBuf>,
    /// Extra attempts per sector after the first one fails.
    pub retry: u32,
    /// Only transfer sectors that differ from the last written image.
    pub incremental: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Transfer {
    Write,
    Verify,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    InProgress(Transfer),
    Complete(Transfer),
    Failed(Transfer),
}

pub struct Cartridge {
    pub(crate) data: Box<[u8]>,
    pub(crate) size: usize,
    /// Bytes that came from the ROM file(s), before any padding.
    pub(crate) loaded_len: usize,
    pub(crate) bs_type: BankswitchType,
    pub(crate) detected: BankswitchType,
    pub(crate) source: Option<PathBuf>,
    pub(crate) config: CartConfig,
    pub(crate) rom_store: Option<Box<dyn RomInfoStore + Send>>,

    pub(crate) modified: Box<[bool]>,
    pub(crate) current_sector: u16,
    pub(crate) num_sectors: u16,
    pub(crate) processed: u16,
    pub(crate) transmitted: u16,
    pub(crate) state: TransferState,

    pub(crate) message: String,
    pub(crate) valid: bool,
}

impl Cartridge {
    pub fn new(config: CartConfig) -> Self {
        Self {
            data: vec![0u8; MAX_CART_SIZE].into_boxed_slice(),
            size: 0,
            loaded_len: 0,
            bs_type: BankswitchType::None,
            detected: BankswitchType::None,
            source: None,
            config,
            rom_store: None,
            modified: vec![true; MAX_SECTORS].into_boxed_slice(),
            current_sector: 0,
            num_sectors: 0,
            processed: 0,
            transmitted: 0,
            state: TransferState::Idle,
            message: String::new(),
            valid: false,
        }
    }

    /// Consult (and update) `store` when detecting types.
    pub fn with_rom_store(mut self, store: impl RomInfoStore + Send + 'static) -> Self {
        self.rom_store = Some(Box::new(store));
        self
    }

    pub fn config(&self) -> &CartConfig {
        &self.config
    }

    pub fn set_retry(&mut self, retry: u32) {
        self.config.retry = retry;
    }

    pub fn retry(&self) -> u32 {
        self.config.retry
    }

    pub fn set_incremental(&mut self, enable: bool) {
        self.config.incremental = enable;
    }

    pub fn incremental(&self) -> bool {
        self.config.incremental
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Outcome of the last operation, good or bad.
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn bs_type(&self) -> BankswitchType {
        self.bs_type
    }

    /// The type found by autodetection, even if it was overridden since.
    pub fn detected_bs_type(&self) -> BankswitchType {
        self.detected
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// The logical image, without the 3E/3F high bank copy.
    pub fn image(&self) -> &[u8] {
        &self.data[..self.size]
    }

    /// The full flash contents, `MAX_CART_SIZE` bytes.
    pub fn flash_image(&self) -> &[u8] {
        &self.data
    }

    pub fn sector_data(&self, sector: u16) -> &[u8] {
        let start = sector as usize * SECTOR_SIZE;
        &self.data[start..start + SECTOR_SIZE]
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    /// Loads a single ROM. `type_override` of `None` or `Auto` runs detection.
    pub fn load_single(&mut self, path: &Path, type_override: Option<BankswitchType>) -> Result<()> {
        self.reset();
        let result = self.read_single(path, type_override);
        if let Err(e) = &result {
            self.message = format!("Couldn't load '{}': {}", path.display(), e);
            warn!("{}", self.message);
        }
        result
    }

    fn read_single(&mut self, path: &Path, type_override: Option<BankswitchType>) -> Result<()> {
        info!("Reading from file: '{}'", path.display());
        let rom = fs::read(path).map_err(|e| KrokError::rom_file(path, e))?;
        if rom.is_empty() {
            return Err(KrokError::rom_file(
                path,
                std::io::Error::new(std::io::ErrorKind::InvalidData, "empty ROM image"),
            ));
        }

        let len = rom.len().min(MAX_CART_SIZE);
        if len < rom.len() {
            warn!("{} is larger than the cart, only the first {} bytes are used", path.display(), len);
        }
        self.data[..len].copy_from_slice(&rom[..len]);
        self.size = len;
        self.loaded_len = len;
        self.source = Some(path.to_path_buf());

        self.detected = autodetect_type(path, &rom[..len], self.store());
        self.bs_type = match type_override {
            Some(t) if t != BankswitchType::Auto => {
                info!("Bankswitch type: {} (overriding auto-detected {})", t, self.detected);
                t
            }
            _ => {
                info!("Bankswitch type: {} (auto-detected)", self.detected);
                self.detected
            }
        };

        if !self.bs_type.is_supported() {
            return Err(KrokError::UnsupportedBankswitchType(self.bs_type));
        }

        self.layout_image();
        self.valid = true;
        self.message = format!(
            "Loaded '{}' ({} bytes, {}).",
            path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default(),
            self.size,
            self.bs_type
        );
        Ok(())
    }

    /// Switches the loaded image to another type, as when the user disagrees
    /// with detection.
    pub fn set_bs_type(&mut self, bs_type: BankswitchType) -> Result<()> {
        if self.loaded_len == 0 {
            return Err(KrokError::InvalidCartridge);
        }
        if !bs_type.is_supported() {
            self.message = format!("Bankswitch type {} is not supported.", bs_type);
            return Err(KrokError::UnsupportedBankswitchType(bs_type));
        }

        let rom = self.loaded_rom();
        self.data[..rom.len()].copy_from_slice(&rom);
        self.bs_type = bs_type;
        self.size = self.loaded_len;
        self.layout_image();
        self.valid = true;
        self.num_sectors = 0;
        self.state = TransferState::Idle;
        self.message = format!("Bankswitch type set to {}.", bs_type);
        Ok(())
    }

    /// Remembers the current type for this exact ROM file in the ROM store.
    pub fn remember_bs_type(&mut self) -> Result<()> {
        let Some(path) = self.source.clone() else {
            return Err(KrokError::InvalidCartridge);
        };
        let rom = self.loaded_rom();
        let Some(store) = self.rom_store.as_deref_mut() else {
            return Ok(());
        };
        add_rom_info(store, &path, self.bs_type, &rom);
        Ok(())
    }

    /// The image as it was read, before the high bank was moved on top of
    /// its tail.
    fn loaded_rom(&self) -> Vec<u8> {
        let mut rom = self.data[..self.loaded_len].to_vec();
        let top = MAX_CART_SIZE - HIGH_BANK_SIZE;
        if self.bs_type.has_fixed_high_bank() && self.loaded_len > top && self.loaded_len < MAX_CART_SIZE {
            let tail = self.loaded_len - top;
            rom[top..].copy_from_slice(&self.data[MAX_CART_SIZE - tail..]);
        }
        rom
    }

    pub(crate) fn store(&mut self) -> Option<&mut dyn RomInfoStore> {
        match self.rom_store.as_deref_mut() {
            Some(store) => Some(store as &mut dyn RomInfoStore),
            None => None,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.data.fill(0);
        self.size = 0;
        self.loaded_len = 0;
        self.bs_type = BankswitchType::None;
        self.detected = BankswitchType::None;
        self.source = None;
        self.modified.fill(true);
        self.current_sector = 0;
        self.num_sectors = 0;
        self.processed = 0;
        self.transmitted = 0;
        self.state = TransferState::Idle;
        self.valid = false;
    }

    /// Pads short images and places the 3E/3F high bank.
    fn layout_image(&mut self) {
        let required = self.bs_type.native_size().max(MIN_CART_SIZE);
        if self.size < required {
            info!("Converting to {}K.", required / 1024);
            pad_image(&mut self.data, self.size, required);
            self.size = required;
        }

        if self.bs_type.has_fixed_high_bank() {
            let top = MAX_CART_SIZE - HIGH_BANK_SIZE;
            let from = self.size - HIGH_BANK_SIZE;
            self.data.copy_within(from..self.size, top);
            // the low range has to end where the high bank starts
            if self.size > top && self.size < MAX_CART_SIZE {
                warn!("{} byte image overlaps the high bank, low range cut to {} bytes.", self.size, top);
                self.size = top;
            }
        }
        self.modified.fill(true);
    }

    /// Number of sectors in the contiguous low range.
    fn low_sectors(&self) -> u16 {
        self.size.div_ceil(SECTOR_SIZE) as u16
    }

    /// Whether the 3E/3F high bank lives in its own sector range.
    fn has_high_range(&self) -> bool {
        self.bs_type.has_fixed_high_bank() && self.low_sectors() <= HIGH_BANK_FIRST_SECTOR
    }

    /// Every sector of the image in transfer order.
    pub fn sectors(&self) -> impl Iterator<Item = u16> + use<> {
        let high = if self.has_high_range() {
            HIGH_BANK_FIRST_SECTOR..MAX_SECTORS as u16
        } else {
            0..0
        };
        (0..self.low_sectors()).chain(high)
    }

    /// Rewinds the sector iterator in preparation for a write (`download`)
    /// or verify pass, returning how many sectors it will visit.
    ///
    /// For an incremental download the image is compared against the last
    /// written one and only differing sectors are marked for transfer.
    pub fn enumerate_sectors(&mut self, download: bool) -> u16 {
        self.current_sector = 0;
        self.processed = 0;
        self.transmitted = 0;

        if !self.valid {
            self.num_sectors = 0;
            self.state = TransferState::Idle;
            return 0;
        }

        self.num_sectors = self.sectors().count() as u16;
        self.state = TransferState::InProgress(if download { Transfer::Write } else { Transfer::Verify });
        self.modified.fill(true);

        if download && self.config.incremental {
            match self.read_last_image() {
                Some(last) => {
                    let sectors: Vec<u16> = self.sectors().collect();
                    let mut changed = 0;
                    for sector in sectors {
                        let start = sector as usize * SECTOR_SIZE;
                        let range = start..start + SECTOR_SIZE;
                        let differs = self.data[range.clone()] != last[range];
                        self.modified[sector as usize] = differs;
                        changed += differs as u16;
                    }
                    self.message = format!("{} of {} sectors changed since the last download.", changed, self.num_sectors);
                }
                None => {
                    self.message = format!("No previous download to compare with, writing all {} sectors.", self.num_sectors);
                }
            }
            info!("{}", self.message);
        }

        self.num_sectors
    }

    /// The sector the next write/verify will touch.
    pub fn current_sector(&self) -> u16 {
        self.current_sector
    }

    pub fn num_sectors(&self) -> u16 {
        self.num_sectors
    }

    /// Sectors handled so far in this pass, skipped ones included.
    pub fn sectors_processed(&self) -> u16 {
        self.processed
    }

    pub fn is_modified(&self, sector: u16) -> bool {
        self.modified.get(sector as usize).copied().unwrap_or(false)
    }

    /// Sectors of the image that need transferring in this pass.
    pub fn modified_count(&self) -> u16 {
        self.sectors().filter(|&s| self.modified[s as usize]).count() as u16
    }

    /// Steps the iterator, jumping from the end of the low range straight
    /// to the 3E/3F high bank.
    pub(crate) fn advance(&mut self) {
        self.processed += 1;
        self.current_sector += 1;
        if self.has_high_range() && self.current_sector == self.low_sectors() {
            self.current_sector = HIGH_BANK_FIRST_SECTOR;
        }
    }

    fn read_last_image(&self) -> Option<Vec<u8>> {
        let path = self.config.last_image_path.as_ref()?;
        match fs::read(path) {
            Ok(last) if last.len() == MAX_CART_SIZE => Some(last),
            Ok(_) => {
                warn!("ignoring {}, it is not a full cart image", path.display());
                None
            }
            Err(_) => None,
        }
    }

    pub(crate) fn write_last_image(&self) -> Result<()> {
        let Some(path) = self.config.last_image_path.as_ref() else {
            return Ok(());
        };
        fs::write(path, &self.data).map_err(|e| KrokError::rom_file(path, e))
    }
}

/// Repeats `buffer[..filled]` until `required` bytes are used, so a small
/// ROM mirrors itself across a larger address space.
pub fn pad_image(buffer: &mut [u8], filled: usize, required: usize) {
    if filled == 0 {
        return;
    }
    let mut len = filled;
    while len < required {
        let chunk = filled.min(required - len);
        buffer.copy_within(0..chunk, len);
        len += chunk;
    }
}
