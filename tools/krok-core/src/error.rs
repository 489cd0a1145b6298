use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::bstype::BankswitchType;

#[derive(Debug, Error)]
pub enum KrokError {
    #[error("invalid cartridge, nothing has been loaded successfully")]
    InvalidCartridge,
    #[error("all sectors have already been transferred")]
    SectorsExhausted,
    #[error("sector {sector} failed after {attempts} attempt(s)")]
    MaxRetriesExceeded { sector: u16, attempts: u32 },
    #[error("the Krokodile Cartridge does not support bankswitch type '{0}'")]
    UnsupportedBankswitchType(BankswitchType),
    #[error("multicart entries are inconsistent ({missing_menus} missing menu names, {missing_files} missing file names)")]
    InconsistentMulticartEntry { missing_menus: usize, missing_files: usize },
    #[error("serial transport error: {0}")]
    TransportIO(#[from] io::Error),
    #[error("the serial port is already in use by another transfer")]
    Busy,
    #[error("write and verify cannot share one sector pass; enumerate sectors again first")]
    SessionMismatch,
    #[error("'{0}' is not a multicart bankswitch type")]
    NotMulticart(BankswitchType),
    #[error("no multicart entries could be added")]
    NoMulticartEntries,
    #[error("could not access '{}': {source}", path.display())]
    RomFile { path: PathBuf, source: io::Error },
    #[error("rom database: {0}")]
    Database(#[from] serde_json::Error),
    #[error("multicart info file, line {line}: {reason}")]
    InfoFile { line: usize, reason: String },
}

impl KrokError {
    pub(crate) fn rom_file(path: impl Into<PathBuf>, source: io::Error) -> Self {
        KrokError::RomFile { path: path.into(), source }
    }
}

pub type Result<T> = std::result::Result<T, KrokError>;
