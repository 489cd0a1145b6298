//! Core of the Krokodile Cartridge loader: bankswitch detection, cart image
//! assembly and the sector protocol, independent of any serial port API.

pub mod bstype;
pub mod cart;
pub mod detector;
pub mod error;
pub mod multicart;
pub mod protocol;
pub mod romdb;
pub mod search;
pub mod transport;

pub use bstype::BankswitchType;
pub use cart::{CartConfig, Cartridge, Transfer, TransferState, MAX_CART_SIZE, MAX_SECTORS, SECTOR_SIZE};
pub use detector::{autodetect_file, autodetect_type, detect_from_image};
pub use error::{KrokError, Result};
pub use multicart::{encode_menu_name, roms_from_folder, MulticartInfo, MulticartLayout};
pub use protocol::{query_version, Progress};
pub use romdb::{RomDatabase, RomInfoStore};
pub use transport::{SerialTransport, SharedTransport};
