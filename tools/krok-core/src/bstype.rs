//! Bankswitching schemes known to the Krokodile Cartridge.
//!
//! The numeric values are the codes the cartridge firmware expects in the
//! bankswitch byte of a write-sector frame. Everything from [`BankswitchType::Dpc`]
//! upwards is detection-only and is never sent to the device.

use core::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum BankswitchType {
    Bs4K = 0,
    F8 = 1,
    F6 = 2,
    F4 = 3,
    McF6 = 4,
    Fa = 5,
    Bs3F = 6,
    McF8 = 7,
    F8Sc = 8,
    F6Sc = 9,
    F4Sc = 10,
    McF4 = 11,
    Mc4K = 12,
    Ef = 13,
    Cv = 14,
    Bs3E = 15,
    Ua = 16,
    F0 = 17,
    E0 = 18,
    E7 = 19,
    Fe = 20,
    Ar = 21,
    EfSc = 22,
    Bs0840 = 23,

    Dpc = 100,
    Bs4A50 = 101,
    X07 = 102,
    Sb = 103,
    Mc = 104,
    DpcPlus = 105,

    None = 1000,
    Auto = 1001,
}

use BankswitchType::*;

impl BankswitchType {
    /// Every scheme, in firmware code order.
    pub const ALL: [BankswitchType; 32] = [
        Bs4K, F8, F6, F4, McF6, Fa, Bs3F, McF8, F8Sc, F6Sc, F4Sc, McF4, Mc4K, Ef, Cv, Bs3E,
        Ua, F0, E0, E7, Fe, Ar, EfSc, Bs0840, Dpc, Bs4A50, X07, Sb, Mc, DpcPlus, None, Auto,
    ];

    pub const fn code(self) -> u16 {
        self as u16
    }

    /// The byte placed in a write-sector frame.
    pub const fn wire_code(self) -> u8 {
        (self as u16 & 0xFF) as u8
    }

    pub const fn name(self) -> &'static str {
        match self {
            Bs4K => "4K",
            F8 => "F8",
            F6 => "F6",
            F4 => "F4",
            McF6 => "MCF6",
            Fa => "FA",
            Bs3F => "3F",
            McF8 => "MCF8",
            F8Sc => "F8SC",
            F6Sc => "F6SC",
            F4Sc => "F4SC",
            McF4 => "MCF4",
            Mc4K => "MC4K",
            Ef => "EF",
            Cv => "CV",
            Bs3E => "3E",
            Ua => "UA",
            F0 => "F0",
            E0 => "E0",
            E7 => "E7",
            Fe => "FE",
            Ar => "AR",
            EfSc => "EFSC",
            Bs0840 => "0840",
            Dpc => "DPC",
            Bs4A50 => "4A50",
            X07 => "X07",
            Sb => "SB",
            Mc => "MC",
            DpcPlus => "DPC+",
            None => "NONE/UNKNOWN",
            Auto => "AUTO",
        }
    }

    /// Case-insensitive reverse of [`name`](Self::name). Unknown names are `None`.
    pub fn from_name(name: &str) -> BankswitchType {
        let name = name.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.name().eq_ignore_ascii_case(name))
            .unwrap_or(None)
    }

    /// Can the cartridge be programmed with an image of this type?
    pub const fn is_supported(self) -> bool {
        !matches!(
            self,
            F0 | E0 | Fe | Ar | None | Auto | Dpc | DpcPlus | Bs4A50 | X07 | Sb | Mc
        )
    }

    pub const fn is_multicart(self) -> bool {
        matches!(self, Mc4K | McF8 | McF6 | McF4)
    }

    /// 3E and 3F keep their last bank fixed at the top of the address space.
    pub const fn has_fixed_high_bank(self) -> bool {
        matches!(self, Bs3E | Bs3F)
    }

    /// Smallest image the scheme can address. Shorter images are tiled up
    /// to this size so mirrored reads see real data.
    pub const fn native_size(self) -> usize {
        match self {
            F8 | F8Sc | E0 | Fe | Ua | Bs0840 => 8 * 1024,
            Fa => 12 * 1024,
            F6 | F6Sc | E7 => 16 * 1024,
            F4 | F4Sc => 32 * 1024,
            Ef | EfSc | F0 => 64 * 1024,
            _ => 4 * 1024,
        }
    }
}

impl fmt::Display for BankswitchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for BankswitchType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for BankswitchType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(BankswitchType::from_name(&name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for t in BankswitchType::ALL {
            assert_eq!(BankswitchType::from_name(t.name()), t, "{}", t.name());
        }
    }

    #[test]
    fn names_are_case_insensitive() {
        assert_eq!(BankswitchType::from_name("f8sc"), F8Sc);
        assert_eq!(BankswitchType::from_name("dPc+"), DpcPlus);
        assert_eq!(BankswitchType::from_name("3e"), Bs3E);
        assert_eq!(BankswitchType::from_name("auto"), Auto);
    }

    #[test]
    fn unknown_names_are_none() {
        assert_eq!(BankswitchType::from_name(""), None);
        assert_eq!(BankswitchType::from_name("F9"), None);
        assert_eq!(BankswitchType::from_name("4KB"), None);
    }

    #[test]
    fn detection_only_types_are_unsupported() {
        for t in [F0, E0, Fe, Ar, None, Dpc, DpcPlus, Bs4A50, X07, Sb, Mc] {
            assert!(!t.is_supported(), "{t}");
        }
        for t in [Bs4K, F8, F6, F4, Fa, Bs3E, Bs3F, F8Sc, Ef, EfSc, Cv, Ua, E7, Bs0840, Mc4K] {
            assert!(t.is_supported(), "{t}");
        }
    }

    #[test]
    fn wire_codes_match_firmware_table() {
        assert_eq!(Bs4K.wire_code(), 0);
        assert_eq!(Bs3E.wire_code(), 15);
        assert_eq!(Bs0840.wire_code(), 23);
        assert_eq!(Mc4K.wire_code(), 12);
    }

    #[test]
    fn serializes_by_name() {
        let json = serde_json::to_string(&EfSc).unwrap();
        assert_eq!(json, "\"EFSC\"");
        let back: BankswitchType = serde_json::from_str("\"efsc\"").unwrap();
        assert_eq!(back, EfSc);
    }
}
