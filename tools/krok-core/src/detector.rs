//! Bankswitch autodetection.
//!
//! The image size picks a family of candidates, then 6502 code signatures
//! aimed at each scheme's hotspots decide between them. The order of the
//! checks within a size matters: ambiguous images resolve to whichever
//! candidate is tested first.

use std::path::Path;

use log::debug;

use crate::bstype::BankswitchType;
use crate::romdb::{get_rom_info, RomInfoStore};
use crate::search::{search_for_any, search_for_bytes};

/// Detects the type of `image`, consulting `store` first when given.
pub fn autodetect_type(
    path: &Path,
    image: &[u8],
    store: Option<&mut dyn RomInfoStore>,
) -> BankswitchType {
    if let Some(store) = store {
        let known = get_rom_info(store, path, image);
        if known != BankswitchType::None {
            return known;
        }
    }

    let detected = detect_from_image(image);
    debug!("{} ({} bytes) looks like {}", path.display(), image.len(), detected);
    detected
}

/// Reads the file at `path` and detects its type. Unreadable or empty
/// files are `None`.
pub fn autodetect_file(path: &Path, store: Option<&mut dyn RomInfoStore>) -> BankswitchType {
    match std::fs::read(path) {
        Ok(image) if !image.is_empty() => autodetect_type(path, &image, store),
        _ => BankswitchType::None,
    }
}

/// Size dispatch and signature heuristics, without any database lookup.
pub fn detect_from_image(image: &[u8]) -> BankswitchType {
    use BankswitchType::*;

    let size = image.len();
    if size == 0 {
        return None;
    }

    if size % 8448 == 0 || size == 6144 {
        Ar
    } else if size < 2048 {
        // sub-2K images are converted to 4K
        Bs4K
    } else if size == 2048 || (size == 4096 && image[..2048] == image[2048..]) {
        if is_probably_cv(image) { Cv } else { Bs4K }
    } else if size == 4096 {
        if is_probably_cv(image) { Cv } else { Bs4K }
    } else if size == 8 * 1024 {
        if is_probably_sc(image) {
            F8Sc
        } else if image[..4096] == image[4096..] {
            Bs4K
        } else if is_probably_e0(image) {
            E0
        } else if is_probably_3e(image) {
            Bs3E
        } else if is_probably_3f(image) {
            Bs3F
        } else if is_probably_ua(image) {
            Ua
        } else if is_probably_fe(image) {
            Fe
        } else if is_probably_0840(image) {
            Bs0840
        } else {
            F8
        }
    } else if (10240..=10496).contains(&size) {
        // ~10K, Pitfall II
        Dpc
    } else if size == 12 * 1024 {
        Fa
    } else if size == 16 * 1024 {
        if is_probably_sc(image) {
            F6Sc
        } else if is_probably_e7(image) {
            E7
        } else if is_probably_3e(image) {
            Bs3E
        } else if is_probably_3f(image) {
            Bs3F
        } else {
            F6
        }
    } else if size == 29 * 1024 {
        DpcPlus
    } else if size == 32 * 1024 {
        if is_probably_sc(image) {
            F4Sc
        } else if is_probably_3e(image) {
            Bs3E
        } else if is_probably_3f(image) {
            Bs3F
        } else if is_probably_dpc_plus(image) {
            DpcPlus
        } else {
            F4
        }
    } else if size == 64 * 1024 {
        if is_probably_3e(image) {
            Bs3E
        } else if is_probably_3f(image) {
            Bs3F
        } else if is_probably_4a50(image) {
            Bs4A50
        } else if is_probably_ef(image) {
            if is_probably_sc(image) { EfSc } else { Ef }
        } else if is_probably_x07(image) {
            X07
        } else {
            F0
        }
    } else if size == 128 * 1024 {
        if is_probably_3e(image) {
            Bs3E
        } else if is_probably_3f(image) {
            Bs3F
        } else if is_probably_4a50(image) {
            Bs4A50
        } else if is_probably_sb(image) {
            Sb
        } else {
            Mc
        }
    } else if size == 256 * 1024 {
        if is_probably_3e(image) {
            Bs3E
        } else if is_probably_3f(image) {
            Bs3F
        } else {
            Sb
        }
    } else if is_probably_3e(image) {
        Bs3E
    } else if is_probably_3f(image) {
        Bs3F
    } else {
        None
    }
}

/// Superchip carts mirror their RAM into the first 256 bytes of every 4K
/// bank, so in the image those bytes are all the same.
pub fn is_probably_sc(image: &[u8]) -> bool {
    image
        .chunks_exact(4096)
        .all(|bank| bank[..256].iter().all(|&b| b == bank[0]))
}

pub fn is_probably_0840(image: &[u8]) -> bool {
    const LOADS: [&[u8]; 2] = [
        &[0xAD, 0x00, 0x08], // LDA $0800
        &[0xAD, 0x40, 0x08], // LDA $0840
    ];
    const JUMPS: [&[u8]; 2] = [
        &[0x0C, 0x00, 0x08, 0x4C], // NOP $0800; JMP ...
        &[0x0C, 0xFF, 0x0F, 0x4C], // NOP $0FFF; JMP ...
    ];
    search_for_any(image, &LOADS, 1) || search_for_any(image, &JUMPS, 1)
}

pub fn is_probably_3e(image: &[u8]) -> bool {
    // STA $3E; LDA #$00
    search_for_bytes(image, &[0x85, 0x3E, 0xA9, 0x00], 1)
}

pub fn is_probably_3f(image: &[u8]) -> bool {
    // STA $3F, at least once per bank
    search_for_bytes(image, &[0x85, 0x3F], 2)
}

/// 4A50 keeps $4A50 in the NMI vector, or starts with `NOP $6Exx`/`NOP $6Fxx`
/// somewhere in $1Fxx.
pub fn is_probably_4a50(image: &[u8]) -> bool {
    let size = image.len();
    if size >= 6 && image[size - 6] == 0x50 && image[size - 5] == 0x4A {
        return true;
    }

    let (Some(&lo), Some(&hi)) = (image.get(0xFFFC), image.get(0xFFFD)) else {
        return false;
    };
    let start = hi as usize * 256 + lo as usize;
    (hi & 0x1F) == 0x1F
        && image.get(start) == Some(&0x0C)
        && image.get(start + 2).is_some_and(|&b| (b & 0xFE) == 0x6E)
}

pub fn is_probably_cv(image: &[u8]) -> bool {
    const SIGS: [&[u8]; 2] = [
        &[0x9D, 0xFF, 0xF3], // STA $F3FF,X
        &[0x99, 0x00, 0xF4], // STA $F400,Y
    ];
    search_for_any(image, &SIGS, 1)
}

pub fn is_probably_dpc_plus(image: &[u8]) -> bool {
    // the ARM driver names itself twice
    search_for_bytes(image, b"DPC+", 2)
}

pub fn is_probably_e0(image: &[u8]) -> bool {
    const SIGS: [&[u8]; 8] = [
        &[0x8D, 0xE0, 0x1F], // STA $1FE0
        &[0x8D, 0xE0, 0x5F], // STA $5FE0
        &[0x8D, 0xE9, 0xFF], // STA $FFE9
        &[0x0C, 0xE0, 0x1F], // NOP $1FE0
        &[0xAD, 0xE0, 0x1F], // LDA $1FE0
        &[0xAD, 0xE9, 0xFF], // LDA $FFE9
        &[0xAD, 0xED, 0xFF], // LDA $FFED
        &[0xAD, 0xF3, 0xBF], // LDA $BFF3
    ];
    search_for_any(image, &SIGS, 1)
}

pub fn is_probably_e7(image: &[u8]) -> bool {
    const SIGS: [&[u8]; 7] = [
        &[0xAD, 0xE2, 0xFF], // LDA $FFE2
        &[0xAD, 0xE5, 0xFF], // LDA $FFE5
        &[0xAD, 0xE5, 0x1F], // LDA $1FE5
        &[0xAD, 0xE7, 0x1F], // LDA $1FE7
        &[0x0C, 0xE7, 0x1F], // NOP $1FE7
        &[0x8D, 0xE7, 0xFF], // STA $FFE7
        &[0x8D, 0xE7, 0x1F], // STA $1FE7
    ];
    search_for_any(image, &SIGS, 1)
}

pub fn is_probably_ef(image: &[u8]) -> bool {
    // most code switches to bank 0 at some point
    const SIGS: [&[u8]; 4] = [
        &[0x0C, 0xE0, 0xFF], // NOP $FFE0
        &[0xAD, 0xE0, 0xFF], // LDA $FFE0
        &[0x0C, 0xE0, 0x1F], // NOP $1FE0
        &[0xAD, 0xE0, 0x1F], // LDA $1FE0
    ];
    search_for_any(image, &SIGS, 1)
}

pub fn is_probably_fe(image: &[u8]) -> bool {
    const SIGS: [&[u8]; 4] = [
        &[0x20, 0x00, 0xD0, 0xC6, 0xC5], // JSR $D000; DEC $C5
        &[0x20, 0xC3, 0xF8, 0xA5, 0x82], // JSR $F8C3; LDA $82
        &[0xD0, 0xFB, 0x20, 0x73, 0xFE], // BNE $FB; JSR $FE73
        &[0x20, 0x00, 0xF0, 0x84, 0xD6], // JSR $F000; STY $D6
    ];
    search_for_any(image, &SIGS, 1)
}

pub fn is_probably_sb(image: &[u8]) -> bool {
    const SIGS: [&[u8]; 2] = [
        &[0xBD, 0x00, 0x08], // LDA $0800,X
        &[0xAD, 0x00, 0x08], // LDA $0800
    ];
    search_for_any(image, &SIGS, 1)
}

pub fn is_probably_ua(image: &[u8]) -> bool {
    const SIGS: [&[u8]; 3] = [
        &[0x8D, 0x40, 0x02], // STA $240
        &[0xAD, 0x40, 0x02], // LDA $240
        &[0xBD, 0x1F, 0x02], // LDA $21F,X
    ];
    search_for_any(image, &SIGS, 1)
}

pub fn is_probably_x07(image: &[u8]) -> bool {
    const SIGS: [&[u8]; 3] = [
        &[0xAD, 0x0D, 0x08], // LDA $080D
        &[0xAD, 0x1D, 0x08], // LDA $081D
        &[0xAD, 0x2D, 0x08], // LDA $082D
    ];
    search_for_any(image, &SIGS, 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::romdb::{add_rom_info, RomDatabase};
    use BankswitchType::*;

    /// Bytes 1..=7 only: no signature starts with any of them, no Superchip
    /// pattern, and no two 4K banks are alike.
    fn plain(size: usize) -> Vec<u8> {
        (0..size).map(|i| ((i % 251 + i / 4096) % 7 + 1) as u8).collect()
    }

    fn with_sig(size: usize, offset: usize, sig: &[u8]) -> Vec<u8> {
        let mut image = plain(size);
        image[offset..offset + sig.len()].copy_from_slice(sig);
        image
    }

    #[test]
    fn defaults_without_signatures() {
        assert_eq!(detect_from_image(&plain(1000)), Bs4K);
        assert_eq!(detect_from_image(&plain(2048)), Bs4K);
        assert_eq!(detect_from_image(&plain(4096)), Bs4K);
        assert_eq!(detect_from_image(&plain(8192)), F8);
        assert_eq!(detect_from_image(&plain(12288)), Fa);
        assert_eq!(detect_from_image(&plain(16384)), F6);
        assert_eq!(detect_from_image(&plain(32768)), F4);
        assert_eq!(detect_from_image(&plain(65536)), F0);
        assert_eq!(detect_from_image(&plain(131072)), Mc);
        assert_eq!(detect_from_image(&plain(262144)), Sb);
        assert_eq!(detect_from_image(&plain(20000)), None);
    }

    #[test]
    fn size_only_types() {
        assert_eq!(detect_from_image(&plain(6144)), Ar);
        assert_eq!(detect_from_image(&plain(8448 * 3)), Ar);
        assert_eq!(detect_from_image(&plain(10240)), Dpc);
        assert_eq!(detect_from_image(&plain(10496)), Dpc);
        assert_eq!(detect_from_image(&plain(29 * 1024)), DpcPlus);
        assert_eq!(detect_from_image(&[]), None);
    }

    #[test]
    fn mirrored_8k_is_4k() {
        let half = plain(4096);
        let mut image = half.clone();
        image.extend_from_slice(&half);
        assert_eq!(detect_from_image(&image), Bs4K);
    }

    #[test]
    fn superchip_ram_area() {
        let mut image = plain(16384);
        for bank in 0..4 {
            image[bank * 4096..bank * 4096 + 256].fill(0xFF);
        }
        assert_eq!(detect_from_image(&image), F6Sc);
        image[4096 + 17] = 0;
        assert_eq!(detect_from_image(&image), F6);
    }

    #[test]
    fn cv_signature_at_any_offset() {
        for offset in [0, 700, 2045] {
            assert_eq!(detect_from_image(&with_sig(2048, offset, &[0x99, 0x00, 0xF4])), Cv);
        }
        assert_eq!(detect_from_image(&with_sig(4096, 4093, &[0x9D, 0xFF, 0xF3])), Cv);
    }

    #[test]
    fn eight_k_heuristics() {
        assert_eq!(detect_from_image(&with_sig(8192, 100, &[0x8D, 0xE0, 0x1F])), E0);
        assert_eq!(detect_from_image(&with_sig(8192, 5000, &[0x85, 0x3E, 0xA9, 0x00])), Bs3E);
        assert_eq!(detect_from_image(&with_sig(8192, 8189, &[0x8D, 0x40, 0x02])), Ua);
        assert_eq!(
            detect_from_image(&with_sig(8192, 3, &[0x20, 0xC3, 0xF8, 0xA5, 0x82])),
            Fe
        );
        assert_eq!(detect_from_image(&with_sig(8192, 40, &[0x0C, 0xFF, 0x0F, 0x4C])), Bs0840);

        let mut image = with_sig(8192, 10, &[0x85, 0x3F]);
        assert_eq!(detect_from_image(&image), F8, "a single STA $3F is not enough");
        image[6000..6002].copy_from_slice(&[0x85, 0x3F]);
        assert_eq!(detect_from_image(&image), Bs3F);
    }

    #[test]
    fn earlier_heuristics_win() {
        // E0 is checked before 3E
        let mut image = with_sig(8192, 10, &[0x85, 0x3E, 0xA9, 0x00]);
        image[4000..4003].copy_from_slice(&[0xAD, 0xE0, 0x1F]);
        assert_eq!(detect_from_image(&image), E0);
    }

    #[test]
    fn sixteen_and_thirty_two_k() {
        assert_eq!(detect_from_image(&with_sig(16384, 9000, &[0xAD, 0xE5, 0x1F])), E7);
        assert_eq!(detect_from_image(&with_sig(16384, 1, &[0x85, 0x3E, 0xA9, 0x00])), Bs3E);

        let mut image = with_sig(32768, 100, b"DPC+");
        assert_eq!(detect_from_image(&image), F4);
        image[20000..20004].copy_from_slice(b"DPC+");
        assert_eq!(detect_from_image(&image), DpcPlus);
    }

    #[test]
    fn sixty_four_k() {
        assert_eq!(detect_from_image(&with_sig(65536, 65530, &[0x50, 0x4A])), Bs4A50);
        assert_eq!(detect_from_image(&with_sig(65536, 300, &[0x0C, 0xE0, 0xFF])), Ef);
        assert_eq!(detect_from_image(&with_sig(65536, 300, &[0xAD, 0x2D, 0x08])), X07);

        let mut image = with_sig(65536, 300, &[0xAD, 0xE0, 0x1F]);
        for bank in 0..16 {
            image[bank * 4096..bank * 4096 + 256].fill(0);
        }
        assert_eq!(detect_from_image(&image), EfSc);
    }

    #[test]
    fn four_a_fifty_from_the_reset_vector() {
        for size in [65536, 131072] {
            let mut image = plain(size);
            image[0xFFFC] = 0x00;
            image[0xFFFD] = 0x1F;
            image[0x1F00] = 0x0C;
            image[0x1F02] = 0x6F;
            assert_eq!(detect_from_image(&image), Bs4A50, "{} bytes", size);

            image[0x1F02] = 0x70;
            assert_ne!(detect_from_image(&image), Bs4A50);
            image[0x1F02] = 0x6E;
            image[0xFFFD] = 0x0F;
            assert_ne!(detect_from_image(&image), Bs4A50, "reset vector outside $1Fxx");
        }
    }

    #[test]
    fn three_f_in_every_size() {
        for (size, fallback) in [(16384, F6), (32768, F4), (65536, F0), (131072, Mc)] {
            let mut image = with_sig(size, 100, &[0x85, 0x3F]);
            assert_eq!(detect_from_image(&image), fallback, "one STA $3F in {} bytes", size);
            image[size / 2..size / 2 + 2].copy_from_slice(&[0x85, 0x3F]);
            assert_eq!(detect_from_image(&image), Bs3F, "{} bytes", size);
        }
    }

    #[test]
    fn large_images() {
        assert_eq!(detect_from_image(&with_sig(131072, 70000, &[0xBD, 0x00, 0x08])), Sb);
        assert_eq!(detect_from_image(&with_sig(262144, 7, &[0x85, 0x3E, 0xA9, 0x00])), Bs3E);
        assert_eq!(detect_from_image(&with_sig(40000, 7, &[0x85, 0x3E, 0xA9, 0x00])), Bs3E);
    }

    #[test]
    fn database_overrides_heuristics() {
        let mut db = RomDatabase::in_memory();
        let path = Path::new("/roms/ambiguous.bin");
        let image = plain(8192);

        assert_eq!(autodetect_type(path, &image, Some(&mut db)), F8);
        add_rom_info(&mut db, path, Bs3F, &image);
        assert_eq!(autodetect_type(path, &image, Some(&mut db)), Bs3F);
        assert_eq!(autodetect_type(path, &image, Option::None), F8);
    }
}
