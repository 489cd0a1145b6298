/// Answers whether `signature` occurs at least `min_hits` times in `image`.
///
/// Matches never overlap: after a hit the scan resumes right after it.
pub fn search_for_bytes(image: &[u8], signature: &[u8], min_hits: usize) -> bool {
    if signature.is_empty() || image.len() < signature.len() {
        return min_hits == 0;
    }

    let mut hits = 0;
    let mut i = 0;
    while hits < min_hits && i + signature.len() <= image.len() {
        if &image[i..i + signature.len()] == signature {
            hits += 1;
            i += signature.len();
        } else {
            i += 1;
        }
    }

    hits >= min_hits
}

/// True if any of `signatures` occurs at least `min_hits` times.
pub fn search_for_any(image: &[u8], signatures: &[&[u8]], min_hits: usize) -> bool {
    signatures
        .iter()
        .any(|sig| search_for_bytes(image, sig, min_hits))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIG: [u8; 3] = [0xAD, 0xE0, 0x1F];

    fn with_copies(n: usize) -> Vec<u8> {
        let mut image = vec![0u8; 16];
        for _ in 0..n {
            image.extend_from_slice(&SIG);
            image.extend_from_slice(&[0u8; 3]);
        }
        image
    }

    #[test]
    fn empty_haystack_never_matches() {
        assert!(!search_for_bytes(&[], &SIG, 1));
    }

    #[test]
    fn counts_exactly_min_hits() {
        let image = with_copies(3);
        assert!(search_for_bytes(&image, &SIG, 1));
        assert!(search_for_bytes(&image, &SIG, 3));
        assert!(!search_for_bytes(&image, &SIG, 4));
    }

    #[test]
    fn overlapping_matches_count_once() {
        // "AAAA" holds three overlapping "AA" but only two disjoint ones
        let image = [0x41u8; 4];
        assert!(search_for_bytes(&image, &[0x41, 0x41], 2));
        assert!(!search_for_bytes(&image, &[0x41, 0x41], 3));
    }

    #[test]
    fn match_at_the_very_end() {
        let mut image = vec![0u8; 32];
        image.extend_from_slice(&SIG);
        assert!(search_for_bytes(&image, &SIG, 1));
    }

    #[test]
    fn signature_longer_than_image() {
        assert!(!search_for_bytes(&[0xAD, 0xE0], &SIG, 1));
    }

    #[test]
    fn any_of_several() {
        let image = with_copies(1);
        assert!(search_for_any(&image, &[&[0x01, 0x02], &SIG], 1));
        assert!(!search_for_any(&image, &[&[0x01, 0x02], &[0x03]], 1));
    }
}
