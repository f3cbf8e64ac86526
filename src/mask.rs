//! Payload masking per RFC 6455 Section 5.3: the 4-byte key is XORed
//! cyclically over the payload. Applying the same key twice restores the
//! original bytes, so one routine serves both masking and unmasking.

/// Mask/unmask a payload in place.
#[inline]
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    // Word-at-a-time over the aligned body, byte-at-a-time over the tail.
    // The body always starts at offset 0, so the tail offset is a multiple
    // of 4 and the key phase stays `i & 3`.
    let key = u32::from_ne_bytes(mask);
    let mut chunks = buf.chunks_exact_mut(4);
    for chunk in chunks.by_ref() {
        let mut word = [0u8; 4];
        word.copy_from_slice(chunk);
        chunk.copy_from_slice(&(u32::from_ne_bytes(word) ^ key).to_ne_bytes());
    }
    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply_mask_naive(buf: &mut [u8], mask: [u8; 4]) {
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte ^= mask[i & 3];
        }
    }

    #[test]
    fn test_matches_naive_for_all_lengths() {
        let mask = [0x6d, 0xb6, 0xb2, 0x80];
        let data: Vec<u8> = (0..64).map(|i| (i * 7) as u8).collect();

        for len in 0..=data.len() {
            let mut expected = data[..len].to_vec();
            apply_mask_naive(&mut expected, mask);

            let mut actual = data[..len].to_vec();
            apply_mask(&mut actual, mask);

            assert_eq!(actual, expected, "length {len}");
        }
    }

    #[test]
    fn test_mask_unmask_identity() {
        let mask = [0xAA, 0xBB, 0xCC, 0xDD];
        let original = b"round trips through the mask unchanged".to_vec();

        let mut data = original.clone();
        apply_mask(&mut data, mask);
        assert_ne!(data, original);

        apply_mask(&mut data, mask);
        assert_eq!(data, original);
    }

    #[test]
    fn test_zero_mask_is_noop() {
        let original = b"untouched".to_vec();
        let mut data = original.clone();
        apply_mask(&mut data, [0; 4]);
        assert_eq!(data, original);
    }

    #[test]
    fn test_empty_and_tiny_buffers() {
        let mask = [0x12, 0x34, 0x56, 0x78];

        let mut empty: Vec<u8> = vec![];
        apply_mask(&mut empty, mask);
        assert!(empty.is_empty());

        let mut three = vec![0xAB, 0xCD, 0xEF];
        apply_mask(&mut three, mask);
        assert_eq!(three, vec![0xAB ^ 0x12, 0xCD ^ 0x34, 0xEF ^ 0x56]);
    }

    #[test]
    fn test_large_buffer_key_phase() {
        let mask = [0x01, 0x02, 0x03, 0x04];
        let original: Vec<u8> = (0..10_000).map(|i| (i % 256) as u8).collect();
        let mut data = original.clone();

        apply_mask(&mut data, mask);

        for (i, &byte) in data.iter().enumerate() {
            assert_eq!(byte, original[i] ^ mask[i & 3], "mismatch at index {i}");
        }
    }
}
