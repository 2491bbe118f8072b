/// Mask/unmask a payload in place with a 4-byte key.
///
/// Masking is an involution: applying the same key twice restores the input.
#[inline]
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    let key = u32::from_ne_bytes(mask);

    let mut words = buf.chunks_exact_mut(4);
    for word in &mut words {
        let masked = u32::from_ne_bytes([word[0], word[1], word[2], word[3]]) ^ key;
        word.copy_from_slice(&masked.to_ne_bytes());
    }

    // every full word consumed a multiple of 4 bytes, so the tail starts at mask[0]
    apply_mask_bytewise(words.into_remainder(), mask);
}

/// Byte-at-a-time masking, `buf[i] ^= mask[i % 4]`.
#[inline]
fn apply_mask_bytewise(buf: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_path_matches_bytewise() {
        let masks = [
            [0x00, 0x00, 0x00, 0x00],
            [0xFF, 0xFF, 0xFF, 0xFF],
            [0x37, 0xFA, 0x21, 0x3D],
            [0x6d, 0xb6, 0xb2, 0x80],
        ];

        for mask in masks {
            for size in 0..=67 {
                let data: Vec<u8> = (0..size).map(|i| (i * 13 + 5) as u8).collect();

                let mut expected = data.clone();
                apply_mask_bytewise(&mut expected, mask);

                let mut actual = data.clone();
                apply_mask(&mut actual, mask);

                assert_eq!(expected, actual, "mask {:?} size {}", mask, size);
            }
        }
    }

    #[test]
    fn test_mask_is_involution() {
        let mask = [0x37, 0xFA, 0x21, 0x3D];
        let original = b"Hello";

        let mut data = original.to_vec();
        apply_mask(&mut data, mask);
        // RFC 6455 section 5.7, single-frame masked text message
        assert_eq!(data, vec![0x7f, 0x9f, 0x4d, 0x51, 0x58]);

        apply_mask(&mut data, mask);
        assert_eq!(&data[..], &original[..]);
    }

    #[test]
    fn test_mask_short_buffers() {
        let mask = [0x12, 0x34, 0x56, 0x78];

        let mut empty: Vec<u8> = vec![];
        apply_mask(&mut empty, mask);
        assert!(empty.is_empty());

        let mut three = vec![0xAB, 0xCD, 0xEF];
        apply_mask(&mut three, mask);
        assert_eq!(three, vec![0xAB ^ 0x12, 0xCD ^ 0x34, 0xEF ^ 0x56]);
    }
}
