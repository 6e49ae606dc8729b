//! Payload masking.
//!
//! Frames sent from a client to a server carry a 4-byte masking key, and every
//! payload byte is XOR'd against the key stream `k[0], k[1], k[2], k[3],
//! k[0], ...`. Unmasking is the same operation. A fragmented message keeps a
//! single key stream running across frames, and the reader hands payload bytes
//! to the caller in arbitrary chunks, so the kernel takes the current position
//! in the key stream and returns the advanced one.

/// XORs `buf` in place against the key stream starting at `pos`, returning the
/// position for the next consecutive slice.
///
/// Slices of at least 16 bytes are processed 8 bytes at a time with a widened
/// key. The scalar tail keeps the same stream, so splitting a buffer into any
/// consecutive slices produces identical output.
pub fn apply_mask(key: [u8; 4], buf: &mut [u8], pos: usize) -> usize {
    let next = (pos + buf.len()) % 4;

    if buf.len() >= 16 {
        let mut pattern = [0u8; 8];
        for (i, byte) in pattern.iter_mut().enumerate() {
            *byte = key[(pos + i) % 4];
        }
        let wide = u64::from_ne_bytes(pattern);

        let consumed = 8 * (buf.len() / 8);
        let mut chunks = buf.chunks_exact_mut(8);
        for chunk in &mut chunks {
            let word = u64::from_ne_bytes([
                chunk[0], chunk[1], chunk[2], chunk[3], chunk[4], chunk[5], chunk[6], chunk[7],
            ]);
            chunk.copy_from_slice(&(word ^ wide).to_ne_bytes());
        }

        let tail = chunks.into_remainder();
        for (i, byte) in tail.iter_mut().enumerate() {
            *byte ^= key[(pos + consumed + i) % 4];
        }
    } else {
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte ^= key[(pos + i) % 4];
        }
    }

    next
}

#[cfg(test)]
mod tests {
    use super::apply_mask;

    fn apply_mask_naive(key: [u8; 4], buf: &mut [u8], pos: usize) -> usize {
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte ^= key[(pos + i) % 4];
        }
        (pos + buf.len()) % 4
    }

    #[test]
    fn matches_naive_kernel() {
        let key = [0xa1, 0x07, 0x5e, 0xff];
        for len in [0, 1, 3, 4, 7, 8, 15, 16, 17, 31, 64, 257] {
            for pos in 0..4 {
                let mut fast: Vec<u8> = (0..len as u8).map(|b| b.wrapping_mul(31)).collect();
                let mut slow = fast.clone();
                let fast_pos = apply_mask(key, &mut fast, pos);
                let slow_pos = apply_mask_naive(key, &mut slow, pos);
                assert_eq!(fast, slow, "len={len} pos={pos}");
                assert_eq!(fast_pos, slow_pos);
            }
        }
    }

    #[test]
    fn masking_twice_restores_input() {
        let key = [0x13, 0x37, 0x00, 0x42];
        let original: Vec<u8> = (0..200u8).collect();
        let mut buf = original.clone();
        apply_mask(key, &mut buf, 0);
        assert_ne!(buf, original);
        apply_mask(key, &mut buf, 0);
        assert_eq!(buf, original);
    }

    #[test]
    fn split_slices_continue_the_stream() {
        let key = [9, 8, 7, 6];
        let original: Vec<u8> = (0..100u8).map(|b| b.wrapping_mul(7)).collect();

        let mut whole = original.clone();
        apply_mask(key, &mut whole, 0);

        // The same buffer masked in uneven pieces must agree with the
        // one-shot result.
        for splits in [[1usize, 2, 97], [33, 33, 34], [50, 25, 25], [99, 1, 0]] {
            let mut pieces = original.clone();
            let mut pos = 0;
            let mut offset = 0;
            for len in splits {
                pos = apply_mask(key, &mut pieces[offset..offset + len], pos);
                offset += len;
            }
            assert_eq!(pieces, whole, "splits={splits:?}");
        }
    }
}
