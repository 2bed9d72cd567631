//! Internet one's-complement checksum (RFC 1071) over PGM packet regions.
//!
//! The PGM checksum is computed over the entire PGM packet with the checksum
//! field zeroed. Partial sums allow chained regions (header then payload)
//! and `partial_copy` folds the copy into the summing pass for the send
//! path.

/// Accumulates `buf` into a 32-bit partial sum starting from `init`.
///
/// Bytes are summed as big-endian 16-bit words; a trailing odd byte counts
/// as the high octet of a final word. The result equals the naive 16-bit
/// one's-complement sum regardless of buffer alignment or length parity.
pub fn partial(buf: &[u8], init: u32) -> u32 {
    let mut sum = init;
    let mut chunks = buf.chunks_exact(2);
    for word in &mut chunks {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    sum
}

/// Copies `src` into `dst` while accumulating the checksum of the copied
/// bytes. `dst` must be at least as long as `src`.
pub fn partial_copy(src: &[u8], dst: &mut [u8], init: u32) -> u32 {
    dst[..src.len()].copy_from_slice(src);
    partial(src, init)
}

/// Combines two partial sums. `b` was computed over a region beginning at
/// byte `offset` of the final packet; an odd offset swaps its octets.
pub fn block_add(a: u32, b: u32, offset: usize) -> u32 {
    let b = if offset & 1 != 0 {
        let folded = fold_to_u16(b) as u32;
        ((folded & 0x00ff) << 8) | (folded >> 8)
    } else {
        b
    };
    a + b
}

fn fold_to_u16(mut sum: u32) -> u16 {
    sum = (sum >> 16) + (sum & 0xffff);
    sum += sum >> 16;
    sum as u16
}

/// Folds a partial sum and returns the one's complement, with a result of
/// zero transmitted as `0xffff` so that a checksum field of zero remains
/// reserved for "not provided".
pub fn fold(sum: u32) -> u16 {
    let folded = !fold_to_u16(sum);
    if folded == 0 {
        0xffff
    } else {
        folded
    }
}

/// Finished checksum over `buf` chained onto `init`.
pub fn inet(buf: &[u8], init: u32) -> u16 {
    fold(partial(buf, init))
}

/// Verifies a received packet: summing every byte including the transmitted
/// checksum field must fold to zero.
pub fn verify(buf: &[u8]) -> bool {
    fold_to_u16(partial(buf, 0)) == 0xffff
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naive(buf: &[u8]) -> u16 {
        let mut sum: u32 = 0;
        for (i, &b) in buf.iter().enumerate() {
            if i & 1 == 0 {
                sum += u32::from(b) << 8;
            } else {
                sum += u32::from(b);
            }
            while sum > 0xffff {
                sum = (sum >> 16) + (sum & 0xffff);
            }
        }
        !(sum as u16)
    }

    #[test]
    fn matches_naive_sum() {
        let buf: Vec<u8> = (0u16..313).map(|i| (i * 7) as u8).collect();
        assert_eq!(inet(&buf, 0), naive(&buf));
        assert_eq!(inet(&buf[..312], 0), naive(&buf[..312]));
    }

    #[test]
    fn chained_regions_equal_single_pass() {
        let buf: Vec<u8> = (0u8..=255).collect();
        let split = partial(&buf[128..], partial(&buf[..128], 0));
        assert_eq!(fold(split), inet(&buf, 0));
    }

    #[test]
    fn block_add_with_odd_offset() {
        let buf = [0x12u8, 0x34, 0x56, 0x78, 0x9a];
        let head = partial(&buf[..3], 0);
        let tail = partial(&buf[3..], 0);
        assert_eq!(fold(block_add(head, tail, 3)), inet(&buf, 0));
    }

    #[test]
    fn verify_round_trip() {
        let mut pkt: Vec<u8> = (0u8..64).collect();
        pkt[6] = 0;
        pkt[7] = 0;
        let sum = inet(&pkt, 0);
        pkt[6..8].copy_from_slice(&sum.to_be_bytes());
        assert!(verify(&pkt));
        pkt[20] ^= 0x40;
        assert!(!verify(&pkt));
    }

    #[test]
    fn zero_sum_transmitted_as_ffff() {
        assert_eq!(fold(0xffff), 0xffff);
    }

    #[test]
    fn partial_copy_copies_and_sums() {
        let src = [1u8, 2, 3, 4, 5];
        let mut dst = [0u8; 8];
        let sum = partial_copy(&src, &mut dst, 0);
        assert_eq!(&dst[..5], &src);
        assert_eq!(sum, partial(&src, 0));
    }
}
