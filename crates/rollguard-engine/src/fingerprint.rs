//! Block layout, guard patterns and metadata checksums.
//!
//! Every heap block is laid out as
//!
//! ```text
//! block_base                 user_base              user_base+size     block end
//! | header 16 | pre-guard 16 | payload (size bytes) | post-guard (>= 8) |
//! ```
//!
//! The header is `[u64 alloc id | u32 size | u32 check]`; `check` is a
//! truncated BLAKE3 digest of (block base, id, size). Guard bytes come from a
//! SipHash-2-4 fingerprint of (user base, size, serial) and depend on their
//! address, so a partial trailing word is checked byte-exactly.

/// In-heap object header size.
pub const HEADER_SIZE: usize = 16;

/// Pre-guard size (between header and payload).
pub const PRE_GUARD_SIZE: usize = 16;

/// Minimum post-guard size.
pub const MIN_POST_GUARD: usize = 8;

/// Smallest block class.
pub const MIN_BLOCK_SIZE: usize = 64;

/// Offset of the payload within a block.
pub const USER_OFFSET: usize = HEADER_SIZE + PRE_GUARD_SIZE;

const FOLD: u64 = 0xDEAD_BEEF_CAFE_BABE;
const FREE_SALT: u64 = 0xF4EE_D0D0_5EED_0001;
const WORD_MIX: u64 = 0x9E37_79B9_7F4A_7C15;

/// Power-of-two block class holding a `size`-byte payload plus overhead.
#[must_use]
pub fn block_size_for(size: usize) -> Option<usize> {
    let needed = size.checked_add(USER_OFFSET + MIN_POST_GUARD)?;
    Some(needed.checked_next_power_of_two()?.max(MIN_BLOCK_SIZE))
}

/// Header written at the start of every block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHeader {
    pub id: u64,
    pub size: u32,
    pub check: u32,
}

impl ObjectHeader {
    #[must_use]
    pub fn compute(block_base: usize, id: u64, size: u32) -> Self {
        Self {
            id,
            size,
            check: header_check(block_base, id, size),
        }
    }

    /// Whether the stored check matches the stored fields at `block_base`.
    #[must_use]
    pub fn verify(&self, block_base: usize) -> bool {
        self.check == header_check(block_base, self.id, self.size)
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.check.to_le_bytes());
        buf
    }

    #[must_use]
    pub fn from_bytes(buf: &[u8; HEADER_SIZE]) -> Self {
        let mut id = [0u8; 8];
        id.copy_from_slice(&buf[0..8]);
        let mut size = [0u8; 4];
        size.copy_from_slice(&buf[8..12]);
        let mut check = [0u8; 4];
        check.copy_from_slice(&buf[12..16]);
        Self {
            id: u64::from_le_bytes(id),
            size: u32::from_le_bytes(size),
            check: u32::from_le_bytes(check),
        }
    }
}

fn header_check(block_base: usize, id: u64, size: u32) -> u32 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(block_base as u64).to_le_bytes());
    hasher.update(&id.to_le_bytes());
    hasher.update(&size.to_le_bytes());
    let digest = hasher.finalize();
    let mut out = [0u8; 4];
    out.copy_from_slice(&digest.as_bytes()[..4]);
    u32::from_le_bytes(out)
}

/// Truncated BLAKE3 digest over a sequence of byte slices.
#[must_use]
pub fn record_checksum(parts: &[&[u8]]) -> u64 {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    let mut out = [0u8; 8];
    out.copy_from_slice(&hasher.finalize().as_bytes()[..8]);
    u64::from_le_bytes(out)
}

/// Allocation-specific, position-dependent byte pattern.
///
/// Pattern bytes always have the high bit set and are never `0xFF`, so zero
/// fills, ASCII data and all-ones stores never coincide with a guard byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardPattern {
    seed: u64,
}

impl GuardPattern {
    /// Guard pattern for an allocation.
    #[must_use]
    pub fn for_allocation(user_base: usize, size: usize, serial: u64) -> Self {
        Self {
            seed: sip_hash_2_4(user_base as u64, (size as u64) ^ serial.rotate_left(32)),
        }
    }

    /// Pattern written over the payload when the allocation is freed.
    #[must_use]
    pub fn free_pattern(&self) -> Self {
        Self {
            seed: (self.seed ^ FREE_SALT).rotate_left(29),
        }
    }

    #[must_use]
    pub const fn seed(&self) -> u64 {
        self.seed
    }

    /// Expected byte at absolute address `addr`.
    #[must_use]
    pub fn byte_at(&self, addr: usize) -> u8 {
        let word = (addr / 8) as u64;
        let mixed = self.seed ^ word.wrapping_mul(WORD_MIX);
        let folded = mixed ^ mixed.rotate_left(32) ^ FOLD;
        let raw = folded.to_le_bytes()[addr % 8] | 0x80;
        if raw == 0xFF { 0xFE } else { raw }
    }

    /// Pattern bytes for `[addr, addr + len)`.
    #[must_use]
    pub fn bytes(&self, addr: usize, len: usize) -> Vec<u8> {
        (addr..addr + len).map(|a| self.byte_at(a)).collect()
    }

    /// Offset of the first byte in `observed` (read from `addr`) that does not
    /// match the pattern.
    #[must_use]
    pub fn first_mismatch(&self, addr: usize, observed: &[u8]) -> Option<usize> {
        observed
            .iter()
            .enumerate()
            .find(|&(i, &b)| b != self.byte_at(addr + i))
            .map(|(i, _)| i)
    }
}

/// SipHash-2-4 over two words with a fixed key.
///
/// Collision resistance is what matters here; the key is not secret.
fn sip_hash_2_4(m0: u64, m1: u64) -> u64 {
    const K0: u64 = 0x0706_0504_0302_0100;
    const K1: u64 = 0x0F0E_0D0C_0B0A_0908;

    let mut v = [
        K0 ^ 0x736f_6d65_7073_6575,
        K1 ^ 0x646f_7261_6e64_6f6d,
        K0 ^ 0x6c79_6765_6e65_7261,
        K1 ^ 0x7465_6462_7974_6573,
    ];

    for m in [m0, m1] {
        v[3] ^= m;
        sip_round(&mut v);
        sip_round(&mut v);
        v[0] ^= m;
    }

    v[2] ^= 0xFF;
    for _ in 0..4 {
        sip_round(&mut v);
    }
    v[0] ^ v[1] ^ v[2] ^ v[3]
}

#[inline(always)]
fn sip_round(v: &mut [u64; 4]) {
    v[0] = v[0].wrapping_add(v[1]);
    v[1] = v[1].rotate_left(13) ^ v[0];
    v[0] = v[0].rotate_left(32);
    v[2] = v[2].wrapping_add(v[3]);
    v[3] = v[3].rotate_left(16) ^ v[2];
    v[0] = v[0].wrapping_add(v[3]);
    v[3] = v[3].rotate_left(21) ^ v[0];
    v[2] = v[2].wrapping_add(v[1]);
    v[1] = v[1].rotate_left(17) ^ v[2];
    v[2] = v[2].rotate_left(32);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_classes() {
        assert_eq!(block_size_for(0), Some(64));
        assert_eq!(block_size_for(24), Some(64));
        assert_eq!(block_size_for(25), Some(128));
        assert_eq!(block_size_for(1000), Some(2048));
        assert_eq!(block_size_for(usize::MAX), None);
    }

    #[test]
    fn header_verify_detects_corruption_and_relocation() {
        let h = ObjectHeader::compute(0x10_000, 42, 100);
        assert!(h.verify(0x10_000));
        assert!(!h.verify(0x20_000));
        let mut bytes = h.to_bytes();
        bytes[9] ^= 0x01;
        assert!(!ObjectHeader::from_bytes(&bytes).verify(0x10_000));
    }

    #[test]
    fn guard_bytes_avoid_common_store_values() {
        let p = GuardPattern::for_allocation(0x4_0000, 17, 3);
        for addr in 0x4_0000..0x4_0400 {
            let b = p.byte_at(addr);
            assert!(b >= 0x80, "addr={addr:#x} byte={b:#x}");
            assert_ne!(b, 0xFF);
        }
    }

    #[test]
    fn patterns_are_allocation_specific() {
        let a = GuardPattern::for_allocation(0x1000, 64, 1);
        let b = GuardPattern::for_allocation(0x1000, 64, 2);
        let c = GuardPattern::for_allocation(0x2000, 64, 1);
        assert_ne!(a.bytes(0x1000, 32), b.bytes(0x1000, 32));
        assert_ne!(a.bytes(0x1000, 32), c.bytes(0x1000, 32));
        assert_ne!(a.bytes(0x1000, 32), a.free_pattern().bytes(0x1000, 32));
    }

    #[test]
    fn first_mismatch_points_at_modified_byte() {
        let p = GuardPattern::for_allocation(0x8000, 5, 9);
        let mut observed = p.bytes(0x8005, 11);
        assert_eq!(p.first_mismatch(0x8005, &observed), None);
        observed[3] = 0x00;
        observed[7] = 0x00;
        assert_eq!(p.first_mismatch(0x8005, &observed), Some(3));
    }

    #[test]
    fn record_checksum_separates_parts() {
        let a = record_checksum(&[b"ab", b"c"]);
        let b = record_checksum(&[b"a", b"bc"]);
        assert_ne!(a, b);
        assert_eq!(a, record_checksum(&[b"ab", b"c"]));
    }
}
