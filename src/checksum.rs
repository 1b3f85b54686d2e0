//! CRC-32 with the Koopman polynomial and the per-file block accumulator.
//!
//! Polynomial 0x741B8CD7 (reflected 0xEB31D82E), initial value and final
//! XOR 0xFFFFFFFF, reflected input and output.  Check value for the ASCII
//! string `"123456789"` is 0x2D3DD0AE.
//!
//! A file's trailing checksum is the XOR of the CRCs of its compressed
//! blocks.  XOR is associative and commutative, so blocks produced by
//! different worker slots may be merged in any order.  It is NOT the CRC of
//! the concatenated blocks.

use crc::{Algorithm, Crc};

/// Not in the CRC catalogue; CRC-32/MEF uses the same polynomial with no
/// final XOR.
const CRC_32_KOOPMAN: Algorithm<u32> = Algorithm {
    width:   32,
    poly:    0x741B_8CD7,
    init:    0xFFFF_FFFF,
    refin:   true,
    refout:  true,
    xorout:  0xFFFF_FFFF,
    check:   0x2D3D_D0AE,
    residue: 0x0843_323B,
};

static KOOPMAN: Crc<u32> = Crc::<u32>::new(&CRC_32_KOOPMAN);

/// CRC32-Koopman of `data`.
pub fn koopman(data: &[u8]) -> u32 {
    KOOPMAN.checksum(data)
}

/// Running XOR of per-block CRCs for one file.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BlockCrc {
    value:  u32,
    blocks: u64,
    bytes:  u64,
}

impl BlockCrc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one compressed block exactly as it appears in its frame.
    pub fn update(&mut self, block: &[u8]) {
        self.value  ^= koopman(block);
        self.blocks += 1;
        self.bytes  += block.len() as u64;
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    /// Number of frames merged.
    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    /// Sum of the merged frame lengths.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn check_value() {
        assert_eq!(koopman(b"123456789"), 0x2D3D_D0AE);
        assert_eq!(koopman(b"123456789"), CRC_32_KOOPMAN.check);
    }

    #[test]
    fn known_vectors() {
        assert_eq!(koopman(b"a"), 0x0DA2_AA8A);
        assert_eq!(koopman(&[0u8; 4]), 0xF7BC_CDC4);
    }

    #[test]
    fn empty_input() {
        assert_eq!(koopman(b""), 0);
        assert_eq!(BlockCrc::new().value(), 0);
    }

    #[test]
    fn single_block_equals_plain_crc() {
        let mut acc = BlockCrc::new();
        acc.update(b"hello\n");
        assert_eq!(acc.value(), koopman(b"hello\n"));
        assert_eq!(acc.blocks(), 1);
        assert_eq!(acc.bytes(), 6);
    }

    #[test]
    fn xor_is_not_crc_of_concatenation() {
        let mut acc = BlockCrc::new();
        acc.update(b"abc");
        acc.update(b"def");
        assert_ne!(acc.value(), koopman(b"abcdef"));
    }

    proptest! {
        #[test]
        fn merge_order_does_not_matter(blocks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 0..8)) {
            let mut forward = BlockCrc::new();
            for b in &blocks { forward.update(b); }
            let mut backward = BlockCrc::new();
            for b in blocks.iter().rev() { backward.update(b); }
            prop_assert_eq!(forward.value(), backward.value());
        }

        #[test]
        fn single_bit_flip_changes_crc(data in prop::collection::vec(any::<u8>(), 1..256), idx in any::<prop::sample::Index>(), bit in 0u8..8) {
            let mut flipped = data.clone();
            let i = idx.index(flipped.len());
            flipped[i] ^= 1 << bit;
            prop_assert_ne!(koopman(&data), koopman(&flipped));
        }
    }
}
