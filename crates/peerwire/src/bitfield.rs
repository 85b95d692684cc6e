//! Wrapper types around Bitvec.
use bitvec::prelude::*;

/// Bitfield where index = piece.
pub type Bitfield = BitVec<u8, Msb0>;

/// Reserved bytes exchanged during handshake.
type ReservedAlias = BitArray<[u8; 8], Msb0>;

/// Index of the extension protocol bit, byte 5 with mask `0x10`.
const EXTENSION_BIT: usize = 43;

#[derive(Debug, Clone, Default, Copy, PartialEq, Eq)]
pub struct Reserved(pub ReservedAlias);

impl From<[u8; 8]> for Reserved {
    fn from(value: [u8; 8]) -> Self {
        Self(ReservedAlias::from(value))
    }
}

impl From<Reserved> for [u8; 8] {
    fn from(value: Reserved) -> Self {
        value.0.into_inner()
    }
}

impl Reserved {
    /// Reserved bits of protocols that the client supports, we only support
    /// the `extension protocol`.
    pub fn supported() -> Reserved {
        let mut reserved = Reserved::default();
        reserved.0.set(EXTENSION_BIT, true);
        reserved
    }

    pub fn supports_extended(&self) -> bool {
        self.0[EXTENSION_BIT]
    }
}

pub trait BitfieldExt {
    /// A zeroed bitfield with one bit per piece.
    fn from_piece(pieces: usize) -> Bitfield {
        bitvec![u8, Msb0; 0; pieces]
    }

    /// Build a bitfield from bytes received on the wire, trimming or padding
    /// it to `pieces` bits.
    fn from_wire(bytes: Vec<u8>, pieces: usize) -> Bitfield {
        let mut bitfield = Bitfield::from_vec(bytes);
        bitfield.resize(pieces, false);
        bitfield
    }

    /// Set the bit, growing the vector if needed.
    fn safe_set(&mut self, index: usize);

    /// Read the bit, out of range indices are `false`.
    fn has(&self, index: usize) -> bool;
}

impl BitfieldExt for Bitfield {
    fn safe_set(&mut self, index: usize) {
        if self.len() <= index {
            self.resize(index + 1, false);
        }
        self.set(index, true);
    }

    fn has(&self, index: usize) -> bool {
        self.get(index).map(|b| *b).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_piece() {
        let bitfield = Bitfield::from_piece(1407);
        assert_eq!(bitfield.len(), 1407);
        assert_eq!(bitfield.count_ones(), 0);
    }

    #[test]
    fn safe_set() {
        let mut bitfield = Bitfield::from_wire(vec![0], 2);
        assert_eq!(bitfield.len(), 2);

        bitfield.safe_set(2);
        assert_eq!(bitfield.len(), 3);
        assert!(bitfield.has(2));

        bitfield.safe_set(10);
        assert_eq!(bitfield.len(), 11);
        assert!(bitfield.has(10));
        assert!(!bitfield.has(9));
    }

    #[test]
    fn has_out_of_range() {
        let bitfield = Bitfield::from_piece(4);
        assert!(!bitfield.has(100));
        assert_eq!(bitfield.len(), 4);
    }

    #[test]
    fn from_wire_trims_padding() {
        // the first 4 bits are pieces, the last 4 are padding
        let bitfield = Bitfield::from_wire(vec![0b1011_1111], 4);
        assert_eq!(bitfield.len(), 4);
        assert!(bitfield.has(0));
        assert!(!bitfield.has(1));
        assert!(bitfield.has(2));
        assert!(bitfield.has(3));
        assert_eq!(bitfield.count_ones(), 3);

        let bitfield = Bitfield::from_wire(vec![0, 0], 9);
        assert_eq!(bitfield.len(), 9);
    }

    #[test]
    fn msb_first_on_the_wire() {
        let mut bitfield = Bitfield::from_piece(10);
        bitfield.set(0, true);
        bitfield.set(9, true);
        assert_eq!(bitfield.into_vec(), vec![0b1000_0000, 0b0100_0000]);
    }

    #[test]
    fn supports_ext() {
        let reserved = Reserved::supported();
        assert!(reserved.supports_extended());

        let bytes: [u8; 8] = reserved.into();
        assert_eq!(bytes, [0, 0, 0, 0, 0, 0x10, 0, 0]);

        assert!(!Reserved::from([0u8; 8]).supports_extended());
    }
}
