//! Bit-string labels for Patricia edges.
//!
//! A label is up to 256 bits stored left-aligned in a 32-byte word; bits past
//! `length` are always zero so that equal labels hash equally.

use crate::codec::{keccak256_concat, u256_word, Hash};

/// Maximum label length (a full key hash)
pub const KEY_BITS: u16 = 256;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Label {
    pub data: Hash,
    pub length: u16,
}

impl Label {
    /// Label covering a full 256-bit key hash
    pub fn full(data: Hash) -> Self {
        Self {
            data,
            length: KEY_BITS,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Bit `i` counted from the most significant bit
    pub fn bit(&self, i: u16) -> u8 {
        debug_assert!(i < self.length);
        bit_at(&self.data, i)
    }

    /// First bit and the remaining label
    pub fn chop_first_bit(&self) -> (u8, Label) {
        debug_assert!(self.length > 0);
        let head = bit_at(&self.data, 0);
        (
            head,
            Label {
                data: shl(&self.data, 1),
                length: self.length - 1,
            },
        )
    }

    /// Split into the first `pos` bits and the rest
    pub fn split_at(&self, pos: u16) -> (Label, Label) {
        debug_assert!(pos <= self.length);
        let prefix = Label {
            data: keep_prefix(&self.data, pos),
            length: pos,
        };
        let suffix = Label {
            data: shl(&self.data, pos),
            length: self.length - pos,
        };
        (prefix, suffix)
    }

    /// Length of the longest common prefix with `other`
    pub fn common_prefix_len(&self, other: &Label) -> u16 {
        let max = self.length.min(other.length);
        let mut len = 0u16;
        for (a, b) in self.data.iter().zip(other.data.iter()) {
            let diff = a ^ b;
            if diff == 0 {
                len += 8;
                if len >= max {
                    return max;
                }
            } else {
                len += diff.leading_zeros() as u16;
                return len.min(max);
            }
        }
        max
    }

    /// Common prefix with `other`, and what remains of `self` after it
    pub fn split_common_prefix(&self, other: &Label) -> (Label, Label) {
        self.split_at(self.common_prefix_len(other))
    }
}

/// `hash(node | uint256(length) | data)`, the ledger's edge hash
pub fn edge_hash(node: &Hash, label: &Label) -> Hash {
    keccak256_concat(&[node, &u256_word(label.length as u128), &label.data])
}

pub(crate) fn bit_at(data: &Hash, i: u16) -> u8 {
    let byte = data[(i / 8) as usize];
    (byte >> (7 - (i % 8))) & 1
}

pub(crate) fn set_bit(data: &mut Hash, i: u16) {
    data[(i / 8) as usize] |= 1 << (7 - (i % 8));
}

fn keep_prefix(data: &Hash, len: u16) -> Hash {
    let mut out = [0u8; 32];
    let full_bytes = (len / 8) as usize;
    out[..full_bytes].copy_from_slice(&data[..full_bytes]);
    let rem = len % 8;
    if rem > 0 {
        out[full_bytes] = data[full_bytes] & (0xffu8 << (8 - rem));
    }
    out
}

fn shl(data: &Hash, n: u16) -> Hash {
    let mut out = [0u8; 32];
    if n >= KEY_BITS {
        return out;
    }
    let byte_shift = (n / 8) as usize;
    let bit_shift = (n % 8) as u32;
    for i in 0..32 - byte_shift {
        let src = i + byte_shift;
        let mut value = data[src] << bit_shift;
        if bit_shift > 0 && src + 1 < 32 {
            value |= data[src + 1] >> (8 - bit_shift);
        }
        out[i] = value;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label_from_bits(bits: &[u8]) -> Label {
        let mut data = [0u8; 32];
        for (i, b) in bits.iter().enumerate() {
            if *b == 1 {
                set_bit(&mut data, i as u16);
            }
        }
        Label {
            data,
            length: bits.len() as u16,
        }
    }

    #[test]
    fn test_chop_first_bit() {
        let label = label_from_bits(&[1, 0, 1, 1]);
        let (head, tail) = label.chop_first_bit();
        assert_eq!(head, 1);
        assert_eq!(tail, label_from_bits(&[0, 1, 1]));
    }

    #[test]
    fn test_split_at_keeps_trailing_bits_zero() {
        let label = Label::full([0xff; 32]);
        let (prefix, suffix) = label.split_at(11);

        assert_eq!(prefix.length, 11);
        assert_eq!(prefix.data[0], 0xff);
        assert_eq!(prefix.data[1], 0b1110_0000);
        assert!(prefix.data[2..].iter().all(|b| *b == 0));
        assert_eq!(suffix.length, 245);
        assert_eq!(suffix.data[29], 0xff);
        assert_eq!(suffix.data[30], 0b1111_1000);
        assert_eq!(suffix.data[31], 0);
    }

    #[test]
    fn test_common_prefix_len() {
        let a = label_from_bits(&[1, 0, 1, 1, 0]);
        let b = label_from_bits(&[1, 0, 1, 0, 0]);
        assert_eq!(a.common_prefix_len(&b), 3);

        let short = label_from_bits(&[1, 0]);
        assert_eq!(a.common_prefix_len(&short), 2);
        assert_eq!(a.common_prefix_len(&a), 5);

        let x = Label::full([0u8; 32]);
        let mut y_data = [0u8; 32];
        y_data[20] = 0x01;
        assert_eq!(x.common_prefix_len(&Label::full(y_data)), 167);
    }

    #[test]
    fn test_split_common_prefix() {
        let key = label_from_bits(&[0, 1, 1, 0, 1]);
        let edge = label_from_bits(&[0, 1, 0]);
        let (prefix, suffix) = key.split_common_prefix(&edge);
        assert_eq!(prefix, label_from_bits(&[0, 1]));
        assert_eq!(suffix, label_from_bits(&[1, 0, 1]));
    }

    #[test]
    fn test_shl_across_bytes() {
        let mut data = [0u8; 32];
        data[1] = 0b0000_0001;
        let shifted = shl(&data, 9);
        assert_eq!(shifted[0], 0b0000_0010);
        assert_eq!(shl(&data, 256), [0u8; 32]);
    }

    #[test]
    fn test_edge_hash_depends_on_length() {
        let node = [7u8; 32];
        let a = Label {
            data: [0u8; 32],
            length: 3,
        };
        let b = Label {
            data: [0u8; 32],
            length: 4,
        };
        assert_ne!(edge_hash(&node, &a), edge_hash(&node, &b));
    }
}
