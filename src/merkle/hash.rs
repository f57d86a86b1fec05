//! Field arithmetic and the protocol hash used by every tree and leaf derivation.

use num_bigint::BigUint;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

/// An element of the BN254 scalar field.
pub type Field = BigUint;

/// Big-endian bytes of the BN254 scalar field modulus.
const SNARK_SCALAR_FIELD_BYTES: [u8; 32] = [
    0x30, 0x64, 0x4e, 0x72, 0xe1, 0x31, 0xa0, 0x29, 0xb8, 0x50, 0x45, 0xb6, 0x81, 0x81, 0x58, 0x5d,
    0x28, 0x33, 0xe8, 0x48, 0x79, 0xb9, 0x70, 0x91, 0x43, 0xe1, 0xf5, 0x93, 0xf0, 0x00, 0x00, 0x01,
];

/// The field modulus every value is reduced by.
pub fn snark_scalar_field() -> &'static Field {
    static MODULUS: OnceLock<Field> = OnceLock::new();
    MODULUS.get_or_init(|| BigUint::from_bytes_be(&SNARK_SCALAR_FIELD_BYTES))
}

/// Reduce an arbitrary integer into the field.
pub fn to_field(value: &BigUint) -> Field {
    value % snark_scalar_field()
}

/// Encode a field element as a 32-byte big-endian word.
pub fn to_word(value: &Field) -> [u8; 32] {
    let reduced = to_field(value);
    let bytes = reduced.to_bytes_be();
    let mut word = [0u8; 32];
    word[32 - bytes.len()..].copy_from_slice(&bytes);
    word
}

/// Hash a sequence of field elements into a single field element.
///
/// Each input is reduced and absorbed as a 32-byte big-endian word. The digest is
/// reduced into the field so outputs can feed further hashing.
pub fn hash_many<'a, I>(inputs: I) -> Field
where
    I: IntoIterator<Item = &'a Field>,
{
    let mut hasher = Sha256::new();
    for input in inputs {
        hasher.update(to_word(input));
    }
    to_field(&BigUint::from_bytes_be(&hasher.finalize()))
}

/// Hash a pair of nodes.
pub fn hash2(left: &Field, right: &Field) -> Field {
    hash_many([left, right])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_are_left_padded() {
        let word = to_word(&BigUint::from(0x0102u32));
        assert_eq!(word[30], 0x01);
        assert_eq!(word[31], 0x02);
        assert!(word[..30].iter().all(|b| *b == 0));
    }

    #[test]
    fn values_are_reduced_into_the_field() {
        let p = snark_scalar_field().clone();
        assert_eq!(to_field(&(p.clone() + 5u32)), BigUint::from(5u32));
        assert_eq!(to_word(&p), [0u8; 32]);
    }

    #[test]
    fn hash_is_order_sensitive() {
        let a = BigUint::from(1u32);
        let b = BigUint::from(2u32);
        assert_ne!(hash2(&a, &b), hash2(&b, &a));
        assert!(hash2(&a, &b) < *snark_scalar_field());
    }
}
