//! Reputation data vectors and the attestation fold.

use crate::config::ProtocolConfig;
use crate::merkle::{Field, snark_scalar_field, to_field};

use num_bigint::BigUint;

/// A bounded reputation vector.
///
/// Fields `0..sum_field_count` are additive: each change is added modulo the field. The
/// remaining fields are replacement fields whose changes pack a value above a nonce held in
/// the low `repl_nonce_bits` bits. A replacement field holds the change with the highest
/// `(nonce, packed change)` pair, so equal nonces are broken by the larger packed value and the
/// result is independent of the order attestations arrive in. An untouched field is zero, the
/// least element of that order, so it needs no separate marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReputationData {
    fields: Vec<Field>,
    sum_field_count: usize,
    repl_nonce_bits: u32,
}

impl ReputationData {
    /// An all-zero vector shaped by `protocol`.
    pub fn new(protocol: &ProtocolConfig) -> Self {
        Self {
            fields: vec![Field::default(); protocol.field_count],
            sum_field_count: protocol.sum_field_count,
            repl_nonce_bits: protocol.repl_nonce_bits,
        }
    }

    /// Restore a vector from raw field values, padding or truncating to the configured size.
    pub fn from_fields(protocol: &ProtocolConfig, mut fields: Vec<Field>) -> Self {
        fields.resize(protocol.field_count, Field::default());
        Self {
            fields,
            sum_field_count: protocol.sum_field_count,
            repl_nonce_bits: protocol.repl_nonce_bits,
        }
    }

    /// Pack a replacement value and its nonce into an attestation change.
    pub fn pack_replacement(protocol: &ProtocolConfig, value: &Field, nonce: u64) -> Field {
        to_field(&((value << protocol.repl_nonce_bits) | Field::from(nonce)))
    }

    /// Fold `changes` in order into a fresh vector.
    pub fn fold<'a, I>(protocol: &ProtocolConfig, changes: I) -> Self
    where
        I: IntoIterator<Item = (usize, &'a Field)>,
    {
        let mut data = Self::new(protocol);
        for (field_index, change) in changes {
            data.apply(field_index, change);
        }
        data
    }

    /// Apply one attestation change. Returns false if `field_index` is out of range.
    pub fn apply(&mut self, field_index: usize, change: &Field) -> bool {
        let is_sum_field = field_index < self.sum_field_count;
        let nonce_mask = self.nonce_mask();
        let Some(current) = self.fields.get_mut(field_index) else {
            return false;
        };

        if is_sum_field {
            *current = (&*current + change) % snark_scalar_field();
        } else {
            let change = to_field(change);
            let current_nonce = &*current & &nonce_mask;
            let change_nonce = &change & &nonce_mask;
            if (&change_nonce, &change) > (&current_nonce, &*current) {
                *current = change;
            }
        }
        true
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn into_fields(self) -> Vec<Field> {
        self.fields
    }

    /// Field value with any replacement nonce stripped.
    pub fn value(&self, field_index: usize) -> Option<Field> {
        let raw = self.fields.get(field_index)?;
        if field_index < self.sum_field_count {
            Some(raw.clone())
        } else {
            Some(raw >> self.repl_nonce_bits)
        }
    }

    /// Nonce of a replacement field, `None` for additive fields.
    pub fn nonce(&self, field_index: usize) -> Option<u64> {
        if field_index < self.sum_field_count {
            return None;
        }
        let raw = self.fields.get(field_index)?;
        u64::try_from(&(raw & &self.nonce_mask())).ok()
    }

    fn nonce_mask(&self) -> BigUint {
        (BigUint::from(1u8) << self.repl_nonce_bits) - 1u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn protocol() -> ProtocolConfig {
        ProtocolConfig {
            field_count: 4,
            sum_field_count: 2,
            repl_nonce_bits: 8,
            ..ProtocolConfig::default()
        }
    }

    #[test]
    fn additive_fields_wrap_modulo_the_field() {
        let protocol = protocol();
        let minus_three = snark_scalar_field().clone() - 3u32;
        let changes = [Field::from(10u8), Field::from(5u8), minus_three];
        let data = ReputationData::fold(&protocol, changes.iter().map(|c| (0, c)));
        assert_eq!(data.value(0), Some(Field::from(12u8)));
        assert_eq!(data.nonce(0), None);
    }

    #[test]
    fn highest_nonce_wins_regardless_of_order() {
        let protocol = protocol();
        let seven_at_one = ReputationData::pack_replacement(&protocol, &Field::from(7u8), 1);
        let nine_at_zero = ReputationData::pack_replacement(&protocol, &Field::from(9u8), 0);

        let forward = ReputationData::fold(&protocol, [(2, &seven_at_one), (2, &nine_at_zero)]);
        let reverse = ReputationData::fold(&protocol, [(2, &nine_at_zero), (2, &seven_at_one)]);
        assert_eq!(forward, reverse);
        assert_eq!(forward.value(2), Some(Field::from(7u8)));
        assert_eq!(forward.nonce(2), Some(1));
    }

    #[test]
    fn equal_nonces_resolve_to_the_same_winner_in_any_order() {
        let protocol = protocol();
        let nine = ReputationData::pack_replacement(&protocol, &Field::from(9u8), 3);
        let seven = ReputationData::pack_replacement(&protocol, &Field::from(7u8), 3);

        let forward = ReputationData::fold(&protocol, [(2, &nine), (2, &seven)]);
        let reverse = ReputationData::fold(&protocol, [(2, &seven), (2, &nine)]);
        assert_eq!(forward, reverse);
        assert_eq!(forward.value(2), Some(Field::from(9u8)));
        assert_eq!(forward.nonce(2), Some(3));
    }

    #[test]
    fn zero_value_writes_take_part_in_the_nonce_order() {
        let protocol = protocol();
        let zero_at_zero = ReputationData::pack_replacement(&protocol, &Field::from(0u8), 0);
        let five_at_zero = ReputationData::pack_replacement(&protocol, &Field::from(5u8), 0);
        let zero_at_two = ReputationData::pack_replacement(&protocol, &Field::from(0u8), 2);
        let seven_at_one = ReputationData::pack_replacement(&protocol, &Field::from(7u8), 1);

        let forward = ReputationData::fold(&protocol, [(3, &zero_at_zero), (3, &five_at_zero)]);
        let reverse = ReputationData::fold(&protocol, [(3, &five_at_zero), (3, &zero_at_zero)]);
        assert_eq!(forward, reverse);
        assert_eq!(forward.value(3), Some(Field::from(5u8)));

        let cleared = ReputationData::fold(&protocol, [(3, &zero_at_two), (3, &seven_at_one)]);
        assert_eq!(cleared.value(3), Some(Field::from(0u8)));
        assert_eq!(cleared.nonce(3), Some(2));
    }

    #[test]
    fn out_of_range_fields_are_rejected() {
        let mut data = ReputationData::new(&protocol());
        assert!(!data.apply(4, &Field::from(1u8)));
        assert!(data.fields().iter().all(|f| *f == Field::default()));
    }

    #[test]
    fn from_fields_resizes_to_the_configured_width() {
        let data = ReputationData::from_fields(&protocol(), vec![Field::from(1u8)]);
        assert_eq!(data.fields().len(), 4);
    }
}
