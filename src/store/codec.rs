//! Fixed-width binary layout of observation records.
//!
//! A record is a run of 4-byte little-endian `f32` slots, one per entity key
//! known when the record was written, in ascending `order_index`. Categorical
//! slots hold the string-table id as a float. A record may be shorter than the
//! current schema: keys registered later simply have no slot in it.

use super::interner::StringInterner;
use super::StoreError;
use crate::types::{EntityKey, EntityKind, FieldValue, Fields};

pub const SLOT_WIDTH: usize = 4;

/// A slot ready to be written; `None` means the field is absent.
pub type Slot<'a> = (&'a str, Option<f32>);

/// Pack slots into a blob.
///
/// Absent slots at the tail are dropped (the record just ends earlier). An
/// absent slot followed by a present one cannot be expressed in this layout.
pub fn pack(slots: &[Slot<'_>]) -> Result<Vec<u8>, StoreError> {
    let used = slots
        .iter()
        .rposition(|(_, value)| value.is_some())
        .map(|last| last + 1)
        .unwrap_or(0);

    let mut blob = Vec::with_capacity(used * SLOT_WIDTH);
    for (name, value) in &slots[..used] {
        let value = value.ok_or_else(|| StoreError::MissingField((*name).to_string()))?;
        blob.extend_from_slice(&value.to_le_bytes());
    }
    Ok(blob)
}

/// Decode a blob against the current schema.
///
/// The result is sparse: keys without a slot and categorical ids the interner
/// cannot resolve are left out.
pub fn unpack(keys: &[EntityKey], blob: &[u8], strings: &StringInterner) -> Result<Fields, StoreError> {
    if blob.len() % SLOT_WIDTH != 0 || blob.len() / SLOT_WIDTH > keys.len() {
        return Err(StoreError::CorruptRecord {
            reason: format!(
                "blob of {} bytes does not fit a schema of {} keys ({})",
                blob.len(),
                keys.len(),
                hex::encode(blob)
            ),
        });
    }

    let mut fields = Fields::new();
    for (key, chunk) in keys.iter().zip(blob.chunks_exact(SLOT_WIDTH)) {
        let raw = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        match key.kind {
            EntityKind::Numeric => {
                fields.insert(key.name.clone(), FieldValue::Number(f64::from(raw)));
            }
            EntityKind::Categorical => match strings.resolve(raw as i64) {
                Some(text) => {
                    fields.insert(key.name.clone(), FieldValue::Text(text.to_string()));
                }
                None => {
                    log::debug!("Unresolved string id {} for entity '{}'", raw, key.name);
                }
            },
        }
    }
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str, kind: EntityKind, order_index: i64) -> EntityKey {
        EntityKey {
            name: name.to_string(),
            kind,
            order_index,
            significance: 0.0,
        }
    }

    #[test]
    fn test_pack_little_endian_layout() {
        let blob = pack(&[("a", Some(1.0)), ("b", Some(-2.5))]).unwrap();
        assert_eq!(blob.len(), 8);
        assert_eq!(&blob[..4], &1.0f32.to_le_bytes());
        assert_eq!(&blob[4..], &(-2.5f32).to_le_bytes());
    }

    #[test]
    fn test_pack_trims_trailing_absent() {
        let blob = pack(&[("a", Some(1.0)), ("b", None), ("c", None)]).unwrap();
        assert_eq!(blob.len(), 4);

        let empty = pack(&[("a", None)]).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_pack_rejects_interior_gap() {
        let err = pack(&[("a", None), ("b", Some(3.0))]).unwrap_err();
        assert!(matches!(err, StoreError::MissingField(name) if name == "a"));
    }

    #[test]
    fn test_unpack_short_record_is_sparse() {
        let keys = vec![
            key("temp", EntityKind::Numeric, 1),
            key("humidity", EntityKind::Numeric, 2),
        ];
        let blob = 21.5f32.to_le_bytes().to_vec();
        let fields = unpack(&keys, &blob, &StringInterner::default()).unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields["temp"], FieldValue::Number(21.5));
    }

    #[test]
    fn test_unpack_rejects_malformed_length() {
        let keys = vec![key("temp", EntityKind::Numeric, 1)];

        let odd = vec![0u8; 5];
        assert!(matches!(
            unpack(&keys, &odd, &StringInterner::default()),
            Err(StoreError::CorruptRecord { .. })
        ));

        let too_long = vec![0u8; 8];
        assert!(matches!(
            unpack(&keys, &too_long, &StringInterner::default()),
            Err(StoreError::CorruptRecord { .. })
        ));
    }

    #[test]
    fn test_unpack_drops_unresolved_categorical() {
        let keys = vec![key("room", EntityKind::Categorical, 1)];
        let blob = 7.0f32.to_le_bytes().to_vec();
        let fields = unpack(&keys, &blob, &StringInterner::default()).unwrap();
        assert!(fields.is_empty());
    }
}
