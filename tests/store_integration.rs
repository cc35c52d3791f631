//! Integration tests for the observation store
//!
//! Key properties tested:
//! - Records written before an entity existed decode without it
//! - Entity deletion rewrites the corpus without losing records
//! - Categorical values round-trip through the string table
//! - Everything survives closing and reopening the file

#[cfg(test)]
mod store_integration_tests {
    use labelflow::store::{ObservationStore, StoreError};
    use labelflow::types::{EntityKind, FieldValue, Fields};
    use tempfile::TempDir;

    fn fields(pairs: &[(&str, FieldValue)]) -> Fields {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn num(n: f64) -> FieldValue {
        FieldValue::Number(n)
    }

    fn text(s: &str) -> FieldValue {
        FieldValue::Text(s.to_string())
    }

    #[test]
    fn test_sparse_decode_after_schema_growth() {
        // Test: an old record never gains a field registered after it was written
        let dir = TempDir::new().unwrap();
        let store = ObservationStore::open(dir.path().join("m.db")).unwrap();

        store.add_observation("a", &fields(&[("temp", num(20.0))]), Some(1.0)).unwrap();
        store
            .add_observation("b", &fields(&[("temp", num(22.0)), ("lux", num(300.0))]), Some(2.0))
            .unwrap();

        let observations = store.observations().unwrap();
        assert_eq!(observations.len(), 2);
        let old = observations.iter().find(|o| o.label == "a").unwrap();
        assert!(!old.fields.contains_key("lux"));
        assert_eq!(old.fields["temp"], num(20.0));

        let new = observations.iter().find(|o| o.label == "b").unwrap();
        assert_eq!(new.fields["lux"], num(300.0));
    }

    #[test]
    fn test_delete_entity_preserves_everything_else() {
        // Test: after deleting an entity every record lacks it and keeps the rest
        let dir = TempDir::new().unwrap();
        let store = ObservationStore::open(dir.path().join("m.db")).unwrap();

        store
            .add_observation("home", &fields(&[("temp", num(21.0)), ("room", text("den"))]), Some(1.0))
            .unwrap();
        store
            .add_observation(
                "away",
                &fields(&[("temp", num(15.0)), ("room", text("hall")), ("lux", num(5.0))]),
                Some(2.0),
            )
            .unwrap();
        store.add_observation("home", &fields(&[("temp", num(22.5))]), Some(3.0)).unwrap();

        let before = store.observations().unwrap();
        store.delete_entity("room").unwrap();
        let after = store.observations().unwrap();

        assert_eq!(after.len(), before.len());
        for (old, new) in before.iter().zip(after.iter()) {
            assert_eq!(old.timestamp, new.timestamp);
            assert_eq!(old.label, new.label);
            assert!(!new.fields.contains_key("room"));
            let mut expected = old.fields.clone();
            expected.shift_remove("room");
            assert_eq!(new.fields, expected);
        }

        let names: Vec<String> = store.entity_keys().unwrap().into_iter().map(|k| k.name).collect();
        assert_eq!(names, vec!["temp", "lux"]);
    }

    #[test]
    fn test_delete_unknown_entity_fails() {
        let dir = TempDir::new().unwrap();
        let store = ObservationStore::open(dir.path().join("m.db")).unwrap();
        assert!(matches!(store.delete_entity("ghost"), Err(StoreError::UnknownEntity(_))));
    }

    #[test]
    fn test_categorical_round_trip_and_reopen() {
        // Test: categorical strings and schema kinds survive a reopen
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m.db");
        {
            let store = ObservationStore::open(&path).unwrap();
            store
                .add_observation("x", &fields(&[("door", text("open")), ("temp", num(19.5))]), Some(5.0))
                .unwrap();
            store
                .add_observation("y", &fields(&[("door", text("closed")), ("temp", num(18.0))]), Some(6.0))
                .unwrap();
            store.close();
        }

        let store = ObservationStore::open(&path).unwrap();
        let keys = store.entity_keys().unwrap();
        assert_eq!(keys[0].name, "door");
        assert_eq!(keys[0].kind, EntityKind::Categorical);
        assert_eq!(keys[1].kind, EntityKind::Numeric);

        let observations = store.observations().unwrap();
        assert_eq!(observations[0].label, "y");
        assert_eq!(observations[0].fields["door"], text("closed"));
        assert_eq!(observations[1].fields["door"], text("open"));
        assert_eq!(observations[1].fields["temp"], num(19.5));
    }

    #[test]
    fn test_interior_gap_is_rejected() {
        // Test: an absent field before a present one cannot be encoded
        let dir = TempDir::new().unwrap();
        let store = ObservationStore::open(dir.path().join("m.db")).unwrap();
        store
            .add_observation("a", &fields(&[("temp", num(1.0)), ("lux", num(2.0))]), Some(1.0))
            .unwrap();

        let err = store.add_observation("b", &fields(&[("lux", num(3.0))]), Some(2.0));
        assert!(matches!(err, Err(StoreError::MissingField(name)) if name == "temp"));
        assert_eq!(store.observation_count().unwrap(), 1);
    }

    #[test]
    fn test_deletes_since_and_by_timestamp() {
        let dir = TempDir::new().unwrap();
        let store = ObservationStore::open(dir.path().join("m.db")).unwrap();
        for t in 1..=5 {
            store
                .add_observation("a", &fields(&[("temp", num(t as f64))]), Some(t as f64))
                .unwrap();
        }

        assert_eq!(store.delete_observation(2.0).unwrap(), 1);
        assert_eq!(store.delete_observation(2.0).unwrap(), 0);
        assert_eq!(store.delete_observations_since(4.0).unwrap(), 2);
        let remaining: Vec<f64> = store.observations().unwrap().iter().map(|o| o.timestamp).collect();
        assert_eq!(remaining, vec![3.0, 1.0]);
    }
}
