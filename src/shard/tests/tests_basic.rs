#[cfg(test)]
mod tests {
    use crate::region::RegionHasher;
    use crate::shard::tests::helpers::{del, fresh_shard, get, hasher, init_tracing, put};
    use crate::shard::ShardError;
    use tempfile::TempDir;

    #[test]
    fn test_put_get_del() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let shard = fresh_shard(&tmp, 1);

        put(&shard, b"key", &[b"value".to_vec()], 64);
        assert_eq!(get(&shard, b"key"), Some((vec![b"value".to_vec()], 64)));

        assert!(del(&shard, b"key").is_some());
        assert_eq!(get(&shard, b"key"), None);
        assert!(del(&shard, b"key").is_none());
    }

    #[test]
    fn test_multi_attribute_records() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let shard = fresh_shard(&tmp, 2);

        put(
            &shard,
            b"two",
            &[b"value-two-a".to_vec(), b"value-two-b".to_vec()],
            128,
        );
        assert_eq!(
            get(&shard, b"two"),
            Some((vec![b"value-two-a".to_vec(), b"value-two-b".to_vec()], 128))
        );
    }

    #[test]
    fn test_wrong_arity_rejected() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let shard = fresh_shard(&tmp, 2);

        let h = hasher(2);
        let value = vec![b"only-one".to_vec()];
        let (coord, hashes) = h.hash_record(b"key", &[b"a".to_vec(), b"b".to_vec()]);
        let err = shard.put(&coord, &hashes, b"key", &value, 1).unwrap_err();
        assert!(matches!(
            err,
            ShardError::WrongArity {
                expected: 2,
                got: 1
            }
        ));
    }

    #[test]
    fn test_many_keys_round_trip() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let shard = fresh_shard(&tmp, 1);

        for i in 0..500u64 {
            let key = format!("key-{i}");
            put(&shard, key.as_bytes(), &[format!("value-{i}").into_bytes()], i);
        }
        for i in 0..500u64 {
            let key = format!("key-{i}");
            assert_eq!(
                get(&shard, key.as_bytes()),
                Some((vec![format!("value-{i}").into_bytes()], i)),
                "key {i}"
            );
        }
    }

    #[test]
    fn test_horizon_advances_with_writes() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let shard = fresh_shard(&tmp, 1);

        assert_eq!(shard.horizon(), 1);
        let off = put(&shard, b"a", &[b"1".to_vec()], 1);
        assert_eq!(off, 2);
        assert_eq!(shard.horizon(), 2);

        // A delete consumes an op id of its own.
        let off = del(&shard, b"a").unwrap();
        assert_eq!(off, 3);
        assert_eq!(shard.horizon(), 3);
    }

    #[test]
    fn test_stale_space_accounting() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let shard = fresh_shard(&tmp, 1);

        for i in 0..10u64 {
            put(&shard, format!("k{i}").as_bytes(), &[b"v".to_vec()], i);
        }
        assert_eq!(shard.stale_space(), 0);

        for i in 0..5u64 {
            del(&shard, format!("k{i}").as_bytes());
        }
        assert_eq!(shard.stale_space(), 50);
    }

    #[test]
    fn test_copy_to_filters_by_coordinate() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let shard = fresh_shard(&tmp, 1);
        let h = hasher(1);

        for i in 0..40u64 {
            put(&shard, format!("k{i}").as_bytes(), &[b"v".to_vec()], i);
        }
        // Split the primary space on bit 0 of the key hash.
        let zero = crate::region::Coordinate::new(1, 0, 0, 0, 0, 0);
        let one = crate::region::Coordinate::new(1, 1, 0, 0, 0, 0);

        let dest_zero = crate::shard::Shard::create(
            tmp.path().join("zero"),
            zero,
            1,
            hasher(1),
        )
        .unwrap();
        let dest_one =
            crate::shard::Shard::create(tmp.path().join("one"), one, 1, hasher(1)).unwrap();

        shard.copy_to(&zero, &dest_zero).unwrap();
        shard.copy_to(&one, &dest_one).unwrap();

        // Every key lands in exactly the successor its hash selects.
        for i in 0..40u64 {
            let key = format!("k{i}");
            let bit = h.hash_key(key.as_bytes()).primary_hash & 1;
            let (hit, miss) = if bit == 0 {
                (&dest_zero, &dest_one)
            } else {
                (&dest_one, &dest_zero)
            };
            assert!(
                hit.get(h.hash_key(key.as_bytes()).primary_hash, key.as_bytes())
                    .unwrap()
                    .is_some(),
                "key {key} missing from its successor"
            );
            assert!(miss
                .get(h.hash_key(key.as_bytes()).primary_hash, key.as_bytes())
                .unwrap()
                .is_none());
        }
    }

    #[test]
    fn test_overwrite_prefers_highest_version() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let shard = fresh_shard(&tmp, 1);

        // Two records under the same key (the container normally
        // tombstones the old one; mid-flush both can briefly coexist).
        put(&shard, b"key", &[b"old".to_vec()], 10);
        put(&shard, b"key", &[b"new".to_vec()], 20);
        assert_eq!(get(&shard, b"key"), Some((vec![b"new".to_vec()], 20)));
    }
}
