#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::region::{Coordinate, RegionHasher};
    use crate::shard::snapshot::ShardSnapshot;
    use crate::shard::tests::helpers::{hasher, init_tracing};
    use crate::shard::Shard;
    use tempfile::TempDir;

    fn put(shard: &Shard, key: &[u8], value: &[Vec<u8>], version: u64) {
        let h = hasher(shard.attrs());
        let (coord, hashes) = h.hash_record(key, value);
        shard.put(&coord, &hashes, key, value, version).unwrap();
    }

    fn del(shard: &Shard, key: &[u8]) {
        let h = hasher(shard.attrs());
        shard.del(h.hash_key(key).primary_hash, key).unwrap();
    }

    fn all_constraints(attrs: usize) -> Vec<Option<u64>> {
        vec![None; attrs]
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_puts() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let shard = Arc::new(
            Shard::create(tmp.path().join("s"), Coordinate::everything(), 1, hasher(1)).unwrap(),
        );

        for i in 0..10u64 {
            put(&shard, format!("k{i}").as_bytes(), &[b"v".to_vec()], i);
        }
        let snap = ShardSnapshot::capture(Arc::clone(&shard), shard.horizon());

        for i in 10..20u64 {
            put(&shard, format!("k{i}").as_bytes(), &[b"v".to_vec()], i);
        }

        let records = snap.records(&all_constraints(1)).unwrap();
        assert_eq!(records.len(), 10);
        let mut versions: Vec<u64> = records.iter().map(|r| r.version).collect();
        versions.sort_unstable();
        assert_eq!(versions, (0..10).collect::<Vec<u64>>());
    }

    #[test]
    fn test_snapshot_survives_later_removal() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let shard = Arc::new(
            Shard::create(tmp.path().join("s"), Coordinate::everything(), 1, hasher(1)).unwrap(),
        );

        put(&shard, b"key", &[b"value".to_vec()], 42);
        let snap = ShardSnapshot::capture(Arc::clone(&shard), shard.horizon());

        // Tombstoning after the capture must not change what it yields.
        del(&shard, b"key");

        let records = snap.records(&all_constraints(1)).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, b"key");
        assert_eq!(records[0].value, vec![b"value".to_vec()]);
        assert_eq!(records[0].version, 42);

        // A snapshot taken now sees nothing.
        let later = ShardSnapshot::capture(Arc::clone(&shard), shard.horizon());
        assert!(later.records(&all_constraints(1)).unwrap().is_empty());
    }

    #[test]
    fn test_snapshot_excludes_removals_before_horizon() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let shard = Arc::new(
            Shard::create(tmp.path().join("s"), Coordinate::everything(), 1, hasher(1)).unwrap(),
        );

        put(&shard, b"a", &[b"1".to_vec()], 1);
        put(&shard, b"b", &[b"2".to_vec()], 2);
        del(&shard, b"a");

        let snap = ShardSnapshot::capture(Arc::clone(&shard), shard.horizon());
        let records = snap.records(&all_constraints(1)).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, b"b");
    }

    #[test]
    fn test_constrained_snapshot() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let h = hasher(2);
        let shard = Arc::new(
            Shard::create(tmp.path().join("s"), Coordinate::everything(), 2, h.clone()).unwrap(),
        );

        for i in 0..100u64 {
            let attr0 = if i % 2 == 0 { b"A".to_vec() } else { b"B".to_vec() };
            let attr1 = if i % 3 == 0 { b"X".to_vec() } else { b"Y".to_vec() };
            put(&shard, format!("k{i}").as_bytes(), &[attr0, attr1], i);
        }

        let snap = ShardSnapshot::capture(Arc::clone(&shard), shard.horizon());
        let (_, constraints) = h.hash_search(
            &crate::region::SearchTerms::new(2).equals(0, b"A".to_vec()),
        );
        let records = snap.records(&constraints).unwrap();
        assert_eq!(records.len(), 50);
        assert!(records.iter().all(|r| r.value[0] == b"A"));
    }
}
