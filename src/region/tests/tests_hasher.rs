#[cfg(test)]
mod tests {
    use crate::region::{MaskHasher, RegionHasher, SearchTerms};

    #[test]
    fn test_hash_key_constrains_primary_only() {
        let hasher = MaskHasher::new(2);
        let coord = hasher.hash_key(b"some key");
        assert_eq!(coord.primary_mask, u64::MAX);
        assert_eq!(coord.secondary_lower_mask, 0);
        assert_eq!(coord.secondary_upper_mask, 0);
    }

    #[test]
    fn test_hash_record_is_deterministic() {
        let hasher = MaskHasher::new(2);
        let value = vec![b"alpha".to_vec(), b"beta".to_vec()];
        let (c1, h1) = hasher.hash_record(b"key", &value);
        let (c2, h2) = hasher.hash_record(b"key", &value);
        assert_eq!(c1, c2);
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 2);
    }

    #[test]
    fn test_record_primary_matches_key_hash() {
        let hasher = MaskHasher::new(1);
        let (record_coord, _) = hasher.hash_record(b"key", &[b"v".to_vec()]);
        let key_coord = hasher.hash_key(b"key");
        assert_eq!(record_coord.primary_hash, key_coord.primary_hash);
        assert!(record_coord.primary_intersects(&key_coord));
    }

    #[test]
    fn test_record_fully_constrains_secondary() {
        let hasher = MaskHasher::new(3);
        let value = vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()];
        let (coord, _) = hasher.hash_record(b"key", &value);
        // 128 interleaved positions over 3 attributes: positions 0..128
        // all receive a bit (src_bit < 64 holds for every p < 128).
        assert_eq!(coord.secondary_lower_mask, u64::MAX);
        assert_eq!(coord.secondary_upper_mask, u64::MAX);
    }

    #[test]
    fn test_search_constrains_only_named_attribute() {
        let hasher = MaskHasher::new(2);
        let terms = SearchTerms::new(2).equals(0, b"alpha".to_vec());
        let (coord, hashes) = hasher.hash_search(&terms);

        // Attribute 0 owns the even interleave positions.
        assert_eq!(coord.secondary_lower_mask, 0x5555_5555_5555_5555);
        assert_eq!(coord.secondary_upper_mask, 0x5555_5555_5555_5555);
        assert_eq!(coord.primary_mask, 0);
        assert!(hashes[0].is_some());
        assert!(hashes[1].is_none());
    }

    #[test]
    fn test_search_coordinate_intersects_matching_record() {
        let hasher = MaskHasher::new(2);
        let value = vec![b"alpha".to_vec(), b"beta".to_vec()];
        let (record_coord, _) = hasher.hash_record(b"key", &value);

        let matching = SearchTerms::new(2).equals(0, b"alpha".to_vec());
        let (search_coord, _) = hasher.hash_search(&matching);
        assert!(search_coord.intersects(&record_coord));

        let mismatched = SearchTerms::new(2).equals(0, b"gamma".to_vec());
        let (other_coord, _) = hasher.hash_search(&mismatched);
        // Distinct attribute values hash apart (with overwhelming
        // probability for these fixed inputs).
        assert!(!other_coord.intersects(&record_coord));
    }

    #[test]
    fn test_unconstrained_search_intersects_everything() {
        let hasher = MaskHasher::new(2);
        let (coord, hashes) = hasher.hash_search(&SearchTerms::new(2));
        assert_eq!(coord, crate::region::Coordinate::everything());
        assert!(hashes.iter().all(|h| h.is_none()));
    }
}
