#[cfg(test)]
mod tests {
    use crate::region::Coordinate;

    #[test]
    fn test_everything_intersects_anything() {
        let all = Coordinate::everything();
        let specific = Coordinate::new(u64::MAX, 0xABCD, u64::MAX, 0x1234, u64::MAX, 0x5678);
        assert!(all.intersects(&specific));
        assert!(specific.intersects(&all));
        assert!(all.intersects(&all));
    }

    #[test]
    fn test_primary_disjoint_regions() {
        // One mask bit constrained, opposite hash values.
        let zero = Coordinate::new(1, 0, 0, 0, 0, 0);
        let one = Coordinate::new(1, 1, 0, 0, 0, 0);
        assert!(!zero.intersects(&one));
        assert!(!zero.primary_intersects(&one));
        // Both still intersect in the secondary projection.
        assert!(zero.secondary_intersects(&one));
    }

    #[test]
    fn test_intersection_only_over_shared_mask_bits() {
        // a constrains bit 0, b constrains bit 1; they disagree on bits
        // the other does not constrain, so they intersect.
        let a = Coordinate::new(0b01, 0b01, 0, 0, 0, 0);
        let b = Coordinate::new(0b10, 0b10, 0, 0, 0, 0);
        assert!(a.intersects(&b));

        // Now both constrain bit 0 with different values.
        let c = Coordinate::new(0b11, 0b00, 0, 0, 0, 0);
        assert!(!a.intersects(&c));
    }

    #[test]
    fn test_secondary_upper_word_participates() {
        let a = Coordinate::new(0, 0, 0, 0, 1, 0);
        let b = Coordinate::new(0, 0, 0, 0, 1, 1);
        assert!(!a.intersects(&b));
        assert!(a.primary_intersects(&b));
    }

    #[test]
    fn test_equality_is_fieldwise() {
        let a = Coordinate::new(1, 2, 3, 4, 5, 6);
        let b = Coordinate::new(1, 2, 3, 4, 5, 6);
        let c = Coordinate::new(1, 2, 3, 4, 5, 7);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
