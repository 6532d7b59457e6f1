#[cfg(test)]
mod tests {
    use crate::store::tests::helpers::{fresh_store, get, init_tracing, put};
    use crate::store::{FlushStatus, StoreError};
    use tempfile::TempDir;

    #[test]
    fn test_put_get_before_any_flush() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let store = fresh_store(&tmp, 2);

        // The write is only buffered, but reads must see it immediately.
        put(&store, b"key", &[b"value"], 64);
        assert_eq!(get(&store, b"key"), Some((vec![b"value".to_vec()], 64)));
    }

    #[test]
    fn test_put_get_overwrite_del() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let store = fresh_store(&tmp, 2);

        put(&store, b"key", &[b"value"], 64);
        assert_eq!(get(&store, b"key"), Some((vec![b"value".to_vec()], 64)));

        put(&store, b"key", &[b"other"], 128);
        assert_eq!(get(&store, b"key"), Some((vec![b"other".to_vec()], 128)));

        store.del(b"key").unwrap();
        assert_eq!(get(&store, b"key"), None);
    }

    #[test]
    fn test_reads_after_flush() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let store = fresh_store(&tmp, 2);

        put(&store, b"key", &[b"value"], 64);
        put(&store, b"key", &[b"other"], 128);
        store.del(b"gone").unwrap();
        assert_eq!(store.flush(None, false).unwrap(), FlushStatus::Flushed);

        assert_eq!(get(&store, b"key"), Some((vec![b"other".to_vec()], 128)));
        assert_eq!(get(&store, b"gone"), None);
    }

    #[test]
    fn test_del_after_flush_hides_record() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let store = fresh_store(&tmp, 2);

        put(&store, b"key", &[b"value"], 1);
        store.flush(None, false).unwrap();

        store.del(b"key").unwrap();
        // Buffered del wins over the on-disk record.
        assert_eq!(get(&store, b"key"), None);

        store.flush(None, false).unwrap();
        assert_eq!(get(&store, b"key"), None);
    }

    #[test]
    fn test_two_keys_multi_arity() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let store = fresh_store(&tmp, 3);

        put(&store, b"one", &[b"value-one", b"x"], 64);
        put(&store, b"two", &[b"value-two-a", b"value-two-b"], 128);
        store.flush(None, false).unwrap();

        assert_eq!(
            get(&store, b"one"),
            Some((vec![b"value-one".to_vec(), b"x".to_vec()], 64))
        );
        assert_eq!(
            get(&store, b"two"),
            Some((vec![b"value-two-a".to_vec(), b"value-two-b".to_vec()], 128))
        );
    }

    #[test]
    fn test_wrong_arity() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let store = fresh_store(&tmp, 3);

        let err = store.put(b"key", vec![b"only-one".to_vec()], 1).unwrap_err();
        assert!(matches!(err, StoreError::WrongArity { expected: 2, got: 1 }));
    }

    #[test]
    fn test_flush_is_idempotent_when_empty() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let store = fresh_store(&tmp, 2);

        assert_eq!(store.flush(None, false).unwrap(), FlushStatus::DidNothing);
        put(&store, b"a", &[b"1"], 1);
        assert_eq!(store.flush(None, false).unwrap(), FlushStatus::Flushed);
        assert_eq!(store.flush(None, false).unwrap(), FlushStatus::DidNothing);
        assert_eq!(store.flush(None, false).unwrap(), FlushStatus::DidNothing);
    }

    #[test]
    fn test_destroy_removes_directory() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let store = fresh_store(&tmp, 2);
        put(&store, b"a", &[b"1"], 1);
        store.flush(None, false).unwrap();

        store.destroy().unwrap();
        assert!(!tmp.path().join("store").exists());
    }
}
