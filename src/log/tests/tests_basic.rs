#[cfg(test)]
mod tests {
    use crate::log::tests::helpers::{init_tracing, payload};
    use crate::log::Log;
    use tempfile::TempDir;

    #[test]
    fn test_append_then_lookup() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let log = Log::open(tmp.path().join("log")).unwrap();

        let id = log.append(b"hello world").unwrap();
        assert_eq!(id, 1);
        assert_eq!(log.lookup(id).unwrap(), Some(b"hello world".to_vec()));
        log.close().unwrap();
    }

    #[test]
    fn test_ids_are_monotonic_and_dense() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let log = Log::open(tmp.path().join("log")).unwrap();

        for expected in 1..=100u64 {
            let id = log.append(format!("record {expected}").as_bytes()).unwrap();
            assert_eq!(id, expected);
        }
        assert_eq!(log.next_id(), 101);

        for id in 1..=100u64 {
            assert_eq!(
                log.lookup(id).unwrap(),
                Some(format!("record {id}").into_bytes())
            );
        }
        log.close().unwrap();
    }

    #[test]
    fn test_lookup_unknown_ids() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let log = Log::open(tmp.path().join("log")).unwrap();

        // Id 0 is reserved, and nothing has been appended yet.
        assert_eq!(log.lookup(0).unwrap(), None);
        assert_eq!(log.lookup(1).unwrap(), None);

        log.append(b"one").unwrap();
        assert_eq!(log.lookup(2).unwrap(), None);
        assert_eq!(log.lookup(u64::MAX).unwrap(), None);
        log.close().unwrap();
    }

    #[test]
    fn test_record_spanning_multiple_blocks() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let log = Log::open(tmp.path().join("log")).unwrap();

        // ~3 blocks worth of data forces FIRST/MIDDLE/LAST framing.
        let big = payload(7, 48 * 1024);
        let id = log.append(&big).unwrap();

        let fetched = log.lookup(id).unwrap().unwrap();
        assert_eq!(fetched.len(), big.len());
        assert!(fetched == big);
        log.close().unwrap();
    }

    #[test]
    fn test_interleaved_sizes() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let log = Log::open(tmp.path().join("log")).unwrap();

        let mut expected = Vec::new();
        for i in 0..50u64 {
            // Alternate small and block-straddling records.
            let len = if i % 2 == 0 { 64 } else { 20_000 };
            let data = payload(i, len);
            let id = log.append(&data).unwrap();
            expected.push((id, data));
        }

        for (id, data) in &expected {
            let fetched = log.lookup(*id).unwrap().unwrap();
            assert!(&fetched == data, "mismatch for id {id}");
        }
        log.close().unwrap();
    }

    #[test]
    fn test_closed_log_rejects_operations() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let log = Log::open(tmp.path().join("log")).unwrap();
        log.append(b"x").unwrap();
        log.close().unwrap();

        assert!(matches!(log.append(b"y"), Err(crate::log::LogError::Closed)));
        assert!(matches!(log.lookup(1), Err(crate::log::LogError::Closed)));
        assert!(matches!(log.remove(1), Err(crate::log::LogError::Closed)));
        assert!(matches!(log.close(), Err(crate::log::LogError::Closed)));
    }

    #[test]
    fn test_concurrent_readers_during_appends() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let log = std::sync::Arc::new(Log::open(tmp.path().join("log")).unwrap());

        // Seed some records, then race readers against a writer thread.
        for i in 0..20u64 {
            log.append(&payload(i, 512)).unwrap();
        }

        let writer = {
            let log = std::sync::Arc::clone(&log);
            std::thread::spawn(move || {
                for i in 20..120u64 {
                    log.append(&payload(i, 512)).unwrap();
                }
            })
        };

        let mut readers = Vec::new();
        for _ in 0..4 {
            let log = std::sync::Arc::clone(&log);
            readers.push(std::thread::spawn(move || {
                for round in 0..50 {
                    for id in 1..=20u64 {
                        let got = log.lookup(id).unwrap().unwrap();
                        assert!(got == payload(id - 1, 512), "round {round} id {id}");
                    }
                }
            }));
        }

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }

        for id in 1..=120u64 {
            assert!(log.lookup(id).unwrap().unwrap() == payload(id - 1, 512));
        }
        log.close().unwrap();
    }
}
