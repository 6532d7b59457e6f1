#[cfg(test)]
mod tests {
    use crate::log::tests::helpers::{init_tracing, payload};
    use crate::log::{Log, LogError};
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_close_open_is_identity() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let prefix = tmp.path().join("log");

        let mut expected = Vec::new();
        {
            let log = Log::open(&prefix).unwrap();
            for i in 0..32u64 {
                let data = payload(i, (i as usize + 1) * 100);
                let id = log.append(&data).unwrap();
                expected.push((id, data));
            }
            log.close().unwrap();
        }

        let log = Log::open(&prefix).unwrap();
        for (id, data) in &expected {
            assert!(log.lookup(*id).unwrap().unwrap() == *data);
        }
        // Ids keep ascending from where they left off.
        let next = log.append(b"resumed").unwrap();
        assert_eq!(next, expected.last().unwrap().0 + 1);
        log.close().unwrap();
    }

    #[test]
    fn test_state_file_byte_equal_across_idle_cycle() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let prefix = tmp.path().join("log");
        let state_path = tmp.path().join("log.state");

        {
            let log = Log::open(&prefix).unwrap();
            for i in 0..5u64 {
                log.append(&payload(i, 2048)).unwrap();
            }
            log.close().unwrap();
        }
        let first = fs::read(&state_path).unwrap();

        {
            let log = Log::open(&prefix).unwrap();
            log.close().unwrap();
        }
        let second = fs::read(&state_path).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_fresh_log_state_round_trips() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let prefix = tmp.path().join("log");

        {
            let log = Log::open(&prefix).unwrap();
            log.close().unwrap();
        }
        let first = fs::read(tmp.path().join("log.state")).unwrap();
        assert_eq!(
            String::from_utf8(first.clone()).unwrap(),
            "id 1\nremoved 0\nsegment 0 1\nblock 0\noffset 0\n"
        );

        {
            let log = Log::open(&prefix).unwrap();
            log.close().unwrap();
        }
        let second = fs::read(tmp.path().join("log.state")).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_state_file_bootstraps_empty() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let log = Log::open(tmp.path().join("log")).unwrap();
        assert_eq!(log.next_id(), 1);
        assert_eq!(log.lookup(1).unwrap(), None);
        log.close().unwrap();
    }

    #[test]
    fn test_corrupt_state_trailing_bytes() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let prefix = tmp.path().join("log");
        {
            let log = Log::open(&prefix).unwrap();
            log.append(b"x").unwrap();
            log.close().unwrap();
        }

        // A single trailing byte after the offset line is rejected.
        let state_path = tmp.path().join("log.state");
        let mut bytes = fs::read(&state_path).unwrap();
        bytes.push(b'\n');
        fs::write(&state_path, &bytes).unwrap();

        let err = Log::open(&prefix).unwrap_err();
        assert!(matches!(err, LogError::CorruptState(_)));
    }

    #[test]
    fn test_corrupt_state_malformed_lines() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let prefix = tmp.path().join("log");

        for bad in [
            "",                                             // empty
            "id x\n",                                       // non-numeric
            "id 5\n",                                       // truncated
            "removed 0\nid 5\nsegment 0 1\nblock 0\noffset 0\n", // wrong order
            "id 5\nremoved 0\nblock 0\noffset 0\n",         // no segment line
        ] {
            fs::write(tmp.path().join("log.state"), bad).unwrap();
            let err = Log::open(&prefix).unwrap_err();
            assert!(
                matches!(err, LogError::CorruptState(_)),
                "state {bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_checkpoint_then_crash_recovers_prefix() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let prefix = tmp.path().join("log");

        // Checkpoint mid-stream, then drop without closing (the Drop impl
        // closes cleanly, so simulate a crash by forgetting the handle).
        {
            let log = Log::open(&prefix).unwrap();
            for i in 0..10u64 {
                log.append(&payload(i, 512)).unwrap();
            }
            log.checkpoint().unwrap();
            for i in 10..20u64 {
                log.append(&payload(i, 512)).unwrap();
            }
            std::mem::forget(log);
        }

        // Reopen from the checkpointed state: the first 10 records are
        // readable; the unfenced suffix reports not-found, never garbage.
        let log = Log::open(&prefix).unwrap();
        for id in 1..=10u64 {
            assert!(log.lookup(id).unwrap().unwrap() == payload(id - 1, 512));
        }
        assert_eq!(log.lookup(15).unwrap(), None);
        log.close().unwrap();
    }
}
