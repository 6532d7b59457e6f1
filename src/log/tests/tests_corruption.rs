#[cfg(test)]
mod tests {
    use crate::log::block::{BLOCK_SIZE, ENTRY_HEADER_SIZE};
    use crate::log::tests::helpers::{init_tracing, payload};
    use crate::log::{Log, LogError};
    use std::fs::OpenOptions;
    use std::io::{Read, Seek, SeekFrom, Write};
    use tempfile::TempDir;

    /// Invert one byte of a file in place.
    fn flip_byte(path: &std::path::Path, offset: u64) {
        let mut f = OpenOptions::new().read(true).write(true).open(path).unwrap();
        let mut byte = [0u8; 1];
        f.seek(SeekFrom::Start(offset)).unwrap();
        f.read_exact(&mut byte).unwrap();
        f.seek(SeekFrom::Start(offset)).unwrap();
        f.write_all(&[!byte[0]]).unwrap();
        f.sync_all().unwrap();
    }

    #[test]
    fn test_flipped_body_byte_is_fatal() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let prefix = tmp.path().join("log");
        {
            let log = Log::open(&prefix).unwrap();
            log.append(&payload(1, 256)).unwrap();
            log.close().unwrap();
        }

        // Record 1 sits at the start of data block 0: one block of index,
        // then the 13-byte entry header, then the body.
        let body_offset = (BLOCK_SIZE + ENTRY_HEADER_SIZE + 17) as u64;
        flip_byte(&tmp.path().join("log.0"), body_offset);

        let log = Log::open(&prefix).unwrap();
        let err = log.lookup(1).unwrap_err();
        assert!(matches!(err, LogError::Corrupt(_)));
    }

    #[test]
    fn test_other_records_unaffected_by_one_bad_body() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let prefix = tmp.path().join("log");
        {
            let log = Log::open(&prefix).unwrap();
            // Three records; the second spans its own distinct byte range.
            log.append(&payload(1, 64)).unwrap();
            log.append(&payload(2, 64)).unwrap();
            log.append(&payload(3, 64)).unwrap();
            log.close().unwrap();
        }

        // A byte inside record 2's body.
        let record_span = (ENTRY_HEADER_SIZE + 64) as u64;
        let body_offset = BLOCK_SIZE as u64 + record_span + ENTRY_HEADER_SIZE as u64 + 3;
        flip_byte(&tmp.path().join("log.0"), body_offset);

        let log = Log::open(&prefix).unwrap();
        assert!(log.lookup(1).unwrap().unwrap() == payload(1, 64));
        assert!(matches!(log.lookup(2), Err(LogError::Corrupt(_))));
        assert!(log.lookup(3).unwrap().unwrap() == payload(3, 64));
    }
}
