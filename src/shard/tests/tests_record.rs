#[cfg(test)]
mod tests {
    use crate::shard::encoding_impls::{decode_record, encode_record};
    use crate::shard::Record;

    #[test]
    fn test_record_round_trip() {
        let record = Record {
            key: b"the key".to_vec(),
            value: vec![b"first".to_vec(), Vec::new(), b"third".to_vec()],
            version: 0xDEAD_BEEF_CAFE,
        };
        let bytes = encode_record(&record).unwrap();
        let decoded = decode_record(&bytes).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_record_layout_is_stable() {
        // version | key len + bytes | arity | value len + bytes.
        let record = Record {
            key: b"k".to_vec(),
            value: vec![b"v".to_vec()],
            version: 7,
        };
        let bytes = encode_record(&record).unwrap();
        assert_eq!(bytes.len(), 8 + (4 + 1) + 2 + (4 + 1));
        assert_eq!(&bytes[0..8], &7u64.to_be_bytes());
        assert_eq!(bytes[12], b'k');
        assert_eq!(&bytes[13..15], &1u16.to_be_bytes());
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let record = Record {
            key: b"k".to_vec(),
            value: vec![b"v".to_vec()],
            version: 1,
        };
        let mut bytes = encode_record(&record).unwrap();
        bytes.push(0);
        assert!(decode_record(&bytes).is_err());
    }

    #[test]
    fn test_decode_rejects_truncation() {
        let record = Record {
            key: b"some key".to_vec(),
            value: vec![b"some value".to_vec()],
            version: 1,
        };
        let bytes = encode_record(&record).unwrap();
        assert!(decode_record(&bytes[..bytes.len() - 3]).is_err());
    }
}
