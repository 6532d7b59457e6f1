//! Wire format of one stored record.
//!
//! ```text
//! [version u64][key u32-len + bytes][arity u16][value₀ u32-len + bytes]…
//! ```
//!
//! The log treats these bytes as opaque; this is the only place that
//! knows the layout.

use crate::encoding::{self, Decode, Encode, EncodingError};

use super::Record;

impl Encode for Record {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.version.encode_to(buf)?;
        self.key.encode_to(buf)?;
        let arity = u16::try_from(self.value.len()).map_err(|_| {
            EncodingError::LengthOverflow(format!("value arity {} exceeds u16", self.value.len()))
        })?;
        arity.encode_to(buf)?;
        for v in &self.value {
            v.encode_to(buf)?;
        }
        Ok(())
    }
}

impl Decode for Record {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (version, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (key, n) = Vec::<u8>::decode_from(&buf[offset..])?;
        offset += n;
        let (arity, n) = u16::decode_from(&buf[offset..])?;
        offset += n;
        let mut value = Vec::with_capacity(arity as usize);
        for _ in 0..arity {
            let (v, n) = Vec::<u8>::decode_from(&buf[offset..])?;
            offset += n;
            value.push(v);
        }
        Ok((
            Self {
                key,
                value,
                version,
            },
            offset,
        ))
    }
}

/// Encode a record into a fresh buffer.
pub(crate) fn encode_record(record: &Record) -> Result<Vec<u8>, EncodingError> {
    encoding::encode_to_vec(record)
}

/// Decode a record, requiring the whole buffer to be consumed.
pub(crate) fn decode_record(bytes: &[u8]) -> Result<Record, EncodingError> {
    let (record, consumed) = Record::decode_from(bytes)?;
    if consumed != bytes.len() {
        return Err(EncodingError::Custom(format!(
            "record has {} trailing bytes",
            bytes.len() - consumed
        )));
    }
    Ok(record)
}
