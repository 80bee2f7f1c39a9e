//! Just enough DER to build time-stamp requests and read time-stamp
//! responses. Definite lengths only.

use chrono::{DateTime, NaiveDateTime, Utc};
use thiserror::Error;

use crate::error::Error;

pub const TAG_BOOLEAN: u8 = 0x01;
pub const TAG_INTEGER: u8 = 0x02;
pub const TAG_BIT_STRING: u8 = 0x03;
pub const TAG_OCTET_STRING: u8 = 0x04;
pub const TAG_NULL: u8 = 0x05;
pub const TAG_OID: u8 = 0x06;
pub const TAG_UTF8_STRING: u8 = 0x0C;
pub const TAG_GENERALIZED_TIME: u8 = 0x18;
pub const TAG_SEQUENCE: u8 = 0x30;
pub const TAG_SET: u8 = 0x31;

/// Tag of a constructed context-specific field `[n]`.
pub const fn context(n: u8) -> u8 {
    0xA0 | n
}

/// Malformed DER input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DerError {
    /// Input ended inside a header or value
    #[error("truncated DER at offset {0}")]
    Truncated(usize),
    /// A different tag was expected
    #[error("expected tag 0x{expected:02x}, found 0x{found:02x}")]
    UnexpectedTag {
        /// Tag the grammar requires
        expected: u8,
        /// Tag present in the input
        found: u8,
    },
    /// Indefinite or oversized length
    #[error("unsupported length encoding")]
    BadLength,
    /// Value does not fit its type
    #[error("invalid {0} value")]
    BadValue(&'static str),
    /// Bytes left over after the outermost value
    #[error("{0} trailing bytes")]
    Trailing(usize),
}

impl From<DerError> for Error {
    fn from(e: DerError) -> Self {
        Error::Serialization(format!("der: {e}"))
    }
}

fn push_length(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
        return;
    }
    let bytes = len.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    out.push(0x80 | (bytes.len() - skip) as u8);
    out.extend_from_slice(&bytes[skip..]);
}

/// Encodes one TLV.
pub fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 6);
    out.push(tag);
    push_length(&mut out, content.len());
    out.extend_from_slice(content);
    out
}

/// `SEQUENCE` of already-encoded parts.
pub fn sequence(parts: &[&[u8]]) -> Vec<u8> {
    tlv(TAG_SEQUENCE, &parts.concat())
}

/// Non-negative `INTEGER`.
pub fn unsigned(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count().min(7);
    let mut content = Vec::with_capacity(9);
    if bytes[skip] & 0x80 != 0 {
        content.push(0);
    }
    content.extend_from_slice(&bytes[skip..]);
    tlv(TAG_INTEGER, &content)
}

/// `OCTET STRING`.
pub fn octet_string(content: &[u8]) -> Vec<u8> {
    tlv(TAG_OCTET_STRING, content)
}

/// `BOOLEAN`.
pub fn boolean(value: bool) -> Vec<u8> {
    tlv(TAG_BOOLEAN, &[if value { 0xFF } else { 0x00 }])
}

/// `NULL`.
pub fn null() -> Vec<u8> {
    tlv(TAG_NULL, &[])
}

/// `GeneralizedTime` with second precision.
pub fn generalized_time(time: &DateTime<Utc>) -> Vec<u8> {
    tlv(
        TAG_GENERALIZED_TIME,
        time.format("%Y%m%d%H%M%SZ").to_string().as_bytes(),
    )
}

/// `OBJECT IDENTIFIER` from dotted notation.
///
/// # Errors
///
/// Returns `DerError::BadValue` if `dotted` is not a valid OID.
pub fn oid(dotted: &str) -> Result<Vec<u8>, DerError> {
    let arcs = dotted
        .split('.')
        .map(|arc| arc.parse::<u64>().map_err(|_| DerError::BadValue("oid")))
        .collect::<Result<Vec<_>, _>>()?;
    let [first, second, rest @ ..] = arcs.as_slice() else {
        return Err(DerError::BadValue("oid"));
    };
    if *first > 2 || (*first < 2 && *second >= 40) {
        return Err(DerError::BadValue("oid"));
    }

    let mut content = Vec::new();
    for arc in std::iter::once(first * 40 + second).chain(rest.iter().copied()) {
        let mut chunk = vec![(arc & 0x7F) as u8];
        let mut value = arc >> 7;
        while value > 0 {
            chunk.push(0x80 | (value & 0x7F) as u8);
            value >>= 7;
        }
        chunk.reverse();
        content.extend(chunk);
    }
    Ok(tlv(TAG_OID, &content))
}

/// One decoded TLV.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tlv<'a> {
    /// Identifier octet
    pub tag: u8,
    /// Value bytes
    pub content: &'a [u8],
    /// The whole encoding, header included
    pub raw: &'a [u8],
}

/// Sequential reader over concatenated TLVs.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Reads from the start of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Returns true when every byte was consumed.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Tag of the next TLV without consuming it.
    pub fn peek_tag(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    /// Consumes the next TLV.
    ///
    /// # Errors
    ///
    /// Returns `DerError` if the input is truncated or uses an unsupported length.
    pub fn next(&mut self) -> Result<Tlv<'a>, DerError> {
        let start = self.pos;
        let tag = *self.data.get(start).ok_or(DerError::Truncated(start))?;
        if tag & 0x1F == 0x1F {
            // multi-byte tags never occur in the structures read here
            return Err(DerError::BadValue("tag"));
        }
        let first = *self.data.get(start + 1).ok_or(DerError::Truncated(start + 1))?;
        let (len, header) = if first < 0x80 {
            (usize::from(first), 2)
        } else {
            let count = usize::from(first & 0x7F);
            if count == 0 || count > 4 {
                return Err(DerError::BadLength);
            }
            let bytes = self
                .data
                .get(start + 2..start + 2 + count)
                .ok_or(DerError::Truncated(start + 2))?;
            let len = bytes.iter().fold(0usize, |acc, b| (acc << 8) | usize::from(*b));
            (len, 2 + count)
        };
        let end = start
            .checked_add(header)
            .and_then(|h| h.checked_add(len))
            .ok_or(DerError::BadLength)?;
        if end > self.data.len() {
            return Err(DerError::Truncated(self.data.len()));
        }
        self.pos = end;
        Ok(Tlv {
            tag,
            content: &self.data[start + header..end],
            raw: &self.data[start..end],
        })
    }

    /// Consumes the next TLV, which must carry `tag`.
    ///
    /// # Errors
    ///
    /// Returns `DerError::UnexpectedTag` on a mismatch.
    pub fn expect(&mut self, tag: u8) -> Result<Tlv<'a>, DerError> {
        let tlv = self.next()?;
        if tlv.tag != tag {
            return Err(DerError::UnexpectedTag {
                expected: tag,
                found: tlv.tag,
            });
        }
        Ok(tlv)
    }

    /// Consumes the next TLV only if it carries `tag`.
    ///
    /// # Errors
    ///
    /// Returns `DerError` if the TLV is malformed.
    pub fn optional(&mut self, tag: u8) -> Result<Option<Tlv<'a>>, DerError> {
        if self.peek_tag() == Some(tag) {
            self.next().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Enters a constructed value of `tag`.
    ///
    /// # Errors
    ///
    /// Returns `DerError::UnexpectedTag` on a mismatch.
    pub fn enter(&mut self, tag: u8) -> Result<Reader<'a>, DerError> {
        Ok(Reader::new(self.expect(tag)?.content))
    }

    /// Fails if anything is left.
    ///
    /// # Errors
    ///
    /// Returns `DerError::Trailing` when bytes remain.
    pub fn finish(&self) -> Result<(), DerError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(DerError::Trailing(self.data.len() - self.pos))
        }
    }
}

/// Decodes a signed `INTEGER` that fits in an `i64`.
///
/// # Errors
///
/// Returns `DerError::BadValue` if the encoding is empty or too wide.
pub fn read_i64(content: &[u8]) -> Result<i64, DerError> {
    if content.is_empty() || content.len() > 8 {
        return Err(DerError::BadValue("integer"));
    }
    let negative = content[0] & 0x80 != 0;
    let mut value: i64 = if negative { -1 } else { 0 };
    for byte in content {
        value = (value << 8) | i64::from(*byte);
    }
    Ok(value)
}

/// Decodes a non-negative `INTEGER` that fits in a `u64`.
///
/// # Errors
///
/// Returns `DerError::BadValue` for negative or oversized values.
pub fn read_u64(content: &[u8]) -> Result<u64, DerError> {
    match content {
        [] => Err(DerError::BadValue("integer")),
        [first, ..] if first & 0x80 != 0 => Err(DerError::BadValue("integer")),
        _ => {
            let trimmed: &[u8] = match content {
                [0, rest @ ..] if !rest.is_empty() => rest,
                _ => content,
            };
            if trimmed.len() > 8 {
                return Err(DerError::BadValue("integer"));
            }
            Ok(trimmed.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
        }
    }
}

/// Decodes an `OBJECT IDENTIFIER` to dotted notation.
///
/// # Errors
///
/// Returns `DerError::BadValue` for a truncated arc.
pub fn read_oid(content: &[u8]) -> Result<String, DerError> {
    let mut arcs = Vec::new();
    let mut value: u64 = 0;
    for (i, byte) in content.iter().enumerate() {
        value = value
            .checked_shl(7)
            .ok_or(DerError::BadValue("oid"))?
            | u64::from(byte & 0x7F);
        if byte & 0x80 == 0 {
            if arcs.is_empty() {
                let first = (value / 40).min(2);
                arcs.push(first);
                arcs.push(value - first * 40);
            } else {
                arcs.push(value);
            }
            value = 0;
        } else if i == content.len() - 1 {
            return Err(DerError::BadValue("oid"));
        }
    }
    if arcs.is_empty() {
        return Err(DerError::BadValue("oid"));
    }
    Ok(arcs
        .iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join("."))
}

/// Decodes a `GeneralizedTime` in UTC (`YYYYMMDDHHMMSS[.f*]Z`).
///
/// # Errors
///
/// Returns `DerError::BadValue` for other forms.
pub fn read_generalized_time(content: &[u8]) -> Result<DateTime<Utc>, DerError> {
    let text = std::str::from_utf8(content).map_err(|_| DerError::BadValue("time"))?;
    let text = text.strip_suffix('Z').ok_or(DerError::BadValue("time"))?;
    let format = if text.contains('.') {
        "%Y%m%d%H%M%S%.f"
    } else {
        "%Y%m%d%H%M%S"
    };
    NaiveDateTime::parse_from_str(text, format)
        .map(|naive| naive.and_utc())
        .map_err(|_| DerError::BadValue("time"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn lengths_use_short_and_long_form() {
        assert_eq!(tlv(TAG_OCTET_STRING, &[1, 2])[..2], [0x04, 0x02]);
        let long = tlv(TAG_OCTET_STRING, &[0u8; 200]);
        assert_eq!(long[..3], [0x04, 0x81, 200]);
        let longer = tlv(TAG_OCTET_STRING, &[0u8; 300]);
        assert_eq!(longer[..4], [0x04, 0x82, 0x01, 0x2C]);
        assert_eq!(Reader::new(&longer).next().unwrap().content.len(), 300);
    }

    #[test]
    fn sha256_oid_matches_known_encoding() {
        let encoded = oid("2.16.840.1.101.3.4.2.1").unwrap();
        assert_eq!(
            encoded,
            [0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01]
        );
        assert_eq!(read_oid(&encoded[2..]).unwrap(), "2.16.840.1.101.3.4.2.1");
        assert!(oid("1").is_err());
        assert!(oid("1.x").is_err());
    }

    #[test]
    fn integers_are_minimal_and_positive() {
        assert_eq!(unsigned(0), [0x02, 0x01, 0x00]);
        assert_eq!(unsigned(127), [0x02, 0x01, 0x7F]);
        assert_eq!(unsigned(128), [0x02, 0x02, 0x00, 0x80]);
        assert_eq!(read_u64(&unsigned(u64::MAX)[2..]).unwrap(), u64::MAX);
        assert_eq!(read_i64(&[0xFF]).unwrap(), -1);
        assert_eq!(read_i64(&[0x02]).unwrap(), 2);
        assert!(read_u64(&[0x80]).is_err());
    }

    #[test]
    fn reader_walks_nested_structures() {
        let inner = sequence(&[&unsigned(5), &boolean(true)]);
        let outer = sequence(&[&inner, &null()]);
        let mut top = Reader::new(&outer);
        let mut seq = top.enter(TAG_SEQUENCE).unwrap();
        top.finish().unwrap();
        let mut first = seq.enter(TAG_SEQUENCE).unwrap();
        assert_eq!(read_u64(first.expect(TAG_INTEGER).unwrap().content).unwrap(), 5);
        assert!(first.optional(TAG_INTEGER).unwrap().is_none());
        assert_eq!(first.expect(TAG_BOOLEAN).unwrap().content, [0xFF]);
        assert!(matches!(
            seq.expect(TAG_INTEGER),
            Err(DerError::UnexpectedTag { expected: TAG_INTEGER, found: TAG_NULL })
        ));
    }

    #[test]
    fn truncation_is_reported() {
        let encoded = octet_string(&[1, 2, 3]);
        assert!(matches!(
            Reader::new(&encoded[..3]).next(),
            Err(DerError::Truncated(_))
        ));
        assert_eq!(Reader::new(&[0x04, 0x80]).next(), Err(DerError::BadLength));
    }

    #[test]
    fn generalized_time_round_trips() {
        let at = Utc.with_ymd_and_hms(2025, 7, 4, 12, 30, 5).unwrap();
        let encoded = generalized_time(&at);
        assert_eq!(read_generalized_time(&encoded[2..]).unwrap(), at);
        let fractional = read_generalized_time(b"20250704123005.25Z").unwrap();
        assert_eq!(fractional.timestamp_subsec_millis(), 250);
        assert!(read_generalized_time(b"20250704123005").is_err());
    }
}
