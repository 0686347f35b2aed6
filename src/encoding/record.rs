//! ASCII key/value records.
//!
//! A record is a sequence of `key:value` fields joined by commas. Integer
//! values are lower-case hex without a prefix. A value containing a comma,
//! colon, quote or newline is written quoted with backslash escapes.
//!
//! The checksummed form appends a final `fletcher` field (computed over
//! everything before it) and a terminating `\n`; trailing bytes after the
//! newline are padding and ignored. Store header, chunk header and chunk
//! footer all use the checksummed form; chunk descriptors stored as meta
//! values use the plain form.

use hashbrown::HashMap;

use super::fletcher32;
use crate::error::{Result, StoreError};

/// Parsed record fields.
pub type FieldMap = HashMap<String, String>;

fn needs_quoting(value: &str) -> bool {
    value.is_empty() || value.bytes().any(|b| matches!(b, b',' | b':' | b'"' | b'\n' | b'\\'))
}

fn append_field(out: &mut String, key: &str, value: &str) {
    if !out.is_empty() {
        out.push(',');
    }
    out.push_str(key);
    out.push(':');
    if needs_quoting(value) {
        out.push('"');
        for c in value.chars() {
            if c == '"' || c == '\\' {
                out.push('\\');
            }
            out.push(c);
        }
        out.push('"');
    } else {
        out.push_str(value);
    }
}

/// Encodes fields as a plain (unchecksummed) record string.
pub fn encode_fields(fields: &[(&str, String)]) -> String {
    let mut out = String::with_capacity(fields.len() * 16);
    for (key, value) in fields {
        append_field(&mut out, key, value);
    }
    out
}

/// Encodes fields as a checksummed, newline-terminated record.
pub fn encode_record(fields: &[(&str, String)]) -> Vec<u8> {
    let body = encode_fields(fields);
    let sum = fletcher32(body.as_bytes());
    let mut out = body;
    append_field(&mut out, "fletcher", &format!("{sum:08x}"));
    out.push('\n');
    out.into_bytes()
}

/// Parses a plain record string.
pub fn parse_fields(s: &str) -> Result<FieldMap> {
    let mut map = FieldMap::new();
    let mut chars = s.char_indices().peekable();

    while let Some(&(start, _)) = chars.peek() {
        let mut key_end = None;
        for (i, c) in chars.by_ref() {
            if c == ':' {
                key_end = Some(i);
                break;
            }
        }
        let key_end =
            key_end.ok_or_else(|| StoreError::corrupt(format!("record field without ':': {s:?}")))?;
        let key = &s[start..key_end];

        let mut value = String::new();
        if let Some(&(_, '"')) = chars.peek() {
            chars.next();
            let mut closed = false;
            while let Some((_, c)) = chars.next() {
                match c {
                    '"' => {
                        closed = true;
                        break;
                    }
                    '\\' => match chars.next() {
                        Some((_, esc)) => value.push(esc),
                        None => break,
                    },
                    _ => value.push(c),
                }
            }
            if !closed {
                return Err(StoreError::corrupt(format!("unterminated quote in record: {s:?}")));
            }
            // consume the field separator, if any
            if let Some(&(_, ',')) = chars.peek() {
                chars.next();
            }
        } else {
            for (_, c) in chars.by_ref() {
                if c == ',' {
                    break;
                }
                value.push(c);
            }
        }
        map.insert(key.to_string(), value);
    }
    Ok(map)
}

/// Parses a checksummed record out of `bytes`, verifying the checksum.
///
/// Scans for the terminating newline; anything after it is padding.
pub fn parse_record(bytes: &[u8]) -> Result<FieldMap> {
    let nl = bytes
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| StoreError::corrupt("record has no terminator"))?;
    let line = std::str::from_utf8(&bytes[..nl])
        .map_err(|_| StoreError::corrupt("record is not valid ascii"))?;

    let marker = ",fletcher:";
    let pos = line
        .rfind(marker)
        .ok_or_else(|| StoreError::corrupt("record has no checksum"))?;
    let body = &line[..pos];
    let stored = &line[pos + marker.len()..];
    let stored = u32::from_str_radix(stored, 16)
        .map_err(|_| StoreError::corrupt(format!("invalid checksum field: {stored:?}")))?;

    let actual = fletcher32(body.as_bytes());
    if actual != stored {
        return Err(StoreError::corrupt(format!(
            "record checksum mismatch: stored {stored:08x}, computed {actual:08x}"
        )));
    }
    parse_fields(body)
}

/// Reads a required hex `u64` field.
pub fn read_hex_u64(map: &FieldMap, key: &str) -> Result<u64> {
    let value = map
        .get(key)
        .ok_or_else(|| StoreError::corrupt(format!("missing record field {key:?}")))?;
    super::parse_hex_u64(value)
}

/// Reads a required hex `u32` field.
pub fn read_hex_u32(map: &FieldMap, key: &str) -> Result<u32> {
    let value = map
        .get(key)
        .ok_or_else(|| StoreError::corrupt(format!("missing record field {key:?}")))?;
    super::parse_hex_u32(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_fields_roundtrip() {
        let fields = [
            ("chunk", format!("{:x}", 0x2au32)),
            ("block", format!("{:x}", 7u64)),
        ];
        let s = encode_fields(&fields);

        let map = parse_fields(&s).unwrap();

        assert_eq!(read_hex_u32(&map, "chunk").unwrap(), 0x2a);
        assert_eq!(read_hex_u64(&map, "block").unwrap(), 7);
    }

    #[test]
    fn values_with_separators_are_quoted() {
        let fields = [("name", "a,b:c\"d\\e".to_string())];
        let s = encode_fields(&fields);

        let map = parse_fields(&s).unwrap();

        assert_eq!(map["name"], "a,b:c\"d\\e");
    }

    #[test]
    fn checksummed_record_roundtrip_with_padding() {
        let fields = [("version", format!("{:x}", 99u64))];
        let mut bytes = encode_record(&fields);
        bytes.extend_from_slice(&[b' '; 32]);

        let map = parse_record(&bytes).unwrap();

        assert_eq!(read_hex_u64(&map, "version").unwrap(), 99);
    }

    #[test]
    fn corrupted_byte_fails_the_checksum() {
        let mut bytes = encode_record(&[("version", "63".to_string())]);
        bytes[2] ^= 0x40;

        let err = parse_record(&bytes).unwrap_err();

        assert_eq!(err.kind(), crate::error::ErrorKind::Corrupt);
    }

    #[test]
    fn missing_terminator_is_corrupt() {
        assert!(parse_record(b"version:63,fletcher:00000000").is_err());
    }

    #[test]
    fn missing_field_reports_the_key() {
        let map = parse_fields("a:1").unwrap();
        let err = read_hex_u64(&map, "b").unwrap_err();
        assert!(err.to_string().contains("\"b\""));
    }
}
