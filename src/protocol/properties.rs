//! Property block encoding and decoding.
//!
//! Properties travel as alternating NUL-terminated ISO-8859-1 key/value
//! strings. A fixed dictionary of well-known strings compresses a whole key
//! or value to a single byte followed by NUL.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{BlipError, Result};

/// Well-known property strings, abbreviated on the wire as indices 1..=14.
pub const DICTIONARY: [&str; 14] = [
    "Profile",
    "Error-Code",
    "Error-Domain",
    "Content-Type",
    "application/json",
    "application/octet-stream",
    "text/plain; charset=UTF-8",
    "text/xml",
    "Accept",
    "Cache-Control",
    "must-revalidate",
    "If-Match",
    "If-None-Match",
    "Location",
];

// First bytes below this bound, followed by NUL, are dictionary references.
const ABBREVIATION_BOUND: u8 = 0x1f;

fn abbreviation(s: &str) -> Option<u8> {
    DICTIONARY
        .iter()
        .position(|&entry| entry == s)
        .map(|i| (i + 1) as u8)
}

/// Check that a property key or value can be carried on the wire.
///
/// Strings must be free of NUL bytes and encodable in ISO-8859-1.
pub fn validate_property(s: &str) -> Result<()> {
    for c in s.chars() {
        if c == '\0' {
            return Err(BlipError::BadProperty("contains NUL"));
        }
        if c as u32 > 0xff {
            return Err(BlipError::BadProperty("not ISO-8859-1"));
        }
    }
    Ok(())
}

fn write_cstring(dst: &mut BytesMut, s: &str) {
    if let Some(index) = abbreviation(s) {
        dst.put_u8(index);
        dst.put_u8(0);
        return;
    }
    for c in s.chars() {
        dst.put_u8(c as u8);
    }
    dst.put_u8(0);
}

/// Encode a property set into a block of NUL-terminated pairs.
///
/// The block excludes the length varint; an empty set encodes to an empty
/// block. Keys and values are re-validated so a message assembled from raw
/// parts cannot smuggle un-encodable strings onto the wire.
pub fn encode_properties(properties: &HashMap<String, String>) -> Result<Bytes> {
    let mut block = BytesMut::new();
    for (key, value) in properties {
        validate_property(key)?;
        validate_property(value)?;
        write_cstring(&mut block, key);
        write_cstring(&mut block, value);
    }
    Ok(block.freeze())
}

/// Decode a property block into a map.
///
/// Fails with [`BlipError::BadProperties`] if the block does not end in NUL,
/// ends mid-pair, references an unknown dictionary index, or repeats a key.
pub fn decode_properties(block: &[u8]) -> Result<HashMap<String, String>> {
    let mut properties = HashMap::new();
    if block.is_empty() {
        return Ok(properties);
    }
    if block[block.len() - 1] != 0 {
        return Err(BlipError::BadProperties("missing trailing NUL"));
    }

    let mut pos = 0;
    while pos < block.len() {
        let key = read_cstring(block, &mut pos)?;
        if pos >= block.len() {
            return Err(BlipError::BadProperties("dangling key"));
        }
        let value = read_cstring(block, &mut pos)?;
        if properties.insert(key, value).is_some() {
            return Err(BlipError::BadProperties("duplicate key"));
        }
    }
    Ok(properties)
}

fn read_cstring(block: &[u8], pos: &mut usize) -> Result<String> {
    let start = *pos;
    let first = block[start];

    if (1..ABBREVIATION_BOUND).contains(&first) && block.get(start + 1) == Some(&0) {
        *pos = start + 2;
        return DICTIONARY
            .get(first as usize - 1)
            .map(|&s| s.to_owned())
            .ok_or(BlipError::BadProperties("unknown abbreviation"));
    }

    let nul = block[start..]
        .iter()
        .position(|&b| b == 0)
        .ok_or(BlipError::BadProperties("unterminated string"))?;
    *pos = start + nul + 1;
    Ok(block[start..start + nul].iter().map(|&b| b as char).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|&(k, v)| (k.to_owned(), v.to_owned()))
            .collect()
    }

    #[test]
    fn test_empty_set() {
        let block = encode_properties(&HashMap::new()).unwrap();
        assert!(block.is_empty());
        assert!(decode_properties(&block).unwrap().is_empty());
    }

    #[test]
    fn test_roundtrip_mixed() {
        let props = map(&[
            ("Profile", "echo"),
            ("Content-Type", "application/json"),
            ("X-Custom", "value"),
        ]);
        let block = encode_properties(&props).unwrap();
        assert_eq!(decode_properties(&block).unwrap(), props);
    }

    #[test]
    fn test_dictionary_strings_encode_to_two_bytes() {
        for (i, entry) in DICTIONARY.iter().enumerate() {
            let mut dst = BytesMut::new();
            write_cstring(&mut dst, entry);
            assert_eq!(&dst[..], &[(i + 1) as u8, 0]);
        }
    }

    #[test]
    fn test_non_dictionary_string_is_raw() {
        let mut dst = BytesMut::new();
        write_cstring(&mut dst, "echo");
        assert_eq!(&dst[..], b"echo\0");
    }

    #[test]
    fn test_latin1_roundtrip() {
        let props = map(&[("Name", "caf\u{e9}")]);
        let block = encode_properties(&props).unwrap();
        // é is a single 0xE9 byte on the wire
        assert!(block.contains(&0xe9));
        assert_eq!(decode_properties(&block).unwrap(), props);
    }

    #[test]
    fn test_validate_rejects_nul_and_wide_chars() {
        assert!(matches!(
            validate_property("a\0b"),
            Err(BlipError::BadProperty(_))
        ));
        assert!(matches!(
            validate_property("snowman \u{2603}"),
            Err(BlipError::BadProperty(_))
        ));
        assert!(validate_property("plain").is_ok());
    }

    #[test]
    fn test_missing_trailing_nul() {
        let block = b"Key\0Value";
        assert!(matches!(
            decode_properties(block),
            Err(BlipError::BadProperties("missing trailing NUL"))
        ));
    }

    #[test]
    fn test_dangling_key() {
        let block = b"OnlyKey\0";
        assert!(matches!(
            decode_properties(block),
            Err(BlipError::BadProperties("dangling key"))
        ));
    }

    #[test]
    fn test_duplicate_key() {
        let block = b"K\0a\0K\0b\0";
        assert!(matches!(
            decode_properties(block),
            Err(BlipError::BadProperties("duplicate key"))
        ));
    }

    #[test]
    fn test_unknown_abbreviation() {
        // index 0x0F is inside the abbreviation range but past the table
        let block = &[0x0f, 0x00, b'v', 0x00];
        assert!(matches!(
            decode_properties(block),
            Err(BlipError::BadProperties("unknown abbreviation"))
        ));
    }

    #[test]
    fn test_empty_strings_roundtrip() {
        let props = map(&[("", "")]);
        let block = encode_properties(&props).unwrap();
        assert_eq!(&block[..], &[0, 0]);
        assert_eq!(decode_properties(&block).unwrap(), props);
    }
}
