//! UTF-8 codec helpers. The external collaborator named in spec §6;
//! implemented directly on `std::char`/`str` since no external crate is
//! needed for this.

use crate::error::LmError;

/// Splits `text` into its Unicode codepoints, as raw `u32` scalar values.
pub fn split_to_codepoints(text: &str) -> Vec<u32> {
    text.chars().map(u32::from).collect()
}

/// Encodes a single codepoint as a UTF-8 string.
pub fn encode_codepoint(codepoint: u32) -> Result<String, LmError> {
    char::from_u32(codepoint)
        .map(|c| c.to_string())
        .ok_or_else(|| LmError::invalid_argument(format!("not a valid codepoint: {codepoint}")))
}

/// Decodes the single leading codepoint from a UTF-8 byte sequence.
pub fn decode_single(bytes: &[u8]) -> Result<u32, LmError> {
    let s = std::str::from_utf8(bytes)
        .map_err(|e| LmError::invalid_argument(format!("invalid utf-8: {e}")))?;
    s.chars()
        .next()
        .map(u32::from)
        .ok_or_else(|| LmError::invalid_argument("empty byte sequence"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_handles_multibyte_codepoints() {
        let cps = split_to_codepoints("a\u{00e9}\u{4e2d}");
        assert_eq!(cps, vec!['a' as u32, '\u{00e9}' as u32, '\u{4e2d}' as u32]);
    }

    #[test]
    fn encode_decode_round_trip() {
        for cp in [b'a' as u32, 0x00e9, 0x4e2d] {
            let encoded = encode_codepoint(cp).unwrap();
            let decoded = decode_single(encoded.as_bytes()).unwrap();
            let re_encoded = encode_codepoint(decoded).unwrap();
            assert_eq!(re_encoded, encoded);
        }
    }

    #[test]
    fn encode_rejects_surrogate_range() {
        assert!(encode_codepoint(0xD800).is_err());
    }
}
