//! Hex text helpers used by payloads.

use crate::ProtocolError;

const DIGITS: &[u8; 16] = b"0123456789abcdef";

fn nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Lowercase hex, two digits per byte.
pub fn encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        for n in [b >> 4, b & 0xF] {
            if let Some(&d) = DIGITS.get(n as usize) {
                s.push(char::from(d));
            }
        }
    }
    s
}

/// Decode pairs of hex digits.
pub fn decode(text: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if text.len() % 2 != 0 {
        return Err(ProtocolError::InvalidHex("odd number of digits"));
    }
    text.chunks(2)
        .map(|pair| match pair {
            [hi, lo] => match (nibble(*hi), nibble(*lo)) {
                (Some(h), Some(l)) => Ok((h << 4) | l),
                _ => Err(ProtocolError::InvalidHex("not a hex digit")),
            },
            _ => Err(ProtocolError::InvalidHex("odd number of digits")),
        })
        .collect()
}

/// Parse a big-endian hex number such as an address or length.
pub fn parse_u64(text: &[u8]) -> Result<u64, ProtocolError> {
    if text.is_empty() {
        return Err(ProtocolError::InvalidHex("empty number"));
    }
    if text.len() > 16 {
        return Err(ProtocolError::InvalidHex("number too long"));
    }
    text.iter().try_fold(0u64, |acc, &c| {
        nibble(c)
            .map(|n| (acc << 4) | u64::from(n))
            .ok_or(ProtocolError::InvalidHex("not a hex digit"))
    })
}
