//! Pack/unpack of the `(stream_name, payload)` pair that lives inside every entry's `data`.
//!
//! Layout: `[1-byte len][stream_name][payload]`. Pure functions on byte slices, no I/O.

use crate::wal::codec::Codec;
use crate::wal::error::{Error, Result};

pub const MAX_STREAM_NAME_LEN: usize = 255;

/// Packs `primary[/suffix]` and the codec-encoded `event` into `out`.
pub fn pack<C: Codec, T: serde::Serialize>(
    primary: &str,
    suffix: Option<&str>,
    event: &T,
    codec: &C,
    out: &mut Vec<u8>,
) -> Result<()> {
    if primary.is_empty() {
        return Err(Error::FrameTooLarge);
    }
    let full_name = match suffix {
        Some(suffix) if !suffix.is_empty() => format!("{primary}/{suffix}"),
        _ => primary.to_string(),
    };
    if full_name.is_empty() || full_name.len() > MAX_STREAM_NAME_LEN {
        return Err(Error::FrameTooLarge);
    }
    let payload = codec.encode(event)?;
    out.push(full_name.len() as u8);
    out.extend_from_slice(full_name.as_bytes());
    out.extend_from_slice(&payload);
    Ok(())
}

/// Slices `data` into `(stream_name, payload)` without copying.
pub fn unpack(data: &[u8]) -> Result<(&[u8], &[u8])> {
    let len = *data.first().ok_or(Error::Corrupt("empty framed record"))? as usize;
    if data.len() < 1 + len {
        return Err(Error::Corrupt("framed record shorter than stream name length"));
    }
    Ok((&data[1..1 + len], &data[1 + len..]))
}

/// `empty filter or "*"` matches everything; otherwise `full_name` must start with `filter`.
pub fn match_stream(full_name: &[u8], filter: &str) -> bool {
    if filter.is_empty() || filter == "*" {
        return true;
    }
    full_name.starts_with(filter.as_bytes())
}

/// True if `full_name` matches any of `filters` (empty filter list matches nothing).
pub fn match_any(full_name: &[u8], filters: &[String]) -> bool {
    filters.iter().any(|f| match_stream(full_name, f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::codec::JsonCodec;

    #[test]
    fn pack_unpack_round_trip() {
        let codec = JsonCodec;
        let mut buf = Vec::new();
        pack("users", Some("42"), &"hello", &codec, &mut buf).unwrap();
        let (name, payload) = unpack(&buf).unwrap();
        assert_eq!(name, b"users/42");
        assert_eq!(payload, codec.encode(&"hello").unwrap().as_slice());
    }

    #[test]
    fn pack_without_suffix_uses_primary_only() {
        let codec = JsonCodec;
        let mut buf = Vec::new();
        pack("users", None, &1u32, &codec, &mut buf).unwrap();
        let (name, _) = unpack(&buf).unwrap();
        assert_eq!(name, b"users");
    }

    #[test]
    fn empty_primary_is_rejected() {
        let codec = JsonCodec;
        let mut buf = Vec::new();
        assert!(matches!(
            pack("", None, &1u32, &codec, &mut buf),
            Err(Error::FrameTooLarge)
        ));
    }

    #[test]
    fn oversized_name_is_rejected() {
        let codec = JsonCodec;
        let mut buf = Vec::new();
        let primary = "p".repeat(200);
        let suffix = "s".repeat(100);
        assert!(matches!(
            pack(&primary, Some(&suffix), &1u32, &codec, &mut buf),
            Err(Error::FrameTooLarge)
        ));
    }

    #[test]
    fn match_stream_prefix_semantics() {
        assert!(match_stream(b"users/42", "users"));
        assert!(match_stream(b"users", "users"));
        assert!(!match_stream(b"accounts", "users"));
        assert!(match_stream(b"anything", "*"));
        assert!(match_stream(b"anything", ""));
    }
}
