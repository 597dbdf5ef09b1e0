//! Tag header detection and sizing
//!
//! The header is ten bytes: the `ID3` magic, a major version, a revision, a
//! flags byte and a 28-bit synchsafe size covering everything after the
//! header itself.

use binrw::BinRead;

/// Tag magic at offset 0
pub const TAG_MAGIC: [u8; 3] = *b"ID3";

/// Length of the fixed header prefix
pub const TAG_PREFIX_LEN: usize = 10;

/// Upper bound on the metadata peek when no header size is declared
pub const MAX_METADATA_PEEK: usize = 8 * 1024;

/// Tag-level unsynchronisation flag
pub const FLAG_UNSYNC: u8 = 0x80;

/// Extended header present flag
pub const FLAG_EXTENDED: u8 = 0x40;

/// Parsed tag header
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead)]
#[br(big, magic = b"ID3")]
pub struct TagHeader {
    /// Major version (2, 3 or 4)
    pub version: u8,
    /// Revision, unused by the decoder
    pub revision: u8,
    /// Header flags
    pub flags: u8,
    /// Size of the tag body, excluding this header
    #[br(map = decode_synchsafe)]
    pub size: u32,
}

impl TagHeader {
    /// Total bytes occupied by the tag region, header included
    pub fn total_len(&self) -> usize {
        self.size as usize + TAG_PREFIX_LEN
    }

    /// Whether the tag body is unsynchronised
    pub fn is_unsynchronised(&self) -> bool {
        self.flags & FLAG_UNSYNC != 0
    }

    /// Whether an extended header follows
    pub fn has_extended_header(&self) -> bool {
        self.flags & FLAG_EXTENDED != 0
    }
}

/// Decode four 7-bit fields into a 28-bit big-endian integer.
///
/// The top bit of every byte is ignored.
pub fn decode_synchsafe(bytes: [u8; 4]) -> u32 {
    bytes
        .iter()
        .fold(0u32, |acc, &b| (acc << 7) | u32::from(b & 0x7F))
}

/// Encode the low 28 bits of `value` as a synchsafe integer.
pub fn encode_synchsafe(value: u32) -> [u8; 4] {
    [
        ((value >> 21) & 0x7F) as u8,
        ((value >> 14) & 0x7F) as u8,
        ((value >> 7) & 0x7F) as u8,
        (value & 0x7F) as u8,
    ]
}

/// Byte offset where the tag region ends.
///
/// Returns 0 when the asset does not start with the tag magic or is too short
/// to hold a header.
pub fn header_size(raw: &[u8]) -> usize {
    if raw.len() < TAG_PREFIX_LEN || raw[..3] != TAG_MAGIC {
        return 0;
    }
    let size = decode_synchsafe([raw[6], raw[7], raw[8], raw[9]]);
    size as usize + TAG_PREFIX_LEN
}

/// Number of leading bytes to fetch so the whole tag region is available.
///
/// `probe` should hold at least the first ten bytes of the asset. Without a
/// declared header the caller falls back to [`MAX_METADATA_PEEK`].
pub fn metadata_read_size(probe: &[u8]) -> usize {
    match header_size(probe) {
        0 => MAX_METADATA_PEEK,
        declared => declared,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use binrw::BinRead;
    use proptest::prelude::*;
    use std::io::Cursor;

    fn header(version: u8, flags: u8, size: u32) -> Vec<u8> {
        let mut out = b"ID3".to_vec();
        out.extend_from_slice(&[version, 0, flags]);
        out.extend_from_slice(&encode_synchsafe(size));
        out
    }

    #[test]
    fn test_header_size_includes_prefix() {
        let raw = header(3, 0, 257);
        assert_eq!(header_size(&raw), 267);
    }

    #[test]
    fn test_header_size_without_magic() {
        assert_eq!(header_size(b"RIFF\0\0\0\0WAVEfmt "), 0);
        assert_eq!(header_size(b"ID3"), 0);
        assert_eq!(header_size(&[]), 0);
    }

    #[test]
    fn test_synchsafe_ignores_high_bits() {
        assert_eq!(decode_synchsafe([0x00, 0x00, 0x02, 0x01]), 257);
        assert_eq!(decode_synchsafe([0x80, 0x80, 0x82, 0x81]), 257);
        assert_eq!(decode_synchsafe([0x7F, 0x7F, 0x7F, 0x7F]), 0x0FFF_FFFF);
    }

    #[test]
    fn test_metadata_read_size_defaults_to_peek() {
        assert_eq!(metadata_read_size(b"fLaC\0\0\0\0\0\0"), MAX_METADATA_PEEK);
        assert_eq!(metadata_read_size(&header(4, 0, 1000)), 1010);
    }

    #[test]
    fn test_binread_header() {
        let raw = header(4, FLAG_UNSYNC | FLAG_EXTENDED, 4096);
        let parsed = TagHeader::read(&mut Cursor::new(&raw)).unwrap();
        assert_eq!(parsed.version, 4);
        assert_eq!(parsed.size, 4096);
        assert_eq!(parsed.total_len(), 4106);
        assert!(parsed.is_unsynchronised());
        assert!(parsed.has_extended_header());
    }

    #[test]
    fn test_binread_rejects_bad_magic() {
        let raw = b"ID2\x03\x00\x00\x00\x00\x00\x10";
        assert!(TagHeader::read(&mut Cursor::new(raw)).is_err());
    }

    proptest! {
        #[test]
        fn synchsafe_encoding_is_reversible(value in 0u32..0x1000_0000) {
            let encoded = encode_synchsafe(value);
            prop_assert!(encoded.iter().all(|b| b & 0x80 == 0));
            prop_assert_eq!(decode_synchsafe(encoded), value);
        }
    }
}
