//! Content type detection from leading bytes

/// Number of leading bytes inspected
pub const SNIFF_LEN: usize = 32;

/// Classify audio by magic bytes, defaulting to MP3.
pub fn sniff_mime(head: &[u8]) -> &'static str {
    if head.get(4..8) == Some(&b"ftyp"[..]) {
        "audio/mp4"
    } else if head.starts_with(b"fLaC") {
        "audio/flac"
    } else if head.starts_with(b"RIFF") && head.get(8..12) == Some(&b"WAVE"[..]) {
        "audio/wav"
    } else {
        "audio/mpeg"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniff() {
        assert_eq!(sniff_mime(b"\0\0\0\x20ftypM4A \0\0\0\0"), "audio/mp4");
        assert_eq!(sniff_mime(b"fLaC\0\0\0\x22"), "audio/flac");
        assert_eq!(sniff_mime(b"RIFF\x24\x08\0\0WAVEfmt "), "audio/wav");
        assert_eq!(sniff_mime(b"ID3\x04\0\0\0\0\0\0"), "audio/mpeg");
        assert_eq!(sniff_mime(b"\xFF\xFB\x90\x64"), "audio/mpeg");
        assert_eq!(sniff_mime(b""), "audio/mpeg");
        assert_eq!(sniff_mime(b"RIFF\0\0\0\0AVI "), "audio/mpeg");
    }
}
