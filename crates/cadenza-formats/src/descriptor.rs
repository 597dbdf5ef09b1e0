//! Key material resolution
//!
//! Builds a [`TagDescriptor`] from the tag region by evaluating an ordered
//! list of extraction rules against two frame sources. Frames from the
//! structured reader take priority; frames from the lenient scan only fill
//! fields the structured reader left empty.

use std::ops::Range;

use crate::error::{FormatError, FormatResult};
use crate::frames::{TextFrame, read_text_frames};
use crate::scan::scan_text_frames;

/// Length of a normalized initialization vector
pub const IV_LEN: usize = 16;

/// Descriptor field targeted by an extraction rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    /// Track number, used as the transform's track id
    TrackNumber,
    /// Length of the encrypted segment
    SegmentSize,
    /// Initialization vector for the block cipher
    Iv,
    /// Textual prefix re-attached before the final base64 decode
    TechnologyMarker,
}

/// A field and the frame ids that may carry it, in priority order
#[derive(Debug, Clone, Copy)]
pub struct ExtractionRule {
    /// Target field
    pub field: Field,
    /// Frame ids, first non-empty wins
    pub frame_ids: &'static [&'static str],
}

/// Extraction rules, evaluated in order.
///
/// Three-character ids cover version 2.2 tags seen by the lenient scan.
pub const RULES: &[ExtractionRule] = &[
    ExtractionRule {
        field: Field::TrackNumber,
        frame_ids: &["TRCK", "TRK"],
    },
    ExtractionRule {
        field: Field::SegmentSize,
        frame_ids: &["TSIZ", "TSI"],
    },
    ExtractionRule {
        field: Field::Iv,
        frame_ids: &["TSRC", "TENC", "TKEY", "TRC", "TEN", "TKE"],
    },
    ExtractionRule {
        field: Field::TechnologyMarker,
        frame_ids: &["TSSE", "TSS"],
    },
];

/// Resolved control data for one protected asset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagDescriptor {
    /// Track number, 0 when absent or unparsable
    pub track_number: u32,
    /// Byte offset where the encrypted segment starts (end of the tag region)
    pub segment_offset: usize,
    /// Length of the encrypted segment
    pub segment_size: usize,
    /// Normalized 16-byte initialization vector
    pub iv: [u8; IV_LEN],
    /// Prefix for the transform output
    pub technology_marker: String,
}

impl TagDescriptor {
    /// Track id as passed to the transform stage
    pub fn track_id(&self) -> String {
        self.track_number.to_string()
    }

    /// Encrypted window clamped to the bytes actually present
    pub fn segment_range(&self, raw_len: usize) -> Range<usize> {
        let start = self.segment_offset.min(raw_len);
        let end = start.saturating_add(self.segment_size).min(raw_len);
        start..end
    }

    /// Bytes after the encrypted window, passed through untouched
    pub fn trailing_range(&self, raw_len: usize) -> Range<usize> {
        self.segment_range(raw_len).end..raw_len
    }
}

#[derive(Debug, Default)]
struct FieldValues {
    track_number: Option<String>,
    segment_size: Option<String>,
    iv: Option<String>,
    technology_marker: Option<String>,
}

impl FieldValues {
    fn extract(frames: &[TextFrame]) -> Self {
        let mut values = Self::default();
        for rule in RULES {
            let found = rule.frame_ids.iter().find_map(|id| {
                frames
                    .iter()
                    .find(|f| f.id == *id && !f.value.trim().is_empty())
                    .map(|f| f.value.clone())
            });
            *values.slot(rule.field) = found;
        }
        values
    }

    fn slot(&mut self, field: Field) -> &mut Option<String> {
        match field {
            Field::TrackNumber => &mut self.track_number,
            Field::SegmentSize => &mut self.segment_size,
            Field::Iv => &mut self.iv,
            Field::TechnologyMarker => &mut self.technology_marker,
        }
    }

    fn or(self, fallback: Self) -> Self {
        Self {
            track_number: self.track_number.or(fallback.track_number),
            segment_size: self
                .segment_size
                .filter(|v| parse_size(v).is_some())
                .or(fallback.segment_size),
            iv: self.iv.or(fallback.iv),
            technology_marker: self.technology_marker.or(fallback.technology_marker),
        }
    }
}

fn parse_size(value: &str) -> Option<usize> {
    value.trim().parse::<usize>().ok().filter(|&n| n > 0)
}

fn parse_track(value: &str) -> u32 {
    value
        .split('/')
        .next()
        .and_then(|n| n.trim().parse().ok())
        .unwrap_or(0)
}

/// Normalize an IV field value to exactly 16 bytes.
///
/// A value of at least 32 hex characters yields the first 16 decoded bytes.
/// Anything else is taken as raw text, zero-padded or truncated.
pub fn normalize_iv(value: &str) -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    let trimmed = value.trim();

    if trimmed.len() >= IV_LEN * 2
        && trimmed.bytes().all(|b| b.is_ascii_hexdigit())
        && hex::decode_to_slice(&trimmed[..IV_LEN * 2], &mut iv).is_ok()
    {
        return iv;
    }

    let bytes = value.as_bytes();
    let n = bytes.len().min(IV_LEN);
    iv[..n].copy_from_slice(&bytes[..n]);
    iv
}

/// Resolve the decryption descriptor for `raw`, whose tag region ends at
/// `header_size`.
///
/// Fails with [`FormatError::MissingKeyMaterial`] when no IV-bearing frame is
/// found by either path.
pub fn resolve_descriptor(raw: &[u8], header_size: usize) -> FormatResult<TagDescriptor> {
    let structured = if header_size == 0 {
        FieldValues::default()
    } else {
        match read_text_frames(raw) {
            Ok(frames) => FieldValues::extract(&frames),
            Err(e) => {
                tracing::debug!(error = %e, "structured tag read failed, using byte scan");
                FieldValues::default()
            }
        }
    };
    let manual = FieldValues::extract(&scan_text_frames(raw, header_size));
    let merged = structured.or(manual);

    let iv = merged
        .iv
        .as_deref()
        .map(normalize_iv)
        .ok_or(FormatError::MissingKeyMaterial)?;

    let segment_size = merged
        .segment_size
        .as_deref()
        .and_then(parse_size)
        .unwrap_or_else(|| raw.len().saturating_sub(header_size));

    let descriptor = TagDescriptor {
        track_number: merged.track_number.as_deref().map_or(0, parse_track),
        segment_offset: header_size,
        segment_size,
        iv,
        technology_marker: merged.technology_marker.unwrap_or_default(),
    };

    tracing::debug!(
        track = descriptor.track_number,
        segment_size = descriptor.segment_size,
        marker_len = descriptor.technology_marker.len(),
        "resolved tag descriptor"
    );

    Ok(descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{encode_synchsafe, header_size};
    use pretty_assertions::assert_eq;

    fn frame(id: &str, text: &str) -> Vec<u8> {
        let mut out = id.as_bytes().to_vec();
        out.extend_from_slice(&((text.len() + 1) as u32).to_be_bytes());
        out.extend_from_slice(&[0, 0, 0]);
        out.extend_from_slice(text.as_bytes());
        out
    }

    fn asset(frames: &[(&str, &str)], payload: &[u8]) -> Vec<u8> {
        let body: Vec<u8> = frames.iter().flat_map(|(id, v)| frame(id, v)).collect();
        let mut out = b"ID3\x03\x00\x00".to_vec();
        out.extend_from_slice(&encode_synchsafe(body.len() as u32 + 16));
        out.extend_from_slice(&body);
        out.extend_from_slice(&[0; 16]);
        out.extend_from_slice(payload);
        out
    }

    const HEX_IV: &str = "000102030405060708090a0b0c0d0e0f";

    #[test]
    fn test_resolves_all_fields() {
        let raw = asset(
            &[
                ("TSIZ", "32"),
                ("TSRC", HEX_IV),
                ("TRCK", "3/12"),
                ("TSSE", "SUQz"),
            ],
            &[0xAA; 40],
        );
        let hs = header_size(&raw);
        let d = resolve_descriptor(&raw, hs).unwrap();

        assert_eq!(d.track_number, 3);
        assert_eq!(d.track_id(), "3");
        assert_eq!(d.segment_offset, hs);
        assert_eq!(d.segment_size, 32);
        assert_eq!(d.iv, core::array::from_fn(|i| i as u8));
        assert_eq!(d.technology_marker, "SUQz");
        assert_eq!(d.segment_range(raw.len()), hs..hs + 32);
        assert_eq!(d.trailing_range(raw.len()), hs + 32..raw.len());
    }

    #[test]
    fn test_iv_alternate_names_in_priority_order() {
        let raw = asset(&[("TENC", "second"), ("TKEY", "third")], &[1; 16]);
        let d = resolve_descriptor(&raw, header_size(&raw)).unwrap();
        assert_eq!(&d.iv[..6], b"second");

        let raw = asset(&[("TKEY", "third")], &[1; 16]);
        let d = resolve_descriptor(&raw, header_size(&raw)).unwrap();
        assert_eq!(&d.iv[..5], b"third");
    }

    #[test]
    fn test_missing_iv_is_terminal() {
        let raw = asset(&[("TSIZ", "16"), ("TRCK", "1")], &[1; 16]);
        assert!(matches!(
            resolve_descriptor(&raw, header_size(&raw)),
            Err(FormatError::MissingKeyMaterial)
        ));
    }

    #[test]
    fn test_no_header_fails_with_missing_key_material() {
        let raw = vec![0x55; 64];
        assert!(matches!(
            resolve_descriptor(&raw, header_size(&raw)),
            Err(FormatError::MissingKeyMaterial)
        ));
    }

    #[test]
    fn test_zero_segment_size_defaults_to_remainder() {
        let raw = asset(&[("TSIZ", "0"), ("TSRC", HEX_IV)], &[7; 48]);
        let hs = header_size(&raw);
        let d = resolve_descriptor(&raw, hs).unwrap();
        assert_eq!(d.segment_size, 48);
        assert_eq!(d.segment_range(raw.len()), hs..raw.len());
        assert!(d.trailing_range(raw.len()).is_empty());
    }

    #[test]
    fn test_oversized_segment_is_clamped() {
        let raw = asset(&[("TSIZ", "100000"), ("TSRC", HEX_IV)], &[7; 48]);
        let hs = header_size(&raw);
        let d = resolve_descriptor(&raw, hs).unwrap();
        assert_eq!(d.segment_size, 100_000);
        assert_eq!(d.segment_range(raw.len()), hs..raw.len());
    }

    #[test]
    fn test_manual_scan_fills_gaps_when_structured_read_fails() {
        // A lowercase frame id makes the structured reader bail out
        let mut body = frame("TSRC", HEX_IV);
        body.extend_from_slice(b"junk");
        body.extend(frame("TSSE", "bWFy"));
        let mut raw = b"ID3\x03\x00\x00".to_vec();
        raw.extend_from_slice(&encode_synchsafe(body.len() as u32));
        raw.extend_from_slice(&body);
        raw.extend_from_slice(&[9; 16]);

        let d = resolve_descriptor(&raw, header_size(&raw)).unwrap();
        assert_eq!(d.iv[15], 0x0f);
        assert_eq!(d.technology_marker, "bWFy");
    }

    #[test]
    fn test_normalize_iv() {
        assert_eq!(normalize_iv(HEX_IV), core::array::from_fn(|i| i as u8));
        assert_eq!(
            normalize_iv(&format!("{HEX_IV}ffff")),
            core::array::from_fn(|i| i as u8)
        );
        assert_eq!(&normalize_iv("short")[..], b"short\0\0\0\0\0\0\0\0\0\0\0");
        assert_eq!(&normalize_iv("0123456789abcdefXYZ")[..], b"0123456789abcdef");
        // 32 characters but not hex
        let text = "g".repeat(32);
        assert_eq!(&normalize_iv(&text)[..], &text.as_bytes()[..16]);
    }

    #[test]
    fn test_parse_track() {
        assert_eq!(parse_track("7/20"), 7);
        assert_eq!(parse_track(" 12 "), 12);
        assert_eq!(parse_track("side A"), 0);
    }
}
