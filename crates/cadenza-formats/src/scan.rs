//! Lenient byte walker over the tag frame region.
//!
//! Used as a fallback when the structured reader rejects a tag or leaves
//! fields empty. Frame layout is selected by the version byte at offset 3:
//! version 2 uses 3-byte ids and 3-byte sizes, version 3 uses 4-byte ids and
//! plain 4-byte sizes, version 4 uses synchsafe sizes. Unrecognised bytes are
//! skipped one at a time until something that looks like a frame id appears.

use crate::frames::TextFrame;
use crate::header::{TAG_PREFIX_LEN, decode_synchsafe};
use crate::text::decode_text;

#[derive(Debug, Clone, Copy)]
struct Layout {
    id_len: usize,
    header_len: usize,
    synchsafe: bool,
}

impl Layout {
    fn for_version(version: u8) -> Self {
        match version {
            2 => Self {
                id_len: 3,
                header_len: 6,
                synchsafe: false,
            },
            4 => Self {
                id_len: 4,
                header_len: 10,
                synchsafe: true,
            },
            _ => Self {
                id_len: 4,
                header_len: 10,
                synchsafe: false,
            },
        }
    }

    fn frame_size(self, bytes: &[u8]) -> usize {
        if self.id_len == 3 {
            return (usize::from(bytes[0]) << 16) | (usize::from(bytes[1]) << 8) | usize::from(bytes[2]);
        }
        let raw = [bytes[0], bytes[1], bytes[2], bytes[3]];
        if self.synchsafe {
            decode_synchsafe(raw) as usize
        } else {
            u32::from_be_bytes(raw) as usize
        }
    }
}

fn looks_like_id(id: &[u8]) -> bool {
    id.first().is_some_and(u8::is_ascii_uppercase)
        && id
            .iter()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
}

/// Walk `raw[10..header_size]` and collect every text frame found.
///
/// Payloads that overrun the region are truncated at its end.
pub fn scan_text_frames(raw: &[u8], header_size: usize) -> Vec<TextFrame> {
    let mut frames = Vec::new();
    if raw.len() < TAG_PREFIX_LEN {
        return frames;
    }

    let layout = Layout::for_version(raw[3]);
    let end = header_size.min(raw.len());
    let mut pos = TAG_PREFIX_LEN;

    while pos + layout.header_len <= end {
        let id = &raw[pos..pos + layout.id_len];
        if id[0] == 0 {
            break;
        }
        if !looks_like_id(id) {
            pos += 1;
            continue;
        }

        let size = layout.frame_size(&raw[pos + layout.id_len..]);
        let start = pos + layout.header_len;
        let stop = start.saturating_add(size).min(end);

        if id[0] == b'T' && stop > start {
            frames.push(TextFrame {
                id: String::from_utf8_lossy(id).into_owned(),
                value: decode_text(&raw[start..stop]),
            });
        }

        pos = stop.max(pos + 1);
    }

    frames
}
