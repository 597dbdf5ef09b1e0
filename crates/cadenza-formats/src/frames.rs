//! Structured frame reader for tag versions 2.3 and 2.4
//!
//! This path is strict: it honours tag-level unsynchronisation, skips the
//! extended header, and rejects malformed frame ids or sizes. Only text frames
//! (ids starting with `T`) are returned. Compressed or encrypted frames are
//! skipped rather than decoded.

use std::borrow::Cow;
use std::io::{Cursor, Seek, SeekFrom};

use binrw::io::Read;
use binrw::{BinRead, BinResult, Endian};

use crate::error::{FormatError, FormatResult};
use crate::header::{TAG_PREFIX_LEN, TagHeader, decode_synchsafe};
use crate::text::{decode_text, remove_unsync};

const FRAME_HEADER_LEN: usize = 10;

/// A decoded text frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextFrame {
    /// Frame id, e.g. `TSIZ`
    pub id: String,
    /// Decoded text with trailing NULs removed
    pub value: String,
}

impl TextFrame {
    /// Create a frame from an id and value
    pub fn new(id: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            value: value.into(),
        }
    }
}

/// Frame header for versions 2.3 and 2.4
#[derive(Debug, Clone, Copy)]
struct FrameHeader {
    id: [u8; 4],
    size: u32,
    flags: u16,
}

impl BinRead for FrameHeader {
    type Args<'a> = (u8,);

    fn read_options<R: Read + Seek>(
        reader: &mut R,
        _endian: Endian,
        (version,): Self::Args<'_>,
    ) -> BinResult<Self> {
        let mut id = [0u8; 4];
        reader.read_exact(&mut id)?;

        let mut size_bytes = [0u8; 4];
        reader.read_exact(&mut size_bytes)?;
        let size = if version >= 4 {
            decode_synchsafe(size_bytes)
        } else {
            u32::from_be_bytes(size_bytes)
        };

        let flags = u16::read_options(reader, Endian::Big, ())?;

        Ok(Self { id, size, flags })
    }
}

impl FrameHeader {
    fn has_valid_id(&self) -> bool {
        self.id
            .iter()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
    }

    fn id_str(&self) -> String {
        String::from_utf8_lossy(&self.id).into_owned()
    }

    fn is_compressed_or_encrypted(&self, version: u8) -> bool {
        let mask = if version >= 4 { 0x000C } else { 0x00C0 };
        self.flags & mask != 0
    }

    fn has_group_byte(&self, version: u8) -> bool {
        let mask = if version >= 4 { 0x0040 } else { 0x0020 };
        self.flags & mask != 0
    }

    fn is_unsynchronised(&self, version: u8) -> bool {
        version >= 4 && self.flags & 0x0002 != 0
    }

    fn has_data_length(&self, version: u8) -> bool {
        version >= 4 && self.flags & 0x0001 != 0
    }
}

/// Read all text frames from the tag region at the start of `raw`.
pub fn read_text_frames(raw: &[u8]) -> FormatResult<Vec<TextFrame>> {
    let header = TagHeader::read(&mut Cursor::new(raw)).map_err(|_| FormatError::MissingHeader)?;
    if !matches!(header.version, 3 | 4) {
        return Err(FormatError::UnsupportedVersion(header.version));
    }

    let end = header.total_len().min(raw.len());
    let mut body: Cow<'_, [u8]> = Cow::Borrowed(&raw[TAG_PREFIX_LEN.min(end)..end]);
    if header.is_unsynchronised() {
        body = Cow::Owned(remove_unsync(&body));
    }

    let mut cursor = Cursor::new(body.as_ref());
    if header.has_extended_header() {
        skip_extended_header(&mut cursor, header.version)?;
    }

    let mut frames = Vec::new();
    loop {
        let pos = cursor.position() as usize;
        if pos + FRAME_HEADER_LEN > body.len() || body[pos] == 0 {
            break;
        }

        let frame = FrameHeader::read_options(&mut cursor, Endian::Big, (header.version,))?;
        if !frame.has_valid_id() {
            return Err(FormatError::InvalidFrameId {
                offset: pos + TAG_PREFIX_LEN,
                id: frame.id,
            });
        }

        let start = pos + FRAME_HEADER_LEN;
        let size = frame.size as usize;
        let available = body.len() - start;
        if size > available {
            return Err(FormatError::FrameOverrun {
                id: frame.id_str(),
                size,
                available,
            });
        }
        cursor.set_position((start + size) as u64);

        if frame.id[0] != b'T' || frame.is_compressed_or_encrypted(header.version) {
            continue;
        }

        let mut payload = &body[start..start + size];
        if frame.has_group_byte(header.version) {
            payload = payload.get(1..).unwrap_or_default();
        }
        if frame.has_data_length(header.version) {
            payload = payload.get(4..).unwrap_or_default();
        }
        let value = if frame.is_unsynchronised(header.version) {
            decode_text(&remove_unsync(payload))
        } else {
            decode_text(payload)
        };

        frames.push(TextFrame {
            id: frame.id_str(),
            value,
        });
    }

    Ok(frames)
}

fn skip_extended_header(cursor: &mut Cursor<&[u8]>, version: u8) -> FormatResult<()> {
    let mut size_bytes = [0u8; 4];
    cursor
        .read_exact(&mut size_bytes)
        .map_err(binrw::Error::from)?;

    // 2.3 excludes the size field itself, 2.4 counts the whole extended header
    let skip = if version >= 4 {
        i64::from(decode_synchsafe(size_bytes)) - 4
    } else {
        i64::from(u32::from_be_bytes(size_bytes))
    };
    cursor
        .seek(SeekFrom::Current(skip.max(0)))
        .map_err(binrw::Error::from)?;
    Ok(())
}
