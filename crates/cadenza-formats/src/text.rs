//! Text frame payload decoding

/// Decode a text frame payload according to its leading encoding byte.
///
/// Trailing NUL padding is stripped. Unknown encodings fall back to UTF-8.
pub(crate) fn decode_text(payload: &[u8]) -> String {
    let Some((&encoding, body)) = payload.split_first() else {
        return String::new();
    };

    let decoded = match encoding {
        0 => body.iter().map(|&b| char::from(b)).collect(),
        1 => decode_utf16_bom(body),
        2 => decode_utf16(body, false),
        _ => String::from_utf8_lossy(body).into_owned(),
    };

    decoded.trim_end_matches('\0').to_string()
}

fn decode_utf16_bom(body: &[u8]) -> String {
    match body {
        [0xFE, 0xFF, rest @ ..] => decode_utf16(rest, false),
        [0xFF, 0xFE, rest @ ..] => decode_utf16(rest, true),
        _ => decode_utf16(body, true),
    }
}

fn decode_utf16(body: &[u8], little_endian: bool) -> String {
    let units = body.chunks_exact(2).map(|pair| {
        if little_endian {
            u16::from_le_bytes([pair[0], pair[1]])
        } else {
            u16::from_be_bytes([pair[0], pair[1]])
        }
    });
    char::decode_utf16(units)
        .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

/// Reverse unsynchronisation: every `FF 00` pair becomes `FF`.
pub(crate) fn remove_unsync(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut prev_ff = false;
    for &b in data {
        if prev_ff && b == 0x00 {
            prev_ff = false;
            continue;
        }
        out.push(b);
        prev_ff = b == 0xFF;
    }
    out
}
