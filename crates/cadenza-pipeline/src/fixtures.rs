//! Synthetic protected assets for tests.
//!
//! [`ProtectedAssetBuilder`] produces the same layout real assets use: a tag
//! region with size, IV, track and marker frames, the AES-256-CBC encrypted
//! base64 text, and an optional trailing region. Pair it with
//! [`identity_transform`], whose module returns its input unchanged.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockEncryptMut, KeyIvInit};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use cadenza_crypto::{BLOCK_SIZE, BytecodeTransform, FIXED_KEY, ModuleSource, TransformExports};
use cadenza_formats::{encode_synchsafe, normalize_iv};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;

/// Bump allocator plus a transform that returns the data buffer as is
pub const IDENTITY_WAT: &str = r#"
    (module
      (memory (export "memory") 1)
      (global $bump (mut i32) (i32.const 1024))
      (func (export "allocate") (param $len i32) (result i32)
        (local $ptr i32)
        (local.set $ptr (global.get $bump))
        (global.set $bump (i32.add (global.get $bump) (local.get $len)))
        (if (i32.gt_u (global.get $bump) (i32.mul (memory.size) (i32.const 65536)))
          (then
            (drop (memory.grow
              (i32.add
                (i32.div_u
                  (i32.sub (global.get $bump) (i32.mul (memory.size) (i32.const 65536)))
                  (i32.const 65536))
                (i32.const 1))))))
        (local.get $ptr))
      (func (export "transform")
        (param $slot i32) (param $data i32) (param $len i32) (param $track i32) (param $tlen i32)
        (i32.store (local.get $slot) (local.get $data))
        (i32.store offset=4 (local.get $slot) (local.get $len))))
"#;

/// Module whose transform reports a negative result length
pub const NEGATIVE_LENGTH_WAT: &str = r#"
    (module
      (memory (export "memory") 1)
      (func (export "allocate") (param i32) (result i32) (i32.const 256))
      (func (export "transform") (param i32 i32 i32 i32 i32)
        (i32.store (local.get 0) (local.get 1))
        (i32.store offset=4 (local.get 0) (i32.const -4))))
"#;

/// Transform stage compiled from WAT text with default export names
pub fn transform_from_wat(wat: &str) -> Arc<BytecodeTransform> {
    Arc::new(BytecodeTransform::new(
        ModuleSource::Bytes(wat.as_bytes().to_vec()),
        TransformExports::default(),
    ))
}

/// Identity transform stage
pub fn identity_transform() -> Arc<BytecodeTransform> {
    transform_from_wat(IDENTITY_WAT)
}

/// Builds protected assets around a known audio payload
#[derive(Debug, Clone)]
pub struct ProtectedAssetBuilder {
    audio: Vec<u8>,
    marker_len: usize,
    track: Option<String>,
    iv_frame: Option<(&'static str, String)>,
    declared_size: Option<String>,
    trailing: Vec<u8>,
    version: u8,
    padding: usize,
}

impl ProtectedAssetBuilder {
    /// Builder for `audio` with a hex IV in `TSRC` and a 4-character marker
    pub fn new(audio: &[u8]) -> Self {
        Self {
            audio: audio.to_vec(),
            marker_len: 4,
            track: None,
            iv_frame: Some(("TSRC", "00112233445566778899aabbccddeeff".to_string())),
            declared_size: None,
            trailing: Vec::new(),
            version: 3,
            padding: 64,
        }
    }

    /// Number of base64 characters moved into the marker frame
    pub fn marker_len(mut self, len: usize) -> Self {
        self.marker_len = len;
        self
    }

    /// Track number frame value
    pub fn track(mut self, track: &str) -> Self {
        self.track = Some(track.to_string());
        self
    }

    /// Frame id and value carrying the IV
    pub fn iv_frame(mut self, id: &'static str, value: &str) -> Self {
        self.iv_frame = Some((id, value.to_string()));
        self
    }

    /// Omit every IV-bearing frame
    pub fn without_iv(mut self) -> Self {
        self.iv_frame = None;
        self
    }

    /// Override the segment size frame value
    pub fn declared_size(mut self, size: &str) -> Self {
        self.declared_size = Some(size.to_string());
        self
    }

    /// Bytes appended after the encrypted segment
    pub fn trailing(mut self, trailing: &[u8]) -> Self {
        self.trailing = trailing.to_vec();
        self
    }

    /// Tag major version (3 or 4)
    pub fn version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    fn split_text(&self) -> (String, String) {
        let text = STANDARD.encode(&self.audio);
        let cut = self.marker_len.min(text.len());
        (text[..cut].to_string(), text[cut..].to_string())
    }

    fn iv(&self) -> [u8; 16] {
        self.iv_frame
            .as_ref()
            .map_or([0u8; 16], |(_, value)| normalize_iv(value))
    }

    fn ciphertext(&self) -> Vec<u8> {
        let (_, body) = self.split_text();
        let plain = body.as_bytes();
        let mut buf = plain.to_vec();
        buf.resize(plain.len() + BLOCK_SIZE, 0);
        let len = Aes256CbcEnc::new_from_slices(&FIXED_KEY, &self.iv())
            .expect("key and iv lengths are fixed")
            .encrypt_padded_mut::<Pkcs7>(&mut buf, plain.len())
            .expect("buffer has room for padding")
            .len();
        buf.truncate(len);
        buf
    }

    /// Length of the encrypted segment the builder will emit
    pub fn ciphertext_len(&self) -> usize {
        self.ciphertext().len()
    }

    fn frame(&self, id: &str, value: &str) -> Vec<u8> {
        let size = value.len() as u32 + 1;
        let mut out = id.as_bytes().to_vec();
        if self.version >= 4 {
            out.extend_from_slice(&encode_synchsafe(size));
        } else {
            out.extend_from_slice(&size.to_be_bytes());
        }
        out.extend_from_slice(&[0, 0, 3]);
        out.extend_from_slice(value.as_bytes());
        out
    }

    /// Assemble the asset
    pub fn build(&self) -> Vec<u8> {
        let (marker, _) = self.split_text();
        let ciphertext = self.ciphertext();

        let size = self
            .declared_size
            .clone()
            .unwrap_or_else(|| ciphertext.len().to_string());

        let mut body = self.frame("TSIZ", &size);
        if let Some((id, value)) = &self.iv_frame {
            body.extend(self.frame(id, value));
        }
        if let Some(track) = &self.track {
            body.extend(self.frame("TRCK", track));
        }
        if !marker.is_empty() {
            body.extend(self.frame("TSSE", &marker));
        }
        body.extend(std::iter::repeat_n(0u8, self.padding));

        let mut out = b"ID3".to_vec();
        out.extend_from_slice(&[self.version, 0, 0]);
        out.extend_from_slice(&encode_synchsafe(body.len() as u32));
        out.extend_from_slice(&body);
        out.extend_from_slice(&ciphertext);
        out.extend_from_slice(&self.trailing);
        out
    }
}
