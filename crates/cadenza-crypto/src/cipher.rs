//! AES-256-CBC stage with a padding fallback

use aes::cipher::block_padding::{NoPadding, Pkcs7};
use aes::cipher::{BlockDecryptMut, KeyIvInit};

use crate::error::{CryptoError, CryptoResult};

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Cipher block size in bytes
pub const BLOCK_SIZE: usize = 16;

/// Process-wide decryption key
pub const FIXED_KEY: [u8; 32] = *b"ximalayaximalayaximalayaximalaya";

/// Block cipher stage.
///
/// Decryption is attempted with PKCS#7 padding first. Segments whose
/// declared size undercounts the padded length fail that attempt; they are
/// retried with padding disabled on the largest block-aligned prefix.
#[derive(Debug, Clone)]
pub struct BlockCipherStage {
    key: [u8; 32],
}

impl Default for BlockCipherStage {
    fn default() -> Self {
        Self { key: FIXED_KEY }
    }
}

impl BlockCipherStage {
    /// Stage using [`FIXED_KEY`]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage using a caller-supplied 32-byte key
    pub fn with_key(key: &[u8]) -> CryptoResult<Self> {
        let key: [u8; 32] = key.try_into().map_err(|_| CryptoError::InvalidKeySize {
            expected: 32,
            actual: key.len(),
        })?;
        Ok(Self { key })
    }

    /// Decrypt `segment` with the given IV.
    pub fn decrypt(&self, segment: &[u8], iv: &[u8; BLOCK_SIZE]) -> CryptoResult<Vec<u8>> {
        let failure = || CryptoError::CipherFailure {
            segment_len: segment.len(),
        };

        let mut buf = segment.to_vec();
        let padded = Aes256CbcDec::new_from_slices(&self.key, iv)
            .map_err(|_| failure())?
            .decrypt_padded_mut::<Pkcs7>(&mut buf)
            .map(<[u8]>::len);
        if let Ok(len) = padded {
            buf.truncate(len);
            return Ok(buf);
        }

        let aligned = segment.len() - segment.len() % BLOCK_SIZE;
        tracing::debug!(
            segment_len = segment.len(),
            aligned,
            "padded decrypt failed, retrying without padding"
        );
        if aligned == 0 {
            return Err(failure());
        }

        let mut buf = segment[..aligned].to_vec();
        Aes256CbcDec::new_from_slices(&self.key, iv)
            .map_err(|_| failure())?
            .decrypt_padded_mut::<NoPadding>(&mut buf)
            .map_err(|_| failure())?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::BlockEncryptMut;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;

    const IV: [u8; 16] = *b"0123456789abcdef";

    fn encrypt(plain: &[u8]) -> Vec<u8> {
        let mut buf = plain.to_vec();
        buf.resize(plain.len() + BLOCK_SIZE, 0);
        let len = Aes256CbcEnc::new_from_slices(&FIXED_KEY, &IV)
            .unwrap()
            .encrypt_padded_mut::<Pkcs7>(&mut buf, plain.len())
            .unwrap()
            .len();
        buf.truncate(len);
        buf
    }

    #[test]
    fn test_padded_decrypt() {
        let plain = b"SGVsbG8sIHdvcmxkIQ==";
        let out = BlockCipherStage::new().decrypt(&encrypt(plain), &IV).unwrap();
        assert_eq!(out, plain);
    }

    #[test]
    fn test_unaligned_segment_falls_back() {
        let plain = [b'A'; 40];
        let mut cipher = encrypt(&plain);
        assert_eq!(cipher.len(), 48);
        cipher.truncate(37);

        let out = BlockCipherStage::new().decrypt(&cipher, &IV).unwrap();
        assert_eq!(out.len(), 32);
        assert_eq!(out, &plain[..32]);
    }

    #[test]
    fn test_bad_padding_keeps_raw_blocks() {
        // Aligned but missing the padding block: last byte is not valid PKCS#7
        let plain = [b'z'; 32];
        let cipher = encrypt(&plain);
        let out = BlockCipherStage::new()
            .decrypt(&cipher[..32], &IV)
            .unwrap();
        assert_eq!(out, plain);
    }

    #[test]
    fn test_short_segment_is_cipher_failure() {
        let err = BlockCipherStage::new().decrypt(&[1, 2, 3], &IV).unwrap_err();
        assert!(matches!(err, CryptoError::CipherFailure { segment_len: 3 }));

        let err = BlockCipherStage::new().decrypt(&[], &IV).unwrap_err();
        assert!(matches!(err, CryptoError::CipherFailure { segment_len: 0 }));
    }

    #[test]
    fn test_with_key_rejects_wrong_length() {
        assert!(matches!(
            BlockCipherStage::with_key(&[0; 16]),
            Err(CryptoError::InvalidKeySize {
                expected: 32,
                actual: 16
            })
        ));
        assert!(BlockCipherStage::with_key(&[0; 32]).is_ok());
    }

    proptest! {
        #[test]
        fn prop_truncated_segment_yields_aligned_prefix(
            plain in proptest::collection::vec(b'a'..=b'z', 1..200),
            cut_seed in any::<usize>(),
        ) {
            let cipher = encrypt(&plain);
            let cut = 1 + cut_seed % cipher.len();
            let result = BlockCipherStage::new().decrypt(&cipher[..cut], &IV);

            if cut < BLOCK_SIZE {
                prop_assert!(
                    matches!(result, Err(CryptoError::CipherFailure { .. })),
                    "short segment should fail"
                );
            } else if cut == cipher.len() {
                prop_assert_eq!(result.unwrap(), plain);
            } else {
                let aligned = cut - cut % BLOCK_SIZE;
                prop_assert_eq!(result.unwrap(), plain[..aligned].to_vec());
            }
        }
    }
}
