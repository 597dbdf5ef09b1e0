//! Pipeline orchestration

use std::sync::Arc;

use cadenza_crypto::{BlockCipherStage, BytecodeTransform};
use cadenza_formats::{header_size, resolve_descriptor};

use crate::error::{DecryptError, PipelineStage};

/// Runs every decryption stage over one protected asset.
///
/// Cheap to clone; the bytecode transform is shared.
#[derive(Debug, Clone)]
pub struct DecryptionPipeline {
    cipher: BlockCipherStage,
    transform: Arc<BytecodeTransform>,
}

impl DecryptionPipeline {
    /// Pipeline with the fixed-key cipher stage
    pub fn new(transform: Arc<BytecodeTransform>) -> Self {
        Self::with_stages(BlockCipherStage::new(), transform)
    }

    /// Pipeline with explicit stages
    pub fn with_stages(cipher: BlockCipherStage, transform: Arc<BytecodeTransform>) -> Self {
        Self { cipher, transform }
    }

    /// Shared transform stage
    pub fn transform(&self) -> &Arc<BytecodeTransform> {
        &self.transform
    }

    /// Decode `raw` into playable bytes.
    ///
    /// CPU bound; async callers should run it on a blocking thread.
    pub fn decrypt(&self, raw: &[u8]) -> Result<Vec<u8>, DecryptError> {
        let span = tracing::debug_span!("decrypt", raw_len = raw.len());
        let _enter = span.enter();

        let header = header_size(raw);
        tracing::trace!(stage = %PipelineStage::HeaderParsed, header);

        let descriptor = resolve_descriptor(raw, header)
            .map_err(|source| DecryptError::MissingKeyMaterial { source })?;
        tracing::trace!(
            stage = %PipelineStage::DescriptorResolved,
            segment_size = descriptor.segment_size,
            track = descriptor.track_number
        );

        let segment = &raw[descriptor.segment_range(raw.len())];
        let plain = self
            .cipher
            .decrypt(segment, &descriptor.iv)
            .map_err(|source| DecryptError::CipherFailure { source })?;
        tracing::trace!(stage = %PipelineStage::CipherDecoded, bytes = plain.len());

        let intermediate =
            String::from_utf8(plain).map_err(|e| DecryptError::InvalidIntermediateEncoding {
                valid_up_to: e.utf8_error().valid_up_to(),
            })?;

        let decoded = self
            .transform
            .decode(
                &intermediate,
                &descriptor.track_id(),
                &descriptor.technology_marker,
            )
            .map_err(|source| DecryptError::TransformFailure { source })?;
        if decoded.is_empty() {
            return Err(DecryptError::EmptyDecodedOutput);
        }
        tracing::trace!(stage = %PipelineStage::TransformDecoded, bytes = decoded.len());

        let trailing = &raw[descriptor.trailing_range(raw.len())];
        let mut output = decoded;
        output.extend_from_slice(trailing);

        tracing::debug!(
            stage = %PipelineStage::Assembled,
            bytes = output.len(),
            trailing = trailing.len(),
            "asset decoded"
        );
        Ok(output)
    }
}
