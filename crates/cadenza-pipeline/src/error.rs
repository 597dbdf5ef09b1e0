//! Pipeline error taxonomy

use std::fmt;

use cadenza_crypto::CryptoError;
use cadenza_formats::FormatError;
use thiserror::Error;

/// Pipeline states, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PipelineStage {
    /// Input bytes received
    Raw,
    /// Tag region located
    HeaderParsed,
    /// Key material resolved
    DescriptorResolved,
    /// Block cipher applied
    CipherDecoded,
    /// Bytecode transform applied and base64 decoded
    TransformDecoded,
    /// Decoded segment joined with the trailing region
    Assembled,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Raw => "raw",
            Self::HeaderParsed => "header-parsed",
            Self::DescriptorResolved => "descriptor-resolved",
            Self::CipherDecoded => "cipher-decoded",
            Self::TransformDecoded => "transform-decoded",
            Self::Assembled => "assembled",
        };
        f.write_str(name)
    }
}

/// Terminal pipeline failures
#[derive(Debug, Error)]
pub enum DecryptError {
    /// No initialization vector could be resolved from the tag region
    #[error("missing key material: {source}")]
    MissingKeyMaterial {
        /// Resolver error
        #[source]
        source: FormatError,
    },

    /// Both padded and unpadded decrypt attempts failed
    #[error("cipher failure: {source}")]
    CipherFailure {
        /// Cipher stage error
        #[source]
        source: CryptoError,
    },

    /// Cipher output is not UTF-8, usually a wrong key or IV
    #[error("cipher output is not valid UTF-8 at byte {valid_up_to}")]
    InvalidIntermediateEncoding {
        /// Length of the valid UTF-8 prefix
        valid_up_to: usize,
    },

    /// The bytecode module failed or produced undecodable output
    #[error("transform failure: {source}")]
    TransformFailure {
        /// Transform stage error
        #[source]
        source: CryptoError,
    },

    /// Every stage succeeded but the decoded segment is empty
    #[error("decoded output is empty")]
    EmptyDecodedOutput,
}

impl DecryptError {
    /// Stage the pipeline was in when the error was raised
    pub fn stage(&self) -> PipelineStage {
        match self {
            Self::MissingKeyMaterial { .. } => PipelineStage::HeaderParsed,
            Self::CipherFailure { .. } => PipelineStage::DescriptorResolved,
            Self::InvalidIntermediateEncoding { .. } | Self::TransformFailure { .. } => {
                PipelineStage::CipherDecoded
            }
            Self::EmptyDecodedOutput => PipelineStage::TransformDecoded,
        }
    }

    /// Short diagnostic suitable for an HTTP error body
    pub fn diagnostic(&self) -> String {
        match self {
            Self::MissingKeyMaterial { .. } => {
                "decode failed: no initialization vector in tag header".to_string()
            }
            Self::CipherFailure { .. } => "decode failed: block cipher rejected segment".to_string(),
            Self::InvalidIntermediateEncoding { .. } => {
                "decode failed: wrong key material (cipher output not UTF-8)".to_string()
            }
            Self::TransformFailure { .. } => "decode failed: transform module error".to_string(),
            Self::EmptyDecodedOutput => "decode failed: empty output".to_string(),
        }
    }
}
