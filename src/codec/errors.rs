use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The buffer ends before the record does.
    #[error("DURALOG_CODEC_INCOMPLETE: need {needed} bytes, have {available}")]
    Incomplete { needed: usize, available: usize },

    #[error("DURALOG_CODEC_UNKNOWN_KIND: unknown record kind {0}")]
    UnknownKind(u8),

    #[error("DURALOG_CODEC_CHECKSUM: {kind} record checksum mismatch (stored {stored:#x}, computed {computed:#x})")]
    ChecksumMismatch {
        kind: &'static str,
        stored: u16,
        computed: u16,
    },

    #[error("DURALOG_CODEC_MALFORMED: {0}")]
    Malformed(&'static str),
}

impl CodecError {
    pub fn code(&self) -> &'static str {
        match self {
            CodecError::Incomplete { .. } => "DURALOG_CODEC_INCOMPLETE",
            CodecError::UnknownKind(_) => "DURALOG_CODEC_UNKNOWN_KIND",
            CodecError::ChecksumMismatch { .. } => "DURALOG_CODEC_CHECKSUM",
            CodecError::Malformed(_) => "DURALOG_CODEC_MALFORMED",
        }
    }

    pub fn is_incomplete(&self) -> bool {
        matches!(self, CodecError::Incomplete { .. })
    }
}

pub type CodecResult<T> = Result<T, CodecError>;
