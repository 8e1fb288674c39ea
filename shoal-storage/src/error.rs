use thiserror::Error;

pub type Error = anyhow::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Fatal storage conditions. Everything else in this crate flows through
/// `anyhow` chains; these are the variants callers are expected to match on.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Total length is inconsistent with the piece size and digest count.
    #[error("total length {total} inconsistent with {pieces} pieces of {piece_length} bytes")]
    SizeMismatch {
        total: u64,
        pieces: usize,
        piece_length: usize,
    },

    /// Fast-resume metadata structurally contradicts on-disk preallocation.
    #[error("fast-resume state contradicts on-disk allocation: {reason}")]
    ResumeMismatch { reason: String },

    /// A piece restored as complete without checking failed verification on
    /// first read. The file set was modified out-of-band.
    #[error("piece {piece} failed verification on first read")]
    LateCorruption { piece: u32 },
}

pub fn is_resume_mismatch(e: &Error) -> bool {
    matches!(
        e.downcast_ref::<StoreError>(),
        Some(StoreError::ResumeMismatch { .. })
    )
}

pub fn is_late_corruption(e: &Error) -> bool {
    matches!(
        e.downcast_ref::<StoreError>(),
        Some(StoreError::LateCorruption { .. })
    )
}
