use std::fmt;

pub type Error = anyhow::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Sentinel for cooperative shutdown of the event pump.
pub struct CancelError;

impl std::error::Error for CancelError {}

impl fmt::Display for CancelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cancelled")
    }
}

impl fmt::Debug for CancelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cancelled")
    }
}

pub fn is_cancelled(e: &Error) -> bool {
    for cause in e.chain() {
        if cause.downcast_ref::<CancelError>().is_some() {
            return true;
        }
    }
    false
}

/// Fatal swarm conditions surfaced to the embedding application.
pub fn is_fatal(e: &Error) -> bool {
    shoal_storage::is_resume_mismatch(e) || shoal_storage::is_late_corruption(e)
}
