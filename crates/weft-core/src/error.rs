//! Error types for the weft runtime

use core::fmt;

/// Result type for runtime operations
pub type SchedResult<T> = Result<T, SchedError>;

/// Errors that can occur in runtime operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedError {
    /// Operation timed out
    Timeout,

    /// A readiness event is already armed for this fd/direction
    EventExists,

    /// No event armed for this fd/direction
    EventNotFound,

    /// Fd is outside the context table and cannot be looked up
    FdNotFound,

    /// Invalid fiber state for the requested transition
    InvalidState,

    /// Scheduler has been stopped
    Stopped,

    /// Stack allocation or protection failed
    StackError(StackError),

    /// Raw OS error (errno value)
    PlatformError(i32),
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::Timeout => write!(f, "operation timed out"),
            SchedError::EventExists => write!(f, "event already armed for this direction"),
            SchedError::EventNotFound => write!(f, "no event armed for this direction"),
            SchedError::FdNotFound => write!(f, "fd not present in context table"),
            SchedError::InvalidState => write!(f, "invalid fiber state"),
            SchedError::Stopped => write!(f, "scheduler stopped"),
            SchedError::StackError(e) => write!(f, "stack error: {}", e),
            SchedError::PlatformError(code) => write!(f, "platform error: {}", code),
        }
    }
}

impl std::error::Error for SchedError {}

/// Stack allocation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackError {
    /// mmap failed
    AllocationFailed,

    /// mprotect on the guard page failed
    ProtectionFailed,

    /// Requested size too small to hold a guard page plus usable stack
    TooSmall,
}

impl fmt::Display for StackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackError::AllocationFailed => write!(f, "stack allocation failed"),
            StackError::ProtectionFailed => write!(f, "guard page protection failed"),
            StackError::TooSmall => write!(f, "stack size too small"),
        }
    }
}

impl From<StackError> for SchedError {
    fn from(e: StackError) -> Self {
        SchedError::StackError(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = SchedError::Timeout;
        assert_eq!(format!("{}", e), "operation timed out");

        let e = SchedError::StackError(StackError::AllocationFailed);
        assert_eq!(format!("{}", e), "stack error: stack allocation failed");
    }

    #[test]
    fn test_error_conversion() {
        let stack_err = StackError::TooSmall;
        let sched_err: SchedError = stack_err.into();
        assert!(matches!(sched_err, SchedError::StackError(StackError::TooSmall)));
    }
}
