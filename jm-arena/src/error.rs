#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArenaError {
    /// The backing segment could not be obtained. The emulator cannot run
    /// without guest memory, so callers treat this as fatal at startup.
    AllocationFailure(String),
    /// A single view could not be placed. Callers may retry without a fixed
    /// address or with fewer aliases.
    MappingFailure(String),
    /// Probing for a free address range failed; views fall back to
    /// OS-chosen addresses.
    AddressHintUnavailable(String),
    InvalidState(&'static str),
}

impl ArenaError {
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ArenaError::MappingFailure(_) | ArenaError::AddressHintUnavailable(_)
        )
    }
}

impl std::fmt::Display for ArenaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArenaError::AllocationFailure(message) => {
                write!(f, "backing segment allocation failed: {message}")
            }
            ArenaError::MappingFailure(message) => write!(f, "view mapping failed: {message}"),
            ArenaError::AddressHintUnavailable(message) => {
                write!(f, "address space hint unavailable: {message}")
            }
            ArenaError::InvalidState(message) => write!(f, "invalid arena state: {message}"),
        }
    }
}

impl std::error::Error for ArenaError {}

pub type ArenaResult<T> = Result<T, ArenaError>;
