use arena::ArenaError;
use jit::JitError;

use crate::config::ConfigError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProbeError {
    Config(ConfigError),
    Arena(ArenaError),
    Jit(JitError),
    /// A byte written through one alias did not read back through another.
    Coherence {
        writer: String,
        reader: String,
        offset: usize,
        expected: u8,
        found: u8,
    },
    /// A patch slot did not hold the bytes the cache reported writing.
    StalePatch {
        site: usize,
    },
}

impl std::fmt::Display for ProbeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeError::Config(err) => write!(f, "{err}"),
            ProbeError::Arena(err) => write!(f, "{err}"),
            ProbeError::Jit(err) => write!(f, "{err}"),
            ProbeError::Coherence {
                writer,
                reader,
                offset,
                expected,
                found,
            } => write!(
                f,
                "alias mismatch at {offset:#x}: wrote {expected:#04x} via {writer}, read {found:#04x} via {reader}"
            ),
            ProbeError::StalePatch { site } => {
                write!(f, "patch slot at {site:#x} does not route to the dispatcher")
            }
        }
    }
}

impl std::error::Error for ProbeError {}

impl From<ConfigError> for ProbeError {
    fn from(err: ConfigError) -> Self {
        ProbeError::Config(err)
    }
}

impl From<ArenaError> for ProbeError {
    fn from(err: ArenaError) -> Self {
        ProbeError::Arena(err)
    }
}

impl From<JitError> for ProbeError {
    fn from(err: JitError) -> Self {
        ProbeError::Jit(err)
    }
}
