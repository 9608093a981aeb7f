use crate::block::{BlockId, GuestAddr};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JitError {
    UnknownBlock(BlockId),
    EmptyBlock {
        start: GuestAddr,
    },
    ExitOutOfRange {
        block: BlockId,
        exit: usize,
        exits: usize,
    },
    TargetMismatch {
        block: BlockId,
        exit: usize,
        target: GuestAddr,
        dest_start: GuestAddr,
    },
    EntryTooSmall {
        start: GuestAddr,
        len: usize,
        slot: usize,
    },
    SiteOutsideBlock {
        start: GuestAddr,
        site: usize,
    },
    PatchOverflow {
        site: usize,
        needed: usize,
        slot: usize,
    },
    BranchOutOfRange {
        site: usize,
        target: usize,
    },
    SiteOutOfBounds {
        at: usize,
        len: usize,
    },
    Native(String),
}

impl JitError {
    /// Broken block-graph or patch-site invariants. The guest context that hit
    /// one must stop; continuing could run stale or half-patched code.
    pub fn is_invariant_violation(&self) -> bool {
        !matches!(self, JitError::Native(_))
    }
}

impl std::fmt::Display for JitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JitError::UnknownBlock(id) => write!(f, "{id} is not a live block"),
            JitError::EmptyBlock { start } => {
                write!(f, "block at {start:#010x} covers no guest bytes")
            }
            JitError::ExitOutOfRange { block, exit, exits } => {
                write!(f, "{block} has {exits} exits, exit {exit} does not exist")
            }
            JitError::TargetMismatch {
                block,
                exit,
                target,
                dest_start,
            } => write!(
                f,
                "{block} exit {exit} targets {target:#010x}, cannot link to block at {dest_start:#010x}"
            ),
            JitError::EntryTooSmall { start, len, slot } => write!(
                f,
                "block at {start:#010x} has {len} bytes of host code, entry patch needs {slot}"
            ),
            JitError::SiteOutsideBlock { start, site } => write!(
                f,
                "exit site {site:#x} lies outside the host code of block at {start:#010x}"
            ),
            JitError::PatchOverflow { site, needed, slot } => write!(
                f,
                "patch at {site:#x} needs {needed} bytes but the slot holds {slot}"
            ),
            JitError::BranchOutOfRange { site, target } => {
                write!(f, "branch at {site:#x} cannot reach {target:#x}")
            }
            JitError::SiteOutOfBounds { at, len } => {
                write!(f, "code write {at:#x}+{len} is outside the code buffer")
            }
            JitError::Native(message) => write!(f, "jit native error: {message}"),
        }
    }
}

impl std::error::Error for JitError {}

pub type JitResult<T> = Result<T, JitError>;
