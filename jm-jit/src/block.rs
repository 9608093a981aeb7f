use std::collections::BTreeSet;

pub type GuestAddr = u32;

/// Identity of one registered block. Ids are never reused, so a handle to a
/// destroyed block can't alias a later registration at the same address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub(crate) u64);

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "block#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitKind {
    FallThrough,
    Jump,
    Taken,
    NotTaken,
}

/// A pre-sized patch slot at the end of a block that leaves for `target`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExitSite {
    pub kind: ExitKind,
    pub target: GuestAddr,
    pub site: usize,
}

impl ExitSite {
    pub fn fall_through(target: GuestAddr, site: usize) -> Self {
        Self {
            kind: ExitKind::FallThrough,
            target,
            site,
        }
    }

    pub fn jump(target: GuestAddr, site: usize) -> Self {
        Self {
            kind: ExitKind::Jump,
            target,
            site,
        }
    }

    pub fn taken(target: GuestAddr, site: usize) -> Self {
        Self {
            kind: ExitKind::Taken,
            target,
            site,
        }
    }

    pub fn not_taken(target: GuestAddr, site: usize) -> Self {
        Self {
            kind: ExitKind::NotTaken,
            target,
            site,
        }
    }
}

/// Host machine code occupied by a block; `entry` is where it starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostRange {
    pub entry: usize,
    pub len: usize,
}

impl HostRange {
    pub fn new(entry: usize, len: usize) -> Self {
        Self { entry, len }
    }

    pub fn contains(&self, at: usize, len: usize) -> bool {
        let Some(end) = at.checked_add(len) else {
            return false;
        };
        at >= self.entry && end <= self.entry.saturating_add(self.len)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockState {
    Compiled,
    Linked,
    Destroyed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockExit {
    pub site: ExitSite,
    pub linked_to: Option<BlockId>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JitBlock {
    pub id: BlockId,
    pub start: GuestAddr,
    pub guest_len: u32,
    pub host: HostRange,
    pub(crate) exits: Vec<BlockExit>,
    pub(crate) inbound: BTreeSet<(BlockId, usize)>,
    pub(crate) state: BlockState,
}

impl JitBlock {
    pub(crate) fn new(
        id: BlockId,
        start: GuestAddr,
        guest_len: u32,
        host: HostRange,
        exits: Vec<ExitSite>,
    ) -> Self {
        Self {
            id,
            start,
            guest_len,
            host,
            exits: exits
                .into_iter()
                .map(|site| BlockExit {
                    site,
                    linked_to: None,
                })
                .collect(),
            inbound: BTreeSet::new(),
            state: BlockState::Compiled,
        }
    }

    pub fn state(&self) -> BlockState {
        self.state
    }

    pub fn exits(&self) -> &[BlockExit] {
        &self.exits
    }

    /// `(source block, exit index)` pairs currently branching straight here.
    pub fn inbound_links(&self) -> impl Iterator<Item = (BlockId, usize)> + '_ {
        self.inbound.iter().copied()
    }

    pub fn linked_exit_count(&self) -> usize {
        self.exits
            .iter()
            .filter(|exit| exit.linked_to.is_some())
            .count()
    }

    /// One past the last guest byte, widened so blocks ending at the top of
    /// the address space don't wrap.
    pub fn guest_end(&self) -> u64 {
        u64::from(self.start) + u64::from(self.guest_len)
    }

    pub fn intersects(&self, start: u64, end: u64) -> bool {
        u64::from(self.start) < end && start < self.guest_end()
    }

    pub(crate) fn refresh_state(&mut self) {
        if self.state == BlockState::Destroyed {
            return;
        }
        self.state = if self.linked_exit_count() > 0 || !self.inbound.is_empty() {
            BlockState::Linked
        } else {
            BlockState::Compiled
        };
    }
}
