use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use tracing::{debug, trace, warn};

use crate::block::{BlockId, BlockState, ExitSite, GuestAddr, HostRange, JitBlock};
use crate::native::{CodeMemory, ExitPatcher};
use crate::{JitError, JitResult};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockCacheConfig {
    /// Link exits to registered successors automatically on registration.
    pub link_blocks: bool,
    /// log2 of the guest page size used to find blocks hit by an invalidation.
    pub invalidation_page_shift: u32,
}

impl Default for BlockCacheConfig {
    fn default() -> Self {
        Self {
            link_blocks: true,
            invalidation_page_shift: 12,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockCacheStats {
    pub registered: u64,
    pub destroyed: u64,
    pub link_patches: u64,
    pub unlink_patches: u64,
    pub invalidations: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockCacheSnapshot {
    pub patcher: &'static str,
    pub config: BlockCacheConfig,
    pub dispatcher: usize,
    pub stats: BlockCacheStats,
    /// Live blocks ordered by guest start address.
    pub blocks: Vec<JitBlock>,
}

pub type SharedBlockCache<P, M> = Arc<Mutex<BlockCache<P, M>>>;

/// Registry of compiled guest blocks and the direct branches between them.
///
/// Every block entry and exit site is a `P::SLOT_LEN` patch slot written
/// through `M`. An exit either routes to the dispatcher with its guest target
/// or branches straight into the entry of the block starting at that target.
/// Emitters lay exits down in dispatch form (see
/// [`CodeBuffer::emit_dispatch_slot`](crate::CodeBuffer::emit_dispatch_slot)).
pub struct BlockCache<P: ExitPatcher, M: CodeMemory> {
    config: BlockCacheConfig,
    code: M,
    dispatcher: usize,
    next_id: u64,
    blocks: HashMap<BlockId, JitBlock>,
    by_start: BTreeMap<GuestAddr, BlockId>,
    by_page: HashMap<u64, HashSet<BlockId>>,
    // Every exit of a live block, keyed by guest target, linked or not.
    exits_to: HashMap<GuestAddr, BTreeSet<(BlockId, usize)>>,
    stats: BlockCacheStats,
    _patcher: PhantomData<fn() -> P>,
}

impl<P: ExitPatcher, M: CodeMemory> BlockCache<P, M> {
    pub fn new(code: M, dispatcher: usize, config: BlockCacheConfig) -> Self {
        Self {
            config,
            code,
            dispatcher,
            next_id: 0,
            blocks: HashMap::new(),
            by_start: BTreeMap::new(),
            by_page: HashMap::new(),
            exits_to: HashMap::new(),
            stats: BlockCacheStats::default(),
            _patcher: PhantomData,
        }
    }

    pub fn into_shared(self) -> SharedBlockCache<P, M> {
        Arc::new(Mutex::new(self))
    }

    pub fn config(&self) -> &BlockCacheConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> usize {
        self.dispatcher
    }

    pub fn code(&self) -> &M {
        &self.code
    }

    pub fn code_mut(&mut self) -> &mut M {
        &mut self.code
    }

    pub fn register_block(
        &mut self,
        start: GuestAddr,
        guest_len: u32,
        host: HostRange,
        exits: Vec<ExitSite>,
    ) -> JitResult<BlockId> {
        if guest_len == 0 {
            return Err(JitError::EmptyBlock { start });
        }
        if !host.contains(host.entry, P::SLOT_LEN) {
            return Err(JitError::EntryTooSmall {
                start,
                len: host.len,
                slot: P::SLOT_LEN,
            });
        }
        if let Some(exit) = exits.iter().find(|exit| !host.contains(exit.site, P::SLOT_LEN)) {
            return Err(JitError::SiteOutsideBlock {
                start,
                site: exit.site,
            });
        }

        if let Some(&stale) = self.by_start.get(&start) {
            debug!(%stale, start = %format!("{start:#010x}"), "replacing block");
            self.destroy_block(stale)?;
        }

        let id = BlockId(self.next_id);
        self.next_id += 1;
        let block = JitBlock::new(id, start, guest_len, host, exits);

        for page in self.pages_of(block.start.into(), block.guest_end()) {
            self.by_page.entry(page).or_default().insert(id);
        }
        for (index, exit) in block.exits.iter().enumerate() {
            self.exits_to
                .entry(exit.site.target)
                .or_default()
                .insert((id, index));
        }
        self.by_start.insert(start, id);
        debug!(
            %id,
            start = %format!("{start:#010x}"),
            guest_len,
            entry = %format!("{:#x}", host.entry),
            exits = block.exits.len(),
            "registered block"
        );
        self.blocks.insert(id, block);
        self.stats.registered += 1;

        if self.config.link_blocks {
            self.link_registered(id)?;
        }
        Ok(id)
    }

    fn link_registered(&mut self, id: BlockId) -> JitResult<()> {
        let Some(block) = self.blocks.get(&id) else {
            return Err(JitError::UnknownBlock(id));
        };
        let start = block.start;
        let outbound: Vec<(usize, BlockId)> = block
            .exits
            .iter()
            .enumerate()
            .filter_map(|(index, exit)| {
                self.by_start
                    .get(&exit.site.target)
                    .map(|&dest| (index, dest))
            })
            .collect();
        let inbound: Vec<(BlockId, usize)> = self
            .exits_to
            .get(&start)
            .map(|sources| {
                sources
                    .iter()
                    .copied()
                    .filter(|&(source, _)| source != id)
                    .collect()
            })
            .unwrap_or_default();

        for (exit, dest) in outbound {
            self.auto_link(id, exit, dest)?;
        }
        for (source, exit) in inbound {
            self.auto_link(source, exit, id)?;
        }
        Ok(())
    }

    fn auto_link(&mut self, source: BlockId, exit: usize, dest: BlockId) -> JitResult<()> {
        match self.link_block_exit(source, exit, dest) {
            Err(JitError::BranchOutOfRange { site, target }) => {
                warn!(
                    %source,
                    exit,
                    %dest,
                    site = %format!("{site:#x}"),
                    target = %format!("{target:#x}"),
                    "link out of branch range, exit keeps dispatcher routing"
                );
                Ok(())
            }
            other => other,
        }
    }

    pub fn link_block_exit(&mut self, source: BlockId, exit: usize, dest: BlockId) -> JitResult<()> {
        let (dest_start, dest_entry) = {
            let block = self.blocks.get(&dest).ok_or(JitError::UnknownBlock(dest))?;
            (block.start, block.host.entry)
        };
        let block = self
            .blocks
            .get(&source)
            .ok_or(JitError::UnknownBlock(source))?;
        let slot = block.exits.get(exit).ok_or(JitError::ExitOutOfRange {
            block: source,
            exit,
            exits: block.exits.len(),
        })?;
        if slot.site.target != dest_start {
            return Err(JitError::TargetMismatch {
                block: source,
                exit,
                target: slot.site.target,
                dest_start,
            });
        }
        let site = slot.site.site;
        let linked_to = slot.linked_to;
        match linked_to {
            Some(current) if current == dest => return Ok(()),
            Some(_) => {
                self.unlink_block_exit(source, exit)?;
            }
            None => {}
        }

        self.write_slot(site, |code| P::encode_link(code, site, dest_entry))?;

        if let Some(block) = self.blocks.get_mut(&source) {
            block.exits[exit].linked_to = Some(dest);
            block.refresh_state();
        }
        if let Some(block) = self.blocks.get_mut(&dest) {
            block.inbound.insert((source, exit));
            block.refresh_state();
        }
        self.stats.link_patches += 1;
        trace!(
            %source,
            exit,
            %dest,
            site = %format!("{site:#x}"),
            entry = %format!("{dest_entry:#x}"),
            "linked exit"
        );
        Ok(())
    }

    /// Returns exit `exit` of `source` to dispatcher routing. `Ok(false)` when
    /// it was not linked.
    pub fn unlink_block_exit(&mut self, source: BlockId, exit: usize) -> JitResult<bool> {
        let block = self
            .blocks
            .get(&source)
            .ok_or(JitError::UnknownBlock(source))?;
        let slot = *block.exits.get(exit).ok_or(JitError::ExitOutOfRange {
            block: source,
            exit,
            exits: block.exits.len(),
        })?;
        let Some(dest) = slot.linked_to else {
            return Ok(false);
        };

        let site = slot.site.site;
        let target = slot.site.target;
        let dispatcher = self.dispatcher;
        self.write_slot(site, |code| {
            P::encode_dispatch(code, site, target, dispatcher)
        })?;

        if let Some(block) = self.blocks.get_mut(&source) {
            block.exits[exit].linked_to = None;
            block.refresh_state();
        }
        if let Some(block) = self.blocks.get_mut(&dest) {
            block.inbound.remove(&(source, exit));
            block.refresh_state();
        }
        self.stats.unlink_patches += 1;
        trace!(%source, exit, %dest, site = %format!("{site:#x}"), "unlinked exit");
        Ok(true)
    }

    /// Detaches `id` from the block graph and retires it.
    ///
    /// Inbound links are unlinked before outbound ones and the entry is
    /// rewritten to dispatch its own start address, so a stale branch into the
    /// old code re-enters the dispatcher instead of running it.
    pub fn destroy_block(&mut self, id: BlockId) -> JitResult<JitBlock> {
        let block = self.blocks.get(&id).ok_or(JitError::UnknownBlock(id))?;
        let inbound: Vec<(BlockId, usize)> = block.inbound.iter().copied().collect();
        let exit_count = block.exits.len();
        let start = block.start;
        let entry = block.host.entry;

        for (source, exit) in inbound {
            self.unlink_block_exit(source, exit)?;
        }
        for exit in 0..exit_count {
            self.unlink_block_exit(id, exit)?;
        }

        let dispatcher = self.dispatcher;
        self.write_slot(entry, |code| {
            P::encode_dispatch(code, entry, start, dispatcher)
        })?;

        let mut block = self.blocks.remove(&id).ok_or(JitError::UnknownBlock(id))?;
        if self.by_start.get(&start) == Some(&id) {
            self.by_start.remove(&start);
        }
        for page in self.pages_of(start.into(), block.guest_end()) {
            if let Some(ids) = self.by_page.get_mut(&page) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.by_page.remove(&page);
                }
            }
        }
        for (index, exit) in block.exits.iter().enumerate() {
            if let Some(sources) = self.exits_to.get_mut(&exit.site.target) {
                sources.remove(&(id, index));
                if sources.is_empty() {
                    self.exits_to.remove(&exit.site.target);
                }
            }
        }

        block.state = BlockState::Destroyed;
        self.stats.destroyed += 1;
        debug!(%id, start = %format!("{start:#010x}"), "destroyed block");
        Ok(block)
    }

    pub fn lookup_block(&self, addr: GuestAddr) -> Option<&JitBlock> {
        self.by_start.get(&addr).and_then(|id| self.blocks.get(id))
    }

    /// Host entry of the block starting at `addr`, for the dispatcher fast path.
    pub fn dispatch_entry(&self, addr: GuestAddr) -> Option<usize> {
        self.lookup_block(addr).map(|block| block.host.entry)
    }

    /// Destroys every block whose guest bytes overlap `[start, start + len)`
    /// and returns how many were destroyed.
    pub fn invalidate_range(&mut self, start: GuestAddr, len: u32) -> JitResult<usize> {
        if len == 0 {
            return Ok(0);
        }
        let start = u64::from(start);
        let end = start + u64::from(len);

        let pages = self.pages_of(start, end);
        let page_count = pages.end().saturating_sub(*pages.start()).saturating_add(1);
        let candidates: HashSet<BlockId> = if page_count > self.blocks.len() as u64 {
            self.blocks.keys().copied().collect()
        } else {
            pages
                .filter_map(|page| self.by_page.get(&page))
                .flatten()
                .copied()
                .collect()
        };
        let mut doomed: Vec<BlockId> = candidates
            .into_iter()
            .filter(|id| {
                self.blocks
                    .get(id)
                    .is_some_and(|block| block.intersects(start, end))
            })
            .collect();
        doomed.sort_unstable();

        for &id in &doomed {
            self.destroy_block(id)?;
        }
        self.stats.invalidations += 1;
        debug!(
            start = %format!("{start:#010x}"),
            len,
            destroyed = doomed.len(),
            "invalidated guest range"
        );
        Ok(doomed.len())
    }

    /// Destroys every live block.
    pub fn clear(&mut self) -> JitResult<usize> {
        let ids: Vec<BlockId> = self.by_start.values().copied().collect();
        for &id in &ids {
            self.destroy_block(id)?;
        }
        debug!(destroyed = ids.len(), "cleared block cache");
        Ok(ids.len())
    }

    pub fn block(&self, id: BlockId) -> Option<&JitBlock> {
        self.blocks.get(&id)
    }

    /// `None` only for ids this cache never handed out.
    pub fn block_state(&self, id: BlockId) -> Option<BlockState> {
        match self.blocks.get(&id) {
            Some(block) => Some(block.state()),
            None if id.0 < self.next_id => Some(BlockState::Destroyed),
            None => None,
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn links_into(&self, id: BlockId) -> Vec<(BlockId, usize)> {
        self.blocks
            .get(&id)
            .map(|block| block.inbound_links().collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> BlockCacheStats {
        self.stats
    }

    pub fn snapshot(&self) -> BlockCacheSnapshot {
        BlockCacheSnapshot {
            patcher: P::NAME,
            config: self.config.clone(),
            dispatcher: self.dispatcher,
            stats: self.stats,
            blocks: self.ordered_blocks().cloned().collect(),
        }
    }

    pub fn dump_text(&self) -> String {
        let mut out = String::new();
        out.push_str("block-cache:\n");
        out.push_str(&format!("  patcher: {} (slot {} bytes)\n", P::NAME, P::SLOT_LEN));
        out.push_str(&format!("  dispatcher: {:#x}\n", self.dispatcher));
        out.push_str(&format!("  link_blocks: {}\n", self.config.link_blocks));
        out.push_str(&format!(
            "  invalidation_page_shift: {}\n",
            self.config.invalidation_page_shift
        ));
        out.push_str(&format!("  live blocks: {}\n", self.blocks.len()));
        out.push_str(&format!(
            "  registered={} destroyed={} link_patches={} unlink_patches={} invalidations={}\n",
            self.stats.registered,
            self.stats.destroyed,
            self.stats.link_patches,
            self.stats.unlink_patches,
            self.stats.invalidations
        ));

        for block in self.ordered_blocks() {
            out.push_str(&format!(
                "  {} start={:#010x} len={} entry={:#x} host_len={} state={:?} inbound={}\n",
                block.id,
                block.start,
                block.guest_len,
                block.host.entry,
                block.host.len,
                block.state(),
                block.inbound.len()
            ));
            for (index, exit) in block.exits.iter().enumerate() {
                let route = match exit.linked_to {
                    Some(dest) => format!("-> {dest}"),
                    None => "-> dispatcher".to_string(),
                };
                out.push_str(&format!(
                    "    exit#{index} {:?} target={:#010x} site={:#x} {route}\n",
                    exit.site.kind, exit.site.target, exit.site.site
                ));
            }
        }

        out
    }

    fn ordered_blocks(&self) -> impl Iterator<Item = &JitBlock> + '_ {
        self.by_start
            .values()
            .filter_map(|id| self.blocks.get(id))
    }

    /// Pages touched by `[start, end)`. Extents may run past the 32-bit guest
    /// space, so page numbers stay 64-bit.
    fn pages_of(&self, start: u64, end: u64) -> std::ops::RangeInclusive<u64> {
        let shift = self.config.invalidation_page_shift.min(63);
        let first = start >> shift;
        let last = end.saturating_sub(1).max(start) >> shift;
        first..=last
    }

    fn write_slot(
        &mut self,
        site: usize,
        encode: impl FnOnce(&mut Vec<u8>) -> JitResult<()>,
    ) -> JitResult<()> {
        let mut code = Vec::with_capacity(P::SLOT_LEN);
        encode(&mut code)?;
        if code.len() > P::SLOT_LEN {
            return Err(JitError::PatchOverflow {
                site,
                needed: code.len(),
                slot: P::SLOT_LEN,
            });
        }
        let padding = P::SLOT_LEN - code.len();
        P::encode_padding(&mut code, padding);
        self.code.write_code(site, &code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::X86_64Patcher;

    struct NullCode;

    impl CodeMemory for NullCode {
        fn write_code(&mut self, _at: usize, _bytes: &[u8]) -> JitResult<()> {
            Ok(())
        }
    }

    fn cache(page_shift: u32) -> BlockCache<X86_64Patcher, NullCode> {
        BlockCache::new(
            NullCode,
            0x100,
            BlockCacheConfig {
                link_blocks: true,
                invalidation_page_shift: page_shift,
            },
        )
    }

    #[test]
    fn pages_cover_the_whole_extent() {
        let cache = cache(12);
        assert_eq!(cache.pages_of(0x1000, 0x1001), 1..=1);
        assert_eq!(cache.pages_of(0x1FFF, 0x2001), 1..=2);
        assert_eq!(cache.pages_of(0xFFFF_F000, 0x1_0000_0000), 0xF_FFFF..=0xF_FFFF);
    }

    #[test]
    fn byte_granular_pages_reach_past_the_guest_space() {
        let cache = cache(0);
        assert_eq!(
            cache.pages_of(0xFFFF_FFF0, 0x1_0000_0010),
            0xFFFF_FFF0..=0x1_0000_000F
        );
        assert_eq!(cache.pages_of(0x1000, 0x1000), 0x1000..=0x1000);
    }

    #[test]
    fn oversized_page_shift_collapses_to_one_page() {
        let cache = cache(40);
        assert_eq!(cache.pages_of(0x0, 0x1_0000_0000), 0..=0);
    }

    #[test]
    fn block_spanning_pages_is_indexed_in_each() {
        let mut cache = cache(12);
        let id = cache
            .register_block(0x1FF0, 0x20, HostRange::new(0x4000, 32), vec![])
            .expect("block should register");
        assert!(cache.by_page[&1].contains(&id));
        assert!(cache.by_page[&2].contains(&id));

        cache.destroy_block(id).expect("block should be destroyed");
        assert!(cache.by_page.is_empty());
        assert!(cache.exits_to.is_empty());
    }

    #[test]
    fn exit_index_tracks_unlinked_exits_until_destroy() {
        let mut cache = cache(12);
        let id = cache
            .register_block(
                0x1000,
                0x10,
                HostRange::new(0x4000, 32),
                vec![ExitSite::jump(0x2000, 0x4010)],
            )
            .expect("block should register");
        assert_eq!(
            cache.exits_to.get(&0x2000).map(|set| set.len()),
            Some(1)
        );
        cache.destroy_block(id).expect("block should be destroyed");
        assert!(!cache.exits_to.contains_key(&0x2000));
    }
}
