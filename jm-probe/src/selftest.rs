use arena::{MappedLayout, MemArena, ViewLayout};
use jit::{
    BlockCache, BlockCacheConfig, BlockCacheStats, BlockId, CodeBuffer, ExitPatcher, ExitSite,
    HostRange,
};
use tracing::{debug, warn};

use crate::config::ProbeConfig;
use crate::error::ProbeError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ViewReport {
    pub name: String,
    pub address: usize,
    pub relocated: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArenaReport {
    pub mechanism: &'static str,
    pub segment_size: usize,
    pub hint: Option<usize>,
    pub views: Vec<ViewReport>,
    /// Every alias sits at `hint + index * segment_size`.
    pub constant_offset: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheReport {
    pub patcher: &'static str,
    pub code_base: usize,
    pub blocks: usize,
    pub invalidated: usize,
    pub cleared: usize,
    pub stats: BlockCacheStats,
    pub dump: String,
}

/// Grabs a segment, maps `alias_count` mirrored views of it, and checks that
/// writes through each alias are visible through all the others.
pub fn run_arena_check(config: &ProbeConfig) -> Result<ArenaReport, ProbeError> {
    let mut arena = MemArena::new();
    arena.grab_shm_segment(config.segment_size)?;
    let segment_size = arena.segment_size();
    let layout = ViewLayout::mirrored(segment_size, config.alias_count)?;

    let hint = match MemArena::reserve_address_space_hint(layout.address_space_span()) {
        Ok(base) => Some(base),
        Err(err) if err.is_recoverable() => {
            warn!("no address space hint, aliases will be placed by the OS: {err}");
            None
        }
        Err(err) => return Err(err.into()),
    };

    let mapped = arena.map_layout(&layout, hint)?;
    let coherence = check_coherence(&mapped, segment_size);
    let report = ArenaReport {
        mechanism: MemArena::mechanism(),
        segment_size,
        hint: hint.map(|base| base.as_ptr() as usize),
        views: mapped
            .views()
            .iter()
            .map(|view| ViewReport {
                name: view.name.clone(),
                address: view.address.as_ptr() as usize,
                relocated: view.relocated,
            })
            .collect(),
        constant_offset: has_constant_offset(&mapped, segment_size),
    };

    // The probe is the only user of these views.
    let unmapped = unsafe { arena.unmap_layout(mapped) };
    let released = arena.release_shm_segment();
    coherence?;
    unmapped?;
    released?;
    Ok(report)
}

fn check_coherence(mapped: &MappedLayout, segment_size: usize) -> Result<(), ProbeError> {
    let views = mapped.views();
    for (index, writer) in views.iter().enumerate() {
        let offset = probe_offset(index, segment_size);
        let expected = 0xA5u8.wrapping_add(index as u8);
        unsafe { writer.address.as_ptr().add(offset).write_volatile(expected) };
        for reader in views {
            let found = unsafe { reader.address.as_ptr().add(offset).read_volatile() };
            if found != expected {
                return Err(ProbeError::Coherence {
                    writer: writer.name.clone(),
                    reader: reader.name.clone(),
                    offset,
                    expected,
                    found,
                });
            }
        }
    }
    debug!(views = views.len(), "alias coherence verified");
    Ok(())
}

/// Spreads probe writes across the segment so distinct pages are touched.
fn probe_offset(index: usize, segment_size: usize) -> usize {
    index.wrapping_mul(4097).wrapping_add(segment_size / 2) % segment_size
}

fn has_constant_offset(mapped: &MappedLayout, segment_size: usize) -> bool {
    let Some(base) = mapped.base() else {
        return false;
    };
    let base = base.as_ptr() as usize;
    mapped.views().iter().enumerate().all(|(index, view)| {
        !view.relocated && view.address.as_ptr() as usize == base + index * segment_size
    })
}

const CHAIN: [u32; 3] = [0x1000, 0x2000, 0x3000];
const CHAIN_STRIDE: u32 = 0x1000;
const CHAIN_BLOCK_LEN: u32 = 0x20;

/// Builds a three-block chain in a real code buffer, links it, invalidates the
/// middle block, and verifies the first block's exit routes to the dispatcher
/// again. No generated code is executed.
pub fn run_block_cache_check<P: ExitPatcher>(
    config: &ProbeConfig,
) -> Result<CacheReport, ProbeError> {
    let mut buffer = CodeBuffer::with_capacity(config.code_size)?;
    let code_base = buffer.base();
    let mut stub = Vec::new();
    P::encode_padding(&mut stub, 4);
    let dispatcher = buffer.emit(&stub)?;

    let mut cache = BlockCache::<P, _>::new(
        buffer,
        dispatcher,
        BlockCacheConfig {
            link_blocks: config.link_blocks,
            ..BlockCacheConfig::default()
        },
    );

    let mut ids: Vec<BlockId> = Vec::with_capacity(CHAIN.len());
    let mut exit_sites = Vec::with_capacity(CHAIN.len());
    for &start in &CHAIN {
        let target = start + CHAIN_STRIDE;
        let code = cache.code_mut();
        let entry = code.emit_dispatch_slot::<P>(start, dispatcher)?;
        let site = code.emit_dispatch_slot::<P>(target, dispatcher)?;
        let host = HostRange::new(entry, 2 * P::SLOT_LEN);
        ids.push(cache.register_block(
            start,
            CHAIN_BLOCK_LEN,
            host,
            vec![ExitSite::jump(target, site)],
        )?);
        exit_sites.push(site);
    }
    for pair in ids.windows(2) {
        cache.link_block_exit(pair[0], 0, pair[1])?;
    }
    let dump = cache.dump_text();
    debug!("block cache after linking:\n{dump}");

    let invalidated = cache.invalidate_range(CHAIN[1], 1)?;
    let site = exit_sites[0];
    let mut expected = Vec::with_capacity(P::SLOT_LEN);
    P::encode_dispatch(&mut expected, site, CHAIN[1], dispatcher)?;
    let padding = P::SLOT_LEN - expected.len();
    P::encode_padding(&mut expected, padding);
    if cache.code().bytes(site, P::SLOT_LEN)? != expected.as_slice() {
        return Err(ProbeError::StalePatch { site });
    }

    let blocks = cache.len() + invalidated;
    let cleared = cache.clear()?;
    Ok(CacheReport {
        patcher: P::NAME,
        code_base,
        blocks,
        invalidated,
        cleared,
        stats: cache.stats(),
        dump,
    })
}

/// Runs [`run_block_cache_check`] with the patcher for this host, or `None`
/// when the host ISA has no patcher.
pub fn run_host_block_cache_check(
    config: &ProbeConfig,
) -> Option<Result<CacheReport, ProbeError>> {
    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    {
        Some(run_block_cache_check::<jit::HostPatcher>(config))
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        let _ = config;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_offsets_stay_inside_the_segment() {
        for index in 0..16 {
            assert!(probe_offset(index, 4096) < 4096);
        }
        assert_ne!(probe_offset(0, 1 << 20), probe_offset(1, 1 << 20));
    }
}
