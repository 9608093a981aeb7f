use std::ptr::NonNull;

use tracing::{debug, warn};

use crate::platform::{ActiveMapper, PlatformMemoryMapper, SegmentHandle};
use crate::{ArenaError, ArenaResult};

struct Segment {
    handle: SegmentHandle,
    size: usize,
}

/// Owner of the single shared memory object that backs guest memory, and the
/// factory for views of it.
///
/// Views are not tracked here: whoever creates one releases it with
/// [`MemArena::release_view`] before the segment goes away.
#[derive(Default)]
pub struct MemArena {
    segment: Option<Segment>,
}

impl MemArena {
    pub fn new() -> Self {
        Self { segment: None }
    }

    /// Name of the platform mechanism backing segments on this host.
    pub fn mechanism() -> &'static str {
        ActiveMapper::NAME
    }

    pub fn has_segment(&self) -> bool {
        self.segment.is_some()
    }

    /// Size of the held segment after rounding, or 0 without one.
    pub fn segment_size(&self) -> usize {
        self.segment.as_ref().map_or(0, |segment| segment.size)
    }

    /// Allocates the backing segment, rounded up to the allocation granularity.
    pub fn grab_shm_segment(&mut self, size: usize) -> ArenaResult<()> {
        if self.segment.is_some() {
            return Err(ArenaError::InvalidState("backing segment already allocated"));
        }
        if size == 0 {
            return Err(ArenaError::AllocationFailure(
                "segment size must be non-zero".to_string(),
            ));
        }
        let size = round_up(size, allocation_granularity()).ok_or_else(|| {
            ArenaError::AllocationFailure(format!("segment size {size:#x} overflows"))
        })?;
        let handle = ActiveMapper::create_segment(size)?;
        debug!(size, mechanism = ActiveMapper::NAME, "grabbed backing segment");
        self.segment = Some(Segment { handle, size });
        Ok(())
    }

    pub fn release_shm_segment(&mut self) -> ArenaResult<()> {
        let segment = self
            .segment
            .take()
            .ok_or(ArenaError::InvalidState("no backing segment to release"))?;
        debug!(size = segment.size, "releasing backing segment");
        ActiveMapper::release_segment(segment.handle)
    }

    /// Maps `[offset, offset + size)` of the segment.
    ///
    /// With `desired` set the view lands exactly there or the call fails; an
    /// existing mapping at that address is never replaced.
    pub fn create_view(
        &self,
        offset: usize,
        size: usize,
        desired: Option<NonNull<u8>>,
    ) -> ArenaResult<NonNull<u8>> {
        let segment = self.mappable_segment(offset, size)?;
        let granularity = allocation_granularity();
        if let Some(base) = desired {
            if base.as_ptr() as usize % granularity != 0 {
                return Err(ArenaError::MappingFailure(format!(
                    "view address {:p} is not aligned to {granularity:#x}",
                    base.as_ptr()
                )));
            }
        }
        let view = ActiveMapper::map_view(&segment.handle, offset, size, desired)?;
        debug!(
            offset,
            size,
            address = ?view.as_ptr(),
            fixed = desired.is_some(),
            "created view"
        );
        Ok(view)
    }

    /// Checks `[offset, offset + size)` against the live segment without
    /// mapping anything.
    pub(crate) fn check_view(&self, offset: usize, size: usize) -> ArenaResult<()> {
        self.mappable_segment(offset, size).map(|_| ())
    }

    fn mappable_segment(&self, offset: usize, size: usize) -> ArenaResult<&Segment> {
        let segment = self
            .segment
            .as_ref()
            .ok_or(ArenaError::InvalidState("no backing segment to map"))?;
        check_view_bounds(offset, size, segment.size)?;
        Ok(segment)
    }

    /// Unmaps a view returned by [`MemArena::create_view`].
    ///
    /// # Safety
    ///
    /// `view` and `size` must describe exactly one live view of this arena,
    /// and no code (translated or otherwise) may touch that range afterwards.
    pub unsafe fn release_view(&self, view: NonNull<u8>, size: usize) -> ArenaResult<()> {
        debug!(address = ?view.as_ptr(), size, "releasing view");
        unsafe { ActiveMapper::unmap_view(view, size) }
    }

    /// Finds a free range of `size` bytes, returning its base as a placement
    /// hint. The range is released before returning, so views must be placed
    /// promptly.
    pub fn reserve_address_space_hint(size: usize) -> ArenaResult<NonNull<u8>> {
        if size == 0 {
            return Err(ArenaError::AddressHintUnavailable(
                "cannot probe an empty range".to_string(),
            ));
        }
        let base = ActiveMapper::reserve_hint(size)?;
        debug!(size, base = ?base.as_ptr(), "found address space hint");
        Ok(base)
    }
}

impl Drop for MemArena {
    fn drop(&mut self) {
        if let Some(segment) = self.segment.take() {
            warn!(size = segment.size, "arena dropped with a live backing segment");
            if let Err(err) = ActiveMapper::release_segment(segment.handle) {
                warn!("failed to release backing segment: {err}");
            }
        }
    }
}

/// Granularity that view offsets and fixed view addresses must respect.
pub fn allocation_granularity() -> usize {
    ActiveMapper::allocation_granularity()
}

fn check_view_bounds(offset: usize, size: usize, segment_size: usize) -> ArenaResult<()> {
    if size == 0 {
        return Err(ArenaError::MappingFailure("view size must be non-zero".to_string()));
    }
    let end = offset.checked_add(size).ok_or_else(|| {
        ArenaError::MappingFailure(format!("view {offset:#x}+{size:#x} overflows"))
    })?;
    if end > segment_size {
        return Err(ArenaError::MappingFailure(format!(
            "view {offset:#x}..{end:#x} exceeds segment size {segment_size:#x}"
        )));
    }
    let granularity = allocation_granularity();
    if offset % granularity != 0 {
        return Err(ArenaError::MappingFailure(format!(
            "view offset {offset:#x} is not aligned to {granularity:#x}"
        )));
    }
    Ok(())
}

pub(crate) fn round_up(value: usize, align: usize) -> Option<usize> {
    let mask = align.checked_sub(1)?;
    value.checked_add(mask).map(|value| value & !mask)
}
