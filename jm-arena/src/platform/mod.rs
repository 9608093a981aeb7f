use std::ptr::NonNull;

use crate::ArenaResult;

#[cfg(unix)]
mod unix;
#[cfg(not(any(unix, windows)))]
mod unsupported;
#[cfg(windows)]
mod windows;

/// Virtual-memory primitives one OS family offers for building aliased views
/// of a single shareable memory object.
///
/// Every implementation honors the same contract: bytes written through any
/// view are observed through every other view of the same segment range.
pub(crate) trait PlatformMemoryMapper {
    type Segment: Send;

    const NAME: &'static str;

    fn create_segment(size: usize) -> ArenaResult<Self::Segment>;
    fn release_segment(segment: Self::Segment) -> ArenaResult<()>;
    fn map_view(
        segment: &Self::Segment,
        offset: usize,
        size: usize,
        desired: Option<NonNull<u8>>,
    ) -> ArenaResult<NonNull<u8>>;
    /// # Safety
    ///
    /// `view..view+size` must be a live mapping returned by `map_view` that
    /// nothing accesses anymore.
    unsafe fn unmap_view(view: NonNull<u8>, size: usize) -> ArenaResult<()>;
    fn reserve_hint(size: usize) -> ArenaResult<NonNull<u8>>;
    fn allocation_granularity() -> usize;
}

#[cfg(unix)]
pub(crate) type ActiveMapper = unix::UnixMapper;

#[cfg(windows)]
pub(crate) type ActiveMapper = windows::WindowsMapper;

#[cfg(not(any(unix, windows)))]
pub(crate) type ActiveMapper = unsupported::UnsupportedMapper;

pub(crate) type SegmentHandle = <ActiveMapper as PlatformMemoryMapper>::Segment;
