use std::ptr::NonNull;

use super::PlatformMemoryMapper;
use crate::{ArenaError, ArenaResult};

pub(crate) struct UnsupportedMapper;

impl PlatformMemoryMapper for UnsupportedMapper {
    type Segment = ();

    const NAME: &'static str = "unsupported";

    fn create_segment(_size: usize) -> ArenaResult<()> {
        Err(ArenaError::AllocationFailure(
            "shared memory segments are not implemented for this platform".to_string(),
        ))
    }

    fn release_segment(_segment: ()) -> ArenaResult<()> {
        Ok(())
    }

    fn map_view(
        _segment: &(),
        _offset: usize,
        _size: usize,
        _desired: Option<NonNull<u8>>,
    ) -> ArenaResult<NonNull<u8>> {
        Err(ArenaError::MappingFailure(
            "views are not implemented for this platform".to_string(),
        ))
    }

    unsafe fn unmap_view(_view: NonNull<u8>, _size: usize) -> ArenaResult<()> {
        Ok(())
    }

    fn reserve_hint(_size: usize) -> ArenaResult<NonNull<u8>> {
        Err(ArenaError::AddressHintUnavailable(
            "address space probing is not implemented for this platform".to_string(),
        ))
    }

    fn allocation_granularity() -> usize {
        4096
    }
}
