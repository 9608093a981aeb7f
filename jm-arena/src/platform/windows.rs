use std::ptr::NonNull;

use tracing::debug;
use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};
use windows_sys::Win32::System::Memory::{
    CreateFileMappingW, FILE_MAP_ALL_ACCESS, MEM_RELEASE, MEM_RESERVE,
    MEMORY_MAPPED_VIEW_ADDRESS, MapViewOfFileEx, PAGE_NOACCESS, PAGE_READWRITE, UnmapViewOfFile,
    VirtualAlloc, VirtualFree,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

use super::PlatformMemoryMapper;
use crate::{ArenaError, ArenaResult};

pub(crate) struct WindowsMapper;

/// Pagefile-backed section object handle.
pub(crate) struct SectionHandle(HANDLE);

// The section handle is a process-wide kernel object reference.
unsafe impl Send for SectionHandle {}

impl PlatformMemoryMapper for WindowsMapper {
    type Segment = SectionHandle;

    const NAME: &'static str = "win32-section";

    fn create_segment(size: usize) -> ArenaResult<SectionHandle> {
        let size = size as u64;
        let handle = unsafe {
            CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                std::ptr::null(),
                PAGE_READWRITE,
                (size >> 32) as u32,
                size as u32,
                std::ptr::null(),
            )
        };
        if handle.is_null() {
            return Err(ArenaError::AllocationFailure(format!(
                "CreateFileMappingW({size:#x}) failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        debug!(size, "created pagefile-backed section");
        Ok(SectionHandle(handle))
    }

    fn release_segment(segment: SectionHandle) -> ArenaResult<()> {
        let ok = unsafe { CloseHandle(segment.0) };
        if ok == 0 {
            return Err(ArenaError::AllocationFailure(format!(
                "CloseHandle on the backing section failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    fn map_view(
        segment: &SectionHandle,
        offset: usize,
        size: usize,
        desired: Option<NonNull<u8>>,
    ) -> ArenaResult<NonNull<u8>> {
        let offset = offset as u64;
        let base = desired.map_or(std::ptr::null(), |ptr| ptr.as_ptr().cast_const().cast());
        let view = unsafe {
            MapViewOfFileEx(
                segment.0,
                FILE_MAP_ALL_ACCESS,
                (offset >> 32) as u32,
                offset as u32,
                size,
                base,
            )
        };
        NonNull::new(view.Value.cast::<u8>()).ok_or_else(|| {
            ArenaError::MappingFailure(format!(
                "MapViewOfFileEx({size:#x} @ section+{offset:#x}, {base:p}) failed: {}",
                std::io::Error::last_os_error()
            ))
        })
    }

    unsafe fn unmap_view(view: NonNull<u8>, _size: usize) -> ArenaResult<()> {
        let address = MEMORY_MAPPED_VIEW_ADDRESS {
            Value: view.as_ptr().cast(),
        };
        let ok = unsafe { UnmapViewOfFile(address) };
        if ok == 0 {
            return Err(ArenaError::MappingFailure(format!(
                "UnmapViewOfFile({:p}) failed: {}",
                view.as_ptr(),
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    fn reserve_hint(size: usize) -> ArenaResult<NonNull<u8>> {
        let ptr = unsafe { VirtualAlloc(std::ptr::null(), size, MEM_RESERVE, PAGE_NOACCESS) };
        let Some(base) = NonNull::new(ptr.cast::<u8>()) else {
            return Err(ArenaError::AddressHintUnavailable(format!(
                "VirtualAlloc(MEM_RESERVE, {size:#x}) failed: {}",
                std::io::Error::last_os_error()
            )));
        };
        let ok = unsafe { VirtualFree(ptr, 0, MEM_RELEASE) };
        if ok == 0 {
            return Err(ArenaError::AddressHintUnavailable(format!(
                "VirtualFree of probe reservation failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(base)
    }

    fn allocation_granularity() -> usize {
        let mut info: SYSTEM_INFO = unsafe { std::mem::zeroed() };
        unsafe { GetSystemInfo(&mut info) };
        usize::try_from(info.dwAllocationGranularity)
            .ok()
            .filter(|&granularity| granularity > 0)
            .unwrap_or(64 * 1024)
    }
}
