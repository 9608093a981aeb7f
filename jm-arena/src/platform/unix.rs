use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
use std::ptr::NonNull;

use tracing::debug;

use super::PlatformMemoryMapper;
use crate::{ArenaError, ArenaResult};

pub(crate) struct UnixMapper;

#[cfg(target_os = "linux")]
const FIXED_VIEW_FLAGS: libc::c_int = libc::MAP_FIXED_NOREPLACE;
#[cfg(not(target_os = "linux"))]
const FIXED_VIEW_FLAGS: libc::c_int = 0;

impl PlatformMemoryMapper for UnixMapper {
    type Segment = OwnedFd;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    const NAME: &'static str = "memfd";
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    const NAME: &'static str = "posix-shm";

    fn create_segment(size: usize) -> ArenaResult<OwnedFd> {
        let fd = open_segment_fd()?;
        let len = libc::off_t::try_from(size).map_err(|_| {
            ArenaError::AllocationFailure(format!("segment size {size:#x} does not fit off_t"))
        })?;
        let rc = unsafe { libc::ftruncate(fd.as_raw_fd(), len) };
        if rc != 0 {
            return Err(ArenaError::AllocationFailure(format!(
                "ftruncate({size:#x}) failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(fd)
    }

    fn release_segment(segment: OwnedFd) -> ArenaResult<()> {
        let fd = segment.into_raw_fd();
        let rc = unsafe { libc::close(fd) };
        if rc != 0 {
            return Err(ArenaError::AllocationFailure(format!(
                "close({fd}) failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    fn map_view(
        segment: &OwnedFd,
        offset: usize,
        size: usize,
        desired: Option<NonNull<u8>>,
    ) -> ArenaResult<NonNull<u8>> {
        let file_offset = libc::off_t::try_from(offset).map_err(|_| {
            ArenaError::MappingFailure(format!("view offset {offset:#x} does not fit off_t"))
        })?;
        let (addr, flags) = match desired {
            Some(base) => (
                base.as_ptr().cast::<libc::c_void>(),
                libc::MAP_SHARED | FIXED_VIEW_FLAGS,
            ),
            None => (std::ptr::null_mut(), libc::MAP_SHARED),
        };
        let ptr = unsafe {
            libc::mmap(
                addr,
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                segment.as_raw_fd(),
                file_offset,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(ArenaError::MappingFailure(format!(
                "mmap({size:#x} @ segment+{offset:#x}) failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        // Kernels without a no-replace flag treat the address as a hint only.
        if let Some(base) = desired {
            if ptr != addr {
                unsafe { libc::munmap(ptr, size) };
                return Err(ArenaError::MappingFailure(format!(
                    "requested view at {:p} but the kernel placed it at {ptr:p}",
                    base.as_ptr()
                )));
            }
        }

        NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| ArenaError::MappingFailure("mmap returned a null view".to_string()))
    }

    unsafe fn unmap_view(view: NonNull<u8>, size: usize) -> ArenaResult<()> {
        let rc = unsafe { libc::munmap(view.as_ptr().cast::<libc::c_void>(), size) };
        if rc != 0 {
            return Err(ArenaError::MappingFailure(format!(
                "munmap({:p}, {size:#x}) failed: {}",
                view.as_ptr(),
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    fn reserve_hint(size: usize) -> ArenaResult<NonNull<u8>> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(ArenaError::AddressHintUnavailable(format!(
                "mmap(PROT_NONE, {size:#x}) failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        let rc = unsafe { libc::munmap(ptr, size) };
        if rc != 0 {
            return Err(ArenaError::AddressHintUnavailable(format!(
                "munmap of probe reservation failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        NonNull::new(ptr.cast::<u8>()).ok_or_else(|| {
            ArenaError::AddressHintUnavailable("probe reservation landed at null".to_string())
        })
    }

    fn allocation_granularity() -> usize {
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        usize::try_from(page).ok().filter(|&page| page > 0).unwrap_or(4096)
    }
}

#[cfg(target_os = "linux")]
fn open_segment_fd() -> ArenaResult<OwnedFd> {
    match open_memfd() {
        Ok(fd) => Ok(fd),
        Err(err) if err.raw_os_error() == Some(libc::ENOSYS) => {
            debug!("memfd_create unavailable, falling back to POSIX shared memory");
            open_posix_shm()
        }
        Err(err) => Err(ArenaError::AllocationFailure(format!(
            "memfd_create failed: {err}"
        ))),
    }
}

#[cfg(target_os = "android")]
fn open_segment_fd() -> ArenaResult<OwnedFd> {
    open_memfd()
        .map_err(|err| ArenaError::AllocationFailure(format!("memfd_create failed: {err}")))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn open_segment_fd() -> ArenaResult<OwnedFd> {
    open_posix_shm()
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn open_memfd() -> std::io::Result<OwnedFd> {
    let fd = unsafe { libc::memfd_create(c"jm-arena".as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    debug!(fd, "created memfd backing segment");
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

#[cfg(not(target_os = "android"))]
const SHM_NAME_ATTEMPTS: u32 = 10_000;

// shm_open is variadic on Apple targets, where mode_t is too narrow to pass.
#[cfg(target_vendor = "apple")]
const SHM_MODE: libc::c_uint = 0o600;
#[cfg(all(not(target_vendor = "apple"), not(target_os = "android")))]
const SHM_MODE: libc::mode_t = 0o600;

#[cfg(not(target_os = "android"))]
fn open_posix_shm() -> ArenaResult<OwnedFd> {
    let pid = std::process::id();
    for attempt in 0..SHM_NAME_ATTEMPTS {
        let name = std::ffi::CString::new(format!("/jm-arena.{pid}.{attempt}"))
            .map_err(|err| ArenaError::AllocationFailure(err.to_string()))?;
        let fd = unsafe {
            libc::shm_open(
                name.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                SHM_MODE,
            )
        };
        if fd >= 0 {
            // The object stays alive through the descriptor; drop the name at once.
            unsafe { libc::shm_unlink(name.as_ptr()) };
            debug!(fd, attempt, "created POSIX shared memory backing segment");
            return Ok(unsafe { OwnedFd::from_raw_fd(fd) });
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EEXIST) {
            return Err(ArenaError::AllocationFailure(format!(
                "shm_open({}) failed: {err}",
                name.to_string_lossy()
            )));
        }
    }
    Err(ArenaError::AllocationFailure(format!(
        "no free shared memory name after {SHM_NAME_ATTEMPTS} attempts"
    )))
}
