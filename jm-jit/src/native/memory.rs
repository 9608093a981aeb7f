use std::ptr::NonNull;

use super::{CodeMemory, ExitPatcher};
use crate::block::GuestAddr;
use crate::{JitError, JitResult};

/// Fixed-capacity executable region. Code is appended with [`CodeBuffer::emit`]
/// and patched in place through [`CodeMemory::write_code`]; the region is kept
/// non-writable between writes.
pub struct CodeBuffer {
    ptr: NonNull<u8>,
    capacity: usize,
    used: usize,
}

// The region is owned exclusively; all writes go through `&mut self`.
unsafe impl Send for CodeBuffer {}

/// Page protection a code buffer toggles between.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Access {
    Patch,
    Run,
}

impl CodeBuffer {
    pub fn with_capacity(capacity: usize) -> JitResult<Self> {
        if capacity == 0 {
            return Err(JitError::Native(
                "cannot create executable region with zero capacity".to_string(),
            ));
        }
        let buffer = Self {
            ptr: sys::map_region(capacity)?,
            capacity,
            used: 0,
        };
        // On failure the buffer drops here and its region is unmapped.
        buffer.set_access(Access::Run)?;
        tracing::debug!(
            base = %format!("{:#x}", buffer.base()),
            capacity,
            "allocated code buffer"
        );
        Ok(buffer)
    }

    pub fn base(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.used
    }

    /// Appends `bytes` and returns the host address they landed at.
    pub fn emit(&mut self, bytes: &[u8]) -> JitResult<usize> {
        let at = self.base() + self.used;
        if bytes.len() > self.capacity - self.used {
            return Err(JitError::SiteOutOfBounds {
                at,
                len: bytes.len(),
            });
        }
        self.used += bytes.len();
        if let Err(err) = self.write_code(at, bytes) {
            self.used -= bytes.len();
            return Err(err);
        }
        Ok(at)
    }

    /// Appends one dispatch slot that hands `guest_pc` to `dispatcher`.
    pub fn emit_dispatch_slot<P: ExitPatcher>(
        &mut self,
        guest_pc: GuestAddr,
        dispatcher: usize,
    ) -> JitResult<usize> {
        let at = self.base() + self.used;
        let mut code = Vec::with_capacity(P::SLOT_LEN);
        P::encode_dispatch(&mut code, at, guest_pc, dispatcher)?;
        self.emit(&code)
    }

    pub fn bytes(&self, at: usize, len: usize) -> JitResult<&[u8]> {
        let offset = self.checked_offset(at, len)?;
        Ok(unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(offset), len) })
    }

    fn checked_offset(&self, at: usize, len: usize) -> JitResult<usize> {
        let offset = at
            .checked_sub(self.base())
            .ok_or(JitError::SiteOutOfBounds { at, len })?;
        match offset.checked_add(len) {
            Some(end) if end <= self.used => Ok(offset),
            _ => Err(JitError::SiteOutOfBounds { at, len }),
        }
    }

    fn set_access(&self, access: Access) -> JitResult<()> {
        sys::protect_region(self.ptr, self.capacity, access)
    }

    /// Copies `bytes` to `offset` while the region is open for patching.
    fn store(&mut self, offset: usize, bytes: &[u8]) {
        let dst = unsafe { self.ptr.as_ptr().add(offset) };
        sys::with_thread_write_access(|| unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
        });
    }
}

impl CodeMemory for CodeBuffer {
    fn write_code(&mut self, at: usize, bytes: &[u8]) -> JitResult<()> {
        let offset = self.checked_offset(at, bytes.len())?;
        if bytes.is_empty() {
            return Ok(());
        }
        self.set_access(Access::Patch)?;
        self.store(offset, bytes);
        self.set_access(Access::Run)?;
        sys::sync_icache(at, bytes.len());
        Ok(())
    }
}

impl Drop for CodeBuffer {
    fn drop(&mut self) {
        if let Err(err) = sys::unmap_region(self.ptr, self.capacity) {
            tracing::warn!(
                error = %err,
                base = %format!("{:#x}", self.base()),
                "failed to unmap code buffer"
            );
        }
    }
}

#[cfg(unix)]
mod sys {
    use std::ptr::NonNull;

    use super::Access;
    use crate::{JitError, JitResult};

    fn os_error(call: &str) -> JitError {
        JitError::Native(format!("{call} failed: {}", std::io::Error::last_os_error()))
    }

    pub(super) fn map_region(len: usize) -> JitResult<NonNull<u8>> {
        // MAP_JIT regions stay RWX; writes are gated per thread instead.
        #[cfg(target_os = "macos")]
        let (prot, flags) = (
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_JIT,
        );
        #[cfg(not(target_os = "macos"))]
        let (prot, flags) = (
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_ANON | libc::MAP_PRIVATE,
        );

        let ptr = unsafe { libc::mmap(std::ptr::null_mut(), len, prot, flags, -1, 0) };
        if ptr == libc::MAP_FAILED {
            return Err(os_error("mmap"));
        }
        NonNull::new(ptr.cast()).ok_or_else(|| os_error("mmap"))
    }

    pub(super) fn unmap_region(ptr: NonNull<u8>, len: usize) -> JitResult<()> {
        if unsafe { libc::munmap(ptr.as_ptr().cast(), len) } != 0 {
            return Err(os_error("munmap"));
        }
        Ok(())
    }

    #[cfg(not(target_os = "macos"))]
    pub(super) fn protect_region(ptr: NonNull<u8>, len: usize, access: Access) -> JitResult<()> {
        let prot = match access {
            Access::Patch => libc::PROT_READ | libc::PROT_WRITE,
            Access::Run => libc::PROT_READ | libc::PROT_EXEC,
        };
        if unsafe { libc::mprotect(ptr.as_ptr().cast(), len, prot) } != 0 {
            return Err(os_error(match access {
                Access::Patch => "mprotect(rw)",
                Access::Run => "mprotect(rx)",
            }));
        }
        Ok(())
    }

    #[cfg(target_os = "macos")]
    pub(super) fn protect_region(_ptr: NonNull<u8>, _len: usize, _access: Access) -> JitResult<()> {
        Ok(())
    }

    #[cfg(target_os = "macos")]
    pub(super) fn with_thread_write_access(copy: impl FnOnce()) {
        let gated = unsafe { pthread_jit_write_protect_supported_np() } != 0;
        if gated {
            unsafe { pthread_jit_write_protect_np(0) };
        }
        copy();
        if gated {
            unsafe { pthread_jit_write_protect_np(1) };
        }
    }

    #[cfg(not(target_os = "macos"))]
    pub(super) fn with_thread_write_access(copy: impl FnOnce()) {
        copy();
    }

    #[cfg(target_os = "macos")]
    pub(super) fn sync_icache(at: usize, len: usize) {
        unsafe { sys_icache_invalidate(at as *mut libc::c_void, len) };
    }

    #[cfg(all(
        any(target_os = "linux", target_os = "android"),
        target_arch = "aarch64"
    ))]
    pub(super) fn sync_icache(at: usize, len: usize) {
        unsafe {
            __clear_cache(at as *mut libc::c_char, (at + len) as *mut libc::c_char);
        }
    }

    // x86 keeps instruction fetch coherent with stores.
    #[cfg(not(any(
        target_os = "macos",
        all(
            any(target_os = "linux", target_os = "android"),
            target_arch = "aarch64"
        )
    )))]
    pub(super) fn sync_icache(_at: usize, _len: usize) {}

    #[cfg(target_os = "macos")]
    unsafe extern "C" {
        fn pthread_jit_write_protect_supported_np() -> libc::c_int;
        fn pthread_jit_write_protect_np(enabled: libc::c_int);
        fn sys_icache_invalidate(start: *mut libc::c_void, len: libc::size_t);
    }

    #[cfg(all(
        any(target_os = "linux", target_os = "android"),
        target_arch = "aarch64"
    ))]
    unsafe extern "C" {
        fn __clear_cache(begin: *mut libc::c_char, end: *mut libc::c_char);
    }
}

#[cfg(target_os = "windows")]
mod sys {
    use std::ptr::NonNull;

    use windows_sys::Win32::System::Diagnostics::Debug::FlushInstructionCache;
    use windows_sys::Win32::System::Memory::{
        MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READ, PAGE_READWRITE, VirtualAlloc,
        VirtualFree, VirtualProtect,
    };
    use windows_sys::Win32::System::Threading::GetCurrentProcess;

    use super::Access;
    use crate::{JitError, JitResult};

    fn os_error(call: &str) -> JitError {
        JitError::Native(format!("{call} failed: {}", std::io::Error::last_os_error()))
    }

    pub(super) fn map_region(len: usize) -> JitResult<NonNull<u8>> {
        let ptr = unsafe {
            VirtualAlloc(std::ptr::null(), len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE)
        };
        NonNull::new(ptr.cast()).ok_or_else(|| os_error("VirtualAlloc"))
    }

    pub(super) fn unmap_region(ptr: NonNull<u8>, _len: usize) -> JitResult<()> {
        if unsafe { VirtualFree(ptr.as_ptr().cast(), 0, MEM_RELEASE) } == 0 {
            return Err(os_error("VirtualFree"));
        }
        Ok(())
    }

    pub(super) fn protect_region(ptr: NonNull<u8>, len: usize, access: Access) -> JitResult<()> {
        let prot = match access {
            Access::Patch => PAGE_READWRITE,
            Access::Run => PAGE_EXECUTE_READ,
        };
        let mut previous = 0u32;
        if unsafe { VirtualProtect(ptr.as_ptr() as *const _, len, prot, &mut previous) } == 0 {
            return Err(os_error("VirtualProtect"));
        }
        Ok(())
    }

    pub(super) fn with_thread_write_access(copy: impl FnOnce()) {
        copy();
    }

    pub(super) fn sync_icache(at: usize, len: usize) {
        let ok = unsafe { FlushInstructionCache(GetCurrentProcess(), at as *const _, len) };
        if ok == 0 {
            tracing::warn!(
                error = %std::io::Error::last_os_error(),
                "FlushInstructionCache failed"
            );
        }
    }
}

#[cfg(not(any(unix, target_os = "windows")))]
mod sys {
    use std::ptr::NonNull;

    use super::Access;
    use crate::{JitError, JitResult};

    pub(super) fn map_region(_len: usize) -> JitResult<NonNull<u8>> {
        Err(JitError::Native(
            "executable memory is not available on this platform".to_string(),
        ))
    }

    pub(super) fn unmap_region(_ptr: NonNull<u8>, _len: usize) -> JitResult<()> {
        Ok(())
    }

    pub(super) fn protect_region(_ptr: NonNull<u8>, _len: usize, _access: Access) -> JitResult<()> {
        Ok(())
    }

    pub(super) fn with_thread_write_access(copy: impl FnOnce()) {
        copy();
    }

    pub(super) fn sync_icache(_at: usize, _len: usize) {}
}

#[cfg(all(test, any(unix, target_os = "windows")))]
mod tests {
    use super::*;
    use crate::native::X86_64Patcher;

    #[test]
    fn emit_appends_and_reads_back() {
        let mut buffer = CodeBuffer::with_capacity(4096).expect("code buffer should allocate");
        let first = buffer.emit(&[0x90, 0x90]).expect("emit should fit");
        let second = buffer.emit(&[0xC3]).expect("emit should fit");
        assert_eq!(first, buffer.base());
        assert_eq!(second, buffer.base() + 2);
        assert_eq!(buffer.used(), 3);
        assert_eq!(
            buffer.bytes(first, 3).expect("bytes should be readable"),
            &[0x90, 0x90, 0xC3]
        );
    }

    #[test]
    fn writes_outside_emitted_code_are_rejected() {
        let mut buffer = CodeBuffer::with_capacity(64).expect("code buffer should allocate");
        let at = buffer.emit(&[0x90; 8]).expect("emit should fit");
        assert!(matches!(
            buffer.write_code(at + 4, &[0xCC; 8]),
            Err(JitError::SiteOutOfBounds { .. })
        ));
        assert!(matches!(
            buffer.write_code(at.wrapping_sub(1), &[0xCC]),
            Err(JitError::SiteOutOfBounds { .. })
        ));
        buffer.write_code(at + 4, &[0xCC; 4]).expect("patch inside code");
        assert_eq!(
            buffer.bytes(at, 8).expect("bytes should be readable"),
            &[0x90, 0x90, 0x90, 0x90, 0xCC, 0xCC, 0xCC, 0xCC]
        );
    }

    #[test]
    fn emit_past_capacity_fails_without_consuming_space() {
        let mut buffer = CodeBuffer::with_capacity(16).expect("code buffer should allocate");
        buffer.emit(&[0x90; 12]).expect("emit should fit");
        assert!(buffer.emit(&[0x90; 8]).is_err());
        assert_eq!(buffer.used(), 12);
    }

    #[test]
    fn dispatch_slot_matches_patcher_encoding() {
        let mut buffer = CodeBuffer::with_capacity(256).expect("code buffer should allocate");
        let dispatcher = buffer.emit(&[0xC3]).expect("emit should fit");
        let slot = buffer
            .emit_dispatch_slot::<X86_64Patcher>(0x1234, dispatcher)
            .expect("slot should fit");
        let mut expected = Vec::new();
        X86_64Patcher::encode_dispatch(&mut expected, slot, 0x1234, dispatcher)
            .expect("dispatch should encode");
        assert_eq!(
            buffer
                .bytes(slot, X86_64Patcher::SLOT_LEN)
                .expect("bytes should be readable"),
            expected.as_slice()
        );
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(
            CodeBuffer::with_capacity(0),
            Err(JitError::Native(_))
        ));
    }

    /// Protection bits of the mapping that contains `addr`, from
    /// `/proc/self/maps`.
    #[cfg(target_os = "linux")]
    fn mapping_perms(addr: usize) -> Option<String> {
        let maps = std::fs::read_to_string("/proc/self/maps").expect("maps should be readable");
        maps.lines().find_map(|line| {
            let (range, rest) = line.split_once(' ')?;
            let (start, end) = range.split_once('-')?;
            let start = usize::from_str_radix(start, 16).ok()?;
            let end = usize::from_str_radix(end, 16).ok()?;
            (start..end).contains(&addr).then(|| rest[..4].to_string())
        })
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn region_is_sealed_between_writes() {
        let mut buffer = CodeBuffer::with_capacity(4096).expect("code buffer should allocate");
        let base = buffer.base();
        assert_eq!(mapping_perms(base).as_deref(), Some("r-xp"));

        buffer.emit(&[0x90; 4]).expect("emit should fit");
        buffer.write_code(base, &[0xCC]).expect("patch inside code");
        assert_eq!(mapping_perms(base).as_deref(), Some("r-xp"));
        assert_eq!(buffer.bytes(base, 2).expect("bytes should be readable"), &[0xCC, 0x90]);
    }
}
