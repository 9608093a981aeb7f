mod block;
mod cache;
mod error;
pub mod native;

pub use block::{BlockExit, BlockId, BlockState, ExitKind, ExitSite, GuestAddr, HostRange, JitBlock};
pub use cache::{BlockCache, BlockCacheConfig, BlockCacheSnapshot, BlockCacheStats, SharedBlockCache};
pub use error::{JitError, JitResult};
pub use native::{
    AArch64Patcher, CodeBuffer, CodeMemory, ExitPatcher, X86_64Patcher, native_patching_supported,
};

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub use native::HostPatcher;
