use crate::JitResult;
use crate::block::GuestAddr;

mod aarch64;
mod memory;
mod x86_64;

pub use aarch64::AArch64Patcher;
pub use memory::CodeBuffer;
pub use x86_64::X86_64Patcher;

/// Instruction-set specific writer for block entry and exit slots.
///
/// Every slot is `SLOT_LEN` bytes and holds one of two sequences:
/// a dispatch (load the guest pc for the dispatcher, branch to it) or a link
/// (branch straight into another block's entry). Encoders append to `code`
/// and never write more than `SLOT_LEN` bytes.
pub trait ExitPatcher {
    const NAME: &'static str;
    const SLOT_LEN: usize;

    fn encode_dispatch(
        code: &mut Vec<u8>,
        site: usize,
        guest_pc: GuestAddr,
        dispatcher: usize,
    ) -> JitResult<()>;

    fn encode_link(code: &mut Vec<u8>, site: usize, dest_entry: usize) -> JitResult<()>;

    fn encode_padding(code: &mut Vec<u8>, len: usize);
}

/// Destination for machine-code writes, normally an executable [`CodeBuffer`].
pub trait CodeMemory {
    fn write_code(&mut self, at: usize, bytes: &[u8]) -> JitResult<()>;
}

#[cfg(target_arch = "x86_64")]
pub type HostPatcher = X86_64Patcher;

#[cfg(target_arch = "aarch64")]
pub type HostPatcher = AArch64Patcher;

pub fn native_patching_supported() -> bool {
    cfg!(any(target_arch = "x86_64", target_arch = "aarch64"))
}
