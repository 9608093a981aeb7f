use super::ExitPatcher;
use crate::block::GuestAddr;
use crate::{JitError, JitResult};

pub struct AArch64Patcher;

/// w0 carries the next guest pc into the dispatcher.
const DISPATCHER_PC_REG: u32 = 0;
const INSN_LEN: usize = 4;
const NOP: u32 = 0xD503_201F;

impl ExitPatcher for AArch64Patcher {
    const NAME: &'static str = "aarch64";
    const SLOT_LEN: usize = 3 * INSN_LEN;

    // movz w0, #lo ; movk w0, #hi, lsl #16 ; b dispatcher
    fn encode_dispatch(
        code: &mut Vec<u8>,
        site: usize,
        guest_pc: GuestAddr,
        dispatcher: usize,
    ) -> JitResult<()> {
        let lo = guest_pc & 0xFFFF;
        let hi = guest_pc >> 16;
        emit_u32(code, 0x5280_0000 | (lo << 5) | DISPATCHER_PC_REG);
        emit_u32(code, 0x72A0_0000 | (hi << 5) | DISPATCHER_PC_REG);
        emit_u32(code, encode_b(site + 2 * INSN_LEN, dispatcher)?);
        Ok(())
    }

    // b dest ; nop ; nop
    fn encode_link(code: &mut Vec<u8>, site: usize, dest_entry: usize) -> JitResult<()> {
        emit_u32(code, encode_b(site, dest_entry)?);
        emit_u32(code, NOP);
        emit_u32(code, NOP);
        Ok(())
    }

    fn encode_padding(code: &mut Vec<u8>, len: usize) {
        for _ in 0..len / INSN_LEN {
            emit_u32(code, NOP);
        }
    }
}

fn emit_u32(code: &mut Vec<u8>, insn: u32) {
    code.extend_from_slice(&insn.to_le_bytes());
}

fn encode_b(at: usize, target: usize) -> JitResult<u32> {
    let diff = target as i128 - at as i128;
    if diff % INSN_LEN as i128 != 0 {
        return Err(JitError::BranchOutOfRange { site: at, target });
    }
    let imm26 = diff / INSN_LEN as i128;
    if !(-(1 << 25)..(1 << 25)).contains(&imm26) {
        return Err(JitError::BranchOutOfRange { site: at, target });
    }
    Ok(0x1400_0000 | (imm26 as i32 as u32 & 0x03FF_FFFF))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insn(code: &[u8], index: usize) -> u32 {
        let at = index * INSN_LEN;
        u32::from_le_bytes([code[at], code[at + 1], code[at + 2], code[at + 3]])
    }

    fn b_offset(insn: u32) -> i64 {
        assert_eq!(insn & 0xFC00_0000, 0x1400_0000, "not a b instruction");
        let imm26 = (insn & 0x03FF_FFFF) as i64;
        let signed = if imm26 & (1 << 25) != 0 {
            imm26 - (1 << 26)
        } else {
            imm26
        };
        signed * 4
    }

    #[test]
    fn dispatch_materializes_pc_in_w0() {
        let mut code = Vec::new();
        AArch64Patcher::encode_dispatch(&mut code, 0x1000, 0x8000_1234, 0x0400)
            .expect("dispatch should encode");
        assert_eq!(code.len(), AArch64Patcher::SLOT_LEN);
        // movz w0, #0x1234
        assert_eq!(insn(&code, 0), 0x5282_4680);
        // movk w0, #0x8000, lsl #16
        assert_eq!(insn(&code, 1), 0x72B0_0000);
        assert_eq!(b_offset(insn(&code, 2)), 0x0400 - 0x1008);
    }

    #[test]
    fn link_branches_to_destination_and_pads_with_nops() {
        let mut code = Vec::new();
        AArch64Patcher::encode_link(&mut code, 0x2000, 0x3000).expect("link should encode");
        assert_eq!(code.len(), AArch64Patcher::SLOT_LEN);
        assert_eq!(b_offset(insn(&code, 0)), 0x1000);
        assert_eq!(insn(&code, 1), NOP);
        assert_eq!(insn(&code, 2), NOP);
    }

    #[test]
    fn self_link_encodes_zero_displacement() {
        let mut code = Vec::new();
        AArch64Patcher::encode_link(&mut code, 0x2000, 0x2000).expect("link should encode");
        assert_eq!(insn(&code, 0), 0x1400_0000);
    }

    #[test]
    fn unaligned_or_distant_targets_are_rejected() {
        let mut code = Vec::new();
        assert!(matches!(
            AArch64Patcher::encode_link(&mut code, 0x2000, 0x2002),
            Err(JitError::BranchOutOfRange { .. })
        ));
        assert!(matches!(
            AArch64Patcher::encode_link(&mut code, 0x0, 0x1000_0000),
            Err(JitError::BranchOutOfRange { .. })
        ));
    }

    #[test]
    fn padding_emits_whole_nops() {
        let mut code = Vec::new();
        AArch64Patcher::encode_padding(&mut code, 8);
        assert_eq!(code.len(), 8);
        assert_eq!(insn(&code, 0), NOP);
        assert_eq!(insn(&code, 1), NOP);
    }
}
