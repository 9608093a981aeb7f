use super::ExitPatcher;
use crate::block::GuestAddr;
use crate::{JitError, JitResult};

pub struct X86_64Patcher;

const JMP_REL32_LEN: usize = 5;
const MOV_EAX_IMM32_LEN: usize = 5;
const NOP5: [u8; 5] = [0x0F, 0x1F, 0x44, 0x00, 0x00];

impl ExitPatcher for X86_64Patcher {
    const NAME: &'static str = "x86_64";
    const SLOT_LEN: usize = MOV_EAX_IMM32_LEN + JMP_REL32_LEN;

    // mov eax, pc ; jmp dispatcher
    fn encode_dispatch(
        code: &mut Vec<u8>,
        site: usize,
        guest_pc: GuestAddr,
        dispatcher: usize,
    ) -> JitResult<()> {
        code.push(0xB8);
        code.extend_from_slice(&guest_pc.to_le_bytes());
        emit_jmp_rel32(code, site + MOV_EAX_IMM32_LEN, dispatcher)
    }

    // jmp dest ; nop5
    fn encode_link(code: &mut Vec<u8>, site: usize, dest_entry: usize) -> JitResult<()> {
        emit_jmp_rel32(code, site, dest_entry)?;
        code.extend_from_slice(&NOP5);
        Ok(())
    }

    fn encode_padding(code: &mut Vec<u8>, len: usize) {
        code.resize(code.len() + len, 0x90);
    }
}

fn emit_jmp_rel32(code: &mut Vec<u8>, at: usize, target: usize) -> JitResult<()> {
    let rel = target as i128 - (at as i128 + JMP_REL32_LEN as i128);
    let rel =
        i32::try_from(rel).map_err(|_| JitError::BranchOutOfRange { site: at, target })?;
    code.push(0xE9);
    code.extend_from_slice(&rel.to_le_bytes());
    Ok(())
}
