// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Execution of a decoded instruction against the register file and bus.
//!
//! Every memory access in this module goes through [`armsim_bus::Bus`] —
//! no load or store path bypasses it.

use crate::alu::{add_with_carry, asr_c, lsl_c, lsr_c, ror_c, sub_with_borrow};
use crate::registers::RegisterFile;
use armsim_abi::{FaultKind, EXC_SVCALL};
use armsim_bus::Bus;
use armsim_decoder::{AluOp, Hint, HiRegOp, Imm8Op, Instr, LoadStoreRegOp, ShiftOp};

/// What happened after executing one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    /// PC was not touched; the caller advances it by the instruction size.
    Advanced,
    /// PC was set explicitly by a plain branch (conditional/unconditional
    /// branch, `BL`, hi-register `ADD`/`MOV` into PC) that can never carry
    /// an EXC_RETURN value.
    Branched,
    /// PC was loaded from a register or memory (`BX`, `POP {..,PC}`) and so
    /// must be checked by the caller for the EXC_RETURN shape before being
    /// treated as an ordinary branch target. Carries the raw, unmasked
    /// value.
    BranchOrReturn(u32),
    /// `SVC` executed; the caller should mark SVCall pending.
    Svc(u8),
    /// `BKPT` executed; the caller decides whether a debugger is attached.
    Breakpoint(u8),
}

/// Executes one decoded instruction. `pc_before` is the address the
/// instruction was fetched from (used for PC-relative addressing, which
/// the architecture defines relative to `pc_before + 4`).
pub fn execute(
    instr: Instr,
    pc_before: u32,
    regs: &mut RegisterFile,
    bus: &mut Bus,
) -> Result<ExecOutcome, FaultKind> {
    use Instr::*;
    let pc_plus4 = pc_before.wrapping_add(4);

    match instr {
        ShiftImm { op, rd, rm, imm5 } => {
            let value = regs.read(rm as u32)?;
            let (result, carry) = match op {
                // LSL #0 is a plain MOV: the carry flag is left untouched,
                // unlike LSR/ASR #0 which the decoder already turned into
                // "shift by 32".
                ShiftOp::Lsl if imm5 == 0 => (value, regs.c()),
                ShiftOp::Lsl => lsl_c(value, imm5 as u32),
                ShiftOp::Lsr => lsr_c(value, if imm5 == 0 { 32 } else { imm5 as u32 }),
                ShiftOp::Asr => asr_c(value, if imm5 == 0 { 32 } else { imm5 as u32 }),
            };
            regs.write(rd as u32, result)?;
            regs.set_nz(result);
            regs.set_c(carry);
            Ok(ExecOutcome::Advanced)
        }

        AddSubReg { sub, rd, rn, rm } => {
            let a = regs.read(rn as u32)?;
            let b = regs.read(rm as u32)?;
            let (result, carry, overflow) =
                if sub { sub_with_borrow(a, b) } else { add_with_carry(a, b, false) };
            regs.write(rd as u32, result)?;
            regs.set_nz(result);
            regs.set_c(carry);
            regs.set_v(overflow);
            Ok(ExecOutcome::Advanced)
        }

        AddSubImm3 { sub, rd, rn, imm3 } => {
            let a = regs.read(rn as u32)?;
            let b = imm3 as u32;
            let (result, carry, overflow) =
                if sub { sub_with_borrow(a, b) } else { add_with_carry(a, b, false) };
            regs.write(rd as u32, result)?;
            regs.set_nz(result);
            regs.set_c(carry);
            regs.set_v(overflow);
            Ok(ExecOutcome::Advanced)
        }

        Imm8 { op, rdn, imm8 } => {
            let imm = imm8 as u32;
            match op {
                Imm8Op::Mov => {
                    regs.write(rdn as u32, imm)?;
                    regs.set_nz(imm);
                }
                Imm8Op::Cmp => {
                    let a = regs.read(rdn as u32)?;
                    let (result, carry, overflow) = sub_with_borrow(a, imm);
                    regs.set_nz(result);
                    regs.set_c(carry);
                    regs.set_v(overflow);
                }
                Imm8Op::Add => {
                    let a = regs.read(rdn as u32)?;
                    let (result, carry, overflow) = add_with_carry(a, imm, false);
                    regs.write(rdn as u32, result)?;
                    regs.set_nz(result);
                    regs.set_c(carry);
                    regs.set_v(overflow);
                }
                Imm8Op::Sub => {
                    let a = regs.read(rdn as u32)?;
                    let (result, carry, overflow) = sub_with_borrow(a, imm);
                    regs.write(rdn as u32, result)?;
                    regs.set_nz(result);
                    regs.set_c(carry);
                    regs.set_v(overflow);
                }
            }
            Ok(ExecOutcome::Advanced)
        }

        AluReg { op, rd, rm } => {
            execute_alu(op, rd, rm, regs)?;
            Ok(ExecOutcome::Advanced)
        }

        HiReg { op, rdn, rm } => {
            let b = regs.read(rm as u32)?;
            match op {
                HiRegOp::Add => {
                    let a = regs.read(rdn as u32)?;
                    let (result, _, _) = add_with_carry(a, b, false);
                    regs.write(rdn as u32, result)?;
                    if rdn == 15 {
                        regs.set_pc(result);
                        return Ok(ExecOutcome::Branched);
                    }
                }
                HiRegOp::Cmp => {
                    let a = regs.read(rdn as u32)?;
                    let (result, carry, overflow) = sub_with_borrow(a, b);
                    regs.set_nz(result);
                    regs.set_c(carry);
                    regs.set_v(overflow);
                }
                HiRegOp::Mov => {
                    regs.write(rdn as u32, b)?;
                    if rdn == 15 {
                        regs.set_pc(b);
                        return Ok(ExecOutcome::Branched);
                    }
                }
            }
            Ok(ExecOutcome::Advanced)
        }

        Bx { rm } => {
            let target = regs.read(rm as u32)?;
            if target & 1 == 0 {
                return Err(FaultKind::ArmStateUnsupported { target });
            }
            // Whether this is an exception return can only be told from the
            // full, unmasked value — the caller checks it before any bit-0
            // clearing happens.
            Ok(ExecOutcome::BranchOrReturn(target))
        }

        LdrLiteral { rt, imm8 } => {
            let base = (pc_plus4) & !0b11;
            let addr = base + (imm8 as u32) * 4;
            let value = bus.read(addr, 4)?;
            regs.write(rt as u32, value)?;
            Ok(ExecOutcome::Advanced)
        }

        LoadStoreReg { op, rt, rn, rm } => {
            let base = regs.read(rn as u32)?;
            let offset = regs.read(rm as u32)?;
            let addr = base.wrapping_add(offset);
            execute_load_store_reg(op, rt, addr, regs, bus)?;
            Ok(ExecOutcome::Advanced)
        }

        LoadStoreImm { rt, rn, imm5, byte, load } => {
            let base = regs.read(rn as u32)?;
            let scale = if byte { 1 } else { 4 };
            let addr = base.wrapping_add(imm5 as u32 * scale);
            if load {
                let width = if byte { 1 } else { 4 };
                check_alignment(addr, width)?;
                let value = bus.read(addr, width)?;
                regs.write(rt as u32, value)?;
            } else {
                let width = if byte { 1 } else { 4 };
                check_alignment(addr, width)?;
                let value = regs.read(rt as u32)?;
                bus.write(addr, width, value)?;
            }
            Ok(ExecOutcome::Advanced)
        }

        LoadStoreHalfImm { rt, rn, imm5, load } => {
            let base = regs.read(rn as u32)?;
            let addr = base.wrapping_add(imm5 as u32 * 2);
            check_alignment(addr, 2)?;
            if load {
                let value = bus.read(addr, 2)?;
                regs.write(rt as u32, value)?;
            } else {
                let value = regs.read(rt as u32)?;
                bus.write(addr, 2, value & 0xFFFF)?;
            }
            Ok(ExecOutcome::Advanced)
        }

        LoadStoreSpRel { rt, imm8, load } => {
            let base = regs.sp();
            let addr = base.wrapping_add(imm8 as u32 * 4);
            check_alignment(addr, 4)?;
            if load {
                let value = bus.read(addr, 4)?;
                regs.write(rt as u32, value)?;
            } else {
                let value = regs.read(rt as u32)?;
                bus.write(addr, 4, value)?;
            }
            Ok(ExecOutcome::Advanced)
        }

        AddPcOrSp { rd, imm8, sp } => {
            let base = if sp { regs.sp() } else { pc_plus4 & !0b11 };
            let result = base.wrapping_add(imm8 as u32 * 4);
            regs.write(rd as u32, result)?;
            Ok(ExecOutcome::Advanced)
        }

        AddSubSp { sub, imm7 } => {
            let base = regs.sp();
            let delta = imm7 as u32 * 4;
            let result = if sub { base.wrapping_sub(delta) } else { base.wrapping_add(delta) };
            regs.set_sp(result);
            Ok(ExecOutcome::Advanced)
        }

        PushPop { push, reg_list } => {
            if push {
                execute_push(reg_list, regs, bus)?;
                Ok(ExecOutcome::Advanced)
            } else {
                match execute_pop(reg_list, regs, bus)? {
                    Some(pc_value) => Ok(ExecOutcome::BranchOrReturn(pc_value)),
                    None => Ok(ExecOutcome::Advanced),
                }
            }
        }

        Stm { rn, reg_list } => {
            let mut addr = regs.read(rn as u32)?;
            for i in 0..8u32 {
                if reg_list & (1 << i) != 0 {
                    let value = regs.read(i)?;
                    bus.write(addr, 4, value)?;
                    addr = addr.wrapping_add(4);
                }
            }
            regs.write(rn as u32, addr)?;
            Ok(ExecOutcome::Advanced)
        }

        Ldm { rn, reg_list } => {
            let mut addr = regs.read(rn as u32)?;
            let rn_in_list = reg_list & (1 << rn) != 0;
            for i in 0..8u32 {
                if reg_list & (1 << i) != 0 {
                    let value = bus.read(addr, 4)?;
                    regs.write(i, value)?;
                    addr = addr.wrapping_add(4);
                }
            }
            if !rn_in_list {
                regs.write(rn as u32, addr)?;
            }
            Ok(ExecOutcome::Advanced)
        }

        BCond { cond, imm } => {
            if condition_holds(cond, regs) {
                regs.set_pc(pc_plus4.wrapping_add(imm as u32));
                Ok(ExecOutcome::Branched)
            } else {
                Ok(ExecOutcome::Advanced)
            }
        }

        BUncond { imm } => {
            regs.set_pc(pc_plus4.wrapping_add(imm as u32));
            Ok(ExecOutcome::Branched)
        }

        Svc { imm8 } => Ok(ExecOutcome::Svc(imm8)),

        Bl { imm } => {
            let return_addr = pc_plus4 | 1;
            regs.set_lr(return_addr);
            regs.set_pc(pc_plus4.wrapping_add(imm as u32));
            Ok(ExecOutcome::Branched)
        }

        Bkpt { imm8 } => Ok(ExecOutcome::Breakpoint(imm8)),

        Hint(_hint) => Ok(ExecOutcome::Advanced),

        Undefined => Err(FaultKind::DecodeError { opcode: 0, pc: pc_before }),
    }
}

fn execute_alu(op: AluOp, rd: u8, rm: u8, regs: &mut RegisterFile) -> Result<(), FaultKind> {
    let a = regs.read(rd as u32)?;
    let b = regs.read(rm as u32)?;
    match op {
        AluOp::And => {
            let r = a & b;
            regs.write(rd as u32, r)?;
            regs.set_nz(r);
        }
        AluOp::Eor => {
            let r = a ^ b;
            regs.write(rd as u32, r)?;
            regs.set_nz(r);
        }
        AluOp::LslReg => {
            // A zero shift amount (any of LSL/LSR/ASR/ROR) is a no-op that
            // leaves the carry flag exactly as it was.
            let amount = b & 0xFF;
            let (r, c) = if amount == 0 { (a, regs.c()) } else { lsl_c(a, amount) };
            regs.write(rd as u32, r)?;
            regs.set_nz(r);
            regs.set_c(c);
        }
        AluOp::LsrReg => {
            let amount = b & 0xFF;
            let (r, c) = if amount == 0 { (a, regs.c()) } else { lsr_c(a, amount) };
            regs.write(rd as u32, r)?;
            regs.set_nz(r);
            regs.set_c(c);
        }
        AluOp::AsrReg => {
            let amount = b & 0xFF;
            let (r, c) = if amount == 0 { (a, regs.c()) } else { asr_c(a, amount) };
            regs.write(rd as u32, r)?;
            regs.set_nz(r);
            regs.set_c(c);
        }
        AluOp::Adc => {
            let (r, c, v) = add_with_carry(a, b, regs.c());
            regs.write(rd as u32, r)?;
            regs.set_nz(r);
            regs.set_c(c);
            regs.set_v(v);
        }
        AluOp::Sbc => {
            let (r, c, v) = add_with_carry(a, !b, regs.c());
            regs.write(rd as u32, r)?;
            regs.set_nz(r);
            regs.set_c(c);
            regs.set_v(v);
        }
        AluOp::Ror => {
            let amount = b & 0xFF;
            let (r, c) = if amount == 0 { (a, regs.c()) } else { ror_c(a, amount) };
            regs.write(rd as u32, r)?;
            regs.set_nz(r);
            regs.set_c(c);
        }
        AluOp::Tst => {
            let r = a & b;
            regs.set_nz(r);
        }
        AluOp::Neg => {
            let (r, c, v) = sub_with_borrow(0, b);
            regs.write(rd as u32, r)?;
            regs.set_nz(r);
            regs.set_c(c);
            regs.set_v(v);
        }
        AluOp::Cmp => {
            let (r, c, v) = sub_with_borrow(a, b);
            regs.set_nz(r);
            regs.set_c(c);
            regs.set_v(v);
        }
        AluOp::Cmn => {
            let (r, c, v) = add_with_carry(a, b, false);
            regs.set_nz(r);
            regs.set_c(c);
            regs.set_v(v);
        }
        AluOp::Orr => {
            let r = a | b;
            regs.write(rd as u32, r)?;
            regs.set_nz(r);
        }
        AluOp::Mul => {
            // N and Z only; C/V are left unchanged on ARMv6-M.
            let r = a.wrapping_mul(b);
            regs.write(rd as u32, r)?;
            regs.set_nz(r);
        }
        AluOp::Bic => {
            let r = a & !b;
            regs.write(rd as u32, r)?;
            regs.set_nz(r);
        }
        AluOp::Mvn => {
            let r = !b;
            regs.write(rd as u32, r)?;
            regs.set_nz(r);
        }
    }
    Ok(())
}

fn execute_load_store_reg(
    op: LoadStoreRegOp,
    rt: u8,
    addr: u32,
    regs: &mut RegisterFile,
    bus: &mut Bus,
) -> Result<(), FaultKind> {
    match op {
        LoadStoreRegOp::Str => {
            check_alignment(addr, 4)?;
            let value = regs.read(rt as u32)?;
            bus.write(addr, 4, value)?;
        }
        LoadStoreRegOp::Strh => {
            check_alignment(addr, 2)?;
            let value = regs.read(rt as u32)?;
            bus.write(addr, 2, value & 0xFFFF)?;
        }
        LoadStoreRegOp::Strb => {
            let value = regs.read(rt as u32)?;
            bus.write(addr, 1, value & 0xFF)?;
        }
        LoadStoreRegOp::Ldrsb => {
            let value = bus.read(addr, 1)? as u8 as i8 as i32 as u32;
            regs.write(rt as u32, value)?;
        }
        LoadStoreRegOp::Ldr => {
            check_alignment(addr, 4)?;
            let value = bus.read(addr, 4)?;
            regs.write(rt as u32, value)?;
        }
        LoadStoreRegOp::Ldrh => {
            check_alignment(addr, 2)?;
            let value = bus.read(addr, 2)?;
            regs.write(rt as u32, value)?;
        }
        LoadStoreRegOp::Ldrb => {
            let value = bus.read(addr, 1)?;
            regs.write(rt as u32, value)?;
        }
        LoadStoreRegOp::Ldrsh => {
            check_alignment(addr, 2)?;
            let value = bus.read(addr, 2)? as u16 as i16 as i32 as u32;
            regs.write(rt as u32, value)?;
        }
    }
    Ok(())
}

fn check_alignment(addr: u32, width: u8) -> Result<(), FaultKind> {
    let mask = width as u32 - 1;
    if addr & mask != 0 {
        return Err(FaultKind::AlignmentError { address: addr, width });
    }
    Ok(())
}

/// PUSH stores the lowest-numbered register at the lowest address,
/// regardless of traversal direction; LR is included when the decoder's
/// `R` bit set it in the register list.
fn execute_push(reg_list: u16, regs: &mut RegisterFile, bus: &mut Bus) -> Result<(), FaultKind> {
    let count = reg_list.count_ones();
    let mut addr = regs.sp().wrapping_sub(count * 4);
    let start = addr;
    for i in 0..16u32 {
        if reg_list & (1 << i) != 0 {
            let value = regs.read(i)?;
            bus.write(addr, 4, value)?;
            addr = addr.wrapping_add(4);
        }
    }
    regs.set_sp(start);
    Ok(())
}

/// Returns `true` if PC (bit 15 of `reg_list`) was loaded.
/// Pops the registers named in `reg_list`. Returns the raw, unmasked value
/// loaded into PC (without writing it to `regs`) so the caller can tell an
/// EXC_RETURN value from an ordinary return address before any bit-0
/// clearing happens, matching `Bx`'s contract.
fn execute_pop(reg_list: u16, regs: &mut RegisterFile, bus: &mut Bus) -> Result<Option<u32>, FaultKind> {
    let mut addr = regs.sp();
    let mut pc_value = None;
    for i in 0..16u32 {
        if reg_list & (1 << i) != 0 {
            let value = bus.read(addr, 4)?;
            if i == 15 {
                pc_value = Some(value);
            } else {
                regs.write(i, value)?;
            }
            addr = addr.wrapping_add(4);
        }
    }
    regs.set_sp(addr);
    Ok(pc_value)
}

/// Full condition decoding: all fourteen ARMv6-M conditions, not just
/// `EQ`/`NE`/`AL`.
fn condition_holds(cond: u8, regs: &RegisterFile) -> bool {
    match cond {
        0x0 => regs.z(),
        0x1 => !regs.z(),
        0x2 => regs.c(),
        0x3 => !regs.c(),
        0x4 => regs.n(),
        0x5 => !regs.n(),
        0x6 => regs.v(),
        0x7 => !regs.v(),
        0x8 => regs.c() && !regs.z(),
        0x9 => !regs.c() || regs.z(),
        0xA => regs.n() == regs.v(),
        0xB => regs.n() != regs.v(),
        0xC => !regs.z() && (regs.n() == regs.v()),
        0xD => regs.z() || (regs.n() != regs.v()),
        0xE => true,
        _ => true,
    }
}

pub const SVCALL_EXCEPTION: u16 = EXC_SVCALL;
