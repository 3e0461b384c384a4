// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The six concrete end-to-end scenarios, each built as a standalone
//! program against a full `Cpu` + `Bus` fixture rather than calling
//! `execute` directly, so the reset/fetch/decode/execute/retire sequence
//! is exercised the way a loaded firmware image would see it.

use armsim_bus::{Bus, Memory};
use armsim_cpu::{Cpu, StepOutcome};

fn make_bus(ram_size: u32) -> Bus {
    let mut bus = Bus::new();
    bus.add_device("ram", 0, ram_size, true, Box::new(Memory::new(ram_size))).unwrap();
    bus
}

#[test]
fn reset_vector_bring_up() {
    let mut bus = make_bus(0x2000);
    bus.write(0, 4, 0x2000_1000).unwrap();
    bus.write(4, 4, 0x0000_0009).unwrap();

    let mut cpu = Cpu::new(0);
    cpu.step(&mut bus);

    assert_eq!(cpu.regs.msp(), 0x2000_1000);
    assert_eq!(cpu.regs.pc(), 0x0000_0008);
    assert_eq!(cpu.regs.xpsr() & (1 << 24), 1 << 24);
}

#[test]
fn immediate_move_and_add() {
    let mut bus = make_bus(0x2000);
    bus.write(0, 4, 0x2000_1000).unwrap();
    bus.write(4, 4, 0x10).unwrap();
    bus.write(0x10, 2, 0x2005).unwrap(); // MOVS R0, #5
    bus.write(0x12, 2, 0x2107).unwrap(); // MOVS R1, #7
    bus.write(0x14, 2, 0x1842).unwrap(); // ADDS R2, R0, R1

    let mut cpu = Cpu::new(0);
    cpu.step(&mut bus); // reset bring-up, lands at 0x10
    assert_eq!(cpu.step(&mut bus), StepOutcome::Retired);
    assert_eq!(cpu.step(&mut bus), StepOutcome::Retired);
    assert_eq!(cpu.step(&mut bus), StepOutcome::Retired);

    assert_eq!(cpu.regs.read(0).unwrap(), 5);
    assert_eq!(cpu.regs.read(1).unwrap(), 7);
    assert_eq!(cpu.regs.read(2).unwrap(), 12);
    assert!(!cpu.regs.z());
    assert!(!cpu.regs.n());
    assert!(!cpu.regs.c());
    assert!(!cpu.regs.v());
}

#[test]
fn pc_relative_load_and_store() {
    let mut bus = make_bus(0x2000);
    bus.write(0, 4, 0x2000_1000).unwrap();
    bus.write(4, 4, 0x10).unwrap();
    // LDR R0, [PC, #0xF8] at pc=0x10 -> base=(0x10+4)&~3=0x14, addr=0x14+0xF8=0x10C
    bus.write(0x10C, 4, 0xCAFE_BABE).unwrap();
    bus.write(0x10, 2, 0x48 << 8 | 0xF8 / 4).unwrap(); // LDR R0, [PC, #0xF8]
    bus.write(0x12, 2, 0x6008).unwrap(); // STR R0, [R1, #0]

    let mut cpu = Cpu::new(0);
    cpu.step(&mut bus); // reset bring-up
    cpu.regs.write(1, 0x200).unwrap();
    assert_eq!(cpu.step(&mut bus), StepOutcome::Retired);
    assert_eq!(cpu.regs.read(0).unwrap(), 0xCAFE_BABE);
    assert_eq!(cpu.step(&mut bus), StepOutcome::Retired);
    assert_eq!(bus.read(0x200, 4).unwrap(), 0xCAFE_BABE);
}

#[test]
fn conditional_branch_taken() {
    let mut bus = make_bus(0x2000);
    bus.write(0, 4, 0x2000_1000).unwrap();
    bus.write(4, 4, 0x10).unwrap();
    bus.write(0x10, 2, 0x2000).unwrap(); // MOVS R0, #0 (sets Z)
    bus.write(0x12, 2, 0xD001).unwrap(); // BEQ +4

    let mut cpu = Cpu::new(0);
    cpu.step(&mut bus); // reset bring-up
    assert_eq!(cpu.step(&mut bus), StepOutcome::Retired);
    assert!(cpu.regs.z());
    let pc_before_branch = cpu.regs.pc();
    assert_eq!(cpu.step(&mut bus), StepOutcome::Retired);
    assert_eq!(cpu.regs.pc(), pc_before_branch + 4 + 2);
}

#[test]
fn push_pop_round_trip() {
    let mut bus = make_bus(0x2000);
    bus.write(0, 4, 0x2000_1000).unwrap();
    bus.write(4, 4, 0x10).unwrap();
    // PUSH {R0,R1,R4,LR}: 1011_0101_0001_0011
    bus.write(0x10, 2, 0b1011_0101_0001_0011).unwrap();
    // POP {R0,R1,R4,PC}: 1011_1101_0001_0011
    bus.write(0x12, 2, 0b1011_1101_0001_0011).unwrap();

    let mut cpu = Cpu::new(0);
    cpu.step(&mut bus); // reset bring-up
    cpu.regs.write(0, 0xA).unwrap();
    cpu.regs.write(1, 0xB).unwrap();
    cpu.regs.write(4, 0xC).unwrap();
    cpu.regs.set_lr(0xDEAD_BEEF);

    assert_eq!(cpu.step(&mut bus), StepOutcome::Retired); // PUSH
    assert_eq!(cpu.regs.msp(), 0x2000_1000 - 16);

    cpu.regs.write(0, 0).unwrap();
    cpu.regs.write(1, 0).unwrap();
    cpu.regs.write(4, 0).unwrap();

    assert_eq!(cpu.step(&mut bus), StepOutcome::Retired); // POP
    assert_eq!(cpu.regs.msp(), 0x2000_1000);
    assert_eq!(cpu.regs.read(0).unwrap(), 0xA);
    assert_eq!(cpu.regs.read(1).unwrap(), 0xB);
    assert_eq!(cpu.regs.read(4).unwrap(), 0xC);
    assert_eq!(cpu.regs.pc(), 0xDEAD_BEEE); // bit 0 cleared
}

#[test]
fn exception_entry_and_return() {
    let mut bus = make_bus(0x2000);
    bus.write(0, 4, 0x2000_1000).unwrap();
    bus.write(4, 4, 0x10).unwrap();
    bus.write(60, 4, 0x40).unwrap(); // vector[15] = SysTick handler
    bus.write(0x40, 2, 0x4770).unwrap(); // BX LR

    let mut cpu = Cpu::new(0);
    cpu.step(&mut bus); // reset bring-up
    let pc_before = cpu.regs.pc();
    let sp_before = cpu.regs.msp();

    {
        let nvic = cpu.nvic_handle();
        let mut nvic = nvic.borrow_mut();
        nvic.set_enabled(armsim_abi::EXC_SYSTICK, true);
        nvic.set_pending(armsim_abi::EXC_SYSTICK);
    }

    let outcome = cpu.step(&mut bus);
    assert_eq!(outcome, StepOutcome::ExceptionEntered(armsim_abi::EXC_SYSTICK));
    assert_eq!(cpu.regs.lr(), 0xFFFF_FFF9);
    assert_eq!(cpu.regs.pc(), 0x40);
    assert_eq!(cpu.regs.isr_number(), armsim_abi::EXC_SYSTICK);

    let outcome = cpu.step(&mut bus); // BX LR
    assert_eq!(outcome, StepOutcome::ExceptionReturned);
    assert_eq!(cpu.regs.pc(), pc_before);
    assert_eq!(cpu.regs.msp(), sp_before);
    assert_eq!(cpu.regs.lr(), 0xFFFF_FFF9);
    assert_eq!(cpu.regs.isr_number(), 0);
    assert!(!cpu.nvic().is_active(armsim_abi::EXC_SYSTICK));
}
