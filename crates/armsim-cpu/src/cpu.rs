// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The CPU step loop: reset-from-vector-table bring-up, the per-instruction
//! exception check / fetch / decode / execute sequence, and exception
//! entry/return.

use std::cell::RefCell;
use std::rc::Rc;

use crate::execute::{execute, ExecOutcome};
use crate::nvic::Nvic;
use crate::registers::RegisterFile;
use armsim_abi::{
    looks_like_exc_return, ExceptionNumber, FaultKind, EXC_HARDFAULT, EXC_RETURN_HANDLER_MSP,
    EXC_RETURN_THREAD_MSP, EXC_RETURN_THREAD_PSP, EXC_SVCALL,
};
use armsim_bus::Bus;
use armsim_decoder::{decode16, decode_bl, is_32bit_prefix};

/// What a single `step` call did, for the driver and GDB collaborator to
/// react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Retired,
    ExceptionEntered(ExceptionNumber),
    ExceptionReturned,
    Breakpoint(u8),
    /// A fault the architecture cannot resolve; the driver should stop the
    /// simulation.
    Halted(FaultKind),
}

pub struct Cpu {
    pub regs: RegisterFile,
    /// Shared with any `NvicMmio`/peripheral registered on the bus so that
    /// software writes to ISER/ICER/ISPR/ICPR and peripheral `set_pending`
    /// calls are visible to the CPU's own pre-fetch exception check.
    nvic: Rc<RefCell<Nvic>>,
    reset_done: bool,
}

impl Cpu {
    pub fn new(reset_msp: u32) -> Self {
        Self {
            regs: RegisterFile::new(reset_msp),
            nvic: Rc::new(RefCell::new(Nvic::new())),
            reset_done: false,
        }
    }

    /// Returns a handle sharing this CPU's NVIC state, for wiring up the
    /// NVIC's own MMIO register window and peripherals that raise
    /// exceptions (timer, SysTick) onto the bus alongside the CPU.
    pub fn nvic_handle(&self) -> Rc<RefCell<Nvic>> {
        Rc::clone(&self.nvic)
    }

    /// Read-only access to NVIC state for inspection (tests, GDB queries).
    pub fn nvic(&self) -> std::cell::Ref<'_, Nvic> {
        self.nvic.borrow()
    }

    /// Reads the initial MSP and reset vector from the vector table.
    /// Falls back to zero with a warning if either fetch fails, rather than
    /// refusing to start — a firmware image that has not yet populated its
    /// vector table should still be inspectable under the debugger.
    fn reset_from_vector_table(&mut self, bus: &mut Bus) {
        self.regs.reset();
        self.nvic.borrow_mut().reset();
        let initial_msp = bus.debug_read(0, 4).unwrap_or_else(|_| {
            log::warn!("reset: could not read initial MSP from address 0, using 0");
            0
        });
        let reset_vector = bus.debug_read(4, 4).unwrap_or_else(|_| {
            log::warn!("reset: could not read reset vector from address 4, using 0");
            0
        });
        self.regs.set_msp(initial_msp);
        self.regs.set_pc(reset_vector);
        log::info!("reset: msp={initial_msp:#010x} pc={:#010x}", self.regs.pc());
    }

    /// Advances the simulation by exactly one instruction, or by one
    /// exception entry/return if one is due. Performs the one-time
    /// reset-from-vector bring-up on the first call.
    pub fn step(&mut self, bus: &mut Bus) -> StepOutcome {
        if !self.reset_done {
            self.reset_from_vector_table(bus);
            self.reset_done = true;
        }

        if let Some(exception) = self.nvic.borrow().next_exception(self.regs.primask()) {
            return self.enter_exception(exception, bus);
        }

        let pc = self.regs.pc();
        let h1 = match bus.read(pc, 2) {
            Ok(v) => v as u16,
            Err(fault) => return self.fault(fault, bus),
        };

        let (instr, is_32bit) = if is_32bit_prefix(h1) {
            let h2 = match bus.read(pc.wrapping_add(2), 2) {
                Ok(v) => v as u16,
                Err(fault) => return self.fault(fault, bus),
            };
            match decode_bl(h1, h2) {
                Ok(instr) => (instr, true),
                Err(fault) => return self.fault(fault, bus),
            }
        } else {
            (decode16(h1), false)
        };

        match execute(instr, pc, &mut self.regs, bus) {
            Ok(ExecOutcome::Advanced) => {
                self.regs.set_pc(pc.wrapping_add(if is_32bit { 4 } else { 2 }));
                StepOutcome::Retired
            }
            Ok(ExecOutcome::Branched) => StepOutcome::Retired,
            Ok(ExecOutcome::BranchOrReturn(target)) => {
                if looks_like_exc_return(target) {
                    self.exception_return(bus, target)
                } else {
                    self.regs.set_pc(target);
                    StepOutcome::Retired
                }
            }
            Ok(ExecOutcome::Svc(_imm)) => {
                self.regs.set_pc(pc.wrapping_add(if is_32bit { 4 } else { 2 }));
                self.nvic.borrow_mut().set_pending(EXC_SVCALL);
                StepOutcome::Retired
            }
            Ok(ExecOutcome::Breakpoint(code)) => {
                self.regs.set_pc(pc.wrapping_add(2));
                StepOutcome::Breakpoint(code)
            }
            Err(fault) => self.fault(fault, bus),
        }
    }

    fn fault(&mut self, fault: FaultKind, bus: &mut Bus) -> StepOutcome {
        if !fault.is_recoverable() {
            log::error!("halted: {fault}");
            return StepOutcome::Halted(fault);
        }
        if self.nvic.borrow().is_active(EXC_HARDFAULT) {
            log::error!("halted: {} while HardFault already active (lockup)", fault);
            return StepOutcome::Halted(FaultKind::NestedFault);
        }
        log::warn!("escalating to HardFault: {fault}");
        self.nvic.borrow_mut().set_pending(EXC_HARDFAULT);
        self.enter_exception(EXC_HARDFAULT, bus)
    }

    /// Pushes the 8-word exception stack frame and dispatches to the
    /// handler, selecting among the three EXC_RETURN values based on the
    /// mode and stack being exited.
    fn enter_exception(&mut self, exception: ExceptionNumber, bus: &mut Bus) -> StepOutcome {
        let return_addr = self.regs.pc();
        let frame_sp = self.regs.sp().wrapping_sub(32);

        let words = [
            self.regs.read(0).unwrap_or(0),
            self.regs.read(1).unwrap_or(0),
            self.regs.read(2).unwrap_or(0),
            self.regs.read(3).unwrap_or(0),
            self.regs.read(12).unwrap_or(0),
            self.regs.lr(),
            return_addr,
            (self.regs.xpsr() & !0x1FF) | exception as u32,
        ];
        for (i, word) in words.iter().enumerate() {
            if let Err(fault) = bus.write(frame_sp + (i as u32) * 4, 4, *word) {
                return self.fault(fault, bus);
            }
        }
        self.regs.set_sp(frame_sp);

        let was_handler_mode = self.regs.isr_number() != 0;
        let was_psp = self.regs.spsel();
        self.regs.set_lr(if was_handler_mode {
            EXC_RETURN_HANDLER_MSP
        } else if was_psp {
            EXC_RETURN_THREAD_PSP
        } else {
            EXC_RETURN_THREAD_MSP
        });

        self.regs.set_spsel(false); // handler mode always uses MSP
        self.regs.set_isr_number(exception);
        self.nvic.borrow_mut().activate(exception);

        let vector_addr = 4u32 * exception as u32;
        match bus.debug_read(vector_addr, 4) {
            Ok(handler) => {
                self.regs.set_pc(handler);
                log::info!("exception {exception} entered, handler={handler:#010x}");
                StepOutcome::ExceptionEntered(exception)
            }
            Err(fault) => self.fault(fault, bus),
        }
    }

    /// Unwinds the 8-word frame and restores the pre-exception mode.
    /// `self.regs.pc()` holds the EXC_RETURN value on entry, having just
    /// been written by `Bx`, `Ldm`, or `PushPop`'s pop-into-PC path.
    fn exception_return(&mut self, bus: &mut Bus, exc_return: u32) -> StepOutcome {
        let use_psp = exc_return == EXC_RETURN_THREAD_PSP;
        // Exiting handler mode always returns to MSP except the PSP case.
        self.regs.set_spsel(use_psp);
        let frame_sp = self.regs.sp();

        let mut words = [0u32; 8];
        for (i, word) in words.iter_mut().enumerate() {
            match bus.read(frame_sp + (i as u32) * 4, 4) {
                Ok(v) => *word = v,
                Err(fault) => return self.fault(fault, bus),
            }
        }
        let _ = self.regs.write(0, words[0]);
        let _ = self.regs.write(1, words[1]);
        let _ = self.regs.write(2, words[2]);
        let _ = self.regs.write(3, words[3]);
        let _ = self.regs.write(12, words[4]);
        self.regs.set_lr(words[5]);
        let return_pc = words[6];
        let xpsr = words[7];
        self.regs.set_sp(frame_sp + 32);

        let returning_exception = self.regs.isr_number();
        self.nvic.borrow_mut().deactivate(returning_exception);
        self.regs.set_xpsr(xpsr & !0x1FF); // ISR_NUMBER recomputed below
        self.regs.set_isr_number(0);
        if exc_return == EXC_RETURN_HANDLER_MSP {
            // Returning into a still-active outer handler: restore its
            // exception number so execution priority is computed correctly.
            self.regs.set_isr_number((xpsr & 0x1FF) as u16);
        }
        self.regs.set_pc(return_pc);
        log::info!("exception return to {return_pc:#010x}");
        StepOutcome::ExceptionReturned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armsim_bus::Memory;

    fn make_bus(ram_size: u32) -> Bus {
        let mut bus = Bus::new();
        bus.add_device("ram", 0, ram_size, true, Box::new(Memory::new(ram_size))).unwrap();
        bus
    }

    #[test]
    fn reset_reads_vector_table() {
        let mut bus = make_bus(0x2000);
        bus.write(0, 4, 0x2000_1000).unwrap();
        bus.write(4, 4, 0x0000_0009).unwrap(); // thumb bit set
        let mut cpu = Cpu::new(0);
        cpu.step(&mut bus);
        assert_eq!(cpu.regs.msp(), 0x2000_1000);
        assert_eq!(cpu.regs.pc(), 0x0000_0008);
    }

    #[test]
    fn exception_entry_and_return_restores_state() {
        let mut bus = make_bus(0x2000);
        bus.write(0, 4, 0x2000_1000).unwrap();
        bus.write(4, 4, 0x10).unwrap(); // reset vector -> address 0x10
        // handler for SysTick (exception 15) at vector word 15 -> address 60
        bus.write(60, 4, 0x40).unwrap();
        // reset handler: just a NOP loop target; SysTick handler: BX LR
        bus.write(0x40, 2, 0x4770).unwrap(); // BX LR

        let mut cpu = Cpu::new(0);
        cpu.step(&mut bus); // performs reset bring-up
        let pc_before = cpu.regs.pc();
        let sp_before = cpu.regs.sp();

        {
            let nvic = cpu.nvic_handle();
            let mut nvic = nvic.borrow_mut();
            nvic.set_enabled(armsim_abi::EXC_SYSTICK, true);
            nvic.set_pending(armsim_abi::EXC_SYSTICK);
        }
        let outcome = cpu.step(&mut bus);
        assert_eq!(outcome, StepOutcome::ExceptionEntered(armsim_abi::EXC_SYSTICK));
        assert_eq!(cpu.regs.lr(), EXC_RETURN_THREAD_MSP);
        assert_eq!(cpu.regs.pc(), 0x40);

        let outcome = cpu.step(&mut bus); // executes BX LR
        assert_eq!(outcome, StepOutcome::ExceptionReturned);
        assert_eq!(cpu.regs.pc(), pc_before);
        assert_eq!(cpu.regs.sp(), sp_before);
        assert!(!cpu.nvic().is_active(armsim_abi::EXC_SYSTICK));
    }

    #[test]
    fn bx_with_arm_state_target_escalates_to_hardfault() {
        let mut bus = make_bus(0x2000);
        bus.write(0, 4, 0x2000_1000).unwrap();
        bus.write(4, 4, 0x10).unwrap();
        bus.write(0x10, 2, 0x4700).unwrap(); // BX R0, R0 = 0 (even: ARM state)

        let mut cpu = Cpu::new(0);
        cpu.step(&mut bus); // reset bring-up, R0 already zero

        let outcome = cpu.step(&mut bus);
        assert_eq!(outcome, StepOutcome::ExceptionEntered(armsim_abi::EXC_HARDFAULT));
        assert!(cpu.nvic().is_active(armsim_abi::EXC_HARDFAULT));
    }
}
