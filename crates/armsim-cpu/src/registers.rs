// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use armsim_abi::FaultKind;
use bitflags::bitflags;

const XPSR_T: u32 = 1 << 24;
const XPSR_N: u32 = 1 << 31;
const XPSR_Z: u32 = 1 << 30;
const XPSR_C: u32 = 1 << 29;
const XPSR_V: u32 = 1 << 28;
const XPSR_ISR_MASK: u32 = 0x1FF;

bitflags! {
    /// `CONTROL`: only bits 0 (nPRIV) and 1 (SPSEL) exist on ARMv6-M; every
    /// other bit is reserved and ignored on write.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Control: u32 {
        const NPRIV = 1 << 0;
        const SPSEL = 1 << 1;
    }
}

/// Architectural register file: R0-R12, the two banked stack pointers, LR,
/// PC, xPSR, PRIMASK and CONTROL. `CONTROL.SPSEL` decides which stack
/// pointer reads/writes as R13.
#[derive(Debug, Clone)]
pub struct RegisterFile {
    r: [u32; 13],
    msp: u32,
    psp: u32,
    lr: u32,
    pc: u32,
    xpsr: u32,
    primask: u32,
    control: Control,
    reset_msp: u32,
}

impl RegisterFile {
    pub fn new(reset_msp: u32) -> Self {
        let mut regs = Self {
            r: [0; 13],
            msp: reset_msp,
            psp: 0,
            lr: 0,
            pc: 0,
            xpsr: XPSR_T,
            primask: 0,
            control: Control::empty(),
            reset_msp,
        };
        regs.reset();
        regs
    }

    /// Restores the architectural reset state: all GPRs zeroed, MSP set to
    /// the configured top-of-RAM, PSP zero, LR/PC zero, xPSR with only the
    /// (permanently set) T bit, PRIMASK and CONTROL clear.
    pub fn reset(&mut self) {
        self.r = [0; 13];
        self.msp = self.reset_msp;
        self.psp = 0;
        self.lr = 0;
        self.pc = 0;
        self.xpsr = XPSR_T;
        self.primask = 0;
        self.control = Control::empty();
    }

    fn sp_selected(&self) -> bool {
        self.control.contains(Control::SPSEL)
    }

    pub fn read(&self, index: u32) -> Result<u32, FaultKind> {
        match index {
            0..=12 => Ok(self.r[index as usize]),
            13 => Ok(if self.sp_selected() { self.psp } else { self.msp }),
            14 => Ok(self.lr),
            15 => Ok(self.pc),
            _ => Err(FaultKind::InvalidRegister { index }),
        }
    }

    pub fn write(&mut self, index: u32, value: u32) -> Result<(), FaultKind> {
        match index {
            0..=12 => self.r[index as usize] = value,
            13 => {
                let aligned = value & !0b11;
                if self.sp_selected() {
                    self.psp = aligned;
                } else {
                    self.msp = aligned;
                }
            }
            14 => self.lr = value,
            15 => self.pc = value & !1,
            _ => return Err(FaultKind::InvalidRegister { index }),
        }
        Ok(())
    }

    pub fn pc(&self) -> u32 {
        self.pc
    }

    pub fn set_pc(&mut self, value: u32) {
        self.pc = value & !1;
    }

    pub fn lr(&self) -> u32 {
        self.lr
    }

    pub fn set_lr(&mut self, value: u32) {
        self.lr = value;
    }

    /// Reads the stack pointer that is currently selected for use by
    /// general-purpose instructions (R13).
    pub fn sp(&self) -> u32 {
        if self.sp_selected() { self.psp } else { self.msp }
    }

    pub fn set_sp(&mut self, value: u32) {
        let aligned = value & !0b11;
        if self.sp_selected() {
            self.psp = aligned;
        } else {
            self.msp = aligned;
        }
    }

    pub fn msp(&self) -> u32 {
        self.msp
    }

    pub fn set_msp(&mut self, value: u32) {
        self.msp = value & !0b11;
    }

    pub fn psp(&self) -> u32 {
        self.psp
    }

    pub fn set_psp(&mut self, value: u32) {
        self.psp = value & !0b11;
    }

    pub fn spsel(&self) -> bool {
        self.sp_selected()
    }

    pub fn set_spsel(&mut self, selected: bool) {
        self.control.set(Control::SPSEL, selected);
    }

    pub fn control(&self) -> u32 {
        self.control.bits()
    }

    pub fn set_control(&mut self, value: u32) {
        // Only nPRIV (bit0) and SPSEL (bit1) are implemented on ARMv6-M;
        // `from_bits_truncate` drops any reserved bits software sets.
        self.control = Control::from_bits_truncate(value);
    }

    pub fn primask(&self) -> bool {
        self.primask & 1 != 0
    }

    pub fn set_primask(&mut self, masked: bool) {
        self.primask = masked as u32;
    }

    pub fn xpsr(&self) -> u32 {
        self.xpsr
    }

    pub fn set_xpsr(&mut self, value: u32) {
        // T is architecturally fixed at 1 on ARMv6-M.
        self.xpsr = value | XPSR_T;
    }

    pub fn isr_number(&self) -> u16 {
        (self.xpsr & XPSR_ISR_MASK) as u16
    }

    pub fn set_isr_number(&mut self, exception: u16) {
        self.xpsr = (self.xpsr & !XPSR_ISR_MASK) | (exception as u32 & XPSR_ISR_MASK);
    }

    pub fn n(&self) -> bool {
        self.xpsr & XPSR_N != 0
    }
    pub fn z(&self) -> bool {
        self.xpsr & XPSR_Z != 0
    }
    pub fn c(&self) -> bool {
        self.xpsr & XPSR_C != 0
    }
    pub fn v(&self) -> bool {
        self.xpsr & XPSR_V != 0
    }

    pub fn set_n(&mut self, set: bool) {
        self.set_flag(XPSR_N, set);
    }
    pub fn set_z(&mut self, set: bool) {
        self.set_flag(XPSR_Z, set);
    }
    pub fn set_c(&mut self, set: bool) {
        self.set_flag(XPSR_C, set);
    }
    pub fn set_v(&mut self, set: bool) {
        self.set_flag(XPSR_V, set);
    }

    fn set_flag(&mut self, mask: u32, set: bool) {
        if set {
            self.xpsr |= mask;
        } else {
            self.xpsr &= !mask;
        }
    }

    /// Sets N and Z from a computed 32-bit result; used by every
    /// flag-setting data-processing instruction.
    pub fn set_nz(&mut self, result: u32) {
        self.set_n(result & 0x8000_0000 != 0);
        self.set_z(result == 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_sets_msp_and_thumb_bit() {
        let regs = RegisterFile::new(0x2000_1000);
        assert_eq!(regs.msp(), 0x2000_1000);
        assert_eq!(regs.xpsr() & XPSR_T, XPSR_T);
    }

    #[test]
    fn write_read_round_trip_gprs() {
        let mut regs = RegisterFile::new(0x2000_1000);
        for i in 0..=12 {
            regs.write(i, 0x1000 * (i + 1)).unwrap();
        }
        for i in 0..=12 {
            assert_eq!(regs.read(i).unwrap(), 0x1000 * (i + 1));
        }
    }

    #[test]
    fn sp_write_masks_low_bits() {
        let mut regs = RegisterFile::new(0x2000_1000);
        regs.write(13, 0x2000_0003).unwrap();
        assert_eq!(regs.read(13).unwrap(), 0x2000_0000);
    }

    #[test]
    fn spsel_switches_r13_between_msp_and_psp() {
        let mut regs = RegisterFile::new(0x2000_1000);
        regs.set_psp(0x1000_0000);
        assert_eq!(regs.read(13).unwrap(), 0x2000_1000);
        regs.set_spsel(true);
        assert_eq!(regs.read(13).unwrap(), 0x1000_0000);
    }

    #[test]
    fn invalid_register_index_errors() {
        let regs = RegisterFile::new(0x2000_1000);
        assert!(regs.read(16).is_err());
    }
}
