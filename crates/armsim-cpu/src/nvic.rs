// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The Nested Vectored Interrupt Controller: enable/pending/active tracking
//! over exception numbers 1..=47 and the priority arithmetic that picks the
//! next exception to enter, backing the ISER/ICER/ISPR/ICPR/IPR0-7/SHPR2/
//! SHPR3/SHCSR register set.

use armsim_abi::{
    ExceptionNumber, EXC_HARDFAULT, EXC_IRQ0, EXC_MAX, EXC_NMI, EXC_PENDSV, EXC_RESET, EXC_SVCALL,
    EXC_SYSTICK, PRIO_HARDFAULT, PRIO_NMI, PRIO_RESET, PRIO_THREAD,
};

const NUM_EXCEPTIONS: usize = EXC_MAX as usize + 1; // index by exception number directly, 0 unused

#[derive(Debug, Clone)]
pub struct Nvic {
    enabled: [bool; NUM_EXCEPTIONS],
    pending: [bool; NUM_EXCEPTIONS],
    active: [bool; NUM_EXCEPTIONS],
    /// Configurable priority, 0..=15, for SVCall/PendSV/SysTick and each
    /// external IRQ. Indexed by exception number; unused for fixed-priority
    /// exceptions.
    priority: [u8; NUM_EXCEPTIONS],
}

impl Default for Nvic {
    fn default() -> Self {
        let mut nvic = Self {
            enabled: [false; NUM_EXCEPTIONS],
            pending: [false; NUM_EXCEPTIONS],
            active: [false; NUM_EXCEPTIONS],
            priority: [0; NUM_EXCEPTIONS],
        };
        // System exceptions with architecturally fixed enablement.
        nvic.enabled[EXC_RESET as usize] = true;
        nvic.enabled[EXC_NMI as usize] = true;
        nvic.enabled[EXC_HARDFAULT as usize] = true;
        nvic.enabled[EXC_SVCALL as usize] = true;
        nvic.enabled[EXC_PENDSV as usize] = true;
        nvic.enabled[EXC_SYSTICK as usize] = true;
        nvic
    }
}

impl Nvic {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn set_enabled(&mut self, exception: ExceptionNumber, enabled: bool) {
        if let Some(slot) = self.enabled.get_mut(exception as usize) {
            *slot = enabled;
        }
    }

    pub fn is_enabled(&self, exception: ExceptionNumber) -> bool {
        self.enabled.get(exception as usize).copied().unwrap_or(false)
    }

    /// Marks `exception` pending. Called both by software writes to ISPR
    /// and by peripheral collaborators via their single serialized entry
    /// point.
    pub fn set_pending(&mut self, exception: ExceptionNumber) {
        if let Some(slot) = self.pending.get_mut(exception as usize) {
            if !*slot {
                log::debug!("nvic: exception {exception} pending");
            }
            *slot = true;
        }
    }

    /// Clears a pending exception. A write to ICPR is refused for an
    /// exception currently active, matching the hardware's
    /// write-ignored-while-active behavior.
    pub fn clear_pending(&mut self, exception: ExceptionNumber) {
        if self.active.get(exception as usize).copied().unwrap_or(false) {
            return;
        }
        if let Some(slot) = self.pending.get_mut(exception as usize) {
            *slot = false;
        }
    }

    pub fn is_pending(&self, exception: ExceptionNumber) -> bool {
        self.pending.get(exception as usize).copied().unwrap_or(false)
    }

    pub fn is_active(&self, exception: ExceptionNumber) -> bool {
        self.active.get(exception as usize).copied().unwrap_or(false)
    }

    pub fn set_priority(&mut self, exception: ExceptionNumber, priority: u8) {
        if let Some(slot) = self.priority.get_mut(exception as usize) {
            *slot = priority & 0xF;
        }
    }

    pub fn priority(&self, exception: ExceptionNumber) -> u8 {
        self.priority.get(exception as usize).copied().unwrap_or(0)
    }

    /// Effective priority on the signed scale fixed exceptions use, so it
    /// can be compared directly against `PRIO_RESET`/`PRIO_NMI`/
    /// `PRIO_HARDFAULT`/`PRIO_THREAD`.
    fn effective_priority(&self, exception: ExceptionNumber) -> i16 {
        match exception {
            EXC_RESET => PRIO_RESET as i16,
            EXC_NMI => PRIO_NMI as i16,
            EXC_HARDFAULT => PRIO_HARDFAULT as i16,
            _ => self.priority(exception) as i16,
        }
    }

    /// Current execution priority: the priority of the highest-priority
    /// active exception, or `PRIO_THREAD` if none is active.
    pub fn execution_priority(&self) -> i16 {
        (1..=EXC_MAX)
            .filter(|&n| self.active[n as usize])
            .map(|n| self.effective_priority(n))
            .min()
            .unwrap_or(PRIO_THREAD)
    }

    /// Picks the pending, enabled, unmasked exception with the numerically
    /// lowest priority (ties broken by lowest exception number), if its
    /// priority is strictly higher (numerically lower) than the current
    /// execution priority. Returns `None` otherwise — the CPU loop should
    /// not preempt.
    pub fn next_exception(&self, primask: bool) -> Option<ExceptionNumber> {
        let current = self.execution_priority();
        let mut best: Option<(ExceptionNumber, i16)> = None;
        for n in 1..=EXC_MAX {
            if !self.pending[n as usize] || !self.enabled[n as usize] {
                continue;
            }
            // PRIMASK masks everything except NMI and HardFault.
            if primask && n != EXC_NMI && n != EXC_HARDFAULT {
                continue;
            }
            let prio = self.effective_priority(n);
            match best {
                Some((_, best_prio)) if best_prio <= prio => {}
                _ => best = Some((n, prio)),
            }
        }
        match best {
            Some((n, prio)) if prio < current => Some(n),
            _ => None,
        }
    }

    /// Transitions `exception` from pending to active; called once exception
    /// entry has committed to taking it.
    pub fn activate(&mut self, exception: ExceptionNumber) {
        if let Some(slot) = self.pending.get_mut(exception as usize) {
            *slot = false;
        }
        if let Some(slot) = self.active.get_mut(exception as usize) {
            *slot = true;
        }
    }

    /// Clears `exception`'s active bit on exception return.
    pub fn deactivate(&mut self, exception: ExceptionNumber) {
        if let Some(slot) = self.active.get_mut(exception as usize) {
            *slot = false;
        }
    }

    pub fn irq_exception(irq: u8) -> ExceptionNumber {
        EXC_IRQ0 + irq as ExceptionNumber
    }

    fn iser_icer_bit(&self, irq: u8) -> bool {
        self.is_enabled(Self::irq_exception(irq))
    }

    fn ispr_icpr_bit(&self, irq: u8) -> bool {
        self.is_pending(Self::irq_exception(irq))
    }
}

/// The NVIC's own memory-mapped register window: ISER/ICER/ISPR/ICPR/
/// IPR0-7 for the 32 external IRQs, plus SHPR2/SHPR3/SHCSR for the three
/// configurable-priority system exceptions. Registered on the bus
/// untranslated (the addresses below are the absolute ARM addresses
/// software expects), sharing the same [`Nvic`] the CPU loop checks before
/// every fetch.
pub struct NvicMmio {
    nvic: std::rc::Rc<std::cell::RefCell<Nvic>>,
}

const ADDR_ISER: u32 = 0xE000_E100;
const ADDR_ICER: u32 = 0xE000_E180;
const ADDR_ISPR: u32 = 0xE000_E200;
const ADDR_ICPR: u32 = 0xE000_E280;
const ADDR_IPR0: u32 = 0xE000_E400;
const ADDR_IPR7: u32 = 0xE000_E41C;
const ADDR_SHPR2: u32 = 0xE000_ED1C;
const ADDR_SHPR3: u32 = 0xE000_ED20;
const ADDR_SHCSR: u32 = 0xE000_ED24;

impl NvicMmio {
    pub fn new(nvic: std::rc::Rc<std::cell::RefCell<Nvic>>) -> Self {
        Self { nvic }
    }

    fn read_bitmap(nvic: &Nvic, bit_of: impl Fn(&Nvic, u8) -> bool) -> u32 {
        let mut word = 0u32;
        for irq in 0..32u8 {
            if bit_of(nvic, irq) {
                word |= 1 << irq;
            }
        }
        word
    }

    fn write_bitmap(nvic: &mut Nvic, value: u32, mut apply: impl FnMut(&mut Nvic, u8)) {
        for irq in 0..32u8 {
            if value & (1 << irq) != 0 {
                apply(nvic, irq);
            }
        }
    }

    /// Reads one byte lane of an IPR register: 4 priority bits packed into
    /// the high nibble, matching the layout ARMv6-M exposes to software.
    fn ipr_byte(nvic: &Nvic, reg_index: u32, lane: u32) -> u8 {
        let irq = (reg_index * 4 + lane) as u8;
        nvic.priority(Self::irq_exception(irq)) << 4
    }

    fn set_ipr_byte(nvic: &mut Nvic, reg_index: u32, lane: u32, byte: u8) {
        let irq = (reg_index * 4 + lane) as u8;
        nvic.set_priority(Self::irq_exception(irq), byte >> 4);
    }

    fn irq_exception(irq: u8) -> ExceptionNumber {
        Nvic::irq_exception(irq)
    }

    fn read_word(&self, addr: u32) -> Option<u32> {
        let nvic = self.nvic.borrow();
        match addr {
            ADDR_ISER | ADDR_ICER => Some(Self::read_bitmap(&nvic, Nvic::iser_icer_bit)),
            ADDR_ISPR | ADDR_ICPR => Some(Self::read_bitmap(&nvic, Nvic::ispr_icpr_bit)),
            ADDR_IPR0..=ADDR_IPR7 => {
                let reg_index = (addr - ADDR_IPR0) / 4;
                let mut word = 0u32;
                for lane in 0..4u32 {
                    word |= (Self::ipr_byte(&nvic, reg_index, lane) as u32) << (lane * 8);
                }
                Some(word)
            }
            ADDR_SHPR2 => Some((nvic.priority(EXC_SVCALL) as u32) << 29),
            ADDR_SHPR3 => {
                Some(((nvic.priority(EXC_PENDSV) as u32) << 21) | ((nvic.priority(EXC_SYSTICK) as u32) << 29))
            }
            ADDR_SHCSR => {
                let mut word = 0u32;
                if nvic.is_active(EXC_SVCALL) {
                    word |= 1 << 0;
                }
                if nvic.is_active(EXC_PENDSV) {
                    word |= 1 << 1;
                }
                if nvic.is_active(EXC_SYSTICK) {
                    word |= 1 << 2;
                }
                Some(word)
            }
            _ => None,
        }
    }

    fn write_word(&self, addr: u32, value: u32) -> bool {
        let mut nvic = self.nvic.borrow_mut();
        match addr {
            ADDR_ISER => {
                Self::write_bitmap(&mut nvic, value, |n, irq| n.set_enabled(Self::irq_exception(irq), true));
                true
            }
            ADDR_ICER => {
                Self::write_bitmap(&mut nvic, value, |n, irq| n.set_enabled(Self::irq_exception(irq), false));
                true
            }
            ADDR_ISPR => {
                Self::write_bitmap(&mut nvic, value, |n, irq| n.set_pending(Self::irq_exception(irq)));
                true
            }
            ADDR_ICPR => {
                Self::write_bitmap(&mut nvic, value, |n, irq| n.clear_pending(Self::irq_exception(irq)));
                true
            }
            ADDR_IPR0..=ADDR_IPR7 => {
                let reg_index = (addr - ADDR_IPR0) / 4;
                for lane in 0..4u32 {
                    let byte = ((value >> (lane * 8)) & 0xFF) as u8;
                    Self::set_ipr_byte(&mut nvic, reg_index, lane, byte);
                }
                true
            }
            ADDR_SHPR2 => {
                nvic.set_priority(EXC_SVCALL, ((value >> 29) & 0xF) as u8);
                true
            }
            ADDR_SHPR3 => {
                nvic.set_priority(EXC_PENDSV, ((value >> 21) & 0xF) as u8);
                nvic.set_priority(EXC_SYSTICK, ((value >> 29) & 0xF) as u8);
                true
            }
            ADDR_SHCSR => {
                log::debug!("nvic: ignoring write {value:#010x} to read-only SHCSR");
                true
            }
            _ => false,
        }
    }
}

impl armsim_bus::BusDevice for NvicMmio {
    fn read(&mut self, offset: u32, len: u8) -> Result<u32, armsim_abi::FaultKind> {
        if len != 4 {
            return Err(armsim_abi::FaultKind::AlignmentError { address: offset, width: len });
        }
        self.read_word(offset).ok_or(armsim_abi::FaultKind::AddressError { address: offset })
    }

    fn write(&mut self, offset: u32, len: u8, value: u32) -> Result<(), armsim_abi::FaultKind> {
        if len != 4 {
            return Err(armsim_abi::FaultKind::AlignmentError { address: offset, width: len });
        }
        if self.write_word(offset, value) {
            Ok(())
        } else {
            Err(armsim_abi::FaultKind::AddressError { address: offset })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armsim_bus::BusDevice;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn mmio_iser_enables_irq_visible_to_shared_nvic() {
        let nvic = Rc::new(RefCell::new(Nvic::new()));
        let mut mmio = NvicMmio::new(Rc::clone(&nvic));
        mmio.write(ADDR_ISER, 4, 1 << 3).unwrap();
        assert!(nvic.borrow().is_enabled(EXC_IRQ0 + 3));
        let word = mmio.read(ADDR_ISER, 4).unwrap();
        assert_eq!(word, 1 << 3);
    }

    #[test]
    fn mmio_icpr_does_not_clear_active_irq() {
        let nvic = Rc::new(RefCell::new(Nvic::new()));
        nvic.borrow_mut().set_pending(EXC_IRQ0);
        nvic.borrow_mut().activate(EXC_IRQ0);
        let mut mmio = NvicMmio::new(Rc::clone(&nvic));
        mmio.write(ADDR_ICPR, 4, 1).unwrap();
        assert!(nvic.borrow().is_pending(EXC_IRQ0));
    }

    #[test]
    fn mmio_ipr_round_trips_through_byte_lane() {
        let nvic = Rc::new(RefCell::new(Nvic::new()));
        let mut mmio = NvicMmio::new(Rc::clone(&nvic));
        // IRQ4 lives in IPR1, lane 0 (irq = reg_index * 4 + lane).
        mmio.write(ADDR_IPR0 + 4, 4, 0xB0).unwrap();
        assert_eq!(nvic.borrow().priority(EXC_IRQ0 + 4), 0xB);
        let word = mmio.read(ADDR_IPR0 + 4, 4).unwrap();
        assert_eq!(word & 0xFF, 0xB0);
    }

    #[test]
    fn mmio_shpr3_sets_systick_priority() {
        let nvic = Rc::new(RefCell::new(Nvic::new()));
        let mut mmio = NvicMmio::new(Rc::clone(&nvic));
        mmio.write(ADDR_SHPR3, 4, 0xF << 29).unwrap();
        assert_eq!(nvic.borrow().priority(EXC_SYSTICK), 0xF);
    }

    #[test]
    fn mmio_rejects_non_word_access() {
        let nvic = Rc::new(RefCell::new(Nvic::new()));
        let mut mmio = NvicMmio::new(nvic);
        assert!(mmio.read(ADDR_ISER, 1).is_err());
    }

    #[test]
    fn lower_priority_number_wins() {
        let mut nvic = Nvic::new();
        nvic.set_enabled(EXC_IRQ0, true);
        nvic.set_enabled(EXC_IRQ0 + 1, true);
        nvic.set_priority(EXC_IRQ0, 2);
        nvic.set_priority(EXC_IRQ0 + 1, 1);
        nvic.set_pending(EXC_IRQ0);
        nvic.set_pending(EXC_IRQ0 + 1);
        assert_eq!(nvic.next_exception(false), Some(EXC_IRQ0 + 1));
    }

    #[test]
    fn primask_masks_everything_but_nmi_and_hardfault() {
        let mut nvic = Nvic::new();
        nvic.set_enabled(EXC_SYSTICK, true);
        nvic.set_pending(EXC_SYSTICK);
        nvic.set_pending(EXC_NMI);
        assert_eq!(nvic.next_exception(true), Some(EXC_NMI));
    }

    #[test]
    fn active_exception_raises_execution_priority() {
        let mut nvic = Nvic::new();
        nvic.set_enabled(EXC_SYSTICK, true);
        nvic.set_priority(EXC_SYSTICK, 5);
        nvic.activate(EXC_SYSTICK);
        nvic.set_enabled(EXC_IRQ0, true);
        nvic.set_priority(EXC_IRQ0, 10);
        nvic.set_pending(EXC_IRQ0);
        // lower-priority (higher number) IRQ cannot preempt.
        assert_eq!(nvic.next_exception(false), None);
    }

    #[test]
    fn icpr_write_ignored_while_active() {
        let mut nvic = Nvic::new();
        nvic.set_pending(EXC_SVCALL);
        nvic.activate(EXC_SVCALL);
        // Re-triggered while the handler is still running.
        nvic.set_pending(EXC_SVCALL);
        nvic.clear_pending(EXC_SVCALL);
        assert!(nvic.is_pending(EXC_SVCALL));
        assert!(nvic.is_active(EXC_SVCALL));
    }
}
