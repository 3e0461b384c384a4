// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MMIO peripherals that sit on the bus alongside memory and the NVIC:
//! a one-byte trace console, a 64-bit `mtime`/`mtimecmp` timer, and an
//! independent SysTick down-counter. Both timers call into a shared
//! [`armsim_cpu::Nvic`] to raise their exception when they fire. Each
//! peripheral exposes itself as a `BusDevice` plus a `tick()` called once
//! per simulated instruction, rather than owning a background thread.

#![forbid(unsafe_code)]

use std::cell::RefCell;
use std::fs::File;
use std::io::Write;
use std::rc::Rc;

use armsim_abi::FaultKind;
use armsim_bus::BusDevice;
use armsim_cpu::Nvic;

/// A one-byte MMIO write sink: each byte written is echoed to stdout and,
/// if configured, appended to a trace file. Reads always return zero.
///
/// The original `Trace::write_character` wrote to both `std::cout` and an
/// always-open `trace_output.txt`; here the file sink is optional so a
/// headless run without `--trace` doesn't leave a stray file behind.
pub struct Trace {
    file: Option<File>,
}

impl Trace {
    pub fn new() -> Self {
        Self { file: None }
    }

    pub fn with_file(file: File) -> Self {
        Self { file: Some(file) }
    }
}

impl Default for Trace {
    fn default() -> Self {
        Self::new()
    }
}

impl BusDevice for Trace {
    fn read(&mut self, _offset: u32, _len: u8) -> Result<u32, FaultKind> {
        Ok(0)
    }

    fn write(&mut self, _offset: u32, len: u8, value: u32) -> Result<(), FaultKind> {
        if len != 1 {
            return Ok(());
        }
        let byte = value as u8;
        print!("{}", byte as char);
        let _ = std::io::stdout().flush();
        if let Some(file) = self.file.as_mut() {
            let _ = file.write_all(&[byte]);
            let _ = file.flush();
        }
        Ok(())
    }
}

const TIMER_MTIME_LOW: u32 = 0x00;
const TIMER_MTIME_HIGH: u32 = 0x04;
const TIMER_MTIMECMP_LOW: u32 = 0x08;
const TIMER_MTIMECMP_HIGH: u32 = 0x0C;

/// A 64-bit free-running counter compared against a 64-bit `mtimecmp`,
/// raising a configured exception (typically an external IRQ) when
/// `mtime >= mtimecmp`, once per bit of simulated progress (`tick()`),
/// matching `Timer::check_and_trigger_irq`'s level semantics: the original
/// fires exactly once per crossing and stays quiet until `mtimecmp` is
/// rewritten.
pub struct Timer {
    mtime: u64,
    mtimecmp: u64,
    irq_pending_latch: bool,
    exception: armsim_abi::ExceptionNumber,
    nvic: Rc<RefCell<Nvic>>,
}

impl Timer {
    pub fn new(exception: armsim_abi::ExceptionNumber, nvic: Rc<RefCell<Nvic>>) -> Self {
        Self {
            mtime: 0,
            mtimecmp: u64::MAX,
            irq_pending_latch: false,
            exception,
            nvic,
        }
    }

    /// Advances `mtime` by one and raises the configured exception the
    /// instant it first reaches `mtimecmp`.
    pub fn tick(&mut self) {
        self.mtime = self.mtime.wrapping_add(1);
        if self.mtime >= self.mtimecmp && !self.irq_pending_latch {
            self.nvic.borrow_mut().set_pending(self.exception);
            self.irq_pending_latch = true;
        }
    }

    pub fn mtime(&self) -> u64 {
        self.mtime
    }
}

impl BusDevice for Timer {
    fn read(&mut self, offset: u32, len: u8) -> Result<u32, FaultKind> {
        if len != 4 {
            return Err(FaultKind::AlignmentError { address: offset, width: len });
        }
        match offset {
            TIMER_MTIME_LOW => Ok(self.mtime as u32),
            TIMER_MTIME_HIGH => Ok((self.mtime >> 32) as u32),
            TIMER_MTIMECMP_LOW => Ok(self.mtimecmp as u32),
            TIMER_MTIMECMP_HIGH => Ok((self.mtimecmp >> 32) as u32),
            _ => Err(FaultKind::AddressError { address: offset }),
        }
    }

    fn write(&mut self, offset: u32, len: u8, value: u32) -> Result<(), FaultKind> {
        if len != 4 {
            return Err(FaultKind::AlignmentError { address: offset, width: len });
        }
        match offset {
            TIMER_MTIME_LOW => self.mtime = (self.mtime & !0xFFFF_FFFF) | value as u64,
            TIMER_MTIME_HIGH => self.mtime = (self.mtime & 0xFFFF_FFFF) | ((value as u64) << 32),
            TIMER_MTIMECMP_LOW => {
                self.mtimecmp = (self.mtimecmp & !0xFFFF_FFFF) | value as u64;
                self.irq_pending_latch = false;
            }
            TIMER_MTIMECMP_HIGH => {
                self.mtimecmp = (self.mtimecmp & 0xFFFF_FFFF) | ((value as u64) << 32);
                self.irq_pending_latch = false;
            }
            _ => return Err(FaultKind::AddressError { address: offset }),
        }
        Ok(())
    }
}

/// Shares one [`Timer`] between the CLI driver's per-step `tick()` call and
/// the bus's MMIO access, the same split [`armsim_cpu::NvicMmio`] uses for
/// the NVIC: the driver needs to call `tick()` directly, which a
/// `Box<dyn BusDevice>` swallowed by the bus would make unreachable.
pub struct TimerMmio(Rc<RefCell<Timer>>);

impl TimerMmio {
    pub fn new(timer: Rc<RefCell<Timer>>) -> Self {
        Self(timer)
    }
}

impl BusDevice for TimerMmio {
    fn read(&mut self, offset: u32, len: u8) -> Result<u32, FaultKind> {
        self.0.borrow_mut().read(offset, len)
    }

    fn write(&mut self, offset: u32, len: u8, value: u32) -> Result<(), FaultKind> {
        self.0.borrow_mut().write(offset, len, value)
    }
}

const SYSTICK_CSR: u32 = 0x00;
const SYSTICK_RVR: u32 = 0x04;
const SYSTICK_CVR: u32 = 0x08;
const SYSTICK_CALIB: u32 = 0x0C;

const SYSTICK_CSR_ENABLE: u32 = 1 << 0;
const SYSTICK_CSR_TICKINT: u32 = 1 << 1;
const SYSTICK_CSR_COUNTFLAG: u32 = 1 << 16;

/// The independent SysTick down-counter at `0xE000E010`: counts `VAL`
/// down to zero once per `tick()` while `CTRL.ENABLE` is set, reloads from
/// `LOAD`, and raises exception 15 when `CTRL.TICKINT` is also set.
///
/// Distinct from [`Timer`]: kept as its own device with its own register
/// block rather than overloading the millisecond timer's registers with a
/// second, independent countdown.
pub struct SysTick {
    ctrl: u32,
    reload: u32,
    current: u32,
    nvic: Rc<RefCell<Nvic>>,
}

impl SysTick {
    pub fn new(nvic: Rc<RefCell<Nvic>>) -> Self {
        Self { ctrl: 0, reload: 0, current: 0, nvic }
    }

    pub fn tick(&mut self) {
        if self.ctrl & SYSTICK_CSR_ENABLE == 0 {
            return;
        }
        if self.current == 0 {
            self.current = self.reload;
        }
        self.current -= 1;
        if self.current == 0 {
            self.ctrl |= SYSTICK_CSR_COUNTFLAG;
            if self.ctrl & SYSTICK_CSR_TICKINT != 0 {
                self.nvic.borrow_mut().set_pending(armsim_abi::EXC_SYSTICK);
            }
        }
    }
}

impl BusDevice for SysTick {
    fn read(&mut self, offset: u32, len: u8) -> Result<u32, FaultKind> {
        if len != 4 {
            return Err(FaultKind::AlignmentError { address: offset, width: len });
        }
        match offset {
            SYSTICK_CSR => {
                let value = self.ctrl;
                self.ctrl &= !SYSTICK_CSR_COUNTFLAG; // read-to-clear
                Ok(value)
            }
            SYSTICK_RVR => Ok(self.reload),
            SYSTICK_CVR => Ok(self.current),
            SYSTICK_CALIB => Ok(0),
            _ => Err(FaultKind::AddressError { address: offset }),
        }
    }

    fn write(&mut self, offset: u32, len: u8, value: u32) -> Result<(), FaultKind> {
        if len != 4 {
            return Err(FaultKind::AlignmentError { address: offset, width: len });
        }
        match offset {
            SYSTICK_CSR => self.ctrl = value & (SYSTICK_CSR_ENABLE | SYSTICK_CSR_TICKINT),
            SYSTICK_RVR => self.reload = value & 0x00FF_FFFF,
            SYSTICK_CVR => self.current = 0, // any write clears VAL, per the architecture
            SYSTICK_CALIB => {}
            _ => return Err(FaultKind::AddressError { address: offset }),
        }
        Ok(())
    }
}

/// Shares one [`SysTick`] between the driver's `tick()` call and the bus,
/// for the same reason as [`TimerMmio`].
pub struct SysTickMmio(Rc<RefCell<SysTick>>);

impl SysTickMmio {
    pub fn new(systick: Rc<RefCell<SysTick>>) -> Self {
        Self(systick)
    }
}

impl BusDevice for SysTickMmio {
    fn read(&mut self, offset: u32, len: u8) -> Result<u32, FaultKind> {
        self.0.borrow_mut().read(offset, len)
    }

    fn write(&mut self, offset: u32, len: u8, value: u32) -> Result<(), FaultKind> {
        self.0.borrow_mut().write(offset, len, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nvic() -> Rc<RefCell<Nvic>> {
        Rc::new(RefCell::new(Nvic::new()))
    }

    #[test]
    fn trace_device_ignores_non_byte_writes_and_never_faults() {
        let mut trace = Trace::new();
        trace.write(0, 1, b'x' as u32).unwrap();
        trace.write(0, 4, 0).unwrap();
    }

    #[test]
    fn timer_raises_exception_once_on_crossing() {
        let n = nvic();
        n.borrow_mut().set_enabled(armsim_abi::EXC_IRQ0, true);
        let mut timer = Timer::new(armsim_abi::EXC_IRQ0, Rc::clone(&n));
        timer.write(TIMER_MTIMECMP_LOW, 4, 3).unwrap();
        for _ in 0..3 {
            timer.tick();
        }
        assert!(n.borrow().is_pending(armsim_abi::EXC_IRQ0));
        n.borrow_mut().clear_pending(armsim_abi::EXC_IRQ0);
        timer.tick();
        // Latched: does not re-fire until mtimecmp is rewritten.
        assert!(!n.borrow().is_pending(armsim_abi::EXC_IRQ0));
    }

    #[test]
    fn timer_64_bit_registers_round_trip_across_halves() {
        let mut timer = Timer::new(armsim_abi::EXC_IRQ0, nvic());
        timer.write(TIMER_MTIME_LOW, 4, 0x1111_1111).unwrap();
        timer.write(TIMER_MTIME_HIGH, 4, 0x2222_2222).unwrap();
        assert_eq!(timer.mtime(), 0x2222_2222_1111_1111);
    }

    #[test]
    fn systick_reloads_and_raises_exception_when_tickint_set() {
        let n = nvic();
        let mut systick = SysTick::new(Rc::clone(&n));
        systick.write(SYSTICK_RVR, 4, 2).unwrap();
        systick.write(SYSTICK_CSR, 4, SYSTICK_CSR_ENABLE | SYSTICK_CSR_TICKINT).unwrap();
        systick.tick();
        assert!(!n.borrow().is_pending(armsim_abi::EXC_SYSTICK));
        systick.tick();
        systick.tick();
        assert!(n.borrow().is_pending(armsim_abi::EXC_SYSTICK));
    }

    #[test]
    fn systick_countflag_clears_on_read() {
        let mut systick = SysTick::new(nvic());
        systick.write(SYSTICK_RVR, 4, 1).unwrap();
        systick.write(SYSTICK_CSR, 4, SYSTICK_CSR_ENABLE).unwrap();
        systick.tick();
        systick.tick();
        let status = systick.read(SYSTICK_CSR, 4).unwrap();
        assert_ne!(status & SYSTICK_CSR_COUNTFLAG, 0);
        let status_again = systick.read(SYSTICK_CSR, 4).unwrap();
        assert_eq!(status_again & SYSTICK_CSR_COUNTFLAG, 0);
    }
}
