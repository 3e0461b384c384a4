// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Address-decoding bus fabric: a small set of fixed, non-overlapping
//! device ranges that route reads and writes from the CPU (and, through
//! the debug path, from the GDB collaborator) to the device that owns
//! each address.

#![forbid(unsafe_code)]

mod memory;

pub use memory::Memory;

use armsim_abi::{FaultKind, SimError};

/// A target attached to the bus. `offset` is the address already adjusted
/// for the device's base when the device was registered with
/// `translate: true`; otherwise it is the untranslated bus address.
pub trait BusDevice {
    /// Timing read: counts as simulated bus activity.
    fn read(&mut self, offset: u32, len: u8) -> Result<u32, FaultKind>;
    /// Timing write.
    fn write(&mut self, offset: u32, len: u8, value: u32) -> Result<(), FaultKind>;

    /// Non-timing read used by the loader and GDB collaborator. Defaults to
    /// the timing path; devices with side effects on read (none in this
    /// workspace today) should override it.
    fn debug_read(&mut self, offset: u32, len: u8) -> Result<u32, FaultKind> {
        self.read(offset, len)
    }
    /// Non-timing write used by the HEX loader.
    fn debug_write(&mut self, offset: u32, len: u8, value: u32) -> Result<(), FaultKind> {
        self.write(offset, len, value)
    }
}

struct Entry {
    name: String,
    base: u32,
    size: u32,
    translate: bool,
    device: Box<dyn BusDevice>,
}

impl Entry {
    fn end(&self) -> u32 {
        self.base + self.size
    }

    fn contains(&self, addr: u32) -> bool {
        addr >= self.base && addr < self.end()
    }
}

/// The router. Holds every attached device and performs address decode.
#[derive(Default)]
pub struct Bus {
    entries: Vec<Entry>,
}

impl Bus {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Registers a device over `[base, base+size)`. Rejects ranges that
    /// overlap any device already registered.
    pub fn add_device(
        &mut self,
        name: impl Into<String>,
        base: u32,
        size: u32,
        translate: bool,
        device: Box<dyn BusDevice>,
    ) -> Result<(), SimError> {
        let name = name.into();
        let end = base.checked_add(size).unwrap_or(u32::MAX);
        for existing in &self.entries {
            if base < existing.end() && existing.base < end {
                return Err(SimError::OverlappingDevice {
                    name,
                    base,
                    end,
                    other: existing.name.clone(),
                    other_base: existing.base,
                    other_end: existing.end(),
                });
            }
        }
        log::debug!("bus: mapped {name:?} at {base:#010x}..{end:#010x} (translate={translate})");
        self.entries.push(Entry { name, base, size, translate, device });
        Ok(())
    }

    fn find(&mut self, addr: u32) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|e| e.contains(addr))
    }

    fn offset_of(entry: &Entry, addr: u32) -> u32 {
        if entry.translate {
            addr - entry.base
        } else {
            addr
        }
    }

    pub fn read(&mut self, addr: u32, len: u8) -> Result<u32, FaultKind> {
        match self.find(addr) {
            Some(entry) => {
                let offset = Self::offset_of(entry, addr);
                entry.device.read(offset, len)
            }
            None => {
                log::warn!("bus: read from unmapped address {addr:#010x}");
                Err(FaultKind::AddressError { address: addr })
            }
        }
    }

    pub fn write(&mut self, addr: u32, len: u8, value: u32) -> Result<(), FaultKind> {
        match self.find(addr) {
            Some(entry) => {
                let offset = Self::offset_of(entry, addr);
                entry.device.write(offset, len, value)
            }
            None => {
                log::warn!("bus: write to unmapped address {addr:#010x}");
                Err(FaultKind::AddressError { address: addr })
            }
        }
    }

    pub fn debug_read(&mut self, addr: u32, len: u8) -> Result<u32, FaultKind> {
        match self.find(addr) {
            Some(entry) => {
                let offset = Self::offset_of(entry, addr);
                entry.device.debug_read(offset, len)
            }
            None => Err(FaultKind::AddressError { address: addr }),
        }
    }

    pub fn debug_write(&mut self, addr: u32, len: u8, value: u32) -> Result<(), FaultKind> {
        match self.find(addr) {
            Some(entry) => {
                let offset = Self::offset_of(entry, addr);
                entry.device.debug_write(offset, len, value)
            }
            None => {
                // The loader writes past the end of a mapped region when a
                // HEX record overruns its target; that is a warning, not a
                // hard failure, per the loader's own discard-with-warning
                // contract. Devices with no match at all are still a fault.
                Err(FaultKind::AddressError { address: addr })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Stub;
    impl BusDevice for Stub {
        fn read(&mut self, _offset: u32, _len: u8) -> Result<u32, FaultKind> {
            Ok(0)
        }
        fn write(&mut self, _offset: u32, _len: u8, _value: u32) -> Result<(), FaultKind> {
            Ok(())
        }
    }

    #[test]
    fn rejects_overlapping_ranges() {
        let mut bus = Bus::new();
        bus.add_device("a", 0x1000, 0x100, false, Box::new(Stub)).unwrap();
        let err = bus.add_device("b", 0x1080, 0x100, false, Box::new(Stub));
        assert!(err.is_err());
    }

    #[test]
    fn adjacent_ranges_do_not_overlap() {
        let mut bus = Bus::new();
        bus.add_device("a", 0x1000, 0x100, false, Box::new(Stub)).unwrap();
        bus.add_device("b", 0x1100, 0x100, false, Box::new(Stub)).unwrap();
    }

    #[test]
    fn unmapped_read_is_address_error() {
        let mut bus = Bus::new();
        bus.add_device("a", 0x1000, 0x100, false, Box::new(Stub)).unwrap();
        assert_eq!(bus.read(0x2000, 4), Err(FaultKind::AddressError { address: 0x2000 }));
    }

    #[test]
    fn translate_rewrites_offset_to_zero_base() {
        struct Echo;
        impl BusDevice for Echo {
            fn read(&mut self, offset: u32, _len: u8) -> Result<u32, FaultKind> {
                Ok(offset)
            }
            fn write(&mut self, _offset: u32, _len: u8, _value: u32) -> Result<(), FaultKind> {
                Ok(())
            }
        }
        let mut bus = Bus::new();
        bus.add_device("echo", 0x4000, 0x100, true, Box::new(Echo)).unwrap();
        assert_eq!(bus.read(0x4010, 4), Ok(0x10));
    }
}
