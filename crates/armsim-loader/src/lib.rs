// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An Intel-HEX firmware loader: parses `:`-prefixed records and writes
//! data records onto a [`armsim_bus::Bus`] through its debug path, rather
//! than poking a backing array directly, so any bus device can receive a
//! loaded image.

#![forbid(unsafe_code)]

use std::io::BufRead;

use armsim_abi::SimError;
use armsim_bus::Bus;

/// Intel-HEX record types this loader understands. Anything else
/// (start-segment, extended-segment, start-linear-address) is accepted
/// and ignored, matching firmware images that carry them out of habit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordType {
    Data,
    EndOfFile,
    ExtendedLinearAddress,
    Other(u8),
}

impl From<u8> for RecordType {
    fn from(value: u8) -> Self {
        match value {
            0x00 => RecordType::Data,
            0x01 => RecordType::EndOfFile,
            0x04 => RecordType::ExtendedLinearAddress,
            other => RecordType::Other(other),
        }
    }
}

struct HexRecord {
    byte_count: u8,
    address: u16,
    record_type: RecordType,
    data: Vec<u8>,
    checksum: u8,
}

fn hex_byte(line: &str, pos: usize) -> Result<u8, SimError> {
    let byte_str = line
        .get(pos..pos + 2)
        .ok_or_else(|| SimError::HexParseError(format!("record too short: {line:?}")))?;
    u8::from_str_radix(byte_str, 16)
        .map_err(|_| SimError::HexParseError(format!("bad hex digit in {line:?}")))
}

fn hex_word(line: &str, pos: usize) -> Result<u16, SimError> {
    let word_str = line
        .get(pos..pos + 4)
        .ok_or_else(|| SimError::HexParseError(format!("record too short: {line:?}")))?;
    u16::from_str_radix(word_str, 16)
        .map_err(|_| SimError::HexParseError(format!("bad hex digit in {line:?}")))
}

/// Parses one `:`-prefixed Intel-HEX line (the leading colon already
/// stripped by the caller).
fn parse_hex_line(line: &str) -> Result<HexRecord, SimError> {
    let byte_count = hex_byte(line, 0)?;
    let address = hex_word(line, 2)?;
    let record_type = hex_byte(line, 6)?.into();

    let data_start = 8;
    let mut data = Vec::with_capacity(byte_count as usize);
    for i in 0..byte_count as usize {
        data.push(hex_byte(line, data_start + i * 2)?);
    }

    let checksum_pos = data_start + byte_count as usize * 2;
    let checksum = hex_byte(line, checksum_pos)?;

    Ok(HexRecord { byte_count, address, record_type, data, checksum })
}

/// Sum of all bytes (byte count, address high/low, record type, data) plus
/// checksum, modulo 256, must be zero for a well-formed record.
fn checksum_valid(record: &HexRecord) -> bool {
    let mut sum = record.byte_count;
    sum = sum.wrapping_add((record.address >> 8) as u8);
    sum = sum.wrapping_add((record.address & 0xFF) as u8);
    sum = sum.wrapping_add(match record.record_type {
        RecordType::Data => 0x00,
        RecordType::EndOfFile => 0x01,
        RecordType::ExtendedLinearAddress => 0x04,
        RecordType::Other(t) => t,
    });
    for &byte in &record.data {
        sum = sum.wrapping_add(byte);
    }
    sum = sum.wrapping_add(record.checksum);
    sum == 0
}

/// Loads an Intel-HEX image from `reader` onto `bus`, one record at a
/// time, in file order. Lines that do not start with `:` are skipped
/// (blank lines, comments some toolchains emit). A record with a bad
/// checksum is discarded with a warning rather than aborting the whole
/// load, matching firmware images that have historically carried the odd
/// malformed line without anyone noticing.
///
/// The caller is expected to check that the reset vector (word at address
/// 4) is non-zero after this returns; a firmware image that never
/// populates it almost certainly failed to load as intended.
pub fn load_hex(reader: impl BufRead, bus: &mut Bus) -> Result<(), SimError> {
    let mut extended_address: u32 = 0;

    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if !line.starts_with(':') {
            continue;
        }
        let record = match parse_hex_line(&line[1..]) {
            Ok(record) => record,
            Err(err) => {
                log::warn!("hex loader: skipping unparseable line: {err}");
                continue;
            }
        };
        if !checksum_valid(&record) {
            log::warn!("hex loader: skipping record with bad checksum at offset {:#06x}", record.address);
            continue;
        }

        match record.record_type {
            RecordType::Data => {
                let base = extended_address + record.address as u32;
                for (i, &byte) in record.data.iter().enumerate() {
                    let addr = base + i as u32;
                    if let Err(fault) = bus.debug_write(addr, 1, byte as u32) {
                        log::warn!("hex loader: discarding byte at {addr:#010x}: {fault}");
                    }
                }
            }
            RecordType::EndOfFile => break,
            RecordType::ExtendedLinearAddress => {
                if record.data.len() == 2 {
                    extended_address = (record.data[0] as u32) << 24 | (record.data[1] as u32) << 16;
                }
            }
            RecordType::Other(_) => {}
        }
    }

    let reset_vector = bus.debug_read(4, 4).unwrap_or(0);
    if reset_vector == 0 {
        log::warn!("hex loader: reset vector at address 4 is still zero after loading");
    }
    Ok(())
}
