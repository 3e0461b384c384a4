// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A GDB Remote Serial Protocol stub covering the subset the CLI driver
//! needs: `g`/`G` (read/write all registers), `m`/`M` (read/write memory),
//! `c`/`s` (continue/step), `Z0`/`z0` (software breakpoints), and `?`
//! (last stop reason).
//!
//! Packet framing is `$...#checksum` with `+`/`-` acknowledgement; the
//! `g`/`G` register layout is R0-R12, SP, LR, PC, xPSR as little-endian
//! hex. The server blocks on its own socket and is driven by a single
//! call the CLI driver makes between `Cpu::step` calls, since the driver
//! is a single-threaded loop with no second thread to hand control to.

#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};

use armsim_abi::SimError;
use armsim_bus::Bus;
use armsim_cpu::Cpu;

/// What the debugger asked the simulation to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    Continue,
    Step,
    /// The client sent `k` (kill) or dropped the connection.
    Detach,
}

pub struct GdbServer {
    listener: TcpListener,
    stream: Option<TcpStream>,
    breakpoints: HashSet<u32>,
}

impl GdbServer {
    pub fn bind(port: u16) -> Result<Self, SimError> {
        let listener = TcpListener::bind(("127.0.0.1", port))?;
        log::info!("gdb: listening on 127.0.0.1:{port}");
        Ok(Self { listener, stream: None, breakpoints: HashSet::new() })
    }

    /// Blocks until a debugger connects. Single-client: a second `connect`
    /// while one session is active replaces it, matching the original
    /// server's one-`m_client_socket`-at-a-time design.
    pub fn accept(&mut self) -> Result<(), SimError> {
        let (stream, addr) = self.listener.accept()?;
        log::info!("gdb: client connected from {addr}");
        self.stream = Some(stream);
        Ok(())
    }

    pub fn breakpoints(&self) -> &HashSet<u32> {
        &self.breakpoints
    }

    /// Sends the `S05` (SIGTRAP) stop notification used for both breakpoint
    /// hits and single-step completion.
    pub fn notify_stop(&mut self) -> Result<(), SimError> {
        self.send_packet("S05")
    }

    /// Processes GDB commands until the debugger requests `c` or `s`, at
    /// which point the driver resumes the simulation. Returns
    /// `Resume::Detach` if the client disconnects or sends `k`.
    pub fn serve_until_resume(&mut self, cpu: &mut Cpu, bus: &mut Bus) -> Result<Resume, SimError> {
        loop {
            let packet = match self.receive_packet()? {
                Some(packet) => packet,
                None => return Ok(Resume::Detach),
            };
            if packet.is_empty() {
                continue;
            }
            match packet.as_bytes()[0] {
                b'g' => {
                    let response = read_registers(cpu);
                    self.send_packet(&response)?;
                }
                b'G' => {
                    let response = write_registers(cpu, &packet[1..]);
                    self.send_packet(response)?;
                }
                b'm' => {
                    let response = self.read_memory(bus, &packet[1..]);
                    self.send_packet(&response)?;
                }
                b'M' => {
                    let response = self.write_memory(bus, &packet);
                    self.send_packet(response)?;
                }
                b'c' => return Ok(Resume::Continue),
                b's' => return Ok(Resume::Step),
                b'Z' | b'z' => {
                    let response = self.handle_breakpoint(&packet);
                    self.send_packet(response)?;
                }
                b'q' => {
                    let response = handle_query(&packet[1..]);
                    self.send_packet(response)?;
                }
                b'?' => self.send_packet("S05")?,
                b'k' => return Ok(Resume::Detach),
                _ => self.send_packet("")?,
            }
        }
    }

    fn handle_breakpoint(&mut self, packet: &str) -> &'static str {
        if packet.len() < 5 {
            return "E01";
        }
        let insert = packet.as_bytes()[0] == b'Z';
        if packet.as_bytes()[1] != b'0' {
            return ""; // only software breakpoints supported
        }
        let rest = &packet[2..];
        let mut parts = rest.splitn(3, ',');
        let _kind = parts.next();
        let addr_str = match parts.next() {
            Some(s) => s,
            None => return "E01",
        };
        let address = match parse_hex(addr_str) {
            Some(v) => v,
            None => return "E01",
        };
        if insert {
            self.breakpoints.insert(address);
        } else {
            self.breakpoints.remove(&address);
        }
        "OK"
    }

    fn read_memory(&self, bus: &mut Bus, addr_len: &str) -> String {
        let Some((addr_str, len_str)) = addr_len.split_once(',') else {
            return "E01".to_string();
        };
        let (Some(address), Some(length)) = (parse_hex(addr_str), parse_hex(len_str)) else {
            return "E01".to_string();
        };
        if length > 1024 {
            return "E02".to_string();
        }
        let mut response = String::with_capacity(length as usize * 2);
        for i in 0..length {
            match bus.debug_read(address + i, 1) {
                Ok(byte) => response.push_str(&format!("{:02x}", byte as u8)),
                Err(_) => return "E03".to_string(),
            }
        }
        response
    }

    fn write_memory(&self, bus: &mut Bus, packet: &str) -> &'static str {
        let Some(comma_pos) = packet.find(',') else {
            return "E01";
        };
        let Some(colon_pos) = packet[comma_pos..].find(':').map(|p| p + comma_pos) else {
            return "E01";
        };
        let Some(address) = parse_hex(&packet[1..comma_pos]) else {
            return "E01";
        };
        let Some(length) = parse_hex(&packet[comma_pos + 1..colon_pos]) else {
            return "E01";
        };
        let data = &packet[colon_pos + 1..];
        if data.len() as u32 != length * 2 {
            return "E02";
        }
        for i in 0..length as usize {
            let Some(byte) = parse_hex(&data[i * 2..i * 2 + 2]) else {
                return "E03";
            };
            if bus.debug_write(address + i as u32, 1, byte).is_err() {
                return "E03";
            }
        }
        "OK"
    }

    /// Reads one `$...#checksum` packet, acking/nacking as it goes,
    /// accumulating across reads since a packet can arrive split across
    /// TCP segments. A `Ok(None)` means the client closed the connection.
    fn receive_packet(&mut self) -> Result<Option<String>, SimError> {
        let stream = self.stream.as_mut().ok_or_else(|| SimError::GdbProtocol("no client connected".into()))?;
        let mut acc: Vec<u8> = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            if let Some(start) = acc.iter().position(|&b| b == b'$') {
                if let Some(hash) = acc[start..].iter().position(|&b| b == b'#') {
                    let hash = start + hash;
                    if hash + 2 < acc.len() {
                        let body = acc[start + 1..hash].to_vec();
                        let checksum_bytes = &acc[hash + 1..hash + 3];
                        let received =
                            u8::from_str_radix(std::str::from_utf8(checksum_bytes).unwrap_or("00"), 16).unwrap_or(0);
                        let calculated = checksum(&body);
                        if received == calculated {
                            stream.write_all(b"+")?;
                            return Ok(Some(String::from_utf8_lossy(&body).into_owned()));
                        } else {
                            stream.write_all(b"-")?;
                            acc.drain(..=hash + 2);
                            continue;
                        }
                    }
                }
            }
            let n = stream.read(&mut buf)?;
            if n == 0 {
                return Ok(None);
            }
            acc.extend_from_slice(&buf[..n]);
        }
    }

    fn send_packet(&mut self, data: &str) -> Result<(), SimError> {
        let stream = self.stream.as_mut().ok_or_else(|| SimError::GdbProtocol("no client connected".into()))?;
        let sum = checksum(data.as_bytes());
        let packet = format!("${data}#{sum:02x}");
        log::debug!("gdb: sending {packet}");
        stream.write_all(packet.as_bytes())?;
        Ok(())
    }
}

fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |sum, &b| sum.wrapping_add(b))
}

fn parse_hex(hex: &str) -> Option<u32> {
    u32::from_str_radix(hex, 16).ok()
}

/// GDB's register order for this target: R0-R12, SP, LR, PC, xPSR, each as
/// 8 little-endian hex digits.
fn read_registers(cpu: &Cpu) -> String {
    let mut response = String::with_capacity(17 * 8);
    for i in 0..13 {
        response.push_str(&le_hex32(cpu.regs.read(i).unwrap_or(0)));
    }
    response.push_str(&le_hex32(cpu.regs.sp()));
    response.push_str(&le_hex32(cpu.regs.lr()));
    response.push_str(&le_hex32(cpu.regs.pc()));
    response.push_str(&le_hex32(cpu.regs.xpsr()));
    response
}

fn write_registers(cpu: &mut Cpu, data: &str) -> &'static str {
    if data.len() < 16 * 8 {
        return "E02";
    }
    for i in 0..13u32 {
        let Some(value) = parse_le_hex32(&data[i as usize * 8..i as usize * 8 + 8]) else {
            return "E01";
        };
        let _ = cpu.regs.write(i, value);
    }
    let (Some(sp), Some(lr), Some(pc)) = (
        parse_le_hex32(&data[13 * 8..14 * 8]),
        parse_le_hex32(&data[14 * 8..15 * 8]),
        parse_le_hex32(&data[15 * 8..16 * 8]),
    ) else {
        return "E01";
    };
    cpu.regs.set_sp(sp);
    cpu.regs.set_lr(lr);
    cpu.regs.set_pc(pc);
    if data.len() >= 17 * 8 {
        if let Some(xpsr) = parse_le_hex32(&data[16 * 8..17 * 8]) {
            cpu.regs.set_xpsr(xpsr);
        }
    }
    "OK"
}

fn le_hex32(value: u32) -> String {
    let bytes = value.to_le_bytes();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn parse_le_hex32(hex: &str) -> Option<u32> {
    if hex.len() != 8 {
        return None;
    }
    let mut bytes = [0u8; 4];
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(u32::from_le_bytes(bytes))
}

fn handle_query(query: &str) -> &'static str {
    if query.starts_with("Supported") {
        "PacketSize=4000"
    } else if query == "C" {
        "QC1"
    } else {
        ""
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armsim_bus::Memory;

    fn make_bus() -> Bus {
        let mut bus = Bus::new();
        bus.add_device("ram", 0, 0x1000, true, Box::new(Memory::new(0x1000))).unwrap();
        bus
    }

    #[test]
    fn checksum_matches_simple_sum() {
        assert_eq!(checksum(b"OK"), (b'O' as u8).wrapping_add(b'K'));
    }

    #[test]
    fn le_hex_round_trips() {
        let hex = le_hex32(0x1234_5678);
        assert_eq!(hex, "78563412");
        assert_eq!(parse_le_hex32(&hex), Some(0x1234_5678));
    }

    #[test]
    fn read_registers_reports_reset_state() {
        let cpu = Cpu::new(0x2000_1000);
        let response = read_registers(&cpu);
        assert_eq!(response.len(), 17 * 8);
    }

    #[test]
    fn write_registers_rejects_short_packets() {
        let mut cpu = Cpu::new(0x2000_1000);
        assert_eq!(write_registers(&mut cpu, "0011"), "E02");
    }

    #[test]
    fn breakpoint_insert_and_remove_round_trip() {
        let mut server = GdbServer { listener: TcpListener::bind("127.0.0.1:0").unwrap(), stream: None, breakpoints: HashSet::new() };
        assert_eq!(server.handle_breakpoint("Z0,1000,2"), "OK");
        assert!(server.breakpoints().contains(&0x1000));
        assert_eq!(server.handle_breakpoint("z0,1000,2"), "OK");
        assert!(!server.breakpoints().contains(&0x1000));
    }

    #[test]
    fn read_memory_reports_zeroed_ram() {
        let server = GdbServer { listener: TcpListener::bind("127.0.0.1:0").unwrap(), stream: None, breakpoints: HashSet::new() };
        let mut bus = make_bus();
        assert_eq!(server.read_memory(&mut bus, "0,4"), "00000000");
    }

    #[test]
    fn write_memory_then_read_back() {
        let server = GdbServer { listener: TcpListener::bind("127.0.0.1:0").unwrap(), stream: None, breakpoints: HashSet::new() };
        let mut bus = make_bus();
        assert_eq!(server.write_memory(&mut bus, "M10,2:abcd"), "OK");
        assert_eq!(server.read_memory(&mut bus, "10,2"), "abcd");
    }
}
