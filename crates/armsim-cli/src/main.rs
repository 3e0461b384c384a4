// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The simulation driver: wires up the bus, memory, NVIC, timer and
//! SysTick peripherals, loads one or more Intel-HEX images, and steps the
//! CPU until it halts, hits `--max-instructions`, or a GDB client takes
//! over stepping. `--max-instructions` stands in for a wall-clock or
//! simulated-time run budget, since this driver has no discrete-event
//! scheduler to hand one to.

use std::cell::RefCell;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{Context, Result};
use clap::Parser;

use armsim_bus::{Bus, Memory};
use armsim_cpu::{Cpu, NvicMmio, StepOutcome};
use armsim_gdb::{GdbServer, Resume};
use armsim_peripherals::{SysTick, SysTickMmio, Timer, TimerMmio, Trace};

const ADDR_NVIC_LOW: u32 = 0xE000_E100;
const ADDR_NVIC_LOW_SIZE: u32 = 0x3FC; // covers ISER..ICPR..IPR0-7
const ADDR_NVIC_HIGH: u32 = 0xE000_ED1C;
const ADDR_NVIC_HIGH_SIZE: u32 = 0x0C; // SHPR2, SHPR3, SHCSR
const ADDR_SYSTICK: u32 = 0xE000_E010;
const ADDR_SYSTICK_SIZE: u32 = 0x10;
const ADDR_TRACE: u32 = 0x4000_0000;
const ADDR_TRACE_SIZE: u32 = 0x4;
const ADDR_TIMER: u32 = 0x4000_1000;
const ADDR_TIMER_SIZE: u32 = 0x10;

/// ARMv6-M instruction-set simulator.
#[derive(Debug, Parser)]
#[clap(max_term_width = 100, about = "ARMv6-M (Cortex-M0/M0+) instruction set simulator")]
struct Args {
    /// Intel-HEX firmware image to load. May be given more than once; later
    /// files are loaded after earlier ones onto the same memory.
    #[clap(long = "hex")]
    hex_files: Vec<PathBuf>,

    /// Base address of the simulated RAM/flash region.
    #[clap(long, default_value_t = 0, parse(try_from_str = parse_u32))]
    ram_base: u32,

    /// Size in bytes of the simulated RAM/flash region.
    #[clap(long, default_value_t = 0x10_0000, parse(try_from_str = parse_u32))]
    ram_size: u32,

    /// Log verbosity (error, warn, info, debug, trace).
    #[clap(long, default_value = "info")]
    log: String,

    /// Shorthand for --log debug.
    #[clap(long)]
    debug: bool,

    /// Enables the trace console peripheral's file sink, written to
    /// trace_output.txt alongside its always-on stdout echo.
    #[clap(long)]
    trace: bool,

    /// Enables the GDB server on the default port (3333).
    #[clap(long)]
    gdb: bool,

    /// Enables the GDB server on a specific port (implies --gdb).
    #[clap(long)]
    gdb_port: Option<u16>,

    /// Stops the simulation after this many retired instructions. Runs
    /// forever if unset (until a fault halts the CPU or the debugger
    /// disconnects).
    #[clap(long)]
    max_instructions: Option<u64>,
}

fn parse_u32(s: &str) -> Result<u32, std::num::ParseIntError> {
    if let Some(hex) = s.strip_prefix("0x") {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse()
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.debug { "debug" } else { args.log.as_str() };
    env_logger::Builder::new().parse_filters(level).init();

    let mut bus = Bus::new();
    bus.add_device("memory", args.ram_base, args.ram_size, true, Box::new(Memory::new(args.ram_size)))?;

    let mut cpu = Cpu::new(args.ram_base);
    let nvic = cpu.nvic_handle();
    bus.add_device("nvic-low", ADDR_NVIC_LOW, ADDR_NVIC_LOW_SIZE, false, Box::new(NvicMmio::new(Rc::clone(&nvic))))?;
    bus.add_device("nvic-high", ADDR_NVIC_HIGH, ADDR_NVIC_HIGH_SIZE, false, Box::new(NvicMmio::new(Rc::clone(&nvic))))?;

    let systick = Rc::new(RefCell::new(SysTick::new(Rc::clone(&nvic))));
    bus.add_device("systick", ADDR_SYSTICK, ADDR_SYSTICK_SIZE, false, Box::new(SysTickMmio::new(Rc::clone(&systick))))?;

    let timer = Rc::new(RefCell::new(Timer::new(armsim_abi::EXC_IRQ0, Rc::clone(&nvic))));
    bus.add_device("timer", ADDR_TIMER, ADDR_TIMER_SIZE, true, Box::new(TimerMmio::new(Rc::clone(&timer))))?;

    let trace_device = if args.trace {
        let file = File::create("trace_output.txt").context("creating trace_output.txt")?;
        Trace::with_file(file)
    } else {
        Trace::new()
    };
    bus.add_device("trace", ADDR_TRACE, ADDR_TRACE_SIZE, true, Box::new(trace_device))?;

    for hex_path in &args.hex_files {
        log::info!("loading HEX image {}", hex_path.display());
        let file = File::open(hex_path).with_context(|| format!("opening {}", hex_path.display()))?;
        armsim_loader::load_hex(BufReader::new(file), &mut bus)?;
    }

    if !args.hex_files.is_empty() && bus.debug_read(4, 4).unwrap_or(0) == 0 {
        anyhow::bail!(
            "reset vector at address 0x00000004 is still zero after loading; refusing to \
             boot a CPU with an undefined entry point"
        );
    }

    let gdb_port = args.gdb_port.or(if args.gdb { Some(3333) } else { None });
    let mut gdb = match gdb_port {
        Some(port) => {
            let mut server = GdbServer::bind(port)?;
            println!("waiting for GDB connection on 127.0.0.1:{port}");
            server.accept()?;
            Some(server)
        }
        None => None,
    };

    let mut retired: u64 = 0;
    let mut single_stepping = gdb.is_some();

    'run: loop {
        if let Some(max) = args.max_instructions {
            if retired >= max {
                log::info!("stopping: reached --max-instructions={max}");
                break;
            }
        }

        let at_breakpoint =
            gdb.as_ref().map(|g| g.breakpoints().contains(&cpu.regs.pc())).unwrap_or(false);

        if let Some(server) = gdb.as_mut() {
            if single_stepping || at_breakpoint {
                if at_breakpoint {
                    server.notify_stop()?;
                }
                match server.serve_until_resume(&mut cpu, &mut bus)? {
                    Resume::Continue => single_stepping = false,
                    Resume::Step => single_stepping = true,
                    Resume::Detach => {
                        log::info!("gdb client detached");
                        break 'run;
                    }
                }
            }
        }

        // Peripherals see one tick of simulated progress per step, ahead
        // of the CPU's own exception check, matching the original
        // firmware's `timer_thread` ticking independently of instruction
        // retirement but close enough for a cycle-approximate simulator.
        timer.borrow_mut().tick();
        systick.borrow_mut().tick();

        let outcome = cpu.step(&mut bus);
        match outcome {
            StepOutcome::Retired | StepOutcome::ExceptionEntered(_) | StepOutcome::ExceptionReturned => {
                retired += 1;
            }
            StepOutcome::Breakpoint(code) => {
                log::info!("BKPT #{code} hit at pc={:#010x}", cpu.regs.pc());
                if let Some(server) = gdb.as_mut() {
                    server.notify_stop()?;
                    single_stepping = true;
                }
            }
            StepOutcome::Halted(fault) => {
                log::error!("simulation halted: {fault}");
                break;
            }
        }

        if single_stepping {
            if let Some(server) = gdb.as_mut() {
                server.notify_stop()?;
            }
        }
    }

    log::info!("retired {retired} instructions");
    Ok(())
}
