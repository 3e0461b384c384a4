// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The instruction-level CPU: register file, ALU primitives, the Thumb-1
//! execution engine, the NVIC and its MMIO window, and the top-level step
//! loop that ties them together.

mod alu;
mod cpu;
mod execute;
mod nvic;
mod registers;

pub use cpu::{Cpu, StepOutcome};
pub use execute::ExecOutcome;
pub use nvic::{Nvic, NvicMmio};
pub use registers::{Control, RegisterFile};
