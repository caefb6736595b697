//! An AMD64 user-mode emulator core.
//!
//! The crate interprets statically linked long-mode code: the integer
//! instruction set, the x87 FPU with its 80-bit register stack, and
//! SSE/SSE2. Program loading, system-call semantics and symbolication stay
//! with the host, which plugs in through [`cpu::Hooks`].
//!
//! The usual round trip:
//!
//! ```no_run
//! use hexane::cpu::{Interpreter, interpret::NullHooks};
//! use hexane::memory::MemImage;
//!
//! // A loader built this image: code, data and a stack at the top.
//! let image = MemImage::new(vec![0; 0x10000], 0x40_0000, 0x4000, 0x41_0000);
//! let mut cpu = Interpreter::new(image, 0x40_0000, NullHooks);
//! let executed = cpu.run().unwrap_or_else(|fault| panic!("{}", fault));
//! println!("retired {} instructions", executed);
//! ```

#![doc(html_root_url = "https://docs.rs/hexane/0.1.0")]
#![warn(missing_debug_implementations)]

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate bitpat;
#[macro_use]
extern crate log;
#[macro_use]
extern crate num_derive;

pub mod cpu;
pub mod f80;
pub mod memory;
