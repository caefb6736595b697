//! Thin command-line shell around the emulator core.
//!
//! Runs a raw flat memory image: the file is mapped at `--base`, a stack is
//! appended on top, and execution starts at `--entry` (or the base). This is
//! deliberately not an ELF loader; it exists so the core can be driven and
//! traced without one.

use hexane::cpu::instr::{reg, OpSize, Register};
use hexane::cpu::{Cpu, FaultKind, Hooks, Interpreter};
use hexane::memory::MemImage;

use structopt::StructOpt;

use std::error::Error;
use std::path::PathBuf;
use std::{fs, process};

const STACK_SIZE: u64 = 1024 * 1024;

#[derive(Debug, StructOpt)]
#[structopt(name = "hexane", about = "AMD64 user-mode emulator.")]
struct Opt {
    /// Path to a raw flat image of AMD64 code.
    #[structopt(parse(from_os_str))]
    path: PathBuf,

    /// Virtual address the image is mapped at.
    #[structopt(long = "base", default_value = "4194304")] // 0x40_0000
    base: u64,

    /// Entry point; defaults to the image base.
    #[structopt(long = "entry")]
    entry: Option<u64>,

    /// Print every executed instruction.
    #[structopt(long = "trace")]
    trace: bool,
}

/// Just enough of a system-call surface to let test programs leave: `exit`
/// and `exit_group` end the run, `write` to stdout/stderr is passed through.
#[derive(Debug, Default)]
struct BareSyscalls {
    exit_code: i32,
}

impl Hooks for BareSyscalls {
    fn syscall(&mut self, cpu: Cpu<'_>) -> Result<(), FaultKind> {
        let nr = cpu.state.gp64(reg::RAX);
        match nr {
            // write
            1 => {
                let fd = cpu.state.gp64(reg::RDI);
                let buf = cpu.state.gp64(reg::RSI);
                let len = cpu.state.gp64(reg::RDX);
                let mut data = vec![0; len as usize];
                cpu.mem.read_bytes(buf, &mut data)?;
                use std::io::Write;
                match fd {
                    1 => {
                        let _ = std::io::stdout().write_all(&data);
                    }
                    2 => {
                        let _ = std::io::stderr().write_all(&data);
                    }
                    _ => {}
                }
                cpu.state
                    .write_reg(Register::new(reg::RAX, OpSize::Bits64), len);
            }
            // exit / exit_group
            60 | 231 => {
                self.exit_code = cpu.state.gp64(reg::RDI) as i32;
                cpu.control.end_emulation();
            }
            other => {
                return Err(FaultKind::Unsupported(format!(
                    "syscall {} is not implemented by this shell",
                    other
                )));
            }
        }
        Ok(())
    }
}

fn run() -> Result<i32, Box<dyn Error>> {
    let opt = Opt::from_args();

    let code = fs::read(&opt.path)?;
    eprintln!("loaded '{}' ({} bytes)", opt.path.display(), code.len());

    // Image layout: code, then the stack. The stack top holds an empty
    // argc/argv/envp block the way a loader would build one.
    let mut mem = code;
    let code_len = mem.len() as u64;
    mem.resize((code_len + STACK_SIZE) as usize, 0);
    let stack_top = opt.base + code_len + STACK_SIZE - 64;

    let mut image = MemImage::new(mem, opt.base, STACK_SIZE, stack_top);
    image.write_u64(stack_top, 0)?; // argc = 0
    image.write_u64(stack_top + 8, 0)?; // argv terminator
    image.write_u64(stack_top + 16, 0)?; // envp terminator

    let entry = opt.entry.unwrap_or(opt.base);
    let mut cpu = Interpreter::new(image, entry, BareSyscalls::default());
    cpu.trace_instructions(opt.trace);

    let executed = cpu.run()?;
    eprintln!("retired {} instructions", executed);
    Ok(cpu.hooks_mut().exit_code)
}

fn main() {
    // By default, log all `info!` messages and higher; `--trace` output is
    // `trace!`-level and needs RUST_LOG=trace (or hexane=trace) to show.
    env_logger::Builder::from_default_env()
        .filter(None, log::LevelFilter::Info)
        .init();

    match run() {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("exiting due to error: {}", e);
            process::exit(1);
        }
    }
}
