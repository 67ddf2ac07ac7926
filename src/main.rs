//! Bytecode runner.
//!
//! Assembles or loads a program and executes it on a fresh machine.
//!
//! # Usage
//! ```text
//! scopevm <program.asm|program.bin> [OPTIONS]
//! ```
//!
//! # Arguments
//! - `program`: Assembly source (`.asm`) or binary container produced by `assembler`
//!
//! # Options
//! - `--stack <n>`: Register stack size, overriding the program header
//! - `--frames <n>`: Call depth and collector frame limit
//! - `--heap <n>`: Maximum number of live heap allocations
//! - `--disassemble`: Print the program listing instead of running it
//!
//! # Exit status
//! `0` on a clean halt, the halting [`ErrorKind`] code on a runtime fault and `1`
//! when the program cannot be loaded.

use scopevm::virtual_machine::assembler::{assemble_source, render_diagnostic};
use scopevm::virtual_machine::errors::{ErrorKind, VMError};
use scopevm::virtual_machine::program::Program;
use scopevm::virtual_machine::vm::Machine;
use scopevm::{error, info};
use std::env;
use std::fs;
use std::path::Path;
use std::process;

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        print_usage(&args[0]);
        process::exit(if args.len() < 2 { 1 } else { 0 });
    }

    let input_path = &args[1];
    let mut stack: Option<usize> = None;
    let mut frames: Option<usize> = None;
    let mut heap: Option<usize> = None;
    let mut disassemble = false;

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            k @ ("--stack" | "--frames" | "--heap") => {
                i += 1;
                if i >= args.len() {
                    error!("{k} requires an argument");
                    process::exit(1);
                }
                let value = args[i].parse::<usize>().unwrap_or_else(|_| {
                    error!("Invalid value for {k}: '{}' is not a valid number", args[i]);
                    process::exit(1);
                });
                match k {
                    "--stack" => stack = Some(value),
                    "--frames" => frames = Some(value),
                    _ => heap = Some(value),
                }
                i += 1;
            }
            "--disassemble" => {
                disassemble = true;
                i += 1;
            }
            other => {
                error!("Unexpected argument: {}\n", other);
                print_usage(&args[0]);
                process::exit(1);
            }
        }
    }

    if !Path::new(input_path).exists() {
        error!("Input file does not exist: {}", input_path);
        process::exit(1);
    }

    let program = load_program(input_path).unwrap_or_else(|e| {
        error!("{e}");
        process::exit(1)
    });

    if disassemble {
        print!("{}", program.disassemble());
        return;
    }

    let mut config = program.header().config();
    if let Some(stack) = stack {
        config.stack_size = stack;
    }
    if let Some(frames) = frames {
        config.frame_limit = frames;
    }
    if let Some(heap) = heap {
        config.heap_limit = heap;
    }

    let mut machine = Machine::new(config).unwrap_or_else(|e| {
        error!("{e}");
        process::exit(1)
    });
    if let Err(e) = machine.load(&program) {
        error!("{e}");
        process::exit(1);
    }

    match machine.run(&program) {
        Ok(()) => {
            info!(
                "{} halted cleanly ({} live allocations)",
                input_path,
                machine.heap().live()
            );
            let released = machine.release();
            if released > 0 {
                info!("released {released} allocations at shutdown");
            }
        }
        Err(fault) => {
            error!("{fault}");
            process::exit(exit_code(fault.kind));
        }
    }
}

/// Assembles `.asm` sources and decodes everything else as a binary container.
fn load_program(path: &str) -> Result<Program, String> {
    let is_source = Path::new(path)
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("asm"));
    if !is_source {
        return Program::load(path).map_err(|e| e.to_string());
    }

    let source = fs::read_to_string(path).map_err(|e| {
        VMError::IoError {
            path: path.to_string(),
            source: e.to_string(),
        }
        .to_string()
    })?;
    assemble_source(&source).map_err(|e| render_diagnostic(path, &source, &e))
}

fn exit_code(kind: ErrorKind) -> i32 {
    match kind.code() {
        0 => 1,
        code => i32::from(code),
    }
}

const USAGE: &str = "\
Bytecode Runner

USAGE:
    {program} <program> [OPTIONS]

ARGS:
    <program>    Assembly source (.asm) or binary program

OPTIONS:
    --stack <n>      Register stack size (defaults to the program header)
    --frames <n>     Call depth and collector frame limit
    --heap <n>       Maximum number of live heap allocations
    --disassemble    Print the program listing instead of running it
    -h, --help       Print this help message

EXAMPLES:
    # Run an assembly source directly
    {program} program.asm

    # Run a compiled program with a deeper call stack
    {program} program.bin --frames 1024

    # Inspect a compiled program
    {program} program.bin --disassemble
";

fn print_usage(program: &str) {
    info!("{}", USAGE.replace("{program}", program));
}
