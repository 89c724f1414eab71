//! `heapscope <pid> <addr-hex> [major minor]`
//!
//! Attaches to a target interpreter, resolves the type name of the object at
//! the given address and lists the first few memory regions. Mostly a smoke
//! test that the reader and decoder wired up for this platform work.

use std::error::Error;
use std::process::ExitCode;

use log::info;

use heapscope_abi_cp310::Cp310Abi;
use heapscope_core::prelude::*;

fn main() -> ExitCode {
    env_logger::init();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(1)
        }
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let mut args = pico_args::Arguments::from_env();
    if args.contains(["-h", "--help"]) {
        print_usage();
        return Ok(());
    }

    let pid: u32 = args.free_from_str()?;
    let addr = parse_addr(&args.free_from_str::<String>()?)?;
    let major: u32 = args.opt_free_from_str()?.unwrap_or(3);
    let minor: u32 = args.opt_free_from_str()?.unwrap_or(10);

    let mut reader = create_reader()?;
    info!("attaching to process {pid}");
    if !reader.attach(pid) {
        return Err(format!("failed to attach to process {pid}").into());
    }

    let abi = create_abi(major, minor)
        .ok_or_else(|| format!("no decoder available for CPython {major}.{minor}"))?;
    info!("decoding with {}", abi.version_string());

    println!("Type name: {}", abi.type_name(addr, reader.as_ref()));

    println!();
    println!("Memory regions:");
    let regions = reader.regions();
    for region in regions.iter().take(10) {
        println!("{region}");
    }
    if regions.len() > 10 {
        println!("... (and {} more regions)", regions.len() - 10);
    }

    reader.detach();
    Ok(())
}

#[cfg(target_os = "linux")]
fn create_reader() -> Result<Box<dyn ProcessReader>, Box<dyn Error>> {
    Ok(Box::new(heapscope_reader_linux::LinuxReader::new()))
}

/// Platforms without a statically linked reader fall back to the plugin
/// loader and its conventional per-OS filenames.
#[cfg(not(target_os = "linux"))]
fn create_reader() -> Result<Box<dyn ProcessReader>, Box<dyn Error>> {
    Ok(Box::new(load_reader()?))
}

fn create_abi(major: u32, minor: u32) -> Option<Box<dyn PythonAbi>> {
    if (major, minor) == (3, 10) {
        return Some(Box::new(Cp310Abi::new()));
    }
    load_abi(major, minor).map(|plugin| Box::new(plugin) as Box<dyn PythonAbi>)
}

fn parse_addr(raw: &str) -> Result<u64, Box<dyn Error>> {
    let hex = raw.strip_prefix("0x").unwrap_or(raw);
    u64::from_str_radix(hex, 16).map_err(|_| format!("invalid address `{raw}`").into())
}

fn print_usage() {
    eprintln!("Usage: heapscope <pid> <addr-hex> [python_major python_minor]");
    eprintln!("Example: heapscope 1234 0x7ffabcdef000 3 10");
}
