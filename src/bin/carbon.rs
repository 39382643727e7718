//! Minimal demonstration binary: boots a trivial HLT payload on an
//! x86_64 guest and reports how it terminated.
//!
//! Carried over from the teacher's `main.rs`, cut down to the scenario
//! the core's own test suite exercises (a 3-byte `F4` payload at a fixed
//! guest physical address) — bzImage/initrd loading is out of scope for
//! this core and lives only in `original_source/`.

use std::collections::HashMap;
use std::num::ParseIntError;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use carbon::config::{ConfiguredArchitecture, MemorySize, MsrPolicy, VmConfig};
use carbon::devices::{Cmos, Serial};
use carbon::hypervisor::VmHypervisor;
use carbon::platform::kvm::KvmHypervisor;
use carbon::register::{Register, RegisterValue, X86Register};
use carbon::VmmError;

#[derive(Parser, Debug)]
#[command(name = "carbon")]
#[command(about = "Boots a trivial HLT payload and reports how the guest terminated")]
struct Args {
    /// Optional VmConfig TOML file. Without one, boots a 2 MiB x86_64 VM.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Guest physical address the HLT payload is written to and the
    /// vCPU starts executing from.
    #[arg(long, default_value = "0x1000")]
    entry: String,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("carbon: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = match &args.config {
        Some(path) => toml::from_str(&std::fs::read_to_string(path)?)?,
        None => VmConfig {
            memory_size: MemorySize::mib(2),
            arch: Some(ConfiguredArchitecture::X86_64),
            msr_policy: MsrPolicy::default(),
        },
    };

    if matches!(config.arch, Some(ConfiguredArchitecture::Arm64)) {
        return Err("this demo binary only boots the x86_64 HLT scenario; pass an x86_64 config".into());
    }

    let entry = parse_u64(&args.entry)?;

    let mut builder = VmHypervisor::<KvmHypervisor>::build(&config)?;
    builder.add_device(Box::new(Serial::new()))?;
    builder.add_device(Box::new(Cmos::new()))?;
    let vm = builder.build()?;

    vm.write_memory(entry, &[0xF4])?; // HLT

    let mut registers = HashMap::new();
    registers.insert(Register::X86(X86Register::Rip), RegisterValue::U64(entry));
    vm.executor().set_registers(registers)?;

    tracing::info!(entry, "booting HLT payload");
    match vm.run() {
        Err(VmmError::VmHalted) => {
            println!("guest halted cleanly");
            Ok(())
        }
        Err(e) => Err(Box::new(e)),
        Ok(()) => unreachable!("VirtualMachine::run never returns Ok"),
    }
}

fn parse_u64(s: &str) -> Result<u64, ParseIntError> {
    match s.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    }
}
