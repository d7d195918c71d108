// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2025 minivisor authors

use clap::Parser;

use std::error::Error;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use minivisor::files::FileInput;
use minivisor::types::PAGE_SIZE;
use minivisor::vm::{RunEnd, Vm, VmConfig};

#[derive(Parser, Debug)]
#[command(about = "Boot a guest kernel under KVM and run a target binary inside it")]
struct Args {
    /// Guest kernel ELF file
    kernel: PathBuf,

    /// Target binary handed to the guest kernel
    target: Option<PathBuf>,

    /// Guest memory size in MiB
    #[arg(short, long, default_value_t = 512)]
    memory: usize,

    /// File-backed input made visible to the guest (repeatable)
    #[arg(short, long = "file")]
    files: Vec<PathBuf>,

    /// Arguments passed to the target binary
    #[arg(last = true)]
    target_args: Vec<String>,
}

/// Plain stderr logger for the host side.
#[derive(Debug)]
struct HostLogger;

impl log::Log for HostLogger {
    fn enabled(&self, _metadata: &log::Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &log::Record<'_>) {
        eprintln!(
            "[minivisor] {}: {}",
            record.metadata().level().as_str(),
            record.args()
        );
    }

    fn flush(&self) {}
}

static HOST_LOGGER: HostLogger = HostLogger;

fn build_config(args: &Args) -> Result<VmConfig, Box<dyn Error>> {
    let kernel = fs::read(&args.kernel)?;
    let user = match &args.target {
        Some(path) => Some(fs::read(path)?),
        None => None,
    };

    let mut files = Vec::new();
    for path in &args.files {
        files.push(FileInput::from_path(path)?);
    }

    let mut argv = Vec::new();
    if let Some(target) = &args.target {
        argv.push(target.display().to_string());
    }
    argv.extend(args.target_args.iter().cloned());

    Ok(VmConfig {
        mem_size: args
            .memory
            .checked_mul(1024 * 1024)
            .filter(|size| *size >= 16 * PAGE_SIZE)
            .ok_or("invalid memory size")?,
        kernel,
        user,
        files,
        argv,
        envp: Vec::new(),
    })
}

fn main() -> ExitCode {
    if log::set_logger(&HOST_LOGGER).is_ok() {
        log::set_max_level(log::LevelFilter::Info);
    }

    let args = Args::parse();
    match run(&args) {
        Ok(RunEnd::Exit) => {
            log::info!("guest finished normally");
            ExitCode::SUCCESS
        }
        Ok(RunEnd::Fault(info)) => {
            log::error!(
                "guest faulted: {:?} at rip {:#x}, address {:#x}",
                info.kind(),
                { info.rip },
                { info.fault_addr },
            );
            ExitCode::from(101)
        }
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(target_os = "linux")]
fn run(args: &Args) -> Result<RunEnd, Box<dyn Error>> {
    use minivisor::backend::kvm::{self, KvmVcpu};

    if !kvm::is_available() {
        return Err("KVM with user memory support is not available".into());
    }

    let config = build_config(args)?;
    let mut vm = Vm::new(config)?;

    let (host_base, mem_size) = vm.host_memory();
    // SAFETY: the allocation belongs to `vm`, which outlives the vCPU.
    let mut vcpu = unsafe { KvmVcpu::new(host_base, mem_size)? };

    Ok(vm.run(&mut vcpu)?)
}

#[cfg(not(target_os = "linux"))]
fn run(_args: &Args) -> Result<RunEnd, Box<dyn Error>> {
    Err("no virtualization backend on this platform".into())
}
