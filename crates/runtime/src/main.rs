#![deny(clippy::all, clippy::pedantic)]
#![allow(clippy::unnecessary_wraps)]

//! Command-line driver for `kernel_dispatch`: lists adapters and runs the
//! bundled `add_assign` kernel end to end.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use kernel_dispatch::{
    legacy_device_index, Backend, BindGroup, ComputingConfig, CustomSettings, DataBinder, Kernel,
    MemorySetting, PowerPreference, SpeedSetting,
};
use tracing_subscriber::EnvFilter;

const ADD_ASSIGN: &str = include_str!("../../../shaders/add_assign.wgsl");
const WORKGROUP_SIZE: usize = 10;

#[derive(Parser)]
#[command(name = "dispatch_main", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Log every adapter the backend reports.
    Devices {
        #[arg(long, default_value_t = Backend::All)]
        backend: Backend,
    },
    /// Run `out[i] += in[i]` over two arrays of ones.
    Add(AddArgs),
}

#[derive(Args)]
struct AddArgs {
    #[arg(long, default_value_t = 60_000)]
    len: usize,
    #[arg(long)]
    backend: Option<Backend>,
    #[arg(long)]
    power: Option<PowerPreference>,
    #[arg(long)]
    speed: Option<SpeedSetting>,
    #[arg(long)]
    memory: Option<MemorySetting>,
    /// Adapter position within the backend; negative picks automatically.
    #[arg(long, allow_negative_numbers = true)]
    device: Option<i64>,
}

impl AddArgs {
    /// Environment defaults with command-line flags on top.
    fn config(&self) -> Result<ComputingConfig> {
        let mut config = ComputingConfig::from_env()?;
        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        if let Some(power) = self.power {
            config.power = power;
        }
        if let Some(speed) = self.speed {
            config.speed = speed;
        }
        if let Some(memory) = self.memory {
            config.memory = memory;
        }
        if let Some(device) = self.device {
            config.device_index = legacy_device_index(device);
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Cli::parse().command {
        Command::Devices { backend } => list_devices(backend),
        Command::Add(args) => run_add(&args),
    }
}

fn list_devices(backend: Backend) -> Result<()> {
    let runtime = kernel_dispatch::default_runtime();
    let devices = runtime.get_computing_gpu_infos(backend);
    if devices.is_empty() {
        tracing::warn!("no adapters on backend `{backend}`");
    }
    for (index, info) in devices.iter().enumerate() {
        tracing::info!(
            "[{index}] {} ({:?}, {}) vendor={:#06x} device={:#06x} driver={} {}",
            info.name,
            info.device_type,
            info.backend,
            info.vendor,
            info.device,
            info.driver,
            info.driver_info
        );
    }
    runtime.free_gpu_devices_infos(devices);
    Ok(())
}

fn run_add(args: &AddArgs) -> Result<()> {
    if args.len == 0 {
        bail!("--len must be positive");
    }
    let config = args.config()?;
    let runtime = kernel_dispatch::default_runtime();
    let resource = runtime
        .create_computing_gpu_resources(&config, &CustomSettings::default())
        .context("creating GPU resources")?;
    let code = runtime
        .register_computing_kernel_code(resource, ADD_ASSIGN, "main")
        .context("registering add_assign.wgsl")?;

    let mut out = vec![1u32; args.len];
    let input = vec![1u32; args.len];
    let workgroups = u32::try_from(args.len.div_ceil(WORKGROUP_SIZE)).context("--len is too large")?;
    let kernel = Kernel::new(workgroups, 1, 1)
        .with_config(resource)
        .with_kernel_code(code);

    let mut groups = [BindGroup::new(
        0,
        vec![
            DataBinder::read_write(0, bytemuck::cast_slice_mut(&mut out)),
            DataBinder::read(1, bytemuck::cast_slice(&input)),
        ],
    )];
    let status = runtime.compute_status(&kernel, &mut groups);
    drop(groups);
    if status != 0 {
        bail!("compute failed with status {status}");
    }

    let last = args.len - 1;
    for idx in [0, 4.min(last), 50_000.min(last), last] {
        tracing::info!("out[{idx}] = {}", out[idx]);
    }
    let wrong = out.iter().filter(|&&v| v != 2).count();
    if wrong > 0 {
        bail!("{wrong} of {} elements differ from 2", args.len);
    }
    tracing::info!("all {} elements are 2", args.len);

    runtime.free_compute_cache();
    Ok(())
}
