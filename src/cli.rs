mod list;
mod watch;

use {
    clap::{Args, Parser, Subcommand},
    kms_core::{
        bo::Allocator,
        config::{KmsConfig, LogLevel},
        device::Device,
        kernel::KmsKernel,
        logger::Logger,
        utils::errorfmt::ErrorFmt,
        video::drm::DrmMaster,
    },
    std::{path::PathBuf, process, rc::Rc},
};

#[cfg(feature = "gbm")]
use kms_core::video::gbm::GbmDevice;

/// Inspects and exercises a KMS device.
#[derive(Parser, Debug)]
struct KmsCtl {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Args, Debug)]
pub struct GlobalArgs {
    /// A TOML configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// The log level. Overrides the configuration file.
    #[arg(value_enum, long, global = true)]
    pub log_level: Option<LogLevel>,
    /// Append log output to this file instead of stderr.
    #[arg(long, global = true)]
    pub log_file: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Print the crtcs, outputs and planes of the device.
    List,
    /// Light every connected output and print frame counters.
    Watch(WatchArgs),
}

#[derive(Args, Debug)]
pub struct WatchArgs {
    /// The number of frames to wait for on each crtc.
    #[arg(long, default_value_t = 60)]
    pub frames: u64,
}

pub fn main() {
    let cli = KmsCtl::parse();
    let level = cli.global.log_level.unwrap_or_default();
    let logger = match &cli.global.log_file {
        Some(path) => Logger::install_file(path, level.into()),
        None => Logger::install_stderr(level.into()),
    };
    let logger = match logger {
        Ok(l) => l,
        Err(e) => {
            eprintln!("Could not install the logger: {}", ErrorFmt(e));
            process::exit(1);
        }
    };
    let config = match &cli.global.config {
        Some(path) => match KmsConfig::load(path) {
            Ok(c) => c,
            Err(e) => fatal(&format!("Could not load the configuration: {}", ErrorFmt(e))),
        },
        None => KmsConfig::default(),
    };
    if cli.global.log_level.is_none() {
        logger.set_level(config.log_level.into());
    }
    if cli.global.log_file.is_some() {
        log::info!("Logging to {}", logger.path());
    }
    let device = attach(&config);
    let res = match cli.command {
        Cmd::List => list::main(&device),
        Cmd::Watch(a) => watch::main(&device, a),
    };
    device.detach();
    if let Err(e) = res {
        fatal(&ErrorFmt(&*e).to_string());
    }
}

fn attach(config: &KmsConfig) -> Rc<Device> {
    let path = config.device.to_string_lossy();
    let master = match DrmMaster::open(&path) {
        Ok(m) => m,
        Err(e) => fatal(&format!("Could not open {}: {}", path, ErrorFmt(e))),
    };
    let allocator = gpu_allocator(&master);
    let kernel: Rc<dyn KmsKernel> = Rc::new(master);
    match Device::attach(&kernel, config, allocator) {
        Ok(d) => d,
        Err(e) => fatal(&format!("Could not attach to {}: {}", path, ErrorFmt(e))),
    }
}

#[cfg(feature = "gbm")]
fn gpu_allocator(master: &DrmMaster) -> Option<Rc<dyn Allocator>> {
    match GbmDevice::new(master.raw()) {
        Ok(gbm) => Some(Rc::new(gbm)),
        Err(e) => {
            log::warn!("Could not create a gbm device: {}", ErrorFmt(e));
            None
        }
    }
}

#[cfg(not(feature = "gbm"))]
fn gpu_allocator(_master: &DrmMaster) -> Option<Rc<dyn Allocator>> {
    None
}

fn fatal(msg: &str) -> ! {
    log::error!("{}", msg);
    process::exit(1);
}
