use {
    crate::{kernel::ErrorKind, utils::oserror::OsError},
    log::Level,
    serde::Deserialize,
    std::path::{Path, PathBuf},
    thiserror::Error,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not read {0}")]
    Read(PathBuf, #[source] std::io::Error),
    #[error("Could not parse the configuration")]
    Parse(#[source] toml::de::Error),
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConfigError::Read(_, e) => match e.raw_os_error() {
                Some(errno) => ErrorKind::from_os(OsError(errno)),
                None => ErrorKind::KernelRejected,
            },
            ConfigError::Parse(_) => ErrorKind::KernelRejected,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for Level {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Error => Level::Error,
            LogLevel::Warn => Level::Warn,
            LogLevel::Info => Level::Info,
            LogLevel::Debug => Level::Debug,
            LogLevel::Trace => Level::Trace,
        }
    }
}

/// Settings consumed once when a device is attached.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KmsConfig {
    pub device: PathBuf,
    pub log_level: LogLevel,
    /// `false` forces the legacy commit path.
    pub atomic: bool,
    pub sw_cursor: bool,
    pub page_flip: bool,
    pub use_modifiers: bool,
    /// `false` forces the legacy gamma ioctl.
    pub gamma_lut: bool,
    pub vrr: bool,
    /// Bound on EBUSY retries when queueing vblanks.
    pub busy_retries: u32,
    pub front_bpp: u32,
    /// Indices of crtcs another display server drives. They are never
    /// touched.
    pub claimed_crtcs: u32,
}

impl Default for KmsConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/dri/card0"),
            log_level: LogLevel::Info,
            atomic: true,
            sw_cursor: false,
            page_flip: true,
            use_modifiers: true,
            gamma_lut: true,
            vrr: false,
            busy_retries: 16,
            front_bpp: 32,
            claimed_crtcs: 0,
        }
    }
}

impl KmsConfig {
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(ConfigError::Parse)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let s = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        let config = Self::parse(&s)?;
        log::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }
}
