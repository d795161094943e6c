use {
    crate::utils::oserror::OsError,
    backtrace::Backtrace,
    bstr::{BStr, BString, ByteSlice},
    log::{Level, Log, Metadata, Record},
    std::{
        cell::RefCell,
        io::Write,
        sync::{
            Arc,
            atomic::{AtomicU32, Ordering::Relaxed},
        },
        time::SystemTime,
    },
    thiserror::Error,
    uapi::{Fd, OwnedFd, c},
};

thread_local! {
    static BUFFER: RefCell<Vec<u8>> = const { RefCell::new(Vec::new()) };
}

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("Could not dup stderr")]
    DupStderr(#[source] OsError),
    #[error("Could not open the log file {0}")]
    OpenFile(BString, #[source] OsError),
    #[error("A logger is already installed")]
    AlreadyInstalled,
}

pub struct Logger {
    level: AtomicU32,
    path: BString,
    file: OwnedFd,
}

impl Logger {
    pub fn install_stderr(level: Level) -> Result<Arc<Self>, LoggerError> {
        let file = uapi::fcntl_dupfd_cloexec(2, 0)
            .map_err(|e| LoggerError::DupStderr(e.into()))?;
        Self::install(level, b"", file)
    }

    /// Appends to `path`, creating it if necessary.
    pub fn install_file(path: &str, level: Level) -> Result<Arc<Self>, LoggerError> {
        let file = uapi::open(
            path,
            c::O_CREAT | c::O_APPEND | c::O_CLOEXEC | c::O_WRONLY,
            0o644,
        )
        .map_err(|e| LoggerError::OpenFile(path.into(), e.into()))?;
        std::panic::set_hook(Box::new(|p| {
            if let Some(loc) = p.location() {
                log::error!(
                    "Panic at {} line {} column {}",
                    loc.file(),
                    loc.line(),
                    loc.column()
                );
            } else {
                log::error!("Panic at unknown location");
            }
            if let Some(msg) = p.payload().downcast_ref::<&str>() {
                log::error!("Message: {}", msg);
            }
            if let Some(msg) = p.payload().downcast_ref::<String>() {
                log::error!("Message: {}", msg);
            }
            log::error!("Backtrace:\n{:?}", Backtrace::new());
        }));
        Self::install(level, path.as_bytes(), file)
    }

    fn install(level: Level, path: &[u8], file: OwnedFd) -> Result<Arc<Self>, LoggerError> {
        let slf = Arc::new(Self {
            level: AtomicU32::new(level as _),
            path: path.to_vec().into(),
            file,
        });
        log::set_boxed_logger(Box::new(LogWrapper {
            logger: slf.clone(),
        }))
        .map_err(|_| LoggerError::AlreadyInstalled)?;
        log::set_max_level(level.to_level_filter());
        Ok(slf)
    }

    pub fn set_level(&self, level: Level) {
        self.level.store(level as _, Relaxed);
        log::set_max_level(level.to_level_filter());
    }

    pub fn path(&self) -> &BStr {
        self.path.as_bstr()
    }
}

struct LogWrapper {
    logger: Arc<Logger>,
}

impl Log for LogWrapper {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() as u32 <= self.logger.level.load(Relaxed)
    }

    fn log(&self, record: &Record) {
        if record.level() as u32 > self.logger.level.load(Relaxed) {
            return;
        }
        BUFFER.with_borrow_mut(|buffer| {
            buffer.clear();
            let now = SystemTime::now();
            let _ = if let Some(mp) = record.module_path() {
                writeln!(
                    buffer,
                    "[{} {:5} {}] {}",
                    humantime::format_rfc3339_millis(now),
                    record.level(),
                    mp,
                    record.args(),
                )
            } else {
                writeln!(
                    buffer,
                    "[{} {:5}] {}",
                    humantime::format_rfc3339_millis(now),
                    record.level(),
                    record.args(),
                )
            };
            let mut fd = Fd::new(self.logger.file.raw());
            let _ = fd.write_all(buffer);
        });
    }

    fn flush(&self) {
        // nothing
    }
}
