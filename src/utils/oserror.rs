use {
    std::{
        error::Error,
        fmt::{Display, Formatter},
    },
    uapi::{Errno, c},
};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct OsError(pub c::c_int);

impl OsError {
    pub fn is_busy(self) -> bool {
        self.0 == c::EBUSY
    }

    pub fn is_unsupported_ioctl(self) -> bool {
        matches!(
            self.0,
            c::ENOTTY | c::EOPNOTSUPP | c::ENOSYS | c::EINVAL
        )
    }

    fn message(self) -> Option<&'static str> {
        let msg = match self.0 {
            c::EPERM => "Operation not permitted",
            c::ENOENT => "No such file or directory",
            c::EINTR => "Interrupted system call",
            c::EIO => "Input/output error",
            c::ENXIO => "No such device or address",
            c::EBADF => "Bad file descriptor",
            c::EAGAIN => "Resource temporarily unavailable",
            c::ENOMEM => "Cannot allocate memory",
            c::EACCES => "Permission denied",
            c::EFAULT => "Bad address",
            c::EBUSY => "Device or resource busy",
            c::EEXIST => "File exists",
            c::ENODEV => "No such device",
            c::EINVAL => "Invalid argument",
            c::ENOSPC => "No space left on device",
            c::ENOTTY => "Inappropriate ioctl for device",
            c::ERANGE => "Numerical result out of range",
            c::ENOSYS => "Function not implemented",
            c::EOPNOTSUPP => "Operation not supported",
            c::ETIMEDOUT => "Connection timed out",
            c::ECANCELED => "Operation canceled",
            _ => return None,
        };
        Some(msg)
    }
}

impl From<Errno> for OsError {
    fn from(e: Errno) -> Self {
        Self(e.0)
    }
}

impl From<c::c_int> for OsError {
    fn from(v: c::c_int) -> Self {
        Self(v)
    }
}

impl From<std::io::Error> for OsError {
    fn from(v: std::io::Error) -> Self {
        match v.raw_os_error() {
            Some(v) => Self(v),
            None => Self(c::EINVAL),
        }
    }
}

impl Default for OsError {
    fn default() -> Self {
        Errno::default().into()
    }
}

impl Error for OsError {}

impl Display for OsError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "{} (os error {})", msg, self.0),
            None => write!(
                f,
                "{} (os error {})",
                std::io::Error::from_raw_os_error(self.0).kind(),
                self.0
            ),
        }
    }
}
