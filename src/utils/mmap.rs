use {
    crate::utils::oserror::OsError,
    std::ptr,
    uapi::c,
};

pub struct Mmapped {
    pub ptr: *mut u8,
    pub len: usize,
}

pub fn mmap(
    len: usize,
    prot: c::c_int,
    flags: c::c_int,
    fd: c::c_int,
    offset: c::off_t,
) -> Result<Mmapped, OsError> {
    let res = unsafe { c::mmap(ptr::null_mut(), len, prot, flags, fd, offset) };
    if res == c::MAP_FAILED {
        Err(OsError::default())
    } else {
        Ok(Mmapped {
            ptr: res.cast(),
            len,
        })
    }
}

impl Drop for Mmapped {
    fn drop(&mut self) {
        unsafe {
            c::munmap(self.ptr.cast(), self.len);
        }
    }
}
