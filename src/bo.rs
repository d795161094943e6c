use {
    crate::{
        kernel::{ErrorKind, KmsKernel},
        utils::{errorfmt::ErrorFmt, oserror::OsError},
        video::{
            INVALID_MODIFIER, Modifier, depth_for_bpp,
            drm::{AddFb, AddFb2, CpuMapping, DrmFb, DumbBuffer, log_drop_error, sys},
        },
    },
    indexmap::IndexSet,
    std::{
        cell::RefCell,
        error::Error,
        fmt::{Debug, Formatter},
        rc::Rc,
    },
    thiserror::Error,
    uapi::c,
};

pub const BO_USE_SCANOUT: u32 = 1 << 0;
pub const BO_USE_CURSOR: u32 = 1 << 1;
pub const BO_USE_RENDERING: u32 = 1 << 2;
pub const BO_USE_WRITE: u32 = 1 << 3;
pub const BO_USE_LINEAR: u32 = 1 << 4;

#[derive(Debug, Error)]
#[error(transparent)]
pub struct AllocatorError(#[from] pub Box<dyn Error>);

/// A GPU-side allocator such as gbm.
pub trait Allocator {
    fn create_bo(
        &self,
        width: u32,
        height: u32,
        format: u32,
        modifiers: &[Modifier],
        usage: u32,
    ) -> Result<Rc<dyn GpuBuffer>, AllocatorError>;

    /// The number of memory planes a modifier requires, if known.
    fn modifier_plane_count(&self, format: u32, modifier: Modifier) -> Option<u32> {
        let _ = (format, modifier);
        None
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct GpuPlane {
    pub handle: u32,
    pub pitch: u32,
    pub offset: u32,
}

pub trait GpuBuffer {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn format(&self) -> u32;
    fn modifier(&self) -> Modifier;
    fn planes(&self) -> &[GpuPlane];
    fn map(&self) -> Result<Box<dyn CpuMapping>, AllocatorError>;
}

#[derive(Debug, Error)]
pub enum BoError {
    #[error("Could not create a dumb buffer")]
    CreateDumb(#[source] OsError),
    #[error("Could not map a dumb buffer")]
    MapDumb(#[source] OsError),
    #[error("The allocator could not create a buffer")]
    Allocate(#[source] AllocatorError),
    #[error("Could not map a GPU buffer")]
    MapGpu(#[source] AllocatorError),
    #[error("Imported buffers cannot be mapped")]
    MapImported,
    #[error("The GPU buffer has no planes")]
    NoPlanes,
    #[error("Could not create a framebuffer")]
    AddFb(#[source] OsError),
    #[error("Could not convert a prime fd to a gem handle")]
    Import(#[source] OsError),
}

impl BoError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BoError::CreateDumb(e)
            | BoError::MapDumb(e)
            | BoError::AddFb(e)
            | BoError::Import(e) => ErrorKind::from_os(*e),
            BoError::Allocate(_) | BoError::MapGpu(_) => ErrorKind::OutOfMemory,
            BoError::MapImported => ErrorKind::Unsupported,
            BoError::NoPlanes => ErrorKind::KernelRejected,
        }
    }
}

enum Backing {
    Dumb(DumbBuffer),
    Gpu {
        buf: Rc<dyn GpuBuffer>,
        modifiers: bool,
    },
    Imported {
        handle: u32,
    },
}

pub struct BufferObject {
    kernel: Rc<dyn KmsKernel>,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub bpp: u32,
    pub format: u32,
    backing: Backing,
    map: RefCell<Option<Box<dyn CpuMapping>>>,
}

impl Debug for BufferObject {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferObject")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("pitch", &self.pitch)
            .finish_non_exhaustive()
    }
}

#[derive(Copy, Clone, Debug)]
pub struct AllocRequest {
    pub width: u32,
    pub height: u32,
    pub bpp: u32,
    pub format: u32,
    pub usage: u32,
}

impl BufferObject {
    pub fn create_dumb(
        kernel: &Rc<dyn KmsKernel>,
        width: u32,
        height: u32,
        bpp: u32,
        format: u32,
    ) -> Result<Self, BoError> {
        let dumb = kernel
            .create_dumb(width, height, bpp)
            .map_err(BoError::CreateDumb)?;
        Ok(Self {
            kernel: kernel.clone(),
            width,
            height,
            pitch: dumb.pitch,
            bpp,
            format,
            backing: Backing::Dumb(dumb),
            map: Default::default(),
        })
    }

    fn from_gpu(
        kernel: &Rc<dyn KmsKernel>,
        req: &AllocRequest,
        buf: Rc<dyn GpuBuffer>,
        modifiers: bool,
    ) -> Result<Self, BoError> {
        let Some(plane) = buf.planes().first().copied() else {
            return Err(BoError::NoPlanes);
        };
        Ok(Self {
            kernel: kernel.clone(),
            width: buf.width(),
            height: buf.height(),
            pitch: plane.pitch,
            bpp: req.bpp,
            format: buf.format(),
            backing: Backing::Gpu { buf, modifiers },
            map: Default::default(),
        })
    }

    /// Wraps a buffer exported by another device.
    pub fn import(
        kernel: &Rc<dyn KmsKernel>,
        fd: c::c_int,
        width: u32,
        height: u32,
        pitch: u32,
        bpp: u32,
        format: u32,
    ) -> Result<Self, BoError> {
        let handle = kernel.prime_fd_to_handle(fd).map_err(BoError::Import)?;
        Ok(Self {
            kernel: kernel.clone(),
            width,
            height,
            pitch,
            bpp,
            format,
            backing: Backing::Imported { handle },
            map: Default::default(),
        })
    }

    pub fn is_dumb(&self) -> bool {
        matches!(self.backing, Backing::Dumb(_))
    }

    pub fn uses_modifiers(&self) -> bool {
        matches!(self.backing, Backing::Gpu { modifiers: true, .. })
    }

    pub fn handle(&self) -> u32 {
        match &self.backing {
            Backing::Dumb(d) => d.handle,
            Backing::Gpu { buf, .. } => buf.planes().first().map(|p| p.handle).unwrap_or(0),
            Backing::Imported { handle } => *handle,
        }
    }

    pub fn is_mapped(&self) -> bool {
        self.map.borrow().is_some()
    }

    /// Runs `f` on the CPU mapping, creating it on first use.
    pub fn with_map<T>(&self, f: impl FnOnce(&mut [u8]) -> T) -> Result<T, BoError> {
        let mut map = self.map.borrow_mut();
        if map.is_none() {
            let m = match &self.backing {
                Backing::Dumb(d) => self.kernel.map_dumb(d).map_err(BoError::MapDumb)?,
                Backing::Gpu { buf, .. } => buf.map().map_err(BoError::MapGpu)?,
                Backing::Imported { .. } => return Err(BoError::MapImported),
            };
            *map = Some(m);
        }
        match map.as_mut() {
            Some(m) => Ok(f(m.as_mut_slice())),
            None => Err(BoError::MapImported),
        }
    }

    /// Registers the buffer as a scanout framebuffer.
    pub fn publish(self: &Rc<Self>) -> Result<Rc<Framebuffer>, BoError> {
        let res = match &self.backing {
            Backing::Gpu { buf, modifiers } if *modifiers || buf.planes().len() > 1 => {
                let mut req = AddFb2 {
                    width: self.width,
                    height: self.height,
                    format: self.format,
                    flags: 0,
                    handles: [0; 4],
                    pitches: [0; 4],
                    offsets: [0; 4],
                    modifiers: [0; 4],
                };
                let modifier = buf.modifier();
                if *modifiers && modifier != INVALID_MODIFIER {
                    req.flags |= sys::DRM_MODE_FB_MODIFIERS;
                }
                for (idx, plane) in buf.planes().iter().take(4).enumerate() {
                    req.handles[idx] = plane.handle;
                    req.pitches[idx] = plane.pitch;
                    req.offsets[idx] = plane.offset;
                    if req.flags & sys::DRM_MODE_FB_MODIFIERS != 0 {
                        req.modifiers[idx] = modifier;
                    }
                }
                self.kernel.add_fb2(&req)
            }
            _ => self.kernel.add_fb(&AddFb {
                width: self.width,
                height: self.height,
                depth: depth_for_bpp(self.bpp),
                bpp: self.bpp,
                pitch: self.pitch,
                handle: self.handle(),
            }),
        };
        match res {
            Ok(id) => Ok(Rc::new(Framebuffer {
                id,
                bo: self.clone(),
            })),
            Err(e) => Err(BoError::AddFb(e)),
        }
    }
}

impl Drop for BufferObject {
    fn drop(&mut self) {
        self.map.take();
        match &self.backing {
            Backing::Dumb(d) => {
                log_drop_error("destroy a dumb buffer", self.kernel.destroy_dumb(d.handle));
            }
            Backing::Imported { handle } => {
                log_drop_error("close a gem handle", self.kernel.gem_close(*handle));
            }
            Backing::Gpu { .. } => {}
        }
    }
}

/// A kernel framebuffer id; removed before its buffer is released.
pub struct Framebuffer {
    pub id: DrmFb,
    pub bo: Rc<BufferObject>,
}

impl Debug for Framebuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framebuffer")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        log_drop_error("delete a framebuffer", self.bo.kernel.rm_fb(self.id));
    }
}

/// Intersects the modifiers of several planes.
pub fn common_modifiers<'a>(
    mut sets: impl Iterator<Item = &'a IndexSet<Modifier>>,
) -> IndexSet<Modifier> {
    let Some(first) = sets.next() else {
        return IndexSet::new();
    };
    let mut res = first.clone();
    for set in sets {
        res.retain(|m| set.contains(m));
    }
    res
}

/// Allocates a buffer without publishing it.
pub fn allocate(
    kernel: &Rc<dyn KmsKernel>,
    allocator: Option<&dyn Allocator>,
    req: &AllocRequest,
    modifiers: &[Modifier],
) -> Result<BufferObject, BoError> {
    let Some(allocator) = allocator else {
        return BufferObject::create_dumb(kernel, req.width, req.height, req.bpp, req.format);
    };
    let single_plane: Vec<_> = modifiers
        .iter()
        .copied()
        .filter(|m| *m != INVALID_MODIFIER)
        .filter(|m| allocator.modifier_plane_count(req.format, *m).unwrap_or(1) == 1)
        .collect();
    if single_plane.len() > 0 {
        match allocator.create_bo(req.width, req.height, req.format, &single_plane, req.usage) {
            Ok(buf) => return BufferObject::from_gpu(kernel, req, buf, true),
            Err(e) => {
                log::warn!(
                    "Could not allocate a buffer with modifiers: {}",
                    ErrorFmt(e)
                );
            }
        }
    }
    let buf = allocator
        .create_bo(
            req.width,
            req.height,
            req.format,
            &[INVALID_MODIFIER],
            req.usage,
        )
        .map_err(BoError::Allocate)?;
    BufferObject::from_gpu(kernel, req, buf, false)
}

/// Allocates and publishes a scanout buffer.
///
/// If the kernel refuses a modifier-aware buffer, a plain buffer is tried.
pub fn allocate_scanout(
    kernel: &Rc<dyn KmsKernel>,
    allocator: Option<&dyn Allocator>,
    req: &AllocRequest,
    modifiers: &[Modifier],
) -> Result<Rc<Framebuffer>, BoError> {
    let bo = Rc::new(allocate(kernel, allocator, req, modifiers)?);
    match bo.publish() {
        Ok(fb) => Ok(fb),
        Err(e) if bo.uses_modifiers() => {
            log::warn!(
                "Kernel rejected a buffer with modifiers: {}",
                ErrorFmt(&e)
            );
            drop(bo);
            let bo = Rc::new(allocate(kernel, allocator, req, &[])?);
            bo.publish()
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests;
