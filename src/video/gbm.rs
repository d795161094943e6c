#![allow(non_camel_case_types)]

use {
    crate::{
        bo::{
            Allocator, AllocatorError, BO_USE_CURSOR, BO_USE_LINEAR, BO_USE_RENDERING,
            BO_USE_SCANOUT, BO_USE_WRITE, GpuBuffer, GpuPlane,
        },
        utils::oserror::OsError,
        video::{INVALID_MODIFIER, Modifier, drm::CpuMapping},
    },
    std::{
        fmt::{Debug, Formatter},
        ptr,
        rc::Rc,
        slice,
    },
    thiserror::Error,
    uapi::c,
};

#[derive(Debug, Error)]
pub enum GbmError {
    #[error("Could not create a gbm device")]
    CreateDevice,
    #[error("Could not create a gbm buffer")]
    CreateBo(#[source] OsError),
    #[error("Could not map bo")]
    MapBo(#[source] OsError),
    #[error("Tried to allocate a buffer with no modifier")]
    NoModifier,
}

impl From<GbmError> for AllocatorError {
    fn from(value: GbmError) -> Self {
        Self(Box::new(value))
    }
}

type Device = u8;
type Bo = u8;

const GBM_BO_USE_SCANOUT: u32 = 1 << 0;
const GBM_BO_USE_CURSOR: u32 = 1 << 1;
const GBM_BO_USE_RENDERING: u32 = 1 << 2;
const GBM_BO_USE_WRITE: u32 = 1 << 3;
const GBM_BO_USE_LINEAR: u32 = 1 << 4;

const GBM_BO_TRANSFER_READ: u32 = 1 << 0;
const GBM_BO_TRANSFER_WRITE: u32 = 1 << 1;
const GBM_BO_TRANSFER_READ_WRITE: u32 = GBM_BO_TRANSFER_READ | GBM_BO_TRANSFER_WRITE;

#[repr(C)]
#[derive(Copy, Clone)]
#[allow(dead_code)]
union gbm_bo_handle {
    ptr: *mut u8,
    s32: i32,
    u32_: u32,
    s64: i64,
    u64_: u64,
}

#[link(name = "gbm")]
unsafe extern "C" {
    fn gbm_create_device(fd: c::c_int) -> *mut Device;
    fn gbm_device_destroy(dev: *mut Device);
    fn gbm_device_get_format_modifier_plane_count(
        dev: *mut Device,
        format: u32,
        modifier: u64,
    ) -> c::c_int;

    fn gbm_bo_create_with_modifiers2(
        dev: *mut Device,
        width: u32,
        height: u32,
        format: u32,
        modifiers: *const u64,
        count: c::c_uint,
        flags: u32,
    ) -> *mut Bo;
    fn gbm_bo_create(dev: *mut Device, width: u32, height: u32, format: u32, flags: u32)
    -> *mut Bo;
    fn gbm_bo_destroy(bo: *mut Bo);
    fn gbm_bo_get_plane_count(bo: *mut Bo) -> c::c_int;
    fn gbm_bo_get_width(bo: *mut Bo) -> u32;
    fn gbm_bo_get_height(bo: *mut Bo) -> u32;
    fn gbm_bo_get_modifier(bo: *mut Bo) -> u64;
    fn gbm_bo_get_stride_for_plane(bo: *mut Bo, plane: c::c_int) -> u32;
    fn gbm_bo_get_handle_for_plane(bo: *mut Bo, plane: c::c_int) -> gbm_bo_handle;
    fn gbm_bo_get_offset(bo: *mut Bo, plane: c::c_int) -> u32;
    fn gbm_bo_get_format(bo: *mut Bo) -> u32;
    fn gbm_bo_map(
        bo: *mut Bo,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        flags: u32,
        strid: *mut u32,
        map_data: *mut *mut u8,
    ) -> *mut u8;
    fn gbm_bo_unmap(bo: *mut Bo, map_data: *mut u8);
}

/// A gbm device on the display device's own descriptor, so that buffer
/// handles are valid for framebuffer creation.
pub struct GbmDevice {
    dev: *mut Device,
}

impl Debug for GbmDevice {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GbmDevice").finish_non_exhaustive()
    }
}

struct BoHolder {
    bo: *mut Bo,
}

pub struct GbmBo {
    bo: Rc<BoHolder>,
    width: u32,
    height: u32,
    format: u32,
    modifier: Modifier,
    planes: Vec<GpuPlane>,
}

pub struct GbmBoMap {
    bo: Rc<BoHolder>,
    data: *mut [u8],
    opaque: *mut u8,
}

impl CpuMapping for GbmBoMap {
    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { &mut *self.data }
    }
}

impl GbmDevice {
    pub fn new(fd: c::c_int) -> Result<Self, GbmError> {
        let dev = unsafe { gbm_create_device(fd) };
        if dev.is_null() {
            Err(GbmError::CreateDevice)
        } else {
            Ok(Self { dev })
        }
    }

    fn create(
        &self,
        width: u32,
        height: u32,
        format: u32,
        modifiers: &[Modifier],
        usage: u32,
    ) -> Result<GbmBo, GbmError> {
        if modifiers.is_empty() {
            return Err(GbmError::NoModifier);
        }
        let implicit = modifiers == [INVALID_MODIFIER];
        unsafe {
            let bo = if implicit {
                gbm_bo_create(self.dev, width, height, format, usage)
            } else {
                gbm_bo_create_with_modifiers2(
                    self.dev,
                    width,
                    height,
                    format,
                    modifiers.as_ptr(),
                    modifiers.len() as _,
                    usage & !GBM_BO_USE_LINEAR,
                )
            };
            if bo.is_null() {
                return Err(GbmError::CreateBo(OsError::default()));
            }
            let bo = Rc::new(BoHolder { bo });
            let mut planes = vec![];
            for plane in 0..gbm_bo_get_plane_count(bo.bo) {
                planes.push(GpuPlane {
                    handle: gbm_bo_get_handle_for_plane(bo.bo, plane).u32_,
                    pitch: gbm_bo_get_stride_for_plane(bo.bo, plane),
                    offset: gbm_bo_get_offset(bo.bo, plane),
                });
            }
            Ok(GbmBo {
                width: gbm_bo_get_width(bo.bo),
                height: gbm_bo_get_height(bo.bo),
                format: gbm_bo_get_format(bo.bo),
                modifier: match implicit {
                    true => INVALID_MODIFIER,
                    false => gbm_bo_get_modifier(bo.bo),
                },
                planes,
                bo,
            })
        }
    }
}

impl Allocator for GbmDevice {
    fn create_bo(
        &self,
        width: u32,
        height: u32,
        format: u32,
        modifiers: &[Modifier],
        usage: u32,
    ) -> Result<Rc<dyn GpuBuffer>, AllocatorError> {
        let usage = map_usage(usage);
        self.create(width, height, format, modifiers, usage)
            .map(|v| Rc::new(v) as _)
            .map_err(|v| v.into())
    }

    fn modifier_plane_count(&self, format: u32, modifier: Modifier) -> Option<u32> {
        let n = unsafe { gbm_device_get_format_modifier_plane_count(self.dev, format, modifier) };
        (n > 0).then_some(n as u32)
    }
}

fn map_usage(usage: u32) -> u32 {
    let mut gbm = 0;
    macro_rules! map {
        ($bu:ident to $gbu:ident) => {
            if usage & $bu != 0 {
                gbm |= $gbu;
            }
        };
    }
    map!(BO_USE_SCANOUT to GBM_BO_USE_SCANOUT);
    map!(BO_USE_CURSOR to GBM_BO_USE_CURSOR);
    map!(BO_USE_RENDERING to GBM_BO_USE_RENDERING);
    map!(BO_USE_WRITE to GBM_BO_USE_WRITE);
    map!(BO_USE_LINEAR to GBM_BO_USE_LINEAR);
    gbm
}

impl Drop for GbmDevice {
    fn drop(&mut self) {
        unsafe {
            gbm_device_destroy(self.dev);
        }
    }
}

impl GpuBuffer for GbmBo {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn format(&self) -> u32 {
        self.format
    }

    fn modifier(&self) -> Modifier {
        self.modifier
    }

    fn planes(&self) -> &[GpuPlane] {
        &self.planes
    }

    fn map(&self) -> Result<Box<dyn CpuMapping>, AllocatorError> {
        let mut stride = 0;
        let mut map_data = ptr::null_mut();
        unsafe {
            let map = gbm_bo_map(
                self.bo.bo,
                0,
                0,
                self.width,
                self.height,
                GBM_BO_TRANSFER_READ_WRITE,
                &mut stride,
                &mut map_data,
            );
            if map.is_null() {
                return Err(GbmError::MapBo(OsError::default()).into());
            }
            let map = slice::from_raw_parts_mut(map, (stride * self.height) as usize);
            Ok(Box::new(GbmBoMap {
                bo: self.bo.clone(),
                data: map,
                opaque: map_data,
            }))
        }
    }
}

impl Drop for GbmBoMap {
    fn drop(&mut self) {
        unsafe {
            gbm_bo_unmap(self.bo.bo, self.opaque);
        }
    }
}

impl Drop for BoHolder {
    fn drop(&mut self) {
        unsafe {
            gbm_bo_destroy(self.bo);
        }
    }
}
