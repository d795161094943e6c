pub mod sys;

use {
    crate::{
        utils::{errorfmt::ErrorFmt, mmap::mmap, oserror::OsError},
        video::{
            Modifier,
            drm::sys::{
                DRM_DISPLAY_MODE_LEN, DRM_MODE_CURSOR_BO, DRM_MODE_CURSOR_MOVE,
                DRM_MODE_OBJECT_BLOB, DRM_MODE_OBJECT_CONNECTOR, DRM_MODE_OBJECT_CRTC,
                DRM_MODE_OBJECT_ENCODER, DRM_MODE_OBJECT_FB, DRM_MODE_OBJECT_MODE,
                DRM_MODE_OBJECT_PLANE, DRM_MODE_OBJECT_PROPERTY, FORMAT_BLOB_CURRENT,
                create_lease, drm_event, drm_event_crtc_sequence, drm_event_vblank,
                drm_format_modifier, drm_format_modifier_blob, gem_close, get_cap,
                get_sequence, get_version, list_lessees, mode_addfb, mode_addfb2, mode_atomic,
                mode_create_blob, mode_create_dumb, mode_cursor, mode_destroy_blob,
                mode_destroy_dumb, mode_get_resources, mode_getconnector, mode_getcrtc,
                mode_getencoder, mode_getplane, mode_getplaneresources, mode_getpropblob,
                mode_getproperty, mode_map_dumb, mode_obj_getproperties, mode_obj_setproperty,
                mode_page_flip, mode_rmfb, mode_set_cursor2, mode_set_gamma, mode_setcrtc,
                prime_fd_to_handle, queue_sequence, revoke_lease, set_client_cap, wait_vblank,
            },
        },
    },
    bstr::{BString, ByteSlice},
    indexmap::IndexSet,
    std::{
        cell::RefCell,
        fmt::{Debug, Display, Formatter},
        rc::Rc,
        slice,
    },
    thiserror::Error,
    uapi::{OwnedFd, Pod, c},
};

pub use sys::{
    DRM_CLIENT_CAP_ATOMIC, DRM_CLIENT_CAP_UNIVERSAL_PLANES, DRM_MODE_ATOMIC_ALLOW_MODESET,
    DRM_MODE_ATOMIC_NONBLOCK, DRM_MODE_ATOMIC_TEST_ONLY, DRM_MODE_PAGE_FLIP_EVENT,
    drm_mode_modeinfo,
};

#[derive(Debug, Error)]
pub enum DrmError {
    #[error("Could not open the drm device")]
    Open(#[source] OsError),
    #[error("Could not perform drm property ioctl")]
    GetProperty(#[source] OsError),
    #[error("Could not perform drm getencoder ioctl")]
    GetEncoder(#[source] OsError),
    #[error("Could not perform drm getresources ioctl")]
    GetResources(#[source] OsError),
    #[error("Could not perform drm getplaneresources ioctl")]
    GetPlaneResources(#[source] OsError),
    #[error("Could not perform drm getplane ioctl")]
    GetPlane(#[source] OsError),
    #[error("Could not perform drm getcrtc ioctl")]
    GetCrtc(#[source] OsError),
    #[error("Could not create a blob")]
    CreateBlob(#[source] OsError),
    #[error("Could not destroy a blob")]
    DestroyBlob(#[source] OsError),
    #[error("Could not perform drm getconnector ioctl")]
    GetConnector(#[source] OsError),
    #[error("Could not perform drm getpropblob ioctl")]
    GetPropBlob(#[source] OsError),
    #[error("Could not perform drm properties ioctl")]
    GetProperties(#[source] OsError),
    #[error("Drm property has an unknown type {0}")]
    UnknownPropertyType(u32),
    #[error("Range property does not have exactly two values")]
    RangeValues,
    #[error("Object property does not have exactly one value")]
    ObjectValues,
    #[error("Could not read events from the drm fd")]
    ReadEvents(#[source] OsError),
    #[error("Read invalid data from drm device")]
    InvalidRead,
    #[error("Could not determine the drm version")]
    Version(#[source] OsError),
    #[error("Format of IN_FORMATS property is invalid")]
    InFormats,
}

impl DrmError {
    pub fn os_error(&self) -> Option<OsError> {
        let e = match self {
            DrmError::Open(e)
            | DrmError::GetProperty(e)
            | DrmError::GetEncoder(e)
            | DrmError::GetResources(e)
            | DrmError::GetPlaneResources(e)
            | DrmError::GetPlane(e)
            | DrmError::GetCrtc(e)
            | DrmError::CreateBlob(e)
            | DrmError::DestroyBlob(e)
            | DrmError::GetConnector(e)
            | DrmError::GetPropBlob(e)
            | DrmError::GetProperties(e)
            | DrmError::ReadEvents(e)
            | DrmError::Version(e) => e,
            _ => return None,
        };
        Some(*e)
    }
}

pub struct InFormat {
    pub format: u32,
    pub modifiers: IndexSet<Modifier>,
}

/// Views a slice of plain-old-data structs as raw bytes.
pub fn pod_bytes<T: Pod>(t: &[T]) -> &[u8] {
    unsafe { slice::from_raw_parts(t.as_ptr().cast(), size_of_val(t)) }
}

pub fn parse_in_formats(blob: &[u8]) -> Result<Vec<InFormat>, DrmError> {
    let header: drm_format_modifier_blob = match uapi::pod_read_init(blob) {
        Ok(h) => h,
        Err(_) => {
            log::error!("Header of IN_FORMATS blob doesn't fit in the blob");
            return Err(DrmError::InFormats);
        }
    };
    if header.version != FORMAT_BLOB_CURRENT {
        log::error!(
            "Header of IN_FORMATS has an invalid version: {}",
            header.version
        );
        return Err(DrmError::InFormats);
    }
    let formats_start = header.formats_offset as usize;
    let formats_end = formats_start
        .wrapping_add((header.count_formats as usize).wrapping_mul(size_of::<u32>()));
    let modifiers_start = header.modifiers_offset as usize;
    let modifiers_end = modifiers_start.wrapping_add(
        (header.count_modifiers as usize).wrapping_mul(size_of::<drm_format_modifier>()),
    );
    if blob.len() < formats_end || formats_end < formats_start {
        log::error!("Formats of IN_FORMATS blob don't fit in the blob");
        return Err(DrmError::InFormats);
    }
    if blob.len() < modifiers_end || modifiers_end < modifiers_start {
        log::error!("Modifiers of IN_FORMATS blob don't fit in the blob");
        return Err(DrmError::InFormats);
    }
    let mut formats = vec![];
    for chunk in blob[formats_start..formats_end].chunks_exact(size_of::<u32>()) {
        let format: u32 = uapi::pod_read_init(chunk).map_err(|_| DrmError::InFormats)?;
        formats.push(InFormat {
            format,
            modifiers: IndexSet::new(),
        });
    }
    let modifiers = &blob[modifiers_start..modifiers_end];
    for chunk in modifiers.chunks_exact(size_of::<drm_format_modifier>()) {
        let modifier: drm_format_modifier =
            uapi::pod_read_init(chunk).map_err(|_| DrmError::InFormats)?;
        let offset = modifier.offset as usize;
        let mut indices = modifier.formats;
        while indices != 0 {
            let idx = indices.trailing_zeros();
            indices &= !(1 << idx);
            let idx = idx as usize + offset;
            if idx >= formats.len() {
                log::error!("Modifier offset is out of bounds");
                return Err(DrmError::InFormats);
            }
            formats[idx].modifiers.insert(modifier.modifier);
        }
    }
    Ok(formats)
}

pub fn parse_events(mut buf: &[u8], events: &mut Vec<DrmEvent>) -> Result<(), DrmError> {
    while buf.len() > 0 {
        let header: drm_event = match uapi::pod_read_init(buf) {
            Ok(e) => e,
            _ => return Err(DrmError::InvalidRead),
        };
        let len = header.length as usize;
        if len > buf.len() || len < size_of::<drm_event>() {
            return Err(DrmError::InvalidRead);
        }
        match header.ty {
            sys::DRM_EVENT_VBLANK | sys::DRM_EVENT_FLIP_COMPLETE => {
                let event: drm_event_vblank = match uapi::pod_read_init(buf) {
                    Ok(e) => e,
                    _ => return Err(DrmError::InvalidRead),
                };
                let timing = VblankTiming {
                    user_data: event.user_data,
                    tv_sec: event.tv_sec,
                    tv_usec: event.tv_usec,
                    sequence: event.sequence,
                    crtc_id: DrmCrtc(event.crtc_id),
                };
                events.push(match header.ty {
                    sys::DRM_EVENT_VBLANK => DrmEvent::Vblank(timing),
                    _ => DrmEvent::FlipComplete(timing),
                });
            }
            sys::DRM_EVENT_CRTC_SEQUENCE => {
                let event: drm_event_crtc_sequence = match uapi::pod_read_init(buf) {
                    Ok(e) => e,
                    _ => return Err(DrmError::InvalidRead),
                };
                events.push(DrmEvent::Sequence {
                    user_data: event.user_data,
                    time_ns: event.time_ns,
                    sequence: event.sequence,
                });
            }
            _ => {}
        }
        buf = &buf[len..];
    }
    Ok(())
}

pub struct DrmMaster {
    fd: Rc<OwnedFd>,
    buf: RefCell<Vec<u8>>,
}

impl Debug for DrmMaster {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.fd.raw())
    }
}

impl DrmMaster {
    pub fn open(path: &str) -> Result<Self, DrmError> {
        let fd = uapi::open(path, c::O_RDWR | c::O_CLOEXEC | c::O_NONBLOCK, 0)
            .map_err(|e| DrmError::Open(e.into()))?;
        Ok(Self::new(Rc::new(fd)))
    }

    pub fn new(fd: Rc<OwnedFd>) -> Self {
        Self {
            fd,
            buf: RefCell::new(vec![0; 1024]),
        }
    }

    pub fn raw(&self) -> c::c_int {
        self.fd.raw()
    }

    pub fn version(&self) -> Result<DrmVersion, DrmError> {
        get_version(self.raw()).map_err(DrmError::Version)
    }

    pub fn get_property(&self, prop: DrmProperty) -> Result<DrmPropertyDefinition, DrmError> {
        mode_getproperty(self.raw(), prop)
    }

    pub fn get_properties(&self, obj: u32, ty: u32) -> Result<Vec<DrmPropertyValue>, DrmError> {
        mode_obj_getproperties(self.raw(), obj, ty)
    }

    pub fn get_resources(&self) -> Result<DrmCardResources, DrmError> {
        mode_get_resources(self.raw())
    }

    pub fn get_cap(&self, cap: u64) -> Result<u64, OsError> {
        get_cap(self.raw(), cap)
    }

    pub fn set_client_cap(&self, cap: u64, value: u64) -> Result<(), OsError> {
        set_client_cap(self.raw(), cap, value)
    }

    pub fn get_planes(&self) -> Result<Vec<DrmPlane>, DrmError> {
        mode_getplaneresources(self.raw())
    }

    pub fn get_plane_info(&self, plane: DrmPlane) -> Result<DrmPlaneInfo, DrmError> {
        mode_getplane(self.raw(), plane.0)
    }

    pub fn get_crtc_info(&self, crtc: DrmCrtc) -> Result<DrmCrtcInfo, DrmError> {
        mode_getcrtc(self.raw(), crtc.0)
    }

    pub fn get_encoder_info(&self, encoder: DrmEncoder) -> Result<DrmEncoderInfo, DrmError> {
        mode_getencoder(self.raw(), encoder.0)
    }

    pub fn get_connector_info(
        &self,
        connector: DrmConnector,
        force: bool,
    ) -> Result<DrmConnectorInfo, DrmError> {
        mode_getconnector(self.raw(), connector.0, force)
    }

    pub fn get_blob(&self, blob: DrmBlob) -> Result<Vec<u8>, DrmError> {
        mode_getpropblob(self.raw(), blob.0).map_err(DrmError::GetPropBlob)
    }

    pub fn create_blob(&self, data: &[u8]) -> Result<DrmBlob, DrmError> {
        mode_create_blob(self.raw(), data).map_err(DrmError::CreateBlob)
    }

    pub fn destroy_blob(&self, blob: DrmBlob) -> Result<(), DrmError> {
        mode_destroy_blob(self.raw(), blob).map_err(DrmError::DestroyBlob)
    }

    pub fn create_lease(&self, objects: &[u32]) -> Result<(OwnedFd, u32), OsError> {
        create_lease(self.raw(), objects, c::O_CLOEXEC as _)
    }

    pub fn list_lessees(&self) -> Result<Vec<u32>, OsError> {
        list_lessees(self.raw())
    }

    pub fn revoke_lease(&self, lessee_id: u32) -> Result<(), OsError> {
        revoke_lease(self.raw(), lessee_id)
    }

    pub fn atomic(&self, flags: u32, change: &Change, user_data: u64) -> Result<(), OsError> {
        mode_atomic(
            self.raw(),
            flags,
            &change.objects,
            &change.object_lengths,
            &change.props,
            &change.values,
            user_data,
        )
    }

    pub fn set_crtc(
        &self,
        crtc: DrmCrtc,
        fb: DrmFb,
        x: u32,
        y: u32,
        connectors: &[DrmConnector],
        mode: Option<&DrmModeInfo>,
    ) -> Result<(), OsError> {
        let raw = mode.map(|m| m.to_raw());
        mode_setcrtc(self.raw(), crtc, fb, x, y, connectors, raw.as_ref())
    }

    pub fn set_property(
        &self,
        obj: u32,
        ty: u32,
        prop: DrmProperty,
        value: u64,
    ) -> Result<(), OsError> {
        mode_obj_setproperty(self.raw(), obj, ty, prop, value)
    }

    pub fn page_flip(
        &self,
        crtc: DrmCrtc,
        fb: DrmFb,
        flags: u32,
        user_data: u64,
    ) -> Result<(), OsError> {
        mode_page_flip(self.raw(), crtc, fb, flags, user_data)
    }

    pub fn create_dumb(&self, width: u32, height: u32, bpp: u32) -> Result<DumbBuffer, OsError> {
        let (handle, pitch, size) = mode_create_dumb(self.raw(), width, height, bpp)?;
        Ok(DumbBuffer {
            handle,
            pitch,
            size,
        })
    }

    pub fn map_dumb(&self, dumb: &DumbBuffer) -> Result<Box<dyn CpuMapping>, OsError> {
        let offset = mode_map_dumb(self.raw(), dumb.handle)?;
        let map = mmap(
            dumb.size as usize,
            c::PROT_READ | c::PROT_WRITE,
            c::MAP_SHARED,
            self.raw(),
            offset as _,
        )?;
        Ok(Box::new(map))
    }

    pub fn destroy_dumb(&self, handle: u32) -> Result<(), OsError> {
        mode_destroy_dumb(self.raw(), handle)
    }

    pub fn add_fb(&self, req: &AddFb) -> Result<DrmFb, OsError> {
        mode_addfb(
            self.raw(),
            req.width,
            req.height,
            req.depth,
            req.bpp,
            req.pitch,
            req.handle,
        )
    }

    pub fn add_fb2(&self, req: &AddFb2) -> Result<DrmFb, OsError> {
        mode_addfb2(
            self.raw(),
            req.width,
            req.height,
            req.format,
            req.flags,
            req.handles,
            req.pitches,
            req.offsets,
            req.modifiers,
        )
    }

    pub fn rm_fb(&self, fb: DrmFb) -> Result<(), OsError> {
        mode_rmfb(self.raw(), fb)
    }

    pub fn prime_fd_to_handle(&self, fd: c::c_int) -> Result<u32, OsError> {
        prime_fd_to_handle(self.raw(), fd)
    }

    pub fn gem_close(&self, handle: u32) -> Result<(), OsError> {
        gem_close(self.raw(), handle)
    }

    pub fn set_cursor2(
        &self,
        crtc: DrmCrtc,
        handle: u32,
        width: u32,
        height: u32,
        hot_x: i32,
        hot_y: i32,
    ) -> Result<(), OsError> {
        mode_set_cursor2(self.raw(), crtc, handle, width, height, hot_x, hot_y)
    }

    pub fn set_cursor(
        &self,
        crtc: DrmCrtc,
        handle: u32,
        width: u32,
        height: u32,
    ) -> Result<(), OsError> {
        mode_cursor(
            self.raw(),
            DRM_MODE_CURSOR_BO,
            crtc,
            handle,
            width,
            height,
            0,
            0,
        )
    }

    pub fn move_cursor(&self, crtc: DrmCrtc, x: i32, y: i32) -> Result<(), OsError> {
        mode_cursor(self.raw(), DRM_MODE_CURSOR_MOVE, crtc, 0, 0, 0, x, y)
    }

    pub fn set_gamma(
        &self,
        crtc: DrmCrtc,
        red: &[u16],
        green: &[u16],
        blue: &[u16],
    ) -> Result<(), OsError> {
        mode_set_gamma(self.raw(), crtc, red, green, blue)
    }

    pub fn queue_sequence(
        &self,
        crtc: DrmCrtc,
        flags: u32,
        sequence: u64,
        user_data: u64,
    ) -> Result<u64, OsError> {
        queue_sequence(self.raw(), crtc, flags, sequence, user_data)
    }

    pub fn get_sequence(&self, crtc: DrmCrtc) -> Result<(u64, i64), OsError> {
        get_sequence(self.raw(), crtc)
    }

    pub fn wait_vblank(
        &self,
        ty: u32,
        sequence: u32,
        user_data: u64,
    ) -> Result<VblankReply, OsError> {
        let (sequence, sec, usec) = wait_vblank(self.raw(), ty, sequence, user_data)?;
        Ok(VblankReply {
            sequence,
            usec: (sec as u64).wrapping_mul(1_000_000).wrapping_add(usec as u64),
        })
    }

    pub fn read_events(&self, events: &mut Vec<DrmEvent>) -> Result<(), DrmError> {
        let mut buf = self.buf.borrow_mut();
        loop {
            let n = match sys::read(self.raw(), &mut buf) {
                Ok(n) => n,
                Err(e) if e.0 == c::EAGAIN => return Ok(()),
                Err(e) => return Err(DrmError::ReadEvents(e)),
            };
            if n == 0 {
                return Ok(());
            }
            parse_events(&buf[..n], events)?;
        }
    }
}

/// A CPU view of a buffer.
pub trait CpuMapping {
    fn as_mut_slice(&mut self) -> &mut [u8];
}

impl CpuMapping for crate::utils::mmap::Mmapped {
    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DumbBuffer {
    pub handle: u32,
    pub pitch: u32,
    pub size: u64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AddFb {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub bpp: u32,
    pub pitch: u32,
    pub handle: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AddFb2 {
    pub width: u32,
    pub height: u32,
    pub format: u32,
    pub flags: u32,
    pub handles: [u32; 4],
    pub pitches: [u32; 4],
    pub offsets: [u32; 4],
    pub modifiers: [u64; 4],
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct VblankReply {
    pub sequence: u32,
    pub usec: u64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct VblankTiming {
    pub user_data: u64,
    pub tv_sec: u32,
    pub tv_usec: u32,
    pub sequence: u32,
    pub crtc_id: DrmCrtc,
}

impl VblankTiming {
    pub fn usec(&self) -> u64 {
        self.tv_sec as u64 * 1_000_000 + self.tv_usec as u64
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DrmEvent {
    Vblank(VblankTiming),
    FlipComplete(VblankTiming),
    Sequence {
        user_data: u64,
        time_ns: i64,
        sequence: u64,
    },
}

#[derive(Debug)]
pub struct DrmPropertyDefinition {
    pub id: DrmProperty,
    pub name: BString,
    pub immutable: bool,
    pub atomic: bool,
    pub ty: DrmPropertyType,
}

#[derive(Debug, Clone)]
pub enum DrmPropertyType {
    Range { min: u64, max: u64 },
    SignedRange { min: i64, max: i64 },
    Object { ty: u32 },
    Blob,
    Enum {
        values: Vec<DrmPropertyEnumValue>,
        bitmask: bool,
    },
}

#[derive(Debug, Clone)]
pub struct DrmPropertyEnumValue {
    pub value: u64,
    pub name: BString,
}

#[derive(Copy, Clone, Debug)]
pub struct DrmPropertyValue {
    pub id: DrmProperty,
    pub value: u64,
}

pub trait DrmObject {
    const TYPE: u32;
    const NONE: Self;
    fn id(&self) -> u32;
    fn is_some(&self) -> bool;
    fn is_none(&self) -> bool;
}

macro_rules! drm_obj {
    ($name:ident, $ty:expr) => {
        #[repr(transparent)]
        #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Default, Ord, PartialOrd)]
        pub struct $name(pub u32);

        impl DrmObject for $name {
            const TYPE: u32 = $ty;
            const NONE: Self = Self(0);

            fn id(&self) -> u32 {
                self.0
            }

            fn is_some(&self) -> bool {
                self.0 != 0
            }

            fn is_none(&self) -> bool {
                self.0 == 0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                Display::fmt(&self.0, f)
            }
        }
    };
}
drm_obj!(DrmCrtc, DRM_MODE_OBJECT_CRTC);
drm_obj!(DrmConnector, DRM_MODE_OBJECT_CONNECTOR);
drm_obj!(DrmEncoder, DRM_MODE_OBJECT_ENCODER);
drm_obj!(DrmMode, DRM_MODE_OBJECT_MODE);
drm_obj!(DrmProperty, DRM_MODE_OBJECT_PROPERTY);
drm_obj!(DrmFb, DRM_MODE_OBJECT_FB);
drm_obj!(DrmBlob, DRM_MODE_OBJECT_BLOB);
drm_obj!(DrmPlane, DRM_MODE_OBJECT_PLANE);

#[derive(Debug, Clone, Default)]
pub struct DrmCardResources {
    pub min_width: u32,
    pub max_width: u32,
    pub min_height: u32,
    pub max_height: u32,
    pub crtcs: Vec<DrmCrtc>,
    pub connectors: Vec<DrmConnector>,
    pub encoders: Vec<DrmEncoder>,
}

#[derive(Debug, Clone)]
pub struct DrmPlaneInfo {
    pub id: DrmPlane,
    pub crtc_id: DrmCrtc,
    pub fb_id: DrmFb,
    pub possible_crtcs: u32,
    pub format_types: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct DrmCrtcInfo {
    pub id: DrmCrtc,
    pub fb_id: DrmFb,
    pub x: u32,
    pub y: u32,
    pub gamma_size: u32,
    pub mode: Option<DrmModeInfo>,
}

#[derive(Debug, Clone)]
pub struct DrmEncoderInfo {
    pub id: DrmEncoder,
    pub crtc_id: DrmCrtc,
    pub possible_crtcs: u32,
    pub possible_clones: u32,
}

#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct DrmModeInfo {
    pub clock: u32,
    pub hdisplay: u16,
    pub hsync_start: u16,
    pub hsync_end: u16,
    pub htotal: u16,
    pub hskew: u16,
    pub vdisplay: u16,
    pub vsync_start: u16,
    pub vsync_end: u16,
    pub vtotal: u16,
    pub vscan: u16,

    pub vrefresh: u32,

    pub flags: u32,
    pub ty: u32,
    pub name: BString,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DrmVersion {
    pub version_major: i32,
    pub version_minor: i32,
    pub version_patchlevel: i32,
    pub name: BString,
    pub date: BString,
    pub desc: BString,
}

impl DrmModeInfo {
    pub fn to_raw(&self) -> drm_mode_modeinfo {
        let mut name = [0u8; DRM_DISPLAY_MODE_LEN];
        let len = name.len().min(self.name.len());
        name[..len].copy_from_slice(&self.name.as_bytes()[..len]);
        drm_mode_modeinfo {
            clock: self.clock,
            hdisplay: self.hdisplay,
            hsync_start: self.hsync_start,
            hsync_end: self.hsync_end,
            htotal: self.htotal,
            hskew: self.hskew,
            vdisplay: self.vdisplay,
            vsync_start: self.vsync_start,
            vsync_end: self.vsync_end,
            vtotal: self.vtotal,
            vscan: self.vscan,
            vrefresh: self.vrefresh,
            flags: self.flags,
            ty: self.ty,
            name,
        }
    }

    /// The byte-for-byte contents of a mode blob for this timing.
    pub fn blob_bytes(&self) -> Vec<u8> {
        pod_bytes(&[self.to_raw()]).to_vec()
    }

    /// Compares everything that reaches the hardware.
    pub fn same_timing(&self, other: &DrmModeInfo) -> bool {
        self.clock == other.clock
            && self.hdisplay == other.hdisplay
            && self.hsync_start == other.hsync_start
            && self.hsync_end == other.hsync_end
            && self.htotal == other.htotal
            && self.hskew == other.hskew
            && self.vdisplay == other.vdisplay
            && self.vsync_start == other.vsync_start
            && self.vsync_end == other.vsync_end
            && self.vtotal == other.vtotal
            && self.vscan == other.vscan
            && self.flags == other.flags
    }

    pub fn is_preferred(&self) -> bool {
        self.ty & sys::DRM_MODE_TYPE_PREFERRED != 0
    }

    pub fn refresh_rate_millihz(&self) -> u32 {
        let htotal = self.htotal as u64;
        let vtotal = self.vtotal as u64;
        if htotal == 0 || vtotal == 0 {
            return 0;
        }
        let clock_millihz = self.clock as u64 * 1_000_000;
        (((clock_millihz / htotal) + (vtotal / 2)) / vtotal) as u32
    }
}

impl Display for DrmModeInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mhz = self.refresh_rate_millihz();
        write!(
            f,
            "{}x{}@{}.{:03}",
            self.hdisplay,
            self.vdisplay,
            mhz / 1000,
            mhz % 1000
        )
    }
}

#[derive(Debug, Clone)]
pub struct DrmConnectorInfo {
    pub id: DrmConnector,
    pub encoders: Vec<DrmEncoder>,
    pub modes: Vec<DrmModeInfo>,

    pub encoder_id: DrmEncoder,
    pub connector_type: u32,
    pub connector_type_id: u32,

    pub connection: u32,
    pub mm_width: u32,
    pub mm_height: u32,
}

/// A flat list of (object, property, value) writes grouped by object.
#[derive(Default, Debug, Clone)]
pub struct Change {
    objects: Vec<u32>,
    object_lengths: Vec<u32>,
    props: Vec<u32>,
    values: Vec<u64>,
}

pub struct ObjectChange<'a> {
    change: &'a mut Change,
}

impl Change {
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn change_object<T, F>(&mut self, obj: T, f: F)
    where
        T: DrmObject,
        F: FnOnce(&mut ObjectChange),
    {
        let old_len = self.props.len();
        let mut oc = ObjectChange { change: self };
        f(&mut oc);
        if self.props.len() > old_len {
            let new = (self.props.len() - old_len) as u32;
            match self.object_lengths.last_mut() {
                Some(len) if self.objects.last() == Some(&obj.id()) => *len += new,
                _ => {
                    self.objects.push(obj.id());
                    self.object_lengths.push(new);
                }
            }
        }
    }

    /// Iterates over the writes as (object, property, value) triples.
    pub fn writes(&self) -> impl Iterator<Item = (u32, DrmProperty, u64)> + '_ {
        let mut pos = 0;
        self.objects
            .iter()
            .zip(self.object_lengths.iter())
            .flat_map(move |(&obj, &len)| {
                let start = pos;
                pos += len as usize;
                (start..pos).map(move |i| (obj, DrmProperty(self.props[i]), self.values[i]))
            })
    }
}

impl<'a> ObjectChange<'a> {
    /// Writes to absent properties are dropped.
    pub fn change(&mut self, property_id: DrmProperty, value: u64) {
        if property_id.is_none() {
            return;
        }
        self.change.props.push(property_id.0);
        self.change.values.push(value);
    }
}

#[expect(non_camel_case_types)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnectorType {
    Unknown(u32),
    VGA,
    DVII,
    DVID,
    DVIA,
    Composite,
    SVIDEO,
    LVDS,
    Component,
    _9PinDIN,
    DisplayPort,
    HDMIA,
    HDMIB,
    TV,
    eDP,
    VIRTUAL,
    DSI,
    DPI,
    WRITEBACK,
    SPI,
    USB,
}

impl ConnectorType {
    pub fn from_drm(v: u32) -> Self {
        match v {
            sys::DRM_MODE_CONNECTOR_VGA => Self::VGA,
            sys::DRM_MODE_CONNECTOR_DVII => Self::DVII,
            sys::DRM_MODE_CONNECTOR_DVID => Self::DVID,
            sys::DRM_MODE_CONNECTOR_DVIA => Self::DVIA,
            sys::DRM_MODE_CONNECTOR_Composite => Self::Composite,
            sys::DRM_MODE_CONNECTOR_SVIDEO => Self::SVIDEO,
            sys::DRM_MODE_CONNECTOR_LVDS => Self::LVDS,
            sys::DRM_MODE_CONNECTOR_Component => Self::Component,
            sys::DRM_MODE_CONNECTOR_9PinDIN => Self::_9PinDIN,
            sys::DRM_MODE_CONNECTOR_DisplayPort => Self::DisplayPort,
            sys::DRM_MODE_CONNECTOR_HDMIA => Self::HDMIA,
            sys::DRM_MODE_CONNECTOR_HDMIB => Self::HDMIB,
            sys::DRM_MODE_CONNECTOR_TV => Self::TV,
            sys::DRM_MODE_CONNECTOR_eDP => Self::eDP,
            sys::DRM_MODE_CONNECTOR_VIRTUAL => Self::VIRTUAL,
            sys::DRM_MODE_CONNECTOR_DSI => Self::DSI,
            sys::DRM_MODE_CONNECTOR_DPI => Self::DPI,
            sys::DRM_MODE_CONNECTOR_WRITEBACK => Self::WRITEBACK,
            sys::DRM_MODE_CONNECTOR_SPI => Self::SPI,
            sys::DRM_MODE_CONNECTOR_USB => Self::USB,
            _ => Self::Unknown(v),
        }
    }
}

impl Display for ConnectorType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unknown(_) => "Unknown",
            Self::VGA => "VGA",
            Self::DVII => "DVI-I",
            Self::DVID => "DVI-D",
            Self::DVIA => "DVI-A",
            Self::Composite => "Composite",
            Self::SVIDEO => "SVIDEO",
            Self::LVDS => "LVDS",
            Self::Component => "Component",
            Self::_9PinDIN => "DIN",
            Self::DisplayPort => "DP",
            Self::HDMIA => "HDMI-A",
            Self::HDMIB => "HDMI-B",
            Self::TV => "TV",
            Self::eDP => "eDP",
            Self::VIRTUAL => "Virtual",
            Self::DSI => "DSI",
            Self::DPI => "DPI",
            Self::WRITEBACK => "Writeback",
            Self::SPI => "SPI",
            Self::USB => "USB",
        };
        f.write_str(s)
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ConnectorStatus {
    Connected,
    Disconnected,
    Unknown,
    Other(u32),
}

impl ConnectorStatus {
    pub fn from_drm(v: u32) -> Self {
        match v {
            sys::CONNECTOR_STATUS_CONNECTED => Self::Connected,
            sys::CONNECTOR_STATUS_DISCONNECTED => Self::Disconnected,
            sys::CONNECTOR_STATUS_UNKNOWN => Self::Unknown,
            _ => Self::Other(v),
        }
    }
}

impl Display for ConnectorStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected => f.write_str("connected"),
            Self::Disconnected => f.write_str("disconnected"),
            Self::Unknown => f.write_str("unknown"),
            Self::Other(n) => write!(f, "status {}", n),
        }
    }
}

pub(crate) fn log_drop_error<E: std::error::Error>(what: &str, res: Result<(), E>) {
    if let Err(e) = res {
        log::error!("Could not {}: {}", what, ErrorFmt(e));
    }
}
