#![allow(non_camel_case_types)]
#![allow(non_upper_case_globals)]

use {
    crate::{
        utils::{bitflags::BitflagsExt, compat::IoctlNumber, oserror::OsError},
        video::drm::{
            DrmBlob, DrmCardResources, DrmConnector, DrmConnectorInfo, DrmCrtc, DrmCrtcInfo,
            DrmEncoder, DrmEncoderInfo, DrmError, DrmFb, DrmModeInfo, DrmPlane, DrmPlaneInfo,
            DrmProperty, DrmPropertyDefinition, DrmPropertyEnumValue, DrmPropertyType,
            DrmPropertyValue, DrmVersion,
        },
    },
    uapi::{OwnedFd, Pod, c},
};

pub unsafe fn ioctl<T>(fd: c::c_int, request: u64, t: &mut T) -> Result<c::c_int, OsError> {
    let mut ret;
    loop {
        ret = unsafe { c::ioctl(fd, request as IoctlNumber, &mut *t) };
        if ret != -1 {
            return Ok(ret);
        }
        let err = uapi::get_errno();
        if !matches!(err, c::EINTR | c::EAGAIN) {
            return Err(OsError(err));
        }
    }
}

pub const DRM_IOCTL_BASE: u64 = b'd' as u64;

pub const fn drm_iow<T>(nr: u64) -> u64 {
    uapi::_IOW::<T>(DRM_IOCTL_BASE, nr)
}

pub const fn drm_iowr<T>(nr: u64) -> u64 {
    uapi::_IOWR::<T>(DRM_IOCTL_BASE, nr)
}

fn cstr_bytes(name: &[u8]) -> &[u8] {
    name.split(|n| *n == 0).next().unwrap_or_default()
}

const DRM_PROP_NAME_LEN: usize = 32;

#[repr(C)]
#[derive(Default)]
struct drm_mode_get_property {
    values_ptr: u64,
    enum_blob_ptr: u64,
    prop_id: u32,
    flags: u32,
    name: [u8; DRM_PROP_NAME_LEN],
    count_values: u32,
    count_enum_blobs: u32,
}

const DRM_IOCTL_MODE_GETPROPERTY: u64 = drm_iowr::<drm_mode_get_property>(0xaa);

pub const DRM_MODE_PROP_RANGE: u32 = 1 << 1;
pub const DRM_MODE_PROP_IMMUTABLE: u32 = 1 << 2;
pub const DRM_MODE_PROP_ENUM: u32 = 1 << 3;
pub const DRM_MODE_PROP_BLOB: u32 = 1 << 4;
pub const DRM_MODE_PROP_BITMASK: u32 = 1 << 5;

const DRM_MODE_PROP_LEGACY_TYPE: u32 =
    DRM_MODE_PROP_RANGE | DRM_MODE_PROP_ENUM | DRM_MODE_PROP_BLOB | DRM_MODE_PROP_BITMASK;

const DRM_MODE_PROP_EXTENDED_TYPE: u32 = 0x0000ffc0;
const fn drm_mode_prop_type(n: u32) -> u32 {
    n << 6
}
pub const DRM_MODE_PROP_OBJECT: u32 = drm_mode_prop_type(1);
pub const DRM_MODE_PROP_SIGNED_RANGE: u32 = drm_mode_prop_type(2);

const DRM_MODE_PROP_ATOMIC: u32 = 0x80000000;

pub const DRM_CAP_DUMB_BUFFER: u64 = 0x1;
pub const DRM_CAP_VBLANK_HIGH_CRTC: u64 = 0x2;
pub const DRM_CAP_DUMB_PREFERRED_DEPTH: u64 = 0x3;
pub const DRM_CAP_PRIME: u64 = 0x5;
pub const DRM_CAP_CURSOR_WIDTH: u64 = 0x8;
pub const DRM_CAP_CURSOR_HEIGHT: u64 = 0x9;
pub const DRM_CAP_ADDFB2_MODIFIERS: u64 = 0x10;

pub const DRM_PRIME_CAP_IMPORT: u64 = 0x1;

#[repr(C)]
struct drm_mode_property_enum {
    value: u64,
    name: [u8; DRM_PROP_NAME_LEN],
}

pub fn mode_getproperty(
    fd: c::c_int,
    property_id: DrmProperty,
) -> Result<DrmPropertyDefinition, DrmError> {
    let mut prop = drm_mode_get_property {
        prop_id: property_id.0,
        ..Default::default()
    };

    let get = |prop: &mut drm_mode_get_property| {
        unsafe {
            if let Err(e) = ioctl(fd, DRM_IOCTL_MODE_GETPROPERTY, prop) {
                return Err(DrmError::GetProperty(e));
            }
        }
        Ok(())
    };

    get(&mut prop)?;

    let ty = prop.flags & (DRM_MODE_PROP_LEGACY_TYPE | DRM_MODE_PROP_EXTENDED_TYPE);
    let ty = match ty {
        DRM_MODE_PROP_RANGE | DRM_MODE_PROP_SIGNED_RANGE => {
            if prop.count_values != 2 {
                return Err(DrmError::RangeValues);
            }
            prop.count_enum_blobs = 0;
            let mut vals = [0u64, 0];
            prop.values_ptr = vals.as_mut_ptr() as _;
            get(&mut prop)?;
            if ty == DRM_MODE_PROP_RANGE {
                DrmPropertyType::Range {
                    min: vals[0],
                    max: vals[1],
                }
            } else {
                DrmPropertyType::SignedRange {
                    min: vals[0] as _,
                    max: vals[1] as _,
                }
            }
        }
        DRM_MODE_PROP_ENUM | DRM_MODE_PROP_BITMASK => {
            prop.count_values = 0;
            let mut props =
                Vec::<drm_mode_property_enum>::with_capacity(prop.count_enum_blobs as usize);
            prop.enum_blob_ptr = props.as_mut_ptr() as _;
            get(&mut prop)?;
            unsafe {
                props.set_len(prop.count_enum_blobs as usize);
            }
            let values = props
                .iter()
                .map(|v| DrmPropertyEnumValue {
                    value: v.value,
                    name: cstr_bytes(&v.name).to_vec().into(),
                })
                .collect();
            DrmPropertyType::Enum {
                values,
                bitmask: ty == DRM_MODE_PROP_BITMASK,
            }
        }
        DRM_MODE_PROP_BLOB => DrmPropertyType::Blob,
        DRM_MODE_PROP_OBJECT => {
            if prop.count_values != 1 {
                return Err(DrmError::ObjectValues);
            }
            let mut ty = 0u64;
            prop.values_ptr = &mut ty as *mut _ as u64;
            get(&mut prop)?;
            DrmPropertyType::Object { ty: ty as _ }
        }
        _ => return Err(DrmError::UnknownPropertyType(ty)),
    };

    Ok(DrmPropertyDefinition {
        id: property_id,
        name: cstr_bytes(&prop.name).to_vec().into(),
        immutable: prop.flags.contains(DRM_MODE_PROP_IMMUTABLE),
        atomic: prop.flags.contains(DRM_MODE_PROP_ATOMIC),
        ty,
    })
}

#[repr(C)]
#[derive(Debug)]
struct drm_mode_obj_get_properties {
    props_ptr: u64,
    prop_values_ptr: u64,
    count_props: u32,
    obj_id: u32,
    obj_type: u32,
}

const DRM_IOCTL_MODE_OBJ_GETPROPERTIES: u64 = drm_iowr::<drm_mode_obj_get_properties>(0xb9);

pub fn mode_obj_getproperties(
    fd: c::c_int,
    obj_id: u32,
    obj_type: u32,
) -> Result<Vec<DrmPropertyValue>, DrmError> {
    let mut props = drm_mode_obj_get_properties {
        props_ptr: 0,
        prop_values_ptr: 0,
        count_props: 0,
        obj_id,
        obj_type,
    };

    let get = |prop: &mut drm_mode_obj_get_properties| {
        unsafe {
            if let Err(e) = ioctl(fd, DRM_IOCTL_MODE_OBJ_GETPROPERTIES, prop) {
                return Err(DrmError::GetProperties(e));
            }
        }
        Ok(())
    };

    get(&mut props)?;

    let mut ids = Vec::<u32>::new();
    let mut values = Vec::<u64>::new();
    let mut num_props = 0;

    while num_props != props.count_props {
        num_props = props.count_props;

        ids.reserve(num_props as _);
        values.reserve(num_props as _);

        props.props_ptr = ids.as_mut_ptr() as _;
        props.prop_values_ptr = values.as_mut_ptr() as _;

        get(&mut props)?;
    }

    unsafe {
        ids.set_len(num_props as _);
        values.set_len(num_props as _);
    }

    Ok(ids
        .into_iter()
        .zip(values)
        .map(|(id, value)| DrmPropertyValue {
            id: DrmProperty(id),
            value,
        })
        .collect())
}

#[repr(C)]
struct drm_mode_obj_set_property {
    value: u64,
    prop_id: u32,
    obj_id: u32,
    obj_type: u32,
}

const DRM_IOCTL_MODE_OBJ_SETPROPERTY: u64 = drm_iowr::<drm_mode_obj_set_property>(0xba);

pub fn mode_obj_setproperty(
    fd: c::c_int,
    obj_id: u32,
    obj_type: u32,
    prop: DrmProperty,
    value: u64,
) -> Result<(), OsError> {
    let mut res = drm_mode_obj_set_property {
        value,
        prop_id: prop.0,
        obj_id,
        obj_type,
    };
    unsafe {
        ioctl(fd, DRM_IOCTL_MODE_OBJ_SETPROPERTY, &mut res)?;
    }
    Ok(())
}

pub const DRM_MODE_OBJECT_CRTC: u32 = 0xcccccccc;
pub const DRM_MODE_OBJECT_CONNECTOR: u32 = 0xc0c0c0c0;
pub const DRM_MODE_OBJECT_ENCODER: u32 = 0xe0e0e0e0;
pub const DRM_MODE_OBJECT_MODE: u32 = 0xdededede;
pub const DRM_MODE_OBJECT_PROPERTY: u32 = 0xb0b0b0b0;
pub const DRM_MODE_OBJECT_FB: u32 = 0xfbfbfbfb;
pub const DRM_MODE_OBJECT_BLOB: u32 = 0xbbbbbbbb;
pub const DRM_MODE_OBJECT_PLANE: u32 = 0xeeeeeeee;

pub const DRM_MODE_CONNECTOR_Unknown: u32 = 0;
pub const DRM_MODE_CONNECTOR_VGA: u32 = 1;
pub const DRM_MODE_CONNECTOR_DVII: u32 = 2;
pub const DRM_MODE_CONNECTOR_DVID: u32 = 3;
pub const DRM_MODE_CONNECTOR_DVIA: u32 = 4;
pub const DRM_MODE_CONNECTOR_Composite: u32 = 5;
pub const DRM_MODE_CONNECTOR_SVIDEO: u32 = 6;
pub const DRM_MODE_CONNECTOR_LVDS: u32 = 7;
pub const DRM_MODE_CONNECTOR_Component: u32 = 8;
pub const DRM_MODE_CONNECTOR_9PinDIN: u32 = 9;
pub const DRM_MODE_CONNECTOR_DisplayPort: u32 = 10;
pub const DRM_MODE_CONNECTOR_HDMIA: u32 = 11;
pub const DRM_MODE_CONNECTOR_HDMIB: u32 = 12;
pub const DRM_MODE_CONNECTOR_TV: u32 = 13;
pub const DRM_MODE_CONNECTOR_eDP: u32 = 14;
pub const DRM_MODE_CONNECTOR_VIRTUAL: u32 = 15;
pub const DRM_MODE_CONNECTOR_DSI: u32 = 16;
pub const DRM_MODE_CONNECTOR_DPI: u32 = 17;
pub const DRM_MODE_CONNECTOR_WRITEBACK: u32 = 18;
pub const DRM_MODE_CONNECTOR_SPI: u32 = 19;
pub const DRM_MODE_CONNECTOR_USB: u32 = 20;

#[repr(C)]
struct drm_set_client_cap {
    capability: u64,
    value: u64,
}

const DRM_IOCTL_SET_CLIENT_CAP: u64 = drm_iow::<drm_set_client_cap>(0x0d);

pub const DRM_CLIENT_CAP_UNIVERSAL_PLANES: u64 = 2;
pub const DRM_CLIENT_CAP_ATOMIC: u64 = 3;

pub fn set_client_cap(fd: c::c_int, capability: u64, value: u64) -> Result<(), OsError> {
    let mut cap = drm_set_client_cap { capability, value };
    unsafe {
        ioctl(fd, DRM_IOCTL_SET_CLIENT_CAP, &mut cap)?;
    }
    Ok(())
}

#[repr(C)]
struct drm_get_cap {
    capability: u64,
    value: u64,
}

const DRM_IOCTL_GET_CAP: u64 = drm_iowr::<drm_get_cap>(0x0c);

pub fn get_cap(fd: c::c_int, capability: u64) -> Result<u64, OsError> {
    let mut cap = drm_get_cap {
        capability,
        value: 0,
    };
    unsafe {
        ioctl(fd, DRM_IOCTL_GET_CAP, &mut cap)?;
    }
    Ok(cap.value)
}

#[repr(C)]
#[derive(Default)]
struct drm_mode_card_res {
    fb_id_ptr: u64,
    crtc_id_ptr: u64,
    connector_id_ptr: u64,
    encoder_id_ptr: u64,
    count_fbs: u32,
    count_crtcs: u32,
    count_connectors: u32,
    count_encoders: u32,
    min_width: u32,
    max_width: u32,
    min_height: u32,
    max_height: u32,
}

const DRM_IOCTL_MODE_GETRESOURCES: u64 = drm_iowr::<drm_mode_card_res>(0xa0);

pub fn mode_get_resources(fd: c::c_int) -> Result<DrmCardResources, DrmError> {
    let mut res = drm_mode_card_res::default();

    let get = |res: &mut drm_mode_card_res| {
        unsafe {
            if let Err(e) = ioctl(fd, DRM_IOCTL_MODE_GETRESOURCES, res) {
                return Err(DrmError::GetResources(e));
            }
        }
        Ok(())
    };

    get(&mut res)?;

    let mut count_crtcs = 0;
    let mut count_connectors = 0;
    let mut count_encoders = 0;

    let mut crtcs = Vec::<DrmCrtc>::new();
    let mut connectors = Vec::<DrmConnector>::new();
    let mut encoders = Vec::<DrmEncoder>::new();

    res.count_fbs = 0;
    while (count_crtcs, count_connectors, count_encoders)
        != (res.count_crtcs, res.count_connectors, res.count_encoders)
    {
        count_crtcs = res.count_crtcs;
        count_connectors = res.count_connectors;
        count_encoders = res.count_encoders;

        crtcs.reserve(count_crtcs as _);
        connectors.reserve(count_connectors as _);
        encoders.reserve(count_encoders as _);

        res.count_fbs = 0;
        res.crtc_id_ptr = crtcs.as_mut_ptr() as _;
        res.connector_id_ptr = connectors.as_mut_ptr() as _;
        res.encoder_id_ptr = encoders.as_mut_ptr() as _;

        get(&mut res)?;
    }

    unsafe {
        crtcs.set_len(count_crtcs as _);
        connectors.set_len(count_connectors as _);
        encoders.set_len(count_encoders as _);
    }

    Ok(DrmCardResources {
        min_width: res.min_width,
        max_width: res.max_width,
        min_height: res.min_height,
        max_height: res.max_height,
        crtcs,
        connectors,
        encoders,
    })
}

#[repr(C)]
struct drm_mode_get_plane_res {
    plane_id_ptr: u64,
    count_planes: u32,
}

const DRM_IOCTL_MODE_GETPLANERESOURCES: u64 = drm_iowr::<drm_mode_get_plane_res>(0xb5);

pub fn mode_getplaneresources(fd: c::c_int) -> Result<Vec<DrmPlane>, DrmError> {
    let mut res = drm_mode_get_plane_res {
        plane_id_ptr: 0,
        count_planes: 0,
    };

    let get = |res: &mut drm_mode_get_plane_res| {
        unsafe {
            if let Err(e) = ioctl(fd, DRM_IOCTL_MODE_GETPLANERESOURCES, res) {
                return Err(DrmError::GetPlaneResources(e));
            }
        }
        Ok(())
    };

    get(&mut res)?;

    let mut count_planes = 0;
    let mut planes = Vec::<DrmPlane>::new();

    while count_planes != res.count_planes {
        count_planes = res.count_planes;
        planes.reserve(count_planes as _);
        res.plane_id_ptr = planes.as_mut_ptr() as _;
        get(&mut res)?;
    }

    unsafe {
        planes.set_len(count_planes as _);
    }

    Ok(planes)
}

#[repr(C)]
#[derive(Default)]
struct drm_mode_get_plane {
    plane_id: u32,

    crtc_id: u32,
    fb_id: u32,

    possible_crtcs: u32,
    gamma_size: u32,

    count_format_types: u32,
    format_type_ptr: u64,
}

const DRM_IOCTL_MODE_GETPLANE: u64 = drm_iowr::<drm_mode_get_plane>(0xb6);

pub fn mode_getplane(fd: c::c_int, plane_id: u32) -> Result<DrmPlaneInfo, DrmError> {
    let mut res = drm_mode_get_plane {
        plane_id,
        ..Default::default()
    };

    let get = |res: &mut drm_mode_get_plane| {
        unsafe {
            if let Err(e) = ioctl(fd, DRM_IOCTL_MODE_GETPLANE, res) {
                return Err(DrmError::GetPlane(e));
            }
        }
        Ok(())
    };

    get(&mut res)?;

    let mut count_formats = 0;
    let mut formats = Vec::<u32>::new();

    while count_formats != res.count_format_types {
        count_formats = res.count_format_types;
        formats.reserve(count_formats as _);
        res.format_type_ptr = formats.as_mut_ptr() as _;
        get(&mut res)?;
    }

    unsafe {
        formats.set_len(count_formats as _);
    }

    Ok(DrmPlaneInfo {
        id: DrmPlane(plane_id),
        crtc_id: DrmCrtc(res.crtc_id),
        fb_id: DrmFb(res.fb_id),
        possible_crtcs: res.possible_crtcs,
        format_types: formats,
    })
}

#[repr(C)]
#[derive(Default)]
struct drm_mode_get_encoder {
    encoder_id: u32,
    encoder_type: u32,

    crtc_id: u32,

    possible_crtcs: u32,
    possible_clones: u32,
}

const DRM_IOCTL_MODE_GETENCODER: u64 = drm_iowr::<drm_mode_get_encoder>(0xa6);

pub fn mode_getencoder(fd: c::c_int, encoder_id: u32) -> Result<DrmEncoderInfo, DrmError> {
    let mut res = drm_mode_get_encoder {
        encoder_id,
        ..Default::default()
    };

    unsafe {
        if let Err(e) = ioctl(fd, DRM_IOCTL_MODE_GETENCODER, &mut res) {
            return Err(DrmError::GetEncoder(e));
        }
    }

    Ok(DrmEncoderInfo {
        id: DrmEncoder(encoder_id),
        crtc_id: DrmCrtc(res.crtc_id),
        possible_crtcs: res.possible_crtcs,
        possible_clones: res.possible_clones,
    })
}

pub const DRM_DISPLAY_MODE_LEN: usize = 32;

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct drm_mode_modeinfo {
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
    pub name: [u8; DRM_DISPLAY_MODE_LEN],
}

unsafe impl Pod for drm_mode_modeinfo {}

impl From<drm_mode_modeinfo> for DrmModeInfo {
    fn from(m: drm_mode_modeinfo) -> Self {
        DrmModeInfo {
            clock: m.clock,
            hdisplay: m.hdisplay,
            hsync_start: m.hsync_start,
            hsync_end: m.hsync_end,
            htotal: m.htotal,
            hskew: m.hskew,
            vdisplay: m.vdisplay,
            vsync_start: m.vsync_start,
            vsync_end: m.vsync_end,
            vtotal: m.vtotal,
            vscan: m.vscan,
            vrefresh: m.vrefresh,
            flags: m.flags,
            ty: m.ty,
            name: cstr_bytes(&m.name).to_vec().into(),
        }
    }
}

pub const DRM_MODE_TYPE_PREFERRED: u32 = 1 << 3;

#[repr(C)]
#[derive(Default)]
struct drm_mode_crtc {
    set_connectors_ptr: u64,
    count_connectors: u32,

    crtc_id: u32,
    fb_id: u32,

    x: u32,
    y: u32,

    gamma_size: u32,
    mode_valid: u32,
    mode: drm_mode_modeinfo,
}

const DRM_IOCTL_MODE_GETCRTC: u64 = drm_iowr::<drm_mode_crtc>(0xa1);
const DRM_IOCTL_MODE_SETCRTC: u64 = drm_iowr::<drm_mode_crtc>(0xa2);

pub fn mode_getcrtc(fd: c::c_int, crtc_id: u32) -> Result<DrmCrtcInfo, DrmError> {
    let mut res = drm_mode_crtc {
        crtc_id,
        ..Default::default()
    };
    unsafe {
        if let Err(e) = ioctl(fd, DRM_IOCTL_MODE_GETCRTC, &mut res) {
            return Err(DrmError::GetCrtc(e));
        }
    }
    Ok(DrmCrtcInfo {
        id: DrmCrtc(crtc_id),
        fb_id: DrmFb(res.fb_id),
        x: res.x,
        y: res.y,
        gamma_size: res.gamma_size,
        mode: match res.mode_valid {
            0 => None,
            _ => Some(res.mode.into()),
        },
    })
}

pub fn mode_setcrtc(
    fd: c::c_int,
    crtc: DrmCrtc,
    fb: DrmFb,
    x: u32,
    y: u32,
    connectors: &[DrmConnector],
    mode: Option<&drm_mode_modeinfo>,
) -> Result<(), OsError> {
    let mut res = drm_mode_crtc {
        set_connectors_ptr: connectors.as_ptr() as _,
        count_connectors: connectors.len() as _,
        crtc_id: crtc.0,
        fb_id: fb.0,
        x,
        y,
        ..Default::default()
    };
    if let Some(mode) = mode {
        res.mode = *mode;
        res.mode_valid = 1;
    }
    unsafe {
        ioctl(fd, DRM_IOCTL_MODE_SETCRTC, &mut res)?;
    }
    Ok(())
}

pub const CONNECTOR_STATUS_CONNECTED: u32 = 1;
pub const CONNECTOR_STATUS_DISCONNECTED: u32 = 2;
pub const CONNECTOR_STATUS_UNKNOWN: u32 = 3;

#[derive(Default)]
#[repr(C)]
struct drm_mode_get_connector {
    encoders_ptr: u64,
    modes_ptr: u64,
    props_ptr: u64,
    prop_values_ptr: u64,

    count_modes: u32,
    count_props: u32,
    count_encoders: u32,

    encoder_id: u32,
    connector_id: u32,
    connector_type: u32,
    connector_type_id: u32,

    connection: u32,
    mm_width: u32,
    mm_height: u32,
    subpixel: u32,

    pad: u32,
}

const DRM_IOCTL_MODE_GETCONNECTOR: u64 = drm_iowr::<drm_mode_get_connector>(0xa7);

pub fn mode_getconnector(
    fd: c::c_int,
    connector: u32,
    force: bool,
) -> Result<DrmConnectorInfo, DrmError> {
    let mut count_modes = if force { 0 } else { 1 };
    let mut count_encoders = 0;

    let mut modes = Vec::<drm_mode_modeinfo>::with_capacity(1);
    let mut encoders = Vec::<DrmEncoder>::new();

    let mut res = drm_mode_get_connector {
        connector_id: connector,
        count_modes,
        modes_ptr: modes.as_mut_ptr() as _,
        ..Default::default()
    };

    let get = |res: &mut drm_mode_get_connector| {
        unsafe {
            if let Err(e) = ioctl(fd, DRM_IOCTL_MODE_GETCONNECTOR, res) {
                return Err(DrmError::GetConnector(e));
            }
        }
        Ok(())
    };

    get(&mut res)?;

    while (count_modes, count_encoders) != (res.count_modes, res.count_encoders) {
        count_modes = res.count_modes;
        count_encoders = res.count_encoders;

        modes.reserve(count_modes as _);
        encoders.reserve(count_encoders as _);

        res.count_props = 0;
        res.modes_ptr = modes.as_mut_ptr() as _;
        res.encoders_ptr = encoders.as_mut_ptr() as _;

        get(&mut res)?;
    }

    unsafe {
        modes.set_len(count_modes as _);
        encoders.set_len(count_encoders as _);
    }

    Ok(DrmConnectorInfo {
        id: DrmConnector(connector),
        encoders,
        modes: modes.into_iter().map(|m| m.into()).collect(),
        encoder_id: DrmEncoder(res.encoder_id),
        connector_type: res.connector_type,
        connector_type_id: res.connector_type_id,
        connection: res.connection,
        mm_width: res.mm_width,
        mm_height: res.mm_height,
    })
}

#[repr(C)]
struct drm_mode_atomic {
    flags: u32,
    count_objs: u32,
    objs_ptr: u64,
    count_props_ptr: u64,
    props_ptr: u64,
    prop_values_ptr: u64,
    reserved: u64,
    user_data: u64,
}

const DRM_IOCTL_MODE_ATOMIC: u64 = drm_iowr::<drm_mode_atomic>(0xbc);

pub const DRM_MODE_PAGE_FLIP_EVENT: u32 = 0x01;
pub const DRM_MODE_ATOMIC_TEST_ONLY: u32 = 0x0100;
pub const DRM_MODE_ATOMIC_NONBLOCK: u32 = 0x0200;
pub const DRM_MODE_ATOMIC_ALLOW_MODESET: u32 = 0x0400;

pub fn mode_atomic(
    fd: c::c_int,
    flags: u32,
    objs: &[u32],
    count_props: &[u32],
    props: &[u32],
    prop_values: &[u64],
    user_data: u64,
) -> Result<(), OsError> {
    if objs.is_empty() {
        return Ok(());
    }

    let mut req = drm_mode_atomic {
        flags,
        count_objs: objs.len() as _,
        objs_ptr: objs.as_ptr() as _,
        count_props_ptr: count_props.as_ptr() as _,
        props_ptr: props.as_ptr() as _,
        prop_values_ptr: prop_values.as_ptr() as _,
        reserved: 0,
        user_data,
    };

    unsafe {
        ioctl(fd, DRM_IOCTL_MODE_ATOMIC, &mut req)?;
    }
    Ok(())
}

#[repr(C)]
struct drm_mode_create_blob {
    data: u64,
    length: u32,
    blob_id: u32,
}

const DRM_IOCTL_MODE_CREATEPROPBLOB: u64 = drm_iowr::<drm_mode_create_blob>(0xbd);

pub fn mode_create_blob(fd: c::c_int, data: &[u8]) -> Result<DrmBlob, OsError> {
    let mut res = drm_mode_create_blob {
        data: data.as_ptr() as _,
        length: data.len() as _,
        blob_id: 0,
    };

    unsafe {
        ioctl(fd, DRM_IOCTL_MODE_CREATEPROPBLOB, &mut res)?;
    }
    Ok(DrmBlob(res.blob_id))
}

#[repr(C)]
struct drm_mode_destroy_blob {
    blob_id: u32,
}

const DRM_IOCTL_MODE_DESTROYPROPBLOB: u64 = drm_iowr::<drm_mode_destroy_blob>(0xbe);

pub fn mode_destroy_blob(fd: c::c_int, id: DrmBlob) -> Result<(), OsError> {
    let mut res = drm_mode_destroy_blob { blob_id: id.0 };

    unsafe {
        ioctl(fd, DRM_IOCTL_MODE_DESTROYPROPBLOB, &mut res)?;
    }
    Ok(())
}

#[repr(C)]
struct drm_mode_get_blob {
    blob_id: u32,
    length: u32,
    data: u64,
}

const DRM_IOCTL_MODE_GETPROPBLOB: u64 = drm_iowr::<drm_mode_get_blob>(0xac);

pub fn mode_getpropblob(fd: c::c_int, blob_id: u32) -> Result<Vec<u8>, OsError> {
    let mut res = drm_mode_get_blob {
        blob_id,
        length: 0,
        data: 0,
    };
    unsafe {
        ioctl(fd, DRM_IOCTL_MODE_GETPROPBLOB, &mut res)?;
    }
    let mut buf = vec![0u8; res.length as usize];
    res.data = buf.as_mut_ptr() as _;
    unsafe {
        ioctl(fd, DRM_IOCTL_MODE_GETPROPBLOB, &mut res)?;
    }
    buf.truncate(res.length as usize);
    Ok(buf)
}

#[repr(C)]
struct drm_mode_create_lease {
    object_ids: u64,
    object_count: u32,
    flags: u32,
    lessee_id: u32,
    fd: u32,
}

const DRM_IOCTL_MODE_CREATE_LEASE: u64 = drm_iowr::<drm_mode_create_lease>(0xc6);

pub fn create_lease(fd: c::c_int, objects: &[u32], flags: u32) -> Result<(OwnedFd, u32), OsError> {
    let mut res = drm_mode_create_lease {
        object_ids: objects.as_ptr() as usize as _,
        object_count: objects.len() as _,
        flags,
        lessee_id: 0,
        fd: 0,
    };
    unsafe {
        ioctl(fd, DRM_IOCTL_MODE_CREATE_LEASE, &mut res)?;
    }
    Ok((OwnedFd::new(res.fd as _), res.lessee_id))
}

#[repr(C)]
struct drm_mode_list_lessees {
    count_lessees: u32,
    pad: u32,
    lessees_ptr: u64,
}

const DRM_IOCTL_MODE_LIST_LESSEES: u64 = drm_iowr::<drm_mode_list_lessees>(0xc7);

pub fn list_lessees(fd: c::c_int) -> Result<Vec<u32>, OsError> {
    let mut lessees = vec![];
    loop {
        let mut res = drm_mode_list_lessees {
            count_lessees: lessees.len() as _,
            pad: 0,
            lessees_ptr: lessees.as_mut_ptr() as usize as _,
        };
        unsafe {
            ioctl(fd, DRM_IOCTL_MODE_LIST_LESSEES, &mut res)?;
        }
        let count = res.count_lessees as usize;
        if count <= lessees.len() {
            lessees.truncate(count);
            return Ok(lessees);
        }
        lessees = vec![0; count];
    }
}

#[repr(C)]
struct drm_mode_revoke_lease {
    lessee_id: u32,
}

const DRM_IOCTL_MODE_REVOKE_LEASE: u64 = drm_iowr::<drm_mode_revoke_lease>(0xc9);

pub fn revoke_lease(fd: c::c_int, lessee_id: u32) -> Result<(), OsError> {
    let mut res = drm_mode_revoke_lease { lessee_id };
    unsafe {
        ioctl(fd, DRM_IOCTL_MODE_REVOKE_LEASE, &mut res)?;
    }
    Ok(())
}

#[repr(C)]
struct drm_mode_fb_cmd {
    fb_id: u32,
    width: u32,
    height: u32,
    pitch: u32,
    bpp: u32,
    depth: u32,
    handle: u32,
}

const DRM_IOCTL_MODE_ADDFB: u64 = drm_iowr::<drm_mode_fb_cmd>(0xae);

pub fn mode_addfb(
    fd: c::c_int,
    width: u32,
    height: u32,
    depth: u32,
    bpp: u32,
    pitch: u32,
    handle: u32,
) -> Result<DrmFb, OsError> {
    let mut res = drm_mode_fb_cmd {
        fb_id: 0,
        width,
        height,
        pitch,
        bpp,
        depth,
        handle,
    };
    unsafe {
        ioctl(fd, DRM_IOCTL_MODE_ADDFB, &mut res)?;
    }
    Ok(DrmFb(res.fb_id))
}

#[repr(C)]
#[derive(Debug)]
struct drm_mode_fb_cmd2 {
    fb_id: u32,
    width: u32,
    height: u32,
    pixel_format: u32,
    flags: u32,
    handles: [u32; 4],
    pitches: [u32; 4],
    offsets: [u32; 4],
    modifiers: [u64; 4],
}

pub const DRM_MODE_FB_MODIFIERS: u32 = 1 << 1;

const DRM_IOCTL_MODE_ADDFB2: u64 = drm_iowr::<drm_mode_fb_cmd2>(0xb8);

pub fn mode_addfb2(
    fd: c::c_int,
    width: u32,
    height: u32,
    pixel_format: u32,
    flags: u32,
    handles: [u32; 4],
    strides: [u32; 4],
    offsets: [u32; 4],
    modifiers: [u64; 4],
) -> Result<DrmFb, OsError> {
    let mut res = drm_mode_fb_cmd2 {
        fb_id: 0,
        width,
        height,
        pixel_format,
        flags,
        handles,
        pitches: strides,
        offsets,
        modifiers,
    };

    unsafe {
        ioctl(fd, DRM_IOCTL_MODE_ADDFB2, &mut res)?;
    }

    Ok(DrmFb(res.fb_id))
}

const DRM_IOCTL_MODE_RMFB: u64 = drm_iowr::<c::c_uint>(0xaf);

pub fn mode_rmfb(fd: c::c_int, id: DrmFb) -> Result<(), OsError> {
    let mut res = id.0 as c::c_uint;
    unsafe {
        ioctl(fd, DRM_IOCTL_MODE_RMFB, &mut res)?;
    }
    Ok(())
}

#[repr(C)]
struct drm_mode_crtc_page_flip {
    crtc_id: u32,
    fb_id: u32,
    flags: u32,
    reserved: u32,
    user_data: u64,
}

const DRM_IOCTL_MODE_PAGE_FLIP: u64 = drm_iowr::<drm_mode_crtc_page_flip>(0xb0);

pub fn mode_page_flip(
    fd: c::c_int,
    crtc: DrmCrtc,
    fb: DrmFb,
    flags: u32,
    user_data: u64,
) -> Result<(), OsError> {
    let mut res = drm_mode_crtc_page_flip {
        crtc_id: crtc.0,
        fb_id: fb.0,
        flags,
        reserved: 0,
        user_data,
    };
    unsafe {
        ioctl(fd, DRM_IOCTL_MODE_PAGE_FLIP, &mut res)?;
    }
    Ok(())
}

#[repr(C)]
struct drm_mode_create_dumb {
    height: u32,
    width: u32,
    bpp: u32,
    flags: u32,
    handle: u32,
    pitch: u32,
    size: u64,
}

const DRM_IOCTL_MODE_CREATE_DUMB: u64 = drm_iowr::<drm_mode_create_dumb>(0xb2);

pub fn mode_create_dumb(
    fd: c::c_int,
    width: u32,
    height: u32,
    bpp: u32,
) -> Result<(u32, u32, u64), OsError> {
    let mut res = drm_mode_create_dumb {
        height,
        width,
        bpp,
        flags: 0,
        handle: 0,
        pitch: 0,
        size: 0,
    };
    unsafe {
        ioctl(fd, DRM_IOCTL_MODE_CREATE_DUMB, &mut res)?;
    }
    Ok((res.handle, res.pitch, res.size))
}

#[repr(C)]
struct drm_mode_map_dumb {
    handle: u32,
    pad: u32,
    offset: u64,
}

const DRM_IOCTL_MODE_MAP_DUMB: u64 = drm_iowr::<drm_mode_map_dumb>(0xb3);

pub fn mode_map_dumb(fd: c::c_int, handle: u32) -> Result<u64, OsError> {
    let mut res = drm_mode_map_dumb {
        handle,
        pad: 0,
        offset: 0,
    };
    unsafe {
        ioctl(fd, DRM_IOCTL_MODE_MAP_DUMB, &mut res)?;
    }
    Ok(res.offset)
}

#[repr(C)]
struct drm_mode_destroy_dumb {
    handle: u32,
}

const DRM_IOCTL_MODE_DESTROY_DUMB: u64 = drm_iowr::<drm_mode_destroy_dumb>(0xb4);

pub fn mode_destroy_dumb(fd: c::c_int, handle: u32) -> Result<(), OsError> {
    let mut res = drm_mode_destroy_dumb { handle };
    unsafe {
        ioctl(fd, DRM_IOCTL_MODE_DESTROY_DUMB, &mut res)?;
    }
    Ok(())
}

#[repr(C)]
struct drm_mode_cursor2 {
    flags: u32,
    crtc_id: u32,
    x: i32,
    y: i32,
    width: u32,
    height: u32,
    handle: u32,
    hot_x: i32,
    hot_y: i32,
}

#[repr(C)]
struct drm_mode_cursor {
    flags: u32,
    crtc_id: u32,
    x: i32,
    y: i32,
    width: u32,
    height: u32,
    handle: u32,
}

pub const DRM_MODE_CURSOR_BO: u32 = 0x01;
pub const DRM_MODE_CURSOR_MOVE: u32 = 0x02;

const DRM_IOCTL_MODE_CURSOR: u64 = drm_iowr::<drm_mode_cursor>(0xa3);
const DRM_IOCTL_MODE_CURSOR2: u64 = drm_iowr::<drm_mode_cursor2>(0xbb);

pub fn mode_set_cursor2(
    fd: c::c_int,
    crtc: DrmCrtc,
    handle: u32,
    width: u32,
    height: u32,
    hot_x: i32,
    hot_y: i32,
) -> Result<(), OsError> {
    let mut res = drm_mode_cursor2 {
        flags: DRM_MODE_CURSOR_BO,
        crtc_id: crtc.0,
        x: 0,
        y: 0,
        width,
        height,
        handle,
        hot_x,
        hot_y,
    };
    unsafe {
        ioctl(fd, DRM_IOCTL_MODE_CURSOR2, &mut res)?;
    }
    Ok(())
}

pub fn mode_cursor(
    fd: c::c_int,
    flags: u32,
    crtc: DrmCrtc,
    handle: u32,
    width: u32,
    height: u32,
    x: i32,
    y: i32,
) -> Result<(), OsError> {
    let mut res = drm_mode_cursor {
        flags,
        crtc_id: crtc.0,
        x,
        y,
        width,
        height,
        handle,
    };
    unsafe {
        ioctl(fd, DRM_IOCTL_MODE_CURSOR, &mut res)?;
    }
    Ok(())
}

#[repr(C)]
struct drm_mode_crtc_lut {
    crtc_id: u32,
    gamma_size: u32,
    red: u64,
    green: u64,
    blue: u64,
}

const DRM_IOCTL_MODE_SETGAMMA: u64 = drm_iowr::<drm_mode_crtc_lut>(0xa5);

pub fn mode_set_gamma(
    fd: c::c_int,
    crtc: DrmCrtc,
    red: &[u16],
    green: &[u16],
    blue: &[u16],
) -> Result<(), OsError> {
    let mut res = drm_mode_crtc_lut {
        crtc_id: crtc.0,
        gamma_size: red.len() as _,
        red: red.as_ptr() as _,
        green: green.as_ptr() as _,
        blue: blue.as_ptr() as _,
    };
    unsafe {
        ioctl(fd, DRM_IOCTL_MODE_SETGAMMA, &mut res)?;
    }
    Ok(())
}

#[repr(C)]
struct drm_prime_handle {
    handle: u32,
    flags: u32,
    fd: i32,
}

const DRM_IOCTL_PRIME_FD_TO_HANDLE: u64 = drm_iowr::<drm_prime_handle>(0x2e);

pub fn prime_fd_to_handle(fd: c::c_int, prime: c::c_int) -> Result<u32, OsError> {
    let mut res = drm_prime_handle {
        handle: 0,
        flags: 0,
        fd: prime,
    };
    unsafe {
        ioctl(fd, DRM_IOCTL_PRIME_FD_TO_HANDLE, &mut res)?;
    }
    Ok(res.handle)
}

#[repr(C)]
struct drm_gem_close {
    handle: u32,
    pad: u32,
}

const DRM_IOCTL_GEM_CLOSE: u64 = drm_iow::<drm_gem_close>(0x09);

pub fn gem_close(fd: c::c_int, handle: u32) -> Result<(), OsError> {
    let mut res = drm_gem_close { handle, pad: 0 };
    unsafe {
        ioctl(fd, DRM_IOCTL_GEM_CLOSE, &mut res)?;
    }
    Ok(())
}

pub const DRM_VBLANK_ABSOLUTE: u32 = 0x0;
pub const DRM_VBLANK_RELATIVE: u32 = 0x1;
pub const DRM_VBLANK_HIGH_CRTC_SHIFT: u32 = 1;
pub const DRM_VBLANK_HIGH_CRTC_MASK: u32 = 0x0000003e;
pub const DRM_VBLANK_EVENT: u32 = 0x4000000;
pub const DRM_VBLANK_NEXTONMISS: u32 = 0x10000000;
pub const DRM_VBLANK_SECONDARY: u32 = 0x20000000;

// Request and reply share the layout: `signal` overlays `tval_sec`.
#[repr(C)]
struct drm_wait_vblank {
    ty: u32,
    sequence: u32,
    signal_or_sec: c::c_long,
    tval_usec: c::c_long,
}

const DRM_IOCTL_WAIT_VBLANK: u64 = drm_iowr::<drm_wait_vblank>(0x3a);

pub fn wait_vblank(
    fd: c::c_int,
    ty: u32,
    sequence: u32,
    signal: u64,
) -> Result<(u32, i64, i64), OsError> {
    let mut res = drm_wait_vblank {
        ty,
        sequence,
        signal_or_sec: signal as _,
        tval_usec: 0,
    };
    unsafe {
        ioctl(fd, DRM_IOCTL_WAIT_VBLANK, &mut res)?;
    }
    Ok((res.sequence, res.signal_or_sec as i64, res.tval_usec as i64))
}

pub const DRM_CRTC_SEQUENCE_RELATIVE: u32 = 0x00000001;
pub const DRM_CRTC_SEQUENCE_NEXT_ON_MISS: u32 = 0x00000002;

#[repr(C)]
struct drm_crtc_get_sequence {
    crtc_id: u32,
    active: u32,
    sequence: u64,
    sequence_ns: i64,
}

const DRM_IOCTL_CRTC_GET_SEQUENCE: u64 = drm_iowr::<drm_crtc_get_sequence>(0x3b);

pub fn get_sequence(fd: c::c_int, crtc: DrmCrtc) -> Result<(u64, i64), OsError> {
    let mut res = drm_crtc_get_sequence {
        crtc_id: crtc.0,
        active: 0,
        sequence: 0,
        sequence_ns: 0,
    };
    unsafe {
        ioctl(fd, DRM_IOCTL_CRTC_GET_SEQUENCE, &mut res)?;
    }
    Ok((res.sequence, res.sequence_ns))
}

#[repr(C)]
struct drm_crtc_queue_sequence {
    crtc_id: u32,
    flags: u32,
    sequence: u64,
    user_data: u64,
}

const DRM_IOCTL_CRTC_QUEUE_SEQUENCE: u64 = drm_iowr::<drm_crtc_queue_sequence>(0x3c);

pub fn queue_sequence(
    fd: c::c_int,
    crtc: DrmCrtc,
    flags: u32,
    sequence: u64,
    user_data: u64,
) -> Result<u64, OsError> {
    let mut res = drm_crtc_queue_sequence {
        crtc_id: crtc.0,
        flags,
        sequence,
        user_data,
    };
    unsafe {
        ioctl(fd, DRM_IOCTL_CRTC_QUEUE_SEQUENCE, &mut res)?;
    }
    Ok(res.sequence)
}

pub const DRM_EVENT_VBLANK: u32 = 0x01;
pub const DRM_EVENT_FLIP_COMPLETE: u32 = 0x02;
pub const DRM_EVENT_CRTC_SEQUENCE: u32 = 0x03;

#[repr(C)]
#[derive(Copy, Clone)]
pub struct drm_event {
    pub ty: u32,
    pub length: u32,
}

unsafe impl Pod for drm_event {}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct drm_event_vblank {
    pub base: drm_event,
    pub user_data: u64,
    pub tv_sec: u32,
    pub tv_usec: u32,
    pub sequence: u32,
    pub crtc_id: u32,
}

unsafe impl Pod for drm_event_vblank {}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct drm_event_crtc_sequence {
    pub base: drm_event,
    pub user_data: u64,
    pub time_ns: i64,
    pub sequence: u64,
}

unsafe impl Pod for drm_event_crtc_sequence {}

#[repr(C)]
struct drm_version {
    version_major: c::c_int,
    version_minor: c::c_int,
    version_patchlevel: c::c_int,
    name_len: usize,
    name: u64,
    date_len: usize,
    date: u64,
    desc_len: usize,
    desc: u64,
}

const DRM_IOCTL_VERSION: u64 = drm_iowr::<drm_version>(0x00);

pub fn get_version(fd: c::c_int) -> Result<DrmVersion, OsError> {
    let mut res = drm_version {
        version_major: 0,
        version_minor: 0,
        version_patchlevel: 0,
        name_len: 0,
        name: 0,
        date_len: 0,
        date: 0,
        desc_len: 0,
        desc: 0,
    };
    unsafe {
        ioctl(fd, DRM_IOCTL_VERSION, &mut res)?;
    }
    let mut name = vec![0u8; res.name_len];
    let mut date = vec![0u8; res.date_len];
    let mut desc = vec![0u8; res.desc_len];
    res.name = name.as_mut_ptr() as _;
    res.date = date.as_mut_ptr() as _;
    res.desc = desc.as_mut_ptr() as _;
    unsafe {
        ioctl(fd, DRM_IOCTL_VERSION, &mut res)?;
    }
    name.truncate(res.name_len);
    date.truncate(res.date_len);
    desc.truncate(res.desc_len);
    Ok(DrmVersion {
        version_major: res.version_major,
        version_minor: res.version_minor,
        version_patchlevel: res.version_patchlevel,
        name: name.into(),
        date: date.into(),
        desc: desc.into(),
    })
}

pub const FORMAT_BLOB_CURRENT: u32 = 1;

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct drm_format_modifier_blob {
    pub version: u32,
    pub flags: u32,
    pub count_formats: u32,
    pub formats_offset: u32,
    pub count_modifiers: u32,
    pub modifiers_offset: u32,
}

unsafe impl Pod for drm_format_modifier_blob {}

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct drm_format_modifier {
    pub formats: u64,
    pub offset: u32,
    pub pad: u32,
    pub modifier: u64,
}

unsafe impl Pod for drm_format_modifier {}

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct drm_color_lut {
    pub red: u16,
    pub green: u16,
    pub blue: u16,
    pub reserved: u16,
}

unsafe impl Pod for drm_color_lut {}

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct drm_color_ctm {
    pub matrix: [u64; 9],
}

unsafe impl Pod for drm_color_ctm {}

pub fn read(fd: c::c_int, buf: &mut [u8]) -> Result<usize, OsError> {
    loop {
        let res = unsafe { c::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if res >= 0 {
            return Ok(res as usize);
        }
        let err = uapi::get_errno();
        if err != c::EINTR {
            return Err(OsError(err));
        }
    }
}
