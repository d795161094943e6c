//! An in-memory display device for unit tests.

use {
    crate::{
        bo::{Allocator, AllocatorError, GpuBuffer, GpuPlane},
        kernel::KmsKernel,
        utils::oserror::OsError,
        video::{
            INVALID_MODIFIER, LINEAR_MODIFIER, Modifier, XRGB8888, ARGB8888,
            drm::{
                AddFb, AddFb2, Change, CpuMapping, DrmBlob, DrmCardResources, DrmConnector,
                DrmConnectorInfo, DrmCrtc, DrmCrtcInfo, DrmEncoder, DrmEncoderInfo, DrmError,
                DrmEvent, DrmFb, DrmModeInfo, DrmObject, DrmPlane, DrmPlaneInfo, DrmProperty,
                DrmPropertyDefinition, DrmPropertyEnumValue, DrmPropertyType, DrmPropertyValue,
                DumbBuffer, VblankReply, VblankTiming, pod_bytes,
                sys::{
                    self, DRM_MODE_ATOMIC_TEST_ONLY, DRM_MODE_OBJECT_BLOB,
                    DRM_MODE_OBJECT_CONNECTOR, DRM_MODE_OBJECT_CRTC, DRM_MODE_OBJECT_FB,
                    DRM_MODE_OBJECT_PLANE, DRM_MODE_PAGE_FLIP_EVENT, drm_format_modifier,
                    drm_format_modifier_blob, drm_mode_modeinfo,
                },
            },
        },
    },
    ahash::{AHashMap, AHashSet},
    std::{
        cell::{RefCell, RefMut},
        rc::Rc,
    },
    uapi::{OwnedFd, c},
};

pub const FRAME_USEC: u64 = 16_667;

#[derive(Clone)]
struct PropDef {
    name: &'static str,
    immutable: bool,
    ty: DrmPropertyType,
}

struct Object {
    ty: u32,
    props: Vec<(DrmProperty, u64)>,
}

#[derive(Clone)]
pub struct EncoderData {
    pub id: DrmEncoder,
    pub crtc_id: DrmCrtc,
    pub possible_crtcs: u32,
    pub possible_clones: u32,
}

#[derive(Clone)]
pub struct ConnectorData {
    pub id: DrmConnector,
    pub encoders: Vec<DrmEncoder>,
    pub encoder_id: DrmEncoder,
    pub modes: Vec<DrmModeInfo>,
    pub connection: u32,
    pub connector_type: u32,
    pub connector_type_id: u32,
}

#[derive(Clone)]
pub struct PlaneData {
    pub id: DrmPlane,
    pub possible_crtcs: u32,
    pub formats: Vec<u32>,
}

pub struct DumbData {
    pub pitch: u32,
    pub size: u64,
    pub data: Rc<RefCell<Box<[u8]>>>,
}

pub struct FbData {
    pub handle: u32,
    pub width: u32,
    pub height: u32,
    pub modifiers: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum WaitKind {
    Sequence,
    Vblank,
}

struct PendingWait {
    crtc: DrmCrtc,
    target: u64,
    user_data: u64,
    kind: WaitKind,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CursorCall {
    Set2 {
        crtc: DrmCrtc,
        handle: u32,
        width: u32,
        height: u32,
        hot: (i32, i32),
    },
    Set {
        crtc: DrmCrtc,
        handle: u32,
    },
    Move {
        crtc: DrmCrtc,
        x: i32,
        y: i32,
    },
}

#[derive(Clone, Debug)]
pub struct TestLease {
    pub lessee_id: u32,
    pub objects: Vec<u32>,
}

#[derive(Clone, Debug)]
pub struct SetCrtcCall {
    pub crtc: DrmCrtc,
    pub fb: DrmFb,
    pub connectors: Vec<DrmConnector>,
    pub mode: Option<DrmModeInfo>,
}

/// Mutable state of the fake device. Tests poke at the public fields to
/// inject failures.
pub struct State {
    next_id: u32,
    pub caps: AHashMap<u64, u64>,
    pub client_caps: AHashMap<u64, u64>,
    pub atomic_supported: bool,
    pub queue_sequence_supported: bool,
    defs: AHashMap<DrmProperty, PropDef>,
    defs_by_name: AHashMap<(u32, &'static str), DrmProperty>,
    objects: AHashMap<u32, Object>,
    pub crtcs: Vec<DrmCrtc>,
    gamma_sizes: AHashMap<DrmCrtc, u32>,
    legacy_modes: AHashMap<DrmCrtc, DrmModeInfo>,
    pub encoders: Vec<EncoderData>,
    pub connectors: Vec<ConnectorData>,
    pub planes: Vec<PlaneData>,
    pub blobs: AHashMap<DrmBlob, Vec<u8>>,
    pub blobs_created: usize,
    pub dumbs: AHashMap<u32, DumbData>,
    pub dumbs_created: usize,
    pub maps: usize,
    pub fbs: AHashMap<DrmFb, FbData>,
    pub gem: AHashSet<u32>,
    events: Vec<DrmEvent>,
    waits: Vec<PendingWait>,
    flips: Vec<(DrmCrtc, u64)>,
    msc: AHashMap<DrmCrtc, u64>,
    pub busy_injections: u32,
    pub reject_atomic: bool,
    pub reject_page_flip: bool,
    pub reject_modifiers: bool,
    pub fail_properties: AHashSet<u32>,
    pub fail_dumb: bool,
    pub fail_dumb_after: Option<usize>,
    pub cursor2_unsupported: bool,
    pub no_hw_cursor: bool,
    pub set_crtc_log: Vec<SetCrtcCall>,
    pub cursor_log: Vec<CursorCall>,
    pub gamma_log: Vec<(DrmCrtc, Vec<u16>, Vec<u16>, Vec<u16>)>,
    pub atomic_log: Vec<u32>,
    pub flip_log: Vec<(DrmCrtc, DrmFb)>,
    pub leases: Vec<TestLease>,
    pub revoke_log: Vec<u32>,
    /// Dumb buffers destroyed while a framebuffer still referenced them.
    pub violations: usize,
}

pub struct TestKernel {
    state: RefCell<State>,
}

fn err<T>(e: c::c_int) -> Result<T, OsError> {
    Err(OsError(e))
}

impl TestKernel {
    pub fn new() -> Rc<Self> {
        let mut caps = AHashMap::new();
        caps.insert(sys::DRM_CAP_DUMB_BUFFER, 1);
        caps.insert(sys::DRM_CAP_CURSOR_WIDTH, 64);
        caps.insert(sys::DRM_CAP_CURSOR_HEIGHT, 64);
        caps.insert(sys::DRM_CAP_ADDFB2_MODIFIERS, 1);
        caps.insert(sys::DRM_CAP_PRIME, sys::DRM_PRIME_CAP_IMPORT);
        let slf = Rc::new(Self {
            state: RefCell::new(State {
                next_id: 100,
                caps,
                client_caps: Default::default(),
                atomic_supported: true,
                queue_sequence_supported: true,
                defs: Default::default(),
                defs_by_name: Default::default(),
                objects: Default::default(),
                crtcs: vec![],
                gamma_sizes: Default::default(),
                legacy_modes: Default::default(),
                encoders: vec![],
                connectors: vec![],
                planes: vec![],
                blobs: Default::default(),
                blobs_created: 0,
                dumbs: Default::default(),
                dumbs_created: 0,
                maps: 0,
                fbs: Default::default(),
                gem: Default::default(),
                events: vec![],
                waits: vec![],
                flips: vec![],
                msc: Default::default(),
                busy_injections: 0,
                reject_atomic: false,
                reject_page_flip: false,
                reject_modifiers: false,
                fail_properties: Default::default(),
                fail_dumb: false,
                fail_dumb_after: None,
                cursor2_unsupported: false,
                no_hw_cursor: false,
                set_crtc_log: vec![],
                cursor_log: vec![],
                gamma_log: vec![],
                atomic_log: vec![],
                flip_log: vec![],
                leases: vec![],
                revoke_log: vec![],
                violations: 0,
            }),
        });
        slf.define_props();
        slf
    }

    pub fn state(&self) -> RefMut<'_, State> {
        self.state.borrow_mut()
    }

    fn define_props(&self) {
        let range = |max| DrmPropertyType::Range { min: 0, max };
        let enum_ = |names: &[&str], bitmask| DrmPropertyType::Enum {
            values: names
                .iter()
                .enumerate()
                .map(|(idx, name)| DrmPropertyEnumValue {
                    value: match bitmask {
                        true => 1 << idx,
                        false => idx as u64,
                    },
                    name: name.as_bytes().into(),
                })
                .collect(),
            bitmask,
        };
        let obj = |ty| DrmPropertyType::Object { ty };
        let crtc = DRM_MODE_OBJECT_CRTC;
        let conn = DRM_MODE_OBJECT_CONNECTOR;
        let plane = DRM_MODE_OBJECT_PLANE;
        let defs = [
            (crtc, "ACTIVE", false, range(1)),
            (crtc, "MODE_ID", false, DrmPropertyType::Blob),
            (crtc, "GAMMA_LUT", false, DrmPropertyType::Blob),
            (crtc, "GAMMA_LUT_SIZE", true, range(u32::MAX as u64)),
            (crtc, "CTM", false, DrmPropertyType::Blob),
            (crtc, "VRR_ENABLED", false, range(1)),
            (conn, "CRTC_ID", false, obj(crtc)),
            (conn, "DPMS", false, enum_(&["On", "Standby", "Suspend", "Off"], false)),
            (conn, "link-status", false, enum_(&["Good", "Bad"], false)),
            (conn, "vrr_capable", true, range(1)),
            (conn, "EDID", true, DrmPropertyType::Blob),
            (conn, "PATH", true, DrmPropertyType::Blob),
            (conn, "TILE", true, DrmPropertyType::Blob),
            (conn, "non-desktop", true, range(1)),
            (plane, "type", true, enum_(&["Overlay", "Primary", "Cursor"], false)),
            (plane, "FB_ID", false, obj(DRM_MODE_OBJECT_FB)),
            (plane, "CRTC_ID", false, obj(crtc)),
            (plane, "IN_FORMATS", true, DrmPropertyType::Blob),
            (plane, "SRC_X", false, range(u32::MAX as u64)),
            (plane, "SRC_Y", false, range(u32::MAX as u64)),
            (plane, "SRC_W", false, range(u32::MAX as u64)),
            (plane, "SRC_H", false, range(u32::MAX as u64)),
            (
                plane,
                "CRTC_X",
                false,
                DrmPropertyType::SignedRange {
                    min: i32::MIN as i64,
                    max: i32::MAX as i64,
                },
            ),
            (
                plane,
                "CRTC_Y",
                false,
                DrmPropertyType::SignedRange {
                    min: i32::MIN as i64,
                    max: i32::MAX as i64,
                },
            ),
            (plane, "CRTC_W", false, range(i32::MAX as u64)),
            (plane, "CRTC_H", false, range(i32::MAX as u64)),
            (
                plane,
                "rotation",
                false,
                enum_(&["rotate-0", "rotate-90", "rotate-180", "rotate-270"], true),
            ),
        ];
        let s = &mut *self.state();
        for (obj_ty, name, immutable, ty) in defs {
            let id = DrmProperty(s.alloc_id());
            s.defs.insert(
                id,
                PropDef {
                    name,
                    immutable,
                    ty,
                },
            );
            s.defs_by_name.insert((obj_ty, name), id);
        }
    }

    fn add_object(&self, id: u32, ty: u32, props: &[(&'static str, u64)]) {
        let s = &mut *self.state();
        let props = props
            .iter()
            .map(|(name, value)| (s.defs_by_name[&(ty, *name)], *value))
            .collect();
        s.objects.insert(id, Object { ty, props });
    }

    pub fn add_crtc(&self) -> DrmCrtc {
        let id = DrmCrtc(self.state().alloc_id());
        self.add_object(
            id.0,
            DRM_MODE_OBJECT_CRTC,
            &[
                ("ACTIVE", 0),
                ("MODE_ID", 0),
                ("GAMMA_LUT", 0),
                ("GAMMA_LUT_SIZE", 256),
                ("CTM", 0),
                ("VRR_ENABLED", 0),
            ],
        );
        let s = &mut *self.state();
        s.crtcs.push(id);
        s.gamma_sizes.insert(id, 256);
        s.msc.insert(id, 0);
        id
    }

    /// Adds a crtc that exposes no properties at all, like a pre-atomic
    /// driver.
    pub fn add_bare_crtc(&self) -> DrmCrtc {
        let id = DrmCrtc(self.state().alloc_id());
        self.add_object(id.0, DRM_MODE_OBJECT_CRTC, &[]);
        let s = &mut *self.state();
        s.crtcs.push(id);
        s.gamma_sizes.insert(id, 256);
        s.msc.insert(id, 0);
        id
    }

    pub fn add_plane(&self, possible_crtcs: u32, ty: u64) -> DrmPlane {
        self.add_plane_with_formats(
            possible_crtcs,
            ty,
            &[
                (XRGB8888, &[LINEAR_MODIFIER, 0x0100_0000_0000_0001][..]),
                (ARGB8888, &[LINEAR_MODIFIER][..]),
            ],
        )
    }

    pub fn add_plane_with_formats(
        &self,
        possible_crtcs: u32,
        ty: u64,
        formats: &[(u32, &[Modifier])],
    ) -> DrmPlane {
        let id = DrmPlane(self.state().alloc_id());
        let blob = self.create_blob_raw(in_formats_blob(formats));
        self.add_object(
            id.0,
            DRM_MODE_OBJECT_PLANE,
            &[
                ("type", ty),
                ("FB_ID", 0),
                ("CRTC_ID", 0),
                ("IN_FORMATS", blob.0 as u64),
                ("SRC_X", 0),
                ("SRC_Y", 0),
                ("SRC_W", 0),
                ("SRC_H", 0),
                ("CRTC_X", 0),
                ("CRTC_Y", 0),
                ("CRTC_W", 0),
                ("CRTC_H", 0),
                ("rotation", 1),
            ],
        );
        self.state().planes.push(PlaneData {
            id,
            possible_crtcs,
            formats: formats.iter().map(|f| f.0).collect(),
        });
        id
    }

    pub fn add_encoder(&self, possible_crtcs: u32, possible_clones: u32) -> DrmEncoder {
        let s = &mut *self.state();
        let id = DrmEncoder(s.alloc_id());
        s.encoders.push(EncoderData {
            id,
            crtc_id: DrmCrtc::NONE,
            possible_crtcs,
            possible_clones,
        });
        id
    }

    pub fn add_connector(
        &self,
        connector_type: u32,
        connector_type_id: u32,
        encoders: &[DrmEncoder],
        modes: Vec<DrmModeInfo>,
    ) -> DrmConnector {
        let id = DrmConnector(self.state().alloc_id());
        self.add_object(
            id.0,
            DRM_MODE_OBJECT_CONNECTOR,
            &[
                ("CRTC_ID", 0),
                ("DPMS", 0),
                ("link-status", 0),
                ("vrr_capable", 0),
                ("EDID", 0),
                ("PATH", 0),
                ("TILE", 0),
                ("non-desktop", 0),
            ],
        );
        self.state().connectors.push(ConnectorData {
            id,
            encoders: encoders.to_vec(),
            encoder_id: DrmEncoder::NONE,
            modes,
            connection: sys::CONNECTOR_STATUS_CONNECTED,
            connector_type,
            connector_type_id,
        });
        id
    }

    pub fn remove_connector(&self, id: DrmConnector) {
        let s = &mut *self.state();
        s.connectors.retain(|c| c.id != id);
        s.objects.remove(&id.0);
    }

    pub fn set_connection(&self, id: DrmConnector, connection: u32) {
        for c in &mut self.state().connectors {
            if c.id == id {
                c.connection = connection;
            }
        }
    }

    /// Records that the firmware left `connector` driven by `crtc`.
    pub fn bind_encoder(&self, connector: DrmConnector, encoder: DrmEncoder, crtc: DrmCrtc) {
        {
            let s = &mut *self.state();
            for c in &mut s.connectors {
                if c.id == connector {
                    c.encoder_id = encoder;
                }
            }
            for e in &mut s.encoders {
                if e.id == encoder {
                    e.crtc_id = crtc;
                }
            }
        }
        self.set_prop(connector.0, "CRTC_ID", crtc.0 as u64);
    }

    fn create_blob_raw(&self, data: Vec<u8>) -> DrmBlob {
        let s = &mut *self.state();
        let id = DrmBlob(s.alloc_id());
        s.blobs.insert(id, data);
        id
    }

    pub fn set_blob_prop(&self, obj: u32, name: &str, data: Vec<u8>) {
        let blob = self.create_blob_raw(data);
        self.set_prop(obj, name, blob.0 as u64);
    }

    pub fn set_prop(&self, obj: u32, name: &str, value: u64) {
        let s = &mut *self.state();
        let Some(o) = s.objects.get_mut(&obj) else {
            panic!("unknown object {}", obj);
        };
        for (id, v) in &mut o.props {
            if s.defs[id].name == name {
                *v = value;
                return;
            }
        }
        panic!("object {} has no property {}", obj, name);
    }

    pub fn prop_value(&self, obj: u32, name: &str) -> Option<u64> {
        let s = self.state.borrow();
        let o = s.objects.get(&obj)?;
        o.props
            .iter()
            .find(|(id, _)| s.defs[id].name == name)
            .map(|(_, v)| *v)
    }

    pub fn set_msc(&self, crtc: DrmCrtc, msc: u64) {
        self.state().msc.insert(crtc, msc);
    }

    pub fn msc(&self, crtc: DrmCrtc) -> u64 {
        self.state.borrow().msc.get(&crtc).copied().unwrap_or(0)
    }

    pub fn pending_waits(&self) -> usize {
        self.state.borrow().waits.len()
    }

    pub fn pending_flips(&self) -> usize {
        self.state.borrow().flips.len()
    }

    pub fn blob_count(&self) -> usize {
        self.state.borrow().blobs.len()
    }

    pub fn blob_data(&self, blob: DrmBlob) -> Option<Vec<u8>> {
        self.state.borrow().blobs.get(&blob).cloned()
    }

    /// Drops a lease as if its lessee had closed its file descriptor.
    pub fn end_lease(&self, lessee_id: u32) {
        self.state().leases.retain(|l| l.lessee_id != lessee_id);
    }

    pub fn leased_objects(&self, lessee_id: u32) -> Option<Vec<u32>> {
        let s = self.state.borrow();
        let lease = s.leases.iter().find(|l| l.lessee_id == lessee_id)?;
        Some(lease.objects.clone())
    }

    pub fn dumb_count(&self) -> usize {
        self.state.borrow().dumbs.len()
    }

    pub fn fb_count(&self) -> usize {
        self.state.borrow().fbs.len()
    }

    pub fn dumb_contents(&self, handle: u32) -> Option<Vec<u8>> {
        let s = self.state.borrow();
        s.dumbs.get(&handle).map(|d| d.data.borrow().to_vec())
    }

    /// Advances the frame counter of `crtc` and completes every wait and
    /// flip that became due.
    pub fn fire_vblank(&self, crtc: DrmCrtc) {
        let s = &mut *self.state();
        let msc = {
            let msc = s.msc.entry(crtc).or_insert(0);
            *msc += 1;
            *msc
        };
        s.complete_waits(crtc, msc);
        let usec = msc * FRAME_USEC;
        let mut flips = vec![];
        s.flips.retain(|&(c, user_data)| {
            if c == crtc {
                flips.push(user_data);
                false
            } else {
                true
            }
        });
        for user_data in flips {
            s.events.push(DrmEvent::FlipComplete(VblankTiming {
                user_data,
                tv_sec: (usec / 1_000_000) as u32,
                tv_usec: (usec % 1_000_000) as u32,
                sequence: msc as u32,
                crtc_id: crtc,
            }));
        }
    }
}

impl State {
    fn alloc_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn take_busy(&mut self) -> bool {
        if self.busy_injections > 0 {
            self.busy_injections -= 1;
            return true;
        }
        false
    }

    fn complete_waits(&mut self, crtc: DrmCrtc, msc: u64) {
        let usec = msc * FRAME_USEC;
        let mut due = vec![];
        self.waits.retain(|w| {
            if w.crtc == crtc && w.target <= msc {
                due.push((w.user_data, w.kind));
                false
            } else {
                true
            }
        });
        for (user_data, kind) in due {
            let event = match kind {
                WaitKind::Sequence => DrmEvent::Sequence {
                    user_data,
                    time_ns: (usec * 1000) as i64,
                    sequence: msc,
                },
                WaitKind::Vblank => DrmEvent::Vblank(VblankTiming {
                    user_data,
                    tv_sec: (usec / 1_000_000) as u32,
                    tv_usec: (usec % 1_000_000) as u32,
                    sequence: msc as u32,
                    crtc_id: crtc,
                }),
            };
            self.events.push(event);
        }
    }

    fn crtc_active(&self, crtc: DrmCrtc) -> bool {
        if self.legacy_modes.contains_key(&crtc) {
            return true;
        }
        self.value(crtc.0, "ACTIVE") == Some(1)
    }

    fn value(&self, obj: u32, name: &str) -> Option<u64> {
        let o = self.objects.get(&obj)?;
        o.props
            .iter()
            .find(|(id, _)| self.defs[id].name == name)
            .map(|(_, v)| *v)
    }

    fn set_value(&mut self, obj: u32, name: &str, value: u64) {
        let Some(o) = self.objects.get_mut(&obj) else {
            return;
        };
        for (id, v) in &mut o.props {
            if self.defs[id].name == name {
                *v = value;
            }
        }
    }

    fn object_exists(&self, ty: u32, id: u64) -> bool {
        if id > u32::MAX as u64 {
            return false;
        }
        let id = id as u32;
        match ty {
            DRM_MODE_OBJECT_FB => self.fbs.contains_key(&DrmFb(id)),
            DRM_MODE_OBJECT_BLOB => self.blobs.contains_key(&DrmBlob(id)),
            _ => self.objects.get(&id).map(|o| o.ty) == Some(ty),
        }
    }

    fn validate(&self, obj: u32, prop: DrmProperty, value: u64) -> Result<(), OsError> {
        let Some(o) = self.objects.get(&obj) else {
            return err(c::ENOENT);
        };
        if !o.props.iter().any(|(id, _)| *id == prop) {
            return err(c::EINVAL);
        }
        let def = &self.defs[&prop];
        if def.immutable {
            return err(c::EINVAL);
        }
        let valid = match &def.ty {
            DrmPropertyType::Range { min, max } => value >= *min && value <= *max,
            DrmPropertyType::SignedRange { min, max } => {
                let v = value as i64;
                v >= *min && v <= *max
            }
            DrmPropertyType::Object { ty } => value == 0 || self.object_exists(*ty, value),
            DrmPropertyType::Blob => value == 0 || self.object_exists(DRM_MODE_OBJECT_BLOB, value),
            DrmPropertyType::Enum { values, bitmask } => match bitmask {
                true => {
                    let all = values.iter().fold(0, |acc, v| acc | v.value);
                    value & !all == 0
                }
                false => values.iter().any(|v| v.value == value),
            },
        };
        if !valid {
            return err(c::EINVAL);
        }
        Ok(())
    }
}

struct TestMapping {
    data: Rc<RefCell<Box<[u8]>>>,
}

impl CpuMapping for TestMapping {
    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { &mut **self.data.as_ptr() }
    }
}

impl KmsKernel for TestKernel {
    fn fd(&self) -> c::c_int {
        -1
    }

    fn get_cap(&self, cap: u64) -> Result<u64, OsError> {
        match self.state.borrow().caps.get(&cap) {
            Some(v) => Ok(*v),
            None => err(c::EINVAL),
        }
    }

    fn set_client_cap(&self, cap: u64, value: u64) -> Result<(), OsError> {
        let s = &mut *self.state();
        if cap == sys::DRM_CLIENT_CAP_ATOMIC && !s.atomic_supported {
            return err(c::EOPNOTSUPP);
        }
        s.client_caps.insert(cap, value);
        Ok(())
    }

    fn get_resources(&self) -> Result<DrmCardResources, DrmError> {
        let s = self.state.borrow();
        Ok(DrmCardResources {
            min_width: 0,
            max_width: 16384,
            min_height: 0,
            max_height: 16384,
            crtcs: s.crtcs.clone(),
            connectors: s.connectors.iter().map(|c| c.id).collect(),
            encoders: s.encoders.iter().map(|e| e.id).collect(),
        })
    }

    fn get_planes(&self) -> Result<Vec<DrmPlane>, DrmError> {
        Ok(self.state.borrow().planes.iter().map(|p| p.id).collect())
    }

    fn get_plane_info(&self, plane: DrmPlane) -> Result<DrmPlaneInfo, DrmError> {
        let s = self.state.borrow();
        let Some(p) = s.planes.iter().find(|p| p.id == plane) else {
            return Err(DrmError::GetPlane(OsError(c::ENOENT)));
        };
        Ok(DrmPlaneInfo {
            id: plane,
            crtc_id: DrmCrtc(s.value(plane.0, "CRTC_ID").unwrap_or(0) as u32),
            fb_id: DrmFb(s.value(plane.0, "FB_ID").unwrap_or(0) as u32),
            possible_crtcs: p.possible_crtcs,
            format_types: p.formats.clone(),
        })
    }

    fn get_crtc_info(&self, crtc: DrmCrtc) -> Result<DrmCrtcInfo, DrmError> {
        let s = self.state.borrow();
        if !s.crtcs.contains(&crtc) {
            return Err(DrmError::GetCrtc(OsError(c::ENOENT)));
        }
        let mut mode = s.legacy_modes.get(&crtc).cloned();
        if mode.is_none() && s.value(crtc.0, "ACTIVE") == Some(1) {
            let blob = DrmBlob(s.value(crtc.0, "MODE_ID").unwrap_or(0) as u32);
            if let Some(data) = s.blobs.get(&blob) {
                let raw: Result<drm_mode_modeinfo, _> = uapi::pod_read_init(&data[..]);
                if let Ok(raw) = raw {
                    mode = Some(raw.into());
                }
            }
        }
        Ok(DrmCrtcInfo {
            id: crtc,
            fb_id: DrmFb::NONE,
            x: 0,
            y: 0,
            gamma_size: s.gamma_sizes.get(&crtc).copied().unwrap_or(0),
            mode,
        })
    }

    fn get_encoder_info(&self, encoder: DrmEncoder) -> Result<DrmEncoderInfo, DrmError> {
        let s = self.state.borrow();
        match s.encoders.iter().find(|e| e.id == encoder) {
            Some(e) => Ok(DrmEncoderInfo {
                id: e.id,
                crtc_id: e.crtc_id,
                possible_crtcs: e.possible_crtcs,
                possible_clones: e.possible_clones,
            }),
            None => Err(DrmError::GetEncoder(OsError(c::ENOENT))),
        }
    }

    fn get_connector_info(
        &self,
        connector: DrmConnector,
        _force: bool,
    ) -> Result<DrmConnectorInfo, DrmError> {
        let s = self.state.borrow();
        match s.connectors.iter().find(|c| c.id == connector) {
            Some(c) => Ok(DrmConnectorInfo {
                id: c.id,
                encoders: c.encoders.clone(),
                modes: c.modes.clone(),
                encoder_id: c.encoder_id,
                connector_type: c.connector_type,
                connector_type_id: c.connector_type_id,
                connection: c.connection,
                mm_width: 600,
                mm_height: 340,
            }),
            None => Err(DrmError::GetConnector(OsError(c::ENOENT))),
        }
    }

    fn get_property(&self, prop: DrmProperty) -> Result<DrmPropertyDefinition, DrmError> {
        let s = self.state.borrow();
        match s.defs.get(&prop) {
            Some(def) => Ok(DrmPropertyDefinition {
                id: prop,
                name: def.name.as_bytes().into(),
                immutable: def.immutable,
                atomic: false,
                ty: def.ty.clone(),
            }),
            None => Err(DrmError::GetProperty(OsError(c::ENOENT))),
        }
    }

    fn get_properties(&self, obj: u32, ty: u32) -> Result<Vec<DrmPropertyValue>, DrmError> {
        let s = self.state.borrow();
        if s.fail_properties.contains(&obj) {
            return Err(DrmError::GetProperties(OsError(c::EINVAL)));
        }
        match s.objects.get(&obj) {
            Some(o) if o.ty == ty => Ok(o
                .props
                .iter()
                .map(|(id, value)| DrmPropertyValue {
                    id: *id,
                    value: *value,
                })
                .collect()),
            _ => Err(DrmError::GetProperties(OsError(c::ENOENT))),
        }
    }

    fn get_blob(&self, blob: DrmBlob) -> Result<Vec<u8>, DrmError> {
        match self.state.borrow().blobs.get(&blob) {
            Some(d) => Ok(d.clone()),
            None => Err(DrmError::GetPropBlob(OsError(c::ENOENT))),
        }
    }

    fn create_blob(&self, data: &[u8]) -> Result<DrmBlob, DrmError> {
        if data.is_empty() {
            return Err(DrmError::CreateBlob(OsError(c::EINVAL)));
        }
        self.state().blobs_created += 1;
        Ok(self.create_blob_raw(data.to_vec()))
    }

    fn destroy_blob(&self, blob: DrmBlob) -> Result<(), DrmError> {
        match self.state().blobs.remove(&blob) {
            Some(_) => Ok(()),
            None => Err(DrmError::DestroyBlob(OsError(c::ENOENT))),
        }
    }

    fn create_lease(&self, objects: &[u32]) -> Result<(OwnedFd, u32), OsError> {
        let s = &mut *self.state();
        if objects.is_empty() {
            return err(c::EINVAL);
        }
        for id in objects {
            if !s.objects.contains_key(id) {
                return err(c::ENOENT);
            }
            if s.leases.iter().any(|l| l.objects.contains(id)) {
                return err(c::EBUSY);
            }
        }
        let (lessee_fd, _) = uapi::pipe2(c::O_CLOEXEC)?;
        let lessee_id = s.alloc_id();
        s.leases.push(TestLease {
            lessee_id,
            objects: objects.to_vec(),
        });
        Ok((lessee_fd, lessee_id))
    }

    fn list_lessees(&self) -> Result<Vec<u32>, OsError> {
        Ok(self.state.borrow().leases.iter().map(|l| l.lessee_id).collect())
    }

    fn revoke_lease(&self, lessee_id: u32) -> Result<(), OsError> {
        let s = &mut *self.state();
        s.revoke_log.push(lessee_id);
        match s.leases.iter().position(|l| l.lessee_id == lessee_id) {
            Some(idx) => {
                s.leases.remove(idx);
                Ok(())
            }
            None => err(c::ENOENT),
        }
    }

    fn atomic(&self, flags: u32, change: &Change, user_data: u64) -> Result<(), OsError> {
        let s = &mut *self.state();
        if s.client_caps.get(&sys::DRM_CLIENT_CAP_ATOMIC) != Some(&1) {
            return err(c::EINVAL);
        }
        s.atomic_log.push(flags);
        if s.reject_atomic {
            return err(c::EINVAL);
        }
        for (obj, prop, value) in change.writes() {
            s.validate(obj, prop, value)?;
        }
        if flags & DRM_MODE_ATOMIC_TEST_ONLY != 0 {
            return Ok(());
        }
        let mut crtcs = vec![];
        for (obj, prop, value) in change.writes() {
            if let Some(o) = s.objects.get_mut(&obj) {
                for (id, v) in &mut o.props {
                    if *id == prop {
                        *v = value;
                    }
                }
                if o.ty == DRM_MODE_OBJECT_CRTC && !crtcs.contains(&DrmCrtc(obj)) {
                    crtcs.push(DrmCrtc(obj));
                }
            }
        }
        for (obj, _, _) in change.writes() {
            if s.objects.get(&obj).map(|o| o.ty) == Some(DRM_MODE_OBJECT_PLANE) {
                let crtc = DrmCrtc(s.value(obj, "CRTC_ID").unwrap_or(0) as u32);
                if crtc.is_some() && !crtcs.contains(&crtc) {
                    crtcs.push(crtc);
                }
            }
        }
        if flags & DRM_MODE_PAGE_FLIP_EVENT != 0 {
            for crtc in crtcs {
                s.flips.push((crtc, user_data));
            }
        }
        Ok(())
    }

    fn set_crtc(
        &self,
        crtc: DrmCrtc,
        fb: DrmFb,
        _x: u32,
        _y: u32,
        connectors: &[DrmConnector],
        mode: Option<&DrmModeInfo>,
    ) -> Result<(), OsError> {
        let s = &mut *self.state();
        if !s.crtcs.contains(&crtc) {
            return err(c::ENOENT);
        }
        if fb.is_some() && !s.fbs.contains_key(&fb) {
            return err(c::EINVAL);
        }
        for c in connectors {
            if !s.connectors.iter().any(|d| d.id == *c) {
                return err(c::ENOENT);
            }
        }
        s.set_crtc_log.push(SetCrtcCall {
            crtc,
            fb,
            connectors: connectors.to_vec(),
            mode: mode.cloned(),
        });
        match mode {
            Some(m) => {
                s.legacy_modes.insert(crtc, m.clone());
            }
            None => {
                s.legacy_modes.remove(&crtc);
            }
        }
        for c in connectors {
            s.set_value(c.0, "CRTC_ID", crtc.0 as u64);
        }
        Ok(())
    }

    fn set_property(
        &self,
        obj: u32,
        ty: u32,
        prop: DrmProperty,
        value: u64,
    ) -> Result<(), OsError> {
        let s = &mut *self.state();
        if s.objects.get(&obj).map(|o| o.ty) != Some(ty) {
            return err(c::ENOENT);
        }
        s.validate(obj, prop, value)?;
        if let Some(o) = s.objects.get_mut(&obj) {
            for (id, v) in &mut o.props {
                if *id == prop {
                    *v = value;
                }
            }
        }
        Ok(())
    }

    fn page_flip(
        &self,
        crtc: DrmCrtc,
        fb: DrmFb,
        _flags: u32,
        user_data: u64,
    ) -> Result<(), OsError> {
        let s = &mut *self.state();
        if s.reject_page_flip {
            return err(c::EINVAL);
        }
        if !s.crtcs.contains(&crtc) {
            return err(c::ENOENT);
        }
        if !s.fbs.contains_key(&fb) || !s.crtc_active(crtc) {
            return err(c::EINVAL);
        }
        if s.flips.iter().any(|(c, _)| *c == crtc) {
            return err(c::EBUSY);
        }
        s.flips.push((crtc, user_data));
        s.flip_log.push((crtc, fb));
        Ok(())
    }

    fn create_dumb(&self, width: u32, height: u32, bpp: u32) -> Result<DumbBuffer, OsError> {
        let s = &mut *self.state();
        if s.fail_dumb {
            return err(c::ENOMEM);
        }
        if let Some(n) = s.fail_dumb_after {
            if s.dumbs_created >= n {
                return err(c::ENOMEM);
            }
        }
        if width == 0 || height == 0 {
            return err(c::EINVAL);
        }
        let pitch = (width * bpp.div_ceil(8)).next_multiple_of(64);
        let size = pitch as u64 * height as u64;
        let handle = s.alloc_id();
        s.dumbs_created += 1;
        s.dumbs.insert(
            handle,
            DumbData {
                pitch,
                size,
                data: Rc::new(RefCell::new(vec![0; size as usize].into_boxed_slice())),
            },
        );
        Ok(DumbBuffer {
            handle,
            pitch,
            size,
        })
    }

    fn map_dumb(&self, dumb: &DumbBuffer) -> Result<Box<dyn CpuMapping>, OsError> {
        let s = &mut *self.state();
        let Some(d) = s.dumbs.get(&dumb.handle) else {
            return err(c::EINVAL);
        };
        let data = d.data.clone();
        s.maps += 1;
        Ok(Box::new(TestMapping { data }))
    }

    fn destroy_dumb(&self, handle: u32) -> Result<(), OsError> {
        let s = &mut *self.state();
        if s.fbs.values().any(|f| f.handle == handle) {
            s.violations += 1;
        }
        match s.dumbs.remove(&handle) {
            Some(_) => Ok(()),
            None => err(c::EINVAL),
        }
    }

    fn add_fb(&self, req: &AddFb) -> Result<DrmFb, OsError> {
        let s = &mut *self.state();
        if !s.dumbs.contains_key(&req.handle) && !s.gem.contains(&req.handle) {
            return err(c::ENOENT);
        }
        let id = DrmFb(s.alloc_id());
        s.fbs.insert(
            id,
            FbData {
                handle: req.handle,
                width: req.width,
                height: req.height,
                modifiers: false,
            },
        );
        Ok(id)
    }

    fn add_fb2(&self, req: &AddFb2) -> Result<DrmFb, OsError> {
        let s = &mut *self.state();
        let modifiers = req.flags & sys::DRM_MODE_FB_MODIFIERS != 0;
        if modifiers && s.reject_modifiers {
            return err(c::EINVAL);
        }
        let handle = req.handles[0];
        if !s.dumbs.contains_key(&handle) && !s.gem.contains(&handle) {
            return err(c::ENOENT);
        }
        let id = DrmFb(s.alloc_id());
        s.fbs.insert(
            id,
            FbData {
                handle,
                width: req.width,
                height: req.height,
                modifiers,
            },
        );
        Ok(id)
    }

    fn rm_fb(&self, fb: DrmFb) -> Result<(), OsError> {
        match self.state().fbs.remove(&fb) {
            Some(_) => Ok(()),
            None => err(c::ENOENT),
        }
    }

    fn prime_fd_to_handle(&self, fd: c::c_int) -> Result<u32, OsError> {
        if fd < 0 {
            return err(c::EBADF);
        }
        let s = &mut *self.state();
        let handle = s.alloc_id();
        s.gem.insert(handle);
        Ok(handle)
    }

    fn gem_close(&self, handle: u32) -> Result<(), OsError> {
        match self.state().gem.remove(&handle) {
            true => Ok(()),
            false => err(c::EINVAL),
        }
    }

    fn set_cursor2(
        &self,
        crtc: DrmCrtc,
        handle: u32,
        width: u32,
        height: u32,
        hot_x: i32,
        hot_y: i32,
    ) -> Result<(), OsError> {
        let s = &mut *self.state();
        if s.no_hw_cursor {
            return err(c::ENXIO);
        }
        if s.cursor2_unsupported {
            return err(c::EINVAL);
        }
        s.cursor_log.push(CursorCall::Set2 {
            crtc,
            handle,
            width,
            height,
            hot: (hot_x, hot_y),
        });
        Ok(())
    }

    fn set_cursor(
        &self,
        crtc: DrmCrtc,
        handle: u32,
        _width: u32,
        _height: u32,
    ) -> Result<(), OsError> {
        let s = &mut *self.state();
        if s.no_hw_cursor {
            return err(c::ENXIO);
        }
        s.cursor_log.push(CursorCall::Set { crtc, handle });
        Ok(())
    }

    fn move_cursor(&self, crtc: DrmCrtc, x: i32, y: i32) -> Result<(), OsError> {
        let s = &mut *self.state();
        if s.no_hw_cursor {
            return err(c::ENXIO);
        }
        s.cursor_log.push(CursorCall::Move { crtc, x, y });
        Ok(())
    }

    fn set_gamma(
        &self,
        crtc: DrmCrtc,
        red: &[u16],
        green: &[u16],
        blue: &[u16],
    ) -> Result<(), OsError> {
        let s = &mut *self.state();
        let Some(size) = s.gamma_sizes.get(&crtc).copied() else {
            return err(c::ENOENT);
        };
        if red.len() != size as usize || green.len() != red.len() || blue.len() != red.len() {
            return err(c::EINVAL);
        }
        s.gamma_log
            .push((crtc, red.to_vec(), green.to_vec(), blue.to_vec()));
        Ok(())
    }

    fn queue_sequence(
        &self,
        crtc: DrmCrtc,
        flags: u32,
        sequence: u64,
        user_data: u64,
    ) -> Result<u64, OsError> {
        let s = &mut *self.state();
        if !s.queue_sequence_supported {
            return err(c::ENOTTY);
        }
        if s.take_busy() {
            return err(c::EBUSY);
        }
        let Some(msc) = s.msc.get(&crtc).copied() else {
            return err(c::ENOENT);
        };
        let target = match flags & sys::DRM_CRTC_SEQUENCE_RELATIVE != 0 {
            true => msc + sequence,
            false => sequence,
        };
        s.waits.push(PendingWait {
            crtc,
            target,
            user_data,
            kind: WaitKind::Sequence,
        });
        if target <= msc {
            s.complete_waits(crtc, msc);
        }
        Ok(target)
    }

    fn get_sequence(&self, crtc: DrmCrtc) -> Result<(u64, i64), OsError> {
        let s = self.state.borrow();
        if !s.queue_sequence_supported {
            return err(c::ENOTTY);
        }
        match s.msc.get(&crtc) {
            Some(msc) => Ok((*msc, (*msc * FRAME_USEC * 1000) as i64)),
            None => err(c::ENOENT),
        }
    }

    fn wait_vblank(&self, ty: u32, sequence: u32, user_data: u64) -> Result<VblankReply, OsError> {
        let s = &mut *self.state();
        if s.take_busy() {
            return err(c::EBUSY);
        }
        let pipe = if ty & sys::DRM_VBLANK_SECONDARY != 0 {
            1
        } else {
            ((ty & sys::DRM_VBLANK_HIGH_CRTC_MASK) >> sys::DRM_VBLANK_HIGH_CRTC_SHIFT) as usize
        };
        let Some(crtc) = s.crtcs.get(pipe).copied() else {
            return err(c::EINVAL);
        };
        let msc = s.msc.get(&crtc).copied().unwrap_or(0);
        let target32 = match ty & sys::DRM_VBLANK_RELATIVE != 0 {
            true => (msc as u32).wrapping_add(sequence),
            false => sequence,
        };
        if ty & sys::DRM_VBLANK_EVENT == 0 {
            return Ok(VblankReply {
                sequence: msc as u32,
                usec: msc * FRAME_USEC,
            });
        }
        let delta = target32.wrapping_sub(msc as u32) as i32 as i64;
        let target = (msc as i64 + delta).max(0) as u64;
        s.waits.push(PendingWait {
            crtc,
            target,
            user_data,
            kind: WaitKind::Vblank,
        });
        if target <= msc {
            s.complete_waits(crtc, msc);
        }
        Ok(VblankReply {
            sequence: target32,
            usec: msc * FRAME_USEC,
        })
    }

    fn read_events(&self, events: &mut Vec<DrmEvent>) -> Result<(), DrmError> {
        events.append(&mut self.state().events);
        Ok(())
    }
}

/// Builds an `IN_FORMATS` blob.
pub fn in_formats_blob(formats: &[(u32, &[Modifier])]) -> Vec<u8> {
    let mut modifiers: Vec<Modifier> = vec![];
    for (_, mods) in formats {
        for m in mods.iter() {
            if !modifiers.contains(m) {
                modifiers.push(*m);
            }
        }
    }
    let header_len = size_of::<drm_format_modifier_blob>();
    let formats_len = formats.len() * size_of::<u32>();
    let header = drm_format_modifier_blob {
        version: sys::FORMAT_BLOB_CURRENT,
        flags: 0,
        count_formats: formats.len() as u32,
        formats_offset: header_len as u32,
        count_modifiers: modifiers.len() as u32,
        modifiers_offset: (header_len + formats_len).next_multiple_of(8) as u32,
    };
    let mut blob = pod_bytes(&[header]).to_vec();
    for (format, _) in formats {
        blob.extend_from_slice(&format.to_ne_bytes());
    }
    blob.resize(header.modifiers_offset as usize, 0);
    for m in &modifiers {
        let mut mask = 0u64;
        for (idx, (_, mods)) in formats.iter().enumerate() {
            if mods.contains(m) {
                mask |= 1 << idx;
            }
        }
        let entry = drm_format_modifier {
            formats: mask,
            offset: 0,
            pad: 0,
            modifier: *m,
        };
        blob.extend_from_slice(pod_bytes(&[entry]));
    }
    blob
}

/// A plausible CVT-like timing.
pub fn mode(width: u16, height: u16, refresh: u32) -> DrmModeInfo {
    let htotal = width + 280;
    let vtotal = height + 45;
    DrmModeInfo {
        clock: (htotal as u32 * vtotal as u32 * refresh) / 1000,
        hdisplay: width,
        hsync_start: width + 88,
        hsync_end: width + 132,
        htotal,
        hskew: 0,
        vdisplay: height,
        vsync_start: height + 4,
        vsync_end: height + 9,
        vtotal,
        vscan: 0,
        vrefresh: refresh,
        flags: 0,
        ty: 0,
        name: format!("{}x{}", width, height).into(),
    }
}

pub fn preferred(width: u16, height: u16, refresh: u32) -> DrmModeInfo {
    let mut m = mode(width, height, refresh);
    m.ty |= sys::DRM_MODE_TYPE_PREFERRED;
    m
}

pub struct Head {
    pub crtc: DrmCrtc,
    pub plane: DrmPlane,
    pub encoder: DrmEncoder,
    pub connector: DrmConnector,
}

/// One crtc, one primary plane and one connected HDMI connector.
pub fn single_head() -> (Rc<TestKernel>, Head) {
    let kernel = TestKernel::new();
    let head = add_head(&kernel, 1);
    (kernel, head)
}

/// Adds a crtc with its own primary plane, encoder and connector.
pub fn add_head(kernel: &TestKernel, type_id: u32) -> Head {
    let crtc = kernel.add_crtc();
    let idx = kernel.state().crtcs.len() - 1;
    let plane = kernel.add_plane(1 << idx, crate::props::PLANE_TYPE_PRIMARY);
    let encoder = kernel.add_encoder(1 << idx, 0);
    let connector = kernel.add_connector(
        sys::DRM_MODE_CONNECTOR_HDMIA,
        type_id,
        &[encoder],
        vec![preferred(1920, 1080, 60), mode(1280, 720, 60)],
    );
    Head {
        crtc,
        plane,
        encoder,
        connector,
    }
}

pub struct TestGpuBuffer {
    width: u32,
    height: u32,
    format: u32,
    modifier: Modifier,
    planes: Vec<GpuPlane>,
    data: Rc<RefCell<Box<[u8]>>>,
}

impl GpuBuffer for TestGpuBuffer {
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
        Ok(Box::new(TestMapping {
            data: self.data.clone(),
        }))
    }
}

/// A GPU allocator whose handles are valid in a [`TestKernel`].
pub struct TestAllocator {
    pub kernel: Rc<TestKernel>,
    pub reject_modifiers: RefCell<bool>,
    pub two_plane_modifiers: RefCell<Vec<Modifier>>,
    pub requests: RefCell<Vec<Vec<Modifier>>>,
}

impl TestAllocator {
    pub fn new(kernel: &Rc<TestKernel>) -> Rc<Self> {
        Rc::new(Self {
            kernel: kernel.clone(),
            reject_modifiers: RefCell::new(false),
            two_plane_modifiers: Default::default(),
            requests: Default::default(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("allocation refused")]
struct Refused;

impl Allocator for TestAllocator {
    fn create_bo(
        &self,
        width: u32,
        height: u32,
        format: u32,
        modifiers: &[Modifier],
        _usage: u32,
    ) -> Result<Rc<dyn GpuBuffer>, AllocatorError> {
        self.requests.borrow_mut().push(modifiers.to_vec());
        let modifier = match modifiers.first() {
            Some(m) => *m,
            None => return Err(AllocatorError(Box::new(Refused))),
        };
        if modifier != INVALID_MODIFIER && *self.reject_modifiers.borrow() {
            return Err(AllocatorError(Box::new(Refused)));
        }
        let pitch = (width * 4).next_multiple_of(64);
        let handle = {
            let s = &mut *self.kernel.state();
            let handle = s.alloc_id();
            s.gem.insert(handle);
            handle
        };
        Ok(Rc::new(TestGpuBuffer {
            width,
            height,
            format,
            modifier,
            planes: vec![GpuPlane {
                handle,
                pitch,
                offset: 0,
            }],
            data: Rc::new(RefCell::new(
                vec![0; (pitch * height) as usize].into_boxed_slice(),
            )),
        }))
    }

    fn modifier_plane_count(&self, _format: u32, modifier: Modifier) -> Option<u32> {
        match self.two_plane_modifiers.borrow().contains(&modifier) {
            true => Some(2),
            false => Some(1),
        }
    }
}
