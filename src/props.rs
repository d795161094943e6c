//! Per-object caches of kernel property ids and values.
//!
//! Every table is built against a fixed schema. Properties the kernel does
//! not expose for an object keep the id `DrmProperty::NONE` and all writes to
//! them are dropped, so callers can emit one uniform set of writes whatever
//! the driver supports.

use {
    crate::{
        kernel::KmsKernel,
        utils::oserror::OsError,
        video::drm::{
            DrmBlob, DrmConnector, DrmCrtc, DrmError, DrmObject, DrmPlane, DrmProperty,
            DrmPropertyType, ObjectChange,
        },
    },
    ahash::AHashMap,
    bstr::ByteSlice,
    linearize::{Linearize, LinearizeExt, StaticMap, static_map},
    std::{cell::Cell, fmt::Debug},
};

pub trait PropertySchema: Linearize + Copy + Debug + 'static {
    type Object: DrmObject + Copy;

    fn name(self) -> &'static str;

    /// Names of the enum values this core uses, in index order.
    fn enum_names(self) -> &'static [&'static str] {
        &[]
    }
}

#[derive(Debug)]
pub struct PropertyInfo {
    pub id: DrmProperty,
    pub value: Cell<u64>,
    pub pending: Cell<Option<u64>>,
    enum_values: Vec<Option<u64>>,
}

impl PropertyInfo {
    fn absent() -> Self {
        Self {
            id: DrmProperty::NONE,
            value: Cell::new(0),
            pending: Cell::new(None),
            enum_values: vec![],
        }
    }
}

#[derive(Debug)]
pub struct PropertyTable<P: PropertySchema> {
    obj: P::Object,
    props: StaticMap<P, PropertyInfo>,
}

impl<P: PropertySchema> PropertyTable<P> {
    /// Resolves every schema property of `obj`.
    pub fn discover(kernel: &dyn KmsKernel, obj: P::Object) -> Result<Self, DrmError> {
        let mut by_name = AHashMap::new();
        for value in kernel.get_properties(obj.id(), P::Object::TYPE)? {
            let def = kernel.get_property(value.id)?;
            by_name.insert(def.name.clone(), (def, value.value));
        }
        let resolve = |p: P| {
            let Some((def, value)) = by_name.get(p.name().as_bytes().as_bstr()) else {
                return PropertyInfo::absent();
            };
            let mut enum_values = vec![];
            if let DrmPropertyType::Enum { values, .. } = &def.ty {
                for name in p.enum_names() {
                    let raw = values
                        .iter()
                        .find(|v| v.name == name.as_bytes())
                        .map(|v| v.value);
                    enum_values.push(raw);
                }
            }
            PropertyInfo {
                id: def.id,
                value: Cell::new(*value),
                pending: Cell::new(None),
                enum_values,
            }
        };
        let props = static_map! {
            p => resolve(p),
        };
        Ok(Self { obj, props })
    }

    /// A table in which every property is absent.
    pub fn empty(obj: P::Object) -> Self {
        Self {
            obj,
            props: static_map! {
                _p => PropertyInfo::absent(),
            },
        }
    }

    pub fn object(&self) -> P::Object {
        self.obj
    }

    pub fn get(&self, p: P) -> &PropertyInfo {
        &self.props[p]
    }

    pub fn id(&self, p: P) -> DrmProperty {
        self.props[p].id
    }

    pub fn is_present(&self, p: P) -> bool {
        self.props[p].id.is_some()
    }

    pub fn raw_value(&self, p: P) -> Option<u64> {
        let info = &self.props[p];
        info.id.is_some().then(|| info.value.get())
    }

    /// Returns the cached value, or `default` if the property is absent.
    ///
    /// Enum properties report the schema index of the cached raw value.
    pub fn current_value(&self, p: P, default: u64) -> u64 {
        let info = &self.props[p];
        if info.id.is_none() {
            return default;
        }
        let value = info.value.get();
        if p.enum_names().is_empty() {
            return value;
        }
        info.enum_values
            .iter()
            .position(|v| *v == Some(value))
            .map(|idx| idx as u64)
            .unwrap_or(default)
    }

    pub fn blob(&self, p: P) -> DrmBlob {
        DrmBlob(self.raw_value(p).unwrap_or(0) as u32)
    }

    /// Maps a schema enum index to the kernel's raw value.
    pub fn enum_value(&self, p: P, idx: usize) -> Option<u64> {
        self.props[p].enum_values.get(idx).copied().flatten()
    }

    /// Re-reads values; ids are not re-resolved.
    pub fn refresh(&self, kernel: &dyn KmsKernel) -> Result<(), DrmError> {
        let values = kernel.get_properties(self.obj.id(), P::Object::TYPE)?;
        for info in self.props.values() {
            if info.id.is_none() {
                continue;
            }
            if let Some(v) = values.iter().find(|v| v.id == info.id) {
                info.value.set(v.value);
            }
        }
        Ok(())
    }

    /// Adds a write to an atomic batch and stages it as pending.
    pub fn write(&self, oc: &mut ObjectChange, p: P, value: u64) {
        let info = &self.props[p];
        if info.id.is_none() {
            return;
        }
        oc.change(info.id, value);
        info.pending.set(Some(value));
    }

    /// Writes a property immediately through the legacy path.
    pub fn set_now(&self, kernel: &dyn KmsKernel, p: P, value: u64) -> Result<(), OsError> {
        let info = &self.props[p];
        if info.id.is_none() {
            return Ok(());
        }
        kernel.set_property(self.obj.id(), P::Object::TYPE, info.id, value)?;
        info.value.set(value);
        Ok(())
    }

    pub fn apply_pending(&self) {
        for info in self.props.values() {
            if let Some(v) = info.pending.take() {
                info.value.set(v);
            }
        }
    }

    pub fn discard_pending(&self) {
        for info in self.props.values() {
            info.pending.take();
        }
    }

    /// The value a committed batch would leave behind.
    pub fn effective_value(&self, p: P) -> u64 {
        let info = &self.props[p];
        info.pending.get().unwrap_or(info.value.get())
    }

    pub fn names() -> impl Iterator<Item = &'static str> {
        P::variants().map(|p| p.name())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Linearize)]
pub enum CrtcProp {
    Active,
    ModeId,
    GammaLut,
    GammaLutSize,
    Ctm,
    VrrEnabled,
}

impl PropertySchema for CrtcProp {
    type Object = DrmCrtc;

    fn name(self) -> &'static str {
        match self {
            CrtcProp::Active => "ACTIVE",
            CrtcProp::ModeId => "MODE_ID",
            CrtcProp::GammaLut => "GAMMA_LUT",
            CrtcProp::GammaLutSize => "GAMMA_LUT_SIZE",
            CrtcProp::Ctm => "CTM",
            CrtcProp::VrrEnabled => "VRR_ENABLED",
        }
    }
}

pub const DPMS_NAMES: &[&str] = &["On", "Standby", "Suspend", "Off"];
pub const LINK_STATUS_GOOD: usize = 0;
pub const LINK_STATUS_BAD: usize = 1;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Linearize)]
pub enum ConnectorProp {
    CrtcId,
    Dpms,
    LinkStatus,
    VrrCapable,
    Edid,
    Path,
    Tile,
    NonDesktop,
}

impl PropertySchema for ConnectorProp {
    type Object = DrmConnector;

    fn name(self) -> &'static str {
        match self {
            ConnectorProp::CrtcId => "CRTC_ID",
            ConnectorProp::Dpms => "DPMS",
            ConnectorProp::LinkStatus => "link-status",
            ConnectorProp::VrrCapable => "vrr_capable",
            ConnectorProp::Edid => "EDID",
            ConnectorProp::Path => "PATH",
            ConnectorProp::Tile => "TILE",
            ConnectorProp::NonDesktop => "non-desktop",
        }
    }

    fn enum_names(self) -> &'static [&'static str] {
        match self {
            ConnectorProp::Dpms => DPMS_NAMES,
            ConnectorProp::LinkStatus => &["Good", "Bad"],
            _ => &[],
        }
    }
}

pub const PLANE_TYPE_OVERLAY: u64 = 0;
pub const PLANE_TYPE_PRIMARY: u64 = 1;
pub const PLANE_TYPE_CURSOR: u64 = 2;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Linearize)]
pub enum PlaneProp {
    Type,
    FbId,
    CrtcId,
    InFormats,
    SrcX,
    SrcY,
    SrcW,
    SrcH,
    CrtcX,
    CrtcY,
    CrtcW,
    CrtcH,
    Rotation,
}

impl PropertySchema for PlaneProp {
    type Object = DrmPlane;

    fn name(self) -> &'static str {
        match self {
            PlaneProp::Type => "type",
            PlaneProp::FbId => "FB_ID",
            PlaneProp::CrtcId => "CRTC_ID",
            PlaneProp::InFormats => "IN_FORMATS",
            PlaneProp::SrcX => "SRC_X",
            PlaneProp::SrcY => "SRC_Y",
            PlaneProp::SrcW => "SRC_W",
            PlaneProp::SrcH => "SRC_H",
            PlaneProp::CrtcX => "CRTC_X",
            PlaneProp::CrtcY => "CRTC_Y",
            PlaneProp::CrtcW => "CRTC_W",
            PlaneProp::CrtcH => "CRTC_H",
            PlaneProp::Rotation => "rotation",
        }
    }

    fn enum_names(self) -> &'static [&'static str] {
        match self {
            PlaneProp::Type => &["Overlay", "Primary", "Cursor"],
            _ => &[],
        }
    }
}
