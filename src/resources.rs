//! In-memory records of the crtcs, outputs and planes of a device.

use {
    crate::{
        bo::Framebuffer,
        cursor::HwCursor,
        kernel::{ErrorKind, KmsKernel},
        modeset::{CrtcState, DpmsMode, ModeBlobs, ModeRequest, Rotation},
        props::{
            ConnectorProp, CrtcProp, LINK_STATUS_BAD, PLANE_TYPE_OVERLAY, PLANE_TYPE_PRIMARY,
            PlaneProp, PropertyTable,
        },
        shared_flip::SharedFlipper,
        utils::{
            bitflags::BitflagsExt, clonecell::CloneCell, errorfmt::ErrorFmt, oserror::OsError,
        },
        vblank::{MscTracker, VblankQueue},
        video::{
            Modifier,
            drm::{
                ConnectorStatus, ConnectorType, DrmBlob, DrmCardResources, DrmConnector,
                DrmConnectorInfo, DrmCrtc, DrmEncoder, DrmEncoderInfo, DrmError, DrmModeInfo,
                DrmObject, DrmPlane, parse_in_formats,
            },
        },
    },
    ahash::AHashMap,
    bstr::ByteSlice,
    indexmap::{IndexMap, IndexSet},
    std::{
        cell::{Cell, RefCell},
        fmt::{Debug, Formatter},
        rc::Rc,
    },
    thiserror::Error,
    uapi::c,
};

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("Could not query the card resources")]
    Resources(#[source] DrmError),
    #[error("Could not query the planes")]
    Planes(#[source] DrmError),
    #[error("Could not query connector {0}")]
    Connector(DrmConnector, #[source] DrmError),
    #[error("Could not query encoder {0}")]
    Encoder(DrmEncoder, #[source] DrmError),
    #[error("Could not query the properties of connector {0}")]
    ConnectorProperties(DrmConnector, #[source] DrmError),
}

impl ResourceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ResourceError::Resources(e)
            | ResourceError::Planes(e)
            | ResourceError::Connector(_, e)
            | ResourceError::Encoder(_, e)
            | ResourceError::ConnectorProperties(_, e) => ErrorKind::from_drm(e),
        }
    }
}

pub struct Plane {
    pub id: DrmPlane,
    pub props: PropertyTable<PlaneProp>,
    pub possible_crtcs: u32,
    pub formats: IndexMap<u32, IndexSet<Modifier>>,
    pub initial_crtc: DrmCrtc,
}

impl Debug for Plane {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plane")
            .field("id", &self.id)
            .field("possible_crtcs", &self.possible_crtcs)
            .finish_non_exhaustive()
    }
}

impl Plane {
    fn discover(kernel: &dyn KmsKernel, id: DrmPlane) -> Result<Self, DrmError> {
        let info = kernel.get_plane_info(id)?;
        let props = PropertyTable::<PlaneProp>::discover(kernel, id)?;
        let mut formats = IndexMap::new();
        let blob = props.blob(PlaneProp::InFormats);
        if blob.is_some() {
            match kernel.get_blob(blob).and_then(|b| parse_in_formats(&b)) {
                Ok(list) => {
                    for f in list {
                        formats.insert(f.format, f.modifiers);
                    }
                }
                Err(e) => {
                    log::warn!(
                        "Could not read the IN_FORMATS of plane {}: {}",
                        id,
                        ErrorFmt(e)
                    );
                }
            }
        }
        if formats.is_empty() {
            for format in info.format_types {
                formats.insert(format, IndexSet::new());
            }
        }
        Ok(Self {
            id,
            props,
            possible_crtcs: info.possible_crtcs,
            formats,
            initial_crtc: info.crtc_id,
        })
    }

    pub fn ty(&self) -> u64 {
        self.props.current_value(PlaneProp::Type, PLANE_TYPE_OVERLAY)
    }

    pub fn modifiers(&self, format: u32) -> Option<&IndexSet<Modifier>> {
        self.formats.get(&format)
    }
}

pub struct Crtc {
    pub id: DrmCrtc,
    pub idx: usize,
    pub props: PropertyTable<CrtcProp>,
    pub plane: Option<Rc<Plane>>,
    /// Entries of the legacy gamma ramp.
    pub gamma_size: u32,
    pub state: Cell<CrtcState>,
    pub dpms: Cell<DpmsMode>,
    pub needs_modeset: Cell<bool>,
    pub desired: RefCell<Option<ModeRequest>>,
    pub blobs: ModeBlobs,
    pub msc: Rc<MscTracker>,
    pub scanout: CloneCell<Option<Rc<Framebuffer>>>,
    /// The shadow buffer the kernel scans out instead of `scanout` when the
    /// plane cannot rotate.
    pub rotate: CloneCell<Option<Rc<Framebuffer>>>,
    pub cursor: CloneCell<Option<Rc<HwCursor>>>,
    pub shared: CloneCell<Option<Rc<SharedFlipper>>>,
    pub gamma_blob: Cell<DrmBlob>,
    pub ctm_blob: Cell<DrmBlob>,
    pub vrr: Cell<bool>,
    initial_mode: RefCell<Option<DrmModeInfo>>,
}

impl Debug for Crtc {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Crtc")
            .field("id", &self.id)
            .field("idx", &self.idx)
            .field("state", &self.state.get())
            .field("dpms", &self.dpms.get())
            .finish_non_exhaustive()
    }
}

impl Crtc {
    pub fn is_active(&self) -> bool {
        self.state.get() == CrtcState::Active
    }

    pub fn desired_mode(&self) -> Option<ModeRequest> {
        self.desired.borrow().clone()
    }
}

/// A parsed `TILE` blob.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TileInfo {
    pub group_id: u32,
    pub flags: u32,
    pub num_h: u32,
    pub num_v: u32,
    pub loc_h: u32,
    pub loc_v: u32,
    pub tile_w: u32,
    pub tile_h: u32,
}

pub fn parse_tile(blob: &[u8]) -> Option<TileInfo> {
    let s = blob.trim_end_with(|c| c == '\0').to_str().ok()?;
    let mut fields = [0u32; 8];
    let mut parts = s.split(':');
    for field in &mut fields {
        *field = parts.next()?.trim().parse().ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    let [group_id, flags, num_h, num_v, loc_h, loc_v, tile_w, tile_h] = fields;
    Some(TileInfo {
        group_id,
        flags,
        num_h,
        num_v,
        loc_h,
        loc_v,
        tile_w,
        tile_h,
    })
}

/// Splits a `mst:<parent>-<path>` blob into the parent connector and path.
pub fn parse_mst_path(blob: &[u8]) -> Option<(DrmConnector, String)> {
    let s = blob.trim_end_with(|c| c == '\0');
    let rest = s.strip_prefix(b"mst:")?;
    let dash = rest.find_byte(b'-')?;
    if dash == 0 || dash > 4 {
        return None;
    }
    let parent = rest[..dash].to_str().ok()?.parse().ok()?;
    let path = rest[dash + 1..].to_str().ok()?;
    Some((DrmConnector(parent), path.to_string()))
}

pub struct Output {
    pub connector: Cell<DrmConnector>,
    pub name: String,
    pub props: CloneCell<Rc<PropertyTable<ConnectorProp>>>,
    pub connector_type: ConnectorType,
    pub connector_type_id: u32,
    pub status: Cell<ConnectorStatus>,
    pub modes: RefCell<Vec<DrmModeInfo>>,
    pub mm: Cell<(u32, u32)>,
    pub encoders: RefCell<Vec<DrmEncoder>>,
    pub edid: RefCell<Option<Vec<u8>>>,
    pub tile: RefCell<Option<TileInfo>>,
    pub path: RefCell<Option<Vec<u8>>>,
    pub non_desktop: Cell<bool>,
    /// The connector belongs to a lessee.
    pub leased: Cell<bool>,
    pub dpms: Cell<DpmsMode>,
    pub crtc: Cell<Option<DrmCrtc>>,
    pub possible_crtcs: Cell<u32>,
    pub possible_clones: Cell<u32>,
    enc_mask: Cell<u32>,
    enc_clone_mask: Cell<u32>,
    initial_encoder: Cell<DrmEncoder>,
}

impl Debug for Output {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Output")
            .field("name", &self.name)
            .field("connector", &self.connector.get())
            .field("status", &self.status.get())
            .finish_non_exhaustive()
    }
}

fn read_blob(
    kernel: &dyn KmsKernel,
    props: &PropertyTable<ConnectorProp>,
    p: ConnectorProp,
) -> Option<Vec<u8>> {
    let blob = props.blob(p);
    if blob.is_none() {
        return None;
    }
    match kernel.get_blob(blob) {
        Ok(b) => Some(b),
        Err(e) => {
            log::warn!("Could not read the {:?} blob: {}", p, ErrorFmt(e));
            None
        }
    }
}

impl Output {
    pub fn is_removed(&self) -> bool {
        self.connector.get().is_none()
    }

    pub fn is_connected(&self) -> bool {
        !self.is_removed() && self.status.get() == ConnectorStatus::Connected
    }

    pub fn preferred_mode(&self) -> Option<DrmModeInfo> {
        let modes = self.modes.borrow();
        modes
            .iter()
            .find(|m| m.is_preferred())
            .or(modes.first())
            .cloned()
    }

    pub fn vrr_capable(&self) -> bool {
        self.props.get().current_value(ConnectorProp::VrrCapable, 0) == 1
    }

    pub fn link_bad(&self) -> bool {
        self.props
            .get()
            .current_value(ConnectorProp::LinkStatus, LINK_STATUS_BAD as u64 + 1)
            == LINK_STATUS_BAD as u64
    }

    fn update_info(&self, info: DrmConnectorInfo) {
        self.status.set(ConnectorStatus::from_drm(info.connection));
        *self.modes.borrow_mut() = info.modes;
        self.mm.set((info.mm_width, info.mm_height));
        *self.encoders.borrow_mut() = info.encoders;
        self.initial_encoder.set(info.encoder_id);
    }

    fn update_blobs(&self, kernel: &dyn KmsKernel) {
        let props = self.props.get();
        *self.edid.borrow_mut() = read_blob(kernel, &props, ConnectorProp::Edid);
        *self.tile.borrow_mut() =
            read_blob(kernel, &props, ConnectorProp::Tile).and_then(|b| parse_tile(&b));
        *self.path.borrow_mut() = read_blob(kernel, &props, ConnectorProp::Path);
        self.non_desktop
            .set(props.current_value(ConnectorProp::NonDesktop, 0) != 0);
    }

    /// Re-reads the connection status, mode list, properties and blobs.
    pub fn detect(&self, kernel: &dyn KmsKernel) -> Result<(), ResourceError> {
        let id = self.connector.get();
        if id.is_none() {
            self.status.set(ConnectorStatus::Disconnected);
            return Ok(());
        }
        let info = kernel
            .get_connector_info(id, true)
            .map_err(|e| ResourceError::Connector(id, e))?;
        self.update_info(info);
        let props = PropertyTable::discover(kernel, id)
            .map_err(|e| ResourceError::ConnectorProperties(id, e))?;
        self.props.set(Rc::new(props));
        self.update_blobs(kernel);
        Ok(())
    }
}

fn output_name(
    info: &DrmConnectorInfo,
    path: Option<&[u8]>,
    outputs: &[Rc<Output>],
) -> String {
    if let Some((parent, path)) = path.and_then(parse_mst_path) {
        if let Some(p) = outputs.iter().find(|o| o.connector.get() == parent) {
            return format!("{}-{}", p.name, path);
        }
    }
    match ConnectorType::from_drm(info.connector_type) {
        ConnectorType::Unknown(n) => format!("Unknown{}-{}", n, info.connector_type_id),
        ty => format!("{}-{}", ty, info.connector_type_id),
    }
}

/// The result of re-reading the connectors.
#[derive(Default, Debug)]
pub struct Rescan {
    pub added: Vec<Rc<Output>>,
    pub removed: Vec<Rc<Output>>,
    pub link_bad: Vec<Rc<Output>>,
}

impl Rescan {
    pub fn changed(&self) -> bool {
        self.added.len() + self.removed.len() + self.link_bad.len() > 0
    }
}

pub struct Resources {
    kernel: Rc<dyn KmsKernel>,
    pub planes: Vec<Rc<Plane>>,
    pub crtcs: Vec<Rc<Crtc>>,
    outputs: RefCell<Vec<Rc<Output>>>,
    claimed: Cell<u32>,
    pub min_size: (u32, u32),
    pub max_size: (u32, u32),
}

impl Debug for Resources {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resources")
            .field("planes", &self.planes)
            .field("crtcs", &self.crtcs)
            .field("outputs", &*self.outputs.borrow())
            .finish_non_exhaustive()
    }
}

impl Resources {
    /// Builds the records of every usable crtc, plane and connector.
    ///
    /// Crtcs whose index is set in `claimed_crtcs` are left alone. A crtc or
    /// plane whose properties cannot be read is skipped.
    pub fn discover(
        kernel: &Rc<dyn KmsKernel>,
        queue: &VblankQueue,
        claimed_crtcs: u32,
    ) -> Result<Self, ResourceError> {
        let res = kernel.get_resources().map_err(ResourceError::Resources)?;
        let mut planes = vec![];
        for id in kernel.get_planes().map_err(ResourceError::Planes)? {
            match Plane::discover(&**kernel, id) {
                Ok(p) => planes.push(Rc::new(p)),
                Err(e) => log::warn!("Ignoring plane {}: {}", id, ErrorFmt(e)),
            }
        }
        let mut crtcs = vec![];
        let mut assigned = vec![];
        for (idx, &id) in res.crtcs.iter().enumerate() {
            if idx < 32 && claimed_crtcs.contains(1 << idx) {
                log::info!("Crtc {} is claimed elsewhere", id);
                continue;
            }
            let props = match PropertyTable::<CrtcProp>::discover(&**kernel, id) {
                Ok(p) => p,
                Err(e) => {
                    log::warn!("Ignoring crtc {}: {}", id, ErrorFmt(e));
                    continue;
                }
            };
            let info = match kernel.get_crtc_info(id) {
                Ok(i) => i,
                Err(e) => {
                    log::warn!("Ignoring crtc {}: {}", id, ErrorFmt(e));
                    continue;
                }
            };
            let plane = 'plane: {
                let mut fallback = None;
                for plane in &planes {
                    if plane.ty() != PLANE_TYPE_PRIMARY
                        || idx >= 32
                        || !plane.possible_crtcs.contains(1 << idx)
                        || assigned.contains(&plane.id)
                    {
                        continue;
                    }
                    if plane.initial_crtc == id {
                        break 'plane Some(plane.clone());
                    }
                    if fallback.is_none() {
                        fallback = Some(plane.clone());
                    }
                }
                fallback
            };
            if let Some(plane) = &plane {
                assigned.push(plane.id);
            }
            crtcs.push(Rc::new(Crtc {
                id,
                idx,
                props,
                plane,
                gamma_size: info.gamma_size,
                state: Cell::new(CrtcState::Disabled),
                dpms: Cell::new(DpmsMode::Off),
                needs_modeset: Cell::new(true),
                desired: Default::default(),
                blobs: Default::default(),
                msc: queue.register_crtc(id, idx),
                scanout: Default::default(),
                rotate: Default::default(),
                cursor: Default::default(),
                shared: Default::default(),
                gamma_blob: Cell::new(DrmBlob::NONE),
                ctm_blob: Cell::new(DrmBlob::NONE),
                vrr: Cell::new(false),
                initial_mode: RefCell::new(info.mode),
            }));
        }
        let slf = Self {
            kernel: kernel.clone(),
            planes,
            crtcs,
            outputs: Default::default(),
            claimed: Cell::new(claimed_crtcs),
            min_size: (res.min_width, res.min_height),
            max_size: (res.max_width, res.max_height),
        };
        let encoders = slf.encoder_infos(&res)?;
        for &id in &res.connectors {
            if let Err(e) = slf.create_output(id, &res, &encoders) {
                log::warn!("Ignoring connector {}: {}", id, ErrorFmt(e));
            }
        }
        slf.update_clones();
        slf.adopt_kernel_state(&encoders);
        Ok(slf)
    }

    fn encoder_infos(
        &self,
        res: &DrmCardResources,
    ) -> Result<AHashMap<DrmEncoder, DrmEncoderInfo>, ResourceError> {
        let mut encoders = AHashMap::new();
        for &id in &res.encoders {
            let info = self
                .kernel
                .get_encoder_info(id)
                .map_err(|e| ResourceError::Encoder(id, e))?;
            encoders.insert(id, info);
        }
        Ok(encoders)
    }

    /// Creates an output for a connector, or rebinds a removed output with
    /// the same name.
    fn create_output(
        &self,
        id: DrmConnector,
        res: &DrmCardResources,
        encoders: &AHashMap<DrmEncoder, DrmEncoderInfo>,
    ) -> Result<Rc<Output>, ResourceError> {
        let kernel = &*self.kernel;
        let info = kernel
            .get_connector_info(id, true)
            .map_err(|e| ResourceError::Connector(id, e))?;
        let props = PropertyTable::<ConnectorProp>::discover(kernel, id)
            .map_err(|e| ResourceError::ConnectorProperties(id, e))?;
        let path = read_blob(kernel, &props, ConnectorProp::Path);
        let name = output_name(&info, path.as_deref(), &self.outputs.borrow());
        let existing = self
            .outputs
            .borrow()
            .iter()
            .find(|o| o.is_removed() && o.name == name)
            .cloned();
        let mut possible_crtcs = 0;
        let mut enc_mask = 0;
        let mut enc_clone_mask = 0xff;
        for encoder in &info.encoders {
            let Some(e) = encoders.get(encoder) else {
                return Err(ResourceError::Encoder(
                    *encoder,
                    DrmError::GetEncoder(OsError(c::ENOENT)),
                ));
            };
            possible_crtcs |= e.possible_crtcs & 0x7f;
            if let Some(k) = res.encoders.iter().position(|r| r == encoder) {
                enc_mask |= 1 << k;
            }
            enc_clone_mask &= e.possible_clones;
        }
        let output = match existing {
            Some(o) => {
                log::info!("Connector {} takes over output {}", id, o.name);
                o.connector.set(id);
                o.props.set(Rc::new(props));
                o
            }
            None => {
                let o = Rc::new(Output {
                    connector: Cell::new(id),
                    name,
                    props: CloneCell::new(Rc::new(props)),
                    connector_type: ConnectorType::from_drm(info.connector_type),
                    connector_type_id: info.connector_type_id,
                    status: Cell::new(ConnectorStatus::Unknown),
                    modes: Default::default(),
                    mm: Default::default(),
                    encoders: Default::default(),
                    edid: Default::default(),
                    tile: Default::default(),
                    path: Default::default(),
                    non_desktop: Cell::new(false),
                    leased: Cell::new(false),
                    dpms: Cell::new(DpmsMode::Off),
                    crtc: Cell::new(None),
                    possible_crtcs: Cell::new(0),
                    possible_clones: Cell::new(0),
                    enc_mask: Cell::new(0),
                    enc_clone_mask: Cell::new(0),
                    initial_encoder: Cell::new(DrmEncoder::NONE),
                });
                self.outputs.borrow_mut().push(o.clone());
                o
            }
        };
        output.update_info(info);
        output.update_blobs(kernel);
        output.possible_crtcs.set(possible_crtcs);
        output.enc_mask.set(enc_mask);
        output.enc_clone_mask.set(enc_clone_mask);
        let dpms = output
            .props
            .get()
            .current_value(ConnectorProp::Dpms, DpmsMode::On.index() as u64);
        output.dpms.set(DpmsMode::from_index(dpms));
        log::debug!("Output {} on connector {}", output.name, id);
        Ok(output)
    }

    fn update_clones(&self) {
        let outputs = self.outputs.borrow();
        for output in outputs.iter() {
            let mut mask = 0;
            let clone_mask = output.enc_clone_mask.get();
            if clone_mask != 0 {
                for (idx, other) in outputs.iter().enumerate() {
                    if Rc::ptr_eq(output, other) || other.enc_mask.get() == 0 {
                        continue;
                    }
                    if clone_mask == other.enc_mask.get() && idx < 32 {
                        mask |= 1 << idx;
                    }
                }
            }
            output.possible_clones.set(mask);
        }
    }

    /// Takes over the bindings the previous kernel client left behind.
    fn adopt_kernel_state(&self, encoders: &AHashMap<DrmEncoder, DrmEncoderInfo>) {
        for output in self.outputs() {
            let Some(encoder) = encoders.get(&output.initial_encoder.get()) else {
                continue;
            };
            let Some(crtc) = self.crtc(encoder.crtc_id) else {
                continue;
            };
            let Some(mode) = crtc.initial_mode.borrow().clone() else {
                continue;
            };
            output.crtc.set(Some(crtc.id));
            if crtc.state.get() != CrtcState::Active {
                log::info!(
                    "Adopting mode {} on crtc {} from the previous client",
                    mode,
                    crtc.id
                );
                crtc.state.set(CrtcState::Active);
                crtc.dpms.set(DpmsMode::On);
                crtc.needs_modeset.set(true);
                *crtc.desired.borrow_mut() = Some(ModeRequest {
                    mode,
                    x: 0,
                    y: 0,
                    rotation: Rotation::Normal,
                });
            }
        }
    }

    /// Indices of the crtcs another client drives.
    pub fn claimed(&self) -> u32 {
        self.claimed.get()
    }

    pub fn is_claimed(&self, crtc: &Crtc) -> bool {
        crtc.idx < 32 && self.claimed.get().contains(1 << crtc.idx)
    }

    pub fn claim(&self, mask: u32) {
        self.claimed.set(self.claimed.get() | mask);
    }

    pub fn release(&self, mask: u32) {
        self.claimed.set(self.claimed.get() & !mask);
    }

    pub fn kernel(&self) -> &Rc<dyn KmsKernel> {
        &self.kernel
    }

    pub fn outputs(&self) -> Vec<Rc<Output>> {
        self.outputs.borrow().clone()
    }

    pub fn crtc(&self, id: DrmCrtc) -> Option<Rc<Crtc>> {
        self.crtcs.iter().find(|c| c.id == id).cloned()
    }

    pub fn output(&self, name: &str) -> Option<Rc<Output>> {
        self.outputs.borrow().iter().find(|o| o.name == name).cloned()
    }

    pub fn output_by_connector(&self, id: DrmConnector) -> Option<Rc<Output>> {
        if id.is_none() {
            return None;
        }
        self.outputs
            .borrow()
            .iter()
            .find(|o| o.connector.get() == id)
            .cloned()
    }

    /// The outputs currently bound to a crtc.
    pub fn outputs_of(&self, crtc: DrmCrtc) -> Vec<Rc<Output>> {
        self.outputs
            .borrow()
            .iter()
            .filter(|o| o.crtc.get() == Some(crtc))
            .cloned()
            .collect()
    }

    /// Modifiers that every active crtc's plane supports for `format`.
    pub fn common_modifiers(&self, format: u32) -> IndexSet<Modifier> {
        let sets: Vec<_> = self
            .crtcs
            .iter()
            .filter(|c| c.is_active() || c.desired.borrow().is_some())
            .filter_map(|c| c.plane.as_ref())
            .filter_map(|p| p.modifiers(format))
            .collect();
        crate::bo::common_modifiers(sets.into_iter())
    }

    /// Removes the output of a vanished connector.
    pub fn remove_connector(&self, id: DrmConnector) -> Option<Rc<Output>> {
        let output = self.output_by_connector(id)?;
        log::info!("Connector {} of output {} was removed", id, output.name);
        output.connector.set(DrmConnector::NONE);
        output.status.set(ConnectorStatus::Disconnected);
        output.crtc.set(None);
        Some(output)
    }

    /// Adds or refreshes the output of a connector.
    pub fn add_connector(&self, id: DrmConnector) -> Result<Rc<Output>, ResourceError> {
        if let Some(output) = self.output_by_connector(id) {
            output.detect(&*self.kernel)?;
            return Ok(output);
        }
        let res = self
            .kernel
            .get_resources()
            .map_err(ResourceError::Resources)?;
        let encoders = self.encoder_infos(&res)?;
        let output = self.create_output(id, &res, &encoders)?;
        self.update_clones();
        Ok(output)
    }

    /// Re-reads the connector list and the state of every known output.
    pub fn rescan(&self) -> Result<Rescan, ResourceError> {
        let res = self
            .kernel
            .get_resources()
            .map_err(ResourceError::Resources)?;
        let encoders = self.encoder_infos(&res)?;
        let mut report = Rescan::default();
        for output in self.outputs() {
            let id = output.connector.get();
            if id.is_some() && !res.connectors.contains(&id) {
                if let Some(o) = self.remove_connector(id) {
                    report.removed.push(o);
                }
            }
        }
        for &id in &res.connectors {
            match self.output_by_connector(id) {
                Some(output) if output.leased.get() => {
                    log::debug!("Not re-detecting leased output {}", output.name);
                }
                Some(output) => {
                    if let Err(e) = output.detect(&*self.kernel) {
                        log::warn!("Could not re-detect {}: {}", output.name, ErrorFmt(e));
                        continue;
                    }
                    let driven = output
                        .crtc
                        .get()
                        .and_then(|c| self.crtc(c))
                        .is_some_and(|c| !self.is_claimed(&c));
                    if driven && output.link_bad() {
                        log::warn!("Link status of {} is bad", output.name);
                        report.link_bad.push(output);
                    }
                }
                None => match self.create_output(id, &res, &encoders) {
                    Ok(output) => report.added.push(output),
                    Err(e) => log::warn!("Ignoring connector {}: {}", id, ErrorFmt(e)),
                },
            }
        }
        self.update_clones();
        Ok(report)
    }
}
