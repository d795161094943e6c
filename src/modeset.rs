use {
    crate::{
        bo::{
            AllocRequest, Allocator, BO_USE_RENDERING, BO_USE_SCANOUT, BoError, Framebuffer,
            allocate_scanout,
        },
        kernel::{ErrorKind, KmsKernel},
        props::{ConnectorProp, CrtcProp, PlaneProp, PropertySchema, PropertyTable},
        resources::{Crtc, Output, Resources},
        utils::{errorfmt::ErrorFmt, oserror::OsError},
        video::drm::{
            Change, DRM_MODE_ATOMIC_ALLOW_MODESET, DRM_MODE_ATOMIC_NONBLOCK,
            DRM_MODE_ATOMIC_TEST_ONLY, DRM_MODE_PAGE_FLIP_EVENT, DrmBlob, DrmConnector, DrmCrtc,
            DrmError, DrmFb, DrmModeInfo, DrmObject,
        },
    },
    std::{cell::RefCell, rc::Rc},
    thiserror::Error,
    uapi::c,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CrtcState {
    Disabled,
    Testing,
    PendingCommit,
    Active,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DpmsMode {
    On,
    Standby,
    Suspend,
    Off,
}

impl DpmsMode {
    pub fn index(self) -> usize {
        match self {
            DpmsMode::On => 0,
            DpmsMode::Standby => 1,
            DpmsMode::Suspend => 2,
            DpmsMode::Off => 3,
        }
    }

    pub fn from_index(idx: u64) -> Self {
        match idx {
            0 => DpmsMode::On,
            1 => DpmsMode::Standby,
            2 => DpmsMode::Suspend,
            _ => DpmsMode::Off,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum Rotation {
    #[default]
    Normal,
    Rotate90,
    Rotate180,
    Rotate270,
}

impl Rotation {
    /// The bit of this rotation in the plane `rotation` bitmask.
    pub fn bits(self) -> u64 {
        let idx = match self {
            Rotation::Normal => 0,
            Rotation::Rotate90 => 1,
            Rotation::Rotate180 => 2,
            Rotation::Rotate270 => 3,
        };
        1 << idx
    }

    pub fn swaps_axes(self) -> bool {
        matches!(self, Rotation::Rotate90 | Rotation::Rotate270)
    }

    /// The size of the framebuffer region scanned out for `mode`.
    pub fn source_size(self, mode: &DrmModeInfo) -> (u32, u32) {
        let (w, h) = (mode.hdisplay as u32, mode.vdisplay as u32);
        match self.swaps_axes() {
            true => (h, w),
            false => (w, h),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ModeRequest {
    pub mode: DrmModeInfo,
    pub x: u32,
    pub y: u32,
    pub rotation: Rotation,
}

#[derive(Debug)]
struct BlobSlot {
    blob: DrmBlob,
    mode: DrmModeInfo,
    committed: bool,
}

/// The mode blobs a crtc has created.
///
/// The newest blob is reused while the timing does not change. Older blobs
/// are destroyed once no crtc references them.
#[derive(Debug, Default)]
pub struct ModeBlobs {
    slots: RefCell<Vec<BlobSlot>>,
}

impl ModeBlobs {
    pub fn ensure(
        &self,
        kernel: &dyn KmsKernel,
        mode: &DrmModeInfo,
    ) -> Result<(DrmBlob, bool), DrmError> {
        let mut slots = self.slots.borrow_mut();
        if let Some(last) = slots.last() {
            if last.mode.same_timing(mode) {
                return Ok((last.blob, false));
            }
        }
        let blob = kernel.create_blob(&mode.blob_bytes())?;
        slots.push(BlobSlot {
            blob,
            mode: mode.clone(),
            committed: false,
        });
        Ok((blob, true))
    }

    /// Destroys `blob` if it is the newest blob and was never committed.
    pub fn discard(&self, kernel: &dyn KmsKernel, blob: DrmBlob) {
        let mut slots = self.slots.borrow_mut();
        let discard = match slots.last() {
            Some(last) => last.blob == blob && !last.committed,
            None => false,
        };
        if discard {
            slots.pop();
            if let Err(e) = kernel.destroy_blob(blob) {
                log::warn!("Could not destroy mode blob {}: {}", blob, ErrorFmt(e));
            }
        }
    }

    pub fn mark_committed(&self, blob: DrmBlob) {
        for slot in self.slots.borrow_mut().iter_mut() {
            if slot.blob == blob {
                slot.committed = true;
            }
        }
    }

    /// Destroys every blob except the newest and those in `referenced`.
    pub fn supersede(&self, kernel: &dyn KmsKernel, referenced: &[DrmBlob]) {
        let mut slots = self.slots.borrow_mut();
        let Some(latest) = slots.last().map(|s| s.blob) else {
            return;
        };
        slots.retain(|slot| {
            if slot.blob == latest || referenced.contains(&slot.blob) {
                return true;
            }
            if let Err(e) = kernel.destroy_blob(slot.blob) {
                log::warn!("Could not destroy mode blob {}: {}", slot.blob, ErrorFmt(e));
            }
            false
        });
    }

    pub fn release_all(&self, kernel: &dyn KmsKernel) {
        for slot in self.slots.borrow_mut().drain(..) {
            if let Err(e) = kernel.destroy_blob(slot.blob) {
                log::warn!("Could not destroy mode blob {}: {}", slot.blob, ErrorFmt(e));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.slots.borrow().len()
    }

    pub fn latest(&self) -> Option<DrmBlob> {
        self.slots.borrow().last().map(|s| s.blob)
    }
}

#[derive(Debug, Error)]
pub enum ModesetError {
    #[error("No outputs were given")]
    NoOutputs,
    #[error("Output {0} has been removed")]
    OutputRemoved(String),
    #[error("Output {0} is not connected")]
    OutputDisconnected(String),
    #[error("Output {0} cannot be driven by crtc {1}")]
    CrtcNotPossible(String, DrmCrtc),
    #[error("Crtc {0} has no primary plane")]
    NoPlane(DrmCrtc),
    #[error("Could not allocate a shadow buffer for rotation")]
    Shadow(#[source] BoError),
    #[error("The mode does not fit into the framebuffer")]
    OutOfBounds,
    #[error("Could not create a mode blob")]
    CreateBlob(#[source] DrmError),
    #[error("The kernel rejected the configuration in a test commit")]
    Test(#[source] OsError),
    #[error("Could not commit the configuration")]
    Commit(#[source] OsError),
    #[error("Crtc {0} has no framebuffer to scan out")]
    NoFramebuffer(DrmCrtc),
}

impl ModesetError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ModesetError::OutputRemoved(_) | ModesetError::OutputDisconnected(_) => {
                ErrorKind::Disconnected
            }
            ModesetError::NoPlane(_) => ErrorKind::Unsupported,
            ModesetError::Shadow(e) => e.kind(),
            ModesetError::CreateBlob(e) => ErrorKind::from_drm(e),
            ModesetError::Test(e) | ModesetError::Commit(e) => ErrorKind::from_os(*e),
            ModesetError::NoOutputs
            | ModesetError::CrtcNotPossible(..)
            | ModesetError::OutOfBounds
            | ModesetError::NoFramebuffer(_) => ErrorKind::KernelRejected,
        }
    }
}

pub struct CrtcEnable {
    pub crtc: Rc<Crtc>,
    pub blob: DrmBlob,
    pub req: ModeRequest,
    pub fb: DrmFb,
    pub outputs: Vec<Rc<Output>>,
}

/// Everything a single commit changes.
#[derive(Default)]
pub struct CommitPlan {
    pub enable: Vec<CrtcEnable>,
    pub disable: Vec<Rc<Crtc>>,
    pub unbind: Vec<Rc<Output>>,
}

impl CommitPlan {
    fn for_each_table(&self, mut f: impl FnMut(&dyn PendingTable)) {
        let crtc = |c: &Rc<Crtc>, f: &mut dyn FnMut(&dyn PendingTable)| {
            f(&c.props);
            if let Some(plane) = &c.plane {
                f(&plane.props);
            }
        };
        for en in &self.enable {
            crtc(&en.crtc, &mut f);
            for o in &en.outputs {
                f(&*o.props.get());
            }
        }
        for c in &self.disable {
            crtc(c, &mut f);
        }
        for o in &self.unbind {
            f(&*o.props.get());
        }
    }

    fn apply(&self) {
        self.for_each_table(|t| t.apply());
    }

    fn discard(&self) {
        self.for_each_table(|t| t.discard());
    }
}

trait PendingTable {
    fn apply(&self);
    fn discard(&self);
}

impl<P: PropertySchema> PendingTable for PropertyTable<P> {
    fn apply(&self) {
        self.apply_pending();
    }

    fn discard(&self) {
        self.discard_pending();
    }
}

/// The kernel interface a mode-set is expressed in.
pub trait CommitBackend {
    fn is_atomic(&self) -> bool;

    /// Whether a configuration can be validated without applying it.
    fn supports_test(&self) -> bool;

    fn submit(
        &self,
        kernel: &dyn KmsKernel,
        plan: &CommitPlan,
        test_only: bool,
    ) -> Result<(), OsError>;

    fn flip(
        &self,
        kernel: &dyn KmsKernel,
        crtc: &Crtc,
        fb: DrmFb,
        user_data: u64,
    ) -> Result<(), OsError>;
}

pub struct AtomicBackend;

impl AtomicBackend {
    fn build(&self, plan: &CommitPlan) -> Change {
        let mut change = Change::default();
        for en in &plan.enable {
            let crtc = &en.crtc;
            change.change_object(crtc.id, |oc| {
                crtc.props.write(oc, CrtcProp::Active, 1);
                crtc.props.write(oc, CrtcProp::ModeId, en.blob.0 as u64);
            });
            if let Some(plane) = &crtc.plane {
                let (sw, sh) = en.req.rotation.source_size(&en.req.mode);
                change.change_object(plane.id, |oc| {
                    let p = &plane.props;
                    p.write(oc, PlaneProp::FbId, en.fb.0 as u64);
                    p.write(oc, PlaneProp::CrtcId, crtc.id.0 as u64);
                    p.write(oc, PlaneProp::SrcX, (en.req.x as u64) << 16);
                    p.write(oc, PlaneProp::SrcY, (en.req.y as u64) << 16);
                    p.write(oc, PlaneProp::SrcW, (sw as u64) << 16);
                    p.write(oc, PlaneProp::SrcH, (sh as u64) << 16);
                    p.write(oc, PlaneProp::CrtcX, 0);
                    p.write(oc, PlaneProp::CrtcY, 0);
                    p.write(oc, PlaneProp::CrtcW, en.req.mode.hdisplay as u64);
                    p.write(oc, PlaneProp::CrtcH, en.req.mode.vdisplay as u64);
                    p.write(oc, PlaneProp::Rotation, en.req.rotation.bits());
                });
            }
            for output in &en.outputs {
                let props = output.props.get();
                change.change_object(output.connector.get(), |oc| {
                    props.write(oc, ConnectorProp::CrtcId, crtc.id.0 as u64);
                });
            }
        }
        for crtc in &plan.disable {
            change.change_object(crtc.id, |oc| {
                crtc.props.write(oc, CrtcProp::Active, 0);
                crtc.props.write(oc, CrtcProp::ModeId, 0);
            });
            if let Some(plane) = &crtc.plane {
                change.change_object(plane.id, |oc| {
                    plane.props.write(oc, PlaneProp::FbId, 0);
                    plane.props.write(oc, PlaneProp::CrtcId, 0);
                });
            }
        }
        for output in &plan.unbind {
            let props = output.props.get();
            change.change_object(output.connector.get(), |oc| {
                props.write(oc, ConnectorProp::CrtcId, 0);
            });
        }
        change
    }
}

impl CommitBackend for AtomicBackend {
    fn is_atomic(&self) -> bool {
        true
    }

    fn supports_test(&self) -> bool {
        true
    }

    fn submit(
        &self,
        kernel: &dyn KmsKernel,
        plan: &CommitPlan,
        test_only: bool,
    ) -> Result<(), OsError> {
        let change = self.build(plan);
        let mut flags = DRM_MODE_ATOMIC_ALLOW_MODESET;
        if test_only {
            flags |= DRM_MODE_ATOMIC_TEST_ONLY;
        }
        kernel.atomic(flags, &change, 0)
    }

    fn flip(
        &self,
        kernel: &dyn KmsKernel,
        crtc: &Crtc,
        fb: DrmFb,
        user_data: u64,
    ) -> Result<(), OsError> {
        let Some(plane) = &crtc.plane else {
            return Err(OsError(c::EINVAL));
        };
        let mut change = Change::default();
        change.change_object(plane.id, |oc| {
            plane.props.write(oc, PlaneProp::FbId, fb.0 as u64);
            plane.props.write(oc, PlaneProp::CrtcId, crtc.id.0 as u64);
        });
        let res = kernel.atomic(
            DRM_MODE_ATOMIC_NONBLOCK | DRM_MODE_PAGE_FLIP_EVENT,
            &change,
            user_data,
        );
        match res {
            Ok(()) => plane.props.apply_pending(),
            Err(_) => plane.props.discard_pending(),
        }
        res
    }
}

pub struct LegacyBackend;

impl CommitBackend for LegacyBackend {
    fn is_atomic(&self) -> bool {
        false
    }

    fn supports_test(&self) -> bool {
        false
    }

    fn submit(
        &self,
        kernel: &dyn KmsKernel,
        plan: &CommitPlan,
        test_only: bool,
    ) -> Result<(), OsError> {
        if test_only {
            return Ok(());
        }
        if plan.enable.is_empty() {
            for crtc in &plan.disable {
                kernel.set_crtc(crtc.id, DrmFb::NONE, 0, 0, &[], None)?;
            }
            return Ok(());
        }
        for en in &plan.enable {
            let connectors: Vec<DrmConnector> =
                en.outputs.iter().map(|o| o.connector.get()).collect();
            let plane = en
                .crtc
                .plane
                .as_ref()
                .filter(|p| p.props.is_present(PlaneProp::Rotation));
            let prev_rotation = plane.and_then(|p| p.props.raw_value(PlaneProp::Rotation));
            if let Some(plane) = plane {
                plane
                    .props
                    .set_now(kernel, PlaneProp::Rotation, en.req.rotation.bits())?;
            }
            let res = kernel.set_crtc(
                en.crtc.id,
                en.fb,
                en.req.x,
                en.req.y,
                &connectors,
                Some(&en.req.mode),
            );
            if let Err(e) = res {
                if let (Some(plane), Some(prev)) = (plane, prev_rotation) {
                    if let Err(e) = plane.props.set_now(kernel, PlaneProp::Rotation, prev) {
                        log::warn!(
                            "Could not restore the rotation of plane {}: {}",
                            plane.id,
                            ErrorFmt(e)
                        );
                    }
                }
                return Err(e);
            }
        }
        // Crtcs that lost their outputs go dark only once the new
        // configuration is up.
        for crtc in &plan.disable {
            if let Err(e) = kernel.set_crtc(crtc.id, DrmFb::NONE, 0, 0, &[], None) {
                log::warn!("Could not turn off crtc {}: {}", crtc.id, ErrorFmt(e));
            }
        }
        Ok(())
    }

    fn flip(
        &self,
        kernel: &dyn KmsKernel,
        crtc: &Crtc,
        fb: DrmFb,
        user_data: u64,
    ) -> Result<(), OsError> {
        kernel.page_flip(crtc.id, fb, DRM_MODE_PAGE_FLIP_EVENT, user_data)
    }
}

pub struct ModeSetter {
    kernel: Rc<dyn KmsKernel>,
    allocator: Option<Rc<dyn Allocator>>,
    backend: Box<dyn CommitBackend>,
}

fn plane_rotates(crtc: &Crtc) -> bool {
    match &crtc.plane {
        Some(p) => p.props.is_present(PlaneProp::Rotation),
        None => false,
    }
}

impl ModeSetter {
    pub fn new(
        kernel: &Rc<dyn KmsKernel>,
        atomic: bool,
        allocator: Option<Rc<dyn Allocator>>,
    ) -> Self {
        let backend: Box<dyn CommitBackend> = match atomic {
            true => Box::new(AtomicBackend),
            false => Box::new(LegacyBackend),
        };
        Self {
            kernel: kernel.clone(),
            allocator,
            backend,
        }
    }

    pub fn is_atomic(&self) -> bool {
        self.backend.is_atomic()
    }

    fn validate(
        &self,
        crtc: &Crtc,
        req: &ModeRequest,
        outputs: &[Rc<Output>],
        fb: &Framebuffer,
    ) -> Result<(), ModesetError> {
        if outputs.is_empty() {
            return Err(ModesetError::NoOutputs);
        }
        for output in outputs {
            if output.is_removed() {
                return Err(ModesetError::OutputRemoved(output.name.clone()));
            }
            if !output.is_connected() {
                return Err(ModesetError::OutputDisconnected(output.name.clone()));
            }
            if crtc.idx >= 32 || output.possible_crtcs.get() & (1 << crtc.idx) == 0 {
                return Err(ModesetError::CrtcNotPossible(output.name.clone(), crtc.id));
            }
        }
        if self.is_atomic() && crtc.plane.is_none() {
            return Err(ModesetError::NoPlane(crtc.id));
        }
        let (sw, sh) = req.rotation.source_size(&req.mode);
        if req.x as u64 + sw as u64 > fb.bo.width as u64
            || req.y as u64 + sh as u64 > fb.bo.height as u64
        {
            return Err(ModesetError::OutOfBounds);
        }
        Ok(())
    }

    /// Returns the buffer scanned out in place of the caller's when the
    /// plane cannot rotate.
    ///
    /// The shadow has the size of the mode and is scanned out unrotated. The
    /// caller renders the rotated image into it.
    fn shadow_for(
        &self,
        crtc: &Crtc,
        req: &ModeRequest,
        fb: &Framebuffer,
    ) -> Result<Option<Rc<Framebuffer>>, ModesetError> {
        if req.rotation == Rotation::Normal || plane_rotates(crtc) {
            return Ok(None);
        }
        let (width, height) = (req.mode.hdisplay as u32, req.mode.vdisplay as u32);
        if let Some(old) = crtc.rotate.get() {
            if (old.bo.width, old.bo.height, old.bo.format) == (width, height, fb.bo.format) {
                return Ok(Some(old));
            }
        }
        let alloc = AllocRequest {
            width,
            height,
            bpp: fb.bo.bpp,
            format: fb.bo.format,
            usage: BO_USE_SCANOUT | BO_USE_RENDERING,
        };
        let shadow = allocate_scanout(&self.kernel, self.allocator.as_deref(), &alloc, &[])
            .map_err(ModesetError::Shadow)?;
        log::debug!(
            "Crtc {} rotates through a {}x{} shadow buffer",
            crtc.id,
            width,
            height
        );
        Ok(Some(shadow))
    }

    /// Programs `req` on `crtc` and routes `outputs` to it.
    ///
    /// Crtcs left without outputs are disabled in the same commit. On failure
    /// the crtc keeps its previous state and no cached value changes.
    pub fn set_mode(
        &self,
        res: &Resources,
        crtc: &Rc<Crtc>,
        req: &ModeRequest,
        outputs: &[Rc<Output>],
        fb: &Rc<Framebuffer>,
    ) -> Result<(), ModesetError> {
        self.validate(crtc, req, outputs, fb)?;
        let shadow = self.shadow_for(crtc, req, fb)?;
        let kernel = &*self.kernel;
        let (blob, created) = match self.is_atomic() {
            true => crtc
                .blobs
                .ensure(kernel, &req.mode)
                .map_err(ModesetError::CreateBlob)?,
            false => (DrmBlob::NONE, false),
        };
        let in_list = |o: &Rc<Output>| outputs.iter().any(|n| Rc::ptr_eq(n, o));
        let mut plan = CommitPlan::default();
        let mut orphans = vec![];
        for other in &res.crtcs {
            if other.id == crtc.id {
                continue;
            }
            let bound = res.outputs_of(other.id);
            if bound.is_empty() || !bound.iter().all(in_list) {
                continue;
            }
            if other.state.get() != CrtcState::Disabled {
                plan.disable.push(other.clone());
            }
            orphans.push(other.clone());
        }
        plan.unbind = res
            .outputs_of(crtc.id)
            .into_iter()
            .filter(|o| !in_list(o))
            .collect();
        let (scan_fb, scan_req) = match &shadow {
            Some(shadow) => (
                shadow.id,
                ModeRequest {
                    mode: req.mode.clone(),
                    x: 0,
                    y: 0,
                    rotation: Rotation::Normal,
                },
            ),
            None => (fb.id, req.clone()),
        };
        plan.enable.push(CrtcEnable {
            crtc: crtc.clone(),
            blob,
            req: scan_req,
            fb: scan_fb,
            outputs: outputs.to_vec(),
        });
        let prev = crtc.state.get();
        let fail = |e: ModesetError| -> Result<(), ModesetError> {
            plan.discard();
            crtc.state.set(prev);
            if created {
                crtc.blobs.discard(kernel, blob);
            }
            log::warn!("Mode-set of crtc {} failed: {}", crtc.id, ErrorFmt(&e));
            Err(e)
        };
        if self.backend.supports_test() {
            crtc.state.set(CrtcState::Testing);
            if let Err(e) = self.backend.submit(kernel, &plan, true) {
                return fail(ModesetError::Test(e));
            }
            plan.discard();
        }
        crtc.state.set(CrtcState::PendingCommit);
        if let Err(e) = self.backend.submit(kernel, &plan, false) {
            return fail(ModesetError::Commit(e));
        }
        plan.apply();
        for output in &plan.unbind {
            output.crtc.set(None);
        }
        for orphan in &orphans {
            log::info!("Crtc {} lost all of its outputs", orphan.id);
            orphan.state.set(CrtcState::Disabled);
            orphan.needs_modeset.set(true);
            orphan.desired.take();
            orphan.scanout.take();
            orphan.rotate.take();
            orphan.blobs.release_all(kernel);
        }
        for output in outputs {
            output.crtc.set(Some(crtc.id));
            if !self.is_atomic() && output.dpms.get() != DpmsMode::On {
                self.set_output_dpms(output, DpmsMode::On);
            }
            output.dpms.set(DpmsMode::On);
        }
        crtc.state.set(CrtcState::Active);
        crtc.dpms.set(DpmsMode::On);
        crtc.needs_modeset.set(false);
        *crtc.desired.borrow_mut() = Some(req.clone());
        crtc.scanout.set(Some(fb.clone()));
        crtc.rotate.set(shadow);
        if self.is_atomic() {
            crtc.blobs.mark_committed(blob);
            let referenced: Vec<_> = res
                .crtcs
                .iter()
                .map(|c| c.props.blob(CrtcProp::ModeId))
                .filter(|b| b.is_some())
                .collect();
            crtc.blobs.supersede(kernel, &referenced);
        }
        log::info!(
            "Crtc {} now shows {} on {}",
            crtc.id,
            req.mode,
            outputs
                .iter()
                .map(|o| o.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(())
    }

    /// Turns a crtc off and releases its outputs and scanout buffer.
    pub fn disable(&self, res: &Resources, crtc: &Rc<Crtc>) -> Result<(), ModesetError> {
        let plan = CommitPlan {
            enable: vec![],
            disable: vec![crtc.clone()],
            unbind: res.outputs_of(crtc.id),
        };
        if let Err(e) = self.backend.submit(&*self.kernel, &plan, false) {
            plan.discard();
            return Err(ModesetError::Commit(e));
        }
        plan.apply();
        self.forget(res, crtc);
        Ok(())
    }

    /// Drops every record of what `crtc` shows without talking to the
    /// kernel. Used when another client takes the crtc over.
    pub fn forget(&self, res: &Resources, crtc: &Crtc) {
        for output in res.outputs_of(crtc.id) {
            output.crtc.set(None);
        }
        crtc.state.set(CrtcState::Disabled);
        crtc.dpms.set(DpmsMode::Off);
        crtc.needs_modeset.set(true);
        crtc.desired.take();
        crtc.scanout.take();
        crtc.rotate.take();
        crtc.blobs.release_all(&*self.kernel);
    }

    fn set_output_dpms(&self, output: &Output, mode: DpmsMode) {
        let props = output.props.get();
        let Some(value) = props.enum_value(ConnectorProp::Dpms, mode.index()) else {
            return;
        };
        if let Err(e) = props.set_now(&*self.kernel, ConnectorProp::Dpms, value) {
            log::warn!(
                "Could not set the DPMS state of {}: {}",
                output.name,
                ErrorFmt(e)
            );
        }
    }

    /// Changes the power state of a crtc and its outputs.
    ///
    /// Turning an atomic crtc back on replays its desired mode with the
    /// scanout buffer it had before.
    pub fn set_dpms(
        &self,
        res: &Resources,
        crtc: &Rc<Crtc>,
        mode: DpmsMode,
    ) -> Result<(), ModesetError> {
        let outputs = res.outputs_of(crtc.id);
        if !self.is_atomic() {
            for output in &outputs {
                self.set_output_dpms(output, mode);
                output.dpms.set(mode);
            }
            crtc.dpms.set(mode);
            return Ok(());
        }
        if mode == DpmsMode::On {
            if crtc.state.get() == CrtcState::Active {
                crtc.dpms.set(mode);
                return Ok(());
            }
            let Some(req) = crtc.desired_mode() else {
                crtc.dpms.set(mode);
                return Ok(());
            };
            let Some(fb) = crtc.scanout.get() else {
                return Err(ModesetError::NoFramebuffer(crtc.id));
            };
            return self.set_mode(res, crtc, &req, &outputs, &fb);
        }
        if crtc.state.get() != CrtcState::Disabled {
            let plan = CommitPlan {
                enable: vec![],
                disable: vec![crtc.clone()],
                unbind: outputs.clone(),
            };
            if let Err(e) = self.backend.submit(&*self.kernel, &plan, false) {
                plan.discard();
                return Err(ModesetError::Commit(e));
            }
            plan.apply();
            crtc.state.set(CrtcState::Disabled);
            crtc.needs_modeset.set(true);
        }
        crtc.dpms.set(mode);
        for output in &outputs {
            output.dpms.set(mode);
        }
        Ok(())
    }

    /// Queues a page flip to `fb` that completes with a flip event.
    ///
    /// Crtcs that rotate through a shadow buffer cannot flip.
    pub fn flip(&self, crtc: &Crtc, fb: &Framebuffer, user_data: u64) -> Result<(), OsError> {
        if crtc.rotate.get().is_some() {
            return Err(OsError(c::EOPNOTSUPP));
        }
        self.backend.flip(&*self.kernel, crtc, fb.id, user_data)
    }
}
