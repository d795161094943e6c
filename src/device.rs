//! The device handle: one per display adapter.
//!
//! A device owns the resource records, the mode setter and the vblank queue of
//! one kernel device. Everything runs on the thread that owns the event loop
//! the device is registered with. Callers talk to it through two surfaces:
//!
//! - the presentation layer requests mode sets, flips, vblanks, DPMS changes
//!   and shared-buffer flipping;
//! - the hotplug layer reports added and removed connectors and generic
//!   device changes, after which listeners receive
//!   [`DeviceEvent::ConfigurationChanged`].

use {
    crate::{
        bo::{
            AllocRequest, Allocator, BO_USE_RENDERING, BO_USE_SCANOUT, BoError, BufferObject,
            Framebuffer, allocate_scanout,
        },
        color::{self, ColorError, ColorPath},
        config::KmsConfig,
        cursor::{CursorError, DEFAULT_CURSOR_SIZE, HwCursor},
        event_loop::{EventLoop, EventLoopDispatcher, EventLoopError, EventLoopId},
        kernel::{ErrorKind, KmsKernel},
        lease::{Lease, LeaseError, Leases},
        modeset::{CrtcState, DpmsMode, ModeRequest, ModeSetter, ModesetError},
        resources::{Crtc, Output, ResourceError, Resources},
        shared_flip::SharedFlipper,
        utils::{clonecell::CloneCell, errorfmt::ErrorFmt, oserror::OsError},
        vblank::{QueueMode, VblankError, VblankHandle, VblankQueue, VblankResult},
        video::{
            XRGB8888, depth_for_bpp,
            drm::{
                DRM_CLIENT_CAP_ATOMIC, DRM_CLIENT_CAP_UNIVERSAL_PLANES, DrmBlob, DrmConnector,
                DrmCrtc, DrmObject, log_drop_error, sys,
            },
            format_for_depth,
        },
    },
    std::{
        cell::{Cell, RefCell},
        error::Error,
        fmt::{Debug, Formatter},
        rc::Rc,
    },
    thiserror::Error,
    uapi::{OwnedFd, c},
};

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Could not discover the device resources")]
    Resources(#[source] ResourceError),
    #[error(transparent)]
    Modeset(ModesetError),
    #[error(transparent)]
    Vblank(VblankError),
    #[error(transparent)]
    Cursor(CursorError),
    #[error(transparent)]
    Color(ColorError),
    #[error("Could not allocate the front buffer")]
    Front(#[source] BoError),
    #[error("Could not import a shared buffer")]
    Import(#[source] BoError),
    #[error("Could not flip crtc {0}")]
    Flip(DrmCrtc, #[source] OsError),
    #[error(transparent)]
    Lease(LeaseError),
    #[error("Crtc {0} does not exist")]
    UnknownCrtc(DrmCrtc),
    #[error("Crtc {0} is leased to another client")]
    CrtcLeased(DrmCrtc),
    #[error("Connector {0} does not exist")]
    UnknownConnector(DrmConnector),
    #[error("Crtc {0} is not active")]
    CrtcInactive(DrmCrtc),
    #[error("Crtc {0} is flipping shared buffers")]
    SharedFlipActive(DrmCrtc),
    #[error("Page flips are disabled")]
    FlipsDisabled,
    #[error("Crtc {0} rotates through a shadow buffer and cannot flip")]
    ShadowRotated(DrmCrtc),
    #[error("There is no front buffer")]
    NoFrontBuffer,
    #[error("A {0}x{1} front buffer is out of range")]
    FrontSize(u32, u32),
    #[error("{0} bits per pixel are not supported")]
    UnsupportedBpp(u32),
    #[error("The device file descriptor hung up")]
    Hangup,
    #[error("The device has been detached")]
    Detached,
}

impl DeviceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeviceError::Resources(e) => e.kind(),
            DeviceError::Modeset(e) => e.kind(),
            DeviceError::Vblank(e) => e.kind(),
            DeviceError::Cursor(e) => e.kind(),
            DeviceError::Color(e) => e.kind(),
            DeviceError::Lease(e) => e.kind(),
            DeviceError::Front(e) | DeviceError::Import(e) => e.kind(),
            DeviceError::Flip(_, e) => ErrorKind::from_os(*e),
            DeviceError::UnknownCrtc(_)
            | DeviceError::UnknownConnector(_)
            | DeviceError::Hangup
            | DeviceError::Detached => ErrorKind::Disconnected,
            DeviceError::FlipsDisabled
            | DeviceError::ShadowRotated(_)
            | DeviceError::UnsupportedBpp(_) => ErrorKind::Unsupported,
            DeviceError::CrtcInactive(_)
            | DeviceError::SharedFlipActive(_)
            | DeviceError::CrtcLeased(_)
            | DeviceError::NoFrontBuffer
            | DeviceError::FrontSize(..) => ErrorKind::KernelRejected,
        }
    }
}

/// Notifications for the layer above the device.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DeviceEvent {
    OutputAdded(String),
    OutputRemoved(String),
    ConfigurationChanged,
}

type Listener = Rc<dyn Fn(&DeviceEvent)>;

pub struct Device {
    kernel: Rc<dyn KmsKernel>,
    config: KmsConfig,
    allocator: Option<Rc<dyn Allocator>>,
    res: Resources,
    queue: Rc<VblankQueue>,
    setter: Rc<ModeSetter>,
    leases: Leases,
    front: CloneCell<Option<Rc<Framebuffer>>>,
    cursor_size: (u32, u32),
    sw_cursor: Cell<bool>,
    listeners: RefCell<Vec<Listener>>,
    detached: Cell<bool>,
}

impl Debug for Device {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("atomic", &self.setter.is_atomic())
            .field("crtcs", &self.res.crtcs.len())
            .field("sw_cursor", &self.sw_cursor.get())
            .field("detached", &self.detached.get())
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Discovers the device and brings it into a known state.
    ///
    /// Crtcs that drive no known output are turned off.
    pub fn attach(
        kernel: &Rc<dyn KmsKernel>,
        config: &KmsConfig,
        allocator: Option<Rc<dyn Allocator>>,
    ) -> Result<Rc<Self>, DeviceError> {
        if let Err(e) = kernel.set_client_cap(DRM_CLIENT_CAP_UNIVERSAL_PLANES, 1) {
            log::warn!("Kernel does not expose universal planes: {}", ErrorFmt(e));
        }
        let atomic = match config.atomic {
            false => {
                log::info!("Atomic mode-setting is disabled");
                false
            }
            true => match kernel.set_client_cap(DRM_CLIENT_CAP_ATOMIC, 1) {
                Ok(()) => true,
                Err(e) => {
                    log::info!("Kernel does not support atomic mode-setting: {}", ErrorFmt(e));
                    false
                }
            },
        };
        let queue = Rc::new(VblankQueue::new(kernel, config.busy_retries));
        let res = Resources::discover(kernel, &queue, config.claimed_crtcs)
            .map_err(DeviceError::Resources)?;
        let cap = |cap| match kernel.get_cap(cap) {
            Ok(v) if v > 0 => v as u32,
            _ => DEFAULT_CURSOR_SIZE,
        };
        let cursor_size = (
            cap(sys::DRM_CAP_CURSOR_WIDTH),
            cap(sys::DRM_CAP_CURSOR_HEIGHT),
        );
        let setter = Rc::new(ModeSetter::new(kernel, atomic, allocator.clone()));
        let slf = Rc::new(Self {
            kernel: kernel.clone(),
            config: config.clone(),
            allocator,
            res,
            queue,
            setter,
            leases: Default::default(),
            front: Default::default(),
            cursor_size,
            sw_cursor: Cell::new(config.sw_cursor),
            listeners: Default::default(),
            detached: Cell::new(false),
        });
        if !slf.sw_cursor.get() {
            slf.allocate_cursors();
        }
        slf.disable_unused_crtcs();
        log::info!(
            "Attached a {} device with {} crtcs, {} outputs and {} planes",
            if atomic { "atomic" } else { "legacy" },
            slf.res.crtcs.len(),
            slf.res.outputs().len(),
            slf.res.planes.len(),
        );
        Ok(slf)
    }

    fn allocate_cursors(&self) {
        let (width, height) = self.cursor_size;
        for crtc in &self.res.crtcs {
            match HwCursor::allocate(&self.kernel, width, height) {
                Ok(c) => {
                    crtc.cursor.set(Some(Rc::new(c)));
                }
                Err(e) => {
                    log::warn!("Could not allocate a cursor buffer: {}", ErrorFmt(e));
                    self.use_sw_cursor();
                    return;
                }
            }
        }
    }

    fn use_sw_cursor(&self) {
        if self.sw_cursor.replace(true) {
            return;
        }
        log::info!("Falling back to software cursors");
        for crtc in &self.res.crtcs {
            crtc.cursor.take();
        }
    }

    fn disable_unused_crtcs(&self) {
        for crtc in &self.res.crtcs {
            if self.res.is_claimed(crtc) || !self.res.outputs_of(crtc.id).is_empty() {
                continue;
            }
            if let Err(e) = self.setter.disable(&self.res, crtc) {
                log::warn!("Could not disable unused crtc {}: {}", crtc.id, ErrorFmt(e));
            }
        }
    }

    /// Releases everything the device holds in the kernel.
    pub fn detach(&self) {
        if self.detached.replace(true) {
            return;
        }
        self.leases.revoke_all(&*self.kernel, &self.res);
        for crtc in &self.res.crtcs {
            if let Some(flipper) = crtc.shared.take() {
                flipper.stop();
            }
            if let Some(cursor) = crtc.cursor.take() {
                if cursor.is_visible() {
                    if let Err(e) = cursor.hide(&*self.kernel, crtc.id) {
                        log::warn!("Could not hide the cursor: {}", ErrorFmt(e));
                    }
                }
            }
        }
        self.queue.abort_all(|_, _, _| true);
        for crtc in &self.res.crtcs {
            crtc.scanout.take();
            crtc.rotate.take();
            crtc.blobs.release_all(&*self.kernel);
            for slot in [&crtc.gamma_blob, &crtc.ctm_blob] {
                let blob = slot.replace(DrmBlob::NONE);
                if blob.is_some() {
                    log_drop_error("destroy a blob", self.kernel.destroy_blob(blob));
                }
            }
            self.queue.unregister_crtc(crtc.id);
        }
        self.front.take();
        self.listeners.borrow_mut().clear();
        log::info!("Detached the device");
    }

    /// Lets `el` dispatch kernel events of this device.
    pub fn register(self: &Rc<Self>, el: &EventLoop) -> Result<EventLoopId, EventLoopError> {
        el.insert(self.kernel.fd(), c::EPOLLIN as u32, self.clone())
    }

    pub fn kernel(&self) -> &Rc<dyn KmsKernel> {
        &self.kernel
    }

    pub fn resources(&self) -> &Resources {
        &self.res
    }

    pub fn config(&self) -> &KmsConfig {
        &self.config
    }

    pub fn is_atomic(&self) -> bool {
        self.setter.is_atomic()
    }

    pub fn is_detached(&self) -> bool {
        self.detached.get()
    }

    pub fn cursor_size(&self) -> (u32, u32) {
        self.cursor_size
    }

    pub fn is_sw_cursor(&self) -> bool {
        self.sw_cursor.get()
    }

    pub fn front(&self) -> Option<Rc<Framebuffer>> {
        self.front.get()
    }

    pub fn add_listener(&self, listener: impl Fn(&DeviceEvent) + 'static) {
        self.listeners.borrow_mut().push(Rc::new(listener));
    }

    fn emit(&self, event: DeviceEvent) {
        let listeners = self.listeners.borrow().clone();
        for listener in listeners {
            listener(&event);
        }
    }

    fn check_attached(&self) -> Result<(), DeviceError> {
        match self.detached.get() {
            true => Err(DeviceError::Detached),
            false => Ok(()),
        }
    }

    fn crtc(&self, id: DrmCrtc) -> Result<Rc<Crtc>, DeviceError> {
        self.check_attached()?;
        let crtc = self.res.crtc(id).ok_or(DeviceError::UnknownCrtc(id))?;
        if self.res.is_claimed(&crtc) {
            return Err(DeviceError::CrtcLeased(id));
        }
        Ok(crtc)
    }

    fn active_crtc(&self, id: DrmCrtc) -> Result<Rc<Crtc>, DeviceError> {
        let crtc = self.crtc(id)?;
        if !crtc.is_active() {
            return Err(DeviceError::CrtcInactive(id));
        }
        Ok(crtc)
    }

    fn allocate_front(&self, width: u32, height: u32) -> Result<Rc<Framebuffer>, DeviceError> {
        let (max_width, max_height) = self.res.max_size;
        if width == 0
            || height == 0
            || (max_width > 0 && width > max_width)
            || (max_height > 0 && height > max_height)
        {
            return Err(DeviceError::FrontSize(width, height));
        }
        let bpp = self.config.front_bpp;
        let Some(format) = format_for_depth(bpp, depth_for_bpp(bpp)) else {
            return Err(DeviceError::UnsupportedBpp(bpp));
        };
        let modifiers: Vec<_> = match self.config.use_modifiers {
            true => self.res.common_modifiers(format).into_iter().collect(),
            false => vec![],
        };
        let req = AllocRequest {
            width,
            height,
            bpp,
            format,
            usage: BO_USE_SCANOUT | BO_USE_RENDERING,
        };
        let fb = allocate_scanout(&self.kernel, self.allocator.as_deref(), &req, &modifiers)
            .map_err(DeviceError::Front)?;
        log::debug!("Allocated a {}x{} front buffer", width, height);
        Ok(fb)
    }

    pub fn create_front(&self, width: u32, height: u32) -> Result<Rc<Framebuffer>, DeviceError> {
        self.check_attached()?;
        let fb = self.allocate_front(width, height)?;
        self.front.set(Some(fb.clone()));
        Ok(fb)
    }

    /// Replaces the front buffer and moves every active crtc onto it.
    ///
    /// If any crtc cannot be moved, the crtcs moved so far get their previous
    /// buffer back and the old front buffer stays in place.
    pub fn resize_front(&self, width: u32, height: u32) -> Result<(), DeviceError> {
        self.check_attached()?;
        let old = self.front.get();
        if let Some(old) = &old {
            if (old.bo.width, old.bo.height) == (width, height) {
                return Ok(());
            }
        }
        let new = self.allocate_front(width, height)?;
        let mut moved: Vec<(Rc<Crtc>, ModeRequest, Vec<Rc<Output>>, Option<Rc<Framebuffer>>)> =
            vec![];
        for crtc in &self.res.crtcs {
            if !crtc.is_active() || crtc.shared.get().is_some() || self.res.is_claimed(crtc) {
                continue;
            }
            let Some(req) = crtc.desired_mode() else {
                continue;
            };
            let outputs = self.res.outputs_of(crtc.id);
            if outputs.is_empty() {
                continue;
            }
            let prev = crtc.scanout.get().or_else(|| old.clone());
            if let Err(e) = self.setter.set_mode(&self.res, crtc, &req, &outputs, &new) {
                log::warn!(
                    "Could not resize the front buffer to {}x{}, restoring the old one",
                    width,
                    height
                );
                for (crtc, req, outputs, prev) in moved.iter().rev() {
                    let Some(prev) = prev else {
                        continue;
                    };
                    if let Err(e) = self.setter.set_mode(&self.res, crtc, req, outputs, prev) {
                        log::error!("Could not restore crtc {}: {}", crtc.id, ErrorFmt(e));
                    }
                }
                return Err(DeviceError::Modeset(e));
            }
            moved.push((crtc.clone(), req, outputs, prev));
        }
        self.front.set(Some(new));
        Ok(())
    }

    fn abort_inactive(&self) {
        let inactive: Vec<_> = self
            .res
            .crtcs
            .iter()
            .filter(|c| !c.is_active())
            .map(|c| c.id)
            .collect();
        if inactive.is_empty() {
            return;
        }
        for id in &inactive {
            if let Some(crtc) = self.res.crtc(*id) {
                if let Some(flipper) = crtc.shared.take() {
                    flipper.stop();
                }
            }
        }
        self.queue.abort_all(|_, c, _| inactive.contains(&c));
    }

    /// Shows the front buffer on `crtc` with the requested mode.
    pub fn set_mode(
        &self,
        crtc: DrmCrtc,
        req: &ModeRequest,
        outputs: &[Rc<Output>],
    ) -> Result<(), DeviceError> {
        let crtc = self.crtc(crtc)?;
        if let Some(o) = outputs.iter().find(|o| o.leased.get()) {
            return Err(DeviceError::Lease(LeaseError::OutputLeased(o.name.clone())));
        }
        let Some(fb) = self.front.get() else {
            return Err(DeviceError::NoFrontBuffer);
        };
        self.setter
            .set_mode(&self.res, &crtc, req, outputs, &fb)
            .map_err(DeviceError::Modeset)?;
        self.abort_inactive();
        Ok(())
    }

    pub fn disable_crtc(&self, crtc: DrmCrtc) -> Result<(), DeviceError> {
        let crtc = self.crtc(crtc)?;
        self.shut_down(&crtc)
    }

    fn shut_down(&self, crtc: &Rc<Crtc>) -> Result<(), DeviceError> {
        if let Some(flipper) = crtc.shared.take() {
            flipper.stop();
        }
        let id = crtc.id;
        self.queue.abort_all(|_, c, _| c == id);
        if let Some(cursor) = crtc.cursor.get() {
            if cursor.is_visible() {
                if let Err(e) = cursor.hide(&*self.kernel, id) {
                    log::warn!("Could not hide the cursor of crtc {}: {}", id, ErrorFmt(e));
                }
            }
        }
        self.setter
            .disable(&self.res, crtc)
            .map_err(DeviceError::Modeset)
    }

    pub fn set_dpms(&self, crtc: DrmCrtc, mode: DpmsMode) -> Result<(), DeviceError> {
        let crtc = self.crtc(crtc)?;
        if mode != DpmsMode::On {
            if let Some(flipper) = crtc.shared.take() {
                flipper.stop();
            }
            let id = crtc.id;
            self.queue.abort_all(|_, c, _| c == id);
        }
        self.setter
            .set_dpms(&self.res, &crtc, mode)
            .map_err(DeviceError::Modeset)?;
        log::debug!("Crtc {} is now in DPMS state {:?}", crtc.id, mode);
        Ok(())
    }

    /// Re-applies the desired mode of every crtc that is switched on and
    /// turns off crtcs without outputs.
    pub fn set_desired_modes(&self) -> Result<(), DeviceError> {
        self.check_attached()?;
        if let Err(e) = self.validate_leases() {
            log::warn!("Could not validate the leases: {}", ErrorFmt(e));
        }
        let mut res = Ok(());
        for crtc in &self.res.crtcs {
            if self.res.is_claimed(crtc) {
                continue;
            }
            let outputs = self.res.outputs_of(crtc.id);
            let result = match crtc.desired_mode() {
                _ if outputs.is_empty() => match crtc.state.get() {
                    CrtcState::Disabled => Ok(()),
                    _ => self.shut_down(crtc),
                },
                Some(req) if crtc.dpms.get() == DpmsMode::On => {
                    match self.front.get().or_else(|| crtc.scanout.get()) {
                        Some(fb) => self
                            .setter
                            .set_mode(&self.res, crtc, &req, &outputs, &fb)
                            .map_err(DeviceError::Modeset),
                        None => Err(DeviceError::NoFrontBuffer),
                    }
                }
                _ => Ok(()),
            };
            if let Err(e) = result {
                log::warn!("Could not restore crtc {}: {}", crtc.id, ErrorFmt(&e));
                if res.is_ok() {
                    res = Err(e);
                }
            }
        }
        self.abort_inactive();
        res
    }

    /// Flips `crtc` to `fb`.
    ///
    /// The completion receives `Aborted` if the flip is dropped. That has
    /// already happened when this returns an error.
    pub fn request_flip(
        &self,
        crtc: DrmCrtc,
        fb: &Rc<Framebuffer>,
        completion: impl FnOnce(VblankResult) + 'static,
    ) -> Result<VblankHandle, DeviceError> {
        let crtc = match self.flip_target(crtc) {
            Ok(c) => c,
            Err(e) => {
                completion(VblankResult::Aborted);
                return Err(e);
            }
        };
        let weak = Rc::downgrade(&crtc);
        let shown = fb.clone();
        let handle = self
            .queue
            .add_flip(crtc.id, move |res| {
                if let VblankResult::Completed { .. } = res {
                    if let Some(crtc) = weak.upgrade() {
                        crtc.scanout.set(Some(shown));
                    }
                }
                completion(res);
            })
            .map_err(DeviceError::Vblank)?;
        if let Err(e) = self.setter.flip(&crtc, fb, handle.user_data()) {
            log::debug!("Dropping a frame on crtc {}: {}", crtc.id, ErrorFmt(e));
            self.queue.abort(handle);
            return Err(DeviceError::Flip(crtc.id, e));
        }
        Ok(handle)
    }

    fn flip_target(&self, crtc: DrmCrtc) -> Result<Rc<Crtc>, DeviceError> {
        let crtc = self.active_crtc(crtc)?;
        if !self.config.page_flip {
            return Err(DeviceError::FlipsDisabled);
        }
        if crtc.shared.get().is_some() {
            return Err(DeviceError::SharedFlipActive(crtc.id));
        }
        if crtc.rotate.get().is_some() {
            return Err(DeviceError::ShadowRotated(crtc.id));
        }
        Ok(crtc)
    }

    /// Calls `completion` at a future vblank of `crtc`.
    ///
    /// On error the completion has already received `Aborted`.
    pub fn queue_vblank(
        &self,
        crtc: DrmCrtc,
        mode: QueueMode,
        target: u64,
        completion: impl FnOnce(VblankResult) + 'static,
    ) -> Result<VblankHandle, DeviceError> {
        let crtc = match self.active_crtc(crtc) {
            Ok(c) => c,
            Err(e) => {
                completion(VblankResult::Aborted);
                return Err(e);
            }
        };
        self.queue
            .queue(crtc.id, mode, target, completion)
            .map_err(DeviceError::Vblank)
    }

    pub fn abort_vblank(&self, handle: VblankHandle) -> bool {
        self.queue.abort(handle)
    }

    pub fn pending_vblanks(&self) -> usize {
        self.queue.pending()
    }

    pub fn enable_shared_flip(
        &self,
        crtc: DrmCrtc,
        front: &Rc<Framebuffer>,
        back: &Rc<Framebuffer>,
    ) -> Result<(), DeviceError> {
        let crtc = self.active_crtc(crtc)?;
        if !self.config.page_flip {
            return Err(DeviceError::FlipsDisabled);
        }
        if crtc.rotate.get().is_some() {
            return Err(DeviceError::ShadowRotated(crtc.id));
        }
        if let Some(old) = crtc.shared.take() {
            old.stop();
        }
        let flipper = SharedFlipper::new(&crtc, &self.setter, &self.queue, front, back);
        flipper.start();
        crtc.shared.set(Some(flipper));
        log::debug!("Shared flipping enabled on crtc {}", crtc.id);
        Ok(())
    }

    pub fn disable_shared_flip(&self, crtc: DrmCrtc) -> Result<(), DeviceError> {
        let crtc = self.crtc(crtc)?;
        if let Some(flipper) = crtc.shared.take() {
            flipper.stop();
            log::debug!("Shared flipping disabled on crtc {}", crtc.id);
        }
        Ok(())
    }

    /// Wraps a buffer exported by another device as a 32 bpp buffer object.
    pub fn import_shared_buffer(
        &self,
        fd: c::c_int,
        width: u32,
        height: u32,
        pitch: u32,
    ) -> Result<Rc<BufferObject>, DeviceError> {
        self.check_attached()?;
        let bo = BufferObject::import(&self.kernel, fd, width, height, pitch, 32, XRGB8888)
            .map_err(DeviceError::Import)?;
        Ok(Rc::new(bo))
    }

    /// Reads and dispatches pending kernel events.
    pub fn dispatch_events(&self) -> Result<usize, DeviceError> {
        if self.detached.get() {
            return Ok(0);
        }
        self.queue.dispatch().map_err(DeviceError::Vblank)
    }

    pub fn on_connector_added(&self, id: DrmConnector) -> Result<(), DeviceError> {
        self.check_attached()?;
        let output = self
            .res
            .add_connector(id)
            .map_err(DeviceError::Resources)?;
        self.emit(DeviceEvent::OutputAdded(output.name.clone()));
        self.emit(DeviceEvent::ConfigurationChanged);
        Ok(())
    }

    pub fn on_connector_removed(&self, id: DrmConnector) -> Result<(), DeviceError> {
        self.check_attached()?;
        let Some(output) = self.res.output_by_connector(id) else {
            return Err(DeviceError::UnknownConnector(id));
        };
        let crtc = output.crtc.get();
        self.res.remove_connector(id);
        if let Some(crtc) = crtc.and_then(|c| self.res.crtc(c)) {
            self.release_if_unused(&crtc);
        }
        self.emit(DeviceEvent::OutputRemoved(output.name.clone()));
        self.emit(DeviceEvent::ConfigurationChanged);
        Ok(())
    }

    fn release_if_unused(&self, crtc: &Rc<Crtc>) {
        if !self.res.outputs_of(crtc.id).is_empty()
            || crtc.state.get() == CrtcState::Disabled
            || self.res.is_claimed(crtc)
        {
            return;
        }
        log::info!("Crtc {} lost all of its outputs", crtc.id);
        if let Err(e) = self.shut_down(crtc) {
            log::warn!("Could not disable crtc {}: {}", crtc.id, ErrorFmt(e));
        }
    }

    /// Re-reads the device after the hotplug layer reported a change.
    ///
    /// Crtcs that lost their outputs are turned off and outputs whose link
    /// went bad are mode-set again.
    pub fn on_device_event(&self) -> Result<(), DeviceError> {
        self.check_attached()?;
        let report = self.res.rescan().map_err(DeviceError::Resources)?;
        for crtc in &self.res.crtcs {
            self.release_if_unused(crtc);
        }
        for output in &report.link_bad {
            self.retrain(output);
        }
        for output in &report.removed {
            self.emit(DeviceEvent::OutputRemoved(output.name.clone()));
        }
        for output in &report.added {
            self.emit(DeviceEvent::OutputAdded(output.name.clone()));
        }
        if let Err(e) = self.leases.validate(&*self.kernel, &self.res) {
            log::warn!("Could not validate the leases: {}", ErrorFmt(e));
        }
        self.emit(DeviceEvent::ConfigurationChanged);
        Ok(())
    }

    /// Leases `crtcs` and `outputs` to a new client and returns the lease
    /// together with the lessee's file descriptor.
    ///
    /// The leased crtcs keep showing whatever they showed until the lessee
    /// programs them. This device stops driving them.
    pub fn create_lease(
        &self,
        crtcs: &[DrmCrtc],
        outputs: &[Rc<Output>],
    ) -> Result<(Rc<Lease>, OwnedFd), DeviceError> {
        self.check_attached()?;
        let crtcs = crtcs
            .iter()
            .map(|&id| self.crtc(id))
            .collect::<Result<Vec<_>, _>>()?;
        let (lease, fd) = self
            .leases
            .create(&*self.kernel, &self.res, self.is_atomic(), &crtcs, outputs)
            .map_err(DeviceError::Lease)?;
        for crtc in &lease.crtcs {
            self.hand_over(crtc);
        }
        for output in &lease.outputs {
            let Some(crtc) = output.crtc.take().and_then(|c| self.res.crtc(c)) else {
                continue;
            };
            self.release_if_unused(&crtc);
        }
        self.emit(DeviceEvent::ConfigurationChanged);
        Ok((lease, fd))
    }

    fn hand_over(&self, crtc: &Rc<Crtc>) {
        if let Some(flipper) = crtc.shared.take() {
            flipper.stop();
        }
        let id = crtc.id;
        self.queue.abort_all(|_, c, _| c == id);
        if let Some(cursor) = crtc.cursor.get() {
            if cursor.is_visible() {
                if let Err(e) = cursor.hide(&*self.kernel, id) {
                    log::warn!("Could not hide the cursor of crtc {}: {}", id, ErrorFmt(e));
                }
            }
        }
        self.setter.forget(&self.res, crtc);
        log::info!("Crtc {} now belongs to a lessee", id);
    }

    /// Takes the objects of a lease back. They stay off until the next
    /// mode-set.
    pub fn revoke_lease(&self, lessee_id: u32) -> Result<(), DeviceError> {
        self.check_attached()?;
        self.leases
            .revoke(&*self.kernel, &self.res, lessee_id)
            .map_err(DeviceError::Lease)?;
        self.emit(DeviceEvent::ConfigurationChanged);
        Ok(())
    }

    /// Drops the leases whose lessee has gone away and returns how many
    /// ended.
    pub fn validate_leases(&self) -> Result<usize, DeviceError> {
        self.check_attached()?;
        let ended = self
            .leases
            .validate(&*self.kernel, &self.res)
            .map_err(DeviceError::Lease)?;
        if ended.len() > 0 {
            self.emit(DeviceEvent::ConfigurationChanged);
        }
        Ok(ended.len())
    }

    pub fn lease(&self, lessee_id: u32) -> Option<Rc<Lease>> {
        self.leases.get(lessee_id)
    }

    pub fn lease_count(&self) -> usize {
        self.leases.len()
    }

    fn retrain(&self, output: &Output) {
        let Some(crtc) = output.crtc.get().and_then(|c| self.res.crtc(c)) else {
            return;
        };
        let Some(req) = crtc.desired_mode() else {
            return;
        };
        let Some(fb) = crtc.scanout.get().or_else(|| self.front.get()) else {
            return;
        };
        log::info!("Retraining the link of {}", output.name);
        crtc.needs_modeset.set(true);
        let outputs = self.res.outputs_of(crtc.id);
        if let Err(e) = self.setter.set_mode(&self.res, &crtc, &req, &outputs, &fb) {
            log::error!("Could not retrain the link of {}: {}", output.name, ErrorFmt(e));
        }
    }

    /// The current (ust in microseconds, msc) of a crtc.
    pub fn get_crtc_ust_msc(&self, crtc: DrmCrtc) -> Result<(u64, u64), DeviceError> {
        let crtc = self.crtc(crtc)?;
        self.queue.current(crtc.id).map_err(DeviceError::Vblank)
    }

    /// Converts a reconciled frame number to the 32-bit kernel counter.
    pub fn crtc_msc_to_kernel(&self, crtc: DrmCrtc, msc: u64) -> Result<u32, DeviceError> {
        let crtc = self.crtc(crtc)?;
        Ok(crtc.msc.to_kernel32(msc))
    }

    fn hw_cursor(&self, crtc: DrmCrtc) -> Result<(Rc<Crtc>, Rc<HwCursor>), DeviceError> {
        let crtc = self.crtc(crtc)?;
        if self.sw_cursor.get() {
            return Err(DeviceError::Cursor(CursorError::NoHardwareCursor));
        }
        let Some(cursor) = crtc.cursor.get() else {
            return Err(DeviceError::Cursor(CursorError::NoCursor(crtc.id)));
        };
        Ok((crtc, cursor))
    }

    fn cursor_result(&self, res: Result<(), CursorError>) -> Result<(), DeviceError> {
        if let Err(CursorError::NoHardwareCursor) = &res {
            self.use_sw_cursor();
        }
        res.map_err(DeviceError::Cursor)
    }

    pub fn load_cursor_argb(
        &self,
        crtc: DrmCrtc,
        image: &[u32],
        width: u32,
        height: u32,
    ) -> Result<(), DeviceError> {
        let (_, cursor) = self.hw_cursor(crtc)?;
        cursor
            .load_argb(image, width, height)
            .map_err(DeviceError::Cursor)
    }

    pub fn set_cursor_hotspot(&self, crtc: DrmCrtc, x: i32, y: i32) -> Result<(), DeviceError> {
        let (_, cursor) = self.hw_cursor(crtc)?;
        cursor.set_hotspot(x, y);
        Ok(())
    }

    pub fn show_cursor(&self, crtc: DrmCrtc) -> Result<(), DeviceError> {
        let (crtc, cursor) = self.hw_cursor(crtc)?;
        self.cursor_result(cursor.show(&*self.kernel, crtc.id))
    }

    pub fn hide_cursor(&self, crtc: DrmCrtc) -> Result<(), DeviceError> {
        let (crtc, cursor) = self.hw_cursor(crtc)?;
        self.cursor_result(cursor.hide(&*self.kernel, crtc.id))
    }

    pub fn set_cursor_position(&self, crtc: DrmCrtc, x: i32, y: i32) -> Result<(), DeviceError> {
        let (crtc, cursor) = self.hw_cursor(crtc)?;
        self.cursor_result(cursor.move_to(&*self.kernel, crtc.id, x, y))
    }

    fn color_path(&self) -> ColorPath {
        ColorPath {
            atomic: self.setter.is_atomic(),
            gamma_lut: self.config.gamma_lut,
        }
    }

    pub fn set_gamma(
        &self,
        crtc: DrmCrtc,
        red: &[u16],
        green: &[u16],
        blue: &[u16],
    ) -> Result<(), DeviceError> {
        let crtc = self.crtc(crtc)?;
        color::set_gamma(&*self.kernel, &crtc, self.color_path(), red, green, blue)
            .map_err(DeviceError::Color)
    }

    pub fn set_ctm(&self, crtc: DrmCrtc, matrix: Option<&[f64; 9]>) -> Result<(), DeviceError> {
        let crtc = self.crtc(crtc)?;
        color::set_ctm(&*self.kernel, &crtc, self.color_path(), matrix).map_err(DeviceError::Color)
    }

    /// Returns whether variable refresh applies to the crtc.
    pub fn set_vrr(&self, crtc: DrmCrtc, enabled: bool) -> Result<bool, DeviceError> {
        let crtc = self.crtc(crtc)?;
        let outputs = self.res.outputs_of(crtc.id);
        color::set_vrr(
            &*self.kernel,
            &crtc,
            &outputs,
            self.color_path(),
            self.config.vrr,
            enabled,
        )
        .map_err(DeviceError::Color)
    }
}

impl EventLoopDispatcher for Device {
    fn dispatch(&self, events: u32) -> Result<(), Box<dyn Error>> {
        if events & (c::EPOLLERR | c::EPOLLHUP) as u32 != 0 {
            return Err(Box::new(DeviceError::Hangup));
        }
        self.dispatch_events()?;
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.detach();
    }
}
