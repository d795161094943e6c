use {
    crate::{
        utils::oserror::OsError,
        video::drm::{
            AddFb, AddFb2, Change, CpuMapping, DrmBlob, DrmCardResources, DrmConnector,
            DrmConnectorInfo, DrmCrtc, DrmCrtcInfo, DrmEncoder, DrmEncoderInfo, DrmError,
            DrmEvent, DrmFb, DrmMaster, DrmModeInfo, DrmPlane, DrmPlaneInfo, DrmProperty,
            DrmPropertyDefinition, DrmPropertyValue, DumbBuffer, VblankReply,
        },
    },
    std::fmt::{Display, Formatter},
    uapi::{OwnedFd, c},
};

/// Coarse classification of every error the core reports.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    KernelRejected,
    OutOfMemory,
    Unsupported,
    Disconnected,
}

impl ErrorKind {
    pub fn from_os(e: OsError) -> Self {
        match e.0 {
            c::ENOMEM => Self::OutOfMemory,
            c::ENOENT | c::ENODEV | c::ENXIO => Self::Disconnected,
            c::EOPNOTSUPP | c::ENOSYS | c::ENOTTY => Self::Unsupported,
            _ => Self::KernelRejected,
        }
    }

    pub fn from_drm(e: &DrmError) -> Self {
        match e.os_error() {
            Some(e) => Self::from_os(e),
            None => Self::KernelRejected,
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::KernelRejected => "kernel rejected",
            ErrorKind::OutOfMemory => "out of memory",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Every kernel operation the display core performs.
///
/// The production implementation is [`DrmMaster`]. All object ids are the
/// kernel's; a removed object surfaces as `ENOENT`.
pub trait KmsKernel {
    fn fd(&self) -> c::c_int;

    fn get_cap(&self, cap: u64) -> Result<u64, OsError>;
    fn set_client_cap(&self, cap: u64, value: u64) -> Result<(), OsError>;

    fn get_resources(&self) -> Result<DrmCardResources, DrmError>;
    fn get_planes(&self) -> Result<Vec<DrmPlane>, DrmError>;
    fn get_plane_info(&self, plane: DrmPlane) -> Result<DrmPlaneInfo, DrmError>;
    fn get_crtc_info(&self, crtc: DrmCrtc) -> Result<DrmCrtcInfo, DrmError>;
    fn get_encoder_info(&self, encoder: DrmEncoder) -> Result<DrmEncoderInfo, DrmError>;
    fn get_connector_info(
        &self,
        connector: DrmConnector,
        force: bool,
    ) -> Result<DrmConnectorInfo, DrmError>;
    fn get_property(&self, prop: DrmProperty) -> Result<DrmPropertyDefinition, DrmError>;
    fn get_properties(&self, obj: u32, ty: u32) -> Result<Vec<DrmPropertyValue>, DrmError>;
    fn get_blob(&self, blob: DrmBlob) -> Result<Vec<u8>, DrmError>;

    fn create_blob(&self, data: &[u8]) -> Result<DrmBlob, DrmError>;
    fn destroy_blob(&self, blob: DrmBlob) -> Result<(), DrmError>;

    /// Leases `objects` to a new lessee. Returns the lessee's fd and id.
    fn create_lease(&self, objects: &[u32]) -> Result<(OwnedFd, u32), OsError>;
    fn list_lessees(&self) -> Result<Vec<u32>, OsError>;
    fn revoke_lease(&self, lessee_id: u32) -> Result<(), OsError>;

    fn atomic(&self, flags: u32, change: &Change, user_data: u64) -> Result<(), OsError>;
    fn set_crtc(
        &self,
        crtc: DrmCrtc,
        fb: DrmFb,
        x: u32,
        y: u32,
        connectors: &[DrmConnector],
        mode: Option<&DrmModeInfo>,
    ) -> Result<(), OsError>;
    fn set_property(&self, obj: u32, ty: u32, prop: DrmProperty, value: u64)
    -> Result<(), OsError>;
    fn page_flip(&self, crtc: DrmCrtc, fb: DrmFb, flags: u32, user_data: u64)
    -> Result<(), OsError>;

    fn create_dumb(&self, width: u32, height: u32, bpp: u32) -> Result<DumbBuffer, OsError>;
    fn map_dumb(&self, dumb: &DumbBuffer) -> Result<Box<dyn CpuMapping>, OsError>;
    fn destroy_dumb(&self, handle: u32) -> Result<(), OsError>;
    fn add_fb(&self, req: &AddFb) -> Result<DrmFb, OsError>;
    fn add_fb2(&self, req: &AddFb2) -> Result<DrmFb, OsError>;
    fn rm_fb(&self, fb: DrmFb) -> Result<(), OsError>;
    fn prime_fd_to_handle(&self, fd: c::c_int) -> Result<u32, OsError>;
    fn gem_close(&self, handle: u32) -> Result<(), OsError>;

    fn set_cursor2(
        &self,
        crtc: DrmCrtc,
        handle: u32,
        width: u32,
        height: u32,
        hot_x: i32,
        hot_y: i32,
    ) -> Result<(), OsError>;
    fn set_cursor(&self, crtc: DrmCrtc, handle: u32, width: u32, height: u32)
    -> Result<(), OsError>;
    fn move_cursor(&self, crtc: DrmCrtc, x: i32, y: i32) -> Result<(), OsError>;
    fn set_gamma(&self, crtc: DrmCrtc, red: &[u16], green: &[u16], blue: &[u16])
    -> Result<(), OsError>;

    fn queue_sequence(
        &self,
        crtc: DrmCrtc,
        flags: u32,
        sequence: u64,
        user_data: u64,
    ) -> Result<u64, OsError>;
    fn get_sequence(&self, crtc: DrmCrtc) -> Result<(u64, i64), OsError>;
    fn wait_vblank(&self, ty: u32, sequence: u32, user_data: u64)
    -> Result<VblankReply, OsError>;

    /// Appends every pending kernel event without blocking.
    fn read_events(&self, events: &mut Vec<DrmEvent>) -> Result<(), DrmError>;
}

impl KmsKernel for DrmMaster {
    fn fd(&self) -> c::c_int {
        self.raw()
    }

    fn get_cap(&self, cap: u64) -> Result<u64, OsError> {
        DrmMaster::get_cap(self, cap)
    }

    fn set_client_cap(&self, cap: u64, value: u64) -> Result<(), OsError> {
        DrmMaster::set_client_cap(self, cap, value)
    }

    fn get_resources(&self) -> Result<DrmCardResources, DrmError> {
        DrmMaster::get_resources(self)
    }

    fn get_planes(&self) -> Result<Vec<DrmPlane>, DrmError> {
        DrmMaster::get_planes(self)
    }

    fn get_plane_info(&self, plane: DrmPlane) -> Result<DrmPlaneInfo, DrmError> {
        DrmMaster::get_plane_info(self, plane)
    }

    fn get_crtc_info(&self, crtc: DrmCrtc) -> Result<DrmCrtcInfo, DrmError> {
        DrmMaster::get_crtc_info(self, crtc)
    }

    fn get_encoder_info(&self, encoder: DrmEncoder) -> Result<DrmEncoderInfo, DrmError> {
        DrmMaster::get_encoder_info(self, encoder)
    }

    fn get_connector_info(
        &self,
        connector: DrmConnector,
        force: bool,
    ) -> Result<DrmConnectorInfo, DrmError> {
        DrmMaster::get_connector_info(self, connector, force)
    }

    fn get_property(&self, prop: DrmProperty) -> Result<DrmPropertyDefinition, DrmError> {
        DrmMaster::get_property(self, prop)
    }

    fn get_properties(&self, obj: u32, ty: u32) -> Result<Vec<DrmPropertyValue>, DrmError> {
        DrmMaster::get_properties(self, obj, ty)
    }

    fn get_blob(&self, blob: DrmBlob) -> Result<Vec<u8>, DrmError> {
        DrmMaster::get_blob(self, blob)
    }

    fn create_blob(&self, data: &[u8]) -> Result<DrmBlob, DrmError> {
        DrmMaster::create_blob(self, data)
    }

    fn destroy_blob(&self, blob: DrmBlob) -> Result<(), DrmError> {
        DrmMaster::destroy_blob(self, blob)
    }

    fn create_lease(&self, objects: &[u32]) -> Result<(OwnedFd, u32), OsError> {
        DrmMaster::create_lease(self, objects)
    }

    fn list_lessees(&self) -> Result<Vec<u32>, OsError> {
        DrmMaster::list_lessees(self)
    }

    fn revoke_lease(&self, lessee_id: u32) -> Result<(), OsError> {
        DrmMaster::revoke_lease(self, lessee_id)
    }

    fn atomic(&self, flags: u32, change: &Change, user_data: u64) -> Result<(), OsError> {
        DrmMaster::atomic(self, flags, change, user_data)
    }

    fn set_crtc(
        &self,
        crtc: DrmCrtc,
        fb: DrmFb,
        x: u32,
        y: u32,
        connectors: &[DrmConnector],
        mode: Option<&DrmModeInfo>,
    ) -> Result<(), OsError> {
        DrmMaster::set_crtc(self, crtc, fb, x, y, connectors, mode)
    }

    fn set_property(
        &self,
        obj: u32,
        ty: u32,
        prop: DrmProperty,
        value: u64,
    ) -> Result<(), OsError> {
        DrmMaster::set_property(self, obj, ty, prop, value)
    }

    fn page_flip(
        &self,
        crtc: DrmCrtc,
        fb: DrmFb,
        flags: u32,
        user_data: u64,
    ) -> Result<(), OsError> {
        DrmMaster::page_flip(self, crtc, fb, flags, user_data)
    }

    fn create_dumb(&self, width: u32, height: u32, bpp: u32) -> Result<DumbBuffer, OsError> {
        DrmMaster::create_dumb(self, width, height, bpp)
    }

    fn map_dumb(&self, dumb: &DumbBuffer) -> Result<Box<dyn CpuMapping>, OsError> {
        DrmMaster::map_dumb(self, dumb)
    }

    fn destroy_dumb(&self, handle: u32) -> Result<(), OsError> {
        DrmMaster::destroy_dumb(self, handle)
    }

    fn add_fb(&self, req: &AddFb) -> Result<DrmFb, OsError> {
        DrmMaster::add_fb(self, req)
    }

    fn add_fb2(&self, req: &AddFb2) -> Result<DrmFb, OsError> {
        DrmMaster::add_fb2(self, req)
    }

    fn rm_fb(&self, fb: DrmFb) -> Result<(), OsError> {
        DrmMaster::rm_fb(self, fb)
    }

    fn prime_fd_to_handle(&self, fd: c::c_int) -> Result<u32, OsError> {
        DrmMaster::prime_fd_to_handle(self, fd)
    }

    fn gem_close(&self, handle: u32) -> Result<(), OsError> {
        DrmMaster::gem_close(self, handle)
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
        DrmMaster::set_cursor2(self, crtc, handle, width, height, hot_x, hot_y)
    }

    fn set_cursor(
        &self,
        crtc: DrmCrtc,
        handle: u32,
        width: u32,
        height: u32,
    ) -> Result<(), OsError> {
        DrmMaster::set_cursor(self, crtc, handle, width, height)
    }

    fn move_cursor(&self, crtc: DrmCrtc, x: i32, y: i32) -> Result<(), OsError> {
        DrmMaster::move_cursor(self, crtc, x, y)
    }

    fn set_gamma(
        &self,
        crtc: DrmCrtc,
        red: &[u16],
        green: &[u16],
        blue: &[u16],
    ) -> Result<(), OsError> {
        DrmMaster::set_gamma(self, crtc, red, green, blue)
    }

    fn queue_sequence(
        &self,
        crtc: DrmCrtc,
        flags: u32,
        sequence: u64,
        user_data: u64,
    ) -> Result<u64, OsError> {
        DrmMaster::queue_sequence(self, crtc, flags, sequence, user_data)
    }

    fn get_sequence(&self, crtc: DrmCrtc) -> Result<(u64, i64), OsError> {
        DrmMaster::get_sequence(self, crtc)
    }

    fn wait_vblank(
        &self,
        ty: u32,
        sequence: u32,
        user_data: u64,
    ) -> Result<VblankReply, OsError> {
        DrmMaster::wait_vblank(self, ty, sequence, user_data)
    }

    fn read_events(&self, events: &mut Vec<DrmEvent>) -> Result<(), DrmError> {
        DrmMaster::read_events(self, events)
    }
}
