use {
    crate::{
        bo::{BoError, BufferObject},
        kernel::{ErrorKind, KmsKernel},
        utils::oserror::OsError,
        video::{ARGB8888, drm::DrmCrtc},
    },
    std::{
        cell::Cell,
        fmt::{Debug, Formatter},
        rc::Rc,
    },
    thiserror::Error,
    uapi::c,
};

pub const DEFAULT_CURSOR_SIZE: u32 = 64;

#[derive(Debug, Error)]
pub enum CursorError {
    #[error("Could not allocate the cursor buffer")]
    Allocate(#[source] BoError),
    #[error("Could not write the cursor image")]
    Upload(#[source] BoError),
    #[error("Could not set the cursor")]
    Set(#[source] OsError),
    #[error("Could not move the cursor")]
    Move(#[source] OsError),
    #[error("The device has no hardware cursor")]
    NoHardwareCursor,
    #[error("Crtc {0} has no cursor")]
    NoCursor(DrmCrtc),
}

impl CursorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CursorError::Allocate(e) | CursorError::Upload(e) => e.kind(),
            CursorError::Set(e) | CursorError::Move(e) => ErrorKind::from_os(*e),
            CursorError::NoHardwareCursor => ErrorKind::Unsupported,
            CursorError::NoCursor(_) => ErrorKind::Disconnected,
        }
    }
}

/// The cursor buffer of one crtc.
pub struct HwCursor {
    bo: Rc<BufferObject>,
    hotspot: Cell<(i32, i32)>,
    position: Cell<(i32, i32)>,
    visible: Cell<bool>,
    use_cursor2: Cell<bool>,
}

impl Debug for HwCursor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HwCursor")
            .field("width", &self.bo.width)
            .field("height", &self.bo.height)
            .field("visible", &self.visible.get())
            .finish_non_exhaustive()
    }
}

impl HwCursor {
    pub fn allocate(
        kernel: &Rc<dyn KmsKernel>,
        width: u32,
        height: u32,
    ) -> Result<Self, CursorError> {
        let bo = BufferObject::create_dumb(kernel, width, height, 32, ARGB8888)
            .map_err(CursorError::Allocate)?;
        Ok(Self {
            bo: Rc::new(bo),
            hotspot: Cell::new((0, 0)),
            position: Cell::new((0, 0)),
            visible: Cell::new(false),
            use_cursor2: Cell::new(true),
        })
    }

    pub fn size(&self) -> (u32, u32) {
        (self.bo.width, self.bo.height)
    }

    pub fn handle(&self) -> u32 {
        self.bo.handle()
    }

    pub fn is_visible(&self) -> bool {
        self.visible.get()
    }

    pub fn position(&self) -> (i32, i32) {
        self.position.get()
    }

    pub fn set_hotspot(&self, x: i32, y: i32) {
        self.hotspot.set((x, y));
    }

    /// Copies an ARGB image into the cursor buffer.
    ///
    /// Pixels outside the cursor are dropped and the uncovered part of the
    /// buffer is cleared.
    pub fn load_argb(&self, image: &[u32], width: u32, height: u32) -> Result<(), CursorError> {
        let pitch = self.bo.pitch as usize;
        let rows = height.min(self.bo.height) as usize;
        let cols = width.min(self.bo.width) as usize;
        let width = width as usize;
        self.bo
            .with_map(|dst| {
                dst.fill(0);
                for y in 0..rows {
                    let src = &image[(y * width).min(image.len())..];
                    let row = &mut dst[y * pitch..];
                    for (x, px) in src.iter().take(cols).enumerate() {
                        row[x * 4..x * 4 + 4].copy_from_slice(&px.to_ne_bytes());
                    }
                }
            })
            .map_err(CursorError::Upload)
    }

    /// Makes the cursor visible on `crtc`.
    ///
    /// Drivers that reject the hotspot variant get the plain variant from
    /// then on.
    pub fn show(&self, kernel: &dyn KmsKernel, crtc: DrmCrtc) -> Result<(), CursorError> {
        let (w, h) = self.size();
        let handle = self.handle();
        if self.use_cursor2.get() {
            let (hx, hy) = self.hotspot.get();
            match kernel.set_cursor2(crtc, handle, w, h, hx, hy) {
                Ok(()) => {
                    self.visible.set(true);
                    return Ok(());
                }
                Err(e) if e.0 == c::EINVAL => {
                    log::info!("Driver rejects cursor hotspots, using the plain cursor ioctl");
                    self.use_cursor2.set(false);
                }
                Err(e) => return Err(map_set_error(e)),
            }
        }
        kernel
            .set_cursor(crtc, handle, w, h)
            .map_err(map_set_error)?;
        self.visible.set(true);
        Ok(())
    }

    pub fn hide(&self, kernel: &dyn KmsKernel, crtc: DrmCrtc) -> Result<(), CursorError> {
        let (w, h) = self.size();
        kernel.set_cursor(crtc, 0, w, h).map_err(map_set_error)?;
        self.visible.set(false);
        Ok(())
    }

    pub fn move_to(
        &self,
        kernel: &dyn KmsKernel,
        crtc: DrmCrtc,
        x: i32,
        y: i32,
    ) -> Result<(), CursorError> {
        let (hx, hy) = match self.use_cursor2.get() {
            true => (0, 0),
            false => self.hotspot.get(),
        };
        match kernel.move_cursor(crtc, x - hx, y - hy) {
            Ok(()) => {
                self.position.set((x, y));
                Ok(())
            }
            Err(e) if e.0 == c::ENXIO => Err(CursorError::NoHardwareCursor),
            Err(e) => Err(CursorError::Move(e)),
        }
    }
}

fn map_set_error(e: OsError) -> CursorError {
    match e.0 {
        c::ENXIO => CursorError::NoHardwareCursor,
        _ => CursorError::Set(e),
    }
}
