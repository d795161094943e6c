//! Ping-pong flipping between two buffers shared with another device.

use {
    crate::{
        bo::Framebuffer,
        modeset::ModeSetter,
        resources::Crtc,
        utils::errorfmt::ErrorFmt,
        vblank::{QueueMode, VblankHandle, VblankQueue, VblankResult},
    },
    std::{
        cell::Cell,
        fmt::{Debug, Formatter},
        rc::{Rc, Weak},
    },
};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SharedFlipState {
    Idle,
    FrontPresenting,
    BackPresenting,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Target {
    Front,
    Back,
}

impl Target {
    fn other(self) -> Self {
        match self {
            Target::Front => Target::Back,
            Target::Back => Target::Front,
        }
    }
}

pub struct SharedFlipper {
    crtc: Weak<Crtc>,
    setter: Rc<ModeSetter>,
    queue: Rc<VblankQueue>,
    front: Rc<Framebuffer>,
    back: Rc<Framebuffer>,
    state: Cell<SharedFlipState>,
    vblank: Cell<Option<VblankHandle>>,
    flip: Cell<Option<VblankHandle>>,
}

impl Debug for SharedFlipper {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedFlipper")
            .field("front", &self.front.id)
            .field("back", &self.back.id)
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}

impl SharedFlipper {
    pub fn new(
        crtc: &Rc<Crtc>,
        setter: &Rc<ModeSetter>,
        queue: &Rc<VblankQueue>,
        front: &Rc<Framebuffer>,
        back: &Rc<Framebuffer>,
    ) -> Rc<Self> {
        Rc::new(Self {
            crtc: Rc::downgrade(crtc),
            setter: setter.clone(),
            queue: queue.clone(),
            front: front.clone(),
            back: back.clone(),
            state: Cell::new(SharedFlipState::Idle),
            vblank: Cell::new(None),
            flip: Cell::new(None),
        })
    }

    pub fn state(&self) -> SharedFlipState {
        self.state.get()
    }

    pub fn front(&self) -> &Rc<Framebuffer> {
        &self.front
    }

    pub fn back(&self) -> &Rc<Framebuffer> {
        &self.back
    }

    fn fb(&self, target: Target) -> &Rc<Framebuffer> {
        match target {
            Target::Front => &self.front,
            Target::Back => &self.back,
        }
    }

    /// Starts flipping, beginning with the back buffer.
    pub fn start(self: &Rc<Self>) {
        if self.state.get() != SharedFlipState::Idle {
            return;
        }
        self.state.set(SharedFlipState::BackPresenting);
        self.present(Target::Back);
    }

    /// Aborts everything in flight. Completed entries are skipped by the
    /// queue.
    pub fn stop(&self) {
        self.state.set(SharedFlipState::Idle);
        if let Some(handle) = self.vblank.take() {
            self.queue.abort(handle);
        }
        if let Some(handle) = self.flip.take() {
            self.queue.abort(handle);
        }
    }

    fn present(self: &Rc<Self>, target: Target) {
        if self.state.get() == SharedFlipState::Idle {
            return;
        }
        let Some(crtc) = self.crtc.upgrade() else {
            self.stop();
            return;
        };
        self.state.set(match target {
            Target::Front => SharedFlipState::FrontPresenting,
            Target::Back => SharedFlipState::BackPresenting,
        });
        let fb = self.fb(target);
        let showing = match crtc.scanout.get() {
            Some(s) => Rc::ptr_eq(&s, fb),
            None => false,
        };
        let presented = showing || self.flip(&crtc, fb);
        self.schedule(&crtc, target, presented);
    }

    fn flip(&self, crtc: &Crtc, fb: &Rc<Framebuffer>) -> bool {
        let crtc_id = crtc.id;
        let handle = self.queue.add_flip(crtc_id, move |res| {
            if res == VblankResult::Aborted {
                log::debug!("Shared flip on crtc {} was aborted", crtc_id);
            }
        });
        let handle = match handle {
            Ok(h) => h,
            Err(e) => {
                log::warn!("Could not register a shared flip: {}", ErrorFmt(e));
                return false;
            }
        };
        match self.setter.flip(crtc, fb, handle.user_data()) {
            Ok(()) => {
                self.flip.set(Some(handle));
                true
            }
            Err(e) => {
                log::debug!(
                    "Shared flip on crtc {} failed, retrying next frame: {}",
                    crtc.id,
                    ErrorFmt(e)
                );
                self.queue.abort(handle);
                false
            }
        }
    }

    fn schedule(self: &Rc<Self>, crtc: &Crtc, target: Target, presented: bool) {
        let slf = Rc::downgrade(self);
        let res = self.queue.queue(crtc.id, QueueMode::Relative, 1, move |res| {
            let Some(slf) = slf.upgrade() else {
                return;
            };
            slf.vblank.take();
            if let VblankResult::Completed { .. } = res {
                slf.vblank_fired(target, presented);
            }
        });
        match res {
            Ok(handle) => self.vblank.set(Some(handle)),
            Err(e) => {
                log::error!(
                    "Could not schedule the next shared flip on crtc {}: {}",
                    crtc.id,
                    ErrorFmt(e)
                );
                self.stop();
            }
        }
    }

    fn vblank_fired(self: &Rc<Self>, target: Target, presented: bool) {
        if self.state.get() == SharedFlipState::Idle {
            return;
        }
        if !presented {
            self.present(target);
            return;
        }
        if let Some(crtc) = self.crtc.upgrade() {
            crtc.scanout.set(Some(self.fb(target).clone()));
        }
        self.present(target.other());
    }
}

#[cfg(test)]
mod tests;
