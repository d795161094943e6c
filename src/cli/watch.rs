use {
    crate::cli::WatchArgs,
    kms_core::{
        device::Device,
        event_loop::{EventLoop, EventLoopRef},
        modeset::{ModeRequest, Rotation},
        vblank::{QueueMode, VblankResult},
        video::drm::DrmCrtc,
    },
    std::{
        cell::Cell,
        error::Error,
        rc::{Rc, Weak},
        time::Duration,
    },
};

struct Watcher {
    device: Weak<Device>,
    crtc: DrmCrtc,
    name: String,
    left: Cell<u64>,
    running: Rc<Cell<usize>>,
    el: EventLoopRef,
}

impl Watcher {
    fn next(self: &Rc<Self>) {
        let Some(device) = self.device.upgrade() else {
            self.finish();
            return;
        };
        if self.left.get() == 0 {
            self.finish();
            return;
        }
        let slf = self.clone();
        let res = device.queue_vblank(self.crtc, QueueMode::Relative, 1, move |r| {
            slf.completed(r)
        });
        if let Err(e) = res {
            log::warn!("Could not queue a vblank on {}: {}", self.name, e);
            self.finish();
        }
    }

    fn completed(self: &Rc<Self>, res: VblankResult) {
        match res {
            VblankResult::Completed { frame, usec } => {
                println!(
                    "{}: frame {} at {}",
                    self.name,
                    frame,
                    humantime::format_duration(Duration::from_micros(usec))
                );
                self.left.set(self.left.get() - 1);
                self.next();
            }
            VblankResult::Aborted => {
                log::info!("Vblank on {} was aborted", self.name);
                self.finish();
            }
        }
    }

    fn finish(&self) {
        self.running.set(self.running.get() - 1);
        if self.running.get() == 0 {
            self.el.stop();
        }
    }
}

pub fn main(device: &Rc<Device>, args: WatchArgs) -> Result<(), Box<dyn Error>> {
    let res = device.resources();
    let mut used = 0u32;
    let mut heads = vec![];
    for output in res.outputs() {
        if !output.is_connected() || output.non_desktop.get() {
            continue;
        }
        let Some(mode) = output.preferred_mode() else {
            continue;
        };
        let possible = output.possible_crtcs.get();
        let crtc = res
            .crtcs
            .iter()
            .filter(|c| c.idx < 32)
            .find(|c| possible & !used & (1 << c.idx) != 0);
        let Some(crtc) = crtc else {
            log::warn!("No crtc is left for {}", output.name);
            continue;
        };
        used |= 1 << crtc.idx;
        heads.push((crtc.id, output, mode));
    }
    if heads.is_empty() {
        return Err("No connected outputs".into());
    }
    let width = heads.iter().map(|(_, _, m)| m.hdisplay as u32).max();
    let height = heads.iter().map(|(_, _, m)| m.vdisplay as u32).max();
    device.create_front(width.unwrap_or(0), height.unwrap_or(0))?;
    for (crtc, output, mode) in &heads {
        let req = ModeRequest {
            mode: mode.clone(),
            x: 0,
            y: 0,
            rotation: Rotation::Normal,
        };
        device.set_mode(*crtc, &req, &[output.clone()])?;
    }
    let el = EventLoop::new()?;
    device.register(&el)?;
    let running = Rc::new(Cell::new(heads.len()));
    for (crtc, output, _) in &heads {
        let watcher = Rc::new(Watcher {
            device: Rc::downgrade(device),
            crtc: *crtc,
            name: output.name.clone(),
            left: Cell::new(args.frames),
            running: running.clone(),
            el: el.to_ref(),
        });
        watcher.next();
    }
    if running.get() > 0 {
        el.run()?;
    }
    Ok(())
}
