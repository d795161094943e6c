use {
    crate::{
        bo::{BufferObject, Framebuffer},
        kernel::KmsKernel,
        modeset::{ModeRequest, ModeSetter, Rotation},
        resources::{Crtc, Resources},
        shared_flip::{SharedFlipState, SharedFlipper},
        test_kernel::{Head, TestKernel, preferred, single_head},
        vblank::VblankQueue,
        video::{XRGB8888, drm::sys},
    },
    std::rc::Rc,
};

struct Setup {
    kernel: Rc<TestKernel>,
    head: Head,
    queue: Rc<VblankQueue>,
    setter: Rc<ModeSetter>,
    crtc: Rc<Crtc>,
    a: Rc<Framebuffer>,
    b: Rc<Framebuffer>,
    initial: Rc<Framebuffer>,
    _res: Resources,
}

fn setup(atomic: bool) -> Setup {
    let (kernel, head) = single_head();
    if atomic {
        kernel
            .state()
            .client_caps
            .insert(sys::DRM_CLIENT_CAP_ATOMIC, 1);
    }
    let dyn_kernel: Rc<dyn KmsKernel> = kernel.clone();
    let queue = Rc::new(VblankQueue::new(&dyn_kernel, 4));
    let res = Resources::discover(&dyn_kernel, &queue, 0).unwrap();
    let setter = Rc::new(ModeSetter::new(&dyn_kernel, atomic, None));
    let fb = || {
        let bo = BufferObject::create_dumb(&dyn_kernel, 1920, 1080, 32, XRGB8888).unwrap();
        Rc::new(bo).publish().unwrap()
    };
    let initial = fb();
    let crtc = res.crtc(head.crtc).unwrap();
    let req = ModeRequest {
        mode: preferred(1920, 1080, 60),
        x: 0,
        y: 0,
        rotation: Rotation::Normal,
    };
    setter
        .set_mode(&res, &crtc, &req, &res.outputs(), &initial)
        .unwrap();
    Setup {
        kernel,
        head,
        queue,
        setter,
        crtc,
        a: fb(),
        b: fb(),
        initial,
        _res: res,
    }
}

impl Setup {
    fn flipper(&self) -> Rc<SharedFlipper> {
        SharedFlipper::new(&self.crtc, &self.setter, &self.queue, &self.a, &self.b)
    }

    fn frame(&self) -> Rc<Framebuffer> {
        self.kernel.fire_vblank(self.head.crtc);
        self.queue.dispatch().unwrap();
        self.crtc.scanout.get().unwrap()
    }
}

#[test]
fn ping_pong() {
    for atomic in [true, false] {
        let s = setup(atomic);
        let flipper = s.flipper();
        flipper.start();
        assert_eq!(flipper.state(), SharedFlipState::BackPresenting);
        let mut shown = vec![];
        for _ in 0..3 {
            shown.push(s.frame().id);
        }
        assert_eq!(shown, [s.b.id, s.a.id, s.b.id]);
        assert_eq!(flipper.state(), SharedFlipState::FrontPresenting);
        flipper.stop();
    }
}

#[test]
fn failed_presents_are_retried() {
    let s = setup(false);
    s.kernel.state().reject_page_flip = true;
    let flipper = s.flipper();
    flipper.start();
    assert!(Rc::ptr_eq(&s.frame(), &s.initial));
    s.kernel.state().reject_page_flip = false;
    assert!(Rc::ptr_eq(&s.frame(), &s.initial));
    assert!(Rc::ptr_eq(&s.frame(), &s.b));
    assert!(Rc::ptr_eq(&s.frame(), &s.a));
    flipper.stop();
}

#[test]
fn presenting_the_visible_buffer_moves_on() {
    let s = setup(true);
    s.crtc.scanout.set(Some(s.b.clone()));
    let flipper = s.flipper();
    flipper.start();
    assert_eq!(s.kernel.pending_flips(), 0);
    assert!(Rc::ptr_eq(&s.frame(), &s.b));
    assert_eq!(flipper.state(), SharedFlipState::FrontPresenting);
    assert_eq!(s.kernel.pending_flips(), 1);
    assert!(Rc::ptr_eq(&s.frame(), &s.a));
    assert!(Rc::ptr_eq(&s.frame(), &s.b));
    flipper.stop();
}

#[test]
fn stopping_aborts_everything() {
    let s = setup(true);
    let flipper = s.flipper();
    flipper.start();
    assert_eq!(s.queue.pending(), 2);
    flipper.stop();
    assert_eq!(flipper.state(), SharedFlipState::Idle);
    assert_eq!(s.queue.pending(), 0);
    for _ in 0..3 {
        assert!(Rc::ptr_eq(&s.frame(), &s.initial));
    }
    assert_eq!(s.queue.pending(), 0);
}
