use {
    crate::{
        bo::{
            AllocRequest, BO_USE_SCANOUT, BoError, BufferObject, allocate_scanout,
            common_modifiers,
        },
        kernel::{ErrorKind, KmsKernel},
        test_kernel::{TestAllocator, TestKernel},
        video::{INVALID_MODIFIER, LINEAR_MODIFIER, XRGB8888},
    },
    indexmap::IndexSet,
    std::rc::Rc,
};

const TILED: u64 = 0x0100_0000_0000_0001;

fn setup() -> (Rc<TestKernel>, Rc<dyn KmsKernel>) {
    let kernel = TestKernel::new();
    let dyn_kernel: Rc<dyn KmsKernel> = kernel.clone();
    (kernel, dyn_kernel)
}

fn request() -> AllocRequest {
    AllocRequest {
        width: 256,
        height: 64,
        bpp: 32,
        format: XRGB8888,
        usage: BO_USE_SCANOUT,
    }
}

#[test]
fn dumb_buffers_are_mapped_once() {
    let (kernel, dyn_kernel) = setup();
    let bo = BufferObject::create_dumb(&dyn_kernel, 100, 10, 32, XRGB8888).unwrap();
    assert!(bo.is_dumb());
    assert_eq!(bo.pitch, 448);
    assert!(!bo.is_mapped());
    bo.with_map(|m| {
        assert_eq!(m.len(), 4480);
        m[0] = 0xab;
    })
    .unwrap();
    bo.with_map(|m| m[4479] = 0xcd).unwrap();
    assert!(bo.is_mapped());
    assert_eq!(kernel.state().maps, 1);
    let contents = kernel.dumb_contents(bo.handle()).unwrap();
    assert_eq!((contents[0], contents[4479]), (0xab, 0xcd));
}

#[test]
fn framebuffers_go_before_their_buffer() {
    let (kernel, dyn_kernel) = setup();
    let bo = Rc::new(BufferObject::create_dumb(&dyn_kernel, 64, 64, 32, XRGB8888).unwrap());
    let fb = bo.publish().unwrap();
    assert_eq!(kernel.fb_count(), 1);
    assert!(!kernel.state().fbs[&fb.id].modifiers);
    drop(bo);
    assert_eq!(kernel.dumb_count(), 1);
    drop(fb);
    assert_eq!(kernel.fb_count(), 0);
    assert_eq!(kernel.dumb_count(), 0);
    assert_eq!(kernel.state().violations, 0);
}

#[test]
fn failed_dumb_allocation() {
    let (kernel, dyn_kernel) = setup();
    kernel.state().fail_dumb = true;
    let err = BufferObject::create_dumb(&dyn_kernel, 64, 64, 32, XRGB8888).unwrap_err();
    assert!(matches!(err, BoError::CreateDumb(_)));
    assert_eq!(err.kind(), ErrorKind::OutOfMemory);
}

#[test]
fn imported_buffers() {
    let (kernel, dyn_kernel) = setup();
    let bo = BufferObject::import(&dyn_kernel, 3, 640, 480, 2560, 32, XRGB8888).unwrap();
    assert!(kernel.state().gem.contains(&bo.handle()));
    let err = bo.with_map(|_| ()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);
    let bo = Rc::new(bo);
    let fb = bo.publish().unwrap();
    drop(bo);
    drop(fb);
    assert!(kernel.state().gem.is_empty());
    assert!(matches!(
        BufferObject::import(&dyn_kernel, -1, 640, 480, 2560, 32, XRGB8888),
        Err(BoError::Import(_))
    ));
}

#[test]
fn modifiers_reach_the_kernel() {
    let (kernel, dyn_kernel) = setup();
    let allocator = TestAllocator::new(&kernel);
    let fb = allocate_scanout(
        &dyn_kernel,
        Some(&*allocator),
        &request(),
        &[TILED, LINEAR_MODIFIER],
    )
    .unwrap();
    assert!(fb.bo.uses_modifiers());
    assert!(kernel.state().fbs[&fb.id].modifiers);
    assert_eq!(*allocator.requests.borrow(), [vec![TILED, LINEAR_MODIFIER]]);
}

#[test]
fn multi_plane_modifiers_are_skipped() {
    let (kernel, dyn_kernel) = setup();
    let allocator = TestAllocator::new(&kernel);
    allocator.two_plane_modifiers.borrow_mut().push(TILED);
    allocate_scanout(
        &dyn_kernel,
        Some(&*allocator),
        &request(),
        &[TILED, LINEAR_MODIFIER],
    )
    .unwrap();
    assert_eq!(*allocator.requests.borrow(), [vec![LINEAR_MODIFIER]]);
}

#[test]
fn rejected_modifiers_fall_back() {
    let (kernel, dyn_kernel) = setup();
    let allocator = TestAllocator::new(&kernel);
    *allocator.reject_modifiers.borrow_mut() = true;
    let fb = allocate_scanout(&dyn_kernel, Some(&*allocator), &request(), &[TILED]).unwrap();
    assert!(!fb.bo.uses_modifiers());
    assert_eq!(
        *allocator.requests.borrow(),
        [vec![TILED], vec![INVALID_MODIFIER]]
    );

    let (kernel, dyn_kernel) = setup();
    kernel.state().reject_modifiers = true;
    let allocator = TestAllocator::new(&kernel);
    let fb = allocate_scanout(&dyn_kernel, Some(&*allocator), &request(), &[TILED]).unwrap();
    assert!(!fb.bo.uses_modifiers());
    assert!(!kernel.state().fbs[&fb.id].modifiers);
    assert_eq!(kernel.fb_count(), 1);
}

#[test]
fn dumb_buffers_without_an_allocator() {
    let (kernel, dyn_kernel) = setup();
    let fb = allocate_scanout(&dyn_kernel, None, &request(), &[TILED]).unwrap();
    assert!(fb.bo.is_dumb());
    assert_eq!(kernel.dumb_count(), 1);
}

#[test]
fn modifier_sets_are_intersected() {
    let a: IndexSet<_> = [LINEAR_MODIFIER, TILED].into_iter().collect();
    let b: IndexSet<_> = [TILED].into_iter().collect();
    let common = common_modifiers([&a, &b].into_iter());
    assert_eq!(common.into_iter().collect::<Vec<_>>(), [TILED]);
    assert!(common_modifiers(std::iter::empty()).is_empty());
}
