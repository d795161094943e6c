//! Vblank and page-flip scheduling.
//!
//! Every pending request is an entry in a correlation table keyed by a
//! locally generated sequence number. The number travels through the kernel
//! as `user_data` and comes back in the completion event.

use {
    crate::{
        kernel::{ErrorKind, KmsKernel},
        utils::{copyhashmap::CopyHashMap, oserror::OsError},
        video::drm::{
            DrmCrtc, DrmError, DrmEvent,
            sys::{
                DRM_CRTC_SEQUENCE_RELATIVE, DRM_VBLANK_ABSOLUTE, DRM_VBLANK_EVENT,
                DRM_VBLANK_HIGH_CRTC_MASK, DRM_VBLANK_HIGH_CRTC_SHIFT, DRM_VBLANK_RELATIVE,
                DRM_VBLANK_SECONDARY,
            },
        },
    },
    std::{
        cell::Cell,
        fmt::{Debug, Formatter},
        rc::Rc,
    },
    thiserror::Error,
};

const HALF_RANGE: i64 = 0x4000_0000;
const HIGH_STEP: u64 = 1 << 32;

/// Turns the 32-bit and 64-bit frame counters reported by the kernel into
/// one monotonic 64-bit counter per crtc.
///
/// A 32-bit report is compared with the previous one. A jump of more than a
/// quarter of the range in either direction is taken as a wrap. More than
/// 2^30 frames between two observations cannot be disambiguated. Every
/// 64-bit report resynchronizes the high word, and the output never drops
/// below the highest value already reported. A backward wrap before the
/// first forward wrap is a stale report: it returns the last value and
/// leaves the tracker untouched.
#[derive(Debug, Default)]
pub struct MscTracker {
    prev: Cell<u32>,
    high: Cell<u64>,
    last: Cell<u64>,
    seen: Cell<bool>,
}

impl MscTracker {
    pub fn update32(&self, seq: u32) -> u64 {
        if self.seen.get() {
            let prev = self.prev.get() as i64;
            let cur = seq as i64;
            if cur < prev - HALF_RANGE {
                self.high.set(self.high.get() + HIGH_STEP);
            } else if cur > prev + HALF_RANGE {
                if self.high.get() < HIGH_STEP {
                    return self.last.get();
                }
                self.high.set(self.high.get() - HIGH_STEP);
            }
        }
        self.seen.set(true);
        self.prev.set(seq);
        self.clamp(self.high.get() + seq as u64)
    }

    pub fn update64(&self, seq: u64) -> u64 {
        self.seen.set(true);
        self.high.set(seq & !0xffff_ffff);
        self.prev.set(seq as u32);
        self.clamp(seq)
    }

    fn clamp(&self, msc: u64) -> u64 {
        let msc = msc.max(self.last.get());
        self.last.set(msc);
        msc
    }

    /// The highest value reported so far.
    pub fn last(&self) -> u64 {
        self.last.get()
    }

    /// Converts a reconciled frame number to the kernel's 32-bit domain.
    pub fn to_kernel32(&self, msc: u64) -> u32 {
        msc.wrapping_sub(self.high.get()) as u32
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum VblankResult {
    Completed { frame: u64, usec: u64 },
    Aborted,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum QueueMode {
    Absolute,
    Relative,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct VblankHandle(pub u32);

impl VblankHandle {
    pub fn user_data(self) -> u64 {
        self.0 as u64
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EntryKind {
    Vblank,
    Flip,
}

#[derive(Debug, Error)]
pub enum VblankError {
    #[error("Could not queue a crtc sequence")]
    Queue(#[source] OsError),
    #[error("Could not wait for a vblank")]
    Wait(#[source] OsError),
    #[error("Could not read kernel events")]
    ReadEvents(#[source] DrmError),
    #[error("Crtc {0} is not known to the scheduler")]
    UnknownCrtc(DrmCrtc),
    #[error("The request was aborted while the kernel was busy")]
    AbortedWhileBusy,
}

impl VblankError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VblankError::Queue(e) | VblankError::Wait(e) => ErrorKind::from_os(*e),
            VblankError::ReadEvents(e) => ErrorKind::from_drm(e),
            VblankError::UnknownCrtc(_) => ErrorKind::Disconnected,
            VblankError::AbortedWhileBusy => ErrorKind::KernelRejected,
        }
    }
}

type Callback = Box<dyn FnOnce(VblankResult)>;

struct Entry {
    seq: u32,
    crtc: DrmCrtc,
    kind: EntryKind,
    callback: Cell<Option<Callback>>,
}

impl Entry {
    fn complete(&self, result: VblankResult) {
        if let Some(cb) = self.callback.take() {
            cb(result);
        }
    }
}

#[derive(Clone)]
struct CrtcSlot {
    pipe: usize,
    msc: Rc<MscTracker>,
}

pub struct VblankQueue {
    kernel: Rc<dyn KmsKernel>,
    next_seq: Cell<u32>,
    entries: CopyHashMap<u32, Rc<Entry>>,
    crtcs: CopyHashMap<DrmCrtc, CrtcSlot>,
    use_sequence: Cell<Option<bool>>,
    busy_retries: u32,
}

impl Debug for VblankQueue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VblankQueue")
            .field("pending", &self.entries.len())
            .field("use_sequence", &self.use_sequence.get())
            .finish_non_exhaustive()
    }
}

fn pipe_flags(pipe: usize) -> u32 {
    match pipe {
        0 => 0,
        1 => DRM_VBLANK_SECONDARY,
        _ => ((pipe as u32) << DRM_VBLANK_HIGH_CRTC_SHIFT) & DRM_VBLANK_HIGH_CRTC_MASK,
    }
}

impl VblankQueue {
    pub fn new(kernel: &Rc<dyn KmsKernel>, busy_retries: u32) -> Self {
        Self {
            kernel: kernel.clone(),
            next_seq: Cell::new(1),
            entries: Default::default(),
            crtcs: Default::default(),
            use_sequence: Cell::new(None),
            busy_retries,
        }
    }

    pub fn register_crtc(&self, crtc: DrmCrtc, pipe: usize) -> Rc<MscTracker> {
        if let Some(slot) = self.crtcs.get(&crtc) {
            return slot.msc;
        }
        let msc = Rc::new(MscTracker::default());
        self.crtcs.set(
            crtc,
            CrtcSlot {
                pipe,
                msc: msc.clone(),
            },
        );
        msc
    }

    /// Aborts everything pending on the crtc and forgets it.
    pub fn unregister_crtc(&self, crtc: DrmCrtc) {
        self.abort_all(|_, c, _| c == crtc);
        self.crtcs.remove(&crtc);
    }

    pub fn tracker(&self, crtc: DrmCrtc) -> Option<Rc<MscTracker>> {
        self.crtcs.get(&crtc).map(|s| s.msc)
    }

    /// Whether the 64-bit sequence API is in use. `None` until the first
    /// request has tried it.
    pub fn uses_sequence_api(&self) -> Option<bool> {
        self.use_sequence.get()
    }

    pub fn pending(&self) -> usize {
        self.entries.len()
    }

    pub fn is_pending(&self, handle: VblankHandle) -> bool {
        self.entries.contains(&handle.0)
    }

    fn alloc_seq(&self) -> u32 {
        loop {
            let seq = self.next_seq.get();
            self.next_seq.set(seq.wrapping_add(1));
            if seq != 0 && !self.entries.contains(&seq) {
                return seq;
            }
        }
    }

    fn insert(&self, crtc: DrmCrtc, kind: EntryKind, callback: Callback) -> Rc<Entry> {
        let entry = Rc::new(Entry {
            seq: self.alloc_seq(),
            crtc,
            kind,
            callback: Cell::new(Some(callback)),
        });
        self.entries.set(entry.seq, entry.clone());
        entry
    }

    /// Registers interest in a future vblank.
    ///
    /// If the request cannot be queued, the callback has already received
    /// [`VblankResult::Aborted`] when this returns an error.
    pub fn queue(
        &self,
        crtc: DrmCrtc,
        mode: QueueMode,
        target: u64,
        callback: impl FnOnce(VblankResult) + 'static,
    ) -> Result<VblankHandle, VblankError> {
        let Some(slot) = self.crtcs.get(&crtc) else {
            callback(VblankResult::Aborted);
            return Err(VblankError::UnknownCrtc(crtc));
        };
        let entry = self.insert(crtc, EntryKind::Vblank, Box::new(callback));
        let mut retries = 0;
        let res = loop {
            match self.submit(crtc, &slot, mode, target, entry.seq) {
                Ok(()) => break Ok(()),
                Err(e) if e.is_busy() && retries < self.busy_retries => {
                    retries += 1;
                    log::debug!("Kernel is busy, draining events before retrying");
                    if let Err(e) = self.dispatch() {
                        log::warn!("Could not drain events: {}", e);
                    }
                    if !self.entries.contains(&entry.seq) {
                        break Err(VblankError::AbortedWhileBusy);
                    }
                }
                Err(e) if self.use_sequence.get() == Some(false) => break Err(VblankError::Wait(e)),
                Err(e) => break Err(VblankError::Queue(e)),
            }
        };
        match res {
            Ok(()) => Ok(VblankHandle(entry.seq)),
            Err(e) => {
                self.entries.remove(&entry.seq);
                entry.complete(VblankResult::Aborted);
                Err(e)
            }
        }
    }

    fn submit(
        &self,
        crtc: DrmCrtc,
        slot: &CrtcSlot,
        mode: QueueMode,
        target: u64,
        seq: u32,
    ) -> Result<(), OsError> {
        if self.use_sequence.get() != Some(false) {
            let flags = match mode {
                QueueMode::Absolute => 0,
                QueueMode::Relative => DRM_CRTC_SEQUENCE_RELATIVE,
            };
            match self.kernel.queue_sequence(crtc, flags, target, seq as u64) {
                Ok(_) => {
                    self.use_sequence.set(Some(true));
                    return Ok(());
                }
                Err(e) if self.use_sequence.get().is_none() && e.is_unsupported_ioctl() => {
                    log::info!("Kernel has no 64-bit sequence API, using vblank waits");
                    self.use_sequence.set(Some(false));
                }
                Err(e) => return Err(e),
            }
        }
        let mut ty = DRM_VBLANK_EVENT | pipe_flags(slot.pipe);
        let sequence = match mode {
            QueueMode::Absolute => {
                ty |= DRM_VBLANK_ABSOLUTE;
                slot.msc.to_kernel32(target)
            }
            QueueMode::Relative => {
                ty |= DRM_VBLANK_RELATIVE;
                target as u32
            }
        };
        self.kernel.wait_vblank(ty, sequence, seq as u64)?;
        Ok(())
    }

    /// Registers a page-flip completion.
    ///
    /// The caller submits the flip with [`VblankHandle::user_data`] and must
    /// call [`VblankQueue::abort`] if the submission fails.
    pub fn add_flip(
        &self,
        crtc: DrmCrtc,
        callback: impl FnOnce(VblankResult) + 'static,
    ) -> Result<VblankHandle, VblankError> {
        if !self.crtcs.contains(&crtc) {
            callback(VblankResult::Aborted);
            return Err(VblankError::UnknownCrtc(crtc));
        }
        let entry = self.insert(crtc, EntryKind::Flip, Box::new(callback));
        Ok(VblankHandle(entry.seq))
    }

    /// Removes a pending entry and delivers `Aborted`. A late kernel event
    /// for the entry is ignored.
    pub fn abort(&self, handle: VblankHandle) -> bool {
        match self.entries.remove(&handle.0) {
            Some(entry) => {
                entry.complete(VblankResult::Aborted);
                true
            }
            None => false,
        }
    }

    pub fn abort_all(&self, mut pred: impl FnMut(VblankHandle, DrmCrtc, EntryKind) -> bool) {
        let mut aborted = vec![];
        {
            let mut entries = self.entries.lock();
            entries.retain(|_, e| {
                if pred(VblankHandle(e.seq), e.crtc, e.kind) {
                    aborted.push(e.clone());
                    false
                } else {
                    true
                }
            });
        }
        aborted.sort_by_key(|e| e.seq);
        for entry in aborted {
            entry.complete(VblankResult::Aborted);
        }
    }

    /// Reads all pending kernel events and runs the matching callbacks.
    ///
    /// Callbacks for one crtc run in frame order.
    pub fn dispatch(&self) -> Result<usize, VblankError> {
        let mut events = vec![];
        self.kernel
            .read_events(&mut events)
            .map_err(VblankError::ReadEvents)?;
        let mut ready = vec![];
        for event in events {
            let (user_data, frame, usec) = match event {
                DrmEvent::Sequence {
                    user_data,
                    time_ns,
                    sequence,
                } => (user_data, Frame::Wide(sequence), time_ns.max(0) as u64 / 1000),
                DrmEvent::Vblank(t) | DrmEvent::FlipComplete(t) => {
                    (t.user_data, Frame::Narrow(t.sequence), t.usec())
                }
            };
            let entry = match u32::try_from(user_data) {
                Ok(seq) => self.entries.remove(&seq),
                Err(_) => None,
            };
            let Some(entry) = entry else {
                log::debug!("Ignoring an event for unknown request {}", user_data);
                continue;
            };
            let frame = match (self.tracker(entry.crtc), frame) {
                (Some(t), Frame::Wide(seq)) => t.update64(seq),
                (Some(t), Frame::Narrow(seq)) => t.update32(seq),
                (None, Frame::Wide(seq)) => seq,
                (None, Frame::Narrow(seq)) => seq as u64,
            };
            ready.push((entry, frame, usec));
        }
        ready.sort_by_key(|(e, frame, _)| (e.crtc, *frame));
        let n = ready.len();
        for (entry, frame, usec) in ready {
            entry.complete(VblankResult::Completed { frame, usec });
        }
        Ok(n)
    }

    /// The current (ust in microseconds, reconciled msc) of a crtc.
    pub fn current(&self, crtc: DrmCrtc) -> Result<(u64, u64), VblankError> {
        let Some(slot) = self.crtcs.get(&crtc) else {
            return Err(VblankError::UnknownCrtc(crtc));
        };
        if self.use_sequence.get() != Some(false) {
            match self.kernel.get_sequence(crtc) {
                Ok((seq, ns)) => return Ok((ns.max(0) as u64 / 1000, slot.msc.update64(seq))),
                Err(e) if e.is_unsupported_ioctl() => {}
                Err(e) => return Err(VblankError::Queue(e)),
            }
        }
        let reply = self
            .kernel
            .wait_vblank(DRM_VBLANK_RELATIVE | pipe_flags(slot.pipe), 0, 0)
            .map_err(VblankError::Wait)?;
        Ok((reply.usec, slot.msc.update32(reply.sequence)))
    }
}

#[derive(Copy, Clone)]
enum Frame {
    Narrow(u32),
    Wide(u64),
}

impl Drop for VblankQueue {
    fn drop(&mut self) {
        self.abort_all(|_, _, _| true);
    }
}
