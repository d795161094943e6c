use {
    crate::utils::{
        copyhashmap::CopyHashMap, errorfmt::ErrorFmt, numcell::NumCell, oserror::OsError,
    },
    std::{
        cell::Cell,
        error::Error,
        rc::{Rc, Weak},
    },
    thiserror::Error,
    uapi::{Errno, OwnedFd, c},
};

#[derive(Debug, Error)]
pub enum EventLoopError {
    #[error("Could not create an epoll fd")]
    CreateFailed(#[source] OsError),
    #[error("epoll_wait failed")]
    WaitFailed(#[source] OsError),
    #[error("A dispatcher returned a fatal error")]
    DispatcherError(#[source] Box<dyn Error>),
    #[error("Could not insert an fd to wait on")]
    InsertFailed(#[source] OsError),
    #[error("Could not remove an fd to wait on")]
    RemoveFailed(#[source] OsError),
    #[error("Entry is not registered")]
    NoEntry,
    #[error("Event loop is already destroyed")]
    Destroyed,
}

#[derive(Copy, Clone, Debug, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct EventLoopId(u64);

/// Something that wants to be told when its fd becomes ready.
pub trait EventLoopDispatcher {
    /// `events` is the epoll event mask.
    fn dispatch(&self, events: u32) -> Result<(), Box<dyn Error>>;
}

#[derive(Clone)]
struct Entry {
    fd: c::c_int,
    dispatcher: Rc<dyn EventLoopDispatcher>,
}

struct EventLoopData {
    epoll: OwnedFd,
    run: Cell<bool>,
    next_id: NumCell<u64>,
    entries: CopyHashMap<u64, Entry>,
}

/// A single-threaded epoll loop.
pub struct EventLoop {
    data: Rc<EventLoopData>,
}

/// A weak handle that dispatchers can keep without creating a cycle.
#[derive(Clone)]
pub struct EventLoopRef {
    data: Weak<EventLoopData>,
}

impl EventLoopData {
    fn insert(
        &self,
        fd: c::c_int,
        events: u32,
        dispatcher: Rc<dyn EventLoopDispatcher>,
    ) -> Result<EventLoopId, EventLoopError> {
        let id = self.next_id.fetch_add(1);
        let event = c::epoll_event {
            events: events as _,
            u64: id,
        };
        uapi::epoll_ctl(self.epoll.raw(), c::EPOLL_CTL_ADD, fd, Some(&event))
            .map_err(|e| EventLoopError::InsertFailed(e.into()))?;
        self.entries.set(id, Entry { fd, dispatcher });
        Ok(EventLoopId(id))
    }

    fn remove(&self, id: EventLoopId) -> Result<(), EventLoopError> {
        let Some(entry) = self.entries.remove(&id.0) else {
            return Err(EventLoopError::NoEntry);
        };
        uapi::epoll_ctl(self.epoll.raw(), c::EPOLL_CTL_DEL, entry.fd, None)
            .map_err(|e| EventLoopError::RemoveFailed(e.into()))?;
        Ok(())
    }

    fn poll(&self, timeout_ms: c::c_int) -> Result<usize, EventLoopError> {
        let mut buf = [c::epoll_event { events: 0, u64: 0 }; 16];
        let num = match uapi::epoll_wait(self.epoll.raw(), &mut buf, timeout_ms) {
            Ok(n) => n,
            Err(Errno(c::EINTR)) => return Ok(0),
            Err(e) => return Err(EventLoopError::WaitFailed(e.into())),
        };
        let mut dispatched = 0;
        for event in &buf[..num] {
            if !self.run.get() {
                break;
            }
            let id = event.u64;
            let Some(entry) = self.entries.get(&id) else {
                log::debug!("Entry {} became ready after it was removed", id);
                continue;
            };
            if let Err(e) = entry.dispatcher.dispatch(event.events as u32) {
                log::error!("Dispatcher for fd {} failed: {}", entry.fd, ErrorFmt(&*e));
                return Err(EventLoopError::DispatcherError(e));
            }
            dispatched += 1;
        }
        Ok(dispatched)
    }
}

impl EventLoop {
    pub fn new() -> Result<Self, EventLoopError> {
        let epoll = uapi::epoll_create1(c::EPOLL_CLOEXEC)
            .map_err(|e| EventLoopError::CreateFailed(e.into()))?;
        Ok(Self {
            data: Rc::new(EventLoopData {
                epoll,
                run: Cell::new(true),
                next_id: NumCell::new(1),
                entries: Default::default(),
            }),
        })
    }

    pub fn to_ref(&self) -> EventLoopRef {
        EventLoopRef {
            data: Rc::downgrade(&self.data),
        }
    }

    pub fn insert(
        &self,
        fd: c::c_int,
        events: u32,
        dispatcher: Rc<dyn EventLoopDispatcher>,
    ) -> Result<EventLoopId, EventLoopError> {
        self.data.insert(fd, events, dispatcher)
    }

    pub fn remove(&self, id: EventLoopId) -> Result<(), EventLoopError> {
        self.data.remove(id)
    }

    pub fn len(&self) -> usize {
        self.data.entries.len()
    }

    pub fn stop(&self) {
        self.data.run.set(false);
    }

    /// Waits at most `timeout_ms` and dispatches whatever became ready.
    pub fn run_once(&self, timeout_ms: c::c_int) -> Result<usize, EventLoopError> {
        self.data.run.set(true);
        self.data.poll(timeout_ms)
    }

    /// Dispatches until [`EventLoop::stop`] is called.
    pub fn run(&self) -> Result<(), EventLoopError> {
        self.data.run.set(true);
        while self.data.run.get() {
            self.data.poll(-1)?;
        }
        Ok(())
    }
}

impl EventLoopRef {
    pub fn stop(&self) {
        if let Some(d) = self.data.upgrade() {
            d.run.set(false);
        }
    }

    pub fn remove(&self, id: EventLoopId) -> Result<(), EventLoopError> {
        match self.data.upgrade() {
            Some(d) => d.remove(id),
            None => Err(EventLoopError::Destroyed),
        }
    }
}
