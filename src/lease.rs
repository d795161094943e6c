//! DRM leases: crtcs and connectors handed to another client.
//!
//! While a lease lives its crtcs are claimed in [`Resources`] and its outputs
//! are marked as leased. Nothing in this crate drives them until the lease is
//! revoked or the lessee goes away.

use {
    crate::{
        kernel::{ErrorKind, KmsKernel},
        resources::{Crtc, Output, Resources},
        utils::{errorfmt::ErrorFmt, oserror::OsError},
        video::drm::{DrmCrtc, DrmObject},
    },
    std::{cell::RefCell, rc::Rc},
    thiserror::Error,
    uapi::{OwnedFd, c},
};

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("A lease needs at least one object")]
    Empty,
    #[error("Crtc {0} is already leased")]
    CrtcLeased(DrmCrtc),
    #[error("Crtc {0} cannot be leased")]
    Unleasable(DrmCrtc),
    #[error("Output {0} is already leased")]
    OutputLeased(String),
    #[error("Output {0} has been removed")]
    OutputRemoved(String),
    #[error("Could not create a lease")]
    Create(#[source] OsError),
    #[error("Could not revoke lease {0}")]
    Revoke(u32, #[source] OsError),
    #[error("Could not list the lessees")]
    List(#[source] OsError),
    #[error("Lease {0} does not exist")]
    UnknownLease(u32),
}

impl LeaseError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LeaseError::Empty
            | LeaseError::CrtcLeased(_)
            | LeaseError::OutputLeased(_) => ErrorKind::KernelRejected,
            LeaseError::Unleasable(_) => ErrorKind::Unsupported,
            LeaseError::OutputRemoved(_) | LeaseError::UnknownLease(_) => {
                ErrorKind::Disconnected
            }
            LeaseError::Create(e) | LeaseError::Revoke(_, e) | LeaseError::List(e) => {
                ErrorKind::from_os(*e)
            }
        }
    }
}

#[derive(Debug)]
pub struct Lease {
    pub lessee_id: u32,
    pub crtcs: Vec<Rc<Crtc>>,
    pub outputs: Vec<Rc<Output>>,
}

impl Lease {
    pub fn crtc_mask(&self) -> u32 {
        self.crtcs.iter().fold(0, |mask, c| mask | 1 << c.idx)
    }
}

/// The kernel objects that make up a lease: each crtc followed by its
/// primary plane on atomic devices, then the connectors.
pub fn lease_objects(crtcs: &[Rc<Crtc>], outputs: &[Rc<Output>], atomic: bool) -> Vec<u32> {
    let mut objects = vec![];
    for crtc in crtcs {
        objects.push(crtc.id.id());
        if atomic {
            if let Some(plane) = &crtc.plane {
                objects.push(plane.id.id());
            }
        }
    }
    for output in outputs {
        objects.push(output.connector.get().id());
    }
    objects
}

#[derive(Default)]
pub struct Leases {
    leases: RefCell<Vec<Rc<Lease>>>,
}

impl Leases {
    /// Fails if any of the objects cannot be leased right now.
    pub fn check(
        &self,
        res: &Resources,
        crtcs: &[Rc<Crtc>],
        outputs: &[Rc<Output>],
    ) -> Result<(), LeaseError> {
        if crtcs.is_empty() && outputs.is_empty() {
            return Err(LeaseError::Empty);
        }
        for crtc in crtcs {
            if crtc.idx >= 32 {
                return Err(LeaseError::Unleasable(crtc.id));
            }
            if res.is_claimed(crtc) {
                return Err(LeaseError::CrtcLeased(crtc.id));
            }
        }
        for output in outputs {
            if output.is_removed() {
                return Err(LeaseError::OutputRemoved(output.name.clone()));
            }
            if output.leased.get() {
                return Err(LeaseError::OutputLeased(output.name.clone()));
            }
        }
        Ok(())
    }

    /// Leases the crtcs and outputs to a new lessee and returns the lessee's
    /// file descriptor.
    pub fn create(
        &self,
        kernel: &dyn KmsKernel,
        res: &Resources,
        atomic: bool,
        crtcs: &[Rc<Crtc>],
        outputs: &[Rc<Output>],
    ) -> Result<(Rc<Lease>, OwnedFd), LeaseError> {
        self.check(res, crtcs, outputs)?;
        let objects = lease_objects(crtcs, outputs, atomic);
        let (fd, lessee_id) = kernel.create_lease(&objects).map_err(LeaseError::Create)?;
        let lease = Rc::new(Lease {
            lessee_id,
            crtcs: crtcs.to_vec(),
            outputs: outputs.to_vec(),
        });
        res.claim(lease.crtc_mask());
        for output in outputs {
            output.leased.set(true);
        }
        self.leases.borrow_mut().push(lease.clone());
        log::info!("Created lease {} with {} objects", lessee_id, objects.len());
        Ok((lease, fd))
    }

    pub fn get(&self, lessee_id: u32) -> Option<Rc<Lease>> {
        self.leases
            .borrow()
            .iter()
            .find(|l| l.lessee_id == lessee_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.leases.borrow().len()
    }

    fn finish(&self, res: &Resources, lessee_id: u32) -> Option<Rc<Lease>> {
        let lease = {
            let mut leases = self.leases.borrow_mut();
            let idx = leases.iter().position(|l| l.lessee_id == lessee_id)?;
            leases.remove(idx)
        };
        res.release(lease.crtc_mask());
        for output in &lease.outputs {
            output.leased.set(false);
        }
        Some(lease)
    }

    /// Takes the objects of a lease back. A lessee the kernel no longer
    /// knows counts as revoked.
    pub fn revoke(
        &self,
        kernel: &dyn KmsKernel,
        res: &Resources,
        lessee_id: u32,
    ) -> Result<Rc<Lease>, LeaseError> {
        if self.get(lessee_id).is_none() {
            return Err(LeaseError::UnknownLease(lessee_id));
        }
        match kernel.revoke_lease(lessee_id) {
            Ok(()) => log::info!("Revoked lease {}", lessee_id),
            Err(OsError(c::ENOENT)) => log::info!("Lease {} had already ended", lessee_id),
            Err(e) => return Err(LeaseError::Revoke(lessee_id, e)),
        }
        self.finish(res, lessee_id)
            .ok_or(LeaseError::UnknownLease(lessee_id))
    }

    /// Drops the leases whose lessee is gone and returns them.
    pub fn validate(
        &self,
        kernel: &dyn KmsKernel,
        res: &Resources,
    ) -> Result<Vec<Rc<Lease>>, LeaseError> {
        if self.leases.borrow().is_empty() {
            return Ok(vec![]);
        }
        let lessees = kernel.list_lessees().map_err(LeaseError::List)?;
        let ended: Vec<_> = self
            .leases
            .borrow()
            .iter()
            .map(|l| l.lessee_id)
            .filter(|id| !lessees.contains(id))
            .collect();
        let mut gone = vec![];
        for id in ended {
            log::info!("Lease {} has ended", id);
            if let Some(lease) = self.finish(res, id) {
                gone.push(lease);
            }
        }
        Ok(gone)
    }

    pub fn revoke_all(&self, kernel: &dyn KmsKernel, res: &Resources) {
        let ids: Vec<_> = self.leases.borrow().iter().map(|l| l.lessee_id).collect();
        for id in ids {
            if let Err(e) = self.revoke(kernel, res, id) {
                log::error!("Could not revoke lease {}: {}", id, ErrorFmt(e));
                self.finish(res, id);
            }
        }
    }
}
