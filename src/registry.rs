//! Buffer registration.
//!
//! Registering a descriptor maps its memory into this process and records
//! which context did so. Unregistering tears that mapping down again and is
//! only honoured for the context that created it.

use crate::backend::{SecureId, ion};
use crate::context::{Context, ModuleState};
use crate::descriptor::{BackendPayload, BufferDescriptor, LocalMapping, LockState, Registration};
use crate::error::{Error, Result};
use crate::framebuffer::DisplayOutput;
use rustix::fd::AsFd;
use std::ptr::NonNull;

impl Context {
    /// Map `desc` into this process.
    ///
    /// On success the descriptor carries a CPU base address, an unlocked
    /// lock state, and this context's ownership. On failure the descriptor is
    /// left as it was. The framebuffer of each display output can only be
    /// registered once; further attempts fail with
    /// [`Error::AlreadyRegistered`].
    pub fn register(&self, desc: &mut BufferDescriptor) -> Result<()> {
        desc.validate().inspect_err(|e| {
            tracing::error!("registering invalid buffer: {}", e);
        })?;

        let mut state = self.state();

        if let Some(existing) = &desc.registration {
            if existing.token == self.token() {
                tracing::warn!("buffer registered twice by the same context");
                return Err(Error::DuplicateRegistration);
            }
            return Err(Error::OwnershipMismatch {
                owner: desc.owner_pid,
                current: self.pid(),
            });
        }

        match &desc.backend {
            BackendPayload::Framebuffer { .. } => self.register_framebuffer(&mut state, desc),
            BackendPayload::Ump { secure_id } => {
                let secure_id = *secure_id;
                self.register_ump(&mut state, desc, secure_id)
            }
            BackendPayload::Ion { share_fd } => {
                let device = self.ion.as_ref().ok_or_else(|| {
                    tracing::error!("ION buffer registered without an ION device");
                    Error::UnsupportedBuffer("ION support is not configured".into())
                })?;

                if self.ion_client.get().is_none() {
                    let client = device.open_client().inspect_err(|e| {
                        tracing::error!("could not open ION client: {}", e);
                    })?;
                    // The state mutex is held, nobody else can have set it.
                    let _ = self.ion_client.set(client);
                }

                let region =
                    ion::map_share_fd(share_fd.as_fd(), desc.size()).inspect_err(|e| {
                        tracing::error!(size = desc.size(), "could not mmap share fd: {}", e);
                    })?;
                // SAFETY: validate() guarantees offset < size, the mapped length.
                let base = unsafe { region.as_ptr().add(desc.offset()) };

                tracing::trace!(
                    size = desc.size(),
                    offset = desc.offset(),
                    "registered ION buffer"
                );
                self.attach(desc, base, LocalMapping::Ion(region));
                Ok(())
            }
            BackendPayload::Unsupported { flags } => {
                tracing::error!(flags = *flags, "registering unknown buffer");
                Err(Error::UnsupportedBuffer(format!(
                    "no backend for flags {flags:#x}"
                )))
            }
        }
    }

    fn register_framebuffer(
        &self,
        state: &mut ModuleState,
        desc: &mut BufferDescriptor,
    ) -> Result<()> {
        let output = DisplayOutput::for_usage(desc.usage());
        let mapper = state.framebuffer(output);
        let base = mapper.map(desc, self.config())?;
        let generation = mapper.generation().ok_or(Error::NotMapped)?;
        self.attach(desc, base, LocalMapping::Framebuffer { output, generation });
        Ok(())
    }

    /// Tear down the output mapping `desc` registered.
    ///
    /// Only the descriptor holding the live generation may unmap; one whose
    /// mapping was already replaced is detached without touching the new one.
    fn unregister_framebuffer(
        &self,
        state: &mut ModuleState,
        desc: &mut BufferDescriptor,
    ) -> Result<()> {
        let output = DisplayOutput::for_usage(desc.usage());
        let mapper = state.framebuffer(output);
        let registered = match &desc.registration {
            Some(Registration {
                mapping: LocalMapping::Framebuffer { generation, .. },
                ..
            }) => Some(*generation),
            _ => None,
        };

        match (registered, mapper.generation()) {
            (Some(ours), Some(live)) if ours == live => {
                let result = mapper.unmap();
                desc.clear_runtime();
                result
            }
            (Some(ours), live) => {
                tracing::warn!(
                    output = %output,
                    generation = ours,
                    live = ?live,
                    "framebuffer mapping was already replaced"
                );
                desc.clear_runtime();
                Err(Error::NothingRegistered(output))
            }
            (None, Some(_)) => {
                tracing::warn!(
                    output = %output,
                    "unregistering a framebuffer this descriptor did not map"
                );
                Err(Error::OwnershipMismatch {
                    owner: desc.owner_pid,
                    current: self.pid(),
                })
            }
            (None, None) => {
                tracing::error!(output = %output, "framebuffer is not registered");
                Err(Error::NothingRegistered(output))
            }
        }
    }

    fn register_ump(
        &self,
        state: &mut ModuleState,
        desc: &mut BufferDescriptor,
        secure_id: SecureId,
    ) -> Result<()> {
        let Some(driver) = &self.ump else {
            tracing::error!(secure_id = %secure_id, "UMP buffer registered without a UMP driver");
            return Err(Error::UnsupportedBuffer("UMP support is not configured".into()));
        };

        if !state.ump_open {
            driver.open().inspect_err(|e| {
                tracing::error!("failed to open UMP driver: {}", e);
            })?;
            state.ump_open = true;
        }

        let handle = driver.import(secure_id, desc.size()).inspect_err(|e| {
            tracing::error!(secure_id = %secure_id, "failed to import UMP buffer: {}", e);
        })?;

        tracing::trace!(secure_id = %secure_id, size = desc.size(), "registered UMP buffer");
        self.attach(desc, handle.as_ptr(), LocalMapping::Ump(handle));
        Ok(())
    }

    fn attach(&self, desc: &mut BufferDescriptor, base: NonNull<u8>, mapping: LocalMapping) {
        desc.owner_pid = self.pid();
        desc.base = Some(base);
        desc.lock_state = LockState::default();
        desc.write_owner = false;
        desc.registration = Some(Registration {
            token: self.token(),
            mapping,
        });
    }

    /// Undo [`Context::register`].
    ///
    /// Only the context that registered a UMP or ION buffer may unregister
    /// it; anyone else gets [`Error::OwnershipMismatch`] and the descriptor
    /// is untouched. Framebuffers are torn down through the shared mapping of
    /// their output, and only by the descriptor that created it. If the backend fails to release the memory, the
    /// descriptor's runtime fields are cleared anyway and the error returned.
    pub fn unregister(&self, desc: &mut BufferDescriptor) -> Result<()> {
        desc.validate().inspect_err(|e| {
            tracing::error!("unregistering invalid buffer: {}", e);
        })?;

        if desc.lock_state.readers() > 0 {
            tracing::warn!(
                readers = desc.lock_state.readers(),
                "unregistering a buffer that is still locked for reading"
            );
        }

        if let BackendPayload::Unsupported { flags } = &desc.backend {
            let flags = *flags;
            tracing::error!(flags, "unregistering unknown buffer");
            return Err(Error::UnsupportedBuffer(format!(
                "no backend for flags {flags:#x}"
            )));
        }

        if matches!(&desc.registration, Some(reg) if reg.token != self.token()) {
            tracing::warn!(
                owner = desc.owner_pid,
                current = self.pid(),
                "trying to unregister buffer registered by another context"
            );
            return Err(Error::OwnershipMismatch {
                owner: desc.owner_pid,
                current: self.pid(),
            });
        }

        let mut state = self.state();

        if let BackendPayload::Framebuffer { .. } = desc.backend {
            return self.unregister_framebuffer(&mut state, desc);
        }

        let Some(registration) = desc.registration.take() else {
            tracing::warn!(
                owner = desc.owner_pid,
                current = self.pid(),
                "trying to unregister buffer not registered in this context"
            );
            return Err(Error::OwnershipMismatch {
                owner: desc.owner_pid,
                current: self.pid(),
            });
        };

        let result = match registration.mapping {
            LocalMapping::Ump(handle) => match &self.ump {
                Some(driver) => driver.release(handle),
                None => handle.into_region().unmap(),
            },
            LocalMapping::Ion(region) => region.unmap(),
            // Framebuffer descriptors returned above.
            LocalMapping::Framebuffer { .. } => Ok(()),
        };
        drop(state);

        if let Err(e) = &result {
            tracing::error!("could not release buffer memory: {}", e);
        }
        desc.clear_runtime();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{IonDevice, MsyncOp, UmpDriver, UmpHandle};
    use crate::mapping::MappedRegion;
    use rustix::fd::{BorrowedFd, OwnedFd};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn memfd(size: usize) -> OwnedFd {
        let fd = rustix::fs::memfd_create("test_reg", rustix::fs::MemfdFlags::CLOEXEC).unwrap();
        rustix::fs::ftruncate(&fd, size as u64).unwrap();
        fd
    }

    #[derive(Debug)]
    struct MemfdIon;

    impl IonDevice for MemfdIon {
        fn open_client(&self) -> Result<OwnedFd> {
            Ok(memfd(1))
        }

        fn sync_for_device(&self, _: BorrowedFd<'_>, _: BorrowedFd<'_>) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    struct CountingUmp {
        opens: AtomicUsize,
    }

    impl UmpDriver for CountingUmp {
        fn open(&self) -> Result<()> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn import(&self, secure_id: SecureId, size: usize) -> Result<UmpHandle> {
            let region = MappedRegion::map_shared(memfd(size), size, 0)?;
            Ok(UmpHandle::new(secure_id, region))
        }

        fn msync(&self, _: &UmpHandle, _: MsyncOp) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_ion_register_applies_offset() {
        let ctx = Context::builder().ion(MemfdIon).build();
        let mut desc = BufferDescriptor::ion(memfd(8192), 8192).with_offset(4096);

        ctx.register(&mut desc).unwrap();
        assert!(ctx.is_ion_client_open());
        let Some(Registration {
            mapping: LocalMapping::Ion(region),
            ..
        }) = &desc.registration
        else {
            panic!("expected an ION mapping");
        };
        let delta = desc.base().unwrap().as_ptr() as usize - region.as_ptr().as_ptr() as usize;
        assert_eq!(delta, 4096);
        assert_eq!(desc.owner_pid(), ctx.pid());

        ctx.unregister(&mut desc).unwrap();
        assert!(desc.base().is_none());
        assert!(!desc.is_registered());
    }

    #[test]
    fn test_ump_driver_opened_once() {
        let ctx = Context::builder().ump(CountingUmp::default()).build();
        let mut a = BufferDescriptor::ump(SecureId(1), 4096);
        let mut b = BufferDescriptor::ump(SecureId(2), 4096);

        ctx.register(&mut a).unwrap();
        ctx.register(&mut b).unwrap();
        assert!(ctx.state().ump_open);
        assert_eq!(a.ump_handle().unwrap().secure_id(), SecureId(1));

        ctx.unregister(&mut a).unwrap();
        ctx.unregister(&mut b).unwrap();
    }

    #[test]
    fn test_same_context_double_register() {
        let ctx = Context::builder().ion(MemfdIon).build();
        let mut desc = BufferDescriptor::ion(memfd(4096), 4096);
        ctx.register(&mut desc).unwrap();
        let base = desc.base();

        assert!(matches!(
            ctx.register(&mut desc),
            Err(Error::DuplicateRegistration)
        ));
        assert_eq!(desc.base(), base);
        ctx.unregister(&mut desc).unwrap();
    }

    #[test]
    fn test_unconfigured_backend_is_unsupported() {
        let ctx = Context::builder().build();
        let mut desc = BufferDescriptor::ion(memfd(4096), 4096);
        assert!(matches!(
            ctx.register(&mut desc),
            Err(Error::UnsupportedBuffer(_))
        ));
        assert!(!ctx.is_ion_client_open());
        assert!(desc.base().is_none());
    }

    #[test]
    fn test_unregister_never_registered() {
        let ctx = Context::builder().ion(MemfdIon).build();
        let mut desc = BufferDescriptor::ion(memfd(4096), 4096);
        assert!(matches!(
            ctx.unregister(&mut desc),
            Err(Error::OwnershipMismatch { .. })
        ));
    }
}
