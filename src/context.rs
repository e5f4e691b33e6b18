//! The process-scoped context every buffer operation runs against.
//!
//! A [`Context`] owns what the buffer mapper shares across threads: the
//! mutex that serializes registration, the lazily opened backend sessions,
//! and the framebuffer mapping of each display output. Build one at startup
//! and share it, typically as `Arc<Context>`.

use crate::backend::{DmaBufIon, IonDevice, ShmUmpDriver, UmpDriver};
use crate::config::ContextConfig;
use crate::device::{Device, DeviceKind, DeviceOpener};
use crate::error::{Error, Result};
use crate::framebuffer::{DisplayOutput, FrameSlot, FramebufferInfo, FramebufferMapper};
use rustix::fd::OwnedFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

/// Global counter for context ids.
static CONTEXT_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Identity of the context that created a mapping.
///
/// Registration stamps this into the descriptor; only a context presenting
/// the same token may tear the mapping down. The pid alone is not enough
/// because several contexts can live in one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerToken {
    pid: i32,
    context: u64,
}

impl OwnerToken {
    /// Process the context lives in.
    #[inline]
    pub fn pid(self) -> i32 {
        self.pid
    }
}

/// State guarded by the context mutex.
#[derive(Debug)]
pub(crate) struct ModuleState {
    pub(crate) ump_open: bool,
    pub(crate) primary: FramebufferMapper,
    pub(crate) external: FramebufferMapper,
}

impl ModuleState {
    pub(crate) fn framebuffer(&mut self, output: DisplayOutput) -> &mut FramebufferMapper {
        match output {
            DisplayOutput::Primary => &mut self.primary,
            DisplayOutput::External => &mut self.external,
        }
    }
}

/// Process-wide buffer mapping state.
///
/// # Example
///
/// ```rust,ignore
/// use gralloc::{Context, Rect, Usage};
///
/// let ctx = Context::new();
/// ctx.register(&mut desc)?;
/// let ptr = ctx.lock(&mut desc, Usage::SW_READ_OFTEN, Rect::default())?;
/// ctx.unlock(&mut desc)?;
/// ctx.unregister(&mut desc)?;
/// ```
#[derive(Debug)]
pub struct Context {
    token: OwnerToken,
    config: ContextConfig,
    pub(crate) ump: Option<Arc<dyn UmpDriver>>,
    pub(crate) ion: Option<Arc<dyn IonDevice>>,
    devices: Option<Arc<dyn DeviceOpener>>,
    /// Opened once under the state mutex, read without it by unlock.
    pub(crate) ion_client: OnceLock<OwnedFd>,
    state: Mutex<ModuleState>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// Context with the default backends: UMP over POSIX shared memory and
    /// dma-heap ION.
    pub fn new() -> Self {
        Self::with_config(ContextConfig::default())
    }

    /// Context with the default backends, located through `config`.
    pub fn with_config(config: ContextConfig) -> Self {
        Self::builder()
            .ump(ShmUmpDriver::with_prefix(config.ump_shm_prefix.clone()))
            .ion(DmaBufIon::new(config.ion_client_path.clone()))
            .config(config)
            .build()
    }

    /// Start configuring a context. Backends left unset make their buffers
    /// unsupported.
    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    /// Token stamped on mappings this context creates.
    #[inline]
    pub fn token(&self) -> OwnerToken {
        self.token
    }

    /// Process id of this context.
    #[inline]
    pub fn pid(&self) -> i32 {
        self.token.pid
    }

    /// Active configuration.
    #[inline]
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Whether the ION client handle has been opened.
    #[inline]
    pub fn is_ion_client_open(&self) -> bool {
        self.ion_client.get().is_some()
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, ModuleState> {
        // Every mutation under the lock completes or is rolled back, so a
        // panic elsewhere cannot leave it half-written.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the framebuffer mapping of `output`.
    pub fn framebuffer(&self, output: DisplayOutput) -> Option<FramebufferInfo> {
        self.state().framebuffer(output).info()
    }

    /// Claim a free frame slot of the mapped framebuffer of `output`.
    pub fn acquire_frame(&self, output: DisplayOutput) -> Result<FrameSlot> {
        self.state().framebuffer(output).acquire_frame()
    }

    /// Return a frame slot of `output`.
    pub fn release_frame(&self, output: DisplayOutput, index: usize) -> Result<()> {
        self.state().framebuffer(output).release_frame(index)
    }

    /// Open the allocator (`"gpu0"`) or display (`"fb0"`) device.
    pub fn open_device(&self, name: &str) -> Result<Device> {
        let kind = DeviceKind::from_name(name)?;
        let opener = self
            .devices
            .as_ref()
            .ok_or_else(|| Error::DeviceUnavailable(format!("no opener for {name}")))?;

        tracing::debug!(device = name, "opening device");
        match kind {
            DeviceKind::Allocator => opener.open_allocator(self).map(Device::Allocator),
            DeviceKind::Display => opener.open_display(self).map(Device::Display),
        }
    }
}

/// Builder for [`Context`].
#[derive(Debug, Default)]
pub struct ContextBuilder {
    config: ContextConfig,
    ump: Option<Arc<dyn UmpDriver>>,
    ion: Option<Arc<dyn IonDevice>>,
    devices: Option<Arc<dyn DeviceOpener>>,
}

impl ContextBuilder {
    /// Use `config`.
    pub fn config(mut self, config: ContextConfig) -> Self {
        self.config = config;
        self
    }

    /// UMP driver for secure-id buffers.
    pub fn ump(mut self, driver: impl UmpDriver + 'static) -> Self {
        self.ump = Some(Arc::new(driver));
        self
    }

    /// ION device for share-fd buffers.
    pub fn ion(mut self, device: impl IonDevice + 'static) -> Self {
        self.ion = Some(Arc::new(device));
        self
    }

    /// Opener behind [`Context::open_device`].
    pub fn devices(mut self, opener: impl DeviceOpener + 'static) -> Self {
        self.devices = Some(Arc::new(opener));
        self
    }

    /// Finish the context.
    pub fn build(self) -> Context {
        let token = OwnerToken {
            pid: rustix::process::getpid().as_raw_nonzero().get(),
            context: CONTEXT_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
        };

        Context {
            token,
            config: self.config,
            ump: self.ump,
            ion: self.ion,
            devices: self.devices,
            ion_client: OnceLock::new(),
            state: Mutex::new(ModuleState {
                ump_open: false,
                primary: FramebufferMapper::new(DisplayOutput::Primary),
                external: FramebufferMapper::new(DisplayOutput::External),
            }),
        }
    }
}
