//! Context configuration and default constants.
//!
//! ```rust,ignore
//! use gralloc::{Context, ContextConfig};
//!
//! let ctx = Context::builder()
//!     .config(ContextConfig::default().zero_framebuffer(false))
//!     .build();
//! ```

use std::path::PathBuf;

// =============================================================================
// Device names and paths
// =============================================================================

/// Name `open_device` maps to the allocator device.
pub const GPU0: &str = "gpu0";

/// Name `open_device` maps to the display device.
pub const FB0: &str = "fb0";

/// Legacy ION device node.
pub const DEFAULT_ION_PATH: &str = "/dev/ion";

/// dma-heap used as the ION client on newer kernels.
pub const DEFAULT_DMA_HEAP_PATH: &str = "/dev/dma_heap/system";

/// Shared-memory object prefix for UMP secure ids.
pub const DEFAULT_UMP_SHM_PREFIX: &str = "/ump-";

// =============================================================================
// Limits
// =============================================================================

/// Frame slots tracked per framebuffer. Frames beyond this are counted but
/// never handed out by `acquire_frame`.
pub const MAX_FRAME_SLOTS: usize = 32;

/// Settings for a [`Context`](crate::Context).
///
/// The two paths only matter to [`Context::with_config`], which builds the
/// default backends from them. Backends injected through the builder bring
/// their own.
///
/// [`Context::with_config`]: crate::Context::with_config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextConfig {
    /// Device node opened as the ION client.
    pub ion_client_path: PathBuf,
    /// Shared-memory prefix UMP secure ids resolve under.
    pub ump_shm_prefix: String,
    /// Clear the whole framebuffer when it is first mapped.
    pub zero_framebuffer: bool,
    /// Ask the framebuffer driver for its UMP secure id after mapping.
    pub query_framebuffer_secure_id: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            ion_client_path: PathBuf::from(DEFAULT_DMA_HEAP_PATH),
            ump_shm_prefix: DEFAULT_UMP_SHM_PREFIX.to_string(),
            zero_framebuffer: true,
            query_framebuffer_secure_id: true,
        }
    }
}

impl ContextConfig {
    /// Set [`ContextConfig::ion_client_path`].
    pub fn ion_client_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ion_client_path = path.into();
        self
    }

    /// Set [`ContextConfig::ump_shm_prefix`].
    pub fn ump_shm_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.ump_shm_prefix = prefix.into();
        self
    }

    /// Set [`ContextConfig::zero_framebuffer`].
    pub fn zero_framebuffer(mut self, enabled: bool) -> Self {
        self.zero_framebuffer = enabled;
        self
    }

    /// Set [`ContextConfig::query_framebuffer_secure_id`].
    pub fn query_framebuffer_secure_id(mut self, enabled: bool) -> Self {
        self.query_framebuffer_secure_id = enabled;
        self
    }
}
