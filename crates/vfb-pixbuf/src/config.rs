use std::path::PathBuf;
use std::time::Duration;

use vfb_ipc::names::DEFAULT_MARKER_DIR;
use vfb_ipc::{ResourceNames, Timeout};

/// Configuration shared by [`PixbufWriter`](crate::PixbufWriter) and
/// [`PixbufReader`](crate::PixbufReader).
#[derive(Debug, Clone)]
pub struct PixbufConfig {
    /// How long a write waits for the lock before dropping the frame.
    pub write_timeout: Timeout,
    /// How long a read waits for the lock before failing.
    pub read_timeout: Timeout,
    /// Where election marker files live.
    pub marker_dir: PathBuf,
}

impl Default for PixbufConfig {
    fn default() -> Self {
        Self {
            write_timeout: Timeout::After(Duration::from_secs(2)),
            read_timeout: Timeout::After(Duration::from_secs(1)),
            marker_dir: PathBuf::from(DEFAULT_MARKER_DIR),
        }
    }
}

impl PixbufConfig {
    pub fn with_write_timeout(mut self, timeout: impl Into<Timeout>) -> Self {
        self.write_timeout = timeout.into();
        self
    }

    pub fn with_read_timeout(mut self, timeout: impl Into<Timeout>) -> Self {
        self.read_timeout = timeout.into();
        self
    }

    pub fn with_marker_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.marker_dir = dir.into();
        self
    }

    /// Derive the shared object names for `base` under this configuration.
    pub fn names(&self, base: &str) -> vfb_ipc::Result<ResourceNames> {
        ResourceNames::new(base, &self.marker_dir)
    }
}
