//! Derivation of every OS-level name from one caller-supplied base name.
//!
//! A base name (typically a window identifier) fans out into:
//!
//! ```text
//! base = "win42"
//!   /win42             frame segment (shm_open)
//!   /win42_mu          lock segment holding the robust mutex (shm_open)
//!   <dir>/win42_mu     election marker file (flock)
//!   /win42_mu          counting semaphore (sem_open, separate namespace)
//!   /win42_mu_gen      semaphore's gate and generation counter (shm_open)
//!   <dir>/win42_mu.sem election marker for the semaphore (flock)
//! ```

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Directory used for election marker files unless configured otherwise.
pub const DEFAULT_MARKER_DIR: &str = "/tmp";

/// Longest accepted base name. Leaves room for the suffixes and for glibc's
/// `sem.` prefix under NAME_MAX.
pub const MAX_BASE_LEN: usize = 200;

/// The set of names derived from one base name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNames {
    base: String,
    marker_dir: PathBuf,
}

impl ResourceNames {
    /// Validate `base` and derive names, placing marker files in `marker_dir`.
    pub fn new(base: &str, marker_dir: impl Into<PathBuf>) -> Result<Self> {
        validate_base(base)?;
        Ok(Self {
            base: base.to_string(),
            marker_dir: marker_dir.into(),
        })
    }

    /// Like [`ResourceNames::new`] with [`DEFAULT_MARKER_DIR`].
    pub fn with_default_dir(base: &str) -> Result<Self> {
        Self::new(base, DEFAULT_MARKER_DIR)
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn marker_dir(&self) -> &Path {
        &self.marker_dir
    }

    /// Name of the frame segment.
    pub fn segment(&self) -> String {
        format!("/{}", self.base)
    }

    /// Name of the lock segment, and of the counting semaphore.
    pub fn lock(&self) -> String {
        format!("/{}_mu", self.base)
    }

    /// Advisory-lock file used to elect the lock's creator.
    pub fn marker(&self) -> PathBuf {
        self.marker_dir.join(format!("{}_mu", self.base))
    }

    /// Segment holding the semaphore's gate and generation counter.
    pub fn sem_generation(&self) -> String {
        format!("{}_gen", self.lock())
    }

    /// Advisory-lock file used to elect the semaphore's creator.
    pub fn sem_marker(&self) -> PathBuf {
        self.marker_dir.join(format!("{}_mu.sem", self.base))
    }
}

fn validate_base(base: &str) -> Result<()> {
    let reason = if base.is_empty() {
        Some("name must not be empty")
    } else if base.contains('/') {
        Some("name must not contain '/'")
    } else if base.contains('\0') {
        Some("name must not contain NUL")
    } else if base.len() > MAX_BASE_LEN {
        Some("name is too long")
    } else if base == "." || base == ".." {
        Some("name must not be a relative path component")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(Error::InvalidName {
            name: base.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_all_names_from_base() {
        let names = ResourceNames::new("win42", "/run/vfb").unwrap();
        assert_eq!(names.segment(), "/win42");
        assert_eq!(names.lock(), "/win42_mu");
        assert_eq!(names.marker(), PathBuf::from("/run/vfb/win42_mu"));
        assert_eq!(names.sem_generation(), "/win42_mu_gen");
        assert_eq!(names.sem_marker(), PathBuf::from("/run/vfb/win42_mu.sem"));
    }

    #[test]
    fn default_marker_dir_is_tmp() {
        let names = ResourceNames::with_default_dir("0x3a00007").unwrap();
        assert_eq!(names.marker(), PathBuf::from("/tmp/0x3a00007_mu"));
    }

    #[test]
    fn rejects_bad_base_names() {
        for bad in ["", "a/b", "nul\0", "..", "."] {
            assert!(
                matches!(
                    ResourceNames::with_default_dir(bad),
                    Err(Error::InvalidName { .. })
                ),
                "{bad:?} should be rejected"
            );
        }
        let long = "x".repeat(MAX_BASE_LEN + 1);
        assert!(ResourceNames::with_default_dir(&long).is_err());
    }
}
