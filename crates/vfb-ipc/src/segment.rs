//! Named, resizable POSIX shared-memory segments.
//!
//! A [`Segment`] owns one `shm_open` descriptor and this process's mapping of
//! it. The process that opens in [`Mode::Writer`] owns the backing
//! allocation and may grow or shrink it; [`Mode::Reader`] processes only
//! resize their own view.
//!
//! Mapped sizes are always whole pages. The base address may move on every
//! [`Segment::resize`], so callers re-fetch [`Segment::map`] afterwards.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::{self, NonNull};
use std::sync::OnceLock;

use crate::error::{Error, Result};

/// Who owns the backing allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Creates the object if needed and sizes the backing allocation.
    Writer,
    /// Attaches to an existing object; never creates or sizes it.
    Reader,
}

/// The platform page size.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: sysconf has no memory-safety preconditions.
        let ps = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if ps > 0 {
            ps as usize
        } else {
            4096
        }
    })
}

/// Round `size` up to a multiple of `page`, never below one page.
///
/// `None` if the rounded size does not fit in a `usize`.
pub fn round_up(size: usize, page: usize) -> Option<usize> {
    size.div_ceil(page).max(1).checked_mul(page)
}

/// Round `size` up to a whole number of platform pages.
pub fn round_up_to_page(size: usize) -> Option<usize> {
    round_up(size, page_size())
}

fn page_len(name: &str, size: usize) -> Result<usize> {
    round_up_to_page(size).ok_or_else(|| Error::Allocation {
        name: name.to_string(),
        size,
        source: io::Error::from_raw_os_error(libc::EOVERFLOW),
    })
}

/// Current mapping. Replaced as a unit after a successful remap.
#[derive(Debug, Clone, Copy)]
struct MapView {
    ptr: NonNull<u8>,
    len: usize,
}

/// A named shared-memory object mapped into this process.
pub struct Segment {
    name: String,
    mode: Mode,
    fd: OwnedFd,
    view: MapView,
}

// SAFETY: the mapping is process-wide and the descriptor is an owned fd.
// `Segment` itself has no interior mutability; access to the mapped bytes goes
// through raw pointers whose synchronization is the caller's job.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Open `name` and map `round_up_to_page(initial_size)` bytes.
    ///
    /// In [`Mode::Writer`] the object is created if missing and its backing
    /// allocation reserved; running out of space is [`Error::Allocation`].
    /// In [`Mode::Reader`] a missing object is [`Error::NotFound`], and an
    /// object whose creator has not sized it yet is [`Error::NotReady`].
    pub fn open(name: &str, mode: Mode, initial_size: usize) -> Result<Self> {
        let c_name = CString::new(name).map_err(|_| Error::InvalidName {
            name: name.to_string(),
            reason: "name must not contain NUL",
        })?;

        let mut flags = libc::O_RDWR | libc::O_CLOEXEC;
        if mode == Mode::Writer {
            flags |= libc::O_CREAT;
        }

        // SAFETY: `c_name` is a valid NUL-terminated string.
        let raw = unsafe { libc::shm_open(c_name.as_ptr(), flags, 0o644 as libc::mode_t) };
        if raw == -1 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::ENOENT) => Error::NotFound {
                    name: name.to_string(),
                },
                _ => Error::os("shm_open", name, err),
            });
        }
        // SAFETY: shm_open succeeded, so `raw` is an open descriptor we own.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let size = page_len(name, initial_size)?;
        match mode {
            Mode::Writer => reserve(&fd, name, size)?,
            Mode::Reader => {
                if backing_len(&fd, name)? < size {
                    return Err(Error::NotReady {
                        name: name.to_string(),
                    });
                }
            }
        }

        let ptr = map(&fd, name, size)?;
        tracing::debug!(name, ?mode, size, addr = ?ptr, "mapped shm");

        Ok(Self {
            name: name.to_string(),
            mode,
            fd,
            view: MapView { ptr, len: size },
        })
    }

    /// Change the mapped size to `round_up_to_page(new_size)`.
    ///
    /// A request that rounds to the current size returns without any syscall.
    /// A Reader only remaps. A Writer grows the backing allocation before
    /// remapping, and shrinks it after, so the mapping never extends past the
    /// end of the object. A failed remap leaves the previous mapping, size and
    /// backing allocation in effect.
    pub fn resize(&mut self, new_size: usize) -> Result<()> {
        let new_len = page_len(&self.name, new_size)?;
        let old = self.view;
        if new_len == old.len {
            return Ok(());
        }

        let writer = self.mode == Mode::Writer;
        if writer && new_len > old.len {
            reserve(&self.fd, &self.name, new_len)?;
        }

        // SAFETY: `old` describes a live mapping created by mmap/mremap that
        // this segment owns exclusively.
        let addr = unsafe {
            libc::mremap(
                old.ptr.as_ptr().cast(),
                old.len,
                new_len,
                libc::MREMAP_MAYMOVE,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(Error::Remap {
                name: self.name.clone(),
                from: old.len,
                to: new_len,
                source: io::Error::last_os_error(),
            });
        }
        let Some(ptr) = NonNull::new(addr.cast::<u8>()) else {
            return Err(Error::Remap {
                name: self.name.clone(),
                from: old.len,
                to: new_len,
                source: io::Error::from(io::ErrorKind::InvalidData),
            });
        };

        tracing::debug!(name = %self.name, from = old.len, to = new_len, addr = ?ptr, "remapped shm");
        self.view = MapView { ptr, len: new_len };

        if writer && new_len < old.len {
            // The view is already the smaller size; a failure here only leaves
            // extra backing behind it.
            truncate(&self.fd, &self.name, new_len)?;
        }
        Ok(())
    }

    /// Base of the current mapping. Invalidated by [`Segment::resize`].
    #[inline]
    pub fn map(&self) -> NonNull<u8> {
        self.view.ptr
    }

    /// Current mapped size in bytes, always a whole number of pages.
    #[inline]
    pub fn size(&self) -> usize {
        self.view.len
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Size of the backing object as the kernel sees it.
    pub fn backing_size(&self) -> Result<usize> {
        backing_len(&self.fd, &self.name)
    }

    /// Remove `name` from the shm namespace. Returns `false` if it did not
    /// exist. Existing mappings stay valid.
    pub fn unlink(name: &str) -> Result<bool> {
        let c_name = CString::new(name).map_err(|_| Error::InvalidName {
            name: name.to_string(),
            reason: "name must not contain NUL",
        })?;
        // SAFETY: `c_name` is a valid NUL-terminated string.
        if unsafe { libc::shm_unlink(c_name.as_ptr()) } == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ENOENT) => Ok(false),
            _ => Err(Error::os("shm_unlink", name, err)),
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        // SAFETY: the view is a live mapping owned by this segment.
        let r = unsafe { libc::munmap(self.view.ptr.as_ptr().cast(), self.view.len) };
        if r != 0 {
            tracing::warn!(name = %self.name, "munmap failed: {}", io::Error::last_os_error());
        } else {
            tracing::debug!(name = %self.name, size = self.view.len, "unmapped shm");
        }
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("addr", &self.view.ptr)
            .field("size", &self.view.len)
            .finish()
    }
}

fn map(fd: &OwnedFd, name: &str, size: usize) -> Result<NonNull<u8>> {
    // SAFETY: a fresh shared mapping of an open descriptor; it does not alias
    // any Rust object in this process.
    let addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd.as_raw_fd(),
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(Error::os("mmap", name, io::Error::last_os_error()));
    }
    NonNull::new(addr.cast::<u8>())
        .ok_or_else(|| Error::os("mmap", name, io::Error::from(io::ErrorKind::InvalidData)))
}

/// Make sure the backing object holds at least `size` bytes of real storage.
fn reserve(fd: &OwnedFd, name: &str, size: usize) -> Result<()> {
    // posix_fallocate reports errors through its return value, not errno.
    // SAFETY: plain syscall on an owned descriptor.
    let r = unsafe { libc::posix_fallocate(fd.as_raw_fd(), 0, size as libc::off_t) };
    if r != 0 {
        return Err(Error::Allocation {
            name: name.to_string(),
            size,
            source: io::Error::from_raw_os_error(r),
        });
    }
    Ok(())
}

fn truncate(fd: &OwnedFd, name: &str, size: usize) -> Result<()> {
    // SAFETY: plain syscall on an owned descriptor.
    if unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) } == -1 {
        return Err(Error::Allocation {
            name: name.to_string(),
            size,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

fn backing_len(fd: &OwnedFd, name: &str) -> Result<usize> {
    let mut st = std::mem::MaybeUninit::<libc::stat>::uninit();
    // SAFETY: `st` is writable storage for one `stat`.
    if unsafe { libc::fstat(fd.as_raw_fd(), st.as_mut_ptr()) } == -1 {
        return Err(Error::os("fstat", name, io::Error::last_os_error()));
    }
    // SAFETY: fstat succeeded and filled `st`.
    let st = unsafe { st.assume_init() };
    Ok(st.st_size.max(0) as usize)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    struct Name(String);

    impl Name {
        fn new(tag: &str) -> Self {
            let n = COUNTER.fetch_add(1, Ordering::Relaxed);
            Name(format!("/vfb-seg-{tag}-{}-{n}", std::process::id()))
        }
    }

    impl Drop for Name {
        fn drop(&mut self) {
            let _ = Segment::unlink(&self.0);
        }
    }

    unsafe fn bytes(seg: &Segment) -> &[u8] {
        unsafe { std::slice::from_raw_parts(seg.map().as_ptr(), seg.size()) }
    }

    #[test]
    fn round_up_is_page_granular() {
        assert_eq!(round_up(0, 4096), Some(4096));
        assert_eq!(round_up(1, 4096), Some(4096));
        assert_eq!(round_up(4096, 4096), Some(4096));
        assert_eq!(round_up(4097, 4096), Some(8192));
        assert_eq!(round_up_to_page(1).unwrap() % page_size(), 0);
    }

    #[test]
    fn round_up_near_usize_max_overflows_to_none() {
        assert_eq!(round_up(usize::MAX, 4096), None);
        assert_eq!(round_up(usize::MAX - 4094, 4096), None);
        assert_eq!(round_up(usize::MAX - 4095, 4096), Some(usize::MAX - 4095));
        assert_eq!(round_up(usize::MAX - 4095 - 4095, 4096), Some(usize::MAX - 4095));
    }

    #[test]
    fn oversized_requests_are_allocation_errors() {
        let name = Name::new("huge");
        let mut seg = Segment::open(&name.0, Mode::Writer, 1).unwrap();
        let before = seg.map();

        let err = seg.resize(1 << 50).unwrap_err();
        assert!(matches!(err, Error::Allocation { .. }), "{err}");
        assert_eq!(seg.size(), page_size());
        assert_eq!(seg.map(), before);
        assert_eq!(seg.backing_size().unwrap(), page_size());

        let err = seg.resize(usize::MAX).unwrap_err();
        assert!(matches!(err, Error::Allocation { .. }), "{err}");
        assert_eq!(seg.size(), page_size());

        let other = Name::new("huge-open");
        let err = Segment::open(&other.0, Mode::Reader, usize::MAX).unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }), "{err}");
        let err = Segment::open(&name.0, Mode::Writer, usize::MAX).unwrap_err();
        assert!(matches!(err, Error::Allocation { .. }), "{err}");

        // The failed requests left the segment usable.
        seg.resize(page_size() * 2).unwrap();
        assert_eq!(seg.size(), page_size() * 2);
    }

    #[test]
    fn writer_shrink_never_maps_past_backing() {
        let name = Name::new("shrink");
        let mut seg = Segment::open(&name.0, Mode::Writer, page_size() * 6).unwrap();
        for pages in [2, 5, 1, 3, 1] {
            seg.resize(page_size() * pages).unwrap();
            assert_eq!(seg.size(), page_size() * pages);
            assert_eq!(seg.backing_size().unwrap(), seg.size());
            // Every mapped byte is backed.
            unsafe { seg.map().as_ptr().write_bytes(0x11, seg.size()) };
        }
    }

    #[test]
    fn reader_open_of_missing_name_is_not_found() {
        let name = Name::new("missing");
        let err = Segment::open(&name.0, Mode::Reader, 8).unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }), "{err}");
        // The failed read must not have created anything.
        assert!(!Segment::unlink(&name.0).unwrap());
    }

    #[test]
    fn writer_maps_whole_pages_and_reserves_backing() {
        let name = Name::new("writer");
        let seg = Segment::open(&name.0, Mode::Writer, 10).unwrap();
        assert_eq!(seg.size(), page_size());
        assert!(seg.backing_size().unwrap() >= seg.size());
    }

    #[test]
    fn reader_sees_writer_bytes() {
        let name = Name::new("share");
        let writer = Segment::open(&name.0, Mode::Writer, 64).unwrap();
        unsafe { writer.map().as_ptr().write_bytes(0xab, 64) };

        let reader = Segment::open(&name.0, Mode::Reader, 64).unwrap();
        assert!(unsafe { bytes(&reader) }[..64].iter().all(|&b| b == 0xab));
    }

    #[test]
    fn reader_refuses_to_map_past_backing_size() {
        let name = Name::new("short");
        let _writer = Segment::open(&name.0, Mode::Writer, 1).unwrap();
        let err = Segment::open(&name.0, Mode::Reader, page_size() * 4).unwrap_err();
        assert!(matches!(err, Error::NotReady { .. }), "{err}");
    }

    #[test]
    fn resize_to_same_page_count_is_noop() {
        let name = Name::new("noop");
        let mut seg = Segment::open(&name.0, Mode::Writer, 100).unwrap();
        let before = seg.map();
        seg.resize(page_size() - 1).unwrap();
        assert_eq!(seg.map(), before);
        assert_eq!(seg.size(), page_size());
    }

    #[test]
    fn writer_resize_preserves_bytes_and_tracks_backing() {
        let name = Name::new("grow");
        let mut seg = Segment::open(&name.0, Mode::Writer, 16).unwrap();
        unsafe { seg.map().as_ptr().copy_from_nonoverlapping(b"0123456789abcdef".as_ptr(), 16) };

        seg.resize(page_size() * 8 + 1).unwrap();
        assert_eq!(seg.size(), page_size() * 9);
        assert!(seg.backing_size().unwrap() >= seg.size());
        assert_eq!(&unsafe { bytes(&seg) }[..16], b"0123456789abcdef");

        seg.resize(1).unwrap();
        assert_eq!(seg.size(), page_size());
        assert_eq!(seg.backing_size().unwrap(), page_size());
        assert_eq!(&unsafe { bytes(&seg) }[..16], b"0123456789abcdef");
    }

    #[test]
    fn reader_resize_follows_writer_without_touching_backing() {
        let name = Name::new("follow");
        let mut writer = Segment::open(&name.0, Mode::Writer, 1).unwrap();
        let mut reader = Segment::open(&name.0, Mode::Reader, 1).unwrap();

        writer.resize(page_size() * 3).unwrap();
        let tail = page_size() * 3 - 1;
        unsafe { writer.map().as_ptr().add(tail).write(0x5a) };

        reader.resize(page_size() * 3).unwrap();
        assert_eq!(reader.size(), page_size() * 3);
        assert_eq!(unsafe { bytes(&reader) }[tail], 0x5a);

        // Shrinking the reader's view leaves the writer's allocation alone.
        reader.resize(1).unwrap();
        assert_eq!(reader.size(), page_size());
        assert_eq!(writer.backing_size().unwrap(), page_size() * 3);
    }
}
