//! Bounded waits.

use std::time::Duration;

/// How long a blocking call may wait.
///
/// Waiting forever is possible but has to be asked for by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    After(Duration),
    Never,
}

impl Timeout {
    /// Absolute `CLOCK_REALTIME` deadline, as the pthread and semaphore timed
    /// waits expect. `None` for [`Timeout::Never`].
    pub(crate) fn deadline(self) -> Option<libc::timespec> {
        match self {
            Timeout::After(d) => Some(realtime_after(d)),
            Timeout::Never => None,
        }
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Timeout::After(d)
    }
}

fn realtime_after(d: Duration) -> libc::timespec {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `now` is a valid, writable timespec.
    let r = unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) };
    // CLOCK_REALTIME is always supported; failure here means a broken libc.
    assert_eq!(r, 0, "clock_gettime(CLOCK_REALTIME) failed");

    let add_secs = libc::time_t::try_from(d.as_secs()).unwrap_or(libc::time_t::MAX);
    let mut sec = now.tv_sec.saturating_add(add_secs);
    let mut nsec = now.tv_nsec + d.subsec_nanos() as libc::c_long;
    if nsec >= 1_000_000_000 {
        sec = sec.saturating_add(1);
        nsec -= 1_000_000_000;
    }

    libc::timespec {
        tv_sec: sec,
        tv_nsec: nsec,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_has_no_deadline() {
        assert!(Timeout::Never.deadline().is_none());
    }

    #[test]
    fn deadline_normalizes_nanoseconds() {
        let ts = Timeout::After(Duration::from_millis(1999)).deadline().unwrap();
        assert!(ts.tv_nsec >= 0 && ts.tv_nsec < 1_000_000_000);
    }

    #[test]
    fn huge_timeouts_saturate() {
        let ts = Timeout::After(Duration::MAX).deadline().unwrap();
        assert_eq!(ts.tv_sec, libc::time_t::MAX);
    }
}
