// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use anyhow::bail;
use anyhow::Result;
use log::warn;
use std::io;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;

pub const NSEC_PER_SEC: i64 = 1_000_000_000;

/// Floor applied when arming the clock. A deadline already in the past is
/// pushed out by this much so a re-arm never requests a zero or negative
/// expiration and cannot busy-loop on clock quantization.
pub const MIN_ARM_DELAY_NS: i64 = 50;

/// Current CLOCK_MONOTONIC time in nanoseconds.
pub fn now_ns() -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // Cannot fail with a valid clock id and timespec pointer.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as i64 * NSEC_PER_SEC + ts.tv_nsec as i64
}

/// One-shot monotonic timerfd armed with absolute deadlines. The fd is
/// non-blocking; waiting happens by polling [`ClockSource::pollable_fd`].
pub struct ClockSource {
    fd: OwnedFd,
}

impl ClockSource {
    pub fn new() -> Result<Self> {
        let raw = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_CLOEXEC | libc::TFD_NONBLOCK)
        };
        if raw < 0 {
            bail!("timerfd_create failed: {}", io::Error::last_os_error());
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(raw) },
        })
    }

    fn settime(&self, deadline_ns: i64) {
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: (deadline_ns / NSEC_PER_SEC) as libc::time_t,
                tv_nsec: (deadline_ns % NSEC_PER_SEC) as libc::c_long,
            },
        };
        let rc = unsafe {
            libc::timerfd_settime(
                self.fd.as_raw_fd(),
                libc::TFD_TIMER_ABSTIME,
                &spec,
                std::ptr::null_mut(),
            )
        };
        if rc < 0 {
            warn!("timerfd_settime failed: {}", io::Error::last_os_error());
        }
    }

    /// Arm for an absolute CLOCK_MONOTONIC deadline, clamped to the minimum
    /// re-arm floor.
    pub fn arm_at(&self, deadline_ns: i64) {
        self.settime(deadline_ns.max(now_ns() + MIN_ARM_DELAY_NS));
    }

    /// Disarm. A zero it_value clears any pending expiration.
    pub fn disarm(&self) {
        self.settime(0);
    }

    /// Consume the pending expiration count, 0 if the clock has not fired
    /// since the last drain.
    pub fn drain(&self) -> u64 {
        let mut buf = [0u8; 8];
        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n == 8 {
            u64::from_ne_bytes(buf)
        } else {
            0
        }
    }

    pub fn pollable_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn test_now_monotonic() {
        let a = now_ns();
        let b = now_ns();
        assert!(a > 0);
        assert!(b >= a);
    }

    #[test]
    fn test_arm_and_drain() {
        let clock = ClockSource::new().unwrap();
        assert_eq!(clock.drain(), 0);

        clock.arm_at(now_ns() + 2_000_000);
        sleep(Duration::from_millis(20));
        assert_eq!(clock.drain(), 1);
        assert_eq!(clock.drain(), 0);
    }

    #[test]
    fn test_disarm() {
        let clock = ClockSource::new().unwrap();
        clock.arm_at(now_ns() + 2_000_000);
        clock.disarm();
        sleep(Duration::from_millis(20));
        assert_eq!(clock.drain(), 0);
    }

    #[test]
    fn test_past_deadline_respects_floor() {
        let clock = ClockSource::new().unwrap();
        clock.arm_at(now_ns() - NSEC_PER_SEC);
        sleep(Duration::from_millis(5));
        assert_eq!(clock.drain(), 1);
    }
}
