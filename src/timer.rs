// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use libc::pid_t;
use libc::uid_t;
use log::debug;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

/// Process-unique timer id.
pub type TimerId = u32;

/// Sentinel id, never allocated. cancel() on it is a no-op returning false,
/// release() a no-op returning true.
pub const NO_TIMER: TimerId = 0;

static NEXT_TIMER_ID: AtomicU32 = AtomicU32::new(1);

pub(crate) fn allocate_timer_id() -> TimerId {
    loop {
        let id = NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed);
        if id != NO_TIMER {
            return id;
        }
    }
}

/// Behavior at the split checkpoint, for timers the trace filter matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EarlyAction {
    None,
    /// Lifecycle transitions are logged.
    Trace,
    /// The timer expires at the split checkpoint instead of the full
    /// deadline.
    Expire,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerStatus {
    Running,
    Expired,
    Canceled,
}

/// Result of driving a running timer through one ticker wake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpireOutcome {
    /// Still running. Re-register at the timer's new scheduled_ns.
    /// `extended` is set when the postponement came from scheduling delay
    /// rather than a split checkpoint.
    Rearm { extended: bool },
    /// The timer expired. `freeze` asks the owning service to freeze the
    /// process, outside its lock.
    Expire { freeze: bool },
}

/// One scheduled deadline. Owned by a single service and mutated only under
/// that service's lock; the shared ticker sees nothing but (scheduled_ns, id).
#[derive(Debug)]
pub struct Timer {
    pub id: TimerId,
    pub pid: pid_t,
    pub uid: uid_t,
    pub timeout_ns: i64,
    pub extendable: bool,
    pub freeze_on_expiry: bool,
    /// 0 disables the split checkpoint.
    pub split_percent: u32,
    pub early_action: EarlyAction,
    pub status: TimerStatus,
    pub started_ns: i64,
    /// Absolute time of the next wake. Always >= started_ns.
    pub scheduled_ns: i64,
    pub in_split_phase: bool,
    pub was_extended: bool,
    pub frozen: bool,
    /// Scheduling delay observed at start, baseline for the extension.
    pub initial_cpu_delay_ns: i64,
}

impl Timer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: TimerId,
        pid: pid_t,
        uid: uid_t,
        timeout_ns: i64,
        extendable: bool,
        freeze_on_expiry: bool,
        split_percent: u32,
        early_action: EarlyAction,
        now_ns: i64,
        initial_cpu_delay_ns: i64,
    ) -> Self {
        let scheduled_ns = if split_percent > 0 {
            now_ns + timeout_ns * split_percent as i64 / 100
        } else {
            now_ns + timeout_ns
        };
        Self {
            id,
            pid,
            uid,
            timeout_ns,
            extendable,
            freeze_on_expiry,
            split_percent,
            early_action,
            status: TimerStatus::Running,
            started_ns: now_ns,
            scheduled_ns,
            in_split_phase: false,
            was_extended: false,
            frozen: false,
            initial_cpu_delay_ns,
        }
    }

    pub fn traced(&self) -> bool {
        self.early_action == EarlyAction::Trace
    }

    /// Whether the next wake takes the split-checkpoint branch.
    pub fn awaiting_split(&self) -> bool {
        self.split_percent > 0 && !self.in_split_phase
    }

    /// Whether the next wake could consume the one-shot extension, in which
    /// case the caller should supply fresh scheduling stats to on_expire().
    pub fn may_extend(&self) -> bool {
        !self.awaiting_split() && self.extendable && !self.was_extended
    }

    /// Drive the state machine for one wake. Checked in order: split
    /// checkpoint, one-shot extension, final expiry. A None cpu_delay_ns
    /// (process gone, stats unreadable) yields a zero extension.
    pub fn on_expire(&mut self, cpu_delay_ns: Option<i64>) -> ExpireOutcome {
        if self.awaiting_split() {
            self.in_split_phase = true;
            self.scheduled_ns = self.started_ns + self.timeout_ns;
            if self.early_action == EarlyAction::Expire {
                self.status = TimerStatus::Expired;
                return ExpireOutcome::Expire {
                    freeze: self.freeze_on_expiry,
                };
            }
            if self.traced() {
                debug!("timer {}: split checkpoint for pid {}", self.id, self.pid);
            }
            return ExpireOutcome::Rearm { extended: false };
        }

        if self.extendable && !self.was_extended {
            let current = cpu_delay_ns.unwrap_or(self.initial_cpu_delay_ns);
            let extension = (current - self.initial_cpu_delay_ns).clamp(0, self.timeout_ns);
            if extension > 0 {
                self.was_extended = true;
                self.scheduled_ns += extension;
                return ExpireOutcome::Rearm { extended: true };
            }
        }

        self.status = TimerStatus::Expired;
        ExpireOutcome::Expire {
            freeze: self.freeze_on_expiry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: i64 = 1_000_000;

    fn plain(timeout_ns: i64) -> Timer {
        Timer::new(
            1,
            100,
            1000,
            timeout_ns,
            false,
            false,
            0,
            EarlyAction::None,
            1_000 * MS,
            0,
        )
    }

    #[test]
    fn test_id_allocation_never_zero() {
        for _ in 0..1000 {
            assert_ne!(allocate_timer_id(), NO_TIMER);
        }
    }

    #[test]
    fn test_plain_expiry() {
        let mut t = plain(50 * MS);
        assert_eq!(t.scheduled_ns, t.started_ns + 50 * MS);
        assert_eq!(t.on_expire(None), ExpireOutcome::Expire { freeze: false });
        assert_eq!(t.status, TimerStatus::Expired);
        assert!(!t.was_extended);
    }

    #[test]
    fn test_freeze_requested_on_expiry() {
        let mut t = Timer::new(
            2,
            100,
            1000,
            50 * MS,
            false,
            true,
            0,
            EarlyAction::None,
            0,
            0,
        );
        assert_eq!(t.on_expire(None), ExpireOutcome::Expire { freeze: true });
    }

    #[test]
    fn test_split_then_full_expiry() {
        let mut t = Timer::new(
            3,
            100,
            1000,
            200 * MS,
            false,
            false,
            50,
            EarlyAction::Trace,
            0,
            0,
        );
        assert_eq!(t.scheduled_ns, 100 * MS);
        assert_eq!(t.on_expire(None), ExpireOutcome::Rearm { extended: false });
        assert!(t.in_split_phase);
        assert_eq!(t.status, TimerStatus::Running);
        assert_eq!(t.scheduled_ns, 200 * MS);
        assert_eq!(t.on_expire(None), ExpireOutcome::Expire { freeze: false });
    }

    #[test]
    fn test_split_early_expire() {
        let mut t = Timer::new(
            4,
            100,
            1000,
            200 * MS,
            false,
            true,
            50,
            EarlyAction::Expire,
            0,
            0,
        );
        assert_eq!(t.scheduled_ns, 100 * MS);
        assert_eq!(t.on_expire(None), ExpireOutcome::Expire { freeze: true });
        assert_eq!(t.status, TimerStatus::Expired);
    }

    #[test]
    fn test_split_100_percent_single_expiry() {
        let mut t = Timer::new(
            5,
            100,
            1000,
            200 * MS,
            false,
            false,
            100,
            EarlyAction::Trace,
            0,
            0,
        );
        // Split deadline equals the full deadline; the checkpoint re-arm
        // keeps scheduled_ns in place and the next wake expires for real.
        assert_eq!(t.scheduled_ns, 200 * MS);
        assert_eq!(t.on_expire(None), ExpireOutcome::Rearm { extended: false });
        assert_eq!(t.scheduled_ns, 200 * MS);
        assert_eq!(t.on_expire(None), ExpireOutcome::Expire { freeze: false });
    }

    #[test]
    fn test_extension_granted_once() {
        let mut t = Timer::new(
            6,
            100,
            1000,
            100 * MS,
            true,
            false,
            0,
            EarlyAction::None,
            0,
            5 * MS,
        );
        // 10ms of additional scheduling delay postpones the deadline by 10ms.
        assert_eq!(
            t.on_expire(Some(15 * MS)),
            ExpireOutcome::Rearm { extended: true }
        );
        assert!(t.was_extended);
        assert_eq!(t.scheduled_ns, 110 * MS);
        // No second extension no matter the delay.
        assert_eq!(
            t.on_expire(Some(500 * MS)),
            ExpireOutcome::Expire { freeze: false }
        );
    }

    #[test]
    fn test_extension_capped_at_timeout() {
        let mut t = Timer::new(
            7,
            100,
            1000,
            100 * MS,
            true,
            false,
            0,
            EarlyAction::None,
            0,
            0,
        );
        assert_eq!(
            t.on_expire(Some(10_000 * MS)),
            ExpireOutcome::Rearm { extended: true }
        );
        assert_eq!(t.scheduled_ns, 200 * MS);
    }

    #[test]
    fn test_zero_delay_means_no_extension() {
        let mut t = Timer::new(
            8,
            100,
            1000,
            100 * MS,
            true,
            false,
            0,
            EarlyAction::None,
            0,
            5 * MS,
        );
        assert_eq!(
            t.on_expire(Some(5 * MS)),
            ExpireOutcome::Expire { freeze: false }
        );
        assert!(!t.was_extended);
    }

    #[test]
    fn test_unreadable_stats_means_no_extension() {
        let mut t = Timer::new(
            9,
            100,
            1000,
            100 * MS,
            true,
            false,
            0,
            EarlyAction::None,
            0,
            5 * MS,
        );
        assert_eq!(t.on_expire(None), ExpireOutcome::Expire { freeze: false });
    }

    #[test]
    fn test_split_then_extension() {
        let mut t = Timer::new(
            10,
            100,
            1000,
            100 * MS,
            true,
            false,
            50,
            EarlyAction::Trace,
            0,
            0,
        );
        assert_eq!(t.on_expire(None), ExpireOutcome::Rearm { extended: false });
        assert_eq!(
            t.on_expire(Some(20 * MS)),
            ExpireOutcome::Rearm { extended: true }
        );
        assert_eq!(t.scheduled_ns, 120 * MS);
        assert_eq!(t.on_expire(None), ExpireOutcome::Expire { freeze: false });
    }

    #[test]
    fn test_zero_timeout() {
        let mut t = plain(0);
        assert_eq!(t.scheduled_ns, t.started_ns);
        assert_eq!(t.on_expire(None), ExpireOutcome::Expire { freeze: false });
    }

    #[test]
    fn test_scheduled_never_precedes_start() {
        let t = Timer::new(11, 100, 1000, 60 * MS, false, false, 25, EarlyAction::Expire, 0, 0);
        assert!(t.scheduled_ns >= t.started_ns);
        let mut t = plain(0);
        assert!(t.scheduled_ns >= t.started_ns);
        t.on_expire(None);
        assert!(t.scheduled_ns >= t.started_ns);
    }
}
