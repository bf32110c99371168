// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use crate::clock::now_ns;
use crate::clock::ClockSource;
use crate::timer::TimerId;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::debug;
use log::error;
use log::warn;
use nix::poll::poll;
use nix::poll::PollFd;
use nix::poll::PollFlags;
use nix::poll::PollTimeout;
use std::borrow::Borrow;
use std::collections::BTreeSet;
use std::io;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::thread;
use std::thread::JoinHandle;

/// Implemented by timer services. The ticker delivers deadline callbacks
/// through it with no ticker lock held.
pub trait Expiry: Send + Sync {
    fn expire(&self, timer_id: TimerId);
}

/// Registration key. Ids are process-unique so the order is total.
type DeadlineKey = (i64, TimerId);

struct Entry {
    key: DeadlineKey,
    owner: Weak<dyn Expiry>,
}

impl Entry {
    fn scheduled_ns(&self) -> i64 {
        self.key.0
    }

    fn id(&self) -> TimerId {
        self.key.1
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}

impl Borrow<DeadlineKey> for Entry {
    fn borrow(&self) -> &DeadlineKey {
        &self.key
    }
}

struct Registry {
    entries: BTreeSet<Entry>,
    /// Deadline the clock is currently armed for, None when disarmed.
    armed_for: Option<i64>,
    max_running: usize,
}

struct TickerCore {
    clock: ClockSource,
    /// Written once to wake the wait thread for shutdown.
    shutdown: OwnedFd,
    registry: Mutex<Registry>,
    /// Wakes that found nothing due.
    drained: AtomicU64,
}

impl TickerCore {
    /// Re-arm (or disarm) the clock for the earliest registered deadline.
    /// Caller holds the registry lock.
    fn rearm(&self, registry: &mut Registry) {
        let earliest = registry.entries.first().map(|e| e.scheduled_ns());
        if earliest != registry.armed_for {
            match earliest {
                Some(ns) => self.clock.arm_at(ns),
                None => self.clock.disarm(),
            }
            registry.armed_for = earliest;
        }
    }

    /// Pop every entry due at `now`, in (scheduled_ns, id) order, and re-arm
    /// for whatever remains.
    fn pop_due(&self, now: i64) -> Vec<Entry> {
        let mut registry = self.registry.lock().unwrap();
        let mut due = Vec::new();
        while registry
            .entries
            .first()
            .is_some_and(|e| e.scheduled_ns() <= now)
        {
            if let Some(entry) = registry.entries.pop_first() {
                due.push(entry);
            }
        }
        self.rearm(&mut registry);
        due
    }
}

fn wait_loop(core: Arc<TickerCore>) {
    loop {
        let mut fds = [
            PollFd::new(core.clock.pollable_fd(), PollFlags::POLLIN),
            PollFd::new(core.shutdown.as_fd(), PollFlags::POLLIN),
        ];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                error!("ticker: poll failed: {}", e);
                break;
            }
        }
        if fds[1]
            .revents()
            .map_or(false, |r| r.intersects(PollFlags::POLLIN))
        {
            debug!("ticker: wait thread shutting down");
            break;
        }

        core.clock.drain();
        let due = core.pop_due(now_ns());
        if due.is_empty() {
            core.drained.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        // Callbacks run with no lock held, in ascending deadline order.
        for entry in due {
            if let Some(owner) = entry.owner.upgrade() {
                owner.expire(entry.id());
            }
        }
    }
}

/// Owns the single OS timer shared by every timer service in the process:
/// a registry of armed deadlines across all services and a dedicated wait
/// thread that delivers expiry callbacks for the earliest of them.
pub struct Ticker {
    /// None when the clock or the wait thread could not be created. An
    /// inert ticker accepts registrations but never expires them.
    core: Option<Arc<TickerCore>>,
    wait_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Ticker {
    pub fn new() -> Self {
        match Self::init() {
            Ok(ticker) => ticker,
            Err(e) => {
                error!(
                    "ticker: initialization failed: {:#}; registered timers will never expire",
                    e
                );
                Self {
                    core: None,
                    wait_thread: Mutex::new(None),
                }
            }
        }
    }

    fn init() -> Result<Self> {
        let clock = ClockSource::new().context("creating ticker clock")?;
        let raw = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if raw < 0 {
            bail!("eventfd failed: {}", io::Error::last_os_error());
        }
        let shutdown = unsafe { OwnedFd::from_raw_fd(raw) };
        let core = Arc::new(TickerCore {
            clock,
            shutdown,
            registry: Mutex::new(Registry {
                entries: BTreeSet::new(),
                armed_for: None,
                max_running: 0,
            }),
            drained: AtomicU64::new(0),
        });
        let thread_core = core.clone();
        let handle = thread::Builder::new()
            .name("anr-ticker".to_string())
            .spawn(move || wait_loop(thread_core))
            .context("spawning ticker wait thread")?;
        Ok(Self {
            core: Some(core),
            wait_thread: Mutex::new(Some(handle)),
        })
    }

    pub fn is_ready(&self) -> bool {
        self.core.is_some()
    }

    /// Register a deadline. Re-arms the clock when it becomes the earliest.
    pub(crate) fn insert(&self, scheduled_ns: i64, id: TimerId, owner: Weak<dyn Expiry>) {
        let Some(core) = &self.core else { return };
        let mut registry = core.registry.lock().unwrap();
        registry.entries.insert(Entry {
            key: (scheduled_ns, id),
            owner,
        });
        registry.max_running = registry.max_running.max(registry.entries.len());
        core.rearm(&mut registry);
    }

    /// Remove one registration. No-op when absent.
    pub(crate) fn remove(&self, scheduled_ns: i64, id: TimerId) {
        let Some(core) = &self.core else { return };
        let mut registry = core.registry.lock().unwrap();
        registry.entries.remove(&(scheduled_ns, id));
        core.rearm(&mut registry);
    }

    /// Remove every registration owned by a service, identified by its
    /// allocation address. Used at service destruction.
    pub(crate) fn remove_all(&self, owner: *const ()) {
        let Some(core) = &self.core else { return };
        let mut registry = core.registry.lock().unwrap();
        registry
            .entries
            .retain(|e| e.owner.as_ptr() as *const () != owner);
        core.rearm(&mut registry);
    }

    pub fn running_count(&self) -> usize {
        match &self.core {
            Some(core) => core.registry.lock().unwrap().entries.len(),
            None => 0,
        }
    }

    pub fn max_running_count(&self) -> usize {
        match &self.core {
            Some(core) => core.registry.lock().unwrap().max_running,
            None => 0,
        }
    }

    pub fn drained_count(&self) -> u64 {
        match &self.core {
            Some(core) => core.drained.load(Ordering::Relaxed),
            None => 0,
        }
    }
}

impl Default for Ticker {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        let Some(core) = &self.core else { return };
        let one: u64 = 1;
        let rc = unsafe {
            libc::write(
                core.shutdown.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                8,
            )
        };
        if rc != 8 {
            warn!("ticker: shutdown signal failed");
        }
        if let Some(handle) = self.wait_thread.lock().unwrap().take() {
            // The last reference can be dropped from an expiry callback, in
            // which case this runs on the wait thread itself and must not
            // join it; the thread sees the shutdown fd and exits on its own.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

lazy_static::lazy_static! {
    static ref SYSTEM_TICKER: Arc<Ticker> = Arc::new(Ticker::new());
}

/// The process-wide shared ticker. Constructed lazily on first use; services
/// built without an explicit ticker share this one.
pub fn system_ticker() -> Arc<Ticker> {
    SYSTEM_TICKER.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    const MS: i64 = 1_000_000;

    struct Recorder {
        tx: Mutex<mpsc::Sender<TimerId>>,
    }

    impl Expiry for Recorder {
        fn expire(&self, timer_id: TimerId) {
            self.tx.lock().unwrap().send(timer_id).ok();
        }
    }

    fn recorder() -> (Arc<Recorder>, mpsc::Receiver<TimerId>) {
        let (tx, rx) = mpsc::channel();
        (
            Arc::new(Recorder {
                tx: Mutex::new(tx),
            }),
            rx,
        )
    }

    fn downgrade(owner: &Arc<Recorder>) -> Weak<dyn Expiry> {
        let owner: Arc<dyn Expiry> = owner.clone();
        let weak: Weak<dyn Expiry> = Arc::downgrade(&owner);
        weak
    }

    #[test]
    fn test_expiry_order() {
        let ticker = Ticker::new();
        assert!(ticker.is_ready());
        let (owner, rx) = recorder();

        let now = now_ns();
        ticker.insert(now + 60 * MS, 3, downgrade(&owner));
        ticker.insert(now + 20 * MS, 1, downgrade(&owner));
        ticker.insert(now + 40 * MS, 2, downgrade(&owner));
        assert_eq!(ticker.running_count(), 3);
        assert_eq!(ticker.max_running_count(), 3);

        for expected in 1..=3 {
            let id = rx.recv_timeout(Duration::from_secs(2)).unwrap();
            assert_eq!(id, expected);
        }
        assert_eq!(ticker.running_count(), 0);
    }

    #[test]
    fn test_same_deadline_breaks_ties_by_id() {
        let ticker = Ticker::new();
        let (owner, rx) = recorder();

        let when = now_ns() + 20 * MS;
        ticker.insert(when, 12, downgrade(&owner));
        ticker.insert(when, 11, downgrade(&owner));

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 11);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 12);
    }

    #[test]
    fn test_remove_prevents_expiry() {
        let ticker = Ticker::new();
        let (owner, rx) = recorder();

        let when = now_ns() + 50 * MS;
        ticker.insert(when, 1, downgrade(&owner));
        ticker.remove(when, 1);
        // Idempotent.
        ticker.remove(when, 1);

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(ticker.running_count(), 0);
    }

    #[test]
    fn test_remove_all_by_owner() {
        let ticker = Ticker::new();
        let (a, rx_a) = recorder();
        let (b, rx_b) = recorder();

        let now = now_ns();
        ticker.insert(now + 40 * MS, 1, downgrade(&a));
        ticker.insert(now + 40 * MS, 2, downgrade(&b));
        ticker.insert(now + 45 * MS, 3, downgrade(&a));
        ticker.remove_all(Arc::as_ptr(&a) as *const ());

        assert_eq!(ticker.running_count(), 1);
        assert_eq!(rx_b.recv_timeout(Duration::from_secs(2)).unwrap(), 2);
        assert!(rx_a.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_past_deadline_fires_immediately() {
        let ticker = Ticker::new();
        let (owner, rx) = recorder();

        ticker.insert(now_ns() - MS, 1, downgrade(&owner));
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 1);
    }

    #[test]
    fn test_dropped_owner_is_skipped() {
        let ticker = Ticker::new();
        let (owner, rx) = recorder();

        ticker.insert(now_ns() + 10 * MS, 1, downgrade(&owner));
        drop(owner);
        drop(rx);
        // Nothing to assert beyond "does not crash"; the wake discards the
        // dead registration.
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(ticker.running_count(), 0);
    }

    #[test]
    fn test_shutdown_joins_wait_thread() {
        let ticker = Ticker::new();
        let (owner, _rx) = recorder();
        ticker.insert(now_ns() + 500 * MS, 1, downgrade(&owner));
        drop(ticker);
    }
}
