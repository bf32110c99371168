// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use crate::clock::now_ns;
use crate::process::ProcessOps;
use crate::process::ProcessProfile;
use crate::process::SystemProcessOps;
use crate::ticker::system_ticker;
use crate::ticker::Expiry;
use crate::ticker::Ticker;
use crate::timer::allocate_timer_id;
use crate::timer::EarlyAction;
use crate::timer::ExpireOutcome;
use crate::timer::Timer;
use crate::timer::TimerId;
use crate::timer::TimerStatus;
use crate::timer::NO_TIMER;
use crate::trace::system_trace_filter;
use crate::trace::TraceFilter;
use libc::pid_t;
use libc::uid_t;
use log::debug;
use log::error;
use log::info;
use log::warn;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

/// Expiry notification callback: (timer id, pid, uid, elapsed ns) -> bool.
/// Returning false means no listener consumed the expiry, in which case the
/// service discards the timer itself.
pub type NotifyFn = dyn Fn(TimerId, pid_t, uid_t, i64) -> bool + Send + Sync;

/// Monotonic event counts. Every started timer ends up in exactly one of
/// canceled, accepted or discarded; auto-discards after a failed
/// notification count as discarded.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Counters {
    pub started: u64,
    pub canceled: u64,
    pub accepted: u64,
    pub discarded: u64,
    pub expired: u64,
    pub extended: u64,
    pub released: u64,
    pub errors: u64,
}

struct Collections {
    running: BTreeMap<TimerId, Timer>,
    /// Expired, waiting for accept() or discard().
    expired: BTreeMap<TimerId, Timer>,
    /// Accepted while frozen, waiting for release().
    pending_release: BTreeMap<TimerId, Timer>,
    counters: Counters,
}

struct ServiceInner {
    label: String,
    extendable: bool,
    freeze: bool,
    notifier: Box<NotifyFn>,
    ticker: Arc<Ticker>,
    process: Arc<dyn ProcessOps>,
    tracing: Arc<TraceFilter>,
    state: Mutex<Collections>,
    weak_self: Weak<ServiceInner>,
}

/// Builds a [`TimerService`]. The ticker, process table and trace filter
/// default to the process-wide instances; tests inject isolated ones.
pub struct TimerServiceBuilder {
    label: String,
    extendable: bool,
    freeze: bool,
    ticker: Option<Arc<Ticker>>,
    process: Option<Arc<dyn ProcessOps>>,
    tracing: Option<Arc<TraceFilter>>,
}

impl TimerServiceBuilder {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            extendable: false,
            freeze: false,
            ticker: None,
            process: None,
            tracing: None,
        }
    }

    /// Grant expiring timers a one-shot deadline extension matching the
    /// scheduling delay the process accumulated while the timer ran.
    pub fn extendable(mut self, extendable: bool) -> Self {
        self.extendable = extendable;
        self
    }

    /// Freeze the process when its timer expires.
    pub fn freeze(mut self, freeze: bool) -> Self {
        self.freeze = freeze;
        self
    }

    pub fn ticker(mut self, ticker: Arc<Ticker>) -> Self {
        self.ticker = Some(ticker);
        self
    }

    pub fn process_ops(mut self, process: Arc<dyn ProcessOps>) -> Self {
        self.process = Some(process);
        self
    }

    pub fn trace_filter(mut self, tracing: Arc<TraceFilter>) -> Self {
        self.tracing = Some(tracing);
        self
    }

    pub fn build(self, notifier: Box<NotifyFn>) -> TimerService {
        let ticker = self.ticker.unwrap_or_else(system_ticker);
        if !ticker.is_ready() {
            error!(
                "{}: ticker unavailable, timers will never expire",
                self.label
            );
        }
        let inner = Arc::new_cyclic(|weak| ServiceInner {
            label: self.label,
            extendable: self.extendable,
            freeze: self.freeze,
            notifier,
            ticker,
            process: self
                .process
                .unwrap_or_else(|| Arc::new(SystemProcessOps::new())),
            tracing: self.tracing.unwrap_or_else(system_trace_filter),
            state: Mutex::new(Collections {
                running: BTreeMap::new(),
                expired: BTreeMap::new(),
                pending_release: BTreeMap::new(),
                counters: Counters::default(),
            }),
            weak_self: weak.clone(),
        });
        TimerService { inner }
    }
}

/// One timer domain. All operations are thread-safe; expiry callbacks come
/// from the shared ticker's wait thread.
pub struct TimerService {
    inner: Arc<ServiceInner>,
}

impl TimerService {
    /// Start a timer. Always succeeds and returns its id; a pid of 0 is
    /// accepted but logged and never frozen.
    pub fn start(&self, pid: pid_t, uid: uid_t, timeout_ns: i64) -> TimerId {
        self.inner.start(pid, uid, timeout_ns)
    }

    /// True iff the timer existed and was still running. A late cancel on
    /// an expired timer returns false and counts a protocol error.
    pub fn cancel(&self, id: TimerId) -> bool {
        self.inner.cancel(id)
    }

    /// Claim an expired timer. True iff it was frozen, meaning a release()
    /// is owed later; a non-frozen expired timer is disposed right away.
    pub fn accept(&self, id: TimerId) -> bool {
        self.inner.accept(id)
    }

    /// Drop an expired timer, unfreezing its process if needed.
    pub fn discard(&self, id: TimerId) -> bool {
        self.inner.discard(id)
    }

    /// Release a timer accepted while frozen, unfreezing its process.
    pub fn release(&self, id: TimerId) -> bool {
        self.inner.release(id)
    }

    pub fn counters(&self) -> Counters {
        self.inner.state.lock().unwrap().counters
    }

    /// Human-readable counters and collection sizes.
    pub fn dump(&self) -> Vec<String> {
        self.inner.dump()
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.inner
            .ticker
            .remove_all(Arc::as_ptr(&self.inner) as *const ());
    }
}

enum Wake {
    Rearmed,
    Expired {
        pid: pid_t,
        uid: uid_t,
        elapsed_ns: i64,
        freeze: bool,
    },
}

impl ServiceInner {
    fn start(&self, pid: pid_t, uid: uid_t, timeout_ns: i64) -> TimerId {
        let timeout_ns = timeout_ns.max(0);
        if pid == 0 {
            warn!("{}: timer started for pid 0", self.label);
        }
        let (split_percent, early_action) = self
            .tracing
            .policy_for(pid, &*self.process)
            .map(|p| (p.split_percent, p.action))
            .unwrap_or((0, EarlyAction::None));
        let initial_cpu_delay_ns = if self.extendable {
            self.process
                .read_schedule_stats(pid)
                .map(|s| s.cpu_delay_ns)
                .unwrap_or(0)
        } else {
            0
        };

        let id = allocate_timer_id();
        let timer = Timer::new(
            id,
            pid,
            uid,
            timeout_ns,
            self.extendable,
            self.freeze && pid != 0,
            split_percent,
            early_action,
            now_ns(),
            initial_cpu_delay_ns,
        );
        if timer.traced() {
            debug!(
                "{}: started timer {} for pid {} uid {} timeout {}ns",
                self.label, id, pid, uid, timeout_ns
            );
        }
        let scheduled_ns = timer.scheduled_ns;

        let mut state = self.state.lock().unwrap();
        state.counters.started += 1;
        state.running.insert(id, timer);
        self.ticker.insert(scheduled_ns, id, self.weak_self.clone());
        id
    }

    fn cancel(&self, id: TimerId) -> bool {
        if id == NO_TIMER {
            return false;
        }
        let mut state = self.state.lock().unwrap();
        if let Some(mut timer) = state.running.remove(&id) {
            timer.status = TimerStatus::Canceled;
            state.counters.canceled += 1;
            self.ticker.remove(timer.scheduled_ns, id);
            if timer.traced() {
                debug!("{}: canceled timer {}", self.label, id);
            }
            true
        } else if state.expired.contains_key(&id) || state.pending_release.contains_key(&id) {
            state.counters.errors += 1;
            debug!("{}: cancel on non-running timer {}", self.label, id);
            false
        } else {
            false
        }
    }

    fn accept(&self, id: TimerId) -> bool {
        if id == NO_TIMER {
            return false;
        }
        let mut state = self.state.lock().unwrap();
        if let Some(timer) = state.expired.remove(&id) {
            state.counters.accepted += 1;
            if timer.frozen {
                if timer.traced() {
                    debug!("{}: accepted frozen timer {}", self.label, id);
                }
                state.pending_release.insert(id, timer);
                true
            } else {
                // Nothing frozen, nothing to release later.
                false
            }
        } else if state.running.contains_key(&id) || state.pending_release.contains_key(&id) {
            state.counters.errors += 1;
            debug!("{}: accept on non-expired timer {}", self.label, id);
            false
        } else {
            false
        }
    }

    fn discard(&self, id: TimerId) -> bool {
        if id == NO_TIMER {
            return false;
        }
        let unfreeze = {
            let mut state = self.state.lock().unwrap();
            match state.expired.remove(&id) {
                Some(timer) => {
                    state.counters.discarded += 1;
                    if timer.traced() {
                        debug!("{}: discarded timer {}", self.label, id);
                    }
                    timer.frozen.then_some((timer.uid, timer.pid))
                }
                None => {
                    if state.running.contains_key(&id)
                        || state.pending_release.contains_key(&id)
                    {
                        state.counters.errors += 1;
                        debug!("{}: discard on non-expired timer {}", self.label, id);
                    }
                    return false;
                }
            }
        };
        if let Some((uid, pid)) = unfreeze {
            self.unfreeze(uid, pid);
        }
        true
    }

    fn release(&self, id: TimerId) -> bool {
        if id == NO_TIMER {
            return true;
        }
        let unfreeze = {
            let mut state = self.state.lock().unwrap();
            match state.pending_release.remove(&id) {
                Some(timer) => {
                    state.counters.released += 1;
                    if timer.traced() {
                        debug!("{}: released timer {}", self.label, id);
                    }
                    timer.frozen.then_some((timer.uid, timer.pid))
                }
                None => {
                    state.counters.errors += 1;
                    debug!("{}: release on unknown timer {}", self.label, id);
                    return false;
                }
            }
        };
        if let Some((uid, pid)) = unfreeze {
            self.unfreeze(uid, pid);
        }
        true
    }

    fn unfreeze(&self, uid: uid_t, pid: pid_t) {
        if !self
            .process
            .apply_process_profile(uid, pid, ProcessProfile::Unfrozen)
        {
            warn!("{}: failed to unfreeze pid {}", self.label, pid);
        }
    }

    fn dump(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let c = state.counters;
        vec![
            format!("service {}", self.label),
            format!(
                "  started:{} canceled:{} accepted:{} discarded:{} expired:{} extended:{} released:{} errors:{}",
                c.started,
                c.canceled,
                c.accepted,
                c.discarded,
                c.expired,
                c.extended,
                c.released,
                c.errors
            ),
            format!(
                "  running:{} expired:{} pending-release:{}",
                state.running.len(),
                state.expired.len(),
                state.pending_release.len()
            ),
            format!(
                "  ticker ready:{} registered:{} max:{} drained:{}",
                self.ticker.is_ready(),
                self.ticker.running_count(),
                self.ticker.max_running_count(),
                self.ticker.drained_count()
            ),
        ]
    }
}

impl Expiry for ServiceInner {
    /// Ticker-only entry point. Runs the timer's transition under the
    /// service lock, then performs freeze and notification with no lock
    /// held; a refused notification discards the timer through the public
    /// path to avoid accumulating expiries nobody will claim.
    fn expire(&self, timer_id: TimerId) {
        let now = now_ns();
        let wake = {
            let mut state = self.state.lock().unwrap();
            let Some(mut timer) = state.running.remove(&timer_id) else {
                debug!("{}: expire for unknown timer {}", self.label, timer_id);
                return;
            };
            let cpu_delay_ns = if timer.may_extend() {
                self.process
                    .read_schedule_stats(timer.pid)
                    .map(|s| s.cpu_delay_ns)
            } else {
                None
            };
            match timer.on_expire(cpu_delay_ns) {
                ExpireOutcome::Rearm { extended } => {
                    if extended {
                        state.counters.extended += 1;
                    }
                    if timer.traced() {
                        debug!(
                            "{}: timer {} re-armed, extended={}",
                            self.label, timer_id, extended
                        );
                    }
                    self.ticker
                        .insert(timer.scheduled_ns, timer_id, self.weak_self.clone());
                    state.running.insert(timer_id, timer);
                    Wake::Rearmed
                }
                ExpireOutcome::Expire { freeze } => {
                    state.counters.expired += 1;
                    let pid = timer.pid;
                    let uid = timer.uid;
                    let elapsed_ns = now - timer.started_ns;
                    if timer.traced() {
                        debug!(
                            "{}: timer {} expired after {}ns",
                            self.label, timer_id, elapsed_ns
                        );
                    }
                    state.expired.insert(timer_id, timer);
                    Wake::Expired {
                        pid,
                        uid,
                        elapsed_ns,
                        freeze,
                    }
                }
            }
        };

        let Wake::Expired {
            pid,
            uid,
            elapsed_ns,
            freeze,
        } = wake
        else {
            return;
        };

        if freeze && self.process.process_exists(pid) {
            if self
                .process
                .apply_process_profile(uid, pid, ProcessProfile::Frozen)
            {
                // Fresh lookup: the timer may have been claimed while the
                // freezer call ran.
                let mut state = self.state.lock().unwrap();
                if let Some(timer) = state.expired.get_mut(&timer_id) {
                    timer.frozen = true;
                }
            } else {
                warn!("{}: failed to freeze pid {}", self.label, pid);
            }
        }

        if !(self.notifier)(timer_id, pid, uid, elapsed_ns) {
            info!(
                "{}: no listener for timer {}, discarding",
                self.label, timer_id
            );
            self.discard(timer_id);
        }
    }
}
