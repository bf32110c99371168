// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # ANR timer service
//!
//! A deadline timer service for detecting processes that stop responding.
//! Callers start one timer per outstanding request; a timer that is not
//! canceled in time expires, optionally freezes the offending process via
//! the cgroup2 freezer, and reports through a notification callback. The
//! caller then accepts the expiry (keeping the process frozen until a later
//! release) or discards it.
//!
//! All [`TimerService`] instances in a process share one [`Ticker`], which
//! owns a single timerfd armed for the earliest deadline across every
//! service and delivers expiry callbacks from a dedicated wait thread.
//!
//! Two refinements keep slow-but-alive processes from being flagged:
//!
//! - an extendable timer gets a one-shot deadline extension matching the
//!   scheduling delay (per /proc/<pid>/schedstat) the process accumulated
//!   while the timer ran, and
//! - the trace filter ([`configure_trace`]) can give selected processes a
//!   split checkpoint partway through the timeout for early diagnostics or
//!   early expiry.

mod clock;
pub use clock::now_ns;
pub use clock::ClockSource;
pub use clock::MIN_ARM_DELAY_NS;

mod process;
pub use process::ProcessOps;
pub use process::ProcessProfile;
pub use process::ScheduleStats;
pub use process::SystemProcessOps;

mod timer;
pub use timer::EarlyAction;
pub use timer::TimerId;
pub use timer::NO_TIMER;

mod ticker;
pub use ticker::system_ticker;
pub use ticker::Ticker;

mod trace;
pub use trace::configure_trace;
pub use trace::system_trace_filter;
pub use trace::TraceFilter;
pub use trace::TracePolicy;

mod service;
pub use service::Counters;
pub use service::NotifyFn;
pub use service::TimerService;
pub use service::TimerServiceBuilder;
