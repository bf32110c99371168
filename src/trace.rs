// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use crate::process::ProcessOps;
use crate::timer::EarlyAction;
use libc::pid_t;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

const HELP_TEXT: &str = "\
trace configuration: <target> [expire=<percent>] | show | off | help
  target: pid=<n>[,<n>...] | pid=all | name=<regex>
  expire=<percent>: expire matched timers at that fraction of the
  timeout (0..100); without it matched timers are traced only";

/// Which timers the current configuration selects.
enum TraceTarget {
    Disabled,
    Pids(Vec<pid_t>),
    AllPids,
    Name(Regex),
}

/// Split/early-action policy a matched timer picks up at start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TracePolicy {
    pub split_percent: u32,
    pub action: EarlyAction,
}

struct TraceState {
    target: TraceTarget,
    policy: TracePolicy,
    /// Regex match result per pid. Cleared wholesale on reconfiguration;
    /// process names are stable for the lifetime of a pid.
    memo: HashMap<pid_t, bool>,
}

/// Decides which timers get a split checkpoint and what happens there.
/// Configured with a space-separated token language, see [`HELP_TEXT`].
pub struct TraceFilter {
    state: Mutex<TraceState>,
}

impl TraceFilter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TraceState {
                target: TraceTarget::Disabled,
                policy: TracePolicy {
                    split_percent: 0,
                    action: EarlyAction::None,
                },
                memo: HashMap::new(),
            }),
        }
    }

    /// Apply a configuration. Returns the normalized configuration, the
    /// help text, or an error string; any error resets the configuration
    /// to disabled.
    pub fn configure(&self, tokens: &[String]) -> String {
        if tokens.len() == 1 {
            match tokens[0].as_str() {
                "show" => return self.render(),
                "help" => return HELP_TEXT.to_string(),
                "off" => {
                    self.reset();
                    return "off".to_string();
                }
                _ => {}
            }
        }
        match parse_spec(tokens) {
            Ok((target, policy)) => {
                let mut state = self.state.lock().unwrap();
                state.target = target;
                state.policy = policy;
                state.memo.clear();
                drop(state);
                self.render()
            }
            Err(msg) => {
                self.reset();
                msg
            }
        }
    }

    fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.target = TraceTarget::Disabled;
        state.policy = TracePolicy {
            split_percent: 0,
            action: EarlyAction::None,
        };
        state.memo.clear();
    }

    fn render(&self) -> String {
        let state = self.state.lock().unwrap();
        let target = match &state.target {
            TraceTarget::Disabled => return "off".to_string(),
            TraceTarget::Pids(pids) => format!(
                "pid={}",
                pids.iter()
                    .map(|p| p.to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            ),
            TraceTarget::AllPids => "pid=all".to_string(),
            TraceTarget::Name(re) => format!("name={}", re.as_str()),
        };
        match state.policy.action {
            EarlyAction::Expire => format!("{} expire={}", target, state.policy.split_percent),
            _ => target,
        }
    }

    /// Policy for a new timer, None when the pid is not selected.
    pub fn policy_for(&self, pid: pid_t, ops: &dyn ProcessOps) -> Option<TracePolicy> {
        let mut state = self.state.lock().unwrap();
        let TraceState {
            target,
            policy,
            memo,
        } = &mut *state;
        let matched = match target {
            TraceTarget::Disabled => false,
            TraceTarget::Pids(pids) => pids.contains(&pid),
            TraceTarget::AllPids => true,
            TraceTarget::Name(re) => *memo.entry(pid).or_insert_with(|| {
                ops.process_name(pid)
                    .map(|name| re.is_match(&name))
                    .unwrap_or(false)
            }),
        };
        matched.then_some(*policy)
    }
}

impl Default for TraceFilter {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_spec(tokens: &[String]) -> Result<(TraceTarget, TracePolicy), String> {
    if tokens.is_empty() {
        return Err("error: empty trace specification".to_string());
    }
    if tokens.len() > 2 {
        return Err(format!(
            "error: too many tokens in '{}'",
            tokens.join(" ")
        ));
    }
    let target = parse_target(&tokens[0])?;
    let policy = match tokens.get(1) {
        Some(token) => parse_action(token)?,
        None => TracePolicy {
            split_percent: 0,
            action: EarlyAction::Trace,
        },
    };
    Ok((target, policy))
}

fn parse_target(token: &str) -> Result<TraceTarget, String> {
    if let Some(spec) = token.strip_prefix("pid=") {
        if spec == "all" {
            return Ok(TraceTarget::AllPids);
        }
        let mut pids = Vec::new();
        for part in spec.split(',') {
            match part.parse::<pid_t>() {
                Ok(pid) if pid > 0 => pids.push(pid),
                _ => return Err(format!("error: bad pid '{}'", part)),
            }
        }
        Ok(TraceTarget::Pids(pids))
    } else if let Some(expr) = token.strip_prefix("name=") {
        match Regex::new(expr) {
            Ok(re) => Ok(TraceTarget::Name(re)),
            Err(_) => Err(format!("error: bad name pattern '{}'", expr)),
        }
    } else {
        Err(format!("error: unrecognized trace target '{}'", token))
    }
}

fn parse_action(token: &str) -> Result<TracePolicy, String> {
    let Some(spec) = token.strip_prefix("expire=") else {
        return Err(format!("error: unrecognized trace action '{}'", token));
    };
    match spec.parse::<u32>() {
        Ok(percent) if percent <= 100 => Ok(TracePolicy {
            split_percent: percent,
            action: EarlyAction::Expire,
        }),
        _ => Err(format!("error: bad expire percent '{}'", spec)),
    }
}

lazy_static::lazy_static! {
    static ref SYSTEM_TRACE_FILTER: Arc<TraceFilter> = Arc::new(TraceFilter::new());
}

/// The process-wide trace filter, shared by services built without an
/// explicit one.
pub fn system_trace_filter() -> Arc<TraceFilter> {
    SYSTEM_TRACE_FILTER.clone()
}

/// Configure the process-wide trace filter.
pub fn configure_trace(tokens: &[String]) -> String {
    SYSTEM_TRACE_FILTER.configure(tokens)
}
