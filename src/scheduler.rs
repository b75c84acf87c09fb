// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # One-Shot Job Scheduler
//!
//! Keeps at most one armed timer per message id. Arming a key that is
//! already armed aborts the previous timer (last writer wins); every arming
//! fires its job at most once. Each armed job is its own tokio task sleeping
//! until the deadline.

use crate::errors::DeliveryError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};
use tokio::{task::JoinHandle, time::Instant};
use tracing::debug;

/// Longest wait an armed timer sleeps, roughly thirty years.
pub const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Work run when an armed timer fires.
#[async_trait]
pub trait ScheduledJob: Send + Sync + 'static {
    async fn run(self: Arc<Self>, message_id: String);
}

/// When an armed job fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Fires on the next scheduler tick
    Now,
    /// Fires once the duration has elapsed
    After(Duration),
    /// Fires at a wall-clock time; a past time fires right away
    At(DateTime<Utc>),
}

impl Schedule {
    /// Fires after `seconds`, or right away when zero.
    pub fn after_secs(seconds: u64) -> Schedule {
        if seconds == 0 {
            Schedule::Now
        } else {
            Schedule::After(Duration::from_secs(seconds))
        }
    }

    /// Instant the job fires at. Waits beyond [`FAR_FUTURE`] are clamped to
    /// it, so no delay can overflow the clock.
    fn deadline(&self) -> Instant {
        let now = Instant::now();
        let wait = match self {
            Schedule::Now => Duration::ZERO,
            Schedule::After(delay) => *delay,
            Schedule::At(at) => (*at - Utc::now()).to_std().unwrap_or_default(),
        };

        now.checked_add(wait.min(FAR_FUTURE))
            .unwrap_or_else(|| now + FAR_FUTURE)
    }
}

/// Parses at-style expressions: `now`, `now + N seconds|minutes|hours` or an
/// RFC 3339 timestamp.
impl FromStr for Schedule {
    type Err = DeliveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let expr = s.trim();
        let invalid = || DeliveryError::Validation(format!("unrecognized schedule `{expr}`"));

        if expr.eq_ignore_ascii_case("now") {
            return Ok(Schedule::Now);
        }

        if let Some(rest) = expr.strip_prefix("now") {
            let rest = rest.trim_start().strip_prefix('+').ok_or_else(invalid)?;
            let mut parts = rest.split_whitespace();
            let amount: u64 = parts
                .next()
                .and_then(|n| n.parse().ok())
                .ok_or_else(invalid)?;
            let unit = match parts.next() {
                Some("second" | "seconds") => 1,
                Some("minute" | "minutes") => 60,
                Some("hour" | "hours") => 3600,
                _ => return Err(invalid()),
            };
            if parts.next().is_some() {
                return Err(invalid());
            }

            let seconds = amount.checked_mul(unit).ok_or_else(invalid)?;
            return Ok(Schedule::after_secs(seconds));
        }

        DateTime::parse_from_rfc3339(expr)
            .map(|at| Schedule::At(at.with_timezone(&Utc)))
            .map_err(|_| invalid())
    }
}

struct Armed {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    armed: Mutex<HashMap<String, Armed>>,
    generation: AtomicU64,
}

impl Inner {
    fn armed(&self) -> MutexGuard<'_, HashMap<String, Armed>> {
        self.armed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// In-process one-shot scheduler keyed by message id.
#[derive(Clone, Default)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        Scheduler::default()
    }

    /// Arms `job` for `message_id`, replacing any pending arming of that id.
    pub fn arm(&self, message_id: &str, schedule: Schedule, job: Arc<dyn ScheduledJob>) {
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let deadline = schedule.deadline();
        let inner = self.inner.clone();
        let id = message_id.to_owned();

        let mut armed = self.inner.armed();
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;

            {
                let mut armed = inner.armed();
                match armed.get(&id) {
                    Some(current) if current.generation == generation => {
                        armed.remove(&id);
                    }
                    _ => return,
                }
            }

            debug!(message_id = id, "scheduled job fired");
            job.run(id).await;
        });

        if let Some(previous) = armed.insert(message_id.to_owned(), Armed { generation, handle }) {
            debug!(message_id, "replacing armed job");
            previous.handle.abort();
        }
    }

    /// Disarms `message_id`; returns whether a pending arming existed.
    pub fn cancel(&self, message_id: &str) -> bool {
        match self.inner.armed().remove(message_id) {
            Some(previous) => {
                previous.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self, message_id: &str) -> bool {
        self.inner.armed().contains_key(message_id)
    }

    /// Number of armed, not yet fired, jobs.
    pub fn pending(&self) -> usize {
        self.inner.armed().len()
    }

    /// Aborts every pending job.
    pub fn shutdown(&self) {
        let drained: Vec<_> = self.inner.armed().drain().collect();
        debug!(count = drained.len(), "scheduler shutting down");

        for (_, armed) in drained {
            armed.handle.abort();
        }
    }
}
