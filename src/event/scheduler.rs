//! Dispatch scheduler: per-identity serialization and event coalescing
//!
//! Guarantees consumed by the dispatcher:
//! - at most one dispatch per [`ResourceId`] runs at any instant
//! - events arriving while a dispatch is in flight collapse into a single
//!   follow-up run once it finishes
//! - an in-flight dispatch is never cancelled
//! - at most one delayed follow-up (reschedule or backoff retry) is pending
//!   per identity; a dispatch that starts for any reason absorbs it
//!
//! Dispatches for distinct identities run in parallel, bounded by the worker
//! count. Failed dispatches are retried with exponential backoff.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::context::RetryInfo;
use crate::event::EventSource;
use crate::resource::ResourceId;
use crate::retry::RetryConfig;
use crate::Error;

/// Default number of concurrent dispatches
pub const DEFAULT_WORKERS: usize = 16;

/// Scheduler tuning
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct SchedulerConfig {
    /// Maximum dispatches running at once across all identities
    pub workers: usize,
    /// Backoff and attempt limit for failed dispatches
    pub retry: RetryConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            retry: RetryConfig {
                max_attempts: 0,
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(300),
                backoff_multiplier: 2.0,
            },
        }
    }
}

/// Work executed for one identity; implemented by the controller
#[async_trait]
pub trait DispatchHandler: Send + Sync + 'static {
    /// Run one dispatch. `Ok(Some(delay))` asks to run again after `delay`.
    async fn dispatch(&self, id: &ResourceId, retry: RetryInfo)
        -> Result<Option<Duration>, Error>;
}

#[derive(Debug, Default)]
struct Slot {
    /// Another event arrived while a dispatch was running
    pending: bool,
    /// Consecutive failures so far
    failures: u32,
}

/// Delayed follow-up armed for one identity
struct Timer {
    token: u64,
    deadline: Instant,
    task: AbortHandle,
}

struct Inner<H> {
    handler: Arc<H>,
    config: SchedulerConfig,
    permits: Semaphore,
    /// One entry per identity with a dispatch in flight
    in_flight: DashMap<ResourceId, Slot>,
    /// Failure counts carried across runs until the next success
    failures: DashMap<ResourceId, u32>,
    /// At most one pending follow-up per identity
    timers: DashMap<ResourceId, Timer>,
    next_timer: AtomicU64,
}

/// In-process scheduler feeding a [`DispatchHandler`]
pub struct Scheduler<H> {
    inner: Arc<Inner<H>>,
}

impl<H> Clone for Scheduler<H> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<H: DispatchHandler> Scheduler<H> {
    /// Create a scheduler driving `handler`
    pub fn new(config: SchedulerConfig, handler: Arc<H>) -> Self {
        let workers = config.workers.max(1);
        Self {
            inner: Arc::new(Inner {
                handler,
                config,
                permits: Semaphore::new(workers),
                in_flight: DashMap::new(),
                failures: DashMap::new(),
                timers: DashMap::new(),
                next_timer: AtomicU64::new(0),
            }),
        }
    }

    /// Request a dispatch for `id`
    ///
    /// Starts one immediately if none is in flight for `id`; otherwise marks
    /// the identity so exactly one more dispatch runs after the current one.
    pub fn submit(&self, id: ResourceId) {
        let start = match self.inner.in_flight.entry(id.clone()) {
            Entry::Occupied(mut slot) => {
                slot.get_mut().pending = true;
                false
            }
            Entry::Vacant(slot) => {
                let failures = self.inner.failures.get(&id).map(|f| *f).unwrap_or(0);
                slot.insert(Slot {
                    pending: false,
                    failures,
                });
                true
            }
        };

        if start {
            let scheduler = self.clone();
            tokio::spawn(async move { scheduler.drive(id).await });
        } else {
            debug!(resource = %id, "dispatch in flight, coalescing event");
        }
    }

    /// Request a dispatch for `id` after `delay`
    ///
    /// An identity has at most one pending follow-up. If one is already due
    /// no later than `delay` from now, this request is absorbed into it;
    /// otherwise the earlier deadline replaces it.
    pub fn submit_after(&self, id: ResourceId, delay: Duration) {
        let deadline = Instant::now() + delay;
        match self.inner.timers.entry(id.clone()) {
            Entry::Occupied(timer) if timer.get().deadline <= deadline => {
                debug!(resource = %id, "follow-up already pending");
            }
            entry => {
                let timer = self.arm(id, deadline);
                match entry {
                    Entry::Occupied(mut slot) => slot.insert(timer).task.abort(),
                    Entry::Vacant(slot) => {
                        slot.insert(timer);
                    }
                }
            }
        }
    }

    /// Spawn the sleeper for a follow-up; it fires only while still current
    fn arm(&self, id: ResourceId, deadline: Instant) -> Timer {
        let token = self.inner.next_timer.fetch_add(1, Ordering::Relaxed);
        let scheduler = self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let current = scheduler
                .inner
                .timers
                .remove_if(&id, |_, timer| timer.token == token)
                .is_some();
            if current {
                scheduler.submit(id);
            }
        });
        Timer {
            token,
            deadline,
            task: task.abort_handle(),
        }
    }

    /// Drop the pending follow-up of `id`, if any
    fn disarm(&self, id: &ResourceId) {
        if let Some((_, timer)) = self.inner.timers.remove(id) {
            timer.task.abort();
        }
    }

    /// Number of identities with a pending follow-up
    pub fn pending_follow_ups(&self) -> usize {
        self.inner.timers.len()
    }

    /// Number of identities with a dispatch in flight
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.len()
    }

    /// Submit every identity produced by `sources` until all of them end
    pub async fn run(&self, sources: Vec<EventSource>) {
        let names: Vec<String> = sources.iter().map(|s| s.name().to_string()).collect();
        info!(sources = ?names, "scheduler started");

        let mut merged =
            futures::stream::select_all(sources.into_iter().map(EventSource::into_stream));
        while let Some(id) = merged.next().await {
            self.submit(id);
        }

        info!("all event sources ended, scheduler stopped accepting events");
    }

    async fn drive(self, id: ResourceId) {
        loop {
            // This run supersedes any delayed follow-up; it re-arms one
            // itself if it still needs it.
            self.disarm(&id);

            let failures = self
                .inner
                .in_flight
                .get(&id)
                .map(|slot| slot.failures)
                .unwrap_or(0);
            let retry = RetryInfo {
                attempt: failures,
                last_attempt: !self.inner.config.retry.allows_attempt_after(failures + 1),
            };

            let result = match self.inner.permits.acquire().await {
                Ok(_permit) => self.inner.handler.dispatch(&id, retry).await,
                Err(_) => Err(Error::internal_with_context("scheduler", "worker pool closed")),
            };

            let follow_up = self.settle(&id, failures, result);

            // Re-check under the entry lock: a submit racing with completion
            // must either see the slot and mark it pending, or find it gone
            // and start a fresh drive.
            let run_again = match self.inner.in_flight.entry(id.clone()) {
                Entry::Occupied(mut slot) if slot.get().pending => {
                    slot.get_mut().pending = false;
                    slot.get_mut().failures =
                        self.inner.failures.get(&id).map(|f| *f).unwrap_or(0);
                    true
                }
                Entry::Occupied(slot) => {
                    slot.remove();
                    false
                }
                Entry::Vacant(_) => false,
            };

            if run_again {
                continue;
            }
            if let Some(delay) = follow_up {
                self.submit_after(id.clone(), delay);
            }
            break;
        }
    }

    /// Record the result of one dispatch; returns a delay if it must run again
    fn settle(
        &self,
        id: &ResourceId,
        failures: u32,
        result: Result<Option<Duration>, Error>,
    ) -> Option<Duration> {
        match result {
            Ok(reschedule) => {
                self.inner.failures.remove(id);
                if let Some(delay) = reschedule {
                    debug!(
                        resource = %id,
                        delay_ms = delay.as_millis(),
                        "dispatch asked to be rescheduled"
                    );
                }
                reschedule
            }
            Err(e) => {
                let attempt = failures + 1;
                let retry = &self.inner.config.retry;
                if e.is_retryable() && retry.allows_attempt_after(attempt) {
                    self.inner.failures.insert(id.clone(), attempt);
                    let delay = retry.jittered_delay(attempt);
                    warn!(
                        resource = %id,
                        attempt = attempt,
                        error = %e,
                        delay_ms = delay.as_millis(),
                        "dispatch failed, retrying with backoff"
                    );
                    Some(delay)
                } else {
                    self.inner.failures.remove(id);
                    error!(
                        resource = %id,
                        attempt = attempt,
                        error = %e,
                        retryable = e.is_retryable(),
                        "dispatch failed, giving up until the next event"
                    );
                    None
                }
            }
        }
    }
}
