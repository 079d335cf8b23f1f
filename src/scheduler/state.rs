//! Run state: queues, in-flight set, per-item states and the completion latch
//!
//! Everything here is synchronous and only touched with the scheduler lock
//! held. Each run has a generation number; callbacks from attempts that
//! belong to an older generation are ignored.

use std::collections::{HashMap, HashSet, VecDeque};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::events::{PipelineEvent, RunSummary};
use crate::item::{RetryRecord, UploadState};
use crate::transport::TransferOutcome;

/// An item taken off a queue and reserved as in flight
#[derive(Debug)]
pub struct Dispatch {
    pub record: RetryRecord,
    /// Taken from the retry queue; start after the retry delay
    pub delayed: bool,
    pub generation: u64,
    pub cancel: CancellationToken,
}

pub struct RunState {
    max_concurrency: usize,
    primary: VecDeque<RetryRecord>,
    retry: VecDeque<RetryRecord>,
    in_flight: HashMap<String, Option<JoinHandle<()>>>,
    states: HashMap<String, UploadState>,
    exporting: HashSet<String>,
    /// Highest fraction published per item
    reported: HashMap<String, f64>,
    summary: RunSummary,
    completion_fired: bool,
    cancelled: bool,
    generation: u64,
    cancel: CancellationToken,
}

impl RunState {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            primary: VecDeque::new(),
            retry: VecDeque::new(),
            in_flight: HashMap::new(),
            states: HashMap::new(),
            exporting: HashSet::new(),
            reported: HashMap::new(),
            summary: RunSummary::default(),
            completion_fired: false,
            cancelled: false,
            generation: 0,
            cancel: CancellationToken::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn is_current(&self, generation: u64) -> bool {
        generation == self.generation && !self.cancelled
    }

    /// Append to the primary queue; false when the run was cancelled
    pub fn push(&mut self, record: RetryRecord) -> bool {
        if self.cancelled {
            return false;
        }

        let key = record.item.key().to_string();
        if !self.in_flight.contains_key(&key) {
            self.states.insert(key.clone(), UploadState::Queued);
            self.reported.remove(&key);
        }
        if self.completion_fired {
            debug!("{} enqueued after this run already completed", key);
        }
        self.primary.push_back(record);
        true
    }

    /// Take the next item to start, if a concurrency slot is free
    ///
    /// The primary queue is preferred. Items whose key is already in flight
    /// are dropped with a warning.
    pub fn next_dispatch(&mut self) -> Option<Dispatch> {
        loop {
            if self.cancelled || self.in_flight.len() >= self.max_concurrency {
                return None;
            }

            let (record, delayed) = if let Some(record) = self.primary.pop_front() {
                (record, false)
            } else if let Some(record) = self.retry.pop_front() {
                (record, true)
            } else {
                return None;
            };

            let key = record.item.key().to_string();
            if self.in_flight.contains_key(&key) {
                warn!("{} is already uploading, dropping duplicate", key);
                continue;
            }

            self.in_flight.insert(key, None);
            return Some(Dispatch {
                record,
                delayed,
                generation: self.generation,
                cancel: self.cancel.clone(),
            });
        }
    }

    pub fn attach_handle(&mut self, key: &str, generation: u64, handle: JoinHandle<()>) {
        if generation != self.generation {
            return;
        }
        if let Some(slot) = self.in_flight.get_mut(key) {
            *slot = Some(handle);
        }
    }

    /// Record progress; returns the fraction to publish, if it advanced
    pub fn progress(
        &mut self,
        generation: u64,
        key: &str,
        bytes_sent: u64,
        total_bytes: u64,
    ) -> Option<f64> {
        if !self.is_current(generation) || !self.in_flight.contains_key(key) {
            return None;
        }

        let bytes_sent = bytes_sent.min(total_bytes);
        if let Some(UploadState::InFlight {
            bytes_sent: previous,
            total_bytes: previous_total,
        }) = self.states.get(key)
        {
            if *previous_total == total_bytes && bytes_sent < *previous {
                return None;
            }
        }
        self.states.insert(
            key.to_string(),
            UploadState::InFlight {
                bytes_sent,
                total_bytes,
            },
        );

        let fraction = if total_bytes == 0 {
            0.0
        } else {
            bytes_sent as f64 / total_bytes as f64
        };
        self.publishable(key, fraction)
    }

    /// Keep published fractions non-decreasing across attempts
    fn publishable(&mut self, key: &str, fraction: f64) -> Option<f64> {
        if matches!(self.reported.get(key), Some(last) if fraction <= *last) {
            return None;
        }
        self.reported.insert(key.to_string(), fraction);
        Some(fraction)
    }

    pub fn export_started(&mut self, generation: u64, key: &str) {
        if !self.is_current(generation) || !self.in_flight.contains_key(key) {
            return;
        }
        self.exporting.insert(key.to_string());
        self.states.insert(key.to_string(), UploadState::Exporting);
    }

    pub fn export_finished(&mut self, generation: u64, key: &str) {
        if generation != self.generation {
            return;
        }
        self.exporting.remove(key);
    }

    /// Apply an attempt's outcome
    ///
    /// `external_exports` is the number of exports the transports still
    /// report as running; completion waits for it to reach zero.
    pub fn finish(
        &mut self,
        mut record: RetryRecord,
        generation: u64,
        outcome: TransferOutcome,
        max_attempts: u32,
        external_exports: usize,
    ) -> Vec<PipelineEvent> {
        let mut events = Vec::new();
        let key = record.item.key().to_string();

        if !self.is_current(generation) {
            debug!("Ignoring outcome for {} from a cancelled run", key);
            return events;
        }
        self.in_flight.remove(&key);
        self.exporting.remove(&key);

        match outcome {
            TransferOutcome::Success => {
                if let Some(fraction) = self.publishable(&key, 1.0) {
                    events.push(PipelineEvent::Progress {
                        filename: key.clone(),
                        fraction,
                    });
                }
                self.states.insert(key.clone(), UploadState::Succeeded);
                self.summary.succeeded += 1;
                events.push(PipelineEvent::ItemComplete {
                    filename: key,
                    success: true,
                    error: None,
                });
            }
            TransferOutcome::Retryable(err) => {
                if record.register_failure(max_attempts) {
                    warn!(
                        "{} failed (attempt {}/{}), queued for retry: {}",
                        key, record.attempts, max_attempts, err
                    );
                    self.states.insert(key, UploadState::Queued);
                    self.retry.push_back(record);
                } else {
                    self.fail(&mut events, key, err.to_string());
                }
            }
            TransferOutcome::Terminal(err) => {
                self.fail(&mut events, key, err.to_string());
            }
            TransferOutcome::Cancelled => {
                self.states.insert(key, UploadState::Cancelled);
            }
        }

        if let Some(event) = self.check_completion(external_exports) {
            events.push(event);
        }
        events
    }

    fn fail(&mut self, events: &mut Vec<PipelineEvent>, key: String, reason: String) {
        warn!("{} failed: {}", key, reason);
        self.states
            .insert(key.clone(), UploadState::Failed(reason.clone()));
        self.summary.failed += 1;
        events.push(PipelineEvent::ItemComplete {
            filename: key,
            success: false,
            error: Some(reason),
        });
    }

    /// Close the latch the first time the run is fully drained
    fn check_completion(&mut self, external_exports: usize) -> Option<PipelineEvent> {
        if self.completion_fired
            || self.cancelled
            || self.summary.total() == 0
            || !self.primary.is_empty()
            || !self.retry.is_empty()
            || !self.in_flight.is_empty()
            || !self.exporting.is_empty()
            || external_exports > 0
        {
            return None;
        }

        self.completion_fired = true;
        Some(PipelineEvent::AllComplete(self.summary))
    }

    /// Re-check completion outside an attempt outcome, e.g. after an export ended
    pub fn poll_completion(&mut self, external_exports: usize) -> Option<PipelineEvent> {
        self.check_completion(external_exports)
    }

    /// Abandon the run: drain queues, cancel attempts, hand back their tasks
    pub fn cancel(&mut self) -> Vec<JoinHandle<()>> {
        self.cancelled = true;
        self.cancel.cancel();

        let queued: Vec<String> = self
            .primary
            .drain(..)
            .chain(self.retry.drain(..))
            .map(|r| r.item.key().to_string())
            .collect();
        for key in queued {
            if !self.in_flight.contains_key(&key) {
                self.states.insert(key, UploadState::Cancelled);
            }
        }

        let mut handles = Vec::new();
        for (key, handle) in self.in_flight.drain() {
            self.states.insert(key, UploadState::Cancelled);
            handles.extend(handle);
        }
        self.exporting.clear();
        handles
    }

    /// Start a fresh run; attempts still running from the old one are cancelled
    pub fn reset(&mut self) {
        self.cancel.cancel();
        *self = Self {
            generation: self.generation + 1,
            ..Self::new(self.max_concurrency)
        };
    }

    pub fn active_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn queued_count(&self) -> usize {
        self.primary.len() + self.retry.len()
    }

    pub fn exports_in_progress(&self) -> usize {
        self.exporting.len()
    }

    pub fn state(&self, key: &str) -> Option<UploadState> {
        self.states.get(key).cloned()
    }

    pub fn states(&self) -> Vec<(String, UploadState)> {
        let mut states: Vec<_> = self
            .states
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    pub fn summary(&self) -> RunSummary {
        self.summary
    }

    pub fn completion_fired(&self) -> bool {
        self.completion_fired
    }
}
