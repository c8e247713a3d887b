//! Delivery of usage batches to the billing collector.
//!
//! Delivery is at-least-once. A timeout, connection failure or 5xx is retried
//! with bounded backoff; a 4xx drops the batch immediately. Nothing here
//! deduplicates, collectors use the events' idempotency keys for that.
//!
//! A batch larger than `max_events_per_request` goes out as several requests.
//! Requests are not atomic as a group: when a later chunk fails, the chunks
//! before it have already been accepted. Such batches are counted in
//! `partial_batches` in addition to `rejected` or `dropped`.

use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::billing::UsageBatch;
use crate::config::ReporterConfig;
use crate::metrics::DeliveryStats;
use crate::retry::{RetryExecutor, RetryOutcome, Retryable};

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("request timed out")]
    Timeout,
    #[error("collector rejected batch with status {status}")]
    Rejected { status: u16 },
    #[error("collector failed with status {status}")]
    ServerError { status: u16 },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("failed to encode batch: {0}")]
    Serialization(String),
    #[error("gave up after {attempts} attempt(s): {last}")]
    Exhausted {
        attempts: u32,
        last: Box<DeliveryError>,
    },
}

impl Retryable for DeliveryError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeliveryError::Timeout | DeliveryError::ServerError { .. } | DeliveryError::Transport(_)
        )
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            DeliveryError::Timeout
        } else {
            DeliveryError::Transport(e.to_string())
        }
    }
}

/// Acknowledgement of a fully delivered batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub tick: u64,
    pub requests: usize,
    pub events: usize,
    /// Attempts across all requests of the batch.
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy)]
struct ChunkProgress {
    delivered: usize,
    total: usize,
}

pub struct Reporter {
    client: Client,
    endpoint: String,
    retry: RetryExecutor,
    max_events_per_request: usize,
    stats: DeliveryStats,
}

impl Reporter {
    pub fn new(endpoint: impl Into<String>, config: &ReporterConfig) -> Result<Self, DeliveryError> {
        Self::with_stats(endpoint, config, DeliveryStats::new())
    }

    pub fn with_stats(
        endpoint: impl Into<String>,
        config: &ReporterConfig,
        stats: DeliveryStats,
    ) -> Result<Self, DeliveryError> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            retry: RetryExecutor::new(config.retry_config()),
            max_events_per_request: config.max_events_per_request,
            stats,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn stats(&self) -> &DeliveryStats {
        &self.stats
    }

    /// Posts every chunk of `batch`; the batch is acknowledged only when all
    /// chunks are.
    ///
    /// A failed batch increments exactly one of `rejected` or `dropped`. If
    /// earlier chunks of it were accepted, the collector keeps them and
    /// `partial_batches` is incremented too.
    pub async fn deliver(&self, batch: &UsageBatch) -> Result<Ack, DeliveryError> {
        self.stats.batches_sent.inc();
        let mut ack = Ack {
            tick: batch.tick,
            requests: 0,
            events: batch.events.len(),
            attempts: 0,
        };

        for chunk in batch.chunks(self.max_events_per_request) {
            let body = match serde_json::to_vec(&chunk) {
                Ok(body) => body,
                Err(e) => {
                    self.stats.dropped.inc();
                    error!("dropping usage batch {}: {}", batch.tick, e);
                    return Err(DeliveryError::Serialization(e.to_string()));
                }
            };
            let body = &body;

            let outcome = self
                .retry
                .execute(move |attempt| {
                    self.stats.attempts.inc();
                    if attempt > 1 {
                        self.stats.retries.inc();
                    }
                    self.post(body.clone())
                })
                .await;

            match outcome {
                RetryOutcome::Success { attempts, .. } => {
                    ack.requests += 1;
                    ack.attempts += attempts;
                }
                RetryOutcome::Exhausted {
                    last_error,
                    attempts,
                } => {
                    let progress = ChunkProgress {
                        delivered: ack.requests,
                        total: batch.events.len().div_ceil(self.max_events_per_request.max(1)),
                    };
                    return Err(self.settle_failure(batch.tick, progress, last_error, attempts));
                }
            }
        }

        self.stats.batches_delivered.inc();
        info!(
            "delivered usage batch {} ({} events, {} request(s), {} attempt(s))",
            ack.tick, ack.events, ack.requests, ack.attempts
        );
        Ok(ack)
    }

    fn settle_failure(
        &self,
        tick: u64,
        progress: ChunkProgress,
        last_error: DeliveryError,
        attempts: u32,
    ) -> DeliveryError {
        if progress.delivered > 0 {
            self.stats.partial_batches.inc();
            warn!(
                "usage batch {} partially delivered: {} of {} request(s) accepted before failure",
                tick, progress.delivered, progress.total
            );
        }
        match last_error {
            DeliveryError::Rejected { status } => {
                self.stats.rejected.inc();
                error!(
                    "usage batch {} rejected by {} with status {}, not retrying",
                    tick, self.endpoint, status
                );
                DeliveryError::Rejected { status }
            }
            other => {
                self.stats.dropped.inc();
                error!(
                    "dropping usage batch {} after {} attempt(s): {}",
                    tick, attempts, other
                );
                DeliveryError::Exhausted {
                    attempts,
                    last: Box::new(other),
                }
            }
        }
    }

    async fn post(&self, body: Vec<u8>) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        debug!("billing endpoint answered {}", status);
        if status.is_success() {
            Ok(())
        } else if status.is_client_error() {
            Err(DeliveryError::Rejected {
                status: status.as_u16(),
            })
        } else {
            Err(DeliveryError::ServerError {
                status: status.as_u16(),
            })
        }
    }
}
