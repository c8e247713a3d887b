//! forkstore management subsystem: usage collection, billing delivery, GC scheduling, admin API

pub mod api;
pub mod billing;
pub mod cli;
pub mod collector;
pub mod config;
pub mod daemon;
pub mod metrics;
pub mod remote;
pub mod reporter;
pub mod retry;

pub use api::AdminApi;
pub use billing::{BatchCheck, BillingEvent, MetricKind, UsageBatch, ValueBounds};
pub use collector::{MetricsCollector, SyntheticSizeCache, TenantUsage};
pub use config::{ReporterConfig, ServerConfig, TenantConfig};
pub use daemon::{Daemon, DaemonHandle};
pub use metrics::{CollectorStats, DeliverySnapshot, DeliveryStats};
pub use reporter::{Ack, DeliveryError, Reporter};
pub use retry::{RetryConfig, RetryExecutor};
