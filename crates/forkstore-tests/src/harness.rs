//! Test Harness - mock billing collector and daemon environment setup

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use forkstore_mgmt::billing::ReceivedEvents;
use forkstore_mgmt::{BillingEvent, ReporterConfig, ServerConfig};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Path the mock collector accepts events on.
pub const USAGE_EVENTS_PATH: &str = "/billing/api/v1/usage_events";

/// How the mock collector answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockBehavior {
    /// 200 for everything.
    Accept,
    /// The same status for every request.
    Status(u16),
    /// `status` for the first `count` requests, 200 afterwards.
    FailFirst { count: usize, status: u16 },
    /// 200 for the first `count` requests, `status` afterwards.
    FailAfter { count: usize, status: u16 },
    /// Sleeps before answering 200 for the first `count` requests.
    DelayFirst { count: usize, delay: Duration },
}

#[derive(Debug)]
struct MockState {
    behavior: MockBehavior,
    requests: AtomicUsize,
    accepted: Mutex<Vec<Vec<BillingEvent>>>,
}

/// An HTTP billing collector on an ephemeral loopback port.
pub struct MockBillingServer {
    addr: SocketAddr,
    state: Arc<MockState>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

async fn usage_events_handler(
    State(state): State<Arc<MockState>>,
    Json(body): Json<ReceivedEvents>,
) -> StatusCode {
    let n = state.requests.fetch_add(1, Ordering::SeqCst) + 1;
    let status = match state.behavior {
        MockBehavior::Accept => StatusCode::OK,
        MockBehavior::Status(code) => StatusCode::from_u16(code).unwrap_or(StatusCode::OK),
        MockBehavior::FailFirst { count, status } if n <= count => {
            StatusCode::from_u16(status).unwrap_or(StatusCode::OK)
        }
        MockBehavior::FailFirst { .. } => StatusCode::OK,
        MockBehavior::FailAfter { count, .. } if n <= count => StatusCode::OK,
        MockBehavior::FailAfter { status, .. } => {
            StatusCode::from_u16(status).unwrap_or(StatusCode::OK)
        }
        MockBehavior::DelayFirst { count, delay } => {
            if n <= count {
                tokio::time::sleep(delay).await;
            }
            StatusCode::OK
        }
    };
    if status.is_success() {
        if let Ok(mut accepted) = state.accepted.lock() {
            accepted.push(body.events);
        }
    }
    status
}

impl MockBillingServer {
    pub async fn start(behavior: MockBehavior) -> Self {
        let state = Arc::new(MockState {
            behavior,
            requests: AtomicUsize::new(0),
            accepted: Mutex::new(Vec::new()),
        });
        let router = Router::new()
            .route(USAGE_EVENTS_PATH, post(usage_events_handler))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind mock collector");
        let addr = listener.local_addr().expect("mock collector has no address");
        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
        });

        Self {
            addr,
            state,
            cancel,
            task,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}{}", self.addr, USAGE_EVENTS_PATH)
    }

    /// Requests received, whatever the answer.
    pub fn requests(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }

    /// Event lists of the requests answered with 2xx.
    pub fn accepted(&self) -> Vec<Vec<BillingEvent>> {
        self.state
            .accepted
            .lock()
            .map(|accepted| accepted.clone())
            .unwrap_or_default()
    }

    /// Waits until at least `n` requests were answered with 2xx.
    pub async fn wait_for_accepted(&self, n: usize, timeout: Duration) -> bool {
        wait_until(timeout, || self.accepted().len() >= n).await
    }

    pub async fn wait_for_requests(&self, n: usize, timeout: Duration) -> bool {
        wait_until(timeout, || self.requests() >= n).await
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Polls `condition` every 20ms until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

/// Reporter settings with millisecond backoff so retry tests stay fast.
pub fn fast_reporter_config(max_retries: u32) -> ReporterConfig {
    ReporterConfig {
        request_timeout: Duration::from_secs(2),
        max_retries,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
        backoff_multiplier: 2.0,
        jitter: false,
        max_events_per_request: 1000,
    }
}

/// A scratch directory holding the daemon's config file.
#[derive(Debug)]
pub struct TestEnv {
    temp_dir: TempDir,
    test_name: String,
}

impl TestEnv {
    pub fn new(test_name: &str) -> Self {
        let temp_dir = tempfile::tempdir().expect("failed to create temp dir");
        Self {
            temp_dir,
            test_name: test_name.to_string(),
        }
    }

    pub fn tempdir(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn test_name(&self) -> &str {
        &self.test_name
    }

    /// Writes `contents` as `<test_name>.toml` and loads it back.
    pub fn load_config(&self, contents: &str) -> anyhow::Result<ServerConfig> {
        let path: PathBuf = self.tempdir().join(format!("{}.toml", self.test_name));
        std::fs::write(&path, contents)?;
        ServerConfig::from_file(&path)
    }
}

/// Installs a test subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
