//! Failure classification, backoff, rate limiting and durable checkpoints.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use rand::Rng;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore, SemaphorePermit};
use tracing::warn;
use uuid::Uuid;

use lbx_core::{NaturalKey, SyncCheckpoint};

pub const CRATE_NAME: &str = "lbx-storage";

/// Failure classes driving the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    RateLimited,
    Fatal,
}

/// Error surface shared by the source and target boundaries.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("status {status} from {endpoint}")]
    Status {
        status: u16,
        endpoint: String,
        retry_after: Option<u64>,
    },
    #[error("source read failed: {0}")]
    Source(String),
    #[error("configuration: {0}")]
    Config(String),
    #[error("checkpoint: {0}")]
    Checkpoint(String),
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::Transport(err) => classify_reqwest_error(err),
            StoreError::Status { status, .. } => classify_status_code(*status),
            StoreError::Source(_) => ErrorClass::Transient,
            StoreError::Config(_) | StoreError::Checkpoint(_) => ErrorClass::Fatal,
        }
    }

    /// Provider `Retry-After` hint, when one was surfaced.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            StoreError::Status {
                retry_after: Some(secs),
                ..
            } => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }
}

pub fn classify_status(status: StatusCode) -> ErrorClass {
    classify_status_code(status.as_u16())
}

/// 429 is its own class; 5xx retries; every other status aborts.
pub fn classify_status_code(status: u16) -> ErrorClass {
    if status == 429 {
        ErrorClass::RateLimited
    } else if (500..600).contains(&status) {
        ErrorClass::Transient
    } else {
        ErrorClass::Fatal
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> ErrorClass {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        ErrorClass::Transient
    } else {
        ErrorClass::Fatal
    }
}

/// Exponential backoff parameters, per failure class.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub rate_limit_delay: Duration,
    pub max_delay: Duration,
    /// Extra random fraction added to transient delays, 0.0 disables.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            rate_limit_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Deterministic delay before the retry following `attempt_index`
    /// failures, before jitter. Rate-limited failures start from the
    /// longer base; both curves cap at `max_delay`.
    pub fn delay_for_attempt(&self, class: ErrorClass, attempt_index: usize) -> Duration {
        let base = match class {
            ErrorClass::RateLimited => self.rate_limit_delay,
            _ => self.base_delay,
        };
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        base.saturating_mul(factor).min(self.max_delay)
    }

    /// Same, but honoring a provider `Retry-After` hint for rate limits.
    /// The hint is still capped so a hostile header cannot stall a run.
    pub fn delay_with_hint(
        &self,
        class: ErrorClass,
        attempt_index: usize,
        retry_after: Option<Duration>,
    ) -> Duration {
        match (class, retry_after) {
            (ErrorClass::RateLimited, Some(hint)) => hint.min(self.max_delay),
            _ => self.delay_for_attempt(class, attempt_index),
        }
    }
}

/// Shared retry gate. Owns the policy and performs the actual sleeps so
/// call sites never hand-roll delays.
#[derive(Debug, Clone)]
pub struct BackoffController {
    policy: BackoffPolicy,
}

impl BackoffController {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Whether another attempt is allowed after `attempt_index` failures.
    pub fn should_retry(&self, class: ErrorClass, attempt_index: usize) -> bool {
        class != ErrorClass::Fatal && attempt_index < self.policy.max_retries
    }

    pub async fn pause(
        &self,
        class: ErrorClass,
        attempt_index: usize,
        retry_after: Option<Duration>,
    ) {
        let mut delay = self.policy.delay_with_hint(class, attempt_index, retry_after);
        if class == ErrorClass::Transient && self.policy.jitter > 0.0 {
            let fraction = rand::thread_rng().gen_range(0.0..self.policy.jitter);
            delay = (delay + delay.mul_f64(fraction)).min(self.policy.max_delay);
        }
        tokio::time::sleep(delay).await;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
struct BucketState {
    tokens: u32,
    last_refill: Instant,
}

/// The single gate every outbound call passes through: a semaphore
/// bounding in-flight requests plus an optional token bucket spreading
/// them over time. The bucket's clock is serialized behind a mutex.
#[derive(Debug)]
pub struct RateGate {
    inflight: Semaphore,
    bucket: Option<Mutex<BucketState>>,
    config: Option<TokenBucketConfig>,
}

impl RateGate {
    pub fn new(max_inflight: usize, bucket: Option<TokenBucketConfig>) -> Self {
        Self {
            inflight: Semaphore::new(max_inflight.max(1)),
            bucket: bucket.map(|config| {
                Mutex::new(BucketState {
                    tokens: config.capacity,
                    last_refill: Instant::now(),
                })
            }),
            config: bucket,
        }
    }

    /// Waits for both an in-flight slot and a rate token. The returned
    /// permit releases the slot when dropped; tokens are not returned.
    pub async fn admit(&self) -> SemaphorePermit<'_> {
        let permit = self
            .inflight
            .acquire()
            .await
            .expect("rate gate semaphore not closed");

        if let (Some(bucket), Some(config)) = (&self.bucket, self.config) {
            loop {
                let mut state = bucket.lock().await;
                let elapsed = state.last_refill.elapsed();
                if elapsed >= config.refill_every && config.refill_every.as_millis() > 0 {
                    let refills = (elapsed.as_millis() / config.refill_every.as_millis()) as u32;
                    state.tokens = state.tokens.saturating_add(refills).min(config.capacity);
                    state.last_refill = Instant::now();
                }

                if state.tokens > 0 {
                    state.tokens -= 1;
                    break;
                }

                let sleep_for = config.refill_every;
                drop(state);
                tokio::time::sleep(sleep_for).await;
            }
        }

        permit
    }
}

/// Durable cursor storage. `save` is only ever called with a key from a
/// batch whose commit has been confirmed.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self) -> Result<SyncCheckpoint, StoreError>;
    async fn save(&self, key: &NaturalKey) -> Result<(), StoreError>;
}

/// JSON-file checkpoint written via a temp file and an atomic rename.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<SyncCheckpoint, StoreError> {
        match fs::read_to_string(&self.path).await {
            Ok(text) => serde_json::from_str(&text).map_err(|err| {
                StoreError::Checkpoint(format!("parsing {}: {err}", self.path.display()))
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(SyncCheckpoint::empty()),
            Err(err) => Err(StoreError::Checkpoint(format!(
                "reading {}: {err}",
                self.path.display()
            ))),
        }
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self) -> Result<SyncCheckpoint, StoreError> {
        self.read().await
    }

    async fn save(&self, key: &NaturalKey) -> Result<(), StoreError> {
        let current = self.read().await?;
        if let Some(existing) = &current.last_processed_key {
            if existing > key {
                warn!(%existing, %key, "refusing to move checkpoint backwards");
                return Ok(());
            }
        }

        let next = SyncCheckpoint::at(key.clone());
        let bytes = serde_json::to_vec_pretty(&next)
            .map_err(|err| StoreError::Checkpoint(format!("serializing checkpoint: {err}")))?;

        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&parent).await.map_err(|err| {
            StoreError::Checkpoint(format!("creating {}: {err}", parent.display()))
        })?;

        let temp_path = parent.join(format!(".{}.checkpoint.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|err| {
                StoreError::Checkpoint(format!("opening {}: {err}", temp_path.display()))
            })?;
        let write_result = async {
            file.write_all(&bytes).await?;
            file.flush().await
        }
        .await;
        drop(file);

        if let Err(err) = write_result {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::Checkpoint(format!(
                "writing {}: {err}",
                temp_path.display()
            )));
        }

        match fs::rename(&temp_path, &self.path).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(StoreError::Checkpoint(format!(
                    "renaming {} -> {}: {err}",
                    temp_path.display(),
                    self.path.display()
                )))
            }
        }
    }
}

/// Process-local checkpoint for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    state: Mutex<Option<SyncCheckpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self) -> Result<SyncCheckpoint, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .clone()
            .unwrap_or_else(SyncCheckpoint::empty))
    }

    async fn save(&self, key: &NaturalKey) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.as_ref().and_then(|c| c.last_processed_key.as_ref()) {
            if existing > key {
                return Ok(());
            }
        }
        *state = Some(SyncCheckpoint::at(key.clone()));
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_inflight: usize,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_inflight: 4,
            token_bucket: None,
        }
    }
}

/// Builds the shared reqwest client; the per-call timeout here is the
/// hard timeout every network call carries.
pub fn build_http_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);

    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }

    builder.build().context("building reqwest client")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn transient_backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            rate_limit_delay: Duration::from_secs(1),
            max_delay: Duration::from_millis(350),
            jitter: 0.0,
        };

        let delays: Vec<_> = (0..4)
            .map(|i| policy.delay_for_attempt(ErrorClass::Transient, i))
            .collect();
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        assert_eq!(delays[2], Duration::from_millis(350));
        assert_eq!(delays[3], Duration::from_millis(350));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn rate_limited_backoff_starts_longer_and_stays_non_decreasing() {
        let policy = BackoffPolicy {
            max_retries: 6,
            base_delay: Duration::from_millis(100),
            rate_limit_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
            jitter: 0.5,
        };

        let delays: Vec<_> = (0..6)
            .map(|i| policy.delay_for_attempt(ErrorClass::RateLimited, i))
            .collect();
        assert_eq!(delays[0], Duration::from_millis(500));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(delays[5], Duration::from_secs(4));
    }

    #[test]
    fn retry_after_hint_wins_but_is_capped() {
        let policy = BackoffPolicy {
            max_delay: Duration::from_secs(10),
            ..BackoffPolicy::default()
        };

        let hinted = policy.delay_with_hint(
            ErrorClass::RateLimited,
            0,
            Some(Duration::from_secs(7)),
        );
        assert_eq!(hinted, Duration::from_secs(7));

        let hostile = policy.delay_with_hint(
            ErrorClass::RateLimited,
            0,
            Some(Duration::from_secs(3600)),
        );
        assert_eq!(hostile, Duration::from_secs(10));

        let transient = policy.delay_with_hint(
            ErrorClass::Transient,
            0,
            Some(Duration::from_secs(7)),
        );
        assert_eq!(transient, policy.delay_for_attempt(ErrorClass::Transient, 0));
    }

    #[test]
    fn controller_stops_at_retry_budget_and_never_retries_fatal() {
        let controller = BackoffController::new(BackoffPolicy {
            max_retries: 2,
            ..BackoffPolicy::default()
        });

        assert!(controller.should_retry(ErrorClass::Transient, 0));
        assert!(controller.should_retry(ErrorClass::RateLimited, 1));
        assert!(!controller.should_retry(ErrorClass::Transient, 2));
        assert!(!controller.should_retry(ErrorClass::Fatal, 0));
    }

    #[test]
    fn status_classification_separates_429_from_5xx_and_4xx() {
        assert_eq!(classify_status_code(429), ErrorClass::RateLimited);
        assert_eq!(classify_status_code(500), ErrorClass::Transient);
        assert_eq!(classify_status_code(503), ErrorClass::Transient);
        assert_eq!(classify_status_code(401), ErrorClass::Fatal);
        assert_eq!(classify_status_code(404), ErrorClass::Fatal);
        assert_eq!(classify_status_code(422), ErrorClass::Fatal);
    }

    #[test]
    fn error_surface_exposes_class_and_hint() {
        let err = StoreError::Status {
            status: 429,
            endpoint: "create".into(),
            retry_after: Some(3),
        };
        assert_eq!(err.class(), ErrorClass::RateLimited);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));

        assert_eq!(
            StoreError::Config("bad table".into()).class(),
            ErrorClass::Fatal
        );
        assert_eq!(
            StoreError::Source("connection reset".into()).class(),
            ErrorClass::Transient
        );
    }

    #[tokio::test]
    async fn file_checkpoint_round_trips() {
        let dir = tempdir().expect("tempdir");
        let store = FileCheckpointStore::new(dir.path().join("state").join("checkpoint.json"));

        let fresh = store.load().await.expect("load empty");
        assert!(fresh.last_processed_key.is_none());

        let key = NaturalKey::normalize("Corner Cafe").unwrap();
        store.save(&key).await.expect("save");

        let loaded = store.load().await.expect("load");
        assert_eq!(loaded.last_processed_key, Some(key));
    }

    #[tokio::test]
    async fn file_checkpoint_never_moves_backwards() {
        let dir = tempdir().expect("tempdir");
        let store = FileCheckpointStore::new(dir.path().join("checkpoint.json"));

        let later = NaturalKey::normalize("delta diner").unwrap();
        let earlier = NaturalKey::normalize("acme widgets").unwrap();
        store.save(&later).await.expect("save later");
        store.save(&earlier).await.expect("save earlier");

        let loaded = store.load().await.expect("load");
        assert_eq!(loaded.last_processed_key, Some(later));
    }

    #[tokio::test]
    async fn rate_gate_bounds_inflight_requests() {
        let gate = RateGate::new(2, None);
        let first = gate.admit().await;
        let _second = gate.admit().await;

        assert_eq!(gate.inflight.available_permits(), 0);
        drop(first);
        assert_eq!(gate.inflight.available_permits(), 1);
    }
}
