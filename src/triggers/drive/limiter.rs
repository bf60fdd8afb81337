use log::debug;
use once_cell::sync::Lazy;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::error::AutoscanError;

/// Google enforces quota per cloud project, so every drive authenticated by
/// service accounts of one project shares a single limiter.
const REQUESTS_PER_SECOND: u32 = 8;
const MAX_CONCURRENT_SYNCS: usize = 5;

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate: u32) -> Self {
        Self {
            tokens: rate as f64,
            capacity: rate as f64,
            refill_per_sec: rate as f64,
            last_refill: Instant::now(),
        }
    }

    /// Takes one token, or reports how long to wait for the next one.
    fn try_take(&mut self) -> Result<(), Duration> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }

        let deficit = 1.0 - self.tokens;
        Err(Duration::from_secs_f64(deficit / self.refill_per_sec))
    }
}

/// Combines a request-rate token bucket with a weighted semaphore bounding
/// concurrent sync runs.
#[derive(Debug)]
pub struct AccountLimiter {
    bucket: Mutex<TokenBucket>,
    syncs: Semaphore,
}

impl AccountLimiter {
    pub fn new(requests_per_second: u32, max_concurrent_syncs: usize) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket::new(requests_per_second)),
            syncs: Semaphore::new(max_concurrent_syncs),
        }
    }

    /// Blocks until one API request may go out.
    pub async fn wait(&self) {
        loop {
            let result = self.bucket.lock().unwrap().try_take();
            match result {
                Ok(()) => return,
                Err(delay) => tokio::time::sleep(delay).await,
            }
        }
    }

    /// One permit per running sync; released when the permit drops.
    pub async fn acquire_sync(&self) -> SemaphorePermit<'_> {
        self.syncs
            .acquire()
            .await
            .expect("sync semaphore never closes")
    }
}

#[derive(Deserialize)]
struct AccountFile {
    project_id: String,
}

static LIMITERS: Lazy<Mutex<HashMap<String, Arc<AccountLimiter>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Returns the shared limiter for the project owning the given service
/// account file, creating it on first use.
pub fn limiter_for_account(account_path: &Path) -> Result<Arc<AccountLimiter>, AutoscanError> {
    let raw = std::fs::read(account_path).map_err(|err| {
        AutoscanError::Config(format!(
            "failed reading account {}: {err}",
            account_path.display()
        ))
    })?;

    let account: AccountFile = serde_json::from_slice(&raw).map_err(|err| {
        AutoscanError::Config(format!(
            "failed decoding account {}: {err}",
            account_path.display()
        ))
    })?;

    let mut limiters = LIMITERS.lock().unwrap();
    let limiter = limiters
        .entry(account.project_id.clone())
        .or_insert_with(|| {
            debug!("Creating rate limiter for project: {}", account.project_id);
            Arc::new(AccountLimiter::new(REQUESTS_PER_SECOND, MAX_CONCURRENT_SYNCS))
        });

    Ok(Arc::clone(limiter))
}
