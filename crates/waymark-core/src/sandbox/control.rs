//! Run-wide cancellation: the run deadline, scoped deadlines and the abort
//! flag raised when the executor gives up on a run.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use super::error::{SandboxError, SandboxResult};

#[derive(Debug, Clone, Copy)]
struct Deadline {
    id: u64,
    at: Instant,
    limit_ms: u64,
}

#[derive(Debug)]
pub struct RunControl {
    started: Instant,
    run: Deadline,
    aborted: AtomicBool,
    scoped: Mutex<Vec<Deadline>>,
    next_id: AtomicU64,
}

impl RunControl {
    pub fn new(limit: Duration) -> Self {
        let started = Instant::now();
        Self {
            started,
            run: Deadline {
                id: 0,
                at: started + limit,
                limit_ms: limit.as_millis() as u64,
            },
            aborted: AtomicBool::new(false),
            scoped: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn limit_ms(&self) -> u64 {
        self.run.limit_ms
    }

    /// Stop all further progress. Every later check reports `Timeout`.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// True once the run itself can make no further progress.
    pub fn run_expired(&self) -> bool {
        self.is_aborted() || Instant::now() >= self.run.at
    }

    fn nearest(&self) -> Deadline {
        let scoped = self.scoped.lock().unwrap_or_else(|e| e.into_inner());
        scoped
            .iter()
            .copied()
            .fold(self.run, |best, d| if d.at < best.at { d } else { best })
    }

    /// `Timeout` if the run or any scoped deadline has passed.
    pub fn check(&self) -> SandboxResult<()> {
        if self.is_aborted() {
            return Err(SandboxError::Timeout {
                limit_ms: self.run.limit_ms,
            });
        }
        let nearest = self.nearest();
        if Instant::now() >= nearest.at {
            return Err(SandboxError::Timeout {
                limit_ms: nearest.limit_ms,
            });
        }
        Ok(())
    }

    /// Install a deadline `limit` from now until the guard is dropped.
    pub fn push_deadline(&self, limit: Duration) -> DeadlineGuard<'_> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let deadline = Deadline {
            id,
            at: Instant::now() + limit,
            limit_ms: limit.as_millis() as u64,
        };
        self.scoped
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(deadline);
        DeadlineGuard { control: self, id }
    }

    /// Race `fut` against the nearest deadline.
    pub async fn bound<T, F>(&self, fut: F) -> SandboxResult<T>
    where
        F: Future<Output = SandboxResult<T>>,
    {
        self.check()?;
        let nearest = self.nearest();
        match tokio::time::timeout_at(nearest.at, fut).await {
            Ok(result) => result,
            Err(_elapsed) => Err(SandboxError::Timeout {
                limit_ms: nearest.limit_ms,
            }),
        }
    }

    /// Sleep for `ms`, cut short (with `Timeout`) by the nearest deadline.
    pub async fn sleep(&self, ms: u64) -> SandboxResult<()> {
        self.bound(async {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(())
        })
        .await
    }
}

/// Removes its scoped deadline on drop.
#[derive(Debug)]
pub struct DeadlineGuard<'a> {
    control: &'a RunControl,
    id: u64,
}

impl DeadlineGuard<'_> {
    pub fn expired(&self) -> bool {
        let scoped = self
            .control
            .scoped
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        scoped
            .iter()
            .find(|d| d.id == self.id)
            .is_some_and(|d| Instant::now() >= d.at)
    }
}

impl Drop for DeadlineGuard<'_> {
    fn drop(&mut self) {
        self.control
            .scoped
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|d| d.id != self.id);
    }
}
