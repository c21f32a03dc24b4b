use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::debug;

/// Single-holder lock over a shared external resource.
///
/// Waiters are served in arrival order (the tokio semaphore is fair), and a
/// release hands the resource over only after the configured cool-down, so
/// back-to-back holders never hit the resource inside its rate window. The
/// guard re-adds the permit on drop, which makes release unconditional on
/// every exit path; there is deliberately no timeout on acquire.
#[derive(Debug, Clone)]
pub struct ResourceLock {
    name: &'static str,
    cooldown: Duration,
    semaphore: Arc<Semaphore>,
}

impl ResourceLock {
    pub fn new(name: &'static str, cooldown: Duration) -> Self {
        Self {
            name,
            cooldown,
            semaphore: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Suspends until the previous holder's cool-down has elapsed.
    pub async fn acquire(&self) -> ResourceGuard {
        let permit = self
            .semaphore
            .acquire()
            .await
            .expect("lock semaphore never closes");
        permit.forget();
        debug!(target: "enroll::lock", lock = self.name, "acquired");
        ResourceGuard {
            name: self.name,
            cooldown: self.cooldown,
            semaphore: Arc::clone(&self.semaphore),
        }
    }

    /// Snapshot of availability, for diagnostics only.
    pub fn is_free(&self) -> bool {
        self.semaphore.available_permits() > 0
    }
}

/// Held lock. Dropping it schedules the hand-over.
pub struct ResourceGuard {
    name: &'static str,
    cooldown: Duration,
    semaphore: Arc<Semaphore>,
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        debug!(target: "enroll::lock", lock = self.name, cooldown_ms = self.cooldown.as_millis() as u64, "released");
        let semaphore = Arc::clone(&self.semaphore);
        if self.cooldown.is_zero() {
            semaphore.add_permits(1);
            return;
        }
        let cooldown = self.cooldown;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(cooldown).await;
                    semaphore.add_permits(1);
                });
            }
            // Outside a runtime there is nothing to schedule the sleep on;
            // hand over immediately rather than leak the permit.
            Err(_) => semaphore.add_permits(1),
        }
    }
}
