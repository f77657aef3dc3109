use std::sync::Arc;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, warn};

/// Descriptors kept free for stdio, log files, DNS and the report.
const HEADROOM: u64 = 64;

#[cfg(unix)]
fn descriptor_limit(wanted: u64) -> u64 {
    // raise the soft limit towards the hard limit first, like `ulimit -n` would
    match rlimit::increase_nofile_limit(wanted) {
        Ok(soft) => soft,
        Err(e) => {
            warn!("could not read the open file limit: {}", e);
            rlimit::Resource::NOFILE.get().map(|(soft, _)| soft).unwrap_or(1024)
        }
    }
}

#[cfg(not(unix))]
fn descriptor_limit(_wanted: u64) -> u64 {
    8000
}

/// Number of sockets that may be open at once for a scan that wants
/// `concurrency` of them.
pub fn socket_budget(concurrency: usize) -> usize {
    let wanted = concurrency as u64 + HEADROOM;
    let limit = descriptor_limit(wanted);
    let budget = limit.saturating_sub(HEADROOM).max(1).min(concurrency as u64) as usize;
    if budget < concurrency {
        warn!(
            "open file limit is {}, running {} connection attempts at a time instead of {}",
            limit, budget, concurrency
        );
    } else {
        debug!("open file limit {} allows {} sockets", limit, budget);
    }
    budget
}

/// FIFO gate in front of socket creation. A probe only starts its connect
/// timeout once it holds a permit, so waiting here never turns into `Filtered`.
#[derive(Clone)]
pub struct SocketGate {
    permits: Arc<Semaphore>,
}

impl SocketGate {
    pub fn new(sockets: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(sockets.max(1))),
        }
    }

    /// Waits for a free socket slot. `None` only if the gate was closed.
    pub async fn acquire(&self) -> Option<SemaphorePermit<'_>> {
        self.permits.acquire().await.ok()
    }
}
