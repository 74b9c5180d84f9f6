use cloud_orchestrator::InstanceManager;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinSet;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub manager: InstanceManager,
    provisioning: Arc<Mutex<JoinSet<()>>>,
}

impl AppState {
    pub fn new(manager: InstanceManager) -> Self {
        Self {
            manager,
            provisioning: Arc::new(Mutex::new(JoinSet::new())),
        }
    }

    /// Run provisioning work outside the request. Tracked so shutdown can
    /// wait for it.
    pub fn spawn_provisioning<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self
            .provisioning
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // reap whatever already finished
        while tasks.try_join_next().is_some() {}
        tasks.spawn(work);
    }

    /// Wait for every provisioning task spawned so far.
    pub async fn drain_provisioning(&self) {
        let mut tasks = std::mem::take(
            &mut *self
                .provisioning
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        if !tasks.is_empty() {
            info!(pending = tasks.len(), "waiting for provisioning tasks");
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("provisioning task did not complete: {e}");
            }
        }
    }
}
