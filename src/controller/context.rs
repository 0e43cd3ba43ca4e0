use std::sync::Arc;

use kube::Client;

use crate::arangod::ClientFactory;
use crate::config::OperatorConfig;
use crate::controller::error::BackoffConfig;
use crate::health::HealthState;

/// Shared context for the deployment and backup controllers
#[derive(Clone)]
pub struct Context {
    pub client: Client,
    /// Builds ArangoDB API clients for a deployment
    pub factory: Arc<dyn ClientFactory>,
    pub health_state: Option<Arc<HealthState>>,
    pub config: OperatorConfig,
    pub backoff: BackoffConfig,
}

impl Context {
    pub fn new(
        client: Client,
        factory: Arc<dyn ClientFactory>,
        health_state: Option<Arc<HealthState>>,
        config: OperatorConfig,
    ) -> Self {
        Self {
            client,
            factory,
            health_state,
            config,
            backoff: BackoffConfig::default(),
        }
    }

    pub fn record_reconcile(&self, kind: &str, namespace: &str, name: &str, duration_secs: f64) {
        if let Some(state) = &self.health_state {
            state.metrics.record_reconcile(kind, namespace, name, duration_secs);
            state.touch();
        }
    }

    pub fn record_error(&self, kind: &str, namespace: &str, name: &str) {
        if let Some(state) = &self.health_state {
            state.metrics.record_error(kind, namespace, name);
        }
    }

    pub fn forget(&self, kind: &str, namespace: &str, name: &str) {
        if let Some(state) = &self.health_state {
            state.metrics.forget_object(kind, namespace, name);
        }
    }
}
