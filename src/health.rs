//! Health server for Kubernetes probes and Prometheus metrics
//!
//! Provides HTTP endpoints for:
//! - `/healthz` - Liveness probe
//! - `/readyz` - Readiness probe, true once this instance leads and runs controllers
//! - `/metrics` - Prometheus metrics

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabel, EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio::sync::RwLock;

use crate::crd::{ActionType, BackupState};

/// Labels identifying a reconciled object
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ObjectLabels {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl EncodeLabelSet for ObjectLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder) -> Result<(), std::fmt::Error> {
        ("kind", self.kind.as_str()).encode(encoder.encode_label())?;
        ("namespace", self.namespace.as_str()).encode(encoder.encode_label())?;
        ("name", self.name.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ActionLabels {
    pub action: String,
}

impl EncodeLabelSet for ActionLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder) -> Result<(), std::fmt::Error> {
        ("action", self.action.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct BackupStateLabels {
    pub namespace: String,
    pub name: String,
    pub state: String,
}

impl EncodeLabelSet for BackupStateLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder) -> Result<(), std::fmt::Error> {
        ("namespace", self.namespace.as_str()).encode(encoder.encode_label())?;
        ("name", self.name.as_str()).encode(encoder.encode_label())?;
        ("state", self.state.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

fn object(kind: &str, namespace: &str, name: &str) -> ObjectLabels {
    ObjectLabels {
        kind: kind.to_string(),
        namespace: namespace.to_string(),
        name: name.to_string(),
    }
}

/// Shared metrics state
pub struct Metrics {
    pub reconciliations_total: Family<ObjectLabels, Counter>,
    pub reconciliation_errors_total: Family<ObjectLabels, Counter>,
    pub reconcile_duration_seconds: Family<ObjectLabels, Histogram>,
    /// Actions left in the stored plan of each deployment
    pub plan_actions: Family<ObjectLabels, Gauge>,
    pub actions_executed_total: Family<ActionLabels, Counter>,
    /// 1 for the current state of each backup, 0 for the others
    pub backup_state: Family<BackupStateLabels, Gauge>,

    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("arango_operator");

        let reconciliations_total = Family::<ObjectLabels, Counter>::default();
        registry.register(
            "reconciliations",
            "Total number of reconciliations",
            reconciliations_total.clone(),
        );

        let reconciliation_errors_total = Family::<ObjectLabels, Counter>::default();
        registry.register(
            "reconciliation_errors",
            "Total number of reconciliation errors",
            reconciliation_errors_total.clone(),
        );

        let reconcile_duration_seconds =
            Family::<ObjectLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 15))
            });
        registry.register(
            "reconcile_duration_seconds",
            "Duration of reconciliation in seconds",
            reconcile_duration_seconds.clone(),
        );

        let plan_actions = Family::<ObjectLabels, Gauge>::default();
        registry.register(
            "plan_actions",
            "Number of actions in the current deployment plan",
            plan_actions.clone(),
        );

        let actions_executed_total = Family::<ActionLabels, Counter>::default();
        registry.register(
            "actions_executed",
            "Total number of completed plan actions by type",
            actions_executed_total.clone(),
        );

        let backup_state = Family::<BackupStateLabels, Gauge>::default();
        registry.register(
            "backup_state",
            "Current state of each ArangoBackup",
            backup_state.clone(),
        );

        Self {
            reconciliations_total,
            reconciliation_errors_total,
            reconcile_duration_seconds,
            plan_actions,
            actions_executed_total,
            backup_state,
            registry,
        }
    }

    pub fn record_reconcile(&self, kind: &str, namespace: &str, name: &str, duration_secs: f64) {
        let labels = object(kind, namespace, name);
        self.reconciliations_total.get_or_create(&labels).inc();
        self.reconcile_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    pub fn record_error(&self, kind: &str, namespace: &str, name: &str) {
        self.reconciliation_errors_total
            .get_or_create(&object(kind, namespace, name))
            .inc();
    }

    pub fn set_plan_length(&self, namespace: &str, name: &str, actions: usize) {
        self.plan_actions
            .get_or_create(&object("ArangoDeployment", namespace, name))
            .set(actions as i64);
    }

    pub fn record_actions(&self, actions: &[ActionType]) {
        for action in actions {
            self.actions_executed_total
                .get_or_create(&ActionLabels {
                    action: action.to_string(),
                })
                .inc();
        }
    }

    pub fn set_backup_state(&self, namespace: &str, name: &str, current: BackupState) {
        for state in BackupState::ALL {
            let labels = BackupStateLabels {
                namespace: namespace.to_string(),
                name: name.to_string(),
                state: state.to_string(),
            };
            self.backup_state
                .get_or_create(&labels)
                .set(i64::from(state == current));
        }
    }

    /// Drop the series of an object that no longer exists
    pub fn forget_object(&self, kind: &str, namespace: &str, name: &str) {
        let labels = object(kind, namespace, name);
        self.reconciliations_total.remove(&labels);
        self.reconciliation_errors_total.remove(&labels);
        self.reconcile_duration_seconds.remove(&labels);
        self.plan_actions.remove(&labels);

        if kind == "ArangoBackup" {
            for state in BackupState::ALL {
                self.backup_state.remove(&BackupStateLabels {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                    state: state.to_string(),
                });
            }
        }
    }

    /// Encode metrics to Prometheus text format
    fn encode(&self) -> String {
        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, &self.registry) {
            tracing::error!("Failed to encode metrics: {}", e);
            return String::new();
        }
        buffer
    }
}

/// Shared state for the health server
pub struct HealthState {
    pub ready: RwLock<bool>,
    pub metrics: Metrics,
    /// Unix time of the last successful reconciliation
    pub last_reconcile: AtomicU64,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Metrics::new(),
            last_reconcile: AtomicU64::new(0),
        }
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }

    pub fn touch(&self) {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        self.last_reconcile.store(now, Ordering::Relaxed);
    }
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

async fn metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

pub async fn run_health_server(state: Arc<HealthState>, addr: SocketAddr) -> Result<(), std::io::Error> {
    let app = create_router(state);

    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Health server listening on {}", addr);

    axum::serve(listener, app).await
}
