//! Harness configuration from `FLEET_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use fleetcheck_index::DetectorConfig;
use fleetcheck_ops::{ReconcilerConfig, DEFAULT_LEASE_NAME};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarnessConfig {
    pub namespace: String,
    pub lease_name: String,
    pub template_path: String,
    pub ready_timeout: Duration,
    pub delete_timeout: Duration,
    pub poll_interval: Duration,
    pub index_name: String,
    pub node_field: String,
    pub sequence_field: String,
    /// Record field carrying the scenario's `test_resource_id` label.
    pub resource_id_field: String,
    pub evaluation_timeout: Duration,
    pub required_cycles: u32,
    pub node_timeout: Duration,
    pub cycle_timeout: Duration,
    pub state_db: Option<String>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            namespace: "kube-system".into(),
            lease_name: DEFAULT_LEASE_NAME.into(),
            template_path: "deploy/k8s/test-resources.yaml".into(),
            ready_timeout: Duration::from_secs(120),
            delete_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(1000),
            index_name: "logs-cloud_security_posture.findings-*".into(),
            node_field: "agent.name".into(),
            sequence_field: "cycle_id".into(),
            resource_id_field: "resource.raw.metadata.labels.test_resource_id".into(),
            evaluation_timeout: Duration::from_secs(300),
            required_cycles: 2,
            node_timeout: Duration::from_secs(30),
            cycle_timeout: Duration::from_secs(600),
            state_db: None,
        }
    }
}

fn env_string(key: &str, default: String) -> String {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty()).unwrap_or(default)
}

fn env_parse<T: FromStr + Copy>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().unwrap_or_else(|_| {
            warn!(key, value = %raw, "unparseable setting; using default");
            default
        }),
        Err(_) => default,
    }
}

impl HarnessConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            namespace: env_string("FLEET_NAMESPACE", d.namespace),
            lease_name: env_string("FLEET_LEASE_NAME", d.lease_name),
            template_path: env_string("FLEET_TEMPLATE_PATH", d.template_path),
            ready_timeout: Duration::from_secs(env_parse("FLEET_WATCH_TIMEOUT_SECS", d.ready_timeout.as_secs())),
            delete_timeout: Duration::from_secs(env_parse("FLEET_DELETE_TIMEOUT_SECS", d.delete_timeout.as_secs())),
            poll_interval: Duration::from_millis(env_parse("FLEET_POLL_INTERVAL_MS", d.poll_interval.as_millis() as u64)),
            index_name: env_string("FLEET_INDEX", d.index_name),
            node_field: env_string("FLEET_NODE_FIELD", d.node_field),
            sequence_field: env_string("FLEET_SEQUENCE_FIELD", d.sequence_field),
            resource_id_field: env_string("FLEET_RESOURCE_ID_FIELD", d.resource_id_field),
            evaluation_timeout: Duration::from_secs(env_parse("FLEET_EVALUATION_TIMEOUT_SECS", d.evaluation_timeout.as_secs())),
            required_cycles: env_parse("FLEET_REQUIRED_CYCLES", d.required_cycles),
            node_timeout: Duration::from_secs(env_parse("FLEET_NODE_TIMEOUT_SECS", d.node_timeout.as_secs())),
            cycle_timeout: Duration::from_secs(env_parse("FLEET_CYCLE_TIMEOUT_SECS", d.cycle_timeout.as_secs())),
            state_db: std::env::var("FLEET_STATE_DB").ok().filter(|s| !s.trim().is_empty()),
        }
    }

    pub fn reconciler(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            template_path: self.template_path.clone(),
            delete_timeout: self.delete_timeout,
            ready_timeout: self.ready_timeout,
        }
    }

    pub fn detector(&self) -> DetectorConfig {
        DetectorConfig {
            index: self.index_name.clone(),
            node_field: self.node_field.clone(),
            sequence_field: self.sequence_field.clone(),
            poll_interval: self.poll_interval,
        }
    }
}
