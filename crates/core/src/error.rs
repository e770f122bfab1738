//! Error taxonomy shared by every fleetcheck component.

use std::fmt::Display;

/// Errors surfaced to scenario code. Transient conditions (pod still pending,
/// node not yet advanced) never show up here; they are absorbed by poll loops.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("unsupported kind: {0}")]
    UnsupportedKind(String),
    #[error("shape mismatch at {path}: base is {base}, patch is {patch}")]
    ShapeMismatch { path: String, base: &'static str, patch: &'static str },
    #[error("identity field {field} cannot change ({from} -> {to})")]
    IdentityChange { field: String, from: String, to: String },
    #[error("timed out after {secs}s waiting for {name} during {stage}")]
    ReconcileTimeout { stage: String, name: String, secs: u64 },
    #[error("fleet cycle convergence not reached within {secs}s")]
    FleetCycleTimeout { secs: u64 },
    #[error("validation: {0}")]
    Validation(String),
    #[error("api: {0}")]
    Api(String),
    #[error("template: {0}")]
    Template(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type FleetResult<T> = Result<T, FleetError>;

impl FleetError {
    pub fn api(e: impl Display) -> Self { FleetError::Api(e.to_string()) }
    pub fn internal(e: impl Display) -> Self { FleetError::Internal(e.to_string()) }
    pub fn template(e: impl Display) -> Self { FleetError::Template(e.to_string()) }

    pub fn is_not_found(&self) -> bool { matches!(self, FleetError::NotFound(_)) }
}

impl From<serde_json::Error> for FleetError {
    fn from(e: serde_json::Error) -> Self { FleetError::Internal(format!("json: {}", e)) }
}
