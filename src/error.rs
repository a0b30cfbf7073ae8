use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph::ResourceIndex;

/// Errors raised while building graphs, loading config or misusing the API.
///
/// Runtime failures of jobs never surface as `EngineError`; they travel as
/// [`Failure`] values through escalation.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Team not found: {0}")]
    TeamNotFound(String),

    #[error("Duplicate {what} name: {name}")]
    Duplicate { what: &'static str, name: String },

    #[error("Resource dependency cycle through `{0}`")]
    ResourceCycle(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// The four classes of runtime failure the engine distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureCategory {
    /// Load, readiness or coordination of a managed resource failed.
    Resource,
    /// The job behavior itself failed or panicked.
    Execution,
    /// A join or async signal timed out.
    Join,
    /// No handler matched anywhere, or a handler itself failed.
    Unhandled,
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureCategory::Resource => write!(f, "Resource"),
            FailureCategory::Execution => write!(f, "Execution"),
            FailureCategory::Join => write!(f, "Join"),
            FailureCategory::Unhandled => write!(f, "Unhandled"),
        }
    }
}

/// Dotted failure type name, e.g. `resource.timeout`.
///
/// Kinds form a hierarchy by prefix: `io` is the parent of `io.read`.
/// The special kind `*` is the root and matches every failure.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FailureKind(String);

impl FailureKind {
    pub const ANY: &'static str = "*";

    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// How specifically `self`, used as a handler entry, matches `failure`.
    ///
    /// Returns `None` when it does not match, `Some(0)` for `*` and otherwise
    /// the number of matching segments.
    pub fn specificity(&self, failure: &FailureKind) -> Option<usize> {
        if self.0 == Self::ANY {
            return Some(0);
        }
        let mut handler = self.0.split('.');
        let mut actual = failure.0.split('.');
        let mut depth = 0;
        loop {
            match (handler.next(), actual.next()) {
                (None, _) => return Some(depth),
                (Some(h), Some(a)) if h == a => depth += 1,
                _ => return None,
            }
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FailureKind {
    fn from(kind: &str) -> Self {
        Self::new(kind)
    }
}

pub mod kinds {
    pub const RESOURCE_LOAD: &str = "resource.load";
    pub const RESOURCE_TIMEOUT: &str = "resource.timeout";
    pub const RESOURCE_COORDINATE: &str = "resource.coordinate";
    pub const RESOURCE_UNKNOWN: &str = "resource.unknown";
    pub const RESOURCE_TYPE: &str = "resource.type";
    pub const JOIN_TIMEOUT: &str = "join.timeout";
    pub const SIGNAL_TIMEOUT: &str = "signal.timeout";
    pub const JOB_PANIC: &str = "job.panic";
    pub const JOB_SUSPEND: &str = "job.suspend";
    pub const FLOW_UNKNOWN_JOB: &str = "flow.unknown_job";
}

/// A runtime failure routed through escalation.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{category} failure `{kind}`: {message}")]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
    pub category: FailureCategory,
    /// Resource whose integration caused the failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceIndex>,
    /// Token of the join that timed out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<serde_json::Value>,
}

impl Failure {
    /// An execution failure raised by job code.
    pub fn new(kind: impl Into<FailureKind>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            category: FailureCategory::Execution,
            resource: None,
            token: None,
        }
    }

    pub fn resource(
        kind: impl Into<FailureKind>,
        resource: ResourceIndex,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category: FailureCategory::Resource,
            resource: Some(resource),
            ..Self::new(kind, message)
        }
    }

    pub fn join_timeout(token: Option<serde_json::Value>) -> Self {
        Self {
            category: FailureCategory::Join,
            token,
            ..Self::new(kinds::JOIN_TIMEOUT, "timed out waiting on flow")
        }
    }

    pub fn signal_timeout() -> Self {
        Self {
            category: FailureCategory::Join,
            ..Self::new(kinds::SIGNAL_TIMEOUT, "timed out waiting on async signal")
        }
    }

    pub(crate) fn panic(message: String) -> Self {
        Self::new(kinds::JOB_PANIC, message)
    }

    pub(crate) fn unhandled(self) -> Self {
        Self {
            category: FailureCategory::Unhandled,
            ..self
        }
    }

    pub fn with_resource(mut self, resource: ResourceIndex) -> Self {
        self.resource = Some(resource);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_specificity_prefers_longer_prefix() {
        let failure = FailureKind::new("io.read.eof");
        assert_eq!(FailureKind::new("*").specificity(&failure), Some(0));
        assert_eq!(FailureKind::new("io").specificity(&failure), Some(1));
        assert_eq!(FailureKind::new("io.read").specificity(&failure), Some(2));
        assert_eq!(FailureKind::new("io.write").specificity(&failure), None);
        assert_eq!(FailureKind::new("io.read.eof.x").specificity(&failure), None);
    }

    #[test]
    fn kind_does_not_match_partial_segment() {
        let failure = FailureKind::new("iox.read");
        assert_eq!(FailureKind::new("io").specificity(&failure), None);
    }

    #[test]
    fn failure_display() {
        let failure = Failure::new("order.invalid", "missing sku");
        assert_eq!(
            failure.to_string(),
            "Execution failure `order.invalid`: missing sku"
        );
    }

    #[test]
    fn join_timeout_carries_token() {
        let failure = Failure::join_timeout(Some(serde_json::json!("second")));
        assert_eq!(failure.category, FailureCategory::Join);
        assert_eq!(failure.kind.as_str(), kinds::JOIN_TIMEOUT);
        assert_eq!(failure.token, Some(serde_json::json!("second")));
    }

    #[test]
    fn engine_error_display() {
        let err = EngineError::Duplicate {
            what: "job",
            name: "start".into(),
        };
        assert_eq!(err.to_string(), "Duplicate job name: start");
    }

    #[test]
    fn failure_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Failure>();
        assert_send_sync::<EngineError>();
    }
}
