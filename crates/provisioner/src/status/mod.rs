//! Normalization of heterogeneous raw status payloads into one token.
//!
//! Strategies are looked up by (API group, resource plural). Kinds without a
//! registered strategy use [`strategies::default_status`].

use std::collections::HashMap;

use api_types::NormalizedStatus;
use error_stack::Report;
use serde_json::Value;

use crate::error::ProvisionError;
use crate::gateway::ObjectKind;

pub mod strategies;

pub use self::strategies::ShapeError;
pub use self::strategies::StrategyResult;

pub type StatusStrategy = fn(&Value) -> StrategyResult;

#[derive(Debug, Clone)]
pub struct StatusReconciler {
    strategies: HashMap<(String, String), StatusStrategy>,
    fallback: StatusStrategy,
}

impl Default for StatusReconciler {
    fn default() -> Self {
        let mut reconciler = Self::empty();
        reconciler.register("argoproj.io", "workflows", strategies::workflow_status);
        reconciler.register("kubeflow.org", "notebooks", strategies::session_crd_status);
        reconciler.register(
            "serving.kserve.io",
            "inferenceservices",
            strategies::serving_readiness_status,
        );
        reconciler.register("batch.volcano.sh", "jobs", strategies::batch_job_status);
        reconciler
    }
}

impl StatusReconciler {
    /// A reconciler with only the default strategy.
    pub fn empty() -> Self {
        Self {
            strategies: HashMap::new(),
            fallback: strategies::default_status,
        }
    }

    /// Register (or replace) the strategy for a group and plural.
    pub fn register(
        &mut self,
        group: impl Into<String>,
        plural: impl Into<String>,
        strategy: StatusStrategy,
    ) -> &mut Self {
        self.strategies
            .insert((group.into(), plural.into()), strategy);
        self
    }

    pub fn strategy_for(&self, kind: &ObjectKind) -> StatusStrategy {
        self.strategies
            .get(&(kind.group.to_string(), kind.plural.to_string()))
            .copied()
            .unwrap_or(self.fallback)
    }

    /// Normalize the raw payload of a live object of `kind`.
    pub fn normalize(
        &self,
        kind: &ObjectKind,
        raw: &Value,
    ) -> Result<NormalizedStatus, Report<ProvisionError>> {
        (self.strategy_for(kind))(raw).map_err(|shape| {
            Report::new(shape.clone())
                .change_context(ProvisionError::status_shape(kind.to_string(), shape.0))
        })
    }
}

#[cfg(test)]
mod tests {
    use api_types::LifecyclePhase;
    use serde_json::json;
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn dispatch_by_group_and_plural() {
        let reconciler = StatusReconciler::default();
        let payload = json!({"status": {"conditions": [
            {"type": "Initializing"},
            {"type": "Ready", "status": "True"},
        ]}});

        assert_eq!(
            reconciler.normalize(&ObjectKind::NOTEBOOK, &payload).unwrap().as_str(),
            "Initializing"
        );
        assert_eq!(
            reconciler
                .normalize(&ObjectKind::INFERENCE_SERVICE, &payload)
                .unwrap()
                .as_str(),
            "ready"
        );
        assert_eq!(
            reconciler.normalize(&ObjectKind::POD, &payload).unwrap().as_str(),
            "Ready"
        );
    }

    #[test]
    fn running_pod_through_default() {
        let reconciler = StatusReconciler::default();
        let status = reconciler
            .normalize(&ObjectKind::POD, &json!({"status": {"phase": "Running"}}))
            .unwrap();
        assert_eq!(status.as_str(), "Running");
        assert_eq!(status.phase(), LifecyclePhase::Running);
    }

    #[test]
    fn empty_object_distinguishes_no_status_from_malformed() {
        let reconciler = StatusReconciler::default();
        let empty = json!({});

        let status = reconciler.normalize(&ObjectKind::POD, &empty).unwrap();
        assert_eq!(status.as_str(), "");
        assert_eq!(status.phase(), LifecyclePhase::Creating);

        let err = reconciler
            .normalize(&ObjectKind::NOTEBOOK, &empty)
            .unwrap_err();
        assert_eq!(
            err.current_context().to_string(),
            "Malformed status for Notebook.kubeflow.org: status.conditions not found"
        );
    }

    #[test]
    fn plural_alone_does_not_select_strategy() {
        // `jobs` in the batch API group is not a Volcano job.
        let reconciler = StatusReconciler::default();
        let batch_job = ObjectKind::custom("batch", "v1", "Job", "jobs");
        let err = reconciler.normalize(&batch_job, &json!({"status": {}})).unwrap_err();
        assert!(matches!(
            err.current_context(),
            ProvisionError::StatusShape { .. }
        ));

        let status = reconciler
            .normalize(&ObjectKind::VOLCANO_JOB, &json!({"status": {}}))
            .unwrap();
        assert_eq!(status.as_str(), "unready");
    }

    #[test]
    fn custom_strategy_registration() {
        fn always_ready(_: &Value) -> StrategyResult {
            Ok(NormalizedStatus::new("Ready"))
        }

        let mut reconciler = StatusReconciler::empty();
        reconciler.register("example.io", "widgets", always_ready);
        let widget = ObjectKind::custom("example.io", "v1", "Widget", "widgets");

        assert_eq!(
            reconciler.normalize(&widget, &json!({})).unwrap().as_str(),
            "Ready"
        );
        // Nothing else is registered on an empty reconciler.
        assert!(reconciler
            .normalize(&ObjectKind::NOTEBOOK, &json!({}))
            .unwrap()
            .is_empty());
    }
}
