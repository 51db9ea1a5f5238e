//! Ordered creation of a plan with compensating deletes on failure.
//!
//! The cluster API has no multi-object transaction, so rollback is best
//! effort: a unit whose compensating delete fails stays on the cluster and is
//! reported in [`ProvisionResult::created_units`] together with the error.

use error_stack::Report;
use error_stack::ResultExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use crate::builder::FailurePolicy;
use crate::builder::ResourceUnit;
use crate::builder::RollbackAction;
use crate::error::ProvisionError;
use crate::gateway::ClusterGateway;
use crate::gateway::ObjectRef;

/// Tracing target for one line per object created, rolled back or deleted.
pub const AUDIT_TARGET: &str = "audit";

/// Outcome of one apply call.
#[derive(Debug)]
pub struct ProvisionResult {
    /// Units present on the cluster after the call, in creation order
    pub created_units: Vec<ObjectRef>,
    pub access_endpoint: Option<String>,
    /// Creation error combined with every rollback failure
    pub error: Option<Report<ProvisionError>>,
}

impl ProvisionResult {
    fn succeeded(created_units: Vec<ObjectRef>) -> Self {
        Self {
            created_units,
            access_endpoint: None,
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

pub struct ProvisioningOrchestrator<G> {
    gateway: G,
}

impl<G: ClusterGateway> ProvisioningOrchestrator<G> {
    pub fn new(gateway: G) -> Self {
        Self { gateway }
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    /// Create `units` in order, replacing any stale object with the same identity.
    ///
    /// When a unit fails and its policy is [`FailurePolicy::RollBackCreated`],
    /// every unit created so far is deleted in reverse order before returning.
    pub async fn apply(&self, units: &[ResourceUnit]) -> ProvisionResult {
        self.apply_until_cancelled(units, &CancellationToken::new())
            .await
    }

    /// [`apply`](Self::apply), stopping when `cancel` fires.
    ///
    /// Cancellation abandons the in-flight primitive and returns
    /// [`ProvisionError::Cancelled`] with the units created so far. No rollback
    /// is attempted; the caller must tear them down explicitly.
    #[tracing::instrument(skip_all, fields(units = units.len()))]
    pub async fn apply_until_cancelled(
        &self,
        units: &[ResourceUnit],
        cancel: &CancellationToken,
    ) -> ProvisionResult {
        let mut created: Vec<&ResourceUnit> = Vec::with_capacity(units.len());

        for unit in units {
            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                outcome = self.create_unit(unit) => Some(outcome),
            };

            match outcome {
                Some(Ok(target)) => {
                    info!(target: AUDIT_TARGET, action = "create", object = %target);
                    created.push(unit);
                }
                Some(Err(err)) => return self.fail(unit, created, err).await,
                None => {
                    warn!(
                        created = created.len(),
                        "Provisioning cancelled, created units are left in place"
                    );
                    let error = Report::new(ProvisionError::Cancelled {
                        created: created.len(),
                    });
                    return ProvisionResult {
                        created_units: created.iter().map(|u| u.object_ref()).collect(),
                        access_endpoint: None,
                        error: Some(error),
                    };
                }
            }
        }

        info!("All units created");
        ProvisionResult::succeeded(created.iter().map(|u| u.object_ref()).collect())
    }

    async fn create_unit(&self, unit: &ResourceUnit) -> Result<ObjectRef, Report<ProvisionError>> {
        let target = unit.object_ref();
        self.delete_tolerating_missing(&target)
            .await
            .attach_printable("failed to remove stale object before create")?;

        self.gateway
            .create_object(&unit.namespace, &unit.kind, &unit.spec)
            .await
            .change_context_lazy(|| ProvisionError::transport(format!("failed to create {target}")))
    }

    async fn fail(
        &self,
        failed: &ResourceUnit,
        created: Vec<&ResourceUnit>,
        err: Report<ProvisionError>,
    ) -> ProvisionResult {
        let failed_ref = failed.object_ref();
        let mut report = if created.is_empty() {
            err
        } else {
            err.change_context(ProvisionError::PartialProvision {
                unit: failed_ref.to_string(),
            })
        };

        if failed.on_failure == FailurePolicy::KeepCreated {
            warn!(
                failed = %failed_ref,
                kept = created.len(),
                "Unit failed, keeping earlier units per failure policy"
            );
            return ProvisionResult {
                created_units: created.iter().map(|u| u.object_ref()).collect(),
                access_endpoint: None,
                error: Some(report),
            };
        }

        warn!(failed = %failed_ref, rollback = created.len(), "Unit failed, rolling back");
        let mut remaining = Vec::new();
        for unit in created.iter().rev() {
            let Some(RollbackAction::Delete(target)) = &unit.rollback else {
                remaining.push(unit.object_ref());
                continue;
            };
            match self.delete_tolerating_missing(target).await {
                Ok(()) => {
                    info!(target: AUDIT_TARGET, action = "rollback", object = %target);
                }
                Err(rollback_err) => {
                    tracing::error!(object = %target, "Rollback failed, object is orphaned");
                    remaining.push(unit.object_ref());
                    report.extend_one(rollback_err.change_context(ProvisionError::RollbackFailed {
                        unit: target.to_string(),
                    }));
                }
            }
        }
        remaining.reverse();

        ProvisionResult {
            created_units: remaining,
            access_endpoint: None,
            error: Some(report),
        }
    }

    /// Push `spec` to a live object.
    ///
    /// Kinds that accept changes in place are patched. Others are deleted and
    /// recreated, so the workload is unavailable between the two calls.
    #[tracing::instrument(skip(self, spec), fields(target = %target))]
    pub async fn replace(
        &self,
        target: &ObjectRef,
        spec: &Value,
    ) -> Result<ObjectRef, Report<ProvisionError>> {
        if target.kind.patchable_in_place() {
            let updated = self
                .gateway
                .update_object(&target.namespace, &target.kind, &target.name, spec)
                .await
                .change_context_lazy(|| ProvisionError::transport(format!("failed to patch {target}")))?;
            info!(target: AUDIT_TARGET, action = "patch", object = %updated);
            return Ok(updated);
        }

        self.delete_tolerating_missing(target).await?;
        info!(target: AUDIT_TARGET, action = "delete", object = %target);
        let created = self
            .gateway
            .create_object(&target.namespace, &target.kind, spec)
            .await
            .change_context_lazy(|| ProvisionError::transport(format!("failed to recreate {target}")))?;
        info!(target: AUDIT_TARGET, action = "create", object = %created);
        Ok(created)
    }

    /// Delete every unit, tolerating ones that are already gone.
    ///
    /// All units are attempted even when some fail; the failures are
    /// returned together. Calling this again on the same units is a no-op.
    #[tracing::instrument(skip_all, fields(units = units.len()))]
    pub async fn teardown(&self, units: &[ObjectRef]) -> Result<(), Report<ProvisionError>> {
        let mut errors: Option<Report<ProvisionError>> = None;

        for target in units.iter().rev() {
            match self.delete_tolerating_missing(target).await {
                Ok(()) => info!(target: AUDIT_TARGET, action = "delete", object = %target),
                Err(err) => match errors.as_mut() {
                    Some(errors) => errors.extend_one(err),
                    None => errors = Some(err),
                },
            }
        }

        errors.map_or(Ok(()), Err)
    }

    async fn delete_tolerating_missing(&self, target: &ObjectRef) -> Result<(), Report<ProvisionError>> {
        match self
            .gateway
            .delete_object(&target.namespace, &target.kind, &target.name)
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if err.current_context().is_not_found() => Ok(()),
            Err(err) => Err(err.change_context(ProvisionError::transport(format!(
                "failed to delete {target}"
            )))),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::gateway::memory::GatewayOp;
    use crate::gateway::MemoryGateway;
    use crate::gateway::ObjectKind;

    fn unit(kind: ObjectKind, name: &str) -> ResourceUnit {
        let spec = json!({
            "apiVersion": kind.api_version(),
            "kind": kind.kind,
            "metadata": { "name": name },
            "spec": {},
        });
        ResourceUnit::new(kind, "ns", name, spec)
    }

    fn three_unit_plan() -> Vec<ResourceUnit> {
        vec![
            unit(ObjectKind::POD, "one"),
            unit(ObjectKind::SERVICE, "two"),
            unit(ObjectKind::VIRTUAL_SERVICE, "three"),
        ]
    }

    #[test(tokio::test)]
    async fn apply_creates_in_order() {
        let gateway = MemoryGateway::new();
        let orchestrator = ProvisioningOrchestrator::new(gateway.clone());
        let plan = three_unit_plan();

        let result = orchestrator.apply(&plan).await;
        assert!(result.is_success());
        assert_eq!(
            result.created_units,
            plan.iter().map(ResourceUnit::object_ref).collect::<Vec<_>>()
        );
        assert_eq!(gateway.object_count(), 3);
    }

    #[test(tokio::test)]
    async fn failure_in_middle_rolls_back_everything() {
        let gateway = MemoryGateway::new();
        gateway.fail_on(GatewayOp::Create, "two");
        let orchestrator = ProvisioningOrchestrator::new(gateway.clone());

        let result = orchestrator.apply(&three_unit_plan()).await;
        let err = result.error.expect("apply should fail");
        assert!(result.created_units.is_empty());
        assert_eq!(gateway.object_count(), 0);
        assert!(matches!(
            err.current_context(),
            ProvisionError::PartialProvision { .. }
        ));
        // Unit three was never attempted.
        assert!(!gateway
            .calls_of(GatewayOp::Create)
            .iter()
            .any(|target| target.name == "three"));
    }

    #[test(tokio::test)]
    async fn rollback_runs_in_reverse_creation_order() {
        let gateway = MemoryGateway::new();
        gateway.fail_on(GatewayOp::Create, "three");
        let orchestrator = ProvisioningOrchestrator::new(gateway.clone());

        let result = orchestrator.apply(&three_unit_plan()).await;
        assert!(!result.is_success());

        // Deletes: three pre-deletes then two rollbacks.
        let deletes: Vec<_> = gateway
            .calls_of(GatewayOp::Delete)
            .into_iter()
            .map(|target| target.name)
            .collect();
        assert_eq!(deletes, vec!["one", "two", "three", "two", "one"]);
    }

    #[test(tokio::test)]
    async fn first_unit_failure_is_plain_create_error() {
        let gateway = MemoryGateway::new();
        gateway.fail_on(GatewayOp::Create, "one");
        let orchestrator = ProvisioningOrchestrator::new(gateway);

        let result = orchestrator.apply(&three_unit_plan()).await;
        let err = result.error.expect("apply should fail");
        assert_eq!(
            err.current_context().to_string(),
            "Cluster request failed: failed to create Pod ns/one"
        );
        assert!(result.created_units.is_empty());
    }

    #[test(tokio::test)]
    async fn failed_rollback_leaves_orphan_and_reports_both_errors() {
        let gateway = MemoryGateway::new();
        gateway.fail_on(GatewayOp::Create, "three");
        // The pre-delete of "one" succeeds, its rollback delete fails.
        gateway.fail_after(GatewayOp::Delete, "one", 1);
        let orchestrator = ProvisioningOrchestrator::new(gateway.clone());
        let plan = three_unit_plan();

        let result = orchestrator.apply(&plan).await;
        let err = result.error.expect("apply should fail");

        assert_eq!(result.created_units, vec![plan[0].object_ref()]);
        assert!(gateway.contains("ns", &ObjectKind::POD, "one"));
        assert!(!gateway.contains("ns", &ObjectKind::SERVICE, "two"));

        let mut contexts: Vec<String> = err
            .frames()
            .filter_map(|frame| frame.downcast_ref::<ProvisionError>())
            .filter(|context| {
                matches!(
                    context,
                    ProvisionError::PartialProvision { .. } | ProvisionError::RollbackFailed { .. }
                )
            })
            .map(ToString::to_string)
            .collect();
        contexts.sort();
        assert_eq!(
            contexts,
            vec![
                "Failed to create VirtualService.networking.istio.io ns/three",
                "Failed to roll back Pod ns/one",
            ]
        );
    }

    #[test(tokio::test)]
    async fn reapply_after_success_replaces_stale_objects() {
        let gateway = MemoryGateway::new();
        let orchestrator = ProvisioningOrchestrator::new(gateway.clone());
        let plan = three_unit_plan();

        assert!(orchestrator.apply(&plan).await.is_success());
        let again = orchestrator.apply(&plan).await;
        assert!(again.is_success());
        assert_eq!(again.created_units.len(), 3);
        assert_eq!(gateway.object_count(), 3);
    }

    #[test(tokio::test)]
    async fn pre_delete_transport_error_fails_the_unit() {
        let gateway = MemoryGateway::new();
        gateway.fail_on(GatewayOp::Delete, "two");
        let orchestrator = ProvisioningOrchestrator::new(gateway.clone());

        let result = orchestrator.apply(&three_unit_plan()).await;
        assert!(!result.is_success());
        assert!(result.created_units.is_empty());
        assert!(!gateway.contains("ns", &ObjectKind::POD, "one"));
    }

    #[test(tokio::test)]
    async fn keep_created_policy_skips_rollback() {
        let gateway = MemoryGateway::new();
        gateway.fail_on(GatewayOp::Create, "three");
        let orchestrator = ProvisioningOrchestrator::new(gateway.clone());
        let mut plan = three_unit_plan();
        plan[2] = plan[2].clone().with_failure_policy(FailurePolicy::KeepCreated);

        let result = orchestrator.apply(&plan).await;
        assert!(!result.is_success());
        assert_eq!(
            result.created_units,
            vec![plan[0].object_ref(), plan[1].object_ref()]
        );
        assert_eq!(gateway.object_count(), 2);
    }

    #[test(tokio::test)]
    async fn teardown_is_idempotent() {
        let gateway = MemoryGateway::new();
        let orchestrator = ProvisioningOrchestrator::new(gateway.clone());
        let result = orchestrator.apply(&three_unit_plan()).await;

        orchestrator.teardown(&result.created_units).await.unwrap();
        assert_eq!(gateway.object_count(), 0);
        orchestrator.teardown(&result.created_units).await.unwrap();
    }

    #[test(tokio::test)]
    async fn teardown_attempts_every_unit_and_combines_errors() {
        let gateway = MemoryGateway::new();
        let orchestrator = ProvisioningOrchestrator::new(gateway.clone());
        let result = orchestrator.apply(&three_unit_plan()).await;
        gateway.fail_on(GatewayOp::Delete, "one");
        gateway.fail_on(GatewayOp::Delete, "three");

        let err = orchestrator
            .teardown(&result.created_units)
            .await
            .unwrap_err();
        assert!(!gateway.contains("ns", &ObjectKind::SERVICE, "two"));
        let failed_deletes = err
            .frames()
            .filter_map(|frame| frame.downcast_ref::<ProvisionError>())
            .filter(|context| matches!(context, ProvisionError::Transport { .. }))
            .count();
        assert_eq!(failed_deletes, 2);
    }

    #[test(tokio::test)]
    async fn replace_patches_service_in_place() {
        let gateway = MemoryGateway::new();
        let orchestrator = ProvisioningOrchestrator::new(gateway.clone());
        let service = unit(ObjectKind::SERVICE, "svc");
        orchestrator.apply(std::slice::from_ref(&service)).await;

        let mut spec = service.spec.clone();
        spec["spec"]["ports"] = json!([{ "port": 9000 }]);
        orchestrator.replace(&service.object_ref(), &spec).await.unwrap();

        assert_eq!(gateway.calls_of(GatewayOp::Update).len(), 1);
        let stored = gateway.object("ns", &ObjectKind::SERVICE, "svc").unwrap();
        assert_eq!(stored["spec"]["ports"][0]["port"], 9000);
    }

    #[test(tokio::test)]
    async fn replace_recreates_pod() {
        let gateway = MemoryGateway::new();
        let orchestrator = ProvisioningOrchestrator::new(gateway.clone());
        let pod = unit(ObjectKind::POD, "nb");
        orchestrator.apply(std::slice::from_ref(&pod)).await;
        let deletes_before = gateway.calls_of(GatewayOp::Delete).len();

        let mut spec = pod.spec.clone();
        spec["spec"]["containers"] = json!([{ "name": "nb", "resources": { "limits": { "cpu": "4" } } }]);
        orchestrator.replace(&pod.object_ref(), &spec).await.unwrap();

        assert!(gateway.calls_of(GatewayOp::Update).is_empty());
        assert_eq!(gateway.calls_of(GatewayOp::Delete).len(), deletes_before + 1);
        let stored = gateway.object("ns", &ObjectKind::POD, "nb").unwrap();
        assert_eq!(stored["spec"]["containers"][0]["resources"]["limits"]["cpu"], "4");
    }

    #[test(tokio::test)]
    async fn cancelled_apply_keeps_created_units() {
        let gateway = MemoryGateway::new();
        let orchestrator = ProvisioningOrchestrator::new(gateway.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = orchestrator
            .apply_until_cancelled(&three_unit_plan(), &cancel)
            .await;
        let err = result.error.expect("cancelled apply reports an error");
        assert!(matches!(
            err.current_context(),
            ProvisionError::Cancelled { created: 0 }
        ));
        assert!(gateway.calls().is_empty());
    }
}
