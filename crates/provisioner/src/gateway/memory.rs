//! In-process cluster gateway for tests and dry runs.
//!
//! Objects live in a map keyed by (kind, namespace, name). Faults can be
//! injected per operation and object name to exercise partial-failure and
//! rollback paths.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use api_types::NodeView;
use api_types::PodFootprint;
use error_stack::Report;
use serde_json::Value;

use super::manifest_name;
use super::ClusterGateway;
use super::GatewayError;
use super::ObjectKind;
use super::ObjectRef;

/// First port handed out to NodePort services that do not pin one.
const NODE_PORT_BASE: u16 = 30000;

/// Gateway operation, used for fault injection and the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayOp {
    Create,
    Get,
    Delete,
    Update,
}

/// One recorded gateway call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    Object { op: GatewayOp, target: ObjectRef },
    ListNodes,
    ListPods { node_name: String },
}

type ObjectKey = (ObjectKind, String, String);

#[derive(Default)]
struct State {
    objects: HashMap<ObjectKey, Value>,
    nodes: Vec<NodeView>,
    pods: Vec<PodFootprint>,
    /// Calls still allowed to succeed before the fault fires
    faults: HashMap<(GatewayOp, String), usize>,
    fail_node_listing: bool,
    fail_pod_listing: bool,
    next_node_port: u16,
    calls: Vec<GatewayCall>,
}

/// [`ClusterGateway`] holding all state in memory. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryGateway {
    state: Arc<Mutex<State>>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_node(&self, node: NodeView) {
        self.state().nodes.push(node);
    }

    pub fn add_pod(&self, pod: PodFootprint) {
        self.state().pods.push(pod);
    }

    /// Make every `op` against an object called `name` fail with a transport error.
    pub fn fail_on(&self, op: GatewayOp, name: impl Into<String>) {
        self.fail_after(op, name, 0);
    }

    /// Let `successes` calls of `op` against `name` through, then fail every later one.
    pub fn fail_after(&self, op: GatewayOp, name: impl Into<String>, successes: usize) {
        self.state().faults.insert((op, name.into()), successes);
    }

    pub fn clear_fault(&self, op: GatewayOp, name: &str) {
        self.state().faults.remove(&(op, name.to_string()));
    }

    pub fn clear_faults(&self) {
        self.state().faults.clear();
    }

    pub fn set_fail_node_listing(&self, enabled: bool) {
        self.state().fail_node_listing = enabled;
    }

    pub fn set_fail_pod_listing(&self, enabled: bool) {
        self.state().fail_pod_listing = enabled;
    }

    /// Store an object directly, bypassing faults and the call log.
    pub fn insert_object(&self, namespace: &str, kind: &ObjectKind, object: Value) {
        let name = manifest_name(&object).unwrap_or_default().to_string();
        self.state()
            .objects
            .insert((kind.clone(), namespace.to_string(), name), object);
    }

    /// Replace the `status` field of a stored object, as a controller would.
    pub fn set_status(&self, namespace: &str, kind: &ObjectKind, name: &str, status: Value) -> bool {
        let mut state = self.state();
        let key = (kind.clone(), namespace.to_string(), name.to_string());
        match state.objects.get_mut(&key).and_then(Value::as_object_mut) {
            Some(object) => {
                object.insert("status".to_string(), status);
                true
            }
            None => false,
        }
    }

    pub fn object(&self, namespace: &str, kind: &ObjectKind, name: &str) -> Option<Value> {
        let key = (kind.clone(), namespace.to_string(), name.to_string());
        self.state().objects.get(&key).cloned()
    }

    pub fn contains(&self, namespace: &str, kind: &ObjectKind, name: &str) -> bool {
        self.object(namespace, kind, name).is_some()
    }

    pub fn object_count(&self) -> usize {
        self.state().objects.len()
    }

    /// Every gateway call made so far, in order.
    pub fn calls(&self) -> Vec<GatewayCall> {
        self.state().calls.clone()
    }

    /// Object calls of a single operation, in order.
    pub fn calls_of(&self, op: GatewayOp) -> Vec<ObjectRef> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                GatewayCall::Object { op: call_op, target } if *call_op == op => {
                    Some(target.clone())
                }
                _ => None,
            })
            .collect()
    }

    /// Log the call and return the injected fault for it, if any.
    fn record(
        state: &mut State,
        op: GatewayOp,
        target: &ObjectRef,
    ) -> Result<(), Report<GatewayError>> {
        state.calls.push(GatewayCall::Object {
            op,
            target: target.clone(),
        });
        match state.faults.get_mut(&(op, target.name.clone())) {
            Some(0) => Err(Report::new(GatewayError::Transport {
                message: format!("injected {op:?} failure for {target}"),
            })),
            Some(remaining) => {
                *remaining -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// Give each NodePort service port without a pinned `nodePort` the next free one.
fn assign_node_ports(state: &mut State, object: &mut Value) {
    let is_node_port = object.pointer("/spec/type").and_then(Value::as_str) == Some("NodePort");
    if !is_node_port {
        return;
    }
    let Some(ports) = object
        .pointer_mut("/spec/ports")
        .and_then(Value::as_array_mut)
    else {
        return;
    };
    for port in ports.iter_mut().filter_map(Value::as_object_mut) {
        if !port.contains_key("nodePort") {
            let assigned = NODE_PORT_BASE + state.next_node_port;
            state.next_node_port += 1;
            port.insert("nodePort".to_string(), Value::from(assigned));
        }
    }
}

#[async_trait::async_trait]
impl ClusterGateway for MemoryGateway {
    async fn create_object(
        &self,
        namespace: &str,
        kind: &ObjectKind,
        spec: &Value,
    ) -> Result<ObjectRef, Report<GatewayError>> {
        let name = manifest_name(spec).ok_or_else(|| {
            Report::new(GatewayError::InvalidObject {
                message: format!("{kind} manifest has no metadata.name"),
            })
        })?;
        let target = ObjectRef::new(kind.clone(), namespace, name);

        let mut state = self.state();
        Self::record(&mut state, GatewayOp::Create, &target)?;

        let key = (kind.clone(), target.namespace.clone(), target.name.clone());
        if state.objects.contains_key(&key) {
            return Err(Report::new(GatewayError::already_exists(
                kind, namespace, name,
            )));
        }

        let mut object = spec.clone();
        if let Some(metadata) = object
            .get_mut("metadata")
            .and_then(Value::as_object_mut)
        {
            metadata.insert("namespace".to_string(), Value::from(namespace));
        }
        assign_node_ports(&mut state, &mut object);
        state.objects.insert(key, object);
        Ok(target)
    }

    async fn get_object(
        &self,
        namespace: &str,
        kind: &ObjectKind,
        name: &str,
    ) -> Result<Value, Report<GatewayError>> {
        let target = ObjectRef::new(kind.clone(), namespace, name);
        let mut state = self.state();
        Self::record(&mut state, GatewayOp::Get, &target)?;

        let key = (kind.clone(), target.namespace, target.name);
        state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Report::new(GatewayError::not_found(kind, namespace, name)))
    }

    async fn delete_object(
        &self,
        namespace: &str,
        kind: &ObjectKind,
        name: &str,
    ) -> Result<(), Report<GatewayError>> {
        let target = ObjectRef::new(kind.clone(), namespace, name);
        let mut state = self.state();
        Self::record(&mut state, GatewayOp::Delete, &target)?;

        let key = (kind.clone(), target.namespace, target.name);
        match state.objects.remove(&key) {
            Some(_) => Ok(()),
            None => Err(Report::new(GatewayError::not_found(kind, namespace, name))),
        }
    }

    async fn update_object(
        &self,
        namespace: &str,
        kind: &ObjectKind,
        name: &str,
        spec: &Value,
    ) -> Result<ObjectRef, Report<GatewayError>> {
        let target = ObjectRef::new(kind.clone(), namespace, name);
        let mut state = self.state();
        Self::record(&mut state, GatewayOp::Update, &target)?;

        let key = (kind.clone(), target.namespace.clone(), target.name.clone());
        let Some(existing) = state.objects.get(&key) else {
            return Err(Report::new(GatewayError::not_found(kind, namespace, name)));
        };

        // Desired state is replaced; the controller-owned status survives.
        let mut object = spec.clone();
        if let (Some(status), Some(fields)) = (existing.get("status").cloned(), object.as_object_mut()) {
            fields.entry("status").or_insert(status);
        }
        assign_node_ports(&mut state, &mut object);
        state.objects.insert(key, object);
        Ok(target)
    }

    async fn list_nodes(&self) -> Result<Vec<NodeView>, Report<GatewayError>> {
        let mut state = self.state();
        state.calls.push(GatewayCall::ListNodes);
        if state.fail_node_listing {
            return Err(Report::new(GatewayError::Transport {
                message: "injected node listing failure".to_string(),
            }));
        }
        Ok(state.nodes.clone())
    }

    async fn list_pods_on_node(
        &self,
        node_name: &str,
    ) -> Result<Vec<PodFootprint>, Report<GatewayError>> {
        let mut state = self.state();
        state.calls.push(GatewayCall::ListPods {
            node_name: node_name.to_string(),
        });
        if state.fail_pod_listing {
            return Err(Report::new(GatewayError::Transport {
                message: format!("injected pod listing failure on {node_name}"),
            }));
        }
        Ok(state
            .pods
            .iter()
            .filter(|pod| pod.node_name == node_name)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    fn service(name: &str) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": name},
            "spec": {"type": "NodePort", "ports": [{"port": 8000}, {"port": 8001, "nodePort": 31999}]}
        })
    }

    #[test(tokio::test)]
    async fn create_get_delete_round() {
        let gateway = MemoryGateway::new();
        let created = gateway
            .create_object("serving", &ObjectKind::SERVICE, &service("triton"))
            .await
            .unwrap();
        assert_eq!(created.to_string(), "Service serving/triton");

        let stored = gateway
            .get_object("serving", &ObjectKind::SERVICE, "triton")
            .await
            .unwrap();
        assert_eq!(stored["metadata"]["namespace"], "serving");
        assert_eq!(stored["spec"]["ports"][0]["nodePort"], 30000);
        assert_eq!(stored["spec"]["ports"][1]["nodePort"], 31999);

        gateway
            .delete_object("serving", &ObjectKind::SERVICE, "triton")
            .await
            .unwrap();
        let err = gateway
            .delete_object("serving", &ObjectKind::SERVICE, "triton")
            .await
            .unwrap_err();
        assert!(err.current_context().is_not_found());
    }

    #[test(tokio::test)]
    async fn duplicate_create_is_already_exists() {
        let gateway = MemoryGateway::new();
        gateway
            .create_object("ns", &ObjectKind::SERVICE, &service("a"))
            .await
            .unwrap();
        let err = gateway
            .create_object("ns", &ObjectKind::SERVICE, &service("a"))
            .await
            .unwrap_err();
        assert!(matches!(
            err.current_context(),
            GatewayError::AlreadyExists { .. }
        ));
    }

    #[test(tokio::test)]
    async fn injected_fault_is_logged_and_not_applied() {
        let gateway = MemoryGateway::new();
        gateway.fail_on(GatewayOp::Create, "a");
        let err = gateway
            .create_object("ns", &ObjectKind::SERVICE, &service("a"))
            .await
            .unwrap_err();
        assert!(!err.current_context().is_not_found());
        assert!(!gateway.contains("ns", &ObjectKind::SERVICE, "a"));
        assert_eq!(
            gateway.calls_of(GatewayOp::Create),
            vec![ObjectRef::new(ObjectKind::SERVICE, "ns", "a")]
        );
    }

    #[test(tokio::test)]
    async fn delayed_fault_fires_after_successes() {
        let gateway = MemoryGateway::new();
        gateway.insert_object("ns", &ObjectKind::SERVICE, service("a"));
        gateway.fail_after(GatewayOp::Get, "a", 1);

        assert!(gateway.get_object("ns", &ObjectKind::SERVICE, "a").await.is_ok());
        assert!(gateway.get_object("ns", &ObjectKind::SERVICE, "a").await.is_err());
        assert!(gateway.get_object("ns", &ObjectKind::SERVICE, "a").await.is_err());
    }

    #[test(tokio::test)]
    async fn update_keeps_status() {
        let gateway = MemoryGateway::new();
        gateway.insert_object("ns", &ObjectKind::SERVICE, service("a"));
        assert!(gateway.set_status("ns", &ObjectKind::SERVICE, "a", json!({"phase": "Active"})));

        let mut updated = service("a");
        updated["spec"]["ports"] = json!([{"port": 9000, "nodePort": 32000}]);
        gateway
            .update_object("ns", &ObjectKind::SERVICE, "a", &updated)
            .await
            .unwrap();

        let stored = gateway.object("ns", &ObjectKind::SERVICE, "a").unwrap();
        assert_eq!(stored["spec"]["ports"][0]["port"], 9000);
        assert_eq!(stored["status"]["phase"], "Active");
    }

    #[test(tokio::test)]
    async fn pods_are_filtered_by_node() {
        let gateway = MemoryGateway::new();
        gateway.add_pod(PodFootprint {
            node_name: "a".to_string(),
            requested: api_types::ResourceQuantity::new(100, 0, 0),
        });
        gateway.add_pod(PodFootprint {
            node_name: "b".to_string(),
            requested: api_types::ResourceQuantity::new(200, 0, 0),
        });
        let pods = gateway.list_pods_on_node("b").await.unwrap();
        assert_eq!(pods.len(), 1);
        assert_eq!(pods[0].requested.cpu_milli_cores, 200);

        gateway.set_fail_pod_listing(true);
        assert!(gateway.list_pods_on_node("b").await.is_err());
    }
}
