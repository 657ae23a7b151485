//! Node placement webhook
//!
//! Binds a Pod to a node from the capacity table in its `scheduledOrder`
//! annotation. Capacity already consumed by sibling Pods (those matching the
//! `workloadSelector` annotation) is subtracted first, then the Pod goes to
//! the first node, in lexicographic order, with a free slot. When no node has
//! room the Pod is left for the cluster scheduler.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{extract::State, Json};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::DynamicObject,
    core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview},
};
use tracing::{debug, error, info, warn};

use super::{decode_pod, patch::patch_response, WebhookError, WebhookState};
use crate::store::{LabelSelector, PodStore};

/// Annotation holding the `key=value` selector of sibling Pods
pub const WORKLOAD_SELECTOR_ANNOTATION: &str = "workloadSelector";

/// Annotation holding the `node=capacity,...` table
pub const SCHEDULED_ORDER_ANNOTATION: &str = "scheduledOrder";

/// Remaining capacity per candidate node
///
/// Iterates in lexicographic node order, so placement is reproducible.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CandidateNodes {
    remaining: BTreeMap<String, i64>,
}

impl CandidateNodes {
    /// Parse a `node=capacity,node=capacity` table
    ///
    /// Malformed entries are skipped and reported. Blank entries (e.g. a
    /// trailing comma) are ignored. A repeated node keeps its last capacity.
    pub fn parse(order: &str) -> (Self, Vec<Degradation>) {
        let mut nodes = Self::default();
        let mut degradations = Vec::new();

        for entry in order.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let parsed = entry.split_once('=').and_then(|(node, capacity)| {
                let node = node.trim();
                let capacity = capacity.trim().parse::<i64>().ok()?;
                (!node.is_empty()).then(|| (node.to_string(), capacity))
            });
            match parsed {
                Some((node, capacity)) => {
                    nodes.remaining.insert(node, capacity);
                }
                None => degradations.push(Degradation::MalformedOrderEntry(entry.to_string())),
            }
        }

        (nodes, degradations)
    }

    /// Consume one slot for every sibling already bound to a candidate node
    pub fn subtract_placed(&mut self, siblings: &[Pod]) {
        let placed = siblings
            .iter()
            .filter_map(|pod| pod.spec.as_ref()?.node_name.as_deref())
            .filter(|node| !node.is_empty());
        for node in placed {
            if let Some(remaining) = self.remaining.get_mut(node) {
                *remaining -= 1;
            }
        }
    }

    /// Remaining capacity of a node, `None` if it is not a candidate
    pub fn remaining(&self, node: &str) -> Option<i64> {
        self.remaining.get(node).copied()
    }

    /// First node with a free slot
    pub fn first_available(&self) -> Option<&str> {
        self.remaining
            .iter()
            .find(|(_, remaining)| **remaining > 0)
            .map(|(node, _)| node.as_str())
    }

    /// Number of candidate nodes
    pub fn len(&self) -> usize {
        self.remaining.len()
    }

    /// Returns true if there are no candidate nodes
    pub fn is_empty(&self) -> bool {
        self.remaining.is_empty()
    }
}

/// A problem placement tolerated instead of rejecting the Pod
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Degradation {
    /// A `scheduledOrder` entry was not `node=integer`
    MalformedOrderEntry(String),
    /// `workloadSelector` was missing or not `key=value`; siblings were not listed
    MalformedSelector(String),
    /// Listing siblings failed; placement assumed none were placed
    SiblingListFailed(String),
}

/// What placement did with the Pod
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlacementDecision {
    /// `spec.nodeName` was set to this node
    Assigned(String),
    /// The Pod was already bound and was left alone
    AlreadyAssigned(String),
    /// No candidate had a free slot
    Unplaced,
}

/// Placement decision plus every degradation taken on the way
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlacementOutcome {
    /// The decision
    pub decision: PlacementDecision,
    /// Tolerated problems, empty on the clean path
    pub degradations: Vec<Degradation>,
}

impl PlacementOutcome {
    /// Returns true if any part of the input was ignored or unavailable
    pub fn is_degraded(&self) -> bool {
        !self.degradations.is_empty()
    }
}

/// Assign `spec.nodeName` from the Pod's placement annotations
///
/// Never fails: problems with the annotations or the sibling lookup are
/// recorded in the outcome and placement continues with what is left.
pub async fn resolve_placement(pods: &dyn PodStore, pod: &mut Pod) -> PlacementOutcome {
    if let Some(node) = assigned_node(pod) {
        return PlacementOutcome {
            decision: PlacementDecision::AlreadyAssigned(node.to_string()),
            degradations: Vec::new(),
        };
    }

    let annotations = pod.metadata.annotations.clone().unwrap_or_default();
    let order = annotations
        .get(SCHEDULED_ORDER_ANNOTATION)
        .map(String::as_str)
        .unwrap_or_default();
    let (mut nodes, mut degradations) = CandidateNodes::parse(order);

    let raw_selector = annotations
        .get(WORKLOAD_SELECTOR_ANNOTATION)
        .map(String::as_str)
        .unwrap_or_default();
    match raw_selector.parse::<LabelSelector>() {
        Ok(selector) => match pods.list_pods(&selector).await {
            Ok(siblings) => nodes.subtract_placed(&siblings),
            Err(e) => {
                warn!(selector = %selector, error = %e, "Failed to list sibling pods, assuming none are placed");
                degradations.push(Degradation::SiblingListFailed(e.to_string()));
            }
        },
        Err(_) => {
            debug!(selector = %raw_selector, "No usable workload selector, skipping sibling lookup");
            degradations.push(Degradation::MalformedSelector(raw_selector.to_string()));
        }
    }

    let decision = match nodes.first_available() {
        Some(node) => {
            let node = node.to_string();
            pod.spec.get_or_insert_with(Default::default).node_name = Some(node.clone());
            PlacementDecision::Assigned(node)
        }
        None => PlacementDecision::Unplaced,
    };

    PlacementOutcome {
        decision,
        degradations,
    }
}

fn assigned_node(pod: &Pod) -> Option<&str> {
    pod.spec
        .as_ref()?
        .node_name
        .as_deref()
        .filter(|node| !node.is_empty())
}

/// Returns true if the Pod asks for placement
pub fn wants_placement(pod: &Pod) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(SCHEDULED_ORDER_ANNOTATION))
}

/// Handle mutating admission review for Pod placement
pub async fn mutate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    let response = match mutate_pod(&state, &req).await {
        Ok(response) => response,
        Err(e) => {
            error!(uid = %req.uid, error = %e, "Rejecting pod placement");
            e.into_admission_response(&req)
        }
    };
    Json(response.into_review())
}

/// Process a single placement request
pub async fn mutate_pod(
    state: &WebhookState,
    request: &AdmissionRequest<DynamicObject>,
) -> Result<AdmissionResponse, WebhookError> {
    let uid = &request.uid;

    let Some((original, mut pod)) = decode_pod(request)? else {
        debug!(uid = %uid, "No pod object in request, allowing unchanged");
        return Ok(AdmissionResponse::from(request));
    };

    if !wants_placement(&pod) {
        debug!(uid = %uid, pod = ?pod.metadata.name, "No scheduledOrder annotation, allowing unchanged");
        return Ok(AdmissionResponse::from(request));
    }

    let outcome = resolve_placement(state.pods.as_ref(), &mut pod).await;
    if outcome.is_degraded() {
        warn!(uid = %uid, degradations = ?outcome.degradations, "Placement ran degraded");
    }

    match &outcome.decision {
        PlacementDecision::Assigned(node) => {
            info!(uid = %uid, pod = ?pod.metadata.name, node = %node, "Injecting node assignment");
            patch_response(request, &original, &pod)
        }
        PlacementDecision::AlreadyAssigned(node) => {
            debug!(uid = %uid, node = %node, "Pod already bound, allowing unchanged");
            Ok(AdmissionResponse::from(request))
        }
        PlacementDecision::Unplaced => {
            info!(uid = %uid, pod = ?pod.metadata.name, "No candidate node has capacity, leaving pod to the scheduler");
            Ok(AdmissionResponse::from(request))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MockPodStore;
    use crate::webhook::test_support::pod_request;
    use serde_json::json;

    fn pod_with(selector: Option<&str>, order: Option<&str>) -> Pod {
        let mut annotations = BTreeMap::new();
        if let Some(s) = selector {
            annotations.insert(WORKLOAD_SELECTOR_ANNOTATION.to_string(), s.to_string());
        }
        if let Some(o) = order {
            annotations.insert(SCHEDULED_ORDER_ANNOTATION.to_string(), o.to_string());
        }
        let mut pod = Pod::default();
        pod.metadata.name = Some("worker-2".to_string());
        pod.metadata.annotations = Some(annotations);
        pod
    }

    fn placed_on(node: &str) -> Pod {
        let mut pod = Pod::default();
        pod.spec = Some(k8s_openapi::api::core::v1::PodSpec {
            node_name: Some(node.to_string()),
            ..Default::default()
        });
        pod
    }

    fn siblings(nodes: &'static [&'static str]) -> MockPodStore {
        let mut store = MockPodStore::new();
        store
            .expect_list_pods()
            .returning(move |_| Ok(nodes.iter().map(|n| placed_on(n)).collect()));
        store
    }

    // =========================================================================
    // CandidateNodes
    // =========================================================================

    #[test]
    fn test_parse_order_table() {
        let (nodes, degradations) = CandidateNodes::parse("nodeA=2,nodeB=1");
        assert!(degradations.is_empty());
        assert_eq!(nodes.remaining("nodeA"), Some(2));
        assert_eq!(nodes.remaining("nodeB"), Some(1));
        assert_eq!(nodes.len(), 2);
    }

    #[test]
    fn test_parse_skips_malformed_entries() {
        let (nodes, degradations) = CandidateNodes::parse("nodeA=two, nodeB ,=3,nodeC=1");
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes.remaining("nodeC"), Some(1));
        assert_eq!(
            degradations,
            vec![
                Degradation::MalformedOrderEntry("nodeA=two".to_string()),
                Degradation::MalformedOrderEntry("nodeB".to_string()),
                Degradation::MalformedOrderEntry("=3".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_ignores_blank_entries_and_whitespace() {
        let (nodes, degradations) = CandidateNodes::parse(" nodeA = 2 ,, nodeB=1,");
        assert!(degradations.is_empty());
        assert_eq!(nodes.remaining("nodeA"), Some(2));
        assert_eq!(nodes.remaining("nodeB"), Some(1));
    }

    #[test]
    fn test_parse_empty_order() {
        let (nodes, degradations) = CandidateNodes::parse("");
        assert!(nodes.is_empty());
        assert!(degradations.is_empty());
    }

    #[test]
    fn test_repeated_node_keeps_last_capacity() {
        let (nodes, _) = CandidateNodes::parse("nodeA=1,nodeA=4");
        assert_eq!(nodes.remaining("nodeA"), Some(4));
    }

    #[test]
    fn test_subtract_ignores_unbound_and_unknown_nodes() {
        let (mut nodes, _) = CandidateNodes::parse("nodeA=2");
        nodes.subtract_placed(&[placed_on("nodeA"), placed_on(""), Pod::default(), placed_on("nodeZ")]);
        assert_eq!(nodes.remaining("nodeA"), Some(1));
        assert_eq!(nodes.remaining("nodeZ"), None);
    }

    #[test]
    fn test_remaining_can_go_negative() {
        let (mut nodes, _) = CandidateNodes::parse("nodeA=1");
        nodes.subtract_placed(&[placed_on("nodeA"), placed_on("nodeA")]);
        assert_eq!(nodes.remaining("nodeA"), Some(-1));
        assert_eq!(nodes.first_available(), None);
    }

    #[test]
    fn test_first_available_is_lexicographic() {
        let (nodes, _) = CandidateNodes::parse("nodeC=1,nodeA=1,nodeB=1");
        assert_eq!(nodes.first_available(), Some("nodeA"));
    }

    // =========================================================================
    // Story Tests
    // =========================================================================

    /// Story: Siblings have filled nodeA, so the new pod goes to nodeB
    #[tokio::test]
    async fn story_full_node_is_skipped() {
        let store = siblings(&["nodeA", "nodeA"]);
        let mut pod = pod_with(Some("app=x"), Some("nodeA=2,nodeB=1"));

        let outcome = resolve_placement(&store, &mut pod).await;

        assert_eq!(outcome.decision, PlacementDecision::Assigned("nodeB".into()));
        assert!(!outcome.is_degraded());
        assert_eq!(pod.spec.unwrap().node_name.as_deref(), Some("nodeB"));
    }

    /// Story: With no siblings placed, the lexicographically first node wins
    #[tokio::test]
    async fn story_first_node_when_nothing_placed() {
        let store = siblings(&[]);
        let mut pod = pod_with(Some("app=x"), Some("nodeB=1,nodeA=2"));

        let outcome = resolve_placement(&store, &mut pod).await;

        assert_eq!(outcome.decision, PlacementDecision::Assigned("nodeA".into()));
    }

    /// Story: Every node is full, so the pod is left for the default scheduler
    #[tokio::test]
    async fn story_all_nodes_full_leaves_pod_unbound() {
        let store = siblings(&["nodeA", "nodeA", "nodeB"]);
        let mut pod = pod_with(Some("app=x"), Some("nodeA=2,nodeB=1"));

        let outcome = resolve_placement(&store, &mut pod).await;

        assert_eq!(outcome.decision, PlacementDecision::Unplaced);
        assert!(pod.spec.and_then(|s| s.node_name).is_none());
    }

    /// Story: The sibling lookup is down; placement uses the declared capacities
    #[tokio::test]
    async fn story_sibling_list_failure_degrades() {
        let mut store = MockPodStore::new();
        store
            .expect_list_pods()
            .returning(|_| Err(crate::Error::validation("connection refused")));
        let mut pod = pod_with(Some("app=x"), Some("nodeA=2,nodeB=1"));

        let outcome = resolve_placement(&store, &mut pod).await;

        assert_eq!(outcome.decision, PlacementDecision::Assigned("nodeA".into()));
        assert!(matches!(
            outcome.degradations.as_slice(),
            [Degradation::SiblingListFailed(msg)] if msg.contains("connection refused")
        ));
    }

    /// Story: Without a usable selector, siblings are not listed at all
    #[tokio::test]
    async fn story_missing_selector_skips_lookup() {
        let mut store = MockPodStore::new();
        store.expect_list_pods().never();
        let mut pod = pod_with(None, Some("nodeA=1"));

        let outcome = resolve_placement(&store, &mut pod).await;

        assert_eq!(outcome.decision, PlacementDecision::Assigned("nodeA".into()));
        assert_eq!(
            outcome.degradations,
            vec![Degradation::MalformedSelector(String::new())]
        );
    }

    /// Story: The store is queried with the selector from the annotation
    #[tokio::test]
    async fn story_lists_siblings_by_selector() {
        let mut store = MockPodStore::new();
        store
            .expect_list_pods()
            .withf(|selector| *selector == LabelSelector::new("app", "x"))
            .times(1)
            .returning(|_| Ok(vec![]));
        let mut pod = pod_with(Some("app=x"), Some("nodeA=1"));

        resolve_placement(&store, &mut pod).await;
    }

    /// Story: A bound pod is never moved
    #[tokio::test]
    async fn story_bound_pod_keeps_its_node() {
        let mut store = MockPodStore::new();
        store.expect_list_pods().never();
        let mut pod = pod_with(Some("app=x"), Some("nodeA=2"));
        pod.spec = Some(k8s_openapi::api::core::v1::PodSpec {
            node_name: Some("nodeZ".to_string()),
            ..Default::default()
        });

        let outcome = resolve_placement(&store, &mut pod).await;

        assert_eq!(outcome.decision, PlacementDecision::AlreadyAssigned("nodeZ".into()));
        assert_eq!(pod.spec.unwrap().node_name.as_deref(), Some("nodeZ"));
    }

    /// Story: Placement is reproducible for the same sibling state
    #[tokio::test]
    async fn story_same_state_same_choice() {
        let store = siblings(&["nodeA"]);
        let mut first = pod_with(Some("app=x"), Some("nodeA=1,nodeB=3,nodeC=3"));
        let mut second = first.clone();

        let a = resolve_placement(&store, &mut first).await;
        let b = resolve_placement(&store, &mut second).await;

        assert_eq!(a, b);
        assert_eq!(a.decision, PlacementDecision::Assigned("nodeB".into()));
    }

    /// Story: Whatever node is chosen still had a free slot
    #[tokio::test]
    async fn story_chosen_node_had_capacity() {
        for placed in [&[][..], &["nodeA"][..], &["nodeA", "nodeB"][..], &["nodeB", "nodeB"][..]] {
            let placed: Vec<Pod> = placed.iter().map(|n| placed_on(n)).collect();
            let mut store = MockPodStore::new();
            let returned = placed.clone();
            store
                .expect_list_pods()
                .returning(move |_| Ok(returned.clone()));
            let mut pod = pod_with(Some("app=x"), Some("nodeA=1,nodeB=2"));

            let outcome = resolve_placement(&store, &mut pod).await;

            let (mut nodes, _) = CandidateNodes::parse("nodeA=1,nodeB=2");
            nodes.subtract_placed(&placed);
            match outcome.decision {
                PlacementDecision::Assigned(node) => {
                    assert!(nodes.remaining(&node).unwrap() > 0)
                }
                PlacementDecision::Unplaced => assert!(nodes.first_available().is_none()),
                other => panic!("unexpected decision {other:?}"),
            }
        }
    }

    // =========================================================================
    // Admission flow
    // =========================================================================

    fn state_with(pods: MockPodStore) -> WebhookState {
        WebhookState::new(
            Arc::new(pods),
            Arc::new(crate::store::MockSidecarStore::new()),
            Arc::new(crate::template::MockTemplateSource::new()),
            crate::template::TemplateEngine::new().unwrap(),
            crate::retry::RetryConfig::none(),
        )
    }

    #[tokio::test]
    async fn test_pod_without_order_is_allowed_unchanged() {
        let mut pods = MockPodStore::new();
        pods.expect_list_pods().never();
        let request = pod_request(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "web"},
            "spec": {"containers": [{"name": "app", "image": "busybox"}]}
        }));

        let response = mutate_pod(&state_with(pods), &request).await.unwrap();

        assert!(response.allowed);
        assert!(response.patch.is_none());
    }

    #[tokio::test]
    async fn test_assigned_pod_gets_node_name_patch() {
        let request = pod_request(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": "worker-2",
                "annotations": {"workloadSelector": "app=x", "scheduledOrder": "nodeA=2,nodeB=1"}
            },
            "spec": {"containers": [{"name": "app", "image": "busybox"}]}
        }));

        let response = mutate_pod(&state_with(siblings(&["nodeA", "nodeA"])), &request)
            .await
            .unwrap();

        assert!(response.allowed);
        let ops: serde_json::Value = serde_json::from_slice(&response.patch.unwrap()).unwrap();
        assert_eq!(
            ops,
            json!([{"op": "add", "path": "/spec/nodeName", "value": "nodeB"}])
        );
    }

    #[tokio::test]
    async fn test_unplaced_pod_has_no_patch() {
        let request = pod_request(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": "worker-2",
                "annotations": {"workloadSelector": "app=x", "scheduledOrder": "nodeA=1"}
            },
            "spec": {"containers": [{"name": "app", "image": "busybox"}]}
        }));

        let response = mutate_pod(&state_with(siblings(&["nodeA"])), &request)
            .await
            .unwrap();

        assert!(response.allowed);
        assert!(response.patch.is_none());
    }
}
