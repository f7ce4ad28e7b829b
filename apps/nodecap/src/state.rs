// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Aggregate orchestrator state with intent validation and response folding.
// Author: Lukas Bower

use std::collections::BTreeMap;

use log::{debug, info, warn};
use nodecap_filter::{CaptureScenario, EndpointRole, FilterPod, PodEndpoint, ScenarioKind};
use thiserror::Error;

use crate::cache::{CacheError, ReferenceCache};
use crate::node::{NodeCaptureState, NodeOperation, NodeStatus, TransitionError};
use crate::protocol::{Command, Intent, Response};

/// Rejection of an intent; the state is left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntentError {
    /// Cache lookup failed.
    #[error(transparent)]
    Cache(#[from] CacheError),
    /// Node state machine refused the intent.
    #[error("node {node}: {source}")]
    Transition {
        /// Node name.
        node: String,
        /// Underlying rejection.
        #[source]
        source: TransitionError,
    },
    /// Interface discovery needs a running debug agent.
    #[error("node {node}: interface discovery requires a running debug agent (status {status})")]
    AgentRequired {
        /// Node name.
        node: String,
        /// Status at the time of the request.
        status: NodeStatus,
    },
    /// Pod is not in the loaded pod list.
    #[error("pod '{pod}' is not loaded for node '{node}'")]
    UnknownPod {
        /// Node the pod was looked up on.
        node: String,
        /// Pod name.
        pod: String,
    },
    /// Interface is not in the loaded interface list.
    #[error("interface '{interface}' is not loaded for node '{node}'")]
    UnknownInterface {
        /// Node name.
        node: String,
        /// Interface name.
        interface: String,
    },
    /// Edit applies to a scenario that is not selected.
    #[error("node {node}: {action} requires the {expected} scenario")]
    ScenarioMismatch {
        /// Node name.
        node: String,
        /// Intent label.
        action: &'static str,
        /// Scenario the edit applies to.
        expected: ScenarioKind,
    },
    /// Endpoint pod chosen before its node.
    #[error("node {node}: select the {role:?} endpoint node first")]
    EndpointNodeUnset {
        /// Node name.
        node: String,
        /// Endpoint being edited.
        role: EndpointRole,
    },
}

/// Aggregate state: reference data plus one capture state per listed node.
#[derive(Debug, Clone, Default)]
pub struct CaptureState {
    cache: ReferenceCache,
    nodes: BTreeMap<String, NodeCaptureState>,
    error_message: Option<String>,
}

impl CaptureState {
    /// Create an empty state with nothing loaded.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the reference data cache.
    #[must_use]
    pub fn cache(&self) -> &ReferenceCache {
        &self.cache
    }

    /// Return per-node capture states keyed by node name.
    #[must_use]
    pub fn nodes(&self) -> &BTreeMap<String, NodeCaptureState> {
        &self.nodes
    }

    /// Return one node's capture state.
    #[must_use]
    pub fn node(&self, node: &str) -> Option<&NodeCaptureState> {
        self.nodes.get(node)
    }

    /// Return the aggregate error (node discovery failures).
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Check the capture-name invariant on every node.
    #[must_use]
    pub fn invariants_hold(&self) -> bool {
        self.nodes.values().all(NodeCaptureState::invariant_holds)
    }

    /// Validate an intent and return the commands to dispatch.
    pub fn apply_intent(&mut self, intent: &Intent) -> Result<Vec<Command>, IntentError> {
        let result = self.apply_intent_inner(intent);
        match &result {
            Ok(commands) => debug!(
                "intent applied intent={} node={} commands={}",
                intent.label(),
                intent.node().unwrap_or("-"),
                commands.len()
            ),
            Err(err) => warn!(
                "intent rejected intent={} node={} error={err}",
                intent.label(),
                intent.node().unwrap_or("-")
            ),
        }
        result
    }

    fn entry_mut(&mut self, node: &str) -> Result<&mut NodeCaptureState, IntentError> {
        self.nodes
            .get_mut(node)
            .ok_or_else(|| CacheError::UnknownNode(node.to_owned()).into())
    }

    fn entry(&self, node: &str) -> Result<&NodeCaptureState, IntentError> {
        self.nodes
            .get(node)
            .ok_or_else(|| CacheError::UnknownNode(node.to_owned()).into())
    }

    fn status_operation(
        &mut self,
        node: &str,
        operation: NodeOperation,
    ) -> Result<(), IntentError> {
        self.entry_mut(node)?
            .begin(operation)
            .map(|_| ())
            .map_err(|source| transition(node, source))
    }

    fn require_scenario(
        &self,
        node: &str,
        action: &'static str,
        expected: ScenarioKind,
    ) -> Result<(), IntentError> {
        if self.entry(node)?.filters().scenario.kind() == expected {
            Ok(())
        } else {
            Err(IntentError::ScenarioMismatch {
                node: node.to_owned(),
                action,
                expected,
            })
        }
    }

    fn lookup_pod(
        &self,
        on_node: &str,
        pod: Option<&str>,
    ) -> Result<Option<FilterPod>, IntentError> {
        match pod {
            None => Ok(None),
            Some(name) => self
                .cache
                .find_pod(on_node, name)
                .cloned()
                .map(Some)
                .ok_or_else(|| IntentError::UnknownPod {
                    node: on_node.to_owned(),
                    pod: name.to_owned(),
                }),
        }
    }

    fn edit_scenario(
        &mut self,
        node: &str,
        edit: impl FnOnce(&mut CaptureScenario),
    ) -> Result<(), IntentError> {
        self.entry_mut(node)?
            .edit_filters(|filters| {
                edit(&mut filters.scenario);
                filters.refresh();
            })
            .map_err(|source| transition(node, source))
    }

    fn apply_intent_inner(&mut self, intent: &Intent) -> Result<Vec<Command>, IntentError> {
        match intent {
            Intent::LoadNodes { refresh } => Ok(if self.cache.begin_nodes(*refresh) {
                vec![Command::DiscoverNodes]
            } else {
                Vec::new()
            }),
            Intent::LoadPods { node, refresh } => Ok(if self.cache.begin_pods(node, *refresh)? {
                vec![Command::DiscoverPods { node: node.clone() }]
            } else {
                Vec::new()
            }),
            Intent::LoadInterfaces { node, refresh } => {
                let entry = self.entry_mut(node)?;
                if !entry.status().has_debug_agent() {
                    return Err(IntentError::AgentRequired {
                        node: node.clone(),
                        status: entry.status(),
                    });
                }
                let cell = entry.capture_interfaces_mut();
                if *refresh {
                    cell.discard();
                }
                Ok(if cell.begin_load() {
                    vec![Command::DiscoverInterfaces { node: node.clone() }]
                } else {
                    Vec::new()
                })
            }
            Intent::CheckNode { node } => {
                self.status_operation(node, NodeOperation::Check)?;
                Ok(vec![Command::CheckNode { node: node.clone() }])
            }
            Intent::CreateDebugPod { node } => {
                self.status_operation(node, NodeOperation::CreateDebugPod)?;
                Ok(vec![Command::CreateDebugPod { node: node.clone() }])
            }
            Intent::DeleteDebugPod { node } => {
                self.status_operation(node, NodeOperation::DeleteDebugPod)?;
                Ok(vec![Command::DeleteDebugPod { node: node.clone() }])
            }
            Intent::StartCapture { node, capture } => {
                let entry = self.entry_mut(node)?;
                entry
                    .begin_start(capture)
                    .map_err(|source| transition(node, source))?;
                let filters = entry.filters();
                Ok(vec![Command::StartCapture {
                    node: node.clone(),
                    capture: capture.clone(),
                    interface: filters.interface.clone(),
                    filter: filters.filter_text.clone(),
                }])
            }
            Intent::StopCapture { node } => {
                let entry = self.entry_mut(node)?;
                let capture = entry.current_capture_name().unwrap_or_default().to_owned();
                entry
                    .begin(NodeOperation::StopCapture)
                    .map_err(|source| transition(node, source))?;
                Ok(vec![Command::StopCapture {
                    node: node.clone(),
                    capture,
                }])
            }
            Intent::DownloadCapture {
                node,
                capture,
                destination,
            } => {
                self.entry_mut(node)?
                    .begin_download(capture)
                    .map_err(|source| transition(node, source))?;
                Ok(vec![Command::DownloadCapture {
                    node: node.clone(),
                    capture: capture.clone(),
                    destination: destination.clone(),
                }])
            }
            Intent::SelectScenario { node, scenario } => {
                let kind = *scenario;
                self.edit_scenario(node, |current| {
                    if current.kind() != kind {
                        *current = CaptureScenario::empty(kind);
                    }
                })?;
                Ok(Vec::new())
            }
            Intent::SelectPod { node, pod } => {
                self.require_scenario(node, intent.label(), ScenarioKind::SpecificPod)?;
                let selected = self.lookup_pod(node, pod.as_deref())?;
                self.edit_scenario(node, |current| {
                    if let CaptureScenario::SpecificPod { pod, .. } = current {
                        *pod = selected;
                    }
                })?;
                Ok(Vec::new())
            }
            Intent::SetSpecificDirection { node, direction } => {
                self.require_scenario(node, intent.label(), ScenarioKind::SpecificPod)?;
                let chosen = *direction;
                self.edit_scenario(node, |current| {
                    if let CaptureScenario::SpecificPod { direction, .. } = current {
                        *direction = chosen;
                    }
                })?;
                Ok(Vec::new())
            }
            Intent::SelectEndpointNode {
                node,
                role,
                endpoint_node,
            } => {
                self.require_scenario(node, intent.label(), ScenarioKind::TwoPods)?;
                if let Some(endpoint_node) = endpoint_node {
                    if !self.cache.is_listed(endpoint_node) {
                        return Err(CacheError::UnknownNode(endpoint_node.clone()).into());
                    }
                }
                let role = *role;
                let selected = endpoint_node.clone();
                self.edit_scenario(node, |current| {
                    if let Some(endpoint) = endpoint_mut(current, role) {
                        endpoint.select_node(selected);
                    }
                })?;
                let mut commands = Vec::new();
                if let Some(endpoint_node) = endpoint_node {
                    if self.cache.begin_pods(endpoint_node, false)? {
                        commands.push(Command::DiscoverPods {
                            node: endpoint_node.clone(),
                        });
                    }
                }
                Ok(commands)
            }
            Intent::SelectEndpointPod { node, role, pod } => {
                self.require_scenario(node, intent.label(), ScenarioKind::TwoPods)?;
                let endpoint_node = match &self.entry(node)?.filters().scenario {
                    CaptureScenario::TwoPods {
                        source,
                        destination,
                        ..
                    } => match role {
                        EndpointRole::Source => source.node.clone(),
                        EndpointRole::Destination => destination.node.clone(),
                    },
                    CaptureScenario::SpecificPod { .. } => None,
                };
                let selected = match (endpoint_node, pod) {
                    (_, None) => None,
                    (Some(endpoint_node), Some(_)) => {
                        self.lookup_pod(&endpoint_node, pod.as_deref())?
                    }
                    (None, Some(_)) => {
                        return Err(IntentError::EndpointNodeUnset {
                            node: node.clone(),
                            role: *role,
                        })
                    }
                };
                let role = *role;
                self.edit_scenario(node, |current| {
                    if let Some(endpoint) = endpoint_mut(current, role) {
                        endpoint.pod = selected;
                    }
                })?;
                Ok(Vec::new())
            }
            Intent::SetTwoPodsDirection { node, direction } => {
                self.require_scenario(node, intent.label(), ScenarioKind::TwoPods)?;
                let chosen = *direction;
                self.edit_scenario(node, |current| {
                    if let CaptureScenario::TwoPods { direction, .. } = current {
                        *direction = chosen;
                    }
                })?;
                Ok(Vec::new())
            }
            Intent::SelectInterface { node, interface } => {
                let entry = self.entry_mut(node)?;
                if let Some(name) = interface {
                    let known = entry
                        .capture_interfaces()
                        .loaded()
                        .is_some_and(|interfaces| interfaces.contains(name));
                    if !known {
                        return Err(IntentError::UnknownInterface {
                            node: node.clone(),
                            interface: name.clone(),
                        });
                    }
                }
                entry
                    .edit_filters(|filters| filters.interface = interface.clone())
                    .map_err(|source| transition(node, source))?;
                Ok(Vec::new())
            }
            Intent::SelectProtocol { node, protocol } => {
                self.entry_mut(node)?
                    .edit_filters(|filters| {
                        filters.protocol = *protocol;
                        filters.refresh();
                    })
                    .map_err(|source| transition(node, source))?;
                Ok(Vec::new())
            }
            Intent::SetFilterText { node, text } => {
                self.entry_mut(node)?
                    .edit_filters(|filters| filters.filter_text = text.trim().to_owned())
                    .map_err(|source| transition(node, source))?;
                Ok(Vec::new())
            }
        }
    }

    /// Fold a dispatcher response into the state. Never fails.
    pub fn apply_response(&mut self, response: Response) {
        match response {
            Response::NodesDiscovered { result } => match self.cache.resolve_nodes(result) {
                None => {}
                Some(Err(message)) => {
                    warn!("node discovery failed error={message}");
                    self.error_message = Some(message);
                }
                Some(Ok(delta)) => {
                    for name in &delta.removed {
                        info!("node removed node={name}");
                        self.nodes.remove(name);
                    }
                    self.release_endpoints(&delta.removed);
                    for name in delta.added {
                        info!("node added node={name}");
                        self.nodes.entry(name).or_default();
                    }
                    self.error_message = None;
                }
            },
            Response::PodsDiscovered { node, result } => {
                if let Some(Err(message)) = self.cache.resolve_pods(&node, result) {
                    warn!("pod discovery failed node={node} error={message}");
                    if let Some(entry) = self.nodes.get_mut(&node) {
                        entry.record_error(message);
                    }
                }
            }
            Response::InterfacesDiscovered { node, result } => {
                let Some(entry) = self.nodes.get_mut(&node) else {
                    debug!("interfaces response dropped node={node} reason=unlisted");
                    return;
                };
                if !entry.capture_interfaces().is_loading() {
                    debug!(
                        "interfaces response dropped node={node} state={}",
                        entry.capture_interfaces().label()
                    );
                    return;
                }
                if entry.status() == NodeStatus::Clean {
                    debug!("interfaces response dropped node={node} reason=agent-absent");
                    entry.capture_interfaces_mut().invalidate();
                    return;
                }
                match result {
                    Ok(interfaces) => {
                        debug!("interfaces loaded node={node} count={}", interfaces.len());
                        entry.capture_interfaces_mut().complete(interfaces);
                    }
                    Err(message) => {
                        warn!("interface discovery failed node={node} error={message}");
                        entry.capture_interfaces_mut().invalidate();
                        entry.record_error(message);
                    }
                }
            }
            Response::NodeChecked { node, result } => {
                if let Some(entry) = self.listed_entry(&node) {
                    entry.resolve_check(&node, result);
                }
            }
            Response::DebugPodCreated { node, result } => {
                if let Some(entry) = self.listed_entry(&node) {
                    entry.resolve_create(&node, result);
                }
            }
            Response::DebugPodDeleted { node, result } => {
                if let Some(entry) = self.listed_entry(&node) {
                    entry.resolve_delete(&node, result);
                }
            }
            Response::CaptureStarted {
                node,
                capture,
                result,
            } => {
                if let Some(entry) = self.listed_entry(&node) {
                    entry.resolve_start(&node, &capture, result);
                }
            }
            Response::CaptureStopped {
                node,
                capture,
                result,
            } => {
                if let Some(entry) = self.listed_entry(&node) {
                    entry.resolve_stop(&node, &capture, result);
                }
            }
            Response::CaptureDownloaded {
                node,
                capture,
                result,
            } => {
                if let Some(entry) = self.listed_entry(&node) {
                    entry.resolve_download(&node, &capture, result);
                }
            }
        }
    }

    // Endpoints on unlisted nodes would keep predicates for pods that no longer exist.
    fn release_endpoints(&mut self, removed: &[String]) {
        if removed.is_empty() {
            return;
        }
        for (name, entry) in &mut self.nodes {
            let filters = entry.filters_mut();
            let mut released = false;
            for role in [EndpointRole::Source, EndpointRole::Destination] {
                let Some(endpoint) = endpoint_mut(&mut filters.scenario, role) else {
                    continue;
                };
                if endpoint
                    .node
                    .as_ref()
                    .is_some_and(|endpoint_node| removed.contains(endpoint_node))
                {
                    endpoint.select_node(None);
                    released = true;
                }
            }
            if released {
                filters.refresh();
                info!("endpoint released node={name} reason=endpoint-node-removed");
            }
        }
    }

    fn listed_entry(&mut self, node: &str) -> Option<&mut NodeCaptureState> {
        let entry = self.nodes.get_mut(node);
        if entry.is_none() {
            debug!("response dropped node={node} reason=unlisted");
        }
        entry
    }
}

/// Fold a response into an owned state.
#[must_use]
pub fn update(mut state: CaptureState, response: Response) -> CaptureState {
    state.apply_response(response);
    state
}

fn transition(node: &str, source: TransitionError) -> IntentError {
    IntentError::Transition {
        node: node.to_owned(),
        source,
    }
}

fn endpoint_mut(
    scenario: &mut CaptureScenario,
    role: EndpointRole,
) -> Option<&mut PodEndpoint> {
    match scenario {
        CaptureScenario::TwoPods {
            source,
            destination,
            ..
        } => Some(match role {
            EndpointRole::Source => source,
            EndpointRole::Destination => destination,
        }),
        CaptureScenario::SpecificPod { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::DownloadStatus;
    use crate::protocol::{AgentState, CaptureFile, NodeCheck};
    use nodecap_filter::SpecificPodDirection;

    fn listed(nodes: &[&str]) -> CaptureState {
        let mut state = CaptureState::new();
        assert_eq!(
            state.apply_intent(&Intent::LoadNodes { refresh: false }).unwrap(),
            vec![Command::DiscoverNodes]
        );
        state.apply_response(Response::NodesDiscovered {
            result: Ok(nodes.iter().map(|node| (*node).to_owned()).collect()),
        });
        state
    }

    fn with_pods(mut state: CaptureState, node: &str, pods: &[(&str, &str)]) -> CaptureState {
        state
            .apply_intent(&Intent::LoadPods {
                node: node.to_owned(),
                refresh: false,
            })
            .unwrap();
        state.apply_response(Response::PodsDiscovered {
            node: node.to_owned(),
            result: Ok(pods
                .iter()
                .map(|(name, ip)| FilterPod::new(*name, ip.parse().unwrap()))
                .collect()),
        });
        state
    }

    #[test]
    fn removed_node_releases_remote_endpoints() {
        let state = with_pods(listed(&["n1", "n2"]), "n1", &[("web", "10.244.0.12")]);
        let mut state = with_pods(state, "n2", &[("db", "10.244.1.9")]);
        let node = "n1".to_owned();
        let intents = [
            Intent::SelectScenario {
                node: node.clone(),
                scenario: ScenarioKind::TwoPods,
            },
            Intent::SelectEndpointNode {
                node: node.clone(),
                role: EndpointRole::Source,
                endpoint_node: Some("n1".to_owned()),
            },
            Intent::SelectEndpointPod {
                node: node.clone(),
                role: EndpointRole::Source,
                pod: Some("web".to_owned()),
            },
            Intent::SelectEndpointNode {
                node: node.clone(),
                role: EndpointRole::Destination,
                endpoint_node: Some("n2".to_owned()),
            },
            Intent::SelectEndpointPod {
                node: node.clone(),
                role: EndpointRole::Destination,
                pod: Some("db".to_owned()),
            },
        ];
        for intent in &intents {
            state.apply_intent(intent).unwrap();
        }
        assert_eq!(
            state.node("n1").unwrap().filters().filter_text,
            "host 10.244.0.12 and host 10.244.1.9"
        );

        assert_eq!(
            state.apply_intent(&Intent::LoadNodes { refresh: true }).unwrap(),
            vec![Command::DiscoverNodes]
        );
        state.apply_response(Response::NodesDiscovered {
            result: Ok(vec!["n1".to_owned()]),
        });
        assert!(state.node("n2").is_none());
        let filters = state.node("n1").unwrap().filters();
        let CaptureScenario::TwoPods {
            source,
            destination,
            ..
        } = &filters.scenario
        else {
            panic!("scenario changed: {:?}", filters.scenario);
        };
        assert_eq!(source.node.as_deref(), Some("n1"));
        assert!(source.pod.is_some());
        assert_eq!(destination.node, None);
        assert_eq!(destination.pod, None);
        assert_eq!(filters.filter_text, "host 10.244.0.12");
    }

    #[test]
    fn specific_pod_capture_scenario() {
        let mut state = with_pods(listed(&["n1"]), "n1", &[("api", "10.244.0.7")]);
        let node = "n1".to_owned();
        state
            .apply_intent(&Intent::CheckNode { node: node.clone() })
            .unwrap();
        state.apply_response(Response::NodeChecked {
            node: node.clone(),
            result: Ok(NodeCheck {
                agent: AgentState::Absent,
                captures: Vec::new(),
            }),
        });
        assert_eq!(state.node("n1").unwrap().status(), NodeStatus::Clean);
        state
            .apply_intent(&Intent::CreateDebugPod { node: node.clone() })
            .unwrap();
        state.apply_response(Response::DebugPodCreated {
            node: node.clone(),
            result: Ok(()),
        });
        state
            .apply_intent(&Intent::SelectPod {
                node: node.clone(),
                pod: Some("api".to_owned()),
            })
            .unwrap();
        state
            .apply_intent(&Intent::SetSpecificDirection {
                node: node.clone(),
                direction: SpecificPodDirection::Sent,
            })
            .unwrap();
        let commands = state
            .apply_intent(&Intent::StartCapture {
                node: node.clone(),
                capture: "cap1".to_owned(),
            })
            .unwrap();
        assert_eq!(
            commands,
            vec![Command::StartCapture {
                node: node.clone(),
                capture: "cap1".to_owned(),
                interface: None,
                filter: "src 10.244.0.7".to_owned(),
            }]
        );
        assert_eq!(
            state.node("n1").unwrap().status(),
            NodeStatus::CaptureStarting
        );
        state.apply_response(Response::CaptureStarted {
            node: node.clone(),
            capture: "cap1".to_owned(),
            result: Ok(()),
        });
        let commands = state
            .apply_intent(&Intent::StopCapture { node: node.clone() })
            .unwrap();
        assert_eq!(
            commands,
            vec![Command::StopCapture {
                node: node.clone(),
                capture: "cap1".to_owned(),
            }]
        );
        state.apply_response(Response::CaptureStopped {
            node: node.clone(),
            capture: "cap1".to_owned(),
            result: Ok(CaptureFile {
                name: "cap1".to_owned(),
                size_kb: 42,
            }),
        });
        let entry = state.node("n1").unwrap();
        assert_eq!(entry.status(), NodeStatus::DebugPodRunning);
        assert_eq!(entry.completed_captures().len(), 1);
        assert_eq!(entry.completed_captures()[0].size_in_kb, 42);
        assert_eq!(
            entry.completed_captures()[0].download_status,
            DownloadStatus::Completed
        );
        assert!(state.invariants_hold());
    }

    #[test]
    fn rejected_intents_leave_state_untouched() {
        let mut state = listed(&["n1"]);
        let before = state.node("n1").unwrap().clone();
        let err = state
            .apply_intent(&Intent::SelectPod {
                node: "n1".to_owned(),
                pod: Some("ghost".to_owned()),
            })
            .unwrap_err();
        assert!(matches!(err, IntentError::UnknownPod { .. }));
        let err = state
            .apply_intent(&Intent::SetTwoPodsDirection {
                node: "n1".to_owned(),
                direction: nodecap_filter::TwoPodsDirection::SourceToDestination,
            })
            .unwrap_err();
        assert!(matches!(err, IntentError::ScenarioMismatch { .. }));
        assert!(matches!(
            state.apply_intent(&Intent::LoadInterfaces {
                node: "n1".to_owned(),
                refresh: false,
            }),
            Err(IntentError::AgentRequired { .. })
        ));
        assert!(matches!(
            state.apply_intent(&Intent::CheckNode {
                node: "n9".to_owned()
            }),
            Err(IntentError::Cache(CacheError::UnknownNode(_)))
        ));
        assert_eq!(state.node("n1").unwrap(), &before);
    }

    #[test]
    fn selecting_endpoint_node_requests_its_pods_once() {
        let mut state = listed(&["n1", "n2"]);
        state
            .apply_intent(&Intent::SelectScenario {
                node: "n1".to_owned(),
                scenario: ScenarioKind::TwoPods,
            })
            .unwrap();
        let select = Intent::SelectEndpointNode {
            node: "n1".to_owned(),
            role: EndpointRole::Destination,
            endpoint_node: Some("n2".to_owned()),
        };
        assert_eq!(
            state.apply_intent(&select).unwrap(),
            vec![Command::DiscoverPods {
                node: "n2".to_owned()
            }]
        );
        assert!(state.apply_intent(&select).unwrap().is_empty());
        state.apply_response(Response::PodsDiscovered {
            node: "n2".to_owned(),
            result: Ok(vec![FilterPod::new("db", "10.1.2.3".parse().unwrap())]),
        });
        state
            .apply_intent(&Intent::SelectEndpointPod {
                node: "n1".to_owned(),
                role: EndpointRole::Destination,
                pod: Some("db".to_owned()),
            })
            .unwrap();
        assert_eq!(state.node("n1").unwrap().filters().filter_text, "host 10.1.2.3");
    }

    #[test]
    fn responses_for_unlisted_nodes_are_dropped() {
        let mut state = listed(&["n1"]);
        let before = state.node("n1").unwrap().clone();
        state.apply_response(Response::DebugPodCreated {
            node: "gone".to_owned(),
            result: Ok(()),
        });
        assert_eq!(state.nodes().len(), 1);
        assert_eq!(state.node("n1").unwrap(), &before);
    }

    #[test]
    fn interfaces_landing_after_agent_deletion_are_discarded() {
        let mut state = listed(&["n1"]);
        let node = "n1".to_owned();
        state.apply_intent(&Intent::CheckNode { node: node.clone() }).unwrap();
        state.apply_response(Response::NodeChecked {
            node: node.clone(),
            result: Ok(NodeCheck {
                agent: AgentState::Running,
                captures: Vec::new(),
            }),
        });
        let load = Intent::LoadInterfaces {
            node: node.clone(),
            refresh: false,
        };
        assert_eq!(
            state.apply_intent(&load).unwrap(),
            vec![Command::DiscoverInterfaces { node: node.clone() }]
        );
        state.apply_intent(&Intent::DeleteDebugPod { node: node.clone() }).unwrap();
        state.apply_response(Response::DebugPodDeleted {
            node: node.clone(),
            result: Ok(()),
        });
        assert!(state.node("n1").unwrap().capture_interfaces().is_loading());
        assert!(matches!(
            state.apply_intent(&load),
            Err(IntentError::AgentRequired { .. })
        ));
        state.apply_response(Response::InterfacesDiscovered {
            node: node.clone(),
            result: Ok(vec!["eth0".to_owned()]),
        });
        assert!(state.node("n1").unwrap().capture_interfaces().is_not_loaded());
    }

    #[test]
    fn node_discovery_failure_is_aggregate_error() {
        let mut state = CaptureState::new();
        state.apply_intent(&Intent::LoadNodes { refresh: false }).unwrap();
        let state = update(
            state,
            Response::NodesDiscovered {
                result: Err("Unauthorized".to_owned()),
            },
        );
        assert_eq!(state.error_message(), Some("Unauthorized"));
        assert!(state.cache().nodes().is_not_loaded());
    }
}
