// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Message contract between the UI, the orchestrator, and the dispatcher.
// Author: Lukas Bower

//! Intents flow from the UI into the orchestrator, commands from the
//! orchestrator to the dispatcher, and responses back. Every message is a
//! flat JSON record tagged by `type` and carries the node it addresses.
//! There are no correlation identifiers: the per-node state machine admits at
//! most one status operation per node, which makes routing by node name and
//! capture name unambiguous.

use std::path::PathBuf;

use nodecap_filter::{
    ApplicationProtocol, EndpointRole, FilterPod, ScenarioKind, SpecificPodDirection,
    TwoPodsDirection,
};
use serde::{Deserialize, Serialize};

/// Operator request addressed to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Intent {
    /// Load the node list, or reload it when `refresh` is set.
    LoadNodes {
        /// Invalidate a loaded list first.
        #[serde(default)]
        refresh: bool,
    },
    /// Load candidate pods for a node.
    LoadPods {
        /// Node name.
        node: String,
        /// Invalidate a loaded list first.
        #[serde(default)]
        refresh: bool,
    },
    /// Load capture interfaces for a node.
    LoadInterfaces {
        /// Node name.
        node: String,
        /// Invalidate a loaded list first.
        #[serde(default)]
        refresh: bool,
    },
    /// Inspect a node for its debug agent and capture.
    CheckNode {
        /// Node name.
        node: String,
    },
    /// Create the node's debug agent.
    CreateDebugPod {
        /// Node name.
        node: String,
    },
    /// Delete the node's debug agent.
    DeleteDebugPod {
        /// Node name.
        node: String,
    },
    /// Start a named capture with the node's current filters.
    StartCapture {
        /// Node name.
        node: String,
        /// Capture name.
        capture: String,
    },
    /// Stop the node's running capture.
    StopCapture {
        /// Node name.
        node: String,
    },
    /// Download a completed capture.
    DownloadCapture {
        /// Node name.
        node: String,
        /// Capture name.
        capture: String,
        /// Explicit destination; the sink chooses when absent.
        #[serde(default)]
        destination: Option<PathBuf>,
    },
    /// Switch the capture scenario, discarding the other scenario's selections.
    SelectScenario {
        /// Node name.
        node: String,
        /// Scenario to switch to.
        scenario: ScenarioKind,
    },
    /// Select the pod for the specific-pod scenario.
    SelectPod {
        /// Node name.
        node: String,
        /// Pod name from the node's pod list, or none to clear.
        #[serde(default)]
        pod: Option<String>,
    },
    /// Set the specific-pod packet direction.
    SetSpecificDirection {
        /// Node name.
        node: String,
        /// Packet direction.
        direction: SpecificPodDirection,
    },
    /// Select the node an endpoint pod is chosen from.
    SelectEndpointNode {
        /// Node name.
        node: String,
        /// Endpoint being edited.
        role: EndpointRole,
        /// Endpoint node, or none to clear.
        #[serde(default)]
        endpoint_node: Option<String>,
    },
    /// Select an endpoint pod from the endpoint node's pod list.
    SelectEndpointPod {
        /// Node name.
        node: String,
        /// Endpoint being edited.
        role: EndpointRole,
        /// Pod name, or none to clear.
        #[serde(default)]
        pod: Option<String>,
    },
    /// Set the two-pods packet direction.
    SetTwoPodsDirection {
        /// Node name.
        node: String,
        /// Packet direction.
        direction: TwoPodsDirection,
    },
    /// Select the capture interface.
    SelectInterface {
        /// Node name.
        node: String,
        /// Interface name, or none for all interfaces.
        #[serde(default)]
        interface: Option<String>,
    },
    /// Select the application protocol restriction.
    SelectProtocol {
        /// Node name.
        node: String,
        /// Protocol, or none to clear.
        #[serde(default)]
        protocol: Option<ApplicationProtocol>,
    },
    /// Overwrite the generated filter text.
    SetFilterText {
        /// Node name.
        node: String,
        /// Raw filter expression.
        text: String,
    },
}

impl Intent {
    /// Return the node the intent addresses, if any.
    #[must_use]
    pub fn node(&self) -> Option<&str> {
        match self {
            Self::LoadNodes { .. } => None,
            Self::LoadPods { node, .. }
            | Self::LoadInterfaces { node, .. }
            | Self::CheckNode { node }
            | Self::CreateDebugPod { node }
            | Self::DeleteDebugPod { node }
            | Self::StartCapture { node, .. }
            | Self::StopCapture { node }
            | Self::DownloadCapture { node, .. }
            | Self::SelectScenario { node, .. }
            | Self::SelectPod { node, .. }
            | Self::SetSpecificDirection { node, .. }
            | Self::SelectEndpointNode { node, .. }
            | Self::SelectEndpointPod { node, .. }
            | Self::SetTwoPodsDirection { node, .. }
            | Self::SelectInterface { node, .. }
            | Self::SelectProtocol { node, .. }
            | Self::SetFilterText { node, .. } => Some(node),
        }
    }

    /// Return a short label for logging.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::LoadNodes { .. } => "load-nodes",
            Self::LoadPods { .. } => "load-pods",
            Self::LoadInterfaces { .. } => "load-interfaces",
            Self::CheckNode { .. } => "check-node",
            Self::CreateDebugPod { .. } => "create-debug-pod",
            Self::DeleteDebugPod { .. } => "delete-debug-pod",
            Self::StartCapture { .. } => "start-capture",
            Self::StopCapture { .. } => "stop-capture",
            Self::DownloadCapture { .. } => "download-capture",
            Self::SelectScenario { .. } => "select-scenario",
            Self::SelectPod { .. } => "select-pod",
            Self::SetSpecificDirection { .. } => "set-specific-direction",
            Self::SelectEndpointNode { .. } => "select-endpoint-node",
            Self::SelectEndpointPod { .. } => "select-endpoint-pod",
            Self::SetTwoPodsDirection { .. } => "set-two-pods-direction",
            Self::SelectInterface { .. } => "select-interface",
            Self::SelectProtocol { .. } => "select-protocol",
            Self::SetFilterText { .. } => "set-filter-text",
        }
    }
}

/// Remote operation handed to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Command {
    /// List cluster nodes.
    DiscoverNodes,
    /// List pods scheduled on a node.
    DiscoverPods {
        /// Node name.
        node: String,
    },
    /// List network interfaces visible to the node's debug agent.
    DiscoverInterfaces {
        /// Node name.
        node: String,
    },
    /// Inspect a node's debug agent and capture.
    CheckNode {
        /// Node name.
        node: String,
    },
    /// Create and await the node's debug agent.
    CreateDebugPod {
        /// Node name.
        node: String,
    },
    /// Delete the node's debug agent.
    DeleteDebugPod {
        /// Node name.
        node: String,
    },
    /// Start a capture with frozen parameters.
    StartCapture {
        /// Node name.
        node: String,
        /// Capture name.
        capture: String,
        /// Capture interface; all interfaces when absent.
        interface: Option<String>,
        /// Filter expression; empty captures everything.
        filter: String,
    },
    /// Stop a running capture.
    StopCapture {
        /// Node name.
        node: String,
        /// Capture name.
        capture: String,
    },
    /// Copy a capture file out of the agent.
    DownloadCapture {
        /// Node name.
        node: String,
        /// Capture name.
        capture: String,
        /// Explicit destination.
        destination: Option<PathBuf>,
    },
}

/// Key identifying one outstanding remote operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PendingKey {
    /// Node list load.
    Nodes,
    /// Pod list load for a node.
    Pods(String),
    /// Interface list load for a node.
    Interfaces(String),
    /// Status operation on a node.
    Status(String),
    /// Capture download.
    Download {
        /// Node name.
        node: String,
        /// Capture name.
        capture: String,
    },
}

impl Command {
    /// Return the node the command addresses, if any.
    #[must_use]
    pub fn node(&self) -> Option<&str> {
        match self {
            Self::DiscoverNodes => None,
            Self::DiscoverPods { node }
            | Self::DiscoverInterfaces { node }
            | Self::CheckNode { node }
            | Self::CreateDebugPod { node }
            | Self::DeleteDebugPod { node }
            | Self::StartCapture { node, .. }
            | Self::StopCapture { node, .. }
            | Self::DownloadCapture { node, .. } => Some(node),
        }
    }

    /// Return a short label for logging.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::DiscoverNodes => "discover-nodes",
            Self::DiscoverPods { .. } => "discover-pods",
            Self::DiscoverInterfaces { .. } => "discover-interfaces",
            Self::CheckNode { .. } => "check-node",
            Self::CreateDebugPod { .. } => "create-debug-pod",
            Self::DeleteDebugPod { .. } => "delete-debug-pod",
            Self::StartCapture { .. } => "start-capture",
            Self::StopCapture { .. } => "stop-capture",
            Self::DownloadCapture { .. } => "download-capture",
        }
    }

    /// Return the outstanding-operation key.
    #[must_use]
    pub fn key(&self) -> PendingKey {
        match self {
            Self::DiscoverNodes => PendingKey::Nodes,
            Self::DiscoverPods { node } => PendingKey::Pods(node.clone()),
            Self::DiscoverInterfaces { node } => PendingKey::Interfaces(node.clone()),
            Self::CheckNode { node }
            | Self::CreateDebugPod { node }
            | Self::DeleteDebugPod { node }
            | Self::StartCapture { node, .. }
            | Self::StopCapture { node, .. } => PendingKey::Status(node.clone()),
            Self::DownloadCapture { node, capture, .. } => PendingKey::Download {
                node: node.clone(),
                capture: capture.clone(),
            },
        }
    }
}

/// Debug agent state observed by a node check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum AgentState {
    /// No debug agent pod exists.
    Absent,
    /// Agent running without a capture.
    Running,
    /// Agent running a capture.
    Capturing {
        /// Running capture name.
        capture: String,
    },
    /// Agent pod exists but its container has exited.
    Stopped {
        /// Terminal pod phase.
        phase: String,
    },
}

/// Capture file present on a debug agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureFile {
    /// Capture name.
    pub name: String,
    /// File size in KiB, rounded up.
    pub size_kb: u64,
}

/// Outcome of a node check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCheck {
    /// Observed agent state.
    pub agent: AgentState,
    /// Capture files found on the agent.
    pub captures: Vec<CaptureFile>,
}

/// Typed result of one command; failures carry operator-facing text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Response {
    /// Node list.
    NodesDiscovered {
        /// Node names or failure text.
        result: Result<Vec<String>, String>,
    },
    /// Pod list for a node.
    PodsDiscovered {
        /// Node name.
        node: String,
        /// Pods or failure text.
        result: Result<Vec<FilterPod>, String>,
    },
    /// Interface list for a node.
    InterfacesDiscovered {
        /// Node name.
        node: String,
        /// Interfaces or failure text.
        result: Result<Vec<String>, String>,
    },
    /// Node check outcome.
    NodeChecked {
        /// Node name.
        node: String,
        /// Check outcome or failure text.
        result: Result<NodeCheck, String>,
    },
    /// Debug agent creation outcome.
    DebugPodCreated {
        /// Node name.
        node: String,
        /// Failure text on error.
        result: Result<(), String>,
    },
    /// Debug agent deletion outcome.
    DebugPodDeleted {
        /// Node name.
        node: String,
        /// Failure text on error.
        result: Result<(), String>,
    },
    /// Capture start outcome.
    CaptureStarted {
        /// Node name.
        node: String,
        /// Capture name.
        capture: String,
        /// Failure text on error.
        result: Result<(), String>,
    },
    /// Capture stop outcome.
    CaptureStopped {
        /// Node name.
        node: String,
        /// Capture name.
        capture: String,
        /// Final capture file or failure text.
        result: Result<CaptureFile, String>,
    },
    /// Capture download outcome.
    CaptureDownloaded {
        /// Node name.
        node: String,
        /// Capture name.
        capture: String,
        /// Local path or failure text.
        result: Result<PathBuf, String>,
    },
}

impl Response {
    /// Build the failure response matching a command.
    pub fn failed(command: &Command, message: impl Into<String>) -> Self {
        let message = message.into();
        match command.clone() {
            Command::DiscoverNodes => Self::NodesDiscovered {
                result: Err(message),
            },
            Command::DiscoverPods { node } => Self::PodsDiscovered {
                node,
                result: Err(message),
            },
            Command::DiscoverInterfaces { node } => Self::InterfacesDiscovered {
                node,
                result: Err(message),
            },
            Command::CheckNode { node } => Self::NodeChecked {
                node,
                result: Err(message),
            },
            Command::CreateDebugPod { node } => Self::DebugPodCreated {
                node,
                result: Err(message),
            },
            Command::DeleteDebugPod { node } => Self::DebugPodDeleted {
                node,
                result: Err(message),
            },
            Command::StartCapture { node, capture, .. } => Self::CaptureStarted {
                node,
                capture,
                result: Err(message),
            },
            Command::StopCapture { node, capture } => Self::CaptureStopped {
                node,
                capture,
                result: Err(message),
            },
            Command::DownloadCapture { node, capture, .. } => Self::CaptureDownloaded {
                node,
                capture,
                result: Err(message),
            },
        }
    }

    /// Return the outstanding-operation key this response settles.
    #[must_use]
    pub fn key(&self) -> PendingKey {
        match self {
            Self::NodesDiscovered { .. } => PendingKey::Nodes,
            Self::PodsDiscovered { node, .. } => PendingKey::Pods(node.clone()),
            Self::InterfacesDiscovered { node, .. } => PendingKey::Interfaces(node.clone()),
            Self::NodeChecked { node, .. }
            | Self::DebugPodCreated { node, .. }
            | Self::DebugPodDeleted { node, .. }
            | Self::CaptureStarted { node, .. }
            | Self::CaptureStopped { node, .. } => PendingKey::Status(node.clone()),
            Self::CaptureDownloaded { node, capture, .. } => PendingKey::Download {
                node: node.clone(),
                capture: capture.clone(),
            },
        }
    }

    /// Return true when the response reports success.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        match self {
            Self::NodesDiscovered { result } => result.is_ok(),
            Self::PodsDiscovered { result, .. } => result.is_ok(),
            Self::InterfacesDiscovered { result, .. } => result.is_ok(),
            Self::NodeChecked { result, .. } => result.is_ok(),
            Self::DebugPodCreated { result, .. } | Self::DebugPodDeleted { result, .. } => {
                result.is_ok()
            }
            Self::CaptureStarted { result, .. } => result.is_ok(),
            Self::CaptureStopped { result, .. } => result.is_ok(),
            Self::CaptureDownloaded { result, .. } => result.is_ok(),
        }
    }
}
