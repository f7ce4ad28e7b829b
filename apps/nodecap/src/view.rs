// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Read-only projection of orchestrator state for rendering.
// Author: Lukas Bower

use std::fmt::Write as _;

use nodecap_filter::{ApplicationProtocol, CaptureScenario};
use serde::Serialize;

use crate::lazy::Lazy;
use crate::node::{CompletedCapture, NodeCaptureState, NodeOperation, NodeStatus};
use crate::state::CaptureState;

/// Projection of the aggregate state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorView {
    /// Node list load state label.
    pub nodes_state: &'static str,
    /// Aggregate error.
    pub error_message: Option<String>,
    /// Listed nodes in name order.
    pub nodes: Vec<NodeView>,
    /// Outstanding remote operations.
    pub in_flight: usize,
}

/// Projection of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeView {
    /// Node name.
    pub name: String,
    /// Status.
    pub status: NodeStatus,
    /// Status operations legal from the current status.
    pub actions: Vec<NodeOperation>,
    /// Last error.
    pub error_message: Option<String>,
    /// Active capture name.
    pub current_capture_name: Option<String>,
    /// Scenario selections.
    pub scenario: CaptureScenario,
    /// Capture interface.
    pub interface: Option<String>,
    /// Protocol restriction.
    pub protocol: Option<ApplicationProtocol>,
    /// Filter text a capture would start with.
    pub filter_text: String,
    /// Filter fragments derived from the selections.
    pub fragments: Vec<String>,
    /// Pod list load state label and count.
    pub pods: LoadView,
    /// Interface list.
    pub interfaces: Lazy<Vec<String>>,
    /// Completed captures.
    pub completed_captures: Vec<CompletedCapture>,
}

/// Summary of a lazily loaded list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadView {
    /// Load state label.
    pub state: &'static str,
    /// Item count when loaded.
    pub count: Option<usize>,
}

impl<T> From<&Lazy<Vec<T>>> for LoadView {
    fn from(cell: &Lazy<Vec<T>>) -> Self {
        Self {
            state: cell.label(),
            count: cell.loaded().map(Vec::len),
        }
    }
}

impl NodeView {
    fn project(state: &CaptureState, name: &str, node: &NodeCaptureState) -> Self {
        let filters = node.filters();
        Self {
            name: name.to_owned(),
            status: node.status(),
            actions: node.status().allowed_operations().to_vec(),
            error_message: node.error_message().map(str::to_owned),
            current_capture_name: node.current_capture_name().map(str::to_owned),
            scenario: filters.scenario.clone(),
            interface: filters.interface.clone(),
            protocol: filters.protocol,
            filter_text: filters.filter_text.clone(),
            fragments: filters.fragments().iter().map(ToString::to_string).collect(),
            pods: state
                .cache()
                .filter_pods(name)
                .map(LoadView::from)
                .unwrap_or(LoadView {
                    state: "unlisted",
                    count: None,
                }),
            interfaces: node.capture_interfaces().clone(),
            completed_captures: node.completed_captures().to_vec(),
        }
    }
}

impl OrchestratorView {
    /// Project the aggregate state.
    #[must_use]
    pub fn project(state: &CaptureState, in_flight: usize) -> Self {
        Self {
            nodes_state: state.cache().nodes().label(),
            error_message: state.error_message().map(str::to_owned),
            nodes: state
                .nodes()
                .iter()
                .map(|(name, node)| NodeView::project(state, name, node))
                .collect(),
            in_flight,
        }
    }

    /// Render a compact text table.
    #[must_use]
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "nodes: {} in_flight={}", self.nodes_state, self.in_flight);
        if let Some(error) = &self.error_message {
            let _ = writeln!(out, "error: {error}");
        }
        for node in &self.nodes {
            let _ = writeln!(
                out,
                "{} status={} capture={} pods={} ifaces={}",
                node.name,
                node.status,
                node.current_capture_name.as_deref().unwrap_or("-"),
                node.pods.state,
                node.interfaces.label()
            );
            let filter = if node.filter_text.is_empty() {
                "<all traffic>"
            } else {
                node.filter_text.as_str()
            };
            let _ = writeln!(
                out,
                "  scenario={} iface={} protocol={} filter={filter}",
                node.scenario.kind(),
                node.interface.as_deref().unwrap_or("any"),
                node.protocol
                    .map(|protocol| protocol.to_string())
                    .unwrap_or_else(|| "-".to_owned()),
            );
            if let Some(error) = &node.error_message {
                let _ = writeln!(out, "  error: {error}");
            }
            for capture in &node.completed_captures {
                let _ = writeln!(
                    out,
                    "  capture {} {}KiB {}{}",
                    capture.name,
                    capture.size_in_kb,
                    capture.download_status.as_str(),
                    capture
                        .downloaded_file_path
                        .as_ref()
                        .map(|path| format!(" {}", path.display()))
                        .unwrap_or_default()
                );
            }
        }
        out
    }
}
