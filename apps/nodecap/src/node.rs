// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Per-node capture state machine folding intents and remote outcomes.
// Author: Lukas Bower

use std::fmt;
use std::path::PathBuf;

use log::{info, warn};
use nodecap_filter::{render_filter, ApplicationProtocol, CaptureScenario, FilterFragment};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lazy::Lazy;
use crate::protocol::{AgentState, CaptureFile, NodeCheck};

/// Maximum length of a capture name.
pub const MAX_CAPTURE_NAME_LEN: usize = 64;

/// Capture lifecycle status for one node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    /// Not yet checked, or the last operation failed.
    #[default]
    Unknown,
    /// Node check outstanding.
    Checking,
    /// No debug agent on the node.
    Clean,
    /// Debug agent creation outstanding.
    CreatingDebugPod,
    /// Debug agent deletion outstanding.
    DeletingDebugPod,
    /// Debug agent running, no capture in progress.
    DebugPodRunning,
    /// Capture start outstanding.
    CaptureStarting,
    /// Capture in progress.
    CaptureRunning,
    /// Capture stop outstanding.
    CaptureStopping,
}

impl NodeStatus {
    /// Render the canonical status label, identical to the serialized form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Checking => "CHECKING",
            Self::Clean => "CLEAN",
            Self::CreatingDebugPod => "CREATING_DEBUG_POD",
            Self::DeletingDebugPod => "DELETING_DEBUG_POD",
            Self::DebugPodRunning => "DEBUG_POD_RUNNING",
            Self::CaptureStarting => "CAPTURE_STARTING",
            Self::CaptureRunning => "CAPTURE_RUNNING",
            Self::CaptureStopping => "CAPTURE_STOPPING",
        }
    }

    /// Return true while a remote status operation is outstanding.
    #[must_use]
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Checking
                | Self::CreatingDebugPod
                | Self::DeletingDebugPod
                | Self::CaptureStarting
                | Self::CaptureStopping
        )
    }

    /// Return true for the statuses that carry a current capture name.
    #[must_use]
    pub fn has_capture(self) -> bool {
        matches!(
            self,
            Self::CaptureStarting | Self::CaptureRunning | Self::CaptureStopping
        )
    }

    /// Return true when a debug agent is known to be running and idle or capturing.
    #[must_use]
    pub fn has_debug_agent(self) -> bool {
        matches!(self, Self::DebugPodRunning | Self::CaptureRunning)
    }

    /// Return true when capture filters may be edited.
    #[must_use]
    pub fn filters_editable(self) -> bool {
        !self.has_capture()
    }

    /// Return the status operations legal from this status.
    #[must_use]
    pub fn allowed_operations(self) -> &'static [NodeOperation] {
        match self {
            Self::Unknown => &[NodeOperation::Check],
            Self::Clean => &[NodeOperation::CreateDebugPod],
            Self::DebugPodRunning => {
                &[NodeOperation::DeleteDebugPod, NodeOperation::StartCapture]
            }
            Self::CaptureRunning => &[NodeOperation::StopCapture],
            Self::Checking
            | Self::CreatingDebugPod
            | Self::DeletingDebugPod
            | Self::CaptureStarting
            | Self::CaptureStopping => &[],
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remote operations that move a node's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeOperation {
    /// Inspect the node for a debug agent and running capture.
    Check,
    /// Create the debug agent.
    CreateDebugPod,
    /// Delete the debug agent.
    DeleteDebugPod,
    /// Start a capture inside the debug agent.
    StartCapture,
    /// Stop the running capture.
    StopCapture,
}

impl NodeOperation {
    /// Render the operation label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Check => "check",
            Self::CreateDebugPod => "create-debug-pod",
            Self::DeleteDebugPod => "delete-debug-pod",
            Self::StartCapture => "start-capture",
            Self::StopCapture => "stop-capture",
        }
    }

    fn pending_status(self) -> NodeStatus {
        match self {
            Self::Check => NodeStatus::Checking,
            Self::CreateDebugPod => NodeStatus::CreatingDebugPod,
            Self::DeleteDebugPod => NodeStatus::DeletingDebugPod,
            Self::StartCapture => NodeStatus::CaptureStarting,
            Self::StopCapture => NodeStatus::CaptureStopping,
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for NodeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Download progress of a completed capture.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DownloadStatus {
    /// Capture file exists on the agent only.
    #[default]
    Completed,
    /// Download outstanding.
    Downloading,
    /// Capture file persisted locally.
    Downloaded,
}

impl DownloadStatus {
    /// Render the canonical label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "COMPLETED",
            Self::Downloading => "DOWNLOADING",
            Self::Downloaded => "DOWNLOADED",
        }
    }
}

/// A finished capture recorded against a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedCapture {
    /// Capture name.
    pub name: String,
    /// Capture file size in KiB.
    pub size_in_kb: u64,
    /// Download sub-status.
    pub download_status: DownloadStatus,
    /// Last local path the capture was persisted to.
    pub downloaded_file_path: Option<PathBuf>,
}

impl CompletedCapture {
    fn from_file(file: CaptureFile) -> Self {
        Self {
            name: file.name,
            size_in_kb: file.size_kb,
            download_status: DownloadStatus::Completed,
            downloaded_file_path: None,
        }
    }
}

/// Scenario selection and derived capture parameters for a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureFilters {
    /// Selected scenario and its endpoint choices.
    pub scenario: CaptureScenario,
    /// Capture interface; `None` captures on all interfaces.
    pub interface: Option<String>,
    /// Application-layer protocol restriction.
    pub protocol: Option<ApplicationProtocol>,
    /// Filter text dispatched with the capture.
    pub filter_text: String,
}

impl CaptureFilters {
    /// Regenerate the filter text from the scenario and protocol.
    pub fn refresh(&mut self) {
        self.filter_text = render_filter(&self.scenario, self.protocol.as_ref());
    }

    /// Return the fragments derived from the current selections.
    #[must_use]
    pub fn fragments(&self) -> Vec<FilterFragment> {
        nodecap_filter::build_fragments(&self.scenario, self.protocol.as_ref())
    }
}

/// Rejection of a node-level intent; the node is left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    /// Operation is not legal from the current status.
    #[error("{operation} is not allowed while node is {status}")]
    NotAllowed {
        /// Requested operation.
        operation: NodeOperation,
        /// Status at the time of the request.
        status: NodeStatus,
    },
    /// Capture filters are frozen while a capture is active.
    #[error("capture filters are frozen while node is {0}")]
    FiltersFrozen(NodeStatus),
    /// Capture start requested without a name.
    #[error("starting a capture requires a capture name")]
    CaptureNameRequired,
    /// Capture name violates naming rules.
    #[error("invalid capture name '{0}' (1-64 characters of A-Z a-z 0-9 . _ -)")]
    InvalidCaptureName(String),
    /// Capture name is already recorded on the node.
    #[error("capture '{0}' already exists on this node")]
    DuplicateCapture(String),
    /// Capture name is not recorded on the node.
    #[error("unknown capture '{0}'")]
    UnknownCapture(String),
    /// Capture download is already outstanding.
    #[error("capture '{0}' is already downloading")]
    DownloadInProgress(String),
}

/// Transition record for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeTransition {
    /// Prior status.
    pub from: NodeStatus,
    /// New status.
    pub to: NodeStatus,
    /// Reason label.
    pub reason: &'static str,
}

/// Format a transition log line.
pub fn format_transition_log(node: &str, transition: &NodeTransition) -> String {
    format!(
        "capture transition node={} old={} new={} reason={}",
        node,
        transition.from.as_str(),
        transition.to.as_str(),
        transition.reason
    )
}

/// Validate a capture name for use in remote file paths.
pub fn validate_capture_name(name: &str) -> Result<(), TransitionError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_CAPTURE_NAME_LEN
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'));
    if valid && name != "." && name != ".." {
        Ok(())
    } else {
        Err(TransitionError::InvalidCaptureName(name.to_owned()))
    }
}

/// Capture lifecycle state for one node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCaptureState {
    status: NodeStatus,
    error_message: Option<String>,
    current_capture_name: Option<String>,
    current_capture_filters: CaptureFilters,
    completed_captures: Vec<CompletedCapture>,
    capture_interfaces: Lazy<Vec<String>>,
}

impl NodeCaptureState {
    /// Create a node state in `Unknown`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the current status.
    #[must_use]
    pub fn status(&self) -> NodeStatus {
        self.status
    }

    /// Return the last recorded error.
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Return the active capture name.
    #[must_use]
    pub fn current_capture_name(&self) -> Option<&str> {
        self.current_capture_name.as_deref()
    }

    /// Return the capture filters.
    #[must_use]
    pub fn filters(&self) -> &CaptureFilters {
        &self.current_capture_filters
    }

    pub(crate) fn filters_mut(&mut self) -> &mut CaptureFilters {
        &mut self.current_capture_filters
    }

    /// Return completed captures in completion order.
    #[must_use]
    pub fn completed_captures(&self) -> &[CompletedCapture] {
        &self.completed_captures
    }

    /// Return the capture interface cache cell.
    #[must_use]
    pub fn capture_interfaces(&self) -> &Lazy<Vec<String>> {
        &self.capture_interfaces
    }

    pub(crate) fn capture_interfaces_mut(&mut self) -> &mut Lazy<Vec<String>> {
        &mut self.capture_interfaces
    }

    /// Overwrite the node error message.
    pub fn record_error(&mut self, message: impl Into<String>) {
        self.error_message = Some(message.into());
    }

    /// Apply an edit to the capture filters when they are not frozen.
    pub fn edit_filters<R>(
        &mut self,
        edit: impl FnOnce(&mut CaptureFilters) -> R,
    ) -> Result<R, TransitionError> {
        if !self.status.filters_editable() {
            return Err(TransitionError::FiltersFrozen(self.status));
        }
        Ok(edit(&mut self.current_capture_filters))
    }

    fn ensure_allowed(&self, operation: NodeOperation) -> Result<(), TransitionError> {
        if self.status.allowed_operations().contains(&operation) {
            Ok(())
        } else {
            Err(TransitionError::NotAllowed {
                operation,
                status: self.status,
            })
        }
    }

    fn set_status(&mut self, to: NodeStatus, reason: &'static str) -> NodeTransition {
        let transition = NodeTransition {
            from: self.status,
            to,
            reason,
        };
        self.status = to;
        if !to.has_capture() {
            self.current_capture_name = None;
        }
        transition
    }

    /// Enter the pending status for a check, create, delete, or stop.
    pub fn begin(&mut self, operation: NodeOperation) -> Result<NodeTransition, TransitionError> {
        if operation == NodeOperation::StartCapture {
            return Err(TransitionError::CaptureNameRequired);
        }
        self.ensure_allowed(operation)?;
        Ok(self.set_status(operation.pending_status(), operation.as_str()))
    }

    /// Enter `CaptureStarting` with the capture name set.
    pub fn begin_start(&mut self, capture: &str) -> Result<NodeTransition, TransitionError> {
        self.ensure_allowed(NodeOperation::StartCapture)?;
        validate_capture_name(capture)?;
        if self.find_capture(capture).is_some() {
            return Err(TransitionError::DuplicateCapture(capture.to_owned()));
        }
        self.current_capture_name = Some(capture.to_owned());
        Ok(self.set_status(NodeStatus::CaptureStarting, "start-capture"))
    }

    /// Mark a completed capture as downloading.
    pub fn begin_download(&mut self, capture: &str) -> Result<(), TransitionError> {
        let entry = self
            .completed_captures
            .iter_mut()
            .find(|entry| entry.name == capture)
            .ok_or_else(|| TransitionError::UnknownCapture(capture.to_owned()))?;
        if entry.download_status == DownloadStatus::Downloading {
            return Err(TransitionError::DownloadInProgress(capture.to_owned()));
        }
        entry.download_status = DownloadStatus::Downloading;
        Ok(())
    }

    fn find_capture(&self, capture: &str) -> Option<&CompletedCapture> {
        self.completed_captures
            .iter()
            .find(|entry| entry.name == capture)
    }

    fn unexpected(&mut self, node: &str, response: &str) -> Option<NodeTransition> {
        let message = format!(
            "unexpected {response} response while node is {}",
            self.status
        );
        warn!(
            "capture protocol node={node} status={} response={response} dropped",
            self.status
        );
        self.record_error(message);
        None
    }

    fn finish(
        &mut self,
        node: &str,
        to: NodeStatus,
        reason: &'static str,
        error: Option<String>,
    ) -> Option<NodeTransition> {
        let transition = self.set_status(to, reason);
        match error {
            Some(message) => {
                warn!("capture operation failed node={node} reason={reason} error={message}");
                self.error_message = Some(message);
            }
            None => self.error_message = None,
        }
        info!("{}", format_transition_log(node, &transition));
        Some(transition)
    }

    /// Fold a node check outcome.
    pub fn resolve_check(
        &mut self,
        node: &str,
        result: Result<NodeCheck, String>,
    ) -> Option<NodeTransition> {
        if self.status != NodeStatus::Checking {
            return self.unexpected(node, "check");
        }
        let check = match result {
            Ok(check) => check,
            Err(message) => {
                return self.finish(node, NodeStatus::Unknown, "check-failed", Some(message))
            }
        };
        let running = match &check.agent {
            AgentState::Capturing { capture } => Some(capture.clone()),
            AgentState::Absent | AgentState::Running | AgentState::Stopped { .. } => None,
        };
        for file in check.captures {
            let is_running = running.as_deref() == Some(file.name.as_str());
            if is_running || self.find_capture(&file.name).is_some() {
                continue;
            }
            self.completed_captures.push(CompletedCapture::from_file(file));
        }
        match check.agent {
            AgentState::Absent => {
                self.capture_interfaces.discard();
                self.finish(node, NodeStatus::Clean, "check-absent", None)
            }
            AgentState::Running => {
                self.finish(node, NodeStatus::DebugPodRunning, "check-running", None)
            }
            // The exited pod still occupies the agent name; only deletion clears it.
            AgentState::Stopped { phase } => {
                let message = format!("debug agent exited (phase {phase}); delete it to recover");
                self.finish(node, NodeStatus::DebugPodRunning, "check-stopped", Some(message))
            }
            AgentState::Capturing { capture } => match validate_capture_name(&capture) {
                Ok(()) => {
                    self.current_capture_name = Some(capture);
                    self.finish(node, NodeStatus::CaptureRunning, "check-capturing", None)
                }
                Err(err) => {
                    let message = err.to_string();
                    self.finish(node, NodeStatus::Unknown, "check-malformed", Some(message))
                }
            },
        }
    }

    /// Fold a debug agent creation outcome.
    pub fn resolve_create(
        &mut self,
        node: &str,
        result: Result<(), String>,
    ) -> Option<NodeTransition> {
        if self.status != NodeStatus::CreatingDebugPod {
            return self.unexpected(node, "create-debug-pod");
        }
        match result {
            Ok(()) => {
                self.finish(node, NodeStatus::DebugPodRunning, "debug-pod-created", None)
            }
            Err(message) => self.finish(node, NodeStatus::Unknown, "create-failed", Some(message)),
        }
    }

    /// Fold a debug agent deletion outcome.
    pub fn resolve_delete(
        &mut self,
        node: &str,
        result: Result<(), String>,
    ) -> Option<NodeTransition> {
        if self.status != NodeStatus::DeletingDebugPod {
            return self.unexpected(node, "delete-debug-pod");
        }
        match result {
            Ok(()) => {
                self.capture_interfaces.discard();
                if self
                    .current_capture_filters
                    .interface
                    .take()
                    .is_some()
                {
                    self.current_capture_filters.refresh();
                }
                self.finish(node, NodeStatus::Clean, "debug-pod-deleted", None)
            }
            Err(message) => self.finish(node, NodeStatus::Unknown, "delete-failed", Some(message)),
        }
    }

    /// Fold a capture start outcome.
    pub fn resolve_start(
        &mut self,
        node: &str,
        capture: &str,
        result: Result<(), String>,
    ) -> Option<NodeTransition> {
        if self.status != NodeStatus::CaptureStarting {
            return self.unexpected(node, "start-capture");
        }
        if self.current_capture_name.as_deref() != Some(capture) {
            return self.unexpected(node, "start-capture");
        }
        match result {
            Ok(()) => self.finish(node, NodeStatus::CaptureRunning, "capture-started", None),
            Err(message) => {
                self.finish(node, NodeStatus::DebugPodRunning, "start-failed", Some(message))
            }
        }
    }

    /// Fold a capture stop outcome; success records the finished capture.
    pub fn resolve_stop(
        &mut self,
        node: &str,
        capture: &str,
        result: Result<CaptureFile, String>,
    ) -> Option<NodeTransition> {
        if self.status != NodeStatus::CaptureStopping
            || self.current_capture_name.as_deref() != Some(capture)
        {
            return self.unexpected(node, "stop-capture");
        }
        match result {
            Ok(file) if file.name == capture => {
                match self
                    .completed_captures
                    .iter_mut()
                    .find(|entry| entry.name == capture)
                {
                    Some(entry) => entry.size_in_kb = file.size_kb,
                    None => self.completed_captures.push(CompletedCapture::from_file(file)),
                }
                self.finish(node, NodeStatus::DebugPodRunning, "capture-stopped", None)
            }
            Ok(file) => {
                let message = format!(
                    "stop reported capture '{}' but '{capture}' was running",
                    file.name
                );
                self.finish(node, NodeStatus::Unknown, "stop-malformed", Some(message))
            }
            Err(message) => self.finish(node, NodeStatus::Unknown, "stop-failed", Some(message)),
        }
    }

    /// Fold a download outcome; the node status never changes.
    pub fn resolve_download(&mut self, node: &str, capture: &str, result: Result<PathBuf, String>) {
        let Some(entry) = self
            .completed_captures
            .iter_mut()
            .find(|entry| entry.name == capture)
        else {
            warn!("capture download node={node} capture={capture} unknown");
            self.record_error(format!("download response for unknown capture '{capture}'"));
            return;
        };
        if entry.download_status != DownloadStatus::Downloading {
            warn!("capture download node={node} capture={capture} not downloading");
            self.record_error(format!("unexpected download response for capture '{capture}'"));
            return;
        }
        match result {
            Ok(path) => {
                info!("capture downloaded node={node} capture={capture} path={}", path.display());
                entry.download_status = DownloadStatus::Downloaded;
                entry.downloaded_file_path = Some(path);
                self.error_message = None;
            }
            Err(message) => {
                warn!("capture download failed node={node} capture={capture} error={message}");
                entry.download_status = if entry.downloaded_file_path.is_some() {
                    DownloadStatus::Downloaded
                } else {
                    DownloadStatus::Completed
                };
                self.error_message = Some(message);
            }
        }
    }

    /// Check the capture-name invariant.
    #[must_use]
    pub fn invariant_holds(&self) -> bool {
        self.current_capture_name.is_some() == self.status.has_capture()
    }
}
