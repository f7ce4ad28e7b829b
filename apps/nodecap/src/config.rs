// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Load and validate nodecap runtime configuration from TOML.
// Author: Lukas Bower

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::node::validate_capture_name;

/// Runtime configuration for the orchestrator and its kubectl transport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodecapConfig {
    /// kubectl invocation settings.
    pub kubectl: KubectlConfig,
    /// Debug agent pod settings.
    pub agent: AgentConfig,
    /// Capture file settings inside the agent.
    pub capture: CaptureConfig,
    /// Local download settings.
    pub download: DownloadConfig,
}

/// kubectl invocation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KubectlConfig {
    /// kubectl binary name or path.
    pub binary: String,
    /// Explicit kubeconfig path.
    pub kubeconfig: Option<PathBuf>,
    /// Explicit kubeconfig context.
    pub context: Option<String>,
    /// Value passed to `--request-timeout`.
    pub request_timeout_secs: u64,
}

impl Default for KubectlConfig {
    fn default() -> Self {
        Self {
            binary: "kubectl".to_owned(),
            kubeconfig: None,
            context: None,
            request_timeout_secs: 30,
        }
    }
}

/// Debug agent pod settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    /// Namespace hosting debug agents.
    pub namespace: String,
    /// Pod name prefix; the node name is appended.
    pub pod_prefix: String,
    /// Container image carrying tcpdump and iproute2.
    pub image: String,
    /// Seconds to wait for a new agent to become ready.
    pub ready_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_owned(),
            pod_prefix: "nodecap-debug-".to_owned(),
            image: "docker.io/nicolaka/netshoot:v0.13".to_owned(),
            ready_timeout_secs: 120,
        }
    }
}

impl AgentConfig {
    /// Return the debug agent pod name for a node.
    #[must_use]
    pub fn pod_name(&self, node: &str) -> String {
        format!("{}{}", self.pod_prefix, node)
    }
}

/// Capture file settings inside the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureConfig {
    /// Directory holding capture files inside the agent.
    pub dir: String,
    /// File name prefix before the capture name.
    pub file_prefix: String,
    /// File extension without the leading dot.
    pub extension: String,
    /// tcpdump snapshot length in bytes.
    pub snapshot_length: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            dir: "/tmp".to_owned(),
            file_prefix: "nodecap_".to_owned(),
            extension: "pcap".to_owned(),
            snapshot_length: 262_144,
        }
    }
}

/// Local download settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DownloadConfig {
    /// Directory receiving downloaded captures.
    pub dir: PathBuf,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("captures"),
        }
    }
}

/// Naming of capture files inside the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureNaming {
    dir: String,
    prefix: String,
    extension: String,
}

impl CaptureNaming {
    /// Construct a naming scheme.
    pub fn new(
        dir: impl Into<String>,
        prefix: impl Into<String>,
        extension: impl Into<String>,
    ) -> Self {
        let dir: String = dir.into();
        Self {
            dir: dir.trim_end_matches('/').to_owned(),
            prefix: prefix.into(),
            extension: extension.into(),
        }
    }

    /// Return the capture directory.
    #[must_use]
    pub fn dir(&self) -> &str {
        &self.dir
    }

    /// Return the remote path of a named capture.
    #[must_use]
    pub fn remote_path(&self, capture: &str) -> String {
        format!("{}/{}{}.{}", self.dir, self.prefix, capture, self.extension)
    }

    /// Recover a capture name from a bare file name.
    #[must_use]
    pub fn capture_from_file_name(&self, file_name: &str) -> Option<String> {
        let stem = file_name
            .strip_prefix(self.prefix.as_str())?
            .strip_suffix(self.extension.as_str())?
            .strip_suffix('.')?;
        validate_capture_name(stem).ok()?;
        Some(stem.to_owned())
    }

    /// Recover a capture name from a path or a command line mentioning it.
    #[must_use]
    pub fn capture_from_text(&self, text: &str) -> Option<String> {
        let needle = format!("{}/", self.dir);
        text.split_whitespace()
            .map(|token| token.trim_matches(|ch| ch == '\'' || ch == '"'))
            .filter_map(|token| token.strip_prefix(needle.as_str()))
            .find_map(|file_name| self.capture_from_file_name(file_name))
    }
}

impl NodecapConfig {
    /// Return the capture naming scheme.
    #[must_use]
    pub fn naming(&self) -> CaptureNaming {
        CaptureNaming::new(
            self.capture.dir.clone(),
            self.capture.file_prefix.clone(),
            self.capture.extension.clone(),
        )
    }

    /// Validate field values that serde cannot check.
    pub fn validate(&self) -> Result<()> {
        if self.kubectl.binary.trim().is_empty() {
            return Err(anyhow!("kubectl.binary must not be empty"));
        }
        if self.kubectl.request_timeout_secs == 0 {
            return Err(anyhow!("kubectl.request_timeout_secs must be >= 1"));
        }
        if self.agent.namespace.trim().is_empty() {
            return Err(anyhow!("agent.namespace must not be empty"));
        }
        if self.agent.image.trim().is_empty() {
            return Err(anyhow!("agent.image must not be empty"));
        }
        if self.agent.ready_timeout_secs == 0 {
            return Err(anyhow!("agent.ready_timeout_secs must be >= 1"));
        }
        if !self.capture.dir.starts_with('/') {
            return Err(anyhow!("capture.dir must be absolute"));
        }
        if self.capture.extension.is_empty() || self.capture.extension.contains(['.', '/']) {
            return Err(anyhow!("capture.extension must be a bare extension"));
        }
        if self.capture.file_prefix.contains(['/', ' ', '\'']) {
            return Err(anyhow!("capture.file_prefix contains unsupported characters"));
        }
        if self.capture.snapshot_length == 0 {
            return Err(anyhow!("capture.snapshot_length must be >= 1"));
        }
        Ok(())
    }
}

/// Load and validate the configuration from disk.
pub fn load_config(path: &Path) -> Result<NodecapConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read nodecap config {}", path.display()))?;
    let config: NodecapConfig = toml::from_str(&text)
        .with_context(|| format!("invalid nodecap config TOML in {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid nodecap config {}", path.display()))?;
    Ok(config)
}
