// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Deterministic in-process cluster answering the dispatcher's kubectl invocations.
// Author: Lukas Bower

//! [`SimCluster`] implements [`RemoteExec`] by interpreting the same kubectl
//! argument vectors the production transport would run. It keeps a model of
//! nodes, pods, interfaces, debug agents and capture files, supports one-shot
//! failure injection per operation, and records every call for assertions.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use log::debug;
use serde_json::json;

use crate::config::{AgentConfig, CaptureNaming, NodecapConfig};
use crate::exec::{ExecError, ExecOutput, RemoteExec};

/// Default size of a stopped simulated capture, 42 KiB.
pub const DEFAULT_CAPTURE_BYTES: usize = 42 * 1024;

/// Remote operation classes recognised by the simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    /// `get nodes`.
    ListNodes,
    /// `get pods --field-selector`.
    ListPods,
    /// `get pod` for the debug agent.
    GetAgent,
    /// `apply -f` of the agent manifest.
    ApplyAgent,
    /// `wait --for=condition=Ready`.
    WaitAgent,
    /// `delete pod`.
    DeleteAgent,
    /// `ip -j link show` inside the agent.
    ListInterfaces,
    /// `pgrep -a tcpdump` inside the agent.
    ListProcesses,
    /// `ls -l` inside the agent.
    ListFiles,
    /// Background tcpdump launch.
    StartCapture,
    /// `pkill -INT -f`.
    StopCapture,
    /// `stat -c %s`.
    StatCapture,
    /// `cat` of a capture file.
    ReadCapture,
}

#[derive(Debug, Clone)]
struct SimPod {
    namespace: String,
    name: String,
    ip: Option<String>,
}

#[derive(Debug, Clone)]
struct SimCapture {
    path: String,
    interface: String,
    filter: String,
}

#[derive(Debug, Clone, Default)]
struct SimAgent {
    running: Option<SimCapture>,
    files: BTreeMap<String, Vec<u8>>,
    exited: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct SimNode {
    pods: Vec<SimPod>,
    interfaces: Vec<String>,
    agent: Option<SimAgent>,
}

#[derive(Debug, Clone)]
struct Injected {
    op: SimOp,
    node: Option<String>,
    message: String,
}

#[derive(Debug, Default)]
struct SimState {
    nodes: BTreeMap<String, SimNode>,
    injected: VecDeque<Injected>,
    calls: Vec<Vec<String>>,
    filters: Vec<(String, String)>,
}

/// In-process cluster model implementing [`RemoteExec`].
#[derive(Debug)]
pub struct SimCluster {
    state: Mutex<SimState>,
    agent: AgentConfig,
    naming: CaptureNaming,
    capture_bytes: usize,
    latency: Duration,
}

impl SimCluster {
    /// Create an empty cluster using the configured agent and naming conventions.
    #[must_use]
    pub fn new(config: &NodecapConfig) -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            agent: config.agent.clone(),
            naming: config.naming(),
            capture_bytes: DEFAULT_CAPTURE_BYTES,
            latency: Duration::ZERO,
        }
    }

    /// Create a three-node cluster with a handful of workload pods.
    #[must_use]
    pub fn demo(config: &NodecapConfig) -> Self {
        let cluster = Self::new(config).with_latency(Duration::from_millis(20));
        cluster.add_node(
            "aks-nodepool1-0",
            &[
                ("kube-system", "coredns-5d78c9869d-x2kq4", Some("10.244.0.3")),
                ("shop", "frontend-7c9d8f6b5-abcde", Some("10.244.0.12")),
                ("shop", "pending-job-0", None),
            ],
            &["lo", "eth0", "cni0"],
        );
        cluster.add_node(
            "aks-nodepool1-1",
            &[
                ("shop", "cart-6f7d9c8b7-fghij", Some("10.244.1.7")),
                ("shop", "redis-0", Some("10.244.1.9")),
            ],
            &["lo", "eth0", "cni0"],
        );
        cluster.add_node(
            "aks-nodepool1-2",
            &[("shop", "checkout-5b8c7d6e4-klmno", Some("10.244.2.5"))],
            &["lo", "eth0"],
        );
        cluster
    }

    /// Add per-call latency so concurrent operations interleave.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Set the size of capture files produced when a capture stops.
    #[must_use]
    pub fn with_capture_bytes(mut self, bytes: usize) -> Self {
        self.capture_bytes = bytes;
        self
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a node with `(namespace, name, ip)` pods and interface names.
    pub fn add_node(&self, node: &str, pods: &[(&str, &str, Option<&str>)], interfaces: &[&str]) {
        let entry = SimNode {
            pods: pods
                .iter()
                .map(|(namespace, name, ip)| SimPod {
                    namespace: (*namespace).to_owned(),
                    name: (*name).to_owned(),
                    ip: ip.map(str::to_owned),
                })
                .collect(),
            interfaces: interfaces.iter().map(|name| (*name).to_owned()).collect(),
            agent: None,
        };
        self.lock().nodes.insert(node.to_owned(), entry);
    }

    /// Remove a node from the cluster.
    pub fn remove_node(&self, node: &str) {
        self.lock().nodes.remove(node);
    }

    /// Install a debug agent without going through `apply`.
    pub fn install_agent(&self, node: &str) {
        if let Some(entry) = self.lock().nodes.get_mut(node) {
            entry.agent.get_or_insert_with(SimAgent::default);
        }
    }

    fn with_agent(&self, node: &str, apply: impl FnOnce(&mut SimAgent)) {
        if let Some(agent) = self
            .lock()
            .nodes
            .get_mut(node)
            .and_then(|entry| entry.agent.as_mut())
        {
            apply(agent);
        }
    }

    /// Terminate a node's debug agent; the pod stays behind in `phase`.
    pub fn exit_agent(&self, node: &str, phase: &str) {
        self.with_agent(node, |agent| {
            agent.running = None;
            agent.exited = Some(phase.to_owned());
        });
    }

    /// Place a finished capture file on a node's agent.
    pub fn place_capture_file(&self, node: &str, capture: &str, bytes: Vec<u8>) {
        let path = self.naming.remote_path(capture);
        self.with_agent(node, |agent| {
            agent.files.insert(path, bytes);
        });
    }

    /// Mark a capture as running on a node's agent.
    pub fn place_running_capture(&self, node: &str, capture: &str) {
        let path = self.naming.remote_path(capture);
        self.with_agent(node, |agent| {
            agent.files.insert(path.clone(), Vec::new());
            agent.running = Some(SimCapture {
                path,
                interface: "any".to_owned(),
                filter: String::new(),
            });
        });
    }

    /// Fail the next matching operation with `message`.
    pub fn fail_next(&self, op: SimOp, node: Option<&str>, message: impl Into<String>) {
        self.lock().injected.push_back(Injected {
            op,
            node: node.map(str::to_owned),
            message: message.into(),
        });
    }

    /// Return true when the node currently hosts a debug agent.
    #[must_use]
    pub fn has_agent(&self, node: &str) -> bool {
        self.lock()
            .nodes
            .get(node)
            .is_some_and(|entry| entry.agent.is_some())
    }

    /// Return the interface and filter of the capture running on a node.
    #[must_use]
    pub fn running_capture(&self, node: &str) -> Option<(String, String)> {
        self.lock()
            .nodes
            .get(node)?
            .agent
            .as_ref()?
            .running
            .as_ref()
            .map(|capture| (capture.interface.clone(), capture.filter.clone()))
    }

    /// Return every filter a capture was started with, per node, in order.
    #[must_use]
    pub fn started_filters(&self) -> Vec<(String, String)> {
        self.lock().filters.clone()
    }

    /// Return every recorded invocation.
    #[must_use]
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.lock().calls.clone()
    }

    fn node_of_pod(&self, pod: &str) -> Option<String> {
        pod.strip_prefix(self.agent.pod_prefix.as_str())
            .map(str::to_owned)
    }

    fn classify(&self, args: &[String]) -> Option<(SimOp, Option<String>)> {
        let words: Vec<&str> = args.iter().map(String::as_str).collect();
        match words.as_slice() {
            ["get", "nodes", ..] => Some((SimOp::ListNodes, None)),
            ["get", "pods", .., "--field-selector", selector, "-o", "json"] => Some((
                SimOp::ListPods,
                selector.strip_prefix("spec.nodeName=").map(str::to_owned),
            )),
            ["get", "pod", pod, ..] => Some((SimOp::GetAgent, self.node_of_pod(pod))),
            ["apply", "-f", path] => Some((SimOp::ApplyAgent, manifest_node(path))),
            ["wait", _, target, ..] => Some((
                SimOp::WaitAgent,
                target
                    .strip_prefix("pod/")
                    .and_then(|pod| self.node_of_pod(pod)),
            )),
            ["delete", "pod", pod, ..] => Some((SimOp::DeleteAgent, self.node_of_pod(pod))),
            ["exec", "-n", _, pod, "--", program, ..] => {
                let op = match *program {
                    "ip" => SimOp::ListInterfaces,
                    "pgrep" => SimOp::ListProcesses,
                    "ls" => SimOp::ListFiles,
                    "sh" => SimOp::StartCapture,
                    "pkill" => SimOp::StopCapture,
                    "stat" => SimOp::StatCapture,
                    "cat" => SimOp::ReadCapture,
                    _ => return None,
                };
                Some((op, self.node_of_pod(pod)))
            }
            _ => None,
        }
    }

    fn take_injected(state: &mut SimState, op: SimOp, node: Option<&str>) -> Option<String> {
        let index = state.injected.iter().position(|injected| {
            injected.op == op
                && (injected.node.is_none() || injected.node.as_deref() == node)
        })?;
        state.injected.remove(index).map(|injected| injected.message)
    }

    fn respond(
        &self,
        state: &mut SimState,
        op: SimOp,
        node: Option<&str>,
        args: &[String],
    ) -> ExecOutput {
        match op {
            SimOp::ListNodes => {
                let items: Vec<_> = state
                    .nodes
                    .keys()
                    .map(|name| json!({ "metadata": { "name": name } }))
                    .collect();
                ExecOutput::ok(json!({ "kind": "List", "items": items }).to_string())
            }
            SimOp::ListPods => {
                let mut items = Vec::new();
                if let Some(entry) = node.and_then(|node| state.nodes.get(node)) {
                    for pod in &entry.pods {
                        items.push(json!({
                            "metadata": { "name": pod.name, "namespace": pod.namespace },
                            "status": { "podIP": pod.ip },
                        }));
                    }
                    if entry.agent.is_some() {
                        items.push(json!({
                            "metadata": {
                                "name": self.agent.pod_name(node.unwrap_or_default()),
                                "namespace": self.agent.namespace,
                            },
                            "status": { "podIP": "10.224.0.4" },
                        }));
                    }
                }
                ExecOutput::ok(json!({ "items": items }).to_string())
            }
            SimOp::GetAgent => {
                let phase = node
                    .and_then(|node| state.nodes.get(node))
                    .and_then(|entry| entry.agent.as_ref())
                    .map(|agent| agent.exited.as_deref().unwrap_or("Running"));
                ExecOutput::ok(phase.unwrap_or_default())
            }
            SimOp::ApplyAgent => match node.and_then(|node| state.nodes.get_mut(node)) {
                Some(entry) => {
                    entry.agent.get_or_insert_with(SimAgent::default);
                    ExecOutput::ok("pod/created")
                }
                None => ExecOutput::failed(1, "Error from server: node not found"),
            },
            SimOp::WaitAgent => {
                let ready = node
                    .and_then(|node| state.nodes.get(node))
                    .is_some_and(|entry| entry.agent.is_some());
                if ready {
                    ExecOutput::ok("condition met")
                } else {
                    ExecOutput::failed(1, "error: timed out waiting for the condition")
                }
            }
            SimOp::DeleteAgent => {
                if let Some(entry) = node.and_then(|node| state.nodes.get_mut(node)) {
                    entry.agent = None;
                }
                ExecOutput::ok("")
            }
            _ => {
                let Some(node) = node else {
                    return ExecOutput::failed(1, "error: pod not found");
                };
                let capture_bytes = self.capture_bytes;
                let Some(entry) = state.nodes.get_mut(node) else {
                    return ExecOutput::failed(1, format!("error: node {node} not found"));
                };
                let interfaces = entry.interfaces.clone();
                let Some(agent) = entry.agent.as_mut() else {
                    let pod = self.agent.pod_name(node);
                    return ExecOutput::failed(
                        1,
                        format!("Error from server (NotFound): pods \"{pod}\" not found"),
                    );
                };
                if let Some(phase) = &agent.exited {
                    return ExecOutput::failed(
                        1,
                        format!("error: cannot exec into a completed pod; phase is {phase}"),
                    );
                }
                let output = agent_exec(agent, op, args, &interfaces, capture_bytes);
                if op == SimOp::StartCapture && output.success() {
                    if let Some(capture) = &agent.running {
                        state.filters.push((node.to_owned(), capture.filter.clone()));
                    }
                }
                output
            }
        }
    }
}

impl RemoteExec for SimCluster {
    fn execute(&self, args: &[String]) -> Result<ExecOutput, ExecError> {
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        let (op, node) = self
            .classify(args)
            .ok_or_else(|| ExecError::Unavailable(format!("unsupported invocation {args:?}")))?;
        let mut state = self.lock();
        state.calls.push(args.to_vec());
        if let Some(message) = Self::take_injected(&mut state, op, node.as_deref()) {
            debug!("sim injected failure op={op:?} node={}", node.as_deref().unwrap_or("-"));
            return Ok(ExecOutput::failed(1, message));
        }
        Ok(self.respond(&mut state, op, node.as_deref(), args))
    }
}

fn manifest_node(path: &str) -> Option<String> {
    let text = fs::read_to_string(path).ok()?;
    let manifest: serde_json::Value = serde_json::from_str(&text).ok()?;
    manifest["spec"]["nodeName"].as_str().map(str::to_owned)
}

fn agent_exec(
    agent: &mut SimAgent,
    op: SimOp,
    args: &[String],
    interfaces: &[String],
    capture_bytes: usize,
) -> ExecOutput {
    let tail: Vec<&str> = args
        .iter()
        .skip_while(|arg| arg.as_str() != "--")
        .skip(1)
        .map(String::as_str)
        .collect();
    match (op, tail.as_slice()) {
        (SimOp::ListInterfaces, _) => {
            let links: Vec<_> = interfaces
                .iter()
                .enumerate()
                .map(|(index, name)| json!({ "ifindex": index + 1, "ifname": name }))
                .collect();
            ExecOutput::ok(serde_json::Value::from(links).to_string())
        }
        (SimOp::ListProcesses, _) => match &agent.running {
            Some(capture) => ExecOutput::ok(format!(
                "4242 tcpdump -U -i {} -w {} {}\n",
                capture.interface, capture.path, capture.filter
            )),
            None => ExecOutput::failed(1, ""),
        },
        (SimOp::ListFiles, _) => {
            let mut listing = format!("total {}\n", agent.files.len());
            for (path, bytes) in &agent.files {
                let file_name = path.rsplit('/').next().unwrap_or(path);
                listing.push_str(&format!(
                    "-rw-r--r--    1 root     root     {:>9} Jan  1 00:00 {file_name}\n",
                    bytes.len()
                ));
            }
            ExecOutput::ok(listing)
        }
        (SimOp::StartCapture, ["sh", "-c", script]) => {
            let Some(capture) = parse_capture_script(script) else {
                return ExecOutput::failed(2, "sh: syntax error");
            };
            if capture.interface != "any" && !interfaces.contains(&capture.interface) {
                return ExecOutput::failed(
                    1,
                    format!("tcpdump: {}: No such device exists", capture.interface),
                );
            }
            if capture.filter.contains("invalid") {
                return ExecOutput::failed(1, "tcpdump: syntax error in filter expression");
            }
            agent.files.insert(capture.path.clone(), Vec::new());
            agent.running = Some(capture);
            ExecOutput::ok("")
        }
        (SimOp::StopCapture, ["pkill", "-INT", "-f", path]) => {
            match agent.running.take() {
                Some(capture) if capture.path == *path => {
                    agent.files.insert(capture.path, vec![0_u8; capture_bytes]);
                    ExecOutput::ok("")
                }
                other => {
                    agent.running = other;
                    ExecOutput::failed(1, "")
                }
            }
        }
        (SimOp::StatCapture, ["stat", "-c", "%s", path]) => match agent.files.get(*path) {
            Some(bytes) => ExecOutput::ok(format!("{}\n", bytes.len())),
            None => ExecOutput::failed(
                1,
                format!("stat: can't stat '{path}': No such file or directory"),
            ),
        },
        (SimOp::ReadCapture, ["cat", path]) => match agent.files.get(*path) {
            Some(bytes) => ExecOutput::ok(bytes.clone()),
            None => ExecOutput::failed(
                1,
                format!("cat: can't open '{path}': No such file or directory"),
            ),
        },
        _ => ExecOutput::failed(127, "sh: unsupported command"),
    }
}

fn parse_capture_script(script: &str) -> Option<SimCapture> {
    let rest = &script[script.find("tcpdump ")?..];
    let (_, after_iface) = rest.split_once(" -i ")?;
    let (interface, after_iface) = take_quoted(after_iface)?;
    let after_w = after_iface.trim_start().strip_prefix("-w ")?;
    let (path, after_path) = after_w.split_once(' ')?;
    let (filter, _) = take_quoted(after_path.trim_start())?;
    Some(SimCapture {
        path: path.to_owned(),
        interface,
        filter,
    })
}

fn take_quoted(text: &str) -> Option<(String, &str)> {
    let mut rest = text.strip_prefix('\'')?;
    let mut value = String::new();
    loop {
        let end = rest.find('\'')?;
        value.push_str(&rest[..end]);
        rest = &rest[end + 1..];
        match rest.strip_prefix(r"\''") {
            Some(next) => {
                value.push('\'');
                rest = next;
            }
            None => return Some((value, rest)),
        }
    }
}
