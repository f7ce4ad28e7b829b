// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Translate orchestrator commands into kubectl invocations and typed responses.
// Author: Lukas Bower

//! The dispatcher executes exactly one remote operation per command and
//! returns the matching [`Response`]. It never touches orchestrator state;
//! every failure, including transport and parse errors, is folded into the
//! response as operator-facing text.

use std::io::{self, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use nodecap_filter::FilterPod;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::config::{AgentConfig, CaptureNaming, NodecapConfig};
use crate::exec::{ExecError, ExecOutput, RemoteExec};
use crate::protocol::{AgentState, CaptureFile, Command, NodeCheck, Response};
use crate::sink::CaptureSink;

/// Failure interpreting a remote operation.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Transport failed before an exit code was available.
    #[error(transparent)]
    Exec(#[from] ExecError),
    /// Remote step exited non-zero.
    #[error("{step} failed (exit {code}): {stderr}")]
    Failed {
        /// Step label.
        step: &'static str,
        /// Exit code.
        code: i32,
        /// Captured stderr.
        stderr: String,
    },
    /// Remote output could not be interpreted.
    #[error("{step} returned unexpected output: {detail}")]
    Parse {
        /// Step label.
        step: &'static str,
        /// Parse failure detail.
        detail: String,
    },
    /// Debug agent exists but is not usable.
    #[error("debug pod {pod} is in phase {phase}")]
    AgentPhase {
        /// Pod name.
        pod: String,
        /// Reported phase.
        phase: String,
    },
    /// Local file system failure.
    #[error("local io error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Deserialize)]
struct ObjectList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct ObjectMeta {
    name: String,
}

#[derive(Debug, Deserialize)]
struct NodeObject {
    metadata: ObjectMeta,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodStatusDoc {
    #[serde(default)]
    pod_ip: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PodObject {
    metadata: ObjectMeta,
    #[serde(default)]
    status: PodStatusDoc,
}

#[derive(Debug, Deserialize)]
struct LinkDoc {
    ifname: String,
}

/// Executes commands against one cluster through a [`RemoteExec`].
#[derive(Debug)]
pub struct Dispatcher<E, S> {
    exec: E,
    sink: S,
    agent: AgentConfig,
    naming: CaptureNaming,
    snapshot_length: u32,
}

impl<E: RemoteExec, S: CaptureSink> Dispatcher<E, S> {
    /// Build a dispatcher from configuration.
    pub fn new(exec: E, sink: S, config: &NodecapConfig) -> Self {
        Self {
            exec,
            sink,
            agent: config.agent.clone(),
            naming: config.naming(),
            snapshot_length: config.capture.snapshot_length,
        }
    }

    /// Return the capture naming scheme.
    #[must_use]
    pub fn naming(&self) -> &CaptureNaming {
        &self.naming
    }

    /// Borrow the remote exec transport.
    #[must_use]
    pub fn exec(&self) -> &E {
        &self.exec
    }

    /// Execute one command and return its response.
    pub fn dispatch(&self, command: &Command) -> Response {
        debug!(
            "dispatch begin command={} node={}",
            command.label(),
            command.node().unwrap_or("-")
        );
        let response = match self.try_dispatch(command) {
            Ok(response) => response,
            Err(err) => {
                warn!(
                    "dispatch failed command={} node={} error={err}",
                    command.label(),
                    command.node().unwrap_or("-")
                );
                Response::failed(command, err.to_string())
            }
        };
        debug!(
            "dispatch end command={} node={} ok={}",
            command.label(),
            command.node().unwrap_or("-"),
            response.is_ok()
        );
        response
    }

    fn try_dispatch(&self, command: &Command) -> Result<Response, DispatchError> {
        Ok(match command {
            Command::DiscoverNodes => Response::NodesDiscovered {
                result: Ok(self.discover_nodes()?),
            },
            Command::DiscoverPods { node } => Response::PodsDiscovered {
                node: node.clone(),
                result: Ok(self.discover_pods(node)?),
            },
            Command::DiscoverInterfaces { node } => Response::InterfacesDiscovered {
                node: node.clone(),
                result: Ok(self.discover_interfaces(node)?),
            },
            Command::CheckNode { node } => Response::NodeChecked {
                node: node.clone(),
                result: Ok(self.check_node(node)?),
            },
            Command::CreateDebugPod { node } => {
                self.create_debug_pod(node)?;
                Response::DebugPodCreated {
                    node: node.clone(),
                    result: Ok(()),
                }
            }
            Command::DeleteDebugPod { node } => {
                self.delete_debug_pod(node)?;
                Response::DebugPodDeleted {
                    node: node.clone(),
                    result: Ok(()),
                }
            }
            Command::StartCapture {
                node,
                capture,
                interface,
                filter,
            } => {
                self.start_capture(node, capture, interface.as_deref(), filter)?;
                Response::CaptureStarted {
                    node: node.clone(),
                    capture: capture.clone(),
                    result: Ok(()),
                }
            }
            Command::StopCapture { node, capture } => Response::CaptureStopped {
                node: node.clone(),
                capture: capture.clone(),
                result: Ok(self.stop_capture(node, capture)?),
            },
            Command::DownloadCapture {
                node,
                capture,
                destination,
            } => {
                let path = self.download_capture(node, capture, destination.as_deref())?;
                Response::CaptureDownloaded {
                    node: node.clone(),
                    capture: capture.clone(),
                    result: Ok(path),
                }
            }
        })
    }

    fn run(&self, step: &'static str, args: Vec<String>) -> Result<ExecOutput, DispatchError> {
        let output = self.exec.execute(&args)?;
        if output.success() {
            Ok(output)
        } else {
            Err(DispatchError::Failed {
                step,
                code: output.exit_code,
                stderr: output.stderr,
            })
        }
    }

    fn agent_args(&self, node: &str, tail: &[&str]) -> Vec<String> {
        let mut args = vec![
            "exec".to_owned(),
            "-n".to_owned(),
            self.agent.namespace.clone(),
            self.agent.pod_name(node),
            "--".to_owned(),
        ];
        args.extend(tail.iter().map(|arg| (*arg).to_owned()));
        args
    }

    fn discover_nodes(&self) -> Result<Vec<String>, DispatchError> {
        let output = self.run("list nodes", strings(&["get", "nodes", "-o", "json"]))?;
        let list: ObjectList<NodeObject> = parse_json("list nodes", &output)?;
        Ok(list.items.into_iter().map(|item| item.metadata.name).collect())
    }

    fn discover_pods(&self, node: &str) -> Result<Vec<FilterPod>, DispatchError> {
        let selector = format!("spec.nodeName={node}");
        let output = self.run(
            "list pods",
            strings(&["get", "pods", "-A", "--field-selector", selector.as_str(), "-o", "json"]),
        )?;
        let list: ObjectList<PodObject> = parse_json("list pods", &output)?;
        let agent = self.agent.pod_name(node);
        let pods = list
            .items
            .into_iter()
            .filter(|item| item.metadata.name != agent)
            .filter_map(|item| {
                let ip = item.status.pod_ip.as_deref()?.parse::<IpAddr>().ok()?;
                Some(FilterPod::new(item.metadata.name, ip))
            })
            .collect();
        Ok(pods)
    }

    fn discover_interfaces(&self, node: &str) -> Result<Vec<String>, DispatchError> {
        let output = self.run(
            "list interfaces",
            self.agent_args(node, &["ip", "-j", "link", "show"]),
        )?;
        let links: Vec<LinkDoc> = parse_json("list interfaces", &output)?;
        Ok(links.into_iter().map(|link| link.ifname).collect())
    }

    fn check_node(&self, node: &str) -> Result<NodeCheck, DispatchError> {
        let pod = self.agent.pod_name(node);
        let output = self.run(
            "get debug pod",
            strings(&[
                "get",
                "pod",
                pod.as_str(),
                "-n",
                self.agent.namespace.as_str(),
                "--ignore-not-found",
                "-o",
                "jsonpath={.status.phase}",
            ]),
        )?;
        let phase = output.stdout_text().trim().to_owned();
        if phase.is_empty() {
            return Ok(NodeCheck {
                agent: AgentState::Absent,
                captures: Vec::new(),
            });
        }
        match phase.as_str() {
            "Running" => {}
            // restartPolicy Never: a finished agent stays terminal until it is deleted.
            "Succeeded" | "Failed" => {
                return Ok(NodeCheck {
                    agent: AgentState::Stopped { phase },
                    captures: Vec::new(),
                })
            }
            _ => return Err(DispatchError::AgentPhase { pod, phase }),
        }

        let processes = self
            .exec
            .execute(&self.agent_args(node, &["pgrep", "-a", "tcpdump"]))?;
        let running = match processes.exit_code {
            0 => processes
                .stdout_text()
                .lines()
                .find_map(|line| self.naming.capture_from_text(line)),
            1 => None,
            code => {
                return Err(DispatchError::Failed {
                    step: "list capture processes",
                    code,
                    stderr: processes.stderr,
                })
            }
        };

        let listing = self.run(
            "list capture files",
            self.agent_args(node, &["ls", "-l", self.naming.dir()]),
        )?;
        let captures = parse_listing(&self.naming, &listing.stdout_text());
        let agent = match running {
            Some(capture) => AgentState::Capturing { capture },
            None => AgentState::Running,
        };
        Ok(NodeCheck { agent, captures })
    }

    fn create_debug_pod(&self, node: &str) -> Result<(), DispatchError> {
        let pod = self.agent.pod_name(node);
        let manifest = agent_manifest(&self.agent, node);
        let mut file = tempfile::Builder::new()
            .prefix("nodecap-agent-")
            .suffix(".json")
            .tempfile()?;
        serde_json::to_writer_pretty(&mut file, &manifest)
            .map_err(|err| DispatchError::Io(err.into()))?;
        file.flush()?;
        let manifest_path = file.path().display().to_string();
        self.run("apply debug pod", strings(&["apply", "-f", manifest_path.as_str()]))?;
        let target = format!("pod/{pod}");
        let timeout = format!("--timeout={}s", self.agent.ready_timeout_secs);
        self.run(
            "wait for debug pod",
            strings(&[
                "wait",
                "--for=condition=Ready",
                target.as_str(),
                "-n",
                self.agent.namespace.as_str(),
                timeout.as_str(),
            ]),
        )?;
        Ok(())
    }

    fn delete_debug_pod(&self, node: &str) -> Result<(), DispatchError> {
        let pod = self.agent.pod_name(node);
        self.run(
            "delete debug pod",
            strings(&[
                "delete",
                "pod",
                pod.as_str(),
                "-n",
                self.agent.namespace.as_str(),
                "--ignore-not-found",
                "--wait=true",
            ]),
        )?;
        Ok(())
    }

    fn start_capture(
        &self,
        node: &str,
        capture: &str,
        interface: Option<&str>,
        filter: &str,
    ) -> Result<(), DispatchError> {
        let script = capture_script(
            &self.naming.remote_path(capture),
            interface.unwrap_or("any"),
            filter,
            self.snapshot_length,
        );
        self.run("start capture", self.agent_args(node, &["sh", "-c", script.as_str()]))?;
        Ok(())
    }

    fn stop_capture(&self, node: &str, capture: &str) -> Result<CaptureFile, DispatchError> {
        let path = self.naming.remote_path(capture);
        self.run(
            "stop capture",
            self.agent_args(node, &["pkill", "-INT", "-f", path.as_str()]),
        )?;
        let output = self.run(
            "stat capture",
            self.agent_args(node, &["stat", "-c", "%s", path.as_str()]),
        )?;
        let text = output.stdout_text();
        let bytes = text
            .trim()
            .parse::<u64>()
            .map_err(|_| DispatchError::Parse {
                step: "stat capture",
                detail: format!("size '{}'", text.trim()),
            })?;
        Ok(CaptureFile {
            name: capture.to_owned(),
            size_kb: kib_rounded_up(bytes),
        })
    }

    fn download_capture(
        &self,
        node: &str,
        capture: &str,
        destination: Option<&Path>,
    ) -> Result<PathBuf, DispatchError> {
        let path = self.naming.remote_path(capture);
        let args = self.agent_args(node, &["cat", path.as_str()]);
        let mut streamed = None;
        let mut fill = |file: &mut dyn Write| -> io::Result<()> {
            let outcome = self.exec.execute_into(&args, file);
            let complete = matches!(&outcome, Ok(output) if output.success());
            streamed = Some(outcome);
            if complete {
                Ok(())
            } else {
                Err(io::Error::other("capture stream incomplete"))
            }
        };
        let persisted = self.sink.persist(node, capture, destination, &mut fill);
        match streamed {
            Some(Err(err)) => Err(err.into()),
            Some(Ok(output)) if !output.success() => Err(DispatchError::Failed {
                step: "read capture",
                code: output.exit_code,
                stderr: output.stderr,
            }),
            _ => Ok(persisted?),
        }
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|arg| (*arg).to_owned()).collect()
}

fn parse_json<T: for<'de> Deserialize<'de>>(
    step: &'static str,
    output: &ExecOutput,
) -> Result<T, DispatchError> {
    serde_json::from_slice(&output.stdout).map_err(|err| DispatchError::Parse {
        step,
        detail: err.to_string(),
    })
}

/// Round a byte count up to whole KiB.
#[must_use]
pub fn kib_rounded_up(bytes: u64) -> u64 {
    bytes.div_ceil(1024)
}

/// Quote a value for a POSIX shell.
#[must_use]
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Build the background tcpdump launch script run inside the agent.
#[must_use]
pub fn capture_script(path: &str, interface: &str, filter: &str, snapshot_length: u32) -> String {
    format!(
        "nohup tcpdump --snapshot-length={snapshot_length} -U -i {} -w {path} {} >{path}.log 2>&1 & \
         pid=$!; sleep 1; if kill -0 $pid 2>/dev/null; then exit 0; fi; cat {path}.log >&2; exit 1",
        shell_quote(interface),
        shell_quote(filter),
    )
}

/// Parse `ls -l` output into capture files matching the naming scheme.
#[must_use]
pub fn parse_listing(naming: &CaptureNaming, listing: &str) -> Vec<CaptureFile> {
    listing
        .lines()
        .filter(|line| line.starts_with('-'))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 9 {
                return None;
            }
            let bytes = fields[4].parse::<u64>().ok()?;
            let name = naming.capture_from_file_name(fields[8])?;
            Some(CaptureFile {
                name,
                size_kb: kib_rounded_up(bytes),
            })
        })
        .collect()
}

/// Build the debug agent pod manifest for a node.
#[must_use]
pub fn agent_manifest(agent: &AgentConfig, node: &str) -> serde_json::Value {
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": agent.pod_name(node),
            "namespace": agent.namespace,
            "labels": { "app.kubernetes.io/managed-by": "nodecap" }
        },
        "spec": {
            "nodeName": node,
            "hostNetwork": true,
            "hostPID": true,
            "restartPolicy": "Never",
            "tolerations": [{ "operator": "Exists" }],
            "containers": [{
                "name": "debug",
                "image": agent.image,
                "command": ["sleep", "infinity"],
                "securityContext": { "privileged": true }
            }]
        }
    })
}
