// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Line-oriented operator shell translating commands into orchestrator intents.
// Author: Lukas Bower

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use nodecap_filter::{
    ApplicationProtocol, EndpointRole, ScenarioKind, SpecificPodDirection, TwoPodsDirection,
};

use crate::exec::RemoteExec;
use crate::orchestrator::Orchestrator;
use crate::protocol::Intent;
use crate::sink::CaptureSink;

/// Default time `wait` and reference queries block for responses.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(300);

const HELP: &str = "\
Available commands:
  nodes [refresh]                         list cluster nodes
  pods <node> [refresh]                   list pods on a node
  ifaces <node> [refresh]                 list capture interfaces (debug pod required)
  check|create|delete <node>              check node, create or delete its debug pod
  scenario <node> specific-pod|two-pods   switch capture scenario
  pod <node> <pod|none>                   select the specific pod
  direction <node> <direction>            set the packet direction
  endpoint <node> source|destination node|pod <name|none>
  iface <node> <name|any>                 select the capture interface
  protocol <node> <name|tcp/PORT|none>    restrict to an application protocol
  filter <node> <expression...>           overwrite the capture filter
  start <node> <capture>                  start a capture
  stop <node>                             stop the running capture
  download <node> <capture> [path]        download a completed capture
  wait [seconds]                          wait for in-flight operations
  show [node]                             render state
  quit";

/// Result of executing a single shell command.
#[derive(Debug, PartialEq, Eq)]
pub enum CommandStatus {
    /// Continue reading commands.
    Continue,
    /// Exit the shell loop.
    Quit,
}

/// Shell driver parsing operator commands into intents.
pub struct Shell<E, S, W: Write> {
    orchestrator: Orchestrator<E, S>,
    writer: W,
    json: bool,
    wait: Duration,
}

impl<E, S, W> Shell<E, S, W>
where
    E: RemoteExec + 'static,
    S: CaptureSink + 'static,
    W: Write,
{
    /// Create a shell over an orchestrator and output writer.
    pub fn new(orchestrator: Orchestrator<E, S>, writer: W) -> Self {
        Self {
            orchestrator,
            writer,
            json: false,
            wait: DEFAULT_WAIT,
        }
    }

    /// Render `show` output as JSON.
    #[must_use]
    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    /// Override the default wait duration.
    #[must_use]
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    /// Borrow the orchestrator.
    #[must_use]
    pub fn orchestrator(&self) -> &Orchestrator<E, S> {
        &self.orchestrator
    }

    /// Write a line directly to the shell output.
    pub fn write_line(&mut self, message: &str) -> Result<()> {
        writeln!(self.writer, "{message}")?;
        Ok(())
    }

    /// Execute commands from a buffered reader until EOF or `quit`.
    pub fn run_script<R: BufRead>(&mut self, reader: R) -> Result<()> {
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let status = self
                .execute(trimmed)
                .with_context(|| format!("script line {}: {trimmed}", index + 1))?;
            if status == CommandStatus::Quit {
                break;
            }
        }
        Ok(())
    }

    /// Run an interactive REPL against stdin.
    pub fn repl(&mut self) -> Result<()> {
        let stdin = io::stdin();
        let mut reader = stdin.lock();
        let mut line = String::new();
        loop {
            let folded = self.orchestrator.poll();
            if folded > 0 {
                writeln!(self.writer, "{folded} operation(s) completed")?;
            }
            write!(self.writer, "nodecap> ")?;
            self.writer.flush()?;
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                writeln!(self.writer)?;
                break;
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match self.execute(trimmed) {
                Ok(CommandStatus::Quit) => break,
                Ok(CommandStatus::Continue) => {}
                Err(err) => writeln!(self.writer, "error: {err:#}")?,
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, intent: Intent) -> Result<()> {
        let label = intent.label();
        let node = intent.node().unwrap_or("-").to_owned();
        let count = self.orchestrator.submit(intent)?;
        if count > 0 {
            writeln!(self.writer, "dispatched {label} node={node}")?;
        }
        Ok(())
    }

    fn edit(&mut self, intent: Intent) -> Result<()> {
        let node = intent.node().unwrap_or("-").to_owned();
        self.orchestrator.submit(intent)?;
        let filter = self
            .orchestrator
            .state()
            .node(&node)
            .map(|entry| entry.filters().filter_text.clone())
            .unwrap_or_default();
        writeln!(self.writer, "filter {node}: {filter}")?;
        Ok(())
    }

    fn query(&mut self, intent: Intent) -> Result<()> {
        self.orchestrator.submit(intent)?;
        self.orchestrator.settle(self.wait)?;
        Ok(())
    }

    /// Execute a single command line.
    pub fn execute(&mut self, line: &str) -> Result<CommandStatus> {
        let mut parts = line.split_whitespace();
        let Some(cmd) = parts.next() else {
            return Ok(CommandStatus::Continue);
        };
        match cmd {
            "help" => {
                writeln!(self.writer, "{HELP}")?;
            }
            "nodes" => {
                let refresh = parse_refresh(parts.next())?;
                self.query(Intent::LoadNodes { refresh })?;
                let state = self.orchestrator.state();
                if let Some(error) = state.error_message() {
                    return Err(anyhow!("node discovery failed: {error}"));
                }
                let names: Vec<String> = state.nodes().keys().cloned().collect();
                for name in names {
                    writeln!(self.writer, "{name}")?;
                }
            }
            "pods" => {
                let node = required(parts.next(), "pods requires a node")?;
                let refresh = parse_refresh(parts.next())?;
                self.query(Intent::LoadPods {
                    node: node.to_owned(),
                    refresh,
                })?;
                let pods = self
                    .orchestrator
                    .state()
                    .cache()
                    .filter_pods(node)
                    .and_then(|cell| cell.loaded().cloned());
                let Some(pods) = pods else {
                    return Err(anyhow!("pods for {node} not loaded"));
                };
                for pod in pods {
                    writeln!(self.writer, "{} {}", pod.name, pod.ip)?;
                }
            }
            "ifaces" => {
                let node = required(parts.next(), "ifaces requires a node")?;
                let refresh = parse_refresh(parts.next())?;
                self.query(Intent::LoadInterfaces {
                    node: node.to_owned(),
                    refresh,
                })?;
                let interfaces = self
                    .orchestrator
                    .state()
                    .node(node)
                    .and_then(|entry| entry.capture_interfaces().loaded().cloned());
                let Some(interfaces) = interfaces else {
                    return Err(anyhow!("interfaces for {node} not loaded"));
                };
                writeln!(self.writer, "{}", interfaces.join(" "))?;
            }
            "check" | "create" | "delete" => {
                let node = required(parts.next(), "command requires a node")?.to_owned();
                let intent = match cmd {
                    "check" => Intent::CheckNode { node },
                    "create" => Intent::CreateDebugPod { node },
                    _ => Intent::DeleteDebugPod { node },
                };
                self.dispatch(intent)?;
            }
            "scenario" => {
                let node = required(parts.next(), "scenario requires a node")?.to_owned();
                let scenario: ScenarioKind =
                    required(parts.next(), "scenario requires a kind")?.parse()?;
                self.edit(Intent::SelectScenario { node, scenario })?;
            }
            "pod" => {
                let node = required(parts.next(), "pod requires a node")?.to_owned();
                let pod = optional(required(parts.next(), "pod requires a pod name or none")?);
                self.edit(Intent::SelectPod { node, pod })?;
            }
            "direction" => {
                let node = required(parts.next(), "direction requires a node")?.to_owned();
                let label = required(parts.next(), "direction requires a direction")?;
                let kind = self
                    .orchestrator
                    .state()
                    .node(&node)
                    .map(|entry| entry.filters().scenario.kind())
                    .with_context(|| format!("unknown node '{node}'"))?;
                let intent = match kind {
                    ScenarioKind::SpecificPod => Intent::SetSpecificDirection {
                        node,
                        direction: label.parse::<SpecificPodDirection>()?,
                    },
                    ScenarioKind::TwoPods => Intent::SetTwoPodsDirection {
                        node,
                        direction: label.parse::<TwoPodsDirection>()?,
                    },
                };
                self.edit(intent)?;
            }
            "endpoint" => {
                let node = required(parts.next(), "endpoint requires a node")?.to_owned();
                let role: EndpointRole =
                    required(parts.next(), "endpoint requires source or destination")?.parse()?;
                let field = required(parts.next(), "endpoint requires node or pod")?;
                let value = optional(required(parts.next(), "endpoint requires a name or none")?);
                let intent = match field {
                    "node" => Intent::SelectEndpointNode {
                        node,
                        role,
                        endpoint_node: value,
                    },
                    "pod" => Intent::SelectEndpointPod {
                        node,
                        role,
                        pod: value,
                    },
                    other => return Err(anyhow!("unknown endpoint field '{other}'")),
                };
                let dispatched = self.orchestrator.submit(intent.clone())?;
                if dispatched > 0 {
                    self.orchestrator.settle(self.wait)?;
                }
                let filter = self
                    .orchestrator
                    .state()
                    .node(intent.node().unwrap_or_default())
                    .map(|entry| entry.filters().filter_text.clone())
                    .unwrap_or_default();
                writeln!(
                    self.writer,
                    "filter {}: {filter}",
                    intent.node().unwrap_or_default()
                )?;
            }
            "iface" => {
                let node = required(parts.next(), "iface requires a node")?.to_owned();
                let value = required(parts.next(), "iface requires a name or any")?;
                let interface = if value == "any" {
                    None
                } else {
                    Some(value.to_owned())
                };
                self.edit(Intent::SelectInterface { node, interface })?;
            }
            "protocol" => {
                let node = required(parts.next(), "protocol requires a node")?.to_owned();
                let value = required(parts.next(), "protocol requires a protocol or none")?;
                let protocol = match optional(value) {
                    Some(label) => Some(label.parse::<ApplicationProtocol>()?),
                    None => None,
                };
                self.edit(Intent::SelectProtocol { node, protocol })?;
            }
            "filter" => {
                let node = required(parts.next(), "filter requires a node")?.to_owned();
                let text = parts.collect::<Vec<_>>().join(" ");
                self.edit(Intent::SetFilterText { node, text })?;
            }
            "start" => {
                let node = required(parts.next(), "start requires a node")?.to_owned();
                let capture = required(parts.next(), "start requires a capture name")?.to_owned();
                self.dispatch(Intent::StartCapture { node, capture })?;
            }
            "stop" => {
                let node = required(parts.next(), "stop requires a node")?.to_owned();
                self.dispatch(Intent::StopCapture { node })?;
            }
            "download" => {
                let node = required(parts.next(), "download requires a node")?.to_owned();
                let capture =
                    required(parts.next(), "download requires a capture name")?.to_owned();
                let destination = parts.next().map(PathBuf::from);
                self.dispatch(Intent::DownloadCapture {
                    node,
                    capture,
                    destination,
                })?;
            }
            "wait" => {
                let wait = match parts.next() {
                    Some(value) => Duration::from_secs(
                        value
                            .parse::<u64>()
                            .with_context(|| format!("invalid wait seconds '{value}'"))?,
                    ),
                    None => self.wait,
                };
                self.orchestrator.settle(wait)?;
                writeln!(self.writer, "idle")?;
            }
            "show" => {
                let mut view = self.orchestrator.view();
                if let Some(node) = parts.next() {
                    view.nodes.retain(|entry| entry.name == node);
                    if view.nodes.is_empty() {
                        return Err(anyhow!("unknown node '{node}'"));
                    }
                }
                if self.json {
                    writeln!(self.writer, "{}", serde_json::to_string_pretty(&view)?)?;
                } else {
                    write!(self.writer, "{}", view.render_text())?;
                }
            }
            "quit" | "exit" => {
                writeln!(self.writer, "closing nodecap")?;
                return Ok(CommandStatus::Quit);
            }
            unknown => return Err(anyhow!("unknown command '{unknown}'")),
        }
        Ok(CommandStatus::Continue)
    }

    /// Consume the shell and return the orchestrator and writer.
    pub fn into_parts(self) -> (Orchestrator<E, S>, W) {
        (self.orchestrator, self.writer)
    }
}

fn required<'a>(value: Option<&'a str>, message: &str) -> Result<&'a str> {
    value.ok_or_else(|| anyhow!("{message}"))
}

fn optional(value: &str) -> Option<String> {
    if value.eq_ignore_ascii_case("none") {
        None
    } else {
        Some(value.to_owned())
    }
}

fn parse_refresh(value: Option<&str>) -> Result<bool> {
    match value {
        None => Ok(false),
        Some("refresh") => Ok(true),
        Some(other) => Err(anyhow!("unexpected argument '{other}' (expected refresh)")),
    }
}
