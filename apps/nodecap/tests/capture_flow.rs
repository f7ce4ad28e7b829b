// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Drive full capture lifecycles through the orchestrator against the simulated cluster.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::fs;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tempfile::TempDir;

use nodecap::{
    CaptureSink, Dispatcher, DirectorySink, DownloadStatus, ExecError, ExecOutput, Intent,
    NodeOperation, NodeStatus, NodecapConfig, Orchestrator, RemoteExec, SimCluster, SimOp,
};
use nodecap_filter::{
    ApplicationProtocol, EndpointRole, FilterFragment, ScenarioKind, SpecificPodDirection,
    TwoPodsDirection,
};

const WAIT: Duration = Duration::from_secs(10);
const NODE: &str = "aks-nodepool1-0";

type TestOrchestrator = Orchestrator<Arc<SimCluster>, DirectorySink>;

fn orchestrator(temp: &TempDir) -> (Arc<SimCluster>, TestOrchestrator) {
    let config = NodecapConfig::default();
    let cluster = Arc::new(SimCluster::demo(&config).with_latency(Duration::ZERO));
    let sink = DirectorySink::new(temp.path().join("downloads"), "pcap");
    let orchestrator = Orchestrator::new(Dispatcher::new(Arc::clone(&cluster), sink, &config));
    (cluster, orchestrator)
}

fn node(name: &str) -> String {
    name.to_owned()
}

fn status<E, S>(orchestrator: &Orchestrator<E, S>, name: &str) -> NodeStatus
where
    E: RemoteExec + 'static,
    S: CaptureSink + 'static,
{
    orchestrator
        .state()
        .node(name)
        .map(|entry| entry.status())
        .unwrap_or_default()
}

fn prepare_agent(orchestrator: &mut TestOrchestrator) -> Result<()> {
    orchestrator.run(Intent::LoadNodes { refresh: false }, WAIT)?;
    orchestrator.run(Intent::CheckNode { node: node(NODE) }, WAIT)?;
    assert_eq!(status(orchestrator, NODE), NodeStatus::Clean);
    orchestrator.run(Intent::CreateDebugPod { node: node(NODE) }, WAIT)?;
    assert_eq!(status(orchestrator, NODE), NodeStatus::DebugPodRunning);
    Ok(())
}

#[test]
fn specific_pod_capture_end_to_end() -> Result<()> {
    let temp = TempDir::new()?;
    let (cluster, mut orchestrator) = orchestrator(&temp);
    prepare_agent(&mut orchestrator)?;
    assert!(cluster.has_agent(NODE));

    orchestrator.run(
        Intent::LoadPods {
            node: node(NODE),
            refresh: false,
        },
        WAIT,
    )?;
    orchestrator.submit(Intent::SelectPod {
        node: node(NODE),
        pod: Some("frontend-7c9d8f6b5-abcde".to_owned()),
    })?;
    orchestrator.submit(Intent::SetSpecificDirection {
        node: node(NODE),
        direction: SpecificPodDirection::Sent,
    })?;
    assert_eq!(
        orchestrator.state().node(NODE).expect("node").filters().fragments(),
        vec![FilterFragment::Src {
            ip: "10.244.0.12".parse()?
        }]
    );

    orchestrator.submit(Intent::StartCapture {
        node: node(NODE),
        capture: "cap1".to_owned(),
    })?;
    assert_eq!(status(&orchestrator, NODE), NodeStatus::CaptureStarting);
    assert_eq!(
        orchestrator.state().node(NODE).expect("node").current_capture_name(),
        Some("cap1")
    );
    orchestrator.settle(WAIT)?;
    assert_eq!(status(&orchestrator, NODE), NodeStatus::CaptureRunning);
    assert_eq!(
        cluster.running_capture(NODE),
        Some(("any".to_owned(), "src 10.244.0.12".to_owned()))
    );

    orchestrator.run(Intent::StopCapture { node: node(NODE) }, WAIT)?;
    let entry = orchestrator.state().node(NODE).expect("node");
    assert_eq!(entry.status(), NodeStatus::DebugPodRunning);
    assert_eq!(entry.current_capture_name(), None);
    assert_eq!(entry.completed_captures().len(), 1);
    let completed = &entry.completed_captures()[0];
    assert_eq!(completed.name, "cap1");
    assert_eq!(completed.size_in_kb, 42);
    assert_eq!(completed.download_status, DownloadStatus::Completed);

    orchestrator.run(
        Intent::DownloadCapture {
            node: node(NODE),
            capture: "cap1".to_owned(),
            destination: None,
        },
        WAIT,
    )?;
    let completed = &orchestrator.state().node(NODE).expect("node").completed_captures()[0];
    assert_eq!(completed.download_status, DownloadStatus::Downloaded);
    let path = completed.downloaded_file_path.clone().expect("downloaded path");
    assert_eq!(path, temp.path().join("downloads").join(NODE).join("cap1.pcap"));
    assert_eq!(fs::read(&path)?.len(), 42 * 1024);
    assert!(orchestrator.state().invariants_hold());
    Ok(())
}

#[test]
fn failed_start_rolls_back_to_debug_pod_running() -> Result<()> {
    let temp = TempDir::new()?;
    let (cluster, mut orchestrator) = orchestrator(&temp);
    prepare_agent(&mut orchestrator)?;
    cluster.fail_next(SimOp::StartCapture, Some(NODE), "tcpdump: permission denied");

    orchestrator.run(
        Intent::StartCapture {
            node: node(NODE),
            capture: "cap1".to_owned(),
        },
        WAIT,
    )?;
    let entry = orchestrator.state().node(NODE).expect("node");
    assert_eq!(entry.status(), NodeStatus::DebugPodRunning);
    assert_eq!(entry.current_capture_name(), None);
    let error = entry.error_message().expect("error recorded");
    assert!(error.contains("tcpdump: permission denied"), "{error}");

    orchestrator.run(
        Intent::StartCapture {
            node: node(NODE),
            capture: "cap1".to_owned(),
        },
        WAIT,
    )?;
    let entry = orchestrator.state().node(NODE).expect("node");
    assert_eq!(entry.status(), NodeStatus::CaptureRunning);
    assert_eq!(entry.error_message(), None);
    Ok(())
}

#[test]
fn interface_and_protocol_reach_tcpdump() -> Result<()> {
    let temp = TempDir::new()?;
    let (cluster, mut orchestrator) = orchestrator(&temp);
    prepare_agent(&mut orchestrator)?;
    orchestrator.run(
        Intent::LoadInterfaces {
            node: node(NODE),
            refresh: false,
        },
        WAIT,
    )?;
    let interfaces = orchestrator
        .state()
        .node(NODE)
        .and_then(|entry| entry.capture_interfaces().loaded().cloned())
        .expect("interfaces loaded");
    assert_eq!(interfaces, vec!["lo", "eth0", "cni0"]);

    orchestrator.submit(Intent::SelectInterface {
        node: node(NODE),
        interface: Some("eth0".to_owned()),
    })?;
    orchestrator.submit(Intent::SelectProtocol {
        node: node(NODE),
        protocol: Some(ApplicationProtocol::Dns),
    })?;
    orchestrator.run(
        Intent::StartCapture {
            node: node(NODE),
            capture: "dns".to_owned(),
        },
        WAIT,
    )?;
    assert_eq!(
        cluster.running_capture(NODE),
        Some((
            "eth0".to_owned(),
            "(tcp port 53 or udp port 53)".to_owned()
        ))
    );
    Ok(())
}

#[test]
fn failed_stop_moves_node_to_unknown_and_check_recovers() -> Result<()> {
    let temp = TempDir::new()?;
    let (cluster, mut orchestrator) = orchestrator(&temp);
    prepare_agent(&mut orchestrator)?;
    orchestrator.run(
        Intent::StartCapture {
            node: node(NODE),
            capture: "cap1".to_owned(),
        },
        WAIT,
    )?;
    cluster.fail_next(SimOp::StopCapture, Some(NODE), "error: unable to upgrade connection");
    orchestrator.run(Intent::StopCapture { node: node(NODE) }, WAIT)?;
    let entry = orchestrator.state().node(NODE).expect("node");
    assert_eq!(entry.status(), NodeStatus::Unknown);
    assert_eq!(entry.current_capture_name(), None);
    assert!(entry.completed_captures().is_empty());

    orchestrator.run(Intent::CheckNode { node: node(NODE) }, WAIT)?;
    let entry = orchestrator.state().node(NODE).expect("node");
    assert_eq!(entry.status(), NodeStatus::CaptureRunning);
    assert_eq!(entry.current_capture_name(), Some("cap1"));
    assert!(entry.completed_captures().is_empty());
    Ok(())
}

#[test]
fn check_merges_existing_capture_files() -> Result<()> {
    let temp = TempDir::new()?;
    let (cluster, mut orchestrator) = orchestrator(&temp);
    cluster.install_agent(NODE);
    cluster.place_capture_file(NODE, "yesterday", vec![1; 3000]);
    orchestrator.run(Intent::LoadNodes { refresh: false }, WAIT)?;
    orchestrator.run(Intent::CheckNode { node: node(NODE) }, WAIT)?;
    let entry = orchestrator.state().node(NODE).expect("node");
    assert_eq!(entry.status(), NodeStatus::DebugPodRunning);
    assert_eq!(entry.completed_captures().len(), 1);
    assert_eq!(entry.completed_captures()[0].name, "yesterday");
    assert_eq!(entry.completed_captures()[0].size_in_kb, 3);

    let err = orchestrator
        .submit(Intent::StartCapture {
            node: node(NODE),
            capture: "yesterday".to_owned(),
        })
        .unwrap_err();
    assert!(err.to_string().contains("already exists"), "{err}");
    assert_eq!(status(&orchestrator, NODE), NodeStatus::DebugPodRunning);
    Ok(())
}

#[test]
fn deleting_agent_invalidates_interfaces() -> Result<()> {
    let temp = TempDir::new()?;
    let (cluster, mut orchestrator) = orchestrator(&temp);
    prepare_agent(&mut orchestrator)?;
    orchestrator.run(
        Intent::LoadInterfaces {
            node: node(NODE),
            refresh: false,
        },
        WAIT,
    )?;
    orchestrator.submit(Intent::SelectInterface {
        node: node(NODE),
        interface: Some("cni0".to_owned()),
    })?;
    orchestrator.run(Intent::DeleteDebugPod { node: node(NODE) }, WAIT)?;
    let entry = orchestrator.state().node(NODE).expect("node");
    assert_eq!(entry.status(), NodeStatus::Clean);
    assert!(entry.capture_interfaces().is_not_loaded());
    assert_eq!(entry.filters().interface, None);
    assert!(!cluster.has_agent(NODE));
    Ok(())
}

#[test]
fn failures_on_one_node_leave_others_untouched() -> Result<()> {
    let temp = TempDir::new()?;
    let (cluster, mut orchestrator) = orchestrator(&temp);
    orchestrator.run(Intent::LoadNodes { refresh: false }, WAIT)?;
    cluster.fail_next(SimOp::GetAgent, Some("aks-nodepool1-1"), "Unable to connect to the server");
    for name in ["aks-nodepool1-0", "aks-nodepool1-1", "aks-nodepool1-2"] {
        orchestrator.submit(Intent::CheckNode { node: node(name) })?;
    }
    orchestrator.settle(WAIT)?;
    assert_eq!(status(&orchestrator, "aks-nodepool1-0"), NodeStatus::Clean);
    assert_eq!(status(&orchestrator, "aks-nodepool1-1"), NodeStatus::Unknown);
    assert_eq!(status(&orchestrator, "aks-nodepool1-2"), NodeStatus::Clean);
    let failed = orchestrator.state().node("aks-nodepool1-1").expect("node");
    assert!(failed
        .error_message()
        .expect("error")
        .contains("Unable to connect to the server"));
    assert_eq!(
        orchestrator.state().node("aks-nodepool1-0").expect("node").error_message(),
        None
    );
    Ok(())
}

#[test]
fn two_pods_scenario_spans_nodes() -> Result<()> {
    let temp = TempDir::new()?;
    let (cluster, mut orchestrator) = orchestrator(&temp);
    prepare_agent(&mut orchestrator)?;
    orchestrator.submit(Intent::SelectScenario {
        node: node(NODE),
        scenario: ScenarioKind::TwoPods,
    })?;
    orchestrator.run(
        Intent::SelectEndpointNode {
            node: node(NODE),
            role: EndpointRole::Source,
            endpoint_node: Some(node(NODE)),
        },
        WAIT,
    )?;
    orchestrator.run(
        Intent::SelectEndpointNode {
            node: node(NODE),
            role: EndpointRole::Destination,
            endpoint_node: Some(node("aks-nodepool1-1")),
        },
        WAIT,
    )?;
    orchestrator.submit(Intent::SelectEndpointPod {
        node: node(NODE),
        role: EndpointRole::Source,
        pod: Some("frontend-7c9d8f6b5-abcde".to_owned()),
    })?;
    orchestrator.submit(Intent::SelectEndpointPod {
        node: node(NODE),
        role: EndpointRole::Destination,
        pod: Some("cart-6f7d9c8b7-fghij".to_owned()),
    })?;
    orchestrator.submit(Intent::SetTwoPodsDirection {
        node: node(NODE),
        direction: TwoPodsDirection::SourceToDestination,
    })?;
    orchestrator.run(
        Intent::StartCapture {
            node: node(NODE),
            capture: "frontend-to-cart".to_owned(),
        },
        WAIT,
    )?;
    assert_eq!(
        cluster.started_filters(),
        vec![(
            node(NODE),
            "src 10.244.0.12 and dst 10.244.1.7".to_owned()
        )]
    );
    Ok(())
}

#[test]
fn rejected_filter_expression_reports_tcpdump_error() -> Result<()> {
    let temp = TempDir::new()?;
    let (cluster, mut orchestrator) = orchestrator(&temp);
    prepare_agent(&mut orchestrator)?;
    orchestrator.submit(Intent::SetFilterText {
        node: node(NODE),
        text: "port invalid".to_owned(),
    })?;
    orchestrator.run(
        Intent::StartCapture {
            node: node(NODE),
            capture: "bad".to_owned(),
        },
        WAIT,
    )?;
    let entry = orchestrator.state().node(NODE).expect("node");
    assert_eq!(entry.status(), NodeStatus::DebugPodRunning);
    assert!(entry
        .error_message()
        .expect("error")
        .contains("syntax error in filter expression"));
    assert_eq!(cluster.running_capture(NODE), None);
    Ok(())
}

/// Holds every `kubectl apply` until released so a create stays in flight.
struct ApplyGate {
    cluster: Arc<SimCluster>,
    open: Mutex<bool>,
    opened: Condvar,
}

impl ApplyGate {
    fn new(cluster: Arc<SimCluster>) -> Self {
        Self {
            cluster,
            open: Mutex::new(false),
            opened: Condvar::new(),
        }
    }

    fn release(&self) {
        *self.open.lock().expect("gate lock") = true;
        self.opened.notify_all();
    }
}

impl RemoteExec for ApplyGate {
    fn execute(&self, args: &[String]) -> Result<ExecOutput, ExecError> {
        if args.first().map(String::as_str) == Some("apply") {
            let mut open = self.open.lock().expect("gate lock");
            while !*open {
                open = self.opened.wait(open).expect("gate lock");
            }
        }
        self.cluster.execute(args)
    }
}

#[test]
fn relisted_node_ignores_work_from_its_previous_listing() -> Result<()> {
    let temp = TempDir::new()?;
    let config = NodecapConfig::default();
    let cluster = Arc::new(SimCluster::demo(&config).with_latency(Duration::ZERO));
    let gate = Arc::new(ApplyGate::new(Arc::clone(&cluster)));
    let sink = DirectorySink::new(temp.path().join("downloads"), "pcap");
    let mut orchestrator = Orchestrator::new(Dispatcher::new(Arc::clone(&gate), sink, &config));
    orchestrator.run(Intent::LoadNodes { refresh: false }, WAIT)?;
    orchestrator.run(Intent::CheckNode { node: node(NODE) }, WAIT)?;
    assert_eq!(orchestrator.submit(Intent::CreateDebugPod { node: node(NODE) })?, 1);

    cluster.remove_node(NODE);
    orchestrator.run(Intent::LoadNodes { refresh: true }, WAIT)?;
    assert!(orchestrator.state().node(NODE).is_none());
    assert_eq!(orchestrator.in_flight(), 0);

    cluster.add_node(NODE, &[], &["lo", "eth0"]);
    orchestrator.run(Intent::LoadNodes { refresh: true }, WAIT)?;
    assert_eq!(status(&orchestrator, NODE), NodeStatus::Unknown);
    assert_eq!(orchestrator.submit(Intent::CheckNode { node: node(NODE) })?, 1);
    assert_eq!(status(&orchestrator, NODE), NodeStatus::Checking);
    orchestrator.settle(WAIT)?;
    assert_eq!(status(&orchestrator, NODE), NodeStatus::Clean);

    gate.release();
    let deadline = Instant::now() + WAIT;
    while !cluster.calls().iter().any(|call| call[0] == "wait") && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    thread::sleep(Duration::from_millis(100));
    assert_eq!(orchestrator.poll(), 0, "late create response was folded");
    let entry = orchestrator.state().node(NODE).expect("listed");
    assert_eq!(entry.status(), NodeStatus::Clean);
    assert_eq!(entry.error_message(), None);
    assert_eq!(entry.status().allowed_operations(), &[NodeOperation::CreateDebugPod]);
    Ok(())
}

#[test]
fn exited_agent_is_offered_for_deletion() -> Result<()> {
    let temp = TempDir::new()?;
    let (cluster, mut orchestrator) = orchestrator(&temp);
    orchestrator.run(Intent::LoadNodes { refresh: false }, WAIT)?;
    cluster.install_agent(NODE);
    cluster.exit_agent(NODE, "Succeeded");

    orchestrator.run(Intent::CheckNode { node: node(NODE) }, WAIT)?;
    let entry = orchestrator.state().node(NODE).expect("listed");
    assert_eq!(entry.status(), NodeStatus::DebugPodRunning);
    assert!(entry.error_message().is_some_and(|message| message.contains("phase Succeeded")));

    orchestrator.run(Intent::DeleteDebugPod { node: node(NODE) }, WAIT)?;
    assert_eq!(status(&orchestrator, NODE), NodeStatus::Clean);
    assert!(!cluster.has_agent(NODE));
    orchestrator.run(Intent::CreateDebugPod { node: node(NODE) }, WAIT)?;
    assert_eq!(status(&orchestrator, NODE), NodeStatus::DebugPodRunning);
    Ok(())
}
