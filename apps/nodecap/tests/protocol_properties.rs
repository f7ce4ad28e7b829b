// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Explore intent and response interleavings and assert the capture protocol invariants.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::path::PathBuf;

use nodecap::{
    AgentState, CaptureFile, CaptureState, Command, Intent, NodeCheck, OrchestratorView,
    PendingKey, Response,
};
use nodecap_filter::{FilterPod, ScenarioKind};

const EXHAUSTIVE_DEPTH: usize = 4;
const WALKS: u64 = 200;
const WALK_STEPS: usize = 80;

#[derive(Clone)]
struct Model {
    state: CaptureState,
    pending: Vec<Command>,
    universe: Vec<String>,
    nodes: Vec<String>,
}

#[derive(Debug, Clone)]
enum Step {
    Intent(Intent),
    /// Drop a node from the cluster listing, or restore it.
    Toggle(String),
    Resolve { index: usize, outcome: Outcome },
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Fail,
    Succeed(u8),
}

impl Model {
    fn listed(nodes: &[&str]) -> Self {
        let nodes: Vec<String> = nodes.iter().map(|node| (*node).to_owned()).collect();
        let mut model = Self {
            state: CaptureState::new(),
            pending: Vec::new(),
            universe: nodes.clone(),
            nodes: nodes.clone(),
        };
        model.apply(&Step::Intent(Intent::LoadNodes { refresh: false }));
        model.apply(&Step::Resolve {
            index: 0,
            outcome: Outcome::Succeed(0),
        });
        assert_eq!(model.state.nodes().len(), nodes.len());
        model
    }

    fn view(&self) -> OrchestratorView {
        OrchestratorView::project(&self.state, self.pending.len())
    }

    fn apply(&mut self, step: &Step) {
        match step {
            Step::Intent(intent) => {
                let before = self.view();
                match self.state.apply_intent(intent) {
                    Ok(commands) => {
                        for command in commands {
                            let key = command.key();
                            assert!(
                                self.pending.iter().all(|pending| pending.key() != key),
                                "duplicate outstanding key {key:?} after {intent:?}"
                            );
                            self.pending.push(command);
                        }
                    }
                    Err(err) => {
                        assert_eq!(
                            before,
                            self.view(),
                            "rejected {intent:?} ({err}) mutated state"
                        );
                    }
                }
            }
            Step::Toggle(node) => {
                if self.nodes.contains(node) {
                    self.nodes.retain(|listed| listed != node);
                } else {
                    let universe = &self.universe;
                    self.nodes.push(node.clone());
                    self.nodes.sort_by_key(|listed| universe.iter().position(|n| n == listed));
                }
            }
            Step::Resolve { index, outcome } => {
                let command = self.pending.remove(*index);
                let response = self.respond(&command, *outcome);
                let relisted = matches!(response, Response::NodesDiscovered { result: Ok(_) });
                self.state.apply_response(response);
                if relisted {
                    self.retire_unlisted();
                }
            }
        }
    }

    // Responses for retired commands never reach the state.
    fn retire_unlisted(&mut self) {
        let state = &self.state;
        self.pending
            .retain(|command| command.node().map_or(true, |node| state.node(node).is_some()));
    }

    fn respond(&self, command: &Command, outcome: Outcome) -> Response {
        let Outcome::Succeed(variant) = outcome else {
            return Response::failed(command, "simulated failure");
        };
        match command.clone() {
            Command::DiscoverNodes => Response::NodesDiscovered {
                result: Ok(self.nodes.clone()),
            },
            Command::DiscoverPods { node } => Response::PodsDiscovered {
                node,
                result: Ok(vec![FilterPod::new(
                    "web",
                    "10.244.0.12".parse().expect("ip"),
                )]),
            },
            Command::DiscoverInterfaces { node } => Response::InterfacesDiscovered {
                node,
                result: Ok(vec!["eth0".to_owned()]),
            },
            Command::CheckNode { node } => {
                let agent = match variant % 3 {
                    0 => AgentState::Absent,
                    1 => AgentState::Running,
                    _ => AgentState::Capturing {
                        capture: "found".to_owned(),
                    },
                };
                Response::NodeChecked {
                    node,
                    result: Ok(NodeCheck {
                        agent,
                        captures: vec![
                            CaptureFile {
                                name: "found".to_owned(),
                                size_kb: 1,
                            },
                            CaptureFile {
                                name: "old".to_owned(),
                                size_kb: 7,
                            },
                        ],
                    }),
                }
            }
            Command::CreateDebugPod { node } => Response::DebugPodCreated { node, result: Ok(()) },
            Command::DeleteDebugPod { node } => Response::DebugPodDeleted { node, result: Ok(()) },
            Command::StartCapture { node, capture, .. } => Response::CaptureStarted {
                node,
                capture,
                result: Ok(()),
            },
            Command::StopCapture { node, capture } => Response::CaptureStopped {
                node,
                capture: capture.clone(),
                result: Ok(CaptureFile {
                    name: capture,
                    size_kb: 42,
                }),
            },
            Command::DownloadCapture { node, capture, .. } => {
                let path = PathBuf::from(format!("/downloads/{node}/{capture}.pcap"));
                Response::CaptureDownloaded {
                    node,
                    capture,
                    result: Ok(path),
                }
            }
        }
    }

    fn steps(&self) -> Vec<Step> {
        let mut steps = Vec::new();
        steps.push(Step::Intent(Intent::LoadNodes { refresh: true }));
        for node in &self.universe {
            steps.push(Step::Toggle(node.clone()));
            for intent in node_intents(node) {
                steps.push(Step::Intent(intent));
            }
        }
        for index in 0..self.pending.len() {
            steps.push(Step::Resolve {
                index,
                outcome: Outcome::Fail,
            });
            let variants = match self.pending[index] {
                Command::CheckNode { .. } => 3,
                _ => 1,
            };
            for variant in 0..variants {
                steps.push(Step::Resolve {
                    index,
                    outcome: Outcome::Succeed(variant),
                });
            }
        }
        steps
    }

    fn check(&self, trail: &[Step]) {
        assert!(self.state.invariants_hold(), "capture name invariant broken after {trail:?}");
        let keys: BTreeSet<PendingKey> = self.pending.iter().map(Command::key).collect();
        assert_eq!(keys.len(), self.pending.len(), "duplicate keys after {trail:?}");
        for command in &self.pending {
            if let Some(node) = command.node() {
                assert!(
                    self.state.node(node).is_some(),
                    "{command:?} outstanding for unlisted node after {trail:?}"
                );
            }
        }
        for (name, entry) in self.state.nodes() {
            let outstanding = keys.contains(&PendingKey::Status(name.clone()));
            assert_eq!(
                entry.status().is_transient(),
                outstanding,
                "node {name} status {} with outstanding={outstanding} after {trail:?}",
                entry.status()
            );
            let loading = keys.contains(&PendingKey::Interfaces(name.clone()));
            assert_eq!(
                entry.capture_interfaces().is_loading(),
                loading,
                "node {name} interfaces {} with outstanding={loading} after {trail:?}",
                entry.capture_interfaces().label()
            );
            let pods_loading = self
                .state
                .cache()
                .filter_pods(name)
                .is_some_and(|cell| cell.is_loading());
            assert_eq!(
                pods_loading,
                keys.contains(&PendingKey::Pods(name.clone())),
                "node {name} pod cell after {trail:?}"
            );
            let mut names = BTreeSet::new();
            for capture in entry.completed_captures() {
                assert!(names.insert(capture.name.as_str()), "duplicate capture after {trail:?}");
                let downloading = keys.contains(&PendingKey::Download {
                    node: name.clone(),
                    capture: capture.name.clone(),
                });
                assert_eq!(
                    capture.download_status == nodecap::DownloadStatus::Downloading,
                    downloading,
                    "capture {} download state after {trail:?}",
                    capture.name
                );
            }
        }
    }
}

fn node_intents(node: &str) -> Vec<Intent> {
    let node = node.to_owned();
    vec![
        Intent::LoadPods {
            node: node.clone(),
            refresh: false,
        },
        Intent::LoadInterfaces {
            node: node.clone(),
            refresh: true,
        },
        Intent::CheckNode { node: node.clone() },
        Intent::CreateDebugPod { node: node.clone() },
        Intent::DeleteDebugPod { node: node.clone() },
        Intent::StartCapture {
            node: node.clone(),
            capture: "cap".to_owned(),
        },
        Intent::StopCapture { node: node.clone() },
        Intent::DownloadCapture {
            node: node.clone(),
            capture: "cap".to_owned(),
            destination: None,
        },
        Intent::SelectScenario {
            node: node.clone(),
            scenario: ScenarioKind::TwoPods,
        },
        Intent::SelectPod {
            node,
            pod: Some("web".to_owned()),
        },
    ]
}

fn explore(model: &Model, trail: &mut Vec<Step>, depth: usize, visited: &mut usize) {
    model.check(trail);
    *visited += 1;
    if depth == 0 {
        return;
    }
    for step in model.steps() {
        let mut next = model.clone();
        next.apply(&step);
        trail.push(step);
        explore(&next, trail, depth - 1, visited);
        trail.pop();
    }
}

#[test]
fn exhaustive_single_node_interleavings_keep_invariants() {
    let model = Model::listed(&["n0"]);
    let mut visited = 0;
    explore(&model, &mut Vec::new(), EXHAUSTIVE_DEPTH, &mut visited);
    assert!(visited > 1_000, "explored only {visited} states");
}

struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        self.0 >> 33
    }

    fn below(&mut self, bound: usize) -> usize {
        (self.next() % bound as u64) as usize
    }
}

#[test]
fn random_multi_node_walks_keep_invariants() {
    for seed in 0..WALKS {
        let mut rng = Lcg(seed);
        let mut model = Model::listed(&["n0", "n1", "n2"]);
        let mut trail = Vec::new();
        for _ in 0..WALK_STEPS {
            let steps = model.steps();
            let step = steps[rng.below(steps.len())].clone();
            model.apply(&step);
            trail.push(step);
            model.check(&trail);
        }
        model.nodes = model.universe.clone();
        model.apply(&Step::Intent(Intent::LoadNodes { refresh: true }));
        while !model.pending.is_empty() {
            let step = Step::Resolve {
                index: 0,
                outcome: Outcome::Succeed(1),
            };
            model.apply(&step);
            trail.push(step);
            model.check(&trail);
        }
        assert_eq!(model.state.nodes().len(), 3, "seed {seed} lost a node");
        for entry in model.state.nodes().values() {
            assert!(!entry.status().is_transient(), "seed {seed} left a transient status");
        }
    }
}

#[test]
fn full_lifecycle_reaches_downloaded_capture() {
    let mut model = Model::listed(&["n0"]);
    let script = [
        Intent::CheckNode { node: "n0".to_owned() },
        Intent::CreateDebugPod { node: "n0".to_owned() },
        Intent::StartCapture {
            node: "n0".to_owned(),
            capture: "cap".to_owned(),
        },
        Intent::StopCapture { node: "n0".to_owned() },
        Intent::DownloadCapture {
            node: "n0".to_owned(),
            capture: "cap".to_owned(),
            destination: None,
        },
    ];
    for intent in script {
        model.apply(&Step::Intent(intent));
        assert_eq!(model.pending.len(), 1);
        model.apply(&Step::Resolve {
            index: 0,
            outcome: Outcome::Succeed(0),
        });
        model.check(&[]);
    }
    let entry = model.state.node("n0").expect("node");
    let captured: Vec<_> = entry
        .completed_captures()
        .iter()
        .map(|capture| (capture.name.as_str(), capture.download_status))
        .collect();
    assert_eq!(
        captured,
        vec![
            ("found", nodecap::DownloadStatus::Completed),
            ("old", nodecap::DownloadStatus::Completed),
            ("cap", nodecap::DownloadStatus::Downloaded),
        ]
    );
}

#[test]
fn relisted_node_starts_clean_after_retired_work() {
    let mut model = Model::listed(&["n0", "n1"]);
    model.apply(&Step::Intent(Intent::CheckNode { node: "n0".to_owned() }));
    model.apply(&Step::Intent(Intent::CheckNode { node: "n1".to_owned() }));
    assert_eq!(model.pending.len(), 2);

    model.apply(&Step::Toggle("n0".to_owned()));
    model.apply(&Step::Intent(Intent::LoadNodes { refresh: true }));
    let refresh = model.pending.len() - 1;
    model.apply(&Step::Resolve {
        index: refresh,
        outcome: Outcome::Succeed(0),
    });
    model.check(&[]);
    assert!(model.state.node("n0").is_none());
    assert_eq!(model.pending, vec![Command::CheckNode { node: "n1".to_owned() }]);

    model.apply(&Step::Toggle("n0".to_owned()));
    model.apply(&Step::Intent(Intent::LoadNodes { refresh: true }));
    model.apply(&Step::Resolve {
        index: 1,
        outcome: Outcome::Succeed(0),
    });
    model.check(&[]);
    let relisted = model.state.node("n0").expect("relisted");
    assert_eq!(relisted.status(), nodecap::NodeStatus::Unknown);
    assert_eq!(relisted.error_message(), None);

    model.apply(&Step::Intent(Intent::CheckNode { node: "n0".to_owned() }));
    assert_eq!(model.pending.len(), 2, "relisted node refused a fresh check");
    model.check(&[]);
}
