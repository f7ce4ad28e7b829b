// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Capture scenarios and the endpoint fragments they derive.
// Author: Lukas Bower

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{FilterError, FilterFragment};

/// Pod that can anchor a capture filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilterPod {
    /// Pod name.
    pub name: String,
    /// Pod IP address.
    pub ip: IpAddr,
}

impl FilterPod {
    /// Construct a filter pod.
    pub fn new(name: impl Into<String>, ip: IpAddr) -> Self {
        Self {
            name: name.into(),
            ip,
        }
    }
}

/// Packet direction for the single-pod scenario.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpecificPodDirection {
    /// Packets sent or received by the pod.
    #[default]
    SentAndReceived,
    /// Packets sent by the pod.
    Sent,
    /// Packets received by the pod.
    Received,
}

impl SpecificPodDirection {
    /// Render the canonical label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SentAndReceived => "sent-and-received",
            Self::Sent => "sent",
            Self::Received => "received",
        }
    }

    fn fragment(self, ip: IpAddr) -> FilterFragment {
        match self {
            Self::SentAndReceived => FilterFragment::Host { ip },
            Self::Sent => FilterFragment::Src { ip },
            Self::Received => FilterFragment::Dst { ip },
        }
    }
}

impl fmt::Display for SpecificPodDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SpecificPodDirection {
    type Err = FilterError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sent-and-received" | "both" => Ok(Self::SentAndReceived),
            "sent" => Ok(Self::Sent),
            "received" => Ok(Self::Received),
            other => Err(FilterError::UnknownDirection(other.to_owned())),
        }
    }
}

/// Packet direction for the two-pod scenario.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TwoPodsDirection {
    /// Packets in either direction between the pods.
    #[default]
    Bidirectional,
    /// Packets from the source pod to the destination pod.
    SourceToDestination,
}

impl TwoPodsDirection {
    /// Render the canonical label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bidirectional => "bidirectional",
            Self::SourceToDestination => "source-to-destination",
        }
    }
}

impl fmt::Display for TwoPodsDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TwoPodsDirection {
    type Err = FilterError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "bidirectional" | "both" => Ok(Self::Bidirectional),
            "source-to-destination" | "src-to-dst" => Ok(Self::SourceToDestination),
            other => Err(FilterError::UnknownDirection(other.to_owned())),
        }
    }
}

/// One side of the two-pod scenario: a node and a pod chosen from it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodEndpoint {
    /// Node the pod is chosen from.
    pub node: Option<String>,
    /// Selected pod.
    pub pod: Option<FilterPod>,
}

impl PodEndpoint {
    /// Select a node; a changed node discards the pod chosen from the old one.
    pub fn select_node(&mut self, node: Option<String>) {
        if self.node != node {
            self.pod = None;
        }
        self.node = node;
    }
}

/// Which side of the two-pod scenario an edit addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndpointRole {
    /// Source endpoint.
    Source,
    /// Destination endpoint.
    Destination,
}

impl FromStr for EndpointRole {
    type Err = FilterError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "source" | "src" => Ok(Self::Source),
            "destination" | "dst" => Ok(Self::Destination),
            other => Err(FilterError::UnknownEndpoint(other.to_owned())),
        }
    }
}

/// Scenario discriminant used when switching scenarios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScenarioKind {
    /// Traffic to and from one pod.
    SpecificPod,
    /// Traffic between two pods.
    TwoPods,
}

impl ScenarioKind {
    /// Render the canonical label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SpecificPod => "specific-pod",
            Self::TwoPods => "two-pods",
        }
    }
}

impl fmt::Display for ScenarioKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScenarioKind {
    type Err = FilterError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "specific-pod" | "pod" => Ok(Self::SpecificPod),
            "two-pods" | "pods" => Ok(Self::TwoPods),
            other => Err(FilterError::UnknownScenario(other.to_owned())),
        }
    }
}

/// Declarative capture scenario; each variant owns only its own selections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum CaptureScenario {
    /// Traffic to and from one pod on the capture node.
    SpecificPod {
        /// Selected pod, if any.
        pod: Option<FilterPod>,
        /// Packet direction relative to the pod.
        direction: SpecificPodDirection,
    },
    /// Traffic between two pods, possibly on different nodes.
    TwoPods {
        /// Source endpoint.
        source: PodEndpoint,
        /// Destination endpoint.
        destination: PodEndpoint,
        /// Packet direction between the endpoints.
        direction: TwoPodsDirection,
    },
}

impl Default for CaptureScenario {
    fn default() -> Self {
        Self::empty(ScenarioKind::SpecificPod)
    }
}

impl CaptureScenario {
    /// Return a scenario of the given kind with nothing selected.
    #[must_use]
    pub fn empty(kind: ScenarioKind) -> Self {
        match kind {
            ScenarioKind::SpecificPod => Self::SpecificPod {
                pod: None,
                direction: SpecificPodDirection::default(),
            },
            ScenarioKind::TwoPods => Self::TwoPods {
                source: PodEndpoint::default(),
                destination: PodEndpoint::default(),
                direction: TwoPodsDirection::default(),
            },
        }
    }

    /// Return the scenario discriminant.
    #[must_use]
    pub fn kind(&self) -> ScenarioKind {
        match self {
            Self::SpecificPod { .. } => ScenarioKind::SpecificPod,
            Self::TwoPods { .. } => ScenarioKind::TwoPods,
        }
    }

    /// Derive endpoint fragments; unselected pods contribute nothing.
    #[must_use]
    pub fn fragments(&self) -> Vec<FilterFragment> {
        match self {
            Self::SpecificPod { pod, direction } => pod
                .iter()
                .map(|pod| direction.fragment(pod.ip))
                .collect(),
            Self::TwoPods {
                source,
                destination,
                direction,
            } => {
                let mut fragments = Vec::with_capacity(2);
                if let Some(pod) = &source.pod {
                    fragments.push(match direction {
                        TwoPodsDirection::Bidirectional => FilterFragment::Host { ip: pod.ip },
                        TwoPodsDirection::SourceToDestination => {
                            FilterFragment::Src { ip: pod.ip }
                        }
                    });
                }
                if let Some(pod) = &destination.pod {
                    fragments.push(match direction {
                        TwoPodsDirection::Bidirectional => FilterFragment::Host { ip: pod.ip },
                        TwoPodsDirection::SourceToDestination => {
                            FilterFragment::Dst { ip: pod.ip }
                        }
                    });
                }
                fragments
            }
        }
    }
}
