// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Pure capture filter predicate builder shared by nodecap components.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Capture filter predicate builder.
//!
//! A [`CaptureScenario`] plus an optional [`ApplicationProtocol`] is turned
//! into an ordered list of [`FilterFragment`]s. Building is pure and total:
//! missing selections simply produce fewer fragments, so callers can always
//! render a live preview of the eventual tcpdump filter.

mod fragment;
mod protocol;
mod scenario;

pub use fragment::{join_fragments, FilterFragment, FRAGMENT_SEPARATOR};
pub use protocol::{ApplicationProtocol, TransportProtocol};
pub use scenario::{
    CaptureScenario, EndpointRole, FilterPod, PodEndpoint, ScenarioKind, SpecificPodDirection,
    TwoPodsDirection,
};

use thiserror::Error;

/// Errors raised while parsing filter labels.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    /// Direction label is not recognised.
    #[error("unknown packet direction '{0}'")]
    UnknownDirection(String),
    /// Scenario label is not recognised.
    #[error("unknown capture scenario '{0}'")]
    UnknownScenario(String),
    /// Endpoint label is not recognised.
    #[error("unknown endpoint '{0}' (use source or destination)")]
    UnknownEndpoint(String),
    /// Protocol name is not recognised.
    #[error("unknown application protocol '{0}'")]
    UnknownProtocol(String),
    /// Transport label is not recognised.
    #[error("unknown transport '{0}'")]
    UnknownTransport(String),
    /// Port is not a non-zero 16-bit number.
    #[error("invalid port '{0}'")]
    InvalidPort(String),
}

/// Build the ordered fragment list: endpoint fragments first, then the protocol.
#[must_use]
pub fn build_fragments(
    scenario: &CaptureScenario,
    protocol: Option<&ApplicationProtocol>,
) -> Vec<FilterFragment> {
    let mut fragments = scenario.fragments();
    fragments.extend(protocol.map(ApplicationProtocol::fragment));
    fragments
}

/// Build and join fragments into a tcpdump filter expression.
#[must_use]
pub fn render_filter(
    scenario: &CaptureScenario,
    protocol: Option<&ApplicationProtocol>,
) -> String {
    join_fragments(&build_fragments(scenario, protocol))
}
