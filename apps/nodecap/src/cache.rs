// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Lazily populated node list and per-node pod reference data.
// Author: Lukas Bower

use std::collections::{BTreeMap, BTreeSet};

use log::debug;
use nodecap_filter::FilterPod;
use thiserror::Error;

use crate::lazy::Lazy;

/// Rejection of a cache load request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// Node is not in the discovered node list.
    #[error("node '{0}' is not in the discovered node list")]
    UnknownNode(String),
}

/// Change to the node list produced by a discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeListDelta {
    /// Newly listed nodes.
    pub added: Vec<String>,
    /// Nodes no longer listed.
    pub removed: Vec<String>,
}

/// Reference data tree: the node list and each node's candidate pods.
#[derive(Debug, Clone, Default)]
pub struct ReferenceCache {
    nodes: Lazy<Vec<String>>,
    filter_pods: BTreeMap<String, Lazy<Vec<FilterPod>>>,
}

impl ReferenceCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the node list cell.
    #[must_use]
    pub fn nodes(&self) -> &Lazy<Vec<String>> {
        &self.nodes
    }

    /// Return true when the node appeared in the latest successful discovery.
    #[must_use]
    pub fn is_listed(&self, node: &str) -> bool {
        self.filter_pods.contains_key(node)
    }

    /// Iterate listed node names in order.
    pub fn listed(&self) -> impl Iterator<Item = &str> {
        self.filter_pods.keys().map(String::as_str)
    }

    /// Return the pod cell for a listed node.
    #[must_use]
    pub fn filter_pods(&self, node: &str) -> Option<&Lazy<Vec<FilterPod>>> {
        self.filter_pods.get(node)
    }

    /// Find a loaded pod by name on a node.
    #[must_use]
    pub fn find_pod(&self, node: &str, pod: &str) -> Option<&FilterPod> {
        self.filter_pods
            .get(node)?
            .loaded()?
            .iter()
            .find(|candidate| candidate.name == pod)
    }

    /// Mark the node list loading; returns whether a request should be issued.
    pub fn begin_nodes(&mut self, refresh: bool) -> bool {
        if refresh {
            self.nodes.discard();
        }
        self.nodes.begin_load()
    }

    /// Fold a node discovery outcome; `None` when no request was outstanding.
    pub fn resolve_nodes(
        &mut self,
        result: Result<Vec<String>, String>,
    ) -> Option<Result<NodeListDelta, String>> {
        if !self.nodes.is_loading() {
            debug!("cache nodes response dropped state={}", self.nodes.label());
            return None;
        }
        let names = match result {
            Ok(names) => names,
            Err(message) => {
                self.nodes.invalidate();
                return Some(Err(message));
            }
        };
        let listed: BTreeSet<String> = names.into_iter().filter(|name| !name.is_empty()).collect();
        let mut delta = NodeListDelta::default();
        self.filter_pods.retain(|name, _| {
            let keep = listed.contains(name);
            if !keep {
                delta.removed.push(name.clone());
            }
            keep
        });
        for cell in self.filter_pods.values_mut() {
            cell.discard();
        }
        for name in &listed {
            if !self.filter_pods.contains_key(name) {
                self.filter_pods.insert(name.clone(), Lazy::NotLoaded);
                delta.added.push(name.clone());
            }
        }
        debug!(
            "cache nodes loaded count={} added={} removed={}",
            listed.len(),
            delta.added.len(),
            delta.removed.len()
        );
        self.nodes.complete(listed.into_iter().collect());
        Some(Ok(delta))
    }

    /// Mark a node's pods loading; returns whether a request should be issued.
    pub fn begin_pods(&mut self, node: &str, refresh: bool) -> Result<bool, CacheError> {
        let cell = self
            .filter_pods
            .get_mut(node)
            .ok_or_else(|| CacheError::UnknownNode(node.to_owned()))?;
        if refresh {
            cell.discard();
        }
        Ok(cell.begin_load())
    }

    /// Fold a pod discovery outcome; `None` when dropped.
    pub fn resolve_pods(
        &mut self,
        node: &str,
        result: Result<Vec<FilterPod>, String>,
    ) -> Option<Result<usize, String>> {
        let Some(cell) = self.filter_pods.get_mut(node) else {
            debug!("cache pods response dropped node={node} reason=unlisted");
            return None;
        };
        if !cell.is_loading() {
            debug!("cache pods response dropped node={node} state={}", cell.label());
            return None;
        }
        match result {
            Ok(pods) => {
                let count = pods.len();
                debug!("cache pods loaded node={node} count={count}");
                cell.complete(pods);
                Some(Ok(count))
            }
            Err(message) => {
                cell.invalidate();
                Some(Err(message))
            }
        }
    }
}
