// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Explicit three-state lazy cell used by the reference data cache.
// Author: Lukas Bower

use serde::{Deserialize, Serialize};

/// A value fetched on demand: not loaded, loading, or loaded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "kebab-case")]
pub enum Lazy<T> {
    /// No request has been issued (or the last one failed).
    #[default]
    NotLoaded,
    /// A request is outstanding.
    Loading,
    /// The latest response.
    Loaded(T),
}

impl<T> Lazy<T> {
    /// Return true when no request is outstanding and nothing is cached.
    #[must_use]
    pub fn is_not_loaded(&self) -> bool {
        matches!(self, Self::NotLoaded)
    }

    /// Return true while a request is outstanding.
    #[must_use]
    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading)
    }

    /// Borrow the loaded value.
    #[must_use]
    pub fn loaded(&self) -> Option<&T> {
        match self {
            Self::Loaded(value) => Some(value),
            Self::NotLoaded | Self::Loading => None,
        }
    }

    /// Move to `Loading` if not loaded; returns whether a request should be issued.
    pub fn begin_load(&mut self) -> bool {
        if self.is_not_loaded() {
            *self = Self::Loading;
            true
        } else {
            false
        }
    }

    /// Replace the cell wholesale with a loaded value.
    pub fn complete(&mut self, value: T) {
        *self = Self::Loaded(value);
    }

    /// Reset to `NotLoaded` so a later access re-requests.
    pub fn invalidate(&mut self) {
        *self = Self::NotLoaded;
    }

    /// Drop a loaded value; an outstanding request keeps the cell loading.
    pub fn discard(&mut self) {
        if self.loaded().is_some() {
            self.invalidate();
        }
    }

    /// Render the state label.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::NotLoaded => "not-loaded",
            Self::Loading => "loading",
            Self::Loaded(_) => "loaded",
        }
    }
}
