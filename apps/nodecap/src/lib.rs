// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Node-scoped packet capture orchestrator library.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Node-scoped packet capture orchestration.
//!
//! Operators issue [`Intent`]s; the [`CaptureState`] validates them against
//! each node's capture state machine and emits [`Command`]s. The
//! [`Orchestrator`] runs every command on its own worker thread through a
//! [`Dispatcher`], which turns it into kubectl invocations via a
//! [`RemoteExec`] and returns a typed [`Response`]. Responses are folded back
//! into the state in arrival order, so operations on different nodes proceed
//! concurrently while each node sees at most one status operation at a time.

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod exec;
pub mod lazy;
pub mod node;
pub mod orchestrator;
pub mod protocol;
pub mod shell;
pub mod sim;
pub mod sink;
pub mod state;
pub mod view;

pub use cache::{CacheError, NodeListDelta, ReferenceCache};
pub use config::{load_config, CaptureNaming, NodecapConfig};
pub use dispatch::{DispatchError, Dispatcher};
pub use exec::{ExecError, ExecOutput, KubectlExec, RemoteExec};
pub use lazy::Lazy;
pub use node::{
    CaptureFilters, CompletedCapture, DownloadStatus, NodeCaptureState, NodeOperation,
    NodeStatus, TransitionError,
};
pub use orchestrator::{Orchestrator, OrchestratorError};
pub use protocol::{AgentState, CaptureFile, Command, Intent, NodeCheck, PendingKey, Response};
pub use shell::{CommandStatus, Shell};
pub use sim::{SimCluster, SimOp};
pub use sink::{CaptureSink, DirectorySink};
pub use state::{update, CaptureState, IntentError};
pub use view::{NodeView, OrchestratorView};
