// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Single-owner orchestrator dispatching commands on worker threads.
// Author: Lukas Bower

use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use thiserror::Error;

use crate::dispatch::Dispatcher;
use crate::exec::RemoteExec;
use crate::protocol::{Command, Intent, PendingKey, Response};
use crate::sink::CaptureSink;
use crate::state::{CaptureState, IntentError};
use crate::view::OrchestratorView;

/// Errors surfaced by the orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Intent rejected by validation.
    #[error(transparent)]
    Intent(#[from] IntentError),
    /// Operations still outstanding after the wait deadline.
    #[error("{pending} operation(s) still in flight after {waited:?}")]
    Timeout {
        /// Outstanding operation count.
        pending: usize,
        /// Time waited.
        waited: Duration,
    },
}

/// Worker response tagged with the ticket it was dispatched under.
type Delivery = (u64, Response);

#[derive(Debug)]
struct InFlight {
    ticket: u64,
    command: Command,
}

/// Owns the aggregate state and runs remote operations concurrently.
///
/// Every dispatched command carries a ticket. A response is folded only while
/// its ticket is still the outstanding one for its key, so work retired when a
/// node leaves the node list can never land on a re-listed node of the same name.
pub struct Orchestrator<E, S> {
    state: CaptureState,
    dispatcher: Arc<Dispatcher<E, S>>,
    outstanding: BTreeMap<PendingKey, InFlight>,
    next_ticket: u64,
    sender: Sender<Delivery>,
    receiver: Receiver<Delivery>,
}

impl<E, S> Orchestrator<E, S>
where
    E: RemoteExec + 'static,
    S: CaptureSink + 'static,
{
    /// Create an orchestrator with empty state.
    pub fn new(dispatcher: Dispatcher<E, S>) -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            state: CaptureState::new(),
            dispatcher: Arc::new(dispatcher),
            outstanding: BTreeMap::new(),
            next_ticket: 0,
            sender,
            receiver,
        }
    }

    /// Return the aggregate state.
    #[must_use]
    pub fn state(&self) -> &CaptureState {
        &self.state
    }

    /// Return the dispatcher.
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher<E, S> {
        &self.dispatcher
    }

    /// Return the number of outstanding remote operations.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.outstanding.len()
    }

    /// Return the outstanding operation keys.
    pub fn outstanding(&self) -> impl Iterator<Item = &PendingKey> + '_ {
        self.outstanding.keys()
    }

    /// Project the current state for rendering.
    #[must_use]
    pub fn view(&self) -> OrchestratorView {
        OrchestratorView::project(&self.state, self.in_flight())
    }

    /// Validate an intent and dispatch its commands; returns the dispatch count.
    pub fn submit(&mut self, intent: Intent) -> Result<usize, OrchestratorError> {
        let commands = self.state.apply_intent(&intent)?;
        let mut dispatched = 0;
        for command in commands {
            if self.spawn(command) {
                dispatched += 1;
            }
        }
        Ok(dispatched)
    }

    fn spawn(&mut self, command: Command) -> bool {
        let key = command.key();
        if self.outstanding.contains_key(&key) {
            error!(
                "dispatch refused command={} key={key:?} reason=already-in-flight",
                command.label()
            );
            // Roll the originating transition back so the node is never left transient.
            self.state
                .apply_response(Response::failed(&command, "operation already in flight"));
            return false;
        }
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        let dispatcher = Arc::clone(&self.dispatcher);
        let sender = self.sender.clone();
        let job = command.clone();
        let spawned = thread::Builder::new()
            .name(format!("nodecap-{}", command.label()))
            .spawn(move || {
                let response = dispatcher.dispatch(&job);
                if sender.send((ticket, response)).is_err() {
                    debug!(
                        "response dropped command={} ticket={ticket} reason=orchestrator-gone",
                        job.label()
                    );
                }
            });
        match spawned {
            Ok(_) => {
                debug!(
                    "dispatch spawned command={} key={key:?} ticket={ticket}",
                    command.label()
                );
                self.outstanding.insert(key, InFlight { ticket, command });
                true
            }
            Err(err) => {
                warn!("dispatch spawn failed command={} error={err}", command.label());
                let message = format!("failed to start worker: {err}");
                self.state.apply_response(Response::failed(&command, message));
                false
            }
        }
    }

    fn fold(&mut self, (ticket, response): Delivery) -> bool {
        let key = response.key();
        match self.outstanding.get(&key) {
            Some(in_flight) if in_flight.ticket == ticket => {
                self.outstanding.remove(&key);
            }
            _ => {
                debug!("response dropped key={key:?} ticket={ticket} reason=retired");
                return false;
            }
        }
        let relisted = matches!(response, Response::NodesDiscovered { result: Ok(_) });
        self.state.apply_response(response);
        if relisted {
            self.retire_unlisted();
        }
        true
    }

    // A removed node's state is gone; its outstanding work must not outlive it.
    fn retire_unlisted(&mut self) {
        let state = &self.state;
        self.outstanding.retain(|key, in_flight| {
            let Some(node) = in_flight.command.node() else {
                return true;
            };
            let listed = state.node(node).is_some();
            if !listed {
                info!(
                    "operation retired command={} key={key:?} ticket={} reason=node-removed",
                    in_flight.command.label(),
                    in_flight.ticket
                );
            }
            listed
        });
    }

    /// Fold every response already delivered; returns the count folded.
    pub fn poll(&mut self) -> usize {
        let mut folded = 0;
        while let Ok(delivery) = self.receiver.try_recv() {
            if self.fold(delivery) {
                folded += 1;
            }
        }
        folded
    }

    /// Block up to `timeout` for at least one response, then drain; returns the count.
    pub fn wait(&mut self, timeout: Duration) -> usize {
        if self.outstanding.is_empty() {
            return self.poll();
        }
        match self.receiver.recv_timeout(timeout) {
            Ok(delivery) => usize::from(self.fold(delivery)) + self.poll(),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => 0,
        }
    }

    /// Fold responses until nothing is outstanding or `timeout` elapses.
    pub fn settle(&mut self, timeout: Duration) -> Result<(), OrchestratorError> {
        let start = Instant::now();
        self.poll();
        while !self.outstanding.is_empty() {
            let waited = start.elapsed();
            let Some(remaining) = timeout.checked_sub(waited) else {
                return Err(OrchestratorError::Timeout {
                    pending: self.outstanding.len(),
                    waited,
                });
            };
            self.wait(remaining);
        }
        Ok(())
    }

    /// Submit an intent and settle all resulting operations.
    pub fn run(&mut self, intent: Intent, timeout: Duration) -> Result<(), OrchestratorError> {
        self.submit(intent)?;
        self.settle(timeout)
    }
}
