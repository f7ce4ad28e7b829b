// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Remote exec seam over the kubectl command-line transport.
// Author: Lukas Bower

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;

use log::debug;
use thiserror::Error;

use crate::config::KubectlConfig;

/// Raw outcome of one kubectl invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Process exit code; `-1` when terminated by a signal.
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: Vec<u8>,
    /// Captured standard error.
    pub stderr: String,
}

impl ExecOutput {
    /// Successful output carrying stdout.
    pub fn ok(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output carrying stderr.
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: Vec::new(),
            stderr: stderr.into(),
        }
    }

    /// Return true on a zero exit code.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Decode stdout as lossy UTF-8.
    #[must_use]
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Transport failure before an exit code was available.
#[derive(Debug, Error)]
pub enum ExecError {
    /// Process could not be spawned.
    #[error("failed to run {binary}: {source}")]
    Spawn {
        /// Binary that failed to start.
        binary: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
    /// Transport rejected the invocation outright.
    #[error("remote exec unavailable: {0}")]
    Unavailable(String),
    /// Streaming stdout to the local writer failed.
    #[error("failed to stream output of {binary}: {source}")]
    Stream {
        /// Binary whose output was being copied.
        binary: String,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}

/// Executes one kubectl invocation and returns its raw outcome.
pub trait RemoteExec: Send + Sync {
    /// Run kubectl with the given arguments.
    fn execute(&self, args: &[String]) -> Result<ExecOutput, ExecError>;

    /// Run kubectl and copy stdout into `out`; the returned output carries no stdout.
    fn execute_into(&self, args: &[String], out: &mut dyn Write) -> Result<ExecOutput, ExecError> {
        let mut output = self.execute(args)?;
        if output.success() {
            out.write_all(&output.stdout)
                .map_err(|source| ExecError::Stream {
                    binary: "remote exec".to_owned(),
                    source,
                })?;
        }
        output.stdout.clear();
        Ok(output)
    }
}

impl<T: RemoteExec + ?Sized> RemoteExec for Arc<T> {
    fn execute(&self, args: &[String]) -> Result<ExecOutput, ExecError> {
        (**self).execute(args)
    }

    fn execute_into(&self, args: &[String], out: &mut dyn Write) -> Result<ExecOutput, ExecError> {
        (**self).execute_into(args, out)
    }
}

/// Production transport spawning the kubectl binary.
#[derive(Debug, Clone)]
pub struct KubectlExec {
    binary: String,
    kubeconfig: Option<PathBuf>,
    context: Option<String>,
    request_timeout_secs: u64,
}

impl KubectlExec {
    /// Build a transport from configuration.
    #[must_use]
    pub fn new(config: &KubectlConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            kubeconfig: config.kubeconfig.clone(),
            context: config.context.clone(),
            request_timeout_secs: config.request_timeout_secs,
        }
    }

    /// Return the global arguments prefixed to every invocation.
    #[must_use]
    pub fn global_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(kubeconfig) = &self.kubeconfig {
            args.push(format!("--kubeconfig={}", kubeconfig.display()));
        }
        if let Some(context) = &self.context {
            args.push(format!("--context={context}"));
        }
        args.push(format!("--request-timeout={}s", self.request_timeout_secs));
        args
    }

    fn spawn_error(&self, source: io::Error) -> ExecError {
        ExecError::Spawn {
            binary: self.binary.clone(),
            source,
        }
    }
}

impl RemoteExec for KubectlExec {
    fn execute(&self, args: &[String]) -> Result<ExecOutput, ExecError> {
        let global = self.global_args();
        debug!("kubectl exec binary={} args={:?}", self.binary, args);
        let output = Command::new(&self.binary)
            .args(&global)
            .args(args)
            .output()
            .map_err(|source| self.spawn_error(source))?;
        let exit_code = output.status.code().unwrap_or(-1);
        debug!(
            "kubectl exit binary={} code={exit_code} stdout_bytes={}",
            self.binary,
            output.stdout.len()
        );
        Ok(ExecOutput {
            exit_code,
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        })
    }

    fn execute_into(&self, args: &[String], out: &mut dyn Write) -> Result<ExecOutput, ExecError> {
        let global = self.global_args();
        debug!("kubectl stream binary={} args={:?}", self.binary, args);
        let mut child = Command::new(&self.binary)
            .args(&global)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| self.spawn_error(source))?;
        // Drain stderr concurrently so a chatty child cannot block on a full pipe.
        let stderr = child.stderr.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut bytes = Vec::new();
                let _ = pipe.read_to_end(&mut bytes);
                bytes
            })
        });
        let copied = match child.stdout.take() {
            Some(mut pipe) => io::copy(&mut pipe, out),
            None => Ok(0),
        };
        if copied.is_err() {
            let _ = child.kill();
        }
        let status = child.wait().map_err(|source| self.spawn_error(source))?;
        let stderr = stderr
            .and_then(|reader| reader.join().ok())
            .unwrap_or_default();
        let copied = copied.map_err(|source| ExecError::Stream {
            binary: self.binary.clone(),
            source,
        })?;
        let exit_code = status.code().unwrap_or(-1);
        debug!(
            "kubectl exit binary={} code={exit_code} streamed_bytes={copied}",
            self.binary
        );
        Ok(ExecOutput {
            exit_code,
            stdout: Vec::new(),
            stderr: String::from_utf8_lossy(&stderr).trim().to_owned(),
        })
    }
}
