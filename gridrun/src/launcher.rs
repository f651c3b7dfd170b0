// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Worker provisioning. A launcher starts exactly one worker process whose
//! command line carries the master address, the service id and a log file
//! path, and hands back an opaque job handle. Batch-scheduler adapters
//! live outside this crate and implement the same trait; the in-tree
//! [`ProcessLauncher`] forks the worker locally.

use crate::hold::HoldMap;
use crate::model::{NodeId, ServiceId};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// How long a cancelled job may keep running after `ShutDown` before the
/// process is killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to spawn worker process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("worker launch failed: {0}")]
    Other(String),
}

/// Opaque handle to a launched job. Cancelling reclaims the underlying
/// compute; implementations must also reclaim on drop so an abnormal scope
/// exit cannot leak a worker.
#[async_trait]
pub trait JobHandle: Send {
    /// Scheduler-assigned identifier, for operator logs.
    fn id(&self) -> String;

    async fn cancel(&mut self) -> Result<(), LaunchError>;
}

/// Provisions workers for remote-run scopes.
///
/// Contract: `launch` starts exactly one worker that will register with
/// `master` under `service_id`, and returns while the worker is running.
/// The launcher is not responsible for the handshake or for detecting a
/// silent worker; the runner enforces its own connect timeout.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(
        &self,
        master: &NodeId,
        service_id: &ServiceId,
    ) -> Result<Box<dyn JobHandle>, LaunchError>;

    /// How long the runner waits for the worker's registration. `None`
    /// waits forever.
    fn connect_timeout(&self) -> Option<Duration> {
        None
    }

    /// When present, failed scopes park under their service id instead of
    /// propagating the error, and retry once an operator releases them.
    fn hold_map(&self) -> Option<Arc<HoldMap>> {
        None
    }
}

/// Runs workers as local child processes of the master: the reference
/// launcher for single-host programs and the model for external adapters.
pub struct ProcessLauncher {
    executable: PathBuf,
    log_dir: PathBuf,
    advertise_host: String,
    connect_timeout: Option<Duration>,
    hold_map: Option<Arc<HoldMap>>,
}

impl ProcessLauncher {
    pub fn new(executable: PathBuf, log_dir: PathBuf) -> Self {
        Self {
            executable,
            log_dir,
            advertise_host: "127.0.0.1".to_string(),
            connect_timeout: None,
            hold_map: None,
        }
    }

    pub fn with_advertise_host(mut self, host: impl Into<String>) -> Self {
        self.advertise_host = host.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_hold_map(mut self, hold_map: Arc<HoldMap>) -> Self {
        self.hold_map = Some(hold_map);
        self
    }

    pub fn log_file(&self, service_id: &ServiceId) -> PathBuf {
        self.log_dir.join(format!("worker-{service_id}.log"))
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(
        &self,
        master: &NodeId,
        service_id: &ServiceId,
    ) -> Result<Box<dyn JobHandle>, LaunchError> {
        tokio::fs::create_dir_all(&self.log_dir).await?;
        let log_file = self.log_file(service_id);

        let mut child = Command::new(&self.executable)
            .arg("worker")
            .arg("--master-address")
            .arg(master.to_string())
            .arg("--service")
            .arg(service_id.to_string())
            .arg("--log-file")
            .arg(&log_file)
            .arg("--advertise-host")
            .arg(&self.advertise_host)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        forward_output(service_id, &mut child);

        let pid = child.id();
        debug!(service = %service_id, ?pid, executable = %self.executable.display(), "worker process spawned");

        Ok(Box::new(ProcessJob {
            label: pid.map_or_else(|| format!("worker-{service_id}"), |pid| pid.to_string()),
            child,
        }))
    }

    fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    fn hold_map(&self) -> Option<Arc<HoldMap>> {
        self.hold_map.clone()
    }
}

/// Mirrors the worker's stdout/stderr into the master log. The worker
/// writes its real log to `--log-file`; this only catches stray prints
/// and startup failures.
fn forward_output(service_id: &ServiceId, child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        let service_id = service_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(service = %service_id, "worker stdout: {line}");
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let service_id = service_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(service = %service_id, "worker stderr: {line}");
            }
        });
    }
}

struct ProcessJob {
    label: String,
    child: Child,
}

#[async_trait]
impl JobHandle for ProcessJob {
    fn id(&self) -> String {
        self.label.clone()
    }

    async fn cancel(&mut self) -> Result<(), LaunchError> {
        // the runner has already sent ShutDown; give the worker a moment
        // to exit on its own before reclaiming it the hard way
        match tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(job = %self.label, %status, "worker exited");
                Ok(())
            }
            Ok(Err(err)) => Err(LaunchError::Spawn(err)),
            Err(_) => {
                debug!(job = %self.label, "worker did not exit in time, killing it");
                self.child.kill().await?;
                Ok(())
            }
        }
    }
}
