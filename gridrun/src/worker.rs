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

//! The worker side of the protocol: bind a node, register with the master
//! under the service id from the command line, then serve closures until
//! the master says `ShutDown`.

use crate::model::{NodeId, ServiceId, WorkerMessage};
use crate::protocol::{self, ControlReader, ControlWriter, Frame};
use crate::registry::ClosureRegistry;
use crate::transport::{Node, PortRange, Transport, TransportError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{info, warn};

/// Handshake retry policy: how often the worker re-sends its registration
/// and how long it waits for the master's acknowledgement each time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeConfig {
    pub attempts: u32,
    #[serde(with = "humantime_serde")]
    pub reply_timeout: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            reply_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub master: NodeId,
    pub service_id: ServiceId,
    /// Host other processes can dial this worker's node on.
    pub advertise_host: String,
    pub ports: PortRange,
    pub handshake: HandshakeConfig,
}

impl WorkerOptions {
    pub fn new(master: NodeId, service_id: ServiceId, advertise_host: impl Into<String>) -> Self {
        Self {
            master,
            service_id,
            advertise_host: advertise_host.into(),
            ports: PortRange::default(),
            handshake: HandshakeConfig::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("master address is not dialable: {0}")]
    BadMasterAddress(String),
    #[error("master at {master} did not acknowledge service {service} after {attempts} attempts")]
    HandshakeFailed {
        master: NodeId,
        service: ServiceId,
        attempts: u32,
    },
    #[error("protocol violation: received a second Connected acknowledgement")]
    DuplicateConnected,
    #[error("master connection lost before shutdown: {0}")]
    ControlLost(String),
}

/// Runs the whole worker lifecycle and returns when the master shuts the
/// worker down. Closure invocations are served concurrently by the node's
/// accept loop for as long as this future is blocked on the control
/// channel.
pub async fn run_worker(
    options: WorkerOptions,
    registry: Arc<ClosureRegistry>,
) -> Result<(), WorkerError> {
    let master_addr = options
        .master
        .socket_addr()
        .map_err(WorkerError::BadMasterAddress)?;

    let transport = Transport::bind("0.0.0.0", &options.ports).await?;
    let node = Node::start(transport, &options.advertise_host, registry);
    info!(
        node = %node.id(),
        master = %options.master,
        service = %options.service_id,
        "worker node bound"
    );

    let (mut reader, _writer) = handshake(&node, master_addr, &options).await?;
    info!(service = %options.service_id, "registration acknowledged, serving closures until shutdown");

    loop {
        match protocol::read_frame(&mut reader).await {
            Ok(Frame::Control(WorkerMessage::ShutDown)) => {
                info!(service = %options.service_id, "shutdown received");
                return Ok(());
            }
            Ok(Frame::Control(WorkerMessage::Connected)) => {
                return Err(WorkerError::DuplicateConnected);
            }
            Ok(other) => {
                warn!(frame = ?other, "unexpected frame on the control channel");
            }
            Err(err) => return Err(WorkerError::ControlLost(err.to_string())),
        }
    }
}

/// Registers with the master, retrying per [`HandshakeConfig`]. Each
/// attempt opens a fresh connection; the acknowledged connection becomes
/// the control channel.
async fn handshake(
    node: &Node,
    master_addr: std::net::SocketAddr,
    options: &WorkerOptions,
) -> Result<(ControlReader, ControlWriter), WorkerError> {
    for attempt in 1..=options.handshake.attempts {
        match register_once(node, master_addr, options).await {
            Ok(Some(channel)) => return Ok(channel),
            Ok(None) => {
                warn!(
                    attempt,
                    of = options.handshake.attempts,
                    "master did not reply in time"
                );
            }
            Err(reason) => {
                warn!(attempt, of = options.handshake.attempts, %reason, "registration attempt failed");
            }
        }
    }
    Err(WorkerError::HandshakeFailed {
        master: options.master.clone(),
        service: options.service_id.clone(),
        attempts: options.handshake.attempts,
    })
}

/// One registration attempt. `Ok(None)` means the reply timed out; an
/// unexpected or undecodable reply is an error string for the retry log.
async fn register_once(
    node: &Node,
    master_addr: std::net::SocketAddr,
    options: &WorkerOptions,
) -> Result<Option<(ControlReader, ControlWriter)>, String> {
    let stream = TcpStream::connect(master_addr)
        .await
        .map_err(|err| err.to_string())?;
    let (read_half, write_half) = stream.into_split();
    let mut reader = protocol::frame_reader(read_half);
    let mut writer = protocol::frame_writer(write_half);

    protocol::write_frame(
        &mut writer,
        &Frame::Register {
            service_id: options.service_id.clone(),
            worker: node.id().clone(),
        },
    )
    .await
    .map_err(|err| err.to_string())?;

    match timeout(options.handshake.reply_timeout, protocol::read_frame(&mut reader)).await {
        Err(_) => Ok(None),
        Ok(Ok(Frame::Control(WorkerMessage::Connected))) => Ok(Some((reader, writer))),
        Ok(Ok(other)) => Err(format!("unexpected reply to registration: {other:?}")),
        Ok(Err(err)) => Err(err.to_string()),
    }
}
