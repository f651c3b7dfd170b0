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

//! TCP transport and the node built on top of it. A node is one bound
//! listener shared by two kinds of traffic: worker registrations routed to
//! master-side service endpoints, and closure invocations executed through
//! the registry. Master and worker run the identical node; only which kind
//! of traffic arrives differs.

use crate::model::NodeId;
use crate::protocol::{self, Frame};
use crate::registry::ClosureRegistry;
use crate::service::{Registration, ServiceEndpoint, ServiceMap};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

/// How long a single candidate bind may take before the next port is tried.
pub const BIND_TIMEOUT: Duration = Duration::from_secs(5);

/// Ordered candidate ports for a node listener. `0..=0` asks the operating
/// system for an ephemeral port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    pub fn new(min: u16, max: u16) -> Self {
        Self { min, max }
    }

    /// A single OS-assigned port; used by tests and co-located processes.
    pub fn ephemeral() -> Self {
        Self { min: 0, max: 0 }
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.min..=self.max
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            min: 10090,
            max: 10990,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no free port in {min}..={max}: every candidate bind failed or timed out")]
    PortsExhausted { min: u16, max: u16 },
    #[error("transport i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

/// A bound listener. Binding walks the candidate ports in order, giving
/// each attempt [`BIND_TIMEOUT`]; the first successful bind wins and
/// already-bound transports are unaffected by later scans.
#[derive(Debug)]
pub struct Transport {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Transport {
    pub async fn bind(host: &str, ports: &PortRange) -> Result<Transport, TransportError> {
        for port in ports.iter() {
            match timeout(BIND_TIMEOUT, TcpListener::bind((host, port))).await {
                Ok(Ok(listener)) => {
                    let local_addr = listener.local_addr()?;
                    debug!(%local_addr, "transport bound");
                    return Ok(Transport {
                        listener,
                        local_addr,
                    });
                }
                Ok(Err(err)) => {
                    debug!(port, %err, "candidate port rejected");
                }
                Err(_) => {
                    warn!(port, "candidate bind timed out");
                }
            }
        }
        Err(TransportError::PortsExhausted {
            min: ports.min,
            max: ports.max,
        })
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// A running node: the accept loop plus the structures it feeds.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    id: NodeId,
    services: ServiceMap,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    /// Starts the accept loop on the bound transport. `advertise_host` is
    /// the address other processes can dial; it ends up in the node id the
    /// launcher hands to workers.
    pub fn start(transport: Transport, advertise_host: &str, registry: Arc<ClosureRegistry>) -> Node {
        let id = NodeId::new(advertise_host, transport.port());
        let services = ServiceMap::new();
        let accept_task = tokio::spawn(accept_loop(
            transport.listener,
            services.clone(),
            registry,
        ));
        Node {
            inner: Arc::new(NodeInner {
                id,
                services,
                accept_task: Mutex::new(Some(accept_task)),
            }),
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.inner.id
    }

    /// Registers a fresh service endpoint on this node.
    pub fn register_service(&self) -> ServiceEndpoint {
        self.inner.services.register()
    }

    /// The service ids currently registered; used by operators (and tests)
    /// to check that scopes released their registrations.
    pub fn active_services(&self) -> Vec<crate::model::ServiceId> {
        self.inner.services.active()
    }

    #[cfg(test)]
    pub(crate) fn services(&self) -> &ServiceMap {
        &self.inner.services
    }
}

impl Drop for NodeInner {
    fn drop(&mut self) {
        if let Some(task) = self
            .accept_task
            .lock()
            .expect("accept task lock poisoned")
            .take()
        {
            task.abort();
        }
    }
}

async fn accept_loop(listener: TcpListener, services: ServiceMap, registry: Arc<ClosureRegistry>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let services = services.clone();
                let registry = registry.clone();
                tokio::spawn(handle_connection(stream, peer, services, registry));
            }
            Err(err) => {
                warn!(%err, "accept failed");
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    services: ServiceMap,
    registry: Arc<ClosureRegistry>,
) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = protocol::frame_reader(read_half);
    let mut writer = protocol::frame_writer(write_half);

    match protocol::read_frame(&mut reader).await {
        Ok(Frame::Register { service_id, worker }) => {
            debug!(service = %service_id, %worker, %peer, "registration received");
            let delivered = services
                .route(Registration {
                    service_id: service_id.clone(),
                    worker,
                    reader,
                    writer,
                })
                .await;
            if !delivered {
                warn!(service = %service_id, %peer, "no endpoint registered for service id, dropping registration");
            }
        }
        Ok(Frame::Run { closure }) => {
            debug!(function = %closure.function, %peer, "closure invocation received");
            let response = match registry.invoke(&closure).await {
                Ok(bytes) => Frame::RunResult(bytes),
                Err(err) => Frame::RunError(err.to_string()),
            };
            if let Err(err) = protocol::write_frame(&mut writer, &response).await {
                warn!(function = %closure.function, %err, "failed to send closure result");
            }
        }
        Ok(other) => {
            warn!(%peer, frame = ?other, "unexpected opening frame, closing connection");
        }
        Err(err) => {
            debug!(%peer, %err, "connection closed before a frame arrived");
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    async fn bind_skips_occupied_ports() {
        let blocker = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind blocker");
        let taken = blocker.local_addr().expect("Failed to read addr").port();
        if taken == u16::MAX {
            return;
        }

        let transport = Transport::bind("127.0.0.1", &PortRange::new(taken, taken + 1))
            .await
            .expect("Failed to bind transport");
        assert_eq!(transport.port(), taken + 1);
    }

    #[test]
    async fn exhausted_range_reports_the_attempted_ports() {
        let blocker = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind blocker");
        let taken = blocker.local_addr().expect("Failed to read addr").port();

        match Transport::bind("127.0.0.1", &PortRange::new(taken, taken)).await {
            Err(TransportError::PortsExhausted { min, max }) => {
                assert_eq!((min, max), (taken, taken));
            }
            other => panic!("unexpected outcome: {:?}", other.map(|t| t.port())),
        }
    }

    #[test]
    async fn failed_scan_leaves_existing_transports_untouched() {
        let first = Transport::bind("127.0.0.1", &PortRange::ephemeral())
            .await
            .expect("Failed to bind first transport");
        let occupied = first.port();

        let _ = Transport::bind("127.0.0.1", &PortRange::new(occupied, occupied))
            .await
            .expect_err("scan over an occupied port should fail");

        // the original listener still accepts
        let addr = first.local_addr();
        let accept = tokio::spawn(async move { first.listener.accept().await.is_ok() });
        TcpStream::connect(addr).await.expect("Failed to connect");
        assert!(accept.await.expect("accept task failed"));
    }
}
