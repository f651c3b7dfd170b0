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

use rand::distr::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::str::FromStr;
use uuid::Uuid;

/// Address of a participating process, encoded as `host:port`.
///
/// Node ids travel over the wire and through worker command lines, so the
/// textual form is the canonical one; equality is bytewise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(host: &str, port: u16) -> Self {
        Self(format!("{host}:{port}"))
    }

    pub fn from_addr(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, String> {
        self.0
            .parse()
            .map_err(|err| format!("invalid node address {}: {err}", self.0))
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let _: SocketAddr = s
            .parse()
            .map_err(|err| format!("invalid node address {s}: {err}"))?;
        Ok(Self(s.to_string()))
    }
}

pub const SERVICE_ID_LEN: usize = 5;

/// Short random name for a transient master-side endpoint expecting exactly
/// one worker. Allocated before launch, unregistered when the scope ends.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceId(String);

impl ServiceId {
    pub fn random() -> Self {
        let id: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(SERVICE_ID_LEN)
            .map(char::from)
            .collect();
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ServiceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ServiceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || !s.chars().all(|c| c.is_ascii_graphic()) {
            Err(format!("invalid service id: {s:?}"))
        } else {
            Ok(Self(s.to_string()))
        }
    }
}

/// Control messages sent from the master to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerMessage {
    /// Acknowledges the worker's registration.
    Connected,
    /// Asks the worker to terminate gracefully.
    ShutDown,
}

/// Identifies one master run, recorded in the program database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProgramId(pub Uuid);

impl ProgramId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for ProgramId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Failure of a remote execution scope, tagged with the service id whose
/// worker failed so operators can correlate it with held services and
/// worker logs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("remote execution failed on service {service_id}: {kind}")]
pub struct RemoteError {
    pub service_id: ServiceId,
    pub kind: RemoteErrorKind,
}

impl RemoteError {
    pub fn new(service_id: ServiceId, kind: RemoteErrorKind) -> Self {
        Self { service_id, kind }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteErrorKind {
    /// The dispatch task failed: the worker rejected the closure or the
    /// task itself panicked.
    #[error("remote task failed: {0}")]
    Failed(String),
    /// The connection carrying the dispatch broke down.
    #[error("link to remote task failed: {0}")]
    LinkFailed(String),
    /// The dispatch task was cancelled before it produced a result.
    #[error("remote task was cancelled")]
    Cancelled,
    /// The dispatch task finished without reporting an outcome.
    #[error("remote task finished without reporting a result")]
    NeverResolved,
    /// The remote function itself returned its error branch.
    #[error("remote function failed: {0}")]
    Remote(String),
    /// The worker never completed the handshake within the configured
    /// timeout.
    #[error("worker did not connect within the configured timeout")]
    ConnectTimeout,
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn node_id_round_trips_through_text() {
        let id = NodeId::new("10.1.2.3", 10090);
        let parsed: NodeId = id.to_string().parse().expect("Failed to parse node id");
        assert_eq!(parsed, id);
    }

    #[test]
    fn node_id_rejects_garbage() {
        assert!("not-an-address".parse::<NodeId>().is_err());
    }

    #[test]
    fn service_ids_are_five_printable_characters() {
        for _ in 0..100 {
            let id = ServiceId::random();
            assert_eq!(id.as_str().len(), SERVICE_ID_LEN);
            assert!(id.as_str().chars().all(|c| c.is_ascii_alphanumeric()));
        }
    }

    #[test]
    fn service_id_parses_back() {
        let id = ServiceId::random();
        let parsed: ServiceId = id.as_str().parse().expect("Failed to parse service id");
        assert_eq!(parsed, id);
    }
}
