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

//! Hold coordinator: failed remote scopes park themselves here under their
//! service id and wait for an operator to release them over HTTP, instead
//! of being retried blindly. The map is owned by the master driver and
//! dies with it.

use poem::listener::{Acceptor, Listener, TcpListener};
use poem::web::{Data, Json, Path};
use poem::{get, EndpointExt, Route, Server};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// First candidate port for the HTTP listener; incremented until a bind
/// succeeds.
pub const HOLD_API_PORT_START: u16 = 11132;

/// Service-id text mapped to a one-shot release latch. All three
/// operations take the same lock, so list/release/insert interleave
/// atomically.
#[derive(Default)]
pub struct HoldMap {
    latches: Mutex<HashMap<String, oneshot::Sender<()>>>,
}

impl HoldMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a fresh latch for `service` and returns the waiter side.
    /// Replacing a live latch is the caller's bug; it is logged and the
    /// replaced waiter observes a closed channel.
    pub fn hold(&self, service: &str) -> oneshot::Receiver<()> {
        let (sender, receiver) = oneshot::channel();
        let mut latches = self.latches.lock().expect("hold map lock poisoned");
        if latches.insert(service.to_string(), sender).is_some() {
            warn!(%service, "service id was already held, replacing its latch");
        }
        receiver
    }

    /// Fires and removes the latch for `service`. Returns the service id
    /// when a latch existed, `None` otherwise (and never inserts).
    pub fn release(&self, service: &str) -> Option<String> {
        let sender = self
            .latches
            .lock()
            .expect("hold map lock poisoned")
            .remove(service)?;
        if sender.send(()).is_err() {
            warn!(%service, "released a hold nobody was waiting on");
        }
        info!(%service, "hold released");
        Some(service.to_string())
    }

    /// Releases every held service and returns their ids.
    pub fn release_all(&self) -> Vec<String> {
        let drained: Vec<(String, oneshot::Sender<()>)> = {
            let mut latches = self.latches.lock().expect("hold map lock poisoned");
            latches.drain().collect()
        };
        let mut released = Vec::with_capacity(drained.len());
        for (service, sender) in drained {
            if sender.send(()).is_err() {
                warn!(%service, "released a hold nobody was waiting on");
            }
            info!(%service, "hold released");
            released.push(service);
        }
        released.sort();
        released
    }

    /// The currently held service ids.
    pub fn held(&self) -> Vec<String> {
        let mut held: Vec<String> = self
            .latches
            .lock()
            .expect("hold map lock poisoned")
            .keys()
            .cloned()
            .collect();
        held.sort();
        held
    }

    /// Parks the caller under `service` until an operator releases it. A
    /// replaced latch resolves as released so a superseded waiter cannot
    /// deadlock.
    pub async fn block_until_released(&self, service: &str) {
        let receiver = self.hold(service);
        let _ = receiver.await;
    }
}

#[poem::handler]
async fn release(Path(service): Path<String>, map: Data<&Arc<HoldMap>>) -> Json<Option<String>> {
    Json(map.release(&service))
}

#[poem::handler]
async fn release_all(map: Data<&Arc<HoldMap>>) -> Json<Vec<String>> {
    Json(map.release_all())
}

#[poem::handler]
async fn list_held(map: Data<&Arc<HoldMap>>) -> Json<Vec<String>> {
    Json(map.held())
}

pub fn routes(map: Arc<HoldMap>) -> impl poem::Endpoint {
    Route::new()
        .at("/release/:service", get(release))
        .at("/release-all", get(release_all))
        .at("/list", get(list_held))
        .data(map)
}

/// The running HTTP control plane. The port is read from the bound
/// acceptor, so the published value always matches the actual listener.
pub struct HoldApi {
    port: u16,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl HoldApi {
    pub async fn start(map: Arc<HoldMap>) -> Result<HoldApi, std::io::Error> {
        Self::start_from(map, HOLD_API_PORT_START).await
    }

    pub async fn start_from(map: Arc<HoldMap>, port_start: u16) -> Result<HoldApi, std::io::Error> {
        let (acceptor, port) = bind_first_free(port_start).await?;
        let app = routes(map);
        let (shutdown, signal) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let result = Server::new_with_acceptor(acceptor)
                .run_with_graceful_shutdown(
                    app,
                    async {
                        let _ = signal.await;
                    },
                    None,
                )
                .await;
            if let Err(err) = result {
                error!(%err, "hold api server failed");
            }
        });
        Ok(HoldApi {
            port,
            shutdown: Some(shutdown),
            task,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = (&mut self.task).await;
    }
}

impl Drop for HoldApi {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

async fn bind_first_free(
    port_start: u16,
) -> Result<(impl Acceptor + 'static, u16), std::io::Error> {
    let mut port = port_start;
    loop {
        match TcpListener::bind(format!("0.0.0.0:{port}"))
            .into_acceptor()
            .await
        {
            Ok(acceptor) => {
                let bound = acceptor
                    .local_addr()
                    .first()
                    .and_then(|addr| addr.as_socket_addr().map(|a| a.port()))
                    .unwrap_or(port);
                debug!(port = bound, "hold api listener bound");
                return Ok((acceptor, bound));
            }
            Err(err) if port < u16::MAX => {
                debug!(port, %err, "hold api port occupied, trying the next one");
                port += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use std::time::Duration;

    #[test]
    async fn release_unblocks_exactly_the_matching_waiter() {
        let map = Arc::new(HoldMap::new());

        let waiter_a = {
            let map = map.clone();
            tokio::spawn(async move { map.block_until_released("aaaaa").await })
        };
        let waiter_b = {
            let map = map.clone();
            tokio::spawn(async move { map.block_until_released("bbbbb").await })
        };

        // both parked
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(map.held(), vec!["aaaaa".to_string(), "bbbbb".to_string()]);

        assert_eq!(map.release("aaaaa"), Some("aaaaa".to_string()));
        tokio::time::timeout(Duration::from_secs(1), waiter_a)
            .await
            .expect("waiter a did not unblock")
            .expect("waiter a failed");

        assert_eq!(map.held(), vec!["bbbbb".to_string()]);
        assert_eq!(map.release("bbbbb"), Some("bbbbb".to_string()));
        tokio::time::timeout(Duration::from_secs(1), waiter_b)
            .await
            .expect("waiter b did not unblock")
            .expect("waiter b failed");
    }

    #[test]
    fn releasing_an_unknown_service_returns_none_and_does_not_insert() {
        let map = HoldMap::new();
        assert_eq!(map.release("nope!"), None);
        assert!(map.held().is_empty());
    }

    #[test]
    fn releasing_a_hold_with_a_gone_waiter_is_not_an_error() {
        let map = HoldMap::new();
        let receiver = map.hold("xyzzy");
        drop(receiver);
        assert_eq!(map.release("xyzzy"), Some("xyzzy".to_string()));
        assert!(map.held().is_empty());
    }

    #[test]
    async fn a_replaced_waiter_is_not_left_deadlocked() {
        let map = Arc::new(HoldMap::new());
        let superseded = {
            let map = map.clone();
            tokio::spawn(async move { map.block_until_released("qqqqq").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // second hold for the same id replaces the latch
        let _replacement = map.hold("qqqqq");
        tokio::time::timeout(Duration::from_secs(1), superseded)
            .await
            .expect("superseded waiter did not unblock")
            .expect("superseded waiter failed");
    }

    #[test]
    async fn release_all_fires_every_latch() {
        let map = Arc::new(HoldMap::new());
        let mut waiters = Vec::new();
        for service in ["one11", "two22", "three"] {
            let map = map.clone();
            waiters.push(tokio::spawn(async move {
                map.block_until_released(service).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let released = map.release_all();
        assert_eq!(
            released,
            vec!["one11".to_string(), "three".to_string(), "two22".to_string()]
        );
        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .expect("waiter did not unblock")
                .expect("waiter failed");
        }
        assert!(map.held().is_empty());
    }
}
