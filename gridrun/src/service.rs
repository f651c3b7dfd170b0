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

//! Master-side registry of transient service endpoints. Each remote-run
//! scope registers a fresh random [`ServiceId`] here and receives the
//! registration its worker sends to that id.

use crate::model::{NodeId, ServiceId};
use crate::protocol::{ControlReader, ControlWriter};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::warn;

const REGISTRATION_BUFFER: usize = 16;

/// A worker announcing itself to a service endpoint. The connection the
/// announcement arrived on is handed over with it: the writer is the reply
/// channel (and later the control channel), the reader stays with the
/// scope for symmetry.
pub struct Registration {
    pub service_id: ServiceId,
    pub worker: NodeId,
    pub reader: ControlReader,
    pub writer: ControlWriter,
}

#[derive(Clone, Default)]
pub struct ServiceMap {
    inner: Arc<Mutex<HashMap<ServiceId, mpsc::Sender<Registration>>>>,
}

impl ServiceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh random service id and returns the endpoint guard.
    /// At most one endpoint exists per id; the guard unregisters on drop,
    /// so the registration is released on every exit path.
    pub fn register(&self) -> ServiceEndpoint {
        let (sender, receiver) = mpsc::channel(REGISTRATION_BUFFER);
        let mut inner = self.inner.lock().expect("service map lock poisoned");
        let id = loop {
            let candidate = ServiceId::random();
            if !inner.contains_key(&candidate) {
                break candidate;
            }
        };
        inner.insert(id.clone(), sender);
        drop(inner);
        ServiceEndpoint {
            id,
            receiver,
            map: self.clone(),
        }
    }

    /// Delivers a registration to the endpoint named by its service id.
    /// Returns `false` when no such endpoint is registered.
    pub async fn route(&self, registration: Registration) -> bool {
        let sender = {
            let inner = self.inner.lock().expect("service map lock poisoned");
            inner.get(&registration.service_id).cloned()
        };
        match sender {
            Some(sender) => sender.send(registration).await.is_ok(),
            None => false,
        }
    }

    pub fn active(&self) -> Vec<ServiceId> {
        let mut ids: Vec<ServiceId> = self
            .inner
            .lock()
            .expect("service map lock poisoned")
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    #[cfg(test)]
    pub(crate) fn sender(&self, id: &ServiceId) -> Option<mpsc::Sender<Registration>> {
        self.inner
            .lock()
            .expect("service map lock poisoned")
            .get(id)
            .cloned()
    }

    fn unregister(&self, id: &ServiceId) {
        let removed = self
            .inner
            .lock()
            .expect("service map lock poisoned")
            .remove(id);
        if removed.is_none() {
            warn!(service = %id, "unregistered a service id that was not registered");
        }
    }
}

pub struct ServiceEndpoint {
    id: ServiceId,
    receiver: mpsc::Receiver<Registration>,
    map: ServiceMap,
}

impl ServiceEndpoint {
    pub fn id(&self) -> &ServiceId {
        &self.id
    }

    pub async fn recv(&mut self) -> Option<Registration> {
        self.receiver.recv().await
    }
}

impl Drop for ServiceEndpoint {
    fn drop(&mut self) {
        self.map.unregister(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn endpoint_unregisters_on_drop() {
        let map = ServiceMap::new();
        let endpoint = map.register();
        let id = endpoint.id().clone();
        assert_eq!(map.active(), vec![id]);
        drop(endpoint);
        assert!(map.active().is_empty());
    }

    #[test]
    fn distinct_scopes_get_distinct_ids() {
        let map = ServiceMap::new();
        let first = map.register();
        let second = map.register();
        assert_ne!(first.id(), second.id());
        assert_eq!(map.active().len(), 2);
    }
}
