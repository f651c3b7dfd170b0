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

//! The remote runner ties launcher, handshake, closure dispatch and
//! cleanup into one scoped operation. Whatever happens inside the scope
//! (normal return, error, cancellation) the worker receives exactly one
//! `ShutDown` and the service id is unregistered.

use crate::closure::LazyClosure;
use crate::launcher::{JobHandle, LaunchError, WorkerLauncher};
use crate::model::{NodeId, RemoteError, RemoteErrorKind, ServiceId, WorkerMessage};
use crate::protocol::{self, ControlWriter, Frame};
use crate::service::{Registration, ServiceEndpoint};
use crate::transport::Node;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Failures escaping a remote-run scope. Launcher failures pass through
/// as received; everything that happened on or beyond the worker is a
/// [`RemoteError`] tagged with the scope's service id.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Launch(#[from] LaunchError),
}

/// Cheap-to-clone handle to the worker owned by a scope: dispatches
/// closures and carries the shared control channel.
#[derive(Clone)]
pub struct RemoteWorker {
    worker: NodeId,
    service_id: ServiceId,
    control: Arc<ControlChannel>,
}

impl RemoteWorker {
    pub fn node_id(&self) -> &NodeId {
        &self.worker
    }

    pub fn service_id(&self) -> &ServiceId {
        &self.service_id
    }

    /// Forces the closure, ships it to the worker and decodes the result.
    ///
    /// The dispatch runs as its own task so a dropped scope aborts it; the
    /// translation of every way that task can end is the error taxonomy of
    /// [`RemoteErrorKind`].
    pub async fn run<T>(&self, closure: &LazyClosure<T>) -> Result<T, RemoteError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let closure = closure
            .force()
            .await
            .map_err(|err| self.error(RemoteErrorKind::Failed(err.to_string())))?
            .clone();

        debug!(service = %self.service_id, worker = %self.worker, function = %closure.function, "dispatching closure");

        let (report, outcome) = oneshot::channel();
        let worker = self.worker.clone();
        let task = tokio::spawn(async move {
            let _ = report.send(dispatch(worker, closure).await);
        });
        let task = tokio_util::task::AbortOnDropHandle::new(task);

        match outcome.await {
            Ok(Ok(bytes)) => {
                let result: Result<T, String> = protocol::decode_payload(&bytes)
                    .map_err(|err| self.error(RemoteErrorKind::LinkFailed(err.to_string())))?;
                result.map_err(|message| self.error(RemoteErrorKind::Remote(message)))
            }
            Ok(Err(DispatchFailure::Rejected(reason))) => {
                Err(self.error(RemoteErrorKind::Failed(reason)))
            }
            Ok(Err(DispatchFailure::Link(reason))) => {
                Err(self.error(RemoteErrorKind::LinkFailed(reason)))
            }
            Err(_) => match task.await {
                Err(join) if join.is_cancelled() => Err(self.error(RemoteErrorKind::Cancelled)),
                Err(join) => Err(self.error(RemoteErrorKind::Failed(join.to_string()))),
                Ok(()) => Err(self.error(RemoteErrorKind::NeverResolved)),
            },
        }
    }

    fn error(&self, kind: RemoteErrorKind) -> RemoteError {
        RemoteError::new(self.service_id.clone(), kind)
    }
}

enum DispatchFailure {
    /// The worker refused the closure before running it.
    Rejected(String),
    /// The dispatch connection broke down.
    Link(String),
}

async fn dispatch(
    worker: NodeId,
    closure: crate::closure::Closure,
) -> Result<Vec<u8>, DispatchFailure> {
    let addr = worker.socket_addr().map_err(DispatchFailure::Link)?;
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|err| DispatchFailure::Link(err.to_string()))?;
    let (read_half, write_half) = stream.into_split();
    let mut writer = protocol::frame_writer(write_half);
    let mut reader = protocol::frame_reader(read_half);

    protocol::write_frame(&mut writer, &Frame::Run { closure })
        .await
        .map_err(|err| DispatchFailure::Link(err.to_string()))?;

    match protocol::read_frame(&mut reader).await {
        Ok(Frame::RunResult(bytes)) => Ok(bytes),
        Ok(Frame::RunError(reason)) => Err(DispatchFailure::Rejected(reason)),
        Ok(other) => Err(DispatchFailure::Link(format!(
            "unexpected frame in reply to a dispatch: {other:?}"
        ))),
        Err(err) => Err(DispatchFailure::Link(err.to_string())),
    }
}

/// Control channel to the worker. `send_shutdown` is idempotent: the
/// runner's normal path and the cancellation guard may both call it, the
/// worker sees one `ShutDown`.
struct ControlChannel {
    writer: tokio::sync::Mutex<ControlWriter>,
    shutdown_sent: AtomicBool,
}

impl ControlChannel {
    fn new(writer: ControlWriter) -> Self {
        Self {
            writer: tokio::sync::Mutex::new(writer),
            shutdown_sent: AtomicBool::new(false),
        }
    }

    async fn send(&self, message: WorkerMessage) -> Result<(), protocol::WireError> {
        let mut writer = self.writer.lock().await;
        protocol::write_frame(&mut writer, &Frame::Control(message)).await
    }

    async fn send_shutdown(&self, service_id: &ServiceId) {
        if !self.shutdown_sent.swap(true, Ordering::SeqCst) {
            debug!(service = %service_id, "sending shutdown to worker");
            if let Err(err) = self.send(WorkerMessage::ShutDown).await {
                warn!(service = %service_id, %err, "failed to send shutdown to worker");
            }
        }
    }
}

/// Sends `ShutDown` from a freshly spawned task when the scope is dropped
/// without reaching its normal shutdown point, i.e. on cancellation.
struct ShutdownGuard {
    control: Arc<ControlChannel>,
    service_id: ServiceId,
    armed: bool,
}

impl ShutdownGuard {
    fn new(control: Arc<ControlChannel>, service_id: ServiceId) -> Self {
        Self {
            control,
            service_id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        if self.armed && !self.control.shutdown_sent.load(Ordering::SeqCst) {
            let control = self.control.clone();
            let service_id = self.service_id.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    control.send_shutdown(&service_id).await;
                });
            } else {
                warn!(service = %service_id, "no runtime available to deliver shutdown");
            }
        }
    }
}

/// Scoped acquisition of one worker: allocate a service id, launch, await
/// the handshake, acknowledge, run `body`, and release everything.
///
/// The registration wait uses a single deadline: stale registrations
/// (whose embedded service id does not match) are logged and ignored
/// without extending the deadline. If the worker never connects there is
/// nobody to send `ShutDown` to, but the job is still cancelled and the
/// service id unregistered.
pub async fn with_service<T, F, Fut>(
    node: &Node,
    launcher: &dyn WorkerLauncher,
    body: F,
) -> Result<T, RunnerError>
where
    F: FnOnce(RemoteWorker) -> Fut,
    Fut: Future<Output = Result<T, RunnerError>>,
{
    let mut endpoint = node.register_service();
    let service_id = endpoint.id().clone();
    info!(service = %service_id, "provisioning worker");

    let mut job = launcher.launch(node.id(), &service_id).await?;
    debug!(service = %service_id, job = %job.id(), "worker job submitted");

    let deadline = launcher.connect_timeout().map(|t| Instant::now() + t);
    let registration = match await_registration(&mut endpoint, deadline).await {
        Ok(registration) => registration,
        Err(kind) => {
            cancel_job(&service_id, job.as_mut()).await;
            return Err(RemoteError::new(service_id, kind).into());
        }
    };

    let Registration {
        worker,
        reader: _reader,
        mut writer,
        ..
    } = registration;
    info!(service = %service_id, %worker, "worker connected");

    if let Err(err) = protocol::write_frame(
        &mut writer,
        &Frame::Control(WorkerMessage::Connected),
    )
    .await
    {
        cancel_job(&service_id, job.as_mut()).await;
        return Err(RemoteError::new(service_id, RemoteErrorKind::LinkFailed(err.to_string())).into());
    }

    let control = Arc::new(ControlChannel::new(writer));
    let mut guard = ShutdownGuard::new(control.clone(), service_id.clone());

    let remote = RemoteWorker {
        worker,
        service_id: service_id.clone(),
        control: control.clone(),
    };

    let result = body(remote).await;

    control.send_shutdown(&service_id).await;
    guard.disarm();
    cancel_job(&service_id, job.as_mut()).await;

    result
}

async fn cancel_job(service_id: &ServiceId, job: &mut dyn JobHandle) {
    if let Err(err) = job.cancel().await {
        warn!(service = %service_id, job = %job.id(), %err, "failed to cancel worker job");
    }
}

async fn await_registration(
    endpoint: &mut ServiceEndpoint,
    deadline: Option<Instant>,
) -> Result<Registration, RemoteErrorKind> {
    loop {
        let next = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, endpoint.recv()).await {
                Ok(next) => next,
                Err(_) => {
                    warn!(service = %endpoint.id(), "worker did not register before the deadline");
                    return Err(RemoteErrorKind::ConnectTimeout);
                }
            },
            None => endpoint.recv().await,
        };
        match next {
            Some(registration) if registration.service_id == *endpoint.id() => {
                return Ok(registration)
            }
            Some(registration) => {
                warn!(
                    service = %endpoint.id(),
                    stale = %registration.service_id,
                    worker = %registration.worker,
                    "ignoring registration from a stale worker"
                );
            }
            None => return Err(RemoteErrorKind::LinkFailed("service endpoint closed".into())),
        }
    }
}

/// [`with_service`] plus hold-on-error: when the launcher carries a hold
/// map and the scope fails with a [`RemoteError`], the error is parked
/// under its service id until an operator releases it, then the whole
/// scope retries with a fresh service id and a fresh worker. Retry is
/// operator-gated by design; there is no automatic backoff.
pub async fn with_remote_run<T, F, Fut>(
    node: &Node,
    launcher: &dyn WorkerLauncher,
    body: F,
) -> Result<T, RunnerError>
where
    F: Fn(RemoteWorker) -> Fut,
    Fut: Future<Output = Result<T, RunnerError>>,
{
    loop {
        match with_service(node, launcher, &body).await {
            Ok(value) => return Ok(value),
            Err(RunnerError::Remote(err)) => match launcher.hold_map() {
                Some(hold_map) => {
                    error!(service = %err.service_id, %err, "remote run failed, holding for operator release");
                    hold_map
                        .block_until_released(err.service_id.as_str())
                        .await;
                    info!(service = %err.service_id, "hold released, retrying with a fresh worker");
                }
                None => return Err(err.into()),
            },
            Err(other) => return Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::registry::ClosureRegistry;
    use crate::transport::{PortRange, Transport};
    use std::time::Duration;

    async fn test_node() -> Node {
        let transport = Transport::bind("127.0.0.1", &PortRange::ephemeral())
            .await
            .expect("Failed to bind transport");
        Node::start(transport, "127.0.0.1", Arc::new(ClosureRegistry::new()))
    }

    /// Builds a registration whose control connection is a real loopback
    /// socket pair; the remote side is returned so the test can observe
    /// what the runner writes.
    async fn fake_registration(
        service_id: &str,
        worker: NodeId,
    ) -> (Registration, tokio::net::TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind");
        let addr = listener.local_addr().expect("Failed to read addr");
        let client = TcpStream::connect(addr).await.expect("Failed to connect");
        let (server, _) = listener.accept().await.expect("Failed to accept");
        let (read_half, write_half) = server.into_split();
        (
            Registration {
                service_id: service_id.parse().expect("Failed to parse service id"),
                worker,
                reader: protocol::frame_reader(read_half),
                writer: protocol::frame_writer(write_half),
            },
            client,
        )
    }

    #[test]
    async fn stale_registrations_are_ignored_and_the_correct_one_accepted() {
        let node = test_node().await;
        let mut endpoint = node.register_service();
        let id = endpoint.id().clone();
        let sender = node
            .services()
            .sender(&id)
            .expect("endpoint should be registered");

        let (stale, _stale_conn) =
            fake_registration("xxxxx", NodeId::new("127.0.0.1", 1)).await;
        let (genuine, _genuine_conn) =
            fake_registration(id.as_str(), NodeId::new("127.0.0.1", 2)).await;

        sender.send(stale).await.expect("Failed to inject stale");
        sender
            .send(genuine)
            .await
            .expect("Failed to inject genuine");

        let deadline = Some(Instant::now() + Duration::from_secs(2));
        let registration = await_registration(&mut endpoint, deadline)
            .await
            .expect("expected the genuine registration");
        assert_eq!(registration.service_id, id);
        assert_eq!(registration.worker, NodeId::new("127.0.0.1", 2));
    }

    #[test]
    async fn stale_registrations_do_not_extend_the_deadline() {
        let node = test_node().await;
        let mut endpoint = node.register_service();
        let id = endpoint.id().clone();
        let sender = node
            .services()
            .sender(&id)
            .expect("endpoint should be registered");

        let started = std::time::Instant::now();
        let deadline = Some(Instant::now() + Duration::from_millis(300));

        let feeder = tokio::spawn(async move {
            let mut conns = Vec::new();
            loop {
                let (stale, conn) =
                    fake_registration("xxxxx", NodeId::new("127.0.0.1", 1)).await;
                if sender.send(stale).await.is_err() {
                    break;
                }
                conns.push(conn);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        });

        let result = await_registration(&mut endpoint, deadline).await;
        feeder.abort();

        assert!(matches!(result, Err(RemoteErrorKind::ConnectTimeout)));
        let elapsed = started.elapsed();
        assert!(
            elapsed < Duration::from_secs(2),
            "stale traffic must not extend the deadline, waited {elapsed:?}"
        );
    }
}
