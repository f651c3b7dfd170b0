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

//! Distributed job-execution framework. A master program dispatches
//! serialised closures to ephemeral workers provisioned through a
//! pluggable launcher (batch scheduler, local fork, ssh); every worker is
//! reclaimed deterministically, and failed computations can be held for
//! operator inspection and released over a small HTTP control plane.
//!
//! A program registers its remote functions in a [`registry::ClosureRegistry`],
//! then calls [`driver::run_program`] from `main`; the same executable
//! serves as master or worker depending on the subcommand a launcher
//! invokes it with.

#[cfg(test)]
test_r::enable!();

pub mod closure;
pub mod config;
pub mod db;
pub mod driver;
pub mod hold;
pub mod launcher;
pub mod model;
pub mod protocol;
pub mod registry;
pub mod runner;
pub mod service;
pub mod tracing;
pub mod transport;
pub mod worker;

pub use closure::{Closure, LazyClosure};
pub use driver::{run_program, ClusterCtx};
pub use model::{NodeId, ProgramId, RemoteError, RemoteErrorKind, ServiceId, WorkerMessage};
pub use registry::{ClosureRegistry, RemoteFunction};
pub use runner::{with_remote_run, with_service, RemoteWorker, RunnerError};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
