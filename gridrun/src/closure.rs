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

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Mutex;
use tokio::sync::OnceCell;

/// A self-describing unit of remote work: the identifier of a function
/// registered on both ends plus its encoded argument. No code ships over
/// the wire; master and worker run the identical binary and agree on the
/// registry contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Closure {
    pub function: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum ClosureError {
    #[error("failed to encode closure argument: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("failed to decode closure payload: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("closure producer already ran and failed")]
    ProducerUnavailable,
}

type Producer = Box<dyn FnOnce() -> BoxFuture<'static, Result<Closure, ClosureError>> + Send>;

/// A deferred closure: the producer runs on first demand and the built
/// [`Closure`] is memoised, so every subsequent demand observes the same
/// bytes. The phantom parameter names the result type the closure's
/// function produces on the worker.
pub struct LazyClosure<T> {
    cell: OnceCell<Closure>,
    producer: Mutex<Option<Producer>>,
    _result: PhantomData<fn() -> T>,
}

impl<T> LazyClosure<T> {
    pub fn new<F, Fut>(producer: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Closure, ClosureError>> + Send + 'static,
    {
        Self {
            cell: OnceCell::new(),
            producer: Mutex::new(Some(Box::new(move || producer().boxed()))),
            _result: PhantomData,
        }
    }

    /// A closure that is already built; `force` never runs a producer.
    pub fn ready(closure: Closure) -> Self {
        Self {
            cell: OnceCell::new_with(Some(closure)),
            producer: Mutex::new(None),
            _result: PhantomData,
        }
    }

    /// Builds the closure on first demand and returns the memoised value
    /// afterwards. Concurrent demands run the producer exactly once; the
    /// losers wait for the winner's result.
    pub async fn force(&self) -> Result<&Closure, ClosureError> {
        self.cell
            .get_or_try_init(|| async {
                let producer = self
                    .producer
                    .lock()
                    .expect("closure producer lock poisoned")
                    .take()
                    .ok_or(ClosureError::ProducerUnavailable)?;
                producer().await
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn sample_closure() -> Closure {
        Closure {
            function: "test.sample".to_string(),
            payload: vec![1, 2, 3],
        }
    }

    #[test]
    async fn producer_runs_exactly_once_under_concurrent_demands() {
        let calls = Arc::new(AtomicUsize::new(0));
        let lazy = Arc::new(LazyClosure::<u64>::new({
            let calls = calls.clone();
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                Ok(sample_closure())
            }
        }));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let lazy = lazy.clone();
            handles.push(tokio::spawn(async move {
                lazy.force().await.expect("Failed to force closure").clone()
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.expect("task failed"));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|c| *c == sample_closure()));
    }

    #[test]
    async fn ready_closure_forces_without_a_producer() {
        let lazy = LazyClosure::<u64>::ready(sample_closure());
        let first = lazy.force().await.expect("Failed to force closure").clone();
        let second = lazy.force().await.expect("Failed to force closure").clone();
        assert_eq!(first, second);
    }
}
