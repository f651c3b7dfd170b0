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

//! The process-wide table of functions a worker is willing to execute.
//! Master and worker run the identical binary and register the same table
//! at startup, so a [`Closure`] on the wire is just an identifier plus an
//! encoded argument.

use crate::closure::{Closure, ClosureError, LazyClosure};
use crate::protocol;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, warn};

#[derive(Debug, thiserror::Error)]
pub enum InvocationError {
    #[error("unknown remote function: {0}")]
    UnknownFunction(String),
    #[error("failed to decode argument for {function}: {message}")]
    BadArgument { function: String, message: String },
}

type Handler =
    Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>, InvocationError>> + Send + Sync>;

/// Immutable after program start: build the table, wrap it in an `Arc` and
/// hand it to both the master driver and the worker protocol.
#[derive(Default)]
pub struct ClosureRegistry {
    handlers: HashMap<String, Handler>,
}

impl ClosureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `f` under `id` and returns the typed handle used to build
    /// closures on the master side. The stored handler decodes the
    /// argument, runs `f` and encodes the full `Result<B, String>`;
    /// panics inside `f` are caught, logged and converted into the error
    /// branch so they reach the master as an ordinary remote failure.
    pub fn register<A, B, F, Fut>(&mut self, id: &str, f: F) -> RemoteFunction<A, B>
    where
        A: DeserializeOwned + Send + 'static,
        B: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<B, String>> + Send + 'static,
    {
        let function = id.to_string();
        let f = Arc::new(f);
        let handler: Handler = Arc::new(move |payload: Vec<u8>| {
            let function = function.clone();
            let f = f.clone();
            async move {
                let arg: A = protocol::decode_payload(&payload).map_err(|err| {
                    InvocationError::BadArgument {
                        function: function.clone(),
                        message: err.to_string(),
                    }
                })?;
                let result: Result<B, String> = match AssertUnwindSafe(f(arg)).catch_unwind().await
                {
                    Ok(result) => result,
                    Err(panic) => {
                        let message = panic_message(panic);
                        error!(%function, %message, "remote function panicked");
                        Err(message)
                    }
                };
                if let Err(message) = &result {
                    warn!(%function, %message, "remote function failed");
                }
                protocol::encode_payload(&result).map_err(|err| InvocationError::BadArgument {
                    function,
                    message: format!("failed to encode result: {err}"),
                })
            }
            .boxed()
        });

        if self.handlers.insert(id.to_string(), handler).is_some() {
            warn!(function = %id, "re-registered remote function, previous handler replaced");
        }

        RemoteFunction {
            id: id.to_string(),
            _types: PhantomData,
        }
    }

    /// Executes a closure received from the wire. The returned bytes are
    /// the encoded `Result<B, String>` of the underlying function.
    pub async fn invoke(&self, closure: &Closure) -> Result<Vec<u8>, InvocationError> {
        let handler = self
            .handlers
            .get(&closure.function)
            .ok_or_else(|| InvocationError::UnknownFunction(closure.function.clone()))?
            .clone();
        handler(closure.payload.clone()).await
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "remote function panicked".to_string()
    }
}

/// Typed handle to a registered remote function. The serde bounds on `A`
/// and `B` are the codec: both ends resolve them statically from the
/// identical registration.
pub struct RemoteFunction<A, B> {
    id: String,
    _types: PhantomData<fn(A) -> B>,
}

impl<A, B> Clone for RemoteFunction<A, B> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            _types: PhantomData,
        }
    }
}

impl<A, B> RemoteFunction<A, B>
where
    A: Serialize + Send + Sync + 'static,
    B: 'static,
{
    /// Handle to a function registered elsewhere under `id`. Identifiers
    /// are stable across master and worker because both run the same
    /// registration code; the caller asserts the types match it.
    pub fn named(id: &str) -> Self {
        Self {
            id: id.to_string(),
            _types: PhantomData,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Builds the closure eagerly.
    pub fn apply(&self, arg: &A) -> Result<Closure, ClosureError> {
        Ok(Closure {
            function: self.id.clone(),
            payload: protocol::encode_payload(arg)?,
        })
    }

    /// Defers building the closure until it is first dispatched; the built
    /// closure is memoised across retries of the same scope body.
    pub fn bind(&self, arg: A) -> LazyClosure<B> {
        let this = self.clone();
        LazyClosure::new(move || futures::future::ready(this.apply(&arg)))
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    fn registry() -> ClosureRegistry {
        let mut registry = ClosureRegistry::new();
        registry.register("test.add_one", |n: i64| async move { Ok::<i64, String>(n + 1) });
        registry.register("test.boom", |_: ()| async move {
            Err::<i64, String>("boom".to_string())
        });
        registry.register("test.panics", |n: i64| async move {
            if n >= 0 {
                panic!("argh");
            }
            Ok::<i64, String>(n)
        });
        registry
    }

    async fn invoke_typed<B: DeserializeOwned>(
        registry: &ClosureRegistry,
        closure: &Closure,
    ) -> Result<B, String> {
        let bytes = registry.invoke(closure).await.expect("invoke failed");
        protocol::decode_payload(&bytes).expect("Failed to decode result")
    }

    #[test]
    async fn registered_function_runs_and_encodes_its_result() {
        let registry = registry();
        let add_one = RemoteFunction::<i64, i64>::named("test.add_one");
        let closure = add_one.apply(&41).expect("Failed to build closure");
        let result: Result<i64, String> = invoke_typed(&registry, &closure).await;
        assert_eq!(result, Ok(42));
    }

    #[test]
    async fn error_branch_travels_as_data() {
        let registry = registry();
        let closure = Closure {
            function: "test.boom".to_string(),
            payload: protocol::encode_payload(&()).expect("Failed to encode"),
        };
        let result: Result<i64, String> = invoke_typed(&registry, &closure).await;
        assert_eq!(result, Err("boom".to_string()));
    }

    #[test]
    async fn panics_are_converted_to_the_error_branch() {
        let registry = registry();
        let closure = Closure {
            function: "test.panics".to_string(),
            payload: protocol::encode_payload(&7i64).expect("Failed to encode"),
        };
        let result: Result<i64, String> = invoke_typed(&registry, &closure).await;
        assert_eq!(result, Err("argh".to_string()));
    }

    #[test]
    async fn unknown_function_is_rejected_structurally() {
        let registry = registry();
        let closure = Closure {
            function: "test.unknown".to_string(),
            payload: Vec::new(),
        };
        match registry.invoke(&closure).await {
            Err(InvocationError::UnknownFunction(name)) => assert_eq!(name, "test.unknown"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
