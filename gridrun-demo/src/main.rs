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

//! Minimal gridrun program: registers one remote function and dispatches
//! it to a single worker. Run with `gridrun-demo master`; the launcher
//! starts `gridrun-demo worker ...` processes from the same binary.

use gridrun::{run_program, with_remote_run, ClosureRegistry, RunnerError};
use tracing::info;

fn main() -> anyhow::Result<()> {
    let mut registry = ClosureRegistry::new();
    let add_one =
        registry.register("demo.add_one", |n: i64| async move { Ok::<i64, String>(n + 1) });

    run_program(registry, |ctx| async move {
        let answer = with_remote_run(&ctx.node, ctx.launcher.as_ref(), |worker| {
            let add_one = add_one.clone();
            async move {
                let closure = add_one.bind(41);
                worker.run(&closure).await.map_err(RunnerError::from)
            }
        })
        .await?;

        info!(answer, "remote computation finished");
        anyhow::ensure!(answer == 42, "expected 42, got {answer}");
        Ok(())
    })
}
