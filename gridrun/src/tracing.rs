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

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracingConfig {
    /// Filter applied when `RUST_LOG` is not set.
    pub default_directive: String,
    pub json: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            default_directive: "info".to_string(),
            json: false,
        }
    }
}

fn env_filter(config: &TracingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_directive))
}

/// Log to stdout; used by masters that were not given a log file.
pub fn init_tracing(config: &TracingConfig) {
    let builder = tracing_subscriber::fmt().with_env_filter(env_filter(config));
    if config.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Redirects all log output to `log_file`. Workers always log this way
/// (their stdout is only a fallback channel) and the master does the same
/// with its own log file under the work dir.
pub fn init_file_tracing(config: &TracingConfig, log_file: &Path) -> std::io::Result<()> {
    if let Some(parent) = log_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = Arc::new(File::create(log_file)?);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(config))
        .with_writer(file)
        .with_ansi(false);
    if config.json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}
