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

use crate::hold::HOLD_API_PORT_START;
use crate::tracing::TracingConfig;
use crate::transport::PortRange;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "GRIDRUN__";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    pub tracing: TracingConfig,
    /// Scratch directory: master log, worker logs, staged executable.
    pub work_dir: PathBuf,
    pub database_file: PathBuf,
    pub max_db_connections: u32,
    /// Interface the master node listens on.
    pub listen_host: String,
    /// Address workers are told to dial back; must resolve from the
    /// worker hosts. Cluster deployments set the head node's hostname.
    pub advertised_host: String,
    pub node_ports: PortRange,
    pub hold_port_start: u16,
    /// How long a scope waits for its worker to register. Absent means
    /// wait forever.
    #[serde(default, with = "humantime_serde")]
    pub worker_connect_timeout: Option<Duration>,
    /// Explicit worker executable. When absent, the current executable is
    /// copied into the work dir for the launcher and removed at the end
    /// of the run.
    pub worker_executable: Option<PathBuf>,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::default(),
            work_dir: PathBuf::from("data"),
            database_file: PathBuf::from("data/gridrun.db"),
            max_db_connections: 4,
            listen_host: "0.0.0.0".to_string(),
            advertised_host: "127.0.0.1".to_string(),
            node_ports: PortRange::default(),
            hold_port_start: HOLD_API_PORT_START,
            worker_connect_timeout: None,
            worker_executable: None,
        }
    }
}

pub struct ConfigLoader<T> {
    path: PathBuf,
    _config: PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned + Default> ConfigLoader<T> {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            _config: PhantomData,
        }
    }

    /// Defaults, overridden by the TOML file (if present), overridden by
    /// `GRIDRUN__`-prefixed environment variables with `__` separators
    /// (e.g. `GRIDRUN__TRACING__JSON=true`).
    pub fn load(&self) -> Result<T, figment::Error> {
        Figment::from(Serialized::defaults(T::default()))
            .merge(Toml::file(&self.path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
    }
}

pub fn make_config_loader() -> ConfigLoader<MasterConfig> {
    ConfigLoader::new(&PathBuf::from("config/gridrun.toml"))
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    pub fn config_is_loadable() {
        make_config_loader().load().expect("Failed to load config");
    }

    #[test]
    pub fn env_overrides_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("GRIDRUN__HOLD_PORT_START", "23000");
            jail.set_env("GRIDRUN__ADVERTISED_HOST", "head-node");
            let config = make_config_loader().load()?;
            assert_eq!(config.hold_port_start, 23000);
            assert_eq!(config.advertised_host, "head-node");
            Ok(())
        });
    }
}
