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

//! Program bookkeeping. The master records each run and programs may stash
//! small key-value state between dispatches; computations that need more
//! bring their own storage.

use crate::model::ProgramId;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

#[async_trait]
pub trait ProgramDb: Send + Sync {
    async fn record_run(&self, program: &ProgramId, executable: &str) -> Result<(), DbError>;

    async fn finish_run(&self, program: &ProgramId) -> Result<(), DbError>;

    async fn kv_put(&self, program: &ProgramId, key: &str, value: &[u8]) -> Result<(), DbError>;

    async fn kv_get(&self, program: &ProgramId, key: &str) -> Result<Option<Vec<u8>>, DbError>;
}

/// File-backed SQLite bookkeeping; the schema is created on connect.
pub struct SqliteProgramDb {
    pool: SqlitePool,
}

impl SqliteProgramDb {
    pub async fn connect(database: &Path, max_connections: u32) -> Result<Self, DbError> {
        let options = SqliteConnectOptions::new()
            .filename(database)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS program_runs (
                 program_id  TEXT PRIMARY KEY,
                 executable  TEXT NOT NULL,
                 started_at  TEXT NOT NULL,
                 finished_at TEXT
             )",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS program_kv (
                 program_id TEXT NOT NULL,
                 key        TEXT NOT NULL,
                 value      BLOB NOT NULL,
                 PRIMARY KEY (program_id, key)
             )",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl ProgramDb for SqliteProgramDb {
    async fn record_run(&self, program: &ProgramId, executable: &str) -> Result<(), DbError> {
        sqlx::query(
            "INSERT INTO program_runs (program_id, executable, started_at) VALUES (?, ?, ?)",
        )
        .bind(program.to_string())
        .bind(executable)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish_run(&self, program: &ProgramId) -> Result<(), DbError> {
        sqlx::query("UPDATE program_runs SET finished_at = ? WHERE program_id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(program.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn kv_put(&self, program: &ProgramId, key: &str, value: &[u8]) -> Result<(), DbError> {
        sqlx::query(
            "INSERT OR REPLACE INTO program_kv (program_id, key, value) VALUES (?, ?, ?)",
        )
        .bind(program.to_string())
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn kv_get(&self, program: &ProgramId, key: &str) -> Result<Option<Vec<u8>>, DbError> {
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT value FROM program_kv WHERE program_id = ? AND key = ?")
                .bind(program.to_string())
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(value,)| value))
    }
}

/// Bookkeeping for tests and programs that do not want a database file.
#[derive(Default)]
pub struct InMemoryProgramDb {
    state: Mutex<InMemoryState>,
}

#[derive(Default)]
struct InMemoryState {
    runs: HashMap<String, (String, bool)>,
    kv: HashMap<(String, String), Vec<u8>>,
}

impl InMemoryProgramDb {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProgramDb for InMemoryProgramDb {
    async fn record_run(&self, program: &ProgramId, executable: &str) -> Result<(), DbError> {
        let mut state = self.state.lock().expect("program db lock poisoned");
        state
            .runs
            .insert(program.to_string(), (executable.to_string(), false));
        Ok(())
    }

    async fn finish_run(&self, program: &ProgramId) -> Result<(), DbError> {
        let mut state = self.state.lock().expect("program db lock poisoned");
        if let Some(run) = state.runs.get_mut(&program.to_string()) {
            run.1 = true;
        }
        Ok(())
    }

    async fn kv_put(&self, program: &ProgramId, key: &str, value: &[u8]) -> Result<(), DbError> {
        let mut state = self.state.lock().expect("program db lock poisoned");
        state
            .kv
            .insert((program.to_string(), key.to_string()), value.to_vec());
        Ok(())
    }

    async fn kv_get(&self, program: &ProgramId, key: &str) -> Result<Option<Vec<u8>>, DbError> {
        let state = self.state.lock().expect("program db lock poisoned");
        Ok(state
            .kv
            .get(&(program.to_string(), key.to_string()))
            .cloned())
    }
}
