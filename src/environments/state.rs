use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

use crate::core::{EnvironmentStatus, ForgeResult};

/// Sessions older than this many starts are dropped from the state file.
pub const MAX_SESSIONS: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum CommandStatus {
    NotDeclared,
    Succeeded,
    /// Still running in the background when the session was recorded.
    Running,
    Failed { exit_code: i64 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub post_start: CommandStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentState {
    pub workspace: PathBuf,
    pub descriptor_fingerprint: String,
    pub container_id: Option<String>,
    pub status: EnvironmentStatus,
    pub post_create_completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sessions: Vec<SessionRecord>,
    /// Ports already opened for `openBrowserOnce`.
    #[serde(default)]
    pub opened_ports: BTreeSet<u16>,
    /// Host port chosen for each forwarded port, keyed by its `forwardPorts` form.
    #[serde(default)]
    pub port_bindings: BTreeMap<String, u16>,
    pub updated_at: DateTime<Utc>,
}

impl EnvironmentState {
    pub fn new(workspace: &Path, fingerprint: impl Into<String>) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            descriptor_fingerprint: fingerprint.into(),
            container_id: None,
            status: EnvironmentStatus::Created,
            post_create_completed_at: None,
            sessions: Vec::new(),
            opened_ports: BTreeSet::new(),
            port_bindings: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn post_create_done(&self) -> bool {
        self.post_create_completed_at.is_some()
    }

    pub fn record_session(&mut self, post_start: CommandStatus) -> &SessionRecord {
        self.sessions.push(SessionRecord {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            post_start,
        });
        if self.sessions.len() > MAX_SESSIONS {
            let excess = self.sessions.len() - MAX_SESSIONS;
            self.sessions.drain(..excess);
        }
        &self.sessions[self.sessions.len() - 1]
    }
}

/// One JSON file per workspace under the state directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, workspace: &Path) -> PathBuf {
        let canonical = workspace
            .canonicalize()
            .unwrap_or_else(|_| workspace.to_path_buf());
        let digest = Sha256::digest(canonical.to_string_lossy().as_bytes());
        let key = format!("{:x}", digest);
        self.dir.join(format!("{}.json", &key[..16]))
    }

    pub async fn load(&self, workspace: &Path) -> ForgeResult<Option<EnvironmentState>> {
        let path = self.path_for(workspace);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write to a temp file and rename over the old state.
    pub async fn save(&self, state: &mut EnvironmentState) -> ForgeResult<()> {
        state.updated_at = Utc::now();
        fs::create_dir_all(&self.dir).await?;

        let path = self.path_for(&state.workspace);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(state)?).await?;
        fs::rename(&tmp, &path).await?;

        debug!(path = %path.display(), status = %state.status, "Saved environment state");
        Ok(())
    }

    pub async fn clear(&self, workspace: &Path) -> ForgeResult<()> {
        match fs::remove_file(self.path_for(workspace)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
