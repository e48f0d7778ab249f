//! Repository records per sandbox and the stores that persist them.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use utoipa::ToSchema;
use workspace_orchestrator_error::OrchestratorError;

use crate::ports::{ports_for_slot, PortTriple, RepositorySlot, StoredPorts};
use crate::services::{repository_dir, ServiceKind};

pub const STORE_ENV: &str = "WORKSPACE_ORCHESTRATOR_STORE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Github,
    Local,
    Template,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryRecord {
    pub id: String,
    pub name: String,
    pub source_type: SourceType,
    pub slot: RepositorySlot,
    #[serde(default)]
    pub ports: StoredPorts,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub service_urls: BTreeMap<ServiceKind, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tokens: BTreeMap<ServiceKind, String>,
}

impl RepositoryRecord {
    /// The assigned ports. Records are repaired on load, so a gap here only
    /// happens for records built by hand; the slot fills it.
    pub fn port_triple(&self) -> PortTriple {
        let mut ports = self.ports;
        ports.repair(self.slot).0
    }

    pub fn working_dir(&self, workspace_root: &str) -> String {
        repository_dir(workspace_root, &self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub sandbox_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub repositories: Vec<RepositoryRecord>,
}

impl Workspace {
    pub fn new(sandbox_id: impl Into<String>) -> Self {
        Self {
            sandbox_id: sandbox_id.into(),
            user_id: None,
            repositories: Vec::new(),
        }
    }

    /// One past the highest slot in use. Slots of removed repositories are
    /// never handed out while a higher one is still live.
    pub fn next_slot(&self) -> Result<RepositorySlot, OrchestratorError> {
        let next = self
            .repositories
            .iter()
            .map(|repo| repo.slot.get() + 1)
            .max()
            .unwrap_or(0);
        RepositorySlot::new(next)
    }

    /// Registers a repository on the next free slot with freshly derived ports.
    pub fn add_repository(
        &mut self,
        id: impl Into<String>,
        name: impl Into<String>,
        source_type: SourceType,
    ) -> Result<&RepositoryRecord, OrchestratorError> {
        let id = id.into();
        let name = name.into();
        if self.repositories.iter().any(|repo| repo.id == id) {
            return Err(OrchestratorError::InvalidRequest {
                message: format!("repository {id} already exists in sandbox {}", self.sandbox_id),
            });
        }
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(OrchestratorError::InvalidRequest {
                message: format!("invalid repository name `{name}`"),
            });
        }
        let slot = self.next_slot()?;
        let index = self.repositories.len();
        self.repositories.push(RepositoryRecord {
            id,
            name,
            source_type,
            slot,
            ports: ports_for_slot(slot).into(),
            service_urls: BTreeMap::new(),
            tokens: BTreeMap::new(),
        });
        Ok(&self.repositories[index])
    }

    pub fn repository_mut(&mut self, id: &str) -> Option<&mut RepositoryRecord> {
        self.repositories.iter_mut().find(|repo| repo.id == id)
    }

    /// Fills ports missing from older records. Returns whether anything changed.
    pub fn repair_ports(&mut self) -> bool {
        let mut repaired = false;
        for repo in &mut self.repositories {
            let (_, changed) = repo.ports.repair(repo.slot);
            if changed {
                tracing::info!(
                    sandbox_id = %self.sandbox_id,
                    repository = %repo.name,
                    slot = repo.slot.get(),
                    "filled missing ports from slot"
                );
            }
            repaired |= changed;
        }
        repaired
    }

    pub fn validate(&self) -> Result<(), OrchestratorError> {
        let mut slots = HashSet::new();
        let mut ids = HashSet::new();
        for repo in &self.repositories {
            if !slots.insert(repo.slot) {
                return Err(OrchestratorError::InvalidRequest {
                    message: format!(
                        "slot {} is assigned to more than one repository in sandbox {}",
                        repo.slot, self.sandbox_id
                    ),
                });
            }
            if !ids.insert(repo.id.as_str()) {
                return Err(OrchestratorError::InvalidRequest {
                    message: format!("duplicate repository id {}", repo.id),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// An unknown sandbox loads as an empty workspace.
    async fn load_workspace(&self, sandbox_id: &str) -> Result<Workspace, OrchestratorError>;

    async fn save_workspace(&self, workspace: &Workspace) -> Result<(), OrchestratorError>;

    /// Loads and writes back any record whose ports had to be filled in.
    async fn load_repaired(&self, sandbox_id: &str) -> Result<Workspace, OrchestratorError> {
        let mut workspace = self.load_workspace(sandbox_id).await?;
        if workspace.repair_ports() {
            self.save_workspace(&workspace).await?;
        }
        Ok(workspace)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(default)]
    workspaces: BTreeMap<String, Workspace>,
}

/// All workspaces in one JSON document, replaced atomically on every save.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("workspace-orchestrator")
            .join("workspaces.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_document(&self) -> Result<StoreDocument, OrchestratorError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|err| storage_error(&self.path, err)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(StoreDocument::default()),
            Err(err) => Err(storage_error(&self.path, err)),
        }
    }

    async fn write_document(&self, document: &StoreDocument) -> Result<(), OrchestratorError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| storage_error(parent, err))?;
        }
        let bytes =
            serde_json::to_vec_pretty(document).map_err(|err| storage_error(&self.path, err))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|err| storage_error(&tmp, err))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|err| storage_error(&self.path, err))
    }
}

#[async_trait]
impl MetadataStore for JsonFileStore {
    async fn load_workspace(&self, sandbox_id: &str) -> Result<Workspace, OrchestratorError> {
        let _guard = self.lock.lock().await;
        let mut document = self.read_document().await?;
        Ok(document
            .workspaces
            .remove(sandbox_id)
            .unwrap_or_else(|| Workspace::new(sandbox_id)))
    }

    async fn save_workspace(&self, workspace: &Workspace) -> Result<(), OrchestratorError> {
        workspace.validate()?;
        let _guard = self.lock.lock().await;
        let mut document = self.read_document().await?;
        document
            .workspaces
            .insert(workspace.sandbox_id.clone(), workspace.clone());
        self.write_document(&document).await
    }
}

fn storage_error(path: &Path, err: impl std::fmt::Display) -> OrchestratorError {
    OrchestratorError::Storage {
        message: format!("{}: {err}", path.display()),
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    workspaces: Mutex<HashMap<String, Workspace>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workspace(workspace: Workspace) -> Self {
        let mut workspaces = HashMap::new();
        workspaces.insert(workspace.sandbox_id.clone(), workspace);
        Self {
            workspaces: Mutex::new(workspaces),
        }
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn load_workspace(&self, sandbox_id: &str) -> Result<Workspace, OrchestratorError> {
        Ok(self
            .workspaces
            .lock()
            .await
            .get(sandbox_id)
            .cloned()
            .unwrap_or_else(|| Workspace::new(sandbox_id)))
    }

    async fn save_workspace(&self, workspace: &Workspace) -> Result<(), OrchestratorError> {
        workspace.validate()?;
        self.workspaces
            .lock()
            .await
            .insert(workspace.sandbox_id.clone(), workspace.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_assigned_in_order_and_never_reused_below_the_max() {
        let mut workspace = Workspace::new("sbx-1");
        workspace
            .add_repository("r1", "web", SourceType::Github)
            .expect("add");
        workspace
            .add_repository("r2", "api", SourceType::Local)
            .expect("add");
        assert_eq!(workspace.repositories[1].slot.get(), 1);
        assert_eq!(
            workspace.repositories[1].ports.complete(),
            Some(ports_for_slot(workspace.repositories[1].slot))
        );

        workspace.repositories.remove(0);
        let added = workspace
            .add_repository("r3", "docs", SourceType::Template)
            .expect("add");
        assert_eq!(added.slot.get(), 2);
    }

    #[test]
    fn rejects_duplicate_slots() {
        let mut workspace = Workspace::new("sbx-1");
        workspace
            .add_repository("r1", "web", SourceType::Github)
            .expect("add");
        let mut clone = workspace.repositories[0].clone();
        clone.id = "r2".to_string();
        workspace.repositories.push(clone);
        assert!(matches!(
            workspace.validate(),
            Err(OrchestratorError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn rejects_path_like_names() {
        let mut workspace = Workspace::new("sbx-1");
        assert!(workspace
            .add_repository("r1", "../etc", SourceType::Local)
            .is_err());
    }

    #[tokio::test]
    async fn load_repaired_writes_back_missing_ports() {
        let record: RepositoryRecord = serde_json::from_value(serde_json::json!({
            "id": "r1",
            "name": "web",
            "sourceType": "github",
            "slot": 2,
            "ports": { "editor": 8082, "terminal": 10002 }
        }))
        .expect("record");
        let mut workspace = Workspace::new("sbx-1");
        workspace.repositories.push(record);
        let store = MemoryStore::with_workspace(workspace);

        let loaded = store.load_repaired("sbx-1").await.expect("load");
        assert_eq!(loaded.repositories[0].ports.agent, Some(4002));

        let stored = store.load_workspace("sbx-1").await.expect("load");
        assert_eq!(stored.repositories[0].ports.agent, Some(4002));
    }

    #[test]
    fn deserialization_rejects_out_of_range_slots() {
        let result = serde_json::from_value::<RepositoryRecord>(serde_json::json!({
            "id": "r1",
            "name": "web",
            "sourceType": "github",
            "slot": 1000
        }));
        assert!(result.is_err());
    }
}
