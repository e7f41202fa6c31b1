//! Remote persistence of tree edits.
//!
//! The backend stores the project tree keyed by [`SandboxPath`]. Edits are
//! replayed as Update/Delete requests; failures are reported to the caller,
//! who keeps the local tree and flags the change through [`ChangeTracker`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{PersistenceError, PersistenceResult};
use crate::mutation::SyncInstruction;
use crate::path_codec::SandboxPath;
use crate::tree::{MountTree, Tree};

/// Body of an Update call. `rename` marks a rename; `code` alone marks a
/// save or a file create.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub location: SandboxPath,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rename: Option<SandboxPath>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub location: SandboxPath,
}

/// A sync instruction expressed as the request the backend expects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PersistRequest {
    Update(UpdateRequest),
    Delete(DeleteRequest),
}

impl PersistRequest {
    /// `None` for instructions that need no remote call.
    pub fn from_instruction(instruction: &SyncInstruction) -> Option<Self> {
        let request = match instruction {
            SyncInstruction::None => return None,
            SyncInstruction::Create { location, kind } => Self::Update(UpdateRequest {
                location: location.clone(),
                code: kind.is_file().then(String::new),
                rename: None,
            }),
            SyncInstruction::Rename { from, to } => Self::Update(UpdateRequest {
                location: from.clone(),
                code: None,
                rename: Some(to.clone()),
            }),
            SyncInstruction::Delete { location } => Self::Delete(DeleteRequest {
                location: location.clone(),
            }),
            SyncInstruction::Save { location, code } => Self::Update(UpdateRequest {
                location: location.clone(),
                code: Some(code.clone()),
                rename: None,
            }),
        };
        Some(request)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectTreeResponse {
    file_system_tree: MountTree,
}

#[async_trait]
pub trait PersistenceBackend: Send + Sync + 'static {
    async fn update(&self, project_id: &str, request: &UpdateRequest) -> PersistenceResult<()>;
    async fn delete(&self, project_id: &str, request: &DeleteRequest) -> PersistenceResult<()>;
    async fn load(&self, project_id: &str) -> PersistenceResult<Tree>;

    /// Replays `instruction`. A no-op for [`SyncInstruction::None`].
    async fn apply(&self, project_id: &str, instruction: &SyncInstruction) -> PersistenceResult<()> {
        match PersistRequest::from_instruction(instruction) {
            None => Ok(()),
            Some(PersistRequest::Update(request)) => self.update(project_id, &request).await,
            Some(PersistRequest::Delete(request)) => self.delete(project_id, &request).await,
        }
    }
}

/// Backend reached over HTTP at `{base_url}/fileTree/{project_id}`.
pub struct HttpBackend {
    client: Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub fn project_url(&self, project_id: &str) -> String {
        format!("{}/fileTree/{project_id}", self.base_url)
    }
}

async fn check_status(response: Response) -> PersistenceResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(PersistenceError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl PersistenceBackend for HttpBackend {
    async fn update(&self, project_id: &str, request: &UpdateRequest) -> PersistenceResult<()> {
        let url = self.project_url(project_id);
        debug!(location = %request.location, rename = ?request.rename, "persisting update");
        let response = self.client.patch(url).json(request).send().await?;
        check_status(response).await?;
        Ok(())
    }

    async fn delete(&self, project_id: &str, request: &DeleteRequest) -> PersistenceResult<()> {
        let url = self.project_url(project_id);
        debug!(location = %request.location, "persisting delete");
        let response = self.client.delete(url).json(request).send().await?;
        check_status(response).await?;
        Ok(())
    }

    async fn load(&self, project_id: &str) -> PersistenceResult<Tree> {
        let url = self.project_url(project_id);
        let response = check_status(self.client.get(url).send().await?).await?;
        let payload: ProjectTreeResponse = response.json().await?;
        Tree::from_mount_tree(payload.file_system_tree)
            .map_err(|error| PersistenceError::Decode(error.to_string()))
    }
}

/// Pending editor contents for one file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangedField {
    pub code: String,
    pub saved: bool,
}

/// Editor changes keyed by the file's save location.
#[derive(Clone, Debug, Default)]
pub struct ChangeTracker {
    fields: BTreeMap<SandboxPath, ChangedField>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_edit(&mut self, location: SandboxPath, code: impl Into<String>) {
        self.fields.insert(
            location,
            ChangedField {
                code: code.into(),
                saved: false,
            },
        );
    }

    pub fn mark_saved(&mut self, location: &SandboxPath) {
        if let Some(field) = self.fields.get_mut(location) {
            field.saved = true;
        }
    }

    /// Flags `location` as unsaved, recording `code` when nothing was tracked yet.
    pub fn mark_unsaved(&mut self, location: &SandboxPath, code: &str) {
        self.fields
            .entry(location.clone())
            .and_modify(|field| field.saved = false)
            .or_insert_with(|| ChangedField {
                code: code.to_string(),
                saved: false,
            });
    }

    pub fn get(&self, location: &SandboxPath) -> Option<&ChangedField> {
        self.fields.get(location)
    }

    pub fn is_unsaved(&self, location: &SandboxPath) -> bool {
        self.fields.get(location).is_some_and(|field| !field.saved)
    }

    pub fn unsaved(&self) -> impl Iterator<Item = (&SandboxPath, &ChangedField)> {
        self.fields.iter().filter(|(_, field)| !field.saved)
    }

    /// Drops every field at or below `prefix`.
    pub fn forget_prefix(&mut self, prefix: &SandboxPath) {
        self.fields.retain(|location, _| !location.starts_with(prefix));
    }

    /// Moves every field at or below `from` under `to`.
    pub fn rename_prefix(&mut self, from: &SandboxPath, to: &SandboxPath) {
        let moved: Vec<_> = self
            .fields
            .keys()
            .filter(|location| location.starts_with(from))
            .cloned()
            .collect();
        for location in moved {
            if let (Some(field), Some(renamed)) = (
                self.fields.remove(&location),
                location.replace_prefix(from, to),
            ) {
                self.fields.insert(renamed, field);
            }
        }
    }
}
