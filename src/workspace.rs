//! One open project: its tree, the editor's open file, unsaved changes and
//! the optional live sandbox.
//!
//! Every edit is applied to the tree first. Mirroring into the sandbox and
//! the remote call follow, and neither can undo the local change: a failed
//! remote call leaves the change flagged as unsaved.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::errors::{PersistenceResult, TreeResult};
use crate::mutation::{self, Mutation, SyncInstruction};
use crate::path_codec::{encode, sandbox_path, LogicalPath, NodeKind, SandboxPath};
use crate::persistence::{ChangeTracker, ChangedField, PersistenceBackend};
use crate::session::SandboxSession;
use crate::tree::{Directory, EntryKey, Tree};

/// Outcome of replaying an edit remotely.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncStatus {
    Synced,
    /// Nothing to persist, e.g. a placeholder or a no-op rename.
    Skipped,
    /// The remote call failed; the local tree keeps the change.
    Unsaved(String),
}

impl SyncStatus {
    pub fn is_unsaved(&self) -> bool {
        matches!(self, SyncStatus::Unsaved(_))
    }
}

/// How an edit reaches the live sandbox.
enum Mirror {
    Write(LogicalPath, String),
    Remove(LogicalPath),
    Rename(LogicalPath, LogicalPath),
    Remount,
}

impl Mirror {
    fn created(kind: NodeKind, path: LogicalPath) -> Self {
        match kind {
            NodeKind::File => Mirror::Write(path, String::new()),
            NodeKind::Directory => Mirror::Remount,
        }
    }
}

pub struct Workspace {
    project_id: String,
    tree: Tree,
    backend: Arc<dyn PersistenceBackend>,
    changes: ChangeTracker,
    failed: Vec<SyncInstruction>,
    session: Option<Arc<SandboxSession>>,
    open_file: Option<LogicalPath>,
}

impl Workspace {
    pub fn new(project_id: impl Into<String>, tree: Tree, backend: Arc<dyn PersistenceBackend>) -> Self {
        Self {
            project_id: project_id.into(),
            tree,
            backend,
            changes: ChangeTracker::new(),
            failed: Vec::new(),
            session: None,
            open_file: None,
        }
    }

    /// Fetches the persisted tree for `project_id`.
    pub async fn load(
        project_id: impl Into<String>,
        backend: Arc<dyn PersistenceBackend>,
    ) -> PersistenceResult<Self> {
        let project_id = project_id.into();
        let tree = backend.load(&project_id).await?;
        debug!(project = %project_id, files = tree.files().len(), "loaded project tree");
        Ok(Self::new(project_id, tree, backend))
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn open_file(&self) -> Option<&LogicalPath> {
        self.open_file.as_ref()
    }

    pub fn changes(&self) -> &ChangeTracker {
        &self.changes
    }

    /// Structural edits whose remote call failed, oldest first.
    pub fn failed(&self) -> &[SyncInstruction] {
        &self.failed
    }

    pub fn session(&self) -> Option<&Arc<SandboxSession>> {
        self.session.as_ref()
    }

    pub fn attach_session(&mut self, session: Arc<SandboxSession>) {
        self.session = Some(session);
    }

    pub fn detach_session(&mut self) -> Option<Arc<SandboxSession>> {
        self.session.take()
    }

    /// Opens the file at `path` in the editor and returns what it should show:
    /// the pending edit if there is one, else the stored contents.
    pub fn open(&mut self, path: &LogicalPath) -> TreeResult<String> {
        let stored = self.tree.file_contents(path)?.to_string();
        let location = save_location(path)?;
        self.open_file = Some(path.clone());
        Ok(self
            .changes
            .get(&location)
            .filter(|field| !field.saved)
            .map(|field| field.code.clone())
            .unwrap_or(stored))
    }

    /// Shows an unnamed placeholder of `kind` under `directory`.
    pub fn begin_create(&mut self, kind: NodeKind, directory: &Directory) -> TreeResult<()> {
        let Mutation { tree, .. } = mutation::create_entry(&self.tree, kind, directory, "")?;
        self.tree = tree;
        Ok(())
    }

    /// Creates `name` under `directory` in one step.
    pub async fn create(
        &mut self,
        kind: NodeKind,
        directory: &Directory,
        name: &str,
    ) -> TreeResult<SyncStatus> {
        let mutation = mutation::create_entry(&self.tree, kind, directory, name)?;
        let mirror = Mirror::created(kind, directory.path.join(name));
        Ok(self.commit(mutation, mirror).await)
    }

    /// Names the entry at `key`: confirms a placeholder or renames an entry.
    pub async fn confirm(
        &mut self,
        directory: &Directory,
        key: &EntryKey,
        new_name: &str,
    ) -> TreeResult<SyncStatus> {
        let encoded = encode(new_name)?;
        let mutation = mutation::rename_entry(&self.tree, directory, key, &encoded)?;
        let new_path = directory.entry_path(&encoded);

        let mirror = match (key.committed(), &mutation.sync) {
            (Some(old_name), SyncInstruction::Rename { from, to }) => {
                let old_path = directory.entry_path(old_name);
                self.open_file = self
                    .open_file
                    .take()
                    .map(|open| open.replace_prefix(&old_path, &new_path).unwrap_or(open));
                self.changes.rename_prefix(from, to);
                Mirror::Rename(old_path, new_path)
            }
            (_, SyncInstruction::Create { kind, .. }) => Mirror::created(*kind, new_path),
            _ => Mirror::Remount,
        };
        Ok(self.commit(mutation, mirror).await)
    }

    pub async fn delete(&mut self, directory: &Directory, key: &EntryKey) -> TreeResult<SyncStatus> {
        let mutation =
            mutation::delete_entry(&self.tree, directory, key, self.open_file.as_ref())?;
        if let SyncInstruction::Delete { location } = &mutation.sync {
            self.changes.forget_prefix(location);
        }
        let path = directory.path.join(key.display_name());
        Ok(self.commit(mutation, Mirror::Remove(path)).await)
    }

    /// Records an editor change without saving it.
    pub fn edit(&mut self, path: &LogicalPath, code: impl Into<String>) -> TreeResult<()> {
        self.tree.file_contents(path)?;
        self.changes.record_edit(save_location(path)?, code);
        Ok(())
    }

    pub fn is_unsaved(&self, path: &LogicalPath) -> bool {
        save_location(path).is_ok_and(|location| self.changes.is_unsaved(&location))
    }

    /// Writes the pending edit of `path` (or its current contents) into the
    /// tree, the sandbox and the backend.
    pub async fn save(&mut self, path: &LogicalPath) -> TreeResult<SyncStatus> {
        let location = save_location(path)?;
        let code = match self.changes.get(&location) {
            Some(ChangedField { code, .. }) => code.clone(),
            None => self.tree.file_contents(path)?.to_string(),
        };
        let mutation = mutation::update_contents(&self.tree, path, &code)?;
        Ok(self.commit(mutation, Mirror::Write(path.clone(), code)).await)
    }

    /// Replays structural edits whose remote call failed. Returns how many
    /// are still failing.
    pub async fn retry_failed(&mut self) -> usize {
        let pending = std::mem::take(&mut self.failed);
        for instruction in pending {
            if let Err(error) = self.backend.apply(&self.project_id, &instruction).await {
                warn!(project = %self.project_id, "retry failed: {error}");
                self.failed.push(instruction);
            }
        }
        self.failed.len()
    }

    async fn commit(&mut self, mutation: Mutation, mirror: Mirror) -> SyncStatus {
        let Mutation {
            tree,
            sync,
            close_editor,
        } = mutation;
        self.tree = tree;
        if close_editor {
            debug!("open file removed, closing editor");
            self.open_file = None;
        }
        if sync == SyncInstruction::None {
            return SyncStatus::Skipped;
        }

        self.mirror(mirror).await;

        match self.backend.apply(&self.project_id, &sync).await {
            Ok(()) => {
                if let SyncInstruction::Save { location, .. } = &sync {
                    self.changes.mark_saved(location);
                }
                SyncStatus::Synced
            }
            Err(error) => {
                warn!(project = %self.project_id, ?sync, "failed to persist change: {error}");
                match sync {
                    SyncInstruction::Save { location, code } => {
                        self.changes.mark_unsaved(&location, &code)
                    }
                    other => self.failed.push(other),
                }
                SyncStatus::Unsaved(error.to_string())
            }
        }
    }

    /// Keeps a live sandbox in step with the tree. Failures are logged only.
    async fn mirror(&self, mirror: Mirror) {
        let Some(session) = &self.session else {
            return;
        };
        let result = match &mirror {
            Mirror::Write(path, code) => session.write_file(path, code).await,
            Mirror::Remove(path) => session.remove_path(path).await,
            Mirror::Rename(from, to) => session.rename_path(from, to).await,
            Mirror::Remount => session.mount(&self.tree).await,
        };
        if let Err(error) = result {
            warn!("failed to mirror change into sandbox: {error}");
        }
    }
}

fn save_location(path: &LogicalPath) -> TreeResult<SandboxPath> {
    Ok(sandbox_path(&path.encoded()?, NodeKind::File))
}
