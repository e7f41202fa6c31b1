//! Structural edits on a [`Tree`] snapshot.
//!
//! Every function here is pure: it returns the next snapshot and a
//! [`SyncInstruction`] describing the change, and performs no I/O. The
//! caller applies the snapshot locally, then persists and mirrors the
//! instruction on its own terms.

use std::sync::Arc;

use crate::errors::{TreeError, TreeResult};
use crate::path_codec::{encode, sandbox_path, EncodedName, LogicalPath, NodeKind, SandboxPath};
use crate::tree::{Directory, EntryKey, FileNode, Node, Tree};

/// What the persistence layer has to replay for a mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncInstruction {
    None,
    Create {
        location: SandboxPath,
        kind: NodeKind,
    },
    Rename {
        from: SandboxPath,
        to: SandboxPath,
    },
    Delete {
        location: SandboxPath,
    },
    Save {
        location: SandboxPath,
        code: String,
    },
}

#[derive(Clone, Debug)]
pub struct Mutation {
    pub tree: Tree,
    pub sync: SyncInstruction,
    /// Set when the edit removed the file currently open in the editor.
    pub close_editor: bool,
}

impl Mutation {
    fn unchanged(tree: &Tree) -> Self {
        Self {
            tree: tree.clone(),
            sync: SyncInstruction::None,
            close_editor: false,
        }
    }

    fn new(tree: Tree, sync: SyncInstruction) -> Self {
        Self {
            tree,
            sync,
            close_editor: false,
        }
    }
}

/// Adds an empty entry of `kind` under `directory`.
///
/// An empty `proposed_name` inserts the pending placeholder, replacing any
/// earlier one in that directory; the entry is named later through
/// [`rename_entry`]. Otherwise the entry is created directly.
pub fn create_entry(
    tree: &Tree,
    kind: NodeKind,
    directory: &Directory,
    proposed_name: &str,
) -> TreeResult<Mutation> {
    if proposed_name.is_empty() {
        let (tree, ()) = tree.edit_directory(&directory.path, |entries| {
            entries.insert(EntryKey::Pending, Arc::new(Node::empty(kind)));
            Ok(())
        })?;
        return Ok(Mutation::new(tree, SyncInstruction::None));
    }

    let name = encode(proposed_name)?;
    let key = EntryKey::Committed(name.clone());
    let (tree, ()) = tree.edit_directory(&directory.path, |entries| {
        if entries.contains(&key) {
            return Err(TreeError::DuplicateName(proposed_name.to_string()));
        }
        entries.insert(key, Arc::new(Node::empty(kind)));
        Ok(())
    })?;
    Ok(Mutation::new(
        tree,
        SyncInstruction::Create {
            location: directory.entry_location(&name).with_accessor(kind),
            kind,
        },
    ))
}

/// Names the entry at `old_key` as `new_name`.
///
/// Naming the placeholder is a create; naming a committed entry is a rename
/// that carries its subtree along. A name that decodes to the current one
/// cancels the edit: a committed entry stays as it is, a placeholder is
/// dropped.
pub fn rename_entry(
    tree: &Tree,
    directory: &Directory,
    old_key: &EntryKey,
    new_name: &EncodedName,
) -> TreeResult<Mutation> {
    let entries = tree.directory(&directory.path)?;
    if !entries.contains(old_key) {
        return Err(TreeError::NotFound(
            directory.path.join(old_key.display_name()).to_string(),
        ));
    }

    if new_name.display_name() == old_key.display_name() {
        return match old_key {
            EntryKey::Pending => delete_entry(tree, directory, old_key, None),
            EntryKey::Committed(_) => Ok(Mutation::unchanged(tree)),
        };
    }
    if new_name.is_empty() {
        return Err(TreeError::InvalidName(String::new()));
    }

    let new_key = EntryKey::Committed(new_name.clone());
    let (tree, kind) = tree.edit_directory(&directory.path, |entries| {
        if entries.contains(&new_key) {
            return Err(TreeError::DuplicateName(new_name.display_name()));
        }
        let node = entries
            .remove(old_key)
            .ok_or_else(|| TreeError::NotFound(old_key.display_name()))?;
        let kind = node.kind();
        entries.insert(new_key, node);
        Ok(kind)
    })?;

    let sync = match old_key {
        EntryKey::Pending => SyncInstruction::Create {
            location: directory.entry_location(new_name).with_accessor(kind),
            kind,
        },
        EntryKey::Committed(old_name) => SyncInstruction::Rename {
            from: directory.entry_location(old_name),
            to: directory.entry_location(new_name),
        },
    };
    Ok(Mutation::new(tree, sync))
}

/// Removes the entry at `key` together with everything below it.
///
/// `open_file` is the file shown in the editor, if any; when it is removed
/// the returned mutation has `close_editor` set.
pub fn delete_entry(
    tree: &Tree,
    directory: &Directory,
    key: &EntryKey,
    open_file: Option<&LogicalPath>,
) -> TreeResult<Mutation> {
    let (tree, ()) = tree.edit_directory(&directory.path, |entries| {
        entries
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| TreeError::NotFound(directory.path.join(key.display_name()).to_string()))
    })?;

    let Some(name) = key.committed() else {
        return Ok(Mutation::new(tree, SyncInstruction::None));
    };
    let removed = directory.entry_path(name);
    Ok(Mutation {
        tree,
        sync: SyncInstruction::Delete {
            location: directory.entry_location(name),
        },
        close_editor: open_file.is_some_and(|open| open.starts_with(&removed)),
    })
}

/// Replaces the contents of the file at `path`.
pub fn update_contents(tree: &Tree, path: &LogicalPath, contents: &str) -> TreeResult<Mutation> {
    let (Some(parent), Some(file_name)) = (path.parent(), path.file_name()) else {
        return Err(TreeError::NotAFile(path.to_string()));
    };
    let name = encode(file_name)?;
    let key = EntryKey::Committed(name);
    let (tree, ()) = tree.edit_directory(&parent, |entries| {
        match entries.get(&key).map(Node::kind) {
            Some(NodeKind::File) => {}
            Some(NodeKind::Directory) => return Err(TreeError::NotAFile(path.to_string())),
            None => return Err(TreeError::NotFound(path.to_string())),
        }
        entries.insert(key, Arc::new(Node::File(FileNode::new(contents))));
        Ok(())
    })?;
    Ok(Mutation::new(
        tree,
        SyncInstruction::Save {
            location: sandbox_path(&path.encoded()?, NodeKind::File),
            code: contents.to_string(),
        },
    ))
}
