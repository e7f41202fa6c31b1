//! The project file tree.
//!
//! A [`Tree`] is immutable: edits build a new root that shares every
//! untouched subtree with the previous snapshot through `Arc`. Only the
//! spine from the root to the edited directory is copied.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::{TreeError, TreeResult};
use crate::path_codec::{combine, encode, EncodedName, LogicalPath, NodeKind, SandboxPath};

const PACKAGE_MANIFEST: &str = "package.json";

/// Key of a directory entry.
///
/// `Pending` is the in-progress entry of a create that has not been named yet.
/// A directory holds at most one, and it is never persisted or mounted.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntryKey {
    Pending,
    Committed(EncodedName),
}

impl EntryKey {
    pub fn display_name(&self) -> String {
        match self {
            EntryKey::Pending => String::new(),
            EntryKey::Committed(name) => name.display_name(),
        }
    }

    pub fn committed(&self) -> Option<&EncodedName> {
        match self {
            EntryKey::Pending => None,
            EntryKey::Committed(name) => Some(name),
        }
    }
}

impl From<EncodedName> for EntryKey {
    fn from(name: EncodedName) -> Self {
        EntryKey::Committed(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Node {
    Directory(DirectoryNode),
    File(FileNode),
}

impl Node {
    pub fn empty(kind: NodeKind) -> Self {
        match kind {
            NodeKind::File => Node::File(FileNode::default()),
            NodeKind::Directory => Node::Directory(DirectoryNode::default()),
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Directory(_) => NodeKind::Directory,
            Node::File(_) => NodeKind::File,
        }
    }

    pub fn as_directory(&self) -> Option<&DirectoryNode> {
        match self {
            Node::Directory(directory) => Some(directory),
            Node::File(_) => None,
        }
    }

    pub fn as_file(&self) -> Option<&FileNode> {
        match self {
            Node::File(file) => Some(file),
            Node::Directory(_) => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DirectoryNode {
    entries: BTreeMap<EntryKey, Arc<Node>>,
}

impl DirectoryNode {
    pub fn get(&self, key: &EntryKey) -> Option<&Node> {
        self.entries.get(key).map(Arc::as_ref)
    }

    pub fn contains(&self, key: &EntryKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn pending(&self) -> Option<&Node> {
        self.get(&EntryKey::Pending)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&EntryKey, &Node)> {
        self.entries.iter().map(|(key, node)| (key, node.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn insert(&mut self, key: EntryKey, node: Arc<Node>) {
        self.entries.insert(key, node);
    }

    pub(crate) fn remove(&mut self, key: &EntryKey) -> Option<Arc<Node>> {
        self.entries.remove(key)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileNode {
    contents: String,
}

impl FileNode {
    pub fn new(contents: impl Into<String>) -> Self {
        Self {
            contents: contents.into(),
        }
    }

    pub fn contents(&self) -> &str {
        &self.contents
    }
}

/// Sandbox-native node shape: `{"directory": {...}}` or `{"file": {"contents": "..."}}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountNode {
    Directory(MountTree),
    File { contents: String },
}

/// Sandbox-native tree keyed by encoded names.
pub type MountTree = BTreeMap<String, MountNode>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "MountTree", into = "MountTree")]
pub struct Tree {
    root: Arc<Node>,
}

impl Default for Tree {
    fn default() -> Self {
        Self {
            root: Arc::new(Node::Directory(DirectoryNode::default())),
        }
    }
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_mount_tree(tree: MountTree) -> TreeResult<Self> {
        Ok(Self {
            root: Arc::new(Node::Directory(directory_from_mount(tree)?)),
        })
    }

    /// Converts to the mount shape. Pending entries are left out.
    pub fn to_mount_tree(&self) -> MountTree {
        match self.root.as_ref() {
            Node::Directory(directory) => directory_to_mount(directory),
            Node::File(_) => MountTree::new(),
        }
    }

    pub fn get(&self, path: &LogicalPath) -> Option<&Node> {
        let segments = path.encoded().ok()?;
        let mut node = self.root.as_ref();
        for segment in segments {
            let directory = node.as_directory()?;
            node = directory.get(&EntryKey::Committed(segment))?;
        }
        Some(node)
    }

    pub fn contains(&self, path: &LogicalPath) -> bool {
        self.get(path).is_some()
    }

    pub fn directory(&self, path: &LogicalPath) -> TreeResult<&DirectoryNode> {
        match self.get(path) {
            Some(Node::Directory(directory)) => Ok(directory),
            Some(Node::File(_)) => Err(TreeError::NotADirectory(path.to_string())),
            None => Err(TreeError::NotFound(path.to_string())),
        }
    }

    pub fn file_contents(&self, path: &LogicalPath) -> TreeResult<&str> {
        match self.get(path) {
            Some(Node::File(file)) => Ok(file.contents()),
            Some(Node::Directory(_)) => Err(TreeError::NotAFile(path.to_string())),
            None => Err(TreeError::NotFound(path.to_string())),
        }
    }

    /// Logical paths of every committed file, depth first in key order.
    pub fn files(&self) -> Vec<LogicalPath> {
        let mut files = Vec::new();
        if let Node::Directory(directory) = self.root.as_ref() {
            collect_files(directory, &LogicalPath::root(), &mut files);
        }
        files
    }

    /// The `scripts` table of the root `package.json`, empty when missing or unparsable.
    pub fn package_scripts(&self) -> BTreeMap<String, String> {
        let Ok(contents) = self.file_contents(&LogicalPath::parse(PACKAGE_MANIFEST)) else {
            return BTreeMap::new();
        };
        let Ok(manifest) = serde_json::from_str::<serde_json::Value>(contents) else {
            return BTreeMap::new();
        };
        manifest
            .get("scripts")
            .and_then(serde_json::Value::as_object)
            .map(|scripts| {
                scripts
                    .iter()
                    .filter_map(|(name, command)| {
                        command.as_str().map(|command| (name.clone(), command.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Builds a new snapshot with `edit` applied to the directory at `path`.
    pub(crate) fn edit_directory<R, F>(&self, path: &LogicalPath, edit: F) -> TreeResult<(Tree, R)>
    where
        F: FnOnce(&mut DirectoryNode) -> TreeResult<R>,
    {
        let segments = path.encoded()?;
        let (root, result) = edit_node(&self.root, &segments, path, edit)?;
        Ok((
            Tree {
                root: Arc::new(root),
            },
            result,
        ))
    }
}

impl TryFrom<MountTree> for Tree {
    type Error = TreeError;

    fn try_from(tree: MountTree) -> Result<Self, Self::Error> {
        Tree::from_mount_tree(tree)
    }
}

impl From<Tree> for MountTree {
    fn from(tree: Tree) -> Self {
        tree.to_mount_tree()
    }
}

fn edit_node<R, F>(
    node: &Node,
    segments: &[EncodedName],
    label: &LogicalPath,
    edit: F,
) -> TreeResult<(Node, R)>
where
    F: FnOnce(&mut DirectoryNode) -> TreeResult<R>,
{
    let Node::Directory(directory) = node else {
        return Err(TreeError::NotADirectory(label.to_string()));
    };
    let mut directory = directory.clone();
    let result = match segments.split_first() {
        None => edit(&mut directory)?,
        Some((head, rest)) => {
            let key = EntryKey::Committed(head.clone());
            let child = directory
                .entries
                .get(&key)
                .ok_or_else(|| TreeError::NotFound(label.to_string()))?;
            let (child, result) = edit_node(child, rest, label, edit)?;
            directory.entries.insert(key, Arc::new(child));
            result
        }
    };
    Ok((Node::Directory(directory), result))
}

fn directory_from_mount(tree: MountTree) -> TreeResult<DirectoryNode> {
    let mut entries = BTreeMap::new();
    for (key, node) in tree {
        let name = EncodedName::from_key(&key)?;
        let node = match node {
            MountNode::Directory(children) => Node::Directory(directory_from_mount(children)?),
            MountNode::File { contents } => Node::File(FileNode { contents }),
        };
        entries.insert(EntryKey::Committed(name), Arc::new(node));
    }
    Ok(DirectoryNode { entries })
}

fn directory_to_mount(directory: &DirectoryNode) -> MountTree {
    directory
        .entries
        .iter()
        .filter_map(|(key, node)| {
            let name = key.committed()?;
            let node = match node.as_ref() {
                Node::Directory(children) => MountNode::Directory(directory_to_mount(children)),
                Node::File(file) => MountNode::File {
                    contents: file.contents.clone(),
                },
            };
            Some((name.as_str().to_string(), node))
        })
        .collect()
}

fn collect_files(directory: &DirectoryNode, prefix: &LogicalPath, files: &mut Vec<LogicalPath>) {
    for (key, node) in directory.entries() {
        let Some(name) = key.committed() else {
            continue;
        };
        let path = prefix.join(name.display_name());
        match node {
            Node::Directory(children) => collect_files(children, &path, files),
            Node::File(_) => files.push(path),
        }
    }
}

/// A directory position during traversal: its logical path paired with its
/// sandbox prefix, so descendants extend both without walking from the root.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Directory {
    pub path: LogicalPath,
    pub sandbox_path: SandboxPath,
}

impl Directory {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn at(path: &LogicalPath) -> TreeResult<Self> {
        let mut directory = Directory::root();
        for segment in path.segments() {
            directory = directory.child(&encode(segment)?);
        }
        Ok(directory)
    }

    pub fn child(&self, name: &EncodedName) -> Directory {
        Directory {
            path: self.path.join(name.display_name()),
            sandbox_path: combine(&self.sandbox_path, name),
        }
    }

    pub fn entry_path(&self, name: &EncodedName) -> LogicalPath {
        self.path.join(name.display_name())
    }

    pub fn entry_location(&self, name: &EncodedName) -> SandboxPath {
        combine(&self.sandbox_path, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Tree {
        serde_json::from_value(json!({
            "package*json": {"file": {"contents": "{\"scripts\": {\"test\": \"jest\", \"bad\": 1}}"}},
            "src": {"directory": {
                "main*js": {"file": {"contents": "console.log('hi')"}},
                "lib": {"directory": {}}
            }}
        }))
        .unwrap()
    }

    #[test]
    fn get_walks_display_names() {
        let tree = sample();
        let file = tree.get(&LogicalPath::parse("src/main.js")).unwrap();
        assert_eq!(file.as_file().unwrap().contents(), "console.log('hi')");
        assert!(tree.get(&LogicalPath::parse("src/lib")).unwrap().as_directory().is_some());
        assert!(tree.get(&LogicalPath::parse("src/missing.js")).is_none());
        assert!(tree.get(&LogicalPath::parse("src/main.js/deeper")).is_none());
    }

    #[test]
    fn mount_shape_round_trips_through_json() {
        let tree = sample();
        let value = serde_json::to_value(&tree).unwrap();
        assert_eq!(
            value["src"]["directory"]["main*js"],
            json!({"file": {"contents": "console.log('hi')"}})
        );
        let back: Tree = serde_json::from_value(value).unwrap();
        assert_eq!(back, tree);
    }

    #[test]
    fn dotted_keys_are_rejected_on_load() {
        let result = serde_json::from_value::<Tree>(json!({
            "main.js": {"file": {"contents": ""}}
        }));
        assert!(result.is_err());
    }

    #[test]
    fn files_lists_committed_files() {
        let files: Vec<String> = sample().files().iter().map(ToString::to_string).collect();
        assert_eq!(files, vec!["package.json", "src/main.js"]);
    }

    #[test]
    fn package_scripts_keeps_string_commands() {
        let scripts = sample().package_scripts();
        assert_eq!(scripts.len(), 1);
        assert_eq!(scripts.get("test").map(String::as_str), Some("jest"));
        assert!(Tree::new().package_scripts().is_empty());
    }

    #[test]
    fn edits_share_untouched_subtrees() {
        let tree = sample();
        let (edited, ()) = tree
            .edit_directory(&LogicalPath::parse("src/lib"), |directory| {
                directory.insert(
                    EntryKey::Committed(encode("new.rs").unwrap()),
                    Arc::new(Node::empty(NodeKind::File)),
                );
                Ok(())
            })
            .unwrap();

        let key = EntryKey::Committed(encode("package.json").unwrap());
        let (Node::Directory(before), Node::Directory(after)) =
            (tree.root.as_ref(), edited.root.as_ref())
        else {
            panic!("root must be a directory");
        };
        assert!(Arc::ptr_eq(&before.entries[&key], &after.entries[&key]));
        assert!(tree.get(&LogicalPath::parse("src/lib/new.rs")).is_none());
        assert!(edited.get(&LogicalPath::parse("src/lib/new.rs")).is_some());
    }

    #[test]
    fn directory_context_tracks_both_paths() {
        let src = Directory::root().child(&encode("src").unwrap());
        let lib = src.child(&encode("lib.d").unwrap());
        assert_eq!(lib.path.to_string(), "src/lib.d");
        assert_eq!(lib.sandbox_path.as_str(), "src.lib*d");
        assert_eq!(Directory::at(&LogicalPath::parse("src/lib.d")).unwrap(), lib);
    }
}
