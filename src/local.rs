//! Sandbox runtime backed by a private workspace directory on the host.
//!
//! Each boot gets `<data_root>/<id>/`. Mounting writes the tree there with
//! decoded names, one-shot processes run through `tokio::process` and the
//! interactive shell runs on a PTY.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use portable_pty::{Child, CommandBuilder, MasterPty, NativePtySystem, PtySize, PtySystem};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;
use which::which;

use crate::errors::{SessionError, SessionResult};
use crate::path_codec::EncodedName;
use crate::runtime::{SandboxHandle, SandboxRuntime, ShellProcess, SpawnedProcess};
use crate::tree::{MountNode, MountTree};

const PTY_ROWS: u16 = 40;
const PTY_COLS: u16 = 120;

struct PtyShell {
    #[allow(dead_code)]
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
}

struct LocalSandbox {
    workspace: PathBuf,
    shells: Vec<PtyShell>,
}

enum MountEntry {
    Directory,
    File(String),
}

pub struct LocalRuntime {
    data_root: PathBuf,
    sandboxes: Mutex<HashMap<Uuid, LocalSandbox>>,
}

impl LocalRuntime {
    pub async fn new(data_root: PathBuf) -> SessionResult<Self> {
        if !data_root.exists() {
            fs::create_dir_all(&data_root).await?;
        }
        Ok(Self {
            data_root,
            sandboxes: Mutex::new(HashMap::new()),
        })
    }

    /// Host directory backing the sandbox.
    pub async fn workspace(&self, handle: &SandboxHandle) -> SessionResult<PathBuf> {
        let sandboxes = self.sandboxes.lock().await;
        sandboxes
            .get(&handle.id)
            .map(|sandbox| sandbox.workspace.clone())
            .ok_or_else(|| SessionError::Runtime(format!("sandbox {} not found", handle.id)))
    }
}

#[async_trait]
impl SandboxRuntime for LocalRuntime {
    async fn boot(&self) -> SessionResult<SandboxHandle> {
        let handle = SandboxHandle::new();
        let workspace = self.data_root.join(handle.id.to_string());
        fs::create_dir_all(&workspace).await.map_err(|error| {
            SessionError::Boot(format!(
                "failed to create workspace {}: {error}",
                workspace.display()
            ))
        })?;

        let mut sandboxes = self.sandboxes.lock().await;
        sandboxes.insert(
            handle.id,
            LocalSandbox {
                workspace: workspace.clone(),
                shells: Vec::new(),
            },
        );
        info!(sandbox = %handle.id, workspace = %workspace.display(), "booted local sandbox");
        Ok(handle)
    }

    async fn mount(&self, handle: &SandboxHandle, tree: &MountTree) -> SessionResult<()> {
        let workspace = self.workspace(handle).await?;
        let mut entries = Vec::new();
        flatten_mount(tree, &workspace, &mut entries)?;

        for (path, entry) in &entries {
            match entry {
                MountEntry::Directory => fs::create_dir_all(path).await?,
                MountEntry::File(contents) => {
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent).await?;
                    }
                    fs::write(path, contents).await?;
                }
            }
        }
        debug!(sandbox = %handle.id, entries = entries.len(), "mounted tree");
        Ok(())
    }

    async fn spawn(
        &self,
        handle: &SandboxHandle,
        command: &str,
        args: &[String],
    ) -> SessionResult<SpawnedProcess> {
        let workspace = self.workspace(handle).await?;
        let binary = find_binary(command)?;

        let mut child = Command::new(&binary)
            .args(args)
            .current_dir(&workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| SessionError::Runtime(format!("failed to spawn {command}: {error}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SessionError::Runtime("child stdout unavailable".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SessionError::Runtime("child stderr unavailable".into()))?;

        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let stdout_task = tokio::spawn(forward_lines(stdout, output_tx.clone()));
        let stderr_task = tokio::spawn(forward_lines(stderr, output_tx));

        let (exit_tx, exit_rx) = oneshot::channel();
        let command = command.to_string();
        tokio::spawn(async move {
            let status = child.wait().await;
            let _ = stdout_task.await;
            let _ = stderr_task.await;
            match status {
                Ok(status) => {
                    let _ = exit_tx.send(status.code().unwrap_or(-1));
                }
                Err(error) => warn!("failed to wait for {command}: {error}"),
            }
        });

        Ok(SpawnedProcess {
            output: output_rx,
            exit: exit_rx,
        })
    }

    async fn spawn_shell(&self, handle: &SandboxHandle, shell: &str) -> SessionResult<ShellProcess> {
        let workspace = self.workspace(handle).await?;
        let binary = find_binary(shell)?;

        let system = NativePtySystem::default();
        let pair = system
            .openpty(PtySize {
                rows: PTY_ROWS,
                cols: PTY_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::Runtime(format!("failed to open pty: {e}")))?;

        let mut cmd = CommandBuilder::new(&binary);
        cmd.cwd(&workspace);
        cmd.env("TERM", "xterm-256color");
        cmd.env("LANG", "C.UTF-8");
        cmd.env("LC_ALL", "C.UTF-8");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::Runtime(format!("failed to spawn shell: {e}")))?;
        // Release slave so it closes when child exits
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::Runtime(format!("failed to clone pty reader: {e}")))?;
        let mut writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::Runtime(format!("failed to take pty writer: {e}")))?;

        let (output_tx, output_rx) = mpsc::unbounded_channel::<String>();
        let (input_tx, mut input_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        // Reader thread: PTY -> output channel
        std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            let mut pending = Vec::new();
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        pending.extend_from_slice(&buf[..n]);
                        let chunk = drain_utf8(&mut pending);
                        if chunk.is_empty() {
                            continue;
                        }
                        if output_tx.send(chunk).is_err() {
                            return;
                        }
                    }
                }
            }
            if !pending.is_empty() {
                let _ = output_tx.send(String::from_utf8_lossy(&pending).into_owned());
            }
        });

        // Writer thread: input channel -> PTY
        std::thread::spawn(move || {
            while let Some(data) = input_rx.blocking_recv() {
                if writer.write_all(&data).is_err() {
                    break;
                }
                let _ = writer.flush();
            }
        });

        let mut sandboxes = self.sandboxes.lock().await;
        let sandbox = sandboxes
            .get_mut(&handle.id)
            .ok_or_else(|| SessionError::Runtime(format!("sandbox {} not found", handle.id)))?;
        sandbox.shells.push(PtyShell {
            master: pair.master,
            child,
        });
        info!(sandbox = %handle.id, shell = %binary, "spawned shell");

        Ok(ShellProcess {
            input: input_tx,
            output: output_rx,
        })
    }

    async fn write_file(
        &self,
        handle: &SandboxHandle,
        path: &str,
        contents: &str,
    ) -> SessionResult<()> {
        let workspace = self.workspace(handle).await?;
        let target = resolve_in_workspace(&workspace, path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&target, contents).await?;
        debug!(sandbox = %handle.id, path, "wrote file");
        Ok(())
    }

    async fn remove_path(&self, handle: &SandboxHandle, path: &str) -> SessionResult<()> {
        let workspace = self.workspace(handle).await?;
        let target = resolve_entry(&workspace, path)?;
        let metadata = match fs::symlink_metadata(&target).await {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(()),
            Err(error) => return Err(error.into()),
        };
        if metadata.is_dir() {
            fs::remove_dir_all(&target).await?;
        } else {
            fs::remove_file(&target).await?;
        }
        debug!(sandbox = %handle.id, path, "removed path");
        Ok(())
    }

    async fn rename_path(&self, handle: &SandboxHandle, from: &str, to: &str) -> SessionResult<()> {
        let workspace = self.workspace(handle).await?;
        let source = resolve_entry(&workspace, from)?;
        let target = resolve_entry(&workspace, to)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&source, &target).await?;
        debug!(sandbox = %handle.id, from, to, "renamed path");
        Ok(())
    }

    async fn teardown(&self, handle: &SandboxHandle) -> SessionResult<()> {
        let sandbox = {
            let mut sandboxes = self.sandboxes.lock().await;
            sandboxes.remove(&handle.id)
        };
        let Some(sandbox) = sandbox else {
            return Ok(());
        };

        for mut shell in sandbox.shells {
            if let Err(error) = shell.child.kill() {
                debug!(sandbox = %handle.id, "shell already gone: {error}");
            }
        }

        if let Err(error) = fs::remove_dir_all(&sandbox.workspace).await {
            warn!(
                "failed to remove workspace {}: {error}",
                sandbox.workspace.display()
            );
        }
        info!(sandbox = %handle.id, "removed local sandbox");
        Ok(())
    }
}

async fn forward_lines<R>(reader: R, output: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if output.send(line).is_err() {
            break;
        }
    }
}

fn find_binary(name: &str) -> SessionResult<String> {
    let binary_path = which(name)
        .map_err(|_| SessionError::Runtime(format!("required binary '{name}' not found in PATH")))?
        .to_string_lossy()
        .to_string();
    Ok(binary_path)
}

fn resolve_in_workspace(workspace: &Path, relative: &str) -> SessionResult<PathBuf> {
    let relative = Path::new(relative);
    for component in relative.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(SessionError::Runtime(format!(
                    "path {} escapes the sandbox",
                    relative.display()
                )))
            }
        }
    }
    Ok(workspace.join(relative))
}

/// Like [`resolve_in_workspace`] but never the workspace itself.
fn resolve_entry(workspace: &Path, relative: &str) -> SessionResult<PathBuf> {
    let target = resolve_in_workspace(workspace, relative)?;
    if target == workspace {
        return Err(SessionError::Runtime(
            "refusing to modify the sandbox root".into(),
        ));
    }
    Ok(target)
}

/// Decodes what `pending` holds, keeping an incomplete trailing sequence for
/// the next read. Invalid bytes become U+FFFD.
fn drain_utf8(pending: &mut Vec<u8>) -> String {
    let mut output = String::new();
    loop {
        match std::str::from_utf8(pending) {
            Ok(valid) => {
                output.push_str(valid);
                pending.clear();
                return output;
            }
            Err(error) => {
                let valid_up_to = error.valid_up_to();
                output.push_str(&String::from_utf8_lossy(&pending[..valid_up_to]));
                match error.error_len() {
                    None => {
                        pending.drain(..valid_up_to);
                        return output;
                    }
                    Some(len) => {
                        output.push(char::REPLACEMENT_CHARACTER);
                        pending.drain(..valid_up_to + len);
                    }
                }
            }
        }
    }
}

fn flatten_mount(
    tree: &MountTree,
    prefix: &Path,
    entries: &mut Vec<(PathBuf, MountEntry)>,
) -> SessionResult<()> {
    for (key, node) in tree {
        let name = EncodedName::from_key(key)
            .map_err(|error| SessionError::Runtime(error.to_string()))?
            .display_name();
        let path = resolve_in_workspace(prefix, &name)?;
        match node {
            MountNode::Directory(children) => {
                entries.push((path.clone(), MountEntry::Directory));
                flatten_mount(children, &path, entries)?;
            }
            MountNode::File { contents } => entries.push((path, MountEntry::File(contents.clone()))),
        }
    }
    Ok(())
}
