//! Persistent settings for the playground.
//!
//! Settings are stored in the OS-appropriate config directory:
//! - macOS: `~/Library/Application Support/playground/settings.json`
//! - Linux: `~/.config/playground/settings.json`
//! - Windows: `%APPDATA%/playground/settings.json`

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::process_state::OutputPatterns;

const APP_NAME: &str = "playground";
const SETTINGS_FILE: &str = "settings.json";

pub const DEFAULT_API_URL: &str = "http://localhost:3000";
pub const DEFAULT_INSTALL_COMMAND: &str = "npm install";
pub const DEFAULT_SHELL: &str = "jsh";
pub const DEFAULT_TEST_COMMAND: &str =
    "node --experimental-vm-modules --experimental-wasm-threads node_modules/jest/bin/jest.js test";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Base URL of the project persistence API.
    pub api_url: String,
    /// Dependency install command run once after mounting, split on whitespace.
    pub install_command: String,
    /// Interactive shell spawned once installation succeeds.
    pub shell: String,
    /// Command written to the shell to run the project's tests.
    pub test_command: String,
    pub patterns: OutputPatterns,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            install_command: DEFAULT_INSTALL_COMMAND.to_string(),
            shell: DEFAULT_SHELL.to_string(),
            test_command: DEFAULT_TEST_COMMAND.to_string(),
            patterns: OutputPatterns::default(),
        }
    }
}

impl Settings {
    fn path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_NAME).join(SETTINGS_FILE))
    }

    /// Loads settings from disk, falling back to defaults if not found or invalid.
    /// `PLAYGROUND_*` environment variables take precedence over saved settings.
    pub fn load() -> Self {
        let mut settings = Self::path()
            .map(|path| Self::load_from(&path))
            .unwrap_or_default();
        settings.apply_env(|key| std::env::var(key).ok());
        settings
    }

    pub fn load_from(path: &Path) -> Self {
        let Ok(contents) = fs::read_to_string(path) else {
            return Self::default();
        };
        match serde_json::from_str(&contents) {
            Ok(settings) => settings,
            Err(error) => {
                tracing::warn!("ignoring invalid settings at {}: {error}", path.display());
                Self::default()
            }
        }
    }

    pub fn save(&self) -> std::io::Result<()> {
        let Some(path) = Self::path() else {
            return Ok(());
        };
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        fs::write(path, json)
    }

    /// Overrides fields from the variables `lookup` resolves. Blank values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let fields = [
            ("PLAYGROUND_API_URL", &mut self.api_url),
            ("PLAYGROUND_INSTALL_COMMAND", &mut self.install_command),
            ("PLAYGROUND_SHELL", &mut self.shell),
            ("PLAYGROUND_TEST_COMMAND", &mut self.test_command),
        ];
        for (key, field) in fields {
            if let Some(value) = lookup(key).filter(|value| !value.trim().is_empty()) {
                *field = value;
            }
        }
    }

    /// The install command as program plus arguments. `None` when blank.
    pub fn install_argv(&self) -> Option<(String, Vec<String>)> {
        let mut parts = self.install_command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some((program, parts.collect()))
    }
}
