//! On-disk layout for configuration and mission documents
//!
//! A workspace root (default `.sortie/`) holds `config.json` and a
//! `missions/` directory of saved MissionInit documents keyed by their
//! fingerprint. All writes go through a temp file and a rename.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::OrchestratorConfig;
use super::mission::MissionInit;

/// Paths under one workspace root
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// Storage rooted at `root`; nothing is created until written
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Workspace root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of `config.json`
    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    /// Directory of saved mission documents
    pub fn missions_dir(&self) -> PathBuf {
        self.root.join("missions")
    }

    /// Where a mission document with this fingerprint lives
    pub fn mission_path(&self, fingerprint: &str) -> PathBuf {
        self.missions_dir().join(format!("{}.json", fingerprint))
    }

    /// Write data atomically to a file
    ///
    /// Writes a sibling temp file, syncs it, renames it over `path`, then
    /// syncs the parent directory.
    pub fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()> {
        let temp_path = path.with_extension("tmp");

        let mut file = File::create(&temp_path)
            .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;
        file.write_all(data).context("Failed to write data")?;
        file.sync_all().context("Failed to sync file")?;
        drop(file);

        fs::rename(&temp_path, path)
            .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, path))?;

        if let Some(parent) = path.parent() {
            let dir = OpenOptions::new()
                .read(true)
                .open(parent)
                .with_context(|| format!("Failed to open directory: {:?}", parent))?;
            dir.sync_all().context("Failed to sync directory")?;
        }
        Ok(())
    }

    /// Read a whole file
    pub fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path).with_context(|| format!("Failed to read file: {:?}", path))
    }

    /// Saved mission fingerprints, sorted
    pub fn list_missions(&self) -> Result<Vec<String>> {
        let dir = self.missions_dir();
        let mut names = Vec::new();
        for entry in
            fs::read_dir(&dir).with_context(|| format!("Failed to read directory: {:?}", dir))?
        {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(stem) = path.file_stem() {
                    names.push(stem.to_string_lossy().into_owned());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Create the workspace directories
pub fn init_storage(root: &Path) -> Result<Storage> {
    let storage = Storage::new(root);
    fs::create_dir_all(storage.missions_dir())
        .with_context(|| format!("Failed to create directory: {:?}", storage.missions_dir()))?;
    Ok(storage)
}

/// Write the orchestrator configuration
pub fn write_config(root: &Path, config: &OrchestratorConfig) -> Result<()> {
    config.validate().context("Refusing to write invalid config")?;
    let storage = Storage::new(root);
    let json = serde_json::to_vec_pretty(config).context("Failed to serialize config")?;
    storage.write_atomic(&storage.config_path(), &json)
}

/// Load the orchestrator configuration; a missing file yields the defaults
pub fn load_config(root: &Path) -> Result<OrchestratorConfig> {
    let storage = Storage::new(root);
    let path = storage.config_path();
    if !path.exists() {
        tracing::debug!("No config at {:?}; using defaults", path);
        return Ok(OrchestratorConfig::default());
    }
    let data = storage.read_file(&path)?;
    let config: OrchestratorConfig =
        serde_json::from_slice(&data).context("Failed to deserialize config")?;
    config.validate().context("Invalid config on disk")?;
    Ok(config)
}

/// Save a mission document; returns its fingerprint
pub fn save_mission(root: &Path, mission: &MissionInit) -> Result<String> {
    let storage = init_storage(root)?;
    let fingerprint = mission.fingerprint();
    let bytes = mission.to_bytes().context("Failed to encode mission")?;
    storage.write_atomic(&storage.mission_path(&fingerprint), &bytes)?;
    Ok(fingerprint)
}

/// Read and validate a mission document from any path
pub fn read_mission(path: &Path) -> Result<MissionInit> {
    let data = fs::read(path).with_context(|| format!("Failed to read file: {:?}", path))?;
    MissionInit::from_bytes(&data).with_context(|| format!("Invalid mission document: {:?}", path))
}
