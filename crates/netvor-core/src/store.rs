//! Profile store
//!
//! Keeps compiled engine documents on disk under sanitized names and tracks
//! which one is active.
//!
//! ```text
//! <root>/configs/<name>.json   one document per profile
//! <root>/config.json           active slot, the file the engine runs with
//! <root>/active                marker holding the active name
//! ```
//!
//! Every write goes to a temp file first and is renamed into place, so a
//! reader never sees a half-written document.

use crate::error::{Error, Result};
use crate::link;
use crate::translate::{self, EngineConfig};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Directory holding the named documents
const CONFIGS_DIR: &str = "configs";

/// Active slot file name
const ACTIVE_SLOT: &str = "config.json";

/// Active marker file name
const ACTIVE_MARKER: &str = "active";

/// Longest name a document is stored under
pub const MAX_NAME_LEN: usize = 40;

/// On-disk store of compiled documents
pub struct ProfileStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl ProfileStore {
    /// Open (and create if needed) a store rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(CONFIGS_DIR))?;

        debug!("Profile store opened at {}", root.display());

        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    /// Store root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the active slot
    pub fn active_slot(&self) -> PathBuf {
        self.root.join(ACTIVE_SLOT)
    }

    /// Import a share-link, store it and make it active.
    ///
    /// Returns the name the document was stored under. A link that fails to
    /// parse leaves the store untouched.
    pub fn save_link(&self, link: &str) -> Result<String> {
        let profile = link::parse_labeled(link)?;
        let name = match profile.label.as_deref().map(sanitize_name) {
            Some(name) if !name.is_empty() => name,
            _ => fallback_name(),
        };
        let content = translate::render(&profile)?;

        let _guard = self.lock();
        write_atomic(&self.config_path(&name), content.as_bytes())?;
        write_atomic(&self.active_slot(), content.as_bytes())?;
        write_atomic(&self.marker_path(), name.as_bytes())?;

        info!("Imported config '{}' ({}:{})", name, profile.address, profile.port);
        Ok(name)
    }

    /// Stored names, sorted
    pub fn list_configs(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();

        for entry in fs::read_dir(self.root.join(CONFIGS_DIR))? {
            let path = entry?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }

        names.sort();
        Ok(names)
    }

    /// Active name, if the marker exists and names a stored document
    pub fn active_config_name(&self) -> Result<Option<String>> {
        let marker = match fs::read_to_string(self.marker_path()) {
            Ok(content) => content.trim().to_string(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if marker.is_empty() || !self.config_path(&marker).is_file() {
            return Ok(None);
        }
        Ok(Some(marker))
    }

    /// Copy a stored document to the active slot and mark it active
    pub fn activate_config(&self, name: &str) -> Result<()> {
        let path = self.existing_config(name)?;

        let _guard = self.lock();
        let content = fs::read(&path)?;
        write_atomic(&self.active_slot(), &content)?;
        write_atomic(&self.marker_path(), name.as_bytes())?;

        info!("Activated config '{}'", name);
        Ok(())
    }

    /// Remove a stored document, clearing the marker if it was active.
    ///
    /// The active slot keeps its content; without a marker it is never used.
    pub fn delete_config(&self, name: &str) -> Result<()> {
        let path = self.existing_config(name)?;
        let was_active = self.active_config_name()?.as_deref() == Some(name);

        let _guard = self.lock();
        fs::remove_file(&path)?;
        if was_active {
            if let Err(e) = fs::remove_file(self.marker_path()) {
                warn!("Failed to clear active marker: {}", e);
            }
        }

        info!("Deleted config '{}'", name);
        Ok(())
    }

    /// Read a stored document back
    pub fn load_config(&self, name: &str) -> Result<EngineConfig> {
        let path = self.existing_config(name)?;
        let content = fs::read_to_string(&path)?;
        Ok(EngineConfig::from_json(&content)?)
    }

    /// Path of the document the engine should run with
    pub fn resolve_active(&self) -> Result<PathBuf> {
        let Some(name) = self.active_config_name()? else {
            return Err(Error::ConfigNotFound("no active config".into()));
        };

        let slot = self.active_slot();
        if !slot.is_file() {
            return Err(Error::ConfigNotFound(format!(
                "active slot missing for '{}'",
                name
            )));
        }
        Ok(slot)
    }

    fn existing_config(&self, name: &str) -> Result<PathBuf> {
        if !is_valid_name(name) {
            return Err(Error::ConfigNotFound(name.to_string()));
        }
        let path = self.config_path(name);
        if !path.is_file() {
            return Err(Error::ConfigNotFound(name.to_string()));
        }
        Ok(path)
    }

    fn config_path(&self, name: &str) -> PathBuf {
        self.root.join(CONFIGS_DIR).join(format!("{}.json", name))
    }

    fn marker_path(&self) -> PathBuf {
        self.root.join(ACTIVE_MARKER)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        // The guarded value is (), so a poisoned lock carries no broken state.
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Map a display label to a storable name.
///
/// Whitespace becomes `_`, anything outside `[A-Za-z0-9_-]` is dropped and
/// the result is cut to [`MAX_NAME_LEN`]. May return an empty string.
pub fn sanitize_name(label: &str) -> String {
    label
        .trim()
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .take(MAX_NAME_LEN)
        .collect()
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && sanitize_name(name) == name
}

fn fallback_name() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("config_{}", millis)
}

/// Write to a uniquely named temp file beside `path`, then rename over it
fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(content)?;
    temp.persist(path)?;
    Ok(())
}
