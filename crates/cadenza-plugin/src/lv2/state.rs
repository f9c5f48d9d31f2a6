//! LV2 state values stored in the plugin's custom data, and project path mapping.
//!
//! String and Path values are kept verbatim, everything else as base64. Paths a
//! plugin saves are made relative to a per-plugin directory inside the project
//! folder so projects can be moved.

use super::urid::{UridMap, URID_ATOM_PATH, URID_ATOM_STRING};
use crate::custom_data::{self, CustomData, CUSTOM_DATA_TYPE_PROPERTY};
use crate::plugin::ProjectFolder;
use base64::Engine as _;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Maps between the absolute paths a plugin uses and the relative ones stored in projects.
#[derive(Debug, Clone)]
pub struct PathMapper {
    project_folder: ProjectFolder,
    plugin_name: Arc<RwLock<String>>,
    temporary: Arc<AtomicBool>,
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "plugin".to_string()
    } else {
        cleaned
    }
}

impl PathMapper {
    pub fn new(project_folder: ProjectFolder, plugin_name: &str) -> Self {
        Self {
            project_folder,
            plugin_name: Arc::new(RwLock::new(plugin_name.to_string())),
            temporary: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_plugin_name(&self, name: &str) {
        *self.plugin_name.write() = name.to_string();
    }

    /// Non-final saves write into a `.tmp` sibling directory.
    pub fn set_temporary(&self, temporary: bool) {
        self.temporary.store(temporary, Ordering::Release);
    }

    /// Directory holding this plugin's files.
    pub fn state_dir(&self) -> PathBuf {
        let base = self
            .project_folder
            .get()
            .unwrap_or_else(|| std::env::temp_dir().join("cadenza-lv2-state"));
        let mut name = format!("{}.lv2state", sanitize(&self.plugin_name.read()));
        if self.temporary.load(Ordering::Acquire) {
            name.push_str(".tmp");
        }
        base.join(name)
    }

    /// Path to store in state for `absolute`.
    ///
    /// Files outside the state directory get a symlink inside it when possible.
    pub fn abstract_path(&self, absolute: &Path) -> PathBuf {
        let dir = self.state_dir();
        if let Ok(relative) = absolute.strip_prefix(&dir) {
            return relative.to_path_buf();
        }
        if !absolute.is_absolute() {
            return absolute.to_path_buf();
        }

        link_into(&dir, absolute).unwrap_or_else(|| absolute.to_path_buf())
    }

    pub fn absolute_path(&self, stored: &Path) -> PathBuf {
        if stored.is_absolute() {
            stored.to_path_buf()
        } else {
            self.state_dir().join(stored)
        }
    }

    /// `state:makePath`: absolute path for a new file, parent directories created.
    pub fn make_path(&self, relative: &Path) -> std::io::Result<PathBuf> {
        let path = self.state_dir().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(path)
    }
}

/// Candidate link names for `file_name`: `loop.wav`, then `loop.2.wav`, `loop.3.wav`, ...
#[cfg(unix)]
fn link_name(file_name: &Path, attempt: u32) -> PathBuf {
    if attempt < 2 {
        return file_name.to_path_buf();
    }
    let stem = file_name.file_stem().unwrap_or_default().to_string_lossy();
    match file_name.extension() {
        Some(ext) => PathBuf::from(format!("{}.{}.{}", stem, attempt, ext.to_string_lossy())),
        None => PathBuf::from(format!("{}.{}", stem, attempt)),
    }
}

#[cfg(unix)]
const MAX_LINK_ATTEMPTS: u32 = 1000;

#[cfg(unix)]
fn link_into(dir: &Path, absolute: &Path) -> Option<PathBuf> {
    if !absolute.exists() {
        return None;
    }
    let file_name = Path::new(absolute.file_name()?);
    std::fs::create_dir_all(dir).ok()?;

    for attempt in 1..MAX_LINK_ATTEMPTS {
        let name = link_name(file_name, attempt);
        let link = dir.join(&name);
        match std::fs::read_link(&link) {
            Ok(target) if target == absolute => return Some(name),
            Ok(_) => continue,
            Err(_) if std::fs::symlink_metadata(&link).is_ok() => continue,
            Err(_) => {
                std::os::unix::fs::symlink(absolute, &link).ok()?;
                return Some(name);
            }
        }
    }
    tracing::warn!("No free link name for '{}'", absolute.display());
    None
}

#[cfg(not(unix))]
fn link_into(_dir: &Path, _absolute: &Path) -> Option<PathBuf> {
    None
}

fn is_text_type(value_type: u32) -> bool {
    value_type == URID_ATOM_STRING || value_type == URID_ATOM_PATH
}

/// `state:store` into the custom data list.
pub fn store_value(
    custom: &mut Vec<CustomData>,
    urids: &UridMap,
    key: u32,
    value: &[u8],
    value_type: u32,
) -> bool {
    let (Some(key_uri), Some(type_uri)) = (urids.unmap(key), urids.unmap(value_type)) else {
        tracing::warn!("State store with unknown key {} or type {}", key, value_type);
        return false;
    };

    let text = if is_text_type(value_type) {
        let end = value.iter().position(|&b| b == 0).unwrap_or(value.len());
        String::from_utf8_lossy(&value[..end]).into_owned()
    } else {
        base64::engine::general_purpose::STANDARD.encode(value)
    };
    custom_data::upsert(custom, CustomData::new(type_uri, key_uri, text));
    true
}

/// `state:retrieve` from the custom data list: value bytes and type URID.
pub fn retrieve_value(custom: &[CustomData], urids: &UridMap, key: u32) -> Option<(Vec<u8>, u32)> {
    let key_uri = urids.unmap(key)?;
    let data = custom
        .iter()
        .find(|d| d.key == key_uri && d.data_type != CUSTOM_DATA_TYPE_PROPERTY)?;
    let value_type = urids.map(&data.data_type);

    if is_text_type(value_type) {
        let mut bytes = data.value.as_bytes().to_vec();
        bytes.push(0);
        return Some((bytes, value_type));
    }
    match base64::engine::general_purpose::STANDARD.decode(&data.value) {
        Ok(bytes) => Some((bytes, value_type)),
        Err(err) => {
            tracing::warn!("State value for '{}' is not valid base64: {}", key_uri, err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::custom_data::CUSTOM_DATA_TYPE_STRING;
    use crate::lv2::urid::URID_ATOM_CHUNK;

    #[test]
    fn test_store_and_retrieve() {
        let urids = UridMap::new();
        let key = urids.map("urn:test:blob");
        let path_key = urids.map("urn:test:sample");
        let mut custom = vec![CustomData::new(CUSTOM_DATA_TYPE_STRING, "other", "x")];

        assert!(store_value(&mut custom, &urids, key, &[0, 1, 2, 255], URID_ATOM_CHUNK));
        assert!(store_value(&mut custom, &urids, path_key, b"kick.wav\0", URID_ATOM_PATH));

        let stored = custom.iter().find(|d| d.key == "urn:test:sample").unwrap();
        assert_eq!(stored.value, "kick.wav");

        assert_eq!(
            retrieve_value(&custom, &urids, key),
            Some((vec![0, 1, 2, 255], URID_ATOM_CHUNK))
        );
        assert_eq!(
            retrieve_value(&custom, &urids, path_key),
            Some((b"kick.wav\0".to_vec(), URID_ATOM_PATH))
        );
    }

    #[test]
    fn test_property_entries_are_not_state() {
        let urids = UridMap::new();
        let key = urids.map("CarlaUiVisible");
        let custom = vec![CustomData::new(CUSTOM_DATA_TYPE_PROPERTY, "CarlaUiVisible", "true")];
        assert_eq!(retrieve_value(&custom, &urids, key), None);
    }

    #[test]
    fn test_paths_are_relative_to_project() {
        let dir = tempfile::tempdir().unwrap();
        let folder = ProjectFolder::default();
        folder.set(Some(dir.path().to_path_buf()));
        let mapper = PathMapper::new(folder, "My Synth");

        let state_dir = mapper.state_dir();
        assert_eq!(state_dir, dir.path().join("My_Synth.lv2state"));

        let made = mapper.make_path(Path::new("samples/a.wav")).unwrap();
        assert!(made.parent().unwrap().is_dir());
        assert_eq!(mapper.abstract_path(&made), PathBuf::from("samples/a.wav"));
        assert_eq!(mapper.absolute_path(Path::new("samples/a.wav")), made);

        mapper.set_temporary(true);
        assert_eq!(mapper.state_dir(), dir.path().join("My_Synth.lv2state.tmp"));
    }

    #[cfg(unix)]
    #[test]
    fn test_link_names_get_numbered() {
        assert_eq!(link_name(Path::new("loop.wav"), 1), PathBuf::from("loop.wav"));
        assert_eq!(link_name(Path::new("loop.wav"), 3), PathBuf::from("loop.3.wav"));
        assert_eq!(link_name(Path::new("README"), 2), PathBuf::from("README.2"));
    }

    #[cfg(unix)]
    #[test]
    fn test_same_basename_from_different_folders_gets_distinct_links() {
        let project = tempfile::tempdir().unwrap();
        let first_dir = tempfile::tempdir().unwrap();
        let second_dir = tempfile::tempdir().unwrap();
        let first = first_dir.path().join("kick.wav");
        let second = second_dir.path().join("kick.wav");
        std::fs::write(&first, b"one").unwrap();
        std::fs::write(&second, b"two").unwrap();

        let folder = ProjectFolder::default();
        folder.set(Some(project.path().to_path_buf()));
        let mapper = PathMapper::new(folder, "Drums");

        assert_eq!(mapper.abstract_path(&first), PathBuf::from("kick.wav"));
        assert_eq!(mapper.abstract_path(&second), PathBuf::from("kick.2.wav"));
        // mapping again reuses the existing links
        assert_eq!(mapper.abstract_path(&first), PathBuf::from("kick.wav"));
        assert_eq!(mapper.abstract_path(&second), PathBuf::from("kick.2.wav"));

        let stored = mapper.absolute_path(Path::new("kick.2.wav"));
        assert_eq!(std::fs::read(stored).unwrap(), b"two");
    }

    #[cfg(unix)]
    #[test]
    fn test_outside_file_is_linked() {
        let project = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let file = outside.path().join("loop.wav");
        std::fs::write(&file, b"data").unwrap();

        let folder = ProjectFolder::default();
        folder.set(Some(project.path().to_path_buf()));
        let mapper = PathMapper::new(folder, "Looper");

        assert_eq!(mapper.abstract_path(&file), PathBuf::from("loop.wav"));
        let link = mapper.state_dir().join("loop.wav");
        assert_eq!(std::fs::read(link).unwrap(), b"data");
    }
}
