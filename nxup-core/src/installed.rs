use crate::manifest::Manifest;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const WORKSPACE_ALIAS: &str = "@nrwl/workspace";

/// Resolves the version of a package currently present in the workspace.
/// Caller-supplied overrides shadow whatever is on disk; positive lookups
/// are cached for the lifetime of the resolver.
#[derive(Debug)]
pub struct InstalledVersions {
    root: Option<PathBuf>,
    overrides: Mutex<BTreeMap<String, String>>,
    cache: Mutex<BTreeMap<String, String>>,
}

impl InstalledVersions {
    pub fn new(root: PathBuf, overrides: BTreeMap<String, String>) -> Self {
        InstalledVersions {
            root: Some(root),
            overrides: Mutex::new(overrides),
            cache: Mutex::new(BTreeMap::new()),
        }
    }

    /// A resolver backed by a fixed set of installed packages instead of a
    /// workspace on disk.
    pub fn fixed(packages: BTreeMap<String, String>, overrides: BTreeMap<String, String>) -> Self {
        InstalledVersions {
            root: None,
            overrides: Mutex::new(overrides),
            cache: Mutex::new(packages),
        }
    }

    pub fn get(&self, name: &str) -> Option<String> {
        if let Some(version) = self.lookup(name, true) {
            return Some(version);
        }

        // The tool package used to live under the workspace name.
        if name == "nx" {
            return self.lookup(WORKSPACE_ALIAS, true);
        }

        None
    }

    /// What is actually present in the workspace, ignoring overrides.
    pub fn get_actual(&self, name: &str) -> Option<String> {
        if let Some(version) = self.lookup(name, false) {
            return Some(version);
        }

        if name == "nx" {
            return self.lookup(WORKSPACE_ALIAS, false);
        }

        None
    }

    pub fn add_override(&self, name: &str, version: String) {
        let mut overrides = self.overrides.lock().unwrap();
        overrides.entry(name.to_string()).or_insert(version);
    }

    pub fn override_for(&self, name: &str) -> Option<String> {
        self.overrides.lock().unwrap().get(name).cloned()
    }

    fn lookup(&self, name: &str, with_overrides: bool) -> Option<String> {
        if with_overrides
            && let Some(version) = self.overrides.lock().unwrap().get(name)
        {
            return Some(version.clone());
        }

        if let Some(version) = self.cache.lock().unwrap().get(name) {
            return Some(version.clone());
        }

        let root = self.root.as_deref()?;
        let version = find_in_module_paths(root, name)?;
        self.cache
            .lock()
            .unwrap()
            .insert(name.to_string(), version.clone());
        Some(version)
    }
}

fn find_in_module_paths(root: &Path, name: &str) -> Option<String> {
    let mut current = Some(root);

    while let Some(dir) = current {
        let manifest_path = dir.join("node_modules").join(name).join("package.json");
        if manifest_path.is_file()
            && let Ok(manifest) = Manifest::read(&manifest_path)
            && let Some(version) = manifest.version
        {
            return Some(version);
        }

        current = dir.parent();
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_workspace() -> PathBuf {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("nxup_installed_{}", timestamp));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_package(root: &Path, name: &str, version: &str) {
        let dir = root.join("node_modules").join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("package.json"),
            format!(r#"{{"name":"{name}","version":"{version}"}}"#),
        )
        .unwrap();
    }

    #[test]
    fn resolves_from_node_modules() {
        let root = temp_workspace();
        write_package(&root, "left-pad", "1.3.0");

        let installed = InstalledVersions::new(root.clone(), BTreeMap::new());
        assert_eq!(installed.get("left-pad").as_deref(), Some("1.3.0"));
        assert_eq!(installed.get("missing"), None);

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn overrides_shadow_disk() {
        let root = temp_workspace();
        write_package(&root, "left-pad", "1.3.0");

        let mut overrides = BTreeMap::new();
        overrides.insert("left-pad".to_string(), "2.0.0".to_string());
        let installed = InstalledVersions::new(root.clone(), overrides);
        assert_eq!(installed.get("left-pad").as_deref(), Some("2.0.0"));

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn nx_falls_back_to_workspace_alias() {
        let root = temp_workspace();
        write_package(&root, "@nrwl/workspace", "13.4.0");

        let installed = InstalledVersions::new(root.clone(), BTreeMap::new());
        assert_eq!(installed.get("nx").as_deref(), Some("13.4.0"));

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn fixed_resolver_uses_presets() {
        let mut packages = BTreeMap::new();
        packages.insert("pkg".to_string(), "1.0.0".to_string());
        let installed = InstalledVersions::fixed(packages, BTreeMap::new());
        assert_eq!(installed.get("pkg").as_deref(), Some("1.0.0"));
        assert_eq!(installed.get("other"), None);
    }

    #[test]
    fn add_override_keeps_first_value() {
        let installed = InstalledVersions::fixed(BTreeMap::new(), BTreeMap::new());
        installed.add_override("pkg", "1.0.0".to_string());
        installed.add_override("pkg", "2.0.0".to_string());
        assert_eq!(installed.get("pkg").as_deref(), Some("1.0.0"));
    }
}
