//! Directory-backed record storage for host builds.

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use crate::{credentials::RecordStorage, portal::AssetSource};

/// Stores each record as `<dir>/<name>.json`, or `<dir>/<name>` when the name
/// already carries an extension; assets are read verbatim from `<dir>/<name>`.
#[derive(Debug, Clone)]
pub struct DirStorage {
    root: PathBuf,
}

impl DirStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, name: &str) -> PathBuf {
        if Path::new(name).extension().is_some() {
            self.root.join(name)
        } else {
            self.root.join(format!("{name}.json"))
        }
    }
}

impl RecordStorage for DirStorage {
    fn exists(&self, name: &str) -> io::Result<bool> {
        self.record_path(name).try_exists()
    }

    fn size(&self, name: &str) -> io::Result<u64> {
        Ok(fs::metadata(self.record_path(name))?.len())
    }

    fn read(&self, name: &str) -> io::Result<Vec<u8>> {
        fs::read(self.record_path(name))
    }

    fn write(&mut self, name: &str, bytes: &[u8]) -> io::Result<()> {
        fs::create_dir_all(&self.root)?;

        // Write next to the target and rename so readers never see a partial record.
        let mut temp = tempfile::NamedTempFile::new_in(&self.root)?;
        temp.write_all(bytes)?;
        temp.as_file().sync_all()?;
        temp.persist(self.record_path(name))
            .map_err(|err| err.error)?;
        Ok(())
    }

    fn remove(&mut self, name: &str) -> io::Result<()> {
        fs::remove_file(self.record_path(name))
    }

    fn append(&mut self, name: &str, bytes: &[u8]) -> io::Result<()> {
        fs::create_dir_all(&self.root)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.record_path(name))?;
        file.write_all(bytes)
    }
}

impl AssetSource for DirStorage {
    fn load_asset(&self, name: &str) -> Option<String> {
        fs::read_to_string(self.root.join(name)).ok()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::credentials::{Credential, CredentialStore};

    #[test]
    fn credentials_round_trip_through_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CredentialStore::new(DirStorage::new(dir.path()), "wifi_config");

        assert_eq!(store.load(), None);
        store.save(&Credential::new("home", "hunter2")).unwrap();
        assert!(dir.path().join("wifi_config.json").exists());

        let reopened = CredentialStore::new(DirStorage::new(dir.path()), "wifi_config");
        assert_eq!(reopened.load(), Some(Credential::new("home", "hunter2")));
    }

    #[test]
    fn overwrite_replaces_whole_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CredentialStore::new(DirStorage::new(dir.path()), "wifi_config");

        store
            .save(&Credential::new("a-rather-long-network-name", "long-password"))
            .unwrap();
        store.save(&Credential::new("home", "")).unwrap();

        let raw = fs::read_to_string(dir.path().join("wifi_config.json")).unwrap();
        assert_eq!(raw, r#"{"ssid":"home","password":""}"#);
    }

    #[test]
    fn save_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("data").join("node");
        let mut store = CredentialStore::new(DirStorage::new(&nested), "wifi_config");

        store.save(&Credential::new("home", "hunter2")).unwrap();
        assert!(nested.join("wifi_config.json").is_file());
    }

    #[test]
    fn remove_then_clear_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CredentialStore::new(DirStorage::new(dir.path()), "wifi_config");

        store.save(&Credential::new("home", "hunter2")).unwrap();
        store.clear().unwrap();
        store.clear().unwrap();
        assert!(!dir.path().join("wifi_config.json").exists());
    }

    #[test]
    fn append_extends_named_file_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = DirStorage::new(dir.path().join("data"));

        storage.append("temp_log.csv", b"a\n").unwrap();
        storage.append("temp_log.csv", b"b\n").unwrap();

        let path = dir.path().join("data").join("temp_log.csv");
        assert_eq!(fs::read_to_string(path).unwrap(), "a\nb\n");
        assert_eq!(storage.size("temp_log.csv").unwrap(), 4);
    }

    #[test]
    fn assets_are_read_by_file_name() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("wifi_config.html"), "<form></form>").unwrap();
        let storage = DirStorage::new(dir.path());

        assert_eq!(
            storage.load_asset("wifi_config.html").as_deref(),
            Some("<form></form>")
        );
        assert_eq!(storage.load_asset("missing.html"), None);
    }
}
