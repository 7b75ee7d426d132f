//! Remote copy of the CSV log.

use std::fmt;
use std::path::Path;

use crate::config::{Backend, LoggerConfig};
use crate::Result;

mod localdir;
pub use localdir::LocalDirStorage;

#[cfg(feature = "drive")]
mod drive;
#[cfg(feature = "drive")]
pub use drive::DriveStorage;

/// An object held by a [`RemoteStorage`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteObject {
    pub id: String,
    pub name: String,
}

/// A file storage service the CSV log is mirrored to.
pub trait RemoteStorage {
    /// Looks up an object by its exact name. The first match is the canonical one.
    fn find_by_name(&mut self, name: &str) -> Result<Option<RemoteObject>>;

    /// Stores a new object called `name`.
    fn create(&mut self, name: &str, content: &[u8]) -> Result<RemoteObject>;

    /// Replaces the content of an existing object.
    fn overwrite(&mut self, id: &str, content: &[u8]) -> Result<()>;

    /// Fetches the content of an object.
    fn download(&mut self, id: &str) -> Result<Vec<u8>>;
}

pub type RemoteStoragePointer = Box<dyn RemoteStorage + Send>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UploadOutcome {
    Created(RemoteObject),
    Updated(RemoteObject),
}

impl UploadOutcome {
    pub fn object(&self) -> &RemoteObject {
        match self {
            Self::Created(object) | Self::Updated(object) => object,
        }
    }
}

impl fmt::Display for UploadOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created(object) => write!(f, "File uploaded successfully with ID: {}", object.id),
            Self::Updated(object) => write!(f, "File updated successfully with ID: {}", object.id),
        }
    }
}

/// Mirrors the file at `path` to the object called `name`: overwrites it when
/// it exists, creates it otherwise. Repeating the call with an unchanged file
/// leaves the remote content equal to the file.
pub fn upload_or_update(
    storage: &mut dyn RemoteStorage,
    name: &str,
    path: &Path,
) -> Result<UploadOutcome> {
    let content = std::fs::read(path)?;

    match storage.find_by_name(name)? {
        Some(object) => {
            storage.overwrite(&object.id, &content)?;
            Ok(UploadOutcome::Updated(object))
        }
        None => Ok(UploadOutcome::Created(storage.create(name, &content)?)),
    }
}

/// Downloads object `id` into `path`, replacing the file in one step so
/// readers never see a partial download. Returns the number of bytes written.
pub fn fetch_to_file(storage: &mut dyn RemoteStorage, id: &str, path: &Path) -> Result<u64> {
    let content = storage.download(id)?;
    replace_file(path, &content)?;
    Ok(content.len() as u64)
}

/// Opens the backend named by `upload.backend`. Drive asks for a login here
/// when no valid token is cached, so that happens before any data is read.
pub fn open_backend(config: &LoggerConfig) -> Result<RemoteStoragePointer> {
    match config.upload.backend {
        Backend::LocalDir => Ok(Box::new(LocalDirStorage::new(&config.upload.local_dir)?)),
        #[cfg(feature = "drive")]
        Backend::Drive => {
            use crate::credentials::{Authenticator, ClientSecrets, FileCredentialStore};

            let secrets = ClientSecrets::load(&config.drive.client_secrets)?;
            let store = FileCredentialStore::new(config.token_cache_path()?);
            let mut auth = Authenticator::new(secrets, Box::new(store));
            auth.login()?;
            Ok(Box::new(DriveStorage::new(auth)))
        }
        #[cfg(not(feature = "drive"))]
        Backend::Drive => Err(crate::Error::Config(
            "built without the `drive` feature, use the local-dir backend".into(),
        )),
    }
}

pub(crate) fn replace_file(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut partial = path.as_os_str().to_owned();
    partial.push(".part");
    std::fs::write(&partial, content)?;
    std::fs::rename(&partial, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_upload_updates_the_same_object() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("sensor_data.csv");
        std::fs::write(&local, "Timestamp\n1\n").unwrap();
        let mut storage = LocalDirStorage::new(dir.path().join("remote")).unwrap();

        let first = upload_or_update(&mut storage, "sensor_data.csv", &local).unwrap();
        let second = upload_or_update(&mut storage, "sensor_data.csv", &local).unwrap();

        assert!(matches!(first, UploadOutcome::Created(_)));
        assert_eq!(second, UploadOutcome::Updated(first.object().clone()));
        assert_eq!(second.to_string(), "File updated successfully with ID: sensor_data.csv");
        assert_eq!(
            storage.download(&second.object().id).unwrap(),
            std::fs::read(&local).unwrap()
        );
    }

    #[test]
    fn fetch_replaces_the_local_copy() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = LocalDirStorage::new(dir.path().join("remote")).unwrap();
        let object = storage.create("data.csv", b"a,b\n1,2\n").unwrap();

        let target = dir.path().join("copy.csv");
        std::fs::write(&target, "stale").unwrap();
        assert_eq!(fetch_to_file(&mut storage, &object.id, &target).unwrap(), 8);
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "a,b\n1,2\n");
        assert!(!dir.path().join("copy.csv.part").exists());
    }

    #[test]
    fn local_dir_backend_is_opened_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = LoggerConfig::default();
        config.upload.backend = Backend::LocalDir;
        config.upload.local_dir = dir.path().join("share");

        let mut storage = open_backend(&config).unwrap();
        assert!(dir.path().join("share").is_dir());
        assert_eq!(storage.find_by_name("sensor_data.csv").unwrap(), None);
    }

    #[test]
    fn missing_local_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = LocalDirStorage::new(dir.path()).unwrap();
        assert!(upload_or_update(&mut storage, "x.csv", &dir.path().join("nope.csv")).is_err());
    }
}
