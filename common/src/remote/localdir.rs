use std::path::{Path, PathBuf};

use super::{replace_file, RemoteObject, RemoteStorage};
use crate::{Error, Result};

/// Keeps remote objects as files in a directory, for example a mounted
/// network share. The object id is the file name.
pub struct LocalDirStorage {
    root: PathBuf,
}

impl LocalDirStorage {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, name: &str) -> Result<PathBuf> {
        let plain = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(['/', '\\']);
        if !plain {
            return Err(Error::Upload(format!("{name:?} is not a plain file name")));
        }
        Ok(self.root.join(name))
    }
}

impl RemoteStorage for LocalDirStorage {
    fn find_by_name(&mut self, name: &str) -> Result<Option<RemoteObject>> {
        let path = self.object_path(name)?;
        Ok(path.is_file().then(|| RemoteObject {
            id: name.to_owned(),
            name: name.to_owned(),
        }))
    }

    fn create(&mut self, name: &str, content: &[u8]) -> Result<RemoteObject> {
        let path = self.object_path(name)?;
        replace_file(&path, content)
            .map_err(|e| Error::Upload(format!("{}: {e}", path.display())))?;
        Ok(RemoteObject {
            id: name.to_owned(),
            name: name.to_owned(),
        })
    }

    fn overwrite(&mut self, id: &str, content: &[u8]) -> Result<()> {
        let path = self.object_path(id)?;
        if !path.is_file() {
            return Err(Error::Upload(format!("no object with id {id:?}")));
        }
        replace_file(&path, content).map_err(|e| Error::Upload(format!("{}: {e}", path.display())))
    }

    fn download(&mut self, id: &str) -> Result<Vec<u8>> {
        let path = self.object_path(id)?;
        std::fs::read(&path).map_err(|e| Error::Upload(format!("{}: {e}", path.display())))
    }
}

#[test]
fn lookups_are_by_exact_name() {
    let dir = tempfile::tempdir().unwrap();
    let mut storage = LocalDirStorage::new(dir.path()).unwrap();
    storage.create("sensor_data.csv", b"x").unwrap();

    assert!(storage.find_by_name("sensor_data.csv").unwrap().is_some());
    assert!(storage.find_by_name("sensor_data").unwrap().is_none());
    assert!(storage.find_by_name("../sensor_data.csv").is_err());
    assert!(storage.overwrite("other.csv", b"y").is_err());
}
