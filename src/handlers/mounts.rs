//! In-memory mount registry and the fixed list of disk types.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::ipc::messages::{DiskTypeInfo, MountInfo};

/// Disk types a mount may be created with.
pub const DISK_TYPES: &[(&str, &str)] = &[
    ("local_directory", "A directory on this machine"),
    ("ftp", "FTP server"),
    ("sftp", "SFTP server over SSH"),
    ("smb", "Windows/Samba share"),
    ("webdav", "WebDAV server"),
    ("dropbox", "Dropbox account"),
];

pub fn disk_types() -> Vec<DiskTypeInfo> {
    DISK_TYPES
        .iter()
        .map(|(name, description)| DiskTypeInfo {
            name: name.to_string(),
            description: description.to_string(),
        })
        .collect()
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MountError {
    #[error("mount {0} not found")]
    NotFound(u32),

    #[error("a mount named '{0}' already exists")]
    DuplicateName(String),

    #[error("unknown disk type '{0}'")]
    UnknownDiskType(String),

    #[error("mount name must not be empty")]
    EmptyName,

    #[error("mount {0} is already mounted")]
    AlreadyMounted(u32),

    #[error("mount {0} is not mounted")]
    NotMounted(u32),

    #[error("registry lock poisoned")]
    Poisoned,
}

#[derive(Debug, Default)]
struct Registry {
    next_id: u32,
    mounts: HashMap<u32, MountInfo>,
}

/// Mount table shared by every backend client.
#[derive(Debug, Clone, Default)]
pub struct MountRegistry {
    inner: Arc<Mutex<Registry>>,
}

impl MountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, name: &str, disk_type: &str, config: BTreeMap<String, String>) -> Result<MountInfo, MountError> {
        if name.trim().is_empty() {
            return Err(MountError::EmptyName);
        }
        if !DISK_TYPES.iter().any(|(t, _)| *t == disk_type) {
            return Err(MountError::UnknownDiskType(disk_type.to_string()));
        }

        let mut registry = self.inner.lock().map_err(|_| MountError::Poisoned)?;
        if registry.mounts.values().any(|m| m.name == name) {
            return Err(MountError::DuplicateName(name.to_string()));
        }
        registry.next_id += 1;
        let mount = MountInfo {
            mount_id: registry.next_id,
            name: name.to_string(),
            disk_type: disk_type.to_string(),
            config,
            mounted: false,
        };
        registry.mounts.insert(mount.mount_id, mount.clone());
        Ok(mount)
    }

    pub fn delete(&self, mount_id: u32) -> Result<MountInfo, MountError> {
        let mut registry = self.inner.lock().map_err(|_| MountError::Poisoned)?;
        registry.mounts.remove(&mount_id).ok_or(MountError::NotFound(mount_id))
    }

    /// All mounts ordered by id.
    pub fn list(&self) -> Result<Vec<MountInfo>, MountError> {
        let registry = self.inner.lock().map_err(|_| MountError::Poisoned)?;
        let mut mounts: Vec<_> = registry.mounts.values().cloned().collect();
        mounts.sort_by_key(|m| m.mount_id);
        Ok(mounts)
    }

    pub fn mount(&self, mount_id: u32) -> Result<MountInfo, MountError> {
        self.set_mounted(mount_id, true)
    }

    pub fn unmount(&self, mount_id: u32) -> Result<MountInfo, MountError> {
        self.set_mounted(mount_id, false)
    }

    fn set_mounted(&self, mount_id: u32, mounted: bool) -> Result<MountInfo, MountError> {
        let mut registry = self.inner.lock().map_err(|_| MountError::Poisoned)?;
        let mount = registry.mounts.get_mut(&mount_id).ok_or(MountError::NotFound(mount_id))?;
        match (mount.mounted, mounted) {
            (true, true) => Err(MountError::AlreadyMounted(mount_id)),
            (false, false) => Err(MountError::NotMounted(mount_id)),
            _ => {
                mount.mounted = mounted;
                Ok(mount.clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_list_delete() {
        let registry = MountRegistry::new();
        let docs = registry.create("docs", "local_directory", BTreeMap::new()).unwrap();
        let ftp = registry.create("ftp", "ftp", BTreeMap::new()).unwrap();
        assert_eq!(docs.mount_id, 1);
        assert_eq!(ftp.mount_id, 2);

        let names: Vec<_> = registry.list().unwrap().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["docs", "ftp"]);

        registry.delete(docs.mount_id).unwrap();
        assert_eq!(registry.list().unwrap().len(), 1);
        assert_eq!(registry.delete(docs.mount_id), Err(MountError::NotFound(1)));
    }

    #[test]
    fn test_create_validation() {
        let registry = MountRegistry::new();
        assert_eq!(
            registry.create("x", "floppy", BTreeMap::new()),
            Err(MountError::UnknownDiskType("floppy".into()))
        );
        assert_eq!(registry.create(" ", "ftp", BTreeMap::new()), Err(MountError::EmptyName));

        registry.create("x", "ftp", BTreeMap::new()).unwrap();
        assert_eq!(
            registry.create("x", "sftp", BTreeMap::new()),
            Err(MountError::DuplicateName("x".into()))
        );
    }

    #[test]
    fn test_mount_unmount() {
        let registry = MountRegistry::new();
        let m = registry.create("share", "smb", BTreeMap::new()).unwrap();

        assert!(registry.mount(m.mount_id).unwrap().mounted);
        assert_eq!(registry.mount(m.mount_id), Err(MountError::AlreadyMounted(m.mount_id)));
        assert!(!registry.unmount(m.mount_id).unwrap().mounted);
        assert_eq!(registry.unmount(m.mount_id), Err(MountError::NotMounted(m.mount_id)));
        assert_eq!(registry.mount(99), Err(MountError::NotFound(99)));
    }

    #[test]
    fn test_disk_types() {
        let types = disk_types();
        assert_eq!(types.len(), 6);
        assert_eq!(types[0].name, "local_directory");
        assert!(types.iter().any(|t| t.name == "dropbox"));
    }

    #[test]
    fn test_registry_is_shared_between_clones() {
        let registry = MountRegistry::new();
        let other = registry.clone();
        registry.create("a", "webdav", BTreeMap::new()).unwrap();
        assert_eq!(other.list().unwrap().len(), 1);
    }
}
