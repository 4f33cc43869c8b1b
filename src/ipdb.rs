use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::hypervisor::VmId;

/// Durable VM-to-address assignments.
///
/// Assignments survive restarts so a VM keeps its BMC address across service
/// lifetimes. The backing store is a JSON object file rewritten on every
/// mutation; reads are served from memory.
pub struct IpDatabase {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, Ipv4Addr>>,
}

impl IpDatabase {
    /// Open the database at `path`, creating an empty one if the file does
    /// not exist yet.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw).map_err(|err| {
                Error::configuration(format!(
                    "invalid address database {}: {err}",
                    path.display()
                ))
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    async fn persist(&self, entries: &BTreeMap<String, Ipv4Addr>) -> Result<()> {
        let raw = serde_json::to_string_pretty(entries)
            .map_err(|err| Error::configuration(format!("cannot serialize database: {err}")))?;
        tokio::fs::write(&self.path, raw).await?;
        Ok(())
    }

    /// The address assigned to `vm`, if any.
    pub async fn get(&self, vm: &VmId) -> Option<Ipv4Addr> {
        self.entries.lock().await.get(vm.as_str()).copied()
    }

    /// Record an assignment, replacing any previous address for `vm`.
    pub async fn assign(&self, vm: &VmId, addr: Ipv4Addr) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(vm.as_str().to_string(), addr);
        self.persist(&entries).await?;
        tracing::debug!(%vm, %addr, "recorded address assignment");
        Ok(())
    }

    /// Drop the assignment for `vm`, returning the released address.
    pub async fn remove(&self, vm: &VmId) -> Result<Option<Ipv4Addr>> {
        let mut entries = self.entries.lock().await;
        let removed = entries.remove(vm.as_str());
        if removed.is_some() {
            self.persist(&entries).await?;
        }
        Ok(removed)
    }

    /// Every currently assigned address.
    pub async fn assigned(&self) -> Vec<Ipv4Addr> {
        self.entries.lock().await.values().copied().collect()
    }

    /// Drop every assignment whose VM is not in `live`, returning the
    /// released addresses.
    pub async fn retain(&self, live: &[VmId]) -> Result<Vec<Ipv4Addr>> {
        let mut entries = self.entries.lock().await;
        let mut released = Vec::new();
        entries.retain(|vm, addr| {
            if live.iter().any(|id| id.as_str() == vm) {
                true
            } else {
                released.push(*addr);
                false
            }
        });
        if !released.is_empty() {
            self.persist(&entries).await?;
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(192, 168, 1, last)
    }

    #[tokio::test]
    async fn assignments_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ipdb.json");

        let db = IpDatabase::open(&path).await.unwrap();
        db.assign(&VmId::new("vm-1"), addr(10)).await.unwrap();
        db.assign(&VmId::new("vm-2"), addr(11)).await.unwrap();
        drop(db);

        let db = IpDatabase::open(&path).await.unwrap();
        assert_eq!(db.get(&VmId::new("vm-1")).await, Some(addr(10)));
        assert_eq!(db.get(&VmId::new("vm-2")).await, Some(addr(11)));
        assert_eq!(db.assigned().await, vec![addr(10), addr(11)]);
    }

    #[tokio::test]
    async fn remove_releases_the_address() {
        let dir = tempfile::tempdir().unwrap();
        let db = IpDatabase::open(dir.path().join("ipdb.json")).await.unwrap();

        db.assign(&VmId::new("vm-1"), addr(10)).await.unwrap();
        assert_eq!(db.remove(&VmId::new("vm-1")).await.unwrap(), Some(addr(10)));
        assert_eq!(db.remove(&VmId::new("vm-1")).await.unwrap(), None);
        assert!(db.get(&VmId::new("vm-1")).await.is_none());
    }

    #[tokio::test]
    async fn retain_drops_stale_entries() {
        let dir = tempfile::tempdir().unwrap();
        let db = IpDatabase::open(dir.path().join("ipdb.json")).await.unwrap();

        db.assign(&VmId::new("vm-1"), addr(10)).await.unwrap();
        db.assign(&VmId::new("vm-2"), addr(11)).await.unwrap();

        let released = db.retain(&[VmId::new("vm-1")]).await.unwrap();
        assert_eq!(released, vec![addr(11)]);
        assert_eq!(db.get(&VmId::new("vm-1")).await, Some(addr(10)));
        assert!(db.get(&VmId::new("vm-2")).await.is_none());
    }

    #[tokio::test]
    async fn corrupt_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ipdb.json");
        tokio::fs::write(&path, "not json").await.unwrap();

        assert!(matches!(
            IpDatabase::open(&path).await,
            Err(Error::Configuration(_))
        ));
    }
}
