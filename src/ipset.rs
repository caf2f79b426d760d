//! Thin wrapper over the host `ipset` primitive.
//!
//! The trait is the seam the composer and garbage collector depend on;
//! [`ProcessIpSet`] is the real, subprocess-backed implementation and
//! [`FakeIpSet`] is an in-memory stand-in used by tests, mirroring the way
//! the dfw `IPTables` trait in the retrieval pack separates a real and a
//! dummy backend behind one interface.

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpSetType {
    HashIp,
}

impl IpSetType {
    fn as_ipset_arg(&self) -> &'static str {
        match self {
            IpSetType::HashIp => "hash:ip",
        }
    }
}

#[async_trait]
pub trait IpSetClient: Send + Sync {
    /// Creates `name` if it does not already exist. A no-op otherwise.
    async fn create_if_absent(&self, name: &str, set_type: IpSetType) -> Result<(), SyncError>;

    /// Atomically replaces `name`'s membership with exactly `members`: create
    /// a temporary set, populate it, swap it into `name`, destroy the old
    /// contents. Rules referencing `name` never observe a half-updated set.
    async fn refresh(&self, name: &str, set_type: IpSetType, members: &BTreeSet<IpAddr>) -> Result<(), SyncError>;

    /// Destroys `name`. A no-op if it does not exist.
    async fn destroy(&self, name: &str) -> Result<(), SyncError>;

    /// Every set name currently present on the host, engine-owned or not.
    async fn list_names(&self) -> Result<BTreeSet<String>, SyncError>;
}

/// Invokes the real `ipset` binary via subprocess.
pub struct ProcessIpSet;

impl ProcessIpSet {
    async fn run(&self, args: &[&str]) -> Result<String, SyncError> {
        let output = Command::new("ipset")
            .args(args)
            .output()
            .await
            .map_err(|e| SyncError::IpSet(format!("failed to spawn ipset {args:?}: {e}")))?;
        if !output.status.success() {
            return Err(SyncError::IpSet(format!(
                "ipset {args:?} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl IpSetClient for ProcessIpSet {
    async fn create_if_absent(&self, name: &str, set_type: IpSetType) -> Result<(), SyncError> {
        let output = Command::new("ipset")
            .args(["create", name, set_type.as_ipset_arg(), "-exist"])
            .output()
            .await
            .map_err(|e| SyncError::IpSet(format!("failed to spawn ipset create {name}: {e}")))?;
        if !output.status.success() {
            return Err(SyncError::IpSet(format!(
                "ipset create {name} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    async fn refresh(&self, name: &str, set_type: IpSetType, members: &BTreeSet<IpAddr>) -> Result<(), SyncError> {
        let tmp_name = format!("{name}-tmp");
        self.run(&["create", &tmp_name, set_type.as_ipset_arg(), "-exist"]).await?;
        self.run(&["flush", &tmp_name]).await?;
        for member in members {
            self.run(&["add", &tmp_name, &member.to_string()]).await?;
        }
        self.create_if_absent(name, set_type).await?;
        self.run(&["swap", name, &tmp_name]).await?;
        self.run(&["destroy", &tmp_name]).await?;
        Ok(())
    }

    async fn destroy(&self, name: &str) -> Result<(), SyncError> {
        let output = Command::new("ipset")
            .args(["destroy", name])
            .output()
            .await
            .map_err(|e| SyncError::IpSet(format!("failed to spawn ipset destroy {name}: {e}")))?;
        // Destroying a set that does not exist is not an error: GC may race
        // against a previous partial cleanup.
        if !output.status.success() && !String::from_utf8_lossy(&output.stderr).contains("does not exist") {
            return Err(SyncError::IpSet(format!(
                "ipset destroy {name} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    async fn list_names(&self) -> Result<BTreeSet<String>, SyncError> {
        let out = self.run(&["list", "-name"]).await?;
        Ok(out.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect())
    }
}

/// In-memory stand-in for tests: records membership and visible refresh
/// history without touching the kernel.
#[derive(Default)]
pub struct FakeIpSet {
    sets: Mutex<HashMap<String, BTreeSet<IpAddr>>>,
}

impl FakeIpSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn members_of(&self, name: &str) -> Option<BTreeSet<IpAddr>> {
        self.sets.lock().unwrap().get(name).cloned()
    }

    pub fn seed(&self, name: &str, members: BTreeSet<IpAddr>) {
        self.sets.lock().unwrap().insert(name.to_string(), members);
    }
}

#[async_trait]
impl IpSetClient for FakeIpSet {
    async fn create_if_absent(&self, name: &str, _set_type: IpSetType) -> Result<(), SyncError> {
        self.sets.lock().unwrap().entry(name.to_string()).or_default();
        Ok(())
    }

    async fn refresh(&self, name: &str, _set_type: IpSetType, members: &BTreeSet<IpAddr>) -> Result<(), SyncError> {
        self.sets.lock().unwrap().insert(name.to_string(), members.clone());
        Ok(())
    }

    async fn destroy(&self, name: &str) -> Result<(), SyncError> {
        self.sets.lock().unwrap().remove(name);
        Ok(())
    }

    async fn list_names(&self) -> Result<BTreeSet<String>, SyncError> {
        Ok(self.sets.lock().unwrap().keys().cloned().collect())
    }
}
