//! Host filter-table clients: a bulk dump/restore primitive for the chains
//! the engine owns outright, and a narrow direct-mutation primitive for the
//! single jump rule it must maintain inside a built-in chain it does not own.
//!
//! The bulk side uses the buffered, atomically-committed `iptables-restore`
//! technique: build a textual `*filter` ... `COMMIT` buffer, then hand it to
//! the restore subprocess's stdin in one shot so the kernel applies it as a
//! single transaction.

use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::SyncError;

/// Bulk dump/restore of an entire iptables table, used for the chains the
/// engine owns outright (per-pod, per-policy, and the three custom top-level
/// chains).
#[async_trait]
pub trait IpTablesBulk: Send + Sync {
    async fn dump_table(&self, table: &str) -> Result<String, SyncError>;
    async fn restore_table(&self, table: &str, buffer: &str) -> Result<(), SyncError>;
}

/// Direct, single-rule mutation of a built-in chain the engine does not own.
/// Used only for the one jump rule each of INPUT/OUTPUT/FORWARD carries into
/// the engine's custom chains.
#[async_trait]
pub trait IpTablesMutate: Send + Sync {
    async fn chain_exists(&self, table: &str, chain: &str) -> Result<bool, SyncError>;
    async fn new_chain(&self, table: &str, chain: &str) -> Result<(), SyncError>;
    /// All rules currently installed in `chain`, as iptables-save fragment
    /// lines (without the leading `-A <chain>`), in installed order.
    async fn list_rules(&self, table: &str, chain: &str) -> Result<Vec<String>, SyncError>;
    async fn insert_rule(&self, table: &str, chain: &str, position: u32, rule_spec: &str) -> Result<(), SyncError>;
    async fn delete_rule(&self, table: &str, chain: &str, rule_spec: &str) -> Result<(), SyncError>;
    async fn flush_chain(&self, table: &str, chain: &str) -> Result<(), SyncError>;
    async fn delete_chain(&self, table: &str, chain: &str) -> Result<(), SyncError>;
}

/// Invokes the real `iptables`/`iptables-save`/`iptables-restore` binaries.
pub struct ProcessIpTables;

impl ProcessIpTables {
    async fn run(&self, args: &[&str]) -> Result<String, SyncError> {
        let output = Command::new("iptables")
            .args(args)
            .output()
            .await
            .map_err(|e| SyncError::HostRestore(format!("failed to spawn iptables {args:?}: {e}")))?;
        if !output.status.success() {
            return Err(SyncError::HostRestore(format!(
                "iptables {args:?} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl IpTablesBulk for ProcessIpTables {
    async fn dump_table(&self, table: &str) -> Result<String, SyncError> {
        let output = Command::new("iptables-save")
            .args(["-t", table])
            .output()
            .await
            .map_err(|e| SyncError::HostDump(format!("failed to spawn iptables-save: {e}")))?;
        if !output.status.success() {
            return Err(SyncError::HostDump(format!(
                "iptables-save exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn restore_table(&self, _table: &str, buffer: &str) -> Result<(), SyncError> {
        let mut child = Command::new("iptables-restore")
            .arg("--noflush")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SyncError::HostRestore(format!("failed to spawn iptables-restore: {e}")))?;

        let mut stdin = child.stdin.take().expect("piped stdin");
        stdin
            .write_all(buffer.as_bytes())
            .await
            .map_err(|e| SyncError::HostRestore(format!("failed to write restore buffer: {e}")))?;
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| SyncError::HostRestore(format!("failed to wait on iptables-restore: {e}")))?;
        if !output.status.success() {
            return Err(SyncError::HostRestore(format!(
                "iptables-restore exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl IpTablesMutate for ProcessIpTables {
    async fn chain_exists(&self, table: &str, chain: &str) -> Result<bool, SyncError> {
        let output = Command::new("iptables")
            .args(["-t", table, "-n", "-L", chain])
            .output()
            .await
            .map_err(|e| SyncError::HostRestore(format!("failed to spawn iptables -L: {e}")))?;
        Ok(output.status.success())
    }

    async fn new_chain(&self, table: &str, chain: &str) -> Result<(), SyncError> {
        if self.chain_exists(table, chain).await? {
            return Ok(());
        }
        self.run(&["-t", table, "-N", chain]).await.map(|_| ())
    }

    async fn list_rules(&self, table: &str, chain: &str) -> Result<Vec<String>, SyncError> {
        let out = self.run(&["-t", table, "-S", chain]).await?;
        Ok(out
            .lines()
            .filter_map(|l| l.strip_prefix(&format!("-A {chain} ")))
            .map(|l| l.to_string())
            .collect())
    }

    async fn insert_rule(&self, table: &str, chain: &str, position: u32, rule_spec: &str) -> Result<(), SyncError> {
        let mut args = vec!["-t", table, "-I", chain, &position.to_string()];
        let rule_parts: Vec<&str> = rule_spec.split_whitespace().collect();
        args.extend(rule_parts);
        self.run(&args).await.map(|_| ())
    }

    async fn delete_rule(&self, table: &str, chain: &str, rule_spec: &str) -> Result<(), SyncError> {
        let mut args = vec!["-t", table, "-D", chain];
        let rule_parts: Vec<&str> = rule_spec.split_whitespace().collect();
        args.extend(rule_parts);
        self.run(&args).await.map(|_| ())
    }

    async fn flush_chain(&self, table: &str, chain: &str) -> Result<(), SyncError> {
        self.run(&["-t", table, "-F", chain]).await.map(|_| ())
    }

    async fn delete_chain(&self, table: &str, chain: &str) -> Result<(), SyncError> {
        self.run(&["-t", table, "-X", chain]).await.map(|_| ())
    }
}

/// In-memory stand-in for tests, modeled on the dfw crate's `IPTablesDummy`:
/// bulk restores simply replace the recorded buffer, and chains/rules are
/// tracked in plain `Vec`s rather than touching the kernel.
#[derive(Default)]
pub struct FakeIpTables {
    state: Mutex<FakeState>,
}

#[derive(Default)]
struct FakeState {
    dumps: HashMap<String, String>,
    chains: HashMap<String, Vec<String>>,
    restores: Vec<String>,
    fail_new_chain: std::collections::HashSet<String>,
    fail_insert_rule: std::collections::HashSet<String>,
}

impl FakeIpTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_dump(&self, table: &str, contents: &str) {
        self.state.lock().unwrap().dumps.insert(table.to_string(), contents.to_string());
    }

    pub fn restore_history(&self) -> Vec<String> {
        self.state.lock().unwrap().restores.clone()
    }

    pub fn rules_in(&self, chain: &str) -> Vec<String> {
        self.state.lock().unwrap().chains.get(chain).cloned().unwrap_or_default()
    }

    /// Makes `new_chain` fail for `chain`, as if the kernel refused to create it.
    pub fn fail_new_chain(&self, chain: &str) {
        self.state.lock().unwrap().fail_new_chain.insert(chain.to_string());
    }

    /// Makes `insert_rule` fail for `chain`, as if the iptables invocation errored transiently.
    pub fn fail_insert_rule(&self, chain: &str) {
        self.state.lock().unwrap().fail_insert_rule.insert(chain.to_string());
    }
}

#[async_trait]
impl IpTablesBulk for FakeIpTables {
    async fn dump_table(&self, table: &str) -> Result<String, SyncError> {
        Ok(self.state.lock().unwrap().dumps.get(table).cloned().unwrap_or_default())
    }

    async fn restore_table(&self, table: &str, buffer: &str) -> Result<(), SyncError> {
        let mut state = self.state.lock().unwrap();
        state.dumps.insert(table.to_string(), buffer.to_string());
        state.restores.push(buffer.to_string());
        Ok(())
    }
}

#[async_trait]
impl IpTablesMutate for FakeIpTables {
    async fn chain_exists(&self, _table: &str, chain: &str) -> Result<bool, SyncError> {
        Ok(self.state.lock().unwrap().chains.contains_key(chain))
    }

    async fn new_chain(&self, _table: &str, chain: &str) -> Result<(), SyncError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_new_chain.contains(chain) {
            return Err(SyncError::HostRestore(format!("simulated failure creating chain {chain}")));
        }
        state.chains.entry(chain.to_string()).or_default();
        Ok(())
    }

    async fn list_rules(&self, _table: &str, chain: &str) -> Result<Vec<String>, SyncError> {
        Ok(self.state.lock().unwrap().chains.get(chain).cloned().unwrap_or_default())
    }

    async fn insert_rule(&self, _table: &str, chain: &str, position: u32, rule_spec: &str) -> Result<(), SyncError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_insert_rule.contains(chain) {
            return Err(SyncError::HostRestore(format!("simulated failure inserting rule into {chain}")));
        }
        let rules = state.chains.entry(chain.to_string()).or_default();
        let idx = (position as usize).saturating_sub(1).min(rules.len());
        rules.insert(idx, rule_spec.to_string());
        Ok(())
    }

    async fn delete_rule(&self, _table: &str, chain: &str, rule_spec: &str) -> Result<(), SyncError> {
        let mut state = self.state.lock().unwrap();
        if let Some(rules) = state.chains.get_mut(chain) {
            rules.retain(|r| r != rule_spec);
        }
        Ok(())
    }

    async fn flush_chain(&self, _table: &str, chain: &str) -> Result<(), SyncError> {
        if let Some(rules) = self.state.lock().unwrap().chains.get_mut(chain) {
            rules.clear();
        }
        Ok(())
    }

    async fn delete_chain(&self, _table: &str, chain: &str) -> Result<(), SyncError> {
        self.state.lock().unwrap().chains.remove(chain);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_rule_respects_position() {
        let ipt = FakeIpTables::new();
        ipt.new_chain("filter", "NETPOL-INPUT").await.unwrap();
        ipt.insert_rule("filter", "NETPOL-INPUT", 1, "-j ACCEPT").await.unwrap();
        ipt.insert_rule("filter", "NETPOL-INPUT", 1, "-j DROP").await.unwrap();
        assert_eq!(ipt.rules_in("NETPOL-INPUT"), vec!["-j DROP", "-j ACCEPT"]);
    }

    #[tokio::test]
    async fn restore_records_full_buffer() {
        let ipt = FakeIpTables::new();
        ipt.restore_table("filter", "*filter\nCOMMIT\n").await.unwrap();
        assert_eq!(ipt.restore_history().len(), 1);
    }

    #[tokio::test]
    async fn delete_rule_removes_matching_entry() {
        let ipt = FakeIpTables::new();
        ipt.insert_rule("filter", "NETPOL-INPUT", 1, "-d 10.1.2.5 -j NETPOL-POD-X").await.unwrap();
        ipt.delete_rule("filter", "NETPOL-INPUT", "-d 10.1.2.5 -j NETPOL-POD-X").await.unwrap();
        assert!(ipt.rules_in("NETPOL-INPUT").is_empty());
    }
}
