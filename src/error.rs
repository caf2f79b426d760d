use thiserror::Error;

/// Failures that can occur while constructing an [`crate::config::AgentConfig`].
///
/// Construction is all-or-nothing: any of these prevents the config from
/// coming into existence at all, so no partially-validated value ever escapes
/// `AgentConfig::from_args`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid node IP {value:?}: {source}")]
    InvalidNodeIp {
        value: String,
        #[source]
        source: std::net::AddrParseError,
    },

    #[error("invalid CIDR {value:?} for {field}: {source}")]
    InvalidCidr {
        field: &'static str,
        value: String,
        #[source]
        source: ipnetwork::IpNetworkError,
    },

    #[error("invalid node-port range {value:?}: {reason}")]
    InvalidPortRange { value: String, reason: String },

    #[error("invalid sync period {value:?}: {reason}")]
    InvalidSyncPeriod { value: String, reason: String },
}

/// Failures that can abort a single full sync.
///
/// Every variant aborts the in-progress sync and leaves host state as it was
/// found; the next tick or event re-drives the attempt. `ChainInstall` is the
/// one variant the caller treats as fatal to the process (see `commands::run`),
/// since the engine cannot uphold its authority invariant without the
/// top-level jump rules in place.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to build policy model: {0}")]
    ModelBuild(String),

    #[error("failed to dump host filter table: {0}")]
    HostDump(String),

    #[error("failed to restore host filter table: {0}")]
    HostRestore(String),

    #[error("ip-set operation failed: {0}")]
    IpSet(String),

    #[error("failed to install top-level chains: {0}")]
    ChainInstall(String),
}
