pub mod composer;
pub mod config;
pub mod error;
pub mod gc;
pub mod http;
pub mod installer;
pub mod ipset;
pub mod iptables;
pub mod k8s;
pub mod listers;
pub mod metrics;
pub mod model;
pub mod naming;
pub mod reconcile;
