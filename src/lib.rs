//! labgate - admission control and leasing for shared lab resources
//!
//! Requests are checked against a tree of quota ACLs, matched to idle
//! resources under an exclusive section, committed, then held until the
//! read replica has replayed the write.

pub mod acl;
pub mod admission;
pub mod bootstrap;
pub mod cli;
pub mod config;
pub mod config_validator;
pub mod http_server;
pub mod observability;
pub mod replication;
pub mod resources;
