//! # Quota Policies
//!
//! Hierarchical ACLs and the evaluator that enforces them.
//!
//! ## Components
//!
//! - `model`: ACLs, entries and their wire form
//! - `registry`: policy storage
//! - `directory`: group membership resolution
//! - `evaluator`: admission decision over an ACL chain
//! - `errors`: policy errors

pub mod directory;
pub mod errors;
pub mod evaluator;
pub mod model;
pub mod registry;

pub use directory::{Directory, StaticDirectory};
pub use errors::{AclError, AclResult};
pub use evaluator::{AclEvaluator, Decision, Denial, PoolInventory, PoolMember, QuotaRequest};
pub use model::{
    Acl, AclEntry, AclEntrySpec, AclId, AclRef, Constraint, EntryLimits, NewAcl, Selector,
    UpdateAcl, Violation,
};
pub use registry::{AclRegistry, QuotaStore};
