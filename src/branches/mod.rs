//! Branch shells and the registry that owns them.
//!
//! A branch is identified by its path and its base timestamp. Rebasing
//! replaces the identity at a path instead of mutating it, so children based
//! on the old identity become `STALE`.

mod branch;
mod manager;

pub use branch::{validate_name, Branch, BranchKind, Metadata, MAIN_PATH, MAX_NAME_LENGTH, SEPARATOR};
pub use manager::BranchManager;
