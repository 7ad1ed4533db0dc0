//! Library interface for brewkit.
//!
//! The core of a Homebrew-style package manager: dependency graph expansion,
//! the install state machine, keg linking and keg relocation. The `brewkit`
//! binary is a thin CLI over these modules.

pub mod bottle;
pub mod build;
pub mod config;
pub mod dependency;
pub mod download;
pub mod error;
pub mod expand;
pub mod extract;
pub mod formulary;
pub mod installer;
pub mod keg;
pub mod link;
pub mod linkage;
pub mod lock;
pub mod options;
pub mod platform;
pub mod receipt;
pub mod recipe;
pub mod relocate;

// Re-export commonly used items
pub use error::{BrewError, Result};
pub use link::normalize_path;
