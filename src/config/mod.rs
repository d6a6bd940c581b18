//! Configuration.
//!
//! Consolidates configuration from tiers with field-by-field YAML merging:
//! 1. **Defaults** - built into [`Config::default`]
//! 2. **Project** - `$CWD/hiera-audit/config.yaml`
//! 3. **User** - `~/.hiera-audit/config.yaml`
//! 4. **Environment** - the variables below
//!
//! ## Environment Variables
//! - `HIERA_AUDIT_CONFIG_PATH` - Explicit config file (replaces project and user tiers)
//! - `HIERA_AUDIT_DATA_DIR` - Hierarchy data directory
//! - `HIERA_AUDIT_HIERA_FILE` - `hiera.yaml` to read the hierarchy from
//! - `HIERA_AUDIT_FACTS_DIR` - Directory of per-node fact files
//! - `HIERA_AUDIT_DB_PATH` - SQLite database path
//! - `HIERA_AUDIT_TTL_MINUTES` - Lookup log TTL

mod loader;
mod merge;
mod types;

pub use loader::{ConfigLoader, ConfigPaths, ConfigTier};
pub use merge::{deep_merge, deep_merge_all};
pub use types::*;
