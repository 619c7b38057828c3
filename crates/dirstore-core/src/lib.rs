//! dirstore Core Library
//!
//! Storage-independent types for the directory store.
//!
//! # Modules
//!
//! - [`dn`] - Distinguished names, normalization and materialized paths
//! - [`attrs`] - Original and normalized attribute maps
//! - [`rules`] - Per-attribute matching rules
//! - [`entry`] - Staged entries for add, modify and modify-DN
//! - [`mapper`] - Conversion between staged entries and the stored form
//! - [`error`] - Classified error kinds and protocol result codes
//!
//! # Example
//!
//! ```
//! use dirstore_core::{AddEntry, Dn, EntryMapper, OriginalAttributes};
//!
//! let dn = Dn::parse("uid=jdoe,ou=People,dc=example").unwrap();
//! let attrs: OriginalAttributes = [("objectClass", vec!["account".to_string()])]
//!     .into_iter()
//!     .collect();
//!
//! let form = EntryMapper::default()
//!     .add_entry_to_storage(&AddEntry::new(dn, attrs))
//!     .unwrap();
//! assert_eq!(form.dn_norm, "uid=jdoe,ou=people,dc=example");
//! assert_eq!(form.path, "dc=example/ou=people");
//! ```

pub mod attrs;
pub mod dn;
pub mod entry;
pub mod error;
pub mod mapper;
pub mod rules;

// Re-export main types for convenient access
pub use attrs::{NormalizedAttributes, OriginalAttributes};
pub use dn::{escape_value, Ava, Dn, Rdn, PATH_SEPARATOR};
pub use entry::{AddEntry, Modification, ModifyEntry, ModifyOp, SearchEntry};
pub use error::{BoxError, DirectoryError, OperationOutcome, Result, ResultCode, ResultExt};
pub use mapper::{EntryMapper, StorageForm, StoredEntry, MEMBER_OF, OBJECT_CLASS};
pub use rules::{MatchingRule, MatchingRules};
