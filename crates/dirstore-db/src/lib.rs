//! dirstore Database Layer
//!
//! PostgreSQL persistence for directory entries.
//!
//! # Modules
//!
//! - [`pool`] - Connection pool ([`DbPool`])
//! - [`migrations`] - Embedded schema migrations
//! - [`registry`] - Statement Registry: named-parameter compilation and caching
//! - [`repository`] - Transactional Repository with membership cascades
//! - [`search`] - Filtered Search Executor with scoped, paginated queries
//! - [`service`] - Protocol-handler facade with authorization and logging
//! - [`error`] - Database error type ([`DbError`])
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use dirstore_core::EntryMapper;
//! use dirstore_db::{run_migrations, AllowAll, DbPool, DirectoryService, Repository, Requester};
//!
//! let pool = DbPool::connect("postgres://localhost/dirstore").await?;
//! run_migrations(&pool).await?;
//!
//! let repo = Repository::new(pool, EntryMapper::default())?;
//! let service = DirectoryService::new(repo, Arc::new(AllowAll));
//! service.delete(&Requester::anonymous(), "cn=alice,dc=example").await?;
//! ```

pub mod error;
pub mod migrations;
pub mod params;
pub mod pool;
pub mod registry;
pub mod repository;
pub mod rows;
pub mod search;
pub mod service;

pub use error::DbError;
pub use migrations::run_migrations;
pub use params::{ParamValue, QueryParams};
pub use pool::{DbPool, PoolSettings};
pub use registry::{CompiledStatement, StatementRegistry, Stmt};
pub use repository::Repository;
pub use rows::FetchedEntry;
pub use search::{
    EntryStream, FilterQuery, Page, PathScope, PreparedSearch, SearchExecutor, SearchRequest,
    SearchScope, SearchSummary,
};
pub use service::{AllowAll, Authorizer, DirectoryService, Operation, Requester};
