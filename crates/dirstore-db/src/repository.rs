//! Transactional Repository
//!
//! Every operation that takes a `&mut PgConnection` runs on the caller's
//! transaction; the caller decides when to commit or roll back.
//!
//! Cascading operations (rename and delete of a referenced entry) read every
//! locked referrer into memory before the first dependent write is issued on
//! the same connection. The locked lookups return owned vectors, so a cursor
//! is never open while a write runs.

use std::sync::Arc;

use chrono::Utc;
use dirstore_core::{
    AddEntry, DirectoryError, Dn, EntryMapper, ModifyEntry, Result, ResultExt, SearchEntry,
    StorageForm,
};
use sqlx::{PgConnection, Postgres, Transaction};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::{map_write_error, query_error, DbError};
use crate::params::QueryParams;
use crate::pool::DbPool;
use crate::registry::{StatementRegistry, Stmt};
use crate::rows::FetchedEntry;
use crate::search::{SearchExecutor, SearchRequest, SearchSummary};

const MEMBER: &str = "member";

/// Entry persistence with cross-entry membership consistency.
#[derive(Debug, Clone)]
pub struct Repository {
    pool: DbPool,
    registry: Arc<StatementRegistry>,
    mapper: Arc<EntryMapper>,
    search: SearchExecutor,
}

impl Repository {
    /// Build a repository with a fresh statement registry.
    ///
    /// # Errors
    ///
    /// Returns `DbError::InvalidStatement` if a built-in statement fails to
    /// compile.
    pub fn new(pool: DbPool, mapper: EntryMapper) -> std::result::Result<Self, DbError> {
        Ok(Self::with_registry(
            pool,
            Arc::new(StatementRegistry::new()?),
            Arc::new(mapper),
        ))
    }

    #[must_use]
    pub fn with_registry(
        pool: DbPool,
        registry: Arc<StatementRegistry>,
        mapper: Arc<EntryMapper>,
    ) -> Self {
        let search = SearchExecutor::new(Arc::clone(&registry), Arc::clone(&mapper));
        Self {
            pool,
            registry,
            mapper,
            search,
        }
    }

    #[must_use]
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    #[must_use]
    pub fn registry(&self) -> &StatementRegistry {
        &self.registry
    }

    #[must_use]
    pub fn mapper(&self) -> &EntryMapper {
        &self.mapper
    }

    /// Start a transaction for a group of repository calls.
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    /// Create an entry and return its surrogate id.
    ///
    /// The parent row, unless the parent is the root, is share-locked for the
    /// rest of the transaction so a concurrent delete of it waits.
    ///
    /// # Errors
    ///
    /// - `NoSuchObject` when the parent entry does not exist
    /// - `AlreadyExists` when an entry with the same normalized DN exists,
    ///   including one committed concurrently
    #[instrument(skip_all, fields(dn = %entry.dn()))]
    pub async fn insert(&self, conn: &mut PgConnection, entry: &AddEntry) -> Result<i64> {
        let form = self.mapper.add_entry_to_storage(entry)?;
        self.lock_parent(&mut *conn, entry.dn()).await?;
        let mut params = QueryParams::new()
            .with("dnNorm", form.dn_norm.as_str())
            .with("dnOrig", form.dn_orig.as_str())
            .with("path", form.path.as_str())
            .with("uuid", Uuid::new_v4())
            .with("created", Utc::now());
        bind_attributes(&mut params, &form)?;

        let statement = self.registry.builtin(Stmt::Insert);
        let id: Option<i64> = statement
            .query_scalar(&params)?
            .fetch_optional(conn)
            .await
            .map_err(|err| map_write_error(err, "insert entry", entry.dn().original()))?;

        let id = id.ok_or_else(|| DirectoryError::AlreadyExists {
            dn: entry.dn().to_string(),
        })?;
        info!(id, "Entry added");
        Ok(id)
    }

    /// Rewrite the attributes of a row resolved by a locked lookup.
    ///
    /// # Errors
    ///
    /// `Internal` when `entry` carries no surrogate id.
    #[instrument(skip_all, fields(dn = %entry.dn()))]
    pub async fn update(&self, conn: &mut PgConnection, entry: &ModifyEntry) -> Result<()> {
        let id = entry.id().ok_or_else(|| {
            DirectoryError::internal(format!("update of {} without a resolved id", entry.dn()))
        })?;
        let form = self.mapper.modify_entry_to_storage(entry)?;
        let mut params = QueryParams::new().with("id", id);
        bind_attributes(&mut params, &form)?;

        let done = self
            .registry
            .builtin(Stmt::UpdateAttrs)
            .query(&params)?
            .execute(conn)
            .await
            .map_err(query_error(format!("update entry {id}")))?;
        if done.rows_affected() != 1 {
            return Err(DirectoryError::internal(format!(
                "update of entry {id} touched {} rows",
                done.rows_affected()
            )));
        }
        debug!(id, "Entry attributes updated");
        Ok(())
    }

    pub async fn find_by_dn(&self, conn: &mut PgConnection, dn: &Dn) -> Result<SearchEntry> {
        let row = self.fetch_one_by_dn(&mut *conn, Stmt::FindByDn, dn).await?;
        match row {
            Some(row) => row.into_search_entry(&self.mapper, false),
            None => Err(self.no_such_object(conn, dn).await),
        }
    }

    /// Single-entry lookup carrying the computed `memberOf`.
    pub async fn find_by_dn_with_member_of(
        &self,
        conn: &mut PgConnection,
        dn: &Dn,
    ) -> Result<SearchEntry> {
        let row = self
            .fetch_one_by_dn(&mut *conn, Stmt::FindByDnWithMemberOf, dn)
            .await?;
        match row {
            Some(row) => row.into_search_entry(&self.mapper, true),
            None => Err(self.no_such_object(conn, dn).await),
        }
    }

    /// Lock an entry for the rest of the transaction and stage it for change.
    pub async fn find_by_dn_with_lock(
        &self,
        conn: &mut PgConnection,
        dn: &Dn,
    ) -> Result<ModifyEntry> {
        let row = self
            .fetch_one_by_dn(&mut *conn, Stmt::FindByDnWithLock, dn)
            .await?;
        match row {
            Some(row) => self.mapper.to_modify_entry(row.into_stored().0),
            None => Err(self.no_such_object(conn, dn).await),
        }
    }

    /// Stored credential of an entry, read outside any transaction.
    ///
    /// # Errors
    ///
    /// `NoSuchObject` when the entry is absent or holds no credential.
    #[instrument(skip_all, fields(dn = %dn))]
    pub async fn find_credential_by_dn(&self, dn: &Dn) -> Result<String> {
        let params = QueryParams::new().with("dnNorm", dn.normalized());
        let credential: Option<Option<String>> = self
            .registry
            .builtin(Stmt::FindCredentialByDn)
            .query_scalar(&params)?
            .fetch_optional(self.pool.inner())
            .await
            .map_err(query_error("find credential"))?;

        credential
            .flatten()
            .ok_or_else(|| DirectoryError::no_such_object(dn.to_string()))
    }

    /// Lock every entry whose `member` array references `dn`.
    pub async fn find_by_member_with_lock(
        &self,
        conn: &mut PgConnection,
        dn: &Dn,
    ) -> Result<Vec<ModifyEntry>> {
        self.fetch_locked(conn, Stmt::FindByMemberWithLock, dn).await
    }

    /// Lock every member of the group `dn`, i.e. every entry whose computed
    /// `memberOf` contains it.
    pub async fn find_by_member_of_with_lock(
        &self,
        conn: &mut PgConnection,
        dn: &Dn,
    ) -> Result<Vec<ModifyEntry>> {
        self.fetch_locked(conn, Stmt::FindByMemberOfWithLock, dn).await
    }

    /// Move `old_dn` to `new_dn` and repoint every `member` reference.
    ///
    /// The entry keeps its surrogate id and entry UUID. Rows are locked
    /// referrers first, then the target, then the new parent, and every
    /// locked row is read before the first write.
    ///
    /// # Errors
    ///
    /// - `NoSuchObject` if `old_dn` or the new parent does not resolve
    /// - `NotAllowedOnNonLeaf` if `old_dn` has children
    /// - `AlreadyExists` if `new_dn` is taken
    #[instrument(skip_all, fields(old_dn = %old_dn, new_dn = %new_dn))]
    pub async fn rename(
        &self,
        conn: &mut PgConnection,
        old_dn: &Dn,
        new_dn: &Dn,
        delete_old_rdn: bool,
    ) -> Result<()> {
        let referrers = self.find_by_member_with_lock(&mut *conn, old_dn).await?;
        let mut target = self.find_by_dn_with_lock(&mut *conn, old_dn).await?;
        self.ensure_leaf(&mut *conn, old_dn).await?;
        self.lock_parent(&mut *conn, new_dn).await?;

        let old_value = [old_dn.original().to_string()];
        let new_value = [new_dn.original().to_string()];
        let rules = self.mapper.rules();

        for mut referrer in referrers {
            if referrer.id() == target.id() {
                continue;
            }
            referrer.delete_values(rules, MEMBER, &old_value)?;
            referrer.add_values(rules, MEMBER, &new_value)?;
            self.update(&mut *conn, &referrer).await?;
        }
        if target.attributes().get(MEMBER).is_some() {
            let before = target.attributes().clone();
            target.delete_values(rules, MEMBER, &old_value)?;
            if target.attributes() != &before {
                target.add_values(rules, MEMBER, &new_value)?;
            }
        }

        target.modify_dn(rules, new_dn.clone(), delete_old_rdn)?;
        let id = target.id().ok_or_else(|| {
            DirectoryError::internal(format!("locked entry {old_dn} has no id"))
        })?;
        let form = self.mapper.modify_entry_to_storage(&target)?;
        let mut params = QueryParams::new()
            .with("id", id)
            .with("newDnNorm", form.dn_norm.as_str())
            .with("newDnOrig", form.dn_orig.as_str())
            .with("newPath", form.path.as_str());
        bind_attributes(&mut params, &form)?;

        self.registry
            .builtin(Stmt::UpdateDn)
            .query(&params)?
            .execute(conn)
            .await
            .map_err(|err| map_write_error(err, "rename entry", new_dn.original()))?;

        info!(id, "Entry renamed");
        Ok(())
    }

    /// Delete a leaf entry and drop every `member` reference to it.
    ///
    /// Locks are taken in the same order as [`Repository::rename`]: referrers,
    /// then the target. Nothing is written until both are held and the
    /// target is known to be a leaf.
    ///
    /// # Errors
    ///
    /// - `NoSuchObject` if `dn` does not resolve
    /// - `NotAllowedOnNonLeaf` if `dn` has children
    #[instrument(skip_all, fields(dn = %dn))]
    pub async fn delete_by_dn(&self, conn: &mut PgConnection, dn: &Dn) -> Result<()> {
        let referrers = self.find_by_member_with_lock(&mut *conn, dn).await?;
        let target = self.find_by_dn_with_lock(&mut *conn, dn).await?;
        self.ensure_leaf(&mut *conn, dn).await?;

        let value = [dn.original().to_string()];
        for mut referrer in referrers {
            if referrer.id() == target.id() {
                continue;
            }
            referrer.delete_values(self.mapper.rules(), MEMBER, &value)?;
            self.update(&mut *conn, &referrer).await?;
        }

        let params = QueryParams::new().with("dnNorm", dn.normalized());
        let deleted: Option<i64> = self
            .registry
            .builtin(Stmt::DeleteByDn)
            .query_scalar(&params)?
            .fetch_optional(&mut *conn)
            .await
            .map_err(query_error(format!("delete entry {dn}")))?;

        match deleted {
            Some(id) => {
                info!(id, "Entry deleted");
                Ok(())
            }
            None => Err(self.no_such_object(conn, dn).await),
        }
    }

    /// Whether any entry sits directly below `dn`.
    pub async fn has_children(&self, conn: &mut PgConnection, dn: &Dn) -> Result<bool> {
        let params = QueryParams::new().with("childPath", dn.child_path());
        self.registry
            .builtin(Stmt::HasChildren)
            .query_scalar::<bool>(&params)?
            .fetch_one(conn)
            .await
            .map_err(query_error(format!("check children of {dn}")))
    }

    /// Display DN of the deepest existing ancestor of `dn`.
    pub async fn matched_dn(&self, conn: &mut PgConnection, dn: &Dn) -> Result<Option<String>> {
        let ancestors: Vec<String> = dn
            .ancestors()
            .iter()
            .map(|ancestor| ancestor.normalized().to_string())
            .collect();
        if ancestors.is_empty() {
            return Ok(None);
        }

        let params = QueryParams::new().with("ancestors", ancestors);
        self.registry
            .builtin(Stmt::FindMatchedDn)
            .query_scalar::<String>(&params)?
            .fetch_optional(conn)
            .await
            .map_err(query_error(format!("find matched DN of {dn}")))
    }

    /// Run one page of a filtered search, streaming entries to `consumer`.
    pub async fn find_by_filter<F>(
        &self,
        conn: &mut PgConnection,
        request: &SearchRequest,
        consumer: F,
    ) -> Result<SearchSummary>
    where
        F: FnMut(SearchEntry) -> Result<()>,
    {
        self.search
            .find_by_filter(conn, request, consumer)
            .await
            .context(|| format!("search under {}", request.scope.base()))
    }

    async fn ensure_leaf(&self, conn: &mut PgConnection, dn: &Dn) -> Result<()> {
        if self.has_children(conn, dn).await? {
            return Err(DirectoryError::NotAllowedOnNonLeaf { dn: dn.to_string() });
        }
        Ok(())
    }

    /// Share-lock the parent of `dn`; the root needs no row.
    async fn lock_parent(&self, conn: &mut PgConnection, dn: &Dn) -> Result<()> {
        let parent = match dn.parent() {
            Some(parent) if !parent.is_root() => parent,
            _ => return Ok(()),
        };
        let params = QueryParams::new().with("dnNorm", parent.normalized());
        let locked: Option<i64> = self
            .registry
            .builtin(Stmt::LockParent)
            .query_scalar(&params)?
            .fetch_optional(&mut *conn)
            .await
            .map_err(query_error(format!("lock parent {parent}")))?;

        match locked {
            Some(_) => Ok(()),
            None => Err(self.no_such_object(conn, dn).await),
        }
    }

    async fn fetch_one_by_dn(
        &self,
        conn: &mut PgConnection,
        stmt: Stmt,
        dn: &Dn,
    ) -> Result<Option<FetchedEntry>> {
        let params = QueryParams::new().with("dnNorm", dn.normalized());
        self.registry
            .builtin(stmt)
            .query_as::<FetchedEntry>(&params)?
            .fetch_optional(conn)
            .await
            .map_err(query_error(format!("{} {dn}", stmt.name())))
    }

    async fn fetch_locked(
        &self,
        conn: &mut PgConnection,
        stmt: Stmt,
        dn: &Dn,
    ) -> Result<Vec<ModifyEntry>> {
        let params = QueryParams::new().with("dnNorm", dn.normalized());
        let rows = self
            .registry
            .builtin(stmt)
            .query_as::<FetchedEntry>(&params)?
            .fetch_all(conn)
            .await
            .map_err(query_error(format!("{} {dn}", stmt.name())))?;

        debug!(count = rows.len(), statement = stmt.name(), "Locked entries");
        rows.into_iter()
            .map(|row| self.mapper.to_modify_entry(row.into_stored().0))
            .collect()
    }

    async fn no_such_object(&self, conn: &mut PgConnection, dn: &Dn) -> DirectoryError {
        match self.matched_dn(conn, dn).await {
            Ok(matched_dn) => DirectoryError::NoSuchObject {
                dn: dn.to_string(),
                matched_dn,
            },
            Err(err) => err,
        }
    }
}

fn bind_attributes(params: &mut QueryParams, form: &StorageForm) -> Result<()> {
    params.set_json("attrsNorm", &form.attrs_norm)?;
    params.set_json("attrsOrig", &form.attrs_orig)?;
    Ok(())
}
