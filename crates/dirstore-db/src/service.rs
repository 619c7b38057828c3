//! Directory operations as the protocol handler sees them.
//!
//! Each call normalizes the request DN, asks the [`Authorizer`], stages the
//! entry and runs the repository operation in its own transaction. Classified
//! failures are logged at `warn` and unclassified ones at `error` with their
//! full causal chain. The protocol layer turns the returned result into an
//! [`OperationOutcome`](dirstore_core::OperationOutcome).

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dirstore_core::{
    AddEntry, DirectoryError, Dn, Modification, OriginalAttributes, Result, ResultExt, SearchEntry,
};
use sqlx::{Postgres, Transaction};
use tracing::{debug, error, warn};

use crate::error::DbError;
use crate::repository::Repository;
use crate::search::{SearchRequest, SearchSummary};

/// Kind of request being authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Add,
    Modify,
    ModifyDn,
    Delete,
    Search,
}

impl Operation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Add => "add",
            Operation::Modify => "modify",
            Operation::ModifyDn => "modify_dn",
            Operation::Delete => "delete",
            Operation::Search => "search",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of the caller, `None` when anonymous.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Requester {
    pub bound_dn: Option<Dn>,
}

impl Requester {
    #[must_use]
    pub fn anonymous() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn bound(dn: Dn) -> Self {
        Self { bound_dn: Some(dn) }
    }
}

/// Policy check run before every operation except credential lookup.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn is_allowed(&self, requester: &Requester, operation: Operation, dn: &Dn) -> bool;
}

/// Permits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn is_allowed(&self, _requester: &Requester, _operation: Operation, _dn: &Dn) -> bool {
        true
    }
}

/// Entry point for protocol handlers.
#[derive(Clone)]
pub struct DirectoryService {
    repo: Repository,
    authorizer: Arc<dyn Authorizer>,
}

impl DirectoryService {
    pub fn new(repo: Repository, authorizer: Arc<dyn Authorizer>) -> Self {
        Self { repo, authorizer }
    }

    #[must_use]
    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    /// Create an entry; returns its surrogate id.
    pub async fn add(
        &self,
        requester: &Requester,
        dn: &str,
        attributes: OriginalAttributes,
    ) -> Result<i64> {
        let result = async {
            let dn = self.resolve(requester, Operation::Add, dn).await?;
            let entry = AddEntry::new(dn, attributes);

            let mut tx = self.repo.begin().await?;
            let result = self.repo.insert(&mut *tx, &entry).await;
            settle(tx, result).await
        }
        .await;
        log_result(Operation::Add, dn, &result);
        result
    }

    /// Apply `changes` to an entry, in order, as one update.
    pub async fn modify(
        &self,
        requester: &Requester,
        dn: &str,
        changes: &[Modification],
    ) -> Result<()> {
        let result = async {
            let dn = self.resolve(requester, Operation::Modify, dn).await?;

            let mut tx = self.repo.begin().await?;
            let result = async {
                let mut entry = self.repo.find_by_dn_with_lock(&mut *tx, &dn).await?;
                for change in changes {
                    entry.apply(self.repo.mapper().rules(), change)?;
                }
                self.repo.update(&mut *tx, &entry).await
            }
            .await;
            settle(tx, result).await
        }
        .await;
        log_result(Operation::Modify, dn, &result);
        result
    }

    /// Rename an entry, optionally moving it under `new_superior`.
    pub async fn modify_dn(
        &self,
        requester: &Requester,
        dn: &str,
        new_rdn: &str,
        delete_old_rdn: bool,
        new_superior: Option<&str>,
    ) -> Result<()> {
        let result = async {
            let old_dn = self.resolve(requester, Operation::ModifyDn, dn).await?;
            let new_rdn = Dn::parse(new_rdn)?;
            let superior = new_superior.map(Dn::parse).transpose()?;
            let new_dn = old_dn.renamed(&new_rdn, superior.as_ref())?;

            let mut tx = self.repo.begin().await?;
            let result = self
                .repo
                .rename(&mut *tx, &old_dn, &new_dn, delete_old_rdn)
                .await;
            settle(tx, result).await
        }
        .await;
        log_result(Operation::ModifyDn, dn, &result);
        result
    }

    pub async fn delete(&self, requester: &Requester, dn: &str) -> Result<()> {
        let result = async {
            let dn = self.resolve(requester, Operation::Delete, dn).await?;

            let mut tx = self.repo.begin().await?;
            let result = self.repo.delete_by_dn(&mut *tx, &dn).await;
            settle(tx, result).await
        }
        .await;
        log_result(Operation::Delete, dn, &result);
        result
    }

    /// Look up one entry, optionally with its computed `memberOf`.
    pub async fn get(
        &self,
        requester: &Requester,
        dn: &str,
        with_member_of: bool,
    ) -> Result<SearchEntry> {
        let result = async {
            let dn = self.resolve(requester, Operation::Search, dn).await?;
            let mut conn = self
                .repo
                .pool()
                .inner()
                .acquire()
                .await
                .map_err(DbError::ConnectionFailed)?;
            if with_member_of {
                self.repo.find_by_dn_with_member_of(&mut conn, &dn).await
            } else {
                self.repo.find_by_dn(&mut conn, &dn).await
            }
        }
        .await;
        log_result(Operation::Search, dn, &result);
        result
    }

    /// Run one page of a search.
    pub async fn search<F>(
        &self,
        requester: &Requester,
        request: &SearchRequest,
        consumer: F,
    ) -> Result<SearchSummary>
    where
        F: FnMut(SearchEntry) -> Result<()> + Send,
    {
        let base = request.scope.base().to_string();
        let result = async {
            self.authorize(requester, Operation::Search, request.scope.base())
                .await?;
            let mut conn = self
                .repo
                .pool()
                .inner()
                .acquire()
                .await
                .map_err(DbError::ConnectionFailed)?;
            self.repo.find_by_filter(&mut conn, request, consumer).await
        }
        .await;
        log_result(Operation::Search, &base, &result);
        result
    }

    /// Stored credential for a bind; the caller verifies it.
    pub async fn bind_credential(&self, dn: &str) -> Result<String> {
        let result = async {
            let dn = Dn::parse(dn)?;
            self.repo.find_credential_by_dn(&dn).await
        }
        .await;
        if let Err(err) = &result {
            if err.is_classified() {
                debug!(dn, error = %err, "Bind credential unavailable");
            } else {
                error!(dn, error = %err.report(), "Bind credential lookup failed");
            }
        }
        result
    }

    async fn resolve(&self, requester: &Requester, operation: Operation, dn: &str) -> Result<Dn> {
        let dn = Dn::parse(dn)?;
        self.authorize(requester, operation, &dn).await?;
        Ok(dn)
    }

    async fn authorize(&self, requester: &Requester, operation: Operation, dn: &Dn) -> Result<()> {
        if self.authorizer.is_allowed(requester, operation, dn).await {
            Ok(())
        } else {
            Err(DirectoryError::InsufficientAccess {
                operation: operation.to_string(),
                dn: dn.to_string(),
            })
        }
    }
}

impl fmt::Debug for DirectoryService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryService")
            .field("repo", &self.repo)
            .finish_non_exhaustive()
    }
}

/// Commit on success, roll back on failure.
///
/// A failed rollback is logged; the operation's own error is returned.
async fn settle<T>(tx: Transaction<'static, Postgres>, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            tx.commit()
                .await
                .map_err(|err| DbError::query_failed("commit transaction", err))?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback) = tx.rollback().await {
                error!(error = %rollback, "Transaction rollback failed");
            }
            Err(err).context(|| "transaction rolled back")
        }
    }
}

fn log_result<T>(operation: Operation, dn: &str, result: &Result<T>) {
    match result {
        Ok(_) => debug!(%operation, dn, "Directory operation completed"),
        Err(err) if err.is_classified() => {
            warn!(%operation, dn, error = %err, "Directory operation rejected");
        }
        Err(err) => {
            error!(%operation, dn, error = %err.report(), "Directory operation failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::DbPool;
    use dirstore_core::{EntryMapper, ResultCode};
    use sqlx::postgres::PgPoolOptions;

    struct DenyAll;

    #[async_trait]
    impl Authorizer for DenyAll {
        async fn is_allowed(&self, _: &Requester, _: Operation, _: &Dn) -> bool {
            false
        }
    }

    fn service(authorizer: Arc<dyn Authorizer>) -> DirectoryService {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/dirstore")
            .unwrap();
        let repo = Repository::new(DbPool::from_pool(pool), EntryMapper::default()).unwrap();
        DirectoryService::new(repo, authorizer)
    }

    fn person() -> OriginalAttributes {
        [("objectClass", vec!["person".to_string()])]
            .into_iter()
            .collect()
    }

    #[tokio::test]
    async fn test_invalid_dn_rejected_before_storage() {
        let svc = service(Arc::new(AllowAll));
        let err = svc
            .add(&Requester::anonymous(), "not a dn", person())
            .await
            .unwrap_err();
        assert_eq!(err.result_code(), ResultCode::InvalidDnSyntax);
    }

    #[tokio::test]
    async fn test_denied_operations_report_insufficient_access() {
        let svc = service(Arc::new(DenyAll));
        let requester = Requester::anonymous();

        let err = svc
            .add(&requester, "cn=a,dc=example", person())
            .await
            .unwrap_err();
        assert_eq!(err.result_code(), ResultCode::InsufficientAccessRights);

        let err = svc.delete(&requester, "cn=a,dc=example").await.unwrap_err();
        assert!(matches!(
            err,
            DirectoryError::InsufficientAccess { ref operation, .. } if operation == "delete"
        ));

        let err = svc
            .modify_dn(&requester, "cn=a,dc=example", "cn=b", true, None)
            .await
            .unwrap_err();
        assert_eq!(err.result_code(), ResultCode::InsufficientAccessRights);
    }

    #[tokio::test]
    async fn test_bad_new_rdn_is_invalid_dn() {
        let svc = service(Arc::new(AllowAll));
        let err = svc
            .modify_dn(&Requester::anonymous(), "cn=a,dc=example", "cn=b,dc=x", true, None)
            .await
            .unwrap_err();
        assert_eq!(err.result_code(), ResultCode::InvalidDnSyntax);
    }

    #[test]
    fn test_operation_names() {
        assert_eq!(Operation::ModifyDn.to_string(), "modify_dn");
        assert_eq!(Operation::Search.as_str(), "search");
    }
}
