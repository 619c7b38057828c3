//! Filtered Search Executor
//!
//! Combines a path-scope predicate over the materialized path with a filter
//! clause produced by the filter compiler, paginates the result in surrogate
//! id order and streams mapped entries to a consumer.
//!
//! Two shapes are generated, with and without the `memberOf` projection.
//! Both carry a windowed `count(e1.id) OVER()` so the total is known from
//! the first row of any non-empty page.

use std::sync::Arc;

use dirstore_core::{Dn, EntryMapper, Result, SearchEntry, PATH_SEPARATOR};
use futures_util::stream::BoxStream;
use futures_util::TryStreamExt;
use serde::Serialize;
use sqlx::PgConnection;
use tracing::debug;

use crate::error::{query_error, DbError};
use crate::params::QueryParams;
use crate::registry::{CompiledStatement, StatementRegistry, ENTRY_COLUMNS, MEMBER_OF_PROJECTION};
use crate::rows::FetchedEntry;

/// Parameter names bound by the executor itself.
const RESERVED_PARAMS: [&str; 5] = ["scopeDn", "scopePath", "scopePathPrefix", "pageSize", "offset"];

/// How much of the tree below the base a search covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchScope {
    /// The base entry only.
    BaseObject,
    /// Immediate children of the base.
    SingleLevel,
    /// The base and everything below it.
    #[default]
    WholeSubtree,
    /// Everything below the base, excluding the base.
    SubordinateSubtree,
}

/// A search base with its scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathScope {
    base: Dn,
    scope: SearchScope,
}

impl PathScope {
    #[must_use]
    pub fn new(base: Dn, scope: SearchScope) -> Self {
        Self { base, scope }
    }

    #[must_use]
    pub fn base(&self) -> &Dn {
        &self.base
    }

    #[must_use]
    pub fn scope(&self) -> SearchScope {
        self.scope
    }

    /// The predicate on `e1` and its parameters.
    ///
    /// The clause text depends only on the scope, not on the base, so each
    /// scope compiles to one cached statement per filter shape.
    #[must_use]
    pub fn clause(&self) -> (String, QueryParams) {
        let child_path = self.base.child_path();
        let prefix = format!("{}{}%", escape_like(&child_path), PATH_SEPARATOR);

        match self.scope {
            SearchScope::BaseObject => (
                "e1.dn_norm = :scopeDn".to_string(),
                QueryParams::new().with("scopeDn", self.base.normalized()),
            ),
            SearchScope::SingleLevel => (
                "e1.path = :scopePath".to_string(),
                QueryParams::new().with("scopePath", child_path),
            ),
            SearchScope::WholeSubtree | SearchScope::SubordinateSubtree
                if self.base.is_root() =>
            {
                ("TRUE".to_string(), QueryParams::new())
            }
            SearchScope::WholeSubtree => (
                "(e1.dn_norm = :scopeDn OR e1.path = :scopePath OR e1.path LIKE :scopePathPrefix)"
                    .to_string(),
                QueryParams::new()
                    .with("scopeDn", self.base.normalized())
                    .with("scopePath", child_path)
                    .with("scopePathPrefix", prefix),
            ),
            SearchScope::SubordinateSubtree => (
                "(e1.path = :scopePath OR e1.path LIKE :scopePathPrefix)".to_string(),
                QueryParams::new()
                    .with("scopePath", child_path)
                    .with("scopePathPrefix", prefix),
            ),
        }
    }
}

/// Escape `LIKE` wildcards with the default backslash escape.
fn escape_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// A compiled filter: a boolean SQL clause over `e1` with named parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterQuery {
    pub clause: String,
    pub params: QueryParams,
}

impl FilterQuery {
    pub fn new(clause: impl Into<String>, params: QueryParams) -> Self {
        Self {
            clause: clause.into(),
            params,
        }
    }

    /// Matches every entry, like `(objectClass=*)`.
    #[must_use]
    pub fn match_all() -> Self {
        Self::new("TRUE", QueryParams::new())
    }
}

/// One page of a search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub size: u32,
    pub offset: u32,
}

impl Page {
    #[must_use]
    pub fn new(size: u32, offset: u32) -> Self {
        Self { size, offset }
    }

    /// The page after this one.
    #[must_use]
    pub fn next(self) -> Self {
        Self {
            size: self.size,
            offset: self.offset.saturating_add(self.size),
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(500, 0)
    }
}

/// A search to run.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub scope: PathScope,
    pub filter: FilterQuery,
    pub member_of: bool,
    pub page: Page,
}

impl SearchRequest {
    #[must_use]
    pub fn new(scope: PathScope, filter: FilterQuery) -> Self {
        Self {
            scope,
            filter,
            member_of: false,
            page: Page::default(),
        }
    }

    #[must_use]
    pub fn with_member_of(mut self, member_of: bool) -> Self {
        self.member_of = member_of;
        self
    }

    #[must_use]
    pub fn with_page(mut self, page: Page) -> Self {
        self.page = page;
        self
    }
}

/// Totals of one executed page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchSummary {
    /// Matching entries across all pages.
    pub total_count: i64,
    /// Entries handed to the consumer from this page.
    pub returned: i64,
}

/// A compiled search ready to execute.
#[derive(Debug, Clone)]
pub struct PreparedSearch {
    statement: Arc<CompiledStatement>,
    count_text: String,
    params: QueryParams,
    member_of: bool,
    page: Page,
}

impl PreparedSearch {
    #[must_use]
    pub fn statement(&self) -> &CompiledStatement {
        &self.statement
    }
}

/// Lazy, finite, non-restartable sequence of search results.
///
/// The first row fixes the total count. After an error or the last row the
/// stream yields nothing more.
pub struct EntryStream<'a> {
    rows: BoxStream<'a, std::result::Result<FetchedEntry, sqlx::Error>>,
    mapper: &'a EntryMapper,
    member_of: bool,
    total_count: Option<i64>,
    finished: bool,
}

impl<'a> EntryStream<'a> {
    /// Fetch and map the next row.
    ///
    /// # Errors
    ///
    /// Returns `Internal` when the row cannot be read or mapped.
    pub async fn next(&mut self) -> Result<Option<SearchEntry>> {
        if self.finished {
            return Ok(None);
        }
        let row = match self.rows.try_next().await {
            Ok(Some(row)) => row,
            Ok(None) => {
                self.finished = true;
                return Ok(None);
            }
            Err(err) => {
                self.finished = true;
                return Err(DbError::query_failed("fetch search row", err).into());
            }
        };
        self.total_count.get_or_insert(row.count);
        row.into_search_entry(self.mapper, self.member_of)
            .map(Some)
            .inspect_err(|_| self.finished = true)
    }

    /// Total reported by the first row, if any row arrived.
    #[must_use]
    pub fn total_count(&self) -> Option<i64> {
        self.total_count
    }
}

/// Compiles and runs filtered searches.
#[derive(Debug, Clone)]
pub struct SearchExecutor {
    registry: Arc<StatementRegistry>,
    mapper: Arc<EntryMapper>,
}

impl SearchExecutor {
    #[must_use]
    pub fn new(registry: Arc<StatementRegistry>, mapper: Arc<EntryMapper>) -> Self {
        Self { registry, mapper }
    }

    /// Statement text for one page.
    #[must_use]
    pub fn fetch_text(scope_clause: &str, filter_clause: &str, member_of: bool) -> String {
        let projection = if member_of {
            format!(", {MEMBER_OF_PROJECTION}")
        } else {
            String::new()
        };
        format!(
            "SELECT {ENTRY_COLUMNS}{projection}, count(e1.id) OVER() AS count \
             FROM ldap_entry e1 WHERE {scope_clause} AND ({filter_clause}) \
             ORDER BY e1.id LIMIT :pageSize OFFSET :offset"
        )
    }

    /// Statement text counting every match.
    #[must_use]
    pub fn count_text(scope_clause: &str, filter_clause: &str) -> String {
        format!(
            "SELECT count(e1.id) FROM ldap_entry e1 WHERE {scope_clause} AND ({filter_clause})"
        )
    }

    /// Compile (or fetch from the registry) the statement for `request`.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the filter clause does not compile or binds a
    /// name the executor reserves for scope and paging.
    pub fn prepare(&self, request: &SearchRequest) -> Result<PreparedSearch> {
        if let Some(name) = RESERVED_PARAMS
            .iter()
            .find(|name| request.filter.params.get(name).is_some())
        {
            return Err(DbError::InvalidStatement(format!(
                "filter parameter :{name} collides with a search parameter"
            ))
            .into());
        }

        let (scope_clause, mut params) = request.scope.clause();
        params.extend(request.filter.params.clone());
        params.set("pageSize", i64::from(request.page.size));
        params.set("offset", i64::from(request.page.offset));

        let text = Self::fetch_text(&scope_clause, &request.filter.clause, request.member_of);
        let statement = self.registry.get_or_compile(&text)?;

        Ok(PreparedSearch {
            statement,
            count_text: Self::count_text(&scope_clause, &request.filter.clause),
            params,
            member_of: request.member_of,
            page: request.page,
        })
    }

    /// Open a row stream for `prepared` on `conn`.
    pub fn stream<'a>(
        &'a self,
        conn: &'a mut PgConnection,
        prepared: &'a PreparedSearch,
    ) -> Result<EntryStream<'a>> {
        let rows = prepared
            .statement
            .query_as::<FetchedEntry>(&prepared.params)?
            .fetch(conn);
        Ok(EntryStream {
            rows,
            mapper: &self.mapper,
            member_of: prepared.member_of,
            total_count: None,
            finished: false,
        })
    }

    /// Run one page of `request`, handing each entry to `consumer` as it is
    /// read.
    ///
    /// A consumer error stops the iteration and is returned unchanged.
    /// `total_count` does not depend on the page: an empty page past the end
    /// falls back to a separate count.
    pub async fn find_by_filter<F>(
        &self,
        conn: &mut PgConnection,
        request: &SearchRequest,
        mut consumer: F,
    ) -> Result<SearchSummary>
    where
        F: FnMut(SearchEntry) -> Result<()>,
    {
        let prepared = self.prepare(request)?;

        let mut returned = 0i64;
        let streamed_total = {
            let mut stream = self.stream(&mut *conn, &prepared)?;
            while let Some(entry) = stream.next().await? {
                returned += 1;
                consumer(entry)?;
            }
            stream.total_count()
        };

        let total_count = match streamed_total {
            Some(total) => total,
            None if prepared.page.offset > 0 || prepared.page.size == 0 => {
                self.count(conn, &prepared).await?
            }
            None => 0,
        };

        debug!(
            total_count,
            returned,
            offset = prepared.page.offset,
            "Search page complete"
        );
        Ok(SearchSummary {
            total_count,
            returned,
        })
    }

    async fn count(&self, conn: &mut PgConnection, prepared: &PreparedSearch) -> Result<i64> {
        let statement = self.registry.get_or_compile(&prepared.count_text)?;
        let total: i64 = statement
            .query_scalar(&prepared.params)?
            .fetch_one(conn)
            .await
            .map_err(query_error("count search matches"))?;
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(base: &str, scope: SearchScope) -> PathScope {
        PathScope::new(Dn::parse(base).unwrap(), scope)
    }

    #[test]
    fn test_base_scope_matches_dn() {
        let (clause, params) = scope("ou=People,dc=Example", SearchScope::BaseObject).clause();
        assert_eq!(clause, "e1.dn_norm = :scopeDn");
        assert_eq!(params.get("scopeDn"), Some(&"ou=people,dc=example".into()));
    }

    #[test]
    fn test_one_level_scope_matches_child_path() {
        let (clause, params) = scope("ou=People,dc=Example", SearchScope::SingleLevel).clause();
        assert_eq!(clause, "e1.path = :scopePath");
        assert_eq!(params.get("scopePath"), Some(&"dc=example/ou=people".into()));
    }

    #[test]
    fn test_subtree_scope_uses_prefix() {
        let (clause, params) = scope("ou=my_unit,dc=example", SearchScope::WholeSubtree).clause();
        assert!(clause.contains("e1.dn_norm = :scopeDn"));
        assert!(clause.contains("LIKE :scopePathPrefix"));
        assert_eq!(
            params.get("scopePathPrefix"),
            Some(&"dc=example/ou=my\\_unit/%".into())
        );
    }

    #[test]
    fn test_subordinate_scope_excludes_base() {
        let (clause, params) =
            scope("dc=example", SearchScope::SubordinateSubtree).clause();
        assert!(!clause.contains("scopeDn"));
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_root_subtree_matches_everything() {
        let (clause, params) = PathScope::new(Dn::root(), SearchScope::WholeSubtree).clause();
        assert_eq!(clause, "TRUE");
        assert!(params.is_empty());

        let (clause, params) = PathScope::new(Dn::root(), SearchScope::SingleLevel).clause();
        assert_eq!(clause, "e1.path = :scopePath");
        assert_eq!(params.get("scopePath"), Some(&"".into()));
    }

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("a%b_c\\2f"), "a\\%b\\_c\\\\2f");
    }

    #[test]
    fn test_fetch_text_shapes() {
        let plain = SearchExecutor::fetch_text("TRUE", "TRUE", false);
        assert!(plain.contains("count(e1.id) OVER()"));
        assert!(plain.contains("ORDER BY e1.id LIMIT :pageSize OFFSET :offset"));
        assert!(!plain.contains("member_of"));

        let projected = SearchExecutor::fetch_text("TRUE", "TRUE", true);
        assert!(projected.contains("AS member_of"));
    }

    #[test]
    fn test_prepare_reuses_statement_across_bases() {
        let executor = SearchExecutor::new(
            Arc::new(StatementRegistry::new().unwrap()),
            Arc::new(EntryMapper::default()),
        );
        let filter = FilterQuery::new(
            "e1.attrs_norm @> :f0",
            QueryParams::new().with("f0", serde_json::json!({ "objectclass": ["person"] })),
        );

        let first = executor
            .prepare(&SearchRequest::new(
                scope("ou=a,dc=example", SearchScope::WholeSubtree),
                filter.clone(),
            ))
            .unwrap();
        let second = executor
            .prepare(
                &SearchRequest::new(scope("ou=b,dc=example", SearchScope::WholeSubtree), filter)
                    .with_page(Page::new(10, 20)),
            )
            .unwrap();

        assert!(Arc::ptr_eq(&first.statement, &second.statement));
        assert_eq!(
            first.statement().params(),
            ["scopeDn", "scopePath", "scopePathPrefix", "f0", "pageSize", "offset"]
        );
        assert_eq!(second.params.get("offset"), Some(&20i64.into()));
    }

    #[test]
    fn test_prepare_rejects_reserved_filter_parameters() {
        let executor = SearchExecutor::new(
            Arc::new(StatementRegistry::new().unwrap()),
            Arc::new(EntryMapper::default()),
        );
        for name in RESERVED_PARAMS {
            let filter = FilterQuery::new(
                format!("e1.dn_norm = :{name}"),
                QueryParams::new().with(name, "cn=x,dc=example"),
            );
            let err = executor
                .prepare(&SearchRequest::new(
                    scope("dc=example", SearchScope::WholeSubtree),
                    filter,
                ))
                .unwrap_err();
            assert!(!err.is_classified(), "{name}");
            assert!(err.report().contains(name), "{name}");
        }
    }

    #[test]
    fn test_page_next() {
        let page = Page::new(10, 0).next().next();
        assert_eq!(page, Page::new(10, 20));
    }
}
