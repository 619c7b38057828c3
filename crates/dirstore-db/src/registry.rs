//! Statement Registry
//!
//! Statements are written with named `:param` placeholders and compiled into
//! PostgreSQL's positional `$n` form plus the ordered list of names to bind.
//! Compiled statements are cached by their literal text for the lifetime of
//! the registry. Server-side preparation is left to the per-connection
//! statement cache of `sqlx`.

use std::sync::Arc;

use dashmap::DashMap;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::{Query, QueryAs, QueryScalar};
use sqlx::{Executor, FromRow, Postgres};
use tracing::{debug, info};

use crate::error::DbError;
use crate::params::QueryParams;
use crate::pool::DbPool;

/// Entry columns, selected from `ldap_entry e1`.
pub(crate) const ENTRY_COLUMNS: &str =
    "e1.id, e1.dn_norm, e1.dn_orig, e1.uuid, e1.created, e1.updated, e1.attrs_orig";

/// Normalized DNs of every entry whose `member` array references `e1`.
pub(crate) const MEMBER_OF_PROJECTION: &str = "(SELECT jsonb_agg(e2.dn_norm ORDER BY e2.id) \
     FROM ldap_entry e2 \
     WHERE e2.attrs_norm->'member' @> jsonb_build_array(e1.dn_norm)) AS member_of";

/// Statements compiled when the registry is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stmt {
    FindByDn,
    FindByDnWithMemberOf,
    FindByDnWithLock,
    LockParent,
    FindCredentialByDn,
    FindByMemberWithLock,
    FindByMemberOfWithLock,
    Insert,
    UpdateAttrs,
    UpdateDn,
    DeleteByDn,
    HasChildren,
    FindMatchedDn,
}

impl Stmt {
    pub const ALL: [Stmt; 13] = [
        Stmt::FindByDn,
        Stmt::FindByDnWithMemberOf,
        Stmt::FindByDnWithLock,
        Stmt::LockParent,
        Stmt::FindCredentialByDn,
        Stmt::FindByMemberWithLock,
        Stmt::FindByMemberOfWithLock,
        Stmt::Insert,
        Stmt::UpdateAttrs,
        Stmt::UpdateDn,
        Stmt::DeleteByDn,
        Stmt::HasChildren,
        Stmt::FindMatchedDn,
    ];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Stmt::FindByDn => "find_by_dn",
            Stmt::FindByDnWithMemberOf => "find_by_dn_with_member_of",
            Stmt::FindByDnWithLock => "find_by_dn_with_lock",
            Stmt::LockParent => "lock_parent",
            Stmt::FindCredentialByDn => "find_credential_by_dn",
            Stmt::FindByMemberWithLock => "find_by_member_with_lock",
            Stmt::FindByMemberOfWithLock => "find_by_member_of_with_lock",
            Stmt::Insert => "insert",
            Stmt::UpdateAttrs => "update_attrs",
            Stmt::UpdateDn => "update_dn",
            Stmt::DeleteByDn => "delete_by_dn",
            Stmt::HasChildren => "has_children",
            Stmt::FindMatchedDn => "find_matched_dn",
        }
    }

    /// Statement text with named parameters.
    #[must_use]
    pub fn text(self) -> String {
        match self {
            Stmt::FindByDn => {
                format!("SELECT {ENTRY_COLUMNS} FROM ldap_entry e1 WHERE e1.dn_norm = :dnNorm")
            }
            Stmt::FindByDnWithMemberOf => format!(
                "SELECT {ENTRY_COLUMNS}, {MEMBER_OF_PROJECTION} \
                 FROM ldap_entry e1 WHERE e1.dn_norm = :dnNorm"
            ),
            Stmt::FindByDnWithLock => format!(
                "SELECT {ENTRY_COLUMNS} FROM ldap_entry e1 WHERE e1.dn_norm = :dnNorm FOR UPDATE"
            ),
            // Conflicts with the FOR UPDATE taken by rename and delete of the parent.
            Stmt::LockParent => {
                "SELECT e1.id FROM ldap_entry e1 WHERE e1.dn_norm = :dnNorm FOR KEY SHARE"
                    .to_string()
            }
            Stmt::FindCredentialByDn => "SELECT e1.attrs_norm->'userpassword'->>0 \
                 FROM ldap_entry e1 WHERE e1.dn_norm = :dnNorm"
                .to_string(),
            Stmt::FindByMemberWithLock => format!(
                "SELECT {ENTRY_COLUMNS} FROM ldap_entry e1 \
                 WHERE e1.attrs_norm->'member' @> jsonb_build_array(CAST(:dnNorm AS text)) \
                 ORDER BY e1.id FOR UPDATE"
            ),
            Stmt::FindByMemberOfWithLock => format!(
                "SELECT {ENTRY_COLUMNS} FROM ldap_entry e1 \
                 WHERE EXISTS (SELECT 1 FROM ldap_entry g \
                 WHERE g.dn_norm = :dnNorm \
                 AND g.attrs_norm->'member' @> jsonb_build_array(e1.dn_norm)) \
                 ORDER BY e1.id FOR UPDATE OF e1"
            ),
            Stmt::Insert => "INSERT INTO ldap_entry \
                 (dn_norm, dn_orig, path, uuid, created, updated, attrs_norm, attrs_orig) \
                 SELECT :dnNorm, :dnOrig, :path, :uuid, :created, :created, :attrsNorm, :attrsOrig \
                 WHERE NOT EXISTS (SELECT 1 FROM ldap_entry WHERE dn_norm = :dnNorm) \
                 RETURNING id"
                .to_string(),
            Stmt::UpdateAttrs => "UPDATE ldap_entry SET updated = now(), \
                 attrs_norm = :attrsNorm, attrs_orig = :attrsOrig WHERE id = :id"
                .to_string(),
            Stmt::UpdateDn => "UPDATE ldap_entry SET updated = now(), \
                 dn_norm = :newDnNorm, dn_orig = :newDnOrig, path = :newPath, \
                 attrs_norm = :attrsNorm, attrs_orig = :attrsOrig WHERE id = :id"
                .to_string(),
            Stmt::DeleteByDn => "DELETE FROM ldap_entry WHERE dn_norm = :dnNorm RETURNING id".to_string(),
            Stmt::HasChildren => {
                "SELECT EXISTS (SELECT 1 FROM ldap_entry WHERE path = :childPath)".to_string()
            }
            Stmt::FindMatchedDn => "SELECT dn_orig FROM ldap_entry \
                 WHERE dn_norm = ANY(:ancestors) \
                 ORDER BY length(dn_norm) DESC LIMIT 1"
                .to_string(),
        }
    }
}

/// A statement in positional form, with the names bound to `$1..$n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledStatement {
    sql: String,
    params: Vec<String>,
}

impl CompiledStatement {
    /// Compile named-parameter text.
    ///
    /// `::` casts and the contents of quoted literals and identifiers are
    /// left alone. A name used more than once is bound once.
    ///
    /// # Errors
    ///
    /// Returns `DbError::InvalidStatement` for an unterminated quote or a
    /// positional `$n` placeholder in the input.
    pub fn compile(text: &str) -> Result<Self, DbError> {
        let mut sql = String::with_capacity(text.len());
        let mut params: Vec<String> = Vec::new();
        let mut chars = text.chars().peekable();

        while let Some(ch) = chars.next() {
            match ch {
                '\'' | '"' => {
                    sql.push(ch);
                    let mut closed = false;
                    for inner in chars.by_ref() {
                        sql.push(inner);
                        if inner == ch {
                            closed = true;
                            break;
                        }
                    }
                    if !closed {
                        return Err(DbError::InvalidStatement(format!(
                            "unterminated {ch} quote in: {text}"
                        )));
                    }
                }
                ':' if chars.peek() == Some(&':') => {
                    chars.next();
                    sql.push_str("::");
                }
                ':' if chars
                    .peek()
                    .is_some_and(|c| c.is_ascii_alphabetic() || *c == '_') =>
                {
                    let mut name = String::new();
                    while let Some(&c) = chars.peek() {
                        if c.is_ascii_alphanumeric() || c == '_' {
                            name.push(c);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    let index = match params.iter().position(|p| *p == name) {
                        Some(found) => found + 1,
                        None => {
                            params.push(name);
                            params.len()
                        }
                    };
                    sql.push('$');
                    sql.push_str(&index.to_string());
                }
                '$' if chars.peek().is_some_and(char::is_ascii_digit) => {
                    return Err(DbError::InvalidStatement(format!(
                        "positional placeholder in named statement: {text}"
                    )));
                }
                _ => sql.push(ch),
            }
        }

        Ok(Self { sql, params })
    }

    /// Positional SQL.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Parameter names in binding order.
    #[must_use]
    pub fn params(&self) -> &[String] {
        &self.params
    }

    /// Bind `values` in positional order.
    ///
    /// # Errors
    ///
    /// Returns `DbError::MissingParameter` if a referenced name has no value.
    pub fn arguments(&self, values: &QueryParams) -> Result<PgArguments, DbError> {
        let mut args = PgArguments::default();
        for name in &self.params {
            let value = values.get(name).ok_or_else(|| DbError::MissingParameter {
                name: name.clone(),
                sql: self.sql.clone(),
            })?;
            value.add_to(&mut args).map_err(|err| {
                DbError::InvalidStatement(format!("cannot encode :{name}: {err}"))
            })?;
        }
        Ok(args)
    }

    pub fn query<'s>(
        &'s self,
        values: &QueryParams,
    ) -> Result<Query<'s, Postgres, PgArguments>, DbError> {
        Ok(sqlx::query_with(&self.sql, self.arguments(values)?))
    }

    pub fn query_as<'s, O>(
        &'s self,
        values: &QueryParams,
    ) -> Result<QueryAs<'s, Postgres, O, PgArguments>, DbError>
    where
        O: for<'r> FromRow<'r, PgRow>,
    {
        Ok(sqlx::query_as_with(&self.sql, self.arguments(values)?))
    }

    pub fn query_scalar<'s, O>(
        &'s self,
        values: &QueryParams,
    ) -> Result<QueryScalar<'s, Postgres, O, PgArguments>, DbError>
    where
        (O,): for<'r> FromRow<'r, PgRow>,
    {
        Ok(sqlx::query_scalar_with(&self.sql, self.arguments(values)?))
    }
}

/// Concurrency-safe cache of compiled statements keyed by statement text.
///
/// The built-in statements are compiled by [`StatementRegistry::new`], so a
/// registry value cannot exist without them. Other texts are compiled on
/// first use and never evicted.
#[derive(Debug)]
pub struct StatementRegistry {
    statements: DashMap<String, Arc<CompiledStatement>>,
    builtins: Vec<Arc<CompiledStatement>>,
}

impl StatementRegistry {
    /// Build a registry holding every [`Stmt`].
    ///
    /// # Errors
    ///
    /// Returns `DbError::InvalidStatement` if a built-in fails to compile.
    pub fn new() -> Result<Self, DbError> {
        let statements = DashMap::new();
        let mut builtins = Vec::with_capacity(Stmt::ALL.len());
        for stmt in Stmt::ALL {
            let text = stmt.text();
            let compiled = Arc::new(CompiledStatement::compile(&text)?);
            statements.insert(text, Arc::clone(&compiled));
            builtins.push(compiled);
        }
        debug!(count = builtins.len(), "Compiled built-in statements");
        Ok(Self {
            statements,
            builtins,
        })
    }

    /// A built-in statement.
    #[must_use]
    pub fn builtin(&self, stmt: Stmt) -> Arc<CompiledStatement> {
        Arc::clone(&self.builtins[stmt as usize])
    }

    /// Return the cached statement for `text`, compiling it on a miss.
    ///
    /// Racing callers may each compile the same text; the first insert wins
    /// and every caller receives that stored statement.
    ///
    /// # Errors
    ///
    /// Returns `DbError::InvalidStatement` if `text` does not compile.
    pub fn get_or_compile(&self, text: &str) -> Result<Arc<CompiledStatement>, DbError> {
        if let Some(found) = self.statements.get(text) {
            return Ok(Arc::clone(found.value()));
        }

        let compiled = Arc::new(CompiledStatement::compile(text)?);
        let stored = self
            .statements
            .entry(text.to_string())
            .or_insert(compiled);
        debug!(params = stored.params().len(), "Cached compiled statement");
        Ok(Arc::clone(stored.value()))
    }

    /// Number of cached statements, built-ins included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.statements.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Have the server parse every built-in statement.
    ///
    /// # Errors
    ///
    /// Returns `DbError::QueryFailed` naming the first statement rejected.
    pub async fn verify(&self, pool: &DbPool) -> Result<usize, DbError> {
        for stmt in Stmt::ALL {
            let compiled = self.builtin(stmt);
            pool.inner()
                .prepare(compiled.sql())
                .await
                .map_err(|err| DbError::query_failed(format!("prepare {}", stmt.name()), err))?;
        }
        info!(count = Stmt::ALL.len(), "Verified built-in statements");
        Ok(Stmt::ALL.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_named_parameters() {
        let compiled =
            CompiledStatement::compile("SELECT 1 FROM t WHERE a = :first AND b = :second_2")
                .unwrap();
        assert_eq!(compiled.sql(), "SELECT 1 FROM t WHERE a = $1 AND b = $2");
        assert_eq!(compiled.params(), ["first", "second_2"]);
    }

    #[test]
    fn test_repeated_name_reuses_position() {
        let compiled = CompiledStatement::compile(&Stmt::Insert.text()).unwrap();
        assert_eq!(compiled.params().iter().filter(|p| *p == "dnNorm").count(), 1);
        assert_eq!(compiled.params().len(), 7);
        assert!(compiled.sql().contains("WHERE dn_norm = $1"));
    }

    #[test]
    fn test_casts_and_literals_untouched() {
        let compiled = CompiledStatement::compile(
            "SELECT ':nope', \"col:x\" FROM t WHERE a::text = :value AND b = 'it''s'",
        )
        .unwrap();
        assert_eq!(
            compiled.sql(),
            "SELECT ':nope', \"col:x\" FROM t WHERE a::text = $1 AND b = 'it''s'"
        );
        assert_eq!(compiled.params(), ["value"]);
    }

    #[test]
    fn test_compile_rejects_bad_text() {
        assert!(CompiledStatement::compile("SELECT 'open").is_err());
        assert!(CompiledStatement::compile("SELECT $1").is_err());
    }

    #[test]
    fn test_missing_parameter() {
        let compiled = CompiledStatement::compile("SELECT :a, :b").unwrap();
        let err = compiled
            .arguments(&QueryParams::new().with("a", 1i64))
            .unwrap_err();
        assert!(matches!(err, DbError::MissingParameter { name, .. } if name == "b"));
    }

    #[test]
    fn test_registry_holds_builtins() {
        let registry = StatementRegistry::new().unwrap();
        assert_eq!(registry.len(), Stmt::ALL.len());
        for stmt in Stmt::ALL {
            let compiled = registry.builtin(stmt);
            assert!(!compiled.sql().contains(":dnNorm"), "{}", stmt.name());
            let again = registry.get_or_compile(&stmt.text()).unwrap();
            assert!(Arc::ptr_eq(&compiled, &again));
        }
    }

    #[test]
    fn test_get_or_compile_caches() {
        let registry = StatementRegistry::new().unwrap();
        let text = "SELECT e1.id FROM ldap_entry e1 WHERE e1.path = :scopePath";
        let first = registry.get_or_compile(text).unwrap();
        let second = registry.get_or_compile(text).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), Stmt::ALL.len() + 1);
    }

    #[test]
    fn test_concurrent_get_or_compile_yields_one_statement() {
        let registry = Arc::new(StatementRegistry::new().unwrap());
        let text = "SELECT e1.id FROM ldap_entry e1 WHERE e1.dn_norm = :dnNorm AND e1.path = :scopePath";

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.get_or_compile(text).unwrap())
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let stored = registry.get_or_compile(text).unwrap();
        assert!(results.iter().all(|r| Arc::ptr_eq(r, &stored)));
        assert_eq!(stored.params(), ["dnNorm", "scopePath"]);
    }
}
