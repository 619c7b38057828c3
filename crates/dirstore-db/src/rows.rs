//! Row types read from `ldap_entry`.

use chrono::{DateTime, Utc};
use dirstore_core::{EntryMapper, OriginalAttributes, Result, SearchEntry, StoredEntry};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

/// An entry row, optionally carrying the membership projection and the
/// windowed total of a search.
#[derive(Debug, Clone, FromRow)]
pub struct FetchedEntry {
    pub id: i64,
    pub dn_norm: String,
    pub dn_orig: String,
    pub uuid: Uuid,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub attrs_orig: Json<OriginalAttributes>,
    #[sqlx(default)]
    pub member_of: Option<Json<Vec<String>>>,
    #[sqlx(default)]
    pub count: i64,
}

impl FetchedEntry {
    /// Split into the stored entry and its membership projection.
    #[must_use]
    pub fn into_stored(self) -> (StoredEntry, Vec<String>) {
        let member_of = self.member_of.map(|json| json.0).unwrap_or_default();
        let stored = StoredEntry {
            id: self.id,
            dn_norm: self.dn_norm,
            dn_orig: self.dn_orig,
            entry_uuid: self.uuid,
            created: self.created,
            updated: self.updated,
            attrs_orig: self.attrs_orig.0,
        };
        (stored, member_of)
    }

    /// Map to a search entry, injecting `memberOf` when `with_member_of`.
    pub fn into_search_entry(self, mapper: &EntryMapper, with_member_of: bool) -> Result<SearchEntry> {
        let (stored, member_of) = self.into_stored();
        if with_member_of {
            mapper.from_storage_with_member_of(stored, member_of)
        } else {
            mapper.from_storage(stored)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetched(member_of: Option<Vec<&str>>) -> FetchedEntry {
        let attrs: OriginalAttributes = [
            ("objectClass", vec!["person".to_string()]),
            ("cn", vec!["Alice".to_string()]),
        ]
        .into_iter()
        .collect();
        FetchedEntry {
            id: 3,
            dn_norm: "cn=alice,dc=example".to_string(),
            dn_orig: "cn=Alice,dc=Example".to_string(),
            uuid: Uuid::new_v4(),
            created: Utc::now(),
            updated: Utc::now(),
            attrs_orig: Json(attrs),
            member_of: member_of.map(|v| Json(v.into_iter().map(String::from).collect())),
            count: 1,
        }
    }

    #[test]
    fn test_projection_injected_on_request() {
        let mapper = EntryMapper::default();
        let entry = fetched(Some(vec!["cn=staff,dc=example"]))
            .into_search_entry(&mapper, true)
            .unwrap();
        assert_eq!(
            entry.attributes.get("memberOf").unwrap(),
            &["cn=staff,dc=example".to_string()][..]
        );
        assert_eq!(entry.id, 3);
    }

    #[test]
    fn test_null_projection_adds_nothing() {
        let mapper = EntryMapper::default();
        let entry = fetched(None).into_search_entry(&mapper, true).unwrap();
        assert!(!entry.attributes.contains("memberOf"));
    }

    #[test]
    fn test_projection_ignored_when_not_requested() {
        let mapper = EntryMapper::default();
        let entry = fetched(Some(vec!["cn=staff,dc=example"]))
            .into_search_entry(&mapper, false)
            .unwrap();
        assert!(!entry.attributes.contains("memberOf"));
        assert_eq!(entry.dn, "cn=Alice,dc=Example");
    }
}
