//! Entry Mapper
//!
//! Converts between the caller-facing attribute set and the two persisted
//! forms. The mapper owns the equivalence between the normalized and the
//! original maps: both always describe the same attribute set, differing
//! only in how values are folded.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::attrs::{NormalizedAttributes, OriginalAttributes};
use crate::dn::Dn;
use crate::entry::{AddEntry, ModifyEntry, SearchEntry};
use crate::error::{DirectoryError, Result};
use crate::rules::MatchingRules;

/// Name of the computed membership attribute.
pub const MEMBER_OF: &str = "memberOf";

/// Structural attribute every entry must carry.
pub const OBJECT_CLASS: &str = "objectClass";

/// Column values for writing an entry.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageForm {
    pub dn_norm: String,
    pub dn_orig: String,
    pub path: String,
    pub attrs_norm: NormalizedAttributes,
    pub attrs_orig: OriginalAttributes,
}

/// Column values read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntry {
    pub id: i64,
    pub dn_norm: String,
    pub dn_orig: String,
    pub entry_uuid: Uuid,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub attrs_orig: OriginalAttributes,
}

/// Maps staged entries to storage and stored rows back to search entries.
#[derive(Debug, Clone, Default)]
pub struct EntryMapper {
    rules: MatchingRules,
}

impl EntryMapper {
    #[must_use]
    pub fn new(rules: MatchingRules) -> Self {
        Self { rules }
    }

    #[must_use]
    pub fn rules(&self) -> &MatchingRules {
        &self.rules
    }

    /// Build both storage maps for `attributes` under `dn`.
    ///
    /// `memberOf` is computed at read time and is dropped here. Normalized
    /// value lists are de-duplicated; original values are kept verbatim.
    ///
    /// # Errors
    ///
    /// - `ObjectClassViolation` when `objectClass` is absent or `dn` is the root
    /// - `InvalidAttributeSyntax` for an attribute without values or a value
    ///   its matching rule rejects
    pub fn to_storage(&self, dn: &Dn, attributes: &OriginalAttributes) -> Result<StorageForm> {
        if dn.is_root() {
            return Err(DirectoryError::ObjectClassViolation {
                message: "the root DN cannot hold an entry".to_string(),
            });
        }
        if attributes.get(OBJECT_CLASS).map_or(true, <[String]>::is_empty) {
            return Err(DirectoryError::ObjectClassViolation {
                message: format!("entry {dn} has no objectClass"),
            });
        }

        let mut attrs_norm = NormalizedAttributes::new();
        let mut attrs_orig = OriginalAttributes::new();

        for (name, values) in attributes.iter() {
            if name.eq_ignore_ascii_case(MEMBER_OF) {
                continue;
            }
            if values.is_empty() {
                return Err(DirectoryError::InvalidAttributeSyntax {
                    attribute: name.to_string(),
                    message: "attribute has no values".to_string(),
                });
            }

            let mut folded: Vec<String> = Vec::with_capacity(values.len());
            for value in values {
                let norm = self.rules.normalize(name, value)?;
                if !folded.contains(&norm) {
                    folded.push(norm);
                }
            }

            attrs_norm.insert(&name.to_ascii_lowercase(), folded);
            attrs_orig.insert(name, values.to_vec());
        }

        Ok(StorageForm {
            dn_norm: dn.normalized().to_string(),
            dn_orig: dn.original().to_string(),
            path: dn.path().to_string(),
            attrs_norm,
            attrs_orig,
        })
    }

    /// Storage form of a new entry; missing RDN values are added first.
    pub fn add_entry_to_storage(&self, entry: &AddEntry) -> Result<StorageForm> {
        let mut attributes = entry.attributes().clone();

        if let Some(rdn) = entry.dn().rdn() {
            for ava in rdn.avas() {
                let wanted = self.rules.normalize(ava.attr_type(), ava.value())?;
                let present = attributes
                    .get(ava.attr_type())
                    .unwrap_or_default()
                    .iter()
                    .map(|value| self.rules.normalize(ava.attr_type(), value))
                    .collect::<Result<Vec<_>>>()?;
                if !present.contains(&wanted) {
                    attributes.push(ava.attr_type(), ava.value().to_string());
                }
            }
        }

        self.to_storage(entry.dn(), &attributes)
    }

    pub fn modify_entry_to_storage(&self, entry: &ModifyEntry) -> Result<StorageForm> {
        self.to_storage(entry.dn(), entry.attributes())
    }

    /// Stage a stored row for modification, carrying its surrogate id.
    pub fn to_modify_entry(&self, stored: StoredEntry) -> Result<ModifyEntry> {
        let dn = Dn::parse(&stored.dn_orig).map_err(|err| {
            DirectoryError::internal_with_source(
                format!("stored entry {} has a malformed DN", stored.id),
                err,
            )
        })?;
        Ok(ModifyEntry::new(dn, stored.attrs_orig).with_id(stored.id))
    }

    /// Map a stored row to the caller-facing entry.
    ///
    /// # Errors
    ///
    /// Returns `Internal` when the row lacks its display DN.
    pub fn from_storage(&self, stored: StoredEntry) -> Result<SearchEntry> {
        if stored.dn_orig.is_empty() {
            return Err(DirectoryError::internal(format!(
                "stored entry {} ({}) has no display DN",
                stored.id, stored.dn_norm
            )));
        }

        Ok(SearchEntry {
            id: stored.id,
            dn: stored.dn_orig,
            entry_uuid: stored.entry_uuid,
            create_timestamp: stored.created,
            modify_timestamp: stored.updated,
            attributes: stored.attrs_orig,
        })
    }

    /// Like [`EntryMapper::from_storage`], injecting a computed membership
    /// projection as `memberOf`. An empty projection adds no attribute.
    pub fn from_storage_with_member_of(
        &self,
        stored: StoredEntry,
        member_of: Vec<String>,
    ) -> Result<SearchEntry> {
        let mut entry = self.from_storage(stored)?;
        entry.attributes.remove(MEMBER_OF);
        if !member_of.is_empty() {
            entry.attributes.insert(MEMBER_OF, member_of);
        }
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn person_attrs() -> OriginalAttributes {
        [
            ("objectClass", strings(&["top", "inetOrgPerson"])),
            ("cn", strings(&["Alice"])),
            ("description", strings(&["Foo", "foo", "FOO  bar"])),
        ]
        .into_iter()
        .collect()
    }

    fn stored_from(form: StorageForm) -> StoredEntry {
        StoredEntry {
            id: 1,
            dn_norm: form.dn_norm,
            dn_orig: form.dn_orig,
            entry_uuid: Uuid::new_v4(),
            created: Utc::now(),
            updated: Utc::now(),
            attrs_orig: form.attrs_orig,
        }
    }

    #[test]
    fn test_round_trip_preserves_original_values() {
        let mapper = EntryMapper::default();
        let dn = Dn::parse("CN=Alice,DC=Example").unwrap();
        let attrs = person_attrs();

        let form = mapper.to_storage(&dn, &attrs).unwrap();
        assert_eq!(
            form.attrs_norm.get("description").unwrap(),
            &strings(&["foo", "foo bar"])[..]
        );

        let entry = mapper.from_storage(stored_from(form)).unwrap();
        assert_eq!(entry.dn, "CN=Alice,DC=Example");
        assert_eq!(entry.attributes, attrs);
    }

    #[test]
    fn test_storage_columns_follow_dn() {
        let mapper = EntryMapper::default();
        let dn = Dn::parse("cn=Alice,ou=People,dc=Example").unwrap();
        let form = mapper.to_storage(&dn, &person_attrs()).unwrap();
        assert_eq!(form.dn_norm, "cn=alice,ou=people,dc=example");
        assert_eq!(form.path, "dc=example/ou=people");
        assert!(form.attrs_norm.names().all(|n| n == n.to_ascii_lowercase()));
    }

    #[test]
    fn test_member_values_normalized_as_dns() {
        let mapper = EntryMapper::default();
        let dn = Dn::parse("cn=staff,dc=example").unwrap();
        let attrs: OriginalAttributes = [
            ("objectClass", strings(&["groupOfNames"])),
            ("member", strings(&["CN=Alice, DC=Example", "cn=alice,dc=example"])),
        ]
        .into_iter()
        .collect();
        let form = mapper.to_storage(&dn, &attrs).unwrap();
        assert_eq!(
            form.attrs_norm.get("member").unwrap(),
            &strings(&["cn=alice,dc=example"])[..]
        );
        assert_eq!(form.attrs_orig.get("member").unwrap().len(), 2);
    }

    #[test]
    fn test_missing_object_class_rejected() {
        let mapper = EntryMapper::default();
        let dn = Dn::parse("cn=a,dc=example").unwrap();
        let attrs: OriginalAttributes = [("cn", strings(&["a"]))].into_iter().collect();
        let err = mapper.to_storage(&dn, &attrs).unwrap_err();
        assert!(matches!(err, DirectoryError::ObjectClassViolation { .. }));
    }

    #[test]
    fn test_empty_values_rejected() {
        let mapper = EntryMapper::default();
        let dn = Dn::parse("cn=a,dc=example").unwrap();
        let mut attrs = person_attrs();
        attrs.insert("mail", Vec::new());
        let err = mapper.to_storage(&dn, &attrs).unwrap_err();
        assert!(matches!(err, DirectoryError::InvalidAttributeSyntax { .. }));
    }

    #[test]
    fn test_member_of_never_stored() {
        let mapper = EntryMapper::default();
        let dn = Dn::parse("cn=a,dc=example").unwrap();
        let mut attrs = person_attrs();
        attrs.insert("memberOf", strings(&["cn=g,dc=example"]));
        let form = mapper.to_storage(&dn, &attrs).unwrap();
        assert!(!form.attrs_norm.contains(MEMBER_OF));
        assert!(!form.attrs_orig.contains(MEMBER_OF));
    }

    #[test]
    fn test_add_entry_gains_rdn_value() {
        let mapper = EntryMapper::default();
        let dn = Dn::parse("uid=jdoe,dc=example").unwrap();
        let attrs: OriginalAttributes = [("objectClass", strings(&["account"]))]
            .into_iter()
            .collect();
        let form = mapper
            .add_entry_to_storage(&AddEntry::new(dn, attrs))
            .unwrap();
        assert_eq!(form.attrs_orig.get("uid").unwrap(), &strings(&["jdoe"])[..]);
    }

    #[test]
    fn test_add_entry_keeps_existing_rdn_value() {
        let mapper = EntryMapper::default();
        let dn = Dn::parse("cn=alice,dc=example").unwrap();
        let form = mapper
            .add_entry_to_storage(&AddEntry::new(dn, person_attrs()))
            .unwrap();
        assert_eq!(form.attrs_orig.get("cn").unwrap(), &strings(&["Alice"])[..]);
    }

    #[test]
    fn test_member_of_injection() {
        let mapper = EntryMapper::default();
        let dn = Dn::parse("cn=a,dc=example").unwrap();
        let form = mapper.to_storage(&dn, &person_attrs()).unwrap();

        let entry = mapper
            .from_storage_with_member_of(
                stored_from(form.clone()),
                strings(&["cn=g1,dc=example", "cn=g2,dc=example"]),
            )
            .unwrap();
        assert_eq!(entry.attributes.get("memberof").unwrap().len(), 2);

        let entry = mapper
            .from_storage_with_member_of(stored_from(form), Vec::new())
            .unwrap();
        assert!(!entry.attributes.contains(MEMBER_OF));
    }

    #[test]
    fn test_to_modify_entry_keeps_id() {
        let mapper = EntryMapper::default();
        let dn = Dn::parse("cn=a,dc=example").unwrap();
        let mut stored = stored_from(mapper.to_storage(&dn, &person_attrs()).unwrap());
        stored.id = 42;
        let staged = mapper.to_modify_entry(stored).unwrap();
        assert_eq!(staged.id(), Some(42));
        assert_eq!(staged.dn(), &dn);
    }

    #[test]
    fn test_row_without_display_dn_is_internal() {
        let mapper = EntryMapper::default();
        let dn = Dn::parse("cn=a,dc=example").unwrap();
        let mut stored = stored_from(mapper.to_storage(&dn, &person_attrs()).unwrap());
        stored.dn_orig.clear();
        assert!(!mapper.from_storage(stored).unwrap_err().is_classified());
    }
}
