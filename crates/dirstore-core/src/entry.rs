//! Staged entries.
//!
//! A staged entry describes a pending add, modify or modify-DN operation. It
//! lives only for the duration of that operation and is never persisted
//! as-is; the [`EntryMapper`](crate::EntryMapper) turns it into the stored
//! representation.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::attrs::OriginalAttributes;
use crate::dn::Dn;
use crate::error::Result;
use crate::rules::MatchingRules;

/// An entry about to be created.
#[derive(Debug, Clone)]
pub struct AddEntry {
    dn: Dn,
    attributes: OriginalAttributes,
}

impl AddEntry {
    #[must_use]
    pub fn new(dn: Dn, attributes: OriginalAttributes) -> Self {
        Self { dn, attributes }
    }

    #[must_use]
    pub fn dn(&self) -> &Dn {
        &self.dn
    }

    #[must_use]
    pub fn attributes(&self) -> &OriginalAttributes {
        &self.attributes
    }
}

/// Kind of change in a modify request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyOp {
    Add,
    Delete,
    Replace,
}

/// One change of a modify request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Modification {
    pub op: ModifyOp,
    pub attribute: String,
    pub values: Vec<String>,
}

impl Modification {
    pub fn new(op: ModifyOp, attribute: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            op,
            attribute: attribute.into(),
            values,
        }
    }
}

/// An existing entry being changed in place.
///
/// Obtained from a locked lookup, which records the surrogate id of the row
/// so the update can target it directly.
#[derive(Debug, Clone)]
pub struct ModifyEntry {
    dn: Dn,
    id: Option<i64>,
    attributes: OriginalAttributes,
}

impl ModifyEntry {
    #[must_use]
    pub fn new(dn: Dn, attributes: OriginalAttributes) -> Self {
        Self {
            dn,
            id: None,
            attributes,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }

    /// Surrogate id of the row, unset until resolved by a locked lookup.
    #[must_use]
    pub fn id(&self) -> Option<i64> {
        self.id
    }

    #[must_use]
    pub fn dn(&self) -> &Dn {
        &self.dn
    }

    #[must_use]
    pub fn attributes(&self) -> &OriginalAttributes {
        &self.attributes
    }

    /// Apply one change.
    ///
    /// Values are compared by their normalized form: adding a value that is
    /// already present is a no-op, as is deleting one that is absent.
    /// Deleting with an empty value list removes the attribute. An attribute
    /// left without values is removed.
    ///
    /// # Errors
    ///
    /// Fails when a value cannot be normalized under its matching rule.
    pub fn apply(&mut self, rules: &MatchingRules, change: &Modification) -> Result<()> {
        match change.op {
            ModifyOp::Add => self.add_values(rules, &change.attribute, &change.values),
            ModifyOp::Delete => self.delete_values(rules, &change.attribute, &change.values),
            ModifyOp::Replace => {
                if change.values.is_empty() {
                    self.attributes.remove(&change.attribute);
                } else {
                    self.attributes
                        .insert(&change.attribute, change.values.clone());
                }
                Ok(())
            }
        }
    }

    pub fn add_values(
        &mut self,
        rules: &MatchingRules,
        attribute: &str,
        values: &[String],
    ) -> Result<()> {
        let mut present = self.normalized_values(rules, attribute)?;
        for value in values {
            let norm = rules.normalize(attribute, value)?;
            if !present.contains(&norm) {
                self.attributes.push(attribute, value.clone());
                present.push(norm);
            }
        }
        Ok(())
    }

    pub fn delete_values(
        &mut self,
        rules: &MatchingRules,
        attribute: &str,
        values: &[String],
    ) -> Result<()> {
        if values.is_empty() {
            self.attributes.remove(attribute);
            return Ok(());
        }

        let doomed = values
            .iter()
            .map(|value| rules.normalize(attribute, value))
            .collect::<Result<Vec<_>>>()?;

        let Some(current) = self.attributes.get(attribute) else {
            return Ok(());
        };
        let mut kept = Vec::with_capacity(current.len());
        for value in current {
            if !doomed.contains(&rules.normalize(attribute, value)?) {
                kept.push(value.clone());
            }
        }

        if kept.is_empty() {
            self.attributes.remove(attribute);
        } else {
            self.attributes.insert(attribute, kept);
        }
        Ok(())
    }

    /// Move the entry to `new_dn`, keeping the RDN attribute values in step.
    ///
    /// The new RDN values are added to the entry. When `delete_old_rdn` is
    /// set, the old RDN values that are not part of the new RDN are removed.
    pub fn modify_dn(
        &mut self,
        rules: &MatchingRules,
        new_dn: Dn,
        delete_old_rdn: bool,
    ) -> Result<()> {
        if delete_old_rdn {
            if let Some(old_rdn) = self.dn.rdn().cloned() {
                for ava in old_rdn.avas() {
                    self.delete_values(rules, ava.attr_type(), &[ava.value().to_string()])?;
                }
            }
        }
        if let Some(new_rdn) = new_dn.rdn().cloned() {
            for ava in new_rdn.avas() {
                self.add_values(rules, ava.attr_type(), &[ava.value().to_string()])?;
            }
        }
        self.dn = new_dn;
        Ok(())
    }

    fn normalized_values(&self, rules: &MatchingRules, attribute: &str) -> Result<Vec<String>> {
        self.attributes
            .get(attribute)
            .unwrap_or_default()
            .iter()
            .map(|value| rules.normalize(attribute, value))
            .collect()
    }
}

/// An entry as returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchEntry {
    #[serde(skip)]
    pub id: i64,
    pub dn: String,
    pub entry_uuid: Uuid,
    pub create_timestamp: DateTime<Utc>,
    pub modify_timestamp: DateTime<Utc>,
    pub attributes: OriginalAttributes,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn group() -> ModifyEntry {
        let attrs: OriginalAttributes = [
            ("objectClass", strings(&["groupOfNames"])),
            ("cn", strings(&["Admins"])),
            ("member", strings(&["CN=Alice,DC=Example", "cn=bob,dc=example"])),
        ]
        .into_iter()
        .collect();
        ModifyEntry::new(Dn::parse("cn=Admins,dc=example").unwrap(), attrs).with_id(7)
    }

    #[test]
    fn test_delete_matches_normalized_value() {
        let rules = MatchingRules::new();
        let mut entry = group();
        entry
            .delete_values(&rules, "member", &strings(&["cn=alice, dc=example"]))
            .unwrap();
        assert_eq!(
            entry.attributes().get("member").unwrap(),
            &strings(&["cn=bob,dc=example"])[..]
        );
    }

    #[test]
    fn test_delete_last_value_removes_attribute() {
        let rules = MatchingRules::new();
        let mut entry = group();
        entry
            .apply(
                &rules,
                &Modification::new(
                    ModifyOp::Delete,
                    "member",
                    strings(&["cn=alice,dc=example", "cn=bob,dc=example"]),
                ),
            )
            .unwrap();
        assert!(!entry.attributes().contains("member"));
    }

    #[test]
    fn test_add_skips_existing_value() {
        let rules = MatchingRules::new();
        let mut entry = group();
        entry
            .add_values(&rules, "member", &strings(&["cn=ALICE,dc=example", "cn=carol,dc=example"]))
            .unwrap();
        assert_eq!(entry.attributes().get("member").unwrap().len(), 3);
    }

    #[test]
    fn test_replace_and_delete_all() {
        let rules = MatchingRules::new();
        let mut entry = group();
        entry
            .apply(&rules, &Modification::new(ModifyOp::Replace, "description", strings(&["x"])))
            .unwrap();
        assert!(entry.attributes().contains("description"));
        entry
            .apply(&rules, &Modification::new(ModifyOp::Delete, "description", vec![]))
            .unwrap();
        assert!(!entry.attributes().contains("description"));
    }

    #[test]
    fn test_modify_dn_swaps_rdn_values() {
        let rules = MatchingRules::new();
        let mut entry = group();
        let new_dn = Dn::parse("cn=Operators,dc=example").unwrap();
        entry.modify_dn(&rules, new_dn, true).unwrap();
        assert_eq!(entry.dn().normalized(), "cn=operators,dc=example");
        assert_eq!(entry.attributes().get("cn").unwrap(), &strings(&["Operators"])[..]);
        assert_eq!(entry.id(), Some(7));
    }

    #[test]
    fn test_modify_dn_can_keep_old_rdn() {
        let rules = MatchingRules::new();
        let mut entry = group();
        let new_dn = Dn::parse("cn=Operators,dc=example").unwrap();
        entry.modify_dn(&rules, new_dn, false).unwrap();
        assert_eq!(
            entry.attributes().get("cn").unwrap(),
            &strings(&["Admins", "Operators"])[..]
        );
    }

    #[test]
    fn test_invalid_member_value_rejected() {
        let rules = MatchingRules::new();
        let mut entry = group();
        assert!(entry.add_values(&rules, "member", &strings(&["bogus"])).is_err());
    }
}
