//! Matching rules used to derive normalized attribute values.
//!
//! Full attribute-syntax validation belongs to the schema layer. This module
//! only decides how a value is folded for equality and containment matching.

use std::collections::HashMap;

use crate::dn::{fold_whitespace, Dn};
use crate::error::{DirectoryError, Result};

/// How values of one attribute are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchingRule {
    /// Whitespace-folded, case-insensitive.
    #[default]
    CaseIgnore,
    /// Whitespace-folded, case-sensitive.
    CaseExact,
    /// Value is a DN, compared by its normalized form.
    DistinguishedName,
    /// Byte-exact.
    OctetString,
}

impl MatchingRule {
    /// Normalize one value of `attribute`.
    ///
    /// # Errors
    ///
    /// Returns `DirectoryError::InvalidAttributeSyntax` when a DN-valued
    /// attribute holds something that is not a DN.
    pub fn normalize(self, attribute: &str, value: &str) -> Result<String> {
        match self {
            Self::CaseIgnore => Ok(fold_whitespace(value).to_lowercase()),
            Self::CaseExact => Ok(fold_whitespace(value)),
            Self::OctetString => Ok(value.to_string()),
            Self::DistinguishedName => Dn::parse(value)
                .map(|dn| dn.normalized().to_string())
                .map_err(|err| DirectoryError::InvalidAttributeSyntax {
                    attribute: attribute.to_string(),
                    message: err.to_string(),
                }),
        }
    }
}

const DN_ATTRIBUTES: &[&str] = &[
    "member",
    "uniquemember",
    "owner",
    "seealso",
    "manager",
    "secretary",
    "roleoccupant",
    "creatorsname",
    "modifiersname",
];

const OCTET_ATTRIBUTES: &[&str] = &["userpassword"];

/// Per-attribute matching rules, keyed by lowercase attribute name.
#[derive(Debug, Clone)]
pub struct MatchingRules {
    rules: HashMap<String, MatchingRule>,
}

impl Default for MatchingRules {
    fn default() -> Self {
        let rules = DN_ATTRIBUTES
            .iter()
            .map(|name| (name.to_string(), MatchingRule::DistinguishedName))
            .chain(
                OCTET_ATTRIBUTES
                    .iter()
                    .map(|name| (name.to_string(), MatchingRule::OctetString)),
            )
            .collect();
        Self { rules }
    }
}

impl MatchingRules {
    /// Built-in rules.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the rule for one attribute.
    #[must_use]
    pub fn with_rule(mut self, attribute: &str, rule: MatchingRule) -> Self {
        self.rules.insert(attribute.to_ascii_lowercase(), rule);
        self
    }

    /// Rule for `attribute`, `CaseIgnore` when none is registered.
    #[must_use]
    pub fn rule_for(&self, attribute: &str) -> MatchingRule {
        self.rules
            .get(&attribute.to_ascii_lowercase())
            .copied()
            .unwrap_or_default()
    }

    /// Normalize one value of `attribute`.
    ///
    /// # Errors
    ///
    /// See [`MatchingRule::normalize`].
    pub fn normalize(&self, attribute: &str, value: &str) -> Result<String> {
        self.rule_for(attribute).normalize(attribute, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_ignore_is_default() {
        let rules = MatchingRules::new();
        assert_eq!(rules.rule_for("cn"), MatchingRule::CaseIgnore);
        assert_eq!(rules.normalize("cn", "  Alice   SMITH ").unwrap(), "alice smith");
    }

    #[test]
    fn test_member_is_dn_valued() {
        let rules = MatchingRules::new();
        assert_eq!(rules.rule_for("Member"), MatchingRule::DistinguishedName);
        assert_eq!(
            rules.normalize("member", "CN=Alice, DC=Example").unwrap(),
            "cn=alice,dc=example"
        );
    }

    #[test]
    fn test_invalid_dn_value_is_syntax_error() {
        let err = MatchingRules::new().normalize("member", "not a dn").unwrap_err();
        match err {
            DirectoryError::InvalidAttributeSyntax { attribute, .. } => {
                assert_eq!(attribute, "member");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_password_is_byte_exact() {
        let rules = MatchingRules::new();
        assert_eq!(rules.normalize("userPassword", " S3cret ").unwrap(), " S3cret ");
    }

    #[test]
    fn test_override_rule() {
        let rules = MatchingRules::new().with_rule("employeeNumber", MatchingRule::CaseExact);
        assert_eq!(rules.normalize("employeenumber", " AB  12 ").unwrap(), "AB 12");
    }
}
