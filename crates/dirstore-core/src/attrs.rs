//! Attribute containers.
//!
//! An entry's attributes are held twice: once in the client's original form
//! (for output) and once normalized (for matching). Both are ordered
//! multimaps from attribute name to a list of string values, serialized as a
//! JSON object of string arrays. Attribute names are matched
//! case-insensitively.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Macro to define an attribute map variant.
macro_rules! define_attribute_map {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(BTreeMap<String, Vec<String>>);

        impl $name {
            /// Creates an empty map.
            #[must_use]
            pub fn new() -> Self {
                Self(BTreeMap::new())
            }

            /// Number of attributes.
            #[must_use]
            pub fn len(&self) -> usize {
                self.0.len()
            }

            #[must_use]
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }

            fn key_of(&self, name: &str) -> Option<String> {
                self.0
                    .keys()
                    .find(|key| key.eq_ignore_ascii_case(name))
                    .cloned()
            }

            /// Values of `name`, matched case-insensitively.
            #[must_use]
            pub fn get(&self, name: &str) -> Option<&[String]> {
                self.0
                    .iter()
                    .find(|(key, _)| key.eq_ignore_ascii_case(name))
                    .map(|(_, values)| values.as_slice())
            }

            #[must_use]
            pub fn contains(&self, name: &str) -> bool {
                self.get(name).is_some()
            }

            /// Replace the values of `name`, keeping the existing key spelling.
            pub fn insert(&mut self, name: &str, values: Vec<String>) -> Option<Vec<String>> {
                let key = self.key_of(name).unwrap_or_else(|| name.to_string());
                self.0.insert(key, values)
            }

            /// Append one value to `name`, creating the attribute if needed.
            pub fn push(&mut self, name: &str, value: String) {
                let key = self.key_of(name).unwrap_or_else(|| name.to_string());
                self.0.entry(key).or_default().push(value);
            }

            pub fn values_mut(&mut self, name: &str) -> Option<&mut Vec<String>> {
                let key = self.key_of(name)?;
                self.0.get_mut(&key)
            }

            pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
                let key = self.key_of(name)?;
                self.0.remove(&key)
            }

            /// Attributes in key order.
            pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
                self.0
                    .iter()
                    .map(|(key, values)| (key.as_str(), values.as_slice()))
            }

            pub fn names(&self) -> impl Iterator<Item = &str> {
                self.0.keys().map(String::as_str)
            }
        }

        impl<K: Into<String>> FromIterator<(K, Vec<String>)> for $name {
            fn from_iter<I: IntoIterator<Item = (K, Vec<String>)>>(iter: I) -> Self {
                let mut map = Self::new();
                for (name, values) in iter {
                    let name = name.into();
                    for value in values {
                        map.push(&name, value);
                    }
                }
                map
            }
        }
    };
}

define_attribute_map!(
    /// Attribute values exactly as the client supplied them.
    ///
    /// Keys keep the spelling of the first occurrence; values keep their
    /// casing and order. This is the only form surfaced to callers.
    ///
    /// # Example
    ///
    /// ```
    /// use dirstore_core::OriginalAttributes;
    ///
    /// let attrs: OriginalAttributes = [
    ///     ("objectClass", vec!["person".to_string()]),
    ///     ("cn", vec!["Alice".to_string()]),
    /// ]
    /// .into_iter()
    /// .collect();
    ///
    /// assert_eq!(attrs.get("CN"), Some(&["Alice".to_string()][..]));
    /// ```
    OriginalAttributes
);

define_attribute_map!(
    /// Attribute values folded by their matching rule.
    ///
    /// Keys are lowercase and each value list is duplicate-free. Used only
    /// for equality and containment predicates in the store (including the
    /// `member` array), never returned to callers.
    NormalizedAttributes
);
