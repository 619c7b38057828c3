//! Distinguished Names
//!
//! Parses RFC 4514 string DNs into a hierarchy of RDNs and derives the two
//! forms the store works with:
//!
//! - the **normalized DN**, used for equality and uniqueness
//! - the **materialized path**, the normalized ancestry of an entry from the
//!   root down to its parent, used to scope one-level and subtree searches
//!   with plain equality and prefix predicates
//!
//! Normalization is deterministic and idempotent: parsing a normalized DN
//! yields the same normalized DN.
//!
//! # Example
//!
//! ```
//! use dirstore_core::Dn;
//!
//! let dn = Dn::parse("CN=Alice Smith, OU=People,DC=Example").unwrap();
//! assert_eq!(dn.normalized(), "cn=alice smith,ou=people,dc=example");
//! assert_eq!(dn.original(), "CN=Alice Smith,OU=People,DC=Example");
//! assert_eq!(dn.path(), "dc=example/ou=people");
//! ```

use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};
use std::iter::Peekable;
use std::str::{Chars, FromStr};

use crate::error::{DirectoryError, Result};

/// Separator between RDN segments of a materialized path.
pub const PATH_SEPARATOR: char = '/';

/// One `type=value` assertion inside an RDN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ava {
    attr_type: String,
    value: String,
    value_norm: String,
}

impl Ava {
    fn new(attr_type: String, value: String) -> Self {
        let value_norm = fold_whitespace(&value).to_lowercase();
        Self {
            attr_type,
            value,
            value_norm,
        }
    }

    /// Attribute type as written by the client.
    #[must_use]
    pub fn attr_type(&self) -> &str {
        &self.attr_type
    }

    /// Unescaped value as written by the client.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    fn original(&self) -> String {
        format!("{}={}", self.attr_type, escape_value(&self.value))
    }

    fn normalized(&self) -> String {
        format!(
            "{}={}",
            self.attr_type.to_ascii_lowercase(),
            escape_value(&self.value_norm)
        )
    }
}

/// Relative distinguished name: one or more AVAs joined by `+`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rdn {
    avas: Vec<Ava>,
}

impl Rdn {
    #[must_use]
    pub fn avas(&self) -> &[Ava] {
        &self.avas
    }

    fn original(&self) -> String {
        self.avas
            .iter()
            .map(Ava::original)
            .collect::<Vec<_>>()
            .join("+")
    }

    /// AVAs are sorted so `cn=a+uid=b` and `uid=b+cn=a` compare equal.
    fn normalized(&self) -> String {
        let mut parts: Vec<String> = self.avas.iter().map(Ava::normalized).collect();
        parts.sort();
        parts.dedup();
        parts.join("+")
    }

    fn path_segment(&self) -> String {
        self.normalized().replace(PATH_SEPARATOR, "\\2f")
    }
}

/// A parsed distinguished name.
///
/// Equality and hashing use the normalized form only.
#[derive(Debug, Clone)]
pub struct Dn {
    /// Leaf first, root last.
    rdns: Vec<Rdn>,
    original: String,
    normalized: String,
    path: String,
}

impl Dn {
    /// Parse a string DN.
    ///
    /// # Errors
    ///
    /// Returns `DirectoryError::InvalidDn` when the input is not a valid
    /// RFC 4514 string.
    pub fn parse(input: &str) -> Result<Self> {
        Ok(Self::from_rdns(parse_rdns(input)?))
    }

    /// The zero-length DN naming the root of the tree.
    #[must_use]
    pub fn root() -> Self {
        Self::from_rdns(Vec::new())
    }

    fn from_rdns(rdns: Vec<Rdn>) -> Self {
        let join = |f: fn(&Rdn) -> String, rdns: &[Rdn]| {
            rdns.iter().map(f).collect::<Vec<_>>().join(",")
        };
        let original = join(Rdn::original, &rdns);
        let normalized = join(Rdn::normalized, &rdns);
        let path = rdns
            .iter()
            .skip(1)
            .rev()
            .map(Rdn::path_segment)
            .collect::<Vec<_>>()
            .join(&PATH_SEPARATOR.to_string());
        Self {
            rdns,
            original,
            normalized,
            path,
        }
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.rdns.is_empty()
    }

    /// Number of RDNs.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.rdns.len()
    }

    /// The leftmost RDN, `None` for the root.
    #[must_use]
    pub fn rdn(&self) -> Option<&Rdn> {
        self.rdns.first()
    }

    /// Comparison form.
    #[must_use]
    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    /// Display form, preserving the client's casing.
    #[must_use]
    pub fn original(&self) -> &str {
        &self.original
    }

    /// Materialized ancestry path of this entry (root first, parent last).
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The path carried by this entry's immediate children.
    #[must_use]
    pub fn child_path(&self) -> String {
        match self.rdns.first() {
            None => String::new(),
            Some(rdn) if self.path.is_empty() => rdn.path_segment(),
            Some(rdn) => format!("{}{}{}", self.path, PATH_SEPARATOR, rdn.path_segment()),
        }
    }

    /// The parent DN; the root has none.
    #[must_use]
    pub fn parent(&self) -> Option<Dn> {
        if self.is_root() {
            None
        } else {
            Some(Self::from_rdns(self.rdns[1..].to_vec()))
        }
    }

    /// Every proper ancestor except the root, nearest first.
    #[must_use]
    pub fn ancestors(&self) -> Vec<Dn> {
        (1..self.rdns.len())
            .map(|i| Self::from_rdns(self.rdns[i..].to_vec()))
            .collect()
    }

    /// Whether `self` lies strictly below `other`.
    #[must_use]
    pub fn is_descendant_of(&self, other: &Dn) -> bool {
        if self.rdns.len() <= other.rdns.len() {
            return false;
        }
        let offset = self.rdns.len() - other.rdns.len();
        self.rdns[offset..]
            .iter()
            .zip(&other.rdns)
            .all(|(a, b)| a.normalized() == b.normalized())
    }

    /// Build the DN produced by a modify-DN request.
    ///
    /// `new_rdn` must hold exactly one RDN. Without `new_superior` the entry
    /// keeps its current parent.
    ///
    /// # Errors
    ///
    /// Returns `DirectoryError::InvalidDn` if `new_rdn` is not a single RDN
    /// or `self` is the root.
    pub fn renamed(&self, new_rdn: &Dn, new_superior: Option<&Dn>) -> Result<Dn> {
        if new_rdn.depth() != 1 {
            return Err(invalid(format!(
                "new RDN must contain exactly one RDN: {}",
                new_rdn.original
            )));
        }
        let parent = match new_superior {
            Some(superior) => superior.clone(),
            None => self
                .parent()
                .ok_or_else(|| invalid("the root DN cannot be renamed"))?,
        };
        let mut rdns = new_rdn.rdns.clone();
        rdns.extend(parent.rdns);
        Ok(Self::from_rdns(rdns))
    }
}

impl PartialEq for Dn {
    fn eq(&self, other: &Self) -> bool {
        self.normalized == other.normalized
    }
}

impl Eq for Dn {}

impl Hash for Dn {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized.hash(state);
    }
}

impl Display for Dn {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.original)
    }
}

impl FromStr for Dn {
    type Err = DirectoryError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Trim and collapse internal whitespace runs to a single space.
pub(crate) fn fold_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Escape special characters in DN attribute values per RFC 4514.
///
/// - Leading or trailing SPACE (escaped as \20)
/// - Leading # (escaped as \23)
/// - Characters: , + " \ < > ; = (escaped with backslash prefix)
/// - NUL character (escaped as \00)
#[must_use]
pub fn escape_value(value: &str) -> String {
    let count = value.chars().count();
    let mut result = String::with_capacity(value.len() * 2);

    for (i, ch) in value.chars().enumerate() {
        let is_first = i == 0;
        let is_last = i + 1 == count;

        match ch {
            ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=' => {
                result.push('\\');
                result.push(ch);
            }
            '\0' => result.push_str("\\00"),
            ' ' if is_first || is_last => result.push_str("\\20"),
            '#' if is_first => result.push_str("\\23"),
            _ => result.push(ch),
        }
    }

    result
}

fn invalid(message: impl Into<String>) -> DirectoryError {
    DirectoryError::InvalidDn {
        message: message.into(),
    }
}

fn parse_rdns(input: &str) -> Result<Vec<Rdn>> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let mut chars = trimmed.chars().peekable();
    let mut rdns = Vec::new();
    let mut avas = Vec::new();

    loop {
        let attr_type = read_attr_type(&mut chars)?;
        let (value, terminator) = read_value(&mut chars)?;
        avas.push(Ava::new(attr_type, value));

        match terminator {
            Some('+') => {}
            Some(_) => rdns.push(Rdn {
                avas: std::mem::take(&mut avas),
            }),
            None => {
                rdns.push(Rdn { avas });
                return Ok(rdns);
            }
        }
    }
}

fn read_attr_type(chars: &mut Peekable<Chars<'_>>) -> Result<String> {
    let mut raw = String::new();
    loop {
        match chars.next() {
            Some('=') => break,
            Some(',' | '+' | ';') | None => {
                return Err(invalid(format!("missing '=' after attribute type '{raw}'")));
            }
            Some(c) => raw.push(c),
        }
    }

    let attr_type = raw.trim();
    let is_descr = attr_type
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic())
        && attr_type
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-');
    let is_oid = !attr_type.is_empty()
        && attr_type.split('.').all(|part| {
            !part.is_empty() && part.chars().all(|c| c.is_ascii_digit())
        });

    if !is_descr && !is_oid {
        return Err(invalid(format!("invalid attribute type '{attr_type}'")));
    }
    Ok(attr_type.to_string())
}

fn read_value(chars: &mut Peekable<Chars<'_>>) -> Result<(String, Option<char>)> {
    while chars.peek() == Some(&' ') {
        chars.next();
    }

    let mut bytes: Vec<u8> = Vec::new();
    // Trailing-space trimming must not eat escaped characters.
    let mut keep = 0;
    let mut terminator = None;
    let mut buf = [0u8; 4];

    while let Some(c) = chars.next() {
        match c {
            ',' | '+' | ';' => {
                terminator = Some(c);
                break;
            }
            '\\' => {
                let next = chars
                    .next()
                    .ok_or_else(|| invalid("DN ends with a dangling escape"))?;
                if let Some(high) = next.to_digit(16) {
                    let low = chars
                        .next()
                        .and_then(|c| c.to_digit(16))
                        .ok_or_else(|| invalid("invalid hex escape in attribute value"))?;
                    bytes.push((high * 16 + low) as u8);
                } else if matches!(
                    next,
                    ' ' | '"' | '#' | '+' | ',' | ';' | '<' | '=' | '>' | '\\'
                ) {
                    bytes.extend_from_slice(next.encode_utf8(&mut buf).as_bytes());
                } else {
                    return Err(invalid(format!("invalid escape sequence '\\{next}'")));
                }
                keep = bytes.len();
            }
            '"' | '<' | '>' | '\0' => {
                return Err(invalid(format!("unescaped '{}' in attribute value", c.escape_default())));
            }
            _ => bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes()),
        }
    }

    while bytes.len() > keep && bytes.last() == Some(&b' ') {
        bytes.pop();
    }

    let value =
        String::from_utf8(bytes).map_err(|_| invalid("attribute value is not valid UTF-8"))?;
    if value.is_empty() {
        return Err(invalid("empty attribute value"));
    }
    Ok((value, terminator))
}
