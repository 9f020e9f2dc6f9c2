//! Username policy and the validated [`Username`] type.
//!
//! A `Username` can only be created through [`UsernamePolicy::parse`], so
//! any function that receives one knows two things without re-checking:
//! it matches the nick pattern, and it is a single plain path component.
//! The second check does not depend on the configurable pattern; a
//! permissive `nick_regex` can never open a path-traversal hole.

use std::borrow::Borrow;
use std::fmt;
use std::path::{Component, Path};

use regex::Regex;

use crate::UsernameError;

/// The nick pattern used when the configuration does not set one.
pub const DEFAULT_NICK_REGEX: &str = r"^[a-zA-Z0-9]{3,20}$";

/// A username that passed the username policy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Username(String);

impl Username {
    /// Returns the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the wrapper and returns the inner string.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for Username {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Username {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// Derived `Eq`, `Ord` and `Hash` all defer to the inner string, so maps
// keyed by `Username` can be queried with a plain `&str`.
impl Borrow<str> for Username {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Validates raw usernames against the nick pattern.
#[derive(Debug, Clone)]
pub struct UsernamePolicy {
    pattern: Regex,
}

impl UsernamePolicy {
    /// Builds a policy from a regular expression.
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
        })
    }

    /// Returns the pattern source.
    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    /// Checks a raw name and wraps it on success.
    ///
    /// The path guard runs before the pattern so that the error for a
    /// name like `../root` is always [`UsernameError::UnsafePath`].
    pub fn parse(&self, raw: &str) -> Result<Username, UsernameError> {
        if !is_path_safe(raw) {
            return Err(UsernameError::UnsafePath);
        }
        if !self.pattern.is_match(raw) {
            return Err(UsernameError::Pattern);
        }
        Ok(Username(raw.to_string()))
    }
}

impl Default for UsernamePolicy {
    fn default() -> Self {
        Self::new(DEFAULT_NICK_REGEX).expect("default nick regex compiles")
    }
}

/// Returns `true` if `name` is exactly one normal path component.
///
/// Rejects empty names, `.` and `..`, anything containing `/` or `\`,
/// and NUL bytes.
pub fn is_path_safe(name: &str) -> bool {
    if name.is_empty() || name.contains(['/', '\\', '\0']) || name.contains("..") {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(c)), None) if c == name
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_alphanumeric_name_succeeds() {
        let policy = UsernamePolicy::default();
        let name = policy.parse("Alice").expect("valid nick");
        assert_eq!(name.as_str(), "Alice");
        assert_eq!(name.to_string(), "Alice");
    }

    #[test]
    fn test_parse_length_bounds() {
        let policy = UsernamePolicy::default();
        assert_eq!(policy.parse("ab"), Err(UsernameError::Pattern));
        assert!(policy.parse("abc").is_ok());
        assert!(policy.parse(&"a".repeat(20)).is_ok());
        assert_eq!(policy.parse(&"a".repeat(21)), Err(UsernameError::Pattern));
    }

    #[test]
    fn test_parse_non_alphanumeric_rejected() {
        let policy = UsernamePolicy::default();
        assert_eq!(policy.parse("bad name"), Err(UsernameError::Pattern));
        assert_eq!(policy.parse("under_score"), Err(UsernameError::Pattern));
    }

    #[test]
    fn test_parse_traversal_rejected_even_with_permissive_pattern() {
        let policy = UsernamePolicy::new(r"^.*$").unwrap();
        for raw in ["..", "../etc", "a/b", "a\\b", ".", "", "x..y", "nul\0"] {
            assert_eq!(
                policy.parse(raw),
                Err(UsernameError::UnsafePath),
                "{raw:?} should be rejected"
            );
        }
        assert!(policy.parse("fine.name").is_ok());
    }

    #[test]
    fn test_is_path_safe_single_component_only() {
        assert!(is_path_safe("Alice"));
        assert!(!is_path_safe("/Alice"));
        assert!(!is_path_safe("Alice/"));
    }
}
