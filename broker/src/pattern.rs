//! Hostname pattern matching for the relay-URL policy (component A).
//!
//! A pattern is the suffix a hostname must end with; an optional leading
//! `^` means "exact match only". Comparisons are case-insensitive, as
//! hostnames are.

/// A validated hostname suffix pattern.
///
/// An empty pattern matches every hostname. A pattern beginning with `^`
/// requires exact equality with the remainder.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelayPattern {
    exact: bool,
    suffix: String,
}

impl RelayPattern {
    /// Parses and validates `raw`, lower-casing it for case-insensitive
    /// comparisons. Returns `None` if the non-`^` part is not a
    /// well-formed domain suffix.
    pub fn parse(raw: &str) -> Option<Self> {
        let (exact, rest) = match raw.strip_prefix('^') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };

        if rest.is_empty() {
            return Some(Self {
                exact,
                suffix: String::new(),
            });
        }

        if !is_well_formed_domain_suffix(rest) {
            return None;
        }

        Some(Self {
            exact,
            suffix: rest.to_ascii_lowercase(),
        })
    }

    /// `IsMember(host, pattern)`: does `host` satisfy this pattern?
    pub fn is_member(&self, host: &str) -> bool {
        if self.suffix.is_empty() {
            return true;
        }

        let host = host.to_ascii_lowercase();

        if self.exact {
            host == self.suffix
        } else {
            ends_with_label_boundary(&host, &self.suffix)
        }
    }

    /// `IsSupersetOf(self, other)`: does every hostname `other` accepts
    /// also satisfy `self`?
    ///
    /// `self` accepts at least as much as `other` when `other`'s suffix
    /// itself ends with `self`'s suffix (so `self` is equal to or broader
    /// than `other`), and `self` is not stricter than `other`: an exact
    /// pattern can only be a superset of another exact pattern with the
    /// identical suffix.
    pub fn is_superset_of(&self, other: &RelayPattern) -> bool {
        if self.suffix.is_empty() {
            return !self.exact || other.suffix.is_empty();
        }

        if !ends_with_label_boundary(&other.suffix, &self.suffix) {
            return false;
        }

        if self.exact {
            !other.exact || other.suffix == self.suffix
        } else {
            true
        }
    }

    pub fn as_str(&self) -> String {
        if self.exact {
            format!("^{}", self.suffix)
        } else {
            self.suffix.clone()
        }
    }
}

/// Suffix match where the match either consumes the whole string or is
/// preceded by a `.`, so `example.com` matches `www.example.com` but not
/// `notexample.com`.
fn ends_with_label_boundary(host: &str, suffix: &str) -> bool {
    if host == suffix {
        return true;
    }
    host.len() > suffix.len()
        && host.ends_with(suffix)
        && host.as_bytes()[host.len() - suffix.len() - 1] == b'.'
}

fn is_well_formed_domain_suffix(s: &str) -> bool {
    if s.starts_with('.') || s.ends_with('.') || s.contains("..") {
        return false;
    }

    s.split('.').all(|label| {
        !label.is_empty()
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
            && !label.starts_with('-')
            && !label.ends_with('-')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_pattern_matches_everything() {
        let p = RelayPattern::parse("").unwrap();
        assert!(p.is_member("anything.example.com"));
        assert!(p.is_member(""));
    }

    #[test]
    fn suffix_match_is_case_insensitive_and_label_bounded() {
        let p = RelayPattern::parse("Torproject.net").unwrap();
        assert!(p.is_member("snowflake.TORPROJECT.NET"));
        assert!(p.is_member("torproject.net"));
        assert!(!p.is_member("nottorproject.net"));
    }

    #[test]
    fn exact_pattern_requires_equality() {
        let p = RelayPattern::parse("^snowflake.torproject.net").unwrap();
        assert!(p.is_member("snowflake.torproject.net"));
        assert!(!p.is_member("sub.snowflake.torproject.net"));
    }

    #[test]
    fn invalid_patterns_are_rejected() {
        assert!(RelayPattern::parse("^.bad").is_none());
        assert!(RelayPattern::parse("bad..com").is_none());
        assert!(RelayPattern::parse("-bad.com").is_none());
    }

    #[test]
    fn superset_relation() {
        let broad = RelayPattern::parse("torproject.net").unwrap();
        let narrow = RelayPattern::parse("snowflake.torproject.net").unwrap();
        let exact = RelayPattern::parse("^snowflake.torproject.net").unwrap();

        assert!(broad.is_superset_of(&narrow));
        assert!(broad.is_superset_of(&exact));
        assert!(!narrow.is_superset_of(&broad));
        assert!(!exact.is_superset_of(&narrow));
        assert!(exact.is_superset_of(&exact));
    }

    #[test]
    fn empty_pattern_is_superset_of_everything() {
        let broad = RelayPattern::parse("").unwrap();
        let narrow = RelayPattern::parse("torproject.net").unwrap();
        assert!(broad.is_superset_of(&narrow));
    }
}
