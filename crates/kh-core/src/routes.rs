//! Route gating from positive and negative glob patterns.
//!
//! Patterns are compiled once at startup; a bad pattern is a configuration
//! error, not a per-request one. `**` crosses path separators, `*` does
//! not, and dotfile segments match like any other.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("invalid route pattern {pattern:?}: {reason}")]
    BadPattern { pattern: String, reason: String },
}

/// Allow/deny decision for request URL paths.
///
/// A path is allowed iff it begins with `/`, at least one positive pattern
/// matches (when any positive patterns are configured), and no negative
/// (`!`-prefixed) pattern matches.
#[derive(Debug)]
pub struct RouteGate {
    allow: Option<GlobSet>,
    deny: GlobSet,
}

impl RouteGate {
    pub fn new(patterns: &[String]) -> Result<Self, RouteError> {
        let mut allow = GlobSetBuilder::new();
        let mut deny = GlobSetBuilder::new();
        let mut have_allow = false;

        for pattern in patterns {
            let (negated, raw) = match pattern.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, pattern.as_str()),
            };
            let glob = GlobBuilder::new(raw)
                .literal_separator(true)
                .build()
                .map_err(|e| RouteError::BadPattern {
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                })?;
            if negated {
                deny.add(glob);
            } else {
                allow.add(glob);
                have_allow = true;
            }
        }

        let allow = if have_allow {
            Some(allow.build().map_err(|e| RouteError::BadPattern {
                pattern: String::new(),
                reason: e.to_string(),
            })?)
        } else {
            None
        };
        let deny = deny.build().map_err(|e| RouteError::BadPattern {
            pattern: String::new(),
            reason: e.to_string(),
        })?;

        Ok(Self { allow, deny })
    }

    pub fn allows(&self, path: &str) -> bool {
        if !path.starts_with('/') {
            return false;
        }
        if let Some(allow) = &self.allow {
            if !allow.is_match(path) {
                return false;
            }
        }
        !self.deny.is_match(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(patterns: &[&str]) -> RouteGate {
        let owned: Vec<String> = patterns.iter().map(|s| s.to_string()).collect();
        RouteGate::new(&owned).unwrap()
    }

    #[test]
    fn test_no_patterns_allows_all() {
        let g = gate(&[]);
        assert!(g.allows("/anything"));
        assert!(g.allows("/deep/nested/path"));
    }

    #[test]
    fn test_positive_pattern_required_when_present() {
        let g = gate(&["/v1/**"]);
        assert!(g.allows("/v1/x"));
        assert!(g.allows("/v1/a/b/c"));
        assert!(!g.allows("/v2/y"));
        assert!(!g.allows("/"));
    }

    #[test]
    fn test_negative_pattern_denies() {
        let g = gate(&["/v1/**", "!/v1/admin/**"]);
        assert!(g.allows("/v1/x"));
        assert!(!g.allows("/v1/admin/users"));
    }

    #[test]
    fn test_negative_only_patterns_allow_everything_else() {
        let g = gate(&["!/internal/**"]);
        assert!(g.allows("/public"));
        assert!(!g.allows("/internal/secret"));
    }

    #[test]
    fn test_path_must_be_absolute() {
        let g = gate(&[]);
        assert!(!g.allows("relative/path"));
        assert!(!g.allows(""));
        assert!(!g.allows("http://evil.example/"));
    }

    #[test]
    fn test_single_star_stays_in_segment() {
        let g = gate(&["/v1/*"]);
        assert!(g.allows("/v1/x"));
        assert!(!g.allows("/v1/x/y"));
    }

    #[test]
    fn test_dotfiles_match() {
        let g = gate(&["/v1/**"]);
        assert!(g.allows("/v1/.well-known"));
    }

    #[test]
    fn test_bad_pattern_is_a_config_error() {
        let err = RouteGate::new(&["/v1/[".to_string()]);
        assert!(matches!(err, Err(RouteError::BadPattern { .. })));
    }
}
