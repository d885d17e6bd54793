/// Builds namespaced keys of the form `{prefix}:{domain}:{...parts}`.
///
/// Monitoring tooling pattern-scans by domain, so the layout must stay stable.
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    prefix: String,
}

impl KeyBuilder {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn key(&self, domain: &str, parts: &[&str]) -> String {
        let mut key = format!("{}:{}", self.prefix, domain);
        for part in parts {
            key.push(':');
            key.push_str(part);
        }
        key
    }

    /// Glob pattern covering `pattern` inside `domain`.
    pub fn pattern(&self, domain: &str, pattern: &str) -> String {
        format!("{}:{}:{}", self.prefix, domain, pattern)
    }

    /// The part of `key` after `{prefix}:{domain}:`, if it belongs to the domain.
    pub fn strip<'a>(&self, domain: &str, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.prefix.as_str())?
            .strip_prefix(':')?
            .strip_prefix(domain)?
            .strip_prefix(':')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = KeyBuilder::new("cms");
        assert_eq!(
            keys.key("downloads:daily", &["release-42", "2024-03-01"]),
            "cms:downloads:daily:release-42:2024-03-01"
        );
        assert_eq!(keys.key("workers", &[]), "cms:workers");
    }

    #[test]
    fn test_pattern_and_strip() {
        let keys = KeyBuilder::new("cms");
        assert_eq!(keys.pattern("stats:functions", "*"), "cms:stats:functions:*");
        assert_eq!(
            keys.strip("downloads:daily", "cms:downloads:daily:abc:2024-01-01"),
            Some("abc:2024-01-01")
        );
        assert_eq!(keys.strip("downloads:daily", "cms:downloads:total:abc"), None);
        assert_eq!(keys.strip("downloads", "other:downloads:abc"), None);
    }
}
