//! Destination host allow-list.
//!
//! Checks the host of every outbound URL against the configured patterns
//! before the relay performs the call.

use url::Url;

/// A parsed allow-list pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPattern {
    /// `api.example.com`
    Exact(String),
    /// `*.example.com`, stored as `example.com`
    Wildcard(String),
}

impl HostPattern {
    /// Parse a pattern string. Blank input yields `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        let pattern = raw.trim().to_ascii_lowercase();
        if pattern.is_empty() {
            return None;
        }
        match pattern.strip_prefix("*.") {
            Some("") => None,
            Some(suffix) => Some(HostPattern::Wildcard(suffix.to_string())),
            None => Some(HostPattern::Exact(pattern)),
        }
    }

    /// A wildcard is a plain suffix test: `*.example.com` admits
    /// `api.example.com`, `example.com` and `notexample.com`. With `strict`
    /// set it only admits hostnames ending in `.example.com`.
    pub fn matches(&self, hostname: &str, strict: bool) -> bool {
        match self {
            HostPattern::Exact(host) => hostname.eq_ignore_ascii_case(host),
            HostPattern::Wildcard(suffix) => {
                let hostname = hostname.to_ascii_lowercase();
                let Some(rest) = hostname.strip_suffix(suffix.as_str()) else {
                    return false;
                };
                !strict || (rest.ends_with('.') && rest.len() > 1)
            }
        }
    }
}

/// Allow-list configuration for the relay
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    /// Permitted patterns (empty = allow all)
    pub patterns: Vec<HostPattern>,
    /// Wildcards match on a dot boundary only
    pub strict_wildcards: bool,
}

impl AllowList {
    /// Create an allow-list from string patterns
    pub fn from_strings(patterns: &[String]) -> Self {
        Self {
            patterns: patterns.iter().filter_map(|s| HostPattern::parse(s)).collect(),
            strict_wildcards: false,
        }
    }

    pub fn with_strict_wildcards(mut self, strict: bool) -> Self {
        self.strict_wildcards = strict;
        self
    }

    /// Check if a hostname may be contacted
    pub fn is_allowed(&self, hostname: &str) -> bool {
        if self.patterns.is_empty() {
            return true;
        }
        self.patterns
            .iter()
            .any(|p| p.matches(hostname, self.strict_wildcards))
    }

    /// Check the host of a full URL. An empty list admits anything, even a
    /// URL that does not parse; otherwise a URL without a host is refused.
    pub fn is_url_allowed(&self, url: &str) -> bool {
        if self.patterns.is_empty() {
            return true;
        }
        match extract_host(url) {
            Some(host) => self.is_allowed(&host),
            None => false,
        }
    }

    /// Returns true if this list has no rules (allows everything)
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Hostname of `url`, without port or IPv6 brackets.
pub fn extract_host(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    match parsed.host()? {
        url::Host::Domain(d) => Some(d.to_string()),
        url::Host::Ipv4(ip) => Some(ip.to_string()),
        url::Host::Ipv6(ip) => Some(ip.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(patterns: &[&str]) -> AllowList {
        AllowList::from_strings(&patterns.iter().map(|s| s.to_string()).collect::<Vec<_>>())
    }

    #[test]
    fn test_pattern_parse() {
        assert_eq!(HostPattern::parse(" API.Example.com "), Some(HostPattern::Exact("api.example.com".into())));
        assert_eq!(HostPattern::parse("*.example.com"), Some(HostPattern::Wildcard("example.com".into())));
        assert_eq!(HostPattern::parse("  "), None);
        assert_eq!(HostPattern::parse("*."), None);
    }

    #[test]
    fn test_empty_list_allows_all() {
        let allow = list(&[]);
        assert!(allow.is_empty());
        assert!(allow.is_allowed("anything.example"));
        assert!(allow.is_url_allowed("https://evil.example/x"));
        assert!(allow.is_url_allowed("not a url"));
        assert!(allow.is_url_allowed("mailto:someone@example.com"));
    }

    #[test]
    fn test_exact_match() {
        let allow = list(&["httpbin.org"]);
        assert!(allow.is_allowed("httpbin.org"));
        assert!(allow.is_allowed("HTTPBIN.org"));
        assert!(!allow.is_allowed("api.httpbin.org"));
        assert!(!allow.is_allowed("evil.example"));
    }

    #[test]
    fn test_wildcard_suffix() {
        let allow = list(&["*.example.com"]);
        assert!(allow.is_allowed("api.example.com"));
        assert!(allow.is_allowed("A.B.Example.com"));
        // Plain ends-with: the apex and shared trailing text both pass.
        assert!(allow.is_allowed("example.com"));
        assert!(allow.is_allowed("notexample.com"));
        assert!(!allow.is_allowed("example.com.evil.net"));
        assert!(!allow.is_allowed("example.org"));
    }

    #[test]
    fn test_strict_wildcard_subdomains_only() {
        let allow = list(&["*.example.com"]).with_strict_wildcards(true);
        assert!(allow.is_allowed("api.example.com"));
        assert!(allow.is_allowed("a.b.example.com"));
        assert!(!allow.is_allowed("example.com"));
        assert!(!allow.is_allowed("notexample.com"));
        assert!(!allow.is_allowed(".example.com"));
        assert!(!allow.is_allowed("example.com.evil.net"));
    }

    #[test]
    fn test_strict_apex_and_wildcard_together() {
        let allow = list(&["example.com", "*.example.com"]).with_strict_wildcards(true);
        assert!(allow.is_allowed("example.com"));
        assert!(allow.is_allowed("api.example.com"));
        assert!(!allow.is_allowed("notexample.com"));
    }

    #[test]
    fn test_url_hosts() {
        let allow = list(&["httpbin.org", "127.0.0.1"]);
        assert!(allow.is_url_allowed("https://httpbin.org/get"));
        assert!(allow.is_url_allowed("http://httpbin.org:8080/anything?x=1"));
        assert!(allow.is_url_allowed("http://127.0.0.1:3000/"));
        assert!(!allow.is_url_allowed("https://evil.example"));
        assert!(!allow.is_url_allowed("not a url"));
        assert!(!allow.is_url_allowed("mailto:someone@httpbin.org"));
    }

    #[test]
    fn test_extract_host() {
        assert_eq!(extract_host("https://api.example.com:8443/a"), Some("api.example.com".into()));
        assert_eq!(extract_host("http://[::1]:80/"), Some("::1".into()));
        assert_eq!(extract_host("relative/path"), None);
    }
}
