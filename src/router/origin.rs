//! Sender-origin allow-list.

use url::Url;

/// Fixed allow-list of sender origins (`scheme://host[:port]`).
///
/// Origins are compared after normalization through [`Url`], so crafted
/// values like `https://app.example.com.evil.net` or a trailing path never
/// match an allowed entry by prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginValidator {
    allowed: Vec<String>,
}

impl OriginValidator {
    /// Entries that fail to parse as an origin are discarded.
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let allowed = allowed
            .into_iter()
            .filter_map(|entry| {
                let normalized = normalize_origin(entry.as_ref());
                if normalized.is_none() {
                    tracing::warn!(origin = entry.as_ref(), "Ignoring unparseable allowed origin");
                }
                normalized
            })
            .collect();
        Self { allowed }
    }

    /// Check a sender origin against the allow-list.
    pub fn is_allowed(&self, origin: &str) -> bool {
        match normalize_origin(origin) {
            Some(origin) => self.allowed.iter().any(|allowed| *allowed == origin),
            None => false,
        }
    }

    pub fn allowed(&self) -> &[String] {
        &self.allowed
    }
}

/// Reduce an origin string to its ASCII serialization, or `None` when it is
/// not a tuple origin (opaque schemes, `null`, garbage).
pub fn normalize_origin(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return None;
    }
    let url = Url::parse(trimmed).ok()?;
    let origin = url.origin();
    if origin.is_tuple() {
        return Some(origin.ascii_serialization());
    }
    // Extension schemes (`chrome-extension://<id>`) are opaque to the URL
    // standard but still name a stable host.
    if matches!(url.scheme(), "file" | "data" | "blob" | "javascript") {
        return None;
    }
    let host = url.host_str().filter(|h| !h.is_empty())?.to_ascii_lowercase();
    Some(match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_origin_matching() {
        let validator = OriginValidator::new(["https://app.example.com", "http://localhost:3000"]);

        assert!(validator.is_allowed("https://app.example.com"));
        assert!(validator.is_allowed("https://app.example.com/"));
        assert!(validator.is_allowed("https://APP.example.com"));
        assert!(validator.is_allowed("http://localhost:3000"));

        assert!(!validator.is_allowed("https://app.example.com.evil.net"));
        assert!(!validator.is_allowed("http://app.example.com"));
        assert!(!validator.is_allowed("http://localhost:3001"));
        assert!(!validator.is_allowed("null"));
        assert!(!validator.is_allowed(""));
    }

    #[test]
    fn default_ports_collapse() {
        let validator = OriginValidator::new(["https://app.example.com:443"]);
        assert!(validator.is_allowed("https://app.example.com"));
    }

    #[test]
    fn extension_origins_match_by_host() {
        let validator = OriginValidator::new(["chrome-extension://abcdef"]);
        assert!(validator.is_allowed("chrome-extension://abcdef/popup.html"));
        assert!(validator.is_allowed("chrome-extension://ABCDEF"));
        assert!(!validator.is_allowed("chrome-extension://abcdeg"));
        assert!(!validator.is_allowed("file:///etc/passwd"));
        assert!(!validator.is_allowed("data:text/html,hi"));
    }

    #[test]
    fn unparseable_entries_are_dropped() {
        let validator = OriginValidator::new(["not an origin", "https://ok.example"]);
        assert_eq!(validator.allowed(), ["https://ok.example".to_string()]);
    }
}
