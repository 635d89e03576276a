// # Domain Registry Implementations
//
// Domain name helpers shared by the whole pipeline, plus the two
// implementations of the `DomainRegistry` trait.

pub mod file;
pub mod memory;

pub use file::FileDomainRegistry;
pub use memory::MemoryDomainRegistry;

use url::Url;

/// Longest valid DNS name in presentation form
const MAX_DOMAIN_LEN: usize = 253;

/// Note attached to domains discovered in a redirect chain
pub const AUTO_ADDED_NOTE: &str = "auto-added from redirect chain";

/// Normalise a domain or URL typed by a human
///
/// URLs (anything with a scheme, path, query or fragment) are reduced to
/// their host. The result is lower-cased with the trailing dot removed.
///
/// # Returns
///
/// `None` for empty input, unparsable URLs, names containing whitespace or
/// names longer than 253 characters.
pub fn normalize_domain(raw: &str) -> Option<String> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    let host = if s.contains("://") || s.contains(['/', '?', '#']) {
        let with_scheme = if s.contains("://") {
            s.to_string()
        } else {
            format!("http://{s}")
        };
        Url::parse(&with_scheme).ok()?.host_str()?.to_string()
    } else {
        s.to_string()
    };

    let host = host.to_ascii_lowercase();
    let host = host.trim_end_matches('.');
    if host.is_empty() || host.contains(char::is_whitespace) || host.len() > MAX_DOMAIN_LEN {
        return None;
    }
    Some(host.to_string())
}

/// Collapse a hostname to its root: lower-case, no trailing dot, one
/// leading `www.` removed
pub fn root_domain(host: &str) -> String {
    let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
    match host.strip_prefix("www.") {
        Some(rest) if !rest.is_empty() => rest.to_string(),
        _ => host,
    }
}

/// Root domain of the host of `url`, if it has one
pub fn url_root_domain(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    let root = root_domain(host);
    (!root.is_empty()).then_some(root)
}

/// Parse a domain list: one entry per line, blanks and `#` comments skipped
///
/// Returns the normalised names (in input order, duplicates kept) and the
/// number of lines that were rejected as invalid.
pub fn parse_domain_list(text: &str) -> (Vec<String>, usize) {
    let mut domains = Vec::new();
    let mut invalid = 0;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match normalize_domain(line) {
            Some(domain) => domains.push(domain),
            None => invalid += 1,
        }
    }
    (domains, invalid)
}
