//! DOMAIN / DOMAIN-SUFFIX / DOMAIN-KEYWORD matchers (§4.4).

/// Case-insensitive exact match.
pub fn domain_exact(host: &str, payload: &str) -> bool {
    host.eq_ignore_ascii_case(payload)
}

/// `host` equals `payload` or ends with `"." + payload`.
pub fn domain_suffix(host: &str, payload: &str) -> bool {
    let host = host.to_ascii_lowercase();
    let payload = payload.to_ascii_lowercase();
    host == payload || host.ends_with(&format!(".{payload}"))
}

/// Case-insensitive substring.
pub fn domain_keyword(host: &str, payload: &str) -> bool {
    host.to_ascii_lowercase().contains(&payload.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_requires_dot_boundary() {
        assert!(domain_suffix("qq.com", "qq.com"));
        assert!(domain_suffix("www.qq.com", "qq.com"));
        assert!(!domain_suffix("qq.com.evil", "qq.com"));
        assert!(!domain_suffix("evilqq.com", "qq.com"));
    }

    #[test]
    fn keyword_is_substring() {
        assert!(domain_keyword("www.Example.com", "example"));
        assert!(!domain_keyword("www.example.com", "zzz"));
    }
}
