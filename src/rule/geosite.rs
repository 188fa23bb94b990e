//! GeoSite asset loader and `DomainMatcher` (§4.5).
//!
//! The on-disk format is a flat concatenation of length-prefixed protobuf
//! `GeoSite` messages (no top-level index), and §9 explicitly calls the
//! resulting linear scan out as *intentional*: "cache the compiled matcher,
//! not the raw bytes." This module therefore hand-rolls the varint / tag
//! walk rather than pulling in a protobuf crate — the scan itself is the
//! in-scope algorithm, not incidental plumbing around it.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use regex::Regex;
use tracing::warn;

use crate::error::RuleError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DomainType {
    Plain,
    Regex,
    Domain,
    Full,
}

struct DomainEntry {
    kind: DomainType,
    value: String,
    regex: Option<Regex>,
    attributes: Vec<String>,
}

/// Compiled, cached container for one country code's domain list. Built
/// once and cached process-wide (never evicted).
pub struct DomainMatcher {
    entries: Vec<DomainEntry>,
}

impl DomainMatcher {
    /// True iff any compiled matcher hits `host`, optionally narrowed to
    /// entries carrying every attribute in `required_attrs`.
    fn matches_with_attrs(&self, host: &str, required_attrs: &[String]) -> bool {
        let host_lower = host.to_ascii_lowercase();
        self.entries.iter().any(|entry| {
            if !required_attrs.is_empty() {
                let has_all = required_attrs.iter().all(|required| {
                    entry.attributes.iter().any(|a| a.eq_ignore_ascii_case(required))
                });
                if !has_all {
                    return false;
                }
            }
            match entry.kind {
                DomainType::Plain => host_lower.contains(&entry.value),
                DomainType::Full => host_lower == entry.value,
                DomainType::Domain => {
                    host_lower == entry.value || host_lower.ends_with(&format!(".{}", entry.value))
                }
                DomainType::Regex => match &entry.regex {
                    Some(re) => re.is_match(&host_lower),
                    // Compilation failed at load time and was already logged
                    // there (§4.5: "skip the offending entry").
                    None => false,
                },
            }
        })
    }
}

/// Parses `"code"` or `"code@attr1@attr2"` per §4.5's attribute filter
/// syntax. `"CODE@"` (trailing bare `@`) is treated as plain `"CODE"`.
fn split_country_and_attrs(spec: &str) -> (String, Vec<String>) {
    let mut parts = spec.split('@');
    let country = parts.next().unwrap_or_default().to_ascii_uppercase();
    let attrs: Vec<String> = parts.filter(|a| !a.is_empty()).map(|a| a.to_string()).collect();
    (country, attrs)
}

/// Owns the raw asset bytes and a process-wide `country -> DomainMatcher`
/// cache populated lazily on first use.
pub struct GeositeAsset {
    data: Option<Vec<u8>>,
    cache: RwLock<HashMap<String, Arc<DomainMatcher>>>,
}

impl GeositeAsset {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RuleError> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|err| RuleError::AssetMissing(err.to_string()))?;
        Ok(Self { data: Some(data), cache: RwLock::new(HashMap::new()) })
    }

    /// No asset configured: every GEOSITE rule fails to match (§7).
    pub fn empty() -> Self {
        Self { data: None, cache: RwLock::new(HashMap::new()) }
    }

    /// §4.4 GEOSITE matcher: resolve via cached `DomainMatcher`, loading and
    /// compiling on cache miss.
    pub fn matches(&self, country_spec: &str, host: &str) -> bool {
        let (country, attrs) = split_country_and_attrs(country_spec);
        let matcher = match self.compiled(&country) {
            Some(m) => m,
            None => return false,
        };
        matcher.matches_with_attrs(host, &attrs)
    }

    fn compiled(&self, country: &str) -> Option<Arc<DomainMatcher>> {
        if let Some(hit) = self.cache.read().get(country) {
            return Some(hit.clone());
        }
        let body = find_record(self.data.as_deref()?, country)?;
        let entries = decode_domains(body);
        let matcher = Arc::new(DomainMatcher { entries });
        self.cache.write().insert(country.to_string(), matcher.clone());
        Some(matcher)
    }
}

fn read_varint(data: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    for (i, &byte) in data.iter().enumerate() {
        value |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
        shift += 7;
        if shift >= 64 {
            return None;
        }
    }
    None
}

/// Linear scan for the `GeoSite` record whose `country_code` equals
/// `target`. Terminates on short/malformed data or a `(0, 0)` header,
/// matching §4.5's described stop conditions.
fn find_record<'a>(data: &'a [u8], target: &str) -> Option<&'a [u8]> {
    let target = target.as_bytes();
    let mut pos = 0usize;
    loop {
        if pos >= data.len() {
            return None;
        }
        let (_tag, tag_len) = read_varint(&data[pos..])?;
        if tag_len == 0 {
            return None;
        }
        let len_pos = pos + tag_len;
        if len_pos >= data.len() {
            return None;
        }
        let (body_len, len_len) = read_varint(&data[len_pos..])?;
        if body_len == 0 && len_len == 0 {
            return None;
        }
        let body_start = len_pos + len_len;
        let body_end = body_start.checked_add(body_len as usize)?;
        if body_end > data.len() {
            return None;
        }
        let body = &data[body_start..body_end];
        if body.len() >= 2 {
            let code_len = body[1] as usize;
            if code_len == target.len() && body.len() >= 2 + code_len && &body[2..2 + code_len] == target {
                return Some(body);
            }
        }
        pos = body_end;
    }
}

/// Decodes the `repeated Domain{type, value, attributes}` field-2 entries
/// out of a `GeoSite` message body, skipping the leading `country_code`
/// field already consumed by [`find_record`].
fn decode_domains(body: &[u8]) -> Vec<DomainEntry> {
    let mut entries = Vec::new();
    let mut pos = 0usize;
    while pos < body.len() {
        let Some((tag, tag_len)) = read_varint(&body[pos..]) else { break };
        let field_number = tag >> 3;
        let wire_type = tag & 0x7;
        pos += tag_len;
        if wire_type != 2 {
            break; // every field this format cares about is length-delimited
        }
        let Some((len, len_len)) = read_varint(&body[pos..]) else { break };
        pos += len_len;
        let Some(end) = pos.checked_add(len as usize) else { break };
        if end > body.len() {
            break;
        }
        let field_bytes = &body[pos..end];
        if field_number == 2 {
            if let Some(mut entry) = decode_domain_entry(field_bytes) {
                if entry.kind == DomainType::Regex {
                    match Regex::new(&entry.value) {
                        Ok(re) => entry.regex = Some(re),
                        Err(err) => {
                            warn!(pattern = %entry.value, cause = %err, "geosite: skipping unparsable regex entry");
                            pos = end;
                            continue;
                        }
                    }
                }
                entries.push(entry);
            }
        }
        pos = end;
    }
    entries
}

fn decode_domain_entry(data: &[u8]) -> Option<DomainEntry> {
    let mut kind = DomainType::Plain;
    let mut value = String::new();
    let mut attributes = Vec::new();
    let mut pos = 0usize;
    while pos < data.len() {
        let (tag, tag_len) = read_varint(&data[pos..])?;
        let field_number = tag >> 3;
        let wire_type = tag & 0x7;
        pos += tag_len;
        match (field_number, wire_type) {
            (1, 0) => {
                let (v, n) = read_varint(&data[pos..])?;
                pos += n;
                kind = match v {
                    1 => DomainType::Regex,
                    2 => DomainType::Domain,
                    3 => DomainType::Full,
                    _ => DomainType::Plain,
                };
            }
            (2, 2) => {
                let (len, n) = read_varint(&data[pos..])?;
                pos += n;
                let end = pos.checked_add(len as usize)?;
                value = String::from_utf8_lossy(data.get(pos..end)?).to_ascii_lowercase();
                pos = end;
            }
            (3, 2) => {
                let (len, n) = read_varint(&data[pos..])?;
                pos += n;
                let end = pos.checked_add(len as usize)?;
                if let Some(key) = decode_attribute_key(data.get(pos..end)?) {
                    attributes.push(key);
                }
                pos = end;
            }
            (_, 0) => {
                let (_, n) = read_varint(&data[pos..])?;
                pos += n;
            }
            (_, 2) => {
                let (len, n) = read_varint(&data[pos..])?;
                pos += n;
                pos = pos.checked_add(len as usize)?;
            }
            _ => return None,
        }
    }
    Some(DomainEntry { kind, value, regex: None, attributes })
}

fn decode_attribute_key(data: &[u8]) -> Option<String> {
    // Attribute{key: string = 1; bool_value/int_value = 2/3}; we only need
    // the key to test "is this boolean attribute present."
    let (tag, tag_len) = read_varint(data)?;
    if tag >> 3 != 1 || tag & 0x7 != 2 {
        return None;
    }
    let (len, len_len) = read_varint(&data[tag_len..])?;
    let start = tag_len + len_len;
    let end = start.checked_add(len as usize)?;
    Some(String::from_utf8_lossy(data.get(start..end)?).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_varint(mut value: u64, out: &mut Vec<u8>) {
        loop {
            let byte = (value & 0x7F) as u8;
            value >>= 7;
            if value == 0 {
                out.push(byte);
                break;
            }
            out.push(byte | 0x80);
        }
    }

    fn encode_domain(kind: u64, value: &str) -> Vec<u8> {
        let mut entry = Vec::new();
        entry.push(0x08); // field 1, varint
        encode_varint(kind, &mut entry);
        entry.push(0x12); // field 2, length-delimited
        encode_varint(value.len() as u64, &mut entry);
        entry.extend_from_slice(value.as_bytes());
        entry
    }

    fn encode_geosite(country: &str, domains: &[Vec<u8>]) -> Vec<u8> {
        let mut body = Vec::new();
        body.push(0x0A); // field 1 (country_code), length-delimited
        encode_varint(country.len() as u64, &mut body);
        body.extend_from_slice(country.as_bytes());
        for domain in domains {
            body.push(0x12); // field 2 (domain), length-delimited
            encode_varint(domain.len() as u64, &mut body);
            body.extend_from_slice(domain);
        }
        let mut record = Vec::new();
        record.push(0x0A); // outer tag
        encode_varint(body.len() as u64, &mut record);
        record.extend_from_slice(&body);
        record
    }

    #[test]
    fn finds_and_matches_domain_suffix_entry() {
        let domain = encode_domain(2, "qq.com"); // Domain type => suffix match
        let asset_bytes = encode_geosite("CN", &[domain]);
        let asset = GeositeAsset { data: Some(asset_bytes), cache: RwLock::new(HashMap::new()) };

        assert!(asset.matches("CN", "www.qq.com"));
        assert!(asset.matches("CN", "qq.com"));
        assert!(!asset.matches("CN", "qq.com.evil"));
    }

    #[test]
    fn missing_country_does_not_match() {
        let domain = encode_domain(3, "example.com");
        let asset_bytes = encode_geosite("CN", &[domain]);
        let asset = GeositeAsset { data: Some(asset_bytes), cache: RwLock::new(HashMap::new()) };
        assert!(!asset.matches("US", "example.com"));
    }

    #[test]
    fn empty_asset_never_matches() {
        let asset = GeositeAsset::empty();
        assert!(!asset.matches("CN", "qq.com"));
    }

    #[test]
    fn regex_entry_is_compiled_and_matched() {
        let domain = encode_domain(1, r"^ad\d*\.example\.com$"); // Regex type
        let asset_bytes = encode_geosite("CN", &[domain]);
        let asset = GeositeAsset { data: Some(asset_bytes), cache: RwLock::new(HashMap::new()) };

        assert!(asset.matches("CN", "ad1.example.com"));
        assert!(!asset.matches("CN", "notad.example.com"));
    }

    #[test]
    fn unparsable_regex_entry_is_skipped_not_panicked() {
        let bad = encode_domain(1, "ad[.example.com"); // unbalanced class, fails to compile
        let good = encode_domain(2, "qq.com");
        let asset_bytes = encode_geosite("CN", &[bad, good]);
        let asset = GeositeAsset { data: Some(asset_bytes), cache: RwLock::new(HashMap::new()) };

        assert!(!asset.matches("CN", "ad[.example.com"));
        assert!(asset.matches("CN", "qq.com"));
    }
}
