//! GEOIP matcher: a thin wrapper over an MMDB reader. The embedded MMDB
//! reader is explicitly out of scope per §1 — this module only defines the
//! lookup interface and delegates the actual parsing to `maxminddb`, the
//! standard Rust MMDB reader.

use std::net::IpAddr;
use std::path::Path;

use crate::error::RuleError;

pub struct GeoipMatcher {
    reader: Option<maxminddb::Reader<Vec<u8>>>,
}

#[derive(serde::Deserialize)]
struct CountryRecord<'a> {
    #[serde(borrow)]
    country: Option<Country<'a>>,
}

#[derive(serde::Deserialize)]
struct Country<'a> {
    #[serde(borrow)]
    iso_code: Option<&'a str>,
}

impl GeoipMatcher {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RuleError> {
        let reader = maxminddb::Reader::open_readfile(path.as_ref())
            .map_err(|err| RuleError::AssetMissing(err.to_string()))?;
        Ok(Self { reader: Some(reader) })
    }

    /// No asset configured: every GEOIP rule fails to match, per §7's
    /// *RuleAssetMissing* — "matcher returns false for that rule only."
    pub fn disabled() -> Self {
        Self { reader: None }
    }

    pub fn country_is(&self, ip: IpAddr, expected_iso: &str) -> bool {
        let Some(reader) = &self.reader else { return false };
        let Ok(record) = reader.lookup::<CountryRecord>(ip) else { return false };
        record
            .country
            .and_then(|c| c.iso_code)
            .map(|code| code.eq_ignore_ascii_case(expected_iso))
            .unwrap_or(false)
    }
}
