//! Geolocation
//!
//! Lookups run outside the registry lock. [`MaxMindLocator`] reads a GeoIP2
//! City database; the static prefix table from config answers for addresses
//! the database does not know, or alone when no database is configured.

use std::net::IpAddr;
use std::path::Path;

use maxminddb::{geoip2, Reader};
use serde::{Deserialize, Serialize};
use tracing::{info, trace};

use crate::types::Geo;

/// Resolve an IP address to a location
pub trait GeoLocator: Send + Sync {
    fn locate(&self, ip: &str) -> Option<Geo>;
}

/// One entry of the static table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoEntry {
    /// Textual address prefix, e.g. `"10.1."`
    pub prefix: String,
    pub country: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub ll: (f64, f64),
}

/// Longest-prefix match over a configured table
#[derive(Debug, Clone, Default)]
pub struct StaticGeoTable {
    entries: Vec<GeoEntry>,
}

impl StaticGeoTable {
    pub fn new(mut entries: Vec<GeoEntry>) -> Self {
        entries.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Self { entries }
    }
}

impl GeoLocator for StaticGeoTable {
    fn locate(&self, ip: &str) -> Option<Geo> {
        let ip = normalize_ip(ip);
        self.entries
            .iter()
            .find(|entry| ip.starts_with(entry.prefix.as_str()))
            .map(|entry| Geo {
                country: entry.country.clone(),
                region: entry.region.clone(),
                city: entry.city.clone(),
                ll: entry.ll,
            })
    }
}

/// GeoIP2 / GeoLite2 City database lookup
pub struct MaxMindLocator {
    reader: Reader<Vec<u8>>,
    fallback: StaticGeoTable,
}

impl MaxMindLocator {
    pub fn open(path: &Path, fallback: StaticGeoTable) -> anyhow::Result<Self> {
        let reader = Reader::open_readfile(path)
            .map_err(|e| anyhow::anyhow!("failed to open GeoIP database {}: {}", path.display(), e))?;

        info!(
            "🌍 GeoIP database {} ({}, built {})",
            path.display(),
            reader.metadata.database_type,
            reader.metadata.build_epoch
        );
        Ok(Self { reader, fallback })
    }

    fn lookup(&self, ip: &str) -> Option<Geo> {
        let addr: IpAddr = normalize_ip(ip).parse().ok()?;
        match self.reader.lookup::<geoip2::City>(addr) {
            Ok(city) => geo_from_city(&city),
            Err(e) => {
                trace!("No GeoIP record for {}: {}", addr, e);
                None
            }
        }
    }
}

impl GeoLocator for MaxMindLocator {
    fn locate(&self, ip: &str) -> Option<Geo> {
        self.lookup(ip).or_else(|| self.fallback.locate(ip))
    }
}

/// Country and first subdivision as ISO codes, city by English name
fn geo_from_city(city: &geoip2::City) -> Option<Geo> {
    let country = city.country.as_ref()?.iso_code?.to_string();

    let region = city
        .subdivisions
        .as_ref()
        .and_then(|subdivisions| subdivisions.first())
        .and_then(|subdivision| subdivision.iso_code)
        .unwrap_or_default()
        .to_string();

    let name = city
        .city
        .as_ref()
        .and_then(|c| c.names.as_ref())
        .and_then(|names| names.get("en").copied())
        .unwrap_or_default()
        .to_string();

    let ll = city
        .location
        .as_ref()
        .map(|location| (location.latitude.unwrap_or(0.0), location.longitude.unwrap_or(0.0)))
        .unwrap_or((0.0, 0.0));

    Some(Geo {
        country,
        region,
        city: name,
        ll,
    })
}

/// Strip the IPv4-mapped IPv6 prefix
pub fn normalize_ip(ip: &str) -> &str {
    ip.strip_prefix("::ffff:").unwrap_or(ip)
}
