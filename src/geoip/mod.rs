use std::net::IpAddr;
use std::path::Path;

use maxminddb::{geoip2, Reader};
use tracing::{debug, info, warn};

use crate::model::GeoInfo;

/// GeoIP collaborator seam. The store and collector resolve country
/// attribution through this trait; tests inject [`StubGeo`].
pub trait GeoProvider: Send + Sync {
    /// Resolves an IP to country/location attributes. `None` when the
    /// address is private, unparseable, or unknown to the database.
    fn lookup(&self, ip: &str) -> Option<GeoInfo>;
}

/// MaxMind GeoLite2 City reader. Degrades to a no-op when the database
/// file is absent so the collector keeps running without geo data.
pub struct MaxMindGeo {
    reader: Option<Reader<Vec<u8>>>,
}

impl MaxMindGeo {
    pub fn open(database_path: &str) -> Self {
        let path = Path::new(database_path);
        if !path.exists() {
            warn!(path = %database_path, "GeoIP database not found, country stats disabled");
            return Self { reader: None };
        }

        match Reader::open_readfile(path) {
            Ok(reader) => {
                info!(path = %database_path, "GeoIP database loaded");
                Self {
                    reader: Some(reader),
                }
            }
            Err(e) => {
                warn!(error = %e, path = %database_path, "failed to load GeoIP database");
                Self { reader: None }
            }
        }
    }

    pub fn is_available(&self) -> bool {
        self.reader.is_some()
    }
}

impl GeoProvider for MaxMindGeo {
    fn lookup(&self, ip: &str) -> Option<GeoInfo> {
        let reader = self.reader.as_ref()?;

        let addr: IpAddr = ip.parse().ok()?;
        if is_private_ip(&addr) {
            return None;
        }

        let city: geoip2::City = match reader.lookup(addr) {
            Ok(city) => city,
            Err(e) => {
                debug!(ip = %ip, error = %e, "GeoIP lookup failed");
                return None;
            }
        };

        let country_code = city
            .country
            .as_ref()
            .and_then(|c| c.iso_code)
            .unwrap_or_default()
            .to_string();
        if country_code.is_empty() {
            return None;
        }

        let location = city
            .city
            .as_ref()
            .and_then(|c| c.names.as_ref())
            .and_then(|names| names.get("en"))
            .map(|name| (*name).to_string())
            .unwrap_or_default();

        Some(GeoInfo {
            country_code,
            location,
        })
    }
}

/// Private, loopback, and otherwise non-routable addresses have no
/// meaningful geo attribution.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}

/// Fixed-answer provider for tests.
#[derive(Default)]
pub struct StubGeo {
    pub answer: Option<GeoInfo>,
}

impl StubGeo {
    pub fn returning(country_code: &str, location: &str) -> Self {
        Self {
            answer: Some(GeoInfo {
                country_code: country_code.to_string(),
                location: location.to_string(),
            }),
        }
    }
}

impl GeoProvider for StubGeo {
    fn lookup(&self, _ip: &str) -> Option<GeoInfo> {
        self.answer.clone()
    }
}
