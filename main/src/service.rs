use minusconf_protocol::Advertisement;
use minusconf_protocol::Query;
use serde::Deserialize;
use serde::Serialize;
use std::fmt::Display;
use std::fmt::Formatter;
use std::net::IpAddr;
use thiserror::Error;

/// A service offered by an advertiser.
///
/// None of the fields contains a NUL byte.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "ServiceFields", into = "ServiceFields")]
pub struct Service {
    service_type: String,
    port: String,
    service_name: String,
    location: String,
}

impl Service {
    /// `service_name` and `location` may be empty. An empty location lets
    /// seekers fall back to the advertiser's address.
    pub fn new(
        service_type: impl Into<String>,
        port: impl Into<String>,
        service_name: impl Into<String>,
        location: impl Into<String>,
    ) -> Result<Self, ArgumentError> {
        let service = Self {
            service_type: service_type.into(),
            port: port.into(),
            service_name: service_name.into(),
            location: location.into(),
        };
        ensure_no_nul("service_type", &service.service_type)?;
        ensure_no_nul("port", &service.port)?;
        ensure_no_nul("service_name", &service.service_name)?;
        ensure_no_nul("location", &service.location)?;
        Ok(service)
    }

    pub fn unnamed(
        service_type: impl Into<String>,
        port: impl Into<String>,
    ) -> Result<Self, ArgumentError> {
        Self::new(service_type, port, "", "")
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// The port as a number, for services whose port is numeric.
    pub fn port_number(&self) -> Result<u16, ArgumentError> {
        self.port
            .parse()
            .map_err(|_| ArgumentError::InvalidPort(self.port.clone()))
    }

    pub fn matches(&self, service_type: &str, service_name: &str) -> bool {
        string_match(service_type, &self.service_type)
            && string_match(service_name, &self.service_name)
    }
}

impl Display for Service {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} service at ", self.service_type)?;
        if !self.service_name.is_empty() {
            write!(f, "{} ", self.service_name)?;
        }
        write!(f, "{}:{}", self.location, self.port)
    }
}

#[derive(Serialize, Deserialize)]
struct ServiceFields {
    service_type: String,
    port: String,
    #[serde(default)]
    service_name: String,
    #[serde(default)]
    location: String,
}

impl TryFrom<ServiceFields> for Service {
    type Error = ArgumentError;

    fn try_from(value: ServiceFields) -> Result<Self, Self::Error> {
        Self::new(
            value.service_type,
            value.port,
            value.service_name,
            value.location,
        )
    }
}

impl From<Service> for ServiceFields {
    fn from(value: Service) -> Self {
        Self {
            service_type: value.service_type,
            port: value.port,
            service_name: value.service_name,
            location: value.location,
        }
    }
}

/// A service found by a seeker.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceAt {
    pub advertiser_name: String,
    pub service_type: String,
    pub service_name: String,
    pub location: String,
    pub port: String,

    /// Address the advertisement came from.
    pub address: IpAddr,
}

impl ServiceAt {
    pub fn new(advertisement: Advertisement, address: IpAddr) -> Self {
        Self {
            advertiser_name: advertisement.advertiser_name,
            service_type: advertisement.service_type,
            service_name: advertisement.service_name,
            location: advertisement.location,
            port: advertisement.port,
            address: address.to_canonical(),
        }
    }

    /// Where to reach the service: its advertised location, or else the
    /// address of its advertiser.
    pub fn effective_location(&self) -> String {
        if self.location.is_empty() {
            self.address.to_string()
        } else {
            self.location.clone()
        }
    }

    pub fn matches(&self, query: &Query) -> bool {
        string_match(&query.advertiser_name, &self.advertiser_name)
            && string_match(&query.service_type, &self.service_type)
            && string_match(&query.service_name, &self.service_name)
    }
}

impl Display for ServiceAt {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} service at ", self.service_type)?;
        if !self.service_name.is_empty() {
            write!(f, "{} ", self.service_name)?;
        }
        write!(
            f,
            "{}:{} (advertiser \"{}\" at {})",
            self.location, self.port, self.advertiser_name, self.address
        )
    }
}

/// An empty filter matches everything.
pub(crate) fn string_match(filter: &str, value: &str) -> bool {
    filter.is_empty() || filter == value
}

pub(crate) fn ensure_no_nul(field: &'static str, value: &str) -> Result<(), ArgumentError> {
    if value.contains('\0') {
        Err(ArgumentError::NulByte { field })
    } else {
        Ok(())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ArgumentError {
    #[error("`{field}` must not contain a NUL byte")]
    NulByte { field: &'static str },

    #[error("Invalid port number `{0}`")]
    InvalidPort(String),
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::Ipv4Addr;
    use std::net::Ipv6Addr;

    fn service_at(location: &str) -> ServiceAt {
        ServiceAt {
            advertiser_name: "aaa".into(),
            service_type: "bbb".into(),
            service_name: "ccc".into(),
            location: location.into(),
            port: "eee".into(),
            address: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
        }
    }

    #[test]
    fn nul_in_any_field() {
        for i in 0..4 {
            let mut fields = ["x"; 4];
            fields[i] = "null\0byte";

            // When
            let result = Service::new(fields[0], fields[1], fields[2], fields[3]);

            // Then
            assert!(
                matches!(result, Err(ArgumentError::NulByte { .. })),
                "Field {} must reject NUL",
                i
            );
        }
    }

    #[test]
    fn nul_free_fields() {
        let service = Service::new("stype \u{df}", "strangeport", "", "").unwrap();
        assert_eq!(service.service_type(), "stype \u{df}");
        assert_eq!(service.port(), "strangeport");
        assert!(service.matches("", ""));
    }

    #[test]
    fn matching() {
        let service = Service::new("http", "80", "web", "").unwrap();

        assert!(service.matches("http", "web"));
        assert!(service.matches("http", ""));
        assert!(service.matches("", "web"));
        assert!(!service.matches("ftp", ""));
        assert!(!service.matches("", "mail"));
    }

    #[test]
    fn port_number() {
        assert_eq!(Service::unnamed("http", "8080").unwrap().port_number(), Ok(8080));
        assert_eq!(
            Service::unnamed("http", "eighty").unwrap().port_number(),
            Err(ArgumentError::InvalidPort("eighty".into()))
        );
    }

    #[test]
    fn ordering_follows_fields() {
        let a = Service::new("a", "2", "", "").unwrap();
        let b = Service::new("b", "1", "", "").unwrap();
        assert!(a < b);
    }

    #[test]
    fn service_display() {
        let named = Service::new("http", "80", "Apache", "fastmachine").unwrap();
        let unnamed = Service::unnamed("http", "80").unwrap();

        assert_eq!(named.to_string(), "http service at Apache fastmachine:80");
        assert_eq!(unnamed.to_string(), "http service at :80");
    }

    #[test]
    fn service_at_display() {
        assert_eq!(
            service_at("ddd").to_string(),
            "bbb service at ccc ddd:eee (advertiser \"aaa\" at 10.0.0.1)"
        );
    }

    #[test]
    fn effective_location() {
        assert_eq!(service_at("ddd").effective_location(), "ddd");
        assert_eq!(service_at("").effective_location(), "10.0.0.1");
    }

    #[test]
    fn mapped_sender_is_canonical() {
        let mapped = IpAddr::V6(Ipv4Addr::new(127, 0, 0, 1).to_ipv6_mapped());

        // When
        let service = ServiceAt::new(Advertisement::default(), mapped);

        // Then
        assert_eq!(service.address, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(
            ServiceAt::new(Advertisement::default(), IpAddr::V6(Ipv6Addr::LOCALHOST)).address,
            IpAddr::V6(Ipv6Addr::LOCALHOST)
        );
    }

    #[test]
    fn service_at_matching() {
        let service = service_at("");
        let query = |a: &str, t: &str, n: &str| Query {
            advertiser_name: a.into(),
            service_type: t.into(),
            service_name: n.into(),
        };

        assert!(service.matches(&query("", "", "")));
        assert!(service.matches(&query("aaa", "bbb", "ccc")));
        assert!(!service.matches(&query("zzz", "", "")));
        assert!(!service.matches(&query("", "zzz", "")));
        assert!(!service.matches(&query("", "", "zzz")));
    }

    #[test]
    fn deserialize_rejects_nul() {
        let json = r#"{"service_type":"a\u0000b","port":"1"}"#;
        assert!(serde_json::from_str::<Service>(json).is_err());
    }

    #[test]
    fn serde_defaults() {
        let service: Service = serde_json::from_str(r#"{"service_type":"a","port":"1"}"#).unwrap();
        assert_eq!(service, Service::unnamed("a", "1").unwrap());
    }
}
