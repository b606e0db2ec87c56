use serde::Deserialize;
use serde::Serialize;
use std::time::Duration;

/// Port of the discovery protocol.
pub const DEFAULT_PORT: u16 = 6376;

/// IPv4 multicast group of the discovery protocol.
pub const MULTICAST_ADDRESS_V4: &str = "239.45.99.98";

/// IPv6 multicast group of the discovery protocol.
///
/// Scope 8 means organization-local networks.
pub const MULTICAST_ADDRESS_V6: &str = "ff08:0:0:6d69:6e75:7363:6f6e:6600";

/// Where a seeker sends its query when none of the multicast groups is reachable.
pub const FALLBACK_ADDRESSES: [&str; 2] = ["::1", "127.0.0.1"];

pub const DEFAULT_SEEKER_TIMEOUT: Duration = Duration::from_secs(2);

fn default_addresses() -> Vec<String> {
    vec![MULTICAST_ADDRESS_V4.into(), MULTICAST_ADDRESS_V6.into()]
}

/// What an advertiser does with packets it cannot handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Drop them.
    #[default]
    Silent,

    /// Reply to the sender with an `ERROR` packet.
    ///
    /// Anyone able to spoof a source address can bounce these replies at a
    /// third party, so only use this on trusted networks.
    Reply,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvertiserConfig {
    pub port: u16,
    pub multicast_addresses: Vec<String>,

    /// Skip multicast groups whose address family the host lacks instead of failing.
    pub ignore_unavailable: bool,

    pub error_policy: ErrorPolicy,
}

impl Default for AdvertiserConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            multicast_addresses: default_addresses(),
            ignore_unavailable: true,
            error_policy: ErrorPolicy::default(),
        }
    }
}

impl AdvertiserConfig {
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_multicast_addresses(mut self, addresses: Vec<String>) -> Self {
        self.multicast_addresses = addresses;
        self
    }

    pub fn with_ignore_unavailable(mut self, ignore_unavailable: bool) -> Self {
        self.ignore_unavailable = ignore_unavailable;
        self
    }

    pub fn with_error_policy(mut self, error_policy: ErrorPolicy) -> Self {
        self.error_policy = error_policy;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeekerConfig {
    pub port: u16,
    pub query_addresses: Vec<String>,
    pub fallback_addresses: Vec<String>,

    /// How long to collect replies. `None` collects forever.
    pub timeout: Option<Duration>,

    /// Multicast TTL and hop limit. `None` keeps the system default.
    pub multicast_ttl: Option<u32>,

    /// Count a failed send as unsuccessful instead of aborting the seek.
    pub ignore_send_errors: bool,
}

impl Default for SeekerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            query_addresses: default_addresses(),
            fallback_addresses: FALLBACK_ADDRESSES.map(String::from).to_vec(),
            timeout: Some(DEFAULT_SEEKER_TIMEOUT),
            multicast_ttl: None,
            ignore_send_errors: true,
        }
    }
}

impl SeekerConfig {
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_query_addresses(mut self, addresses: Vec<String>) -> Self {
        self.query_addresses = addresses;
        self
    }

    pub fn with_fallback_addresses(mut self, addresses: Vec<String>) -> Self {
        self.fallback_addresses = addresses;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_multicast_ttl(mut self, ttl: Option<u32>) -> Self {
        self.multicast_ttl = ttl;
        self
    }

    pub fn with_ignore_send_errors(mut self, ignore_send_errors: bool) -> Self {
        self.ignore_send_errors = ignore_send_errors;
        self
    }
}
