use minusconf_protocol::address::AddressFamily;
use std::net::SocketAddr;
use std::net::SocketAddrV6;
use thiserror::Error;

/// An endpoint usable by a socket, plus the address it was derived from.
///
/// The two differ when an IPv4 result was mapped into IPv6 for a dual-stack
/// socket; multicast membership still has to be requested for the original.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAddress {
    pub endpoint: SocketAddr,
    pub original_family: AddressFamily,
    pub original_address: String,
}

impl ResolvedAddress {
    pub fn family(&self) -> AddressFamily {
        family_of(&self.endpoint)
    }
}

pub fn family_of(address: &SocketAddr) -> AddressFamily {
    match address {
        SocketAddr::V4(_) => AddressFamily::Ipv4,
        SocketAddr::V6(_) => AddressFamily::Ipv6,
    }
}

/// Looks up each of `addresses` and keeps its first result in one of the
/// `acceptable` families.
///
/// An IPv4-only result is mapped into IPv6 when only IPv6 is acceptable.
/// Addresses that cannot be resolved fail the whole call unless
/// `ignore_unavailable` is set, in which case they are left out.
pub async fn resolve(
    addresses: &[String],
    port: Option<u16>,
    ignore_unavailable: bool,
    acceptable: &[AddressFamily],
) -> Result<Vec<ResolvedAddress>, ResolveError> {
    let mut resolved = Vec::with_capacity(addresses.len());
    for address in addresses {
        match resolve_one(address, port.unwrap_or(0), acceptable).await {
            Ok(r) => {
                log::debug!("Resolved `{}` to {}", address, r.endpoint);
                resolved.push(r);
            }
            Err(e) if ignore_unavailable => {
                log::debug!("Ignoring unavailable address `{}`: {}", address, e);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(resolved)
}

async fn resolve_one(
    address: &str,
    port: u16,
    acceptable: &[AddressFamily],
) -> Result<ResolvedAddress, ResolveError> {
    let candidates: Vec<_> = tokio::net::lookup_host((address, port))
        .await
        .map_err(|source| ResolveError::Lookup {
            address: address.to_owned(),
            source,
        })?
        .collect();

    if let Some(endpoint) = candidates
        .iter()
        .find(|c| acceptable.contains(&family_of(c)))
    {
        return Ok(ResolvedAddress {
            endpoint: *endpoint,
            original_family: family_of(endpoint),
            original_address: endpoint.ip().to_string(),
        });
    }

    match candidates.first() {
        Some(SocketAddr::V4(v4)) if acceptable.contains(&AddressFamily::Ipv6) => {
            let mapped = SocketAddrV6::new(v4.ip().to_ipv6_mapped(), port, 0, 0);
            Ok(ResolvedAddress {
                endpoint: mapped.into(),
                original_family: AddressFamily::Ipv4,
                original_address: v4.ip().to_string(),
            })
        }
        _ => Err(ResolveError::NoAcceptableFamily {
            address: address.to_owned(),
        }),
    }
}

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Failed to look up address `{address}`")]
    Lookup {
        address: String,
        source: std::io::Error,
    },

    #[error("Address `{address}` has no usable address family")]
    NoAcceptableFamily { address: String },
}
