//! Textual IP address literals to packed network-order bytes.
//!
//! This parser is stricter than most platform ones: IPv4 accepts exactly four
//! decimal components, IPv6 accepts hex groups with at most one `::` and an
//! optional dotted-quad tail.

use thiserror::Error;

const IPV4_LENGTH: usize = 4;
const IPV6_GROUPS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

/// Parses `literal` as an address of `family`.
///
/// The result is 4 bytes long for IPv4 and 16 bytes long for IPv6.
pub fn parse(family: AddressFamily, literal: &str) -> Result<Vec<u8>, AddressParseError> {
    match family {
        AddressFamily::Ipv4 => parse_ipv4(literal).map(Vec::from),
        AddressFamily::Ipv6 => parse_ipv6(literal).map(Vec::from),
    }
}

pub fn parse_ipv4(literal: &str) -> Result<[u8; IPV4_LENGTH], AddressParseError> {
    let components: Vec<_> = literal.split('.').collect();
    if components.len() != IPV4_LENGTH {
        return Err(AddressParseError::ComponentCount {
            expected: IPV4_LENGTH,
            actual: components.len(),
        });
    }

    let mut octets = [0; IPV4_LENGTH];
    for (octet, component) in octets.iter_mut().zip(components) {
        let value = parse_component(component, 10)?;
        *octet = u8::try_from(value)
            .map_err(|_| AddressParseError::OutOfRange(component.to_owned()))?;
    }
    Ok(octets)
}

pub fn parse_ipv6(literal: &str) -> Result<[u8; 16], AddressParseError> {
    let mut octets = [0; 16];

    // A dotted-quad tail stands for the last 2 groups.
    let (hex_part, group_count) = if let Some(dot) = literal.find('.') {
        let colon = literal[..dot]
            .rfind(':')
            .ok_or(AddressParseError::MissingColon)?;
        octets[12..].copy_from_slice(&parse_ipv4(&literal[colon + 1..])?);

        let hex_part = &literal[..=colon];
        let hex_part = if hex_part.ends_with("::") {
            hex_part
        } else {
            &hex_part[..colon]
        };
        (hex_part, IPV6_GROUPS - 2)
    } else {
        (literal, IPV6_GROUPS)
    };

    let groups = parse_groups(hex_part, group_count)?;
    for (chunk, group) in octets.chunks_exact_mut(2).zip(groups) {
        chunk.copy_from_slice(&group.to_be_bytes());
    }
    Ok(octets)
}

/// Expands `text` into exactly `count` groups, filling in a `::` with zeros.
fn parse_groups(text: &str, count: usize) -> Result<Vec<u16>, AddressParseError> {
    let halves: Vec<_> = text.split("::").collect();
    match halves.as_slice() {
        [whole] => {
            let groups = parse_group_list(whole)?;
            if groups.len() != count {
                return Err(AddressParseError::ComponentCount {
                    expected: count,
                    actual: groups.len(),
                });
            }
            Ok(groups)
        }
        [head, tail] => {
            let head = parse_group_list(head)?;
            let tail = parse_group_list(tail)?;
            let explicit = head.len() + tail.len();
            if explicit >= count {
                return Err(AddressParseError::ComponentCount {
                    expected: count,
                    actual: explicit + 1,
                });
            }

            let mut groups = head;
            groups.resize(count - tail.len(), 0);
            groups.extend(tail);
            Ok(groups)
        }
        _ => Err(AddressParseError::MultipleCompression),
    }
}

/// Colon-separated groups. An empty `text` means no groups at all.
fn parse_group_list(text: &str) -> Result<Vec<u16>, AddressParseError> {
    if text.is_empty() {
        return Ok(Vec::new());
    }
    text.split(':')
        .map(|group| {
            let value = parse_component(group, 16)?;
            u16::try_from(value).map_err(|_| AddressParseError::OutOfRange(group.to_owned()))
        })
        .collect()
}

/// Digits only: no sign, no `0x`, no whitespace.
fn parse_component(component: &str, radix: u32) -> Result<u32, AddressParseError> {
    if component.is_empty() {
        return Err(AddressParseError::EmptyComponent);
    }
    component.chars().try_fold(0u32, |value, c| {
        let digit = c
            .to_digit(radix)
            .ok_or_else(|| AddressParseError::InvalidCharacter(component.to_owned()))?;
        Ok(value.saturating_mul(radix).saturating_add(digit))
    })
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressParseError {
    #[error("Expected {expected} address components, got {actual}")]
    ComponentCount { expected: usize, actual: usize },

    #[error("Empty address component")]
    EmptyComponent,

    #[error("Invalid character in address component `{0}`")]
    InvalidCharacter(String),

    #[error("Address component `{0}` out of range")]
    OutOfRange(String),

    #[error("More than one `::` in an IPv6 address")]
    MultipleCompression,

    #[error("Missing colons in an IPv6 address")]
    MissingColon,
}
