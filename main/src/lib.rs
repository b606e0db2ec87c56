//! Service discovery over UDP multicast.
//!
//! An [`Advertiser`] answers queries for the services it offers. A [`Seeker`]
//! multicasts a query and collects the answers until its timeout runs out.

mod advertiser;
mod concurrent;
mod config;
mod multicast;
mod process;
mod resolver;
mod seeker;
mod service;

pub use advertiser::AdvertiseError;
pub use advertiser::Advertiser;
pub use advertiser::ServiceList;
pub use advertiser::SharedServices;
pub use concurrent::ConcurrentAdvertiser;
pub use concurrent::TaskAdvertiser;
pub use config::AdvertiserConfig;
pub use config::ErrorPolicy;
pub use config::SeekerConfig;
pub use config::DEFAULT_PORT;
pub use config::DEFAULT_SEEKER_TIMEOUT;
pub use config::FALLBACK_ADDRESSES;
pub use config::MULTICAST_ADDRESS_V4;
pub use config::MULTICAST_ADDRESS_V6;
pub use minusconf_protocol as protocol;
pub use multicast::configure_sender_ttl;
pub use multicast::join_group;
pub use multicast::MulticastError;
pub use process::host_child;
pub use process::ProcessAdvertiser;
pub use process::ProcessError;
pub use resolver::family_of;
pub use resolver::resolve;
pub use resolver::ResolveError;
pub use resolver::ResolvedAddress;
pub use seeker::SeekError;
pub use seeker::Seeker;
pub use seeker::SeekerListener;
pub use service::ArgumentError;
pub use service::Service;
pub use service::ServiceAt;
