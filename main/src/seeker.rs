use crate::config::SeekerConfig;
use crate::multicast;
use crate::resolver::ResolveError;
use crate::service::ensure_no_nul;
use crate::service::ArgumentError;
use crate::service::ServiceAt;
use futures_util::StreamExt;
use minusconf_protocol::Advertisement;
use minusconf_protocol::Frame;
use minusconf_protocol::FrameCodec;
use minusconf_protocol::Opcode;
use minusconf_protocol::ProtocolError;
use minusconf_protocol::Query;
use mockall::automock;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tokio_util::udp::UdpFramed;

/// Gets told about the replies a [`Seeker`] receives.
#[automock]
pub trait SeekerListener {
    /// A service not found before in this seeker's results.
    fn found(&mut self, service: &ServiceAt);

    /// An `ERROR` packet from `sender`.
    fn error(&mut self, sender: SocketAddr, message: &str);
}

impl SeekerListener for () {
    fn found(&mut self, _: &ServiceAt) {}

    fn error(&mut self, _: SocketAddr, _: &str) {}
}

/// Queries for services and collects the answers.
///
/// Results accumulate over several runs until [`Seeker::reset`].
pub struct Seeker {
    query: Query,
    config: SeekerConfig,
    listener: Box<dyn SeekerListener + Send>,
    results: BTreeSet<ServiceAt>,
}

impl Seeker {
    /// Empty filters match anything.
    pub fn new(
        service_type: impl Into<String>,
        advertiser_name: impl Into<String>,
        service_name: impl Into<String>,
    ) -> Result<Self, ArgumentError> {
        Ok(Self {
            query: new_query(service_type, advertiser_name, service_name)?,
            config: Default::default(),
            listener: Box::new(()),
            results: Default::default(),
        })
    }

    pub fn with_config(mut self, config: SeekerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_listener(mut self, listener: impl SeekerListener + Send + 'static) -> Self {
        self.listener = Box::new(listener);
        self
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn config(&self) -> &SeekerConfig {
        &self.config
    }

    pub fn results(&self) -> &BTreeSet<ServiceAt> {
        &self.results
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.config.timeout = timeout;
    }

    /// Replaces the filters and forgets all results.
    ///
    /// Nothing changes if any filter is invalid.
    pub fn reset(
        &mut self,
        service_type: impl Into<String>,
        advertiser_name: impl Into<String>,
        service_name: impl Into<String>,
    ) -> Result<(), ArgumentError> {
        self.query = new_query(service_type, advertiser_name, service_name)?;
        self.results.clear();
        Ok(())
    }

    /// Sends the query and collects replies until the timeout.
    pub async fn run(&mut self) -> Result<(), SeekError> {
        let socket = multicast::bind_endpoint(0, false).map_err(SeekError::Socket)?;
        multicast::configure_sender_ttl(&socket, self.config.multicast_ttl)
            .map_err(SeekError::Socket)?;
        self.send_query(&socket).await?;
        self.collect(UdpFramed::new(socket, FrameCodec)).await;
        Ok(())
    }

    /// Collects replies until the socket fails.
    pub async fn run_forever(&mut self) -> Result<(), SeekError> {
        self.set_timeout(None);
        self.run().await
    }

    async fn send_query(&self, socket: &UdpSocket) -> Result<(), SeekError> {
        let family = multicast::socket_family(socket).map_err(SeekError::Socket)?;
        let packet = self.query.to_frame().to_bytes();

        let targets = crate::resolve(
            &self.config.query_addresses,
            Some(self.config.port),
            self.config.ignore_send_errors,
            &[family],
        )
        .await?;
        let mut sent = 0;
        for target in &targets {
            if self.send(socket, &packet, target.endpoint).await? {
                sent += 1;
            }
        }
        if sent > 0 {
            return Ok(());
        }

        log::info!("Query reached no multicast group, trying fallback addresses");
        for address in &self.config.fallback_addresses {
            let targets = crate::resolve(
                std::slice::from_ref(address),
                Some(self.config.port),
                true,
                &[family],
            )
            .await?;
            for target in &targets {
                match socket.send_to(&packet, target.endpoint).await {
                    Ok(_) => {
                        log::debug!("Sent query to fallback {}", target.endpoint);
                        return Ok(());
                    }
                    Err(e) => log::warn!("Failed to send query to {}: {}", target.endpoint, e),
                }
            }
        }
        Err(SeekError::NoRouteAvailable)
    }

    /// Whether the query went out.
    async fn send(
        &self,
        socket: &UdpSocket,
        packet: &[u8],
        target: SocketAddr,
    ) -> Result<bool, SeekError> {
        match socket.send_to(packet, target).await {
            Ok(_) => {
                log::debug!("Sent query to {}", target);
                Ok(true)
            }
            Err(e) if self.config.ignore_send_errors => {
                log::warn!("Failed to send query to {}: {}", target, e);
                Ok(false)
            }
            Err(e) => Err(SeekError::Send {
                address: target,
                source: e,
            }),
        }
    }

    async fn collect(&mut self, mut framed: UdpFramed<FrameCodec>) {
        let deadline = self.config.timeout.map(|t| Instant::now() + t);
        loop {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                break;
            }
            let next = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, framed.next()).await {
                    Ok(next) => next,
                    Err(_) => break,
                },
                None => framed.next().await,
            };
            match next {
                None => break,
                Some(Ok((frame, sender))) => self.handle(&frame, sender),
                Some(Err(e)) if e.is_malformed() => log::debug!("Dropping reply: {}", e),
                Some(Err(e)) => log::warn!("Failed to receive a reply: {}", e),
            }
        }
        log::debug!("Seeker found {} services so far", self.results.len());
    }

    fn handle(&mut self, frame: &Frame, sender: SocketAddr) {
        let sender = SocketAddr::new(sender.ip().to_canonical(), sender.port());
        match frame.opcode {
            Opcode::Advertisement => {
                let advertisement = match Advertisement::decode(&frame.payload) {
                    Ok(a) => a,
                    Err(e) => {
                        log::debug!("Malformed advertisement from {}: {}", sender, e);
                        return;
                    }
                };
                let service = ServiceAt::new(advertisement, sender.ip());
                if !service.matches(&self.query) || self.results.contains(&service) {
                    return;
                }
                log::debug!("Found {}", service);
                self.listener.found(&service);
                self.results.insert(service);
            }
            Opcode::Error => {
                let message = match ProtocolError::decode(&frame.payload) {
                    Ok(e) => e.message,
                    Err(e) => format!("[Error when trying to read error message: {}]", e),
                };
                self.listener.error(sender, &message);
            }
            other => log::debug!("Ignoring {:?} packet from {}", other, sender),
        }
    }
}

fn new_query(
    service_type: impl Into<String>,
    advertiser_name: impl Into<String>,
    service_name: impl Into<String>,
) -> Result<Query, ArgumentError> {
    let query = Query {
        advertiser_name: advertiser_name.into(),
        service_type: service_type.into(),
        service_name: service_name.into(),
    };
    ensure_no_nul("advertiser_name", &query.advertiser_name)?;
    ensure_no_nul("service_type", &query.service_type)?;
    ensure_no_nul("service_name", &query.service_name)?;
    Ok(query)
}

#[derive(Error, Debug)]
pub enum SeekError {
    #[error("Failed to set up the seeker socket")]
    Socket(#[source] std::io::Error),

    #[error("Failed to resolve query addresses")]
    Resolve(#[from] ResolveError),

    #[error("Failed to send the query to {address}")]
    Send {
        address: SocketAddr,
        source: std::io::Error,
    },

    #[error("No address reachable to send the query to")]
    NoRouteAvailable,
}
