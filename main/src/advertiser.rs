use crate::config::AdvertiserConfig;
use crate::config::ErrorPolicy;
use crate::multicast;
use crate::multicast::MulticastError;
use crate::process::ProcessError;
use crate::resolver::ResolveError;
use crate::service::ensure_no_nul;
use crate::service::string_match;
use crate::service::ArgumentError;
use crate::service::Service;
use futures_util::StreamExt;
use minusconf_protocol::Advertisement;
use minusconf_protocol::Frame;
use minusconf_protocol::FrameCodec;
use minusconf_protocol::Opcode;
use minusconf_protocol::ProtocolError;
use minusconf_protocol::Query;
use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tokio_util::udp::UdpFramed;

/// Services an advertiser answers queries with.
#[automock]
pub trait ServiceList {
    /// Services matching both filters, in insertion order.
    fn matching(&self, service_type: &str, service_name: &str) -> Vec<Service>;
}

impl ServiceList for Vec<Service> {
    fn matching(&self, service_type: &str, service_name: &str) -> Vec<Service> {
        self.iter()
            .filter(|s| s.matches(service_type, service_name))
            .cloned()
            .collect()
    }
}

/// A service list that can change while an advertiser is serving it.
#[derive(Debug, Clone, Default)]
pub struct SharedServices(Arc<Mutex<Vec<Service>>>);

impl SharedServices {
    pub fn new(services: Vec<Service>) -> Self {
        Self(Arc::new(Mutex::new(services)))
    }

    pub fn push(&self, service: Service) {
        self.lock().push(service);
    }

    pub fn extend(&self, services: impl IntoIterator<Item = Service>) {
        self.lock().extend(services);
    }

    /// Removes every copy of `service`. Returns whether there was any.
    pub fn remove(&self, service: &Service) -> bool {
        let mut services = self.lock();
        let count = services.len();
        services.retain(|s| s != service);
        services.len() != count
    }

    pub fn replace(&self, services: Vec<Service>) {
        *self.lock() = services;
    }

    pub fn snapshot(&self) -> Vec<Service> {
        self.lock().clone()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    // A panic while holding the lock cannot leave the list half-modified.
    fn lock(&self) -> MutexGuard<'_, Vec<Service>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ServiceList for SharedServices {
    fn matching(&self, service_type: &str, service_name: &str) -> Vec<Service> {
        self.lock().matching(service_type, service_name)
    }
}

/// Answers queries for a list of services.
pub struct Advertiser<L> {
    services: L,
    name: String,
    config: AdvertiserConfig,
}

impl<L: ServiceList> Advertiser<L> {
    /// Creates an advertiser called `name`, or after the host when `name` is `None`.
    pub fn new(services: L, name: Option<String>) -> Result<Self, AdvertiseError> {
        let name = advertiser_name(name)?;
        Ok(Self {
            services,
            name,
            config: Default::default(),
        })
    }

    pub fn with_config(mut self, config: AdvertiserConfig) -> Self {
        self.config = config;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &AdvertiserConfig {
        &self.config
    }

    pub fn services(&self) -> &L {
        &self.services
    }

    pub fn services_matching(&self, service_type: &str, service_name: &str) -> Vec<Service> {
        self.services.matching(service_type, service_name)
    }

    /// Serves forever.
    pub async fn run(&self) -> Result<(), AdvertiseError> {
        let framed = self.bind().await?;
        self.serve(framed, &CancellationToken::new()).await;
        Ok(())
    }

    /// Binds the listening socket and joins the multicast groups.
    pub(crate) async fn bind(&self) -> Result<UdpFramed<FrameCodec>, AdvertiseError> {
        let socket =
            multicast::bind_endpoint(self.config.port, true).map_err(AdvertiseError::Bind)?;
        let family = multicast::socket_family(&socket).map_err(AdvertiseError::Bind)?;

        let groups = crate::resolve(
            &self.config.multicast_addresses,
            None,
            self.config.ignore_unavailable,
            &[family],
        )
        .await?;
        for group in groups {
            match multicast::join_group(&socket, group.original_family, &group.original_address) {
                Ok(()) => {}
                Err(e) if self.config.ignore_unavailable => {
                    log::warn!(
                        "Ignoring unavailable multicast group {}: {}",
                        group.original_address,
                        e
                    );
                }
                Err(e) => {
                    return Err(AdvertiseError::Join {
                        group: group.original_address,
                        source: e,
                    })
                }
            }
        }

        log::info!(
            "Advertiser `{}` listening at {}",
            self.name,
            socket.local_addr().map_err(AdvertiseError::Bind)?
        );
        Ok(UdpFramed::new(socket, FrameCodec))
    }

    /// Answers packets until `token` is cancelled.
    pub(crate) async fn serve(&self, mut framed: UdpFramed<FrameCodec>, token: &CancellationToken) {
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                next = framed.next() => next,
            };
            match next {
                None => break,
                Some(Ok((frame, sender))) => self.handle(framed.get_ref(), &frame, sender).await,
                Some(Err(e)) if e.is_malformed() => log::debug!("Dropping packet: {}", e),
                Some(Err(e)) => log::warn!("Failed to receive a packet: {}", e),
            }
        }
        log::info!("Advertiser `{}` stopped", self.name);
    }

    async fn handle(&self, socket: &UdpSocket, frame: &Frame, sender: SocketAddr) {
        let replies = match self.respond(frame) {
            Ok(replies) => replies,
            Err(e) => {
                log::debug!("Bad packet from {}: {}", sender, e);
                match self.config.error_policy {
                    ErrorPolicy::Silent => return,
                    ErrorPolicy::Reply => vec![e.to_frame()],
                }
            }
        };

        for reply in replies {
            if let Err(e) = socket.send_to(&reply.to_bytes(), sender).await {
                log::warn!("Failed to reply to {}: {}", sender, e);
            }
        }
    }

    /// Replies to send back for `frame`.
    pub fn respond(&self, frame: &Frame) -> Result<Vec<Frame>, ProtocolError> {
        match frame.opcode {
            Opcode::Query => {
                let query = Query::decode(&frame.payload)
                    .map_err(|e| ProtocolError::new(format!("Malformed query: {}", e)))?;
                if !string_match(&query.advertiser_name, &self.name) {
                    return Ok(Vec::new());
                }

                let replies: Vec<_> = self
                    .services
                    .matching(&query.service_type, &query.service_name)
                    .into_iter()
                    .map(|s| self.advertisement(s).to_frame())
                    .collect();
                log::debug!("Answering {:?} with {} services", query, replies.len());
                Ok(replies)
            }
            Opcode::Empty => Ok(Vec::new()),
            _ => Err(ProtocolError::new("Invalid or unsupported opcode")),
        }
    }

    fn advertisement(&self, service: Service) -> Advertisement {
        Advertisement {
            advertiser_name: self.name.clone(),
            service_type: service.service_type().into(),
            service_name: service.service_name().into(),
            location: service.location().into(),
            port: service.port().into(),
        }
    }
}

/// Checks `name`, or names the advertiser after the host when `name` is `None`.
pub(crate) fn advertiser_name(name: Option<String>) -> Result<String, AdvertiseError> {
    let name = match name {
        Some(name) => name,
        None => hostname::get()
            .map_err(AdvertiseError::Hostname)?
            .to_string_lossy()
            .into_owned(),
    };
    ensure_no_nul("advertiser_name", &name)?;
    Ok(name)
}

#[derive(Error, Debug)]
pub enum AdvertiseError {
    #[error("Invalid argument")]
    Argument(#[from] ArgumentError),

    #[error("Failed to get the host name")]
    Hostname(#[source] std::io::Error),

    #[error("Failed to bind the advertiser socket")]
    Bind(#[source] std::io::Error),

    #[error("Failed to resolve multicast addresses")]
    Resolve(#[from] ResolveError),

    #[error("Failed to join multicast group `{group}`")]
    Join {
        group: String,
        source: MulticastError,
    },

    #[error("Advertiser already started")]
    AlreadyStarted,

    #[error("Advertiser not started")]
    NotStarted,

    #[error("Advertiser task ended before it started serving")]
    Aborted,

    #[error("Advertiser task failed")]
    Task(#[from] tokio::task::JoinError),

    #[error("Error in the advertiser process")]
    Process(#[from] ProcessError),
}
