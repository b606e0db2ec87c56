use crate::advertiser::AdvertiseError;
use crate::advertiser::Advertiser;
use crate::advertiser::SharedServices;
use crate::multicast;
use crate::resolver::family_of;
use crate::service::Service;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// An advertiser serving in the background of its owner.
///
/// At most one serving unit exists per instance at a time.
pub trait ConcurrentAdvertiser {
    /// Returns once the socket is bound and the multicast groups are joined.
    fn start(&mut self) -> impl Future<Output = Result<(), AdvertiseError>> + Send;

    /// Returns once the serving unit has exited.
    fn stop(&mut self) -> impl Future<Output = Result<(), AdvertiseError>> + Send;

    /// Changes take effect before this returns, also while serving.
    fn add_services(
        &mut self,
        services: Vec<Service>,
    ) -> impl Future<Output = Result<(), AdvertiseError>> + Send;

    fn remove_service(
        &mut self,
        service: &Service,
    ) -> impl Future<Output = Result<(), AdvertiseError>> + Send;

    fn services(&self) -> Vec<Service>;

    fn is_running(&self) -> bool;
}

/// Serves on a spawned Tokio task.
pub struct TaskAdvertiser {
    advertiser: Arc<Advertiser<SharedServices>>,
    running: Option<Running>,
}

struct Running {
    token: CancellationToken,
    local_address: SocketAddr,
    task: JoinHandle<()>,
}

impl TaskAdvertiser {
    pub fn new(advertiser: Advertiser<SharedServices>) -> Self {
        Self {
            advertiser: Arc::new(advertiser),
            running: None,
        }
    }

    pub fn advertiser(&self) -> &Advertiser<SharedServices> {
        &self.advertiser
    }

    /// Address of the listening socket while serving.
    pub fn local_address(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_address)
    }
}

impl From<Advertiser<SharedServices>> for TaskAdvertiser {
    fn from(advertiser: Advertiser<SharedServices>) -> Self {
        Self::new(advertiser)
    }
}

impl ConcurrentAdvertiser for TaskAdvertiser {
    async fn start(&mut self) -> Result<(), AdvertiseError> {
        if self.running.is_some() {
            return Err(AdvertiseError::AlreadyStarted);
        }

        let (started_sender, started_receiver) = oneshot::channel();
        let token = CancellationToken::new();
        let task_token = token.clone();
        let advertiser = self.advertiser.clone();
        let task = tokio::spawn(async move {
            let framed = match advertiser.bind().await {
                Ok(framed) => framed,
                Err(e) => {
                    log::error!("Advertiser failed to start: {}", e);
                    let _ = started_sender.send(Err(e));
                    return;
                }
            };
            match framed.get_ref().local_addr() {
                Ok(local_address) => {
                    let _ = started_sender.send(Ok(local_address));
                }
                Err(e) => {
                    log::error!("Advertiser socket has no local address: {}", e);
                    let _ = started_sender.send(Err(AdvertiseError::Bind(e)));
                    return;
                }
            }
            advertiser.serve(framed, &task_token).await;
        });

        match started_receiver.await {
            Ok(Ok(local_address)) => {
                self.running = Some(Running {
                    token,
                    local_address,
                    task,
                });
                Ok(())
            }
            Ok(Err(e)) => {
                task.await?;
                Err(e)
            }
            Err(_) => match task.await {
                Ok(()) => Err(AdvertiseError::Aborted),
                Err(e) => Err(e.into()),
            },
        }
    }

    async fn stop(&mut self) -> Result<(), AdvertiseError> {
        let running = self.running.take().ok_or(AdvertiseError::NotStarted)?;
        running.token.cancel();

        let family = family_of(&running.local_address);
        if let Err(e) = multicast::send_wake(family, running.local_address.port()).await {
            log::debug!("Failed to wake up the advertiser: {}", e);
        }

        running.task.await?;
        Ok(())
    }

    async fn add_services(&mut self, services: Vec<Service>) -> Result<(), AdvertiseError> {
        self.advertiser.services().extend(services);
        Ok(())
    }

    async fn remove_service(&mut self, service: &Service) -> Result<(), AdvertiseError> {
        self.advertiser.services().remove(service);
        Ok(())
    }

    fn services(&self) -> Vec<Service> {
        self.advertiser.services().snapshot()
    }

    fn is_running(&self) -> bool {
        self.running.is_some()
    }
}

impl Drop for TaskAdvertiser {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.token.cancel();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::AdvertiserConfig;
    use crate::config::SeekerConfig;
    use crate::seeker::Seeker;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_millis(500);

    fn loopback_advertiser(name: &str, services: Vec<Service>) -> TaskAdvertiser {
        let config = AdvertiserConfig::default()
            .with_port(0)
            .with_multicast_addresses(Vec::new());
        Advertiser::new(SharedServices::new(services), Some(name.into()))
            .unwrap()
            .with_config(config)
            .into()
    }

    fn loopback_seeker(port: u16, service_type: &str) -> Seeker {
        let config = SeekerConfig::default()
            .with_port(port)
            .with_query_addresses(vec!["127.0.0.1".into()])
            .with_fallback_addresses(Vec::new())
            .with_timeout(Some(TIMEOUT));
        Seeker::new(service_type, "", "").unwrap().with_config(config)
    }

    fn running_port(advertiser: &TaskAdvertiser) -> u16 {
        advertiser.local_address().unwrap().port()
    }

    #[tokio::test]
    async fn seek_one_service() {
        crate::test::init();

        let service = Service::new("T", "1234", "", "somewhere").unwrap();
        let mut advertiser = loopback_advertiser("aname", vec![service]);
        advertiser.start().await.unwrap();
        let port = running_port(&advertiser);

        // When
        let mut seeker = loopback_seeker(port, "T");
        seeker.run().await.unwrap();
        let mut other_seeker = loopback_seeker(port, "other");
        other_seeker.run().await.unwrap();

        // Then
        let found: Vec<_> = seeker.results().iter().collect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].advertiser_name, "aname");
        assert_eq!(found[0].service_type, "T");
        assert_eq!(found[0].port, "1234");
        assert_eq!(found[0].location, "somewhere");
        assert!(found[0].address.is_loopback());
        assert!(other_seeker.results().is_empty());

        advertiser.stop().await.unwrap();
    }

    #[tokio::test]
    async fn nothing_after_stop() {
        crate::test::init();

        let mut advertiser =
            loopback_advertiser("aname", vec![Service::unnamed("T", "1").unwrap()]);
        advertiser.start().await.unwrap();
        let port = running_port(&advertiser);

        // When
        advertiser.stop().await.unwrap();

        // Then
        assert!(!advertiser.is_running());
        let mut seeker = loopback_seeker(port, "");
        seeker.run().await.unwrap();
        assert!(seeker.results().is_empty());
    }

    #[tokio::test]
    async fn restart() {
        crate::test::init();

        let mut advertiser =
            loopback_advertiser("aname", vec![Service::unnamed("T", "1").unwrap()]);

        advertiser.start().await.unwrap();
        advertiser.stop().await.unwrap();
        advertiser.start().await.unwrap();
        let port = running_port(&advertiser);

        let mut seeker = loopback_seeker(port, "T");
        seeker.run().await.unwrap();
        assert_eq!(seeker.results().len(), 1);

        advertiser.stop().await.unwrap();
    }

    #[tokio::test]
    async fn lifecycle_errors() {
        crate::test::init();

        let mut advertiser = loopback_advertiser("aname", Vec::new());

        assert!(matches!(
            advertiser.stop().await.unwrap_err(),
            AdvertiseError::NotStarted
        ));
        advertiser.start().await.unwrap();
        assert!(matches!(
            advertiser.start().await.unwrap_err(),
            AdvertiseError::AlreadyStarted
        ));
        advertiser.stop().await.unwrap();
    }

    #[tokio::test]
    async fn join_failure_reaches_start() {
        crate::test::init();

        let config = AdvertiserConfig::default()
            .with_port(0)
            .with_multicast_addresses(vec!["127.0.0.1".into()])
            .with_ignore_unavailable(false);
        let mut advertiser: TaskAdvertiser = Advertiser::new(SharedServices::default(), None)
            .unwrap()
            .with_config(config)
            .into();

        // When
        let e = advertiser.start().await.unwrap_err();

        // Then
        assert!(matches!(e, AdvertiseError::Join { .. }));
        assert!(!advertiser.is_running());
    }

    #[tokio::test]
    async fn change_services_while_serving() {
        crate::test::init();

        let mut advertiser = loopback_advertiser("aname", Vec::new());
        advertiser.start().await.unwrap();
        let port = running_port(&advertiser);
        let service = Service::new("T", "1", "late", "").unwrap();

        // When
        advertiser.add_services(vec![service.clone()]).await.unwrap();

        // Then
        let mut seeker = loopback_seeker(port, "T");
        seeker.run().await.unwrap();
        assert_eq!(seeker.results().len(), 1);

        // When
        advertiser.remove_service(&service).await.unwrap();

        // Then
        seeker.reset("T", "", "").unwrap();
        seeker.run().await.unwrap();
        assert!(seeker.results().is_empty());
        assert!(advertiser.services().is_empty());

        advertiser.stop().await.unwrap();
    }

    #[tokio::test]
    async fn union_of_two_advertisers() {
        crate::test::init();

        if !crate::test::multicast_available().await {
            println!("Multicast unavailable, skipping");
            return;
        }

        let port = std::net::UdpSocket::bind("0.0.0.0:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let multicast_advertiser = |name: &str, service_port: &str| -> TaskAdvertiser {
            Advertiser::new(
                SharedServices::new(vec![Service::unnamed("T", service_port).unwrap()]),
                Some(name.into()),
            )
            .unwrap()
            .with_config(AdvertiserConfig::default().with_port(port))
            .into()
        };
        let mut first = multicast_advertiser("first", "1");
        let mut second = multicast_advertiser("second", "2");
        first.start().await.unwrap();
        second.start().await.unwrap();

        // When
        let mut seeker = Seeker::new("T", "", "").unwrap().with_config(
            SeekerConfig::default()
                .with_port(port)
                .with_fallback_addresses(Vec::new())
                .with_timeout(Some(TIMEOUT)),
        );
        seeker.run().await.unwrap();

        // Then
        let mut found: Vec<_> = seeker
            .results()
            .iter()
            .map(|s| (s.advertiser_name.as_str(), s.port.as_str()))
            .collect();
        found.dedup();
        assert_eq!(found, vec![("first", "1"), ("second", "2")]);

        first.stop().await.unwrap();
        second.stop().await.unwrap();
    }
}
