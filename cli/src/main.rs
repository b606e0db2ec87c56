use anyhow::Context;
use clap::Args;
use clap::Parser;
use clap::Subcommand;
use minusconf::Advertiser;
use minusconf::AdvertiserConfig;
use minusconf::ConcurrentAdvertiser;
use minusconf::ProcessAdvertiser;
use minusconf::Seeker;
use minusconf::SeekerConfig;
use minusconf::SeekerListener;
use minusconf::Service;
use minusconf::ServiceAt;
use minusconf::SharedServices;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::BufReader;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    match cli.command {
        Command::Advertise {
            service_type,
            port,
            advertiser_name,
            service_name,
            location,
            process,
        } => {
            let service = Service::new(service_type, port, service_name, location)?;
            let config = cli.network.advertiser_config();
            if process {
                advertise_in_process(service, advertiser_name, config).await?
            } else {
                Advertiser::new(vec![service], advertiser_name)?
                    .with_config(config)
                    .run()
                    .await?
            }
        }
        Command::Seek {
            service_type,
            advertiser_name,
            service_name,
            timeout,
            forever,
        } => {
            let timeout =
                Duration::try_from_secs_f64(timeout).context("Invalid seeker timeout")?;
            let config = cli.network.seeker_config().with_timeout(Some(timeout));
            let mut seeker = Seeker::new(service_type, advertiser_name, service_name)?
                .with_config(config)
                .with_listener(PrintingListener);
            if forever {
                seeker.run_forever().await?
            } else {
                seeker.run().await?
            }
        }
        Command::Child {
            name,
            config,
            services,
        } => {
            let config: AdvertiserConfig =
                serde_json::from_str(&config).context("Invalid advertiser configuration")?;
            let services: Vec<Service> =
                serde_json::from_str(&services).context("Invalid service list")?;
            let advertiser = Advertiser::new(SharedServices::new(services), Some(name))?
                .with_config(config)
                .into();
            minusconf::host_child(
                advertiser,
                BufReader::new(tokio::io::stdin()),
                tokio::io::stdout(),
            )
            .await?
        }
    };
    Ok(())
}

/// Serves from a child process of this program until interrupted.
async fn advertise_in_process(
    service: Service,
    advertiser_name: Option<String>,
    config: AdvertiserConfig,
) -> anyhow::Result<()> {
    let program = std::env::current_exe().context("Failed to locate this program")?;
    let mut advertiser =
        ProcessAdvertiser::new(program, vec![service], advertiser_name)?.with_config(config);
    advertiser.start().await?;
    log::info!("Advertising {:?} until interrupted", advertiser.services());

    tokio::signal::ctrl_c().await?;
    advertiser.stop().await?;
    Ok(())
}

struct PrintingListener;

impl SeekerListener for PrintingListener {
    fn found(&mut self, service: &ServiceAt) {
        println!("Found {}", service);
    }

    fn error(&mut self, sender: SocketAddr, message: &str) {
        eprintln!("Error from {}: {}", sender, message);
    }
}

#[derive(Parser)]
#[command(about = "Service discovery over UDP multicast")]
struct Cli {
    #[command(flatten)]
    network: NetworkOptions,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct NetworkOptions {
    /// Port of the discovery protocol.
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Multicast group or host to use instead of the default groups.
    #[arg(long = "address", global = true)]
    addresses: Vec<String>,

    /// TTL of outgoing multicast queries.
    #[arg(long, global = true)]
    ttl: Option<u32>,
}

impl NetworkOptions {
    fn advertiser_config(&self) -> AdvertiserConfig {
        let mut config = AdvertiserConfig::default();
        if let Some(port) = self.port {
            config.port = port;
        }
        if !self.addresses.is_empty() {
            config.multicast_addresses = self.addresses.clone();
        }
        config
    }

    fn seeker_config(&self) -> SeekerConfig {
        let mut config = SeekerConfig::default().with_multicast_ttl(self.ttl);
        if let Some(port) = self.port {
            config.port = port;
        }
        if !self.addresses.is_empty() {
            config.query_addresses = self.addresses.clone();
        }
        config
    }
}

#[derive(Subcommand)]
enum Command {
    /// Advertises one service until interrupted.
    Advertise {
        service_type: String,
        #[arg(id = "service_port", value_name = "PORT")]
        port: String,
        advertiser_name: Option<String>,
        #[arg(default_value = "")]
        service_name: String,
        #[arg(default_value = "")]
        location: String,

        /// Serve from a child process.
        #[arg(long)]
        process: bool,
    },

    /// Looks for services.
    Seek {
        #[arg(default_value = "")]
        service_type: String,
        #[arg(default_value = "")]
        advertiser_name: String,
        #[arg(default_value = "")]
        service_name: String,

        /// Seconds to wait for replies.
        #[arg(long, default_value_t = 2.0)]
        timeout: f64,

        /// Wait for replies until interrupted.
        #[arg(long)]
        forever: bool,
    },

    #[command(hide = true)]
    Child {
        #[arg(long)]
        name: String,
        #[arg(long)]
        config: String,
        #[arg(long)]
        services: String,
    },
}
