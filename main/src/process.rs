use crate::advertiser::advertiser_name;
use crate::advertiser::AdvertiseError;
use crate::concurrent::ConcurrentAdvertiser;
use crate::concurrent::TaskAdvertiser;
use crate::config::AdvertiserConfig;
use crate::service::Service;
use anyhow::Context;
use futures_util::StreamExt;
use serde::Deserialize;
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncBufRead;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::ChildStdin;
use tokio::process::ChildStdout;
use tokio::process::Command;
use tokio_stream::wrappers::LinesStream;

/// Owner to child, one JSON object per line.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(tag = "command", rename_all = "snake_case")]
enum ChildCommand {
    SetServices { services: Vec<Service> },
    Stop,
}

/// Child to owner, one JSON object per line.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
enum ChildEvent {
    Started { local_address: SocketAddr },
    Failed { message: String },
    Ack,
    Stopped,
}

/// Serves in a child process running `<program> child ...`.
///
/// The child owns its copy of the service list. Every change is acknowledged
/// by the child before the changing call returns.
pub struct ProcessAdvertiser {
    program: PathBuf,
    name: String,
    config: AdvertiserConfig,
    services: Vec<Service>,
    child: Option<ChildHandle>,
}

struct ChildHandle {
    process: Child,
    stdin: ChildStdin,
    events: LinesStream<BufReader<ChildStdout>>,
    local_address: SocketAddr,
}

impl ChildHandle {
    async fn send(&mut self, command: &ChildCommand) -> Result<(), ProcessError> {
        let mut line = serde_json::to_vec(command)?;
        line.push(b'\n');
        self.stdin.write_all(&line).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<ChildEvent, ProcessError> {
        let line = self.events.next().await.ok_or(ProcessError::ChildExited)??;
        Ok(serde_json::from_str(&line)?)
    }

    async fn request(
        &mut self,
        command: &ChildCommand,
        expected: ChildEvent,
    ) -> Result<(), ProcessError> {
        self.send(command).await?;
        match self.receive().await? {
            event if event == expected => Ok(()),
            ChildEvent::Failed { message } => Err(ProcessError::ChildFailed(message)),
            event => Err(ProcessError::UnexpectedEvent(format!("{:?}", event))),
        }
    }
}

impl ProcessAdvertiser {
    /// `program` must call [`host_child`] when run with the `child` subcommand.
    pub fn new(
        program: impl Into<PathBuf>,
        services: Vec<Service>,
        name: Option<String>,
    ) -> Result<Self, AdvertiseError> {
        Ok(Self {
            program: program.into(),
            name: advertiser_name(name)?,
            config: Default::default(),
            services,
            child: None,
        })
    }

    pub fn with_config(mut self, config: AdvertiserConfig) -> Self {
        self.config = config;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address of the child's listening socket while serving.
    pub fn local_address(&self) -> Option<SocketAddr> {
        self.child.as_ref().map(|c| c.local_address)
    }

    async fn spawn(&self) -> Result<ChildHandle, ProcessError> {
        let mut process = Command::new(&self.program)
            .arg("child")
            .arg("--name")
            .arg(&self.name)
            .arg("--config")
            .arg(serde_json::to_string(&self.config)?)
            .arg("--services")
            .arg(serde_json::to_string(&self.services)?)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(ProcessError::ChildProcessCreation)?;

        let stdin = process.stdin.take().ok_or(ProcessError::RedirectStdIo)?;
        let stdout = process.stdout.take().ok_or(ProcessError::RedirectStdIo)?;
        let mut child = ChildHandle {
            process,
            stdin,
            events: LinesStream::new(BufReader::new(stdout).lines()),
            local_address: SocketAddr::from(([0, 0, 0, 0], 0)),
        };

        match child.receive().await? {
            ChildEvent::Started { local_address } => {
                log::info!(
                    "Advertiser process {:?} serving at {}",
                    child.process.id(),
                    local_address
                );
                child.local_address = local_address;
                Ok(child)
            }
            ChildEvent::Failed { message } => {
                child.process.wait().await?;
                Err(ProcessError::ChildFailed(message))
            }
            event => Err(ProcessError::UnexpectedEvent(format!("{:?}", event))),
        }
    }

    async fn set_services(&mut self, services: Vec<Service>) -> Result<(), AdvertiseError> {
        if let Some(child) = &mut self.child {
            let command = ChildCommand::SetServices {
                services: services.clone(),
            };
            child.request(&command, ChildEvent::Ack).await?;
        }
        self.services = services;
        Ok(())
    }
}

impl ConcurrentAdvertiser for ProcessAdvertiser {
    async fn start(&mut self) -> Result<(), AdvertiseError> {
        if self.child.is_some() {
            return Err(AdvertiseError::AlreadyStarted);
        }
        self.child = Some(self.spawn().await?);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), AdvertiseError> {
        let mut child = self.child.take().ok_or(AdvertiseError::NotStarted)?;
        if let Err(e) = child
            .request(&ChildCommand::Stop, ChildEvent::Stopped)
            .await
        {
            log::error!("Advertiser process did not stop cleanly, killing it: {}", e);
            if let Err(kill_error) = child.process.kill().await {
                log::warn!("Failed to kill the advertiser process: {}", kill_error);
            }
            return Err(e.into());
        }

        let ChildHandle {
            mut process, stdin, ..
        } = child;
        drop(stdin);
        let status = process.wait().await.map_err(ProcessError::from)?;
        if !status.success() {
            return Err(ProcessError::ExternalCommand.into());
        }
        Ok(())
    }

    async fn add_services(&mut self, services: Vec<Service>) -> Result<(), AdvertiseError> {
        let mut updated = self.services.clone();
        updated.extend(services);
        self.set_services(updated).await
    }

    async fn remove_service(&mut self, service: &Service) -> Result<(), AdvertiseError> {
        let mut updated = self.services.clone();
        updated.retain(|s| s != service);
        self.set_services(updated).await
    }

    fn services(&self) -> Vec<Service> {
        self.services.clone()
    }

    fn is_running(&self) -> bool {
        self.child.is_some()
    }
}

/// Runs the child side of a [`ProcessAdvertiser`].
///
/// Reads commands from `input` and reports to `output` until told to stop or
/// until `input` ends.
pub async fn host_child<R, W>(
    mut advertiser: TaskAdvertiser,
    input: R,
    mut output: W,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if let Err(e) = advertiser.start().await {
        let e = anyhow::Error::from(e);
        let message = format!("{:#}", e);
        write_event(&mut output, &ChildEvent::Failed { message }).await?;
        return Err(e);
    }
    let local_address = advertiser
        .local_address()
        .context("Advertiser started without an address")?;
    write_event(&mut output, &ChildEvent::Started { local_address }).await?;

    let mut commands = LinesStream::new(input.lines());
    while let Some(line) = commands.next().await {
        let command = match serde_json::from_str(&line?) {
            Ok(command) => command,
            Err(e) => {
                let message = format!("Invalid command: {}", e);
                write_event(&mut output, &ChildEvent::Failed { message }).await?;
                continue;
            }
        };
        match command {
            ChildCommand::SetServices { services } => {
                log::debug!("Now advertising {} services", services.len());
                advertiser.advertiser().services().replace(services);
                write_event(&mut output, &ChildEvent::Ack).await?;
            }
            ChildCommand::Stop => break,
        }
    }

    advertiser.stop().await?;
    write_event(&mut output, &ChildEvent::Stopped).await?;
    Ok(())
}

async fn write_event(output: &mut (impl AsyncWrite + Unpin), event: &ChildEvent) -> anyhow::Result<()> {
    let mut line = serde_json::to_vec(event)?;
    line.push(b'\n');
    output.write_all(&line).await?;
    output.flush().await?;
    Ok(())
}

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed in create a child process")]
    ChildProcessCreation(#[source] std::io::Error),

    #[error("Failed to redirect standard I/O")]
    RedirectStdIo,

    #[error("Error in communication with the child process")]
    Io(#[from] std::io::Error),

    #[error("Invalid message from or to the child process")]
    Json(#[from] serde_json::Error),

    #[error("Child process exited unexpectedly")]
    ChildExited,

    #[error("Child process failed: {0}")]
    ChildFailed(String),

    #[error("Unexpected event from the child process: {0}")]
    UnexpectedEvent(String),

    #[error("External command failed")]
    ExternalCommand,
}
