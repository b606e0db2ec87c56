use crate::resolver::family_of;
use minusconf_protocol::address;
use minusconf_protocol::address::AddressFamily;
use minusconf_protocol::address::AddressParseError;
use minusconf_protocol::Frame;
use socket2::Domain;
use socket2::Protocol;
use socket2::SockRef;
use socket2::Socket;
use socket2::Type;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;
use std::net::SocketAddr;
use std::net::UdpSocket as StdUdpSocket;
use thiserror::Error;
use tokio::net::UdpSocket;

/// Binds a UDP socket to `port` on the wildcard address.
///
/// The socket is dual-stack IPv6 where the host allows it, so that it also
/// talks to IPv4 peers through mapped addresses. Hosts without IPv6 get an
/// IPv4 socket.
pub fn bind_endpoint(port: u16, reuse_address: bool) -> std::io::Result<UdpSocket> {
    let (socket, family) = new_socket()?;
    socket.set_reuse_address(reuse_address)?;
    let bind_address = SocketAddr::new(unspecified_ip(family), port);
    socket.bind(&bind_address.into())?;
    log::debug!("Bound UDP socket at {}", bind_address);
    new_async_socket(socket)
}

pub fn socket_family(socket: &UdpSocket) -> std::io::Result<AddressFamily> {
    Ok(family_of(&socket.local_addr()?))
}

/// Adds `socket` to the multicast group `group` on the default interface.
pub fn join_group(
    socket: &UdpSocket,
    family: AddressFamily,
    group: &str,
) -> Result<(), MulticastError> {
    match family {
        AddressFamily::Ipv4 => {
            let group_ip = Ipv4Addr::from(address::parse_ipv4(group)?);
            socket.join_multicast_v4(group_ip, Ipv4Addr::UNSPECIFIED)?;
        }
        AddressFamily::Ipv6 => {
            let group_ip = Ipv6Addr::from(address::parse_ipv6(group)?);
            socket.join_multicast_v6(&group_ip, 0)?;
        }
    }
    log::info!("Joined multicast group {}", group);
    Ok(())
}

/// Sets the TTL (hop limit) of outgoing multicast packets. `None` keeps the
/// system default.
pub fn configure_sender_ttl(socket: &UdpSocket, ttl: Option<u32>) -> std::io::Result<()> {
    let Some(ttl) = ttl else {
        return Ok(());
    };

    let socket_ref = SockRef::from(socket);
    match socket_family(socket)? {
        AddressFamily::Ipv4 => socket_ref.set_multicast_ttl_v4(ttl),
        AddressFamily::Ipv6 => {
            socket_ref.set_multicast_hops_v6(ttl)?;

            // Mapped IPv4 groups go out with the IPv4 option.
            if let Err(e) = socket_ref.set_multicast_ttl_v4(ttl) {
                log::debug!("IPv4 multicast TTL unsupported on this socket: {}", e);
            }
            Ok(())
        }
    }
}

/// Sends an `EMPTY` packet to `port` on the loopback address of `family`.
pub async fn send_wake(family: AddressFamily, port: u16) -> std::io::Result<()> {
    let loopback = match family {
        AddressFamily::Ipv4 => IpAddr::V4(Ipv4Addr::LOCALHOST),
        AddressFamily::Ipv6 => IpAddr::V6(Ipv6Addr::LOCALHOST),
    };
    let socket = UdpSocket::bind(SocketAddr::new(loopback, 0)).await?;
    socket
        .send_to(
            &Frame::empty("stop").to_bytes(),
            SocketAddr::new(loopback, port),
        )
        .await?;
    Ok(())
}

fn new_socket() -> std::io::Result<(Socket, AddressFamily)> {
    match Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP)) {
        Ok(socket) => {
            if let Err(e) = socket.set_only_v6(false) {
                log::debug!("Dual-stack sockets unsupported, IPv4 peers unreachable: {}", e);
            }
            Ok((socket, AddressFamily::Ipv6))
        }
        Err(e) => {
            log::debug!("IPv6 sockets unavailable, falling back to IPv4: {}", e);
            let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
            Ok((socket, AddressFamily::Ipv4))
        }
    }
}

fn new_async_socket(socket: Socket) -> std::io::Result<UdpSocket> {
    socket.set_nonblocking(true)?;
    let socket: StdUdpSocket = socket.into();
    UdpSocket::from_std(socket)
}

fn unspecified_ip(family: AddressFamily) -> IpAddr {
    match family {
        AddressFamily::Ipv4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        AddressFamily::Ipv6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

#[derive(Error, Debug)]
pub enum MulticastError {
    #[error("Invalid multicast group address")]
    InvalidAddress(#[from] AddressParseError),

    #[error("Error in socket configuration")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::BytesMut;
    use minusconf_protocol::FrameCodec;
    use minusconf_protocol::Opcode;
    use tokio_util::codec::Decoder;

    #[tokio::test]
    async fn bind_ephemeral_port() -> anyhow::Result<()> {
        crate::test::init();

        // When
        let socket = bind_endpoint(0, false)?;

        // Then
        let local_address = socket.local_addr()?;
        assert_ne!(local_address.port(), 0);
        assert!(local_address.ip().is_unspecified());

        Ok(())
    }

    #[tokio::test]
    async fn reuse_port() -> anyhow::Result<()> {
        crate::test::init();

        let first = bind_endpoint(0, true)?;
        let port = first.local_addr()?.port();

        // When
        let second = bind_endpoint(port, true)?;

        // Then
        assert_eq!(second.local_addr()?.port(), port);

        Ok(())
    }

    #[tokio::test]
    async fn invalid_group() -> anyhow::Result<()> {
        crate::test::init();

        let socket = bind_endpoint(0, false)?;

        // When
        let e = join_group(&socket, AddressFamily::Ipv4, "239.45.99.300").unwrap_err();

        // Then
        assert!(matches!(e, MulticastError::InvalidAddress(_)));

        Ok(())
    }

    #[tokio::test]
    async fn configure_ttl() -> anyhow::Result<()> {
        crate::test::init();

        let socket = bind_endpoint(0, false)?;

        configure_sender_ttl(&socket, Some(4))?;
        configure_sender_ttl(&socket, None)?;

        Ok(())
    }

    #[tokio::test]
    async fn wake_reaches_endpoint() -> anyhow::Result<()> {
        crate::test::init();

        let socket = bind_endpoint(0, false)?;
        let family = socket_family(&socket)?;
        let port = socket.local_addr()?.port();

        // When
        send_wake(family, port).await?;

        // Then
        let mut buffer = [0; 64];
        let (size, _) = socket.recv_from(&mut buffer).await?;
        let frame = FrameCodec
            .decode(&mut BytesMut::from(&buffer[..size]))?
            .expect("Wake packet must be protocol traffic");
        assert_eq!(frame.opcode, Opcode::Empty);

        Ok(())
    }
}
