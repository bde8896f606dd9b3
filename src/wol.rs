//! Wake-on-LAN magic packets, used to power on devices whose network
//! stack is asleep (LG TVs accept no TCP connection while off).

use crate::error::{LinkError, Result};
use log::{debug, warn};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;
use tokio::net::UdpSocket;

pub const DEFAULT_WOL_PORT: u16 = 7;
const MAC_REPEAT: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Six bytes of 0xFF followed by the address sixteen times.
    pub fn magic_packet(&self) -> Vec<u8> {
        let mut packet = vec![0xFF; 6];
        for _ in 0..MAC_REPEAT {
            packet.extend_from_slice(&self.0);
        }
        packet
    }
}

/// Accepts `aa:bb:cc:dd:ee:ff`, `aa-bb-cc-dd-ee-ff` or twelve bare hex digits.
impl FromStr for MacAddress {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let digits: String = match s.len() {
            17 => {
                let sep = s.as_bytes()[2];
                if sep != b':' && sep != b'-' {
                    return Err(LinkError::Config(format!("invalid MAC address '{}'", s)));
                }
                s.split(sep as char).collect()
            }
            12 => s.to_string(),
            _ => return Err(LinkError::Config(format!("invalid MAC address '{}'", s))),
        };
        let bytes = hex::decode(&digits).map_err(|_| LinkError::Config(format!("invalid MAC address '{}'", s)))?;
        let octets: [u8; 6] = bytes
            .try_into()
            .map_err(|_| LinkError::Config(format!("invalid MAC address '{}'", s)))?;
        Ok(Self(octets))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|b| format!("{:02x}", b)).collect();
        f.write_str(&parts.join(":"))
    }
}

fn broadcast_socket() -> Result<UdpSocket> {
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    if let Err(e) = socket.set_broadcast(true) {
        warn!("Failed to enable broadcast for WOL socket: {}", e);
    }
    socket.bind(&SockAddr::from(addr))?;
    socket.set_nonblocking(true)?;
    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

/// Broadcasts a magic packet for `mac` to 255.255.255.255:`port`.
pub async fn wake(mac: &MacAddress, port: u16) -> Result<()> {
    wake_at(mac, SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, port))).await
}

/// Sends a magic packet to an explicit (directed broadcast or unicast) address.
pub async fn wake_at(mac: &MacAddress, target: SocketAddr) -> Result<()> {
    let socket = broadcast_socket()?;
    let packet = mac.magic_packet();
    let sent = socket.send_to(&packet, target).await?;
    debug!("Sent WOL packet for {} to {} ({} bytes)", mac, target, sent);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_notations() {
        let expected = MacAddress([0x00, 0x1e, 0x06, 0x33, 0xa1, 0xff]);
        for text in ["00:1e:06:33:a1:ff", "00-1E-06-33-A1-FF", "001e0633a1ff"] {
            assert_eq!(text.parse::<MacAddress>().unwrap(), expected);
        }
        assert_eq!(expected.to_string(), "00:1e:06:33:a1:ff");
        assert!("00:1e:06:33:a1".parse::<MacAddress>().is_err());
        assert!("00:1e:06:33:a1:zz".parse::<MacAddress>().is_err());
        assert!("00.1e.06.33.a1.ff".parse::<MacAddress>().is_err());
    }

    #[test]
    fn magic_packet_layout() {
        let mac: MacAddress = "01:02:03:04:05:06".parse().unwrap();
        let packet = mac.magic_packet();
        assert_eq!(packet.len(), 6 + 6 * 16);
        assert!(packet[..6].iter().all(|b| *b == 0xFF));
        assert!(packet[6..].chunks(6).all(|c| c == [1, 2, 3, 4, 5, 6]));
    }

    #[tokio::test]
    async fn sends_to_a_local_listener() {
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        let mac: MacAddress = "aa:bb:cc:dd:ee:ff".parse().unwrap();

        wake_at(&mac, target).await.unwrap();
        let mut buf = [0u8; 128];
        let (n, _) = listener.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], mac.magic_packet().as_slice());
    }
}
