//! SOCKS5 (RFC 1928) with username/password auth (RFC 1929), CONNECT only

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::common::{Address, Metadata, Network, Result, Stream};
use crate::error::Error;

use super::{ProxyProtocol, Socks5Config};

const VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;

const METHOD_NONE: u8 = 0x00;
const METHOD_PASSWORD: u8 = 0x02;
const METHOD_UNACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCEEDED: u8 = 0x00;
const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

pub struct Socks5Protocol {
    config: Socks5Config,
}

impl Socks5Protocol {
    pub fn new(config: Socks5Config) -> Self {
        Self { config }
    }

    /// Method this server insists on
    fn method(&self) -> u8 {
        if self.config.accounts.is_empty() {
            METHOD_NONE
        } else {
            METHOD_PASSWORD
        }
    }

    /// Server side of the RFC 1929 sub-negotiation
    async fn authenticate(&self, stream: &mut Stream) -> Result<()> {
        if stream.read_u8().await? != AUTH_VERSION {
            return Err(Error::Protocol("invalid auth sub-negotiation version".into()));
        }
        let user = read_string(stream).await?;
        let pass = read_string(stream).await?;

        let accepted = self
            .config
            .accounts
            .iter()
            .any(|a| a.user == user && a.pass == pass);
        stream
            .write_all(&[AUTH_VERSION, if accepted { 0x00 } else { 0x01 }])
            .await?;

        if accepted {
            Ok(())
        } else {
            Err(Error::Protocol(format!("authentication failed for user '{}'", user)))
        }
    }
}

/// Reply carrying an unspecified IPv4 bound address
fn reply(code: u8) -> [u8; 10] {
    [VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0]
}

fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        REP_CMD_NOT_SUPPORTED => "command not supported",
        REP_ATYP_NOT_SUPPORTED => "address type not supported",
        _ => "unknown error",
    }
}

async fn read_string(stream: &mut Stream) -> Result<String> {
    let len = stream.read_u8().await? as usize;
    let mut bytes = vec![0u8; len];
    stream.read_exact(&mut bytes).await?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Read an address of type `atyp` followed by its port.
/// `None` means the type is unknown and nothing was consumed.
async fn read_address(stream: &mut Stream, atyp: u8) -> Result<Option<Address>> {
    let address = match atyp {
        ATYP_IPV4 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            Address::Socket(SocketAddr::new(Ipv4Addr::from(ip).into(), stream.read_u16().await?))
        }
        ATYP_IPV6 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            Address::Socket(SocketAddr::new(Ipv6Addr::from(ip).into(), stream.read_u16().await?))
        }
        ATYP_DOMAIN => {
            let domain = read_string(stream).await?;
            Address::Domain(domain, stream.read_u16().await?)
        }
        _ => return Ok(None),
    };
    Ok(Some(address))
}

fn encode_address(buf: &mut Vec<u8>, address: &Address) -> Result<()> {
    match address {
        Address::Socket(SocketAddr::V4(v4)) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&v4.ip().octets());
        }
        Address::Socket(SocketAddr::V6(v6)) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&v6.ip().octets());
        }
        Address::Domain(domain, _) => {
            let len = u8::try_from(domain.len())
                .map_err(|_| Error::InvalidAddress(format!("domain too long: {}", domain)))?;
            buf.push(ATYP_DOMAIN);
            buf.push(len);
            buf.extend_from_slice(domain.as_bytes());
        }
    }
    buf.extend_from_slice(&address.port().to_be_bytes());
    Ok(())
}

fn push_field(buf: &mut Vec<u8>, field: &str) -> Result<()> {
    let len = u8::try_from(field.len())
        .map_err(|_| Error::Protocol("credential longer than 255 bytes".into()))?;
    buf.push(len);
    buf.extend_from_slice(field.as_bytes());
    Ok(())
}

#[async_trait]
impl ProxyProtocol for Socks5Protocol {
    async fn inbound(&self, mut stream: Stream) -> Result<(Metadata, Stream)> {
        let version = stream.read_u8().await?;
        if version != VERSION {
            return Err(Error::Protocol(format!("unsupported SOCKS version {}", version)));
        }
        let mut methods = vec![0u8; stream.read_u8().await? as usize];
        stream.read_exact(&mut methods).await?;

        let method = self.method();
        if !methods.contains(&method) {
            stream.write_all(&[VERSION, METHOD_UNACCEPTABLE]).await?;
            return Err(Error::Protocol("no acceptable auth method".into()));
        }
        stream.write_all(&[VERSION, method]).await?;

        if method == METHOD_PASSWORD {
            self.authenticate(&mut stream).await?;
        }

        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await?;
        let [version, cmd, _, atyp] = header;
        if version != VERSION {
            return Err(Error::Protocol("invalid SOCKS version in request".into()));
        }

        let address = match read_address(&mut stream, atyp).await? {
            Some(address) => address,
            None => {
                stream.write_all(&reply(REP_ATYP_NOT_SUPPORTED)).await?;
                return Err(Error::Protocol(format!("unsupported address type {}", atyp)));
            }
        };

        if cmd != CMD_CONNECT {
            stream.write_all(&reply(REP_CMD_NOT_SUPPORTED)).await?;
            return Err(Error::Protocol(format!("unsupported command {}", cmd)));
        }

        stream.write_all(&reply(REP_SUCCEEDED)).await?;
        stream.flush().await?;

        Ok((Metadata::new(address).with_protocol("socks"), stream))
    }

    async fn outbound(&self, mut stream: Stream, metadata: &Metadata) -> Result<Stream> {
        if metadata.network != Network::Tcp {
            return Err(Error::Unsupported("SOCKS5 outbound only relays TCP".into()));
        }

        let account = self.config.accounts.first();
        let method = if account.is_some() { METHOD_PASSWORD } else { METHOD_NONE };
        stream.write_all(&[VERSION, 1, method]).await?;

        let mut choice = [0u8; 2];
        stream.read_exact(&mut choice).await?;
        match choice {
            [VERSION, METHOD_NONE] => {}
            [VERSION, METHOD_PASSWORD] => {
                let (user, pass) = account
                    .map(|a| (a.user.as_str(), a.pass.as_str()))
                    .unwrap_or(("", ""));
                let mut request = vec![AUTH_VERSION];
                push_field(&mut request, user)?;
                push_field(&mut request, pass)?;
                stream.write_all(&request).await?;

                let mut status = [0u8; 2];
                stream.read_exact(&mut status).await?;
                if status[1] != 0x00 {
                    return Err(Error::Protocol("server rejected credentials".into()));
                }
            }
            [VERSION, _] => return Err(Error::Protocol("server rejected auth methods".into())),
            _ => return Err(Error::Protocol("invalid SOCKS version from server".into())),
        }

        let mut request = vec![VERSION, CMD_CONNECT, 0x00];
        encode_address(&mut request, &metadata.destination)?;
        stream.write_all(&request).await?;

        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await?;
        let [version, rep, _, atyp] = header;
        if version != VERSION {
            return Err(Error::Protocol("invalid SOCKS version in reply".into()));
        }
        if rep != REP_SUCCEEDED {
            return Err(Error::Protocol(format!("SOCKS5 error: {}", reply_message(rep))));
        }

        // Bound address is not used
        if read_address(&mut stream, atyp).await?.is_none() {
            return Err(Error::Protocol(format!("unsupported bound address type {}", atyp)));
        }

        Ok(stream)
    }

    fn name(&self) -> &'static str {
        "socks"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Account;

    fn config(pass: &str) -> Socks5Config {
        Socks5Config {
            accounts: vec![Account {
                user: "alice".to_string(),
                pass: pass.to_string(),
            }],
        }
    }

    #[tokio::test]
    async fn test_outbound_to_inbound() {
        let (client, server) = tokio::io::duplex(4096);

        let server_task = tokio::spawn(async move {
            Socks5Protocol::new(config("secret"))
                .inbound(Box::new(server))
                .await
                .map(|(metadata, _)| metadata)
        });

        let metadata = Metadata::new(Address::domain("example.com", 443));
        Socks5Protocol::new(config("secret"))
            .outbound(Box::new(client), &metadata)
            .await
            .unwrap();

        let inbound = server_task.await.unwrap().unwrap();
        assert_eq!(inbound.destination, Address::domain("example.com", 443));
        assert_eq!(inbound.protocol, "socks");
    }

    #[tokio::test]
    async fn test_ipv6_destination() {
        let (client, server) = tokio::io::duplex(4096);
        let server_task = tokio::spawn(async move {
            Socks5Protocol::new(Socks5Config::default())
                .inbound(Box::new(server))
                .await
                .map(|(metadata, _)| metadata)
        });

        let destination = Address::Socket("[2001:db8::1]:8443".parse().unwrap());
        Socks5Protocol::new(Socks5Config::default())
            .outbound(Box::new(client), &Metadata::new(destination.clone()))
            .await
            .unwrap();

        assert_eq!(server_task.await.unwrap().unwrap().destination, destination);
    }

    #[tokio::test]
    async fn test_wrong_password_rejected() {
        let (client, server) = tokio::io::duplex(4096);

        let server_task = tokio::spawn(async move {
            Socks5Protocol::new(config("secret")).inbound(Box::new(server)).await.map(|_| ())
        });

        let metadata = Metadata::new(Address::domain("example.com", 443));
        let result = Socks5Protocol::new(config("wrong"))
            .outbound(Box::new(client), &metadata)
            .await;

        assert!(result.is_err());
        assert!(server_task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_bind_command_refused() {
        let (mut client, server) = tokio::io::duplex(4096);
        let server_task = tokio::spawn(async move {
            Socks5Protocol::new(Socks5Config::default())
                .inbound(Box::new(server))
                .await
                .map(|_| ())
        });

        client.write_all(&[VERSION, 1, METHOD_NONE]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [VERSION, METHOD_NONE]);

        // BIND to 127.0.0.1:80
        client
            .write_all(&[VERSION, 0x02, 0x00, ATYP_IPV4, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();
        let mut response = [0u8; 10];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(response[1], REP_CMD_NOT_SUPPORTED);
        assert!(server_task.await.unwrap().is_err());
    }
}
