//! Proxy-aware transport factory. Resolves a proxy record into a dialer the
//! protocol adapters use to open raw connections; no state is persisted.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;

use crate::mailbox::MailError;
use crate::models::proxy::{Proxy, ProxyProtocol};

#[derive(Debug, Clone, Default)]
pub struct Dialer {
    proxy: Option<Proxy>,
}

impl Dialer {
    pub fn direct() -> Self {
        Self { proxy: None }
    }

    /// Build a dialer through a proxy, validating its shape first.
    pub fn via(proxy: Proxy) -> Result<Self, MailError> {
        if proxy.host.trim().is_empty() {
            return Err(MailError::ProxyConfig("proxy host is empty".into()));
        }
        if proxy.port == 0 {
            return Err(MailError::ProxyConfig("proxy port is zero".into()));
        }
        if proxy.password.is_some() && proxy.username.is_none() {
            return Err(MailError::ProxyConfig(
                "proxy password set without a username".into(),
            ));
        }
        Ok(Self { proxy: Some(proxy) })
    }

    /// Open a TCP connection to `host:port`, tunneling through the configured
    /// proxy when one is set.
    pub async fn dial(&self, host: &str, port: u16) -> Result<TcpStream, MailError> {
        match &self.proxy {
            None => TcpStream::connect((host, port))
                .await
                .map_err(|e| MailError::Connection(format!("connect {host}:{port}: {e}"))),
            Some(proxy) => match proxy.protocol {
                ProxyProtocol::Socks5 => self.dial_socks5(proxy, host, port).await,
                ProxyProtocol::Http => self.dial_http_connect(proxy, host, port).await,
            },
        }
    }

    async fn dial_socks5(
        &self,
        proxy: &Proxy,
        host: &str,
        port: u16,
    ) -> Result<TcpStream, MailError> {
        let proxy_addr = (proxy.host.as_str(), proxy.port);
        let stream = match (&proxy.username, &proxy.password) {
            (Some(user), Some(pass)) => {
                Socks5Stream::connect_with_password(proxy_addr, (host, port), user, pass).await
            }
            _ => Socks5Stream::connect(proxy_addr, (host, port)).await,
        }
        .map_err(|e| MailError::ProxyUnreachable(format!("socks5 {}: {e}", proxy.host)))?;
        Ok(stream.into_inner())
    }

    async fn dial_http_connect(
        &self,
        proxy: &Proxy,
        host: &str,
        port: u16,
    ) -> Result<TcpStream, MailError> {
        let mut stream = TcpStream::connect((proxy.host.as_str(), proxy.port))
            .await
            .map_err(|e| MailError::ProxyUnreachable(format!("http {}: {e}", proxy.host)))?;

        let mut request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n");
        if let (Some(user), Some(pass)) = (&proxy.username, &proxy.password) {
            use base64::Engine;
            let token =
                base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
            request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
        }
        request.push_str("\r\n");
        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|e| MailError::ProxyUnreachable(e.to_string()))?;

        // Read the CONNECT response head only; the tunnel bytes follow.
        let mut head = Vec::with_capacity(256);
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            if head.len() > 8192 {
                return Err(MailError::ProxyUnreachable(
                    "oversized CONNECT response".into(),
                ));
            }
            let n = stream
                .read(&mut byte)
                .await
                .map_err(|e| MailError::ProxyUnreachable(e.to_string()))?;
            if n == 0 {
                return Err(MailError::ProxyUnreachable(
                    "proxy closed during CONNECT".into(),
                ));
            }
            head.push(byte[0]);
        }
        let status_line = String::from_utf8_lossy(&head);
        let status_line = status_line.lines().next().unwrap_or_default();
        if !status_line.contains(" 200") {
            return Err(MailError::ProxyUnreachable(format!(
                "CONNECT rejected: {status_line}"
            )));
        }
        Ok(stream)
    }

    /// Connectivity check against the proxy endpoint itself, bounded by
    /// `timeout`. A direct dialer has nothing to probe and always passes.
    pub async fn probe(&self, timeout: Duration) -> Result<(), MailError> {
        let Some(proxy) = &self.proxy else {
            return Ok(());
        };
        let connect = TcpStream::connect((proxy.host.as_str(), proxy.port));
        match tokio::time::timeout(timeout, connect).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(MailError::ProxyUnreachable(format!(
                "{}:{}: {e}",
                proxy.host, proxy.port
            ))),
            Err(_) => Err(MailError::ProxyUnreachable(format!(
                "{}:{}: no response within {}s",
                proxy.host,
                proxy.port,
                timeout.as_secs()
            ))),
        }
    }

    /// Map the same proxy onto reqwest for the REST-style adapters.
    pub fn reqwest_proxy(&self) -> Result<Option<reqwest::Proxy>, MailError> {
        let Some(proxy) = &self.proxy else {
            return Ok(None);
        };
        let scheme = match proxy.protocol {
            ProxyProtocol::Socks5 => "socks5",
            ProxyProtocol::Http => "http",
        };
        let url = format!("{scheme}://{}:{}", proxy.host, proxy.port);
        let mut out = reqwest::Proxy::all(&url)
            .map_err(|e| MailError::ProxyConfig(format!("{url}: {e}")))?;
        if let (Some(user), Some(pass)) = (&proxy.username, &proxy.password) {
            out = out.basic_auth(user, pass);
        }
        Ok(Some(out))
    }
}
