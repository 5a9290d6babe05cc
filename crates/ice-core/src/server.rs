//! STUN/TURN server descriptions

use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::error::{IceError, Result};

/// Port used when a server setting does not name one
pub const STANDARD_STUN_PORT: u16 = 3478;

/// Which protocol gathering should use against the configured server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IceProtocol {
    /// Server-reflexive discovery only; never authenticates
    Stun,
    /// Relay allocation; authenticates with the server credentials
    #[default]
    Turn,
}

/// One STUN/TURN server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl ServerInfo {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            username: None,
            password: None,
        }
    }

    /// Attach TURN credentials
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Parse an `address[:port]` setting.
    ///
    /// IPv6 literals carrying a port must be bracketed (`[2001:db8::1]:3478`).
    /// A bare IPv6 literal is taken as an address without port.
    pub fn parse(setting: &str) -> Result<Self> {
        let setting = setting.trim();
        if setting.is_empty() {
            return Err(IceError::invalid_parameter("empty server address"));
        }

        if let Some(rest) = setting.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| IceError::invalid_parameter(format!("unterminated IPv6 literal: {}", setting)))?;
            let port = match tail.strip_prefix(':') {
                Some(p) => parse_port(p)?,
                None if tail.is_empty() => STANDARD_STUN_PORT,
                None => return Err(IceError::invalid_parameter(format!("bad server setting: {}", setting))),
            };
            return Ok(Self::new(host, port));
        }

        if setting.parse::<IpAddr>().is_ok() {
            return Ok(Self::new(setting, STANDARD_STUN_PORT));
        }

        match setting.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => Ok(Self::new(host, parse_port(port)?)),
            Some(_) => Err(IceError::invalid_parameter(format!("missing host in: {}", setting))),
            None => Ok(Self::new(setting, STANDARD_STUN_PORT)),
        }
    }

    /// Host part, ready for the resolver
    pub fn host(&self) -> &str {
        &self.address
    }
}

fn parse_port(port: &str) -> Result<u16> {
    port.parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| IceError::invalid_parameter(format!("invalid port: {}", port)))
}

/// Engine-facing server configuration for one gathering attempt.
///
/// Built from a resolved address plus the owning `ServerInfo`; credentials are
/// cloned in only for TURN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunServerConfig {
    pub address: SocketAddr,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Resolution already happened on our side
    pub skip_srv_lookup: bool,
}

impl StunServerConfig {
    pub fn for_attempt(ip: IpAddr, server: &ServerInfo, protocol: IceProtocol) -> Self {
        let (username, password) = match protocol {
            IceProtocol::Turn => match &server.username {
                Some(user) if !user.is_empty() => (
                    Some(user.clone()),
                    server.password.clone().filter(|p| !p.is_empty()),
                ),
                _ => (None, None),
            },
            IceProtocol::Stun => (None, None),
        };

        Self {
            address: SocketAddr::new(ip, server.port),
            username,
            password,
            skip_srv_lookup: true,
        }
    }
}
