//! ICE candidate types and the `a=candidate` attribute parser
//!
//! Format (RFC 8839): `<foundation> <component-id> <transport> <priority>
//! <conn-addr> <port> typ <cand-type> [raddr <raddr>] [rport <rport>] *(extensions)`

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::error::{IceError, Result};

/// Candidate type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CandidateType {
    /// Engine could not classify the candidate
    Undefined,
    Host,
    ServerReflexive,
    PeerReflexive,
    Relayed,
}

impl CandidateType {
    /// SDP token for the type (`host`, `srflx`, `prflx`, `relay`)
    pub fn sdp_token(self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Host => "host",
            Self::ServerReflexive => "srflx",
            Self::PeerReflexive => "prflx",
            Self::Relayed => "relay",
        }
    }

    pub fn from_sdp_token(token: &str) -> Option<Self> {
        match token {
            "host" => Some(Self::Host),
            "srflx" => Some(Self::ServerReflexive),
            "prflx" => Some(Self::PeerReflexive),
            "relay" => Some(Self::Relayed),
            _ => None,
        }
    }
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sdp_token())
    }
}

/// Candidate transport protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportProtocol {
    Udp,
    Tcp,
}

/// Component within a media stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentId {
    Rtp,
    Rtcp,
}

impl ComponentId {
    pub fn as_u32(self) -> u32 {
        match self {
            Self::Rtp => 1,
            Self::Rtcp => 2,
        }
    }

    pub fn from_u32(id: u32) -> Option<Self> {
        match id {
            1 => Some(Self::Rtp),
            2 => Some(Self::Rtcp),
            _ => None,
        }
    }
}

/// Parsed `a=candidate` value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateAttribute {
    pub foundation: String,
    pub component_id: u32,
    pub transport: TransportProtocol,
    pub priority: u32,
    pub address: IpAddr,
    pub port: u16,
    pub candidate_type: CandidateType,
    pub related_address: Option<String>,
    pub related_port: Option<u16>,
    pub extensions: Vec<(String, Option<String>)>,
}

impl CandidateAttribute {
    /// Parse the value part of an `a=candidate:` line
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        let value = value.strip_prefix("candidate:").unwrap_or(value);
        let parts: Vec<&str> = value.split_whitespace().collect();

        if parts.len() < 8 {
            return Err(IceError::invalid_parameter(format!(
                "Invalid candidate format, insufficient parts: {}",
                value
            )));
        }

        let foundation = parts[0].to_string();

        let component_id = match parts[1].parse::<u32>() {
            Ok(id) if (1..=256).contains(&id) => id,
            _ => {
                return Err(IceError::invalid_parameter(format!(
                    "Invalid component ID in candidate: {}",
                    parts[1]
                )))
            }
        };

        let transport = match parts[2].to_ascii_uppercase().as_str() {
            "UDP" => TransportProtocol::Udp,
            "TCP" => TransportProtocol::Tcp,
            other => {
                return Err(IceError::invalid_parameter(format!(
                    "Invalid transport in candidate: {}",
                    other
                )))
            }
        };

        let priority = parts[3].parse::<u32>().map_err(|_| {
            IceError::invalid_parameter(format!("Invalid priority in candidate: {}", parts[3]))
        })?;

        let address = parts[4].parse::<IpAddr>().map_err(|_| {
            IceError::invalid_parameter(format!("Invalid connection address in candidate: {}", parts[4]))
        })?;

        let port = parts[5].parse::<u16>().map_err(|_| {
            IceError::invalid_parameter(format!("Invalid port in candidate: {}", parts[5]))
        })?;

        if parts[6] != "typ" {
            return Err(IceError::invalid_parameter(format!(
                "Expected 'typ' keyword in candidate, found: {}",
                parts[6]
            )));
        }

        let candidate_type = CandidateType::from_sdp_token(parts[7])
            .ok_or_else(|| IceError::invalid_parameter(format!("Invalid candidate type: {}", parts[7])))?;

        let mut idx = 8;
        let mut related_address = None;
        let mut related_port = None;
        let mut extensions = Vec::new();

        while idx < parts.len() {
            match parts[idx] {
                "raddr" => {
                    idx += 1;
                    let addr = parts
                        .get(idx)
                        .ok_or_else(|| IceError::invalid_parameter("raddr keyword without address"))?;
                    related_address = Some(addr.to_string());
                }
                "rport" => {
                    idx += 1;
                    let port = parts
                        .get(idx)
                        .ok_or_else(|| IceError::invalid_parameter("rport keyword without port"))?;
                    related_port = Some(port.parse::<u16>().map_err(|_| {
                        IceError::invalid_parameter(format!("Invalid related port in candidate: {}", port))
                    })?);
                }
                key => {
                    let mut ext_value = None;
                    if idx + 1 < parts.len() && !["raddr", "rport", "typ"].contains(&parts[idx + 1]) {
                        ext_value = Some(parts[idx + 1].to_string());
                        idx += 1;
                    }
                    extensions.push((key.to_string(), ext_value));
                }
            }
            idx += 1;
        }

        Ok(Self {
            foundation,
            component_id,
            transport,
            priority,
            address,
            port,
            candidate_type,
            related_address,
            related_port,
            extensions,
        })
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    pub fn component(&self) -> Option<ComponentId> {
        ComponentId::from_u32(self.component_id)
    }
}

/// Replace the `raddr` of a candidate value with `0.0.0.0`.
///
/// The rest of the value is kept byte for byte; text after the old address
/// shifts to close the gap. Fails when the candidate carries no `raddr`.
pub fn redact_candidate_raddr(value: &mut String) -> Result<()> {
    const MARKER: &str = " raddr ";

    let start = value
        .find(MARKER)
        .map(|pos| pos + MARKER.len())
        .ok_or_else(|| IceError::invalid_parameter("candidate has no raddr to redact"))?;

    let end = value[start..]
        .find(' ')
        .map(|len| start + len)
        .unwrap_or(value.len());

    if end == start {
        return Err(IceError::invalid_parameter("candidate raddr is empty"));
    }

    value.replace_range(start..end, crate::constants::REDACTED_RADDR);
    Ok(())
}
