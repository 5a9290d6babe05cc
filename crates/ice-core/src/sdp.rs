//! Minimal SDP data holder consumed by the negotiation engine
//!
//! Parsing and rendering full session descriptions belong to the signaling
//! layer. This module only carries what ICE negotiation reads and writes:
//! connection addresses, media ordering, ports, and attribute lists.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Media kinds the call engine routes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaType {
    Audio,
    Video,
    Text,
    Other,
}

impl MediaType {
    pub fn from_media_str(media: &str) -> Self {
        match media.to_ascii_lowercase().as_str() {
            "audio" => Self::Audio,
            "video" => Self::Video,
            "text" => Self::Text,
            _ => Self::Other,
        }
    }
}

/// One `a=` attribute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpAttribute {
    pub name: String,
    pub value: Option<String>,
}

impl SdpAttribute {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }

    pub fn flag(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
        }
    }

    /// Parse a single `a=name[:value]` line; other lines yield `None`
    pub fn parse_line(line: &str) -> Option<Self> {
        let body = line.trim().strip_prefix("a=")?;
        if body.is_empty() {
            return None;
        }
        Some(match body.split_once(':') {
            Some((name, value)) => Self::new(name, value),
            None => Self::flag(body),
        })
    }

    pub fn is_candidate(&self) -> bool {
        self.name == "candidate"
    }
}

impl fmt::Display for SdpAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "a={}:{}", self.name, value),
            None => write!(f, "a={}", self.name),
        }
    }
}

/// One `m=` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaDescription {
    /// Media token as written (`audio`, `video`, `text`, ...)
    pub media: String,
    pub port: u16,
    /// Media-level `c=` address
    pub connection: Option<String>,
    /// Port from `a=rtcp`, if present
    pub rtcp_port: Option<u16>,
    pub attributes: Vec<SdpAttribute>,
}

impl MediaDescription {
    pub fn new(media: impl Into<String>, port: u16) -> Self {
        Self {
            media: media.into(),
            port,
            connection: None,
            rtcp_port: None,
            attributes: Vec::new(),
        }
    }

    pub fn with_connection(mut self, address: impl Into<String>) -> Self {
        self.connection = Some(address.into());
        self
    }

    pub fn with_rtcp_port(mut self, port: u16) -> Self {
        self.rtcp_port = Some(port);
        self
    }

    pub fn with_attribute(mut self, attribute: SdpAttribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn media_type(&self) -> MediaType {
        MediaType::from_media_str(&self.media)
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.iter().any(|a| a.name == name)
    }

    pub fn attribute(&self, name: &str) -> Option<&SdpAttribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn candidates(&self) -> impl Iterator<Item = &str> {
        self.attributes
            .iter()
            .filter(|a| a.is_candidate())
            .filter_map(|a| a.value.as_deref())
    }
}

/// Session description
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sdp {
    /// Session-level `c=` address
    pub connection: Option<String>,
    pub attributes: Vec<SdpAttribute>,
    pub media: Vec<MediaDescription>,
}

impl Sdp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connection(mut self, address: impl Into<String>) -> Self {
        self.connection = Some(address.into());
        self
    }

    pub fn with_attribute(mut self, attribute: SdpAttribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn with_media(mut self, media: MediaDescription) -> Self {
        self.media.push(media);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.connection.is_none() && self.attributes.is_empty() && self.media.is_empty()
    }

    /// Media description at an SDP index
    pub fn media_descriptor(&self, index: usize) -> Option<&MediaDescription> {
        self.media.get(index)
    }

    /// Whether the first media section of this type carries the attribute
    pub fn media_type_contains_attribute(&self, media: &str, attribute: &str) -> bool {
        self.media
            .iter()
            .find(|m| m.media.eq_ignore_ascii_case(media))
            .map(|m| m.has_attribute(attribute))
            .unwrap_or(false)
    }

    /// Build a description from attribute lines only (used for ICE attribute blocks)
    pub fn from_attribute_block(block: &str) -> Self {
        Self {
            attributes: block.lines().filter_map(SdpAttribute::parse_line).collect(),
            ..Self::default()
        }
    }
}
