//! Negotiated media transports handed to call control

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::candidate::CandidateType;
use crate::engine::TransportHandle;
use crate::sdp::{MediaType, Sdp};

/// How a media transport reaches the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MediaTransportKind {
    #[default]
    Unknown,
    Host,
    Reflexive,
    Relayed,
    PeerReflexive,
}

impl From<CandidateType> for MediaTransportKind {
    fn from(t: CandidateType) -> Self {
        match t {
            CandidateType::Undefined => Self::Unknown,
            CandidateType::Host => Self::Host,
            CandidateType::ServerReflexive => Self::Reflexive,
            CandidateType::Relayed => Self::Relayed,
            CandidateType::PeerReflexive => Self::PeerReflexive,
        }
    }
}

/// Local RTP/RTCP transports for one media type
#[derive(Debug, Clone, Default)]
pub struct MediaTransports {
    pub rtp: Option<TransportHandle>,
    pub rtcp: Option<TransportHandle>,
    /// False when `rtcp` is the RTP transport shared under rtcp-mux
    pub rtcp_owned: bool,
    pub rtp_local: Option<SocketAddr>,
    pub rtp_remote: Option<SocketAddr>,
    pub rtcp_local: Option<SocketAddr>,
    pub rtcp_remote: Option<SocketAddr>,
    pub rtp_kind: MediaTransportKind,
    pub rtcp_kind: MediaTransportKind,
    pub rtcp_mux: bool,
    pub valid: bool,
}

/// Remote RTP/RTCP addresses for one media type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaAddresses {
    pub rtp: Option<SocketAddr>,
    pub rtcp: Option<SocketAddr>,
    pub valid: bool,
}

/// Nominated local transports and remote addresses for one media type
#[derive(Debug, Clone, Default)]
pub struct NominatedMedia {
    pub local: MediaTransports,
    pub remote: MediaAddresses,
}

/// Raw ICE SDP attribute blocks
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IceSdpAttributes {
    /// Message-scope attributes (`ice-ufrag`, `ice-pwd`, `ice-options`, ...)
    pub message: Sdp,
    /// One block per media stream, in stream order
    pub media: Vec<Sdp>,
}

/// Everything `nominations_get` hands back
#[derive(Debug, Clone, Default)]
pub struct NominatedTransports {
    pub audio: NominatedMedia,
    pub text: NominatedMedia,
    pub video: NominatedMedia,
    pub attributes: Option<IceSdpAttributes>,
}

impl NominatedTransports {
    pub fn get(&self, media: MediaType) -> Option<&NominatedMedia> {
        match media {
            MediaType::Audio => Some(&self.audio),
            MediaType::Text => Some(&self.text),
            MediaType::Video => Some(&self.video),
            MediaType::Other => None,
        }
    }

    pub(crate) fn get_mut(&mut self, media: MediaType) -> Option<&mut NominatedMedia> {
        match media {
            MediaType::Audio => Some(&mut self.audio),
            MediaType::Text => Some(&mut self.text),
            MediaType::Video => Some(&mut self.video),
            MediaType::Other => None,
        }
    }
}

/// Default (non-ICE) transports per media type
#[derive(Debug, Clone, Default)]
pub struct DefaultTransports {
    pub audio: MediaTransports,
    pub text: MediaTransports,
    pub video: MediaTransports,
}

impl DefaultTransports {
    pub fn get(&self, media: MediaType) -> Option<&MediaTransports> {
        match media {
            MediaType::Audio => Some(&self.audio),
            MediaType::Text => Some(&self.text),
            MediaType::Video => Some(&self.video),
            MediaType::Other => None,
        }
    }

    pub(crate) fn get_mut(&mut self, media: MediaType) -> Option<&mut MediaTransports> {
        match media {
            MediaType::Audio => Some(&mut self.audio),
            MediaType::Text => Some(&mut self.text),
            MediaType::Video => Some(&mut self.video),
            MediaType::Other => None,
        }
    }
}

/// Host RTP/RTCP addresses for one media type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentAddresses {
    pub rtp: Option<SocketAddr>,
    pub rtcp: Option<SocketAddr>,
}

/// Host addresses for SDP generation before gathering completes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalAddresses {
    pub audio: ComponentAddresses,
    pub text: ComponentAddresses,
    pub video: ComponentAddresses,
}

impl LocalAddresses {
    pub fn get(&self, media: MediaType) -> Option<&ComponentAddresses> {
        match media {
            MediaType::Audio => Some(&self.audio),
            MediaType::Text => Some(&self.text),
            MediaType::Video => Some(&self.video),
            MediaType::Other => None,
        }
    }

    pub(crate) fn get_mut(&mut self, media: MediaType) -> Option<&mut ComponentAddresses> {
        match media {
            MediaType::Audio => Some(&mut self.audio),
            MediaType::Text => Some(&mut self.text),
            MediaType::Video => Some(&mut self.video),
            MediaType::Other => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_from_candidate_type() {
        assert_eq!(MediaTransportKind::from(CandidateType::Relayed), MediaTransportKind::Relayed);
        assert_eq!(MediaTransportKind::from(CandidateType::ServerReflexive), MediaTransportKind::Reflexive);
        assert_eq!(MediaTransportKind::from(CandidateType::Undefined), MediaTransportKind::Unknown);
    }

    #[test]
    fn other_media_has_no_slot() {
        let mut local = LocalAddresses::default();
        assert!(local.get_mut(MediaType::Other).is_none());
        assert!(local.get_mut(MediaType::Text).is_some());
    }
}
