//! Direct media connections to remote participants.
//!
//! [`registry::PeerLinkRegistry`] keys one [`peer_link::PeerLink`] per remote participant by
//! the participant's current transport id. The connection itself sits behind [`MediaLink`] so
//! the registry can be driven by [`webrtc_link::WebRTCConnector`] or by any other connector.

pub mod peer_link;
pub mod registry;
pub mod webrtc_link;

use std::sync::Arc;

use async_trait::async_trait;
use derivative::Derivative;
use tokio::sync::mpsc;
use webrtc::{
    ice_transport::ice_candidate::RTCIceCandidateInit,
    peer_connection::{
        peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, signaling_state::RTCSignalingState,
    },
    track::track_remote::TrackRemote,
};

use crate::{error::Error, media::LocalTrack};

/// Events raised by connection callbacks. They carry the link id rather than the transport id,
/// so they stay valid when a link is rebound to a new transport id.
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub enum LinkEvent {
    TrackReceived {
        link_id: String,
        #[derivative(Debug = "ignore")]
        track: Arc<TrackRemote>,
    },
    NegotiationNeeded {
        link_id: String,
    },
    IceCandidate {
        link_id: String,
        candidate: RTCIceCandidateInit,
    },
    StateChanged {
        link_id: String,
        state: RTCPeerConnectionState,
    },
}

impl LinkEvent {
    pub fn link_id(&self) -> &str {
        match self {
            LinkEvent::TrackReceived { link_id, .. }
            | LinkEvent::NegotiationNeeded { link_id }
            | LinkEvent::IceCandidate { link_id, .. }
            | LinkEvent::StateChanged { link_id, .. } => link_id,
        }
    }
}

/// One direct media connection.
#[async_trait]
pub trait MediaLink: Send + Sync {
    /// Creates an offer and applies it as the local description.
    async fn create_offer(&self) -> Result<RTCSessionDescription, Error>;
    /// Creates an answer for the applied remote offer and applies it as the local description.
    async fn create_answer(&self) -> Result<RTCSessionDescription, Error>;
    async fn set_remote_description(&self, desc: RTCSessionDescription) -> Result<(), Error>;
    async fn has_remote_description(&self) -> bool;
    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), Error>;
    fn signaling_state(&self) -> RTCSignalingState;
    fn connection_state(&self) -> RTCPeerConnectionState;
    /// Sends `track` on this link. An existing sender of the same kind is reused.
    /// Returns true when a new sender had to be added.
    async fn attach_track(&self, track: &LocalTrack) -> Result<bool, Error>;
    async fn close(&self) -> Result<(), Error>;
}

/// Allocates [`MediaLink`]s whose callbacks report to `events`.
#[async_trait]
pub trait MediaConnector: Send + Sync {
    async fn connect(
        &self,
        link_id: &str,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn MediaLink>, Error>;
}
