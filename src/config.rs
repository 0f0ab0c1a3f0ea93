use std::time::Duration;

use derivative::Derivative;
use serde::{Deserialize, Serialize};
use webrtc::{
    ice_transport::ice_server::RTCIceServer, peer_connection::configuration::RTCConfiguration,
};

/// Configuration for [`crate::session::RoomSession`] and its mesh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// How long a freshly approved, non-host attendee waits before it starts dialing peers.
    /// Dialing is additionally gated on [`crate::media::LocalMedia`] being ready.
    pub dial_grace_period: Duration,
    /// Maximum number of ICE candidates kept for a transport id that has no link yet.
    pub orphan_candidate_limit: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            dial_grace_period: Duration::from_secs(4),
            orphan_candidate_limit: 64,
        }
    }
}

/// Configuration for [`webrtc::peer_connection::RTCPeerConnection`] created by [`crate::link::webrtc_link::WebRTCConnector`].
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct WebRTCTransportConfig {
    #[derivative(Debug = "ignore")]
    pub configuration: RTCConfiguration,
}

impl Default for WebRTCTransportConfig {
    fn default() -> Self {
        Self {
            configuration: RTCConfiguration {
                ice_servers: vec![RTCIceServer {
                    urls: vec!["stun:stun.l.google.com:19302".to_owned()],
                    ..Default::default()
                }],
                ..Default::default()
            },
        }
    }
}

/// Configuration for [`crate::recording::recorder::Recorder`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    /// Well-known key the persisted chunks are stored under.
    pub storage_key: String,
    /// Mime type of the finalized artifact.
    pub mime_type: String,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            storage_key: "recording_chunks_v1".to_owned(),
            mime_type: "video/webm".to_owned(),
        }
    }
}
