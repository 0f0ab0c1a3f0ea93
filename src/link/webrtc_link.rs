use std::sync::Arc;

use async_trait::async_trait;
use derivative::Derivative;
use enclose::enc;
use tokio::sync::mpsc;
use webrtc::{
    api::{
        interceptor_registry::register_default_interceptors, media_engine::MediaEngine,
        APIBuilder, API,
    },
    ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
    interceptor::registry::Registry,
    peer_connection::{
        peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, signaling_state::RTCSignalingState,
        RTCPeerConnection,
    },
    rtp_transceiver::{
        rtp_codec::RTPCodecType, rtp_receiver::RTCRtpReceiver, RTCRtpTransceiver,
    },
    track::track_remote::TrackRemote,
};

use crate::{
    config::WebRTCTransportConfig,
    error::{Error, LinkErrorKind},
    link::{LinkEvent, MediaConnector, MediaLink},
    media::{LocalTrack, MediaKind},
};

/// [`MediaConnector`] backed by [`webrtc::peer_connection::RTCPeerConnection`].
#[derive(Derivative)]
#[derivative(Debug)]
pub struct WebRTCConnector {
    #[derivative(Debug = "ignore")]
    api: API,
    config: WebRTCTransportConfig,
}

impl WebRTCConnector {
    pub fn new(config: WebRTCTransportConfig) -> Result<Self, Error> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api, config })
    }
}

#[async_trait]
impl MediaConnector for WebRTCConnector {
    async fn connect(
        &self,
        link_id: &str,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn MediaLink>, Error> {
        let peer_connection = self
            .api
            .new_peer_connection(self.config.configuration.clone())
            .await?;
        let link = WebRTCLink {
            id: link_id.to_owned(),
            peer_connection: Arc::new(peer_connection),
        };
        link.hooks(events);
        Ok(Arc::new(link))
    }
}

/// This handles [`webrtc::peer_connection::RTCPeerConnection`] methods for one peer link.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct WebRTCLink {
    pub id: String,
    #[derivative(Debug = "ignore")]
    peer_connection: Arc<RTCPeerConnection>,
}

impl WebRTCLink {
    fn hooks(&self, events: mpsc::UnboundedSender<LinkEvent>) {
        let peer = self.peer_connection.clone();
        let link_id = self.id.clone();

        peer.on_ice_candidate(Box::new(enc!((events, link_id) move |candidate: Option<RTCIceCandidate>| {
            Box::pin(enc!((events, link_id) async move {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = events.send(LinkEvent::IceCandidate { link_id, candidate: init });
                        }
                        Err(err) => tracing::error!("failed to serialize ICE candidate: {}", err),
                    }
                }
            }))
        })));

        peer.on_negotiation_needed(Box::new(enc!((events, link_id) move || {
            Box::pin(enc!((events, link_id) async move {
                tracing::debug!("on negotiation needed in PeerLink {}", link_id);
                let _ = events.send(LinkEvent::NegotiationNeeded { link_id });
            }))
        })));

        peer.on_track(Box::new(enc!((events, link_id)
            move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                Box::pin(enc!((events, link_id) async move {
                    tracing::info!("Track received: link={}, track_id={}, kind={}", link_id, track.id(), track.kind());
                    let _ = events.send(LinkEvent::TrackReceived { link_id, track });
                }))
            }
        )));

        peer.on_peer_connection_state_change(Box::new(enc!((events, link_id) move |state: RTCPeerConnectionState| {
            Box::pin(enc!((events, link_id) async move {
                tracing::debug!("PeerLink {} connection state changed: {}", link_id, state);
                let _ = events.send(LinkEvent::StateChanged { link_id, state });
            }))
        })));
    }

    async fn local_description(&self) -> Result<RTCSessionDescription, Error> {
        match self.peer_connection.local_description().await {
            Some(desc) => Ok(desc),
            None => Err(Error::new_link(
                "Failed to set local description".to_string(),
                LinkErrorKind::LocalDescriptionError,
            )),
        }
    }
}

fn codec_type(kind: MediaKind) -> RTPCodecType {
    match kind {
        MediaKind::Audio => RTPCodecType::Audio,
        MediaKind::Video => RTPCodecType::Video,
    }
}

#[async_trait]
impl MediaLink for WebRTCLink {
    async fn create_offer(&self) -> Result<RTCSessionDescription, Error> {
        let offer = self.peer_connection.create_offer(None).await?;
        self.peer_connection.set_local_description(offer).await?;
        self.local_description().await
    }

    async fn create_answer(&self) -> Result<RTCSessionDescription, Error> {
        let answer = self.peer_connection.create_answer(None).await?;
        self.peer_connection.set_local_description(answer).await?;
        self.local_description().await
    }

    async fn set_remote_description(&self, desc: RTCSessionDescription) -> Result<(), Error> {
        self.peer_connection.set_remote_description(desc).await?;
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.peer_connection.remote_description().await.is_some()
    }

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), Error> {
        self.peer_connection.add_ice_candidate(candidate).await?;
        Ok(())
    }

    fn signaling_state(&self) -> RTCSignalingState {
        self.peer_connection.signaling_state()
    }

    fn connection_state(&self) -> RTCPeerConnectionState {
        self.peer_connection.connection_state()
    }

    async fn attach_track(&self, track: &LocalTrack) -> Result<bool, Error> {
        let kind = codec_type(track.kind);
        for sender in self.peer_connection.get_senders().await {
            if let Some(current) = sender.track().await {
                if current.kind() == kind {
                    if current.id() != track.id() {
                        sender.replace_track(Some(track.track_local())).await?;
                        tracing::debug!("PeerLink {} replaced {} track", self.id, track.kind);
                    }
                    return Ok(false);
                }
            }
        }

        let sender = self.peer_connection.add_track(track.track_local()).await?;
        // Read incoming RTCP so interceptors keep working.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(true)
    }

    async fn close(&self) -> Result<(), Error> {
        self.peer_connection.close().await?;
        Ok(())
    }
}

impl Drop for WebRTCLink {
    fn drop(&mut self) {
        tracing::debug!("WebRTCLink {} is dropped", self.id);
    }
}
