use std::sync::Arc;

use derivative::Derivative;
use tokio::sync::Mutex;
use webrtc::{
    ice_transport::ice_candidate::RTCIceCandidateInit,
    peer_connection::{
        peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, signaling_state::RTCSignalingState,
    },
};

use crate::{
    error::{Error, LinkErrorKind},
    link::MediaLink,
    media::LocalTrack,
};

/// Direct media connection to one remote participant.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct PeerLink {
    pub id: String,
    pub(crate) remote_transport_id: String,
    pub remote_user_id: String,
    #[derivative(Debug = "ignore")]
    media: Arc<dyn MediaLink>,
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
    connection_state: RTCPeerConnectionState,
    local_tracks_attached: bool,
    negotiated: bool,
}

impl PeerLink {
    pub(crate) fn new(
        id: String,
        remote_transport_id: String,
        remote_user_id: String,
        media: Arc<dyn MediaLink>,
    ) -> Self {
        tracing::debug!(
            "PeerLink {} is created for user={} transport={}",
            id,
            remote_user_id,
            remote_transport_id
        );
        Self {
            id,
            remote_transport_id,
            remote_user_id,
            media,
            pending_candidates: Mutex::new(Vec::new()),
            connection_state: RTCPeerConnectionState::New,
            local_tracks_attached: false,
            negotiated: false,
        }
    }

    pub fn remote_transport_id(&self) -> &str {
        &self.remote_transport_id
    }

    pub fn connection_state(&self) -> RTCPeerConnectionState {
        self.connection_state
    }

    pub(crate) fn set_connection_state(&mut self, state: RTCPeerConnectionState) {
        self.connection_state = state;
    }

    pub fn signaling_state(&self) -> RTCSignalingState {
        self.media.signaling_state()
    }

    pub fn local_tracks_attached(&self) -> bool {
        self.local_tracks_attached
    }

    /// Whether the first offer/answer exchange of this link has completed.
    pub fn is_negotiated(&self) -> bool {
        self.negotiated
    }

    pub(crate) fn media(&self) -> &Arc<dyn MediaLink> {
        &self.media
    }

    pub(crate) async fn attach_tracks(&mut self, tracks: &[LocalTrack]) -> Result<(), Error> {
        for track in tracks {
            self.media.attach_track(track).await?;
        }
        self.local_tracks_attached = true;
        Ok(())
    }

    pub(crate) async fn offer(&self) -> Result<RTCSessionDescription, Error> {
        let state = self.media.signaling_state();
        if state != RTCSignalingState::Stable {
            return Err(Error::new_link(
                format!("Signaling state is {}", state),
                LinkErrorKind::SignalingStateInvalidError,
            ));
        }
        self.media.create_offer().await
    }

    pub(crate) async fn answer(
        &mut self,
        offer: RTCSessionDescription,
        tracks: &[LocalTrack],
    ) -> Result<RTCSessionDescription, Error> {
        let state = self.media.signaling_state();
        if state != RTCSignalingState::Stable {
            return Err(Error::new_link(
                format!("Signaling state is {}", state),
                LinkErrorKind::SignalingStateInvalidError,
            ));
        }
        tracing::debug!("PeerLink {} set remote offer", self.id);
        self.media.set_remote_description(offer).await?;
        self.flush_pending_candidates().await;
        if !self.local_tracks_attached {
            self.attach_tracks(tracks).await?;
        }
        let answer = self.media.create_answer().await?;
        self.negotiated = true;
        Ok(answer)
    }

    /// Applies the remote answer. Returns false when there is no local offer waiting for it.
    pub(crate) async fn apply_answer(&mut self, answer: RTCSessionDescription) -> Result<bool, Error> {
        let state = self.media.signaling_state();
        if state != RTCSignalingState::HaveLocalOffer {
            tracing::warn!(
                "PeerLink {} ignores remote answer in signaling state {}",
                self.id,
                state
            );
            return Ok(false);
        }
        self.media.set_remote_description(answer).await?;
        self.flush_pending_candidates().await;
        self.negotiated = true;
        Ok(true)
    }

    pub(crate) async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), Error> {
        if self.media.has_remote_description().await {
            tracing::debug!("Adding ICE candidate for {:#?}", candidate);
            self.media.add_ice_candidate(candidate).await?;
        } else {
            tracing::debug!("Pending ICE candidate for {:#?}", candidate);
            self.pending_candidates.lock().await.push(candidate);
        }
        Ok(())
    }

    async fn flush_pending_candidates(&self) {
        let mut pendings = self.pending_candidates.lock().await;
        for candidate in pendings.drain(..) {
            tracing::debug!("Adding pending ICE candidate: {:#?}", candidate);
            if let Err(err) = self.media.add_ice_candidate(candidate).await {
                tracing::error!("failed to add_ice_candidate: {}", err);
            }
        }
    }

    pub async fn pending_candidate_count(&self) -> usize {
        self.pending_candidates.lock().await.len()
    }

    pub(crate) async fn close(&self) -> Result<(), Error> {
        self.media.close().await
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        tracing::debug!("PeerLink {} is dropped", self.id);
    }
}
