use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use derivative::Derivative;
use tokio::sync::mpsc;
use uuid::Uuid;
use webrtc::{
    ice_transport::ice_candidate::RTCIceCandidateInit,
    peer_connection::{
        peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription,
    },
};

use crate::{
    error::{Error, LinkErrorKind},
    link::{peer_link::PeerLink, LinkEvent, MediaConnector},
    media::{LocalMedia, LocalTrack},
};

/// Keeps at most one [`PeerLink`] per remote participant, keyed by the participant's
/// current transport id.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct PeerLinkRegistry {
    links: HashMap<String, PeerLink>,
    orphan_candidates: HashMap<String, VecDeque<RTCIceCandidateInit>>,
    /// Transport ids with parked candidates, oldest first.
    orphan_order: VecDeque<String>,
    /// Bounds both the candidates parked per transport and the number of transports.
    orphan_limit: usize,
    #[derivative(Debug = "ignore")]
    connector: Arc<dyn MediaConnector>,
    #[derivative(Debug = "ignore")]
    media: LocalMedia,
    #[derivative(Debug = "ignore")]
    event_sender: mpsc::UnboundedSender<LinkEvent>,
}

impl PeerLinkRegistry {
    pub fn new(
        connector: Arc<dyn MediaConnector>,
        media: LocalMedia,
        event_sender: mpsc::UnboundedSender<LinkEvent>,
        orphan_limit: usize,
    ) -> Self {
        Self {
            links: HashMap::new(),
            orphan_candidates: HashMap::new(),
            orphan_order: VecDeque::new(),
            orphan_limit,
            connector,
            media,
            event_sender,
        }
    }

    /// Allocates a link to `remote_user_id` reachable at `remote_transport_id`.
    /// Fails with [`LinkErrorKind::AlreadyConnected`] when the transport id or the user already
    /// has a link; callers treat that as a no-op.
    pub async fn create_link(
        &mut self,
        remote_transport_id: &str,
        remote_user_id: &str,
    ) -> Result<String, Error> {
        if self.links.contains_key(remote_transport_id) {
            return Err(Error::new_link(
                format!("Transport {} is already connected", remote_transport_id),
                LinkErrorKind::AlreadyConnected,
            ));
        }
        if let Some(existing) = self.find_by_user(remote_user_id) {
            return Err(Error::new_link(
                format!(
                    "User {} is already connected via {}",
                    remote_user_id, existing.remote_transport_id
                ),
                LinkErrorKind::AlreadyConnected,
            ));
        }

        let id = Uuid::new_v4().to_string();
        let media = self
            .connector
            .connect(&id, self.event_sender.clone())
            .await?;
        let link = PeerLink::new(
            id.clone(),
            remote_transport_id.to_owned(),
            remote_user_id.to_owned(),
            media,
        );
        if let Some(orphans) = self.take_orphans(remote_transport_id) {
            tracing::debug!(
                "PeerLink {} adopts {} early ICE candidates",
                id,
                orphans.len()
            );
            for candidate in orphans {
                link.add_ice_candidate(candidate).await?;
            }
        }
        self.links.insert(remote_transport_id.to_owned(), link);
        Ok(id)
    }

    /// Attaches the local tracks if needed and creates an offer on the link.
    pub async fn offer_for(
        &mut self,
        remote_transport_id: &str,
    ) -> Result<RTCSessionDescription, Error> {
        let tracks = self.media.tracks().await;
        let link = self.get_mut_or_err(remote_transport_id)?;
        if !link.local_tracks_attached() {
            link.attach_tracks(&tracks).await?;
        }
        link.offer().await
    }

    /// Applies the remote offer, flushes buffered candidates and answers it.
    pub async fn answer_for(
        &mut self,
        remote_transport_id: &str,
        offer: RTCSessionDescription,
    ) -> Result<RTCSessionDescription, Error> {
        let tracks = self.media.tracks().await;
        let link = self.get_mut_or_err(remote_transport_id)?;
        link.answer(offer, &tracks).await
    }

    /// Applies a remote answer. Returns false when the link had no pending local offer.
    pub async fn apply_remote_answer(
        &mut self,
        remote_transport_id: &str,
        answer: RTCSessionDescription,
    ) -> Result<bool, Error> {
        let link = self.get_mut_or_err(remote_transport_id)?;
        link.apply_answer(answer).await
    }

    /// Adds a remote candidate. Candidates for an unknown transport id are parked, reported as
    /// [`LinkErrorKind::LinkNotFound`], and handed to the link if one is created later.
    pub async fn add_ice_candidate(
        &mut self,
        remote_transport_id: &str,
        candidate: RTCIceCandidateInit,
    ) -> Result<(), Error> {
        match self.links.get(remote_transport_id) {
            Some(link) => link.add_ice_candidate(candidate).await,
            None => {
                if !self.orphan_candidates.contains_key(remote_transport_id) {
                    self.orphan_order.push_back(remote_transport_id.to_owned());
                    while self.orphan_order.len() > self.orphan_limit {
                        if let Some(stale) = self.orphan_order.pop_front() {
                            tracing::debug!("dropping early ICE candidates for {}", stale);
                            self.orphan_candidates.remove(&stale);
                        }
                    }
                }
                let queue = self
                    .orphan_candidates
                    .entry(remote_transport_id.to_owned())
                    .or_default();
                if queue.len() >= self.orphan_limit {
                    queue.pop_front();
                }
                queue.push_back(candidate);
                Err(Error::new_link(
                    format!("No link for transport {}", remote_transport_id),
                    LinkErrorKind::LinkNotFound,
                ))
            }
        }
    }

    /// Sends `track` on every link, reusing senders of the same kind.
    pub async fn replace_track(&self, track: &LocalTrack) -> Result<(), Error> {
        for link in self.links.values() {
            let added = link.media().attach_track(track).await?;
            if added {
                tracing::debug!("PeerLink {} added a {} sender", link.id, track.kind);
            }
        }
        Ok(())
    }

    /// Moves the link of `user_id` to `new_transport_id` without touching its negotiation.
    /// Returns false when the user has no link.
    pub fn rebind(&mut self, user_id: &str, new_transport_id: &str) -> bool {
        let old_transport_id = match self.find_by_user(user_id) {
            Some(link) => link.remote_transport_id.clone(),
            None => return false,
        };
        if old_transport_id == new_transport_id {
            return true;
        }
        let Some(mut link) = self.links.remove(&old_transport_id) else {
            return false;
        };
        tracing::debug!(
            "PeerLink {} is rebound from {} to {}",
            link.id,
            old_transport_id,
            new_transport_id
        );
        link.remote_transport_id = new_transport_id.to_owned();
        self.take_orphans(&old_transport_id);
        if let Some(displaced) = self.links.insert(new_transport_id.to_owned(), link) {
            tracing::warn!(
                "PeerLink {} displaced by rebind to {}",
                displaced.id,
                new_transport_id
            );
            Self::close_detached(displaced);
        }
        if let Some(orphans) = self.take_orphans(new_transport_id) {
            if let Some(link) = self.links.get(new_transport_id) {
                let media = link.media().clone();
                tokio::spawn(async move {
                    for candidate in orphans {
                        if let Err(err) = media.add_ice_candidate(candidate).await {
                            tracing::error!("failed to add_ice_candidate: {}", err);
                        }
                    }
                });
            }
        }
        true
    }

    pub async fn remove_link(&mut self, remote_transport_id: &str) -> Result<(), Error> {
        let link = self.links.remove(remote_transport_id).ok_or_else(|| {
            Error::new_link(
                format!("No link for transport {}", remote_transport_id),
                LinkErrorKind::LinkNotFound,
            )
        })?;
        self.take_orphans(remote_transport_id);
        link.close().await
    }

    pub async fn close_all(&mut self) {
        for (_, link) in self.links.drain() {
            if let Err(err) = link.close().await {
                tracing::error!("failed to close PeerLink {}: {}", link.id, err);
            }
        }
        self.orphan_candidates.clear();
        self.orphan_order.clear();
    }

    fn take_orphans(
        &mut self,
        remote_transport_id: &str,
    ) -> Option<VecDeque<RTCIceCandidateInit>> {
        let orphans = self.orphan_candidates.remove(remote_transport_id)?;
        self.orphan_order.retain(|t| t != remote_transport_id);
        Some(orphans)
    }

    /// Records a connection state change and returns the link's transport id.
    pub(crate) fn set_connection_state(
        &mut self,
        link_id: &str,
        state: RTCPeerConnectionState,
    ) -> Option<String> {
        let link = self.links.values_mut().find(|l| l.id == link_id)?;
        link.set_connection_state(state);
        Some(link.remote_transport_id.clone())
    }

    pub fn get(&self, remote_transport_id: &str) -> Option<&PeerLink> {
        self.links.get(remote_transport_id)
    }

    pub fn get_by_id(&self, link_id: &str) -> Option<&PeerLink> {
        self.links.values().find(|l| l.id == link_id)
    }

    pub fn find_by_user(&self, user_id: &str) -> Option<&PeerLink> {
        self.links.values().find(|l| l.remote_user_id == user_id)
    }

    pub fn contains(&self, remote_transport_id: &str) -> bool {
        self.links.contains_key(remote_transport_id)
    }

    pub fn links(&self) -> impl Iterator<Item = &PeerLink> {
        self.links.values()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn orphan_count(&self, remote_transport_id: &str) -> usize {
        self.orphan_candidates
            .get(remote_transport_id)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    fn get_mut_or_err(&mut self, remote_transport_id: &str) -> Result<&mut PeerLink, Error> {
        self.links.get_mut(remote_transport_id).ok_or_else(|| {
            Error::new_link(
                format!("No link for transport {}", remote_transport_id),
                LinkErrorKind::LinkNotFound,
            )
        })
    }

    fn close_detached(link: PeerLink) {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(err) = link.close().await {
                    tracing::error!("failed to close PeerLink {}: {}", link.id, err);
                }
            });
        }
    }
}

impl Drop for PeerLinkRegistry {
    fn drop(&mut self) {
        for (_, link) in self.links.drain() {
            Self::close_detached(link);
        }
    }
}

#[cfg(test)]
mod tests {
    use webrtc::peer_connection::{sdp::sdp_type::RTCSdpType, signaling_state::RTCSignalingState};

    use super::*;
    use crate::link::mock::{description, MockConnector};

    fn candidate(value: &str) -> RTCIceCandidateInit {
        RTCIceCandidateInit {
            candidate: value.to_owned(),
            ..Default::default()
        }
    }

    fn registry(connector: Arc<MockConnector>) -> PeerLinkRegistry {
        let (sender, _) = mpsc::unbounded_channel();
        PeerLinkRegistry::new(connector, LocalMedia::new(), sender, 4)
    }

    #[tokio::test]
    async fn create_link_is_idempotent() {
        let connector = Arc::new(MockConnector::default());
        let mut registry = registry(connector.clone());
        registry.create_link("t1", "alice").await.unwrap();
        let again = registry.create_link("t1", "alice").await;
        assert_eq!(
            again.unwrap_err().link_kind(),
            Some(LinkErrorKind::AlreadyConnected)
        );
        assert_eq!(registry.len(), 1);
        assert_eq!(connector.connected(), 1);
    }

    #[tokio::test]
    async fn at_most_one_link_per_user() {
        let connector = Arc::new(MockConnector::default());
        let mut registry = registry(connector);
        registry.create_link("t1", "alice").await.unwrap();
        let other = registry.create_link("t2", "alice").await;
        assert_eq!(
            other.unwrap_err().link_kind(),
            Some(LinkErrorKind::AlreadyConnected)
        );
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn rebind_keeps_link_and_negotiation() {
        let connector = Arc::new(MockConnector::default());
        let mut registry = registry(connector.clone());
        let id = registry.create_link("t1", "alice").await.unwrap();
        registry.offer_for("t1").await.unwrap();

        assert!(registry.rebind("alice", "t2"));
        assert!(registry.get("t1").is_none());
        let link = registry.get("t2").unwrap();
        assert_eq!(link.id, id);
        assert_eq!(link.remote_transport_id(), "t2");
        assert_eq!(link.signaling_state(), RTCSignalingState::HaveLocalOffer);
        let mock = connector.link(&id).unwrap();
        assert_eq!(mock.offer_count(), 1);
        assert_eq!(connector.connected(), 1);

        let applied = registry
            .apply_remote_answer("t2", description(RTCSdpType::Answer, "answer"))
            .await
            .unwrap();
        assert!(applied);
        assert!(!registry.rebind("bob", "t3"));
    }

    #[tokio::test]
    async fn candidates_wait_for_remote_description() {
        let connector = Arc::new(MockConnector::default());
        let mut registry = registry(connector.clone());
        let id = registry.create_link("t1", "alice").await.unwrap();
        registry.add_ice_candidate("t1", candidate("c1")).await.unwrap();
        registry.add_ice_candidate("t1", candidate("c2")).await.unwrap();
        let mock = connector.link(&id).unwrap();
        assert!(mock.applied_candidates().is_empty());
        assert_eq!(registry.get("t1").unwrap().pending_candidate_count().await, 2);

        registry
            .answer_for("t1", description(RTCSdpType::Offer, "offer"))
            .await
            .unwrap();
        assert_eq!(mock.applied_candidates(), vec!["c1", "c2"]);
        registry.add_ice_candidate("t1", candidate("c3")).await.unwrap();
        assert_eq!(mock.applied_candidates(), vec!["c1", "c2", "c3"]);
        assert!(registry.get("t1").unwrap().is_negotiated());
    }

    #[tokio::test]
    async fn orphan_candidates_are_adopted() {
        let connector = Arc::new(MockConnector::default());
        let mut registry = registry(connector.clone());
        for n in 0..6 {
            let err = registry
                .add_ice_candidate("t9", candidate(&format!("c{}", n)))
                .await
                .unwrap_err();
            assert_eq!(err.link_kind(), Some(LinkErrorKind::LinkNotFound));
        }
        assert_eq!(registry.orphan_count("t9"), 4);

        let id = registry.create_link("t9", "carol").await.unwrap();
        assert_eq!(registry.orphan_count("t9"), 0);
        registry
            .answer_for("t9", description(RTCSdpType::Offer, "offer"))
            .await
            .unwrap();
        let mock = connector.link(&id).unwrap();
        assert_eq!(mock.applied_candidates(), vec!["c2", "c3", "c4", "c5"]);
    }

    #[tokio::test]
    async fn orphan_transports_are_bounded() {
        let connector = Arc::new(MockConnector::default());
        let mut registry = registry(connector);
        for n in 0..6 {
            let _ = registry
                .add_ice_candidate(&format!("t{}", n), candidate("c"))
                .await;
        }
        assert_eq!(registry.orphan_count("t0"), 0);
        assert_eq!(registry.orphan_count("t1"), 0);
        for n in 2..6 {
            assert_eq!(registry.orphan_count(&format!("t{}", n)), 1);
        }

        registry.create_link("t2", "alice").await.unwrap();
        assert_eq!(registry.orphan_count("t2"), 0);
        let _ = registry.add_ice_candidate("t6", candidate("c")).await;
        let _ = registry.add_ice_candidate("t7", candidate("c")).await;
        // t2 was adopted, so only t3 makes room for t7.
        assert_eq!(registry.orphan_count("t3"), 0);
        assert_eq!(registry.orphan_count("t4"), 1);
        assert_eq!(registry.orphan_count("t7"), 1);

        registry.remove_link("t2").await.unwrap();
        let _ = registry.add_ice_candidate("t2", candidate("late")).await;
        assert_eq!(registry.orphan_count("t4"), 0);
        assert_eq!(registry.orphan_count("t2"), 1);
        registry.close_all().await;
        assert_eq!(registry.orphan_count("t2"), 0);
        assert!(format!("{:?}", registry).contains("PeerLinkRegistry"));
    }

    #[tokio::test]
    async fn answer_outside_local_offer_is_ignored() {
        let connector = Arc::new(MockConnector::default());
        let mut registry = registry(connector);
        registry.create_link("t1", "alice").await.unwrap();
        let applied = registry
            .apply_remote_answer("t1", description(RTCSdpType::Answer, "late"))
            .await
            .unwrap();
        assert!(!applied);
        assert!(!registry.get("t1").unwrap().is_negotiated());
    }

    #[tokio::test]
    async fn replace_track_reuses_senders() {
        let connector = Arc::new(MockConnector::default());
        let (sender, _) = mpsc::unbounded_channel();
        let media = LocalMedia::new();
        let camera = LocalTrack::video("local");
        media.set_track(camera).await;
        let mut registry = PeerLinkRegistry::new(connector.clone(), media, sender, 4);
        let id = registry.create_link("t1", "alice").await.unwrap();
        registry.offer_for("t1").await.unwrap();

        let screen = LocalTrack::video("local");
        registry.replace_track(&screen).await.unwrap();
        let mock = connector.link(&id).unwrap();
        let tracks = mock.tracks.lock().unwrap().clone();
        assert_eq!(tracks, vec![format!("Video:{}", screen.id())]);

        let audio = LocalTrack::audio("local");
        registry.replace_track(&audio).await.unwrap();
        assert_eq!(mock.tracks.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn removed_link_is_recreated_fresh() {
        let connector = Arc::new(MockConnector::default());
        let mut registry = registry(connector.clone());
        let first = registry.create_link("t1", "alice").await.unwrap();
        registry.remove_link("t1").await.unwrap();
        assert!(registry.is_empty());
        assert_eq!(
            connector
                .link(&first)
                .unwrap()
                .closed
                .load(std::sync::atomic::Ordering::SeqCst),
            1
        );
        let second = registry.create_link("t1", "alice").await.unwrap();
        assert_ne!(first, second);

        registry.close_all().await;
        assert!(registry.is_empty());
        assert_eq!(
            registry.remove_link("t1").await.unwrap_err().link_kind(),
            Some(LinkErrorKind::LinkNotFound)
        );
    }
}
