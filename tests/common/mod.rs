#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use meshroom::{
    config::{MeshConfig, RecorderConfig},
    error::Error,
    link::{LinkEvent, MediaConnector, MediaLink},
    media::{LocalMedia, LocalTrack},
    recording::{recorder::Recorder, store::MemoryChunkStore},
    room::{Attendee, Room, SessionDescriptor},
    session::{PeerLinkInfo, RoomSession},
    signaling::relay::SignalingRelay,
};
use tokio::sync::mpsc;
use webrtc::{
    ice_transport::ice_candidate::RTCIceCandidateInit,
    peer_connection::{
        peer_connection_state::RTCPeerConnectionState,
        sdp::{sdp_type::RTCSdpType, session_description::RTCSessionDescription},
        signaling_state::RTCSignalingState,
    },
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meshroom=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Media link that follows the offer/answer state machine without any network.
#[derive(Debug, Default)]
pub struct ScriptedLink {
    pub link_id: String,
    state: StdMutex<Option<RTCSignalingState>>,
    has_remote: StdMutex<bool>,
    offers: AtomicUsize,
    closed: AtomicUsize,
}

impl ScriptedLink {
    fn signaling(&self) -> RTCSignalingState {
        self.state
            .lock()
            .map(|s| s.unwrap_or(RTCSignalingState::Stable))
            .unwrap_or(RTCSignalingState::Closed)
    }

    fn set_signaling(&self, state: RTCSignalingState) {
        if let Ok(mut s) = self.state.lock() {
            *s = Some(state);
        }
    }

    pub fn offer_count(&self) -> usize {
        self.offers.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) > 0
    }
}

fn sdp(sdp_type: RTCSdpType, body: String) -> RTCSessionDescription {
    let mut desc = RTCSessionDescription::default();
    desc.sdp_type = sdp_type;
    desc.sdp = body;
    desc
}

#[async_trait]
impl MediaLink for ScriptedLink {
    async fn create_offer(&self) -> Result<RTCSessionDescription, Error> {
        let n = self.offers.fetch_add(1, Ordering::SeqCst);
        self.set_signaling(RTCSignalingState::HaveLocalOffer);
        Ok(sdp(RTCSdpType::Offer, format!("{}-{}", self.link_id, n)))
    }

    async fn create_answer(&self) -> Result<RTCSessionDescription, Error> {
        self.set_signaling(RTCSignalingState::Stable);
        Ok(sdp(RTCSdpType::Answer, self.link_id.clone()))
    }

    async fn set_remote_description(&self, desc: RTCSessionDescription) -> Result<(), Error> {
        if desc.sdp_type == RTCSdpType::Offer {
            self.set_signaling(RTCSignalingState::HaveRemoteOffer);
        } else {
            self.set_signaling(RTCSignalingState::Stable);
        }
        if let Ok(mut has_remote) = self.has_remote.lock() {
            *has_remote = true;
        }
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.has_remote.lock().map(|r| *r).unwrap_or(false)
    }

    async fn add_ice_candidate(&self, _candidate: RTCIceCandidateInit) -> Result<(), Error> {
        Ok(())
    }

    fn signaling_state(&self) -> RTCSignalingState {
        self.signaling()
    }

    fn connection_state(&self) -> RTCPeerConnectionState {
        RTCPeerConnectionState::Connected
    }

    async fn attach_track(&self, _track: &LocalTrack) -> Result<bool, Error> {
        Ok(false)
    }

    async fn close(&self) -> Result<(), Error> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        self.set_signaling(RTCSignalingState::Closed);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct ScriptedConnector {
    links: StdMutex<Vec<Arc<ScriptedLink>>>,
}

impl ScriptedConnector {
    pub fn link(&self, link_id: &str) -> Option<Arc<ScriptedLink>> {
        self.links
            .lock()
            .ok()
            .and_then(|links| links.iter().find(|l| l.link_id == link_id).cloned())
    }

    pub fn connected(&self) -> usize {
        self.links.lock().map(|l| l.len()).unwrap_or(0)
    }
}

#[async_trait]
impl MediaConnector for ScriptedConnector {
    async fn connect(
        &self,
        link_id: &str,
        _events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn MediaLink>, Error> {
        let link = Arc::new(ScriptedLink {
            link_id: link_id.to_owned(),
            ..Default::default()
        });
        if let Ok(mut links) = self.links.lock() {
            links.push(link.clone());
        }
        Ok(link)
    }
}

pub struct Member {
    pub session: RoomSession,
    pub connector: Arc<ScriptedConnector>,
    pub transport_id: String,
}

pub fn approved(user_id: &str) -> Attendee {
    Attendee {
        approved_by_host: true,
        ..Attendee::requested(user_id)
    }
}

pub fn snapshot(host: &str, approved_users: &[&str]) -> SessionDescriptor {
    SessionDescriptor {
        id: "s1".to_owned(),
        host: host.to_owned(),
        title: "standup".to_owned(),
        attendees: approved_users.iter().map(|u| approved(u)).collect(),
        ..Default::default()
    }
}

/// Connects `me` to `relay` and joins room `r1` with ready media and no dial delay.
pub async fn join(relay: &SignalingRelay, me: &str, session: &SessionDescriptor) -> Member {
    let (connection, incoming) = relay.connect().await;
    let transport_id = connection.transport_id.clone();
    let connector = Arc::new(ScriptedConnector::default());
    let media = LocalMedia::new();
    media.mark_ready();
    let room_session = RoomSession::new(
        me.to_owned(),
        Room {
            id: "r1".to_owned(),
            ..Default::default()
        },
        session.clone(),
        Arc::new(connection),
        incoming,
        connector.clone(),
        media,
        Recorder::new(RecorderConfig::default(), Arc::new(MemoryChunkStore::new())),
        MeshConfig {
            dial_grace_period: Duration::ZERO,
            ..Default::default()
        },
    );
    room_session.join().await.unwrap();
    Member {
        session: room_session,
        connector,
        transport_id,
    }
}

fn users(links: &[PeerLinkInfo]) -> Vec<String> {
    links.iter().map(|l| l.user_id.clone()).collect()
}

/// Waits until `member` holds negotiated links to exactly `expected`.
pub async fn wait_for_links(member: &Member, expected: &[&str]) -> Vec<PeerLinkInfo> {
    let mut expected: Vec<String> = expected.iter().map(|u| u.to_string()).collect();
    expected.sort();
    let mut last = Vec::new();
    for _ in 0..500 {
        last = member.session.peer_links().await;
        if users(&last) == expected && last.iter().all(|l| l.negotiated) {
            return last;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "{} has links {:?}, expected {:?}",
        member.session.me(),
        last,
        expected
    );
}

pub async fn wait_closed(member: &Member) {
    for _ in 0..500 {
        if member.session.is_closed().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{} is still open", member.session.me());
}
