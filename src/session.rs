use std::sync::Arc;

use derivative::Derivative;
use tokio::{
    sync::{broadcast, mpsc, watch, Mutex, RwLock},
    time::{sleep_until, Instant},
};
use uuid::Uuid;
use webrtc::{
    ice_transport::ice_candidate::RTCIceCandidateInit,
    peer_connection::{
        peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, signaling_state::RTCSignalingState,
    },
    track::track_remote::TrackRemote,
};

use crate::{
    config::MeshConfig,
    error::{Error, LinkErrorKind, RoomErrorKind},
    identity::IdentityMap,
    link::{registry::PeerLinkRegistry, LinkEvent, MediaConnector},
    media::{LocalMedia, LocalTrack, MediaKind, MediaSource},
    recording::recorder::{CaptureStream, Recorder, RecordingArtifact},
    room::{Attendee, AttendeeStatus, Room, RoomState, SessionDescriptor},
    signaling::{
        message::{ClientMessage, ServerMessage},
        SignalingSender,
    },
};

/// Notifications for the application embedding a [`RoomSession`].
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub enum RoomNotification {
    AttendeesChanged,
    /// The local attendee was approved by a host or co-host.
    Approved,
    RemoteTrack {
        user_id: String,
        kind: Option<MediaKind>,
        #[derivative(Debug = "ignore")]
        track: Arc<TrackRemote>,
    },
    RecordingStatusChanged {
        is_being_recorded: bool,
    },
    MediaError {
        kind: MediaKind,
        message: String,
    },
    Kicked,
    Closed,
}

/// Snapshot of one peer link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerLinkInfo {
    pub link_id: String,
    pub user_id: String,
    pub transport_id: String,
    pub negotiated: bool,
    pub connection_state: RTCPeerConnectionState,
}

#[derive(Debug)]
struct SessionState {
    room: RoomState,
    identities: IdentityMap,
    registry: PeerLinkRegistry,
    /// A non-host waits until this instant after its approval before dialing.
    dial_not_before: Option<Instant>,
    reconcile_scheduled: bool,
    closed: bool,
}

#[derive(Derivative)]
#[derivative(Debug)]
struct SessionInner {
    me: String,
    config: MeshConfig,
    state: Mutex<SessionState>,
    #[derivative(Debug = "ignore")]
    signaling: RwLock<Arc<dyn SignalingSender>>,
    message_sender: mpsc::UnboundedSender<ServerMessage>,
    media: LocalMedia,
    recorder: Recorder,
    notification_sender: broadcast::Sender<RoomNotification>,
    stop_sender: watch::Sender<bool>,
}

/// One membership of the local user in a room.
///
/// Signaling messages and link events are handled on one event loop against the state of this
/// membership. Whenever the approved set or the identity table changes, the mesh is reconciled:
/// the whole state is rescanned and every missing pair the local user is responsible for is
/// dialed.
#[derive(Debug)]
pub struct RoomSession {
    pub id: String,
    inner: Arc<SessionInner>,
}

impl RoomSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        me: String,
        room: Room,
        session: SessionDescriptor,
        signaling: Arc<dyn SignalingSender>,
        incoming: mpsc::UnboundedReceiver<ServerMessage>,
        connector: Arc<dyn MediaConnector>,
        media: LocalMedia,
        recorder: Recorder,
        config: MeshConfig,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        let (link_event_sender, link_event_receiver) = mpsc::unbounded_channel();
        let (message_sender, message_receiver) = mpsc::unbounded_channel();
        let (notification_sender, _) = broadcast::channel(256);
        let (stop_sender, _) = watch::channel(false);

        let registry = PeerLinkRegistry::new(
            connector,
            media.clone(),
            link_event_sender,
            config.orphan_candidate_limit,
        );
        let inner = Arc::new(SessionInner {
            me,
            config,
            state: Mutex::new(SessionState {
                room: RoomState::new(room, session),
                identities: IdentityMap::new(),
                registry,
                dial_not_before: None,
                reconcile_scheduled: false,
                closed: false,
            }),
            signaling: RwLock::new(signaling),
            message_sender,
            media,
            recorder,
            notification_sender,
            stop_sender,
        });

        inner.pump_messages(incoming);
        {
            let copied = Arc::clone(&inner);
            let id = id.clone();
            tokio::spawn(async move {
                SessionInner::session_event_loop(id, copied, link_event_receiver, message_receiver)
                    .await;
            });
        }

        tracing::debug!("RoomSession {} is created", id);
        Self { id, inner }
    }

    pub fn me(&self) -> &str {
        &self.inner.me
    }

    pub fn media(&self) -> &LocalMedia {
        &self.inner.media
    }

    pub fn recorder(&self) -> &Recorder {
        &self.inner.recorder
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomNotification> {
        self.inner.notification_sender.subscribe()
    }

    /// Announces the local user to the room and asks to join when not yet a member.
    pub async fn join(&self) -> Result<(), Error> {
        let inner = &self.inner;
        let mut guard = inner.state.lock().await;
        let state = &mut *guard;
        if state.closed {
            return Err(Error::new_room(
                format!("RoomSession {} is closed", self.id),
                RoomErrorKind::RoomClosed,
            ));
        }
        let me = state.room.request_join(&inner.me)?.clone();
        let room_id = state.room.room().id.clone();
        inner
            .send(ClientMessage::JoinRoom {
                room_id: room_id.clone(),
                user_id: inner.me.clone(),
            })
            .await?;
        inner
            .send(ClientMessage::AttendeeUpdated {
                room_id,
                attendee: me.clone(),
            })
            .await?;
        if me.is_approved() {
            inner.on_self_approved(state);
            inner.reconcile(state).await;
        }
        Ok(())
    }

    /// Replaces the signaling connection after a reconnect and announces the new transport id.
    pub async fn rebind_signaling(
        &self,
        signaling: Arc<dyn SignalingSender>,
        incoming: mpsc::UnboundedReceiver<ServerMessage>,
    ) -> Result<(), Error> {
        *self.inner.signaling.write().await = signaling;
        self.inner.pump_messages(incoming);
        let room_id = self.inner.state.lock().await.room.room().id.clone();
        self.inner
            .send(ClientMessage::JoinRoom {
                room_id,
                user_id: self.inner.me.clone(),
            })
            .await
    }

    /// Feeds a message received outside the connection given to [`RoomSession::new`].
    pub fn handle_message(&self, message: ServerMessage) {
        let _ = self.inner.message_sender.send(message);
    }

    /// Captures local media and attaches it to every link. Kinds that fail are reported as
    /// [`RoomNotification::MediaError`] and the session continues without them.
    pub async fn acquire_media(&self, source: &dyn MediaSource, kinds: &[MediaKind]) {
        let failures = self.inner.media.acquire(source, kinds).await;
        for (kind, err) in failures {
            self.inner.notify(RoomNotification::MediaError {
                kind,
                message: err.to_string(),
            });
        }
        let tracks = self.inner.media.tracks().await;
        let state = self.inner.state.lock().await;
        for track in tracks.iter() {
            if let Err(err) = state.registry.replace_track(track).await {
                tracing::error!("failed to attach {} track: {}", track.kind, err);
            }
        }
    }

    pub async fn approve(&self, user_id: &str) -> Result<(), Error> {
        let inner = &self.inner;
        let mut guard = inner.state.lock().await;
        let state = &mut *guard;
        let attendee = state.room.approve(&inner.me, user_id)?.clone();
        let room_id = state.room.room().id.clone();
        inner.publish_attendee(&room_id, attendee).await;
        if let Err(err) = inner
            .send(ClientMessage::JoinRequestAccepted {
                user_id: user_id.to_owned(),
                room_id,
            })
            .await
        {
            tracing::warn!("failed to notify {} of approval: {}", user_id, err);
        }
        inner.notify(RoomNotification::AttendeesChanged);
        inner.reconcile(state).await;
        Ok(())
    }

    pub async fn promote_co_host(&self, user_id: &str) -> Result<(), Error> {
        let mut state = self.inner.state.lock().await;
        let attendee = state.room.promote_co_host(&self.inner.me, user_id)?.clone();
        let room_id = state.room.room().id.clone();
        self.inner.publish_attendee(&room_id, attendee).await;
        self.inner.notify(RoomNotification::AttendeesChanged);
        Ok(())
    }

    pub async fn demote_co_host(&self, user_id: &str) -> Result<(), Error> {
        let mut state = self.inner.state.lock().await;
        let attendee = state.room.demote_co_host(&self.inner.me, user_id)?.clone();
        let room_id = state.room.room().id.clone();
        self.inner.publish_attendee(&room_id, attendee).await;
        self.inner.notify(RoomNotification::AttendeesChanged);
        Ok(())
    }

    pub async fn kick(&self, user_id: &str) -> Result<(), Error> {
        let inner = &self.inner;
        let mut guard = inner.state.lock().await;
        let state = &mut *guard;
        let attendee = state.room.kick(&inner.me, user_id)?.clone();
        let room_id = state.room.room().id.clone();
        inner.publish_attendee(&room_id, attendee).await;
        inner.notify(RoomNotification::AttendeesChanged);
        inner.reconcile(state).await;
        Ok(())
    }

    pub async fn set_mic(&self, on: bool) -> Result<(), Error> {
        let mut state = self.inner.state.lock().await;
        let attendee = state.room.set_mic(&self.inner.me, on)?.clone();
        self.inner.media.set_enabled(MediaKind::Audio, on).await;
        let room_id = state.room.room().id.clone();
        self.inner.publish_attendee(&room_id, attendee).await;
        Ok(())
    }

    pub async fn set_camera(&self, on: bool) -> Result<(), Error> {
        let mut state = self.inner.state.lock().await;
        let attendee = state.room.set_camera(&self.inner.me, on)?.clone();
        self.inner.media.set_enabled(MediaKind::Video, on).await;
        let room_id = state.room.room().id.clone();
        self.inner.publish_attendee(&room_id, attendee).await;
        Ok(())
    }

    /// Sends `screen` instead of the camera on every link, reusing the existing video senders.
    pub async fn start_presenting(&self, screen: LocalTrack) -> Result<(), Error> {
        let mut state = self.inner.state.lock().await;
        let attendee = state.room.start_presenting(&self.inner.me)?.clone();
        self.inner.media.set_track(screen.clone()).await;
        state.registry.replace_track(&screen).await?;
        let room_id = state.room.room().id.clone();
        self.inner.publish_attendee(&room_id, attendee).await;
        Ok(())
    }

    /// Stops presenting, switching back to `camera` when given.
    pub async fn stop_presenting(&self, camera: Option<LocalTrack>) -> Result<(), Error> {
        let mut state = self.inner.state.lock().await;
        let attendee = state.room.stop_presenting(&self.inner.me)?.clone();
        if let Some(camera) = camera {
            self.inner.media.set_track(camera.clone()).await;
            state.registry.replace_track(&camera).await?;
        }
        let room_id = state.room.room().id.clone();
        self.inner.publish_attendee(&room_id, attendee).await;
        Ok(())
    }

    /// Host only. Starts the recorder and tells the room it is being recorded.
    pub async fn start_recording(&self, stream: Option<CaptureStream>) -> Result<(), Error> {
        let mut state = self.inner.state.lock().await;
        state.room.ensure_recording_host(&self.inner.me)?;
        self.inner.recorder.start(stream).await?;
        state.room.set_recording(&self.inner.me, true)?;
        self.inner.publish_recording_status(&state.room).await;
        Ok(())
    }

    /// Host only. Stops the recorder; the persisted chunks are kept until finalize.
    pub async fn stop_recording(&self) -> Result<(), Error> {
        let mut state = self.inner.state.lock().await;
        state.room.set_recording(&self.inner.me, false)?;
        self.inner.recorder.stop().await?;
        self.inner.publish_recording_status(&state.room).await;
        Ok(())
    }

    pub async fn consent_to_recording(&self) -> Result<(), Error> {
        let mut state = self.inner.state.lock().await;
        let attendee = state.room.consent_to_recording(&self.inner.me)?.clone();
        let room_id = state.room.room().id.clone();
        self.inner.publish_attendee(&room_id, attendee).await;
        Ok(())
    }

    /// Returns the finished recording for upload and clears its persisted chunks.
    pub async fn finalize_recording(&self) -> Result<Option<RecordingArtifact>, Error> {
        self.inner.recorder.finalize().await
    }

    /// Leaves the room. Every link is closed and every local track stopped before this returns.
    pub async fn leave(&self) -> Result<(), Error> {
        self.inner.teardown(true).await;
        Ok(())
    }

    /// Host only. Ends the session for everyone.
    pub async fn end_session(&self) -> Result<(), Error> {
        {
            let mut state = self.inner.state.lock().await;
            if state.room.host_id() != self.inner.me {
                return Err(Error::new_room(
                    format!("{} is not the host", self.inner.me),
                    RoomErrorKind::NotPermitted,
                ));
            }
            let room_id = state.room.room().id.clone();
            let session_id = state.room.session().id.clone();
            state.room.close();
            if let Err(err) = self
                .inner
                .send(ClientMessage::EndSession {
                    room_id,
                    session_id,
                })
                .await
            {
                tracing::warn!("failed to announce end of session: {}", err);
            }
        }
        self.inner.teardown(false).await;
        Ok(())
    }

    /// Best-effort teardown for contexts that cannot await, such as process shutdown.
    pub fn unload(&self) {
        self.inner.stop_sender.send_replace(true);
        self.inner.recorder.abort();
        self.inner.media.stop_now();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let inner = Arc::clone(&self.inner);
            handle.spawn(async move { inner.teardown(true).await });
        }
    }

    pub async fn attendees(&self) -> Vec<Attendee> {
        self.inner.state.lock().await.room.attendees().to_vec()
    }

    pub async fn attendee(&self, user_id: &str) -> Option<Attendee> {
        self.inner.state.lock().await.room.attendee(user_id).cloned()
    }

    pub async fn status_of(&self, user_id: &str) -> Option<AttendeeStatus> {
        let state = self.inner.state.lock().await;
        let reachable = user_id == self.inner.me || state.identities.transport_of(user_id).is_some();
        state.room.status_of(user_id, reachable)
    }

    pub async fn pending_requests(&self) -> Vec<Attendee> {
        let state = self.inner.state.lock().await;
        state.room.pending_requests().into_iter().cloned().collect()
    }

    pub async fn is_being_recorded(&self) -> bool {
        self.inner.state.lock().await.room.is_being_recorded()
    }

    pub async fn peer_links(&self) -> Vec<PeerLinkInfo> {
        let state = self.inner.state.lock().await;
        let mut links: Vec<_> = state
            .registry
            .links()
            .map(|link| PeerLinkInfo {
                link_id: link.id.clone(),
                user_id: link.remote_user_id.clone(),
                transport_id: link.remote_transport_id().to_owned(),
                negotiated: link.is_negotiated(),
                connection_state: link.connection_state(),
            })
            .collect();
        links.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        links
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.state.lock().await.closed
    }
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        self.inner.stop_sender.send_replace(true);
        tracing::debug!("RoomSession {} is dropped", self.id);
    }
}

impl SessionInner {
    fn pump_messages(&self, mut incoming: mpsc::UnboundedReceiver<ServerMessage>) {
        let sender = self.message_sender.clone();
        let mut stop = self.stop_sender.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = incoming.recv() => {
                        match message {
                            Some(message) => {
                                if sender.send(message).is_err() {
                                    return;
                                }
                            }
                            None => {
                                tracing::warn!("signaling connection closed");
                                return;
                            }
                        }
                    }
                    _ = stop.changed() => return,
                }
            }
        });
    }

    async fn session_event_loop(
        id: String,
        inner: Arc<SessionInner>,
        mut link_events: mpsc::UnboundedReceiver<LinkEvent>,
        mut messages: mpsc::UnboundedReceiver<ServerMessage>,
    ) {
        tracing::debug!("RoomSession {} event loop started", id);
        let mut stop = inner.stop_sender.subscribe();
        let mut ready = inner.media.subscribe_ready();
        loop {
            if *stop.borrow() {
                break;
            }
            tokio::select! {
                Some(event) = link_events.recv() => {
                    inner.handle_link_event(event).await;
                }
                Some(message) = messages.recv() => {
                    inner.handle_message(message).await;
                }
                Ok(()) = ready.changed() => {
                    let media_ready = *ready.borrow_and_update();
                    if media_ready {
                        let mut state = inner.state.lock().await;
                        inner.reconcile(&mut state).await;
                    }
                }
                _ = stop.changed() => {
                    break;
                }
            }
        }
        tracing::debug!("RoomSession {} event loop finished", id);
    }

    fn notify(&self, notification: RoomNotification) {
        let _ = self.notification_sender.send(notification);
    }

    async fn send(&self, message: ClientMessage) -> Result<(), Error> {
        let signaling = self.signaling.read().await.clone();
        signaling.send(message).await
    }

    async fn publish_attendee(&self, room_id: &str, attendee: Attendee) {
        if let Err(err) = self
            .send(ClientMessage::AttendeeUpdated {
                room_id: room_id.to_owned(),
                attendee,
            })
            .await
        {
            tracing::warn!("failed to publish attendee update: {}", err);
        }
    }

    async fn publish_recording_status(&self, room: &RoomState) {
        let room_id = room.room().id.clone();
        if let Err(err) = self
            .send(ClientMessage::RecordingStatus {
                room_id: room_id.clone(),
                is_being_recorded: room.is_being_recorded(),
            })
            .await
        {
            tracing::warn!("failed to publish recording status: {}", err);
        }
        if let Err(err) = self
            .send(ClientMessage::RoomUpdated {
                room_id,
                room: room.room().clone(),
                session: room.session().clone(),
            })
            .await
        {
            tracing::warn!("failed to publish room update: {}", err);
        }
        self.notify(RoomNotification::RecordingStatusChanged {
            is_being_recorded: room.is_being_recorded(),
        });
    }

    fn is_approved(&self, state: &SessionState) -> bool {
        state
            .room
            .attendee(&self.me)
            .map(|a| a.is_approved())
            .unwrap_or(false)
    }

    /// The host dials as soon as media is ready; everybody else waits for the grace period.
    fn on_self_approved(&self, state: &mut SessionState) {
        let is_host = state.room.host_id() == self.me;
        state.dial_not_before = if is_host {
            None
        } else {
            Some(Instant::now() + self.config.dial_grace_period)
        };
        tracing::debug!(
            "{} approved, dialing not before {:?}",
            self.me,
            state.dial_not_before
        );
        self.notify(RoomNotification::Approved);
    }

    async fn reconcile(self: &Arc<Self>, state: &mut SessionState) {
        if state.closed {
            return;
        }
        let approved = self.is_approved(state);

        // Links only exist between approved attendees who are both still in the room.
        let doomed: Vec<String> = state
            .registry
            .links()
            .filter(|link| {
                !approved
                    || state
                        .room
                        .attendee(&link.remote_user_id)
                        .map(|a| !a.is_approved())
                        .unwrap_or(true)
            })
            .map(|link| link.remote_transport_id().to_owned())
            .collect();
        for transport_id in doomed {
            tracing::debug!("closing link to {} after approval was lost", transport_id);
            if let Err(err) = state.registry.remove_link(&transport_id).await {
                tracing::error!("failed to close link {}: {}", transport_id, err);
            }
        }

        if !approved {
            return;
        }
        if !self.media.is_ready() {
            tracing::debug!("{} waits for local media before dialing", self.me);
            return;
        }
        if let Some(not_before) = state.dial_not_before {
            if Instant::now() < not_before {
                self.schedule_reconcile(state, not_before);
                return;
            }
        }

        let targets: Vec<(String, String)> = state
            .room
            .dial_targets(&self.me)
            .into_iter()
            .filter(|peer| state.registry.find_by_user(&peer.user_id).is_none())
            .filter_map(|peer| {
                state
                    .identities
                    .transport_of(&peer.user_id)
                    .map(|tid| (peer.user_id.clone(), tid.to_owned()))
            })
            .collect();
        for (user_id, transport_id) in targets {
            if let Err(err) = self.dial(state, &user_id, &transport_id).await {
                tracing::error!("failed to dial {} at {}: {}", user_id, transport_id, err);
            }
        }
    }

    fn schedule_reconcile(self: &Arc<Self>, state: &mut SessionState, at: Instant) {
        if state.reconcile_scheduled {
            return;
        }
        state.reconcile_scheduled = true;
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            sleep_until(at).await;
            let mut state = inner.state.lock().await;
            state.reconcile_scheduled = false;
            inner.reconcile(&mut state).await;
        });
    }

    async fn dial(
        &self,
        state: &mut SessionState,
        user_id: &str,
        transport_id: &str,
    ) -> Result<(), Error> {
        match state.registry.create_link(transport_id, user_id).await {
            Ok(_) => {}
            Err(err) if err.link_kind() == Some(LinkErrorKind::AlreadyConnected) => return Ok(()),
            Err(err) => return Err(err),
        }
        let offer = match state.registry.offer_for(transport_id).await {
            Ok(offer) => offer,
            Err(err) => {
                let _ = state.registry.remove_link(transport_id).await;
                return Err(err);
            }
        };
        tracing::debug!("{} calls {} at {}", self.me, user_id, transport_id);
        self.send(ClientMessage::CallUser {
            to: transport_id.to_owned(),
            offer,
            user_id: self.me.clone(),
        })
        .await
    }

    async fn handle_message(self: &Arc<Self>, message: ServerMessage) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.closed {
            tracing::debug!("{} ignores message after close", self.me);
            return;
        }
        match message {
            ServerMessage::IdentityMapped {
                user_id,
                transport_id,
                announce,
            } => {
                if user_id == self.me {
                    return;
                }
                state
                    .identities
                    .remap(&user_id, &transport_id, &mut state.registry);
                if announce {
                    if let Err(err) = self
                        .send(ClientMessage::UpdateIdentityMap {
                            to: transport_id,
                            user_id: self.me.clone(),
                        })
                        .await
                    {
                        tracing::warn!("failed to answer identity announcement: {}", err);
                    }
                }
                self.reconcile(state).await;
            }
            ServerMessage::IncomingCall {
                offer,
                user_id,
                from,
            } => {
                if let Err(err) = self.accept_call(state, offer, &user_id, &from).await {
                    tracing::warn!("call from {} at {} failed: {}", user_id, from, err);
                }
            }
            ServerMessage::CallAccepted { answer, from }
            | ServerMessage::PeerNegotiationFinal { answer, from } => {
                if let Err(err) = state.registry.apply_remote_answer(&from, answer).await {
                    tracing::warn!("dropped answer from {}: {}", from, err);
                }
            }
            ServerMessage::PeerNegotiationNeeded { offer, from } => {
                if let Err(err) = self.renegotiate(state, offer, &from).await {
                    tracing::warn!("dropped renegotiation from {}: {}", from, err);
                }
            }
            ServerMessage::IceCandidate { candidate, from } => {
                self.add_remote_candidate(state, candidate, &from).await;
            }
            ServerMessage::AttendeeUpdated { attendee } => {
                if attendee.user_id == self.me && attendee.is_left && attendee.kicked_by_host {
                    drop(guard);
                    tracing::info!("{} was removed from the room", self.me);
                    self.notify(RoomNotification::Kicked);
                    self.teardown(false).await;
                    return;
                }
                let was_approved = self.is_approved(state);
                state.room.apply_update(attendee);
                self.after_room_change(state, was_approved).await;
            }
            ServerMessage::RoomUpdated { room, session } => {
                let was_approved = self.is_approved(state);
                state.room.replace(room, session);
                self.after_room_change(state, was_approved).await;
            }
            ServerMessage::JoinRequestAccepted { room_id } => {
                if room_id != state.room.room().id {
                    tracing::warn!("approval for unknown room {}", room_id);
                    return;
                }
                let was_approved = self.is_approved(state);
                if let Some(me) = state.room.attendee(&self.me) {
                    let mut me = me.clone();
                    me.approved_by_host = true;
                    state.room.apply_update(me);
                }
                self.after_room_change(state, was_approved).await;
            }
            ServerMessage::RecordingStatus { is_being_recorded } => {
                state.room.set_recording_status(is_being_recorded);
                self.notify(RoomNotification::RecordingStatusChanged { is_being_recorded });
            }
            ServerMessage::SessionEnded { room_id, .. } => {
                if room_id != state.room.room().id {
                    return;
                }
                state.room.close();
                drop(guard);
                self.teardown(false).await;
            }
        }
    }

    async fn after_room_change(self: &Arc<Self>, state: &mut SessionState, was_approved: bool) {
        if !was_approved && self.is_approved(state) {
            self.on_self_approved(state);
        }
        self.notify(RoomNotification::AttendeesChanged);
        self.reconcile(state).await;
    }

    async fn accept_call(
        &self,
        state: &mut SessionState,
        offer: RTCSessionDescription,
        user_id: &str,
        from: &str,
    ) -> Result<(), Error> {
        if !self.is_approved(state) {
            return Err(Error::new_room(
                format!("{} is not approved", self.me),
                RoomErrorKind::NotPermitted,
            ));
        }
        match state.room.attendee(user_id) {
            Some(caller) if caller.is_approved() => {}
            Some(caller) => {
                return Err(Error::new_room(
                    format!("caller {} is {}", user_id, caller.status(true)),
                    RoomErrorKind::NotPermitted,
                ));
            }
            None => {
                return Err(Error::new_room(
                    format!("caller {} is not an attendee", user_id),
                    RoomErrorKind::NotPermitted,
                ));
            }
        }
        state.identities.remap(user_id, from, &mut state.registry);

        match state.registry.get(from) {
            Some(link) if link.signaling_state() != RTCSignalingState::Stable => {
                return Err(Error::new_link(
                    format!("link to {} is {}", user_id, link.signaling_state()),
                    LinkErrorKind::SignalingStateInvalidError,
                ));
            }
            Some(_) => {}
            None => {
                state.registry.create_link(from, user_id).await?;
            }
        }
        let answer = state.registry.answer_for(from, offer).await?;
        self.send(ClientMessage::CallAccepted {
            to: from.to_owned(),
            answer,
        })
        .await
    }

    async fn renegotiate(
        &self,
        state: &mut SessionState,
        offer: RTCSessionDescription,
        from: &str,
    ) -> Result<(), Error> {
        let answer = state.registry.answer_for(from, offer).await?;
        self.send(ClientMessage::PeerNegotiationDone {
            to: from.to_owned(),
            answer,
        })
        .await
    }

    async fn add_remote_candidate(
        &self,
        state: &mut SessionState,
        candidate: RTCIceCandidateInit,
        from: &str,
    ) {
        match state.registry.add_ice_candidate(from, candidate).await {
            Ok(()) => {}
            Err(err) if err.link_kind() == Some(LinkErrorKind::LinkNotFound) => {
                tracing::debug!("ICE candidate from {} arrived before its link", from);
            }
            Err(err) => tracing::warn!("failed to add ICE candidate from {}: {}", from, err),
        }
    }

    async fn handle_link_event(self: &Arc<Self>, event: LinkEvent) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.closed {
            return;
        }
        match event {
            LinkEvent::TrackReceived { link_id, track } => {
                let Some(link) = state.registry.get_by_id(&link_id) else {
                    return;
                };
                self.notify(RoomNotification::RemoteTrack {
                    user_id: link.remote_user_id.clone(),
                    kind: MediaKind::from_codec_type(track.kind()),
                    track,
                });
            }
            LinkEvent::NegotiationNeeded { link_id } => {
                let Some(link) = state.registry.get_by_id(&link_id) else {
                    return;
                };
                if !link.is_negotiated() {
                    tracing::debug!("PeerLink {} is still in its first negotiation", link_id);
                    return;
                }
                if link.signaling_state() != RTCSignalingState::Stable {
                    tracing::warn!(
                        "PeerLink {} skips renegotiation in signaling state {}",
                        link_id,
                        link.signaling_state()
                    );
                    return;
                }
                let transport_id = link.remote_transport_id().to_owned();
                let offer = match state.registry.offer_for(&transport_id).await {
                    Ok(offer) => offer,
                    Err(err) => {
                        tracing::error!("failed to create renegotiation offer: {}", err);
                        return;
                    }
                };
                if let Err(err) = self
                    .send(ClientMessage::PeerNegotiationNeeded {
                        to: transport_id,
                        offer,
                    })
                    .await
                {
                    tracing::warn!("failed to send renegotiation offer: {}", err);
                }
            }
            LinkEvent::IceCandidate { link_id, candidate } => {
                let Some(link) = state.registry.get_by_id(&link_id) else {
                    return;
                };
                let to = link.remote_transport_id().to_owned();
                if let Err(err) = self.send(ClientMessage::IceCandidate { to, candidate }).await {
                    tracing::warn!("failed to send ICE candidate: {}", err);
                }
            }
            LinkEvent::StateChanged { link_id, state: connection_state } => {
                let Some(transport_id) = state
                    .registry
                    .set_connection_state(&link_id, connection_state)
                else {
                    return;
                };
                if matches!(
                    connection_state,
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                ) {
                    tracing::info!("PeerLink {} is {}, dropping it", link_id, connection_state);
                    if let Err(err) = state.registry.remove_link(&transport_id).await {
                        tracing::error!("failed to close link {}: {}", transport_id, err);
                    }
                    self.reconcile(state).await;
                }
            }
        }
    }

    /// Closes every link and releases local capture. With `announce`, the local attendee is
    /// marked as left and the room is told.
    async fn teardown(&self, announce: bool) {
        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            if state.closed {
                return;
            }
            state.closed = true;
            if announce {
                let room_id = state.room.room().id.clone();
                match state.room.leave(&self.me) {
                    Ok(me) => {
                        let me = me.clone();
                        self.publish_attendee(&room_id, me).await;
                    }
                    Err(err) => tracing::warn!("failed to leave: {}", err),
                }
            }
            state.registry.close_all().await;
        }
        self.media.stop().await;
        if self.recorder.is_recording().await {
            if let Err(err) = self.recorder.stop().await {
                tracing::error!("failed to stop recorder: {}", err);
            }
        }
        self.stop_sender.send_replace(true);
        self.notify(RoomNotification::Closed);
        tracing::debug!("{} left the room", self.me);
    }
}
