use serde::{Deserialize, Serialize};
use webrtc::{
    ice_transport::ice_candidate::RTCIceCandidateInit,
    peer_connection::sdp::session_description::RTCSessionDescription,
};

use crate::room::{Attendee, Room, SessionDescriptor};

/// Messages a client sends to the relay. `to` is always a transport id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    JoinRoom {
        room_id: String,
        user_id: String,
    },
    CallUser {
        to: String,
        offer: RTCSessionDescription,
        user_id: String,
    },
    CallAccepted {
        to: String,
        answer: RTCSessionDescription,
    },
    PeerNegotiationNeeded {
        to: String,
        offer: RTCSessionDescription,
    },
    PeerNegotiationDone {
        to: String,
        answer: RTCSessionDescription,
    },
    IceCandidate {
        to: String,
        candidate: RTCIceCandidateInit,
    },
    /// Reply to an announced mapping, telling the announcer who sits behind this connection.
    UpdateIdentityMap {
        to: String,
        user_id: String,
    },
    AttendeeUpdated {
        room_id: String,
        attendee: Attendee,
    },
    RoomUpdated {
        room_id: String,
        room: Room,
        session: SessionDescriptor,
    },
    /// Routed by user id, since the requester's transport id may not be known yet.
    JoinRequestAccepted {
        user_id: String,
        room_id: String,
    },
    RecordingStatus {
        room_id: String,
        is_being_recorded: bool,
    },
    EndSession {
        room_id: String,
        session_id: String,
    },
}

/// Messages the relay delivers to a client. `from` is the sender's transport id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// `announce` is set when a member just joined and expects everyone to reply with their
    /// own mapping.
    IdentityMapped {
        user_id: String,
        transport_id: String,
        announce: bool,
    },
    IncomingCall {
        offer: RTCSessionDescription,
        user_id: String,
        from: String,
    },
    CallAccepted {
        answer: RTCSessionDescription,
        from: String,
    },
    PeerNegotiationNeeded {
        offer: RTCSessionDescription,
        from: String,
    },
    PeerNegotiationFinal {
        answer: RTCSessionDescription,
        from: String,
    },
    IceCandidate {
        candidate: RTCIceCandidateInit,
        from: String,
    },
    AttendeeUpdated {
        attendee: Attendee,
    },
    RoomUpdated {
        room: Room,
        session: SessionDescriptor,
    },
    JoinRequestAccepted {
        room_id: String,
    },
    RecordingStatus {
        is_being_recorded: bool,
    },
    SessionEnded {
        room_id: String,
        session_id: String,
    },
}
