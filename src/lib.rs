#![deny(missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]
//! # Meshroom
//! Meshroom is a peer-to-peer WebRTC room library. Every approved attendee of a room holds one direct media connection to every other approved attendee, and a lightweight relay only forwards signaling messages between them. No media passes through a server.
//! `demos/relay_server.rs` is an example signaling relay.
//!
//! ## Usage
//! Create a [`session::RoomSession`] with a [`signaling::SignalingSender`], a [`link::MediaConnector`] such as [`link::webrtc_link::WebRTCConnector`], the [`media::LocalMedia`] to send and a [`recording::recorder::Recorder`]. Then call [`session::RoomSession::join`] and listen to [`session::RoomNotification`]s.

/// Configuration for [`session::RoomSession`], [`link::webrtc_link::WebRTCConnector`] and [`recording::recorder::Recorder`].
pub mod config;
pub mod error;
/// Mapping between stable user ids and short-lived transport ids.
pub mod identity;
/// Direct media connections to remote participants.
pub mod link;
/// Local capture tracks shared by every link.
pub mod media;
/// Chunked recording that survives a crash or reload.
pub mod recording;
/// Attendees, roles and approvals of a room.
pub mod room;
/// RoomSession is a module that keeps the mesh of one room in shape.
pub mod session;
pub mod signaling;
