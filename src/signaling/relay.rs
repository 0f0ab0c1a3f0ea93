use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, Mutex},
};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::{
    error::{Error, SignalingErrorKind},
    signaling::{
        message::{ClientMessage, ServerMessage},
        SignalingSender,
    },
};

#[derive(Debug)]
struct Member {
    sender: mpsc::UnboundedSender<ServerMessage>,
    room_id: Option<String>,
    user_id: Option<String>,
}

/// Relay hub. It assigns a transport id to every connection, groups connections by room and
/// forwards addressed messages, rewriting `to` into `from`.
#[derive(Debug, Clone, Default)]
pub struct SignalingRelay {
    members: Arc<Mutex<HashMap<String, Member>>>,
}

impl SignalingRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens an in-process connection.
    pub async fn connect(&self) -> (RelayConnection, mpsc::UnboundedReceiver<ServerMessage>) {
        let transport_id = Uuid::new_v4().to_string();
        let (sender, receiver) = mpsc::unbounded_channel();
        self.members.lock().await.insert(
            transport_id.clone(),
            Member {
                sender,
                room_id: None,
                user_id: None,
            },
        );
        tracing::debug!("RelayConnection {} is created", transport_id);
        (
            RelayConnection {
                transport_id,
                relay: self.clone(),
            },
            receiver,
        )
    }

    pub async fn disconnect(&self, transport_id: &str) {
        if self.members.lock().await.remove(transport_id).is_some() {
            tracing::debug!("RelayConnection {} is disconnected", transport_id);
        }
    }

    /// Current transport id of `user_id`, if the user joined a room through this relay.
    pub async fn transport_of(&self, user_id: &str) -> Option<String> {
        self.members
            .lock()
            .await
            .iter()
            .find(|(_, m)| m.user_id.as_deref() == Some(user_id))
            .map(|(tid, _)| tid.clone())
    }

    pub async fn route(&self, from: &str, message: ClientMessage) -> Result<(), Error> {
        let mut members = self.members.lock().await;
        if !members.contains_key(from) {
            return Err(Error::new_signaling(
                format!("Transport {} is not connected", from),
                SignalingErrorKind::UnknownTransport,
            ));
        }
        let from = from.to_owned();
        match message {
            ClientMessage::JoinRoom { room_id, user_id } => {
                if let Some(member) = members.get_mut(&from) {
                    member.room_id = Some(room_id.clone());
                    member.user_id = Some(user_id.clone());
                }
                Self::broadcast(
                    &members,
                    &room_id,
                    &from,
                    ServerMessage::IdentityMapped {
                        user_id,
                        transport_id: from.clone(),
                        announce: true,
                    },
                );
                Ok(())
            }
            ClientMessage::UpdateIdentityMap { to, user_id } => Self::unicast(
                &members,
                &to,
                ServerMessage::IdentityMapped {
                    user_id,
                    transport_id: from,
                    announce: false,
                },
            ),
            ClientMessage::CallUser { to, offer, user_id } => Self::unicast(
                &members,
                &to,
                ServerMessage::IncomingCall {
                    offer,
                    user_id,
                    from,
                },
            ),
            ClientMessage::CallAccepted { to, answer } => {
                Self::unicast(&members, &to, ServerMessage::CallAccepted { answer, from })
            }
            ClientMessage::PeerNegotiationNeeded { to, offer } => Self::unicast(
                &members,
                &to,
                ServerMessage::PeerNegotiationNeeded { offer, from },
            ),
            ClientMessage::PeerNegotiationDone { to, answer } => Self::unicast(
                &members,
                &to,
                ServerMessage::PeerNegotiationFinal { answer, from },
            ),
            ClientMessage::IceCandidate { to, candidate } => Self::unicast(
                &members,
                &to,
                ServerMessage::IceCandidate { candidate, from },
            ),
            ClientMessage::AttendeeUpdated { room_id, attendee } => {
                Self::broadcast(
                    &members,
                    &room_id,
                    &from,
                    ServerMessage::AttendeeUpdated { attendee },
                );
                Ok(())
            }
            ClientMessage::RoomUpdated {
                room_id,
                room,
                session,
            } => {
                Self::broadcast(
                    &members,
                    &room_id,
                    &from,
                    ServerMessage::RoomUpdated { room, session },
                );
                Ok(())
            }
            ClientMessage::JoinRequestAccepted { user_id, room_id } => {
                let target = members
                    .iter()
                    .find(|(_, m)| m.user_id.as_deref() == Some(user_id.as_str()))
                    .map(|(tid, _)| tid.clone());
                match target {
                    Some(to) => {
                        Self::unicast(&members, &to, ServerMessage::JoinRequestAccepted { room_id })
                    }
                    None => Err(Error::new_signaling(
                        format!("User {} is not connected", user_id),
                        SignalingErrorKind::UnknownTransport,
                    )),
                }
            }
            ClientMessage::RecordingStatus {
                room_id,
                is_being_recorded,
            } => {
                Self::broadcast(
                    &members,
                    &room_id,
                    &from,
                    ServerMessage::RecordingStatus { is_being_recorded },
                );
                Ok(())
            }
            ClientMessage::EndSession {
                room_id,
                session_id,
            } => {
                Self::broadcast(
                    &members,
                    &room_id,
                    &from,
                    ServerMessage::SessionEnded {
                        room_id: room_id.clone(),
                        session_id,
                    },
                );
                for member in members.values_mut() {
                    if member.room_id.as_deref() == Some(room_id.as_str()) {
                        member.room_id = None;
                    }
                }
                Ok(())
            }
        }
    }

    fn unicast(
        members: &HashMap<String, Member>,
        to: &str,
        message: ServerMessage,
    ) -> Result<(), Error> {
        let member = members.get(to).ok_or_else(|| {
            Error::new_signaling(
                format!("Transport {} is not connected", to),
                SignalingErrorKind::UnknownTransport,
            )
        })?;
        member.sender.send(message).map_err(|_| {
            Error::new_signaling(
                format!("Transport {} is closed", to),
                SignalingErrorKind::ChannelClosed,
            )
        })
    }

    fn broadcast(
        members: &HashMap<String, Member>,
        room_id: &str,
        from: &str,
        message: ServerMessage,
    ) {
        for (tid, member) in members.iter() {
            if tid != from && member.room_id.as_deref() == Some(room_id) {
                if let Err(err) = member.sender.send(message.clone()) {
                    tracing::warn!("failed to deliver to {}: {}", tid, err);
                }
            }
        }
    }

    /// Accepts WebSocket clients on `listener` until it fails.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Error> {
        loop {
            let (stream, addr) = listener.accept().await?;
            tracing::debug!("signaling client connected from {}", addr);
            let relay = self.clone();
            tokio::spawn(async move {
                if let Err(err) = relay.handle_websocket(stream).await {
                    tracing::error!("signaling client {} failed: {}", addr, err);
                }
            });
        }
    }

    async fn handle_websocket(&self, stream: TcpStream) -> Result<(), Error> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut write, mut read) = ws_stream.split();
        let (connection, mut receiver) = self.connect().await;

        let writer = tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                match serde_json::to_string(&message) {
                    Ok(json) => {
                        if write.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => tracing::error!("failed to encode signaling message: {}", err),
                }
            }
        });

        while let Some(frame) = read.next().await {
            match frame {
                Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(message) => {
                        if let Err(err) = connection.send(message).await {
                            tracing::warn!("dropped message from {}: {}", connection.transport_id, err);
                        }
                    }
                    Err(err) => tracing::warn!("invalid signaling message: {}", err),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!("signaling connection {} error: {}", connection.transport_id, err);
                    break;
                }
            }
        }

        self.disconnect(&connection.transport_id).await;
        writer.abort();
        Ok(())
    }
}

/// One client connection of a [`SignalingRelay`].
#[derive(Debug, Clone)]
pub struct RelayConnection {
    pub transport_id: String,
    relay: SignalingRelay,
}

#[async_trait]
impl SignalingSender for RelayConnection {
    async fn send(&self, message: ClientMessage) -> Result<(), Error> {
        self.relay.route(&self.transport_id, message).await
    }
}

#[cfg(test)]
mod tests {
    use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

    use super::*;

    #[tokio::test]
    async fn join_announces_to_room_only() {
        let relay = SignalingRelay::new();
        let (amy, mut amy_rx) = relay.connect().await;
        let (ben, mut ben_rx) = relay.connect().await;
        let (cat, mut cat_rx) = relay.connect().await;

        amy.send(ClientMessage::JoinRoom {
            room_id: "r1".to_owned(),
            user_id: "amy".to_owned(),
        })
        .await
        .unwrap();
        cat.send(ClientMessage::JoinRoom {
            room_id: "r2".to_owned(),
            user_id: "cat".to_owned(),
        })
        .await
        .unwrap();
        ben.send(ClientMessage::JoinRoom {
            room_id: "r1".to_owned(),
            user_id: "ben".to_owned(),
        })
        .await
        .unwrap();

        match amy_rx.try_recv().unwrap() {
            ServerMessage::IdentityMapped {
                user_id,
                transport_id,
                announce,
            } => {
                assert_eq!(user_id, "ben");
                assert_eq!(transport_id, ben.transport_id);
                assert!(announce);
            }
            other => panic!("unexpected message {:?}", other),
        }
        assert!(ben_rx.try_recv().is_err());
        assert!(cat_rx.try_recv().is_err());
        assert_eq!(relay.transport_of("ben").await, Some(ben.transport_id.clone()));
    }

    #[tokio::test]
    async fn addressed_messages_carry_sender() {
        let relay = SignalingRelay::new();
        let (amy, _amy_rx) = relay.connect().await;
        let (ben, mut ben_rx) = relay.connect().await;

        amy.send(ClientMessage::CallUser {
            to: ben.transport_id.clone(),
            offer: RTCSessionDescription::default(),
            user_id: "amy".to_owned(),
        })
        .await
        .unwrap();
        match ben_rx.try_recv().unwrap() {
            ServerMessage::IncomingCall { user_id, from, .. } => {
                assert_eq!(user_id, "amy");
                assert_eq!(from, amy.transport_id);
            }
            other => panic!("unexpected message {:?}", other),
        }

        amy.send(ClientMessage::PeerNegotiationDone {
            to: ben.transport_id.clone(),
            answer: RTCSessionDescription::default(),
        })
        .await
        .unwrap();
        assert!(matches!(
            ben_rx.try_recv().unwrap(),
            ServerMessage::PeerNegotiationFinal { .. }
        ));

        relay.disconnect(&ben.transport_id).await;
        let err = amy
            .send(ClientMessage::CallAccepted {
                to: ben.transport_id.clone(),
                answer: RTCSessionDescription::default(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SignalingError(_)));
    }

    #[tokio::test]
    async fn join_request_accepted_routes_by_user() {
        let relay = SignalingRelay::new();
        let (host, _host_rx) = relay.connect().await;
        let (amy, mut amy_rx) = relay.connect().await;
        amy.send(ClientMessage::JoinRoom {
            room_id: "r1".to_owned(),
            user_id: "amy".to_owned(),
        })
        .await
        .unwrap();
        host.send(ClientMessage::JoinRequestAccepted {
            user_id: "amy".to_owned(),
            room_id: "r1".to_owned(),
        })
        .await
        .unwrap();
        assert!(matches!(
            amy_rx.try_recv().unwrap(),
            ServerMessage::JoinRequestAccepted { room_id } if room_id == "r1"
        ));
    }
}
