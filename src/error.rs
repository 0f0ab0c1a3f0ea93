use strum_macros::Display;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    WebRTCError(#[from] webrtc::Error),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
    #[error(transparent)]
    Base64Error(#[from] base64::DecodeError),
    #[error(transparent)]
    WebSocketError(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    LinkError(#[from] LinkError),
    #[error(transparent)]
    RoomError(#[from] RoomError),
    #[error(transparent)]
    RecordingError(#[from] RecordingError),
    #[error(transparent)]
    SignalingError(#[from] SignalingError),
}

impl Error {
    pub fn new_link(message: String, kind: LinkErrorKind) -> Error {
        Error::LinkError(LinkError { kind, message })
    }

    pub fn new_room(message: String, kind: RoomErrorKind) -> Error {
        Error::RoomError(RoomError { kind, message })
    }

    pub fn new_recording(message: String, kind: RecordingErrorKind) -> Error {
        Error::RecordingError(RecordingError { kind, message })
    }

    pub fn new_signaling(message: String, kind: SignalingErrorKind) -> Error {
        Error::SignalingError(SignalingError { kind, message })
    }

    /// Returns the link error kind when this error came from the peer link registry.
    pub fn link_kind(&self) -> Option<LinkErrorKind> {
        match self {
            Error::LinkError(err) => Some(err.kind),
            _ => None,
        }
    }

    pub fn room_kind(&self) -> Option<RoomErrorKind> {
        match self {
            Error::RoomError(err) => Some(err.kind),
            _ => None,
        }
    }

    pub fn recording_kind(&self) -> Option<RecordingErrorKind> {
        match self {
            Error::RecordingError(err) => Some(err.kind),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct LinkError {
    pub kind: LinkErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum LinkErrorKind {
    AlreadyConnected,
    LinkNotFound,
    SignalingStateInvalidError,
    LocalDescriptionError,
}

#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct RoomError {
    pub kind: RoomErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum RoomErrorKind {
    AttendeeNotFound,
    NotPermitted,
    InvalidTransition,
    RoomClosed,
}

#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct RecordingError {
    pub kind: RecordingErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum RecordingErrorKind {
    NoStream,
    AlreadyRecording,
    Finalized,
    StorageFull,
}

#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct SignalingError {
    pub kind: SignalingErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SignalingErrorKind {
    ChannelClosed,
    UnknownTransport,
}
