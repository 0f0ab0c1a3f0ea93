use serde::{Deserialize, Serialize};
use strum_macros::Display;

/// Membership record of one participant. Records are never deleted, only flagged as left.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Attendee {
    pub user_id: String,
    pub is_host: bool,
    pub is_co_host: bool,
    pub approved_by_host: bool,
    pub is_mic_on: bool,
    pub is_camera_on: bool,
    pub is_presenting: bool,
    pub is_left: bool,
    pub kicked_by_host: bool,
    /// Consent to appear in the recording.
    pub approved_recording: bool,
    pub present_during_recording: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum AttendeeStatus {
    Requested,
    Approved,
    /// Approved and reachable through a known transport id.
    Active,
    Left,
}

impl Attendee {
    pub fn requested(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_owned(),
            ..Default::default()
        }
    }

    pub fn host(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_owned(),
            is_host: true,
            approved_by_host: true,
            ..Default::default()
        }
    }

    pub fn is_approved(&self) -> bool {
        !self.is_left && (self.is_host || self.approved_by_host)
    }

    pub fn is_moderator(&self) -> bool {
        self.is_approved() && (self.is_host || self.is_co_host)
    }

    pub fn status(&self, reachable: bool) -> AttendeeStatus {
        if self.is_left {
            AttendeeStatus::Left
        } else if !self.is_approved() {
            AttendeeStatus::Requested
        } else if reachable {
            AttendeeStatus::Active
        } else {
            AttendeeStatus::Approved
        }
    }
}

/// Whether `me` is the side that dials `peer`. The host dials every approved attendee, nobody
/// dials the host, and between two other attendees the smaller user id dials, so exactly one
/// side of every pair makes the offer.
pub fn should_dial(me: &Attendee, peer: &Attendee) -> bool {
    if !me.is_approved() || !peer.is_approved() || me.user_id == peer.user_id {
        return false;
    }
    if me.is_host {
        return true;
    }
    if peer.is_host {
        return false;
    }
    me.user_id < peer.user_id
}
