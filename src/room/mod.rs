//! Room membership, roles, approvals and media flags.

pub mod attendee;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{Error, RoomErrorKind};
pub use attendee::{should_dial, Attendee, AttendeeStatus};

/// Client-local copy of the room record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Room {
    pub id: String,
    pub participant_ids: BTreeSet<String>,
}

/// Client-local copy of the session record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionDescriptor {
    pub id: String,
    pub host: String,
    pub title: String,
    pub attendees: Vec<Attendee>,
    pub hashtags: Vec<String>,
    pub is_being_recorded: bool,
    pub is_session_closed: bool,
}

/// Attendee state machine of one room.
///
/// Per attendee: `Requested -> Approved -> {Active, Left}`. A new join request replaces a left
/// record with a fresh `Requested` one. Every operation that acts on behalf of someone checks
/// the actor's role.
#[derive(Debug, Clone)]
pub struct RoomState {
    room: Room,
    session: SessionDescriptor,
}

impl RoomState {
    pub fn new(room: Room, mut session: SessionDescriptor) -> Self {
        Self::ensure_host(&room, &mut session);
        Self { room, session }
    }

    fn ensure_host(room: &Room, session: &mut SessionDescriptor) {
        if session.host.is_empty() {
            return;
        }
        let host = session.host.clone();
        match session.attendees.iter().position(|a| a.user_id == host) {
            Some(index) => session.attendees[index].is_host = true,
            None => session.attendees.push(Attendee::host(&host)),
        }
        tracing::debug!("RoomState {} host is {}", room.id, session.host);
    }

    pub fn room(&self) -> &Room {
        &self.room
    }

    pub fn session(&self) -> &SessionDescriptor {
        &self.session
    }

    pub fn attendees(&self) -> &[Attendee] {
        &self.session.attendees
    }

    pub fn attendee(&self, user_id: &str) -> Option<&Attendee> {
        self.session.attendees.iter().find(|a| a.user_id == user_id)
    }

    pub fn host_id(&self) -> &str {
        &self.session.host
    }

    pub fn is_being_recorded(&self) -> bool {
        self.session.is_being_recorded
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_session_closed
    }

    pub fn request_join(&mut self, user_id: &str) -> Result<&Attendee, Error> {
        self.ensure_open()?;
        let index = match self.position(user_id) {
            Some(index) if !self.session.attendees[index].is_left => index,
            Some(index) => {
                self.session.attendees[index] = Attendee::requested(user_id);
                index
            }
            None => {
                self.session.attendees.push(Attendee::requested(user_id));
                self.session.attendees.len() - 1
            }
        };
        self.room.participant_ids.insert(user_id.to_owned());
        Ok(&self.session.attendees[index])
    }

    pub fn approve(&mut self, actor: &str, user_id: &str) -> Result<&Attendee, Error> {
        self.ensure_moderator(actor)?;
        let attendee = self.attendee_mut(user_id)?;
        if attendee.status(false) != AttendeeStatus::Requested {
            return Err(Error::new_room(
                format!("{} is {}", user_id, attendee.status(false)),
                RoomErrorKind::InvalidTransition,
            ));
        }
        attendee.approved_by_host = true;
        tracing::debug!("{} approved {}", actor, user_id);
        Ok(attendee)
    }

    pub fn promote_co_host(&mut self, actor: &str, user_id: &str) -> Result<&Attendee, Error> {
        self.set_co_host(actor, user_id, true)
    }

    pub fn demote_co_host(&mut self, actor: &str, user_id: &str) -> Result<&Attendee, Error> {
        self.set_co_host(actor, user_id, false)
    }

    fn set_co_host(&mut self, actor: &str, user_id: &str, on: bool) -> Result<&Attendee, Error> {
        self.ensure_moderator(actor)?;
        let attendee = self.attendee_mut(user_id)?;
        if attendee.is_host {
            return Err(Error::new_room(
                format!("{} is the host", user_id),
                RoomErrorKind::NotPermitted,
            ));
        }
        if !attendee.is_approved() {
            return Err(Error::new_room(
                format!("{} is {}", user_id, attendee.status(false)),
                RoomErrorKind::InvalidTransition,
            ));
        }
        attendee.is_co_host = on;
        Ok(attendee)
    }

    /// Removes `user_id` from the room on behalf of a host or co-host.
    pub fn kick(&mut self, actor: &str, user_id: &str) -> Result<&Attendee, Error> {
        self.ensure_moderator(actor)?;
        let attendee = self.attendee_mut(user_id)?;
        if attendee.is_host {
            return Err(Error::new_room(
                format!("{} is the host", user_id),
                RoomErrorKind::NotPermitted,
            ));
        }
        if attendee.is_left {
            return Err(Error::new_room(
                format!("{} already left", user_id),
                RoomErrorKind::InvalidTransition,
            ));
        }
        attendee.is_left = true;
        attendee.is_co_host = false;
        attendee.kicked_by_host = true;
        attendee.approved_by_host = false;
        attendee.is_presenting = false;
        self.room.participant_ids.remove(user_id);
        self.attendee(user_id).ok_or_else(|| Self::not_found(user_id))
    }

    pub fn leave(&mut self, user_id: &str) -> Result<&Attendee, Error> {
        let attendee = self.attendee_mut(user_id)?;
        attendee.is_left = true;
        attendee.is_presenting = false;
        self.room.participant_ids.remove(user_id);
        self.attendee(user_id).ok_or_else(|| Self::not_found(user_id))
    }

    pub fn set_mic(&mut self, user_id: &str, on: bool) -> Result<&Attendee, Error> {
        let attendee = self.approved_mut(user_id)?;
        attendee.is_mic_on = on;
        Ok(attendee)
    }

    pub fn set_camera(&mut self, user_id: &str, on: bool) -> Result<&Attendee, Error> {
        let attendee = self.approved_mut(user_id)?;
        attendee.is_camera_on = on;
        Ok(attendee)
    }

    /// Screen capture replaces the camera track, so the camera flag goes on as well.
    pub fn start_presenting(&mut self, user_id: &str) -> Result<&Attendee, Error> {
        let attendee = self.approved_mut(user_id)?;
        attendee.is_presenting = true;
        attendee.is_camera_on = true;
        Ok(attendee)
    }

    pub fn stop_presenting(&mut self, user_id: &str) -> Result<&Attendee, Error> {
        let attendee = self.approved_mut(user_id)?;
        attendee.is_presenting = false;
        Ok(attendee)
    }

    /// Fails unless `actor` is the approved host of an open session.
    pub fn ensure_recording_host(&self, actor: &str) -> Result<(), Error> {
        self.ensure_open()?;
        match self.attendee(actor) {
            Some(a) if a.is_host && a.is_approved() => Ok(()),
            _ => Err(Error::new_room(
                format!("{} may not control the recording", actor),
                RoomErrorKind::NotPermitted,
            )),
        }
    }

    /// Host only. Starting marks every approved attendee as present during the recording
    /// and counts the host as consenting.
    pub fn set_recording(&mut self, actor: &str, on: bool) -> Result<(), Error> {
        self.ensure_recording_host(actor)?;
        self.session.is_being_recorded = on;
        if on {
            for attendee in self.session.attendees.iter_mut() {
                if attendee.is_approved() {
                    attendee.present_during_recording = true;
                }
                if attendee.user_id == actor {
                    attendee.approved_recording = true;
                }
            }
        }
        Ok(())
    }

    pub fn consent_to_recording(&mut self, user_id: &str) -> Result<&Attendee, Error> {
        let attendee = self.approved_mut(user_id)?;
        attendee.approved_recording = true;
        Ok(attendee)
    }

    /// Merges an attendee record received from another member.
    pub fn apply_update(&mut self, attendee: Attendee) {
        if attendee.is_left {
            self.room.participant_ids.remove(&attendee.user_id);
        } else {
            self.room.participant_ids.insert(attendee.user_id.clone());
        }
        match self.position(&attendee.user_id) {
            Some(index) => self.session.attendees[index] = attendee,
            None => self.session.attendees.push(attendee),
        }
    }

    /// Swaps in a fresh snapshot of the room and session records.
    pub fn replace(&mut self, room: Room, mut session: SessionDescriptor) {
        Self::ensure_host(&room, &mut session);
        self.room = room;
        self.session = session;
    }

    pub fn set_recording_status(&mut self, on: bool) {
        self.session.is_being_recorded = on;
    }

    pub fn close(&mut self) {
        self.session.is_session_closed = true;
        self.session.is_being_recorded = false;
    }

    /// Approved attendees other than `me`.
    pub fn approved_peers(&self, me: &str) -> Vec<&Attendee> {
        self.session
            .attendees
            .iter()
            .filter(|a| a.user_id != me && a.is_approved())
            .collect()
    }

    /// Approved peers `me` is responsible for dialing.
    pub fn dial_targets(&self, me: &str) -> Vec<&Attendee> {
        match self.attendee(me) {
            Some(me) => self
                .approved_peers(&me.user_id)
                .into_iter()
                .filter(|peer| should_dial(me, peer))
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn status_of(&self, user_id: &str, reachable: bool) -> Option<AttendeeStatus> {
        self.attendee(user_id).map(|a| a.status(reachable))
    }

    pub fn pending_requests(&self) -> Vec<&Attendee> {
        self.session
            .attendees
            .iter()
            .filter(|a| a.status(false) == AttendeeStatus::Requested)
            .collect()
    }

    fn position(&self, user_id: &str) -> Option<usize> {
        self.session
            .attendees
            .iter()
            .position(|a| a.user_id == user_id)
    }

    fn not_found(user_id: &str) -> Error {
        Error::new_room(
            format!("Attendee {} not found", user_id),
            RoomErrorKind::AttendeeNotFound,
        )
    }

    fn attendee_mut(&mut self, user_id: &str) -> Result<&mut Attendee, Error> {
        self.session
            .attendees
            .iter_mut()
            .find(|a| a.user_id == user_id)
            .ok_or_else(|| Self::not_found(user_id))
    }

    fn approved_mut(&mut self, user_id: &str) -> Result<&mut Attendee, Error> {
        let attendee = self.attendee_mut(user_id)?;
        if !attendee.is_approved() {
            return Err(Error::new_room(
                format!("{} is not approved", user_id),
                RoomErrorKind::NotPermitted,
            ));
        }
        Ok(attendee)
    }

    fn ensure_moderator(&self, actor: &str) -> Result<(), Error> {
        self.ensure_open()?;
        match self.attendee(actor) {
            Some(a) if a.is_moderator() => Ok(()),
            Some(_) => Err(Error::new_room(
                format!("{} is neither host nor co-host", actor),
                RoomErrorKind::NotPermitted,
            )),
            None => Err(Self::not_found(actor)),
        }
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.session.is_session_closed {
            return Err(Error::new_room(
                format!("Session {} is closed", self.session.id),
                RoomErrorKind::RoomClosed,
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> RoomState {
        RoomState::new(
            Room {
                id: "room".to_owned(),
                participant_ids: BTreeSet::new(),
            },
            SessionDescriptor {
                id: "session".to_owned(),
                host: "host".to_owned(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn join_approve_leave_rejoin() {
        let mut room = state();
        assert_eq!(room.status_of("host", false), Some(AttendeeStatus::Approved));
        room.request_join("amy").unwrap();
        assert_eq!(room.pending_requests().len(), 1);
        room.approve("host", "amy").unwrap();
        assert_eq!(room.status_of("amy", true), Some(AttendeeStatus::Active));
        assert!(room.room().participant_ids.contains("amy"));

        room.leave("amy").unwrap();
        assert_eq!(room.status_of("amy", true), Some(AttendeeStatus::Left));
        assert!(!room.room().participant_ids.contains("amy"));

        let again = room.request_join("amy").unwrap();
        assert_eq!(again.status(false), AttendeeStatus::Requested);
        assert_eq!(room.attendees().len(), 2);
    }

    #[test]
    fn only_moderators_approve() {
        let mut room = state();
        room.request_join("amy").unwrap();
        room.request_join("ben").unwrap();
        let err = room.approve("ben", "amy").unwrap_err();
        assert_eq!(err.room_kind(), Some(RoomErrorKind::NotPermitted));

        room.approve("host", "ben").unwrap();
        room.promote_co_host("host", "ben").unwrap();
        room.approve("ben", "amy").unwrap();
        let twice = room.approve("host", "amy").unwrap_err();
        assert_eq!(twice.room_kind(), Some(RoomErrorKind::InvalidTransition));
        let unknown = room.approve("host", "nobody").unwrap_err();
        assert_eq!(unknown.room_kind(), Some(RoomErrorKind::AttendeeNotFound));
    }

    #[test]
    fn co_host_needs_approval_and_spares_host() {
        let mut room = state();
        room.request_join("amy").unwrap();
        let err = room.promote_co_host("host", "amy").unwrap_err();
        assert_eq!(err.room_kind(), Some(RoomErrorKind::InvalidTransition));
        let host = room.demote_co_host("host", "host").unwrap_err();
        assert_eq!(host.room_kind(), Some(RoomErrorKind::NotPermitted));

        room.approve("host", "amy").unwrap();
        assert!(room.promote_co_host("host", "amy").unwrap().is_co_host);
        assert!(!room.demote_co_host("host", "amy").unwrap().is_co_host);
    }

    #[test]
    fn kick_revokes_everything() {
        let mut room = state();
        room.request_join("amy").unwrap();
        room.approve("host", "amy").unwrap();
        room.promote_co_host("host", "amy").unwrap();
        let kicked = room.kick("host", "amy").unwrap().clone();
        assert!(kicked.is_left && kicked.kicked_by_host);
        assert!(!kicked.is_co_host && !kicked.approved_by_host);
        let err = room.kick("amy", "host").unwrap_err();
        assert_eq!(err.room_kind(), Some(RoomErrorKind::NotPermitted));
    }

    #[test]
    fn media_flags_need_approval() {
        let mut room = state();
        room.request_join("amy").unwrap();
        let err = room.set_mic("amy", true).unwrap_err();
        assert_eq!(err.room_kind(), Some(RoomErrorKind::NotPermitted));
        room.approve("host", "amy").unwrap();
        room.set_mic("amy", true).unwrap();
        let presenting = room.start_presenting("amy").unwrap();
        assert!(presenting.is_presenting && presenting.is_camera_on);
        assert!(!room.stop_presenting("amy").unwrap().is_presenting);
        assert!(!room.set_camera("amy", false).unwrap().is_camera_on);
    }

    #[test]
    fn recording_is_host_only() {
        let mut room = state();
        room.request_join("amy").unwrap();
        room.approve("host", "amy").unwrap();
        room.request_join("ben").unwrap();
        let err = room.set_recording("amy", true).unwrap_err();
        assert_eq!(err.room_kind(), Some(RoomErrorKind::NotPermitted));
        assert!(!room.attendee("host").unwrap().approved_recording);
        room.set_recording("host", true).unwrap();
        assert!(room.is_being_recorded());
        assert!(room.attendee("host").unwrap().approved_recording);
        assert!(!room.attendee("amy").unwrap().approved_recording);
        assert!(room.attendee("amy").unwrap().present_during_recording);
        assert!(!room.attendee("ben").unwrap().present_during_recording);
        assert!(room.consent_to_recording("amy").unwrap().approved_recording);
    }

    #[test]
    fn dial_targets_follow_policy() {
        let mut room = state();
        for user in ["amy", "ben", "cat"] {
            room.request_join(user).unwrap();
        }
        room.approve("host", "amy").unwrap();
        room.approve("host", "ben").unwrap();

        let host: Vec<_> = room.dial_targets("host").iter().map(|a| a.user_id.clone()).collect();
        assert_eq!(host, vec!["amy", "ben"]);
        let amy: Vec<_> = room.dial_targets("amy").iter().map(|a| a.user_id.clone()).collect();
        assert_eq!(amy, vec!["ben"]);
        assert!(room.dial_targets("ben").is_empty());
        assert!(room.dial_targets("cat").is_empty());
        assert_eq!(room.approved_peers("cat").len(), 3);
    }

    #[test]
    fn apply_update_merges_remote_record() {
        let mut room = state();
        room.apply_update(Attendee {
            approved_by_host: true,
            is_mic_on: true,
            ..Attendee::requested("amy")
        });
        assert_eq!(room.status_of("amy", false), Some(AttendeeStatus::Approved));
        room.apply_update(Attendee {
            is_left: true,
            ..Attendee::requested("amy")
        });
        assert_eq!(room.status_of("amy", false), Some(AttendeeStatus::Left));
        assert_eq!(room.attendees().len(), 2);
    }

    #[test]
    fn closed_room_rejects_requests() {
        let mut room = state();
        room.close();
        let err = room.request_join("amy").unwrap_err();
        assert_eq!(err.room_kind(), Some(RoomErrorKind::RoomClosed));
        room.replace(
            Room::default(),
            SessionDescriptor {
                host: "other".to_owned(),
                ..Default::default()
            },
        );
        assert!(!room.is_closed());
        assert_eq!(room.host_id(), "other");
        assert!(room.attendee("other").unwrap().is_host);
    }
}
