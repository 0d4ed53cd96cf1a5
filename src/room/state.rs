use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Instructor,
    Student,
}

impl fmt::Display for ParticipantRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParticipantRole::Instructor => write!(f, "instructor"),
            ParticipantRole::Student => write!(f, "student"),
        }
    }
}

/// This process's identity in the room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalParticipant {
    pub participant_id: String,
    pub user_id: String,
    pub role: ParticipantRole,
}

impl LocalParticipant {
    /// True when `participant` refers to this process.
    pub fn is_self(&self, participant: &Participant) -> bool {
        participant.participant_id == self.participant_id || participant.user_id == self.user_id
    }
}

/// A remote member of the room, keyed by its signaling connection id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub participant_id: String,
    pub user_id: String,
    pub display_role: Option<ParticipantRole>,
    pub joined_at: DateTime<Utc>,
}

impl Participant {
    pub fn new(participant_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            participant_id: participant_id.into(),
            user_id: user_id.into(),
            display_role: None,
            joined_at: Utc::now(),
        }
    }
}

/// Local view of room membership, excluding this process.
#[derive(Debug, Clone)]
pub struct Room {
    pub id: String,
    participants: HashMap<String, Participant>,
}

impl Room {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            participants: HashMap::new(),
        }
    }

    /// Returns false when the participant was already present.
    pub fn add_participant(&mut self, participant: Participant) -> bool {
        if self.participants.contains_key(&participant.participant_id) {
            return false;
        }
        self.participants
            .insert(participant.participant_id.clone(), participant);
        true
    }

    pub fn remove_participant(&mut self, participant_id: &str) -> Option<Participant> {
        self.participants.remove(participant_id)
    }

    pub fn contains(&self, participant_id: &str) -> bool {
        self.participants.contains_key(participant_id)
    }

    pub fn participant(&self, participant_id: &str) -> Option<&Participant> {
        self.participants.get(participant_id)
    }

    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn clear(&mut self) {
        self.participants.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_is_idempotent_and_remove_reports_presence() {
        let mut room = Room::new("R1");
        assert!(room.add_participant(Participant::new("s1", "u1")));
        assert!(!room.add_participant(Participant::new("s1", "u1")));
        assert_eq!(room.len(), 1);
        assert!(room.remove_participant("s1").is_some());
        assert!(room.remove_participant("s1").is_none());
        assert!(room.is_empty());
    }

    #[test]
    fn self_is_matched_by_either_identifier() {
        let me = LocalParticipant {
            participant_id: "s-me".into(),
            user_id: "u-me".into(),
            role: ParticipantRole::Student,
        };
        assert!(me.is_self(&Participant::new("s-me", "other")));
        assert!(me.is_self(&Participant::new("s-new", "u-me")));
        assert!(!me.is_self(&Participant::new("s2", "u2")));
    }
}
