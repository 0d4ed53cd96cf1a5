mod state;

pub use state::{LocalParticipant, Participant, ParticipantRole, Room};
