//! Local mirror of the room channel presence state.

use huddle_signalling_proto::{Participant, ParticipantId};

/// Remote participants currently present in a room channel, in order of
/// their appearance.
///
/// Never contains the local participant.
#[derive(Debug)]
pub struct PresenceSet {
    /// ID of the local participant.
    local_id: ParticipantId,

    /// Present remote participants.
    members: Vec<Participant>,
}

impl PresenceSet {
    /// Creates new empty [`PresenceSet`] of the provided local participant.
    #[must_use]
    pub fn new(local_id: ParticipantId) -> Self {
        Self {
            local_id,
            members: Vec::new(),
        }
    }

    /// Replaces the whole set with the provided members.
    ///
    /// Display names of already present members are kept if the new state
    /// doesn't carry them.
    pub fn sync(&mut self, members: Vec<Participant>) {
        let mut synced: Vec<Participant> = Vec::with_capacity(members.len());
        for mut member in members {
            if member.user_id == self.local_id
                || synced.iter().any(|m| m.user_id == member.user_id)
            {
                continue;
            }
            if member.username.is_none() {
                member.username = self.display_name(&member.user_id);
            }
            synced.push(member);
        }
        self.members = synced;
    }

    /// Adds the provided participant.
    ///
    /// Returns `false` if it is the local participant or is present
    /// already. Display name of an already present participant is updated
    /// anyway.
    pub fn join(&mut self, participant: Participant) -> bool {
        if participant.user_id == self.local_id {
            return false;
        }
        if let Some(present) = self
            .members
            .iter_mut()
            .find(|m| m.user_id == participant.user_id)
        {
            if participant.username.is_some() {
                present.username = participant.username;
            }
            return false;
        }
        self.members.push(participant);
        true
    }

    /// Removes the participant with the provided ID.
    ///
    /// Returns `false` if it wasn't present.
    pub fn leave(&mut self, id: &ParticipantId) -> bool {
        let before = self.members.len();
        self.members.retain(|m| &m.user_id != id);
        self.members.len() != before
    }

    /// Indicates whether the participant with the provided ID is present.
    #[must_use]
    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.members.iter().any(|m| &m.user_id == id)
    }

    /// Returns display name of the present participant with the provided ID.
    #[must_use]
    pub fn display_name(&self, id: &ParticipantId) -> Option<String> {
        self.members
            .iter()
            .find(|m| &m.user_id == id)
            .and_then(|m| m.username.clone())
    }

    /// Returns all the present remote participants.
    #[must_use]
    pub fn members(&self) -> &[Participant] {
        &self.members
    }
}
