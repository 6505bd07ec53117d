use crate::autosave::SaveTarget;
use crate::model::{OwnerId, Period};

/// What the host knows about the signed-in user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    /// Auth has not settled yet; nothing may be read or written.
    Resolving,
    Anonymous,
    SignedIn(OwnerId),
}

/// Identity and period an editing session works on. Passed in explicitly
/// by the host; nothing in the engine reads ambient session state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub auth: AuthState,
    pub period: Period,
}

impl SessionContext {
    pub fn signed_in(owner: OwnerId, period: Period) -> Self {
        Self {
            auth: AuthState::SignedIn(owner),
            period,
        }
    }

    pub fn anonymous(period: Period) -> Self {
        Self {
            auth: AuthState::Anonymous,
            period,
        }
    }

    pub fn resolving(period: Period) -> Self {
        Self {
            auth: AuthState::Resolving,
            period,
        }
    }

    pub fn owner(&self) -> Option<&OwnerId> {
        match &self.auth {
            AuthState::SignedIn(owner) => Some(owner),
            _ => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self.auth, AuthState::Resolving)
    }

    /// Where autosave writes go; `None` until auth has settled.
    pub fn save_target(&self) -> Option<SaveTarget> {
        match &self.auth {
            AuthState::Resolving => None,
            AuthState::Anonymous => Some(SaveTarget::Local),
            AuthState::SignedIn(owner) => Some(SaveTarget::Remote {
                owner: owner.clone(),
                period: self.period,
            }),
        }
    }
}
