use crate::{
    error::BackendError,
    types::{BackendCommand, BackendEvent, SessionState},
};

#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    state: SessionState,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self {
            state: SessionState::SignedOut,
        }
    }
}

impl SessionStateMachine {
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    pub fn apply(&mut self, command: &BackendCommand) -> Result<Vec<BackendEvent>, BackendError> {
        use BackendCommand::*;

        match command {
            Login { .. } | Register { .. } | RestoreSession => self.transition_from_any_of(
                &[SessionState::SignedOut, SessionState::Expired],
                SessionState::Authenticating,
                "login_or_restore",
            ),
            Logout => {
                if self.state == SessionState::SignedOut {
                    return Err(BackendError::invalid_state(self.state, "logout"));
                }
                self.state = SessionState::SignedOut;
                Ok(vec![BackendEvent::StateChanged {
                    state: SessionState::SignedOut,
                }])
            }
            LoadSnapshot { .. }
            | Refresh
            | SelectConversation { .. }
            | Archive { .. }
            | Unarchive { .. }
            | Delete { .. } => {
                if self.is_active() {
                    Ok(Vec::new())
                } else {
                    Err(BackendError::invalid_state(
                        self.state,
                        "conversation command",
                    ))
                }
            }
        }
    }

    pub fn on_auth_result(&mut self, success: bool) -> Result<BackendEvent, BackendError> {
        if self.state != SessionState::Authenticating {
            return Err(BackendError::invalid_state(self.state, "on_auth_result"));
        }

        let next = if success {
            SessionState::Active
        } else {
            SessionState::SignedOut
        };

        self.state = next;
        Ok(BackendEvent::StateChanged { state: next })
    }

    /// Renewal failed for good. Returns `None` when the session was not active,
    /// so the expiry is only reported once.
    pub fn on_session_expired(&mut self) -> Option<BackendEvent> {
        if self.state != SessionState::Active {
            return None;
        }
        self.state = SessionState::Expired;
        Some(BackendEvent::StateChanged {
            state: SessionState::Expired,
        })
    }

    fn transition_from_any_of(
        &mut self,
        expected: &[SessionState],
        next: SessionState,
        action: &str,
    ) -> Result<Vec<BackendEvent>, BackendError> {
        if !expected.contains(&self.state) {
            return Err(BackendError::invalid_state(self.state, action));
        }
        self.state = next;
        Ok(vec![BackendEvent::StateChanged { state: next }])
    }
}
