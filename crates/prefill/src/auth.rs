//! Login state machine for one worker.

use std::collections::HashSet;

use prefill_protocol::{CredentialChallenge, CredentialType, DaemonState};
use serde::{Deserialize, Serialize};

/// Where a session is in the worker's login flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AuthState {
    #[default]
    NotAuthenticated,
    LoggingIn,
    PasswordRequired,
    TwoFactorRequired,
    SteamGuardRequired,
    DeviceConfirmationRequired,
    Authenticated,
}

impl AuthState {
    /// State entered when the worker asks for a credential of this type.
    ///
    /// A username request keeps the session in `LoggingIn`: there is no
    /// dedicated state for it and the flow has not progressed yet.
    pub fn for_challenge(kind: CredentialType) -> Self {
        match kind {
            CredentialType::Username => AuthState::LoggingIn,
            CredentialType::Password => AuthState::PasswordRequired,
            CredentialType::TwoFactor => AuthState::TwoFactorRequired,
            CredentialType::SteamGuard => AuthState::SteamGuardRequired,
            CredentialType::DeviceConfirmation => AuthState::DeviceConfirmationRequired,
        }
    }

    /// State implied by a worker status, if the status says anything about login.
    pub fn from_daemon(state: &DaemonState) -> Option<Self> {
        match state {
            DaemonState::AwaitingLogin => Some(AuthState::NotAuthenticated),
            DaemonState::LoggedIn => Some(AuthState::Authenticated),
            DaemonState::Starting
            | DaemonState::Prefilling
            | DaemonState::Error
            | DaemonState::Other(_) => None,
        }
    }

    /// The worker is waiting on the user for a secret.
    pub fn awaits_credential(&self) -> bool {
        match self {
            AuthState::PasswordRequired
            | AuthState::TwoFactorRequired
            | AuthState::SteamGuardRequired
            | AuthState::DeviceConfirmationRequired => true,
            AuthState::NotAuthenticated | AuthState::LoggingIn | AuthState::Authenticated => {
                false
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AuthState::NotAuthenticated => "NotAuthenticated",
            AuthState::LoggingIn => "LoggingIn",
            AuthState::PasswordRequired => "PasswordRequired",
            AuthState::TwoFactorRequired => "TwoFactorRequired",
            AuthState::SteamGuardRequired => "SteamGuardRequired",
            AuthState::DeviceConfirmationRequired => "DeviceConfirmationRequired",
            AuthState::Authenticated => "Authenticated",
        }
    }
}

impl std::fmt::Display for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of observing a challenge file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeOutcome {
    /// Already seen; nothing to do.
    Duplicate,
    /// Newly pending. `changed` is set when the auth state moved.
    Accepted { changed: Option<AuthState> },
}

/// Auth state plus the challenge currently held for the user.
///
/// Every mutator returns `Some(state)` only when the state actually changed,
/// so callers emit exactly one notification per transition.
#[derive(Debug, Clone, Default)]
pub struct AuthTracker {
    state: AuthState,
    pending: Option<CredentialChallenge>,
    seen: HashSet<String>,
}

impl AuthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn pending_challenge(&self) -> Option<&CredentialChallenge> {
        self.pending.as_ref()
    }

    fn set(&mut self, next: AuthState) -> Option<AuthState> {
        if self.state == next {
            None
        } else {
            self.state = next;
            Some(next)
        }
    }

    /// A login command was sent.
    pub fn begin_login(&mut self) -> Option<AuthState> {
        self.pending = None;
        self.set(AuthState::LoggingIn)
    }

    pub fn observe_challenge(&mut self, challenge: CredentialChallenge) -> ChallengeOutcome {
        if !self.seen.insert(challenge.challenge_id.clone()) {
            return ChallengeOutcome::Duplicate;
        }
        let next = AuthState::for_challenge(challenge.credential_type);
        self.pending = Some(challenge);
        ChallengeOutcome::Accepted {
            changed: self.set(next),
        }
    }

    /// Whether a challenge id has already been handled.
    pub fn has_seen(&self, challenge_id: &str) -> bool {
        self.seen.contains(challenge_id)
    }

    /// Mark a challenge as handled without holding it, e.g. when its file
    /// vanished before we could read it.
    pub fn mark_seen(&mut self, challenge_id: &str) {
        self.seen.insert(challenge_id.to_string());
    }

    /// Take the pending challenge if its id matches.
    pub fn claim_challenge(&mut self, challenge_id: &str) -> Option<CredentialChallenge> {
        match self.pending {
            Some(ref pending) if pending.challenge_id == challenge_id => self.pending.take(),
            _ => None,
        }
    }

    /// Apply a worker status. Statuses without login meaning are ignored.
    pub fn observe_status(&mut self, status: &DaemonState) -> Option<AuthState> {
        let next = AuthState::from_daemon(status)?;
        match next {
            AuthState::Authenticated | AuthState::NotAuthenticated => self.pending = None,
            AuthState::LoggingIn
            | AuthState::PasswordRequired
            | AuthState::TwoFactorRequired
            | AuthState::SteamGuardRequired
            | AuthState::DeviceConfirmationRequired => {}
        }
        self.set(next)
    }

    /// Force the flow back to the start and drop any held challenge.
    pub fn reset(&mut self) -> Option<AuthState> {
        self.pending = None;
        self.set(AuthState::NotAuthenticated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn challenge(id: &str, kind: CredentialType) -> CredentialChallenge {
        CredentialChallenge {
            challenge_id: id.to_string(),
            credential_type: kind,
            server_public_key: "AAAA".to_string(),
            email: None,
            created_at: None,
            expires_at: None,
        }
    }

    #[test]
    fn test_challenge_types_map_to_states() {
        assert_eq!(
            AuthState::for_challenge(CredentialType::Password),
            AuthState::PasswordRequired
        );
        assert_eq!(
            AuthState::for_challenge(CredentialType::TwoFactor),
            AuthState::TwoFactorRequired
        );
        assert_eq!(
            AuthState::for_challenge(CredentialType::SteamGuard),
            AuthState::SteamGuardRequired
        );
        assert_eq!(
            AuthState::for_challenge(CredentialType::DeviceConfirmation),
            AuthState::DeviceConfirmationRequired
        );
        assert_eq!(
            AuthState::for_challenge(CredentialType::Username),
            AuthState::LoggingIn
        );
    }

    #[test]
    fn test_login_flow() {
        let mut auth = AuthTracker::new();
        assert_eq!(auth.begin_login(), Some(AuthState::LoggingIn));

        let outcome = auth.observe_challenge(challenge("c1", CredentialType::Password));
        assert_eq!(
            outcome,
            ChallengeOutcome::Accepted {
                changed: Some(AuthState::PasswordRequired)
            }
        );
        assert!(auth.state().awaits_credential());

        assert!(auth.claim_challenge("other").is_none());
        assert!(auth.claim_challenge("c1").is_some());
        assert!(auth.pending_challenge().is_none());

        assert_eq!(
            auth.observe_status(&DaemonState::LoggedIn),
            Some(AuthState::Authenticated)
        );
        assert_eq!(auth.observe_status(&DaemonState::LoggedIn), None);
    }

    #[test]
    fn test_duplicate_challenge_ignored() {
        let mut auth = AuthTracker::new();
        auth.begin_login();
        auth.observe_challenge(challenge("c1", CredentialType::TwoFactor));
        assert_eq!(
            auth.observe_challenge(challenge("c1", CredentialType::TwoFactor)),
            ChallengeOutcome::Duplicate
        );
    }

    #[test]
    fn test_marked_challenge_is_not_accepted() {
        let mut auth = AuthTracker::new();
        auth.begin_login();
        auth.mark_seen("gone");
        assert!(auth.has_seen("gone"));
        assert_eq!(
            auth.observe_challenge(challenge("gone", CredentialType::Password)),
            ChallengeOutcome::Duplicate
        );
        assert_eq!(auth.state(), AuthState::LoggingIn);

        // Observing is what marks a challenge as handled.
        assert!(!auth.has_seen("c2"));
        auth.observe_challenge(challenge("c2", CredentialType::Password));
        assert!(auth.has_seen("c2"));
        assert_eq!(auth.pending_challenge().unwrap().challenge_id, "c2");
    }

    #[test]
    fn test_reset_from_any_state() {
        for kind in [
            CredentialType::Password,
            CredentialType::TwoFactor,
            CredentialType::SteamGuard,
            CredentialType::DeviceConfirmation,
        ] {
            let mut auth = AuthTracker::new();
            auth.begin_login();
            auth.observe_challenge(challenge("c", kind));
            assert_eq!(auth.reset(), Some(AuthState::NotAuthenticated));
            assert!(auth.pending_challenge().is_none());
        }

        let mut auth = AuthTracker::new();
        assert_eq!(auth.reset(), None);
    }

    #[test]
    fn test_unrelated_status_is_ignored() {
        let mut auth = AuthTracker::new();
        auth.begin_login();
        assert_eq!(auth.observe_status(&DaemonState::Prefilling), None);
        assert_eq!(auth.state(), AuthState::LoggingIn);
    }
}
