//! Messages written by the worker into the responses directory.
//!
//! Deserialize names are the folded form produced by [`crate::decode`];
//! decode these types with [`crate::from_str_ci`], never with plain
//! `serde_json::from_str`. Serialized output is camelCase.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::decode::fold_key;

// ============================================================================
// Command responses
// ============================================================================

/// A response file: `response_<id>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase"))]
pub struct CommandResponse {
    pub id: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, rename(deserialize = "requireslogin"))]
    pub requires_login: bool,
    #[serde(default, rename(deserialize = "completedat"))]
    pub completed_at: Option<String>,
}

impl CommandResponse {
    /// Best available human-readable failure text.
    pub fn failure_text(&self) -> String {
        self.error
            .clone()
            .or_else(|| self.message.clone())
            .unwrap_or_else(|| "worker reported failure without details".to_string())
    }
}

/// One game owned by the logged-in account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase"))]
pub struct OwnedGame {
    #[serde(rename(deserialize = "appid"))]
    pub app_id: u32,
    #[serde(default)]
    pub name: String,
}

/// Summary of the worker's local download cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase"))]
pub struct CacheInfo {
    #[serde(default, rename(deserialize = "totalbytes"))]
    pub total_bytes: u64,
    #[serde(default, rename(deserialize = "appcount"))]
    pub app_count: u32,
    #[serde(default)]
    pub path: Option<String>,
}

// ============================================================================
// Credential challenges
// ============================================================================

/// The kind of secret a challenge asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialType {
    Username,
    Password,
    TwoFactor,
    SteamGuard,
    DeviceConfirmation,
}

impl CredentialType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialType::Username => "username",
            CredentialType::Password => "password",
            CredentialType::TwoFactor => "2fa",
            CredentialType::SteamGuard => "steamguard",
            CredentialType::DeviceConfirmation => "device-confirmation",
        }
    }
}

impl std::fmt::Display for CredentialType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CredentialType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match fold_key(s).as_str() {
            "username" | "user" => Ok(CredentialType::Username),
            "password" => Ok(CredentialType::Password),
            "2fa" | "twofactor" | "twofactorcode" | "mobileauth" => Ok(CredentialType::TwoFactor),
            "steamguard" | "emailcode" | "authcode" => Ok(CredentialType::SteamGuard),
            "deviceconfirmation" | "confirmation" => Ok(CredentialType::DeviceConfirmation),
            _ => Err(format!("unknown credential type: {}", s)),
        }
    }
}

impl Serialize for CredentialType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CredentialType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A challenge file: `auth_challenge_<id>.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase"))]
pub struct CredentialChallenge {
    #[serde(rename(deserialize = "challengeid"))]
    pub challenge_id: String,
    #[serde(rename(deserialize = "credentialtype"))]
    pub credential_type: CredentialType,
    /// Worker's per-challenge P-256 public key, base64.
    #[serde(rename(deserialize = "serverpublickey"))]
    pub server_public_key: String,
    /// Masked e-mail hint for Steam Guard codes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(
        default,
        rename(deserialize = "createdat"),
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<String>,
    #[serde(
        default,
        rename(deserialize = "expiresat"),
        skip_serializing_if = "Option::is_none"
    )]
    pub expires_at: Option<String>,
}

// ============================================================================
// Daemon status
// ============================================================================

/// Coarse worker state reported in `daemon_status.json`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DaemonState {
    Starting,
    AwaitingLogin,
    LoggedIn,
    Prefilling,
    Error,
    /// Anything the orchestrator does not interpret; forwarded verbatim.
    Other(String),
}

impl DaemonState {
    pub fn as_str(&self) -> &str {
        match self {
            DaemonState::Starting => "starting",
            DaemonState::AwaitingLogin => "awaiting-login",
            DaemonState::LoggedIn => "logged-in",
            DaemonState::Prefilling => "prefilling",
            DaemonState::Error => "error",
            DaemonState::Other(raw) => raw,
        }
    }
}

impl From<&str> for DaemonState {
    fn from(raw: &str) -> Self {
        match fold_key(raw).as_str() {
            "starting" | "initializing" => DaemonState::Starting,
            "awaitinglogin" | "notloggedin" | "loggedout" => DaemonState::AwaitingLogin,
            "loggedin" | "authenticated" | "ready" => DaemonState::LoggedIn,
            "prefilling" | "busy" => DaemonState::Prefilling,
            "error" => DaemonState::Error,
            _ => DaemonState::Other(raw.to_string()),
        }
    }
}

impl std::fmt::Display for DaemonState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for DaemonState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DaemonState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(DaemonState::from(raw.as_str()))
    }
}

/// Contents of `daemon_status.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase"))]
pub struct DaemonStatus {
    pub status: DaemonState,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

// ============================================================================
// Prefill progress
// ============================================================================

/// Overall state of a prefill run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrefillState {
    Idle,
    Running,
    Completed,
    Failed,
    Error,
    Cancelled,
}

impl PrefillState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrefillState::Idle => "idle",
            PrefillState::Running => "running",
            PrefillState::Completed => "completed",
            PrefillState::Failed => "failed",
            PrefillState::Error => "error",
            PrefillState::Cancelled => "cancelled",
        }
    }

    /// Whether the run has ended.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PrefillState::Completed
                | PrefillState::Failed
                | PrefillState::Error
                | PrefillState::Cancelled
        )
    }
}

impl std::fmt::Display for PrefillState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PrefillState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match fold_key(s).as_str() {
            "idle" => Ok(PrefillState::Idle),
            "running" | "downloading" | "prefilling" | "started" => Ok(PrefillState::Running),
            "completed" | "complete" | "done" => Ok(PrefillState::Completed),
            "failed" => Ok(PrefillState::Failed),
            "error" => Ok(PrefillState::Error),
            "cancelled" | "canceled" => Ok(PrefillState::Cancelled),
            _ => Err(format!("unknown prefill state: {}", s)),
        }
    }
}

impl Serialize for PrefillState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for PrefillState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// One snapshot from `prefill_progress.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase"))]
pub struct PrefillProgress {
    pub state: PrefillState,
    #[serde(default, rename(deserialize = "currentappid"))]
    pub current_app_id: Option<u32>,
    #[serde(default, rename(deserialize = "currentappname"))]
    pub current_app_name: Option<String>,
    /// Bytes downloaded for the current app.
    #[serde(default, rename(deserialize = "bytesdownloaded"))]
    pub bytes_downloaded: u64,
    /// Total bytes for the current app.
    #[serde(default, rename(deserialize = "totalbytes"))]
    pub total_bytes: u64,
    /// Cumulative bytes for the whole run, when the worker tracks it.
    #[serde(
        default,
        rename(deserialize = "totalbytestransferred"),
        skip_serializing_if = "Option::is_none"
    )]
    pub total_bytes_transferred: Option<u64>,
    #[serde(
        default,
        rename(deserialize = "percentcomplete"),
        skip_serializing_if = "Option::is_none"
    )]
    pub percent_complete: Option<f64>,
    #[serde(
        default,
        rename(deserialize = "bytespersecond"),
        skip_serializing_if = "Option::is_none"
    )]
    pub bytes_per_second: Option<f64>,
    #[serde(
        default,
        rename(deserialize = "totalapps"),
        skip_serializing_if = "Option::is_none"
    )]
    pub total_apps: Option<u32>,
    #[serde(
        default,
        rename(deserialize = "updatedapps"),
        skip_serializing_if = "Option::is_none"
    )]
    pub updated_apps: Option<u32>,
    #[serde(
        default,
        rename(deserialize = "errormessage"),
        skip_serializing_if = "Option::is_none"
    )]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PrefillProgress {
    /// The app being processed, treating `0` as "none".
    pub fn current_app(&self) -> Option<u32> {
        self.current_app_id.filter(|id| *id != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::from_str_ci;

    #[test]
    fn test_challenge_from_worker_casing() {
        let challenge: CredentialChallenge = from_str_ci(
            r#"{"ChallengeId":"c-1","CredentialType":"Password","ServerPublicKey":"AAAA","Email":null}"#,
        )
        .unwrap();
        assert_eq!(challenge.challenge_id, "c-1");
        assert_eq!(challenge.credential_type, CredentialType::Password);
        assert!(challenge.email.is_none());
    }

    #[test]
    fn test_credential_type_aliases() {
        assert_eq!(
            "2fa".parse::<CredentialType>().unwrap(),
            CredentialType::TwoFactor
        );
        assert_eq!(
            "SteamGuard".parse::<CredentialType>().unwrap(),
            CredentialType::SteamGuard
        );
        assert_eq!(
            "device_confirmation".parse::<CredentialType>().unwrap(),
            CredentialType::DeviceConfirmation
        );
        assert!("fingerprint".parse::<CredentialType>().is_err());
    }

    #[test]
    fn test_unknown_challenge_type_is_rejected() {
        let result: serde_json::Result<CredentialChallenge> = from_str_ci(
            r#"{"challengeId":"c","credentialType":"retina","serverPublicKey":"k"}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_daemon_status_states() {
        let status: DaemonStatus =
            from_str_ci(r#"{"Status":"logged-in","Message":"ok"}"#).unwrap();
        assert_eq!(status.status, DaemonState::LoggedIn);

        let status: DaemonStatus = from_str_ci(r#"{"status":"awaiting_login"}"#).unwrap();
        assert_eq!(status.status, DaemonState::AwaitingLogin);

        let status: DaemonStatus = from_str_ci(r#"{"status":"warming-up"}"#).unwrap();
        assert_eq!(status.status, DaemonState::Other("warming-up".to_string()));
        assert_eq!(status.status.as_str(), "warming-up");
    }

    #[test]
    fn test_progress_snapshot() {
        let progress: PrefillProgress = from_str_ci(
            r#"{"state":"Downloading","currentAppId":730,"currentAppName":"CS2",
                "bytesDownloaded":1024,"totalBytes":4096,"percentComplete":25.0}"#,
        )
        .unwrap();
        assert_eq!(progress.state, PrefillState::Running);
        assert_eq!(progress.current_app(), Some(730));
        assert_eq!(progress.bytes_downloaded, 1024);
        assert!(progress.total_bytes_transferred.is_none());

        let serialized = serde_json::to_value(&progress).unwrap();
        assert_eq!(serialized["currentAppId"], 730);
        assert_eq!(serialized["state"], "running");
    }

    #[test]
    fn test_progress_zero_app_means_none() {
        let progress: PrefillProgress =
            from_str_ci(r#"{"state":"idle","currentAppId":0}"#).unwrap();
        assert_eq!(progress.current_app(), None);
    }

    #[test]
    fn test_unknown_progress_state_is_rejected() {
        let result: serde_json::Result<PrefillProgress> = from_str_ci(r#"{"state":"paused"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_response_with_data() {
        let response: CommandResponse = from_str_ci(
            r#"{"Id":"r1","Success":true,"Data":[{"AppId":570,"Name":"Dota 2"}],"RequiresLogin":false}"#,
        )
        .unwrap();
        assert!(response.success);
        let games: Vec<OwnedGame> =
            serde_json::from_value(response.data.clone().unwrap()).unwrap();
        assert_eq!(games[0].app_id, 570);
        assert_eq!(response.failure_text(), "worker reported failure without details");
    }
}
