//! Commands written by the orchestrator into the commands directory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Command vocabulary understood by the worker daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandKind {
    /// Begin a login; the worker answers with challenges or `logged-in`.
    Login,
    /// Answer one credential challenge with an encrypted value.
    ProvideCredential,
    /// Abort an in-flight login.
    CancelLogin,
    /// Replace the set of apps selected for prefill.
    SetSelectedApps,
    /// Start a prefill run.
    Prefill,
    /// Abort the running prefill.
    CancelPrefill,
    /// List games owned by the logged-in account.
    GetOwnedGames,
    /// List the currently selected apps.
    GetSelectedApps,
    /// Ask for a fresh status report.
    GetStatus,
    /// Report on the local download cache.
    GetCacheInfo,
    /// Wipe the local download cache.
    ClearCache,
    /// Graceful daemon shutdown.
    Shutdown,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Login => "login",
            CommandKind::ProvideCredential => "provide-credential",
            CommandKind::CancelLogin => "cancel-login",
            CommandKind::SetSelectedApps => "set-selected-apps",
            CommandKind::Prefill => "prefill",
            CommandKind::CancelPrefill => "cancel-prefill",
            CommandKind::GetOwnedGames => "get-owned-games",
            CommandKind::GetSelectedApps => "get-selected-apps",
            CommandKind::GetStatus => "get-status",
            CommandKind::GetCacheInfo => "get-cache-info",
            CommandKind::ClearCache => "clear-cache",
            CommandKind::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command file: `cmd_<id>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    /// Correlates the command with `response_<id>.json`.
    pub id: String,
    #[serde(rename = "type")]
    pub kind: CommandKind,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub parameters: Value,
    pub created_at: DateTime<Utc>,
}

impl CommandRequest {
    pub fn new(id: impl Into<String>, kind: CommandKind, parameters: Value) -> Self {
        Self {
            id: id.into(),
            kind,
            parameters,
            created_at: Utc::now(),
        }
    }
}

/// Options for a prefill run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PrefillOptions {
    /// Prefill every owned app rather than the selection.
    pub all: bool,
    /// Include recently played apps.
    pub recent: bool,
    /// Include recently purchased apps.
    pub recently_purchased: bool,
    /// Include the N most popular apps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top: Option<u32>,
    /// Re-download even when the cache reports the app as up to date.
    pub force: bool,
    /// Restrict depots to these operating systems (`windows`, `linux`, `macos`).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub operating_systems: Vec<String>,
}

/// Encrypted answer to one credential challenge.
///
/// All binary fields are standard base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedCredential {
    pub challenge_id: String,
    /// Ephemeral P-256 public key, SubjectPublicKeyInfo DER.
    pub client_public_key: String,
    pub encrypted_credential: String,
    pub nonce: String,
    pub tag: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_request_wire_shape() {
        let cmd = CommandRequest::new(
            "c1",
            CommandKind::SetSelectedApps,
            json!({ "appIds": [730, 570] }),
        );
        let value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(value["id"], "c1");
        assert_eq!(value["type"], "set-selected-apps");
        assert_eq!(value["parameters"]["appIds"][1], 570);
        assert!(value.get("createdAt").is_some());
    }

    #[test]
    fn test_command_without_parameters_omits_field() {
        let cmd = CommandRequest::new("c2", CommandKind::Shutdown, Value::Null);
        let value = serde_json::to_value(&cmd).unwrap();
        assert!(value.get("parameters").is_none());
    }

    #[test]
    fn test_kind_display_matches_serde() {
        for kind in [
            CommandKind::Login,
            CommandKind::ProvideCredential,
            CommandKind::GetOwnedGames,
            CommandKind::ClearCache,
        ] {
            let serialized = serde_json::to_value(kind).unwrap();
            assert_eq!(serialized, json!(kind.to_string()));
        }
    }

    #[test]
    fn test_prefill_options_serialization() {
        let options = PrefillOptions {
            recent: true,
            operating_systems: vec!["linux".to_string()],
            ..Default::default()
        };
        let value = serde_json::to_value(&options).unwrap();
        assert_eq!(value["recent"], true);
        assert_eq!(value["recentlyPurchased"], false);
        assert!(value.get("top").is_none());
        assert_eq!(value["operatingSystems"][0], "linux");
    }
}
