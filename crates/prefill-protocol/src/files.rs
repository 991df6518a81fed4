//! Mailbox file naming conventions.

/// Worker status, overwritten in place.
pub const DAEMON_STATUS_FILE: &str = "daemon_status.json";

/// Prefill progress, overwritten while work runs and deleted when it ends.
pub const PREFILL_PROGRESS_FILE: &str = "prefill_progress.json";

/// Prefix of credential challenge files (`auth_challenge_<id>.json`).
pub const CHALLENGE_PREFIX: &str = "auth_challenge_";

/// Prefix of command response files (`response_<id>.json`).
pub const RESPONSE_PREFIX: &str = "response_";

/// Prefix of command files (`cmd_<id>.json`).
pub const COMMAND_PREFIX: &str = "cmd_";

const JSON_SUFFIX: &str = ".json";

/// File name for a command with the given id.
pub fn command_file_name(id: &str) -> String {
    format!("{COMMAND_PREFIX}{id}{JSON_SUFFIX}")
}

/// File name for the response to the command with the given id.
pub fn response_file_name(id: &str) -> String {
    format!("{RESPONSE_PREFIX}{id}{JSON_SUFFIX}")
}

/// Classification of a file found in the responses directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResponseFile {
    /// `auth_challenge_<id>.json`
    Challenge(String),
    /// `daemon_status.json`
    Status,
    /// `prefill_progress.json`
    Progress,
    /// `response_<id>.json`
    Response(String),
    /// Temp files, editor droppings and anything else.
    Other,
}

impl ResponseFile {
    /// Classify a bare file name (no directory component).
    pub fn classify(file_name: &str) -> Self {
        if file_name == DAEMON_STATUS_FILE {
            return ResponseFile::Status;
        }
        if file_name == PREFILL_PROGRESS_FILE {
            return ResponseFile::Progress;
        }

        let Some(stem) = file_name.strip_suffix(JSON_SUFFIX) else {
            return ResponseFile::Other;
        };

        if let Some(id) = stem.strip_prefix(CHALLENGE_PREFIX)
            && !id.is_empty()
        {
            return ResponseFile::Challenge(id.to_string());
        }
        if let Some(id) = stem.strip_prefix(RESPONSE_PREFIX)
            && !id.is_empty()
        {
            return ResponseFile::Response(id.to_string());
        }

        ResponseFile::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(ResponseFile::classify("daemon_status.json"), ResponseFile::Status);
        assert_eq!(
            ResponseFile::classify("prefill_progress.json"),
            ResponseFile::Progress
        );
        assert_eq!(
            ResponseFile::classify("auth_challenge_abc.json"),
            ResponseFile::Challenge("abc".to_string())
        );
        assert_eq!(
            ResponseFile::classify("response_42.json"),
            ResponseFile::Response("42".to_string())
        );
        assert_eq!(ResponseFile::classify("auth_challenge_.json"), ResponseFile::Other);
        assert_eq!(
            ResponseFile::classify("daemon_status.json.tmp"),
            ResponseFile::Other
        );
        assert_eq!(ResponseFile::classify("notes.txt"), ResponseFile::Other);
    }

    #[test]
    fn test_file_names() {
        assert_eq!(command_file_name("x1"), "cmd_x1.json");
        assert_eq!(response_file_name("x1"), "response_x1.json");
    }
}
