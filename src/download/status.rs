//! Outcome of one download session.

use std::fmt;

use serde::Serialize;

/// How a session ended, and what the mirror loop should do next.
///
/// | status       | retry same | try next |
/// |--------------|-----------:|---------:|
/// | Success      | no         | no       |
/// | Stopped      | no         | no       |
/// | Failed       | yes        | yes      |
/// | InvalidInput | no         | yes      |
/// | BadConfig    | no         | no       |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    /// Everything written and validated.
    Success,
    /// Stopped by the user; partial output removed.
    Stopped,
    /// Transient failure; the partial file and checkpoint are kept.
    Failed,
    /// The source is unusable (unsupported link, too small, bad playlist).
    InvalidInput,
    /// The local environment is unusable (output location).
    BadConfig,
}

impl DownloadStatus {
    /// Whether rerunning against the same mirror (resuming) may help.
    #[must_use]
    pub fn retry_same(self) -> bool {
        matches!(self, Self::Failed)
    }

    /// Whether another mirror may help.
    #[must_use]
    pub fn try_next(self) -> bool {
        matches!(self, Self::Failed | Self::InvalidInput)
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "success",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::InvalidInput => "invalid_input",
            Self::BadConfig => "bad_config",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_retry_table() {
        let cases = [
            (DownloadStatus::Success, false, false),
            (DownloadStatus::Stopped, false, false),
            (DownloadStatus::Failed, true, true),
            (DownloadStatus::InvalidInput, false, true),
            (DownloadStatus::BadConfig, false, false),
        ];
        for (status, retry_same, try_next) in cases {
            assert_eq!(status.retry_same(), retry_same, "{status} retry_same");
            assert_eq!(status.try_next(), try_next, "{status} try_next");
        }
    }
}
