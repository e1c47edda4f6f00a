//! User-Agent sent with every request.
//!
//! Callers can still override it per request with a `User-Agent` header.

/// Product token shared by the library and the CLI.
const PRODUCT: &str = "streamdl";

/// Default User-Agent: `streamdl/<version>`.
#[must_use]
pub(crate) fn default_download_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("{PRODUCT}/{version}")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_user_agent_carries_crate_version() {
        let ua = default_download_user_agent();
        assert_eq!(
            env!("CARGO_PKG_VERSION"),
            ua.strip_prefix("streamdl/").unwrap(),
            "UA must carry the crate version: {ua}"
        );
    }
}
