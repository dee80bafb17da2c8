//! Version information for the client and the worker it expects.

/// jsockd release this client speaks to. READY lines must carry exactly this
/// version unless the check is disabled.
pub const JSOCKD_VERSION: &str = "0.0.139";

/// Client version from Cargo.toml
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Versions in play for a running client.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub client: &'static str,
    /// Version required from the worker.
    pub expected_jsockd: &'static str,
    /// Version the current worker reported, once it is ready.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsockd: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            client: CLIENT_VERSION,
            expected_jsockd: JSOCKD_VERSION,
            jsockd: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_jsockd(mut self, version: impl Into<String>) -> Self {
        self.jsockd = Some(version.into());
        self
    }

    /// True if `reported` is acceptable as the worker version.
    pub fn accepts(reported: &str, skip_check: bool) -> bool {
        skip_check || reported == JSOCKD_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_check() {
        assert!(VersionInfo::accepts(JSOCKD_VERSION, false));
        assert!(!VersionInfo::accepts("0.0.1", false));
        assert!(!VersionInfo::accepts("", false));
        assert!(VersionInfo::accepts("0.0.1", true));
    }

    #[test]
    fn version_info_serializes_minimal() {
        let info = VersionInfo {
            client: "0.1.0",
            expected_jsockd: "0.0.139",
            jsockd: None,
        };
        insta::assert_json_snapshot!(info, @r#"
        {
          "client": "0.1.0",
          "expected_jsockd": "0.0.139"
        }
        "#);
    }

    #[test]
    fn version_info_serializes_reported() {
        let info = VersionInfo {
            client: "0.1.0",
            expected_jsockd: "0.0.139",
            jsockd: None,
        }
        .with_jsockd("0.0.139");
        insta::assert_json_snapshot!(info, @r#"
        {
          "client": "0.1.0",
          "expected_jsockd": "0.0.139",
          "jsockd": "0.0.139"
        }
        "#);
    }
}
