/// Build constants for the grader host.
/// Values come from compile-time environment variables with defaults.

/// Source control information.
pub struct Source;

impl Source {
    /// The commit hash from which this binary was built.
    /// Set via the `GRADER_COMMIT_HASH` env var at compile time, or "N/A".
    pub const COMMIT_HASH: &'static str = match option_env!("GRADER_COMMIT_HASH") {
        Some(h) => h,
        None => "N/A",
    };
}

/// Grader host package metadata.
#[derive(Debug, Clone)]
pub struct GraderPackage;

impl GraderPackage {
    /// The semantic version, from `CARGO_PKG_VERSION`.
    pub const VERSION: &'static str = env!("CARGO_PKG_VERSION");

    /// Product name used in log banners and the user agent.
    pub const NAME: &'static str = "grader-host";

    /// `name/version (commit)` for startup logging.
    pub fn banner() -> String {
        format!("{}/{} ({})", Self::NAME, Self::VERSION, Source::COMMIT_HASH)
    }
}
