use std::path::PathBuf;

/// Locates executables on PATH.
pub struct WhichUtil;

impl WhichUtil {
    /// Resolve `command` to an executable path.
    ///
    /// - Paths containing a separator are checked as-is.
    /// - Bare names are searched on `PATH`.
    /// - If `require` is true and the command is not found, returns an error,
    ///   otherwise `Ok(None)`.
    pub fn which(command: &str, require: bool) -> anyhow::Result<Option<PathBuf>> {
        if command.is_empty() {
            if require {
                anyhow::bail!("command must not be empty");
            }
            return Ok(None);
        }

        // `which` checks paths with a separator directly instead of searching.
        match which::which(command).ok() {
            Some(path) => Ok(Some(path)),
            None if require => anyhow::bail!(
                "{command}: command not found. Make sure '{command}' is installed and its location included in the 'PATH' environment variable."
            ),
            None => Ok(None),
        }
    }
}
