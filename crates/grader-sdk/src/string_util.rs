/// Small string helpers used across the grader crates.
pub struct StringUtil;

impl StringUtil {
    /// Convert a string to a boolean.
    ///
    /// Valid true values: `"1"`, `"true"`, `"yes"` (case-insensitive).
    /// Valid false values: `"0"`, `"false"`, `"no"` (case-insensitive).
    /// Returns `None` for unrecognized values.
    pub fn convert_to_bool(value: &str) -> Option<bool> {
        match value.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" => Some(true),
            "0" | "false" | "no" => Some(false),
            _ => None,
        }
    }

    /// Replace everything except ASCII alphanumerics, `-` and `_` with `_`.
    ///
    /// Job ids arrive from the queue and end up in temp directory and
    /// container names, so they are reduced to a conservative alphabet.
    pub fn format_into_safe_filename(name: &str) -> String {
        name.chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                    ch
                } else {
                    '_'
                }
            })
            .collect()
    }

    /// Remove every NUL character from `value`.
    ///
    /// Returns the input unchanged (no allocation) when there is nothing to strip.
    pub fn strip_nul(value: String) -> String {
        if value.contains('\0') {
            value.replace('\0', "")
        } else {
            value
        }
    }
}
