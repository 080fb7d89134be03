//! Test support utilities shared by the workspace's test suites.
//!
//! Provides the test log subscriber, SQLite URL helpers and unique
//! identifiers so that tests sharing a database never collide.

pub mod logging;

use std::path::Path;

use ulid::Ulid;

/// Generate a unique SQL identifier with the given prefix
///
/// The result is lowercase and safe to use as a table or index name,
/// in the format `{prefix}_{ulid}`.
///
/// # Examples
/// ```
/// use test_support::unique_ident;
///
/// let a = unique_ident("tbl");
/// let b = unique_ident("tbl");
/// assert_ne!(a, b);
/// assert!(a.starts_with("tbl_"));
/// ```
pub fn unique_ident(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new().to_string().to_lowercase())
}

/// Connection URL for a SQLite file inside `dir`, created on first connect.
pub fn sqlite_file_url(dir: &Path, file_name: &str) -> String {
    format!("sqlite://{}?mode=rwc", dir.join(file_name).display())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_ident_produces_different_results() {
        assert_ne!(unique_ident("t"), unique_ident("t"));
    }

    #[test]
    fn test_unique_ident_is_a_valid_identifier() {
        let ident = unique_ident("users");
        assert!(ident.starts_with("users_"));
        assert!(ident.len() <= 63);
        assert!(ident
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'));
    }

    #[test]
    fn test_sqlite_file_url_has_create_mode() {
        let url = sqlite_file_url(Path::new("/tmp/x"), "app.db");
        assert_eq!(url, "sqlite:///tmp/x/app.db?mode=rwc");
    }
}
