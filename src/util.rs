//! Shell quoting helpers for building remote command lines.

use crate::{Error, Result};

/// Whether `s` reads as a single word to a POSIX shell without quoting.
pub fn is_shell_word(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '@' | '%'))
}

/// Quote `s` for a POSIX shell, leaving plain words untouched.
pub fn shell_escape(s: &str) -> String {
    if is_shell_word(s) {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

/// Join a remote directory and a child name with a single `/`.
pub fn remote_join(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name.trim_start_matches('/'))
}

/// Accept a workspace root only if it needs no quoting anywhere.
///
/// The root ends up inside the `mktemp` result, which legacy scp hands to the
/// remote shell as `host:path` without quoting.
pub fn check_remote_dir(dir: &str) -> Result<&str> {
    if is_shell_word(dir) {
        Ok(dir)
    } else {
        Err(Error::Validation(format!(
            "remote directory {:?} may only contain letters, digits and -_./:@%",
            dir
        )))
    }
}
