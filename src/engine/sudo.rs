//! Privilege elevation helpers.

use super::scanner::SUDO_PROMPT_SENTINEL;

/// Placeholder substituted for secrets in command text and errors.
pub const REDACTED: &str = "********";

/// Escape a string for use inside single quotes.
///
/// Each `'` becomes `'"'"'`: close the quote, emit a double-quoted quote,
/// reopen.
pub fn escape_for_shell(s: &str) -> String {
    s.replace('\'', "'\"'\"'")
}

/// Run `command` through sudo, reading the password from the command's input
/// and announcing the prompt with the engine's sentinel.
pub fn wrap_sudo(command: &str) -> String {
    format!(
        "sudo -S -p '{}' bash -c '{}'",
        SUDO_PROMPT_SENTINEL,
        escape_for_shell(command)
    )
}

/// Replace every occurrence of every non-empty secret in `text`.
pub fn redact(text: &str, secrets: &[String]) -> String {
    let mut secrets: Vec<&str> = secrets
        .iter()
        .map(String::as_str)
        .filter(|s| !s.is_empty())
        .collect();
    // Longest first, so a secret that contains another is redacted whole.
    secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));

    secrets
        .into_iter()
        .fold(text.to_string(), |acc, secret| acc.replace(secret, REDACTED))
}
