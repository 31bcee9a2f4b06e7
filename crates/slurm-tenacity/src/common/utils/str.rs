use std::borrow::Cow;

fn is_shell_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':' | ',' | '=' | '+' | '@' | '%')
}

/// Quotes a single word so that a POSIX shell reads it back verbatim.
pub fn shell_quote(value: &str) -> Cow<'_, str> {
    if !value.is_empty() && value.chars().all(is_shell_safe) {
        Cow::Borrowed(value)
    } else {
        Cow::Owned(format!("'{}'", value.replace('\'', r#"'"'"'"#)))
    }
}

/// Joins words into a single shell command line, quoting them where necessary.
pub fn shell_join<S: AsRef<str>>(words: &[S]) -> String {
    words
        .iter()
        .map(|word| shell_quote(word.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}
