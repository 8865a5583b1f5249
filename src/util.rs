//! Shared utility functions for the sandbox crate.

/// Quote a string for safe interpolation into a POSIX `sh -c` command line.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Keep at most the last `max_len` bytes of command output, on a char boundary.
pub fn tail(output: &str, max_len: usize) -> String {
    if output.len() <= max_len {
        return output.to_string();
    }
    let mut start = output.len() - max_len;
    while !output.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &output[start..])
}

/// Turn arbitrary identifiers into something usable as a directory name.
pub fn path_safe(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    let trimmed = cleaned.trim_matches('-');
    if trimmed.is_empty() {
        "session".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote_plain_word_is_unchanged() {
        assert_eq!(shell_quote("npm"), "npm");
        assert_eq!(shell_quote("/home/daytona/app"), "/home/daytona/app");
    }

    #[test]
    fn test_shell_quote_spaces_and_quotes() {
        assert_eq!(shell_quote("hello world"), "'hello world'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_shell_quote_metacharacters() {
        assert_eq!(shell_quote("a; rm -rf /"), "'a; rm -rf /'");
        assert_eq!(shell_quote("$(whoami)"), "'$(whoami)'");
    }

    #[test]
    fn test_tail_short_output() {
        assert_eq!(tail("short", 10), "short");
    }

    #[test]
    fn test_tail_long_output() {
        assert_eq!(tail("0123456789", 4), "...6789");
    }

    #[test]
    fn test_tail_respects_char_boundary() {
        let out = tail("ééééé", 3);
        assert!(out.starts_with("..."));
        assert!(out.ends_with('é'));
    }

    #[test]
    fn test_path_safe() {
        assert_eq!(path_safe("session-1"), "session-1");
        assert_eq!(path_safe("a/b c"), "a-b-c");
        assert_eq!(path_safe("///"), "session");
    }
}
