//! Shell-selection rule used at the PRECHECK -> SPAWN transition: decide
//! whether a command needs a shell, or can be tokenized and exec'd
//! directly (§4.3).

const SHELL_METACHARS: &[&str] =
    &["|", "&", ";", "<", ">", ">>", "{", "}", "[", "]", "$", "`", "\\", "&&", "||", "2>", "2>&1", "*", "?", "~"];

const SHELL_BUILTINS: &[&str] = &[
    "grep", "awk", "sed", "find", "xargs", "for", "while", "if", "case", "do", "done", "until", "function",
    "alias", "source", "./",
];

/// True iff `command` needs a shell to execute as written.
pub fn needs_shell(command: &str) -> bool {
    if SHELL_METACHARS.iter().any(|m| command.contains(m)) {
        return true;
    }
    let starts_with_builtin = SHELL_BUILTINS
        .iter()
        .any(|b| command.starts_with(b) && command[b.len()..].chars().next().map_or(true, |c| c.is_whitespace()));
    if starts_with_builtin {
        return true;
    }
    SHELL_BUILTINS.iter().any(|b| {
        let needle = format!(" {b} ");
        command.contains(&needle) || command.ends_with(&format!(" {b}"))
    })
}

/// Tokenize `command` with shell-style quoting for direct execution
/// (no shell involved).
pub fn tokenize(command: &str) -> Result<Vec<String>, shell_words::ParseError> {
    shell_words::split(command)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_needs_shell() {
        assert!(needs_shell("echo hi | wc -l"));
    }

    #[test]
    fn plain_command_does_not_need_shell() {
        assert!(!needs_shell("echo hello world"));
    }

    #[test]
    fn builtin_prefix_needs_shell() {
        assert!(needs_shell("grep foo file.txt"));
    }

    #[test]
    fn tokenizes_quoted_args() {
        let tokens = tokenize("echo \"hello world\"").unwrap();
        assert_eq!(tokens, vec!["echo".to_string(), "hello world".to_string()]);
    }
}
