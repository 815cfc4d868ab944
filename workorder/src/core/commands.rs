//! Acceptance-command checks: argument vectors only, never shell strings.

/// Tokens that only make sense to a shell.
pub const SHELL_OPERATORS: [&str; 8] = ["|", "||", "&", "&&", ";", ">", ">>", "<"];

/// Why an acceptance command was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandProblem {
    Empty,
    /// A single argument that tokenizes into several words.
    ShellString(String),
    /// A bare shell-operator token at the given argument index.
    ShellOperator { index: usize, token: String },
}

/// Check that `argv` is a plain argument vector.
pub fn check_argv(argv: &[String]) -> Result<(), CommandProblem> {
    let Some(program) = argv.first() else {
        return Err(CommandProblem::Empty);
    };
    if program.trim().is_empty() {
        return Err(CommandProblem::Empty);
    }

    for (index, arg) in argv.iter().enumerate() {
        let tokens = tokenize(arg);
        if let Some(token) = tokens
            .iter()
            .find(|token| SHELL_OPERATORS.contains(&token.as_str()))
        {
            return Err(CommandProblem::ShellOperator {
                index,
                token: token.clone(),
            });
        }
    }

    if argv.len() == 1 && tokenize(program).len() > 1 {
        return Err(CommandProblem::ShellString(program.clone()));
    }
    Ok(())
}

/// Split an argument the way a POSIX shell would.
///
/// Unbalanced quotes fall back to whitespace splitting so the operator check
/// still sees every word.
fn tokenize(arg: &str) -> Vec<String> {
    shlex::split(arg)
        .unwrap_or_else(|| arg.split_whitespace().map(str::to_string).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn plain_argv_is_accepted() {
        assert_eq!(check_argv(&argv(&["cargo", "test", "--all"])), Ok(()));
        assert_eq!(check_argv(&argv(&["sh", "scripts/verify.sh"])), Ok(()));
    }

    #[test]
    fn bare_operator_is_rejected() {
        let err = check_argv(&argv(&["cargo", "test", "&&", "rm", "-rf", "/"])).unwrap_err();
        assert_eq!(
            err,
            CommandProblem::ShellOperator {
                index: 2,
                token: "&&".to_string()
            }
        );
    }

    #[test]
    fn operator_hidden_inside_an_argument_is_rejected() {
        let err = check_argv(&argv(&["echo", "a | tee out"])).unwrap_err();
        assert!(matches!(err, CommandProblem::ShellOperator { index: 1, .. }));
    }

    #[test]
    fn quoted_operator_is_a_literal() {
        assert_eq!(check_argv(&argv(&["grep", "'a|b'", "file"])), Ok(()));
    }

    #[test]
    fn single_shell_string_is_rejected() {
        let err = check_argv(&argv(&["cargo test --all"])).unwrap_err();
        assert!(matches!(err, CommandProblem::ShellString(_)));
    }

    #[test]
    fn empty_program_is_rejected() {
        assert_eq!(check_argv(&[]), Err(CommandProblem::Empty));
        assert_eq!(check_argv(&argv(&[" "])), Err(CommandProblem::Empty));
    }
}
