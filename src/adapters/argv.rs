//! POSIX-style tokenization of free-form argument strings.
//!
//! Single- and double-quoted spans preserve whitespace; backslash escapes
//! the next character outside single quotes. Unbalanced quotes fall back
//! to a plain whitespace split with a warning instead of failing the
//! launch.

/// Tokenized arguments plus an optional fallback warning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedArguments {
    pub tokens: Vec<String>,
    pub warning: Option<String>,
}

impl ParsedArguments {
    fn clean(tokens: Vec<String>) -> Self {
        Self {
            tokens,
            warning: None,
        }
    }
}

/// Split a free-form argument string into argv tokens.
///
/// `None` or blank input yields no tokens. The result is meant to be
/// appended *after* adapter-generated flags so later occurrences override
/// earlier ones.
pub fn split_arguments(input: Option<&str>) -> ParsedArguments {
    let Some(raw) = input else {
        return ParsedArguments::clean(Vec::new());
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return ParsedArguments::clean(Vec::new());
    }

    match tokenize_posix(raw) {
        Ok(tokens) => ParsedArguments::clean(tokens),
        Err(reason) => ParsedArguments {
            tokens: raw.split_whitespace().map(str::to_string).collect(),
            warning: Some(format!(
                "argument string is not valid shell syntax ({reason}); fell back to whitespace split"
            )),
        },
    }
}

fn tokenize_posix(input: &str) -> Result<Vec<String>, String> {
    #[derive(PartialEq)]
    enum State {
        Plain,
        SingleQuoted,
        DoubleQuoted,
    }

    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut has_token = false;
    let mut state = State::Plain;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match state {
            State::Plain => match c {
                '\'' => {
                    state = State::SingleQuoted;
                    has_token = true;
                }
                '"' => {
                    state = State::DoubleQuoted;
                    has_token = true;
                }
                '\\' => match chars.next() {
                    Some(escaped) => {
                        current.push(escaped);
                        has_token = true;
                    }
                    None => return Err("trailing backslash".to_string()),
                },
                c if c.is_whitespace() => {
                    if has_token {
                        tokens.push(std::mem::take(&mut current));
                        has_token = false;
                    }
                }
                c => {
                    current.push(c);
                    has_token = true;
                }
            },
            State::SingleQuoted => match c {
                '\'' => state = State::Plain,
                c => current.push(c),
            },
            State::DoubleQuoted => match c {
                '"' => state = State::Plain,
                '\\' => match chars.next() {
                    // POSIX: backslash in double quotes escapes only these.
                    Some(escaped @ ('"' | '\\' | '$' | '`')) => current.push(escaped),
                    Some(other) => {
                        current.push('\\');
                        current.push(other);
                    }
                    None => return Err("trailing backslash".to_string()),
                },
                c => current.push(c),
            },
        }
    }

    if state != State::Plain {
        return Err("unbalanced quote".to_string());
    }
    if has_token {
        tokens.push(current);
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(input: &str) -> Vec<String> {
        let parsed = split_arguments(Some(input));
        assert!(parsed.warning.is_none(), "unexpected fallback: {parsed:?}");
        parsed.tokens
    }

    #[test]
    fn test_empty_inputs() {
        assert!(split_arguments(None).tokens.is_empty());
        assert!(split_arguments(Some("")).tokens.is_empty());
        assert!(split_arguments(Some("   ")).tokens.is_empty());
    }

    #[test]
    fn test_simple_flags() {
        assert_eq!(tokens("--verbose"), vec!["--verbose"]);
        assert_eq!(tokens("--temperature 0.7"), vec!["--temperature", "0.7"]);
        assert_eq!(
            tokens("--temperature 0.7 --top-p 0.9"),
            vec!["--temperature", "0.7", "--top-p", "0.9"]
        );
    }

    #[test]
    fn test_quoted_spans_preserve_whitespace() {
        assert_eq!(
            tokens("--prompt 'Hello world'"),
            vec!["--prompt", "Hello world"]
        );
        assert_eq!(
            tokens(r#"--prompt "Hello world""#),
            vec!["--prompt", "Hello world"]
        );
        assert_eq!(
            tokens(r#"--system-prompt "You are a helpful assistant""#),
            vec!["--system-prompt", "You are a helpful assistant"]
        );
    }

    #[test]
    fn test_escapes() {
        assert_eq!(tokens(r"a\ b"), vec!["a b"]);
        assert_eq!(tokens(r#""say \"hi\"""#), vec![r#"say "hi""#]);
    }

    #[test]
    fn test_adjacent_quoted_segments_join() {
        assert_eq!(tokens(r#"--flag a"b c"d"#), vec!["--flag", "ab cd"]);
    }

    #[test]
    fn test_unbalanced_quote_falls_back_with_warning() {
        let parsed = split_arguments(Some(r#"--prompt "Hello world"#));
        assert!(parsed.warning.is_some());
        assert_eq!(parsed.tokens, vec!["--prompt", "\"Hello", "world"]);
    }

    #[test]
    fn test_empty_quoted_token_kept() {
        assert_eq!(tokens(r#"--name """#), vec!["--name", ""]);
    }

    #[test]
    fn test_parsing_counts() {
        assert_eq!(tokens("--verbose").len(), 1);
        assert_eq!(tokens("--verbose --temperature 0.7").len(), 3);
        assert_eq!(tokens("--ctx-size 4096 --batch-size 1024").len(), 4);
        assert_eq!(tokens("--system-prompt 'You are helpful'").len(), 2);
    }
}
