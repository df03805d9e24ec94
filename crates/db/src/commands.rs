//! Command-line grammar for the REPL. Parse failures carry the character
//! offset of the offending token.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Insert { key: String, attrs: Vec<String> },
    Delete { key: String },
    Select { condition: String },
    Update { key: String, attrs: Vec<String> },
    Range { lo: i64, hi: i64 },
    Stats,
    Maintain,
    Help,
    Exit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandError {
    pub offset: usize,
    pub message: String,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at character {}: {}", self.offset, self.message)
    }
}

impl std::error::Error for CommandError {}

fn error(offset: usize, message: impl Into<String>) -> CommandError {
    CommandError {
        offset,
        message: message.into(),
    }
}

/// Tokenises the line, remembering where each token starts.
fn tokenize(line: &str) -> Vec<(usize, &str)> {
    let mut tokens = Vec::new();
    let mut start: Option<usize> = None;
    for (index, c) in line.char_indices() {
        if c.is_whitespace() {
            if let Some(from) = start.take() {
                tokens.push((from, &line[from..index]));
            }
        } else if start.is_none() {
            start = Some(index);
        }
    }
    if let Some(from) = start {
        tokens.push((from, &line[from..]));
    }
    tokens
}

pub fn parse_command(line: &str) -> Result<Command, CommandError> {
    let tokens = tokenize(line);
    let Some(&(verb_offset, verb)) = tokens.first() else {
        return Err(error(0, "empty command"));
    };

    let require_key = |position: usize, what: &str| -> Result<String, CommandError> {
        tokens
            .get(position)
            .map(|(_, token)| token.to_string())
            .ok_or_else(|| error(line.len(), format!("missing {what}")))
    };

    match verb.to_ascii_lowercase().as_str() {
        "exit" | "quit" => Ok(Command::Exit),
        "help" => Ok(Command::Help),
        "stats" => Ok(Command::Stats),
        "maintain" => Ok(Command::Maintain),
        "insert" => {
            let key = require_key(1, "key")?;
            let attrs = tokens[2..]
                .iter()
                .map(|(_, token)| token.to_string())
                .collect::<Vec<_>>();
            if attrs.is_empty() {
                return Err(error(line.len(), "missing attributes"));
            }
            Ok(Command::Insert { key, attrs })
        }
        "update" => {
            let key = require_key(1, "key")?;
            let attrs = tokens[2..]
                .iter()
                .map(|(_, token)| token.to_string())
                .collect::<Vec<_>>();
            if attrs.is_empty() {
                return Err(error(line.len(), "missing attributes"));
            }
            Ok(Command::Update { key, attrs })
        }
        "delete" => {
            let key = require_key(1, "key")?;
            Ok(Command::Delete { key })
        }
        "select" => {
            let Some(&(condition_offset, _)) = tokens.get(1) else {
                return Err(error(line.len(), "missing condition"));
            };
            Ok(Command::Select {
                condition: line[condition_offset..].trim_end().to_string(),
            })
        }
        "range" => {
            let parse_bound = |position: usize, what: &str| -> Result<i64, CommandError> {
                let &(offset, token) = tokens
                    .get(position)
                    .ok_or_else(|| error(line.len(), format!("missing {what}")))?;
                token
                    .parse::<i64>()
                    .map_err(|_| error(offset, format!("invalid {what} {token:?}")))
            };
            Ok(Command::Range {
                lo: parse_bound(1, "lower bound")?,
                hi: parse_bound(2, "upper bound")?,
            })
        }
        other => Err(error(verb_offset, format!("unknown command {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_core_commands() {
        assert_eq!(
            parse_command("insert 42 alice a@example.com"),
            Ok(Command::Insert {
                key: "42".into(),
                attrs: vec!["alice".into(), "a@example.com".into()],
            })
        );
        assert_eq!(
            parse_command("select id >= 10"),
            Ok(Command::Select {
                condition: "id >= 10".into()
            })
        );
        assert_eq!(parse_command("range 5 10"), Ok(Command::Range { lo: 5, hi: 10 }));
        assert_eq!(parse_command("EXIT"), Ok(Command::Exit));
    }

    #[test]
    fn errors_carry_offsets() {
        let err = parse_command("frobnicate 1").unwrap_err();
        assert_eq!(err.offset, 0);

        let err = parse_command("range 5 ten").unwrap_err();
        assert_eq!(err.offset, 8);

        let err = parse_command("insert 42").unwrap_err();
        assert_eq!(err.offset, "insert 42".len());
    }
}
