//! Assembly of the child command line from trailing CLI tokens.
//!
//! Tokens are joined with single spaces. A token is wrapped in double quotes
//! when it is empty or contains whitespace or a quote; inside quotes, `"` and
//! `\` are escaped with a backslash. [`split`] undoes exactly that.

use std::fmt;

use crate::errors::{CrashcapError, CrashcapResult};

/// Upper bound on the assembled command line, terminator included.
pub const MAX_COMMAND_LINE: usize = 4096;

/// A launchable command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    line: String,
}

impl CommandLine {
    /// Quote and join `tokens` into a single command line.
    pub fn from_args<S: AsRef<str>>(tokens: &[S]) -> CrashcapResult<Self> {
        if tokens.is_empty() {
            return Err(CrashcapError::EmptyCommandLine);
        }

        let mut line = String::new();
        for token in tokens {
            if !line.is_empty() {
                line.push(' ');
            }
            push_token(&mut line, token.as_ref());
            if line.len() >= MAX_COMMAND_LINE {
                return Err(CrashcapError::CommandLineTooLong {
                    limit: MAX_COMMAND_LINE,
                });
            }
        }

        Ok(Self { line })
    }

    pub fn as_str(&self) -> &str {
        &self.line
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.line)
    }
}

fn needs_quotes(token: &str) -> bool {
    token.is_empty() || token.chars().any(|c| c.is_whitespace() || c == '"')
}

fn push_token(line: &mut String, token: &str) {
    if !needs_quotes(token) {
        line.push_str(token);
        return;
    }

    line.push('"');
    for c in token.chars() {
        if c == '"' || c == '\\' {
            line.push('\\');
        }
        line.push(c);
    }
    line.push('"');
}

/// Split a command line produced by [`CommandLine::from_args`] back into tokens.
pub fn split(line: &str) -> CrashcapResult<Vec<String>> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        let Some(&first) = chars.peek() else {
            break;
        };

        let mut token = String::new();
        if first == '"' {
            chars.next();
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some(escaped) => token.push(escaped),
                        None => return Err(CrashcapError::UnbalancedQuote),
                    },
                    Some(c) => token.push(c),
                    None => return Err(CrashcapError::UnbalancedQuote),
                }
            }
        } else {
            while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                if c == '"' {
                    return Err(CrashcapError::UnbalancedQuote);
                }
                token.push(c);
            }
        }
        tokens.push(token);
    }

    Ok(tokens)
}
