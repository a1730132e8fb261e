//! Structural parser for `.aro` sources.
//!
//! Only the outline is checked: a file is a sequence of feature sets
//!
//! ```text
//! (Create User: User Management) {
//!     <Extract> the <data> from the <request: body>.
//!     <Return> an <OK: status> with <data>.
//! }
//! ```
//!
//! whose header names the unit and its business activity. Statements are
//! kept verbatim for the executor; `//` comments and string literals are
//! skipped when matching braces.

use std::path::{Path, PathBuf};

use crate::error::{PluginError, PluginResult};

/// One feature set from a source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureSet {
    /// Unit name (`Create User`, `UserCreated Handler`).
    pub name: String,
    /// Business activity from the header.
    pub activity: String,
    /// Source file.
    pub file: PathBuf,
    /// 1-based line of the header.
    pub line: usize,
    /// Text between the braces.
    pub body: String,
}

impl FeatureSet {
    /// Event name when this unit is a handler, i.e. its name is
    /// `<Event> <suffix>`.
    #[must_use]
    pub fn handled_event(&self, suffix: &str) -> Option<&str> {
        self.name
            .strip_suffix(suffix)
            .and_then(|rest| rest.strip_suffix(' '))
            .map(str::trim_end)
            .filter(|event| !event.is_empty())
    }
}

struct Cursor<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    line: usize,
}

impl<'a> Cursor<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            chars: text.char_indices().peekable(),
            line: 1,
        }
    }

    fn bump(&mut self) -> Option<(usize, char)> {
        let next = self.chars.next();
        if let Some((_, '\n')) = next {
            self.line = self.line.saturating_add(1);
        }
        next
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().map(|(_, c)| *c)
    }

    fn skip_line(&mut self) {
        while let Some((_, c)) = self.bump() {
            if c == '\n' {
                break;
            }
        }
    }

    /// Skip to the closing quote. Returns false at end of input.
    fn skip_string(&mut self) -> bool {
        while let Some((_, c)) = self.bump() {
            match c {
                '\\' => {
                    self.bump();
                },
                '"' => return true,
                _ => {},
            }
        }
        false
    }
}

/// Parse every feature set in `text`.
///
/// # Errors
///
/// Returns [`PluginError::Declarative`] with the offending line for a
/// malformed header, unbalanced braces, an unterminated string or stray
/// top-level text.
pub fn parse_source(file: &Path, text: &str) -> PluginResult<Vec<FeatureSet>> {
    let error = |line: usize, message: String| PluginError::Declarative {
        file: file.to_path_buf(),
        line,
        message,
    };

    let mut units = Vec::new();
    let mut cursor = Cursor::new(text);

    while let Some((_, c)) = cursor.bump() {
        match c {
            c if c.is_whitespace() => {},
            '/' if cursor.peek() == Some('/') => cursor.skip_line(),
            '(' => {
                let line = cursor.line;
                let mut header = String::new();
                loop {
                    match cursor.bump() {
                        Some((_, ')')) => break,
                        Some((_, '\n')) | None => {
                            return Err(error(line, "unterminated feature set header".into()));
                        },
                        Some((_, c)) => header.push(c),
                    }
                }
                let (name, activity) = header
                    .split_once(':')
                    .map(|(n, a)| (n.trim(), a.trim()))
                    .ok_or_else(|| {
                        error(line, format!("header '({header})' must be '(Name: Activity)'"))
                    })?;
                if name.is_empty() || activity.is_empty() {
                    return Err(error(
                        line,
                        format!("header '({header})' needs both a name and an activity"),
                    ));
                }

                loop {
                    match cursor.bump() {
                        Some((_, '{')) => break,
                        Some((_, c)) if c.is_whitespace() => {},
                        _ => {
                            return Err(error(line, format!("expected '{{' after header of {name}")));
                        },
                    }
                }

                let body = read_body(&mut cursor, text)
                    .map_err(|message| error(line, format!("{message} in {name}")))?;
                units.push(FeatureSet {
                    name: name.to_owned(),
                    activity: activity.to_owned(),
                    file: file.to_path_buf(),
                    line,
                    body,
                });
            },
            '}' => return Err(error(cursor.line, "unbalanced '}'".into())),
            other => {
                return Err(error(
                    cursor.line,
                    format!("expected a feature set header, found '{other}'"),
                ));
            },
        }
    }

    Ok(units)
}

/// Consume up to and including the brace that closes the current body.
fn read_body(cursor: &mut Cursor<'_>, text: &str) -> Result<String, String> {
    let mut depth: usize = 1;
    let mut start = None;
    while let Some((idx, c)) = cursor.bump() {
        if start.is_none() {
            start = Some(idx);
        }
        match c {
            '"' => {
                if !cursor.skip_string() {
                    return Err("unterminated string literal".into());
                }
            },
            '/' if cursor.peek() == Some('/') => cursor.skip_line(),
            '{' => depth = depth.saturating_add(1),
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    let from = start.unwrap_or(idx);
                    return Ok(text.get(from..idx).unwrap_or_default().trim().to_owned());
                }
            },
            _ => {},
        }
    }
    Err("missing closing '}'".into())
}
