//! SQL migration bodies: section markers, statement splitting and the script
//! type that runs them.

use std::sync::Arc;

use strata_core::error::{Result, StrataError};
use strata_core::migration::{BoxFuture, MigrationScript};
use strata_core::store::SqlExecutor;

/// Marker line opening the forward section of a single-file migration.
pub const UP_MARKER: &str = "-- migrate:up";
/// Marker line opening the backward section of a single-file migration.
pub const DOWN_MARKER: &str = "-- migrate:down";

/// A migration whose actions are SQL statements.
#[derive(Debug, Clone)]
pub struct SqlScript {
    up: Arc<[String]>,
    down: Option<Arc<[String]>>,
}

impl SqlScript {
    /// Build from raw SQL bodies. Fails if `up` holds no statements.
    pub fn new(up: &str, down: Option<&str>) -> std::result::Result<Self, String> {
        let up = split_sql_statements(up);
        if up.is_empty() {
            return Err("up section contains no statements".to_string());
        }

        let down = down
            .map(split_sql_statements)
            .filter(|stmts| !stmts.is_empty())
            .map(Arc::from);

        Ok(Self {
            up: Arc::from(up),
            down,
        })
    }

    /// Parse a single file that may carry `-- migrate:up` / `-- migrate:down` markers.
    pub fn from_sections(content: &str) -> std::result::Result<Self, String> {
        let sections = parse_sections(content)?;
        Self::new(sections.up, sections.down)
    }

    pub fn up_statements(&self) -> &[String] {
        &self.up
    }

    pub fn down_statements(&self) -> Option<&[String]> {
        self.down.as_deref()
    }
}

impl<S: SqlExecutor> MigrationScript<S> for SqlScript {
    fn up<'a>(&'a self, session: &'a mut S) -> BoxFuture<'a, Result<()>> {
        Box::pin(run_statements(session, &self.up))
    }

    fn down<'a>(&'a self, session: &'a mut S) -> BoxFuture<'a, Result<()>> {
        match &self.down {
            Some(stmts) => Box::pin(run_statements(session, stmts)),
            None => Box::pin(async {
                Err(StrataError::Configuration(
                    "migration has no down section".to_string(),
                ))
            }),
        }
    }

    fn has_down(&self) -> bool {
        self.down.is_some()
    }
}

async fn run_statements<S: SqlExecutor>(session: &mut S, statements: &[String]) -> Result<()> {
    for statement in statements {
        session.execute_sql(statement).await?;
    }
    Ok(())
}

/// Up and down bodies of a single-file migration.
#[derive(Debug, PartialEq, Eq)]
pub struct Sections<'a> {
    pub up: &'a str,
    pub down: Option<&'a str>,
}

/// Split a file on its marker lines.
///
/// Without markers the whole file is the up section. Markers may appear at most
/// once each, `up` before `down`, and nothing but comments may precede `up`.
pub fn parse_sections(content: &str) -> std::result::Result<Sections<'_>, String> {
    let mut up_at: Option<(usize, usize)> = None;
    let mut down_at: Option<(usize, usize)> = None;

    let mut offset = 0;
    for line in content.split_inclusive('\n') {
        let marker = line.trim();
        let start = offset;
        let end = offset + line.len();
        offset = end;

        let candidate = marker == UP_MARKER || marker == DOWN_MARKER;
        // Marker text inside a string, comment or dollar-quoted body is SQL.
        if !candidate || scan(&content[..start]).end != Lexer::Code {
            continue;
        }

        if marker == UP_MARKER {
            if up_at.is_some() {
                return Err(format!("'{}' appears more than once", UP_MARKER));
            }
            if down_at.is_some() {
                return Err(format!("'{}' must come before '{}'", UP_MARKER, DOWN_MARKER));
            }
            up_at = Some((start, end));
        } else {
            if down_at.is_some() {
                return Err(format!("'{}' appears more than once", DOWN_MARKER));
            }
            down_at = Some((start, end));
        }
    }

    let up_start = match up_at {
        Some((line_start, line_end)) => {
            if !split_sql_statements(&content[..line_start]).is_empty() {
                return Err(format!("statements found before '{}'", UP_MARKER));
            }
            line_end
        }
        None => 0,
    };

    match down_at {
        Some((line_start, line_end)) => Ok(Sections {
            up: &content[up_start..line_start],
            down: Some(&content[line_end..]),
        }),
        None => Ok(Sections {
            up: &content[up_start..],
            down: None,
        }),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Lexer {
    Code,
    SingleQuoted,
    /// `E'...'` string, where a backslash escapes the next character.
    EscapeQuoted,
    DoubleQuoted,
    LineComment,
    BlockComment,
    DollarQuoted(String),
}

/// Split SQL into individual statements.
///
/// Semicolons inside quoted strings, quoted identifiers, comments and
/// PostgreSQL dollar-quoted bodies do not end a statement. Fragments holding
/// only comments or whitespace are dropped.
pub fn split_sql_statements(sql: &str) -> Vec<String> {
    scan(sql).statements
}

struct Scan {
    statements: Vec<String>,
    end: Lexer,
}

fn scan(sql: &str) -> Scan {
    let chars: Vec<char> = sql.chars().collect();
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut has_code = false;
    let mut state = Lexer::Code;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        match &state {
            Lexer::Code => match c {
                ';' => {
                    if has_code {
                        statements.push(current.trim().to_string());
                    }
                    current.clear();
                    has_code = false;
                    i += 1;
                    continue;
                }
                '\'' => {
                    state = if is_escape_prefix(&chars, i) {
                        Lexer::EscapeQuoted
                    } else {
                        Lexer::SingleQuoted
                    };
                    has_code = true;
                }
                '"' => {
                    state = Lexer::DoubleQuoted;
                    has_code = true;
                }
                '-' if next == Some('-') => state = Lexer::LineComment,
                '/' if next == Some('*') => {
                    state = Lexer::BlockComment;
                    current.push_str("/*");
                    i += 2;
                    continue;
                }
                '$' => {
                    if let Some(tag) = dollar_tag(&chars, i) {
                        current.push_str(&tag);
                        i += tag.chars().count();
                        state = Lexer::DollarQuoted(tag);
                        has_code = true;
                        continue;
                    }
                    has_code = true;
                }
                c if !c.is_whitespace() => has_code = true,
                _ => {}
            },
            Lexer::SingleQuoted => {
                if c == '\'' {
                    state = Lexer::Code;
                }
            }
            Lexer::EscapeQuoted => {
                // `\x` and `''` never close the string.
                let pair = (c == '\\' && next.is_some()) || (c == '\'' && next == Some('\''));
                if let (true, Some(second)) = (pair, next) {
                    current.push(c);
                    current.push(second);
                    i += 2;
                    continue;
                }
                if c == '\'' {
                    state = Lexer::Code;
                }
            }
            Lexer::DoubleQuoted => {
                if c == '"' {
                    state = Lexer::Code;
                }
            }
            Lexer::LineComment => {
                if c == '\n' {
                    state = Lexer::Code;
                }
            }
            Lexer::BlockComment => {
                if c == '*' && next == Some('/') {
                    current.push_str("*/");
                    i += 2;
                    state = Lexer::Code;
                    continue;
                }
            }
            Lexer::DollarQuoted(tag) => {
                if c == '$' && matches_at(&chars, i, tag) {
                    let len = tag.chars().count();
                    current.push_str(tag);
                    i += len;
                    state = Lexer::Code;
                    continue;
                }
            }
        }

        current.push(c);
        i += 1;
    }

    if has_code {
        statements.push(current.trim().to_string());
    }

    Scan {
        statements,
        end: state,
    }
}

/// Whether the quote at `quote` opens an `E'...'` escape string.
fn is_escape_prefix(chars: &[char], quote: usize) -> bool {
    let Some(prev) = quote.checked_sub(1).map(|p| chars[p]) else {
        return false;
    };
    if prev != 'E' && prev != 'e' {
        return false;
    }
    match quote.checked_sub(2).map(|p| chars[p]) {
        Some(before) => !(before.is_alphanumeric() || before == '_'),
        None => true,
    }
}

/// Dollar-quote delimiter (`$$` or `$tag$`) starting at `start`, if any.
/// `$1` style positional parameters are not delimiters.
fn dollar_tag(chars: &[char], start: usize) -> Option<String> {
    let mut end = start + 1;
    while end < chars.len() && (chars[end].is_alphanumeric() || chars[end] == '_') {
        end += 1;
    }
    if end >= chars.len() || chars[end] != '$' {
        return None;
    }
    if end > start + 1 && chars[start + 1].is_ascii_digit() {
        return None;
    }
    Some(chars[start..=end].iter().collect())
}

fn matches_at(chars: &[char], start: usize, tag: &str) -> bool {
    let mut idx = start;
    for t in tag.chars() {
        if chars.get(idx) != Some(&t) {
            return false;
        }
        idx += 1;
    }
    true
}
