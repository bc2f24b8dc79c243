//! Inline `#pragma` directives
//!
//! A test file configures its own execution and expectations with lines like
//!
//! ```text
//! #pragma repy restrictions.test
//! #pragma out Hello Out.
//! #pragma error
//! ```
//!
//! Directives are kept in file order; the verifier treats that order as the
//! required order of occurrence in the captured streams.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::error::{HarnessError, HarnessResult, PragmaError};

const MARKER: &str = "#pragma";

/// Directive name of a pragma line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PragmaKind {
    /// Run inside the sandboxed collaborator
    Repy,
    /// Expected stdout substring
    Out,
    /// Expected stderr substring
    Error,
}

impl PragmaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PragmaKind::Repy => "repy",
            PragmaKind::Out => "out",
            PragmaKind::Error => "error",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "repy" => Some(PragmaKind::Repy),
            "out" => Some(PragmaKind::Out),
            "error" => Some(PragmaKind::Error),
            _ => None,
        }
    }
}

impl fmt::Display for PragmaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single directive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pragma {
    pub kind: PragmaKind,

    /// Remainder of the line after the directive name; may be empty
    pub argument: String,

    /// Position among all pragmas of the file, starting at 0
    pub order: usize,

    /// 1-based source line
    pub line: usize,
}

impl fmt::Display for Pragma {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.argument.is_empty() {
            write!(f, "#pragma {}", self.kind)
        } else {
            write!(f, "#pragma {} {}", self.kind, self.argument)
        }
    }
}

/// All directives of one file, in file order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pragmas {
    items: Vec<Pragma>,
}

impl Pragmas {
    /// Parse the directives out of a file's text
    pub fn parse(text: &str) -> Result<Self, PragmaError> {
        let mut items: Vec<Pragma> = Vec::new();
        let mut repy_line: Option<usize> = None;

        for (idx, raw) in text.lines().enumerate() {
            let line = idx + 1;
            let Some((name, argument)) = split_pragma_line(raw) else {
                continue;
            };

            let kind = PragmaKind::from_name(name).ok_or_else(|| PragmaError::Unsupported {
                line,
                name: name.to_string(),
            })?;

            if kind == PragmaKind::Repy {
                if let Some(first) = repy_line {
                    return Err(PragmaError::DuplicateRepy { line, first });
                }
                repy_line = Some(line);
            }

            items.push(Pragma {
                kind,
                argument: argument.to_string(),
                order: items.len(),
                line,
            });
        }

        Ok(Self { items })
    }

    /// Read and parse a file from disk
    pub fn from_file(path: &Path) -> HarnessResult<Self> {
        let bytes = std::fs::read(path)?;
        let text = String::from_utf8_lossy(&bytes);
        Self::parse(&text).map_err(|source| HarnessError::Pragma {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pragma> {
        self.items.iter()
    }

    /// Pragmas of one kind, in declaration order
    pub fn of_kind(&self, kind: PragmaKind) -> impl Iterator<Item = &Pragma> {
        self.items.iter().filter(move |p| p.kind == kind)
    }

    pub fn repy(&self) -> Option<&Pragma> {
        self.of_kind(PragmaKind::Repy).next()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

/// Split a pragma line into (directive name, argument).
///
/// The argument is everything after the single separator that follows the
/// name, byte for byte. Returns `None` for lines that are not pragma lines.
fn split_pragma_line(raw: &str) -> Option<(&str, &str)> {
    let rest = raw.trim_start().strip_prefix(MARKER)?;

    // `#pragmatic` is not a pragma line
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return None;
    }

    let rest = rest.trim_start();
    let (name, argument) = match rest.char_indices().find(|(_, c)| c.is_whitespace()) {
        Some((pos, sep)) => (&rest[..pos], &rest[pos + sep.len_utf8()..]),
        None => (rest, ""),
    };

    Some((name, argument))
}
