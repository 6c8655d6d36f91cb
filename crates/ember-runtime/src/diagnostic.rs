//! Compile-error diagnostics
//!
//! Every compiler and lexer error flows through [`Diagnostic`], which keeps
//! the classic single-line format for terminals and serializes to JSON for
//! tooling.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where an error was noticed, for the `at ...` portion of the message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Locus {
    /// No location detail (lexer errors carry it in the message)
    None,
    /// At end of input
    End,
    /// At a specific lexeme
    Lexeme(String),
}

/// One compile error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Source line (1-based)
    pub line: u32,
    /// Error location detail
    pub locus: Locus,
    /// Human-readable message
    pub message: String,
}

impl Diagnostic {
    /// Format as a JSON string
    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] Error", self.line)?;
        match &self.locus {
            Locus::None => {}
            Locus::End => write!(f, " at end")?,
            Locus::Lexeme(lexeme) => write!(f, " at '{}'", lexeme)?,
        }
        write!(f, ": {}", self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn display_with_lexeme() {
        let diagnostic = Diagnostic {
            line: 3,
            locus: Locus::Lexeme("=".to_string()),
            message: "Invalid assignment target.".to_string(),
        };
        assert_eq!(
            diagnostic.to_string(),
            "[line 3] Error at '=': Invalid assignment target."
        );
    }

    #[test]
    fn display_at_end() {
        let diagnostic = Diagnostic {
            line: 1,
            locus: Locus::End,
            message: "Expect expression.".to_string(),
        };
        assert_eq!(diagnostic.to_string(), "[line 1] Error at end: Expect expression.");
    }

    #[test]
    fn display_without_locus() {
        let diagnostic = Diagnostic {
            line: 2,
            locus: Locus::None,
            message: "Unterminated string.".to_string(),
        };
        assert_eq!(diagnostic.to_string(), "[line 2] Error: Unterminated string.");
    }

    #[test]
    fn json_round_trip() {
        let diagnostic = Diagnostic {
            line: 7,
            locus: Locus::Lexeme("x".to_string()),
            message: "msg".to_string(),
        };
        let json = diagnostic.to_json_string().unwrap();
        let back: Diagnostic = serde_json::from_str(&json).unwrap();
        assert_eq!(back, diagnostic);
    }
}
