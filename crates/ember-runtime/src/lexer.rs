//! Lexical analysis (tokenization)
//!
//! The lexer hands out tokens one at a time; the compiler pulls them on
//! demand, so the whole token stream never materializes. Lexemes are slices
//! of the source text.

use crate::token::{Token, TokenKind};

/// Lexer state for tokenizing source code
pub struct Lexer<'src> {
    /// Original source text
    source: &'src str,
    /// Byte offset where the current token starts
    start: usize,
    /// Byte offset of the next unconsumed character
    current: usize,
    /// Current line number (1-indexed)
    line: u32,
}

impl<'src> Lexer<'src> {
    /// Create a new lexer for the given source text
    pub fn new(source: &'src str) -> Self {
        Self {
            source,
            start: 0,
            current: 0,
            line: 1,
        }
    }

    /// Scan and return the next token
    pub fn next_token(&mut self) -> Token<'src> {
        self.skip_whitespace();
        self.start = self.current;

        if self.is_at_end() {
            return self.make_token(TokenKind::Eof);
        }

        let c = self.advance();

        if c.is_ascii_digit() {
            return self.number();
        }
        if is_alpha(c) {
            return self.identifier();
        }

        match c {
            b'(' => self.make_token(TokenKind::LeftParen),
            b')' => self.make_token(TokenKind::RightParen),
            b'{' => self.make_token(TokenKind::LeftBrace),
            b'}' => self.make_token(TokenKind::RightBrace),
            b';' => self.make_token(TokenKind::Semicolon),
            b',' => self.make_token(TokenKind::Comma),
            b'.' => self.make_token(TokenKind::Dot),
            b'-' => self.make_token(TokenKind::Minus),
            b'+' => self.make_token(TokenKind::Plus),
            b'/' => self.make_token(TokenKind::Slash),
            b'*' => self.make_token(TokenKind::Star),
            b'!' => {
                if self.matches(b'=') {
                    self.make_token(TokenKind::BangEqual)
                } else {
                    self.make_token(TokenKind::Bang)
                }
            }
            b'=' => {
                if self.matches(b'=') {
                    self.make_token(TokenKind::EqualEqual)
                } else {
                    self.make_token(TokenKind::Equal)
                }
            }
            b'<' => {
                if self.matches(b'=') {
                    self.make_token(TokenKind::LessEqual)
                } else {
                    self.make_token(TokenKind::Less)
                }
            }
            b'>' => {
                if self.matches(b'=') {
                    self.make_token(TokenKind::GreaterEqual)
                } else {
                    self.make_token(TokenKind::Greater)
                }
            }
            b'"' => self.string(),
            _ => self.error_token("Unexpected character."),
        }
    }

    /// Skip spaces, tabs, carriage returns, newlines, and `//` comments
    fn skip_whitespace(&mut self) {
        loop {
            match self.peek() {
                b' ' | b'\r' | b'\t' => {
                    self.advance();
                }
                b'\n' => {
                    self.line += 1;
                    self.advance();
                }
                b'/' => {
                    if self.peek_next() == b'/' {
                        while self.peek() != b'\n' && !self.is_at_end() {
                            self.advance();
                        }
                    } else {
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    /// Scan a number literal: digits with an optional fractional part.
    /// The `.` is only consumed when another digit follows, so `1.` lexes as
    /// the number `1` followed by a dot token.
    fn number(&mut self) -> Token<'src> {
        while self.peek().is_ascii_digit() {
            self.advance();
        }

        if self.peek() == b'.' && self.peek_next().is_ascii_digit() {
            self.advance();
            while self.peek().is_ascii_digit() {
                self.advance();
            }
        }

        self.make_token(TokenKind::Number)
    }

    /// Scan a string literal. Strings have no escape sequences and may span
    /// lines; each embedded newline bumps the line counter.
    fn string(&mut self) -> Token<'src> {
        while self.peek() != b'"' && !self.is_at_end() {
            if self.peek() == b'\n' {
                self.line += 1;
            }
            self.advance();
        }

        if self.is_at_end() {
            return self.error_token("Unterminated string.");
        }

        self.advance();
        self.make_token(TokenKind::String)
    }

    /// Scan an identifier, then classify it as a keyword if it matches one
    fn identifier(&mut self) -> Token<'src> {
        while is_alpha(self.peek()) || self.peek().is_ascii_digit() {
            self.advance();
        }
        self.make_token(self.identifier_kind())
    }

    /// Keyword lookup: a hand-rolled trie over the first distinguishing bytes
    fn identifier_kind(&self) -> TokenKind {
        let bytes = self.source.as_bytes();
        match bytes[self.start] {
            b'a' => self.check_keyword(1, "nd", TokenKind::And),
            b'c' => self.check_keyword(1, "lass", TokenKind::Class),
            b'e' => self.check_keyword(1, "lse", TokenKind::Else),
            b'f' if self.current - self.start > 1 => match bytes[self.start + 1] {
                b'a' => self.check_keyword(2, "lse", TokenKind::False),
                b'o' => self.check_keyword(2, "r", TokenKind::For),
                b'u' => self.check_keyword(2, "n", TokenKind::Fun),
                _ => TokenKind::Identifier,
            },
            b'i' => self.check_keyword(1, "f", TokenKind::If),
            b'n' => self.check_keyword(1, "il", TokenKind::Nil),
            b'o' => self.check_keyword(1, "r", TokenKind::Or),
            b'p' => self.check_keyword(1, "rint", TokenKind::Print),
            b'r' => self.check_keyword(1, "eturn", TokenKind::Return),
            b's' => self.check_keyword(1, "uper", TokenKind::Super),
            b't' if self.current - self.start > 1 => match bytes[self.start + 1] {
                b'h' => self.check_keyword(2, "is", TokenKind::This),
                b'r' => self.check_keyword(2, "ue", TokenKind::True),
                _ => TokenKind::Identifier,
            },
            b'v' => self.check_keyword(1, "ar", TokenKind::Var),
            b'w' => self.check_keyword(1, "hile", TokenKind::While),
            _ => TokenKind::Identifier,
        }
    }

    /// Compare the rest of the current lexeme against a keyword suffix
    fn check_keyword(&self, offset: usize, rest: &str, kind: TokenKind) -> TokenKind {
        let begin = self.start + offset;
        if self.current - begin == rest.len() && &self.source[begin..self.current] == rest {
            kind
        } else {
            TokenKind::Identifier
        }
    }

    // === Character navigation ===

    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn advance(&mut self) -> u8 {
        let c = self.source.as_bytes()[self.current];
        self.current += 1;
        c
    }

    fn peek(&self) -> u8 {
        self.source.as_bytes().get(self.current).copied().unwrap_or(0)
    }

    fn peek_next(&self) -> u8 {
        self.source
            .as_bytes()
            .get(self.current + 1)
            .copied()
            .unwrap_or(0)
    }

    fn matches(&mut self, expected: u8) -> bool {
        if self.is_at_end() || self.source.as_bytes()[self.current] != expected {
            false
        } else {
            self.current += 1;
            true
        }
    }

    // === Token creation ===

    fn make_token(&self, kind: TokenKind) -> Token<'src> {
        Token {
            kind,
            lexeme: &self.source[self.start..self.current],
            line: self.line,
        }
    }

    fn error_token(&self, message: &'static str) -> Token<'src> {
        Token {
            kind: TokenKind::Error,
            lexeme: message,
            line: self.line,
        }
    }
}

/// First character of an identifier: letters and underscore
fn is_alpha(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(source);
        let mut out = Vec::new();
        loop {
            let token = lexer.next_token();
            let done = token.kind == TokenKind::Eof;
            out.push(token.kind);
            if done {
                break;
            }
        }
        out
    }

    #[rstest]
    #[case("and", TokenKind::And)]
    #[case("class", TokenKind::Class)]
    #[case("else", TokenKind::Else)]
    #[case("false", TokenKind::False)]
    #[case("for", TokenKind::For)]
    #[case("fun", TokenKind::Fun)]
    #[case("if", TokenKind::If)]
    #[case("nil", TokenKind::Nil)]
    #[case("or", TokenKind::Or)]
    #[case("print", TokenKind::Print)]
    #[case("return", TokenKind::Return)]
    #[case("super", TokenKind::Super)]
    #[case("this", TokenKind::This)]
    #[case("true", TokenKind::True)]
    #[case("var", TokenKind::Var)]
    #[case("while", TokenKind::While)]
    fn keywords(#[case] source: &str, #[case] expected: TokenKind) {
        assert_eq!(kinds(source), vec![expected, TokenKind::Eof]);
    }

    #[rstest]
    #[case("android")]
    #[case("classy")]
    #[case("format")]
    #[case("_")]
    #[case("thistle")]
    #[case("f")]
    #[case("t")]
    fn near_keywords_are_identifiers(#[case] source: &str) {
        assert_eq!(kinds(source), vec![TokenKind::Identifier, TokenKind::Eof]);
    }

    #[test]
    fn punctuation_and_operators() {
        assert_eq!(
            kinds("(){};,.-+/*! != = == < <= > >="),
            vec![
                TokenKind::LeftParen,
                TokenKind::RightParen,
                TokenKind::LeftBrace,
                TokenKind::RightBrace,
                TokenKind::Semicolon,
                TokenKind::Comma,
                TokenKind::Dot,
                TokenKind::Minus,
                TokenKind::Plus,
                TokenKind::Slash,
                TokenKind::Star,
                TokenKind::Bang,
                TokenKind::BangEqual,
                TokenKind::Equal,
                TokenKind::EqualEqual,
                TokenKind::Less,
                TokenKind::LessEqual,
                TokenKind::Greater,
                TokenKind::GreaterEqual,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn number_lexemes() {
        let mut lexer = Lexer::new("123 45.67");
        let a = lexer.next_token();
        let b = lexer.next_token();
        assert_eq!((a.kind, a.lexeme), (TokenKind::Number, "123"));
        assert_eq!((b.kind, b.lexeme), (TokenKind::Number, "45.67"));
    }

    #[test]
    fn trailing_dot_is_not_part_of_number() {
        // "1." lexes as the number 1 followed by a dot token
        assert_eq!(
            kinds("1."),
            vec![TokenKind::Number, TokenKind::Dot, TokenKind::Eof]
        );
    }

    #[test]
    fn string_lexeme_keeps_quotes() {
        let mut lexer = Lexer::new("\"hello\"");
        let token = lexer.next_token();
        assert_eq!(token.kind, TokenKind::String);
        assert_eq!(token.lexeme, "\"hello\"");
    }

    #[test]
    fn multiline_string_counts_lines() {
        let mut lexer = Lexer::new("\"a\nb\" x");
        let string = lexer.next_token();
        assert_eq!(string.kind, TokenKind::String);
        assert_eq!(string.line, 2);
        let ident = lexer.next_token();
        assert_eq!(ident.line, 2);
    }

    #[test]
    fn unterminated_string_reports_final_line() {
        let mut lexer = Lexer::new("\"abc\ndef");
        let token = lexer.next_token();
        assert_eq!(token.kind, TokenKind::Error);
        assert_eq!(token.lexeme, "Unterminated string.");
        assert_eq!(token.line, 2);
    }

    #[test]
    fn comments_run_to_end_of_line() {
        assert_eq!(
            kinds("1 // comment with + - tokens\n2"),
            vec![TokenKind::Number, TokenKind::Number, TokenKind::Eof]
        );
    }

    #[test]
    fn slash_alone_is_division() {
        assert_eq!(
            kinds("1 / 2"),
            vec![
                TokenKind::Number,
                TokenKind::Slash,
                TokenKind::Number,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn newlines_bump_line_counter() {
        let mut lexer = Lexer::new("a\nb\n\nc");
        assert_eq!(lexer.next_token().line, 1);
        assert_eq!(lexer.next_token().line, 2);
        assert_eq!(lexer.next_token().line, 4);
    }

    #[test]
    fn unexpected_character() {
        let mut lexer = Lexer::new("@");
        let token = lexer.next_token();
        assert_eq!(token.kind, TokenKind::Error);
        assert_eq!(token.lexeme, "Unexpected character.");
    }

    #[test]
    fn empty_source_is_just_eof() {
        assert_eq!(kinds(""), vec![TokenKind::Eof]);
    }
}
