//! Minimal token scanner for Lua source.
//!
//! Strips comments and string literals, then emits identifier/keyword and
//! operator tokens with 1-indexed positions. This is not a full lexer: it
//! only needs to be accurate enough for the static checks in the validator,
//! and it must never flag names that appear inside strings or comments.

/// A source token with its position.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub text: String,
    pub line: usize,
    pub col: usize,
}

/// String marker token emitted in place of any string literal, so the
/// validator can still reason about statement shapes around strings.
pub const STRING_TOKEN: &str = "<string>";

struct Scanner<'a> {
    bytes: &'a [u8],
    pos: usize,
    line: usize,
    col: usize,
}

impl<'a> Scanner<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            bytes: source.as_bytes(),
            pos: 0,
            line: 1,
            col: 1,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(b)
    }

    /// Detects a long-bracket opener `[`, `[=`, `[==`, ... `[` at the
    /// current position and returns its level.
    fn long_bracket_level(&self) -> Option<usize> {
        if self.peek() != Some(b'[') {
            return None;
        }
        let mut level = 0;
        loop {
            match self.peek_at(1 + level) {
                Some(b'=') => level += 1,
                Some(b'[') => return Some(level),
                _ => return None,
            }
        }
    }

    /// Consumes up to and including the matching `]=*]` closer.
    fn skip_long_bracket(&mut self, level: usize) {
        // Skip the opener
        for _ in 0..level + 2 {
            self.bump();
        }
        loop {
            match self.bump() {
                None => return,
                Some(b']') => {
                    let mut eq = 0;
                    while self.peek() == Some(b'=') && eq < level {
                        self.bump();
                        eq += 1;
                    }
                    if eq == level && self.peek() == Some(b']') {
                        self.bump();
                        return;
                    }
                }
                Some(_) => {}
            }
        }
    }

    fn skip_quoted_string(&mut self, quote: u8) {
        self.bump();
        loop {
            match self.bump() {
                None => return,
                Some(b'\\') => {
                    self.bump();
                }
                Some(b) if b == quote => return,
                Some(b'\n') => return,
                Some(_) => {}
            }
        }
    }
}

/// Multi-character operators recognized as single tokens, longest first.
const MULTI_OPS: &[&str] = &["...", "..", "==", "~=", "<=", ">=", "::"];

/// Tokenizes `source`, dropping comments and replacing each string literal
/// with a single [`STRING_TOKEN`] marker.
pub fn scan(source: &str) -> Vec<Token> {
    let mut scanner = Scanner::new(source);
    let mut tokens = Vec::new();

    while let Some(b) = scanner.peek() {
        let line = scanner.line;
        let col = scanner.col;

        // Comments: `--` then either a long bracket or the rest of the line
        if b == b'-' && scanner.peek_at(1) == Some(b'-') {
            scanner.bump();
            scanner.bump();
            if let Some(level) = scanner.long_bracket_level() {
                scanner.skip_long_bracket(level);
            } else {
                while let Some(c) = scanner.peek() {
                    if c == b'\n' {
                        break;
                    }
                    scanner.bump();
                }
            }
            continue;
        }

        // Long string literal
        if b == b'[' {
            if let Some(level) = scanner.long_bracket_level() {
                scanner.skip_long_bracket(level);
                tokens.push(Token {
                    text: STRING_TOKEN.to_string(),
                    line,
                    col,
                });
                continue;
            }
        }

        // Quoted string literal
        if b == b'\'' || b == b'"' {
            scanner.skip_quoted_string(b);
            tokens.push(Token {
                text: STRING_TOKEN.to_string(),
                line,
                col,
            });
            continue;
        }

        if b.is_ascii_whitespace() {
            scanner.bump();
            continue;
        }

        // Identifier or keyword
        if b.is_ascii_alphabetic() || b == b'_' {
            let mut text = String::new();
            while let Some(c) = scanner.peek() {
                if c.is_ascii_alphanumeric() || c == b'_' {
                    text.push(c as char);
                    scanner.bump();
                } else {
                    break;
                }
            }
            tokens.push(Token { text, line, col });
            continue;
        }

        // Number: consume greedily so `1e5` and `0xFF` stay one token
        if b.is_ascii_digit() {
            let mut text = String::new();
            while let Some(c) = scanner.peek() {
                if c.is_ascii_alphanumeric() || c == b'.' {
                    text.push(c as char);
                    scanner.bump();
                } else {
                    break;
                }
            }
            tokens.push(Token { text, line, col });
            continue;
        }

        // Multi-character operator
        let rest = &scanner.bytes[scanner.pos..];
        if let Some(op) = MULTI_OPS
            .iter()
            .find(|op| rest.starts_with(op.as_bytes()))
        {
            for _ in 0..op.len() {
                scanner.bump();
            }
            tokens.push(Token {
                text: (*op).to_string(),
                line,
                col,
            });
            continue;
        }

        // Single-character punctuation
        scanner.bump();
        tokens.push(Token {
            text: (b as char).to_string(),
            line,
            col,
        });
    }

    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(source: &str) -> Vec<String> {
        scan(source).into_iter().map(|t| t.text).collect()
    }

    #[test]
    fn test_scan_identifiers_and_ops() {
        assert_eq!(
            texts("local x = a == b"),
            vec!["local", "x", "=", "a", "==", "b"]
        );
    }

    #[test]
    fn test_scan_drops_line_comments() {
        assert_eq!(
            texts("x = 1 -- os.execute here\ny = 2"),
            vec!["x", "=", "1", "y", "=", "2"]
        );
    }

    #[test]
    fn test_scan_drops_block_comments() {
        assert_eq!(
            texts("x = 1 --[[ io.open\nspans lines ]] y = 2"),
            vec!["x", "=", "1", "y", "=", "2"]
        );
    }

    #[test]
    fn test_scan_replaces_strings_with_marker() {
        assert_eq!(
            texts("local s = 'io.open' .. \"os\""),
            vec!["local", "s", "=", STRING_TOKEN, "..", STRING_TOKEN]
        );
    }

    #[test]
    fn test_scan_long_strings() {
        assert_eq!(
            texts("local s = [==[ contains ]] os.date ]==]"),
            vec!["local", "s", "=", STRING_TOKEN]
        );
    }

    #[test]
    fn test_scan_escaped_quote() {
        assert_eq!(
            texts(r#"local s = "a\"b" ; t = 1"#),
            vec!["local", "s", "=", STRING_TOKEN, ";", "t", "=", "1"]
        );
    }

    #[test]
    fn test_scan_positions() {
        let tokens = scan("local x\nreturn x");
        assert_eq!(tokens[0].line, 1);
        assert_eq!(tokens[0].col, 1);
        assert_eq!(tokens[2].text, "return");
        assert_eq!(tokens[2].line, 2);
        assert_eq!(tokens[2].col, 1);
    }

    #[test]
    fn test_scan_numbers_and_varargs() {
        assert_eq!(
            texts("f(1e5, 0xFF, ...)"),
            vec!["f", "(", "1e5", ",", "0xFF", ",", "...", ")"]
        );
    }
}
