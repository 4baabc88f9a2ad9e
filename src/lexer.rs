// lexer.rs - Forth tokenizer

use std::fmt;
use std::sync::Arc;

use crate::strings::StringTable;

// ============================================================================
// TOKEN TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// An identifier to be resolved against the dictionary (or locals).
    Word(String),
    /// Integer literal: decimal, 0x.. hex or 0b.. binary.
    Integer(i64),
    /// Double literal, pushed as its IEEE-754 bit pattern.
    Float(f64),
    /// Pre-interned string literal. `addr` is the stable byte address the
    /// string table returned; the observable text form is `sPtr_<addr>`.
    Str { index: usize, addr: u64 },
    /// `:` or `]` - switch the driver into compile mode.
    Compiling(char),
    /// `;` or `[` - switch the driver back to interpret mode.
    Interpreting(char),
    /// End of the token stream.
    End,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Token::Word(w) => write!(f, "{}", w),
            Token::Integer(n) => write!(f, "{}", n),
            Token::Float(x) => write!(f, "{}", x),
            Token::Str { addr, .. } => write!(f, "sPtr_{}", addr),
            Token::Compiling(c) => write!(f, "{}", c),
            Token::Interpreting(c) => write!(f, "{}", c),
            Token::End => write!(f, "<end>"),
        }
    }
}

// ============================================================================
// LEXER
// ============================================================================

pub struct Lexer {
    input: Vec<char>,
    position: usize,
    strings: Arc<StringTable>,
}

impl Lexer {
    pub fn new(input: &str, strings: Arc<StringTable>) -> Self {
        Lexer {
            input: input.chars().collect(),
            position: 0,
            strings,
        }
    }

    /// Tokenize the whole input. Comments between `(` and `)` are removed;
    /// a word ending in `"` (`."`, `s"`, ...) pulls in the following quoted
    /// span, which is interned and carried as a `Str` token.
    pub fn tokenize(&mut self) -> Result<Vec<Token>, LexerError> {
        let mut tokens = Vec::new();

        loop {
            self.skip_whitespace();

            if self.is_at_end() {
                break;
            }

            if self.peek() == Some('(') {
                self.skip_paren_comment()?;
                continue;
            }

            let word = self.next_word();
            if word.is_empty() {
                break;
            }

            if word.len() > 1 && word.ends_with('"') {
                // `."` / `s"` style: the word itself, then the quoted span.
                tokens.push(Token::Word(word));
                tokens.push(self.take_string_literal()?);
                continue;
            }

            tokens.push(self.classify(&word)?);
        }

        tokens.push(Token::End);
        Ok(tokens)
    }

    fn classify(&self, word: &str) -> Result<Token, LexerError> {
        match word {
            ":" => return Ok(Token::Compiling(':')),
            "]" => return Ok(Token::Compiling(']')),
            ";" => return Ok(Token::Interpreting(';')),
            "[" => return Ok(Token::Interpreting('[')),
            _ => {}
        }

        if is_integer(word) {
            return parse_integer(word).map(Token::Integer);
        }
        if is_float(word) {
            return word
                .parse::<f64>()
                .map(Token::Float)
                .map_err(|_| LexerError::InvalidNumber(word.to_string()));
        }
        Ok(Token::Word(word.to_string()))
    }

    /// Read the quoted span after a `."`/`s"` word, intern it and return
    /// the synthetic token that carries the stable address.
    fn take_string_literal(&mut self) -> Result<Token, LexerError> {
        // A single space separates the quote word from the literal text.
        if self.peek() == Some(' ') {
            self.advance();
        }

        let start = self.position;
        while let Some(ch) = self.peek() {
            if ch == '"' {
                let text: String = self.input[start..self.position].iter().collect();
                self.advance(); // consume closing "
                let index = self
                    .strings
                    .intern(&text)
                    .map_err(|e| LexerError::BadLiteral(e.to_string()))?;
                let addr = self
                    .strings
                    .address(index)
                    .map_err(|e| LexerError::BadLiteral(e.to_string()))?
                    as u64;
                return Ok(Token::Str { index, addr });
            }
            self.advance();
        }

        Err(LexerError::UnterminatedString)
    }

    fn next_word(&mut self) -> String {
        let start = self.position;
        while let Some(ch) = self.peek() {
            if ch.is_whitespace() {
                break;
            }
            self.advance();
        }
        self.input[start..self.position].iter().collect()
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.peek() {
            if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn skip_paren_comment(&mut self) -> Result<(), LexerError> {
        self.advance(); // consume (

        let mut depth = 1;
        while depth > 0 {
            match self.peek() {
                Some('(') => depth += 1,
                Some(')') => depth -= 1,
                Some(_) => {}
                None => return Err(LexerError::UnterminatedComment),
            }
            self.advance();
        }
        Ok(())
    }

    fn peek(&self) -> Option<char> {
        self.input.get(self.position).copied()
    }

    fn advance(&mut self) {
        if self.position < self.input.len() {
            self.position += 1;
        }
    }

    fn is_at_end(&self) -> bool {
        self.position >= self.input.len()
    }
}

// ============================================================================
// LITERAL CLASSIFICATION
// ============================================================================

fn is_integer(s: &str) -> bool {
    let body = s.strip_prefix('-').unwrap_or(s);
    if body.is_empty() {
        return false;
    }
    if let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        return !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit());
    }
    if let Some(bin) = body.strip_prefix("0b").or_else(|| body.strip_prefix("0B")) {
        return !bin.is_empty() && bin.chars().all(|c| c == '0' || c == '1');
    }
    body.chars().all(|c| c.is_ascii_digit())
}

/// A float has digits on the mantissa side and contains `.` and/or an
/// exponent marker; a sign may follow the marker. Anything else (e.g.
/// `1+`, `2*`) is a word.
fn is_float(s: &str) -> bool {
    let body = s.strip_prefix('-').unwrap_or(s);
    if body.is_empty() {
        return false;
    }

    let mut saw_digit = false;
    let mut saw_point = false;
    let mut saw_exp = false;
    let mut chars = body.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '0'..='9' => saw_digit = true,
            '.' if !saw_point && !saw_exp => saw_point = true,
            'e' | 'E' if saw_digit && !saw_exp => {
                saw_exp = true;
                if let Some('+') | Some('-') = chars.peek() {
                    chars.next();
                }
                match chars.peek() {
                    Some(c) if c.is_ascii_digit() => {}
                    _ => return false,
                }
            }
            _ => return false,
        }
    }

    saw_digit && (saw_point || saw_exp)
}

fn parse_integer(s: &str) -> Result<i64, LexerError> {
    let (negative, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };

    // Hex and binary forms parse unsigned, so 0xffffffffffffffff is -1.
    let value = if let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).map(|v| v as i64)
    } else if let Some(bin) = body.strip_prefix("0b").or_else(|| body.strip_prefix("0B")) {
        u64::from_str_radix(bin, 2).map(|v| v as i64)
    } else {
        body.parse::<i64>()
    }
    .map_err(|_| LexerError::InvalidNumber(s.to_string()))?;

    Ok(if negative { value.wrapping_neg() } else { value })
}

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum LexerError {
    InvalidNumber(String),
    UnterminatedString,
    UnterminatedComment,
    BadLiteral(String),
}

impl fmt::Display for LexerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LexerError::InvalidNumber(s) => write!(f, "invalid number: {}", s),
            LexerError::UnterminatedString => write!(f, "unterminated string literal"),
            LexerError::UnterminatedComment => write!(f, "unterminated comment"),
            LexerError::BadLiteral(msg) => write!(f, "bad string literal: {}", msg),
        }
    }
}

impl std::error::Error for LexerError {}
