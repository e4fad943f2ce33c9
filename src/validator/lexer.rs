//! Tokenizer for Python source.
//!
//! Produces the logical-line token stream the parser consumes: `Newline`
//! ends a logical line, `Indent`/`Dedent` bracket blocks, newlines inside
//! brackets and after a `\` continuation are joined. Anything the tokenizer
//! does not understand is an error; the validator treats errors as unsafe.

use super::{Location, ParseError};

#[derive(Debug, Clone, PartialEq)]
pub struct StrLit {
    /// Raw text between the quotes (escapes are not processed).
    pub body: String,
    pub fstring: bool,
    pub bytes: bool,
    /// Position of the first character after the opening quotes.
    pub start: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Name(String),
    /// Numeric literal. `int` is set for integer literals that fit in 128 bits.
    Number { int: Option<u128>, is_int: bool },
    Str(StrLit),
    Op(&'static str),
    Newline,
    Indent,
    Dedent,
    EndMarker,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub loc: Location,
}

const OPERATORS_3: &[&str] = &["**=", "//=", ">>=", "<<=", "..."];
const OPERATORS_2: &[&str] = &[
    "**", "//", "<<", ">>", "<=", ">=", "==", "!=", "->", ":=", "+=", "-=", "*=", "/=", "%=", "&=",
    "|=", "^=", "@=",
];
const OPERATORS_1: &[&str] = &[
    "+", "-", "*", "/", "%", "@", "&", "|", "^", "~", "<", ">", "(", ")", "[", "]", "{", "}", ",",
    ":", ".", ";", "=",
];

const TAB_SIZE: usize = 8;

pub fn tokenize(source: &str) -> Result<Vec<Token>, ParseError> {
    Lexer::new(source, Location { line: 1, column: 1 }).run()
}

/// Tokenize a fragment (an f-string replacement field) whose first
/// character sits at `origin` in the enclosing source.
pub fn tokenize_at(source: &str, origin: Location) -> Result<Vec<Token>, ParseError> {
    Lexer::new(source, origin).run()
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    column: usize,
    indents: Vec<usize>,
    brackets: Vec<(char, Location)>,
    tokens: Vec<Token>,
    at_line_start: bool,
}

impl Lexer {
    fn new(source: &str, origin: Location) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: origin.line,
            column: origin.column,
            indents: vec![0],
            brackets: Vec::new(),
            tokens: Vec::new(),
            at_line_start: true,
        }
    }

    fn loc(&self) -> Location {
        Location {
            line: self.line,
            column: self.column,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.get(self.pos).copied()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn push(&mut self, kind: TokenKind, loc: Location) {
        self.tokens.push(Token { kind, loc });
    }

    fn error(&self, loc: Location, message: impl Into<String>) -> ParseError {
        ParseError::new(loc, message)
    }

    fn run(mut self) -> Result<Vec<Token>, ParseError> {
        loop {
            if self.at_line_start && self.brackets.is_empty() {
                if !self.read_indentation()? {
                    break;
                }
                continue;
            }

            let Some(c) = self.peek() else { break };
            let loc = self.loc();
            match c {
                ' ' | '\t' | '\x0c' => {
                    self.bump();
                }
                '#' => self.skip_comment(),
                '\\' => {
                    self.bump();
                    if self.peek() == Some('\r') {
                        self.bump();
                    }
                    if self.bump() != Some('\n') {
                        return Err(self.error(loc, "unexpected character after line continuation"));
                    }
                }
                '\r' | '\n' => {
                    self.bump();
                    if c == '\r' && self.peek() == Some('\n') {
                        self.bump();
                    }
                    if self.brackets.is_empty() {
                        self.push(TokenKind::Newline, loc);
                        self.at_line_start = true;
                    }
                }
                '"' | '\'' => self.read_string(String::new(), loc)?,
                c if c.is_ascii_digit() => self.read_number(loc)?,
                '.' if self.peek_at(1).is_some_and(|d| d.is_ascii_digit()) => {
                    self.read_number(loc)?
                }
                c if c == '_' || c.is_alphabetic() => {
                    let word = self.read_word();
                    if is_string_prefix(&word) && matches!(self.peek(), Some('"' | '\'')) {
                        self.read_string(word, loc)?;
                    } else {
                        self.push(TokenKind::Name(word), loc);
                    }
                }
                _ => self.read_operator(loc)?,
            }
        }

        if let Some((open, loc)) = self.brackets.last() {
            return Err(self.error(*loc, format!("'{}' was never closed", open)));
        }

        let loc = self.loc();
        if self
            .tokens
            .last()
            .is_some_and(|t| !matches!(t.kind, TokenKind::Newline | TokenKind::Dedent))
        {
            self.push(TokenKind::Newline, loc);
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(TokenKind::Dedent, loc);
        }
        self.push(TokenKind::EndMarker, loc);
        Ok(self.tokens)
    }

    /// Measure indentation at the start of a physical line. Blank and
    /// comment-only lines are consumed without producing tokens. Returns
    /// `false` at end of input.
    fn read_indentation(&mut self) -> Result<bool, ParseError> {
        let mut width = 0;
        loop {
            match self.peek() {
                Some(' ') => width += 1,
                Some('\t') => width = (width / TAB_SIZE + 1) * TAB_SIZE,
                Some('\x0c') => width = 0,
                _ => break,
            }
            self.bump();
        }

        match self.peek() {
            None => return Ok(false),
            Some('#') => {
                self.skip_comment();
                return Ok(true);
            }
            Some('\r' | '\n') => {
                if self.bump() == Some('\r') && self.peek() == Some('\n') {
                    self.bump();
                }
                return Ok(true);
            }
            _ => {}
        }

        let loc = self.loc();
        let current = self.indents.last().copied().unwrap_or(0);
        if width > current {
            self.indents.push(width);
            self.push(TokenKind::Indent, loc);
        } else {
            while self.indents.last().is_some_and(|&level| level > width) {
                self.indents.pop();
                self.push(TokenKind::Dedent, loc);
            }
            if self.indents.last().copied() != Some(width) {
                return Err(self.error(loc, "unindent does not match any outer indentation level"));
            }
        }
        self.at_line_start = false;
        Ok(true)
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' || c == '\r' {
                break;
            }
            self.bump();
        }
    }

    fn read_word(&mut self) -> String {
        let mut word = String::new();
        while let Some(c) = self.peek() {
            if c == '_' || c.is_alphanumeric() {
                word.push(c);
                self.bump();
            } else {
                break;
            }
        }
        word
    }

    fn read_string(&mut self, prefix: String, loc: Location) -> Result<(), ParseError> {
        let prefix = prefix.to_ascii_lowercase();
        let fstring = prefix.contains('f');
        let bytes = prefix.contains('b');

        let Some(quote) = self.bump() else {
            return Err(self.error(loc, "unterminated string literal"));
        };
        let triple = self.peek() == Some(quote) && self.peek_at(1) == Some(quote);
        if triple {
            self.bump();
            self.bump();
        }
        let start = self.loc();

        let mut body = String::new();
        loop {
            let Some(c) = self.bump() else {
                return Err(self.error(loc, "unterminated string literal"));
            };
            match c {
                '\\' => {
                    body.push(c);
                    match self.bump() {
                        Some(escaped) => body.push(escaped),
                        None => return Err(self.error(loc, "unterminated string literal")),
                    }
                }
                '\n' | '\r' if !triple => {
                    return Err(self.error(loc, "unterminated string literal"));
                }
                c if c == quote => {
                    if !triple {
                        break;
                    }
                    if self.peek() == Some(quote) && self.peek_at(1) == Some(quote) {
                        self.bump();
                        self.bump();
                        break;
                    }
                    body.push(c);
                }
                c => body.push(c),
            }
        }

        self.push(
            TokenKind::Str(StrLit {
                body,
                fstring,
                bytes,
                start,
            }),
            loc,
        );
        Ok(())
    }

    fn read_number(&mut self, loc: Location) -> Result<(), ParseError> {
        let mut text = String::new();
        let radix = match (self.peek(), self.peek_at(1)) {
            (Some('0'), Some('x' | 'X')) => 16,
            (Some('0'), Some('o' | 'O')) => 8,
            (Some('0'), Some('b' | 'B')) => 2,
            _ => 10,
        };

        if radix != 10 {
            self.bump();
            self.bump();
            while let Some(c) = self.peek() {
                if c == '_' || c.is_digit(radix) {
                    if c != '_' {
                        text.push(c);
                    }
                    self.bump();
                } else {
                    break;
                }
            }
            if text.is_empty() {
                return Err(self.error(loc, "invalid number literal"));
            }
            self.reject_trailing_identifier(loc)?;
            let int = u128::from_str_radix(&text, radix).ok();
            self.push(TokenKind::Number { int, is_int: true }, loc);
            return Ok(());
        }

        let mut is_int = true;
        self.read_digits(&mut text);
        if self.peek() == Some('.') {
            is_int = false;
            self.bump();
            self.read_digits(&mut text);
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            let sign = self.peek_at(1);
            let digit_at = if matches!(sign, Some('+' | '-')) { 2 } else { 1 };
            if self.peek_at(digit_at).is_some_and(|c| c.is_ascii_digit()) {
                is_int = false;
                for _ in 0..digit_at {
                    self.bump();
                }
                let mut exponent = String::new();
                self.read_digits(&mut exponent);
            }
        }
        if matches!(self.peek(), Some('j' | 'J')) {
            is_int = false;
            self.bump();
        }
        self.reject_trailing_identifier(loc)?;

        let int = if is_int { text.parse::<u128>().ok() } else { None };
        self.push(TokenKind::Number { int, is_int }, loc);
        Ok(())
    }

    fn read_digits(&mut self, text: &mut String) {
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                text.push(c);
                self.bump();
            } else if c == '_' {
                self.bump();
            } else {
                break;
            }
        }
    }

    fn reject_trailing_identifier(&self, loc: Location) -> Result<(), ParseError> {
        if self.peek().is_some_and(|c| c == '_' || c.is_alphanumeric()) {
            return Err(self.error(loc, "invalid number literal"));
        }
        Ok(())
    }

    fn read_operator(&mut self, loc: Location) -> Result<(), ParseError> {
        let lookahead: String = self.chars[self.pos..].iter().take(3).collect();
        let op = OPERATORS_3
            .iter()
            .chain(OPERATORS_2)
            .chain(OPERATORS_1)
            .find(|op| lookahead.starts_with(**op))
            .copied();

        let Some(op) = op else {
            let c = self.peek().unwrap_or('\0');
            return Err(self.error(loc, format!("invalid character '{}'", c.escape_debug())));
        };

        for _ in 0..op.chars().count() {
            self.bump();
        }

        match op {
            "(" | "[" | "{" => {
                if let Some(open) = op.chars().next() {
                    self.brackets.push((open, loc));
                }
            }
            ")" | "]" | "}" => {
                let expected = match op {
                    ")" => '(',
                    "]" => '[',
                    _ => '{',
                };
                match self.brackets.pop() {
                    Some((open, _)) if open == expected => {}
                    Some((open, _)) => {
                        return Err(self.error(
                            loc,
                            format!("closing '{}' does not match opening '{}'", op, open),
                        ));
                    }
                    None => return Err(self.error(loc, format!("unmatched '{}'", op))),
                }
            }
            _ => {}
        }

        self.push(TokenKind::Op(op), loc);
        Ok(())
    }
}

fn is_string_prefix(word: &str) -> bool {
    matches!(
        word.to_ascii_lowercase().as_str(),
        "r" | "u" | "b" | "f" | "br" | "rb" | "fr" | "rf"
    )
}
