//! Source text to token stream.
//!
//! [`tokenize`] never fails. Malformed input produces an [`TokenKind::Error`]
//! token plus a LEX-phase [`ScriptError`], and scanning carries on, so the
//! returned stream always ends with [`TokenKind::Eof`].
//!
//! Positions are 1-based. Every character advances the column, including
//! characters inside strings and comments; a newline bumps the line and
//! resets the column to 1. Columns count `char`s, not bytes.

use std::fmt;

use crate::error::{ErrorKind, ScriptError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    // Literals
    Number,
    HexNumber,
    Float,
    /// Integer with an `s` suffix, e.g. `500s`.
    TimeLiteral,
    String,
    Identifier,

    // Keywords
    Var,
    Send,
    Delay,
    Repeat,
    Loop,
    If,
    Else,
    WaitFor,
    Random,
    RandomBytes,
    Function,
    Return,
    OnReceive,
    OnInterval,
    Break,
    Continue,
    Print,
    Ext,
    Timeout,
    Data,
    True,
    False,

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Amp,
    Pipe,
    Caret,
    Tilde,
    Bang,
    AmpAmp,
    PipePipe,
    Shl,
    Shr,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    NotEq,
    Assign,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    Question,
    Colon,

    // Punctuation
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Semicolon,
    Dot,

    Error,
    Eof,
}

const KEYWORDS: &[(&str, TokenKind)] = &[
    ("var", TokenKind::Var),
    ("send", TokenKind::Send),
    ("delay", TokenKind::Delay),
    ("repeat", TokenKind::Repeat),
    ("loop", TokenKind::Loop),
    ("if", TokenKind::If),
    ("else", TokenKind::Else),
    ("wait_for", TokenKind::WaitFor),
    ("random", TokenKind::Random),
    ("random_bytes", TokenKind::RandomBytes),
    ("function", TokenKind::Function),
    ("return", TokenKind::Return),
    ("on_receive", TokenKind::OnReceive),
    ("on_interval", TokenKind::OnInterval),
    ("break", TokenKind::Break),
    ("continue", TokenKind::Continue),
    ("print", TokenKind::Print),
    ("ext", TokenKind::Ext),
    ("timeout", TokenKind::Timeout),
    ("data", TokenKind::Data),
    ("true", TokenKind::True),
    ("false", TokenKind::False),
];

impl TokenKind {
    pub fn keyword(word: &str) -> Option<TokenKind> {
        KEYWORDS.iter().find(|(k, _)| *k == word).map(|(_, kind)| *kind)
    }

    pub fn is_keyword(self) -> bool {
        KEYWORDS.iter().any(|(_, kind)| *kind == self)
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some((word, _)) = KEYWORDS.iter().find(|(_, kind)| kind == self) {
            return write!(f, "'{}'", word);
        }
        let s = match self {
            TokenKind::Number => "number",
            TokenKind::HexNumber => "hex number",
            TokenKind::Float => "float",
            TokenKind::TimeLiteral => "time literal",
            TokenKind::String => "string",
            TokenKind::Identifier => "identifier",
            TokenKind::Plus => "'+'",
            TokenKind::Minus => "'-'",
            TokenKind::Star => "'*'",
            TokenKind::Slash => "'/'",
            TokenKind::Percent => "'%'",
            TokenKind::Amp => "'&'",
            TokenKind::Pipe => "'|'",
            TokenKind::Caret => "'^'",
            TokenKind::Tilde => "'~'",
            TokenKind::Bang => "'!'",
            TokenKind::AmpAmp => "'&&'",
            TokenKind::PipePipe => "'||'",
            TokenKind::Shl => "'<<'",
            TokenKind::Shr => "'>>'",
            TokenKind::Lt => "'<'",
            TokenKind::Le => "'<='",
            TokenKind::Gt => "'>'",
            TokenKind::Ge => "'>='",
            TokenKind::EqEq => "'=='",
            TokenKind::NotEq => "'!='",
            TokenKind::Assign => "'='",
            TokenKind::PlusAssign => "'+='",
            TokenKind::MinusAssign => "'-='",
            TokenKind::StarAssign => "'*='",
            TokenKind::SlashAssign => "'/='",
            TokenKind::Question => "'?'",
            TokenKind::Colon => "':'",
            TokenKind::LParen => "'('",
            TokenKind::RParen => "')'",
            TokenKind::LBrace => "'{'",
            TokenKind::RBrace => "'}'",
            TokenKind::LBracket => "'['",
            TokenKind::RBracket => "']'",
            TokenKind::Comma => "','",
            TokenKind::Semicolon => "';'",
            TokenKind::Dot => "'.'",
            TokenKind::Error => "invalid token",
            TokenKind::Eof => "end of input",
            _ => "keyword",
        };
        write!(f, "{}", s)
    }
}

/// A lexeme with its position.
///
/// For [`TokenKind::String`] the `text` holds the unescaped contents; for
/// every other kind it is the exact source slice.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub line: usize,
    pub column: usize,
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    column: usize,
    tokens: Vec<Token>,
    errors: Vec<ScriptError>,
}

impl Lexer {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
            tokens: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn slice(&self, start: usize) -> String {
        self.chars[start..self.pos].iter().collect()
    }

    fn push(&mut self, kind: TokenKind, text: String, line: usize, column: usize) {
        self.tokens.push(Token { kind, text, line, column });
    }

    fn error(&mut self, kind: ErrorKind, message: impl Into<String>, line: usize, column: usize) {
        self.errors.push(ScriptError::lex(kind, message, line, column));
    }

    fn run(mut self) -> (Vec<Token>, Vec<ScriptError>) {
        while let Some(c) = self.peek() {
            let (line, column) = (self.line, self.column);
            let start = self.pos;
            match c {
                ' ' | '\t' | '\r' | '\n' => {
                    self.advance();
                }
                '/' if self.peek_at(1) == Some('/') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                '/' if self.peek_at(1) == Some('*') => self.block_comment(start, line, column),
                '"' => self.string(start, line, column),
                c if c.is_ascii_digit() => self.number(start, line, column),
                c if c.is_alphabetic() || c == '_' => self.identifier(start, line, column),
                _ => self.operator(start, line, column),
            }
        }
        let (line, column) = (self.line, self.column);
        self.push(TokenKind::Eof, String::new(), line, column);
        (self.tokens, self.errors)
    }

    /// Block comments nest: `/* a /* b */ c */` is one comment.
    fn block_comment(&mut self, start: usize, line: usize, column: usize) {
        self.advance();
        self.advance();
        let mut depth = 1usize;
        while depth > 0 {
            match (self.peek(), self.peek_at(1)) {
                (Some('/'), Some('*')) => {
                    self.advance();
                    self.advance();
                    depth += 1;
                }
                (Some('*'), Some('/')) => {
                    self.advance();
                    self.advance();
                    depth -= 1;
                }
                (Some(_), _) => {
                    self.advance();
                }
                (None, _) => {
                    let text = self.slice(start);
                    self.push(TokenKind::Error, text, line, column);
                    self.error(ErrorKind::UnterminatedComment, "Unterminated block comment", line, column);
                    return;
                }
            }
        }
    }

    /// A raw newline ends the literal as unterminated; scanning resumes at the newline.
    fn string(&mut self, start: usize, line: usize, column: usize) {
        self.advance();
        let mut value = String::new();
        loop {
            match self.peek() {
                None | Some('\n') => {
                    let text = self.slice(start);
                    self.push(TokenKind::Error, text, line, column);
                    self.error(ErrorKind::UnterminatedString, "Unterminated string", line, column);
                    return;
                }
                Some('"') => {
                    self.advance();
                    break;
                }
                Some('\\') => {
                    let (esc_line, esc_column) = (self.line, self.column);
                    self.advance();
                    match self.peek() {
                        Some('n') => value.push('\n'),
                        Some('t') => value.push('\t'),
                        Some('"') => value.push('"'),
                        Some('\\') => value.push('\\'),
                        // Let the loop report the unterminated literal.
                        None | Some('\n') => continue,
                        Some(other) => {
                            value.push(other);
                            self.error(
                                ErrorKind::InvalidEscape,
                                format!("Unknown escape sequence '\\{}'", other),
                                esc_line,
                                esc_column,
                            );
                        }
                    }
                    self.advance();
                }
                Some(c) => {
                    value.push(c);
                    self.advance();
                }
            }
        }
        self.push(TokenKind::String, value, line, column);
    }

    fn number(&mut self, start: usize, line: usize, column: usize) {
        if self.peek() == Some('0') && matches!(self.peek_at(1), Some('x') | Some('X')) {
            self.advance();
            self.advance();
            while self.peek().is_some_and(|c| c.is_ascii_hexdigit()) {
                self.advance();
            }
            let text = self.slice(start);
            if text.len() == 2 {
                self.push(TokenKind::Error, text, line, column);
                self.error(
                    ErrorKind::InvalidNumber,
                    "Hex literal requires at least one hex digit",
                    line,
                    column,
                );
            } else {
                self.push(TokenKind::HexNumber, text, line, column);
            }
            return;
        }

        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.advance();
        }

        if self.peek() == Some('.') && self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
            self.advance();
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.advance();
            }
            let text = self.slice(start);
            self.push(TokenKind::Float, text, line, column);
            return;
        }

        let suffix_follows = self.peek() == Some('s')
            && !self.peek_at(1).is_some_and(|c| c.is_alphanumeric() || c == '_');
        if suffix_follows {
            self.advance();
            let text = self.slice(start);
            self.push(TokenKind::TimeLiteral, text, line, column);
            return;
        }

        let text = self.slice(start);
        self.push(TokenKind::Number, text, line, column);
    }

    fn identifier(&mut self, start: usize, line: usize, column: usize) {
        while self.peek().is_some_and(|c| c.is_alphanumeric() || c == '_') {
            self.advance();
        }
        let text = self.slice(start);
        let kind = TokenKind::keyword(&text).unwrap_or(TokenKind::Identifier);
        self.push(kind, text, line, column);
    }

    fn operator(&mut self, start: usize, line: usize, column: usize) {
        let c = match self.advance() {
            Some(c) => c,
            None => return,
        };
        let next = self.peek();
        let two = |k: TokenKind| (k, true);
        let one = |k: TokenKind| (k, false);
        let (kind, wide) = match (c, next) {
            ('&', Some('&')) => two(TokenKind::AmpAmp),
            ('|', Some('|')) => two(TokenKind::PipePipe),
            ('<', Some('<')) => two(TokenKind::Shl),
            ('>', Some('>')) => two(TokenKind::Shr),
            ('<', Some('=')) => two(TokenKind::Le),
            ('>', Some('=')) => two(TokenKind::Ge),
            ('=', Some('=')) => two(TokenKind::EqEq),
            ('!', Some('=')) => two(TokenKind::NotEq),
            ('+', Some('=')) => two(TokenKind::PlusAssign),
            ('-', Some('=')) => two(TokenKind::MinusAssign),
            ('*', Some('=')) => two(TokenKind::StarAssign),
            ('/', Some('=')) => two(TokenKind::SlashAssign),
            ('+', _) => one(TokenKind::Plus),
            ('-', _) => one(TokenKind::Minus),
            ('*', _) => one(TokenKind::Star),
            ('/', _) => one(TokenKind::Slash),
            ('%', _) => one(TokenKind::Percent),
            ('&', _) => one(TokenKind::Amp),
            ('|', _) => one(TokenKind::Pipe),
            ('^', _) => one(TokenKind::Caret),
            ('~', _) => one(TokenKind::Tilde),
            ('!', _) => one(TokenKind::Bang),
            ('<', _) => one(TokenKind::Lt),
            ('>', _) => one(TokenKind::Gt),
            ('=', _) => one(TokenKind::Assign),
            ('?', _) => one(TokenKind::Question),
            (':', _) => one(TokenKind::Colon),
            ('(', _) => one(TokenKind::LParen),
            (')', _) => one(TokenKind::RParen),
            ('{', _) => one(TokenKind::LBrace),
            ('}', _) => one(TokenKind::RBrace),
            ('[', _) => one(TokenKind::LBracket),
            (']', _) => one(TokenKind::RBracket),
            (',', _) => one(TokenKind::Comma),
            (';', _) => one(TokenKind::Semicolon),
            ('.', _) => one(TokenKind::Dot),
            (other, _) => {
                self.push(TokenKind::Error, other.to_string(), line, column);
                self.error(
                    ErrorKind::UnexpectedCharacter,
                    format!("Unexpected character: '{}'", other),
                    line,
                    column,
                );
                return;
            }
        };
        if wide {
            self.advance();
        }
        let text = self.slice(start);
        self.push(kind, text, line, column);
    }
}

/// Splits `source` into tokens, collecting LEX diagnostics along the way.
pub fn tokenize(source: &str) -> (Vec<Token>, Vec<ScriptError>) {
    Lexer::new(source).run()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source).0.into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_hex_literal_is_one_token() {
        let (tokens, errors) = tokenize("0x7DF");
        assert!(errors.is_empty());
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0].kind, TokenKind::HexNumber);
        assert_eq!(tokens[0].text, "0x7DF");
        assert_eq!(tokens[1].kind, TokenKind::Eof);
    }

    #[test]
    fn test_hex_without_digits_is_error() {
        let (tokens, errors) = tokenize("0x");
        assert_eq!(tokens[0].kind, TokenKind::Error);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ErrorKind::InvalidNumber);
    }

    #[test]
    fn test_uppercase_hex_prefix() {
        let (tokens, _) = tokenize("0XfF");
        assert_eq!(tokens[0].kind, TokenKind::HexNumber);
        assert_eq!(tokens[0].text, "0XfF");
    }

    #[test]
    fn test_float_requires_digits_on_both_sides() {
        assert_eq!(kinds("3.14"), vec![TokenKind::Float, TokenKind::Eof]);
        assert_eq!(
            kinds("3.x"),
            vec![TokenKind::Number, TokenKind::Dot, TokenKind::Identifier, TokenKind::Eof]
        );
    }

    #[test]
    fn test_time_literal_suffix() {
        let (tokens, _) = tokenize("500s");
        assert_eq!(tokens[0].kind, TokenKind::TimeLiteral);
        assert_eq!(tokens[0].text, "500s");

        // `s` followed by more identifier characters is not a suffix
        assert_eq!(
            kinds("500sec"),
            vec![TokenKind::Number, TokenKind::Identifier, TokenKind::Eof]
        );
        assert_eq!(kinds("2s)"), vec![TokenKind::TimeLiteral, TokenKind::RParen, TokenKind::Eof]);
    }

    #[test]
    fn test_keywords() {
        assert_eq!(
            kinds("var wait_for random_bytes on_receive ext data id"),
            vec![
                TokenKind::Var,
                TokenKind::WaitFor,
                TokenKind::RandomBytes,
                TokenKind::OnReceive,
                TokenKind::Ext,
                TokenKind::Data,
                TokenKind::Identifier,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_maximal_munch_operators() {
        assert_eq!(
            kinds("<< <= < >> >= > == = != ! && & || | += -="),
            vec![
                TokenKind::Shl,
                TokenKind::Le,
                TokenKind::Lt,
                TokenKind::Shr,
                TokenKind::Ge,
                TokenKind::Gt,
                TokenKind::EqEq,
                TokenKind::Assign,
                TokenKind::NotEq,
                TokenKind::Bang,
                TokenKind::AmpAmp,
                TokenKind::Amp,
                TokenKind::PipePipe,
                TokenKind::Pipe,
                TokenKind::PlusAssign,
                TokenKind::MinusAssign,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        let (tokens, errors) = tokenize(r#""a\nb\t\"q\" \\""#);
        assert!(errors.is_empty());
        assert_eq!(tokens[0].kind, TokenKind::String);
        assert_eq!(tokens[0].text, "a\nb\t\"q\" \\");
    }

    #[test]
    fn test_unknown_escape_is_reported_but_kept() {
        let (tokens, errors) = tokenize(r#""a\qb""#);
        assert_eq!(tokens[0].kind, TokenKind::String);
        assert_eq!(tokens[0].text, "aqb");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ErrorKind::InvalidEscape);
        assert_eq!(errors[0].column, 3);
    }

    #[test]
    fn test_unterminated_string() {
        let (tokens, errors) = tokenize("print \"abc");
        assert!(!errors.is_empty());
        assert!(errors.iter().all(|e| e.phase == crate::error::Phase::Lex));
        assert_eq!(errors[0].kind, ErrorKind::UnterminatedString);
        assert_eq!(tokens.last().unwrap().kind, TokenKind::Eof);
        assert_eq!(tokens[1].kind, TokenKind::Error);
    }

    #[test]
    fn test_unterminated_string_stops_at_newline() {
        let (tokens, errors) = tokenize("\"abc\nsend");
        assert_eq!(errors.len(), 1);
        assert_eq!(tokens[1].kind, TokenKind::Send);
        assert_eq!(tokens[1].line, 2);
        assert_eq!(tokens[1].column, 1);
    }

    #[test]
    fn test_unexpected_character_continues() {
        let (tokens, errors) = tokenize("a @ b");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ErrorKind::UnexpectedCharacter);
        assert_eq!(errors[0].column, 3);
        assert_eq!(
            tokens.iter().map(|t| t.kind).collect::<Vec<_>>(),
            vec![TokenKind::Identifier, TokenKind::Error, TokenKind::Identifier, TokenKind::Eof]
        );
    }

    #[test]
    fn test_comments_are_skipped() {
        assert_eq!(kinds("a // comment\nb"), vec![TokenKind::Identifier, TokenKind::Identifier, TokenKind::Eof]);
        assert_eq!(kinds("a /* x /* y */ z */ b"), vec![TokenKind::Identifier, TokenKind::Identifier, TokenKind::Eof]);
    }

    #[test]
    fn test_unterminated_block_comment() {
        let (tokens, errors) = tokenize("a /* never /* closed */");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ErrorKind::UnterminatedComment);
        assert_eq!(errors[0].column, 3);
        assert_eq!(tokens.last().unwrap().kind, TokenKind::Eof);
    }

    #[test]
    fn test_positions_across_multiline_comment() {
        let (tokens, _) = tokenize("/* one\n  two */ x\n\ty");
        assert_eq!((tokens[0].line, tokens[0].column), (2, 10));
        // a tab counts as a single column
        assert_eq!((tokens[1].line, tokens[1].column), (3, 2));
    }

    #[test]
    fn test_positions_count_chars_not_bytes() {
        let (tokens, _) = tokenize("\"é\" x");
        assert_eq!(tokens[1].column, 5);
    }

    #[test]
    fn test_empty_source_is_just_eof() {
        let (tokens, errors) = tokenize("");
        assert!(errors.is_empty());
        assert_eq!(tokens.len(), 1);
        assert_eq!((tokens[0].kind, tokens[0].line, tokens[0].column), (TokenKind::Eof, 1, 1));
    }
}
