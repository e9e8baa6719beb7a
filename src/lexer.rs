//! Hand-written single-pass scanner: source bytes → `(kind, text, line)` tokens.
//!
//! No regex engine; character classification is a direct match on `char`, in the
//! idiom of a scanner meant to be paired with a recursive-descent parser.

use crate::error::LexError;
use crate::verbosity::Verbosity;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TokenKind {
    // keywords
    Module,
    Class,
    Extends,
    Begin,
    End,
    Var,
    Procedure,
    Function,
    If,
    Then,
    Else,
    While,
    Do,
    Return,
    Write,
    WriteLn,
    New,
    True,
    False,
    KwInteger,
    KwString,
    KwVoid,
    // literals/identifiers
    Ident,
    IntLit,
    StringLit,
    // operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Eq,
    Neq,
    Lt,
    Leq,
    Gt,
    Geq,
    AndAnd,
    OrOr,
    Bang,
    Assign,
    Dot,
    // punctuation
    Comma,
    Colon,
    Semi,
    LParen,
    RParen,
    Eof,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub line: u32,
}

fn keyword(text: &str) -> Option<TokenKind> {
    Some(match text {
        "module" => TokenKind::Module,
        "class" => TokenKind::Class,
        "extends" => TokenKind::Extends,
        "begin" => TokenKind::Begin,
        "end" => TokenKind::End,
        "var" => TokenKind::Var,
        "procedure" => TokenKind::Procedure,
        "function" => TokenKind::Function,
        "if" => TokenKind::If,
        "then" => TokenKind::Then,
        "else" => TokenKind::Else,
        "while" => TokenKind::While,
        "do" => TokenKind::Do,
        "return" => TokenKind::Return,
        "write" => TokenKind::Write,
        "writeln" => TokenKind::WriteLn,
        "new" => TokenKind::New,
        "true" => TokenKind::True,
        "false" => TokenKind::False,
        "integer" => TokenKind::KwInteger,
        "string" => TokenKind::KwString,
        "void" => TokenKind::KwVoid,
        _ => return None,
    })
}

pub struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: u32,
    verbosity: Verbosity,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str, verbosity: Verbosity) -> Lexer<'a> {
        Lexer {
            chars: source.chars().peekable(),
            line: 1,
            verbosity,
        }
    }

    pub fn tokenize(source: &'a str, verbosity: Verbosity) -> Result<Vec<Token>, LexError> {
        let _span = tracing::debug_span!("lex").entered();
        let mut lexer = Lexer::new(source, verbosity);
        let mut tokens = Vec::new();
        loop {
            let tok = lexer.next_token()?;
            if lexer.verbosity.is_trace() {
                tracing::trace!(kind = ?tok.kind, line = tok.line, "token");
            }
            let done = tok.kind == TokenKind::Eof;
            tokens.push(tok);
            if done {
                break;
            }
        }
        if verbosity.is_debug() {
            tracing::debug!(tokens = tokens.len(), "lexed");
        }
        Ok(tokens)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next();
        if c == Some('\n') {
            self.line += 1;
        }
        c
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('/') => {
                    let mut clone = self.chars.clone();
                    clone.next();
                    if clone.peek() == Some(&'/') {
                        while !matches!(self.peek(), None | Some('\n')) {
                            self.bump();
                        }
                    } else {
                        break;
                    }
                }
                _ => break,
            }
        }
    }

    fn next_token(&mut self) -> Result<Token, LexError> {
        self.skip_trivia();
        let line = self.line;
        let Some(c) = self.peek() else {
            return Ok(Token {
                kind: TokenKind::Eof,
                text: String::new(),
                line,
            });
        };

        if c.is_ascii_digit() {
            return Ok(self.scan_int(line));
        }
        if c.is_alphabetic() || c == '_' {
            return Ok(self.scan_ident_or_keyword(line));
        }
        if c == '"' {
            return self.scan_string(line);
        }

        self.bump();
        let (kind, extra) = match c {
            '+' => (TokenKind::Plus, None),
            '-' => (TokenKind::Minus, None),
            '*' => (TokenKind::Star, None),
            '/' => (TokenKind::Slash, None),
            '%' => (TokenKind::Percent, None),
            '.' => (TokenKind::Dot, None),
            ',' => (TokenKind::Comma, None),
            ':' => {
                if self.peek() == Some('=') {
                    self.bump();
                    (TokenKind::Assign, Some(":="))
                } else {
                    (TokenKind::Colon, None)
                }
            }
            ';' => (TokenKind::Semi, None),
            '(' => (TokenKind::LParen, None),
            ')' => (TokenKind::RParen, None),
            '=' => (TokenKind::Eq, None),
            '<' => {
                if self.peek() == Some('>') {
                    self.bump();
                    (TokenKind::Neq, Some("<>"))
                } else if self.peek() == Some('=') {
                    self.bump();
                    (TokenKind::Leq, Some("<="))
                } else {
                    (TokenKind::Lt, None)
                }
            }
            '>' => {
                if self.peek() == Some('=') {
                    self.bump();
                    (TokenKind::Geq, Some(">="))
                } else {
                    (TokenKind::Gt, None)
                }
            }
            '&' if self.peek() == Some('&') => {
                self.bump();
                (TokenKind::AndAnd, Some("&&"))
            }
            '|' if self.peek() == Some('|') => {
                self.bump();
                (TokenKind::OrOr, Some("||"))
            }
            '!' => (TokenKind::Bang, None),
            other => return Err(LexError::UnrecognizedChar { ch: other, line }),
        };
        let text = extra.map(str::to_string).unwrap_or_else(|| c.to_string());
        Ok(Token { kind, text, line })
    }

    fn scan_int(&mut self, line: u32) -> Token {
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        Token {
            kind: TokenKind::IntLit,
            text,
            line,
        }
    }

    fn scan_ident_or_keyword(&mut self, line: u32) -> Token {
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        let kind = keyword(&text).unwrap_or(TokenKind::Ident);
        Token { kind, text, line }
    }

    fn scan_string(&mut self, line: u32) -> Result<Token, LexError> {
        self.bump(); // opening quote
        let mut text = String::new();
        loop {
            match self.bump() {
                Some('"') => break,
                Some('\\') => match self.bump() {
                    Some('n') => text.push('\n'),
                    Some('t') => text.push('\t'),
                    Some('"') => text.push('"'),
                    Some('\\') => text.push('\\'),
                    Some(other) => text.push(other),
                    None => return Err(LexError::UnterminatedString { line }),
                },
                Some(c) => text.push(c),
                None => return Err(LexError::UnterminatedString { line }),
            }
        }
        Ok(Token {
            kind: TokenKind::StringLit,
            text,
            line,
        })
    }
}
