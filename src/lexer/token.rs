// Veld Tokens

/// Token kinds produced by the scanner.
///
/// Literal kinds carry their decoded payload so the compiler never has to
/// re-parse lexemes. Malformed input becomes an `Error` token; the scanner
/// itself never fails.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Single character tokens
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    LeftBracket,
    RightBracket,
    Comma,
    Dot,
    Semicolon,
    Colon,
    Question,
    Tilde,

    // One or two character operators
    Plus,
    PlusEqual,
    Minus,
    MinusEqual,
    Star,
    StarEqual,
    StarStar,
    Slash,
    SlashEqual,
    Percent,
    PercentEqual,
    Bang,
    BangEqual,
    Equal,
    EqualEqual,
    Less,
    LessEqual,
    LessLess,
    Greater,
    GreaterEqual,
    GreaterGreater,
    Ampersand,
    AmpersandAmpersand,
    Pipe,
    PipePipe,
    Caret,
    QuestionQuestion,
    QuestionDot,
    Ellipsis,

    // Literals
    Identifier,
    String(String),
    Number(f64),

    // Keywords
    Abstract,
    As,
    Break,
    Case,
    Class,
    Const,
    Continue,
    Default,
    Else,
    False,
    For,
    Fun,
    If,
    Import,
    Nil,
    Private,
    Return,
    Static,
    Super,
    Switch,
    This,
    Trait,
    True,
    Use,
    Var,
    While,
    With,

    /// Malformed input; the payload is the error message.
    Error(String),
    Eof,
}

/// A single scanned token: kind, raw lexeme, source line.
#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub lexeme: String,
    pub line: usize,
}

impl Token {
    pub fn new(kind: TokenKind, lexeme: impl Into<String>, line: usize) -> Self {
        Self {
            kind,
            lexeme: lexeme.into(),
            line,
        }
    }

    /// Placeholder token used to seed the compiler before the first advance.
    pub fn empty() -> Self {
        Self {
            kind: TokenKind::Eof,
            lexeme: String::new(),
            line: 0,
        }
    }
}
