// Veld Scanner (Lexer)
// Pull-based tokenizer: the compiler asks for one token at a time and can
// checkpoint/restore the stream to disambiguate statements.

use crate::lexer::token::{Token, TokenKind};

/// Saved scanner position, restorable with `Scanner::restore`.
#[derive(Debug, Clone, Copy)]
pub struct Checkpoint {
    current: usize,
    line: usize,
}

/// Scanner that tokenizes Veld source code on demand.
pub struct Scanner {
    source: Vec<char>,
    start: usize,
    current: usize,
    line: usize,
}

impl Scanner {
    pub fn new(source: &str) -> Self {
        Self {
            source: source.chars().collect(),
            start: 0,
            current: 0,
            line: 1,
        }
    }

    /// Save the current stream position.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            current: self.current,
            line: self.line,
        }
    }

    /// Rewind to a previously saved position.
    pub fn restore(&mut self, checkpoint: Checkpoint) {
        self.current = checkpoint.current;
        self.line = checkpoint.line;
    }

    /// Scan the next token. Never fails; malformed input produces an
    /// `Error` token that the compiler reports.
    pub fn scan_token(&mut self) -> Token {
        self.skip_whitespace();
        self.start = self.current;

        if self.is_at_end() {
            return self.make_token(TokenKind::Eof);
        }

        let c = self.advance();

        match c {
            '(' => self.make_token(TokenKind::LeftParen),
            ')' => self.make_token(TokenKind::RightParen),
            '{' => self.make_token(TokenKind::LeftBrace),
            '}' => self.make_token(TokenKind::RightBrace),
            '[' => self.make_token(TokenKind::LeftBracket),
            ']' => self.make_token(TokenKind::RightBracket),
            ',' => self.make_token(TokenKind::Comma),
            ';' => self.make_token(TokenKind::Semicolon),
            ':' => self.make_token(TokenKind::Colon),
            '~' => self.make_token(TokenKind::Tilde),
            '^' => self.make_token(TokenKind::Caret),
            '.' => {
                if self.match_char('.') {
                    if self.match_char('.') {
                        self.make_token(TokenKind::Ellipsis)
                    } else {
                        self.error_token("Unexpected '..'")
                    }
                } else {
                    self.make_token(TokenKind::Dot)
                }
            }
            '?' => {
                if self.match_char('?') {
                    self.make_token(TokenKind::QuestionQuestion)
                } else if self.match_char('.') {
                    self.make_token(TokenKind::QuestionDot)
                } else {
                    self.make_token(TokenKind::Question)
                }
            }
            '+' => {
                if self.match_char('=') {
                    self.make_token(TokenKind::PlusEqual)
                } else {
                    self.make_token(TokenKind::Plus)
                }
            }
            '-' => {
                if self.match_char('=') {
                    self.make_token(TokenKind::MinusEqual)
                } else {
                    self.make_token(TokenKind::Minus)
                }
            }
            '*' => {
                if self.match_char('*') {
                    self.make_token(TokenKind::StarStar)
                } else if self.match_char('=') {
                    self.make_token(TokenKind::StarEqual)
                } else {
                    self.make_token(TokenKind::Star)
                }
            }
            '/' => {
                if self.match_char('=') {
                    self.make_token(TokenKind::SlashEqual)
                } else {
                    self.make_token(TokenKind::Slash)
                }
            }
            '%' => {
                if self.match_char('=') {
                    self.make_token(TokenKind::PercentEqual)
                } else {
                    self.make_token(TokenKind::Percent)
                }
            }
            '!' => {
                if self.match_char('=') {
                    self.make_token(TokenKind::BangEqual)
                } else {
                    self.make_token(TokenKind::Bang)
                }
            }
            '=' => {
                if self.match_char('=') {
                    self.make_token(TokenKind::EqualEqual)
                } else {
                    self.make_token(TokenKind::Equal)
                }
            }
            '<' => {
                if self.match_char('=') {
                    self.make_token(TokenKind::LessEqual)
                } else if self.match_char('<') {
                    self.make_token(TokenKind::LessLess)
                } else {
                    self.make_token(TokenKind::Less)
                }
            }
            '>' => {
                if self.match_char('=') {
                    self.make_token(TokenKind::GreaterEqual)
                } else if self.match_char('>') {
                    self.make_token(TokenKind::GreaterGreater)
                } else {
                    self.make_token(TokenKind::Greater)
                }
            }
            '&' => {
                if self.match_char('&') {
                    self.make_token(TokenKind::AmpersandAmpersand)
                } else {
                    self.make_token(TokenKind::Ampersand)
                }
            }
            '|' => {
                if self.match_char('|') {
                    self.make_token(TokenKind::PipePipe)
                } else {
                    self.make_token(TokenKind::Pipe)
                }
            }
            '"' | '\'' => self.string(c),
            c if c.is_ascii_digit() => self.number(),
            c if c.is_alphabetic() || c == '_' => {
                // Raw string prefix: r"..." or r'...' (no escape processing)
                if c == 'r' && (self.peek() == '"' || self.peek() == '\'') {
                    let quote = self.advance();
                    self.raw_string(quote)
                } else {
                    self.identifier()
                }
            }
            _ => self.error_token(&format!("Unexpected character '{}'", c)),
        }
    }

    fn skip_whitespace(&mut self) {
        loop {
            match self.peek() {
                ' ' | '\r' | '\t' => {
                    self.advance();
                }
                '\n' => {
                    self.line += 1;
                    self.advance();
                }
                '/' => {
                    if self.peek_next() == '/' {
                        while self.peek() != '\n' && !self.is_at_end() {
                            self.advance();
                        }
                    } else if self.peek_next() == '*' {
                        self.advance();
                        self.advance();
                        self.block_comment();
                    } else {
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    /// Block comments nest.
    fn block_comment(&mut self) {
        let mut depth = 1;
        while depth > 0 && !self.is_at_end() {
            if self.peek() == '/' && self.peek_next() == '*' {
                self.advance();
                self.advance();
                depth += 1;
            } else if self.peek() == '*' && self.peek_next() == '/' {
                self.advance();
                self.advance();
                depth -= 1;
            } else {
                if self.peek() == '\n' {
                    self.line += 1;
                }
                self.advance();
            }
        }
        // An unterminated comment just runs to EOF; the compiler reports
        // the resulting unexpected-EOF at the next token instead.
    }

    fn string(&mut self, quote: char) -> Token {
        let mut value = String::new();

        while self.peek() != quote && !self.is_at_end() {
            let c = self.peek();
            if c == '\n' {
                return self.error_token("Unterminated string");
            }
            if c == '\\' {
                self.advance();
                match self.escape_char() {
                    Ok(decoded) => value.push(decoded),
                    Err(message) => return self.error_token(&message),
                }
            } else {
                value.push(self.advance());
            }
        }

        if self.is_at_end() {
            return self.error_token("Unterminated string");
        }

        self.advance(); // closing quote
        self.make_token(TokenKind::String(value))
    }

    /// Raw string: everything up to the matching quote, no escapes.
    fn raw_string(&mut self, quote: char) -> Token {
        let mut value = String::new();
        while self.peek() != quote && !self.is_at_end() {
            if self.peek() == '\n' {
                self.line += 1;
            }
            value.push(self.advance());
        }
        if self.is_at_end() {
            return self.error_token("Unterminated raw string");
        }
        self.advance();
        self.make_token(TokenKind::String(value))
    }

    fn escape_char(&mut self) -> Result<char, String> {
        if self.is_at_end() {
            return Err("Unexpected end of input after '\\'".to_string());
        }
        let c = self.advance();
        match c {
            'n' => Ok('\n'),
            't' => Ok('\t'),
            'r' => Ok('\r'),
            '0' => Ok('\0'),
            '\\' => Ok('\\'),
            '"' => Ok('"'),
            '\'' => Ok('\''),
            'x' => {
                let mut hex = String::new();
                for _ in 0..2 {
                    if !self.peek().is_ascii_hexdigit() {
                        return Err("Invalid hex escape: expected two hex digits".to_string());
                    }
                    hex.push(self.advance());
                }
                u8::from_str_radix(&hex, 16)
                    .map(|b| b as char)
                    .map_err(|_| format!("Invalid hex escape '\\x{}'", hex))
            }
            _ => Err(format!("Invalid escape sequence '\\{}'", c)),
        }
    }

    fn number(&mut self) -> Token {
        // Hex literal: 0xFF, with optional '_' separators.
        if self.source[self.start] == '0' && (self.peek() == 'x' || self.peek() == 'X') {
            self.advance();
            while self.peek().is_ascii_hexdigit() || self.peek() == '_' {
                self.advance();
            }
            let lexeme: String = self.source[self.start + 2..self.current]
                .iter()
                .filter(|&&c| c != '_')
                .collect();
            return match u64::from_str_radix(&lexeme, 16) {
                Ok(value) => self.make_token(TokenKind::Number(value as f64)),
                Err(_) => self.error_token("Invalid hex literal"),
            };
        }

        while self.peek().is_ascii_digit() || self.peek() == '_' {
            self.advance();
        }

        if self.peek() == '.' && self.peek_next().is_ascii_digit() {
            self.advance();
            while self.peek().is_ascii_digit() || self.peek() == '_' {
                self.advance();
            }
        }

        // Exponent: 1e9, 2.5e-3
        if self.peek() == 'e' || self.peek() == 'E' {
            let next = self.peek_next();
            if next.is_ascii_digit() || next == '+' || next == '-' {
                self.advance();
                self.advance();
                while self.peek().is_ascii_digit() {
                    self.advance();
                }
            }
        }

        let lexeme: String = self.source[self.start..self.current]
            .iter()
            .filter(|&&c| c != '_')
            .collect();
        match lexeme.parse::<f64>() {
            Ok(value) => self.make_token(TokenKind::Number(value)),
            Err(_) => self.error_token(&format!("Invalid number '{}'", lexeme)),
        }
    }

    fn identifier(&mut self) -> Token {
        while self.peek().is_alphanumeric() || self.peek() == '_' {
            self.advance();
        }
        let text: String = self.source[self.start..self.current].iter().collect();
        let kind = Self::keyword_or_identifier(&text);
        self.make_token(kind)
    }

    fn keyword_or_identifier(text: &str) -> TokenKind {
        match text {
            "abstract" => TokenKind::Abstract,
            "as" => TokenKind::As,
            "break" => TokenKind::Break,
            "case" => TokenKind::Case,
            "class" => TokenKind::Class,
            "const" => TokenKind::Const,
            "continue" => TokenKind::Continue,
            "default" => TokenKind::Default,
            "else" => TokenKind::Else,
            "false" => TokenKind::False,
            "for" => TokenKind::For,
            "fun" => TokenKind::Fun,
            "if" => TokenKind::If,
            "import" => TokenKind::Import,
            "nil" => TokenKind::Nil,
            "private" => TokenKind::Private,
            "return" => TokenKind::Return,
            "static" => TokenKind::Static,
            "super" => TokenKind::Super,
            "switch" => TokenKind::Switch,
            "this" => TokenKind::This,
            "trait" => TokenKind::Trait,
            "true" => TokenKind::True,
            "use" => TokenKind::Use,
            "var" => TokenKind::Var,
            "while" => TokenKind::While,
            "with" => TokenKind::With,
            _ => TokenKind::Identifier,
        }
    }

    // Helpers

    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn advance(&mut self) -> char {
        let c = self.source[self.current];
        self.current += 1;
        c
    }

    fn peek(&self) -> char {
        if self.is_at_end() {
            '\0'
        } else {
            self.source[self.current]
        }
    }

    fn peek_next(&self) -> char {
        if self.current + 1 >= self.source.len() {
            '\0'
        } else {
            self.source[self.current + 1]
        }
    }

    fn match_char(&mut self, expected: char) -> bool {
        if self.is_at_end() || self.source[self.current] != expected {
            false
        } else {
            self.current += 1;
            true
        }
    }

    fn make_token(&self, kind: TokenKind) -> Token {
        let lexeme: String = self.source[self.start..self.current].iter().collect();
        Token::new(kind, lexeme, self.line)
    }

    fn error_token(&self, message: &str) -> Token {
        Token::new(
            TokenKind::Error(message.to_string()),
            self.source[self.start..self.current]
                .iter()
                .collect::<String>(),
            self.line,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let mut scanner = Scanner::new(source);
        let mut out = Vec::new();
        loop {
            let token = scanner.scan_token();
            let done = token.kind == TokenKind::Eof;
            out.push(token.kind);
            if done {
                break;
            }
        }
        out
    }

    #[test]
    fn scans_operators_and_keywords() {
        assert_eq!(
            kinds("var x = 1 + 2;"),
            vec![
                TokenKind::Var,
                TokenKind::Identifier,
                TokenKind::Equal,
                TokenKind::Number(1.0),
                TokenKind::Plus,
                TokenKind::Number(2.0),
                TokenKind::Semicolon,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn scans_numeric_forms() {
        assert_eq!(kinds("0xFF")[0], TokenKind::Number(255.0));
        assert_eq!(kinds("1_000_000")[0], TokenKind::Number(1_000_000.0));
        assert_eq!(kinds("2.5e2")[0], TokenKind::Number(250.0));
    }

    #[test]
    fn string_escapes_are_decoded() {
        assert_eq!(
            kinds("\"a\\nb\"")[0],
            TokenKind::String("a\nb".to_string())
        );
        assert_eq!(
            kinds("r\"a\\nb\"")[0],
            TokenKind::String("a\\nb".to_string())
        );
    }

    #[test]
    fn malformed_input_yields_error_token() {
        let mut scanner = Scanner::new("\"unterminated");
        let token = scanner.scan_token();
        assert!(matches!(token.kind, TokenKind::Error(_)));

        let mut scanner = Scanner::new("@");
        let token = scanner.scan_token();
        assert!(matches!(token.kind, TokenKind::Error(_)));
    }

    #[test]
    fn nested_block_comments() {
        assert_eq!(
            kinds("/* outer /* inner */ still */ 1"),
            vec![TokenKind::Number(1.0), TokenKind::Eof]
        );
    }

    #[test]
    fn checkpoint_restores_the_stream() {
        let mut scanner = Scanner::new("a b c");
        let _ = scanner.scan_token();
        let mark = scanner.checkpoint();
        let b1 = scanner.scan_token();
        let _ = scanner.scan_token();
        scanner.restore(mark);
        let b2 = scanner.scan_token();
        assert_eq!(b1.lexeme, b2.lexeme);
    }
}
