//! Tokenizer for the transform dialect.
//!
//! Indentation-sensitive: emits INDENT/DEDENT pairs the way Python's
//! tokenizer does, suppresses newlines inside brackets, strips `#`
//! comments, and folds blank lines away entirely.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Int(i64),
    Float(f64),
    Str(String),
    Name(String),

    Def,
    Return,
    If,
    Elif,
    Else,
    While,
    For,
    In,
    Not,
    And,
    Or,
    True,
    False,
    NoneKw,
    Import,
    From,
    As,
    Pass,
    Break,
    Continue,

    Plus,
    Minus,
    Star,
    Slash,
    DoubleSlash,
    Percent,
    DoubleStar,
    EqEq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Assign,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    DoubleSlashAssign,
    PercentAssign,
    DoubleStarAssign,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Dot,
    Semicolon,

    Newline,
    Indent,
    Dedent,
    Eof,
}

impl fmt::Display for Tok {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tok::Int(v) => write!(f, "{v}"),
            Tok::Float(v) => write!(f, "{v}"),
            Tok::Str(_) => write!(f, "string literal"),
            Tok::Name(name) => write!(f, "'{name}'"),
            Tok::Newline => write!(f, "end of line"),
            Tok::Indent => write!(f, "indent"),
            Tok::Dedent => write!(f, "dedent"),
            Tok::Eof => write!(f, "end of input"),
            other => write!(f, "'{}'", other.text()),
        }
    }
}

impl Tok {
    fn text(&self) -> &'static str {
        match self {
            Tok::Def => "def",
            Tok::Return => "return",
            Tok::If => "if",
            Tok::Elif => "elif",
            Tok::Else => "else",
            Tok::While => "while",
            Tok::For => "for",
            Tok::In => "in",
            Tok::Not => "not",
            Tok::And => "and",
            Tok::Or => "or",
            Tok::True => "True",
            Tok::False => "False",
            Tok::NoneKw => "None",
            Tok::Import => "import",
            Tok::From => "from",
            Tok::As => "as",
            Tok::Pass => "pass",
            Tok::Break => "break",
            Tok::Continue => "continue",
            Tok::Plus => "+",
            Tok::Minus => "-",
            Tok::Star => "*",
            Tok::Slash => "/",
            Tok::DoubleSlash => "//",
            Tok::Percent => "%",
            Tok::DoubleStar => "**",
            Tok::EqEq => "==",
            Tok::NotEq => "!=",
            Tok::Lt => "<",
            Tok::LtEq => "<=",
            Tok::Gt => ">",
            Tok::GtEq => ">=",
            Tok::Assign => "=",
            Tok::PlusAssign => "+=",
            Tok::MinusAssign => "-=",
            Tok::StarAssign => "*=",
            Tok::SlashAssign => "/=",
            Tok::DoubleSlashAssign => "//=",
            Tok::PercentAssign => "%=",
            Tok::DoubleStarAssign => "**=",
            Tok::LParen => "(",
            Tok::RParen => ")",
            Tok::LBracket => "[",
            Tok::RBracket => "]",
            Tok::LBrace => "{",
            Tok::RBrace => "}",
            Tok::Comma => ",",
            Tok::Colon => ":",
            Tok::Dot => ".",
            Tok::Semicolon => ";",
            _ => "",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpannedTok {
    pub tok: Tok,
    pub line: usize,
}

#[derive(Debug, Clone)]
pub struct LexError {
    pub line: usize,
    pub message: String,
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    depth: usize,
    indents: Vec<usize>,
    tokens: Vec<SpannedTok>,
    at_line_start: bool,
}

pub fn tokenize(source: &str) -> Result<Vec<SpannedTok>, LexError> {
    let mut lexer = Lexer {
        chars: source.chars().collect(),
        pos: 0,
        line: 1,
        depth: 0,
        indents: vec![0],
        tokens: Vec::new(),
        at_line_start: true,
    };
    lexer.run()?;
    Ok(lexer.tokens)
}

impl Lexer {
    fn run(&mut self) -> Result<(), LexError> {
        loop {
            if self.at_line_start && self.depth == 0 {
                if !self.handle_line_start()? {
                    break;
                }
                self.at_line_start = false;
            }

            self.skip_inline_space();
            let Some(c) = self.peek() else { break };

            if c == '#' {
                while let Some(c) = self.peek() {
                    if c == '\n' {
                        break;
                    }
                    self.pos += 1;
                }
                continue;
            }

            if c == '\n' {
                self.pos += 1;
                self.line += 1;
                if self.depth == 0 {
                    self.push(Tok::Newline);
                    self.at_line_start = true;
                }
                continue;
            }

            self.lex_token(c)?;
        }

        if matches!(
            self.tokens.last(),
            Some(SpannedTok { tok, .. }) if *tok != Tok::Newline
        ) {
            self.push(Tok::Newline);
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(Tok::Dedent);
        }
        self.push(Tok::Eof);
        Ok(())
    }

    /// Measure indentation, skipping blank and comment-only lines.
    /// Returns false at end of input.
    fn handle_line_start(&mut self) -> Result<bool, LexError> {
        loop {
            let mut width = 0usize;
            loop {
                match self.peek() {
                    Some(' ') => {
                        width += 1;
                        self.pos += 1;
                    }
                    Some('\t') => {
                        // a tab advances to the next multiple of four
                        width += 4 - (width % 4);
                        self.pos += 1;
                    }
                    _ => break,
                }
            }

            match self.peek() {
                None => return Ok(false),
                Some('\n') => {
                    self.pos += 1;
                    self.line += 1;
                    continue;
                }
                Some('#') => {
                    while let Some(c) = self.peek() {
                        self.pos += 1;
                        if c == '\n' {
                            self.line += 1;
                            break;
                        }
                    }
                    if self.peek().is_none() {
                        return Ok(false);
                    }
                    continue;
                }
                Some(_) => {
                    self.apply_indent(width)?;
                    return Ok(true);
                }
            }
        }
    }

    fn apply_indent(&mut self, width: usize) -> Result<(), LexError> {
        let current = *self.indents.last().unwrap_or(&0);
        if width > current {
            self.indents.push(width);
            self.push(Tok::Indent);
        } else if width < current {
            while *self.indents.last().unwrap_or(&0) > width {
                self.indents.pop();
                self.push(Tok::Dedent);
            }
            if *self.indents.last().unwrap_or(&0) != width {
                return Err(self.error("inconsistent indentation"));
            }
        }
        Ok(())
    }

    fn lex_token(&mut self, c: char) -> Result<(), LexError> {
        if c.is_ascii_alphabetic() || c == '_' {
            return self.lex_name();
        }
        if c.is_ascii_digit() {
            return self.lex_number();
        }
        if c == '"' || c == '\'' {
            return self.lex_string(c);
        }

        self.pos += 1;
        let tok = match c {
            '+' => self.with_assign(Tok::Plus, Tok::PlusAssign),
            '-' => self.with_assign(Tok::Minus, Tok::MinusAssign),
            '*' => {
                if self.eat('*') {
                    self.with_assign(Tok::DoubleStar, Tok::DoubleStarAssign)
                } else {
                    self.with_assign(Tok::Star, Tok::StarAssign)
                }
            }
            '/' => {
                if self.eat('/') {
                    self.with_assign(Tok::DoubleSlash, Tok::DoubleSlashAssign)
                } else {
                    self.with_assign(Tok::Slash, Tok::SlashAssign)
                }
            }
            '%' => self.with_assign(Tok::Percent, Tok::PercentAssign),
            '=' => {
                if self.eat('=') {
                    Tok::EqEq
                } else {
                    Tok::Assign
                }
            }
            '!' => {
                if self.eat('=') {
                    Tok::NotEq
                } else {
                    return Err(self.error("unexpected character '!'"));
                }
            }
            '<' => {
                if self.eat('=') {
                    Tok::LtEq
                } else {
                    Tok::Lt
                }
            }
            '>' => {
                if self.eat('=') {
                    Tok::GtEq
                } else {
                    Tok::Gt
                }
            }
            '(' => {
                self.depth += 1;
                Tok::LParen
            }
            ')' => {
                self.depth = self.depth.saturating_sub(1);
                Tok::RParen
            }
            '[' => {
                self.depth += 1;
                Tok::LBracket
            }
            ']' => {
                self.depth = self.depth.saturating_sub(1);
                Tok::RBracket
            }
            '{' => {
                self.depth += 1;
                Tok::LBrace
            }
            '}' => {
                self.depth = self.depth.saturating_sub(1);
                Tok::RBrace
            }
            ',' => Tok::Comma,
            ':' => Tok::Colon,
            '.' => Tok::Dot,
            ';' => Tok::Semicolon,
            other => return Err(self.error(&format!("unexpected character '{other}'"))),
        };
        self.push(tok);
        Ok(())
    }

    fn lex_name(&mut self) -> Result<(), LexError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        let tok = match text.as_str() {
            "def" => Tok::Def,
            "return" => Tok::Return,
            "if" => Tok::If,
            "elif" => Tok::Elif,
            "else" => Tok::Else,
            "while" => Tok::While,
            "for" => Tok::For,
            "in" => Tok::In,
            "not" => Tok::Not,
            "and" => Tok::And,
            "or" => Tok::Or,
            "True" => Tok::True,
            "False" => Tok::False,
            "None" => Tok::NoneKw,
            "import" => Tok::Import,
            "from" => Tok::From,
            "as" => Tok::As,
            "pass" => Tok::Pass,
            "break" => Tok::Break,
            "continue" => Tok::Continue,
            _ => Tok::Name(text),
        };
        self.push(tok);
        Ok(())
    }

    fn lex_number(&mut self) -> Result<(), LexError> {
        let start = self.pos;
        let mut is_float = false;

        while let Some(c) = self.peek() {
            match c {
                '0'..='9' | '_' => self.pos += 1,
                '.' if !is_float => {
                    is_float = true;
                    self.pos += 1;
                }
                'e' | 'E' => {
                    is_float = true;
                    self.pos += 1;
                    if matches!(self.peek(), Some('+') | Some('-')) {
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }

        let text: String = self.chars[start..self.pos]
            .iter()
            .filter(|c| **c != '_')
            .collect();
        if is_float {
            let value = text
                .parse::<f64>()
                .map_err(|_| self.error(&format!("invalid number literal '{text}'")))?;
            self.push(Tok::Float(value));
        } else {
            let value = text
                .parse::<i64>()
                .map_err(|_| self.error(&format!("invalid integer literal '{text}'")))?;
            self.push(Tok::Int(value));
        }
        Ok(())
    }

    fn lex_string(&mut self, quote: char) -> Result<(), LexError> {
        self.pos += 1;
        let mut value = String::new();
        loop {
            let Some(c) = self.peek() else {
                return Err(self.error("unterminated string literal"));
            };
            self.pos += 1;
            if c == quote {
                break;
            }
            match c {
                '\n' => return Err(self.error("unterminated string literal")),
                '\\' => {
                    let Some(escaped) = self.peek() else {
                        return Err(self.error("unterminated string literal"));
                    };
                    self.pos += 1;
                    match escaped {
                        'n' => value.push('\n'),
                        't' => value.push('\t'),
                        'r' => value.push('\r'),
                        '\\' => value.push('\\'),
                        '\'' => value.push('\''),
                        '"' => value.push('"'),
                        other => {
                            return Err(
                                self.error(&format!("unsupported escape sequence '\\{other}'"))
                            )
                        }
                    }
                }
                other => value.push(other),
            }
        }
        self.push(Tok::Str(value));
        Ok(())
    }

    fn with_assign(&mut self, plain: Tok, combined: Tok) -> Tok {
        if self.eat('=') {
            combined
        } else {
            plain
        }
    }

    fn skip_inline_space(&mut self) {
        while matches!(self.peek(), Some(' ') | Some('\t') | Some('\r')) {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn push(&mut self, tok: Tok) {
        self.tokens.push(SpannedTok {
            tok,
            line: self.line,
        });
    }

    fn error(&self, message: &str) -> LexError {
        LexError {
            line: self.line,
            message: message.to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(source: &str) -> Vec<Tok> {
        tokenize(source)
            .unwrap()
            .into_iter()
            .map(|spanned| spanned.tok)
            .collect()
    }

    #[test]
    fn test_simple_assignment() {
        assert_eq!(
            toks("x = 1"),
            vec![
                Tok::Name("x".into()),
                Tok::Assign,
                Tok::Int(1),
                Tok::Newline,
                Tok::Eof
            ]
        );
    }

    #[test]
    fn test_indentation_emits_indent_dedent() {
        let tokens = toks("if x:\n    y = 1\nz = 2\n");
        assert!(tokens.contains(&Tok::Indent));
        assert!(tokens.contains(&Tok::Dedent));
        let indent_pos = tokens.iter().position(|t| *t == Tok::Indent).unwrap();
        let dedent_pos = tokens.iter().position(|t| *t == Tok::Dedent).unwrap();
        assert!(indent_pos < dedent_pos);
    }

    #[test]
    fn test_blank_and_comment_lines_are_skipped() {
        let tokens = toks("x = 1\n\n# comment only\n    \ny = 2\n");
        let newlines = tokens.iter().filter(|t| **t == Tok::Newline).count();
        assert_eq!(newlines, 2);
    }

    #[test]
    fn test_newline_suppressed_inside_brackets() {
        let tokens = toks("x = [1,\n     2]\n");
        let newlines = tokens.iter().filter(|t| **t == Tok::Newline).count();
        assert_eq!(newlines, 1);
    }

    #[test]
    fn test_dangling_dedents_close_at_eof() {
        let tokens = toks("def f():\n    return 1");
        assert_eq!(
            tokens.iter().filter(|t| **t == Tok::Dedent).count(),
            tokens.iter().filter(|t| **t == Tok::Indent).count()
        );
        assert_eq!(tokens.last(), Some(&Tok::Eof));
    }

    #[test]
    fn test_operators_and_compounds() {
        assert_eq!(
            toks("a //= 1"),
            vec![
                Tok::Name("a".into()),
                Tok::DoubleSlashAssign,
                Tok::Int(1),
                Tok::Newline,
                Tok::Eof
            ]
        );
        assert_eq!(toks("x **= 2")[1], Tok::DoubleStarAssign);
        assert_eq!(toks("n %= 3")[1], Tok::PercentAssign);
        assert!(toks("a ** b != c").contains(&Tok::DoubleStar));
        assert!(toks("a % b").contains(&Tok::Percent));
        assert!(toks("a <= b >= c").contains(&Tok::LtEq));
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            toks(r#"s = "a\nb""#)[2],
            Tok::Str("a\nb".into())
        );
    }

    #[test]
    fn test_number_literals() {
        assert_eq!(toks("10_000")[0], Tok::Int(10_000));
        assert_eq!(toks("1.5")[0], Tok::Float(1.5));
        assert_eq!(toks("2e3")[0], Tok::Float(2000.0));
    }

    #[test]
    fn test_unterminated_string_is_an_error() {
        assert!(tokenize("s = 'oops\n").is_err());
    }

    #[test]
    fn test_inconsistent_indentation_is_an_error() {
        assert!(tokenize("if x:\n        y = 1\n    z = 2\n").is_err());
    }
}
