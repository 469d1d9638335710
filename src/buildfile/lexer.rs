//! Lexer for Buildfiles
//!
//! The lexer is mode-driven: the parser pushes and pops modes as it
//! descends into syntactic contexts (variable expansion, eval
//! parentheses, attributes, switch expressions, recipe bodies) and each
//! mode decides which characters are special. Tokens carry quoting
//! information and a separation flag (whether whitespace preceded the
//! token) which name concatenation relies on.

use std::collections::HashMap;

use lazy_static::lazy_static;

/// Token types for the buildfile lexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenType {
    Eos,
    Newline,

    Word,

    // Punctuation
    Colon,       // :
    Comma,       // ,
    Dollar,      // $
    LParen,      // (
    RParen,      // )
    LBrace,      // {
    RBrace,      // }
    MultiLBrace, // {{...
    MultiRBrace, // }}...
    LSBrace,     // [
    RSBrace,     // ]
    LABrace,     // <
    RABrace,     // >
    Percent,     // %
    Pair,        // @
    Alternative, // | (case patterns)

    // Assignment
    Assign,  // =
    Append,  // +=
    Prepend, // =+

    // Eval-mode operators
    LogAnd,    // &&
    LogOr,     // ||
    Not,       // !
    EqEq,      // ==
    NotEq,     // !=
    LessThan,  // <
    GreaterThan, // >
    LessEq,    // <=
    GreaterEq, // >=
    Quest,     // ?
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eos => "<end of file>",
            Self::Newline => "<newline>",
            Self::Word => "<word>",
            Self::Colon => ":",
            Self::Comma => ",",
            Self::Dollar => "$",
            Self::LParen => "(",
            Self::RParen => ")",
            Self::LBrace => "{",
            Self::RBrace => "}",
            Self::MultiLBrace => "{{",
            Self::MultiRBrace => "}}",
            Self::LSBrace => "[",
            Self::RSBrace => "]",
            Self::LABrace => "<",
            Self::RABrace => ">",
            Self::Percent => "%",
            Self::Pair => "@",
            Self::Alternative => "|",
            Self::Assign => "=",
            Self::Append => "+=",
            Self::Prepend => "=+",
            Self::LogAnd => "&&",
            Self::LogOr => "||",
            Self::Not => "!",
            Self::EqEq => "==",
            Self::NotEq => "!=",
            Self::LessThan => "<",
            Self::GreaterThan => ">",
            Self::LessEq => "<=",
            Self::GreaterEq => ">=",
            Self::Quest => "?",
        }
    }
}

/// How a word token was quoted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuoteType {
    #[default]
    Unquoted,
    Single,
    Double,
    Mixed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub token_type: TokenType,
    pub value: String,
    pub line: u64,
    pub column: u64,
    /// Character offsets into the input (used for raw region capture).
    pub start: usize,
    pub end: usize,
    /// Whitespace (or line start) preceded this token.
    pub separated: bool,
    pub quote: QuoteType,
    /// The first character of the word was inside quotes (disables
    /// pattern interpretation of the whole word).
    pub quote_first: bool,
}

impl Token {
    fn new(token_type: TokenType, value: impl Into<String>, line: u64, column: u64) -> Self {
        Self {
            token_type,
            value: value.into(),
            line,
            column,
            start: 0,
            end: 0,
            separated: false,
            quote: QuoteType::Unquoted,
            quote_first: false,
        }
    }

    /// True for tokens that end a logical line.
    pub fn is_eol(&self) -> bool {
        matches!(self.token_type, TokenType::Newline | TokenType::Eos)
    }
}

/// Lexer error with location.
#[derive(Debug, Clone, thiserror::Error)]
#[error("line {line}: {message}")]
pub struct LexerError {
    pub message: String,
    pub line: u64,
    pub column: u64,
}

impl LexerError {
    fn new(message: impl Into<String>, line: u64, column: u64) -> Self {
        Self {
            message: message.into(),
            line,
            column,
        }
    }
}

/// Lexical modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Start of line: dependency declarations, directives, assignments.
    Normal,
    /// A single variable name after `$`.
    Variable,
    /// Right-hand side of an assignment, until newline.
    Value,
    /// Inside `[...]` attributes.
    Attributes,
    /// Attribute value after `=`.
    AttributeValue,
    /// Inside `(...)`.
    Eval,
    /// Switch expression list: like value plus `:` and `,`.
    SwitchExpressions,
    /// Case pattern list: like value plus `|`.
    CasePatterns,
    /// Inside a value subscript `[...]`.
    Subscript,
    /// Buildspec (operation(target...) lists for the `run` directive).
    Buildspec,
    /// Recipe body: raw text until a line of N closing braces.
    Foreign(usize),
}

lazy_static! {
    /// Characters that always terminate an unquoted word.
    static ref WORD_BREAK: HashMap<char, ()> = {
        let mut m = HashMap::new();
        for c in [' ', '\t', '\n', '#', '"', '\''] {
            m.insert(c, ());
        }
        m
    };
}

/// Specials for a mode (beyond the universal word breaks).
fn specials(mode: Mode) -> &'static [char] {
    match mode {
        Mode::Normal => &[
            ':', ',', '$', '(', ')', '{', '}', '[', ']', '<', '>', '%', '@', '=', '+',
        ],
        Mode::Variable => &['{', '}', '(', ')', '$', '[', ']', ':', ',', '@', '=', '<', '>'],
        Mode::Value => &['$', '(', ')', '{', '}', '[', ']', '@'],
        Mode::Attributes => &[']', ',', '='],
        Mode::AttributeValue => &[']', ',', '$', '(', ')'],
        Mode::Eval => &[
            '(', ')', '$', '{', '}', '[', ']', '@', ':', ',', '!', '=', '<', '>', '&', '|', '?',
        ],
        Mode::SwitchExpressions => &[':', ',', '$', '(', ')', '{', '}', '[', ']', '@'],
        Mode::CasePatterns => &['|', ',', '$', '(', ')', '{', '}', '[', ']', '@'],
        Mode::Subscript => &[']', '$', '('],
        Mode::Buildspec => &['(', ')', '$', '{', '}', '@', ','],
        Mode::Foreign(_) => &[],
    }
}

pub struct Lexer {
    input: Vec<char>,
    pos: usize,
    line: u64,
    column: u64,
    modes: Vec<Mode>,
    /// Inside an open double-quoted sequence interrupted by an
    /// expansion; cleared by the closing quote.
    in_dquote: bool,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        Self {
            input: input.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
            modes: vec![Mode::Normal],
            in_dquote: false,
        }
    }

    pub fn mode(&self) -> Mode {
        *self.modes.last().unwrap()
    }

    pub fn push_mode(&mut self, m: Mode) {
        self.modes.push(m);
    }

    pub fn pop_mode(&mut self) {
        if self.modes.len() > 1 {
            self.modes.pop();
        }
    }

    /// Replace the current mode (expire + push as one step).
    pub fn set_mode(&mut self, m: Mode) {
        self.pop_mode();
        self.push_mode(m);
    }

    fn peek(&self) -> Option<char> {
        self.input.get(self.pos).copied()
    }

    fn peek_at(&self, n: usize) -> Option<char> {
        self.input.get(self.pos + n).copied()
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

    /// Skip spaces, line continuations, and comments. Returns whether
    /// anything was skipped (token separation).
    fn skip_blanks(&mut self) -> bool {
        let mut sep = false;
        loop {
            match self.peek() {
                Some(' ') | Some('\t') => {
                    self.advance();
                    sep = true;
                }
                Some('\\') if self.peek_at(1) == Some('\n') => {
                    self.advance();
                    self.advance();
                    sep = true;
                }
                Some('#') => {
                    // Comment to end of line (the newline itself is a
                    // token).
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                    sep = true;
                }
                _ => return sep,
            }
        }
    }

    /// Lex the next token.
    pub fn next(&mut self) -> Result<Token, LexerError> {
        let start = self.pos;
        let mut t = self.next_inner()?;
        t.start = start;
        t.end = self.pos;
        Ok(t)
    }

    /// The raw input between two character offsets.
    pub fn extract(&self, start: usize, end: usize) -> String {
        self.input[start.min(self.input.len())..end.min(self.input.len())]
            .iter()
            .collect()
    }

    fn next_inner(&mut self) -> Result<Token, LexerError> {
        if let Mode::Foreign(n) = self.mode() {
            return self.next_foreign(n);
        }

        // A variable name is lexed adjacent to its `$`, without blank
        // skipping or quoting.
        if self.mode() == Mode::Variable {
            return self.next_variable_name();
        }

        // Resume an interrupted double-quoted sequence.
        if self.in_dquote {
            return self.next_dquote_fragment();
        }

        let sep = self.skip_blanks();
        let (line, column) = (self.line, self.column);

        let c = match self.peek() {
            None => {
                let mut t = Token::new(TokenType::Eos, "", line, column);
                t.separated = sep;
                return Ok(t);
            }
            Some(c) => c,
        };

        if c == '\n' {
            self.advance();
            let mut t = Token::new(TokenType::Newline, "\n", line, column);
            t.separated = sep;
            return Ok(t);
        }

        let mode = self.mode();

        if let Some(mut t) = self.try_punctuation(mode, line, column)? {
            t.separated = sep;
            return Ok(t);
        }

        let mut t = self.next_word(mode, line, column)?;
        t.separated = sep;
        Ok(t)
    }

    fn try_punctuation(
        &mut self,
        mode: Mode,
        line: u64,
        column: u64,
    ) -> Result<Option<Token>, LexerError> {
        let c = self.peek().unwrap();
        if !specials(mode).contains(&c) {
            return Ok(None);
        }

        let tok = |tt: TokenType, v: &str| Some(Token::new(tt, v, line, column));

        // Multi-character operators first.
        if mode == Mode::Eval {
            let two = (c, self.peek_at(1));
            let tt = match two {
                ('=', Some('=')) => Some((TokenType::EqEq, "==")),
                ('!', Some('=')) => Some((TokenType::NotEq, "!=")),
                ('<', Some('=')) => Some((TokenType::LessEq, "<=")),
                ('>', Some('=')) => Some((TokenType::GreaterEq, ">=")),
                ('&', Some('&')) => Some((TokenType::LogAnd, "&&")),
                ('|', Some('|')) => Some((TokenType::LogOr, "||")),
                _ => None,
            };
            if let Some((tt, v)) = tt {
                self.advance();
                self.advance();
                return Ok(tok(tt, v));
            }
        }

        if mode == Mode::Normal {
            // Assignment operators (only when separated as their own
            // tokens; `+=`/`=+` lookahead).
            if c == '+' {
                if self.peek_at(1) == Some('=') {
                    self.advance();
                    self.advance();
                    return Ok(tok(TokenType::Append, "+="));
                }
                return Ok(None); // A word starting with '+'.
            }
            if c == '=' {
                if self.peek_at(1) == Some('+') {
                    self.advance();
                    self.advance();
                    return Ok(tok(TokenType::Prepend, "=+"));
                }
                self.advance();
                return Ok(tok(TokenType::Assign, "="));
            }
        }

        // Multi-brace tokens.
        if c == '{' && self.peek_at(1) == Some('{') {
            let mut n = 0;
            while self.peek() == Some('{') {
                self.advance();
                n += 1;
            }
            return Ok(Some(Token::new(
                TokenType::MultiLBrace,
                "{".repeat(n),
                line,
                column,
            )));
        }
        if c == '}' && self.peek_at(1) == Some('}') {
            let mut n = 0;
            while self.peek() == Some('}') {
                self.advance();
                n += 1;
            }
            return Ok(Some(Token::new(
                TokenType::MultiRBrace,
                "}".repeat(n),
                line,
                column,
            )));
        }

        let tt = match (mode, c) {
            (_, '$') => TokenType::Dollar,
            (_, '(') => TokenType::LParen,
            (_, ')') => TokenType::RParen,
            (_, '{') => TokenType::LBrace,
            (_, '}') => TokenType::RBrace,
            (_, '[') => TokenType::LSBrace,
            (_, ']') => TokenType::RSBrace,
            (_, ',') => TokenType::Comma,
            (Mode::Eval, ':') => TokenType::Colon,
            (Mode::Eval, '<') => TokenType::LessThan,
            (Mode::Eval, '>') => TokenType::GreaterThan,
            (Mode::Eval, '!') => TokenType::Not,
            (Mode::Eval, '?') => TokenType::Quest,
            (_, ':') => TokenType::Colon,
            (Mode::Normal, '<') => TokenType::LABrace,
            (Mode::Normal, '>') => TokenType::RABrace,
            (Mode::Normal, '%') => TokenType::Percent,
            (_, '@') => TokenType::Pair,
            (Mode::CasePatterns, '|') => TokenType::Alternative,
            (Mode::Attributes, '=') | (Mode::Variable, '=') => TokenType::Assign,
            _ => return Ok(None),
        };

        self.advance();
        Ok(Some(Token::new(tt, c.to_string(), line, column)))
    }

    /// Lex a word, handling quoting and escapes.
    fn next_word(&mut self, mode: Mode, line: u64, column: u64) -> Result<Token, LexerError> {
        let mut value = String::new();
        let mut quote = QuoteType::Unquoted;
        let mut quote_first = false;
        let mut first = true;

        let note_quote = |q: &mut QuoteType, new: QuoteType| {
            *q = match (*q, new) {
                (QuoteType::Unquoted, n) => n,
                (q, n) if q == n => q,
                _ => QuoteType::Mixed,
            };
        };

        loop {
            let c = match self.peek() {
                None => break,
                Some(c) => c,
            };

            if WORD_BREAK.contains_key(&c) && c != '"' && c != '\'' {
                break;
            }

            if c == '\'' {
                // Single-quoted fragment: everything literal until the
                // closing quote.
                self.advance();
                if first {
                    quote_first = true;
                }
                note_quote(&mut quote, QuoteType::Single);
                loop {
                    match self.advance() {
                        None => {
                            return Err(LexerError::new("unterminated single-quoted sequence", line, column))
                        }
                        Some('\'') => break,
                        Some(c) => value.push(c),
                    }
                }
                first = false;
                continue;
            }

            if c == '"' {
                // Double-quoted fragment: expansions remain special; the
                // fragment ends at the closing quote or at `$`/`(` which
                // the parser handles as concatenated expansion.
                self.advance();
                if first {
                    quote_first = true;
                }
                note_quote(&mut quote, QuoteType::Double);
                loop {
                    match self.peek() {
                        None => {
                            return Err(LexerError::new("unterminated double-quoted sequence", line, column))
                        }
                        Some('"') => {
                            self.advance();
                            break;
                        }
                        Some('$') => {
                            // Leave the expansion to the parser; the
                            // quoted sequence resumes after it. The
                            // fragments are adjacent (unseparated) so
                            // they concatenate.
                            self.in_dquote = true;
                            break;
                        }
                        Some('\\') => {
                            self.advance();
                            match self.advance() {
                                Some('\n') => {}
                                Some(e) => value.push(e),
                                None => {
                                    return Err(LexerError::new(
                                        "unterminated escape sequence",
                                        line,
                                        column,
                                    ))
                                }
                            }
                        }
                        Some(_) => {
                            value.push(self.advance().unwrap());
                        }
                    }
                }
                first = false;
                if self.in_dquote {
                    break; // The word resumes after the expansion.
                }
                continue;
            }

            if specials(mode).contains(&c) {
                // `+` in normal mode is only special as `+=`.
                if mode == Mode::Normal && c == '+' && self.peek_at(1) != Some('=') {
                    value.push(c);
                    self.advance();
                    first = false;
                    continue;
                }
                // Square brackets are only special at token start
                // (attributes); mid-word they are wildcard character
                // classes.
                if (c == '[' || c == ']')
                    && matches!(
                        mode,
                        Mode::Normal
                            | Mode::Value
                            | Mode::SwitchExpressions
                            | Mode::CasePatterns
                            | Mode::Buildspec
                    )
                {
                    value.push(c);
                    self.advance();
                    first = false;
                    continue;
                }
                break;
            }

            if c == '\\' {
                self.advance();
                match self.advance() {
                    Some('\n') => {} // Line continuation inside a word.
                    Some(e) => {
                        value.push(e);
                        note_quote(&mut quote, QuoteType::Mixed);
                    }
                    None => {
                        return Err(LexerError::new("unterminated escape sequence", line, column))
                    }
                }
                first = false;
                continue;
            }

            value.push(c);
            self.advance();
            first = false;
        }

        if value.is_empty() && quote == QuoteType::Unquoted {
            return Err(LexerError::new(
                format!("unexpected character '{}'", self.peek().unwrap_or('\0')),
                line,
                column,
            ));
        }

        let mut t = Token::new(TokenType::Word, value, line, column);
        t.quote = quote;
        t.quote_first = quote_first;
        Ok(t)
    }

    /// A variable name directly after `$`: either a simple name or the
    /// opening paren of `$(...)`.
    fn next_variable_name(&mut self) -> Result<Token, LexerError> {
        let (line, column) = (self.line, self.column);

        if self.peek() == Some('(') {
            self.advance();
            return Ok(Token::new(TokenType::LParen, "(", line, column));
        }

        let mut value = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                value.push(c);
                self.advance();
            } else {
                break;
            }
        }

        if value.is_empty() {
            return Err(LexerError::new("expected variable name after '$'", line, column));
        }

        // A trailing dot belongs to the surrounding text, not the name
        // (e.g. `$name.txt` inside a double-quoted sequence).
        while value.ends_with('.') {
            value.pop();
            self.pos -= 1;
            self.column -= 1;
        }

        Ok(Token::new(TokenType::Word, value, line, column))
    }

    /// Continue a double-quoted sequence after an expansion.
    fn next_dquote_fragment(&mut self) -> Result<Token, LexerError> {
        let (line, column) = (self.line, self.column);

        if self.peek() == Some('$') {
            self.advance();
            return Ok(Token::new(TokenType::Dollar, "$", line, column));
        }

        let mut value = String::new();
        loop {
            match self.peek() {
                None | Some('\n') => {
                    return Err(LexerError::new(
                        "unterminated double-quoted sequence",
                        line,
                        column,
                    ))
                }
                Some('"') => {
                    self.advance();
                    self.in_dquote = false;
                    break;
                }
                Some('$') => break,
                Some('\\') => {
                    self.advance();
                    match self.advance() {
                        Some('\n') | None => {
                            return Err(LexerError::new(
                                "unterminated escape sequence",
                                line,
                                column,
                            ))
                        }
                        Some(e) => value.push(e),
                    }
                }
                Some(_) => value.push(self.advance().unwrap()),
            }
        }

        let mut t = Token::new(TokenType::Word, value, line, column);
        t.quote = QuoteType::Double;
        Ok(t)
    }

    /// Foreign mode: consume raw text until a line consisting of exactly
    /// `n` closing braces; emits the body as one Word followed by a
    /// MultiRBrace on the next call.
    fn next_foreign(&mut self, n: usize) -> Result<Token, LexerError> {
        let (line, column) = (self.line, self.column);
        let mut body = String::new();

        loop {
            // Examine one line.
            let start = self.pos;
            let mut text = String::new();
            loop {
                match self.peek() {
                    None => {
                        return Err(LexerError::new(
                            format!("unterminated recipe block (expected {} closing braces)", n),
                            line,
                            column,
                        ))
                    }
                    Some('\n') => break,
                    Some(c) => {
                        text.push(c);
                        self.advance();
                    }
                }
            }

            let trimmed = text.trim();
            if trimmed.len() == n && trimmed.chars().all(|c| c == '}') {
                // Rewind to the brace line start so the closing token is
                // lexed normally.
                self.pos = start;
                self.pop_mode();
                let mut t = Token::new(TokenType::Word, body, line, column);
                t.separated = true;
                return Ok(t);
            }

            body.push_str(&text);
            body.push('\n');
            self.advance(); // The newline.
        }
    }
}
