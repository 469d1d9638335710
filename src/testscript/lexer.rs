//! Lexer for Testscripts
//!
//! Tokenizes testscript input: command words with quoting, redirects
//! (including here-documents, which are collected into their own tokens
//! at end of line), logical connectives, exit-status checks, cleanup
//! registrations, and the block punctuation the pre-parse phase builds
//! the scope tree from.

use std::collections::VecDeque;

use lazy_static::lazy_static;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenType {
    Eos,
    Newline,

    Word,
    /// Here-document body collected at end of line.
    HereDoc,

    Semi,        // ;
    Colon,       // : (descriptions)
    LBrace,      // {
    RBrace,      // }
    MultiLBrace, // {{
    MultiRBrace, // }}
    Plus,        // + (setup marker)
    Minus,       // - (teardown marker)

    Pipe,   // |
    AndAnd, // &&
    OrOr,   // ||

    Equal,    // == (exit status check)
    NotEqual, // !=

    InStr,     // <   (stdin from string)
    InDoc,     // <<  (stdin here-document)
    InHere,    // <<< (stdin here-string)
    Out,       // >   (stdout to file)
    OutApp,    // >>  (append)
    OutNull,   // >-  (discard)
    OutCmp,    // >?  (compare to file)
    OutDocCmp, // >>? (compare to here-document)

    Cleanup,      // &
    CleanupNever, // &!
    CleanupMaybe, // &?

    Dollar, // $
    LParen, // (
    RParen, // )
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eos => "<end of file>",
            Self::Newline => "<newline>",
            Self::Word => "<word>",
            Self::HereDoc => "<here-document>",
            Self::Semi => ";",
            Self::Colon => ":",
            Self::LBrace => "{",
            Self::RBrace => "}",
            Self::MultiLBrace => "{{",
            Self::MultiRBrace => "}}",
            Self::Plus => "+",
            Self::Minus => "-",
            Self::Pipe => "|",
            Self::AndAnd => "&&",
            Self::OrOr => "||",
            Self::Equal => "==",
            Self::NotEqual => "!=",
            Self::InStr => "<",
            Self::InDoc => "<<",
            Self::InHere => "<<<",
            Self::Out => ">",
            Self::OutApp => ">>",
            Self::OutNull => ">-",
            Self::OutCmp => ">?",
            Self::OutDocCmp => ">>?",
            Self::Cleanup => "&",
            Self::CleanupNever => "&!",
            Self::CleanupMaybe => "&?",
            Self::Dollar => "$",
            Self::LParen => "(",
            Self::RParen => ")",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub token_type: TokenType,
    pub value: String,
    pub line: u64,
    pub column: u64,
    pub separated: bool,
    pub quoted: bool,
    pub single_quoted: bool,
}

impl Token {
    fn new(token_type: TokenType, value: impl Into<String>, line: u64, column: u64) -> Self {
        Self {
            token_type,
            value: value.into(),
            line,
            column,
            separated: false,
            quoted: false,
            single_quoted: false,
        }
    }

    pub fn is_eol(&self) -> bool {
        matches!(self.token_type, TokenType::Newline | TokenType::Eos)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("line {line}: {message}")]
pub struct LexerError {
    pub message: String,
    pub line: u64,
    pub column: u64,
}

lazy_static! {
    /// Multi-character operators, longest first.
    static ref OPERATORS: Vec<(&'static str, TokenType)> = vec![
        ("<<<", TokenType::InHere),
        (">>?", TokenType::OutDocCmp),
        ("{{", TokenType::MultiLBrace),
        ("}}", TokenType::MultiRBrace),
        ("&&", TokenType::AndAnd),
        ("||", TokenType::OrOr),
        ("==", TokenType::Equal),
        ("!=", TokenType::NotEqual),
        ("<<", TokenType::InDoc),
        (">>", TokenType::OutApp),
        (">-", TokenType::OutNull),
        (">?", TokenType::OutCmp),
        ("&!", TokenType::CleanupNever),
        ("&?", TokenType::CleanupMaybe),
        ("<", TokenType::InStr),
        (">", TokenType::Out),
        (";", TokenType::Semi),
        (":", TokenType::Colon),
        ("{", TokenType::LBrace),
        ("}", TokenType::RBrace),
        ("|", TokenType::Pipe),
        ("&", TokenType::Cleanup),
        ("$", TokenType::Dollar),
        ("(", TokenType::LParen),
        (")", TokenType::RParen),
    ];
}

#[derive(Debug, Clone)]
struct PendingHeredoc {
    delimiter: String,
}

pub struct Lexer {
    input: Vec<char>,
    pos: usize,
    line: u64,
    column: u64,
    pending_heredocs: VecDeque<PendingHeredoc>,
    queued: VecDeque<Token>,
    in_dquote: bool,
    /// The previous significant token started a here-doc redirect.
    expect_delimiter: bool,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        Self {
            input: input.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
            pending_heredocs: VecDeque::new(),
            queued: VecDeque::new(),
            in_dquote: false,
            expect_delimiter: false,
        }
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

    fn starts_with(&self, s: &str) -> bool {
        s.chars()
            .enumerate()
            .all(|(i, c)| self.peek_at(i) == Some(c))
    }

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

    pub fn next(&mut self) -> Result<Token, LexerError> {
        if let Some(t) = self.queued.pop_front() {
            return Ok(t);
        }

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
            // Collect pending here-document bodies; they belong to the
            // line just ended and are queued before the newline token.
            if !self.pending_heredocs.is_empty() {
                let mut docs = Vec::new();
                while let Some(h) = self.pending_heredocs.pop_front() {
                    docs.push(self.read_heredoc(&h, line)?);
                }
                let mut nl = Token::new(TokenType::Newline, "\n", self.line, 1);
                nl.separated = sep;
                for d in docs {
                    self.queued.push_back(d);
                }
                self.queued.push_back(nl);
                return Ok(self.queued.pop_front().unwrap());
            }
            let mut t = Token::new(TokenType::Newline, "\n", line, column);
            t.separated = sep;
            return Ok(t);
        }

        // Operators.
        for (s, tt) in OPERATORS.iter() {
            if self.starts_with(s) {
                for _ in 0..s.len() {
                    self.advance();
                }
                let mut t = Token::new(*tt, *s, line, column);
                t.separated = sep;
                if matches!(tt, TokenType::InDoc | TokenType::OutDocCmp) {
                    self.expect_delimiter = true;
                }
                if *tt == TokenType::Dollar {
                    // The variable name is adjacent; lex and queue it so
                    // the parser need not reach into the raw input (the
                    // name may itself be an operator-looking special
                    // like `$<`).
                    let name = self.lex_var_name();
                    self.queued.push_back(Token::new(
                        TokenType::Word,
                        name,
                        self.line,
                        self.column,
                    ));
                }
                return Ok(t);
            }
        }

        let mut t = self.next_word(line, column)?;
        t.separated = sep;

        if self.expect_delimiter && t.token_type == TokenType::Word {
            self.pending_heredocs.push_back(PendingHeredoc {
                delimiter: t.value.clone(),
            });
            self.expect_delimiter = false;
        }

        Ok(t)
    }

    fn read_heredoc(&mut self, h: &PendingHeredoc, at: u64) -> Result<Token, LexerError> {
        let (line, column) = (self.line, self.column);
        let mut body = String::new();
        loop {
            if self.peek().is_none() {
                return Err(LexerError {
                    message: format!("here-document delimiter '{}' not found", h.delimiter),
                    line: at,
                    column: 1,
                });
            }
            let mut text = String::new();
            while let Some(c) = self.peek() {
                if c == '\n' {
                    break;
                }
                text.push(c);
                self.advance();
            }
            self.advance(); // The newline (or EOF).
            if text.trim_end() == h.delimiter {
                let mut t = Token::new(TokenType::HereDoc, body, line, column);
                t.separated = true;
                return Ok(t);
            }
            body.push_str(&text);
            body.push('\n');
        }
    }

    fn next_word(&mut self, line: u64, column: u64) -> Result<Token, LexerError> {
        let mut value = String::new();
        let mut quoted = false;
        let mut single_quoted = false;

        loop {
            let c = match self.peek() {
                None => break,
                Some(c) => c,
            };

            if matches!(c, ' ' | '\t' | '\n' | '#') {
                break;
            }

            if c == '\'' {
                self.advance();
                quoted = true;
                if value.is_empty() {
                    single_quoted = true;
                }
                loop {
                    match self.advance() {
                        None => {
                            return Err(LexerError {
                                message: "unterminated single-quoted sequence".into(),
                                line,
                                column,
                            })
                        }
                        Some('\'') => break,
                        Some(c) => value.push(c),
                    }
                }
                continue;
            }

            if c == '"' {
                self.advance();
                quoted = true;
                loop {
                    match self.peek() {
                        None | Some('\n') => {
                            return Err(LexerError {
                                message: "unterminated double-quoted sequence".into(),
                                line,
                                column,
                            })
                        }
                        Some('"') => {
                            self.advance();
                            break;
                        }
                        Some('$') => {
                            self.in_dquote = true;
                            break;
                        }
                        Some('\\') => {
                            self.advance();
                            if let Some(e) = self.advance() {
                                if e != '\n' {
                                    value.push(e);
                                }
                            }
                        }
                        Some(_) => value.push(self.advance().unwrap()),
                    }
                }
                if self.in_dquote {
                    break;
                }
                continue;
            }

            // Operator characters end the word.
            if matches!(c, ';' | ':' | '{' | '}' | '|' | '&' | '<' | '>' | '$' | '(' | ')' | '=' | '!')
            {
                // `=`/`!` only as part of `==`/`!=`.
                if (c == '=' && self.peek_at(1) == Some('=')) || (c == '!' && self.peek_at(1) == Some('=')) {
                    break;
                }
                if c != '=' && c != '!' {
                    break;
                }
                value.push(c);
                self.advance();
                continue;
            }

            if c == '\\' {
                self.advance();
                match self.advance() {
                    Some('\n') => {}
                    Some(e) => value.push(e),
                    None => break,
                }
                continue;
            }

            value.push(c);
            self.advance();
        }

        if value.is_empty() && !quoted {
            return Err(LexerError {
                message: format!("unexpected character '{}'", self.peek().unwrap_or('\0')),
                line,
                column,
            });
        }

        let mut t = Token::new(TokenType::Word, value, line, column);
        t.quoted = quoted;
        t.single_quoted = single_quoted;
        Ok(t)
    }

    /// Continue a double-quoted sequence after an expansion.
    fn next_dquote_fragment(&mut self) -> Result<Token, LexerError> {
        let (line, column) = (self.line, self.column);

        if self.peek() == Some('$') {
            self.advance();
            // The variable name is lexed here as well, adjacent.
            let name = self.lex_var_name();
            self.queued.push_back({
                let mut t = Token::new(TokenType::Word, name, self.line, self.column);
                t.quoted = true;
                t
            });
            return Ok(Token::new(TokenType::Dollar, "$", line, column));
        }

        let mut value = String::new();
        loop {
            match self.peek() {
                None | Some('\n') => {
                    return Err(LexerError {
                        message: "unterminated double-quoted sequence".into(),
                        line,
                        column,
                    })
                }
                Some('"') => {
                    self.advance();
                    self.in_dquote = false;
                    break;
                }
                Some('$') => break,
                Some('\\') => {
                    self.advance();
                    if let Some(e) = self.advance() {
                        if e != '\n' {
                            value.push(e);
                        }
                    }
                }
                Some(_) => value.push(self.advance().unwrap()),
            }
        }

        let mut t = Token::new(TokenType::Word, value, line, column);
        t.quoted = true;
        Ok(t)
    }

    /// Lex the variable name directly after `$`: a simple name or one
    /// of the specials (`*`, `~`, `@`, `<`, `>`, a digit).
    pub fn lex_var_name(&mut self) -> String {
        match self.peek() {
            Some(c @ ('*' | '~' | '@' | '<' | '>')) => {
                self.advance();
                c.to_string()
            }
            Some(c) if c.is_ascii_digit() => {
                self.advance();
                c.to_string()
            }
            _ => {
                let mut name = String::new();
                while let Some(c) = self.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                        name.push(c);
                        self.advance();
                    } else {
                        break;
                    }
                }
                name
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex_all(input: &str) -> Vec<Token> {
        let mut l = Lexer::new(input);
        let mut out = Vec::new();
        loop {
            let t = l.next().unwrap();
            let eos = t.token_type == TokenType::Eos;
            out.push(t);
            if eos {
                break;
            }
        }
        out
    }

    #[test]
    fn test_simple_command() {
        let ts = lex_all("echo hello\n");
        assert_eq!(ts[0].token_type, TokenType::Word);
        assert_eq!(ts[0].value, "echo");
        assert_eq!(ts[1].value, "hello");
        assert!(ts[1].separated);
        assert_eq!(ts[2].token_type, TokenType::Newline);
    }

    #[test]
    fn test_redirects_and_status() {
        let ts = lex_all("cat <in >out 2\n");
        let tt: Vec<_> = ts.iter().map(|t| t.token_type).collect();
        assert!(tt.contains(&TokenType::InStr));
        assert!(tt.contains(&TokenType::Out));

        let ts = lex_all("false == 1\n");
        assert_eq!(ts[1].token_type, TokenType::Equal);
        let ts = lex_all("false != 0\n");
        assert_eq!(ts[1].token_type, TokenType::NotEqual);
    }

    #[test]
    fn test_connectives_and_pipe() {
        let ts = lex_all("a && b || c | d ; e\n");
        let tt: Vec<_> = ts.iter().map(|t| t.token_type).collect();
        assert!(tt.contains(&TokenType::AndAnd));
        assert!(tt.contains(&TokenType::OrOr));
        assert!(tt.contains(&TokenType::Pipe));
        assert!(tt.contains(&TokenType::Semi));
    }

    #[test]
    fn test_heredoc() {
        let ts = lex_all("cat <<EOI\nhello\nworld\nEOI\n");
        let doc = ts
            .iter()
            .find(|t| t.token_type == TokenType::HereDoc)
            .unwrap();
        assert_eq!(doc.value, "hello\nworld\n");
        // The newline token follows the collected document.
        let di = ts
            .iter()
            .position(|t| t.token_type == TokenType::HereDoc)
            .unwrap();
        assert_eq!(ts[di + 1].token_type, TokenType::Newline);
    }

    #[test]
    fn test_output_comparison_heredoc() {
        let ts = lex_all("echo hi >>?EOO\nhi\nEOO\n");
        assert!(ts.iter().any(|t| t.token_type == TokenType::OutDocCmp));
        let doc = ts
            .iter()
            .find(|t| t.token_type == TokenType::HereDoc)
            .unwrap();
        assert_eq!(doc.value, "hi\n");
    }

    #[test]
    fn test_two_heredocs_in_order() {
        let ts = lex_all("cmd <<EOI >>?EOO\nin\nEOI\nout\nEOO\n");
        let docs: Vec<_> = ts
            .iter()
            .filter(|t| t.token_type == TokenType::HereDoc)
            .collect();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].value, "in\n");
        assert_eq!(docs[1].value, "out\n");
    }

    #[test]
    fn test_blocks() {
        let ts = lex_all("{{\n{\n}\n}}\n");
        let tt: Vec<_> = ts.iter().map(|t| t.token_type).collect();
        assert_eq!(tt[0], TokenType::MultiLBrace);
        assert_eq!(tt[2], TokenType::LBrace);
        assert_eq!(tt[4], TokenType::RBrace);
        assert_eq!(tt[6], TokenType::MultiRBrace);
    }

    #[test]
    fn test_cleanup_tokens() {
        let ts = lex_all("touch a &a &!b &?c\n");
        let tt: Vec<_> = ts.iter().map(|t| t.token_type).collect();
        assert!(tt.contains(&TokenType::Cleanup));
        assert!(tt.contains(&TokenType::CleanupNever));
        assert!(tt.contains(&TokenType::CleanupMaybe));
    }

    #[test]
    fn test_quoting() {
        let ts = lex_all("echo 'a b' \"c d\"\n");
        assert_eq!(ts[1].value, "a b");
        assert!(ts[1].single_quoted);
        assert_eq!(ts[2].value, "c d");
        assert!(ts[2].quoted);
        assert!(!ts[2].single_quoted);
    }

    #[test]
    fn test_dollar_and_specials() {
        let ts = lex_all("$* $~ $@ $1 $< $> $foo\n");
        let names: Vec<&str> = ts
            .chunks(2)
            .take_while(|c| c[0].token_type == TokenType::Dollar)
            .map(|c| c[1].value.as_str())
            .collect();
        assert_eq!(names, ["*", "~", "@", "1", "<", ">", "foo"]);
        // The queued name tokens are adjacent to their dollars.
        assert!(!ts[1].separated);
    }

    #[test]
    fn test_dquote_expansion() {
        let ts = lex_all("echo \"pre$x post\"\n");
        // Word "pre", Dollar, Word "x" (queued), Word " post".
        assert_eq!(ts[1].value, "pre");
        assert_eq!(ts[2].token_type, TokenType::Dollar);
        assert_eq!(ts[3].value, "x");
        assert!(ts[3].quoted);
        assert_eq!(ts[4].value, " post");
    }

    #[test]
    fn test_description_colon() {
        let ts = lex_all(": basics\n");
        assert_eq!(ts[0].token_type, TokenType::Colon);
        assert_eq!(ts[1].value, "basics");
    }
}
