//! Testscript Parser (pre-parse phase)
//!
//! The first pass over a testscript builds the scope tree without
//! executing anything: tokens are saved into replay buffers per logical
//! line, lines are classified, and group/test scopes are constructed
//! with their descriptions and ids. Command execution happens later,
//! when the runner walks the tree.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::diag::{Location, ParseError};
use crate::testscript::lexer::{Lexer, Token, TokenType};
use crate::testscript::script::{
    Description, IdMap, IncludeSet, Line, LineType, ScopeKind, Script, TestScope,
};

type PResult<T> = Result<T, ParseError>;

pub struct Parser {
    lexer: Lexer,
    path: Arc<PathBuf>,
    peeked: Option<Token>,
    /// Prefix for synthetic ids of included lines.
    include_prefix: String,
    syntax: u32,
    /// Only the first line may set `testscript.syntax`.
    first_line: bool,
}

impl Parser {
    pub fn new(path: impl Into<PathBuf>, text: &str) -> Self {
        Self {
            lexer: Lexer::new(text),
            path: Arc::new(path.into()),
            peeked: None,
            include_prefix: String::new(),
            syntax: 2,
            first_line: true,
        }
    }

    /// Parse a whole testscript into its (root group) scope tree.
    pub fn parse(mut self) -> PResult<Script> {
        let mut root = TestScope::new(ScopeKind::Group, "", 1);
        let mut ids = IdMap::default();
        let mut includes = IncludeSet::default();
        self.parse_group_body(&mut root, &mut ids, &mut includes, TokenType::Eos)?;
        root.end_line = self.line();
        Ok(Script {
            path: (*self.path).clone(),
            syntax: self.syntax,
            root,
        })
    }

    // -- Token plumbing ---------------------------------------------------

    fn next(&mut self) -> PResult<Token> {
        if let Some(t) = self.peeked.take() {
            return Ok(t);
        }
        self.lexer.next().map_err(|e| {
            ParseError::new(
                Location::new(self.path.clone(), e.line, e.column),
                e.message,
            )
        })
    }

    fn peek(&mut self) -> PResult<&Token> {
        if self.peeked.is_none() {
            let t = self.next()?;
            self.peeked = Some(t);
        }
        Ok(self.peeked.as_ref().unwrap())
    }

    fn line(&mut self) -> u64 {
        self.peeked.as_ref().map(|t| t.line).unwrap_or(0)
    }

    fn loc(&self, t: &Token) -> Location {
        Location::new(self.path.clone(), t.line, t.column)
    }

    fn err<T>(&self, t: &Token, msg: impl Into<String>) -> PResult<T> {
        Err(ParseError::new(self.loc(t), msg))
    }

    fn skip_newlines(&mut self) -> PResult<()> {
        while self.peek()?.token_type == TokenType::Newline {
            self.next()?;
        }
        Ok(())
    }

    /// Read one physical line of tokens (newline excluded). Returns the
    /// tokens, whether a `;` continuation terminated the command, and a
    /// trailing one-line description if present.
    fn read_line(&mut self) -> PResult<(Vec<Token>, bool, Option<String>)> {
        let mut tokens = Vec::new();
        let mut semi = false;
        let mut desc: Option<String> = None;

        loop {
            let t = self.next()?;
            match t.token_type {
                TokenType::Newline | TokenType::Eos => break,
                TokenType::Semi => {
                    // Significant only at end of line.
                    if matches!(
                        self.peek()?.token_type,
                        TokenType::Newline | TokenType::Eos
                    ) {
                        semi = true;
                    } else {
                        tokens.push(t);
                    }
                }
                TokenType::Colon if !tokens.is_empty() && t.separated => {
                    // Trailing description: the rest of the line. (An
                    // unseparated colon belongs to the command, e.g.
                    // `for x: a b`.)
                    let mut d = String::new();
                    loop {
                        let w = self.next()?;
                        if w.is_eol() {
                            break;
                        }
                        if !d.is_empty() {
                            d.push(' ');
                        }
                        d.push_str(&w.value);
                    }
                    desc = Some(d);
                    break;
                }
                TokenType::Dollar => {
                    // Keep the adjacent variable name with the token
                    // stream.
                    tokens.push(t);
                    let name = self.lex_dollar_name();
                    tokens.push(name);
                }
                _ => tokens.push(t),
            }
        }

        self.first_line = false;
        Ok((tokens, semi, desc))
    }

    fn lex_dollar_name(&mut self) -> Token {
        // The name is adjacent (the lexer queues it for the
        // double-quoted form; otherwise the next token is the name).
        if let Ok(t) = self.peek() {
            if t.token_type == TokenType::Word && !t.separated {
                return self.next().unwrap();
            }
        }
        // `$` with nothing adjacent: an empty name the runner will
        // diagnose.
        Token {
            token_type: TokenType::Word,
            value: String::new(),
            line: 0,
            column: 0,
            separated: false,
            quoted: false,
            single_quoted: false,
        }
    }

    /// Classify a line from its leading tokens.
    fn classify(tokens: &[Token]) -> (LineType, Option<String>) {
        if tokens.len() >= 2
            && tokens[0].token_type == TokenType::Word
            && tokens[1].token_type == TokenType::Word
            && matches!(tokens[1].value.as_str(), "=" | "+=" | "=+")
            && !tokens[0].quoted
        {
            return (LineType::Var, Some(tokens[0].value.clone()));
        }

        let ty = match tokens.first() {
            Some(t) if t.token_type == TokenType::Word && !t.quoted => match t.value.as_str() {
                "if" => LineType::CmdIf,
                "if!" => LineType::CmdIfn,
                "elif" => LineType::CmdElif,
                "elif!" => LineType::CmdElifn,
                "else" => LineType::CmdElse,
                "end" => LineType::CmdEnd,
                "while" => LineType::CmdWhile,
                "for" => {
                    if tokens
                        .iter()
                        .any(|t| t.token_type == TokenType::Colon)
                        || tokens
                            .iter()
                            .any(|t| t.token_type == TokenType::Word && t.value == ":")
                    {
                        LineType::CmdForArgs
                    } else {
                        LineType::CmdForStream
                    }
                }
                _ => LineType::Cmd,
            },
            _ => LineType::Cmd,
        };
        (ty, None)
    }

    fn make_line(&self, tokens: Vec<Token>) -> Line {
        let line = tokens.first().map(|t| t.line).unwrap_or(0);
        let (ty, var) = Self::classify(&tokens);
        Line {
            ty,
            tokens,
            var,
            line,
        }
    }

    // -- Descriptions -----------------------------------------------------

    /// Parse a leading description: consecutive `: text` lines. The
    /// first line is the id when it is a single identifier-shaped word,
    /// otherwise the summary; the second becomes the summary; further
    /// lines accumulate as details, with the common indentation prefix
    /// of the first three lines stripped.
    fn parse_description(&mut self) -> PResult<Description> {
        let mut raw: Vec<String> = Vec::new();

        loop {
            if self.peek()?.token_type != TokenType::Colon {
                break;
            }
            self.next()?; // :
            let mut text = String::new();
            loop {
                let t = self.next()?;
                if t.is_eol() {
                    break;
                }
                if !text.is_empty() {
                    text.push(' ');
                }
                text.push_str(&t.value);
            }
            raw.push(text);
        }

        // Strip the common leading-space prefix of the first lines.
        let prefix_len = raw
            .iter()
            .take(3)
            .filter(|l| !l.is_empty())
            .map(|l| l.len() - l.trim_start().len())
            .min()
            .unwrap_or(0);
        for l in &mut raw {
            if l.len() >= prefix_len {
                *l = l[prefix_len..].to_string();
            }
        }

        let mut d = Description::default();
        let mut it = raw.into_iter().filter(|l| !l.is_empty());
        if let Some(first) = it.next() {
            if is_id(&first) {
                d.id = Some(first);
                if let Some(second) = it.next() {
                    d.summary = Some(second);
                }
            } else {
                d.summary = Some(first);
            }
        }
        d.details.extend(it);
        Ok(d)
    }

    // -- Scope tree -------------------------------------------------------

    fn assign_id(
        &self,
        scope: &mut TestScope,
        ids: &mut IdMap,
        at_line: u64,
    ) -> PResult<()> {
        let id = match &scope.desc.id {
            Some(id) => id.clone(),
            None => format!("{}{}", self.include_prefix, at_line),
        };
        if let Err(prev) = ids.insert(&id, at_line) {
            return Err(ParseError::new(
                Location::new(self.path.clone(), at_line, 0),
                format!("duplicate id '{}' (first used on line {})", id, prev),
            ));
        }
        scope.id = id;
        Ok(())
    }

    fn parse_group_body(
        &mut self,
        group: &mut TestScope,
        ids: &mut IdMap,
        includes: &mut IncludeSet,
        end: TokenType,
    ) -> PResult<()> {
        let mut seen_child = false;

        loop {
            self.skip_newlines()?;
            let t = self.peek()?.clone();

            if t.token_type == end {
                self.next()?;
                return Ok(());
            }
            if t.token_type == TokenType::Eos {
                if end == TokenType::Eos {
                    return Ok(());
                }
                return self.err(&t, format!("expected {} before end of file", end.as_str()));
            }

            // Leading description.
            let desc = if t.token_type == TokenType::Colon {
                let d = self.parse_description()?;
                self.skip_newlines()?;
                Some(d)
            } else {
                None
            };

            let t = self.peek()?.clone();
            match t.token_type {
                TokenType::MultiLBrace => {
                    self.next()?;
                    self.expect_newline()?;
                    let mut child = TestScope::new(ScopeKind::Group, "", t.line);
                    child.desc = desc.unwrap_or_default();
                    let mut child_ids = IdMap::default();
                    let mut child_includes = IncludeSet::default();
                    self.parse_group_body(
                        &mut child,
                        &mut child_ids,
                        &mut child_includes,
                        TokenType::MultiRBrace,
                    )?;
                    child.end_line = t.line;
                    self.assign_id(&mut child, ids, t.line)?;
                    group.children.push(child);
                    seen_child = true;
                }

                TokenType::LBrace => {
                    let mut child = self.parse_braced_scope(&t, ids)?;
                    child.desc = merge_desc(desc, child.desc);
                    self.assign_id(&mut child, ids, t.line)?;
                    group.children.push(child);
                    seen_child = true;
                }

                TokenType::Word if t.value == ".include" => {
                    if let Some(d) = desc {
                        if !d.empty() {
                            return self.err(&t, "description before include directive");
                        }
                    }
                    self.parse_include(group, ids, includes)?;
                    // Included scopes count as children for ordering.
                    seen_child = seen_child || !group.children.is_empty();
                }

                TokenType::Word
                    if matches!(t.value.as_str(), "if" | "if!") && desc.is_none() =>
                {
                    // Scope-if when the condition line is followed by a
                    // brace block; command-if otherwise.
                    let (tokens, semi, tdesc) = self.read_line()?;
                    self.skip_newlines_keep()?;
                    let next_is_block = matches!(
                        self.peek()?.token_type,
                        TokenType::LBrace | TokenType::MultiLBrace
                    );

                    if next_is_block && !semi && tdesc.is_none() {
                        self.parse_scope_if(group, ids, tokens, &t)?;
                        seen_child = true;
                    } else {
                        let test =
                            self.parse_test_from(tokens, semi, tdesc, None, ids, &t)?;
                        group.children.push(test);
                        seen_child = true;
                    }
                }

                TokenType::Word if t.value.starts_with('+') && !t.quoted => {
                    // Setup command.
                    let (mut tokens, _semi, _d) = self.read_line()?;
                    tokens[0].value = tokens[0].value[1..].to_string();
                    if tokens[0].value.is_empty() {
                        tokens.remove(0);
                    }
                    let line = self.make_line(tokens);
                    group.setup.push(line);
                }

                TokenType::Word if t.value.starts_with('-') && !t.quoted => {
                    // Teardown command.
                    let (mut tokens, _semi, _d) = self.read_line()?;
                    tokens[0].value = tokens[0].value[1..].to_string();
                    if tokens[0].value.is_empty() {
                        tokens.remove(0);
                    }
                    let line = self.make_line(tokens);
                    group.teardown.push(line);
                }

                _ => {
                    let (tokens, semi, tdesc) = self.read_line()?;
                    let (ty, var) = Self::classify(&tokens);

                    if ty == LineType::Var && !semi {
                        // A variable line outside tests is group setup
                        // (or teardown once children have appeared).
                        if var.as_deref() == Some("testscript.syntax") {
                            self.apply_syntax(&tokens, &t)?;
                            continue;
                        }
                        let line = self.make_line(tokens);
                        if seen_child {
                            group.teardown.push(line);
                        } else {
                            group.setup.push(line);
                        }
                        continue;
                    }

                    let test = self.parse_test_from(tokens, semi, tdesc, desc, ids, &t)?;
                    group.children.push(test);
                    seen_child = true;
                }
            }
        }
    }

    /// Peek past newlines without consuming the next significant token.
    fn skip_newlines_keep(&mut self) -> PResult<()> {
        self.skip_newlines()
    }

    fn expect_newline(&mut self) -> PResult<()> {
        let t = self.next()?;
        if !t.is_eol() {
            return self.err(&t, format!("expected newline instead of '{}'", t.value));
        }
        Ok(())
    }

    /// `{ ... }`: an explicit test scope, or a group demoted to a test
    /// when it contains exactly one test and nothing else of substance.
    fn parse_braced_scope(&mut self, at: &Token, _ids: &mut IdMap) -> PResult<TestScope> {
        self.next()?; // {
        self.expect_newline()?;

        let mut inner = TestScope::new(ScopeKind::Group, "", at.line);
        let mut inner_ids = IdMap::default();
        let mut inner_includes = IncludeSet::default();
        self.parse_group_body(&mut inner, &mut inner_ids, &mut inner_includes, TokenType::RBrace)?;

        if inner.demotable() {
            // Syntax 1: the block was really one test.
            let mut test = inner.children.pop().unwrap();
            let mut lines = inner.setup;
            lines.extend(std::mem::take(&mut test.setup));
            test.setup = lines;
            test.start_line = at.line;
            return Ok(test);
        }

        Ok(inner)
    }

    /// A scope-if chain: `if cond { ... } elif cond { ... } else { ... }`.
    fn parse_scope_if(
        &mut self,
        group: &mut TestScope,
        ids: &mut IdMap,
        cond_tokens: Vec<Token>,
        at: &Token,
    ) -> PResult<()> {
        let mut cond = Some(self.make_line(cond_tokens));
        let mut first = true;

        loop {
            self.skip_newlines()?;
            let bt = self.peek()?.clone();
            let mut scope = match bt.token_type {
                TokenType::LBrace => self.parse_braced_scope(&bt, ids)?,
                TokenType::MultiLBrace => {
                    self.next()?;
                    self.expect_newline()?;
                    let mut child = TestScope::new(ScopeKind::Group, "", bt.line);
                    let mut cids = IdMap::default();
                    let mut cinc = IncludeSet::default();
                    self.parse_group_body(&mut child, &mut cids, &mut cinc, TokenType::MultiRBrace)?;
                    child
                }
                _ => return self.err(&bt, "expected '{' after scope-if condition"),
            };

            let c = cond.take();
            scope.if_negated = matches!(
                c.as_ref().map(|l| l.ty),
                Some(LineType::CmdIfn) | Some(LineType::CmdElifn)
            );
            scope.if_cond = c;
            scope.if_chain = !first;
            self.assign_id(&mut scope, ids, bt.line)?;
            group.children.push(scope);
            first = false;

            // elif/else continuation?
            self.skip_newlines()?;
            let t = self.peek()?.clone();
            match (t.token_type, t.value.as_str()) {
                (TokenType::Word, "elif") | (TokenType::Word, "elif!") => {
                    let (tokens, _semi, _d) = self.read_line()?;
                    cond = Some(self.make_line(tokens));
                }
                (TokenType::Word, "else") => {
                    let (_tokens, _semi, _d) = self.read_line()?;
                    cond = None;
                    // The else branch: block follows; loop once more,
                    // then finish.
                    self.skip_newlines()?;
                    let bt = self.peek()?.clone();
                    let mut scope = match bt.token_type {
                        TokenType::LBrace => self.parse_braced_scope(&bt, ids)?,
                        TokenType::MultiLBrace => {
                            self.next()?;
                            self.expect_newline()?;
                            let mut child = TestScope::new(ScopeKind::Group, "", bt.line);
                            let mut cids = IdMap::default();
                            let mut cinc = IncludeSet::default();
                            self.parse_group_body(
                                &mut child,
                                &mut cids,
                                &mut cinc,
                                TokenType::MultiRBrace,
                            )?;
                            child
                        }
                        _ => return self.err(&bt, "expected '{' after else"),
                    };
                    scope.if_chain = true;
                    self.assign_id(&mut scope, ids, bt.line)?;
                    group.children.push(scope);
                    return Ok(());
                }
                _ => return Ok(()),
            }
        }
    }

    /// Build a test from its first line and any `;` continuations.
    fn parse_test_from(
        &mut self,
        tokens: Vec<Token>,
        mut semi: bool,
        trailing: Option<String>,
        desc: Option<Description>,
        ids: &mut IdMap,
        at: &Token,
    ) -> PResult<TestScope> {
        let mut test = TestScope::new(ScopeKind::Test, "", at.line);
        test.desc = desc.unwrap_or_default();
        if let Some(td) = trailing {
            if test.desc.empty() {
                test.desc.summary = Some(td);
            }
        }

        let mut depth = 0usize; // if/while/for nesting via `end`.
        let first = self.make_line(tokens);
        depth += flow_delta(first.ty, 0).0;
        test.setup.push(first);

        loop {
            if !semi && depth == 0 {
                break;
            }
            self.skip_newlines_in_flow(depth > 0)?;
            let t = self.peek()?.clone();
            if t.is_eol() && depth == 0 {
                break;
            }
            if t.token_type == TokenType::Eos {
                return self.err(&t, "expected command after ';'");
            }
            let (tokens, s, td) = self.read_line()?;
            if tokens.is_empty() {
                semi = s;
                continue;
            }
            let line = self.make_line(tokens);
            let (d_open, d_close) = flow_delta(line.ty, depth);
            depth += d_open;
            depth -= d_close;
            test.setup.push(line);
            semi = s;
            if let Some(td) = td {
                if test.desc.empty() {
                    test.desc.summary = Some(td);
                }
            }
        }

        test.end_line = self.line();
        self.assign_id(&mut test, ids, at.line)?;
        Ok(test)
    }

    fn skip_newlines_in_flow(&mut self, in_flow: bool) -> PResult<()> {
        if in_flow {
            self.skip_newlines()?;
        }
        Ok(())
    }

    // -- Directives -------------------------------------------------------

    fn parse_include(
        &mut self,
        group: &mut TestScope,
        ids: &mut IdMap,
        includes: &mut IncludeSet,
    ) -> PResult<()> {
        let kw = self.next()?; // .include
        let mut once = false;
        let mut files = Vec::new();

        loop {
            let t = self.next()?;
            if t.is_eol() {
                break;
            }
            if t.token_type != TokenType::Word {
                return self.err(&t, "expected file name in include directive");
            }
            if t.value == "--once" {
                once = true;
            } else {
                files.push(t.value);
            }
        }

        for f in files {
            let p = if Path::new(&f).is_absolute() {
                PathBuf::from(&f)
            } else {
                self.path
                    .parent()
                    .unwrap_or(Path::new("."))
                    .join(&f)
            };

            if !includes.enter(p.clone()) {
                if once {
                    continue;
                }
                // Without --once a re-include is allowed and simply
                // parsed again.
            }

            let text = std::fs::read_to_string(&p).map_err(|e| {
                ParseError::new(
                    self.loc(&kw),
                    format!("unable to read {}: {}", p.display(), e),
                )
            })?;

            let mut sub = Parser::new(p.clone(), &text);
            sub.include_prefix = format!(
                "{}-",
                p.file_stem().and_then(|s| s.to_str()).unwrap_or("include")
            );
            sub.syntax = self.syntax;
            sub.first_line = false;
            let mut sub_includes = IncludeSet::default();
            sub.parse_group_body(group, ids, &mut sub_includes, TokenType::Eos)?;
        }

        Ok(())
    }

    fn apply_syntax(&mut self, tokens: &[Token], at: &Token) -> PResult<()> {
        if !self.first_line && at.line > 1 {
            return self.err(
                at,
                "testscript.syntax may only be assigned on the first line",
            );
        }
        let v = tokens
            .get(2)
            .filter(|t| t.token_type == TokenType::Word)
            .map(|t| t.value.as_str());
        match v {
            Some("1") => self.syntax = 1,
            Some("2") => self.syntax = 2,
            _ => return self.err(at, "testscript.syntax must be 1 or 2"),
        }
        Ok(())
    }
}

/// Opening/closing effect of a line type on flow-control nesting.
fn flow_delta(ty: LineType, depth: usize) -> (usize, usize) {
    match ty {
        LineType::CmdIf
        | LineType::CmdIfn
        | LineType::CmdWhile
        | LineType::CmdForStream
        | LineType::CmdForArgs => (1, 0),
        LineType::CmdEnd if depth > 0 => (0, 1),
        _ => (0, 0),
    }
}

fn is_id(s: &str) -> bool {
    !s.is_empty()
        && !s.contains(' ')
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

fn merge_desc(outer: Option<Description>, inner: Description) -> Description {
    match outer {
        Some(d) if !d.empty() => d,
        _ => inner,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Script {
        Parser::new("test.testscript", text).parse().unwrap()
    }

    #[test]
    fn test_single_test() {
        let s = parse("echo hi >- \n");
        assert_eq!(s.root.children.len(), 1);
        let t = &s.root.children[0];
        assert_eq!(t.kind, ScopeKind::Test);
        assert_eq!(t.setup.len(), 1);
        assert_eq!(t.setup[0].ty, LineType::Cmd);
        assert_eq!(t.id, "1");
    }

    #[test]
    fn test_multi_command_test() {
        let s = parse("touch a;\ncat a >- \n");
        assert_eq!(s.root.children.len(), 1);
        assert_eq!(s.root.children[0].setup.len(), 2);
    }

    #[test]
    fn test_two_tests_get_line_ids() {
        let s = parse("echo one >- \n\necho two >- \n");
        assert_eq!(s.root.children.len(), 2);
        assert_eq!(s.root.children[0].id, "1");
        assert_eq!(s.root.children[1].id, "3");
    }

    #[test]
    fn test_description_id() {
        let s = parse(": basics\n: Simple checks\necho hi >- \n");
        let t = &s.root.children[0];
        assert_eq!(t.desc.id.as_deref(), Some("basics"));
        assert_eq!(t.desc.summary.as_deref(), Some("Simple checks"));
        assert_eq!(t.id, "basics");
    }

    #[test]
    fn test_trailing_description() {
        let s = parse("echo hi >- : say hi\n");
        let t = &s.root.children[0];
        assert_eq!(t.desc.summary.as_deref(), Some("say hi"));
    }

    #[test]
    fn test_duplicate_id_collision() {
        let r = Parser::new(
            "t",
            ": dup\necho a >- \n\n: dup\necho b >- \n",
        )
        .parse();
        assert!(r.is_err());
        let e = r.unwrap_err();
        assert!(e.message.contains("duplicate id"));
    }

    #[test]
    fn test_group_scope() {
        let s = parse("{{\necho a >- \necho b >- \n}}\n");
        assert_eq!(s.root.children.len(), 1);
        let g = &s.root.children[0];
        assert_eq!(g.kind, ScopeKind::Group);
        assert_eq!(g.children.len(), 2);
    }

    #[test]
    fn test_group_setup_teardown() {
        let s = parse("{{\nx = 1\n+mkdir d\necho a >- \n-rm -f f\n}}\n");
        let g = &s.root.children[0];
        assert_eq!(g.setup.len(), 2);
        assert_eq!(g.setup[0].ty, LineType::Var);
        assert_eq!(g.setup[1].ty, LineType::Cmd);
        assert_eq!(g.setup[1].tokens[0].value, "mkdir");
        assert_eq!(g.teardown.len(), 1);
        assert_eq!(g.teardown[0].tokens[0].value, "rm");
        assert_eq!(g.children.len(), 1);
    }

    #[test]
    fn test_explicit_test_scope_demotion() {
        // A braced block with exactly one test demotes to a test.
        let s = parse("{\nx = 1\necho $x >- \n}\n");
        assert_eq!(s.root.children.len(), 1);
        let t = &s.root.children[0];
        assert_eq!(t.kind, ScopeKind::Test);
        // The variable line was folded into the test.
        assert_eq!(t.setup.len(), 2);
        assert_eq!(t.setup[0].ty, LineType::Var);
    }

    #[test]
    fn test_braced_group_not_demoted() {
        // Two tests inside braces stay a group.
        let s = parse("{\necho a >- \necho b >- \n}\n");
        assert_eq!(s.root.children[0].kind, ScopeKind::Group);
    }

    #[test]
    fn test_scope_if_chain() {
        let s = parse(
            "if true\n{\necho a >- \n}\nelif false\n{\necho b >- \n}\nelse\n{\necho c >- \n}\n",
        );
        assert_eq!(s.root.children.len(), 3);
        assert!(s.root.children[0].if_cond.is_some());
        assert!(!s.root.children[0].if_chain);
        assert!(s.root.children[1].if_cond.is_some());
        assert!(s.root.children[1].if_chain);
        assert!(s.root.children[2].if_cond.is_none());
        assert!(s.root.children[2].if_chain);
    }

    #[test]
    fn test_command_if_in_test() {
        let s = parse("if true\necho a >- \nelse\necho b >- \nend\n");
        assert_eq!(s.root.children.len(), 1);
        let t = &s.root.children[0];
        assert_eq!(t.kind, ScopeKind::Test);
        let types: Vec<_> = t.setup.iter().map(|l| l.ty).collect();
        assert_eq!(
            types,
            vec![
                LineType::CmdIf,
                LineType::Cmd,
                LineType::CmdElse,
                LineType::Cmd,
                LineType::CmdEnd
            ]
        );
    }

    #[test]
    fn test_while_loop_lines() {
        let s = parse("while test -f x\nrm x\nend\n");
        let t = &s.root.children[0];
        let types: Vec<_> = t.setup.iter().map(|l| l.ty).collect();
        assert_eq!(types, vec![LineType::CmdWhile, LineType::Cmd, LineType::CmdEnd]);
    }

    #[test]
    fn test_for_args() {
        let s = parse("for x: a b c\necho $x >- \nend\n");
        let t = &s.root.children[0];
        assert_eq!(t.setup[0].ty, LineType::CmdForArgs);
    }

    #[test]
    fn test_include_directive() {
        let dir = tempfile::tempdir().unwrap();
        let inc = dir.path().join("common.testscript");
        std::fs::write(&inc, "echo shared >- \n").unwrap();
        let main = dir.path().join("main.testscript");
        let text = format!(".include --once {}\necho own >- \n", inc.display());

        let s = Parser::new(main, &text).parse().unwrap();
        assert_eq!(s.root.children.len(), 2);
        // The included test's synthetic id carries the include prefix.
        assert_eq!(s.root.children[0].id, "common-1");
    }

    #[test]
    fn test_syntax_directive() {
        let s = parse("testscript.syntax = 1\necho hi >- \n");
        assert_eq!(s.syntax, 1);

        let r = Parser::new("t", "echo hi >- \ntestscript.syntax = 1\n").parse();
        assert!(r.is_err());
    }

    #[test]
    fn test_var_after_children_is_teardown() {
        let s = parse("{{\necho a >- \nx = 1\n}}\n");
        let g = &s.root.children[0];
        assert_eq!(g.teardown.len(), 1);
        assert_eq!(g.teardown[0].ty, LineType::Var);
    }
}
