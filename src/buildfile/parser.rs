//! Buildfile Parser
//!
//! Recursive-descent parser that evaluates the build language as it
//! goes: names are expanded, variables assigned, targets and
//! prerequisites entered into the build state, rules and recipes
//! registered. The lexer modes are driven from here.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::buildfile::functions;
use crate::buildfile::lexer::{Lexer, Mode, QuoteType, Token, TokenType};
use crate::buildfile::pattern::{self, PatternGroup};
use crate::context::Context;
use crate::diag::{Location, ParseError};
use crate::names::{self, Name, Names, PatternKind, Value, ValueType};
use crate::rule::{AdhocPatternRule, AdhocRecipe, RecipeLang};
use crate::scope::{Scope, TypePatternVars};
use crate::target::{self, DeclKind, Prerequisite, Target, TargetType};
use crate::variable::{VariableMap, Visibility};

type PResult<T> = Result<T, ParseError>;

/// Attributes parsed from a `[...]` block.
#[derive(Debug, Clone, Default)]
pub struct Attributes {
    pub items: Vec<(String, Option<String>)>,
}

impl Attributes {
    pub fn has(&self, name: &str) -> bool {
        self.items.iter().any(|(n, _)| n == name)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.items
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, v)| v.as_deref())
    }

    /// The first item that names a value type, if any.
    pub fn value_type(&self) -> Option<ValueType> {
        self.items
            .iter()
            .filter(|(_, v)| v.is_none())
            .find_map(|(n, _)| ValueType::parse(n))
    }
}

pub struct Parser<'a> {
    ctx: &'a Context,
    lexer: Lexer,
    path: Arc<PathBuf>,
    scope: Arc<Scope>,
    root: Arc<Scope>,
    /// Pattern base directory (the scope's src directory).
    pbase: PathBuf,
    peeked: Option<Token>,
    /// Eval-context depth; subscripts are only recognized inside.
    eval_depth: usize,
    /// Keep path patterns unexpanded (dependency left-hand sides and
    /// the prerequisites of pattern rules).
    defer_patterns: bool,
}

impl<'a> Parser<'a> {
    pub fn new(ctx: &'a Context, root: Arc<Scope>, path: impl Into<PathBuf>, text: &str) -> Self {
        let path = Arc::new(path.into());
        let pbase = root
            .src_path
            .read()
            .unwrap()
            .clone()
            .unwrap_or_else(|| root.out_path.clone());
        Self {
            ctx,
            lexer: Lexer::new(text),
            path,
            scope: root.clone(),
            root,
            pbase,
            peeked: None,
            eval_depth: 0,
            defer_patterns: false,
        }
    }

    /// Parse a whole buildfile.
    pub fn parse(&mut self) -> PResult<()> {
        self.parse_clauses(None)
    }

    // -- Token plumbing ---------------------------------------------------

    fn next(&mut self) -> PResult<Token> {
        if let Some(t) = self.peeked.take() {
            return Ok(t);
        }
        self.lexer
            .next()
            .map_err(|e| ParseError::new(Location::new(self.path.clone(), e.line, e.column), e.message))
    }

    fn peek(&mut self) -> PResult<&Token> {
        if self.peeked.is_none() {
            let t = self.next()?;
            self.peeked = Some(t);
        }
        Ok(self.peeked.as_ref().unwrap())
    }

    fn loc(&self, t: &Token) -> Location {
        Location::new(self.path.clone(), t.line, t.column)
    }

    fn err<T>(&self, t: &Token, msg: impl Into<String>) -> PResult<T> {
        Err(ParseError::new(self.loc(t), msg))
    }

    fn expect(&mut self, tt: TokenType) -> PResult<Token> {
        let t = self.next()?;
        if t.token_type != tt {
            return self.err(
                &t,
                format!("expected {} instead of '{}'", tt.as_str(), t.value),
            );
        }
        Ok(t)
    }

    fn skip_newlines(&mut self) -> PResult<()> {
        while self.peek()?.token_type == TokenType::Newline {
            self.next()?;
        }
        Ok(())
    }

    /// Push a lexer mode. A peeked token was lexed in the previous mode;
    /// that is fine for the token types the callers peek for (mode
    /// switches happen at punctuation boundaries).
    fn mode(&mut self, m: Mode) {
        self.lexer.push_mode(m);
    }

    fn pop_mode(&mut self) {
        self.lexer.pop_mode();
    }

    // -- Clauses ----------------------------------------------------------

    /// Parse clauses until EOS or the given closing token.
    fn parse_clauses(&mut self, until: Option<TokenType>) -> PResult<()> {
        loop {
            self.skip_newlines()?;
            let t = self.peek()?.clone();

            if t.token_type == TokenType::Eos {
                if let Some(u) = until {
                    return self.err(&t, format!("expected {} before end of file", u.as_str()));
                }
                return Ok(());
            }
            if Some(t.token_type) == until {
                return Ok(());
            }

            self.parse_clause()?;
        }
    }

    fn parse_clause(&mut self) -> PResult<()> {
        let t = self.peek()?.clone();

        match t.token_type {
            TokenType::Word => {
                if let Some(()) = self.try_parse_directive(&t)? {
                    return Ok(());
                }
                self.parse_line_start(None)
            }
            TokenType::LSBrace => {
                // Leading attributes apply to the variable or value that
                // follows.
                let attrs = self.parse_attributes()?;
                self.parse_line_start(Some(attrs))
            }
            TokenType::LBrace | TokenType::Dollar | TokenType::LParen => self.parse_line_start(None),
            _ => self.err(&t, format!("unexpected '{}'", t.value)),
        }
    }

    /// A line that is a dependency declaration, a variable assignment, or
    /// a scope block.
    fn parse_line_start(&mut self, attrs: Option<Attributes>) -> PResult<()> {
        let start = self.peek()?.clone();

        // Left-hand-side patterns stay unexpanded: they may be pattern
        // rule primaries or type/pattern variable qualifications.
        self.defer_patterns = true;
        let ns = self.parse_names(false);
        self.defer_patterns = false;
        let ns = ns?;

        // Ad hoc member group: tgt<member...>.
        let mut members = Vec::new();
        if self.peek()?.token_type == TokenType::LABrace {
            self.next()?;
            members = self.parse_names(false)?;
            self.expect(TokenType::RABrace)?;
        }

        let t = self.next()?;
        match t.token_type {
            TokenType::Assign | TokenType::Append | TokenType::Prepend => {
                self.parse_variable_assignment(&start, ns, t.token_type, attrs, None)
            }
            TokenType::Colon => self.parse_dependency(&start, ns, members, attrs),
            _ => self.err(&t, format!("expected ':' or '=' instead of '{}'", t.value)),
        }
    }

    // -- Variables --------------------------------------------------------

    /// `[attrs] var (=|+=|=+) value` with the name names already parsed.
    fn parse_variable_assignment(
        &mut self,
        at: &Token,
        name_ns: Names,
        op: TokenType,
        attrs: Option<Attributes>,
        target_vars: Option<&mut VariableMap>,
    ) -> PResult<()> {
        let name = match name_ns.as_slice() {
            [n] if n.is_simple() && !n.value.is_empty() => n.value.clone(),
            _ => return self.err(at, "expected variable name"),
        };

        let attrs = attrs.unwrap_or_default();

        let visibility = match attrs.get("visibility") {
            Some("global") => Visibility::Global,
            Some("project") => Visibility::Project,
            Some("scope") | None => Visibility::Scope,
            Some("target") => Visibility::Target,
            Some("prereq") => Visibility::Prereq,
            Some(v) => return self.err(at, format!("invalid visibility '{}'", v)),
        };
        let overridable = attrs.has("overridable") || attrs.has("config");
        let ty = attrs.value_type();

        let var = self.ctx.var_pool.insert(&name, visibility, overridable, ty);

        let mut value = self.parse_value()?;

        // Value attributes were parsed as part of the value names when
        // present at the start; the [null] attribute is handled there.
        if let Some(t) = var.ty() {
            if !value.null {
                value
                    .convert_to(t)
                    .map_err(|e| ParseError::new(self.loc(at), e.to_string()))?;
            }
        }

        let map_op = |m: &mut VariableMap| -> Result<(), crate::names::ConvertError> {
            match op {
                TokenType::Assign => m.assign(&var, value.clone()),
                TokenType::Append => m.append(&var, value.clone()),
                _ => m.prepend(&var, value.clone()),
            }
        };

        let r = match target_vars {
            Some(m) => map_op(m),
            None => map_op(&mut self.scope.vars.write().unwrap()),
        };
        r.map_err(|e| ParseError::new(self.loc(at), e.to_string()))
    }

    /// Parse a value: names in value mode until newline.
    fn parse_value(&mut self) -> PResult<Value> {
        self.mode(Mode::Value);
        let r = self.parse_value_in_mode();
        self.pop_mode();
        r
    }

    fn parse_value_in_mode(&mut self) -> PResult<Value> {
        // Leading value attributes: [null], [uint64], ...
        let mut null = false;
        let mut ty = None;
        if self.peek()?.token_type == TokenType::LSBrace {
            let at = self.peek()?.clone();
            let attrs = self.parse_attributes()?;
            if attrs.has("null") {
                null = true;
            }
            ty = attrs.value_type();
            if ty.is_none() && !null && !attrs.items.is_empty() {
                return self.err(&at, format!("unknown value attribute '{}'", attrs.items[0].0));
            }
        }

        if null {
            // Nothing may follow.
            let t = self.peek()?;
            if !t.is_eol() {
                let t = t.clone();
                return self.err(&t, "expected newline after null value");
            }
            let mut v = Value::null();
            v.ty = ty;
            return Ok(v);
        }

        let ns = self.parse_names(false)?;
        let mut v = Value::from_names(ns);
        if let Some(t) = ty {
            v.convert_to(t).map_err(|e| {
                let t = self.peeked.clone();
                ParseError::new(
                    t.map(|t| self.loc(&t)).unwrap_or_default(),
                    e.to_string(),
                )
            })?;
        }
        Ok(v)
    }

    /// Parse `[...]` attributes; the opening bracket is still unread.
    fn parse_attributes(&mut self) -> PResult<Attributes> {
        self.expect(TokenType::LSBrace)?;
        self.mode(Mode::Attributes);

        let mut attrs = Attributes::default();
        loop {
            let t = self.next()?;
            match t.token_type {
                TokenType::RSBrace => break,
                TokenType::Comma => continue,
                TokenType::Word => {
                    let name = t.value.clone();
                    if self.peek()?.token_type == TokenType::Assign {
                        self.next()?;
                        let vt = self.next()?;
                        if vt.token_type != TokenType::Word {
                            return self.err(&vt, "expected attribute value");
                        }
                        attrs.items.push((name, Some(vt.value)));
                    } else {
                        attrs.items.push((name, None));
                    }
                }
                _ => return self.err(&t, format!("expected attribute instead of '{}'", t.value)),
            }
        }

        self.pop_mode();
        Ok(attrs)
    }

    // -- Names ------------------------------------------------------------

    /// True if the token ends a name list in the current context.
    fn ends_names(&self, t: &Token) -> bool {
        matches!(
            t.token_type,
            TokenType::Newline
                | TokenType::Eos
                | TokenType::Colon
                | TokenType::Assign
                | TokenType::Append
                | TokenType::Prepend
                | TokenType::RBrace
                | TokenType::RParen
                | TokenType::LABrace
                | TokenType::RABrace
                | TokenType::Comma
                | TokenType::RSBrace
                | TokenType::MultiLBrace
                | TokenType::Percent
                | TokenType::Alternative
                | TokenType::EqEq
                | TokenType::NotEq
                | TokenType::LessThan
                | TokenType::GreaterThan
                | TokenType::LessEq
                | TokenType::GreaterEq
                | TokenType::LogAnd
                | TokenType::LogOr
                | TokenType::Quest
        )
    }

    /// Parse one logical name list.
    pub fn parse_names(&mut self, curly: bool) -> PResult<Names> {
        let mut ns: Names = Vec::new();
        // Whether the last element is open for concatenation (the next
        // unseparated token continues it).
        let mut open = false;
        // A typed value pending concatenation.
        let mut pending: Option<(Value, Location)> = None;

        loop {
            let t = self.peek()?.clone();

            if self.ends_names(&t) {
                break;
            }

            let concat = !t.separated && (open || pending.is_some());

            match t.token_type {
                TokenType::Word => {
                    self.next()?;

                    // Type/dir qualification of a group: `[proj%][dir/]type{...`.
                    if self.peek()?.token_type == TokenType::LBrace && !self.peek()?.separated {
                        let (proj, qual) = match t.value.find('%') {
                            Some(i) => (
                                Some(t.value[..i].to_string()),
                                t.value[i + 1..].to_string(),
                            ),
                            None => (None, t.value.clone()),
                        };
                        let (dir, ty) = split_qualifier(&qual);
                        self.next()?; // {
                        let mut group = self.parse_group(&t, dir.as_deref(), Some(&ty))?;
                        if let Some(p) = proj {
                            for n in &mut group {
                                if n.proj.is_none() {
                                    n.proj = Some(p.clone());
                                }
                            }
                        }
                        let group = self.maybe_cross(group)?;
                        self.flush_pending(&mut ns, &mut pending)?;
                        ns.extend(group);
                        open = false;
                        continue;
                    }

                    if concat {
                        self.concat_text(&mut ns, &mut pending, &t)?;
                    } else {
                        self.flush_pending(&mut ns, &mut pending)?;
                        let n = self.word_to_name(&t, curly)?;
                        match n {
                            WordNames::One(n) => {
                                ns.push(n);
                                open = true;
                                continue;
                            }
                            WordNames::Expanded(mut v) => {
                                ns.append(&mut v);
                                open = false;
                                continue;
                            }
                        }
                    }
                    open = true;
                }

                TokenType::LBrace => {
                    self.next()?;
                    let group = self.parse_group(&t, None, None)?;
                    let group = self.maybe_cross(group)?;
                    self.flush_pending(&mut ns, &mut pending)?;
                    ns.extend(group);
                    open = false;
                }

                TokenType::Dollar | TokenType::LParen => {
                    let v = self.parse_expansion()?;
                    let nt = self.peek()?.clone();

                    if concat {
                        self.concat_value(&mut ns, &mut pending, v, &t)?;
                        open = false;
                    } else if !nt.is_eol() && !nt.separated && !self.ends_names(&nt) {
                        // Text follows unseparated: hold for concat.
                        self.flush_pending(&mut ns, &mut pending)?;
                        pending = Some((v, self.loc(&t)));
                        open = false;
                    } else {
                        self.flush_pending(&mut ns, &mut pending)?;
                        self.splice_value(&mut ns, v, &t)?;
                        open = false;
                    }
                }

                TokenType::Pair => {
                    self.next()?;
                    self.flush_pending(&mut ns, &mut pending)?;
                    match ns.last_mut() {
                        Some(n) if n.pair.is_none() => n.pair = Some('@'),
                        _ => return self.err(&t, "pair separator without left-hand side"),
                    }
                    open = false;
                }

                _ => return self.err(&t, format!("unexpected '{}' in name", t.value)),
            }
        }

        self.flush_pending(&mut ns, &mut pending)?;

        // A trailing pair flag with nothing after it is malformed.
        if let Some(n) = ns.last() {
            if n.pair.is_some() {
                let t = self.peek()?.clone();
                return self.err(&t, "pair separator without right-hand side");
            }
        }

        Ok(ns)
    }

    /// Flush a pending typed value into the names list unconcatenated.
    fn flush_pending(
        &mut self,
        ns: &mut Names,
        pending: &mut Option<(Value, Location)>,
    ) -> PResult<()> {
        if let Some((v, _)) = pending.take() {
            if !v.null {
                ns.extend(v.names);
            }
        }
        Ok(())
    }

    /// Splice an expansion result into the name list.
    fn splice_value(&mut self, ns: &mut Names, v: Value, at: &Token) -> PResult<()> {
        if v.null {
            return Ok(());
        }
        let _ = at;
        ns.extend(v.names);
        Ok(())
    }

    /// Concatenate following text into the last name or pending value.
    fn concat_text(
        &mut self,
        ns: &mut Names,
        pending: &mut Option<(Value, Location)>,
        t: &Token,
    ) -> PResult<()> {
        if let Some((v, _)) = pending.take() {
            let combined = self.concat_typed_text(&v, &t.value, t)?;
            // The combined result may itself be continued.
            *pending = Some((combined, self.loc(t)));
            return Ok(());
        }

        match ns.last_mut() {
            Some(n) => {
                // Continue the value part; a '/'-containing fragment
                // re-splits dir/value.
                n.value.push_str(&t.value);
                if n.ty.is_empty() && n.value.contains('/') {
                    let full = std::mem::take(&mut n.value);
                    let (d, v) = split_dir(&full);
                    if let Some(d) = d {
                        n.dir = n.dir.join(d);
                    }
                    n.value = v;
                }
                Ok(())
            }
            None => self.err(t, "nothing to concatenate to"),
        }
    }

    /// Concatenate an expansion value onto the preceding text.
    fn concat_value(
        &mut self,
        ns: &mut Names,
        pending: &mut Option<(Value, Location)>,
        v: Value,
        at: &Token,
    ) -> PResult<()> {
        if v.null || v.names.is_empty() {
            return Ok(());
        }

        if let Some((p, _)) = pending.take() {
            // typed ++ typed: degrade through strings when possible.
            let rhs = v
                .as_string()
                .map_err(|_| self.concat_err(at, &p))?;
            let combined = self.concat_typed_text(&p, &rhs, at)?;
            *pending = Some((combined, self.loc(at)));
            return Ok(());
        }

        if v.ty.is_some() && v.names.len() == 1 {
            // text ++ typed: typed side must stringify.
            let rhs = v.as_string().map_err(|_| self.concat_err(at, &v))?;
            match ns.last_mut() {
                Some(n) => {
                    n.value.push_str(&rhs);
                    Ok(())
                }
                None => self.err(at, "nothing to concatenate to"),
            }
        } else if v.names.len() == 1 && v.names[0].is_simple() {
            match ns.last_mut() {
                Some(n) => {
                    n.value.push_str(&v.names[0].value);
                    Ok(())
                }
                None => self.err(at, "nothing to concatenate to"),
            }
        } else {
            self.err(
                at,
                "concatenating expansion of a multi-name value (use quoting to force untyped concatenation)",
            )
        }
    }

    fn concat_err(&self, at: &Token, v: &Value) -> ParseError {
        ParseError::new(
            self.loc(at),
            format!(
                "no '{}' concatenation support (use quoting to force untyped concatenation)",
                v.ty.map(|t| t.name()).unwrap_or("names")
            ),
        )
    }

    fn concat_typed_text(&self, v: &Value, text: &str, at: &Token) -> PResult<Value> {
        if v.ty.is_none() {
            // Untyped single name: plain string concatenation.
            if v.names.len() == 1 && v.names[0].is_simple() {
                let mut v = v.clone();
                v.names[0].value.push_str(text);
                return Ok(v);
            }
        }
        functions::concat_typed(v, text).ok_or_else(|| self.concat_err(at, v))
    }

    /// After a group, an adjacent second group forms a Cartesian product.
    fn maybe_cross(&mut self, first: Names) -> PResult<Names> {
        let t = self.peek()?.clone();
        if t.token_type != TokenType::LBrace || t.separated {
            return Ok(first);
        }
        self.next()?;
        let second = self.parse_group(&t, None, None)?;
        let second = self.maybe_cross(second)?;

        let mut out = Names::new();
        for a in &first {
            for b in &second {
                let mut n = a.clone();
                n.value = format!("{}{}", a.value, b.value);
                if !b.ty.is_empty() {
                    n.ty = b.ty.clone();
                }
                if !b.dir.as_os_str().is_empty() {
                    n.dir = n.dir.join(&b.dir);
                }
                out.push(n);
            }
        }
        Ok(out)
    }

    /// Parse a `{...}` group, applying dir/type qualification and
    /// handling pattern members with inclusion/exclusion groups.
    fn parse_group(
        &mut self,
        at: &Token,
        dir: Option<&str>,
        ty: Option<&str>,
    ) -> PResult<Names> {
        let mut members: Names = Vec::new();
        let mut groups: Vec<PatternGroup> = Vec::new();
        let mut has_pattern = false;

        loop {
            self.skip_newlines()?;
            let t = self.peek()?.clone();
            if t.token_type == TokenType::RBrace {
                self.next()?;
                break;
            }
            if t.token_type == TokenType::Eos {
                return self.err(&t, "expected '}' before end of file");
            }

            // Inclusion/exclusion groups: +{...} / -{...}.
            if t.token_type == TokenType::Word && (t.value == "+" || t.value == "-") {
                self.next()?;
                let b = self.peek()?.clone();
                if b.token_type == TokenType::LBrace && !b.separated {
                    self.next()?;
                    let inner = self.parse_group(&b, None, None)?;
                    groups.push(PatternGroup {
                        include: t.value == "+",
                        patterns: inner.into_iter().map(|n| n.value).collect(),
                    });
                    continue;
                }
                // A bare +/- word.
                members.push(Name::simple(t.value.clone()));
                continue;
            }

            let ns = self.parse_names(true)?;
            if ns.is_empty() {
                let t = self.peek()?.clone();
                if !matches!(
                    t.token_type,
                    TokenType::RBrace | TokenType::Comma | TokenType::Newline
                ) {
                    return self.err(&t, format!("unexpected '{}' in group", t.value));
                }
            }
            for n in &ns {
                if n.pattern.is_some() {
                    has_pattern = true;
                }
            }
            members.extend(ns);

            // Groups may contain commas in some contexts; skip them.
            if self.peek()?.token_type == TokenType::Comma {
                self.next()?;
            }
        }

        let _ = at;

        let mut out: Names = Vec::new();
        if has_pattern && !self.defer_patterns {
            let base = match dir {
                Some(d) if Path::new(d).is_absolute() => PathBuf::from(d),
                Some(d) => self.pbase.join(d),
                None => self.pbase.clone(),
            };
            for m in members {
                if m.pattern == Some(PatternKind::Path) {
                    let expanded = pattern::expand_path_pattern(
                        &base,
                        &m.value,
                        &groups,
                        ty.unwrap_or(""),
                    );
                    if expanded.is_empty() {
                        // Keep the unexpanded pattern: in a dependency
                        // it contributes nothing; as an all-pattern
                        // primary with a body it forms a pattern rule.
                        out.push(m);
                    } else {
                        out.extend(expanded);
                    }
                } else {
                    out.push(m);
                }
            }
        } else {
            out = members;
        }

        // Apply qualification.
        for n in &mut out {
            if let Some(ty) = ty {
                if n.ty.is_empty() {
                    n.ty = ty.to_string();
                }
            }
            if let Some(d) = dir {
                if n.pattern != Some(PatternKind::Path) {
                    // Pattern expansion already produced dir-relative
                    // names against the qualified base.
                    n.dir = Path::new(d).join(&n.dir);
                }
            }
        }

        Ok(out)
    }

    /// Interpret a word token as a name (or an inline pattern
    /// expansion).
    fn word_to_name(&mut self, t: &Token, curly: bool) -> PResult<WordNames> {
        let mut rest = t.value.as_str();
        let mut proj = None;

        if let Some(i) = rest.find('%') {
            proj = Some(rest[..i].to_string());
            rest = &rest[i + 1..];
        }

        // Pattern detection on the whole (dir-containing) value. Path
        // patterns require the word fully unquoted; for the regex
        // flavors the marker being unquoted is enough (the expression
        // is conventionally quoted: `~'/re/'`).
        let detected = if !t.quote_first {
            match pattern::classify(rest, curly) {
                Some(PatternKind::Path) if t.quote != QuoteType::Unquoted => None,
                k => k,
            }
        } else {
            None
        };

        if let Some(k) = detected {
            {
                match k {
                    PatternKind::Path if !curly && !self.defer_patterns => {
                        // An inline pattern expands right here with no
                        // inclusion/exclusion groups.
                        let (d, leaf) = split_dir(rest);
                        let base = match &d {
                            Some(d) if Path::new(d).is_absolute() => PathBuf::from(d),
                            Some(d) => self.pbase.join(d),
                            None => self.pbase.clone(),
                        };
                        let expanded = pattern::expand_path_pattern(&base, &leaf, &[], "");
                        let mut out = Names::new();
                        for mut n in expanded {
                            if let Some(d) = &d {
                                n.dir = Path::new(d).join(&n.dir);
                            }
                            n.proj = proj.clone();
                            out.push(n);
                        }
                        return Ok(WordNames::Expanded(out));
                    }
                    k => {
                        let mut n = Name::simple(rest);
                        n.proj = proj;
                        n.pattern = Some(k);
                        return Ok(WordNames::One(n));
                    }
                }
            }
        }

        let (d, leaf) = split_dir(rest);
        let mut n = Name::simple(leaf);
        n.proj = proj;
        if let Some(d) = d {
            n.dir = PathBuf::from(d);
        }
        Ok(WordNames::One(n))
    }

    // -- Expansion --------------------------------------------------------

    /// Parse `$var`, `$fn(args)`, or `(eval)`.
    fn parse_expansion(&mut self) -> PResult<Value> {
        let t = self.next()?;

        if t.token_type == TokenType::LParen {
            return self.parse_eval(&t);
        }

        debug_assert_eq!(t.token_type, TokenType::Dollar);
        self.mode(Mode::Variable);
        let name_t = self.next()?;
        self.pop_mode();

        match name_t.token_type {
            TokenType::LParen => {
                // $(...): the eval result names the variable.
                let v = self.parse_eval(&name_t)?;
                let name = v.as_string().map_err(|e| {
                    ParseError::new(self.loc(&name_t), format!("invalid variable name: {}", e))
                })?;
                let v = self.lookup(&name);
                self.maybe_subscript(v)
            }
            TokenType::Word => {
                // Function call?
                let next_is_call = {
                    let p = self.peek()?;
                    p.token_type == TokenType::LParen && !p.separated
                };
                if next_is_call {
                    let open = self.next()?;
                    let args = self.parse_eval_args(&open)?;
                    let f = functions::find(&name_t.value).ok_or_else(|| {
                        ParseError::new(
                            self.loc(&name_t),
                            format!("unknown function '{}'", name_t.value),
                        )
                    })?;
                    let v = f(&args)
                        .map_err(|m| ParseError::new(self.loc(&name_t), m))?;
                    self.maybe_subscript(v)
                } else {
                    let v = self.lookup(&name_t.value);
                    self.maybe_subscript(v)
                }
            }
            _ => self.err(&name_t, "expected variable or function name after '$'"),
        }
    }

    /// Value subscript `[index]`, recognized inside eval contexts only
    /// (outside it would collide with wildcard character classes).
    fn maybe_subscript(&mut self, v: Value) -> PResult<Value> {
        if self.eval_depth == 0 {
            return Ok(v);
        }
        let open = {
            let p = self.peek()?;
            p.token_type == TokenType::LSBrace && !p.separated
        };
        if !open {
            return Ok(v);
        }
        self.next()?;
        self.mode(Mode::Subscript);
        let idx = self.next()?;
        self.pop_mode();
        if idx.token_type != TokenType::Word {
            return self.err(&idx, "expected subscript index");
        }
        let i: u64 = idx
            .value
            .parse()
            .map_err(|_| ParseError::new(self.loc(&idx), format!("invalid subscript index '{}'", idx.value)))?;
        self.expect(TokenType::RSBrace)?;
        Ok(v.subscript(i))
    }

    /// Variable lookup through the current scope chain. An undefined
    /// variable expands to null.
    fn lookup(&self, name: &str) -> Value {
        match self.ctx.var_pool.find(name) {
            Some(var) => self.scope.find_value(&var).unwrap_or_else(Value::null),
            None => Value::null(),
        }
    }

    /// Comma-separated eval arguments after an already-consumed `(`.
    fn parse_eval_args(&mut self, open: &Token) -> PResult<Vec<Value>> {
        self.mode(Mode::Eval);
        self.eval_depth += 1;

        let mut args = Vec::new();
        loop {
            let t = self.peek()?.clone();
            match t.token_type {
                TokenType::RParen => {
                    self.next()?;
                    break;
                }
                TokenType::Comma => {
                    self.next()?;
                }
                TokenType::Eos => {
                    self.eval_depth -= 1;
                    self.pop_mode();
                    return self.err(open, "unterminated function call");
                }
                _ => {
                    let ns = self.parse_names(false)?;
                    args.push(Value::from_names(ns));
                }
            }
        }

        self.eval_depth -= 1;
        self.pop_mode();
        Ok(args)
    }

    /// Eval context `(...)`: comparison and logical expressions over
    /// values. The opening paren has been consumed.
    fn parse_eval(&mut self, open: &Token) -> PResult<Value> {
        self.mode(Mode::Eval);
        self.eval_depth += 1;
        let r = self.parse_eval_or(open);
        self.eval_depth -= 1;
        self.pop_mode();
        let v = r?;
        self.expect(TokenType::RParen)?;
        Ok(v)
    }

    fn parse_eval_or(&mut self, open: &Token) -> PResult<Value> {
        let mut lhs = self.parse_eval_and(open)?;
        while self.peek()?.token_type == TokenType::LogOr {
            let t = self.next()?;
            let l = self.eval_bool(&lhs, &t)?;
            let rhs = self.parse_eval_and(open)?;
            if l {
                lhs = Value::from_bool(true);
            } else {
                lhs = Value::from_bool(self.eval_bool(&rhs, &t)?);
            }
        }
        Ok(lhs)
    }

    fn parse_eval_and(&mut self, open: &Token) -> PResult<Value> {
        let mut lhs = self.parse_eval_comparison(open)?;
        while self.peek()?.token_type == TokenType::LogAnd {
            let t = self.next()?;
            let l = self.eval_bool(&lhs, &t)?;
            let rhs = self.parse_eval_comparison(open)?;
            if !l {
                lhs = Value::from_bool(false);
            } else {
                lhs = Value::from_bool(self.eval_bool(&rhs, &t)?);
            }
        }
        Ok(lhs)
    }

    fn parse_eval_comparison(&mut self, open: &Token) -> PResult<Value> {
        let lhs = self.parse_eval_operand(open)?;
        let t = self.peek()?.clone();
        let op = match t.token_type {
            TokenType::EqEq => "==",
            TokenType::NotEq => "!=",
            TokenType::LessThan => "<",
            TokenType::GreaterThan => ">",
            TokenType::LessEq => "<=",
            TokenType::GreaterEq => ">=",
            _ => return Ok(lhs),
        };
        self.next()?;
        let rhs = self.parse_eval_operand(open)?;

        let ls = names::to_string(&lhs.names);
        let rs = names::to_string(&rhs.names);

        // Numeric comparison when both sides parse as integers.
        let r = match (ls.parse::<u64>(), rs.parse::<u64>()) {
            (Ok(a), Ok(b)) => match op {
                "==" => a == b,
                "!=" => a != b,
                "<" => a < b,
                ">" => a > b,
                "<=" => a <= b,
                _ => a >= b,
            },
            _ => match op {
                "==" => ls == rs,
                "!=" => ls != rs,
                "<" => ls < rs,
                ">" => ls > rs,
                "<=" => ls <= rs,
                _ => ls >= rs,
            },
        };
        Ok(Value::from_bool(r))
    }

    fn parse_eval_operand(&mut self, open: &Token) -> PResult<Value> {
        let t = self.peek()?.clone();
        match t.token_type {
            TokenType::Not => {
                self.next()?;
                let v = self.parse_eval_operand(open)?;
                let b = self.eval_bool(&v, &t)?;
                Ok(Value::from_bool(!b))
            }
            TokenType::LParen => {
                self.next()?;
                self.parse_eval(&t)
            }
            TokenType::Eos => self.err(&t, "unterminated eval context"),
            _ => {
                let ns = self.parse_names(false)?;
                Ok(Value::from_names(ns))
            }
        }
    }

    fn eval_bool(&self, v: &Value, at: &Token) -> PResult<bool> {
        v.as_bool()
            .map_err(|e| ParseError::new(self.loc(at), e.to_string()))
    }

    // -- Dependencies -----------------------------------------------------

    fn parse_dependency(
        &mut self,
        at: &Token,
        lhs: Names,
        members: Names,
        _attrs: Option<Attributes>,
    ) -> PResult<()> {
        // Scope block: `dir/:` followed by a brace block.
        if members.is_empty() && lhs.len() == 1 && lhs[0].is_dir() {
            if self.peek()?.token_type == TokenType::Newline {
                self.next()?;
                self.skip_newlines()?;
                if self.peek()?.token_type == TokenType::LBrace {
                    return self.parse_scope_block(&lhs[0]);
                }
                // A directory declaration with no prerequisites and no
                // block is a no-op.
                return Ok(());
            }
        }

        // Pattern-rule prerequisites must keep their patterns; the
        // stems substitute per matched target at execution time.
        let all_patterns = !lhs.is_empty() && lhs.iter().all(|n| n.pattern.is_some());

        self.defer_patterns = all_patterns;
        let rhs = self.parse_names(false);
        self.defer_patterns = false;
        let rhs = rhs?;

        // Inline target-specific variable: `tgt...: var = value`.
        let nt = self.peek()?.clone();
        if matches!(
            nt.token_type,
            TokenType::Assign | TokenType::Append | TokenType::Prepend
        ) {
            self.next()?;
            return self.parse_target_variable(at, &lhs, rhs, nt.token_type);
        }

        if nt.token_type == TokenType::Colon {
            // Dependency chain: the rhs become targets of the next
            // segment.
            self.next()?;
            self.enter_dependency(at, &lhs, &members, &rhs)?;
            return self.parse_dependency(at, rhs, Names::new(), None);
        }

        if nt.token_type == TokenType::Newline || nt.token_type == TokenType::Eos {
            self.next()?;
        }

        // Pattern rule: all primaries are patterns and a body follows.
        self.skip_newlines()?;
        let has_body = matches!(
            self.peek()?.token_type,
            TokenType::LBrace | TokenType::Percent | TokenType::MultiLBrace
        );

        if all_patterns && has_body {
            let recipes = self.parse_recipes()?;
            let mut targets = Vec::new();
            for n in &lhs {
                let ty = self.name_type(n, at)?;
                targets.push((ty, n.value.clone()));
            }
            let rule = Arc::new(AdhocPatternRule {
                targets,
                prereqs: rhs,
                recipes,
                location: self.loc(at),
            });
            self.scope.register_adhoc_rule(rule);
            // The adapter that matches and runs these is registered
            // once per scope.
            if !self
                .scope
                .rules_for(crate::action::Operation::Update)
                .iter()
                .any(|r| r.name() == "adhoc")
            {
                self.scope
                    .register_rule(None, Arc::new(crate::buildfile::adhoc::AdhocRuleAdapter));
            }
            return Ok(());
        }

        let targets = self.enter_dependency(at, &lhs, &members, &rhs)?;

        // Optional target variable block and recipes.
        if self.peek()?.token_type == TokenType::LBrace {
            self.next()?;
            self.expect(TokenType::Newline)?;
            loop {
                self.skip_newlines()?;
                let t = self.peek()?.clone();
                if t.token_type == TokenType::RBrace {
                    self.next()?;
                    break;
                }
                let attrs = if t.token_type == TokenType::LSBrace {
                    Some(self.parse_attributes()?)
                } else {
                    None
                };
                let nt = self.peek()?.clone();
                let ns = self.parse_names(false)?;
                let op = self.next()?;
                if !matches!(
                    op.token_type,
                    TokenType::Assign | TokenType::Append | TokenType::Prepend
                ) {
                    return self.err(&op, "expected variable assignment in target block");
                }

                // The value is parsed once into the first target's map
                // and copied to the rest.
                let first = match targets.first() {
                    Some(f) => f.clone(),
                    None => return self.err(&nt, "variable block without target"),
                };
                {
                    let mut map = first.vars.write().unwrap();
                    self.parse_target_variable_into(&nt, &ns, op.token_type, attrs, &mut map)?;
                }
                let name = ns.first().map(|n| n.value.clone()).unwrap_or_default();
                let entry = first.vars.read().unwrap().get_entry(&name).map(|(var, v)| (var.clone(), v.clone()));
                if let Some((var, v)) = entry {
                    for tgt in targets.iter().skip(1) {
                        let _ = tgt.vars.write().unwrap().assign(&var, v.clone());
                    }
                }
            }
        }

        self.skip_newlines()?;
        if matches!(
            self.peek()?.token_type,
            TokenType::Percent | TokenType::MultiLBrace
        ) {
            let recipes = self.parse_recipes()?;
            let clean = recipes.iter().any(|r| r.applies_to(crate::action::Operation::Clean));
            for t in &targets {
                t.adhoc_recipes.write().unwrap().extend(recipes.iter().cloned());
            }
            if clean {
                // Recipes with clean semantics register a scope-level
                // callback, once per root scope.
                if let Some(r) = self.root.root.as_ref() {
                    r.register_callback_once(
                        crate::action::Operation::Clean,
                        "adhoc-recipe",
                        Arc::new(|_| {}),
                    );
                }
            }
        }

        Ok(())
    }

    /// Enter the lhs targets with members and prerequisites; returns the
    /// primary targets.
    fn enter_dependency(
        &mut self,
        at: &Token,
        lhs: &Names,
        members: &Names,
        rhs: &Names,
    ) -> PResult<Vec<Arc<Target>>> {
        let mut targets = Vec::new();

        for n in lhs {
            // An unexpanded pattern primary contributes no targets.
            if n.pattern.is_some() {
                continue;
            }
            let t = self.enter_target(n, at)?;

            for m in members {
                let mt = self.enter_target(m, at)?;
                t.add_adhoc_member(mt);
            }

            let mut prereqs = Vec::new();
            for p in rhs {
                if p.pattern.is_some() {
                    continue; // Empty expansion: zero prerequisites.
                }
                prereqs.push(self.name_to_prereq(p, at)?);
            }
            t.prerequisites.write().unwrap().extend(prereqs);
            targets.push(t);
        }

        Ok(targets)
    }

    fn name_type(&self, n: &Name, at: &Token) -> PResult<&'static TargetType> {
        if !n.ty.is_empty() {
            return TargetType::find(&n.ty)
                .ok_or_else(|| ParseError::new(self.loc(at), format!("unknown target type '{}'", n.ty)));
        }
        if n.is_dir() {
            return Ok(&target::DIR);
        }
        let (_, ext) = target::split_name(&n.value);
        Ok(ext
            .as_deref()
            .and_then(target::type_for_ext)
            .unwrap_or(&target::FILE))
    }

    fn enter_target(&mut self, n: &Name, at: &Token) -> PResult<Arc<Target>> {
        let ty = self.name_type(n, at)?;
        let dir = if n.dir.is_absolute() {
            n.dir.clone()
        } else {
            names::normalize(&self.scope.out_path.join(&n.dir))
        };
        let (name, ext) = if ty.file {
            target::split_name(&n.value)
        } else {
            (n.value.clone(), None)
        };
        let (t, _) = self.ctx.targets.insert(ty, dir, "", name, ext, DeclKind::Real);
        Ok(t)
    }

    fn name_to_prereq(&self, n: &Name, at: &Token) -> PResult<Prerequisite> {
        let ty = self.name_type(n, at)?;
        let (name, ext) = if ty.file {
            target::split_name(&n.value)
        } else {
            (n.value.clone(), None)
        };
        let dir = if n.dir.is_absolute() {
            n.dir.clone()
        } else {
            names::normalize(&self.scope.out_path.join(&n.dir))
        };
        let mut p = Prerequisite::new(ty, dir, name);
        p.ext = ext;
        p.proj = n.proj.clone();
        Ok(p)
    }

    /// `tgt...: var = value`: target-specific (or type/pattern) variable.
    fn parse_target_variable(
        &mut self,
        at: &Token,
        lhs: &Names,
        var_ns: Names,
        op: TokenType,
    ) -> PResult<()> {
        let patterns = lhs.iter().all(|n| n.pattern.is_some());
        if patterns {
            let mut map = VariableMap::new();
            self.parse_target_variable_into(at, &var_ns, op, None, &mut map)?;
            for n in lhs {
                let ty = self.name_type(n, at)?;
                // Re-assign per pattern from the one parsed map.
                let mut vars = VariableMap::new();
                for (var, v) in map.iter() {
                    let _ = vars.assign(var, v.clone());
                }
                self.scope.type_vars.write().unwrap().push(TypePatternVars {
                    ty,
                    pattern: n.value.clone(),
                    vars,
                });
            }
            return Ok(());
        }

        let mut first: Option<(Arc<Target>, String)> = None;
        for n in lhs {
            let t = self.enter_target(n, at)?;
            if let Some((ft, name)) = &first {
                if let Some((var, v)) = ft.vars.read().unwrap().get_entry(name) {
                    let _ = t.vars.write().unwrap().assign(var, v.clone());
                }
            } else {
                {
                    let mut map = t.vars.write().unwrap();
                    self.parse_target_variable_into(at, &var_ns, op, None, &mut map)?;
                }
                let name = var_ns.first().map(|n| n.value.clone()).unwrap_or_default();
                first = Some((t, name));
            }
        }
        Ok(())
    }

    fn parse_target_variable_into(
        &mut self,
        at: &Token,
        var_ns: &Names,
        op: TokenType,
        attrs: Option<Attributes>,
        map: &mut VariableMap,
    ) -> PResult<()> {
        let name = match var_ns.as_slice() {
            [n] if n.is_simple() => n.value.clone(),
            _ => return self.err(at, "expected variable name"),
        };
        let attrs = attrs.unwrap_or_default();
        let var = self.ctx.var_pool.insert(
            &name,
            Visibility::Target,
            false,
            attrs.value_type(),
        );
        let value = self.parse_value()?;
        let r = match op {
            TokenType::Assign => map.assign(&var, value),
            TokenType::Append => map.append(&var, value),
            _ => map.prepend(&var, value),
        };
        r.map_err(|e| ParseError::new(self.loc(at), e.to_string()))?;
        // Consume the line end.
        if self.peek()?.token_type == TokenType::Newline {
            self.next()?;
        }
        Ok(())
    }

    fn parse_scope_block(&mut self, dir: &Name) -> PResult<()> {
        self.expect(TokenType::LBrace)?;
        self.expect(TokenType::Newline)?;

        let out = names::normalize(&self.scope.out_path.join(&dir.dir));
        let saved_scope = self.scope.clone();
        let saved_pbase = self.pbase.clone();
        self.scope = self.scope.child(out);
        self.pbase = saved_pbase.join(&dir.dir);

        let r = self.parse_clauses(Some(TokenType::RBrace));
        self.scope = saved_scope;
        self.pbase = saved_pbase;
        r?;
        self.expect(TokenType::RBrace)?;
        Ok(())
    }

    // -- Recipes ----------------------------------------------------------

    /// Parse one or more `%`/`{{` recipe blocks.
    fn parse_recipes(&mut self) -> PResult<Vec<AdhocRecipe>> {
        let mut recipes = Vec::new();

        loop {
            self.skip_newlines()?;
            let t = self.peek()?.clone();

            let mut actions = Vec::new();
            if t.token_type == TokenType::Percent {
                self.next()?;
                // Optional [attrs] and action names until newline or {{.
                if self.peek()?.token_type == TokenType::LSBrace {
                    let _ = self.parse_attributes()?;
                }
                loop {
                    let a = self.peek()?.clone();
                    match a.token_type {
                        TokenType::Word => {
                            self.next()?;
                            match crate::action::Operation::parse(&a.value) {
                                Some(op) => actions.push(op),
                                None => {
                                    return self.err(
                                        &a,
                                        format!("unknown operation '{}'", a.value),
                                    )
                                }
                            }
                        }
                        TokenType::Newline => {
                            self.next()?;
                            break;
                        }
                        TokenType::MultiLBrace => break,
                        _ => return self.err(&a, "expected operation name"),
                    }
                }
                self.skip_newlines()?;
            } else if t.token_type != TokenType::MultiLBrace {
                break;
            }

            let open = self.expect(TokenType::MultiLBrace)?;
            let braces = open.value.len();

            // Language tag on the opening line.
            let mut lang = RecipeLang::Buildscript;
            loop {
                let lt = self.peek()?.clone();
                match lt.token_type {
                    TokenType::Word => {
                        self.next()?;
                        if lt.value == "c++" {
                            let mut version = String::new();
                            let mut separator = None;
                            while self.peek()?.token_type == TokenType::Word {
                                let w = self.next()?;
                                if version.is_empty() {
                                    version = w.value;
                                } else {
                                    separator = Some(w.value);
                                }
                            }
                            lang = RecipeLang::Cxx { version, separator };
                        } else if lt.value != "buildscript" {
                            return self.err(&lt, format!("unknown recipe language '{}'", lt.value));
                        }
                    }
                    TokenType::Newline => {
                        self.next()?;
                        break;
                    }
                    _ => return self.err(&lt, "expected recipe language"),
                }
            }

            self.lexer.push_mode(Mode::Foreign(braces));
            let body = self.next()?;
            let close = self.next()?;
            if close.token_type != TokenType::MultiRBrace || close.value.len() != braces {
                return self.err(&close, "mismatched recipe block braces");
            }

            recipes.push(AdhocRecipe {
                actions,
                lang,
                text: body.value,
                location: self.loc(&open),
            });

            self.skip_newlines()?;
            if !matches!(
                self.peek()?.token_type,
                TokenType::Percent | TokenType::MultiLBrace
            ) {
                break;
            }
        }

        Ok(recipes)
    }

    // -- Flow control and directives --------------------------------------

    /// Dispatch a directive if the word introduces one.
    fn try_parse_directive(&mut self, t: &Token) -> PResult<Option<()>> {
        let r = match t.value.as_str() {
            "if" | "if!" => {
                self.next()?;
                self.parse_if(t.value == "if!")?
            }
            "switch" => {
                self.next()?;
                self.parse_switch()?
            }
            "for" => {
                self.next()?;
                self.parse_for()?
            }
            "source" => {
                self.next()?;
                self.parse_source()?
            }
            "include" => {
                self.next()?;
                self.parse_include()?
            }
            "run" => {
                self.next()?;
                self.parse_run()?
            }
            "import" | "import?" | "import!" => {
                self.next()?;
                self.parse_import(&t.value)?
            }
            "export" => {
                self.next()?;
                self.parse_export()?
            }
            "using" | "using?" => {
                self.next()?;
                self.parse_using(t.value.ends_with('?'))?
            }
            "define" => {
                self.next()?;
                self.parse_define()?
            }
            "config" => {
                self.next()?;
                self.parse_config()?
            }
            "config.environment" => {
                self.next()?;
                self.parse_config_environment()?
            }
            "assert" | "assert!" => {
                self.next()?;
                self.parse_assert(t.value.ends_with('!'))?
            }
            "print" | "text" => {
                self.next()?;
                let v = self.parse_value()?;
                println!("{}", names::to_string(&v.names));
            }
            "info" => {
                self.next()?;
                let v = self.parse_value()?;
                tracing::info!("{}: info: {}", self.loc(t), names::to_string(&v.names));
            }
            "warn" => {
                self.next()?;
                let v = self.parse_value()?;
                tracing::warn!("{}: warning: {}", self.loc(t), names::to_string(&v.names));
            }
            "fail" => {
                self.next()?;
                let v = self.parse_value()?;
                return Err(ParseError::new(
                    self.loc(t),
                    names::to_string(&v.names),
                ));
            }
            "dump" => {
                self.next()?;
                self.parse_dump(t)?
            }
            _ => return Ok(None),
        };
        let _ = r;
        Ok(Some(()))
    }

    fn parse_condition(&mut self, at: &Token) -> PResult<bool> {
        let v = self.parse_value()?;
        v.as_bool()
            .map_err(|e| ParseError::new(self.loc(at), e.to_string()))
    }

    /// Skip a balanced `{ ... }` block without evaluating (the pre-parse
    /// path for untaken branches).
    fn skip_block(&mut self) -> PResult<()> {
        self.skip_newlines()?;
        self.expect(TokenType::LBrace)?;
        let mut depth = 1usize;
        loop {
            let t = self.next()?;
            match t.token_type {
                TokenType::LBrace => depth += 1,
                TokenType::RBrace => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(());
                    }
                }
                TokenType::MultiLBrace => {
                    // Recipe body: raw-skip to the matching line.
                    let braces = t.value.len();
                    // Consume the lang-tag line.
                    loop {
                        let lt = self.next()?;
                        if lt.is_eol() {
                            break;
                        }
                    }
                    self.lexer.push_mode(Mode::Foreign(braces));
                    self.next()?; // Body.
                    self.next()?; // Closing braces.
                }
                TokenType::Eos => {
                    return self.err(&t, "expected '}' before end of file");
                }
                _ => {}
            }
        }
    }

    fn parse_block(&mut self) -> PResult<()> {
        self.skip_newlines()?;
        self.expect(TokenType::LBrace)?;
        self.expect(TokenType::Newline)?;
        self.parse_clauses(Some(TokenType::RBrace))?;
        self.expect(TokenType::RBrace)?;
        Ok(())
    }

    fn parse_if(&mut self, mut negate: bool) -> PResult<()> {
        let mut taken = false;
        let mut at = self.peek()?.clone();

        loop {
            let mut cond = self.parse_condition(&at)?;
            if negate {
                cond = !cond;
            }
            if self.peek()?.token_type == TokenType::Newline {
                self.next()?;
            }

            if cond && !taken {
                taken = true;
                self.parse_block()?;
            } else {
                self.skip_block()?;
            }

            // elif/elif!/else?
            self.skip_newlines()?;
            let t = self.peek()?.clone();
            match (t.token_type, t.value.as_str()) {
                (TokenType::Word, "elif") | (TokenType::Word, "elif!") => {
                    self.next()?;
                    negate = t.value.ends_with('!');
                    at = t;
                    if taken {
                        // Pre-parse: consume the condition without
                        // evaluating, then skip the block.
                        let _ = self.parse_value()?;
                        if self.peek()?.token_type == TokenType::Newline {
                            self.next()?;
                        }
                        self.skip_block()?;
                        // Continue scanning for further clauses.
                        loop {
                            self.skip_newlines()?;
                            let t2 = self.peek()?.clone();
                            match (t2.token_type, t2.value.as_str()) {
                                (TokenType::Word, "elif") | (TokenType::Word, "elif!") => {
                                    self.next()?;
                                    let _ = self.parse_value()?;
                                    if self.peek()?.token_type == TokenType::Newline {
                                        self.next()?;
                                    }
                                    self.skip_block()?;
                                }
                                (TokenType::Word, "else") => {
                                    self.next()?;
                                    if self.peek()?.token_type == TokenType::Newline {
                                        self.next()?;
                                    }
                                    self.skip_block()?;
                                    return Ok(());
                                }
                                _ => return Ok(()),
                            }
                        }
                    }
                    continue;
                }
                (TokenType::Word, "else") => {
                    self.next()?;
                    if self.peek()?.token_type == TokenType::Newline {
                        self.next()?;
                    }
                    if taken {
                        self.skip_block()?;
                    } else {
                        self.parse_block()?;
                    }
                    return Ok(());
                }
                _ => return Ok(()),
            }
        }
    }

    fn parse_switch(&mut self) -> PResult<()> {
        let at = self.peek()?.clone();

        // Expressions: value [: function [arg]], ...
        self.mode(Mode::SwitchExpressions);
        let mut exprs: Vec<(Value, Option<String>)> = Vec::new();
        loop {
            let ns = self.parse_names(false)?;
            let mut func = None;
            if self.peek()?.token_type == TokenType::Colon {
                self.next()?;
                let f = self.expect(TokenType::Word)?;
                func = Some(f.value);
            }
            exprs.push((Value::from_names(ns), func));
            match self.peek()?.token_type {
                TokenType::Comma => {
                    self.next()?;
                }
                _ => break,
            }
        }
        self.pop_mode();
        if self.peek()?.token_type == TokenType::Newline {
            self.next()?;
        }

        self.skip_newlines()?;
        self.expect(TokenType::LBrace)?;
        self.expect(TokenType::Newline)?;

        let mut taken = false;
        loop {
            self.skip_newlines()?;
            let t = self.peek()?.clone();
            match (t.token_type, t.value.as_str()) {
                (TokenType::RBrace, _) => {
                    self.next()?;
                    return Ok(());
                }
                (TokenType::Word, "case") => {
                    self.next()?;
                    let matched = self.parse_case_patterns(&at, &exprs, taken)?;
                    if self.peek()?.token_type == TokenType::Newline {
                        self.next()?;
                    }
                    self.skip_newlines()?;
                    if matched && !taken {
                        taken = true;
                        if self.peek()?.token_type == TokenType::LBrace {
                            self.parse_block()?;
                        } else {
                            self.parse_clause()?;
                        }
                    } else if self.peek()?.token_type == TokenType::LBrace {
                        self.skip_block()?;
                    } else {
                        self.skip_line()?;
                    }
                }
                (TokenType::Word, "default") => {
                    self.next()?;
                    if self.peek()?.token_type == TokenType::Newline {
                        self.next()?;
                    }
                    self.skip_newlines()?;
                    if !taken {
                        taken = true;
                        if self.peek()?.token_type == TokenType::LBrace {
                            self.parse_block()?;
                        } else {
                            self.parse_clause()?;
                        }
                    } else if self.peek()?.token_type == TokenType::LBrace {
                        self.skip_block()?;
                    } else {
                        self.skip_line()?;
                    }
                }
                _ => return self.err(&t, "expected 'case', 'default', or '}'"),
            }
        }
    }

    /// Parse (and evaluate) one case's pattern alternatives. Once a
    /// switch arm has been taken the remaining alternatives are consumed
    /// in pre-parse (no evaluation).
    fn parse_case_patterns(
        &mut self,
        at: &Token,
        exprs: &[(Value, Option<String>)],
        pre_parse: bool,
    ) -> PResult<bool> {
        self.mode(Mode::CasePatterns);
        let mut matched_any = false;

        loop {
            // One alternative: a comma-separated pattern per expression.
            let mut all = true;
            for (i, (value, func)) in exprs.iter().enumerate() {
                if i != 0 {
                    self.expect(TokenType::Comma)?;
                }
                let ns = self.parse_names(false)?;
                if pre_parse || matched_any {
                    all = false;
                    continue;
                }
                let pat = Value::from_names(ns);
                let m = self.case_matches(at, value, &pat, func.as_deref())?;
                all = all && m;
            }
            if all && !pre_parse {
                matched_any = true;
            }

            if self.peek()?.token_type == TokenType::Alternative {
                self.next()?;
                continue;
            }
            break;
        }

        self.pop_mode();
        Ok(matched_any)
    }

    fn case_matches(
        &mut self,
        at: &Token,
        value: &Value,
        pattern: &Value,
        func: Option<&str>,
    ) -> PResult<bool> {
        if let Some(f) = func {
            let f = functions::find(f).ok_or_else(|| {
                ParseError::new(self.loc(at), format!("unknown match function '{}'", f))
            })?;
            let r = f(&[value.clone(), pattern.clone()])
                .map_err(|m| ParseError::new(self.loc(at), m))?;
            return r
                .as_bool()
                .map_err(|e| ParseError::new(self.loc(at), e.to_string()));
        }

        // Default: pattern names match by path pattern when they carry
        // wildcards, equality otherwise.
        let vs = names::to_string(&value.names);
        for p in &pattern.names {
            let m = match p.pattern {
                Some(PatternKind::Path) => crate::scope::glob_match(&p.value, &vs),
                Some(PatternKind::Regex) => pattern::regex_match(&p.value, &vs),
                _ => p.value == vs && p.is_simple(),
            };
            if m {
                return Ok(true);
            }
        }
        Ok(pattern.names.is_empty() && vs.is_empty())
    }

    fn skip_line(&mut self) -> PResult<()> {
        loop {
            let t = self.next()?;
            if t.is_eol() {
                return Ok(());
            }
        }
    }

    fn parse_for(&mut self) -> PResult<()> {
        let name_t = self.expect(TokenType::Word)?;
        self.expect(TokenType::Colon)?;
        let values = self.parse_value()?;
        if self.peek()?.token_type == TokenType::Newline {
            self.next()?;
        }

        // Capture the raw body region.
        self.skip_newlines()?;
        self.expect(TokenType::LBrace)?;
        self.expect(TokenType::Newline)?;

        let body_start = self.peek()?.start;
        let body_line = self.peek()?.line;
        let mut depth = 1usize;
        let body_end;
        loop {
            let t = self.next()?;
            match t.token_type {
                TokenType::LBrace => depth += 1,
                TokenType::RBrace => {
                    depth -= 1;
                    if depth == 0 {
                        body_end = t.start;
                        break;
                    }
                }
                TokenType::Eos => return self.err(&t, "expected '}' before end of file"),
                _ => {}
            }
        }
        let body = self.lexer.extract(body_start, body_end);

        let var = self.ctx.var_pool.insert_scoped(&name_t.value);
        let elem_ty = values.ty.and_then(names::element_type);

        let mut i = 0;
        let count = values.element_count();
        while i < count {
            let mut elem = values.subscript(i as u64);
            if let Some(t) = elem_ty {
                let _ = elem.convert_to(t);
            }
            self.scope
                .vars
                .write()
                .unwrap()
                .assign(&var, elem)
                .map_err(|e| ParseError::new(self.loc(&name_t), e.to_string()))?;

            // Re-parse the body for this iteration.
            let mut sub = Parser::new(self.ctx, self.root.clone(), (*self.path).clone(), &body);
            sub.scope = self.scope.clone();
            sub.pbase = self.pbase.clone();
            sub.parse().map_err(|e| {
                // Adjust to the original line numbering.
                ParseError::new(
                    Location::new(
                        self.path.clone(),
                        e.location.line + body_line - 1,
                        e.location.column,
                    ),
                    e.message,
                )
            })?;
            i += 1;
        }

        Ok(())
    }

    fn parse_source(&mut self) -> PResult<()> {
        let at = self.peek()?.clone();
        let v = self.parse_value()?;
        for f in v.to_strings() {
            let p = self.resolve_src_path(&f);
            let text = std::fs::read_to_string(&p).map_err(|e| {
                ParseError::new(self.loc(&at), format!("unable to read {}: {}", p.display(), e))
            })?;
            let mut sub = Parser::new(self.ctx, self.root.clone(), p, &text);
            sub.scope = self.scope.clone();
            sub.pbase = self.pbase.clone();
            sub.parse()?;
        }
        Ok(())
    }

    fn parse_include(&mut self) -> PResult<()> {
        let at = self.peek()?.clone();
        let v = self.parse_value()?;
        for f in v.to_strings() {
            // `include dir/` loads dir/buildfile in that directory's
            // scope.
            let (p, dir) = if f.ends_with('/') {
                (
                    self.resolve_src_path(&format!("{}buildfile", f)),
                    Some(f.trim_end_matches('/').to_string()),
                )
            } else {
                (self.resolve_src_path(&f), None)
            };

            // Deduplicate per root scope.
            {
                let root = self.root.root.as_ref().expect("root scope data");
                let mut seen = root.buildfiles.write().unwrap();
                if !seen.insert(p.clone()) {
                    continue;
                }
            }

            let text = std::fs::read_to_string(&p).map_err(|e| {
                ParseError::new(self.loc(&at), format!("unable to read {}: {}", p.display(), e))
            })?;
            let mut sub = Parser::new(self.ctx, self.root.clone(), p, &text);
            sub.scope = match &dir {
                Some(d) => self.scope.child(names::normalize(&self.scope.out_path.join(d))),
                None => self.scope.clone(),
            };
            sub.pbase = match &dir {
                Some(d) => self.pbase.join(d),
                None => self.pbase.clone(),
            };
            sub.parse()?;
        }
        Ok(())
    }

    fn parse_run(&mut self) -> PResult<()> {
        let at = self.peek()?.clone();
        let v = self.parse_value()?;
        let args = v.to_strings();
        let (program, rest) = match args.split_first() {
            Some(x) => x,
            None => return self.err(&at, "expected program name after 'run'"),
        };
        let cmd = crate::process::ProcessCommand::new(program).args(rest.iter().cloned());
        let out = self
            .ctx
            .spawner
            .run(&cmd)
            .map_err(|e| ParseError::new(self.loc(&at), e.to_string()))?;
        if out.status != 0 {
            return self.err(
                &at,
                format!("'{}' exited with status {}", cmd, out.status),
            );
        }
        let mut sub = Parser::new(
            self.ctx,
            self.root.clone(),
            format!("<run {}>", program),
            &out.stdout,
        );
        sub.scope = self.scope.clone();
        sub.pbase = self.pbase.clone();
        sub.parse()
    }

    fn parse_import(&mut self, kw: &str) -> PResult<()> {
        let at = self.peek()?.clone();

        let mut _metadata = false;
        if self.peek()?.token_type == TokenType::LSBrace {
            let attrs = self.parse_attributes()?;
            _metadata = attrs.has("metadata");
            if _metadata && !kw.ends_with('!') {
                return self.err(&at, "[metadata] requires immediate import ('import!')");
            }
        }

        let name_t = self.expect(TokenType::Word)?;
        self.expect(TokenType::Assign)?;
        let v = self.parse_value()?;

        // Phase 1: the project is resolved through config.import.<proj>.
        let mut out = Names::new();
        for n in &v.names {
            let Some(proj) = &n.proj else {
                out.push(n.clone());
                continue;
            };
            let var_name = format!("config.import.{}", proj.replace('-', "_"));
            let dir = match self.ctx.var_pool.find(&var_name) {
                Some(var) => self.scope.find_value(&var).and_then(|v| v.as_dir().ok()),
                None => None,
            };
            match dir {
                Some(d) => {
                    let mut r = n.clone();
                    r.proj = None;
                    r.dir = if r.dir.as_os_str().is_empty() {
                        d
                    } else {
                        d.join(&r.dir)
                    };
                    out.push(r);
                }
                None if kw == "import?" => {
                    // Optional import: expands to null.
                }
                None => {
                    return self.err(
                        &at,
                        format!(
                            "unable to import target {}%{} (set {})",
                            proj, n.value, var_name
                        ),
                    );
                }
            }
        }

        let var = self
            .ctx
            .var_pool
            .insert(&name_t.value, Visibility::Scope, false, None);
        let value = if out.is_empty() && kw == "import?" {
            Value::null()
        } else {
            Value::from_names(out)
        };
        self.scope
            .vars
            .write()
            .unwrap()
            .assign(&var, value)
            .map_err(|e| ParseError::new(self.loc(&at), e.to_string()))
    }

    fn parse_export(&mut self) -> PResult<()> {
        let at = self.peek()?.clone();
        let v = self.parse_value()?;
        // Exported names accumulate on the root scope for importers.
        let var = self
            .ctx
            .var_pool
            .insert("export", Visibility::Project, false, None);
        self.root
            .vars
            .write()
            .unwrap()
            .append(&var, v)
            .map_err(|e| ParseError::new(self.loc(&at), e.to_string()))
    }

    fn parse_using(&mut self, optional: bool) -> PResult<()> {
        let at = self.peek()?.clone();
        let v = self.parse_value()?;
        for m in v.to_strings() {
            let known = matches!(m.as_str(), "cxx" | "c" | "cc" | "test" | "version" | "config");
            if !known && !optional {
                return self.err(&at, format!("unknown build system module '{}'", m));
            }
            let var = self.ctx.var_pool.insert(
                format!("{}.loaded", m),
                Visibility::Project,
                false,
                Some(ValueType::Bool),
            );
            self.root
                .vars
                .write()
                .unwrap()
                .assign(&var, Value::from_bool(known))
                .map_err(|e| ParseError::new(self.loc(&at), e.to_string()))?;
        }
        Ok(())
    }

    fn parse_define(&mut self) -> PResult<()> {
        // define <derived>: <base>
        let derived = self.expect(TokenType::Word)?;
        self.expect(TokenType::Colon)?;
        let base = self.expect(TokenType::Word)?;
        let base_ty = TargetType::find(&base.value).ok_or_else(|| {
            ParseError::new(self.loc(&base), format!("unknown target type '{}'", base.value))
        })?;
        TargetType::define(&derived.value, base_ty);
        Ok(())
    }

    fn parse_config(&mut self) -> PResult<()> {
        let at = self.peek()?.clone();

        let mut attrs = Attributes::default();
        if self.peek()?.token_type == TokenType::LSBrace {
            attrs = self.parse_attributes()?;
        }

        let name_t = self.expect(TokenType::Word)?;
        let name = &name_t.value;

        // config[.**].<project>[.**]
        let project = self
            .root
            .root
            .as_ref()
            .and_then(|r| r.project.read().unwrap().clone());
        let valid = name.strip_prefix("config.").is_some_and(|rest| {
            match &project {
                Some(p) => rest
                    .split('.')
                    .any(|c| c == p.as_str()),
                None => !rest.is_empty(),
            }
        });
        if !valid {
            return self.err(
                &name_t,
                format!(
                    "configuration variable '{}' must be named config[.**].<project>[.**]",
                    name
                ),
            );
        }

        let var = self
            .ctx
            .var_pool
            .insert(name, Visibility::Global, true, attrs.value_type());

        // Optional default: `?= value` is spelled `= value` here with
        // assign-if-undefined semantics.
        let t = self.peek()?.clone();
        if t.token_type == TokenType::Assign {
            self.next()?;
            let v = self.parse_value()?;
            let defined = self.scope.find_value(&var).is_some();
            if !defined {
                self.root
                    .vars
                    .write()
                    .unwrap()
                    .assign(&var, v)
                    .map_err(|e| ParseError::new(self.loc(&at), e.to_string()))?;
            }
        }
        Ok(())
    }

    fn parse_config_environment(&mut self) -> PResult<()> {
        let at = self.peek()?.clone();
        let v = self.parse_value()?;
        let var = self.ctx.var_pool.insert(
            "build.environment",
            Visibility::Project,
            false,
            None,
        );
        self.root
            .vars
            .write()
            .unwrap()
            .append(&var, v)
            .map_err(|e| ParseError::new(self.loc(&at), e.to_string()))
    }

    fn parse_assert(&mut self, negate: bool) -> PResult<()> {
        let at = self.peek()?.clone();
        // The first name is the condition; the rest of the line is the
        // description.
        let v = self.parse_value()?;
        let (cond_n, desc_ns) = match v.names.split_first() {
            Some(x) => x,
            None => return self.err(&at, "expected assert condition"),
        };
        let mut cond = match cond_n.value.as_str() {
            "true" => true,
            "false" => false,
            other => {
                return self.err(&at, format!("invalid bool value '{}'", other));
            }
        };
        if negate {
            cond = !cond;
        }
        if !cond {
            let desc = names::to_string(desc_ns);
            let msg = if desc.is_empty() {
                "assertion failed".to_string()
            } else {
                desc
            };
            return Err(ParseError::new(self.loc(&at), msg));
        }
        Ok(())
    }

    fn parse_dump(&mut self, at: &Token) -> PResult<()> {
        // Dump the current scope's variables as JSON to the diagnostics
        // stream.
        let _ = self.parse_value()?;
        let vars = self.scope.vars.read().unwrap();
        let mut map = serde_json::Map::new();
        for (var, v) in vars.iter() {
            map.insert(
                var.name.clone(),
                serde_json::Value::String(names::to_string(&v.names)),
            );
        }
        tracing::info!(
            "{}: dump: {}",
            self.loc(at),
            serde_json::Value::Object(map)
        );
        Ok(())
    }

    fn resolve_src_path(&self, f: &str) -> PathBuf {
        let p = Path::new(f);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.pbase.join(p)
        }
    }
}

enum WordNames {
    One(Name),
    Expanded(Names),
}

/// Split `dir/type` qualification before a `{`.
fn split_qualifier(s: &str) -> (Option<String>, String) {
    match s.rfind('/') {
        Some(i) => (Some(s[..=i].to_string()), s[i + 1..].to_string()),
        None => (None, s.to_string()),
    }
}

/// Split a name into directory and leaf parts.
fn split_dir(s: &str) -> (Option<String>, String) {
    match s.rfind('/') {
        Some(i) => {
            let d = &s[..i];
            let d = if d.is_empty() { "/" } else { d };
            (Some(d.to_string()), s[i + 1..].to_string())
        }
        None => (None, s.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ScriptedSpawner;
    use crate::target;

    fn parse_in(dir: &Path, text: &str) -> (Arc<crate::context::Context>, Arc<Scope>) {
        let ctx = crate::context::Context::new(Arc::new(ScriptedSpawner::new()));
        let root = ctx.new_root_scope(dir, Some(dir.to_path_buf()));
        {
            let mut p = Parser::new(&ctx, root.clone(), dir.join("buildfile"), text);
            if let Err(e) = p.parse() {
                panic!("parse failed: {}", e);
            }
        }
        (ctx, root)
    }

    fn parse_tmp(text: &str) -> (tempfile::TempDir, Arc<crate::context::Context>, Arc<Scope>) {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, root) = parse_in(dir.path(), text);
        (dir, ctx, root)
    }

    fn scope_value(ctx: &Context, s: &Arc<Scope>, name: &str) -> Option<Value> {
        let var = ctx.var_pool.find(name)?;
        s.find_value(&var)
    }

    #[test]
    fn test_variable_assignment_and_expansion() {
        let (_d, ctx, root) = parse_tmp("x = hello\ny = $x world\n");
        let v = scope_value(&ctx, &root, "y").unwrap();
        let s: Vec<_> = v.names.iter().map(|n| n.value.as_str()).collect();
        assert_eq!(s, ["hello", "world"]);
    }

    #[test]
    fn test_append_prepend() {
        let (_d, ctx, root) = parse_tmp("x = b\nx += c\nx =+ a\n");
        let v = scope_value(&ctx, &root, "x").unwrap();
        let s: Vec<_> = v.names.iter().map(|n| n.value.as_str()).collect();
        assert_eq!(s, ["a", "b", "c"]);
    }

    #[test]
    fn test_typed_variable() {
        let (_d, ctx, root) = parse_tmp("[uint64] n = 42\n");
        let v = scope_value(&ctx, &root, "n").unwrap();
        assert_eq!(v.as_u64(), Ok(42));
        assert_eq!(ctx.var_pool.find("n").unwrap().ty(), Some(ValueType::U64));
    }

    #[test]
    fn test_null_value() {
        let (_d, ctx, root) = parse_tmp("x = [null]\n");
        let v = scope_value(&ctx, &root, "x").unwrap();
        assert!(v.null);
    }

    #[test]
    fn test_dependency_declaration() {
        let (d, ctx, _root) = parse_tmp("exe{hello}: cxx{hello} hxx{common}\n");
        let key = crate::target::TargetKey::new(
            &target::EXE,
            d.path(),
            "",
            "hello",
            None,
        );
        let t = ctx.targets.find(&key).unwrap();
        let ps = t.prerequisites.read().unwrap();
        assert_eq!(ps.len(), 2);
        assert_eq!(ps[0].name, "hello");
        assert!(std::ptr::eq(ps[0].ty, &target::CXX));
        assert!(std::ptr::eq(ps[1].ty, &target::HXX));
    }

    #[test]
    fn test_group_expansion_and_crossing() {
        let (_d, ctx, root) = parse_tmp("x = {a b}{x y}\n");
        let v = scope_value(&ctx, &root, "x").unwrap();
        let s: Vec<_> = v.names.iter().map(|n| n.value.as_str()).collect();
        assert_eq!(s, ["ax", "ay", "bx", "by"]);
    }

    #[test]
    fn test_pattern_dependency() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.cxx"), "").unwrap();
        std::fs::write(dir.path().join("b.cxx"), "").unwrap();

        let (ctx, _root) = parse_in(dir.path(), "exe{app}: cxx{*}\n");
        let key = crate::target::TargetKey::new(&target::EXE, dir.path(), "", "app", None);
        let t = ctx.targets.find(&key).unwrap();
        let ps = t.prerequisites.read().unwrap();
        let names: Vec<_> = ps.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
    }

    #[test]
    fn test_empty_pattern_expansion_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _root) = parse_in(dir.path(), "exe{app}: cxx{*}\n");
        let key = crate::target::TargetKey::new(&target::EXE, dir.path(), "", "app", None);
        let t = ctx.targets.find(&key).unwrap();
        assert!(t.prerequisites.read().unwrap().is_empty());
    }

    #[test]
    fn test_target_variable_block() {
        let (d, ctx, _root) = parse_tmp("exe{x}: cxx{x}\n{\n  test = true\n}\n");
        let key = crate::target::TargetKey::new(&target::EXE, d.path(), "", "x", None);
        let t = ctx.targets.find(&key).unwrap();
        let vars = t.vars.read().unwrap();
        assert_eq!(vars.get("test").unwrap().names[0].value, "true");
    }

    #[test]
    fn test_type_pattern_variable() {
        let (_d, _ctx, root) = parse_tmp("exe{*-test}: run = false\n");
        let v = root.find_type_pattern_value(&target::EXE, "foo-test", "run");
        assert!(v.is_some());
        assert!(root
            .find_type_pattern_value(&target::EXE, "foo", "run")
            .is_none());
    }

    #[test]
    fn test_if_else() {
        let (_d, ctx, root) = parse_tmp(
            "x = true\nif $x\n{\n  y = taken\n}\nelse\n{\n  y = nottaken\n}\n",
        );
        let v = scope_value(&ctx, &root, "y").unwrap();
        assert_eq!(v.names[0].value, "taken");
    }

    #[test]
    fn test_if_false_no_else_is_noop() {
        let (_d, ctx, root) = parse_tmp("if false\n{\n  y = set\n}\n");
        assert!(scope_value(&ctx, &root, "y").is_none());
    }

    #[test]
    fn test_elif_chain() {
        let (_d, ctx, root) = parse_tmp(
            "m = b\nif ($m == 'a')\n{\n  r = 1\n}\nelif ($m == 'b')\n{\n  r = 2\n}\nelse\n{\n  r = 3\n}\n",
        );
        let v = scope_value(&ctx, &root, "r").unwrap();
        assert_eq!(v.names[0].value, "2");
    }

    #[test]
    fn test_eval_comparison_and_logic() {
        let (_d, ctx, root) = parse_tmp("x = 5\ny = ($x == 5 && true)\n");
        let v = scope_value(&ctx, &root, "y").unwrap();
        assert_eq!(v.as_bool(), Ok(true));
    }

    #[test]
    fn test_subscript_in_eval() {
        let (_d, ctx, root) = parse_tmp("xs = a b c\ny = ($xs[1])\nz = ($xs[9])\n");
        let v = scope_value(&ctx, &root, "y").unwrap();
        assert_eq!(v.names[0].value, "b");
        let v = scope_value(&ctx, &root, "z").unwrap();
        assert!(v.null || v.names.is_empty());
    }

    #[test]
    fn test_switch() {
        let (_d, ctx, root) = parse_tmp(
            "m = clang\nswitch $m\n{\n  case gcc\n    r = g\n  case clang | apple-clang\n    r = c\n  default\n    r = d\n}\n",
        );
        let v = scope_value(&ctx, &root, "r").unwrap();
        assert_eq!(v.names[0].value, "c");
    }

    #[test]
    fn test_switch_default() {
        let (_d, ctx, root) = parse_tmp(
            "m = tcc\nswitch $m\n{\n  case gcc\n    r = g\n  default\n    r = d\n}\n",
        );
        let v = scope_value(&ctx, &root, "r").unwrap();
        assert_eq!(v.names[0].value, "d");
    }

    #[test]
    fn test_for_loop() {
        let (_d, ctx, root) = parse_tmp("acc =\nfor i: a b c\n{\n  acc += $i\n}\n");
        let v = scope_value(&ctx, &root, "acc").unwrap();
        let s: Vec<_> = v.names.iter().map(|n| n.value.as_str()).collect();
        assert_eq!(s, ["a", "b", "c"]);
    }

    #[test]
    fn test_function_call() {
        let (_d, ctx, root) = parse_tmp("x = a b\nn = ($size($x))\ne = ($empty($x))\n");
        assert_eq!(
            scope_value(&ctx, &root, "n").unwrap().as_u64(),
            Ok(2)
        );
        assert_eq!(
            scope_value(&ctx, &root, "e").unwrap().as_bool(),
            Ok(false)
        );
    }

    #[test]
    fn test_typed_concat_dir_path() {
        let (_d, ctx, root) = parse_tmp("[dir_path] d = /usr/include\np = $d/stdio.h\n");
        let v = scope_value(&ctx, &root, "p").unwrap();
        assert_eq!(v.names[0].value, "/usr/include/stdio.h");
    }

    #[test]
    fn test_concat_multi_name_fails_with_hint() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = crate::context::Context::new(Arc::new(ScriptedSpawner::new()));
        let root = ctx.new_root_scope(dir.path(), None);
        let mut p = Parser::new(
            &ctx,
            root,
            dir.path().join("buildfile"),
            "x = a b\ny = $(x)suffix\n",
        );
        let e = p.parse().unwrap_err();
        assert!(e.message.contains("quoting"), "message: {}", e.message);
    }

    #[test]
    fn test_pair_names() {
        let (_d, ctx, root) = parse_tmp("x = a@b c\n");
        let v = scope_value(&ctx, &root, "x").unwrap();
        assert_eq!(v.names.len(), 3);
        assert_eq!(v.names[0].pair, Some('@'));
        assert_eq!(v.element_count(), 2);
    }

    #[test]
    fn test_scope_block() {
        let (d, ctx, root) = parse_tmp("sub/:\n{\n  x = inner\n}\nx = outer\n");
        let sub = ctx
            .scope_for(&crate::names::normalize(&d.path().join("sub")))
            .unwrap();
        let v = scope_value(&ctx, &sub, "x").unwrap();
        assert_eq!(v.names[0].value, "inner");
        let v = scope_value(&ctx, &root, "x").unwrap();
        assert_eq!(v.names[0].value, "outer");
    }

    #[test]
    fn test_adhoc_recipe_attachment() {
        let (d, ctx, _root) = parse_tmp(
            "file{out}: file{in}\n% update clean\n{{\n  cp $path($<) $path($>)\n}}\n",
        );
        let key = crate::target::TargetKey::new(&target::FILE, d.path(), "", "out", None);
        let t = ctx.targets.find(&key).unwrap();
        let rs = t.adhoc_recipes.read().unwrap();
        assert_eq!(rs.len(), 1);
        assert!(rs[0].applies_to(crate::action::Operation::Update));
        assert!(rs[0].applies_to(crate::action::Operation::Clean));
        assert!(rs[0].text.contains("cp"));
        assert_eq!(rs[0].lang, RecipeLang::Buildscript);
    }

    #[test]
    fn test_adhoc_pattern_rule() {
        let (_d, _ctx, root) = parse_tmp(
            "file{*.txt.gz}: file{*.txt}\n{{\n  gzip\n}}\n",
        );
        let rules = root.adhoc_rules.read().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].targets[0].1, "*.txt.gz");
        assert_eq!(rules[0].recipes.len(), 1);
    }

    #[test]
    fn test_cxx_recipe_lang() {
        let (d, ctx, _root) = parse_tmp(
            "file{out}: file{in}\n{{ c++ 1\n  void f();\n}}\n",
        );
        let key = crate::target::TargetKey::new(&target::FILE, d.path(), "", "out", None);
        let t = ctx.targets.find(&key).unwrap();
        let rs = t.adhoc_recipes.read().unwrap();
        match &rs[0].lang {
            RecipeLang::Cxx { version, .. } => assert_eq!(version, "1"),
            other => panic!("unexpected lang {:?}", other),
        }
    }

    #[test]
    fn test_define_directive() {
        let (_d, _ctx, _root) = parse_tmp("define xml: doc\nxml{config}: file{config.in}\n");
        assert!(TargetType::find("xml").is_some());
    }

    #[test]
    fn test_config_directive() {
        let (_d, ctx, root) = parse_tmp("config config.hello.fancy = false\n");
        let var = ctx.var_pool.find("config.hello.fancy").unwrap();
        assert_eq!(var.visibility, Visibility::Global);
        assert!(var.overridable);
        let v = root.find_value(&var).unwrap();
        assert_eq!(v.names[0].value, "false");
    }

    #[test]
    fn test_config_bad_name_fails() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = crate::context::Context::new(Arc::new(ScriptedSpawner::new()));
        let root = ctx.new_root_scope(dir.path(), None);
        let mut p = Parser::new(&ctx, root, dir.path().join("buildfile"), "config fancy = 1\n");
        assert!(p.parse().is_err());
    }

    #[test]
    fn test_assert_directive() {
        let (_d, _ctx, _root) = parse_tmp("assert true all good\n");

        let dir = tempfile::tempdir().unwrap();
        let ctx = crate::context::Context::new(Arc::new(ScriptedSpawner::new()));
        let root = ctx.new_root_scope(dir.path(), None);
        let mut p = Parser::new(
            &ctx,
            root,
            dir.path().join("buildfile"),
            "assert false broken setup\n",
        );
        let e = p.parse().unwrap_err();
        assert!(e.message.contains("broken setup"));
    }

    #[test]
    fn test_source_directive() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("vars.build"), "x = sourced\n").unwrap();
        let (ctx, root) = parse_in(dir.path(), "source vars.build\n");
        let v = scope_value(&ctx, &root, "x").unwrap();
        assert_eq!(v.names[0].value, "sourced");
    }

    #[test]
    fn test_include_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("common.build"), "c += 1\n").unwrap();
        let (ctx, root) = parse_in(
            dir.path(),
            "c =\ninclude common.build\ninclude common.build\n",
        );
        let v = scope_value(&ctx, &root, "c").unwrap();
        assert_eq!(v.names.len(), 1);
    }

    #[test]
    fn test_using_directive() {
        let (_d, ctx, root) = parse_tmp("using cxx\n");
        let v = scope_value(&ctx, &root, "cxx.loaded").unwrap();
        assert_eq!(v.as_bool(), Ok(true));
    }

    #[test]
    fn test_import_with_config() {
        let dir = tempfile::tempdir().unwrap();
        let text = "config config.import.libhello = /opt/libhello\nimport libs = libhello%lib{hello}\n";
        let (ctx, root) = parse_in(dir.path(), text);
        let v = scope_value(&ctx, &root, "libs").unwrap();
        assert_eq!(v.names[0].dir, PathBuf::from("/opt/libhello"));
        assert!(v.names[0].proj.is_none());
    }

    #[test]
    fn test_import_optional_null() {
        let (_d, ctx, root) = parse_tmp("import? libs = libmissing%lib{x}\n");
        let v = scope_value(&ctx, &root, "libs").unwrap();
        assert!(v.null);
    }

    #[test]
    fn test_adhoc_member_group() {
        let (d, ctx, _root) = parse_tmp("bmi{foo}<obj{foo}>: mxx{foo}\n");
        let key = crate::target::TargetKey::new(&target::BMI, d.path(), "", "foo", None);
        let t = ctx.targets.find(&key).unwrap();
        assert!(t.find_adhoc_member(&target::OBJ).is_some());
    }

    #[test]
    fn test_dependency_chain() {
        let (d, ctx, _root) = parse_tmp("./: exe{app}: cxx{main}\n");
        let key = crate::target::TargetKey::new(&target::EXE, d.path(), "", "app", None);
        let t = ctx.targets.find(&key).unwrap();
        let ps = t.prerequisites.read().unwrap();
        assert_eq!(ps.len(), 1);
        assert_eq!(ps[0].name, "main");
    }

    #[test]
    fn test_quoted_value_not_pattern() {
        let (_d, ctx, root) = parse_tmp("x = '*.cxx'\n");
        let v = scope_value(&ctx, &root, "x").unwrap();
        assert_eq!(v.names[0].value, "*.cxx");
        assert!(v.names[0].pattern.is_none());
    }
}
