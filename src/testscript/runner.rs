//! Testscript Runner
//!
//! Walks the pre-parsed scope tree: group setup runs serially, child
//! scopes are dispatched to the scheduler, teardown runs serially.
//! Command lines are replayed into pipelines with redirects, builtins
//! resolve before real processes, and output-comparison redirects
//! produce unified diffs on mismatch.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::context::Context;
use crate::diag::Failed;
use crate::process::ProcessCommand;
use crate::scheduler::{TaskCount, WaitGuard};
use crate::testscript::lexer::{Token, TokenType};
use crate::testscript::script::{Line, LineType, ScopeKind, ScopeState, Script, TestScope};

/// Runner configuration.
#[derive(Debug, Clone, Default)]
pub struct TestConfig {
    /// Root working directory for the script execution.
    pub work_dir: PathBuf,
    /// The test target command: `$*` and `$N`.
    pub test_args: Vec<String>,
    /// Programs recognized as test programs (rewritten through the
    /// runner).
    pub test_programs: Vec<String>,
    /// Test runner path and options prepended to test-program
    /// invocations.
    pub runner: Option<(String, Vec<String>)>,
}

/// Variable environment of one scope.
#[derive(Debug, Clone, Default)]
struct Env {
    vars: HashMap<String, String>,
    work_dir: PathBuf,
    id_path: String,
}

/// Registered cleanup kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CleanupKind {
    /// `&f`: must exist, removed.
    Always,
    /// `&!f`: never removed.
    Never,
    /// `&?f`: removed if it exists.
    Maybe,
}

#[derive(Debug, Clone)]
struct TestFailure {
    message: String,
}

impl TestFailure {
    fn new(msg: impl Into<String>) -> Self {
        Self {
            message: msg.into(),
        }
    }
}

type TResult<T> = Result<T, TestFailure>;

/// One parsed command of a pipeline.
#[derive(Debug, Default, Clone)]
struct Command {
    program: String,
    args: Vec<String>,
    stdin: Option<String>,
    out: Option<OutRedirect>,
    cleanups: Vec<(CleanupKind, String)>,
    /// Exit status check; None means `== 0`.
    exit: Option<(bool, i32)>,
}

#[derive(Debug, Clone)]
enum OutRedirect {
    File { path: String, append: bool },
    Null,
    CmpFile(String),
    CmpDoc(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Connective {
    None,
    And,
    Or,
}

pub struct Runner<'a> {
    ctx: &'a Context,
    cfg: TestConfig,
    /// Failure diagnostics collected across scopes (tests inspect
    /// these).
    failures: Mutex<Vec<String>>,
}

impl<'a> Runner<'a> {
    pub fn new(ctx: &'a Context, cfg: TestConfig) -> Self {
        Self {
            ctx,
            cfg,
            failures: Mutex::new(Vec::new()),
        }
    }

    pub fn failures(&self) -> Vec<String> {
        self.failures.lock().unwrap().clone()
    }

    /// Execute a whole script; the root group's working directory is
    /// created under the configured root.
    pub fn run(&self, script: &Script) -> Result<ScopeState, Failed> {
        let mut env = Env {
            vars: HashMap::new(),
            work_dir: self.cfg.work_dir.clone(),
            id_path: String::new(),
        };
        std::fs::create_dir_all(&env.work_dir).map_err(|_| Failed)?;
        let state = self.exec_group(&script.root, &mut env);
        Ok(state)
    }

    // -- Scopes -----------------------------------------------------------

    fn record_failure(&self, msg: impl Into<String>) {
        let msg = msg.into();
        tracing::error!("{}", msg);
        self.failures.lock().unwrap().push(msg);
    }

    fn exec_group(&self, g: &TestScope, env: &mut Env) -> ScopeState {
        if std::fs::create_dir_all(&env.work_dir).is_err() {
            self.record_failure(format!(
                "{}: unable to create working directory",
                scope_label(env, 0)
            ));
            return ScopeState::Failed;
        }

        // Setup, serially.
        let mut li = 0u64;
        for l in &g.setup {
            if let Err(e) = self.exec_line(l, env, &mut li, &mut Vec::new()) {
                self.record_failure(format!("{}: setup: {}", scope_label(env, 0), e.message));
                return ScopeState::Failed;
            }
        }

        // Reduce if-else chains, then dispatch the survivors in
        // parallel. Dropped branches are freed here; the diagnostic
        // line counter advances over skipped conditions.
        let selected = match self.select_children(g, env) {
            Ok(s) => s,
            Err(e) => {
                self.record_failure(format!("{}: {}", scope_label(env, 0), e.message));
                return ScopeState::Failed;
            }
        };

        // Dispatch each surviving child scope as an asynchronous task.
        // (Scopes borrow the script, so the dispatch uses scoped
        // spawning; the task count provides the wait-group semantics and
        // all results are collected before the group concludes.)
        let failed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let count = TaskCount::new();

        std::thread::scope(|s| {
            let guard = WaitGuard::new(count.clone());
            for child in selected {
                if !self.ctx.keep_going && failed.load(std::sync::atomic::Ordering::SeqCst) {
                    // In-flight children still finish (the wait guard
                    // below collects them); we just stop dispatching.
                    break;
                }

                let mut child_env = Env {
                    vars: env.vars.clone(),
                    work_dir: env.work_dir.join(&child.id),
                    id_path: if env.id_path.is_empty() {
                        child.id.clone()
                    } else {
                        format!("{}/{}", env.id_path, child.id)
                    },
                };

                let failed = failed.clone();
                let count = count.clone();
                let this: &Runner<'_> = self;
                count.start();
                s.spawn(move || {
                    let state = this.exec_scope(child, &mut child_env);
                    if state == ScopeState::Failed {
                        failed.store(true, std::sync::atomic::Ordering::SeqCst);
                    }
                    count.finish();
                });
            }
            guard.wait();
        });

        // Teardown, serially, regardless of child failures (their
        // results were collected above).
        let mut li = 0u64;
        for l in &g.teardown {
            if let Err(e) = self.exec_line(l, env, &mut li, &mut Vec::new()) {
                self.record_failure(format!("{}: teardown: {}", scope_label(env, 0), e.message));
                return ScopeState::Failed;
            }
        }

        if failed.load(std::sync::atomic::Ordering::SeqCst) {
            ScopeState::Failed
        } else {
            let _ = std::fs::remove_dir(&env.work_dir);
            ScopeState::Passed
        }
    }

    /// Reduce if-else chains among the children: evaluate each chain's
    /// conditions and keep the first matching branch.
    fn select_children<'s>(&self, g: &'s TestScope, env: &mut Env) -> TResult<Vec<&'s TestScope>> {
        let mut out = Vec::new();
        let mut i = 0;
        while i < g.children.len() {
            let c = &g.children[i];

            if c.if_cond.is_none() && !c.if_chain {
                out.push(c);
                i += 1;
                continue;
            }

            // A chain: consecutive scopes where the first has a
            // condition and the rest are flagged.
            let mut taken = false;
            loop {
                let b = &g.children[i];
                if !taken {
                    let holds = match &b.if_cond {
                        Some(cond) => {
                            let mut r = self.run_cond(cond, env)?;
                            if b.if_negated {
                                r = !r;
                            }
                            r
                        }
                        None => true, // else branch
                    };
                    if holds {
                        out.push(b);
                        taken = true;
                    }
                }
                i += 1;
                if i >= g.children.len() || !g.children[i].if_chain {
                    break;
                }
            }
        }
        Ok(out)
    }

    fn exec_scope(&self, s: &TestScope, env: &mut Env) -> ScopeState {
        match s.kind {
            ScopeKind::Group => self.exec_group(s, env),
            ScopeKind::Test => self.exec_test(s, env),
        }
    }

    fn exec_test(&self, t: &TestScope, env: &mut Env) -> ScopeState {
        if std::fs::create_dir_all(&env.work_dir).is_err() {
            self.record_failure(format!(
                "{}: unable to create working directory",
                scope_label(env, 0)
            ));
            return ScopeState::Failed;
        }

        let mut cleanups: Vec<(CleanupKind, PathBuf)> = Vec::new();

        // A test with exactly one command reports its line index as 0
        // (no per-line ordinal in diagnostics).
        let single = t
            .setup
            .iter()
            .filter(|l| l.ty != LineType::Var)
            .count()
            <= 1;

        let mut li = 0u64;
        let r = self.run_lines(&t.setup, env, &mut li, &mut cleanups);

        let failed = match r {
            Ok(()) => false,
            Err(e) => {
                let shown_li = if single { 0 } else { li };
                self.record_failure(format!("{}: {}", scope_label(env, shown_li), e.message));
                true
            }
        };

        // Cleanups: registered files first, then the working directory
        // must be left empty. A failed test keeps its directory for
        // post-mortem.
        if !failed {
            if let Err(e) = self.run_cleanups(&cleanups, env) {
                self.record_failure(format!("{}: {}", scope_label(env, 0), e.message));
                return ScopeState::Failed;
            }
            if let Err(e) = check_dir_empty(&env.work_dir) {
                self.record_failure(format!("{}: {}", scope_label(env, 0), e.message));
                return ScopeState::Failed;
            }
            let _ = std::fs::remove_dir_all(&env.work_dir);
            ScopeState::Passed
        } else {
            ScopeState::Failed
        }
    }

    fn run_cleanups(&self, cleanups: &[(CleanupKind, PathBuf)], _env: &Env) -> TResult<()> {
        for (kind, p) in cleanups {
            match kind {
                CleanupKind::Always => {
                    if !p.exists() {
                        return Err(TestFailure::new(format!(
                            "registered for cleanup but does not exist: {}",
                            p.display()
                        )));
                    }
                    remove_path(p)?;
                }
                CleanupKind::Maybe => {
                    if p.exists() {
                        remove_path(p)?;
                    }
                }
                CleanupKind::Never => {}
            }
        }
        Ok(())
    }

    // -- Lines ------------------------------------------------------------

    /// Execute a sequence of lines with flow control.
    fn run_lines(
        &self,
        lines: &[Line],
        env: &mut Env,
        li: &mut u64,
        cleanups: &mut Vec<(CleanupKind, PathBuf)>,
    ) -> TResult<()> {
        let mut i = 0;
        while i < lines.len() {
            let l = &lines[i];
            match l.ty {
                LineType::Var => {
                    self.exec_var(l, env)?;
                    i += 1;
                }
                LineType::Cmd => {
                    *li += 1;
                    self.exec_command_line(l, env, cleanups)?;
                    i += 1;
                }
                LineType::CmdIf | LineType::CmdIfn => {
                    i = self.run_if(lines, i, env, li, cleanups)?;
                }
                LineType::CmdWhile => {
                    i = self.run_while(lines, i, env, li, cleanups)?;
                }
                LineType::CmdForArgs | LineType::CmdForStream => {
                    i = self.run_for(lines, i, env, li, cleanups)?;
                }
                LineType::CmdEnd | LineType::CmdElif | LineType::CmdElifn | LineType::CmdElse => {
                    return Err(TestFailure::new(format!(
                        "stray '{}'",
                        first_word(l)
                    )));
                }
            }
        }
        Ok(())
    }

    fn exec_line(
        &self,
        l: &Line,
        env: &mut Env,
        li: &mut u64,
        cleanups: &mut Vec<(CleanupKind, PathBuf)>,
    ) -> TResult<()> {
        self.run_lines(std::slice::from_ref(l), env, li, cleanups)
    }

    /// Find the end of the flow block opened at `start` and the indices
    /// of its top-level branch markers.
    fn block_span(lines: &[Line], start: usize) -> TResult<(usize, Vec<usize>)> {
        let mut depth = 0usize;
        let mut branches = Vec::new();
        let mut i = start;
        while i < lines.len() {
            match lines[i].ty {
                LineType::CmdIf
                | LineType::CmdIfn
                | LineType::CmdWhile
                | LineType::CmdForArgs
                | LineType::CmdForStream => depth += 1,
                LineType::CmdElif | LineType::CmdElifn | LineType::CmdElse if depth == 1 => {
                    branches.push(i);
                }
                LineType::CmdEnd => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok((i, branches));
                    }
                }
                _ => {}
            }
            i += 1;
        }
        Err(TestFailure::new("flow-control block without 'end'"))
    }

    fn run_if(
        &self,
        lines: &[Line],
        start: usize,
        env: &mut Env,
        li: &mut u64,
        cleanups: &mut Vec<(CleanupKind, PathBuf)>,
    ) -> TResult<usize> {
        let (end, branches) = Self::block_span(lines, start)?;

        // Segment boundaries: condition lines at start and each branch
        // marker.
        let mut seg_starts = vec![start];
        seg_starts.extend(branches.iter().copied());

        for (si, &s) in seg_starts.iter().enumerate() {
            let cond_line = &lines[s];
            let (holds, is_else) = match cond_line.ty {
                LineType::CmdIf | LineType::CmdElif => (self.run_cond(cond_line, env)?, false),
                LineType::CmdIfn | LineType::CmdElifn => (!self.run_cond(cond_line, env)?, false),
                LineType::CmdElse => (true, true),
                _ => unreachable!(),
            };
            let _ = is_else;

            let body_start = s + 1;
            let body_end = seg_starts.get(si + 1).copied().unwrap_or(end);

            if holds {
                self.run_lines(&lines[body_start..body_end], env, li, cleanups)?;
                return Ok(end + 1);
            }
            // Skipped branch: the diagnostic counter still advances
            // over the condition.
            *li += 1;
        }

        // No branch taken: nothing executes (and the construct
        // passes).
        Ok(end + 1)
    }

    fn run_while(
        &self,
        lines: &[Line],
        start: usize,
        env: &mut Env,
        li: &mut u64,
        cleanups: &mut Vec<(CleanupKind, PathBuf)>,
    ) -> TResult<usize> {
        let (end, _) = Self::block_span(lines, start)?;
        let mut guard = 0usize;
        loop {
            if !self.run_cond(&lines[start], env)? {
                break;
            }
            self.run_lines(&lines[start + 1..end], env, li, cleanups)?;
            guard += 1;
            if guard > 10_000 {
                return Err(TestFailure::new("while loop did not terminate"));
            }
        }
        Ok(end + 1)
    }

    fn run_for(
        &self,
        lines: &[Line],
        start: usize,
        env: &mut Env,
        li: &mut u64,
        cleanups: &mut Vec<(CleanupKind, PathBuf)>,
    ) -> TResult<usize> {
        let (end, _) = Self::block_span(lines, start)?;
        let l = &lines[start];

        // `for <var>: <values...>` or `for <var> <<EOI`.
        let (var, elements) = match l.ty {
            LineType::CmdForArgs => {
                let colon = l
                    .tokens
                    .iter()
                    .position(|t| t.token_type == TokenType::Colon)
                    .ok_or_else(|| TestFailure::new("for: ':' expected"))?;
                let head = self.expand_words(&l.tokens[1..colon], env)?;
                let tail = self.expand_words(&l.tokens[colon + 1..], env)?;
                let var = head
                    .first()
                    .cloned()
                    .ok_or_else(|| TestFailure::new("for: variable name expected"))?;
                (var, tail)
            }
            _ => {
                // Stream form: elements are the lines of the
                // here-document.
                let name_tokens: Vec<Token> = l.tokens[1..]
                    .iter()
                    .take_while(|t| {
                        matches!(t.token_type, TokenType::Word | TokenType::Dollar)
                    })
                    .cloned()
                    .collect();
                let words = self.expand_words(&name_tokens, env)?;
                let var = words
                    .first()
                    .cloned()
                    .ok_or_else(|| TestFailure::new("for: variable name expected"))?;
                let doc = l
                    .tokens
                    .iter()
                    .find(|t| t.token_type == TokenType::HereDoc)
                    .map(|t| t.value.clone())
                    .unwrap_or_default();
                let elems = doc.lines().map(str::to_string).collect();
                (var, elems)
            }
        };

        check_assignable(&var)?;
        for e in elements {
            env.vars.insert(var.clone(), e);
            self.run_lines(&lines[start + 1..end], env, li, cleanups)?;
        }
        Ok(end + 1)
    }

    /// Replay a condition line (if/elif/while) and evaluate its command
    /// expression to a boolean.
    fn run_cond(&self, l: &Line, env: &mut Env) -> TResult<bool> {
        // Strip the keyword token.
        let tokens = &l.tokens[1..];
        let expr = self.parse_command_expr(tokens, env)?;
        self.eval_expr(&expr, env)
    }

    // -- Variables --------------------------------------------------------

    fn exec_var(&self, l: &Line, env: &mut Env) -> TResult<()> {
        let name = l.var.clone().unwrap_or_default();
        check_assignable(&name)?;

        let op = l.tokens[1].value.clone();
        let words = self.expand_words(&l.tokens[2..], env)?;
        let value = words.join(" ");

        let entry = env.vars.entry(name.clone()).or_default();
        match op.as_str() {
            "=" => *entry = value,
            "+=" => {
                if !entry.is_empty() {
                    entry.push(' ');
                }
                entry.push_str(&value);
            }
            _ => {
                let mut v = value;
                if !entry.is_empty() {
                    v.push(' ');
                    v.push_str(entry);
                }
                *entry = v;
            }
        }

        // The variable pool is shared; insertions during execution take
        // the pool's write lock.
        self.ctx.var_pool.insert_scoped(&name);
        Ok(())
    }

    fn lookup(&self, name: &str, env: &Env) -> TResult<String> {
        match name {
            "*" => Ok(self.cfg.test_args.join(" ")),
            "~" => Ok(env.work_dir.display().to_string()),
            "@" => Ok(env.id_path.clone()),
            n if n.len() == 1 && n.as_bytes()[0].is_ascii_digit() => {
                let i: usize = n.parse().unwrap();
                Ok(self
                    .cfg
                    .test_args
                    .get(i)
                    .cloned()
                    .unwrap_or_default())
            }
            n => Ok(env.vars.get(n).cloned().unwrap_or_default()),
        }
    }

    // -- Commands ---------------------------------------------------------

    /// Expand a token slice into words (adjacent unseparated tokens
    /// concatenate).
    fn expand_words(&self, tokens: &[Token], env: &Env) -> TResult<Vec<String>> {
        let mut words: Vec<String> = Vec::new();
        let mut open = false;

        let mut i = 0;
        while i < tokens.len() {
            let t = &tokens[i];
            match t.token_type {
                TokenType::Word => {
                    if open && !t.separated {
                        words.last_mut().unwrap().push_str(&t.value);
                    } else {
                        words.push(t.value.clone());
                    }
                    open = true;
                }
                TokenType::Dollar => {
                    let name = tokens
                        .get(i + 1)
                        .filter(|n| n.token_type == TokenType::Word)
                        .map(|n| n.value.clone())
                        .unwrap_or_default();
                    if name.is_empty() {
                        return Err(TestFailure::new("expected variable name after '$'"));
                    }
                    let v = self.lookup(&name, env)?;
                    if open && !t.separated {
                        words.last_mut().unwrap().push_str(&v);
                    } else if !v.is_empty() || t.quoted {
                        words.push(v);
                    } else {
                        // An empty expansion contributes no word but
                        // leaves concatenation open.
                        words.push(String::new());
                    }
                    open = true;
                    i += 1; // The name token.
                }
                _ => {
                    return Err(TestFailure::new(format!(
                        "unexpected '{}' in command",
                        t.token_type.as_str()
                    )))
                }
            }
            i += 1;
        }

        Ok(words.into_iter().filter(|w| !w.is_empty()).collect())
    }

    /// Parse a full command expression (pipelines with `&&`/`||`).
    fn parse_command_expr(
        &self,
        tokens: &[Token],
        env: &Env,
    ) -> TResult<Vec<(Connective, Vec<Command>)>> {
        let mut expr: Vec<(Connective, Vec<Command>)> = Vec::new();
        let mut pipeline: Vec<Command> = Vec::new();
        let mut cur = Command::default();
        let mut conn = Connective::None;
        let mut word_tokens: Vec<Token> = Vec::new();

        // Here-document bodies were queued at end of line in redirect
        // order; consume them in the same order.
        let docs: Vec<String> = tokens
            .iter()
            .filter(|t| t.token_type == TokenType::HereDoc)
            .map(|t| t.value.clone())
            .collect();
        let mut doc_i = 0usize;
        let mut next_doc = |doc_i: &mut usize| -> TResult<String> {
            let d = docs
                .get(*doc_i)
                .cloned()
                .ok_or_else(|| TestFailure::new("here-document body not found"))?;
            *doc_i += 1;
            Ok(d)
        };

        let flush_words =
            |cur: &mut Command, word_tokens: &mut Vec<Token>, this: &Self| -> TResult<()> {
                if word_tokens.is_empty() {
                    return Ok(());
                }
                let words = this.expand_words(word_tokens, env)?;
                word_tokens.clear();
                for w in words {
                    if cur.program.is_empty() {
                        cur.program = w;
                    } else {
                        cur.args.push(w);
                    }
                }
                Ok(())
            };

        let mut i = 0;
        while i < tokens.len() {
            let t = &tokens[i];
            match t.token_type {
                TokenType::Word | TokenType::Dollar => {
                    word_tokens.push(t.clone());
                    if t.token_type == TokenType::Dollar {
                        if let Some(n) = tokens.get(i + 1) {
                            word_tokens.push(n.clone());
                            i += 1;
                        }
                    }
                }

                TokenType::Pipe => {
                    flush_words(&mut cur, &mut word_tokens, self)?;
                    pipeline.push(std::mem::take(&mut cur));
                }

                TokenType::AndAnd | TokenType::OrOr => {
                    flush_words(&mut cur, &mut word_tokens, self)?;
                    pipeline.push(std::mem::take(&mut cur));
                    expr.push((conn, std::mem::take(&mut pipeline)));
                    conn = if t.token_type == TokenType::AndAnd {
                        Connective::And
                    } else {
                        Connective::Or
                    };
                }

                TokenType::InStr | TokenType::InHere => {
                    flush_words(&mut cur, &mut word_tokens, self)?;
                    let w = self.redirect_word(tokens, &mut i, env)?;
                    cur.stdin = Some(format!("{}\n", w));
                }
                TokenType::InDoc => {
                    flush_words(&mut cur, &mut word_tokens, self)?;
                    i += 1; // Delimiter word.
                    cur.stdin = Some(next_doc(&mut doc_i)?);
                }

                TokenType::Out | TokenType::OutApp => {
                    flush_words(&mut cur, &mut word_tokens, self)?;
                    let append = t.token_type == TokenType::OutApp;
                    let w = self.redirect_word(tokens, &mut i, env)?;
                    cur.out = Some(OutRedirect::File { path: w, append });
                }
                TokenType::OutNull => {
                    flush_words(&mut cur, &mut word_tokens, self)?;
                    cur.out = Some(OutRedirect::Null);
                }
                TokenType::OutCmp => {
                    flush_words(&mut cur, &mut word_tokens, self)?;
                    let w = self.redirect_word(tokens, &mut i, env)?;
                    cur.out = Some(OutRedirect::CmpFile(w));
                }
                TokenType::OutDocCmp => {
                    flush_words(&mut cur, &mut word_tokens, self)?;
                    i += 1; // Delimiter word.
                    cur.out = Some(OutRedirect::CmpDoc(next_doc(&mut doc_i)?));
                }

                TokenType::Cleanup | TokenType::CleanupNever | TokenType::CleanupMaybe => {
                    flush_words(&mut cur, &mut word_tokens, self)?;
                    let kind = match t.token_type {
                        TokenType::Cleanup => CleanupKind::Always,
                        TokenType::CleanupNever => CleanupKind::Never,
                        _ => CleanupKind::Maybe,
                    };
                    let w = self.redirect_word(tokens, &mut i, env)?;
                    cur.cleanups.push((kind, w));
                }

                TokenType::Equal | TokenType::NotEqual => {
                    flush_words(&mut cur, &mut word_tokens, self)?;
                    let eq = t.token_type == TokenType::Equal;
                    let w = self.redirect_word(tokens, &mut i, env)?;
                    let code: i32 = w
                        .parse()
                        .map_err(|_| TestFailure::new(format!("invalid exit status '{}'", w)))?;
                    cur.exit = Some((eq, code));
                }

                TokenType::HereDoc => {
                    // Already attached by its redirect.
                }

                TokenType::Semi => {}

                _ => {
                    return Err(TestFailure::new(format!(
                        "unexpected '{}' in command",
                        t.token_type.as_str()
                    )))
                }
            }
            i += 1;
        }

        flush_words(&mut cur, &mut word_tokens, self)?;
        if !cur.program.is_empty() || !pipeline.is_empty() {
            pipeline.push(cur);
            expr.push((conn, pipeline));
        }

        Ok(expr)
    }

    /// The single expanded word following a redirect-like token.
    fn redirect_word(&self, tokens: &[Token], i: &mut usize, env: &Env) -> TResult<String> {
        let mut parts: Vec<Token> = Vec::new();
        loop {
            let n = match tokens.get(*i + 1) {
                Some(n) => n,
                None => break,
            };
            match n.token_type {
                TokenType::Word => {
                    if !parts.is_empty() && n.separated {
                        break;
                    }
                    parts.push(n.clone());
                    *i += 1;
                }
                TokenType::Dollar => {
                    if !parts.is_empty() && n.separated {
                        break;
                    }
                    parts.push(n.clone());
                    *i += 1;
                    if let Some(name) = tokens.get(*i + 1) {
                        parts.push(name.clone());
                        *i += 1;
                    }
                }
                _ => break,
            }
        }
        let words = self.expand_words(&parts, env)?;
        words
            .into_iter()
            .next()
            .ok_or_else(|| TestFailure::new("expected word after redirect"))
    }

    /// Execute one command line (a full expression).
    fn exec_command_line(
        &self,
        l: &Line,
        env: &mut Env,
        cleanups: &mut Vec<(CleanupKind, PathBuf)>,
    ) -> TResult<()> {
        let expr = self.parse_command_expr(&l.tokens, env)?;

        // Register cleanups up front (they apply even if the command
        // fails later in the expression).
        for (_, pipeline) in &expr {
            for c in pipeline {
                for (k, f) in &c.cleanups {
                    let p = if Path::new(f).is_absolute() {
                        PathBuf::from(f)
                    } else {
                        env.work_dir.join(f)
                    };
                    cleanups.push((*k, p));
                }
            }
        }

        let ok = self.eval_expr(&expr, env)?;
        if !ok {
            return Err(TestFailure::new("command failed"));
        }
        Ok(())
    }

    /// Evaluate an expression; returns its boolean result. Pipeline
    /// failures that are part of the logic (`&&`/`||`) do not raise.
    fn eval_expr(
        &self,
        expr: &[(Connective, Vec<Command>)],
        env: &mut Env,
    ) -> TResult<bool> {
        let mut result = true;
        for (conn, pipeline) in expr {
            match conn {
                Connective::None => {}
                Connective::And => {
                    if !result {
                        continue;
                    }
                }
                Connective::Or => {
                    if result {
                        continue;
                    }
                }
            }
            result = self.run_pipeline(pipeline, env)?;
        }
        Ok(result)
    }

    /// Run one pipeline; returns whether it succeeded (including output
    /// comparisons and exit-status checks).
    fn run_pipeline(&self, pipeline: &[Command], env: &mut Env) -> TResult<bool> {
        let mut stdin: Option<String> = None;

        for (ci, c) in pipeline.iter().enumerate() {
            let last = ci + 1 == pipeline.len();
            let input = c.stdin.clone().or(stdin.take());

            // The `set` builtin captures the stream into a variable.
            if c.program == "set" {
                let name = c
                    .args
                    .last()
                    .filter(|a| !a.starts_with('-'))
                    .cloned()
                    .ok_or_else(|| TestFailure::new("set: variable name expected"))?;
                check_assignable(&name)?;
                let mut v = input.unwrap_or_default();
                if !c.args.iter().any(|a| a == "-n") {
                    while v.ends_with('\n') {
                        v.pop();
                    }
                }
                env.vars.insert(name.clone(), v);
                self.ctx.var_pool.insert_scoped(&name);
                continue;
            }

            let (status, stdout) = self.run_program(c, env, input)?;

            // Exit status check (default: success).
            let ok = match c.exit {
                None => status == 0,
                Some((true, code)) => status == code,
                Some((false, code)) => status != code,
            };
            if !ok {
                return Ok(false);
            }

            // Output disposition.
            if last {
                match &c.out {
                    None => {
                        if !stdout.is_empty() {
                            return Err(TestFailure::new(format!(
                                "{}: unexpected output:\n{}",
                                c.program, stdout
                            )));
                        }
                    }
                    Some(OutRedirect::Null) => {}
                    Some(OutRedirect::File { path, append }) => {
                        let p = resolve_in(&env.work_dir, path);
                        write_out(&p, &stdout, *append)?;
                    }
                    Some(OutRedirect::CmpFile(path)) => {
                        let p = resolve_in(&env.work_dir, path);
                        let expected = std::fs::read_to_string(&p).map_err(|e| {
                            TestFailure::new(format!("unable to read {}: {}", p.display(), e))
                        })?;
                        self.compare_output(&c.program, &stdout, &expected)?;
                    }
                    Some(OutRedirect::CmpDoc(doc)) => {
                        self.compare_output(&c.program, &stdout, doc)?;
                    }
                }
            } else {
                stdin = Some(stdout);
            }
        }

        Ok(true)
    }

    /// Compare actual output with expected; a mismatch fails the
    /// command with a unified diff.
    fn compare_output(&self, program: &str, actual: &str, expected: &str) -> TResult<()> {
        if actual == expected {
            return Ok(());
        }
        let diff = similar::TextDiff::from_lines(expected, actual);
        let mut out = String::new();
        for change in diff.iter_all_changes() {
            let sign = match change.tag() {
                similar::ChangeTag::Delete => '-',
                similar::ChangeTag::Insert => '+',
                similar::ChangeTag::Equal => ' ',
            };
            out.push(sign);
            out.push_str(change.value());
            if !change.value().ends_with('\n') {
                out.push('\n');
            }
        }
        Err(TestFailure::new(format!(
            "{}: output mismatch:\n{}",
            program, out
        )))
    }

    /// Run a builtin or a real process.
    fn run_program(
        &self,
        c: &Command,
        env: &mut Env,
        input: Option<String>,
    ) -> TResult<(i32, String)> {
        if let Some(r) = self.run_builtin(c, env, input.as_deref())? {
            return Ok(r);
        }

        // Test-program rewrite through the configured runner.
        let (program, args) = if self
            .cfg
            .test_programs
            .iter()
            .any(|p| *p == c.program)
        {
            match &self.cfg.runner {
                Some((rp, ropts)) => {
                    let mut args = ropts.clone();
                    args.push(c.program.clone());
                    args.extend(c.args.iter().cloned());
                    (rp.clone(), args)
                }
                None => (c.program.clone(), c.args.clone()),
            }
        } else {
            (c.program.clone(), c.args.clone())
        };

        let mut cmd = ProcessCommand::new(program).args(args);
        cmd.cwd = Some(env.work_dir.clone());
        cmd.stdin = input;

        let r = self
            .ctx
            .spawner
            .run(&cmd)
            .map_err(|e| TestFailure::new(e.to_string()))?;
        if !r.stderr.is_empty() {
            tracing::debug!(program = %c.program, "stderr: {}", r.stderr.trim_end());
        }
        Ok((r.status, r.stdout))
    }

    /// In-process builtins; command names resolve here before real
    /// processes.
    fn run_builtin(
        &self,
        c: &Command,
        env: &mut Env,
        input: Option<&str>,
    ) -> TResult<Option<(i32, String)>> {
        let r = match c.program.as_str() {
            "true" => (0, String::new()),
            "false" => (1, String::new()),
            "echo" => {
                let mut s = c.args.join(" ");
                s.push('\n');
                (0, s)
            }
            "cat" => {
                if c.args.is_empty() {
                    (0, input.unwrap_or_default().to_string())
                } else {
                    let mut out = String::new();
                    for a in &c.args {
                        let p = resolve_in(&env.work_dir, a);
                        match std::fs::read_to_string(&p) {
                            Ok(s) => out.push_str(&s),
                            Err(e) => {
                                return Err(TestFailure::new(format!(
                                    "cat: unable to read {}: {}",
                                    p.display(),
                                    e
                                )))
                            }
                        }
                    }
                    (0, out)
                }
            }
            "touch" => {
                for a in &c.args {
                    let p = resolve_in(&env.work_dir, a);
                    if let Err(e) = std::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&p)
                    {
                        return Err(TestFailure::new(format!(
                            "touch: {}: {}",
                            p.display(),
                            e
                        )));
                    }
                }
                (0, String::new())
            }
            "mkdir" => {
                let parents = c.args.iter().any(|a| a == "-p");
                for a in c.args.iter().filter(|a| !a.starts_with('-')) {
                    let p = resolve_in(&env.work_dir, a);
                    let r = if parents {
                        std::fs::create_dir_all(&p)
                    } else {
                        std::fs::create_dir(&p)
                    };
                    if let Err(e) = r {
                        return Err(TestFailure::new(format!(
                            "mkdir: {}: {}",
                            p.display(),
                            e
                        )));
                    }
                }
                (0, String::new())
            }
            "rm" => {
                let force = c.args.iter().any(|a| a == "-f");
                let recursive = c.args.iter().any(|a| a == "-r");
                for a in c.args.iter().filter(|a| !a.starts_with('-')) {
                    let p = resolve_in(&env.work_dir, a);
                    let r = if p.is_dir() && recursive {
                        std::fs::remove_dir_all(&p)
                    } else {
                        std::fs::remove_file(&p)
                    };
                    match r {
                        Ok(()) => {}
                        Err(_) if force => {}
                        Err(e) => {
                            return Err(TestFailure::new(format!("rm: {}: {}", p.display(), e)))
                        }
                    }
                }
                (0, String::new())
            }
            "mv" => {
                if c.args.len() != 2 {
                    return Err(TestFailure::new("mv: two arguments expected"));
                }
                let from = resolve_in(&env.work_dir, &c.args[0]);
                let to = resolve_in(&env.work_dir, &c.args[1]);
                if let Err(e) = std::fs::rename(&from, &to) {
                    return Err(TestFailure::new(format!("mv: {}: {}", from.display(), e)));
                }
                (0, String::new())
            }
            "cp" => {
                if c.args.len() != 2 {
                    return Err(TestFailure::new("cp: two arguments expected"));
                }
                let from = resolve_in(&env.work_dir, &c.args[0]);
                let to = resolve_in(&env.work_dir, &c.args[1]);
                if let Err(e) = std::fs::copy(&from, &to) {
                    return Err(TestFailure::new(format!("cp: {}: {}", from.display(), e)));
                }
                (0, String::new())
            }
            "test" => {
                let ok = match c.args.as_slice() {
                    [f, p] if f == "-f" => resolve_in(&env.work_dir, p).is_file(),
                    [f, p] if f == "-d" => resolve_in(&env.work_dir, p).is_dir(),
                    [f, p] if f == "-e" => resolve_in(&env.work_dir, p).exists(),
                    [f, s] if f == "-n" => !s.is_empty(),
                    [f, s] if f == "-z" => s.is_empty(),
                    [a, op, b] if op == "=" => a == b,
                    [a, op, b] if op == "!=" => a != b,
                    _ => return Err(TestFailure::new("test: unsupported expression")),
                };
                (if ok { 0 } else { 1 }, String::new())
            }
            "sed" => {
                // The minimal `sed [-n] -e s/re/sub/[g]` over stdin.
                let script = c
                    .args
                    .iter()
                    .find(|a| !a.starts_with('-'))
                    .ok_or_else(|| TestFailure::new("sed: script expected"))?;
                let (re, sub, global) = parse_sed(script)?;
                let re = regex_lite::Regex::new(&re)
                    .map_err(|e| TestFailure::new(format!("sed: invalid regex: {}", e)))?;
                let mut out = String::new();
                for line in input.unwrap_or_default().lines() {
                    let replaced = if global {
                        re.replace_all(line, sub.as_str())
                    } else {
                        re.replace(line, sub.as_str())
                    };
                    out.push_str(&replaced);
                    out.push('\n');
                }
                (0, out)
            }
            "exit" => {
                let code: i32 = c
                    .args
                    .first()
                    .map(|a| a.parse().unwrap_or(1))
                    .unwrap_or(0);
                (code, String::new())
            }
            _ => return Ok(None),
        };
        Ok(Some(r))
    }
}

/// Run buildscript-style command lines outside a test scope (ad hoc
/// recipes). The caller provides the working directory and seed
/// variables (`<`, `>`); no working-directory bookkeeping or cleanup
/// enforcement applies.
pub fn run_command_text(
    ctx: &Context,
    work_dir: &Path,
    vars: HashMap<String, String>,
    text: &str,
) -> Result<(), String> {
    let script = crate::testscript::parser::Parser::new("<recipe>", text)
        .parse()
        .map_err(|e| e.to_string())?;

    let runner = Runner::new(
        ctx,
        TestConfig {
            work_dir: work_dir.to_path_buf(),
            ..Default::default()
        },
    );
    let mut env = Env {
        vars,
        work_dir: work_dir.to_path_buf(),
        id_path: "<recipe>".to_string(),
    };

    let mut li = 0u64;
    let mut cleanups = Vec::new();

    let mut run = |lines: &[Line]| -> Result<(), String> {
        runner
            .run_lines(lines, &mut env, &mut li, &mut cleanups)
            .map_err(|e| e.message)
    };

    run(&script.root.setup)?;
    for child in &script.root.children {
        run(&child.setup)?;
    }
    run(&script.root.teardown)?;
    Ok(())
}

// -- Helpers --------------------------------------------------------------

fn first_word(l: &Line) -> String {
    l.tokens
        .first()
        .map(|t| t.value.clone())
        .unwrap_or_default()
}

fn scope_label(env: &Env, li: u64) -> String {
    if li == 0 {
        format!("testscript{}{}", if env.id_path.is_empty() { "" } else { ":" }, env.id_path)
    } else {
        format!(
            "testscript{}{}:{}",
            if env.id_path.is_empty() { "" } else { ":" },
            env.id_path,
            li
        )
    }
}

fn resolve_in(dir: &Path, p: &str) -> PathBuf {
    let path = Path::new(p);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        dir.join(path)
    }
}

fn write_out(p: &Path, content: &str, append: bool) -> TResult<()> {
    use std::io::Write;
    let r = if append {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(p)
            .and_then(|mut f| f.write_all(content.as_bytes()))
    } else {
        std::fs::write(p, content)
    };
    r.map_err(|e| TestFailure::new(format!("unable to write {}: {}", p.display(), e)))
}

fn remove_path(p: &Path) -> TResult<()> {
    let r = if p.is_dir() {
        std::fs::remove_dir_all(p)
    } else {
        std::fs::remove_file(p)
    };
    r.map_err(|e| TestFailure::new(format!("unable to remove {}: {}", p.display(), e)))
}

fn check_dir_empty(dir: &Path) -> TResult<()> {
    let entries: Vec<_> = match std::fs::read_dir(dir) {
        Ok(rd) => rd.flatten().collect(),
        Err(_) => return Ok(()),
    };
    if entries.is_empty() {
        Ok(())
    } else {
        let names: Vec<String> = entries
            .iter()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        Err(TestFailure::new(format!(
            "working directory is not empty after cleanup: {}",
            names.join(" ")
        )))
    }
}

/// Special variables are read-only.
fn check_assignable(name: &str) -> TResult<()> {
    let special = matches!(name, "*" | "~" | "@")
        || (name.len() == 1 && name.as_bytes()[0].is_ascii_digit());
    if special {
        return Err(TestFailure::new(format!(
            "attempt to set read-only variable ${}",
            name
        )));
    }
    Ok(())
}

fn parse_sed(script: &str) -> TResult<(String, String, bool)> {
    let rest = script
        .strip_prefix("s/")
        .ok_or_else(|| TestFailure::new("sed: only s/// is supported"))?;
    let mut parts = rest.splitn(3, '/');
    let re = parts.next().unwrap_or_default().to_string();
    let sub = parts.next().unwrap_or_default().replace('\\', "$");
    let flags = parts.next().unwrap_or_default();
    Ok((re, sub, flags.contains('g')))
}
