//! The Compile Rule
//!
//! Matches object-file and BMI targets with a C/C++ source prerequisite
//! and produces recipes that bring them up to date. During apply the
//! rule validates (or rebuilds) the dependency database, injects
//! auto-discovered header prerequisites, classifies the translation
//! unit, and for modular units resolves imports to BMI prerequisites.
//!
//! The two-timestamp scheme: the target mtime tracks externally
//! observable change while the database mtime tracks validation time;
//! neither is advanced without cause, and the database is never newer
//! than an up-to-date target.
//!
//! Database layout per target (`<path>.d`):
//!
//! ```text
//! <rule id>
//! <compiler checksum>
//! <environment checksum>
//! <options hash>
//! <source path>
//! <header path> | @ '<header>' <bmi>     ; prerequisites, in order
//! * <fingerprint>                        ; iff named-module imports
//! @ <module> <bmi>                       ; named-module map lines
//! <unit checksum>
//! <unit module-info string>              ; iff non-empty
//!                                        ; blank terminator
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::action::{Action, Operation, TargetState};
use crate::cc::extract::{extract_headers, HeaderSearch};
use crate::cc::mapper::{MapperSession, MapperWorld, TranslatableHeaders};
use crate::cc::modules::{
    resolve_modules, BmiInfo, ModuleCandidate, ModuleMap, ResolvedOffsets,
};
use crate::cc::scan::scan_unit;
use crate::cc::types::{
    sha256_hex, to_module_string, CompilerClass, CompilerId, CompilerInfo, ImportKind, Lang,
    ModuleImport, TranslationUnit, UnitType,
};
use crate::context::Context;
use crate::depdb::DepDb;
use crate::diag::{fail, Failed};
use crate::process::ProcessCommand;
use crate::rule::{noop_recipe, Recipe, Rule};
use crate::scope::Scope;
use crate::target::{self, DeclKind, Mtime, Target};

/// Compile rule configuration (one per language per context).
pub struct CompileConfig {
    pub lang: Lang,
    pub ci: CompilerInfo,
    pub translatable: TranslatableHeaders,
    /// Include-prefix to out-directory mapping for generated headers.
    pub prefix_map: Vec<(PathBuf, PathBuf)>,
}

pub struct CompileRule {
    cfg: CompileConfig,
    module_map: ModuleMap,
}

/// Match data carried from apply to the recipe (the data-pad pattern).
#[derive(Debug, Clone)]
struct MatchData {
    src: PathBuf,
    dd_path: PathBuf,
    tu: TranslationUnit,
    update: bool,
    offsets: Option<ResolvedOffsets>,
    /// Failure held back so the compiler's own diagnostics appear
    /// first.
    deferred: Option<String>,
    poptions: Vec<String>,
    coptions: Vec<String>,
    /// Pin on the preprocessed-output cache entry; temporary entries
    /// are removed once the last holder drops.
    preprocessed: Option<Arc<crate::filecache::FilePin>>,
}

impl CompileRule {
    pub fn new(cfg: CompileConfig) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            module_map: ModuleMap::new(),
        })
    }

    pub fn module_map(&self) -> &ModuleMap {
        &self.module_map
    }

    fn rule_id(&self) -> &'static str {
        match self.cfg.lang {
            Lang::C => "c.compile 1",
            Lang::Cxx => "cxx.compile 1",
        }
    }

    fn lang_prefix(&self) -> &'static str {
        match self.cfg.lang {
            Lang::C => "c",
            Lang::Cxx => "cxx",
        }
    }

    /// Is this a source type we compile into the given output type?
    fn source_type(
        &self,
        out: &'static target::TargetType,
        p: &'static target::TargetType,
    ) -> bool {
        if std::ptr::eq(out, &target::HBMI) {
            return target::is_header(p);
        }
        match self.cfg.lang {
            Lang::C => std::ptr::eq(p, &target::C),
            Lang::Cxx => std::ptr::eq(p, &target::CXX) || std::ptr::eq(p, &target::MXX),
        }
    }

    fn find_source(&self, t: &Arc<Target>) -> Option<crate::target::Prerequisite> {
        t.prerequisites
            .read()
            .unwrap()
            .iter()
            .find(|p| self.source_type(t.ty, p.ty))
            .cloned()
    }

    /// Resolve the source file, preferring the out tree and falling
    /// back to the src tree.
    fn source_path(
        &self,
        scope: &Arc<Scope>,
        p: &crate::target::Prerequisite,
    ) -> Result<PathBuf, Failed> {
        let mut leaf = p.name.clone();
        if let Some(e) = &p.ext {
            leaf.push('.');
            leaf.push_str(e);
        }
        let out = p.dir.join(&leaf);
        if out.exists() {
            return Ok(out);
        }
        if let Some(src) = scope.out_to_src(&out) {
            if src.exists() {
                return Ok(src);
            }
        }
        // An empty/unresolvable source path here is a bug to diagnose
        // loudly, never a silent path.
        Err(fail(format_args!(
            "source file {} not found in out or src tree",
            out.display()
        )))
    }

    fn gather_options(
        &self,
        ctx: &Context,
        scope: &Arc<Scope>,
        t: &Arc<Target>,
        name: &str,
    ) -> Vec<String> {
        let mut out = Vec::new();
        let full = format!("{}.{}", self.lang_prefix(), name);
        if let Some(var) = ctx.var_pool.find(&full) {
            if let Some(v) = scope.find_value(&var) {
                out.extend(v.to_strings());
            }
        }
        if let Some(v) = t.vars.read().unwrap().get(&full) {
            out.extend(v.to_strings());
        }
        out
    }

    fn options_hash(&self, poptions: &[String], coptions: &[String]) -> String {
        let mut data = String::new();
        data.push_str(&self.cfg.lang.to_string());
        for o in poptions.iter().chain(coptions) {
            data.push('\0');
            data.push_str(o);
        }
        sha256_hex(data.as_bytes())
    }

    // -- Apply ------------------------------------------------------------

    fn apply_update(
        self: &Arc<Self>,
        ctx: &Context,
        a: Action,
        t: &Arc<Target>,
    ) -> Result<Recipe, Failed> {
        let ci = &self.cfg.ci;
        let scope = ctx
            .scope_for(t.out_dir())
            .ok_or_else(|| fail(format_args!("no scope for target {}", t)))?;

        let src_p = self
            .find_source(t)
            .ok_or_else(|| fail(format_args!("no source prerequisite for {}", t)))?;
        let src = self.source_path(&scope, &src_p)?;

        let is_bmi = std::ptr::eq(t.ty, &target::BMI) || std::ptr::eq(t.ty, &target::HBMI);
        let ext = if is_bmi { ci.bmi_ext() } else { ci.obj_ext() };
        let out_path = t.derive_path(Some(ext));
        let dd_path = PathBuf::from(format!("{}.d", out_path.display()));

        let target_mtime = t.mtime();
        let mut update = !target_mtime.exists();

        let poptions = self.gather_options(ctx, &scope, t, "poptions");
        let coptions = self.gather_options(ctx, &scope, t, "coptions");
        let opt_hash = self.options_hash(&poptions, &coptions);

        let mut dd = DepDb::open(&dd_path).map_err(fail_io)?;

        // The database being newer than an existing target means the
        // last update did not complete.
        if let (Some(dbm), Mtime::At(tm)) = (dd.file_mtime(), target_mtime) {
            if dbm > tm {
                update = true;
            }
        }

        dd.expect(self.rule_id());
        dd.expect(&ci.checksum);
        dd.expect(&ci.env_checksum);
        dd.expect(&opt_hash);
        dd.expect(&src.display().to_string());

        // Source changed since the last validation: the include set may
        // differ, so the cached prerequisites cannot be trusted.
        if dd.reading() {
            if let (Some(sm), Some(dbm)) = (file_mtime(&src), dd.file_mtime()) {
                if sm > dbm {
                    let m = dd.mark();
                    dd.truncate(m);
                }
            }
        }

        let search = HeaderSearch {
            ctx,
            scope: &scope,
            prefix_map: &self.cfg.prefix_map,
        };

        let mut header_targets: Vec<Arc<Target>> = Vec::new();

        if dd.reading() {
            // Revalidate the cached prerequisite set, re-stat'ing each
            // file.
            let mark0 = dd.mark();
            let mut valid = true;
            loop {
                let m = dd.mark();
                let line = match dd.read() {
                    Some(l) => l,
                    None => {
                        valid = false;
                        break;
                    }
                };

                if let Some(rest) = line.strip_prefix("@ '") {
                    // Header-unit map line: @ '<header>' <bmi>.
                    let ok = rest.split_once('\'').map(|(_, bmi)| {
                        let bmi = Path::new(bmi.trim());
                        match file_mtime(bmi) {
                            Some(bm) => {
                                if let Mtime::At(tm) = target_mtime {
                                    if bm > tm {
                                        update = true;
                                    }
                                }
                                true
                            }
                            None => false,
                        }
                    });
                    if ok != Some(true) {
                        valid = false;
                        break;
                    }
                    continue;
                }

                if !Path::new(&line).is_absolute() || line.starts_with("@ ") {
                    // End of the prerequisite region.
                    dd.rewind(m);
                    break;
                }

                let hp = PathBuf::from(&line);
                match file_mtime(&hp) {
                    Some(hm) => {
                        if let Mtime::At(tm) = target_mtime {
                            if hm > tm {
                                update = true;
                            }
                        }
                        let ht = search.enter_header(&hp, &scope.out_path);
                        header_targets.push(ht);
                    }
                    None => {
                        valid = false;
                        break;
                    }
                }
            }

            if !valid {
                dd.truncate(mark0);
                header_targets.clear();
            }
        }

        if dd.writing() {
            update = true;
        }

        // Full (re-)extraction when the cached set is unusable.
        if dd.writing() {
            let mapper_active = ci.module_mapper
                && ci.class == CompilerClass::Gcc
                && self.cfg.lang == Lang::Cxx
                && !std::ptr::eq(t.ty, &target::HBMI);

            if mapper_active {
                self.extract_with_mapper(
                    ctx,
                    a,
                    &scope,
                    &src,
                    &poptions,
                    &mut dd,
                    &mut header_targets,
                )?;
            } else if ci.separate_preprocess {
                let r = extract_headers(
                    &search,
                    ci,
                    self.cfg.lang,
                    a,
                    &src,
                    &poptions,
                    &mut dd,
                    target_mtime,
                )?;
                header_targets.extend(r.headers);
                if r.updated {
                    update = true;
                }
            }
        }

        // Classify the unit.
        let text = std::fs::read_to_string(&src)
            .map_err(|e| fail(format_args!("unable to read {}: {}", src.display(), e)))?;
        let mut tu = scan_unit(&text);
        if std::ptr::eq(t.ty, &target::HBMI) {
            tu.ty = UnitType::ModuleHeader;
            tu.module_info.name = src.display().to_string();
        }

        // Keep the preprocessed unit in the file cache while this
        // action holds it; modular units promote theirs so the BMI
        // side-build can reuse it.
        let preprocessed = if ci.separate_preprocess && dd.writing() && !ctx.dry_run {
            let ppath = PathBuf::from(format!("{}.i", out_path.display()));
            std::fs::write(&ppath, &text)
                .map_err(|e| fail(crate::diag::IoError::new("write", &ppath, e)))?;
            let pin = ctx.file_cache.pin(&ppath, true);
            if tu.ty.modular() {
                pin.promote();
            }
            Some(Arc::new(pin))
        } else {
            None
        };

        let mut deferred = None;
        if std::ptr::eq(t.ty, &target::BMI) && !tu.ty.produces_bmi() {
            deferred = Some(format!("{} is not a module interface unit", src.display()));
        }

        // An implementation unit implicitly imports its interface.
        if tu.ty == UnitType::ModuleImpl {
            let name = tu.module_info.name.clone();
            if !tu.module_info.imports.iter().any(|i| i.name == name) {
                tu.module_info
                    .imports
                    .insert(0, ModuleImport::new(ImportKind::ModuleIntf, name, false));
            }
        }

        // Resolve named-module imports into a contiguous prerequisite
        // tail with a fingerprint.
        let mut offsets = None;
        let has_module_imports = tu
            .module_info
            .imports
            .iter()
            .any(|i| i.kind != ImportKind::ModuleHeader);

        if ci.modules && has_module_imports {
            let candidates = self.module_candidates(ctx, t, &src_p)?;
            let mut imports = tu.module_info.imports.clone();
            let (off, fingerprint) = t
                .with_action_data(a, |d| {
                    resolve_modules(
                        &mut imports,
                        &candidates,
                        &self.module_map,
                        &mut d.prerequisite_targets,
                    )
                })
                .map_err(|e| fail(e))?;
            tu.module_info.imports = imports;

            // Match the resolved BMI prerequisites so their recipes are
            // ready before execution.
            let bmis: Vec<Arc<Target>> = t.with_action_data(a, |d| {
                d.prerequisite_targets[off.start..]
                    .iter()
                    .flatten()
                    .cloned()
                    .collect()
            });
            for b in &bmis {
                if !Arc::ptr_eq(b, t) {
                    ctx.match_target(a, b)?;
                }
            }

            if !dd.expect(&format!("* {}", fingerprint)) {
                update = true;
            }
            let named: Vec<String> = t.with_action_data(a, |d| {
                tu.module_info
                    .imports
                    .iter()
                    .filter(|i| i.kind != ImportKind::ModuleHeader)
                    .enumerate()
                    .filter_map(|(i, imp)| {
                        d.prerequisite_targets
                            .get(off.start + i)
                            .and_then(|o| o.as_ref())
                            .and_then(|bt| bt.path())
                            .map(|p| format!("@ {} {}", imp.name, p.display()))
                    })
                    .collect()
            });
            for l in &named {
                if !dd.expect(l) {
                    update = true;
                }
            }
            offsets = Some(off);
        }

        if ci.modules && tu.ty.produces_bmi() {
            self.module_map.record(
                t,
                BmiInfo {
                    name: tu.module_info.name.clone(),
                    reexports: t.with_action_data(a, |d| match offsets {
                        Some(off) => d.prerequisite_targets[off.exported..off.copied]
                            .iter()
                            .flatten()
                            .cloned()
                            .collect(),
                        None => Vec::new(),
                    }),
                },
            );
        }

        // Unit checksum: detects (and, unchanged, suppresses) content
        // edits that touched only the timestamp.
        if !dd.expect(&tu.checksum) {
            update = true;
        }

        let mod_string = to_module_string(tu.ty, &tu.module_info);
        if !mod_string.is_empty() && !dd.expect(&mod_string) {
            update = true;
        }

        // An interface unit that also emits an object gets an ad hoc
        // object member with a module-disambiguated name (foo.mxx and
        // foo.cxx objects must not collide).
        if std::ptr::eq(t.ty, &target::BMI)
            && tu.ty.produces_bmi()
            && t.find_adhoc_member(&target::OBJ).is_none()
        {
            let mut leaf = t.name.clone();
            if let Some(e) = &src_p.ext {
                leaf.push('.');
                leaf.push_str(e);
            }
            let (obj, _) = ctx.targets.insert(
                &target::OBJ,
                t.dir.clone(),
                t.out.clone(),
                leaf,
                Some(ci.obj_ext().to_string()),
                DeclKind::Implied,
            );
            obj.derive_path(Some(ci.obj_ext()));
            t.add_adhoc_member(obj);
        }

        // Revalidated content with a pending recompile: bump the
        // validation time only; the target mtime passes it after the
        // compile step.
        if dd.reading() && update {
            dd.touch = true;
        }
        dd.close().map_err(fail_io)?;

        let md = MatchData {
            src,
            dd_path,
            tu,
            update,
            offsets,
            deferred,
            poptions,
            coptions,
            preprocessed,
        };

        t.with_action_data(a, |d| {
            for h in &header_targets {
                d.prerequisite_targets.push(Some(h.clone()));
            }
            d.match_data = Some(Box::new(md));
        });

        let rule = self.clone();
        Ok(Arc::new(move |ctx, a, t| rule.perform_update(ctx, a, t)))
    }

    /// BMI candidates from the target's module-source prerequisites.
    fn module_candidates(
        &self,
        ctx: &Context,
        t: &Arc<Target>,
        src_p: &crate::target::Prerequisite,
    ) -> Result<Vec<ModuleCandidate>, Failed> {
        let ci = &self.cfg.ci;
        let mut out = Vec::new();

        for p in t.prerequisites.read().unwrap().iter() {
            if !std::ptr::eq(p.ty, &target::MXX) {
                continue;
            }
            if p.name == src_p.name && std::ptr::eq(p.ty, src_p.ty) {
                continue; // Our own source.
            }

            let (bmi, new) = ctx.targets.insert(
                &target::BMI,
                p.dir.clone(),
                p.out.clone(),
                p.name.clone(),
                Some(ci.bmi_ext().to_string()),
                DeclKind::Implied,
            );
            if new {
                bmi.prerequisites.write().unwrap().push(p.clone());
            }
            bmi.derive_path(Some(ci.bmi_ext()));

            let known = self
                .module_map
                .get(&bmi)
                .map(|i| i.name)
                .filter(|n| !n.is_empty());
            out.push(ModuleCandidate {
                file_stem: p.name.clone(),
                known_name: known,
                bmi,
            });
        }

        Ok(out)
    }

    /// Mapper-based extraction: one preprocessor run; the mapper is the
    /// only source of header updates.
    fn extract_with_mapper(
        self: &Arc<Self>,
        ctx: &Context,
        a: Action,
        scope: &Arc<Scope>,
        src: &Path,
        poptions: &[String],
        dd: &mut DepDb,
        headers: &mut Vec<Arc<Target>>,
    ) -> Result<(), Failed> {
        let ci = &self.cfg.ci;

        let mut cmd = ProcessCommand::new(ci.path.display().to_string());
        cmd = cmd.arg("-x").arg("c++");
        cmd = cmd.args(poptions.iter().cloned());
        cmd = cmd
            .arg("-E")
            .arg("-fmodule-mapper=<>")
            .arg(src.display().to_string());

        struct World<'a> {
            rule: &'a Arc<CompileRule>,
            ctx: &'a Context,
            a: Action,
            scope: &'a Arc<Scope>,
            dd: &'a mut DepDb,
            headers: &'a mut Vec<Arc<Target>>,
            error: Option<Failed>,
        }

        impl MapperWorld for World<'_> {
            fn update_header(&mut self, path: &Path) -> Result<PathBuf, String> {
                let search = HeaderSearch {
                    ctx: self.ctx,
                    scope: self.scope,
                    prefix_map: &self.rule.cfg.prefix_map,
                };
                let ht = search.enter_header(path, &self.scope.out_path);
                match search.update_header(self.a, &ht) {
                    Ok(_) => {
                        let p = ht.path().expect("header path");
                        self.dd.expect(&p.display().to_string());
                        self.headers.push(ht);
                        Ok(p)
                    }
                    Err(e) => {
                        self.error = Some(e);
                        Err(format!("unable to update header {}", path.display()))
                    }
                }
            }

            fn translate(&mut self, path: &Path) -> bool {
                self.rule.cfg.translatable.translate(path)
            }

            fn header_bmi(&mut self, path: &Path) -> Result<PathBuf, String> {
                self.rule
                    .header_unit_bmi(self.ctx, self.a, self.scope, path)
                    .map_err(|e| {
                        self.error = Some(e);
                        format!("unable to update header unit for {}", path.display())
                    })
            }

            fn module_bmi(&mut self, _name: &str) -> Option<PathBuf> {
                // Named modules are resolved after scanning; the
                // preprocessor does not need them.
                None
            }

            fn record(&mut self, name: &str, bmi: &Path) {
                self.dd.expect(&format!("@ {} {}", name, bmi.display()));
            }
        }

        let mut world = World {
            rule: self,
            ctx,
            a,
            scope,
            dd,
            headers,
            error: None,
        };
        let mut session = MapperSession::new(&mut world);

        let r = ctx
            .spawner
            .run_served(&cmd, &mut |line| Some(session.serve_line(line)))
            .map_err(|e| fail(format_args!("{}", e)))?;

        let failure = session.failure().map(str::to_string);
        if let Some(e) = world.error {
            return Err(e);
        }
        if let Some(f) = failure {
            return Err(fail(format_args!("module mapper: {}", f)));
        }
        if r.status != 0 {
            return Err(fail(format_args!(
                "unable to extract header dependencies of {}:\n{}",
                src.display(),
                r.stderr
            )));
        }
        Ok(())
    }

    /// Synthesize and build the side-build BMI for a header unit.
    fn header_unit_bmi(
        self: &Arc<Self>,
        ctx: &Context,
        a: Action,
        scope: &Arc<Scope>,
        header: &Path,
    ) -> Result<PathBuf, Failed> {
        let ci = &self.cfg.ci;
        let root = scope.root_scope().ok_or_else(|| fail("no root scope"))?;
        let side = ctx.ensure_side_build(&root.out_path);

        // Register ourselves on the side-build scope so the synthesized
        // target can match (idempotent: registration is keyed by the
        // scope's rule list, which we only extend once).
        if side.rules_for(Operation::Update).is_empty() {
            side.register_rule(None, self.clone());
        }

        // Name the BMI after the header leaf plus a path hash so
        // same-named headers from different directories do not collide.
        let stem = header
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("header");
        let hash = &sha256_hex(header.display().to_string().as_bytes())[..16];
        let name = format!("{}-{}", stem, hash);

        let (hbmi, new) = ctx.targets.insert(
            &target::HBMI,
            side.out_path.clone(),
            "",
            name,
            Some(ci.bmi_ext().to_string()),
            DeclKind::Implied,
        );
        if new {
            std::fs::create_dir_all(&side.out_path).map_err(|e| {
                fail(format_args!(
                    "unable to create {}: {}",
                    side.out_path.display(),
                    e
                ))
            })?;
            let leaf = header
                .file_name()
                .and_then(|s| s.to_str())
                .unwrap_or_default();
            let (nm, ext) = target::split_name(leaf);
            let ty = ext
                .as_deref()
                .and_then(target::type_for_ext)
                .filter(|t| target::is_header(t))
                .unwrap_or(&target::H);
            let mut p = crate::target::Prerequisite::new(
                ty,
                header.parent().unwrap_or(Path::new("/")).to_path_buf(),
                nm,
            );
            p.ext = ext;
            hbmi.prerequisites.write().unwrap().push(p);
        }
        let bmi_path = hbmi.derive_path(Some(ci.bmi_ext()));

        // Direct execution: the consumer cannot proceed without it.
        ctx.match_target(a, &hbmi)?;
        ctx.execute_target(a, &hbmi)?;
        hbmi.invalidate_mtime();

        Ok(bmi_path)
    }

    // -- Perform ----------------------------------------------------------

    fn perform_update(
        self: &Arc<Self>,
        ctx: &Context,
        a: Action,
        t: &Arc<Target>,
    ) -> Result<TargetState, Failed> {
        let (md, pts) = t.with_action_data(a, |d| {
            let md = d
                .match_data
                .as_ref()
                .and_then(|b| b.downcast_ref::<MatchData>())
                .cloned()
                .expect("compile match data");
            (md, d.prerequisite_targets.clone())
        });

        let mut update = md.update;

        // Execute matched prerequisite targets in order; any change
        // forces the recompile even if the cached timestamps said
        // otherwise.
        for pt in pts.iter().flatten() {
            match pt.state(a) {
                TargetState::Matched | TargetState::Executing => {
                    if ctx.execute_target(a, pt)? == TargetState::Changed {
                        update = true;
                    }
                }
                TargetState::Failed => return Err(Failed),
                _ => {}
            }
        }

        if !update {
            // Quiesced: no process invocation, no mtime movement.
            return Ok(TargetState::Unchanged);
        }

        let cmd = self.compile_command(a, t, &md)?;
        tracing::debug!(target_name = %t, cmd = %cmd, "compiling");

        let r = ctx
            .spawner
            .run(&cmd)
            .map_err(|e| fail(format_args!("{}", e)))?;

        if !r.stderr.is_empty() {
            // The compiler's diagnostics pass through verbatim.
            eprint!("{}", r.stderr);
        }

        if r.status != 0 {
            return Err(fail(format_args!(
                "{} exited with status {}",
                self.cfg.ci.path.display(),
                r.status
            )));
        }

        if let Some(msg) = &md.deferred {
            // Raised only after the compiler had its say.
            return Err(fail(msg));
        }

        t.invalidate_mtime();
        if let Mtime::At(tm) = t.mtime() {
            DepDb::check_mtime(&md.dd_path, tm);
        }

        Ok(TargetState::Changed)
    }

    fn perform_clean(&self, t: &Arc<Target>) -> Result<TargetState, Failed> {
        let mut removed = false;
        let mut paths = Vec::new();

        if let Some(p) = t.path() {
            paths.push(PathBuf::from(format!("{}.d", p.display())));
            paths.push(p);
        } else {
            // Never derived during this invocation; derive from the
            // target identity so clean works standalone.
            let ci = &self.cfg.ci;
            let is_bmi = std::ptr::eq(t.ty, &target::BMI) || std::ptr::eq(t.ty, &target::HBMI);
            let p = t.derive_path(Some(if is_bmi { ci.bmi_ext() } else { ci.obj_ext() }));
            paths.push(PathBuf::from(format!("{}.d", p.display())));
            paths.push(p);
        }

        let mut m = t.adhoc_member.read().unwrap().clone();
        while let Some(mt) = m {
            if let Some(p) = mt.path() {
                paths.push(p);
            }
            m = mt.adhoc_member.read().unwrap().clone();
        }

        for p in paths {
            match std::fs::remove_file(&p) {
                Ok(()) => {
                    tracing::debug!(path = %p.display(), "removed");
                    removed = true;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(fail(format_args!("unable to remove {}: {}", p.display(), e)))
                }
            }
        }

        t.invalidate_mtime();
        Ok(if removed {
            TargetState::Changed
        } else {
            TargetState::Unchanged
        })
    }

    /// Build the class-specific compiler command line.
    fn compile_command(
        &self,
        a: Action,
        t: &Arc<Target>,
        md: &MatchData,
    ) -> Result<ProcessCommand, Failed> {
        let ci = &self.cfg.ci;
        let out = t.path().expect("target path");
        let is_bmi = std::ptr::eq(t.ty, &target::BMI);
        let is_hbmi = std::ptr::eq(t.ty, &target::HBMI);
        let modular = ci.modules && (md.tu.ty.modular() || md.offsets.is_some());

        // The unit handed to the compiler: the preprocessed output when
        // this apply produced one. Header units always compile from the
        // original header, and MSVC below 19.30 cannot compile a module
        // interface from the preprocessed file; newer toolchains lift
        // that restriction.
        let msvc_intf_restricted = ci.class == CompilerClass::Msvc
            && is_bmi
            && (ci.version_major, ci.version_minor) < (19, 30);
        let input = match &md.preprocessed {
            Some(pin) if !is_hbmi && !msvc_intf_restricted => pin.path().to_path_buf(),
            _ => md.src.clone(),
        };
        let preprocessed_input = input != md.src;

        let mut c = ProcessCommand::new(ci.path.display().to_string());

        match ci.class {
            CompilerClass::Gcc => {
                let x = if is_hbmi {
                    "c++-header"
                } else if is_bmi && ci.id == CompilerId::Clang {
                    "c++-module"
                } else {
                    match self.cfg.lang {
                        Lang::C => "c",
                        Lang::Cxx => "c++",
                    }
                };
                c = c.arg("-x").arg(x);
                c = c.args(md.poptions.iter().cloned());
                c = c.args(md.coptions.iter().cloned());

                if modular {
                    match ci.id {
                        CompilerId::Gcc => {
                            c = c.arg("-fmodules-ts");
                            if is_hbmi {
                                c = c.arg("-fmodule-header");
                            }
                            // Module maps are routed through the dep-db
                            // with the `@` cookie.
                            c = c.arg(format!("-fmodule-mapper={}?@", md.dd_path.display()));
                        }
                        CompilerId::Clang => {
                            c = c.arg("-fmodules-embed-all-files");
                            if let Some(off) = md.offsets {
                                for (name, path) in t.with_action_data(a, |d| {
                                    module_references(&md.tu, &d.prerequisite_targets, off)
                                }) {
                                    c = c.arg(if name.is_empty() {
                                        format!("-fmodule-file={}", path.display())
                                    } else {
                                        format!("-fmodule-file={}={}", name, path.display())
                                    });
                                }
                            }
                            if is_bmi {
                                c = c.arg("--precompile");
                            }
                        }
                        CompilerId::Msvc => {}
                    }
                }

                if preprocessed_input && ci.id == CompilerId::Gcc {
                    c = c.arg("-fpreprocessed").arg("-fdirectives-only");
                }
                if !(is_bmi && ci.id == CompilerId::Clang) {
                    c = c.arg("-c");
                }
                c = c.arg("-o").arg(out.display().to_string());
                c = c.arg(input.display().to_string());
            }
            CompilerClass::Msvc => {
                c = c.arg("/nologo");
                if self.cfg.lang == Lang::Cxx
                    && !md.coptions.iter().any(|o| o.starts_with("/EH"))
                {
                    c = c.arg("/EHsc");
                }
                if !md
                    .coptions
                    .iter()
                    .any(|o| o.starts_with("/MD") || o.starts_with("/MT"))
                {
                    c = c.arg("/MD");
                }
                c = c.args(md.poptions.iter().cloned());
                c = c.args(md.coptions.iter().cloned());

                if modular {
                    if is_bmi {
                        c = c.arg("/module:interface");
                        c = c.arg("/module:output").arg(out.display().to_string());
                    }
                    if let Some(off) = md.offsets {
                        for (_, path) in t.with_action_data(a, |d| {
                            module_references(&md.tu, &d.prerequisite_targets, off)
                        }) {
                            c = c.arg("/module:reference").arg(path.display().to_string());
                        }
                    }
                    if let Some(d) = &ci.std_ifc_dir {
                        c = c.arg("/module:stdIfcDir").arg(d.display().to_string());
                        // Both would fight over the std modules.
                        c.env_unset.push("IFCPATH".to_string());
                    }
                }

                c = c.arg("/c");
                if !is_bmi {
                    c = c.arg(format!("/Fo:{}", out.display()));
                }
                c = c.arg(input.display().to_string());
            }
        }

        Ok(c)
    }
}

impl Rule for CompileRule {
    fn name(&self) -> &'static str {
        match self.cfg.lang {
            Lang::C => "c.compile",
            Lang::Cxx => "cxx.compile",
        }
    }

    fn matches(&self, _ctx: &Context, _a: Action, t: &Arc<Target>) -> bool {
        let out_ty = std::ptr::eq(t.ty, &target::OBJ)
            || std::ptr::eq(t.ty, &target::BMI)
            || std::ptr::eq(t.ty, &target::HBMI);
        if !out_ty {
            return false;
        }
        t.prerequisites
            .read()
            .unwrap()
            .iter()
            .any(|p| self.source_type(t.ty, p.ty))
    }

    fn apply(self: Arc<Self>, ctx: &Context, a: Action, t: &Arc<Target>) -> Result<Recipe, Failed> {
        match a.op {
            Operation::Update => self.apply_update(ctx, a, t),
            Operation::Clean => {
                let rule = self.clone();
                Ok(Arc::new(move |_, _, t| rule.perform_clean(t)))
            }
            Operation::Test => Ok(noop_recipe()),
        }
    }
}

fn fail_io(e: crate::diag::IoError) -> Failed {
    fail(e)
}

fn file_mtime(p: &Path) -> Option<std::time::SystemTime> {
    std::fs::metadata(p).ok()?.modified().ok()
}

fn module_references(
    tu: &TranslationUnit,
    pts: &[Option<Arc<Target>>],
    off: ResolvedOffsets,
) -> Vec<(String, PathBuf)> {
    let mut out = Vec::new();
    let named: Vec<&ModuleImport> = tu
        .module_info
        .imports
        .iter()
        .filter(|i| i.kind != ImportKind::ModuleHeader)
        .collect();
    for (i, imp) in named.iter().enumerate() {
        if let Some(Some(t)) = pts.get(off.start + i) {
            if let Some(p) = t.path() {
                out.push((imp.name.clone(), p));
            }
        }
    }
    // Indirect (copied) re-exports.
    for t in pts[off.copied.min(pts.len())..].iter().flatten() {
        if let Some(p) = t.path() {
            out.push((String::new(), p));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{ScriptedRun, ScriptedSpawner, Spawner};

    struct Build {
        _spawner_keep: Arc<ScriptedSpawner>,
        ctx: Arc<Context>,
        root: Arc<Scope>,
        rule: Arc<CompileRule>,
    }

    fn setup(dir: &Path, ci: CompilerInfo) -> Build {
        let spawner = Arc::new(ScriptedSpawner::new());
        let ctx = Context::new(spawner.clone() as Arc<dyn Spawner>);
        let root = ctx.new_root_scope(dir, None);
        let rule = CompileRule::new(CompileConfig {
            lang: Lang::Cxx,
            ci,
            translatable: TranslatableHeaders::default(),
            prefix_map: vec![(PathBuf::new(), dir.to_path_buf())],
        });
        root.register_rule(None, rule.clone());
        Build {
            _spawner_keep: spawner,
            ctx,
            root,
            rule,
        }
    }

    fn spawner(b: &Build) -> &ScriptedSpawner {
        &b._spawner_keep
    }

    fn obj_target(b: &Build, dir: &Path, name: &str, src: &str) -> Arc<Target> {
        let (t, _) = b
            .ctx
            .targets
            .insert(&target::OBJ, dir, "", name, None, DeclKind::Real);
        let mut p =
            crate::target::Prerequisite::new(&target::CXX, dir.to_path_buf(), src);
        p.ext = Some("cxx".into());
        t.prerequisites.write().unwrap().push(p);
        t
    }

    fn dep_ok(src: &Path, headers: &[&Path]) -> ScriptedRun {
        let mut out = format!("^: {}", src.display());
        for h in headers {
            out.push(' ');
            out.push_str(&h.display().to_string());
        }
        out.push('\n');
        ScriptedRun::output(0, out, "")
    }

    #[test]
    fn test_build_then_noop() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("main.cxx");
        let hdr = dir.path().join("a.h");
        std::fs::write(&src, "#include \"a.h\"\nint main() { return 0; }\n").unwrap();
        std::fs::write(&hdr, "int f();\n").unwrap();

        let obj = dir.path().join("main.o");

        // First build: extraction plus compile.
        let b = setup(dir.path(), CompilerInfo::test_gcc());
        spawner(&b).push(dep_ok(&src, &[&hdr]));
        spawner(&b).push(ScriptedRun::exit(0).creating(&obj, "obj"));

        let t = obj_target(&b, dir.path(), "main", "main");
        let s = b.ctx.update(&t).unwrap();
        assert_eq!(s, TargetState::Changed);
        assert!(obj.exists());
        assert_eq!(spawner(&b).invocation_count(), 2);

        let dd = std::fs::read_to_string(dir.path().join("main.o.d")).unwrap();
        assert!(dd.starts_with("cxx.compile 1\n"));
        assert!(dd.contains(&hdr.display().to_string()));
        assert!(dd.ends_with("\n\n"));

        let obj_m = std::fs::metadata(&obj).unwrap().modified().unwrap();
        let dd_m = std::fs::metadata(dir.path().join("main.o.d"))
            .unwrap()
            .modified()
            .unwrap();
        assert!(dd_m <= obj_m);

        // Second build from a clean context: fully quiesced, no process
        // invocations, no mtime movement.
        let b2 = setup(dir.path(), CompilerInfo::test_gcc());
        let t2 = obj_target(&b2, dir.path(), "main", "main");
        let s = b2.ctx.update(&t2).unwrap();
        assert_eq!(s, TargetState::Unchanged);
        assert_eq!(spawner(&b2).invocation_count(), 0);

        let obj_m2 = std::fs::metadata(&obj).unwrap().modified().unwrap();
        let dd_m2 = std::fs::metadata(dir.path().join("main.o.d"))
            .unwrap()
            .modified()
            .unwrap();
        assert_eq!(obj_m, obj_m2);
        assert_eq!(dd_m, dd_m2);
    }

    #[test]
    fn test_rebuild_on_header_edit() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("main.cxx");
        let hdr = dir.path().join("a.h");
        std::fs::write(&src, "#include \"a.h\"\nint main() { return 0; }\n").unwrap();
        std::fs::write(&hdr, "int f();\n").unwrap();
        let obj = dir.path().join("main.o");

        let b = setup(dir.path(), CompilerInfo::test_gcc());
        spawner(&b).push(dep_ok(&src, &[&hdr]));
        spawner(&b).push(ScriptedRun::exit(0).creating(&obj, "obj"));
        let t = obj_target(&b, dir.path(), "main", "main");
        b.ctx.update(&t).unwrap();

        // Touch the header so its mtime advances past the object.
        std::thread::sleep(std::time::Duration::from_millis(20));
        std::fs::write(&hdr, "int f();\nint g();\n").unwrap();

        // Only the compiler runs: the cached prerequisite list is
        // revalidated, not re-extracted.
        let b2 = setup(dir.path(), CompilerInfo::test_gcc());
        spawner(&b2).push(ScriptedRun::exit(0).creating(&obj, "obj2"));
        let t2 = obj_target(&b2, dir.path(), "main", "main");
        let s = b2.ctx.update(&t2).unwrap();
        assert_eq!(s, TargetState::Changed);
        assert_eq!(spawner(&b2).invocation_count(), 1);

        // All the cached lines survived, and the database is not newer
        // than the rebuilt target.
        let dd = std::fs::read_to_string(dir.path().join("main.o.d")).unwrap();
        assert!(dd.contains(&hdr.display().to_string()));
        let obj_m = std::fs::metadata(&obj).unwrap().modified().unwrap();
        let dd_m = std::fs::metadata(dir.path().join("main.o.d"))
            .unwrap()
            .modified()
            .unwrap();
        assert!(dd_m <= obj_m);

        // And a third build is again a no-op.
        let b3 = setup(dir.path(), CompilerInfo::test_gcc());
        let t3 = obj_target(&b3, dir.path(), "main", "main");
        assert_eq!(b3.ctx.update(&t3).unwrap(), TargetState::Unchanged);
        assert_eq!(spawner(&b3).invocation_count(), 0);
    }

    struct GenRule {
        content: &'static str,
    }

    impl Rule for GenRule {
        fn name(&self) -> &'static str {
            "test.gen"
        }

        fn matches(&self, _: &Context, _: Action, t: &Arc<Target>) -> bool {
            std::ptr::eq(t.ty, &target::H) && t.name == "gen"
        }

        fn apply(self: Arc<Self>, _: &Context, _: Action, _: &Arc<Target>) -> Result<Recipe, Failed> {
            let content = self.content;
            Ok(Arc::new(move |_, _, t| {
                let p = t.derive_path(Some("h"));
                let existed = p.exists();
                std::fs::write(&p, content).map_err(|_| Failed)?;
                t.invalidate_mtime();
                Ok(if existed {
                    TargetState::Unchanged
                } else {
                    TargetState::Changed
                })
            }))
        }
    }

    #[test]
    fn test_generated_header_restart() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("main.cxx");
        std::fs::write(&src, "#include \"gen.h\"\nint main() { return 0; }\n").unwrap();
        let gen = dir.path().join("gen.h");
        let obj = dir.path().join("main.o");

        let b = setup(dir.path(), CompilerInfo::test_gcc());
        b.root.register_rule(None, Arc::new(GenRule { content: "int g();\n" }));

        // Declare the generated header so the prefix map can find it.
        b.ctx
            .targets
            .insert(&target::H, dir.path(), "", "gen", Some("h".into()), DeclKind::Real);

        // First extraction fails on the missing header; the restart
        // loop generates it and re-preprocesses.
        spawner(&b).push(ScriptedRun::output(
            1,
            "",
            format!("{}:1:10: fatal error: gen.h: No such file or directory\n", src.display()),
        ));
        spawner(&b).push(dep_ok(&src, &[&gen]));
        spawner(&b).push(ScriptedRun::exit(0).creating(&obj, "obj"));

        let t = obj_target(&b, dir.path(), "main", "main");
        let s = b.ctx.update(&t).unwrap();
        assert_eq!(s, TargetState::Changed);
        assert!(gen.exists());
        assert!(obj.exists());
        assert_eq!(spawner(&b).invocation_count(), 3);

        let dd = std::fs::read_to_string(dir.path().join("main.o.d")).unwrap();
        assert!(dd.contains(&gen.display().to_string()));

        // Subsequent build is a no-op.
        let b2 = setup(dir.path(), CompilerInfo::test_gcc());
        b2.root.register_rule(None, Arc::new(GenRule { content: "int g();\n" }));
        let t2 = obj_target(&b2, dir.path(), "main", "main");
        assert_eq!(b2.ctx.update(&t2).unwrap(), TargetState::Unchanged);
        assert_eq!(spawner(&b2).invocation_count(), 0);
    }

    fn module_targets(b: &Build, dir: &Path) -> (Arc<Target>, Arc<Target>) {
        let (bmi, _) = b
            .ctx
            .targets
            .insert(&target::BMI, dir, "", "foo", Some("gcm".into()), DeclKind::Real);
        let mut mp = crate::target::Prerequisite::new(&target::MXX, dir.to_path_buf(), "foo");
        mp.ext = Some("mxx".into());
        bmi.prerequisites.write().unwrap().push(mp.clone());

        let (obj, _) = b
            .ctx
            .targets
            .insert(&target::OBJ, dir, "", "foo", None, DeclKind::Real);
        let mut cp = crate::target::Prerequisite::new(&target::CXX, dir.to_path_buf(), "foo");
        cp.ext = Some("cxx".into());
        obj.prerequisites.write().unwrap().push(cp);
        obj.prerequisites.write().unwrap().push(mp);
        (bmi, obj)
    }

    #[test]
    fn test_module_interface_and_implementation() {
        let dir = tempfile::tempdir().unwrap();
        let mxx = dir.path().join("foo.mxx");
        let cxx = dir.path().join("foo.cxx");
        std::fs::write(&mxx, "export module foo;\nexport void f();\n").unwrap();
        std::fs::write(&cxx, "module foo;\nvoid f() {}\n").unwrap();

        let gcm = dir.path().join("foo.gcm");
        let obj = dir.path().join("foo.o");

        let b = setup(dir.path(), CompilerInfo::test_gcc());
        let (_bmi_t, obj_t) = module_targets(&b, dir.path());

        spawner(&b).push(dep_ok(&cxx, &[])); // obj extraction
        spawner(&b).push(dep_ok(&mxx, &[])); // bmi extraction
        spawner(&b).push(ScriptedRun::exit(0).creating(&gcm, "bmi")); // bmi compile
        spawner(&b).push(ScriptedRun::exit(0).creating(&obj, "obj")); // obj compile

        let s = b.ctx.update(&obj_t).unwrap();
        assert_eq!(s, TargetState::Changed);
        assert!(gcm.exists());
        assert!(obj.exists());
        assert_eq!(spawner(&b).invocation_count(), 4);

        // The dep-db records the module map and the resolved-set
        // fingerprint, and the unit info string shows the
        // implementation unit with its implicit interface import.
        let dd = std::fs::read_to_string(dir.path().join("foo.o.d")).unwrap();
        assert!(dd.contains(&format!("@ foo {}", gcm.display())));
        assert!(dd.lines().any(|l| l.starts_with("* ")));
        assert!(dd.contains("foo+ foo"));

        let bmi_dd = std::fs::read_to_string(dir.path().join("foo.gcm.d")).unwrap();
        assert!(bmi_dd.contains("foo!"));

        // The interface unit grew a module-disambiguated ad hoc object
        // member (foo.mxx.o, distinct from foo.o).
        let member = _bmi_t.find_adhoc_member(&target::OBJ).unwrap();
        assert_eq!(
            member.path().unwrap(),
            dir.path().join("foo.mxx.o")
        );

        // Quiesced rebuild is silent.
        let b2 = setup(dir.path(), CompilerInfo::test_gcc());
        let (_, obj_t2) = module_targets(&b2, dir.path());
        assert_eq!(b2.ctx.update(&obj_t2).unwrap(), TargetState::Unchanged);
        assert_eq!(spawner(&b2).invocation_count(), 0);
    }

    #[test]
    fn test_deleted_bmi_rebuilds_dependents() {
        let dir = tempfile::tempdir().unwrap();
        let mxx = dir.path().join("foo.mxx");
        let cxx = dir.path().join("foo.cxx");
        std::fs::write(&mxx, "export module foo;\n").unwrap();
        std::fs::write(&cxx, "module foo;\n").unwrap();
        let gcm = dir.path().join("foo.gcm");
        let obj = dir.path().join("foo.o");

        let b = setup(dir.path(), CompilerInfo::test_gcc());
        let (_, obj_t) = module_targets(&b, dir.path());
        spawner(&b).push(dep_ok(&cxx, &[]));
        spawner(&b).push(dep_ok(&mxx, &[]));
        spawner(&b).push(ScriptedRun::exit(0).creating(&gcm, "bmi"));
        spawner(&b).push(ScriptedRun::exit(0).creating(&obj, "obj"));
        b.ctx.update(&obj_t).unwrap();

        // Deleting the BMI rebuilds it and then the implementation's
        // object, but the interface is not re-extracted.
        std::fs::remove_file(&gcm).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));

        let b2 = setup(dir.path(), CompilerInfo::test_gcc());
        let (_, obj_t2) = module_targets(&b2, dir.path());
        spawner(&b2).push(ScriptedRun::exit(0).creating(&gcm, "bmi2"));
        spawner(&b2).push(ScriptedRun::exit(0).creating(&obj, "obj2"));
        let s = b2.ctx.update(&obj_t2).unwrap();
        assert_eq!(s, TargetState::Changed);
        assert_eq!(spawner(&b2).invocation_count(), 2);
        assert!(gcm.exists());
    }

    #[test]
    fn test_mapper_include_translation() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("consumer.cxx");
        std::fs::write(&src, "#include <vector>\nint f();\n").unwrap();
        let vec_h = dir.path().join("vector");
        std::fs::write(&vec_h, "template <typename T> struct vector {};\n").unwrap();
        let obj = dir.path().join("consumer.o");

        let mut ci = CompilerInfo::test_gcc();
        ci.module_mapper = true;

        let spawner_arc = Arc::new(ScriptedSpawner::new());
        let ctx = Context::new(spawner_arc.clone() as Arc<dyn Spawner>);
        let root = ctx.new_root_scope(dir.path(), None);

        let mut translatable = TranslatableHeaders::default();
        translatable.groups.push("std-importable".into());
        translatable.std_importable.insert(vec_h.clone());
        translatable.importable.insert(vec_h.clone());

        let rule = CompileRule::new(CompileConfig {
            lang: Lang::Cxx,
            ci,
            translatable,
            prefix_map: Vec::new(),
        });
        root.register_rule(None, rule.clone());

        // The served preprocessor run asks to translate <vector>; the
        // side-build BMI is then extracted and compiled.
        spawner_arc.push(ScriptedRun::serving(
            0,
            vec![
                "HELLO 1 GCC ident".into(),
                format!("INCLUDE-TRANSLATE {}", vec_h.display()),
            ],
        ));
        spawner_arc.push(dep_ok(&vec_h, &[])); // header-unit extraction

        let hash = &sha256_hex(vec_h.display().to_string().as_bytes())[..16];
        let side_bmi = dir
            .path()
            .join("modules")
            .join(format!("vector-{}.gcm", hash));
        spawner_arc.push(ScriptedRun::exit(0).creating(&side_bmi, "hbmi"));
        spawner_arc.push(ScriptedRun::exit(0).creating(&obj, "obj"));

        let (t, _) = ctx
            .targets
            .insert(&target::OBJ, dir.path(), "", "consumer", None, DeclKind::Real);
        let mut p = crate::target::Prerequisite::new(&target::CXX, dir.path().to_path_buf(), "consumer");
        p.ext = Some("cxx".into());
        t.prerequisites.write().unwrap().push(p);

        let s = ctx.update(&t).unwrap();
        assert_eq!(s, TargetState::Changed);
        assert!(side_bmi.exists());
        assert_eq!(spawner_arc.invocation_count(), 4);

        // The mapper answered with the side-build BMI path.
        let responses = spawner_arc.served_responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0][0], "HELLO 1 mason");
        assert_eq!(
            responses[0][1],
            format!("PATHNAME {}", side_bmi.display())
        );

        // And the consumer's dep-db records the mapping.
        let dd = std::fs::read_to_string(dir.path().join("consumer.o.d")).unwrap();
        assert!(dd.contains(&format!("@ '{}' {}", vec_h.display(), side_bmi.display())));
        assert!(dd.contains(&vec_h.display().to_string()));
    }

    #[test]
    fn test_options_change_forces_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("main.cxx");
        std::fs::write(&src, "int main() { return 0; }\n").unwrap();
        let obj = dir.path().join("main.o");

        let b = setup(dir.path(), CompilerInfo::test_gcc());
        spawner(&b).push(dep_ok(&src, &[]));
        spawner(&b).push(ScriptedRun::exit(0).creating(&obj, "obj"));
        let t = obj_target(&b, dir.path(), "main", "main");
        b.ctx.update(&t).unwrap();

        // Same context kind, new options: the hash mismatch rewrites
        // the database and recompiles.
        let b2 = setup(dir.path(), CompilerInfo::test_gcc());
        let var = b2.ctx.var_pool.insert(
            "cxx.coptions",
            crate::variable::Visibility::Project,
            true,
            None,
        );
        b2.root
            .vars
            .write()
            .unwrap()
            .assign(&var, crate::names::Value::from_names(vec![crate::names::Name::simple("-O2")]))
            .unwrap();

        spawner(&b2).push(dep_ok(&src, &[]));
        spawner(&b2).push(ScriptedRun::exit(0).creating(&obj, "obj2"));
        let t2 = obj_target(&b2, dir.path(), "main", "main");
        let s = b2.ctx.update(&t2).unwrap();
        assert_eq!(s, TargetState::Changed);
        assert_eq!(spawner(&b2).invocation_count(), 2);

        // The compile command carried the new option.
        let last = spawner(&b2).invocations().pop().unwrap();
        assert!(last.args.contains(&"-O2".to_string()));
    }

    #[test]
    fn test_clean_removes_derived_files() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("main.cxx");
        std::fs::write(&src, "int main() { return 0; }\n").unwrap();
        let obj = dir.path().join("main.o");

        let b = setup(dir.path(), CompilerInfo::test_gcc());
        spawner(&b).push(dep_ok(&src, &[]));
        spawner(&b).push(ScriptedRun::exit(0).creating(&obj, "obj"));
        let t = obj_target(&b, dir.path(), "main", "main");
        b.ctx.update(&t).unwrap();
        assert!(obj.exists());

        let a = Action::clean();
        b.ctx.match_target(a, &t).unwrap();
        let s = b.ctx.execute_target(a, &t).unwrap();
        assert_eq!(s, TargetState::Changed);
        assert!(!obj.exists());
        assert!(!dir.path().join("main.o.d").exists());
    }

    #[test]
    fn test_deferred_failure_runs_compiler_first() {
        let dir = tempfile::tempdir().unwrap();
        let mxx = dir.path().join("bad.mxx");
        // Not a module interface unit.
        std::fs::write(&mxx, "int x;\n").unwrap();

        let b = setup(dir.path(), CompilerInfo::test_gcc());
        let (bmi, _) = b.ctx.targets.insert(
            &target::BMI,
            dir.path(),
            "",
            "bad",
            Some("gcm".into()),
            DeclKind::Real,
        );
        let mut p = crate::target::Prerequisite::new(&target::MXX, dir.path().to_path_buf(), "bad");
        p.ext = Some("mxx".into());
        bmi.prerequisites.write().unwrap().push(p);

        spawner(&b).push(dep_ok(&mxx, &[]));
        spawner(&b).push(ScriptedRun::exit(0)); // The compiler gets to run.

        assert!(b.ctx.update(&bmi).is_err());
        // The compiler was still invoked before the deferred failure
        // was raised.
        assert_eq!(spawner(&b).invocation_count(), 2);
    }

    #[test]
    fn test_preprocessed_cache_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("main.cxx");
        std::fs::write(&src, "int main() { return 0; }\n").unwrap();
        let obj = dir.path().join("main.o");
        let pre = dir.path().join("main.o.i");

        let b = setup(dir.path(), CompilerInfo::test_gcc());
        spawner(&b).push(dep_ok(&src, &[]));
        spawner(&b).push(ScriptedRun::exit(0).creating(&obj, "obj"));
        let t = obj_target(&b, dir.path(), "main", "main");
        b.ctx.update(&t).unwrap();

        // Pinned while the action data holds it, and the compile step
        // consumed it rather than the original source.
        assert!(pre.exists());
        let inv = spawner(&b).invocations();
        let args = &inv[1].args;
        assert!(args.contains(&"-fpreprocessed".to_string()), "args: {:?}", args);
        assert!(
            args.last().unwrap().ends_with("main.o.i"),
            "args: {:?}",
            args
        );

        // A non-modular unit's entry is temporary: releasing the build
        // state unpins and removes it.
        drop(t);
        drop(b);
        assert!(!pre.exists());
    }

    #[test]
    fn test_modular_preprocessed_promoted() {
        let dir = tempfile::tempdir().unwrap();
        let mxx = dir.path().join("foo.mxx");
        std::fs::write(&mxx, "export module foo;\n").unwrap();
        let gcm = dir.path().join("foo.gcm");

        let b = setup(dir.path(), CompilerInfo::test_gcc());
        let (bmi, _) = b.ctx.targets.insert(
            &target::BMI,
            dir.path(),
            "",
            "foo",
            Some("gcm".into()),
            DeclKind::Real,
        );
        let mut p = crate::target::Prerequisite::new(&target::MXX, dir.path().to_path_buf(), "foo");
        p.ext = Some("mxx".into());
        bmi.prerequisites.write().unwrap().push(p);

        spawner(&b).push(dep_ok(&mxx, &[]));
        spawner(&b).push(ScriptedRun::exit(0).creating(&gcm, "bmi"));
        b.ctx.update(&bmi).unwrap();

        let pre = dir.path().join("foo.gcm.i");
        assert!(pre.exists());

        // Promoted to persistent: survives release.
        drop(bmi);
        drop(b);
        assert!(pre.exists());
    }

    #[test]
    fn test_msvc_interface_source_gate() {
        // Below 19.30 a module interface compiles from the original
        // source; newer toolchains take the preprocessed unit.
        for (minor, expect_preprocessed) in [(29u32, false), (30u32, true)] {
            let dir = tempfile::tempdir().unwrap();
            let mxx = dir.path().join("foo.mxx");
            std::fs::write(&mxx, "export module foo;\n").unwrap();
            let ifc = dir.path().join("foo.ifc");

            let mut ci = CompilerInfo::test_msvc();
            ci.version_minor = minor;

            let b = setup(dir.path(), ci);
            let (bmi, _) = b.ctx.targets.insert(
                &target::BMI,
                dir.path(),
                "",
                "foo",
                Some("ifc".into()),
                DeclKind::Real,
            );
            let mut p =
                crate::target::Prerequisite::new(&target::MXX, dir.path().to_path_buf(), "foo");
            p.ext = Some("mxx".into());
            bmi.prerequisites.write().unwrap().push(p);

            spawner(&b).push(ScriptedRun::output(0, "foo.mxx\n", "")); // /showIncludes
            spawner(&b).push(ScriptedRun::exit(0).creating(&ifc, "ifc"));
            b.ctx.update(&bmi).unwrap();

            let inv = spawner(&b).invocations();
            let last = inv[1].args.last().unwrap().clone();
            if expect_preprocessed {
                assert!(last.ends_with("foo.ifc.i"), "args: {:?}", inv[1].args);
            } else {
                assert!(last.ends_with("foo.mxx"), "args: {:?}", inv[1].args);
            }
        }
    }

    #[test]
    fn test_msvc_command_line_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("main.cxx");
        std::fs::write(&src, "int main() { return 0; }\n").unwrap();
        let obj = dir.path().join("main.obj");

        let mut ci = CompilerInfo::test_msvc();
        ci.separate_preprocess = false; // Skip extraction for brevity.
        ci.modules = false;

        let b = setup(dir.path(), ci);
        spawner(&b).push(ScriptedRun::exit(0).creating(&obj, "obj"));
        let t = obj_target(&b, dir.path(), "main", "main");
        b.ctx.update(&t).unwrap();

        let inv = spawner(&b).invocations();
        let args = &inv[0].args;
        assert!(args.contains(&"/nologo".to_string()));
        assert!(args.contains(&"/EHsc".to_string()));
        assert!(args.contains(&"/MD".to_string()));
        assert!(args.iter().any(|a| a.starts_with("/Fo:")));
    }
}
