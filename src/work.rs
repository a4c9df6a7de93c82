//! The execution graph and its drive loop.
//!
//! One `Execution` exists per `(kind, depth, name)` key: "make this target
//! current at this dynamic depth".  Depth-0 executions build files and
//! transients; a depth-d execution (d > 0) computes the level-d dependency
//! list of its target by reading built list files.  The loop advances ready
//! executions, launches up to K commands, and feeds completions back in.

use crate::dep::{
    self, Dep, Flags, FlagStack, F_IGNORE_TIMESTAMP, F_NEWLINE_SEPARATED, F_NUL_SEPARATED,
    F_OPTIONAL, F_OVERRIDE_TRIVIAL, F_PERSISTENT, F_TRIVIAL, F_VARIABLE,
};
use crate::dynlist::{self, Separator};
use crate::error::{Error, Place, Result, Styles};
use crate::name::{Binding, Target, TargetKind};
use crate::progress::{Counts, Progress};
use crate::rule::{Rule, RuleSet};
use crate::signal;
use crate::task::{self, Launch, Redirect, Runner};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, Instant, SystemTime};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ExecId(usize);

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
struct ExecKey {
    kind: TargetKind,
    depth: u32,
    name: String,
}

impl ExecKey {
    fn raw(&self) -> String {
        let base = match self.kind {
            TargetKind::File => self.name.clone(),
            TargetKind::Transient => format!("@{}", self.name),
        };
        let mut ret = base;
        for _ in 0..self.depth {
            ret = format!("[{}]", ret);
        }
        ret
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Phase {
    Init,
    Waiting,
    Building,
    Done,
    Failed,
}

#[derive(Clone, Copy, Debug)]
enum EdgeKind {
    /// An ordinary dependency edge; depth > 0 triggers dynamic expansion
    /// when the child completes.
    Dep,
    /// The link from a depth-d execution to the same target at depth d-1.
    Chain,
    /// A result-gathering edge of a depth>=2 execution; the inherited
    /// transitive flags are applied to the gathered elements.
    Gather { merge_flags: Flags },
}

#[derive(Clone)]
struct Edge {
    child: ExecId,
    kind: EdgeKind,
    depth: u32,
    flags: Flags,
    stack: FlagStack,
    place: Place,
    var_name: Option<String>,
    done: bool,
}

/// Bookkeeping for a launched command, used for cleanup and statistics.
struct JobInfo {
    redirect: Option<Redirect>,
    /// File targets with their pre-run mtimes, for partial-output removal.
    targets: Vec<(String, Option<SystemTime>)>,
}

struct Execution {
    key: ExecKey,
    phase: Phase,
    rule: Option<Rc<Rule>>,
    binding: Binding,
    /// For secondary targets of a multi-target rule: the execution that
    /// actually runs the command.
    alias_of: Option<ExecId>,
    parents: Vec<ExecId>,
    edges: Vec<Edge>,
    /// Trivial dependencies awaiting the second pass.
    deferred: Vec<Rc<Dep>>,
    second_pass: bool,
    pending: usize,
    error: u32,
    /// Latest timestamp among dependencies not excluded by flags.
    dep_timestamp: Option<SystemTime>,
    /// The timestamp this execution presents to its parents.
    self_timestamp: Option<SystemTime>,
    vars: Vec<(String, String)>,
    /// For depth > 0: the computed dependency list.
    result: Vec<Rc<Dep>>,
    expanded: bool,
    /// A file leaf without a rule that does not exist.  Each referencing
    /// edge decides whether that is an error: optional edges tolerate it.
    missing: bool,
    sep: Separator,
    /// The flags applying to the base target, fixed by the edge that
    /// created this execution.
    base_flags: Flags,
    override_trivial: bool,
    /// Where this target was first required, for diagnostics.
    first_place: Place,
    is_root: bool,
    launch: Option<Launch>,
    job: Option<JobInfo>,
    reported: bool,
}

impl Execution {
    fn new(
        key: ExecKey,
        sep: Separator,
        base_flags: Flags,
        first_place: Place,
        override_trivial: bool,
    ) -> Execution {
        Execution {
            key,
            phase: Phase::Init,
            rule: None,
            binding: Binding::new(),
            alias_of: None,
            parents: Vec::new(),
            edges: Vec::new(),
            deferred: Vec::new(),
            second_pass: false,
            pending: 0,
            error: 0,
            dep_timestamp: None,
            self_timestamp: None,
            vars: Vec::new(),
            result: Vec::new(),
            expanded: false,
            missing: false,
            sep,
            base_flags,
            override_trivial,
            first_place,
            is_root: false,
            launch: None,
            job: None,
            reported: false,
        }
    }

    fn is_final(&self) -> bool {
        matches!(self.phase, Phase::Done | Phase::Failed)
    }
}

#[derive(Clone)]
pub struct Options {
    pub parallelism: usize,
    pub keep_going: bool,
    pub question: bool,
    pub silent: bool,
    pub keep_partial: bool,
    pub default_sep: Separator,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            parallelism: 1,
            keep_going: false,
            question: false,
            silent: false,
            keep_partial: false,
            default_sep: Separator::Stu,
        }
    }
}

/// What a finished run reports back to the caller.
#[derive(Debug)]
pub struct Summary {
    /// Accumulated exit bits: 1 for build errors, 2 for logical errors.
    pub error: u32,
    pub commands_run: usize,
    /// Question mode: some command would have run.
    pub out_of_date: bool,
    pub counts: Counts,
}

pub struct Work<'a> {
    rules: &'a RuleSet,
    options: Options,
    progress: &'a Progress,
    styles: Styles,
    execs: Vec<Execution>,
    keys: HashMap<ExecKey, ExecId>,
    ready: VecDeque<ExecId>,
    queue: Vec<ExecId>,
    launched: Vec<ExecId>,
    runner: Runner,
    drain: bool,
    error: u32,
    out_of_date: bool,
    counts: Counts,
    root: ExecId,
}

const TRANSITIVE_MASK: Flags = F_PERSISTENT | F_OPTIONAL | F_TRIVIAL;

fn stat_mtime(name: &str) -> Result<Option<SystemTime>> {
    match std::fs::metadata(name) {
        Ok(meta) => {
            let mtime = meta.modified().map_err(|e| {
                Error::system(Place::None, format!("stat {}: {}", name, e))
            })?;
            Ok(Some(mtime))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::system(
            Place::None,
            format!("stat {}: {}", name, e),
        )),
    }
}

fn max_time(a: Option<SystemTime>, b: Option<SystemTime>) -> Option<SystemTime> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}

/// Expand concatenations among a computed dependency list, preserving
/// element order.
fn flatten_elements(elements: &[Rc<Dep>], out: &mut Vec<Rc<Dep>>) -> Result<()> {
    for e in elements {
        match dep::expand_nested_concat(e)? {
            Some(expanded) => flatten_elements(&expanded, out)?,
            None => out.push(e.clone()),
        }
    }
    Ok(())
}

impl<'a> Work<'a> {
    pub fn new(
        rules: &'a RuleSet,
        options: Options,
        progress: &'a Progress,
        styles: Styles,
    ) -> Work<'a> {
        let root_key = ExecKey {
            kind: TargetKind::Transient,
            depth: 0,
            name: String::new(),
        };
        let mut root = Execution::new(
            root_key.clone(),
            options.default_sep,
            0,
            Place::None,
            false,
        );
        root.is_root = true;
        let mut keys = HashMap::new();
        keys.insert(root_key, ExecId(0));
        let parallelism = options.parallelism.max(1);
        Work {
            rules,
            options,
            progress,
            styles,
            execs: vec![root],
            keys,
            ready: VecDeque::from([ExecId(0)]),
            queue: Vec::new(),
            launched: Vec::new(),
            runner: Runner::new(parallelism),
            drain: false,
            error: 0,
            out_of_date: false,
            counts: Counts::default(),
            root: ExecId(0),
        }
    }

    fn exec(&self, id: ExecId) -> &Execution {
        &self.execs[id.0]
    }

    fn exec_mut(&mut self, id: ExecId) -> &mut Execution {
        &mut self.execs[id.0]
    }

    /// Request that a top-level dependency be brought up to date.
    pub fn want(&mut self, dep: &Rc<Dep>) -> Result<()> {
        let mut split = Vec::new();
        Dep::split(dep, &mut split);
        for d in split {
            self.add_dep(self.root, &d)?;
        }
        Ok(())
    }

    /// The separator a dependency's flags select, falling back to the
    /// run-wide default.
    fn separator_for(&self, flags: Flags) -> Separator {
        if flags & F_NUL_SEPARATED != 0 {
            Separator::Nul
        } else if flags & F_NEWLINE_SEPARATED != 0 {
            Separator::Newline
        } else {
            self.options.default_sep
        }
    }

    fn get_or_create(
        &mut self,
        key: ExecKey,
        sep: Separator,
        base_flags: Flags,
        place: &Place,
        override_trivial: bool,
    ) -> ExecId {
        if let Some(&id) = self.keys.get(&key) {
            return id;
        }
        let id = ExecId(self.execs.len());
        self.keys.insert(key.clone(), id);
        self.execs.push(Execution::new(
            key,
            sep,
            base_flags,
            place.clone(),
            override_trivial,
        ));
        self.ready.push_back(id);
        id
    }

    /// True when `target` is an ancestor of `from` (or the same node),
    /// walking parent links; fills `path` with the chain from `from` up.
    fn find_cycle(&self, from: ExecId, target: ExecId, path: &mut Vec<ExecId>) -> bool {
        path.push(from);
        if from == target {
            return true;
        }
        for &p in &self.exec(from).parents {
            if self.find_cycle(p, target, path) {
                return true;
            }
        }
        path.pop();
        false
    }

    /// Add one normalized dependency edge below `parent`.
    fn add_dep(&mut self, parent: ExecId, dep: &Rc<Dep>) -> Result<()> {
        if let Some(expanded) = dep::expand_nested_concat(dep)? {
            for e in expanded {
                self.add_dep(parent, &e)?;
            }
            return Ok(());
        }

        let (stack, direct, all_flags) = dep::peel(dep)?;
        let depth = stack.depth();
        let kind = direct.target.kind;
        let name = direct.target.name.unparametrized().to_string();
        let place = direct.place.clone();
        let edge_flags = direct.base.flags | (all_flags & F_IGNORE_TIMESTAMP);

        if depth > 0 && kind == TargetKind::Transient {
            return Err(Error::logical(
                place,
                format!(
                    "dynamic dependency must not be applied to transient target {}",
                    self.styles.word(&format!("@{}", name))
                ),
            ));
        }

        // A trivial edge is deferred until a non-trivial reason forces a
        // rebuild of the parent.
        if edge_flags & F_TRIVIAL != 0
            && edge_flags & F_OVERRIDE_TRIVIAL == 0
            && !self.exec(parent).override_trivial
            && !self.exec(parent).second_pass
        {
            self.exec_mut(parent).deferred.push(dep.clone());
            return Ok(());
        }

        let var_name = if direct.base.flags & F_VARIABLE != 0 {
            Some(if direct.variable_name.is_empty() {
                name.clone()
            } else {
                direct.variable_name.clone()
            })
        } else {
            None
        };

        let sep = self.separator_for(all_flags);
        let key = ExecKey { kind, depth, name };
        let override_trivial =
            edge_flags & F_OVERRIDE_TRIVIAL != 0 || self.exec(parent).override_trivial;
        let child = self.get_or_create(key, sep, edge_flags, &place, override_trivial);

        let mut path = Vec::new();
        if self.find_cycle(parent, child, &mut path) {
            let mut err = Error::logical(
                place,
                format!(
                    "circular dependency involving {}",
                    self.styles.word(&self.exec(child).key.raw())
                ),
            );
            for &id in path.iter().rev() {
                if self.exec(id).is_root {
                    continue;
                }
                err = err.note(
                    self.exec(id).first_place.clone(),
                    format!("within {}", self.styles.word(&self.exec(id).key.raw())),
                );
            }
            return Err(err);
        }

        self.push_edge(
            parent,
            Edge {
                child,
                kind: EdgeKind::Dep,
                depth,
                flags: edge_flags,
                stack,
                place,
                var_name,
                done: false,
            },
        )
    }

    fn push_edge(&mut self, parent: ExecId, edge: Edge) -> Result<()> {
        let child = edge.child;
        self.exec_mut(parent).edges.push(edge);
        self.exec_mut(parent).pending += 1;
        if !self.exec(child).parents.contains(&parent) {
            self.exec_mut(child).parents.push(parent);
        }
        if self.exec(child).is_final() {
            let idx = self.exec(parent).edges.len() - 1;
            self.complete_edge(parent, idx)?;
        }
        Ok(())
    }

    /// Resolve the given edge after its child reached a terminal phase.
    fn complete_edge(&mut self, parent: ExecId, idx: usize) -> Result<()> {
        let edge = self.exec(parent).edges[idx].clone();
        debug_assert!(!edge.done);
        self.exec_mut(parent).edges[idx].done = true;
        self.exec_mut(parent).pending -= 1;

        let child_phase = self.exec(edge.child).phase;
        if child_phase == Phase::Failed {
            let child_error = self.exec(edge.child).error;
            self.exec_mut(parent).error |= child_error;
            self.ready.push_back(parent);
            return Ok(());
        }

        // A file leaf that does not exist and has no rule: an optional
        // edge short-circuits to done-absent, any other edge fails.
        if self.exec(edge.child).missing {
            if edge.flags & F_OPTIONAL == 0 {
                if !self.exec(edge.child).reported {
                    self.exec_mut(edge.child).reported = true;
                    let name = self.exec(edge.child).key.name.clone();
                    let mut err = Error::build(
                        edge.place.clone(),
                        format!(
                            "no rule to build {}, and the file does not exist",
                            self.styles.word(&name)
                        ),
                    );
                    for (place, text) in self.needed_by_chain(edge.child) {
                        err = err.note(place, text);
                    }
                    err.print(&self.styles);
                }
                self.exec_mut(parent).error |= 1;
                self.error |= 1;
                if !self.options.keep_going {
                    self.drain = true;
                }
            }
            self.ready.push_back(parent);
            return Ok(());
        }

        // Timestamp contribution, unless the edge opts out.
        if edge.flags & (F_PERSISTENT | F_IGNORE_TIMESTAMP) == 0 {
            let ts = self.exec(edge.child).self_timestamp;
            let cur = self.exec(parent).dep_timestamp;
            self.exec_mut(parent).dep_timestamp = max_time(cur, ts);
        }

        if let Some(var) = &edge.var_name {
            let filename = self.exec(edge.child).key.name.clone();
            let content = std::fs::read(&filename).map_err(|e| {
                Error::system(
                    edge.place.clone(),
                    format!("read variable file {}: {}", filename, e),
                )
            })?;
            let value = String::from_utf8_lossy(&content)
                .trim_end_matches('\n')
                .to_string();
            self.exec_mut(parent).vars.push((var.clone(), value));
        }

        if matches!(edge.kind, EdgeKind::Dep) && edge.depth > 0 {
            // Dynamic expansion: merge the computed list into our own
            // children, inheriting the transitive flags of the levels
            // above the base.
            let inherited = edge.stack.above_base() & TRANSITIVE_MASK;
            let elements = self.exec(edge.child).result.clone();
            for e in elements {
                let merged = if inherited != 0 {
                    Rc::new(e.with_flags(inherited, &edge.place))
                } else {
                    e
                };
                self.add_dep(parent, &merged)?;
            }
        }

        self.ready.push_back(parent);
        Ok(())
    }

    fn advance(&mut self, id: ExecId) -> Result<()> {
        match self.exec(id).phase {
            Phase::Init => {
                self.enumerate(id)?;
                self.decide(id)
            }
            Phase::Waiting => self.decide(id),
            _ => Ok(()),
        }
    }

    /// Leave INIT: look up the rule and create child edges.
    fn enumerate(&mut self, id: ExecId) -> Result<()> {
        self.exec_mut(id).phase = Phase::Waiting;
        if self.exec(id).is_root {
            return Ok(());
        }
        let key = self.exec(id).key.clone();

        if key.depth > 0 {
            // Chain to the same target one level down.  The base flags
            // ride along so an optional absent base stays tolerated.
            let child_key = ExecKey {
                kind: key.kind,
                depth: key.depth - 1,
                name: key.name.clone(),
            };
            let sep = self.exec(id).sep;
            let base_flags = self.exec(id).base_flags;
            let place = self.exec(id).first_place.clone();
            let override_trivial = self.exec(id).override_trivial;
            let child = self.get_or_create(child_key, sep, base_flags, &place, override_trivial);
            return self.push_edge(
                id,
                Edge {
                    child,
                    kind: EdgeKind::Chain,
                    depth: 0,
                    flags: base_flags & F_OPTIONAL,
                    stack: FlagStack::new(),
                    place,
                    var_name: None,
                    done: false,
                },
            );
        }

        let target = Target {
            kind: key.kind,
            name: key.name.clone(),
        };
        let found = match self.rules.lookup(&target, &self.styles) {
            Ok(found) => found,
            Err(err) => {
                // Ambiguity is confined to this subtree in -k mode.
                let err = err.note(
                    self.exec(id).first_place.clone(),
                    format!("needed for {}", self.styles.word(&target.raw())),
                );
                self.fail(id, 2, Some(err));
                return Ok(());
            }
        };
        let m = match found {
            None => return Ok(()), // decided later: file leaf or missing rule
            Some(m) => m,
        };
        self.exec_mut(id).rule = Some(m.rule.clone());
        self.exec_mut(id).binding = m.binding.clone();

        // Secondary targets of a multi-target rule delegate to the first.
        if m.rule.targets.len() > 1 {
            let first = m.rule.targets[0].instantiate(&m.binding);
            if first.name != key.name || first.kind != key.kind {
                let place = self.exec(id).first_place.clone();
                let sep = self.exec(id).sep;
                let builder = self.get_or_create(
                    ExecKey {
                        kind: first.kind,
                        depth: 0,
                        name: first.name,
                    },
                    sep,
                    0,
                    &place,
                    false,
                );
                self.exec_mut(id).alias_of = Some(builder);
                return self.push_edge(
                    id,
                    Edge {
                        child: builder,
                        kind: EdgeKind::Dep,
                        depth: 0,
                        flags: 0,
                        stack: FlagStack::new(),
                        place,
                        var_name: None,
                        done: false,
                    },
                );
            }
        }

        let deps = m.rule.deps.clone();
        let binding = m.binding;
        for dep in &deps {
            let inst = dep.instantiate(&binding)?;
            let mut split = Vec::new();
            Dep::split(&inst, &mut split);
            for d in split {
                self.add_dep(id, &d)?;
            }
        }

        // The source of a copy rule is itself a dependency.
        let copy = m.rule.copy.clone();
        if let Some(copy) = &copy {
            let source = copy.name.instantiate(&binding);
            let dep = Rc::new(Dep::Direct(crate::dep::DirectDep::new(
                0,
                crate::name::ParamTarget {
                    kind: TargetKind::File,
                    name: crate::name::ParamName::plain(source),
                    place: copy.place.clone(),
                },
            )));
            self.add_dep(id, &dep)?;
        }

        Ok(())
    }

    /// All children final: compute the result or make the rebuild decision.
    fn decide(&mut self, id: ExecId) -> Result<()> {
        if self.exec(id).phase != Phase::Waiting || self.exec(id).pending > 0 {
            return Ok(());
        }
        if self.exec(id).error != 0 {
            let bits = self.exec(id).error;
            self.fail(id, bits, None);
            return Ok(());
        }
        if self.exec(id).is_root {
            self.exec_mut(id).phase = Phase::Done;
            return Ok(());
        }
        if self.exec(id).key.depth > 0 {
            return self.decide_dynamic(id);
        }
        self.decide_build(id)
    }

    fn decide_dynamic(&mut self, id: ExecId) -> Result<()> {
        let key = self.exec(id).key.clone();
        // An optional base that turned out absent yields an empty list.
        let chain_child = self.exec(id).edges[0].child;
        if self.exec(chain_child).missing {
            self.exec_mut(id).missing = true;
            self.finish_timestamp(id);
            return self.set_done(id);
        }
        if key.depth == 1 {
            // The base file is up to date: read it as a dependency list.
            let content = match std::fs::read(&key.name) {
                Ok(c) => c,
                Err(e) => {
                    let err = Error::build(
                        self.exec(id).first_place.clone(),
                        format!(
                            "cannot read dynamic dependency file {}: {}",
                            self.styles.word(&key.name),
                            e
                        ),
                    );
                    self.fail(id, 1, Some(err));
                    return Ok(());
                }
            };
            let sep = self.exec(id).sep;
            match dynlist::parse(&content, &key.name, sep, &self.styles) {
                Ok(deps) => {
                    let mut result = Vec::new();
                    for d in &deps {
                        Dep::split(d, &mut result);
                    }
                    self.exec_mut(id).result = result;
                    self.finish_timestamp(id);
                    self.set_done(id)
                }
                Err(err) => {
                    let err = err.note(
                        self.exec(id).first_place.clone(),
                        format!(
                            "in dynamic dependency {}",
                            self.styles.word(&key.raw())
                        ),
                    );
                    self.fail(id, 2, Some(err));
                    Ok(())
                }
            }
        } else if !self.exec(id).expanded {
            // The level below is computed; gather the lists of each of its
            // elements.
            self.exec_mut(id).expanded = true;
            let chain_child = self.exec(id).edges[0].child;
            let mut elements = Vec::new();
            flatten_elements(&self.exec(chain_child).result.clone(), &mut elements)?;
            for e in &elements {
                let (stack, direct, all_flags) = dep::peel(e)?;
                let mut merge_flags = stack.above_base() & TRANSITIVE_MASK;
                merge_flags |= stack.base() & TRANSITIVE_MASK;
                let name = direct.target.name.unparametrized().to_string();
                let place = direct.place.clone();
                let sep = self.separator_for(all_flags);
                let child_key = ExecKey {
                    kind: TargetKind::File,
                    depth: stack.depth() + 1,
                    name,
                };
                let override_trivial = self.exec(id).override_trivial;
                let child = self.get_or_create(
                    child_key,
                    sep,
                    direct.base.flags,
                    &place,
                    override_trivial,
                );
                self.push_edge(
                    id,
                    Edge {
                        child,
                        kind: EdgeKind::Gather { merge_flags },
                        depth: 0,
                        flags: direct.base.flags,
                        stack,
                        place,
                        var_name: None,
                        done: false,
                    },
                )?;
            }
            self.decide(id)
        } else {
            // Every gathered list is ready; concatenate in edge order.
            let edges = self.exec(id).edges.clone();
            let mut result = Vec::new();
            for edge in &edges {
                if let EdgeKind::Gather { merge_flags } = edge.kind {
                    for e in self.exec(edge.child).result.clone() {
                        let merged = if merge_flags != 0 {
                            Rc::new(e.with_flags(merge_flags, &edge.place))
                        } else {
                            e
                        };
                        result.push(merged);
                    }
                }
            }
            self.exec_mut(id).result = result;
            self.finish_timestamp(id);
            self.set_done(id)
        }
    }

    /// Present the max of the dependency timestamps to parents.
    fn finish_timestamp(&mut self, id: ExecId) {
        let ts = self.exec(id).dep_timestamp;
        let cur = self.exec(id).self_timestamp;
        self.exec_mut(id).self_timestamp = max_time(cur, ts);
    }

    fn decide_build(&mut self, id: ExecId) -> Result<()> {
        let key = self.exec(id).key.clone();
        let rule = self.exec(id).rule.clone();

        let rule = match rule {
            None => {
                if key.kind == TargetKind::File {
                    match stat_mtime(&key.name)? {
                        Some(ts) => {
                            self.exec_mut(id).self_timestamp = Some(ts);
                            return self.set_done(id);
                        }
                        None => {
                            // Absent file leaf: whether this is an error
                            // depends on each referencing edge's flags.
                            self.exec_mut(id).missing = true;
                            return self.set_done(id);
                        }
                    }
                }
                let err = Error::logical(
                    self.exec(id).first_place.clone(),
                    format!(
                        "no rule to build transient target {}",
                        self.styles.word(&format!("@{}", key.name))
                    ),
                );
                self.fail(id, 2, Some(err));
                return Ok(());
            }
            Some(rule) => rule,
        };

        // Secondary target of a multi-target rule: the builder ran; the
        // file must now exist.
        if self.exec(id).alias_of.is_some() {
            match stat_mtime(&key.name)? {
                Some(ts) => {
                    self.exec_mut(id).self_timestamp = Some(ts);
                    return self.set_done(id);
                }
                None => {
                    let err = Error::build(
                        rule.place().clone(),
                        format!(
                            "command did not create target {}",
                            self.styles.word(&key.name)
                        ),
                    );
                    self.fail(id, 1, Some(err));
                    return Ok(());
                }
            }
        }

        let self_mtime = if key.kind == TargetKind::File {
            stat_mtime(&key.name)?
        } else {
            None
        };

        let need_build = if let Some(copy) = &rule.copy {
            let source = copy.name.instantiate(&self.exec(id).binding);
            let src_mtime = stat_mtime(&source)?;
            copy.force
                || match (self_mtime, src_mtime) {
                    (None, _) => true,
                    (Some(t), Some(s)) => s > t,
                    (Some(_), None) => false,
                }
        } else if rule.is_hardcoded {
            let content = rule.command.as_ref().unwrap().text.as_bytes();
            match std::fs::read(&key.name) {
                Ok(existing) => existing != content,
                Err(_) => true,
            }
        } else if rule.command.is_none() {
            // Dependency-only rule: nothing to run.
            if key.kind == TargetKind::File && self_mtime.is_none() {
                let err = Error::build(
                    rule.place().clone(),
                    format!(
                        "rule for {} has no command, and the file does not exist",
                        self.styles.word(&key.name)
                    ),
                );
                self.fail(id, 1, Some(err));
                return Ok(());
            }
            false
        } else {
            match key.kind {
                TargetKind::Transient => true,
                TargetKind::File => match self_mtime {
                    None => true,
                    Some(t) => match self.exec(id).dep_timestamp {
                        Some(d) => d > t,
                        None => false,
                    },
                },
            }
        };

        if !need_build {
            self.exec_mut(id).deferred.clear();
            self.exec_mut(id).self_timestamp = match key.kind {
                TargetKind::File => self_mtime,
                TargetKind::Transient => self.exec(id).dep_timestamp,
            };
            return self.set_done(id);
        }

        // A rebuild is required.  First bring deferred trivial
        // dependencies up to date.
        if !self.exec(id).second_pass && !self.exec(id).deferred.is_empty() {
            self.exec_mut(id).second_pass = true;
            let deferred = std::mem::take(&mut self.exec_mut(id).deferred);
            for dep in deferred {
                let overridden = Rc::new(dep.with_flags(F_OVERRIDE_TRIVIAL, &Place::None));
                self.add_dep(id, &overridden)?;
            }
            return self.decide(id);
        }

        if self.options.question {
            self.out_of_date = true;
            self.drain = true;
            self.exec_mut(id).self_timestamp = self.exec(id).dep_timestamp;
            return self.set_done(id);
        }

        if self.drain {
            // No new work is started once a failure was observed.
            return Ok(());
        }

        if rule.copy.is_some() || rule.is_hardcoded {
            return self.run_inline_action(id, &rule);
        }

        self.prepare_launch(id, &rule)
    }

    /// Hardcoded content and copies act directly on the filesystem,
    /// bypassing the shell.
    fn run_inline_action(&mut self, id: ExecId, rule: &Rc<Rule>) -> Result<()> {
        let key = self.exec(id).key.clone();
        self.counts.run += 1;
        let outcome = if let Some(copy) = &rule.copy {
            let source = copy.name.instantiate(&self.exec(id).binding);
            task::copy_preserving(&source, &key.name)
        } else {
            let content = rule.command.as_ref().unwrap().text.clone();
            task::write_atomic(&key.name, content.as_bytes())
        };
        match outcome {
            Ok(()) => {
                self.counts.succeeded += 1;
                self.exec_mut(id).self_timestamp = stat_mtime(&key.name)?;
                self.set_done(id)
            }
            Err(e) => {
                self.counts.failed += 1;
                let err = Error::build(
                    rule.place().clone(),
                    format!("cannot build {}: {}", self.styles.word(&key.name), e),
                );
                self.fail(id, 1, Some(err));
                if !self.options.keep_going {
                    self.drain = true;
                }
                Ok(())
            }
        }
    }

    /// Build the concrete command and queue it for a job slot.
    fn prepare_launch(&mut self, id: ExecId, rule: &Rc<Rule>) -> Result<()> {
        let binding = self.exec(id).binding.clone();
        let cmdline = rule.instantiate_command(&binding).unwrap();

        let redirect = match rule.redirect_index {
            Some(i) => {
                let dest = rule.targets[i].instantiate(&binding).name;
                Some(Redirect {
                    tmp: task::tmp_path(&dest),
                    dest: PathBuf::from(dest),
                })
            }
            None => None,
        };
        let stdin = rule
            .input
            .as_ref()
            .map(|(name, _)| PathBuf::from(name.instantiate(&binding)));

        let mut targets = Vec::new();
        for t in &rule.targets {
            if t.kind != TargetKind::File {
                continue;
            }
            let name = t.instantiate(&binding).name;
            task::create_parent_dirs(&name).map_err(|e| {
                Error::system(t.place.clone(), format!("{}", e))
            })?;
            targets.push((name.clone(), stat_mtime(&name)?));
        }

        let env = self.exec(id).vars.clone();
        self.exec_mut(id).launch = Some(Launch {
            cmdline,
            stdin,
            redirect: redirect.clone(),
            env,
        });
        self.exec_mut(id).job = Some(JobInfo { redirect, targets });
        self.exec_mut(id).phase = Phase::Building;
        self.queue.push(id);
        Ok(())
    }

    fn launch(&mut self, id: ExecId) -> Result<()> {
        let launch = self.exec_mut(id).launch.take().unwrap();
        self.progress.command(&launch.cmdline);
        self.counts.run += 1;
        match self.runner.start(id.0, &launch) {
            Ok(()) => {
                self.launched.push(id);
                Ok(())
            }
            Err(e) => Err(Error::system(
                self.exec(id).first_place.clone(),
                format!("cannot execute command: {}", e),
            )),
        }
    }

    fn finish_job(&mut self, id: ExecId, termination: task::Termination) -> Result<()> {
        self.launched.retain(|&l| l != id);
        let key = self.exec(id).key.clone();
        let job = self.exec_mut(id).job.take().unwrap();

        if termination.success() {
            if let Some(redirect) = &job.redirect {
                std::fs::rename(&redirect.tmp, &redirect.dest).map_err(|e| {
                    Error::system(
                        Place::None,
                        format!(
                            "rename {} to {}: {}",
                            redirect.tmp.display(),
                            redirect.dest.display(),
                            e
                        ),
                    )
                })?;
            }
            match key.kind {
                TargetKind::File => match stat_mtime(&key.name)? {
                    Some(ts) => {
                        self.exec_mut(id).self_timestamp = Some(ts);
                    }
                    None => {
                        let rule = self.exec(id).rule.clone().unwrap();
                        let err = Error::build(
                            rule.place().clone(),
                            format!(
                                "command succeeded but did not create target {}",
                                self.styles.word(&key.name)
                            ),
                        );
                        self.counts.failed += 1;
                        self.fail(id, 1, Some(err));
                        if !self.options.keep_going {
                            self.drain = true;
                        }
                        return Ok(());
                    }
                },
                TargetKind::Transient => {
                    let ts = self.exec(id).dep_timestamp;
                    self.exec_mut(id).self_timestamp = ts;
                }
            }
            self.counts.succeeded += 1;
            return self.set_done(id);
        }

        self.counts.failed += 1;
        self.cleanup_job(&job);
        let rule = self.exec(id).rule.clone().unwrap();
        let err = Error::build(
            rule.place().clone(),
            format!(
                "command for {} {}",
                self.styles.word(&key.raw()),
                termination.describe()
            ),
        );
        self.fail(id, 1, Some(err));
        if !self.options.keep_going {
            self.drain = true;
        }
        Ok(())
    }

    /// Remove partial outputs of a failed or interrupted job.
    fn cleanup_job(&self, job: &JobInfo) {
        if self.options.keep_partial {
            return;
        }
        if let Some(redirect) = &job.redirect {
            let _ = std::fs::remove_file(&redirect.tmp);
        }
        for (name, pre_mtime) in &job.targets {
            let modified = match (stat_mtime(name), pre_mtime) {
                (Ok(Some(_)), None) => true,
                (Ok(Some(now)), Some(pre)) => now > *pre,
                _ => false,
            };
            if modified {
                let _ = std::fs::remove_file(name);
            }
        }
    }

    fn set_done(&mut self, id: ExecId) -> Result<()> {
        self.exec_mut(id).phase = Phase::Done;
        self.propagate(id)
    }

    fn fail(&mut self, id: ExecId, bits: u32, err: Option<Error>) {
        self.exec_mut(id).error |= bits;
        self.error |= bits;
        self.exec_mut(id).phase = Phase::Failed;
        if let Some(mut err) = err {
            if !self.exec(id).reported {
                self.exec_mut(id).reported = true;
                for (place, text) in self.needed_by_chain(id) {
                    err = err.note(place, text);
                }
                err.print(&self.styles);
            }
        }
        // Failure propagation cannot itself fail.
        let _ = self.propagate(id);
    }

    /// The "needed by" chain from this execution up to the root, following
    /// first parents.
    fn needed_by_chain(&self, id: ExecId) -> Vec<(Place, String)> {
        let mut ret = Vec::new();
        let mut cur = id;
        loop {
            let parent = match self.exec(cur).parents.first() {
                None => break,
                Some(&p) => p,
            };
            if self.exec(parent).is_root {
                break;
            }
            let place = self
                .exec(parent)
                .edges
                .iter()
                .find(|e| e.child == cur)
                .map(|e| e.place.clone())
                .unwrap_or(Place::None);
            ret.push((
                place,
                format!(
                    "needed by {}",
                    self.styles.word(&self.exec(parent).key.raw())
                ),
            ));
            cur = parent;
        }
        ret
    }

    /// Tell every parent that this execution reached a terminal phase.
    fn propagate(&mut self, id: ExecId) -> Result<()> {
        let parents = self.exec(id).parents.clone();
        for p in parents {
            loop {
                let idx = self
                    .exec(p)
                    .edges
                    .iter()
                    .position(|e| e.child == id && !e.done);
                match idx {
                    Some(i) => self.complete_edge(p, i)?,
                    None => break,
                }
            }
        }
        Ok(())
    }

    /// The cooperative loop: drive, launch, wait, repeat.
    pub fn run(&mut self) -> Result<Summary> {
        loop {
            while let Some(id) = self.ready.pop_front() {
                self.advance(id)?;
            }

            while !self.drain && self.runner.can_start_more() {
                match self.queue.pop() {
                    Some(id) => self.launch(id)?,
                    None => break,
                }
            }

            if let Some(sig) = signal::termination() {
                self.shutdown(sig);
            }
            if signal::take_stats_request() {
                let running: Vec<String> = self
                    .launched
                    .iter()
                    .map(|&id| self.exec(id).key.raw())
                    .collect();
                self.progress.snapshot(&self.counts, &running);
            }

            if self.runner.is_running() {
                if let Some(fin) = self.runner.wait(Duration::from_millis(500)) {
                    self.finish_job(ExecId(fin.token), fin.termination)?;
                }
                continue;
            }

            if !self.ready.is_empty() {
                continue;
            }
            if !self.queue.is_empty() && !self.drain {
                continue;
            }
            break;
        }

        Ok(Summary {
            error: self.error,
            commands_run: self.counts.run,
            out_of_date: self.out_of_date,
            counts: self.counts,
        })
    }

    /// Orderly shutdown on SIGINT/SIGTERM/SIGHUP.
    fn shutdown(&mut self, sig: i32) -> ! {
        self.runner.terminate_all();
        let deadline = Instant::now() + Duration::from_secs(2);
        while self.runner.is_running() && Instant::now() < deadline {
            self.runner.wait(Duration::from_millis(100));
        }
        for &id in &self.launched {
            if let Some(job) = &self.exec(id).job {
                self.cleanup_job(job);
            }
        }
        signal::reraise(sig)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse;
    use crate::tokenize;

    fn ruleset(text: &str) -> RuleSet {
        let file: Rc<str> = "t.stu".into();
        let (tokens, place_end) = tokenize::tokenize(text.as_bytes(), &file).unwrap();
        let rules = parse::parse_rules(&tokens, &place_end, &Styles::plain()).unwrap();
        let mut set = RuleSet::new();
        for r in rules {
            set.add(r, &Styles::plain()).unwrap();
        }
        set
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("stu-test-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn cycle_is_detected() {
        let rules = ruleset("A: B { x }\nB: A { x }\n");
        let progress = Progress::new(true);
        let mut work = Work::new(&rules, Options::default(), &progress, Styles::plain());
        let dep = parse::parse_target_expression("A").unwrap();
        work.want(&dep).unwrap();
        let err = work.run().unwrap_err();
        assert!(err.text.contains("circular dependency"));
    }

    #[test]
    fn self_cycle_is_detected() {
        let rules = ruleset("A: A { x }\n");
        let progress = Progress::new(true);
        let mut work = Work::new(&rules, Options::default(), &progress, Styles::plain());
        let dep = parse::parse_target_expression("A").unwrap();
        work.want(&dep).unwrap();
        assert!(work.run().is_err());
    }

    #[test]
    fn missing_leaf_file_fails() {
        let dir = scratch_dir("missing-leaf");
        let name = dir.join("no-such-file").to_string_lossy().into_owned();
        let rules = RuleSet::new();
        let progress = Progress::new(true);
        let mut work = Work::new(&rules, Options::default(), &progress, Styles::plain());
        let dep = parse::parse_target_expression(&name).unwrap();
        work.want(&dep).unwrap();
        let summary = work.run().unwrap();
        assert_eq!(summary.error & 1, 1);
        assert_eq!(summary.commands_run, 0);
    }

    #[test]
    fn existing_leaf_file_is_up_to_date() {
        let dir = scratch_dir("leaf-ok");
        let name = dir.join("input").to_string_lossy().into_owned();
        std::fs::write(&name, "data").unwrap();
        let rules = RuleSet::new();
        let progress = Progress::new(true);
        let mut work = Work::new(&rules, Options::default(), &progress, Styles::plain());
        let dep = parse::parse_target_expression(&name).unwrap();
        work.want(&dep).unwrap();
        let summary = work.run().unwrap();
        assert_eq!(summary.error, 0);
        assert_eq!(summary.commands_run, 0);
    }

    #[test]
    fn optional_missing_dep_is_skipped() {
        let rules = RuleSet::new();
        let progress = Progress::new(true);
        let mut work = Work::new(&rules, Options::default(), &progress, Styles::plain());
        let dep = parse::parse_target_expression("?definitely-not-there").unwrap();
        work.want(&dep).unwrap();
        let summary = work.run().unwrap();
        assert_eq!(summary.error, 0);
    }

    #[test]
    fn missing_transient_rule_is_logical_error() {
        let rules = RuleSet::new();
        let progress = Progress::new(true);
        let mut work = Work::new(&rules, Options::default(), &progress, Styles::plain());
        let dep = parse::parse_target_expression("@bundle").unwrap();
        work.want(&dep).unwrap();
        let summary = work.run().unwrap();
        assert_eq!(summary.error & 2, 2);
    }
}
