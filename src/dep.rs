//! The dependency data model.
//!
//! A dependency is one edge of the build graph as written in the script:
//! possibly nested (dynamic), grouped (compound) or composed (concatenated).
//! Values are immutable after construction and shared via `Rc`; anything
//! that "adds" flags builds a fresh node.

use crate::error::{Error, Place, Result, Styles};
use crate::name::{Binding, ParamTarget, TargetKind};
use std::rc::Rc;

/// Flag bits carried on a single dependency edge.  The simplest dependency
/// is all-zero; each bit enables one feature.
pub type Flags = u32;

/// (-p) When the dependency is newer than the target, don't rebuild.
pub const F_PERSISTENT: Flags = 1 << 0;
/// (-o) Don't create the dependency if it doesn't exist.
pub const F_OPTIONAL: Flags = 1 << 1;
/// (-t) Trivial dependency.
pub const F_TRIVIAL: Flags = 1 << 2;
/// (!) The dependency's timestamp is ignored.
pub const F_IGNORE_TIMESTAMP: Flags = 1 << 3;
/// Content of the file is read as further dependencies; set only on the
/// link between a dynamic execution and its base.
pub const F_READ: Flags = 1 << 4;
/// ($[...]) Content of the file is used as a variable.
pub const F_VARIABLE: Flags = 1 << 5;
/// Set on links in the second trivial pass; never written by users.
pub const F_OVERRIDE_TRIVIAL: Flags = 1 << 6;
/// (-n) A dynamic list file contains newline-separated names.
pub const F_NEWLINE_SEPARATED: Flags = 1 << 7;
/// (-0) A dynamic list file contains NUL-separated names.
pub const F_NUL_SEPARATED: Flags = 1 << 8;

/// The first flags are transitive: they are inherited across dynamic
/// expansion, and each carries a place for diagnostics.
pub const FLAG_TRANSITIVE: usize = 3;

/// Maximum dynamic nesting; bounded by the flag stack representation.
pub const MAX_DYNAMIC_DEPTH: u32 = 31;

/// Textual form of a flags value, shown before the name it applies to.
/// Empty when no displayable flag is set.
pub fn flags_format(flags: Flags) -> String {
    let mut ret = String::new();
    for (bit, text) in [
        (F_PERSISTENT, "-p "),
        (F_OPTIONAL, "-o "),
        (F_TRIVIAL, "-t "),
        (F_IGNORE_TIMESTAMP, "! "),
        (F_NEWLINE_SEPARATED, "-n "),
        (F_NUL_SEPARATED, "-0 "),
    ] {
        if flags & bit != 0 {
            ret.push_str(text);
        }
    }
    ret
}

/// The flag/place header shared by every dependency variant.
#[derive(Clone, Debug, Default)]
pub struct DepBase {
    pub flags: Flags,
    /// One place per transitive flag that is set.
    pub places: [Place; FLAG_TRANSITIVE],
}

impl DepBase {
    pub fn with_flags(flags: Flags) -> DepBase {
        DepBase {
            flags,
            places: Default::default(),
        }
    }

    /// Set `flags`, recording `place` for any transitive bit newly set.
    pub fn add(&mut self, flags: Flags, place: &Place) {
        for i in 0..FLAG_TRANSITIVE {
            if flags & (1 << i) != 0 && self.flags & (1 << i) == 0 {
                self.places[i] = place.clone();
            }
        }
        self.flags |= flags;
    }

    /// Merge an enclosing node's flags onto this one.  A place already set
    /// here wins over the outer one.
    pub fn merge_outer(&mut self, outer: &DepBase) {
        for i in 0..FLAG_TRANSITIVE {
            if outer.flags & (1 << i) != 0 && self.flags & (1 << i) == 0 {
                self.places[i] = outer.places[i].clone();
            }
        }
        self.flags |= outer.flags;
    }
}

/// A single named target as a dependency.  Never itself dynamic.
#[derive(Clone, Debug)]
pub struct DirectDep {
    pub base: DepBase,
    pub target: ParamTarget,
    /// Where the dependency is declared.
    pub place: Place,
    /// With F_VARIABLE: the variable name alias; otherwise empty.
    pub variable_name: String,
}

/// `[inner]`: the inner dependency's output names further dependencies.
#[derive(Clone, Debug)]
pub struct DynamicDep {
    pub base: DepBase,
    pub dep: Rc<Dep>,
}

/// `(a b c)`: a parenthesized group whose flags distribute over members.
#[derive(Clone, Debug)]
pub struct CompoundDep {
    pub base: DepBase,
    /// The place of the opening parenthesis.
    pub place: Place,
    pub deps: Vec<Rc<Dep>>,
}

/// `a*b`: the Cartesian product of the parts' element lists.
#[derive(Clone, Debug)]
pub struct ConcatDep {
    pub base: DepBase,
    pub deps: Vec<Rc<Dep>>,
}

#[derive(Clone, Debug)]
pub enum Dep {
    Direct(DirectDep),
    Dynamic(DynamicDep),
    Compound(CompoundDep),
    Concat(ConcatDep),
}

impl DirectDep {
    pub fn new(flags: Flags, target: ParamTarget) -> DirectDep {
        let place = target.place.clone();
        DirectDep {
            base: DepBase::with_flags(flags),
            target,
            place,
            variable_name: String::new(),
        }
    }
}

impl Dep {
    pub fn base(&self) -> &DepBase {
        match self {
            Dep::Direct(d) => &d.base,
            Dep::Dynamic(d) => &d.base,
            Dep::Compound(d) => &d.base,
            Dep::Concat(d) => &d.base,
        }
    }

    fn base_mut(&mut self) -> &mut DepBase {
        match self {
            Dep::Direct(d) => &mut d.base,
            Dep::Dynamic(d) => &mut d.base,
            Dep::Compound(d) => &mut d.base,
            Dep::Concat(d) => &mut d.base,
        }
    }

    pub fn flags(&self) -> Flags {
        self.base().flags
    }

    /// Where the dependency as a whole is declared.
    pub fn place(&self) -> Place {
        match self {
            Dep::Direct(d) => d.place.clone(),
            Dep::Dynamic(d) => d.dep.place(),
            Dep::Compound(d) => d.place.clone(),
            Dep::Concat(d) => d
                .deps
                .first()
                .map(|d| d.place())
                .unwrap_or(Place::None),
        }
    }

    /// A fresh node with additional flags, recording `place` for newly-set
    /// transitive bits.
    pub fn with_flags(&self, flags: Flags, place: &Place) -> Dep {
        let mut ret = self.clone();
        ret.base_mut().add(flags, place);
        ret
    }

    fn with_outer(&self, outer: &DepBase) -> Dep {
        let mut ret = self.clone();
        ret.base_mut().merge_outer(outer);
        ret
    }

    pub fn is_unparametrized(&self) -> bool {
        match self {
            Dep::Direct(d) => d.target.name.is_unparametrized(),
            Dep::Dynamic(d) => d.dep.is_unparametrized(),
            Dep::Compound(d) => d.deps.iter().all(|d| d.is_unparametrized()),
            Dep::Concat(d) => d.deps.iter().all(|d| d.is_unparametrized()),
        }
    }

    /// Substitute every parameter using the binding.
    pub fn instantiate(&self, binding: &Binding) -> Result<Rc<Dep>> {
        match self {
            Dep::Direct(d) => {
                let rendered = d.target.name.instantiate(binding);
                if d.base.flags & F_VARIABLE != 0 && rendered.contains('=') {
                    return Err(Error::logical(
                        d.place.clone(),
                        format!(
                            "variable dependency $[{}] must not be instantiated \
                             with a parameter value containing '='",
                            rendered
                        ),
                    ));
                }
                Ok(Rc::new(Dep::Direct(DirectDep {
                    base: d.base.clone(),
                    target: ParamTarget {
                        kind: d.target.kind,
                        name: crate::name::ParamName::plain(rendered),
                        place: d.target.place.clone(),
                    },
                    place: d.place.clone(),
                    variable_name: d.variable_name.clone(),
                })))
            }
            Dep::Dynamic(d) => Ok(Rc::new(Dep::Dynamic(DynamicDep {
                base: d.base.clone(),
                dep: d.dep.instantiate(binding)?,
            }))),
            Dep::Compound(d) => {
                let mut deps = Vec::with_capacity(d.deps.len());
                for child in &d.deps {
                    deps.push(child.instantiate(binding)?);
                }
                Ok(Rc::new(Dep::Compound(CompoundDep {
                    base: d.base.clone(),
                    place: d.place.clone(),
                    deps,
                })))
            }
            Dep::Concat(d) => {
                let mut deps = Vec::with_capacity(d.deps.len());
                for child in &d.deps {
                    deps.push(child.instantiate(binding)?);
                }
                Ok(Rc::new(Dep::Concat(ConcatDep {
                    base: d.base.clone(),
                    deps,
                })))
            }
        }
    }

    /// Flatten compound nodes recursively.  A compound's flags distribute
    /// over its members (a member's own flag place wins); dynamic nodes
    /// recurse into their inner dependency and rewrap each result;
    /// concatenated nodes pass through unchanged.
    pub fn split(dep: &Rc<Dep>, out: &mut Vec<Rc<Dep>>) {
        match &**dep {
            Dep::Direct(_) | Dep::Concat(_) => out.push(dep.clone()),
            Dep::Dynamic(d) => {
                let mut inner = Vec::new();
                Dep::split(&d.dep, &mut inner);
                for i in inner {
                    out.push(Rc::new(Dep::Dynamic(DynamicDep {
                        base: d.base.clone(),
                        dep: i,
                    })));
                }
            }
            Dep::Compound(c) => {
                for child in &c.deps {
                    let merged = Rc::new(child.with_outer(&c.base));
                    Dep::split(&merged, out);
                }
            }
        }
    }

    /// Plain rendering for diagnostics and verbose output.
    pub fn format_out(&self) -> String {
        match self {
            Dep::Direct(d) => {
                let var = d.base.flags & F_VARIABLE != 0;
                format!(
                    "{}{}{}{}",
                    flags_format(d.base.flags),
                    if var { "$[" } else { "" },
                    d.target.raw(),
                    if var { "]" } else { "" }
                )
            }
            Dep::Dynamic(d) => {
                format!("{}[{}]", flags_format(d.base.flags), d.dep.format_out())
            }
            Dep::Compound(d) => {
                let parts: Vec<String> = d.deps.iter().map(|d| d.format_out()).collect();
                format!("({})", parts.join(", "))
            }
            Dep::Concat(d) => {
                let parts: Vec<String> = d.deps.iter().map(|d| d.format_out()).collect();
                parts.join("*")
            }
        }
    }

    /// Rendering as a quoted or colored word inside a message.
    pub fn format_word(&self, styles: &Styles) -> String {
        styles.word(&self.format_out())
    }
}

/// Transitive flag bits per dynamic level.  Bit `j` of `bits[i]` is
/// transitive flag `i` at level `j`; level 0 is the innermost (base) target
/// and level `depth` the outermost dynamic wrapper.
///
/// Example: `-o [-p x]` has depth 1 with bit `o` at level 1 and bit `p` at
/// level 0.
#[derive(Clone, Debug)]
pub struct FlagStack {
    depth: u32,
    bits: [u32; FLAG_TRANSITIVE],
}

impl FlagStack {
    pub fn new() -> FlagStack {
        FlagStack {
            depth: 0,
            bits: [0; FLAG_TRANSITIVE],
        }
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// The flags at level `j`.
    pub fn get(&self, j: u32) -> Flags {
        let mut ret = 0;
        for i in 0..FLAG_TRANSITIVE {
            ret |= ((self.bits[i] >> j) & 1) << i;
        }
        ret
    }

    /// The flags on the base target itself.
    pub fn base(&self) -> Flags {
        self.get(0)
    }

    /// The union of every level above the base; these are the bits that
    /// propagate into dependencies read during expansion.
    pub fn above_base(&self) -> Flags {
        let mut ret = 0;
        for j in 1..=self.depth {
            ret |= self.get(j);
        }
        ret
    }

    pub fn add_lowest(&mut self, flags: Flags) {
        for i in 0..FLAG_TRANSITIVE {
            self.bits[i] |= ((flags >> i) & 1) as u32;
        }
    }

    /// Add a lowest level, shifting existing levels up.
    pub fn push(&mut self) -> Result<()> {
        if self.depth + 1 >= MAX_DYNAMIC_DEPTH {
            return Err(Error::fatal("dynamic dependency recursion limit exceeded"));
        }
        self.depth += 1;
        for i in 0..FLAG_TRANSITIVE {
            self.bits[i] <<= 1;
        }
        Ok(())
    }
}

/// Peel a chain of dynamic wrappers from the outside in, producing the flag
/// stack, the innermost direct dependency, and the union of all flags seen
/// along the chain (used for separator selection).
pub fn peel(dep: &Rc<Dep>) -> Result<(FlagStack, &DirectDep, Flags)> {
    let mut stack = FlagStack::new();
    let mut all = 0;
    let mut cur = dep;
    loop {
        match &**cur {
            Dep::Dynamic(d) => {
                stack.add_lowest(d.base.flags);
                all |= d.base.flags;
                stack.push()?;
                cur = &d.dep;
            }
            Dep::Direct(d) => {
                stack.add_lowest(d.base.flags);
                all |= d.base.flags;
                return Ok((stack, d, all));
            }
            Dep::Compound(_) | Dep::Concat(_) => {
                return Err(Error::fatal(
                    "dependency not normalized before flag stack construction",
                ));
            }
        }
    }
}

/// Expand a concatenation found at the top of a dependency or nested under
/// dynamic wrappers, rewrapping the product elements in the same dynamic
/// chain.  Returns None when the dependency contains no concatenation at
/// that position.
pub fn expand_nested_concat(dep: &Rc<Dep>) -> Result<Option<Vec<Rc<Dep>>>> {
    match &**dep {
        Dep::Concat(c) => Ok(Some(expand_concat(c)?)),
        Dep::Dynamic(d) => match expand_nested_concat(&d.dep)? {
            None => Ok(None),
            Some(inner) => Ok(Some(
                inner
                    .into_iter()
                    .map(|i| {
                        Rc::new(Dep::Dynamic(DynamicDep {
                            base: d.base.clone(),
                            dep: i,
                        }))
                    })
                    .collect(),
            )),
        },
        _ => Ok(None),
    }
}

/// Expand a concatenation into the Cartesian product of its parts' element
/// lists.  Names concatenate left to right, flags union, and the target
/// kind comes from the leftmost part.  Only direct elements may appear:
/// dynamic or variable operands are rejected.
pub fn expand_concat(c: &ConcatDep) -> Result<Vec<Rc<Dep>>> {
    let mut acc: Vec<DirectDep> = Vec::new();
    for (pi, part) in c.deps.iter().enumerate() {
        let mut split = Vec::new();
        Dep::split(part, &mut split);
        let mut elems: Vec<DirectDep> = Vec::new();
        for e in &split {
            match &**e {
                Dep::Direct(d) => {
                    if d.base.flags & F_VARIABLE != 0 {
                        return Err(Error::logical(
                            d.place.clone(),
                            "variable dependency must not be used inside concatenation",
                        ));
                    }
                    elems.push(d.clone());
                }
                Dep::Concat(inner) => {
                    for x in expand_concat(inner)? {
                        match &*x {
                            Dep::Direct(d) => elems.push(d.clone()),
                            _ => unreachable!(),
                        }
                    }
                }
                Dep::Dynamic(_) => {
                    return Err(Error::logical(
                        e.place(),
                        "dynamic dependency must not be used inside concatenation",
                    ));
                }
                Dep::Compound(_) => unreachable!("split leaves no compound nodes"),
            }
        }
        if pi == 0 {
            acc = elems;
            continue;
        }
        let mut next = Vec::with_capacity(acc.len() * elems.len());
        for left in &acc {
            for right in &elems {
                if right.target.kind == TargetKind::Transient {
                    return Err(Error::logical(
                        right.place.clone(),
                        "transient target must not be used past the first \
                         part of a concatenation",
                    ));
                }
                let mut combined = left.clone();
                let mut name = combined.target.name;
                name.push_text(right.target.name.unparametrized());
                combined.target.name = name;
                combined.base.merge_outer(&right.base);
                next.push(combined);
            }
        }
        acc = next;
    }
    Ok(acc
        .into_iter()
        .map(|mut d| {
            d.base.merge_outer(&c.base);
            Rc::new(Dep::Direct(d))
        })
        .collect())
}
