//! Parameterized names and targets.
//!
//! A parameterized name is an alternating sequence of literal text fragments
//! and parameter references, e.g. `list.$name.txt`.  Rendering substitutes a
//! binding of parameter names to values; unification runs the other way,
//! matching a concrete name against the pattern and producing bindings.

use crate::error::{Place, Styles};
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TargetKind {
    File,
    Transient,
}

/// A concrete, fully-rendered target.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Target {
    pub kind: TargetKind,
    pub name: String,
}

impl Target {
    pub fn file(name: impl Into<String>) -> Target {
        Target {
            kind: TargetKind::File,
            name: name.into(),
        }
    }

    /// The name as the user wrote it, with `@` for transients.
    pub fn raw(&self) -> String {
        match self.kind {
            TargetKind::File => self.name.clone(),
            TargetKind::Transient => format!("@{}", self.name),
        }
    }
}

/// A mapping of parameter name to bound value.
pub type Binding = BTreeMap<String, String>;

/// `texts` and `params` alternate: texts[0] param[0] texts[1] ... texts[n].
/// There is always one more text than parameters; texts may be empty except
/// between two parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParamName {
    texts: Vec<String>,
    params: Vec<String>,
}

impl ParamName {
    pub fn plain(text: impl Into<String>) -> ParamName {
        ParamName {
            texts: vec![text.into()],
            params: Vec::new(),
        }
    }

    pub fn new() -> ParamName {
        ParamName::plain("")
    }

    pub fn push_text(&mut self, text: &str) {
        self.texts.last_mut().unwrap().push_str(text);
    }

    pub fn push_param(&mut self, param: &str) {
        self.params.push(param.to_string());
        self.texts.push(String::new());
    }

    pub fn n(&self) -> usize {
        self.params.len()
    }

    pub fn is_unparametrized(&self) -> bool {
        self.params.is_empty()
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    pub fn texts(&self) -> &[String] {
        &self.texts
    }

    pub fn last_text(&self) -> &str {
        self.texts.last().unwrap()
    }

    /// The single text of an unparameterized name.
    pub fn unparametrized(&self) -> &str {
        assert!(self.params.is_empty());
        &self.texts[0]
    }

    /// The name as written, with `$param` markers.
    pub fn raw(&self) -> String {
        let mut ret = self.texts[0].clone();
        for (i, param) in self.params.iter().enumerate() {
            ret.push('$');
            ret.push_str(param);
            ret.push_str(&self.texts[i + 1]);
        }
        ret
    }

    /// Substitute every parameter.  The binding must cover all of them.
    pub fn instantiate(&self, binding: &Binding) -> String {
        let mut ret = self.texts[0].clone();
        for (i, param) in self.params.iter().enumerate() {
            ret.push_str(binding.get(param).map(|s| s.as_str()).unwrap_or(""));
            ret.push_str(&self.texts[i + 1]);
        }
        ret
    }

    /// A duplicated parameter name, if any.
    pub fn duplicate_param(&self) -> Option<&str> {
        for (i, param) in self.params.iter().enumerate() {
            if self.params[i + 1..].contains(param) {
                return Some(param);
            }
        }
        None
    }

    /// Two parameters not separated by at least one literal character, if
    /// any.
    pub fn adjacent_params(&self) -> Option<(&str, &str)> {
        for i in 1..self.params.len() {
            if self.texts[i].is_empty() {
                return Some((&self.params[i - 1], &self.params[i]));
            }
        }
        None
    }

    /// Unify against a concrete name.  Each parameter binds a maximal
    /// non-empty substring subject to the remaining literals matching, so
    /// bindings come out in greedy, leftmost-longest order.  Values may not
    /// be empty, may not contain NUL, and may not contain `/` unless the
    /// concrete name itself does.
    pub fn matches(&self, concrete: &str) -> Vec<Binding> {
        let mut out = Vec::new();
        if self.params.is_empty() {
            if self.texts[0] == concrete {
                out.push(Binding::new());
            }
            return out;
        }
        if !concrete.starts_with(&self.texts[0]) {
            return out;
        }
        let allow_slash = concrete.contains('/');
        let mut binding = Binding::new();
        self.match_from(
            concrete,
            self.texts[0].len(),
            0,
            allow_slash,
            &mut binding,
            &mut out,
        );
        out
    }

    fn match_from(
        &self,
        s: &str,
        pos: usize,
        param: usize,
        allow_slash: bool,
        binding: &mut Binding,
        out: &mut Vec<Binding>,
    ) {
        let next_text = &self.texts[param + 1];
        let last = param + 1 == self.params.len();
        let value_ok = |v: &str| {
            !v.is_empty() && !v.contains('\0') && (allow_slash || !v.contains('/'))
        };
        if last && next_text.is_empty() {
            // Final parameter runs to the end of the name.
            let value = &s[pos..];
            if value_ok(value) {
                binding.insert(self.params[param].clone(), value.to_string());
                out.push(binding.clone());
                binding.remove(&self.params[param]);
            }
            return;
        }
        // Candidate end positions for this parameter's value, largest first.
        let rest = &s[pos..];
        let mut candidates: Vec<usize> = rest
            .match_indices(next_text.as_str())
            .map(|(i, _)| pos + i)
            .collect();
        candidates.reverse();
        for end in candidates {
            if last && end + next_text.len() != s.len() {
                continue;
            }
            let value = &s[pos..end];
            if !value_ok(value) {
                continue;
            }
            binding.insert(self.params[param].clone(), value.to_string());
            if last {
                out.push(binding.clone());
            } else {
                self.match_from(s, end + next_text.len(), param + 1, allow_slash, binding, out);
            }
            binding.remove(&self.params[param]);
        }
    }

    /// If this name ends in `/`, append the part of `target` past its last
    /// `/` (or the whole of `target` if it has none).  Used by copy rules.
    pub fn append_copy_tail(&mut self, target: &ParamName) {
        if !self.last_text().ends_with('/') {
            return;
        }
        // Find the last slash in the target, scanning fragments from the
        // right; parameters are not considered for containing slashes.
        for i in (0..target.texts.len()).rev() {
            if let Some(j) = target.texts[i].rfind('/') {
                self.push_text(&target.texts[i][j + 1..]);
                for k in i..target.params.len() {
                    self.push_param(&target.params[k]);
                    self.push_text(&target.texts[k + 1]);
                }
                return;
            }
        }
        // No slashes in the target: append it whole.
        self.push_text(&target.texts[0]);
        for k in 0..target.params.len() {
            self.push_param(&target.params[k]);
            self.push_text(&target.texts[k + 1]);
        }
    }
}

/// A possibly-parameterized target with its declaration place.
#[derive(Clone, Debug)]
pub struct ParamTarget {
    pub kind: TargetKind,
    pub name: ParamName,
    pub place: Place,
}

impl ParamTarget {
    pub fn instantiate(&self, binding: &Binding) -> Target {
        Target {
            kind: self.kind,
            name: self.name.instantiate(binding),
        }
    }

    pub fn raw(&self) -> String {
        match self.kind {
            TargetKind::File => self.name.raw(),
            TargetKind::Transient => format!("@{}", self.name.raw()),
        }
    }

    pub fn format_word(&self, styles: &Styles) -> String {
        styles.word(&self.raw())
    }
}
