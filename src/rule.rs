//! Rules and the rule set with its parameter-unification lookup.

use crate::dep::Dep;
use crate::error::{Error, Place, Result, Styles};
use crate::name::{Binding, ParamName, ParamTarget, Target};
use std::collections::HashMap;
use std::rc::Rc;

/// A shell command or hardcoded content body.
#[derive(Clone, Debug)]
pub struct Command {
    pub text: String,
    pub place: Place,
}

/// The source of a copy rule (`A = src;`).
#[derive(Clone, Debug)]
pub struct CopySource {
    pub name: ParamName,
    pub place: Place,
    /// `= !src`: copy even when the target is newer.
    pub force: bool,
}

/// A declared rule.  Exactly one of: a command (`is_hardcoded` false),
/// hardcoded content (`is_hardcoded` true), a copy source, or nothing
/// (dependency-only rule ending in `;`).
#[derive(Debug)]
pub struct Rule {
    pub targets: Vec<ParamTarget>,
    pub deps: Vec<Rc<Dep>>,
    pub command: Option<Command>,
    pub is_hardcoded: bool,
    /// `<` input redirection: the dependency used as stdin.
    pub input: Option<(ParamName, Place)>,
    /// Index into `targets` of the `>` output-redirected target.
    pub redirect_index: Option<usize>,
    pub copy: Option<CopySource>,
}

impl Rule {
    /// Where the rule is declared (its first target).
    pub fn place(&self) -> &Place {
        &self.targets[0].place
    }

    pub fn is_parametrized(&self) -> bool {
        self.targets[0].name.n() > 0
    }

    /// Substitute the rule's parameters into its command text.  Only
    /// `$param`/`${param}` forms naming an actual parameter are replaced;
    /// everything else is left for the shell.
    pub fn instantiate_command(&self, binding: &Binding) -> Option<String> {
        let command = self.command.as_ref()?;
        let text = &command.text;
        let mut ret = String::with_capacity(text.len());
        let bytes = text.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] != b'$' {
                ret.push(bytes[i] as char);
                i += 1;
                continue;
            }
            // '$$' stays untouched for the shell.
            if i + 1 < bytes.len() && bytes[i + 1] == b'$' {
                ret.push_str("$$");
                i += 2;
                continue;
            }
            let (ident, consumed) = if i + 1 < bytes.len() && bytes[i + 1] == b'{' {
                let mut j = i + 2;
                while j < bytes.len() && bytes[j] != b'}' {
                    j += 1;
                }
                if j < bytes.len() {
                    (&text[i + 2..j], j + 1 - i)
                } else {
                    ("", 1)
                }
            } else {
                let mut j = i + 1;
                while j < bytes.len() && (bytes[j].is_ascii_alphanumeric() || bytes[j] == b'_') {
                    j += 1;
                }
                (&text[i + 1..j], j - i)
            };
            match binding.get(ident) {
                Some(value) => {
                    ret.push_str(value);
                    i += consumed;
                }
                None => {
                    ret.push('$');
                    i += 1;
                }
            }
        }
        Some(ret)
    }
}

/// The outcome of a rule lookup for one concrete target.
#[derive(Debug)]
pub struct Match {
    pub rule: Rc<Rule>,
    pub binding: Binding,
}

/// All declared rules, in two buckets: unparameterized rules indexed by
/// exact target, parameterized rules scanned linearly per lookup.
#[derive(Default)]
pub struct RuleSet {
    unparam: HashMap<Target, Rc<Rule>>,
    param: Vec<Rc<Rule>>,
    /// The first unparameterized target declared; built when no target is
    /// requested on the command line.
    first: Option<Target>,
}

impl RuleSet {
    pub fn new() -> RuleSet {
        RuleSet::default()
    }

    pub fn first_target(&self) -> Option<&Target> {
        self.first.as_ref()
    }

    pub fn add(&mut self, rule: Rc<Rule>, styles: &Styles) -> Result<()> {
        if rule.is_parametrized() {
            for prev in &self.param {
                for t in &rule.targets {
                    for pt in &prev.targets {
                        if pt.kind == t.kind && pt.name.raw() == t.name.raw() {
                            return Err(Error::logical(
                                t.place.clone(),
                                format!("duplicate rule for target {}", t.format_word(styles)),
                            )
                            .note(
                                pt.place.clone(),
                                "already declared here".to_string(),
                            ));
                        }
                    }
                }
            }
            self.param.push(rule);
            return Ok(());
        }
        for t in &rule.targets {
            let target = Target {
                kind: t.kind,
                name: t.name.unparametrized().to_string(),
            };
            if let Some(prev) = self.unparam.get(&target) {
                return Err(Error::logical(
                    t.place.clone(),
                    format!("duplicate rule for target {}", t.format_word(styles)),
                )
                .note(prev.place().clone(), "already declared here".to_string()));
            }
            if self.first.is_none() {
                self.first = Some(target.clone());
            }
            self.unparam.insert(target, rule.clone());
        }
        Ok(())
    }

    /// Find the rule building `target`.  An exact unparameterized rule wins;
    /// otherwise parameterized rules are tried by unification, and more than
    /// one applicable rule is a logical error.
    pub fn lookup(&self, target: &Target, styles: &Styles) -> Result<Option<Match>> {
        if let Some(rule) = self.unparam.get(target) {
            return Ok(Some(Match {
                rule: rule.clone(),
                binding: Binding::new(),
            }));
        }
        let mut found: Option<(Rc<Rule>, Binding)> = None;
        for rule in &self.param {
            let mut binding = None;
            for t in &rule.targets {
                if t.kind != target.kind {
                    continue;
                }
                let bindings = t.name.matches(&target.name);
                if let Some(b) = bindings.into_iter().next() {
                    binding = Some(b);
                    break;
                }
            }
            let binding = match binding {
                None => continue,
                Some(b) => b,
            };
            if let Some((prev, _)) = &found {
                return Err(Error::logical(
                    Place::None,
                    format!(
                        "two matching rules for target {}",
                        styles.word(&target.raw())
                    ),
                )
                .note(prev.place().clone(), "one is declared here".to_string())
                .note(rule.place().clone(), "the other is declared here".to_string()));
            }
            found = Some((rule.clone(), binding));
        }
        Ok(found.map(|(rule, binding)| Match { rule, binding }))
    }
}
