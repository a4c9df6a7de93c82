//! Recursive-descent parser over the token stream.
//!
//! Grammar, roughly:
//!
//! ```text
//! rule_list := rule*
//! rule      := target+ (':' expr*)? body
//! body      := ';' | command | '=' command | '=' '!'? name ';'
//! expr      := unary ('*' unary)*
//! unary     := ('!' | '?' | '&' | flags) expr
//!            | '(' expr* ')' | '[' expr* ']'
//!            | '$' '[' ... ']' | '<'? '@'? name
//! ```
//!
//! Semantic checks (single input/output redirection, copy-rule and
//! hardcoded-content restrictions, parameter agreement) are enforced here,
//! not deferred.

use crate::dep::{
    CompoundDep, ConcatDep, Dep, DepBase, DirectDep, DynamicDep, Flags, F_IGNORE_TIMESTAMP,
    F_NEWLINE_SEPARATED, F_NUL_SEPARATED, F_OPTIONAL, F_TRIVIAL, F_VARIABLE,
};
use crate::error::{Error, Place, Result, Styles};
use crate::name::{ParamName, ParamTarget, TargetKind};
use crate::rule::{Command, CopySource, Rule};
use crate::tokenize::Token;
use std::collections::BTreeSet;
use std::rc::Rc;

/// The single `<` input redirection of a rule, filled during expression
/// parsing.
#[derive(Default)]
struct InputCtx {
    /// The redirected filename and its place.
    name: Option<(ParamName, Place)>,
    /// The place of the `<` operator.
    place_input: Place,
}

pub struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    place_end: Place,
    styles: Styles,
}

/// Parse a whole script into rules.
pub fn parse_rules(
    tokens: &[Token],
    place_end: &Place,
    styles: &Styles,
) -> Result<Vec<Rc<Rule>>> {
    let mut p = Parser::new(tokens, place_end, styles);
    let mut rules = Vec::new();
    while let Some(rule) = p.parse_rule()? {
        rules.push(rule);
    }
    if let Some(tok) = p.peek() {
        return Err(Error::syntax(
            tok.place().clone(),
            format!("expected a rule, not {}", tok.format_start()),
        ));
    }
    Ok(rules)
}

/// Parse the content of a dynamic dependency file: an expression list in
/// which input redirection, variable dependencies and transient targets are
/// not allowed.
pub fn parse_dynamic_list(
    tokens: &[Token],
    place_end: &Place,
    styles: &Styles,
) -> Result<Vec<Rc<Dep>>> {
    let mut p = Parser::new(tokens, place_end, styles);
    let mut input = InputCtx::default();
    let deps = p.parse_expression_list(&mut input, &[], true)?;
    if let Some(tok) = p.peek() {
        return Err(Error::syntax(
            tok.place().clone(),
            format!("expected a dependency, not {}", tok.format_start()),
        ));
    }
    Ok(deps)
}

/// Parse a dependency as given on the command line outside of options:
/// leading `[`, `!`, `?` and `@` prefixes around a plain name, with
/// matching closing brackets.
pub fn parse_target_expression(text: &str) -> Result<Rc<Dep>> {
    let place = Place::Argv;
    if text.is_empty() {
        return Err(Error::logical(place, "target name must not be empty"));
    }
    let bytes = text.as_bytes();
    let mut end = bytes.len();
    let mut closing = 0;
    while end > 0 && bytes[end - 1] == b']' {
        closing += 1;
        end -= 1;
    }
    let mut q = 0;
    while q < end && matches!(bytes[q], b'[' | b'!' | b'?') {
        q += 1;
    }
    let mut begin = q;
    let mut kind = TargetKind::File;
    if begin < end && bytes[begin] == b'@' {
        kind = TargetKind::Transient;
        begin += 1;
    }
    if begin == end {
        return Err(Error::logical(place, "target name must not be empty"));
    }
    let name = &text[begin..end];
    let mut dep = Rc::new(Dep::Direct(DirectDep::new(
        0,
        ParamTarget {
            kind,
            name: ParamName::plain(name),
            place: place.clone(),
        },
    )));
    let mut opening = 0;
    for i in (0..q).rev() {
        match bytes[i] {
            b'!' => dep = Rc::new(dep.with_flags(F_IGNORE_TIMESTAMP, &place)),
            b'?' => dep = Rc::new(dep.with_flags(F_OPTIONAL, &place)),
            b'[' => {
                opening += 1;
                dep = Rc::new(Dep::Dynamic(DynamicDep {
                    base: DepBase::default(),
                    dep,
                }));
            }
            _ => unreachable!(),
        }
    }
    if opening != closing {
        return Err(Error::logical(
            place,
            format!("unbalanced brackets in '{}'", text),
        ));
    }
    Ok(dep)
}

impl<'a> Parser<'a> {
    fn new(tokens: &'a [Token], place_end: &Place, styles: &Styles) -> Parser<'a> {
        Parser {
            tokens,
            pos: 0,
            place_end: place_end.clone(),
            styles: *styles,
        }
    }

    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) {
        self.pos += 1;
    }

    fn is_op(&self, op: u8) -> bool {
        matches!(self.peek(), Some(Token::Operator(o)) if o.op == op)
    }

    /// Consume the operator if it is next, returning its place.
    fn take_op(&mut self, op: u8) -> Option<Place> {
        if let Some(Token::Operator(o)) = self.peek() {
            if o.op == op {
                let place = o.place.clone();
                self.advance();
                return Some(place);
            }
        }
        None
    }

    /// The place of the next token, or of the end of input.
    fn next_place(&self) -> Place {
        self.peek()
            .map(|t| t.place().clone())
            .unwrap_or_else(|| self.place_end.clone())
    }

    fn word(&self, s: &str) -> String {
        self.styles.word(s)
    }

    fn parse_rule(&mut self) -> Result<Option<Rc<Rule>>> {
        let start_pos = self.pos;

        let mut place_output: Option<Place> = None;
        let mut redirect_index: Option<usize> = None;
        let mut targets: Vec<ParamTarget> = Vec::new();

        loop {
            let place_output_new = self.take_op(b'>');

            let mut kind = TargetKind::File;
            let mut place_at: Option<Place> = None;
            if let Some(at) = self.take_op(b'@') {
                match self.peek() {
                    Some(Token::Name(_)) => {}
                    tok => {
                        let place = tok.map(|t| t.place().clone()).unwrap_or(self.place_end.clone());
                        let what = tok
                            .map(|t| format!("expected the name of a transient target, not {}", t.format_start()))
                            .unwrap_or_else(|| "expected the name of a transient target".to_string());
                        return Err(Error::syntax(place, what)
                            .note(at, "after '@'".to_string()));
                    }
                }
                if let Some(out) = &place_output_new {
                    return Err(Error::logical(
                        at.clone(),
                        "transient target is invalid".to_string(),
                    )
                    .note(out.clone(), "after output redirection using '>'".to_string()));
                }
                kind = TargetKind::Transient;
                place_at = Some(at);
            }

            let name_tok = match self.peek() {
                Some(Token::Name(n)) => n.clone(),
                tok => {
                    if let Some(out) = place_output_new {
                        let place = tok.map(|t| t.place().clone()).unwrap_or(self.place_end.clone());
                        let what = tok
                            .map(|t| format!("expected a filename, not {}", t.format_start()))
                            .unwrap_or_else(|| "expected a filename".to_string());
                        return Err(Error::syntax(place, what)
                            .note(out, "after output redirection using '>'".to_string()));
                    }
                    break;
                }
            };
            self.advance();

            if let Some(out) = place_output_new {
                if let Some(prev) = &place_output {
                    return Err(Error::logical(
                        out,
                        format!(
                            "there must not be a second output redirection {}",
                            self.word(&format!(">{}", name_tok.name.raw()))
                        ),
                    )
                    .note(prev.clone(), "shadowing previous output redirection".to_string()));
                }
                if name_tok.name.n() != 0 {
                    return Err(Error::logical(
                        out,
                        "output redirection using '>' must not be used".to_string(),
                    )
                    .note(
                        name_tok.place.clone(),
                        format!(
                            "for parameterized target {}",
                            self.word(&name_tok.name.raw())
                        ),
                    ));
                }
                place_output = Some(out);
                redirect_index = Some(targets.len());
            }

            let place_target = place_at.unwrap_or_else(|| name_tok.place.clone());

            if let Some((a, b)) = name_tok.name.adjacent_params() {
                return Err(Error::logical(
                    place_target,
                    format!(
                        "the two parameters {} and {} in the name {} must be \
                         separated by at least one character",
                        self.word(&format!("${}", a)),
                        self.word(&format!("${}", b)),
                        self.word(&name_tok.name.raw())
                    ),
                ));
            }
            if let Some(dup) = name_tok.name.duplicate_param() {
                return Err(Error::logical(
                    place_target,
                    format!(
                        "target {} must not contain duplicate parameter {}",
                        self.word(&name_tok.name.raw()),
                        self.word(&format!("${}", dup))
                    ),
                ));
            }

            targets.push(ParamTarget {
                kind,
                name: name_tok.name,
                place: place_target,
            });
        }

        if targets.is_empty() {
            assert_eq!(self.pos, start_pos);
            return Ok(None);
        }

        // All targets of one rule share the same parameter set.
        let params_0: BTreeSet<&String> = targets[0].name.params().iter().collect();
        for t in &targets[1..] {
            let params_t: BTreeSet<&String> = t.name.params().iter().collect();
            if params_t != params_0 {
                return Err(Error::logical(
                    t.place.clone(),
                    format!("parameters of target {} differ", t.format_word(&self.styles)),
                )
                .note(
                    targets[0].place.clone(),
                    format!(
                        "from parameters of target {} in rule with multiple targets",
                        targets[0].format_word(&self.styles)
                    ),
                ));
            }
        }

        if self.peek().is_none() {
            return Err(Error::syntax(
                self.place_end.clone(),
                "expected a command, ':', ';', or '='".to_string(),
            )
            .note(
                targets.last().unwrap().place.clone(),
                format!(
                    "after target {}",
                    targets.last().unwrap().format_word(&self.styles)
                ),
            ));
        }

        let mut deps: Vec<Rc<Dep>> = Vec::new();
        let mut had_colon = false;
        let mut input = InputCtx::default();

        if self.take_op(b':').is_some() {
            had_colon = true;
            deps = self.parse_expression_list(&mut input, &targets, false)?;
        }

        let mut command: Option<Command> = None;
        let mut is_hardcoded = false;
        let mut place_nocommand: Option<Place> = None;

        if let Some(Token::Command(c)) = self.peek() {
            command = Some(Command {
                text: c.text.clone(),
                place: c.place.clone(),
            });
            self.advance();
        } else if !had_colon && self.is_op(b'=') {
            let place_equal = self.take_op(b'=').unwrap();
            match self.peek() {
                None => {
                    return Err(Error::syntax(
                        self.place_end.clone(),
                        "expected a filename or '{'".to_string(),
                    )
                    .note(place_equal, "after '='".to_string()));
                }
                Some(Token::Command(c)) => {
                    // Hardcoded content.
                    if targets.len() != 1 {
                        return Err(Error::logical(
                            place_equal,
                            "there must not be assigned content using '='".to_string(),
                        )
                        .note(
                            targets[0].place.clone(),
                            format!(
                                "in rule for {}... with multiple targets",
                                targets[0].format_word(&self.styles)
                            ),
                        ));
                    }
                    if targets[0].kind == TargetKind::Transient {
                        return Err(Error::logical(
                            place_equal,
                            "there must not be assigned content using '='".to_string(),
                        )
                        .note(
                            targets[0].place.clone(),
                            format!(
                                "for transient target {}",
                                targets[0].format_word(&self.styles)
                            ),
                        ));
                    }
                    command = Some(Command {
                        text: c.text.clone(),
                        place: c.place.clone(),
                    });
                    is_hardcoded = true;
                    self.advance();
                }
                Some(_) => {
                    return self.parse_copy_rule(targets, place_equal, place_output);
                }
            }
        } else if let Some(place) = self.take_op(b';') {
            place_nocommand = Some(place);
        } else {
            let tok = self.peek();
            let place = tok.map(|t| t.place().clone()).unwrap_or(self.place_end.clone());
            let text = match tok {
                Some(t) if had_colon => format!(
                    "expected a dependency, a command, or ';', not {}",
                    t.format_start()
                ),
                Some(t) => format!(
                    "expected a command, ':', ';', or '=', not {}",
                    t.format_start()
                ),
                None if had_colon => "expected a dependency, a command, or ';'".to_string(),
                None => "expected a command, ':', ';', or '='".to_string(),
            };
            return Err(Error::syntax(place, text).note(
                targets[0].place.clone(),
                format!("for target {}", targets[0].format_word(&self.styles)),
            ));
        }

        if let Some(out) = &place_output {
            if command.is_none() {
                return Err(Error::logical(
                    out.clone(),
                    "output redirection using '>' must not be used".to_string(),
                )
                .note(
                    place_nocommand.unwrap_or_else(|| targets[0].place.clone()),
                    format!(
                        "in rule for {} without a command",
                        targets[0].format_word(&self.styles)
                    ),
                ));
            }
            if is_hardcoded {
                return Err(Error::logical(
                    out.clone(),
                    "output redirection using '>' must not be used".to_string(),
                )
                .note(
                    targets[0].place.clone(),
                    format!(
                        "in rule for {} with assigned content using '='",
                        targets[0].format_word(&self.styles)
                    ),
                ));
            }
        }

        if let Some((_, name_place)) = &input.name {
            if command.is_none() {
                return Err(Error::logical(
                    input.place_input.clone(),
                    "input redirection using '<' must not be used".to_string(),
                )
                .note(
                    place_nocommand.unwrap_or_else(|| name_place.clone()),
                    format!(
                        "in rule for {} without a command",
                        targets[0].format_word(&self.styles)
                    ),
                ));
            }
        }

        self.check_dep_params(&targets, &deps, &input)?;

        let input_redirect = input
            .name
            .take()
            .map(|(name, _)| (name, input.place_input.clone()));
        Ok(Some(Rc::new(Rule {
            targets,
            deps,
            command,
            is_hardcoded,
            input: input_redirect,
            redirect_index,
            copy: None,
        })))
    }

    fn parse_copy_rule(
        &mut self,
        targets: Vec<ParamTarget>,
        place_equal: Place,
        place_output: Option<Place>,
    ) -> Result<Option<Rc<Rule>>> {
        let mut force = false;
        while self.take_op(b'!').is_some() {
            force = true;
        }

        let name_tok = match self.peek() {
            Some(Token::Name(n)) => n.clone(),
            Some(Token::Operator(o)) if o.op == b'?' => {
                return Err(Error::logical(
                    o.place.clone(),
                    "optional dependency using '?' must not be used".to_string(),
                )
                .note(
                    place_equal,
                    format!(
                        "in copy rule using '=' for target {}",
                        targets[0].format_word(&self.styles)
                    ),
                ));
            }
            Some(Token::Operator(o)) if o.op == b'&' => {
                return Err(Error::logical(
                    o.place.clone(),
                    "trivial dependency using '&' must not be used".to_string(),
                )
                .note(
                    place_equal,
                    format!(
                        "in copy rule using '=' for target {}",
                        targets[0].format_word(&self.styles)
                    ),
                ));
            }
            tok => {
                let place = tok.map(|t| t.place().clone()).unwrap_or(self.place_end.clone());
                let text = tok
                    .map(|t| format!("expected a filename or '{{', not {}", t.format_start()))
                    .unwrap_or_else(|| "expected a filename or '{'".to_string());
                return Err(Error::syntax(place, text).note(place_equal, "after '='".to_string()));
            }
        };
        self.advance();

        // Every parameter of the source must appear in the target.
        let target_params: BTreeSet<&String> = targets[0].name.params().iter().collect();
        for param in name_tok.name.params() {
            if !target_params.contains(param) {
                return Err(Error::logical(
                    name_tok.place.clone(),
                    format!(
                        "parameter {} must not appear in copied file {}",
                        self.word(&format!("${}", param)),
                        self.word(&name_tok.name.raw())
                    ),
                )
                .note(
                    targets[0].place.clone(),
                    format!(
                        "because it does not appear in target {}",
                        targets[0].format_word(&self.styles)
                    ),
                ));
            }
        }

        if self.take_op(b';').is_none() {
            let place = self.next_place();
            return Err(Error::syntax(place, "expected ';'".to_string()).note(
                name_tok.place.clone(),
                format!(
                    "after copy dependency {}",
                    self.word(&name_tok.name.raw())
                ),
            ));
        }

        if let Some(out) = place_output {
            return Err(Error::logical(
                out,
                "output redirection using '>' must not be used".to_string(),
            )
            .note(
                place_equal,
                format!(
                    "in copy rule using '=' for target {}",
                    targets[0].format_word(&self.styles)
                ),
            ));
        }
        if targets.len() != 1 {
            return Err(Error::logical(
                place_equal,
                "there must not be a copy rule using '='".to_string(),
            )
            .note(
                targets[0].place.clone(),
                format!(
                    "for multiple targets {}...",
                    targets[0].format_word(&self.styles)
                ),
            ));
        }
        if targets[0].kind != TargetKind::File {
            return Err(Error::logical(
                place_equal,
                "copy rule using '=' cannot be used".to_string(),
            )
            .note(
                targets[0].place.clone(),
                format!(
                    "with transient target {}",
                    targets[0].format_word(&self.styles)
                ),
            ));
        }

        // A source ending in '/' takes the tail of the target name.
        let mut source = name_tok.name;
        source.append_copy_tail(&targets[0].name);

        Ok(Some(Rc::new(Rule {
            targets,
            deps: Vec::new(),
            command: None,
            is_hardcoded: false,
            input: None,
            redirect_index: None,
            copy: Some(CopySource {
                name: source,
                place: name_tok.place,
                force,
            }),
        })))
    }

    /// Every parameter used in a dependency or input redirection must
    /// appear in the rule's targets.
    fn check_dep_params(
        &self,
        targets: &[ParamTarget],
        deps: &[Rc<Dep>],
        input: &InputCtx,
    ) -> Result<()> {
        let target_params: BTreeSet<&String> = targets[0].name.params().iter().collect();
        fn walk<'d>(dep: &'d Dep, out: &mut Vec<(&'d String, Place)>) {
            match dep {
                Dep::Direct(d) => {
                    for p in d.target.name.params() {
                        out.push((p, d.place.clone()));
                    }
                }
                Dep::Dynamic(d) => walk(&d.dep, out),
                Dep::Compound(d) => {
                    for child in &d.deps {
                        walk(child, out);
                    }
                }
                Dep::Concat(d) => {
                    for child in &d.deps {
                        walk(child, out);
                    }
                }
            }
        }
        let mut used = Vec::new();
        for dep in deps {
            walk(dep, &mut used);
        }
        if let Some((name, place)) = &input.name {
            for p in name.params() {
                used.push((p, place.clone()));
            }
        }
        for (param, place) in used {
            if !target_params.contains(param) {
                return Err(Error::logical(
                    place,
                    format!(
                        "parameter {} must not appear in dependency",
                        self.word(&format!("${}", param))
                    ),
                )
                .note(
                    targets[0].place.clone(),
                    format!(
                        "because it does not appear in target {}",
                        targets[0].format_word(&self.styles)
                    ),
                ));
            }
        }
        Ok(())
    }

    fn parse_expression_list(
        &mut self,
        input: &mut InputCtx,
        targets: &[ParamTarget],
        in_dynamic: bool,
    ) -> Result<Vec<Rc<Dep>>> {
        let mut ret = Vec::new();
        while let Some(mut deps) = self.parse_expression(input, targets, in_dynamic)? {
            ret.append(&mut deps);
        }
        Ok(ret)
    }

    fn parse_expression(
        &mut self,
        input: &mut InputCtx,
        targets: &[ParamTarget],
        in_dynamic: bool,
    ) -> Result<Option<Vec<Rc<Dep>>>> {
        let mut lhs = match self.parse_unary(input, targets, in_dynamic)? {
            None => return Ok(None),
            Some(deps) => deps,
        };
        while let Some(place_star) = self.take_op(b'*') {
            let rhs = match self.parse_unary(input, targets, in_dynamic)? {
                Some(deps) => deps,
                None => {
                    let place = self.next_place();
                    return Err(Error::syntax(place, "expected a dependency".to_string())
                        .note(place_star, "after '*'".to_string()));
                }
            };
            let left = self.concat_operand(lhs, &place_star);
            let right = self.concat_operand(rhs, &place_star);
            let parts = match Rc::try_unwrap(left) {
                Ok(Dep::Concat(c)) => {
                    let mut parts = c.deps;
                    parts.push(right);
                    parts
                }
                Ok(other) => vec![Rc::new(other), right],
                Err(rc) => vec![rc, right],
            };
            lhs = vec![Rc::new(Dep::Concat(ConcatDep {
                base: DepBase::default(),
                deps: parts,
            }))];
        }
        Ok(Some(lhs))
    }

    /// A concatenation operand must be a single dependency; a multi-element
    /// expression is grouped into a compound.
    fn concat_operand(&self, mut deps: Vec<Rc<Dep>>, place: &Place) -> Rc<Dep> {
        if deps.len() == 1 {
            deps.pop().unwrap()
        } else {
            Rc::new(Dep::Compound(CompoundDep {
                base: DepBase::default(),
                place: place.clone(),
                deps,
            }))
        }
    }

    fn parse_unary(
        &mut self,
        input: &mut InputCtx,
        targets: &[ParamTarget],
        in_dynamic: bool,
    ) -> Result<Option<Vec<Rc<Dep>>>> {
        // Prefix flag operators.
        for (op, bit) in [
            (b'!', F_IGNORE_TIMESTAMP),
            (b'?', F_OPTIONAL),
            (b'&', F_TRIVIAL),
        ] {
            if let Some(place) = self.take_op(op) {
                if bit == F_OPTIONAL {
                    if let Some((_, _)) = &input.name {
                        return Err(Error::logical(
                            input.place_input.clone(),
                            "input redirection using '<' must not be used".to_string(),
                        )
                        .note(
                            place,
                            "in conjunction with optional dependencies using '?'".to_string(),
                        ));
                    }
                }
                return self.parse_flagged(bit, place, op as char, input, targets, in_dynamic);
            }
        }
        if let Some(Token::Flags(f)) = self.peek() {
            let flags = f.flags;
            let place = f.place.clone();
            self.advance();
            return self.parse_flagged(flags, place, '-', input, targets, in_dynamic);
        }

        // '(' expression* ')'
        if let Some(place_paren) = self.take_op(b'(') {
            let mut deps = Vec::new();
            loop {
                let mut more = self.parse_expression_list(input, targets, in_dynamic)?;
                if more.is_empty() {
                    break;
                }
                deps.append(&mut more);
            }
            if self.take_op(b')').is_none() {
                let place = self.next_place();
                return Err(Error::syntax(place, "expected ')'".to_string())
                    .note(place_paren, "after opening '('".to_string()));
            }
            return Ok(Some(vec![Rc::new(Dep::Compound(CompoundDep {
                base: DepBase::default(),
                place: place_paren,
                deps,
            }))]));
        }

        // '[' expression* ']'
        if let Some(place_bracket) = self.take_op(b'[') {
            let mut deps = Vec::new();
            loop {
                let mut more = self.parse_expression_list(input, targets, true)?;
                if more.is_empty() {
                    break;
                }
                deps.append(&mut more);
            }
            if self.take_op(b']').is_none() {
                let place = self.next_place();
                return Err(Error::syntax(place, "expected ']'".to_string())
                    .note(place_bracket, "after opening '['".to_string()));
            }
            let ret = deps
                .into_iter()
                .map(|d| {
                    Rc::new(Dep::Dynamic(DynamicDep {
                        base: DepBase::default(),
                        dep: d,
                    }))
                })
                .collect();
            return Ok(Some(ret));
        }

        // '$[' variable dependency.
        if let Some(place_dollar) = self.take_op(b'$') {
            if in_dynamic {
                return Err(Error::logical(
                    place_dollar,
                    "variable dependency must not appear within dynamic dependency".to_string(),
                ));
            }
            let dep = self.parse_variable_dependency(place_dollar, input, targets)?;
            return Ok(Some(vec![dep]));
        }

        // '<'? '@'? name
        match self.parse_redirect_dependency(input, targets, in_dynamic)? {
            Some(dep) => Ok(Some(vec![dep])),
            None => Ok(None),
        }
    }

    fn parse_flagged(
        &mut self,
        flags: Flags,
        place: Place,
        op: char,
        input: &mut InputCtx,
        targets: &[ParamTarget],
        in_dynamic: bool,
    ) -> Result<Option<Vec<Rc<Dep>>>> {
        let deps = match self.parse_expression(input, targets, in_dynamic)? {
            Some(deps) => deps,
            None => {
                let next = self.next_place();
                let text = match self.peek() {
                    Some(t) => format!("expected a dependency, not {}", t.format_start()),
                    None => "expected a dependency".to_string(),
                };
                return Err(Error::syntax(next, text)
                    .note(place, format!("after '{}'", op)));
            }
        };
        Ok(Some(
            deps.into_iter()
                .map(|d| Rc::new(d.with_flags(flags, &place)))
                .collect(),
        ))
    }

    fn parse_variable_dependency(
        &mut self,
        place_dollar: Place,
        input: &mut InputCtx,
        targets: &[ParamTarget],
    ) -> Result<Rc<Dep>> {
        let mut base = DepBase::with_flags(F_VARIABLE);

        loop {
            if let Some(place) = self.take_op(b'!') {
                base.add(F_IGNORE_TIMESTAMP, &place);
                continue;
            }
            if let Some(place) = self.take_op(b'?') {
                return Err(Error::logical(
                    place,
                    "optional dependency using '?' must not appear".to_string(),
                )
                .note(place_dollar, "within dynamic variable declaration".to_string()));
            }
            if let Some(place) = self.take_op(b'&') {
                base.add(F_TRIVIAL, &place);
                continue;
            }
            if let Some(Token::Flags(f)) = self.peek() {
                let fplace = f.place.clone();
                let fflags = f.flags;
                self.advance();
                if fflags & (F_OPTIONAL | F_NEWLINE_SEPARATED | F_NUL_SEPARATED) != 0 {
                    return Err(Error::logical(
                        fplace,
                        "this flag must not be used".to_string(),
                    )
                    .note(place_dollar, "within dynamic variable declaration".to_string()));
                }
                base.add(fflags, &fplace);
                continue;
            }
            break;
        }

        let has_input = self.take_op(b'<');
        if let Some(place) = &has_input {
            input.place_input = place.clone();
        }

        let name_tok = match self.peek() {
            Some(Token::Name(n)) => n.clone(),
            tok => {
                let place = tok.map(|t| t.place().clone()).unwrap_or(self.place_end.clone());
                let text = tok
                    .map(|t| format!("expected a filename, not {}", t.format_start()))
                    .unwrap_or_else(|| "expected a filename".to_string());
                return Err(Error::syntax(place, text)
                    .note(place_dollar, "after opening '$['".to_string()));
            }
        };
        self.advance();

        let mut filename = name_tok.name.clone();
        let mut variable_name = String::new();

        if let Some(place_equal) = self.take_op(b'=') {
            if name_tok.name.n() != 0 {
                return Err(Error::logical(
                    name_tok.place.clone(),
                    format!(
                        "variable name {} must be unparametrized",
                        self.word(&name_tok.name.raw())
                    ),
                ));
            }
            variable_name = name_tok.name.unparametrized().to_string();
            let file_tok = match self.peek() {
                Some(Token::Name(n)) => n.clone(),
                tok => {
                    let place = tok.map(|t| t.place().clone()).unwrap_or(self.place_end.clone());
                    let text = tok
                        .map(|t| format!("expected a filename, not {}", t.format_start()))
                        .unwrap_or_else(|| "expected a filename".to_string());
                    return Err(Error::syntax(place, text).note(
                        place_equal,
                        format!(
                            "after '=' in variable dependency {}",
                            self.word(&name_tok.name.raw())
                        ),
                    ));
                }
            };
            self.advance();
            filename = file_tok.name;
        }

        for text in filename.texts() {
            if text.contains('=') {
                return Err(Error::logical(
                    name_tok.place.clone(),
                    format!(
                        "name of variable dependency {} must not contain '='",
                        self.word(&filename.raw())
                    ),
                ));
            }
        }

        if self.take_op(b']').is_none() {
            let place = self.next_place();
            return Err(Error::syntax(place, "expected ']'".to_string())
                .note(place_dollar, "after opening '$['".to_string()));
        }

        if has_input.is_some() {
            self.record_input(input, &filename, &name_tok.place, targets)?;
        }

        Ok(Rc::new(Dep::Direct(DirectDep {
            base,
            target: ParamTarget {
                kind: TargetKind::File,
                name: filename,
                place: place_dollar.clone(),
            },
            place: place_dollar,
            variable_name,
        })))
    }

    fn parse_redirect_dependency(
        &mut self,
        input: &mut InputCtx,
        targets: &[ParamTarget],
        in_dynamic: bool,
    ) -> Result<Option<Rc<Dep>>> {
        let place_input = self.take_op(b'<');
        if let Some(place) = &place_input {
            if in_dynamic {
                return Err(Error::logical(
                    place.clone(),
                    "input redirection using '<' must not be used within dynamic dependency"
                        .to_string(),
                ));
            }
            input.place_input = place.clone();
        }

        let place_at = self.take_op(b'@');
        if let Some(at) = &place_at {
            if let Some(inp) = &place_input {
                return Err(Error::syntax(
                    at.clone(),
                    "expected a filename, not '@'".to_string(),
                )
                .note(inp.clone(), "after input redirection using '<'".to_string()));
            }
            if in_dynamic {
                return Err(Error::logical(
                    at.clone(),
                    "transient target must not be used within dynamic dependency".to_string(),
                ));
            }
        }

        let name_tok = match self.peek() {
            Some(Token::Name(n)) => n.clone(),
            tok => {
                if let Some(inp) = place_input {
                    let place = tok.map(|t| t.place().clone()).unwrap_or(self.place_end.clone());
                    return Err(Error::syntax(place, "expected a filename".to_string())
                        .note(inp, "after input redirection using '<'".to_string()));
                }
                if let Some(at) = place_at {
                    let place = tok.map(|t| t.place().clone()).unwrap_or(self.place_end.clone());
                    let text = tok
                        .map(|t| {
                            format!(
                                "expected the name of a transient target, not {}",
                                t.format_start()
                            )
                        })
                        .unwrap_or_else(|| "expected the name of a transient target".to_string());
                    return Err(Error::syntax(place, text).note(at, "after '@'".to_string()));
                }
                return Ok(None);
            }
        };
        self.advance();

        if place_input.is_some() {
            self.record_input(input, &name_tok.name, &name_tok.place, targets)?;
        }

        let kind = if place_at.is_some() {
            TargetKind::Transient
        } else {
            TargetKind::File
        };
        let place = place_at.unwrap_or_else(|| name_tok.place.clone());
        Ok(Some(Rc::new(Dep::Direct(DirectDep::new(
            0,
            ParamTarget {
                kind,
                name: name_tok.name,
                place,
            },
        )))))
    }

    fn record_input(
        &self,
        input: &mut InputCtx,
        name: &ParamName,
        place: &Place,
        targets: &[ParamTarget],
    ) -> Result<()> {
        if let Some((prev_name, prev_place)) = &input.name {
            let mut err = Error::logical(
                place.clone(),
                format!(
                    "there must not be a second input redirection {}",
                    self.word(&format!("<{}", name.raw()))
                ),
            )
            .note(
                prev_place.clone(),
                format!(
                    "shadowing previous input redirection {}",
                    self.word(&format!("<{}", prev_name.raw()))
                ),
            );
            if let Some(t) = targets.first() {
                err = err.note(
                    t.place.clone(),
                    format!("for target {}", t.format_word(&self.styles)),
                );
            }
            return Err(err);
        }
        input.name = Some((name.clone(), place.clone()));
        Ok(())
    }
}
