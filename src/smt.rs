//! Symbolic string expressions & SMT-LIB2 rendering
//!
//! The surrogate model compiles URL rewriting into formulas over the SMT
//! string theory. This module is the term language: reference-counted
//! expression nodes for the `String`, `Int`, and `Bool` sorts, constructor
//! methods that mirror the handful of theory operations the model needs
//! (`str.contains`, `str.indexof`, `str.substr`, `str.replace`,
//! `str.replace_all`, `str.++`, `ite`, …), and a printer that renders a term
//! to SMT-LIB2 text with **byte-exact** string literals.
//!
//! ## Invariants
//! - Literals are byte strings. Every byte outside printable ASCII (and the
//!   quote/backslash characters) is emitted as a `\u{HH}` escape, so operands
//!   with control or high bytes survive the trip through the solver
//!   verbatim.
//! - Expression sharing is structural: nodes are `Rc`-backed, and cloning an
//!   expression is O(1). No process-wide term table exists — terms belong to
//!   whoever built them.
//! - The model parser is the exact inverse of the literal printer and
//!   rejects code points above `0xFF`; a solver model that is not a byte
//!   string is a malformed response, never a silently truncated URL.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::rc::Rc;

use crate::encoding::RawStr;

// ============================================================================
// Expression nodes
// ============================================================================

/// A string-sorted term.
#[derive(Clone, Debug)]
pub struct StrExpr(Rc<StrNode>);

/// An integer-sorted term.
#[derive(Clone, Debug)]
pub struct IntExpr(Rc<IntNode>);

/// A boolean-sorted term.
#[derive(Clone, Debug)]
pub struct BoolExpr(Rc<BoolNode>);

#[derive(Debug)]
enum StrNode {
    Var(String),
    Lit(RawStr),
    Concat(StrExpr, StrExpr),
    SubStr(StrExpr, IntExpr, IntExpr),
    Replace(StrExpr, StrExpr, StrExpr),
    ReplaceAll(StrExpr, StrExpr, StrExpr),
    Ite(BoolExpr, StrExpr, StrExpr),
}

#[derive(Debug)]
enum IntNode {
    Lit(i64),
    Var(String),
    IndexOf(StrExpr, StrExpr, IntExpr),
    Length(StrExpr),
    Add(IntExpr, IntExpr),
    Sub(IntExpr, IntExpr),
}

#[derive(Debug)]
enum BoolNode {
    True,
    Not(BoolExpr),
    And(Vec<BoolExpr>),
    Or(Vec<BoolExpr>),
    StrEq(StrExpr, StrExpr),
    PrefixOf(StrExpr, StrExpr),
    SuffixOf(StrExpr, StrExpr),
    Contains(StrExpr, StrExpr),
    IntEq(IntExpr, IntExpr),
    IntNe(IntExpr, IntExpr),
    IntGe(IntExpr, IntExpr),
    /// Membership in `(re.* (re.range \u{00} \u{FF}))` — the byte domain.
    InByteRange(StrExpr),
}

impl StrExpr {
    /// A free string variable.
    pub fn var(name: impl Into<String>) -> Self {
        Self(Rc::new(StrNode::Var(name.into())))
    }

    /// A string literal.
    pub fn lit(value: impl Into<RawStr>) -> Self {
        Self(Rc::new(StrNode::Lit(value.into())))
    }

    /// The variable name, if this term is a free variable.
    pub fn var_name(&self) -> Option<&str> {
        match &*self.0 {
            StrNode::Var(n) => Some(n),
            _ => None,
        }
    }

    /// `str.++ self other`
    pub fn concat(&self, other: &StrExpr) -> StrExpr {
        Self(Rc::new(StrNode::Concat(self.clone(), other.clone())))
    }

    /// `str.substr self offset len` (total: out-of-range yields `""`).
    pub fn substr(&self, offset: &IntExpr, len: &IntExpr) -> StrExpr {
        Self(Rc::new(StrNode::SubStr(self.clone(), offset.clone(), len.clone())))
    }

    /// `str.replace` — first occurrence only.
    pub fn replace(&self, target: &StrExpr, replacement: &StrExpr) -> StrExpr {
        Self(Rc::new(StrNode::Replace(self.clone(), target.clone(), replacement.clone())))
    }

    /// `str.replace_all` — every non-overlapping occurrence, left to right,
    /// never re-matching introduced text.
    pub fn replace_all(&self, target: &StrExpr, replacement: &StrExpr) -> StrExpr {
        Self(Rc::new(StrNode::ReplaceAll(self.clone(), target.clone(), replacement.clone())))
    }

    /// `ite cond then else` at string sort.
    pub fn ite(cond: &BoolExpr, then: &StrExpr, otherwise: &StrExpr) -> StrExpr {
        Self(Rc::new(StrNode::Ite(cond.clone(), then.clone(), otherwise.clone())))
    }

    /// `str.indexof self needle from`.
    pub fn index_of(&self, needle: &StrExpr, from: &IntExpr) -> IntExpr {
        IntExpr(Rc::new(IntNode::IndexOf(self.clone(), needle.clone(), from.clone())))
    }

    /// `str.len self`.
    pub fn length(&self) -> IntExpr {
        IntExpr(Rc::new(IntNode::Length(self.clone())))
    }

    /// `= self other` at string sort.
    pub fn eq_str(&self, other: &StrExpr) -> BoolExpr {
        BoolExpr(Rc::new(BoolNode::StrEq(self.clone(), other.clone())))
    }

    /// `str.contains self needle`.
    pub fn contains(&self, needle: &StrExpr) -> BoolExpr {
        BoolExpr(Rc::new(BoolNode::Contains(self.clone(), needle.clone())))
    }

    /// `str.prefixof prefix self`.
    pub fn has_prefix(&self, prefix: &StrExpr) -> BoolExpr {
        BoolExpr(Rc::new(BoolNode::PrefixOf(prefix.clone(), self.clone())))
    }

    /// `str.suffixof suffix self`.
    pub fn has_suffix(&self, suffix: &StrExpr) -> BoolExpr {
        BoolExpr(Rc::new(BoolNode::SuffixOf(suffix.clone(), self.clone())))
    }

    /// Constrain every character of this term to the byte domain
    /// `0x00..=0xFF`, so extracted models are always byte strings.
    pub fn in_byte_range(&self) -> BoolExpr {
        BoolExpr(Rc::new(BoolNode::InByteRange(self.clone())))
    }
}

impl IntExpr {
    /// An integer literal.
    pub fn lit(v: i64) -> Self {
        Self(Rc::new(IntNode::Lit(v)))
    }

    /// A free integer variable.
    pub fn var(name: impl Into<String>) -> Self {
        Self(Rc::new(IntNode::Var(name.into())))
    }

    /// `self + other`.
    pub fn add(&self, other: &IntExpr) -> IntExpr {
        Self(Rc::new(IntNode::Add(self.clone(), other.clone())))
    }

    /// `self - other`.
    pub fn sub(&self, other: &IntExpr) -> IntExpr {
        Self(Rc::new(IntNode::Sub(self.clone(), other.clone())))
    }

    /// `= self other`.
    pub fn eq_int(&self, other: &IntExpr) -> BoolExpr {
        BoolExpr(Rc::new(BoolNode::IntEq(self.clone(), other.clone())))
    }

    /// `distinct self other`.
    pub fn ne_int(&self, other: &IntExpr) -> BoolExpr {
        BoolExpr(Rc::new(BoolNode::IntNe(self.clone(), other.clone())))
    }

    /// `>= self other`.
    pub fn ge_int(&self, other: &IntExpr) -> BoolExpr {
        BoolExpr(Rc::new(BoolNode::IntGe(self.clone(), other.clone())))
    }
}

impl BoolExpr {
    /// The constant `true`.
    pub fn truth() -> Self {
        Self(Rc::new(BoolNode::True))
    }

    /// Logical negation.
    pub fn negate(&self) -> Self {
        Self(Rc::new(BoolNode::Not(self.clone())))
    }

    /// Conjunction; empty input is `true`, singletons collapse.
    pub fn conj(mut parts: Vec<BoolExpr>) -> Self {
        match parts.len() {
            0 => Self::truth(),
            1 => parts.pop().expect("len checked"),
            _ => Self(Rc::new(BoolNode::And(parts))),
        }
    }

    /// Disjunction; empty input is `true` (vacuous), singletons collapse.
    pub fn disj(mut parts: Vec<BoolExpr>) -> Self {
        match parts.len() {
            0 => Self::truth(),
            1 => parts.pop().expect("len checked"),
            _ => Self(Rc::new(BoolNode::Or(parts))),
        }
    }

    /// `self and other`.
    pub fn and(&self, other: &BoolExpr) -> Self {
        Self::conj(vec![self.clone(), other.clone()])
    }
}

// ============================================================================
// SMT-LIB2 printing
// ============================================================================

fn push_symbol(out: &mut String, name: &str) {
    // Quote with pipes: fresh names use `!`, which is legal, but quoting
    // keeps us independent of the simple-symbol grammar entirely.
    out.push('|');
    out.push_str(name);
    out.push('|');
}

fn push_str_literal(out: &mut String, bytes: &[u8]) {
    out.push('"');
    for &b in bytes {
        match b {
            b'"' => out.push_str("\"\""),
            0x20..=0x7E if b != b'\\' => out.push(b as char),
            _ => {
                let _ = write!(out, "\\u{{{b:02X}}}");
            }
        }
    }
    out.push('"');
}

fn render_str(e: &StrExpr, out: &mut String) {
    match &*e.0 {
        StrNode::Var(name) => push_symbol(out, name),
        StrNode::Lit(v) => push_str_literal(out, v.as_bytes()),
        StrNode::Concat(a, b) => {
            out.push_str("(str.++ ");
            render_str(a, out);
            out.push(' ');
            render_str(b, out);
            out.push(')');
        }
        StrNode::SubStr(s, o, l) => {
            out.push_str("(str.substr ");
            render_str(s, out);
            out.push(' ');
            render_int(o, out);
            out.push(' ');
            render_int(l, out);
            out.push(')');
        }
        StrNode::Replace(s, t, r) => {
            out.push_str("(str.replace ");
            render_str(s, out);
            out.push(' ');
            render_str(t, out);
            out.push(' ');
            render_str(r, out);
            out.push(')');
        }
        StrNode::ReplaceAll(s, t, r) => {
            out.push_str("(str.replace_all ");
            render_str(s, out);
            out.push(' ');
            render_str(t, out);
            out.push(' ');
            render_str(r, out);
            out.push(')');
        }
        StrNode::Ite(c, a, b) => {
            out.push_str("(ite ");
            render_bool(c, out);
            out.push(' ');
            render_str(a, out);
            out.push(' ');
            render_str(b, out);
            out.push(')');
        }
    }
}

fn render_int(e: &IntExpr, out: &mut String) {
    match &*e.0 {
        IntNode::Lit(v) => {
            if *v < 0 {
                let _ = write!(out, "(- {})", v.unsigned_abs());
            } else {
                let _ = write!(out, "{v}");
            }
        }
        IntNode::Var(name) => push_symbol(out, name),
        IntNode::IndexOf(s, t, from) => {
            out.push_str("(str.indexof ");
            render_str(s, out);
            out.push(' ');
            render_str(t, out);
            out.push(' ');
            render_int(from, out);
            out.push(')');
        }
        IntNode::Length(s) => {
            out.push_str("(str.len ");
            render_str(s, out);
            out.push(')');
        }
        IntNode::Add(a, b) => {
            out.push_str("(+ ");
            render_int(a, out);
            out.push(' ');
            render_int(b, out);
            out.push(')');
        }
        IntNode::Sub(a, b) => {
            out.push_str("(- ");
            render_int(a, out);
            out.push(' ');
            render_int(b, out);
            out.push(')');
        }
    }
}

fn render_bool(e: &BoolExpr, out: &mut String) {
    match &*e.0 {
        BoolNode::True => out.push_str("true"),
        BoolNode::Not(a) => {
            out.push_str("(not ");
            render_bool(a, out);
            out.push(')');
        }
        BoolNode::And(parts) | BoolNode::Or(parts) => {
            out.push_str(if matches!(&*e.0, BoolNode::And(_)) { "(and" } else { "(or" });
            for p in parts {
                out.push(' ');
                render_bool(p, out);
            }
            out.push(')');
        }
        BoolNode::StrEq(a, b) => {
            out.push_str("(= ");
            render_str(a, out);
            out.push(' ');
            render_str(b, out);
            out.push(')');
        }
        BoolNode::PrefixOf(p, s) => {
            out.push_str("(str.prefixof ");
            render_str(p, out);
            out.push(' ');
            render_str(s, out);
            out.push(')');
        }
        BoolNode::SuffixOf(suf, s) => {
            out.push_str("(str.suffixof ");
            render_str(suf, out);
            out.push(' ');
            render_str(s, out);
            out.push(')');
        }
        BoolNode::Contains(s, t) => {
            out.push_str("(str.contains ");
            render_str(s, out);
            out.push(' ');
            render_str(t, out);
            out.push(')');
        }
        BoolNode::IntEq(a, b) => {
            out.push_str("(= ");
            render_int(a, out);
            out.push(' ');
            render_int(b, out);
            out.push(')');
        }
        BoolNode::IntNe(a, b) => {
            out.push_str("(distinct ");
            render_int(a, out);
            out.push(' ');
            render_int(b, out);
            out.push(')');
        }
        BoolNode::IntGe(a, b) => {
            out.push_str("(>= ");
            render_int(a, out);
            out.push(' ');
            render_int(b, out);
            out.push(')');
        }
        BoolNode::InByteRange(s) => {
            out.push_str("(str.in_re ");
            render_str(s, out);
            out.push_str(" (re.* (re.range \"\\u{00}\" \"\\u{FF}\")))");
        }
    }
}

/// Render a boolean term to SMT-LIB2 text.
pub fn bool_to_smt(e: &BoolExpr) -> String {
    let mut out = String::new();
    render_bool(e, &mut out);
    out
}

/// Render a string term to SMT-LIB2 text.
pub fn str_to_smt(e: &StrExpr) -> String {
    let mut out = String::new();
    render_str(e, &mut out);
    out
}

// ============================================================================
// Model parsing
// ============================================================================

/// Errors from rendering or model parsing.
#[derive(Debug, thiserror::Error)]
pub enum SmtError {
    /// A model string contained a code point outside `0x00..=0xFF`.
    #[error("model value contains non-byte code point U+{cp:04X}")]
    NonByteCodePoint {
        /// The offending code point.
        cp: u32,
    },
    /// The solver response did not parse as `(get-value ...)` output.
    #[error("malformed solver model: {detail}")]
    MalformedModel {
        /// What went wrong.
        detail: String,
    },
}

/// Parse the string bindings out of `(get-value ...)` output.
///
/// Accepts the shape z3 prints: a sequence of `(<symbol> "<literal>")` pairs,
/// possibly spread across lines, with symbols optionally pipe-quoted. Only
/// string-valued bindings are collected; anything else in the response is
/// skipped.
pub fn parse_model_values(text: &str) -> Result<BTreeMap<String, RawStr>, SmtError> {
    let chars: Vec<char> = text.chars().collect();
    let mut values = BTreeMap::new();
    let mut i = 0usize;
    while i < chars.len() {
        if chars[i] != '(' {
            i += 1;
            continue;
        }
        i += 1;
        while i < chars.len() && chars[i].is_whitespace() {
            i += 1;
        }
        // A nested '(' is the enclosing list; descend.
        if i < chars.len() && chars[i] == '(' {
            continue;
        }
        let Some((name, next)) = parse_symbol(&chars, i) else {
            i += 1;
            continue;
        };
        i = next;
        while i < chars.len() && chars[i].is_whitespace() {
            i += 1;
        }
        if i < chars.len() && chars[i] == '"' {
            let (value, next) = parse_string_literal(&chars, i)?;
            values.insert(name, value);
            i = next;
        }
    }
    Ok(values)
}

fn parse_symbol(chars: &[char], mut i: usize) -> Option<(String, usize)> {
    if i >= chars.len() {
        return None;
    }
    let mut name = String::new();
    if chars[i] == '|' {
        i += 1;
        while i < chars.len() && chars[i] != '|' {
            name.push(chars[i]);
            i += 1;
        }
        if i >= chars.len() {
            return None;
        }
        Some((name, i + 1))
    } else {
        while i < chars.len() && !chars[i].is_whitespace() && chars[i] != '(' && chars[i] != ')' {
            name.push(chars[i]);
            i += 1;
        }
        if name.is_empty() {
            None
        } else {
            Some((name, i))
        }
    }
}

/// Parse one SMT-LIB string literal starting at the opening quote.
/// Returns the decoded bytes and the index one past the closing quote.
fn parse_string_literal(chars: &[char], start: usize) -> Result<(RawStr, usize), SmtError> {
    debug_assert_eq!(chars[start], '"');
    let mut bytes = Vec::new();
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '"' => {
                // `""` is an escaped quote; a lone `"` closes the literal.
                if i + 1 < chars.len() && chars[i + 1] == '"' {
                    bytes.push(b'"');
                    i += 2;
                } else {
                    return Ok((RawStr::from(bytes), i + 1));
                }
            }
            '\\' if i + 2 < chars.len() && chars[i + 1] == 'u' => {
                let (cp, next) = parse_unicode_escape(chars, i)?;
                if cp > 0xFF {
                    return Err(SmtError::NonByteCodePoint { cp });
                }
                bytes.push(cp as u8);
                i = next;
            }
            c => {
                let cp = c as u32;
                if cp > 0xFF {
                    return Err(SmtError::NonByteCodePoint { cp });
                }
                bytes.push(cp as u8);
                i += 1;
            }
        }
    }
    Err(SmtError::MalformedModel { detail: "unterminated string literal".into() })
}

/// Parse `\u{H..}` or `\uHHHH` starting at the backslash.
fn parse_unicode_escape(chars: &[char], start: usize) -> Result<(u32, usize), SmtError> {
    let mut i = start + 2; // past `\u`
    let mut digits = String::new();
    let braced = i < chars.len() && chars[i] == '{';
    if braced {
        i += 1;
        while i < chars.len() && chars[i] != '}' {
            digits.push(chars[i]);
            i += 1;
        }
        if i >= chars.len() {
            return Err(SmtError::MalformedModel { detail: "unterminated \\u{..} escape".into() });
        }
        i += 1; // past `}`
    } else {
        for _ in 0..4 {
            if i < chars.len() && chars[i].is_ascii_hexdigit() {
                digits.push(chars[i]);
                i += 1;
            }
        }
    }
    u32::from_str_radix(&digits, 16)
        .map(|cp| (cp, i))
        .map_err(|_| SmtError::MalformedModel { detail: format!("bad unicode escape `{digits}`") })
}

// ============================================================================
// Tests
// ============================================================================
