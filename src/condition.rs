//! Condition model
//!
//! Typed predicates over a URL byte string, used three ways: as transformation
//! guards, as per-server global/pre/post constraints, and as negative
//! knowledge inferred from probes a server rejected outright. Each condition
//! has two surfaces with identical semantics — a symbolic one that emits a
//! boolean term for the chain formula, and a concrete one the validator
//! evaluates against real bytes. Keeping both in one type is what lets the
//! validator honestly re-check what the solver was told.

use serde::{Deserialize, Serialize};

use crate::encoding::{index_of, RawStr};
use crate::smt::{BoolExpr, IntExpr, StrExpr};

/// The predicate family a [`Condition`] applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionKind {
    /// The string equals the operand exactly.
    Equal,
    /// The operand is a prefix of the string.
    Prefix,
    /// The operand is a suffix of the string.
    Suffix,
    /// The operand occurs somewhere in the string.
    Contains,
    /// A `/` occurs after the first occurrence of the operand.
    ///
    /// Evaluates false when the operand is absent.
    HasSlashAfter,
}

/// A typed predicate over a URL byte string, optionally negated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    /// Predicate family.
    pub kind: ConditionKind,
    /// Raw-byte operand; control and high bytes pass through bit-exact.
    pub operand: RawStr,
    /// Wrap the predicate in a logical NOT.
    pub negated: bool,
}

/// Invariant violations at construction time.
#[derive(Debug, thiserror::Error)]
pub enum ConditionError {
    /// Prefix/Suffix/HasSlashAfter require a non-empty operand.
    #[error("{kind:?} condition requires a non-empty operand")]
    EmptyOperand {
        /// The offending kind.
        kind: ConditionKind,
    },
}

impl Condition {
    /// Build a condition, enforcing the non-empty-operand invariant for the
    /// kinds where an empty operand would be degenerate.
    pub fn new(
        kind: ConditionKind,
        operand: impl Into<RawStr>,
        negated: bool,
    ) -> Result<Self, ConditionError> {
        let operand = operand.into();
        match kind {
            ConditionKind::Prefix | ConditionKind::Suffix | ConditionKind::HasSlashAfter
                if operand.is_empty() =>
            {
                Err(ConditionError::EmptyOperand { kind })
            }
            _ => Ok(Self { kind, operand, negated }),
        }
    }

    /// `Contains(operand)`.
    pub fn contains(operand: impl Into<RawStr>) -> Self {
        Self { kind: ConditionKind::Contains, operand: operand.into(), negated: false }
    }

    /// `¬Contains(operand)`.
    pub fn not_contains(operand: impl Into<RawStr>) -> Self {
        Self { kind: ConditionKind::Contains, operand: operand.into(), negated: true }
    }

    /// `Equal(operand)`.
    pub fn equal(operand: impl Into<RawStr>) -> Self {
        Self { kind: ConditionKind::Equal, operand: operand.into(), negated: false }
    }

    /// `Prefix(operand)`; errors on an empty operand.
    pub fn prefix(operand: impl Into<RawStr>) -> Result<Self, ConditionError> {
        Self::new(ConditionKind::Prefix, operand, false)
    }

    /// `Suffix(operand)`; errors on an empty operand.
    pub fn suffix(operand: impl Into<RawStr>) -> Result<Self, ConditionError> {
        Self::new(ConditionKind::Suffix, operand, false)
    }

    /// `HasSlashAfter(operand)`; errors on an empty operand.
    pub fn has_slash_after(
        operand: impl Into<RawStr>,
        negated: bool,
    ) -> Result<Self, ConditionError> {
        Self::new(ConditionKind::HasSlashAfter, operand, negated)
    }

    /// Symbolic surface: the predicate as a boolean term over `s`.
    pub fn to_constraint(&self, s: &StrExpr) -> BoolExpr {
        let operand = StrExpr::lit(self.operand.clone());
        let positive = match self.kind {
            ConditionKind::Equal => s.eq_str(&operand),
            ConditionKind::Prefix => s.has_prefix(&operand),
            ConditionKind::Suffix => s.has_suffix(&operand),
            ConditionKind::Contains => s.contains(&operand),
            ConditionKind::HasSlashAfter => {
                // Search starts right after the operand's first occurrence;
                // an absent operand makes the whole predicate false, so the
                // indexof fallback (which would restart at 0) can't leak
                // spurious slashes in.
                let first = s.index_of(&operand, &IntExpr::lit(0));
                let slash = s.index_of(
                    &StrExpr::lit("/"),
                    &first.add(&IntExpr::lit(1)),
                );
                s.contains(&operand).and(&slash.ne_int(&IntExpr::lit(-1)))
            }
        };
        if self.negated {
            positive.negate()
        } else {
            positive
        }
    }

    /// Concrete surface: the same predicate over real bytes.
    pub fn holds(&self, s: &[u8]) -> bool {
        let op = self.operand.as_bytes();
        let positive = match self.kind {
            ConditionKind::Equal => s == op,
            ConditionKind::Prefix => s.starts_with(op),
            ConditionKind::Suffix => s.ends_with(op),
            ConditionKind::Contains => index_of(s, op, 0) != -1,
            ConditionKind::HasSlashAfter => {
                let first = index_of(s, op, 0);
                first != -1 && index_of(s, b"/", first + 1) != -1
            }
        };
        positive != self.negated
    }
}

/// Conjunction of a condition list over a symbolic string.
pub fn all_to_constraint(conditions: &[Condition], s: &StrExpr) -> BoolExpr {
    BoolExpr::conj(conditions.iter().map(|c| c.to_constraint(s)).collect())
}

/// Concrete conjunction of a condition list.
pub fn all_hold(conditions: &[Condition], s: &[u8]) -> bool {
    conditions.iter().all(|c| c.holds(s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smt::bool_to_smt;

    #[test]
    fn empty_operand_invariant() {
        assert!(Condition::prefix("").is_err());
        assert!(Condition::suffix("").is_err());
        assert!(Condition::has_slash_after("", false).is_err());
        // Equal/Contains tolerate empty operands.
        assert!(Condition::new(ConditionKind::Equal, "", false).is_ok());
    }

    #[test]
    fn concrete_semantics() {
        let c = Condition::contains(";");
        assert!(c.holds(b"/a;b"));
        assert!(!c.holds(b"/ab"));
        assert!(Condition::not_contains(";").holds(b"/ab"));

        let slash = Condition::has_slash_after(";", false).unwrap();
        assert!(slash.holds(b"/a;x/b"));
        assert!(!slash.holds(b"/a;xb"));
        // Absent operand => false (and its negation true).
        assert!(!slash.holds(b"/a/b"));
        assert!(Condition::has_slash_after(";", true).unwrap().holds(b"/a/b"));
    }

    #[test]
    fn slash_after_counts_only_slashes_past_the_operand() {
        let slash = Condition::has_slash_after(";", false).unwrap();
        // The only '/' sits before ';' — must not satisfy the predicate.
        assert!(!slash.holds(b"/a;b"));
    }

    #[test]
    fn symbolic_rendering_carries_raw_bytes() {
        let c = Condition::contains(RawStr::from(&b"\x00\xff"[..]));
        let s = StrExpr::var("s");
        assert_eq!(
            bool_to_smt(&c.to_constraint(&s)),
            "(str.contains |s| \"\\u{00}\\u{FF}\")"
        );
    }

    #[test]
    fn negation_wraps_the_predicate() {
        let c = Condition::not_contains(";");
        let s = StrExpr::var("s");
        assert_eq!(bool_to_smt(&c.to_constraint(&s)), "(not (str.contains |s| \";\"))");
    }
}
