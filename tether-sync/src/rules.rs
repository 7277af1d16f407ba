//! Validation rules for field writes.
//!
//! A [`RuleChain`] runs every rule against a candidate value and collects
//! all violations, so a rejected write reports each failing rule at once.
//! Rules never touch the network.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt::Display;
use std::sync::Arc;
use tether_core::{Position, RuleViolation, ValidationError};

/// One validation rule.
///
/// `current` is the locally known value, `candidate` the value being written.
/// `None` stands for null.
pub trait Rule<T>: Send + Sync {
    fn name(&self) -> &'static str;

    fn validate(&self, current: Option<&T>, candidate: Option<&T>) -> Result<(), RuleViolation>;
}

/// Rejects null.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotNull;

impl<T> Rule<T> for NotNull {
    fn name(&self) -> &'static str {
        "not_null"
    }

    fn validate(&self, _current: Option<&T>, candidate: Option<&T>) -> Result<(), RuleViolation> {
        match candidate {
            Some(_) => Ok(()),
            None => Err(RuleViolation::new(
                <Self as Rule<T>>::name(self),
                "value is required",
            )),
        }
    }
}

/// Rejects null, empty and whitespace-only strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct NonEmptyString;

impl<T: AsRef<str>> Rule<T> for NonEmptyString {
    fn name(&self) -> &'static str {
        "non_empty_string"
    }

    fn validate(&self, _current: Option<&T>, candidate: Option<&T>) -> Result<(), RuleViolation> {
        match candidate {
            Some(value) if !value.as_ref().trim().is_empty() => Ok(()),
            _ => Err(RuleViolation::new(
                "non_empty_string",
                "value must not be empty or whitespace",
            )),
        }
    }
}

/// Inclusive numeric range. Null passes; combine with [`NotNull`] to forbid it.
#[derive(Debug, Clone, Copy)]
pub struct Range<T> {
    min: Option<T>,
    max: Option<T>,
}

impl<T> Range<T> {
    pub fn new(min: T, max: T) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
        }
    }

    pub fn at_least(min: T) -> Self {
        Self {
            min: Some(min),
            max: None,
        }
    }

    pub fn at_most(max: T) -> Self {
        Self {
            min: None,
            max: Some(max),
        }
    }
}

impl<T> Rule<T> for Range<T>
where
    T: PartialOrd + Display + Send + Sync,
{
    fn name(&self) -> &'static str {
        "range"
    }

    fn validate(&self, _current: Option<&T>, candidate: Option<&T>) -> Result<(), RuleViolation> {
        let Some(value) = candidate else {
            return Ok(());
        };
        if let Some(min) = &self.min {
            if value < min {
                return Err(RuleViolation::new(
                    "range",
                    format!("{value} is below the minimum of {min}"),
                ));
            }
        }
        if let Some(max) = &self.max {
            if value > max {
                return Err(RuleViolation::new(
                    "range",
                    format!("{value} is above the maximum of {max}"),
                ));
            }
        }
        Ok(())
    }
}

/// Once a value is known it may be changed but not cleared.
#[derive(Debug, Clone, Copy, Default)]
pub struct OldValueRequired;

impl<T> Rule<T> for OldValueRequired {
    fn name(&self) -> &'static str {
        "old_value_required"
    }

    fn validate(&self, current: Option<&T>, candidate: Option<&T>) -> Result<(), RuleViolation> {
        match (current, candidate) {
            (Some(_), None) => Err(RuleViolation::new(
                "old_value_required",
                "a value that is already set cannot be cleared",
            )),
            _ => Ok(()),
        }
    }
}

static ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9a-f]{24}$").expect("id regex is valid"));

/// Remote ids are 24 lowercase hex characters. Null passes.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdRule;

impl IdRule {
    pub fn is_valid_id(id: &str) -> bool {
        ID_PATTERN.is_match(id)
    }
}

impl<T: AsRef<str>> Rule<T> for IdRule {
    fn name(&self) -> &'static str {
        "id_format"
    }

    fn validate(&self, _current: Option<&T>, candidate: Option<&T>) -> Result<(), RuleViolation> {
        match candidate {
            Some(id) if !Self::is_valid_id(id.as_ref()) => Err(RuleViolation::new(
                "id_format",
                format!("{:?} is not a valid id", id.as_ref()),
            )),
            _ => Ok(()),
        }
    }
}

/// Fixed positions must be finite and strictly positive.
#[derive(Debug, Clone, Copy, Default)]
pub struct PositionRule;

impl Rule<Position> for PositionRule {
    fn name(&self) -> &'static str {
        "position"
    }

    fn validate(
        &self,
        _current: Option<&Position>,
        candidate: Option<&Position>,
    ) -> Result<(), RuleViolation> {
        match candidate {
            Some(position) if !position.is_valid() => Err(RuleViolation::new(
                "position",
                format!("{position} is not a positive finite position"),
            )),
            _ => Ok(()),
        }
    }
}

/// Ordered set of rules for one field.
pub struct RuleChain<T> {
    rules: Vec<Arc<dyn Rule<T>>>,
}

impl<T> RuleChain<T> {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn with<R>(mut self, rule: R) -> Self
    where
        R: Rule<T> + 'static,
    {
        self.rules.push(Arc::new(rule));
        self
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Run every rule. Fails with all violations if any rule rejects.
    pub fn validate(
        &self,
        field: &str,
        current: Option<&T>,
        candidate: Option<&T>,
    ) -> Result<(), ValidationError> {
        let violations: Vec<RuleViolation> = self
            .rules
            .iter()
            .filter_map(|rule| rule.validate(current, candidate).err())
            .collect();

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::RuleChainFailed {
                field: field.to_string(),
                violations,
            })
        }
    }
}

impl<T> Default for RuleChain<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for RuleChain<T> {
    fn clone(&self) -> Self {
        Self {
            rules: self.rules.clone(),
        }
    }
}

impl<T> std::fmt::Debug for RuleChain<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.rules.iter().map(|r| r.name()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_reports_every_failing_rule() {
        let chain = RuleChain::<String>::new()
            .with(NotNull)
            .with(NonEmptyString);

        let err = chain.validate("Name", None, None).unwrap_err();
        let names: Vec<&str> = err.violations().iter().map(|v| v.rule.as_str()).collect();
        assert_eq!(names, vec!["not_null", "non_empty_string"]);

        let blank = "   ".to_string();
        let err = chain.validate("Name", None, Some(&blank)).unwrap_err();
        assert_eq!(err.violations().len(), 1);

        assert!(chain
            .validate("Name", None, Some(&"Backlog".to_string()))
            .is_ok());
    }

    #[test]
    fn test_range_bounds_are_inclusive() {
        let rule = Range::new(1i64, 10);
        assert!(rule.validate(None, Some(&1)).is_ok());
        assert!(rule.validate(None, Some(&10)).is_ok());
        assert!(rule.validate(None, Some(&0)).is_err());
        assert!(rule.validate(None, Some(&11)).is_err());
        assert!(rule.validate(None, None).is_ok());
        assert!(Range::at_least(0.5f64).validate(None, Some(&0.4)).is_err());
        assert!(Range::at_most(3u32).validate(None, Some(&3)).is_ok());
    }

    #[test]
    fn test_old_value_required() {
        let rule = OldValueRequired;
        let old = "5a1b2c3d4e5f6a7b8c9d0e1f".to_string();
        assert!(Rule::<String>::validate(&rule, Some(&old), None).is_err());
        assert!(Rule::<String>::validate(&rule, None, None).is_ok());
        assert!(Rule::<String>::validate(&rule, Some(&old), Some(&old)).is_ok());
    }

    #[test]
    fn test_id_rule() {
        assert!(IdRule::is_valid_id("5a1b2c3d4e5f6a7b8c9d0e1f"));
        assert!(!IdRule::is_valid_id("5A1B2C3D4E5F6A7B8C9D0E1F"));
        assert!(!IdRule::is_valid_id("5a1b2c3d"));
        assert!(!IdRule::is_valid_id("zz1b2c3d4e5f6a7b8c9d0e1f"));

        let bad = "not-an-id".to_string();
        let violation = Rule::<String>::validate(&IdRule, None, Some(&bad)).unwrap_err();
        assert_eq!(violation.rule, "id_format");
    }

    #[test]
    fn test_position_rule() {
        assert!(PositionRule.validate(None, Some(&Position::Top)).is_ok());
        assert!(PositionRule.validate(None, Some(&Position::Fixed(2.5))).is_ok());
        assert!(PositionRule.validate(None, Some(&Position::Fixed(0.0))).is_err());
        assert!(PositionRule
            .validate(None, Some(&Position::Fixed(f64::INFINITY)))
            .is_err());
    }
}
