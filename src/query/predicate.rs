//! The predicate AST.
//!
//! A predicate is a value: build it with [`col`] and combine with
//! [`Predicate::and`] / [`Predicate::or`]. Translation to SQL happens
//! separately so the same predicate can be reused across statements.

use crate::value::Value;

/// Binary comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

/// A boolean expression over entity properties.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// `property <op> constant`.
    Compare {
        property: String,
        op: CmpOp,
        value: Value,
    },
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
    /// Substring match, translated to `LIKE '%...%'`.
    Contains { property: String, fragment: String },
    /// Prefix match, translated to `LIKE '...%'`.
    StartsWith { property: String, prefix: String },
    /// Suffix match, translated to `LIKE '%...'`.
    EndsWith { property: String, suffix: String },
    /// Membership test, translated to `IN (...)`.
    In {
        property: String,
        values: Vec<Value>,
    },
}

impl Predicate {
    /// Short-circuit conjunction.
    #[must_use]
    pub fn and(self, other: Self) -> Self {
        Self::And(Box::new(self), Box::new(other))
    }

    /// Short-circuit disjunction.
    #[must_use]
    pub fn or(self, other: Self) -> Self {
        Self::Or(Box::new(self), Box::new(other))
    }
}

/// Start a predicate from a property reference.
#[must_use]
pub fn col(property: &str) -> Column {
    Column(property.to_string())
}

/// A property reference awaiting an operator.
#[derive(Debug, Clone)]
pub struct Column(String);

impl Column {
    #[must_use]
    pub fn eq(self, value: impl Into<Value>) -> Predicate {
        self.compare(CmpOp::Eq, value)
    }

    #[must_use]
    pub fn ne(self, value: impl Into<Value>) -> Predicate {
        self.compare(CmpOp::Ne, value)
    }

    #[must_use]
    pub fn lt(self, value: impl Into<Value>) -> Predicate {
        self.compare(CmpOp::Lt, value)
    }

    #[must_use]
    pub fn le(self, value: impl Into<Value>) -> Predicate {
        self.compare(CmpOp::Le, value)
    }

    #[must_use]
    pub fn gt(self, value: impl Into<Value>) -> Predicate {
        self.compare(CmpOp::Gt, value)
    }

    #[must_use]
    pub fn ge(self, value: impl Into<Value>) -> Predicate {
        self.compare(CmpOp::Ge, value)
    }

    /// NULL test, translated to `IS NULL`.
    #[must_use]
    pub fn is_null(self) -> Predicate {
        self.compare(CmpOp::Eq, Value::Null)
    }

    #[must_use]
    pub fn contains(self, fragment: &str) -> Predicate {
        Predicate::Contains {
            property: self.0,
            fragment: fragment.to_string(),
        }
    }

    #[must_use]
    pub fn starts_with(self, prefix: &str) -> Predicate {
        Predicate::StartsWith {
            property: self.0,
            prefix: prefix.to_string(),
        }
    }

    #[must_use]
    pub fn ends_with(self, suffix: &str) -> Predicate {
        Predicate::EndsWith {
            property: self.0,
            suffix: suffix.to_string(),
        }
    }

    #[must_use]
    pub fn is_in(self, values: Vec<Value>) -> Predicate {
        Predicate::In {
            property: self.0,
            values,
        }
    }

    fn compare(self, op: CmpOp, value: impl Into<Value>) -> Predicate {
        Predicate::Compare {
            property: self.0,
            op,
            value: value.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_produces_expected_tree() {
        let predicate = col("Status").eq("open").and(col("Priority").ge(2i64));
        match predicate {
            Predicate::And(left, right) => {
                assert!(matches!(*left, Predicate::Compare { ref property, op: CmpOp::Eq, .. } if property == "Status"));
                assert!(matches!(*right, Predicate::Compare { op: CmpOp::Ge, .. }));
            }
            other => panic!("unexpected tree: {other:?}"),
        }
    }

    #[test]
    fn null_test_is_eq_null() {
        let predicate = col("ClosedAt").is_null();
        assert!(matches!(
            predicate,
            Predicate::Compare {
                op: CmpOp::Eq,
                value: Value::Null,
                ..
            }
        ));
    }
}
