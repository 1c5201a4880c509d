//! Remote collection queries
//!
//! A query is evaluated inside the diver so a filter or sort over a large
//! collection costs one round trip instead of one per element.

use super::value::Primitive;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
    StartsWith,
}

impl CompareOp {
    /// Evaluate `left op right`; unordered operands never match
    pub fn evaluate(self, left: &Primitive, right: &Primitive) -> bool {
        match self {
            CompareOp::Contains => match (left.as_str(), right.as_str()) {
                (Some(l), Some(r)) => l.contains(r),
                _ => false,
            },
            CompareOp::StartsWith => match (left.as_str(), right.as_str()) {
                (Some(l), Some(r)) => l.starts_with(r),
                _ => false,
            },
            op => match left.compare(right) {
                Some(ord) => match op {
                    CompareOp::Eq => ord == Ordering::Equal,
                    CompareOp::Ne => ord != Ordering::Equal,
                    CompareOp::Lt => ord == Ordering::Less,
                    CompareOp::Le => ord != Ordering::Greater,
                    CompareOp::Gt => ord == Ordering::Greater,
                    CompareOp::Ge => ord != Ordering::Less,
                    CompareOp::Contains | CompareOp::StartsWith => false,
                },
                None => op == CompareOp::Ne,
            },
        }
    }
}

/// `element.member op value`; `member: None` compares the element itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    #[serde(default)]
    pub member: Option<String>,
    pub op: CompareOp,
    pub value: Primitive,
}

/// Sort key: `element.member`, or the element itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySelector {
    #[serde(default)]
    pub member: Option<String>,
    #[serde(default)]
    pub descending: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionQuery {
    #[serde(default)]
    pub filter: Option<Predicate>,
    #[serde(default)]
    pub order_by: Option<KeySelector>,
    #[serde(default)]
    pub take: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_ops() {
        let five = Primitive::Int(5);
        let ten = Primitive::Int(10);
        assert!(CompareOp::Lt.evaluate(&five, &ten));
        assert!(CompareOp::Le.evaluate(&five, &five));
        assert!(!CompareOp::Gt.evaluate(&five, &ten));
        assert!(CompareOp::Ne.evaluate(&five, &ten));
        assert!(CompareOp::Eq.evaluate(&ten, &Primitive::Float(10.0)));
    }

    #[test]
    fn test_string_ops() {
        let name = Primitive::from("goblin-archer");
        assert!(CompareOp::Contains.evaluate(&name, &Primitive::from("arch")));
        assert!(CompareOp::StartsWith.evaluate(&name, &Primitive::from("gob")));
        assert!(!CompareOp::StartsWith.evaluate(&Primitive::Int(1), &Primitive::from("1")));
    }

    #[test]
    fn test_unordered_operands() {
        let flag = Primitive::Bool(true);
        let text = Primitive::from("true");
        assert!(!CompareOp::Eq.evaluate(&flag, &text));
        assert!(CompareOp::Ne.evaluate(&flag, &text));
    }
}
