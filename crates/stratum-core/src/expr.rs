//! Filter expression IR
//!
//! The algebra every predicate in the engine is written in: binary
//! comparisons against a field, null tests, and logical combinators.
//! Expressions evaluate tri-state over documents (true / false /
//! unknown) and serialize to a tagged JSON shape so scheduled handlers
//! can carry them across the scheduler boundary.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use stratum_store::{values_equal, Document, CREATION_TIME_FIELD, ID_FIELD};

use crate::schema::Column;

// ---------------------------------------------------------------------------
// Field references
// ---------------------------------------------------------------------------

/// A reference to a column by its serialized name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRef {
    pub field: String,
}

impl FieldRef {
    pub fn new(field: impl Into<String>) -> Self {
        FieldRef {
            field: field.into(),
        }
    }

    /// The storage-level field name: the public `id` / `createdAt`
    /// aliases resolve to the driver's system fields.
    pub fn storage_field(&self) -> &str {
        match self.field.as_str() {
            "id" => ID_FIELD,
            "createdAt" => CREATION_TIME_FIELD,
            other => other,
        }
    }
}

/// Anything usable as a field reference in a comparison: a raw name or
/// a column builder.
pub trait IntoFieldRef {
    fn into_field_ref(self) -> FieldRef;
}

impl IntoFieldRef for FieldRef {
    fn into_field_ref(self) -> FieldRef {
        self
    }
}

impl IntoFieldRef for &str {
    fn into_field_ref(self) -> FieldRef {
        FieldRef::new(self)
    }
}

impl IntoFieldRef for String {
    fn into_field_ref(self) -> FieldRef {
        FieldRef::new(self)
    }
}

impl IntoFieldRef for &Column {
    fn into_field_ref(self) -> FieldRef {
        FieldRef::new(self.name())
    }
}

// ---------------------------------------------------------------------------
// Operators and nodes
// ---------------------------------------------------------------------------

/// Binary comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BinaryOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    InArray,
    NotInArray,
    ArrayContains,
    ArrayContained,
    ArrayOverlaps,
    Like,
    Ilike,
    NotLike,
    NotIlike,
    StartsWith,
    EndsWith,
    Contains,
}

/// A filter expression.
///
/// The serialized shape is internally tagged by `kind`; payloads that
/// omit an operand or carry a non-field first operand fail to
/// deserialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Expr {
    Binary {
        op: BinaryOp,
        field: FieldRef,
        value: Value,
    },
    IsNull {
        field: FieldRef,
    },
    IsNotNull {
        field: FieldRef,
    },
    Not {
        operand: Box<Expr>,
    },
    And {
        operands: Vec<Expr>,
    },
    Or {
        operands: Vec<Expr>,
    },
}

/// Visitor over the expression tree.
pub trait ExprVisitor {
    fn visit_binary(&mut self, op: BinaryOp, field: &FieldRef, value: &Value);
    fn visit_is_null(&mut self, field: &FieldRef, negated: bool);
    fn visit_not(&mut self, operand: &Expr);
    fn visit_logical(&mut self, and: bool, operands: &[Expr]);
}

impl Expr {
    /// Dispatch to the visitor. Composite nodes do not descend on their
    /// own; the visitor decides whether to recurse.
    pub fn accept<V: ExprVisitor>(&self, visitor: &mut V) {
        match self {
            Expr::Binary { op, field, value } => visitor.visit_binary(*op, field, value),
            Expr::IsNull { field } => visitor.visit_is_null(field, false),
            Expr::IsNotNull { field } => visitor.visit_is_null(field, true),
            Expr::Not { operand } => visitor.visit_not(operand),
            Expr::And { operands } => visitor.visit_logical(true, operands),
            Expr::Or { operands } => visitor.visit_logical(false, operands),
        }
    }

    /// All field names referenced anywhere in the tree, in storage form.
    pub fn referenced_fields(&self) -> Vec<String> {
        struct Collect(Vec<String>);
        impl ExprVisitor for Collect {
            fn visit_binary(&mut self, _op: BinaryOp, field: &FieldRef, _value: &Value) {
                self.push(field);
            }
            fn visit_is_null(&mut self, field: &FieldRef, _negated: bool) {
                self.push(field);
            }
            fn visit_not(&mut self, operand: &Expr) {
                operand.accept(self);
            }
            fn visit_logical(&mut self, _and: bool, operands: &[Expr]) {
                for op in operands {
                    op.accept(self);
                }
            }
        }
        impl Collect {
            fn push(&mut self, field: &FieldRef) {
                let name = field.storage_field().to_string();
                if !self.0.contains(&name) {
                    self.0.push(name);
                }
            }
        }
        let mut collect = Collect(Vec::new());
        self.accept(&mut collect);
        collect.0
    }

    /// Evaluate against a stored document.
    pub fn evaluate(&self, doc: &Document) -> TriState {
        match self {
            Expr::Binary { op, field, value } => {
                let lhs = doc.get(field.storage_field()).cloned().unwrap_or(Value::Null);
                evaluate_binary(*op, &lhs, value)
            }
            Expr::IsNull { field } => {
                // Covers both absent and explicit-null representations.
                match doc.get(field.storage_field()) {
                    None | Some(Value::Null) => TriState::True,
                    Some(_) => TriState::False,
                }
            }
            Expr::IsNotNull { field } => match doc.get(field.storage_field()) {
                None | Some(Value::Null) => TriState::False,
                Some(_) => TriState::True,
            },
            Expr::Not { operand } => operand.evaluate(doc).not(),
            Expr::And { operands } => operands
                .iter()
                .fold(TriState::True, |acc, e| acc.and(e.evaluate(doc))),
            Expr::Or { operands } => operands
                .iter()
                .fold(TriState::False, |acc, e| acc.or(e.evaluate(doc))),
        }
    }

    /// True exactly when the document satisfies the predicate. Unknown
    /// filters a row out, matching SQL WHERE semantics.
    pub fn matches(&self, doc: &Document) -> bool {
        self.evaluate(doc) == TriState::True
    }
}

// ---------------------------------------------------------------------------
// Tri-state logic
// ---------------------------------------------------------------------------

/// Kleene three-valued logic result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriState {
    True,
    False,
    Unknown,
}

impl TriState {
    pub fn not(self) -> TriState {
        match self {
            TriState::True => TriState::False,
            TriState::False => TriState::True,
            TriState::Unknown => TriState::Unknown,
        }
    }

    pub fn and(self, other: TriState) -> TriState {
        match (self, other) {
            (TriState::False, _) | (_, TriState::False) => TriState::False,
            (TriState::True, TriState::True) => TriState::True,
            _ => TriState::Unknown,
        }
    }

    pub fn or(self, other: TriState) -> TriState {
        match (self, other) {
            (TriState::True, _) | (_, TriState::True) => TriState::True,
            (TriState::False, TriState::False) => TriState::False,
            _ => TriState::Unknown,
        }
    }

    pub fn from_bool(b: bool) -> TriState {
        if b {
            TriState::True
        } else {
            TriState::False
        }
    }
}

fn evaluate_binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> TriState {
    use BinaryOp::*;

    // Comparisons against null are unknown; null membership and pattern
    // tests likewise.
    if lhs.is_null() || rhs.is_null() {
        return TriState::Unknown;
    }

    match op {
        Eq => TriState::from_bool(values_equal(lhs, rhs)),
        Ne => TriState::from_bool(!values_equal(lhs, rhs)),
        Gt => ordered(lhs, rhs, |o| o == Ordering::Greater),
        Gte => ordered(lhs, rhs, |o| o != Ordering::Less),
        Lt => ordered(lhs, rhs, |o| o == Ordering::Less),
        Lte => ordered(lhs, rhs, |o| o != Ordering::Greater),
        InArray => match rhs.as_array() {
            Some(candidates) => {
                TriState::from_bool(candidates.iter().any(|c| values_equal(lhs, c)))
            }
            None => TriState::Unknown,
        },
        NotInArray => evaluate_binary(InArray, lhs, rhs).not(),
        ArrayContains => match (lhs.as_array(), rhs.as_array()) {
            (Some(have), Some(want)) => TriState::from_bool(
                want.iter().all(|w| have.iter().any(|h| values_equal(h, w))),
            ),
            _ => TriState::Unknown,
        },
        ArrayContained => evaluate_binary(ArrayContains, rhs, lhs),
        ArrayOverlaps => match (lhs.as_array(), rhs.as_array()) {
            (Some(a), Some(b)) => TriState::from_bool(
                a.iter().any(|x| b.iter().any(|y| values_equal(x, y))),
            ),
            _ => TriState::Unknown,
        },
        Like => pattern(lhs, rhs, false),
        Ilike => pattern(lhs, rhs, true),
        NotLike => pattern(lhs, rhs, false).not(),
        NotIlike => pattern(lhs, rhs, true).not(),
        StartsWith => strings(lhs, rhs, |s, p| s.starts_with(p)),
        EndsWith => strings(lhs, rhs, |s, p| s.ends_with(p)),
        Contains => strings(lhs, rhs, |s, p| s.contains(p)),
    }
}

fn ordered(lhs: &Value, rhs: &Value, test: impl Fn(Ordering) -> bool) -> TriState {
    let ord = match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => Some(a.total_cmp(&b)),
            _ => None,
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    };
    match ord {
        Some(o) => TriState::from_bool(test(o)),
        None => TriState::Unknown,
    }
}

fn strings(lhs: &Value, rhs: &Value, test: impl Fn(&str, &str) -> bool) -> TriState {
    match (lhs.as_str(), rhs.as_str()) {
        (Some(s), Some(p)) => TriState::from_bool(test(s, p)),
        _ => TriState::Unknown,
    }
}

/// SQL LIKE: `%` matches any run, `_` matches one character.
fn pattern(lhs: &Value, rhs: &Value, case_insensitive: bool) -> TriState {
    let (Some(s), Some(p)) = (lhs.as_str(), rhs.as_str()) else {
        return TriState::Unknown;
    };
    let (s, p) = if case_insensitive {
        (s.to_lowercase(), p.to_lowercase())
    } else {
        (s.to_string(), p.to_string())
    };
    TriState::from_bool(like_match(
        &s.chars().collect::<Vec<_>>(),
        &p.chars().collect::<Vec<_>>(),
    ))
}

fn like_match(s: &[char], p: &[char]) -> bool {
    match p.first() {
        None => s.is_empty(),
        Some('%') => {
            // Greedy run: try every suffix of s.
            (0..=s.len()).any(|i| like_match(&s[i..], &p[1..]))
        }
        Some('_') => !s.is_empty() && like_match(&s[1..], &p[1..]),
        Some(&c) => s.first() == Some(&c) && like_match(&s[1..], &p[1..]),
    }
}

// ---------------------------------------------------------------------------
// Constructors
// ---------------------------------------------------------------------------

fn binary(op: BinaryOp, field: impl IntoFieldRef, value: impl Into<Value>) -> Expr {
    Expr::Binary {
        op,
        field: field.into_field_ref(),
        value: value.into(),
    }
}

pub fn eq(field: impl IntoFieldRef, value: impl Into<Value>) -> Expr {
    binary(BinaryOp::Eq, field, value)
}

pub fn ne(field: impl IntoFieldRef, value: impl Into<Value>) -> Expr {
    binary(BinaryOp::Ne, field, value)
}

pub fn gt(field: impl IntoFieldRef, value: impl Into<Value>) -> Expr {
    binary(BinaryOp::Gt, field, value)
}

pub fn gte(field: impl IntoFieldRef, value: impl Into<Value>) -> Expr {
    binary(BinaryOp::Gte, field, value)
}

pub fn lt(field: impl IntoFieldRef, value: impl Into<Value>) -> Expr {
    binary(BinaryOp::Lt, field, value)
}

pub fn lte(field: impl IntoFieldRef, value: impl Into<Value>) -> Expr {
    binary(BinaryOp::Lte, field, value)
}

pub fn in_array(field: impl IntoFieldRef, values: impl IntoIterator<Item = impl Into<Value>>) -> Expr {
    binary(
        BinaryOp::InArray,
        field,
        Value::Array(values.into_iter().map(Into::into).collect()),
    )
}

pub fn not_in_array(
    field: impl IntoFieldRef,
    values: impl IntoIterator<Item = impl Into<Value>>,
) -> Expr {
    binary(
        BinaryOp::NotInArray,
        field,
        Value::Array(values.into_iter().map(Into::into).collect()),
    )
}

pub fn array_contains(field: impl IntoFieldRef, value: impl Into<Value>) -> Expr {
    binary(BinaryOp::ArrayContains, field, value)
}

pub fn array_contained(field: impl IntoFieldRef, value: impl Into<Value>) -> Expr {
    binary(BinaryOp::ArrayContained, field, value)
}

pub fn array_overlaps(field: impl IntoFieldRef, value: impl Into<Value>) -> Expr {
    binary(BinaryOp::ArrayOverlaps, field, value)
}

pub fn like(field: impl IntoFieldRef, pattern: impl Into<String>) -> Expr {
    binary(BinaryOp::Like, field, pattern.into())
}

pub fn ilike(field: impl IntoFieldRef, pattern: impl Into<String>) -> Expr {
    binary(BinaryOp::Ilike, field, pattern.into())
}

pub fn not_like(field: impl IntoFieldRef, pattern: impl Into<String>) -> Expr {
    binary(BinaryOp::NotLike, field, pattern.into())
}

pub fn not_ilike(field: impl IntoFieldRef, pattern: impl Into<String>) -> Expr {
    binary(BinaryOp::NotIlike, field, pattern.into())
}

pub fn starts_with(field: impl IntoFieldRef, prefix: impl Into<String>) -> Expr {
    binary(BinaryOp::StartsWith, field, prefix.into())
}

pub fn ends_with(field: impl IntoFieldRef, suffix: impl Into<String>) -> Expr {
    binary(BinaryOp::EndsWith, field, suffix.into())
}

pub fn contains(field: impl IntoFieldRef, needle: impl Into<String>) -> Expr {
    binary(BinaryOp::Contains, field, needle.into())
}

pub fn is_null(field: impl IntoFieldRef) -> Expr {
    Expr::IsNull {
        field: field.into_field_ref(),
    }
}

pub fn is_not_null(field: impl IntoFieldRef) -> Expr {
    Expr::IsNotNull {
        field: field.into_field_ref(),
    }
}

pub fn not(operand: Expr) -> Expr {
    Expr::Not {
        operand: Box::new(operand),
    }
}

pub fn and(operands: Vec<Expr>) -> Expr {
    Expr::And { operands }
}

pub fn or(operands: Vec<Expr>) -> Expr {
    Expr::Or { operands }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(pairs: &[(&str, Value)]) -> Document {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn eq_and_ordering_comparisons() {
        let d = doc(&[("age", json!(30)), ("name", json!("Ada"))]);
        assert!(eq("age", 30).matches(&d));
        assert!(eq("age", 30.0).matches(&d));
        assert!(gt("age", 20).matches(&d));
        assert!(!lt("age", 20).matches(&d));
        assert!(gte("name", "Ada").matches(&d));
    }

    #[test]
    fn null_comparisons_are_unknown() {
        let d = doc(&[("nickname", Value::Null)]);
        assert_eq!(eq("nickname", "x").evaluate(&d), TriState::Unknown);
        assert_eq!(eq("missing", "x").evaluate(&d), TriState::Unknown);
        // Unknown under not stays unknown, so neither side matches.
        assert!(!eq("nickname", "x").matches(&d));
        assert!(!not(eq("nickname", "x")).matches(&d));
    }

    #[test]
    fn is_null_covers_absent_and_explicit_null() {
        let d = doc(&[("nickname", Value::Null)]);
        assert!(is_null("nickname").matches(&d));
        assert!(is_null("missing").matches(&d));
        assert!(!is_not_null("nickname").matches(&d));

        let d = doc(&[("nickname", json!("bee"))]);
        assert!(is_not_null("nickname").matches(&d));
    }

    #[test]
    fn id_and_created_at_resolve_to_system_fields() {
        let d = doc(&[("_id", json!("users:1")), ("_creationTime", json!(5000.0))]);
        assert!(eq("id", "users:1").matches(&d));
        assert!(gt("createdAt", 4000).matches(&d));
        assert_eq!(
            eq("id", "x").referenced_fields(),
            vec!["_id".to_string()]
        );
    }

    #[test]
    fn membership_and_array_operators() {
        let d = doc(&[("role", json!("admin")), ("tags", json!(["a", "b", "c"]))]);
        assert!(in_array("role", ["admin", "owner"]).matches(&d));
        assert!(!in_array("role", ["member"]).matches(&d));
        assert!(not_in_array("role", ["member"]).matches(&d));
        assert!(array_contains("tags", json!(["a", "c"])).matches(&d));
        assert!(!array_contains("tags", json!(["a", "z"])).matches(&d));
        assert!(array_contained("tags", json!(["a", "b", "c", "d"])).matches(&d));
        assert!(array_overlaps("tags", json!(["z", "b"])).matches(&d));
    }

    #[test]
    fn like_wildcards_and_case_variants() {
        let d = doc(&[("email", json!("Ada@Example.com"))]);
        assert!(like("email", "Ada@%.com").matches(&d));
        assert!(!like("email", "ada@%.com").matches(&d));
        assert!(ilike("email", "ada@%.com").matches(&d));
        assert!(like("email", "Ada@Example.co_").matches(&d));
        assert!(not_like("email", "bea@%").matches(&d));
        assert!(starts_with("email", "Ada@").matches(&d));
        assert!(ends_with("email", ".com").matches(&d));
        assert!(contains("email", "@Example").matches(&d));
    }

    #[test]
    fn logical_combinators_use_kleene_semantics() {
        let d = doc(&[("a", json!(1))]);
        // unknown OR true = true
        assert!(or(vec![eq("missing", 1), eq("a", 1)]).matches(&d));
        // unknown AND true = unknown
        assert_eq!(
            and(vec![eq("missing", 1), eq("a", 1)]).evaluate(&d),
            TriState::Unknown
        );
        assert!(and(vec![eq("a", 1), not(eq("a", 2))]).matches(&d));
    }

    #[test]
    fn serialization_round_trips() {
        let expr = and(vec![
            eq("status", "active"),
            or(vec![gt("age", 21), is_null("age")]),
            not(like("email", "%@spam.com")),
        ]);
        let encoded = serde_json::to_value(&expr).unwrap();
        let decoded: Expr = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, expr);
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        // Binary without a field reference.
        let missing_field = json!({"kind": "binary", "op": "eq", "value": 1});
        assert!(serde_json::from_value::<Expr>(missing_field).is_err());
        // Not without an operand.
        let missing_operand = json!({"kind": "not"});
        assert!(serde_json::from_value::<Expr>(missing_operand).is_err());
        // Unknown node kind.
        let unknown = json!({"kind": "xor", "operands": []});
        assert!(serde_json::from_value::<Expr>(unknown).is_err());
    }

    #[test]
    fn referenced_fields_deduplicates() {
        let expr = and(vec![eq("a", 1), gt("a", 0), eq("b", 2)]);
        assert_eq!(expr.referenced_fields(), vec!["a".to_string(), "b".to_string()]);
    }
}
