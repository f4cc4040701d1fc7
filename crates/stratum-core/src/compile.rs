//! Where-clause compiler
//!
//! Splits a filter expression into the part a driver scan can serve
//! (an equality prefix over the best-scoring index plus a native filter
//! program) and the part evaluated in memory after the scan. The full
//! expression is always re-evaluated in memory, so pushdown is purely
//! an optimization; compilation is total and never fails. The worst
//! case is a full table scan plus post-filter.

use serde_json::Value;

use stratum_store::{FilterNode, IndexBounds};

use crate::expr::{BinaryOp, Expr};
use crate::schema::{Table, TableIndex};

/// How well an index matched the referenced field set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchKind {
    Partial,
    Prefix,
    Exact,
}

/// The index chosen for a query, with its score for introspection.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedIndex {
    pub name: String,
    pub fields: Vec<String>,
    pub kind: MatchKind,
    pub score: f64,
}

/// Result of compiling a where clause against one table.
#[derive(Debug, Clone, Default)]
pub struct CompiledWhere {
    /// Index binding for `ScanRequest::index`, equality prefix included.
    pub index: Option<IndexBounds>,
    /// Driver filter program for the residual clauses the store can
    /// evaluate natively.
    pub driver_filter: Option<FilterNode>,
    /// The full predicate, re-evaluated in memory after the scan.
    pub predicate: Option<Expr>,
}

/// Compile `predicate` against the indexes available on `table`.
pub fn compile_where(predicate: Option<&Expr>, table: &Table) -> CompiledWhere {
    let Some(expr) = predicate else {
        return CompiledWhere::default();
    };

    let refs = expr.referenced_fields();
    let selected = select_index(table.indexes(), &refs);

    let index = selected.map(|selected| {
        let eqs = conjunctive_eqs(expr);
        let mut eq = Vec::new();
        // Bind the longest run of index fields, in order from position
        // 0, that the predicate pins with conjunctive equality.
        for field in &selected.fields {
            match eqs.iter().find(|(f, _)| f == field) {
                Some((field, value)) => eq.push((field.clone(), value.clone())),
                None => break,
            }
        }
        IndexBounds {
            name: selected.name,
            fields: selected.fields,
            eq,
        }
    });

    let (driver_filter, _exact) = translate(expr);

    CompiledWhere {
        index,
        driver_filter: Some(driver_filter),
        predicate: Some(expr.clone()),
    }
}

/// Score every index against the referenced field set and pick the
/// winner. Exact matches score `100 + |fields|`, prefix matches
/// `75 + matched`, partial overlaps `50 * overlap / max(|fields|, |refs|)`;
/// ties break by match kind, then by field count.
pub fn select_index(indexes: &[TableIndex], refs: &[String]) -> Option<SelectedIndex> {
    let mut best: Option<SelectedIndex> = None;
    for index in indexes {
        let Some(candidate) = score_index(index, refs) else {
            continue;
        };
        let better = match &best {
            None => true,
            Some(current) => {
                (candidate.score, candidate.kind, candidate.fields.len())
                    > (current.score, current.kind, current.fields.len())
            }
        };
        if better {
            best = Some(candidate);
        }
    }
    best
}

fn score_index(index: &TableIndex, refs: &[String]) -> Option<SelectedIndex> {
    if refs.is_empty() || index.fields.is_empty() {
        return None;
    }
    let contained = |field: &String| refs.contains(field);

    if index.fields.len() == refs.len() && index.fields.iter().all(contained) {
        return Some(SelectedIndex {
            name: index.name.clone(),
            fields: index.fields.clone(),
            kind: MatchKind::Exact,
            score: 100.0 + index.fields.len() as f64,
        });
    }

    let matched_prefix = index.fields.iter().take_while(|f| contained(f)).count();
    if matched_prefix > 0 && matched_prefix < index.fields.len() {
        return Some(SelectedIndex {
            name: index.name.clone(),
            fields: index.fields.clone(),
            kind: MatchKind::Prefix,
            score: 75.0 + matched_prefix as f64,
        });
    }

    let overlap = index.fields.iter().filter(|f| contained(f)).count();
    if overlap > 0 {
        return Some(SelectedIndex {
            name: index.name.clone(),
            fields: index.fields.clone(),
            kind: MatchKind::Partial,
            score: 50.0 * overlap as f64 / index.fields.len().max(refs.len()) as f64,
        });
    }
    None
}

/// Equality bindings that hold conjunctively for the whole predicate:
/// `eq` nodes at the top level or under nested `and`s. The first
/// binding per field wins.
fn conjunctive_eqs(expr: &Expr) -> Vec<(String, Value)> {
    fn collect(expr: &Expr, out: &mut Vec<(String, Value)>) {
        match expr {
            Expr::Binary {
                op: BinaryOp::Eq,
                field,
                value,
            } => {
                let name = field.storage_field().to_string();
                if !out.iter().any(|(f, _)| *f == name) {
                    out.push((name, value.clone()));
                }
            }
            Expr::And { operands } => {
                for operand in operands {
                    collect(operand, out);
                }
            }
            _ => {}
        }
    }
    let mut out = Vec::new();
    collect(expr, &mut out);
    out
}

/// Lower the predicate to the driver's native filter ops. Returns the
/// program plus whether it is exact; any clause the store cannot
/// evaluate (`like`/`contains`/`array*`) becomes a conservative `true`,
/// and a `not` over an inexact subtree degrades to `true` so the scan
/// is never over-restricted.
fn translate(expr: &Expr) -> (FilterNode, bool) {
    match expr {
        Expr::Binary { op, field, value } => {
            let field = field.storage_field().to_string();
            let value = value.clone();
            match op {
                BinaryOp::Eq => (FilterNode::Eq { field, value }, true),
                BinaryOp::Ne => (FilterNode::Neq { field, value }, true),
                BinaryOp::Gt => (FilterNode::Gt { field, value }, true),
                BinaryOp::Gte => (FilterNode::Gte { field, value }, true),
                BinaryOp::Lt => (FilterNode::Lt { field, value }, true),
                BinaryOp::Lte => (FilterNode::Lte { field, value }, true),
                BinaryOp::InArray => match value.as_array() {
                    Some(candidates) => (
                        FilterNode::Or {
                            nodes: candidates
                                .iter()
                                .map(|candidate| FilterNode::Eq {
                                    field: field.clone(),
                                    value: candidate.clone(),
                                })
                                .collect(),
                        },
                        true,
                    ),
                    None => (FilterNode::Literal { value: true }, false),
                },
                BinaryOp::NotInArray => match value.as_array() {
                    Some(candidates) => (
                        FilterNode::Not {
                            node: Box::new(FilterNode::Or {
                                nodes: candidates
                                    .iter()
                                    .map(|candidate| FilterNode::Eq {
                                        field: field.clone(),
                                        value: candidate.clone(),
                                    })
                                    .collect(),
                            }),
                        },
                        true,
                    ),
                    None => (FilterNode::Literal { value: true }, false),
                },
                // Pattern and array operators have no native form.
                _ => (FilterNode::Literal { value: true }, false),
            }
        }
        Expr::IsNull { field } => (
            FilterNode::Eq {
                field: field.storage_field().to_string(),
                value: Value::Null,
            },
            true,
        ),
        Expr::IsNotNull { field } => (
            FilterNode::Not {
                node: Box::new(FilterNode::Eq {
                    field: field.storage_field().to_string(),
                    value: Value::Null,
                }),
            },
            true,
        ),
        Expr::Not { operand } => {
            let (node, exact) = translate(operand);
            if exact {
                (
                    FilterNode::Not {
                        node: Box::new(node),
                    },
                    true,
                )
            } else {
                (FilterNode::Literal { value: true }, false)
            }
        }
        Expr::And { operands } => {
            let mut exact = true;
            let nodes = operands
                .iter()
                .map(|operand| {
                    let (node, node_exact) = translate(operand);
                    exact &= node_exact;
                    node
                })
                .collect();
            (FilterNode::And { nodes }, exact)
        }
        Expr::Or { operands } => {
            let mut exact = true;
            let nodes = operands
                .iter()
                .map(|operand| {
                    let (node, node_exact) = translate(operand);
                    exact &= node_exact;
                    node
                })
                .collect();
            (FilterNode::Or { nodes }, exact)
        }
    }
}
