//! Relation graph
//!
//! Declares named edges between tables (`one`, `many`, `many.through`)
//! and extracts the flat edge metadata the query executor walks. Edge
//! extraction runs once at ORM construction: inverses are auto-paired,
//! ambiguity is rejected, and cycles of required one-edges fail fast.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{OrmError, OrmResult};
use crate::schema::Schema;

// ---------------------------------------------------------------------------
// Declarations
// ---------------------------------------------------------------------------

/// Builder for a `one` edge: a foreign key from the declaring table.
#[derive(Debug, Clone)]
pub struct OneBuilder {
    target: String,
    fields: Vec<String>,
    references: Vec<String>,
    optional: Option<bool>,
    alias: Option<String>,
}

/// A `one` edge to `target`, joined through the declaring table's FK
/// columns (`fields`).
pub fn one(target: &str) -> OneBuilder {
    OneBuilder {
        target: target.to_string(),
        fields: Vec::new(),
        references: vec!["id".to_string()],
        optional: None,
        alias: None,
    }
}

impl OneBuilder {
    pub fn fields(mut self, fields: &[&str]) -> Self {
        self.fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn references(mut self, references: &[&str]) -> Self {
        self.references = references.iter().map(|r| r.to_string()).collect();
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = Some(true);
        self
    }

    pub fn alias(mut self, alias: &str) -> Self {
        self.alias = Some(alias.to_string());
        self
    }
}

/// Builder for a `many` edge: the inverse of a `one`, or a M:N through
/// a junction table.
#[derive(Debug, Clone)]
pub struct ManyBuilder {
    target: String,
    alias: Option<String>,
    through: Option<Through>,
}

pub fn many(target: &str) -> ManyBuilder {
    ManyBuilder {
        target: target.to_string(),
        alias: None,
        through: None,
    }
}

impl ManyBuilder {
    pub fn alias(mut self, alias: &str) -> Self {
        self.alias = Some(alias.to_string());
        self
    }

    /// M:N through `junction`, whose `source_field` points back at the
    /// declaring table and `target_field` at the target.
    pub fn through(mut self, junction: &str, source_field: &str, target_field: &str) -> Self {
        self.through = Some(Through {
            table: junction.to_string(),
            source_field: source_field.to_string(),
            target_field: target_field.to_string(),
        });
        self
    }
}

#[derive(Debug, Clone)]
enum RelationDef {
    One(OneBuilder),
    Many(ManyBuilder),
}

/// The declared relation configuration, keyed by table then edge name.
#[derive(Debug, Clone, Default)]
pub struct Relations {
    tables: BTreeMap<String, Vec<(String, RelationDef)>>,
}

impl Relations {
    pub fn builder() -> RelationsBuilder {
        RelationsBuilder {
            relations: Relations::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RelationsBuilder {
    relations: Relations,
}

impl RelationsBuilder {
    pub fn one(mut self, table: &str, edge: &str, def: OneBuilder) -> Self {
        self.relations
            .tables
            .entry(table.to_string())
            .or_default()
            .push((edge.to_string(), RelationDef::One(def)));
        self
    }

    pub fn many(mut self, table: &str, edge: &str, def: ManyBuilder) -> Self {
        self.relations
            .tables
            .entry(table.to_string())
            .or_default()
            .push((edge.to_string(), RelationDef::Many(def)));
        self
    }

    pub fn build(self) -> Relations {
        self.relations
    }
}

// ---------------------------------------------------------------------------
// Extracted edges
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    One,
    Many,
}

/// M:N junction hop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Through {
    pub table: String,
    pub source_field: String,
    pub target_field: String,
}

/// A directed relation edge, flattened for execution.
///
/// For `One`, `source_fields` are the FK columns on the source and
/// `target_fields` the referenced columns on the target. For `Many`,
/// `source_fields` are the referenced columns on the source and
/// `target_fields` the FK columns on the target (the paired inverse).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub source_table: String,
    pub edge_name: String,
    pub target_table: String,
    pub cardinality: Cardinality,
    pub source_fields: Vec<String>,
    pub target_fields: Vec<String>,
    /// Whether any source FK column is nullable (One only).
    pub source_nullable: bool,
    /// Index on the scanned (target) table covering the join columns.
    pub index_name: Option<String>,
    pub index_fields: Vec<String>,
    pub through: Option<Through>,
}

/// Extract the edge list from the declared relations.
pub fn extract_edges(schema: &Schema, relations: &Relations) -> OrmResult<Vec<Edge>> {
    let mut edges = Vec::new();

    for (source_name, defs) in &relations.tables {
        let source = schema.table(source_name)?;
        for (edge_name, def) in defs {
            match def {
                RelationDef::One(one) => {
                    let target = schema.table(&one.target)?;
                    if one.fields.is_empty() {
                        return Err(OrmError::InvalidSchema {
                            table: source_name.clone(),
                            reason: format!("one('{edge_name}') requires fields()"),
                        });
                    }
                    if one.fields.len() != one.references.len() {
                        return Err(OrmError::InvalidSchema {
                            table: source_name.clone(),
                            reason: format!(
                                "one('{edge_name}') fields/references length mismatch"
                            ),
                        });
                    }
                    let mut nullable = false;
                    for field in &one.fields {
                        let column =
                            source
                                .column(field)
                                .ok_or_else(|| OrmError::UnknownColumn {
                                    table: source_name.clone(),
                                    column: field.clone(),
                                })?;
                        nullable |= column.is_nullable();
                    }
                    for reference in &one.references {
                        if reference != "id" && target.column(reference).is_none() {
                            return Err(OrmError::UnknownColumn {
                                table: one.target.clone(),
                                column: reference.clone(),
                            });
                        }
                    }
                    let index = if one.references == ["id"] {
                        None
                    } else {
                        target.index_covering(&one.references)
                    };
                    edges.push(Edge {
                        source_table: source_name.clone(),
                        edge_name: edge_name.clone(),
                        target_table: one.target.clone(),
                        cardinality: Cardinality::One,
                        source_fields: one.fields.clone(),
                        target_fields: one.references.clone(),
                        source_nullable: one.optional.unwrap_or(nullable),
                        index_name: index.map(|i| i.name.clone()),
                        index_fields: index.map(|i| i.fields.clone()).unwrap_or_default(),
                        through: None,
                    });
                }
                RelationDef::Many(def) => {
                    let target = schema.table(&def.target)?;
                    if let Some(through) = &def.through {
                        let junction = schema.table(&through.table)?;
                        for field in [&through.source_field, &through.target_field] {
                            if junction.column(field).is_none() {
                                return Err(OrmError::UnknownColumn {
                                    table: through.table.clone(),
                                    column: field.clone(),
                                });
                            }
                        }
                        let index = junction.index_covering(std::slice::from_ref(
                            &through.source_field,
                        ));
                        edges.push(Edge {
                            source_table: source_name.clone(),
                            edge_name: edge_name.clone(),
                            target_table: def.target.clone(),
                            cardinality: Cardinality::Many,
                            source_fields: vec!["id".to_string()],
                            target_fields: vec!["id".to_string()],
                            source_nullable: false,
                            index_name: index.map(|i| i.name.clone()),
                            index_fields: index.map(|i| i.fields.clone()).unwrap_or_default(),
                            through: Some(through.clone()),
                        });
                        continue;
                    }

                    // Auto-pair with the inverse one edge declared on the
                    // target table, by alias when given.
                    let candidates: Vec<&OneBuilder> = relations
                        .tables
                        .get(&def.target)
                        .map(|defs| {
                            defs.iter()
                                .filter_map(|(_, d)| match d {
                                    RelationDef::One(o) if o.target == *source_name => Some(o),
                                    _ => None,
                                })
                                .filter(|o| match (&def.alias, &o.alias) {
                                    (Some(a), Some(b)) => a == b,
                                    (Some(_), None) => false,
                                    (None, _) => true,
                                })
                                .collect()
                        })
                        .unwrap_or_default();

                    let inverse = match candidates.as_slice() {
                        [] => {
                            return Err(OrmError::UnknownRelation {
                                table: source_name.clone(),
                                relation: format!(
                                    "{edge_name} (no inverse one() on '{}')",
                                    def.target
                                ),
                            })
                        }
                        [single] => *single,
                        _ => {
                            return Err(OrmError::AmbiguousRelation {
                                table: source_name.clone(),
                                relation: edge_name.clone(),
                            })
                        }
                    };

                    let index = target.index_covering(&inverse.fields);
                    edges.push(Edge {
                        source_table: source_name.clone(),
                        edge_name: edge_name.clone(),
                        target_table: def.target.clone(),
                        cardinality: Cardinality::Many,
                        source_fields: inverse.references.clone(),
                        target_fields: inverse.fields.clone(),
                        source_nullable: false,
                        index_name: index.map(|i| i.name.clone()),
                        index_fields: index.map(|i| i.fields.clone()).unwrap_or_default(),
                        through: None,
                    });
                }
            }
        }
    }

    detect_required_cycles(&edges)?;
    Ok(edges)
}

/// Reject cycles composed exclusively of required (non-nullable)
/// one-edges. Nullable and self-referencing edges are common and stay
/// allowed.
fn detect_required_cycles(edges: &[Edge]) -> OrmResult<()> {
    let required: Vec<&Edge> = edges
        .iter()
        .filter(|e| {
            e.cardinality == Cardinality::One
                && !e.source_nullable
                && e.source_table != e.target_table
        })
        .collect();

    fn walk<'a>(
        node: &'a str,
        required: &[&'a Edge],
        path: &mut Vec<&'a str>,
        done: &mut Vec<&'a str>,
    ) -> OrmResult<()> {
        if done.contains(&node) {
            return Ok(());
        }
        if let Some(at) = path.iter().position(|t| *t == node) {
            let mut cycle: Vec<&str> = path[at..].to_vec();
            cycle.push(node);
            return Err(OrmError::RequiredCycle {
                path: cycle.join(" -> "),
            });
        }
        path.push(node);
        for edge in required.iter().filter(|e| e.source_table == node) {
            walk(&edge.target_table, required, path, done)?;
        }
        path.pop();
        done.push(node);
        Ok(())
    }

    let mut done = Vec::new();
    for edge in &required {
        walk(&edge.source_table, &required, &mut Vec::new(), &mut done)?;
    }
    Ok(())
}
