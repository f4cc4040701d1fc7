//! Row-level security
//!
//! Policy declaration and evaluation. A table opts in with
//! `enable_rls()`; after that, every operation must be allowed by at
//! least one applicable permissive policy and by all applicable
//! restrictive policies.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use stratum_store::Document;

use crate::expr::Expr;
use crate::schema::Table;

// ---------------------------------------------------------------------------
// Request context
// ---------------------------------------------------------------------------

/// Whether policies are enforced for a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RlsMode {
    #[default]
    Enforce,
    /// Bypass every policy (system-level access).
    Skip,
}

/// Per-request context the engine evaluates policies against.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub mode: RlsMode,
    /// Resolved roles for the request. `None` means no resolver is
    /// configured and the request is treated as `public`.
    pub roles: Option<Vec<String>>,
}

impl RequestContext {
    pub fn public() -> Self {
        Self::default()
    }

    pub fn with_roles(roles: impl IntoIterator<Item = impl Into<String>>) -> Self {
        RequestContext {
            mode: RlsMode::Enforce,
            roles: Some(roles.into_iter().map(Into::into).collect()),
        }
    }

    pub fn skip_rules(mut self) -> Self {
        self.mode = RlsMode::Skip;
        self
    }

    fn resolved_roles(&self) -> Vec<String> {
        self.roles
            .clone()
            .unwrap_or_else(|| vec!["public".to_string()])
    }
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// Permissive policies are OR-ed; restrictive policies are AND-ed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    Permissive,
    Restrictive,
}

/// Operation a policy applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyFor {
    All,
    Select,
    Insert,
    Update,
    Delete,
}

/// A policy body: a fixed expression or a factory evaluated per request.
#[derive(Clone)]
pub enum PolicyExpr {
    Expr(Expr),
    Factory(Arc<dyn Fn(&RequestContext, &str) -> Expr + Send + Sync>),
}

impl PolicyExpr {
    fn resolve(&self, ctx: &RequestContext, table: &str) -> Expr {
        match self {
            PolicyExpr::Expr(expr) => expr.clone(),
            PolicyExpr::Factory(factory) => factory(ctx, table),
        }
    }
}

impl fmt::Debug for PolicyExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyExpr::Expr(expr) => write!(f, "Expr({expr:?})"),
            PolicyExpr::Factory(_) => write!(f, "Factory"),
        }
    }
}

/// A single RLS policy.
#[derive(Debug, Clone)]
pub struct Policy {
    pub(crate) name: String,
    pub(crate) kind: PolicyKind,
    pub(crate) applies_to: PolicyFor,
    /// Role set the policy is granted to; empty grants to every role.
    pub(crate) roles: Vec<String>,
    pub(crate) using: Option<PolicyExpr>,
    pub(crate) with_check: Option<PolicyExpr>,
}

impl Policy {
    pub fn permissive(name: &str) -> Self {
        Policy {
            name: name.to_string(),
            kind: PolicyKind::Permissive,
            applies_to: PolicyFor::All,
            roles: Vec::new(),
            using: None,
            with_check: None,
        }
    }

    pub fn restrictive(name: &str) -> Self {
        Policy {
            kind: PolicyKind::Restrictive,
            ..Policy::permissive(name)
        }
    }

    pub fn for_op(mut self, op: PolicyFor) -> Self {
        self.applies_to = op;
        self
    }

    pub fn to(mut self, roles: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn using(mut self, expr: Expr) -> Self {
        self.using = Some(PolicyExpr::Expr(expr));
        self
    }

    pub fn using_fn(
        mut self,
        factory: impl Fn(&RequestContext, &str) -> Expr + Send + Sync + 'static,
    ) -> Self {
        self.using = Some(PolicyExpr::Factory(Arc::new(factory)));
        self
    }

    pub fn with_check(mut self, expr: Expr) -> Self {
        self.with_check = Some(PolicyExpr::Expr(expr));
        self
    }

    pub fn with_check_fn(
        mut self,
        factory: impl Fn(&RequestContext, &str) -> Expr + Send + Sync + 'static,
    ) -> Self {
        self.with_check = Some(PolicyExpr::Factory(Arc::new(factory)));
        self
    }

    fn applies_to_op(&self, op: PolicyFor) -> bool {
        self.applies_to == PolicyFor::All || self.applies_to == op
    }

    fn granted_to(&self, roles: &[String]) -> bool {
        self.roles.is_empty() || self.roles.iter().any(|r| roles.contains(r))
    }

    /// Evaluate one phase of the policy against a row. A missing body
    /// places no constraint; `with_check` falls back to `using`.
    fn passes(&self, phase: PolicyPhase, row: &Document, ctx: &RequestContext, table: &str) -> bool {
        let body = match phase {
            PolicyPhase::Using => self.using.as_ref(),
            PolicyPhase::WithCheck => self.with_check.as_ref().or(self.using.as_ref()),
        };
        match body {
            Some(body) => body.resolve(ctx, table).matches(row),
            None => true,
        }
    }
}

/// Which policy body applies: `using` sees the existing row,
/// `with_check` sees the row being written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyPhase {
    Using,
    WithCheck,
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Decide whether `op` on `row` is allowed by the table's policy set.
pub fn allows(
    table: &Table,
    op: PolicyFor,
    phase: PolicyPhase,
    row: &Document,
    ctx: &RequestContext,
) -> bool {
    if !table.rls_enabled() {
        return true;
    }
    if ctx.mode == RlsMode::Skip {
        return true;
    }
    let roles = ctx.resolved_roles();
    let applicable: Vec<&Policy> = table
        .policies()
        .iter()
        .filter(|p| p.applies_to_op(op) && p.granted_to(&roles))
        .collect();
    if applicable.is_empty() {
        return false;
    }

    let permissive_passes = applicable
        .iter()
        .filter(|p| p.kind == PolicyKind::Permissive)
        .any(|p| p.passes(phase, row, ctx, table.name()));
    if !permissive_passes {
        return false;
    }

    applicable
        .iter()
        .filter(|p| p.kind == PolicyKind::Restrictive)
        .all(|p| p.passes(phase, row, ctx, table.name()))
}

/// The split decision for updates: whether the old row was selectable
/// (`using`) and whether the new row is admissible (`with_check`).
/// `using` passing while `with_check` fails is a policy violation;
/// `using` failing is a silent skip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateDecision {
    pub using_allowed: bool,
    pub with_check_allowed: bool,
}

pub fn update_decision(
    table: &Table,
    old_row: &Document,
    new_row: &Document,
    ctx: &RequestContext,
) -> UpdateDecision {
    UpdateDecision {
        using_allowed: allows(table, PolicyFor::Update, PolicyPhase::Using, old_row, ctx),
        with_check_allowed: allows(
            table,
            PolicyFor::Update,
            PolicyPhase::WithCheck,
            new_row,
            ctx,
        ),
    }
}
