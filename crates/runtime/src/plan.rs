//! Static analysis of workflow definitions
//!
//! [`ExecutionPlan::build`] rejects configuration errors before anything is
//! persisted and derives what the dispatcher needs at run time: dependency
//! edges, a topological order, and the scatter scope each statement runs in.
//!
//! Scopes are stacks of scatter refs. A statement runs in the scope its
//! dependencies lead to: depending on a scatter enters that scatter's streams,
//! depending on a gather leaves them.

use std::collections::{BTreeSet, HashMap};

use serde_json::Value;

use crate::dsl::{ActionStatement, WorkflowDefinition, ERROR_EDGE_SUFFIX};
use crate::expression::{self, ExpressionError, ExpressionEvaluator};
use crate::registry::ActionRegistry;
use crate::schedule::{self, ScheduleError};

/// Configuration errors found before a run starts
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid action ref '{0}': use letters, digits, '_' or '-'")]
    InvalidRef(String),

    #[error("duplicate action ref '{0}'")]
    DuplicateRef(String),

    #[error("action '{action_ref}' depends on unknown action '{dependency}'")]
    UnknownDependency {
        action_ref: String,
        dependency: String,
    },

    #[error("dependency cycle among: {}", .0.join(", "))]
    Cycle(Vec<String>),

    #[error("action '{action_ref}' uses unknown action '{action}'")]
    UnknownAction { action_ref: String, action: String },

    #[error("action '{action_ref}': invalid {field}: {source}")]
    Expression {
        action_ref: String,
        field: &'static str,
        source: ExpressionError,
    },

    #[error("action '{action_ref}': invalid wait_until: {source}")]
    WaitUntil {
        action_ref: String,
        source: ScheduleError,
    },

    #[error("action '{action_ref}': invalid start_delay: {source}")]
    StartDelay {
        action_ref: String,
        source: ScheduleError,
    },

    #[error("action '{action_ref}' depends on actions in different scatter scopes")]
    ScopeMismatch { action_ref: String },

    #[error("action '{action_ref}' gathers but no scatter is open")]
    GatherWithoutScatter { action_ref: String },

    #[error("scatter '{scatter}' is gathered by both '{first}' and '{second}'")]
    DuplicateGather {
        scatter: String,
        first: String,
        second: String,
    },

    #[error("action '{action_ref}': {message}")]
    InvalidStatement { action_ref: String, message: String },

    #[error("invalid returns: {0}")]
    Returns(#[source] ExpressionError),
}

/// Which outcome satisfies a dependency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// `x`: satisfied by success, scatter or gather
    Success,
    /// `x.error`: satisfied by error
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub source: String,
    pub kind: EdgeKind,
}

impl Edge {
    pub fn parse(entry: &str) -> Self {
        match entry.strip_suffix(ERROR_EDGE_SUFFIX) {
            Some(source) => Edge {
                source: source.to_string(),
                kind: EdgeKind::Error,
            },
            None => Edge {
                source: entry.to_string(),
                kind: EdgeKind::Success,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Action,
    Scatter,
    Gather { scatter: String },
}

/// A statement plus everything derived for it
#[derive(Debug, Clone)]
pub struct PlanNode {
    pub statement: ActionStatement,
    pub edges: Vec<Edge>,
    pub kind: NodeKind,
    /// Scope whose streams execute this statement
    pub run_scope: Vec<String>,
    /// Scope whose context receives the outcome
    pub record_scope: Vec<String>,
    /// Some dependent holds an error edge from this statement
    pub error_handled: bool,
}

impl PlanNode {
    pub fn action_ref(&self) -> &str {
        &self.statement.action_ref
    }

    /// Scope a dependent enters through an edge of `kind` from this node
    fn scope_for_dependents(&self, kind: EdgeKind) -> Vec<String> {
        match (&self.kind, kind) {
            (NodeKind::Scatter, EdgeKind::Success) => {
                let mut scope = self.record_scope.clone();
                scope.push(self.statement.action_ref.clone());
                scope
            }
            _ => self.record_scope.clone(),
        }
    }
}

/// Validated, analyzed workflow definition
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    definition: WorkflowDefinition,
    nodes: Vec<PlanNode>,
    index: HashMap<String, usize>,
    order: Vec<usize>,
    gathers: HashMap<String, String>,
}

impl ExecutionPlan {
    /// Validate a definition and derive its plan
    pub fn build(
        definition: &WorkflowDefinition,
        registry: &dyn ActionRegistry,
        evaluator: &dyn ExpressionEvaluator,
    ) -> Result<Self, ValidationError> {
        let mut index = HashMap::new();
        for (i, stmt) in definition.actions.iter().enumerate() {
            let valid = !stmt.action_ref.is_empty()
                && stmt
                    .action_ref
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
            if !valid {
                return Err(ValidationError::InvalidRef(stmt.action_ref.clone()));
            }
            if index.insert(stmt.action_ref.clone(), i).is_some() {
                return Err(ValidationError::DuplicateRef(stmt.action_ref.clone()));
            }
        }

        let mut edges = Vec::with_capacity(definition.actions.len());
        for stmt in &definition.actions {
            let parsed: Vec<Edge> = stmt.depends_on.iter().map(|d| Edge::parse(d)).collect();
            for edge in &parsed {
                if !index.contains_key(&edge.source) {
                    return Err(ValidationError::UnknownDependency {
                        action_ref: stmt.action_ref.clone(),
                        dependency: edge.source.clone(),
                    });
                }
            }
            edges.push(parsed);
        }

        for stmt in &definition.actions {
            if !registry.contains(&stmt.action) {
                return Err(ValidationError::UnknownAction {
                    action_ref: stmt.action_ref.clone(),
                    action: stmt.action.clone(),
                });
            }
            check_statement(stmt, evaluator)?;
        }

        if let Some(returns) = &definition.returns {
            expression::validate_template(evaluator, returns).map_err(ValidationError::Returns)?;
        }

        let order = topological_order(definition, &edges, &index)?;

        let mut nodes: Vec<Option<PlanNode>> = vec![None; definition.actions.len()];
        let mut gathers: HashMap<String, String> = HashMap::new();
        for &i in &order {
            let stmt = &definition.actions[i];
            let mut scopes = BTreeSet::new();
            for edge in &edges[i] {
                let dep = nodes[index[&edge.source]]
                    .as_ref()
                    .map(|n| n.scope_for_dependents(edge.kind))
                    .unwrap_or_default();
                scopes.insert(dep);
            }
            if scopes.len() > 1 {
                return Err(ValidationError::ScopeMismatch {
                    action_ref: stmt.action_ref.clone(),
                });
            }
            let run_scope = scopes.into_iter().next().unwrap_or_default();

            let (kind, record_scope) = if stmt.is_gather() {
                let Some(scatter) = run_scope.last().cloned() else {
                    return Err(ValidationError::GatherWithoutScatter {
                        action_ref: stmt.action_ref.clone(),
                    });
                };
                if let Some(first) = gathers.get(&scatter) {
                    return Err(ValidationError::DuplicateGather {
                        scatter,
                        first: first.clone(),
                        second: stmt.action_ref.clone(),
                    });
                }
                gathers.insert(scatter.clone(), stmt.action_ref.clone());
                let record = run_scope[..run_scope.len() - 1].to_vec();
                (NodeKind::Gather { scatter }, record)
            } else if stmt.is_scatter() {
                (NodeKind::Scatter, run_scope.clone())
            } else {
                (NodeKind::Action, run_scope.clone())
            };

            nodes[i] = Some(PlanNode {
                statement: stmt.clone(),
                edges: edges[i].clone(),
                kind,
                run_scope,
                record_scope,
                error_handled: false,
            });
        }

        let mut nodes: Vec<PlanNode> = nodes.into_iter().flatten().collect();
        let handled: BTreeSet<String> = nodes
            .iter()
            .flat_map(|n| n.edges.iter())
            .filter(|e| e.kind == EdgeKind::Error)
            .map(|e| e.source.clone())
            .collect();
        for node in &mut nodes {
            node.error_handled = handled.contains(node.action_ref());
        }

        Ok(Self {
            definition: definition.clone(),
            nodes,
            index,
            order,
            gathers,
        })
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    pub fn node(&self, action_ref: &str) -> Option<&PlanNode> {
        self.index.get(action_ref).map(|&i| &self.nodes[i])
    }

    /// Statements in topological order
    pub fn ordered(&self) -> impl Iterator<Item = &PlanNode> {
        self.order.iter().map(|&i| &self.nodes[i])
    }

    /// Statements executed by streams of `scope`, in topological order
    pub fn nodes_in_scope<'a>(
        &'a self,
        scope: &'a [String],
    ) -> impl Iterator<Item = &'a PlanNode> + 'a {
        self.ordered().filter(move |n| n.run_scope == scope)
    }

    /// The gather closing `scatter`, if any
    pub fn gather_for(&self, scatter: &str) -> Option<&PlanNode> {
        self.gathers.get(scatter).and_then(|g| self.node(g))
    }

    pub fn returns(&self) -> Option<&Value> {
        self.definition.returns.as_ref()
    }
}

fn check_statement(
    stmt: &ActionStatement,
    evaluator: &dyn ExpressionEvaluator,
) -> Result<(), ValidationError> {
    let action_ref = &stmt.action_ref;
    let invalid = |message: &str| ValidationError::InvalidStatement {
        action_ref: action_ref.clone(),
        message: message.to_string(),
    };
    let check_expr = |field: &'static str, source: &str| {
        evaluator
            .validate(expression::unwrap_expression(source))
            .map_err(|source| ValidationError::Expression {
                action_ref: action_ref.clone(),
                field,
                source,
            })
    };

    if stmt.is_scatter() && stmt.is_gather() {
        return Err(invalid("for_each and gather cannot be combined"));
    }
    if (stmt.is_scatter() || stmt.is_gather())
        && (stmt.retry_policy.is_some() || stmt.interaction.is_some())
    {
        return Err(invalid(
            "scatter and gather statements take no retry_policy or interaction",
        ));
    }

    if let Some(run_if) = &stmt.run_if {
        check_expr("run_if", run_if)?;
    }
    if let Some(for_each) = &stmt.for_each {
        check_expr("for_each", for_each)?;
    }
    if let Some(gather) = &stmt.gather {
        check_expr("gather items", &gather.items)?;
    }
    expression::validate_template(evaluator, &Value::Object(stmt.args.clone())).map_err(|source| {
        ValidationError::Expression {
            action_ref: action_ref.clone(),
            field: "args",
            source,
        }
    })?;

    if let Some(policy) = &stmt.retry_policy {
        if let Some(until) = &policy.retry_until {
            check_expr("retry_until", until)?;
            if policy.max_attempts.is_none() && policy.timeout.is_none() {
                return Err(invalid("retry_until needs max_attempts or timeout"));
            }
        }
        if policy.max_attempts == Some(0) {
            return Err(invalid("max_attempts must be at least 1"));
        }
        if policy.timeout.is_some_and(|t| t.is_nan() || t <= 0.0) {
            return Err(invalid("retry timeout must be positive"));
        }
    }
    if let Some(interaction) = &stmt.interaction {
        if stmt
            .retry_policy
            .as_ref()
            .is_some_and(|p| p.retry_until.is_some())
        {
            return Err(invalid("retry_until cannot be combined with interaction"));
        }
        if interaction.timeout.is_some_and(|t| t.is_nan() || t <= 0.0) {
            return Err(invalid("interaction timeout must be positive"));
        }
    }

    if let Some(wait_until) = &stmt.wait_until {
        schedule::validate_wait_until(wait_until, evaluator).map_err(|source| {
            ValidationError::WaitUntil {
                action_ref: action_ref.clone(),
                source,
            }
        })?;
    }
    if let Some(delay) = stmt.start_delay {
        schedule::delay_duration(delay).map_err(|source| ValidationError::StartDelay {
            action_ref: action_ref.clone(),
            source,
        })?;
    }
    Ok(())
}

/// Kahn's algorithm, breaking ties by definition order
fn topological_order(
    definition: &WorkflowDefinition,
    edges: &[Vec<Edge>],
    index: &HashMap<String, usize>,
) -> Result<Vec<usize>, ValidationError> {
    let n = definition.actions.len();
    let mut indegree = vec![0usize; n];
    let mut dependents: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];
    for (i, node_edges) in edges.iter().enumerate() {
        let sources: BTreeSet<usize> = node_edges.iter().map(|e| index[&e.source]).collect();
        indegree[i] = sources.len();
        for s in sources {
            dependents[s].insert(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(i) = ready.pop_first() {
        order.push(i);
        for &d in &dependents[i] {
            indegree[d] -= 1;
            if indegree[d] == 0 {
                ready.insert(d);
            }
        }
    }

    if order.len() < n {
        let stuck = (0..n)
            .filter(|i| indegree[*i] > 0)
            .map(|i| definition.actions[i].action_ref.clone())
            .collect();
        return Err(ValidationError::Cycle(stuck));
    }
    Ok(order)
}
