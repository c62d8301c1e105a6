//! Cost-based plan selection.
//!
//! Candidates are enumerated from the normalized predicate against the
//! readable indexes: a full scan (always viable), single-index scans for
//! equality-prefix + range matches, intersections and unions of
//! equality-only scans, covering-only variants, interval-overlap scans, and
//! a limit wrapper. Each candidate is costed as `io + 0.1·cpu` with
//! statistics-driven selectivities; ties break on a deterministic hash of
//! the plan's canonical description.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::keyexpr::{BoundarySide, Column};
use crate::schema::{IndexDef, IndexKind, Schema};
use crate::stats::{
    and_selectivity, not_selectivity, or_selectivity, IntervalStats, ValueStats, DEFAULT_CMP_SELECTIVITY,
    DEFAULT_CONTAINS_SELECTIVITY, DEFAULT_EQ_SELECTIVITY, DEFAULT_NE_SELECTIVITY, DEFAULT_STARTS_WITH_SELECTIVITY,
};
use crate::value::Value;

use super::predicate::{CompareOp, Predicate};

pub const CPU_WEIGHT: f64 = 0.1;
const COST_DESERIALIZE: f64 = 1.0;
const COST_FILTER: f64 = 0.2;
const UNION_DEDUP_FACTOR: f64 = 0.9;
const DEFAULT_TABLE_ROWS: f64 = 1000.0;

#[derive(Debug, Clone, PartialEq)]
pub enum QueryPlan {
    /// Scan the record extent and filter in memory
    FullScan { filter: Predicate },
    /// Scan one index over an equality prefix plus optional range on the
    /// next column; `filter` is re-checked on every emitted record
    IndexScan {
        index: String,
        prefix: Vec<Value>,
        lower: Option<(Value, bool)>,
        upper: Option<(Value, bool)>,
        filter: Predicate,
        covering: bool,
    },
    /// Sorted-merge over equality-only index scans on the shared primary-key
    /// suffix; child filters participate in costing only
    Intersection { children: Vec<QueryPlan>, filter: Predicate },
    /// Merge-by-primary-key with deduplication; each child carries its own
    /// disjunct as filter
    Union { children: Vec<QueryPlan> },
    Limit { child: Box<QueryPlan>, limit: usize },
}

impl QueryPlan {
    /// Canonical one-line form, used for display and deterministic
    /// tie-breaking.
    pub fn describe(&self) -> String {
        match self {
            QueryPlan::FullScan { .. } => "scan".to_string(),
            QueryPlan::IndexScan { index, prefix, lower, upper, covering, .. } => {
                let bounds = match (lower, upper) {
                    (None, None) => String::new(),
                    (l, u) => format!(
                        ",{}..{}",
                        l.as_ref().map(|(v, i)| format!("{}{}", if *i { "=" } else { "" }, v)).unwrap_or_default(),
                        u.as_ref().map(|(v, i)| format!("{}{}", if *i { "=" } else { "" }, v)).unwrap_or_default(),
                    ),
                };
                let prefix_str = prefix.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(",");
                format!("index({}{}[{}{}])", if *covering { "covering " } else { "" }, index, prefix_str, bounds)
            }
            QueryPlan::Intersection { children, .. } => {
                format!("intersect({})", children.iter().map(|c| c.describe()).collect::<Vec<_>>().join(","))
            }
            QueryPlan::Union { children } => {
                format!("union({})", children.iter().map(|c| c.describe()).collect::<Vec<_>>().join(","))
            }
            QueryPlan::Limit { child, limit } => format!("limit({},{})", limit, child.describe()),
        }
    }
}

/// Everything the planner needs to know about the world.
pub struct PlannerInputs<'a> {
    pub schema: &'a Schema,
    pub record_type: &'a str,
    /// Names of indexes currently readable
    pub readable: HashSet<String>,
    pub value_stats: HashMap<String, ValueStats>,
    pub interval_stats: HashMap<String, IntervalStats>,
    /// Whether the codec can rebuild this record type from covering entries
    pub supports_covering: bool,
    /// Estimated record population; falls back to a nominal constant
    pub table_rows: Option<f64>,
}

impl<'a> PlannerInputs<'a> {
    fn rows(&self) -> f64 { self.table_rows.unwrap_or(DEFAULT_TABLE_ROWS).max(1.0) }
}

#[derive(Debug, Clone)]
pub struct PlanChoice {
    pub plan: QueryPlan,
    pub cost: f64,
    pub estimated_rows: f64,
    /// All costed candidates, for explain output
    pub alternatives: Vec<(String, f64)>,
}

/// Choose the cheapest plan for a normalized predicate.
pub fn plan(inputs: &PlannerInputs<'_>, predicate: &Predicate, limit: Option<usize>) -> PlanChoice {
    let mut candidates = enumerate(inputs, predicate);
    if let Some(limit) = limit {
        candidates = candidates.into_iter().map(|c| QueryPlan::Limit { child: Box::new(c), limit }).collect();
    }

    let mut best: Option<(QueryPlan, f64, f64, u64)> = None;
    let mut alternatives = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let (cost, rows) = cost_of(inputs, &candidate);
        let description = candidate.describe();
        let hash = fnv1a(&description);
        alternatives.push((description, cost));
        let better = match &best {
            None => true,
            Some((_, best_cost, _, best_hash)) => cost < *best_cost || (cost == *best_cost && hash < *best_hash),
        };
        if better {
            best = Some((candidate, cost, rows, hash));
        }
    }
    // The full scan is always enumerated, so best is always present
    let (plan, cost, estimated_rows, _) = best.unwrap_or((
        QueryPlan::FullScan { filter: predicate.clone() },
        f64::INFINITY,
        inputs.rows(),
        0,
    ));
    debug!(plan = %plan.describe(), cost, estimated_rows, "selected query plan");
    PlanChoice { plan, cost, estimated_rows, alternatives }
}

fn enumerate(inputs: &PlannerInputs<'_>, predicate: &Predicate) -> Vec<QueryPlan> {
    let mut candidates = vec![QueryPlan::FullScan { filter: predicate.clone() }];

    let conjuncts: Vec<&Predicate> = match predicate {
        Predicate::And(children) => children.iter().collect(),
        Predicate::True => Vec::new(),
        leaf => vec![leaf],
    };

    // Single-index scans over the conjunctive leaves
    let mut equality_only: Vec<QueryPlan> = Vec::new();
    for index in readable_scan_indexes(inputs) {
        if let Some(scan) = match_index(inputs, index, &conjuncts, predicate) {
            if let QueryPlan::IndexScan { ref prefix, lower: None, upper: None, .. } = scan {
                if !prefix.is_empty() {
                    equality_only.push(with_filter(&scan, consumed_filter(index, &conjuncts)));
                }
            }
            candidates.push(scan);
        }
    }

    // Intersection of two or more equality-only matches
    if equality_only.len() >= 2 {
        candidates.push(QueryPlan::Intersection { children: equality_only, filter: predicate.clone() });
    }

    // Union over a disjunction where every arm has an equality-only match
    if let Predicate::Or(terms) = predicate {
        if let Some(children) = union_children(inputs, terms) {
            candidates.push(QueryPlan::Union { children });
        }
    }

    candidates
}

fn readable_scan_indexes<'a>(inputs: &'a PlannerInputs<'_>) -> Vec<&'a IndexDef> {
    inputs
        .schema
        .indexes_for(inputs.record_type)
        .into_iter()
        .filter(|i| inputs.readable.contains(&i.name))
        .filter(|i| matches!(i.kind, IndexKind::Value | IndexKind::Covering | IndexKind::Unique))
        .collect()
}

/// Try to match one index against the conjunctive leaves: equalities on a
/// strict left prefix of the index columns, then an optional range (or
/// interval overlap) on the next column.
fn match_index(
    inputs: &PlannerInputs<'_>,
    index: &IndexDef,
    conjuncts: &[&Predicate],
    predicate: &Predicate,
) -> Option<QueryPlan> {
    let columns = index.root.flat_columns()?;

    if index.is_interval() {
        return match_interval(index, &columns, conjuncts, predicate);
    }

    let mut prefix = Vec::new();
    let mut next_column = None;
    for column in &columns {
        let Column::Field(field) = column else { return None };
        match find_equality(conjuncts, field) {
            Some(value) => prefix.push(value.clone()),
            None => {
                next_column = Some(*field);
                break;
            }
        }
    }

    let (mut lower, mut upper) = (None, None);
    if let Some(field) = next_column {
        for leaf in conjuncts {
            if let Predicate::Compare { field: f, op, value } = leaf {
                if f != field {
                    continue;
                }
                match op {
                    CompareOp::Gt => tighten_lower(&mut lower, value.clone(), false),
                    CompareOp::Ge => tighten_lower(&mut lower, value.clone(), true),
                    CompareOp::Lt => tighten_upper(&mut upper, value.clone(), false),
                    CompareOp::Le => tighten_upper(&mut upper, value.clone(), true),
                    _ => {}
                }
            }
        }
    }

    if prefix.is_empty() && lower.is_none() && upper.is_none() {
        return None;
    }
    let covering = covering_applicable(inputs, index);
    Some(QueryPlan::IndexScan { index: index.name.clone(), prefix, lower, upper, filter: predicate.clone(), covering })
}

/// An interval index (lower/upper boundary pair) serves overlap leaves: the
/// scan bounds the entry's lower boundary by the window's upper end, the
/// filter re-checks the other half.
fn match_interval(
    index: &IndexDef,
    columns: &[Column<'_>],
    conjuncts: &[&Predicate],
    predicate: &Predicate,
) -> Option<QueryPlan> {
    let Column::Boundary(interval_field, BoundarySide::Lower) = columns.first()? else { return None };
    for leaf in conjuncts {
        if let Predicate::Overlaps { field, from, to } = leaf {
            if field != interval_field {
                continue;
            }
            let upper = to.as_ref().map(|t| {
                let point_probe = from.as_ref().map(|f| f.cmp_order(t) == std::cmp::Ordering::Equal).unwrap_or(false);
                (t.clone(), point_probe)
            });
            return Some(QueryPlan::IndexScan {
                index: index.name.clone(),
                prefix: Vec::new(),
                lower: None,
                upper,
                filter: predicate.clone(),
                covering: false,
            });
        }
    }
    None
}

fn find_equality<'p>(conjuncts: &[&'p Predicate], field: &str) -> Option<&'p Value> {
    conjuncts.iter().find_map(|leaf| match leaf {
        Predicate::Compare { field: f, op: CompareOp::Eq, value } if f == field => Some(value),
        _ => None,
    })
}

fn tighten_lower(bound: &mut Option<(Value, bool)>, value: Value, inclusive: bool) {
    let replace = match bound {
        None => true,
        Some((current, _)) => value.cmp_order(current) == std::cmp::Ordering::Greater,
    };
    if replace {
        *bound = Some((value, inclusive));
    }
}

fn tighten_upper(bound: &mut Option<(Value, bool)>, value: Value, inclusive: bool) {
    let replace = match bound {
        None => true,
        Some((current, _)) => value.cmp_order(current) == std::cmp::Ordering::Less,
    };
    if replace {
        *bound = Some((value, inclusive));
    }
}

/// Covering-only scans need a codec that reconstructs, a single target type,
/// and index key + value columns that cover every non-transient field.
fn covering_applicable(inputs: &PlannerInputs<'_>, index: &IndexDef) -> bool {
    if !inputs.supports_covering || !matches!(index.kind, IndexKind::Covering) {
        return false;
    }
    if index.single_record_type() != Some(inputs.record_type) {
        return false;
    }
    let Some(rt) = inputs.schema.record_type(inputs.record_type) else { return false };
    let mut covered: HashSet<&str> = HashSet::new();
    for expr in [Some(&index.root), index.covering.as_ref(), Some(rt.primary_key())].into_iter().flatten() {
        covered.extend(expr.referenced_fields());
    }
    rt.fields().iter().filter(|f| !f.transient).all(|f| covered.contains(f.name.as_str()))
}

/// The part of the predicate an equality-only match consumes, for costing.
fn consumed_filter(index: &IndexDef, conjuncts: &[&Predicate]) -> Predicate {
    let Some(columns) = index.root.flat_columns() else { return Predicate::True };
    let mut consumed = Vec::new();
    for column in &columns {
        let Column::Field(field) = column else { break };
        match conjuncts.iter().find(|leaf| matches!(leaf, Predicate::Compare { field: f, op: CompareOp::Eq, .. } if f == field)) {
            Some(leaf) => consumed.push((*leaf).clone()),
            None => break,
        }
    }
    match consumed.len() {
        0 => Predicate::True,
        1 => consumed.into_iter().next().unwrap_or(Predicate::True),
        _ => Predicate::And(consumed),
    }
}

fn with_filter(plan: &QueryPlan, filter: Predicate) -> QueryPlan {
    match plan {
        QueryPlan::IndexScan { index, prefix, lower, upper, covering, .. } => QueryPlan::IndexScan {
            index: index.clone(),
            prefix: prefix.clone(),
            lower: lower.clone(),
            upper: upper.clone(),
            filter,
            covering: *covering,
        },
        other => other.clone(),
    }
}

/// Union is viable when every disjunct has an equality-only index match;
/// each child keeps its disjunct as filter.
fn union_children(inputs: &PlannerInputs<'_>, terms: &[Predicate]) -> Option<Vec<QueryPlan>> {
    let mut children = Vec::with_capacity(terms.len());
    for term in terms {
        let conjuncts: Vec<&Predicate> = match term {
            Predicate::And(c) => c.iter().collect(),
            leaf => vec![leaf],
        };
        let mut matched = None;
        for index in readable_scan_indexes(inputs) {
            if let Some(QueryPlan::IndexScan { index: name, prefix, lower: None, upper: None, covering, .. }) =
                match_index(inputs, index, &conjuncts, term)
            {
                if !prefix.is_empty() {
                    matched =
                        Some(QueryPlan::IndexScan { index: name, prefix, lower: None, upper: None, filter: term.clone(), covering });
                    break;
                }
            }
        }
        children.push(matched?);
    }
    Some(children)
}

// ---------------------------------------------------------------------------
// Cost model
// ---------------------------------------------------------------------------

fn cost_of(inputs: &PlannerInputs<'_>, plan: &QueryPlan) -> (f64, f64) {
    let n = inputs.rows();
    match plan {
        QueryPlan::FullScan { filter } => {
            let sel = estimate(inputs, filter);
            let io = n;
            let cpu = n * (COST_DESERIALIZE + COST_FILTER);
            (io + CPU_WEIGHT * cpu, n * sel)
        }
        QueryPlan::IndexScan { index, filter, covering, .. } => {
            // The filter subsumes the index-consumed leaves, so its estimate
            // is already indexSel·residualSel; the consumed selectivity is
            // kept as a floor for the fetch volume
            let index_sel = index_selectivity(inputs, plan, index);
            let rows = n * estimate(inputs, filter).min(index_sel);
            let io = if *covering { rows } else { 2.0 * rows };
            let cpu = rows * (COST_DESERIALIZE + COST_FILTER);
            (io + CPU_WEIGHT * cpu, rows)
        }
        QueryPlan::Intersection { children, .. } => {
            let mut io = 0.0;
            let mut min_rows = f64::INFINITY;
            let mut product_sel = 1.0;
            for child in children {
                let (child_cost, child_rows) = cost_of(inputs, child);
                io += child_cost;
                min_rows = min_rows.min(child_rows);
                if let QueryPlan::IndexScan { filter, .. } = child {
                    product_sel *= estimate(inputs, filter);
                }
            }
            let cpu = min_rows * COST_FILTER * children.len() as f64;
            let rows = n * product_sel;
            (io + CPU_WEIGHT * cpu, rows)
        }
        QueryPlan::Union { children } => {
            let mut cost = 0.0;
            let mut rows = 0.0;
            for child in children {
                let (child_cost, child_rows) = cost_of(inputs, child);
                cost += child_cost;
                rows += child_rows;
            }
            (cost, rows * UNION_DEDUP_FACTOR)
        }
        QueryPlan::Limit { child, limit } => {
            let (child_cost, child_rows) = cost_of(inputs, child);
            let scale = (*limit as f64 / child_rows.max(1.0)).min(1.0);
            (child_cost * scale, child_rows.min(*limit as f64))
        }
    }
}

/// Selectivity of the index-consumed portion of an index-scan plan.
fn index_selectivity(inputs: &PlannerInputs<'_>, plan: &QueryPlan, index_name: &str) -> f64 {
    let QueryPlan::IndexScan { prefix, lower, upper, filter, .. } = plan else { return 1.0 };

    // Interval scan: the overlap leaf in the filter carries the window
    if let Some(def) = inputs.schema.index(index_name) {
        if def.is_interval() {
            if let Some(stats) = inputs.interval_stats.get(index_name) {
                if let Some(width) = overlap_width(filter) {
                    return stats.selectivity_overlap(width);
                }
            }
            return DEFAULT_CMP_SELECTIVITY;
        }
    }

    let stats = inputs.value_stats.get(index_name);
    let mut sel = 1.0;
    for (i, value) in prefix.iter().enumerate() {
        sel *= match (i, stats) {
            // The histogram only describes the leading column
            (0, Some(s)) => s.selectivity_eq(value),
            _ => DEFAULT_EQ_SELECTIVITY,
        };
    }
    if lower.is_some() || upper.is_some() {
        sel *= match (prefix.is_empty(), stats) {
            (true, Some(s)) => s.selectivity_range(lower.as_ref().map(|(v, _)| v), upper.as_ref().map(|(v, _)| v)),
            _ => DEFAULT_CMP_SELECTIVITY,
        };
    }
    sel.clamp(0.0, 1.0)
}

fn overlap_width(filter: &Predicate) -> Option<f64> {
    match filter {
        Predicate::Overlaps { from, to, .. } => {
            let from = from.as_ref()?.as_f64()?;
            let to = to.as_ref()?.as_f64()?;
            Some((to - from).max(0.0))
        }
        Predicate::And(children) => children.iter().find_map(overlap_width),
        _ => None,
    }
}

/// Statistics-driven selectivity of an arbitrary predicate, with the fixed
/// heuristics when no statistics apply.
pub fn estimate(inputs: &PlannerInputs<'_>, predicate: &Predicate) -> f64 {
    match predicate {
        Predicate::True => 1.0,
        Predicate::And(children) => children.iter().map(|c| estimate(inputs, c)).fold(1.0, and_selectivity),
        Predicate::Or(children) => children.iter().map(|c| estimate(inputs, c)).fold(0.0, or_selectivity),
        Predicate::Not(child) => not_selectivity(estimate(inputs, child)),
        Predicate::Compare { field, op, value } => {
            let stats = leading_column_stats(inputs, field);
            match op {
                CompareOp::Eq => stats.map(|s| s.selectivity_eq(value)).unwrap_or(DEFAULT_EQ_SELECTIVITY),
                CompareOp::Ne => stats.map(|s| not_selectivity(s.selectivity_eq(value))).unwrap_or(DEFAULT_NE_SELECTIVITY),
                CompareOp::Lt | CompareOp::Le => {
                    stats.map(|s| s.selectivity_range(None, Some(value))).unwrap_or(DEFAULT_CMP_SELECTIVITY)
                }
                CompareOp::Gt | CompareOp::Ge => {
                    stats.map(|s| s.selectivity_range(Some(value), None)).unwrap_or(DEFAULT_CMP_SELECTIVITY)
                }
                CompareOp::StartsWith => DEFAULT_STARTS_WITH_SELECTIVITY,
                CompareOp::Contains => DEFAULT_CONTAINS_SELECTIVITY,
            }
        }
        Predicate::Overlaps { field, from, to } => {
            for index in inputs.schema.indexes_for(inputs.record_type) {
                if index.is_interval() && index.root.referenced_fields().first() == Some(&field.as_str()) {
                    if let Some(stats) = inputs.interval_stats.get(&index.name) {
                        let width = match (from.as_ref().and_then(|v| v.as_f64()), to.as_ref().and_then(|v| v.as_f64())) {
                            (Some(a), Some(b)) => (b - a).max(0.0),
                            _ => stats.avg_width,
                        };
                        return stats.selectivity_overlap(width);
                    }
                }
            }
            DEFAULT_CMP_SELECTIVITY
        }
    }
}

/// Histogram of any readable index whose leading column is this field.
fn leading_column_stats<'a>(inputs: &'a PlannerInputs<'_>, field: &str) -> Option<&'a ValueStats> {
    for index in inputs.schema.indexes_for(inputs.record_type) {
        if let Some(columns) = index.root.flat_columns() {
            if let Some(Column::Field(first)) = columns.first() {
                if *first == field {
                    if let Some(stats) = inputs.value_stats.get(&index.name) {
                        return Some(stats);
                    }
                }
            }
        }
    }
    None
}

fn fnv1a(s: &str) -> u64 {
    let mut hash = 0xcbf29ce484222325u64;
    for b in s.bytes() {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}
