//! Predicate canonicalization.
//!
//! Three passes: push negation to the leaves (De Morgan plus double-negation
//! elimination, inverting comparison operators where an inverse exists),
//! flatten associative and/or chains, then distribute and-over-or toward
//! disjunctive normal form under a hard term cap. Blowing the cap keeps the
//! partially normalized tree — the planner treats nested ors under an and as
//! filter-only, so correctness never depends on full DNF.

use super::predicate::{CompareOp, Predicate};

/// Max conjunctive terms produced by distribution.
pub const MAX_DNF_TERMS: usize = 32;

pub fn normalize(predicate: &Predicate) -> Predicate {
    let pushed = push_not(predicate, false);
    let flat = flatten(pushed);
    dnf(flat)
}

/// Canonical, allocation-stable cache key: children are sorted by their own
/// canonical form, so structurally equal predicates share a key regardless
/// of construction order.
pub fn cache_key(predicate: &Predicate) -> String {
    let normalized = normalize(predicate);
    canonical(&normalized)
}

fn canonical(p: &Predicate) -> String {
    match p {
        Predicate::True => "true".to_string(),
        Predicate::Compare { field, op, value } => format!("cmp({},{:?},{})", field, op, value),
        Predicate::Overlaps { field, from, to } => format!(
            "overlaps({},{},{})",
            field,
            from.as_ref().map(|v| v.to_string()).unwrap_or_else(|| "-".into()),
            to.as_ref().map(|v| v.to_string()).unwrap_or_else(|| "-".into()),
        ),
        Predicate::Not(child) => format!("not({})", canonical(child)),
        Predicate::And(children) => {
            let mut parts: Vec<String> = children.iter().map(canonical).collect();
            parts.sort();
            format!("and({})", parts.join(","))
        }
        Predicate::Or(children) => {
            let mut parts: Vec<String> = children.iter().map(canonical).collect();
            parts.sort();
            format!("or({})", parts.join(","))
        }
    }
}

fn push_not(p: &Predicate, negated: bool) -> Predicate {
    match p {
        Predicate::Not(child) => push_not(child, !negated),
        Predicate::And(children) => {
            let pushed = children.iter().map(|c| push_not(c, negated)).collect();
            if negated {
                Predicate::Or(pushed)
            } else {
                Predicate::And(pushed)
            }
        }
        Predicate::Or(children) => {
            let pushed = children.iter().map(|c| push_not(c, negated)).collect();
            if negated {
                Predicate::And(pushed)
            } else {
                Predicate::Or(pushed)
            }
        }
        Predicate::True => {
            if negated {
                // An empty or matches nothing
                Predicate::Or(Vec::new())
            } else {
                Predicate::True
            }
        }
        Predicate::Compare { field, op, value } => {
            if !negated {
                return p.clone();
            }
            match invert(*op) {
                Some(inverse) => Predicate::Compare { field: field.clone(), op: inverse, value: value.clone() },
                None => Predicate::Not(Box::new(p.clone())),
            }
        }
        Predicate::Overlaps { .. } => {
            if negated {
                Predicate::Not(Box::new(p.clone()))
            } else {
                p.clone()
            }
        }
    }
}

fn invert(op: CompareOp) -> Option<CompareOp> {
    match op {
        CompareOp::Eq => Some(CompareOp::Ne),
        CompareOp::Ne => Some(CompareOp::Eq),
        CompareOp::Lt => Some(CompareOp::Ge),
        CompareOp::Ge => Some(CompareOp::Lt),
        CompareOp::Gt => Some(CompareOp::Le),
        CompareOp::Le => Some(CompareOp::Gt),
        // Prefix and containment have no single-operator negation
        CompareOp::StartsWith | CompareOp::Contains => None,
    }
}

fn flatten(p: Predicate) -> Predicate {
    match p {
        Predicate::And(children) => {
            let mut flat = Vec::new();
            for child in children.into_iter().map(flatten) {
                match child {
                    Predicate::And(grand) => flat.extend(grand),
                    Predicate::True => {}
                    other => flat.push(other),
                }
            }
            match flat.len() {
                0 => Predicate::True,
                1 => flat.into_iter().next().unwrap_or(Predicate::True),
                _ => Predicate::And(flat),
            }
        }
        Predicate::Or(children) => {
            let mut flat = Vec::new();
            for child in children.into_iter().map(flatten) {
                match child {
                    Predicate::Or(grand) => flat.extend(grand),
                    Predicate::True => return Predicate::True,
                    other => flat.push(other),
                }
            }
            match flat.len() {
                1 => flat.into_iter().next().unwrap_or(Predicate::True),
                _ => Predicate::Or(flat),
            }
        }
        Predicate::Not(child) => Predicate::Not(Box::new(flatten(*child))),
        leaf => leaf,
    }
}

/// Distribute and-over-or while the number of conjunctive terms stays under
/// [`MAX_DNF_TERMS`]; otherwise return the input unchanged.
fn dnf(p: Predicate) -> Predicate {
    match terms_of(&p, MAX_DNF_TERMS) {
        Some(terms) if terms.len() > 1 => {
            Predicate::Or(terms.into_iter().map(|conj| flatten(Predicate::And(conj))).collect())
        }
        _ => p,
    }
}

/// The list of conjunctive terms this predicate distributes into, or None
/// past the cap.
fn terms_of(p: &Predicate, cap: usize) -> Option<Vec<Vec<Predicate>>> {
    match p {
        Predicate::Or(children) => {
            let mut terms = Vec::new();
            for child in children {
                let child_terms = terms_of(child, cap)?;
                terms.extend(child_terms);
                if terms.len() > cap {
                    return None;
                }
            }
            Some(terms)
        }
        Predicate::And(children) => {
            let mut terms: Vec<Vec<Predicate>> = vec![Vec::new()];
            for child in children {
                let child_terms = terms_of(child, cap)?;
                let mut next = Vec::with_capacity(terms.len() * child_terms.len());
                for prefix in &terms {
                    for suffix in &child_terms {
                        let mut merged = prefix.clone();
                        merged.extend(suffix.iter().cloned());
                        next.push(merged);
                    }
                }
                if next.len() > cap {
                    return None;
                }
                terms = next;
            }
            Some(terms)
        }
        leaf => Some(vec![vec![leaf.clone()]]),
    }
}
