//! Symbolic integer scalars with a range-aware canonicalizing simplifier.
//!
//! Extents and loop indices are modeled as a small immutable expression DAG.
//! The simplifier rewrites division and modulo against known value ranges
//! (every [`ScalarExpr::Var`] satisfies `0 <= v < extent`), which is enough to
//! prove the index identities produced by split/merge chains:
//!
//! ```text
//! (a * c + b) / c  ->  a        when 0 <= b < c
//! (a * c + b) % c  ->  b        when 0 <= b < c
//! ```
//!
//! Equality of canonical forms is a sound but incomplete equivalence test;
//! callers treat "cannot prove" as "not equal".

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_VAR_ID: AtomicU64 = AtomicU64::new(0);

/// A symbolic or concrete extent of an iteration domain.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Extent {
    Const(i64),
    Symbolic(Arc<ScalarExpr>),
}

impl Extent {
    pub fn as_const(&self) -> Option<i64> {
        match self {
            Extent::Const(c) => Some(*c),
            Extent::Symbolic(e) => e.as_const(),
        }
    }

    pub fn is_one(&self) -> bool {
        self.as_const() == Some(1)
    }

    pub fn to_scalar(&self) -> Arc<ScalarExpr> {
        match self {
            Extent::Const(c) => ScalarExpr::constant(*c),
            Extent::Symbolic(e) => e.clone(),
        }
    }

    pub fn mul(&self, other: &Extent) -> Extent {
        match (self.as_const(), other.as_const()) {
            (Some(a), Some(b)) => Extent::Const(a * b),
            _ => Extent::Symbolic(simplify(&ScalarExpr::mul(
                self.to_scalar(),
                other.to_scalar(),
            ))),
        }
    }

    /// `ceil(self / other)`, the extent of a split's quotient side.
    pub fn ceil_div(&self, other: &Extent) -> Extent {
        match (self.as_const(), other.as_const()) {
            (Some(a), Some(b)) if b > 0 => Extent::Const((a + b - 1) / b),
            _ => {
                let numer = ScalarExpr::add(
                    self.to_scalar(),
                    ScalarExpr::add(other.to_scalar(), ScalarExpr::constant(-1)),
                );
                Extent::Symbolic(simplify(&ScalarExpr::div(numer, other.to_scalar())))
            }
        }
    }

    pub fn add_const(&self, delta: i64) -> Extent {
        match self.as_const() {
            Some(a) => Extent::Const(a + delta),
            None => Extent::Symbolic(simplify(&ScalarExpr::add(
                self.to_scalar(),
                ScalarExpr::constant(delta),
            ))),
        }
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Extent::Const(c) => write!(f, "{c}"),
            Extent::Symbolic(e) => write!(f, "{e}"),
        }
    }
}

/// Integer expression node. `Add` and `Mul` are kept flattened and sorted by
/// the simplifier so canonical forms compare structurally.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ScalarExpr {
    Const(i64),
    /// A fresh bounded variable: `0 <= v < extent`.
    Var { id: u64, extent: Extent },
    Add(Vec<Arc<ScalarExpr>>),
    Mul(Vec<Arc<ScalarExpr>>),
    Div(Arc<ScalarExpr>, Arc<ScalarExpr>),
    Mod(Arc<ScalarExpr>, Arc<ScalarExpr>),
}

impl ScalarExpr {
    pub fn constant(v: i64) -> Arc<Self> {
        Arc::new(ScalarExpr::Const(v))
    }

    /// Fresh variable ranging over `[0, extent)`.
    pub fn var(extent: Extent) -> Arc<Self> {
        let id = NEXT_VAR_ID.fetch_add(1, Ordering::Relaxed);
        Arc::new(ScalarExpr::Var { id, extent })
    }

    pub fn add(lhs: Arc<Self>, rhs: Arc<Self>) -> Arc<Self> {
        Arc::new(ScalarExpr::Add(vec![lhs, rhs]))
    }

    pub fn mul(lhs: Arc<Self>, rhs: Arc<Self>) -> Arc<Self> {
        Arc::new(ScalarExpr::Mul(vec![lhs, rhs]))
    }

    pub fn div(lhs: Arc<Self>, rhs: Arc<Self>) -> Arc<Self> {
        Arc::new(ScalarExpr::Div(lhs, rhs))
    }

    pub fn modulo(lhs: Arc<Self>, rhs: Arc<Self>) -> Arc<Self> {
        Arc::new(ScalarExpr::Mod(lhs, rhs))
    }

    pub fn as_const(&self) -> Option<i64> {
        match self {
            ScalarExpr::Const(c) => Some(*c),
            _ => None,
        }
    }

    pub fn var_id(&self) -> Option<u64> {
        match self {
            ScalarExpr::Var { id, .. } => Some(*id),
            _ => None,
        }
    }
}

impl fmt::Display for ScalarExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarExpr::Const(c) => write!(f, "{c}"),
            ScalarExpr::Var { id, .. } => write!(f, "v{id}"),
            ScalarExpr::Add(terms) => {
                write!(f, "(")?;
                for (i, t) in terms.iter().enumerate() {
                    if i > 0 {
                        write!(f, " + ")?;
                    }
                    write!(f, "{t}")?;
                }
                write!(f, ")")
            }
            ScalarExpr::Mul(factors) => {
                write!(f, "(")?;
                for (i, t) in factors.iter().enumerate() {
                    if i > 0 {
                        write!(f, " * ")?;
                    }
                    write!(f, "{t}")?;
                }
                write!(f, ")")
            }
            ScalarExpr::Div(a, b) => write!(f, "({a} / {b})"),
            ScalarExpr::Mod(a, b) => write!(f, "({a} % {b})"),
        }
    }
}

/// Inclusive value bounds; `None` means unbounded in that direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    pub min: Option<i64>,
    pub max: Option<i64>,
}

impl Bounds {
    const UNKNOWN: Bounds = Bounds { min: None, max: None };

    fn nonneg(&self) -> bool {
        matches!(self.min, Some(m) if m >= 0)
    }
}

/// Best-effort bounds for an expression, from variable ranges.
pub fn bounds_of(expr: &ScalarExpr) -> Bounds {
    match expr {
        ScalarExpr::Const(c) => Bounds { min: Some(*c), max: Some(*c) },
        ScalarExpr::Var { extent, .. } => Bounds {
            min: Some(0),
            max: extent.as_const().map(|e| e - 1),
        },
        ScalarExpr::Add(terms) => {
            let mut min = Some(0i64);
            let mut max = Some(0i64);
            for t in terms {
                let b = bounds_of(t);
                min = min.zip(b.min).and_then(|(a, b)| a.checked_add(b));
                max = max.zip(b.max).and_then(|(a, b)| a.checked_add(b));
            }
            Bounds { min, max }
        }
        ScalarExpr::Mul(factors) => {
            // Only reason about products of provably non-negative factors.
            let mut min = Some(1i64);
            let mut max = Some(1i64);
            for fac in factors {
                let b = bounds_of(fac);
                if !b.nonneg() {
                    return Bounds::UNKNOWN;
                }
                min = min.zip(b.min).and_then(|(a, b)| a.checked_mul(b));
                max = max.zip(b.max).and_then(|(a, b)| a.checked_mul(b));
            }
            Bounds { min, max }
        }
        ScalarExpr::Div(a, b) => {
            let (ba, bb) = (bounds_of(a), bounds_of(b));
            match (ba.min, bb.min) {
                (Some(amin), Some(d)) if amin >= 0 && d > 0 && bb.max == Some(d) => Bounds {
                    min: Some(amin / d),
                    max: ba.max.map(|m| m / d),
                },
                _ => Bounds::UNKNOWN,
            }
        }
        ScalarExpr::Mod(a, b) => {
            let (ba, bb) = (bounds_of(a), bounds_of(b));
            match (ba.min, bb.min) {
                (Some(amin), Some(d)) if amin >= 0 && d > 0 && bb.max == Some(d) => Bounds {
                    min: Some(0),
                    max: Some(ba.max.map_or(d - 1, |m| m.min(d - 1))),
                },
                _ => Bounds::UNKNOWN,
            }
        }
    }
}

/// True when `0 <= expr < divisor` is provable.
fn fits_below(expr: &Arc<ScalarExpr>, divisor: &Arc<ScalarExpr>) -> bool {
    let b = bounds_of(expr);
    if !b.nonneg() {
        return false;
    }
    if let (Some(max), Some(d)) = (b.max, divisor.as_const()) {
        if max < d {
            return true;
        }
    }
    // Symbolic divisor: a variable bounded by exactly this expression, or a
    // modulo against it, is in range by construction.
    match expr.as_ref() {
        ScalarExpr::Var { extent, .. } => &extent.to_scalar() == divisor,
        ScalarExpr::Mod(_, m) => m == divisor,
        _ => false,
    }
}

/// If `term` is a provable multiple of `divisor`, return the quotient.
fn quotient_of(term: &Arc<ScalarExpr>, divisor: &Arc<ScalarExpr>) -> Option<Arc<ScalarExpr>> {
    if term == divisor {
        return Some(ScalarExpr::constant(1));
    }
    if let (Some(c), Some(d)) = (term.as_const(), divisor.as_const()) {
        if d != 0 && c % d == 0 {
            return Some(ScalarExpr::constant(c / d));
        }
    }
    if let ScalarExpr::Mul(factors) = term.as_ref() {
        // A structurally equal factor divides out directly.
        if let Some(pos) = factors.iter().position(|f| f == divisor) {
            let mut rest: Vec<_> = factors.clone();
            rest.remove(pos);
            return Some(simplify(&Arc::new(ScalarExpr::Mul(rest))));
        }
        // Otherwise a constant factor divisible by a constant divisor.
        if let Some(d) = divisor.as_const() {
            if d != 0 {
                if let Some(pos) =
                    factors.iter().position(|f| f.as_const().is_some_and(|c| c % d == 0))
                {
                    let c = factors[pos].as_const().unwrap_or(0);
                    let mut rest: Vec<_> = factors.clone();
                    rest[pos] = ScalarExpr::constant(c / d);
                    return Some(simplify(&Arc::new(ScalarExpr::Mul(rest))));
                }
            }
        }
    }
    None
}

/// Find a `x % c` term together with a `c * (x / c)` term and fuse the pair
/// back into `x`. Returns the rewritten term list on the first hit.
fn reconstruct_div_mod(terms: &[Arc<ScalarExpr>]) -> Option<Vec<Arc<ScalarExpr>>> {
    let is_scaled_quotient =
        |t: &Arc<ScalarExpr>, x: &Arc<ScalarExpr>, c: &Arc<ScalarExpr>| match t.as_ref() {
            ScalarExpr::Mul(fs) if fs.len() == 2 => {
                let div_matches = |f: &Arc<ScalarExpr>| {
                    matches!(f.as_ref(), ScalarExpr::Div(dx, dc) if dx == x && dc == c)
                };
                (&fs[0] == c && div_matches(&fs[1])) || (&fs[1] == c && div_matches(&fs[0]))
            }
            _ => false,
        };

    for (i, t) in terms.iter().enumerate() {
        if let ScalarExpr::Mod(x, c) = t.as_ref() {
            for (j, u) in terms.iter().enumerate() {
                if i != j && is_scaled_quotient(u, x, c) {
                    let mut rewritten: Vec<Arc<ScalarExpr>> = Vec::with_capacity(terms.len() - 1);
                    for (k, term) in terms.iter().enumerate() {
                        if k == i {
                            rewritten.push(x.clone());
                        } else if k != j {
                            rewritten.push(term.clone());
                        }
                    }
                    return Some(rewritten);
                }
            }
        }
    }
    None
}

fn addends(expr: &Arc<ScalarExpr>) -> Vec<Arc<ScalarExpr>> {
    match expr.as_ref() {
        ScalarExpr::Add(terms) => terms.clone(),
        _ => vec![expr.clone()],
    }
}

fn sum_of(mut terms: Vec<Arc<ScalarExpr>>) -> Arc<ScalarExpr> {
    match terms.len() {
        0 => ScalarExpr::constant(0),
        1 => terms.pop().unwrap_or_else(|| ScalarExpr::constant(0)),
        _ => simplify(&Arc::new(ScalarExpr::Add(terms))),
    }
}

/// Canonicalize an expression. Idempotent; structural equality of results is
/// the equivalence test used by [`prove_equal`].
pub fn simplify(expr: &Arc<ScalarExpr>) -> Arc<ScalarExpr> {
    match expr.as_ref() {
        ScalarExpr::Const(_) | ScalarExpr::Var { .. } => expr.clone(),
        ScalarExpr::Add(terms) => {
            let mut flat: Vec<Arc<ScalarExpr>> = Vec::with_capacity(terms.len());
            let mut acc = 0i64;
            let mut stack: Vec<Arc<ScalarExpr>> = terms.iter().map(|t| simplify(t)).collect();
            stack.reverse();
            while let Some(t) = stack.pop() {
                match t.as_ref() {
                    ScalarExpr::Add(inner) => {
                        stack.extend(inner.iter().cloned());
                    }
                    ScalarExpr::Const(c) => acc += c,
                    _ => flat.push(t),
                }
            }
            if acc != 0 {
                flat.push(ScalarExpr::constant(acc));
            }
            // c * (x / c) + x % c reconstructs x.
            if let Some(flat) = reconstruct_div_mod(&flat) {
                return simplify(&Arc::new(ScalarExpr::Add(flat)));
            }
            flat.sort();
            match flat.len() {
                0 => ScalarExpr::constant(0),
                1 => flat.swap_remove(0),
                _ => Arc::new(ScalarExpr::Add(flat)),
            }
        }
        ScalarExpr::Mul(factors) => {
            let mut flat: Vec<Arc<ScalarExpr>> = Vec::with_capacity(factors.len());
            let mut acc = 1i64;
            let mut stack: Vec<Arc<ScalarExpr>> = factors.iter().map(|t| simplify(t)).collect();
            stack.reverse();
            while let Some(t) = stack.pop() {
                match t.as_ref() {
                    ScalarExpr::Mul(inner) => {
                        stack.extend(inner.iter().cloned());
                    }
                    ScalarExpr::Const(c) => acc *= c,
                    _ => flat.push(t),
                }
            }
            if acc == 0 {
                return ScalarExpr::constant(0);
            }
            if acc != 1 {
                flat.push(ScalarExpr::constant(acc));
            }
            flat.sort();
            match flat.len() {
                0 => ScalarExpr::constant(1),
                1 => flat.swap_remove(0),
                _ => Arc::new(ScalarExpr::Mul(flat)),
            }
        }
        ScalarExpr::Div(a, b) => {
            let a = simplify(a);
            let b = simplify(b);
            if b.as_const() == Some(1) {
                return a;
            }
            if let (Some(x), Some(y)) = (a.as_const(), b.as_const()) {
                if y != 0 {
                    return ScalarExpr::constant(x / y);
                }
            }
            if fits_below(&a, &b) {
                return ScalarExpr::constant(0);
            }
            // Nested divisions of a non-negative value collapse:
            // (x / c) / b == x / (c * b).
            if let ScalarExpr::Div(x, c) = a.as_ref() {
                if bounds_of(x).nonneg() {
                    let combined = simplify(&ScalarExpr::mul(c.clone(), b.clone()));
                    return simplify(&Arc::new(ScalarExpr::Div(x.clone(), combined)));
                }
            }
            // Peel off addends that are exact multiples of the divisor.
            let mut quotients = Vec::new();
            let mut rest = Vec::new();
            for term in addends(&a) {
                match quotient_of(&term, &b) {
                    Some(q) => quotients.push(q),
                    None => rest.push(term),
                }
            }
            if !quotients.is_empty() {
                let rest_sum = sum_of(rest);
                if rest_sum.as_const() == Some(0) || fits_below(&rest_sum, &b) {
                    return sum_of(quotients);
                }
            }
            Arc::new(ScalarExpr::Div(a, b))
        }
        ScalarExpr::Mod(a, b) => {
            let a = simplify(a);
            let b = simplify(b);
            if b.as_const() == Some(1) {
                return ScalarExpr::constant(0);
            }
            if let (Some(x), Some(y)) = (a.as_const(), b.as_const()) {
                if y != 0 {
                    return ScalarExpr::constant(x % y);
                }
            }
            if fits_below(&a, &b) {
                return a;
            }
            // Exact multiples of the divisor vanish under the modulo.
            let rest: Vec<_> = addends(&a)
                .into_iter()
                .filter(|t| quotient_of(t, &b).is_none())
                .collect();
            let rest_sum = sum_of(rest);
            if bounds_of(&rest_sum).nonneg() {
                if fits_below(&rest_sum, &b) {
                    return rest_sum;
                }
                if rest_sum != a {
                    return Arc::new(ScalarExpr::Mod(rest_sum, b));
                }
            }
            Arc::new(ScalarExpr::Mod(a, b))
        }
    }
}

/// Replace variables by id. Unmapped variables are kept.
pub fn substitute(
    expr: &Arc<ScalarExpr>,
    map: &HashMap<u64, Arc<ScalarExpr>>,
) -> Arc<ScalarExpr> {
    match expr.as_ref() {
        ScalarExpr::Const(_) => expr.clone(),
        ScalarExpr::Var { id, .. } => map.get(id).cloned().unwrap_or_else(|| expr.clone()),
        ScalarExpr::Add(terms) => Arc::new(ScalarExpr::Add(
            terms.iter().map(|t| substitute(t, map)).collect(),
        )),
        ScalarExpr::Mul(factors) => Arc::new(ScalarExpr::Mul(
            factors.iter().map(|t| substitute(t, map)).collect(),
        )),
        ScalarExpr::Div(a, b) => {
            Arc::new(ScalarExpr::Div(substitute(a, map), substitute(b, map)))
        }
        ScalarExpr::Mod(a, b) => {
            Arc::new(ScalarExpr::Mod(substitute(a, map), substitute(b, map)))
        }
    }
}

/// Sound, incomplete equality: both sides reach the same canonical form.
pub fn prove_equal(lhs: &Arc<ScalarExpr>, rhs: &Arc<ScalarExpr>) -> bool {
    simplify(lhs) == simplify(rhs)
}
