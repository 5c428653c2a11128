// symbolic.rs — Composition, simplification and range analysis of index maps
//
// `SymbolicContext` is the shared symbolic engine used by index derivation.
// It keeps no caches; its only state is a pair of counters that tests use to
// observe whether exact analysis ran at all.
//
// Simplification rewrites every expression into a linear normal form
// (`Σ coeff·atom + constant`, atoms being dims, symbols and irreducible
// `floordiv`/`mod` terms) and reads it back in canonical order: dims, then
// symbols, then div/mod terms, constant last.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::hlo::ArrayShape;
use crate::indexing::{cst, dim, sym, AffineExpr, IndexingMap, Interval};

const UNBOUNDED: Interval = Interval {
    lo: i64::MIN,
    hi: i64::MAX,
};

#[derive(Debug, Default)]
pub struct SymbolicContext {
    compositions: AtomicUsize,
    simplifications: AtomicUsize,
}

impl SymbolicContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `compose` calls served so far.
    pub fn compositions(&self) -> usize {
        self.compositions.load(Ordering::Relaxed)
    }

    /// Number of `simplify` calls served so far.
    pub fn simplifications(&self) -> usize {
        self.simplifications.load(Ordering::Relaxed)
    }

    /// `second ∘ first`: feed `first`'s results into `second`'s dimensions.
    ///
    /// The result keeps `first`'s dimensions; `second`'s symbols are appended
    /// after `first`'s. Where a result of `first` can leave the bounds of the
    /// `second` dimension it feeds, that bound becomes a constraint. Returns
    /// `None` when the result count of `first` does not match the dimension
    /// count of `second`.
    pub fn compose(&self, first: &IndexingMap, second: &IndexingMap) -> Option<IndexingMap> {
        if first.results.len() != second.num_dims() {
            return None;
        }
        self.compositions.fetch_add(1, Ordering::Relaxed);

        let offset = first.num_symbols();
        let shifted: Vec<AffineExpr> = (0..second.num_symbols()).map(|i| sym(i + offset)).collect();
        let substitute = |e: &AffineExpr| e.replace(&first.results, &shifted);

        let mut symbols = first.symbols.clone();
        symbols.extend(second.symbols.iter().copied());
        let mut constraints = first.constraints.clone();
        constraints.extend(second.constraints.iter().map(|(e, b)| (substitute(e), *b)));
        for (result, bounds) in first.results.iter().zip(&second.dims) {
            if !bounds.contains_interval(&expr_range(result, first)) {
                constraints.push((result.clone(), *bounds));
            }
        }

        let composed = IndexingMap {
            dims: first.dims.clone(),
            symbols,
            results: second.results.iter().map(substitute).collect(),
            constraints,
        };
        Some(self.simplify(&composed))
    }

    /// Simplify every result and constraint; drop constraints that hold for
    /// the whole domain.
    pub fn simplify(&self, map: &IndexingMap) -> IndexingMap {
        self.simplifications.fetch_add(1, Ordering::Relaxed);
        let results = map.results.iter().map(|r| simplify_expr(r, map)).collect();
        let mut constraints: Vec<(AffineExpr, Interval)> = Vec::new();
        for (expr, bounds) in &map.constraints {
            let expr = simplify_expr(expr, map);
            if bounds.contains_interval(&expr_range(&expr, map)) {
                continue;
            }
            if !constraints.iter().any(|(e, b)| *e == expr && b == bounds) {
                constraints.push((expr, *bounds));
            }
        }
        IndexingMap {
            dims: map.dims.clone(),
            symbols: map.symbols.clone(),
            results,
            constraints,
        }
    }

    /// Simplify a single expression over `map`'s domain.
    pub fn simplify_expr(&self, expr: &AffineExpr, map: &IndexingMap) -> AffineExpr {
        simplify_expr(expr, map)
    }

    /// Conservative value range of `expr` over `map`'s domain.
    pub fn range(&self, expr: &AffineExpr, map: &IndexingMap) -> Interval {
        expr_range(expr, map)
    }

    /// Turn a map producing logical indices of `shape` into a single-result
    /// map producing the physical element offset.
    pub fn linearize(&self, map: &IndexingMap, shape: &ArrayShape) -> Option<IndexingMap> {
        if map.results.len() != shape.rank() {
            return None;
        }
        let offset = linear_offset(&map.results, &shape.physical_strides());
        let linear = IndexingMap {
            results: vec![offset],
            ..map.clone()
        };
        Some(self.simplify(&linear))
    }
}

/// `Σ indices[i] · strides[i]`.
pub fn linear_offset(indices: &[AffineExpr], strides: &[i64]) -> AffineExpr {
    indices
        .iter()
        .zip(strides)
        .filter(|(_, &stride)| stride != 0)
        .fold(cst(0), |acc, (index, &stride)| acc + index.clone() * stride)
}

/// Split a linear index into one index per dimension. `order` lists the
/// dimensions fastest-varying first; the slowest dimension is not wrapped.
pub fn delinearize(linear: &AffineExpr, sizes: &[i64], order: &[usize]) -> Vec<AffineExpr> {
    let mut indices = vec![cst(0); sizes.len()];
    let mut stride = 1;
    for (pos, &d) in order.iter().enumerate() {
        let mut index = linear.clone();
        if stride != 1 {
            index = index.floordiv(stride);
        }
        if pos + 1 < order.len() {
            index = index.modulo(sizes[d]);
        }
        indices[d] = index;
        stride *= sizes[d];
    }
    indices
}

/// Row-major strides of a logical shape.
pub fn row_major_strides(sizes: &[i64]) -> Vec<i64> {
    let mut strides = vec![1; sizes.len()];
    for i in (0..sizes.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * sizes[i + 1];
    }
    strides
}

// ── Range analysis ──────────────────────────────────────────────────────────

fn expr_range(expr: &AffineExpr, map: &IndexingMap) -> Interval {
    match expr {
        AffineExpr::Dim(i) => map.dims.get(*i).copied().unwrap_or(UNBOUNDED),
        AffineExpr::Symbol(i) => map.symbols.get(*i).map(|s| s.bounds).unwrap_or(UNBOUNDED),
        AffineExpr::Constant(c) => Interval::point(*c),
        AffineExpr::Add(a, b) => {
            let (a, b) = (expr_range(a, map), expr_range(b, map));
            Interval::new(a.lo.saturating_add(b.lo), a.hi.saturating_add(b.hi))
        }
        AffineExpr::Mul(a, c) => scale(expr_range(a, map), *c),
        AffineExpr::FloorDiv(a, c) if *c > 0 => {
            let r = expr_range(a, map);
            Interval::new(r.lo.div_euclid(*c), r.hi.div_euclid(*c))
        }
        AffineExpr::Mod(a, c) if *c > 0 => {
            let r = expr_range(a, map);
            if r.lo.div_euclid(*c) == r.hi.div_euclid(*c) {
                Interval::new(r.lo.rem_euclid(*c), r.hi.rem_euclid(*c))
            } else {
                Interval::new(0, c - 1)
            }
        }
        AffineExpr::FloorDiv(..) | AffineExpr::Mod(..) => UNBOUNDED,
    }
}

fn scale(r: Interval, c: i64) -> Interval {
    let (a, b) = (r.lo.saturating_mul(c), r.hi.saturating_mul(c));
    Interval::new(a.min(b), a.max(b))
}

// ── Linear normal form ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Atom {
    Dim(usize),
    Symbol(usize),
    FloorDiv(AffineExpr, i64),
    Mod(AffineExpr, i64),
}

impl Atom {
    fn to_expr(&self) -> AffineExpr {
        match self {
            Atom::Dim(i) => dim(*i),
            Atom::Symbol(i) => sym(*i),
            Atom::FloorDiv(e, c) => e.clone().floordiv(*c),
            Atom::Mod(e, c) => e.clone().modulo(*c),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Linear {
    terms: BTreeMap<Atom, i64>,
    constant: i64,
}

impl Linear {
    fn constant(c: i64) -> Self {
        Linear {
            terms: BTreeMap::new(),
            constant: c,
        }
    }

    fn atom(atom: Atom) -> Self {
        Linear {
            terms: BTreeMap::from([(atom, 1)]),
            constant: 0,
        }
    }

    fn add_term(&mut self, atom: Atom, coeff: i64) {
        let entry = self.terms.entry(atom).or_insert(0);
        *entry = entry.saturating_add(coeff);
        self.terms.retain(|_, c| *c != 0);
    }

    fn add(mut self, other: Linear) -> Self {
        for (atom, coeff) in other.terms {
            self.add_term(atom, coeff);
        }
        self.constant = self.constant.saturating_add(other.constant);
        self
    }

    fn scale(mut self, k: i64) -> Self {
        if k == 0 {
            return Linear::constant(0);
        }
        for coeff in self.terms.values_mut() {
            *coeff = coeff.saturating_mul(k);
        }
        self.constant = self.constant.saturating_mul(k);
        self
    }

    fn single_atom(&self) -> Option<Atom> {
        match self.terms.iter().next() {
            Some((atom, &1)) if self.terms.len() == 1 && self.constant == 0 => Some(atom.clone()),
            _ => None,
        }
    }

    fn range(&self, map: &IndexingMap) -> Interval {
        self.terms.iter().fold(Interval::point(self.constant), |acc, (atom, &coeff)| {
            let r = scale(expr_range(&atom.to_expr(), map), coeff);
            Interval::new(acc.lo.saturating_add(r.lo), acc.hi.saturating_add(r.hi))
        })
    }

    fn to_expr(&self) -> AffineExpr {
        let mut expr: Option<AffineExpr> = None;
        for (atom, &coeff) in &self.terms {
            let term = if coeff == 1 {
                atom.to_expr()
            } else {
                atom.to_expr() * coeff
            };
            expr = Some(match expr {
                Some(acc) => acc + term,
                None => term,
            });
        }
        match expr {
            None => cst(self.constant),
            Some(e) if self.constant == 0 => e,
            Some(e) => e + self.constant,
        }
    }

    /// `(x floordiv c) * c * k + (x mod c) * k  ->  x * k`.
    fn merge_div_mod(mut self, map: &IndexingMap) -> Self {
        loop {
            let found = self.terms.iter().find_map(|(atom, &k)| match atom {
                Atom::Mod(x, c) => {
                    let div = lower_floordiv(lower(x, map), *c, map).single_atom()?;
                    (self.terms.get(&div) == Some(&k.saturating_mul(*c)))
                        .then(|| (atom.clone(), div, x.clone(), k))
                }
                _ => None,
            });
            let Some((mod_atom, div_atom, x, k)) = found else {
                return self;
            };
            self.terms.remove(&mod_atom);
            self.terms.remove(&div_atom);
            self = self.add(lower(&x, map).scale(k));
        }
    }
}

fn simplify_expr(expr: &AffineExpr, map: &IndexingMap) -> AffineExpr {
    lower(expr, map).to_expr()
}

fn lower(expr: &AffineExpr, map: &IndexingMap) -> Linear {
    match expr {
        AffineExpr::Dim(i) => match map.dims.get(*i) {
            Some(b) if b.is_point() => Linear::constant(b.lo),
            _ => Linear::atom(Atom::Dim(*i)),
        },
        AffineExpr::Symbol(i) => match map.symbols.get(*i) {
            Some(s) if s.bounds.is_point() => Linear::constant(s.bounds.lo),
            _ => Linear::atom(Atom::Symbol(*i)),
        },
        AffineExpr::Constant(c) => Linear::constant(*c),
        AffineExpr::Add(a, b) => lower(a, map).add(lower(b, map)).merge_div_mod(map),
        AffineExpr::Mul(a, c) => lower(a, map).scale(*c).merge_div_mod(map),
        AffineExpr::FloorDiv(a, c) => lower_floordiv(lower(a, map), *c, map),
        AffineExpr::Mod(a, c) => lower_mod(lower(a, map), *c, map),
    }
}

fn lower_floordiv(inner: Linear, c: i64, map: &IndexingMap) -> Linear {
    if c <= 0 {
        return Linear::atom(Atom::FloorDiv(inner.to_expr(), c));
    }
    if c == 1 {
        return inner;
    }
    // (x floordiv a + k) floordiv c  ->  (x + k * a) floordiv (a * c)
    let nested = match inner.terms.iter().next() {
        Some((Atom::FloorDiv(x, a), &1)) if inner.terms.len() == 1 && *a > 0 => Some((x.clone(), *a)),
        _ => None,
    };
    if let Some((x, a)) = nested {
        let shifted = lower(&x, map).add(Linear::constant(inner.constant.saturating_mul(a)));
        return lower_floordiv(shifted, a.saturating_mul(c), map);
    }
    // Multiples of c leave the division; what remains is divided.
    let mut outer = Linear::constant(inner.constant.div_euclid(c));
    let mut rest = Linear::constant(inner.constant.rem_euclid(c));
    for (atom, coeff) in inner.terms {
        if coeff % c == 0 {
            outer.add_term(atom, coeff / c);
        } else {
            rest.add_term(atom, coeff);
        }
    }
    let r = rest.range(map);
    let (q_lo, q_hi) = (r.lo.div_euclid(c), r.hi.div_euclid(c));
    if q_lo == q_hi {
        outer.constant = outer.constant.saturating_add(q_lo);
        return outer;
    }
    outer.add(Linear::atom(Atom::FloorDiv(rest.to_expr(), c)))
}

fn lower_mod(inner: Linear, c: i64, map: &IndexingMap) -> Linear {
    if c <= 0 {
        return Linear::atom(Atom::Mod(inner.to_expr(), c));
    }
    if c == 1 {
        return Linear::constant(0);
    }
    let mut rest = Linear::constant(inner.constant.rem_euclid(c));
    for (atom, coeff) in inner.terms {
        let reduced = coeff.rem_euclid(c);
        if reduced != 0 {
            rest.add_term(atom, reduced);
        }
    }
    let r = rest.range(map);
    let (q_lo, q_hi) = (r.lo.div_euclid(c), r.hi.div_euclid(c));
    if q_lo == q_hi {
        rest.constant = rest.constant.saturating_sub(q_lo.saturating_mul(c));
        return rest;
    }
    Linear::atom(Atom::Mod(rest.to_expr(), c))
}
