// indexing.rs — Affine index expressions and bounded indexing maps
//
// An `IndexingMap` maps a box of integer dimensions (plus bounded symbols) to
// one or more affine-like results. Thread maps use the six GPU launch
// dimensions; per-instruction maps use the instruction's output dimensions.
//
// Expressions multiply, divide and take remainders by constants only, which
// keeps every map closed under composition and cheap to evaluate.

use std::fmt;
use std::ops;

// ── Launch dimensions ───────────────────────────────────────────────────────

pub const THREAD_X: usize = 0;
pub const THREAD_Y: usize = 1;
pub const THREAD_Z: usize = 2;
pub const BLOCK_X: usize = 3;
pub const BLOCK_Y: usize = 4;
pub const BLOCK_Z: usize = 5;
pub const NUM_LAUNCH_DIMS: usize = 6;

// ── Intervals ───────────────────────────────────────────────────────────────

/// Closed integer interval `[lo, hi]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interval {
    pub lo: i64,
    pub hi: i64,
}

impl Interval {
    pub fn new(lo: i64, hi: i64) -> Self {
        Interval { lo, hi }
    }

    pub fn point(v: i64) -> Self {
        Interval { lo: v, hi: v }
    }

    /// `[0, size - 1]`, the index range of a dimension of `size` elements.
    pub fn upto(size: i64) -> Self {
        Interval { lo: 0, hi: size - 1 }
    }

    pub fn is_point(&self) -> bool {
        self.lo == self.hi
    }

    pub fn is_empty(&self) -> bool {
        self.lo > self.hi
    }

    pub fn contains(&self, v: i64) -> bool {
        self.lo <= v && v <= self.hi
    }

    pub fn contains_interval(&self, other: &Interval) -> bool {
        self.lo <= other.lo && other.hi <= self.hi
    }

    pub fn size(&self) -> i64 {
        (self.hi - self.lo + 1).max(0)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.lo, self.hi)
    }
}

// ── Expressions ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AffineExpr {
    Dim(usize),
    Symbol(usize),
    Constant(i64),
    Add(Box<AffineExpr>, Box<AffineExpr>),
    Mul(Box<AffineExpr>, i64),
    FloorDiv(Box<AffineExpr>, i64),
    Mod(Box<AffineExpr>, i64),
}

pub fn dim(i: usize) -> AffineExpr {
    AffineExpr::Dim(i)
}

pub fn sym(i: usize) -> AffineExpr {
    AffineExpr::Symbol(i)
}

pub fn cst(c: i64) -> AffineExpr {
    AffineExpr::Constant(c)
}

impl AffineExpr {
    pub fn floordiv(self, c: i64) -> AffineExpr {
        AffineExpr::FloorDiv(Box::new(self), c)
    }

    pub fn modulo(self, c: i64) -> AffineExpr {
        AffineExpr::Mod(Box::new(self), c)
    }

    pub fn as_constant(&self) -> Option<i64> {
        match self {
            AffineExpr::Constant(c) => Some(*c),
            _ => None,
        }
    }

    /// Evaluate at a point. `None` on division by a non-positive constant or
    /// arithmetic overflow.
    pub fn eval(&self, dims: &[i64], syms: &[i64]) -> Option<i64> {
        match self {
            AffineExpr::Dim(i) => dims.get(*i).copied(),
            AffineExpr::Symbol(i) => syms.get(*i).copied(),
            AffineExpr::Constant(c) => Some(*c),
            AffineExpr::Add(a, b) => a.eval(dims, syms)?.checked_add(b.eval(dims, syms)?),
            AffineExpr::Mul(a, c) => a.eval(dims, syms)?.checked_mul(*c),
            AffineExpr::FloorDiv(a, c) if *c > 0 => Some(a.eval(dims, syms)?.div_euclid(*c)),
            AffineExpr::Mod(a, c) if *c > 0 => Some(a.eval(dims, syms)?.rem_euclid(*c)),
            AffineExpr::FloorDiv(..) | AffineExpr::Mod(..) => None,
        }
    }

    /// Substitute every dimension and symbol.
    pub fn replace(&self, dims: &[AffineExpr], syms: &[AffineExpr]) -> AffineExpr {
        match self {
            AffineExpr::Dim(i) => dims.get(*i).cloned().unwrap_or(AffineExpr::Dim(*i)),
            AffineExpr::Symbol(i) => syms.get(*i).cloned().unwrap_or(AffineExpr::Symbol(*i)),
            AffineExpr::Constant(c) => AffineExpr::Constant(*c),
            AffineExpr::Add(a, b) => AffineExpr::Add(
                Box::new(a.replace(dims, syms)),
                Box::new(b.replace(dims, syms)),
            ),
            AffineExpr::Mul(a, c) => AffineExpr::Mul(Box::new(a.replace(dims, syms)), *c),
            AffineExpr::FloorDiv(a, c) => AffineExpr::FloorDiv(Box::new(a.replace(dims, syms)), *c),
            AffineExpr::Mod(a, c) => AffineExpr::Mod(Box::new(a.replace(dims, syms)), *c),
        }
    }

    /// Renumber symbols `s_i` to `s_{i + offset}`.
    pub fn shift_symbols(&self, offset: usize) -> AffineExpr {
        self.map_leaves(&|leaf| match leaf {
            AffineExpr::Symbol(i) => AffineExpr::Symbol(i + offset),
            other => other.clone(),
        })
    }

    fn map_leaves(&self, f: &dyn Fn(&AffineExpr) -> AffineExpr) -> AffineExpr {
        match self {
            AffineExpr::Add(a, b) => AffineExpr::Add(Box::new(a.map_leaves(f)), Box::new(b.map_leaves(f))),
            AffineExpr::Mul(a, c) => AffineExpr::Mul(Box::new(a.map_leaves(f)), *c),
            AffineExpr::FloorDiv(a, c) => AffineExpr::FloorDiv(Box::new(a.map_leaves(f)), *c),
            AffineExpr::Mod(a, c) => AffineExpr::Mod(Box::new(a.map_leaves(f)), *c),
            leaf => f(leaf),
        }
    }

    pub fn uses_symbol(&self, s: usize) -> bool {
        self.any_leaf(&|leaf| *leaf == AffineExpr::Symbol(s))
    }

    pub fn uses_dim(&self, d: usize) -> bool {
        self.any_leaf(&|leaf| *leaf == AffineExpr::Dim(d))
    }

    fn any_leaf(&self, pred: &dyn Fn(&AffineExpr) -> bool) -> bool {
        match self {
            AffineExpr::Add(a, b) => a.any_leaf(pred) || b.any_leaf(pred),
            AffineExpr::Mul(a, _) | AffineExpr::FloorDiv(a, _) | AffineExpr::Mod(a, _) => a.any_leaf(pred),
            leaf => pred(leaf),
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            AffineExpr::Add(..) => 1,
            AffineExpr::Mul(..) | AffineExpr::FloorDiv(..) | AffineExpr::Mod(..) => 2,
            _ => 3,
        }
    }

    fn fmt_operand(&self, f: &mut fmt::Formatter<'_>, min_precedence: u8) -> fmt::Result {
        if self.precedence() < min_precedence {
            write!(f, "({})", self)
        } else {
            write!(f, "{}", self)
        }
    }
}

impl fmt::Display for AffineExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AffineExpr::Dim(i) => write!(f, "d{}", i),
            AffineExpr::Symbol(i) => write!(f, "s{}", i),
            AffineExpr::Constant(c) => write!(f, "{}", c),
            AffineExpr::Add(a, b) => {
                a.fmt_operand(f, 1)?;
                match b.as_ref() {
                    AffineExpr::Constant(c) if *c < 0 => write!(f, " - {}", c.unsigned_abs()),
                    _ => {
                        write!(f, " + ")?;
                        // Right-nested sums are parenthesized to keep the tree visible.
                        b.fmt_operand(f, 2)
                    }
                }
            }
            AffineExpr::Mul(a, c) => {
                a.fmt_operand(f, 3)?;
                write!(f, " * {}", c)
            }
            AffineExpr::FloorDiv(a, c) => {
                a.fmt_operand(f, 3)?;
                write!(f, " floordiv {}", c)
            }
            AffineExpr::Mod(a, c) => {
                a.fmt_operand(f, 3)?;
                write!(f, " mod {}", c)
            }
        }
    }
}

impl ops::Add for AffineExpr {
    type Output = AffineExpr;
    fn add(self, rhs: AffineExpr) -> AffineExpr {
        AffineExpr::Add(Box::new(self), Box::new(rhs))
    }
}

impl ops::Add<i64> for AffineExpr {
    type Output = AffineExpr;
    fn add(self, rhs: i64) -> AffineExpr {
        self + AffineExpr::Constant(rhs)
    }
}

impl ops::Sub<i64> for AffineExpr {
    type Output = AffineExpr;
    fn sub(self, rhs: i64) -> AffineExpr {
        self + AffineExpr::Constant(-rhs)
    }
}

impl ops::Mul<i64> for AffineExpr {
    type Output = AffineExpr;
    fn mul(self, rhs: i64) -> AffineExpr {
        AffineExpr::Mul(Box::new(self), rhs)
    }
}

// ── Indexing maps ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolKind {
    /// Loop variable enumerated by the kernel (unroll, reduction chunk, ...).
    Range,
    /// Value only known at run time (e.g. a dynamic-slice offset).
    Runtime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Symbol {
    pub bounds: Interval,
    pub kind: SymbolKind,
}

impl Symbol {
    pub fn range(bounds: Interval) -> Self {
        Symbol {
            bounds,
            kind: SymbolKind::Range,
        }
    }

    pub fn runtime(bounds: Interval) -> Self {
        Symbol {
            bounds,
            kind: SymbolKind::Runtime,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexingMap {
    pub dims: Vec<Interval>,
    pub symbols: Vec<Symbol>,
    pub results: Vec<AffineExpr>,
    /// Each expression must evaluate inside its interval.
    pub constraints: Vec<(AffineExpr, Interval)>,
}

impl IndexingMap {
    pub fn new(dims: Vec<Interval>, symbols: Vec<Symbol>, results: Vec<AffineExpr>) -> Self {
        IndexingMap {
            dims,
            symbols,
            results,
            constraints: Vec::new(),
        }
    }

    /// `(d0, .., dn) -> (d0, .., dn)` over a shape's index space.
    pub fn identity(sizes: &[i64]) -> Self {
        IndexingMap::new(
            sizes.iter().map(|&s| Interval::upto(s)).collect(),
            Vec::new(),
            (0..sizes.len()).map(dim).collect(),
        )
    }

    /// A map with the given domain and no results, for reads that do not
    /// depend on the output position (reduction init values).
    pub fn empty_results(dims: Vec<Interval>) -> Self {
        IndexingMap::new(dims, Vec::new(), Vec::new())
    }

    pub fn with_constraint(mut self, expr: AffineExpr, bounds: Interval) -> Self {
        self.constraints.push((expr, bounds));
        self
    }

    pub fn num_dims(&self) -> usize {
        self.dims.len()
    }

    pub fn num_symbols(&self) -> usize {
        self.symbols.len()
    }

    /// Symbols whose value is only known at run time.
    pub fn runtime_symbols(&self) -> impl Iterator<Item = usize> + '_ {
        self.symbols
            .iter()
            .enumerate()
            .filter(|(_, s)| s.kind == SymbolKind::Runtime)
            .map(|(i, _)| i)
    }

    /// Whether a point lies in every variable's bounds and satisfies every
    /// constraint. `None` if a constraint is undefined at the point.
    pub fn contains_point(&self, dims: &[i64], syms: &[i64]) -> Option<bool> {
        let in_bounds = self.dims.iter().zip(dims).all(|(b, &v)| b.contains(v))
            && self
                .symbols
                .iter()
                .zip(syms)
                .all(|(s, &v)| s.bounds.contains(v));
        if !in_bounds {
            return Some(false);
        }
        for (expr, bounds) in &self.constraints {
            if !bounds.contains(expr.eval(dims, syms)?) {
                return Some(false);
            }
        }
        Some(true)
    }

    pub fn evaluate(&self, dims: &[i64], syms: &[i64]) -> Option<Vec<i64>> {
        self.results.iter().map(|r| r.eval(dims, syms)).collect()
    }
}

impl fmt::Display for IndexingMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = (0..self.dims.len()).map(|i| format!("d{}", i)).collect();
        write!(f, "({})", dims.join(", "))?;
        if !self.symbols.is_empty() {
            let syms: Vec<String> = (0..self.symbols.len()).map(|i| format!("s{}", i)).collect();
            write!(f, "[{}]", syms.join(", "))?;
        }
        let results: Vec<String> = self.results.iter().map(|r| r.to_string()).collect();
        writeln!(f, " -> ({})", results.join(", "))?;
        write!(f, "domain:")?;
        for (i, bounds) in self.dims.iter().enumerate() {
            write!(f, "\nd{} in {}", i, bounds)?;
        }
        for (i, symbol) in self.symbols.iter().enumerate() {
            write!(f, "\ns{} in {}", i, symbol.bounds)?;
            if symbol.kind == SymbolKind::Runtime {
                write!(f, " (runtime)")?;
            }
        }
        for (expr, bounds) in &self.constraints {
            write!(f, "\n{} in {}", expr, bounds)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eval_floor_semantics() {
        let e = (dim(0) - 5).floordiv(4);
        assert_eq!(e.eval(&[0], &[]), Some(-2));
        let m = (dim(0) - 5).modulo(4);
        assert_eq!(m.eval(&[0], &[]), Some(3));
        assert_eq!(dim(0).floordiv(0).eval(&[3], &[]), None);
    }

    #[test]
    fn replace_and_shift() {
        let e = dim(0) * 4 + sym(0);
        let r = e.replace(&[dim(1) + 1], &[sym(2)]);
        assert_eq!(r.eval(&[0, 3], &[0, 0, 7]), Some(23));
        assert!(e.shift_symbols(2).uses_symbol(2));
        assert!(!e.shift_symbols(2).uses_symbol(0));
    }

    #[test]
    fn display_parenthesizes_lower_precedence() {
        let e = (dim(0) + sym(1)).floordiv(8) * 2 + (dim(1) - 3);
        assert_eq!(e.to_string(), "((d0 + s1) floordiv 8) * 2 + (d1 - 3)");
    }

    #[test]
    fn contains_point_checks_constraints() {
        let map = IndexingMap::new(vec![Interval::upto(8)], vec![], vec![dim(0)])
            .with_constraint(dim(0) * 2, Interval::new(0, 9));
        assert_eq!(map.contains_point(&[4], &[]), Some(true));
        assert_eq!(map.contains_point(&[5], &[]), Some(false));
        assert_eq!(map.contains_point(&[8], &[]), Some(false));
    }

    #[test]
    fn display_map() {
        let map = IndexingMap::new(
            vec![Interval::upto(4)],
            vec![Symbol::range(Interval::upto(2)), Symbol::runtime(Interval::new(0, 10))],
            vec![dim(0) + sym(0), sym(1)],
        );
        assert_eq!(
            map.to_string(),
            "(d0)[s0, s1] -> (d0 + s0, s1)\ndomain:\nd0 in [0, 3]\ns0 in [0, 1]\ns1 in [0, 10] (runtime)"
        );
    }
}
