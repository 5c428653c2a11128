// contiguity.rs — Stride-1 check of a thread → offset map
//
// Decides whether the lanes of an execution group together read one
// contiguous run of elements. Repeats are allowed, so broadcasts narrower
// than a warp still qualify. The map is probed at representative groups
// rather than solved symbolically: every other launch dimension at its
// bounds, every group along the thread axis, and a few values of each range
// symbol. Lanes outside the domain are skipped, so partial groups at a
// boundary are judged on their valid lanes only.
//
// Preconditions: `map` is a single-result element-offset map.
// Postconditions: `Ok(true)` iff the distinct offsets of every probed group's
//                 valid lanes form a gap-free run.
// Failure modes: invalid config, multi-result maps, runtime-dependent offsets,
//                undefined arithmetic and empty domains → `NotAnalyzable`.
// Side effects: none.

use crate::config::CoalescingConfig;
use crate::error::NotAnalyzable;
use crate::indexing::{IndexingMap, SymbolKind};

pub fn evaluate_contiguity(
    map: &IndexingMap,
    thread_axis: usize,
    config: &CoalescingConfig,
) -> Result<bool, NotAnalyzable> {
    config
        .validate()
        .map_err(|e| NotAnalyzable::InvalidConfig(e.to_string()))?;
    let [offset] = map.results.as_slice() else {
        return Err(NotAnalyzable::NotLinearized(map.results.len()));
    };
    for s in map.runtime_symbols() {
        if offset.uses_symbol(s) || map.constraints.iter().any(|(e, _)| e.uses_symbol(s)) {
            return Err(NotAnalyzable::DataDependent(s));
        }
    }
    let axis = *map.dims.get(thread_axis).ok_or(NotAnalyzable::EmptyDomain)?;
    if axis.is_empty() || map.dims.iter().any(|d| d.is_empty()) {
        return Err(NotAnalyzable::EmptyDomain);
    }
    let warp = config.warp_size;

    // Candidate values per variable; the thread axis is walked, not probed.
    let mut candidates: Vec<Vec<i64>> = Vec::with_capacity(map.num_dims() + map.num_symbols());
    for (d, bounds) in map.dims.iter().enumerate() {
        candidates.push(if d == thread_axis {
            vec![0]
        } else {
            bounds_samples(bounds.lo, bounds.hi)
        });
    }
    for symbol in &map.symbols {
        let (lo, hi) = (symbol.bounds.lo, symbol.bounds.hi);
        let values = match symbol.kind {
            SymbolKind::Range => {
                let mut values = vec![lo];
                for v in [lo + 1, hi] {
                    if v <= hi && !values.contains(&v) {
                        values.push(v);
                    }
                }
                values.truncate(config.symbol_samples);
                values
            }
            // Unused by the offset; any value will do.
            SymbolKind::Runtime => vec![lo],
        };
        if values.is_empty() || lo > hi {
            return Err(NotAnalyzable::EmptyDomain);
        }
        candidates.push(values);
    }

    let group_starts: Vec<i64> = (axis.lo..=axis.hi).step_by(warp as usize).collect();

    let num_dims = map.num_dims();
    let mut any_valid_lane = false;
    let mut probes = 0;
    let mut offsets: Vec<i64> = Vec::with_capacity(warp as usize);
    let mut choice = vec![0usize; candidates.len()];
    loop {
        let mut point: Vec<i64> = choice.iter().zip(&candidates).map(|(&i, c)| c[i]).collect();
        for &start in &group_starts {
            if probes >= config.max_probes {
                break;
            }
            probes += 1;
            offsets.clear();
            for lane in start..=(start + warp - 1).min(axis.hi) {
                point[thread_axis] = lane;
                let (dims, syms) = point.split_at(num_dims);
                if !map.contains_point(dims, syms).ok_or(NotAnalyzable::Undefined)? {
                    continue;
                }
                offsets.push(offset.eval(dims, syms).ok_or(NotAnalyzable::Undefined)?);
            }
            if offsets.is_empty() {
                continue;
            }
            any_valid_lane = true;
            if !is_contiguous_run(&mut offsets) {
                return Ok(false);
            }
        }
        if probes >= config.max_probes || !advance(&mut choice, &candidates) {
            break;
        }
    }

    if any_valid_lane {
        Ok(true)
    } else {
        Err(NotAnalyzable::EmptyDomain)
    }
}

/// Whether the lane offsets of one group cover a gap-free range.
fn is_contiguous_run(offsets: &mut Vec<i64>) -> bool {
    // Lane order already advancing by 0 or 1.
    if offsets.windows(2).all(|w| matches!(w[1] - w[0], 0 | 1)) {
        return true;
    }
    offsets.sort_unstable();
    offsets.dedup();
    match (offsets.first(), offsets.last()) {
        (Some(&lo), Some(&hi)) => hi - lo + 1 == offsets.len() as i64,
        _ => true,
    }
}

fn bounds_samples(lo: i64, hi: i64) -> Vec<i64> {
    if lo == hi {
        vec![lo]
    } else {
        vec![lo, hi]
    }
}

/// Odometer step over the candidate lists. Returns `false` once every
/// combination has been visited.
fn advance(choice: &mut [usize], candidates: &[Vec<i64>]) -> bool {
    for (i, c) in choice.iter_mut().zip(candidates) {
        *i += 1;
        if *i < c.len() {
            return true;
        }
        *i = 0;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexing::{dim, sym, Interval, Symbol, BLOCK_X, NUM_LAUNCH_DIMS, THREAD_X};

    fn launch(threads: i64, blocks: i64) -> Vec<Interval> {
        let mut dims = vec![Interval::point(0); NUM_LAUNCH_DIMS];
        dims[THREAD_X] = Interval::upto(threads);
        dims[BLOCK_X] = Interval::upto(blocks);
        dims
    }

    fn check(map: &IndexingMap) -> Result<bool, NotAnalyzable> {
        evaluate_contiguity(map, THREAD_X, &CoalescingConfig::default())
    }

    #[test]
    fn unit_stride_is_coalesced() {
        let map = IndexingMap::new(launch(128, 16), vec![], vec![dim(3) * 128 + dim(0)]);
        assert_eq!(check(&map), Ok(true));
    }

    #[test]
    fn broadcast_is_coalesced() {
        let map = IndexingMap::new(launch(128, 4), vec![], vec![dim(3)]);
        assert_eq!(check(&map), Ok(true));
    }

    #[test]
    fn strided_is_not_coalesced() {
        let map = IndexingMap::new(launch(128, 1), vec![], vec![dim(0) * 32]);
        assert_eq!(check(&map), Ok(false));
    }

    #[test]
    fn row_wrap_inside_group_breaks_contiguity() {
        // 48-wide rows padded to 64: lanes 47 -> 48 jump a row.
        let map = IndexingMap::new(launch(128, 1), vec![], vec![dim(0).floordiv(48) * 64 + dim(0).modulo(48)]);
        assert_eq!(check(&map), Ok(false));
    }

    #[test]
    fn boundary_group_is_judged_on_valid_lanes() {
        // 200 elements, 128 threads x 2 blocks: the last group is partial.
        let map = IndexingMap::new(launch(128, 2), vec![], vec![dim(0) + dim(3) * 128])
            .with_constraint(dim(0) + dim(3) * 128, Interval::new(0, 199));
        assert_eq!(check(&map), Ok(true));
    }

    #[test]
    fn range_symbols_are_sampled() {
        let map = IndexingMap::new(
            launch(128, 8),
            vec![Symbol::range(Interval::upto(4))],
            vec![dim(3) * 512 + sym(0) * 128 + dim(0)],
        );
        assert_eq!(check(&map), Ok(true));
        let strided = IndexingMap::new(
            launch(32, 1),
            vec![Symbol::range(Interval::upto(4))],
            vec![dim(0) * 4 + sym(0)],
        );
        assert_eq!(check(&strided), Ok(false));
    }

    #[test]
    fn declines_runtime_offsets_and_multi_results() {
        let runtime = IndexingMap::new(
            launch(32, 1),
            vec![Symbol::runtime(Interval::new(0, 10))],
            vec![dim(0) + sym(0)],
        );
        assert_eq!(check(&runtime), Err(NotAnalyzable::DataDependent(0)));
        let logical = IndexingMap::new(launch(32, 1), vec![], vec![dim(0), dim(3)]);
        assert_eq!(check(&logical), Err(NotAnalyzable::NotLinearized(2)));
    }

    #[test]
    fn declines_empty_domain() {
        let map = IndexingMap::new(launch(32, 1), vec![], vec![dim(0)])
            .with_constraint(dim(0), Interval::new(100, 200));
        assert_eq!(check(&map), Err(NotAnalyzable::EmptyDomain));
    }

    #[test]
    fn narrow_broadcast_row_repeats_within_group() {
        // A 16-wide row read twice per warp: offsets 0..15, then 0..15 again.
        let map = IndexingMap::new(launch(128, 8), vec![], vec![(dim(3) * 128 + dim(0)).modulo(16)]);
        assert_eq!(check(&map), Ok(true));
    }

    #[test]
    fn narrow_rows_with_padding_leave_a_gap() {
        // 16 of every 64 elements: lanes 16..31 start the next row at 64.
        let map = IndexingMap::new(launch(128, 1), vec![], vec![dim(0).floordiv(16) * 64 + dim(0).modulo(16)]);
        assert_eq!(check(&map), Ok(false));
    }

    #[test]
    fn contiguous_run_ignores_lane_order() {
        assert!(is_contiguous_run(&mut vec![0, 1, 1, 2]));
        assert!(is_contiguous_run(&mut vec![3, 4, 0, 1, 2]));
        assert!(!is_contiguous_run(&mut vec![0, 1, 3]));
        assert!(!is_contiguous_run(&mut vec![0, 32, 64]));
    }

    #[test]
    fn invalid_config_declines() {
        let map = IndexingMap::new(launch(32, 1), vec![], vec![dim(0)]);
        let zero_warp = CoalescingConfig {
            warp_size: 0,
            ..CoalescingConfig::default()
        };
        assert!(matches!(
            evaluate_contiguity(&map, THREAD_X, &zero_warp),
            Err(NotAnalyzable::InvalidConfig(_))
        ));
    }

    #[test]
    fn max_probes_limits_groups_checked() {
        // Block 0 reads 0..31; block 1 reads 24..39 then 0..15, leaving a gap.
        let map = IndexingMap::new(launch(32, 2), vec![], vec![(dim(0) + dim(3) * 24).modulo(40)]);
        assert_eq!(check(&map), Ok(false));
        let tight = CoalescingConfig {
            max_probes: 1,
            ..CoalescingConfig::default()
        };
        assert_eq!(evaluate_contiguity(&map, THREAD_X, &tight), Ok(true));
    }
}
