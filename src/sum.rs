//! Pairwise (balanced-tree) summation.
//!
//! The reduction is defined once, over an arbitrary combiner, and reused by
//! the expression builder ([`crate::expr::pairwise_sum`]) and by the jet
//! codegen, so the tree shape is identical everywhere: a sum of one term is
//! returned unchanged, a sum of two terms is a single addition, and longer
//! sums are reduced by iterative halving with the leftover odd element
//! carried forward unchanged. Depth is `ceil(log2(k))` for `k` terms.
//!
//! The module is pure Rust with no Cranelift dependencies, which keeps its
//! unit tests independent of the backend.

/// Reduce `items` with `add`, combining pairs level by level.
///
/// Returns `None` for empty input. The compact-mode jet helpers replicate
/// this exact iteration order with runtime loop bounds, which is what makes
/// the unrolled and compact kernels bitwise-identical.
pub(crate) fn pairwise_reduce<T>(mut items: Vec<T>, mut add: impl FnMut(T, T) -> T) -> Option<T> {
    if items.is_empty() {
        return None;
    }
    while items.len() > 1 {
        let mut next = Vec::with_capacity(items.len() / 2 + 1);
        let mut it = items.into_iter();
        loop {
            match (it.next(), it.next()) {
                (Some(a), Some(b)) => next.push(add(a, b)),
                // Odd leftover: carried to the next level unchanged.
                (Some(a), None) => {
                    next.push(a);
                    break;
                }
                (None, _) => break,
            }
        }
        items = next;
    }
    items.pop()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Tracks the depth of the reduction tree alongside the running value.
    #[derive(Clone, Copy, Debug, PartialEq)]
    struct Depth {
        value: f64,
        depth: u32,
    }

    fn leaf(v: f64) -> Depth {
        Depth { value: v, depth: 0 }
    }

    fn combine(a: Depth, b: Depth) -> Depth {
        Depth {
            value: a.value + b.value,
            depth: a.depth.max(b.depth) + 1,
        }
    }

    #[test]
    fn empty_is_none() {
        assert!(pairwise_reduce(Vec::<f64>::new(), |a, b| a + b).is_none());
    }

    #[test]
    fn single_term_is_unchanged() {
        let r = pairwise_reduce(vec![leaf(7.0)], combine).unwrap();
        assert_eq!(r, leaf(7.0));
    }

    #[test]
    fn two_terms_is_one_addition() {
        let r = pairwise_reduce(vec![leaf(1.0), leaf(2.0)], combine).unwrap();
        assert_eq!(r.value, 3.0);
        assert_eq!(r.depth, 1);
    }

    #[test]
    fn tree_is_balanced() {
        for k in 3..=33u32 {
            let items: Vec<_> = (0..k).map(|i| leaf(f64::from(i))).collect();
            let r = pairwise_reduce(items, combine).unwrap();
            let expected_depth = (k as f64).log2().ceil() as u32;
            assert_eq!(r.depth, expected_depth, "k = {k}");
            assert_eq!(r.value, f64::from(k * (k - 1) / 2));
        }
    }

    #[test]
    fn odd_leftover_carried_forward() {
        // Five terms: levels (01)(23)(4) -> (0123)(4) -> final. The lone
        // element 4 must only be touched at the last level.
        let r = pairwise_reduce(vec![leaf(1.0); 5], combine).unwrap();
        assert_eq!(r.value, 5.0);
        assert_eq!(r.depth, 3);
    }
}
