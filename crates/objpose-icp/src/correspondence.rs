use kiddo::immutable::float::kdtree::ImmutableKdTree;

pub(crate) type KdTree = ImmutableKdTree<f64, u32, 3, 32>;

/// A source point paired with its nearest target point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    /// Index into the source cloud.
    pub source: usize,
    /// Index into the target cloud.
    pub target: usize,
    /// Euclidean distance between the paired points.
    pub distance: f64,
}

/// Pair every source point with its nearest target point within `max_distance`.
///
/// With `reciprocal` set, a pair is only kept when the source point is also the nearest
/// source point of its target; `source_tree` must then index `source`.
pub(crate) fn find_correspondences(
    source: &[[f64; 3]],
    target: &[[f64; 3]],
    target_tree: &KdTree,
    max_distance: f64,
    source_tree: Option<&KdTree>,
) -> Vec<Correspondence> {
    let max_sq = max_distance * max_distance;
    source
        .iter()
        .enumerate()
        .filter_map(|(i, p)| {
            let nn = target_tree.nearest_one::<kiddo::SquaredEuclidean>(p);
            if !(nn.distance <= max_sq) {
                return None;
            }
            let j = nn.item as usize;
            if let Some(tree) = source_tree {
                let back = tree.nearest_one::<kiddo::SquaredEuclidean>(&target[j]);
                if back.item as usize != i {
                    return None;
                }
            }
            Some(Correspondence {
                source: i,
                target: j,
                distance: nn.distance.sqrt(),
            })
        })
        .collect()
}

/// Keep the pairs closer than `threshold`.
///
/// The rejection is skipped when it would leave fewer than `min_kept` pairs.
pub(crate) fn reject_outliers(
    correspondences: &[Correspondence],
    threshold: f64,
    min_kept: usize,
) -> Vec<Correspondence> {
    let kept = correspondences
        .iter()
        .filter(|c| c.distance <= threshold)
        .copied()
        .collect::<Vec<_>>();
    if kept.len() < min_kept {
        log::debug!(
            "outlier rejection would keep {} of {} pairs, skipping it",
            kept.len(),
            correspondences.len()
        );
        return correspondences.to_vec();
    }
    kept
}

/// Mean squared distance of the pairs, infinite when there are none.
pub(crate) fn mean_squared_distance(correspondences: &[Correspondence]) -> f64 {
    if correspondences.is_empty() {
        return f64::INFINITY;
    }
    correspondences
        .iter()
        .map(|c| c.distance * c.distance)
        .sum::<f64>()
        / correspondences.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_find_correspondences() {
        let points_src = vec![
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [1.0, 1.0, 0.0],
        ];
        let points_dst = vec![[1.0, 0.0, 0.0], [1.0, 1.0, 0.0]];
        let kdtree = KdTree::new_from_slice(&points_dst);

        let pairs = find_correspondences(&points_src, &points_dst, &kdtree, 10.0, None);
        assert_eq!(pairs.len(), 4);
        assert_eq!(pairs[1].target, 0);
        assert_eq!(pairs[1].distance, 0.0);
        assert_eq!(pairs[3].target, 1);
        assert_relative_eq!(pairs[0].distance, 1.0);

        // only the exact matches are within reach
        let pairs = find_correspondences(&points_src, &points_dst, &kdtree, 0.5, None);
        assert_eq!(
            pairs.iter().map(|c| c.source).collect::<Vec<_>>(),
            vec![1, 3]
        );
    }

    #[test]
    fn test_non_finite_source_points_are_unmatched() {
        let points_src = vec![[f64::NAN, 0.0, 0.0], [1.0, 0.0, 0.0]];
        let points_dst = vec![[1.0, 0.0, 0.0], [1.0, 1.0, 0.0]];
        let kdtree = KdTree::new_from_slice(&points_dst);

        let pairs = find_correspondences(&points_src, &points_dst, &kdtree, 10.0, None);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].source, 1);
    }

    #[test]
    fn test_reciprocal_correspondences() {
        let points_src = vec![[0.0, 0.0, 0.0], [0.9, 0.0, 0.0]];
        let points_dst = vec![[1.0, 0.0, 0.0]];
        let target_tree = KdTree::new_from_slice(&points_dst);
        let source_tree = KdTree::new_from_slice(&points_src);

        let plain = find_correspondences(&points_src, &points_dst, &target_tree, 2.0, None);
        assert_eq!(plain.len(), 2);

        let mutual =
            find_correspondences(&points_src, &points_dst, &target_tree, 2.0, Some(&source_tree));
        assert_eq!(mutual.len(), 1);
        assert_eq!(mutual[0].source, 1);
    }

    #[test]
    fn test_reject_outliers() {
        let pairs = (0..5)
            .map(|i| Correspondence {
                source: i,
                target: i,
                distance: i as f64 * 0.1,
            })
            .collect::<Vec<_>>();
        assert_eq!(reject_outliers(&pairs, 0.25, 3).len(), 3);
        // not enough survivors, nothing is rejected
        assert_eq!(reject_outliers(&pairs, 0.05, 3).len(), 5);
    }

    #[test]
    fn test_mean_squared_distance() {
        let pairs = [
            Correspondence {
                source: 0,
                target: 0,
                distance: 1.0,
            },
            Correspondence {
                source: 1,
                target: 1,
                distance: 3.0,
            },
        ];
        assert_relative_eq!(mean_squared_distance(&pairs), 5.0);
        assert!(mean_squared_distance(&[]).is_infinite());
    }
}
