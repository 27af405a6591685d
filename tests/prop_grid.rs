//! Property tests for grid construction.

use proptest::prelude::*;
use rpb_capture::grid::Grid;

fn interior_points() -> impl Strategy<Value = Vec<f64>> {
    prop::collection::btree_set(1u32..999, 0..8)
        .prop_map(|set| set.into_iter().map(|p| f64::from(p) / 1000.0).collect())
}

proptest! {
    #[test]
    fn grid_is_increasing_and_spans_unit_interval(nfe in 1usize..40, explicit in interior_points()) {
        let grid = Grid::new(nfe, &explicit).unwrap();
        let points = grid.points();
        prop_assert_eq!(points[0], 0.0);
        prop_assert_eq!(*points.last().unwrap(), 1.0);
        prop_assert!(points.windows(2).all(|w| w[1] > w[0]));
        prop_assert!(grid.nfe() >= nfe);
        prop_assert!(grid.nfe() >= explicit.len() + 1);
    }

    #[test]
    fn explicit_points_are_kept(nfe in 1usize..40, explicit in interior_points()) {
        let grid = Grid::new(nfe, &explicit).unwrap();
        for p in &explicit {
            prop_assert!(grid.points().contains(p));
        }
    }

    #[test]
    fn element_widths_sum_to_one(nfe in 1usize..40, explicit in interior_points()) {
        let grid = Grid::new(nfe, &explicit).unwrap();
        let total: f64 = (0..grid.len()).map(|i| grid.width_before(i)).sum();
        prop_assert!((total - 1.0).abs() < 1e-12);
        prop_assert_eq!(grid.width_before(0), 0.0);
    }

    #[test]
    fn uniform_grid_has_equal_widths(nfe in 1usize..60) {
        let grid = Grid::uniform(nfe).unwrap();
        prop_assert_eq!(grid.len(), nfe + 1);
        let h = 1.0 / nfe as f64;
        for i in 1..grid.len() {
            prop_assert!((grid.width_before(i) - h).abs() < 1e-12);
        }
    }

    #[test]
    fn unsorted_points_rejected(a in 1u32..999, b in 1u32..999) {
        prop_assume!(a > b);
        let explicit = [f64::from(a) / 1000.0, f64::from(b) / 1000.0];
        prop_assert!(Grid::new(5, &explicit).is_err());
    }
}
