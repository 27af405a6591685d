//! Finite-element grids over the normalized axial (`z`) and rotational (`o`)
//! coordinates.
//!
//! A grid is a strictly increasing list of node locations in `[0, 1]` that
//! always contains both endpoints. Explicit breakpoints are kept as given;
//! when they describe fewer elements than requested the largest element is
//! bisected until the count matches. Without explicit points the spacing is
//! uniform.
//!
//! # Examples
//!
//! ```
//! use rpb_capture::grid::Grid;
//!
//! let grid = Grid::new(3, &[0.5]).unwrap();
//! assert_eq!(grid.points(), &[0.0, 0.25, 0.5, 1.0]);
//! assert_eq!(grid.nfe(), 3);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{Result, RpbError};

/// Node locations of one discretized coordinate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grid {
    points: Vec<f64>,
}

impl Grid {
    /// Uniform grid with `nfe` elements.
    pub fn uniform(nfe: usize) -> Result<Self> {
        Self::new(nfe, &[])
    }

    /// Builds a grid from a target element count and optional explicit breakpoints.
    ///
    /// # Errors
    ///
    /// `InvalidGrid` when `nfe` is zero (fewer than two points), when a point
    /// lies outside `[0, 1]` or is not finite, or when the explicit points are
    /// not strictly increasing.
    pub fn new(nfe: usize, explicit: &[f64]) -> Result<Self> {
        if nfe == 0 {
            return Err(RpbError::InvalidGrid(
                "at least one finite element (two points) is required".into(),
            ));
        }
        for &p in explicit {
            if !p.is_finite() || !(0.0..=1.0).contains(&p) {
                return Err(RpbError::InvalidGrid(format!("point {p} lies outside [0, 1]")));
            }
        }
        if let Some(pair) = explicit.windows(2).find(|w| w[1] <= w[0]) {
            return Err(RpbError::InvalidGrid(format!(
                "points must be strictly increasing, found {} followed by {}",
                pair[0], pair[1]
            )));
        }

        if explicit.iter().all(|&p| p == 0.0 || p == 1.0) {
            let points = (0..=nfe).map(|i| i as f64 / nfe as f64).collect();
            return Ok(Grid { points });
        }

        let mut points = Vec::with_capacity(explicit.len().max(nfe) + 2);
        points.push(0.0);
        points.extend(explicit.iter().copied().filter(|&p| p > 0.0 && p < 1.0));
        points.push(1.0);

        while points.len() - 1 < nfe {
            // Bisect the widest element; ties go to the one nearest z = 0.
            let mut widest = 0;
            let mut width = 0.0;
            for (i, w) in points.windows(2).enumerate() {
                if w[1] - w[0] > width {
                    width = w[1] - w[0];
                    widest = i;
                }
            }
            let mid = 0.5 * (points[widest] + points[widest + 1]);
            points.insert(widest + 1, mid);
        }

        Ok(Grid { points })
    }

    /// Axial grid refined geometrically toward both ends of the bed.
    pub fn boundary_refined_axial(nfe: usize) -> Result<Self> {
        let head = geomspace(0.01, 0.5, 9);
        let mut explicit: Vec<f64> = head[..head.len() - 1].to_vec();
        explicit.extend(head.iter().rev().map(|p| 1.0 - p));
        Self::new(nfe, &explicit)
    }

    /// Rotational grid refined geometrically toward the solid inlet (`o = 0`).
    pub fn boundary_refined_rotational(nfe: usize) -> Result<Self> {
        let mut explicit = geomspace(0.005, 0.1, 8);
        explicit.extend(linspace(0.1, 0.995, 10).into_iter().skip(1));
        Self::new(nfe, &explicit)
    }

    /// Node locations.
    pub fn points(&self) -> &[f64] {
        &self.points
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Always false; a valid grid has at least two nodes.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Number of finite elements.
    pub fn nfe(&self) -> usize {
        self.points.len() - 1
    }

    /// Width of the element ending at node `i` (zero for the first node).
    pub fn width_before(&self, i: usize) -> f64 {
        if i == 0 {
            0.0
        } else {
            self.points[i] - self.points[i - 1]
        }
    }
}

/// `n` points spaced evenly on a log scale, endpoints included.
pub fn geomspace(start: f64, stop: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let ratio = (stop / start).powf(1.0 / (n - 1) as f64);
            let mut out: Vec<f64> = (0..n).map(|i| start * ratio.powi(i as i32)).collect();
            out[n - 1] = stop;
            out
        }
    }
}

/// `n` evenly spaced points, endpoints included.
pub fn linspace(start: f64, stop: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (n - 1) as f64;
            let mut out: Vec<f64> = (0..n).map(|i| start + step * i as f64).collect();
            out[n - 1] = stop;
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_uniform_grid() {
        let grid = Grid::uniform(10).unwrap();
        assert_eq!(grid.len(), 11);
        assert_eq!(grid.points()[0], 0.0);
        assert_eq!(grid.points()[10], 1.0);
        assert_relative_eq!(grid.width_before(3), 0.1, epsilon = 1e-12);
        assert_eq!(grid.width_before(0), 0.0);
    }

    #[test]
    fn test_zero_elements_rejected() {
        assert!(matches!(Grid::uniform(0), Err(RpbError::InvalidGrid(_))));
    }

    #[test]
    fn test_out_of_range_rejected() {
        assert!(matches!(Grid::new(4, &[0.2, 1.5]), Err(RpbError::InvalidGrid(_))));
        assert!(matches!(Grid::new(4, &[-0.1]), Err(RpbError::InvalidGrid(_))));
        assert!(matches!(Grid::new(4, &[f64::NAN]), Err(RpbError::InvalidGrid(_))));
    }

    #[test]
    fn test_non_monotonic_rejected() {
        assert!(matches!(Grid::new(4, &[0.5, 0.3]), Err(RpbError::InvalidGrid(_))));
        assert!(matches!(Grid::new(4, &[0.3, 0.3]), Err(RpbError::InvalidGrid(_))));
    }

    #[test]
    fn test_explicit_points_kept_when_more_than_nfe() {
        let grid = Grid::new(2, &[0.1, 0.2, 0.3, 0.9]).unwrap();
        assert_eq!(grid.points(), &[0.0, 0.1, 0.2, 0.3, 0.9, 1.0]);
    }

    #[test]
    fn test_endpoints_in_explicit_list_are_merged() {
        let grid = Grid::new(3, &[0.0, 0.5, 1.0]).unwrap();
        assert_eq!(grid.points(), &[0.0, 0.25, 0.5, 1.0]);
    }

    #[test]
    fn test_boundary_refined_axial_matches_driver_layout() {
        let grid = Grid::boundary_refined_axial(20).unwrap();
        assert_eq!(grid.nfe(), 20);
        assert_relative_eq!(grid.points()[1], 0.01, epsilon = 1e-12);
        assert_relative_eq!(grid.points()[grid.len() - 2], 0.99, epsilon = 1e-12);
        assert!(grid.points().contains(&0.5));
    }

    #[test]
    fn test_boundary_refined_rotational() {
        let grid = Grid::boundary_refined_rotational(20).unwrap();
        assert_eq!(grid.nfe(), 20);
        assert_relative_eq!(grid.points()[1], 0.005, epsilon = 1e-12);
        assert!(grid.points().windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn test_geomspace_and_linspace() {
        let g = geomspace(0.01, 0.5, 9);
        assert_eq!(g.len(), 9);
        assert_relative_eq!(g[0], 0.01);
        assert_eq!(g[8], 0.5);
        assert_relative_eq!(g[1] / g[0], g[5] / g[4], epsilon = 1e-12);

        let l = linspace(0.1, 0.995, 10);
        assert_relative_eq!(l[1] - l[0], 0.0994444444444, epsilon = 1e-10);
        assert_eq!(l[9], 0.995);
    }
}
