//! Bowyer–Watson Delaunay triangulation over deduplicated scatter points.
//!
//! Insertion order is the input order, so the output is deterministic for
//! identical inputs. Callers are expected to have removed coincident
//! points and screened out collinear input; a degenerate set that still
//! slips through yields `None`.

use std::collections::HashMap;

/// Triangulate, returning triangles as index triples into `points`.
pub(crate) fn triangulate(points: &[(f64, f64)]) -> Option<Vec<[usize; 3]>> {
    let n = points.len();
    if n < 3 {
        return None;
    }

    let (mut min_x, mut min_y) = (f64::INFINITY, f64::INFINITY);
    let (mut max_x, mut max_y) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
    for &(x, y) in points {
        min_x = min_x.min(x);
        min_y = min_y.min(y);
        max_x = max_x.max(x);
        max_y = max_y.max(y);
    }
    let span = (max_x - min_x).max(max_y - min_y).max(1.0);
    let mid_x = (min_x + max_x) / 2.0;
    let mid_y = (min_y + max_y) / 2.0;

    // Super-triangle large enough to enclose every sample.
    let mut all: Vec<(f64, f64)> = points.to_vec();
    all.push((mid_x - 20.0 * span, mid_y - span));
    all.push((mid_x, mid_y + 20.0 * span));
    all.push((mid_x + 20.0 * span, mid_y - span));
    let super_base = n;

    let mut triangles: Vec<[usize; 3]> = vec![[super_base, super_base + 1, super_base + 2]];

    for point_index in 0..n {
        let point = all[point_index];

        let mut bad = Vec::new();
        for (t, tri) in triangles.iter().enumerate() {
            if in_circumcircle(all[tri[0]], all[tri[1]], all[tri[2]], point) {
                bad.push(t);
            }
        }
        if bad.is_empty() {
            // Numerically on the hull of everything seen so far; skipping
            // keeps the triangulation consistent rather than corrupting it.
            continue;
        }

        // Cavity boundary: edges belonging to exactly one bad triangle.
        let mut edge_counts: HashMap<(usize, usize), usize> = HashMap::new();
        for &t in &bad {
            let tri = triangles[t];
            for (a, b) in [(tri[0], tri[1]), (tri[1], tri[2]), (tri[2], tri[0])] {
                let key = (a.min(b), a.max(b));
                *edge_counts.entry(key).or_insert(0) += 1;
            }
        }

        for &t in bad.iter().rev() {
            triangles.swap_remove(t);
        }

        let mut boundary: Vec<(usize, usize)> = edge_counts
            .into_iter()
            .filter(|(_, count)| *count == 1)
            .map(|(edge, _)| edge)
            .collect();
        boundary.sort_unstable();

        for (a, b) in boundary {
            triangles.push([a, b, point_index]);
        }
    }

    triangles.retain(|tri| tri.iter().all(|&v| v < super_base));
    if triangles.is_empty() {
        return None;
    }
    Some(triangles)
}

/// True when `p` lies strictly inside the circumcircle of (a, b, c),
/// independent of the triangle's winding.
fn in_circumcircle(a: (f64, f64), b: (f64, f64), c: (f64, f64), p: (f64, f64)) -> bool {
    let (ax, ay) = (a.0 - p.0, a.1 - p.1);
    let (bx, by) = (b.0 - p.0, b.1 - p.1);
    let (cx, cy) = (c.0 - p.0, c.1 - p.1);

    let det = (ax * ax + ay * ay) * (bx * cy - cx * by)
        - (bx * bx + by * by) * (ax * cy - cx * ay)
        + (cx * cx + cy * cy) * (ax * by - bx * ay);

    let orientation =
        (b.0 - a.0) * (c.1 - a.1) - (c.0 - a.0) * (b.1 - a.1);
    if orientation >= 0.0 { det > 0.0 } else { det < 0.0 }
}

#[cfg(test)]
mod tests {
    use super::triangulate;

    #[test]
    fn square_triangulates_into_two_triangles() {
        let points = vec![(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)];
        let triangles = triangulate(&points).expect("triangulation");
        assert_eq!(triangles.len(), 2);
        for tri in &triangles {
            assert!(tri.iter().all(|&v| v < points.len()));
        }
    }

    #[test]
    fn fewer_than_three_points_yield_none() {
        assert!(triangulate(&[(0.0, 0.0), (1.0, 1.0)]).is_none());
    }

    #[test]
    fn triangulation_is_deterministic() {
        let points = vec![
            (0.0, 0.0),
            (2.0, 0.1),
            (1.1, 1.9),
            (0.2, 1.0),
            (1.5, 0.8),
        ];
        let first = triangulate(&points).expect("triangulation");
        let second = triangulate(&points).expect("triangulation");
        assert_eq!(first, second);
    }

    #[test]
    fn interior_points_are_covered_by_some_triangle() {
        let points = vec![
            (0.0, 0.0),
            (4.0, 0.0),
            (4.0, 4.0),
            (0.0, 4.0),
            (2.0, 2.0),
        ];
        let triangles = triangulate(&points).expect("triangulation");
        // the centroid of the square must fall inside at least one triangle
        let target = (1.0, 1.0);
        let covered = triangles.iter().any(|tri| {
            let (a, b, c) = (points[tri[0]], points[tri[1]], points[tri[2]]);
            let denom = (b.1 - c.1) * (a.0 - c.0) + (c.0 - b.0) * (a.1 - c.1);
            if denom.abs() < 1e-12 {
                return false;
            }
            let w1 = ((b.1 - c.1) * (target.0 - c.0) + (c.0 - b.0) * (target.1 - c.1)) / denom;
            let w2 = ((c.1 - a.1) * (target.0 - c.0) + (a.0 - c.0) * (target.1 - c.1)) / denom;
            let w3 = 1.0 - w1 - w2;
            w1 >= -1e-9 && w2 >= -1e-9 && w3 >= -1e-9
        });
        assert!(covered);
    }
}
