//! Box / polygon tests used by zone filtering

/// Axis-aligned box `[x1, y1, x2, y2]`
pub type BoundingBox = [i64; 4];

type Point = (f64, f64);

fn corners(b: &BoundingBox) -> [Point; 4] {
    let (x1, y1, x2, y2) = (b[0] as f64, b[1] as f64, b[2] as f64, b[3] as f64);
    [(x1, y1), (x2, y1), (x2, y2), (x1, y2)]
}

/// Area of a box in pixels
pub fn box_area(b: &BoundingBox) -> i64 {
    (b[2] - b[0]).max(0) * (b[3] - b[1]).max(0)
}

/// Ray-casting point-in-polygon; points on an edge count as inside
pub fn point_in_polygon(p: Point, polygon: &[Point]) -> bool {
    let n = polygon.len();
    if n < 3 {
        return false;
    }

    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let (a, b) = (polygon[i], polygon[j]);
        if on_segment(a, b, p) {
            return true;
        }
        if (a.1 > p.1) != (b.1 > p.1) {
            let x = (b.0 - a.0) * (p.1 - a.1) / (b.1 - a.1) + a.0;
            if p.0 < x {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

fn orientation(a: Point, b: Point, c: Point) -> f64 {
    (b.0 - a.0) * (c.1 - a.1) - (b.1 - a.1) * (c.0 - a.0)
}

fn on_segment(a: Point, b: Point, p: Point) -> bool {
    orientation(a, b, p) == 0.0
        && p.0 >= a.0.min(b.0)
        && p.0 <= a.0.max(b.0)
        && p.1 >= a.1.min(b.1)
        && p.1 <= a.1.max(b.1)
}

fn segments_intersect(p1: Point, p2: Point, q1: Point, q2: Point) -> bool {
    let d1 = orientation(q1, q2, p1);
    let d2 = orientation(q1, q2, p2);
    let d3 = orientation(p1, p2, q1);
    let d4 = orientation(p1, p2, q2);

    if ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
    {
        return true;
    }

    on_segment(q1, q2, p1) || on_segment(q1, q2, p2) || on_segment(p1, p2, q1) || on_segment(p1, p2, q2)
}

/// Whether a box and a polygon share any point (touching counts)
pub fn box_intersects_polygon(b: &BoundingBox, polygon: &[Point]) -> bool {
    if polygon.len() < 3 {
        return false;
    }

    let rect = corners(b);
    if rect.iter().any(|&c| point_in_polygon(c, polygon)) {
        return true;
    }
    if polygon.iter().any(|&p| point_in_polygon(p, &rect)) {
        return true;
    }

    let n = polygon.len();
    (0..4).any(|i| {
        let (r1, r2) = (rect[i], rect[(i + 1) % 4]);
        (0..n).any(|j| segments_intersect(r1, r2, polygon[j], polygon[(j + 1) % n]))
    })
}
