use crate::{common::*, Point};

/// Convex polygon with vertices stored in counter-clockwise order.
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon<T> {
    vertices: Vec<Point<T>>,
}

impl<T> Polygon<T>
where
    T: Float,
{
    /// Builds a polygon from a vertex loop of either winding. The vertices
    /// are normalized to counter-clockwise order.
    pub fn try_new(vertices: Vec<Point<T>>) -> Result<Self> {
        ensure!(
            vertices.len() >= 3,
            "a polygon takes at least 3 vertices, found {}",
            vertices.len()
        );
        let mut vertices = vertices;
        if signed_area(&vertices) < T::zero() {
            vertices.reverse();
        }
        Ok(Self { vertices })
    }

    pub fn new(vertices: Vec<Point<T>>) -> Self {
        Self::try_new(vertices).unwrap()
    }

    pub fn vertices(&self) -> &[Point<T>] {
        &self.vertices
    }

    pub fn area(&self) -> T {
        signed_area(&self.vertices).abs()
    }

    /// Clips `self` against the edges of `other` (Sutherland-Hodgman).
    /// Returns `None` when the clipped region is empty or degenerate.
    pub fn intersection(&self, other: &Self) -> Option<Self> {
        let mut output = self.vertices.clone();

        let clip = &other.vertices;
        let num_edges = clip.len();

        for index in 0..num_edges {
            let edge_start = clip[index];
            let edge_end = clip[(index + 1) % num_edges];

            let input = mem::take(&mut output);
            if input.is_empty() {
                break;
            }

            let num_input = input.len();
            for jndex in 0..num_input {
                let curr = input[jndex];
                let next = input[(jndex + 1) % num_input];

                // a point is inside when it lies on the left of the
                // counter-clockwise clip edge
                let curr_inside = edge_start.cross(&edge_end, &curr) >= T::zero();
                let next_inside = edge_start.cross(&edge_end, &next) >= T::zero();

                if curr_inside {
                    output.push(curr);
                    if !next_inside {
                        output.push(line_intersection(edge_start, edge_end, curr, next));
                    }
                } else if next_inside {
                    output.push(line_intersection(edge_start, edge_end, curr, next));
                }
            }
        }

        if output.len() >= 3 {
            Some(Self { vertices: output })
        } else {
            None
        }
    }

    pub fn intersection_area(&self, other: &Self) -> T {
        self.intersection(other)
            .map(|polygon| polygon.area())
            .unwrap_or_else(T::zero)
    }

    pub fn iou_with(&self, other: &Self) -> T {
        self.iou_with_areas(other, self.area(), other.area())
    }

    /// IoU where the caller supplies precomputed areas.
    pub fn iou_with_areas(&self, other: &Self, self_area: T, other_area: T) -> T {
        let epsilon = T::from(crate::EPSILON).unwrap();
        let intersection = self.intersection_area(other);
        let union = self_area + other_area - intersection + epsilon;
        intersection / union
    }
}

fn signed_area<T>(vertices: &[Point<T>]) -> T
where
    T: Float,
{
    let two = T::one() + T::one();
    let num_vertices = vertices.len();
    let sum = (0..num_vertices).fold(T::zero(), |sum, index| {
        let curr = vertices[index];
        let next = vertices[(index + 1) % num_vertices];
        sum + (curr.x * next.y - next.x * curr.y)
    });
    sum / two
}

fn line_intersection<T>(a: Point<T>, b: Point<T>, p: Point<T>, q: Point<T>) -> Point<T>
where
    T: Float,
{
    let a1 = b.y - a.y;
    let b1 = a.x - b.x;
    let c1 = a1 * a.x + b1 * a.y;

    let a2 = q.y - p.y;
    let b2 = p.x - q.x;
    let c2 = a2 * p.x + b2 * p.y;

    let det = a1 * b2 - a2 * b1;
    if det == T::zero() {
        // parallel edges, the segment endpoint is as good as any
        return p;
    }

    Point {
        x: (b2 * c1 - b1 * c2) / det,
        y: (a1 * c2 - a2 * c1) / det,
    }
}
