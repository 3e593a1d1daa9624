//! Reference implementation of the worker's contour extraction.
//!
//! The Python helper shipped in the bootstrap script and this module must
//! produce identical vertex lists for the same mask:
//!
//! - components use 8-connectivity and are ordered by their first pixel in
//!   row-major order;
//! - tracing starts at that first pixel and follows the Moore neighbourhood
//!   counter-clockwise (E, NE, N, NW, W, SW, S, SE with y pointing down);
//! - each step scans from just past the reverse of the arrival direction and
//!   moves to the first neighbour that belongs to the component and touches
//!   its outside (or the image edge);
//! - the walk ends back at the start, at a dead end, or after as many steps
//!   as the component has pixels.

use std::collections::VecDeque;

use crate::geometry::{Point, Polygon};

/// Components smaller than this are dropped.
pub const DEFAULT_MIN_CONTOUR_SIZE: usize = 3;

/// Moore neighbourhood, counter-clockwise starting east.
pub const DIRECTIONS: [(i64, i64); 8] = [
    (1, 0),
    (1, -1),
    (0, -1),
    (-1, -1),
    (-1, 0),
    (-1, 1),
    (0, 1),
    (1, 1),
];

/// Arrival direction assumed at the start pixel.
const INITIAL_ARRIVAL: usize = 0;

/// A row-major boolean mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryMask {
    width: usize,
    height: usize,
    data: Vec<bool>,
}

impl BinaryMask {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![false; width * height],
        }
    }

    pub fn from_fn(width: usize, height: usize, f: impl Fn(usize, usize) -> bool) -> Self {
        let mut mask = Self::new(width, height);
        for y in 0..height {
            for x in 0..width {
                mask.data[y * width + x] = f(x, y);
            }
        }
        mask
    }

    /// Parse rows of `#` (foreground) and `.` (background).
    pub fn from_rows(rows: &[&str]) -> Self {
        let height = rows.len();
        let width = rows.first().map_or(0, |r| r.len());
        Self::from_fn(width, height, |x, y| rows[y].as_bytes().get(x) == Some(&b'#'))
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn get(&self, x: i64, y: i64) -> bool {
        self.index(x, y).is_some_and(|i| self.data[i])
    }

    pub fn set(&mut self, x: usize, y: usize, value: bool) {
        if x < self.width && y < self.height {
            self.data[y * self.width + x] = value;
        }
    }

    pub fn count(&self) -> usize {
        self.data.iter().filter(|v| **v).count()
    }

    fn index(&self, x: i64, y: i64) -> Option<usize> {
        let (x, y) = (usize::try_from(x).ok()?, usize::try_from(y).ok()?);
        (x < self.width && y < self.height).then(|| y * self.width + x)
    }
}

/// One connected component: its label in the label grid, first pixel, size.
struct Component {
    label: u32,
    start: (i64, i64),
    size: usize,
}

/// Label 8-connected components in order of their first row-major pixel.
fn label_components(mask: &BinaryMask) -> (Vec<u32>, Vec<Component>) {
    let mut labels = vec![0u32; mask.data.len()];
    let mut components = Vec::new();
    let mut queue = VecDeque::new();

    for start in 0..mask.data.len() {
        if !mask.data[start] || labels[start] != 0 {
            continue;
        }
        let label = components.len() as u32 + 1;
        labels[start] = label;
        queue.push_back(start);
        let mut size = 0;

        while let Some(i) = queue.pop_front() {
            size += 1;
            let (x, y) = ((i % mask.width) as i64, (i / mask.width) as i64);
            for (dx, dy) in DIRECTIONS {
                if let Some(j) = mask.index(x + dx, y + dy)
                    && mask.data[j]
                    && labels[j] == 0
                {
                    labels[j] = label;
                    queue.push_back(j);
                }
            }
        }

        components.push(Component {
            label,
            start: ((start % mask.width) as i64, (start / mask.width) as i64),
            size,
        });
    }

    (labels, components)
}

struct Tracer<'a> {
    mask: &'a BinaryMask,
    labels: &'a [u32],
    label: u32,
}

impl Tracer<'_> {
    fn inside(&self, x: i64, y: i64) -> bool {
        self.mask
            .index(x, y)
            .is_some_and(|i| self.labels[i] == self.label)
    }

    fn is_boundary(&self, x: i64, y: i64) -> bool {
        let (w, h) = (self.mask.width as i64, self.mask.height as i64);
        if x == 0 || y == 0 || x == w - 1 || y == h - 1 {
            return true;
        }
        !(self.inside(x, y - 1)
            && self.inside(x, y + 1)
            && self.inside(x - 1, y)
            && self.inside(x + 1, y))
    }

    fn trace(&self, start: (i64, i64), limit: usize) -> Polygon {
        let mut vertices = vec![Point::new(start.0 as i32, start.1 as i32)];
        let (mut x, mut y) = start;
        let mut arrival = INITIAL_ARRIVAL;

        for _ in 0..limit {
            let step = (0..8).map(|i| (arrival + 5 + i) % 8).find(|&d| {
                let (nx, ny) = (x + DIRECTIONS[d].0, y + DIRECTIONS[d].1);
                self.inside(nx, ny) && self.is_boundary(nx, ny)
            });
            let Some(d) = step else { break };

            x += DIRECTIONS[d].0;
            y += DIRECTIONS[d].1;
            arrival = d;
            if (x, y) == start {
                break;
            }
            vertices.push(Point::new(x as i32, y as i32));
        }

        Polygon::new(vertices)
    }
}

/// Trace every component of `mask` with at least `min_size` pixels.
pub fn extract_polygons(mask: &BinaryMask, min_size: usize) -> Vec<Polygon> {
    let (labels, components) = label_components(mask);
    components
        .iter()
        .filter(|c| c.size >= min_size)
        .map(|c| {
            Tracer {
                mask,
                labels: &labels,
                label: c.label,
            }
            .trace(c.start, c.size)
        })
        .collect()
}
