//! Polygon output types.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// An integer pixel coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl FromStr for Point {
    type Err = String;

    /// Parse `x,y`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (x, y) = s
            .split_once(',')
            .ok_or_else(|| format!("expected 'x,y', got '{}'", s))?;
        let x = x
            .trim()
            .parse()
            .map_err(|_| format!("invalid x coordinate in '{}'", s))?;
        let y = y
            .trim()
            .parse()
            .map_err(|_| format!("invalid y coordinate in '{}'", s))?;
        Ok(Self { x, y })
    }
}

/// One traced region boundary.
///
/// Vertices are kept in the order the worker produced them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Polygon {
    pub vertices: Vec<Point>,
}

impl Polygon {
    pub fn new(vertices: Vec<Point>) -> Self {
        Self { vertices }
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    /// Split into parallel coordinate lists, the worker's output layout.
    pub fn to_coordinate_lists(&self) -> (Vec<i64>, Vec<i64>) {
        self.vertices
            .iter()
            .map(|p| (i64::from(p.x), i64::from(p.y)))
            .unzip()
    }
}

impl fmt::Display for Polygon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, p) in self.vertices.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{},{}", p.x, p.y)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_from_str() {
        assert_eq!("3,4".parse::<Point>().unwrap(), Point::new(3, 4));
        assert_eq!(" -1 , 9 ".parse::<Point>().unwrap(), Point::new(-1, 9));
        assert!("3".parse::<Point>().is_err());
        assert!("a,4".parse::<Point>().is_err());
    }

    #[test]
    fn test_polygon_display_keeps_order() {
        let poly = Polygon::new(vec![Point::new(2, 1), Point::new(0, 0), Point::new(1, 5)]);
        assert_eq!(poly.to_string(), "2,1 0,0 1,5");
        let (xs, ys) = poly.to_coordinate_lists();
        assert_eq!(xs, vec![2, 0, 1]);
        assert_eq!(ys, vec![1, 0, 5]);
    }
}
