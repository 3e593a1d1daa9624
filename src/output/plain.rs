//! Plain text output for polygons.

use std::io::{self, Write};

use crate::geometry::Polygon;
use crate::theme::Themed;

/// One line per polygon: index, vertex count, then `x,y` vertices.
pub fn write_plain<W: Write>(out: &mut W, polygons: &[Polygon]) -> io::Result<()> {
    if polygons.is_empty() {
        return writeln!(out, "No polygons found.");
    }
    for (index, polygon) in polygons.iter().enumerate() {
        writeln!(
            out,
            "{}\t{}\t{}",
            format!("polygon {}", index).label(),
            polygon.len().count(),
            polygon
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Point;

    #[test]
    fn test_write_plain_empty() {
        let mut buf = Vec::new();
        write_plain(&mut buf, &[]).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "No polygons found.\n");
    }

    #[test]
    fn test_write_plain_one_line_per_polygon() {
        let polygons = vec![
            Polygon::new(vec![Point::new(1, 2), Point::new(3, 4), Point::new(5, 6)]),
            Polygon::new(vec![Point::new(0, 0)]),
        ];
        let mut buf = Vec::new();
        write_plain(&mut buf, &polygons).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.lines().next().unwrap().contains("1,2"));
    }
}
