//! JSON output for polygons.

use std::io::{self, Write};

use serde::Serialize;

use crate::geometry::Polygon;

#[derive(Serialize)]
struct PolygonJson {
    x: Vec<i64>,
    y: Vec<i64>,
}

/// Write polygons as a JSON array of `{"x": [...], "y": [...]}` objects.
pub fn write_json<W: Write>(out: &mut W, polygons: &[Polygon]) -> io::Result<()> {
    let rows: Vec<PolygonJson> = polygons
        .iter()
        .map(|p| {
            let (x, y) = p.to_coordinate_lists();
            PolygonJson { x, y }
        })
        .collect();
    serde_json::to_writer_pretty(&mut *out, &rows)?;
    writeln!(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Point;

    #[test]
    fn test_write_json_empty() {
        let mut buf = Vec::new();
        write_json(&mut buf, &[]).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap().trim(), "[]");
    }

    #[test]
    fn test_write_json_keeps_vertex_order() {
        let polygon = Polygon::new(vec![Point::new(3, 1), Point::new(0, 2)]);
        let mut buf = Vec::new();
        write_json(&mut buf, &[polygon]).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(parsed[0]["x"], serde_json::json!([3, 0]));
        assert_eq!(parsed[0]["y"], serde_json::json!([1, 2]));
    }
}
