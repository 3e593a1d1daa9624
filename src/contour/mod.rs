//! Turning worker contour output into polygons.

mod trace;

pub use trace::{BinaryMask, DEFAULT_MIN_CONTOUR_SIZE, DIRECTIONS, extract_polygons};

use crate::bridge::{Outputs, Value};
use crate::error::{BridgeError, Result};
use crate::geometry::{Point, Polygon};

/// Output key holding one x-coordinate list per polygon.
pub const CONTOURS_X: &str = "contours_x";
/// Output key holding one y-coordinate list per polygon.
pub const CONTOURS_Y: &str = "contours_y";

fn rows<'a>(outputs: &'a Outputs, key: &str) -> Result<&'a [Value]> {
    let value = outputs
        .get(key)
        .ok_or_else(|| BridgeError::Protocol(format!("worker output is missing '{}'", key)))?;
    value.as_rows().ok_or_else(|| {
        BridgeError::Protocol(format!(
            "'{}' must be a list of coordinate lists, got {}",
            key,
            value.kind()
        ))
    })
}

fn coordinates(key: &str, index: usize, row: &Value) -> Result<Vec<i32>> {
    let values = row.as_integers().ok_or_else(|| {
        BridgeError::Protocol(format!(
            "'{}'[{}] must contain integer coordinates, got {}",
            key,
            index,
            row.kind()
        ))
    })?;
    values
        .into_iter()
        .map(|v| {
            i32::try_from(v).map_err(|_| {
                BridgeError::Protocol(format!("'{}'[{}] coordinate {} out of range", key, index, v))
            })
        })
        .collect()
}

/// Zip `contours_x[i]` with `contours_y[i]` into polygon `i`.
///
/// Vertex order is kept exactly as produced by the worker.
pub fn decode(outputs: &Outputs) -> Result<Vec<Polygon>> {
    let xs = rows(outputs, CONTOURS_X)?;
    let ys = rows(outputs, CONTOURS_Y)?;
    if xs.len() != ys.len() {
        return Err(BridgeError::Protocol(format!(
            "worker returned {} x-lists but {} y-lists",
            xs.len(),
            ys.len()
        )));
    }

    xs.iter()
        .zip(ys)
        .enumerate()
        .map(|(i, (x_row, y_row))| {
            let x = coordinates(CONTOURS_X, i, x_row)?;
            let y = coordinates(CONTOURS_Y, i, y_row)?;
            if x.len() != y.len() {
                return Err(BridgeError::Protocol(format!(
                    "polygon {} has {} x-coordinates but {} y-coordinates",
                    i,
                    x.len(),
                    y.len()
                )));
            }
            Ok(Polygon::new(
                x.into_iter().zip(y).map(|(x, y)| Point::new(x, y)).collect(),
            ))
        })
        .collect()
}

/// Build the worker output layout for `polygons`.
pub fn encode(polygons: &[Polygon]) -> Outputs {
    let (xs, ys): (Vec<Value>, Vec<Value>) = polygons
        .iter()
        .map(|p| {
            let (x, y) = p.to_coordinate_lists();
            (Value::IntList(x), Value::IntList(y))
        })
        .unzip();
    let mut outputs = Outputs::new();
    outputs.insert(CONTOURS_X.to_string(), Value::NestedList(xs));
    outputs.insert(CONTOURS_Y.to_string(), Value::NestedList(ys));
    outputs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outputs(json: &str) -> Outputs {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_decode_preserves_vertex_order() {
        let out = outputs(r#"{"contours_x": [[3, 1, 2], [9]], "contours_y": [[0, 5, 4], [8]]}"#);
        let polygons = decode(&out).unwrap();
        assert_eq!(polygons.len(), 2);
        assert_eq!(
            polygons[0].vertices,
            vec![Point::new(3, 0), Point::new(1, 5), Point::new(2, 4)]
        );
        assert_eq!(polygons[1].vertices, vec![Point::new(9, 8)]);
    }

    #[test]
    fn test_decode_empty_is_valid() {
        let out = outputs(r#"{"contours_x": [], "contours_y": []}"#);
        assert!(decode(&out).unwrap().is_empty());
    }

    #[test]
    fn test_decode_integral_floats() {
        let out = outputs(r#"{"contours_x": [[1.0, 2.0]], "contours_y": [[3.0, 4.0]]}"#);
        assert_eq!(decode(&out).unwrap()[0].len(), 2);
    }

    #[test]
    fn test_decode_errors() {
        let cases = [
            r#"{"contours_x": [[1]]}"#,
            r#"{"contours_x": [[1], [2]], "contours_y": [[1]]}"#,
            r#"{"contours_x": [[1, 2]], "contours_y": [[1]]}"#,
            r#"{"contours_x": [[1.5]], "contours_y": [[1]]}"#,
            r#"{"contours_x": [["a"]], "contours_y": [[1]]}"#,
            r#"{"contours_x": 4, "contours_y": 4}"#,
            r#"{"contours_x": [[99999999999]], "contours_y": [[1]]}"#,
        ];
        for case in cases {
            assert!(
                matches!(decode(&outputs(case)), Err(BridgeError::Protocol(_))),
                "accepted {}",
                case
            );
        }
    }

    #[test]
    fn test_encode_then_decode() {
        let polygons = vec![
            Polygon::new(vec![Point::new(1, 2), Point::new(3, 4)]),
            Polygon::new(vec![]),
        ];
        assert_eq!(decode(&encode(&polygons)).unwrap(), polygons);
    }
}
