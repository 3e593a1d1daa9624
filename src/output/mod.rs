//! Output formatting for segmentation results.

pub mod json;
pub mod plain;

use std::io::{self, Write};

use crate::geometry::Polygon;

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// One line per polygon.
    #[default]
    Plain,
    /// JSON array of polygons.
    Json,
}

/// Write `polygons` to `out` in `format`.
pub fn write_polygons<W: Write>(
    out: &mut W,
    polygons: &[Polygon],
    format: OutputFormat,
) -> io::Result<()> {
    match format {
        OutputFormat::Json => json::write_json(out, polygons),
        OutputFormat::Plain => plain::write_plain(out, polygons),
    }
}

/// Print `polygons` to stdout.
pub fn print_polygons(polygons: &[Polygon], format: OutputFormat) -> io::Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    write_polygons(&mut out, polygons, format)?;
    out.flush()
}
