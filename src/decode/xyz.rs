//! Plain-text point decoder
//!
//! One point per line: whitespace-separated `x y [z ...]`. Blank lines and
//! `#` comments are skipped; trailing columns beyond z are ignored. This is
//! the reference decoder — richer formats arrive through the same trait.

use super::{Decoder, PointSink};
use crate::error::{IndexError, Result};
use crate::types::Schema;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::sync::Arc;

pub struct XyzDecoder {
    path: String,
    schema: Arc<Schema>,
}

impl XyzDecoder {
    pub fn new(path: &str, schema: Arc<Schema>) -> Self {
        Self {
            path: path.to_string(),
            schema,
        }
    }
}

impl Decoder for XyzDecoder {
    fn execute(&mut self, sink: &mut PointSink<'_>) -> Result<()> {
        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);

        let x_dim = self
            .schema
            .find_dim("X")
            .ok_or_else(|| IndexError::Decode("schema has no X".into()))?;
        let y_dim = self
            .schema
            .find_dim("Y")
            .ok_or_else(|| IndexError::Decode("schema has no Y".into()))?;
        let z_dim = self.schema.find_dim("Z");

        let empty = self.schema.empty_point();
        let mut record = empty.clone();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let mut fields = trimmed.split_whitespace();
            let x = parse_field(fields.next(), &self.path, line_no)?;
            let y = parse_field(fields.next(), &self.path, line_no)?;
            let z = match fields.next() {
                Some(field) => field.parse::<f64>().map_err(|_| {
                    IndexError::Decode(format!(
                        "{}:{}: bad coordinate '{}'",
                        self.path,
                        line_no + 1,
                        field
                    ))
                })?,
                None => 0.0,
            };

            record.copy_from_slice(&empty);
            self.schema.write_f64(&mut record, x_dim, x);
            self.schema.write_f64(&mut record, y_dim, y);
            if let Some(z_dim) = z_dim {
                self.schema.write_f64(&mut record, z_dim, z);
            }
            sink.push(&record)?;
        }
        Ok(())
    }
}

fn parse_field(field: Option<&str>, path: &str, line_no: usize) -> Result<f64> {
    let field = field.ok_or_else(|| {
        IndexError::Decode(format!("{}:{}: missing coordinate", path, line_no + 1))
    })?;
    field.parse::<f64>().map_err(|_| {
        IndexError::Decode(format!(
            "{}:{}: bad coordinate '{}'",
            path,
            line_no + 1,
            field
        ))
    })
}
