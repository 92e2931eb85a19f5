//! Line protocol encoding of batches.
//!
//! ```text
//! <measurement>[,<tag_key>=<tag_value>...] <field_key>=<field_value>[,...] <timestamp>
//! ```
//!
//! Measurements escape `,` and space. Tag keys, tag values and field keys
//! escape `,`, `=` and space. Floats are written so that they always parse back
//! as floats, integers carry an `i` suffix and timestamps are nanoseconds.

use std::fmt::Write as _;

use bytes::Bytes;

use crate::point::{Batch, DataPoint, FieldValue};

fn escape_into(buf: &mut String, s: &str, special: &[char]) {
    for c in s.chars() {
        if c == '\\' || special.contains(&c) {
            buf.push('\\');
        }
        buf.push(c);
    }
}

#[allow(clippy::float_cmp)]
fn write_value(buf: &mut String, value: FieldValue) {
    match value {
        FieldValue::Float(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 => {
            // Integral floats would otherwise print without a decimal point
            // and be read back as integers by the store.
            let _ = write!(buf, "{f:.1}");
        }
        FieldValue::Float(f) => {
            let _ = write!(buf, "{f}");
        }
        FieldValue::Integer(i) => {
            let _ = write!(buf, "{i}i");
        }
    }
}

/// Append the line protocol form of `point`, including a trailing newline.
pub fn encode_point(buf: &mut String, point: &DataPoint) {
    escape_into(buf, &point.measurement, &[',', ' ']);
    for (k, v) in point.tags.iter() {
        buf.push(',');
        escape_into(buf, k, &[',', '=', ' ']);
        buf.push('=');
        escape_into(buf, v, &[',', '=', ' ']);
    }
    buf.push(' ');
    for (i, (name, value)) in point.fields.iter().enumerate() {
        if i > 0 {
            buf.push(',');
        }
        escape_into(buf, name, &[',', '=', ' ']);
        buf.push('=');
        write_value(buf, *value);
    }
    let _ = writeln!(buf, " {}", point.timestamp);
}

/// Encode a whole batch, one line per point.
#[must_use]
pub fn encode_batch(batch: &Batch) -> Bytes {
    // Rough per-line estimate, avoids most reallocations for default tag sets.
    let mut buf = String::with_capacity(batch.len() * 128);
    for point in &batch.points {
        encode_point(&mut buf, point);
    }
    Bytes::from(buf)
}
