use std::fmt::Write;

use contour_types::{Frame, FrameValue};

use crate::error::WireError;
use crate::literal::MAX_DEPTH;

/// Renders a frame as wire text, without the frame delimiter.
///
/// Every frame whose mappings and lists nest at most [`MAX_DEPTH`] levels
/// (the frame itself being the first) encodes; deeper frames are refused so
/// that anything sent can be decoded again.
pub fn encode_frame(frame: &Frame) -> Result<String, WireError> {
    let mut out = String::with_capacity(64);
    write_entries(frame.fields(), 1, &mut out)?;
    Ok(out)
}

pub fn encode_value(value: &FrameValue) -> Result<String, WireError> {
    let mut out = String::new();
    write_value(value, 0, &mut out)?;
    Ok(out)
}

fn enter(depth: usize) -> Result<usize, WireError> {
    let depth = depth + 1;
    if depth > MAX_DEPTH {
        return Err(WireError::TooDeep { limit: MAX_DEPTH });
    }
    Ok(depth)
}

fn write_value(value: &FrameValue, depth: usize, out: &mut String) -> Result<(), WireError> {
    match value {
        FrameValue::Null => out.push_str("None"),
        FrameValue::Bool(true) => out.push_str("True"),
        FrameValue::Bool(false) => out.push_str("False"),
        FrameValue::Int(v) => {
            let _ = write!(out, "{v}");
        }
        // The literal grammar has no spelling for inf/nan.
        FrameValue::Float(v) if !v.is_finite() => out.push_str("None"),
        FrameValue::Float(v) => {
            let _ = write!(out, "{v:?}");
        }
        FrameValue::Str(s) => write_str(s, out),
        FrameValue::List(items) => {
            let depth = enter(depth)?;
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_value(item, depth, out)?;
            }
            out.push(']');
        }
        FrameValue::Map(entries) => write_entries(entries, enter(depth)?, out)?,
    }
    Ok(())
}

/// `depth` is the level of the mapping being written.
fn write_entries(
    entries: &[(String, FrameValue)],
    depth: usize,
    out: &mut String,
) -> Result<(), WireError> {
    out.push('{');
    for (i, (key, value)) in entries.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        write_str(key, out);
        out.push_str(": ");
        write_value(value, depth, out)?;
    }
    out.push('}');
    Ok(())
}

fn write_str(s: &str, out: &mut String) {
    out.push('\'');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c if c.is_control() && (c as u32) <= 0xffff => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c if c.is_control() => {
                let _ = write!(out, "\\U{:08x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('\'');
}
