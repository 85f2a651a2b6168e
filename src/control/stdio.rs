//! Line-oriented JSON output for the control plane.
//!
//! Stdout carries one JSON object per line and nothing else; logs go to
//! stderr. Lines end in a bare `\n` on every platform, so `println!` is not
//! used.

use std::io::{self, Write};

use serde::Serialize;

use crate::error::Result;

/// Write `line` plus `\n` and flush, so a supervisor never sees half a line.
pub fn write_line<W: Write>(out: &mut W, line: &str) -> io::Result<()> {
    out.write_all(line.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()
}

/// Serialize `value` as one JSON line.
pub fn write_json_line<W: Write, T: Serialize>(out: &mut W, value: &T) -> Result<()> {
    let json = serde_json::to_string(value)?;
    write_line(out, &json)?;
    Ok(())
}

/// [`write_json_line`] to the locked process stdout.
pub fn write_stdout_json<T: Serialize>(value: &T) -> Result<()> {
    write_json_line(&mut io::stdout().lock(), value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Probe {
        value: i32,
        name: &'static str,
    }

    #[test]
    fn test_json_line_is_terminated_once() {
        let mut out = Vec::new();
        write_json_line(&mut out, &Probe { value: 42, name: "a\nb" }).unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.ends_with('\n'));
        assert_eq!(text.matches('\n').count(), 1);
        assert!(!text.contains('\r'));
    }

    #[test]
    fn test_consecutive_lines_parse_independently() {
        let mut out = Vec::new();
        write_json_line(&mut out, &Probe { value: 1, name: "x" }).unwrap();
        write_json_line(&mut out, &Probe { value: 2, name: "y" }).unwrap();

        let values: Vec<serde_json::Value> = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(values.len(), 2);
        assert_eq!(values[1]["value"], 2);
    }
}
