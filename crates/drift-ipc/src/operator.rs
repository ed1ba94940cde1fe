//! Operator line protocol.
//!
//! The operator TCP service speaks a line-oriented text protocol:
//! multi-line payloads are framed by `211-` continuation lines and a
//! final `200`, unknown commands answer `500`, I/O failures `520`.

use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;

use crate::Result;

pub const REPLY_END: &str = "200 End of data.";
pub const REPLY_UNKNOWN: &str = "500 Command not understood.";
pub const REPLY_IO_ERROR: &str = "520 I/O error.";

/// Write a `211-` banner line.
pub fn write_banner(out: &mut impl Write, title: &str) -> Result<()> {
    writeln!(out, "211- {}", title)?;
    Ok(())
}

/// Terminate a framed payload.
pub fn write_end(out: &mut impl Write) -> Result<()> {
    writeln!(out, "{}", REPLY_END)?;
    Ok(())
}

pub fn write_unknown(out: &mut impl Write) -> Result<()> {
    writeln!(out, "{}", REPLY_UNKNOWN)?;
    Ok(())
}

pub fn write_io_error(out: &mut impl Write) -> Result<()> {
    writeln!(out, "{}", REPLY_IO_ERROR)?;
    Ok(())
}

/// Stream a file's contents framed by `211-` and `200`.
///
/// A file that cannot be opened answers `520` instead of a frame.
pub fn display_file(out: &mut impl Write, path: &Path) -> Result<()> {
    let file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(_) => {
            write_io_error(out)?;
            return Ok(());
        }
    };

    write_banner(out, &path.display().to_string())?;
    let mut reader = BufReader::new(file);
    copy_lines(&mut reader, out)?;
    write_end(out)?;
    Ok(())
}

fn copy_lines(reader: &mut impl BufRead, out: &mut impl Write) -> Result<()> {
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            return Ok(());
        }
        out.write_all(line.as_bytes())?;
        if !line.ends_with('\n') {
            out.write_all(b"\n")?;
        }
    }
}

/// Read one protocol line (command or reply), trimmed.
pub fn read_line(reader: &mut BufReader<impl Read>) -> Result<Option<String>> {
    let mut line = String::new();
    let n = reader.read_line(&mut line)?;
    if n == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end().to_string()))
}
