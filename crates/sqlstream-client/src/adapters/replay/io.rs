use std::io::{BufRead, Write};

use serde::de::DeserializeOwned;

use crate::error::{ClientError, ClientResult};

/// Reads one JSON document per line, skipping blank lines.
pub fn read_ndjson<T: DeserializeOwned, R: BufRead>(reader: R) -> ClientResult<Vec<T>> {
    let mut out = Vec::new();
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record = serde_json::from_str(line)
            .map_err(|e| ClientError::Json(format!("line {}: {e}", n + 1)))?;
        out.push(record);
    }
    Ok(out)
}

pub struct NdjsonWriter<W: Write> {
    out: W,
}

impl<W: Write> NdjsonWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn write_json_line<T: serde::Serialize>(&mut self, v: &T) -> ClientResult<()> {
        serde_json::to_writer(&mut self.out, v)?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}
