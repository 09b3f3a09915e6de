use anyhow::{Context, Result};
use std::fs::File;
use std::io::Write;
use std::path::Path;

use super::RecordWriter;
use crate::record::Record;

/// Delimited text output (CSV with a configurable delimiter)
pub(crate) struct DelimitedWriter<W: Write> {
    out: csv::Writer<W>,
}

impl DelimitedWriter<File> {
    pub fn create(path: &Path, delimiter: u8) -> Result<Self> {
        let file =
            File::create(path).with_context(|| format!("cannot create {}", path.display()))?;
        Ok(Self::new(file, delimiter))
    }
}

impl<W: Write> DelimitedWriter<W> {
    pub fn new(out: W, delimiter: u8) -> Self {
        let out = csv::WriterBuilder::new()
            .delimiter(delimiter)
            // header and rows may differ in width when a header override is configured
            .flexible(true)
            .from_writer(out);
        Self { out }
    }
}

impl<W: Write> RecordWriter for DelimitedWriter<W> {
    fn write_record(&mut self, header: Option<&[String]>, record: &Record) -> Result<()> {
        if let Some(header) = header {
            self.out.write_record(header)?;
        }
        self.out.write_record(record.fields())?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }

    fn finish(mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}
