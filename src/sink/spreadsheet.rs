use anyhow::{anyhow, Context, Result};
use rust_xlsxwriter::{Workbook, Worksheet};
use std::fs::File;
use std::path::{Path, PathBuf};

use super::RecordWriter;
use crate::record::Record;

/// Row limit of an xlsx worksheet
const MAX_ROWS: u32 = 1_048_576;
/// Column limit of an xlsx worksheet
const MAX_COLUMNS: usize = 16_384;

/// Single-sheet workbook. Cells go straight into the worksheet as rows
/// arrive; the xlsx container itself is only written on close.
pub(crate) struct SpreadsheetWriter {
    path: PathBuf,
    worksheet: Worksheet,
    next_row: u32,
}

impl SpreadsheetWriter {
    pub fn create(path: &Path, sheet: &str) -> Result<Self> {
        let mut worksheet = Worksheet::new();
        worksheet
            .set_name(sheet)
            .map_err(|e| anyhow!("invalid sheet name '{}': {}", sheet, e))?;
        File::create(path).with_context(|| format!("cannot create {}", path.display()))?;

        Ok(Self {
            path: path.to_path_buf(),
            worksheet,
            next_row: 0,
        })
    }

    fn push_row(&mut self, row: &[String]) -> Result<()> {
        if self.next_row >= MAX_ROWS {
            return Err(anyhow!(
                "sheet '{}' is full ({} rows)",
                self.worksheet.name(),
                MAX_ROWS
            ));
        }
        if row.len() > MAX_COLUMNS {
            return Err(anyhow!(
                "row has {} columns, sheets hold at most {}",
                row.len(),
                MAX_COLUMNS
            ));
        }

        for (col_idx, value) in row.iter().enumerate() {
            self.worksheet
                .write_string(self.next_row, u16::try_from(col_idx)?, value)?;
        }
        self.next_row += 1;
        Ok(())
    }
}

impl RecordWriter for SpreadsheetWriter {
    fn write_record(&mut self, header: Option<&[String]>, record: &Record) -> Result<()> {
        if let Some(header) = header {
            self.push_row(header)?;
        }
        self.push_row(record.fields())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn finish(self) -> Result<()> {
        let mut workbook = Workbook::new();
        workbook.push_worksheet(self.worksheet);
        workbook
            .save(&self.path)
            .with_context(|| format!("cannot save {}", self.path.display()))?;
        Ok(())
    }
}
