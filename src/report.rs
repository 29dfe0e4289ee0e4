//! CSV export and the status summary.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::io::Write;

use crate::checkpoint::Lease;
use crate::formatting::{format_percent, truncate_str};
use crate::model::{Checkpoint, ClassificationRecord, FailureKind};

const FIXED_COLUMNS: [&str; 5] = ["repository", "synopsis", "stars", "language", "pushed_at"];

/// Quote a field when it contains a delimiter, quote or line break
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn write_row<W: Write>(out: &mut W, fields: &[String]) -> Result<()> {
    let line = fields.iter().map(|f| csv_field(f)).collect::<Vec<_>>().join(",");
    out.write_all(line.as_bytes())?;
    out.write_all(b"\r\n")?;
    Ok(())
}

/// One row per record, two columns (label, confidence) per dimension
pub fn write_csv<W: Write>(out: &mut W, dimensions: &[&str], records: &[ClassificationRecord]) -> Result<usize> {
    let mut header: Vec<String> = FIXED_COLUMNS.iter().map(|c| c.to_string()).collect();
    for dim in dimensions {
        header.push(dim.to_string());
        header.push(format!("{}_confidence", dim));
    }
    write_row(out, &header)?;

    for record in records {
        let mut row = vec![
            record.id.clone(),
            record.synopsis.clone(),
            record.stars.to_string(),
            record.language.clone().unwrap_or_default(),
            record
                .pushed_at
                .map(|t| t.format("%Y-%m-%d").to_string())
                .unwrap_or_default(),
        ];
        for dim in dimensions {
            match record.dimension(dim) {
                Some(result) => {
                    row.push(result.labels().collect::<Vec<_>>().join("; "));
                    row.push(format!("{:.3}", result.primary_confidence));
                }
                None => {
                    row.push(String::new());
                    row.push(String::new());
                }
            }
        }
        write_row(out, &row)?;
    }

    out.flush()?;
    Ok(records.len())
}

/// Everything the `status` command shows for one collection
pub struct StatusView<'a> {
    pub collection: &'a str,
    pub checkpoint: Option<&'a Checkpoint>,
    pub lease: Option<&'a Lease>,
    pub results: usize,
    pub now: DateTime<Utc>,
}

impl StatusView<'_> {
    /// Plain lines, no colour
    pub fn render(&self) -> Vec<String> {
        let mut lines = vec![format!("collection:  {}", self.collection)];

        let Some(cp) = self.checkpoint else {
            lines.push("state:       not started".to_string());
            lines.push(format!("results:     {}", self.results));
            return lines;
        };

        let permanent: Vec<_> = cp.permanent_failures().collect();
        let not_found = permanent.iter().filter(|(_, f)| f.kind == FailureKind::NotFound).count();
        let retrying = cp.failed_ids.values().filter(|f| !f.permanent).count();

        lines.push(format!("work list:   {} ({} repos)", cp.work_list_id, cp.total_count));
        lines.push(format!(
            "completed:   {}/{} ({})",
            cp.completed_ids.len(),
            cp.total_count,
            format_percent(cp.completed_ids.len(), cp.total_count)
        ));
        lines.push(format!(
            "failed:      {} permanent ({} not found), {} awaiting retry",
            permanent.len(),
            not_found,
            retrying
        ));
        lines.push(format!("pending:     {}", cp.pending_count()));
        lines.push(format!("results:     {}", self.results));
        lines.push(format!("updated:     {}", cp.updated_at.format("%Y-%m-%d %H:%M:%S UTC")));

        if let Some(until) = cp.throttled_until.filter(|t| *t > self.now) {
            lines.push(format!("throttled:   until {}", until.format("%H:%M:%S UTC")));
        }

        match self.lease {
            Some(lease) if !lease.is_expired(self.now) => {
                lines.push(format!("running:     {} (lease until {})", lease.holder, lease.expires_at.format("%H:%M:%S UTC")));
            }
            Some(lease) => lines.push(format!("running:     no (stale lease from {})", lease.holder)),
            None => lines.push("running:     no".to_string()),
        }

        for (id, failure) in permanent.iter().take(10) {
            lines.push(format!("  \u{2717} {} - {}", id, truncate_str(&failure.reason, 80)));
        }
        if permanent.len() > 10 {
            lines.push(format!("  ... and {} more", permanent.len() - 10));
        }

        lines
    }
}
