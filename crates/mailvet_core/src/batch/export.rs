//! Batch result export
//!
//! CSV columns, in order: `Email, Valid, Format Valid, MX Records,
//! Disposable, SMTP Check, Role Account, Catch All, Spam Trap, Suggestion`.
//! Booleans are literal `true`/`false`; the suggestion is double-quoted and
//! empty when absent.

use serde::{Deserialize, Serialize};

use crate::model::VerificationResult;

/// Export format for batch results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Csv,
}

const CSV_HEADER: &str =
    "Email,Valid,Format Valid,MX Records,Disposable,SMTP Check,Role Account,Catch All,Spam Trap,Suggestion";

/// Render result rows in the requested format. One CSV row per result, so
/// the row count always equals the processed count.
pub fn render(rows: &[VerificationResult], format: ExportFormat) -> String {
    match format {
        ExportFormat::Json => serde_json::to_string_pretty(rows).unwrap_or_else(|_| "[]".into()),
        ExportFormat::Csv => {
            let mut out = String::with_capacity(64 * (rows.len() + 1));
            out.push_str(CSV_HEADER);
            out.push('\n');
            for row in rows {
                out.push_str(&csv_row(row));
                out.push('\n');
            }
            out
        }
    }
}

fn csv_row(row: &VerificationResult) -> String {
    format!(
        "{},{},{},{},{},{},{},{},{},{}",
        csv_field(&row.email),
        row.is_valid,
        row.format_valid,
        row.has_mx,
        row.is_disposable,
        row.smtp_ok,
        row.is_role_account,
        row.is_catch_all,
        row.is_spam_trap,
        row.suggestion
            .as_deref()
            .map(|s| format!("\"{}\"", s.replace('"', "\"\"")))
            .unwrap_or_default(),
    )
}

/// Quote a field only when it would break the row.
fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
