use serde_json::Value;

use super::AuditRecord;
use crate::error::Result;

/// Export records as a pretty-printed JSON array.
pub fn export_json(records: &[AuditRecord]) -> Result<String> {
    Ok(serde_json::to_string_pretty(records)?)
}

/// Export records as CSV. Findings are flattened to `rule:LOCATION:count` joined by `;`.
pub fn export_csv(records: &[AuditRecord]) -> Result<String> {
    let mut output = String::from("timestamp,method,host,url,allowed,reason,findings\n");
    for record in records {
        output.push_str(&format!(
            "{},{},{},{},{},{},{}\n",
            csv_field(&record.timestamp),
            csv_field(&record.method),
            csv_field(&record.host),
            csv_field(&record.url),
            record.allowed,
            csv_field(&record.reason),
            csv_field(&summarize_findings(record)?),
        ));
    }
    Ok(output)
}

/// One-line summary of a record's findings, e.g. `email:REQUEST_BODY:2`.
pub fn summarize_findings(record: &AuditRecord) -> Result<String> {
    let mut parts = Vec::with_capacity(record.findings.len());
    for finding in &record.findings {
        let location = match serde_json::to_value(finding.location)? {
            Value::String(s) => s,
            other => other.to_string(),
        };
        parts.push(format!(
            "{}:{}:{}",
            finding.rule_name, location, finding.occurrence_count
        ));
    }
    Ok(parts.join(";"))
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
