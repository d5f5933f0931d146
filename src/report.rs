//! Suite reports: one row per case, rendered as a table or as JSON.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CaseStatus {
    Pass,
    Fail,
    Skipped,
}

impl CaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaseStatus::Pass => "PASS",
            CaseStatus::Fail => "FAIL",
            CaseStatus::Skipped => "SKIP",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CaseReport {
    pub name: String,
    pub status: CaseStatus,
    pub details: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SuiteReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cases: Vec<CaseReport>,
}

impl Default for SuiteReport {
    fn default() -> Self {
        Self::new()
    }
}

impl SuiteReport {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            cases: Vec::new(),
        }
    }

    pub fn push(&mut self, case: CaseReport) {
        self.cases.push(case);
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn count(&self, status: CaseStatus) -> usize {
        self.cases.iter().filter(|c| c.status == status).count()
    }

    pub fn passed(&self) -> bool {
        self.count(CaseStatus::Fail) == 0
    }

    /// Human-readable table.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "\nstreamcheck suite {}", self.run_id);
        let _ = writeln!(out, "{:<40} | {:<6} | {:>8} | Details", "Case", "Status", "Time");
        let _ = writeln!(out, "{:-<40}-|-{:-<6}-|-{:->8}-|-{:-<40}", "", "", "", "");
        for case in &self.cases {
            let _ = writeln!(
                out,
                "{:<40} | {:<6} | {:>6}ms | {}",
                case.name,
                case.status.as_str(),
                case.duration_ms,
                first_line(&case.details)
            );
        }
        let _ = writeln!(
            out,
            "\n{} passed, {} failed, {} skipped",
            self.count(CaseStatus::Pass),
            self.count(CaseStatus::Fail),
            self.count(CaseStatus::Skipped)
        );
        out
    }
}

/// Keep table rows on one line; the full text is in the JSON report.
fn first_line(text: &str) -> &str {
    let line = text.lines().next().unwrap_or("");
    match line.char_indices().nth(160) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(name: &str, status: CaseStatus, details: &str) -> CaseReport {
        CaseReport {
            name: name.to_string(),
            status,
            details: details.to_string(),
            duration_ms: 12,
        }
    }

    #[test]
    fn test_counts_and_verdict() {
        let mut report = SuiteReport::new();
        report.push(row("ready", CaseStatus::Pass, ""));
        report.push(row("publish_rtmp_play_flv_secret_query", CaseStatus::Skipped, "no_media_test"));
        assert!(report.passed());
        report.push(row("ssl_update_cert", CaseStatus::Fail, "invalid response"));
        assert!(!report.passed());
        assert_eq!(report.count(CaseStatus::Pass), 1);
        assert_eq!(report.count(CaseStatus::Skipped), 1);
    }

    #[test]
    fn test_render_keeps_rows_single_line() {
        let mut report = SuiteReport::new();
        report.push(row("publish", CaseStatus::Fail, "ffmpeg exited\nline two"));
        let text = report.render();
        assert!(text.contains("publish"));
        assert!(text.contains("FAIL"));
        assert!(!text.contains("line two"));
        assert!(text.contains("0 passed, 1 failed, 0 skipped"));
    }

    #[test]
    fn test_json_shape() {
        let mut report = SuiteReport::new();
        report.push(row("empty", CaseStatus::Pass, ""));
        report.finish();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["cases"][0]["status"], "Pass");
        assert!(json["finished_at"].is_string());
    }
}
