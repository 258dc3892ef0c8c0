//! Data transfer objects exchanged between the job API, the worker fleet,
//! and the frontend so serialization stays consistent across the stack.

use std::str::FromStr;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{Display, EnumString};
use uuid::Uuid;

/// Enumerated transformation tags as they appear on the wire (`toolId`).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, Serialize, Deserialize,
)]
pub enum ToolId {
    #[strum(serialize = "merge")]
    #[serde(rename = "merge")]
    Merge,
    #[strum(serialize = "split")]
    #[serde(rename = "split")]
    Split,
    #[strum(serialize = "rotate")]
    #[serde(rename = "rotate")]
    Rotate,
    #[strum(serialize = "remove")]
    #[serde(rename = "remove")]
    Remove,
    #[strum(serialize = "img2pdf")]
    #[serde(rename = "img2pdf")]
    Img2Pdf,
    #[strum(serialize = "pdf2img")]
    #[serde(rename = "pdf2img")]
    Pdf2Img,
    #[strum(serialize = "pdfToWord")]
    #[serde(rename = "pdfToWord")]
    PdfToWord,
    #[strum(serialize = "docxToPdf")]
    #[serde(rename = "docxToPdf")]
    DocxToPdf,
    #[strum(serialize = "protectPdf")]
    #[serde(rename = "protectPdf")]
    ProtectPdf,
    #[strum(serialize = "unlockPdf")]
    #[serde(rename = "unlockPdf")]
    UnlockPdf,
    #[strum(serialize = "addWatermark")]
    #[serde(rename = "addWatermark")]
    AddWatermark,
    #[strum(serialize = "addPageNumbers")]
    #[serde(rename = "addPageNumbers")]
    AddPageNumbers,
    #[strum(serialize = "repairPdf")]
    #[serde(rename = "repairPdf")]
    RepairPdf,
    #[strum(serialize = "compress")]
    #[serde(rename = "compress")]
    Compress,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    /// Terminal states are absorbing until the retention sweeper removes
    /// the row.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "in_progress" => Ok(JobStatus::InProgress),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            other => Err(anyhow!("unknown job status '{other}'")),
        }
    }
}

/// One row of the `processing_jobs` table.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: Uuid,
    pub tool_id: ToolId,
    pub status: JobStatus,
    pub progress: i32,
    pub input_file_paths: Vec<String>,
    pub options: Value,
    pub file_name: Option<String>,
    pub public_url: Option<String>,
    pub file_size: Option<i64>,
    pub access_count: i32,
    pub worker_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 202 body returned by `POST /process-pdf`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub success: bool,
    pub job_id: Uuid,
    pub status_check_link: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_wait_time_seconds: Option<u64>,
}

/// 200 body returned by `GET /process-pdf?jobId=`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status: JobStatus,
    pub progress: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusResponse {
    /// Read-only projection of a job row for status polling.
    pub fn from_record(record: &JobRecord) -> Self {
        let download_link = match record.status {
            JobStatus::Succeeded => Some(format!("/download-proxied-file?jobId={}", record.id)),
            _ => None,
        };
        StatusResponse {
            status: record.status,
            progress: record.progress,
            output_file_name: record.file_name.clone(),
            download_link,
            error: record.error_message.clone(),
        }
    }
}

/// Body of `GET /file-size?fileId=`; megabytes rounded to two decimals.
#[derive(Debug, Serialize)]
pub struct FileSizeResponse {
    pub file_size_mb: f64,
}

/// Bytes-to-megabytes with two-decimal rounding, matching the size the
/// frontend displays.
pub fn file_size_mb(bytes: i64) -> f64 {
    let mb = bytes as f64 / (1024.0 * 1024.0);
    (mb * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_id_round_trips_wire_names() {
        for (raw, tool) in [
            ("merge", ToolId::Merge),
            ("img2pdf", ToolId::Img2Pdf),
            ("pdfToWord", ToolId::PdfToWord),
            ("addPageNumbers", ToolId::AddPageNumbers),
            ("compress", ToolId::Compress),
        ] {
            assert_eq!(raw.parse::<ToolId>().unwrap(), tool);
            assert_eq!(tool.to_string(), raw);
            let json = serde_json::to_string(&tool).unwrap();
            assert_eq!(json, format!("\"{raw}\""));
        }
    }

    #[test]
    fn unknown_tool_id_rejected() {
        assert!("ocr".parse::<ToolId>().is_err());
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&JobStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
        assert_eq!(JobStatus::InProgress.as_str(), "in_progress");
        assert_eq!("failed".parse::<JobStatus>().unwrap(), JobStatus::Failed);
    }

    #[test]
    fn file_size_rounds_to_two_decimals() {
        assert_eq!(file_size_mb(1_048_576), 1.0);
        assert_eq!(file_size_mb(1_572_864), 1.5);
        assert_eq!(file_size_mb(123_456), 0.12);
    }
}
