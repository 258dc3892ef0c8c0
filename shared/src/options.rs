//! Parsing and validation of the tool-specific `options` envelope.
//!
//! The submission API validates here so malformed requests are rejected
//! with a 400 before a job row is created; the worker re-parses the stored
//! envelope defensively and treats failures as fatal input errors.

use serde_json::Value;
use std::str::FromStr;

use crate::dto::ToolId;
use crate::error::JobError;

/// A 1-based inclusive page range as submitted in `pageRange`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRange {
    pub start: u32,
    pub end: u32,
}

impl PageRange {
    pub fn is_single(&self) -> bool {
        self.start == self.end
    }

    pub fn page_count(&self) -> u32 {
        self.end - self.start + 1
    }
}

/// Parses a comma list of `N` or `A-B` entries, 1-based, ascending per
/// range. A single `N` is equivalent to `N-N`.
pub fn parse_page_ranges(raw: &str) -> Result<Vec<PageRange>, JobError> {
    let mut ranges = Vec::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            return Err(JobError::InvalidInput(format!(
                "empty entry in page range '{raw}'"
            )));
        }
        let (start, end) = match entry.split_once('-') {
            Some((a, b)) => (parse_page(a, entry)?, parse_page(b, entry)?),
            None => {
                let n = parse_page(entry, entry)?;
                (n, n)
            }
        };
        if end < start {
            return Err(JobError::InvalidInput(format!(
                "invalid page range '{entry}': end before start"
            )));
        }
        ranges.push(PageRange { start, end });
    }
    if ranges.is_empty() {
        return Err(JobError::InvalidInput("page range is empty".into()));
    }
    Ok(ranges)
}

fn parse_page(text: &str, entry: &str) -> Result<u32, JobError> {
    let page: u32 = text.trim().parse().map_err(|_| {
        JobError::InvalidInput(format!("invalid page range '{entry}': not a number"))
    })?;
    if page < 1 {
        return Err(JobError::InvalidInput(format!(
            "invalid page range '{entry}': pages are 1-based"
        )));
    }
    Ok(page)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionLevel {
    Low,
    #[default]
    Medium,
    Extreme,
}

impl CompressionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionLevel::Low => "low",
            CompressionLevel::Medium => "medium",
            CompressionLevel::Extreme => "extreme",
        }
    }
}

impl FromStr for CompressionLevel {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(CompressionLevel::Low),
            "medium" => Ok(CompressionLevel::Medium),
            "extreme" => Ok(CompressionLevel::Extreme),
            other => Err(JobError::InvalidInput(format!(
                "unknown compressionLevel '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CompressOptions {
    pub level: CompressionLevel,
    pub grayscale: bool,
}

#[derive(Debug, Clone)]
pub struct RotateOptions {
    pub pages: Vec<u32>,
    pub angle: u16,
}

#[derive(Debug, Clone)]
pub struct RemoveOptions {
    pub pages: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct SplitOptions {
    pub ranges: Vec<PageRange>,
}

pub fn split_options(options: &Value) -> Result<SplitOptions, JobError> {
    let raw = required_str(options, "pageRange")?;
    Ok(SplitOptions {
        ranges: parse_page_ranges(raw)?,
    })
}

pub fn rotate_options(options: &Value) -> Result<RotateOptions, JobError> {
    let pages = required_pages(options)?;
    let angle = options
        .get("angle")
        .and_then(Value::as_u64)
        .ok_or_else(|| JobError::InvalidInput("angle is required".into()))?;
    if !matches!(angle, 90 | 180 | 270) {
        return Err(JobError::InvalidInput(format!(
            "angle must be 90, 180 or 270, got {angle}"
        )));
    }
    Ok(RotateOptions {
        pages,
        angle: angle as u16,
    })
}

pub fn remove_options(options: &Value) -> Result<RemoveOptions, JobError> {
    Ok(RemoveOptions {
        pages: required_pages(options)?,
    })
}

pub fn compress_options(options: &Value) -> Result<CompressOptions, JobError> {
    let level = match options.get("compressionLevel") {
        Some(Value::String(s)) => s.parse()?,
        Some(other) => {
            return Err(JobError::InvalidInput(format!(
                "compressionLevel must be a string, got {other}"
            )))
        }
        None => CompressionLevel::default(),
    };
    let grayscale = options
        .get("grayscale")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    Ok(CompressOptions { level, grayscale })
}

/// `protectPdf` requires a non-empty password.
pub fn protect_password(options: &Value) -> Result<String, JobError> {
    let password = required_str(options, "password")?;
    if password.is_empty() {
        return Err(JobError::InvalidInput("password must not be empty".into()));
    }
    Ok(password.to_string())
}

/// `unlockPdf` accepts an empty password (owner-restricted documents).
pub fn unlock_password(options: &Value) -> Result<String, JobError> {
    match options.get("password") {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(JobError::InvalidInput(format!(
            "password must be a string, got {other}"
        ))),
        None => Ok(String::new()),
    }
}

fn required_str<'a>(options: &'a Value, key: &str) -> Result<&'a str, JobError> {
    options
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| JobError::InvalidInput(format!("{key} is required")))
}

fn required_pages(options: &Value) -> Result<Vec<u32>, JobError> {
    let list = options
        .get("pages")
        .and_then(Value::as_array)
        .ok_or_else(|| JobError::InvalidInput("pages is required".into()))?;
    if list.is_empty() {
        return Err(JobError::InvalidInput("pages must not be empty".into()));
    }
    let mut pages = Vec::with_capacity(list.len());
    for entry in list {
        let page = entry
            .as_u64()
            .filter(|n| *n >= 1)
            .ok_or_else(|| JobError::InvalidInput(format!("invalid page number {entry}")))?;
        pages.push(page as u32);
    }
    Ok(pages)
}

/// Input arity each tool accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exactly(usize),
    AtLeast(usize),
}

pub fn expected_arity(tool: ToolId) -> Arity {
    match tool {
        ToolId::Merge => Arity::AtLeast(2),
        ToolId::Img2Pdf => Arity::AtLeast(1),
        _ => Arity::Exactly(1),
    }
}

/// Full submission-time validation: file arity plus tool options. Returns
/// the first violation as [`JobError::InvalidInput`].
pub fn validate_submission(tool: ToolId, file_count: usize, options: &Value) -> Result<(), JobError> {
    match expected_arity(tool) {
        Arity::Exactly(n) if file_count != n => {
            return Err(JobError::InvalidInput(format!(
                "{tool} expects exactly {n} input file(s), got {file_count}"
            )));
        }
        Arity::AtLeast(n) if file_count < n => {
            return Err(JobError::InvalidInput(format!(
                "{tool} expects at least {n} input file(s), got {file_count}"
            )));
        }
        _ => {}
    }

    match tool {
        ToolId::Split => split_options(options).map(|_| ()),
        ToolId::Rotate => rotate_options(options).map(|_| ()),
        ToolId::Remove => remove_options(options).map(|_| ()),
        ToolId::Compress => compress_options(options).map(|_| ()),
        ToolId::ProtectPdf => protect_password(options).map(|_| ()),
        ToolId::UnlockPdf => unlock_password(options).map(|_| ()),
        _ => Ok(()),
    }
}
