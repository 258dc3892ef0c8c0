//! Tool registry: dispatches a claimed job's `tool_id` to its handler and
//! normalizes the result into one output contract (bytes, mime, naming).

use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde_json::Value;
use uuid::Uuid;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use shared::config::Settings;
use shared::dto::ToolId;
use shared::options;

use crate::{compress, convert, pdfops, security};

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_ZIP: &str = "application/zip";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

/// Uniform handler result: raw bytes plus the metadata the worker needs
/// for upload and naming.
#[derive(Debug)]
pub struct ToolOutput {
    pub bytes: Vec<u8>,
    pub mime_type: &'static str,
    pub file_name_base: &'static str,
    pub extension: &'static str,
}

impl ToolOutput {
    fn pdf(file_name_base: &'static str, bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            mime_type: MIME_PDF,
            file_name_base,
            extension: ".pdf",
        }
    }

    fn zip(file_name_base: &'static str, bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            mime_type: MIME_ZIP,
            file_name_base,
            extension: ".zip",
        }
    }
}

/// Final artifact name: `DocSmart_{base}_{first 8 of job id}{extension}`.
pub fn final_file_name(base: &str, job_id: Uuid, extension: &str) -> String {
    let id = job_id.simple().to_string();
    format!("DocSmart_{base}_{}{extension}", &id[..8])
}

/// Deflates `(name, bytes)` entries into one ZIP archive.
pub fn zip_bytes(entries: &[(String, Vec<u8>)]) -> anyhow::Result<Vec<u8>> {
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = ZipWriter::new(&mut cursor);
        let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);
        for (name, bytes) in entries {
            writer
                .start_file(name.as_str(), opts)
                .with_context(|| format!("starting zip entry {name}"))?;
            writer.write_all(bytes).context("writing zip entry")?;
        }
        writer.finish().context("finalizing zip archive")?;
    }
    Ok(cursor.into_inner())
}

/// Runs the handler registered for `tool`. Inputs are local scratch paths;
/// handlers only produce bytes and never touch the repository. Arity and
/// options are re-validated here so rows inserted by other writers fail
/// with a clear input error instead of a handler panic.
pub async fn dispatch(
    tool: ToolId,
    inputs: &[PathBuf],
    job_options: &Value,
    scratch: &Path,
    settings: &Settings,
) -> anyhow::Result<ToolOutput> {
    options::validate_submission(tool, inputs.len(), job_options)?;

    match tool {
        ToolId::Merge => Ok(ToolOutput::pdf("merged_documents", pdfops::merge(inputs)?)),
        ToolId::Split => {
            let opts = options::split_options(job_options)?;
            let mut parts = pdfops::split_parts(&inputs[0], &opts)?;
            if parts.len() == 1 {
                Ok(ToolOutput::pdf("split_document", parts.remove(0).1))
            } else {
                Ok(ToolOutput::zip("split_document", zip_bytes(&parts)?))
            }
        }
        ToolId::Rotate => {
            let opts = options::rotate_options(job_options)?;
            Ok(ToolOutput::pdf(
                "rotated_document",
                pdfops::rotate(&inputs[0], &opts)?,
            ))
        }
        ToolId::Remove => {
            let opts = options::remove_options(job_options)?;
            Ok(ToolOutput::pdf(
                "removed_pages",
                pdfops::remove_pages(&inputs[0], &opts)?,
            ))
        }
        ToolId::Img2Pdf => Ok(ToolOutput::pdf(
            "converted_images",
            convert::images_to_pdf(inputs, scratch, settings).await?,
        )),
        ToolId::Pdf2Img => {
            let pages = convert::pdf_to_images(&inputs[0], scratch, settings).await?;
            Ok(ToolOutput::zip("pdf_pages", zip_bytes(&pages)?))
        }
        ToolId::PdfToWord => Ok(ToolOutput {
            bytes: convert::pdf_to_word(&inputs[0], scratch, settings).await?,
            mime_type: MIME_DOCX,
            file_name_base: "converted_document",
            extension: ".docx",
        }),
        ToolId::DocxToPdf => Ok(ToolOutput::pdf(
            "converted_document",
            convert::docx_to_pdf(&inputs[0], scratch, settings).await?,
        )),
        ToolId::ProtectPdf => {
            let password = options::protect_password(job_options)?;
            Ok(ToolOutput::pdf(
                "protected_document",
                security::protect(&inputs[0], &password, scratch, settings).await?,
            ))
        }
        ToolId::UnlockPdf => {
            let password = options::unlock_password(job_options)?;
            Ok(ToolOutput::pdf(
                "unlocked_document",
                security::unlock(&inputs[0], &password, scratch, settings).await?,
            ))
        }
        ToolId::AddWatermark => Ok(ToolOutput::pdf(
            "watermarked_document",
            pdfops::add_watermark(&inputs[0])?,
        )),
        ToolId::AddPageNumbers => Ok(ToolOutput::pdf(
            "numbered_document",
            pdfops::add_page_numbers(&inputs[0])?,
        )),
        ToolId::RepairPdf => Ok(ToolOutput::pdf(
            "repaired_document",
            convert::repair_pdf(&inputs[0], scratch, settings).await?,
        )),
        ToolId::Compress => {
            let opts = options::compress_options(job_options)?;
            Ok(ToolOutput::pdf(
                "compressed_document",
                compress::compress(&inputs[0], &opts, scratch, settings).await?,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Read as _;

    #[test]
    fn final_name_embeds_base_and_short_job_id() {
        let job_id: Uuid = "a1b2c3d4-0000-0000-0000-000000000000".parse().unwrap();
        assert_eq!(
            final_file_name("merged_documents", job_id, ".pdf"),
            "DocSmart_merged_documents_a1b2c3d4.pdf"
        );
        assert_eq!(
            final_file_name("split_document", job_id, ".zip"),
            "DocSmart_split_document_a1b2c3d4.zip"
        );
    }

    #[test]
    fn zip_bytes_round_trips_entries() {
        let entries = vec![
            ("pages_1-3.pdf".to_string(), b"%PDF-A".to_vec()),
            ("split_page_5.pdf".to_string(), b"%PDF-B".to_vec()),
        ];
        let archive = zip_bytes(&entries).unwrap();

        let mut reader = zip::ZipArchive::new(std::io::Cursor::new(archive)).unwrap();
        assert_eq!(reader.len(), 2);
        let mut first = String::new();
        reader
            .by_name("pages_1-3.pdf")
            .unwrap()
            .read_to_string(&mut first)
            .unwrap();
        assert_eq!(first, "%PDF-A");
        assert!(reader.by_name("split_page_5.pdf").is_ok());
    }

    #[tokio::test]
    async fn dispatch_rejects_wrong_arity_before_touching_files() {
        let settings: Settings = serde_json::from_value(json!({})).unwrap();
        let err = dispatch(
            ToolId::Merge,
            &[PathBuf::from("only-one.pdf")],
            &json!({}),
            Path::new("/tmp"),
            &settings,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("at least 2"));
    }

    #[tokio::test]
    async fn dispatch_rejects_invalid_options_as_input_errors() {
        let settings: Settings = serde_json::from_value(json!({})).unwrap();
        let err = dispatch(
            ToolId::Split,
            &[PathBuf::from("doc.pdf")],
            &json!({"pageRange": "5-3"}),
            Path::new("/tmp"),
            &settings,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("range"));
    }
}
