//! Format conversions backed by external tools: img2pdf, Ghostscript page
//! rasterization, pdf2docx, and LibreOffice headless.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};

use shared::config::Settings;

use crate::exec::run_tool;

/// Combines one or more images into a single PDF, ordered as submitted.
pub async fn images_to_pdf(
    inputs: &[PathBuf],
    scratch: &Path,
    settings: &Settings,
) -> anyhow::Result<Vec<u8>> {
    for input in inputs {
        let kind = infer::get_from_path(input)
            .with_context(|| format!("reading {:?}", input))?;
        match kind {
            Some(kind) if kind.matcher_type() == infer::MatcherType::Image => {}
            _ => bail!("input {} is not a supported image", input.display()),
        }
    }

    let output = scratch.join("images.pdf");
    let mut args: Vec<String> = inputs.iter().map(|p| p.display().to_string()).collect();
    args.push("-o".into());
    args.push(output.display().to_string());
    run_tool(
        "img2pdf",
        &settings.img2pdf_bin,
        &args,
        Duration::from_secs(settings.handler_timeout_secs),
    )
    .await?;
    tokio::fs::read(&output)
        .await
        .context("reading img2pdf output")
}

/// Rasterizes every page to PNG and returns `(page_N.png, bytes)` pairs in
/// page order.
pub async fn pdf_to_images(
    input: &Path,
    scratch: &Path,
    settings: &Settings,
) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
    let pages_dir = scratch.join("pages");
    tokio::fs::create_dir_all(&pages_dir)
        .await
        .context("creating rasterization dir")?;

    let args = vec![
        "-dNOPAUSE".into(),
        "-dBATCH".into(),
        "-dQUIET".into(),
        "-sDEVICE=png16m".into(),
        "-r150".into(),
        format!("-sOutputFile={}", pages_dir.join("page_%d.png").display()),
        input.display().to_string(),
    ];
    run_tool(
        "gs",
        &settings.gs_bin,
        &args,
        Duration::from_secs(settings.handler_timeout_secs),
    )
    .await?;

    let mut numbered: Vec<(u32, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(&pages_dir).context("listing rasterized pages")? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(number) = name
            .strip_prefix("page_")
            .and_then(|rest| rest.strip_suffix(".png"))
            .and_then(|digits| digits.parse::<u32>().ok())
        {
            numbered.push((number, entry.path()));
        }
    }
    if numbered.is_empty() {
        bail!("gs produced no pages");
    }
    numbered.sort_by_key(|(number, _)| *number);

    let mut pages = Vec::with_capacity(numbered.len());
    for (number, path) in numbered {
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading page {number}"))?;
        pages.push((format!("page_{number}.png"), bytes));
    }
    Ok(pages)
}

/// PDF to DOCX via the pdf2docx helper.
pub async fn pdf_to_word(
    input: &Path,
    scratch: &Path,
    settings: &Settings,
) -> anyhow::Result<Vec<u8>> {
    let output = scratch.join("converted.docx");
    let args = vec![
        "convert".into(),
        input.display().to_string(),
        output.display().to_string(),
    ];
    run_tool(
        "pdf2docx",
        &settings.pdf2docx_bin,
        &args,
        Duration::from_secs(settings.office_timeout_secs),
    )
    .await?;
    tokio::fs::read(&output)
        .await
        .context("reading pdf2docx output")
}

/// DOCX to PDF via LibreOffice headless. The output lands next to the
/// input stem inside a private outdir.
pub async fn docx_to_pdf(
    input: &Path,
    scratch: &Path,
    settings: &Settings,
) -> anyhow::Result<Vec<u8>> {
    let out_dir = scratch.join("office");
    tokio::fs::create_dir_all(&out_dir)
        .await
        .context("creating office outdir")?;

    let args = vec![
        "--headless".into(),
        "--convert-to".into(),
        "pdf".into(),
        "--outdir".into(),
        out_dir.display().to_string(),
        input.display().to_string(),
    ];
    run_tool(
        "soffice",
        &settings.soffice_bin,
        &args,
        Duration::from_secs(settings.office_timeout_secs),
    )
    .await?;

    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "converted".into());
    let expected = out_dir.join(format!("{stem}.pdf"));
    tokio::fs::read(&expected)
        .await
        .context("libreoffice produced no output")
}

/// Rewrites a damaged PDF through Ghostscript's pdfwrite device.
pub async fn repair_pdf(
    input: &Path,
    scratch: &Path,
    settings: &Settings,
) -> anyhow::Result<Vec<u8>> {
    let output = scratch.join("repaired.pdf");
    let args = vec![
        "-dNOPAUSE".into(),
        "-dBATCH".into(),
        "-dQUIET".into(),
        "-sDEVICE=pdfwrite".into(),
        format!("-sOutputFile={}", output.display()),
        input.display().to_string(),
    ];
    run_tool(
        "gs",
        &settings.gs_bin,
        &args,
        Duration::from_secs(settings.handler_timeout_secs),
    )
    .await?;
    tokio::fs::read(&output)
        .await
        .context("reading repaired output")
}
