//! Ghostscript compression profiles and invocation.
//!
//! The profile table maps `compressionLevel` onto the exact parameter set
//! previously shipped; any change here breaks bit-compatibility with
//! outputs already produced, so the numbers are fixed.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;

use shared::config::Settings;
use shared::options::{CompressOptions, CompressionLevel};

use crate::exec::run_tool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionProfile {
    pub preset: &'static str,
    pub jpeg_quality: u32,
    pub color_dpi: u32,
    pub gray_dpi: u32,
    pub mono_dpi: u32,
}

pub fn profile_for(level: CompressionLevel) -> CompressionProfile {
    match level {
        CompressionLevel::Low => CompressionProfile {
            preset: "printer",
            jpeg_quality: 100,
            color_dpi: 300,
            gray_dpi: 300,
            mono_dpi: 300,
        },
        CompressionLevel::Medium => CompressionProfile {
            preset: "ebook",
            jpeg_quality: 70,
            color_dpi: 120,
            gray_dpi: 120,
            mono_dpi: 300,
        },
        CompressionLevel::Extreme => CompressionProfile {
            preset: "screen",
            jpeg_quality: 25,
            color_dpi: 36,
            gray_dpi: 36,
            mono_dpi: 100,
        },
    }
}

const COMMON_FLAGS: &[&str] = &[
    "-sDEVICE=pdfwrite",
    "-dCompatibilityLevel=1.4",
    "-dNOPAUSE",
    "-dQUIET",
    "-dBATCH",
    "-dAutoFilterColorImages=false",
    "-dAutoFilterGrayImages=false",
    "-sColorImageFilter=/DCTEncode",
    "-sGrayImageFilter=/DCTEncode",
    "-dDownsampleColorImages=true",
    "-dColorImageDownsampleType=/Bicubic",
    "-dDownsampleGrayImages=true",
    "-dGrayImageDownsampleType=/Bicubic",
    "-dDownsampleMonoImages=true",
    "-dMonoImageDownsampleType=/Subsample",
    "-dDetectDuplicateImages=true",
    "-dCompressFonts=true",
    "-dSubsetFonts=true",
    "-dFastWebView=true",
];

const GRAYSCALE_FLAGS: &[&str] = &[
    "-sProcessColorModel=DeviceGray",
    "-sColorConversionStrategy=Gray",
    "-dOverrideICC",
];

/// Full Ghostscript argv for one compression run.
pub fn gs_args(options: &CompressOptions, input: &Path, output: &Path) -> Vec<String> {
    let profile = profile_for(options.level);
    let mut args: Vec<String> = COMMON_FLAGS.iter().map(|s| s.to_string()).collect();
    args.push(format!("-dPDFSETTINGS=/{}", profile.preset));
    args.push(format!("-dJPEGQ={}", profile.jpeg_quality));
    args.push(format!("-dColorImageResolution={}", profile.color_dpi));
    args.push(format!("-dGrayImageResolution={}", profile.gray_dpi));
    args.push(format!("-dMonoImageResolution={}", profile.mono_dpi));
    if options.grayscale {
        args.extend(GRAYSCALE_FLAGS.iter().map(|s| s.to_string()));
    }
    args.push(format!("-sOutputFile={}", output.display()));
    args.push(input.display().to_string());
    args
}

/// Compresses a PDF with the profile inferred from the options.
pub async fn compress(
    input: &Path,
    options: &CompressOptions,
    scratch: &Path,
    settings: &Settings,
) -> anyhow::Result<Vec<u8>> {
    let output = scratch.join("compressed.pdf");
    let args = gs_args(options, input, &output);
    run_tool(
        "gs",
        &settings.gs_bin,
        &args,
        Duration::from_secs(settings.handler_timeout_secs),
    )
    .await?;
    tokio::fs::read(&output)
        .await
        .context("reading compressed output")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn args_for(level: CompressionLevel, grayscale: bool) -> Vec<String> {
        gs_args(
            &CompressOptions { level, grayscale },
            &PathBuf::from("in.pdf"),
            &PathBuf::from("out.pdf"),
        )
    }

    #[test]
    fn profiles_match_the_published_table() {
        let low = profile_for(CompressionLevel::Low);
        assert_eq!((low.preset, low.jpeg_quality, low.color_dpi), ("printer", 100, 300));
        let medium = profile_for(CompressionLevel::Medium);
        assert_eq!(
            (medium.preset, medium.jpeg_quality, medium.gray_dpi, medium.mono_dpi),
            ("ebook", 70, 120, 300)
        );
        let extreme = profile_for(CompressionLevel::Extreme);
        assert_eq!(
            (extreme.preset, extreme.jpeg_quality, extreme.color_dpi, extreme.mono_dpi),
            ("screen", 25, 36, 100)
        );
    }

    #[test]
    fn stronger_levels_never_raise_any_parameter() {
        let (low, medium, extreme) = (
            profile_for(CompressionLevel::Low),
            profile_for(CompressionLevel::Medium),
            profile_for(CompressionLevel::Extreme),
        );
        assert!(extreme.jpeg_quality <= medium.jpeg_quality);
        assert!(medium.jpeg_quality <= low.jpeg_quality);
        assert!(extreme.color_dpi <= medium.color_dpi && medium.color_dpi <= low.color_dpi);
        assert!(extreme.gray_dpi <= medium.gray_dpi && medium.gray_dpi <= low.gray_dpi);
        assert!(extreme.mono_dpi <= medium.mono_dpi && medium.mono_dpi <= low.mono_dpi);
    }

    #[test]
    fn args_carry_profile_and_common_flags() {
        let args = args_for(CompressionLevel::Medium, false);
        assert_eq!(args[0], "-sDEVICE=pdfwrite");
        assert!(args.contains(&"-dPDFSETTINGS=/ebook".to_string()));
        assert!(args.contains(&"-dJPEGQ=70".to_string()));
        assert!(args.contains(&"-dColorImageResolution=120".to_string()));
        assert!(args.contains(&"-dMonoImageDownsampleType=/Subsample".to_string()));
        assert!(args.contains(&"-dFastWebView=true".to_string()));
        assert_eq!(args.last().unwrap(), "in.pdf");
        assert!(!args.iter().any(|a| a.contains("DeviceGray")));
    }

    #[test]
    fn grayscale_appends_conversion_flags() {
        let args = args_for(CompressionLevel::Extreme, true);
        assert!(args.contains(&"-sProcessColorModel=DeviceGray".to_string()));
        assert!(args.contains(&"-sColorConversionStrategy=Gray".to_string()));
        assert!(args.contains(&"-dOverrideICC".to_string()));
    }
}
