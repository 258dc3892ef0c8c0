//! Password protection and removal via qpdf.
//!
//! Passwords travel only as argv elements into the child process; they are
//! never logged and never appear in error messages (qpdf does not echo
//! them on stderr).

use std::path::Path;
use std::time::Duration;

use anyhow::Context;

use shared::config::Settings;

use crate::exec::run_tool;

fn encrypt_args(password: &str, input: &Path, output: &Path) -> Vec<String> {
    vec![
        "--encrypt".into(),
        password.into(),
        password.into(),
        "256".into(),
        "--".into(),
        input.display().to_string(),
        output.display().to_string(),
    ]
}

fn decrypt_args(password: &str, input: &Path, output: &Path) -> Vec<String> {
    vec![
        format!("--password={password}"),
        "--decrypt".into(),
        input.display().to_string(),
        output.display().to_string(),
    ]
}

/// Encrypts a PDF with AES-256, same user and owner password.
pub async fn protect(
    input: &Path,
    password: &str,
    scratch: &Path,
    settings: &Settings,
) -> anyhow::Result<Vec<u8>> {
    let output = scratch.join("protected.pdf");
    run_tool(
        "qpdf",
        &settings.qpdf_bin,
        &encrypt_args(password, input, &output),
        Duration::from_secs(settings.handler_timeout_secs),
    )
    .await?;
    tokio::fs::read(&output)
        .await
        .context("reading protected output")
}

/// Strips encryption; an empty password handles owner-restricted files.
pub async fn unlock(
    input: &Path,
    password: &str,
    scratch: &Path,
    settings: &Settings,
) -> anyhow::Result<Vec<u8>> {
    let output = scratch.join("unlocked.pdf");
    run_tool(
        "qpdf",
        &settings.qpdf_bin,
        &decrypt_args(password, input, &output),
        Duration::from_secs(settings.handler_timeout_secs),
    )
    .await?;
    tokio::fs::read(&output)
        .await
        .context("reading unlocked output")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn encrypt_args_place_password_before_the_separator() {
        let args = encrypt_args("s3cret", &PathBuf::from("in.pdf"), &PathBuf::from("out.pdf"));
        assert_eq!(
            args,
            vec!["--encrypt", "s3cret", "s3cret", "256", "--", "in.pdf", "out.pdf"]
        );
    }

    #[test]
    fn decrypt_args_accept_empty_passwords() {
        let args = decrypt_args("", &PathBuf::from("in.pdf"), &PathBuf::from("out.pdf"));
        assert_eq!(args, vec!["--password=", "--decrypt", "in.pdf", "out.pdf"]);
    }
}
