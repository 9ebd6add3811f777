//! Utility functions
//!
use std::{fs::File, io::Cursor, path::Path};

use anyhow::{Context, Result};
use reqwest::Client;

/// Download a file from a URL to a given filepath.
///
/// The body is written to a `.part` sibling first and renamed once complete, so an interrupted
/// download never leaves a truncated file at `filepath`.
pub async fn download_file(client: &Client, url: &str, filepath: impl AsRef<Path>) -> Result<()> {
    let filepath = filepath.as_ref();
    let resp = client.get(url).send().await?.error_for_status()?;

    let part_path = filepath.with_extension("part");
    let mut file = File::create(&part_path)
        .with_context(|| format!("failed to create {}", part_path.display()))?;
    let mut content = Cursor::new(resp.bytes().await?);
    if let Err(e) = std::io::copy(&mut content, &mut file) {
        std::fs::remove_file(&part_path).ok();
        return Err(e.into());
    }
    std::fs::rename(&part_path, filepath)?;

    Ok(())
}

/// Join a base URL and a file name with exactly one slash between them.
pub fn join_url(base_url: &str, file_name: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), file_name)
}

#[cfg(test)]
mod test {
    use super::join_url;

    #[test]
    fn joins_with_single_slash() {
        assert_eq!(
            join_url("https://models.example/v1/", "face_detector.onnx"),
            "https://models.example/v1/face_detector.onnx"
        );
        assert_eq!(
            join_url("https://models.example/v1", "face_detector.onnx"),
            "https://models.example/v1/face_detector.onnx"
        );
    }
}
