//! AN-006: Background-image setting — one text file holding the chosen path.

use super::error::{AncileError, Result};
use std::path::{Path, PathBuf};

/// Extensions accepted by the image picker.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp"];

/// Read the recorded background. `None` when nothing is recorded or the
/// image no longer exists.
pub fn load_background(file: &Path) -> Option<PathBuf> {
    let content = std::fs::read_to_string(file).ok()?;
    let path = content.trim();
    if path.is_empty() {
        return None;
    }
    let path = PathBuf::from(path);
    if path.exists() {
        Some(path)
    } else {
        tracing::warn!(image = %path.display(), "recorded background image is gone");
        None
    }
}

/// Record `image` as the background (write to temp, then rename).
pub fn save_background(file: &Path, image: &Path) -> Result<()> {
    check_image(image)?;

    if let Some(parent) = file.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                AncileError::io(format!("cannot create dir {}", parent.display()), e)
            })?;
        }
    }

    let tmp_path = file.with_extension("tmp");
    std::fs::write(&tmp_path, image.to_string_lossy().as_bytes())
        .map_err(|e| AncileError::io(format!("cannot write {}", tmp_path.display()), e))?;
    std::fs::rename(&tmp_path, file).map_err(|e| {
        AncileError::io(
            format!("cannot rename {} → {}", tmp_path.display(), file.display()),
            e,
        )
    })?;

    tracing::info!(image = %image.display(), "background image saved");
    Ok(())
}

fn check_image(image: &Path) -> Result<()> {
    let ext = image
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if !IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        return Err(AncileError::InvalidImage {
            path: image.to_path_buf(),
            reason: format!("expected one of {}", IMAGE_EXTENSIONS.join(", ")),
        });
    }
    if !image.is_file() {
        return Err(AncileError::InvalidImage {
            path: image.to_path_buf(),
            reason: "file does not exist".to_string(),
        });
    }
    Ok(())
}
