use std::path::Path;

use crate::config::UploadConfig;
use crate::error::UploadError;
use crate::models::UploadFile;

/// Image formats the sketch converter accepts out of the box
pub const DEFAULT_ALLOWED_CONTENT_TYPES: &[&str] = &[
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/webp",
    "image/bmp",
    "image/tiff",
    "image/heic",
    "image/heif",
    "image/avif",
];

/// Extensions that are never uploaded, whatever the content looks like
const BLOCKED_EXTENSIONS: &[&str] = &[
    "exe", "dll", "so", "dylib", "bin", "com", "bat", "cmd", "ps1", "sh", "bash", "js", "php",
    "py", "jar", "html", "htm", "svg",
];

/// Validates file size against maximum limit
pub fn validate_file_size(size: u64, max_size: u64) -> Result<(), UploadError> {
    if size == 0 {
        return Err(UploadError::Validation {
            code: "EMPTY_FILE",
            message: "File appears to be empty".to_string(),
        });
    }

    if size > max_size {
        return Err(UploadError::Validation {
            code: "FILE_TOO_LARGE",
            message: format!(
                "File size {} bytes exceeds maximum allowed {} bytes ({} MB)",
                size,
                max_size,
                max_size / 1024 / 1024
            ),
        });
    }
    Ok(())
}

/// Validates a content type against the configured allowlist.
/// An empty allowlist accepts any type.
pub fn validate_content_type(content_type: &str, allowed: &[String]) -> Result<(), UploadError> {
    if allowed.is_empty() {
        return Ok(());
    }

    let normalized = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_lowercase();

    if allowed.iter().any(|a| *a == normalized) {
        return Ok(());
    }

    Err(UploadError::Validation {
        code: "INVALID_MIME_TYPE",
        message: format!("Content type '{}' is not allowed", content_type),
    })
}

/// Sanitizes a filename down to a single safe path component
pub fn sanitize_filename(filename: &str) -> Result<String, UploadError> {
    let name = Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");

    if name.is_empty() {
        return Err(UploadError::Validation {
            code: "INVALID_FILENAME",
            message: "Filename cannot be empty".to_string(),
        });
    }

    let sanitized: String = name
        .chars()
        .map(|c| match c {
            c if c.is_control() => '_',
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | ';' => '_',
            c => c,
        })
        .collect();

    // Limit length safely for UTF-8
    let sanitized = if sanitized.len() > 255 {
        let mut end = 255;
        while !sanitized.is_char_boundary(end) {
            end -= 1;
        }
        sanitized[..end].to_string()
    } else {
        sanitized
    };

    if let Some(ext) = Path::new(&sanitized).extension().and_then(|e| e.to_str()) {
        let ext_lower = ext.to_lowercase();
        if BLOCKED_EXTENSIONS.contains(&ext_lower.as_str()) {
            return Err(UploadError::Validation {
                code: "BLOCKED_EXTENSION",
                message: format!("File extension '.{}' is not allowed", ext_lower),
            });
        }
    }

    if sanitized.starts_with('.') {
        return Err(UploadError::Validation {
            code: "HIDDEN_FILE",
            message: "Hidden files (starting with '.') are not allowed".to_string(),
        });
    }

    Ok(sanitized)
}

/// Sniffs the content type from magic bytes, falling back to octet-stream
pub fn detect_content_type(data: &[u8]) -> String {
    infer::get(data)
        .map(|kind| kind.mime_type().to_string())
        .unwrap_or_else(|| mime::APPLICATION_OCTET_STREAM.to_string())
}

/// Runs every pre-upload check for one file
pub fn validate_upload(file: &UploadFile, config: &UploadConfig) -> Result<(), UploadError> {
    validate_file_size(file.size(), config.max_file_size)?;
    validate_content_type(&file.content_type, &config.allowed_content_types)?;
    Ok(())
}
