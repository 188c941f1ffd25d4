//! Upload request validation, file-name sanitizing and institution codes

use chrono::Datelike;
use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

use crate::config::UploadConfig;
use crate::error::{Error, Result};

/// Leading bytes of every PDF file
pub const PDF_MAGIC: &[u8] = b"%PDF-";

const MAX_FILENAME_BYTES: usize = 255;
const FALLBACK_FILENAME: &str = "upload.pdf";

/// Submitted file plus descriptive metadata, as declared by the client
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    pub institution: String,
    pub year: String,
}

/// An upload that passed schema validation
#[derive(Debug, Clone)]
pub struct ValidatedUpload {
    pub original_name: String,
    pub sanitized_name: String,
    pub institution: String,
    pub institution_code: String,
    pub year: i32,
}

impl UploadRequest {
    /// Validate against the configured limits using the current year
    pub fn validate(&self, limits: &UploadConfig) -> Result<ValidatedUpload> {
        self.validate_for_year(limits, chrono::Utc::now().year())
    }

    /// Validate with an explicit current year; reports every violated field
    pub fn validate_for_year(&self, limits: &UploadConfig, current_year: i32) -> Result<ValidatedUpload> {
        let mut problems = Vec::new();

        let institution = self.institution.trim();
        let name_len = institution.chars().count();
        if name_len < limits.institution_min_len {
            problems.push(format!(
                "institutionName: must have at least {} characters",
                limits.institution_min_len
            ));
        } else if name_len > limits.institution_max_len {
            problems.push(format!(
                "institutionName: must have at most {} characters",
                limits.institution_max_len
            ));
        }

        let year = self.year.trim();
        let parsed_year = if year.len() == 4 && year.chars().all(|c| c.is_ascii_digit()) {
            year.parse::<i32>().ok()
        } else {
            problems.push("year: must have 4 digits".to_string());
            None
        };
        if let Some(y) = parsed_year {
            if y < limits.min_year || y > current_year + 1 {
                problems.push(format!(
                    "year: must be between {} and {}",
                    limits.min_year,
                    current_year + 1
                ));
            }
        }

        if self.file_size == 0 {
            problems.push("file.size: file is empty".to_string());
        } else if self.file_size > limits.max_file_size {
            problems.push(format!(
                "file.size: file too large, maximum {}MB",
                limits.max_file_size / (1024 * 1024)
            ));
        }

        if self.mime_type != limits.mime_type {
            problems.push(format!("file.type: only {} is accepted", limits.mime_type));
        }

        if !problems.is_empty() {
            return Err(Error::validation(problems.join(", ")));
        }

        Ok(ValidatedUpload {
            original_name: self.file_name.clone(),
            sanitized_name: sanitize_filename(&self.file_name),
            institution: institution.to_string(),
            institution_code: institution_code(institution),
            year: parsed_year.unwrap_or_default(),
        })
    }
}

/// Reject content that does not start with the PDF signature
pub fn check_pdf_magic(bytes: &[u8]) -> Result<()> {
    if bytes.starts_with(PDF_MAGIC) {
        Ok(())
    } else {
        Err(Error::validation("file is not a valid PDF"))
    }
}

/// Strip path separators, reserved and control characters from a file name
pub fn sanitize_filename(name: &str) -> String {
    static ILLEGAL: Lazy<Regex> = Lazy::new(|| Regex::new(r#"[/\?<>\\:\*\|"]"#).unwrap());
    static CONTROL: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\x00-\x1f\x7f-\x9f]").unwrap());
    static RESERVED: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\.+$").unwrap());
    static WINDOWS_RESERVED: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?i)^(con|prn|aux|nul|com[0-9]|lpt[0-9])(\..*)?$").unwrap()
    });
    static TRAILING: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\. ]+$").unwrap());

    let cleaned = ILLEGAL.replace_all(name, "");
    let cleaned = CONTROL.replace_all(&cleaned, "");
    let cleaned = RESERVED.replace(&cleaned, "");
    let cleaned = WINDOWS_RESERVED.replace(&cleaned, "");
    let cleaned = TRAILING.replace(&cleaned, "");

    let mut out = String::with_capacity(cleaned.len().min(MAX_FILENAME_BYTES));
    for c in cleaned.chars() {
        if out.len() + c.len_utf8() > MAX_FILENAME_BYTES {
            break;
        }
        out.push(c);
    }

    if out.trim().is_empty() {
        FALLBACK_FILENAME.to_string()
    } else {
        out
    }
}

/// Lower-case, accent-free, hyphenated key for an institution name
pub fn institution_code(name: &str) -> String {
    let stripped: String = name
        .nfd()
        .filter(|c| !('\u{0300}'..='\u{036f}').contains(c))
        .collect::<String>()
        .to_lowercase();

    let kept: String = stripped
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c.is_whitespace() || *c == '-')
        .collect();

    kept.split_whitespace().collect::<Vec<_>>().join("-")
}
