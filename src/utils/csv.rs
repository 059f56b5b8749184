use serde::Serialize;

use crate::utils::name::{join_name, split_name};
use crate::utils::validation::validate_email;

/// Header synonyms accepted for the email column, compared lowercased.
/// Includes the Japanese headers produced by common spreadsheet exports.
const EMAIL_HEADERS: &[&str] = &["email", "e-mail", "mail", "eメール", "メールアドレス"];

#[derive(Debug, Clone)]
pub struct ImportedRow {
    /// 1-based data row number (header excluded), for error reporting.
    pub row: usize,
    pub email: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RowError {
    pub row: usize,
    pub error: String,
}

#[derive(Debug)]
pub struct ImportResult {
    pub rows: Vec<ImportedRow>,
    pub errors: Vec<RowError>,
}

/// Parse an uploaded subscriber CSV. Emails are lowercased; rows with a
/// missing or malformed address become per-row errors rather than failing
/// the whole upload.
pub fn parse_subscriber_csv(data: &[u8]) -> Result<ImportResult, String> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(data);

    let headers = reader
        .headers()
        .map_err(|e| format!("unreadable CSV header: {}", e))?
        .clone();

    let mut email_idx = None;
    let mut name_idx = None;
    let mut first_idx = None;
    let mut last_idx = None;

    for (i, header) in headers.iter().enumerate() {
        let key = header.trim().to_lowercase();
        if EMAIL_HEADERS.contains(&key.as_str()) {
            email_idx = Some(i);
        } else if key == "name" {
            name_idx = Some(i);
        } else if key == "first_name" || key == "firstname" {
            first_idx = Some(i);
        } else if key == "last_name" || key == "lastname" {
            last_idx = Some(i);
        }
    }

    let email_idx = email_idx.ok_or_else(|| "CSV has no email column".to_string())?;

    let mut rows = Vec::new();
    let mut errors = Vec::new();

    for (i, record) in reader.records().enumerate() {
        let row = i + 1;
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                errors.push(RowError {
                    row,
                    error: format!("unreadable row: {}", e),
                });
                continue;
            }
        };

        let email = record.get(email_idx).unwrap_or("").trim().to_lowercase();
        if email.is_empty() {
            errors.push(RowError {
                row,
                error: "missing email".to_string(),
            });
            continue;
        }
        if !validate_email(&email) {
            errors.push(RowError {
                row,
                error: format!("invalid email format: {}", email),
            });
            continue;
        }

        let name = match name_idx.and_then(|i| record.get(i)).map(str::trim) {
            Some(name) if !name.is_empty() => Some(name.to_string()),
            _ => {
                let first = first_idx.and_then(|i| record.get(i)).unwrap_or("").trim();
                let last = last_idx.and_then(|i| record.get(i)).unwrap_or("").trim();
                if first.is_empty() && last.is_empty() {
                    None
                } else if first.is_empty() {
                    Some(last.to_string())
                } else {
                    Some(join_name(first, Some(last)))
                }
            }
        };

        rows.push(ImportedRow { row, email, name });
    }

    Ok(ImportResult { rows, errors })
}

pub struct ExportRow {
    pub email: String,
    pub name: Option<String>,
    pub status: String,
    /// Unix seconds, rendered as ISO-8601 UTC.
    pub created_at: i64,
}

/// Serialize subscribers to the export CSV layout.
pub fn write_subscriber_csv(rows: &[ExportRow]) -> Result<String, String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(["email", "first_name", "last_name", "status", "created_at"])
        .map_err(|e| e.to_string())?;

    for row in rows {
        let (first, last) = match &row.name {
            Some(name) => split_name(name),
            None => (String::new(), None),
        };
        let created = chrono::DateTime::from_timestamp(row.created_at, 0)
            .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
            .unwrap_or_default();
        writer
            .write_record([
                row.email.as_str(),
                first.as_str(),
                last.as_deref().unwrap_or(""),
                row.status.as_str(),
                created.as_str(),
            ])
            .map_err(|e| e.to_string())?;
    }

    let bytes = writer.into_inner().map_err(|e| e.to_string())?;
    String::from_utf8(bytes).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_name_and_email_columns() {
        let data = b"email,name\nUser@Example.com,Taro Yamada\n";
        let result = parse_subscriber_csv(data).unwrap();
        assert_eq!(result.errors.len(), 0);
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0].email, "user@example.com");
        assert_eq!(result.rows[0].name.as_deref(), Some("Taro Yamada"));
    }

    #[test]
    fn accepts_japanese_email_header() {
        let data = "メールアドレス,name\nuser@example.com,山田\n".as_bytes();
        let result = parse_subscriber_csv(data).unwrap();
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0].email, "user@example.com");
    }

    #[test]
    fn joins_first_and_last_name_columns() {
        let data = b"Email,first_name,last_name\nuser@example.com,Ada,Lovelace\n";
        let result = parse_subscriber_csv(data).unwrap();
        assert_eq!(result.rows[0].name.as_deref(), Some("Ada Lovelace"));
    }

    #[test]
    fn invalid_email_is_a_row_error_with_row_number() {
        let data = b"email\ngood@example.com\nnot-an-email\nalso@example.com\n";
        let result = parse_subscriber_csv(data).unwrap();
        assert_eq!(result.rows.len(), 2);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].row, 2);
    }

    #[test]
    fn missing_email_column_fails_whole_upload() {
        let data = b"first_name,last_name\nAda,Lovelace\n";
        assert!(parse_subscriber_csv(data).is_err());
    }

    #[test]
    fn export_splits_names_and_formats_timestamps() {
        let rows = vec![ExportRow {
            email: "user@example.com".to_string(),
            name: Some("Ada Lovelace".to_string()),
            status: "active".to_string(),
            created_at: 1_704_067_200,
        }];
        let out = write_subscriber_csv(&rows).unwrap();
        let mut lines = out.lines();
        assert_eq!(
            lines.next().unwrap(),
            "email,first_name,last_name,status,created_at"
        );
        assert_eq!(
            lines.next().unwrap(),
            "user@example.com,Ada,Lovelace,active,2024-01-01T00:00:00Z"
        );
    }
}
