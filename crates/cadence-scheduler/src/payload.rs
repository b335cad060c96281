//! Typed job payloads.
//!
//! The store keeps `job_type` and `job_data` as two columns; this module turns
//! that pair into a [`JobPayload`] and rejects data that does not match the
//! schema of a known job type, so handlers never see a malformed payload.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};

pub const BATCH_TEXT_CLASSIFICATION: &str = "batch_text_classification";
pub const EXPORT: &str = "export";
pub const CLEANUP: &str = "cleanup";

/// Classify every record of a file with a coordinating model and a worker model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchClassification {
    pub file_path: String,
    pub labels: Vec<String>,
    #[serde(default)]
    pub instructions: String,
    pub mother_ai_model: String,
    pub child_ai_model: String,
}

/// Export the results of another job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRequest {
    pub source_job_id: String,
    pub export_format: String,
    #[serde(default)]
    pub recipients: Vec<String>,
}

/// Remove artefacts older than `days_old`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupRequest {
    #[serde(default = "default_days_old")]
    pub days_old: u32,
}

fn default_days_old() -> u32 {
    30
}

/// Payload of a job, keyed by job type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawPayload", into = "RawPayload")]
pub enum JobPayload {
    BatchTextClassification(BatchClassification),
    Export(ExportRequest),
    Cleanup(CleanupRequest),
    /// Any job type without a built-in schema. The data is passed through untouched.
    Custom {
        job_type: String,
        data: serde_json::Value,
    },
}

impl JobPayload {
    /// Build and validate a payload from its stored parts.
    pub fn from_parts(job_type: &str, data: serde_json::Value) -> Result<Self> {
        let job_type = job_type.trim();
        if job_type.is_empty() {
            return Err(SchedulerError::Validation("job_type must not be empty".into()));
        }
        if job_type.chars().any(char::is_whitespace) {
            return Err(SchedulerError::Validation(format!(
                "job_type must not contain whitespace: {job_type:?}"
            )));
        }

        let payload = match job_type {
            BATCH_TEXT_CLASSIFICATION => {
                let p: BatchClassification = parse_schema(job_type, data)?;
                if p.file_path.is_empty() {
                    return Err(invalid(job_type, "file_path must not be empty"));
                }
                if p.labels.is_empty() {
                    return Err(invalid(job_type, "at least one label is required"));
                }
                JobPayload::BatchTextClassification(p)
            }
            EXPORT => {
                let p: ExportRequest = parse_schema(job_type, data)?;
                if p.source_job_id.is_empty() || p.export_format.is_empty() {
                    return Err(invalid(
                        job_type,
                        "source_job_id and export_format are required",
                    ));
                }
                JobPayload::Export(p)
            }
            CLEANUP => {
                // `{}` and `null` both mean "use the defaults".
                let data = if data.is_null() {
                    serde_json::json!({})
                } else {
                    data
                };
                JobPayload::Cleanup(parse_schema(job_type, data)?)
            }
            other => JobPayload::Custom {
                job_type: other.to_string(),
                data,
            },
        };
        Ok(payload)
    }

    pub fn job_type(&self) -> &str {
        match self {
            JobPayload::BatchTextClassification(_) => BATCH_TEXT_CLASSIFICATION,
            JobPayload::Export(_) => EXPORT,
            JobPayload::Cleanup(_) => CLEANUP,
            JobPayload::Custom { job_type, .. } => job_type,
        }
    }

    /// The JSON stored in the `job_data` column.
    pub fn data(&self) -> serde_json::Value {
        // Serializing plain derive structs into a Value cannot fail.
        match self {
            JobPayload::BatchTextClassification(p) => serde_json::to_value(p),
            JobPayload::Export(p) => serde_json::to_value(p),
            JobPayload::Cleanup(p) => serde_json::to_value(p),
            JobPayload::Custom { data, .. } => Ok(data.clone()),
        }
        .unwrap_or(serde_json::Value::Null)
    }
}

fn parse_schema<T: serde::de::DeserializeOwned>(
    job_type: &str,
    data: serde_json::Value,
) -> Result<T> {
    serde_json::from_value(data).map_err(|e| invalid(job_type, &e.to_string()))
}

fn invalid(job_type: &str, reason: &str) -> SchedulerError {
    SchedulerError::Validation(format!("invalid {job_type} payload: {reason}"))
}

#[derive(Clone, Serialize, Deserialize)]
struct RawPayload {
    job_type: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl TryFrom<RawPayload> for JobPayload {
    type Error = String;

    fn try_from(raw: RawPayload) -> std::result::Result<Self, Self::Error> {
        JobPayload::from_parts(&raw.job_type, raw.data).map_err(|e| e.to_string())
    }
}

impl From<JobPayload> for RawPayload {
    fn from(payload: JobPayload) -> Self {
        RawPayload {
            job_type: payload.job_type().to_string(),
            data: payload.data(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn known_type_with_wrong_shape_is_rejected() {
        let err = JobPayload::from_parts(EXPORT, json!({ "format": "csv" })).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert!(err.to_string().contains("export"));
    }

    #[test]
    fn batch_requires_labels() {
        let data = json!({
            "file_path": "/data/in.csv",
            "labels": [],
            "mother_ai_model": "m",
            "child_ai_model": "c",
        });
        assert!(JobPayload::from_parts(BATCH_TEXT_CLASSIFICATION, data).is_err());
    }

    #[test]
    fn cleanup_defaults_days_old() {
        let p = JobPayload::from_parts(CLEANUP, serde_json::Value::Null).unwrap();
        assert_eq!(p, JobPayload::Cleanup(CleanupRequest { days_old: 30 }));
    }

    #[test]
    fn unknown_type_is_custom_passthrough() {
        let p = JobPayload::from_parts("reindex", json!({ "shard": 4 })).unwrap();
        assert_eq!(p.job_type(), "reindex");
        assert_eq!(p.data(), json!({ "shard": 4 }));
    }

    #[test]
    fn empty_or_spaced_job_type_is_rejected() {
        assert!(JobPayload::from_parts("", json!({})).is_err());
        assert!(JobPayload::from_parts("two words", json!({})).is_err());
    }

    #[test]
    fn serde_uses_type_and_data_envelope() {
        let p = JobPayload::from_parts(EXPORT, json!({ "source_job_id": "j1", "export_format": "csv" }))
            .unwrap();
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["job_type"], "export");
        assert_eq!(v["data"]["recipients"], json!([]));
        let back: JobPayload = serde_json::from_value(v).unwrap();
        assert_eq!(back, p);
    }
}
