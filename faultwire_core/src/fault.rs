use crate::protocol::{BUCKET_KEY, MonitorData};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Bucket used when the driver loses an agent for good in the middle of a trial.
pub const CONNECTION_FAILED_BUCKET: &str = "AgentConnectionFailed";

/// What the driver learned about one faulting trial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultRecord {
    pub detected: bool,
    pub data: MonitorData,
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct FaultSummary<'a> {
    trial: u64,
    bucket: &'a str,
    entries: Vec<&'a str>,
}

impl FaultRecord {
    pub fn detected(data: MonitorData) -> Self {
        Self {
            detected: true,
            data,
        }
    }

    pub fn connection_failure(reason: &str) -> Self {
        let mut data = MonitorData::new();
        data.insert(
            BUCKET_KEY.to_string(),
            CONNECTION_FAILED_BUCKET.as_bytes().to_vec(),
        );
        data.insert("AgentConnection.txt".to_string(), reason.as_bytes().to_vec());
        Self::detected(data)
    }

    /// The triage bucket: the `Bucket` entry, or the first agent-prefixed
    /// `<agent>_Bucket` entry when merged data carries several.
    pub fn bucket(&self) -> Option<String> {
        let suffix = format!("_{BUCKET_KEY}");
        self.data
            .get(BUCKET_KEY)
            .or_else(|| {
                self.data
                    .iter()
                    .find(|(key, _)| key.ends_with(&suffix))
                    .map(|(_, value)| value)
            })
            .map(|value| String::from_utf8_lossy(value).into_owned())
    }

    /// Derives a bucket from a digest of the data when no monitor supplied one.
    pub fn ensure_bucket(&mut self) -> String {
        if let Some(bucket) = self.bucket() {
            return bucket;
        }
        let mut context = md5::Context::new();
        for (key, value) in &self.data {
            context.consume(key.as_bytes());
            context.consume(value);
        }
        let bucket = format!("Unknown_{:x}", context.compute());
        self.data
            .insert(BUCKET_KEY.to_string(), bucket.clone().into_bytes());
        bucket
    }

    /// Writes every entry under `<dir>/<bucket>/<trial>/` plus a `fault.json` summary.
    pub fn write_to_dir(&self, dir: &Path, trial: u64) -> Result<PathBuf, anyhow::Error> {
        let bucket = self.bucket().unwrap_or_else(|| "Unknown".to_string());
        let target = dir.join(sanitize(&bucket)).join(trial.to_string());
        fs::create_dir_all(&target)
            .map_err(|e| anyhow::anyhow!("Failed to create fault directory {:?}: {}", target, e))?;

        for (key, value) in &self.data {
            fs::write(target.join(sanitize(key)), value)?;
        }
        let summary = FaultSummary {
            trial,
            bucket: &bucket,
            entries: self.data.keys().map(String::as_str).collect(),
        };
        fs::write(target.join("fault.json"), serde_json::to_vec_pretty(&summary)?)?;
        Ok(target)
    }
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.trim_matches('.').is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(pairs: &[(&str, &str)]) -> MonitorData {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn bucket_prefers_the_plain_key_then_agent_prefixed_ones() {
        let plain = FaultRecord::detected(data(&[("Bucket", "b1"), ("A_Bucket", "b2")]));
        assert_eq!(plain.bucket().as_deref(), Some("b1"));

        let merged = FaultRecord::detected(data(&[("A_log", "x"), ("B_Bucket", "b3")]));
        assert_eq!(merged.bucket().as_deref(), Some("b3"));

        assert_eq!(FaultRecord::detected(data(&[("A_log", "x")])).bucket(), None);
    }

    #[test]
    fn derived_bucket_is_stable_for_equal_data() {
        let mut first = FaultRecord::detected(data(&[("A_log", "boom")]));
        let mut second = first.clone();
        let bucket = first.ensure_bucket();
        assert!(bucket.starts_with("Unknown_"));
        assert_eq!(second.ensure_bucket(), bucket);
        assert_eq!(first.bucket(), Some(bucket));
    }

    #[test]
    fn connection_failure_uses_its_own_bucket() {
        let record = FaultRecord::connection_failure("agent A unreachable");
        assert_eq!(record.bucket().as_deref(), Some(CONNECTION_FAILED_BUCKET));
    }

    #[test]
    fn fault_is_written_under_bucket_and_trial() {
        let dir = tempfile::tempdir().unwrap();
        let record = FaultRecord::detected(data(&[
            ("A_Bucket", "EarlyExit_1"),
            ("A_Process.txt", "exited"),
            ("../escape", "nope"),
        ]));

        let target = record.write_to_dir(dir.path(), 7).unwrap();

        assert_eq!(target, dir.path().join("EarlyExit_1").join("7"));
        assert_eq!(fs::read(target.join("A_Process.txt")).unwrap(), b"exited".to_vec());
        assert!(target.join(".._escape").exists(), "Path separators are flattened");
        let summary: serde_json::Value =
            serde_json::from_slice(&fs::read(target.join("fault.json")).unwrap()).unwrap();
        assert_eq!(summary["trial"], 7);
        assert_eq!(summary["bucket"], "EarlyExit_1");
    }

    #[test]
    fn sanitize_keeps_names_inside_the_directory() {
        assert_eq!(sanitize("a/b"), "a_b");
        assert_eq!(sanitize(".."), "_");
        assert_eq!(sanitize("Process.txt"), "Process.txt");
    }
}
