use serde_json::Value;

use super::{dedup_by_key, take_str, value_to_string};
use crate::models::{DiscoveredUrl, StageName};

/// ffuf's `-of json` document: `{"results": [{"url": ...}, ...], "time": ...}`.
pub(super) fn parse(text: &str, label: &str, warnings: &mut Vec<String>) -> Vec<DiscoveredUrl> {
    let payload: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warnings.push(format!("{label}: invalid json ({e})"));
            return Vec::new();
        }
    };
    let Some(results) = payload.get("results").and_then(Value::as_array) else {
        warnings.push(format!("{label}: no results array"));
        return Vec::new();
    };
    let run_time = payload.get("time").and_then(value_to_string);

    let mut urls = Vec::new();
    for item in results {
        let Some(mut obj) = item.as_object().cloned() else {
            continue;
        };
        let Some(url) = take_str(&mut obj, &["url"]) else {
            warnings.push(format!("{label}: result without url"));
            continue;
        };
        let mut record = DiscoveredUrl::new(url, StageName::Fuzz);
        record.discovered_at = run_time.clone();
        record.extra = obj;
        urls.push(record);
    }
    dedup_by_key(urls)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_results_and_run_time() {
        let text = r#"{"commandline":"ffuf ...","time":"2024-05-01T10:00:00Z","results":[
            {"input":{"FUZZ":"admin"},"status":301,"length":0,"url":"http://localhost:3000/admin"},
            {"input":{"FUZZ":"admin"},"status":301,"url":"http://localhost:3000/admin"},
            {"status":200}
        ]}"#;
        let mut warnings = Vec::new();
        let urls = parse(text, "ffuf.json", &mut warnings);
        assert_eq!(urls.len(), 1);
        assert_eq!(urls[0].source_stage, StageName::Fuzz);
        assert_eq!(urls[0].extra["status"], 301);
        assert_eq!(urls[0].discovered_at.as_deref(), Some("2024-05-01T10:00:00Z"));
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn malformed_document_warns() {
        let mut warnings = Vec::new();
        assert!(parse("{not json", "ffuf.json", &mut warnings).is_empty());
        assert!(warnings[0].contains("invalid json"));
    }
}
