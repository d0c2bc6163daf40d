use serde_json::Value;

use super::{dedup_by_key, json_lines, take_list, take_str, value_to_string};
use crate::models::{stable_hash, NucleiFinding};

pub(super) fn parse(text: &str, label: &str, warnings: &mut Vec<String>) -> Vec<NucleiFinding> {
    let (objects, other) = json_lines(text);
    if !other.is_empty() {
        warnings.push(format!("{label}: skipped {} non-json line(s)", other.len()));
    }

    let mut findings = Vec::new();
    for mut obj in objects {
        let Some(template_id) = take_str(&mut obj, &["template-id", "templateID", "template_id"])
        else {
            warnings.push(format!("{label}: record without template id"));
            continue;
        };

        let (severity, name) = match obj.get_mut("info").and_then(Value::as_object_mut) {
            Some(info) => (
                info.remove("severity").as_ref().and_then(value_to_string),
                info.remove("name").as_ref().and_then(value_to_string),
            ),
            None => (None, None),
        };
        if obj
            .get("info")
            .and_then(Value::as_object)
            .is_some_and(|info| info.is_empty())
        {
            obj.remove("info");
        }

        let host = take_str(&mut obj, &["host"]);
        let matched_at = take_str(&mut obj, &["matched-at", "matched"])
            .or_else(|| host.clone())
            .unwrap_or_default();
        let extracted_results = take_list(&mut obj, &["extracted-results", "extracted_results"]);
        let timestamp = take_str(&mut obj, &["timestamp"]);

        findings.push(NucleiFinding {
            hash: stable_hash(&[&template_id, &matched_at]),
            severity: severity.unwrap_or_else(|| "unknown".into()).to_ascii_lowercase(),
            name: name.unwrap_or_else(|| template_id.clone()),
            template_id,
            matched_at,
            host,
            extracted_results,
            timestamp,
            extra: obj,
        });
    }
    dedup_by_key(findings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_aliases_and_dedups_by_template_and_location() {
        let text = r#"{"template-id":"tech-detect","info":{"name":"Tech Detect","severity":"INFO","tags":["tech"]},"host":"http://localhost:3000","matched-at":"http://localhost:3000/","extracted-results":["express"],"type":"http"}
{"templateID":"tech-detect","info":{"severity":"info"},"matched":"http://localhost:3000/"}
{"templateID":"missing-csp","info":{"severity":"low"},"host":"http://localhost:3000"}
"#;
        let mut warnings = Vec::new();
        let findings = parse(text, "nuclei.jsonl", &mut warnings);
        assert!(warnings.is_empty());
        assert_eq!(findings.len(), 2);

        let first = &findings[0];
        assert_eq!(first.severity, "info");
        assert_eq!(first.name, "Tech Detect");
        assert_eq!(first.extracted_results, vec!["express"]);
        assert_eq!(first.extra["type"], "http");
        assert_eq!(first.extra["info"]["tags"][0], "tech");

        assert_eq!(findings[1].matched_at, "http://localhost:3000");
        assert_eq!(findings[1].name, "missing-csp");
        assert!(!findings[1].extra.contains_key("info"));
    }
}
