use serde_json::Value;

use super::{dedup_by_key, json_lines, take_list, take_str};
use crate::models::{stable_hash, AliveHost};

pub(super) fn parse(text: &str, label: &str, warnings: &mut Vec<String>) -> Vec<AliveHost> {
    let (objects, other) = json_lines(text);
    let mut hosts = Vec::new();

    for mut obj in objects {
        let Some(url) = take_str(&mut obj, &["url", "input"]) else {
            warnings.push(format!("{label}: record without url"));
            continue;
        };
        let status_code = take_str(&mut obj, &["status_code", "status-code"])
            .and_then(|s| s.parse::<u16>().ok())
            .unwrap_or(0);
        let title = take_str(&mut obj, &["title"]);
        let tech = take_list(&mut obj, &["tech", "technologies"]);

        // The record's own timestamp would make the hash run-dependent.
        obj.remove("timestamp");

        hosts.push(AliveHost {
            hash: stable_hash(&[&url, &status_code.to_string()]),
            url,
            status_code,
            title,
            tech,
            extra: obj,
        });
    }

    // `httpx -silent` without -json prints bare URLs.
    for line in other {
        if line.starts_with("http") {
            let mut host = AliveHost::new(line.split_whitespace().next().unwrap_or(line), 0);
            host.extra.insert("plain".into(), Value::Bool(true));
            hosts.push(host);
        } else {
            warnings.push(format!("{label}: unparseable line skipped"));
        }
    }

    dedup_by_key(hosts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_fields_and_keeps_unknown_ones() {
        let text = r#"{"url":"http://localhost:3000","status_code":200,"title":"Juice Shop","tech":["Express"],"webserver":"node","timestamp":"2024-01-01T00:00:00Z"}
{"input":"http://localhost:3000","status-code":500}
http://localhost:4000
garbage
"#;
        let mut warnings = Vec::new();
        let hosts = parse(text, "httpx.jsonl", &mut warnings);
        assert_eq!(hosts.len(), 2);

        let first = &hosts[0];
        assert_eq!(first.status_code, 200);
        assert_eq!(first.title.as_deref(), Some("Juice Shop"));
        assert_eq!(first.tech, vec!["Express"]);
        assert_eq!(first.extra["webserver"], "node");
        assert!(!first.extra.contains_key("timestamp"));
        assert_eq!(first.hash, stable_hash(&["http://localhost:3000", "200"]));

        assert_eq!(hosts[1].url, "http://localhost:4000");
        assert_eq!(warnings.len(), 1);
    }
}
