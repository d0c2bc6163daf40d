use serde_json::Value;

use super::{dedup_by_key, json_lines, take_str, value_to_string};
use crate::models::{DiscoveredUrl, StageName};

pub(super) fn parse(text: &str, label: &str, warnings: &mut Vec<String>) -> Vec<DiscoveredUrl> {
    let (objects, other) = json_lines(text);
    let mut urls = Vec::new();

    for mut obj in objects {
        let nested = obj
            .get("request")
            .and_then(Value::as_object)
            .and_then(|req| req.get("endpoint").or_else(|| req.get("url")))
            .and_then(value_to_string);
        let Some(url) = take_str(&mut obj, &["url", "endpoint"]).or(nested) else {
            warnings.push(format!("{label}: record without endpoint"));
            continue;
        };
        let discovered_at = take_str(&mut obj, &["timestamp"]);

        let mut record = DiscoveredUrl::new(url, StageName::Crawl);
        record.discovered_at = discovered_at;
        record.extra = obj;
        urls.push(record);
    }

    for line in other {
        if line.starts_with("http") {
            urls.push(DiscoveredUrl::new(line, StageName::Crawl));
        } else {
            warnings.push(format!("{label}: unparseable line skipped"));
        }
    }

    dedup_by_key(urls)
}
