use super::{dedup_by_key, json_lines, take_str};

/// `-oJ` lines carry `host`; older builds print one bare name per line.
pub(super) fn parse(text: &str, label: &str, warnings: &mut Vec<String>) -> Vec<String> {
    let (objects, other) = json_lines(text);
    let mut hosts = Vec::new();

    for mut obj in objects {
        match take_str(&mut obj, &["host", "input"]) {
            Some(host) => hosts.push(host.to_ascii_lowercase()),
            None => warnings.push(format!("{label}: record without host")),
        }
    }

    let mut skipped = 0usize;
    for line in other {
        if line.contains('.') && !line.contains(char::is_whitespace) {
            hosts.push(line.to_ascii_lowercase());
        } else {
            skipped += 1;
        }
    }
    if skipped > 0 {
        warnings.push(format!("{label}: skipped {skipped} unrecognised line(s)"));
    }

    dedup_by_key(hosts)
}
