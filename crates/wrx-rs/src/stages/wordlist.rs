//! Fuzzing words derived from what the crawler already found.

use std::{collections::HashMap, sync::OnceLock};

use regex::Regex;
use url::Url;

pub const DEFAULT_WORDS: &[&str] = &[
    "admin",
    "login",
    "dashboard",
    "api",
    "robots.txt",
    "sitemap.xml",
    "health",
];

const STOP_WORDS: &[&str] = &[
    "http", "https", "www", "com", "html", "php", "asp", "aspx", "jsp", "json", "xml", "js", "css",
    "png", "jpg", "jpeg", "svg", "woff", "woff2", "static", "assets", "images", "scripts",
];

fn token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[a-zA-Z][a-zA-Z0-9_-]{1,40}").expect("token pattern compiles"))
}

fn tokens(text: &str) -> impl Iterator<Item = &str> {
    token_re().find_iter(text).map(|m| m.as_str())
}

/// Ranks tokens from URL paths, query keys, fragments and file names by
/// frequency. Ties keep first-seen order. At least ten words are kept.
pub fn derive_context_words<'a>(urls: impl IntoIterator<Item = &'a str>, max_words: usize) -> Vec<String> {
    let mut order: Vec<String> = Vec::new();
    let mut counts: HashMap<String, usize> = HashMap::new();

    for raw in urls {
        let Ok(url) = Url::parse(raw.trim()) else {
            continue;
        };
        let path = url.path().replace('/', " ");
        let fragment = url.fragment().unwrap_or_default().replace('/', " ");
        let filename = url.path().rsplit('/').next().unwrap_or_default().replace('.', " ");
        let keys: Vec<String> = url.query_pairs().map(|(k, _)| k.into_owned()).collect();

        let found = tokens(&path)
            .chain(keys.iter().flat_map(|k| tokens(k)))
            .chain(tokens(&fragment))
            .chain(tokens(&filename))
            .map(str::to_ascii_lowercase)
            .collect::<Vec<_>>();

        for word in found {
            if STOP_WORDS.contains(&word.as_str()) || word.chars().all(|c| c.is_ascii_digit()) {
                continue;
            }
            let count = counts.entry(word.clone()).or_insert(0);
            if *count == 0 {
                order.push(word);
            }
            *count += 1;
        }
    }

    // Stable sort keeps first-seen order among equal counts.
    order.sort_by(|a, b| counts[b].cmp(&counts[a]));
    order.truncate(max_words.max(10));
    order
}

/// Built-in words first, then context words, lowercased and de-duplicated.
pub fn merge_words(context: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    DEFAULT_WORDS
        .iter()
        .map(|w| w.to_string())
        .chain(context.iter().cloned())
        .map(|w| w.trim().to_ascii_lowercase())
        .filter(|w| !w.is_empty() && seen.insert(w.clone()))
        .collect()
}
