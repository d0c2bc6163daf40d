//! ZAP baseline reports, in both the `-J` JSON and `-x` XML shapes.
//!
//! The XML report is mapped onto the same key layout as the JSON one so a
//! single code path builds findings from either.

use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::{dedup_by_key, take_str, value_to_string};
use crate::models::{stable_hash, ZapFinding};

const TEXT_LIMIT: usize = 240;

fn risk_from_code(code: &str) -> &'static str {
    match code {
        "1" => "Low",
        "2" => "Medium",
        "3" | "4" => "High",
        _ => "Informational",
    }
}

fn trim_text(value: Option<String>) -> String {
    let Some(text) = value else {
        return String::new();
    };
    let text = text.trim().replace('\n', " ");
    if text.chars().count() <= TEXT_LIMIT {
        return text;
    }
    let mut cut: String = text.chars().take(TEXT_LIMIT - 3).collect();
    cut.push_str("...");
    cut
}

fn instance_field(alert: &Map<String, Value>, field: &str) -> Option<String> {
    alert
        .get("instances")?
        .as_array()?
        .iter()
        .filter_map(|item| item.get(field))
        .find_map(value_to_string)
}

fn finding_from(site_name: &str, mut alert: Map<String, Value>) -> ZapFinding {
    let first_uri = instance_field(&alert, "uri");
    let first_evidence = instance_field(&alert, "evidence");
    let instance_len = alert
        .get("instances")
        .and_then(Value::as_array)
        .map(|items| items.len() as u32);
    alert.remove("instances");

    let plugin_id = take_str(&mut alert, &["pluginid", "alertRef", "id"]).unwrap_or_else(|| "unknown".into());
    let name = take_str(&mut alert, &["alert", "name"]).unwrap_or_else(|| "unknown".into());

    let riskdesc = take_str(&mut alert, &["riskdesc"]);
    let risk_word = take_str(&mut alert, &["risk"]);
    let riskcode = take_str(&mut alert, &["riskcode"]);
    let risk = riskdesc
        .as_deref()
        .and_then(|d| d.split('(').next())
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_string)
        .or(risk_word)
        .unwrap_or_else(|| risk_from_code(riskcode.as_deref().unwrap_or_default()).to_string());

    let confidence = take_str(&mut alert, &["confidence", "confidenceDesc", "confidencedesc"])
        .unwrap_or_else(|| "Unknown".into());
    let url = take_str(&mut alert, &["url"])
        .or(first_uri)
        .unwrap_or_else(|| site_name.to_string());
    let evidence = trim_text(take_str(&mut alert, &["evidence"]).or(first_evidence));
    let instances = take_str(&mut alert, &["count"])
        .and_then(|c| c.parse::<u32>().ok())
        .or(instance_len)
        .unwrap_or(0);

    ZapFinding {
        hash: stable_hash(&[&plugin_id, &url]),
        description: trim_text(take_str(&mut alert, &["desc"])),
        solution: trim_text(take_str(&mut alert, &["solution"])),
        reference: trim_text(take_str(&mut alert, &["reference"])),
        cweid: take_str(&mut alert, &["cweid"]).unwrap_or_default(),
        wascid: take_str(&mut alert, &["wascid"]).unwrap_or_default(),
        plugin_id,
        alert: name,
        risk,
        confidence,
        url,
        evidence,
        instances,
        extra: alert,
    }
}

fn collect(groups: Vec<(String, Map<String, Value>)>) -> Vec<ZapFinding> {
    let findings = groups
        .into_iter()
        .map(|(site, alert)| finding_from(&site, alert))
        .collect();
    dedup_by_key(findings)
}

pub(super) fn parse_json(text: &str, label: &str, warnings: &mut Vec<String>) -> Vec<ZapFinding> {
    let payload: Map<String, Value> = match serde_json::from_str(text) {
        Ok(Value::Object(map)) => map,
        Ok(_) => {
            warnings.push(format!("{label}: report is not a json object"));
            return Vec::new();
        }
        Err(e) => {
            warnings.push(format!("{label}: invalid json ({e})"));
            return Vec::new();
        }
    };

    let mut groups = Vec::new();
    if let Some(alerts) = payload.get("alerts").and_then(Value::as_array) {
        for alert in alerts.iter().filter_map(Value::as_object) {
            groups.push((String::new(), alert.clone()));
        }
    }

    let sites = match payload.get("site") {
        Some(Value::Array(items)) => items.clone(),
        Some(site @ Value::Object(_)) => vec![site.clone()],
        _ => Vec::new(),
    };
    for site in &sites {
        let name = site
            .get("@name")
            .or_else(|| site.get("name"))
            .and_then(value_to_string)
            .unwrap_or_default();
        let Some(alerts) = site.get("alerts").and_then(Value::as_array) else {
            continue;
        };
        for alert in alerts.iter().filter_map(Value::as_object) {
            groups.push((name.clone(), alert.clone()));
        }
    }

    collect(groups)
}

#[derive(Debug, Deserialize)]
struct XmlReport {
    #[serde(rename = "site", default)]
    sites: Vec<XmlSite>,
}

#[derive(Debug, Deserialize)]
struct XmlSite {
    #[serde(rename = "@name", default)]
    name: String,
    #[serde(default)]
    alerts: Option<XmlAlerts>,
}

#[derive(Debug, Deserialize)]
struct XmlAlerts {
    #[serde(rename = "alertitem", default)]
    items: Vec<XmlAlertItem>,
}

#[derive(Debug, Default, Deserialize)]
struct XmlAlertItem {
    pluginid: Option<String>,
    #[serde(rename = "alertRef")]
    alert_ref: Option<String>,
    alert: Option<String>,
    name: Option<String>,
    riskcode: Option<String>,
    riskdesc: Option<String>,
    confidence: Option<String>,
    desc: Option<String>,
    solution: Option<String>,
    reference: Option<String>,
    cweid: Option<String>,
    wascid: Option<String>,
    count: Option<String>,
    #[serde(default)]
    instances: Option<XmlInstances>,
}

#[derive(Debug, Deserialize)]
struct XmlInstances {
    #[serde(rename = "instance", default)]
    items: Vec<XmlInstance>,
}

#[derive(Debug, Deserialize)]
struct XmlInstance {
    uri: Option<String>,
    evidence: Option<String>,
}

impl XmlAlertItem {
    fn into_map(self) -> Map<String, Value> {
        let mut map = Map::new();
        let scalars = [
            ("pluginid", self.pluginid),
            ("alertRef", self.alert_ref),
            ("alert", self.alert),
            ("name", self.name),
            ("riskcode", self.riskcode),
            ("riskdesc", self.riskdesc),
            ("confidence", self.confidence),
            ("desc", self.desc),
            ("solution", self.solution),
            ("reference", self.reference),
            ("cweid", self.cweid),
            ("wascid", self.wascid),
            ("count", self.count),
        ];
        for (key, value) in scalars {
            if let Some(value) = value {
                map.insert(key.to_string(), Value::String(value));
            }
        }
        if let Some(instances) = self.instances {
            let items = instances
                .items
                .into_iter()
                .map(|i| json!({"uri": i.uri, "evidence": i.evidence}))
                .collect();
            map.insert("instances".into(), Value::Array(items));
        }
        map
    }
}

pub(super) fn parse_xml(text: &str, label: &str, warnings: &mut Vec<String>) -> Vec<ZapFinding> {
    let report: XmlReport = match quick_xml::de::from_str(text) {
        Ok(report) => report,
        Err(e) => {
            warnings.push(format!("{label}: invalid xml ({e})"));
            return Vec::new();
        }
    };

    let groups = report
        .sites
        .into_iter()
        .flat_map(|site| {
            let name = site.name;
            site.alerts
                .map(|a| a.items)
                .unwrap_or_default()
                .into_iter()
                .map(move |item| (name.clone(), item.into_map()))
        })
        .collect();
    collect(groups)
}
