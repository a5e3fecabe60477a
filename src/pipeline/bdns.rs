//! Attached documents listed in a BDNS API record.
//!
//! The API record for an announcement carries a `documentos` array. Entries
//! that are PDFs (declared `tipo: "PDF"` or a `.pdf` name) and have an `id`
//! can be downloaded from the public document endpoint.

use crate::pipeline::resolve::BdnsCode;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, info};

/// Download endpoint for one attached document.
pub const DOCUMENT_URL_TEMPLATE: &str =
    "https://www.subvenciones.gob.es/bdnstrans/GE/es/convocatoria/{code}/document/{id}";

/// A PDF attached to an announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedDocument {
    pub name: String,
    pub id: String,
    pub url: Url,
}

/// List the PDFs attached to an API record, in record order, without duplicates.
pub fn linked_documents(record: &Value, code: &BdnsCode) -> Vec<LinkedDocument> {
    let records: Vec<&Value> = match record {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };

    let mut seen = HashSet::new();
    let mut found = Vec::new();

    for entry in records
        .into_iter()
        .filter_map(|r| r.get("documentos"))
        .filter_map(Value::as_array)
        .flatten()
    {
        let Some(doc) = parse_entry(entry, code) else {
            continue;
        };
        if seen.insert(doc.id.clone()) {
            debug!("Found linked PDF: {} ({})", doc.name, doc.url);
            found.push(doc);
        }
    }

    info!("BDNS record for {} lists {} PDF(s)", code, found.len());
    found
}

fn parse_entry(entry: &Value, code: &BdnsCode) -> Option<LinkedDocument> {
    let name = ["nombreFic", "nombre", "name"]
        .iter()
        .find_map(|key| entry.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or("Unknown");
    let doc_type = ["tipo", "type"]
        .iter()
        .find_map(|key| entry.get(*key).and_then(Value::as_str))
        .unwrap_or("");

    let is_pdf = doc_type.eq_ignore_ascii_case("pdf") || name.to_lowercase().contains("pdf");
    if !is_pdf {
        return None;
    }

    let id = match entry.get("id")? {
        Value::String(s) if !s.trim().is_empty() => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };

    let raw = DOCUMENT_URL_TEMPLATE
        .replace("{code}", code.as_str())
        .replace("{id}", &id);
    let url = Url::parse(&raw).ok()?;

    Some(LinkedDocument {
        name: name.to_string(),
        id,
        url,
    })
}
