//! Schema validation: turn the model's reply into a [`StructuredRecord`].
//!
//! The reply must contain one JSON object with at least one of the four
//! schema sections; anything else is a validation error and is never
//! retried. Inside a valid object each field is coerced on its own. A field
//! that is missing, null, empty, a placeholder such as "N/A", an echo of the
//! template hint, or of the wrong shape becomes [`Extracted::NotFound`]; a
//! bad field never sinks the whole record.

use crate::error::AnalysisError;
use crate::schema::{
    DeadlinesAndProcedure, Details, EconomicConditions, Extracted, Identification,
    MonetaryAmount, StructuredRecord, SubmissionWindow, FIELDS, SECTIONS,
};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

/// Parse and coerce a raw model reply.
pub fn validate(raw: &str) -> Result<StructuredRecord, AnalysisError> {
    let value = extract_json_from_text(raw).ok_or_else(|| AnalysisError::MalformedResponse {
        detail: format!("no JSON object found in {} chars of output", raw.chars().count()),
    })?;

    let Value::Object(root) = value else {
        return Err(AnalysisError::MalformedResponse {
            detail: format!("expected a JSON object, got {}", json_type(&value)),
        });
    };

    if !SECTIONS.iter().any(|(key, _)| root.contains_key(*key)) {
        return Err(AnalysisError::MalformedResponse {
            detail: "JSON object has none of the expected sections".to_string(),
        });
    }

    let empty = Map::new();
    let id = section(&root, "identificacion", &empty);
    let det = section(&root, "detalles", &empty);
    let eco = section(&root, "condiciones_economicas", &empty);
    let plz = section(&root, "plazos_procedimiento", &empty);

    let record = StructuredRecord {
        identificacion: Identification {
            organismo_emisor: text(id, "organismo_emisor"),
            titulo_convocatoria: text(id, "titulo_convocatoria"),
            base_reguladora: text(id, "base_reguladora"),
        },
        detalles: Details {
            beneficiarios: text_list(det, "beneficiarios"),
            finalidad_ayuda: text(det, "finalidad_ayuda"),
        },
        condiciones_economicas: EconomicConditions {
            presupuesto_total: amount(eco, "presupuesto_total"),
            distribucion_territorial: amount_map(eco, "distribucion_territorial"),
            cuantia_por_solicitud: amount(eco, "cuantia_por_solicitud"),
        },
        plazos_procedimiento: DeadlinesAndProcedure {
            plazo_presentacion: date_window(plz, "plazo_presentacion"),
            plazo_resolucion: text(plz, "plazo_resolucion"),
            medio_presentacion: text(plz, "medio_presentacion"),
            enlace_tramite: url(plz, "enlace_tramite"),
        },
    };

    debug!(
        "Validated record: {}/{} fields found",
        record.found_count(),
        FIELDS.len()
    );
    Ok(record)
}

fn section<'a>(root: &'a Map<String, Value>, key: &str, empty: &'a Map<String, Value>) -> &'a Map<String, Value> {
    root.get(key).and_then(Value::as_object).unwrap_or(empty)
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ── JSON location ────────────────────────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:json|JSON)?\s*\n(.*)\n```\s*$").unwrap());

/// Find the JSON value in a model reply.
///
/// Tries, in order: the whole reply, the reply without outer code fences, the
/// first `{` to the last `}`, then the first fenced block anywhere.
pub fn extract_json_from_text(s: &str) -> Option<Value> {
    let t = s.trim().trim_matches('\u{feff}').trim();

    if let Ok(v) = serde_json::from_str::<Value>(t) {
        return Some(v);
    }

    if let Some(caps) = RE_OUTER_FENCES.captures(t) {
        if let Ok(v) = serde_json::from_str::<Value>(&caps[1]) {
            return Some(v);
        }
    }

    if let (Some(i), Some(j)) = (t.find('{'), t.rfind('}')) {
        if i < j {
            if let Ok(v) = serde_json::from_str::<Value>(&t[i..=j]) {
                return Some(v);
            }
        }
    }

    for marker in ["```json", "```"] {
        if let Some(start) = t.find(marker) {
            let body = &t[start + marker.len()..];
            if let Some(end) = body.find("```") {
                if let Ok(v) = serde_json::from_str::<Value>(&body[..end]) {
                    return Some(v);
                }
            }
        }
    }

    None
}

// ── Field coercion ───────────────────────────────────────────────────────────

const PLACEHOLDERS: &[&str] = &[
    "no especificado",
    "no especificada",
    "no especificados",
    "sin especificar",
    "no se especifica",
    "no indicado",
    "no consta",
    "no disponible",
    "no aplica",
    "desconocido",
    "n/a",
    "n/d",
    "na",
    "nd",
    "null",
    "none",
    "-",
    "--",
    "—",
    "...",
    "…",
];

/// True for values that only say "unknown".
pub fn is_placeholder(s: &str) -> bool {
    let normalized = s.trim().trim_end_matches('.').trim().to_lowercase();
    normalized.is_empty() || PLACEHOLDERS.contains(&normalized.as_str())
}

/// True when the model copied the template hint instead of answering.
fn is_template_echo(key: &str, s: &str) -> bool {
    FIELDS
        .iter()
        .any(|f| f.key == key && f.hint.eq_ignore_ascii_case(s.trim()))
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !is_placeholder(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn text(section: &Map<String, Value>, key: &str) -> Extracted<String> {
    let Some(value) = section.get(key) else {
        return Extracted::NotFound;
    };
    let found = match value {
        // A list where one string was asked for: keep every usable item.
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(scalar_text).collect();
            (!parts.is_empty()).then(|| parts.join("; "))
        }
        other => scalar_text(other),
    };
    found.filter(|s| !is_template_echo(key, s)).into()
}

fn text_list(section: &Map<String, Value>, key: &str) -> Extracted<Vec<String>> {
    let items: Vec<String> = match section.get(key) {
        Some(Value::Array(items)) => items.iter().filter_map(scalar_text).collect(),
        Some(other) => scalar_text(other).into_iter().collect(),
        None => Vec::new(),
    };
    let items: Vec<String> = items
        .into_iter()
        .filter(|s| !is_template_echo(key, s))
        .collect();
    if items.is_empty() {
        Extracted::NotFound
    } else {
        Extracted::Found(items)
    }
}

fn amount_value(key: &str, value: &Value) -> Option<MonetaryAmount> {
    let text = match value {
        // {"text": "...", "value": ...} echoes of our own output shape.
        Value::Object(obj) => obj.get("text").and_then(scalar_text)?,
        other => scalar_text(other)?,
    };
    (!is_template_echo(key, &text)).then(|| MonetaryAmount::parse(&text))
}

fn amount(section: &Map<String, Value>, key: &str) -> Extracted<MonetaryAmount> {
    section.get(key).and_then(|v| amount_value(key, v)).into()
}

fn amount_map(section: &Map<String, Value>, key: &str) -> Extracted<BTreeMap<String, MonetaryAmount>> {
    let Some(Value::Object(entries)) = section.get(key) else {
        return Extracted::NotFound;
    };
    let map: BTreeMap<String, MonetaryAmount> = entries
        .iter()
        .filter(|(territory, _)| !is_placeholder(territory) && territory.as_str() != "provincia o territorio")
        .filter_map(|(territory, v)| Some((territory.trim().to_string(), amount_value(key, v)?)))
        .collect();
    if map.is_empty() {
        Extracted::NotFound
    } else {
        Extracted::Found(map)
    }
}

fn date_window(section: &Map<String, Value>, key: &str) -> Extracted<SubmissionWindow> {
    section
        .get(key)
        .and_then(scalar_text)
        .filter(|s| !is_template_echo(key, s))
        .map(|s| SubmissionWindow::parse(&s))
        .into()
}

static RE_URL: Lazy<Regex> = Lazy::new(|| Regex::new(r#"https?://[^\s<>"')\]]+"#).unwrap());

fn url(section: &Map<String, Value>, key: &str) -> Extracted<String> {
    let Some(raw) = section.get(key).and_then(scalar_text) else {
        return Extracted::NotFound;
    };
    let candidate = RE_URL
        .find(&raw)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ';', ':']));
    match candidate.map(Url::parse) {
        Some(Ok(parsed)) if parsed.host_str().is_some() => Extracted::Found(parsed.to_string()),
        _ => Extracted::NotFound,
    }
}
