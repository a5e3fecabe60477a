//! Prompts for schema extraction.
//!
//! Every prompt lives here so the wording can be reviewed and tested without a
//! live model. The JSON template inside the user prompt is generated from
//! [`crate::schema::FIELDS`], so the prompt and the record type cannot drift
//! apart.
//!
//! The model is told to write [`crate::schema::NOT_FOUND`] for anything the
//! documents do not state. It is never asked to infer or estimate.

use crate::schema::{FieldKind, FIELDS, NOT_FOUND, SECTIONS};
use std::fmt::Write as _;

/// System prompt: role and output discipline.
pub const SYSTEM_PROMPT: &str = r#"Eres un analista experto en convocatorias de subvenciones españolas. Tu tarea es extraer información estructurada de los documentos oficiales de una convocatoria.

Extrae EXACTAMENTE la información solicitada en el formato JSON indicado. Usa las palabras del documento siempre que sea posible. No inventes, no estimes y no completes datos con conocimiento general: si un dato no aparece en los documentos, escribe "No especificado".

Responde siempre con un único objeto JSON válido y nada más."#;

/// Rules appended after the JSON template.
pub const EXTRACTION_RULES: &str = r#"## REGLAS DE EXTRACCIÓN

1. **PRECISIÓN**: Usa las palabras exactas del documento cuando sea posible.
2. **SIN SUPOSICIONES**: Si no encuentras un dato en el texto, escribe exactamente "No especificado". Nunca lo deduzcas.
3. **FORMATO**: Respeta exactamente la estructura JSON solicitada, con las mismas claves.
4. **DISTRIBUCIÓN TERRITORIAL**: Si hay tablas de reparto por provincias o municipios, extrae cada territorio con su importe. Si no hay reparto, escribe "No especificado".
5. **CUANTÍAS**: Incluye importes con su moneda tal como aparecen (p. ej. "1.500.000,00 €"), y porcentajes o módulos de cálculo si los hay.
6. **FECHAS**: Mantén las fechas en el formato del documento; prefiere DD/MM/AAAA cuando el documento las da así.
7. **ENLACES**: `enlace_tramite` solo si aparece una URL completa (http/https) en el texto.

IMPORTANTE: Devuelve ÚNICAMENTE el JSON, sin explicaciones ni bloques de código."#;

/// Appended where source text was cut to fit the prompt budget.
pub const TRUNCATION_MARKER: &str = "\n\n[... TEXTO TRUNCADO: el documento continúa pero excede el límite de longitud ...]";

/// One named document text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentText {
    pub name: String,
    pub text: String,
}

/// Everything the model gets to read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceMaterial {
    /// Announcement metadata, e.g. the BDNS API record as pretty JSON.
    pub announcement_data: Option<String>,
    pub documents: Vec<DocumentText>,
}

impl SourceMaterial {
    pub fn is_empty(&self) -> bool {
        self.announcement_data
            .as_deref()
            .is_none_or(|d| d.trim().is_empty())
            && self.documents.iter().all(|d| d.text.trim().is_empty())
    }
}

/// Final prompt pair sent to the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltPrompt {
    pub system: String,
    pub user: String,
    /// Source text was cut to `max_prompt_chars`.
    pub truncated: bool,
    /// Source characters before truncation.
    pub source_chars: usize,
}

impl BuiltPrompt {
    pub fn char_count(&self) -> usize {
        self.system.chars().count() + self.user.chars().count()
    }
}

/// Build the prompt. Deterministic for a given input.
///
/// `max_source_chars` bounds the source section only; the instructions and
/// template are always sent whole.
pub fn build_prompt(material: &SourceMaterial, max_source_chars: usize) -> BuiltPrompt {
    let source = render_source(material);
    let source_chars = source.chars().count();
    let (source, truncated) = truncate_chars(&source, max_source_chars);

    let mut user = String::with_capacity(source.len() + 4096);
    user.push_str("# ANÁLISIS DE CONVOCATORIA DE SUBVENCIÓN\n\n");
    user.push_str(source);
    if truncated {
        user.push_str(TRUNCATION_MARKER);
    }
    user.push_str("\n\n## INSTRUCCIONES\n\n");
    user.push_str(
        "Extrae la siguiente información de la convocatoria y devuélvela en formato JSON. \
         Cada valor del modelo describe qué debe contener el campo:\n\n",
    );
    user.push_str("```json\n");
    user.push_str(&json_template());
    user.push_str("\n```\n\n");
    user.push_str(EXTRACTION_RULES);

    BuiltPrompt {
        system: SYSTEM_PROMPT.to_string(),
        user,
        truncated,
        source_chars,
    }
}

fn render_source(material: &SourceMaterial) -> String {
    let mut out = String::new();

    out.push_str("## DATOS DE LA CONVOCATORIA\n\n");
    match material.announcement_data.as_deref().map(str::trim) {
        Some(data) if !data.is_empty() => out.push_str(data),
        _ => out.push_str(NOT_FOUND),
    }

    out.push_str("\n\n## DOCUMENTOS OFICIALES\n");
    let documents: Vec<&DocumentText> = material
        .documents
        .iter()
        .filter(|d| !d.text.trim().is_empty())
        .collect();
    if documents.is_empty() {
        out.push('\n');
        out.push_str(NOT_FOUND);
    }
    for doc in documents {
        let _ = write!(out, "\n=== DOCUMENT: {} ===\n{}\n", doc.name, doc.text.trim());
    }
    out.trim_end().to_string()
}

/// JSON skeleton of the record, one hint per field.
pub fn json_template() -> String {
    let mut out = String::from("{\n");
    for (i, (section, _title)) in SECTIONS.iter().enumerate() {
        let _ = writeln!(out, "    {}: {{", quote(section));
        let fields: Vec<_> = FIELDS.iter().filter(|f| f.section == *section).collect();
        for (j, field) in fields.iter().enumerate() {
            let hint = quote(field.hint);
            let value = match field.kind {
                FieldKind::TextList => format!("[{hint}]"),
                FieldKind::AmountMap => format!("{{{}: {hint}}}", quote("provincia o territorio")),
                FieldKind::Text | FieldKind::Amount | FieldKind::DateWindow | FieldKind::Url => hint,
            };
            let comma = if j + 1 < fields.len() { "," } else { "" };
            let _ = writeln!(out, "        {}: {value}{comma}", quote(field.key));
        }
        let comma = if i + 1 < SECTIONS.len() { "," } else { "" };
        let _ = writeln!(out, "    }}{comma}");
    }
    out.push('}');
    out
}

fn quote(s: &str) -> String {
    serde_json::Value::from(s).to_string()
}

/// Cut `s` to at most `max` characters on a character boundary.
pub fn truncate_chars(s: &str, max: usize) -> (&str, bool) {
    match s.char_indices().nth(max) {
        Some((byte_idx, _)) => (&s[..byte_idx], true),
        None => (s, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn material() -> SourceMaterial {
        SourceMaterial {
            announcement_data: Some(r#"{"codigoBDNS": "845133"}"#.to_string()),
            documents: vec![DocumentText {
                name: "Extracto.pdf".to_string(),
                text: "Organismo emisor: Consejería de Agricultura".to_string(),
            }],
        }
    }

    #[test]
    fn template_is_valid_json_with_every_field() {
        let value: serde_json::Value = serde_json::from_str(&json_template()).unwrap();
        for field in FIELDS {
            assert!(value[field.section].get(field.key).is_some(), "{}", field.path);
        }
        assert!(value["detalles"]["beneficiarios"].is_array());
        assert!(value["condiciones_economicas"]["distribucion_territorial"].is_object());
    }

    #[test]
    fn prompt_contains_sections_in_order() {
        let prompt = build_prompt(&material(), 10_000);
        let user = &prompt.user;
        let data = user.find("## DATOS DE LA CONVOCATORIA").unwrap();
        let docs = user.find("## DOCUMENTOS OFICIALES").unwrap();
        let header = user.find("=== DOCUMENT: Extracto.pdf ===").unwrap();
        let rules = user.find("## REGLAS DE EXTRACCIÓN").unwrap();
        assert!(data < docs && docs < header && header < rules);
        assert!(user.contains("Consejería de Agricultura"));
        assert!(!prompt.truncated);
    }

    #[test]
    fn prompt_is_deterministic() {
        assert_eq!(build_prompt(&material(), 10_000), build_prompt(&material(), 10_000));
    }

    #[test]
    fn prompt_never_invites_guessing() {
        let prompt = build_prompt(&material(), 10_000);
        let all = format!("{}\n{}", prompt.system, prompt.user).to_lowercase();
        assert!(all.contains("no especificado"));
        assert!(!all.contains("conocimiento sobre convocatorias"));
        assert!(!all.contains("probablemente"));
    }

    #[test]
    fn long_source_is_truncated_on_char_boundary() {
        let material = SourceMaterial {
            announcement_data: None,
            documents: vec![DocumentText {
                name: "bases.pdf".into(),
                text: "ñ".repeat(5_000),
            }],
        };
        let prompt = build_prompt(&material, 1_000);
        assert!(prompt.truncated);
        assert!(prompt.source_chars > 5_000);
        assert!(prompt.user.contains(TRUNCATION_MARKER));
        // Instructions survive truncation.
        assert!(prompt.user.contains("## REGLAS DE EXTRACCIÓN"));
    }

    #[test]
    fn missing_material_is_marked() {
        let prompt = build_prompt(&SourceMaterial::default(), 10_000);
        assert!(prompt.user.contains("## DATOS DE LA CONVOCATORIA\n\nNo especificado"));
        assert!(SourceMaterial::default().is_empty());
    }

    #[test]
    fn truncate_chars_counts_characters() {
        assert_eq!(truncate_chars("añb", 2), ("añ", true));
        assert_eq!(truncate_chars("añb", 3), ("añb", false));
        assert_eq!(truncate_chars("", 0), ("", false));
    }
}
