//! The structured record extracted from a subsidy announcement.
//!
//! Four fixed sections, each field wrapped in [`Extracted`]. A field the
//! model could not locate is [`Extracted::NotFound`] and serialises as the
//! marker string [`NOT_FOUND`], the same marker the prompt asks the model to
//! write. Nothing is ever defaulted to a plausible value.
//!
//! Monetary fields keep the source wording and, when it parses, a
//! [`Decimal`] value in Spanish notation (`1.500.000,00 €`). The submission
//! window keeps its wording plus any dates found in it.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde::de::{self, DeserializeOwned, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Marker for a field absent from the source document.
pub const NOT_FOUND: &str = "No especificado";

// ── Extracted<T> ─────────────────────────────────────────────────────────────

/// A field value that is either present in the source or explicitly absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extracted<T> {
    Found(T),
    NotFound,
}

impl<T> Default for Extracted<T> {
    fn default() -> Self {
        Extracted::NotFound
    }
}

impl<T> Extracted<T> {
    pub fn is_found(&self) -> bool {
        matches!(self, Extracted::Found(_))
    }

    pub fn found(&self) -> Option<&T> {
        match self {
            Extracted::Found(v) => Some(v),
            Extracted::NotFound => None,
        }
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            Extracted::Found(v) => Some(v),
            Extracted::NotFound => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Extracted<U> {
        match self {
            Extracted::Found(v) => Extracted::Found(f(v)),
            Extracted::NotFound => Extracted::NotFound,
        }
    }
}

impl<T> From<Option<T>> for Extracted<T> {
    fn from(value: Option<T>) -> Self {
        value.map_or(Extracted::NotFound, Extracted::Found)
    }
}

impl<T: Serialize> Serialize for Extracted<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Extracted::Found(v) => v.serialize(serializer),
            Extracted::NotFound => serializer.serialize_str(NOT_FOUND),
        }
    }
}

impl<'de, T: DeserializeOwned> Deserialize<'de> for Extracted<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        match value {
            serde_json::Value::Null => Ok(Extracted::NotFound),
            serde_json::Value::String(ref s) if s == NOT_FOUND => Ok(Extracted::NotFound),
            other => serde_json::from_value(other)
                .map(Extracted::Found)
                .map_err(de::Error::custom),
        }
    }
}

// ── Record sections ──────────────────────────────────────────────────────────

/// Full extraction result.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StructuredRecord {
    pub identificacion: Identification,
    pub detalles: Details,
    pub condiciones_economicas: EconomicConditions,
    pub plazos_procedimiento: DeadlinesAndProcedure,
}

/// Who publishes the call and under which regulation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Identification {
    pub organismo_emisor: Extracted<String>,
    pub titulo_convocatoria: Extracted<String>,
    pub base_reguladora: Extracted<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Details {
    pub beneficiarios: Extracted<Vec<String>>,
    pub finalidad_ayuda: Extracted<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EconomicConditions {
    pub presupuesto_total: Extracted<MonetaryAmount>,
    /// Territory name → amount allocated to it.
    pub distribucion_territorial: Extracted<BTreeMap<String, MonetaryAmount>>,
    pub cuantia_por_solicitud: Extracted<MonetaryAmount>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadlinesAndProcedure {
    pub plazo_presentacion: Extracted<SubmissionWindow>,
    pub plazo_resolucion: Extracted<String>,
    pub medio_presentacion: Extracted<String>,
    /// Always an http(s) URL when found.
    pub enlace_tramite: Extracted<String>,
}

impl StructuredRecord {
    /// `section.field` paths of every field that was not found, in schema order.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let id = &self.identificacion;
        let det = &self.detalles;
        let eco = &self.condiciones_economicas;
        let plz = &self.plazos_procedimiento;

        let status = [
            id.organismo_emisor.is_found(),
            id.titulo_convocatoria.is_found(),
            id.base_reguladora.is_found(),
            det.beneficiarios.is_found(),
            det.finalidad_ayuda.is_found(),
            eco.presupuesto_total.is_found(),
            eco.distribucion_territorial.is_found(),
            eco.cuantia_por_solicitud.is_found(),
            plz.plazo_presentacion.is_found(),
            plz.plazo_resolucion.is_found(),
            plz.medio_presentacion.is_found(),
            plz.enlace_tramite.is_found(),
        ];

        FIELDS
            .iter()
            .zip(status)
            .filter(|(_, found)| !found)
            .map(|(field, _)| field.path)
            .collect()
    }

    /// Number of fields that were found.
    pub fn found_count(&self) -> usize {
        FIELDS.len() - self.missing_fields().len()
    }
}

// ── MonetaryAmount ───────────────────────────────────────────────────────────

/// A money figure as written in the source, plus its parsed value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonetaryAmount {
    /// Wording from the document, e.g. `"1.500.000,00 € (crédito 2024)"`.
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Decimal>,
    /// ISO currency code when one is mentioned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
}

/// Grouped thousands (`.`, space or NBSP) with optional decimal comma, or a
/// plain number with an optional decimal separator. Group 2 captures a scale
/// word (`mil`, `millón`, `millones`), group 3 a trailing currency marker.
static AMOUNT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(\d{1,3}(?:[.\s\u{00a0}]\d{3})+(?:,\d+)?|\d+(?:[.,]\d+)?)(?:\s*(millones|mill[oó]n|mil)\b(?:\s+de)?)?\s*(€|eur(?:os?)?\b)?",
    )
    .unwrap()
});

static EURO_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)€|\beur(?:os?)?\b").unwrap());

static THOUSANDS_ONLY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{1,3}(?:\.\d{3})+$").unwrap());

impl MonetaryAmount {
    /// Parse a free-text amount. The text is always kept; `value` is the
    /// first figure followed by a currency marker, else the first figure.
    pub fn parse(text: &str) -> Self {
        let text = text.trim();

        let mut first = None;
        let mut with_currency = None;
        for caps in AMOUNT_PATTERN.captures_iter(text) {
            let figure = caps.get(1).map(|m| (m.as_str(), caps.get(2).map(|s| s.as_str())));
            if first.is_none() {
                first = figure;
            }
            if caps.get(3).is_some() {
                with_currency = figure;
                break;
            }
        }

        let value = with_currency
            .or(first)
            .and_then(|(number, scale)| scaled(parse_spanish_number(number)?, scale));
        let currency = EURO_MARKER.is_match(text).then(|| "EUR".to_string());

        Self {
            text: text.to_string(),
            value,
            currency,
        }
    }
}

/// Apply a Spanish scale word: `mil` is 10³, `millón`/`millones` 10⁶.
fn scaled(value: Decimal, scale: Option<&str>) -> Option<Decimal> {
    let factor = match scale.map(str::to_lowercase).as_deref() {
        None => return Some(value),
        Some("mil") => Decimal::from(1_000),
        Some(_) => Decimal::from(1_000_000),
    };
    value.checked_mul(factor)
}

/// Parse a number written with Spanish separators: `.` groups thousands and
/// `,` marks decimals. A lone `.` that does not group thousands is a decimal
/// point.
pub fn parse_spanish_number(s: &str) -> Option<Decimal> {
    let cleaned: String = s
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == ',' || *c == '.')
        .collect();

    let normalized = if cleaned.contains(',') {
        cleaned.replace('.', "").replace(',', ".")
    } else if THOUSANDS_ONLY.is_match(&cleaned) {
        cleaned.replace('.', "")
    } else {
        cleaned
    };

    Decimal::from_str(&normalized).ok()
}

// ── SubmissionWindow ─────────────────────────────────────────────────────────

/// The application period as written, plus the dates found in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionWindow {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<NaiveDate>,
}

// DD/MM/AAAA, DD-MM-AAAA, DD.MM.AAAA
static DATE_DMY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{1,2})[./\-](\d{1,2})[./\-](\d{4})\b").unwrap());

static DATE_ISO: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{4})-(\d{1,2})-(\d{1,2})\b").unwrap());

static DATE_SPANISH_LONG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(\d{1,2})\s+de\s+(enero|febrero|marzo|abril|mayo|junio|julio|agosto|septiembre|setiembre|octubre|noviembre|diciembre)\s+(?:de\s+|del\s+)?(\d{4})\b",
    )
    .unwrap()
});

// A single date next to one of these words closes the window.
static END_HINT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(hasta|antes|finaliza|finalizará|termina|límite|limite|fin)\b").unwrap()
});

impl SubmissionWindow {
    /// Parse a free-text window such as `"Del 01/03/2024 al 31/03/2024"`.
    ///
    /// Two or more dates give start and end. A single date is the end when the
    /// wording says so (`hasta`, `antes del`, …) and the start otherwise.
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        let dates = dates_in(text);

        let (start, end) = match dates.as_slice() {
            [] => (None, None),
            [only] if END_HINT.is_match(text) => (None, Some(*only)),
            [only] => (Some(*only), None),
            [first, second, ..] => (Some(*first), Some(*second)),
        };

        Self {
            text: text.to_string(),
            start,
            end,
        }
    }
}

/// All valid calendar dates in `text`, in order of appearance.
fn dates_in(text: &str) -> Vec<NaiveDate> {
    let mut found: Vec<(usize, NaiveDate)> = Vec::new();

    for caps in DATE_DMY.captures_iter(text) {
        let day: u32 = caps[1].parse().unwrap_or(0);
        let month: u32 = caps[2].parse().unwrap_or(0);
        let year: i32 = caps[3].parse().unwrap_or(0);
        if let (Some(date), Some(m)) = (NaiveDate::from_ymd_opt(year, month, day), caps.get(0)) {
            found.push((m.start(), date));
        }
    }

    for caps in DATE_ISO.captures_iter(text) {
        let year: i32 = caps[1].parse().unwrap_or(0);
        let month: u32 = caps[2].parse().unwrap_or(0);
        let day: u32 = caps[3].parse().unwrap_or(0);
        if let (Some(date), Some(m)) = (NaiveDate::from_ymd_opt(year, month, day), caps.get(0)) {
            found.push((m.start(), date));
        }
    }

    for caps in DATE_SPANISH_LONG.captures_iter(text) {
        let day: u32 = caps[1].parse().unwrap_or(0);
        let month = spanish_month_to_number(&caps[2]);
        let year: i32 = caps[3].parse().unwrap_or(0);
        if let (Some(date), Some(m)) = (NaiveDate::from_ymd_opt(year, month, day), caps.get(0)) {
            found.push((m.start(), date));
        }
    }

    found.sort_by_key(|(pos, _)| *pos);
    let mut dates: Vec<NaiveDate> = found.into_iter().map(|(_, d)| d).collect();
    dates.dedup();
    dates
}

fn spanish_month_to_number(month: &str) -> u32 {
    match month.to_lowercase().as_str() {
        "enero" => 1,
        "febrero" => 2,
        "marzo" => 3,
        "abril" => 4,
        "mayo" => 5,
        "junio" => 6,
        "julio" => 7,
        "agosto" => 8,
        "septiembre" | "setiembre" => 9,
        "octubre" => 10,
        "noviembre" => 11,
        "diciembre" => 12,
        _ => 0,
    }
}

// ── Field catalogue ──────────────────────────────────────────────────────────

/// Value shape the model must produce for a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    TextList,
    Amount,
    AmountMap,
    DateWindow,
    Url,
}

/// One schema field, as shown to the model.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    /// `section.field`.
    pub path: &'static str,
    pub section: &'static str,
    pub key: &'static str,
    pub kind: FieldKind,
    /// Spanish instruction placed in the prompt's JSON template.
    pub hint: &'static str,
}

/// Section keys with their human-readable titles.
pub const SECTIONS: &[(&str, &str)] = &[
    ("identificacion", "Identification"),
    ("detalles", "Details"),
    ("condiciones_economicas", "Economic Conditions"),
    ("plazos_procedimiento", "Deadlines and Procedure"),
];

macro_rules! field {
    ($section:literal, $key:literal, $kind:expr, $hint:literal) => {
        FieldSpec {
            path: concat!($section, ".", $key),
            section: $section,
            key: $key,
            kind: $kind,
            hint: $hint,
        }
    };
}

/// Every field of [`StructuredRecord`], in serialisation order.
pub const FIELDS: &[FieldSpec] = &[
    field!("identificacion", "organismo_emisor", FieldKind::Text,
        "Organismo que publica la ayuda (Consejería, Dirección General, Ayuntamiento…)"),
    field!("identificacion", "titulo_convocatoria", FieldKind::Text,
        "Título completo u objeto de la convocatoria"),
    field!("identificacion", "base_reguladora", FieldKind::Text,
        "Normativa principal que rige la convocatoria (Orden, Real Decreto… con fecha)"),
    field!("detalles", "beneficiarios", FieldKind::TextList,
        "Lista de tipos de beneficiarios que pueden solicitar la ayuda"),
    field!("detalles", "finalidad_ayuda", FieldKind::Text,
        "Concepto específico que se subvenciona"),
    field!("condiciones_economicas", "presupuesto_total", FieldKind::Amount,
        "Cuantía total disponible, con moneda y detalles"),
    field!("condiciones_economicas", "distribucion_territorial", FieldKind::AmountMap,
        "Reparto del presupuesto por provincia o territorio"),
    field!("condiciones_economicas", "cuantia_por_solicitud", FieldKind::Amount,
        "Importe máximo por beneficiario o método de cálculo"),
    field!("plazos_procedimiento", "plazo_presentacion", FieldKind::DateWindow,
        "Fechas de inicio y fin ('Del DD/MM/AAAA al DD/MM/AAAA') o descripción del plazo"),
    field!("plazos_procedimiento", "plazo_resolucion", FieldKind::Text,
        "Tiempo máximo para resolver (p. ej. 'Seis meses')"),
    field!("plazos_procedimiento", "medio_presentacion", FieldKind::Text,
        "Cómo y dónde presentar la solicitud"),
    field!("plazos_procedimiento", "enlace_tramite", FieldKind::Url,
        "URL completa del trámite, si aparece"),
];

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn not_found_serialises_as_marker() {
        let value: Extracted<String> = Extracted::NotFound;
        assert_eq!(serde_json::to_string(&value).unwrap(), "\"No especificado\"");

        let back: Extracted<String> = serde_json::from_str("\"No especificado\"").unwrap();
        assert_eq!(back, Extracted::NotFound);
        let null: Extracted<String> = serde_json::from_str("null").unwrap();
        assert_eq!(null, Extracted::NotFound);
    }

    #[test]
    fn found_serialises_transparently() {
        let value = Extracted::Found(vec!["Pymes".to_string()]);
        assert_eq!(serde_json::to_string(&value).unwrap(), r#"["Pymes"]"#);
    }

    #[test]
    fn empty_record_has_every_field_missing() {
        let record = StructuredRecord::default();
        assert_eq!(record.missing_fields().len(), FIELDS.len());
        assert_eq!(record.found_count(), 0);
    }

    #[test]
    fn missing_fields_reports_paths() {
        let mut record = StructuredRecord::default();
        record.identificacion.organismo_emisor = Extracted::Found("Consejería".into());
        let missing = record.missing_fields();
        assert!(!missing.contains(&"identificacion.organismo_emisor"));
        assert!(missing.contains(&"plazos_procedimiento.enlace_tramite"));
        assert_eq!(record.found_count(), 1);
    }

    #[test]
    fn field_catalogue_matches_serialised_record() {
        let json = serde_json::to_value(StructuredRecord::default()).unwrap();
        for field in FIELDS {
            assert!(
                json[field.section].get(field.key).is_some(),
                "{} missing from serialised record",
                field.path
            );
        }
        let serialised_fields: usize = SECTIONS
            .iter()
            .map(|(s, _)| json[s].as_object().unwrap().len())
            .sum();
        assert_eq!(serialised_fields, FIELDS.len());
    }

    #[test]
    fn record_round_trips_through_json() {
        let mut record = StructuredRecord::default();
        record.condiciones_economicas.presupuesto_total =
            Extracted::Found(MonetaryAmount::parse("1.500.000,00 €"));
        let json = serde_json::to_string(&record).unwrap();
        let back: StructuredRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn spanish_amount_with_thousands_and_decimals() {
        let amount = MonetaryAmount::parse("1.500.000,00 €");
        assert_eq!(amount.value, Some(Decimal::new(150_000_000, 2)));
        assert_eq!(amount.currency.as_deref(), Some("EUR"));
        assert_eq!(amount.text, "1.500.000,00 €");
    }

    #[test]
    fn amount_prefers_figure_with_currency() {
        let amount = MonetaryAmount::parse("Ejercicio 2024: 250.000 euros");
        assert_eq!(amount.value, Some(Decimal::new(250_000, 0)));
    }

    #[test]
    fn scale_words_multiply_the_figure() {
        let amount = MonetaryAmount::parse("1,5 millones de euros");
        assert_eq!(amount.value, Some(Decimal::from(1_500_000)));
        assert_eq!(amount.currency.as_deref(), Some("EUR"));

        let amount = MonetaryAmount::parse("300 mil euros");
        assert_eq!(amount.value, Some(Decimal::from(300_000)));

        let amount = MonetaryAmount::parse("Un total de 2 Millón €");
        assert_eq!(amount.value, Some(Decimal::from(2_000_000)));
    }

    #[test]
    fn amount_without_figure_keeps_text() {
        let amount = MonetaryAmount::parse("Según módulos del anexo");
        assert_eq!(amount.value, None);
        assert_eq!(amount.currency, None);
        assert_eq!(amount.text, "Según módulos del anexo");
    }

    #[test]
    fn spanish_number_variants() {
        assert_eq!(parse_spanish_number("3.000"), Some(Decimal::new(3000, 0)));
        assert_eq!(parse_spanish_number("12,5"), Some(Decimal::new(125, 1)));
        assert_eq!(parse_spanish_number("1500000.50"), Some(Decimal::new(150_000_050, 2)));
        assert_eq!(parse_spanish_number("3 000"), Some(Decimal::new(3000, 0)));
        assert_eq!(parse_spanish_number(""), None);
    }

    #[test]
    fn window_with_two_dates() {
        let window = SubmissionWindow::parse("Del 01/03/2024 al 31/03/2024");
        assert_eq!(window.start, NaiveDate::from_ymd_opt(2024, 3, 1));
        assert_eq!(window.end, NaiveDate::from_ymd_opt(2024, 3, 31));
    }

    #[test]
    fn window_with_long_form_dates() {
        let window = SubmissionWindow::parse("Desde el 5 de mayo de 2025 hasta el 20 de junio de 2025");
        assert_eq!(window.start, NaiveDate::from_ymd_opt(2025, 5, 5));
        assert_eq!(window.end, NaiveDate::from_ymd_opt(2025, 6, 20));
    }

    #[test]
    fn single_date_with_end_wording_is_end() {
        let window = SubmissionWindow::parse("Hasta el 15-04-2024");
        assert_eq!(window.start, None);
        assert_eq!(window.end, NaiveDate::from_ymd_opt(2024, 4, 15));
    }

    #[test]
    fn relative_window_keeps_text_only() {
        let window =
            SubmissionWindow::parse("Un mes desde la publicación del extracto en el BOE");
        assert_eq!(window.start, None);
        assert_eq!(window.end, None);
    }

    #[test]
    fn invalid_calendar_dates_are_skipped() {
        let window = SubmissionWindow::parse("Del 31/02/2024 al 10/03/2024");
        assert_eq!(window.start, NaiveDate::from_ymd_opt(2024, 3, 10));
        assert_eq!(window.end, None);
    }
}
