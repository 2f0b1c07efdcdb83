//! Field extraction rules
//!
//! Maps recognized text to structured fields per document category. Each
//! category has a base confidence that is scaled by the share of its required
//! fields actually found in the text.

use crate::extraction::model::{DocumentCategory, ExtractedData};
use regex_lite::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// Output of [`extract_fields`]
#[derive(Debug, Clone, PartialEq)]
pub struct FieldExtraction {
    pub data: ExtractedData,
    pub confidence: f64,
}

struct Patterns {
    id_number: Regex,
    tax_number: Regex,
    date: Regex,
    amount: Regex,
    postal_code: Regex,
    street: Regex,
    city_state: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        id_number: Regex::new(r"\b(\d{1,2}\.?\d{3}\.?\d{3}-?[\dXx])\b").expect("valid regex"),
        tax_number: Regex::new(r"\b(\d{3}\.?\d{3}\.?\d{3}-?\d{2})\b").expect("valid regex"),
        date: Regex::new(r"\b(\d{2}/\d{2}/\d{4})\b").expect("valid regex"),
        amount: Regex::new(r"R\$\s*(\d{1,3}(?:\.\d{3})*,\d{2})").expect("valid regex"),
        postal_code: Regex::new(r"\b(\d{5}-\d{3})\b").expect("valid regex"),
        street: Regex::new(r"(?i)\b(RUA|AV|AVENIDA|ALAMEDA|PRAÇA|TRAVESSA)\b").expect("valid regex"),
        city_state: Regex::new(r"([A-Za-zÀ-ÿ][A-Za-zÀ-ÿ\s]*?)\s*[,-]\s*([A-Z]{2})\b")
            .expect("valid regex"),
    })
}

/// Base confidence per category when every required field is present
pub fn base_confidence(category: DocumentCategory) -> f64 {
    match category {
        DocumentCategory::IdCard => 0.85,
        DocumentCategory::TaxId => 0.90,
        DocumentCategory::IncomeProof => 0.75,
        DocumentCategory::AddressProof => 0.80,
        DocumentCategory::Other => 0.70,
    }
}

/// Extract structured fields from `text` for `category`
pub fn extract_fields(text: &str, category: DocumentCategory) -> FieldExtraction {
    let p = patterns();
    let mut data = ExtractedData::new();

    let required: &[&str] = match category {
        DocumentCategory::IdCard => {
            put(&mut data, "id_number", first_capture(&p.id_number, text));
            put(&mut data, "birth_date", first_capture(&p.date, text));
            put(&mut data, "name", line_after(text, "NOME"));
            put(&mut data, "parentage", line_after(text, "FILIAÇÃO"));
            &["id_number", "birth_date"]
        }
        DocumentCategory::TaxId => {
            put(&mut data, "tax_id", first_capture(&p.tax_number, text));
            put(&mut data, "name", line_after(text, "NOME"));
            &["tax_id"]
        }
        DocumentCategory::IncomeProof => {
            put(
                &mut data,
                "amount",
                first_capture(&p.amount, text).map(|v| format!("R$ {v}")),
            );
            put(&mut data, "date", first_capture(&p.date, text));
            put(&mut data, "issuer", first_line(text));
            &["amount", "date"]
        }
        DocumentCategory::AddressProof => {
            put(&mut data, "postal_code", first_capture(&p.postal_code, text));
            let mut address = None;
            let mut city_state = None;
            for line in text.lines() {
                if p.street.is_match(line) {
                    address = Some(line.trim().to_string());
                }
                if let Some(caps) = p.city_state.captures(line) {
                    city_state = Some(format!("{} - {}", caps[1].trim(), &caps[2]));
                }
            }
            put(&mut data, "address", address);
            put(&mut data, "city_state", city_state);
            &["postal_code", "address"]
        }
        DocumentCategory::Other => {
            let trimmed = text.trim();
            put(
                &mut data,
                "full_text",
                (!trimmed.is_empty()).then(|| trimmed.to_string()),
            );
            &["full_text"]
        }
    };

    let found = required
        .iter()
        .filter(|key| data.get(**key).is_some_and(|v| !v.is_null()))
        .count();
    let confidence = base_confidence(category) * found as f64 / required.len() as f64;

    FieldExtraction {
        data,
        confidence: confidence.clamp(0.0, 1.0),
    }
}

fn put(data: &mut ExtractedData, key: &str, value: Option<String>) {
    let value = value.map(Value::String).unwrap_or(Value::Null);
    data.insert(key.to_string(), value);
}

fn first_capture(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

fn first_line(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

/// The non-empty line following the first line that contains `label`
fn line_after(text: &str, label: &str) -> Option<String> {
    let lines: Vec<&str> = text.lines().collect();
    lines
        .iter()
        .position(|l| l.to_uppercase().contains(label))
        .and_then(|i| lines.get(i + 1))
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
}
