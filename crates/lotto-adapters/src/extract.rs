//! Versioned extraction profiles: how a response body maps onto a draw row.

use lotto_core::{parse_draw_date, RawDrawRow};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Immutable, versioned extraction rules injected into a provider at
/// construction. Changing rules means building a new provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionProfile {
    pub version: String,
    #[serde(flatten)]
    pub selectors: Selectors,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum Selectors {
    Json(JsonSelectors),
    Html(HtmlSelectors),
}

/// JSON pointers (RFC 6901) into the response document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonSelectors {
    pub draw_id: String,
    pub date: String,
    pub numbers: String,
    pub specials: String,
}

/// CSS selectors; every field selector is evaluated inside `container`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtmlSelectors {
    pub container: String,
    pub draw_id: String,
    pub date: String,
    pub numbers: String,
    pub specials: String,
}

#[derive(Debug, Error)]
pub enum ExtractError {
    /// The result block is absent, usually because the page has not rendered yet.
    #[error("result container {selector:?} not found")]
    NotRendered { selector: String },
    #[error("field {field} not present in response")]
    Missing { field: &'static str },
    #[error("field {field} has unexpected value {value:?}")]
    Malformed { field: &'static str, value: String },
    #[error("invalid selector {selector:?}: {message}")]
    InvalidSelector { selector: String, message: String },
    #[error("response is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl ExtractError {
    /// Whether a later attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NotRendered { .. })
    }
}

impl ExtractionProfile {
    /// Check that every selector in the profile is usable.
    pub fn check(&self) -> Result<(), ExtractError> {
        match &self.selectors {
            Selectors::Json(sel) => {
                for pointer in [&sel.draw_id, &sel.date, &sel.numbers, &sel.specials] {
                    if !pointer.is_empty() && !pointer.starts_with('/') {
                        return Err(ExtractError::InvalidSelector {
                            selector: pointer.clone(),
                            message: "JSON pointer must start with '/'".to_string(),
                        });
                    }
                }
                Ok(())
            }
            Selectors::Html(sel) => {
                for css in [&sel.container, &sel.draw_id, &sel.date, &sel.numbers, &sel.specials] {
                    parse_selector(css)?;
                }
                Ok(())
            }
        }
    }

    pub fn extract(&self, body: &[u8]) -> Result<RawDrawRow, ExtractError> {
        match &self.selectors {
            Selectors::Json(sel) => extract_json(sel, body),
            Selectors::Html(sel) => extract_html(sel, body),
        }
    }
}

fn extract_json(sel: &JsonSelectors, body: &[u8]) -> Result<RawDrawRow, ExtractError> {
    let doc: JsonValue = serde_json::from_slice(body)?;

    let draw_id_value = doc
        .pointer(&sel.draw_id)
        .filter(|v| !v.is_null())
        .ok_or(ExtractError::Missing { field: "draw_id" })?;
    let draw_id = json_integer(draw_id_value).ok_or_else(|| ExtractError::Malformed {
        field: "draw_id",
        value: draw_id_value.to_string(),
    })?;

    let date = match doc.pointer(&sel.date) {
        None => return Err(ExtractError::Missing { field: "date" }),
        Some(JsonValue::Null) => None,
        Some(JsonValue::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    };

    Ok(RawDrawRow {
        draw_id,
        date,
        numbers: json_integer_list(&doc, &sel.numbers, "numbers")?,
        specials: json_integer_list(&doc, &sel.specials, "specials")?,
    })
}

fn json_integer(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn json_integer_list(
    doc: &JsonValue,
    pointer: &str,
    field: &'static str,
) -> Result<Vec<i64>, ExtractError> {
    let items = doc
        .pointer(pointer)
        .and_then(JsonValue::as_array)
        .ok_or(ExtractError::Missing { field })?;
    items
        .iter()
        .map(|item| {
            json_integer(item).ok_or_else(|| ExtractError::Malformed {
                field,
                value: item.to_string(),
            })
        })
        .collect()
}

fn parse_selector(css: &str) -> Result<Selector, ExtractError> {
    Selector::parse(css).map_err(|e| ExtractError::InvalidSelector {
        selector: css.to_string(),
        message: e.to_string(),
    })
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn select_first_text(scope: ElementRef<'_>, css: &str) -> Result<Option<String>, ExtractError> {
    let sel = parse_selector(css)?;
    Ok(scope
        .select(&sel)
        .next()
        .map(|n| text_or_none(n.text().collect::<String>()).unwrap_or_default()))
}

fn select_all_texts(scope: ElementRef<'_>, css: &str) -> Result<Vec<String>, ExtractError> {
    let sel = parse_selector(css)?;
    Ok(scope
        .select(&sel)
        .filter_map(|n| text_or_none(n.text().collect::<String>()))
        .collect())
}

fn first_integer(text: &str) -> Option<i64> {
    let digits: String = text
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

fn find_date_token(text: &str) -> Option<String> {
    text.split(|c: char| c.is_whitespace() || matches!(c, '(' | ')' | ',' | ';'))
        .find(|token| parse_draw_date(token).is_some())
        .map(str::to_string)
}

fn extract_html(sel: &HtmlSelectors, body: &[u8]) -> Result<RawDrawRow, ExtractError> {
    let text = String::from_utf8_lossy(body);
    let document = Html::parse_document(&text);
    let container_sel = parse_selector(&sel.container)?;
    let container = document
        .select(&container_sel)
        .next()
        .ok_or_else(|| ExtractError::NotRendered {
            selector: sel.container.clone(),
        })?;

    let draw_text =
        select_first_text(container, &sel.draw_id)?.ok_or(ExtractError::Missing { field: "draw_id" })?;
    let draw_id = first_integer(&draw_text).ok_or(ExtractError::Malformed {
        field: "draw_id",
        value: draw_text.clone(),
    })?;

    // A present-but-garbled date is passed through so validation can name it.
    let date_text =
        select_first_text(container, &sel.date)?.ok_or(ExtractError::Missing { field: "date" })?;
    let date = if date_text.is_empty() {
        None
    } else {
        Some(find_date_token(&date_text).unwrap_or(date_text))
    };

    let numbers = html_integer_list(container, &sel.numbers, "numbers")?;
    let specials = html_integer_list(container, &sel.specials, "specials")?;

    Ok(RawDrawRow {
        draw_id,
        date,
        numbers,
        specials,
    })
}

fn html_integer_list(
    scope: ElementRef<'_>,
    css: &str,
    field: &'static str,
) -> Result<Vec<i64>, ExtractError> {
    let texts = select_all_texts(scope, css)?;
    if texts.is_empty() {
        return Err(ExtractError::Missing { field });
    }
    texts
        .into_iter()
        .map(|t| {
            t.parse::<i64>()
                .map_err(|_| ExtractError::Malformed { field, value: t.clone() })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn json_profile() -> ExtractionProfile {
        ExtractionProfile {
            version: "api-v1".into(),
            selectors: Selectors::Json(JsonSelectors {
                draw_id: "/numero".into(),
                date: "/dataApuracao".into(),
                numbers: "/listaDezenas".into(),
                specials: "/trevosSorteados".into(),
            }),
        }
    }

    fn html_profile() -> ExtractionProfile {
        ExtractionProfile {
            version: "page-2024".into(),
            selectors: Selectors::Html(HtmlSelectors {
                container: "div.resultado-loteria".into(),
                draw_id: "span.ng-binding".into(),
                date: "span.data".into(),
                numbers: "ul.dezenas li".into(),
                specials: "ul.trevos li".into(),
            }),
        }
    }

    #[test]
    fn json_profile_reads_string_and_numeric_values() {
        let body = br#"{
            "numero": 276,
            "dataApuracao": "15/01/2025",
            "listaDezenas": ["03", "07", "12", "19", "33", "50"],
            "trevosSorteados": [1, 4]
        }"#;
        let row = json_profile().extract(body).unwrap();
        assert_eq!(row.draw_id, 276);
        assert_eq!(row.date.as_deref(), Some("15/01/2025"));
        assert_eq!(row.numbers, vec![3, 7, 12, 19, 33, 50]);
        assert_eq!(row.specials, vec![1, 4]);
    }

    #[test]
    fn json_profile_missing_field_is_structural() {
        let body = br#"{"numero": 276, "dataApuracao": "15/01/2025", "listaDezenas": []}"#;
        let err = json_profile().extract(body).unwrap_err();
        assert!(matches!(err, ExtractError::Missing { field: "specials" }));
        assert!(!err.is_transient());
    }

    #[test]
    fn json_profile_null_date_passes_through_as_none() {
        let body = br#"{"numero": 2, "dataApuracao": null, "listaDezenas": [1,2,3,4,5,6], "trevosSorteados": [1,2]}"#;
        let row = json_profile().extract(body).unwrap();
        assert_eq!(row.date, None);
    }

    #[test]
    fn html_profile_extracts_from_container() {
        let body = br#"<html><body>
            <div class="resultado-loteria">
              <span class="ng-binding">Concurso 276 (15/01/2025)</span>
              <span class="data">Sorteio realizado em 15/01/2025</span>
              <ul class="dezenas"><li>03</li><li>07</li><li>12</li><li>19</li><li>33</li><li>50</li></ul>
              <ul class="trevos"><li>1</li><li>4</li></ul>
            </div></body></html>"#;
        let row = html_profile().extract(body).unwrap();
        assert_eq!(row.draw_id, 276);
        assert_eq!(row.date.as_deref(), Some("15/01/2025"));
        assert_eq!(row.numbers, vec![3, 7, 12, 19, 33, 50]);
        assert_eq!(row.specials, vec![1, 4]);
    }

    #[test]
    fn html_without_container_is_transient() {
        let err = html_profile()
            .extract(b"<html><body><div class=\"loading\"></div></body></html>")
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn html_layout_change_is_structural() {
        let body = br#"<div class="resultado-loteria"><span class="ng-binding">Concurso 276</span>
            <span class="data">15/01/2025</span><ul class="bolas"><li>3</li></ul></div>"#;
        let err = html_profile().extract(body).unwrap_err();
        assert!(matches!(err, ExtractError::Missing { field: "numbers" }));
        assert!(!err.is_transient());
    }

    #[test]
    fn profile_check_rejects_bad_selectors() {
        let mut profile = html_profile();
        if let Selectors::Html(sel) = &mut profile.selectors {
            sel.numbers = "ul..dezenas".into();
        }
        assert!(profile.check().is_err());
        assert!(json_profile().check().is_ok());
    }

    #[test]
    fn profile_deserializes_from_yaml_style_json() {
        let profile: ExtractionProfile = serde_json::from_value(serde_json::json!({
            "version": "api-v1",
            "format": "json",
            "draw_id": "/numero",
            "date": "/dataApuracao",
            "numbers": "/listaDezenas",
            "specials": "/trevosSorteados"
        }))
        .unwrap();
        assert_eq!(profile, json_profile());
    }
}
