use anyhow::Result;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::OnceLock;
use tracing::{debug, warn};
use url::Url;

use super::{DocumentKind, FetchedDocument};
use crate::error::CollectorError;
use crate::plan::{ExtractMode, ExtractionRules, FieldRule, Pagination, Record, Transform};

fn tag_regex() -> &'static Regex {
    static TAG: OnceLock<Regex> = OnceLock::new();
    TAG.get_or_init(|| Regex::new(r"<[^>]*>").unwrap())
}

/// Remove markup tags, leaving text content
pub fn strip_tags(text: &str) -> std::borrow::Cow<'_, str> {
    tag_regex().replace_all(text, "")
}

/// Extract records from a document according to the plan's rules
///
/// Items missing a required field are dropped. Missing optional fields take
/// their default, or `null`.
pub fn extract_records(document: &FetchedDocument, rules: &ExtractionRules) -> Result<Vec<Record>> {
    let records = match document.kind {
        DocumentKind::Json => extract_json(document, rules)?,
        DocumentKind::Html | DocumentKind::Text => extract_html(document, rules)?,
    };

    debug!("Extracted {} records from {}", records.len(), document.final_url);
    Ok(records)
}

/// Links to follow for pagination, resolved against the page URL
pub fn find_next_links(document: &FetchedDocument, pagination: &Pagination) -> Result<Vec<Url>> {
    let raw_links: Vec<String> = match document.kind {
        DocumentKind::Json => {
            let root: Value = serde_json::from_str(&document.body)
                .map_err(|e| CollectorError::extraction(format!("Invalid JSON: {}", e)))?;
            resolve_pointer(&root, &pagination.next_selector)
                .and_then(|v| v.as_str().map(str::to_string))
                .into_iter()
                .collect()
        }
        DocumentKind::Html | DocumentKind::Text => {
            let selector = parse_selector(&pagination.next_selector)?;
            let html = Html::parse_document(&document.body);
            let hrefs: Vec<String> = html
                .select(&selector)
                .filter_map(|el| el.value().attr("href").map(str::to_string))
                .collect();
            hrefs
        }
    };

    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for raw in raw_links {
        let raw = raw.trim();
        if raw.is_empty() || raw.starts_with('#') || raw.starts_with("javascript:") {
            continue;
        }
        match document.final_url.join(raw) {
            Ok(mut link) => {
                link.set_fragment(None);
                if link.scheme() == document.final_url.scheme() && seen.insert(link.to_string()) {
                    links.push(link);
                }
            }
            Err(e) => warn!("Ignoring pagination link '{}': {}", raw, e),
        }
    }

    Ok(links)
}

fn parse_selector(selector: &str) -> Result<Selector> {
    Selector::parse(selector).map_err(|e| {
        CollectorError::InvalidSelector {
            selector: selector.to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}

fn extract_html(document: &FetchedDocument, rules: &ExtractionRules) -> Result<Vec<Record>> {
    let html = Html::parse_document(&document.body);

    let field_selectors = rules
        .fields
        .iter()
        .map(|field| parse_selector(&field.selector).map(|s| (field, s)))
        .collect::<Result<Vec<_>>>()?;

    let items: Vec<ElementRef<'_>> = match &rules.item_selector {
        Some(item_selector) => {
            let selector = parse_selector(item_selector)?;
            let matched: Vec<ElementRef<'_>> = html.select(&selector).collect();
            matched
        }
        None => vec![html.root_element()],
    };

    let mut records = Vec::new();
    'items: for item in items {
        let mut record = Record::new();

        for (field, selector) in &field_selectors {
            let raw = item
                .select(selector)
                .next()
                .and_then(|el| extract_element_value(&el, &field.extract, &document.final_url));

            match finish_value(raw, field)? {
                Some(value) => {
                    record.insert(field.name.clone(), value);
                }
                None => {
                    debug!("Required field '{}' missing, skipping item", field.name);
                    continue 'items;
                }
            }
        }

        records.push(record);
    }

    Ok(records)
}

fn extract_json(document: &FetchedDocument, rules: &ExtractionRules) -> Result<Vec<Record>> {
    let root: Value = serde_json::from_str(&document.body)
        .map_err(|e| CollectorError::extraction(format!("Invalid JSON from {}: {}", document.final_url, e)))?;

    let items: Vec<&Value> = match &rules.item_selector {
        Some(pointer) => match resolve_pointer(&root, pointer) {
            Some(Value::Array(values)) => values.iter().collect(),
            Some(value) => vec![value],
            None => Vec::new(),
        },
        None => vec![&root],
    };

    let mut records = Vec::new();
    'items: for item in items {
        let mut record = Record::new();

        for field in &rules.fields {
            let raw = resolve_pointer(item, &field.selector).and_then(|value| json_value_for(value, &field.extract, &document.final_url));

            match finish_value(raw, field)? {
                Some(value) => {
                    record.insert(field.name.clone(), value);
                }
                None => continue 'items,
            }
        }

        records.push(record);
    }

    Ok(records)
}

/// Apply transforms, or fall back to the default; `None` means the item is dropped
fn finish_value(raw: Option<Value>, field: &FieldRule) -> Result<Option<Value>> {
    let value = match raw {
        Some(value) => apply_transforms(value, &field.transforms)?,
        None => Value::Null,
    };

    let is_empty = match &value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    };

    if is_empty {
        if let Some(default) = &field.default {
            return Ok(Some(default.clone()));
        }
        if field.required {
            return Ok(None);
        }
    }

    Ok(Some(value))
}

fn extract_element_value(element: &ElementRef<'_>, mode: &ExtractMode, base: &Url) -> Option<Value> {
    let value = match mode {
        ExtractMode::Text => {
            let text = element.text().collect::<Vec<_>>().join(" ");
            text.split_whitespace().collect::<Vec<_>>().join(" ")
        }
        ExtractMode::Html => element.inner_html(),
        ExtractMode::Attr(name) => element.value().attr(name)?.to_string(),
        ExtractMode::Href => absolutize(element.value().attr("href")?, base),
        ExtractMode::Src => absolutize(element.value().attr("src")?, base),
    };

    Some(Value::String(value))
}

fn json_value_for(value: &Value, mode: &ExtractMode, base: &Url) -> Option<Value> {
    match (mode, value) {
        (ExtractMode::Href | ExtractMode::Src, Value::String(s)) => Some(Value::String(absolutize(s, base))),
        (_, Value::Null) => None,
        (_, other) => Some(other.clone()),
    }
}

fn absolutize(link: &str, base: &Url) -> String {
    base.join(link.trim())
        .map(|u| u.to_string())
        .unwrap_or_else(|_| link.to_string())
}

/// JSON pointer lookup; `a.b.0` is accepted as shorthand for `/a/b/0`
fn resolve_pointer<'a>(value: &'a Value, selector: &str) -> Option<&'a Value> {
    let selector = selector.trim();
    if selector.is_empty() || selector == "/" {
        return Some(value);
    }
    if selector.starts_with('/') {
        value.pointer(selector)
    } else {
        value.pointer(&format!("/{}", selector.replace('.', "/")))
    }
}

pub fn apply_transforms(mut value: Value, transforms: &[Transform]) -> Result<Value> {
    for transform in transforms {
        value = apply_transform(value, transform)?;
    }
    Ok(value)
}

fn apply_transform(value: Value, transform: &Transform) -> Result<Value> {
    let text = match value {
        Value::String(text) => text,
        other => return Ok(other),
    };

    let transformed = match transform {
        Transform::Trim => text.trim().to_string(),
        Transform::Lowercase => text.to_lowercase(),
        Transform::Uppercase => text.to_uppercase(),
        Transform::CollapseWhitespace => text.split_whitespace().collect::<Vec<_>>().join(" "),
        Transform::StripHtml => {
            let stripped = strip_tags(&text);
            html_escape::decode_html_entities(&stripped).trim().to_string()
        }
        Transform::ParseNumber => {
            return Ok(parse_number(&text).unwrap_or(Value::String(text)));
        }
        Transform::Regex { pattern, replacement } => {
            let regex = Regex::new(pattern)
                .map_err(|e| CollectorError::extraction(format!("Invalid regex '{}': {}", pattern, e)))?;
            regex.replace_all(&text, replacement.as_str()).to_string()
        }
        Transform::ExtractDomain => match Url::parse(text.trim()) {
            Ok(url) => url.host_str().map(str::to_string).unwrap_or(text),
            Err(_) => text,
        },
    };

    Ok(Value::String(transformed))
}

/// Parse a number out of text such as `$1,299.00` or `-3`
pub fn parse_number(text: &str) -> Option<Value> {
    let cleaned: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    if cleaned.is_empty() || !cleaned.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }

    if let Ok(int) = cleaned.parse::<i64>() {
        return Some(Value::from(int));
    }
    cleaned
        .parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::FieldRule;
    use serde_json::json;
    use std::time::Duration;

    fn doc(body: &str, kind: DocumentKind) -> FetchedDocument {
        let url = Url::parse("https://shop.example.com/list/page1").unwrap();
        FetchedDocument {
            url: url.clone(),
            final_url: url,
            status: 200,
            content_type: None,
            body: body.to_string(),
            elapsed: Duration::ZERO,
            bytes: body.len(),
            kind,
            engine: "test".to_string(),
        }
    }

    fn field(name: &str, selector: &str, extract: ExtractMode, required: bool) -> FieldRule {
        FieldRule {
            name: name.to_string(),
            selector: selector.to_string(),
            extract,
            required,
            transforms: vec![],
            default: None,
        }
    }

    const HTML: &str = r#"
        <html><body>
          <div class="product">
            <h2>  Blue   <b>Widget</b> </h2>
            <span class="price">$1,299.50</span>
            <a href="/items/1">more</a>
            <img src="img/1.png">
          </div>
          <div class="product">
            <h2>Red Widget</h2>
            <a href="https://other.example.com/items/2">more</a>
          </div>
          <div class="product">
            <span class="price">$5</span>
          </div>
          <a class="next" href="?page=2">next</a>
          <a class="next" href="?page=2#top">again</a>
        </body></html>
    "#;

    #[test]
    fn test_extract_html_items() {
        let mut price = field("price", ".price", ExtractMode::Text, false);
        price.transforms = vec![Transform::ParseNumber];
        let rules = ExtractionRules {
            item_selector: Some("div.product".to_string()),
            fields: vec![
                field("title", "h2", ExtractMode::Text, true),
                price,
                field("link", "a", ExtractMode::Href, false),
                field("image", "img", ExtractMode::Src, false),
            ],
        };

        let records = extract_records(&doc(HTML, DocumentKind::Html), &rules).unwrap();
        assert_eq!(records.len(), 2);

        assert_eq!(records[0]["title"], json!("Blue Widget"));
        assert_eq!(records[0]["price"], json!(1299.5));
        assert_eq!(records[0]["link"], json!("https://shop.example.com/items/1"));
        assert_eq!(records[0]["image"], json!("https://shop.example.com/list/img/1.png"));

        assert_eq!(records[1]["price"], Value::Null);
        assert_eq!(records[1]["link"], json!("https://other.example.com/items/2"));
    }

    #[test]
    fn test_defaults_fill_missing_fields() {
        let mut title = field("title", "h2", ExtractMode::Text, true);
        title.default = Some(json!("untitled"));
        let rules = ExtractionRules {
            item_selector: Some("div.product".to_string()),
            fields: vec![title],
        };

        let records = extract_records(&doc(HTML, DocumentKind::Html), &rules).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2]["title"], json!("untitled"));
    }

    #[test]
    fn test_invalid_selector_is_reported() {
        let rules = ExtractionRules {
            item_selector: Some("div[".to_string()),
            fields: vec![field("title", "h2", ExtractMode::Text, true)],
        };
        let err = extract_records(&doc(HTML, DocumentKind::Html), &rules).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CollectorError>(),
            Some(CollectorError::InvalidSelector { .. })
        ));
    }

    #[test]
    fn test_extract_json_items() {
        let body = r#"{"data": {"items": [
            {"name": "a", "meta": {"price": "10"}, "url": "/a"},
            {"name": null, "meta": {"price": "20"}},
            {"name": "c", "meta": {"price": 30}}
        ]}, "next": "/api?page=2"}"#;
        let mut price = field("price", "/meta/price", ExtractMode::Text, false);
        price.transforms = vec![Transform::ParseNumber];
        let rules = ExtractionRules {
            item_selector: Some("/data/items".to_string()),
            fields: vec![
                field("name", "name", ExtractMode::Text, true),
                price,
                field("url", "url", ExtractMode::Href, false),
            ],
        };

        let document = doc(body, DocumentKind::Json);
        let records = extract_records(&document, &rules).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["price"], json!(10));
        assert_eq!(records[0]["url"], json!("https://shop.example.com/a"));
        assert_eq!(records[1]["price"], json!(30));

        let pagination = Pagination { next_selector: "/next".to_string(), max_pages: None };
        let links = find_next_links(&document, &pagination).unwrap();
        assert_eq!(links[0].as_str(), "https://shop.example.com/api?page=2");
    }

    #[test]
    fn test_next_links_are_resolved_and_deduplicated() {
        let pagination = Pagination { next_selector: "a.next".to_string(), max_pages: None };
        let links = find_next_links(&doc(HTML, DocumentKind::Html), &pagination).unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].as_str(), "https://shop.example.com/list/page1?page=2");
    }

    #[test]
    fn test_transforms() {
        let value = apply_transforms(
            json!("  <p>Fish &amp;   Chips</p> "),
            &[Transform::StripHtml, Transform::CollapseWhitespace, Transform::Uppercase],
        )
        .unwrap();
        assert_eq!(value, json!("FISH & CHIPS"));

        let value = apply_transforms(
            json!("SKU-0042"),
            &[Transform::Regex { pattern: r"\D".to_string(), replacement: String::new() }, Transform::ParseNumber],
        )
        .unwrap();
        assert_eq!(value, json!(42));

        let value = apply_transforms(json!("https://www.example.org/x"), &[Transform::ExtractDomain]).unwrap();
        assert_eq!(value, json!("www.example.org"));

        let value = apply_transforms(json!("n/a"), &[Transform::ParseNumber]).unwrap();
        assert_eq!(value, json!("n/a"));

        let value = apply_transforms(json!(12), &[Transform::Lowercase]).unwrap();
        assert_eq!(value, json!(12));
    }
}
