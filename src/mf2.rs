//! A small microformats2 HTML parser.
//!
//! This covers the subset of <http://microformats.org/wiki/microformats2>
//! the federation core needs: finding `h-*` items in remote pages, reading
//! their `p-`/`u-`/`dt-`/`e-` properties, and nesting embedded items. It is
//! not a general-purpose mf2 implementation.

use scraper::ElementRef;
use scraper::Html;
use serde_json::Map;
use serde_json::Value;

use crate::domain::Microformats2;
use crate::urls::urljoin;

/// Parse all microformats items in an HTML document, flattened: nested items
/// appear both inside their parent and in the returned list.
pub fn parse_items(html: &str, base_url: &str) -> Vec<Microformats2> {
    let document = Html::parse_document(html);
    let mut items = Vec::new();
    collect_roots(document.root_element(), base_url, &mut items);
    items
}

/// All items of the given type (`h-entry`, `h-card`, ...).
pub fn filter_by_type(items: &[Microformats2], type_: &str) -> Vec<Microformats2> {
    items.iter().filter(|item| item.is_type(type_)).cloned().collect()
}

fn collect_roots(el: ElementRef, base_url: &str, items: &mut Vec<Microformats2>) {
    if !root_classes(el).is_empty() {
        items.push(parse_item(el, base_url));
    }
    for child in el.children().filter_map(ElementRef::wrap) {
        collect_roots(child, base_url, items);
    }
}

fn classes(el: ElementRef) -> Vec<String> {
    el.value().classes().map(String::from).collect()
}

fn root_classes(el: ElementRef) -> Vec<String> {
    classes(el)
        .into_iter()
        .filter(|c| c.starts_with("h-"))
        .collect()
}

fn parse_item(el: ElementRef, base_url: &str) -> Microformats2 {
    let mut item = Microformats2 {
        type_: root_classes(el),
        properties: Map::new(),
        children: Vec::new(),
    };

    for child in el.children().filter_map(ElementRef::wrap) {
        collect_properties(child, base_url, &mut item);
    }

    // implied url for bare <a class="h-...">
    if !item.properties.contains_key("url") {
        if let Some(href) = el.value().attr("href") {
            item.set_property("url", Value::String(urljoin(base_url, href)));
        }
    }

    item
}

fn collect_properties(el: ElementRef, base_url: &str, item: &mut Microformats2) {
    let all = classes(el);
    let prop_classes: Vec<&String> = all
        .iter()
        .filter(|c| {
            c.starts_with("p-") || c.starts_with("u-") || c.starts_with("dt-") || c.starts_with("e-")
        })
        .collect();

    if !root_classes(el).is_empty() {
        // an embedded item: a property value when it carries a property
        // class, a child otherwise; either way its insides are its own
        let nested = parse_item(el, base_url);
        if prop_classes.is_empty() {
            item.children.push(nested);
        } else {
            let value = embedded_value(&nested, el);
            for class in prop_classes {
                let name = class.split_once('-').map(|(_, n)| n).unwrap_or(class.as_str());
                push_property(item, name, value.clone());
            }
        }
        return;
    }

    let mut descend = true;
    for class in prop_classes {
        let (prefix, name) = class.split_once('-').unwrap_or(("p", class.as_str()));
        let value = match prefix {
            "u" => Value::String(url_value(el, base_url)),
            "dt" => Value::String(
                el.value()
                    .attr("datetime")
                    .map(String::from)
                    .unwrap_or_else(|| text_of(el)),
            ),
            "e" => {
                descend = false;
                serde_json::json!({
                    "html": el.inner_html().trim(),
                    "value": text_of(el),
                })
            }
            _ => Value::String(text_of(el)),
        };
        push_property(item, name, value);
    }

    if descend {
        for child in el.children().filter_map(ElementRef::wrap) {
            collect_properties(child, base_url, item);
        }
    }
}

fn push_property(item: &mut Microformats2, name: &str, value: Value) {
    item.properties
        .entry(name.to_string())
        .or_insert_with(|| Value::Array(Vec::new()))
        .as_array_mut()
        .expect("properties are always arrays")
        .push(value);
}

fn embedded_value(nested: &Microformats2, el: ElementRef) -> Value {
    let mut value = serde_json::to_value(nested).expect("items are serializable");

    // mf2 JSON carries a scalar `value` alongside embedded items
    let scalar = nested
        .property_str("url")
        .or_else(|| nested.property_str("name"))
        .map(String::from)
        .unwrap_or_else(|| text_of(el));
    if let Some(object) = value.as_object_mut() {
        object.insert("value".to_string(), Value::String(scalar));
    }

    value
}

fn url_value(el: ElementRef, base_url: &str) -> String {
    let attr = match el.value().name() {
        "a" | "area" | "link" => el.value().attr("href"),
        "img" | "audio" | "video" | "source" | "iframe" => el.value().attr("src"),
        _ => None,
    };

    match attr {
        Some(href) => urljoin(base_url, href),
        None => text_of(el),
    }
}

fn text_of(el: ElementRef) -> String {
    let text: Vec<&str> = el.text().collect();
    text.join("").split_whitespace().collect::<Vec<_>>().join(" ")
}
