//! Plist formatting helpers for logs and tools

use plist::Value;

/// Renders a plist dictionary as indented text
pub fn pretty_print_dictionary(dict: &plist::Dictionary) -> String {
    print_dictionary(dict, 0)
}

/// Renders any plist value as indented text
pub fn pretty_print_plist(p: &Value) -> String {
    print_value(p, 0)
}

fn print_dictionary(dict: &plist::Dictionary, depth: usize) -> String {
    if dict.is_empty() {
        return "{}".to_string();
    }
    let pad = "  ".repeat(depth + 1);
    let items: Vec<String> = dict
        .iter()
        .map(|(k, v)| format!("{pad}{k}: {}", print_value(v, depth + 1)))
        .collect();
    format!("{{\n{}\n{}}}", items.join(",\n"), "  ".repeat(depth))
}

fn print_value(p: &Value, depth: usize) -> String {
    match p {
        Value::Array(a) => {
            if a.is_empty() {
                return "[]".to_string();
            }
            let pad = "  ".repeat(depth + 1);
            let items: Vec<String> = a
                .iter()
                .map(|v| format!("{pad}{}", print_value(v, depth + 1)))
                .collect();
            format!("[\n{}\n{}]", items.join(",\n"), "  ".repeat(depth))
        }
        Value::Dictionary(d) => print_dictionary(d, depth),
        Value::Boolean(b) => b.to_string(),
        Value::Data(d) => format!("<{} bytes>", d.len()),
        Value::Date(d) => d.to_xml_format(),
        Value::Real(r) => r.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::String(s) => format!("\"{s}\""),
        Value::Uid(u) => format!("Uid({})", u.get()),
        _ => "Unknown".to_string(),
    }
}
