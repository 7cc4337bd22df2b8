//! Plain-text exports.

use crate::cart::CartLine;

const SEPARATOR: char = ';';

/// Render cart lines as semicolon-separated CSV with a `Qty;Name;Note` header.
pub fn cart_csv(lines: &[CartLine]) -> String {
    let mut out = String::from("Qty;Name;Note");
    for line in lines {
        out.push('\n');
        out.push_str(&line.qty.to_string());
        out.push(SEPARATOR);
        out.push_str(&field(&line.name));
        out.push(SEPARATOR);
        out.push_str(&field(&line.note));
    }
    out.push('\n');
    out
}

fn field(value: &str) -> String {
    if value.contains([SEPARATOR, ',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
