//! HTML to text extraction
//!
//! Scripts, styles and comments are dropped; block-level elements become
//! newline separations; whitespace runs collapse to a single space while
//! paragraph newlines survive. With `inline_links` set, anchors render
//! as `text (url)`.

use scraper::{ElementRef, Html, Selector};

const SKIPPED: &[&str] = &["script", "style", "noscript", "template", "head"];
const BLOCK: &[&str] = &[
    "p", "div", "section", "article", "header", "footer", "aside", "h1", "h2", "h3", "h4", "h5", "h6", "li", "tr",
    "blockquote", "pre", "ul", "ol", "table", "figure",
];

/// Convert an HTML document or fragment into readable text
pub fn html_to_text(html: &str, inline_links: bool) -> String {
    let document = Html::parse_document(html);

    let body_selector = Selector::parse("body").expect("static selector");
    let mut raw = String::new();
    if let Some(body) = document.select(&body_selector).next() {
        walk(body, &mut raw, inline_links);
    } else {
        walk(document.root_element(), &mut raw, inline_links);
    }

    clean_text(&raw)
}

fn walk(element: ElementRef<'_>, out: &mut String, inline_links: bool) {
    for child in element.children() {
        if let Some(text) = child.value().as_text() {
            out.push_str(text);
            continue;
        }
        let Some(child_el) = ElementRef::wrap(child) else {
            continue;
        };
        let name = child_el.value().name();

        if SKIPPED.contains(&name) {
            continue;
        }
        if name == "br" {
            out.push('\n');
            continue;
        }

        let block = BLOCK.contains(&name);
        if block {
            out.push('\n');
        }

        if name == "a" && inline_links {
            let mut inner = String::new();
            walk(child_el, &mut inner, inline_links);
            let inner = inner.trim();
            match child_el.value().attr("href") {
                Some(href) if !inner.is_empty() => {
                    out.push_str(&format!("{} ({})", inner, href));
                }
                _ => out.push_str(inner),
            }
        } else {
            walk(child_el, out, inline_links);
        }

        if block {
            out.push('\n');
        }
    }
}

/// Collapse whitespace runs, keeping single newlines between blocks
fn clean_text(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut prev_was_whitespace = false;
    let mut prev_was_newline = false;

    for ch in text.chars() {
        if ch == '\n' {
            if !prev_was_newline && !result.is_empty() {
                result.push('\n');
            }
            prev_was_newline = true;
            prev_was_whitespace = true;
        } else if ch.is_whitespace() {
            if !prev_was_whitespace {
                result.push(' ');
            }
            prev_was_whitespace = true;
        } else {
            // A space queued right after a newline is block padding
            if prev_was_newline && result.ends_with(' ') {
                result.pop();
            }
            result.push(ch);
            prev_was_whitespace = false;
            prev_was_newline = false;
        }
    }

    // Trim trailing space on every line
    result
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}
