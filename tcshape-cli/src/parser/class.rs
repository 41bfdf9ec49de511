//! `tc class show` parsing.
//!
//! ```text
//! class htb 1a1a:2 root leaf 1a9a: prio 0 rate 100Kbit ceil 100Kbit burst 1600b cburst 1600b
//! class prio 1a1a:2 parent 1a1a: leaf 1a9a:
//! ```

use tcshape_shared::{Handle, ShapingParams};
use tracing::debug;

use super::qdisc::parse_rate_option;
use super::tokens::Tokens;
use super::{ClassRecord, RawRecord};

pub fn parse_class_records(text: &str) -> Vec<ClassRecord> {
    text.lines().filter_map(parse_class_line).collect()
}

pub fn parse_classes(text: &str) -> Vec<RawRecord> {
    parse_class_records(text)
        .into_iter()
        .map(RawRecord::Class)
        .collect()
}

fn parse_class_line(line: &str) -> Option<ClassRecord> {
    let tokens = Tokens::new(line);
    if tokens.nth(0) != Some("class") {
        return None;
    }
    let kind = tokens.nth(1)?.to_string();
    let handle = match tokens.nth(2).map(str::parse::<Handle>) {
        Some(Ok(handle)) => handle,
        _ => {
            debug!("Skipping class line without a handle: {}", line.trim());
            return None;
        }
    };

    // A class attached directly to the root qdisc reports "root" instead of
    // its parent handle.
    let parent = match tokens.value_after("parent").map(str::parse::<Handle>) {
        Some(Ok(parent)) => parent,
        Some(Err(_)) => return None,
        None if tokens.contains("root") => handle.qdisc(),
        None => return None,
    };

    let leaf = tokens.value_after("leaf").and_then(|l| l.parse().ok());

    let params = match kind.as_str() {
        "htb" => parse_rate_option(&tokens),
        _ => ShapingParams::default(),
    };

    Some(ClassRecord {
        kind,
        handle,
        parent,
        leaf,
        params,
    })
}
