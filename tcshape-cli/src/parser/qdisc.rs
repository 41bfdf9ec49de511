//! `tc qdisc show` parsing.
//!
//! ```text
//! qdisc htb 1a1a: root refcnt 2 r2q 10 default 0x1 direct_packets_stat 0
//! qdisc netem 1a9a: parent 1a1a:2 limit 1000 delay 100ms  10ms loss 0.1% rate 100Kbit
//! qdisc tbf 20: parent 1a9a:1 rate 100Kbit burst 1600b lat 50ms
//! ```

use tcshape_shared::units::{parse_fraction, parse_rate_bps, parse_time_ms};
use tcshape_shared::{DelayDistribution, Handle, ShapingParams};
use tracing::debug;

use super::tokens::Tokens;
use super::{QdiscRecord, RawRecord};

/// Parse a qdisc listing into typed records.
pub fn parse_qdisc_records(text: &str) -> Vec<QdiscRecord> {
    text.lines().filter_map(parse_qdisc_line).collect()
}

/// Parse a qdisc listing into raw records.
pub fn parse_qdiscs(text: &str) -> Vec<RawRecord> {
    parse_qdisc_records(text)
        .into_iter()
        .map(RawRecord::Qdisc)
        .collect()
}

fn parse_qdisc_line(line: &str) -> Option<QdiscRecord> {
    let tokens = Tokens::new(line);
    if tokens.nth(0) != Some("qdisc") {
        return None;
    }
    let kind = tokens.nth(1)?.to_string();
    let handle = match tokens.nth(2).map(str::parse::<Handle>) {
        Some(Ok(handle)) => handle,
        _ => {
            debug!("Skipping qdisc line without a handle: {}", line.trim());
            return None;
        }
    };

    let is_root = tokens.contains("root");
    let parent = tokens.value_after("parent").and_then(|p| p.parse().ok());

    let params = match kind.as_str() {
        "netem" => parse_netem_options(&tokens),
        "tbf" => parse_rate_option(&tokens),
        _ => ShapingParams::default(),
    };

    let default_class = if kind == "htb" {
        tokens
            .value_after("default")
            .and_then(|v| u16::from_str_radix(v.trim_start_matches("0x"), 16).ok())
    } else {
        None
    };

    Some(QdiscRecord {
        kind,
        handle,
        parent,
        is_root,
        params,
        default_class,
    })
}

/// Read `rate <r>` (tbf qdiscs and htb classes).
pub(crate) fn parse_rate_option(tokens: &Tokens<'_>) -> ShapingParams {
    ShapingParams {
        rate_bps: tokens.value_after("rate").and_then(|v| ok_or_log("rate", v, parse_rate_bps(v))),
        ..Default::default()
    }
}

/// Read netem sub-options. Correlation values, `gap` and `seed` are ignored.
pub(crate) fn parse_netem_options(tokens: &Tokens<'_>) -> ShapingParams {
    let mut params = ShapingParams {
        limit: tokens.value_after("limit").and_then(|v| v.parse().ok()),
        rate_bps: tokens
            .value_after("rate")
            .and_then(|v| ok_or_log("rate", v, parse_rate_bps(v))),
        delay_distribution: tokens
            .value_after("distribution")
            .and_then(|v| v.parse::<DelayDistribution>().ok()),
        ..Default::default()
    };

    let delay = tokens.values_after("delay", 2);
    if let Some(value) = delay.first() {
        params.delay_ms = ok_or_log("delay", value, parse_time_ms(value));
        // The jitter is only present when the next token is itself a time.
        params.delay_jitter_ms = delay.get(1).and_then(|v| parse_time_ms(v).ok());
    }

    params.loss = percentage_after(tokens, "loss");
    params.duplicate = percentage_after(tokens, "duplicate");
    params.corrupt = percentage_after(tokens, "corrupt");
    params.reorder = percentage_after(tokens, "reorder");
    params
}

fn percentage_after(tokens: &Tokens<'_>, keyword: &str) -> Option<f64> {
    let mut cursor = tokens.clone();
    if !cursor.rewind_to(keyword) {
        return None;
    }
    if cursor.peek() == Some("random") {
        cursor.next();
    }
    let value = cursor.next()?;
    ok_or_log(keyword, value, parse_fraction(value))
}

fn ok_or_log<T, E: std::fmt::Display>(field: &str, raw: &str, result: Result<T, E>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            debug!("Ignoring unparsable {} value '{}': {}", field, raw, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "\
qdisc htb 1a1a: root refcnt 2 r2q 10 default 0x1 direct_packets_stat 0 direct_qlen 1000
qdisc netem 1a9a: parent 1a1a:2 limit 1000 delay 100ms  10ms loss 0.1% duplicate 1% reorder 25% 50% corrupt 0.5% rate 100Kbit seed 2812137485683463271 gap 1
qdisc tbf 20: parent 1a9a:1 rate 250Kbit burst 1600b lat 50ms
qdisc ingress ffff: parent ffff:fff1 ----------------
qdisc fq_codel 0: parent :1 limit 10240p flows 1024 quantum 1514 target 5ms interval 100ms memory_limit 32Mb ecn drop_batch 64
";

    #[test]
    fn test_parse_htb_root() {
        let records = parse_qdisc_records(LISTING);
        assert_eq!(records.len(), 5);

        let root = &records[0];
        assert_eq!(root.kind, "htb");
        assert_eq!(root.handle, Handle::new(0x1a1a, 0));
        assert!(root.is_root);
        assert_eq!(root.parent, None);
        assert_eq!(root.default_class, Some(1));
        assert!(root.params.is_empty());
    }

    #[test]
    fn test_parse_netem_options() {
        let records = parse_qdisc_records(LISTING);
        let netem = &records[1];
        assert_eq!(netem.kind, "netem");
        assert_eq!(netem.parent, Some(Handle::new(0x1a1a, 2)));
        assert!(!netem.is_root);
        assert_eq!(netem.params.limit, Some(1000));
        assert_eq!(netem.params.delay_ms, Some(100.0));
        assert_eq!(netem.params.delay_jitter_ms, Some(10.0));
        assert_eq!(netem.params.loss, Some(0.001));
        assert_eq!(netem.params.duplicate, Some(0.01));
        assert_eq!(netem.params.reorder, Some(0.25));
        assert_eq!(netem.params.corrupt, Some(0.005));
        assert_eq!(netem.params.rate_bps, Some(100_000));
    }

    #[test]
    fn test_parse_tbf_rate_and_plain_qdiscs() {
        let records = parse_qdisc_records(LISTING);
        assert_eq!(records[2].params.rate_bps, Some(250_000));
        assert_eq!(records[2].parent, Some(Handle::new(0x1a9a, 1)));

        // No shaping parameters, not an error.
        assert!(records[3].params.is_empty());
        assert!(records[4].params.is_empty());
        assert_eq!(records[4].parent, Some(Handle::new(0, 1)));
    }

    #[test]
    fn test_netem_delay_in_seconds_without_jitter() {
        let records = parse_qdisc_records("qdisc netem 10: root refcnt 2 limit 1000 delay 2.95s loss random 5%");
        assert_eq!(records[0].params.delay_ms, Some(2950.0));
        assert_eq!(records[0].params.delay_jitter_ms, None);
        assert_eq!(records[0].params.loss, Some(0.05));
    }

    #[test]
    fn test_garbage_lines_are_skipped() {
        assert!(parse_qdisc_records("").is_empty());
        assert!(parse_qdisc_records("Cannot find device \"bogus0\"\nqdisc netem").is_empty());
        let records = parse_qdisc_records("qdisc netem 10: root delay fast loss 1%");
        assert_eq!(records[0].params.delay_ms, None);
        assert_eq!(records[0].params.loss, Some(0.01));
    }
}
