//! Parsing of `tc ... show` listings into raw records.
//!
//! The tool's output format is not versioned, so the parsers locate fields by
//! keyword and ignore anything they do not recognize. A malformed value drops
//! that one field (logged at debug), never the whole listing.

mod class;
mod filter;
mod qdisc;
mod tokens;

pub use class::{parse_class_records, parse_classes};
pub use filter::{parse_filter_records, parse_filters, parse_redirect_devices};
pub use qdisc::{parse_qdisc_records, parse_qdiscs};
pub use tokens::Tokens;

use tcshape_shared::{Handle, ShapingParams};

use crate::capture::ShowOutput;

/// One queueing discipline line.
#[derive(Debug, Clone, PartialEq)]
pub struct QdiscRecord {
    pub kind: String,
    pub handle: Handle,
    pub parent: Option<Handle>,
    pub is_root: bool,
    pub params: ShapingParams,
    /// Minor of the htb `default` class.
    pub default_class: Option<u16>,
}

/// One class line. `parent` is already resolved (`root` becomes `major:0`).
#[derive(Debug, Clone, PartialEq)]
pub struct ClassRecord {
    pub kind: String,
    pub handle: Handle,
    pub parent: Handle,
    pub leaf: Option<Handle>,
    pub params: ShapingParams,
}

/// One `match <value>/<mask> at <offset>` clause of a u32 filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct U32Match {
    pub value: u32,
    pub mask: u32,
    pub offset: u32,
}

/// One classification filter (header plus its match lines).
#[derive(Debug, Clone, PartialEq)]
pub struct FilterRecord {
    pub protocol: String,
    pub parent: Handle,
    pub pref: u32,
    pub kind: String,
    pub filter_id: Option<String>,
    pub flow_id: Handle,
    pub matches: Vec<U32Match>,
    pub mark: Option<u32>,
}

/// A tokenized kernel object before qdiscs, classes and filters are merged.
#[derive(Debug, Clone, PartialEq)]
pub enum RawRecord {
    Qdisc(QdiscRecord),
    Class(ClassRecord),
    Filter(FilterRecord),
}

/// Records of one device, split by object kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceRecords {
    pub qdiscs: Vec<QdiscRecord>,
    pub classes: Vec<ClassRecord>,
    pub filters: Vec<FilterRecord>,
}

impl FromIterator<RawRecord> for DeviceRecords {
    fn from_iter<I: IntoIterator<Item = RawRecord>>(iter: I) -> Self {
        let mut records = DeviceRecords::default();
        for record in iter {
            match record {
                RawRecord::Qdisc(q) => records.qdiscs.push(q),
                RawRecord::Class(c) => records.classes.push(c),
                RawRecord::Filter(f) => records.filters.push(f),
            }
        }
        records
    }
}

/// Parse the three listings of one device.
pub fn parse_show(show: &ShowOutput) -> Vec<RawRecord> {
    let mut records = parse_qdiscs(&show.qdisc);
    records.extend(parse_classes(&show.class));
    records.extend(parse_filters(&show.filter));
    records
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_show_partitions_by_kind() {
        let show = ShowOutput {
            qdisc: "qdisc htb 1a1a: root refcnt 2 r2q 10 default 0x1 direct_packets_stat 0\n\
                    qdisc netem 1a9a: parent 1a1a:2 limit 1000 delay 10ms\n"
                .to_string(),
            class: "class htb 1a1a:2 root leaf 1a9a: prio 0 rate 1Mbit ceil 1Mbit burst 1600b cburst 1600b\n"
                .to_string(),
            filter: String::new(),
        };
        let records: DeviceRecords = parse_show(&show).into_iter().collect();
        assert_eq!(records.qdiscs.len(), 2);
        assert_eq!(records.classes.len(), 1);
        assert!(records.filters.is_empty());
    }

    #[test]
    fn test_empty_show_yields_no_records() {
        assert!(parse_show(&ShowOutput::default()).is_empty());
    }
}
