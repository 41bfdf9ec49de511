//! Merge of qdisc, class and filter records into shaping rules.
//!
//! Records are related by handle only: a class belongs to the qdisc (or
//! class) named by its parent, a filter to the class named by its flow id,
//! and a shaping qdisc to the class it is attached to. Textual order in the
//! listings is irrelevant.

use std::collections::{BTreeMap, BTreeSet};

use tcshape_shared::errors::TcshapeError;
use tcshape_shared::{DeviceRules, Direction, Handle, IpVersion, ShapingParams, ShapingRule};
use tracing::{debug, warn};

use crate::parser::{ClassRecord, DeviceRecords, FilterRecord, QdiscRecord, RawRecord};
use crate::shaper::{EXCLUSION_PREF_MAX, INGRESS_MAJOR};

/// Result of merging one device's records.
#[derive(Debug, Default)]
pub struct BuildOutcome {
    pub rules: DeviceRules,
    /// One `ParseInconsistency` per dropped orphan record.
    pub diagnostics: Vec<TcshapeError>,
}

/// Builds the rules of one device and direction.
#[derive(Debug, Clone)]
pub struct MappingBuilder<'a> {
    device: &'a str,
    direction: Direction,
    ip_version: IpVersion,
}

impl<'a> MappingBuilder<'a> {
    /// `ip_version` is used for rules that carry no filter.
    pub fn new(device: &'a str, ip_version: IpVersion) -> Self {
        Self {
            device,
            direction: Direction::Outgoing,
            ip_version,
        }
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn build_records(&self, records: Vec<RawRecord>) -> BuildOutcome {
        let records: DeviceRecords = records.into_iter().collect();
        self.build(&records.qdiscs, &records.classes, &records.filters)
    }

    pub fn build(
        &self,
        qdiscs: &[QdiscRecord],
        classes: &[ClassRecord],
        filters: &[FilterRecord],
    ) -> BuildOutcome {
        let mut outcome = BuildOutcome::default();
        let index = RecordIndex::new(qdiscs, classes);

        let mut by_flow: BTreeMap<Handle, Vec<&FilterRecord>> = BTreeMap::new();
        for filter in filters {
            if filter.parent.major == INGRESS_MAJOR {
                continue;
            }
            if index.classes.contains_key(&filter.flow_id) || index.qdiscs.contains_key(&filter.flow_id) {
                by_flow.entry(filter.flow_id).or_default().push(filter);
            } else {
                self.orphan(
                    &mut outcome,
                    format!("filter pref {} ({})", filter.pref, filter.protocol),
                    format!("flow id {}", filter.flow_id),
                );
            }
        }
        for flow in by_flow.values_mut() {
            flow.sort_by_key(|f| f.pref);
        }

        for qdisc in qdiscs {
            if let Some(parent) = qdisc.parent
                && !parent.is_qdisc()
                && !qdisc.params.is_empty()
                && !index.classes.contains_key(&parent)
            {
                self.orphan(
                    &mut outcome,
                    format!("qdisc {} {}", qdisc.kind, qdisc.handle),
                    format!("parent class {}", parent),
                );
            }
        }

        for class in classes {
            let resolved = if class.parent.is_qdisc() {
                index.qdiscs.contains_key(&class.parent)
            } else {
                index.classes.contains_key(&class.parent)
            };
            if !resolved {
                self.orphan(
                    &mut outcome,
                    format!("class {} {}", class.kind, class.handle),
                    format!("parent {}", class.parent),
                );
                continue;
            }

            let flow = by_flow.get(&class.handle);
            let chain = index.attached_params(class.handle);
            let is_internal = index.attached_majors.contains(&class.handle.major);
            let is_default = index
                .qdiscs
                .get(&class.handle.qdisc())
                .and_then(|q| q.default_class)
                == Some(class.handle.minor);

            let shaping = chain.is_some() || (!class.params.is_empty() && !is_default);
            if flow.is_none() && (is_internal || !shaping) {
                debug!("{}: class {} carries no shaping", self.device, class.handle);
                continue;
            }

            let mut params = index
                .qdiscs
                .get(&class.handle.qdisc())
                .map(|q| q.params.clone())
                .unwrap_or_default();
            params.merge(&class.params);
            if let Some(chain) = chain {
                params.merge(&chain);
            }
            let rule = self.rule(class.handle, params, flow.map(Vec::as_slice));
            outcome.rules.insert(rule.handle, rule);
        }

        for qdisc in qdiscs {
            if qdisc.is_root && !qdisc.params.is_empty() && !index.class_majors.contains(&qdisc.handle.major) {
                let flow = by_flow.get(&qdisc.handle);
                let rule = self.rule(qdisc.handle, qdisc.params.clone(), flow.map(Vec::as_slice));
                outcome.rules.insert(rule.handle, rule);
            }
        }

        outcome
    }

    fn rule(&self, handle: Handle, params: ShapingParams, filters: Option<&[&FilterRecord]>) -> ShapingRule {
        let mut rule = ShapingRule::new(self.device, self.ip_version, self.direction, handle);
        rule.params = params;

        let filters = filters.unwrap_or_default();
        let in_band = |f: &&&FilterRecord| (1..=EXCLUSION_PREF_MAX).contains(&f.pref);
        let primary = filters
            .iter()
            .find(|f| !in_band(f))
            .or_else(|| filters.first());
        let exclusion = filters
            .iter()
            .find(|f| in_band(f) && primary.is_some_and(|p| !std::ptr::eq(*p, **f)));

        if let Some(primary) = primary {
            rule.ip_version = primary.ip_version().unwrap_or(self.ip_version);
            rule.filter_id = primary.filter_id.clone();
            rule.filter = primary.network_filter();
        }
        rule.exclusion = exclusion.map(|f| f.network_filter());
        rule
    }

    fn orphan(&self, outcome: &mut BuildOutcome, record: String, reference: String) {
        warn!(
            "{}: dropping {} referencing unknown {}",
            self.device, record, reference
        );
        outcome.diagnostics.push(TcshapeError::ParseInconsistency {
            device: self.device.to_string(),
            record,
            reference,
        });
    }
}

/// Handle lookups shared by the merge passes.
struct RecordIndex<'r> {
    qdiscs: BTreeMap<Handle, &'r QdiscRecord>,
    classes: BTreeMap<Handle, &'r ClassRecord>,
    /// Majors of qdiscs hanging below a class (netem/tbf of a rule).
    attached_majors: BTreeSet<u16>,
    class_majors: BTreeSet<u16>,
    all_qdiscs: &'r [QdiscRecord],
}

impl<'r> RecordIndex<'r> {
    fn new(qdiscs: &'r [QdiscRecord], classes: &'r [ClassRecord]) -> Self {
        Self {
            qdiscs: qdiscs.iter().map(|q| (q.handle, q)).collect(),
            classes: classes.iter().map(|c| (c.handle, c)).collect(),
            attached_majors: qdiscs
                .iter()
                .filter(|q| q.parent.is_some_and(|p| !p.is_qdisc()))
                .map(|q| q.handle.major)
                .collect(),
            class_majors: classes.iter().map(|c| c.handle.major).collect(),
            all_qdiscs: qdiscs,
        }
    }

    /// Params of the qdisc chain attached at `class`, nearest first, so
    /// deeper qdiscs (tbf below netem) override.
    fn attached_params(&self, class: Handle) -> Option<ShapingParams> {
        let mut merged = ShapingParams::default();
        let mut visited = BTreeSet::new();
        let mut frontier: Vec<&QdiscRecord> = self
            .all_qdiscs
            .iter()
            .filter(|q| q.parent == Some(class))
            .collect();

        while !frontier.is_empty() {
            let mut next = Vec::new();
            for qdisc in frontier {
                if !visited.insert(qdisc.handle) {
                    continue;
                }
                merged.merge(&qdisc.params);
                next.extend(self.all_qdiscs.iter().filter(|q| {
                    q.parent
                        .is_some_and(|p| !p.is_qdisc() && p.major == qdisc.handle.major)
                }));
            }
            frontier = next;
        }

        (!merged.is_empty()).then_some(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{parse_class_records, parse_filter_records, parse_qdisc_records};

    fn build(qdisc: &str, class: &str, filter: &str) -> BuildOutcome {
        MappingBuilder::new("eth0", IpVersion::V4).build(
            &parse_qdisc_records(qdisc),
            &parse_class_records(class),
            &parse_filter_records(filter),
        )
    }

    #[test]
    fn test_merge_qdisc_class_and_filter() {
        let outcome = build(
            "qdisc netem 10: root refcnt 2 limit 1000 delay 100ms loss 1%\n",
            "class netem 10:1 parent 10:\n",
            "filter parent 10: protocol ip pref 5 u32 chain 0 fh 800::800 order 2048 key ht 800 bkt 0 flowid 10:1\n  match c0a80000/ffffff00 at 16\n",
        );
        assert!(outcome.diagnostics.is_empty());
        assert_eq!(outcome.rules.len(), 1);

        let rule = &outcome.rules[&Handle::new(0x10, 1)];
        assert_eq!(rule.filter.dst_network.as_deref(), Some("192.168.0.0/24"));
        assert_eq!(rule.params.delay_ms, Some(100.0));
        assert_eq!(rule.params.loss, Some(0.01));
        assert_eq!(rule.params.limit, Some(1000));
        assert_eq!(rule.filter_id.as_deref(), Some("800::800"));
        assert_eq!(rule.direction, Direction::Outgoing);
    }

    #[test]
    fn test_htb_chain_with_exclusion() {
        let outcome = build(
            "\
qdisc htb 1a1a: root refcnt 2 r2q 10 default 0x1 direct_packets_stat 0
qdisc netem 1a9a: parent 1a1a:2 limit 1000 delay 100ms  10ms loss 0.1%
",
            "\
class htb 1a1a:1 root prio 0 rate 32Gbit ceil 32Gbit burst 0b cburst 0b
class htb 1a1a:2 root leaf 1a9a: prio 0 rate 100Kbit ceil 100Kbit burst 1600b cburst 1600b
",
            "\
filter parent 1a1a: protocol ip pref 1 u32 chain 0 fh 801::800 order 2048 key ht 801 bkt 0 flowid 1a1a:2
  match c0a80010/fffffff0 at 16
filter parent 1a1a: protocol ip pref 5 u32 chain 0 fh 800::800 order 2048 key ht 800 bkt 0 flowid 1a1a:2
  match c0a80000/ffffff00 at 16
",
        );
        assert!(outcome.diagnostics.is_empty());
        // The default pass-through class is not a rule.
        assert_eq!(outcome.rules.len(), 1);

        let rule = &outcome.rules[&Handle::new(0x1a1a, 2)];
        assert_eq!(rule.params.rate_bps, Some(100_000));
        assert_eq!(rule.params.delay_ms, Some(100.0));
        assert_eq!(rule.params.delay_jitter_ms, Some(10.0));
        assert_eq!(rule.filter.dst_network.as_deref(), Some("192.168.0.0/24"));
        assert_eq!(
            rule.exclusion.as_ref().and_then(|e| e.dst_network.as_deref()),
            Some("192.168.0.16/28")
        );
        assert_eq!(rule.filter_id.as_deref(), Some("800::800"));
    }

    #[test]
    fn test_tbf_below_netem_overrides_rate() {
        let outcome = build(
            "\
qdisc prio 1a1a: root refcnt 2 bands 4 priomap 1 2 2 2 1 2 0 0 1 1 1 1 1 1 1 1
qdisc netem 1a9a: parent 1a1a:4 limit 1000 delay 50ms
qdisc tbf 20: parent 1a9a:1 rate 2Mbit burst 20000b lat 50ms
",
            "\
class prio 1a1a:1 parent 1a1a:
class prio 1a1a:4 parent 1a1a: leaf 1a9a:
class netem 1a9a:1 parent 1a9a: leaf 20:
",
            "",
        );
        assert!(outcome.diagnostics.is_empty());
        assert_eq!(outcome.rules.len(), 1);
        let rule = &outcome.rules[&Handle::new(0x1a1a, 4)];
        assert_eq!(rule.params.delay_ms, Some(50.0));
        assert_eq!(rule.params.rate_bps, Some(2_000_000));
        assert!(rule.filter.is_anywhere(IpVersion::V4));
    }

    #[test]
    fn test_orphan_filter_is_dropped_with_diagnostic() {
        let outcome = build(
            "qdisc netem 10: root refcnt 2 limit 1000 delay 100ms\n",
            "class netem 10:1 parent 10:\n",
            "filter parent 10: protocol ip pref 5 u32 chain 0 fh 800::800 order 2048 key ht 800 bkt 0 flowid 99:9\n  match c0a80000/ffffff00 at 16\n",
        );
        assert_eq!(outcome.diagnostics.len(), 1);
        assert!(matches!(
            &outcome.diagnostics[0],
            TcshapeError::ParseInconsistency { reference, .. } if reference == "flow id 99:9"
        ));
        // Root netem with a class but no filter and no chain is not a rule.
        assert!(outcome.rules.is_empty());
    }

    #[test]
    fn test_orphan_class_and_qdisc() {
        let outcome = build(
            "qdisc netem 1a9a: parent 1a1a:2 limit 1000 delay 100ms\n",
            "class htb 1a1a:2 parent 1a1a: rate 1Mbit ceil 1Mbit\n",
            "",
        );
        assert!(outcome.rules.is_empty());
        assert_eq!(outcome.diagnostics.len(), 1);
        assert!(outcome.diagnostics[0].to_string().contains("class htb 1a1a:2"));

        let outcome = build(
            "qdisc htb 1a1a: root refcnt 2 default 0x1\nqdisc netem 1a9a: parent 1a1a:7 delay 1ms\n",
            "",
            "",
        );
        assert!(outcome.rules.is_empty());
        assert_eq!(outcome.diagnostics.len(), 1);
    }

    #[test]
    fn test_root_netem_without_classes_is_a_rule() {
        let outcome = build("qdisc netem 8001: root refcnt 2 limit 1000 delay 20ms\n", "", "");
        assert_eq!(outcome.rules.len(), 1);
        assert_eq!(outcome.rules[&Handle::new(0x8001, 0)].params.delay_ms, Some(20.0));
    }

    #[test]
    fn test_unshaped_device_is_empty() {
        let outcome = build(
            "\
qdisc mq 0: root
qdisc fq_codel 0: parent :1 limit 10240p flows 1024 quantum 1514 target 5ms interval 100ms memory_limit 32Mb ecn
qdisc fq_codel 0: parent :2 limit 10240p flows 1024 quantum 1514 target 5ms interval 100ms memory_limit 32Mb ecn
",
            "class mq :1 root\nclass mq :2 root\n",
            "",
        );
        assert!(outcome.rules.is_empty());
        assert!(outcome.diagnostics.is_empty());
    }

    #[test]
    fn test_direction_is_carried() {
        let outcome = MappingBuilder::new("eth0", IpVersion::V6)
            .direction(Direction::Incoming)
            .build(
                &parse_qdisc_records("qdisc netem 10: root delay 5ms\n"),
                &[],
                &[],
            );
        let rule = &outcome.rules[&Handle::new(0x10, 0)];
        assert_eq!(rule.direction, Direction::Incoming);
        assert_eq!(rule.ip_version, IpVersion::V6);
    }
}
