/// Stats aggregation
///
/// Turns the flat per-server stat maps returned by the fan-out stats calls into
/// structured records. Compound keys of the form `<prefix>:<id>:<field>` (or
/// `<id>:<field>`) are grouped by id; anything else belongs to the server-level
/// record.
pub mod model;

use std::collections::{BTreeMap, HashMap};
use tracing::trace;

pub use model::{CacheDump, MemcachedStats, StatRecord, StatsItem, StatsItems, StatsSlab, StatsSlabs};

/// Flat stat name -> value map from one server
pub type RawStatBlock = BTreeMap<String, String>;

/// Server address -> that server's stat block
pub type ClusterStats = BTreeMap<String, RawStatBlock>;

/// Where a stat key belongs
#[derive(Debug, PartialEq, Eq)]
enum StatKey<'a> {
    TopLevel(&'a str),
    Grouped { id: &'a str, field: &'a str },
}

/// `items:3:number` -> id 3, field number; `3:chunk_size` -> id 3; `uptime` -> top level
fn classify(key: &str) -> StatKey<'_> {
    let mut segments = key.rsplitn(3, ':');
    let field = segments.next().unwrap_or(key);
    match segments.next() {
        Some(id) => StatKey::Grouped { id, field },
        None => StatKey::TopLevel(field),
    }
}

/// Group one block into top-level stats and per-id records
fn group<R, F>(block: &RawStatBlock, mut top_level: F) -> Vec<R>
where
    R: StatRecord + WithId,
    F: FnMut(&str, &str),
{
    let mut groups: HashMap<&str, R> = HashMap::new();
    for (key, value) in block {
        match classify(key) {
            StatKey::TopLevel(field) => top_level(field, value),
            StatKey::Grouped { id, field } => {
                let record = groups.entry(id).or_insert_with(|| R::with_id(id));
                if !record.assign(field, value) {
                    trace!("Ignoring unknown stat field {}", key);
                }
            }
        }
    }

    let mut records: Vec<(&str, R)> = groups.into_iter().collect();
    records.sort_by(|(a, _), (b, _)| id_order(a, b));
    records.into_iter().map(|(_, record)| record).collect()
}

/// Numeric ids in numeric order, anything else after them
fn id_order(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        (Ok(_), Err(_)) => std::cmp::Ordering::Less,
        (Err(_), Ok(_)) => std::cmp::Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

/// Records keyed by a group id
pub trait WithId {
    fn with_id(id: &str) -> Self;
}

impl WithId for StatsItem {
    fn with_id(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Self::default()
        }
    }
}

impl WithId for StatsSlab {
    fn with_id(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Self::default()
        }
    }
}

/// General stats, one record per server
pub fn stats_to_model(stats: &ClusterStats) -> Vec<MemcachedStats> {
    stats
        .iter()
        .map(|(server, block)| {
            let mut record = MemcachedStats::new(server.as_str());
            for (field, value) in block {
                record.assign(field, value);
            }
            record
        })
        .collect()
}

/// `stats items`, grouped by slab id
pub fn stats_items_to_model(stats: &ClusterStats) -> Vec<StatsItems> {
    stats
        .iter()
        .map(|(server, block)| StatsItems {
            server: server.clone(),
            items: group(block, |_, _| {}),
        })
        .collect()
}

/// `stats slabs`, grouped by slab id with the server-wide totals alongside
pub fn stats_slabs_to_model(stats: &ClusterStats) -> Vec<StatsSlabs> {
    stats
        .iter()
        .map(|(server, block)| {
            let mut summary = StatsSlabs {
                server: server.clone(),
                ..StatsSlabs::default()
            };
            let slabs = group(block, |field, value| {
                summary.assign(field, value);
            });
            summary.slabs = slabs;
            summary
        })
        .collect()
}

/// `stats cachedump`, keeping only the keys
pub fn stats_cache_dump_to_model(stats: &ClusterStats) -> Vec<CacheDump> {
    stats
        .iter()
        .map(|(server, block)| CacheDump {
            server: server.clone(),
            keys: block.keys().cloned().collect(),
        })
        .collect()
}
