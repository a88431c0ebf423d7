/// Structured stat records
///
/// Fields are assigned through per-record tables from lowercase stat name to a
/// setter, generated by `stat_fields!`. Names missing from a table are ignored.
use fnv::FnvHashMap;
use lazy_static::lazy_static;
use serde::Serialize;
use std::collections::BTreeSet;

pub type Setter<T> = fn(&mut T, &str);

/// A record whose fields can be set by stat name
pub trait StatRecord: Sized + 'static {
    fn setters() -> &'static FnvHashMap<&'static str, Setter<Self>>;

    /// Assign one stat; returns false for unknown names
    fn assign(&mut self, field: &str, value: &str) -> bool {
        match Self::setters().get(field.to_ascii_lowercase().as_str()) {
            Some(set) => {
                set(self, value.trim());
                true
            }
            None => false,
        }
    }
}

macro_rules! stat_fields {
    (@parse count, $value:expr) => {
        $value.parse::<u64>().ok()
    };
    (@parse text, $value:expr) => {
        Some($value.to_string())
    };
    ($ty:ident, $table:ident { $($field:ident: $kind:ident),* $(,)? }) => {
        lazy_static! {
            static ref $table: FnvHashMap<&'static str, Setter<$ty>> = {
                let mut table: FnvHashMap<&'static str, Setter<$ty>> = FnvHashMap::default();
                $(
                    table.insert(stringify!($field), |record: &mut $ty, value: &str| {
                        record.$field = stat_fields!(@parse $kind, value);
                    });
                )*
                table
            };
        }

        impl StatRecord for $ty {
            fn setters() -> &'static FnvHashMap<&'static str, Setter<Self>> {
                &$table
            }
        }
    };
}

/// General `stats` of one server
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemcachedStats {
    pub server: String,
    pub pid: Option<u64>,
    pub repcached_qi_free: Option<u64>,
    pub repcached_wsize: Option<u64>,
    pub repcached_wdata: Option<u64>,
    pub repcached_version: Option<String>,
    pub replication: Option<String>,
    pub uptime: Option<u64>,
    pub time: Option<u64>,
    pub version: Option<String>,
    pub libevent: Option<String>,
    pub pointer_size: Option<u64>,
    pub rusage_user: Option<String>,
    pub rusage_system: Option<String>,
    pub curr_connections: Option<u64>,
    pub total_connections: Option<u64>,
    pub connection_structures: Option<u64>,
    pub reserved_fds: Option<u64>,
    pub cmd_get: Option<u64>,
    pub cmd_set: Option<u64>,
    pub cmd_flush: Option<u64>,
    pub cmd_touch: Option<u64>,
    pub get_hits: Option<u64>,
    pub get_misses: Option<u64>,
    pub delete_misses: Option<u64>,
    pub delete_hits: Option<u64>,
    pub incr_misses: Option<u64>,
    pub incr_hits: Option<u64>,
    pub decr_misses: Option<u64>,
    pub decr_hits: Option<u64>,
    pub cas_misses: Option<u64>,
    pub cas_hits: Option<u64>,
    pub cas_badval: Option<u64>,
    pub touch_hits: Option<u64>,
    pub touch_misses: Option<u64>,
    pub auth_cmds: Option<u64>,
    pub auth_errors: Option<u64>,
    pub bytes_read: Option<u64>,
    pub bytes_written: Option<u64>,
    pub limit_maxbytes: Option<u64>,
    pub accepting_conns: Option<u64>,
    pub listen_disabled_num: Option<u64>,
    pub threads: Option<u64>,
    pub conn_yields: Option<u64>,
    pub hash_power_level: Option<u64>,
    pub hash_bytes: Option<u64>,
    pub hash_is_expanding: Option<u64>,
    pub bytes: Option<u64>,
    pub curr_items: Option<u64>,
    pub total_items: Option<u64>,
    pub expired_unfetched: Option<u64>,
    pub evicted_unfetched: Option<u64>,
    pub evictions: Option<u64>,
    pub reclaimed: Option<u64>,
}

stat_fields!(MemcachedStats, GENERAL_FIELDS {
    pid: count,
    repcached_qi_free: count,
    repcached_wsize: count,
    repcached_wdata: count,
    repcached_version: text,
    replication: text,
    uptime: count,
    time: count,
    version: text,
    libevent: text,
    pointer_size: count,
    rusage_user: text,
    rusage_system: text,
    curr_connections: count,
    total_connections: count,
    connection_structures: count,
    reserved_fds: count,
    cmd_get: count,
    cmd_set: count,
    cmd_flush: count,
    cmd_touch: count,
    get_hits: count,
    get_misses: count,
    delete_misses: count,
    delete_hits: count,
    incr_misses: count,
    incr_hits: count,
    decr_misses: count,
    decr_hits: count,
    cas_misses: count,
    cas_hits: count,
    cas_badval: count,
    touch_hits: count,
    touch_misses: count,
    auth_cmds: count,
    auth_errors: count,
    bytes_read: count,
    bytes_written: count,
    limit_maxbytes: count,
    accepting_conns: count,
    listen_disabled_num: count,
    threads: count,
    conn_yields: count,
    hash_power_level: count,
    hash_bytes: count,
    hash_is_expanding: count,
    bytes: count,
    curr_items: count,
    total_items: count,
    expired_unfetched: count,
    evicted_unfetched: count,
    evictions: count,
    reclaimed: count,
});

impl MemcachedStats {
    pub fn new<S: Into<String>>(server: S) -> Self {
        Self {
            server: server.into(),
            ..Self::default()
        }
    }

    /// Fraction of `get`s that hit, when the server reported any
    pub fn hit_ratio(&self) -> Option<f64> {
        let hits = self.get_hits?;
        let total = hits + self.get_misses?;
        (total > 0).then(|| hits as f64 / total as f64)
    }
}

/// Item stats of one slab class (`items:<id>:<field>`)
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsItem {
    pub id: String,
    pub number: Option<u64>,
    pub age: Option<u64>,
    pub evicted: Option<u64>,
    pub evicted_nonzero: Option<u64>,
    pub evicted_time: Option<u64>,
    pub outofmemory: Option<u64>,
    pub tailrepairs: Option<u64>,
    pub reclaimed: Option<u64>,
    pub expired_unfetched: Option<u64>,
    pub evicted_unfetched: Option<u64>,
    pub crawler_reclaimed: Option<u64>,
    pub crawler_items_checked: Option<u64>,
    pub lrutail_reflocked: Option<u64>,
}

stat_fields!(StatsItem, ITEM_FIELDS {
    number: count,
    age: count,
    evicted: count,
    evicted_nonzero: count,
    evicted_time: count,
    outofmemory: count,
    tailrepairs: count,
    reclaimed: count,
    expired_unfetched: count,
    evicted_unfetched: count,
    crawler_reclaimed: count,
    crawler_items_checked: count,
    lrutail_reflocked: count,
});

/// `stats items` of one server
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsItems {
    pub server: String,
    pub items: Vec<StatsItem>,
}

/// Slab stats of one slab class (`<id>:<field>`)
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSlab {
    pub id: String,
    pub chunk_size: Option<u64>,
    pub chunks_per_page: Option<u64>,
    pub total_pages: Option<u64>,
    pub total_chunks: Option<u64>,
    pub used_chunks: Option<u64>,
    pub free_chunks: Option<u64>,
    pub free_chunks_end: Option<u64>,
    pub mem_requested: Option<u64>,
    pub get_hits: Option<u64>,
    pub cmd_set: Option<u64>,
    pub delete_hits: Option<u64>,
    pub incr_hits: Option<u64>,
    pub decr_hits: Option<u64>,
    pub cas_hits: Option<u64>,
    pub cas_badval: Option<u64>,
    pub touch_hits: Option<u64>,
}

stat_fields!(StatsSlab, SLAB_FIELDS {
    chunk_size: count,
    chunks_per_page: count,
    total_pages: count,
    total_chunks: count,
    used_chunks: count,
    free_chunks: count,
    free_chunks_end: count,
    mem_requested: count,
    get_hits: count,
    cmd_set: count,
    delete_hits: count,
    incr_hits: count,
    decr_hits: count,
    cas_hits: count,
    cas_badval: count,
    touch_hits: count,
});

/// `stats slabs` of one server
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSlabs {
    pub server: String,
    pub active_slabs: Option<u64>,
    pub total_malloced: Option<u64>,
    pub slabs: Vec<StatsSlab>,
}

stat_fields!(StatsSlabs, SLABS_SUMMARY_FIELDS {
    active_slabs: count,
    total_malloced: count,
});

/// Keys listed by `stats cachedump` on one server; best effort, never complete
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheDump {
    pub server: String,
    pub keys: BTreeSet<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assign_known_and_unknown_fields() {
        let mut stats = MemcachedStats::new("mem:1");
        assert!(stats.assign("curr_items", "12"));
        assert!(stats.assign("VERSION", "1.6.21\r\n"));
        assert!(!stats.assign("brand_new_stat", "1"));

        assert_eq!(stats.curr_items, Some(12));
        assert_eq!(stats.version.as_deref(), Some("1.6.21"));
    }

    #[test]
    fn test_unparsable_counter_is_none() {
        let mut item = StatsItem::default();
        assert!(item.assign("number", "lots"));
        assert_eq!(item.number, None);
    }

    #[test]
    fn test_hit_ratio() {
        let mut stats = MemcachedStats::new("mem:1");
        assert_eq!(stats.hit_ratio(), None);
        stats.assign("get_hits", "3");
        stats.assign("get_misses", "1");
        assert_eq!(stats.hit_ratio(), Some(0.75));
    }
}
