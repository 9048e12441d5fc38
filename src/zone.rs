//! The in-memory zone store. Populated from a master-format zone file at
//! startup; the ACME manager publishes transient challenge TXT records
//! through it mid-flight. Everything is serialized by a single mutex because
//! mutations are rare and queries are microseconds.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;

use log::{debug, info};
use regex::Regex;

use crate::enums::RecordType;
use crate::error::KnaryError;

/// One record in the store. `rdata` stays in its zone-file text form and is
/// only turned into wire bytes when an answer is assembled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneEntry {
    /// lowercased FQDN with a trailing dot
    pub owner: String,
    pub ttl: u32,
    pub rtype: RecordType,
    pub rdata: String,
}

#[derive(Default)]
struct ZoneInner {
    /// (owner) -> insertion-ordinal -> record. Multiple records may share an
    /// owner and type.
    records: HashMap<String, BTreeMap<u64, ZoneEntry>>,
    ordinal: u64,
}

#[derive(Default)]
pub struct ZoneStore {
    inner: Mutex<ZoneInner>,
}

impl ZoneStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a master-format zone file into the store. Returns the number of
    /// records loaded; any parse error is fatal to startup.
    pub fn load(&self, path: &Path) -> Result<usize, KnaryError> {
        let contents = std::fs::read_to_string(path).map_err(|error| {
            KnaryError::ZoneFile(format!("failed to read {path:?}: {error}"))
        })?;
        let entries = parse_zone_file(&contents)?;
        let count = entries.len();
        for entry in entries {
            self.add(&entry.owner, entry.ttl, entry.rtype, &entry.rdata);
        }
        info!("Monitoring {count} items in zone");
        Ok(count)
    }

    /// Records matching (owner, qtype). The owner is normalized to carry a
    /// trailing dot before lookup.
    pub fn query(&self, owner: &str, rtype: RecordType) -> Vec<ZoneEntry> {
        let owner = normalize_owner(owner);
        let inner = self.lock();
        let Some(records) = inner.records.get(&owner) else {
            return Vec::new();
        };
        records
            .values()
            .filter(|entry| entry.rtype == rtype)
            .cloned()
            .collect()
    }

    /// Append-under-key with a fresh ordinal.
    pub fn add(&self, fqdn: &str, ttl: u32, rtype: RecordType, rdata: &str) {
        let owner = normalize_owner(fqdn);
        let mut inner = self.lock();
        let ordinal = inner.ordinal;
        inner.ordinal += 1;
        debug!("zone add: {owner} {ttl} {rtype} {rdata}");
        inner.records.entry(owner.clone()).or_default().insert(
            ordinal,
            ZoneEntry {
                owner,
                ttl,
                rtype,
                rdata: rdata.to_string(),
            },
        );
    }

    /// Remove the most-recently-inserted record for a name (LIFO).
    pub fn remove(&self, fqdn: &str) -> Option<ZoneEntry> {
        let owner = normalize_owner(fqdn);
        let mut inner = self.lock();
        let records = inner.records.get_mut(&owner)?;
        let last = *records.keys().next_back()?;
        let removed = records.remove(&last);
        if records.is_empty() {
            inner.records.remove(&owner);
        }
        removed
    }

    /// Remove exactly the TXT record matching (owner, value). Challenge
    /// cleanup uses this so concurrent orders for sibling names can't yank
    /// each other's records.
    pub fn remove_txt(&self, fqdn: &str, value: &str) -> Option<ZoneEntry> {
        let owner = normalize_owner(fqdn);
        let mut inner = self.lock();
        let records = inner.records.get_mut(&owner)?;
        let target = records
            .iter()
            .rev()
            .find(|(_, entry)| entry.rtype == RecordType::TXT && entry.rdata == value)
            .map(|(ordinal, _)| *ordinal)?;
        let removed = records.remove(&target);
        if records.is_empty() {
            inner.records.remove(&owner);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().records.values().map(|r| r.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ZoneInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn normalize_owner(fqdn: &str) -> String {
    let mut owner = fqdn.trim().to_lowercase();
    if !owner.ends_with('.') {
        owner.push('.');
    }
    owner
}

/// Parse the text of an RFC 1035 master file. Handles `$ORIGIN`, `$TTL`,
/// `;` comments, `@`, origin-relative names and quoted TXT rdata. Multi-line
/// parenthesised records are not supported, which keeps the lexer a handful
/// of regexes rather than a state machine.
pub fn parse_zone_file(contents: &str) -> Result<Vec<ZoneEntry>, KnaryError> {
    let regex_origin =
        Regex::new(r"^\$ORIGIN\s+(?P<domain>\S+)").map_err(|e| KnaryError::Generic(e.to_string()))?;
    let regex_ttl =
        Regex::new(r"^\$TTL\s+(?P<ttl>\d+)").map_err(|e| KnaryError::Generic(e.to_string()))?;
    let regex_record = Regex::new(
        r#"^(?P<host>\S+)\s+(?:(?P<ttl>\d+)\s+)?(?:(?P<class>IN|CH|CS|HS)\s+)?(?P<rtype>[A-Z]+)\s+(?P<rdata>.+)$"#,
    )
    .map_err(|e| KnaryError::Generic(e.to_string()))?;

    let mut origin: Option<String> = None;
    let mut default_ttl: u32 = 3600;
    let mut entries: Vec<ZoneEntry> = Vec::new();

    for (lineno, raw_line) in contents.lines().enumerate() {
        // strip comments outside quotes
        let line = strip_comment(raw_line).trim_end().replace('\t', " ");
        let line = line.trim_start();
        if line.is_empty() {
            continue;
        }

        if let Some(caps) = regex_origin.captures(line) {
            origin = caps.name("domain").map(|d| normalize_owner(d.as_str()));
            continue;
        }
        if let Some(caps) = regex_ttl.captures(line) {
            default_ttl = caps
                .name("ttl")
                .and_then(|t| t.as_str().parse().ok())
                .ok_or_else(|| {
                    KnaryError::ZoneFile(format!("bad $TTL on line {}", lineno + 1))
                })?;
            continue;
        }

        let caps = regex_record.captures(line).ok_or_else(|| {
            KnaryError::ZoneFile(format!("unparseable record on line {}: {line:?}", lineno + 1))
        })?;

        let host = caps
            .name("host")
            .map(|h| h.as_str())
            .ok_or_else(|| KnaryError::ZoneFile(format!("no owner on line {}", lineno + 1)))?;
        let owner = qualify(host, origin.as_deref(), lineno)?;

        let ttl = match caps.name("ttl") {
            Some(t) => t.as_str().parse().map_err(|_| {
                KnaryError::ZoneFile(format!("bad TTL on line {}", lineno + 1))
            })?,
            None => default_ttl,
        };

        let rtype_str = caps
            .name("rtype")
            .map(|t| t.as_str())
            .ok_or_else(|| KnaryError::ZoneFile(format!("no type on line {}", lineno + 1)))?;
        let rtype = RecordType::from(rtype_str);
        if rtype == RecordType::InvalidType {
            return Err(KnaryError::ZoneFile(format!(
                "unsupported record type {rtype_str:?} on line {}",
                lineno + 1
            )));
        }

        let rdata = caps
            .name("rdata")
            .map(|d| d.as_str().trim())
            .ok_or_else(|| KnaryError::ZoneFile(format!("no rdata on line {}", lineno + 1)))?;
        // TXT rdata arrives quoted in master files
        let rdata = rdata.trim_matches('"').to_string();

        entries.push(ZoneEntry {
            owner,
            ttl,
            rtype,
            rdata,
        });
    }

    Ok(entries)
}

fn qualify(host: &str, origin: Option<&str>, lineno: usize) -> Result<String, KnaryError> {
    if host == "@" {
        return origin.map(str::to_string).ok_or_else(|| {
            KnaryError::ZoneFile(format!("@ with no $ORIGIN on line {}", lineno + 1))
        });
    }
    if host.ends_with('.') {
        return Ok(host.to_lowercase());
    }
    match origin {
        Some(origin) => Ok(format!("{}.{}", host.to_lowercase(), origin)),
        None => Err(KnaryError::ZoneFile(format!(
            "relative name {host:?} with no $ORIGIN on line {}",
            lineno + 1
        ))),
    }
}

fn strip_comment(line: &str) -> &str {
    let mut in_quotes = false;
    for (idx, c) in line.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ';' if !in_quotes => return &line[..idx],
            _ => {}
        }
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    const ZONE: &str = r#"
$ORIGIN ex.com.
$TTL 300
; a comment line
@        IN SOA   ns.ex.com. admin.ex.com. 2021041401 7200 3600 604800 300
www      60 IN A  192.0.2.5
www      60 IN A  192.0.2.6
txthost     IN TXT "hello; world"
alias.ex.com.  IN CNAME www.ex.com.
"#;

    #[test]
    fn test_parse_zone_file() {
        let entries = parse_zone_file(ZONE).expect("should parse");
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[0].owner, "ex.com.");
        assert_eq!(entries[0].rtype, RecordType::SOA);
        assert_eq!(entries[1].owner, "www.ex.com.");
        assert_eq!(entries[1].ttl, 60);
        assert_eq!(entries[3].rdata, "hello; world");
        assert_eq!(entries[4].owner, "alias.ex.com.");
    }

    #[test]
    fn test_parse_error_is_fatal() {
        assert!(parse_zone_file("www IN A 192.0.2.5").is_err()); // no origin
        assert!(parse_zone_file("$ORIGIN ex.com.\ngarbage").is_err());
    }

    #[test]
    fn test_query_filters_by_type() {
        let store = ZoneStore::new();
        for entry in parse_zone_file(ZONE).expect("should parse") {
            store.add(&entry.owner, entry.ttl, entry.rtype, &entry.rdata);
        }
        let hits = store.query("www.ex.com", RecordType::A);
        assert_eq!(hits.len(), 2);
        assert!(store.query("www.ex.com", RecordType::TXT).is_empty());
        // owner lookup normalises the trailing dot
        assert_eq!(store.query("WWW.EX.COM.", RecordType::A).len(), 2);
    }

    #[test]
    fn test_add_remove_lifo() {
        let store = ZoneStore::new();
        store.add("_acme-challenge.ex.com", 120, RecordType::TXT, "first");
        store.add("_acme-challenge.ex.com", 120, RecordType::TXT, "second");
        let removed = store.remove("_acme-challenge.ex.com.").expect("removes");
        assert_eq!(removed.rdata, "second");
        assert_eq!(store.len(), 1);
        assert!(store.remove("_acme-challenge.ex.com").is_some());
        assert!(store.remove("_acme-challenge.ex.com").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_remove_txt_by_value() {
        let store = ZoneStore::new();
        store.add("_acme-challenge.ex.com", 120, RecordType::TXT, "first");
        store.add("_acme-challenge.ex.com", 120, RecordType::TXT, "second");
        let removed = store
            .remove_txt("_acme-challenge.ex.com", "first")
            .expect("removes the exact record");
        assert_eq!(removed.rdata, "first");
        let remaining = store.query("_acme-challenge.ex.com", RecordType::TXT);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].rdata, "second");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("zone.txt");
        std::fs::write(&path, ZONE).expect("write");
        let store = ZoneStore::new();
        assert_eq!(store.load(&path).expect("should load"), 5);
        assert_eq!(store.len(), 5);
    }
}
