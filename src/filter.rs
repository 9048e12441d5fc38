//! Controls whether a match will notify the event sinks: the allowlist and
//! the denylist, with the standardisation rules both share.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};

/// Denied items older than this many days get flagged by the daily scan
const STALE_AFTER_DAYS: i64 = 14;

/// Standardise a needle or list entry:
/// 1. lowercase, trim surrounding whitespace
/// 2. if it's an IP literal, yeet the port off it
/// 3. otherwise split on `:`, take the first segment, strip a trailing dot
pub fn standardize(term: &str) -> String {
    let d = term.trim().to_lowercase();
    if let Ok(ip) = d.parse::<IpAddr>() {
        return ip.to_string();
    }
    if let Ok(addr) = d.parse::<SocketAddr>() {
        return addr.ip().to_string();
    }
    let host = d.split(':').next().unwrap_or_default();
    host.trim_end_matches('.').to_string()
}

/// The allow + denylists. The allowlist is loaded once and never mutated so
/// reads need no lock; the denylist carries a last-hit timestamp that is
/// touched on every match, so search-and-touch happens as one operation under
/// the map's mutex.
pub struct NotificationFilter {
    allowed: Vec<String>,
    denied: Mutex<HashMap<String, DateTime<Utc>>>,
    strict_allow: bool,
}

impl NotificationFilter {
    pub fn new(strict_allow: bool) -> Self {
        Self {
            allowed: Vec::new(),
            denied: Mutex::new(HashMap::new()),
            strict_allow,
        }
    }

    /// Load both lists. A missing or unreadable file is an advisory, not an
    /// error: the list is simply empty.
    pub fn load(
        allowlist: Option<&Path>,
        denylist: Option<&Path>,
        strict_allow: bool,
    ) -> Self {
        let mut filter = Self::new(strict_allow);
        if let Some(path) = allowlist {
            filter.allowed = read_list(path, "allowlist");
            info!("Monitoring {} items in allowlist", filter.allowed.len());
        }
        if let Some(path) = denylist {
            let now = Utc::now();
            let denied: HashMap<String, DateTime<Utc>> = read_list(path, "denylist")
                .into_iter()
                .map(|entry| (entry, now))
                .collect();
            info!("Monitoring {} items in denylist", denied.len());
            filter.denied = Mutex::new(denied);
        }
        filter
    }

    /// Denylist test over a set of needles: hit if a standardised needle
    /// equals an entry or is a subdomain of one. A hit touches the entry's
    /// timestamp while still holding the lock.
    pub fn denied(&self, needles: &[&str]) -> bool {
        let mut deny = match self.denied.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if deny.is_empty() {
            return false;
        }
        for needle in needles {
            if needle.is_empty() {
                // would happen if there's no X-Forwarded-For header
                continue;
            }
            let item = standardize(needle);
            let hit = deny
                .keys()
                .find(|entry| item == **entry || item.ends_with(&format!(".{entry}")))
                .cloned();
            if let Some(entry) = hit {
                deny.insert(entry.clone(), Utc::now());
                debug!("Found {item} in denylist (entry {entry})");
                return true;
            }
        }
        false
    }

    /// Allowlist test: an empty allowlist permits everything. Strict mode
    /// requires equality, otherwise an entry just has to be contained in the
    /// needle.
    pub fn allowed(&self, needles: &[&str]) -> bool {
        if self.allowed.is_empty() {
            return true;
        }
        for needle in needles {
            let item = standardize(needle);
            for entry in &self.allowed {
                let hit = match self.strict_allow {
                    true => item == *entry,
                    false => item.contains(entry.as_str()),
                };
                if hit {
                    debug!("Found {item} in allowlist (entry {entry})");
                    return true;
                }
            }
        }
        false
    }

    /// Deny is evaluated first, then allow. An event notifies iff neither
    /// said no.
    pub fn should_notify(&self, needles: &[&str]) -> bool {
        !self.denied(needles) && self.allowed(needles)
    }

    /// The daily scan: entries whose last hit is older than 14 days. Entries
    /// are retained, the caller just reminds the operator about them.
    pub fn stale_entries(&self) -> Vec<String> {
        let deny = match self.denied.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let cutoff = Utc::now() - Duration::days(STALE_AFTER_DAYS);
        deny.iter()
            .filter(|(_, last_hit)| **last_hit < cutoff)
            .map(|(entry, _)| entry.clone())
            .collect()
    }

    pub fn allow_count(&self) -> usize {
        self.allowed.len()
    }

    pub fn deny_count(&self) -> usize {
        match self.denied.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_entries(allowed: Vec<&str>, denied: Vec<&str>, strict: bool) -> Self {
        let now = Utc::now();
        Self {
            allowed: allowed.into_iter().map(standardize).collect(),
            denied: Mutex::new(
                denied
                    .into_iter()
                    .map(|entry| (standardize(entry), now))
                    .collect(),
            ),
            strict_allow: strict,
        }
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, entry: &str, days: i64) {
        let mut deny = self.denied.lock().expect("lock poisoned");
        deny.insert(entry.to_string(), Utc::now() - Duration::days(days));
    }

    #[cfg(test)]
    pub(crate) fn last_hit(&self, entry: &str) -> Option<DateTime<Utc>> {
        self.denied.lock().expect("lock poisoned").get(entry).copied()
    }
}

fn read_list(path: &Path, label: &str) -> Vec<String> {
    let contents = match std::fs::read_to_string(path) {
        Ok(value) => value,
        Err(error) => {
            warn!("Failed to read {label} file {path:?}: {error} - ignoring");
            return Vec::new();
        }
    };
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(standardize)
        .collect()
}
