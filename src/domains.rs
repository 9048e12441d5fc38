use crate::error::KnaryError;

/// The canonical set of canary apex domains, loaded once from the
/// comma-separated `CANARY_DOMAIN` value and never mutated afterwards. Order
/// matters: the first apex names the certificate files.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DomainRegistry {
    apexes: Vec<String>,
}

impl DomainRegistry {
    /// Whitespace around entries is tolerated, empty entries are skipped.
    pub fn from_csv(raw: &str) -> Result<Self, KnaryError> {
        let apexes: Vec<String> = raw
            .split(',')
            .map(|d| d.trim().trim_end_matches('.').to_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
        if apexes.is_empty() {
            return Err(KnaryError::Config(
                "CANARY_DOMAIN must name at least one domain".to_string(),
            ));
        }
        Ok(Self { apexes })
    }

    /// Case-insensitive suffix test, with or without a trailing dot on the
    /// needle. Returns the apex that matched.
    pub fn suffix_match(&self, host: &str) -> Option<&str> {
        let needle = host.trim().trim_end_matches('.').to_lowercase();
        self.apexes
            .iter()
            .find(|apex| needle == **apex || needle.ends_with(&format!(".{apex}")))
            .map(|apex| apex.as_str())
    }

    /// true if `host` is exactly an apex (modulo case and trailing dot)
    pub fn is_root(&self, host: &str) -> bool {
        let needle = host.trim().trim_end_matches('.').to_lowercase();
        self.apexes.iter().any(|apex| needle == *apex)
    }

    pub fn first(&self) -> &str {
        // non-empty is a construction invariant
        &self.apexes[0]
    }

    pub fn all(&self) -> &[String] {
        &self.apexes
    }
}
