//! ACME dns-01 certificate management. The zone store doubles as the
//! challenge publisher: the CA asks for a TXT record, we put one in the zone
//! we are already authoritative for, and take it back out after validation.

use std::sync::Arc;

use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, OrderStatus, RetryPolicy,
};
use log::{debug, info, warn};

use crate::certstore::{sanitized_domain, CertStore};
use crate::config::Config;
use crate::enums::RecordType;
use crate::error::KnaryError;
use crate::notify::EventRouter;
use crate::zone::ZoneStore;

/// TTL on published challenge TXT records
const CHALLENGE_TTL: u32 = 120;
/// CA-imposed ceiling on SAN entries per certificate
const MAX_SAN_ENTRIES: usize = 100;
/// Renew when this close to notAfter
pub const RENEW_AT_DAYS: i64 = 30;
/// Additionally alert the operator when this close
pub const ALERT_AT_DAYS: i64 = 20;

/// A freshly issued bundle, not yet persisted. Renewal keeps the old
/// material on disk until one of these exists.
pub struct IssuedCertificate {
    pub cert_pem: String,
    pub key_pem: String,
    pub domains: Vec<String>,
}

pub struct AcmeManager {
    store: CertStore,
    email: String,
    directory_url: String,
}

impl AcmeManager {
    pub fn new(store: CertStore, email: &str, directory_url: &str) -> Self {
        Self {
            store,
            email: email.to_string(),
            directory_url: directory_url.to_string(),
        }
    }

    pub fn store(&self) -> &CertStore {
        &self.store
    }

    /// The SAN set for the whole deployment: per apex the wildcard and the
    /// apex itself, the gated-notification wildcard when `DNS_SUBDOMAIN` is
    /// set, and the reverse-proxy wildcard when that is set. Deduplicated
    /// and reduced: a name covered by a wildcard in the set is dropped, but
    /// never any configured apex - `*.<apex>` does not cover its own parent,
    /// and an apex that happens to sit one label under another apex is still
    /// a first-class name clients connect to directly.
    pub fn san_list(config: &Config) -> Result<Vec<String>, KnaryError> {
        let registry = crate::domains::DomainRegistry::from_csv(&config.canary_domains)?;

        let mut names: Vec<String> = Vec::new();
        for apex in registry.all() {
            names.push(format!("*.{apex}"));
            names.push(apex.clone());
            if let Some(sub) = &config.dns_subdomain {
                names.push(format!("*.{sub}.{apex}"));
            }
        }
        if let Some(proxy_apex) = &config.reverse_proxy_domain {
            names.push(format!("*.{}", proxy_apex.trim_end_matches('.')));
        }

        let mut seen = std::collections::HashSet::new();
        names.retain(|name| seen.insert(name.clone()));

        let wildcards: Vec<String> = names
            .iter()
            .filter_map(|name| name.strip_prefix("*.").map(str::to_string))
            .collect();
        let reduced: Vec<String> = names
            .iter()
            .filter(|name| {
                if name.starts_with("*.") {
                    return true;
                }
                if registry.all().iter().any(|apex| apex == *name) {
                    return true;
                }
                // a non-apex `sub.apex` is redundant when `*.apex` is in
                // the set
                let covered = wildcards.iter().any(|parent| {
                    name.strip_suffix(parent.as_str())
                        .map(|head| !head.is_empty() && head.ends_with('.') && !head.trim_end_matches('.').contains('.'))
                        .unwrap_or(false)
                });
                !covered
            })
            .cloned()
            .collect();

        if reduced.len() > MAX_SAN_ENTRIES {
            return Err(KnaryError::Config(format!(
                "certificate would need {} SAN entries, the CA limit is {MAX_SAN_ENTRIES}",
                reduced.len()
            )));
        }
        Ok(reduced)
    }

    /// Restore the account from `account.json`, or register a fresh one and
    /// persist its credentials. An unusable stored registration falls back
    /// to re-registering.
    pub async fn account(&self) -> Result<Account, KnaryError> {
        let path = self.store.account_path();
        if path.exists() {
            let raw = std::fs::read(&path)?;
            match serde_json::from_slice::<AccountCredentials>(&raw) {
                Ok(credentials) => match Account::builder()?.from_credentials(credentials).await {
                    Ok(account) => {
                        debug!("Restored ACME account from {path:?}");
                        return Ok(account);
                    }
                    Err(error) => {
                        warn!("Stored ACME registration is unusable ({error}), re-registering");
                    }
                },
                Err(error) => {
                    warn!("Could not parse {path:?} ({error}), re-registering");
                }
            }
        }

        let contact = format!("mailto:{}", self.email);
        let (account, credentials) = Account::builder()?
            .create(
                &NewAccount {
                    contact: &[contact.as_str()],
                    terms_of_service_agreed: true,
                    only_return_existing: false,
                },
                self.directory_url.clone(),
                None,
            )
            .await?;
        let json = serde_json::to_vec_pretty(&credentials)
            .map_err(|e| KnaryError::Certificate(format!("failed to serialise account: {e}")))?;
        std::fs::write(&path, json)?;
        info!("Registered ACME account for {} at {}", self.email, self.directory_url);
        Ok(account)
    }

    /// Run one order through dns-01 and hand back the issued bundle.
    pub async fn order_certificate(
        &self,
        zone: &Arc<ZoneStore>,
        domains: &[String],
    ) -> Result<IssuedCertificate, KnaryError> {
        let account = self.account().await?;
        info!("Requesting certificate for {domains:?}");

        let identifiers: Vec<Identifier> = domains
            .iter()
            .map(|domain| Identifier::Dns(domain.clone()))
            .collect();
        let mut order = account.new_order(&NewOrder::new(&identifiers)).await?;

        // (fqdn, value) pairs to pull back out of the zone afterwards
        let mut published: Vec<(String, String)> = Vec::new();

        if order.state().status == OrderStatus::Pending {
            let mut authorizations = order.authorizations();
            while let Some(result) = authorizations.next().await {
                let mut authz = result?;
                match authz.status {
                    AuthorizationStatus::Pending => {}
                    AuthorizationStatus::Valid => continue,
                    status => {
                        warn!("Unexpected authorization status: {status:?}");
                        continue;
                    }
                }

                let mut challenge = authz.challenge(ChallengeType::Dns01).ok_or_else(|| {
                    KnaryError::Certificate(
                        "the CA offered no dns-01 challenge, cannot continue".to_string(),
                    )
                })?;
                let identifier = challenge.identifier().to_string();
                let fqdn = format!("_acme-challenge.{}.", identifier.trim_end_matches('.'));
                let value = challenge.key_authorization().dns_value();

                // this is the provider "present" side: the responder starts
                // answering the TXT immediately
                zone.add(&fqdn, CHALLENGE_TTL, RecordType::TXT, &value);
                published.push((fqdn, value));
                challenge.set_ready().await?;
            }
        }

        let status = order.poll_ready(&RetryPolicy::default()).await;

        // cleanup happens whatever the outcome: exactly the records we
        // published, by value
        for (fqdn, value) in &published {
            if zone.remove_txt(fqdn, value).is_none() {
                warn!("Challenge record {fqdn} had already vanished");
            }
        }

        let status = status?;
        if status != OrderStatus::Ready && status != OrderStatus::Valid {
            return Err(KnaryError::Certificate(format!(
                "order finished in state {status:?}"
            )));
        }

        let key_pem = order.finalize().await?;
        let cert_pem = order.poll_certificate(&RetryPolicy::default()).await?;
        info!("Certificate issued for {domains:?}");

        Ok(IssuedCertificate {
            cert_pem,
            key_pem,
            domains: domains.to_vec(),
        })
    }

    /// First-run acquisition: if the current pair already exists on disk
    /// nothing happens; otherwise order and store. Returns the sanitized
    /// name the material lives under. Failure here is fatal to startup.
    pub async fn ensure_certificate(
        &self,
        zone: &Arc<ZoneStore>,
        config: &Config,
    ) -> Result<String, KnaryError> {
        self.store.create_folder_structure()?;
        let domains = Self::san_list(config)?;
        let primary = domains
            .first()
            .ok_or_else(|| KnaryError::Config("empty SAN list".to_string()))?
            .clone();

        if self.store.exists(&primary, ".crt") && self.store.exists(&primary, ".key") {
            info!("Certificate material for {primary} already present, not requesting");
            return sanitized_domain(&primary);
        }

        let issued = self.order_certificate(zone, &domains).await?;
        self.store
            .save_bundle(&primary, &issued.cert_pem, &issued.key_pem, &issued.domains)?;
        sanitized_domain(&primary)
    }

    /// The daily expiry probe. At ≤30 days a renewal runs with the full
    /// current domain set (so config changes flow in); at ≤20 days the
    /// operator hears about it too. A failed renewal is a warning, the old
    /// certificate keeps serving until its true expiry.
    pub async fn renew_if_needed(
        &self,
        zone: &Arc<ZoneStore>,
        config: &Config,
        events: &EventRouter,
    ) -> Result<(), KnaryError> {
        let domains = Self::san_list(config)?;
        let primary = domains
            .first()
            .ok_or_else(|| KnaryError::Config("empty SAN list".to_string()))?
            .clone();

        let days = self.store.days_remaining(&primary)?;
        if days > RENEW_AT_DAYS {
            debug!("Certificate for {primary} has {days} days left, no renewal");
            return Ok(());
        }
        if days <= ALERT_AT_DAYS {
            events.publish(format!(
                ":warning: The TLS certificate for {primary} expires in {days} days."
            ));
        }
        info!("TLS certificate expires in {days} days. Attempting renewal.");

        match self.order_certificate(zone, &domains).await {
            Ok(issued) => {
                self.store.move_to_archive(&primary)?;
                self.store.save_bundle(
                    &primary,
                    &issued.cert_pem,
                    &issued.key_pem,
                    &issued.domains,
                )?;
                events.publish(format!(
                    "Renewed the TLS certificate for {primary} ({} names).",
                    issued.domains.len()
                ));
                Ok(())
            }
            Err(error) => {
                warn!("Certificate renewal failed: {error}");
                events.publish(format!(
                    ":warning: Certificate renewal for {primary} failed: {error}. Serving the old certificate until expiry."
                ));
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(domains: &str) -> Config {
        Config {
            canary_domains: domains.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_san_list_basic() {
        let config = config_with("ex.com");
        let sans = AcmeManager::san_list(&config).expect("builds");
        assert_eq!(sans, vec!["*.ex.com".to_string(), "ex.com".to_string()]);
    }

    #[test]
    fn test_san_list_with_subdomain_and_proxy() {
        let mut config = config_with("ex.com");
        config.dns_subdomain = Some("dns".to_string());
        config.reverse_proxy_domain = Some("rp.ex.com".to_string());
        let sans = AcmeManager::san_list(&config).expect("builds");
        assert_eq!(
            sans,
            vec![
                "*.ex.com".to_string(),
                "ex.com".to_string(),
                "*.dns.ex.com".to_string(),
                "*.rp.ex.com".to_string(),
            ]
        );
    }

    #[test]
    fn test_san_list_with_gated_subdomain() {
        // apex ex.com with DNS_SUBDOMAIN=dns: exactly three names
        let mut config = config_with("ex.com");
        config.dns_subdomain = Some("dns".to_string());
        let sans = AcmeManager::san_list(&config).expect("builds");
        assert_eq!(sans.len(), 3);
        assert!(sans.contains(&"*.ex.com".to_string()));
        assert!(sans.contains(&"ex.com".to_string()));
        assert!(sans.contains(&"*.dns.ex.com".to_string()));
    }

    #[test]
    fn test_san_list_never_drops_an_apex() {
        // b.ex.com sits one label under ex.com, so *.ex.com would cover it
        // textually - but it is a configured apex in its own right and
        // clients connect to it bare, so it stays
        let config = config_with("ex.com,b.ex.com");
        let sans = AcmeManager::san_list(&config).expect("builds");
        assert!(sans.contains(&"*.ex.com".to_string()));
        assert!(sans.contains(&"ex.com".to_string()));
        assert!(sans.contains(&"*.b.ex.com".to_string()));
        assert!(sans.contains(&"b.ex.com".to_string()));
        assert_eq!(sans.len(), 4);
    }

    #[test]
    fn test_san_list_limit() {
        // 50 apexes x2 names = 100: accepted. 51 x2 = 102: fatal.
        let many: Vec<String> = (0..50).map(|i| format!("apex{i}.com")).collect();
        let config = config_with(&many.join(","));
        assert_eq!(AcmeManager::san_list(&config).expect("builds").len(), 100);

        let too_many: Vec<String> = (0..51).map(|i| format!("apex{i}.com")).collect();
        let config = config_with(&too_many.join(","));
        assert!(AcmeManager::san_list(&config).is_err());
    }
}
