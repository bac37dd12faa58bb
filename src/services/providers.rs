//! Provider registry: resolves delivery backends by provider name and credentials.
//!
//! Email backends are built fresh for every request because credentials
//! travel with the request. Push clients are kept per credential set: asking
//! again with the same service-account key returns the same client, and a
//! different key always gets its own. At most `client_cache_size` clients are
//! kept; the least recently used one is dropped to make room.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Deserialize;

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::services::delivery::{EmailBackend, PushBackend};
use crate::services::email::{HttpEmailBackend, MailSender};
use crate::services::push::{FcmClient, ServiceAccountKey};

/// Supported email providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EmailProvider {
    Mailjet,
    MailerSend,
    Postmark,
    SendGrid,
}

impl EmailProvider {
    pub const ALL: [EmailProvider; 4] = [
        EmailProvider::Mailjet,
        EmailProvider::MailerSend,
        EmailProvider::Postmark,
        EmailProvider::SendGrid,
    ];

    /// Look up a provider by name (case-insensitive)
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "mailjet" => Some(EmailProvider::Mailjet),
            "mailersend" => Some(EmailProvider::MailerSend),
            "postmark" => Some(EmailProvider::Postmark),
            "sendgrid" => Some(EmailProvider::SendGrid),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EmailProvider::Mailjet => "Mailjet",
            EmailProvider::MailerSend => "MailerSend",
            EmailProvider::Postmark => "Postmark",
            EmailProvider::SendGrid => "SendGrid",
        }
    }

    /// Credential fields that must be present before a backend is constructed.
    pub fn required_credentials(self) -> &'static [CredentialField] {
        match self {
            EmailProvider::Mailjet => &[CredentialField::ApiKey, CredentialField::ApiSecret],
            EmailProvider::MailerSend | EmailProvider::Postmark | EmailProvider::SendGrid => {
                &[CredentialField::ApiKey]
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialField {
    ApiKey,
    ApiSecret,
}

impl CredentialField {
    pub fn as_str(self) -> &'static str {
        match self {
            CredentialField::ApiKey => "api_key",
            CredentialField::ApiSecret => "api_secret",
        }
    }
}

/// Per-request email provider credentials.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderCredentials {
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
}

impl ProviderCredentials {
    /// The value of a field, treating blank strings as absent.
    pub fn get(&self, field: CredentialField) -> Option<&str> {
        let value = match field {
            CredentialField::ApiKey => self.api_key.as_deref(),
            CredentialField::ApiSecret => self.api_secret.as_deref(),
        };
        value.filter(|v| !v.trim().is_empty())
    }
}

pub type EmailBackendFactory =
    Arc<dyn Fn(EmailProvider, &ProviderCredentials) -> Arc<dyn EmailBackend> + Send + Sync>;

pub type PushBackendFactory =
    Arc<dyn Fn(ServiceAccountKey) -> AppResult<Arc<dyn PushBackend>> + Send + Sync>;

pub const DEFAULT_PUSH_CLIENT_CAPACITY: usize = 64;

struct CachedPushClient {
    client: Arc<dyn PushBackend>,
    last_used: u64,
}

/// Push clients keyed by credential fingerprint, evicting the least recently used.
struct PushClientCache {
    capacity: usize,
    tick: u64,
    entries: HashMap<String, CachedPushClient>,
}

impl PushClientCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            tick: 0,
            entries: HashMap::new(),
        }
    }

    fn get(&mut self, fingerprint: &str) -> Option<Arc<dyn PushBackend>> {
        self.tick += 1;
        let tick = self.tick;
        self.entries.get_mut(fingerprint).map(|entry| {
            entry.last_used = tick;
            entry.client.clone()
        })
    }

    fn insert(&mut self, fingerprint: String, client: Arc<dyn PushBackend>) {
        while self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(fingerprint, _)| fingerprint.clone());
            match oldest {
                Some(oldest) => {
                    tracing::debug!("Evicting push client {}", oldest);
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }

        self.tick += 1;
        self.entries.insert(
            fingerprint,
            CachedPushClient {
                client,
                last_used: self.tick,
            },
        );
    }
}

pub struct ProviderRegistry {
    email_factories: HashMap<EmailProvider, EmailBackendFactory>,
    push_factory: PushBackendFactory,
    default_push_key: Option<ServiceAccountKey>,
    push_clients: Mutex<PushClientCache>,
}

impl ProviderRegistry {
    /// Registry where every provider is built by `email_factory`.
    pub fn new(email_factory: EmailBackendFactory, push_factory: PushBackendFactory) -> Self {
        let email_factories = EmailProvider::ALL
            .iter()
            .map(|p| (*p, email_factory.clone()))
            .collect();

        Self {
            email_factories,
            push_factory,
            default_push_key: None,
            push_clients: Mutex::new(PushClientCache::new(DEFAULT_PUSH_CLIENT_CAPACITY)),
        }
    }

    /// Registry backed by the HTTP provider implementations.
    pub fn http(client: reqwest::Client, sender: MailSender) -> Self {
        let email_client = client.clone();
        let email_factory: EmailBackendFactory = Arc::new(move |provider, credentials| {
            Arc::new(HttpEmailBackend::new(
                email_client.clone(),
                provider,
                credentials,
                sender.clone(),
            )) as Arc<dyn EmailBackend>
        });
        let push_factory: PushBackendFactory = Arc::new(move |key| {
            Ok(Arc::new(FcmClient::new(client.clone(), key)?) as Arc<dyn PushBackend>)
        });

        Self::new(email_factory, push_factory)
    }

    pub fn from_config(config: &Config) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.mail.request_timeout_seconds))
            .build()?;

        let sender = MailSender {
            address: config.mail.from_address.clone(),
            name: config.mail.from_name.clone(),
        };

        let default_push_key = match config.push.credentials_file.as_deref() {
            Some(path) => {
                let key = ServiceAccountKey::from_file(path)?;
                tracing::info!(
                    "Loaded default push credentials for project {}",
                    key.project_id
                );
                Some(key)
            }
            None => None,
        };

        Ok(Self::http(client, sender)
            .with_default_push_key(default_push_key)
            .with_push_client_capacity(config.push.client_cache_size))
    }

    pub fn with_default_push_key(mut self, key: Option<ServiceAccountKey>) -> Self {
        self.default_push_key = key;
        self
    }

    pub fn with_push_client_capacity(mut self, capacity: usize) -> Self {
        self.push_clients = Mutex::new(PushClientCache::new(capacity));
        self
    }

    /// Resolve the email backend for `service_name`, validating the provider's required credentials.
    pub fn resolve_email_backend(
        &self,
        service_name: &str,
        credentials: &ProviderCredentials,
    ) -> AppResult<Arc<dyn EmailBackend>> {
        let provider = EmailProvider::from_name(service_name)
            .ok_or_else(|| AppError::UnsupportedProvider(service_name.to_string()))?;

        for field in provider.required_credentials() {
            if credentials.get(*field).is_none() {
                return Err(AppError::MissingCredential(field.as_str().to_string()));
            }
        }

        let factory = self
            .email_factories
            .get(&provider)
            .ok_or_else(|| AppError::UnsupportedProvider(service_name.to_string()))?;

        tracing::debug!("Resolved email backend {}", provider.as_str());
        Ok(factory(provider, credentials))
    }

    /// Resolve the push client for `key`, falling back to the configured default key.
    ///
    /// Clients are keyed by credential fingerprint: initializing the same key
    /// twice is a no-op that returns the existing client, unless it has been
    /// evicted in between.
    pub fn resolve_push_backend(
        &self,
        key: Option<&ServiceAccountKey>,
    ) -> AppResult<Arc<dyn PushBackend>> {
        let key = key
            .or(self.default_push_key.as_ref())
            .ok_or_else(|| AppError::MissingCredential("push_credentials".to_string()))?;
        let fingerprint = key.fingerprint();

        let mut clients = self.lock_push_clients();
        if let Some(client) = clients.get(&fingerprint) {
            return Ok(client);
        }

        let client = (self.push_factory)(key.clone())?;
        clients.insert(fingerprint, client.clone());
        Ok(client)
    }

    /// Number of push clients currently cached.
    pub fn push_client_count(&self) -> usize {
        self.lock_push_clients().entries.len()
    }

    fn lock_push_clients(&self) -> MutexGuard<'_, PushClientCache> {
        self.push_clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
