//! Provider registry and routing.
//!
//! The manager owns every registered backend behind its own lock, so
//! a slow send on one provider never blocks configuring another. One
//! service at a time is "active" and receives sends that carry no
//! per-message override.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use sms_services_module::{
    Credentials, SendResult, SmsService, StatusResult, TextBeltService, TwilioService,
};

use crate::config;
use crate::scheduler::SqliteMessageStore;

/// Error reported when no backend can be resolved for a send.
pub const NO_SERVICE_ERROR: &str = "no provider configured";

type ServiceSlot = Arc<Mutex<Box<dyn SmsService>>>;

pub struct SmsServiceManager {
    store: Arc<SqliteMessageStore>,
    services: HashMap<String, ServiceSlot>,
    active: Mutex<Option<String>>,
}

impl SmsServiceManager {
    /// Builds a manager with the stock backends, reloading any
    /// persisted credentials and active-service selection.
    pub fn new(store: Arc<SqliteMessageStore>) -> Self {
        Self::with_services(
            store,
            vec![Box::new(TwilioService::new()), Box::new(TextBeltService::new())],
        )
    }

    /// Builds a manager over an explicit set of backends. Tests use
    /// this to substitute in-memory fakes for the HTTP providers.
    pub fn with_services(
        store: Arc<SqliteMessageStore>,
        services: Vec<Box<dyn SmsService>>,
    ) -> Self {
        let mut registry = HashMap::new();
        for mut service in services {
            let name = service.name().to_string();
            if let Some(credentials) = store.credentials(&name) {
                if !service.configure(&credentials) {
                    warn!("stored credentials for {} no longer validate", name);
                }
            }
            registry.insert(name, Arc::new(Mutex::new(service)));
        }

        let active = store.active_service().filter(|name| {
            registry
                .get(name)
                .map(|slot| slot_is_configured(slot))
                .unwrap_or(false)
        });

        Self {
            store,
            services: registry,
            active: Mutex::new(active),
        }
    }

    pub fn available_services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn configured_services(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .services
            .iter()
            .filter(|(_, slot)| slot_is_configured(slot))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn active_service(&self) -> Option<String> {
        self.active.lock().ok().and_then(|active| active.clone())
    }

    /// Hands credentials to the named backend and persists them once
    /// the backend accepts them. Rejected credentials leave both the
    /// backend and the store untouched.
    pub fn configure_service(&self, name: &str, credentials: &Credentials) -> bool {
        let Some(slot) = self.services.get(name) else {
            warn!("cannot configure unknown service {}", name);
            return false;
        };
        let Ok(mut service) = slot.lock() else {
            return false;
        };
        if !service.configure(credentials) {
            warn!("credentials for {} were rejected", name);
            return false;
        }
        drop(service);

        if !self.store.save_credentials(name, credentials) {
            warn!("credentials for {} accepted but not persisted", name);
        }
        info!("configured SMS service {}", name);
        true
    }

    /// Selects the default backend for sends without an override. The
    /// service must be registered and configured; otherwise the
    /// previous selection stays in place and `false` is returned.
    pub fn set_active(&self, name: &str) -> bool {
        let Some(slot) = self.services.get(name) else {
            warn!("cannot activate unknown service {}", name);
            return false;
        };
        if !slot_is_configured(slot) {
            warn!("cannot activate unconfigured service {}", name);
            return false;
        }
        if !self.store.set_active_service(name) {
            warn!("failed to persist active service {}", name);
            return false;
        }
        if let Ok(mut active) = self.active.lock() {
            *active = Some(name.to_string());
        }
        info!("active SMS service is now {}", name);
        true
    }

    /// Seeds any backend the store knows nothing about from
    /// environment credentials. Persisted credentials always win.
    /// Returns the names that were newly configured.
    pub fn configure_from_env(&self) -> Vec<String> {
        let mut configured = Vec::new();
        for name in self.available_services() {
            if self.store.credentials(&name).is_some() {
                continue;
            }
            let Some(credentials) = config::env_credentials(&name) else {
                continue;
            };
            if self.configure_service(&name, &credentials) {
                info!("configured {} from environment credentials", name);
                configured.push(name);
            }
        }
        configured
    }

    fn resolve(&self, service: Option<&str>) -> Option<(String, ServiceSlot)> {
        let name = match service {
            Some(name) => name.to_string(),
            None => self.active_service()?,
        };
        let slot = self.services.get(&name)?;
        if !slot_is_configured(slot) {
            return None;
        }
        Some((name, Arc::clone(slot)))
    }

    /// Sends through the override, or the active backend when no
    /// override is given. Resolution failure is reported in the
    /// result; the manager records nothing itself.
    pub fn send(&self, recipient: &str, body: &str, service: Option<&str>) -> SendResult {
        self.send_routed(recipient, body, service).1
    }

    /// Like [`Self::send`], additionally reporting the backend the
    /// attempt actually used. Resolution happens exactly once, so the
    /// name can never diverge from the backend that handled the send;
    /// `None` means the attempt never reached a provider.
    pub fn send_routed(
        &self,
        recipient: &str,
        body: &str,
        service: Option<&str>,
    ) -> (Option<String>, SendResult) {
        let Some((name, slot)) = self.resolve(service) else {
            warn!("no resolvable SMS service for send");
            return (None, SendResult::failure(NO_SERVICE_ERROR));
        };
        let Ok(backend) = slot.lock() else {
            return (None, SendResult::failure(NO_SERVICE_ERROR));
        };
        info!("sending SMS to {} via {}", recipient, name);
        let result = backend.send(recipient, body);
        (Some(name), result)
    }

    pub fn remaining_quota(&self, service: Option<&str>) -> i64 {
        let Some((_, slot)) = self.resolve(service) else {
            warn!("no resolvable SMS service for quota check");
            return 0;
        };
        let Ok(backend) = slot.lock() else {
            return 0;
        };
        backend.remaining_quota()
    }

    pub fn delivery_status(&self, message_id: &str, service: Option<&str>) -> StatusResult {
        let Some((_, slot)) = self.resolve(service) else {
            return StatusResult::unknown(NO_SERVICE_ERROR);
        };
        let Ok(backend) = slot.lock() else {
            return StatusResult::unknown(NO_SERVICE_ERROR);
        };
        backend.delivery_status(message_id)
    }
}

fn slot_is_configured(slot: &ServiceSlot) -> bool {
    slot.lock()
        .map(|service| service.is_configured())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tempfile::TempDir;

    use sms_services_module::DELIVERY_UNKNOWN;

    use super::*;

    struct FakeService {
        name: &'static str,
        configured: bool,
        accept_credentials: bool,
        sends: Arc<AtomicUsize>,
    }

    impl FakeService {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                configured: false,
                accept_credentials: true,
                sends: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn configured(name: &'static str) -> Self {
            Self {
                configured: true,
                ..Self::new(name)
            }
        }
    }

    impl SmsService for FakeService {
        fn name(&self) -> &str {
            self.name
        }

        fn is_configured(&self) -> bool {
            self.configured
        }

        fn daily_limit(&self) -> i64 {
            100
        }

        fn configure(&mut self, _credentials: &Credentials) -> bool {
            if self.accept_credentials {
                self.configured = true;
            }
            self.accept_credentials
        }

        fn validate_credentials(&self) -> bool {
            self.configured
        }

        fn send(&self, _recipient: &str, _body: &str) -> SendResult {
            self.sends.fetch_add(1, Ordering::SeqCst);
            SendResult::ok(format!("{}-msg", self.name), Default::default())
        }

        fn remaining_quota(&self) -> i64 {
            42
        }

        fn delivery_status(&self, _message_id: &str) -> StatusResult {
            StatusResult {
                status: DELIVERY_UNKNOWN.to_string(),
                error: None,
                details: Default::default(),
            }
        }
    }

    fn store() -> (TempDir, Arc<SqliteMessageStore>) {
        let dir = TempDir::new().unwrap();
        let store = SqliteMessageStore::new(dir.path().join("messages.db")).unwrap();
        (dir, Arc::new(store))
    }

    fn credentials() -> Credentials {
        let mut map = Credentials::new();
        map.insert("api_key".to_string(), "key".to_string());
        map
    }

    #[test]
    fn send_without_active_service_reports_no_provider() {
        let (_dir, store) = store();
        let manager =
            SmsServiceManager::with_services(store, vec![Box::new(FakeService::new("alpha"))]);

        let result = manager.send("+15550001111", "hello", None);
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some(NO_SERVICE_ERROR));
    }

    #[test]
    fn set_active_rejects_unknown_and_unconfigured_services() {
        let (_dir, store) = store();
        let manager = SmsServiceManager::with_services(
            store,
            vec![
                Box::new(FakeService::new("alpha")),
                Box::new(FakeService::new("beta")),
            ],
        );

        assert!(!manager.set_active("missing"));
        assert!(!manager.set_active("beta"));
        assert_eq!(manager.active_service(), None);

        assert!(manager.configure_service("beta", &credentials()));
        assert!(manager.set_active("beta"));
        assert_eq!(manager.active_service(), Some("beta".to_string()));

        // A failed switch keeps the previous selection.
        assert!(!manager.set_active("alpha"));
        assert_eq!(manager.active_service(), Some("beta".to_string()));
    }

    #[test]
    fn override_routes_past_the_active_service() {
        let (_dir, store) = store();
        let alpha = FakeService::configured("alpha");
        let beta = FakeService::configured("beta");
        let alpha_sends = Arc::clone(&alpha.sends);
        let beta_sends = Arc::clone(&beta.sends);
        let manager =
            SmsServiceManager::with_services(store, vec![Box::new(alpha), Box::new(beta)]);
        assert!(manager.store.save_credentials("alpha", &credentials()));
        assert!(manager.set_active("alpha"));

        let result = manager.send("+15550001111", "hello", Some("beta"));
        assert!(result.success);
        assert_eq!(result.message_id.as_deref(), Some("beta-msg"));
        assert_eq!(alpha_sends.load(Ordering::SeqCst), 0);
        assert_eq!(beta_sends.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_override_reports_no_provider() {
        let (_dir, store) = store();
        let manager = SmsServiceManager::with_services(
            store,
            vec![Box::new(FakeService::configured("alpha"))],
        );

        let result = manager.send("+15550001111", "hello", Some("missing"));
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some(NO_SERVICE_ERROR));
    }

    #[test]
    fn rejected_credentials_do_not_persist() {
        let (_dir, store) = store();
        let mut service = FakeService::new("alpha");
        service.accept_credentials = false;
        let manager = SmsServiceManager::with_services(Arc::clone(&store), vec![Box::new(service)]);

        assert!(!manager.configure_service("alpha", &credentials()));
        assert_eq!(store.credentials("alpha"), None);
        assert!(manager.configured_services().is_empty());
    }

    #[test]
    fn quota_and_status_resolve_like_send() {
        let (_dir, store) = store();
        let manager = SmsServiceManager::with_services(
            store,
            vec![Box::new(FakeService::configured("alpha"))],
        );

        // Nothing active and no override: sentinel results.
        assert_eq!(manager.remaining_quota(None), 0);
        let status = manager.delivery_status("id-1", None);
        assert_eq!(status.error.as_deref(), Some(NO_SERVICE_ERROR));

        assert_eq!(manager.remaining_quota(Some("alpha")), 42);
        let status = manager.delivery_status("id-1", Some("alpha"));
        assert_eq!(status.status, DELIVERY_UNKNOWN);
        assert_eq!(status.error, None);
    }

    #[test]
    fn send_routed_names_the_backend_it_used() {
        let (_dir, store) = store();
        let manager = SmsServiceManager::with_services(
            store,
            vec![
                Box::new(FakeService::configured("alpha")),
                Box::new(FakeService::configured("beta")),
            ],
        );

        let (name, result) = manager.send_routed("+15550001111", "hello", Some("beta"));
        assert_eq!(name.as_deref(), Some("beta"));
        assert_eq!(result.message_id.as_deref(), Some("beta-msg"));

        let (name, result) = manager.send_routed("+15550001111", "hello", Some("missing"));
        assert_eq!(name, None);
        assert!(!result.success);
    }

    #[test]
    fn env_credentials_seed_unconfigured_services() {
        let _lock = crate::config::test_env::ENV_MUTEX.lock().unwrap();
        let _key = crate::config::test_env::EnvGuard::set("TEXTBELT_API_KEY", "from-env");

        let (_dir, store) = store();
        let manager = SmsServiceManager::with_services(
            Arc::clone(&store),
            vec![Box::new(FakeService::new("textbelt"))],
        );

        assert_eq!(manager.configure_from_env(), vec!["textbelt".to_string()]);
        assert_eq!(store.credentials("textbelt").unwrap()["api_key"], "from-env");

        // The stored copy wins on the next bootstrap.
        assert!(manager.configure_from_env().is_empty());
    }

    #[test]
    fn configuration_survives_a_manager_restart() {
        let (_dir, store) = store();
        {
            let manager = SmsServiceManager::with_services(
                Arc::clone(&store),
                vec![Box::new(FakeService::new("alpha"))],
            );
            assert!(manager.configure_service("alpha", &credentials()));
            assert!(manager.set_active("alpha"));
        }

        let reborn = SmsServiceManager::with_services(
            Arc::clone(&store),
            vec![Box::new(FakeService::new("alpha"))],
        );
        assert_eq!(reborn.active_service(), Some("alpha".to_string()));
        assert_eq!(reborn.configured_services(), vec!["alpha".to_string()]);
        assert_eq!(reborn.remaining_quota(None), 42);
    }
}
