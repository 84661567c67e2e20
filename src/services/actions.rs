//! Action handlers and extensions
//!
//! Handlers are looked up by the action's `type` name, so new action kinds are
//! plugged in by registering a handler, not by extending an enum. Extensions
//! are named plug-ins that see every beacon event.

use crate::domain::beacon::Beacon;
use crate::domain::event::ActionEvent;
use crate::domain::trigger::Action;
use crate::domain::types::EventType;
use anyhow::{bail, Result};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Performs one kind of action
pub trait ActionHandler: Send + Sync {
    fn perform(&self, action: &Action, event: &ActionEvent) -> Result<()>;
}

/// Opens (here: validates and logs) the `url` payload entry
pub struct UrlHandler;

impl ActionHandler for UrlHandler {
    fn perform(&self, action: &Action, event: &ActionEvent) -> Result<()> {
        let Some(url) = action.url() else {
            bail!("action {} has no url", action.id);
        };
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            bail!("action {} has unsupported url '{url}'", action.id);
        }
        info!(action_id = %action.id, url = %url, entity = %event.entity, "action_url_opened");
        Ok(())
    }
}

/// Hands custom values to the host (logged)
pub struct CustomHandler;

impl ActionHandler for CustomHandler {
    fn perform(&self, action: &Action, event: &ActionEvent) -> Result<()> {
        info!(
            action_id = %action.id,
            name = %action.name,
            custom_values = action.custom_values.len(),
            payload_keys = action.payload.len(),
            entity = %event.entity,
            "action_custom_performed"
        );
        Ok(())
    }
}

/// What happened when an action was dispatched
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PerformOutcome {
    Performed,
    /// No handler registered for the action type
    Unhandled,
    /// The observer vetoed default handling
    Skipped,
    Failed(String),
}

/// Action type name -> handler
pub struct ActionRegistry {
    handlers: FxHashMap<String, Box<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn empty() -> Self {
        Self { handlers: FxHashMap::default() }
    }

    /// Registry with the built-in `url` and `custom` handlers
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("url", Box::new(UrlHandler));
        registry.register("custom", Box::new(CustomHandler));
        registry
    }

    pub fn register(&mut self, action_type: &str, handler: Box<dyn ActionHandler>) {
        if self.handlers.insert(action_type.to_string(), handler).is_some() {
            debug!(action_type = %action_type, "action_handler_replaced");
        }
    }

    pub fn has(&self, action_type: &str) -> bool {
        self.handlers.contains_key(action_type)
    }

    pub fn perform(&self, action: &Action, event: &ActionEvent) -> PerformOutcome {
        let Some(handler) = self.handlers.get(&action.action_type) else {
            warn!(action_id = %action.id, action_type = %action.action_type, "action_type_unhandled");
            return PerformOutcome::Unhandled;
        };
        match handler.perform(action, event) {
            Ok(()) => PerformOutcome::Performed,
            Err(e) => {
                warn!(action_id = %action.id, error = %e, "action_failed");
                PerformOutcome::Failed(e.to_string())
            }
        }
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Named plug-in receiving every beacon event
pub trait Extension: Send {
    fn name(&self) -> &str;
    fn on_event(&mut self, event_type: EventType, beacon: &Beacon);
}

/// Built-in extension that logs beacon events and keeps per-kind counts
#[derive(Default)]
pub struct EventLogExtension {
    counts: BTreeMap<&'static str, u64>,
}

impl EventLogExtension {
    pub fn count(&self, event_type: EventType) -> u64 {
        self.counts.get(event_type.as_str()).copied().unwrap_or(0)
    }
}

impl Extension for EventLogExtension {
    fn name(&self) -> &str {
        "event_log"
    }

    fn on_event(&mut self, event_type: EventType, beacon: &Beacon) {
        *self.counts.entry(event_type.as_str()).or_default() += 1;
        debug!(
            event = event_type.as_str(),
            beacon = %beacon.key,
            proximity = beacon.proximity.as_str(),
            "extension_event_logged"
        );
    }
}

type ExtensionFactory = Box<dyn Fn() -> Box<dyn Extension> + Send + Sync>;

/// Extension name -> factory
pub struct ExtensionRegistry {
    factories: BTreeMap<String, ExtensionFactory>,
}

impl ExtensionRegistry {
    pub fn empty() -> Self {
        Self { factories: BTreeMap::new() }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("event_log", || Box::new(EventLogExtension::default()));
        registry
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn Extension> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    /// Build the named extensions; unknown names are skipped
    pub fn instantiate(&self, names: &[String]) -> Vec<Box<dyn Extension>> {
        names
            .iter()
            .filter_map(|name| match self.factories.get(name) {
                Some(factory) => Some(factory()),
                None => {
                    warn!(extension = %name, "extension_unknown");
                    None
                }
            })
            .collect()
    }
}

impl Default for ExtensionRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::event::EntityRef;
    use crate::domain::types::{ActionId, BeaconKey};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;

    fn event() -> ActionEvent {
        ActionEvent::new(EventType::Enter, EntityRef::Beacon(BeaconKey::new("b1")), ActionId(1), 0)
    }

    #[test]
    fn test_url_handler_validates() {
        let registry = ActionRegistry::with_defaults();

        let ok = Action::new(1, "url").with_payload("url", json!("https://example.org/promo"));
        assert_eq!(registry.perform(&ok, &event()), PerformOutcome::Performed);

        let missing = Action::new(2, "url");
        assert!(matches!(registry.perform(&missing, &event()), PerformOutcome::Failed(_)));

        let bad = Action::new(3, "url").with_payload("url", json!("ftp://x"));
        assert!(matches!(registry.perform(&bad, &event()), PerformOutcome::Failed(_)));
    }

    #[test]
    fn test_unknown_type_is_unhandled() {
        let registry = ActionRegistry::with_defaults();
        assert!(registry.has("custom"));
        assert_eq!(registry.perform(&Action::new(1, "coupon"), &event()), PerformOutcome::Unhandled);
    }

    struct Counting(Arc<Mutex<u32>>);

    impl ActionHandler for Counting {
        fn perform(&self, _action: &Action, _event: &ActionEvent) -> Result<()> {
            *self.0.lock() += 1;
            Ok(())
        }
    }

    #[test]
    fn test_custom_registration() {
        let hits = Arc::new(Mutex::new(0));
        let mut registry = ActionRegistry::empty();
        registry.register("coupon", Box::new(Counting(hits.clone())));

        assert_eq!(registry.perform(&Action::new(1, "coupon"), &event()), PerformOutcome::Performed);
        assert_eq!(*hits.lock(), 1);
    }

    #[test]
    fn test_extension_instantiation() {
        let registry = ExtensionRegistry::with_defaults();
        let extensions = registry.instantiate(&["event_log".to_string(), "nope".to_string()]);

        assert_eq!(extensions.len(), 1);
        assert_eq!(extensions[0].name(), "event_log");
    }

    #[test]
    fn test_event_log_counts() {
        let mut ext = EventLogExtension::default();
        let beacon = Beacon::new(BeaconKey::new("b1"));
        ext.on_event(EventType::Enter, &beacon);
        ext.on_event(EventType::Enter, &beacon);

        assert_eq!(ext.count(EventType::Enter), 2);
        assert_eq!(ext.count(EventType::Leave), 0);
    }
}
