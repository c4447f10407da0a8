//! Event routing table.
//!
//! Bindings are collected from workflow and step declarations when a
//! definition is registered. Routing an event is a pure lookup: for each
//! binding of the event name (by priority, then declaration order) the
//! binding's route function resolves the target instance from the payload.
//!
//! ```text
//! "documents-uploaded" ──▶ [ (loan-application, -, h1), (kyc, verify, h2) ]
//!                                   │                         │
//!                        EventData ─┴── route fn ──▶ EventTrigger { key, resource, selector, h }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::definition::{handler, Handler};
use crate::error::{Result, WorkflowError};
use crate::model::DataMap;
use crate::runner::WorkflowContext;

/// Payload of an external event.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventData {
    #[serde(default)]
    pub resource_name: String,
    #[serde(default)]
    pub resource_id: String,
    /// Correlation token of the addressed step, for step-scoped handlers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_selector: Option<String>,
    #[serde(default)]
    pub data: DataMap,
}

impl EventData {
    pub fn new(resource_name: impl Into<String>, resource_id: impl Into<String>) -> Self {
        Self {
            resource_name: resource_name.into(),
            resource_id: resource_id.into(),
            ..Default::default()
        }
    }

    pub fn selector(mut self, selector: impl Into<String>) -> Self {
        self.step_selector = Some(selector.into());
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }
}

/// Instance addressed by an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    pub resource_name: String,
    pub resource_id: String,
    pub step_selector: Option<String>,
}

impl RouteTarget {
    fn from_event(data: &EventData) -> Self {
        Self {
            resource_name: data.resource_name.clone(),
            resource_id: data.resource_id.clone(),
            step_selector: data.step_selector.clone(),
        }
    }
}

/// Maps an event payload to its target instance. `None` skips the binding.
pub type RouteFn = Arc<dyn Fn(&EventData) -> Option<RouteTarget> + Send + Sync>;

/// Declared interest in an event, before it is attached to a workflow.
pub struct Subscription {
    event: String,
    priority: i32,
    route: Option<RouteFn>,
    handler: Handler,
}

impl Subscription {
    pub fn new<F>(event: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut WorkflowContext<'_>, &Value) -> Result<Vec<String>> + Send + Sync + 'static,
    {
        Self {
            event: event.into(),
            priority: 0,
            route: None,
            handler: handler(f),
        }
    }

    /// Lower values run first. Equal priorities keep declaration order.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn route<F>(mut self, f: F) -> Self
    where
        F: Fn(&EventData) -> Option<RouteTarget> + Send + Sync + 'static,
    {
        self.route = Some(Arc::new(f));
        self
    }

    pub(crate) fn bind(self, workflow_key: &str, step_key: Option<String>) -> EventBinding {
        EventBinding {
            event: self.event,
            workflow_key: workflow_key.to_string(),
            step_key,
            priority: self.priority,
            route: self.route,
            handler: self.handler,
        }
    }
}

/// A subscription attached to a workflow (and optionally a step).
#[derive(Clone)]
pub struct EventBinding {
    pub event: String,
    pub workflow_key: String,
    pub step_key: Option<String>,
    pub priority: i32,
    route: Option<RouteFn>,
    handler: Handler,
}

impl EventBinding {
    fn resolve(&self, data: &EventData) -> Option<Result<EventTrigger>> {
        let target = match &self.route {
            Some(route) => route(data)?,
            None => RouteTarget::from_event(data),
        };
        match (&self.step_key, &target.step_selector) {
            (Some(step_key), None) => {
                return Some(Err(WorkflowError::Execution(format!(
                    "Event [{}] is handled by step [{}] of workflow [{}] but carries no step selector",
                    self.event, step_key, self.workflow_key
                ))))
            }
            (None, Some(selector)) => {
                return Some(Err(WorkflowError::Execution(format!(
                    "Event [{}] is handled by workflow [{}] but addresses step selector [{}]",
                    self.event, self.workflow_key, selector
                ))))
            }
            _ => {}
        }
        Some(Ok(EventTrigger {
            event: self.event.clone(),
            workflow_key: self.workflow_key.clone(),
            step_key: self.step_key.clone(),
            resource_name: target.resource_name,
            resource_id: target.resource_id,
            step_selector: target.step_selector,
            data: data.data.clone(),
            handler: self.handler.clone(),
        }))
    }
}

impl fmt::Debug for EventBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBinding")
            .field("event", &self.event)
            .field("workflow_key", &self.workflow_key)
            .field("step_key", &self.step_key)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// A routed event, ready to be applied to one workflow instance.
#[derive(Clone)]
pub struct EventTrigger {
    pub event: String,
    pub workflow_key: String,
    pub step_key: Option<String>,
    pub resource_name: String,
    pub resource_id: String,
    pub step_selector: Option<String>,
    pub data: DataMap,
    pub(crate) handler: Handler,
}

impl fmt::Debug for EventTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventTrigger")
            .field("event", &self.event)
            .field("workflow_key", &self.workflow_key)
            .field("step_key", &self.step_key)
            .field("resource_name", &self.resource_name)
            .field("resource_id", &self.resource_id)
            .field("step_selector", &self.step_selector)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct EventRouter {
    routes: HashMap<String, Vec<EventBinding>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn connect(&mut self, binding: EventBinding) {
        let bindings = self.routes.entry(binding.event.clone()).or_default();
        tracing::debug!(
            event = %binding.event,
            workflow = %binding.workflow_key,
            step = ?binding.step_key,
            "Connected event handler"
        );
        bindings.push(binding);
        // Stable: equal priorities keep declaration order.
        bindings.sort_by_key(|b| b.priority);
        if bindings.len() > 1 {
            tracing::warn!(
                event = %bindings[0].event,
                handlers = bindings.len(),
                "Event has multiple handlers"
            );
        }
    }

    /// Lazily resolve the triggers for an event. Unknown events yield nothing.
    pub fn route<'a>(
        &'a self,
        event: &str,
        data: &'a EventData,
    ) -> impl Iterator<Item = Result<EventTrigger>> + 'a {
        self.routes
            .get(event)
            .into_iter()
            .flatten()
            .filter_map(move |binding| binding.resolve(data))
    }

    pub fn bindings(&self, event: &str) -> &[EventBinding] {
        self.routes.get(event).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn events(&self) -> Vec<&str> {
        let mut events: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        events.sort_unstable();
        events
    }

    pub fn clear(&mut self) {
        self.routes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> impl Fn(&mut WorkflowContext<'_>, &Value) -> Result<Vec<String>> + Send + Sync {
        |_: &mut WorkflowContext<'_>, _: &Value| Ok(vec![])
    }

    fn router_with(subs: Vec<(Subscription, &str, Option<&str>)>) -> EventRouter {
        let mut router = EventRouter::new();
        for (sub, wf, step) in subs {
            router.connect(sub.bind(wf, step.map(String::from)));
        }
        router
    }

    #[test]
    fn test_unknown_event_routes_to_nothing() {
        let router = router_with(vec![(Subscription::new("approved", noop()), "loan", None)]);
        let data = EventData::new("application", "A-1");
        assert_eq!(router.route("rejected", &data).count(), 0);
    }

    #[test]
    fn test_declaration_order_is_preserved() {
        let router = router_with(vec![
            (Subscription::new("uploaded", noop()), "loan", None),
            (Subscription::new("uploaded", noop()), "kyc", None),
            (Subscription::new("uploaded", noop()), "audit", None),
        ]);
        let data = EventData::new("application", "A-1");
        let keys: Vec<String> = router
            .route("uploaded", &data)
            .map(|t| t.unwrap().workflow_key)
            .collect();
        assert_eq!(keys, vec!["loan", "kyc", "audit"]);
    }

    #[test]
    fn test_priority_reorders_stably() {
        let router = router_with(vec![
            (Subscription::new("uploaded", noop()), "loan", None),
            (Subscription::new("uploaded", noop()).priority(-1), "kyc", None),
            (Subscription::new("uploaded", noop()), "audit", None),
        ]);
        let data = EventData::default();
        let keys: Vec<String> = router
            .route("uploaded", &data)
            .map(|t| t.unwrap().workflow_key)
            .collect();
        assert_eq!(keys, vec!["kyc", "loan", "audit"]);
    }

    #[test]
    fn test_step_binding_requires_selector() {
        let router = router_with(vec![(
            Subscription::new("signed", noop()),
            "loan",
            Some("signature"),
        )]);
        let data = EventData::new("application", "A-1");
        let results: Vec<_> = router.route("signed", &data).collect();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(WorkflowError::Execution(_))));

        let data = data.selector("sig-1");
        let trigger = router.route("signed", &data).next().unwrap().unwrap();
        assert_eq!(trigger.step_key.as_deref(), Some("signature"));
        assert_eq!(trigger.step_selector.as_deref(), Some("sig-1"));
    }

    #[test]
    fn test_workflow_binding_rejects_selector() {
        let router = router_with(vec![(Subscription::new("uploaded", noop()), "loan", None)]);
        let data = EventData::new("application", "A-1").selector("sig-1");
        let err = router.route("uploaded", &data).next().unwrap().unwrap_err();
        assert!(matches!(err, WorkflowError::Execution(_)));
        assert!(err.to_string().contains("step selector [sig-1]"), "{}", err);

        let plain = EventData::new("application", "A-1");
        assert!(router.route("uploaded", &plain).next().unwrap().is_ok());
    }

    #[test]
    fn test_route_fn_overrides_target_or_skips() {
        let sub = Subscription::new("paid", noop()).route(|data| {
            let invoice = data.data.get("invoice")?.as_str()?;
            Some(RouteTarget {
                resource_name: "invoice".into(),
                resource_id: invoice.to_string(),
                step_selector: None,
            })
        });
        let router = router_with(vec![(sub, "billing", None)]);

        let skipped = EventData::new("payment", "P-1");
        assert_eq!(router.route("paid", &skipped).count(), 0);

        let data = EventData::new("payment", "P-1").with("invoice", Value::from("INV-9"));
        let trigger = router.route("paid", &data).next().unwrap().unwrap();
        assert_eq!(trigger.resource_name, "invoice");
        assert_eq!(trigger.resource_id, "INV-9");
        assert_eq!(trigger.data.get("invoice"), Some(&Value::from("INV-9")));
    }
}
