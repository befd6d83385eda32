//! Model attribution for assistant turns

use crate::usage::models::{Event, ModelRef};

/// Forward-scan state that tracks which model is serving a session.
///
/// Feed events in file order through [`observe`](Self::observe); each
/// assistant message yields the model it is attributed to.
#[derive(Debug, Clone, Default)]
pub struct ModelAttributionTracker {
    current: Option<ModelRef>,
    fallback: Option<ModelRef>,
}

impl ModelAttributionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracker that falls back to the agent's configured default model
    pub fn with_default(default_model: Option<&str>) -> Self {
        Self {
            current: None,
            fallback: default_model.and_then(ModelRef::parse),
        }
    }

    /// Most recent model announced by a change or snapshot event
    pub fn current(&self) -> Option<&ModelRef> {
        self.current.as_ref()
    }

    /// Update state with one event. Returns the attributed model when the
    /// event is an assistant message, `None` for everything else.
    pub fn observe(&mut self, event: &Event) -> Option<ModelRef> {
        match event {
            Event::ModelChange { provider, model_id, .. } => {
                self.current = Some(ModelRef::new(provider.as_str(), model_id.as_str()));
                None
            }
            Event::ModelSnapshot {
                provider: Some(provider),
                model_id: Some(model_id),
                ..
            } if !provider.is_empty() && !model_id.is_empty() => {
                self.current = Some(ModelRef::new(provider.as_str(), model_id.as_str()));
                None
            }
            Event::Message {
                provider, model, ..
            } if event.is_assistant_message() => Some(self.resolve(provider.as_deref(), model.as_deref())),
            _ => None,
        }
    }

    fn resolve(&self, provider: Option<&str>, model: Option<&str>) -> ModelRef {
        if let (Some(provider), Some(model)) = (provider, model) {
            return ModelRef::new(provider, model);
        }
        self.current
            .clone()
            .or_else(|| self.fallback.clone())
            .unwrap_or_else(ModelRef::unknown)
    }
}

/// Attribute every assistant turn of a session, in order
pub fn attribute_all<I>(events: I, default_model: Option<&str>) -> Vec<ModelRef>
where
    I: IntoIterator<Item = Event>,
{
    let mut tracker = ModelAttributionTracker::with_default(default_model);
    events
        .into_iter()
        .filter_map(|event| tracker.observe(&event))
        .collect()
}

/// The model last seen in a session: the latest change, snapshot or
/// explicitly tagged assistant message.
pub fn latest_model<I>(events: I) -> Option<ModelRef>
where
    I: IntoIterator<Item = Event>,
{
    let mut latest = None;
    for event in events {
        match event {
            Event::ModelChange { provider, model_id, .. } => {
                latest = Some(ModelRef::new(provider, model_id));
            }
            Event::ModelSnapshot {
                provider: Some(provider),
                model_id: Some(model_id),
                ..
            } => {
                latest = Some(ModelRef::new(provider, model_id));
            }
            Event::Message {
                provider: Some(provider),
                model: Some(model),
                ..
            } if !provider.is_empty() && !model.is_empty() => {
                latest = Some(ModelRef::new(provider, model));
            }
            _ => {}
        }
    }
    latest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::models::Role;

    fn assistant(provider: Option<&str>, model: Option<&str>) -> Event {
        Event::Message {
            role: Role::Assistant,
            content: String::new(),
            provider: provider.map(str::to_string),
            model: model.map(str::to_string),
            timestamp: None,
        }
    }

    fn change(provider: &str, model: &str) -> Event {
        Event::ModelChange {
            provider: provider.to_string(),
            model_id: model.to_string(),
            timestamp: None,
        }
    }

    #[test]
    fn test_model_change_applies_to_untagged_turn() {
        let events = vec![change("providerA", "modelX"), assistant(None, None)];
        assert_eq!(
            attribute_all(events, None),
            vec![ModelRef::new("providerA", "modelX")]
        );
    }

    #[test]
    fn test_explicit_fields_win_over_model_change() {
        let events = vec![
            change("providerA", "modelX"),
            assistant(Some("providerB"), Some("modelY")),
            assistant(None, None),
        ];
        assert_eq!(
            attribute_all(events, None),
            vec![
                ModelRef::new("providerB", "modelY"),
                ModelRef::new("providerA", "modelX"),
            ]
        );
    }

    #[test]
    fn test_default_then_unknown() {
        let events = vec![assistant(None, None)];
        assert_eq!(
            attribute_all(events.clone(), Some("openai/gpt-4")),
            vec![ModelRef::new("openai", "gpt-4")]
        );
        assert_eq!(attribute_all(events, None), vec![ModelRef::unknown()]);
    }

    #[test]
    fn test_partial_explicit_fields_fall_through() {
        let events = vec![change("a", "x"), assistant(Some("b"), None)];
        assert_eq!(attribute_all(events, None), vec![ModelRef::new("a", "x")]);
    }

    #[test]
    fn test_snapshot_updates_current_model() {
        let mut tracker = ModelAttributionTracker::new();
        tracker.observe(&Event::ModelSnapshot {
            provider: Some("anthropic".to_string()),
            model_id: Some("claude".to_string()),
            timestamp: None,
        });
        assert_eq!(tracker.current(), Some(&ModelRef::new("anthropic", "claude")));

        // Incomplete snapshot leaves state alone
        tracker.observe(&Event::ModelSnapshot {
            provider: None,
            model_id: Some("other".to_string()),
            timestamp: None,
        });
        assert_eq!(tracker.current(), Some(&ModelRef::new("anthropic", "claude")));
    }

    #[test]
    fn test_attribution_is_deterministic() {
        let events = vec![
            assistant(None, None),
            change("p", "m"),
            assistant(None, None),
            assistant(Some("q"), Some("n")),
        ];
        assert_eq!(
            attribute_all(events.clone(), Some("d/e")),
            attribute_all(events, Some("d/e"))
        );
    }

    #[test]
    fn test_latest_model() {
        let events = vec![
            change("a", "x"),
            assistant(Some("b"), Some("y")),
            assistant(None, None),
        ];
        assert_eq!(latest_model(events), Some(ModelRef::new("b", "y")));
        assert_eq!(latest_model(Vec::new()), None);
    }
}
