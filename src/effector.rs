use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::definition::{ExitAction, NodeKind};

/// The side-effect channel a node dispatches through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectKind {
    Email,
    Sms,
    Push,
    TagAdd,
    TagRemove,
    PlanChange,
    Webhook,
}

/// Outcome reported by the effector gateway. `Success` means the effect is a
/// committed, externally visible fact; the engine never rolls it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectOutcome {
    Success,
    TransientFailure,
    PermanentFailure,
}

/// A single effect to perform, with an idempotency key so retried sends are
/// safe to repeat on the provider side.
#[derive(Debug, Clone, Serialize)]
pub struct EffectRequest {
    pub kind: EffectKind,
    pub entity_id: String,
    pub payload: Value,
    pub idempotency_key: String,
}

impl EffectRequest {
    /// Maps an effectful node to its gateway call. Returns `None` for
    /// control-flow nodes, which never dispatch.
    pub fn for_node(kind: &NodeKind, entity_id: &str, idempotency_key: String) -> Option<Self> {
        let (effect, payload) = match kind {
            NodeKind::Email { template, subject } => (
                EffectKind::Email,
                json!({ "template": template, "subject": subject }),
            ),
            NodeKind::Sms { template } => (EffectKind::Sms, json!({ "template": template })),
            NodeKind::Push { template, title } => (
                EffectKind::Push,
                json!({ "template": template, "title": title }),
            ),
            NodeKind::Tag { tag, remove } => {
                let effect = if *remove {
                    EffectKind::TagRemove
                } else {
                    EffectKind::TagAdd
                };
                (effect, json!({ "tag": tag }))
            }
            NodeKind::Plan { plan_id } => (EffectKind::PlanChange, json!({ "planId": plan_id })),
            NodeKind::Webhook { url, payload } => (
                EffectKind::Webhook,
                json!({ "url": url, "payload": payload }),
            ),
            _ => return None,
        };
        Some(Self {
            kind: effect,
            entity_id: entity_id.to_string(),
            payload,
            idempotency_key,
        })
    }

    pub fn for_exit_action(action: &ExitAction, entity_id: &str, idempotency_key: String) -> Self {
        let (kind, payload) = match action {
            ExitAction::Tag { tag } => (EffectKind::TagAdd, json!({ "tag": tag })),
            ExitAction::Email { template } => (EffectKind::Email, json!({ "template": template })),
            ExitAction::Webhook { url } => (EffectKind::Webhook, json!({ "url": url })),
        };
        Self {
            kind,
            entity_id: entity_id.to_string(),
            payload,
            idempotency_key,
        }
    }
}

/// External effector: actually sends the email/SMS/push, mutates tags and
/// plans, calls webhooks. Consumed, never owned; assumed safe under
/// concurrent calls from many executions.
#[async_trait]
pub trait EffectorGateway: Send + Sync {
    async fn send(&self, request: EffectRequest) -> EffectOutcome;
}

/// Gateway that accepts everything and does nothing. Useful for dry runs.
#[derive(Debug, Default, Clone)]
pub struct NullGateway;

#[async_trait]
impl EffectorGateway for NullGateway {
    async fn send(&self, _request: EffectRequest) -> EffectOutcome {
        EffectOutcome::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_to_effect_mapping() {
        let email = NodeKind::Email {
            template: "welcome".into(),
            subject: Some("Hola".into()),
        };
        let req = EffectRequest::for_node(&email, "client-1", "k1".into()).unwrap();
        assert_eq!(req.kind, EffectKind::Email);
        assert_eq!(req.payload["template"], "welcome");

        let remove = NodeKind::Tag {
            tag: "vip".into(),
            remove: true,
        };
        let req = EffectRequest::for_node(&remove, "client-1", "k2".into()).unwrap();
        assert_eq!(req.kind, EffectKind::TagRemove);

        let delay = NodeKind::Delay {
            delay: crate::definition::DelaySpec::new(1, crate::definition::DelayUnit::Days),
        };
        assert!(EffectRequest::for_node(&delay, "client-1", "k3".into()).is_none());
    }
}
