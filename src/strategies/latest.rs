use serde_json::{Map, Value, json};
use std::collections::BTreeMap;

use crate::context::PipelineContext;
use crate::pipeline::Strategy;

/// Remembers the latest value of every call and channel, per service.
///
/// Publishes the service's table under the `latest` namespace:
///
/// ```json
/// { "ticker": { "value": [...], "received_at": "..." },
///   "balances": { "value": {...}, "received_at": "...", "error": "HTTP 500" } }
/// ```
///
/// A failed result keeps the previous value and records the error next
/// to it; the next successful result clears it.
#[derive(Debug, Default)]
pub struct Latest {
    services: BTreeMap<String, Map<String, Value>>,
}

impl Latest {
    pub const NAMESPACE: &'static str = "latest";

    /// Latest entry for `service` / `name`.
    pub fn get(&self, service: &str, name: &str) -> Option<&Value> {
        self.services.get(service)?.get(name)
    }
}

impl Strategy for Latest {
    fn name(&self) -> &str {
        Self::NAMESPACE
    }

    fn bind(&mut self, mut ctx: PipelineContext) -> PipelineContext {
        let result = ctx.result();
        let table = self.services.entry(result.service.clone()).or_default();

        match (result.value(), result.error()) {
            (Some(payload), _) => {
                table.insert(
                    result.name().to_string(),
                    json!({
                        "value": payload.to_json(),
                        "received_at": result.received_at.to_rfc3339(),
                    }),
                );
            }
            (None, Some(error)) => {
                let entry = table
                    .entry(result.name().to_string())
                    .or_insert_with(|| json!({ "value": null }));
                entry["error"] = Value::String(error.message.clone());
            }
            (None, None) => {}
        }

        let snapshot = Value::Object(table.clone());
        ctx.strategy_mut().set(Self::NAMESPACE, snapshot);
        ctx
    }
}
