use log::{info, warn};
use serde_json::json;

use crate::context::PipelineContext;
use crate::pipeline::Strategy;

/// Logs the context of every message. Pass-through.
///
/// Failed results are logged at warn level with their error.
pub struct Print;

impl Strategy for Print {
    fn name(&self) -> &str {
        "print"
    }

    fn bind(&mut self, ctx: PipelineContext) -> PipelineContext {
        let result = ctx.result();
        match result.error() {
            Some(e) => warn!(
                "PrintStrategy: {}/{} failed ({:?}): {}",
                result.service,
                result.name(),
                e.kind,
                e.message
            ),
            None => info!(
                "PrintStrategy: {}",
                json!({
                    "result": result.to_json(),
                    "strategy": ctx.strategy().to_json(),
                })
            ),
        }
        ctx
    }
}
