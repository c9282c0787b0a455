use log::info;

use crate::context::PipelineContext;
use crate::pipeline::Strategy;

/// Logs `ECHO!` for every message. Pass-through.
pub struct Echo;

impl Strategy for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    fn bind(&mut self, ctx: PipelineContext) -> PipelineContext {
        info!("ECHO!");
        ctx
    }
}
