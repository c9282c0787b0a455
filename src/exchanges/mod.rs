//! Exchange facade registry
//!
//! This module provides:
//! - The `ExchangeFacade` / `StreamProtocol` abstractions
//! - Central registration of all supported services
//! - A lookup function resolving facades by configured name
//!
//! All exchange-specific logic lives in the facade modules. Adapters
//! interact exclusively through the `ExchangeFacade` trait.

pub mod facade;
pub mod socketcluster;
mod coinigy;
mod generic;

use std::sync::Arc;

use crate::context::ExchangeContext;
use crate::error::TransportError;

pub use coinigy::CoinigyFacade;
pub use facade::{ExchangeFacade, StreamEvent, StreamProtocol};
pub use generic::GenericFacade;

pub type FacadeConstructor =
    fn(Arc<ExchangeContext>) -> Result<Arc<dyn ExchangeFacade>, TransportError>;

/// Supported service names.
pub const SUPPORTED: &[&str] = &["coinigy", "generic"];

/// Constructor for a configured service name.
///
/// CONTRACT:
/// - `name` must match `api.services[].name` in config.json
/// - Names are lowercase and stable
/// - Unknown names return `None`; the caller reports and skips them
pub fn constructor(name: &str) -> Option<FacadeConstructor> {
    match name {
        "coinigy" => Some(build_coinigy as FacadeConstructor),
        "generic" => Some(build_generic as FacadeConstructor),
        _ => None,
    }
}

fn build_coinigy(ctx: Arc<ExchangeContext>) -> Result<Arc<dyn ExchangeFacade>, TransportError> {
    let facade: Arc<dyn ExchangeFacade> = Arc::new(CoinigyFacade::new(ctx)?);
    Ok(facade)
}

fn build_generic(ctx: Arc<ExchangeContext>) -> Result<Arc<dyn ExchangeFacade>, TransportError> {
    let facade: Arc<dyn ExchangeFacade> = Arc::new(GenericFacade::new(ctx)?);
    Ok(facade)
}

/// Builds the facade for a context, if its service is supported.
pub fn get_facade(
    ctx: Arc<ExchangeContext>,
) -> Option<Result<Arc<dyn ExchangeFacade>, TransportError>> {
    constructor(&ctx.name).map(|build| build(ctx))
}
