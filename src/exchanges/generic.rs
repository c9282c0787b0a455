use async_trait::async_trait;
use std::sync::Arc;

use crate::context::ExchangeContext;
use crate::error::TransportError;
use crate::transport::rest::{RestAuth, RestClient};

use super::facade::ExchangeFacade;

/// Plain REST proxy.
///
/// Every call name is POSTed to the endpoint of the same name with
/// `apiKey` / `secret` form fields. No streaming.
pub struct GenericFacade {
    ctx: Arc<ExchangeContext>,
    rest: Option<RestClient>,
}

impl GenericFacade {
    pub fn new(ctx: Arc<ExchangeContext>) -> Result<Self, TransportError> {
        let rest = match &ctx.endpoints.rest {
            Some(url) => Some(RestClient::new(
                url,
                RestAuth {
                    headers: Vec::new(),
                    fields: vec![
                        ("apiKey".into(), ctx.credentials.api_key.clone()),
                        ("secret".into(), ctx.credentials.secret.clone()),
                    ],
                },
            )?),
            None => None,
        };
        Ok(Self { ctx, rest })
    }
}

#[async_trait]
impl ExchangeFacade for GenericFacade {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn context(&self) -> &Arc<ExchangeContext> {
        &self.ctx
    }

    fn rest(&self) -> Option<&RestClient> {
        self.rest.as_ref()
    }
}
