//! Step handler seam: the registry mapping `{bot, rule_id}` to executable
//! logic. Handlers receive the step's merged input and return its output map.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;

use crate::error::FlowError;
use crate::types::KV;

/// Identity of the step being executed, for logging and correlation.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub job_id: String,
    pub node_id: String,
    pub bot: String,
    pub rule_id: String,
}

#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn call(&self, ctx: StepContext, input: KV) -> Result<KV, FlowError>;
}

type HandlerFuture = BoxFuture<'static, Result<KV, FlowError>>;

struct FnHandler<F>(F);

#[async_trait]
impl<F> StepHandler for FnHandler<F>
where
    F: Fn(StepContext, KV) -> HandlerFuture + Send + Sync,
{
    async fn call(&self, ctx: StepContext, input: KV) -> Result<KV, FlowError> {
        (self.0)(ctx, input).await
    }
}

/// Thread-safe registry keyed by `(bot, rule_id)`.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<(String, String), Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, bot: &str, rule_id: &str, handler: Arc<dyn StepHandler>) {
        self.handlers
            .insert((bot.to_string(), rule_id.to_string()), handler);
    }

    /// Register a closure without writing an impl by hand.
    pub fn register_fn<F, Fut>(&self, bot: &str, rule_id: &str, f: F)
    where
        F: Fn(StepContext, KV) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<KV, FlowError>> + Send + 'static,
    {
        let wrapped =
            move |ctx: StepContext, input: KV| -> HandlerFuture { Box::pin(f(ctx, input)) };
        self.register(bot, rule_id, Arc::new(FnHandler(wrapped)));
    }

    pub fn resolve(&self, bot: &str, rule_id: &str) -> Result<Arc<dyn StepHandler>, FlowError> {
        self.handlers
            .get(&(bot.to_string(), rule_id.to_string()))
            .map(|h| h.clone())
            .ok_or_else(|| FlowError::HandlerNotFound {
                bot: bot.to_string(),
                rule_id: rule_id.to_string(),
            })
    }
}
