use std::future::Future;

use async_trait::async_trait;
use serde_json::Value;

use crate::broker::message::MessageOptions;

/// What a business handler returns; replaces the request's `data` and
/// `options` in the RESPONSE.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandlerReply {
    pub data: Value,
    pub options: MessageOptions,
}

impl HandlerReply {
    pub fn new(data: Value) -> Self {
        Self {
            data,
            options: MessageOptions::default(),
        }
    }
}

/// Business logic for requests routed to this client.
///
/// An `Err` is reported back to the caller as a `not_handled` ERROR carrying
/// the error's message.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, data: Value, options: MessageOptions) -> anyhow::Result<HandlerReply>;
}

/// Adapts an async closure into a [`RequestHandler`].
pub struct FnHandler<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Value, MessageOptions) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<HandlerReply>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> RequestHandler for FnHandler<F>
where
    F: Fn(Value, MessageOptions) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<HandlerReply>> + Send + 'static,
{
    async fn handle(&self, data: Value, options: MessageOptions) -> anyhow::Result<HandlerReply> {
        (self.0)(data, options).await
    }
}

/// Handler for links that only send, such as a broker's proxy connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHandler;

#[async_trait]
impl RequestHandler for NoHandler {
    async fn handle(&self, _data: Value, _options: MessageOptions) -> anyhow::Result<HandlerReply> {
        anyhow::bail!("this connection does not accept requests")
    }
}
