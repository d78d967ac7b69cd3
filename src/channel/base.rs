//! Named action table shared by providers and clients.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::error::{ChannelError, Result};
use crate::identity::Identity;

#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, payload: Value, sender: Identity) -> Result<Value>;
}

pub struct FnHandler<F> {
    func: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(Value, Identity) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F, Fut> ActionHandler for FnHandler<F>
where
    F: Fn(Value, Identity) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn handle(&self, payload: Value, sender: Identity) -> Result<Value> {
        (self.func)(payload, sender).await
    }
}

pub struct TypedHandler<Req, Resp, F> {
    func: F,
    _phantom: std::marker::PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp, F, Fut> TypedHandler<Req, Resp, F>
where
    Req: for<'de> Deserialize<'de> + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(Req, Identity) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp>> + Send + 'static,
{
    pub fn new(func: F) -> Self {
        Self {
            func,
            _phantom: std::marker::PhantomData,
        }
    }
}

#[async_trait]
impl<Req, Resp, F, Fut> ActionHandler for TypedHandler<Req, Resp, F>
where
    Req: for<'de> Deserialize<'de> + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(Req, Identity) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp>> + Send + 'static,
{
    async fn handle(&self, payload: Value, sender: Identity) -> Result<Value> {
        let request: Req = serde_json::from_value(payload)?;
        let response = (self.func)(request, sender).await?;
        Ok(serde_json::to_value(response)?)
    }
}

/// Fallback for actions with no registered handler; receives the action name.
#[async_trait]
pub trait DefaultActionHandler: Send + Sync {
    async fn handle(&self, action: String, payload: Value, sender: Identity) -> Result<Value>;
}

struct FnDefaultHandler<F> {
    func: F,
}

#[async_trait]
impl<F, Fut> DefaultActionHandler for FnDefaultHandler<F>
where
    F: Fn(String, Value, Identity) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn handle(&self, action: String, payload: Value, sender: Identity) -> Result<Value> {
        (self.func)(action, payload, sender).await
    }
}

/// Rewrites a payload before dispatch or a result after it.
pub type Middleware = Arc<dyn Fn(&str, Value, &Identity) -> Value + Send + Sync>;

/// Sees every failed action; may recover with a value or return an error.
pub type ErrorMiddleware = Arc<dyn Fn(&str, ChannelError, &Identity) -> Result<Value> + Send + Sync>;

#[derive(Default)]
pub struct ChannelBase {
    handlers: RwLock<HashMap<String, Arc<dyn ActionHandler>>>,
    default_action: RwLock<Option<Arc<dyn DefaultActionHandler>>>,
    before_action: RwLock<Option<Middleware>>,
    after_action: RwLock<Option<Middleware>>,
    error_middleware: RwLock<Option<ErrorMiddleware>>,
}

impl ChannelBase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `action`. Returns false if one was already
    /// registered, leaving it in place.
    pub fn register_handler(&self, action: impl Into<String>, handler: Arc<dyn ActionHandler>) -> bool {
        let mut handlers = self.handlers.write();
        let action = action.into();
        if handlers.contains_key(&action) {
            return false;
        }
        handlers.insert(action, handler);
        true
    }

    pub fn remove(&self, action: &str) -> bool {
        self.handlers.write().remove(action).is_some()
    }

    pub fn has_action(&self, action: &str) -> bool {
        self.handlers.read().contains_key(action)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn set_default_handler(&self, handler: Arc<dyn DefaultActionHandler>) {
        *self.default_action.write() = Some(handler);
    }

    pub fn set_before_action(&self, middleware: Middleware) {
        *self.before_action.write() = Some(middleware);
    }

    pub fn set_after_action(&self, middleware: Middleware) {
        *self.after_action.write() = Some(middleware);
    }

    pub fn set_error_middleware(&self, middleware: ErrorMiddleware) {
        *self.error_middleware.write() = Some(middleware);
    }

    /// Run `action` through before-middleware, its handler (or the default
    /// action), and after-middleware.
    pub async fn process_action(&self, action: &str, payload: Value, sender: Identity) -> Result<Value> {
        match self.run_action(action, payload, &sender).await {
            Ok(result) => Ok(result),
            Err(err) => {
                let middleware = self.error_middleware.read().clone();
                match middleware {
                    Some(middleware) => middleware(action, err, &sender),
                    None => Err(err),
                }
            }
        }
    }

    async fn run_action(&self, action: &str, payload: Value, sender: &Identity) -> Result<Value> {
        let before = self.before_action.read().clone();
        let payload = match before {
            Some(before) => before(action, payload, sender),
            None => payload,
        };

        let handler = self.handlers.read().get(action).cloned();
        let result = match handler {
            Some(handler) => handler.handle(payload, sender.clone()).await?,
            None => {
                let fallback = self.default_action.read().clone();
                match fallback {
                    Some(fallback) => {
                        fallback
                            .handle(action.to_string(), payload, sender.clone())
                            .await?
                    }
                    None => return Err(ChannelError::UnknownAction(action.to_string())),
                }
            }
        };

        let after = self.after_action.read().clone();
        Ok(match after {
            Some(after) => after(action, result, sender),
            None => result,
        })
    }
}

/// Action-table operations available on every channel endpoint.
pub trait ChannelActions {
    fn base(&self) -> &ChannelBase;

    /// Register an async handler for `action`.
    fn register<F, Fut>(&self, action: impl Into<String>, func: F) -> bool
    where
        F: Fn(Value, Identity) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.base()
            .register_handler(action, Arc::new(FnHandler::new(func)))
    }

    /// Register a handler whose payload and result are typed.
    fn register_typed<Req, Resp, F, Fut>(&self, action: impl Into<String>, func: F) -> bool
    where
        Req: for<'de> Deserialize<'de> + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req, Identity) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
    {
        self.base()
            .register_handler(action, Arc::new(TypedHandler::new(func)))
    }

    fn remove(&self, action: &str) -> bool {
        self.base().remove(action)
    }

    fn set_default_action<F, Fut>(&self, func: F)
    where
        F: Fn(String, Value, Identity) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.base()
            .set_default_handler(Arc::new(FnDefaultHandler { func }))
    }

    fn before_action<F>(&self, func: F)
    where
        F: Fn(&str, Value, &Identity) -> Value + Send + Sync + 'static,
    {
        self.base().set_before_action(Arc::new(func))
    }

    fn after_action<F>(&self, func: F)
    where
        F: Fn(&str, Value, &Identity) -> Value + Send + Sync + 'static,
    {
        self.base().set_after_action(Arc::new(func))
    }

    fn on_error<F>(&self, func: F)
    where
        F: Fn(&str, ChannelError, &Identity) -> Result<Value> + Send + Sync + 'static,
    {
        self.base().set_error_middleware(Arc::new(func))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Table(ChannelBase);

    impl ChannelActions for Table {
        fn base(&self) -> &ChannelBase {
            &self.0
        }
    }

    fn sender() -> Identity {
        Identity::new("client", "client")
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Quote {
        symbol: String,
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Price {
        symbol: String,
        bid: f64,
    }

    #[tokio::test]
    async fn test_registered_handler_sees_sender() {
        let table = Table(ChannelBase::new());
        assert!(table.register("whoami", |_payload, sender: Identity| async move {
            Ok(json!(sender.uuid))
        }));

        let result = table.0.process_action("whoami", Value::Null, sender()).await.unwrap();
        assert_eq!(result, json!("client"));
    }

    #[tokio::test]
    async fn test_duplicate_registration_keeps_first() {
        let table = Table(ChannelBase::new());
        assert!(table.register("a", |_, _| async { Ok(json!(1)) }));
        assert!(!table.register("a", |_, _| async { Ok(json!(2)) }));
        assert_eq!(table.0.handler_count(), 1);

        let result = table.0.process_action("a", Value::Null, sender()).await.unwrap();
        assert_eq!(result, json!(1));

        assert!(table.remove("a"));
        assert!(!table.0.has_action("a"));
    }

    #[tokio::test]
    async fn test_unknown_action() {
        let table = Table(ChannelBase::new());
        let err = table
            .0
            .process_action("missing", Value::Null, sender())
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::UnknownAction(ref a) if a == "missing"));
        assert_eq!(err.to_string(), "No action registered at target for missing");
    }

    #[tokio::test]
    async fn test_default_action_receives_name() {
        let table = Table(ChannelBase::new());
        table.set_default_action(|action, payload, _| async move {
            Ok(json!({ "action": action, "payload": payload }))
        });

        let result = table.0.process_action("anything", json!(3), sender()).await.unwrap();
        assert_eq!(result, json!({ "action": "anything", "payload": 3 }));
    }

    #[tokio::test]
    async fn test_typed_handler() {
        let table = Table(ChannelBase::new());
        table.register_typed("quote", |quote: Quote, _| async move {
            Ok(Price {
                symbol: quote.symbol,
                bid: 1.5,
            })
        });

        let result = table
            .0
            .process_action("quote", json!({ "symbol": "ACME" }), sender())
            .await
            .unwrap();
        assert_eq!(result, json!({ "symbol": "ACME", "bid": 1.5 }));

        let err = table
            .0
            .process_action("quote", json!(42), sender())
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Serialization(_)));
    }

    #[tokio::test]
    async fn test_middleware_order() {
        let table = Table(ChannelBase::new());
        table.register("double", |payload: Value, _| async move {
            Ok(json!(payload.as_i64().unwrap_or(0) * 2))
        });
        table.before_action(|_, payload, _| json!(payload.as_i64().unwrap_or(0) + 1));
        table.after_action(|action, result, _| json!({ "action": action, "result": result }));

        let result = table.0.process_action("double", json!(4), sender()).await.unwrap();
        assert_eq!(result, json!({ "action": "double", "result": 10 }));
    }

    #[tokio::test]
    async fn test_error_middleware_can_recover() {
        let table = Table(ChannelBase::new());
        table.register("fail", |_, _| async {
            Err(ChannelError::Handler("bad input".to_string()))
        });
        table.on_error(|action, err, _| {
            if action == "fail" {
                Ok(json!(format!("recovered: {err}")))
            } else {
                Err(err)
            }
        });

        let result = table.0.process_action("fail", Value::Null, sender()).await.unwrap();
        assert_eq!(result, json!("recovered: bad input"));

        let err = table
            .0
            .process_action("other", Value::Null, sender())
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::UnknownAction(_)));
    }
}
