//! A single registered method, erased to a uniform body-in/body-out
//! shape so the dispatch loop never needs to know a handler's concrete
//! argument/reply types (spec.md §9 "Dynamic invocation").

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::OwnedBody;

/// Erased form of spec.md §4.2's `new_argv` / decode / `call` trio: given
/// the still-encoded request body, decode it into the method's argument
/// type, invoke the handler, and re-encode its reply — or fail with the
/// handler's error message.
#[async_trait]
pub trait ErasedMethod: Send + Sync {
    async fn call(&self, argv: OwnedBody) -> Result<OwnedBody, String>;
}

/// One registration produced by [`super::ServiceBuilder::method`]. `F` is
/// the single generic adapter spec.md's Design Notes (§9) call for,
/// parameterized per-registration on `Req`/`Res` rather than generated
/// per concrete handler type.
pub struct TypedMethod<R, Req, Res, F> {
    receiver: Arc<R>,
    handler: F,
    _types: PhantomData<fn(Req) -> Res>,
}

impl<R, Req, Res, F, Fut> TypedMethod<R, Req, Res, F>
where
    R: Send + Sync + 'static,
    Req: DeserializeOwned + Send + 'static,
    Res: Serialize + Send + 'static,
    F: Fn(Arc<R>, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Res, String>> + Send + 'static,
{
    pub fn new(receiver: Arc<R>, handler: F) -> Self {
        TypedMethod {
            receiver,
            handler,
            _types: PhantomData,
        }
    }
}

#[async_trait]
impl<R, Req, Res, F, Fut> ErasedMethod for TypedMethod<R, Req, Res, F>
where
    R: Send + Sync + 'static,
    Req: DeserializeOwned + Send + 'static,
    Res: Serialize + Send + 'static,
    F: Fn(Arc<R>, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Res, String>> + Send + 'static,
{
    async fn call(&self, argv: OwnedBody) -> Result<OwnedBody, String> {
        let req: Req = argv.decode().map_err(|e| e.to_string())?;
        let reply = (self.handler)(self.receiver.clone(), req).await?;
        OwnedBody::encode(&reply).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Foo;

    async fn sum(_foo: Arc<Foo>, args: (i64, i64)) -> Result<i64, String> {
        Ok(args.0 + args.1)
    }

    #[tokio::test]
    async fn typed_method_decodes_invokes_and_encodes() {
        let method = TypedMethod::new(Arc::new(Foo), sum);
        let argv = OwnedBody::encode(&(3i64, 4i64)).unwrap();
        let reply = method.call(argv).await.unwrap();
        let value: i64 = reply.decode().unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn typed_method_propagates_handler_error() {
        async fn fails(_r: Arc<Foo>, _args: ()) -> Result<(), String> {
            Err("boom".to_string())
        }
        let method = TypedMethod::new(Arc::new(Foo), fails);
        let argv = OwnedBody::encode(&()).unwrap();
        let err = method.call(argv).await.unwrap_err();
        assert_eq!(err, "boom");
    }
}
