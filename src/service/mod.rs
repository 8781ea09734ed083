//! Service registry (spec.md §4.2): register handler objects, resolve
//! `"Service.Method"` against registered method descriptors.

pub mod method;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;

use method::{ErasedMethod, TypedMethod};

use crate::message::split_service_method;
use crate::Error;

/// One registered service: a receiver plus its exposed methods, keyed by
/// bare method name (the "Service" half of "Service.Method" is the
/// registry key under which this lives).
pub struct Service {
    type_name: String,
    methods: HashMap<String, Box<dyn ErasedMethod>>,
}

impl Service {
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn find_method(&self, name: &str) -> Option<&dyn ErasedMethod> {
        self.methods.get(name).map(|m| m.as_ref())
    }
}

/// Builds a [`Service`] one method at a time. `R` is the receiver type;
/// each call to [`ServiceBuilder::method`] is independently generic over
/// its own argument/reply types (spec.md §4.2a).
pub struct ServiceBuilder<R> {
    type_name: String,
    receiver: Arc<R>,
    methods: HashMap<String, Box<dyn ErasedMethod>>,
}

impl<R: Send + Sync + 'static> ServiceBuilder<R> {
    pub fn new(type_name: impl Into<String>, receiver: R) -> Self {
        ServiceBuilder {
            type_name: type_name.into(),
            receiver: Arc::new(receiver),
            methods: HashMap::new(),
        }
    }

    /// Registers one method. `handler` receives the shared receiver and a
    /// decoded argument value, and returns a reply value or an error
    /// message (spec.md §4.2a: a return value in place of Go's
    /// out-parameter `*reply` write).
    pub fn method<Req, Res, F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Res: Serialize + Send + 'static,
        F: Fn(Arc<R>, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Res, String>> + Send + 'static,
    {
        let method = TypedMethod::new(self.receiver.clone(), handler);
        self.methods.insert(name.into(), Box::new(method));
        self
    }

    pub fn build(self) -> Service {
        Service {
            type_name: self.type_name,
            methods: self.methods,
        }
    }
}

/// Process-wide (or per-[`crate::Server`]) mapping of service name to
/// [`Service`]. Registration is idempotent-by-failure: re-registering a
/// name that is already present fails and leaves the existing
/// registration untouched (spec.md §4.2, §8 invariant 6).
#[derive(Default)]
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, Arc<Service>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        ServiceRegistry::default()
    }

    pub fn register(&self, name: impl Into<String>, service: Service) -> Result<(), Error> {
        let name = name.into();
        let mut services = self.services.write().expect("service registry lock poisoned");
        if services.contains_key(&name) {
            return Err(Error::Resolution(format!("service already defined: {}", name)));
        }
        services.insert(name, Arc::new(service));
        Ok(())
    }

    /// Resolves `"Service.Method"` to its [`Service`] and bare method
    /// name. The caller looks the method up on the returned service —
    /// kept as two steps so a resolution failure can distinguish
    /// "unknown service" from "unknown method" per spec.md §4.2's error
    /// taxonomy.
    pub fn find(&self, service_method: &str) -> Result<(Arc<Service>, String), Error> {
        let (service_name, method_name) = split_service_method(service_method)?;
        let services = self.services.read().expect("service registry lock poisoned");
        let service = services
            .get(service_name)
            .ok_or_else(|| Error::Resolution(format!("can't find service {}", service_name)))?;
        if service.find_method(method_name).is_none() {
            return Err(Error::Resolution(format!(
                "can't find method {} on service {}",
                method_name, service_name
            )));
        }
        Ok((service.clone(), method_name.to_string()))
    }
}
