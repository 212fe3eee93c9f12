//! Plugins intercept requests before they reach the caching pipeline and
//! may register extra routes. PURGE is the one built in.

pub mod purge;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once, OnceLock};

use anyhow::{anyhow, Result};
use http::Response;

use crate::caching::processor::ClientRequest;
use crate::iobuf::ProxyBody;

pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        Ok(())
    }

    fn add_router(&self, _router: &mut Router) {}

    /// Return a response to short-circuit the request, `None` to pass it
    /// on. `remote` is the peer (or forwarded) address.
    fn handle_request(&self, req: &ClientRequest, remote: Option<&str>)
        -> Option<Response<ProxyBody>>;
}

type RouteHandler = fn(&ClientRequest) -> Response<ProxyBody>;

#[derive(Default)]
pub struct Router {
    routes: HashMap<String, RouteHandler>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, path: &str, handler: RouteHandler) {
        self.routes.insert(path.to_string(), handler);
    }

    pub fn dispatch(&self, req: &ClientRequest) -> Option<Response<ProxyBody>> {
        self.routes.get(req.uri.path()).map(|handler| handler(req))
    }
}

type PluginBuilder = fn(&crate::config::Plugin) -> Result<Arc<dyn Plugin>>;

fn registry() -> &'static Mutex<HashMap<String, PluginBuilder>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, PluginBuilder>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

pub fn register(name: &str, builder: PluginBuilder) {
    let mut reg = registry().lock().expect("plugin registry");
    reg.insert(name.to_string(), builder);
}

pub fn register_builtin() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        purge::register();
    });
}

pub fn create(cfg: &crate::config::Plugin) -> Result<Arc<dyn Plugin>> {
    register_builtin();
    let reg = registry().lock().expect("plugin registry");
    match reg.get(&cfg.name) {
        Some(builder) => builder(cfg),
        None => Err(anyhow!("unknown plugin {}", cfg.name)),
    }
}
