//! Process-wide service state
//!
//! Everything mutable or shared lives in one context value constructed at
//! startup and passed to handlers and sweepers; there are no ambient
//! singletons.

use crate::config::Config;
use crate::engine::ContainerEngine;
use crate::ingress::Ingress;
use crate::registry::AppRegistry;
use crate::runner::{upstream_client, UpstreamClient};
use std::sync::Arc;

pub struct Context {
    pub config: Config,
    pub registry: AppRegistry,
    pub ingress: Ingress,
    pub engine: Arc<dyn ContainerEngine>,
    pub client: UpstreamClient,
}

pub type SharedContext = Arc<Context>;

impl Context {
    pub fn new(config: Config, engine: Arc<dyn ContainerEngine>) -> SharedContext {
        let ingress = if config.nginx {
            Ingress::nginx(config.addr.clone(), config.nginx_dir.clone())
        } else {
            Ingress::none(config.addr.clone())
        };
        Self::with_ingress(config, engine, ingress)
    }

    /// Used by tests to substitute an ingress with a scripted reload command
    pub fn with_ingress(
        config: Config,
        engine: Arc<dyn ContainerEngine>,
        ingress: Ingress,
    ) -> SharedContext {
        Arc::new(Self {
            config,
            registry: AppRegistry::new(),
            ingress,
            engine,
            client: upstream_client(),
        })
    }
}
