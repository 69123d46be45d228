//! `AppState`: shared state injected into every Control API handler.
//! Grounded on `distribution/src/utils/state.rs`'s `AppState` (trait-object
//! collaborators behind `Arc`, plus an in-memory session map), adapted from
//! upload-session bookkeeping to the VMM/session-registry shape this
//! control plane needs.

use crate::config::Config;
use crate::cra::ContainerRuntime;
use crate::kvs::Kvs;
use crate::service::session::SessionRegistry;
use crate::service::vmm::Vmm;
use crate::storage::ArtefactStorage;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub vmm: Arc<Vmm>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub kvs: Arc<dyn Kvs>,
    pub storage: ArtefactStorage,
    pub config: Arc<Config>,
    pub sessions: SessionRegistry,
}

impl AppState {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        kvs: Arc<dyn Kvs>,
        config: Arc<Config>,
    ) -> Self {
        let storage = ArtefactStorage::new(&config.data_dir);
        let vmm = Arc::new(Vmm::new(
            runtime.clone(),
            kvs.clone(),
            storage.clone(),
            config.clone(),
        ));

        AppState {
            vmm,
            runtime,
            kvs,
            storage,
            config,
            sessions: SessionRegistry::new(),
        }
    }
}
