//! Service container wiring every component of the engine.
//!
//! All shared runtime state lives here and is passed explicitly; there is no
//! module-level mutable state anywhere in the crate.

use std::sync::Arc;

use tracing::info;

use crate::coord::CoordStore;
use crate::enqueue::EnqueueService;
use crate::governor::{ConcurrencyGovernor, GovernorConfig};
use crate::inference::{InferenceClient, InferenceConfig};
use crate::lock::LockManager;
use crate::media::MediaCodec;
use crate::pipeline::Orchestrator;
use crate::pipeline::stage::PipelineStage;
use crate::pipeline::stages::{
    AudioExtractStage, AudioUploadStage, ClipExtractStage, ClipUploadStage, DownloadStage,
    MomentGenerationStage, RefinementStage, TranscribeStage,
};
use crate::queue::RequestQueue;
use crate::registry::ModelRegistry;
use crate::status::StatusManager;
use crate::storage::{ObjectStore, Repositories};
use crate::tunnel::{TunnelConfig, TunnelManager};
use crate::Result;

/// Construction parameters for the container.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    pub redis_url: String,
    pub stream: String,
    pub group: String,
    pub lock_ttl_seconds: u64,
    pub transcription_model: String,
    pub governor: GovernorConfig,
    pub inference: InferenceConfig,
    pub tunnel: TunnelConfig,
}

/// Holds every service of the engine.
pub struct ServiceContainer {
    pub coord: CoordStore,
    pub status: StatusManager,
    pub locks: Arc<LockManager>,
    pub registry: Arc<ModelRegistry>,
    pub governor: Arc<ConcurrencyGovernor>,
    pub tunnels: Arc<TunnelManager>,
    pub inference: Arc<InferenceClient>,
    pub queue: RequestQueue,
    pub repositories: Repositories,
    pub object_store: Arc<dyn ObjectStore>,
    pub codec: Arc<dyn MediaCodec>,
    pub orchestrator: Arc<Orchestrator>,
    pub enqueue: EnqueueService,
}

impl ServiceContainer {
    /// Connect to the coordination store and wire all services.
    pub async fn new(
        config: ContainerConfig,
        repositories: Repositories,
        object_store: Arc<dyn ObjectStore>,
        codec: Arc<dyn MediaCodec>,
    ) -> Result<Arc<Self>> {
        info!("Initializing service container");
        let coord = CoordStore::connect(&config.redis_url).await?;
        Ok(Self::wire(config, coord, repositories, object_store, codec)?)
    }

    /// Wire services over an existing store (tests use the memory backend).
    pub fn wire(
        config: ContainerConfig,
        coord: CoordStore,
        repositories: Repositories,
        object_store: Arc<dyn ObjectStore>,
        codec: Arc<dyn MediaCodec>,
    ) -> Result<Arc<Self>> {
        let status = StatusManager::new(coord.clone());
        let locks = Arc::new(LockManager::with_ttl(coord.clone(), config.lock_ttl_seconds));
        let registry = Arc::new(ModelRegistry::new(coord.clone()));
        let governor = Arc::new(ConcurrencyGovernor::new(&config.governor));
        let tunnels = Arc::new(TunnelManager::with_config(
            registry.clone(),
            config.tunnel.clone(),
        ));
        let inference = Arc::new(InferenceClient::new(config.inference.clone())?);
        let queue = RequestQueue::new(coord.clone(), &config.stream, &config.group);
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(15))
            .build()?;

        let stages: Vec<Arc<dyn PipelineStage>> = vec![
            Arc::new(DownloadStage::new(
                http,
                codec.clone(),
                object_store.clone(),
                repositories.videos.clone(),
            )),
            Arc::new(AudioExtractStage::new(
                codec.clone(),
                object_store.clone(),
                repositories.videos.clone(),
            )),
            Arc::new(AudioUploadStage::new(object_store.clone())),
            Arc::new(TranscribeStage::new(
                tunnels.clone(),
                registry.clone(),
                inference.clone(),
                repositories.transcripts.clone(),
                config.transcription_model.clone(),
            )),
            Arc::new(MomentGenerationStage::new(
                tunnels.clone(),
                registry.clone(),
                inference.clone(),
                repositories.moments.clone(),
                repositories.prompts.clone(),
                repositories.generation_configs.clone(),
            )),
            Arc::new(ClipExtractStage::new(
                registry.clone(),
                codec.clone(),
                object_store.clone(),
                repositories.videos.clone(),
                governor.clone(),
            )),
            Arc::new(ClipUploadStage::new(
                registry.clone(),
                object_store.clone(),
                repositories.clips.clone(),
            )),
            Arc::new(RefinementStage::new(
                tunnels.clone(),
                registry.clone(),
                inference.clone(),
                repositories.moments.clone(),
            )),
        ];

        let orchestrator = Arc::new(Orchestrator::new(
            stages,
            status.clone(),
            locks.clone(),
            governor.clone(),
            coord.clone(),
            repositories.history.clone(),
        ));

        let enqueue = EnqueueService::new(
            coord.clone(),
            locks.clone(),
            status.clone(),
            registry.clone(),
            queue.clone(),
        );

        Ok(Arc::new(Self {
            coord,
            status,
            locks,
            registry,
            governor,
            tunnels,
            inference,
            queue,
            repositories,
            object_store,
            codec,
            orchestrator,
            enqueue,
        }))
    }
}
