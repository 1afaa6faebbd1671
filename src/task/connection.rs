//! The shared execution environment tasks are created against

use crate::config::StreamTaskConfig;
use crate::pipeline::RequestPipeline;
use crate::protocol::{InboundItem, OutboundItem};
use crate::queue::BucketQueue;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// The real (multiplexed) connection every per-stream task derives from.
///
/// Holds the configuration and the processing pipeline and stamps the
/// queues it creates with its id, so a task can verify its queues belong to
/// the environment it is created in.
#[derive(Clone)]
pub struct MasterConnection {
    id: Uuid,
    config: Arc<StreamTaskConfig>,
    pipeline: Arc<dyn RequestPipeline>,
}

impl MasterConnection {
    pub fn new(config: StreamTaskConfig, pipeline: Arc<dyn RequestPipeline>) -> Self {
        Self {
            id: Uuid::new_v4(),
            config: Arc::new(config),
            pipeline,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &StreamTaskConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &Arc<dyn RequestPipeline> {
        &self.pipeline
    }

    /// New inbound queue bound to this connection
    pub fn input_queue(&self) -> Arc<BucketQueue<InboundItem>> {
        Arc::new(BucketQueue::new(
            self.id,
            self.config.session.input_bound(),
        ))
    }

    /// New outbound queue bound to this connection
    pub fn output_queue(&self) -> Arc<BucketQueue<OutboundItem>> {
        Arc::new(BucketQueue::new(
            self.id,
            self.config.session.output_bound(),
        ))
    }
}

impl fmt::Debug for MasterConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterConnection")
            .field("id", &self.id)
            .field("pipeline", &self.pipeline.name())
            .finish()
    }
}
