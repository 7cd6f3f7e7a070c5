use crate::error::{FerryError, Result};
use crate::transfer::SubmitRequest;
use crate::FerryCore;
use async_trait::async_trait;
use ferry_types::TaskKey;

/// What the watcher does with each stable file, once per target host
#[async_trait]
pub trait SpoolStrategy: Send + Sync {
    async fn dispatch(&self, request: SubmitRequest) -> Result<TaskKey>;
}

/// Queues the transfer in storage for the commander
#[derive(Clone, Debug)]
pub struct SubmitStrategy {
    core: FerryCore,
}

impl SubmitStrategy {
    pub fn new(core: FerryCore) -> Self {
        Self { core }
    }
}

#[async_trait]
impl SpoolStrategy for SubmitStrategy {
    async fn dispatch(&self, request: SubmitRequest) -> Result<TaskKey> {
        let (runner, _) = self.core.submit(request).await?;
        Ok(runner.key())
    }
}

/// Runs the transfer right away and waits for its outcome
#[derive(Clone, Debug)]
pub struct DirectStrategy {
    core: FerryCore,
}

impl DirectStrategy {
    pub fn new(core: FerryCore) -> Self {
        Self { core }
    }
}

#[async_trait]
impl SpoolStrategy for DirectStrategy {
    async fn dispatch(&self, request: SubmitRequest) -> Result<TaskKey> {
        let result = self.core.direct_transfer(request).await?;
        if result.success {
            Ok(result.key)
        } else {
            Err(FerryError::TransferFailed {
                key: result.key,
                code: result.code,
            })
        }
    }
}
