use anyhow::Result;

use super::Storage;
use crate::error::PipelineError;
use crate::worker::{Message, Reply, Role, Work};

/// Answers `Lookup` asks with the persisted row.
pub struct RowQueryWorker {
    role: Role,
    storage: Storage,
}

impl RowQueryWorker {
    pub const ROLE: &'static str = "row-query";

    pub fn new(storage: Storage) -> Self {
        Self {
            role: Role::new(Self::ROLE),
            storage,
        }
    }
}

impl Work for RowQueryWorker {
    async fn on_work(&self, message: Message) -> Result<Reply> {
        match message {
            Message::Lookup { key } => Ok(Reply::Row(self.storage.get(&key).await?)),
            other => Err(PipelineError::UnsupportedMessage {
                role: self.role.to_string(),
                message: other.label(),
            }
            .into()),
        }
    }
}
