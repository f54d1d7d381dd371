use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

use crate::protocol::WidgetState;

/// Comm traffic arriving from the kernel.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelCommEvent {
    Open {
        comm_id: String,
        target_name: String,
        state: WidgetState,
        buffers: Vec<Vec<u8>>,
    },
    Update {
        comm_id: String,
        state: WidgetState,
        buffers: Vec<Vec<u8>>,
    },
    Custom {
        comm_id: String,
        data: Value,
        buffers: Vec<Vec<u8>>,
    },
    Close {
        comm_id: String,
    },
}

/// Comm traffic the bridge forwards to the kernel.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelCommRequest {
    Update {
        comm_id: String,
        state: WidgetState,
        buffers: Vec<Vec<u8>>,
    },
    Custom {
        comm_id: String,
        data: Value,
        buffers: Vec<Vec<u8>>,
    },
    Close {
        comm_id: String,
    },
}

impl KernelCommRequest {
    pub fn comm_id(&self) -> &str {
        match self {
            Self::Update { comm_id, .. } | Self::Custom { comm_id, .. } | Self::Close { comm_id } => {
                comm_id
            }
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KernelCommError {
    #[error("kernel channel closed")]
    Disconnected,
}

pub trait KernelComm {
    fn send(&self, request: KernelCommRequest) -> Result<(), KernelCommError>;
}

impl KernelComm for UnboundedSender<KernelCommRequest> {
    fn send(&self, request: KernelCommRequest) -> Result<(), KernelCommError> {
        UnboundedSender::send(self, request).map_err(|_| KernelCommError::Disconnected)
    }
}
