//! Transfer engine: endpoint selection and the background read loop.

pub mod endpoints;
pub mod reader;

use serde::Deserialize;

pub use endpoints::EndpointSet;
pub use reader::{InboundHandler, ReadExit, ReaderConfig, ReaderHandle, render_inbound};

/// Arguments of a caller-driven bulk or interrupt transfer.
///
/// Missing endpoint and timeout fall back to the per-kind defaults. For an IN
/// endpoint `data` only sizes the read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    pub endpoint: Option<u8>,
    pub data: Option<Vec<u8>>,
    pub timeout_ms: Option<u64>,
}

impl TransferRequest {
    pub fn out(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: Some(data.into()),
            ..Default::default()
        }
    }
}
