//! Dispatch seam between the provisioning engine and connectors.

use async_trait::async_trait;
use idm_core::{OperationId, SystemId};

use crate::error::ConnectorResult;
use crate::object::ConnectorObject;
use crate::types::OperationType;

/// A fully resolved request for one target system.
///
/// Secrets inside `object` are plaintext guarded values at this point.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    /// Operation being executed.
    pub operation_id: OperationId,
    /// Target system.
    pub system_id: SystemId,
    /// Connector instance key configured on the system.
    pub connector_key: String,
    /// Requested change.
    pub operation_type: OperationType,
    /// Object to write.
    pub object: ConnectorObject,
}

/// Result of a successful dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// UID reported by the target, when it assigned or changed one.
    pub uid: Option<String>,
}

/// Sends provisioning requests to target systems.
///
/// Timeouts and cancellation are the implementation's responsibility: a call
/// either returns an outcome or an error.
#[async_trait]
pub trait ConnectorDispatcher: Send + Sync {
    /// Send one request.
    async fn send(&self, request: &DispatchRequest) -> ConnectorResult<DispatchOutcome>;
}
