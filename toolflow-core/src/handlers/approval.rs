use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApprovalRequest {
    pub index: usize,
    pub step_id: Option<String>,
    pub message: String,
}

/// External yes/no decision for `approval` steps.
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    /// `Ok(false)` rejects the step and aborts the flow.
    async fn decide(&self, request: &ApprovalRequest) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

#[async_trait]
impl ApprovalGate for AutoApprove {
    async fn decide(&self, request: &ApprovalRequest) -> Result<bool> {
        tracing::info!(index = request.index, message = %request.message, "auto-approved");
        Ok(true)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AutoReject;

#[async_trait]
impl ApprovalGate for AutoReject {
    async fn decide(&self, request: &ApprovalRequest) -> Result<bool> {
        tracing::info!(index = request.index, message = %request.message, "auto-rejected");
        Ok(false)
    }
}
