use anyhow::{Context, Result};
use async_trait::async_trait;
use dialoguer::Confirm;
use toolflow_core::{ApprovalGate, ApprovalRequest};

/// Asks on the terminal. The prompt blocks, so it runs on the blocking pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleApproval;

#[async_trait]
impl ApprovalGate for ConsoleApproval {
    async fn decide(&self, request: &ApprovalRequest) -> Result<bool> {
        let prompt = match &request.step_id {
            Some(id) => format!("[{id}] {}", request.message),
            None => format!("[step {}] {}", request.index, request.message),
        };
        tokio::task::spawn_blocking(move || {
            Confirm::new()
                .with_prompt(prompt)
                .default(false)
                .interact()
                .map_err(anyhow::Error::from)
        })
        .await
        .context("approval prompt task failed")?
    }
}
