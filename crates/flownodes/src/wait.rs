use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use flowcore::{Node, NodeContext, NodeError, NodeOutcome, NodeOutput, NodeSpec, WaitRequest};
use flowruntime::{NodeFactory, NodeMetadata};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

/// Waits shorter than this are slept inline instead of suspending the run
const INLINE_WAIT_LIMIT_MS: u64 = 65_000;

/// Suspends the run until it is resumed.
///
/// Parameters:
/// - `resume`: `webhook` (default) waits for an external call, `timeInterval`
///   waits for `amount_ms`
/// - `path`: correlation value of the resume key; defaults to the run id so
///   concurrent runs never collide
/// - `timeout_ms`: webhook waits give up after this long and continue with
///   the node's input
pub struct WaitNode;

#[async_trait]
impl Node for WaitNode {
    fn node_type(&self) -> &str {
        "flow.wait"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutcome, NodeError> {
        let resume = ctx.parameters.get_str(0, "resume").unwrap_or("webhook");
        match resume {
            "webhook" => {
                let correlation = ctx
                    .parameters
                    .get_str(0, "path")
                    .map(str::to_string)
                    .unwrap_or_else(|| ctx.run_id.to_string());
                let mut request = WaitRequest::new(correlation);
                if let Some(timeout_ms) = ctx.parameters.get_u64(0, "timeout_ms") {
                    request = request.expires_at(deadline("timeout_ms", timeout_ms)?);
                }
                ctx.events.info("Waiting for resume call");
                Ok(NodeOutcome::Wait(request))
            }
            "timeInterval" => {
                let amount_ms = ctx
                    .parameters
                    .get_u64(0, "amount_ms")
                    .ok_or_else(|| NodeError::invalid_parameter("amount_ms", "required for timeInterval"))?;
                if amount_ms < INLINE_WAIT_LIMIT_MS {
                    sleep(Duration::from_millis(amount_ms)).await;
                    return Ok(NodeOutput::main(ctx.main_input().clone()).into());
                }
                let resume_at = deadline("amount_ms", amount_ms)?;
                Ok(NodeOutcome::Wait(
                    WaitRequest::new(format!("timer/{}", ctx.run_id)).expires_at(resume_at),
                ))
            }
            other => Err(NodeError::invalid_parameter(
                "resume",
                format!("unknown resume mode '{}'", other),
            )),
        }
    }
}

/// Now plus `ms`, rejecting values chrono cannot represent
fn deadline(name: &str, ms: u64) -> Result<DateTime<Utc>, NodeError> {
    i64::try_from(ms)
        .ok()
        .and_then(TimeDelta::try_milliseconds)
        .and_then(|delta| Utc::now().checked_add_signed(delta))
        .ok_or_else(|| NodeError::invalid_parameter(name, format!("{}ms is out of range", ms)))
}

pub struct WaitNodeFactory;

impl NodeFactory for WaitNodeFactory {
    fn create(&self, _spec: &NodeSpec) -> Result<Arc<dyn Node>, NodeError> {
        Ok(Arc::new(WaitNode))
    }

    fn node_type(&self) -> &str {
        "flow.wait"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("Pause the run until resumed", "flow").once()
    }
}
