//! Per-worker handles every operator is built from.

use std::sync::Arc;

use crate::config::CommConfig;
use crate::error::{CommError, Result};
use crate::plan::LogicalPlan;
use crate::transport::Channel;
use crate::types::WorkerId;

/// Configuration, placement and network channel of one worker.
///
/// Cloning is cheap; operators keep their own clone.
#[derive(Clone)]
pub struct CommContext {
    pub config: Arc<CommConfig>,
    pub plan: Arc<LogicalPlan>,
    pub channel: Arc<dyn Channel>,
}

impl CommContext {
    /// Validates `config` and checks the channel belongs to the plan's worker.
    pub fn new(config: CommConfig, plan: LogicalPlan, channel: Arc<dyn Channel>) -> Result<Self> {
        config.validate()?;
        if channel.worker() != plan.this_worker() {
            return Err(CommError::InvalidPlan(format!(
                "channel of worker {} used with plan of worker {}",
                channel.worker(),
                plan.this_worker()
            )));
        }
        Ok(Self {
            config: Arc::new(config),
            plan: Arc::new(plan),
            channel,
        })
    }

    pub fn worker(&self) -> WorkerId {
        self.plan.this_worker()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalNetwork;

    #[test]
    fn test_context_rejects_mismatched_channel() {
        let net = LocalNetwork::new(2);
        let plan = LogicalPlan::uniform(2, 1, 0).unwrap();
        assert!(CommContext::new(CommConfig::default(), plan.clone(), net.channel(1)).is_err());
        let ctx = CommContext::new(CommConfig::default(), plan, net.channel(0)).unwrap();
        assert_eq!(ctx.worker(), 0);
    }

    #[test]
    fn test_context_validates_config() {
        let net = LocalNetwork::new(1);
        let plan = LogicalPlan::uniform(1, 1, 0).unwrap();
        let config = CommConfig {
            buffer_size: 8,
            ..CommConfig::default()
        };
        assert!(CommContext::new(config, plan, net.channel(0)).is_err());
    }
}
