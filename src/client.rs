use crate::breaker::BreakerRegistry;
use crate::error::SyncError;
use crate::retry::{PolicySet, RetryExecutor};
use crate::service::{ServiceCall, ServiceRequest};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// A [`ServiceCall`] wrapped in a per-group breaker and a named retry policy.
///
/// Every network-bound request of the client goes through here.
#[derive(Clone)]
pub struct ResilientClient {
    service: Arc<dyn ServiceCall>,
    breakers: Arc<BreakerRegistry>,
    policies: Arc<PolicySet>,
    executor: RetryExecutor,
}

impl ResilientClient {
    pub fn new(
        service: Arc<dyn ServiceCall>,
        breakers: Arc<BreakerRegistry>,
        policies: Arc<PolicySet>,
        executor: RetryExecutor,
    ) -> Self {
        Self {
            service,
            breakers,
            policies,
            executor,
        }
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn policies(&self) -> &Arc<PolicySet> {
        &self.policies
    }

    /// Invoke `request` against service `group` under policy `policy_name`.
    pub async fn call(
        &self,
        group: &str,
        policy_name: &str,
        request: &ServiceRequest,
    ) -> Result<Value, SyncError> {
        let breaker = self.breakers.get(group);
        let policy = self.policies.get_or_default(policy_name);

        debug!(
            group = group,
            policy = %policy.name,
            operation = %request.operation,
            "Calling service"
        );

        self.executor
            .run_guarded(policy, &breaker, |_| self.service.invoke(request))
            .await
    }
}
