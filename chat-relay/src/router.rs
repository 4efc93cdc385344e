use std::sync::Arc;

use tracing::debug;

use crate::{
    config::RoutingPolicy,
    message::{Delivery, Recipient},
    registry::{ConnectionHandle, Registry},
};

/// What happened to one routed message. Never reported back to the sender.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RouteOutcome {
    pub delivered: usize,
    pub failed: usize,
    pub unknown_recipient: bool,
}

#[derive(Debug, Clone)]
pub struct Router {
    registry: Arc<Registry>,
    policy: RoutingPolicy,
}

impl Router {
    pub fn new(registry: Arc<Registry>, policy: RoutingPolicy) -> Self {
        Self { registry, policy }
    }

    pub async fn route(&self, from: &str, to: &Recipient, payload: &str) -> RouteOutcome {
        let delivery = Delivery {
            from: from.to_string(),
            message: payload.to_string(),
        };

        match (self.policy, to) {
            (RoutingPolicy::Directed, Recipient::User(identity)) => {
                self.deliver_direct(identity, delivery).await
            }
            (RoutingPolicy::Directed, Recipient::Broadcast) | (RoutingPolicy::FanOut, _) => {
                self.deliver_to_others(from, delivery).await
            }
        }
    }

    async fn deliver_direct(&self, identity: &str, delivery: Delivery) -> RouteOutcome {
        let mut outcome = RouteOutcome::default();
        match self.registry.lookup(identity).await {
            Some(handle) if handle.is_open() => record(&mut outcome, identity, &handle, delivery),
            Some(_) => outcome.failed += 1,
            None => {
                debug!(to = identity, "dropping message for unknown recipient");
                outcome.unknown_recipient = true;
            }
        }
        outcome
    }

    async fn deliver_to_others(&self, from: &str, delivery: Delivery) -> RouteOutcome {
        let mut outcome = RouteOutcome::default();
        // The lock is released before any queue is touched.
        let targets = self.registry.snapshot_except(from).await;
        for (identity, handle) in targets {
            record(&mut outcome, &identity, &handle, delivery.clone());
        }
        outcome
    }
}

fn record(
    outcome: &mut RouteOutcome,
    identity: &str,
    handle: &ConnectionHandle,
    delivery: Delivery,
) {
    match handle.try_deliver(delivery) {
        Ok(()) => outcome.delivered += 1,
        Err(error) => {
            debug!(to = identity, conn_id = %handle.id(), %error, "delivery failed");
            outcome.failed += 1;
        }
    }
}
