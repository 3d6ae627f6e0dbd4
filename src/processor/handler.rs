//! Glue between a dequeued `(address, event)` pair and the order
//! aggregator / position cache.

use super::queue::EventHandler;
use crate::aggregator::OrderAggregator;
use crate::caches::position::PositionCache;
use crate::schema::{Address, SubscriptionEvent};
use async_trait::async_trait;
use std::sync::Arc;

pub struct PipelineHandler {
    aggregator: Arc<OrderAggregator>,
    position_cache: Arc<PositionCache>,
}

impl PipelineHandler {
    pub fn new(aggregator: Arc<OrderAggregator>, position_cache: Arc<PositionCache>) -> Self {
        Self {
            aggregator,
            position_cache,
        }
    }
}

#[async_trait]
impl EventHandler for PipelineHandler {
    async fn handle(&self, _address: Address, event: SubscriptionEvent) {
        match event {
            SubscriptionEvent::Fills(fills) => {
                for fill in fills {
                    self.aggregator.handle_fill(fill).await;
                }
            }
            SubscriptionEvent::OrderStatuses(statuses) => {
                for status in statuses {
                    self.aggregator.handle_status(status).await;
                }
            }
            SubscriptionEvent::Position(snapshot) => {
                self.position_cache.update(snapshot);
            }
            SubscriptionEvent::Control => {}
        }
    }
}
