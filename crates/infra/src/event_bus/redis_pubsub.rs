//! Redis pub/sub transport for stock-changed events (optional).
//!
//! Each tenant publishes on its own channel, `<prefix>.<tenant_id>`.
//! Subscriptions pattern-match every tenant channel under the prefix.
//!
//! Note: Redis pub/sub is not durable (messages are dropped while no
//! subscriber is connected). That matches the fire-and-forget contract of
//! stock-changed publication.

use std::sync::mpsc;
use std::thread;

use redis::Commands;

use stockledger_core::TenantId;
use stockledger_events::{EventBus, Subscription, TenantScoped, tenant_channel};
use stockledger_inventory::StockChanged;

#[derive(Debug)]
pub enum RedisBusError {
    Redis(String),
    Serialize(String),
}

impl core::fmt::Display for RedisBusError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            RedisBusError::Redis(msg) => write!(f, "redis: {msg}"),
            RedisBusError::Serialize(msg) => write!(f, "serialize: {msg}"),
        }
    }
}

/// Redis pub/sub bus for JSON-encoded [`StockChanged`] events.
#[derive(Debug, Clone)]
pub struct RedisStockBus {
    client: redis::Client,
    prefix: String,
}

impl RedisStockBus {
    pub fn new(redis_url: impl AsRef<str>, prefix: impl Into<String>) -> Result<Self, RedisBusError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisBusError::Redis(e.to_string()))?;
        Ok(Self {
            client,
            prefix: prefix.into(),
        })
    }

    pub fn channel_for(&self, tenant_id: TenantId) -> String {
        tenant_channel(&self.prefix, tenant_id)
    }
}

impl EventBus<StockChanged> for RedisStockBus {
    type Error = RedisBusError;

    fn publish(&self, message: StockChanged) -> Result<(), Self::Error> {
        let payload = serde_json::to_string(&message)
            .map_err(|e| RedisBusError::Serialize(e.to_string()))?;

        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| RedisBusError::Redis(e.to_string()))?;

        let _: i64 = conn
            .publish(message.channel(&self.prefix), payload)
            .map_err(|e| RedisBusError::Redis(e.to_string()))?;

        Ok(())
    }

    fn subscribe(&self) -> Subscription<StockChanged> {
        let (tx, rx) = mpsc::channel();

        let client = self.client.clone();
        let pattern = format!("{}.*", self.prefix);

        // Forward pub/sub messages until the subscription is dropped.
        thread::spawn(move || {
            let mut conn = match client.get_connection() {
                Ok(c) => c,
                Err(_) => return,
            };

            let mut pubsub = conn.as_pubsub();
            if pubsub.psubscribe(pattern).is_err() {
                return;
            }

            loop {
                let msg = match pubsub.get_message() {
                    Ok(m) => m,
                    Err(_) => return,
                };

                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => continue,
                };

                let event: StockChanged = match serde_json::from_str(&payload) {
                    Ok(e) => e,
                    Err(_) => continue,
                };

                if tx.send(event).is_err() {
                    return;
                }
            }
        });

        Subscription::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channels_are_per_tenant() {
        let bus = RedisStockBus::new("redis://127.0.0.1/", "stock.changed").unwrap();
        let tenant = TenantId::new();
        assert_eq!(bus.channel_for(tenant), format!("stock.changed.{tenant}"));
    }
}
