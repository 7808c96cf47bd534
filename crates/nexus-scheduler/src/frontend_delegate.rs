//! Scheduler-side proxy for one frontend node

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

/// Scheduler-side state for one frontend node
#[derive(Debug, Clone)]
pub struct FrontendDelegate {
    node_id: u32,
    ip: String,
    server_port: u16,
    rpc_port: u16,
    beacon_interval: Duration,
    last_alive: Instant,
    subscribed: BTreeSet<String>,
}

impl FrontendDelegate {
    pub fn new(
        node_id: u32,
        ip: impl Into<String>,
        server_port: u16,
        rpc_port: u16,
        beacon_interval: Duration,
        now: Instant,
    ) -> Self {
        Self {
            node_id,
            ip: ip.into(),
            server_port,
            rpc_port,
            beacon_interval,
            last_alive: now,
            subscribed: BTreeSet::new(),
        }
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    pub fn server_port(&self) -> u16 {
        self.server_port
    }

    /// Address route updates are pushed to
    pub fn rpc_addr(&self) -> String {
        format!("{}:{}", self.ip, self.rpc_port)
    }

    /// Record a sign of life
    pub fn tick(&mut self, now: Instant) {
        self.last_alive = now;
    }

    pub fn last_alive(&self) -> Instant {
        self.last_alive
    }

    /// Alive while the last sign of life is younger than two beacons
    pub fn is_alive(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_alive) < self.beacon_interval * 2
    }

    /// Subscribe this frontend to a model session
    pub fn subscribe_model(&mut self, model_sess_id: impl Into<String>) {
        self.subscribed.insert(model_sess_id.into());
    }

    /// Session ids this frontend subscribes to
    pub fn subscribed_models(&self) -> &BTreeSet<String> {
        &self.subscribed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscriptions() {
        let mut frontend = FrontendDelegate::new(
            5,
            "127.0.0.1",
            9001,
            9002,
            Duration::from_secs(2),
            Instant::now(),
        );
        frontend.subscribe_model("tensorflow:resnet50:1:100");
        frontend.subscribe_model("tensorflow:resnet50:1:100");
        assert_eq!(frontend.subscribed_models().len(), 1);
        assert_eq!(frontend.rpc_addr(), "127.0.0.1:9002");
    }

    #[test]
    fn test_liveness_window() {
        let now = Instant::now();
        let frontend =
            FrontendDelegate::new(5, "127.0.0.1", 9001, 9002, Duration::from_secs(2), now);
        assert!(frontend.is_alive(now + Duration::from_secs(3)));
        assert!(!frontend.is_alive(now + Duration::from_secs(5)));
    }
}
