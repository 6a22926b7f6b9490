use rdkafka::ClientConfig;

use crate::kafka::types::StartOffsetPolicy;

/// Kafka consumer configuration builder for the checkpoint engine.
///
/// Offsets are never stored or committed by librdkafka on its own: the engine
/// commits explicitly after each flush, so `enable.auto.commit` and
/// `enable.auto.offset.store` are always off.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    pub fn new(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id);

        config
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "false")
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "45000")
            .set("heartbeat.interval.ms", "3000")
            .set("max.poll.interval.ms", "300000");

        Self { config }
    }

    /// Enable TLS/SSL for Kafka connection
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    /// Used by librdkafka when neither the checkpoint store nor the group
    /// holds an offset and no seek has happened yet
    pub fn with_offset_reset(mut self, policy: StartOffsetPolicy) -> Self {
        self.config.set("auto.offset.reset", policy.as_str());
        self
    }

    pub fn with_session_timeout_ms(mut self, ms: u32) -> Self {
        self.config.set("session.timeout.ms", ms.to_string());
        self
    }

    /// Should be ~1/3 of session.timeout.ms
    pub fn with_heartbeat_interval_ms(mut self, ms: u32) -> Self {
        self.config.set("heartbeat.interval.ms", ms.to_string());
        self
    }

    /// Upper bound between poll() calls before the member is evicted. Must
    /// exceed the worst-case dispatch time including delivery retries.
    pub fn with_max_poll_interval_ms(mut self, ms: u32) -> Self {
        self.config.set("max.poll.interval.ms", ms.to_string());
        self
    }

    /// Add any custom configuration
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}
