use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{Offset as KafkaOffset, TopicPartitionList};
use tracing::{info, warn};

use crate::event::EventDecoder;
use crate::metrics_consts::EVENTS_SKIPPED;
use crate::position::{Offset, StreamPosition};
use crate::source::{Polled, SourceError, StartingOffsetPolicy, StreamSource};

#[derive(Debug, Clone)]
pub struct KafkaSourceConfig {
    pub hosts: String,
    pub topic: String,
    pub consumer_group: String,
    pub tls: bool,
    pub metadata_timeout: Duration,
}

/// Reads change events from every partition of a single topic.
///
/// Partitions are assigned manually and offsets are never committed to the
/// broker: the controller's checkpoint is the only record of progress.
pub struct KafkaStreamSource {
    consumer: StreamConsumer,
    config: KafkaSourceConfig,
    decoder: EventDecoder,
    started: bool,
}

impl KafkaStreamSource {
    pub fn new(config: KafkaSourceConfig, decoder: EventDecoder) -> Result<Self, SourceError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.hosts)
            .set("group.id", &config.consumer_group)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", "earliest");

        if config.tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }

        let consumer: StreamConsumer = client_config.create()?;

        Ok(Self {
            consumer,
            config,
            decoder,
            started: false,
        })
    }

    fn partition_ids(&self) -> Result<Vec<i32>, SourceError> {
        let metadata = self
            .consumer
            .fetch_metadata(Some(&self.config.topic), self.config.metadata_timeout)?;

        let partitions: Vec<i32> = metadata
            .topics()
            .iter()
            .filter(|t| t.name() == self.config.topic)
            .flat_map(|t| t.partitions().iter().map(|p| p.id()))
            .collect();

        if partitions.is_empty() {
            return Err(SourceError::UnknownTopic(self.config.topic.clone()));
        }
        Ok(partitions)
    }
}

#[async_trait]
impl StreamSource for KafkaStreamSource {
    async fn start(
        &mut self,
        policy: StartingOffsetPolicy,
        checkpoint: Option<&StreamPosition>,
    ) -> Result<(), SourceError> {
        if policy == StartingOffsetPolicy::FromCheckpoint && checkpoint.is_none() {
            return Err(SourceError::MissingCheckpoint);
        }

        let mut assignment = TopicPartitionList::new();
        for partition in self.partition_ids()? {
            let offset = match checkpoint.and_then(|c| c.get(partition)) {
                Some(next) => KafkaOffset::Offset(next),
                None if policy == StartingOffsetPolicy::Latest => KafkaOffset::End,
                None => KafkaOffset::Beginning,
            };
            assignment.add_partition_offset(&self.config.topic, partition, offset)?;
        }

        info!(
            topic = %self.config.topic,
            partitions = assignment.count(),
            %policy,
            "assigning stream partitions"
        );
        self.consumer.assign(&assignment)?;
        self.started = true;
        Ok(())
    }

    async fn rewind(&mut self, position: &StreamPosition) -> Result<(), SourceError> {
        info!(topic = %self.config.topic, %position, "rewinding stream partitions");
        for (partition, next) in position.partitions() {
            self.consumer.seek(
                &self.config.topic,
                partition,
                KafkaOffset::Offset(next),
                self.config.metadata_timeout,
            )?;
        }
        Ok(())
    }

    async fn poll(&mut self, max_wait: Duration) -> Result<Polled, SourceError> {
        if !self.started {
            return Err(SourceError::NotStarted);
        }

        let message = match tokio::time::timeout(max_wait, self.consumer.recv()).await {
            Err(_elapsed) => return Ok(Polled::Idle),
            Ok(result) => result?,
        };

        let offset = Offset::new(message.partition(), message.offset());
        let Some(payload) = message.payload() else {
            warn!(%offset, "skipping change event without payload");
            metrics::counter!(EVENTS_SKIPPED, "reason" => "empty_payload").increment(1);
            return Ok(Polled::Skipped(offset));
        };

        match self.decoder.decode(payload, offset) {
            Ok(event) => Ok(Polled::Event(event)),
            Err(e) => {
                warn!(%offset, error = %e, "skipping undecodable change event");
                metrics::counter!(EVENTS_SKIPPED, "reason" => "parse_error").increment(1);
                Ok(Polled::Skipped(offset))
            }
        }
    }
}
