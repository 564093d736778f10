use anyhow::{Context, Result};
use async_nats::Client;
use futures::stream::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{CoachingTransport, OutboundMessage, TransportConfig};

/// Inbound frames buffered between the NATS subscriber and the session task
const INBOUND_CAPACITY: usize = 64;

/// Coaching transport over NATS subjects
pub struct NatsTransport {
    session_id: String,
    client: Option<Client>,
    outbound_subject: Option<String>,
    forward_task: Option<JoinHandle<()>>,
}

impl NatsTransport {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            client: None,
            outbound_subject: None,
            forward_task: None,
        }
    }

    fn subject(prefix: &str, session_id: &str, direction: &str) -> String {
        format!("{}.{}.{}", prefix, session_id, direction)
    }
}

#[async_trait::async_trait]
impl CoachingTransport for NatsTransport {
    async fn open(&mut self, config: &TransportConfig) -> Result<mpsc::Receiver<Vec<u8>>> {
        // Drop any previous connection from an earlier setup cycle
        self.close().await?;

        info!("Connecting to coaching service at {}", config.url);

        let client = async_nats::connect(config.url.as_str())
            .await
            .context("Failed to connect to NATS")?;

        let inbound_subject = Self::subject(&config.subject_prefix, &self.session_id, "in");
        let mut subscriber = client
            .subscribe(inbound_subject.clone())
            .await
            .context("Failed to subscribe to coaching replies")?;

        info!("Subscribed to {}", inbound_subject);

        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        let forward_task = tokio::spawn(async move {
            while let Some(msg) = subscriber.next().await {
                if tx.send(msg.payload.to_vec()).await.is_err() {
                    debug!("Inbound receiver dropped, stopping forwarder");
                    break;
                }
            }
            debug!("NATS subscription ended");
        });

        self.outbound_subject = Some(Self::subject(&config.subject_prefix, &self.session_id, "out"));
        self.client = Some(client);
        self.forward_task = Some(forward_task);

        Ok(rx)
    }

    async fn send(&mut self, message: &OutboundMessage) -> Result<()> {
        let (Some(client), Some(subject)) = (&self.client, &self.outbound_subject) else {
            anyhow::bail!("NATS transport is not open");
        };

        let payload = serde_json::to_vec(message)?;
        let bytes = payload.len();

        client
            .publish(subject.clone(), payload.into())
            .await
            .context("Failed to publish coaching message")?;

        debug!("Published {} to {} ({} bytes)", message.kind(), subject, bytes);

        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(task) = self.forward_task.take() {
            task.abort();
        }

        if let Some(client) = self.client.take() {
            info!("Closing NATS connection");
            if let Err(e) = client.flush().await {
                warn!("Failed to flush NATS connection: {}", e);
            }
        }

        self.outbound_subject = None;

        Ok(())
    }

    fn name(&self) -> &str {
        "nats"
    }
}
