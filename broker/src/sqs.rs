//! SQS rendezvous transport (component H).
//!
//! Clients without direct network access to the broker long-poll a
//! per-client SQS queue instead of speaking HTTP. This module owns the
//! inbound poll loop (reading offers off the broker's shared request
//! queue), per-client outbound queue creation, and a reaper that deletes
//! stale client queues nobody ever collected.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use aws_sdk_sqs::Client as SqsClient;
use tokio::sync::watch;

use crate::engine::proxy::NatType;
use crate::engine::ClientOfferRequest;
use crate::metrics::Transport;
use crate::AppState;

/// Prefix for the per-client outbound queues this transport creates.
const CLIENT_QUEUE_PREFIX: &str = "snowflake-client-";

/// Queues older than this with no poll activity are reclaimed by the
/// reaper.
const STALE_QUEUE_AGE: Duration = Duration::from_secs(120);
const REAPER_INTERVAL: Duration = Duration::from_secs(30);

#[derive(serde::Deserialize)]
struct InboundMessage {
    #[serde(rename = "ClientID")]
    client_id: Option<String>,
    offer: String,
    nat: Option<String>,
    fingerprint: Option<String>,
}

pub struct SqsTransport {
    client: SqsClient,
    broker_queue_url: String,
    state: AppState,
    wait_time: Duration,
}

impl SqsTransport {
    pub async fn connect(
        queue_name: &str,
        region: Option<String>,
        state: AppState,
        wait_time: Duration,
    ) -> anyhow::Result<Self> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region));
        }
        let shared_config = loader.load().await;
        let client = SqsClient::new(&shared_config);

        let broker_queue_url = client
            .get_queue_url()
            .queue_name(queue_name)
            .send()
            .await?
            .queue_url
            .ok_or_else(|| anyhow::anyhow!("SQS queue {queue_name} has no URL"))?;

        Ok(Self {
            client,
            broker_queue_url,
            state,
            wait_time,
        })
    }

    /// Runs the inbound long-poll loop until `shutdown` fires.
    pub async fn run_inbound(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }

            let recv = self
                .client
                .receive_message()
                .queue_url(&self.broker_queue_url)
                .wait_time_seconds(self.wait_time.as_secs() as i32)
                .max_number_of_messages(10)
                .send();

            tokio::select! {
                result = recv => {
                    match result {
                        Ok(output) => self.handle_batch(output.messages.unwrap_or_default()).await,
                        Err(err) => log::warn!("sqs receive_message failed: {err}"),
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    async fn handle_batch(&self, messages: Vec<aws_sdk_sqs::types::Message>) {
        for message in messages {
            let Some(receipt) = message.receipt_handle.clone() else {
                continue;
            };

            if let Some(body) = &message.body {
                self.handle_message(body).await;
            }

            if let Err(err) = self
                .client
                .delete_message()
                .queue_url(&self.broker_queue_url)
                .receipt_handle(receipt)
                .send()
                .await
            {
                log::warn!("sqs delete_message failed: {err}");
            }
        }
    }

    async fn handle_message(&self, body: &str) {
        let parsed: Result<InboundMessage, _> = serde_json::from_str(body);
        let Ok(msg) = parsed else {
            log::warn!("dropping malformed sqs message");
            return;
        };

        let Some(client_id) = msg.client_id else {
            log::warn!("dropping sqs message with no ClientID");
            return;
        };

        let cc = "??".to_string();
        self.state.metrics.record_client_request(Transport::Sqs, &cc);

        let fingerprint = match msg.fingerprint.as_deref() {
            None | Some("") => Vec::new(),
            Some(hex_str) => match hex::decode(hex_str) {
                Ok(bytes) => bytes,
                Err(_) => {
                    log::warn!("dropping sqs message with invalid fingerprint for client {client_id}");
                    return;
                }
            },
        };
        let nat_type = msg.nat.as_deref().map_or(NatType::Unknown, NatType::parse);

        let outbound_url = match self.ensure_client_queue(&client_id).await {
            Ok(url) => url,
            Err(err) => {
                log::warn!("failed to provision outbound queue for client {client_id}: {err}");
                return;
            }
        };

        let state = self.state.clone();
        let client = self.client.clone();
        tokio::spawn(async move {
            let result = state
                .engine
                .client_offers(ClientOfferRequest {
                    sdp: msg.offer,
                    nat_type,
                    fingerprint,
                })
                .await;

            let payload = match result {
                Ok(answer) => serde_json::json!({ "answer": answer }),
                Err(err) => serde_json::json!({ "error": err.to_string() }),
            };

            if let Err(err) = client
                .send_message()
                .queue_url(&outbound_url)
                .message_body(payload.to_string())
                .send()
                .await
            {
                log::warn!("failed to publish answer for client {client_id}: {err}");
            }
        });
    }

    /// Idempotently creates (or looks up) the outbound queue for a
    /// client, naming it deterministically so repeat requests reuse it.
    async fn ensure_client_queue(&self, client_id: &str) -> anyhow::Result<String> {
        let queue_name = format!("{CLIENT_QUEUE_PREFIX}{client_id}");

        if let Ok(existing) = self
            .client
            .get_queue_url()
            .queue_name(&queue_name)
            .send()
            .await
        {
            if let Some(url) = existing.queue_url {
                return Ok(url);
            }
        }

        let created = self
            .client
            .create_queue()
            .queue_name(&queue_name)
            .send()
            .await?;

        created
            .queue_url
            .ok_or_else(|| anyhow::anyhow!("create_queue for {queue_name} returned no URL"))
    }

    /// Periodically deletes client queues with no recent poll activity,
    /// so an abandoned snowflake client doesn't leak a queue forever.
    pub async fn run_reaper(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(REAPER_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.reap_once().await,
                _ = shutdown.changed() => return,
            }
        }
    }

    async fn reap_once(&self) {
        let queues = match self
            .client
            .list_queues()
            .queue_name_prefix(CLIENT_QUEUE_PREFIX)
            .send()
            .await
        {
            Ok(out) => out.queue_urls.unwrap_or_default(),
            Err(err) => {
                log::warn!("sqs list_queues failed: {err}");
                return;
            }
        };

        let mut reaped = HashSet::new();
        for url in queues {
            if self.queue_is_stale(&url).await {
                if let Err(err) = self.client.delete_queue().queue_url(&url).send().await {
                    log::warn!("failed to delete stale queue {url}: {err}");
                } else {
                    reaped.insert(url);
                }
            }
        }

        if !reaped.is_empty() {
            log::info!("reaped {} stale client queues", reaped.len());
        }
    }

    async fn queue_is_stale(&self, queue_url: &str) -> bool {
        use aws_sdk_sqs::types::QueueAttributeName;

        let Ok(attrs) = self
            .client
            .get_queue_attributes()
            .queue_url(queue_url)
            .attribute_names(QueueAttributeName::CreatedTimestamp)
            .attribute_names(QueueAttributeName::LastModifiedTimestamp)
            .send()
            .await
        else {
            return false;
        };

        let Some(map) = attrs.attributes else {
            return false;
        };

        let modified = map
            .get(&QueueAttributeName::LastModifiedTimestamp)
            .and_then(|v| v.parse::<i64>().ok());

        let Some(modified) = modified else {
            return false;
        };

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        now - modified > STALE_QUEUE_AGE.as_secs() as i64
    }
}

/// Spawns the inbound poll loop and the reaper loop, returning their
/// join handles so `main` can await clean shutdown.
pub fn spawn(transport: Arc<SqsTransport>, shutdown: watch::Receiver<bool>) -> Vec<tokio::task::JoinHandle<()>> {
    let inbound_transport = transport.clone();
    let inbound_shutdown = shutdown.clone();
    let inbound = tokio::spawn(async move { inbound_transport.run_inbound(inbound_shutdown).await });

    let reaper_transport = transport;
    let reaper = tokio::spawn(async move { reaper_transport.run_reaper(shutdown).await });

    vec![inbound, reaper]
}
