use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, sleep};
use tubeq_core::impls::InMemoryBroker;
use tubeq_core::supervisor;
use tubeq_core::{ConsumerConfig, Disposition, Item, Processor, Producer, Subscriber};

mod logging;

const DEFAULT_ADDR: &str = "mem://local";
const DEFAULT_TUBE: &str = "emails";
const TTR: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize, Deserialize)]
struct Email {
    to: String,
    subject: String,
}

/// Sends "emails"; the first `failures` attempts fail on purpose.
struct EmailProcessor {
    remaining_failures: AtomicU32,
}

impl EmailProcessor {
    fn new(failures: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl Processor for EmailProcessor {
    async fn process(&self, item: &Item) -> Disposition {
        let email: Email = match serde_json::from_slice(item.body()) {
            Ok(email) => email,
            // malformed payloads never get better
            Err(e) => return Disposition::delete().with_error(e),
        };

        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Disposition::release(Duration::from_secs(1))
                .with_error(format!("smtp unavailable (left={left})"));
        }

        tracing::info!(id = %item.id(), to = %email.to, subject = %email.subject, "email sent");
        Disposition::delete()
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() {
    logging::init();

    let config = match ConsumerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            std::process::exit(2);
        }
    };
    let addr = env_or("TUBEQ_ADDR", DEFAULT_ADDR);
    let tube = env_or("TUBEQ_TUBE", DEFAULT_TUBE);
    tracing::info!(?config, %addr, %tube, "starting");

    // (A) broker + producer
    let broker = InMemoryBroker::new();
    let producer = Producer::new(Arc::new(broker.clone()));

    // (B) subscriber, fails the first delivery
    let subscriber = Subscriber::new(Arc::new(broker.clone())).with_config(config);
    let consumer = {
        let (addr, tube) = (addr.clone(), tube.clone());
        tokio::spawn(async move {
            let processor = EmailProcessor::new(1);
            subscriber.subscribe(&addr, &tube, "mailer", &processor).await
        })
    };

    // (C) enqueue: two now, one scheduled a little later, one malformed
    let emails = [
        Email {
            to: "ada@example.com".into(),
            subject: "welcome".into(),
        },
        Email {
            to: "linus@example.com".into(),
            subject: "invoice".into(),
        },
    ];
    for email in &emails {
        let body = match serde_json::to_vec(email) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(error = %e, "encode email");
                continue;
            }
        };
        match producer
            .put(&addr, &body, &tube, 100, Duration::ZERO, TTR)
            .await
        {
            Ok(id) => tracing::info!(%id, to = %email.to, "enqueued"),
            Err(e) => tracing::error!(error = %e, "put failed"),
        }
    }
    let reminder = serde_json::json!({ "to": "grace@example.com", "subject": "reminder" });
    let at = chrono_now_plus(Duration::from_secs(2));
    match producer
        .put_at(&addr, reminder.to_string().as_bytes(), &tube, 100, at, TTR)
        .await
    {
        Ok(id) => tracing::info!(%id, %at, "scheduled"),
        Err(e) => tracing::error!(error = %e, "put_at failed"),
    }
    if let Err(e) = producer
        .put(&addr, b"not json", &tube, 100, Duration::ZERO, TTR)
        .await
    {
        tracing::error!(error = %e, "put failed");
    }

    // (D) periodic backlog report
    let report = {
        let broker = broker.clone();
        supervisor::hold(
            move || {
                let pending = broker.len();
                async move {
                    tracing::info!(pending, "backlog");
                    Ok::<(), std::convert::Infallible>(())
                }
            },
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
    };
    let reporters = supervisor::spawn(tracing::info_span!("report"), 1, report);

    // (E) wait for the backlog to drain, then break the broker
    let deadline = Instant::now() + Duration::from_secs(30);
    while !broker.is_empty() && Instant::now() < deadline {
        sleep(Duration::from_millis(50)).await;
    }
    tracing::info!(pending = broker.len(), "shutting down broker");
    broker.shutdown();

    match consumer.await {
        Ok(Err(e)) => tracing::info!(error = %e, "subscription ended"),
        Ok(Ok(never)) => match never {},
        Err(e) => tracing::error!(error = %e, "subscription task failed"),
    }
    for reporter in reporters {
        reporter.abort();
    }
}

fn chrono_now_plus(after: Duration) -> chrono::DateTime<chrono::Utc> {
    let now = chrono::Utc::now();
    chrono::Duration::from_std(after)
        .map(|after| now + after)
        .unwrap_or(now)
}
