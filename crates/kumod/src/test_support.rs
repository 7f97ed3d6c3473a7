//! In-process end-to-end coverage for the queue tiers: messages are
//! injected against a zone served by the TestResolver and delivered
//! through a scripted SMTP client, so the full path from reception
//! through scheduled queue, promotion, ready queue and dispatch is
//! exercised without touching the network.
use crate::policy::Policy;
use crate::queue::QueueManager;
use crate::smtp_dispatcher::{
    set_smtp_client_factory, ConnectionParams, DeliveryResult, SmtpClientFactory, SmtpConnection,
};
use async_trait::async_trait;
use dns_resolver::{reconfigure_resolver, TestResolver};
use kumo_log_types::Response;
use message::{EnvelopeAddress, Message};
use parking_lot::Mutex;
use spool::local_disk::LocalDiskSpool;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, LazyLock, Once};
use std::time::{Duration, Instant};

/// Delivery attempts observed by the scripted client, by recipient
static DELIVERED: LazyLock<Mutex<Vec<String>>> = LazyLock::new(Mutex::default);
/// Scripted outcomes, keyed by recipient; drained front to back,
/// defaulting to Delivered once exhausted
static SCRIPT: LazyLock<Mutex<HashMap<String, VecDeque<DeliveryResult>>>> =
    LazyLock::new(Mutex::default);

struct TestConnection;

#[async_trait]
impl SmtpConnection for TestConnection {
    async fn deliver(&mut self, msg: &Message) -> anyhow::Result<DeliveryResult> {
        let recipient = msg.recipient()?.to_string();
        let scripted = SCRIPT
            .lock()
            .get_mut(&recipient)
            .and_then(|queue| queue.pop_front());
        Ok(match scripted {
            Some(result) => result,
            None => {
                DELIVERED.lock().push(recipient);
                DeliveryResult::Delivered(Response {
                    code: 250,
                    enhanced_code: None,
                    content: "ok".to_string(),
                    command: None,
                })
            }
        })
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

struct TestFactory;

#[async_trait]
impl SmtpClientFactory for TestFactory {
    async fn connect(
        &self,
        _params: ConnectionParams,
    ) -> anyhow::Result<Box<dyn SmtpConnection>> {
        Ok(Box::new(TestConnection))
    }
}

fn init_test_environment() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let data_dir = tempfile::tempdir().unwrap().into_path();
        let meta_dir = tempfile::tempdir().unwrap().into_path();
        spool::set_data_spool(Arc::new(LocalDiskSpool::new(&data_dir, false).unwrap()));
        spool::set_meta_spool(Arc::new(LocalDiskSpool::new(&meta_dir, false).unwrap()));

        reconfigure_resolver(
            TestResolver::default()
                .with_zone(
                    r#"
$ORIGIN example.com.
example.com. 600 IN MX 10 mx.example.com.
mx.example.com. 600 IN A 10.0.0.25
"#,
                )
                .with_zone(
                    r#"
$ORIGIN transient.test.
transient.test. 600 IN MX 10 mx.transient.test.
mx.transient.test. 600 IN A 10.0.0.26
"#,
                ),
        );

        let policy: Policy = toml::from_str(
            r#"
[queue.default]
retry_interval = "2 seconds"
max_age = "5 minutes"
"#,
        )
        .unwrap();
        crate::policy::install_policy(&policy);

        set_smtp_client_factory(Arc::new(TestFactory)).unwrap();

        // Queue maintainers check this to decide whether to drain;
        // tests run as a live, non-shutting-down process
        let _ = Box::leak(Box::new(kumo_server_lifecycle::LifeCycle::new()));
    });
}

fn make_message(sender: &str, recipient: &str) -> Message {
    Message::new_dirty(
        EnvelopeAddress::parse(sender).unwrap(),
        EnvelopeAddress::parse(recipient).unwrap(),
        serde_json::json!({}),
        Arc::new(b"Subject: hello\r\n\r\nwoot".to_vec().into_boxed_slice()),
    )
    .unwrap()
}

async fn wait_for_delivery(recipient: &str, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if DELIVERED.lock().iter().any(|r| r == recipient) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread")]
async fn delivers_through_both_queue_tiers() {
    init_test_environment();

    let msg = make_message("sender@test.example", "first@example.com");
    msg.save().await.unwrap();
    let queue_name = msg.get_queue_name().unwrap();
    assert_eq!(queue_name, "example.com");

    QueueManager::insert(&queue_name, msg.clone()).await.unwrap();

    assert!(
        wait_for_delivery("first@example.com", Duration::from_secs(10)).await,
        "message should be delivered via the scripted smtp client"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_failure_retries_with_backoff() {
    init_test_environment();

    let recipient = "retry@transient.test";
    SCRIPT.lock().entry(recipient.to_string()).or_default().push_back(
        DeliveryResult::Transient(Response {
            code: 451,
            enhanced_code: None,
            content: "try again later".to_string(),
            command: None,
        }),
    );

    let msg = make_message("sender@test.example", recipient);
    msg.save().await.unwrap();
    let started = Instant::now();

    QueueManager::insert("transient.test", msg.clone()).await.unwrap();

    assert!(
        wait_for_delivery(recipient, Duration::from_secs(30)).await,
        "message should be delivered on the retry attempt"
    );

    // The first attempt transiently failed, so delivery happened on
    // attempt two, after roughly the 2s base retry interval
    assert_eq!(msg.get_num_attempts(), 1);
    assert!(
        started.elapsed() >= Duration::from_secs(1),
        "retry should wait for the backoff interval"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn expands_one_message_per_recipient() {
    init_test_environment();

    // Reception expands an envelope with several recipients into
    // independent messages sharing one body buffer
    let body: Arc<Box<[u8]>> =
        Arc::new(b"Subject: hi\r\n\r\nshared".to_vec().into_boxed_slice());
    let sender = EnvelopeAddress::parse("sender@test.example").unwrap();

    let mut ids = vec![];
    for recipient in ["a@example.com", "b@example.com"] {
        let msg = Message::new_dirty(
            sender.clone(),
            EnvelopeAddress::parse(recipient).unwrap(),
            serde_json::json!({}),
            body.clone(),
        )
        .unwrap();
        msg.save().await.unwrap();
        ids.push(msg.id().to_string());
        QueueManager::insert("example.com", msg).await.unwrap();
    }

    assert_ne!(ids[0], ids[1], "each recipient gets its own spool id");
    assert!(wait_for_delivery("a@example.com", Duration::from_secs(10)).await);
    assert!(wait_for_delivery("b@example.com", Duration::from_secs(10)).await);
}
