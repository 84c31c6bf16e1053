//! Command delegation tests.
//!
//! Commands are sent by an application to the tenant command address and
//! forwarded to adapter instances attached on the internal command address.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use neomind_commands::{
    CommandConsumerFactory, CommandRouterConfig, CommandTarget, CommandTargetMapper, RouterError,
    StaticTargetMapper,
};
use neomind_messaging::{
    Connection, DeliveryOutcome, InMemoryConnection, InboundMessage, Message, QoS, ReceiverLink,
};

const TENANT: &str = "tenantA";
const TENANT_ADDRESS: &str = "command/tenantA";
const INSTANCE_ADDRESS: &str = "command_internal/tenantA/inst7";

struct FailingMapper;

#[async_trait]
impl CommandTargetMapper for FailingMapper {
    async fn get_target(
        &self,
        tenant_id: &str,
        device_id: &str,
    ) -> neomind_commands::Result<Option<CommandTarget>> {
        Err(RouterError::ResolutionFailed {
            tenant_id: tenant_id.to_string(),
            device_id: device_id.to_string(),
        })
    }
}

/// Helper to set up a factory with a consumer for the test tenant.
async fn setup(
    connection: &InMemoryConnection,
    mapper: Arc<dyn CommandTargetMapper>,
) -> CommandConsumerFactory {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let config = CommandRouterConfig {
        send_timeout_ms: 200,
        ..Default::default()
    };
    let factory = CommandConsumerFactory::new(Arc::new(connection.clone()), config);
    factory.initialize(mapper).unwrap();
    factory.create_command_consumer(TENANT).await.unwrap();
    factory
}

fn mapper_for_dev1() -> Arc<StaticTargetMapper> {
    let mapper = StaticTargetMapper::new();
    mapper.set_target(TENANT, "dev1", "inst7");
    Arc::new(mapper)
}

/// Attach an adapter instance that settles every command with `outcome`.
async fn attach_adapter(
    connection: &InMemoryConnection,
    outcome: DeliveryOutcome,
) -> tokio::task::JoinHandle<Vec<Message>> {
    let mut link: ReceiverLink = connection
        .create_receiver(INSTANCE_ADDRESS, QoS::AtLeastOnce, 10)
        .await
        .unwrap();
    tokio::spawn(async move {
        let mut received = Vec::new();
        if let Some(InboundMessage { delivery, message }) = link.recv().await {
            delivery.settle(outcome).unwrap();
            received.push(message);
        }
        received
    })
}

fn command(device_id: &str) -> Message {
    Message::new()
        .with_address(format!("command/{}/{}", TENANT, device_id))
        .with_subject("setBrightness")
        .with_correlation_id("corr-1")
        .with_reply_to(format!("command_response/{}/app-1", TENANT))
        .with_payload("application/json", br#"{"level":3}"#.to_vec())
}

/// Send a command as an application and return the outcome.
async fn send_command(connection: &InMemoryConnection, message: Message) -> DeliveryOutcome {
    let sender = connection
        .create_sender(TENANT_ADDRESS, QoS::AtLeastOnce)
        .await
        .unwrap();
    let outcome = sender.send(message).await.unwrap();
    sender.close().await;
    outcome
}

#[tokio::test]
async fn test_command_forwarded_to_adapter_instance() {
    let connection = InMemoryConnection::new();
    let factory = setup(&connection, mapper_for_dev1()).await;
    let adapter = attach_adapter(&connection, DeliveryOutcome::Accepted).await;

    let outcome = send_command(&connection, command("dev1")).await;
    assert_eq!(outcome, DeliveryOutcome::Accepted);

    let received = adapter.await.unwrap();
    assert_eq!(received.len(), 1);
    let forwarded = &received[0];
    assert_eq!(forwarded.address.as_deref(), Some(INSTANCE_ADDRESS));
    assert_eq!(forwarded.subject.as_deref(), Some("setBrightness"));
    assert_eq!(forwarded.correlation_id.as_deref(), Some("corr-1"));
    assert_eq!(forwarded.tenant_id(), Some(TENANT));
    assert_eq!(forwarded.device_id(), Some("dev1"));
    assert_eq!(forwarded.payload.as_deref(), Some(&br#"{"level":3}"#[..]));

    let stats = factory.stats().snapshot();
    assert_eq!(stats.commands_received, 1);
    assert_eq!(stats.commands_forwarded, 1);
}

#[tokio::test]
async fn test_resolver_miss_releases_without_forward() {
    let connection = InMemoryConnection::new();
    let factory = setup(&connection, mapper_for_dev1()).await;

    let outcome = send_command(&connection, command("dev2")).await;
    assert_eq!(outcome, DeliveryOutcome::Released);
    assert!(connection.sent_to(INSTANCE_ADDRESS).is_empty());
    assert_eq!(connection.open_senders(), 0);
    assert_eq!(factory.stats().snapshot().commands_released, 1);
}

#[tokio::test]
async fn test_resolver_error_releases() {
    let connection = InMemoryConnection::new();
    setup(&connection, Arc::new(FailingMapper)).await;

    let outcome = send_command(&connection, command("dev1")).await;
    assert_eq!(outcome, DeliveryOutcome::Released);
    assert!(connection.sent_to(INSTANCE_ADDRESS).is_empty());
}

#[tokio::test]
async fn test_adapter_outcome_propagated() {
    let connection = InMemoryConnection::new();
    let factory = setup(&connection, mapper_for_dev1()).await;
    let adapter = attach_adapter(&connection, DeliveryOutcome::rejected("unknown command")).await;

    let outcome = send_command(&connection, command("dev1")).await;
    assert_eq!(outcome, DeliveryOutcome::rejected("unknown command"));
    adapter.await.unwrap();
    assert_eq!(factory.stats().snapshot().commands_rejected, 1);
}

#[tokio::test]
async fn test_missing_adapter_instance_releases() {
    let connection = InMemoryConnection::new();
    setup(&connection, mapper_for_dev1()).await;

    // Resolved, but no instance attached on the internal address
    let outcome = send_command(&connection, command("dev1")).await;
    assert_eq!(outcome, DeliveryOutcome::Released);
    assert_eq!(connection.sent_to(INSTANCE_ADDRESS).len(), 1);
    assert_eq!(connection.open_senders(), 0);
}

#[tokio::test]
async fn test_unresponsive_adapter_times_out() {
    let connection = InMemoryConnection::new();
    setup(&connection, mapper_for_dev1()).await;

    let mut link = connection
        .create_receiver(INSTANCE_ADDRESS, QoS::AtLeastOnce, 10)
        .await
        .unwrap();
    let (held_tx, held_rx) = tokio::sync::oneshot::channel();
    let adapter = tokio::spawn(async move {
        // Keep the delivery unsettled until the test is done
        let inbound = link.recv().await;
        let _ = held_rx.await;
        inbound.is_some()
    });

    let outcome = send_command(&connection, command("dev1")).await;
    assert_eq!(outcome, DeliveryOutcome::Released);

    held_tx.send(()).unwrap();
    assert!(adapter.await.unwrap());
}

#[tokio::test]
async fn test_malformed_commands_rejected() {
    let connection = InMemoryConnection::new();
    setup(&connection, mapper_for_dev1()).await;

    // No command name
    let mut message = command("dev1");
    message.subject = None;
    let outcome = send_command(&connection, message).await;
    assert!(matches!(outcome, DeliveryOutcome::Rejected { condition: Some(_) }));

    // Address of another tenant
    let message = command("dev1").with_address("command/tenantB/dev1");
    let outcome = send_command(&connection, message).await;
    assert!(matches!(outcome, DeliveryOutcome::Rejected { .. }));

    assert!(connection.sent_to(INSTANCE_ADDRESS).is_empty());
}

#[tokio::test]
async fn test_gateway_target() {
    let connection = InMemoryConnection::new();
    let mapper = StaticTargetMapper::new();
    mapper.set_gateway_target(TENANT, "dev1", "inst7", "gw-1");
    setup(&connection, Arc::new(mapper)).await;
    let adapter = attach_adapter(&connection, DeliveryOutcome::Accepted).await;

    assert_eq!(send_command(&connection, command("dev1")).await, DeliveryOutcome::Accepted);

    let received = adapter.await.unwrap();
    assert_eq!(received[0].string_property("via"), Some("gw-1"));
}

#[tokio::test]
async fn test_commands_after_remote_close() {
    let connection = InMemoryConnection::new();
    setup(&connection, mapper_for_dev1()).await;
    connection.close_remotely(TENANT_ADDRESS);

    // Wait for the recreated tenant link
    for _ in 0..200 {
        if connection.open_receivers(TENANT_ADDRESS) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(connection.open_receivers(TENANT_ADDRESS), 1);

    let adapter = attach_adapter(&connection, DeliveryOutcome::Accepted).await;
    assert_eq!(send_command(&connection, command("dev1")).await, DeliveryOutcome::Accepted);
    adapter.await.unwrap();
}
