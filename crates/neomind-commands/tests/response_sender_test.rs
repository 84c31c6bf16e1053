//! Command response sender tests.

use std::sync::Arc;

use neomind_commands::{
    CommandMessage, CommandResponse, CommandResponseSender, CommandRouterConfig, MessagingType,
    RouterError, RouterStats,
};
use neomind_messaging::{properties, Connection, InMemoryConnection, Message, QoS};

const REPLY_ADDRESS: &str = "command_response/tenantA/app-1";

/// Helper to create a response sender on a loopback connection.
fn create_test_sender(
    connection: &InMemoryConnection,
    jms_vendor_props_enabled: bool,
) -> CommandResponseSender {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let config = CommandRouterConfig {
        jms_vendor_props_enabled,
        send_timeout_ms: 200,
        ..Default::default()
    };
    CommandResponseSender::new(Arc::new(connection.clone()), &config, Arc::new(RouterStats::new()))
}

/// Attach the command issuer and accept the first response.
async fn attach_application(
    connection: &InMemoryConnection,
) -> tokio::task::JoinHandle<Option<Message>> {
    let mut link = connection
        .create_receiver(REPLY_ADDRESS, QoS::AtLeastOnce, 10)
        .await
        .unwrap();
    tokio::spawn(async move {
        let inbound = link.recv().await?;
        inbound.delivery.accept().unwrap();
        Some(inbound.message)
    })
}

fn response() -> CommandResponse {
    CommandResponse::new("tenantA", "dev1", "app-1", "corr-1", 200)
        .with_payload("application/json", br#"{"result":"ok"}"#.to_vec())
}

#[tokio::test]
async fn test_response_fields_unchanged() {
    let connection = InMemoryConnection::new();
    let sender = create_test_sender(&connection, false);
    let application = attach_application(&connection).await;

    sender.send_command_response(response()).await.unwrap();

    let message = application.await.unwrap().unwrap();
    assert_eq!(message.address.as_deref(), Some(REPLY_ADDRESS));
    assert_eq!(message.tenant_id(), Some("tenantA"));
    assert_eq!(message.device_id(), Some("dev1"));
    assert_eq!(message.correlation_id.as_deref(), Some("corr-1"));
    assert_eq!(message.status(), Some(200));
    assert_eq!(message.content_type.as_deref(), Some("application/json"));
    assert_eq!(message.payload.as_deref(), Some(&br#"{"result":"ok"}"#[..]));
    assert!(message.string_property(properties::JMS_AMQP_CONTENT_TYPE).is_none());

    // The per-response sender link is closed
    assert_eq!(connection.open_senders(), 0);
}

#[tokio::test]
async fn test_vendor_properties_when_enabled() {
    let connection = InMemoryConnection::new();
    let sender = create_test_sender(&connection, true);
    let application = attach_application(&connection).await;

    sender.send_command_response(response()).await.unwrap();

    let message = application.await.unwrap().unwrap();
    assert_eq!(
        message.string_property(properties::JMS_AMQP_CONTENT_TYPE),
        Some("application/json")
    );
    assert!(message.string_property(properties::JMS_AMQP_CONTENT_ENCODING).is_none());
}

#[tokio::test]
async fn test_other_messaging_type_still_sent() {
    let connection = InMemoryConnection::new();
    let sender = create_test_sender(&connection, false);
    let application = attach_application(&connection).await;

    let response = response().with_messaging_type(MessagingType::Kafka);
    assert_ne!(response.messaging_type, sender.messaging_type());
    sender.send_command_response(response).await.unwrap();

    assert!(application.await.unwrap().is_some());
}

#[tokio::test]
async fn test_unaccepted_response_fails() {
    let connection = InMemoryConnection::new();
    let sender = create_test_sender(&connection, false);

    // No command issuer attached
    let err = sender.send_command_response(response()).await.unwrap_err();
    assert!(matches!(err, RouterError::SendFailed(_)));
    assert_eq!(err.status_code(), 500);
    assert_eq!(connection.open_senders(), 0);
    assert_eq!(connection.sent_to(REPLY_ADDRESS).len(), 1);
}

#[tokio::test]
async fn test_sender_creation_failure() {
    let connection = InMemoryConnection::new();
    connection.refuse_senders(REPLY_ADDRESS);
    let sender = create_test_sender(&connection, false);

    let err = sender.send_command_response(response()).await.unwrap_err();
    assert!(matches!(err, RouterError::ConstructionFailed(_)));
    assert!(connection.sent_to(REPLY_ADDRESS).is_empty());
}

#[tokio::test]
async fn test_connection_down_is_unavailable() {
    let connection = InMemoryConnection::new();
    connection.set_available(false);
    let sender = create_test_sender(&connection, false);

    let err = sender.send_command_response(response()).await.unwrap_err();
    assert!(matches!(err, RouterError::Unavailable(_)));
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_response_from_request_id() {
    let connection = InMemoryConnection::new();
    let sender = create_test_sender(&connection, false);
    let application = attach_application(&connection).await;

    let command = CommandMessage::from_message(
        "tenantA",
        &Message::new()
            .with_address("command/tenantA/dev1")
            .with_subject("reboot")
            .with_message_id("msg-42")
            .with_reply_to(REPLY_ADDRESS),
    )
    .unwrap();
    let request_id = command.request_id().unwrap();

    let response = CommandResponse::from_request_id(&request_id, "tenantA", "dev1", 204).unwrap();
    sender.send_command_response(response).await.unwrap();

    let message = application.await.unwrap().unwrap();
    assert_eq!(message.correlation_id.as_deref(), Some("msg-42"));
    assert_eq!(message.status(), Some(204));
    assert!(message.payload.is_none());
}
