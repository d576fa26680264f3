//! Channels sharing subscriptions, subscribe/unsubscribe ordering and the
//! buffering of broadcasts that race their confirmation.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use cable_link::{
    identifier, CableError, Channel, ChannelEvent, ChannelEventKind, ChannelParams, ChannelState,
    SubscriptionState, PUBSUB_CHANNEL,
};
use serde_json::{json, Value};
use tokio::time::sleep;

mod common;

use common::{
    broadcast, build_cable, confirm, manual_options, reject, wait_for_commands, wait_until,
    MemoryTransport,
};

fn room(id: &str) -> Channel {
    let mut params = ChannelParams::new();
    params.insert("room".to_string(), Value::String(id.to_string()));
    Channel::new("ChatChannel", params)
}

fn collect_messages(channel: &Channel) -> Arc<Mutex<Vec<Value>>> {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    channel.on(ChannelEventKind::Message, move |event| {
        if let ChannelEvent::Message { message, .. } = event {
            sink.lock().unwrap().push(message.clone());
        }
    });
    received
}

#[tokio::test]
async fn test_subscribe_connects_lazily() {
    let transport = MemoryTransport::new();
    transport.set_auto_confirm(true);
    let cable = build_cable(&transport, manual_options());
    let channel = room("1");

    cable.subscribe(&channel).await.expect("subscribe failed");

    assert!(cable.is_connected());
    assert_eq!(channel.state(), ChannelState::Connected);
    let subscribes = transport.commands("subscribe");
    assert_eq!(subscribes.len(), 1);
    assert_eq!(subscribes[0]["identifier"], channel.identifier());
    assert_eq!(
        channel.identifier(),
        identifier("ChatChannel", channel.params())
    );
}

#[tokio::test]
async fn test_channels_with_same_identifier_share_subscription() {
    let transport = MemoryTransport::new();
    transport.set_auto_confirm(true);
    let cable = build_cable(&transport, manual_options());

    let first = room("1");
    let second = room("1");
    cable.subscribe(&first).await.unwrap();
    cable.subscribe(&second).await.unwrap();

    assert_eq!(transport.commands("subscribe").len(), 1);
    assert_eq!(cable.subscriptions().len(), 1);
    let subscription = cable.subscriptions().get(first.identifier()).unwrap();
    assert_eq!(subscription.channels().len(), 2);
    assert_eq!(subscription.state(), SubscriptionState::Connected);

    let first_messages = collect_messages(&first);
    let second_messages = collect_messages(&second);
    transport.push(broadcast(first.identifier(), json!({"text": "hello"})));
    assert_eq!(*first_messages.lock().unwrap(), vec![json!({"text": "hello"})]);
    assert_eq!(*second_messages.lock().unwrap(), vec![json!({"text": "hello"})]);

    // The server subscription stays while one channel still uses it.
    cable.unsubscribe(&first).await.unwrap();
    assert_eq!(first.state(), ChannelState::Closed);
    assert_eq!(second.state(), ChannelState::Connected);
    assert!(transport.commands("unsubscribe").is_empty());

    cable.unsubscribe(&second).await.unwrap();
    assert_eq!(transport.commands("unsubscribe").len(), 1);
    assert!(cable.subscriptions().is_empty());
}

#[tokio::test]
async fn test_unsubscribe_waits_for_pending_subscribe() {
    let transport = MemoryTransport::new();
    let cable = build_cable(&transport, manual_options());
    cable.connect().await.unwrap();
    let channel = room("1");

    let subscribe = tokio::spawn({
        let cable = cable.clone();
        let channel = channel.clone();
        async move { cable.subscribe(&channel).await }
    });
    wait_for_commands(&transport, "subscribe", 1).await;

    let unsubscribe = tokio::spawn({
        let cable = cable.clone();
        let channel = channel.clone();
        async move { cable.unsubscribe(&channel).await }
    });
    sleep(Duration::from_millis(20)).await;
    assert!(
        transport.commands("unsubscribe").is_empty(),
        "unsubscribe must wait for the subscribe to settle"
    );

    transport.push(confirm(channel.identifier()));
    unsubscribe.await.unwrap().expect("unsubscribe failed");

    // The channel was closed while its subscribe was in flight.
    assert!(subscribe.await.unwrap().is_err());

    let commands: Vec<Value> = transport.sent().iter().map(|msg| msg["command"].clone()).collect();
    assert_eq!(commands, vec![json!("subscribe"), json!("unsubscribe")]);
    assert!(cable.subscriptions().is_empty());
}

#[tokio::test]
async fn test_resubscribe_after_unsubscribe() {
    let transport = MemoryTransport::new();
    transport.set_auto_confirm(true);
    let cable = build_cable(&transport, manual_options());
    let channel = room("1");

    cable.subscribe(&channel).await.unwrap();
    cable.unsubscribe(&channel).await.unwrap();
    assert!(!channel.is_attached());

    cable.subscribe(&channel).await.unwrap();
    assert_eq!(channel.state(), ChannelState::Connected);

    let commands: Vec<Value> = transport.sent().iter().map(|msg| msg["command"].clone()).collect();
    assert_eq!(
        commands,
        vec![json!("subscribe"), json!("unsubscribe"), json!("subscribe")]
    );
}

#[tokio::test]
async fn test_message_before_confirmation_is_delivered_once() {
    let transport = MemoryTransport::new();
    let cable = build_cable(&transport, manual_options());
    cable.connect().await.unwrap();
    let channel = room("1");
    let received = collect_messages(&channel);

    let subscribe = tokio::spawn({
        let cable = cable.clone();
        let channel = channel.clone();
        async move { cable.subscribe(&channel).await }
    });
    wait_for_commands(&transport, "subscribe", 1).await;

    // The broadcast overtakes the subscribe task picking up its confirmation.
    transport.push(confirm(channel.identifier()));
    transport.push(broadcast(channel.identifier(), json!(1)));

    subscribe.await.unwrap().unwrap();
    wait_until(|| !received.lock().unwrap().is_empty()).await;
    sleep(Duration::from_millis(20)).await;
    assert_eq!(*received.lock().unwrap(), vec![json!(1)]);

    transport.push(broadcast(channel.identifier(), json!(2)));
    assert_eq!(*received.lock().unwrap(), vec![json!(1), json!(2)]);
}

#[tokio::test]
async fn test_rejected_subscription_closes_channel() {
    let transport = MemoryTransport::new();
    let cable = build_cable(&transport, manual_options());
    cable.connect().await.unwrap();
    let channel = room("secret");

    let subscribe = tokio::spawn({
        let cable = cable.clone();
        let channel = channel.clone();
        async move { cable.subscribe(&channel).await }
    });
    wait_for_commands(&transport, "subscribe", 1).await;
    transport.push(reject(channel.identifier()));

    let err = subscribe.await.unwrap().unwrap_err();
    assert!(matches!(err, CableError::SubscriptionRejected(_)));
    assert_eq!(channel.state(), ChannelState::Closed);
    assert!(cable.subscriptions().is_empty());
}

#[tokio::test]
async fn test_channel_attached_to_another_cable() {
    let transport = MemoryTransport::new();
    transport.set_auto_confirm(true);
    let cable = build_cable(&transport, manual_options());
    let other = build_cable(&MemoryTransport::new(), manual_options());
    let channel = room("1");

    cable.subscribe(&channel).await.unwrap();
    let err = other.subscribe(&channel).await.unwrap_err();
    assert_eq!(err, CableError::AlreadyAttached);

    // Subscribing again through the same cable is a no-op.
    cable.subscribe(&channel).await.unwrap();
    assert_eq!(transport.commands("subscribe").len(), 1);
}

#[tokio::test]
async fn test_channel_perform_sends_message_command() {
    let transport = MemoryTransport::new();
    transport.set_auto_confirm(true);
    let cable = build_cable(&transport, manual_options());
    let channel = room("1");
    cable.subscribe(&channel).await.unwrap();

    let response = channel.perform("speak", Some(json!({"text": "hi"}))).await.unwrap();
    assert!(response.is_none());

    let messages = transport.commands("message");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["identifier"], channel.identifier());
    let data: Value = serde_json::from_str(messages[0]["data"].as_str().unwrap()).unwrap();
    assert_eq!(data, json!({"text": "hi", "action": "speak"}));
}

#[tokio::test]
async fn test_channel_disconnect_unsubscribes() {
    let transport = MemoryTransport::new();
    transport.set_auto_confirm(true);
    let cable = build_cable(&transport, manual_options());
    let channel = room("1");
    cable.subscribe(&channel).await.unwrap();

    channel.disconnect().await.unwrap();
    assert_eq!(channel.state(), ChannelState::Closed);
    assert_eq!(transport.commands("unsubscribe").len(), 1);

    // Nothing left to do on a closed channel.
    channel.disconnect().await.unwrap();
    assert_eq!(transport.commands("unsubscribe").len(), 1);
}

#[tokio::test]
async fn test_stream_from_uses_pubsub_channel() {
    let transport = MemoryTransport::new();
    transport.set_auto_confirm(true);
    let cable = build_cable(&transport, manual_options());

    let channel = cable.stream_from("chat_42").await.unwrap();
    assert_eq!(channel.name(), PUBSUB_CHANNEL);

    let subscribe = &transport.commands("subscribe")[0];
    let identifier: Value = serde_json::from_str(subscribe["identifier"].as_str().unwrap()).unwrap();
    assert_eq!(
        identifier,
        json!({"channel": PUBSUB_CHANNEL, "stream_name": "chat_42"})
    );

    let signed = cable.stream_from_signed("signed-token").await.unwrap();
    assert_eq!(signed.params()["signed_stream_name"], "signed-token");
}

#[tokio::test]
async fn test_non_recoverable_disconnect_resubscribes() {
    let transport = MemoryTransport::new();
    transport.set_auto_confirm(true);
    let cable = build_cable(&transport, manual_options());
    let channel = room("1");
    cable.subscribe(&channel).await.unwrap();

    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    channel.on(ChannelEventKind::Disconnect, move |event| {
        if let ChannelEvent::Disconnect(err) = event {
            sink.lock().unwrap().push(err.clone());
        }
    });

    transport.drop_connection();
    assert_eq!(channel.state(), ChannelState::Disconnected);
    assert_eq!(errors.lock().unwrap().len(), 1);

    cable.connect().await.unwrap();
    wait_until(|| channel.state() == ChannelState::Connected).await;
    assert_eq!(transport.commands("subscribe").len(), 2);
    assert!(transport.commands("unsubscribe").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_timeout_closes_channel() {
    let transport = MemoryTransport::new();
    transport.set_auto_confirm(false);
    let cable = build_cable(&transport, manual_options());
    cable.connect().await.unwrap();
    let channel = room("slow");

    let err = cable.subscribe(&channel).await.unwrap_err();
    assert!(
        matches!(err, CableError::SubscriptionTimeout { ref identifier, .. } if identifier == channel.identifier()),
        "unexpected error {:?}",
        err
    );
    assert_eq!(channel.state(), ChannelState::Closed);
    assert!(!channel.is_attached());
    assert!(cable.subscriptions().is_empty());
    // A timed out subscribe is not retried.
    assert_eq!(transport.commands("subscribe").len(), 1);
    assert!(cable.is_connected());
}
