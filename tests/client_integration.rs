// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end client tests against the in-process broker.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use iotf_client::transport::memory::{MemoryBroker, MemoryTransport};
use iotf_client::{
    CallbackResult, Client, ClientBuilder, ClientEvent, ClientIdentity, ConnectError,
    ConnectionState, DeliveryError, Message, MessageFormat, PublishError, ReconnectPolicy,
    SubscribeError, TopicFilter,
};
use serde_json::json;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

// ============================================================================
// Helpers
// ============================================================================

fn builder(app: &str) -> ClientBuilder {
    Client::builder(ClientIdentity::quickstart_application(app))
        .connect_timeout(Duration::from_secs(2))
        .reconnect_policy(ReconnectPolicy::fixed(Duration::from_millis(10)))
}

fn client(broker: &MemoryBroker, app: &str) -> Client<MemoryTransport> {
    builder(app).build(broker.transport()).unwrap()
}

/// Installs a callback that records every message and returns the record.
fn record(client: &Client<MemoryTransport>) -> Arc<Mutex<Vec<Message>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    client.set_event_callback(move |message: Message| -> CallbackResult {
        sink.lock().unwrap().push(message);
        Ok(())
    });
    seen
}

async fn wait_for_len(seen: &Mutex<Vec<Message>>, len: usize) {
    for _ in 0..400 {
        if seen.lock().unwrap().len() >= len {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "timed out waiting for {len} messages, got {}",
        seen.lock().unwrap().len()
    );
}

/// Waits for the first event matching `predicate`, skipping the rest.
async fn next_event(
    rx: &mut broadcast::Receiver<ClientEvent>,
    predicate: impl Fn(&ClientEvent) -> bool,
) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match rx.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn command_names(seen: &Mutex<Vec<Message>>) -> Vec<String> {
    seen.lock()
        .unwrap()
        .iter()
        .filter_map(Message::as_command)
        .map(|command| command.name().to_string())
        .collect()
}

// ============================================================================
// Messaging
// ============================================================================

mod messaging {
    use super::*;

    #[tokio::test]
    async fn command_reaches_subscriber_exactly_once() {
        let broker = MemoryBroker::new();
        let receiver = client(&broker, "receiver");
        let sender = client(&broker, "sender");
        let seen = record(&receiver);

        receiver.connect().await.unwrap();
        receiver
            .subscribe_to_device_commands("Sensor", "dev42")
            .await
            .unwrap();
        sender.connect().await.unwrap();

        sender
            .publish_command("Sensor", "dev42", "run", &json!({"distance": 10}))
            .await
            .unwrap();

        wait_for_len(&seen, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let command = seen[0].as_command().expect("a command");
        assert_eq!(command.device_type(), "Sensor");
        assert_eq!(command.device_id(), "dev42");
        assert_eq!(command.name(), "run");
        assert_eq!(command.format(), &MessageFormat::Json);
        assert_eq!(command.payload().as_json(), Some(&json!({"distance": 10})));
    }

    #[tokio::test]
    async fn events_in_text_format() {
        let broker = MemoryBroker::new();
        let receiver = client(&broker, "receiver");
        let sender = client(&broker, "sender");
        let seen = record(&receiver);

        receiver.connect().await.unwrap();
        receiver
            .subscribe_to_device_events("Sensor", "dev42")
            .await
            .unwrap();
        sender.connect().await.unwrap();

        sender
            .publish_event_with_format("Sensor", "dev42", "status", MessageFormat::Text, "online")
            .await
            .unwrap();

        wait_for_len(&seen, 1).await;
        let seen = seen.lock().unwrap();
        let event = seen[0].as_event().expect("an event");
        assert_eq!(event.name(), "status");
        assert_eq!(event.payload().as_text(), Some("online"));
    }

    #[tokio::test]
    async fn commands_are_not_delivered_as_events() {
        let broker = MemoryBroker::new();
        let receiver = client(&broker, "receiver");
        let seen = record(&receiver);

        receiver.connect().await.unwrap();
        receiver
            .subscribe_to_device_events("Sensor", "dev42")
            .await
            .unwrap();

        broker.publish("iot-2/type/Sensor/id/dev42/cmd/run/fmt/json", b"{}");
        broker.publish("iot-2/type/Sensor/id/dev42/evt/ping/fmt/json", b"{}");

        wait_for_len(&seen, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].as_event().map(|e| e.name()), Some("ping"));
    }

    #[tokio::test]
    async fn arrival_order_is_preserved() {
        let broker = MemoryBroker::new();
        let receiver = client(&broker, "receiver");
        let seen = record(&receiver);
        receiver.connect().await.unwrap();
        receiver.subscribe_to_device_commands("T", "D").await.unwrap();

        let expected: Vec<String> = (0..20).map(|i| format!("c{i}")).collect();
        for name in &expected {
            broker.publish(&format!("iot-2/type/T/id/D/cmd/{name}/fmt/json"), b"{}");
        }

        wait_for_len(&seen, expected.len()).await;
        assert_eq!(command_names(&seen), expected);
    }

    #[tokio::test]
    async fn publish_requires_connection() {
        let broker = MemoryBroker::new();
        let client = client(&broker, "offline");

        let err = client
            .publish_event("T", "D", "e", &json!(1))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::NotConnected));

        client.connect().await.unwrap();
        client.disconnect().await;
        let err = client
            .publish_command("T", "D", "c", &json!(1))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::NotConnected));
    }

    #[tokio::test]
    async fn invalid_names_are_refused() {
        let broker = MemoryBroker::new();
        let client = client(&broker, "strict");
        client.connect().await.unwrap();

        let err = client
            .publish_command("T", "D", "run/#", &json!(1))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::InvalidTopic(_)));

        let err = client
            .subscribe_to_device_commands("T+", "D")
            .await
            .unwrap_err();
        assert!(matches!(err, SubscribeError::InvalidFilter(_)));
    }

    #[tokio::test]
    async fn clients_are_isolated() {
        let broker = MemoryBroker::new();
        let first = client(&broker, "first");
        let second = client(&broker, "second");
        let first_seen = record(&first);
        let second_seen = record(&second);

        first.connect().await.unwrap();
        second.connect().await.unwrap();
        first.subscribe_to_device_commands("T", "A").await.unwrap();
        second.subscribe_to_device_commands("T", "B").await.unwrap();

        broker.publish("iot-2/type/T/id/A/cmd/go/fmt/json", b"{}");

        wait_for_len(&first_seen, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(second_seen.lock().unwrap().is_empty());
        assert_eq!(second.subscriptions().await.len(), 1);

        first.disconnect().await;
        assert!(second.is_connected());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let broker = MemoryBroker::new();
        let client = client(&broker, "unsub");
        let seen = record(&client);
        client.connect().await.unwrap();
        client.subscribe_to_device_commands("T", "D").await.unwrap();

        assert!(client.unsubscribe_from_device_commands("T", "D").await.unwrap());
        assert!(!client.unsubscribe_from_device_commands("T", "D").await.unwrap());
        assert!(broker.subscriptions(client.client_id()).is_empty());

        assert_eq!(broker.publish("iot-2/type/T/id/D/cmd/go/fmt/json", b"{}"), 0);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(seen.lock().unwrap().is_empty());
    }
}

// ============================================================================
// Callback
// ============================================================================

mod callback {
    use super::*;

    #[tokio::test]
    async fn replacement_takes_effect_for_later_messages() {
        let broker = MemoryBroker::new();
        let client = client(&broker, "swap");
        let first = record(&client);
        client.connect().await.unwrap();
        client.subscribe_to_device_commands("T", "D").await.unwrap();

        broker.publish("iot-2/type/T/id/D/cmd/one/fmt/json", b"{}");
        wait_for_len(&first, 1).await;

        let second = record(&client);
        broker.publish("iot-2/type/T/id/D/cmd/two/fmt/json", b"{}");
        wait_for_len(&second, 1).await;

        assert_eq!(command_names(&first), vec!["one"]);
        assert_eq!(command_names(&second), vec!["two"]);
    }

    #[tokio::test]
    async fn failing_callback_does_not_block_delivery() {
        let broker = MemoryBroker::new();
        let client = client(&broker, "flaky");
        let mut events = client.events();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        client.set_event_callback(move |message: Message| -> CallbackResult {
            let name = message
                .as_command()
                .map(|c| c.name().to_string())
                .unwrap_or_default();
            match name.as_str() {
                "fail" => Err("rejected by handler".into()),
                "panic" => panic!("handler blew up"),
                _ => {
                    sink.lock().unwrap().push(message);
                    Ok(())
                }
            }
        });

        client.connect().await.unwrap();
        client.subscribe_to_device_commands("T", "D").await.unwrap();
        for name in ["fail", "panic", "ok"] {
            broker.publish(&format!("iot-2/type/T/id/D/cmd/{name}/fmt/json"), b"{}");
        }

        wait_for_len(&seen, 1).await;
        assert_eq!(command_names(&seen), vec!["ok"]);

        let is_callback_failure = |event: &ClientEvent| {
            matches!(
                event,
                ClientEvent::DeliveryFailed(DeliveryError::CallbackFailed { .. })
            )
        };
        next_event(&mut events, is_callback_failure).await;
        next_event(&mut events, is_callback_failure).await;
    }

    #[tokio::test]
    async fn undecodable_payload_is_reported() {
        let broker = MemoryBroker::new();
        let client = client(&broker, "decode");
        let mut events = client.events();
        let seen = record(&client);
        client.connect().await.unwrap();
        client.subscribe_to_device_commands("T", "D").await.unwrap();

        broker.publish("iot-2/type/T/id/D/cmd/bad/fmt/json", b"{not json");
        broker.publish("iot-2/type/T/id/D/cmd/good/fmt/json", b"{}");

        next_event(&mut events, |event| {
            matches!(
                event,
                ClientEvent::DeliveryFailed(DeliveryError::DecodeFailed { .. })
            )
        })
        .await;
        wait_for_len(&seen, 1).await;
        assert_eq!(command_names(&seen), vec!["good"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn full_queue_drops_newest_message() {
        let broker = MemoryBroker::new();
        let client = builder("slow")
            .dispatch_capacity(1)
            .dispatch_timeout(Duration::from_millis(20))
            .build(broker.transport())
            .unwrap();
        let mut events = client.events();

        let (release, gate) = std::sync::mpsc::channel::<()>();
        let gate = Mutex::new(gate);
        client.set_event_callback(move |_message: Message| -> CallbackResult {
            let _ = gate.lock().unwrap().recv_timeout(Duration::from_secs(5));
            Ok(())
        });

        client.connect().await.unwrap();
        client.subscribe_to_device_commands("T", "D").await.unwrap();
        for i in 0..5 {
            broker.publish(&format!("iot-2/type/T/id/D/cmd/c{i}/fmt/json"), b"{}");
        }

        let event = next_event(&mut events, |event| {
            matches!(
                event,
                ClientEvent::DeliveryFailed(DeliveryError::QueueFull { .. })
            )
        })
        .await;
        assert!(matches!(
            event,
            ClientEvent::DeliveryFailed(DeliveryError::QueueFull { topic }) if topic.starts_with("iot-2/type/T/id/D/cmd/c")
        ));

        drop(release);
        client.disconnect().await;
    }
}

// ============================================================================
// Connection lifecycle
// ============================================================================

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let broker = MemoryBroker::new();
        let client = client(&broker, "twice");

        client.disconnect().await;
        client.connect().await.unwrap();
        client.disconnect().await;
        client.disconnect().await;

        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(broker.connected_clients().is_empty());
    }

    #[tokio::test]
    async fn concurrent_connects_share_one_session() {
        let broker = MemoryBroker::new();
        let client = client(&broker, "racer");
        let other = client.clone();

        let (a, b) = tokio::join!(client.connect(), other.connect());
        a.unwrap();
        b.unwrap();
        assert_eq!(broker.connected_clients(), vec!["a:quickstart:racer".to_string()]);
    }

    #[tokio::test]
    async fn state_changes_are_published() {
        let broker = MemoryBroker::new();
        let client = client(&broker, "observed");
        let mut events = client.events();

        client.connect().await.unwrap();
        client.disconnect().await;

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ClientEvent::StateChanged(state) = event {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnecting,
                ConnectionState::Disconnected,
            ]
        );
    }

    #[tokio::test]
    async fn disconnect_cancels_pending_connect() {
        let broker = MemoryBroker::new();
        broker.set_online(false);
        let client = builder("pending")
            .initial_connect_attempts(u32::MAX)
            .connect_timeout(Duration::from_secs(5))
            .build(broker.transport())
            .unwrap();

        let connecting = client.clone();
        let pending = tokio::spawn(async move { connecting.connect().await });
        assert!(
            client
                .wait_for_state(ConnectionState::Connecting, Duration::from_secs(1))
                .await
        );

        client.disconnect().await;
        assert_eq!(pending.await.unwrap(), Err(ConnectError::Cancelled));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn bad_credentials_fail_without_retry() {
        let broker = MemoryBroker::new();
        broker.add_account("a-org1-key", "right");
        let client = Client::builder(ClientIdentity::application(
            "org1",
            "app",
            "a-org1-key",
            "wrong",
        ))
        .build(broker.transport())
        .unwrap();

        assert_eq!(client.connect().await, Err(ConnectError::AuthFailed));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn good_credentials_connect() {
        let broker = MemoryBroker::new();
        broker.add_account("a-org1-key", "right");
        let client = Client::builder(ClientIdentity::application(
            "org1",
            "app",
            "a-org1-key",
            "right",
        ))
        .build(broker.transport())
        .unwrap();

        client.connect().await.unwrap();
        assert!(broker.is_connected("a:org1:app"));
        client.disconnect().await;
    }

    #[tokio::test]
    async fn unreachable_broker_fails_after_attempts() {
        let broker = MemoryBroker::new();
        broker.set_online(false);
        let client = builder("lonely")
            .initial_connect_attempts(2)
            .build(broker.transport())
            .unwrap();

        match client.connect().await {
            Err(ConnectError::Unreachable { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn reconnect_gives_up_after_max_retries() {
        let broker = MemoryBroker::new();
        let client = builder("fragile")
            .reconnect_policy(ReconnectPolicy::fixed(Duration::from_millis(10)).with_max_retries(2))
            .build(broker.transport())
            .unwrap();
        let mut events = client.events();
        client.connect().await.unwrap();

        broker.set_online(false);

        let exhausted = next_event(&mut events, |event| {
            matches!(event, ClientEvent::ReconnectExhausted { .. })
        })
        .await;
        assert_eq!(exhausted, ClientEvent::ReconnectExhausted { attempts: 2 });
        assert!(
            client
                .wait_for_state(ConnectionState::Disconnected, Duration::from_secs(1))
                .await
        );

        broker.set_online(true);
        client.connect().await.unwrap();
        assert!(client.is_connected());
        client.disconnect().await;
    }
}

// ============================================================================
// Subscriptions across reconnects
// ============================================================================

mod resubscribe {
    use super::*;

    #[tokio::test]
    async fn subscriptions_restored_after_connection_loss() {
        let broker = MemoryBroker::new();
        let client = client(&broker, "resilient");
        let seen = record(&client);
        let mut events = client.events();

        client.connect().await.unwrap();
        client.subscribe_to_device_commands("T", "D1").await.unwrap();
        client.subscribe_to_device_events("T", "D2").await.unwrap();
        let before = broker.subscriptions(client.client_id());
        assert_eq!(before.len(), 2);

        assert!(broker.drop_client(client.client_id()));
        let reconnecting = next_event(&mut events, |event| {
            matches!(event, ClientEvent::Reconnecting { .. })
        })
        .await;
        assert!(matches!(
            reconnecting,
            ClientEvent::Reconnecting { attempt: 1, .. }
        ));
        next_event(&mut events, |event| {
            *event == ClientEvent::StateChanged(ConnectionState::Connected)
        })
        .await;

        assert_eq!(broker.subscriptions(client.client_id()), before);
        broker.publish("iot-2/type/T/id/D1/cmd/again/fmt/json", b"{}");
        wait_for_len(&seen, 1).await;
        assert_eq!(command_names(&seen), vec!["again"]);
    }

    #[tokio::test]
    async fn subscriptions_made_offline_apply_on_connect() {
        let broker = MemoryBroker::new();
        let client = client(&broker, "early");

        client.subscribe_to_device_commands("T", "D").await.unwrap();
        assert!(broker.subscriptions(client.client_id()).is_empty());

        client.connect().await.unwrap();
        assert_eq!(
            broker.subscriptions(client.client_id()),
            vec!["iot-2/type/T/id/D/cmd/+/fmt/+".to_string()]
        );
    }

    #[tokio::test]
    async fn refused_filter_is_reported_without_blocking_others() {
        let broker = MemoryBroker::new();
        broker.reject_filter("iot-2/type/T/id/D2/cmd/+/fmt/+");
        let client = client(&broker, "partial");
        let mut events = client.events();

        for id in ["D1", "D2", "D3"] {
            client.subscribe_to_device_commands("T", id).await.unwrap();
        }
        client.connect().await.unwrap();

        let failed = next_event(&mut events, |event| {
            matches!(event, ClientEvent::SubscriptionFailed { .. })
        })
        .await;
        assert!(matches!(
            failed,
            ClientEvent::SubscriptionFailed { filter, .. } if filter == TopicFilter::device_commands("T", "D2")
        ));
        assert_eq!(broker.subscriptions(client.client_id()).len(), 2);
        assert!(
            client
                .is_subscribed(&TopicFilter::device_commands("T", "D2"))
                .await
        );
    }

    #[tokio::test]
    async fn refused_live_subscription_is_not_recorded() {
        let broker = MemoryBroker::new();
        broker.reject_filter("iot-2/type/T/id/D/evt/+/fmt/+");
        let client = client(&broker, "refused");
        client.connect().await.unwrap();

        let err = client
            .subscribe_to_device_events("T", "D")
            .await
            .unwrap_err();
        assert!(matches!(err, SubscribeError::TransportRejected(_)));
        assert!(client.subscriptions().await.is_empty());
    }

    #[tokio::test]
    async fn persistent_session_keeps_subscriptions() {
        let broker = MemoryBroker::new();
        let client = builder("durable")
            .resubscribe_on_reconnect(false)
            .build(broker.transport())
            .unwrap();
        let seen = record(&client);
        let mut events = client.events();

        client.connect().await.unwrap();
        client.subscribe_to_device_commands("T", "D").await.unwrap();

        broker.drop_client(client.client_id());
        next_event(&mut events, |event| {
            matches!(event, ClientEvent::Reconnecting { .. })
        })
        .await;
        next_event(&mut events, |event| {
            *event == ClientEvent::StateChanged(ConnectionState::Connected)
        })
        .await;

        assert_eq!(
            broker.subscriptions(client.client_id()),
            vec!["iot-2/type/T/id/D/cmd/+/fmt/+".to_string()]
        );
        broker.publish("iot-2/type/T/id/D/cmd/kept/fmt/json", b"{}");
        wait_for_len(&seen, 1).await;
        assert_eq!(command_names(&seen), vec!["kept"]);
    }

    #[tokio::test]
    async fn offline_changes_reach_persistent_session() {
        let broker = MemoryBroker::new();
        let client = builder("returning")
            .resubscribe_on_reconnect(false)
            .build(broker.transport())
            .unwrap();

        client.connect().await.unwrap();
        client.subscribe_to_device_commands("T", "OLD").await.unwrap();

        broker.set_online(false);
        assert!(
            client
                .wait_for_state(ConnectionState::Connecting, Duration::from_secs(2))
                .await
        );
        client.subscribe_to_device_commands("T", "NEW").await.unwrap();
        assert!(
            client
                .unsubscribe_from_device_commands("T", "OLD")
                .await
                .unwrap()
        );

        let mut events = client.events();
        broker.set_online(true);
        next_event(&mut events, |event| {
            *event == ClientEvent::StateChanged(ConnectionState::Connected)
        })
        .await;

        assert_eq!(
            broker.subscriptions(client.client_id()),
            vec!["iot-2/type/T/id/NEW/cmd/+/fmt/+".to_string()]
        );
    }

    #[tokio::test]
    async fn late_refusal_is_reported() {
        let broker = MemoryBroker::new();
        let client = client(&broker, "revoked");
        let mut events = client.events();

        client.connect().await.unwrap();
        client.subscribe_to_device_commands("T", "D").await.unwrap();
        assert!(broker.revoke_subscription(client.client_id(), "iot-2/type/T/id/D/cmd/+/fmt/+"));

        let failed = next_event(&mut events, |event| {
            matches!(event, ClientEvent::SubscriptionFailed { .. })
        })
        .await;
        assert!(matches!(
            failed,
            ClientEvent::SubscriptionFailed { filter, .. } if filter == TopicFilter::device_commands("T", "D")
        ));
        assert!(client.is_connected());
        assert!(
            client
                .is_subscribed(&TopicFilter::device_commands("T", "D"))
                .await
        );
    }
}
