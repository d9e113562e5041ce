//! Pure message routing and parsing for MQTT events
//!
//! Everything here is side-effect free apart from debug logging, so the
//! supervisor loop in [`super::link`] stays thin.

use crate::protocol::{CoordinatorMessage, WorkerMessage, WorkerTopics};
use crate::transport::InboundEvent;
use rumqttc::v5::Event;
use tracing::debug;

pub struct MessageHandler;

impl MessageHandler {
    /// Retained worker events are stale by definition and are dropped
    pub fn should_process(topic: &str, retain: bool) -> bool {
        if retain {
            debug!("Ignoring retained message on topic: {}", topic);
            return false;
        }
        true
    }

    /// Turn a publish on `{prefix}/workers/{id}/events` into an inbound event
    pub fn parse_worker_event(
        topics: &WorkerTopics,
        topic: &str,
        payload: &[u8],
    ) -> Result<InboundEvent, String> {
        let worker_id = topics
            .worker_from_events_topic(topic)
            .ok_or_else(|| format!("Not a worker events topic: {topic}"))?;

        let message = serde_json::from_slice::<WorkerMessage>(payload)
            .map_err(|e| format!("Failed to parse worker message: {e}"))?;

        Ok(InboundEvent::new(worker_id, message))
    }

    pub fn format_coordinator_payload(message: &CoordinatorMessage) -> Result<String, String> {
        serde_json::to_string(message).map_err(|e| format!("Serialization error: {e}"))
    }

    /// Route an MQTT v5 event to the supervisor's handling branch
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => {
                use rumqttc::v5::mqttbytes::v5::Packet;
                match incoming {
                    Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                    Packet::Publish(publish) => EventRoute::MessageReceived {
                        topic: String::from_utf8_lossy(&publish.topic).to_string(),
                        payload: publish.payload.to_vec(),
                        retain: publish.retain,
                    },
                    Packet::Disconnect(_) => EventRoute::Disconnected,
                    Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                        packet_id: suback.pkid,
                    },
                    other => EventRoute::InfrastructureEvent(format!("{other:?}")),
                }
            }
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }
}

#[derive(Debug, Clone)]
pub enum EventRoute {
    ConnectionAcknowledged,
    MessageReceived {
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    },
    Disconnected,
    SubscriptionConfirmed {
        packet_id: u16,
    },
    InfrastructureEvent(String),
    OutgoingEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{TaskAssignment, TaskRequest};
    use bytes::Bytes;
    use rumqttc::v5::mqttbytes::v5::Publish;
    use rumqttc::v5::mqttbytes::QoS;
    use serde_json::json;
    use uuid::Uuid;

    fn topics() -> WorkerTopics {
        WorkerTopics::new("/federation")
    }

    #[test]
    fn test_should_process_ignores_retained() {
        let topic = "/federation/workers/w1/events";
        assert!(MessageHandler::should_process(topic, false));
        assert!(!MessageHandler::should_process(topic, true));
    }

    #[test]
    fn test_parse_heartbeat_event() {
        let payload = br#"{"type":"heartbeat","load":0.25,"health_score":90}"#;
        let event = MessageHandler::parse_worker_event(
            &topics(),
            "/federation/workers/neuron-01/events",
            payload,
        )
        .unwrap();

        assert_eq!(event.worker_id, "neuron-01");
        assert_eq!(
            event.message,
            WorkerMessage::Heartbeat {
                load: 0.25,
                health_score: 90.0
            }
        );
    }

    #[test]
    fn test_parse_completion_event() {
        let task_id = Uuid::new_v4();
        let payload = json!({
            "type": "task_completed",
            "task_id": task_id,
            "attempt": 1,
            "result": {"output": {"summary": "ok"}, "cost": 0.02}
        })
        .to_string();

        let event = MessageHandler::parse_worker_event(
            &topics(),
            "/federation/workers/w1/events",
            payload.as_bytes(),
        )
        .unwrap();

        match event.message {
            WorkerMessage::TaskCompleted {
                task_id: id,
                attempt,
                result,
            } => {
                assert_eq!(id, task_id);
                assert_eq!(attempt, 1);
                assert_eq!(result.cost, 0.02);
                assert_eq!(result.latency_ms, None);
            }
            other => panic!("Expected task_completed, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_rejects_wrong_topic_and_bad_json() {
        let payload = br#"{"type":"heartbeat"}"#;
        assert!(MessageHandler::parse_worker_event(
            &topics(),
            "/federation/workers/w1/assignments",
            payload
        )
        .is_err());

        let result = MessageHandler::parse_worker_event(
            &topics(),
            "/federation/workers/w1/events",
            b"not json",
        );
        assert!(result.unwrap_err().contains("Failed to parse"));

        let result = MessageHandler::parse_worker_event(
            &topics(),
            "/federation/workers/w1/events",
            br#"{"type":"self_destruct"}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_format_coordinator_payload() {
        let request = TaskRequest::new("summarize", json!({"text": "hello"}));
        let message = CoordinatorMessage::TaskAssignment(TaskAssignment::from(&request));

        let payload = MessageHandler::format_coordinator_payload(&message).unwrap();
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["type"], "task_assignment");
        assert_eq!(value["task_type"], "summarize");

        let cancel = CoordinatorMessage::TaskCancelled {
            task_id: request.id,
            reason: "timeout".to_string(),
        };
        let payload = MessageHandler::format_coordinator_payload(&cancel).unwrap();
        assert!(payload.contains("task_cancelled"));
    }

    #[test]
    fn test_route_mqtt_event() {
        use rumqttc::v5::mqttbytes::v5::{ConnAck, ConnectReturnCode, Disconnect, Packet};

        let connack = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
            properties: None,
        }));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&connack),
            EventRoute::ConnectionAcknowledged
        ));

        let disconnect = Event::Incoming(Packet::Disconnect(Disconnect {
            reason_code: rumqttc::v5::mqttbytes::v5::DisconnectReasonCode::NormalDisconnection,
            properties: None,
        }));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&disconnect),
            EventRoute::Disconnected
        ));

        let publish = Event::Incoming(Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: true,
            topic: Bytes::from("/federation/workers/w1/events"),
            pkid: 1,
            payload: Bytes::from("{}"),
            properties: None,
        }));

        if let EventRoute::MessageReceived {
            topic,
            payload,
            retain,
        } = MessageHandler::route_mqtt_event(&publish)
        {
            assert_eq!(topic, "/federation/workers/w1/events");
            assert_eq!(payload, b"{}");
            assert!(retain);
        } else {
            panic!("Expected MessageReceived route");
        }
    }
}
