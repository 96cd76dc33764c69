//! Multi-node integration tests over in-memory links.
//!
//! Each link pumps one node's outbound queue straight into the other node's
//! ingest path, so full call/response, relay and signing flows run without
//! sockets.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use gridlink_core::{
    handler_fn, Connection, ErrorCode, FailurePolicy, HandlerFault, KeyPair, Node, NodeConfig,
    Payload, ResultCode, RuleContext, SignaturePolicy, SigningRule, VerificationRule,
    VerificationStatus, VerifyAction, WireFormat, WirePayload,
};

type Transform = Arc<dyn Fn(WirePayload) -> WirePayload + Send + Sync>;

fn node(id: &str) -> Arc<Node> {
    Node::new(NodeConfig::new(id).with_request_timeout(Duration::from_secs(2)))
}

/// Connect two nodes with bidirectional in-memory pumps
fn link(a: &Arc<Node>, b: &Arc<Node>) -> (Arc<Connection>, Arc<Connection>) {
    link_with(a, b, Arc::new(|w| w))
}

/// Like [`link`], but frames flowing from `a` to `b` pass through
/// `a_to_b` first
fn link_with(a: &Arc<Node>, b: &Arc<Node>, a_to_b: Transform) -> (Arc<Connection>, Arc<Connection>) {
    let (conn_ab, mut rx_ab) = a.open_link(b.id(), WireFormat::Json);
    let (conn_ba, mut rx_ba) = b.open_link(a.id(), WireFormat::Json);

    {
        let b = b.clone();
        let conn = conn_ba.clone();
        tokio::spawn(async move {
            while let Some(wire) = rx_ab.recv().await {
                b.ingest(&conn, a_to_b(wire)).await;
            }
        });
    }
    {
        let a = a.clone();
        let conn = conn_ab.clone();
        tokio::spawn(async move {
            while let Some(wire) = rx_ba.recv().await {
                a.ingest(&conn, wire).await;
            }
        });
    }

    (conn_ab, conn_ba)
}

fn register_reset(station: &Arc<Node>) {
    station.dispatch().register(
        "Reset",
        handler_fn(|ctx, payload| async move {
            let req: serde_json::Value = payload.parse()?;
            let verification = match &ctx.verification {
                VerificationStatus::Valid => "Valid",
                VerificationStatus::Unverified => "Unverified",
                VerificationStatus::Invalid { .. } => "Invalid",
            };
            Payload::json(json!({
                "status": if req["type"] == "Immediate" { "Accepted" } else { "Scheduled" },
                "verification": verification,
            }))
            .map_err(Into::into)
        }),
    );
}

#[tokio::test]
async fn test_call_round_trip() {
    let csms = node("csms");
    let station = node("CS001");
    register_reset(&station);
    link(&csms, &station);

    let outcome = csms
        .call(
            "CS001",
            "Reset",
            Payload::json(json!({"type": "Immediate"})).unwrap(),
        )
        .await;

    assert_eq!(outcome.code, ResultCode::Ok);
    let reply: serde_json::Value = outcome.payload_as().unwrap();
    assert_eq!(reply["status"], "Accepted");
}

#[tokio::test]
async fn test_unknown_action_returns_not_implemented() {
    let csms = node("csms");
    let station = node("CS001");
    link(&csms, &station);

    let outcome = csms.call("CS001", "Ghost", Payload::default()).await;

    assert_eq!(outcome.code, ResultCode::Ok);
    let error = outcome.remote_error().unwrap();
    assert_eq!(error.code, ErrorCode::NotImplemented);
}

#[tokio::test]
async fn test_call_to_unconnected_node_is_network_error() {
    let csms = node("csms");
    let outcome = csms.call("CS404", "Reset", Payload::default()).await;
    assert_eq!(outcome.code, ResultCode::NetworkError);
}

#[tokio::test]
async fn test_connection_loss_fails_in_flight_call() {
    let csms = node("csms");
    let station = node("CS001");
    station.dispatch().register(
        "Reset",
        handler_fn(|_ctx, _payload| async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(Payload::default())
        }),
    );
    let (conn_to_station, _) = link(&csms, &station);

    let caller = {
        let csms = csms.clone();
        tokio::spawn(async move { csms.call("CS001", "Reset", Payload::default()).await })
    };

    while csms.exchange().pending_count() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    csms.connection_lost(&conn_to_station);

    let outcome = caller.await.unwrap();
    assert_eq!(outcome.code, ResultCode::NetworkError);
}

#[tokio::test]
async fn test_supersede_closes_previous_session() {
    let csms = node("csms");
    let (first, _rx1) = csms.open_link("CS001", WireFormat::Json);
    let (second, _rx2) = csms.open_link("CS001", WireFormat::Json);

    assert!(first.is_closed());
    assert!(!second.is_closed());
    assert_eq!(csms.registry().len(), 1);
}

#[tokio::test]
async fn test_relayed_call_and_reply() {
    let csms = node("csms");
    let relay = node("relay");
    let station = node("CS001");
    register_reset(&station);
    csms.dispatch().register(
        "BootNotification",
        handler_fn(|_ctx, _payload| async move {
            Payload::json(json!({"status": "Accepted", "interval": 300})).map_err(Into::into)
        }),
    );

    link(&station, &relay);
    link(&relay, &csms);

    // The station knows its central system sits behind the relay
    station.router().learn_route("csms", "relay");

    // Station -> relay -> CSMS, reply comes back along the same path
    let outcome = station
        .call("csms", "BootNotification", Payload::json(json!({"model": "X1"})).unwrap())
        .await;
    assert_eq!(outcome.code, ResultCode::Ok);
    let reply: serde_json::Value = outcome.payload_as().unwrap();
    assert_eq!(reply["status"], "Accepted");

    // The inbound call taught the CSMS the reverse path, so it can now
    // originate calls to the station through the relay
    let outcome = csms
        .call(
            "CS001",
            "Reset",
            Payload::json(json!({"type": "Immediate"})).unwrap(),
        )
        .await;
    assert_eq!(outcome.code, ResultCode::Ok);
    let reply: serde_json::Value = outcome.payload_as().unwrap();
    assert_eq!(reply["status"], "Accepted");
}

#[tokio::test]
async fn test_reply_crosses_two_relay_chain() {
    let csms = node("csms");
    let relay_a = node("relay-a");
    let relay_b = node("relay-b");
    let station = node("CS001");
    register_reset(&station);
    csms.dispatch().register(
        "BootNotification",
        handler_fn(|_ctx, _payload| async move {
            Payload::json(json!({"status": "Accepted", "interval": 300})).map_err(Into::into)
        }),
    );

    link(&station, &relay_a);
    link(&relay_a, &relay_b);
    link(&relay_b, &csms);

    // Each hop only knows the next one toward the CSMS; reverse routes are
    // learned from the forwarded hop paths, never configured
    station.router().learn_route("csms", "relay-a");
    relay_a.router().learn_route("csms", "relay-b");

    let outcome = station
        .call("csms", "BootNotification", Payload::json(json!({"model": "X1"})).unwrap())
        .await;
    assert_eq!(outcome.code, ResultCode::Ok);
    let reply: serde_json::Value = outcome.payload_as().unwrap();
    assert_eq!(reply["status"], "Accepted");

    // The call taught every hop the way back, so the CSMS can originate too
    let outcome = csms
        .call(
            "CS001",
            "Reset",
            Payload::json(json!({"type": "Immediate"})).unwrap(),
        )
        .await;
    assert_eq!(outcome.code, ResultCode::Ok);
}

#[tokio::test]
async fn test_relay_drops_routing_loop() {
    let relay = node("relay");
    let station = node("CS001");
    let (_conn, conn_on_relay) = {
        // Only the station<->relay link exists; a frame for an unknown
        // destination whose path already includes the relay must be dropped
        let (conn_sr, _rx_sr) = station.open_link("relay", WireFormat::Json);
        let (conn_rs, _rx_rs) = relay.open_link("CS001", WireFormat::Json);
        (conn_sr, conn_rs)
    };

    let mut frame = gridlink_core::Frame::call("loop-1", "Reset", Payload::default());
    let mut routing = gridlink_core::SourceRouting::from_origin("csms", "CS777");
    routing.push_hop("relay".to_string());
    frame.extras_mut().routing = Some(routing);

    relay
        .ingest(
            &conn_on_relay,
            WirePayload::Text(frame.to_json_string().unwrap()),
        )
        .await;
    // Nothing pending, nothing forwarded; the frame vanished
    assert_eq!(relay.exchange().pending_count(), 0);
}

fn arm_signing(csms_policy: &SignaturePolicy, keypair: &Arc<KeyPair>) {
    csms_policy.add_signing_rule(
        SigningRule::new(RuleContext::Action("Reset".into()), keypair.clone())
            .with_name(|| "csms-operator".to_string()),
    );
}

#[tokio::test]
async fn test_signed_call_verifies_valid() {
    let keypair = Arc::new(KeyPair::generate());
    let csms = node("csms");
    let station = node("CS001");
    register_reset(&station);

    arm_signing(csms.policy(), &keypair);
    station.policy().add_verification_rule(
        VerificationRule::new(RuleContext::Action("Reset".into()), VerifyAction::VerifyAll)
            .with_trust_anchor(keypair.verifying_key()),
    );

    link(&csms, &station);

    let outcome = csms
        .call(
            "CS001",
            "Reset",
            Payload::json(json!({"type": "Immediate"})).unwrap(),
        )
        .await;

    assert_eq!(outcome.code, ResultCode::Ok);
    let reply: serde_json::Value = outcome.payload_as().unwrap();
    assert_eq!(reply["verification"], "Valid");
}

#[tokio::test]
async fn test_tampered_call_flagged_but_delivered() {
    let keypair = Arc::new(KeyPair::generate());
    let csms = node("csms");
    let station = node("CS001");
    register_reset(&station);

    arm_signing(csms.policy(), &keypair);
    station.policy().add_verification_rule(
        VerificationRule::new(RuleContext::Action("Reset".into()), VerifyAction::VerifyAll)
            .with_trust_anchor(keypair.verifying_key())
            .with_failure_policy(FailurePolicy::FlagAndContinue),
    );

    // A hostile middlebox rewrites the reset type in transit
    let tamper: Transform = Arc::new(|wire| match wire {
        WirePayload::Text(text) if text.starts_with("[2,") => {
            WirePayload::Text(text.replace("Immediate", "OnIdle"))
        }
        other => other,
    });
    link_with(&csms, &station, tamper);

    let outcome = csms
        .call(
            "CS001",
            "Reset",
            Payload::json(json!({"type": "Immediate"})).unwrap(),
        )
        .await;

    // Delivered despite the bad signature, with the status surfaced to the
    // handler
    assert_eq!(outcome.code, ResultCode::Ok);
    let reply: serde_json::Value = outcome.payload_as().unwrap();
    assert_eq!(reply["verification"], "Invalid");
    assert_eq!(reply["status"], "Scheduled");
}

#[tokio::test]
async fn test_tampered_call_rejected_with_security_error() {
    let keypair = Arc::new(KeyPair::generate());
    let csms = node("csms");
    let station = node("CS001");
    register_reset(&station);

    arm_signing(csms.policy(), &keypair);
    station.policy().add_verification_rule(
        VerificationRule::new(RuleContext::Action("Reset".into()), VerifyAction::VerifyAll)
            .with_trust_anchor(keypair.verifying_key())
            .with_failure_policy(FailurePolicy::Reject),
    );

    let tamper: Transform = Arc::new(|wire| match wire {
        WirePayload::Text(text) if text.starts_with("[2,") => {
            WirePayload::Text(text.replace("Immediate", "OnIdle"))
        }
        other => other,
    });
    link_with(&csms, &station, tamper);

    let outcome = csms
        .call(
            "CS001",
            "Reset",
            Payload::json(json!({"type": "Immediate"})).unwrap(),
        )
        .await;

    // The station never ran the handler; the caller sees the security error
    assert_eq!(outcome.code, ResultCode::Ok);
    let error = outcome.remote_error().unwrap();
    assert_eq!(error.code, ErrorCode::SecurityError);
}

#[tokio::test]
async fn test_unsigned_call_against_strict_rule_is_invalid() {
    let keypair = Arc::new(KeyPair::generate());
    let csms = node("csms");
    let station = node("CS001");
    register_reset(&station);

    // Station demands signatures; the CSMS has no signing rule at all
    station.policy().add_verification_rule(
        VerificationRule::new(RuleContext::Action("Reset".into()), VerifyAction::VerifyAll)
            .with_trust_anchor(keypair.verifying_key()),
    );
    link(&csms, &station);

    let outcome = csms
        .call(
            "CS001",
            "Reset",
            Payload::json(json!({"type": "Immediate"})).unwrap(),
        )
        .await;

    assert_eq!(outcome.code, ResultCode::Ok);
    let reply: serde_json::Value = outcome.payload_as().unwrap();
    assert_eq!(reply["verification"], "Invalid");
}

#[tokio::test]
async fn test_handler_fault_maps_to_call_result_error() {
    let csms = node("csms");
    let station = node("CS001");
    station.dispatch().register(
        "Reset",
        handler_fn(|_ctx, _payload| async move {
            Err(HandlerFault::internal("controller offline"))
        }),
    );
    link(&csms, &station);

    let outcome = csms.call("CS001", "Reset", Payload::default()).await;

    assert_eq!(outcome.code, ResultCode::Ok);
    let error = outcome.remote_error().unwrap();
    assert_eq!(error.code, ErrorCode::InternalError);
    assert!(error.description.contains("controller offline"));
}

#[tokio::test]
async fn test_send_reaches_handler_without_reply() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    let csms = node("csms");
    let station = node("CS001");
    let seen = Arc::new(AtomicUsize::new(0));
    let seen_in_handler = seen.clone();
    station.dispatch().register(
        "NotifyEvent",
        handler_fn(move |_ctx, _payload| {
            let seen = seen_in_handler.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(Payload::default())
            }
        }),
    );
    link(&csms, &station);

    csms.send("CS001", "NotifyEvent", Payload::default())
        .await
        .unwrap();

    // Give the pump and the spawned handler a moment
    for _ in 0..50 {
        if seen.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert_eq!(csms.exchange().pending_count(), 0);
}

#[tokio::test]
async fn test_binary_wire_format_round_trip() {
    let csms = node("csms");
    let station = node("CS001");
    register_reset(&station);

    // Same pumps, binary frames on the wire
    let (conn_cs, mut rx_cs) = csms.open_link("CS001", WireFormat::Binary);
    let (conn_sc, mut rx_sc) = station.open_link("csms", WireFormat::Binary);
    {
        let station = station.clone();
        let conn = conn_sc.clone();
        tokio::spawn(async move {
            while let Some(wire) = rx_cs.recv().await {
                assert!(matches!(wire, WirePayload::Binary(_)));
                station.ingest(&conn, wire).await;
            }
        });
    }
    {
        let csms = csms.clone();
        let conn = conn_cs.clone();
        tokio::spawn(async move {
            while let Some(wire) = rx_sc.recv().await {
                csms.ingest(&conn, wire).await;
            }
        });
    }

    let outcome = csms
        .call(
            "CS001",
            "Reset",
            Payload::json(json!({"type": "Immediate"})).unwrap(),
        )
        .await;

    assert_eq!(outcome.code, ResultCode::Ok);
    let reply: serde_json::Value = outcome.payload_as().unwrap();
    assert_eq!(reply["status"], "Accepted");
}
