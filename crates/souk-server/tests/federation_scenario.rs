mod common;

use common::{scopes, spawn_server, Options};
use serde_json::{json, Value};
use souk_federation::types::GeoPoint;
use souk_federation::{get_federated_server, DirectoryUser, MemoryInbox, StaticDirectory};
use souk_types::TrustLevel;
use std::sync::Arc;

fn lisbon_directory() -> StaticDirectory {
    StaticDirectory {
        users: vec![DirectoryUser {
            user_id: "u".to_string(),
            display_name: "Ulla".to_string(),
            location: GeoPoint {
                latitude: 38.7223,
                longitude: -9.1393,
            },
            attributes: Some(json!({ "verified": true })),
        }],
        postings: Vec::new(),
    }
}

fn successes(entries: &[Value]) -> usize {
    entries.iter().filter(|e| e["outcome"] == "SUCCESS").count()
}

#[tokio::test]
async fn handshake_negotiates_scopes_and_gates_relay() {
    let a = spawn_server(Options::default()).await;
    let b = spawn_server(Options {
        granted_scopes: scopes(true, true, false),
        directory: Arc::new(lisbon_directory()),
        ..Options::default()
    })
    .await;
    let a_id = a.initialize("Alpha Market").await;
    let b_id = b.initialize("Beta Bazaar").await;

    let response = a.handshake_with(&b, scopes(true, true, true)).await;
    assert_eq!(response["accepted"], true);
    assert_eq!(response["serverId"], b_id.as_str());
    assert_eq!(
        response["acceptedScopes"],
        json!({ "users": true, "postings": true, "chat": false, "geolocation": false, "attributes": false })
    );

    // Each side keeps its own PENDING record of the other with the same scopes.
    let (status, record) = a.admin_get(&format!("/admin/federation/servers/{b_id}")).await;
    assert_eq!(status, 200, "{record}");
    assert_eq!(record["trustLevel"], "PENDING");
    assert_eq!(record["scopes"]["chat"], false);
    assert_eq!(record["scopes"]["users"], true);
    assert_eq!(record["agreementHash"], response["agreementHash"]);

    let b_record = b
        .with_conn(|conn| get_federated_server(conn, &a_id))
        .unwrap()
        .unwrap();
    assert_eq!(b_record.trust_level, TrustLevel::Pending);
    assert!(!b_record.scopes.chat);
    assert_eq!(b_record.server_url, a.url);

    let initiated = a.audit(&format!("eventType=HANDSHAKE_INITIATE&serverId={b_id}")).await;
    assert_eq!(successes(&initiated), 1);
    let accepted = b.audit(&format!("eventType=HANDSHAKE_ACCEPT&serverId={a_id}")).await;
    assert_eq!(successes(&accepted), 1);

    // Chat was not granted, so the relay stops before leaving A.
    let (status, sent) = a
        .admin_post(
            "/admin/federation/messages",
            json!({
                "recipient": format!("u@{b_id}"),
                "senderUserId": "alice",
                "senderName": "Alice",
                "encryptedPayload": "b3BhcXVl",
                "senderPublicKey": "alice-key",
            }),
        )
        .await;
    assert_eq!(status, 200, "{sent}");
    assert_eq!(sent["delivered"], false);
    assert_eq!(sent["messageId"], Value::Null);

    let relays = a.audit("eventType=MESSAGE_RELAY").await;
    assert_eq!(relays.len(), 1);
    assert_eq!(relays[0]["outcome"], "FAILURE");
    assert!(b.audit("eventType=MESSAGE_RECEIVE").await.is_empty());

    // Users was granted; geolocation and attributes were not.
    let (status, nearby) = a
        .admin_get(&format!(
            "/admin/federation/servers/{b_id}/users/nearby?latitude=38.72&longitude=-9.14&radiusKm=25"
        ))
        .await;
    assert_eq!(status, 200, "{nearby}");
    assert_eq!(nearby["serverId"], b_id.as_str());
    let users = nearby["users"].as_array().unwrap();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0]["userId"], "u");
    assert!(users[0].get("distanceKm").map_or(true, Value::is_null));
    assert!(users[0].get("attributes").map_or(true, Value::is_null));

    let served = b.audit("eventType=USER_SEARCH").await;
    assert_eq!(successes(&served), 1);
}

#[tokio::test]
async fn repeated_handshake_keeps_one_record_per_side() {
    let a = spawn_server(Options::default()).await;
    let b = spawn_server(Options::default()).await;
    let _a_id = a.initialize("Alpha Market").await;
    let b_id = b.initialize("Beta Bazaar").await;

    a.handshake_with(&b, scopes(true, false, false)).await;
    // The second proposal asks for more than the link holds; the record
    // keeps its scopes until a co-signed change widens them.
    let second = a.handshake_with(&b, scopes(true, true, false)).await;
    assert_eq!(second["accepted"], true);
    assert_eq!(second["acceptedScopes"]["postings"], false);

    let (status, servers) = a.admin_get("/admin/federation/servers").await;
    assert_eq!(status, 200);
    let servers = servers.as_array().unwrap();
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0]["serverId"], b_id.as_str());
    assert_eq!(servers[0]["scopes"]["postings"], false);

    let (_, on_b) = b.admin_get("/admin/federation/servers").await;
    assert_eq!(on_b.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn relay_delivers_when_chat_is_granted() {
    let inbox = Arc::new(MemoryInbox::for_recipients(["u"]));
    let a = spawn_server(Options::default()).await;
    let b = spawn_server(Options {
        inbox: inbox.clone(),
        ..Options::default()
    })
    .await;
    let a_id = a.initialize("Alpha Market").await;
    let b_id = b.initialize("Beta Bazaar").await;
    a.handshake_with(&b, scopes(false, false, true)).await;

    let message = |recipient: String| {
        json!({
            "recipient": recipient,
            "senderUserId": "alice",
            "senderName": "Alice",
            "encryptedPayload": "b3BhcXVl",
            "senderPublicKey": "alice-key",
        })
    };

    let (status, sent) = a
        .admin_post("/admin/federation/messages", message(format!("u@{b_id}")))
        .await;
    assert_eq!(status, 200, "{sent}");
    assert_eq!(sent["delivered"], true);
    let message_id = sent["messageId"].as_str().unwrap().to_string();

    let delivered = inbox.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].message_id, message_id);
    assert_eq!(delivered[0].sender_address, format!("alice@{a_id}"));
    assert_eq!(delivered[0].encrypted_payload, "b3BhcXVl");

    // Unknown recipient on B: the call succeeds but nothing is delivered.
    let (_, missed) = a
        .admin_post("/admin/federation/messages", message(format!("nobody@{b_id}")))
        .await;
    assert_eq!(missed["delivered"], false);
    assert_eq!(inbox.delivered().len(), 1);

    let (_, malformed) = a
        .admin_post("/admin/federation/messages", message("no-server-part".to_string()))
        .await;
    assert_eq!(malformed["delivered"], false);
}

#[tokio::test]
async fn handshake_to_unreachable_server_is_bad_gateway_and_audited() {
    let a = spawn_server(Options::default()).await;
    a.initialize("Alpha Market").await;

    // Bind and drop to get a port with nothing listening.
    let unused = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let target = format!("http://{}", unused.local_addr().unwrap());
    drop(unused);

    let (status, body) = a
        .admin_post(
            "/admin/federation/handshake",
            json!({ "targetUrl": target, "scopes": scopes(true, false, false) }),
        )
        .await;
    assert_eq!(status, 502, "{body}");

    let entries = a.audit("eventType=HANDSHAKE_INITIATE").await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["outcome"], "FAILURE");
}

#[tokio::test]
async fn federation_endpoints_are_unavailable_before_initialization() {
    let b = spawn_server(Options::default()).await;
    let resp = reqwest::get(format!("{}/federation/v1/identity", b.url))
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);

    b.initialize("Beta Bazaar").await;
    let identity: Value = reqwest::get(format!("{}/federation/v1/identity", b.url))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(identity["serverName"], "Beta Bazaar");
    assert!(identity["publicKey"]
        .as_str()
        .unwrap()
        .starts_with("-----BEGIN PUBLIC KEY-----"));
    assert!(identity.get("privateKeyPem").is_none());
}

#[tokio::test]
async fn outbound_calls_before_initialization_are_audited() {
    let a = spawn_server(Options::default()).await;
    let b = spawn_server(Options::default()).await;
    b.initialize("Beta Bazaar").await;

    let (status, body) = a
        .admin_post(
            "/admin/federation/handshake",
            json!({ "targetUrl": b.url, "scopes": scopes(true, false, false) }),
        )
        .await;
    assert_eq!(status, 409, "{body}");

    let (status, body) = a
        .admin_post(
            "/admin/federation/messages",
            json!({
                "recipient": "u@b1",
                "senderUserId": "alice",
                "senderName": "Alice",
                "encryptedPayload": "b3BhcXVl",
                "senderPublicKey": "alice-key",
            }),
        )
        .await;
    assert_eq!(status, 409, "{body}");

    let (status, _) = a
        .admin_get("/admin/federation/servers/b1/users/nearby?latitude=0&longitude=0&radiusKm=5")
        .await;
    assert_eq!(status, 409);

    let errors = a.audit("eventType=ERROR").await;
    let mut actions: Vec<&str> = errors
        .iter()
        .map(|e| e["action"].as_str().unwrap())
        .collect();
    actions.sort_unstable();
    assert_eq!(actions, ["handshake_initiate", "message_relay", "user_search"]);
    assert!(errors.iter().all(|e| e["outcome"] == "FAILURE"));
    let search = errors.iter().find(|e| e["action"] == "user_search").unwrap();
    assert_eq!(search["serverId"], "b1");

    // Nothing was sent, so B saw no handshake.
    assert!(b.audit("eventType=HANDSHAKE_ACCEPT").await.is_empty());
}
