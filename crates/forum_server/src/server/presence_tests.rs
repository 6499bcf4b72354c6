#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use forum_domain::{DisplayName, Identity, UserId};
use serde_json::Value;

use crate::server::presence::{PresenceConfig, PresenceRegistration, PresenceRegistry, merge_view};
use crate::server::store::StoredMessage;
use crate::server::store::memory::MemoryStore;

fn ts(secs: i64) -> DateTime<Utc> {
	Utc.timestamp_opt(secs, 0).single().expect("ts")
}

fn ident(id: i64, name: &str) -> Identity {
	Identity::new(UserId(id), DisplayName::new(name).expect("name"))
}

fn registry(store: &Arc<MemoryStore>, capacity: usize) -> PresenceRegistry {
	PresenceRegistry::new(
		store.clone(),
		store.clone(),
		PresenceConfig {
			outbound_queue_capacity: capacity,
			debug_logs: false,
		},
	)
}

fn latest_update(reg: &mut PresenceRegistration) -> Value {
	let last = latest_update_opt(reg).expect("expected at least one user_update");
	serde_json::from_str(&last).expect("json")
}

fn latest_update_opt(reg: &mut PresenceRegistration) -> Option<String> {
	let mut last = None;
	while let Ok(raw) = reg.outbound.try_recv() {
		last = Some(raw);
	}
	last
}

fn usernames(update: &Value) -> Vec<String> {
	update["users"]
		.as_array()
		.expect("users array")
		.iter()
		.map(|u| u["username"].as_str().expect("username").to_string())
		.collect()
}

fn online_of(update: &Value, name: &str) -> bool {
	update["users"]
		.as_array()
		.expect("users array")
		.iter()
		.find(|u| u["username"] == name)
		.and_then(|u| u["online"].as_bool())
		.expect("user present")
}

#[test]
fn merge_view_orders_by_latest_interaction_then_name() {
	let viewer = ident(1, "viewer");
	let users = vec![viewer.clone(), ident(2, "a"), ident(3, "b"), ident(4, "c"), ident(5, "aa")];
	let interactions = HashMap::from([(UserId(2), ts(100)), (UserId(4), ts(200))]);

	let view = merge_view(viewer.id, &users, &interactions, |_| false);
	let names: Vec<_> = view.iter().map(|e| e.username.as_str()).collect();

	assert_eq!(names, ["c", "a", "aa", "b"]);
	assert_eq!(view[0].lasttime, Some(ts(200)));
	assert_eq!(view[3].lasttime, None);
}

#[test]
fn merge_view_breaks_equal_times_by_name() {
	let users = vec![ident(2, "zed"), ident(3, "amy")];
	let interactions = HashMap::from([(UserId(2), ts(100)), (UserId(3), ts(100))]);

	let view = merge_view(UserId(1), &users, &interactions, |_| true);
	let names: Vec<_> = view.iter().map(|e| e.username.as_str()).collect();
	assert_eq!(names, ["amy", "zed"]);
	assert!(view.iter().all(|e| e.online));
}

#[tokio::test]
async fn connect_broadcast_orders_users_and_appends_viewer() {
	let store = Arc::new(MemoryStore::new());
	let viewer = store.add_user("viewer");
	let a = store.add_user("a");
	store.add_user("b");
	let c = store.add_user("c");
	store.push_message(StoredMessage {
		sender: viewer.clone(),
		receiver: a.clone(),
		content: "t1".to_string(),
		timestamp: ts(1_000),
	});
	store.push_message(StoredMessage {
		sender: c.clone(),
		receiver: viewer.clone(),
		content: "t2".to_string(),
		timestamp: ts(2_000),
	});

	let presence = registry(&store, 16);
	let mut conn = presence.connect(&viewer).await;

	let update = latest_update(&mut conn);
	assert_eq!(update["type"], "user_update");
	assert_eq!(update["success"], true);
	assert_eq!(usernames(&update), ["c", "a", "b", "viewer"]);
	assert!(online_of(&update, "viewer"));
	assert!(!online_of(&update, "b"));
	assert_eq!(update["users"][2]["lasttime"], "");
	assert_eq!(update["users"][3]["lasttime"], "");
}

#[tokio::test]
async fn connect_is_broadcast_to_every_watcher() {
	let store = Arc::new(MemoryStore::new());
	let alice = store.add_user("alice");
	let bob = store.add_user("bob");

	let presence = registry(&store, 16);
	let mut alice_conn = presence.connect(&alice).await;
	let _ = latest_update(&mut alice_conn);

	let _bob_conn = presence.connect(&bob).await;

	let update = latest_update(&mut alice_conn);
	assert!(online_of(&update, "alice"));
	assert!(online_of(&update, "bob"));
}

#[tokio::test]
async fn disconnect_flips_only_the_leaving_user() {
	let store = Arc::new(MemoryStore::new());
	let alice = store.add_user("alice");
	let bob = store.add_user("bob");
	let carol = store.add_user("carol");

	let presence = registry(&store, 16);
	let mut alice_conn = presence.connect(&alice).await;
	let bob_conn = presence.connect(&bob).await;
	let _carol_conn = presence.connect(&carol).await;

	presence.disconnect(&bob, bob_conn.conn_id).await;

	assert!(presence.is_online(alice.id).await);
	assert!(!presence.is_online(bob.id).await);
	assert!(presence.is_online(carol.id).await);

	let update = latest_update(&mut alice_conn);
	assert!(online_of(&update, "alice"));
	assert!(!online_of(&update, "bob"));
	assert!(online_of(&update, "carol"));
}

#[tokio::test]
async fn closing_any_presence_socket_marks_the_user_offline() {
	let store = Arc::new(MemoryStore::new());
	let alice = store.add_user("alice");
	let bob = store.add_user("bob");

	let presence = registry(&store, 16);
	let mut bob_conn = presence.connect(&bob).await;
	let first = presence.connect(&alice).await;
	let mut second = presence.connect(&alice).await;

	presence.disconnect(&alice, first.conn_id).await;
	assert!(!presence.is_online(alice.id).await);
	assert!(presence.is_online(bob.id).await);

	let update = latest_update(&mut bob_conn);
	assert!(!online_of(&update, "alice"));
	assert!(online_of(&update, "bob"));

	// The remaining socket still receives broadcasts.
	let update = latest_update(&mut second);
	assert!(!online_of(&update, "alice"));

	// A repeated disconnect for the same socket is ignored.
	presence.disconnect(&alice, first.conn_id).await;
	assert!(latest_update_opt(&mut bob_conn).is_none());
}

#[tokio::test]
async fn full_watcher_is_evicted_and_its_queue_closed() {
	let store = Arc::new(MemoryStore::new());
	let alice = store.add_user("alice");
	let bob = store.add_user("bob");

	let presence = registry(&store, 1);
	let mut slow = presence.connect(&alice).await;

	// The connect broadcast fills alice's single slot; the next one overflows it.
	let _bob_conn = presence.connect(&bob).await;

	let first = slow.outbound.recv().await.expect("queued update");
	assert!(first.contains("user_update"));
	assert_eq!(slow.outbound.recv().await, None, "evicted queue is closed");

	// Still counted online until the evicted socket's own teardown.
	assert!(presence.is_online(alice.id).await);
	presence.disconnect(&alice, slow.conn_id).await;
	assert!(!presence.is_online(alice.id).await);
	assert!(presence.is_online(bob.id).await);
}

#[tokio::test]
async fn snapshot_excludes_viewer() {
	let store = Arc::new(MemoryStore::new());
	let alice = store.add_user("alice");
	store.add_user("bob");

	let presence = registry(&store, 16);
	let view = presence.snapshot_for(&alice).await.expect("snapshot");

	assert_eq!(view.len(), 1);
	assert_eq!(view[0].username, "bob");
	assert!(!view[0].online);
}
