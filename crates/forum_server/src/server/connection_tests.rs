#![forbid(unsafe_code)]

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::Message;
use futures::StreamExt;
use futures::channel::mpsc as fmpsc;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use crate::server::connection::{
	ConnIdGen, ConnectionSettings, InboundHandler, PumpExit, ReadExit, WriteExit, read_pump, run_pumps, write_pump,
};

#[derive(Default)]
struct Recorder {
	seen: Mutex<Vec<String>>,
}

impl Recorder {
	fn seen(&self) -> Vec<String> {
		self.seen.lock().expect("lock").clone()
	}
}

#[async_trait::async_trait]
impl InboundHandler for Recorder {
	async fn on_text(&self, payload: &str) {
		self.seen.lock().expect("lock").push(payload.to_string());
	}
}

fn fast_settings() -> ConnectionSettings {
	ConnectionSettings {
		outbound_queue_capacity: 8,
		pong_wait: Duration::from_millis(120),
		ping_period: Duration::from_millis(40),
		write_wait: Duration::from_millis(200),
		max_frame_bytes: 1024,
	}
}

#[test]
fn conn_ids_are_unique_and_increasing() {
	let ids = ConnIdGen::default();
	let a = ids.next();
	let b = ids.clone().next();
	assert!(b > a);
	assert_eq!(a.get(), 1);
}

#[tokio::test]
async fn read_pump_delivers_frames_in_order_until_close() {
	let frames = futures::stream::iter(vec![
		Ok::<_, Infallible>(Message::Text("one".into())),
		Ok(Message::Pong(Default::default())),
		Ok(Message::Binary(b"two".to_vec().into())),
		Ok(Message::Text("three".into())),
		Ok(Message::Close(None)),
		Ok(Message::Text("after close".into())),
	]);
	let recorder = Recorder::default();

	let exit = read_pump(frames, &recorder, &fast_settings()).await;

	assert_eq!(exit, ReadExit::PeerClosed);
	assert_eq!(recorder.seen(), ["one", "two", "three"]);
}

#[tokio::test]
async fn read_pump_times_out_on_a_silent_peer() {
	let (_tx, rx) = fmpsc::unbounded::<Result<Message, Infallible>>();
	let recorder = Recorder::default();

	let exit = timeout(Duration::from_secs(2), read_pump(rx, &recorder, &fast_settings()))
		.await
		.expect("read pump should give up on its own");

	assert_eq!(exit, ReadExit::DeadlineExceeded);
}

#[tokio::test]
async fn pongs_keep_the_read_deadline_alive() {
	let (tx, rx) = fmpsc::unbounded::<Result<Message, Infallible>>();
	let recorder = Arc::new(Recorder::default());
	let settings = fast_settings();

	let pump = tokio::spawn({
		let recorder = recorder.clone();
		async move { read_pump(rx, recorder.as_ref(), &settings).await }
	});

	// Stay quiet for well over one pong_wait in total, but never for a whole one at a time.
	for _ in 0..6 {
		sleep(Duration::from_millis(50)).await;
		tx.unbounded_send(Ok(Message::Pong(Default::default()))).expect("send pong");
	}
	tx.unbounded_send(Ok(Message::Text("still here".into()))).expect("send text");
	tx.unbounded_send(Ok(Message::Close(None))).expect("send close");

	let exit = timeout(Duration::from_secs(2), pump)
		.await
		.expect("pump finishes")
		.expect("join");
	assert_eq!(exit, ReadExit::PeerClosed);
	assert_eq!(recorder.seen(), ["still here"]);
}

#[tokio::test]
async fn write_pump_drains_queue_then_sends_close() {
	let (out_tx, out_rx) = mpsc::channel::<String>(8);
	let (sink, mut written) = fmpsc::unbounded::<Message>();

	for frame in ["a", "b", "c"] {
		out_tx.try_send(frame.to_string()).expect("queue");
	}
	drop(out_tx);

	let exit = timeout(Duration::from_secs(2), write_pump(sink, out_rx, fast_settings()))
		.await
		.expect("write pump exits");
	assert_eq!(exit, WriteExit::QueueClosed);

	let mut got = Vec::new();
	while let Ok(Some(msg)) = written.try_next() {
		got.push(msg);
	}
	assert_eq!(
		got,
		vec![
			Message::Text("a".into()),
			Message::Text("b".into()),
			Message::Text("c".into()),
			Message::Close(None),
		]
	);
}

#[tokio::test]
async fn write_pump_pings_an_idle_peer() {
	let (_out_tx, out_rx) = mpsc::channel::<String>(8);
	let (sink, mut written) = fmpsc::unbounded::<Message>();

	let pump = tokio::spawn(write_pump(sink, out_rx, fast_settings()));

	let first = timeout(Duration::from_secs(2), written.next())
		.await
		.expect("a keepalive within the timeout")
		.expect("sink open");
	assert!(matches!(first, Message::Ping(_)), "got {first:?}");

	pump.abort();
}

#[tokio::test]
async fn write_pump_reports_a_broken_sink() {
	let (out_tx, out_rx) = mpsc::channel::<String>(8);
	let (sink, written) = fmpsc::unbounded::<Message>();
	drop(written);

	out_tx.try_send("x".to_string()).expect("queue");

	let exit = timeout(Duration::from_secs(2), write_pump(sink, out_rx, fast_settings()))
		.await
		.expect("write pump exits");
	assert!(matches!(exit, WriteExit::Error(_)), "got {exit:?}");
}

#[tokio::test]
async fn peer_close_runs_teardown_and_stops_the_writer() {
	let (out_tx, out_rx) = mpsc::channel::<String>(8);
	let (sink, mut written) = fmpsc::unbounded::<Message>();
	let (in_tx, in_rx) = fmpsc::unbounded::<Result<Message, Infallible>>();
	let recorder = Arc::new(Recorder::default());
	let torn_down = Arc::new(AtomicBool::new(false));

	in_tx.unbounded_send(Ok(Message::Text("hello".into()))).expect("send");
	in_tx.unbounded_send(Ok(Message::Close(None))).expect("send");

	let flag = torn_down.clone();
	let exit = timeout(
		Duration::from_secs(2),
		run_pumps(sink, in_rx, out_rx, recorder.clone(), fast_settings(), move || {
			// Closing the queue is what the registries do on unregister.
			drop(out_tx);
			flag.store(true, Ordering::SeqCst);
			async {}
		}),
	)
	.await
	.expect("both pumps finish");

	assert_eq!(exit, PumpExit::Read(ReadExit::PeerClosed));
	assert!(torn_down.load(Ordering::SeqCst));
	assert_eq!(recorder.seen(), ["hello"]);

	let mut last = None;
	while let Ok(Some(msg)) = written.try_next() {
		last = Some(msg);
	}
	assert_eq!(last, Some(Message::Close(None)), "writer closes the socket after teardown");
}

#[tokio::test]
async fn closed_queue_ends_the_connection_from_the_write_side() {
	let (out_tx, out_rx) = mpsc::channel::<String>(8);
	let (sink, _written) = fmpsc::unbounded::<Message>();
	let (_in_tx, in_rx) = fmpsc::unbounded::<Result<Message, Infallible>>();
	let torn_down = Arc::new(AtomicBool::new(false));

	// Eviction: the registry drops its sender while the peer is still connected.
	drop(out_tx);

	let flag = torn_down.clone();
	let exit = timeout(
		Duration::from_secs(2),
		run_pumps(
			sink,
			in_rx,
			out_rx,
			Arc::new(Recorder::default()),
			fast_settings(),
			move || {
				flag.store(true, Ordering::SeqCst);
				async {}
			},
		),
	)
	.await
	.expect("connection ends");

	assert_eq!(exit, PumpExit::Write(WriteExit::QueueClosed));
	assert!(torn_down.load(Ordering::SeqCst));
}
