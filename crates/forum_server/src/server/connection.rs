#![forbid(unsafe_code)]

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::Message;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, interval_at, timeout};
use tracing::{debug, warn};

/// Process-unique id of one upgraded socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
	#[allow(dead_code)]
	pub fn get(self) -> u64 {
		self.0
	}
}

impl fmt::Display for ConnId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Monotonic `ConnId` source shared by a registry.
#[derive(Debug, Clone, Default)]
pub struct ConnIdGen {
	next: Arc<AtomicU64>,
}

impl ConnIdGen {
	pub fn next(&self) -> ConnId {
		ConnId(self.next.fetch_add(1, Ordering::Relaxed) + 1)
	}
}

/// Per-socket timing and queue settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	/// Bounded outbound queue size; a full queue gets the peer evicted.
	pub outbound_queue_capacity: usize,
	/// Read deadline, reset by every inbound frame including pongs.
	pub pong_wait: Duration,
	/// Keepalive ping interval. Must be shorter than `pong_wait`.
	pub ping_period: Duration,
	/// Deadline for a single (possibly batched) write.
	pub write_wait: Duration,
	pub max_frame_bytes: usize,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			outbound_queue_capacity: 256,
			pong_wait: Duration::from_secs(60),
			ping_period: Duration::from_secs(54),
			write_wait: Duration::from_secs(10),
			max_frame_bytes: forum_protocol::DEFAULT_MAX_FRAME_SIZE,
		}
	}
}

/// Receives the text payload of every inbound data frame, in order.
#[async_trait::async_trait]
pub trait InboundHandler: Send + Sync {
	async fn on_text(&self, payload: &str);
}

/// Why the read pump stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadExit {
	PeerClosed,
	DeadlineExceeded,
	Error(String),
}

/// Why the write pump stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteExit {
	/// The registry dropped our queue (unregistered or evicted).
	QueueClosed,
	DeadlineExceeded,
	Error(String),
}

/// Which pump ended the connection first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpExit {
	Read(ReadExit),
	Write(WriteExit),
}

/// Read loop: hand every frame to `handler` until the peer goes away or stays silent past `pong_wait`.
pub async fn read_pump<R, E, H>(mut stream: R, handler: &H, settings: &ConnectionSettings) -> ReadExit
where
	R: Stream<Item = Result<Message, E>> + Unpin,
	E: fmt::Display,
	H: InboundHandler + ?Sized,
{
	loop {
		let next = match timeout(settings.pong_wait, stream.next()).await {
			Ok(next) => next,
			Err(_) => return ReadExit::DeadlineExceeded,
		};

		let msg = match next {
			Some(Ok(msg)) => msg,
			Some(Err(e)) => return ReadExit::Error(e.to_string()),
			None => return ReadExit::PeerClosed,
		};

		match msg {
			Message::Text(text) => {
				metrics::counter!("forum_server_frames_in_total").increment(1);
				handler.on_text(text.as_str()).await;
			}
			Message::Binary(data) => match std::str::from_utf8(&data) {
				Ok(text) => {
					metrics::counter!("forum_server_frames_in_total").increment(1);
					handler.on_text(text).await;
				}
				Err(_) => {
					metrics::counter!("forum_server_frames_dropped_total").increment(1);
					warn!(len = data.len(), "dropping non-utf8 binary frame");
				}
			},
			// Any inbound frame resets the deadline on the next iteration.
			Message::Ping(_) | Message::Pong(_) => {}
			Message::Close(_) => return ReadExit::PeerClosed,
		}
	}
}

/// Write loop: drain the outbound queue and keep the peer alive with pings.
///
/// Frames already queued when a write starts are fed into the same flush.
pub async fn write_pump<S>(mut sink: S, mut outbound: mpsc::Receiver<String>, settings: ConnectionSettings) -> WriteExit
where
	S: Sink<Message> + Unpin,
	S::Error: fmt::Display + Send,
{
	let mut keepalive = interval_at(Instant::now() + settings.ping_period, settings.ping_period);

	loop {
		tokio::select! {
			frame = outbound.recv() => {
				let Some(first) = frame else {
					let _ = timeout(settings.write_wait, sink.send(Message::Close(None))).await;
					return WriteExit::QueueClosed;
				};

				let pending = outbound.len();
				let write = async {
					sink.feed(Message::Text(first.into())).await?;
					for _ in 0..pending {
						let Ok(next) = outbound.try_recv() else {
							break;
						};
						sink.feed(Message::Text(next.into())).await?;
					}
					sink.flush().await
				};

				match timeout(settings.write_wait, write).await {
					Ok(Ok(())) => {}
					Ok(Err(e)) => return WriteExit::Error(e.to_string()),
					Err(_) => return WriteExit::DeadlineExceeded,
				}
			}

			_ = keepalive.tick() => {
				match timeout(settings.write_wait, sink.send(Message::Ping(Bytes::new()))).await {
					Ok(Ok(())) => {}
					Ok(Err(e)) => return WriteExit::Error(e.to_string()),
					Err(_) => return WriteExit::DeadlineExceeded,
				}
			}
		}
	}
}

/// Run both pumps for one socket.
///
/// The read loop runs on the calling task, the write loop on its own. Whichever
/// exits first triggers `teardown`, which must close the outbound queue; the
/// write loop then sends a close frame and exits on its own.
pub async fn run_pumps<S, R, E, H, F, Fut>(
	sink: S,
	stream: R,
	outbound: mpsc::Receiver<String>,
	handler: Arc<H>,
	settings: ConnectionSettings,
	teardown: F,
) -> PumpExit
where
	S: Sink<Message> + Unpin + Send + 'static,
	S::Error: fmt::Display + Send,
	R: Stream<Item = Result<Message, E>> + Unpin,
	E: fmt::Display,
	H: InboundHandler + ?Sized,
	F: FnOnce() -> Fut,
	Fut: Future<Output = ()>,
{
	let mut writer = tokio::spawn(write_pump(sink, outbound, settings.clone()));
	let reader = read_pump(stream, handler.as_ref(), &settings);
	tokio::pin!(reader);

	tokio::select! {
		exit = &mut reader => {
			teardown().await;
			match timeout(settings.write_wait.saturating_mul(2), &mut writer).await {
				Ok(Ok(write_exit)) => debug!(?write_exit, "write pump finished after read pump"),
				Ok(Err(e)) => warn!(error = %e, "write pump task failed"),
				Err(_) => {
					warn!("write pump did not observe closed queue in time; aborting");
					writer.abort();
				}
			}
			PumpExit::Read(exit)
		}

		joined = &mut writer => {
			teardown().await;
			match joined {
				Ok(exit) => PumpExit::Write(exit),
				Err(e) => PumpExit::Write(WriteExit::Error(e.to_string())),
			}
		}
	}
}
