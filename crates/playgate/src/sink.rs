//! The "writer" abstraction the executor and cache stream bytes through.
//! Mirrors the spec's `execute(ctx, source, writer)` contract with a small
//! async trait instead of `io::Write`, so the HTTP response body (which is
//! itself fed by an mpsc channel) and an in-memory capture buffer can both
//! implement it uniformly.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

#[async_trait]
pub trait Sink: Send {
	async fn write_chunk(&mut self, chunk: Bytes) -> std::io::Result<()>;
}

/// Forwards chunks to the HTTP response body via a channel; the receiving
/// end is turned into a `Body` stream by the gateway handler. A closed
/// receiver (client disconnected) surfaces as a broken-pipe IO error so the
/// executor's caller can stop reading from the child promptly.
pub struct ChannelSink(pub mpsc::Sender<Result<Bytes, std::io::Error>>);

#[async_trait]
impl Sink for ChannelSink {
	async fn write_chunk(&mut self, chunk: Bytes) -> std::io::Result<()> {
		self
			.0
			.send(Ok(chunk))
			.await
			.map_err(|_| std::io::Error::from(std::io::ErrorKind::BrokenPipe))
	}
}

/// Appends every chunk to an in-memory buffer. Used both to replay a cache
/// hit's exact bytes and, via `TeeSink`, to capture a fresh execution's
/// output for insertion into the cache.
#[derive(Default)]
pub struct CaptureSink(pub Vec<u8>);

#[async_trait]
impl Sink for CaptureSink {
	async fn write_chunk(&mut self, chunk: Bytes) -> std::io::Result<()> {
		self.0.extend_from_slice(&chunk);
		Ok(())
	}
}

/// Fans a chunk out to two sinks: the live response and a capture buffer.
/// `capture` is never allowed to fail the overall write — if the client's
/// sink errors (disconnect), the whole run still finishes populating the
/// cache entry for the next caller.
pub struct TeeSink<'a> {
	pub primary: &'a mut dyn Sink,
	pub capture: &'a mut CaptureSink,
}

#[async_trait]
impl Sink for TeeSink<'_> {
	async fn write_chunk(&mut self, chunk: Bytes) -> std::io::Result<()> {
		let capture_result = self.capture.write_chunk(chunk.clone()).await;
		let primary_result = self.primary.write_chunk(chunk).await;
		capture_result?;
		primary_result
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn capture_sink_accumulates_bytes() {
		let mut sink = CaptureSink::default();
		sink.write_chunk(Bytes::from_static(b"hello ")).await.unwrap();
		sink.write_chunk(Bytes::from_static(b"world")).await.unwrap();
		assert_eq!(sink.0, b"hello world");
	}

	#[tokio::test]
	async fn tee_sink_forwards_to_both() {
		let mut capture = CaptureSink::default();
		let mut primary = CaptureSink::default();
		{
			let mut tee = TeeSink {
				primary: &mut primary,
				capture: &mut capture,
			};
			tee.write_chunk(Bytes::from_static(b"abc")).await.unwrap();
		}
		assert_eq!(capture.0, b"abc");
		assert_eq!(primary.0, b"abc");
	}

	#[tokio::test]
	async fn tee_sink_still_captures_after_primary_disconnect() {
		let (tx, rx) = mpsc::channel(1);
		drop(rx);
		let mut primary = ChannelSink(tx);
		let mut capture = CaptureSink::default();
		let result = {
			let mut tee = TeeSink {
				primary: &mut primary,
				capture: &mut capture,
			};
			tee.write_chunk(Bytes::from_static(b"xyz")).await
		};
		assert!(result.is_err());
		assert_eq!(capture.0, b"xyz");
	}
}
