//! Runs a submission's source through the Go toolchain in a dedicated,
//! killable process group, streaming its combined stdout+stderr through a
//! [`Sink`] under a total byte cap and a wall-clock deadline.

use std::io;
use std::io::Read;
use std::os::fd::OwnedFd;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use bytes::Bytes;
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::error::ExecutionError;
use crate::runfile::RunFile;
use crate::sink::Sink;

/// Appended once the output cap is hit. Counted against the response as
/// additional bytes, not carved out of `max_output_length` — a submission
/// that fills the cap exactly still gets the marker, so the client always
/// knows truncation happened rather than seeing output that merely stops.
const TRUNCATION_MARKER: &[u8] = b"\n... (output truncated)";

const READ_CHUNK_SIZE: usize = 8 * 1024;

pub struct Executor {
	runner_path: std::path::PathBuf,
	temp_dir: std::path::PathBuf,
	max_output_length: usize,
}

impl Executor {
	pub fn new(runner_path: std::path::PathBuf, temp_dir: std::path::PathBuf, max_output_length: usize) -> Self {
		Executor {
			runner_path,
			temp_dir,
			max_output_length,
		}
	}

	/// Writes `source` to a temp file, runs it, and streams its output to
	/// `sink`. Returns once the child has exited (success), the output cap
	/// truncated the run (also a success from the executor's point of view —
	/// the truncation marker was already written), or `timeout` elapsed, in
	/// which case the whole process group is killed before returning.
	pub async fn execute(&self, source: &str, sink: &mut dyn Sink, timeout: Duration) -> Result<(), ExecutionError> {
		let runfile = RunFile::create(&self.temp_dir, source.as_bytes())
			.await
			.map_err(|e| ExecutionError::Setup(e.to_string()))?;

		let result = match tokio::time::timeout(timeout, self.run(runfile.path(), sink)).await {
			Ok(result) => result,
			Err(_) => Err(ExecutionError::Timeout(timeout)),
		};
		runfile.cleanup().await;
		result
	}

	async fn run(&self, path: &Path, sink: &mut dyn Sink) -> Result<(), ExecutionError> {
		let (stdout_stdio, stderr_stdio, read_fd) =
			merged_output_stdio().map_err(|e| ExecutionError::Setup(e.to_string()))?;

		let mut cmd = Command::new(&self.runner_path);
		cmd.arg("run").arg(path);
		cmd.stdin(Stdio::null());
		cmd.stdout(stdout_stdio);
		cmd.stderr(stderr_stdio);
		cmd.kill_on_drop(true);
		// Safety: the closure only calls async-signal-safe functions
		// (setsid) and returns before the child execs.
		unsafe {
			cmd.pre_exec(|| {
				nix::unistd::setsid().map_err(io::Error::from)?;
				Ok(())
			});
		}

		let mut child = cmd.spawn().map_err(|e| ExecutionError::Setup(e.to_string()))?;
		let pid = child
			.id()
			.ok_or_else(|| ExecutionError::Setup("child exited before its pid was observed".to_string()))?;
		let pg_guard = ProcessGroupGuard::new(pid as i32);

		let reader = std::fs::File::from(read_fd);
		let (tx, mut rx) = mpsc::channel::<io::Result<Vec<u8>>>(4);
		let read_task = tokio::task::spawn_blocking(move || read_loop(reader, tx));

		let mut total = 0usize;
		let mut truncated = false;
		while let Some(chunk) = rx.recv().await {
			let chunk = chunk.map_err(ExecutionError::Io)?;
			let n = chunk.len();
			if total + n > self.max_output_length {
				let allowed = self.max_output_length.saturating_sub(total);
				if allowed > 0 {
					sink.write_chunk(Bytes::copy_from_slice(&chunk[..allowed])).await.map_err(ExecutionError::Io)?;
				}
				sink.write_chunk(Bytes::from_static(TRUNCATION_MARKER)).await.map_err(ExecutionError::Io)?;
				truncated = true;
				break;
			}
			sink.write_chunk(Bytes::from(chunk)).await.map_err(ExecutionError::Io)?;
			total += n;
		}
		drop(read_task);

		if truncated {
			// We stopped reading; the child may still be producing output
			// into a pipe nobody drains, so it must be reaped explicitly
			// rather than left to block forever.
			pg_guard.kill();
			let _ = child.wait().await;
			return Ok(());
		}

		let status = child.wait().await.map_err(ExecutionError::Io)?;
		if !status.success() {
			return Err(ExecutionError::NonZeroExit(status.code()));
		}
		Ok(())
	}
}

fn read_loop(mut reader: std::fs::File, tx: mpsc::Sender<io::Result<Vec<u8>>>) {
	let mut buf = [0u8; READ_CHUNK_SIZE];
	loop {
		match reader.read(&mut buf) {
			Ok(0) => return,
			Ok(n) => {
				if tx.blocking_send(Ok(buf[..n].to_vec())).is_err() {
					return;
				}
			},
			Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
			Err(e) => {
				let _ = tx.blocking_send(Err(e));
				return;
			},
		}
	}
}

/// Builds a single pipe and hands both ends of its write side to the child
/// as stdout and stderr, so the parent's single read end observes exactly
/// the order the child wrote bytes in rather than two independently
/// buffered streams.
fn merged_output_stdio() -> io::Result<(Stdio, Stdio, OwnedFd)> {
	let (read_fd, write_fd) = nix::unistd::pipe().map_err(io::Error::from)?;
	let write_file = std::fs::File::from(write_fd);
	let write_clone = write_file.try_clone()?;
	Ok((Stdio::from(write_file), Stdio::from(write_clone), read_fd))
}

/// Kills the child's entire process group (it is its own session/group
/// leader via `setsid`) so subprocesses it spawned are reaped too. Dropped
/// unconditionally at the end of a run; idempotent so an explicit `kill`
/// followed by the `Drop` impl at scope exit only signals once.
struct ProcessGroupGuard {
	pgid: i32,
	killed: std::cell::Cell<bool>,
}

impl ProcessGroupGuard {
	fn new(pgid: i32) -> Self {
		ProcessGroupGuard {
			pgid,
			killed: std::cell::Cell::new(false),
		}
	}

	fn kill(&self) {
		if !self.killed.replace(true) {
			unsafe {
				libc::kill(-self.pgid, libc::SIGKILL);
			}
		}
	}
}

impl Drop for ProcessGroupGuard {
	fn drop(&mut self) {
		self.kill();
	}
}
