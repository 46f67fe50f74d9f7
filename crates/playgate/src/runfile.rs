//! RAII temp file the executor writes a submission's source into before
//! handing it to the runner subprocess.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Bytes appended to the truncation marker accounting elsewhere in the
/// executor; declared here because both modules need the source's on-disk
/// extension convention to agree.
const EXTENSION: &str = "go";

/// Prefix every run file is created with, so the background sweeper can
/// recognize its own litter in `TempDir` without touching unrelated files a
/// deployer may also be storing there.
const PREFIX: &str = "playgate-";

pub struct RunFile {
	path: Option<PathBuf>,
}

impl RunFile {
	/// Writes `source` to a uniquely named file under `dir`. The name is not
	/// derived from request content, so two concurrent submissions never
	/// collide even if their source is byte-identical.
	pub async fn create(dir: &Path, source: &[u8]) -> io::Result<Self> {
		let suffix: u64 = rand::random();
		let path = dir.join(format!("playgate-{suffix:016x}.{EXTENSION}"));
		fs_err::tokio::write(&path, source).await?;
		Ok(RunFile { path: Some(path) })
	}

	pub fn path(&self) -> &Path {
		self.path.as_deref().expect("RunFile used after cleanup")
	}

	/// Unlinks the file, retrying a bounded number of times on transient
	/// failures. Called on every orderly exit path from the executor; `Drop`
	/// is the fallback for the one path that bypasses it (the execution
	/// future being dropped out from under a timeout).
	pub async fn cleanup(mut self) {
		if let Some(path) = self.path.take() {
			Self::unlink_with_retry(&path).await;
		}
	}

	async fn unlink_with_retry(path: &Path) {
		const RETRIES: u32 = 3;
		for attempt in 0..RETRIES {
			match fs_err::tokio::remove_file(path).await {
				Ok(()) => return,
				Err(e) if e.kind() == io::ErrorKind::NotFound => return,
				Err(e) if attempt + 1 == RETRIES => {
					tracing::warn!(path = %path.display(), error = %e, "giving up removing temp file");
					return;
				},
				Err(_) => tokio::time::sleep(std::time::Duration::from_millis(20 * (attempt as u64 + 1))).await,
			}
		}
	}
}

impl Drop for RunFile {
	fn drop(&mut self) {
		if let Some(path) = self.path.take() {
			let _ = std::fs::remove_file(&path);
		}
	}
}

/// Periodically removes leftover run files from `temp_dir`. Every run file
/// is cleaned up on its own by `RunFile::cleanup`/`Drop`, so in steady state
/// this finds nothing; it exists for the files an unclean process exit (a
/// `SIGKILL`ed executor, a crash) leaves behind, which neither of those paths
/// runs to clean up.
pub fn spawn_temp_sweeper(temp_dir: PathBuf, interval: Duration) -> tokio::task::JoinHandle<()> {
	tokio::spawn(async move {
		let mut ticker = tokio::time::interval(interval);
		ticker.tick().await;
		loop {
			ticker.tick().await;
			sweep_once(&temp_dir, interval).await;
		}
	})
}

async fn sweep_once(temp_dir: &Path, max_age: Duration) {
	let mut entries = match fs_err::tokio::read_dir(temp_dir).await {
		Ok(entries) => entries,
		Err(e) => {
			tracing::warn!(dir = %temp_dir.display(), error = %e, "temp sweeper could not list directory");
			return;
		},
	};

	loop {
		let entry = match entries.next_entry().await {
			Ok(Some(entry)) => entry,
			Ok(None) => break,
			Err(e) => {
				tracing::warn!(dir = %temp_dir.display(), error = %e, "temp sweeper could not read next entry");
				break;
			},
		};

		let name = entry.file_name();
		let name = name.to_string_lossy();
		if !name.starts_with(PREFIX) || !name.ends_with(EXTENSION) {
			continue;
		}

		let is_stale = match entry.metadata().await.and_then(|m| m.modified()) {
			Ok(modified) => modified.elapsed().map(|age| age > max_age).unwrap_or(false),
			Err(_) => false,
		};
		if !is_stale {
			continue;
		}

		let path = entry.path();
		if let Err(e) = fs_err::tokio::remove_file(&path).await {
			if e.kind() != io::ErrorKind::NotFound {
				tracing::warn!(path = %path.display(), error = %e, "temp sweeper failed to remove stale file");
			}
		} else {
			tracing::debug!(path = %path.display(), "temp sweeper removed orphaned run file");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn create_writes_source_and_cleanup_removes_it() {
		let dir = tempfile::tempdir().unwrap();
		let runfile = RunFile::create(dir.path(), b"package main").await.unwrap();
		let path = runfile.path().to_path_buf();
		assert_eq!(fs_err::tokio::read(&path).await.unwrap(), b"package main");
		runfile.cleanup().await;
		assert!(!path.exists());
	}

	#[tokio::test]
	async fn two_concurrent_creates_never_collide() {
		let dir = tempfile::tempdir().unwrap();
		let a = RunFile::create(dir.path(), b"a").await.unwrap();
		let b = RunFile::create(dir.path(), b"b").await.unwrap();
		assert_ne!(a.path(), b.path());
	}

	#[tokio::test]
	async fn drop_without_cleanup_still_removes_file() {
		let dir = tempfile::tempdir().unwrap();
		let path = {
			let runfile = RunFile::create(dir.path(), b"x").await.unwrap();
			runfile.path().to_path_buf()
		};
		assert!(!path.exists());
	}

	#[tokio::test]
	async fn sweep_removes_only_stale_matching_files() {
		let dir = tempfile::tempdir().unwrap();
		let runfile = RunFile::create(dir.path(), b"stale").await.unwrap();
		let stale_path = runfile.path().to_path_buf();
		std::mem::forget(runfile);

		let unrelated = dir.path().join("not-ours.txt");
		fs_err::tokio::write(&unrelated, b"leave me alone").await.unwrap();

		tokio::time::sleep(Duration::from_millis(30)).await;
		sweep_once(dir.path(), Duration::from_millis(10)).await;

		assert!(!stale_path.exists());
		assert!(unrelated.exists());
	}

	#[tokio::test]
	async fn sweep_leaves_fresh_files_alone() {
		let dir = tempfile::tempdir().unwrap();
		let runfile = RunFile::create(dir.path(), b"fresh").await.unwrap();
		let path = runfile.path().to_path_buf();
		std::mem::forget(runfile);

		sweep_once(dir.path(), Duration::from_secs(3600)).await;

		assert!(path.exists());
		fs_err::tokio::remove_file(&path).await.unwrap();
	}
}
