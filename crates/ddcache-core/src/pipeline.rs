//! Upload a spill file while its producer is still writing it.
//!
//! An external producer (typically `tar | zstd`) appends to a spill file. A
//! consumer task started before the producer reads whatever has been appended
//! and forwards it to a [`ChunkSink`], so the upload runs alongside compression
//! instead of after it. The producer side raises a [`CompletionSignal`] once it
//! is done; the consumer drains one last time after observing it and stops.
//!
//! The signal also carries "bytes appended" notifications. A producer that can
//! send them (anything in-process) wakes the consumer immediately; an external
//! process cannot, so the consumer falls back to re-reading after a bounded
//! backoff. Raising completion always wakes a waiting consumer at once.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error};
use tokio::fs::{self, File};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::watch;

use crate::config::{DEFAULT_SPILL_BACKOFF, DEFAULT_SPILL_BUFFER};
use crate::errors::{categorize_io_error, TransferError, TransferResult};

/// Destination of forwarded bytes; the upload writer in production.
#[async_trait]
pub trait ChunkSink: Send {
    async fn write_chunk(&mut self, data: &[u8]) -> TransferResult<usize>;
}

/// Something that fills the spill file and returns once it will append no more.
#[async_trait]
pub trait Producer: Send {
    async fn produce(&mut self, spill: &Path, signal: &CompletionSignal) -> TransferResult<()>;
}

#[derive(Debug, Clone, Copy, Default)]
struct SignalState {
    appends: u64,
    finished: bool,
}

/// One-shot "producer finished" flag that any number of watchers may observe.
pub struct CompletionSignal {
    tx: watch::Sender<SignalState>,
}

impl CompletionSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SignalState::default());
        Self { tx }
    }

    pub fn subscribe(&self) -> SignalWatcher {
        SignalWatcher {
            rx: self.tx.subscribe(),
            closed: false,
        }
    }

    /// Tells watchers new bytes are available in the spill file.
    pub fn notify_appended(&self) {
        self.tx.send_modify(|state| state.appends += 1);
    }

    /// Raises completion. Raising it again is a no-op.
    pub fn finish(&self) {
        self.tx.send_if_modified(|state| {
            if state.finished {
                false
            } else {
                state.finished = true;
                true
            }
        });
    }

    pub fn is_finished(&self) -> bool {
        self.tx.borrow().finished
    }
}

impl Default for CompletionSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumer-side view of a [`CompletionSignal`].
pub struct SignalWatcher {
    rx: watch::Receiver<SignalState>,
    closed: bool,
}

impl SignalWatcher {
    /// Non-blocking check; also marks pending notifications as seen. A signal
    /// dropped without finishing counts as finished.
    pub fn observe_finished(&mut self) -> bool {
        self.closed || self.rx.borrow_and_update().finished
    }

    /// Waits for the next notification, at most `backoff`.
    pub async fn wait(&mut self, backoff: Duration) {
        if let Ok(Err(_)) = tokio::time::timeout(backoff, self.rx.changed()).await {
            self.closed = true;
        }
    }
}

/// External producer process. Its combined output is only logged.
#[derive(Debug, Clone)]
pub struct ProducerCommand {
    program: String,
    args: Vec<String>,
}

impl ProducerCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// `sh -c <script>`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(script)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

#[async_trait]
impl Producer for ProducerCommand {
    async fn produce(&mut self, _spill: &Path, _signal: &CompletionSignal) -> TransferResult<()> {
        debug!("running producer: {} {:?}", self.program, self.args);
        let output = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| {
                TransferError::pipeline(format!("starting producer {}", self.program))
                    .with_source(err)
            })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        if !output.status.success() {
            debug!("producer output: {combined}");
            return Err(TransferError::pipeline(format!(
                "producer exited with {}: {}",
                output.status,
                combined.trim()
            )));
        }
        debug!("producer complete. Output: {combined}");
        Ok(())
    }
}

/// Coordinates one producer run with one consumer forwarding the spill file.
#[derive(Debug, Clone)]
pub struct SpillPipeline {
    spill_path: PathBuf,
    buffer_size: usize,
    backoff: Duration,
}

impl SpillPipeline {
    pub fn new(spill_path: impl Into<PathBuf>) -> Self {
        Self {
            spill_path: spill_path.into(),
            buffer_size: DEFAULT_SPILL_BUFFER,
            backoff: DEFAULT_SPILL_BACKOFF,
        }
    }

    /// Upper bound on the bytes read and forwarded per chunk.
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    /// Longest the consumer waits before re-reading a spill file that had no new bytes.
    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn spill_path(&self) -> &Path {
        &self.spill_path
    }

    /// Runs `producer` to completion while forwarding its output to `sink`.
    ///
    /// Returns the sink (so the caller can close it) and the number of bytes
    /// forwarded. A spill file that cannot be created is a fatal error; a
    /// failed producer or forwarding error is retryable.
    pub async fn run<P, W>(&self, producer: &mut P, sink: W) -> TransferResult<(W, u64)>
    where
        P: Producer + ?Sized,
        W: ChunkSink + 'static,
    {
        prepare_spill_file(&self.spill_path).await?;

        let signal = CompletionSignal::new();
        let consumer = tokio::spawn(forward_spill(
            self.spill_path.clone(),
            signal.subscribe(),
            sink,
            self.buffer_size,
            self.backoff,
        ));

        let produced = producer.produce(&self.spill_path, &signal).await;
        signal.finish();

        if let Err(err) = produced {
            // The sink goes down with the consumer so a partial upload is abandoned.
            consumer.abort();
            let _ = consumer.await;
            return Err(err);
        }

        consumer.await.map_err(|join| {
            TransferError::pipeline("spill consumer task failed").with_source(join)
        })?
    }
}

/// Removes any stale spill file and creates an empty one, so a short read can
/// only ever mean "not written yet".
async fn prepare_spill_file(path: &Path) -> TransferResult<()> {
    match fs::remove_file(path).await {
        Ok(()) => debug!("removed stale spill file {}", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(TransferError::pipeline("removing stale spill file")
                .with_path(path.display().to_string())
                .with_source(err)
                .fatal())
        }
    }
    File::create(path).await.map_err(|err| {
        TransferError::pipeline("creating spill file")
            .with_path(path.display().to_string())
            .with_source(err)
            .fatal()
    })?;
    Ok(())
}

async fn forward_spill<W>(
    path: PathBuf,
    mut watcher: SignalWatcher,
    mut sink: W,
    buffer_size: usize,
    backoff: Duration,
) -> TransferResult<(W, u64)>
where
    W: ChunkSink,
{
    let spill_error = |context: &str, err: std::io::Error| {
        let category = categorize_io_error(&err);
        let mut error = TransferError::pipeline(context.to_string())
            .with_path(path.display().to_string())
            .with_source(err);
        error.category = category;
        error
    };

    let mut file = File::open(&path)
        .await
        .map_err(|err| spill_error("opening spill file", err))?;
    let mut buf = vec![0u8; buffer_size];
    let mut forwarded = 0u64;

    loop {
        let done = watcher.observe_finished();
        let n = file
            .read(&mut buf)
            .await
            .map_err(|err| spill_error("reading spill file", err))?;
        if n > 0 {
            if let Err(err) = sink.write_chunk(&buf[..n]).await {
                error!("forwarding spill bytes at offset {forwarded} failed: {err}");
                return Err(err);
            }
            forwarded += n as u64;
            continue;
        }
        if done {
            break;
        }
        watcher.wait(backoff).await;
    }

    debug!("forwarded {} bytes from {}", forwarded, path.display());
    Ok((sink, forwarded))
}
