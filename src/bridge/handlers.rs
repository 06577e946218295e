// ABOUTME: Stream handler catalogue: open-payload contracts plus the built-in handler set
// ABOUTME: file-upload/download, exec and the indexer run here; archive and container tags are installable

use crate::codec::ErrorKind;
use crate::mux::{BusStream, StreamAcceptor, StreamEvent};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A typed stream-open request: the OPEN payload's tag plus its
/// tag-specific arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamRequest {
    /// (target_path, total_size)
    FileUpload { target: PathBuf, total_size: u64 },
    /// (source_path[, ...])
    FileDownload { sources: Vec<PathBuf> },
    /// (paths..., archive_path, format)
    ArchiveBuild {
        paths: Vec<PathBuf>,
        archive: PathBuf,
        format: String,
    },
    /// (archive_path, dest_path, format)
    ArchiveExtract {
        archive: PathBuf,
        dest: PathBuf,
        format: String,
    },
    /// (argv...)
    Exec { argv: Vec<String> },
    /// (container_id, tail)
    ContainerLogs { container_id: String, tail: u64 },
    /// (root)
    IndexerRun { root: PathBuf },
    /// ()
    IndexerAttach,
}

#[derive(Debug, Error, PartialEq)]
pub enum RequestError {
    #[error("unknown stream type {0:?}")]
    UnknownTag(String),

    #[error("{tag}: {reason}")]
    BadArgs { tag: &'static str, reason: &'static str },
}

impl StreamRequest {
    /// Parse an OPEN payload into a typed request.
    pub fn parse(tag: &str, args: &[String]) -> Result<Self, RequestError> {
        match tag {
            "file-upload" => {
                if args.len() != 2 {
                    return Err(RequestError::BadArgs {
                        tag: "file-upload",
                        reason: "expected target_path and total_size",
                    });
                }
                let total_size = args[1].parse().map_err(|_| RequestError::BadArgs {
                    tag: "file-upload",
                    reason: "total_size is not a number",
                })?;
                Ok(StreamRequest::FileUpload {
                    target: PathBuf::from(&args[0]),
                    total_size,
                })
            }
            "file-download" => {
                if args.is_empty() {
                    return Err(RequestError::BadArgs {
                        tag: "file-download",
                        reason: "expected at least one source path",
                    });
                }
                Ok(StreamRequest::FileDownload {
                    sources: args.iter().map(PathBuf::from).collect(),
                })
            }
            "archive-build" => {
                if args.len() < 3 {
                    return Err(RequestError::BadArgs {
                        tag: "archive-build",
                        reason: "expected paths, archive_path and format",
                    });
                }
                let (paths, rest) = args.split_at(args.len() - 2);
                Ok(StreamRequest::ArchiveBuild {
                    paths: paths.iter().map(PathBuf::from).collect(),
                    archive: PathBuf::from(&rest[0]),
                    format: rest[1].clone(),
                })
            }
            "archive-extract" => {
                if args.len() != 3 {
                    return Err(RequestError::BadArgs {
                        tag: "archive-extract",
                        reason: "expected archive_path, dest_path and format",
                    });
                }
                Ok(StreamRequest::ArchiveExtract {
                    archive: PathBuf::from(&args[0]),
                    dest: PathBuf::from(&args[1]),
                    format: args[2].clone(),
                })
            }
            "exec" => {
                if args.is_empty() || args[0].is_empty() {
                    return Err(RequestError::BadArgs {
                        tag: "exec",
                        reason: "expected argv",
                    });
                }
                Ok(StreamRequest::Exec {
                    argv: args.to_vec(),
                })
            }
            "container-logs" => {
                if args.is_empty() || args.len() > 2 {
                    return Err(RequestError::BadArgs {
                        tag: "container-logs",
                        reason: "expected container_id and optional tail",
                    });
                }
                let tail = match args.get(1) {
                    Some(t) => t.parse().map_err(|_| RequestError::BadArgs {
                        tag: "container-logs",
                        reason: "tail is not a number",
                    })?,
                    None => 0,
                };
                Ok(StreamRequest::ContainerLogs {
                    container_id: args[0].clone(),
                    tail,
                })
            }
            "indexer-run" => {
                if args.len() != 1 {
                    return Err(RequestError::BadArgs {
                        tag: "indexer-run",
                        reason: "expected root path",
                    });
                }
                Ok(StreamRequest::IndexerRun {
                    root: PathBuf::from(&args[0]),
                })
            }
            "indexer-attach" => Ok(StreamRequest::IndexerAttach),
            other => Err(RequestError::UnknownTag(other.to_string())),
        }
    }
}

/// Externally installed stream handler (archive builders, container logs).
pub type StreamHandlerFn = Arc<
    dyn Fn(StreamRequest, BusStream, CancellationToken) -> BoxFuture<'static, ()> + Send + Sync,
>;

/// The worker's stream intake: parses OPEN payloads and runs handlers.
///
/// Built-in handlers cover file transfer, exec and the indexer. Tags the
/// build does not carry handlers for fail with `NotFound`; external
/// collaborators install theirs with [`HandlerSet::install`].
pub struct HandlerSet {
    indexer: Arc<Indexer>,
    installed: HashMap<String, StreamHandlerFn>,
}

impl HandlerSet {
    pub fn new() -> Self {
        Self {
            indexer: Arc::new(Indexer::new()),
            installed: HashMap::new(),
        }
    }

    /// Install an external handler for a catalogue tag, replacing any
    /// built-in behavior for it.
    pub fn install(mut self, tag: &str, handler: StreamHandlerFn) -> Self {
        self.installed.insert(tag.to_string(), handler);
        self
    }
}

impl Default for HandlerSet {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamAcceptor for HandlerSet {
    fn accept(
        &self,
        tag: String,
        args: Vec<String>,
        mut stream: BusStream,
        token: CancellationToken,
    ) {
        let request = match StreamRequest::parse(&tag, &args) {
            Ok(request) => request,
            Err(e) => {
                debug!(%tag, error = %e, "stream open rejected");
                let kind = match e {
                    RequestError::UnknownTag(_) => ErrorKind::NotFound,
                    RequestError::BadArgs { .. } => ErrorKind::InvalidArgs,
                };
                tokio::spawn(async move { fail(&mut stream, kind, &e.to_string()).await });
                return;
            }
        };

        if let Some(handler) = self.installed.get(&tag) {
            let fut = handler(request, stream, token);
            tokio::spawn(fut);
            return;
        }

        let indexer = self.indexer.clone();
        tokio::spawn(async move {
            match request {
                StreamRequest::FileUpload { target, total_size } => {
                    file_upload(stream, token, target, total_size).await;
                }
                StreamRequest::FileDownload { sources } => {
                    file_download(stream, token, sources).await;
                }
                StreamRequest::Exec { argv } => {
                    exec(stream, token, argv).await;
                }
                StreamRequest::IndexerRun { root } => {
                    indexer.run(stream, token, root).await;
                }
                StreamRequest::IndexerAttach => {
                    indexer.attach(stream, token).await;
                }
                StreamRequest::ArchiveBuild { .. }
                | StreamRequest::ArchiveExtract { .. }
                | StreamRequest::ContainerLogs { .. } => {
                    fail(
                        &mut stream,
                        ErrorKind::NotFound,
                        "no handler installed for this stream type",
                    )
                    .await;
                }
            }
        });
    }
}

/// Application-level stream failure: a STREAM_RESULT whose value carries
/// the error. STREAM_RESET stays reserved for transport and cancel paths.
async fn fail(stream: &mut BusStream, kind: ErrorKind, message: &str) {
    let _ = stream
        .finish(json!({"error": {"kind": kind.name(), "message": message}}))
        .await;
}

// ─── file transfer ──────────────────────────────────────────────────────

async fn file_upload(
    mut stream: BusStream,
    token: CancellationToken,
    target: PathBuf,
    total_size: u64,
) {
    // O_CREAT|O_EXCL: never clobber an existing file.
    let mut file = match tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&target)
        .await
    {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            return fail(&mut stream, ErrorKind::Conflict, "target already exists").await;
        }
        Err(e) => {
            return fail(&mut stream, ErrorKind::Internal, &e.to_string()).await;
        }
    };

    let mut written: u64 = 0;
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                // Cancellation discards the partial file.
                drop(file);
                let _ = tokio::fs::remove_file(&target).await;
                return;
            }
            event = stream.recv() => match event {
                Some(StreamEvent::Data(bytes)) => {
                    if let Err(e) = file.write_all(&bytes).await {
                        return fail(&mut stream, ErrorKind::Internal, &e.to_string()).await;
                    }
                    written += bytes.len() as u64;
                    let _ = stream
                        .progress(json!({"bytes": written, "bytes_total": total_size}))
                        .await;
                }
                Some(StreamEvent::Closed) => {
                    if let Err(e) = file.flush().await {
                        return fail(&mut stream, ErrorKind::Internal, &e.to_string()).await;
                    }
                    let _ = stream
                        .finish(json!({"status": "ok", "bytes": written}))
                        .await;
                    return;
                }
                Some(StreamEvent::Reset(_)) | None => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&target).await;
                    return;
                }
                Some(_) => {}
            }
        }
    }
}

async fn file_download(mut stream: BusStream, token: CancellationToken, sources: Vec<PathBuf>) {
    // Multi-source downloads go through archive-build; this streams one
    // file.
    let source = match sources.as_slice() {
        [one] => one.clone(),
        _ => {
            return fail(
                &mut stream,
                ErrorKind::InvalidArgs,
                "multi-source download requires an archive handler",
            )
            .await;
        }
    };

    let _ = stream.progress(json!({"phase": "preparing"})).await;
    let mut file = match tokio::fs::File::open(&source).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return fail(&mut stream, ErrorKind::NotFound, "no such file").await;
        }
        Err(e) => return fail(&mut stream, ErrorKind::Internal, &e.to_string()).await,
    };
    let total = match file.metadata().await {
        Ok(meta) => meta.len(),
        Err(e) => return fail(&mut stream, ErrorKind::Internal, &e.to_string()).await,
    };
    let _ = stream
        .progress(json!({"phase": "streaming", "bytes_total": total}))
        .await;

    let mut sent: u64 = 0;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        if token.is_cancelled() {
            return;
        }
        let n = match file.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => return fail(&mut stream, ErrorKind::Internal, &e.to_string()).await,
        };
        if stream.send(&buf[..n]).await.is_err() {
            return;
        }
        sent += n as u64;
    }
    let _ = stream
        .finish(json!({"status": "ok", "bytes": sent, "bytes_total": total}))
        .await;
}

// ─── exec ───────────────────────────────────────────────────────────────

async fn exec(mut stream: BusStream, token: CancellationToken, argv: Vec<String>) {
    let mut cmd = tokio::process::Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return fail(&mut stream, ErrorKind::NotFound, "no such executable").await;
        }
        Err(e) => return fail(&mut stream, ErrorKind::Internal, &e.to_string()).await,
    };

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let mut out_buf = vec![0u8; 16 * 1024];
    let mut err_buf = vec![0u8; 16 * 1024];

    // Interleave stdout and stderr in arrival order; consumers that care
    // about the split run two execs.
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                let _ = child.kill().await;
                return;
            }
            n = read_some(&mut stdout, &mut out_buf) => match n {
                Some(n) if n > 0 => {
                    if stream.send(&out_buf[..n]).await.is_err() {
                        let _ = child.kill().await;
                        return;
                    }
                }
                _ => stdout = None,
            },
            n = read_some(&mut stderr, &mut err_buf) => match n {
                Some(n) if n > 0 => {
                    if stream.send(&err_buf[..n]).await.is_err() {
                        let _ = child.kill().await;
                        return;
                    }
                }
                _ => stderr = None,
            },
            status = child.wait(), if stdout.is_none() && stderr.is_none() => {
                match status {
                    Ok(status) => {
                        let _ = stream
                            .finish(json!({"exit_code": status.code().unwrap_or(-1)}))
                            .await;
                    }
                    Err(e) => fail(&mut stream, ErrorKind::Internal, &e.to_string()).await,
                }
                return;
            }
        }
    }
}

/// Read from an optional pipe; resolves to `None` when the pipe is done.
/// Pending forever once the pipe is taken, so the select arm goes quiet.
async fn read_some(
    pipe: &mut Option<impl AsyncReadExt + Unpin>,
    buf: &mut [u8],
) -> Option<usize> {
    match pipe {
        Some(reader) => match reader.read(buf).await {
            Ok(0) | Err(_) => None,
            Ok(n) => Some(n),
        },
        None => std::future::pending().await,
    }
}

// ─── indexer ────────────────────────────────────────────────────────────

/// Per-worker filesystem indexer. At most one scan runs at a time; extra
/// `indexer-run` opens fail `Conflict`, and `indexer-attach` taps the
/// running scan's progress feed.
pub struct Indexer {
    feed: Mutex<Option<broadcast::Sender<serde_json::Value>>>,
}

impl Indexer {
    pub fn new() -> Self {
        Self {
            feed: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.feed.lock().is_some()
    }

    async fn run(self: Arc<Self>, mut stream: BusStream, token: CancellationToken, root: PathBuf) {
        let feed = {
            let mut slot = self.feed.lock();
            if slot.is_some() {
                None
            } else {
                let (tx, _) = broadcast::channel(64);
                *slot = Some(tx.clone());
                Some(tx)
            }
        };
        let feed = match feed {
            Some(tx) => tx,
            None => {
                return fail(
                    &mut stream,
                    ErrorKind::Conflict,
                    "another indexer is running",
                )
                .await;
            }
        };

        let mut files: u64 = 0;
        let mut dirs: u64 = 0;
        let mut pending = vec![root.clone()];

        while let Some(dir) = pending.pop() {
            if token.is_cancelled() {
                self.feed.lock().take();
                return;
            }
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    debug!(dir = %dir.display(), error = %e, "indexer skipping directory");
                    continue;
                }
            };
            dirs += 1;

            while let Ok(Some(entry)) = entries.next_entry().await {
                match entry.file_type().await {
                    Ok(ft) if ft.is_dir() => pending.push(entry.path()),
                    Ok(_) => files += 1,
                    Err(_) => {}
                }
                if (files + dirs) % 100 == 0 {
                    let event = json!({
                        "phase": "scanning",
                        "files_indexed": files,
                        "dirs_indexed": dirs,
                        "current_path": entry.path(),
                    });
                    let _ = feed.send(event.clone());
                    let _ = stream.progress(event).await;
                }
            }
        }

        let done = json!({
            "phase": "done",
            "files_indexed": files,
            "dirs_indexed": dirs,
        });
        let _ = feed.send(done.clone());
        // Dropping the sender ends every attacher's feed.
        self.feed.lock().take();
        let _ = stream.finish(done).await;
    }

    async fn attach(self: Arc<Self>, mut stream: BusStream, token: CancellationToken) {
        let subscription = self.feed.lock().as_ref().map(|tx| tx.subscribe());
        let mut feed = match subscription {
            Some(feed) => feed,
            None => {
                return fail(&mut stream, ErrorKind::NotFound, "no indexer is running").await;
            }
        };

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                event = feed.recv() => match event {
                    Ok(value) => {
                        let done = value["phase"] == json!("done");
                        if done {
                            let _ = stream.finish(value).await;
                            return;
                        }
                        if stream.progress(value).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "indexer attach feed lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        // Run ended without a final event we saw; close out.
                        let _ = stream.finish(json!({"phase": "done"})).await;
                        return;
                    }
                }
            }
        }
    }
}

impl Default for Indexer {
    fn default() -> Self {
        Self::new()
    }
}
