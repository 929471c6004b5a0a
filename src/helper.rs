use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use log::{debug, warn};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::runtime::{Builder, Runtime};
use tokio::time::timeout;

use crate::error::{ShortenFailure, SpawnError};

pub const DEFAULT_HELPER: &str = "bti-shrink-urls";
pub const DEFAULT_PREFIX: &str = "http://";

/// The helper's answer for one URL.
pub type Candidate = Result<String, ShortenFailure>;

/// Anything that can turn one URL into a candidate.
pub trait UrlShortener {
    fn shorten(&mut self, url: &str) -> Candidate;
}

impl<F: FnMut(&str) -> Candidate> UrlShortener for F {
    fn shorten(&mut self, url: &str) -> Candidate {
        self(url)
    }
}

#[derive(Debug, Clone)]
pub struct HelperConfig {
    pub program: String,
    pub args: Vec<String>,
    pub response_prefix: String,
    /// Deadline for one request/response round trip.
    pub timeout: Duration,
    /// How long the helper may take to exit once its input is closed.
    pub close_grace: Duration,
    pub max_response_len: usize,
    /// Log submitted URLs and raw responses.
    pub trace: bool,
}

impl Default for HelperConfig {
    fn default() -> Self {
        HelperConfig {
            program: DEFAULT_HELPER.to_string(),
            args: Vec::new(),
            response_prefix: DEFAULT_PREFIX.to_string(),
            timeout: Duration::from_secs(5),
            close_grace: Duration::from_secs(1),
            max_response_len: 8 * 1024,
            trace: false,
        }
    }
}

enum Line {
    Complete(Vec<u8>),
    Oversized,
}

/// One running helper process and its three pipes.
///
/// The session drives the helper on its own single-threaded tokio runtime, so
/// it must not be used from inside another runtime's worker; async callers go
/// through `spawn_blocking`. The process is closed and reaped exactly once,
/// either by [`close`] or when the session is dropped.
///
/// [`close`]: HelperSession::close
pub struct HelperSession {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    config: HelperConfig,
    desynced: bool,
    // Declared last so the pipes above are released before it shuts down.
    runtime: Runtime,
}

impl HelperSession {
    pub fn open(config: &HelperConfig) -> Result<HelperSession, SpawnError> {
        let spawn_error = |source| SpawnError { program: config.program.clone(), source };

        let runtime = Builder::new_current_thread().enable_all().build().map_err(spawn_error)?;

        let mut child = {
            let _guard = runtime.enter();
            Command::new(&config.program)
                .args(&config.args)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(spawn_error)?
        };

        let pipes = (child.stdin.take(), child.stdout.take(), child.stderr.take());
        let (Some(stdin), Some(stdout), Some(stderr)) = pipes else {
            runtime.block_on(kill_and_reap(&mut child));
            let source = io::Error::new(io::ErrorKind::BrokenPipe, "helper pipes not captured");
            return Err(spawn_error(source));
        };

        debug!("spawned URL helper `{}` (pid {:?})", config.program, child.id());
        runtime.spawn(drain_diagnostics(stderr, config.program.clone()));

        Ok(HelperSession {
            child: Some(child),
            stdin: Some(stdin),
            stdout: BufReader::new(stdout),
            config: config.clone(),
            desynced: false,
            runtime,
        })
    }

    /// OS process id of the helper, while it is running.
    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Sends one URL and waits for the matching response line.
    pub fn request(&mut self, url: &str) -> Candidate {
        if self.desynced {
            return Err(ShortenFailure::Desynchronized);
        }

        let stdin = self.stdin.as_mut().ok_or(ShortenFailure::Disconnected)?;
        let stdout = &mut self.stdout;
        let limit = self.config.max_response_len;
        let deadline = self.config.timeout;
        if self.config.trace {
            debug!("helper <- {url}");
        }

        let request = format!("{url}\n");
        let exchange = async move {
            stdin.write_all(request.as_bytes()).await?;
            stdin.flush().await?;
            read_capped_line(stdout, limit).await
        };

        let line = match self.runtime.block_on(async { timeout(deadline, exchange).await }) {
            Ok(Ok(Some(Line::Complete(line)))) => line,
            Ok(Ok(Some(Line::Oversized))) => return Err(ShortenFailure::Oversized { limit }),
            Ok(Ok(None)) => return Err(ShortenFailure::Disconnected),
            Ok(Err(e)) => {
                debug!("URL helper pipe failed: {e}");
                return Err(ShortenFailure::Disconnected);
            }
            Err(_) => {
                self.desynced = true;
                return Err(ShortenFailure::Timeout(deadline));
            }
        };

        let line = String::from_utf8(line).map_err(|_| ShortenFailure::NotUtf8)?;
        if self.config.trace {
            debug!("helper -> {}", line.trim_end());
        }

        let candidate = line.trim_end();
        if !candidate.starts_with(&self.config.response_prefix) {
            return Err(ShortenFailure::MissingPrefix {
                prefix: self.config.response_prefix.clone(),
            });
        }

        Ok(candidate.to_string())
    }

    /// Closes the helper's input, waits for it to exit and returns its status.
    pub fn close(mut self) -> Option<ExitStatus> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Option<ExitStatus> {
        let mut child = self.child.take()?;

        // Closing stdin is the helper's signal to finish.
        self.stdin = None;

        let grace = if self.desynced { Duration::ZERO } else { self.config.close_grace };
        let status = self.runtime.block_on(async {
            let waited = timeout(grace, child.wait()).await;
            match waited {
                Ok(Ok(status)) => Some(status),
                Ok(Err(e)) => {
                    warn!("failed to wait for URL helper: {e}");
                    kill_and_reap(&mut child).await
                }
                Err(_) => {
                    debug!("URL helper still running after {grace:?}, killing it");
                    kill_and_reap(&mut child).await
                }
            }
        });

        match &status {
            Some(status) if status.success() => debug!("URL helper exited cleanly"),
            Some(status) => warn!("URL helper `{}` exited with {status}", self.config.program),
            None => warn!("could not reap URL helper `{}`", self.config.program),
        }

        status
    }
}

impl UrlShortener for HelperSession {
    fn shorten(&mut self, url: &str) -> Candidate {
        self.request(url)
    }
}

impl Drop for HelperSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn drain_diagnostics(stderr: ChildStderr, program: String) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("{program}: {line}");
    }
}

async fn kill_and_reap(child: &mut Child) -> Option<ExitStatus> {
    // If it exited already, kill fails and wait still returns its status.
    let _ = child.kill().await;
    child.wait().await.ok()
}

/// Reads one `\n`-terminated line of at most `limit` bytes, excluding the
/// terminator. A longer line is consumed through its terminator and reported
/// as oversized. Returns `None` at end of stream.
async fn read_capped_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    limit: usize,
) -> io::Result<Option<Line>> {
    let mut line = Vec::new();
    let cap = (limit as u64).saturating_add(1);
    let read = (&mut *reader).take(cap).read_until(b'\n', &mut line).await?;
    if read == 0 {
        return Ok(None);
    }

    if line.last() == Some(&b'\n') {
        line.pop();
        return Ok(Some(Line::Complete(line)));
    }

    if line.len() <= limit {
        // End of stream without a terminator.
        return Ok(Some(Line::Complete(line)));
    }

    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            break;
        }
        match buf.iter().position(|&b| b == b'\n') {
            Some(end) => {
                reader.consume(end + 1);
                break;
            }
            None => {
                let skipped = buf.len();
                reader.consume(skipped);
            }
        }
    }
    Ok(Some(Line::Oversized))
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::{Duration, Instant};

    use crate::error::ShortenFailure;
    use crate::helper::{read_capped_line, HelperConfig, HelperSession, Line};

    fn shell(script: &str) -> HelperConfig {
        HelperConfig {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            timeout: Duration::from_secs(5),
            ..HelperConfig::default()
        }
    }

    #[test]
    fn test_request_round_trips() {
        let config = shell(r#"while read -r url; do echo "http://tl.gd/${#url}"; done"#);
        let mut session = HelperSession::open(&config).unwrap();

        assert_eq!(session.request("http://example.com/a").unwrap(), "http://tl.gd/20");
        assert_eq!(session.request("http://example.com/abc").unwrap(), "http://tl.gd/22");

        let status = session.close().unwrap();
        assert!(status.success());
    }

    #[test]
    fn test_trailing_whitespace_is_trimmed() {
        let config = shell(r#"read -r url; printf 'http://s.io/1  \r\n'"#);
        let mut session = HelperSession::open(&config).unwrap();

        assert_eq!(session.request("http://example.com/x").unwrap(), "http://s.io/1");
    }

    #[test]
    fn test_missing_prefix_is_unavailable() {
        let config = shell("while read -r url; do echo 'error: quota exceeded'; done");
        let mut session = HelperSession::open(&config).unwrap();

        assert_eq!(
            session.request("http://example.com/x"),
            Err(ShortenFailure::MissingPrefix { prefix: "http://".to_string() })
        );
    }

    #[test]
    fn test_custom_prefix() {
        let config = HelperConfig {
            response_prefix: "https://".to_string(),
            ..shell("read -r a; echo http://s.io/1; read -r b; echo https://s.io/2")
        };
        let mut session = HelperSession::open(&config).unwrap();

        assert!(session.request("http://example.com/x").is_err());
        assert_eq!(session.request("http://example.com/y").unwrap(), "https://s.io/2");
    }

    #[test]
    fn test_spawn_failure() {
        let config = HelperConfig {
            program: "/nonexistent/bti-shrink-urls".to_string(),
            ..HelperConfig::default()
        };

        let error = HelperSession::open(&config).err().unwrap();

        assert_eq!(error.program, "/nonexistent/bti-shrink-urls");
        assert_eq!(error.source.kind(), std::io::ErrorKind::NotFound);
    }

    #[test]
    fn test_helper_exit_is_disconnect() {
        let config = shell("exit 3");
        let mut session = HelperSession::open(&config).unwrap();

        assert_eq!(session.request("http://example.com/x"), Err(ShortenFailure::Disconnected));

        let status = session.close().unwrap();
        assert_eq!(status.code(), Some(3));
    }

    #[test]
    fn test_stderr_is_drained() {
        // Enough diagnostics to fill a pipe buffer if nobody read them.
        let config = shell(
            r#"while read -r url; do
                 i=0; while [ $i -lt 5000 ]; do echo "diagnostic line $i" >&2; i=$((i+1)); done
                 echo http://s.io/ok
               done"#,
        );
        let mut session = HelperSession::open(&config).unwrap();

        assert_eq!(session.request("http://example.com/x").unwrap(), "http://s.io/ok");
        assert_eq!(session.request("http://example.com/y").unwrap(), "http://s.io/ok");
    }

    #[test]
    fn test_timeout_desynchronizes_session() {
        let config = HelperConfig {
            timeout: Duration::from_millis(200),
            ..shell("read -r url; exec sleep 30")
        };
        let mut session = HelperSession::open(&config).unwrap();

        assert_eq!(
            session.request("http://example.com/x"),
            Err(ShortenFailure::Timeout(Duration::from_millis(200)))
        );
        assert_eq!(session.request("http://example.com/y"), Err(ShortenFailure::Desynchronized));

        let started = Instant::now();
        let status = session.close().unwrap();
        assert!(!status.success());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_close_kills_lingering_helper() {
        let config = HelperConfig {
            close_grace: Duration::from_millis(100),
            ..shell("exec sleep 30")
        };
        let session = HelperSession::open(&config).unwrap();

        let started = Instant::now();
        let status = session.close().unwrap();
        assert!(!status.success());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_oversized_response() {
        let config = HelperConfig {
            max_response_len: 16,
            ..shell("read -r a; echo http://way-too-long.example/xyz; read -r b; echo http://s.io/1")
        };
        let mut session = HelperSession::open(&config).unwrap();

        assert_eq!(
            session.request("http://example.com/x"),
            Err(ShortenFailure::Oversized { limit: 16 })
        );
        assert_eq!(session.request("http://example.com/y").unwrap(), "http://s.io/1");
    }

    #[test]
    fn test_drop_reaps_helper() {
        let config = HelperConfig {
            close_grace: Duration::from_millis(100),
            ..shell("exec sleep 30")
        };
        let session = HelperSession::open(&config).unwrap();
        let pid = session.id().unwrap();

        let started = Instant::now();
        drop(session);

        assert!(started.elapsed() < Duration::from_secs(10));
        #[cfg(target_os = "linux")]
        assert!(!std::path::Path::new(&format!("/proc/{pid}")).exists());
        let _ = pid;
    }

    #[tokio::test]
    async fn test_read_capped_line() {
        let mut reader: &[u8] = b"short\nexactly-8\n12345678\nlast";

        let mut lines = Vec::new();
        while let Some(line) = read_capped_line(&mut reader, 8).await.unwrap() {
            lines.push(match line {
                Line::Complete(bytes) => Some(String::from_utf8(bytes).unwrap()),
                Line::Oversized => None,
            });
        }

        assert_eq!(
            lines,
            vec![
                Some("short".to_string()),
                None,
                Some("12345678".to_string()),
                Some("last".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_read_capped_line_unlimited() {
        let mut reader: &[u8] = b"http://s.io/1\n";

        let line = read_capped_line(&mut reader, usize::MAX).await.unwrap();

        assert!(matches!(line, Some(Line::Complete(bytes)) if bytes == b"http://s.io/1"));
        assert!(read_capped_line(&mut reader, usize::MAX).await.unwrap().is_none());
    }
}
