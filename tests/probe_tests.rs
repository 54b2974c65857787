use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use ci_scan_rs::error::ProbeError;
use ci_scan_rs::probe::{CheckOutcome, HttpCheck, Prober, ReadinessCheck, TcpCheck};
use ci_scan_rs::target::{ProbeTarget, Scheme};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::Instant;

/// Fails until attempt `succeed_on` (1-based), counting every call.
struct Scripted {
    calls: AtomicU32,
    succeed_on: Option<u32>,
    delay: Duration,
}

impl Scripted {
    fn failing() -> Self {
        Self { calls: AtomicU32::new(0), succeed_on: None, delay: Duration::ZERO }
    }

    fn succeeding_on(n: u32) -> Self {
        Self { calls: AtomicU32::new(0), succeed_on: Some(n), delay: Duration::ZERO }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ReadinessCheck for Scripted {
    async fn check(&self, _target: &ProbeTarget) -> CheckOutcome {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if Some(n) == self.succeed_on {
            CheckOutcome::Reachable(format!("attempt {n}"))
        } else {
            CheckOutcome::NotReady("connection refused".into())
        }
    }
}

fn target(url: &str) -> ProbeTarget {
    ProbeTarget::from_url(url, Duration::from_millis(500)).unwrap()
}

#[tokio::test(start_paused = true)]
async fn never_listening_target_times_out_after_two_attempts() {
    let check = Scripted::failing();
    let prober = Prober::new(Duration::from_secs(3), Duration::from_secs(6));
    let start = Instant::now();

    let err = prober
        .wait_until_ready(&check, &target("http://127.0.0.1:9"))
        .await
        .unwrap_err();

    let waited = start.elapsed();
    assert_eq!(check.calls(), 2);
    assert!(waited >= Duration::from_secs(6), "raised early: {waited:?}");
    assert!(waited < Duration::from_secs(9), "raised late: {waited:?}");
    match &err {
        ProbeError::TimedOut { endpoint, attempts, .. } => {
            assert_eq!(endpoint, "127.0.0.1:9");
            assert_eq!(*attempts, 2);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains("127.0.0.1:9"));
}

#[tokio::test(start_paused = true)]
async fn timeout_bound_holds_for_uneven_interval() {
    let check = Scripted::failing();
    let prober = Prober::new(Duration::from_secs(4), Duration::from_secs(10));
    let start = Instant::now();
    assert!(prober.wait_until_ready(&check, &target("http://t:1")).await.is_err());
    let waited = start.elapsed();
    // attempts at 0, 4, 8
    assert_eq!(check.calls(), 3);
    assert!(waited >= Duration::from_secs(10) && waited < Duration::from_secs(14));
}

#[tokio::test(start_paused = true)]
async fn slow_check_is_cut_at_deadline() {
    let check = Scripted {
        delay: Duration::from_secs(60),
        ..Scripted::failing()
    };
    let prober = Prober::new(Duration::from_secs(3), Duration::from_secs(6));
    let start = Instant::now();
    assert!(prober.wait_until_ready(&check, &target("http://t:1")).await.is_err());
    assert_eq!(check.calls(), 1);
    assert_eq!(start.elapsed(), Duration::from_secs(6));
}

#[tokio::test(start_paused = true)]
async fn stops_probing_after_first_success() {
    let check = Scripted::succeeding_on(3);
    let prober = Prober::new(Duration::from_secs(3), Duration::from_secs(60));
    let start = Instant::now();

    let report = prober.wait_until_ready(&check, &target("http://t:1")).await.unwrap();

    assert_eq!(report.attempts, 3);
    assert_eq!(report.detail, "attempt 3");
    assert_eq!(start.elapsed(), Duration::from_secs(6));
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(check.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn zero_wait_times_out_without_probing() {
    let check = Scripted::succeeding_on(1);
    let prober = Prober::new(Duration::from_secs(3), Duration::ZERO);
    let err = prober.wait_until_ready(&check, &target("http://t:1")).await.unwrap_err();
    assert!(matches!(err, ProbeError::TimedOut { attempts: 0, .. }));
    assert_eq!(check.calls(), 0);
}

async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn tcp_check_against_live_and_closed_ports() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let live = target(&format!("http://127.0.0.1:{port}"));
    assert!(matches!(TcpCheck.check(&live).await, CheckOutcome::Reachable(_)));

    let closed = target(&format!("http://127.0.0.1:{}", closed_port().await));
    assert!(matches!(TcpCheck.check(&closed).await, CheckOutcome::NotReady(_)));
}

#[tokio::test]
async fn http_check_accepts_any_status() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 512];
        let _ = sock.read(&mut buf).await;
        let _ = sock
            .write_all(b"HTTP/1.1 401 Unauthorized\r\nContent-Length: 0\r\n\r\n")
            .await;
    });

    let check = HttpCheck::new(Scheme::Http).unwrap();
    let outcome = check.check(&target(&format!("http://127.0.0.1:{port}"))).await;
    assert_eq!(
        outcome,
        CheckOutcome::Reachable("HTTP/1.1 401 Unauthorized".into())
    );
}

#[tokio::test]
async fn http_check_needs_an_answer() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        // accept and hang up, like a port proxy with no backend yet
        let (sock, _) = listener.accept().await.unwrap();
        drop(sock);
    });

    let check = HttpCheck::new(Scheme::Http).unwrap();
    let outcome = check.check(&target(&format!("http://127.0.0.1:{port}"))).await;
    assert!(matches!(outcome, CheckOutcome::NotReady(_)), "{outcome:?}");
}

#[tokio::test]
async fn prober_with_real_check_reports_ready() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let prober = Prober::new(Duration::from_millis(100), Duration::from_secs(5));
    let report = prober
        .wait_until_ready(&TcpCheck, &target(&format!("http://127.0.0.1:{port}")))
        .await
        .unwrap();
    assert_eq!(report.attempts, 1);
}

#[cfg(unix)]
mod diagnostics {
    use std::fs;
    use std::io::{self, Write};
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};

    use ci_scan_rs::config::{RunContext, Settings};
    use ci_scan_rs::error::ProbeError;
    use ci_scan_rs::probe::wait_for_target;
    use ci_scan_rs::runtime::ContainerRuntime;
    use clap::Parser;

    /// Log sink shared with the test body.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Stand-in runtime: every network is missing, `run` fails like an unreachable target and
    /// `logs` prints `logs_body` and exits with `logs_exit`.
    fn fake_runtime(dir: &Path, logs_body: &str, logs_exit: i32) -> PathBuf {
        let script = dir.join("fake-docker");
        let body = format!(
            "#!/bin/sh\n\
             echo \"$@\" >> '{calls}'\n\
             case \"$1\" in\n\
               network) echo \"Error: network $3 not found\" >&2; exit 1 ;;\n\
               logs) printf '%s' '{logs_body}'; exit {logs_exit} ;;\n\
               *) exit 7 ;;\n\
             esac\n",
            calls = dir.join("calls.txt").display(),
        );
        fs::write(&script, body).unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    fn ctx(runtime: &Path) -> RunContext {
        let settings = Settings::try_parse_from([
            "ci-scan-rs",
            "--target-url",
            "http://webapp:5000",
            "--network",
            "ci_net",
            "--readiness-timeout-secs",
            "1",
            "--probe-interval-secs",
            "1",
            "--log-tail",
            "5",
            "--runtime",
            runtime.to_str().unwrap(),
        ])
        .unwrap();
        RunContext::from_settings_in(settings, Path::new("/work")).unwrap()
    }

    #[tokio::test]
    async fn timeout_prints_service_logs_between_banners() {
        let dir = tempfile::tempdir().unwrap();
        let fake = fake_runtime(dir.path(), "booting\npanic: db unreachable\n", 0);
        let ctx = ctx(&fake);
        let logs = Captured::default();
        let sink = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || sink.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let runtime = ContainerRuntime::new(fake.to_str().unwrap());
        let mut out = Vec::new();
        let err = wait_for_target(&ctx, &runtime, &mut out).await.unwrap_err();

        assert!(
            matches!(err, ProbeError::TimedOut { ref endpoint, .. } if endpoint == "webapp:5000"),
            "{err}"
        );

        let out = String::from_utf8(out).unwrap();
        let start = out.find("--- last 5 log lines of webapp ---").expect(&out);
        let end = out.find("--- end of webapp logs ---").expect(&out);
        assert!(start < end);
        assert_eq!(
            &out[start..end],
            "--- last 5 log lines of webapp ---\nbooting\npanic: db unreachable\n"
        );

        let calls = fs::read_to_string(dir.path().join("calls.txt")).unwrap();
        assert!(calls.starts_with("network inspect ci_net\n"), "{calls}");
        assert!(calls.contains("logs --tail 5 webapp"), "{calls}");

        let logged = logs.text();
        assert!(logged.contains("network does not exist"), "{logged}");
        assert!(logged.contains("ci_net"), "{logged}");
    }

    #[tokio::test]
    async fn failing_logs_call_keeps_the_timeout_error() {
        let dir = tempfile::tempdir().unwrap();
        let fake = fake_runtime(dir.path(), "Error: No such container: webapp", 1);
        let ctx = ctx(&fake);

        let runtime = ContainerRuntime::new(fake.to_str().unwrap());
        let mut out = Vec::new();
        let err = wait_for_target(&ctx, &runtime, &mut out).await.unwrap_err();

        assert!(matches!(err, ProbeError::TimedOut { .. }), "{err}");
        let out = String::from_utf8(out).unwrap();
        assert!(!out.contains("--- last"), "{out}");
        assert!(out.contains("Waiting up to 1s for http://webapp:5000"));
    }
}
