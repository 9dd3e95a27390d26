//! polyserv binary: CLI parsing, signal handling, server lifecycle.
//!
//! SIGINT/SIGTERM request coordinated shutdown through the
//! [`ShutdownCoordinator`]; a second signal exits immediately. SIGPIPE is
//! ignored so a peer closing mid-write surfaces as an I/O error instead of
//! killing the process.

use clap::error::ErrorKind;
use clap::{ArgAction, Parser};
use polyserv_core::{LogLevel, Logger, ServerConfig, ShutdownCoordinator};
use polyserv_http::Server;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// polyserv — HTTP/1.1, HTTP/2 and WebSocket from a single port.
#[derive(Parser, Debug)]
#[command(name = "polyserv", version, about)]
struct Cli {
    /// Listen port.
    #[arg(short = 'p', long = "port", default_value_t = 8080)]
    port: u16,

    /// Static file root.
    #[arg(short = 'd', long = "docroot", default_value = "./www")]
    docroot: PathBuf,

    /// Worker pool size.
    #[arg(short = 't', long = "threads", default_value_t = 4)]
    threads: usize,

    /// Enable keep-alive (the default).
    #[arg(short = 'k', long = "keep-alive", action = ArgAction::SetTrue)]
    keep_alive: bool,

    /// Disable keep-alive.
    #[arg(long = "no-keep-alive", action = ArgAction::SetTrue, conflicts_with = "keep_alive")]
    no_keep_alive: bool,

    /// Keep-alive idle timeout in seconds.
    #[arg(short = 'T', long = "timeout", default_value_t = 5)]
    timeout: u64,

    /// Disable HTTP/2 (preface detection and ALPN h2).
    #[arg(long = "no-http2", action = ArgAction::SetTrue)]
    no_http2: bool,

    /// TLS certificate file (PEM); enables TLS together with --tls-key.
    #[arg(long = "tls-cert", requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// TLS private key file (PEM).
    #[arg(long = "tls-key", requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Verbose (debug) logging.
    #[arg(short = 'v', long = "verbose", action = ArgAction::SetTrue)]
    verbose: bool,
}

/// Signals received so far; written from the signal handler.
static SIGNAL_COUNT: AtomicU32 = AtomicU32::new(0);

extern "C" fn handle_signal(_signal: libc::c_int) {
    // Only async-signal-safe operations here.
    let previous = SIGNAL_COUNT.fetch_add(1, Ordering::SeqCst);
    if previous >= 1 {
        unsafe { libc::_exit(1) };
    }
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(
            libc::SIGINT,
            handle_signal as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGTERM,
            handle_signal as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

/// Route the first received signal into a coordinated shutdown.
fn spawn_signal_watcher(coordinator: ShutdownCoordinator) {
    let inner = coordinator.clone();
    let handle = std::thread::spawn(move || {
        loop {
            if SIGNAL_COUNT.load(Ordering::SeqCst) > 0 {
                inner.request_shutdown();
                break;
            }
            if inner.wait_for_shutdown(Duration::from_millis(100)) {
                break;
            }
        }
        inner.thread_exiting();
    });
    coordinator.register_thread(handle);
}

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => {
            let code = match error.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = error.print();
            return code;
        }
    };

    let keep_alive = cli.keep_alive || !cli.no_keep_alive;
    let mut config = ServerConfig::new()
        .with_port(cli.port)
        .with_document_root(&cli.docroot)
        .with_worker_threads(cli.threads)
        .with_keep_alive(keep_alive, Duration::from_secs(cli.timeout))
        .with_http2(!cli.no_http2);
    if let (Some(cert), Some(key)) = (&cli.tls_cert, &cli.tls_key) {
        config = config.with_tls(cert, key);
    }

    if let Err(error) = config.validate() {
        eprintln!("Error: {error}");
        return 1;
    }

    let logger = Logger::new(if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    });
    let coordinator = ShutdownCoordinator::new();

    install_signal_handlers();
    spawn_signal_watcher(coordinator.clone());

    let server = match Server::bind(config, coordinator, logger.clone()) {
        Ok(server) => Arc::new(server),
        Err(error) => {
            eprintln!("Failed to initialize server: {error}");
            return 1;
        }
    };

    logger.info(format!(
        "server ready at http://localhost:{} (Ctrl+C to stop)",
        cli.port
    ));

    server.run();
    server.shutdown();
    0
}
