use std::collections::BTreeMap;
use std::env;
use std::io::Write;
use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use axum::Router;
use axum::routing::post;
use imagecache::metrics;
use tokio::task::JoinSet;
use tracing_subscriber::fmt::fmt;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;

const LOCALHOST: ([u8; 4], u16) = ([127, 0, 0, 1], 0);

#[derive(Debug, Default)]
pub struct Config {
    pub backtraces: bool,
    pub sentry: bool,
    pub tracing: bool,
    pub metrics: bool,
}

/// Number of payloads the local sinks received.
#[derive(Debug, Default)]
pub struct SinkCounters {
    pub envelopes: AtomicUsize,
    pub packets: AtomicUsize,
}

/// Local endpoints that swallow everything sentry and statsd send.
///
/// The listeners are bound eagerly, but only start accepting once [`Sinks::spawn`] is called from
/// within a runtime.
#[derive(Default)]
pub struct Sinks {
    _sentry: Option<sentry::ClientInitGuard>,
    envelopes: Option<TcpListener>,
    statsd: Option<UdpSocket>,
    pub counters: Arc<SinkCounters>,
}

impl Sinks {
    /// Starts serving the bound sinks on the current runtime.
    pub fn spawn(&mut self, tasks: &mut JoinSet<()>) -> Result<()> {
        if let Some(listener) = self.envelopes.take() {
            let listener = tokio::net::TcpListener::from_std(listener)?;
            let counters = Arc::clone(&self.counters);
            let router = Router::new().route(
                "/api/:project/envelope/",
                post(move || {
                    counters.envelopes.fetch_add(1, Ordering::Relaxed);
                    async { "OK" }
                }),
            );
            tasks.spawn(async move {
                if let Err(error) = axum::serve(listener, router).await {
                    eprintln!("sentry sink failed: {error}");
                }
            });
        }

        if let Some(socket) = self.statsd.take() {
            let socket = tokio::net::UdpSocket::from_std(socket)?;
            let counters = Arc::clone(&self.counters);
            tasks.spawn(async move {
                let mut buf = Vec::with_capacity(1024);
                loop {
                    buf.clear();
                    if socket.recv_buf(&mut buf).await.is_err() {
                        break;
                    }
                    counters.packets.fetch_add(1, Ordering::Relaxed);
                }
            });
        }

        Ok(())
    }
}

/// Sets up sentry, logging and metrics, each reporting into a local sink.
///
/// # Safety
/// This function uses [`std::env::set_var`], and may only be called while the process is still
/// single-threaded.
pub unsafe fn init(config: Config) -> Result<Sinks> {
    if config.backtraces {
        // SAFETY: As documented, this function may only be called in a single-threaded context.
        unsafe { env::set_var("RUST_BACKTRACE", "1") };
    }

    let mut sinks = Sinks::default();

    if config.sentry {
        let listener = TcpListener::bind(SocketAddr::from(LOCALHOST))?;
        listener.set_nonblocking(true)?;
        sinks._sentry = Some(init_sentry(listener.local_addr()?));
        sinks.envelopes = Some(listener);
    }

    if config.tracing {
        init_tracing();
    }

    if config.metrics {
        let socket = UdpSocket::bind(SocketAddr::from(LOCALHOST))?;
        socket.set_nonblocking(true)?;
        init_metrics(socket.local_addr()?)?;
        sinks.statsd = Some(socket);
    }

    Ok(sinks)
}

fn init_sentry(sink: SocketAddr) -> sentry::ClientInitGuard {
    let dsn = format!("http://stresstest@{sink}/1");

    sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            traces_sample_rate: 1.0,
            ..Default::default()
        },
    ))
}

/// Activates JSON logging at debug level for the cache, discarding the output.
fn init_tracing() {
    fmt()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .with_env_filter("INFO,imagecache=DEBUG")
        .with_writer(|| NoopWriter)
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_span_list(true)
        .with_file(true)
        .with_line_number(true)
        .finish()
        .with(sentry::integrations::tracing::layer())
        .init();
}

fn init_metrics(sink: SocketAddr) -> Result<()> {
    let mut tags = BTreeMap::new();
    tags.insert("host".into(), "stresstest".into());
    tags.insert("env".into(), "stresstest".into());

    metrics::configure_statsd("imagecache", sink, tags)
}

struct NoopWriter;

impl Write for NoopWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        // keep the formatting from being optimized away
        let buf = std::hint::black_box(buf);

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
