#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! The data-plane engine binary: watches routing-table partitions for one
//! target and answers the gateway's per-request processing stream.

mod snapshot;

use anyhow::{bail, Result};
use clap::Parser;
use customrouter_grpc::ExtProcServer;
use customrouter_k8s_api::{ConfigMap, MANAGED_BY_LABEL, MANAGED_BY_VALUE, TARGET_LABEL};
use futures::prelude::*;
use kube::runtime::watcher;
use std::net::SocketAddr;
use tokio::time::Duration;
use tonic::transport::Server;
use tracing::{info, info_span, instrument, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "customrouter-extproc", about = "Routing external processor")]
struct Args {
    #[clap(
        long,
        default_value = "customrouter=info,warn",
        env = "CUSTOMROUTER_EXTPROC_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Address the gRPC server listens on.
    #[clap(long, default_value = "0.0.0.0:9001")]
    listen: SocketAddr,

    /// Target name; only partitions labeled with it are loaded.
    #[clap(long)]
    target: String,

    /// Namespace to read partitions from; empty means all namespaces.
    #[clap(long, default_value = "")]
    partition_namespace: String,

    /// Emit a structured access log line per processed request.
    #[clap(long, action = clap::ArgAction::Set, default_value = "true")]
    access_log: bool,

    /// Force debug-level logging.
    #[clap(long)]
    debug: bool,

    #[clap(long, default_value = "4194304")]
    grpc_max_recv_bytes: usize,

    #[clap(long, default_value = "4194304")]
    grpc_max_send_bytes: usize,

    #[clap(long, default_value = "1000")]
    grpc_max_concurrent_streams: u32,

    #[clap(long, default_value = "30s")]
    grpc_keepalive_time: TimeArg,

    #[clap(long, default_value = "10s")]
    grpc_keepalive_timeout: TimeArg,

    /// Accepted for drop-in compatibility; tonic's HTTP/2 server does not
    /// enforce an idle cutoff.
    #[clap(long, default_value = "5m")]
    grpc_max_connection_idle: TimeArg,

    #[clap(long, default_value = "30m")]
    grpc_max_connection_age: TimeArg,

    /// Accepted for drop-in compatibility; see --grpc-max-connection-idle.
    #[clap(long, default_value = "10s")]
    grpc_max_connection_age_grace: TimeArg,
}

#[tokio::main]
async fn main() -> Result<()> {
    let Args {
        mut log_level,
        log_format,
        client,
        admin,
        listen,
        target,
        partition_namespace,
        access_log,
        debug,
        grpc_max_recv_bytes,
        grpc_max_send_bytes,
        grpc_max_concurrent_streams,
        grpc_keepalive_time,
        grpc_keepalive_timeout,
        grpc_max_connection_idle,
        grpc_max_connection_age,
        grpc_max_connection_age_grace,
    } = Args::parse();

    if target.is_empty() {
        bail!("--target must not be empty");
    }
    if debug {
        log_level = "customrouter=debug,debug"
            .parse()
            .expect("debug log filter must parse");
    }

    let mut runtime = kubert::Runtime::builder()
        .with_log(log_level, log_format)
        .with_admin(admin)
        .with_client(client)
        .build()
        .await?;

    tracing::warn!(
        idle = %grpc_max_connection_idle,
        age_grace = %grpc_max_connection_age_grace,
        "--grpc-max-connection-idle and --grpc-max-connection-age-grace are not enforced"
    );

    // Watch this target's partitions and keep a compiled snapshot published.
    let (snapshots, handle) = snapshot::Index::shared();
    let selector = format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE},{TARGET_LABEL}={target}");
    let params = watcher::Config::default().labels(&selector);
    if partition_namespace.is_empty() {
        let partitions = runtime.watch_all::<ConfigMap>(params);
        tokio::spawn(
            kubert::index::namespaced(snapshots, partitions).instrument(info_span!("partitions")),
        );
    } else {
        let partitions = runtime.watch_namespaced::<ConfigMap>(&partition_namespace, params);
        tokio::spawn(
            kubert::index::namespaced(snapshots, partitions).instrument(info_span!("partitions")),
        );
    }

    let server = tokio::spawn(grpc(
        listen,
        handle,
        access_log,
        grpc_max_recv_bytes,
        grpc_max_send_bytes,
        grpc_max_concurrent_streams,
        grpc_keepalive_time.0,
        grpc_keepalive_timeout.0,
        grpc_max_connection_age.0,
        runtime.shutdown_handle(),
    ));

    // Block on the shutdown signal, then wait for in-flight streams to
    // drain. A server failure (e.g. the listen address is already bound)
    // must also take the process down, non-zero.
    tokio::select! {
        res = runtime.run() => {
            if res.is_err() {
                bail!("Aborted");
            }
        }
        res = server => match res {
            Ok(Ok(())) => {}
            Ok(Err(error)) => return Err(error),
            Err(error) => bail!("gRPC server task failed: {error}"),
        },
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, fields(port = %addr.port()))]
async fn grpc(
    addr: SocketAddr,
    handle: snapshot::SnapshotHandle,
    access_log: bool,
    max_recv_bytes: usize,
    max_send_bytes: usize,
    max_concurrent_streams: u32,
    keepalive_time: Duration,
    keepalive_timeout: Duration,
    max_connection_age: Duration,
    drain: drain::Watch,
) -> Result<()> {
    let svc = ExtProcServer::new(handle, access_log, drain.clone())
        .svc()
        .max_decoding_message_size(max_recv_bytes)
        .max_encoding_message_size(max_send_bytes);

    let (close_tx, close_rx) = tokio::sync::oneshot::channel();
    tokio::pin! {
        let srv = Server::builder()
            .max_concurrent_streams(Some(max_concurrent_streams))
            .http2_keepalive_interval(Some(keepalive_time))
            .http2_keepalive_timeout(Some(keepalive_timeout))
            .max_connection_age(max_connection_age)
            .add_service(svc)
            .serve_with_shutdown(addr, close_rx.map(|_| {}));
    }

    info!(%addr, "ext_proc gRPC server listening");
    tokio::select! {
        res = (&mut srv) => res?,
        handle = drain.signaled() => {
            let _ = close_tx.send(());
            handle.release_after(srv).await?
        }
    }
    Ok(())
}

/// A duration flag accepting the `30s` / `5m` forms the attachment API uses.
#[derive(Copy, Clone, Debug)]
struct TimeArg(Duration);

impl std::fmt::Display for TimeArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl std::str::FromStr for TimeArg {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let offset = s
            .rfind(|c: char| c.is_ascii_digit())
            .ok_or_else(|| anyhow::anyhow!("{s} does not contain a duration value"))?;
        let (magnitude, unit) = s.split_at(offset + 1);
        let magnitude = magnitude.parse::<u64>()?;

        let mul = match unit {
            "" if magnitude == 0 => 0,
            "ms" => 1,
            "s" => 1000,
            "m" => 1000 * 60,
            "h" => 1000 * 60 * 60,
            _ => bail!("invalid duration unit {unit} (expected 'ms', 's', 'm', or 'h')"),
        };

        let ms = magnitude
            .checked_mul(mul)
            .ok_or_else(|| anyhow::anyhow!("duration {s} overflows when converted to ms"))?;
        Ok(Self(Duration::from_millis(ms)))
    }
}
