use crate::config::Config;
use crate::download::hash_tree::ContentHash;
use crate::download::mesh::sources_from_alts;
use crate::download::protocol::{GivLine, MAX_LINE_LEN, parse_giv_line};
use crate::download::service::{DownloadServiceConfig, DownloadServiceHandle, NewDownload};
use crate::download::session::{AutoDecision, SessionDeps};
use crate::logging::{human_bytes, redact_hex, warn_throttled};
use crate::net::TcpConnector;
use crate::single_instance::SingleInstanceLock;
use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::Duration;

const GIV_TIMEOUT: Duration = Duration::from_secs(10);
const PROGRESS_EVERY: Duration = Duration::from_secs(30);

/// `get <name> <size> <urn|-> <host:port>...` from the command line.
pub fn parse_get_args(args: &[String]) -> anyhow::Result<Option<NewDownload>> {
    let Some((cmd, rest)) = args.split_first() else {
        return Ok(None);
    };
    if cmd != "get" {
        anyhow::bail!("unknown command '{cmd}' (expected: get <name> <size> <urn|-> <host:port>...)");
    }
    let [name, size, urn, hosts @ ..] = rest else {
        anyhow::bail!("usage: get <name> <size> <urn|-> <host:port>...");
    };
    let file_size: u64 = size
        .parse()
        .with_context(|| format!("invalid file size '{size}'"))?;
    let content_hash = match urn.as_str() {
        "-" => None,
        other => Some(
            ContentHash::parse_urn(other).with_context(|| format!("invalid content urn '{other}'"))?,
        ),
    };
    let sources = sources_from_alts(hosts, name, file_size, content_hash)
        .into_iter()
        .map(|mut s| {
            s.from_alt_location = false;
            s
        })
        .collect::<Vec<_>>();
    if sources.len() != hosts.len() {
        anyhow::bail!("every source must be given as host:port");
    }
    Ok(Some(NewDownload {
        file_name: name.clone(),
        file_size,
        content_hash,
        sources,
        start: true,
    }))
}

pub async fn run(config: Config, requests: Vec<NewDownload>) -> anyhow::Result<()> {
    tracing::info!(
        log = %config.general.log_level,
        data_dir = %config.general.data_dir,
        "starting app"
    );
    let data_dir = PathBuf::from(&config.general.data_dir);
    let lock = SingleInstanceLock::acquire(data_dir.join("rust-swarm.lock"))?;
    tracing::debug!(lock = %lock.path().display(), "acquired data dir lock");

    let mut svc_cfg = DownloadServiceConfig::from_data_dir(&data_dir);
    svc_cfg.persist_every = Duration::from_secs(config.service.persist_every_secs.max(1));
    svc_cfg.auto_resume = config.service.auto_resume;
    svc_cfg.session = config.session_config();

    let mut deps = SessionDeps::new(Arc::new(TcpConnector));
    deps.limiters = config.rate_limiters();
    deps.slots = Arc::new(Semaphore::new(config.transfer.max_connections.max(1)));
    deps.handler = Arc::new(AutoDecision {
        keep_corrupt: config.service.keep_corrupt,
    });

    let (handle, mut status_rx, join) = crate::download::start_service(svc_cfg, deps)
        .await
        .context("failed to start download service")?;
    tracing::info!(
        recovered = status_rx.borrow().recovered_on_start,
        "download service started"
    );

    for req in requests {
        let name = req.file_name.clone();
        let id = handle.add(req).await.context("failed to add download")?;
        tracing::info!(download = %id, file = %name, "download queued");
    }

    let push_task = if config.transfer.listen_port != 0 {
        let listener = TcpListener::bind(("0.0.0.0", config.transfer.listen_port))
            .await
            .with_context(|| format!("failed to listen on port {}", config.transfer.listen_port))?;
        tracing::info!(port = config.transfer.listen_port, "accepting push connections");
        Some(tokio::spawn(accept_pushes(listener, handle.clone())))
    } else {
        None
    };

    tracing::info!("press Ctrl+C to stop");
    let mut progress = tokio::time::interval(PROGRESS_EVERY);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received Ctrl+C");
                break;
            }
            _ = progress.tick() => {
                log_progress(&handle).await;
            }
            changed = status_rx.changed() => {
                if changed.is_err() || !status_rx.borrow().running {
                    tracing::warn!("download service stopped");
                    break;
                }
            }
        }
    }

    if let Some(task) = push_task {
        task.abort();
    }
    if let Err(err) = handle.shutdown().await {
        tracing::debug!(error = %err, "download service already gone");
    }
    join.await.context("download service task failed")??;
    tracing::info!("shut down gracefully");
    Ok(())
}

async fn log_progress(handle: &DownloadServiceHandle) {
    let Ok(list) = handle.list().await else {
        return;
    };
    for st in list.iter().filter(|s| s.state.is_active()) {
        tracing::info!(
            download = %st.id,
            file = %st.file_name,
            state = ?st.state,
            verified = %human_bytes(st.blocks.verified),
            size = %human_bytes(st.file_size),
            workers = st.workers.total(),
            sources = st.sources.known(),
            rate = %format!("{}/s", human_bytes(st.bandwidth as u64)),
            eta_secs = st.eta_secs,
            "progress"
        );
    }
}

async fn accept_pushes(listener: TcpListener, handle: DownloadServiceHandle) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                if warn_throttled("push_accept", Duration::from_secs(30)) {
                    tracing::warn!(error = %err, "accept failed");
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
                continue;
            }
        };
        let handle = handle.clone();
        tokio::spawn(async move {
            let (giv, stream) = match read_giv(stream).await {
                Ok(parsed) => parsed,
                Err(err) => {
                    tracing::debug!(%peer, error = %err, "rejected inbound connection");
                    return;
                }
            };
            let id = redact_hex(&giv.source_id);
            match handle
                .inbound_push(giv.file_name, giv.file_index, giv.source_id, Box::new(stream))
                .await
            {
                Ok(true) => tracing::debug!(%peer, source_id = %id, "push connection matched"),
                Ok(false) => tracing::debug!(%peer, source_id = %id, "no download waiting for push"),
                Err(err) => tracing::debug!(%peer, error = %err, "push not delivered"),
            }
        });
    }
}

/// Reads the GIV line and the blank line after it, byte by byte so that
/// nothing past the greeting is consumed.
async fn read_giv(mut stream: TcpStream) -> anyhow::Result<(GivLine, TcpStream)> {
    let mut line = Vec::with_capacity(128);
    let read = async {
        let mut byte = [0u8; 1];
        loop {
            stream.read_exact(&mut byte).await?;
            if byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
            if line.len() > MAX_LINE_LEN {
                anyhow::bail!("GIV line too long");
            }
        }
        stream.read_exact(&mut byte).await?;
        if byte[0] == b'\r' {
            stream.read_exact(&mut byte).await?;
        }
        anyhow::Ok(())
    };
    tokio::time::timeout(GIV_TIMEOUT, read)
        .await
        .context("timed out waiting for GIV")??;
    let text = String::from_utf8(line).context("GIV line is not UTF-8")?;
    let giv = parse_giv_line(&text)?;
    Ok((giv, stream))
}
