use anyhow::Context;
use clap::Parser;
use librfs::fuse::mount::{mount, mount_unprivileged};
use librfs::{
    ControlDir, ControlFile, Resolver, ResolvingFs, RfsConfig, load_config, spawn_sweeper,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use webrfs::{HttpBackend, Scheme, shutdown_signal};

#[derive(Parser, Debug)]
#[command(author, version, about = "Mount the web as a resolving filesystem", long_about = None)]
struct Args {
    /// Empty directory to mount on
    #[arg(long)]
    mountpoint: String,

    /// YAML engine configuration; defaults apply when omitted
    #[arg(long)]
    config: Option<String>,

    /// Mount directly instead of through fusermount3
    #[arg(long, default_value_t = false)]
    privileged: bool,

    /// Use plain HTTP for paths without a scheme modifier
    #[arg(long, default_value_t = false)]
    plain_http: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => RfsConfig::default(),
    };
    let scheme = if args.plain_http {
        Scheme::Http
    } else {
        Scheme::Https
    };

    let backend = Arc::new(HttpBackend::new(scheme));
    let user_agent: Arc<dyn ControlFile> = Arc::new(backend.user_agent_file());
    let resolver = Arc::new(Resolver::new(backend, &config));
    let sweeper = spawn_sweeper(resolver.clone(), config.sweep_interval());
    let control = ControlDir::new(resolver.clone(), vec![user_agent]);
    let fs = ResolvingFs::new(resolver, control);

    let mut mount_handle = if args.privileged {
        mount(fs, &args.mountpoint, &config).await
    } else {
        mount_unprivileged(fs, &args.mountpoint, &config).await
    }
    .with_context(|| format!("Failed to mount on {}", args.mountpoint))?;
    info!("webrfs mounted on {}", args.mountpoint);

    let shutdown = shutdown_signal()?;
    let handle = &mut mount_handle;
    tokio::select! {
        res = handle => res.context("FUSE session ended with an error")?,
        res = shutdown => {
            let name = res?;
            info!("received {name}, unmounting {}", args.mountpoint);
            mount_handle.unmount().await.context("Failed to unmount")?;
        }
    }

    sweeper.shutdown().await;
    Ok(())
}

