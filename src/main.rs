use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use skylift::config::{CliConfig, ClientConfig, FileConfig};
use skylift::progress::{ChannelSink, NullSink, ProgressSink, TransferEvent};
use skylift::Client;

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
#[command(version = concat!(env!("CARGO_PKG_VERSION"), "-", env!("GIT_HASH")))]
struct CliArgs {
    /// Platform API endpoint.
    #[clap(long)]
    pub api_url: Option<String>,

    /// Storage service endpoint; derived from the API URL when omitted.
    #[clap(long)]
    pub storage_url: Option<String>,

    /// Blob service endpoint; derived from the API URL when omitted.
    #[clap(long)]
    pub blob_url: Option<String>,

    /// Vcluster service endpoint.
    #[clap(long)]
    pub vcluster_url: Option<String>,

    /// Bearer token for the platform.
    #[clap(long)]
    pub token: Option<String>,

    /// Platform username.
    #[clap(long)]
    pub username: Option<String>,

    /// Cluster to operate in.
    #[clap(long)]
    pub cluster: Option<String>,

    /// Default organization for scoped commands.
    #[clap(long)]
    pub org: Option<String>,

    /// Default project for scoped commands.
    #[clap(long)]
    pub project: Option<String>,

    /// Local state directory (defaults to ~/.skylift).
    #[clap(long, value_parser = parse_path)]
    pub config_dir: Option<PathBuf>,

    /// Fixed trace id to stamp on every request.
    #[clap(long)]
    pub trace_id: Option<String>,

    /// Ask the platform to sample traces for these requests.
    #[clap(long)]
    pub trace_sampled: Option<bool>,

    /// Suppress progress bars.
    #[clap(short, long)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Remote storage operations.
    #[command(subcommand)]
    Storage(StorageCmd),
    /// Blob (object) storage operations.
    #[command(subcommand)]
    Blob(BlobCmd),
    /// Vcluster service accounts.
    #[command(subcommand)]
    Vcluster(VclusterCmd),
    /// Installed apps.
    #[command(subcommand)]
    Apps(AppsCmd),
}

#[derive(Subcommand, Debug)]
enum StorageCmd {
    /// List a directory.
    Ls { path: String },
    /// Show metadata of a file or directory.
    Stat { path: String },
    /// Create a directory.
    Mkdir {
        path: String,
        /// Create missing parents.
        #[clap(short, long)]
        parents: bool,
        /// Do not fail when the directory already exists.
        #[clap(long)]
        exist_ok: bool,
    },
    /// Remove a file or directory tree.
    Rm {
        path: String,
        #[clap(short, long)]
        recursive: bool,
    },
    /// Rename or move.
    Mv { src: String, dst: String },
    /// Upload a local file or directory.
    Upload {
        #[clap(value_parser = parse_path)]
        src: PathBuf,
        dst: String,
        #[clap(short, long)]
        recursive: bool,
        /// Pre-list the destination when copying recursively so up-to-date
        /// files are skipped without per-file requests.
        #[clap(short, long)]
        update: bool,
    },
    /// Download a remote file or directory.
    Download {
        src: String,
        #[clap(value_parser = parse_path)]
        dst: PathBuf,
        #[clap(short, long)]
        recursive: bool,
        /// Pre-list the destination when copying recursively so up-to-date
        /// files are skipped without per-file requests.
        #[clap(short, long)]
        update: bool,
    },
    /// Expand a glob pattern against remote storage.
    Glob { pattern: String },
}

#[derive(Subcommand, Debug)]
enum BlobCmd {
    /// List buckets.
    Buckets,
    /// List objects in a bucket.
    Ls {
        bucket: String,
        #[clap(long)]
        prefix: Option<String>,
        #[clap(short, long)]
        recursive: bool,
    },
    /// Glob over object keys.
    Glob { bucket: String, pattern: String },
    /// Upload a local file or directory into a bucket.
    Upload {
        #[clap(value_parser = parse_path)]
        src: PathBuf,
        bucket: String,
        key: String,
        #[clap(short, long)]
        recursive: bool,
    },
    /// Download an object or key prefix.
    Download {
        bucket: String,
        key: String,
        #[clap(value_parser = parse_path)]
        dst: PathBuf,
        #[clap(short, long)]
        recursive: bool,
    },
    /// Delete an object.
    Rm { bucket: String, key: String },
}

#[derive(Subcommand, Debug)]
enum VclusterCmd {
    /// Mint a service account and store its kubeconfig bundle.
    Create {
        name: String,
        #[clap(long)]
        ttl_days: Option<u64>,
    },
    /// Re-mint credentials for an existing service account.
    Regenerate {
        name: String,
        #[clap(long)]
        ttl_days: Option<u64>,
    },
    /// List service accounts.
    List {
        #[clap(long)]
        all_users: bool,
    },
    /// Delete a service account.
    Delete { name: String },
    /// Merge a stored bundle into the kubeconfig.
    Activate {
        name: String,
        /// Kubeconfig to merge into (defaults to ~/.kube/config).
        #[clap(long, value_parser = parse_path)]
        kube_config: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum AppsCmd {
    /// List installed app instances.
    List,
    /// Uninstall an app instance by id.
    Uninstall { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::WARN.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .unwrap();

    let cli_config = CliConfig {
        api_url: cli_args.api_url.clone(),
        storage_url: cli_args.storage_url.clone(),
        blob_url: cli_args.blob_url.clone(),
        vcluster_url: cli_args.vcluster_url.clone(),
        token: cli_args.token.clone(),
        username: cli_args.username.clone(),
        cluster: cli_args.cluster.clone(),
        org: cli_args.org.clone(),
        project: cli_args.project.clone(),
        config_dir: cli_args.config_dir.clone(),
        trace_id: cli_args.trace_id.clone(),
        trace_sampled: cli_args.trace_sampled,
    };
    let file_config = load_file_config(&cli_config)?;
    let config = ClientConfig::resolve(&cli_config, file_config)?;
    let client = Client::new(config)?;

    let result = run_command(&client, &cli_args).await;
    if let Err(err) = client.close() {
        warn!("failed to persist session state: {err}");
    }
    result
}

fn load_file_config(cli: &CliConfig) -> Result<Option<FileConfig>> {
    let dir = match &cli.config_dir {
        Some(dir) => dir.clone(),
        None => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(".skylift"),
            None => return Ok(None),
        },
    };
    let path = dir.join("config.toml");
    if path.exists() {
        Ok(Some(FileConfig::load(&path)?))
    } else {
        Ok(None)
    }
}

async fn run_command(client: &Client, cli_args: &CliArgs) -> Result<()> {
    match &cli_args.command {
        Command::Storage(cmd) => run_storage(client, cmd, cli_args.quiet).await,
        Command::Blob(cmd) => run_blob(client, cmd, cli_args.quiet).await,
        Command::Vcluster(cmd) => run_vcluster(client, cmd).await,
        Command::Apps(cmd) => run_apps(client, cmd).await,
    }
}

async fn run_storage(client: &Client, cmd: &StorageCmd, quiet: bool) -> Result<()> {
    let storage = client.storage();
    match cmd {
        StorageCmd::Ls { path } => {
            for stat in storage.ls(path).await? {
                let kind = if stat.is_dir() { "d" } else { "-" };
                println!("{kind} {:>12} {}", stat.size, stat.name());
            }
        }
        StorageCmd::Stat { path } => {
            let stat = storage.stats(path).await?;
            println!("path: {}", stat.path);
            println!("size: {}", stat.size);
            println!("type: {}", if stat.is_dir() { "directory" } else { "file" });
            println!("modified: {}", stat.modification_time);
        }
        StorageCmd::Mkdir {
            path,
            parents,
            exist_ok,
        } => {
            storage.mkdir(path, *parents, *exist_ok).await?;
        }
        StorageCmd::Rm { path, recursive } => {
            storage.rm(path, *recursive).await?;
        }
        StorageCmd::Mv { src, dst } => {
            storage.mv(src, dst).await?;
        }
        StorageCmd::Upload {
            src,
            dst,
            recursive,
            update,
        } => {
            let (progress, render) = make_progress(quiet);
            let result = if *recursive {
                storage.upload_dir(src, dst, *update, progress).await
            } else {
                storage.upload_file(src, dst, progress).await
            };
            finish_progress(render).await;
            result?;
        }
        StorageCmd::Download {
            src,
            dst,
            recursive,
            update,
        } => {
            let (progress, render) = make_progress(quiet);
            let result = if *recursive {
                storage.download_dir(src, dst, *update, progress).await
            } else {
                storage.download_file(src, dst, progress).await
            };
            finish_progress(render).await;
            result?;
        }
        StorageCmd::Glob { pattern } => {
            let mut matches = storage.glob(pattern);
            while let Some(item) = matches.recv().await {
                println!("{}", item?);
            }
        }
    }
    Ok(())
}

async fn run_blob(client: &Client, cmd: &BlobCmd, quiet: bool) -> Result<()> {
    let blob = client.blob();
    match cmd {
        BlobCmd::Buckets => {
            for bucket in blob.list_buckets().await? {
                println!("{:>12} {}", bucket.creation_time, bucket.name);
            }
        }
        BlobCmd::Ls {
            bucket,
            prefix,
            recursive,
        } => {
            let mut entries = blob.list_objects(bucket, prefix.clone(), *recursive);
            while let Some(entry) = entries.recv().await {
                match entry? {
                    skylift::blob::ListEntry::Object(object) => {
                        println!("- {:>12} {}", object.size, object.key)
                    }
                    skylift::blob::ListEntry::Prefix(prefix) => {
                        println!("d {:>12} {}", "", prefix.prefix)
                    }
                }
            }
        }
        BlobCmd::Glob { bucket, pattern } => {
            let mut matches = blob.glob_objects(bucket, pattern);
            while let Some(object) = matches.recv().await {
                println!("{}", object?.key);
            }
        }
        BlobCmd::Upload {
            src,
            bucket,
            key,
            recursive,
        } => {
            let (progress, render) = make_progress(quiet);
            let result = if *recursive {
                blob.upload_dir(src, bucket, key, None, progress).await
            } else {
                blob.upload_file(src, bucket, key, progress).await
            };
            finish_progress(render).await;
            result?;
        }
        BlobCmd::Download {
            bucket,
            key,
            dst,
            recursive,
        } => {
            let (progress, render) = make_progress(quiet);
            let result = if *recursive {
                blob.download_dir(bucket, key, dst, None, progress).await
            } else {
                blob.download_file(bucket, key, dst, progress).await
            };
            finish_progress(render).await;
            result?;
        }
        BlobCmd::Rm { bucket, key } => {
            blob.delete_object(bucket, key).await?;
        }
    }
    Ok(())
}

async fn run_vcluster(client: &Client, cmd: &VclusterCmd) -> Result<()> {
    let vcluster = client.vcluster();
    match cmd {
        VclusterCmd::Create { name, ttl_days } => {
            let path = vcluster
                .create_service_account(name, *ttl_days, None, None)
                .await?;
            println!("{}", path.display());
        }
        VclusterCmd::Regenerate { name, ttl_days } => {
            let path = vcluster
                .regenerate_service_account(name, *ttl_days, None, None)
                .await?;
            println!("{}", path.display());
        }
        VclusterCmd::List { all_users } => {
            for account in vcluster
                .list_service_accounts(*all_users, None, None)
                .await?
            {
                println!(
                    "{:<24} {:<16} expires {}",
                    account.name, account.user, account.expired_at
                );
            }
        }
        VclusterCmd::Delete { name } => {
            let account = vcluster.delete_service_account(name, None, None).await?;
            println!("deleted {}", account.name);
        }
        VclusterCmd::Activate { name, kube_config } => {
            let path = vcluster
                .activate_service_account(name, None, None, kube_config.as_deref())
                .await?;
            println!("{}", path.display());
        }
    }
    Ok(())
}

async fn run_apps(client: &Client, cmd: &AppsCmd) -> Result<()> {
    let apps = client.apps();
    match cmd {
        AppsCmd::List => {
            let mut items = apps.list(None, None);
            while let Some(app) = items.recv().await {
                let app = app?;
                println!(
                    "{:<36} {:<24} {:<16} {}",
                    app.id, app.display_name, app.template_name, app.state
                );
            }
        }
        AppsCmd::Uninstall { id } => {
            apps.uninstall(id, None, None).await?;
        }
    }
    Ok(())
}

fn make_progress(
    quiet: bool,
) -> (
    Arc<dyn ProgressSink>,
    Option<tokio::task::JoinHandle<()>>,
) {
    if quiet {
        return (Arc::new(NullSink), None);
    }
    let (sink, rx) = ChannelSink::new();
    let handle = tokio::spawn(render_progress(rx));
    (Arc::new(sink), Some(handle))
}

async fn finish_progress(handle: Option<tokio::task::JoinHandle<()>>) {
    if let Some(handle) = handle {
        let _ = handle.await;
    }
}

/// Render transfer events as one progress bar per in-flight file.
async fn render_progress(mut rx: tokio::sync::mpsc::UnboundedReceiver<TransferEvent>) {
    let multi = MultiProgress::new();
    let style = ProgressStyle::with_template(
        "{bar:30.cyan/blue} {bytes}/{total_bytes} {wide_msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar());
    let mut bars: HashMap<String, ProgressBar> = HashMap::new();
    while let Some(event) = rx.recv().await {
        match event {
            TransferEvent::Start { src, dst, size } => {
                let bar = multi.add(ProgressBar::new(size));
                bar.set_style(style.clone());
                bar.set_message(format!("{src} -> {dst}"));
                bars.insert(dst, bar);
            }
            TransferEvent::Step { dst, current, .. } => {
                if let Some(bar) = bars.get(&dst) {
                    bar.set_position(current);
                }
            }
            TransferEvent::Complete { dst, size, .. } => {
                if let Some(bar) = bars.remove(&dst) {
                    bar.set_position(size);
                    bar.finish_and_clear();
                }
            }
            TransferEvent::EnterDir { dst, .. } => {
                let _ = multi.println(format!("entering {dst}"));
            }
            TransferEvent::LeaveDir { dst, .. } => {
                let _ = multi.println(format!("leaving {dst}"));
            }
            TransferEvent::Fail { dst, message, .. } => {
                if let Some(bar) = bars.remove(&dst) {
                    bar.abandon_with_message(message.clone());
                }
                let _ = multi.println(format!("failed {dst}: {message}"));
            }
        }
    }
}
