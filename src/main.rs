mod core;
mod plugins;

use anyhow::Context;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use core::config::EngineConfig;
use core::engine::Engine;
use core::events::{EngineEvent, ProgressSink};
use core::model::{stable_item_id, DownloadItem, DownloadStatus, EpisodeMetadata, ItemId};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use plugins::http::resolver::{resolve_link, LinkInput};
use plugins::registry::{DownloadCliConfig, PluginRegistry};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

fn engine_args(cmd: Command) -> Command {
    cmd.arg(
        Arg::new("out_dir")
            .long("out-dir")
            .help("Output directory (also holds the resume database)")
            .default_value("./downloads")
            .value_parser(value_parser!(PathBuf))
            .num_args(1),
    )
    .arg(
        Arg::new("max_concurrent")
            .long("max-concurrent")
            .help("Max items downloading at once")
            .default_value("3")
            .value_parser(value_parser!(usize))
            .num_args(1),
    )
}

fn build_cli(registry: &PluginRegistry) -> Command {
    let download = Command::new("download")
        .about("Download one item; each link is a mirror tried in order")
        .arg(
            Arg::new("links")
                .help("Mirror links (http/https, .m3u8 playlists are fetched segment by segment)")
                .action(ArgAction::Append)
                .num_args(1..)
                .required_unless_present("manifest"),
        )
        .arg(
            Arg::new("manifest")
                .long("manifest")
                .help("JSON file with a list of download items, as produced by a provider")
                .value_parser(value_parser!(PathBuf))
                .num_args(1),
        )
        .arg(Arg::new("title").long("title").help("Episode title, used as the file name").num_args(1))
        .arg(
            Arg::new("episode")
                .long("episode")
                .help("Episode number")
                .value_parser(value_parser!(u32))
                .num_args(1),
        )
        .arg(
            Arg::new("season")
                .long("season")
                .help("Season number")
                .value_parser(value_parser!(u32))
                .num_args(1),
        )
        .arg(Arg::new("folder").long("folder").help("Sub-folder under the output directory").num_args(1))
        .arg(
            Arg::new("id")
                .long("id")
                .help("Item id (default: derived from the first link)")
                .value_parser(value_parser!(u64))
                .num_args(1),
        )
        .arg(
            Arg::new("quality")
                .long("quality")
                .help("Quality code: -2=360p, -1=480p, 1=720p, 2=1080p, other=best")
                .default_value("0")
                .allow_negative_numbers(true)
                .value_parser(value_parser!(i32))
                .num_args(1),
        )
        .arg(Arg::new("referer").long("referer").help("Referer header for every link").num_args(1));
    let download = registry.augment_download_command(engine_args(download));

    let resume = registry.augment_download_command(engine_args(
        Command::new("resume").about("Continue everything that was queued or running when the last run ended"),
    ));

    let id_arg = || {
        Arg::new("id")
            .help("Item id")
            .required(true)
            .value_parser(value_parser!(u64))
            .num_args(1)
    };
    let info = engine_args(Command::new("info").about("Show the downloaded file of an item").arg(id_arg()));
    let delete = engine_args(Command::new("delete").about("Stop an item and delete its file").arg(id_arg()));

    Command::new("episode-downloader")
        .about("Resumable episode downloader (HTTP + HLS) with mirror fallback")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(download)
        .subcommand(resume)
        .subcommand(info)
        .subcommand(delete)
}

fn engine_config(m: &ArgMatches) -> EngineConfig {
    let mut cfg = EngineConfig::default();
    if let Some(dir) = m.get_one::<PathBuf>("out_dir") {
        cfg.out_dir = dir.clone();
    }
    if let Some(n) = m.get_one::<usize>("max_concurrent") {
        cfg.max_concurrent_downloads = (*n).max(1);
    }
    cfg
}

fn download_cli_config(registry: &PluginRegistry, m: &ArgMatches) -> anyhow::Result<DownloadCliConfig> {
    let mut cfg = DownloadCliConfig { headers: HashMap::new(), engine: engine_config(m) };
    registry.apply_download_matches(m, &mut cfg)?;
    Ok(cfg)
}

fn item_from_args(m: &ArgMatches, headers: &HashMap<String, String>) -> anyhow::Result<DownloadItem> {
    let referer = m.get_one::<String>("referer").cloned().unwrap_or_default();
    let quality = m.get_one::<i32>("quality").copied().unwrap_or(0);

    let mut links = vec![];
    for raw in m.get_many::<String>("links").into_iter().flatten() {
        let input = LinkInput { raw: raw.clone(), referer: referer.clone(), quality, headers: headers.clone() };
        links.push(resolve_link(&input).with_context(|| format!("resolve {}", raw))?);
    }
    let first = links.first().context("no links given")?;

    let id = m.get_one::<u64>("id").copied().unwrap_or_else(|| stable_item_id(&first.url));
    let folder = m.get_one::<String>("folder").cloned();
    Ok(DownloadItem {
        source_url: Some(first.url.clone()),
        destination_folder: folder.clone(),
        episode: EpisodeMetadata {
            id,
            group_name: folder.unwrap_or_else(|| first.display_name.clone()),
            source_name: Some(first.display_name.clone()),
            poster_url: None,
            title: m.get_one::<String>("title").cloned(),
            season: m.get_one::<u32>("season").copied(),
            episode: m.get_one::<u32>("episode").copied(),
        },
        links,
    })
}

async fn items_from_manifest(path: &PathBuf) -> anyhow::Result<Vec<DownloadItem>> {
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("read manifest {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("parse manifest {}", path.display()))
}

/// Per-item indicatif bars fed from the engine's progress callbacks.
struct BarSink {
    mp: MultiProgress,
    bar_style: ProgressStyle,
    spinner_style: ProgressStyle,
    bars: Mutex<HashMap<ItemId, ProgressBar>>,
}

impl BarSink {
    fn new(mp: MultiProgress) -> anyhow::Result<Self> {
        let bar_style = ProgressStyle::with_template(
            "{prefix} {bar:40.cyan/blue} {bytes}/{total_bytes} ({bytes_per_sec}, eta {eta}) {wide_msg}",
        )?;
        let spinner_style = ProgressStyle::with_template("{spinner:.green} {prefix} {wide_msg}")?.tick_chars("|/-\\ ");
        Ok(Self { mp, bar_style, spinner_style, bars: Mutex::new(HashMap::new()) })
    }

    fn add(&self, item_id: ItemId, name: &str) {
        let Ok(mut bars) = self.bars.lock() else { return };
        if bars.contains_key(&item_id) {
            return;
        }
        let pb = self.mp.add(ProgressBar::new_spinner());
        pb.set_style(self.spinner_style.clone());
        pb.set_prefix(format!("[{}]", name));
        pb.set_message("queued");
        bars.insert(item_id, pb);
    }
}

impl ProgressSink for BarSink {
    fn on_progress(&self, item_id: ItemId, status: DownloadStatus, downloaded: u64, total: u64) {
        let Ok(bars) = self.bars.lock() else { return };
        let Some(pb) = bars.get(&item_id) else { return };

        if total > 0 {
            if pb.length() != Some(total) {
                pb.set_style(self.bar_style.clone());
                pb.set_length(total);
            }
            pb.set_position(downloaded.min(total));
        }
        match status {
            DownloadStatus::Done => pb.finish_with_message("done"),
            DownloadStatus::Failed => pb.abandon_with_message("failed"),
            DownloadStatus::Stopped => pb.abandon_with_message("stopped"),
            DownloadStatus::Paused => pb.set_message("paused"),
            DownloadStatus::Downloading => pb.set_message(format!("{} / {}", fmt_bytes(downloaded), fmt_bytes(total))),
        }
    }
}

async fn run_until_idle(
    engine: &Engine,
    mut rx: broadcast::Receiver<EngineEvent>,
    sink: Arc<BarSink>,
    mp: MultiProgress,
) -> anyhow::Result<()> {
    let finished: Arc<Mutex<Vec<String>>> = Default::default();
    let summary = finished.clone();
    let ui_task = tokio::spawn(async move {
        loop {
            let evt = match rx.recv().await {
                Ok(e) => e,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => break,
            };
            match evt {
                EngineEvent::ItemQueued { item_id, display_name } => sink.add(item_id, &display_name),
                EngineEvent::MirrorAttempt { item_id, index, url } => {
                    let _ = mp.println(format!("[MIRROR] item={} #{} {}", item_id, index + 1, url));
                }
                EngineEvent::ItemFinished { item_id, outcome, target_path } => {
                    let path = target_path.map(|p| p.display().to_string()).unwrap_or_else(|| "-".to_string());
                    let line = format!("item={} result={:?} (code {}) path={}", item_id, outcome, outcome.code(), path);
                    let _ = mp.println(format!("[DONE] {}", line));
                    if let Ok(mut f) = summary.lock() {
                        f.push(line);
                    }
                }
                EngineEvent::Error { scope, message } => {
                    let _ = mp.println(format!("[ERR] {}: {}", scope, message));
                }
                EngineEvent::Info { scope, message } => {
                    let _ = mp.println(format!("[INFO] {}: {}", scope, message));
                }
                EngineEvent::StatusChanged { .. } | EngineEvent::Progress { .. } | EngineEvent::Deleted { .. } => {}
            }
        }
    });

    tokio::select! {
        _ = engine.wait_idle() => {}
        r = tokio::signal::ctrl_c() => {
            r.context("listen for ctrl-c")?;
            ui_task.abort();
            tracing::warn!("interrupted; run `resume` to continue");
            return Ok(());
        }
    }

    // let the last events drain before summarizing
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    ui_task.abort();

    let lines = finished.lock().map(|f| f.clone()).unwrap_or_default();
    if !lines.is_empty() {
        println!("Summary:");
        for line in lines {
            println!("- {}", line);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let registry = PluginRegistry::with_defaults()?;
    let app = build_cli(&registry);
    let matches = app.get_matches();

    match matches.subcommand() {
        Some(("download", m)) => {
            let cfg = download_cli_config(&registry, m)?;
            let items = match m.get_one::<PathBuf>("manifest") {
                Some(path) => items_from_manifest(path).await?,
                None => vec![item_from_args(m, &cfg.headers)?],
            };

            let mp = MultiProgress::new();
            let sink = Arc::new(BarSink::new(mp.clone())?);
            let engine = Engine::open(registry, cfg.engine, sink.clone()).await?;

            let rx = engine.subscribe();
            for item in items {
                engine.download_episode(item).await?;
            }
            run_until_idle(&engine, rx, sink, mp).await?;
        }
        Some(("resume", m)) => {
            let cfg = download_cli_config(&registry, m)?;
            let mp = MultiProgress::new();
            let sink = Arc::new(BarSink::new(mp.clone())?);
            let engine = Engine::open(registry, cfg.engine, sink.clone()).await?;

            let rx = engine.subscribe();
            if engine.restore().await? == 0 {
                println!("Nothing to resume.");
                return Ok(());
            }
            run_until_idle(&engine, rx, sink, mp).await?;
        }
        Some(("info", m)) => {
            let id = *m.get_one::<u64>("id").context("missing id")?;
            let engine = Engine::open(registry, engine_config(m), Arc::new(core::events::LogSink)).await?;
            match engine.downloaded_file_info(id).await? {
                Some(info) => println!(
                    "item={} {} / {} path={}",
                    id,
                    fmt_bytes(info.file_length),
                    fmt_bytes(info.total_bytes),
                    info.path.display()
                ),
                None => println!("item={} has no downloaded file", id),
            }
            if let Some(pkg) = engine.resume_package(id).await? {
                println!("resumable: mirror {:?} of {}", pkg.link_index.map(|i| i + 1), pkg.item.links.len());
            }
        }
        Some(("delete", m)) => {
            let id = *m.get_one::<u64>("id").context("missing id")?;
            let engine = Engine::open(registry, engine_config(m), Arc::new(core::events::LogSink)).await?;
            if engine.delete_file(id).await? {
                println!("item={} deleted", id);
            } else {
                println!("item={} had no file", id);
            }
        }
        _ => {}
    }

    Ok(())
}

fn fmt_bytes(n: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;
    let f = n as f64;
    if f >= GB {
        format!("{:.2}GiB", f / GB)
    } else if f >= MB {
        format!("{:.2}MiB", f / MB)
    } else if f >= KB {
        format!("{:.2}KiB", f / KB)
    } else {
        format!("{}B", n)
    }
}
