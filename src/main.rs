use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use llfs_common::ManifestPath;
use llfs_log::{FileLogBackend, LogDevice, LogDeviceConfig};
use llfs_page::{
    AllocatorConfig, FilePageBackend, PageAllocator, PageCacheConfig, PageDevice, PageDeviceConfig,
    PageRecycler, RecyclerConfig,
};
use llfs_volume::{Volume, VolumeConfig};
use serde::Deserialize;
use uuid::Uuid;

/// On-disk device-description file read by every subcommand (spec.md §6:
/// CLI surface needs no environment variables, just a config file).
/// Matches the teacher's choice to confine `toml` + `serde` to the binary
/// crate alone; library crates are configured entirely through plain Rust
/// config structs.
#[derive(Debug, Deserialize, serde::Serialize)]
struct VolumeDescription {
    log_capacity: u64,
    #[serde(default = "default_cache_entries")]
    cache_entries: u64,
    devices: Vec<DeviceDescription>,
    recycler: RecyclerDescription,
}

#[derive(Debug, Deserialize, serde::Serialize)]
struct DeviceDescription {
    index: u8,
    page_size: usize,
    page_count: u32,
    #[serde(default = "default_attachments")]
    max_attachments: usize,
    #[serde(default = "default_watermark")]
    checkpoint_watermark: u64,
    #[serde(default = "default_log_capacity")]
    alloc_log_capacity: u64,
}

#[derive(Debug, Deserialize, serde::Serialize)]
struct RecyclerDescription {
    max_branching_factor: usize,
    max_depth: usize,
    #[serde(default = "default_watermark")]
    checkpoint_watermark: u64,
    #[serde(default = "default_log_capacity")]
    log_capacity: u64,
}

fn default_cache_entries() -> u64 {
    10_000
}

fn default_attachments() -> usize {
    64
}

fn default_watermark() -> u64 {
    1 << 20
}

fn default_log_capacity() -> u64 {
    1 << 24
}

impl Default for VolumeDescription {
    fn default() -> Self {
        VolumeDescription {
            log_capacity: 1 << 24,
            cache_entries: default_cache_entries(),
            devices: vec![DeviceDescription {
                index: 0,
                page_size: 4096,
                page_count: 1 << 16,
                max_attachments: default_attachments(),
                checkpoint_watermark: default_watermark(),
                alloc_log_capacity: default_log_capacity(),
            }],
            recycler: RecyclerDescription {
                max_branching_factor: 8,
                max_depth: 16,
                checkpoint_watermark: default_watermark(),
                log_capacity: default_log_capacity(),
            },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().collect();
    let cmd = args.get(1).map(|s| s.as_str()).unwrap_or("");
    let dir = args.get(2).map(PathBuf::from);

    let result = match cmd {
        "create" => run_create(require_dir(dir)?, &args).await,
        "info" => run_info(require_dir(dir)?).await,
        "trim" => run_trim(require_dir(dir)?).await,
        "recover" => run_recover(require_dir(dir)?).await,
        _ => {
            eprintln!("usage: llfs <create|info|trim|recover> <volume-dir> [--config <path>]");
            std::process::exit(2);
        }
    };

    if let Err(err) = result {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
    Ok(())
}

fn require_dir(dir: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    dir.ok_or_else(|| anyhow::anyhow!("missing <volume-dir> argument"))
}

fn parse_flag_string(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(|v| v.clone())
}

fn description_path(dir: &Path) -> PathBuf {
    dir.join("llfs.toml")
}

fn load_description(dir: &Path) -> anyhow::Result<VolumeDescription> {
    let path = description_path(dir);
    let text = std::fs::read_to_string(&path)
        .map_err(|e| anyhow::anyhow!("reading {}: {e}", path.display()))?;
    toml::from_str(&text).map_err(|e| anyhow::anyhow!("parsing {}: {e}", path.display()))
}

async fn run_create(dir: PathBuf, args: &[String]) -> anyhow::Result<()> {
    std::fs::create_dir_all(&dir)?;

    let config_path = parse_flag_string(args, "--config");
    let description = match config_path {
        Some(path) => {
            let text = std::fs::read_to_string(&path)?;
            toml::from_str(&text)?
        }
        None => VolumeDescription::default(),
    };
    let toml_text = toml::to_string_pretty(&description)?;
    std::fs::write(description_path(&dir), toml_text)?;

    let volume = open_volume(&dir, &description, /* fresh = */ true).await?;
    println!("created volume at {}", dir.display());
    print_positions(&volume).await;
    Ok(())
}

async fn run_info(dir: PathBuf) -> anyhow::Result<()> {
    let description = load_description(&dir)?;
    let volume = open_volume(&dir, &description, false).await?;
    println!("volume at {}", dir.display());
    print_positions(&volume).await;
    for device in &description.devices {
        let (_, allocator) = volume.device(device.index)?;
        let mut free = 0u32;
        for idx in 0..device.page_count {
            if let Some((refcount, _)) = allocator.entry(idx).await {
                if refcount == 0 {
                    free += 1;
                }
            }
        }
        println!(
            "  device {}: {} pages, {} free",
            device.index, device.page_count, free
        );
    }
    if let Some(recycler) = volume.recycler() {
        println!(
            "  recycler: queue={} stack_depth={}",
            recycler.queue_len().await,
            recycler.stack_depth().await
        );
    }
    Ok(())
}

async fn run_trim(dir: PathBuf) -> anyhow::Result<()> {
    let description = load_description(&dir)?;
    let volume = open_volume(&dir, &description, false).await?;
    for device in &description.devices {
        let (_, allocator) = volume.device(device.index)?;
        allocator.checkpoint().await?;
    }
    if let Some(recycler) = volume.recycler() {
        recycler.run_to_quiescence().await?;
    }
    println!("trimmed volume at {}", dir.display());
    print_positions(&volume).await;
    Ok(())
}

async fn run_recover(dir: PathBuf) -> anyhow::Result<()> {
    let description = load_description(&dir)?;
    let volume = open_volume(&dir, &description, false).await?;
    println!("recovered volume at {}", dir.display());
    print_positions(&volume).await;
    Ok(())
}

async fn print_positions(volume: &Volume) {
    let (trim_pos, commit_pos, flush_pos) = volume.positions().await;
    println!(
        "  volume log: trim_pos={trim_pos} commit_pos={commit_pos} flush_pos={flush_pos}"
    );
}

/// Open (or create) every on-disk component a [`VolumeDescription`] names
/// and assemble a [`Volume`] over them. `fresh` selects `create` vs.
/// `recover` at every layer, matching the teacher's `StorageEngine::open`
/// choice to always attempt recovery unless the caller explicitly asks for
/// a clean slate.
async fn open_volume(dir: &Path, description: &VolumeDescription, fresh: bool) -> anyhow::Result<Volume> {
    let mut devices = HashMap::new();
    for device_desc in &description.devices {
        let page_path = dir.join(format!("device-{}.pages", device_desc.index));
        let page_backend = Box::new(FilePageBackend::open(
            &page_path,
            device_desc.page_size,
            device_desc.page_count,
        )?);
        let page_device = Arc::new(PageDevice::create(
            device_desc.index,
            page_backend,
            PageDeviceConfig {
                page_size: device_desc.page_size,
                page_count: device_desc.page_count,
            },
        )?);
        if !fresh {
            page_device.recover().await?;
        }

        let alloc_manifest = ManifestPath(Some(dir.join(format!("device-{}.alloc.manifest", device_desc.index))));
        let allocator_config = AllocatorConfig {
            device_index: device_desc.index,
            page_count: device_desc.page_count,
            max_attachments: device_desc.max_attachments,
            checkpoint_watermark: device_desc.checkpoint_watermark,
            log_capacity: device_desc.alloc_log_capacity,
            manifest: alloc_manifest,
        };
        let allocator = if fresh {
            let alloc_log_path = dir.join(format!("device-{}.alloc.log", device_desc.index));
            let alloc_backend = Box::new(FileLogBackend::open(&alloc_log_path)?);
            let log = LogDevice::create(alloc_backend, LogDeviceConfig { capacity: device_desc.alloc_log_capacity });
            Arc::new(PageAllocator::create(log, allocator_config))
        } else {
            let alloc_log_path = dir.join(format!("device-{}.alloc.log", device_desc.index));
            let alloc_backend = Box::new(FileLogBackend::open(&alloc_log_path)?);
            Arc::new(PageAllocator::recover(alloc_backend, allocator_config).await?)
        };

        devices.insert(device_desc.index, (page_device, allocator));
    }

    let recycler_manifest = ManifestPath(Some(dir.join("recycler.manifest")));
    let recycler_config = RecyclerConfig {
        max_branching_factor: description.recycler.max_branching_factor,
        max_depth: description.recycler.max_depth,
        log_capacity: description.recycler.log_capacity,
        manifest: recycler_manifest,
        checkpoint_watermark: description.recycler.checkpoint_watermark,
    };
    let recycler_log_path = dir.join("recycler.log");
    let recycler_uuid_path = dir.join("recycler.client_uuid");
    let recycler = if fresh {
        let client_uuid = Uuid::new_v4();
        std::fs::write(&recycler_uuid_path, client_uuid.to_string())?;
        let backend = Box::new(FileLogBackend::open(&recycler_log_path)?);
        let log = LogDevice::create(backend, LogDeviceConfig { capacity: description.recycler.log_capacity });
        Arc::new(PageRecycler::create(log, recycler_config, devices.clone()))
    } else {
        // The recycler's own log never records its `client_uuid` (its
        // checkpoint is just trim_pos, unlike the allocator's), so the
        // identity it attaches to each device's allocator under must be
        // persisted by whoever owns the recycler across restarts — here,
        // a plain-text sidecar next to its log file.
        let client_uuid: Uuid = std::fs::read_to_string(&recycler_uuid_path)
            .map_err(|e| anyhow::anyhow!("reading {}: {e}", recycler_uuid_path.display()))?
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("parsing {}: {e}", recycler_uuid_path.display()))?;
        let backend = Box::new(FileLogBackend::open(&recycler_log_path)?);
        Arc::new(PageRecycler::recover(backend, recycler_config, client_uuid, devices.clone()).await?)
    };

    let volume_manifest = ManifestPath(Some(dir.join("volume.manifest")));
    let volume_config = VolumeConfig {
        log_capacity: description.log_capacity,
        manifest: volume_manifest,
        cache: PageCacheConfig { max_entries: description.cache_entries },
    };
    let volume_log_path = dir.join("volume.log");
    let rollback_uuid_path = dir.join("volume.rollback_uuid");
    let volume = if fresh {
        let rollback_uuid = Uuid::new_v4();
        std::fs::write(&rollback_uuid_path, rollback_uuid.to_string())?;
        let backend = Box::new(FileLogBackend::open(&volume_log_path)?);
        let log = LogDevice::create(backend, LogDeviceConfig { capacity: description.log_capacity });
        Volume::create(log, devices, Some(recycler), volume_config.cache, rollback_uuid)
    } else {
        // Like the recycler's `client_uuid`, the rollback identity must
        // survive a restart so a replayed compensating negation reuses the
        // same attachment instead of appearing unattached every time.
        let rollback_uuid: Uuid = std::fs::read_to_string(&rollback_uuid_path)
            .map_err(|e| anyhow::anyhow!("reading {}: {e}", rollback_uuid_path.display()))?
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("parsing {}: {e}", rollback_uuid_path.display()))?;
        let backend = Box::new(FileLogBackend::open(&volume_log_path)?);
        Volume::recover(backend, volume_config, devices, Some(recycler), rollback_uuid).await?
    };

    Ok(volume)
}
