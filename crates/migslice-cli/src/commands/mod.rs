//! CLI commands implementation

use anyhow::Result;
use migslice_allocator::{create_allocator, sweep_allocation_orders, SweepOutcome};
use migslice_core::{AllocatorConfig, Config, WaitMode, WaitPolicy};
use migslice_device::{Device, PartitionContext};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// An opened device plus the allocator settings to use on it
pub struct Session {
    device: Arc<Device>,
    allocator: AllocatorConfig,
}

impl Session {
    pub fn open(config: &Config) -> Result<Self> {
        let profile = config.device.resolve_profile()?;
        let ctx = PartitionContext::from_config(&config.backend, &profile)?;
        let device = Arc::new(Device::open(&ctx, config.device.index, profile)?);

        Ok(Self {
            device,
            allocator: config.allocator.clone(),
        })
    }
}

/// Show the profile table
pub fn profiles(session: &Session, json: bool) -> Result<()> {
    let profile = session.device.profile();

    if json {
        println!("{}", serde_json::to_string_pretty(profile)?);
        return Ok(());
    }

    println!("Family: {} ({} slices)", profile.name, profile.total_slices);
    println!(
        "{:<8} {:<26} {:<26}",
        "SLICES", "DEVICE PARTITION PROFILE", "COMPUTE PARTITION PROFILE"
    );
    println!("{}", "-".repeat(62));
    for slices in profile.valid_slices() {
        println!(
            "{:<8} {:<26} {:<26}",
            slices,
            profile.device_partition_profile(slices)?,
            profile.compute_partition_profile(slices)?
        );
    }

    Ok(())
}

/// Show remaining device partition capacity per size
pub fn capacity(session: &Session, json: bool) -> Result<()> {
    let device = &session.device;
    let mut rows = Vec::new();
    for slices in device.profile().valid_slices() {
        rows.push((slices, device.remaining_device_partition_capacity(slices)?));
    }

    if json {
        let value = json!({
            "device": device.index(),
            "uuid": device.uuid()?,
            "remaining": rows
                .iter()
                .map(|(slices, count)| json!({ "slices": slices, "count": count }))
                .collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("Device {} ({})", device.index(), device.uuid()?);
    for (slices, count) in rows {
        println!("  {} slice(s): {} more", slices, count);
    }

    Ok(())
}

/// Allocate partitions, report them, hold, then free
///
/// Earlier partitions are held while later ones are requested, so a blocking
/// allocator with no timeout could wait forever on its own partitions.
pub fn allocate(session: &Session, sizes: &[u32], hold_secs: u64, json: bool) -> Result<()> {
    let unbounded = session.allocator.wait_policy() == WaitPolicy::Blocking { timeout: None };
    if sizes.len() > 1 && unbounded {
        anyhow::bail!("allocating several partitions with --wait blocking needs --wait-timeout-ms");
    }

    let allocator = create_allocator(Arc::clone(&session.device), &session.allocator)?;

    let mut held = Vec::with_capacity(sizes.len());
    let mut failure = None;
    for &slices in sizes {
        match allocator.allocate(slices) {
            Ok(partition) => held.push(partition),
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }

    if json {
        let partitions: Vec<_> = held
            .iter()
            .map(|p| {
                json!({
                    "id": p.id().map(|id| id.to_string()),
                    "slices": p.slices(),
                    "cuda_visible_devices": p.cuda_visible_device(),
                })
            })
            .collect();
        let value = json!({
            "strategy": allocator.strategy().to_string(),
            "partitions": partitions,
            "error": failure.as_ref().map(|e| e.to_string()),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("Strategy: {}", allocator.strategy());
        for (i, partition) in held.iter().enumerate() {
            println!(
                "  [{}] {} slice(s) CUDA_VISIBLE_DEVICES={}",
                i,
                partition.slices().unwrap_or(0),
                partition.cuda_visible_device().unwrap_or_default()
            );
        }
        if let Some(e) = &failure {
            eprintln!("Allocation stopped: {}", e);
        }
    }

    if hold_secs > 0 && !held.is_empty() {
        info!(seconds = hold_secs, "Holding partitions");
        std::thread::sleep(Duration::from_secs(hold_secs));
    }

    for partition in held {
        allocator.free(partition);
    }

    match failure {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

/// Try every allocation order for combinations summing to `total`
///
/// Always fails fast, whatever the configured wait mode.
pub fn sweep(session: &Session, total: u32, json: bool) -> Result<()> {
    let config = AllocatorConfig {
        wait: WaitMode::FailFast,
        ..session.allocator.clone()
    };
    if session.allocator.wait != WaitMode::FailFast {
        info!("Sweeping with a fail-fast allocator");
    }
    let allocator = create_allocator(Arc::clone(&session.device), &config)?;
    let runs = sweep_allocation_orders(allocator.as_ref(), total)?;

    if json {
        let value: Vec<_> = runs
            .iter()
            .map(|run| {
                let (succeeded, failed_at, error) = match &run.outcome {
                    SweepOutcome::Succeeded => (true, None, None),
                    SweepOutcome::FailedAt { position, error } => {
                        (false, Some(*position), Some(error.clone()))
                    }
                };
                json!({
                    "order": run.order,
                    "succeeded": succeeded,
                    "failed_at": failed_at,
                    "error": error,
                    "restored": run.restored,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("Strategy: {}, total {} slices", allocator.strategy(), total);
        for run in &runs {
            let order: Vec<String> = run.order.iter().map(|s| s.to_string()).collect();
            match &run.outcome {
                SweepOutcome::Succeeded => println!("  [ {} ] succeeded", order.join(" ")),
                SweepOutcome::FailedAt { position, .. } => println!(
                    "  [ {} <-- failed ] {}",
                    order[..=*position].join(" "),
                    order[*position + 1..].join(" ")
                ),
            }
        }
        let succeeded = runs
            .iter()
            .filter(|r| r.outcome == SweepOutcome::Succeeded)
            .count();
        println!("{}/{} orders succeeded", succeeded, runs.len());
    }

    let leaked = runs.iter().filter(|r| !r.restored).count();
    if leaked > 0 {
        anyhow::bail!("{} run(s) did not return capacity after freeing", leaked);
    }

    Ok(())
}
