mod cli;
mod config;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use kds_core::config::load_dotenv;
use kds_core::{encode_start_cu, ConfigFeatures, ConfigurePacket, SchedulerConfig, REGMAP_RESERVED_WORDS};
use kds_scheduler::{
    BitstreamLayout, CommandStatus, Device, HostBuffer, RegisterIo, SchedulerMetrics, SimFabric,
    SubmitRequest,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::cli::CliArgs;
use crate::config::FabricConfig;

/// Outcome of one client's share of the batch.
#[derive(Debug, Default)]
struct ClientReport {
    completed: usize,
    errored: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    load_dotenv();
    let args = CliArgs::parse();

    let mut sched_config = match args.config.as_deref() {
        Some(path) => SchedulerConfig::from_file(path)
            .with_context(|| format!("failed to load scheduler config '{path}'"))?,
        None => SchedulerConfig::from_env().context("invalid KDS_* environment")?,
    };
    sched_config.polling = !args.interrupts;

    let fabric_config = FabricConfig::load(args.fabric.as_deref())?.with_generated(&args);
    if fabric_config.cus.is_empty() {
        bail!("fabric has no CUs");
    }

    let fabric = Arc::new(SimFabric::strided(
        fabric_config.base_addr,
        fabric_config.cu_shift,
        &fabric_config.cus,
    ));
    let io: Arc<dyn RegisterIo> = fabric.clone();
    let layout: Arc<dyn BitstreamLayout> = fabric.clone();
    let device = Arc::new(Device::open(sched_config, io, layout).context("failed to open device")?);
    info!(
        device = %device.name(),
        cus = fabric_config.cus.len(),
        interrupts = args.interrupts,
        "simulated fabric ready"
    );

    // The fabric only advances on register reads while polling; in interrupt
    // mode a clock thread drives it.
    let stop = Arc::new(AtomicBool::new(false));
    let ticker = if args.interrupts {
        let weak = Arc::downgrade(&device);
        fabric.on_interrupt(move |cu| {
            if let Some(device) = weak.upgrade() {
                device.handle_interrupt(cu);
            }
        });
        let (fabric, stop) = (Arc::clone(&fabric), Arc::clone(&stop));
        let period = Duration::from_micros(args.tick_us.max(1));
        Some(
            thread::Builder::new()
                .name("kds-sim-clock".into())
                .spawn(move || {
                    while !stop.load(Ordering::Acquire) {
                        fabric.advance(1);
                        thread::sleep(period);
                    }
                })
                .context("failed to start fabric clock")?,
        )
    } else {
        None
    };

    let started = Instant::now();
    let outcome = run_batch(&device, &fabric_config, &args);
    let elapsed = started.elapsed();

    stop.store(true, Ordering::Release);
    if let Some(ticker) = ticker {
        if ticker.join().is_err() {
            warn!("fabric clock thread panicked");
        }
    }
    fabric.on_interrupt(|_| {});
    device.shutdown();
    let metrics = device.metrics();

    let report = outcome?;
    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&metrics).context("failed to serialize metrics")?
        );
    } else {
        print_summary(&metrics, &report, elapsed);
    }
    if report.errored > 0 {
        bail!("{} command(s) failed", report.errored);
    }
    Ok(())
}

/// Configure the device, then push `args.commands` START_CU commands
/// through it from `args.clients` contexts and wait for all of them.
fn run_batch(device: &Device, fabric: &FabricConfig, args: &CliArgs) -> Result<ClientReport> {
    let timeout = Duration::from_secs(args.timeout_secs);
    let num_cus = fabric.cus.len();

    let packet = ConfigurePacket {
        slot_size: fabric.slot_size,
        num_cus: u32::try_from(num_cus).context("too many CUs")?,
        cu_shift: fabric.cu_shift,
        cu_base_addr: u32::try_from(fabric.base_addr).context("CU base address above 4 GiB")?,
        features: ConfigFeatures {
            ert: false,
            polling: !args.interrupts,
        },
        cu_addrs: Vec::new(),
    };
    let handle = device
        .submit(SubmitRequest::new(HostBuffer::new(packet.encode())))
        .context("failed to submit CONFIGURE")?;
    if device.wait(&handle, timeout)? != CommandStatus::Completed {
        bail!("CONFIGURE was rejected");
    }

    let mut masks = vec![0u32; num_cus.div_ceil(32)];
    for cu in 0..num_cus {
        masks[cu / 32] |= 1 << (cu % 32);
    }

    let clients = args.clients.max(1);
    let per_client = args.commands / clients;
    let extra = args.commands % clients;

    let reports = thread::scope(|scope| {
        let workers: Vec<_> = (0..clients)
            .map(|client| {
                let count = per_client + usize::from(client < extra);
                let masks = &masks;
                scope.spawn(move || run_client(device, client, count, masks, timeout))
            })
            .collect();
        workers
            .into_iter()
            .map(|w| {
                w.join()
                    .map_err(|_| anyhow!("client thread panicked"))
                    .and_then(|report| report)
            })
            .collect::<Result<Vec<_>>>()
    })?;

    Ok(reports.into_iter().fold(ClientReport::default(), |acc, r| ClientReport {
        completed: acc.completed + r.completed,
        errored: acc.errored + r.errored,
    }))
}

fn run_client(
    device: &Device,
    client: usize,
    count: usize,
    masks: &[u32],
    timeout: Duration,
) -> Result<ClientReport> {
    let ctx = device.register_context(std::process::id());
    let mut handles = Vec::with_capacity(count);
    for seq in 0..count {
        let mut regmap = vec![0; REGMAP_RESERVED_WORDS];
        regmap.push(((client as u32) << 16) | seq as u32);
        let request = SubmitRequest::new(HostBuffer::new(encode_start_cu(masks, &regmap)))
            .on_behalf_of(ctx.id());
        handles.push(
            device
                .submit(request)
                .with_context(|| format!("client {client}: submit {seq} failed"))?,
        );
    }

    let mut report = ClientReport::default();
    for handle in &handles {
        match device.wait(handle, timeout)? {
            CommandStatus::Completed => report.completed += 1,
            _ => report.errored += 1,
        }
    }
    device.unregister_context(ctx.id())?;
    info!(client, completed = report.completed, errored = report.errored, "client finished");
    Ok(report)
}

fn print_summary(metrics: &SchedulerMetrics, report: &ClientReport, elapsed: Duration) {
    println!("device        {}", metrics.device);
    println!("mode          {}", if metrics.polling { "polling" } else { "interrupt" });
    println!(
        "commands      {} completed, {} failed in {:.2?}",
        report.completed, report.errored, elapsed
    );
    println!("avg latency   {:.2?}", metrics.avg_latency);
    println!("loop passes   {}", metrics.loop_passes);
    for cu in &metrics.cus {
        println!(
            "cu{:<3} {:<4} {:#010x}  usage={}",
            cu.index,
            cu.model.to_string(),
            cu.base_addr,
            cu.usage
        );
    }
}
