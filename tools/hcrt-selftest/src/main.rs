// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! hcrt-selftest - in-process self-test for the hcrt RPC core
//!
//! Spins up several ranks on one loopback fabric, each with its own progress
//! thread, and either floods every rank with RPCs or cycles a group spanning
//! all of them through create and destroy.

use clap::{Parser, Subcommand};
use hcrt::{
    Context, Endpoint, GroupCompletion, IncomingRpc, LoopbackFabric, Opcode, RpcInput, RpcOutput,
    Runtime, RuntimeConfig,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Opcode of the echo service every rank serves.
const ECHO: Opcode = Opcode(0x5e1f);

/// hcrt self-test
#[derive(Parser, Debug)]
#[command(name = "hcrt-selftest")]
#[command(version = "0.1.0")]
#[command(about = "Exercise hcrt flow control and group protocols in-process")]
struct Args {
    #[command(subcommand)]
    mode: Mode,

    /// Number of in-process ranks
    #[arg(short, long, default_value = "4", global = true)]
    ranks: u32,

    /// Per-RPC timeout in seconds
    #[arg(short, long, default_value = "10", global = true)]
    timeout: u64,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Every rank sends RPCs to every other rank
    Rpc {
        /// RPCs per (source, destination) pair
        #[arg(short = 'n', long, default_value = "10000")]
        count: u64,

        /// Outstanding RPCs allowed per endpoint (0 = unlimited)
        #[arg(short, long, default_value = "32")]
        credits: u32,

        /// Payload size in bytes
        #[arg(short, long, default_value = "64")]
        payload: usize,
    },

    /// Create and destroy a group spanning all ranks
    Group {
        /// Number of create/destroy cycles
        #[arg(short = 'n', long, default_value = "100")]
        cycles: usize,
    },
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    if let Err(e) = run(&args) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    if args.ranks == 0 {
        return Err("--ranks must be at least 1".into());
    }
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let credits = match &args.mode {
        Mode::Rpc { credits, .. } => *credits,
        Mode::Group { .. } => hcrt::config::DEFAULT_CREDITS_PER_EP_CTX,
    };
    let config = RuntimeConfig::from_env()
        .with_credits(credits)
        .with_rpc_timeout(Duration::from_secs(args.timeout.max(1)));
    let cluster = Cluster::start(args.ranks, &config)?;

    let outcome = match &args.mode {
        Mode::Rpc { count, payload, .. } => run_rpc_test(&cluster, &running, *count, *payload),
        Mode::Group { cycles } => run_group_test(&cluster, &running, *cycles, args.timeout),
    };
    cluster.shutdown()?;
    outcome
}

/// Ranks, their context 0, and one progress thread per context.
struct Cluster {
    ranks: Vec<Runtime>,
    ctxs: Vec<Context>,
    stop: Arc<AtomicBool>,
    pollers: Vec<JoinHandle<()>>,
}

impl Cluster {
    fn start(size: u32, config: &RuntimeConfig) -> Result<Self, Box<dyn std::error::Error>> {
        println!("[setup] {} ranks, {} credits/endpoint", size, config.credits_per_ep_ctx);
        let fabric = LoopbackFabric::new();
        let mut ranks = Vec::new();
        let mut ctxs = Vec::new();
        for rank in 0..size {
            let rt = Runtime::builder()
                .rank(rank)
                .size(size)
                .config(config.clone())
                .fabric(fabric.clone())
                .build()?;
            rt.register_handler(ECHO, |_: &Context, req: IncomingRpc| {
                let out = match req.input() {
                    RpcInput::Raw(bytes) => RpcOutput::Raw(bytes.clone()),
                    _ => RpcOutput::Empty,
                };
                req.reply(Ok(out));
            })?;
            ctxs.push(rt.context_create()?);
            ranks.push(rt);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let pollers = ctxs
            .iter()
            .cloned()
            .map(|ctx| {
                let stop = stop.clone();
                thread::spawn(move || {
                    while !stop.load(Ordering::Acquire) {
                        if let Err(e) = ctx.progress(Duration::from_millis(10)) {
                            log::error!("[selftest] progress on rank {} failed: {}", ctx.rank(), e);
                            break;
                        }
                    }
                })
            })
            .collect();

        Ok(Self {
            ranks,
            ctxs,
            stop,
            pollers,
        })
    }

    fn shutdown(self) -> Result<(), Box<dyn std::error::Error>> {
        self.stop.store(true, Ordering::Release);
        for poller in self.pollers {
            if poller.join().is_err() {
                return Err("progress thread panicked".into());
            }
        }
        for (rt, ctx) in self.ranks.iter().zip(&self.ctxs) {
            rt.context_destroy(ctx, true)?;
            rt.finalize()?;
        }
        println!("[teardown] all ranks finalized");
        Ok(())
    }
}

fn run_rpc_test(
    cluster: &Cluster,
    running: &AtomicBool,
    count: u64,
    payload: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let size = cluster.ranks.len() as u64;
    let expected = size * size.saturating_sub(1) * count;
    println!("=== RPC flood: {} RPCs of {} bytes ===\n", expected, payload);

    let completed = Arc::new(AtomicU64::new(0));
    let failed = Arc::new(AtomicU64::new(0));
    let body = vec![0xa5u8; payload];
    let start = Instant::now();

    for ctx in &cluster.ctxs {
        for dst in 0..size as u32 {
            if dst == ctx.rank() {
                continue;
            }
            for _ in 0..count {
                let rpc = ctx.new_request(Endpoint::primary(dst), ECHO, RpcInput::Raw(body.clone()));
                let completed = completed.clone();
                let failed = failed.clone();
                ctx.send(&rpc, move |info| {
                    if let Err(e) = &info.result {
                        log::warn!("[selftest] rpc {} failed: {}", info.rpc.id(), e);
                        failed.fetch_add(1, Ordering::Relaxed);
                    }
                    completed.fetch_add(1, Ordering::Relaxed);
                })?;
            }
        }
    }
    println!("[send] queued in {:?}", start.elapsed());

    let mut last_report = Instant::now();
    while completed.load(Ordering::Relaxed) < expected && running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(20));
        if last_report.elapsed() >= Duration::from_secs(1) {
            println!("  {}/{} completed", completed.load(Ordering::Relaxed), expected);
            last_report = Instant::now();
        }
    }
    let elapsed = start.elapsed();
    let done = completed.load(Ordering::Relaxed);
    let errors = failed.load(Ordering::Relaxed);

    println!("\n=== Results ===");
    println!("  Completed:  {}/{}", done, expected);
    println!("  Failed:     {}", errors);
    println!("  Elapsed:    {:?}", elapsed);
    if elapsed.as_secs_f64() > 0.0 {
        println!("  Throughput: {:.0} rpc/s", done as f64 / elapsed.as_secs_f64());
    }
    for dst in 1..size as u32 {
        if let Some(stats) = cluster.ctxs[0].endpoint_stats(dst) {
            println!(
                "  rank 0 -> {}: dispatched={} replied={} in_flight={} queued={}",
                dst, stats.dispatched, stats.replied, stats.in_flight, stats.queued
            );
        }
    }

    if done < expected {
        return Err(format!("only {} of {} rpcs completed", done, expected).into());
    }
    if errors > 0 {
        return Err(format!("{} rpcs failed", errors).into());
    }
    Ok(())
}

fn run_group_test(
    cluster: &Cluster,
    running: &AtomicBool,
    cycles: usize,
    timeout_secs: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let rt = &cluster.ranks[0];
    let members: Vec<u32> = (0..cluster.ranks.len() as u32).collect();
    let wait = Duration::from_secs(timeout_secs.max(1) * 2);
    println!("=== Group cycles: {} x {} ranks ===\n", cycles, members.len());

    let start = Instant::now();
    let mut successful = 0usize;
    for cycle in 0..cycles {
        if !running.load(Ordering::SeqCst) {
            println!("  interrupted after {} cycles", cycle);
            break;
        }
        let id = format!("selftest_{}", cycle);

        let (tx, rx) = mpsc::channel::<GroupCompletion>();
        let created = tx.clone();
        rt.group_create(&id, &members, move |done| {
            let _ = created.send(done);
        })?;
        rx.recv_timeout(wait)?.result?;

        let grp = rt
            .group_lookup(&id)
            .ok_or_else(|| format!("group {} vanished after create", id))?;
        for (rank, peer) in cluster.ranks.iter().enumerate() {
            if peer.group_lookup(&id).is_none() {
                return Err(format!("rank {} does not know group {}", rank, id).into());
            }
        }

        rt.group_destroy(&grp, move |done| {
            let _ = tx.send(done);
        })?;
        rx.recv_timeout(wait)?.result?;

        successful += 1;
        if (cycle + 1) % 10 == 0 {
            println!("  {} cycles in {:?}", cycle + 1, start.elapsed());
        }
    }

    let elapsed = start.elapsed();
    println!("\n=== Results ===");
    println!("  Cycles:  {}/{}", successful, cycles);
    println!("  Elapsed: {:?}", elapsed);
    if successful > 0 {
        println!("  Per cycle: {:?}", elapsed / successful as u32);
    }
    Ok(())
}
