//! Meshsim binary: configure a run, step it, and expose the sim terminal.

use clap::Parser;
use meshsim::sim::terminal;
use meshsim::{SimConfig, Simulator};
use std::io::{BufRead, Write};
use tracing::info;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "meshsim", version, about = "Deterministic BLE mesh simulator")]
struct Args {
    /// Global seed; the same seed reproduces the same run
    #[arg(short, long, default_value = "1")]
    seed: u32,

    /// Number of mesh nodes
    #[arg(short, long, default_value = "10")]
    nodes: usize,

    /// Number of broadcast-only asset devices
    #[arg(long, default_value = "0")]
    asset_nodes: usize,

    /// Map width in meters
    #[arg(long, default_value = "40")]
    width: f32,

    /// Map height in meters
    #[arg(long, default_value = "30")]
    height: f32,

    /// Virtual milliseconds per tick
    #[arg(long, default_value = "50")]
    tick_ms: u32,

    /// Ticks to run before entering the terminal; 0 runs forever
    #[arg(long, default_value = "0")]
    run_ticks: u64,

    /// Emit sim_connect / sim_data / ... JSON lines on stdout
    #[arg(short, long)]
    json: bool,

    /// Desynchronize node frames probabilistically
    #[arg(long)]
    jitter: bool,

    /// Run the clustering validator each tick
    #[arg(long)]
    check_clustering: bool,

    /// Persist flash images to this file
    #[arg(long)]
    flash_file: Option<String>,

    /// Interactive terminal instead of a fixed number of ticks
    #[arg(short, long)]
    interactive: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("meshsim=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    let config = SimConfig {
        seed: args.seed,
        num_nodes: args.nodes,
        num_asset_nodes: args.asset_nodes,
        map_width_in_meters: args.width,
        map_height_in_meters: args.height,
        sim_tick_duration_ms: args.tick_ms,
        verbose: args.json,
        simulate_jittering: args.jitter,
        enable_clustering_validity_check: args.check_clustering,
        store_flash_to_file: args.flash_file,
        ..Default::default()
    };

    info!("meshsim v{} | seed {} | {} nodes", VERSION, args.seed, args.nodes);

    let mut sim = Simulator::new(config);
    if sim.load_flash_from_file() {
        info!("restored flash snapshot");
    }

    if args.interactive {
        run_interactive(&mut sim);
        return;
    }

    let mut tick: u64 = 0;
    loop {
        sim.step_all_nodes();
        tick += 1;
        if args.run_ticks != 0 && tick >= args.run_ticks {
            break;
        }
        if tick % 1200 == 0 {
            let clustered = sim.is_clustering_done();
            info!(
                time_ms = sim.sim_time_ms(),
                clustered, "simulation progressing"
            );
        }
    }
    sim.store_flash_to_file();
    info!(time_ms = sim.sim_time_ms(), errors = sim.sim_errors.len(), "simulation finished");
}

fn run_interactive(sim: &mut Simulator) {
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    println!("meshsim terminal; 'step N' advances, 'quit' exits");
    loop {
        print!("> ");
        stdout.flush().ok();
        let mut line = String::new();
        if stdin.lock().read_line(&mut line).unwrap_or(0) == 0 {
            break;
        }
        let line = line.trim();
        if line == "quit" || line == "exit" {
            break;
        }
        if let Some(count) = line.strip_prefix("step") {
            let n: u64 = count.trim().parse().unwrap_or(1);
            for _ in 0..n {
                sim.step_all_nodes();
            }
            println!("time is now {} ms", sim.sim_time_ms());
            continue;
        }
        match terminal::execute(sim, line) {
            Ok(output) if output.is_empty() => {}
            Ok(output) => println!("{}", output),
            Err(e) => println!("error: {}", e),
        }
        // Terminal commands may have queued node output.
        for node in &mut sim.nodes {
            for out in node.terminal_output.drain(..) {
                println!("[{}] {}", node.id, out);
            }
        }
    }
    sim.store_flash_to_file();
}
