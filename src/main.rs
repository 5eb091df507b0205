mod config;
mod context;
mod dispatcher;
mod error;
mod locks;
mod logging;
mod order_queue;
mod sim;
mod status;
mod supervisor;
mod types;
mod worker;

use std::process::ExitCode;
use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::error;

use crate::config::{DEFAULT_RESTAURANTS, DEFAULT_SEED, SimConfig, StrategyMix};
use crate::error::Result;
use crate::sim::StressPlan;
use crate::types::RestaurantId;

#[derive(Args, Clone, Debug)]
struct RunArgs {
    #[arg(long, default_value_t = 30, help = "Orders to dispatch in total")]
    orders: usize,

    #[arg(long, help = "Rider threads (default: 4 per restaurant)")]
    workers: Option<usize>,

    #[arg(long, default_value_t = DEFAULT_RESTAURANTS)]
    restaurants: RestaurantId,

    #[arg(long, help = "Order queue slots (default: 2 per restaurant)")]
    capacity: Option<usize>,

    #[arg(long, default_value_t = DEFAULT_SEED)]
    seed: u64,

    #[arg(long, value_enum, default_value_t = StrategyMix::Split)]
    mix: StrategyMix,

    #[arg(long, action = ArgAction::SetTrue, help = "Track delivered ids and flag double deliveries")]
    validate: bool,

    #[arg(long, value_name = "MS", help = "Fail if the queue has not drained in time")]
    deadline_ms: Option<u64>,

    #[arg(long, value_name = "US")]
    delivery_us: Option<u64>,

    #[arg(long, value_name = "US")]
    walk_us: Option<u64>,

    #[arg(long, value_name = "US", help = "Driving loop tick")]
    pacing_us: Option<u64>,

    #[arg(long, value_name = "US", help = "Admission scan cost")]
    check_us: Option<u64>,

    #[arg(long, value_name = "US", help = "Pause between lock attempts")]
    retry_us: Option<u64>,
}

impl RunArgs {
    fn to_config(&self) -> SimConfig {
        let defaults = SimConfig::default();
        let per_restaurant = usize::from(self.restaurants);
        let mut timings = defaults.timings;
        let micros = Duration::from_micros;
        if let Some(us) = self.delivery_us {
            timings.delivery = micros(us);
        }
        if let Some(us) = self.walk_us {
            timings.walk = micros(us);
        }
        if let Some(us) = self.pacing_us {
            timings.pacing = micros(us);
        }
        if let Some(us) = self.check_us {
            timings.check_cost = micros(us);
        }
        if let Some(us) = self.retry_us {
            timings.first_retry = micros(us);
            timings.second_retry = micros(us);
        }
        SimConfig {
            restaurants: self.restaurants,
            capacity: self.capacity.unwrap_or(per_restaurant * 2),
            workers: self.workers.unwrap_or(per_restaurant * 4),
            orders: self.orders,
            mix: self.mix,
            seed: self.seed,
            timings,
            validate: self.validate,
            deadline: self.deadline_ms.map(Duration::from_millis),
        }
    }
}

#[derive(Args, Clone, Debug)]
struct DemoArgs {
    #[command(flatten)]
    run: RunArgs,

    #[arg(long, action = ArgAction::SetTrue, help = "Skip the per-tick status line")]
    no_status: bool,
}

#[derive(Args, Clone, Debug)]
struct StressArgs {
    #[command(flatten)]
    run: RunArgs,

    #[arg(long, value_delimiter = ',', value_name = "LIST")]
    worker_sets: Vec<usize>,

    #[arg(long, value_delimiter = ',', value_name = "LIST")]
    capacity_sets: Vec<usize>,

    #[arg(long, value_delimiter = ',', value_name = "LIST")]
    restaurant_sets: Vec<RestaurantId>,
}

#[derive(Subcommand, Clone, Debug)]
enum Commands {
    #[command(about = "Run the dispatch demo with a live queue status line (default)")]
    Demo(DemoArgs),

    #[command(about = "Run one configuration and print a CSV row")]
    Bench(RunArgs),

    #[command(about = "Sweep worker/capacity/restaurant sets and print CSV rows")]
    Stress(StressArgs),
}

#[derive(Parser, Debug)]
#[command(version, about = "Delivery dispatch simulation with competing rider strategies", long_about = None)]
struct Cli {
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[arg(short, long, action = ArgAction::SetTrue, global = true)]
    quiet: bool,

    #[command(subcommand)]
    commands: Option<Commands>,
}

fn execute(commands: Option<Commands>) -> Result<()> {
    match commands {
        Some(Commands::Demo(args)) => {
            sim::run_demo(&args.run.to_config(), !args.no_status).map(|_| ())
        }
        Some(Commands::Bench(args)) => sim::run_benchmark(&args.to_config()),
        Some(Commands::Stress(args)) => {
            let plan = StressPlan {
                worker_sets: args.worker_sets,
                capacity_sets: args.capacity_sets,
                restaurant_sets: args.restaurant_sets,
            };
            sim::run_stress(&args.run.to_config(), &plan)
        }
        None => sim::run_demo(&SimConfig::default(), true).map(|_| ()),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.quiet);

    match execute(cli.commands) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, fatal = err.is_fatal(), "run failed");
            eprintln!("error: {err}");
            ExitCode::from(err.exit_code())
        }
    }
}
