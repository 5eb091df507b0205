//! Demo, benchmark, and stress runners.

use std::io::{self, Write};

use tracing::warn;

use crate::config::SimConfig;
use crate::error::{DispatchError, Result};
use crate::supervisor::{self, RunReport};
use crate::types::RestaurantId;

const CSV_HEADER: &str = "workers,capacity,restaurants,orders,elapsed_ms,throughput_orders_per_s,delivered,abandoned,max_in_flight,cpu_user_s,cpu_sys_s,double_delivery";

/// Best-effort CPU user/system time snapshot (seconds) on Unix platforms.
#[cfg(unix)]
fn cpu_times_seconds() -> Option<(f64, f64)> {
    // SAFETY: `rusage` is plain data; getrusage only writes into it.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
    if rc != 0 {
        return None;
    }
    let seconds = |tv: libc::timeval| tv.tv_sec as f64 + tv.tv_usec as f64 / 1_000_000.0;
    Some((seconds(usage.ru_utime), seconds(usage.ru_stime)))
}

#[cfg(not(unix))]
fn cpu_times_seconds() -> Option<(f64, f64)> {
    None
}

/// One benchmark row: run totals plus process CPU spent on the run.
struct BenchResult {
    report: RunReport,
    cpu_user_s: Option<f64>,
    cpu_sys_s: Option<f64>,
}

impl BenchResult {
    fn csv_row(&self) -> String {
        let report = &self.report;
        let elapsed_ms = report.elapsed.as_secs_f64() * 1000.0;
        let throughput = if elapsed_ms > 0.0 {
            report.delivered as f64 / (elapsed_ms / 1000.0)
        } else {
            0.0
        };
        let cpu = |value: Option<f64>| {
            value
                .map(|v| format!("{v:.4}"))
                .unwrap_or_else(|| "NA".to_string())
        };
        format!(
            "{},{},{},{},{:.2},{:.2},{},{},{},{},{},{}",
            report.workers,
            report.capacity,
            report.restaurants,
            report.dispatched,
            elapsed_ms,
            throughput,
            report.delivered,
            report.abandoned,
            report.max_in_flight,
            cpu(self.cpu_user_s),
            cpu(self.cpu_sys_s),
            report.double_delivery
        )
    }
}

fn benchmark_once(config: &SimConfig) -> Result<BenchResult> {
    let cpu_start = cpu_times_seconds();
    let report = supervisor::run(config, |_| {})?;
    let (cpu_user_s, cpu_sys_s) = match (cpu_start, cpu_times_seconds()) {
        (Some((user_start, sys_start)), Some((user_end, sys_end))) => {
            (Some(user_end - user_start), Some(sys_end - sys_start))
        }
        _ => (None, None),
    };
    Ok(BenchResult {
        report,
        cpu_user_s,
        cpu_sys_s,
    })
}

fn print_summary(report: &RunReport) {
    let per_rider: Vec<usize> = report.riders.iter().map(|r| r.stats.delivered).collect();
    let scans: usize = report.riders.iter().map(|r| r.stats.scans).sum();
    let riders: Vec<String> = report
        .riders
        .iter()
        .map(|r| format!("{}:{}:{}", r.id, r.strategy, r.stats.abandoned))
        .collect();
    println!("DEMO SUMMARY");
    println!(
        "workers={} capacity={} restaurants={}",
        report.workers, report.capacity, report.restaurants
    );
    println!("orders_dispatched={}", report.dispatched);
    println!("delivered={}", report.delivered);
    println!("abandoned={}", report.abandoned);
    println!("max_in_flight={}", report.max_in_flight);
    println!("final_cursors={}:{}", report.head, report.tail);
    println!("per_rider_delivered={per_rider:?}");
    println!("rider_abandons={}", riders.join(","));
    println!("admission_scans={scans}");
    println!("double_delivery={}", report.double_delivery);
    println!("elapsed_ms={}", report.elapsed.as_millis());
}

/// Run the dispatch simulation, printing a status line per tick.
pub fn run_demo(config: &SimConfig, show_status: bool) -> Result<RunReport> {
    let mut stdout = io::stdout();
    let report = supervisor::run(config, |snapshot| {
        if show_status {
            let _ = writeln!(stdout, "{snapshot}");
        }
    })?;
    println!("done, cleaning up...");
    print_summary(&report);
    Ok(report)
}

/// Single benchmark with CSV output.
pub fn run_benchmark(config: &SimConfig) -> Result<()> {
    config.validate()?;
    let result = benchmark_once(config)?;
    println!("{CSV_HEADER}");
    println!("{}", result.csv_row());
    if config.validate && result.report.double_delivery {
        eprintln!("# violation,double_delivery");
    }
    Ok(())
}

/// Parameter sweep; empty sets keep the base value.
pub struct StressPlan {
    pub worker_sets: Vec<usize>,
    pub capacity_sets: Vec<usize>,
    pub restaurant_sets: Vec<RestaurantId>,
}

impl StressPlan {
    fn configs(&self, base: &SimConfig) -> Vec<SimConfig> {
        let or_base = |set: &[usize], value: usize| {
            if set.is_empty() { vec![value] } else { set.to_vec() }
        };
        let workers = or_base(&self.worker_sets, base.workers);
        let capacities = or_base(&self.capacity_sets, base.capacity);
        let restaurants = if self.restaurant_sets.is_empty() {
            vec![base.restaurants]
        } else {
            self.restaurant_sets.clone()
        };

        let mut configs = Vec::new();
        for &workers in &workers {
            for &capacity in &capacities {
                for &restaurants in &restaurants {
                    configs.push(SimConfig {
                        workers,
                        capacity,
                        restaurants,
                        ..base.clone()
                    });
                }
            }
        }
        configs
    }
}

/// Sweep multiple configurations and print one CSV row each.
///
/// A stalled row is reported and skipped; fatal faults abort the sweep.
pub fn run_stress(base: &SimConfig, plan: &StressPlan) -> Result<()> {
    let configs = plan.configs(base);
    for config in &configs {
        config.validate()?;
    }

    println!("{CSV_HEADER}");
    for config in &configs {
        match benchmark_once(config) {
            Ok(result) => {
                println!("{}", result.csv_row());
                if config.validate && result.report.double_delivery {
                    eprintln!("# violation,double_delivery");
                }
            }
            Err(DispatchError::Stalled(limit)) => {
                warn!(workers = config.workers, capacity = config.capacity, "row stalled");
                eprintln!(
                    "# warning,stalled,{},{},{},{}",
                    config.workers,
                    config.capacity,
                    config.restaurants,
                    limit.as_millis()
                );
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}
