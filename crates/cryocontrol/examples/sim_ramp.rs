//! 斜坡监督演示
//!
//! 在模拟仪器（或真实端口）上执行一个两步斜坡计划，周期打印缓存读数和监督状态。
//!
//! ```bash
//! RUST_LOG=info cargo run -p cryocontrol --example sim_ramp -- --time-scale 120
//! RUST_LOG=debug cargo run -p cryocontrol --example sim_ramp -- --port /dev/ttyUSB0 --baud 9600
//! ```

use clap::Parser;
use cryocontrol::prelude::*;
use cryocontrol::transport::{SimConfig, SimTransport};
use std::time::{Duration, Instant};
use tracing::info;

/// 命令行参数
#[derive(Parser, Debug)]
#[command(name = "sim_ramp")]
#[command(about = "Run a two-step ramp plan with an over-temperature interlock")]
struct Args {
    /// 端口（`sim://`、`tcp://host:port`、`gpib://host/addr` 或串口路径）
    #[arg(long, default_value = "sim://demo")]
    port: String,

    /// 串口波特率
    #[arg(long, default_value = "9600")]
    baud: u32,

    /// 模拟器时间倍率（仅 `sim://`）
    #[arg(long, default_value = "60")]
    time_scale: f64,

    /// 第一步目标温度（K）
    #[arg(long, default_value = "20")]
    target: f64,

    /// 升温速率（K/min）
    #[arg(long, default_value = "10")]
    rate: f64,

    /// 保持时间（秒）
    #[arg(long, default_value = "2")]
    hold_sec: u64,

    /// 联锁温度上限（K）
    #[arg(long, default_value = "300")]
    limit: f64,

    /// 最长运行时间（秒）
    #[arg(long, default_value = "60")]
    max_sec: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config = SessionConfig::new(InstrumentConfig::new(&args.port).with_baud(args.baud))
        .with_supervisor(SupervisorConfig::default().with_debounce(Duration::from_millis(500)))
        .with_interlock(Interlock::over_temperature(args.limit));

    let session = if args.port.starts_with("sim://") {
        let sim = SimTransport::new(SimConfig {
            name: args.port.trim_start_matches("sim://").to_string(),
            time_scale: args.time_scale,
            noise: 0.01,
            ..Default::default()
        });
        open_session_with(Box::new(sim), config)?
    } else {
        open_session(config)?
    };

    if let Some(identity) = session.identity() {
        info!("Connected: {}", identity);
    }

    let hold = Duration::from_secs(args.hold_sec);
    let plan = RampPlan::new(vec![
        RampStep::new(args.target, args.rate, hold),
        RampStep::new(args.target / 2.0, args.rate, Duration::ZERO),
    ])?;
    session.start_ramp(plan)?;

    let started = Instant::now();
    let deadline = started + Duration::from_secs(args.max_sec);
    loop {
        std::thread::sleep(Duration::from_millis(500));
        let status = session.status();
        match session.latest_reading() {
            Some(reading) => println!(
                "[{:>6.1}s] {:<18} T={:>7.2} K  SP={:>7.2} K  heater={:>5.1}%  alarms={}",
                started.elapsed().as_secs_f64(),
                status.state.to_string(),
                reading.temperature,
                reading.setpoint,
                reading.heater_power,
                reading.alarms
            ),
            None => println!("[{:>6.1}s] {} (no reading yet)", started.elapsed().as_secs_f64(), status.state),
        }

        if status.state.is_terminal() {
            if let Some(reason) = status.abort_reason {
                println!("Aborted: {}", reason);
            }
            break;
        }
        if Instant::now() >= deadline {
            println!("Time limit reached, cancelling");
            session.cancel();
        }
    }

    let metrics = session.metrics();
    println!(
        "queries={} retries={} timeouts={} poll success={:.1}%",
        metrics.queries,
        metrics.retries,
        metrics.timeouts,
        metrics.poll_success_rate()
    );
    session.close();
    Ok(())
}
