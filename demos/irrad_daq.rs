// Runs a DAQ session from a TOML setup file.
//
// Commands are read from stdin, one JSON object per line:
//   {"target": "hv", "verb": "set_voltage", "payload": {"voltage": 100}}
// Replies and telemetry samples are written to stdout as JSON lines.

use clap::Parser;
use irrad_daq::{Command, Daq, DaqConfig, TelemetryRecorder};
use serde_json::json;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(about = "Irradiation setup DAQ session driven by JSON commands on stdin")]
struct Args {
    /// TOML setup file
    config: PathBuf,

    /// Write the recorded telemetry as CSV files into this directory on exit
    #[arg(long)]
    record: Option<PathBuf>,

    /// Do not print telemetry samples
    #[arg(long)]
    quiet: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    #[cfg(feature = "cpu-profiling")]
    let _tracy = tracy_client::Client::start();

    let args = Args::parse();
    let config: DaqConfig = toml::from_str(&std::fs::read_to_string(&args.config)?)?;
    let daq = Daq::start(&config)?;
    if !daq.unavailable().is_empty() {
        eprintln!("Unavailable devices: {}", daq.unavailable().join(", "));
    }

    let stop = Arc::new(AtomicBool::new(false));
    let printer = {
        let telemetry = daq.telemetry().clone();
        let stop = stop.clone();
        let quiet = args.quiet;
        thread::spawn(move || {
            let mut recorder = TelemetryRecorder::new();
            while !stop.load(Ordering::Acquire) {
                let Ok(sample) = telemetry.recv_timeout(Duration::from_millis(100)) else {
                    continue;
                };
                if !quiet {
                    println!("{}", json!({ "telemetry": sample }));
                }
                recorder.record(sample);
            }
            recorder.extend(telemetry.try_iter());
            recorder
        })
    };

    for line in std::io::stdin().lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Command>(&line) {
            Ok(command) => println!("{}", json!({ "reply": daq.handle(&command) })),
            Err(e) => eprintln!("Ignoring malformed command: {e}"),
        }
    }

    let name = daq.name().to_string();
    for (source, stats) in daq.shutdown() {
        eprintln!("{source}: {} samples, {} failed reads", stats.samples, stats.failures);
    }
    stop.store(true, Ordering::Release);
    let recorder = printer.join().map_err(|_| "telemetry thread panicked")?;

    if let Some(dir) = args.record {
        for path in recorder.write_csv_files(&dir, &name)? {
            eprintln!("Wrote {}", path.display());
        }
    }
    Ok(())
}
