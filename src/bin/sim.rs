//! beacon-sim - scripted walk through a site, as a beacon-ctrl feed
//!
//! Emits newline-delimited `PipelineInput` JSON on stdout: the walker visits
//! each zone in turn, approaching its beacons pass by pass, then walks away
//! (region exits). An optional flicker drops the closest beacon for one pass.
//!
//! Usage:
//!   beacon-sim site > config/site.json
//!   beacon-sim walk --site config/site.json --interval-ms 1000 | beacon-ctrl

use anyhow::{Context, Result};
use beacon_ctrl::domain::registry::SiteConfiguration;
use beacon_ctrl::domain::types::{BeaconKey, RawSample};
use beacon_ctrl::services::PipelineInput;
use clap::{Parser, Subcommand};
use serde_json::json;
use std::io::Write;
use std::time::Duration;

/// beacon-sim - generate beacon-ctrl feeds
#[derive(Parser, Debug)]
#[command(name = "beacon-sim", version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a sample site configuration
    Site,
    /// Walk through every zone of a site
    Walk {
        /// Site configuration JSON
        #[arg(short, long, default_value = "config/site.json")]
        site: String,
        /// Ranging passes spent in each zone
        #[arg(long, default_value_t = 15)]
        passes: u32,
        /// Pause between passes (0 = as fast as possible)
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
        /// Drop the closest beacon for one pass mid-visit
        #[arg(long)]
        flicker: bool,
    },
}

fn sample_site() -> serde_json::Value {
    json!({
        "beacons": [
            {"protocol": "eddystone", "namespace": "edd1ebeac04e5defa017", "instance": "0000000000a1", "name": "entrance-left"},
            {"protocol": "eddystone", "namespace": "edd1ebeac04e5defa017", "instance": "0000000000a2", "name": "entrance-right"},
            {"protocol": "ibeacon", "proximity_uuid": "f7826da6-4fa2-4e98-8024-bc5b71e0893e", "major": 100, "minor": 1, "name": "checkout"}
        ],
        "zones": [
            {"id": "entrance", "name": "Entrance", "beacons": ["edd1ebeac04e5defa017+0000000000a1", "edd1ebeac04e5defa017+0000000000a2"]},
            {"id": "checkout", "name": "Checkout", "beacons": ["f7826da6-4fa2-4e98-8024-bc5b71e0893e+100+1"]}
        ],
        "triggers": [
            {"id": 1, "scope": {"type": "zone", "id": "entrance"},
             "conditions": [{"kind": "enter"}],
             "actions": [{"id": 101, "name": "welcome", "type": "url",
                          "payload": {"url": "https://example.org/welcome"}}]},
            {"id": 2, "scope": {"type": "zone", "id": "checkout"},
             "conditions": [{"kind": "dwell_time", "threshold_ms": 5000}],
             "actions": [{"id": 201, "name": "loyalty", "type": "custom",
                          "custom_values": ["points", 10]}]},
            {"id": 3, "scope": {"type": "zone", "id": "checkout"},
             "conditions": [{"kind": "leave"}],
             "actions": [{"id": 301, "name": "goodbye", "type": "custom"}]}
        ],
        "extensions": ["event_log"]
    })
}

/// Distance on pass `i` of `n`: walk in from 4 m to 0.4 m
fn approach_distance(i: u32, n: u32) -> f64 {
    let t = f64::from(i) / f64::from(n.max(1));
    4.0 - 3.6 * t
}

struct Walker<W: Write> {
    out: W,
    regions: Vec<BeaconKey>,
    interval: Duration,
}

impl<W: Write> Walker<W> {
    fn emit(&mut self, input: &PipelineInput) -> Result<()> {
        let line = serde_json::to_string(input)?;
        writeln!(self.out, "{line}").context("write feed line")?;
        self.out.flush().context("flush feed")
    }

    /// One ranging pass: every region reports, `visible` carry samples
    async fn pass(&mut self, visible: &[(BeaconKey, f64)]) -> Result<()> {
        for region in self.regions.clone() {
            let samples = visible
                .iter()
                .filter(|(k, _)| *k == region)
                .map(|(k, d)| RawSample::new(k.clone(), rssi_for(*d), *d))
                .collect();
            self.emit(&PipelineInput::Ranging { region, samples })?;
        }
        if !self.interval.is_zero() {
            tokio::time::sleep(self.interval).await;
        }
        Ok(())
    }
}

/// Rough log-distance path loss, 1 m reference at -59 dBm
fn rssi_for(distance_m: f64) -> i32 {
    (-59.0 - 20.0 * distance_m.max(0.1).log10()).round() as i32
}

async fn walk(site_path: &str, passes: u32, interval_ms: u64, flicker: bool) -> Result<()> {
    let raw = std::fs::read_to_string(site_path).with_context(|| format!("read {site_path}"))?;
    let site = SiteConfiguration::from_json(&raw).with_context(|| format!("parse {site_path}"))?;

    let stdout = std::io::stdout();
    let mut walker = Walker {
        out: stdout.lock(),
        regions: site.beacons.iter().map(|b| b.identity.key()).collect(),
        interval: Duration::from_millis(interval_ms),
    };
    walker.emit(&PipelineInput::Background { background: false })?;

    for zone in &site.zones {
        let members: Vec<BeaconKey> = zone.beacons.iter().cloned().collect();
        for key in &members {
            walker.emit(&PipelineInput::RegionEnter { region: key.clone() })?;
        }
        for i in 0..passes {
            let d = approach_distance(i, passes);
            // Later members sit a little further away
            let mut visible: Vec<(BeaconKey, f64)> =
                members.iter().enumerate().map(|(n, k)| (k.clone(), d + n as f64 * 1.5)).collect();
            if flicker && i == passes / 2 {
                if let Some((closest, _)) = visible.first().cloned() {
                    walker.emit(&PipelineInput::RegionExit { region: closest })?;
                    visible.remove(0);
                }
            }
            walker.pass(&visible).await?;
        }
        for key in &members {
            walker.emit(&PipelineInput::RegionExit { region: key.clone() })?;
        }
        walker.pass(&[]).await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    match args.command {
        Command::Site => {
            println!("{}", serde_json::to_string_pretty(&sample_site())?);
            Ok(())
        }
        Command::Walk { site, passes, interval_ms, flicker } => walk(&site, passes, interval_ms, flicker).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_site_is_valid() {
        let site = SiteConfiguration::from_json(&sample_site().to_string()).unwrap();
        assert!(beacon_ctrl::domain::registry::Registry::from_site(site).is_ok());
    }

    #[test]
    fn test_approach_and_rssi() {
        assert!((approach_distance(0, 10) - 4.0).abs() < 1e-9);
        assert!(approach_distance(9, 10) < 1.0);
        assert_eq!(rssi_for(1.0), -59);
        assert!(rssi_for(4.0) < rssi_for(1.0));
    }

    #[tokio::test]
    async fn test_pass_reports_every_region() {
        let a = BeaconKey::new("n+a");
        let b = BeaconKey::new("n+b");
        let mut walker = Walker { out: Vec::new(), regions: vec![a.clone(), b], interval: Duration::ZERO };
        walker.pass(&[(a, 1.0)]).await.unwrap();

        let text = String::from_utf8(walker.out).unwrap();
        let inputs: Vec<PipelineInput> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(inputs.len(), 2);
        assert!(matches!(&inputs[0], PipelineInput::Ranging { samples, .. } if samples.len() == 1));
        assert!(matches!(&inputs[1], PipelineInput::Ranging { samples, .. } if samples.is_empty()));
    }
}
