use chrono::Utc;
use clap::{Parser, Subcommand};
use client::Client;
use log::info;
use serde::Serialize;
use shared::protocol::parse_wire_date;
use shared::{Poi, PoiType};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:6996")]
    server: String,

    /// Seconds to wait for the connection and for each answer line
    #[arg(short = 't', long, default_value = "10")]
    timeout_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Report a hazard, or confirm a known one nearby
    Submit {
        /// FIXED_SPEED_CAM, MOBILE_SPEED_CAM, ACCIDENT, ROADWORKS or MISCELLANEOUS
        #[arg(long = "type")]
        poi_type: PoiType,
        #[arg(long, allow_negative_numbers = true)]
        lat: f64,
        #[arg(long, allow_negative_numbers = true)]
        lon: f64,
        /// Report date, e.g. 2012-05-03T14:22:01.000+0200 (defaults to now)
        #[arg(long)]
        date: Option<String>,
    },
    /// Report that a hazard received from the server is gone
    NotSeen {
        #[arg(long = "type")]
        poi_type: PoiType,
        #[arg(long, allow_negative_numbers = true)]
        lat: f64,
        #[arg(long, allow_negative_numbers = true)]
        lon: f64,
        /// Creation date of the hazard exactly as the server sent it
        #[arg(long)]
        date: String,
    },
    /// List the hazards around a position
    Query {
        #[arg(long, allow_negative_numbers = true)]
        lat: f64,
        #[arg(long, allow_negative_numbers = true)]
        lon: f64,
        /// Print the answer as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Serialize)]
struct QueryOutput<'a> {
    latitude: f64,
    longitude: f64,
    count: usize,
    pois: &'a [Poi],
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();
    let mut client = Client::new(args.server.clone(), Duration::from_secs(args.timeout_secs));
    info!("Using server {}", args.server);

    match args.command {
        Command::Submit {
            poi_type,
            lat,
            lon,
            date,
        } => {
            let created_at = match date {
                Some(raw) => parse_wire_date(&raw)?,
                None => Utc::now(),
            };
            let poi = poi_type.construct(lat, lon, created_at, 1);
            client.submit(&poi).await?;
            println!("Submitted {}", poi);
        }
        Command::NotSeen {
            poi_type,
            lat,
            lon,
            date,
        } => {
            let poi = Poi::new(poi_type, lat, lon, parse_wire_date(&date)?);
            client.not_seen(&poi).await?;
            println!("Reported as not seen: {}", poi);
        }
        Command::Query { lat, lon, json } => {
            let pois = client.get_infos(lat, lon).await?;
            if json {
                let output = QueryOutput {
                    latitude: lat,
                    longitude: lon,
                    count: pois.len(),
                    pois: &pois,
                };
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                println!("{} hazards around ({}, {})", pois.len(), lat, lon);
                for poi in &pois {
                    println!("  {}", poi);
                }
            }
        }
    }

    // Let the server see a clean end of stream
    client.disconnect();
    Ok(())
}
