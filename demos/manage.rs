/**
 * Tuya Manager
 *
 * Smart socket control and status check from the command line:
 *
 *   cargo run --example manage -- --ip 192.168.1.253 --id b654a3f895r5y75a54fqug \
 *       --key '0123456789abcdef' status -d
 *
 * Actions: `status`, `ON`, `OFF`. With an empty `--sfk` the whole status
 * structure is printed instead of a boolean.
 */
use clap::Parser;
use std::process::ExitCode;
use tuyactl::status::{self, DEFAULT_PATH};
use tuyactl::{CommandResponse, Device, TuyaError, Version};

#[derive(Parser, Debug)]
#[command(
    name = "manage",
    about = "Tuya Manager - Tuya smart socket control and status check"
)]
struct Args {
    /// Enable debug messages
    #[arg(short = 'd')]
    debug: bool,

    /// Enable extended output
    #[arg(short = 'e')]
    extended: bool,

    /// Device IP
    #[arg(long)]
    ip: String,

    /// Device ID
    #[arg(long)]
    id: String,

    /// Device local Key
    #[arg(long)]
    key: String,

    /// Tuya protocol version used (3.1, 3.2, 3.3, 3.4 or 3.5)
    #[arg(long, default_value = "3.4")]
    version: Version,

    /// Key to filter device status out of socket output data
    #[arg(long = "status-filter-key", visible_alias = "sfk", default_value = DEFAULT_PATH)]
    status_filter_key: String,

    /// Action to take on the device: status, ON or OFF
    action: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Status,
    Switch(bool),
}

fn parse_action(action: &str) -> Option<Action> {
    match action {
        "status" => Some(Action::Status),
        "ON" => Some(Action::Switch(true)),
        "OFF" => Some(Action::Switch(false)),
        _ => None,
    }
}

/// Boolean of the filtered field, or the whole payload for an empty filter.
fn render(response: &CommandResponse, filter: &str) -> Result<String, TuyaError> {
    if filter.is_empty() {
        return Ok(response.payload.to_string());
    }
    let value = status::extract(filter, response)?;
    Ok(if status::truthy(&value) { "True" } else { "False" }.to_string())
}

async fn get_status(device: &Device, args: &Args) -> Result<String, TuyaError> {
    let response = device.status().await?;
    if args.debug {
        println!("Device status (full): {}", response.payload);
    }
    render(&response, &args.status_filter_key)
}

async fn run(args: &Args) -> Result<ExitCode, TuyaError> {
    let device = Device::builder(args.id.as_str(), args.key.as_bytes())
        .address(args.ip.as_str())
        .version(args.version)
        .build();
    if args.debug {
        println!("{:?}", device);
    }

    match parse_action(&args.action) {
        Some(Action::Status) => println!("{}", get_status(&device, args).await?),
        Some(Action::Switch(on)) => {
            if args.extended {
                println!("Device current status: {}", get_status(&device, args).await?);
            }
            let res = device.set_relay(on).await?;
            if args.debug {
                println!("{:?}", res);
            }
            println!("{}", get_status(&device, args).await?);
        }
        None => {
            println!("Unknown action");
            return Ok(ExitCode::from(1));
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let level = if args.debug { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if args.debug {
        println!("args: {:?}", args);
    }

    match run(&args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("[ERROR] {} ({})", e, e.code());
            ExitCode::from(1)
        }
    }
}
