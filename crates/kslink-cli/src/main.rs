//! kslink: keystore client CLI
//!
//! Commands:
//!   status [--json]                       - probe every configured keystore
//!   echo <keystore> [message]             - liveness round-trip
//!   read <keystore> <record>              - print a record's raw contents
//!   write <keystore> <record> <data>      - store a record
//!   set-key <keystore> <key> <hex>        - install a 128-bit key in a slot
//!   encrypt|decrypt <keystore> <key> <hex> [--text]
//!   wrap <keystore> <key> <hex>           - wrap a 32-byte content key
//!   unwrap <keystore> <key> <hex>         - recover a wrapped content key
//!   config show                           - display current configuration
//!
//! Binary arguments and results are hex.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

use kslink_core::{ContentKey, KeyIndex, KslinkConfig, RecordIndex, WrappedKey};
use kslink_dispatch::{Command, Dispatcher, Request};
use kslink_link::KeystoreLink;

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "kslink", version, about = "PSK-TLS keystore client")]
struct Cli {
    /// Path to kslink configuration file
    #[arg(
        long,
        short = 'c',
        env = "KSLINK_CONFIG",
        default_value = "/etc/kslink/config.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides [client].log_level
    #[arg(long, env = "KSLINK_LOG")]
    log: Option<String>,

    /// Log format; overrides [client].log_format
    #[arg(long, env = "KSLINK_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Probe every configured keystore with an echo
    Status {
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Send an echo and check it comes back
    Echo {
        keystore: String,
        #[arg(default_value = "kslink")]
        message: String,
    },

    /// Read a record (0..=31)
    Read {
        keystore: String,
        record: i64,
        /// Print the response as hex instead of text
        #[arg(long)]
        hex: bool,
    },

    /// Write a record (0..=31)
    Write {
        keystore: String,
        record: i64,
        data: String,
        /// Treat <data> as hex
        #[arg(long)]
        hex: bool,
    },

    /// Install a 16-byte AES key (32 hex digits) in a key slot (0..=3)
    #[command(name = "set-key")]
    SetKey {
        keystore: String,
        key: i64,
        material: String,
    },

    /// Encrypt 1..=16 blocks (hex) with a key slot
    Encrypt {
        keystore: String,
        key: i64,
        data: String,
        /// Use the hex text wire variant
        #[arg(long)]
        text: bool,
    },

    /// Decrypt 1..=16 blocks (hex) with a key slot
    Decrypt {
        keystore: String,
        key: i64,
        data: String,
        /// Use the hex text wire variant
        #[arg(long)]
        text: bool,
    },

    /// Wrap a 32-byte content key (64 hex digits)
    Wrap {
        keystore: String,
        key: i64,
        content_key: String,
    },

    /// Unwrap a 48-byte wrapped key (96 hex digits)
    Unwrap {
        keystore: String,
        key: i64,
        wrapped: String,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, found) = load_config(&cli.config).await?;

    let level = cli.log.as_deref().unwrap_or(&config.client.log_level);
    let format = cli.log_format.clone().unwrap_or_else(|| {
        match config.client.log_format.as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Text,
        }
    });
    init_logging(level, &format);
    if !found {
        warn!("config file not found: {}  (using defaults)", cli.config.display());
    }

    match cli.command {
        Commands::Config { action: ConfigAction::Show } => cmd_config_show(&config, &cli.config, found),
        Commands::Status { json } => {
            let rows = blocking(move || probe_all(&config)).await?;
            print_status(&rows, json)
        }
        Commands::Echo { keystore, message } => {
            let started = Instant::now();
            call(config, keystore.clone(), Command::Echo(message)).await?;
            println!("{keystore}: ok ({} ms)", started.elapsed().as_millis());
            Ok(())
        }
        Commands::Read { keystore, record, hex: as_hex } => {
            let command = Command::ReadRecord(RecordIndex::new(record)?);
            let data = call(config, keystore, command).await?;
            if as_hex {
                println!("{}", hex::encode(&data));
            } else {
                println!("{}", String::from_utf8_lossy(&data).trim_end());
            }
            Ok(())
        }
        Commands::Write { keystore, record, data, hex: as_hex } => {
            let index = RecordIndex::new(record)?;
            let data = if as_hex { decode_hex("data", &data)? } else { data.into_bytes() };
            call(config, keystore.clone(), Command::WriteRecord { index, data }).await?;
            println!("{keystore}: record {index} written");
            Ok(())
        }
        Commands::SetKey { keystore, key, material } => {
            let index = KeyIndex::new(key)?;
            let key: [u8; 16] = decode_hex("key material", &material)?
                .try_into()
                .map_err(|v: Vec<u8>| anyhow::anyhow!("key material must be 16 bytes, got {}", v.len()))?;
            call(config, keystore.clone(), Command::SetKey { index, key }).await?;
            println!("{keystore}: key {index} installed");
            Ok(())
        }
        Commands::Encrypt { keystore, key, data, text } => {
            let index = KeyIndex::new(key)?;
            let data = decode_hex("data", &data)?;
            let command = if text {
                Command::EncryptHex { index, data }
            } else {
                Command::EncryptBlock { index, data }
            };
            println!("{}", hex::encode(call(config, keystore, command).await?));
            Ok(())
        }
        Commands::Decrypt { keystore, key, data, text } => {
            let index = KeyIndex::new(key)?;
            let data = decode_hex("data", &data)?;
            let command = if text {
                Command::DecryptHex { index, data }
            } else {
                Command::DecryptBlock { index, data }
            };
            println!("{}", hex::encode(call(config, keystore, command).await?));
            Ok(())
        }
        Commands::Wrap { keystore, key, content_key } => {
            let index = KeyIndex::new(key)?;
            let key = ContentKey::from_slice(&decode_hex("content key", &content_key)?)?;
            println!("{}", hex::encode(call(config, keystore, Command::WrapKey { index, key }).await?));
            Ok(())
        }
        Commands::Unwrap { keystore, key, wrapped } => {
            let index = KeyIndex::new(key)?;
            let wrapped = WrappedKey::from_slice(&decode_hex("wrapped key", &wrapped)?)?;
            let command = Command::UnwrapKey { index, wrapped };
            println!("{}", hex::encode(call(config, keystore, command).await?));
            Ok(())
        }
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

/// Returns the config and whether it came from a file.
async fn load_config(path: &Path) -> Result<(KslinkConfig, bool)> {
    if !path.exists() {
        return Ok((KslinkConfig::default(), false));
    }
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading config: {}", path.display()))?;
    let config = toml::from_str(&content)
        .with_context(|| format!("parsing config: {}", path.display()))?;
    Ok((config, true))
}

fn decode_hex(what: &str, input: &str) -> Result<Vec<u8>> {
    hex::decode(input.trim()).with_context(|| format!("{what} is not valid hex"))
}

/// Keystore calls block on sockets and condvars; keep them off the runtime.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("keystore task panicked")?
}

// ── Single-keystore commands ──────────────────────────────────────────────────

async fn call(config: KslinkConfig, keystore: String, command: Command) -> Result<Vec<u8>> {
    blocking(move || {
        let dispatcher = dispatcher_for(&config, &keystore)?;
        let request = Request::new(keystore.as_str(), command);
        dispatcher.dispatch(&request)?;
        let result = request
            .get_response(config.client.request_timeout())
            .with_context(|| format!("{} on {keystore}", request.operation()));
        dispatcher.stop_all();
        result
    })
    .await
}

/// A dispatcher holding only `keystore`, already connected.
fn dispatcher_for(config: &KslinkConfig, keystore: &str) -> Result<Dispatcher> {
    let endpoint = config
        .endpoints()?
        .into_iter()
        .find(|e| e.servername == keystore)
        .with_context(|| format!("keystore {keystore} is not in the configuration"))?;

    let dispatcher = Dispatcher::new(config.client.clone());
    dispatcher.register_link(KeystoreLink::tls(endpoint, &config.client))?;
    if let Some((name, e)) = dispatcher.start_all().into_iter().next() {
        return Err(e).with_context(|| format!("connecting to {name}"));
    }
    Ok(dispatcher)
}

// ── `kslink status` ───────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct StatusRow {
    keystore: String,
    host: String,
    port: u16,
    up: bool,
    latency_ms: Option<u64>,
    error: Option<String>,
}

fn probe_all(config: &KslinkConfig) -> Result<Vec<StatusRow>> {
    let endpoints = config.endpoints()?;
    let dispatcher = Dispatcher::from_config(config)?;
    let failures = dispatcher.start_all();
    let timeout = config.client.request_timeout();

    let started = Instant::now();
    let probes: Vec<_> = endpoints
        .iter()
        .filter(|e| !failures.iter().any(|(name, _)| *name == e.servername))
        .map(|e| {
            let request = Request::new(e.servername.as_str(), Command::Echo("kslink-status".into()));
            let queued = dispatcher.dispatch(&request);
            (e.servername.clone(), request, queued)
        })
        .collect();

    let mut rows: Vec<StatusRow> = endpoints
        .iter()
        .map(|e| StatusRow {
            keystore: e.servername.clone(),
            host: e.hostname.clone(),
            port: e.port,
            up: false,
            latency_ms: None,
            error: failures
                .iter()
                .find(|(name, _)| *name == e.servername)
                .map(|(_, err)| err.to_string()),
        })
        .collect();

    for (name, request, queued) in probes {
        let outcome = queued.and_then(|()| request.get_response(timeout));
        let Some(row) = rows.iter_mut().find(|r| r.keystore == name) else {
            continue;
        };
        match outcome {
            Ok(_) => {
                row.up = true;
                row.latency_ms = Some(started.elapsed().as_millis() as u64);
            }
            Err(e) => row.error = Some(e.to_string()),
        }
    }

    dispatcher.stop_all();
    let up = rows.iter().filter(|r| r.up).count();
    info!(keystores = rows.len(), up, "status probe complete");
    Ok(rows)
}

fn print_status(rows: &[StatusRow], json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(rows).context("serializing status")?
        );
        return Ok(());
    }
    if rows.is_empty() {
        println!("no keystores configured");
        return Ok(());
    }
    for row in rows {
        let state = if row.up { "up" } else { "down" };
        let detail = match (&row.latency_ms, &row.error) {
            (Some(ms), _) => format!("{ms} ms"),
            (None, Some(err)) => err.clone(),
            (None, None) => String::new(),
        };
        println!(
            "{:<20} {:>21}  {:<4}  {detail}",
            row.keystore,
            format!("{}:{}", row.host, row.port),
            state
        );
    }
    Ok(())
}

// ── `kslink config show` ──────────────────────────────────────────────────────

fn cmd_config_show(config: &KslinkConfig, config_path: &Path, found: bool) -> Result<()> {
    if found {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let mut shown = config.clone();
    for server in shown.servers.values_mut() {
        for entry in &mut server.keystores {
            entry.psk = "<redacted>".into();
        }
    }
    let rendered = toml::to_string_pretty(&shown).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_encrypt_with_text_flag() {
        let cli = Cli::try_parse_from([
            "kslink", "encrypt", "key17.com", "1", "00112233445566778899aabbccddeeff", "--text",
        ])
        .unwrap();
        match cli.command {
            Commands::Encrypt { keystore, key, text, .. } => {
                assert_eq!(keystore, "key17.com");
                assert_eq!(key, 1);
                assert!(text);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn hex_arguments_are_validated() {
        assert_eq!(decode_hex("data", " 00ff ").unwrap(), vec![0x00, 0xff]);
        assert!(decode_hex("data", "xyz").is_err());
    }

    #[test]
    fn status_json_shape() {
        let rows = vec![StatusRow {
            keystore: "key17.com".into(),
            host: "10.0.0.1".into(),
            port: 4433,
            up: true,
            latency_ms: Some(12),
            error: None,
        }];
        let json = serde_json::to_value(&rows).unwrap();
        assert_eq!(json[0]["keystore"], "key17.com");
        assert_eq!(json[0]["up"], true);
        assert!(json[0]["error"].is_null());
    }
}
