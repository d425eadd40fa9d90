// src/main.rs

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use tuya_pull::activation::{ActivationOutcome, ActivationSession};
use tuya_pull::config::PullConfig;
use tuya_pull::device::{DeviceIdentity, DeviceVersions, KeySet};
use tuya_pull::errors::{ActivationError, ActivationResult};

/// Pull a device schema from the Tuya activation endpoint.
///
/// Requires a valid device uuid, auth key, and a product or firmware key
/// from a firmware dump, plus a valid provisioning token. The official
/// mobile apps broadcast a token over UDP during the add-device flow; when
/// no token is given, this tool waits for one on the local network.
#[derive(Debug, Parser)]
#[command(name = "tuya_pull", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Activate from credentials passed directly on the command line.
    Input {
        /// 16-character device uuid
        uuid: String,
        /// 32-character auth key
        auth_key: String,
        /// Product key (may be empty when a firmware key is given)
        product_key: String,
        /// Firmware key (may be empty when a product key is given)
        firmware_key: String,
        /// Device software version (softVer)
        software_version: String,
        /// CAD version
        #[arg(long, default_value = "1.0.2")]
        cad_version: String,
        /// Baseline version
        #[arg(long, default_value = "40.00")]
        baseline_version: String,
        /// 14-character provisioning token; omit to wait for a broadcast
        token: Option<String>,
    },
    /// Activate from a device profile directory.
    ///
    /// The directory is scanned for single-line credential files named
    /// `*_uuid.txt`, `*_auth_key.txt`, `*_product_key.txt`,
    /// `*_firmware_key.txt`, `*_swv.txt`, and `*_bv.txt`. The basename of
    /// `*_chip.txt` selects the output file prefix. An existing
    /// `*_schema_id.txt` means the schema was already pulled.
    Directory {
        /// Device profile directory
        directory: PathBuf,
        /// 14-character provisioning token; omit to wait for a broadcast
        token: Option<String>,
    },
}

/// Credentials and output location assembled from either input mode.
struct DeviceProfile {
    uuid: Option<String>,
    auth_key: Option<String>,
    product_key: Option<String>,
    firmware_key: Option<String>,
    versions: DeviceVersions,
    output_dir: PathBuf,
    output_prefix: String,
}

/// Read a credential file that must contain a single line.
fn read_single_line_file(path: &Path) -> ActivationResult<Option<String>> {
    let contents = std::fs::read_to_string(path)?;
    let trimmed = contents.trim_end();
    if trimmed.contains('\n') {
        warn!(path = %path.display(), "ignoring credential file with multiple lines");
        return Ok(None);
    }
    Ok(Some(trimmed.to_string()))
}

/// Scan a profile directory for credential files.
///
/// Returns `None` when a `*_schema_id.txt` already exists — the schema was
/// pulled before and there is nothing to do.
fn load_profile_directory(directory: &Path) -> ActivationResult<Option<DeviceProfile>> {
    let mut profile = DeviceProfile {
        uuid: None,
        auth_key: None,
        product_key: None,
        firmware_key: None,
        versions: DeviceVersions::default(),
        output_dir: directory.to_path_buf(),
        output_prefix: "device".to_string(),
    };

    for entry in std::fs::read_dir(directory)? {
        let entry = entry?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        let path = entry.path();

        if name.ends_with("_uuid.txt") {
            profile.uuid = read_single_line_file(&path)?;
        } else if name.ends_with("_auth_key.txt") {
            profile.auth_key = read_single_line_file(&path)?;
        } else if name.ends_with("_product_key.txt") {
            profile.product_key = read_single_line_file(&path)?;
        } else if name.ends_with("_firmware_key.txt") {
            profile.firmware_key = read_single_line_file(&path)?;
        } else if name.ends_with("_swv.txt") {
            if let Some(v) = read_single_line_file(&path)? {
                profile.versions.soft_ver = v;
            }
        } else if name.ends_with("_bv.txt") {
            if let Some(v) = read_single_line_file(&path)? {
                profile.versions.baseline_ver = v;
            }
        } else if name.ends_with("_chip.txt") {
            profile.output_prefix = name.trim_end_matches("_chip.txt").to_string();
        } else if name.ends_with("_schema_id.txt") {
            info!("schema already present, nothing to pull");
            return Ok(None);
        }
    }

    Ok(Some(profile))
}

/// Persist a successful activation next to the device profile.
fn write_schema(profile: &DeviceProfile, schema_id: &str, schema: &str) -> ActivationResult<()> {
    let id_path = profile
        .output_dir
        .join(format!("{}_schema_id.txt", profile.output_prefix));
    let schema_path = profile
        .output_dir
        .join(format!("{}_schema.txt", profile.output_prefix));

    std::fs::write(&id_path, schema_id)?;
    std::fs::write(&schema_path, schema)?;
    info!(path = %schema_path.display(), "schema written");
    Ok(())
}

async fn run_profile(profile: DeviceProfile, token: Option<String>) -> ActivationResult<()> {
    let config = PullConfig::load()?;

    let identity = DeviceIdentity::new(
        profile.uuid.as_deref(),
        profile.auth_key.as_deref(),
        profile.product_key.as_deref(),
    )?;
    let keys = KeySet::new(profile.product_key.clone(), profile.firmware_key.clone())?;
    let session = ActivationSession::new(identity, keys, profile.versions.clone(), config)?;

    // Ctrl-C cancels the token wait instead of killing the process abruptly.
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_cancel.cancel();
        }
    });

    if token.is_none() {
        println!("[!] No token provided. On the same network, log into the companion app,");
        println!("    start the add-device procedure, and a token will be broadcast.");
        println!("    Note: this joins the device to your account; it can be deleted afterwards.");
        println!("[+] Waiting for multicast token from app...");
    }

    match session.activate(token, cancel).await? {
        ActivationOutcome::Activated { schema_id, schema } => {
            println!("[+] Schema Id: {schema_id}");
            println!("[+] Schema: {schema}");
            write_schema(&profile, &schema_id, &schema)?;
            Ok(())
        }
        ActivationOutcome::Rejected(response) if response.is_expired() => {
            println!(
                "[!] The token provided has either expired, or you are connected to the wrong region"
            );
            Ok(())
        }
        ActivationOutcome::Rejected(response) => {
            // Surface the server's own payload, not a synthesized message.
            println!(
                "[!] Activation failed: errorCode={} errorMsg={}",
                response.error_code.as_deref().unwrap_or("-"),
                response.error_msg.as_deref().unwrap_or("-"),
            );
            Ok(())
        }
    }
}

async fn run(cli: Cli) -> ActivationResult<()> {
    match cli.command {
        Command::Input {
            uuid,
            auth_key,
            product_key,
            firmware_key,
            software_version,
            cad_version,
            baseline_version,
            token,
        } => {
            let profile = DeviceProfile {
                uuid: Some(uuid),
                auth_key: Some(auth_key),
                product_key: Some(product_key).filter(|k| !k.is_empty()),
                firmware_key: Some(firmware_key).filter(|k| !k.is_empty()),
                versions: DeviceVersions {
                    soft_ver: software_version,
                    cad_ver: cad_version,
                    baseline_ver: baseline_version,
                    ..Default::default()
                },
                output_dir: PathBuf::from("."),
                output_prefix: "device".to_string(),
            };
            run_profile(profile, token).await
        }
        Command::Directory { directory, token } => {
            match load_profile_directory(&directory)? {
                Some(profile) => run_profile(profile, token).await,
                // Schema already present.
                None => Ok(()),
            }
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        match err {
            ActivationError::Cancelled => {
                println!("[!] Cancelled waiting for token.");
                std::process::exit(130);
            }
            other => {
                error!("{other}");
                std::process::exit(1);
            }
        }
    }
}
