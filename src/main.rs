//! vhdpush -- upload a VHD image to an Azure page blob.
//!
//! `push` runs the whole pipeline: credentials from the environment, a
//! management token, local validation, resource group and account key
//! lookup, then a parallel, resumable page blob upload tagged with the
//! image's MD5.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing::{error, info};

use vhdpush::auth::{authenticate, ManagementClients};
use vhdpush::config::{load_config, Config};
use vhdpush::credentials::load_credentials;
use vhdpush::errors::PushError;
use vhdpush::plan::plan_ranges;
use vhdpush::push::{prepare_image, push_prepared, PushOptions};
use vhdpush::range::total_length;
use vhdpush::storage::azure::AzurePageBlobStore;
use vhdpush::upload::StorageTarget;
use vhdpush::vhd::ImageStream;

/// Command-line arguments for vhdpush.
#[derive(Parser, Debug)]
#[command(name = "vhdpush", version, about = "Upload VHD images to Azure page blobs")]
struct Cli {
    /// Path to an optional YAML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log output format.
    #[arg(long = "log-format", global = true, value_parser = ["text", "json"])]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Push a VHD image to a storage account.
    Push(PushArgs),
    /// Run an image (not supported).
    Run {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[derive(Args, Debug)]
struct PushArgs {
    /// Name of the resource group holding the storage account.
    #[arg(long = "resourceGroupName")]
    resource_group_name: Option<String>,

    /// Location of the resource group.
    #[arg(long)]
    location: Option<String>,

    /// Name of the storage account.
    #[arg(long = "accountName")]
    account_name: Option<String>,

    /// Destination container.
    #[arg(long = "containerName")]
    container_name: Option<String>,

    /// Destination blob.
    #[arg(long = "blobName")]
    blob_name: Option<String>,

    /// Number of concurrent page writers (default 8 x CPUs).
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    parallelism: Option<u64>,

    /// Continue an interrupted upload of the same image.
    #[arg(long)]
    resume: bool,

    /// Validate and plan locally without touching Azure.
    #[arg(long = "dry-run")]
    dry_run: bool,

    /// Path (absolute or relative) of the VHD image.
    image_path: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(usage_exit_code(&e));
        }
    };

    let mut config = match &cli.config {
        Some(path) => match load_config(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("vhdpush: {}", e);
                return ExitCode::from(e.exit_code());
            }
        },
        None => Config::default(),
    };
    if let Some(format) = &cli.log_format {
        config.logging.format = format.clone();
    }
    init_tracing(&config);

    match dispatch(cli.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(kind = e.kind(), "{}", e);
            eprintln!("vhdpush: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

/// Help and version requests exit 0; every other parse failure exits 1.
fn usage_exit_code(err: &clap::Error) -> u8 {
    if err.use_stderr() {
        1
    } else {
        0
    }
}

async fn dispatch(command: Command, config: Config) -> Result<(), PushError> {
    match command {
        Command::Push(args) => run_push(args, config).await,
        Command::Run { .. } => Err(PushError::Configuration(
            "the run command is not supported".to_string(),
        )),
    }
}

/// Initialize tracing. `RUST_LOG` takes precedence over the configured level.
fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run_push(args: PushArgs, config: Config) -> Result<(), PushError> {
    let target = StorageTarget {
        resource_group_name: args.resource_group_name.clone().unwrap_or_default(),
        account_name: args
            .account_name
            .clone()
            .unwrap_or_else(|| config.defaults.account_name.clone()),
        container_name: args
            .container_name
            .clone()
            .unwrap_or_else(|| config.defaults.container_name.clone()),
        blob_name: args
            .blob_name
            .clone()
            .unwrap_or_else(|| config.defaults.blob_name.clone()),
    };
    let location = args
        .location
        .clone()
        .unwrap_or_else(|| config.defaults.location.clone());
    let options = PushOptions {
        parallelism: args
            .parallelism
            .map(|n| n as usize)
            .unwrap_or_else(|| config.upload.effective_parallelism()),
        page_size: config.upload.page_size,
        resume: args.resume,
        retry: config.retry.policy(),
    };

    if args.dry_run {
        return dry_run(&args.image_path, &config, &target, &options);
    }

    let clients = connect(&target, &config).await?;

    let image = prepare_image(&args.image_path, config.upload.max_image_size)?;

    clients
        .groups
        .ensure(&target.resource_group_name, &location)
        .await
        .map_err(|e| {
            PushError::remote(
                format!("resource group {}", target.resource_group_name),
                e,
            )
        })?;
    let key = clients
        .accounts
        .primary_key(&target.resource_group_name, &target.account_name)
        .await
        .map_err(|e| {
            PushError::remote(format!("list keys of account {}", target.account_name), e)
        })?;

    let store = AzurePageBlobStore::new(
        &target.account_name,
        &key,
        &config.azure.blob_endpoint_suffix,
        config.azure.http_timeout(),
    )
    .map_err(|e| PushError::remote(format!("storage account {}", target.account_name), e))?;

    let report = push_prepared(Arc::new(store), &target, &image, &options).await?;
    info!(
        "Pushed {} to {} ({} bytes written, {} bytes already present)",
        image.path.display(),
        target,
        report.upload.bytes_uploaded,
        report.upload.already_processed_bytes
    );
    println!(
        "https://{}.{}/{}/{}",
        target.account_name,
        config.azure.blob_endpoint_suffix.trim_matches('.'),
        target.container_name,
        target.blob_name
    );
    Ok(())
}

/// Local preconditions first, then credentials, then the token request.
///
/// Each step fails before the next one starts, so a missing flag never
/// reads the environment and missing variables never reach the network.
async fn connect(
    target: &StorageTarget,
    config: &Config,
) -> Result<ManagementClients, PushError> {
    if target.resource_group_name.trim().is_empty() {
        return Err(PushError::Configuration(
            "--resourceGroupName is required".to_string(),
        ));
    }

    let credentials = load_credentials(&config.azure.env)?;
    let token = authenticate(&config.azure, &credentials).await?;
    ManagementClients::new(&credentials.subscription_id, token, &config.azure)
}

/// Validate, hash and plan without credentials or network calls.
fn dry_run(
    path: &Path,
    config: &Config,
    target: &StorageTarget,
    options: &PushOptions,
) -> Result<(), PushError> {
    let image = prepare_image(path, config.upload.max_image_size)?;
    let ranges = plan_ranges(image.stream.as_ref(), &[], options.page_size)
        .map_err(|e| PushError::io(image.path.display().to_string(), e))?;

    println!("image:       {}", image.path.display());
    println!("disk type:   {:?}", image.info.disk_type);
    println!("size:        {} bytes", image.stream.size());
    println!("md5:         {}", image.metadata.md5_base64());
    println!("destination: {}", target);
    println!(
        "plan:        {} ranges, {} bytes, {} workers",
        ranges.len(),
        total_length(&ranges),
        options.parallelism
    );
    for range in &ranges {
        println!("  {}", range);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{BigEndian, ByteOrder};
    use vhdpush::config::CredentialEnvNames;

    /// Config whose credential variables are unset and whose endpoints
    /// refuse connections, so any network attempt surfaces as an error.
    fn offline_config() -> Config {
        let mut config = Config::default();
        config.azure.env = CredentialEnvNames {
            subscription_id: "VHDPUSH_TEST_UNSET_SUBSCRIPTION_ID".into(),
            tenant_id: "VHDPUSH_TEST_UNSET_TENANT_ID".into(),
            client_id: "VHDPUSH_TEST_UNSET_CLIENT_ID".into(),
            client_secret: "VHDPUSH_TEST_UNSET_CLIENT_SECRET".into(),
        };
        config.azure.active_directory_endpoint = "http://127.0.0.1:9".into();
        config.azure.resource_manager_endpoint = "http://127.0.0.1:9".into();
        config.azure.http_timeout_seconds = 5;
        config
    }

    fn target(resource_group: &str) -> StorageTarget {
        StorageTarget {
            resource_group_name: resource_group.into(),
            account_name: "acct".into(),
            container_name: "c".into(),
            blob_name: "b.vhd".into(),
        }
    }

    fn write_fixed_vhd(dir: &Path, size: usize) -> PathBuf {
        let mut footer = [0u8; 512];
        footer[0..8].copy_from_slice(b"conectix");
        BigEndian::write_u64(&mut footer[16..24], u64::MAX);
        BigEndian::write_u64(&mut footer[40..48], size as u64);
        BigEndian::write_u64(&mut footer[48..56], size as u64);
        BigEndian::write_u32(&mut footer[60..64], 2);
        let sum = footer.iter().fold(0u32, |acc, b| acc.wrapping_add(u32::from(*b)));
        BigEndian::write_u32(&mut footer[64..68], !sum);

        let path = dir.join("disk.vhd");
        let mut bytes = vec![0x5Au8; size];
        bytes.extend_from_slice(&footer);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn parse_push(args: &[&str]) -> PushArgs {
        let mut argv = vec!["vhdpush", "push"];
        argv.extend_from_slice(args);
        match Cli::try_parse_from(argv).unwrap().command {
            Command::Push(args) => args,
            other => panic!("expected push, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_subcommand_exits_1() {
        let err = Cli::try_parse_from(["vhdpush", "bogus"]).unwrap_err();
        assert_eq!(usage_exit_code(&err), 1);
    }

    #[test]
    fn test_bad_flags_exit_1() {
        let err = Cli::try_parse_from(["vhdpush", "push", "--nope", "disk.vhd"]).unwrap_err();
        assert_eq!(usage_exit_code(&err), 1);

        let err =
            Cli::try_parse_from(["vhdpush", "push", "--parallelism", "0", "disk.vhd"]).unwrap_err();
        assert_eq!(usage_exit_code(&err), 1);

        let err = Cli::try_parse_from(["vhdpush", "push"]).unwrap_err();
        assert_eq!(usage_exit_code(&err), 1);
    }

    #[test]
    fn test_help_and_version_exit_0() {
        let err = Cli::try_parse_from(["vhdpush", "--help"]).unwrap_err();
        assert_eq!(usage_exit_code(&err), 0);
        let err = Cli::try_parse_from(["vhdpush", "push", "--help"]).unwrap_err();
        assert_eq!(usage_exit_code(&err), 0);
        let err = Cli::try_parse_from(["vhdpush", "--version"]).unwrap_err();
        assert_eq!(usage_exit_code(&err), 0);
    }

    #[test]
    fn test_push_flags_parse() {
        let args = parse_push(&[
            "--resourceGroupName",
            "rg",
            "--location",
            "northeurope",
            "--accountName",
            "acct",
            "--containerName",
            "images",
            "--blobName",
            "disk.vhd",
            "--parallelism",
            "4",
            "--resume",
            "--dry-run",
            "./disk.vhd",
        ]);
        assert_eq!(args.resource_group_name.as_deref(), Some("rg"));
        assert_eq!(args.location.as_deref(), Some("northeurope"));
        assert_eq!(args.account_name.as_deref(), Some("acct"));
        assert_eq!(args.container_name.as_deref(), Some("images"));
        assert_eq!(args.blob_name.as_deref(), Some("disk.vhd"));
        assert_eq!(args.parallelism, Some(4));
        assert!(args.resume);
        assert!(args.dry_run);
        assert_eq!(args.image_path, PathBuf::from("./disk.vhd"));
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "vhdpush",
            "push",
            "disk.vhd",
            "--log-format",
            "json",
            "--config",
            "vhdpush.yaml",
        ])
        .unwrap();
        assert_eq!(cli.log_format.as_deref(), Some("json"));
        assert_eq!(cli.config, Some(PathBuf::from("vhdpush.yaml")));
    }

    #[tokio::test]
    async fn test_run_command_is_unsupported() {
        let cli = Cli::try_parse_from(["vhdpush", "run", "disk.vhd"]).unwrap();
        let err = dispatch(cli.command, offline_config()).await.unwrap_err();
        assert!(matches!(err, PushError::Configuration(_)));
        assert_eq!(err.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_missing_resource_group_fails_before_credentials() {
        let err = connect(&target("  "), &offline_config()).await.unwrap_err();
        assert_eq!(err.exit_code(), 1);
        let message = err.to_string();
        assert!(message.contains("--resourceGroupName"), "{}", message);
        assert!(!message.contains("VHDPUSH_TEST_UNSET"), "{}", message);
    }

    #[tokio::test]
    async fn test_missing_credentials_fail_before_network() {
        let err = connect(&target("rg"), &offline_config()).await.unwrap_err();
        // An attempted token request would be an authentication error.
        assert!(matches!(err, PushError::Configuration(_)), "{:?}", err);
        let message = err.to_string();
        assert!(message.contains("VHDPUSH_TEST_UNSET_SUBSCRIPTION_ID"));
        assert!(message.contains("VHDPUSH_TEST_UNSET_CLIENT_SECRET"));
    }

    #[tokio::test]
    async fn test_push_without_resource_group_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let image = write_fixed_vhd(dir.path(), 1024 * 1024);
        let args = parse_push(&[image.to_str().unwrap()]);
        let err = run_push(args, offline_config()).await.unwrap_err();
        assert!(matches!(err, PushError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_dry_run_needs_no_credentials_or_network() {
        let dir = tempfile::tempdir().unwrap();
        let image = write_fixed_vhd(dir.path(), 1024 * 1024);
        let args = parse_push(&["--dry-run", image.to_str().unwrap()]);
        run_push(args, offline_config()).await.unwrap();
    }

    #[tokio::test]
    async fn test_dry_run_still_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.vhd");
        std::fs::write(&path, vec![0u8; 4096]).unwrap();
        let args = parse_push(&["--dry-run", path.to_str().unwrap()]);
        let err = run_push(args, offline_config()).await.unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }
}
