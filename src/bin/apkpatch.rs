use anyhow::{Context, Result};
use apkpatch::core::config::{parse_config, RepackConfig, CONFIG_FILE};
use apkpatch::core::logging;
use apkpatch::{load_identity, Replacements};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[clap(long, global = true, default_value = CONFIG_FILE)]
    config: PathBuf,
    /// Log debug output
    #[clap(short, long, global = true)]
    verbose: bool,
    #[clap(subcommand)]
    command: Commands,
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.verbose);
    let config = parse_config(&args.config);
    args.command.run(config)
}

#[derive(Subcommand)]
enum Commands {
    /// Replace entries of an archive without signing it
    Patch {
        source: PathBuf,
        destination: PathBuf,
        #[clap(flatten)]
        replace: ReplaceArgs,
    },
    /// Sign an archive
    Sign {
        input: PathBuf,
        output: PathBuf,
        #[clap(flatten)]
        signing: SigningArgs,
    },
    /// Replace entries and sign the result
    Repack {
        source: PathBuf,
        output: PathBuf,
        #[clap(flatten)]
        replace: ReplaceArgs,
        #[clap(flatten)]
        signing: SigningArgs,
        /// Directory for intermediate archives, defaults to the system temp dir
        #[clap(long)]
        scratch_dir: Option<PathBuf>,
    },
}

#[derive(clap::Args)]
struct ReplaceArgs {
    /// Entry to replace or add, as `PATH=FILE`
    #[clap(long = "replace", value_name = "PATH=FILE", value_parser = parse_replacement)]
    replacements: Vec<(String, PathBuf)>,
}

impl ReplaceArgs {
    fn load(&self) -> Result<Replacements> {
        let mut map = Replacements::new();
        for (path, file) in &self.replacements {
            let bytes = std::fs::read(file)
                .with_context(|| format!("failed to read replacement `{}`", file.display()))?;
            map.insert(path.clone(), bytes);
        }
        Ok(map)
    }
}

#[derive(clap::Args)]
struct SigningArgs {
    /// Directory holding `app_key.pk8` and `app_cert.pem`
    #[clap(long)]
    key_store: Option<PathBuf>,
    /// Lowest platform API level the package installs on
    #[clap(long)]
    min_sdk: Option<u32>,
    /// Also write an APK Signature Scheme v4 `.idsig` file
    #[clap(long)]
    v4: bool,
}

impl SigningArgs {
    fn apply(&self, config: &mut RepackConfig) {
        if let Some(key_store) = &self.key_store {
            config.signing.key_store = key_store.clone();
        }
        if let Some(min_sdk) = self.min_sdk {
            config.signing.min_sdk = min_sdk;
        }
        if self.v4 {
            config.signing.v4_enabled = true;
        }
    }
}

fn parse_replacement(arg: &str) -> Result<(String, PathBuf), String> {
    let (path, file) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected PATH=FILE, got `{}`", arg))?;
    let path = path.trim_start_matches('/');
    if path.is_empty() || file.is_empty() {
        return Err(format!("expected PATH=FILE, got `{}`", arg));
    }
    Ok((path.to_string(), PathBuf::from(file)))
}

impl Commands {
    pub fn run(self, mut config: RepackConfig) -> Result<()> {
        match self {
            Self::Patch {
                source,
                destination,
                replace,
            } => {
                let replacements = replace.load()?;
                let report = apkpatch::Patcher::new(config.replacement_layout())
                    .patch(&source, &destination, &replacements)
                    .with_context(|| format!("failed to patch `{}`", source.display()))?;
                println!(
                    "{}: {} copied, {} replaced, {} appended",
                    destination.display(),
                    report.copied.len(),
                    report.replaced.len(),
                    report.appended.len()
                );
            }
            Self::Sign {
                input,
                output,
                signing,
            } => {
                signing.apply(&mut config);
                let identity = load_identity(&config.signing.key_store).with_context(|| {
                    format!(
                        "failed to load signing identity from `{}`",
                        config.signing.key_store.display()
                    )
                })?;
                let report =
                    apkpatch::sign_with_options(&input, &output, &identity, &config.sign_options())
                        .with_context(|| format!("failed to sign `{}`", input.display()))?;
                println!("{}: signed with {}", output.display(), report.schemes);
            }
            Self::Repack {
                source,
                output,
                replace,
                signing,
                scratch_dir,
            } => {
                signing.apply(&mut config);
                let replacements = replace.load()?;
                let scratch_dir = scratch_dir.unwrap_or_else(std::env::temp_dir);
                let report =
                    apkpatch::repack(&source, &output, &replacements, &config, &scratch_dir)
                        .with_context(|| format!("failed to repack `{}`", source.display()))?;
                println!(
                    "{}: {} replaced, {} appended, signed with {}",
                    output.display(),
                    report.patch.replaced.len(),
                    report.patch.appended.len(),
                    report.sign.schemes
                );
            }
        }
        Ok(())
    }
}
