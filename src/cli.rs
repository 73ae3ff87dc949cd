use clap::{Args, Parser, Subcommand};

use crate::types::LogLevel;

#[derive(Parser, Debug)]
#[command(
    name = "photomigrate-rs",
    version,
    about = "Migrate photos, videos and albums between photo libraries"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, value_enum, default_value = "info", global = true)]
    pub log_level: LogLevel,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Copy (or move) every album and asset from the source to the target
    Migrate(MigrateArgs),

    /// List the albums of a library
    Albums(AlbumsArgs),
}

#[derive(Args, Debug)]
pub struct MigrateArgs {
    /// Source library directory
    #[arg(short = 's', long)]
    pub source: String,

    /// Target library directory (created if missing)
    #[arg(short = 't', long)]
    pub target: String,

    /// Directory for staged files between pull and push
    #[arg(long, env = "PHOTOMIGRATE_STAGING_DIR")]
    pub staging_dir: Option<String>,

    /// Number of concurrent pushers (default: 2 x logical CPUs)
    #[arg(long)]
    pub pushers: Option<usize>,

    /// Pull everything before pushing anything
    #[arg(long)]
    pub sequential: bool,

    /// Delete assets from the source once they are on the target
    #[arg(long)]
    pub move_assets: bool,

    /// Include albums shared with you
    #[arg(long)]
    pub include_shared: bool,

    /// Don't migrate photos
    #[arg(long)]
    pub skip_photos: bool,

    /// Don't migrate videos
    #[arg(long)]
    pub skip_videos: bool,

    /// Log progress every N seconds
    #[arg(long)]
    pub progress_interval: Option<u64>,

    /// Write the run summary as JSON to this file
    #[arg(long)]
    pub report: Option<String>,
}

#[derive(Args, Debug)]
pub struct AlbumsArgs {
    /// Library directory
    #[arg(short = 's', long)]
    pub source: String,

    /// Include albums shared with you
    #[arg(long)]
    pub include_shared: bool,
}
