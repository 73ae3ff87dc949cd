use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cli::MigrateArgs;
use crate::migrate::{MigrationConfig, PipelineMode, PullFilter};

/// Staging directory used when none is given.
const DEFAULT_STAGING_DIR: &str = "~/.photomigrate-rs/staging";

/// Validated configuration of a `migrate` run.
#[derive(Debug, Clone)]
pub struct Config {
    pub source: PathBuf,
    pub target: PathBuf,
    pub staging_dir: PathBuf,
    pub report: Option<PathBuf>,

    pub progress_interval: Option<u64>,
    pub pushers: usize,

    pub sequential: bool,
    pub move_assets: bool,
    pub include_shared: bool,
    pub skip_photos: bool,
    pub skip_videos: bool,
}

pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

/// Default pusher pool size: two per logical CPU.
pub fn default_pushers() -> usize {
    (2 * num_cpus::get()).max(1)
}

/// Resolve symlinks where the path exists, otherwise just make it absolute,
/// so that containment checks compare like with like.
fn normalize(path: &Path) -> PathBuf {
    std::fs::canonicalize(path)
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

impl Config {
    pub fn from_cli(args: MigrateArgs) -> anyhow::Result<Self> {
        let source = expand_tilde(&args.source);
        let target = expand_tilde(&args.target);
        let staging_dir = expand_tilde(args.staging_dir.as_deref().unwrap_or(DEFAULT_STAGING_DIR));

        let pushers = match args.pushers {
            Some(0) => anyhow::bail!("--pushers must be at least 1"),
            Some(n) => n,
            None => default_pushers(),
        };
        if args.progress_interval == Some(0) {
            anyhow::bail!("--progress-interval must be at least 1 second");
        }
        if args.skip_photos && args.skip_videos {
            anyhow::bail!("--skip-photos and --skip-videos together leave nothing to migrate");
        }

        let (src, dst, stage) = (normalize(&source), normalize(&target), normalize(&staging_dir));
        if src == dst {
            anyhow::bail!("Source and target are the same directory: {}", source.display());
        }
        if dst.starts_with(&src) || src.starts_with(&dst) {
            anyhow::bail!(
                "Source {} and target {} must not contain each other",
                source.display(),
                target.display()
            );
        }
        for (role, library) in [("source", &src), ("target", &dst)] {
            if stage.starts_with(library) {
                anyhow::bail!(
                    "Staging directory {} must not be inside the {} library",
                    staging_dir.display(),
                    role
                );
            }
        }

        Ok(Self {
            source,
            target,
            staging_dir,
            report: args.report.map(|r| expand_tilde(&r)),
            progress_interval: args.progress_interval,
            pushers,
            sequential: args.sequential,
            move_assets: args.move_assets,
            include_shared: args.include_shared,
            skip_photos: args.skip_photos,
            skip_videos: args.skip_videos,
        })
    }

    /// The engine-facing part of the configuration.
    pub fn to_migration_config(&self) -> MigrationConfig {
        MigrationConfig {
            staging_dir: self.staging_dir.clone(),
            pushers: self.pushers,
            mode: if self.sequential {
                PipelineMode::Sequential
            } else {
                PipelineMode::Parallel
            },
            move_assets: self.move_assets,
            filter: PullFilter {
                include_shared: self.include_shared,
                skip_photos: self.skip_photos,
                skip_videos: self.skip_videos,
            },
            progress_interval: self.progress_interval.map(Duration::from_secs),
        }
    }
}
