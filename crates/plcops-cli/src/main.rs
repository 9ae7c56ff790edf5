//! plcops - PLC GitOps agent CLI
//!
//! ## Commands
//!
//! - `normalize`: rewrite an exported artifact into its canonical form
//! - `plan`: show what a run would do for every tier, without device contact
//! - `projects`: show which controller project each tier resolves to

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{info, Level};

use plcops_core::{
    plan, resolve_projects, AgentConfig, ArtifactNormalizer, VersionControlGateway,
};

#[derive(Parser)]
#[command(name = "plcops")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "GitOps capture and deploy for PLC projects", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines and command output
    #[arg(long, global = true)]
    json: bool,

    /// Agent configuration (TOML); the three-tier default when omitted
    #[arg(short, long, global = true, env = "PLCOPS_CONFIG")]
    config: Option<PathBuf>,

    /// Repository working copy, overriding the configured one
    #[arg(short, long, global = true, env = "PLCOPS_REPO")]
    repo: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Canonicalize an exported artifact in place
    Normalize {
        /// Artifact to rewrite
        file: PathBuf,
    },

    /// Dry run: report the action each tier would take
    Plan,

    /// Map tiers to controller project files
    Projects {
        /// A project file, or a directory containing one per tier
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    plcops_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Normalize { ref file } => cmd_normalize(file, cli.json),
        Commands::Plan => {
            let config = load_config(cli.config.as_deref(), cli.repo.as_deref())?;
            cmd_plan(&config, cli.json).await
        }
        Commands::Projects { ref path } => {
            let config = load_config(cli.config.as_deref(), cli.repo.as_deref())?;
            cmd_projects(&config, path, cli.json)
        }
    }
}

fn load_config(path: Option<&Path>, repo: Option<&Path>) -> Result<AgentConfig> {
    let config = match path {
        Some(path) => AgentConfig::from_toml_path(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => AgentConfig::default(),
    };
    Ok(match repo {
        Some(repo) => config.with_repo_root(repo),
        None => config,
    })
}

fn cmd_normalize(file: &Path, as_json: bool) -> Result<()> {
    let artifact = ArtifactNormalizer::default()
        .normalize_artifact(file)
        .with_context(|| format!("Failed to normalize {}", file.display()))?;

    if as_json {
        let out = json!({
            "path": artifact.path,
            "rewritten": artifact.rewritten,
            "sha256": artifact.content_hash,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else if artifact.rewritten {
        println!("normalized {} ({})", file.display(), artifact.short_hash());
    } else {
        println!("unchanged {} ({})", file.display(), artifact.short_hash());
    }
    Ok(())
}

async fn cmd_plan(config: &AgentConfig, as_json: bool) -> Result<()> {
    info!(repo = %config.repo_root.display(), tiers = config.tiers.len(), "planning");
    let vcs = VersionControlGateway::system(&config.repo_root, config.remote.clone());
    let entries = plan(config, &vcs).await;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        for entry in &entries {
            println!("{}", entry.line());
        }
    }
    Ok(())
}

fn cmd_projects(config: &AgentConfig, path: &Path, as_json: bool) -> Result<()> {
    let projects = resolve_projects(path, &config.tiers)
        .with_context(|| format!("Failed to resolve projects under {}", path.display()))?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&projects)?);
    } else {
        for (tier, project) in &projects {
            println!("{}: {}", tier, project.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["plcops", "plan", "--json", "--repo", "/tmp/repo"]).unwrap();
        assert!(cli.json);
        assert_eq!(cli.repo, Some(PathBuf::from("/tmp/repo")));
        assert!(matches!(cli.command, Commands::Plan));
    }

    #[test]
    fn test_load_config_defaults_and_repo_override() {
        let config = load_config(None, Some(Path::new("/srv/plc"))).unwrap();
        assert_eq!(config.repo_root, PathBuf::from("/srv/plc"));
        assert_eq!(config.tiers.len(), 3);
    }

    #[test]
    fn test_load_config_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        let err = load_config(Some(&missing), None).unwrap_err();
        assert!(err.to_string().contains("Failed to load config"));
    }

    #[test]
    fn test_normalize_command_rewrites_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("PLC_latest.plcopen.xml");
        std::fs::write(
            &file,
            "<project creationDateTime=\"2024-05-01T10:00:00\">\n</project>\n",
        )
        .unwrap();

        cmd_normalize(&file, false).unwrap();
        let text = std::fs::read_to_string(&file).unwrap();
        assert!(text.contains("creationDateTime=\"1970-01-01T00:00:00\""));
    }

    #[test]
    fn test_projects_command_accepts_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("PLC.project");
        std::fs::write(&file, b"").unwrap();
        cmd_projects(&AgentConfig::default(), &file, true).unwrap();
    }
}
