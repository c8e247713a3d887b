use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use reqwest::Client;
use serde::Deserialize;

use crate::config::ServerConfig;
use crate::daemon;

#[derive(Parser)]
#[command(name = "forkstore")]
#[command(about = "forkstore usage metering daemon and admin CLI", long_about = None)]
pub struct Cli {
    /// Admin API base URL for the query commands.
    #[arg(short, long, env = "FORKSTORE_ADMIN_URL", default_value = "http://127.0.0.1:9898")]
    pub server: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the daemon.
    Serve {
        #[arg(short, long, default_value = "/etc/forkstore/forkstore.toml")]
        config: PathBuf,
    },
    /// Load and validate a config file, then print the effective settings.
    CheckConfig {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show the daemon's health.
    Status,
    /// Show the last computed synthetic size of a tenant.
    TenantSize { tenant_id: String },
    /// List a tenant's timelines.
    Timelines { tenant_id: String },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Serve { ref config } => self.serve(config).await,
            Command::CheckConfig { ref config } => self.check_config(config),
            Command::Status => self.status().await,
            Command::TenantSize { ref tenant_id } => self.tenant_size(tenant_id).await,
            Command::Timelines { ref tenant_id } => self.timelines(tenant_id).await,
        }
    }

    async fn serve(&self, config_path: &Path) -> Result<()> {
        let config = if config_path.exists() {
            ServerConfig::from_file(config_path)?
        } else {
            tracing::warn!(
                "Config file not found, using defaults: {}",
                config_path.display()
            );
            ServerConfig::default()
        };
        daemon::serve(config).await
    }

    fn check_config(&self, config_path: &Path) -> Result<()> {
        let config = ServerConfig::from_file(config_path)?;
        println!("{} is valid", config_path.display());
        println!(
            "metric_collection_endpoint: {}",
            config
                .metric_collection_endpoint
                .as_deref()
                .unwrap_or("<disabled>")
        );
        println!(
            "metric_collection_interval: {}",
            humantime_serde::re::humantime::format_duration(config.metric_collection_interval)
        );
        println!("listen_http_addr: {}", config.listen_http_addr);
        println!(
            "gc_horizon: {}",
            Self::format_bytes(config.tenant_config.gc_horizon)
        );
        println!(
            "gc_period: {}",
            humantime_serde::re::humantime::format_duration(config.tenant_config.gc_period)
        );
        println!(
            "pitr_interval: {}",
            humantime_serde::re::humantime::format_duration(config.tenant_config.pitr_interval)
        );
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.server.trim_end_matches('/'), path);
        let response = Client::new().get(&url).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("Request failed: {}", response.status());
        }
        Ok(response)
    }

    async fn status(&self) -> Result<()> {
        #[derive(Deserialize)]
        struct Health {
            status: String,
            version: String,
        }

        let health: Health = self.get("/health").await?.json().await?;
        println!("Status: {}", health.status);
        println!("Version: {}", health.version);
        Ok(())
    }

    async fn tenant_size(&self, tenant_id: &str) -> Result<()> {
        #[derive(Deserialize)]
        struct Sizes {
            exclusive: u64,
            shared: u64,
            written_size: u64,
        }

        #[derive(Deserialize)]
        struct Report {
            synthetic_size: u64,
            generation: u64,
            timelines: std::collections::BTreeMap<String, Sizes>,
        }

        #[derive(Deserialize)]
        struct Cached {
            report: Report,
            computed_at: String,
        }

        let cached: Cached = self
            .get(&format!("/v1/tenant/{}/size", tenant_id))
            .await?
            .json()
            .await?;

        println!("Tenant: {}", tenant_id);
        println!(
            "Synthetic size: {}",
            Self::format_bytes(cached.report.synthetic_size)
        );
        println!("Generation: {}", cached.report.generation);
        println!("Computed at: {}", cached.computed_at);
        println!();
        println!("{:<34} {:>15} {:>15} {:>15}", "TIMELINE", "EXCLUSIVE", "SHARED", "WRITTEN");
        println!("{}", "-".repeat(82));
        for (timeline, sizes) in cached.report.timelines {
            println!(
                "{:<34} {:>15} {:>15} {:>15}",
                timeline,
                Self::format_bytes(sizes.exclusive),
                Self::format_bytes(sizes.shared),
                Self::format_bytes(sizes.written_size)
            );
        }
        Ok(())
    }

    async fn timelines(&self, tenant_id: &str) -> Result<()> {
        #[derive(Deserialize)]
        struct Ancestor {
            timeline_id: String,
        }

        #[derive(Deserialize)]
        struct Timeline {
            timeline_id: String,
            ancestor: Option<Ancestor>,
            written_size: u64,
            physical_size: u64,
        }

        let timelines: Vec<Timeline> = self
            .get(&format!("/v1/tenant/{}/timeline", tenant_id))
            .await?
            .json()
            .await?;

        println!("{:<34} {:<34} {:>15} {:>15}", "TIMELINE", "ANCESTOR", "WRITTEN", "PHYSICAL");
        println!("{}", "-".repeat(101));
        for timeline in timelines {
            println!(
                "{:<34} {:<34} {:>15} {:>15}",
                timeline.timeline_id,
                timeline
                    .ancestor
                    .map(|a| a.timeline_id)
                    .unwrap_or_else(|| "-".to_string()),
                Self::format_bytes(timeline.written_size),
                Self::format_bytes(timeline.physical_size)
            );
        }
        Ok(())
    }

    fn format_bytes(bytes: u64) -> String {
        const KB: u64 = 1024;
        const MB: u64 = KB * 1024;
        const GB: u64 = MB * 1024;

        if bytes >= GB {
            format!("{:.2} GB", bytes as f64 / GB as f64)
        } else if bytes >= MB {
            format!("{:.2} MB", bytes as f64 / MB as f64)
        } else if bytes >= KB {
            format!("{:.2} KB", bytes as f64 / KB as f64)
        } else {
            format!("{} B", bytes)
        }
    }
}
