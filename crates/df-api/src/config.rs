use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use df_core::cost::Pricing;
use df_core::validate::Limits;
use df_core::{ReconcilerSettings, Settings};
use df_db::models::GpuKind;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} is not valid: {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Absent: records live in memory for the lifetime of the process.
    pub database_url: Option<String>,
    pub listen_addr: SocketAddr,
    pub control_plane_api_key: String,
    pub pricing: Pricing,
    pub core: Settings,
}

struct Vars<F>(F);

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn get(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|v| !v.trim().is_empty())
    }

    fn parse<T: FromStr>(&self, name: &'static str, default: T) -> Result<T, ConfigError> {
        match self.get(name) {
            Some(value) => value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { name, value }),
            None => Ok(default),
        }
    }

    fn secs(&self, name: &'static str, default: u64) -> Result<Duration, ConfigError> {
        self.parse(name, default).map(Duration::from_secs)
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| env::var(name).ok())
    }

    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let vars = Vars(lookup);
        let base = Pricing::default();
        let limits = Limits::default();
        let timing = ReconcilerSettings::default();
        let defaults = Settings::default();

        let pricing = Pricing {
            per_cpu_hour: vars.parse("PRICE_CPU_HOUR", base.per_cpu_hour)?,
            per_ram_gb_hour: vars.parse("PRICE_RAM_GB_HOUR", base.per_ram_gb_hour)?,
            per_storage_gb_hour: vars.parse("PRICE_STORAGE_GB_HOUR", base.per_storage_gb_hour)?,
            per_gpu_hour: [
                (GpuKind::NvidiaT4, "PRICE_GPU_T4_HOUR"),
                (GpuKind::NvidiaL4, "PRICE_GPU_L4_HOUR"),
                (GpuKind::NvidiaV100, "PRICE_GPU_V100_HOUR"),
                (GpuKind::NvidiaA100, "PRICE_GPU_A100_HOUR"),
            ]
            .into_iter()
            .map(|(gpu, name)| vars.parse(name, base.gpu_rate(gpu)).map(|rate| (gpu, rate)))
            .collect::<Result<_, ConfigError>>()?,
            markup: vars.parse("PRICE_MARKUP", base.markup)?,
            backup_per_gb_hour: vars.parse("PRICE_BACKUP_GB_HOUR", base.backup_per_gb_hour)?,
        };

        let core = Settings {
            limits: Limits {
                max_cpu_cores: vars.parse("MAX_CPU_CORES", limits.max_cpu_cores)?,
                max_ram_gb: vars.parse("MAX_RAM_GB", limits.max_ram_gb)?,
                max_storage_gb: vars.parse("MAX_STORAGE_GB", limits.max_storage_gb)?,
            },
            reconciler: ReconcilerSettings {
                demo_boot_delay: vars.secs("DEMO_BOOT_DELAY_SECS", timing.demo_boot_delay.as_secs())?,
                provider_boot_delay: vars.secs(
                    "PROVIDER_BOOT_DELAY_SECS",
                    timing.provider_boot_delay.as_secs(),
                )?,
                demo_backup_delay: vars.secs(
                    "DEMO_BACKUP_DELAY_SECS",
                    timing.demo_backup_delay.as_secs(),
                )?,
                poll_interval: vars.secs("POLL_INTERVAL_SECS", timing.poll_interval.as_secs())?,
                restore_max_attempts: vars
                    .parse("RESTORE_MAX_ATTEMPTS", timing.restore_max_attempts)?,
            },
            restore_defaults: defaults.restore_defaults,
        };

        Ok(Self {
            database_url: vars.get("DATABASE_URL"),
            listen_addr: vars.parse("LISTEN_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            control_plane_api_key: vars
                .get("CONTROL_PLANE_API_KEY")
                .ok_or(ConfigError::Missing("CONTROL_PLANE_API_KEY"))?,
            pricing,
            core,
        })
    }
}
