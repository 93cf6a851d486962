use dotenvy::dotenv;
use std::env;
use std::time::Duration;

#[derive(Clone)]
pub struct Config {
    pub discord_token: String,
    pub channel_id: u64,
    pub database_path: String,
    pub lookback: Duration,
    // Watermark settings
    pub use_watermark: bool,
    pub max_catchup: Duration,
    // Source pacing
    pub page_delay_ms: u64,
}

const PLACEHOLDER_TOKEN: &str = "YOUR_BOT_TOKEN_HERE";
const PLACEHOLDER_CHANNEL_ID: u64 = 123456789012345678;

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok();
        Self::build()
    }

    fn build() -> anyhow::Result<Self> {
        Ok(Config {
            discord_token: env::var("DISCORD_TOKEN")
                .map_err(|_| anyhow::anyhow!("DISCORD_TOKEN must be set"))?,
            channel_id: env::var("DISCORD_CHANNEL_ID")
                .map_err(|_| anyhow::anyhow!("DISCORD_CHANNEL_ID must be set"))?
                .trim()
                .parse()
                .map_err(|_| anyhow::anyhow!("DISCORD_CHANNEL_ID must be a valid u64"))?,
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "discord_messages.db".to_string()),
            lookback: parse_duration_var("LOOKBACK", "1h")?,
            use_watermark: env::var("USE_WATERMARK")
                .unwrap_or_else(|_| "false".to_string())
                .trim()
                .parse()
                .map_err(|_| anyhow::anyhow!("USE_WATERMARK must be true or false"))?,
            max_catchup: parse_duration_var("MAX_CATCHUP", "7d")?,
            page_delay_ms: env::var("PAGE_DELAY_MS")
                .unwrap_or_else(|_| "100".to_string())
                .trim()
                .parse()
                .map_err(|_| anyhow::anyhow!("PAGE_DELAY_MS must be a whole number of milliseconds"))?,
        })
    }

    /// Rejects placeholder or nonsensical values. Must pass before the
    /// store is opened or the source is contacted.
    pub fn validate(&self) -> anyhow::Result<()> {
        let token = self.discord_token.trim();
        if token.is_empty() || token == PLACEHOLDER_TOKEN {
            anyhow::bail!("DISCORD_TOKEN is not configured (placeholder or empty)");
        }
        if self.channel_id == 0 || self.channel_id == PLACEHOLDER_CHANNEL_ID {
            anyhow::bail!("DISCORD_CHANNEL_ID is not configured (placeholder or zero)");
        }
        if self.database_path.trim().is_empty() {
            anyhow::bail!("DATABASE_PATH must not be empty");
        }
        if self.lookback.is_zero() {
            anyhow::bail!("LOOKBACK must be greater than zero");
        }
        if self.max_catchup < self.lookback {
            anyhow::bail!("MAX_CATCHUP must be at least LOOKBACK");
        }
        Ok(())
    }
}

fn parse_duration_var(name: &str, default: &str) -> anyhow::Result<Duration> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    humantime::parse_duration(raw.trim())
        .map_err(|e| anyhow::anyhow!("{} must be a duration like `1h` or `30m`: {}", name, e))
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("discord_token", &"[REDACTED]")
            .field("channel_id", &self.channel_id)
            .field("database_path", &self.database_path)
            .field("lookback", &humantime::format_duration(self.lookback).to_string())
            .field("use_watermark", &self.use_watermark)
            .field(
                "max_catchup",
                &humantime::format_duration(self.max_catchup).to_string(),
            )
            .field("page_delay_ms", &self.page_delay_ms)
            .finish()
    }
}
