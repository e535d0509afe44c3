use std::{collections::HashMap, fs, path::PathBuf, time::Duration};

#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Login shard that issues handshake tokens and confirmation polls.
    pub login_host: String,
    /// Root directory for the persisted session blob.
    pub storage_root: PathBuf,
    pub user_agent: String,
    /// Base unit of the supervised login backoff; the sleep is this value
    /// multiplied by the retry counter.
    pub retry_base: Duration,
    pub debug: bool,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            login_host: "https://login.weixin.qq.com".into(),
            storage_root: PathBuf::from(".webchat/session"),
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_12_2) AppleWebKit/602.3.12 \
                         (KHTML, like Gecko) Version/10.0.2 Safari/602.3.12"
                .into(),
            retry_base: Duration::from_secs(60),
            debug: false,
        }
    }
}

pub fn load_config() -> BotConfig {
    let mut config = BotConfig::default();

    if let Ok(raw) = fs::read_to_string("bot.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            apply_file_overrides(&mut config, &file_cfg);
        }
    }

    if let Ok(v) = std::env::var("BOT_LOGIN_HOST") {
        config.login_host = v;
    }
    if let Ok(v) = std::env::var("BOT_STORAGE_ROOT") {
        config.storage_root = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("BOT_USER_AGENT") {
        config.user_agent = v;
    }
    if let Ok(v) = std::env::var("BOT_RETRY_BASE_SECS") {
        if let Ok(secs) = v.parse::<u64>() {
            config.retry_base = Duration::from_secs(secs);
        }
    }
    if let Ok(v) = std::env::var("BOT_DEBUG") {
        config.debug = v == "1" || v.eq_ignore_ascii_case("true");
    }

    config
}

fn apply_file_overrides(config: &mut BotConfig, file_cfg: &HashMap<String, String>) {
    if let Some(v) = file_cfg.get("login_host") {
        config.login_host = v.clone();
    }
    if let Some(v) = file_cfg.get("storage_root") {
        config.storage_root = PathBuf::from(v);
    }
    if let Some(v) = file_cfg.get("user_agent") {
        config.user_agent = v.clone();
    }
    if let Some(v) = file_cfg.get("retry_base_secs") {
        if let Ok(secs) = v.parse::<u64>() {
            config.retry_base = Duration::from_secs(secs);
        }
    }
    if let Some(v) = file_cfg.get("debug") {
        config.debug = v == "1" || v.eq_ignore_ascii_case("true");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_overrides_replace_defaults() {
        let mut config = BotConfig::default();
        let mut file_cfg = HashMap::new();
        file_cfg.insert("login_host".to_string(), "http://127.0.0.1:9".to_string());
        file_cfg.insert("retry_base_secs".to_string(), "5".to_string());
        file_cfg.insert("debug".to_string(), "true".to_string());

        apply_file_overrides(&mut config, &file_cfg);

        assert_eq!(config.login_host, "http://127.0.0.1:9");
        assert_eq!(config.retry_base, Duration::from_secs(5));
        assert!(config.debug);
    }

    #[test]
    fn unparseable_retry_base_keeps_default() {
        let mut config = BotConfig::default();
        let mut file_cfg = HashMap::new();
        file_cfg.insert("retry_base_secs".to_string(), "soon".to_string());

        apply_file_overrides(&mut config, &file_cfg);

        assert_eq!(config.retry_base, Duration::from_secs(60));
    }
}
