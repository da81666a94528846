use std::collections::HashMap;

#[derive(Debug)]
pub struct Settings {
    pub server_url: String,
    pub database_url: String,
    pub bearer_token: String,
    pub user_id: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:5000".into(),
            database_url: "sqlite://./data/chat.db".into(),
            bearer_token: String::new(),
            user_id: String::new(),
        }
    }
}

/// Defaults, overridden by `chat.toml` in the working directory, overridden
/// by environment variables.
pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = std::fs::read_to_string("chat.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            if let Some(v) = file_cfg.get("server_url") {
                settings.server_url = v.clone();
            }
            if let Some(v) = file_cfg.get("database_url") {
                settings.database_url = v.clone();
            }
            if let Some(v) = file_cfg.get("bearer_token") {
                settings.bearer_token = v.clone();
            }
            if let Some(v) = file_cfg.get("user_id") {
                settings.user_id = v.clone();
            }
        }
    }

    if let Ok(v) = std::env::var("CHAT_SERVER_URL") {
        settings.server_url = v;
    }
    if let Ok(v) = std::env::var("CHAT_DATABASE_URL") {
        settings.database_url = v;
    }
    if let Ok(v) = std::env::var("CHAT_BEARER_TOKEN") {
        settings.bearer_token = v;
    }
    if let Ok(v) = std::env::var("CHAT_USER_ID") {
        settings.user_id = v;
    }

    settings
}

pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:") || raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_plain_file_path_to_sqlite_url() {
        assert_eq!(
            normalize_database_url("./data/chat.db"),
            "sqlite://./data/chat.db"
        );
        assert_eq!(
            normalize_database_url("sqlite:./data/chat.db"),
            "sqlite://./data/chat.db"
        );
    }

    #[test]
    fn leaves_memory_and_full_urls_untouched() {
        assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(
            normalize_database_url("sqlite:///tmp/chat.db"),
            "sqlite:///tmp/chat.db"
        );
    }

    #[test]
    fn empty_url_falls_back_to_default() {
        assert_eq!(
            normalize_database_url("  "),
            Settings::default().database_url
        );
    }
}
