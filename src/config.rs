//! Hub configuration module
//!
//! Parses and manages the character hub configuration from YAML files.
//!
//! Uses serde_yaml for parsing: every optional field carries a
//! `default_*` helper, and `validate` rejects values the hub cannot run with.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Upper bound for `max_map_servers`.
pub const MAP_SERVER_LIMIT: usize = 30;

/// Upstream credentials travel in 24-byte fields (NUL terminated).
pub const LOGIN_CRED_MAX: usize = 23;

/// Worker credentials travel in 32-byte fields (NUL terminated).
pub const MAP_CRED_MAX: usize = 31;

/// Table names used by the store.
///
/// Defaults match `migrations/0001_hub.sql`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableConfig {
    pub char: String,
    pub memo: String,
    pub skill: String,
    pub friends: String,
    pub hotkey: String,
    pub guild: String,
    pub guild_member: String,
    pub guild_position: String,
    pub guild_alliance: String,
    pub guild_expulsion: String,
    pub guild_skill: String,
    pub party: String,
    pub party_member: String,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            char: "char".into(),
            memo: "memo".into(),
            skill: "skill".into(),
            friends: "friends".into(),
            hotkey: "hotkey".into(),
            guild: "guild".into(),
            guild_member: "guild_member".into(),
            guild_position: "guild_position".into(),
            guild_alliance: "guild_alliance".into(),
            guild_expulsion: "guild_expulsion".into(),
            guild_skill: "guild_skill".into(),
            party: "party".into(),
            party_member: "party_member".into(),
        }
    }
}

impl TableConfig {
    fn all(&self) -> [(&'static str, &str); 13] {
        [
            ("char", &self.char),
            ("memo", &self.memo),
            ("skill", &self.skill),
            ("friends", &self.friends),
            ("hotkey", &self.hotkey),
            ("guild", &self.guild),
            ("guild_member", &self.guild_member),
            ("guild_position", &self.guild_position),
            ("guild_alliance", &self.guild_alliance),
            ("guild_expulsion", &self.guild_expulsion),
            ("guild_skill", &self.guild_skill),
            ("party", &self.party),
            ("party_member", &self.party_member),
        ]
    }
}

/// Main hub configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    // ============================================
    // MySQL Database Configuration
    // ============================================
    pub sql_ip: String,

    #[serde(default = "default_sql_port")]
    pub sql_port: u16,

    pub sql_id: String,
    pub sql_pw: String,
    pub sql_db: String,

    /// The hub works against one store connection.
    #[serde(default = "default_sql_max_connections")]
    pub sql_max_connections: u32,

    /// Run the bundled migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    // ============================================
    // Login Server (upstream) Configuration
    // ============================================
    /// Credentials presented to the login server (23 chars max)
    pub login_id: String,
    pub login_pw: String,

    pub login_ip: String,

    #[serde(default = "default_login_port")]
    pub login_port: u16,

    #[serde(default = "default_login_reconnect_secs")]
    pub login_reconnect_secs: u64,

    #[serde(default = "default_login_ping_secs")]
    pub login_ping_secs: u64,

    /// Name announced to the login server
    #[serde(default = "default_server_name")]
    pub server_name: String,

    // ============================================
    // Character Hub Configuration
    // ============================================
    /// Credentials every map server must present (31 chars max)
    pub char_id: String,
    pub char_pw: String,

    pub char_ip: String,

    #[serde(default = "default_char_port")]
    pub char_port: u16,

    /// Fixed number of map server slots
    #[serde(default = "default_max_map_servers")]
    pub max_map_servers: usize,

    // ============================================
    // Timing
    // ============================================
    /// Total time budget for one guild/party flush cycle
    #[serde(default = "default_autosave_interval_ms")]
    pub autosave_interval_ms: u64,

    /// Grace period after asking a map server to drop a player
    #[serde(default = "default_auth_timeout_ms")]
    pub auth_timeout_ms: u64,

    /// Lifetime of an unredeemed ticket
    #[serde(default = "default_ticket_timeout_secs")]
    pub ticket_timeout_secs: u64,

    #[serde(default = "default_online_cleanup_secs")]
    pub online_cleanup_secs: u64,

    // ============================================
    // Policy
    // ============================================
    /// Require the redeeming client IP to match the ticket
    #[serde(default)]
    pub check_ticket_ip: bool,

    /// Maximum level spread for party even-share
    #[serde(default = "default_party_share_level")]
    pub party_share_level: u32,

    #[serde(default)]
    pub tables: TableConfig,
}

// ============================================
// Default value functions
// These are called by serde when a field is missing
// ============================================

fn default_sql_port() -> u16 {
    3306
}

fn default_sql_max_connections() -> u32 {
    1
}

fn default_login_port() -> u16 {
    6900
}

fn default_login_reconnect_secs() -> u64 {
    10
}

fn default_login_ping_secs() -> u64 {
    30
}

fn default_server_name() -> String {
    "Hub".to_string()
}

fn default_char_port() -> u16 {
    6121
}

fn default_max_map_servers() -> usize {
    2
}

fn default_autosave_interval_ms() -> u64 {
    300_000
}

fn default_auth_timeout_ms() -> u64 {
    30_000
}

fn default_ticket_timeout_secs() -> u64 {
    60
}

fn default_online_cleanup_secs() -> u64 {
    600
}

fn default_party_share_level() -> u32 {
    15
}

impl ServerConfig {
    /// Load configuration from a YAML file
    ///
    /// # Example
    /// ```no_run
    /// use charhub::config::ServerConfig;
    ///
    /// let config = ServerConfig::from_file("conf/char.yaml")
    ///     .expect("Failed to load config");
    /// println!("SQL DB: {}", config.sql_db);
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: ServerConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse YAML in {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Parse configuration from a YAML string
    pub fn from_str(contents: &str) -> Result<Self> {
        let config: ServerConfig = serde_yaml::from_str(contents)
            .context("Failed to parse YAML")?;

        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.sql_ip.is_empty(), "sql_ip cannot be empty");
        anyhow::ensure!(!self.sql_id.is_empty(), "sql_id cannot be empty");
        anyhow::ensure!(!self.sql_db.is_empty(), "sql_db cannot be empty");
        anyhow::ensure!(!self.char_ip.is_empty(), "char_ip cannot be empty");
        anyhow::ensure!(!self.login_ip.is_empty(), "login_ip cannot be empty");
        anyhow::ensure!(self.sql_max_connections >= 1, "sql_max_connections must be at least 1");

        anyhow::ensure!(
            (1..=MAP_SERVER_LIMIT).contains(&self.max_map_servers),
            "max_map_servers out of range: {} (1..={})",
            self.max_map_servers,
            MAP_SERVER_LIMIT
        );

        anyhow::ensure!(
            self.login_id.len() <= LOGIN_CRED_MAX && self.login_pw.len() <= LOGIN_CRED_MAX,
            "login credentials too long (max {} chars)",
            LOGIN_CRED_MAX
        );
        anyhow::ensure!(
            self.char_id.len() <= MAP_CRED_MAX && self.char_pw.len() <= MAP_CRED_MAX,
            "char credentials too long (max {} chars)",
            MAP_CRED_MAX
        );

        anyhow::ensure!(self.autosave_interval_ms > 0, "autosave_interval_ms must be non-zero");
        anyhow::ensure!(self.auth_timeout_ms > 0, "auth_timeout_ms must be non-zero");
        anyhow::ensure!(self.ticket_timeout_secs > 0, "ticket_timeout_secs must be non-zero");
        anyhow::ensure!(self.online_cleanup_secs > 0, "online_cleanup_secs must be non-zero");
        anyhow::ensure!(self.login_reconnect_secs > 0, "login_reconnect_secs must be non-zero");
        anyhow::ensure!(self.login_ping_secs > 0, "login_ping_secs must be non-zero");

        for (key, name) in self.tables.all() {
            anyhow::ensure!(
                !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'),
                "tables.{} is not a valid table name: {:?}",
                key,
                name
            );
        }

        Ok(())
    }

    /// Save configuration to a YAML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(&self)
            .context("Failed to serialize config to YAML")?;

        fs::write(path.as_ref(), yaml)
            .with_context(|| format!("Failed to write config to {}", path.as_ref().display()))?;

        Ok(())
    }

    pub fn autosave_interval(&self) -> Duration {
        Duration::from_millis(self.autosave_interval_ms)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    pub fn ticket_timeout(&self) -> Duration {
        Duration::from_secs(self.ticket_timeout_secs)
    }

    pub fn database_url(&self) -> String {
        format!(
            "mysql://{}:{}@{}:{}/{}",
            self.sql_id, self.sql_pw, self.sql_ip, self.sql_port, self.sql_db
        )
    }

    /// Configuration used by tests and the in-memory store.
    pub fn test_only() -> Self {
        Self {
            sql_ip: "127.0.0.1".into(),
            sql_port: default_sql_port(),
            sql_id: "hub".into(),
            sql_pw: "hub".into(),
            sql_db: "hub".into(),
            sql_max_connections: default_sql_max_connections(),
            auto_migrate: false,
            login_id: "s1".into(),
            login_pw: "p1".into(),
            login_ip: "127.0.0.1".into(),
            login_port: default_login_port(),
            login_reconnect_secs: default_login_reconnect_secs(),
            login_ping_secs: default_login_ping_secs(),
            server_name: default_server_name(),
            char_id: "mapid".into(),
            char_pw: "mappw".into(),
            char_ip: "127.0.0.1".into(),
            char_port: 0,
            max_map_servers: default_max_map_servers(),
            autosave_interval_ms: default_autosave_interval_ms(),
            auth_timeout_ms: default_auth_timeout_ms(),
            ticket_timeout_secs: default_ticket_timeout_secs(),
            online_cleanup_secs: default_online_cleanup_secs(),
            check_ticket_ip: false,
            party_share_level: default_party_share_level(),
            tables: TableConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Helper to create a minimal valid config
    fn minimal_config() -> &'static str {
        r#"
sql_ip: "127.0.0.1"
sql_id: "user"
sql_pw: "pass"
sql_db: "testdb"

login_id: "s1"
login_pw: "p1"
login_ip: "127.0.0.1"

char_id: "mapid"
char_pw: "mappw"
char_ip: "127.0.0.1"
"#
    }

    #[test]
    fn test_minimal_config() {
        let config = ServerConfig::from_str(minimal_config()).unwrap();

        assert_eq!(config.sql_ip, "127.0.0.1");
        assert_eq!(config.sql_id, "user");
        assert_eq!(config.sql_db, "testdb");
        assert_eq!(config.char_id, "mapid");
    }

    #[test]
    fn test_default_values() {
        let config = ServerConfig::from_str(minimal_config()).unwrap();

        assert_eq!(config.sql_port, 3306);
        assert_eq!(config.sql_max_connections, 1);
        assert_eq!(config.login_port, 6900);
        assert_eq!(config.char_port, 6121);
        assert_eq!(config.max_map_servers, 2);
        assert_eq!(config.autosave_interval_ms, 300_000);
        assert_eq!(config.auth_timeout_ms, 30_000);
        assert_eq!(config.party_share_level, 15);
        assert!(!config.check_ticket_ip);
        assert!(!config.auto_migrate);
        assert_eq!(config.tables, TableConfig::default());
    }

    #[test]
    fn test_table_override() {
        let mut s = String::from(minimal_config());
        s.push_str("tables:\n  char: \"characters\"\n  guild: \"clans\"\n");
        let config = ServerConfig::from_str(&s).unwrap();
        assert_eq!(config.tables.char, "characters");
        assert_eq!(config.tables.guild, "clans");
        // untouched names keep their defaults
        assert_eq!(config.tables.memo, "memo");
    }

    #[test]
    fn test_bad_table_name() {
        let mut s = String::from(minimal_config());
        s.push_str("tables:\n  char: \"char; DROP TABLE x\"\n");
        let err = ServerConfig::from_str(&s).unwrap_err();
        assert!(format!("{}", err).contains("tables.char"));
    }

    #[test]
    fn test_missing_required_field() {
        let config_str = r#"
sql_ip: "127.0.0.1"
sql_id: "user"
sql_db: "testdb"
"#;

        let result = ServerConfig::from_str(config_str);
        assert!(result.is_err());

        let err_msg = format!("{:?}", result.unwrap_err());
        assert!(err_msg.contains("sql_pw") || err_msg.contains("missing field"));
    }

    #[test]
    fn test_invalid_yaml() {
        let result = ServerConfig::from_str("sql_ip: [this is not valid yaml\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_empty_sql_ip() {
        let s = minimal_config().replace("sql_ip: \"127.0.0.1\"", "sql_ip: \"\"");
        let err_msg = format!("{}", ServerConfig::from_str(&s).unwrap_err());
        assert!(err_msg.contains("sql_ip"));
    }

    #[test]
    fn test_map_server_limit() {
        let mut s = String::from(minimal_config());
        s.push_str("max_map_servers: 31\n");
        let err_msg = format!("{}", ServerConfig::from_str(&s).unwrap_err());
        assert!(err_msg.contains("max_map_servers"));
    }

    #[test]
    fn test_login_credentials_too_long() {
        let s = minimal_config().replace("login_id: \"s1\"", "login_id: \"abcdefghijklmnopqrstuvwxyz\"");
        let err_msg = format!("{}", ServerConfig::from_str(&s).unwrap_err());
        assert!(err_msg.contains("login credentials"));
    }

    #[test]
    fn test_durations() {
        let config = ServerConfig::from_str(minimal_config()).unwrap();
        assert_eq!(config.autosave_interval(), Duration::from_secs(300));
        assert_eq!(config.auth_timeout(), Duration::from_secs(30));
        assert_eq!(config.ticket_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_save_and_load() {
        let config = ServerConfig::from_str(minimal_config()).unwrap();

        let temp_file = std::env::temp_dir().join("test_save_char_hub_config.yaml");

        config.save(&temp_file).unwrap();
        let loaded = ServerConfig::from_file(&temp_file).unwrap();

        assert_eq!(config.sql_ip, loaded.sql_ip);
        assert_eq!(config.sql_db, loaded.sql_db);
        assert_eq!(config.tables, loaded.tables);

        std::fs::remove_file(temp_file).ok();
    }
}
