//! Server configuration, loaded from a TOML file.
//!
//! ```toml
//! host = "127.0.0.1"
//! port = 4918
//! mount_path = ""
//! verbose = 1
//!
//! [shares."/"]
//! kind = "repo"
//!
//! [shares."/temp"]
//! kind = "fs"
//! directory = "/tmp/davshare"
//!
//! [user_mapping."/temp".alice]
//! password = "secret"
//!
//! [auth]
//! acceptbasic = true
//! acceptdigest = true
//! defaultdigest = true
//! ```
use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    4918
}

fn default_true() -> bool {
    true
}

fn default_max_lock_timeout() -> u64 {
    3600
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// URL prefix under which all shares are mounted.
    #[serde(default)]
    pub mount_path: String,
    /// 0 - quiet, 1 - request summaries, 2 - events, 3 - full detail.
    #[serde(default)]
    pub verbose: u8,
    /// share URL prefix -> backend.
    #[serde(default)]
    pub shares: HashMap<String, Share>,
    /// realm -> user -> { password, roles }.
    #[serde(default)]
    pub user_mapping: HashMap<String, HashMap<String, User>>,
    #[serde(default)]
    pub auth: Auth,
    /// Enable the lock manager.
    #[serde(default = "default_true")]
    pub locksmanager: bool,
    /// Enable the dead-property manager.
    #[serde(default = "default_true")]
    pub propsmanager: bool,
    /// Upper bound on client supplied lock timeouts, in seconds.
    #[serde(default = "default_max_lock_timeout")]
    pub max_lock_timeout: u64,
    #[serde(default)]
    pub dir_browser: DirBrowser,
    /// Methods that get request logging at info level.
    #[serde(default)]
    pub debug_methods: Vec<String>,
    /// Log requests carrying an X-Litmus header at info level.
    #[serde(default)]
    pub debug_litmus: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            host:             default_host(),
            port:             default_port(),
            mount_path:       String::new(),
            verbose:          0,
            shares:           HashMap::new(),
            user_mapping:     HashMap::new(),
            auth:             Auth::default(),
            locksmanager:     true,
            propsmanager:     true,
            max_lock_timeout: default_max_lock_timeout(),
            dir_browser:      DirBrowser::default(),
            debug_methods:    Vec::new(),
            debug_litmus:     false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Share {
    pub kind:      ShareKind,
    /// Directory to serve (kind = "fs").
    pub directory: Option<String>,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShareKind {
    /// Local filesystem directory.
    Fs,
    /// Content-addressed in-memory repository.
    Repo,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct User {
    pub password: String,
    #[serde(default)]
    pub roles:    Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Auth {
    /// Allow basic authentication.
    #[serde(default = "default_true")]
    pub acceptbasic: bool,
    /// Allow digest authentication.
    #[serde(default = "default_true")]
    pub acceptdigest: bool,
    /// Challenge with Digest rather than Basic.
    #[serde(default = "default_true")]
    pub defaultdigest: bool,
    /// Serve OPTIONS without authentication (Windows interop).
    #[serde(default)]
    pub allow_anonymous_options: bool,
}

impl Default for Auth {
    fn default() -> Auth {
        Auth {
            acceptbasic: true,
            acceptdigest: true,
            defaultdigest: true,
            allow_anonymous_options: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DirBrowser {
    /// Render an HTML listing for GET requests on collections.
    #[serde(default = "default_true")]
    pub enable: bool,
}

impl Default for DirBrowser {
    fn default() -> DirBrowser {
        DirBrowser { enable: true }
    }
}

impl Config {
    /// Read the configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Config, String> {
        let data = std::fs::read_to_string(&path)
            .map_err(|e| format!("{}: {}", path.as_ref().display(), e))?;
        let config: Config =
            toml::from_str(&data).map_err(|e| format!("{}: {}", path.as_ref().display(), e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        for (share, cfg) in &self.shares {
            if share != "/" && (!share.starts_with('/') || share.ends_with('/')) {
                return Err(format!(
                    "share '{}': must start with '/' and not end in '/'",
                    share
                ));
            }
            if share.matches('/').count() > 1 {
                return Err(format!("share '{}': only single-level shares are supported", share));
            }
            if cfg.kind == ShareKind::Fs && cfg.directory.is_none() {
                return Err(format!("share '{}': kind = \"fs\" requires 'directory'", share));
            }
        }
        if !self.mount_path.is_empty()
            && (!self.mount_path.starts_with('/') || self.mount_path.ends_with('/'))
        {
            return Err("mount_path must start with '/' and not end in '/'".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_example() {
        let cfg: Config = toml::from_str(
            r#"
            host = "0.0.0.0"
            port = 8080
            verbose = 2

            [shares."/"]
            kind = "repo"

            [shares."/temp"]
            kind = "fs"
            directory = "/tmp/davshare"
            read_only = true

            [user_mapping."/temp".alice]
            password = "secret"

            [auth]
            acceptbasic = true
            acceptdigest = false
            defaultdigest = false
        "#,
        )
        .unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.shares.len(), 2);
        assert!(cfg.shares["/temp"].read_only);
        assert_eq!(cfg.user_mapping["/temp"]["alice"].password, "secret");
        assert!(!cfg.auth.acceptdigest);
        assert!(cfg.locksmanager);
    }

    #[test]
    fn bad_share_name() {
        let cfg: Config = toml::from_str(
            r#"
            [shares."temp"]
            kind = "repo"
        "#,
        )
        .unwrap();
        assert!(cfg.validate().is_err());
    }
}
