//! Configuration surface for the proxy.
//!
//! Values come from CLI flags merged over an optional JSON config file; a set
//! flag always wins and the file only fills in what was left empty
//! ([`Config::fill_empty_from`]). Empty strings and zero counts mean "unset".

use crate::print::PrintStatus;

/// Default size of the relay copy buffer (32KiB).
pub const DEFAULT_BUFFER: u64 = 1 << 15;

/// Default bound for waiting outbound tunnels and accepted tunnel servers.
pub const DEFAULT_MAX_TUNNELS: usize = 10;

/// Default number of seconds a client waits for a tunnel pairing.
pub const DEFAULT_TUNNEL_WAIT_SECS: u64 = 10;

/// Default environment variable holding the tunnel password.
pub const DEFAULT_PWD_ENV_NAME: &str = "PROXYPRINT_PWD";

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Network address to listen for clients on.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub listen: String,
    /// Network address of the backend to connect to directly.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub connect: String,
    /// Network address of a remote proxyprint session to tunnel to.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tunnel: String,
    /// Network address to listen for tunneling servers on.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub listen_servers: String,
    /// How to render data read from the client side.
    #[serde(skip_serializing_if = "PrintStatus::is_none")]
    pub client_print: PrintStatus,
    /// How to render data read from the server side.
    #[serde(skip_serializing_if = "PrintStatus::is_none")]
    pub server_print: PrintStatus,
    /// File to write client print output to (blank is stdout).
    #[serde(skip_serializing_if = "String::is_empty")]
    pub client_print_file: String,
    /// File to write server print output to (blank is stdout).
    #[serde(skip_serializing_if = "String::is_empty")]
    pub server_print_file: String,
    /// Size of the buffer used to copy data.
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub buffer: u64,
    // Key kept as "maxOpenTunnels" for compatibility with existing config
    // files.
    /// How many outbound tunnels may be waiting for servers at once.
    #[serde(rename = "maxOpenTunnels", skip_serializing_if = "is_zero_usize")]
    pub max_waiting_tunnels: usize,
    /// How many tunneling servers may be accepted/queued at once.
    #[serde(skip_serializing_if = "is_zero_usize")]
    pub max_accepted_servers: usize,
    /// How many seconds a client waits for a tunnel pairing before giving up.
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub tunnel_wait_secs: u64,
    /// Environment variable naming the tunnel password source.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub pwd_env_name: String,
    /// Fail at startup if the password environment variable is absent.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub require_pwd_env_exists: bool,
    /// File to output logs to (blank is stderr).
    #[serde(skip_serializing_if = "String::is_empty")]
    pub log: String,
    /// Network address to run the HTTP monitor server on (blank is off).
    #[serde(skip_serializing_if = "String::is_empty")]
    pub monitor_server: String,
}

fn is_zero_u64(n: &u64) -> bool {
    *n == 0
}

fn is_zero_usize(n: &usize) -> bool {
    *n == 0
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("error reading config file: {source}")]
    Read {
        #[from]
        source: std::io::Error,
    },
    #[error("error parsing config file: {source}")]
    Parse {
        #[from]
        source: serde_json::Error,
    },
    #[error("must provide non-zero buffer size")]
    ZeroBuffer,
    #[error("must provide connect addr or listen-servers addr when proxying")]
    MissingBackend,
    #[error("must provide listen addr with listen-servers addr")]
    MissingListen,
    #[error("must provide connect addr or listen-servers addr when tunneling")]
    MissingTunnelBackend,
    #[error("nothing to run: provide listen, listen-servers, or tunnel")]
    NothingToRun,
}

impl Config {
    /// Loads a config file (JSON).
    pub fn load_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Fills every unset field of `self` from `other`. Flags that were set
    /// keep their value.
    pub fn fill_empty_from(&mut self, other: &Config) {
        if self.listen.is_empty() {
            self.listen = other.listen.clone();
        }
        if self.connect.is_empty() {
            self.connect = other.connect.clone();
        }
        if self.tunnel.is_empty() {
            self.tunnel = other.tunnel.clone();
        }
        if self.listen_servers.is_empty() {
            self.listen_servers = other.listen_servers.clone();
        }
        if self.client_print.is_none() {
            self.client_print = other.client_print;
        }
        if self.server_print.is_none() {
            self.server_print = other.server_print;
        }
        if self.client_print_file.is_empty() {
            self.client_print_file = other.client_print_file.clone();
        }
        if self.server_print_file.is_empty() {
            self.server_print_file = other.server_print_file.clone();
        }
        if self.buffer == 0 {
            self.buffer = other.buffer;
        }
        if self.max_waiting_tunnels == 0 {
            self.max_waiting_tunnels = other.max_waiting_tunnels;
        }
        if self.max_accepted_servers == 0 {
            self.max_accepted_servers = other.max_accepted_servers;
        }
        if self.tunnel_wait_secs == 0 {
            self.tunnel_wait_secs = other.tunnel_wait_secs;
        }
        if self.pwd_env_name.is_empty() {
            self.pwd_env_name = other.pwd_env_name.clone();
        }
        if !self.require_pwd_env_exists {
            self.require_pwd_env_exists = other.require_pwd_env_exists;
        }
        if self.log.is_empty() {
            self.log = other.log.clone();
        }
        if self.monitor_server.is_empty() {
            self.monitor_server = other.monitor_server.clone();
        }
    }

    /// Applies fallback defaults for unset bounds.
    pub fn normalize(&mut self) {
        if self.buffer == 0 {
            self.buffer = DEFAULT_BUFFER;
        }
        if self.max_waiting_tunnels == 0 {
            self.max_waiting_tunnels = DEFAULT_MAX_TUNNELS;
        }
        if self.max_accepted_servers == 0 {
            self.max_accepted_servers = DEFAULT_MAX_TUNNELS;
        }
        if self.tunnel_wait_secs == 0 {
            self.tunnel_wait_secs = DEFAULT_TUNNEL_WAIT_SECS;
        }
    }

    /// Startup validation. Any error here is fatal; nothing is validated
    /// again at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer == 0 {
            return Err(ConfigError::ZeroBuffer);
        }
        if !self.listen.is_empty() && self.connect.is_empty() && self.listen_servers.is_empty() {
            return Err(ConfigError::MissingBackend);
        }
        if !self.listen_servers.is_empty() && self.listen.is_empty() {
            return Err(ConfigError::MissingListen);
        }
        if !self.tunnel.is_empty() && self.connect.is_empty() && self.listen_servers.is_empty() {
            return Err(ConfigError::MissingTunnelBackend);
        }
        if self.listen.is_empty() && self.listen_servers.is_empty() && self.tunnel.is_empty() {
            return Err(ConfigError::NothingToRun);
        }
        Ok(())
    }

    /// Whether tunneling is configured anywhere, meaning the password source
    /// must be resolved at startup.
    pub fn uses_tunneling(&self) -> bool {
        !self.listen_servers.is_empty() || !self.tunnel.is_empty()
    }

    /// Writes a blank config file template to populate. The template is
    /// generated with mostly invalid values which must be changed or deleted.
    pub fn write_template(path: &std::path::Path) -> Result<(), ConfigError> {
        let template = serde_json::json!({
            "listen": "IP:PORT",
            "connect": "IP:PORT",
            "tunnel": "IP:PORT",
            "listenServers": "IP:PORT",
            "clientPrint": -1,
            "serverPrint": -1,
            "buffer": DEFAULT_BUFFER,
            "maxAcceptedServers": DEFAULT_MAX_TUNNELS,
            "pwdEnvName": DEFAULT_PWD_ENV_NAME,
            "log": "PATH",
            "monitorServer": "IP:PORT",
        });
        let mut contents = serde_json::to_string_pretty(&template)?;
        contents.push('\n');
        std::fs::write(path, contents)?;
        Ok(())
    }
}
