use serde::Deserialize;

/// Ban-score tuning. Weights are caller-assigned per failure mode so that
/// repeated minor violations accumulate toward a ban without a single small
/// mistake disconnecting anyone.
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct BanConfig {
    /// Score at which the connection is banned.
    pub threshold: f64,
    /// Half-life of the decaying score, in milliseconds.
    pub half_life_ms: u64,
    pub weight_parse: f64,
    pub weight_unknown_method: f64,
    pub weight_malformed: f64,
    pub weight_unknown_job: f64,
    pub weight_stale_job: f64,
    pub weight_duplicate: f64,
    pub weight_bad_proof: f64,
    pub weight_unauthorized: f64,
}

impl Default for BanConfig {
    fn default() -> Self {
        Self {
            threshold: 100.0,
            half_life_ms: 10_000,
            weight_parse: 5.0,
            weight_unknown_method: 5.0,
            weight_malformed: 20.0,
            weight_unknown_job: 15.0,
            weight_stale_job: 10.0,
            weight_duplicate: 25.0,
            weight_bad_proof: 20.0,
            weight_unauthorized: 30.0,
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Config {
    /// Stratum listen address.
    pub host: String,
    pub port: u16,
    /// Address advertised in the HTTP probe redirect (`X-Stratum`).
    pub public_host: String,
    pub public_port: u16,
    pub max_connections: usize,
    /// Difficulty a connection starts at before vardiff has data.
    pub initial_difficulty: u64,
    /// Pool/network difficulty ceiling for vardiff.
    pub cap_difficulty: u64,
    /// Enables per-connection retargeting.
    pub dynamic_difficulty: bool,
    /// Vardiff target rate.
    pub shares_per_minute: u64,
    /// Worker password; empty means the pool is open.
    pub password: String,
    /// Longest accepted primary-nonce width in hex digits. The original
    /// check was deliberately loose, so the bound is policy, not protocol.
    pub max_nonce_hex: usize,
    pub node_rpc_url: String,
    pub template_poll_secs: u64,
    pub metrics_listen: String,
    pub ban: BanConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3333,
            public_host: "127.0.0.1".to_string(),
            public_port: 3333,
            max_connections: 10_000,
            initial_difficulty: 1_000,
            cap_difficulty: 1_000_000_000,
            dynamic_difficulty: true,
            shares_per_minute: 20,
            password: String::new(),
            max_nonce_hex: 16,
            node_rpc_url: "http://127.0.0.1:8444/jsonrpc".to_string(),
            template_poll_secs: 10,
            metrics_listen: "0.0.0.0:9100".to_string(),
            ban: BanConfig::default(),
        }
    }
}

impl Config {
    /// Defaults, then environment, then `pool_config.json` when present.
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("VETRA_POOL_HOST") {
            cfg.host = v;
        }
        if let Ok(v) = std::env::var("VETRA_POOL_PORT") {
            cfg.port = v.parse().unwrap_or(cfg.port);
        }
        if let Ok(v) = std::env::var("VETRA_PUBLIC_HOST") {
            cfg.public_host = v;
        }
        if let Ok(v) = std::env::var("VETRA_PUBLIC_PORT") {
            cfg.public_port = v.parse().unwrap_or(cfg.public_port);
        }
        if let Ok(v) = std::env::var("VETRA_MAX_CONNECTIONS") {
            cfg.max_connections = v.parse().unwrap_or(cfg.max_connections);
        }
        if let Ok(v) = std::env::var("VETRA_INITIAL_DIFFICULTY") {
            cfg.initial_difficulty = v.parse().unwrap_or(cfg.initial_difficulty);
        }
        if let Ok(v) = std::env::var("VETRA_CAP_DIFFICULTY") {
            cfg.cap_difficulty = v.parse().unwrap_or(cfg.cap_difficulty);
        }
        if let Ok(v) = std::env::var("VETRA_DYNAMIC_DIFFICULTY") {
            cfg.dynamic_difficulty = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("VETRA_SHARES_PER_MINUTE") {
            cfg.shares_per_minute = v.parse().unwrap_or(cfg.shares_per_minute);
        }
        if let Ok(v) = std::env::var("VETRA_POOL_PASSWORD") {
            cfg.password = v;
        }
        if let Ok(v) = std::env::var("VETRA_MAX_NONCE_HEX") {
            cfg.max_nonce_hex = v.parse().unwrap_or(cfg.max_nonce_hex);
        }
        if let Ok(v) = std::env::var("VETRA_NODE_RPC") {
            cfg.node_rpc_url = v;
        }
        if let Ok(v) = std::env::var("VETRA_POLL_SECS") {
            cfg.template_poll_secs = v.parse().unwrap_or(cfg.template_poll_secs);
        }
        if let Ok(v) = std::env::var("VETRA_POOL_METRICS") {
            cfg.metrics_listen = v;
        }

        if let Ok(txt) = std::fs::read_to_string("pool_config.json") {
            match serde_json::from_str::<Config>(&txt) {
                Ok(file_cfg) => cfg = file_cfg,
                Err(e) => eprintln!("failed to parse pool_config.json: {e}"),
            }
        }

        cfg.normalize()
    }

    /// Clamp nonsense values into the documented ranges.
    pub fn normalize(mut self) -> Self {
        self.initial_difficulty = self.initial_difficulty.max(1);
        self.cap_difficulty = self.cap_difficulty.max(self.initial_difficulty);
        self.shares_per_minute = self.shares_per_minute.max(1);
        if self.max_nonce_hex == 0 || self.max_nonce_hex % 2 != 0 {
            self.max_nonce_hex = 16;
        }
        if self.template_poll_secs == 0 {
            self.template_poll_secs = 10;
        }
        self
    }
}
