// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Configs
//!
//! Connection parameters are owned by a configuration store outside this crate.
//! [`ConfigSource`] is the narrow interface used to read them; the keys follow
//! the layout `<path>/host`, `<path>/account`, `<path>/password`,
//! `<path>/port`, `<path>/vhost` and `<path>/queue.<use-case>`.
//!
//! [`RabbitMQConfigs`] can also be deserialized directly with `serde`.

use crate::errors::AmqpError;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::Deserialize;
use std::{collections::HashMap, time::Duration};

pub const DEFAULT_PORT: u16 = 5672;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

/// Reads configuration values by key.
pub trait ConfigSource {
    fn get(&self, key: &str) -> Option<String>;
}

impl ConfigSource for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

/// Reads configuration keys from environment variables.
///
/// `rabbitmq/queue.orders` with prefix `APP` is read from
/// `APP_RABBITMQ_QUEUE_ORDERS`.
#[derive(Debug, Clone, Default)]
pub struct EnvConfigSource {
    prefix: String,
}

impl EnvConfigSource {
    pub fn new(prefix: &str) -> Self {
        EnvConfigSource {
            prefix: prefix.to_owned(),
        }
    }

    pub fn var_name(&self, key: &str) -> String {
        let key: String = key
            .chars()
            .map(|c| match c {
                '/' | '.' | '-' => '_',
                c => c.to_ascii_uppercase(),
            })
            .collect();

        if self.prefix.is_empty() {
            key
        } else {
            format!("{}_{}", self.prefix.to_ascii_uppercase(), key)
        }
    }
}

impl ConfigSource for EnvConfigSource {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(self.var_name(key)).ok()
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

/// Broker connection parameters.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RabbitMQConfigs {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(alias = "account")]
    pub user: String,
    pub password: String,
    #[serde(default)]
    pub vhost: String,
    /// Queue names keyed by use case.
    #[serde(default)]
    pub queues: HashMap<String, String>,
    #[serde(default)]
    pub qos: u16,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            host: "localhost".to_owned(),
            port: DEFAULT_PORT,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: String::new(),
            queues: HashMap::default(),
            qos: 0,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

impl RabbitMQConfigs {
    /// Loads the configs stored under `path`. Host, account and password are
    /// required; every `queue.<use-case>` in `queues` is looked up as well.
    pub fn load(
        source: &dyn ConfigSource,
        path: &str,
        queues: &[&str],
    ) -> Result<RabbitMQConfigs, AmqpError> {
        let required = |name: &str| {
            let key = format!("{path}/{name}");
            source.get(&key).ok_or(AmqpError::ConfigError(key))
        };
        let optional = |name: &str| source.get(&format!("{path}/{name}"));

        let port = match optional("port") {
            Some(port) => port
                .parse()
                .map_err(|_| AmqpError::ConfigError(format!("{path}/port")))?,
            None => DEFAULT_PORT,
        };

        let qos = match optional("qos") {
            Some(qos) => qos
                .parse()
                .map_err(|_| AmqpError::ConfigError(format!("{path}/qos")))?,
            None => 0,
        };

        let mut names = HashMap::new();
        for use_case in queues {
            names.insert(
                (*use_case).to_owned(),
                required(&format!("queue.{use_case}"))?,
            );
        }

        Ok(RabbitMQConfigs {
            host: required("host")?,
            port,
            user: required("account")?,
            password: required("password")?,
            vhost: optional("vhost").unwrap_or_default(),
            queues: names,
            qos,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        })
    }

    /// The AMQP URI of the broker. Credentials and vhost are percent-encoded;
    /// an empty vhost selects the default one.
    pub fn uri(&self) -> String {
        let encode = |part: &str| utf8_percent_encode(part, NON_ALPHANUMERIC).to_string();

        format!(
            "amqp://{}:{}@{}:{}/{}",
            encode(&self.user),
            encode(&self.password),
            self.host,
            self.port,
            encode(&self.vhost)
        )
    }

    pub fn queue(&self, use_case: &str) -> Option<&str> {
        self.queues.get(use_case).map(String::as_str)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
