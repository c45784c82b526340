// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The `Logging` custom resource and the key type used to address it.
//!
//! Only the fields the reconciler reads are modelled. Target fields keep the
//! snake_case wire names the resource has always used.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "rancher.com",
    version = "v1",
    kind = "Logging",
    plural = "loggings",
    namespaced
)]
pub struct LoggingSpec {
    #[serde(default = "default_enable")]
    pub enable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default)]
    pub targets: Vec<Target>,
    /// Resource version of the secret this spec was last written alongside.
    #[serde(
        default,
        rename = "secretVersion",
        skip_serializing_if = "Option::is_none"
    )]
    pub secret_version: Option<String>,
}

fn default_enable() -> bool {
    true
}

impl Default for LoggingSpec {
    fn default() -> Self {
        Self {
            enable: default_enable(),
            provider: None,
            sources: Vec::new(),
            targets: Vec::new(),
            secret_version: None,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct Source {
    pub name: String,
    pub environment: String,
    pub input_path: String,
    #[serde(default)]
    pub input_format: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct Target {
    pub environment: String,
    pub output_type: String,
    #[serde(default)]
    pub output_host: Option<String>,
    #[serde(default)]
    pub output_port: Option<u16>,
    /// Seconds between buffer flushes.
    #[serde(default)]
    pub output_flush_interval: Option<u32>,
    #[serde(default)]
    pub output_tag_key: Option<String>,
    #[serde(default)]
    pub output_records: BTreeMap<String, String>,

    // elasticsearch
    #[serde(default)]
    pub output_logstash_prefix: Option<String>,
    #[serde(default)]
    pub output_logstash_dateformat: Option<String>,

    // splunk
    #[serde(default)]
    pub splunk_protocol: Option<String>,
    #[serde(default)]
    pub splunk_source: Option<String>,
    #[serde(default)]
    pub splunk_sourcetype: Option<String>,
    #[serde(default)]
    pub splunk_time_format: Option<String>,

    // kafka
    #[serde(default)]
    pub kafka_broker_type: Option<String>,
    #[serde(default)]
    pub kafka_brokers: Option<String>,
    #[serde(default)]
    pub kafka_zookeeper_host: Option<String>,
    #[serde(default)]
    pub kafka_zookeeper_port: Option<u16>,
    #[serde(default)]
    pub kafka_topic: Option<String>,
    #[serde(default)]
    pub kafka_output_data_type: Option<String>,
    #[serde(default)]
    pub kafka_max_send_retries: Option<u32>,
}

impl Target {
    pub fn describe(&self) -> String {
        format!("target {}/{}", self.environment, self.output_type)
    }
}

/// `namespace/name` identity of a watched object. Queues carry these, never objects.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn for_object(logging: &Logging) -> Self {
        Self::new(logging.namespace().unwrap_or_default(), logging.name_any())
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
