// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Rendering of the forwarder configuration.
//!
//! [`synthesize`] is a pure function of the Logging spec and the decoded
//! secrets. Sources become `tail` inputs tagged `<environment>.<name>`, and all
//! targets of one environment are grouped under a single `copy` match so that
//! every store receives the environment's records.

use crate::error::ConfigRenderError;
use crate::model::{LoggingSpec, Source, Target};
use crate::secret::{SecretBundle, SecretEntry};
use askama::Template;
use std::collections::BTreeMap;
use tracing::warn;

/// Address of the elasticsearch service deployed next to the controller.
pub const EMBEDDED_ES_HOST: &str = "elasticsearch.cattle-system";
pub const EMBEDDED_ES_PORT: u16 = 9200;

const POS_DIR: &str = "/fluentd/etc/pos";
const DEFAULT_INPUT_FORMAT: &str = "json";
const DEFAULT_FLUSH_INTERVAL: u32 = 1;
const DEFAULT_LOGSTASH_PREFIX: &str = "logstash";
const DEFAULT_DATE_FORMAT: &str = "%Y.%m.%d";

/// Bytes produced by [`synthesize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedConfig(Vec<u8>);

impl RenderedConfig {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for RenderedConfig {
    fn from(rendered: String) -> Self {
        Self(rendered.into_bytes())
    }
}

impl From<&str> for RenderedConfig {
    fn from(rendered: &str) -> Self {
        Self(rendered.as_bytes().to_vec())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputKind {
    Elasticsearch,
    AwsElasticsearch,
    Embedded,
    Splunk,
    Kafka,
}

impl OutputKind {
    fn parse(output_type: &str) -> Option<Self> {
        match output_type {
            "elasticsearch" | "es" => Some(OutputKind::Elasticsearch),
            "aws-elasticsearch" => Some(OutputKind::AwsElasticsearch),
            "embedded" => Some(OutputKind::Embedded),
            "splunk" => Some(OutputKind::Splunk),
            "kafka" => Some(OutputKind::Kafka),
            _ => None,
        }
    }

    /// Template branch used for this output.
    fn plugin(self) -> &'static str {
        match self {
            OutputKind::Elasticsearch | OutputKind::AwsElasticsearch | OutputKind::Embedded => {
                "elasticsearch"
            }
            OutputKind::Splunk => "splunk",
            OutputKind::Kafka => "kafka",
        }
    }
}

struct SourceView {
    input_path: String,
    pos_file: String,
    tag: String,
    format: String,
}

struct RecordView {
    key: String,
    value: String,
}

#[derive(Default)]
struct StoreView {
    kind: &'static str,
    scheme: String,
    host: String,
    port: u16,
    user: String,
    password: String,
    token: String,
    tag_key: String,
    flush_interval: u32,
    logstash_prefix: String,
    logstash_dateformat: String,
    splunk_source: String,
    splunk_sourcetype: String,
    splunk_time_format: String,
    kafka_brokers: String,
    kafka_topic: String,
    kafka_output_data_type: String,
    kafka_max_send_retries: u32,
}

struct GroupView {
    pattern: String,
    records: Vec<RecordView>,
    stores: Vec<StoreView>,
}

#[derive(Template)]
#[template(path = "fluentd.conf", escape = "none")]
struct FluentdTemplate {
    sources: Vec<SourceView>,
    groups: Vec<GroupView>,
}

/// Render the forwarder configuration for `spec` using credentials from `secrets`.
///
/// Targets are matched to secrets by `(environment, output_type)`. When the
/// spec is disabled only the sources are rendered.
pub fn synthesize(
    spec: &LoggingSpec,
    secrets: &SecretBundle,
) -> Result<RenderedConfig, ConfigRenderError> {
    let sources = spec
        .sources
        .iter()
        .map(source_view)
        .collect::<Result<Vec<_>, _>>()?;

    let mut groups: Vec<GroupView> = Vec::new();
    if spec.enable {
        for target in &spec.targets {
            let store = store_view(target, secrets.lookup(&target.environment, &target.output_type))?;
            for (key, value) in &target.output_records {
                plain(key, || target.describe(), "output_records")?;
                plain(value, || target.describe(), "output_records")?;
            }
            let pattern = format!("{}.**", target.environment);
            let group = match groups.iter().position(|g| g.pattern == pattern) {
                Some(index) => &mut groups[index],
                None => {
                    groups.push(GroupView {
                        pattern,
                        records: Vec::new(),
                        stores: Vec::new(),
                    });
                    let last = groups.len() - 1;
                    &mut groups[last]
                }
            };
            merge_records(&mut group.records, &target.output_records);
            group.stores.push(store);
        }
    }

    let rendered = FluentdTemplate { sources, groups }.render()?;
    Ok(RenderedConfig::from(rendered))
}

/// Map the displayed logstash date format onto strftime.
pub fn logstash_dateformat(shown: &str) -> &'static str {
    match shown {
        "YYYY.MM.DD" => "%Y.%m.%d",
        "YYYY.MM" => "%Y.%m.",
        "YYYY" => "%Y.",
        other => {
            warn!("unknown logstash date format '{other}', using {DEFAULT_DATE_FORMAT}");
            DEFAULT_DATE_FORMAT
        }
    }
}

fn source_view(source: &Source) -> Result<SourceView, ConfigRenderError> {
    let describe = || format!("source {}", source.name);
    let environment = required(&source.environment, describe, "environment")?;
    let input_path = required(&source.input_path, describe, "input_path")?;
    let tag = if source.name.trim().is_empty() {
        environment.to_string()
    } else {
        format!("{}.{}", environment, source.name)
    };

    let format = non_empty(source.input_format.as_deref()).unwrap_or(DEFAULT_INPUT_FORMAT);
    plain(&tag, describe, "name")?;
    plain(input_path, describe, "input_path")?;
    plain(format, describe, "input_format")?;

    Ok(SourceView {
        input_path: input_path.to_string(),
        pos_file: format!("{POS_DIR}/{tag}.pos"),
        format: format.to_string(),
        tag,
    })
}

fn store_view(
    target: &Target,
    secret: Option<&SecretEntry>,
) -> Result<StoreView, ConfigRenderError> {
    let kind = OutputKind::parse(&target.output_type).ok_or_else(|| {
        ConfigRenderError::UnsupportedOutput {
            environment: target.environment.clone(),
            output_type: target.output_type.clone(),
        }
    })?;
    let describe = || target.describe();
    required(&target.environment, describe, "environment")?;

    let user = secret.and_then(|s| s.data.user.as_deref()).unwrap_or_default();
    let password = secret
        .and_then(|s| s.data.password.as_deref())
        .unwrap_or_default();
    let label = secret.and_then(|s| non_empty(s.label.as_deref()));
    let host = non_empty(target.output_host.as_deref());

    let mut store = StoreView {
        kind: kind.plugin(),
        tag_key: target.output_tag_key.clone().unwrap_or_default(),
        flush_interval: target
            .output_flush_interval
            .filter(|interval| *interval > 0)
            .unwrap_or(DEFAULT_FLUSH_INTERVAL),
        ..StoreView::default()
    };

    match kind {
        OutputKind::Elasticsearch | OutputKind::AwsElasticsearch | OutputKind::Embedded => {
            let (host, default_port, scheme) = match kind {
                OutputKind::Embedded => (Some(host.unwrap_or(EMBEDDED_ES_HOST)), EMBEDDED_ES_PORT, "http"),
                // the endpoint of a managed domain is kept as the secret label
                OutputKind::AwsElasticsearch => (host.or(label), 443, "https"),
                _ => (host, EMBEDDED_ES_PORT, "http"),
            };
            store.host = host
                .ok_or_else(|| missing(describe(), "output_host"))?
                .to_string();
            store.port = port(target.output_port, default_port, describe, "output_port")?;
            store.scheme = scheme.to_string();
            store.user = quote(user);
            store.password = quote(password);
            store.logstash_prefix = non_empty(target.output_logstash_prefix.as_deref())
                .unwrap_or(DEFAULT_LOGSTASH_PREFIX)
                .to_string();
            store.logstash_dateformat = match non_empty(target.output_logstash_dateformat.as_deref()) {
                Some(shown) => logstash_dateformat(shown),
                None => DEFAULT_DATE_FORMAT,
            }
            .to_string();
        }
        OutputKind::Splunk => {
            store.host = host
                .ok_or_else(|| missing(describe(), "output_host"))?
                .to_string();
            store.port = port(target.output_port, 8088, describe, "output_port")?;
            store.scheme = non_empty(target.splunk_protocol.as_deref())
                .unwrap_or("http")
                .to_string();
            let token = secret
                .and_then(|s| non_empty(s.data.token.as_deref()))
                .ok_or_else(|| missing(describe(), "token"))?;
            store.token = quote(token);
            store.splunk_source = target.splunk_source.clone().unwrap_or_default();
            store.splunk_sourcetype = target.splunk_sourcetype.clone().unwrap_or_default();
            store.splunk_time_format = non_empty(target.splunk_time_format.as_deref())
                .unwrap_or("unixtime")
                .to_string();
        }
        OutputKind::Kafka => {
            match non_empty(target.kafka_broker_type.as_deref()).unwrap_or("broker") {
                "zookeeper" => {
                    store.host = non_empty(target.kafka_zookeeper_host.as_deref())
                        .ok_or_else(|| missing(describe(), "kafka_zookeeper_host"))?
                        .to_string();
                    store.port =
                        port(target.kafka_zookeeper_port, 2181, describe, "kafka_zookeeper_port")?;
                }
                _ => {
                    store.kafka_brokers = non_empty(target.kafka_brokers.as_deref())
                        .ok_or_else(|| missing(describe(), "kafka_brokers"))?
                        .to_string();
                }
            }
            store.kafka_topic = non_empty(target.kafka_topic.as_deref())
                .unwrap_or("message")
                .to_string();
            store.kafka_output_data_type = non_empty(target.kafka_output_data_type.as_deref())
                .unwrap_or("json")
                .to_string();
            store.kafka_max_send_retries = target.kafka_max_send_retries.unwrap_or(1);
        }
    }

    // everything not passed through `quote` lands verbatim in the config
    for (field, value) in [
        ("output_host", &store.host),
        ("output_tag_key", &store.tag_key),
        ("splunk_protocol", &store.scheme),
        ("output_logstash_prefix", &store.logstash_prefix),
        ("splunk_source", &store.splunk_source),
        ("splunk_sourcetype", &store.splunk_sourcetype),
        ("splunk_time_format", &store.splunk_time_format),
        ("kafka_brokers", &store.kafka_brokers),
        ("kafka_topic", &store.kafka_topic),
        ("kafka_output_data_type", &store.kafka_output_data_type),
    ] {
        plain(value, describe, field)?;
    }

    Ok(store)
}

/// Records of later targets never override keys set by earlier ones.
fn merge_records(records: &mut Vec<RecordView>, extra: &BTreeMap<String, String>) {
    for (key, value) in extra {
        if !records.iter().any(|record| &record.key == key) {
            records.push(RecordView {
                key: key.clone(),
                value: value.clone(),
            });
        }
    }
}

fn required<'a>(
    value: &'a str,
    describe: impl Fn() -> String,
    field: &'static str,
) -> Result<&'a str, ConfigRenderError> {
    non_empty(Some(value)).ok_or_else(|| missing(describe(), field))
}

fn port(
    value: Option<u16>,
    default: u16,
    describe: impl Fn() -> String,
    field: &'static str,
) -> Result<u16, ConfigRenderError> {
    match value.unwrap_or(default) {
        0 => Err(missing(describe(), field)),
        port => Ok(port),
    }
}

fn missing(target: String, field: &'static str) -> ConfigRenderError {
    ConfigRenderError::MissingField { target, field }
}

/// Rejects values that would break out of their line in the config file.
fn plain(
    value: &str,
    describe: impl Fn() -> String,
    field: &'static str,
) -> Result<(), ConfigRenderError> {
    if value.chars().any(char::is_control) {
        return Err(ConfigRenderError::ControlCharacters {
            target: describe(),
            field,
        });
    }
    Ok(())
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Quote a credential for the config file. Empty stays empty so the line is skipped.
fn quote(value: &str) -> String {
    if value.is_empty() {
        return String::new();
    }
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        match c {
            '\\' => quoted.push_str("\\\\"),
            '"' => quoted.push_str("\\\""),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '\t' => quoted.push_str("\\t"),
            c => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}
