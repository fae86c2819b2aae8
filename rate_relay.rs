//! # Rate Relay - Per-Second Rates for Sampled Metric Streams
//!
//! Converts periodically sampled metric observations (counters, derives,
//! gauges and absolutes) into per-second rates against the previous
//! observation of the same series, and re-emits them under their own
//! namespace.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                               RATE RELAY                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  INGEST → DATA SETS → RATE TRANSFORM ⇄ HISTORY CACHE                    │
//! │              push   → RATE BUFFER ──(read tick)──→ DISPATCH             │
//! │              filter → FILTER CHAIN (RateTarget) ──→ DISPATCH            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Variants
//!
//! - **Push** ([`RateBuffer`]): the write path computes a rate and queues it;
//!   the read tick detaches the queue and forwards it downstream.
//! - **Filter** ([`RateTarget`]): runs inline in a [`FilterChain`] and
//!   rewrites the observation in place.
//!
//! ## Author
//!
//! AIOps Team

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

#![allow(dead_code)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::BTreeMap;
use std::fmt::{self, Debug, Display, Formatter};
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Write};
use std::mem;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::signal;
use tokio::sync::Notify;
use tokio::task::{self, JoinHandle as TokioJoinHandle};
use tokio::time::{interval, MissedTickBehavior};

// ----------------------------------------------------------------------------
// Concurrency Primitives
// ----------------------------------------------------------------------------
use dashmap::{mapref::entry::Entry as MapEntry, DashMap};
use flume::{Receiver as FlumeReceiver, Sender as FlumeSender, TrySendError};
use parking_lot::Mutex;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Deserializer, Serialize};

// ----------------------------------------------------------------------------
// String & Memory Optimization
// ----------------------------------------------------------------------------
use compact_str::{format_compact, CompactString};
use smallvec::SmallVec;

// ----------------------------------------------------------------------------
// Hashing
// ----------------------------------------------------------------------------
use ahash::{AHashMap, RandomState as AHashRandomState};

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, EnvFilter};

// ----------------------------------------------------------------------------
// Time & Timestamps
// ----------------------------------------------------------------------------
use chrono::{DateTime, Utc};

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};

// ----------------------------------------------------------------------------
// CLI
// ----------------------------------------------------------------------------
use clap::{Parser, Subcommand, ValueEnum};

// ----------------------------------------------------------------------------
// Prometheus
// ----------------------------------------------------------------------------
use prometheus::{Encoder, IntCounter, Registry as PrometheusRegistry, TextEncoder};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Relay version - follows semantic versioning
pub const RELAY_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const RELAY_NAME: &str = "rate-relay";
pub const RELAY_FULL_NAME: &str = "Rate Relay";

/// Source tag given to every emitted rate observation
pub const DEFAULT_RATE_NAMESPACE: &str = "rate";

// ----------------------------------------------------------------------------
// Timing & Intervals
// ----------------------------------------------------------------------------

/// Default read (drain) interval (milliseconds)
pub const DEFAULT_READ_INTERVAL_MS: u64 = 10_000;

/// Minimum allowed read interval (milliseconds)
pub const MIN_READ_INTERVAL_MS: u64 = 10;

/// Series not seen for this long are evicted from the history cache (seconds)
pub const DEFAULT_HISTORY_MAX_AGE_SECS: u64 = 300;

// ----------------------------------------------------------------------------
// Queues & Limits
// ----------------------------------------------------------------------------

/// Bounded channel between the input reader and the ingest loop
pub const INGEST_CHANNEL_CAPACITY: usize = 65_536;

/// Forward attempts per pending entry under the requeue policy
pub const DEFAULT_MAX_FORWARD_ATTEMPTS: u32 = 3;

/// Maximum length of any series identity component
pub const MAX_NAME_LENGTH: usize = 128;

/// Value slots kept inline before spilling to the heap
pub const INLINE_SLOTS: usize = 4;

/// Memory-style metrics reported in KiB are normalised with this factor
pub const BYTES_PER_KIB: f64 = 1024.0;

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// Series identities, typed value slots, observations and their schemas.
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Timestamp Types - Nanosecond Precision Time Handling
// ----------------------------------------------------------------------------

/// High-precision timestamp in nanoseconds since Unix epoch.
/// Using i64 allows representing times from ~1677 to ~2262.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Create a new timestamp from nanoseconds since Unix epoch
    #[inline]
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    /// Create a new timestamp from milliseconds since Unix epoch
    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis.saturating_mul(1_000_000))
    }

    /// Create a new timestamp from seconds since Unix epoch
    #[inline]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs.saturating_mul(1_000_000_000))
    }

    /// Get the current timestamp with nanosecond precision
    #[inline]
    pub fn now() -> Self {
        Self::from(SystemTime::now())
    }

    /// Get nanoseconds value
    #[inline]
    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    /// Signed distance to an earlier timestamp, in seconds.
    /// Negative when `earlier` is actually later.
    #[inline]
    pub fn seconds_since(&self, earlier: Timestamp) -> f64 {
        (self.0 as i128 - earlier.0 as i128) as f64 / 1_000_000_000.0
    }

    /// Calculate duration between two timestamps (zero if not later)
    #[inline]
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        let nanos = self.0.saturating_sub(earlier.0);
        Duration::from_nanos(nanos.max(0) as u64)
    }

    /// Convert to chrono DateTime<Utc>
    pub fn to_datetime(&self) -> DateTime<Utc> {
        let secs = self.0.div_euclid(1_000_000_000);
        let nanos = self.0.rem_euclid(1_000_000_000) as u32;
        DateTime::from_timestamp(secs, nanos).unwrap_or_default()
    }

    /// Zero timestamp (Unix epoch)
    pub const EPOCH: Timestamp = Timestamp(0);
}

impl Default for Timestamp {
    #[inline]
    fn default() -> Self {
        Self::now()
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().format("%Y-%m-%d %H:%M:%S%.9f UTC"))
    }
}

impl From<SystemTime> for Timestamp {
    fn from(st: SystemTime) -> Self {
        let duration = st.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self(duration.as_nanos() as i64)
    }
}

// ----------------------------------------------------------------------------
// 3.2 Series Identity - The Lookup Key For History
// ----------------------------------------------------------------------------

/// Composite key naming one time series across ticks.
///
/// Rendered as `host/plugin[-plugin_instance]/type[-type_instance]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeriesIdentity {
    /// Host the observation was collected on
    pub host: CompactString,
    /// Collector source (e.g. "cpu", "interface", "rate")
    pub plugin: CompactString,
    /// Object/instance qualifier of the collector
    #[serde(default, skip_serializing_if = "CompactString::is_empty")]
    pub plugin_instance: CompactString,
    /// Metric category, also the data-set name
    #[serde(rename = "type")]
    pub type_name: CompactString,
    /// Category qualifier
    #[serde(default, skip_serializing_if = "CompactString::is_empty")]
    pub type_instance: CompactString,
}

impl SeriesIdentity {
    /// Create an identity without instance qualifiers
    pub fn new<H, P, T>(host: H, plugin: P, type_name: T) -> Self
    where
        H: Into<CompactString>,
        P: Into<CompactString>,
        T: Into<CompactString>,
    {
        Self {
            host: host.into(),
            plugin: plugin.into(),
            plugin_instance: CompactString::default(),
            type_name: type_name.into(),
            type_instance: CompactString::default(),
        }
    }

    /// Builder: set the plugin instance
    pub fn with_plugin_instance(mut self, instance: impl Into<CompactString>) -> Self {
        self.plugin_instance = instance.into();
        self
    }

    /// Builder: set the type instance
    pub fn with_type_instance(mut self, instance: impl Into<CompactString>) -> Self {
        self.type_instance = instance.into();
        self
    }

    /// Host, plugin and type are mandatory; every component is length bounded.
    pub fn is_valid(&self) -> bool {
        let parts = [
            &self.host,
            &self.plugin,
            &self.plugin_instance,
            &self.type_name,
            &self.type_instance,
        ];
        !self.host.is_empty()
            && !self.plugin.is_empty()
            && !self.type_name.is_empty()
            && parts.iter().all(|p| p.len() <= MAX_NAME_LENGTH)
    }
}

impl Display for SeriesIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.host, self.plugin)?;
        if !self.plugin_instance.is_empty() {
            write!(f, "-{}", self.plugin_instance)?;
        }
        write!(f, "/{}", self.type_name)?;
        if !self.type_instance.is_empty() {
            write!(f, "-{}", self.type_instance)?;
        }
        Ok(())
    }
}

impl FromStr for SeriesIdentity {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '/');
        let (host, plugin, type_part) = match (parts.next(), parts.next(), parts.next()) {
            (Some(h), Some(p), Some(t)) if !h.is_empty() && !p.is_empty() && !t.is_empty() => {
                (h, p, t)
            }
            _ => {
                return Err(ConfigError::invalid_value(
                    "identifier",
                    format!("expected host/plugin[-instance]/type[-instance], got '{}'", s),
                ))
            }
        };

        let (plugin, plugin_instance) = split_instance(plugin);
        let (type_name, type_instance) = split_instance(type_part);

        Ok(Self {
            host: host.into(),
            plugin: plugin.into(),
            plugin_instance: plugin_instance.into(),
            type_name: type_name.into(),
            type_instance: type_instance.into(),
        })
    }
}

fn split_instance(part: &str) -> (&str, &str) {
    part.split_once('-').unwrap_or((part, ""))
}

// ----------------------------------------------------------------------------
// 3.3 Metric Values - Typed Value Slots
// ----------------------------------------------------------------------------

/// Tag of a value slot, governing rate arithmetic and wraparound handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    /// Instantaneous floating-point value
    Gauge,
    /// Monotonically increasing unsigned integer that may wrap or reset
    Counter,
    /// Monotonically increasing signed integer
    Derive,
    /// Non-negative integer reset to zero on each read
    Absolute,
}

impl ValueKind {
    pub const ALL: [ValueKind; 4] = [
        ValueKind::Gauge,
        ValueKind::Counter,
        ValueKind::Derive,
        ValueKind::Absolute,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Gauge => "gauge",
            ValueKind::Counter => "counter",
            ValueKind::Derive => "derive",
            ValueKind::Absolute => "absolute",
        }
    }
}

impl Display for ValueKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValueKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ValueKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ConfigError::UnknownKind { name: s.to_string() })
    }
}

/// One value slot of an observation.
///
/// A NaN gauge is written as `null` and read back as NaN.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Value {
    Gauge(#[serde(deserialize_with = "gauge_or_nan")] f64),
    Counter(u64),
    Derive(i64),
    Absolute(u64),
}

impl Value {
    /// The kind tag of this slot
    #[inline]
    pub const fn kind(&self) -> ValueKind {
        match self {
            Value::Gauge(_) => ValueKind::Gauge,
            Value::Counter(_) => ValueKind::Counter,
            Value::Derive(_) => ValueKind::Derive,
            Value::Absolute(_) => ValueKind::Absolute,
        }
    }

    /// The slot as a float, regardless of kind
    #[inline]
    pub fn as_f64(&self) -> f64 {
        match *self {
            Value::Gauge(v) => v,
            Value::Counter(v) => v as f64,
            Value::Derive(v) => v as f64,
            Value::Absolute(v) => v as f64,
        }
    }

    /// Represent a computed rate in the given kind.
    ///
    /// Integer kinds truncate toward zero and saturate at their bounds;
    /// NaN becomes zero.
    #[inline]
    pub fn from_rate(kind: ValueKind, rate: f64) -> Self {
        match kind {
            ValueKind::Gauge => Value::Gauge(rate),
            ValueKind::Counter => Value::Counter(rate as u64),
            ValueKind::Derive => Value::Derive(rate as i64),
            ValueKind::Absolute => Value::Absolute(rate as u64),
        }
    }

    /// A memory gauge reported in KiB, expressed in bytes.
    #[inline]
    pub fn gauge_from_kib(kib: f64) -> Self {
        Value::Gauge(kib * BYTES_PER_KIB)
    }
}

fn gauge_or_nan<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Value::Gauge(v) => write!(f, "{:.6}", v),
            Value::Counter(v) => write!(f, "{}", v),
            Value::Derive(v) => write!(f, "{}", v),
            Value::Absolute(v) => write!(f, "{}", v),
        }
    }
}

/// Value slots of one observation.
pub type Values = SmallVec<[Value; INLINE_SLOTS]>;

/// Per-slot rates returned by the history store.
pub type Rates = SmallVec<[f64; INLINE_SLOTS]>;

// ----------------------------------------------------------------------------
// 3.4 Metadata - Attached Key/Value Annotations
// ----------------------------------------------------------------------------

/// A single metadata value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Boolean(bool),
    Signed(i64),
    Unsigned(u64),
    Double(f64),
    String(CompactString),
}

impl From<bool> for MetaValue {
    fn from(v: bool) -> Self {
        MetaValue::Boolean(v)
    }
}

impl From<i64> for MetaValue {
    fn from(v: i64) -> Self {
        MetaValue::Signed(v)
    }
}

impl From<u64> for MetaValue {
    fn from(v: u64) -> Self {
        MetaValue::Unsigned(v)
    }
}

impl From<f64> for MetaValue {
    fn from(v: f64) -> Self {
        MetaValue::Double(v)
    }
}

impl From<&str> for MetaValue {
    fn from(v: &str) -> Self {
        MetaValue::String(CompactString::from(v))
    }
}

impl From<String> for MetaValue {
    fn from(v: String) -> Self {
        MetaValue::String(CompactString::from(v))
    }
}

/// Metadata attached to an observation. `Clone` is a deep copy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetaData(BTreeMap<CompactString, MetaValue>);

impl MetaData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an entry, returning the previous value
    pub fn insert<K, V>(&mut self, key: K, value: V) -> Option<MetaValue>
    where
        K: Into<CompactString>,
        V: Into<MetaValue>,
    {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&MetaValue> {
        self.0.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<MetaValue> {
        self.0.remove(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetaValue)> + '_ {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

// ----------------------------------------------------------------------------
// 3.5 Observation - One Timestamped Multi-Slot Sample
// ----------------------------------------------------------------------------

/// One timestamped, multi-slot metric sample emitted by a collector.
///
/// This is also the newline-delimited JSON record read on input and written
/// on output:
///
/// ```json
/// {"host":"host1","plugin":"cpu","plugin_instance":"X","type":"cpu",
///  "type_instance":"user","time":10000000000,"interval_ms":10000,
///  "values":[{"kind":"counter","value":150}]}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    #[serde(flatten)]
    pub series: SeriesIdentity,

    /// Collection time, nanoseconds since the epoch
    #[serde(default = "Timestamp::now")]
    pub time: Timestamp,

    /// Collection interval of the emitting collector, in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,

    pub values: Values,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<MetaData>,
}

impl Observation {
    pub fn new(series: SeriesIdentity, time: Timestamp, values: Values) -> Self {
        Self {
            series,
            time,
            interval_ms: None,
            values,
            meta: None,
        }
    }

    /// Builder: record the collection interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval_ms = Some(interval.as_millis().min(u128::from(u64::MAX)) as u64);
        self
    }

    /// Collection interval, when the collector reported one
    pub fn interval(&self) -> Option<Duration> {
        self.interval_ms.map(Duration::from_millis)
    }

    /// Single-slot observation
    pub fn single(series: SeriesIdentity, time: Timestamp, value: Value) -> Self {
        let mut values = Values::new();
        values.push(value);
        Self::new(series, time, values)
    }

    /// Builder: attach a metadata entry
    pub fn with_meta<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<CompactString>,
        V: Into<MetaValue>,
    {
        self.meta.get_or_insert_with(MetaData::new).insert(key, value);
        self
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Parse one line of the JSON-lines input format.
    /// Blank lines and `#` comments yield `Ok(None)`.
    pub fn parse_line(line: &str) -> Result<Option<Self>, serde_json::Error> {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return Ok(None);
        }
        serde_json::from_str(trimmed).map(Some)
    }
}

// ----------------------------------------------------------------------------
// 3.6 Data Sets - Per-Type Slot Schemas
// ----------------------------------------------------------------------------

/// Unit a source reports in. Only KiB is normalised.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceUnit {
    #[default]
    Native,
    Kib,
}

/// Declaration of one value slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
    pub name: CompactString,
    pub kind: ValueKind,
    /// Smallest admissible reading for gauges, rate for the other kinds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Largest admissible reading for gauges, rate for the other kinds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default)]
    pub unit: SourceUnit,
}

impl DataSource {
    pub fn new(name: impl Into<CompactString>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            min: None,
            max: None,
            unit: SourceUnit::Native,
        }
    }

    pub fn with_min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    pub fn with_max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    pub fn with_unit(mut self, unit: SourceUnit) -> Self {
        self.unit = unit;
        self
    }

    /// Whether a reading or rate lies inside the declared bounds
    #[inline]
    pub fn admits(&self, rate: f64) -> bool {
        self.min.map_or(true, |min| rate >= min) && self.max.map_or(true, |max| rate <= max)
    }
}

/// Schema of one metric category: the ordered slot declarations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSet {
    #[serde(rename = "type")]
    pub type_name: CompactString,
    pub sources: SmallVec<[DataSource; INLINE_SLOTS]>,
}

impl DataSet {
    pub fn new<I>(type_name: impl Into<CompactString>, sources: I) -> Self
    where
        I: IntoIterator<Item = DataSource>,
    {
        Self {
            type_name: type_name.into(),
            sources: sources.into_iter().collect(),
        }
    }

    /// A data set with one slot named "value"
    pub fn single(type_name: impl Into<CompactString>, kind: ValueKind) -> Self {
        Self::new(type_name, [DataSource::new("value", kind)])
    }

    /// Schema taken from the observation's own slots, for unregistered types.
    pub fn inferred(observation: &Observation) -> Self {
        let single = observation.len() == 1;
        let sources = observation.values.iter().enumerate().map(|(i, v)| {
            let name = if single {
                CompactString::new("value")
            } else {
                format_compact!("value{}", i)
            };
            DataSource::new(name, v.kind())
        });
        Self::new(observation.series.type_name.clone(), sources)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Declared kind of slot `index`
    pub fn kind(&self, index: usize) -> Option<ValueKind> {
        self.sources.get(index).map(|s| s.kind)
    }

    /// Apply unit normalisation to an incoming observation.
    /// Gauge slots declared in KiB become bytes; nothing else is scaled.
    pub fn normalize(&self, observation: &mut Observation) {
        for (source, value) in self.sources.iter().zip(observation.values.iter_mut()) {
            if let (SourceUnit::Kib, Value::Gauge(kib)) = (source.unit, *value) {
                *value = Value::gauge_from_kib(kib);
            }
        }
    }

    fn check(&self) -> Result<(), ConfigError> {
        let field = format!("data_sets.{}", self.type_name);
        if self.type_name.is_empty() {
            return Err(ConfigError::invalid_value("data_sets", "data set without a type name"));
        }
        if self.sources.is_empty() {
            return Err(ConfigError::invalid_value(field, "at least one source is required"));
        }
        for (i, source) in self.sources.iter().enumerate() {
            if self.sources[..i].iter().any(|s| s.name == source.name) {
                return Err(ConfigError::invalid_value(
                    field,
                    format!("duplicate source name '{}'", source.name),
                ));
            }
            if let (Some(min), Some(max)) = (source.min, source.max) {
                if min > max {
                    return Err(ConfigError::invalid_value(
                        field,
                        format!("source '{}' has min {} above max {}", source.name, min, max),
                    ));
                }
            }
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 3.7 Data Set Registry - The Types Database
// ----------------------------------------------------------------------------

/// Lookup of data sets by type name.
#[derive(Debug, Clone, Default)]
pub struct DataSetRegistry {
    sets: AHashMap<CompactString, Arc<DataSet>>,
}

impl DataSetRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry preloaded with the common collector types
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        for kind in ValueKind::ALL {
            registry.insert(DataSet::single(kind.as_str(), kind));
        }
        registry.insert(DataSet::new(
            "cpu",
            [DataSource::new("value", ValueKind::Derive).with_min(0.0)],
        ));
        registry.insert(DataSet::new(
            "memory",
            [DataSource::new("value", ValueKind::Gauge).with_min(0.0)],
        ));
        registry.insert(DataSet::single("temperature", ValueKind::Gauge));
        registry.insert(DataSet::new(
            "power",
            [DataSource::new("value", ValueKind::Gauge).with_min(0.0)],
        ));
        registry.insert(DataSet::new(
            "if_octets",
            [
                DataSource::new("rx", ValueKind::Derive).with_min(0.0),
                DataSource::new("tx", ValueKind::Derive).with_min(0.0),
            ],
        ));
        registry.insert(DataSet::new(
            "disk_ops",
            [
                DataSource::new("read", ValueKind::Derive).with_min(0.0),
                DataSource::new("write", ValueKind::Derive).with_min(0.0),
            ],
        ));
        registry
    }

    /// Built-in types overlaid with the configured ones
    pub fn from_config(data_sets: &[DataSet]) -> Result<Self, ConfigError> {
        let mut registry = Self::builtin();
        for data_set in data_sets {
            data_set.check()?;
            if registry.insert(data_set.clone()).is_some() {
                debug!(
                    target: "relay::config",
                    type_name = %data_set.type_name,
                    "Configured data set overrides built-in"
                );
            }
        }
        Ok(registry)
    }

    pub fn insert(&mut self, data_set: DataSet) -> Option<Arc<DataSet>> {
        self.sets.insert(data_set.type_name.clone(), Arc::new(data_set))
    }

    pub fn get(&self, type_name: &str) -> Option<Arc<DataSet>> {
        self.sets.get(type_name).cloned()
    }

    /// The registered data set for the observation's type, or one inferred
    /// from its slots.
    pub fn resolve(&self, observation: &Observation) -> Arc<DataSet> {
        match self.get(&observation.series.type_name) {
            Some(data_set) => data_set,
            None => {
                trace!(
                    target: "relay::config",
                    type_name = %observation.series.type_name,
                    "Unregistered type, inferring data set"
                );
                Arc::new(DataSet::inferred(observation))
            }
        }
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================

/// Top-level relay error type
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transform error: {0}")]
    Transform(#[from] TransformError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Invoke error: {0}")]
    Invoke(#[from] InvokeError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl RelayError {
    /// Check if error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            RelayError::Config(_) => false,
            RelayError::Transform(e) => e.is_no_rate(),
            RelayError::Dispatch(e) => !matches!(e, DispatchError::NeverRegistered { .. }),
            RelayError::Invoke(_) => false,
            RelayError::Io(_) => true,
            RelayError::Internal(_) => false,
            RelayError::ShuttingDown => false,
        }
    }

    /// Get error category for metrics
    pub fn category(&self) -> &'static str {
        match self {
            RelayError::Config(_) => "config",
            RelayError::Transform(_) => "transform",
            RelayError::Dispatch(_) => "dispatch",
            RelayError::Invoke(_) => "invoke",
            RelayError::Io(_) => "io",
            RelayError::Internal(_) => "internal",
            RelayError::ShuttingDown => "shutdown",
        }
    }

    /// Get recovery hint for this error
    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            RelayError::Config(_) => RecoveryHint::FixConfiguration,
            RelayError::Transform(e) if e.is_no_rate() => RecoveryHint::Skip,
            RelayError::Transform(TransformError::ResourceExhausted { .. }) => {
                RecoveryHint::RetryNextTick
            }
            RelayError::Transform(_) => RecoveryHint::Skip,
            RelayError::Dispatch(DispatchError::NeverRegistered { .. }) => {
                RecoveryHint::RestartComponent
            }
            RelayError::Dispatch(_) => RecoveryHint::RetryNextTick,
            RelayError::Invoke(_) => RecoveryHint::RestartComponent,
            RelayError::Io(_) => RecoveryHint::RetryNextTick,
            RelayError::Internal(_) => RecoveryHint::AlertOperator,
            RelayError::ShuttingDown => RecoveryHint::None,
        }
    }
}

/// Recovery hints for error handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryHint {
    None,
    RetryNextTick,
    RestartComponent,
    FixConfiguration,
    Skip,
    AlertOperator,
}

/// Rate computation failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransformError {
    #[error("No rate available for {series}")]
    NoRateAvailable { series: SeriesIdentity },

    #[error("Unsupported value in slot {slot} of {series}: data set declares {declared}, observation carries {found}")]
    UnsupportedSlotKind {
        series: SeriesIdentity,
        slot: usize,
        declared: ValueKind,
        found: ValueKind,
    },

    #[error("Slot count mismatch for {series}: data set declares {declared}, observation carries {found}")]
    SlotCountMismatch {
        series: SeriesIdentity,
        declared: usize,
        found: usize,
    },

    #[error("Resource exhausted while building {what}")]
    ResourceExhausted { what: &'static str },
}

impl TransformError {
    /// No prior sample, or the store declined to produce a rate
    pub fn is_no_rate(&self) -> bool {
        matches!(self, TransformError::NoRateAvailable { .. })
    }

    /// The observation does not fit its data set
    pub fn is_data_error(&self) -> bool {
        matches!(
            self,
            TransformError::UnsupportedSlotKind { .. } | TransformError::SlotCountMismatch { .. }
        )
    }
}

/// Queueing and forwarding failures
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Rate buffer '{instance}' was never registered")]
    NeverRegistered { instance: String },

    #[error("Forward to '{sink}' failed: {message}")]
    ForwardFailed { sink: String, message: String },

    #[error("Sink '{sink}' disconnected")]
    Disconnected { sink: String },

    #[error("Resource exhausted while queueing {what}")]
    ResourceExhausted { what: &'static str },
}

/// Filter-chain lifecycle failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvokeError {
    #[error("Invalid input for target '{target}': {message}")]
    InvalidInput { target: String, message: String },
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {}", .path.display())]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Unknown configuration key: {key}")]
    UnknownKey { key: String },

    #[error("Unknown value kind: {name}")]
    UnknownKind { name: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Result type aliases
pub type RelayResult<T> = Result<T, RelayError>;
pub type TransformResult<T> = Result<T, TransformError>;
pub type DispatchResult<T> = Result<T, DispatchError>;

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// Layered configuration: defaults → TOML file → RATE_RELAY_* environment.
// ============================================================================

/// Which variant of the rate conversion runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    /// Buffer rates on the write path, drain on the read tick
    #[default]
    Push,
    /// Rewrite observations inline in a filter chain
    Filter,
}

impl RelayMode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            RelayMode::Push => "push",
            RelayMode::Filter => "filter",
        }
    }
}

impl Display for RelayMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelayMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "push" => Ok(RelayMode::Push),
            "filter" => Ok(RelayMode::Filter),
            other => Err(ConfigError::invalid_value(
                "mode",
                format!("expected push or filter, got '{}'", other),
            )),
        }
    }
}

/// Kind of the slots emitted by the push variant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateRepresentation {
    /// Every rate slot is a gauge
    #[default]
    Gauge,
    /// Each rate slot keeps the kind declared for its source
    PreserveKind,
}

impl FromStr for RateRepresentation {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gauge" => Ok(RateRepresentation::Gauge),
            "preserve_kind" | "preservekind" | "preserve" => Ok(RateRepresentation::PreserveKind),
            other => Err(ConfigError::invalid_value(
                "representation",
                format!("expected gauge or preserve_kind, got '{}'", other),
            )),
        }
    }
}

/// What happens to a pending rate whose forward failed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardFailurePolicy {
    /// Log and discard
    #[default]
    Drop,
    /// Put it back for the next tick, up to `max_attempts` forwards
    Requeue,
}

impl FromStr for ForwardFailurePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop" => Ok(ForwardFailurePolicy::Drop),
            "requeue" => Ok(ForwardFailurePolicy::Requeue),
            other => Err(ConfigError::invalid_value(
                "failure_policy",
                format!("expected drop or requeue, got '{}'", other),
            )),
        }
    }
}

/// Where forwarded rates go when run from the command line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// JSON lines on stdout
    #[default]
    Stdout,
    /// One tracing event per rate observation
    Log,
}

/// Main relay configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub relay: GeneralConfig,

    #[serde(default)]
    pub history: HistoryConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Additional or overriding data-set declarations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_sets: Vec<DataSet>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Name of the buffer instance, used in logs
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Source tag of emitted rate observations
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Read tick period
    #[serde(default = "default_read_interval", with = "humantime_serde")]
    pub read_interval: Duration,

    #[serde(default)]
    pub mode: RelayMode,

    #[serde(default)]
    pub representation: RateRepresentation,
}

fn default_instance_name() -> String {
    DEFAULT_RATE_NAMESPACE.to_string()
}
fn default_namespace() -> String {
    DEFAULT_RATE_NAMESPACE.to_string()
}
fn default_read_interval() -> Duration {
    Duration::from_millis(DEFAULT_READ_INTERVAL_MS)
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            namespace: default_namespace(),
            read_interval: default_read_interval(),
            mode: RelayMode::default(),
            representation: RateRepresentation::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Series idle for longer than this are evicted on the read tick
    #[serde(default = "default_history_max_age", with = "humantime_serde")]
    pub max_age: Duration,

    /// Replace rates outside a source's min/max with NaN
    #[serde(default = "default_true")]
    pub enforce_bounds: bool,
}

fn default_history_max_age() -> Duration {
    Duration::from_secs(DEFAULT_HISTORY_MAX_AGE_SECS)
}
fn default_true() -> bool {
    true
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_age: default_history_max_age(),
            enforce_bounds: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default)]
    pub failure_policy: ForwardFailurePolicy,

    /// Forward attempts per entry under the requeue policy
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default)]
    pub sink: SinkKind,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_FORWARD_ATTEMPTS
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            failure_policy: ForwardFailurePolicy::default(),
            max_attempts: default_max_attempts(),
            sink: SinkKind::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// pretty, compact or json
    #[serde(default = "default_log_format")]
    pub format: String,

    #[serde(default = "default_true")]
    pub colors: bool,

    #[serde(default)]
    pub source_location: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

impl RelayConfig {
    /// Load configuration from file with environment overrides
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let config: RelayConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("RATE_RELAY_").split("__"))
            .extract()
            .map_err(|e| ConfigError::ParseError {
                message: e.to_string(),
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: RelayConfig = toml::from_str(s).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.relay.read_interval < Duration::from_millis(MIN_READ_INTERVAL_MS) {
            return Err(ConfigError::invalid_value(
                "relay.read_interval",
                format!("must be at least {}ms", MIN_READ_INTERVAL_MS),
            ));
        }

        if self.relay.namespace.trim().is_empty() {
            return Err(ConfigError::invalid_value(
                "relay.namespace",
                "must not be empty",
            ));
        }

        if self.relay.namespace.len() > MAX_NAME_LENGTH {
            return Err(ConfigError::invalid_value(
                "relay.namespace",
                format!("must be at most {} characters", MAX_NAME_LENGTH),
            ));
        }

        if self.dispatch.max_attempts == 0 {
            return Err(ConfigError::invalid_value(
                "dispatch.max_attempts",
                "must be at least 1",
            ));
        }

        for data_set in &self.data_sets {
            data_set.check()?;
        }

        Ok(())
    }

    /// Apply one `Key=Value` style option. Keys are case-insensitive.
    pub fn apply_option(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let value = value.trim();
        match key.trim().to_ascii_lowercase().as_str() {
            "namespace" => self.relay.namespace = value.to_string(),
            "instancename" | "instance_name" => self.relay.instance_name = value.to_string(),
            "interval" => self.relay.read_interval = parse_duration("Interval", value)?,
            "mode" => self.relay.mode = value.parse()?,
            "representation" => self.relay.representation = value.parse()?,
            "forwardfailurepolicy" | "forward_failure_policy" => {
                self.dispatch.failure_policy = value.parse()?
            }
            "maxattempts" | "max_attempts" => {
                self.dispatch.max_attempts = value
                    .parse()
                    .map_err(|e| ConfigError::invalid_value("MaxAttempts", format!("{}", e)))?
            }
            "historymaxage" | "history_max_age" => {
                self.history.max_age = parse_duration("HistoryMaxAge", value)?
            }
            _ => {
                return Err(ConfigError::UnknownKey {
                    key: key.to_string(),
                })
            }
        }
        Ok(())
    }

    /// Apply a list of `KEY=VALUE` strings, then re-validate
    pub fn apply_options<I, S>(&mut self, options: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for option in options {
            let option = option.as_ref();
            let (key, value) = option.split_once('=').ok_or_else(|| {
                ConfigError::invalid_value("option", format!("expected KEY=VALUE, got '{}'", option))
            })?;
            self.apply_option(key, value)?;
        }
        self.validate()
    }

    /// Generate default configuration file content
    pub fn generate_default_config() -> String {
        let config = RelayConfig::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::from("# Failed to generate config"))
    }
}

fn parse_duration(field: &str, value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value)
        .map_err(|e| ConfigError::invalid_value(field, e.to_string()))
}

// ============================================================================
// SECTION 6: LOGGING & TRACING
// ============================================================================

/// Initialize the global tracing subscriber. Logs go to stderr so that the
/// JSON-lines output on stdout stays clean.
pub fn init_logging(config: &LoggingConfig) -> AnyhowResult<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy()
        .add_directive(
            format!("rate_relay={}", config.level)
                .parse()
                .context("invalid log level")?,
        )
        .add_directive(
            format!("relay={}", config.level)
                .parse()
                .context("invalid log level")?,
        );

    match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .json()
                    .with_writer(io::stderr)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            );
            tracing::subscriber::set_global_default(subscriber)?;
        }
        "compact" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .compact()
                    .with_writer(io::stderr)
                    .with_ansi(config.colors)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)?;
        }
        _ => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .pretty()
                    .with_writer(io::stderr)
                    .with_ansi(config.colors)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            );
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }

    Ok(())
}

/// Performance timer for measuring operation durations
#[derive(Debug)]
pub struct PerfTimer {
    name: &'static str,
    start: Instant,
}

impl PerfTimer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for PerfTimer {
    fn drop(&mut self) {
        trace!(
            target: "relay::perf",
            operation = self.name,
            elapsed_us = self.start.elapsed().as_micros() as u64,
            "Operation completed"
        );
    }
}

// ============================================================================
// SECTION 7: HISTORY CACHE
// ============================================================================
// Previous sample per series. Produces per-slot rates and advances itself.
// ============================================================================

/// Store that turns a new observation into per-slot rates against the
/// previous observation of the same series.
///
/// Returns `None` when no rate can be produced (first sample, zero or
/// negative elapsed time, shape mismatch). A returned slot may be NaN when
/// that slot has no meaningful rate this tick.
pub trait RateSource: Send + Sync {
    fn rate_of(&self, data_set: &DataSet, observation: &Observation) -> Option<Rates>;
}

#[derive(Debug, Clone)]
struct HistoryEntry {
    values: Values,
    time: Timestamp,
    seen: Instant,
}

impl From<&Observation> for HistoryEntry {
    fn from(observation: &Observation) -> Self {
        Self {
            values: observation.values.clone(),
            time: observation.time,
            seen: Instant::now(),
        }
    }
}

/// Sharded per-series history of the last accepted sample.
pub struct HistoryCache {
    entries: DashMap<SeriesIdentity, HistoryEntry, AHashRandomState>,
    enforce_bounds: bool,
    lookups: AtomicU64,
    first_samples: AtomicU64,
    rejected: AtomicU64,
}

impl Debug for HistoryCache {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("HistoryCache")
            .field("series", &self.entries.len())
            .field("enforce_bounds", &self.enforce_bounds)
            .finish()
    }
}

impl Default for HistoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::with_hasher(AHashRandomState::new()),
            enforce_bounds: true,
            lookups: AtomicU64::new(0),
            first_samples: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Builder: whether min/max of a source turn out-of-range rates into NaN
    pub fn with_bounds(mut self, enforce: bool) -> Self {
        self.enforce_bounds = enforce;
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, series: &SeriesIdentity) -> bool {
        self.entries.contains_key(series)
    }

    /// Drop the history of one series; its next sample starts over
    pub fn forget(&self, series: &SeriesIdentity) -> bool {
        self.entries.remove(series).is_some()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Evict series not seen for at least `max_age`. Returns how many.
    pub fn prune_stale(&self, max_age: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.seen.elapsed() < max_age);
        let pruned = before.saturating_sub(self.entries.len());
        if pruned > 0 {
            debug!(target: "relay::history", pruned, remaining = self.entries.len(), "Pruned stale series");
        }
        pruned
    }

    pub fn stats(&self) -> HistoryStats {
        HistoryStats {
            series: self.entries.len(),
            lookups: self.lookups.load(AtomicOrdering::Relaxed),
            first_samples: self.first_samples.load(AtomicOrdering::Relaxed),
            rejected: self.rejected.load(AtomicOrdering::Relaxed),
        }
    }
}

impl RateSource for HistoryCache {
    fn rate_of(&self, data_set: &DataSet, observation: &Observation) -> Option<Rates> {
        self.lookups.fetch_add(1, AtomicOrdering::Relaxed);

        if observation.len() != data_set.len() {
            self.rejected.fetch_add(1, AtomicOrdering::Relaxed);
            return None;
        }

        match self.entries.entry(observation.series.clone()) {
            MapEntry::Vacant(vacant) => {
                vacant.insert(HistoryEntry::from(observation));
                self.first_samples.fetch_add(1, AtomicOrdering::Relaxed);
                trace!(target: "relay::history", series = %observation.series, "First sample recorded");
                None
            }
            MapEntry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                let elapsed = observation.time.seconds_since(entry.time);
                if elapsed <= 0.0 || !elapsed.is_finite() {
                    self.rejected.fetch_add(1, AtomicOrdering::Relaxed);
                    debug!(
                        target: "relay::history",
                        series = %observation.series,
                        previous = %entry.time,
                        current = %observation.time,
                        "Sample not newer than history, ignored"
                    );
                    return None;
                }

                let mut rates = Rates::with_capacity(data_set.len());
                for (slot, source) in data_set.sources.iter().enumerate() {
                    let rate = match entry.values.get(slot) {
                        Some(previous) => {
                            slot_rate(source.kind, *previous, observation.values[slot], elapsed)
                        }
                        None => f64::NAN,
                    };
                    // Gauge bounds describe the reading, other kinds bound the rate
                    let bounded = match source.kind {
                        ValueKind::Gauge => observation.values[slot].as_f64(),
                        _ => rate,
                    };
                    if self.enforce_bounds && !rate.is_nan() && !source.admits(bounded) {
                        rates.push(f64::NAN);
                    } else {
                        rates.push(rate);
                    }
                }

                entry.values = observation.values.clone();
                entry.time = observation.time;
                entry.seen = Instant::now();
                Some(rates)
            }
        }
    }
}

/// Rate of one slot over `elapsed` seconds.
///
/// Counter and derive decreases are treated as resets and yield NaN; the
/// new value becomes the base for the next tick. A slot whose kind differs
/// between the two samples also yields NaN.
#[inline]
fn slot_rate(kind: ValueKind, previous: Value, current: Value, elapsed: f64) -> f64 {
    match (kind, previous, current) {
        (ValueKind::Gauge, Value::Gauge(p), Value::Gauge(c)) => (c - p) / elapsed,
        (ValueKind::Counter, Value::Counter(p), Value::Counter(c)) => match c.checked_sub(p) {
            Some(delta) => delta as f64 / elapsed,
            None => f64::NAN,
        },
        (ValueKind::Derive, Value::Derive(p), Value::Derive(c)) => {
            let delta = c as i128 - p as i128;
            if delta < 0 {
                f64::NAN
            } else {
                delta as f64 / elapsed
            }
        }
        (ValueKind::Absolute, Value::Absolute(_), Value::Absolute(c)) => c as f64 / elapsed,
        _ => f64::NAN,
    }
}

/// History cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HistoryStats {
    pub series: usize,
    pub lookups: u64,
    pub first_samples: u64,
    pub rejected: u64,
}

// ============================================================================
// SECTION 8: RATE TRANSFORM
// ============================================================================

/// Shared rate computation used by both variants.
#[derive(Clone)]
pub struct RateTransform {
    source: Arc<dyn RateSource>,
    namespace: CompactString,
}

impl Debug for RateTransform {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateTransform")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl RateTransform {
    pub fn new(source: Arc<dyn RateSource>, namespace: impl Into<CompactString>) -> Self {
        Self {
            source,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Whether the observation was itself emitted under the rate namespace
    pub fn is_rate_series(&self, observation: &Observation) -> bool {
        observation.series.plugin == self.namespace
    }

    /// Check the observation against its data set: same slot count, and
    /// every slot carries the declared kind.
    pub fn validate(&self, data_set: &DataSet, observation: &Observation) -> TransformResult<()> {
        if data_set.len() != observation.len() {
            return Err(TransformError::SlotCountMismatch {
                series: observation.series.clone(),
                declared: data_set.len(),
                found: observation.len(),
            });
        }

        for (slot, (source, value)) in data_set.sources.iter().zip(&observation.values).enumerate() {
            if source.kind != value.kind() {
                return Err(TransformError::UnsupportedSlotKind {
                    series: observation.series.clone(),
                    slot,
                    declared: source.kind,
                    found: value.kind(),
                });
            }
        }

        Ok(())
    }

    /// Rates for the observation. Validation happens before the history is
    /// consulted, so a malformed observation never advances it.
    fn rates(&self, data_set: &DataSet, observation: &Observation) -> TransformResult<Rates> {
        self.validate(data_set, observation)?;
        match self.source.rate_of(data_set, observation) {
            Some(rates) if rates.first().map_or(false, |r| !r.is_nan()) => Ok(rates),
            _ => {
                trace!(target: "relay::transform", series = %observation.series, "No rate available");
                Err(TransformError::NoRateAvailable {
                    series: observation.series.clone(),
                })
            }
        }
    }

    fn represent(
        data_set: &DataSet,
        rates: &Rates,
        representation: RateRepresentation,
    ) -> TransformResult<Values> {
        let mut values = Values::new();
        values
            .try_reserve(rates.len())
            .map_err(|_| TransformError::ResourceExhausted { what: "rate values" })?;

        for (source, &rate) in data_set.sources.iter().zip(rates.iter()) {
            values.push(match representation {
                RateRepresentation::Gauge => Value::Gauge(rate),
                RateRepresentation::PreserveKind => Value::from_rate(source.kind, rate),
            });
        }
        Ok(values)
    }

    /// Build a new rate observation: same qualifiers and time, plugin
    /// replaced by the namespace, metadata deep-copied.
    pub fn derive(
        &self,
        data_set: &DataSet,
        observation: &Observation,
        representation: RateRepresentation,
    ) -> TransformResult<Observation> {
        let _timer = PerfTimer::new("rate_derive");
        let rates = self.rates(data_set, observation)?;
        let values = Self::represent(data_set, &rates, representation)?;

        let mut series = observation.series.clone();
        series.plugin = self.namespace.clone();

        Ok(Observation {
            series,
            time: observation.time,
            interval_ms: observation.interval_ms,
            values,
            meta: observation.meta.clone(),
        })
    }

    /// Replace the observation's values with their rates, keeping each
    /// slot's declared kind. On error the observation is untouched.
    pub fn rewrite(&self, data_set: &DataSet, observation: &mut Observation) -> TransformResult<()> {
        let rates = self.rates(data_set, observation)?;
        let values = Self::represent(data_set, &rates, RateRepresentation::PreserveKind)?;
        observation.values = values;
        Ok(())
    }
}

#[cfg(test)]
mod history_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn series(type_name: &str) -> SeriesIdentity {
        SeriesIdentity::new("host1", "cpu", type_name)
            .with_plugin_instance("X")
            .with_type_instance("user")
    }

    fn sample(type_name: &str, secs: i64, value: Value) -> Observation {
        Observation::single(series(type_name), Timestamp::from_secs(secs), value)
    }

    fn transform(history: &Arc<HistoryCache>) -> RateTransform {
        let source: Arc<dyn RateSource> = history.clone();
        RateTransform::new(source, DEFAULT_RATE_NAMESPACE)
    }

    #[test]
    fn test_first_sample_has_no_rate() {
        let cache = HistoryCache::new();
        let ds = DataSet::single("counter", ValueKind::Counter);

        assert!(cache.rate_of(&ds, &sample("counter", 0, Value::Counter(100))).is_none());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().first_samples, 1);
    }

    #[test]
    fn test_counter_rate_and_reset() {
        let cache = HistoryCache::new();
        let ds = DataSet::single("counter", ValueKind::Counter);

        cache.rate_of(&ds, &sample("counter", 0, Value::Counter(100)));
        let rates = cache.rate_of(&ds, &sample("counter", 10, Value::Counter(150))).unwrap();
        assert_eq!(rates.as_slice(), &[5.0]);

        let rates = cache.rate_of(&ds, &sample("counter", 11, Value::Counter(140))).unwrap();
        assert!(rates[0].is_nan());

        // the post-reset value is the new base
        let rates = cache.rate_of(&ds, &sample("counter", 13, Value::Counter(150))).unwrap();
        assert_eq!(rates.as_slice(), &[5.0]);
    }

    #[test]
    fn test_gauge_rate_can_be_negative() {
        let cache = HistoryCache::new();
        let ds = DataSet::single("gauge", ValueKind::Gauge);

        cache.rate_of(&ds, &sample("gauge", 0, Value::Gauge(10.0)));
        let rates = cache.rate_of(&ds, &sample("gauge", 3, Value::Gauge(4.0))).unwrap();
        assert_eq!(rates.as_slice(), &[-2.0]);
    }

    #[test]
    fn test_derive_and_absolute_rates() {
        let cache = HistoryCache::new();
        let derive = DataSet::single("derive", ValueKind::Derive);
        let absolute = DataSet::single("absolute", ValueKind::Absolute);

        cache.rate_of(&derive, &sample("derive", 0, Value::Derive(-100)));
        let rates = cache.rate_of(&derive, &sample("derive", 4, Value::Derive(100))).unwrap();
        assert_eq!(rates.as_slice(), &[50.0]);

        let rates = cache.rate_of(&derive, &sample("derive", 5, Value::Derive(90))).unwrap();
        assert!(rates[0].is_nan());

        cache.rate_of(&absolute, &sample("absolute", 0, Value::Absolute(30)));
        let rates = cache.rate_of(&absolute, &sample("absolute", 6, Value::Absolute(60))).unwrap();
        assert_eq!(rates.as_slice(), &[10.0]);
    }

    #[test]
    fn test_stale_timestamps_leave_history_untouched() {
        let cache = HistoryCache::new();
        let ds = DataSet::single("counter", ValueKind::Counter);

        cache.rate_of(&ds, &sample("counter", 10, Value::Counter(100)));
        assert!(cache.rate_of(&ds, &sample("counter", 10, Value::Counter(200))).is_none());
        assert!(cache.rate_of(&ds, &sample("counter", 5, Value::Counter(50))).is_none());
        assert_eq!(cache.stats().rejected, 2);

        let rates = cache.rate_of(&ds, &sample("counter", 20, Value::Counter(110))).unwrap();
        assert_eq!(rates.as_slice(), &[1.0]);
    }

    #[test]
    fn test_kind_change_yields_nan() {
        let cache = HistoryCache::new();
        let ds = DataSet::single("counter", ValueKind::Counter);

        cache.rate_of(&ds, &sample("counter", 0, Value::Counter(100)));
        let rates = cache.rate_of(&ds, &sample("counter", 1, Value::Gauge(150.0))).unwrap();
        assert!(rates[0].is_nan());
    }

    #[test]
    fn test_bounds_turn_rates_into_nan() {
        let ds = DataSet::new("power", [DataSource::new("value", ValueKind::Gauge).with_max(1.0)]);

        let cache = HistoryCache::new();
        cache.rate_of(&ds, &sample("power", 0, Value::Gauge(0.0)));
        let rates = cache.rate_of(&ds, &sample("power", 1, Value::Gauge(10.0))).unwrap();
        assert!(rates[0].is_nan());

        let cache = HistoryCache::new().with_bounds(false);
        cache.rate_of(&ds, &sample("power", 0, Value::Gauge(0.0)));
        let rates = cache.rate_of(&ds, &sample("power", 1, Value::Gauge(10.0))).unwrap();
        assert_eq!(rates.as_slice(), &[10.0]);
    }

    #[test]
    fn test_gauge_bounds_apply_to_the_reading() {
        let cache = HistoryCache::new();
        let ds = DataSetRegistry::builtin().get("memory").unwrap();

        cache.rate_of(&ds, &sample("memory", 0, Value::Gauge(2000.0)));
        let rates = cache.rate_of(&ds, &sample("memory", 10, Value::Gauge(1000.0))).unwrap();
        assert_eq!(rates.as_slice(), &[-100.0]);

        let rates = cache.rate_of(&ds, &sample("memory", 20, Value::Gauge(-10.0))).unwrap();
        assert!(rates[0].is_nan());
    }

    #[test]
    fn test_slot_count_mismatch_is_not_recorded() {
        let cache = HistoryCache::new();
        let ds = DataSetRegistry::builtin().get("if_octets").unwrap();

        assert!(cache.rate_of(&ds, &sample("if_octets", 0, Value::Derive(1))).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_prune_and_forget() {
        let cache = HistoryCache::new();
        let ds = DataSet::single("counter", ValueKind::Counter);
        cache.rate_of(&ds, &sample("counter", 0, Value::Counter(1)));
        cache.rate_of(&ds, &sample("gauge", 0, Value::Counter(1)));

        assert_eq!(cache.prune_stale(Duration::from_secs(3600)), 0);
        assert!(cache.forget(&series("gauge")));
        assert!(!cache.contains(&series("gauge")));
        assert_eq!(cache.prune_stale(Duration::ZERO), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_push_scenario() {
        let history = Arc::new(HistoryCache::new());
        let transform = transform(&history);
        let ds = DataSet::single("counter", ValueKind::Counter);

        let first = sample("counter", 0, Value::Counter(100)).with_meta("origin", "nic0");
        assert!(transform
            .derive(&ds, &first, RateRepresentation::Gauge)
            .unwrap_err()
            .is_no_rate());

        let second = sample("counter", 10, Value::Counter(150)).with_meta("origin", "nic0");
        let rate = transform.derive(&ds, &second, RateRepresentation::Gauge).unwrap();
        assert_eq!(rate.series.host, "host1");
        assert_eq!(rate.series.plugin, "rate");
        assert_eq!(rate.series.plugin_instance, "X");
        assert_eq!(rate.series.type_name, "counter");
        assert_eq!(rate.series.type_instance, "user");
        assert_eq!(rate.time, second.time);
        assert_eq!(rate.values.as_slice(), &[Value::Gauge(5.0)]);
        assert_eq!(rate.meta, second.meta);

        let third = sample("counter", 11, Value::Counter(140));
        let err = transform.derive(&ds, &third, RateRepresentation::Gauge).unwrap_err();
        assert!(err.is_no_rate());
    }

    #[test]
    fn test_derive_carries_interval() {
        let history = Arc::new(HistoryCache::new());
        let transform = transform(&history);
        let ds = DataSet::single("counter", ValueKind::Counter);
        let interval = Duration::from_secs(10);

        transform
            .derive(&ds, &sample("counter", 0, Value::Counter(100)).with_interval(interval), RateRepresentation::Gauge)
            .ok();
        let rate = transform
            .derive(&ds, &sample("counter", 10, Value::Counter(150)).with_interval(interval), RateRepresentation::Gauge)
            .unwrap();
        assert_eq!(rate.interval_ms, Some(10_000));
        assert_eq!(rate.interval(), Some(interval));
    }

    #[test]
    fn test_later_slot_reset_survives_json_lines() {
        let history = Arc::new(HistoryCache::new());
        let transform = transform(&history);
        let ds = DataSetRegistry::builtin().get("if_octets").unwrap();
        let octets = |secs: i64, rx: i64, tx: i64| {
            Observation::new(
                series("if_octets"),
                Timestamp::from_secs(secs),
                [Value::Derive(rx), Value::Derive(tx)].into_iter().collect(),
            )
        };

        transform.derive(&ds, &octets(0, 10, 100), RateRepresentation::Gauge).ok();
        let rate = transform
            .derive(&ds, &octets(10, 20, 50), RateRepresentation::Gauge)
            .unwrap();
        assert_eq!(rate.values[0], Value::Gauge(1.0));
        assert!(rate.values[1].as_f64().is_nan());

        let sink = JsonLinesDispatch::new("memory", Vec::new());
        sink.dispatch(&rate).unwrap();
        let written = String::from_utf8(sink.into_inner()).unwrap();
        assert!(written.contains(r#"{"kind":"gauge","value":null}"#));

        let read_back = Observation::parse_line(written.trim()).unwrap().unwrap();
        assert_eq!(read_back.series, rate.series);
        assert_eq!(read_back.values[0], Value::Gauge(1.0));
        assert!(matches!(read_back.values[1], Value::Gauge(v) if v.is_nan()));
    }

    #[test]
    fn test_preserve_kind_representation() {
        let history = Arc::new(HistoryCache::new());
        let transform = transform(&history);
        let ds = DataSet::single("counter", ValueKind::Counter);

        transform.derive(&ds, &sample("counter", 0, Value::Counter(100)), RateRepresentation::PreserveKind).ok();
        let rate = transform
            .derive(&ds, &sample("counter", 4, Value::Counter(111)), RateRepresentation::PreserveKind)
            .unwrap();
        assert_eq!(rate.values.as_slice(), &[Value::Counter(2)]);
    }

    #[test]
    fn test_rewrite_keeps_identity_and_kinds() {
        let history = Arc::new(HistoryCache::new());
        let transform = transform(&history);
        let ds = DataSetRegistry::builtin().get("if_octets").unwrap();
        let identity = SeriesIdentity::new("host1", "interface", "if_octets").with_plugin_instance("eth0");

        let mut first = Observation::new(
            identity.clone(),
            Timestamp::from_secs(0),
            smallvec::smallvec![Value::Derive(1000), Value::Derive(2000)],
        );
        let untouched = first.clone();
        assert!(transform.rewrite(&ds, &mut first).unwrap_err().is_no_rate());
        assert_eq!(first, untouched);

        let mut second = Observation::new(
            identity.clone(),
            Timestamp::from_secs(5),
            smallvec::smallvec![Value::Derive(1500), Value::Derive(2600)],
        );
        transform.rewrite(&ds, &mut second).unwrap();
        assert_eq!(second.series, identity);
        assert_eq!(second.values.as_slice(), &[Value::Derive(100), Value::Derive(120)]);
    }

    #[test]
    fn test_validation_precedes_history() {
        let history = Arc::new(HistoryCache::new());
        let transform = transform(&history);
        let ds = DataSet::single("counter", ValueKind::Counter);

        let err = transform
            .derive(&ds, &sample("counter", 0, Value::Gauge(1.0)), RateRepresentation::Gauge)
            .unwrap_err();
        assert!(matches!(
            err,
            TransformError::UnsupportedSlotKind {
                slot: 0,
                declared: ValueKind::Counter,
                found: ValueKind::Gauge,
                ..
            }
        ));
        assert!(history.is_empty());

        let two_slots = DataSetRegistry::builtin().get("disk_ops").unwrap();
        let err = transform
            .derive(&two_slots, &sample("disk_ops", 0, Value::Derive(1)), RateRepresentation::Gauge)
            .unwrap_err();
        assert!(matches!(
            err,
            TransformError::SlotCountMismatch {
                declared: 2,
                found: 1,
                ..
            }
        ));
        assert!(err.is_data_error());
        assert!(history.is_empty());
    }

    proptest! {
        #[test]
        fn prop_derive_rate_is_delta_over_elapsed(
            v0 in -1_000_000_000i64..1_000_000_000,
            step in 0i64..1_000_000_000,
            t0 in 0i64..1_000_000,
            dt in 1i64..100_000,
        ) {
            let cache = HistoryCache::new();
            let ds = DataSet::single("derive", ValueKind::Derive);
            cache.rate_of(&ds, &sample("derive", t0, Value::Derive(v0)));
            let rates = cache.rate_of(&ds, &sample("derive", t0 + dt, Value::Derive(v0 + step)));
            prop_assert!(rates.is_some());
            let rates = rates.unwrap();
            let expected = step as f64 / dt as f64;
            prop_assert!((rates[0] - expected).abs() <= 1e-9 * expected.abs().max(1.0));
        }

        #[test]
        fn prop_gauge_rate_is_delta_over_elapsed(
            g0 in -1.0e6f64..1.0e6,
            g1 in -1.0e6f64..1.0e6,
            dt_ms in 1i64..10_000_000,
        ) {
            let cache = HistoryCache::new();
            let ds = DataSet::single("gauge", ValueKind::Gauge);
            let at = |ms: i64, v: f64| {
                Observation::single(series("gauge"), Timestamp::from_millis(ms), Value::Gauge(v))
            };
            cache.rate_of(&ds, &at(0, g0));
            let rates = cache.rate_of(&ds, &at(dt_ms, g1));
            prop_assert!(rates.is_some());
            let rates = rates.unwrap();
            let expected = (g1 - g0) / (dt_ms as f64 / 1000.0);
            prop_assert!((rates[0] - expected).abs() <= 1e-9 * expected.abs().max(1.0));
        }
    }
}

// ============================================================================
// SECTION 9: DISPATCH
// ============================================================================
// Downstream forwarding of rate observations.
// ============================================================================

// ----------------------------------------------------------------------------
// 9.1 Dispatch Trait
// ----------------------------------------------------------------------------

/// Hands one observation to the downstream pipeline.
pub trait Dispatch: Send + Sync {
    /// Sink name, used in logs and errors
    fn name(&self) -> &str {
        "anonymous"
    }

    fn dispatch(&self, observation: &Observation) -> DispatchResult<()>;
}

impl<F> Dispatch for F
where
    F: Fn(&Observation) -> DispatchResult<()> + Send + Sync,
{
    fn dispatch(&self, observation: &Observation) -> DispatchResult<()> {
        self(observation)
    }
}

// ----------------------------------------------------------------------------
// 9.2 Channel Dispatch
// ----------------------------------------------------------------------------

/// Forwards into a flume channel. Never blocks: a full bounded channel
/// counts as a failed forward.
#[derive(Debug, Clone)]
pub struct ChannelDispatch {
    name: CompactString,
    sender: FlumeSender<Observation>,
}

impl ChannelDispatch {
    /// Unbounded channel
    pub fn unbounded(name: impl Into<CompactString>) -> (Self, FlumeReceiver<Observation>) {
        let (sender, receiver) = flume::unbounded();
        (
            Self {
                name: name.into(),
                sender,
            },
            receiver,
        )
    }

    /// Bounded channel of the given capacity
    pub fn bounded(
        name: impl Into<CompactString>,
        capacity: usize,
    ) -> (Self, FlumeReceiver<Observation>) {
        let (sender, receiver) = flume::bounded(capacity);
        (
            Self {
                name: name.into(),
                sender,
            },
            receiver,
        )
    }

    /// Current queue depth
    pub fn depth(&self) -> usize {
        self.sender.len()
    }
}

impl Dispatch for ChannelDispatch {
    fn name(&self) -> &str {
        &self.name
    }

    fn dispatch(&self, observation: &Observation) -> DispatchResult<()> {
        match self.sender.try_send(observation.clone()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(DispatchError::ForwardFailed {
                sink: self.name.to_string(),
                message: "channel full".to_string(),
            }),
            Err(TrySendError::Disconnected(_)) => Err(DispatchError::Disconnected {
                sink: self.name.to_string(),
            }),
        }
    }
}

// ----------------------------------------------------------------------------
// 9.3 JSON Lines Dispatch
// ----------------------------------------------------------------------------

/// Writes each observation as one JSON line.
pub struct JsonLinesDispatch<W> {
    name: CompactString,
    writer: Mutex<W>,
}

impl<W> Debug for JsonLinesDispatch<W> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonLinesDispatch")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<W: Write + Send> JsonLinesDispatch<W> {
    pub fn new(name: impl Into<CompactString>, writer: W) -> Self {
        Self {
            name: name.into(),
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl JsonLinesDispatch<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new("stdout", io::stdout())
    }
}

impl<W: Write + Send> Dispatch for JsonLinesDispatch<W> {
    fn name(&self) -> &str {
        &self.name
    }

    fn dispatch(&self, observation: &Observation) -> DispatchResult<()> {
        let line = serde_json::to_string(observation).map_err(|e| DispatchError::ForwardFailed {
            sink: self.name.to_string(),
            message: e.to_string(),
        })?;

        let mut writer = self.writer.lock();
        writeln!(writer, "{}", line)
            .and_then(|_| writer.flush())
            .map_err(|e| match e.kind() {
                io::ErrorKind::BrokenPipe => DispatchError::Disconnected {
                    sink: self.name.to_string(),
                },
                _ => DispatchError::ForwardFailed {
                    sink: self.name.to_string(),
                    message: e.to_string(),
                },
            })
    }
}

// ----------------------------------------------------------------------------
// 9.4 Log Dispatch
// ----------------------------------------------------------------------------

/// Emits one structured log event per observation.
#[derive(Debug, Clone)]
pub struct LogDispatch {
    name: CompactString,
}

impl LogDispatch {
    pub fn new(name: impl Into<CompactString>) -> Self {
        Self { name: name.into() }
    }
}

impl Dispatch for LogDispatch {
    fn name(&self) -> &str {
        &self.name
    }

    fn dispatch(&self, observation: &Observation) -> DispatchResult<()> {
        let values: SmallVec<[String; INLINE_SLOTS]> =
            observation.values.iter().map(|v| v.to_string()).collect();
        info!(
            target: "relay::output",
            series = %observation.series,
            time = %observation.time,
            values = ?values,
            "Rate"
        );
        Ok(())
    }
}

// ============================================================================
// SECTION 10: RATE BUFFER (PUSH VARIANT)
// ============================================================================
// Write path: compute and queue. Read tick: detach and forward.
// ============================================================================

/// A rate observation waiting for the next read tick
#[derive(Debug, Clone)]
pub struct PendingRate {
    pub observation: Observation,
    pub accepted_at: Timestamp,
    /// Failed forward attempts so far
    pub attempts: u32,
}

/// Result of a successful accept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// A rate observation was queued
    Queued,
    /// Nothing to emit yet (first sample, reset, stale timestamp)
    NoRate,
    /// The observation was already a rate observation
    Loopback,
}

/// Per-drain counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub forwarded: usize,
    pub failed: usize,
    pub dropped: usize,
    pub requeued: usize,
}

impl DrainReport {
    pub fn is_empty(&self) -> bool {
        self.forwarded == 0 && self.failed == 0
    }
}

/// Push-variant dispatcher: accepts observations, queues their rates and
/// forwards them on drain.
///
/// The pending list is the only shared mutable state and is guarded by a
/// single mutex. Accept holds it for one push; drain holds it for one
/// `mem::take`. Rate computation and forwarding run outside of it.
#[derive(Debug)]
pub struct RateBuffer {
    name: CompactString,
    transform: RateTransform,
    representation: RateRepresentation,
    policy: ForwardFailurePolicy,
    max_attempts: u32,
    /// `None` until registered and after shutdown. Oldest first.
    pending: Mutex<Option<Vec<PendingRate>>>,
    stats: Arc<RelayStats>,
}

impl RateBuffer {
    pub fn new(name: impl Into<CompactString>, transform: RateTransform) -> Self {
        Self {
            name: name.into(),
            transform,
            representation: RateRepresentation::Gauge,
            policy: ForwardFailurePolicy::Drop,
            max_attempts: DEFAULT_MAX_FORWARD_ATTEMPTS,
            pending: Mutex::new(None),
            stats: Arc::new(RelayStats::new()),
        }
    }

    pub fn with_representation(mut self, representation: RateRepresentation) -> Self {
        self.representation = representation;
        self
    }

    pub fn with_failure_policy(mut self, policy: ForwardFailurePolicy, max_attempts: u32) -> Self {
        self.policy = policy;
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_stats(mut self, stats: Arc<RelayStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    /// Wire the instance up. Returns false if it was already registered.
    pub fn register(&self) -> bool {
        let mut pending = self.pending.lock();
        if pending.is_some() {
            return false;
        }
        *pending = Some(Vec::new());
        info!(target: "relay::buffer", instance = %self.name, "Rate buffer registered");
        true
    }

    pub fn is_registered(&self) -> bool {
        self.pending.lock().is_some()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().as_ref().map_or(0, Vec::len)
    }

    fn never_registered(&self) -> DispatchError {
        DispatchError::NeverRegistered {
            instance: self.name.to_string(),
        }
    }

    /// Write path. Computes the rate outside the lock and queues it.
    pub fn accept(&self, data_set: &DataSet, observation: &Observation) -> RelayResult<AcceptOutcome> {
        if !self.is_registered() {
            return Err(self.never_registered().into());
        }
        bump(&self.stats.accepted, 1);

        if self.transform.is_rate_series(observation) {
            bump(&self.stats.loopback, 1);
            trace!(target: "relay::buffer", series = %observation.series, "Skipping rate observation");
            return Ok(AcceptOutcome::Loopback);
        }

        let rate = match self.transform.derive(data_set, observation, self.representation) {
            Ok(rate) => rate,
            Err(TransformError::NoRateAvailable { .. }) => {
                bump(&self.stats.no_rate, 1);
                return Ok(AcceptOutcome::NoRate);
            }
            Err(err) => {
                bump(&self.stats.rejected, 1);
                error!(
                    target: "relay::buffer",
                    instance = %self.name,
                    series = %observation.series,
                    error = %err,
                    "Rejected observation"
                );
                return Err(err.into());
            }
        };

        let entry = PendingRate {
            observation: rate,
            accepted_at: Timestamp::now(),
            attempts: 0,
        };

        {
            let mut guard = self.pending.lock();
            let pending = guard.as_mut().ok_or_else(|| self.never_registered())?;
            pending
                .try_reserve(1)
                .map_err(|_| DispatchError::ResourceExhausted { what: "pending rate" })?;
            pending.push(entry);
        }

        bump(&self.stats.queued, 1);
        Ok(AcceptOutcome::Queued)
    }

    /// Read path. Detaches everything queued and forwards it, newest first.
    pub fn drain(&self, sink: &dyn Dispatch) -> DispatchResult<DrainReport> {
        let detached = {
            let mut guard = self.pending.lock();
            match guard.as_mut() {
                Some(pending) => mem::take(pending),
                None => return Err(self.never_registered()),
            }
        };

        let mut report = DrainReport::default();
        if detached.is_empty() {
            return Ok(report);
        }

        let _timer = PerfTimer::new("rate_drain");
        let mut retry = Vec::new();

        for mut entry in detached.into_iter().rev() {
            match sink.dispatch(&entry.observation) {
                Ok(()) => report.forwarded += 1,
                Err(err) => {
                    report.failed += 1;
                    entry.attempts += 1;
                    if self.policy == ForwardFailurePolicy::Requeue && entry.attempts < self.max_attempts {
                        retry.push(entry);
                    } else {
                        report.dropped += 1;
                        warn!(
                            target: "relay::buffer",
                            instance = %self.name,
                            sink = sink.name(),
                            series = %entry.observation.series,
                            attempts = entry.attempts,
                            error = %err,
                            "Dropped rate observation after failed forward"
                        );
                    }
                }
            }
        }

        if !retry.is_empty() {
            let retried = retry.len();
            let requeued = self.requeue(retry);
            report.requeued += requeued;
            report.dropped += retried - requeued;
        }

        bump(&self.stats.forwarded, report.forwarded as u64);
        bump(&self.stats.forward_failed, report.failed as u64);
        bump(&self.stats.dropped, report.dropped as u64);
        bump(&self.stats.requeued, report.requeued as u64);

        debug!(
            target: "relay::buffer",
            instance = %self.name,
            sink = sink.name(),
            forwarded = report.forwarded,
            failed = report.failed,
            requeued = report.requeued,
            "Drained rate buffer"
        );

        Ok(report)
    }

    /// Put failed entries back behind anything accepted since the drain
    /// started. `retry` is newest first.
    fn requeue(&self, mut retry: Vec<PendingRate>) -> usize {
        let mut guard = self.pending.lock();
        match guard.as_mut() {
            Some(pending) => {
                retry.reverse();
                let count = retry.len();
                retry.append(pending);
                *pending = retry;
                count
            }
            None => 0,
        }
    }

    /// Final drain, then deregister. Entries that fail this last forward
    /// are dropped.
    pub fn shutdown(&self, sink: &dyn Dispatch) -> DispatchResult<DrainReport> {
        let mut report = self.drain(sink)?;

        let leftover = self.pending.lock().take();
        if let Some(leftover) = leftover {
            if !leftover.is_empty() {
                warn!(
                    target: "relay::buffer",
                    instance = %self.name,
                    count = leftover.len(),
                    "Discarding requeued rates on shutdown"
                );
                report.dropped += leftover.len();
                bump(&self.stats.dropped, leftover.len() as u64);
            }
        }

        info!(
            target: "relay::buffer",
            instance = %self.name,
            forwarded = report.forwarded,
            dropped = report.dropped,
            "Rate buffer shut down"
        );
        Ok(report)
    }
}


// ============================================================================
// SECTION 11: RATE TARGET & FILTER CHAIN (FILTER VARIANT)
// ============================================================================

// ----------------------------------------------------------------------------
// 11.1 Target Lifecycle
// ----------------------------------------------------------------------------

/// What the chain does after a target ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainSignal {
    /// Hand the observation to the next target
    Continue,
    /// Stop processing this observation
    Stop,
}

/// Per-handle local state of a created target
#[derive(Debug, Default)]
pub struct TargetState {
    invocations: AtomicU64,
    stops: AtomicU64,
}

impl TargetState {
    pub fn invocations(&self) -> u64 {
        self.invocations.load(AtomicOrdering::Relaxed)
    }

    pub fn stops(&self) -> u64 {
        self.stops.load(AtomicOrdering::Relaxed)
    }
}

/// Host-owned handle through which a target keeps its local state.
/// `Uninitialized → Created → Destroyed`; `Destroyed` is terminal.
#[derive(Debug, Default)]
pub enum TargetHandle {
    #[default]
    Uninitialized,
    Created(Box<TargetState>),
    Destroyed,
}

impl TargetHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_created(&self) -> bool {
        matches!(self, TargetHandle::Created(_))
    }

    pub fn is_destroyed(&self) -> bool {
        matches!(self, TargetHandle::Destroyed)
    }

    pub fn state(&self) -> Option<&TargetState> {
        match self {
            TargetHandle::Created(state) => Some(state),
            _ => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            TargetHandle::Uninitialized => "uninitialized",
            TargetHandle::Created(_) => "created",
            TargetHandle::Destroyed => "destroyed",
        }
    }
}

/// A processing step of a [`FilterChain`].
pub trait ChainTarget: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// Bring a handle from `Uninitialized` to `Created`
    fn create(&self, handle: &mut TargetHandle) -> Result<(), InvokeError>;

    /// Process one observation. The handle must be `Created`.
    fn invoke(
        &self,
        data_set: &DataSet,
        observation: &mut Observation,
        handle: &TargetHandle,
    ) -> Result<ChainSignal, InvokeError>;

    /// Release the handle's state. Idempotent.
    fn destroy(&self, handle: &mut TargetHandle);
}

// ----------------------------------------------------------------------------
// 11.2 Rate Target
// ----------------------------------------------------------------------------

/// Inline rate conversion. Rewrites each observation's values to their
/// rates, keeping the identity and every slot's kind.
#[derive(Debug, Clone)]
pub struct RateTarget {
    transform: RateTransform,
    stats: Arc<RelayStats>,
}

impl RateTarget {
    pub const NAME: &'static str = "rate";

    pub fn new(transform: RateTransform) -> Self {
        Self {
            transform,
            stats: Arc::new(RelayStats::new()),
        }
    }

    pub fn with_stats(mut self, stats: Arc<RelayStats>) -> Self {
        self.stats = stats;
        self
    }

    fn invalid(&self, message: impl Into<String>) -> InvokeError {
        InvokeError::InvalidInput {
            target: Self::NAME.to_string(),
            message: message.into(),
        }
    }
}

impl ChainTarget for RateTarget {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn create(&self, handle: &mut TargetHandle) -> Result<(), InvokeError> {
        match handle {
            TargetHandle::Uninitialized => {
                *handle = TargetHandle::Created(Box::default());
                debug!(target: "relay::target", "Rate target created");
                Ok(())
            }
            other => Err(self.invalid(format!("create on a {} handle", other.label()))),
        }
    }

    fn invoke(
        &self,
        data_set: &DataSet,
        observation: &mut Observation,
        handle: &TargetHandle,
    ) -> Result<ChainSignal, InvokeError> {
        let state = match handle {
            TargetHandle::Created(state) => state,
            other => return Err(self.invalid(format!("invoke on a {} handle", other.label()))),
        };
        state.invocations.fetch_add(1, AtomicOrdering::Relaxed);
        bump(&self.stats.invocations, 1);

        match self.transform.rewrite(data_set, observation) {
            Ok(()) => Ok(ChainSignal::Continue),
            Err(err) => {
                if err.is_no_rate() {
                    bump(&self.stats.no_rate, 1);
                } else {
                    bump(&self.stats.rejected, 1);
                    error!(
                        target: "relay::target",
                        series = %observation.series,
                        error = %err,
                        "Rate conversion failed"
                    );
                }
                state.stops.fetch_add(1, AtomicOrdering::Relaxed);
                bump(&self.stats.chain_stops, 1);
                Ok(ChainSignal::Stop)
            }
        }
    }

    fn destroy(&self, handle: &mut TargetHandle) {
        if let TargetHandle::Created(state) = handle {
            debug!(
                target: "relay::target",
                invocations = state.invocations(),
                stops = state.stops(),
                "Rate target destroyed"
            );
        }
        *handle = TargetHandle::Destroyed;
    }
}

// ----------------------------------------------------------------------------
// 11.3 Filter Chain
// ----------------------------------------------------------------------------

/// Ordered targets, each with the handle the chain owns for it.
/// Handles are created on add and destroyed on close or drop.
#[derive(Debug)]
pub struct FilterChain {
    name: CompactString,
    targets: Vec<(Arc<dyn ChainTarget>, TargetHandle)>,
}

impl FilterChain {
    pub fn new(name: impl Into<CompactString>) -> Self {
        Self {
            name: name.into(),
            targets: Vec::new(),
        }
    }

    pub fn add_target(&mut self, target: Arc<dyn ChainTarget>) -> Result<(), InvokeError> {
        let mut handle = TargetHandle::new();
        target.create(&mut handle)?;
        info!(target: "relay::target", chain = %self.name, name = target.name(), "Target added to chain");
        self.targets.push((target, handle));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Run targets in order until one returns `Stop`.
    pub fn process(
        &self,
        data_set: &DataSet,
        observation: &mut Observation,
    ) -> Result<ChainSignal, InvokeError> {
        for (target, handle) in &self.targets {
            if target.invoke(data_set, observation, handle)? == ChainSignal::Stop {
                return Ok(ChainSignal::Stop);
            }
        }
        Ok(ChainSignal::Continue)
    }

    /// Destroy every handle and empty the chain
    pub fn close(&mut self) {
        for (target, handle) in self.targets.iter_mut() {
            target.destroy(handle);
        }
        self.targets.clear();
    }
}

impl Drop for FilterChain {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// SECTION 12: STATISTICS
// ============================================================================

#[inline]
fn bump(counter: &AtomicU64, n: u64) {
    if n > 0 {
        counter.fetch_add(n, AtomicOrdering::Relaxed);
    }
}

/// Relay-wide counters
#[derive(Debug, Default)]
pub struct RelayStats {
    /// Observations handed to the buffer
    pub accepted: AtomicU64,
    /// Rate observations queued
    pub queued: AtomicU64,
    /// Observations that produced no rate
    pub no_rate: AtomicU64,
    /// Rate observations fed back in and skipped
    pub loopback: AtomicU64,
    /// Observations failing data-set validation
    pub rejected: AtomicU64,
    pub forwarded: AtomicU64,
    pub forward_failed: AtomicU64,
    pub dropped: AtomicU64,
    pub requeued: AtomicU64,
    /// Rate target invocations
    pub invocations: AtomicU64,
    pub chain_stops: AtomicU64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> RelayStatsSnapshot {
        let load = |c: &AtomicU64| c.load(AtomicOrdering::Relaxed);
        RelayStatsSnapshot {
            accepted: load(&self.accepted),
            queued: load(&self.queued),
            no_rate: load(&self.no_rate),
            loopback: load(&self.loopback),
            rejected: load(&self.rejected),
            forwarded: load(&self.forwarded),
            forward_failed: load(&self.forward_failed),
            dropped: load(&self.dropped),
            requeued: load(&self.requeued),
            invocations: load(&self.invocations),
            chain_stops: load(&self.chain_stops),
        }
    }

    /// Prometheus text exposition of the current counters
    pub fn render_prometheus(&self) -> RelayResult<String> {
        let prom_err = |e: prometheus::Error| RelayError::Internal(format!("prometheus: {}", e));

        let registry = PrometheusRegistry::new_custom(Some("rate_relay".to_string()), None)
            .map_err(prom_err)?;
        for (name, help, value) in self.snapshot().counters() {
            let counter = IntCounter::new(format!("{}_total", name), help).map_err(prom_err)?;
            counter.inc_by(value);
            registry.register(Box::new(counter)).map_err(prom_err)?;
        }

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .map_err(prom_err)?;
        String::from_utf8(buffer).map_err(|e| RelayError::Internal(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStatsSnapshot {
    pub accepted: u64,
    pub queued: u64,
    pub no_rate: u64,
    pub loopback: u64,
    pub rejected: u64,
    pub forwarded: u64,
    pub forward_failed: u64,
    pub dropped: u64,
    pub requeued: u64,
    pub invocations: u64,
    pub chain_stops: u64,
}

impl RelayStatsSnapshot {
    /// (name, help, value) for every counter
    pub fn counters(&self) -> [(&'static str, &'static str, u64); 11] {
        [
            ("accepted", "Observations accepted by the rate buffer", self.accepted),
            ("queued", "Rate observations queued for the next tick", self.queued),
            ("no_rate", "Observations that produced no rate", self.no_rate),
            ("loopback", "Rate observations skipped on input", self.loopback),
            ("rejected", "Observations rejected by data-set validation", self.rejected),
            ("forwarded", "Rate observations forwarded downstream", self.forwarded),
            ("forward_failed", "Failed forward attempts", self.forward_failed),
            ("dropped", "Rate observations dropped after failed forwards", self.dropped),
            ("requeued", "Rate observations requeued after failed forwards", self.requeued),
            ("invocations", "Rate target invocations", self.invocations),
            ("chain_stops", "Filter chain stops issued by the rate target", self.chain_stops),
        ]
    }
}

#[cfg(test)]
mod target_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;

    fn counter_set() -> DataSet {
        DataSet::single("counter", ValueKind::Counter)
    }

    fn rate_target() -> RateTarget {
        let source: Arc<dyn RateSource> = Arc::new(HistoryCache::new());
        RateTarget::new(RateTransform::new(source, DEFAULT_RATE_NAMESPACE))
    }

    fn obs(secs: i64, value: u64) -> Observation {
        Observation::single(
            SeriesIdentity::new("host1", "cpu", "counter").with_plugin_instance("X"),
            Timestamp::from_secs(secs),
            Value::Counter(value),
        )
    }

    #[derive(Debug, Default)]
    struct CountingTarget {
        invoked: AtomicUsize,
        destroyed: Arc<AtomicUsize>,
    }

    impl ChainTarget for CountingTarget {
        fn name(&self) -> &str {
            "counting"
        }

        fn create(&self, handle: &mut TargetHandle) -> Result<(), InvokeError> {
            *handle = TargetHandle::Created(Box::default());
            Ok(())
        }

        fn invoke(
            &self,
            _data_set: &DataSet,
            _observation: &mut Observation,
            _handle: &TargetHandle,
        ) -> Result<ChainSignal, InvokeError> {
            self.invoked.fetch_add(1, AtomicOrdering::Relaxed);
            Ok(ChainSignal::Continue)
        }

        fn destroy(&self, handle: &mut TargetHandle) {
            if handle.is_created() {
                self.destroyed.fetch_add(1, AtomicOrdering::Relaxed);
            }
            *handle = TargetHandle::Destroyed;
        }
    }

    #[test]
    fn test_invoke_before_create_is_invalid() {
        let target = rate_target();
        let handle = TargetHandle::new();
        let mut observation = obs(0, 100);
        let original = observation.clone();

        let err = target.invoke(&counter_set(), &mut observation, &handle).unwrap_err();
        assert!(matches!(err, InvokeError::InvalidInput { .. }));
        assert_eq!(observation, original);
    }

    #[test]
    fn test_target_lifecycle() {
        let target = rate_target();
        let ds = counter_set();
        let mut handle = TargetHandle::new();

        target.create(&mut handle).unwrap();
        assert!(handle.is_created());
        assert!(target.create(&mut handle).is_err());

        let mut first = obs(0, 100);
        assert_eq!(target.invoke(&ds, &mut first, &handle).unwrap(), ChainSignal::Stop);

        let mut second = obs(10, 150);
        assert_eq!(target.invoke(&ds, &mut second, &handle).unwrap(), ChainSignal::Continue);
        assert_eq!(second.values.as_slice(), &[Value::Counter(5)]);
        assert_eq!(second.series.plugin, "cpu");

        let state = handle.state().unwrap();
        assert_eq!(state.invocations(), 2);
        assert_eq!(state.stops(), 1);

        target.destroy(&mut handle);
        assert!(handle.is_destroyed());
        target.destroy(&mut handle);
        assert!(handle.is_destroyed());

        let mut third = obs(20, 200);
        let untouched = third.clone();
        assert!(target.invoke(&ds, &mut third, &handle).is_err());
        assert_eq!(third, untouched);
        assert!(target.create(&mut handle).is_err());
    }

    #[test]
    fn test_data_error_stops_chain() {
        let target = rate_target();
        let mut handle = TargetHandle::new();
        target.create(&mut handle).unwrap();

        let mut wrong = Observation::single(
            SeriesIdentity::new("host1", "cpu", "counter"),
            Timestamp::from_secs(0),
            Value::Gauge(3.0),
        );
        assert_eq!(
            target.invoke(&counter_set(), &mut wrong, &handle).unwrap(),
            ChainSignal::Stop
        );
        assert_eq!(wrong.values.as_slice(), &[Value::Gauge(3.0)]);
    }

    #[test]
    fn test_chain_stops_at_first_stop() {
        let counting = Arc::new(CountingTarget::default());
        let mut chain = FilterChain::new("test");
        chain.add_target(Arc::new(rate_target())).unwrap();
        chain.add_target(counting.clone()).unwrap();
        assert_eq!(chain.len(), 2);

        let ds = counter_set();
        let mut first = obs(0, 100);
        assert_eq!(chain.process(&ds, &mut first).unwrap(), ChainSignal::Stop);
        assert_eq!(counting.invoked.load(AtomicOrdering::Relaxed), 0);

        let mut second = obs(10, 150);
        assert_eq!(chain.process(&ds, &mut second).unwrap(), ChainSignal::Continue);
        assert_eq!(counting.invoked.load(AtomicOrdering::Relaxed), 1);
    }

    #[test]
    fn test_chain_drop_destroys_handles() {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let counting = CountingTarget {
            invoked: AtomicUsize::new(0),
            destroyed: destroyed.clone(),
        };

        let mut chain = FilterChain::new("test");
        chain.add_target(Arc::new(counting)).unwrap();
        drop(chain);

        assert_eq!(destroyed.load(AtomicOrdering::Relaxed), 1);
    }

    #[test]
    fn test_render_prometheus() {
        let stats = RelayStats::new();
        stats.forwarded.fetch_add(3, AtomicOrdering::Relaxed);
        stats.queued.fetch_add(4, AtomicOrdering::Relaxed);

        let text = stats.render_prometheus().unwrap();
        assert!(text.contains("rate_relay_forwarded_total 3"));
        assert!(text.contains("rate_relay_queued_total 4"));
        assert!(text.contains("# TYPE rate_relay_dropped_total counter"));
    }
}

// ============================================================================
// SECTION 13: RELAY ENGINE
// ============================================================================
// Host scheduler: reads observations, feeds the write path, drives the read
// tick and tears everything down in order.
// ============================================================================

/// Runs one rate conversion pipeline over an observation stream.
pub struct RelayEngine {
    config: RelayConfig,
    mode: RelayMode,
    data_sets: DataSetRegistry,
    history: Arc<HistoryCache>,
    buffer: RateBuffer,
    chain: FilterChain,
    sink: Arc<dyn Dispatch>,
    stats: Arc<RelayStats>,
    /// Shutdown signal
    shutdown: Arc<Notify>,
    running: AtomicBool,
    start_time: Timestamp,
}

impl Debug for RelayEngine {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayEngine")
            .field("mode", &self.mode)
            .field("sink", &self.sink.name())
            .field("history", &self.history)
            .field("buffer", &self.buffer.name())
            .field("running", &self.is_running())
            .finish()
    }
}

impl RelayEngine {
    /// Build the pipeline for `config.relay.mode`, forwarding into `sink`.
    pub fn new(config: RelayConfig, sink: Arc<dyn Dispatch>) -> RelayResult<Self> {
        config.validate()?;

        let data_sets = DataSetRegistry::from_config(&config.data_sets)?;
        let stats = Arc::new(RelayStats::new());
        let history = Arc::new(HistoryCache::new().with_bounds(config.history.enforce_bounds));
        let source: Arc<dyn RateSource> = history.clone();
        let transform = RateTransform::new(source, config.relay.namespace.as_str());

        let buffer = RateBuffer::new(config.relay.instance_name.as_str(), transform.clone())
            .with_representation(config.relay.representation)
            .with_failure_policy(config.dispatch.failure_policy, config.dispatch.max_attempts)
            .with_stats(stats.clone());

        let mode = config.relay.mode;
        let mut chain = FilterChain::new(config.relay.instance_name.as_str());
        if mode == RelayMode::Filter {
            chain.add_target(Arc::new(RateTarget::new(transform).with_stats(stats.clone())))?;
        }

        Ok(Self {
            config,
            mode,
            data_sets,
            history,
            buffer,
            chain,
            sink,
            stats,
            shutdown: Arc::new(Notify::new()),
            running: AtomicBool::new(false),
            start_time: Timestamp::now(),
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn mode(&self) -> RelayMode {
        self.mode
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    pub fn history(&self) -> &HistoryCache {
        &self.history
    }

    pub fn buffer(&self) -> &RateBuffer {
        &self.buffer
    }

    pub fn is_running(&self) -> bool {
        self.running.load(AtomicOrdering::Relaxed)
    }

    pub fn uptime(&self) -> Duration {
        Timestamp::now().duration_since(self.start_time)
    }

    /// Signal shutdown
    pub fn shutdown(&self) {
        info!(target: "relay::engine", "Shutdown signal received");
        self.running.store(false, AtomicOrdering::Release);
        self.shutdown.notify_one();
    }

    /// Write path for one observation: resolve its data set, normalise
    /// units, then queue its rate (push) or run the chain and forward
    /// (filter).
    pub fn ingest(&self, mut observation: Observation) -> RelayResult<()> {
        if !observation.series.is_valid() {
            return Err(ConfigError::invalid_value(
                "identifier",
                format!("invalid series identity '{}'", observation.series),
            )
            .into());
        }

        let data_set = self.data_sets.resolve(&observation);
        data_set.normalize(&mut observation);

        match self.mode {
            RelayMode::Push => {
                self.buffer.accept(&data_set, &observation)?;
            }
            RelayMode::Filter => {
                if self.chain.process(&data_set, &mut observation)? == ChainSignal::Continue {
                    match self.sink.dispatch(&observation) {
                        Ok(()) => bump(&self.stats.forwarded, 1),
                        Err(err) => {
                            bump(&self.stats.forward_failed, 1);
                            bump(&self.stats.dropped, 1);
                            return Err(err.into());
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Read tick: drain the buffer and evict stale history.
    pub fn tick(&self) -> RelayResult<DrainReport> {
        let report = match self.mode {
            RelayMode::Push => self.buffer.drain(self.sink.as_ref())?,
            RelayMode::Filter => DrainReport::default(),
        };
        self.history.prune_stale(self.config.history.max_age);
        Ok(report)
    }

    fn ingest_logged(&self, observation: Observation) {
        if let Err(err) = self.ingest(observation) {
            match &err {
                // already reported by the buffer
                RelayError::Transform(e) if e.is_data_error() => {}
                RelayError::Dispatch(DispatchError::ForwardFailed { .. })
                | RelayError::Dispatch(DispatchError::Disconnected { .. }) => {
                    warn!(target: "relay::engine", error = %err, "Forward failed");
                }
                _ => {
                    warn!(
                        target: "relay::engine",
                        error = %err,
                        category = err.category(),
                        "Ingest failed"
                    );
                }
            }
        }
    }

    fn tick_logged(&self) {
        match self.tick() {
            Ok(report) if !report.is_empty() => trace!(
                target: "relay::engine",
                forwarded = report.forwarded,
                failed = report.failed,
                "Read tick"
            ),
            Ok(_) => {}
            Err(err) => error!(
                target: "relay::engine",
                error = %err,
                hint = ?err.recovery_hint(),
                "Read tick failed"
            ),
        }
    }

    /// Run until the input ends, shutdown is signalled, or Ctrl-C.
    /// Returns the final counters.
    pub async fn run<R>(self: Arc<Self>, input: R) -> RelayResult<RelayStatsSnapshot>
    where
        R: BufRead + Send + 'static,
    {
        info!(
            target: "relay::engine",
            version = RELAY_VERSION,
            mode = %self.mode,
            namespace = %self.config.relay.namespace,
            interval_ms = self.config.relay.read_interval.as_millis() as u64,
            "Starting rate relay"
        );

        self.running.store(true, AtomicOrdering::Release);
        if self.mode == RelayMode::Push {
            self.buffer.register();
        }

        // A plain thread: a reader blocked on stdin must not hold up runtime
        // shutdown.
        let (tx, rx) = flume::bounded::<Observation>(INGEST_CHANNEL_CAPACITY);
        let reader = thread::Builder::new()
            .name("relay-input".to_string())
            .spawn(move || read_observations(input, tx))?;

        let mut ticker = interval(self.config.relay.read_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let ctrl_c = signal::ctrl_c();
        tokio::pin!(ctrl_c);

        let mut in_flight: Option<TokioJoinHandle<()>> = None;

        while self.running.load(AtomicOrdering::Acquire) {
            tokio::select! {
                received = rx.recv_async() => match received {
                    Ok(observation) => self.ingest_logged(observation),
                    Err(_) => {
                        info!(target: "relay::engine", "Input closed");
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if in_flight.as_ref().map_or(false, |handle| !handle.is_finished()) {
                        warn!(target: "relay::engine", "Previous drain still running, skipping tick");
                        continue;
                    }
                    let engine = Arc::clone(&self);
                    in_flight = Some(task::spawn_blocking(move || engine.tick_logged()));
                }
                _ = self.shutdown.notified() => {
                    info!(target: "relay::engine", "Shutdown notification received");
                    break;
                }
                _ = &mut ctrl_c => {
                    info!(target: "relay::engine", "Received interrupt");
                    break;
                }
            }
        }

        // Graceful shutdown
        info!(target: "relay::engine", "Starting graceful shutdown");
        let shutdown_start = Instant::now();
        self.running.store(false, AtomicOrdering::Release);

        if let Some(handle) = in_flight.take() {
            if let Err(err) = handle.await {
                error!(target: "relay::engine", error = %err, "Drain task failed");
            }
        }

        drop(rx);
        if reader.is_finished() {
            match reader.join() {
                Ok(lines) => debug!(target: "relay::engine", lines, "Input reader finished"),
                Err(_) => error!(target: "relay::engine", "Input reader panicked"),
            }
        }

        if self.mode == RelayMode::Push {
            let sink = Arc::clone(&self.sink);
            self.buffer.shutdown(sink.as_ref())?;
        }
        self.history.prune_stale(self.config.history.max_age);

        let snapshot = self.stats.snapshot();
        info!(
            target: "relay::engine",
            duration_ms = shutdown_start.elapsed().as_millis() as u64,
            uptime_secs = self.uptime().as_secs(),
            forwarded = snapshot.forwarded,
            dropped = snapshot.dropped,
            "Relay shutdown complete"
        );
        Ok(snapshot)
    }
}

/// Read JSON-lines observations until EOF or until the receiver is gone.
/// Malformed lines are logged and skipped. Returns the number parsed.
fn read_observations<R: BufRead>(input: R, tx: FlumeSender<Observation>) -> usize {
    let mut parsed = 0;
    for (index, line) in input.lines().enumerate() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                error!(target: "relay::engine", error = %err, "Failed to read input");
                break;
            }
        };

        match Observation::parse_line(&line) {
            Ok(Some(observation)) => {
                if tx.send(observation).is_err() {
                    break;
                }
                parsed += 1;
            }
            Ok(None) => {}
            Err(err) => warn!(
                target: "relay::engine",
                line = index + 1,
                error = %err,
                "Skipping malformed observation"
            ),
        }
    }
    parsed
}

/// Sink for the configured kind
pub fn build_sink(kind: SinkKind) -> Arc<dyn Dispatch> {
    match kind {
        SinkKind::Stdout => Arc::new(JsonLinesDispatch::stdout()),
        SinkKind::Log => Arc::new(LogDispatch::new("log")),
    }
}

// ============================================================================
// SECTION 14: CLI & ENTRY POINT
// ============================================================================

// ----------------------------------------------------------------------------
// 14.1 CLI Definition
// ----------------------------------------------------------------------------

/// Per-second rates for sampled metric streams
#[derive(Parser, Debug)]
#[command(
    name = "rate-relay",
    author = "AIOps Team",
    version,
    about = "Per-second rate conversion for sampled metric streams",
    long_about = "Reads JSON-lines metric observations, converts counters, derives, \
                  gauges and absolutes into per-second rates against the previous \
                  sample of each series, and writes the rates back out under their \
                  own namespace."
)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "rate-relay.toml", env = "RATE_RELAY_CONFIG")]
    pub config: PathBuf,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(short, long, env = "RATE_RELAY_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long, env = "RATE_RELAY_DEBUG")]
    pub debug: bool,

    /// Option override, e.g. --set Namespace=rate (repeatable)
    #[arg(long = "set", value_name = "KEY=VALUE")]
    pub options: Vec<String>,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the relay
    Run {
        /// Input file of JSON-lines observations, `-` for stdin
        #[arg(short, long, default_value = "-")]
        input: String,

        /// Override the configured mode
        #[arg(short, long, value_enum)]
        mode: Option<RelayMode>,

        /// Write final counters in Prometheus text format to this file
        #[arg(long)]
        metrics_file: Option<PathBuf>,
    },

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version and build info
    Version,
}

// ----------------------------------------------------------------------------
// 14.2 CLI Handler Functions
// ----------------------------------------------------------------------------

/// Handle the validate subcommand
fn handle_validate(config_path: &Path, verbose: bool) -> RelayResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    match RelayConfig::load(config_path) {
        Ok(config) => {
            println!("✅ Configuration is valid!");

            if verbose {
                println!("\n📋 Parsed configuration:");
                println!("{}", "=".repeat(60));
                match toml::to_string_pretty(&config) {
                    Ok(s) => println!("{}", s),
                    Err(e) => println!("Failed to serialize: {}", e),
                }
            }

            println!("\n📊 Configuration Summary:");
            println!("  • Instance name: {}", config.relay.instance_name);
            println!("  • Mode: {}", config.relay.mode);
            println!("  • Namespace: {}", config.relay.namespace);
            println!("  • Read interval: {}ms", config.relay.read_interval.as_millis());
            println!("  • History max age: {}s", config.history.max_age.as_secs());
            println!("  • Failure policy: {:?}", config.dispatch.failure_policy);
            println!("  • Data sets configured: {}", config.data_sets.len());

            Ok(())
        }
        Err(e) => {
            println!("❌ Configuration validation failed!");
            println!("Error: {}", e);
            Err(RelayError::Config(e))
        }
    }
}

/// Handle the generate-config subcommand
fn handle_generate_config(output: Option<&Path>) -> RelayResult<()> {
    let config_str = RelayConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("✅ Default configuration written to: {}", path.display());
        }
        None => {
            println!("{}", config_str);
        }
    }

    Ok(())
}

/// Handle the version subcommand
fn handle_version() {
    println!("📈 {} v{}", RELAY_FULL_NAME, RELAY_VERSION);
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!("  • Family: {}", std::env::consts::FAMILY);
    println!();
    println!("Features:");
    println!("  • Push (buffered) and filter (inline) rate conversion");
    println!("  • Counter reset and wraparound detection");
    println!("  • JSON-lines input and output");
    println!("  • Prometheus counter export");
    println!();
    println!("License: MIT");
}

/// Configuration from file (or defaults) with `--set` overrides applied
fn load_config(cli: &Cli) -> AnyhowResult<RelayConfig> {
    let mut config = if cli.config.exists() {
        RelayConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    } else {
        RelayConfig::default()
    };
    config
        .apply_options(&cli.options)
        .context("Invalid --set option")?;
    Ok(config)
}

fn open_input(input: &str) -> AnyhowResult<Box<dyn BufRead + Send>> {
    if input == "-" {
        return Ok(Box::new(BufReader::new(io::stdin())));
    }
    let file = File::open(input).with_context(|| format!("Failed to open input {}", input))?;
    Ok(Box::new(BufReader::new(file)))
}

// ============================================================================
// SECTION 15: MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Handle subcommands that don't need full initialization
    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        _ => {}
    }

    let mut config = load_config(&cli)?;

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }
    init_logging(&logging_config)?;

    if !cli.config.exists() {
        warn!("Config file not found at {}, using defaults", cli.config.display());
    }

    let (input, metrics_file) = match cli.command {
        Some(Commands::Run {
            input,
            mode,
            metrics_file,
        }) => {
            if let Some(mode) = mode {
                config.relay.mode = mode;
            }
            (input, metrics_file)
        }
        _ => ("-".to_string(), None),
    };

    info!("📈 {} v{}", RELAY_FULL_NAME, RELAY_VERSION);

    let sink = build_sink(config.dispatch.sink);
    let engine = Arc::new(RelayEngine::new(config, sink)?);
    let reader = open_input(&input)?;

    let snapshot = Arc::clone(&engine).run(reader).await?;

    if let Some(path) = metrics_file {
        let text = engine.stats().render_prometheus()?;
        fs::write(&path, text)
            .with_context(|| format!("Failed to write metrics to {}", path.display()))?;
        info!(path = %path.display(), "Metrics written");
    }

    info!(
        accepted = snapshot.accepted,
        queued = snapshot.queued,
        forwarded = snapshot.forwarded,
        dropped = snapshot.dropped,
        "Done"
    );
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================


#[cfg(test)]
mod engine_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    fn line(host: &str, secs: i64, value: u64) -> String {
        format!(
            r#"{{"host":"{}","plugin":"cpu","plugin_instance":"0","type":"counter","time":{},"values":[{{"kind":"counter","value":{}}}]}}"#,
            host,
            secs * 1_000_000_000,
            value
        )
    }

    fn input(lines: &[String]) -> Cursor<Vec<u8>> {
        Cursor::new(lines.join("\n").into_bytes())
    }

    fn sample_lines() -> Vec<String> {
        vec![
            line("a", 0, 100),
            "# comment".to_string(),
            line("a", 10, 150),
            "not json".to_string(),
            line("a", 20, 250),
        ]
    }

    #[tokio::test]
    async fn test_push_engine_forwards_on_shutdown() {
        let (sink, rx) = ChannelDispatch::unbounded("test");
        let engine = Arc::new(RelayEngine::new(RelayConfig::default(), Arc::new(sink)).unwrap());

        let snapshot = Arc::clone(&engine).run(input(&sample_lines())).await.unwrap();
        assert_eq!(snapshot.accepted, 3);
        assert_eq!(snapshot.no_rate, 1);
        assert_eq!(snapshot.queued, 2);
        assert_eq!(snapshot.forwarded, 2);

        let rates: Vec<Observation> = rx.drain().collect();
        assert_eq!(rates.len(), 2);
        assert!(rates.iter().all(|r| r.series.plugin == DEFAULT_RATE_NAMESPACE));

        let mut values: Vec<f64> = rates.iter().map(|r| r.values[0].as_f64()).collect();
        values.sort_by(|a, b| a.total_cmp(b));
        assert_eq!(values, vec![5.0, 10.0]);
        assert!(!engine.buffer().is_registered());
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_filter_engine_rewrites_inline() {
        let mut config = RelayConfig::default();
        config.relay.mode = RelayMode::Filter;
        let (sink, rx) = ChannelDispatch::unbounded("test");
        let engine = Arc::new(RelayEngine::new(config, Arc::new(sink)).unwrap());

        let snapshot = Arc::clone(&engine).run(input(&sample_lines())).await.unwrap();
        assert_eq!(snapshot.invocations, 3);
        assert_eq!(snapshot.chain_stops, 1);
        assert_eq!(snapshot.forwarded, 2);

        let rates: Vec<Observation> = rx.drain().collect();
        assert_eq!(rates.len(), 2);
        assert_eq!(rates[0].series.plugin, "cpu");
        assert_eq!(rates[0].values.as_slice(), &[Value::Counter(5)]);
        assert_eq!(rates[1].values.as_slice(), &[Value::Counter(10)]);
    }

    #[test]
    fn test_engine_rejects_invalid_config() {
        let mut config = RelayConfig::default();
        config.relay.namespace = String::new();
        let result = RelayEngine::new(config, Arc::new(LogDispatch::new("log")));
        assert!(matches!(result, Err(RelayError::Config(_))));
    }

    #[test]
    fn test_ingest_requires_registration() {
        let (sink, _rx) = ChannelDispatch::unbounded("test");
        let engine = RelayEngine::new(RelayConfig::default(), Arc::new(sink)).unwrap();

        let observation = Observation::parse_line(&line("a", 0, 1)).unwrap().unwrap();
        let err = engine.ingest(observation).unwrap_err();
        assert!(matches!(
            err,
            RelayError::Dispatch(DispatchError::NeverRegistered { .. })
        ));
    }

    #[test]
    fn test_tick_drains_and_prunes() {
        let mut config = RelayConfig::default();
        config.history.max_age = Duration::ZERO;
        let (sink, rx) = ChannelDispatch::unbounded("test");
        let engine = RelayEngine::new(config, Arc::new(sink)).unwrap();
        engine.buffer().register();

        for (secs, value) in [(0, 100), (10, 150)] {
            let observation = Observation::parse_line(&line("a", secs, value)).unwrap().unwrap();
            engine.ingest(observation).unwrap();
        }
        assert_eq!(engine.history().len(), 1);

        let report = engine.tick().unwrap();
        assert_eq!(report.forwarded, 1);
        assert_eq!(rx.len(), 1);
        assert!(engine.history().is_empty());
    }

    #[test]
    fn test_falling_memory_gauge_is_forwarded() {
        let (sink, rx) = ChannelDispatch::unbounded("test");
        let engine = RelayEngine::new(RelayConfig::default(), Arc::new(sink)).unwrap();
        engine.buffer().register();

        for (secs, bytes) in [(0, 2000.0), (10, 1000.0)] {
            let observation = Observation::single(
                SeriesIdentity::new("h", "mic", "memory"),
                Timestamp::from_secs(secs),
                Value::Gauge(bytes),
            );
            engine.ingest(observation).unwrap();
        }

        let report = engine.tick().unwrap();
        assert_eq!(report.forwarded, 1);
        let rate = rx.try_recv().unwrap();
        assert_eq!(rate.series.plugin, DEFAULT_RATE_NAMESPACE);
        assert_eq!(rate.values.as_slice(), &[Value::Gauge(-100.0)]);
    }

    #[test]
    fn test_ingest_normalises_kib_gauges() {
        let mut config = RelayConfig::default();
        config.relay.mode = RelayMode::Filter;
        config.data_sets.push(DataSet::new(
            "memory",
            [DataSource::new("value", ValueKind::Gauge).with_unit(SourceUnit::Kib)],
        ));
        let (sink, rx) = ChannelDispatch::unbounded("test");
        let engine = RelayEngine::new(config, Arc::new(sink)).unwrap();

        for (secs, kib) in [(0, 1.0), (2, 5.0)] {
            let observation = Observation::single(
                SeriesIdentity::new("h", "gpu", "memory"),
                Timestamp::from_secs(secs),
                Value::Gauge(kib),
            );
            engine.ingest(observation).unwrap();
        }

        let rate = rx.try_recv().unwrap();
        assert_eq!(rate.values.as_slice(), &[Value::Gauge(2048.0)]);
    }
}
