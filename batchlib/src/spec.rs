//! Job descriptors: what to run, with which inputs, on how much hardware.
//!
//! A [`JobSpec`] is validated once when it is built and is immutable from then
//! on. A plain job is an array job of size one.

use crate::errors::{Error, Result};
use crate::types::{ArrayIndex, Envs, Payload};
use serde::Serialize;
use std::fmt;

/// Environment variables with this prefix are injected by backends.
pub const RESERVED_ENV_PREFIX: &str = "BATCH_JOB_";
pub const ARRAY_INDEX_ENV: &str = "BATCH_JOB_ARRAY_INDEX";
pub const MAX_JOB_NAME_LEN: usize = 128;
pub const MAX_RETRIES: u32 = 10;

/// Reference to the callable a backend should run for each item.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EntryPoint(String);

impl EntryPoint {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EntryPoint {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for EntryPoint {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hardware requested for every item of a job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceRequest {
    pub memory_mib: u32,
    pub vcpus: u32,
    /// Total attempts per item, the first one included.
    pub retries: u32,
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self {
            memory_mib: 32000,
            vcpus: 1,
            retries: 1,
        }
    }
}

impl ResourceRequest {
    pub fn new(memory_mib: u32, vcpus: u32, retries: u32) -> Self {
        Self {
            memory_mib,
            vcpus,
            retries,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.memory_mib == 0 {
            return Err(Error::InvalidSpec("memory must be positive".into()));
        }
        if self.vcpus == 0 {
            return Err(Error::InvalidSpec("vcpus must be positive".into()));
        }
        if !(1..=MAX_RETRIES).contains(&self.retries) {
            return Err(Error::InvalidSpec(format!(
                "retries must be between 1 and {}, got {}",
                MAX_RETRIES, self.retries
            )));
        }
        Ok(())
    }
}

/// Immutable description of an array job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobSpec {
    name: String,
    entry_point: EntryPoint,
    arguments: Vec<Payload>,
    resources: ResourceRequest,
    envs: Envs,
}

/// The slice of a [`JobSpec`] that one array item runs with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ItemSpec<'a> {
    pub index: ArrayIndex,
    pub entry_point: &'a EntryPoint,
    pub argument: &'a Payload,
    pub envs: &'a Envs,
}

impl JobSpec {
    pub fn builder(entry_point: impl Into<EntryPoint>) -> JobSpecBuilder {
        JobSpecBuilder::new(entry_point.into())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry_point(&self) -> &EntryPoint {
        &self.entry_point
    }

    pub fn arguments(&self) -> &[Payload] {
        &self.arguments
    }

    pub fn resources(&self) -> &ResourceRequest {
        &self.resources
    }

    pub fn envs(&self) -> &Envs {
        &self.envs
    }

    pub fn array_size(&self) -> usize {
        self.arguments.len()
    }

    pub fn item(&self, index: ArrayIndex) -> Option<ItemSpec<'_>> {
        self.arguments.get(index).map(|argument| ItemSpec {
            index,
            entry_point: &self.entry_point,
            argument,
            envs: &self.envs,
        })
    }
}

pub struct JobSpecBuilder {
    name: Option<String>,
    entry_point: EntryPoint,
    arguments: Vec<Payload>,
    resources: ResourceRequest,
    envs: Envs,
    encode_error: Option<serde_json::Error>,
}

impl JobSpecBuilder {
    fn new(entry_point: EntryPoint) -> Self {
        Self {
            name: None,
            entry_point,
            arguments: Vec::new(),
            resources: ResourceRequest::default(),
            envs: Envs::new(),
            encode_error: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Append one array item with the given argument.
    pub fn argument<A: Serialize>(mut self, argument: &A) -> Self {
        match serde_json::to_vec(argument) {
            Ok(bytes) => self.arguments.push(Payload::from(bytes)),
            Err(err) => {
                self.encode_error.get_or_insert(err);
            }
        }
        self
    }

    /// Append one array item per input, in order.
    pub fn arguments<A, I>(self, inputs: I) -> Self
    where
        A: Serialize,
        I: IntoIterator<Item = A>,
    {
        inputs
            .into_iter()
            .fold(self, |builder, input| builder.argument(&input))
    }

    /// Append already-encoded arguments.
    pub fn payloads(mut self, payloads: impl IntoIterator<Item = Payload>) -> Self {
        self.arguments.extend(payloads);
        self
    }

    pub fn resources(mut self, resources: ResourceRequest) -> Self {
        self.resources = resources;
        self
    }

    pub fn memory_mib(mut self, memory_mib: u32) -> Self {
        self.resources.memory_mib = memory_mib;
        self
    }

    pub fn vcpus(mut self, vcpus: u32) -> Self {
        self.resources.vcpus = vcpus;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.resources.retries = retries;
        self
    }

    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((name.into(), value.into()));
        self
    }

    pub fn envs(mut self, envs: impl IntoIterator<Item = (String, String)>) -> Self {
        self.envs.extend(envs);
        self
    }

    pub fn build(self) -> Result<JobSpec> {
        if let Some(err) = self.encode_error {
            return Err(Error::Encode(err));
        }
        if self.entry_point.as_str().trim().is_empty() {
            return Err(Error::InvalidSpec("entry point must not be empty".into()));
        }
        if self.arguments.is_empty() {
            return Err(Error::InvalidSpec("a job needs at least one argument".into()));
        }
        self.resources.validate()?;
        validate_envs(&self.envs)?;
        let name = match self.name {
            Some(name) => name,
            None => default_name(&self.entry_point),
        };
        validate_name(&name)?;
        Ok(JobSpec {
            name,
            entry_point: self.entry_point,
            arguments: self.arguments,
            resources: self.resources,
            envs: self.envs,
        })
    }
}

/// Build a single-item job spec.
pub fn build<A: Serialize>(
    callable: impl Into<EntryPoint>,
    argument: &A,
    resources: ResourceRequest,
    envs: Envs,
) -> Result<JobSpec> {
    JobSpec::builder(callable)
        .argument(argument)
        .resources(resources)
        .envs(envs)
        .build()
}

fn default_name(entry_point: &EntryPoint) -> String {
    let name: String = entry_point
        .as_str()
        .chars()
        .map(|c| if valid_name_char(c) { c } else { '-' })
        .take(MAX_JOB_NAME_LEN)
        .collect();
    let name = name.trim_matches('-').to_string();
    if name.is_empty() {
        "batch-job".to_string()
    } else {
        name
    }
}

/// Name of the `chunk`-th array job of a map that had to be split.
pub(crate) fn chunk_name(entry_point: &EntryPoint, chunk: usize) -> String {
    let suffix = format!("-{}", chunk);
    let mut base = default_name(entry_point);
    base.truncate(MAX_JOB_NAME_LEN - suffix.len());
    base + &suffix
}

fn valid_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_JOB_NAME_LEN {
        return Err(Error::InvalidSpec(format!(
            "job name must be 1 to {} characters",
            MAX_JOB_NAME_LEN
        )));
    }
    if !name.chars().all(valid_name_char) {
        return Err(Error::InvalidSpec(format!(
            "job name {:?} may only contain letters, digits, hyphens and underscores",
            name
        )));
    }
    Ok(())
}

fn validate_envs(envs: &Envs) -> Result<()> {
    for (position, (name, value)) in envs.iter().enumerate() {
        let mut chars = name.chars();
        let well_formed = match chars.next() {
            Some(first) => {
                (first.is_ascii_alphabetic() || first == '_')
                    && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            }
            None => false,
        };
        if !well_formed {
            return Err(Error::InvalidSpec(format!(
                "malformed environment variable name {:?}",
                name
            )));
        }
        if name.starts_with(RESERVED_ENV_PREFIX) {
            return Err(Error::InvalidSpec(format!(
                "environment variable {} uses the reserved prefix {}",
                name, RESERVED_ENV_PREFIX
            )));
        }
        if value.contains('\0') {
            return Err(Error::InvalidSpec(format!(
                "environment variable {} has a NUL byte in its value",
                name
            )));
        }
        if envs[..position].iter().any(|(earlier, _)| earlier == name) {
            return Err(Error::InvalidSpec(format!(
                "environment variable {} is set twice",
                name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn build_single_item() {
        let spec = build(
            "tasks::square",
            &3.0_f64,
            ResourceRequest::new(128, 1, 3),
            vec![("MODE".into(), "fast".into())],
        )
        .expect("valid spec");
        assert_eq!(spec.name(), "tasks--square");
        assert_eq!(spec.array_size(), 1);
        assert_eq!(spec.arguments()[0], Payload::from_static(b"3.0"));
        assert_eq!(spec.resources().retries, 3);
        let item = spec.item(0).expect("item 0");
        assert_eq!(item.entry_point.as_str(), "tasks::square");
        assert!(spec.item(1).is_none());
    }

    #[test]
    fn builder_keeps_input_and_env_order() {
        let spec = JobSpec::builder("sum")
            .name("sums")
            .arguments(vec![vec![1, 2], vec![3], vec![]])
            .env("B", "2")
            .env("A", "1")
            .build()
            .expect("valid spec");
        assert_eq!(spec.array_size(), 3);
        assert_eq!(spec.arguments()[1], Payload::from_static(b"[3]"));
        assert_eq!(
            spec.envs(),
            &vec![("B".to_string(), "2".to_string()), ("A".to_string(), "1".to_string())]
        );
    }

    #[test]
    fn defaults_follow_resource_defaults() {
        let spec = JobSpec::builder("f").argument(&()).build().unwrap();
        assert_eq!(spec.resources(), &ResourceRequest::default());
        assert_eq!(spec.resources().memory_mib, 32000);
    }

    #[rstest]
    #[case::zero_memory(ResourceRequest::new(0, 1, 1))]
    #[case::zero_vcpus(ResourceRequest::new(128, 0, 1))]
    #[case::zero_retries(ResourceRequest::new(128, 1, 0))]
    #[case::too_many_retries(ResourceRequest::new(128, 1, 11))]
    fn rejects_bad_resources(#[case] resources: ResourceRequest) {
        let err = build("f", &1, resources, vec![]).unwrap_err();
        assert!(matches!(err, Error::InvalidSpec(_)), "{:?}", err);
    }

    #[rstest]
    #[case::empty_name("", "x")]
    #[case::leading_digit("1ABC", "x")]
    #[case::has_equals("A=B", "x")]
    #[case::has_space("MY VAR", "x")]
    #[case::reserved("BATCH_JOB_ARRAY_INDEX", "3")]
    #[case::nul_value("OK", "a\0b")]
    fn rejects_malformed_envs(#[case] name: &str, #[case] value: &str) {
        let err = build(
            "f",
            &1,
            ResourceRequest::default(),
            vec![(name.into(), value.into())],
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidSpec(_)), "{:?}", err);
    }

    #[test]
    fn rejects_duplicate_envs() {
        let err = JobSpec::builder("f")
            .argument(&1)
            .env("A", "1")
            .env("A", "2")
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSpec(msg) if msg.contains("twice")));
    }

    #[rstest]
    #[case::empty_entry("", "ok")]
    #[case::bad_name("f", "no spaces")]
    #[case::long_name("f", &"x".repeat(129))]
    fn rejects_bad_names(#[case] entry: &str, #[case] name: &str) {
        let err = JobSpec::builder(entry)
            .name(name)
            .argument(&1)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSpec(_)));
    }

    #[test]
    fn rejects_jobs_without_items() {
        let err = JobSpec::builder("f").build().unwrap_err();
        assert!(matches!(err, Error::InvalidSpec(_)));
    }

    #[test]
    fn unencodable_argument_is_reported() {
        use std::collections::HashMap;
        // JSON object keys must be strings
        let mut bad = HashMap::new();
        bad.insert(vec![1u8], 1);
        let err = JobSpec::builder("f").argument(&bad).build().unwrap_err();
        assert!(matches!(err, Error::Encode(_)));
    }

    #[test]
    fn chunk_names_stay_valid() {
        let long = EntryPoint::new("x".repeat(200));
        let name = chunk_name(&long, 12);
        assert_eq!(name.len(), MAX_JOB_NAME_LEN);
        assert!(name.ends_with("-12"));
        assert!(validate_name(&name).is_ok());
        assert_eq!(chunk_name(&EntryPoint::new("pkg.fn"), 0), "pkg-fn-0");
    }
}
