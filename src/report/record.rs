//! Persisted result record, one file per variant run.

use std::borrow::Cow;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use xml::common::XmlVersion;
use xml::writer::{EmitterConfig, EventWriter, XmlEvent};

use super::ReportContext;
use crate::aggregate::{AggregateOutcome, AggregateResult, NodeRecord, PerformanceStat};
use crate::kernel::{Kernel, PerKernel};

/// On-disk encoding of a [`RunRecord`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordFormat {
    /// Layout read by the plotting scripts.
    #[default]
    Xml,
    Json,
}

impl RecordFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Xml => "xml",
            Self::Json => "json",
        }
    }
}

impl FromStr for RecordFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "xml" => Ok(Self::Xml),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown record format '{other}' (expected xml or json)")),
        }
    }
}

/// Everything persisted about one variant run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRecord {
    pub label: String,
    pub variant: String,
    pub persist: Option<String>,
    pub precision: String,
    pub timestamp: String,
    pub processes_per_node: usize,
    pub threads_per_process: usize,
    pub number_of_nodes: usize,
    /// Bytes one process moves per kernel execution.
    pub sizes: PerKernel<u64>,
    pub process: AggregateResult,
    pub cluster: AggregateResult,
    pub nodes: Vec<NodeRecord>,
    #[serde(skip)]
    created: DateTime<Utc>,
}

impl RunRecord {
    pub fn new(ctx: &ReportContext, outcome: &AggregateOutcome, created: DateTime<Utc>) -> Self {
        Self {
            label: ctx.label.clone(),
            variant: ctx.variant.to_string(),
            persist: ctx.persist.map(|p| p.to_string()),
            precision: ctx.precision.to_string(),
            timestamp: created.to_rfc3339(),
            processes_per_node: outcome.processes_per_node,
            threads_per_process: ctx.threads_per_process,
            number_of_nodes: outcome.node_count,
            sizes: PerKernel::from_fn(|k| ctx.bytes_moved(k)),
            process: outcome.process.clone(),
            cluster: outcome.node.clone(),
            nodes: outcome
                .table
                .as_ref()
                .map(|t| t.nodes.clone())
                .unwrap_or_default(),
            created,
        }
    }

    /// `<label>_<variant>_<UTC timestamp>.<ext>`
    pub fn file_name(&self, format: RecordFormat) -> String {
        format!(
            "{}_{}_{}.{}",
            self.label,
            self.variant,
            self.created.format("%Y%m%dT%H%M%SZ"),
            format.extension()
        )
    }

    /// Encodes the record in the layout read by the plotting scripts.
    pub fn to_xml(&self) -> Result<String> {
        let mut output = Vec::with_capacity(512 + self.nodes.len() * 512);
        let mut writer = EmitterConfig::new()
            .perform_indent(true)
            .create_writer(&mut output);

        writer.write(XmlEvent::StartDocument {
            version: XmlVersion::Version10,
            encoding: Some("UTF-8"),
            standalone: None,
        })?;
        writer.write(XmlEvent::start_element("results"))?;

        writer.write(XmlEvent::start_element("configuration"))?;
        text_element(&mut writer, "label", &self.label)?;
        text_element(&mut writer, "variant", &self.variant)?;
        if let Some(persist) = &self.persist {
            text_element(&mut writer, "persist", persist)?;
        }
        text_element(&mut writer, "precision", &self.precision)?;
        text_element(&mut writer, "timestamp", &self.timestamp)?;
        text_element(&mut writer, "processes_per_node", self.processes_per_node)?;
        text_element(&mut writer, "threads_per_process", self.threads_per_process)?;
        text_element(&mut writer, "number_of_nodes", self.number_of_nodes)?;
        for (kernel, size) in self.sizes.iter() {
            text_element(&mut writer, &format!("{}_size", kernel.as_str()), size)?;
        }
        writer.write(XmlEvent::end_element())?;

        for node in &self.nodes {
            writer.write(XmlEvent::start_element("node"))?;
            text_element(&mut writer, "name", &node.host)?;
            for kernel in Kernel::ALL {
                stat_element(&mut writer, kernel, node.stats.get(kernel))?;
            }
            writer.write(XmlEvent::end_element())?;
        }

        writer.write(XmlEvent::end_element())?;
        String::from_utf8(output).context("record XML is not UTF-8")
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("serializing run record")
    }

    /// Writes the record into `directory`, creating it if needed.
    pub fn write(&self, directory: &Path, format: RecordFormat) -> Result<PathBuf> {
        fs::create_dir_all(directory)
            .with_context(|| format!("creating record directory {}", directory.display()))?;

        let body = match format {
            RecordFormat::Xml => self.to_xml().context("encoding run record as XML")?,
            RecordFormat::Json => self.to_json()?,
        };

        let path = directory.join(self.file_name(format));
        fs::write(&path, body).with_context(|| format!("writing record {}", path.display()))?;

        info!(path = %path.display(), nodes = self.nodes.len(), "run record written");
        Ok(path)
    }
}

fn text_element<W: Write>(
    writer: &mut EventWriter<W>,
    tag: &str,
    value: impl std::fmt::Display,
) -> xml::writer::Result<()> {
    let text = value.to_string();
    writer.write(XmlEvent::start_element(tag))?;
    writer.write(XmlEvent::characters(&xml_text(&text)))?;
    writer.write(XmlEvent::end_element())
}

fn stat_element<W: Write>(
    writer: &mut EventWriter<W>,
    kernel: Kernel,
    stat: &PerformanceStat,
) -> xml::writer::Result<()> {
    writer.write(XmlEvent::start_element(kernel.label()))?;
    text_element(writer, "Average", stat.avg)?;
    text_element(writer, "Minimum", stat.min)?;
    text_element(writer, "Maximum", stat.max)?;
    writer.write(XmlEvent::end_element())
}

/// Replaces characters XML 1.0 cannot carry, even as references, with
/// U+FFFD. The writer escapes markup characters itself.
fn xml_text(text: &str) -> Cow<'_, str> {
    if text.chars().all(is_xml_char) {
        return Cow::Borrowed(text);
    }
    Cow::Owned(
        text.chars()
            .map(|c| if is_xml_char(c) { c } else { char::REPLACEMENT_CHARACTER })
            .collect(),
    )
}

fn is_xml_char(c: char) -> bool {
    matches!(c, '\t' | '\n' | '\r' | '\u{20}'..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}' | '\u{10000}'..='\u{10FFFF}')
}
