use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use serde::{Serialize, Serializer};

/// One of the five answer options printed on the sheet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Answer {
    A,
    B,
    C,
    D,
    E,
}

impl Answer {
    pub const ALL: [Answer; 5] = [Answer::A, Answer::B, Answer::C, Answer::D, Answer::E];

    /// Position of the option within a row, A = 0
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn letter(self) -> char {
        (b'A' + self as u8) as char
    }
}

impl fmt::Display for Answer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

impl FromStr for Answer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(Answer::A),
            "B" => Ok(Answer::B),
            "C" => Ok(Answer::C),
            "D" => Ok(Answer::D),
            "E" => Ok(Answer::E),
            other => Err(format!("Invalid answer letter '{}', expected A-E", other)),
        }
    }
}

impl Serialize for Answer {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// What a classifier output index stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    Marked(Answer),
    NoneMarked,
}

const NONE_MARKED_TOKENS: [&str; 3] = ["NONE", "EMPTY", "NENHUMA"];
const MAX_LABELS: usize = 256;

impl FromStr for Label {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.trim().to_ascii_uppercase();
        if NONE_MARKED_TOKENS.contains(&token.as_str()) {
            return Ok(Label::NoneMarked);
        }
        token.parse().map(Label::Marked)
    }
}

/// Mapping from classifier output index to label
///
/// Indices without an entry decode to `None`, which the coordinator reports
/// as an unknown result.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelMap {
    labels: Vec<Option<Label>>,
}

impl Default for LabelMap {
    fn default() -> Self {
        let mut labels: Vec<Option<Label>> =
            Answer::ALL.iter().map(|a| Some(Label::Marked(*a))).collect();
        labels.push(Some(Label::NoneMarked));
        Self { labels }
    }
}

impl LabelMap {
    pub fn get(&self, index: usize) -> Option<Label> {
        self.labels.get(index).copied().flatten()
    }

    pub fn len(&self) -> usize {
        self.labels.iter().filter(|l| l.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Parse a JSON object such as `{"0": "A", ..., "5": "NONE"}`
    pub fn from_json(text: &str) -> Result<Self> {
        let raw: BTreeMap<String, String> =
            serde_json::from_str(text).context("Label map must be a JSON object of strings")?;

        if raw.is_empty() {
            bail!("Label map is empty");
        }

        let mut labels: Vec<Option<Label>> = Vec::new();
        for (key, value) in &raw {
            let index: usize = key
                .trim()
                .parse()
                .with_context(|| format!("Invalid label index '{}'", key))?;
            if index >= MAX_LABELS {
                bail!("Label index {} out of range (max {})", index, MAX_LABELS - 1);
            }
            let label: Label = value
                .parse()
                .map_err(|e: String| anyhow::anyhow!("Label {}: {}", index, e))?;

            if labels.len() <= index {
                labels.resize(index + 1, None);
            }
            labels[index] = Some(label);
        }

        Ok(Self { labels })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read label map: {:?}", path))?;
        Self::from_json(&text).with_context(|| format!("Failed to parse label map: {:?}", path))
    }
}
