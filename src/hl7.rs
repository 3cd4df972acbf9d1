//! A minimal HL7 v2.x data model.
//!
//! The server only needs enough of HL7 to address an acknowledgment:
//! header fields read/written by path (`"MSH.9.2"` style), segment
//! append-and-set for building the MSA segment, and the batch/file
//! container predicates and decomposition used to split one MLLP frame
//! into its logical messages. Full semantic validation of message
//! content is explicitly out of scope.

use std::fmt;
use std::str::FromStr;

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

use crate::error::{Error, Result};

/// The HL7 v2.x protocol versions this server can address an ACK for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum Version {
    V2_1,
    V2_2,
    V2_3,
    V2_3_1,
    V2_4,
    V2_5,
    V2_5_1,
    V2_6,
    V2_7,
    V2_7_1,
    V2_8,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::V2_1 => "2.1",
            Version::V2_2 => "2.2",
            Version::V2_3 => "2.3",
            Version::V2_3_1 => "2.3.1",
            Version::V2_4 => "2.4",
            Version::V2_5 => "2.5",
            Version::V2_5_1 => "2.5.1",
            Version::V2_6 => "2.6",
            Version::V2_7 => "2.7",
            Version::V2_7_1 => "2.7.1",
            Version::V2_8 => "2.8",
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Version> {
        match s {
            "2.1" => Ok(Version::V2_1),
            "2.2" => Ok(Version::V2_2),
            "2.3" => Ok(Version::V2_3),
            "2.3.1" => Ok(Version::V2_3_1),
            "2.4" => Ok(Version::V2_4),
            "2.5" => Ok(Version::V2_5),
            "2.5.1" => Ok(Version::V2_5_1),
            "2.6" => Ok(Version::V2_6),
            "2.7" => Ok(Version::V2_7),
            "2.7.1" => Ok(Version::V2_7_1),
            "2.8" => Ok(Version::V2_8),
            other => Err(Error::Hl7(format!("unsupported HL7 version: {:?}", other))),
        }
    }
}

/// One segment of an HL7 message: a three letter name plus `|` separated
/// fields, with `^` separated components inside a field.
///
/// MSH is special cased per the standard: MSH-1 is the field separator
/// itself and MSH-2 the encoding characters.
#[derive(Clone, Debug, PartialEq)]
pub struct Segment {
    name: String,
    fields: Vec<String>,
}

impl Segment {
    pub fn new(name: &str) -> Segment {
        let fields = if name == "MSH" {
            vec!["|".to_string(), r"^~\&".to_string()]
        } else {
            Vec::new()
        };
        Segment {
            name: name.to_string(),
            fields,
        }
    }

    fn parse(line: &str) -> Result<Segment> {
        let mut parts = line.split('|');
        let name = parts.next().unwrap_or("").to_string();
        if name.len() != 3 {
            return Err(Error::Hl7(format!("invalid segment name: {:?}", name)));
        }
        let mut fields: Vec<String> = parts.map(str::to_string).collect();
        if name == "MSH" {
            // MSH-1 is the separator character itself
            fields.insert(0, "|".to_string());
        }
        Ok(Segment { name, fields })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Field value by 1-based index, empty string when absent.
    pub fn get_field(&self, field: usize) -> String {
        if field == 0 {
            return String::new();
        }
        self.fields.get(field - 1).cloned().unwrap_or_default()
    }

    /// Component value by 1-based field/component indices.
    pub fn get_component(&self, field: usize, component: usize) -> String {
        if component == 0 {
            return String::new();
        }
        self.get_field(field)
            .split('^')
            .nth(component - 1)
            .unwrap_or("")
            .to_string()
    }

    /// Set a field by 1-based index, growing the segment as needed.
    pub fn set_field(&mut self, field: usize, value: &str) {
        if field == 0 {
            return;
        }
        if self.fields.len() < field {
            self.fields.resize(field, String::new());
        }
        self.fields[field - 1] = value.to_string();
    }

    /// Set one component of a field, growing both as needed.
    pub fn set_component(&mut self, field: usize, component: usize, value: &str) {
        if field == 0 || component == 0 {
            return;
        }
        let mut components: Vec<String> = self
            .get_field(field)
            .split('^')
            .map(str::to_string)
            .collect();
        if components.len() < component {
            components.resize(component, String::new());
        }
        components[component - 1] = value.to_string();
        let joined = components.join("^");
        self.set_field(field, &joined);
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name == "MSH" && !self.fields.is_empty() {
            // MSH-1 is the separator, not a field to re-emit
            write!(f, "MSH|{}", self.fields[1..].join("|"))
        } else {
            write!(f, "{}|{}", self.name, self.fields.join("|"))
        }
    }
}

/// Structured header fields used when constructing a message from scratch.
#[derive(Clone, Debug, Default)]
pub struct MessageHeader {
    /// MSH-9-1, the message type.
    pub msh_9_1: String,
    /// MSH-9-2, the trigger event.
    pub msh_9_2: String,
    /// MSH-9-3, the message structure, when present.
    pub msh_9_3: Option<String>,
    /// MSH-10, the control ID.
    pub msh_10: String,
    /// MSH-11-1, the processing ID.
    pub msh_11_1: String,
}

/// A parsed HL7 v2.x message: an MSH segment plus any further segments.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    segments: Vec<Segment>,
}

impl Message {
    /// Parse a message from raw wire text (segments separated by `\r`).
    pub fn parse(text: &str) -> Result<Message> {
        if !text.starts_with("MSH") {
            return Err(Error::Hl7(
                "message text must begin with an MSH segment".to_string(),
            ));
        }
        let mut segments = Vec::new();
        for line in text.split(|c| c == '\r' || c == '\n') {
            if line.trim().is_empty() {
                continue;
            }
            segments.push(Segment::parse(line)?);
        }
        Ok(Message { segments })
    }

    /// Construct a message from structured header fields and a version.
    pub fn new(version: Version, header: MessageHeader) -> Message {
        let mut msh = Segment::new("MSH");
        let mut msh_9 = format!("{}^{}", header.msh_9_1, header.msh_9_2);
        if let Some(msh_9_3) = &header.msh_9_3 {
            msh_9 = format!("{}^{}", msh_9, msh_9_3);
        }
        msh.set_field(9, &msh_9);
        msh.set_field(10, &header.msh_10);
        msh.set_field(11, &header.msh_11_1);
        msh.set_field(12, version.as_str());
        Message {
            segments: vec![msh],
        }
    }

    /// Read a field or component by path, e.g. `"MSH.9.2"`.
    /// Missing segments, fields or components read as the empty string.
    pub fn get(&self, path: &str) -> String {
        match parse_path(path) {
            Some((name, field, component)) => {
                let segment = match self.segments.iter().find(|s| s.name == name) {
                    Some(s) => s,
                    None => return String::new(),
                };
                match component {
                    Some(component) => segment.get_component(field, component),
                    None => segment.get_field(field),
                }
            }
            None => String::new(),
        }
    }

    /// Write a field or component by path on the first matching segment.
    pub fn set(&mut self, path: &str, value: &str) {
        if let Some((name, field, component)) = parse_path(path) {
            if let Some(segment) = self.segments.iter_mut().find(|s| s.name == name) {
                match component {
                    Some(component) => segment.set_component(field, component, value),
                    None => segment.set_field(field, value),
                }
            }
        }
    }

    /// Append a fresh segment and hand it back for population.
    pub fn add_segment(&mut self, name: &str) -> &mut Segment {
        self.segments.push(Segment::new(name));
        let last = self.segments.len() - 1;
        &mut self.segments[last]
    }

    /// The declared protocol version from MSH-12.
    pub fn version(&self) -> Result<Version> {
        self.get("MSH.12").parse()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines: Vec<String> = self.segments.iter().map(|s| s.to_string()).collect();
        f.write_str(&lines.join("\r"))
    }
}

fn parse_path(path: &str) -> Option<(&str, usize, Option<usize>)> {
    let mut parts = path.split('.');
    let name = parts.next()?;
    if name.len() != 3 {
        return None;
    }
    let field: usize = parts.next()?.parse().ok()?;
    let component = match parts.next() {
        Some(c) => Some(c.parse().ok()?),
        None => None,
    };
    Some((name, field, component))
}

/// Whether decoded text is a batch container (leading BHS segment).
pub fn is_batch(text: &str) -> bool {
    text.starts_with("BHS")
}

/// Whether decoded text is a file container (leading FHS segment).
pub fn is_file(text: &str) -> bool {
    text.starts_with("FHS")
}

/// A batch container: a BHS/BTS pair wrapping whole messages.
pub struct Batch {
    text: String,
}

impl Batch {
    pub fn new(text: &str) -> Batch {
        Batch {
            text: text.to_string(),
        }
    }

    /// The raw text of each message inside the batch, in order.
    pub fn messages(&self) -> Vec<String> {
        collect_messages(&self.text)
    }
}

/// A file container: an FHS/FTS pair wrapping one or more batches.
pub struct FileBatch {
    text: String,
}

impl FileBatch {
    pub fn new(text: &str) -> FileBatch {
        FileBatch {
            text: text.to_string(),
        }
    }

    /// The raw text of each BHS/BTS batch inside the file, in order.
    pub fn batches(&self) -> Vec<String> {
        let mut batches = Vec::new();
        let mut current: Option<Vec<&str>> = None;
        for line in non_empty_lines(&self.text) {
            if line.starts_with("BHS") {
                current = Some(vec![line]);
            } else if line.starts_with("BTS") {
                if let Some(mut lines) = current.take() {
                    lines.push(line);
                    batches.push(lines.join("\r"));
                }
            } else if let Some(lines) = current.as_mut() {
                lines.push(line);
            }
        }
        batches
    }

    /// Every message in the file, batch by batch. Files that carry bare
    /// messages without batch wrappers still decompose.
    pub fn messages(&self) -> Vec<String> {
        let batches = self.batches();
        if batches.is_empty() {
            return collect_messages(&self.text);
        }
        batches
            .iter()
            .flat_map(|batch| Batch::new(batch).messages())
            .collect()
    }
}

fn non_empty_lines(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c| c == '\r' || c == '\n')
        .filter(|line| !line.trim().is_empty())
}

fn collect_messages(text: &str) -> Vec<String> {
    let mut messages = Vec::new();
    let mut current: Option<Vec<&str>> = None;
    for line in non_empty_lines(text) {
        if line.starts_with("MSH") {
            if let Some(lines) = current.take() {
                messages.push(lines.join("\r"));
            }
            current = Some(vec![line]);
        } else if line.starts_with("BHS")
            || line.starts_with("BTS")
            || line.starts_with("FHS")
            || line.starts_with("FTS")
        {
            if let Some(lines) = current.take() {
                messages.push(lines.join("\r"));
            }
        } else if let Some(lines) = current.as_mut() {
            lines.push(line);
        }
    }
    if let Some(lines) = current.take() {
        messages.push(lines.join("\r"));
    }
    messages
}

/// A short random alphanumeric token, used for generated control IDs.
pub fn random_string() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect()
}

/// Whether `address` is a valid dotted IPv4 address.
pub fn valid_ipv4(address: &str) -> bool {
    address.parse::<std::net::Ipv4Addr>().is_ok()
}

/// Whether `address` is a valid IPv6 address.
pub fn valid_ipv6(address: &str) -> bool {
    address.parse::<std::net::Ipv6Addr>().is_ok()
}

/// Assert an integer lies inside an inclusive range.
pub fn assert_number(value: u32, name: &str, min: u32, max: u32) -> Result<()> {
    if value < min || value > max {
        return Err(Error::Listener(format!(
            "{} must be a number ({}, {}).",
            name, min, max
        )));
    }
    Ok(())
}
