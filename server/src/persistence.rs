//! XML file holding the active and removed hazards between server runs.
//!
//! ```xml
//! <points version="1">
//!   <poi type="ACCIDENT" latitude="48.8566" longitude="2.3522" date="May 03, 2012 14:22:01.123 UTC">
//!     <confirmations>3</confirmations>
//!     <refutations>1</refutations>
//!     <removedDate>May 04, 2012 08:00:00.000 UTC</removedDate>
//!   </poi>
//! </points>
//! ```
//!
//! A `poi` without `removedDate` is active. Loading is all-or-nothing.

use crate::store::StoreSnapshot;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use log::{debug, info, warn};
use quick_xml::events::attributes::AttrError;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use shared::protocol::format_number;
use shared::{Poi, PoiType, UnknownPoiType};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Version written to and required from the `points` root element
pub const XML_VERSION: u32 = 1;

/// Long-form date layout used inside the file, always English and UTC
pub const FILE_DATE_FORMAT: &str = "%B %d, %Y %H:%M:%S%.3f UTC";

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed XML: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("malformed attribute: {0}")]
    Attribute(#[from] AttrError),
    #[error("no <points> root element")]
    MissingRoot,
    #[error("<points> has no version attribute")]
    MissingVersion,
    #[error("invalid file version! found: {found}, expected: {expected}")]
    VersionMismatch { found: String, expected: u32 },
    #[error("<poi> without `{0}`")]
    MissingField(&'static str),
    #[error(transparent)]
    UnknownType(#[from] UnknownPoiType),
    #[error("invalid {field} value `{value}`")]
    InvalidNumber { field: &'static str, value: String },
    #[error("unparsable date `{0}`")]
    InvalidDate(String),
    #[error("<{0}> is not allowed here")]
    UnexpectedElement(String),
    #[error("document ends before </points>")]
    Truncated,
}

pub fn format_file_date(date: DateTime<Utc>) -> String {
    date.format(FILE_DATE_FORMAT).to_string()
}

pub fn parse_file_date(value: &str) -> Result<DateTime<Utc>, PersistenceError> {
    NaiveDateTime::parse_from_str(value.trim(), FILE_DATE_FORMAT)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .map_err(|_| PersistenceError::InvalidDate(value.to_string()))
}

/// Writes active hazards first, then removed ones.
pub fn save<W: Write>(snapshot: &StoreSnapshot, output: W) -> Result<(), PersistenceError> {
    let mut writer = Writer::new_with_indent(output, b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let version = XML_VERSION.to_string();
    let mut root = BytesStart::new("points");
    root.push_attribute(("version", version.as_str()));
    writer.write_event(Event::Start(root))?;

    for poi in snapshot.active.iter().chain(&snapshot.removed) {
        write_poi(&mut writer, poi)?;
    }

    writer.write_event(Event::End(BytesEnd::new("points")))?;
    writer.into_inner().flush()?;
    Ok(())
}

fn write_poi<W: Write>(writer: &mut Writer<W>, poi: &Poi) -> Result<(), PersistenceError> {
    let latitude = format_number(poi.latitude());
    let longitude = format_number(poi.longitude());
    let date = format_file_date(poi.created_at());

    let mut element = BytesStart::new("poi");
    element.push_attribute(("type", poi.poi_type().name()));
    element.push_attribute(("latitude", latitude.as_str()));
    element.push_attribute(("longitude", longitude.as_str()));
    element.push_attribute(("date", date.as_str()));
    writer.write_event(Event::Start(element))?;

    write_text_element(writer, "confirmations", &poi.confirmations().to_string())?;
    write_text_element(writer, "refutations", &poi.refutations().to_string())?;
    if let Some(removed_at) = poi.removed_at() {
        write_text_element(writer, "removedDate", &format_file_date(removed_at))?;
    }

    writer.write_event(Event::End(BytesEnd::new("poi")))?;
    Ok(())
}

fn write_text_element<W: Write>(
    writer: &mut Writer<W>,
    name: &str,
    text: &str,
) -> Result<(), PersistenceError> {
    writer.write_event(Event::Start(BytesStart::new(name)))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoiChild {
    Confirmations,
    Refutations,
    RemovedDate,
}

impl PoiChild {
    fn from_name(name: &[u8]) -> Option<Self> {
        match name {
            b"confirmations" => Some(PoiChild::Confirmations),
            b"refutations" => Some(PoiChild::Refutations),
            b"removedDate" => Some(PoiChild::RemovedDate),
            _ => None,
        }
    }
}

/// A `poi` element whose children are still being read
struct PendingPoi {
    poi: Poi,
    confirmations: Option<u32>,
    refutations: Option<u32>,
    removed_at: Option<DateTime<Utc>>,
}

impl PendingPoi {
    fn from_element(element: &BytesStart<'_>) -> Result<Self, PersistenceError> {
        let mut poi_type = None;
        let mut latitude = None;
        let mut longitude = None;
        let mut date = None;

        for attribute in element.attributes() {
            let attribute = attribute?;
            let value = attribute.unescape_value()?;
            match attribute.key.as_ref() {
                b"type" => poi_type = Some(value.parse::<PoiType>()?),
                b"latitude" => latitude = Some(parse_coordinate("latitude", &value)?),
                b"longitude" => longitude = Some(parse_coordinate("longitude", &value)?),
                b"date" => date = Some(parse_file_date(&value)?),
                _ => {}
            }
        }

        let poi_type = poi_type.ok_or(PersistenceError::MissingField("type"))?;
        let latitude = latitude.ok_or(PersistenceError::MissingField("latitude"))?;
        let longitude = longitude.ok_or(PersistenceError::MissingField("longitude"))?;
        let date = date.ok_or(PersistenceError::MissingField("date"))?;

        Ok(Self {
            poi: Poi::new(poi_type, latitude, longitude, date),
            confirmations: None,
            refutations: None,
            removed_at: None,
        })
    }

    fn set(&mut self, child: PoiChild, text: &str) -> Result<(), PersistenceError> {
        match child {
            PoiChild::Confirmations => self.confirmations = Some(parse_count("confirmations", text)?),
            PoiChild::Refutations => self.refutations = Some(parse_count("refutations", text)?),
            PoiChild::RemovedDate => self.removed_at = Some(parse_file_date(text)?),
        }
        Ok(())
    }

    fn finish(self) -> Result<Poi, PersistenceError> {
        let confirmations = self
            .confirmations
            .ok_or(PersistenceError::MissingField("confirmations"))?;
        let refutations = self
            .refutations
            .ok_or(PersistenceError::MissingField("refutations"))?;
        let mut poi = self.poi.with_counters(confirmations, refutations);
        if let Some(removed_at) = self.removed_at {
            poi.mark_removed(removed_at);
        }
        Ok(poi)
    }
}

fn parse_coordinate(field: &'static str, value: &str) -> Result<f64, PersistenceError> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| PersistenceError::InvalidNumber {
            field,
            value: value.to_string(),
        })
}

fn parse_count(field: &'static str, value: &str) -> Result<u32, PersistenceError> {
    value
        .trim()
        .parse::<u32>()
        .map_err(|_| PersistenceError::InvalidNumber {
            field,
            value: value.to_string(),
        })
}

/// Reads a whole document. Any error discards everything read so far.
pub fn load<R: BufRead>(input: R) -> Result<StoreSnapshot, PersistenceError> {
    let mut reader = Reader::from_reader(input);
    reader.trim_text(true);

    let mut snapshot = StoreSnapshot::default();
    let mut buf = Vec::new();
    let mut in_root = false;
    let mut seen_root = false;
    let mut current: Option<PendingPoi> = None;
    let mut child: Option<PoiChild> = None;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(element) => {
                open_element(&element, &mut in_root, &mut seen_root, &mut current, &mut child)?;
            }
            Event::Empty(element) => {
                open_element(&element, &mut in_root, &mut seen_root, &mut current, &mut child)?;
                // An empty element is closed right away
                close_element(element.name().as_ref(), &mut in_root, &mut current, &mut child, &mut snapshot)?;
            }
            Event::Text(text) => {
                if let (Some(pending), Some(field)) = (current.as_mut(), child) {
                    pending.set(field, &text.unescape()?)?;
                }
            }
            Event::End(element) => {
                close_element(element.name().as_ref(), &mut in_root, &mut current, &mut child, &mut snapshot)?;
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if in_root || current.is_some() {
        return Err(PersistenceError::Truncated);
    }
    if !seen_root {
        return Err(PersistenceError::MissingRoot);
    }
    Ok(snapshot)
}

fn open_element(
    element: &BytesStart<'_>,
    in_root: &mut bool,
    seen_root: &mut bool,
    current: &mut Option<PendingPoi>,
    child: &mut Option<PoiChild>,
) -> Result<(), PersistenceError> {
    let name = element.name();
    match name.as_ref() {
        b"points" if !*seen_root => {
            check_version(element)?;
            *in_root = true;
            *seen_root = true;
        }
        b"poi" if *in_root && current.is_none() => {
            *current = Some(PendingPoi::from_element(element)?);
        }
        other => {
            if let Some(field) = PoiChild::from_name(other) {
                if current.is_none() || child.is_some() {
                    return Err(unexpected(other));
                }
                *child = Some(field);
            } else if matches!(other, b"points" | b"poi") || !*in_root {
                return Err(unexpected(other));
            } else {
                debug!("Ignoring unknown element <{}>", String::from_utf8_lossy(other));
            }
        }
    }
    Ok(())
}

fn close_element(
    name: &[u8],
    in_root: &mut bool,
    current: &mut Option<PendingPoi>,
    child: &mut Option<PoiChild>,
    snapshot: &mut StoreSnapshot,
) -> Result<(), PersistenceError> {
    if PoiChild::from_name(name).is_some() {
        *child = None;
        return Ok(());
    }
    match name {
        b"poi" => {
            if let Some(pending) = current.take() {
                let poi = pending.finish()?;
                if poi.is_removed() {
                    snapshot.removed.push(poi);
                } else {
                    snapshot.active.push(poi);
                }
            }
        }
        b"points" => *in_root = false,
        _ => {}
    }
    Ok(())
}

fn check_version(element: &BytesStart<'_>) -> Result<(), PersistenceError> {
    for attribute in element.attributes() {
        let attribute = attribute?;
        if attribute.key.as_ref() == b"version" {
            let found = attribute.unescape_value()?;
            if found.trim() != XML_VERSION.to_string() {
                return Err(PersistenceError::VersionMismatch {
                    found: found.into_owned(),
                    expected: XML_VERSION,
                });
            }
            return Ok(());
        }
    }
    Err(PersistenceError::MissingVersion)
}

fn unexpected(name: &[u8]) -> PersistenceError {
    PersistenceError::UnexpectedElement(String::from_utf8_lossy(name).into_owned())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("hazards.xml"));
    name.push(".tmp");
    path.with_file_name(name)
}

/// Saves through a sibling temporary file renamed into place, so a crash
/// mid-write never leaves a truncated file behind.
pub fn save_to_path(snapshot: &StoreSnapshot, path: &Path) -> Result<(), PersistenceError> {
    let temp = temp_path(path);
    let written = File::create(&temp)
        .map_err(PersistenceError::from)
        .and_then(|file| {
            let mut output = BufWriter::new(file);
            save(snapshot, &mut output)?;
            output.flush()?;
            output.get_ref().sync_all()?;
            Ok(())
        });

    if let Err(e) = written {
        if let Err(cleanup) = fs::remove_file(&temp) {
            warn!("Could not remove {}: {}", temp.display(), cleanup);
        }
        return Err(e);
    }

    fs::rename(&temp, path)?;
    info!(
        "Saved {} active and {} removed hazards to {}",
        snapshot.active.len(),
        snapshot.removed.len(),
        path.display()
    );
    Ok(())
}

pub fn load_from_path(path: &Path) -> Result<StoreSnapshot, PersistenceError> {
    let file = File::open(path)?;
    let snapshot = load(BufReader::new(file))?;
    info!(
        "Loaded {} active and {} removed hazards from {}",
        snapshot.active.len(),
        snapshot.removed.len(),
        path.display()
    );
    Ok(snapshot)
}
