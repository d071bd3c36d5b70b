//! YAML decoding of identity documents.
//!
//! A document is decoded twice: once into the strict shape (profile,
//! enrollments, emails) and once into a loosely-typed tree that is kept as the
//! record's side channel for alias extraction.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Deserializer};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime};

use crate::{Profile, RawAffiliation, RosterError, RosterResult, SourceRecord};

#[derive(Deserialize)]
struct DocumentShape {
    #[serde(default)]
    profile: ProfileShape,
    #[serde(default)]
    enrollments: Vec<EnrollmentShape>,
    #[serde(default)]
    email: Vec<String>,
}

#[derive(Default, Deserialize)]
struct ProfileShape {
    #[serde(default)]
    name: Option<String>,
    #[serde(default, alias = "isbot")]
    is_bot: Option<bool>,
}

#[derive(Deserialize)]
struct EnrollmentShape {
    #[serde(default)]
    organization: Option<String>,
    #[serde(default, deserialize_with = "deserialize_date")]
    start: Option<Date>,
    #[serde(default, deserialize_with = "deserialize_date")]
    end: Option<Date>,
}

pub fn parse_document(contents: &str) -> RosterResult<Vec<SourceRecord>> {
    let shapes: Vec<DocumentShape> = serde_yaml::from_str(contents)
        .map_err(|err| RosterError::malformed(format!("identity document: {err}")))?;
    let trees: Vec<serde_yaml::Value> = serde_yaml::from_str(contents)
        .map_err(|err| RosterError::malformed(format!("identity document tree: {err}")))?;
    if shapes.len() != trees.len() {
        return Err(RosterError::malformed(format!(
            "identity document decoded {} records but {} raw entries",
            shapes.len(),
            trees.len()
        )));
    }
    Ok(shapes
        .into_iter()
        .zip(trees)
        .map(|(shape, side_channel)| SourceRecord {
            profile: Profile {
                name: shape.profile.name.unwrap_or_default(),
                is_bot: shape.profile.is_bot,
            },
            emails: shape.email,
            affiliations: shape
                .enrollments
                .into_iter()
                .map(|enrollment| RawAffiliation {
                    organization: enrollment.organization.unwrap_or_default(),
                    start: enrollment.start,
                    end: enrollment.end,
                })
                .collect(),
            side_channel,
        })
        .collect())
}

pub fn read_file(path: &Path) -> RosterResult<Vec<SourceRecord>> {
    let contents = fs::read_to_string(path)
        .map_err(|err| RosterError::malformed(format!("read {}: {err}", path.display())))?;
    parse_document(&contents).map_err(|err| err.context(path.display().to_string()))
}

/// Records of every file, concatenated in argument order.
pub fn read_files<P: AsRef<Path>>(paths: &[P]) -> RosterResult<Vec<SourceRecord>> {
    let mut records = Vec::new();
    for path in paths {
        records.extend(read_file(path.as_ref())?);
    }
    Ok(records)
}

/// Accepts `YYYY-MM-DD`, `YYYY-MM-DD HH:MM:SS` and RFC 3339 timestamps.
pub fn parse_date(value: &str) -> Result<Date, String> {
    let value = value.trim();
    if let Ok(date) = Date::parse(value, format_description!("[year]-[month]-[day]")) {
        return Ok(date);
    }
    if let Ok(datetime) = PrimitiveDateTime::parse(
        value,
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
    ) {
        return Ok(datetime.date());
    }
    OffsetDateTime::parse(value, &Rfc3339)
        .map(OffsetDateTime::date)
        .map_err(|err| format!("invalid date '{value}': {err}"))
}

fn deserialize_date<'de, D>(deserializer: D) -> Result<Option<Date>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(value) if value.trim().is_empty() => Ok(None),
        Some(value) => parse_date(&value).map(Some).map_err(serde::de::Error::custom),
    }
}
